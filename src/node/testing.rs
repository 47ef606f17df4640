//! Scripted transports and nodes for unit tests

use super::types::*;
use super::{ForwardStream, InvoiceStream, LightningNode};
use crate::transport::{Connector, EventStream, RpcMethod, RpcTransport, TransportError};
use crate::{GatewayError, GatewayResult};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

struct Script {
    items: VecDeque<Result<Value, TransportError>>,
    /// Repeat the last item forever instead of hanging once drained
    sticky: bool,
}

/// Transport answering from per-method scripts, keyed by method name
#[derive(Default)]
pub(crate) struct FakeTransport {
    scripts: Mutex<HashMap<String, Script>>,
    streams: Mutex<HashMap<String, VecDeque<Vec<Result<Value, TransportError>>>>>,
    calls: Mutex<Vec<(String, Value)>>,
    closes: AtomicUsize,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Always answer `method` with `value`
    pub fn respond(&self, method: &str, value: Value) {
        self.set(method, vec![Ok(value)], true);
    }

    /// Always fail `method` with `err`
    pub fn fail(&self, method: &str, err: TransportError) {
        self.set(method, vec![Err(err)], true);
    }

    /// Answer `method` with each item once, then never answer again
    pub fn sequence(&self, method: &str, items: Vec<Result<Value, TransportError>>) {
        self.set(method, items, false);
    }

    /// Queue one push stream for `method`
    pub fn push_stream(&self, method: &str, items: Vec<Result<Value, TransportError>>) {
        self.streams
            .lock()
            .unwrap()
            .entry(method.to_string())
            .or_default()
            .push_back(items);
    }

    pub fn call_count(&self, method: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == method)
            .count()
    }

    pub fn last_params(&self, method: &str) -> Option<Value> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(name, _)| name == method)
            .map(|(_, params)| params.clone())
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn set(&self, method: &str, items: Vec<Result<Value, TransportError>>, sticky: bool) {
        self.scripts.lock().unwrap().insert(
            method.to_string(),
            Script {
                items: items.into(),
                sticky,
            },
        );
    }

    fn record(&self, method: &RpcMethod, params: &Value) {
        self.calls
            .lock()
            .unwrap()
            .push((method.name.clone(), params.clone()));
    }

    fn next(&self, method: &str) -> Option<Result<Value, TransportError>> {
        let mut scripts = self.scripts.lock().unwrap();
        let script = scripts.get_mut(method)?;
        if script.sticky && script.items.len() == 1 {
            return script.items.front().cloned();
        }
        script.items.pop_front()
    }
}

#[async_trait]
impl RpcTransport for FakeTransport {
    async fn call(&self, method: &RpcMethod, params: Value) -> Result<Value, TransportError> {
        self.record(method, &params);
        let known = self.scripts.lock().unwrap().contains_key(&method.name);
        match self.next(&method.name) {
            Some(result) => result,
            None if known => std::future::pending().await,
            None => Err(TransportError::Rpc {
                code: -1,
                message: format!("no response scripted for {}", method.name),
            }),
        }
    }

    async fn subscribe(
        &self,
        method: &RpcMethod,
        params: Value,
    ) -> Result<EventStream, TransportError> {
        self.record(method, &params);
        let items = self
            .streams
            .lock()
            .unwrap()
            .get_mut(&method.name)
            .and_then(VecDeque::pop_front);
        match items {
            Some(items) => Ok(futures::stream::iter(items).boxed()),
            None => Ok(futures::stream::pending().boxed()),
        }
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }

    fn describe(&self) -> String {
        "fake".to_string()
    }
}

/// Connector handing out one shared [`FakeTransport`]
pub(crate) struct FakeConnector {
    transport: Arc<FakeTransport>,
    failures: Mutex<VecDeque<TransportError>>,
    connects: AtomicUsize,
}

impl FakeConnector {
    pub fn always(transport: Arc<FakeTransport>) -> Arc<Self> {
        Self::failing_first(transport, Vec::new())
    }

    /// Fail the first connects with `failures`, then succeed
    pub fn failing_first(transport: Arc<FakeTransport>, failures: Vec<TransportError>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            failures: Mutex::new(failures.into()),
            connects: AtomicUsize::new(0),
        })
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self) -> Result<Arc<dyn RpcTransport>, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(self.transport.clone())
    }

    fn describe(&self) -> String {
        "fake".to_string()
    }
}

/// Password [`FakeNode::unlock_wallet`] accepts
pub(crate) const FAKE_PASSWORD: &str = "hunter2";

/// Node whose probe outcomes and data are scripted
pub(crate) struct FakeNode {
    probes: Mutex<VecDeque<GatewayResult<NodeInfo>>>,
    steady: Mutex<GatewayResult<NodeInfo>>,
    probe_count: AtomicUsize,
    balance: Mutex<WalletBalance>,
    balance_calls: AtomicUsize,
    info_calls: AtomicUsize,
    invoice_streams: Mutex<VecDeque<Vec<GatewayResult<Invoice>>>>,
    forward_streams: Mutex<VecDeque<Vec<GatewayResult<ForwardSuccessEvent>>>>,
    invoice_listens: AtomicUsize,
}

impl FakeNode {
    /// Ready on the first probe
    pub fn ready() -> Arc<Self> {
        Self::with_probes(Vec::new(), Ok(NodeInfo::default()))
    }

    /// Probes answer from `script`, then `steady` forever
    pub fn with_probes(
        script: Vec<GatewayResult<NodeInfo>>,
        steady: GatewayResult<NodeInfo>,
    ) -> Arc<Self> {
        Arc::new(Self {
            probes: Mutex::new(script.into()),
            steady: Mutex::new(steady),
            probe_count: AtomicUsize::new(0),
            balance: Mutex::new(WalletBalance::default()),
            balance_calls: AtomicUsize::new(0),
            info_calls: AtomicUsize::new(0),
            invoice_streams: Mutex::new(VecDeque::new()),
            forward_streams: Mutex::new(VecDeque::new()),
            invoice_listens: AtomicUsize::new(0),
        })
    }

    pub fn set_balance(&self, balance: WalletBalance) {
        *self.balance.lock().unwrap() = balance;
    }

    pub fn probe_count(&self) -> usize {
        self.probe_count.load(Ordering::SeqCst)
    }

    pub fn balance_calls(&self) -> usize {
        self.balance_calls.load(Ordering::SeqCst)
    }

    pub fn info_calls(&self) -> usize {
        self.info_calls.load(Ordering::SeqCst)
    }

    pub fn invoice_listens(&self) -> usize {
        self.invoice_listens.load(Ordering::SeqCst)
    }

    /// Next `listen_invoices` yields `items`, then stays open
    pub fn push_invoices(&self, items: Vec<GatewayResult<Invoice>>) {
        self.invoice_streams.lock().unwrap().push_back(items);
    }

    /// Next `listen_forward_events` yields `items`, then stays open
    pub fn push_forwards(&self, items: Vec<GatewayResult<ForwardSuccessEvent>>) {
        self.forward_streams.lock().unwrap().push_back(items);
    }
}

fn unsupported<T>() -> GatewayResult<T> {
    Err(GatewayError::Unsupported("not scripted".to_string()))
}

#[async_trait]
impl LightningNode for FakeNode {
    fn get_implementation_name(&self) -> &'static str {
        "FAKE"
    }

    async fn probe(&self, _timeout: std::time::Duration) -> GatewayResult<NodeInfo> {
        self.probe_count.fetch_add(1, Ordering::SeqCst);
        if let Some(result) = self.probes.lock().unwrap().pop_front() {
            return result;
        }
        self.steady.lock().unwrap().clone()
    }

    async fn get_node_info(&self) -> GatewayResult<NodeInfo> {
        self.info_calls.fetch_add(1, Ordering::SeqCst);
        Ok(NodeInfo {
            implementation: "FAKE".to_string(),
            ..NodeInfo::default()
        })
    }

    async fn get_wallet_balance(&self) -> GatewayResult<WalletBalance> {
        self.balance_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.balance.lock().unwrap().clone())
    }

    async fn list_invoices(&self, _: ListQuery, _: InvoiceFilter) -> GatewayResult<Vec<Invoice>> {
        Ok(Vec::new())
    }

    async fn list_payments(&self, _: ListQuery, _: PaymentFilter) -> GatewayResult<Vec<Payment>> {
        Ok(Vec::new())
    }

    async fn list_on_chain_tx(&self, _: ListQuery) -> GatewayResult<Vec<OnChainTransaction>> {
        Ok(Vec::new())
    }

    async fn add_invoice(&self, _: NewInvoice) -> GatewayResult<Invoice> {
        unsupported()
    }

    async fn decode_pay_request(&self, _: &str) -> GatewayResult<PaymentRequest> {
        unsupported()
    }

    async fn send_payment(&self, _: SendPayment) -> GatewayResult<Payment> {
        unsupported()
    }

    async fn send_coins(&self, _: SendCoins) -> GatewayResult<SendCoinsResult> {
        unsupported()
    }

    async fn get_fee_revenue(&self) -> GatewayResult<FeeRevenue> {
        Ok(FeeRevenue::default())
    }

    async fn unlock_wallet(&self, password: &str) -> GatewayResult<bool> {
        if password != FAKE_PASSWORD {
            return Ok(false);
        }
        self.probes
            .lock()
            .unwrap()
            .push_front(Err(GatewayError::Bootstrapping("finishing boot".to_string())));
        *self.steady.lock().unwrap() = Ok(NodeInfo::default());
        Ok(true)
    }

    async fn listen_invoices(&self) -> GatewayResult<InvoiceStream> {
        self.invoice_listens.fetch_add(1, Ordering::SeqCst);
        let items = self.invoice_streams.lock().unwrap().pop_front().unwrap_or_default();
        Ok(futures::stream::iter(items)
            .chain(futures::stream::pending())
            .boxed())
    }

    async fn listen_forward_events(&self) -> GatewayResult<ForwardStream> {
        let items = self.forward_streams.lock().unwrap().pop_front().unwrap_or_default();
        Ok(futures::stream::iter(items)
            .chain(futures::stream::pending())
            .boxed())
    }

    async fn channel_open(&self, _: OpenChannel) -> GatewayResult<String> {
        unsupported()
    }

    async fn channel_list(&self) -> GatewayResult<Vec<Channel>> {
        Ok(Vec::new())
    }

    async fn channel_close(&self, _: &str, _: bool) -> GatewayResult<String> {
        unsupported()
    }

    async fn peer_resolve_alias(&self, _: &str) -> GatewayResult<String> {
        Ok(String::new())
    }
}

/// Invoice fixture
pub(crate) fn invoice(add_index: &str, state: InvoiceState) -> Invoice {
    Invoice {
        add_index: add_index.to_string(),
        payment_request: format!("lnbcrt{}", add_index),
        payment_hash: format!("hash{}", add_index),
        memo: String::new(),
        value_msat: 1_000,
        amt_paid_msat: if state == InvoiceState::Settled { 1_000 } else { 0 },
        state,
        creation_date: 0,
        settle_date: None,
        expiry: 3600,
        settle_index: None,
        is_keysend: false,
    }
}
