//! Core Lightning adapter
//!
//! The same JSON-RPC method set is reachable over the `lightning-rpc` unix
//! socket and over `clnrest`; only the transport differs. Core Lightning has
//! no wallet locking and no forward subscription, so forwards are polled.

use super::forwards::{fee_revenue, ForwardListDiff};
use super::json::*;
use super::types::*;
use super::{
    check_payment_amount, listener_channel, probe_timeout, AdapterCache, ForwardStream,
    InvoiceStream, LightningNode,
};
use crate::transport::{Connector, RpcMethod, SharedTransport, TransportError};
use crate::{GatewayError, GatewayResult};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Delay before retrying a failed `waitanyinvoice`
const WAIT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// `pay` failures that still produced a payment attempt
const PAY_FAILURE_CODES: [i64; 5] = [203, 205, 206, 209, 210];

/// Map a Core Lightning transport error onto a gateway error kind
pub(crate) fn classify(err: TransportError) -> GatewayError {
    match err {
        TransportError::Connect(msg) => GatewayError::Unavailable(msg),
        TransportError::Closed => GatewayError::Unavailable("transport closed".to_string()),
        TransportError::Timeout(d) => GatewayError::Timeout(format!("no answer within {:?}", d)),
        TransportError::Unsupported(what) => GatewayError::Unsupported(what),
        TransportError::Decode(msg) => {
            error!("Undecodable Core Lightning response: {}", msg);
            GatewayError::Internal("unexpected response from lightning node".to_string())
        }
        TransportError::Rpc { code, message } => classify_rpc(code, message),
    }
}

fn classify_rpc(code: i64, message: String) -> GatewayError {
    let lower = message.to_lowercase();
    match code {
        200 | 201 | 900 | 901 => GatewayError::Conflict(message),
        207 | 302 | -32602 => GatewayError::InvalidRequest(message),
        300 | 301 => GatewayError::InsufficientFunds(message),
        401 | 904 => GatewayError::Timeout(message),
        400 | 905 => GatewayError::NotFound(message),
        -32601 => GatewayError::Unsupported(message),
        _ if lower.contains("afford") || lower.contains("insufficient") => {
            GatewayError::InsufficientFunds(message)
        }
        _ if lower.contains("still syncing") || lower.contains("starting up") => {
            GatewayError::Bootstrapping(message)
        }
        _ if lower.contains("invalid") || lower.contains("bad bech32") => {
            GatewayError::InvalidRequest(message)
        }
        _ if lower.contains("unknown command") => GatewayError::Unsupported(message),
        _ if lower.contains("not found") || lower.contains("unknown peer") => {
            GatewayError::NotFound(message)
        }
        _ => {
            error!("Unclassified Core Lightning error (code {}): {}", code, message);
            GatewayError::Internal("lightning node returned an error".to_string())
        }
    }
}

fn invoice_from(v: &Value) -> Invoice {
    let state = match v.get("status").and_then(Value::as_str) {
        Some("paid") => InvoiceState::Settled,
        Some("expired") => InvoiceState::Canceled,
        _ => InvoiceState::Open,
    };
    // listinvoices has no creation time; assume the default expiry was used.
    let expires_at = i64_at(v, "expires_at");
    let creation_date = match i64_at(v, "created_at") {
        0 => expires_at - DEFAULT_INVOICE_EXPIRY as i64,
        ts => ts,
    };
    Invoice {
        add_index: str_at(v, "label"),
        payment_request: str_at(v, "bolt11"),
        payment_hash: str_at(v, "payment_hash"),
        memo: str_at(v, "description"),
        value_msat: u64_at(v, "amount_msat"),
        amt_paid_msat: u64_at(v, "amount_received_msat"),
        state,
        creation_date,
        settle_date: opt_u64_at(v, "paid_at").map(|t| t as i64),
        expiry: (expires_at - creation_date).max(0) as u64,
        settle_index: opt_u64_at(v, "pay_index"),
        is_keysend: false,
    }
}

fn payment_from(v: &Value) -> Payment {
    let status = match v.get("status").and_then(Value::as_str) {
        Some("complete") => PaymentStatus::Succeeded,
        Some("failed") => PaymentStatus::Failed,
        Some("pending") => PaymentStatus::InFlight,
        _ => PaymentStatus::Unknown,
    };
    let value_msat = u64_at(v, "amount_msat");
    let sent_msat = u64_at(v, "amount_sent_msat");
    Payment {
        payment_hash: str_at(v, "payment_hash"),
        payment_preimage: opt_str_at(v, "preimage").or_else(|| opt_str_at(v, "payment_preimage")),
        payment_request: opt_str_at(v, "bolt11"),
        value_msat,
        fee_msat: sent_msat.saturating_sub(value_msat),
        status,
        creation_date: i64_at(v, "created_at"),
        failure_reason: None,
        htlcs: Vec::new(),
    }
}

fn pay_req_from(v: &Value) -> PaymentRequest {
    PaymentRequest {
        destination: str_at(v, "payee"),
        payment_hash: str_at(v, "payment_hash"),
        num_msat: opt_u64_at(v, "amount_msat").filter(|n| *n > 0),
        timestamp: i64_at(v, "created_at"),
        expiry: u64_at(v, "expiry"),
        description: str_at(v, "description"),
        description_hash: opt_str_at(v, "description_hash"),
        fallback_addr: array_at(v, "fallbacks")
            .first()
            .and_then(|f| opt_str_at(f, "addr")),
        cltv_expiry: u64_at(v, "min_final_cltv_expiry"),
    }
}

fn node_info_from(v: &Value, implementation: &str) -> NodeInfo {
    let pubkey = str_at(v, "id");
    let uris = array_at(v, "address")
        .iter()
        .map(|a| format!("{}@{}:{}", pubkey, str_at(a, "address"), u64_at(a, "port")))
        .collect();
    NodeInfo {
        implementation: implementation.to_string(),
        version: str_at(v, "version"),
        alias: str_at(v, "alias"),
        color: format!("#{}", str_at(v, "color")),
        num_pending_channels: u32_at(v, "num_pending_channels"),
        num_active_channels: u32_at(v, "num_active_channels"),
        num_inactive_channels: u32_at(v, "num_inactive_channels"),
        num_peers: u32_at(v, "num_peers"),
        block_height: u32_at(v, "blockheight"),
        block_hash: String::new(),
        synced_to_chain: v.get("warning_bitcoind_sync").is_none(),
        synced_to_graph: v.get("warning_lightningd_sync").is_none(),
        network: str_at(v, "network"),
        identity_pubkey: pubkey,
        uris,
    }
}

fn forward_from(v: &Value) -> ForwardSuccessEvent {
    let secs_to_ns = |key: &str| {
        v.get(key)
            .and_then(Value::as_f64)
            .map(|t| (t * 1e9) as u64)
            .unwrap_or_default()
    };
    let amt_in_msat = u64_at(v, "in_msat");
    let amt_out_msat = u64_at(v, "out_msat");
    ForwardSuccessEvent {
        timestamp_ns: secs_to_ns("received_time"),
        settled_ns: secs_to_ns("resolved_time"),
        chan_id_in: str_at(v, "in_channel"),
        chan_id_out: str_at(v, "out_channel"),
        amt_in_msat,
        amt_out_msat,
        fee_msat: match opt_u64_at(v, "fee_msat") {
            Some(fee) => fee,
            None => amt_in_msat.saturating_sub(amt_out_msat),
        },
    }
}

fn channel_state(state: &str) -> ChannelState {
    match state {
        "OPENINGD" | "CHANNELD_AWAITING_LOCKIN" | "DUALOPEND_OPEN_INIT"
        | "DUALOPEND_AWAITING_LOCKIN" | "DUALOPEND_OPEN_COMMITTED" => ChannelState::Opening,
        "CHANNELD_NORMAL" => ChannelState::Normal,
        "CHANNELD_SHUTTING_DOWN" | "CLOSINGD_SIGEXCHANGE" | "CLOSINGD_COMPLETE" => {
            ChannelState::Closing
        }
        "AWAITING_UNILATERAL" | "FUNDING_SPEND_SEEN" => ChannelState::ForceClosing,
        "ONCHAIN" | "CLOSED" => ChannelState::Closed,
        _ => ChannelState::Unknown,
    }
}

fn side(value: Option<&str>) -> Initiator {
    match value {
        Some("local") => Initiator::Local,
        Some("remote") => Initiator::Remote,
        _ => Initiator::Unknown,
    }
}

/// Fee rate argument for `withdraw` and `fundchannel`
fn feerate(target_conf: Option<u32>, sat_per_vbyte: Option<u64>) -> GatewayResult<Option<String>> {
    let rate = match (sat_per_vbyte, target_conf) {
        (Some(rate), _) => {
            let per_kb = rate.checked_mul(1000).ok_or_else(|| {
                GatewayError::InvalidRequest(format!("fee rate {} sat/vbyte is too large", rate))
            })?;
            Some(format!("{}perkb", per_kb))
        }
        (None, Some(t)) if t <= 2 => Some("urgent".to_string()),
        (None, Some(t)) if t <= 6 => Some("normal".to_string()),
        (None, Some(_)) => Some("slow".to_string()),
        (None, None) => None,
    };
    Ok(rate)
}

/// Fold bookkeeper wallet events into one entry per transaction
fn onchain_from_events(events: &[Value], tip: u32) -> Vec<OnChainTransaction> {
    let mut by_txid: BTreeMap<String, OnChainTransaction> = BTreeMap::new();

    for event in events {
        if str_at(event, "account") != "wallet" || str_at(event, "type") != "chain" {
            continue;
        }
        let txid = match opt_str_at(event, "txid") {
            Some(txid) => txid,
            None => str_at(event, "outpoint")
                .split(':')
                .next()
                .unwrap_or_default()
                .to_string(),
        };
        let height = u32_at(event, "blockheight");
        let entry = by_txid
            .entry(txid.clone())
            .or_insert_with(|| OnChainTransaction {
                tx_hash: txid,
                amount: 0,
                num_confirmations: if height > 0 {
                    tip.saturating_sub(height) + 1
                } else {
                    0
                },
                block_height: height,
                time_stamp: i64_at(event, "timestamp"),
                total_fees: 0,
                dest_addresses: Vec::new(),
                label: String::new(),
            });
        let credit = (u64_at(event, "credit_msat") / 1000) as i64;
        let debit = (u64_at(event, "debit_msat") / 1000) as i64;
        entry.amount += credit - debit;
    }

    let mut txs: Vec<OnChainTransaction> = by_txid.into_values().collect();
    txs.sort_by_key(|t| t.time_stamp);
    txs
}

/// Core Lightning backend adapter
pub struct ClnNode {
    transport: SharedTransport,
    cache: AdapterCache,
    implementation: &'static str,
    forward_poll_interval: Duration,
}

impl ClnNode {
    /// Adapter over the `lightning-rpc` unix socket
    pub fn unix_socket(connector: Arc<dyn Connector>, forward_poll_interval: Duration) -> Self {
        Self::new(connector, "CLN_UNIX_SOCKET", forward_poll_interval)
    }

    /// Adapter over `clnrest`
    pub fn rest(connector: Arc<dyn Connector>, forward_poll_interval: Duration) -> Self {
        Self::new(connector, "CLN_REST", forward_poll_interval)
    }

    fn new(
        connector: Arc<dyn Connector>,
        implementation: &'static str,
        forward_poll_interval: Duration,
    ) -> Self {
        Self {
            transport: SharedTransport::new(connector),
            cache: AdapterCache::new(),
            implementation,
            forward_poll_interval,
        }
    }

    async fn rpc(&self, method: &str, params: Value) -> GatewayResult<Value> {
        self.transport
            .call(&RpcMethod::named(method), params)
            .await
            .map_err(classify)
    }

    async fn settled_forwards(&self) -> GatewayResult<Vec<Value>> {
        let response = self
            .rpc("listforwards", json!({ "status": "settled" }))
            .await?;
        Ok(array_at(&response, "forwards").to_vec())
    }

    async fn last_pay_index(&self) -> GatewayResult<u64> {
        let response = self.rpc("listinvoices", json!({})).await?;
        Ok(array_at(&response, "invoices")
            .iter()
            .filter_map(|i| opt_u64_at(i, "pay_index"))
            .max()
            .unwrap_or(0))
    }
}

#[async_trait]
impl LightningNode for ClnNode {
    fn get_implementation_name(&self) -> &'static str {
        self.implementation
    }

    async fn probe(&self, timeout: Duration) -> GatewayResult<NodeInfo> {
        let transport = tokio::time::timeout(timeout, self.transport.fresh())
            .await
            .map_err(|_| probe_timeout(timeout))?
            .map_err(classify)?;
        let result =
            tokio::time::timeout(timeout, transport.call(&RpcMethod::named("getinfo"), json!({})))
                .await;
        transport.close().await;
        match result {
            Ok(response) => response
                .map(|v| node_info_from(&v, self.implementation))
                .map_err(classify),
            Err(_) => Err(probe_timeout(timeout)),
        }
    }

    async fn get_node_info(&self) -> GatewayResult<NodeInfo> {
        let response = self.rpc("getinfo", json!({})).await?;
        Ok(node_info_from(&response, self.implementation))
    }

    async fn get_wallet_balance(&self) -> GatewayResult<WalletBalance> {
        let funds = self.rpc("listfunds", json!({})).await?;
        let mut balance = WalletBalance::default();

        for output in array_at(&funds, "outputs") {
            let sat = u64_at(output, "amount_msat") / 1000;
            match output.get("status").and_then(Value::as_str) {
                Some("confirmed") => balance.onchain_confirmed_balance += sat,
                Some("unconfirmed") => balance.onchain_unconfirmed_balance += sat,
                _ => continue,
            }
            balance.onchain_total_balance += sat;
        }

        for channel in array_at(&funds, "channels") {
            let ours = u64_at(channel, "our_amount_msat");
            let theirs = u64_at(channel, "amount_msat").saturating_sub(ours);
            match channel_state(&str_at(channel, "state")) {
                ChannelState::Normal => {
                    balance.channel_local_balance += ours;
                    balance.channel_remote_balance += theirs;
                }
                ChannelState::Opening => {
                    balance.channel_pending_open_local_balance += ours;
                    balance.channel_pending_open_remote_balance += theirs;
                }
                _ => {}
            }
        }

        Ok(balance)
    }

    async fn list_invoices(
        &self,
        query: ListQuery,
        filter: InvoiceFilter,
    ) -> GatewayResult<Vec<Invoice>> {
        let response = self.rpc("listinvoices", json!({})).await?;
        let mut invoices: Vec<Invoice> = array_at(&response, "invoices")
            .iter()
            .map(invoice_from)
            .filter(|i| !filter.pending_only || i.state == InvoiceState::Open)
            .collect();
        invoices.sort_by_key(|i| i.creation_date);
        Ok(query.apply(invoices))
    }

    async fn list_payments(
        &self,
        query: ListQuery,
        filter: PaymentFilter,
    ) -> GatewayResult<Vec<Payment>> {
        let response = self.rpc("listpays", json!({})).await?;
        let mut payments: Vec<Payment> = array_at(&response, "pays")
            .iter()
            .map(payment_from)
            .filter(|p| filter.include_incomplete || p.status == PaymentStatus::Succeeded)
            .collect();
        payments.sort_by_key(|p| p.creation_date);
        Ok(query.apply(payments))
    }

    async fn list_on_chain_tx(&self, query: ListQuery) -> GatewayResult<Vec<OnChainTransaction>> {
        let tip = u32_at(&self.rpc("getinfo", json!({})).await?, "blockheight");
        let response = self.rpc("bkpr-listaccountevents", json!({})).await?;
        Ok(query.apply(onchain_from_events(array_at(&response, "events"), tip)))
    }

    async fn add_invoice(&self, req: NewInvoice) -> GatewayResult<Invoice> {
        let now = chrono::Utc::now();
        let label = format!("ln-gateway-{}", now.timestamp_nanos_opt().unwrap_or_default());
        let amount = match req.value_msat {
            0 => json!("any"),
            msat => json!(msat),
        };

        let response = self
            .rpc(
                "invoice",
                json!({
                    "amount_msat": amount,
                    "label": label,
                    "description": req.memo,
                    "expiry": req.expiry,
                }),
            )
            .await?;

        info!("Created invoice {} ({})", str_at(&response, "payment_hash"), label);
        Ok(Invoice {
            add_index: label,
            payment_request: str_at(&response, "bolt11"),
            payment_hash: str_at(&response, "payment_hash"),
            memo: req.memo,
            value_msat: req.value_msat,
            amt_paid_msat: 0,
            state: InvoiceState::Open,
            creation_date: now.timestamp(),
            settle_date: None,
            expiry: req.expiry,
            settle_index: None,
            is_keysend: req.is_keysend,
        })
    }

    async fn decode_pay_request(&self, pay_req: &str) -> GatewayResult<PaymentRequest> {
        let pay_req = pay_req.trim();
        if let Some(decoded) = self.cache.decoded(pay_req).await {
            return Ok(decoded);
        }
        if pay_req.is_empty() {
            return Err(GatewayError::InvalidRequest("empty payment request".to_string()));
        }

        let response = self.rpc("decodepay", json!({ "bolt11": pay_req })).await?;
        let decoded = pay_req_from(&response);
        self.cache.store_decoded(pay_req, decoded.clone()).await;
        Ok(decoded)
    }

    async fn send_payment(&self, req: SendPayment) -> GatewayResult<Payment> {
        let decoded = self.decode_pay_request(&req.pay_req).await?;
        check_payment_amount(&decoded, req.amount_msat)?;

        let mut params = json!({
            "bolt11": req.pay_req.trim(),
            "retry_for": req.timeout_seconds,
        });
        if let Some(amount) = req.amount_msat {
            params["amount_msat"] = json!(amount);
        }
        if let Some(fee) = req.fee_limit_msat {
            params["maxfee"] = json!(fee);
        }

        info!("Paying {} (timeout {}s)", decoded.payment_hash, req.timeout_seconds);
        let method = RpcMethod::named("pay").long_poll();
        match self.transport.call(&method, params).await {
            Ok(v) => {
                let mut payment = payment_from(&v);
                payment.payment_request = Some(req.pay_req.trim().to_string());
                info!("Payment {} finished: {:?}", payment.payment_hash, payment.status);
                Ok(payment)
            }
            Err(TransportError::Rpc { code, message }) if PAY_FAILURE_CODES.contains(&code) => {
                warn!("Payment {} failed ({}): {}", decoded.payment_hash, code, message);
                Ok(Payment {
                    payment_hash: decoded.payment_hash,
                    payment_preimage: None,
                    payment_request: Some(req.pay_req.trim().to_string()),
                    value_msat: req.amount_msat.or(decoded.num_msat).unwrap_or_default(),
                    fee_msat: 0,
                    status: PaymentStatus::Failed,
                    creation_date: chrono::Utc::now().timestamp(),
                    failure_reason: Some(message),
                    htlcs: Vec::new(),
                })
            }
            Err(e) => Err(classify(e)),
        }
    }

    async fn send_coins(&self, req: SendCoins) -> GatewayResult<SendCoinsResult> {
        req.validate()?;

        let satoshi = match req.amount {
            Some(amount) if !req.send_all => json!(amount),
            _ => json!("all"),
        };
        let mut params = json!({
            "destination": req.address,
            "satoshi": satoshi,
            "minconf": req.min_confs,
        });
        if let Some(rate) = feerate(req.target_conf, req.sat_per_vbyte)? {
            params["feerate"] = json!(rate);
        }

        let response = self.rpc("withdraw", params).await?;
        let txid = str_at(&response, "txid");
        info!("On-chain send broadcast: txid={}", txid);

        Ok(SendCoinsResult {
            txid,
            address: req.address,
            amount: req.amount,
            label: req.label,
        })
    }

    async fn get_fee_revenue(&self) -> GatewayResult<FeeRevenue> {
        let forwards = self.settled_forwards().await?;
        let now = chrono::Utc::now().timestamp();
        Ok(fee_revenue(
            forwards.iter().map(|f| {
                let resolved = f
                    .get("resolved_time")
                    .and_then(Value::as_f64)
                    .unwrap_or_default() as i64;
                (resolved, u64_at(f, "fee_msat"))
            }),
            now,
        ))
    }

    async fn unlock_wallet(&self, _password: &str) -> GatewayResult<bool> {
        debug!("Core Lightning has no wallet lock; unlock is a no-op");
        Ok(true)
    }

    async fn listen_invoices(&self) -> GatewayResult<InvoiceStream> {
        let mut lastpay_index = self.last_pay_index().await?;
        let transport = self.transport.clone();
        let (tx, rx) = listener_channel();

        tokio::spawn(async move {
            info!("Listening for Core Lightning invoices after pay_index={}", lastpay_index);
            let method = RpcMethod::named("waitanyinvoice").long_poll();
            loop {
                let call = transport.call(&method, json!({ "lastpay_index": lastpay_index }));
                let result = tokio::select! {
                    result = call => result,
                    _ = tx.closed() => return,
                };

                match result.map_err(classify) {
                    Ok(v) => {
                        let invoice = invoice_from(&v);
                        if let Some(idx) = invoice.settle_index {
                            lastpay_index = lastpay_index.max(idx);
                        }
                        if tx.send(Ok(invoice)).await.is_err() {
                            return;
                        }
                    }
                    Err(e) if e.is_unrecoverable() => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                    Err(e) => {
                        warn!("waitanyinvoice failed, retrying: {}", e);
                        tokio::select! {
                            _ = tokio::time::sleep(WAIT_RETRY_DELAY) => {}
                            _ = tx.closed() => return,
                        }
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn listen_forward_events(&self) -> GatewayResult<ForwardStream> {
        let mut diff = ForwardListDiff::new();
        diff.diff(self.settled_forwards().await?);

        let transport = self.transport.clone();
        let interval = self.forward_poll_interval;
        let (tx, rx) = listener_channel();

        tokio::spawn(async move {
            info!("Polling Core Lightning forwards every {:?}", interval);
            let method = RpcMethod::named("listforwards");
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = tx.closed() => return,
                }

                let forwards = match transport
                    .call(&method, json!({ "status": "settled" }))
                    .await
                    .map_err(classify)
                {
                    Ok(v) => array_at(&v, "forwards").to_vec(),
                    Err(e) if e.is_unrecoverable() => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                    Err(e) => {
                        warn!("listforwards failed, retrying: {}", e);
                        continue;
                    }
                };

                for forward in diff.diff(forwards) {
                    if tx.send(Ok(forward_from(&forward))).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn channel_open(&self, req: OpenChannel) -> GatewayResult<String> {
        let (pubkey, host) = req.peer()?;

        info!(
            "Opening channel: peer={}@{}, amount={} sat, push={} sat",
            pubkey, host, req.local_funding_amount, req.push_amount
        );

        self.rpc("connect", json!({ "id": req.node_uri })).await?;

        let mut params = json!({
            "id": pubkey,
            "amount": req.local_funding_amount,
            "announce": !req.private,
        });
        if req.push_amount > 0 {
            let push_msat = req.push_amount.checked_mul(1000).ok_or_else(|| {
                GatewayError::InvalidRequest("push amount is too large".to_string())
            })?;
            params["push_msat"] = json!(push_msat);
        }
        if let Some(rate) = feerate(None, req.sat_per_vbyte)? {
            params["feerate"] = json!(rate);
        }

        let response = self.rpc("fundchannel", params).await?;
        let channel_id = str_at(&response, "channel_id");
        info!("Channel open initiated: {} (txid {})", channel_id, str_at(&response, "txid"));
        Ok(channel_id)
    }

    async fn channel_list(&self) -> GatewayResult<Vec<Channel>> {
        let response = self.rpc("listpeerchannels", json!({})).await?;
        let mut channels = Vec::new();

        for c in array_at(&response, "channels") {
            let peer = str_at(c, "peer_id");
            let state = channel_state(&str_at(c, "state"));
            let alias = match self.peer_resolve_alias(&peer).await {
                Ok(alias) => alias,
                Err(e) => {
                    debug!("No alias for {}: {}", peer, e);
                    String::new()
                }
            };
            let total = u64_at(c, "total_msat") / 1000;
            let local = u64_at(c, "to_us_msat") / 1000;
            channels.push(Channel {
                channel_id: str_at(c, "channel_id"),
                active: state == ChannelState::Normal && bool_at(c, "peer_connected"),
                peer_publickey: peer,
                peer_alias: alias,
                balance_local: local,
                balance_remote: total.saturating_sub(local),
                balance_capacity: total,
                state,
                initiator: side(c.get("opener").and_then(Value::as_str)),
                closer: c.get("closer").and_then(Value::as_str).map(|s| side(Some(s))),
            });
        }

        Ok(channels)
    }

    async fn channel_close(&self, channel_id: &str, force: bool) -> GatewayResult<String> {
        if channel_id.trim().is_empty() {
            return Err(GatewayError::InvalidRequest("channel id is required".to_string()));
        }
        info!("Closing channel {} (force={})", channel_id, force);

        let mut params = json!({ "id": channel_id });
        if force {
            params["unilateraltimeout"] = json!(1);
        }
        let response = self
            .transport
            .call(&RpcMethod::named("close").long_poll(), params)
            .await
            .map_err(classify)?;
        let txid = str_at(&response, "txid");
        info!("Channel {} closing ({}) in {}", channel_id, str_at(&response, "type"), txid);
        Ok(txid)
    }

    async fn peer_resolve_alias(&self, node_pub: &str) -> GatewayResult<String> {
        if let Some(alias) = self.cache.alias(node_pub).await {
            return Ok(alias);
        }

        let response = self.rpc("listnodes", json!({ "id": node_pub })).await?;
        let node = array_at(&response, "nodes")
            .first()
            .ok_or_else(|| GatewayError::NotFound(format!("unknown node {}", node_pub)))?;
        let alias = str_at(node, "alias");
        self.cache.store_alias(node_pub, alias.clone()).await;
        Ok(alias)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::testing::{FakeConnector, FakeTransport};
    use crate::ErrorKind;

    const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
    use futures::StreamExt;

    fn node_with(transport: Arc<FakeTransport>) -> ClnNode {
        ClnNode::unix_socket(FakeConnector::always(transport), Duration::from_secs(30))
    }

    fn rpc(code: i64, message: &str) -> TransportError {
        TransportError::Rpc {
            code,
            message: message.to_string(),
        }
    }

    #[test]
    fn test_classify_cln_codes() {
        let cases = [
            (rpc(201, "already paid"), ErrorKind::Conflict),
            (rpc(900, "Duplicate label"), ErrorKind::Conflict),
            (rpc(207, "Invoice expired"), ErrorKind::InvalidRequest),
            (rpc(-32602, "bolt11: Bad bech32 string"), ErrorKind::InvalidRequest),
            (rpc(301, "Cannot afford transaction"), ErrorKind::InsufficientFunds),
            (rpc(-1, "Could not afford 100000sat using all 2 available UTXOs"), ErrorKind::InsufficientFunds),
            (rpc(904, "Timed out"), ErrorKind::Timeout),
            (rpc(905, "Unknown invoice"), ErrorKind::NotFound),
            (rpc(-32601, "Unknown command 'bkpr-listaccountevents'"), ErrorKind::Unsupported),
            (rpc(-1, "weird"), ErrorKind::Internal),
            (TransportError::Connect("no socket".into()), ErrorKind::Unavailable),
        ];
        for (err, kind) in cases {
            assert_eq!(classify(err.clone()).kind(), kind, "{:?}", err);
        }
    }

    #[test]
    fn test_implementation_names() {
        let unix = node_with(FakeTransport::new());
        assert_eq!(unix.get_implementation_name(), "CLN_UNIX_SOCKET");
        let rest = ClnNode::rest(
            FakeConnector::always(FakeTransport::new()),
            Duration::from_secs(30),
        );
        assert_eq!(rest.get_implementation_name(), "CLN_REST");
    }

    #[test]
    fn test_feerate_mapping() {
        let rate = |t, s| feerate(t, s).unwrap();
        assert_eq!(rate(Some(1), None).as_deref(), Some("urgent"));
        assert_eq!(rate(Some(6), None).as_deref(), Some("normal"));
        assert_eq!(rate(Some(144), None).as_deref(), Some("slow"));
        assert_eq!(rate(Some(1), Some(5)).as_deref(), Some("5000perkb"));
        assert_eq!(rate(None, None), None);

        let err = feerate(None, Some(u64::MAX)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn test_probe_closes_fresh_handle() {
        let transport = FakeTransport::new();
        transport.respond(
            "getinfo",
            json!({"id": "02aa", "blockheight": 120, "network": "regtest", "color": "ff0000",
                   "address": [{"type": "ipv4", "address": "10.0.0.1", "port": 9735}]}),
        );
        let node = node_with(transport.clone());
        let info = node.probe(PROBE_TIMEOUT).await.unwrap();
        assert_eq!(info.implementation, "CLN_UNIX_SOCKET");
        assert_eq!(info.color, "#ff0000");
        assert_eq!(info.uris, vec!["02aa@10.0.0.1:9735".to_string()]);
        assert_eq!(transport.closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_timeout_still_closes_handle() {
        let transport = FakeTransport::new();
        transport.sequence("getinfo", Vec::new());
        let node = node_with(transport.clone());

        let err = node.probe(Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unavailable);
        assert!(err.to_string().contains("timed out"));
        assert_eq!(transport.closes(), 1);
    }

    #[tokio::test]
    async fn test_wallet_balance_from_listfunds() {
        let transport = FakeTransport::new();
        transport.respond(
            "listfunds",
            json!({
                "outputs": [
                    {"amount_msat": 5_000_000, "status": "confirmed"},
                    {"amount_msat": 2_000_000, "status": "unconfirmed"},
                    {"amount_msat": 9_000_000, "status": "spent"}
                ],
                "channels": [
                    {"our_amount_msat": 400_000, "amount_msat": 1_000_000, "state": "CHANNELD_NORMAL"},
                    {"our_amount_msat": 50_000, "amount_msat": 50_000, "state": "CHANNELD_AWAITING_LOCKIN"}
                ]
            }),
        );
        let balance = node_with(transport).get_wallet_balance().await.unwrap();
        assert_eq!(balance.onchain_confirmed_balance, 5_000);
        assert_eq!(balance.onchain_unconfirmed_balance, 2_000);
        assert_eq!(balance.onchain_total_balance, 7_000);
        assert_eq!(balance.channel_local_balance, 400_000);
        assert_eq!(balance.channel_remote_balance, 600_000);
        assert_eq!(balance.channel_pending_open_local_balance, 50_000);
    }

    #[tokio::test]
    async fn test_invoice_creation_date_falls_back_to_expiry() {
        let transport = FakeTransport::new();
        transport.respond(
            "listinvoices",
            json!({"invoices": [
                {"label": "b", "status": "paid", "expires_at": 2_000_000, "pay_index": 2},
                {"label": "a", "status": "unpaid", "expires_at": 1_000_000}
            ]}),
        );
        let invoices = node_with(transport)
            .list_invoices(ListQuery::all(), InvoiceFilter::default())
            .await
            .unwrap();
        assert_eq!(invoices[0].add_index, "a");
        assert_eq!(invoices[0].creation_date, 1_000_000 - DEFAULT_INVOICE_EXPIRY as i64);
        assert_eq!(invoices[1].state, InvoiceState::Settled);
        assert_eq!(invoices[1].settle_index, Some(2));
    }

    #[tokio::test]
    async fn test_pay_failure_code_is_a_failed_payment() {
        let transport = FakeTransport::new();
        transport.respond(
            "decodepay",
            json!({"payee": "02bb", "payment_hash": "dd", "amount_msat": 1_000}),
        );
        transport.fail("pay", rpc(205, "Could not find a route"));
        let payment = node_with(transport)
            .send_payment(SendPayment {
                pay_req: "lnbcrt1x".to_string(),
                timeout_seconds: 10,
                fee_limit_msat: None,
                amount_msat: None,
            })
            .await
            .unwrap();
        assert_eq!(payment.status, PaymentStatus::Failed);
        assert_eq!(payment.payment_hash, "dd");
        assert_eq!(payment.value_msat, 1_000);
    }

    #[tokio::test]
    async fn test_pay_other_error_propagates() {
        let transport = FakeTransport::new();
        transport.respond(
            "decodepay",
            json!({"payee": "02bb", "payment_hash": "ee", "amount_msat": 1_000}),
        );
        transport.fail("pay", rpc(201, "Already paid"));
        let err = node_with(transport)
            .send_payment(SendPayment {
                pay_req: "lnbcrt1y".to_string(),
                timeout_seconds: 10,
                fee_limit_msat: None,
                amount_msat: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_withdraw_all() {
        let transport = FakeTransport::new();
        transport.respond("withdraw", json!({"txid": "ab12", "tx": "00"}));
        let result = node_with(transport.clone())
            .send_coins(SendCoins {
                address: "bcrt1qdest".to_string(),
                amount: None,
                send_all: true,
                target_conf: Some(3),
                sat_per_vbyte: None,
                min_confs: 1,
                label: String::new(),
            })
            .await
            .unwrap();
        assert_eq!(result.txid, "ab12");
        let params = transport.last_params("withdraw").unwrap();
        assert_eq!(params["satoshi"], "all");
        assert_eq!(params["feerate"], "normal");
    }

    #[tokio::test]
    async fn test_withdraw_rejects_overflowing_fee_rate() {
        let transport = FakeTransport::new();
        transport.respond("withdraw", json!({"txid": "ab12", "tx": "00"}));
        let err = node_with(transport.clone())
            .send_coins(SendCoins {
                address: "bcrt1qdest".to_string(),
                amount: Some(10_000),
                send_all: false,
                target_conf: None,
                sat_per_vbyte: Some(u64::MAX),
                min_confs: 1,
                label: String::new(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
        assert_eq!(transport.call_count("withdraw"), 0);
    }

    #[tokio::test]
    async fn test_listen_invoices_tracks_pay_index() {
        let transport = FakeTransport::new();
        transport.respond(
            "listinvoices",
            json!({"invoices": [{"label": "x", "status": "paid", "pay_index": 4}]}),
        );
        transport.sequence(
            "waitanyinvoice",
            vec![
                Ok(json!({"label": "y", "status": "paid", "pay_index": 5})),
                Ok(json!({"label": "z", "status": "paid", "pay_index": 6})),
            ],
        );
        let node = node_with(transport.clone());
        let mut stream = node.listen_invoices().await.unwrap();

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.add_index, "y");
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.settle_index, Some(6));

        // Third call waits after the newest index.
        tokio::task::yield_now().await;
        let params = transport.last_params("waitanyinvoice").unwrap();
        assert!(params["lastpay_index"] == 5 || params["lastpay_index"] == 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forward_polling_emits_new_entries_only() {
        let transport = FakeTransport::new();
        let fwd = |n: u64| {
            json!({"in_channel": "1x1x0", "out_channel": "2x2x0", "in_msat": 1_000 + n,
                   "out_msat": 1_000, "fee_msat": n, "received_time": 1.5, "resolved_time": 2.0,
                   "status": "settled"})
        };
        transport.sequence(
            "listforwards",
            vec![
                Ok(json!({"forwards": [fwd(1)]})),
                Ok(json!({"forwards": [fwd(1)]})),
                Ok(json!({"forwards": [fwd(1), fwd(2), fwd(3)]})),
            ],
        );
        let node = node_with(transport);
        let mut stream = node.listen_forward_events().await.unwrap();

        let a = stream.next().await.unwrap().unwrap();
        let b = stream.next().await.unwrap().unwrap();
        assert_eq!(a.fee_msat, 2);
        assert_eq!(b.fee_msat, 3);
        assert_eq!(a.timestamp_ns, 1_500_000_000);
        assert_eq!(a.settled_ns, 2_000_000_000);
    }

    #[tokio::test]
    async fn test_unlock_is_noop() {
        assert!(node_with(FakeTransport::new()).unlock_wallet("x").await.unwrap());
    }

    #[test]
    fn test_onchain_events_fold_by_txid() {
        let events = vec![
            json!({"account": "wallet", "type": "chain", "tag": "deposit", "outpoint": "aa:0",
                   "credit_msat": 5_000_000, "debit_msat": 0, "timestamp": 10, "blockheight": 100}),
            json!({"account": "wallet", "type": "chain", "tag": "withdrawal", "outpoint": "aa:0",
                   "txid": "bb", "credit_msat": 0, "debit_msat": 5_000_000, "timestamp": 20, "blockheight": 0}),
            json!({"account": "wallet", "type": "chain", "tag": "deposit", "outpoint": "bb:1",
                   "credit_msat": 3_000_000, "debit_msat": 0, "timestamp": 20, "blockheight": 0}),
            json!({"account": "abcd", "type": "chain", "tag": "channel_open", "outpoint": "bb:0",
                   "credit_msat": 1_000_000, "debit_msat": 0, "timestamp": 20, "blockheight": 0}),
        ];
        let txs = onchain_from_events(&events, 104);
        assert_eq!(txs.len(), 2);
        assert_eq!(txs[0].tx_hash, "aa");
        assert_eq!(txs[0].amount, 5_000);
        assert_eq!(txs[0].num_confirmations, 5);
        assert_eq!(txs[1].tx_hash, "bb");
        assert_eq!(txs[1].amount, -2_000);
        assert_eq!(txs[1].num_confirmations, 0);
    }
}
