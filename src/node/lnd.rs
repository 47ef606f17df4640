//! LND adapter over the REST proxy
//!
//! LND encodes 64-bit integers as strings and binary fields as base64. Its
//! wallet may be locked, in which case only the unlocker service answers.

use super::forwards::{fee_revenue, ForwardCorrelator, HtlcEvent, HtlcEventKind, HtlcKey};
use super::json::*;
use super::types::*;
use super::{
    check_payment_amount, listener_channel, probe_timeout, AdapterCache, ForwardStream,
    InvoiceStream, LightningNode,
};
use crate::transport::{Connector, RpcMethod, SharedTransport, TransportError};
use crate::{GatewayError, GatewayResult};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const IMPLEMENTATION: &str = "LND_REST";

/// Delay before resubscribing after a push stream broke
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(2);

/// Page size when walking the forwarding history
const FORWARDING_PAGE: u64 = 10_000;

/// Effectively "no limit" for LND list calls
const LIST_ALL: u64 = 100_000_000;

/// Map an LND transport error onto a gateway error kind
pub(crate) fn classify(err: TransportError) -> GatewayError {
    match err {
        TransportError::Connect(msg) => GatewayError::Unavailable(msg),
        TransportError::Closed => GatewayError::Unavailable("transport closed".to_string()),
        TransportError::Timeout(d) => GatewayError::Timeout(format!("no answer within {:?}", d)),
        TransportError::Unsupported(what) => GatewayError::Unsupported(what),
        TransportError::Decode(msg) => {
            error!("Undecodable LND response: {}", msg);
            GatewayError::Internal("unexpected response from lightning node".to_string())
        }
        TransportError::Rpc { code, message } => classify_rpc(code, message),
    }
}

fn classify_rpc(code: i64, message: String) -> GatewayError {
    let lower = message.to_lowercase();
    let has = |needle: &str| lower.contains(needle);

    if has("wallet locked") || has("unlock it to enable") || has("wallet not unlocked") {
        GatewayError::Locked(message)
    } else if has("in the process of starting")
        || has("not yet ready")
        || has("waiting to start")
        || has("server is still")
        || has("rpc services not available")
    {
        GatewayError::Bootstrapping(message)
    } else if has("insufficient") || has("not enough") || has("exceeds balance") {
        GatewayError::InsufficientFunds(message)
    } else if has("already paid") || has("already exists") || has("already unlocked") {
        GatewayError::Conflict(message)
    } else if has("deadline exceeded") || has("i/o timeout") || has("timed out") {
        GatewayError::Timeout(message)
    } else if has("unable to find")
        || has("not found")
        || has("no such")
        || has("unknown channel")
        || code == 5
    {
        GatewayError::NotFound(message)
    } else if has("unknown service") || has("unimplemented") || code == 12 {
        GatewayError::Unsupported(message)
    } else if has("invalid")
        || has("checksum")
        || has("unable to decode")
        || has("malformed")
        || has("bech32")
        || code == 3
    {
        GatewayError::InvalidRequest(message)
    } else {
        error!("Unclassified LND error (code {}): {}", code, message);
        GatewayError::Internal("lightning node returned an error".to_string())
    }
}

/// base64 -> hex, for hashes and preimages
fn b64_to_hex(value: &str) -> String {
    BASE64
        .decode(value)
        .map(hex::encode)
        .unwrap_or_else(|_| value.to_string())
}

/// LND reports funding txids as little-endian base64 bytes
fn txid_from_b64(value: &str) -> String {
    match BASE64.decode(value) {
        Ok(mut bytes) => {
            bytes.reverse();
            hex::encode(bytes)
        }
        Err(_) => value.to_string(),
    }
}

fn invoice_from(v: &Value) -> Invoice {
    let state = match v.get("state").and_then(Value::as_str) {
        Some("SETTLED") => InvoiceState::Settled,
        Some("CANCELED") => InvoiceState::Canceled,
        Some("ACCEPTED") => InvoiceState::Accepted,
        _ if bool_at(v, "settled") => InvoiceState::Settled,
        _ => InvoiceState::Open,
    };
    let settle_date = match i64_at(v, "settle_date") {
        0 => None,
        ts => Some(ts),
    };
    Invoice {
        add_index: u64_at(v, "add_index").to_string(),
        payment_request: str_at(v, "payment_request"),
        payment_hash: b64_to_hex(&str_at(v, "r_hash")),
        memo: str_at(v, "memo"),
        value_msat: u64_at(v, "value_msat"),
        amt_paid_msat: u64_at(v, "amt_paid_msat"),
        state,
        creation_date: i64_at(v, "creation_date"),
        settle_date,
        expiry: u64_at(v, "expiry"),
        settle_index: opt_u64_at(v, "settle_index").filter(|i| *i > 0),
        is_keysend: bool_at(v, "is_keysend"),
    }
}

fn payment_status(v: &Value) -> PaymentStatus {
    match v.get("status").and_then(Value::as_str) {
        Some("SUCCEEDED") => PaymentStatus::Succeeded,
        Some("FAILED") => PaymentStatus::Failed,
        Some("IN_FLIGHT") | Some("INITIATED") => PaymentStatus::InFlight,
        _ => PaymentStatus::Unknown,
    }
}

fn payment_from(v: &Value) -> Payment {
    let htlcs = array_at(v, "htlcs")
        .iter()
        .map(|h| {
            let route = h.get("route").cloned().unwrap_or(Value::Null);
            HtlcAttempt {
                status: str_at(h, "status"),
                amount_msat: u64_at(&route, "total_amt_msat"),
                fee_msat: u64_at(&route, "total_fees_msat"),
                hops: array_at(&route, "hops").len() as u32,
                attempt_time: (u64_at(h, "attempt_time_ns") / 1_000_000_000) as i64,
                resolve_time: opt_u64_at(h, "resolve_time_ns")
                    .filter(|t| *t > 0)
                    .map(|t| (t / 1_000_000_000) as i64),
            }
        })
        .collect();

    let creation_date = match u64_at(v, "creation_time_ns") {
        0 => i64_at(v, "creation_date"),
        ns => (ns / 1_000_000_000) as i64,
    };

    Payment {
        payment_hash: str_at(v, "payment_hash"),
        payment_preimage: opt_str_at(v, "payment_preimage")
            .filter(|p| p.chars().any(|c| c != '0')),
        payment_request: opt_str_at(v, "payment_request"),
        value_msat: u64_at(v, "value_msat"),
        fee_msat: u64_at(v, "fee_msat"),
        status: payment_status(v),
        creation_date,
        failure_reason: opt_str_at(v, "failure_reason").filter(|r| r != "FAILURE_REASON_NONE"),
        htlcs,
    }
}

fn onchain_from(v: &Value) -> OnChainTransaction {
    OnChainTransaction {
        tx_hash: str_at(v, "tx_hash"),
        amount: i64_at(v, "amount"),
        num_confirmations: u32_at(v, "num_confirmations"),
        block_height: u32_at(v, "block_height"),
        time_stamp: i64_at(v, "time_stamp"),
        total_fees: u64_at(v, "total_fees"),
        dest_addresses: array_at(v, "dest_addresses")
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        label: str_at(v, "label"),
    }
}

fn pay_req_from(v: &Value) -> PaymentRequest {
    let num_msat = match u64_at(v, "num_msat") {
        0 => None,
        n => Some(n),
    };
    PaymentRequest {
        destination: str_at(v, "destination"),
        payment_hash: str_at(v, "payment_hash"),
        num_msat,
        timestamp: i64_at(v, "timestamp"),
        expiry: u64_at(v, "expiry"),
        description: str_at(v, "description"),
        description_hash: opt_str_at(v, "description_hash"),
        fallback_addr: opt_str_at(v, "fallback_addr"),
        cltv_expiry: u64_at(v, "cltv_expiry"),
    }
}

fn node_info_from(v: &Value) -> NodeInfo {
    let network = array_at(v, "chains")
        .first()
        .map(|c| str_at(c, "network"))
        .unwrap_or_default();
    NodeInfo {
        implementation: IMPLEMENTATION.to_string(),
        version: str_at(v, "version"),
        identity_pubkey: str_at(v, "identity_pubkey"),
        alias: str_at(v, "alias"),
        color: str_at(v, "color"),
        num_pending_channels: u32_at(v, "num_pending_channels"),
        num_active_channels: u32_at(v, "num_active_channels"),
        num_inactive_channels: u32_at(v, "num_inactive_channels"),
        num_peers: u32_at(v, "num_peers"),
        block_height: u32_at(v, "block_height"),
        block_hash: str_at(v, "block_hash"),
        synced_to_chain: bool_at(v, "synced_to_chain"),
        synced_to_graph: bool_at(v, "synced_to_graph"),
        network,
        uris: array_at(v, "uris")
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
    }
}

/// Parse one `v2/router/htlcevents` message; only forwards are relevant
fn htlc_event_from(v: &Value) -> Option<HtlcEvent> {
    if v.get("event_type").and_then(Value::as_str) != Some("FORWARD") {
        return None;
    }

    let kind = if let Some(forward) = v.get("forward_event") {
        let info = forward.get("info").cloned().unwrap_or(Value::Null);
        HtlcEventKind::Forward {
            amt_in_msat: u64_at(&info, "incoming_amt_msat"),
            amt_out_msat: u64_at(&info, "outgoing_amt_msat"),
        }
    } else if v.get("settle_event").is_some() {
        HtlcEventKind::Settle
    } else if v.get("forward_fail_event").is_some() || v.get("link_fail_event").is_some() {
        HtlcEventKind::Fail
    } else {
        return None;
    };

    Some(HtlcEvent {
        key: HtlcKey {
            chan_id_in: u64_at(v, "incoming_channel_id").to_string(),
            htlc_id_in: u64_at(v, "incoming_htlc_id"),
        },
        chan_id_out: u64_at(v, "outgoing_channel_id").to_string(),
        timestamp_ns: u64_at(v, "timestamp_ns"),
        kind,
    })
}

fn channel_point(channel_id: &str) -> GatewayResult<(&str, u32)> {
    let (txid, index) = channel_id.split_once(':').ok_or_else(|| {
        GatewayError::InvalidRequest(format!(
            "channel id must be funding_txid:output_index, got {}",
            channel_id
        ))
    })?;
    let index = index.parse().map_err(|_| {
        GatewayError::InvalidRequest(format!("invalid output index in {}", channel_id))
    })?;
    if txid.len() != 64 || hex::decode(txid).is_err() {
        return Err(GatewayError::InvalidRequest(format!(
            "invalid funding txid in {}",
            channel_id
        )));
    }
    Ok((txid, index))
}

fn initiator_from(v: &Value) -> Initiator {
    match v.get("initiator") {
        Some(Value::Bool(true)) => Initiator::Local,
        Some(Value::Bool(false)) => Initiator::Remote,
        Some(Value::String(s)) if s == "INITIATOR_LOCAL" => Initiator::Local,
        Some(Value::String(s)) if s == "INITIATOR_REMOTE" => Initiator::Remote,
        _ => Initiator::Unknown,
    }
}

/// LND backend adapter
pub struct LndNode {
    transport: SharedTransport,
    cache: AdapterCache,
}

impl LndNode {
    /// Adapter over `connector`; connects lazily
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            transport: SharedTransport::new(connector),
            cache: AdapterCache::new(),
        }
    }

    async fn get(&self, path: &str, params: Value) -> GatewayResult<Value> {
        self.transport
            .call(&RpcMethod::get(path), params)
            .await
            .map_err(classify)
    }

    async fn post(&self, path: &str, body: Value) -> GatewayResult<Value> {
        self.transport
            .call(&RpcMethod::post(path), body)
            .await
            .map_err(classify)
    }

    async fn list_all_invoices(&self) -> GatewayResult<Vec<Invoice>> {
        let response = self
            .get(
                "v1/invoices",
                json!({ "num_max_invoices": LIST_ALL, "reversed": false }),
            )
            .await?;
        Ok(array_at(&response, "invoices").iter().map(invoice_from).collect())
    }

    async fn channels_of(&self, path: &str, key: &str) -> GatewayResult<Vec<Value>> {
        let response = self.get(path, Value::Null).await?;
        Ok(array_at(&response, key).to_vec())
    }

    async fn pending_channel(&self, entry: &Value, state: ChannelState) -> Channel {
        let c = entry.get("channel").cloned().unwrap_or(Value::Null);
        let peer = str_at(&c, "remote_node_pub");
        let closer = match state {
            ChannelState::Closing | ChannelState::ForceClosing => Some(Initiator::Unknown),
            _ => None,
        };
        Channel {
            channel_id: str_at(&c, "channel_point"),
            active: false,
            peer_alias: self.alias_or_empty(&peer).await,
            peer_publickey: peer,
            balance_local: u64_at(&c, "local_balance"),
            balance_remote: u64_at(&c, "remote_balance"),
            balance_capacity: u64_at(&c, "capacity"),
            state,
            initiator: initiator_from(&c),
            closer,
        }
    }

    async fn alias_or_empty(&self, pubkey: &str) -> String {
        match self.peer_resolve_alias(pubkey).await {
            Ok(alias) => alias,
            Err(e) => {
                debug!("No alias for {}: {}", pubkey, e);
                String::new()
            }
        }
    }
}

#[async_trait]
impl LightningNode for LndNode {
    fn get_implementation_name(&self) -> &'static str {
        IMPLEMENTATION
    }

    async fn probe(&self, timeout: Duration) -> GatewayResult<NodeInfo> {
        let transport = tokio::time::timeout(timeout, self.transport.fresh())
            .await
            .map_err(|_| probe_timeout(timeout))?
            .map_err(classify)?;
        let result =
            tokio::time::timeout(timeout, transport.call(&RpcMethod::get("v1/getinfo"), Value::Null))
                .await;
        transport.close().await;
        match result {
            Ok(response) => response.map(|v| node_info_from(&v)).map_err(classify),
            Err(_) => Err(probe_timeout(timeout)),
        }
    }

    async fn get_node_info(&self) -> GatewayResult<NodeInfo> {
        let response = self.get("v1/getinfo", Value::Null).await?;
        Ok(node_info_from(&response))
    }

    async fn get_wallet_balance(&self) -> GatewayResult<WalletBalance> {
        let onchain = self.get("v1/balance/blockchain", Value::Null).await?;
        let channels = self.get("v1/balance/channels", Value::Null).await?;
        let msat = |key: &str| {
            channels
                .get(key)
                .map(|b| u64_at(b, "msat"))
                .unwrap_or_default()
        };

        Ok(WalletBalance {
            onchain_confirmed_balance: u64_at(&onchain, "confirmed_balance"),
            onchain_unconfirmed_balance: u64_at(&onchain, "unconfirmed_balance"),
            onchain_total_balance: u64_at(&onchain, "total_balance"),
            channel_local_balance: msat("local_balance"),
            channel_remote_balance: msat("remote_balance"),
            channel_pending_open_local_balance: msat("pending_open_local_balance"),
            channel_pending_open_remote_balance: msat("pending_open_remote_balance"),
        })
    }

    async fn list_invoices(
        &self,
        query: ListQuery,
        filter: InvoiceFilter,
    ) -> GatewayResult<Vec<Invoice>> {
        let response = self
            .get(
                "v1/invoices",
                json!({
                    "num_max_invoices": LIST_ALL,
                    "pending_only": filter.pending_only,
                }),
            )
            .await?;
        let mut invoices: Vec<Invoice> =
            array_at(&response, "invoices").iter().map(invoice_from).collect();
        invoices.sort_by_key(|i| i.creation_date);
        Ok(query.apply(invoices))
    }

    async fn list_payments(
        &self,
        query: ListQuery,
        filter: PaymentFilter,
    ) -> GatewayResult<Vec<Payment>> {
        let response = self
            .get(
                "v1/payments",
                json!({
                    "max_payments": LIST_ALL,
                    "include_incomplete": filter.include_incomplete,
                }),
            )
            .await?;
        let mut payments: Vec<Payment> =
            array_at(&response, "payments").iter().map(payment_from).collect();
        payments.sort_by_key(|p| p.creation_date);
        Ok(query.apply(payments))
    }

    async fn list_on_chain_tx(&self, query: ListQuery) -> GatewayResult<Vec<OnChainTransaction>> {
        let response = self.get("v1/transactions", Value::Null).await?;
        let mut txs: Vec<OnChainTransaction> =
            array_at(&response, "transactions").iter().map(onchain_from).collect();
        txs.sort_by_key(|t| t.time_stamp);
        Ok(query.apply(txs))
    }

    async fn add_invoice(&self, req: NewInvoice) -> GatewayResult<Invoice> {
        let response = self
            .post(
                "v1/invoices",
                json!({
                    "memo": req.memo,
                    "value_msat": req.value_msat.to_string(),
                    "expiry": req.expiry.to_string(),
                    "is_amp": req.is_keysend,
                }),
            )
            .await?;

        let r_hash = b64_to_hex(&str_at(&response, "r_hash"));
        info!("Created invoice {} (add_index={})", r_hash, u64_at(&response, "add_index"));

        let created = self.get(&format!("v1/invoice/{}", r_hash), Value::Null).await?;
        Ok(invoice_from(&created))
    }

    async fn decode_pay_request(&self, pay_req: &str) -> GatewayResult<PaymentRequest> {
        let pay_req = pay_req.trim();
        if let Some(decoded) = self.cache.decoded(pay_req).await {
            return Ok(decoded);
        }
        if pay_req.is_empty() {
            return Err(GatewayError::InvalidRequest("empty payment request".to_string()));
        }

        let response = self.get(&format!("v1/payreq/{}", pay_req), Value::Null).await?;
        let decoded = pay_req_from(&response);
        self.cache.store_decoded(pay_req, decoded.clone()).await;
        Ok(decoded)
    }

    async fn send_payment(&self, req: SendPayment) -> GatewayResult<Payment> {
        let decoded = self.decode_pay_request(&req.pay_req).await?;
        check_payment_amount(&decoded, req.amount_msat)?;

        let amount = req.amount_msat.or(decoded.num_msat).unwrap_or_default();
        // Without an explicit limit LND would only consider zero-fee routes.
        let fee_limit = req
            .fee_limit_msat
            .unwrap_or_else(|| (amount / 100).max(10_000));

        info!(
            "Paying {} ({} msat, fee limit {} msat, timeout {}s)",
            decoded.payment_hash, amount, fee_limit, req.timeout_seconds
        );

        let mut body = json!({
            "payment_request": req.pay_req.trim(),
            "timeout_seconds": req.timeout_seconds,
            "fee_limit_msat": fee_limit.to_string(),
            "no_inflight_updates": true,
        });
        if let Some(amt) = req.amount_msat {
            body["amt_msat"] = json!(amt.to_string());
        }

        let mut updates = self
            .transport
            .subscribe(&RpcMethod::post("v2/router/send").long_poll(), body)
            .await
            .map_err(classify)?;

        let mut last = None;
        while let Some(update) = updates.next().await {
            let payment = payment_from(&update.map_err(classify)?);
            match payment.status {
                PaymentStatus::Succeeded | PaymentStatus::Failed => {
                    info!("Payment {} finished: {:?}", payment.payment_hash, payment.status);
                    return Ok(payment);
                }
                _ => last = Some(payment),
            }
        }

        last.ok_or_else(|| {
            error!("Payment stream for {} ended without an update", decoded.payment_hash);
            GatewayError::Internal("payment status unknown".to_string())
        })
    }

    async fn send_coins(&self, req: SendCoins) -> GatewayResult<SendCoinsResult> {
        req.validate()?;

        let mut body = json!({
            "addr": req.address,
            "send_all": req.send_all,
            "min_confs": req.min_confs,
            "spend_unconfirmed": req.min_confs == 0,
            "label": req.label,
        });
        if let Some(amount) = req.amount {
            body["amount"] = json!(amount.to_string());
        }
        match (req.sat_per_vbyte, req.target_conf) {
            (Some(rate), _) => body["sat_per_vbyte"] = json!(rate.to_string()),
            (None, Some(target)) => body["target_conf"] = json!(target),
            (None, None) => {}
        }

        let response = self.post("v1/transactions", body).await?;
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
        let now = chrono::Utc::now().timestamp();
        let mut forwards = Vec::new();
        let mut offset = 0u64;

        loop {
            let response = self
                .post(
                    "v1/switch",
                    json!({
                        "start_time": "1",
                        "end_time": now.to_string(),
                        "index_offset": offset,
                        "num_max_events": FORWARDING_PAGE,
                    }),
                )
                .await?;
            let events = array_at(&response, "forwarding_events");
            if events.is_empty() {
                break;
            }
            forwards.extend(
                events
                    .iter()
                    .map(|e| (i64_at(e, "timestamp"), u64_at(e, "fee_msat"))),
            );
            let next = u64_at(&response, "last_offset_index");
            if next <= offset || (events.len() as u64) < FORWARDING_PAGE {
                break;
            }
            offset = next;
        }

        Ok(fee_revenue(forwards, now))
    }

    async fn unlock_wallet(&self, password: &str) -> GatewayResult<bool> {
        let body = json!({ "wallet_password": BASE64.encode(password.as_bytes()) });
        match self.post("v1/unlockwallet", body).await {
            Ok(_) => {
                info!("LND wallet unlocked");
                Ok(true)
            }
            Err(GatewayError::InvalidRequest(msg)) if msg.contains("passphrase") => {
                warn!("LND rejected the wallet password");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn listen_invoices(&self) -> GatewayResult<InvoiceStream> {
        // Intentional re-scan: resume after the highest settle index we can see.
        let mut settle_index = self
            .list_all_invoices()
            .await?
            .iter()
            .filter_map(|i| i.settle_index)
            .max()
            .unwrap_or(0);

        let method = RpcMethod::get("v1/invoices/subscribe").long_poll();
        let mut stream = self
            .transport
            .subscribe(&method, json!({ "settle_index": settle_index }))
            .await
            .map_err(classify)?;

        let transport = self.transport.clone();
        let (tx, rx) = listener_channel();

        tokio::spawn(async move {
            info!("Listening for LND invoices after settle_index={}", settle_index);
            loop {
                while let Some(item) = stream.next().await {
                    let result = match item {
                        Ok(v) => {
                            let invoice = invoice_from(&v);
                            if let Some(idx) = invoice.settle_index {
                                settle_index = settle_index.max(idx);
                            }
                            Ok(invoice)
                        }
                        Err(e) => {
                            let e = classify(e);
                            if !e.is_unrecoverable() {
                                warn!("Invoice stream error, resubscribing: {}", e);
                                break;
                            }
                            Err(e)
                        }
                    };
                    let stop = result.is_err();
                    if tx.send(result).await.is_err() || stop {
                        return;
                    }
                }

                tokio::select! {
                    _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
                    _ = tx.closed() => return,
                }

                match transport
                    .subscribe(&method, json!({ "settle_index": settle_index }))
                    .await
                    .map_err(classify)
                {
                    Ok(s) => stream = s,
                    Err(e) if e.is_unrecoverable() => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                    Err(e) => {
                        warn!("Invoice resubscribe failed, retrying: {}", e);
                        stream = futures::stream::empty().boxed();
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn listen_forward_events(&self) -> GatewayResult<ForwardStream> {
        let method = RpcMethod::get("v2/router/htlcevents").long_poll();
        let mut stream = self
            .transport
            .subscribe(&method, Value::Null)
            .await
            .map_err(classify)?;

        let transport = self.transport.clone();
        let (tx, rx) = listener_channel();

        tokio::spawn(async move {
            info!("Listening for LND HTLC forward events");
            let mut correlator = ForwardCorrelator::new();
            loop {
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(v) => {
                            let Some(event) = htlc_event_from(&v) else {
                                continue;
                            };
                            if let Some(success) = correlator.observe(event) {
                                debug!(
                                    "Forward settled: {} -> {} fee={} msat ({} pending)",
                                    success.chan_id_in,
                                    success.chan_id_out,
                                    success.fee_msat,
                                    correlator.pending_len()
                                );
                                if tx.send(Ok(success)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            let e = classify(e);
                            if e.is_unrecoverable() {
                                let _ = tx.send(Err(e)).await;
                                return;
                            }
                            warn!("HTLC event stream error, resubscribing: {}", e);
                            break;
                        }
                    }
                }

                tokio::select! {
                    _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
                    _ = tx.closed() => return,
                }

                match transport.subscribe(&method, Value::Null).await.map_err(classify) {
                    Ok(s) => stream = s,
                    Err(e) if e.is_unrecoverable() => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                    Err(e) => {
                        warn!("HTLC event resubscribe failed, retrying: {}", e);
                        stream = futures::stream::empty().boxed();
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

        match self
            .post(
                "v1/peers",
                json!({ "addr": { "pubkey": pubkey, "host": host }, "perm": false, "timeout": "30" }),
            )
            .await
        {
            Ok(_) => debug!("Connected to peer {}", pubkey),
            Err(GatewayError::Conflict(_)) => debug!("Already connected to peer {}", pubkey),
            Err(e) => return Err(e),
        }

        let pubkey_bytes = hex::decode(pubkey)
            .map_err(|_| GatewayError::InvalidRequest(format!("invalid public key {}", pubkey)))?;
        let mut body = json!({
            "node_pubkey": BASE64.encode(pubkey_bytes),
            "local_funding_amount": req.local_funding_amount.to_string(),
            "push_sat": req.push_amount.to_string(),
            "private": req.private,
        });
        if let Some(rate) = req.sat_per_vbyte {
            body["sat_per_vbyte"] = json!(rate.to_string());
        }

        let response = self.post("v1/channels", body).await?;
        let txid = match opt_str_at(&response, "funding_txid_str") {
            Some(txid) => txid,
            None => txid_from_b64(&str_at(&response, "funding_txid_bytes")),
        };
        let channel_id = format!("{}:{}", txid, u64_at(&response, "output_index"));
        info!("Channel open initiated: {}", channel_id);
        Ok(channel_id)
    }

    async fn channel_list(&self) -> GatewayResult<Vec<Channel>> {
        let mut channels = Vec::new();

        for c in self.channels_of("v1/channels", "channels").await? {
            let peer = str_at(&c, "remote_pubkey");
            channels.push(Channel {
                channel_id: str_at(&c, "channel_point"),
                active: bool_at(&c, "active"),
                peer_alias: self.alias_or_empty(&peer).await,
                peer_publickey: peer,
                balance_local: u64_at(&c, "local_balance"),
                balance_remote: u64_at(&c, "remote_balance"),
                balance_capacity: u64_at(&c, "capacity"),
                state: ChannelState::Normal,
                initiator: initiator_from(&c),
                closer: None,
            });
        }

        let pending = self.get("v1/channels/pending", Value::Null).await?;
        for (key, state) in [
            ("pending_open_channels", ChannelState::Opening),
            ("waiting_close_channels", ChannelState::Closing),
            ("pending_force_closing_channels", ChannelState::ForceClosing),
        ] {
            for entry in array_at(&pending, key) {
                channels.push(self.pending_channel(entry, state).await);
            }
        }

        Ok(channels)
    }

    async fn channel_close(&self, channel_id: &str, force: bool) -> GatewayResult<String> {
        let (txid, index) = channel_point(channel_id)?;
        info!("Closing channel {} (force={})", channel_id, force);

        let method = RpcMethod::delete(format!("v1/channels/{}/{}", txid, index)).long_poll();
        let mut updates = self
            .transport
            .subscribe(&method, json!({ "force": force }))
            .await
            .map_err(classify)?;

        match updates.next().await {
            Some(Ok(update)) => {
                let pending = update.get("close_pending").cloned().unwrap_or(Value::Null);
                let closing_txid = txid_from_b64(&str_at(&pending, "txid"));
                info!("Channel {} closing in {}", channel_id, closing_txid);
                Ok(closing_txid)
            }
            Some(Err(e)) => Err(classify(e)),
            None => Err(GatewayError::Internal(
                "close stream ended without an update".to_string(),
            )),
        }
    }

    async fn peer_resolve_alias(&self, node_pub: &str) -> GatewayResult<String> {
        if let Some(alias) = self.cache.alias(node_pub).await {
            return Ok(alias);
        }

        let response = self
            .get(
                &format!("v1/graph/node/{}", node_pub),
                json!({ "include_channels": false }),
            )
            .await?;
        let alias = response
            .get("node")
            .map(|n| str_at(n, "alias"))
            .unwrap_or_default();
        self.cache.store_alias(node_pub, alias.clone()).await;
        Ok(alias)
    }
}
