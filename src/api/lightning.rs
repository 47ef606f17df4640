//! Lightning node API endpoints
//!
//! Thin wrappers over [`crate::node::LightningNode`]. Until the node is
//! ready every call fails with the error matching the init state.

use super::{respond, ApiResponse, ApiState};
use crate::node::types::{
    InitState, InvoiceFilter, ListQuery, NewInvoice, OpenChannel, PaymentFilter, SendCoins,
    SendPayment, TxFilter,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Paging and filter parameters shared by the list endpoints
#[derive(Debug, Deserialize, Default)]
pub struct ListParams {
    /// Items to skip
    #[serde(default)]
    pub index_offset: u64,
    /// Items to return; 0 means all
    #[serde(default)]
    pub max_count: u64,
    /// Newest first
    #[serde(default)]
    pub reversed: bool,
    /// Invoices: only open ones
    #[serde(default)]
    pub pending_only: bool,
    /// Payments: include in-flight and failed ones
    #[serde(default)]
    pub include_incomplete: bool,
    /// Unified feed: only completed entries
    #[serde(default)]
    pub successful_only: bool,
}

impl ListParams {
    fn query(&self) -> ListQuery {
        ListQuery {
            index_offset: self.index_offset,
            max_count: self.max_count,
            reversed: self.reversed,
        }
    }
}

/// Init state response
#[derive(Debug, Serialize)]
pub struct InitStateResponse {
    /// Current state
    pub state: InitState,
    /// Selected backend adapter
    pub implementation: String,
}

/// Current initialization state
pub async fn get_init_state(State(state): State<ApiState>) -> impl IntoResponse {
    let response = InitStateResponse {
        state: state.app.session.state(),
        implementation: state.app.session.implementation().to_string(),
    };
    (StatusCode::OK, Json(ApiResponse::success(response)))
}

/// Unlock request
#[derive(Debug, Deserialize)]
pub struct UnlockRequest {
    /// Wallet password
    pub password: String,
}

/// Unlock response
#[derive(Debug, Serialize)]
pub struct UnlockResponse {
    /// Whether the backend accepted the password
    pub unlocked: bool,
}

/// Unlock the wallet
pub async fn unlock_wallet(
    State(state): State<ApiState>,
    Json(req): Json<UnlockRequest>,
) -> impl IntoResponse {
    info!("API: Wallet unlock requested");
    let result = state.app.session.unlock_wallet(&req.password).await;
    respond(result.map(|unlocked| UnlockResponse { unlocked }))
}

/// Node info
pub async fn get_node_info(State(state): State<ApiState>) -> impl IntoResponse {
    let result = async { state.app.session.node()?.get_node_info().await }.await;
    respond(result)
}

/// Wallet balance
pub async fn get_wallet_balance(State(state): State<ApiState>) -> impl IntoResponse {
    let result = async { state.app.session.node()?.get_wallet_balance().await }.await;
    respond(result)
}

/// Routing fee revenue
pub async fn get_fee_revenue(State(state): State<ApiState>) -> impl IntoResponse {
    let result = async { state.app.session.node()?.get_fee_revenue().await }.await;
    respond(result)
}

/// List invoices
pub async fn list_invoices(
    State(state): State<ApiState>,
    Query(params): Query<ListParams>,
) -> impl IntoResponse {
    let filter = InvoiceFilter {
        pending_only: params.pending_only,
    };
    let result = async {
        state
            .app
            .session
            .node()?
            .list_invoices(params.query(), filter)
            .await
    }
    .await;
    respond(result)
}

/// Create an invoice
pub async fn add_invoice(
    State(state): State<ApiState>,
    Json(req): Json<NewInvoice>,
) -> impl IntoResponse {
    info!(
        "API: Add invoice: value_msat={}, expiry={}s",
        req.value_msat, req.expiry
    );
    let result = async { state.app.session.node()?.add_invoice(req).await }.await;
    respond(result)
}

/// List outgoing payments
pub async fn list_payments(
    State(state): State<ApiState>,
    Query(params): Query<ListParams>,
) -> impl IntoResponse {
    let filter = PaymentFilter {
        include_incomplete: params.include_incomplete,
    };
    let result = async {
        state
            .app
            .session
            .node()?
            .list_payments(params.query(), filter)
            .await
    }
    .await;
    respond(result)
}

/// Pay a BOLT11 request; refreshes the balance afterwards
pub async fn send_payment(
    State(state): State<ApiState>,
    Json(req): Json<SendPayment>,
) -> impl IntoResponse {
    info!(
        "API: Send payment: timeout={}s, fee_limit_msat={:?}",
        req.timeout_seconds, req.fee_limit_msat
    );
    let result = async { state.app.session.node()?.send_payment(req).await }.await;
    if result.is_ok() {
        state.app.tasks.refresh_balance().await;
    }
    respond(result)
}

/// Decode a BOLT11 request
pub async fn decode_pay_request(
    State(state): State<ApiState>,
    Path(pay_req): Path<String>,
) -> impl IntoResponse {
    let result = async { state.app.session.node()?.decode_pay_request(&pay_req).await }.await;
    respond(result)
}

/// List on-chain transactions
pub async fn list_on_chain_tx(
    State(state): State<ApiState>,
    Query(params): Query<ListParams>,
) -> impl IntoResponse {
    let result = async { state.app.session.node()?.list_on_chain_tx(params.query()).await }.await;
    respond(result)
}

/// Send on-chain; refreshes the balance afterwards
pub async fn send_coins(
    State(state): State<ApiState>,
    Json(req): Json<SendCoins>,
) -> impl IntoResponse {
    info!(
        "API: Send coins: amount={:?}, send_all={}",
        req.amount, req.send_all
    );
    let result = async { state.app.session.node()?.send_coins(req).await }.await;
    if result.is_ok() {
        state.app.tasks.refresh_balance().await;
    }
    respond(result)
}

/// Invoices, payments and on-chain transactions in one feed
pub async fn list_all_tx(
    State(state): State<ApiState>,
    Query(params): Query<ListParams>,
) -> impl IntoResponse {
    let filter = TxFilter {
        successful_only: params.successful_only,
    };
    let result = async {
        state
            .app
            .session
            .node()?
            .list_all_tx(params.query(), filter)
            .await
    }
    .await;
    respond(result)
}

/// List channels
pub async fn list_channels(State(state): State<ApiState>) -> impl IntoResponse {
    let result = async { state.app.session.node()?.channel_list().await }.await;
    respond(result)
}

/// Channel open response
#[derive(Debug, Serialize)]
pub struct ChannelPointResponse {
    /// Funding or closing transaction id
    pub txid: String,
}

/// Open a channel
pub async fn open_channel(
    State(state): State<ApiState>,
    Json(req): Json<OpenChannel>,
) -> impl IntoResponse {
    info!(
        "API: Open channel to {}: {} sats, private={}",
        req.node_uri, req.local_funding_amount, req.private
    );
    let result = async { state.app.session.node()?.channel_open(req).await }.await;
    respond(result.map(|txid| ChannelPointResponse { txid }))
}

/// Close parameters
#[derive(Debug, Deserialize)]
pub struct CloseParams {
    /// Force close
    #[serde(default)]
    pub force: bool,
}

/// Close a channel identified by its channel point
pub async fn close_channel(
    State(state): State<ApiState>,
    Path(channel_id): Path<String>,
    Query(params): Query<CloseParams>,
) -> impl IntoResponse {
    info!(
        "API: Close channel {}: force={}",
        channel_id, params.force
    );
    let result = async {
        state
            .app
            .session
            .node()?
            .channel_close(&channel_id, params.force)
            .await
    }
    .await;
    respond(result.map(|txid| ChannelPointResponse { txid }))
}

/// Alias response
#[derive(Debug, Serialize)]
pub struct AliasResponse {
    /// Peer public key
    pub node_pub: String,
    /// Announced alias
    pub alias: String,
}

/// Resolve a peer's alias
pub async fn resolve_alias(
    State(state): State<ApiState>,
    Path(node_pub): Path<String>,
) -> impl IntoResponse {
    let result = async { state.app.session.node()?.peer_resolve_alias(&node_pub).await }.await;
    respond(result.map(|alias| AliasResponse { node_pub, alias }))
}
