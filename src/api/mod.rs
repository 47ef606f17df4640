//! HTTP API for the web UI
//!
//! This module provides:
//! - Node, balance and fee revenue queries
//! - Invoices, payments, on-chain sends and channel management
//! - Wallet unlock
//! - `GET /sse/subscribe`, the live event stream
//!
//! Every route except `/health` requires a bearer token when
//! `api.jwt_secret` is configured.

use crate::{GatewayApp, GatewayError, GatewayResult};
use axum::{
    http::StatusCode,
    middleware,
    response::Json,
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

mod auth;
mod health;
mod lightning;
mod sse;

pub use auth::*;
pub use health::*;
pub use lightning::*;
pub use sse::*;

/// API state shared across handlers
#[derive(Clone)]
pub struct ApiState {
    /// The gateway application
    pub app: GatewayApp,
}

/// Build the API router
pub fn build_router(app: GatewayApp) -> Router {
    let jwt_secret = app.config.api.jwt_secret.clone();
    let state = ApiState { app };

    let protected = Router::new()
        // Session
        .route("/v1/lightning/init-state", get(get_init_state))
        .route("/v1/lightning/unlock", post(unlock_wallet))
        // Node
        .route("/v1/lightning/info", get(get_node_info))
        .route("/v1/lightning/balance", get(get_wallet_balance))
        .route("/v1/lightning/fee-revenue", get(get_fee_revenue))
        // Invoices and payments
        .route("/v1/lightning/invoices", get(list_invoices).post(add_invoice))
        .route("/v1/lightning/payments", get(list_payments).post(send_payment))
        .route("/v1/lightning/payreq/:pay_req", get(decode_pay_request))
        // On-chain
        .route(
            "/v1/lightning/transactions",
            get(list_on_chain_tx).post(send_coins),
        )
        .route("/v1/lightning/all-tx", get(list_all_tx))
        // Channels
        .route("/v1/lightning/channels", get(list_channels).post(open_channel))
        .route("/v1/lightning/channels/:channel_id", delete(close_channel))
        .route("/v1/lightning/peers/:node_pub/alias", get(resolve_alias))
        // Live events
        .route("/sse/subscribe", get(sse_subscribe));

    let protected = match jwt_secret {
        Some(secret) => protected.route_layer(middleware::from_fn_with_state(
            JwtKey::new(&secret),
            require_jwt,
        )),
        None => {
            warn!("api.jwt_secret is not set, API authentication is disabled");
            protected
        }
    };

    Router::new()
        // Health check
        .route("/health", get(health_check))
        .merge(protected)
        // Add state
        .with_state(state)
}

/// Start the HTTP API server
pub async fn serve(app: GatewayApp) -> anyhow::Result<()> {
    serve_with_shutdown(app, tokio::sync::oneshot::channel().1).await
}

/// Start the HTTP API server with graceful shutdown
pub async fn serve_with_shutdown(
    app: GatewayApp,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> anyhow::Result<()> {
    let config = app.config.clone();

    // Build the router
    let router = build_router(app).layer(TraceLayer::new_for_http());

    // Add CORS if enabled
    let router = if config.api.enable_cors {
        router.layer(CorsLayer::permissive())
    } else {
        router
    };

    // Parse bind address
    let addr: std::net::SocketAddr = config
        .api
        .bind_address
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address: {}", e))?;

    info!("Starting HTTP API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
            info!("Received shutdown signal, stopping API server...");
        })
        .await?;

    info!("API server stopped gracefully");
    Ok(())
}

/// Standard API response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    /// Whether the request was successful
    pub success: bool,
    /// Response data (only present if success is true)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    /// Error message (only present if success is false)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    /// Create a successful response
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// Create an error response
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Convert GatewayError to HTTP status code
pub fn error_to_status_code(err: &GatewayError) -> StatusCode {
    match err {
        GatewayError::Unavailable(_) | GatewayError::Bootstrapping(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        GatewayError::Locked(_) => StatusCode::LOCKED,
        GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        GatewayError::Conflict(_) => StatusCode::CONFLICT,
        GatewayError::InsufficientFunds(_) => StatusCode::PRECONDITION_FAILED,
        GatewayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
        GatewayError::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
        GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Turn a capability result into a status code and response body
pub fn respond<T: Serialize>(result: GatewayResult<T>) -> (StatusCode, Json<ApiResponse<T>>) {
    match result {
        Ok(data) => (StatusCode::OK, Json(ApiResponse::success(data))),
        Err(e) => {
            let status = error_to_status_code(&e);
            (status, Json(ApiResponse::error(e.to_string())))
        }
    }
}
