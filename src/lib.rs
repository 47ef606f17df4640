//! ln-gateway: a REST/SSE gateway over a Lightning node
//!
//! This crate exposes one unified API over a Lightning node backend
//! (LND or Core Lightning) for a companion web UI:
//!
//! - **Transport clients**: JSON-RPC over a unix socket and REST over HTTPS
//! - **Backend adapters**: one capability interface ([`node::LightningNode`])
//!   over every backend/transport combination
//! - **Session manager**: drives the node bootstrap state machine
//!   (offline, bootstrapping, locked, ...) and resumes automatically
//! - **Event hub**: fans node-pushed and polled events out to any number of
//!   Server-Sent-Events subscribers
//!
//! # Architecture
//!
//! 1. At startup [`node::connect_node`] builds exactly one adapter from config
//! 2. The [`session::SessionManager`] probes the backend until it is ready,
//!    broadcasting every state transition
//! 3. Once ready, [`tasks::BackgroundTasks`] starts the pollers and the
//!    invoice/forward listeners, which publish into the [`events::EventHub`]
//! 4. The HTTP layer in [`api`] serves requests and drains hub subscriptions
//!    into `GET /sse/subscribe` streams
//!
#![warn(missing_docs)]

pub mod api;
pub mod config;
pub mod events;
pub mod node;
pub mod session;
pub mod tasks;
pub mod transport;

use anyhow::Result;
use futures::StreamExt;
use std::sync::Arc;
use tracing::{error, info, warn};

pub use config::Config;
use events::EventHub;
use node::types::InitState;
use session::SessionManager;
use tasks::{BackgroundTasks, Snapshots};

/// The main gateway application state
#[derive(Clone)]
pub struct GatewayApp {
    /// Application configuration
    pub config: Arc<Config>,
    /// Owner of the single active backend adapter
    pub session: Arc<SessionManager>,
    /// Process-wide event broadcaster
    pub hub: Arc<EventHub>,
    /// Last known value of every replayable event
    pub snapshots: Arc<Snapshots>,
    /// Pollers and listeners started once the node is ready
    pub tasks: Arc<BackgroundTasks>,
}

impl GatewayApp {
    /// Create a new gateway instance. Builds the backend adapter but does
    /// not talk to the node yet.
    pub async fn new(config: Config) -> Result<Self> {
        info!("Initializing ln-gateway application...");

        let config = Arc::new(config);

        let node = node::connect_node(&config).await?;
        info!(
            "Selected lightning backend: {}",
            node.get_implementation_name()
        );

        let session = Arc::new(SessionManager::new(node, config.probe_settings()));
        let hub = Arc::new(EventHub::new());
        let snapshots = Arc::new(Snapshots::new());
        let tasks = Arc::new(BackgroundTasks::new(config.scheduler.clone()));

        Ok(Self {
            config,
            session,
            hub,
            snapshots,
            tasks,
        })
    }

    /// Start the gateway
    pub async fn run(&self) -> Result<()> {
        self.run_with_shutdown(tokio::sync::oneshot::channel().1).await
    }

    /// Start the gateway with shutdown signal
    pub async fn run_with_shutdown(
        &self,
        shutdown_rx: tokio::sync::oneshot::Receiver<()>,
    ) -> Result<()> {
        info!("Starting ln-gateway application...");

        self.hub.start().await;

        let app = self.clone();
        tokio::spawn(async move {
            if let Err(e) = app.drive_initialization().await {
                error!("Lightning node initialization aborted: {}", e);
            }
        });

        let api_handle = tokio::spawn({
            let app = self.clone();
            async move {
                if let Err(e) = api::serve_with_shutdown(app, shutdown_rx).await {
                    warn!("API server error: {}", e);
                }
            }
        });

        info!(
            "ln-gateway running. API available at http://{}",
            self.config.api_bind_address()
        );

        api_handle.await?;

        Ok(())
    }

    /// Drain the session's init updates, broadcasting each transition and
    /// starting the background tasks once the node is ready
    pub async fn drive_initialization(&self) -> GatewayResult<()> {
        let mut updates = self.session.initialize().await?;

        while let Some(update) = updates.next().await {
            info!("Lightning init state: {:?} ({})", update.state, update.msg);
            self.snapshots.record(events::LN_INIT_STATE, &update);
            self.hub.broadcast(events::LN_INIT_STATE, &update);

            if update.state == InitState::Done {
                let node = self.session.node()?;
                self.tasks
                    .start(node, self.hub.clone(), self.snapshots.clone())
                    .await?;
                self.hub.broadcast(
                    events::SYSTEM_STARTUP_INFO,
                    &serde_json::json!({ "lightning": "done" }),
                );
            }
        }

        Ok(())
    }

    /// Shutdown the gateway gracefully
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down ln-gateway application...");

        self.tasks.stop().await;
        self.hub.stop().await;

        info!("ln-gateway shutdown complete");
        Ok(())
    }
}

/// Coarse classification of a [`GatewayError`], stable across backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Transport cannot be reached at all
    Unavailable,
    /// Backend reachable but not yet accepting full calls
    Bootstrapping,
    /// Backend wallet requires unlock
    Locked,
    /// Malformed input
    InvalidRequest,
    /// Operation already satisfied or in an incompatible terminal state
    Conflict,
    /// Backend cannot afford the operation
    InsufficientFunds,
    /// An externally imposed deadline elapsed
    Timeout,
    /// Referenced entity does not exist
    NotFound,
    /// Capability not implemented by the selected backend
    Unsupported,
    /// Anything else
    Internal,
}

/// Error types surfaced by every capability call
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Transport cannot be reached at all
    #[error("Lightning node unavailable: {0}")]
    Unavailable(String),

    /// Backend reachable but still starting its services
    #[error("Lightning node is bootstrapping: {0}")]
    Bootstrapping(String),

    /// Wallet must be unlocked first
    #[error("Wallet is locked: {0}")]
    Locked(String),

    /// Malformed input
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Already satisfied / terminal state
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Not enough funds
    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    /// Deadline elapsed
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Static capability gap of the selected backend
    #[error("Not supported: {0}")]
    Unsupported(String),

    /// Opaque failure; details are only logged
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// The kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::Unavailable(_) => ErrorKind::Unavailable,
            GatewayError::Bootstrapping(_) => ErrorKind::Bootstrapping,
            GatewayError::Locked(_) => ErrorKind::Locked,
            GatewayError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            GatewayError::Conflict(_) => ErrorKind::Conflict,
            GatewayError::InsufficientFunds(_) => ErrorKind::InsufficientFunds,
            GatewayError::Timeout(_) => ErrorKind::Timeout,
            GatewayError::NotFound(_) => ErrorKind::NotFound,
            GatewayError::Unsupported(_) => ErrorKind::Unsupported,
            GatewayError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Errors after which a listener loop cannot make progress on its own
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Locked | ErrorKind::Unavailable)
    }
}

/// Result type alias for gateway operations
pub type GatewayResult<T> = std::result::Result<T, GatewayError>;
