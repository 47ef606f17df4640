//! Lightning node abstraction
//!
//! [`LightningNode`] is the one capability interface every backend adapter
//! implements. Adapters translate it onto a backend's native calls through a
//! [`crate::transport`] client and map every backend failure onto a
//! [`GatewayError`] kind, so nothing backend-specific leaks past this module.
//!
//! Adapters:
//! - [`LndNode`]: LND over its REST proxy
//! - [`ClnNode`]: Core Lightning over the `lightning-rpc` unix socket or `clnrest`
//! - [`LockAwareAdapter`]: wraps any adapter for deployments where an
//!   external mechanism also locks the wallet

use crate::config::{Backend, ClnTransport, Config};
use crate::session::{self, InitContext, InitUpdates};
use crate::transport::{Connector, RestAuth, RestConnector, UnixConnector};
use crate::{GatewayError, GatewayResult};
use anyhow::Context;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;

mod cache;
mod cln;
mod forwards;
mod json;
mod lnd;
mod lock_aware;
pub mod tx;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::AdapterCache;
pub use cln::ClnNode;
pub use forwards::{ForwardCorrelator, ForwardListDiff, HtlcEvent, HtlcEventKind, HtlcKey};
pub use lnd::LndNode;
pub use lock_aware::{CommandUnlocker, FileLockFlag, LockAwareAdapter, LockFlag, UnlockCommand};

use types::*;

/// The single active adapter, shared by every caller
pub type NodeHandle = Arc<dyn LightningNode>;

/// Infinite stream of invoice updates
pub type InvoiceStream = BoxStream<'static, GatewayResult<Invoice>>;

/// Infinite stream of completed forwards
pub type ForwardStream = BoxStream<'static, GatewayResult<ForwardSuccessEvent>>;

/// Capability interface over one backend/transport combination
#[async_trait]
pub trait LightningNode: Send + Sync + 'static {
    /// Constant implementation name. Never fails, never does I/O.
    fn get_implementation_name(&self) -> &'static str;

    /// One lightweight readiness check on a freshly opened transport handle.
    /// The call is bounded by `timeout` and the handle is closed before
    /// returning on every path, a timeout included.
    async fn probe(&self, timeout: Duration) -> GatewayResult<NodeInfo>;

    /// Run the initialization state machine; yields every transition and
    /// ends after `DONE`
    fn initialize(self: Arc<Self>, ctx: InitContext) -> InitUpdates {
        session::spawn_probe_loop(self, ctx)
    }

    /// Node identity and sync status
    async fn get_node_info(&self) -> GatewayResult<NodeInfo>;

    /// On-chain and channel balances
    async fn get_wallet_balance(&self) -> GatewayResult<WalletBalance>;

    /// Issued invoices, oldest first unless reversed
    async fn list_invoices(
        &self,
        query: ListQuery,
        filter: InvoiceFilter,
    ) -> GatewayResult<Vec<Invoice>>;

    /// Outgoing payments, oldest first unless reversed
    async fn list_payments(
        &self,
        query: ListQuery,
        filter: PaymentFilter,
    ) -> GatewayResult<Vec<Payment>>;

    /// On-chain wallet transactions, oldest first unless reversed
    async fn list_on_chain_tx(&self, query: ListQuery) -> GatewayResult<Vec<OnChainTransaction>>;

    /// Invoices, payments and on-chain transactions merged into one feed
    async fn list_all_tx(&self, query: ListQuery, filter: TxFilter) -> GatewayResult<Vec<GenericTx>> {
        let invoices = self
            .list_invoices(ListQuery::all(), InvoiceFilter::default())
            .await?;
        let payments = self
            .list_payments(
                ListQuery::all(),
                PaymentFilter {
                    include_incomplete: true,
                },
            )
            .await?;
        let onchain = self.list_on_chain_tx(ListQuery::all()).await?;

        Ok(tx::merge_transactions(
            &invoices, &payments, &onchain, query, filter,
        ))
    }

    /// Create an invoice
    async fn add_invoice(&self, req: NewInvoice) -> GatewayResult<Invoice>;

    /// Decode a BOLT11 request; cached per adapter by request string
    async fn decode_pay_request(&self, pay_req: &str) -> GatewayResult<PaymentRequest>;

    /// Pay a BOLT11 request and return the backend's final status
    async fn send_payment(&self, req: SendPayment) -> GatewayResult<Payment>;

    /// Send on-chain
    async fn send_coins(&self, req: SendCoins) -> GatewayResult<SendCoinsResult>;

    /// Routing fee income
    async fn get_fee_revenue(&self) -> GatewayResult<FeeRevenue>;

    /// Unlock the wallet. Backends without wallet locking succeed as a no-op.
    async fn unlock_wallet(&self, password: &str) -> GatewayResult<bool>;

    /// Invoice updates as they happen
    async fn listen_invoices(&self) -> GatewayResult<InvoiceStream>;

    /// Successful forwards as they happen
    async fn listen_forward_events(&self) -> GatewayResult<ForwardStream>;

    /// Connect to a peer and open a channel; returns the channel id
    async fn channel_open(&self, req: OpenChannel) -> GatewayResult<String>;

    /// Open, pending and closing channels
    async fn channel_list(&self) -> GatewayResult<Vec<Channel>>;

    /// Close a channel; returns the closing transaction id
    async fn channel_close(&self, channel_id: &str, force: bool) -> GatewayResult<String>;

    /// Alias of a node; cached per adapter
    async fn peer_resolve_alias(&self, node_pub: &str) -> GatewayResult<String>;
}

/// Capacity of the queue between a listener task and its consumer
const LISTENER_QUEUE: usize = 64;

/// Queue pair for a listener task. The task must stop once `send` fails,
/// which happens when the consumer drops the stream.
pub(crate) fn listener_channel<T: Send + 'static>(
) -> (mpsc::Sender<GatewayResult<T>>, BoxStream<'static, GatewayResult<T>>) {
    let (tx, rx) = mpsc::channel(LISTENER_QUEUE);
    (tx, ReceiverStream::new(rx).boxed())
}

/// A readiness check that ran out of time reads as an unreachable backend
pub(crate) fn probe_timeout(timeout: Duration) -> GatewayError {
    GatewayError::Unavailable(format!("probe timed out after {:?}", timeout))
}

/// Reject amount conflicts between a payment request and the caller
pub(crate) fn check_payment_amount(
    decoded: &PaymentRequest,
    amount_msat: Option<u64>,
) -> GatewayResult<()> {
    match (decoded.num_msat.filter(|n| *n > 0), amount_msat) {
        (Some(_), Some(_)) => Err(GatewayError::InvalidRequest(
            "payment request already specifies an amount".to_string(),
        )),
        (None, None) | (None, Some(0)) => Err(GatewayError::InvalidRequest(
            "amount required for a zero-amount payment request".to_string(),
        )),
        _ => Ok(()),
    }
}

/// Build the adapter selected by configuration. No backend I/O happens here
/// beyond reading credential files.
pub async fn connect_node(config: &Config) -> anyhow::Result<NodeHandle> {
    let timeout = config.rpc_timeout();

    let node: NodeHandle = match config.node.backend {
        Backend::Lnd => {
            let macaroon = match &config.lnd.macaroon_path {
                Some(path) => {
                    let bytes = tokio::fs::read(path)
                        .await
                        .with_context(|| format!("Failed to read macaroon {}", path.display()))?;
                    hex::encode(bytes)
                }
                None => String::new(),
            };
            let cert = read_optional(&config.lnd.tls_cert_path).await?;
            let connector: Arc<dyn Connector> = Arc::new(RestConnector::new(
                config.lnd.rest_url(),
                RestAuth::Macaroon(macaroon),
                cert,
                timeout,
            ));
            info!("Using LND REST backend at {}", connector.describe());
            Arc::new(LndNode::new(connector))
        }
        Backend::Cln => match config.cln.transport {
            ClnTransport::Unix => {
                let connector: Arc<dyn Connector> =
                    Arc::new(UnixConnector::new(config.cln.rpc_socket_path.clone(), timeout));
                info!("Using Core Lightning backend at {}", connector.describe());
                Arc::new(ClnNode::unix_socket(
                    connector,
                    config.scheduler.forward_poll_interval(),
                ))
            }
            ClnTransport::Rest => {
                let rune = config.cln.resolve_rune().await?;
                let cert = read_optional(&config.cln.tls_cert_path).await?;
                let connector: Arc<dyn Connector> = Arc::new(RestConnector::new(
                    config.cln.rest_url.clone(),
                    RestAuth::Rune(rune),
                    cert,
                    timeout,
                ));
                info!("Using Core Lightning REST backend at {}", connector.describe());
                Arc::new(ClnNode::rest(
                    connector,
                    config.scheduler.forward_poll_interval(),
                ))
            }
        },
    };

    let Some(lock) = &config.lock else {
        return Ok(node);
    };

    info!(
        "External wallet lock enabled (flag: {})",
        lock.lock_flag_path.display()
    );
    Ok(Arc::new(LockAwareAdapter::new(
        node,
        Arc::new(FileLockFlag::new(lock.lock_flag_path.clone())),
        Arc::new(CommandUnlocker::new(lock.unlock_command.clone())),
        lock.unlock_timeout(),
        lock.poll_interval(),
    )))
}

async fn read_optional(path: &Option<std::path::PathBuf>) -> anyhow::Result<Option<Vec<u8>>> {
    match path {
        Some(path) => {
            let bytes = tokio::fs::read(path)
                .await
                .with_context(|| format!("Failed to read TLS certificate {}", path.display()))?;
            Ok(Some(bytes))
        }
        None => Ok(None),
    }
}
