//! Node session manager
//!
//! Owns the single active adapter and drives its initialization state
//! machine:
//!
//! ```text
//! OFFLINE* / BOOTSTRAPPING*  ->  LOCKED  ->  BOOTSTRAPPING_AFTER_UNLOCK  ->  DONE
//!            \___________________________________________________________/
//! ```
//!
//! `OFFLINE` and `BOOTSTRAPPING` may repeat until the wallet is reported
//! locked; from then on no earlier state is emitted again. `DONE` is
//! terminal for the process.

use crate::node::types::{InitLnRepoUpdate, InitState, NodeInfo};
use crate::node::{LightningNode, NodeHandle};
use crate::{GatewayError, GatewayResult};
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

/// Sequence of state machine transitions; ends after `DONE`
pub type InitUpdates = BoxStream<'static, InitLnRepoUpdate>;

/// Probe loop timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSettings {
    /// Delay between probes while offline, bootstrapping or locked
    pub retry_interval: Duration,
    /// Delay between probes once an unlock succeeded
    pub after_unlock_interval: Duration,
    /// Upper bound for one probe call
    pub call_timeout: Duration,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_millis(2000),
            after_unlock_interval: Duration::from_millis(500),
            call_timeout: Duration::from_secs(10),
        }
    }
}

/// Shared handles the probe loop reports through
#[derive(Clone)]
pub struct InitContext {
    /// Probe timing
    pub probe: ProbeSettings,
    /// Signalled after a successful `unlock_wallet`
    pub unlocked: Arc<Notify>,
    /// Latest state, readable by every caller
    pub state: Arc<watch::Sender<InitState>>,
    /// Set while a probe loop runs
    pub in_flight: Arc<AtomicBool>,
}

/// Result of one probe, as far as the state machine cares
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ProbeOutcome {
    Ready(NodeInfo),
    Offline(String),
    Bootstrapping(String),
    Locked(String),
}

impl From<GatewayResult<NodeInfo>> for ProbeOutcome {
    fn from(result: GatewayResult<NodeInfo>) -> Self {
        match result {
            Ok(info) => ProbeOutcome::Ready(info),
            Err(GatewayError::Locked(msg)) => ProbeOutcome::Locked(msg),
            Err(GatewayError::Bootstrapping(msg)) => ProbeOutcome::Bootstrapping(msg),
            Err(e) => ProbeOutcome::Offline(e.to_string()),
        }
    }
}

/// Pure transition logic; decides which updates get emitted
#[derive(Debug, Default)]
pub(crate) struct InitMachine {
    locked_seen: bool,
    unlocked: bool,
    done: bool,
}

impl InitMachine {
    pub fn on_probe(&mut self, outcome: ProbeOutcome) -> Option<InitLnRepoUpdate> {
        if self.done {
            return None;
        }
        match outcome {
            ProbeOutcome::Ready(info) => {
                self.done = true;
                Some(InitLnRepoUpdate::new(
                    InitState::Done,
                    format!(
                        "Lightning node ready (block height {})",
                        info.block_height
                    ),
                ))
            }
            ProbeOutcome::Locked(msg) => {
                if self.locked_seen {
                    return None;
                }
                self.locked_seen = true;
                Some(InitLnRepoUpdate::new(InitState::Locked, msg))
            }
            ProbeOutcome::Bootstrapping(msg) if self.locked_seen => self
                .mark_unlocked()
                .then(|| InitLnRepoUpdate::new(InitState::BootstrappingAfterUnlock, msg)),
            ProbeOutcome::Bootstrapping(msg) => {
                Some(InitLnRepoUpdate::new(InitState::Bootstrapping, msg))
            }
            ProbeOutcome::Offline(_) if self.locked_seen => None,
            ProbeOutcome::Offline(msg) => Some(InitLnRepoUpdate::new(InitState::Offline, msg)),
        }
    }

    pub fn on_unlocked(&mut self) -> Option<InitLnRepoUpdate> {
        if self.done || !self.locked_seen {
            return None;
        }
        self.mark_unlocked().then(|| {
            InitLnRepoUpdate::new(
                InitState::BootstrappingAfterUnlock,
                "Wallet unlocked, waiting for the node to finish booting",
            )
        })
    }

    pub fn waiting_for_unlock(&self) -> bool {
        self.locked_seen && !self.unlocked
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn interval(&self, probe: &ProbeSettings) -> Duration {
        if self.unlocked {
            probe.after_unlock_interval
        } else {
            probe.retry_interval
        }
    }

    /// Returns true the first time only
    fn mark_unlocked(&mut self) -> bool {
        !std::mem::replace(&mut self.unlocked, true)
    }
}

async fn probe_once<N: LightningNode + ?Sized>(node: &N, timeout: Duration) -> ProbeOutcome {
    node.probe(timeout).await.into()
}

/// Run the probe loop for `node` on a background task. The loop stops after
/// `DONE` or once the returned stream is dropped.
pub fn spawn_probe_loop<N: LightningNode + ?Sized>(node: Arc<N>, ctx: InitContext) -> InitUpdates {
    let (tx, rx) = mpsc::channel(16);

    tokio::spawn(async move {
        info!(
            "Starting {} initialization probe loop",
            node.get_implementation_name()
        );
        let mut machine = InitMachine::default();

        'probe: loop {
            let outcome = probe_once(node.as_ref(), ctx.probe.call_timeout).await;
            debug!("Probe outcome: {:?}", outcome);

            if let Some(update) = machine.on_probe(outcome) {
                ctx.state.send_replace(update.state);
                if tx.send(update).await.is_err() {
                    break;
                }
            }
            if machine.is_done() {
                break;
            }

            let interval = machine.interval(&ctx.probe);
            if machine.waiting_for_unlock() {
                tokio::select! {
                    _ = ctx.unlocked.notified() => {
                        if let Some(update) = machine.on_unlocked() {
                            ctx.state.send_replace(update.state);
                            if tx.send(update).await.is_err() {
                                break 'probe;
                            }
                        }
                    }
                    _ = tokio::time::sleep(interval) => {}
                    _ = tx.closed() => break,
                }
            } else {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = tx.closed() => break,
                }
            }
        }

        if machine.is_done() {
            info!("Probe loop finished: node ready");
        } else {
            warn!("Probe loop stopped before the node was ready");
            ctx.in_flight.store(false, Ordering::SeqCst);
        }
    });

    ReceiverStream::new(rx).boxed()
}

/// Owner of the active adapter and its lifecycle state
pub struct SessionManager {
    node: NodeHandle,
    probe: ProbeSettings,
    unlocked: Arc<Notify>,
    state: Arc<watch::Sender<InitState>>,
    in_flight: Arc<AtomicBool>,
}

impl SessionManager {
    /// Manage `node`; nothing runs until [`SessionManager::initialize`]
    pub fn new(node: NodeHandle, probe: ProbeSettings) -> Self {
        let (state, _) = watch::channel(InitState::Offline);
        Self {
            node,
            probe,
            unlocked: Arc::new(Notify::new()),
            state: Arc::new(state),
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start the state machine. Fails with `Conflict` once `DONE` was
    /// reached or while another attempt is still running.
    pub async fn initialize(&self) -> GatewayResult<InitUpdates> {
        if self.state() == InitState::Done {
            return Err(GatewayError::Conflict(
                "lightning node already initialized".to_string(),
            ));
        }
        if self.in_flight.swap(true, Ordering::SeqCst) {
            return Err(GatewayError::Conflict(
                "lightning node initialization already in progress".to_string(),
            ));
        }

        let ctx = InitContext {
            probe: self.probe,
            unlocked: self.unlocked.clone(),
            state: self.state.clone(),
            in_flight: self.in_flight.clone(),
        };
        Ok(self.node.clone().initialize(ctx))
    }

    /// Current lifecycle state
    pub fn state(&self) -> InitState {
        *self.state.borrow()
    }

    /// The adapter, once `DONE`; otherwise the error matching the state
    pub fn node(&self) -> GatewayResult<NodeHandle> {
        match self.state() {
            InitState::Done => Ok(self.node.clone()),
            InitState::Locked => Err(GatewayError::Locked(
                "wallet must be unlocked first".to_string(),
            )),
            InitState::Bootstrapping | InitState::BootstrappingAfterUnlock => Err(
                GatewayError::Bootstrapping("lightning node is starting".to_string()),
            ),
            InitState::Offline => Err(GatewayError::Unavailable(
                "lightning node is not reachable".to_string(),
            )),
        }
    }

    /// The adapter, waiting at most `timeout` for `DONE`
    pub async fn wait_ready(&self, timeout: Duration) -> GatewayResult<NodeHandle> {
        let mut rx = self.state.subscribe();
        let _ = tokio::time::timeout(timeout, rx.wait_for(|s| *s == InitState::Done)).await;
        self.node()
    }

    /// Implementation name of the managed adapter
    pub fn implementation(&self) -> &'static str {
        self.node.get_implementation_name()
    }

    /// Forward an unlock to the adapter. Only valid while `LOCKED`; on
    /// success the probe loop moves on to `BOOTSTRAPPING_AFTER_UNLOCK`.
    pub async fn unlock_wallet(&self, password: &str) -> GatewayResult<bool> {
        let state = self.state();
        if state != InitState::Locked {
            return Err(GatewayError::Conflict(format!(
                "wallet unlock not possible in state {:?}",
                state
            )));
        }

        let unlocked = self.node.unlock_wallet(password).await?;
        if unlocked {
            info!("Wallet unlock accepted");
            self.unlocked.notify_one();
        } else {
            warn!("Wallet unlock rejected");
        }
        Ok(unlocked)
    }
}
