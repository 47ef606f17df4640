//! Background work started once the node is ready
//!
//! - [`DiffPoller`]s for node info, wallet balance and fee revenue
//! - [`BalanceRefresher`] for debounced balance updates after mutations
//! - invoice and forward listeners
//!
//! Everything publishes into the [`EventHub`]; pollers also keep the
//! [`Snapshots`] current for SSE replay.

mod debounce;
mod listeners;
mod poll;
mod snapshot;

pub use debounce::BalanceRefresher;
pub use listeners::{run_forward_listener, run_invoice_listener};
pub use poll::DiffPoller;
pub use snapshot::Snapshots;

use crate::config::SchedulerConfig;
use crate::events::{EventHub, FEE_REVENUE, LN_INFO, WALLET_BALANCE};
use crate::node::NodeHandle;
use crate::{GatewayError, GatewayResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Delay before a listener reopens a lost subscription
const LISTENER_RESTART_DELAY: Duration = Duration::from_secs(5);

/// Owner of the pollers and listeners
pub struct BackgroundTasks {
    config: SchedulerConfig,
    handles: Mutex<Vec<JoinHandle<()>>>,
    refresher: RwLock<Option<Arc<BalanceRefresher>>>,
    running: RwLock<bool>,
}

impl BackgroundTasks {
    /// Not started until [`BackgroundTasks::start`]
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            handles: Mutex::new(Vec::new()),
            refresher: RwLock::new(None),
            running: RwLock::new(false),
        }
    }

    /// Spawn every poller and listener. Fails with `Conflict` if already
    /// started.
    pub async fn start(
        &self,
        node: NodeHandle,
        hub: Arc<EventHub>,
        snapshots: Arc<Snapshots>,
    ) -> GatewayResult<()> {
        {
            let mut running = self.running.write().await;
            if *running {
                return Err(GatewayError::Conflict(
                    "background tasks already started".to_string(),
                ));
            }
            *running = true;
        }

        info!("Starting background tasks...");
        let mut handles = self.handles.lock().await;

        let info_poller = Arc::new(DiffPoller::new(LN_INFO, hub.clone(), snapshots.clone()));
        let n = node.clone();
        handles.push(tokio::spawn(info_poller.run(
            self.config.info_interval(),
            move || {
                let node = n.clone();
                async move { node.get_node_info().await }
            },
        )));

        let balance_poller = Arc::new(DiffPoller::new(
            WALLET_BALANCE,
            hub.clone(),
            snapshots.clone(),
        ));
        let n = node.clone();
        handles.push(tokio::spawn(balance_poller.clone().run(
            self.config.balance_interval(),
            move || {
                let node = n.clone();
                async move { node.get_wallet_balance().await }
            },
        )));

        let fee_poller = Arc::new(DiffPoller::new(FEE_REVENUE, hub.clone(), snapshots));
        let n = node.clone();
        handles.push(tokio::spawn(fee_poller.run(
            self.config.fee_revenue_interval(),
            move || {
                let node = n.clone();
                async move { node.get_fee_revenue().await }
            },
        )));

        let refresher = Arc::new(BalanceRefresher::new(
            node.clone(),
            balance_poller,
            self.config.balance_debounce(),
        ));
        *self.refresher.write().await = Some(refresher.clone());

        handles.push(tokio::spawn(run_invoice_listener(
            node.clone(),
            hub.clone(),
            refresher,
            LISTENER_RESTART_DELAY,
        )));

        if self.config.enable_forward_notifications {
            handles.push(tokio::spawn(run_forward_listener(
                node,
                hub,
                LISTENER_RESTART_DELAY,
            )));
        } else {
            debug!("Forward notifications disabled");
        }

        info!("Started {} background tasks", handles.len());
        Ok(())
    }

    /// Schedule a debounced balance refresh; ignored before start
    pub async fn refresh_balance(&self) {
        if let Some(refresher) = self.refresher.read().await.as_ref() {
            refresher.trigger();
        }
    }

    /// Check if the tasks were started
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Abort every task
    pub async fn stop(&self) {
        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            handle.abort();
        }
        *self.refresher.write().await = None;
        *self.running.write().await = false;
        info!("Background tasks stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ServerEvent, Subscription, LN_FORWARD_SUCCESSES};
    use crate::node::testing::FakeNode;
    use crate::node::types::{ForwardSuccessEvent, WalletBalance};
    use futures::StreamExt;

    async fn drain(sub: &mut Subscription) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(300), sub.next()).await
        {
            events.push(event);
        }
        events
    }

    fn forward() -> ForwardSuccessEvent {
        ForwardSuccessEvent {
            timestamp_ns: 1,
            settled_ns: 2,
            chan_id_in: "1".to_string(),
            chan_id_out: "2".to_string(),
            amt_in_msat: 2_000,
            amt_out_msat: 1_000,
            fee_msat: 1_000,
        }
    }

    #[tokio::test]
    async fn test_start_publishes_initial_values_once() {
        let node = FakeNode::ready();
        let hub = Arc::new(EventHub::new());
        hub.start().await;
        let snapshots = Arc::new(Snapshots::new());
        let (mut sub, _) = hub.add_subscriber();
        let tasks = BackgroundTasks::new(SchedulerConfig::default());

        tasks
            .start(node.clone(), hub.clone(), snapshots.clone())
            .await
            .unwrap();
        assert!(tasks.is_running().await);

        let events = drain(&mut sub).await;
        let names: Vec<&str> = events.iter().map(|e| e.event.as_str()).collect();
        assert!(names.contains(&LN_INFO));
        assert!(names.contains(&WALLET_BALANCE));
        assert!(names.contains(&FEE_REVENUE));
        assert_eq!(snapshots.replay().len(), 3);

        let err = tasks.start(node, hub.clone(), snapshots).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Conflict);

        tasks.stop().await;
        assert!(!tasks.is_running().await);
        hub.stop().await;
    }

    #[tokio::test]
    async fn test_refresh_balance_publishes_change() {
        let node = FakeNode::ready();
        let hub = Arc::new(EventHub::new());
        hub.start().await;
        let config = SchedulerConfig {
            balance_debounce_ms: 10,
            ..SchedulerConfig::default()
        };
        let tasks = BackgroundTasks::new(config);

        // Not started: nothing to refresh.
        tasks.refresh_balance().await;
        assert_eq!(node.balance_calls(), 0);

        tasks
            .start(node.clone(), hub.clone(), Arc::new(Snapshots::new()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let (mut sub, _) = hub.add_subscriber();
        let before = node.balance_calls();

        node.set_balance(WalletBalance {
            onchain_total_balance: 42,
            ..WalletBalance::default()
        });
        tasks.refresh_balance().await;

        let events = drain(&mut sub).await;
        assert_eq!(node.balance_calls(), before + 1);
        let balance = events
            .iter()
            .find(|e| e.event == WALLET_BALANCE)
            .expect("balance event");
        assert!(balance.data.contains("\"onchain_total_balance\":42"));

        tasks.stop().await;
        hub.stop().await;
    }

    #[tokio::test]
    async fn test_forward_notifications_flag() {
        let node = FakeNode::ready();
        node.push_forwards(vec![Ok(forward())]);
        let hub = Arc::new(EventHub::new());
        hub.start().await;
        let (mut sub, _) = hub.add_subscriber();
        let config = SchedulerConfig {
            enable_forward_notifications: false,
            ..SchedulerConfig::default()
        };
        let tasks = BackgroundTasks::new(config);
        tasks
            .start(node.clone(), hub.clone(), Arc::new(Snapshots::new()))
            .await
            .unwrap();

        let events = drain(&mut sub).await;
        assert!(events.iter().all(|e| e.event != LN_FORWARD_SUCCESSES));
        tasks.stop().await;

        let tasks = BackgroundTasks::new(SchedulerConfig::default());
        tasks
            .start(node, hub.clone(), Arc::new(Snapshots::new()))
            .await
            .unwrap();
        let events = drain(&mut sub).await;
        assert!(events.iter().any(|e| e.event == LN_FORWARD_SUCCESSES));

        tasks.stop().await;
        hub.stop().await;
    }
}
