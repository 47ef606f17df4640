//! Debounced wallet balance refresh
//!
//! Payments, on-chain sends and invoice settlements all change the balance.
//! Each of them calls [`BalanceRefresher::trigger`]; triggers arriving while
//! a refresh is already scheduled collapse into that one refresh.

use super::DiffPoller;
use crate::node::types::WalletBalance;
use crate::node::NodeHandle;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Schedules one balance fetch after a short delay
pub struct BalanceRefresher {
    node: NodeHandle,
    poller: Arc<DiffPoller<WalletBalance>>,
    delay: Duration,
    scheduled: Arc<AtomicBool>,
}

impl BalanceRefresher {
    /// Refresher feeding `poller`, so refreshed balances share the periodic
    /// poller's change detection
    pub fn new(node: NodeHandle, poller: Arc<DiffPoller<WalletBalance>>, delay: Duration) -> Self {
        Self {
            node,
            poller,
            delay,
            scheduled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Request a refresh
    pub fn trigger(&self) {
        if self.scheduled.swap(true, Ordering::SeqCst) {
            debug!("Balance refresh already scheduled");
            return;
        }

        let node = self.node.clone();
        let poller = self.poller.clone();
        let scheduled = self.scheduled.clone();
        let delay = self.delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Cleared before fetching: a trigger during the fetch may
            // reflect a change the fetch misses.
            scheduled.store(false, Ordering::SeqCst);
            poller.observe(node.get_wallet_balance().await);
        });
    }
}
