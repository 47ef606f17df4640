//! Interval pollers that only publish changes

use super::Snapshots;
use crate::events::EventHub;
use crate::GatewayResult;
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Compares each fetched value with the previous one and broadcasts it
/// only when it differs
pub struct DiffPoller<T> {
    event: &'static str,
    last: Mutex<Option<T>>,
    hub: Arc<EventHub>,
    snapshots: Arc<Snapshots>,
}

impl<T> DiffPoller<T>
where
    T: PartialEq + Serialize + Send + 'static,
{
    /// Poller publishing as `event`
    pub fn new(event: &'static str, hub: Arc<EventHub>, snapshots: Arc<Snapshots>) -> Self {
        Self {
            event,
            last: Mutex::new(None),
            hub,
            snapshots,
        }
    }

    /// Feed one fetch result. Returns true if it was broadcast.
    pub fn observe(&self, result: GatewayResult<T>) -> bool {
        let value = match result {
            Ok(value) => value,
            Err(e) => {
                warn!("Poll for {} failed: {}", self.event, e);
                return false;
            }
        };

        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        if last.as_ref() == Some(&value) {
            return false;
        }

        self.hub.broadcast(self.event, &value);
        self.snapshots.record(self.event, &value);
        debug!("Published changed {}", self.event);
        *last = Some(value);
        true
    }

    /// Call `fetch` every `interval`, starting immediately, until the task
    /// is aborted
    pub async fn run<F, Fut>(self: Arc<Self>, interval: Duration, fetch: F)
    where
        F: Fn() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.observe(fetch().await);
        }
    }
}
