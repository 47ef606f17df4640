//! Event fan-out hub
//!
//! One process-wide broadcaster. Producers call [`EventHub::broadcast`],
//! which only enqueues; a dispatch task drains the queue and copies every
//! event into each subscriber's own unbounded queue, so a slow or vanished
//! subscriber never holds up the others. Subscribers unregister by dropping
//! their [`Subscription`].

use dashmap::DashMap;
use futures::Stream;
use serde::Serialize;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Init state machine transition ([`crate::node::types::InitLnRepoUpdate`])
pub const LN_INIT_STATE: &str = "ln_init_state";
/// Node info changed
pub const LN_INFO: &str = "ln_info";
/// Wallet balance changed
pub const WALLET_BALANCE: &str = "wallet_balance";
/// Fee revenue changed
pub const FEE_REVENUE: &str = "fee_revenue";
/// Invoice created, settled or canceled
pub const LN_INVOICE_STATUS: &str = "ln_invoice_status";
/// Batch of successful forwards
pub const LN_FORWARD_SUCCESSES: &str = "ln_forward_successes";
/// Readiness summary
pub const SYSTEM_STARTUP_INFO: &str = "system_startup_info";

/// One event as delivered to subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerEvent {
    /// Event name
    pub event: String,
    /// JSON payload
    pub data: String,
    /// Hub-wide sequence number
    pub id: u64,
}

type SubscriberTable = DashMap<u64, mpsc::UnboundedSender<ServerEvent>>;

/// Process-wide broadcaster
pub struct EventHub {
    queue_tx: mpsc::UnboundedSender<ServerEvent>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<ServerEvent>>>,
    subscribers: Arc<SubscriberTable>,
    next_subscriber: AtomicU64,
    next_event: AtomicU64,
    task_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    running: Arc<RwLock<bool>>,
}

impl EventHub {
    /// Create a hub; events queue up until [`EventHub::start`]
    pub fn new() -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            subscribers: Arc::new(DashMap::new()),
            next_subscriber: AtomicU64::new(1),
            next_event: AtomicU64::new(1),
            task_handle: Mutex::new(None),
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Start the dispatch task
    pub async fn start(&self) {
        let Some(mut queue_rx) = self.queue_rx.lock().await.take() else {
            warn!("Event hub already started");
            return;
        };

        info!("Starting event hub...");
        let running = self.running.clone();
        *running.write().await = true;
        let subscribers = self.subscribers.clone();

        let handle = tokio::spawn(async move {
            info!("Event dispatch task started");

            while *running.read().await {
                match tokio::time::timeout(
                    tokio::time::Duration::from_millis(100),
                    queue_rx.recv(),
                )
                .await
                {
                    Ok(Some(event)) => Self::dispatch(&subscribers, event),
                    Ok(None) => {
                        info!("Event queue closed");
                        break;
                    }
                    // Idle; check the running flag again.
                    Err(_) => continue,
                }
            }

            info!("Event dispatch task stopped");
        });

        *self.task_handle.lock().await = Some(handle);
    }

    /// Stop dispatching and end every subscription
    pub async fn stop(&self) {
        info!("Stopping event hub...");
        *self.running.write().await = false;

        if let Some(handle) = self.task_handle.lock().await.take() {
            match tokio::time::timeout(tokio::time::Duration::from_secs(5), handle).await {
                Ok(Ok(())) => info!("Event hub stopped cleanly"),
                Ok(Err(e)) => warn!("Event dispatch task panicked: {}", e),
                Err(_) => warn!("Event hub stop timed out"),
            }
        }

        self.subscribers.clear();
    }

    fn dispatch(subscribers: &SubscriberTable, event: ServerEvent) {
        let mut gone = Vec::new();
        for entry in subscribers.iter() {
            if entry.value().send(event.clone()).is_err() {
                gone.push(*entry.key());
            }
        }
        // Removal happens after iteration; removing inside would deadlock the shard.
        for id in gone {
            subscribers.remove(&id);
            debug!("Removed disconnected subscriber {}", id);
        }
    }

    /// Enqueue `payload` for every subscriber
    pub fn broadcast<T: Serialize>(&self, event: &str, payload: &T) {
        let Some(event) = self.event(event, payload) else {
            return;
        };
        if self.queue_tx.send(event).is_err() {
            debug!("Event hub queue closed, dropping event");
        }
    }

    /// Build an event with the next sequence number, or `None` if the
    /// payload does not serialize
    pub fn event<T: Serialize>(&self, event: &str, payload: &T) -> Option<ServerEvent> {
        match serde_json::to_string(payload) {
            Ok(data) => Some(ServerEvent {
                event: event.to_string(),
                data,
                id: self.next_event.fetch_add(1, Ordering::SeqCst),
            }),
            Err(e) => {
                error!("Failed to serialize {} event: {}", event, e);
                None
            }
        }
    }

    /// Register a subscriber
    pub fn add_subscriber(&self) -> (Subscription, u64) {
        self.add_subscriber_with_replay(Vec::new())
    }

    /// Register a subscriber that first receives `replay`, ahead of any
    /// live event
    pub fn add_subscriber_with_replay(&self, replay: Vec<ServerEvent>) -> (Subscription, u64) {
        let id = self.next_subscriber.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        for event in replay {
            let _ = tx.send(event);
        }
        self.subscribers.insert(id, tx);
        debug!(
            "Subscriber {} connected ({} total)",
            id,
            self.subscribers.len()
        );

        let subscription = Subscription {
            id,
            rx,
            subscribers: self.subscribers.clone(),
        };
        (subscription, id)
    }

    /// Deliver one event to one subscriber only. Returns false if the
    /// subscriber is gone.
    pub fn send_to_single(&self, subscriber_id: u64, event: ServerEvent) -> bool {
        match self.subscribers.get(&subscriber_id) {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Connected subscribers
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

/// A subscriber's event stream; unregisters itself when dropped
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<ServerEvent>,
    subscribers: Arc<SubscriberTable>,
}

impl Subscription {
    /// Subscriber id, for [`EventHub::send_to_single`]
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Stream for Subscription {
    type Item = ServerEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.subscribers.remove(&self.id);
        debug!("Subscriber {} disconnected", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;
    use std::time::Duration;

    async fn next(sub: &mut Subscription) -> ServerEvent {
        tokio::time::timeout(Duration::from_secs(2), sub.next())
            .await
            .expect("event in time")
            .expect("stream open")
    }

    #[tokio::test]
    async fn test_fan_out_in_publish_order() {
        let hub = EventHub::new();
        hub.start().await;
        let mut subs: Vec<Subscription> = (0..3).map(|_| hub.add_subscriber().0).collect();

        for n in 0..5 {
            hub.broadcast(WALLET_BALANCE, &json!({ "n": n }));
        }

        for sub in subs.iter_mut() {
            for n in 0..5 {
                let event = next(sub).await;
                assert_eq!(event.event, WALLET_BALANCE);
                assert_eq!(event.data, format!("{{\"n\":{}}}", n));
            }
        }
        hub.stop().await;
    }

    #[tokio::test]
    async fn test_dropping_one_subscriber_leaves_others() {
        let hub = EventHub::new();
        hub.start().await;
        let (mut a, _) = hub.add_subscriber();
        let (b, _) = hub.add_subscriber();
        let (mut c, _) = hub.add_subscriber();

        hub.broadcast(LN_INFO, &1);
        assert_eq!(next(&mut a).await.data, "1");
        drop(b);
        assert_eq!(hub.subscriber_count(), 2);

        hub.broadcast(LN_INFO, &2);
        assert_eq!(next(&mut a).await.data, "2");
        assert_eq!(next(&mut c).await.data, "1");
        assert_eq!(next(&mut c).await.data, "2");
        hub.stop().await;
    }

    #[test]
    fn test_dispatch_removes_closed_queues() {
        let table: SubscriberTable = DashMap::new();
        let (open_tx, mut open_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        drop(closed_rx);
        table.insert(1, open_tx);
        table.insert(2, closed_tx);

        EventHub::dispatch(
            &table,
            ServerEvent {
                event: "x".into(),
                data: "{}".into(),
                id: 1,
            },
        );

        assert_eq!(table.len(), 1);
        assert!(table.contains_key(&1));
        assert!(open_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_replay_precedes_live_events() {
        let hub = EventHub::new();
        hub.start().await;
        let snapshot = hub.event(LN_INIT_STATE, &"DONE").unwrap();
        hub.broadcast(LN_INFO, &"before");
        let (mut sub, _) = hub.add_subscriber_with_replay(vec![snapshot]);
        hub.broadcast(LN_INFO, &"after");

        let first = next(&mut sub).await;
        assert_eq!(first.event, LN_INIT_STATE);
        // "before" may or may not have been dispatched already; "after" must arrive.
        let mut rest = vec![next(&mut sub).await.data];
        if rest[0] != "\"after\"" {
            rest.push(next(&mut sub).await.data);
        }
        assert_eq!(rest.last().map(String::as_str), Some("\"after\""));
        hub.stop().await;
    }

    #[tokio::test]
    async fn test_send_to_single() {
        let hub = EventHub::new();
        let (mut a, id_a) = hub.add_subscriber();
        let (mut b, _) = hub.add_subscriber();
        let event = hub.event(FEE_REVENUE, &json!({"day": 1})).unwrap();

        assert!(hub.send_to_single(id_a, event));
        assert_eq!(next(&mut a).await.event, FEE_REVENUE);
        assert!(tokio::time::timeout(Duration::from_millis(50), b.next())
            .await
            .is_err());
        assert!(!hub.send_to_single(9_999, hub.event(FEE_REVENUE, &0).unwrap()));
    }

    #[tokio::test]
    async fn test_dispatch_survives_idle_periods() {
        let hub = EventHub::new();
        hub.start().await;
        let (mut sub, _) = hub.add_subscriber();
        tokio::time::sleep(Duration::from_millis(350)).await;
        hub.broadcast(SYSTEM_STARTUP_INFO, &"ok");
        assert_eq!(next(&mut sub).await.event, SYSTEM_STARTUP_INFO);
        hub.stop().await;
    }

    #[tokio::test]
    async fn test_stop_ends_subscriptions() {
        let hub = EventHub::new();
        hub.start().await;
        let (mut sub, _) = hub.add_subscriber();
        hub.stop().await;
        assert!(sub.next().await.is_none());
    }
}
