//! Invoice and forward listeners
//!
//! Both loops reopen the backend subscription after a short delay when it
//! ends or fails with an unrecoverable error. Transient errors are already
//! retried inside the adapters and only show up here as log lines.

use super::BalanceRefresher;
use crate::events::{EventHub, LN_FORWARD_SUCCESSES, LN_INVOICE_STATUS};
use crate::node::types::InvoiceState;
use crate::node::NodeHandle;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Forwards settling together are published as one event of at most this many
const FORWARD_BATCH: usize = 64;

/// Publish every invoice update; settlements also refresh the balance
pub async fn run_invoice_listener(
    node: NodeHandle,
    hub: Arc<EventHub>,
    refresher: Arc<BalanceRefresher>,
    restart_delay: Duration,
) {
    loop {
        match node.listen_invoices().await {
            Ok(mut stream) => {
                info!("Invoice listener subscribed");
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(invoice) => {
                            debug!(
                                "Invoice {} is now {:?}",
                                invoice.payment_hash, invoice.state
                            );
                            hub.broadcast(LN_INVOICE_STATUS, &invoice);
                            if invoice.state == InvoiceState::Settled {
                                refresher.trigger();
                            }
                        }
                        Err(e) if e.is_unrecoverable() => {
                            warn!("Invoice subscription lost: {}", e);
                            break;
                        }
                        Err(e) => warn!("Invoice subscription error: {}", e),
                    }
                }
            }
            Err(e) => warn!("Failed to subscribe to invoices: {}", e),
        }

        tokio::time::sleep(restart_delay).await;
    }
}

/// Publish successful forwards in batches
pub async fn run_forward_listener(
    node: NodeHandle,
    hub: Arc<EventHub>,
    restart_delay: Duration,
) {
    loop {
        match node.listen_forward_events().await {
            Ok(stream) => {
                info!("Forward listener subscribed");
                let mut batches = stream.ready_chunks(FORWARD_BATCH);
                'stream: while let Some(batch) = batches.next().await {
                    let mut forwards = Vec::with_capacity(batch.len());
                    let mut lost = false;
                    for item in batch {
                        match item {
                            Ok(forward) => forwards.push(forward),
                            Err(e) if e.is_unrecoverable() => {
                                warn!("Forward subscription lost: {}", e);
                                lost = true;
                            }
                            Err(e) => warn!("Forward subscription error: {}", e),
                        }
                    }
                    if !forwards.is_empty() {
                        debug!("Publishing {} forwards", forwards.len());
                        hub.broadcast(LN_FORWARD_SUCCESSES, &forwards);
                    }
                    if lost {
                        break 'stream;
                    }
                }
            }
            Err(e) => warn!("Failed to subscribe to forwards: {}", e),
        }

        tokio::time::sleep(restart_delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ServerEvent, WALLET_BALANCE};
    use crate::node::testing::{invoice, FakeNode};
    use crate::node::types::{ForwardSuccessEvent, WalletBalance};
    use crate::tasks::{DiffPoller, Snapshots};
    use crate::GatewayError;

    fn refresher(node: &Arc<FakeNode>, hub: &Arc<EventHub>) -> Arc<BalanceRefresher> {
        let poller = Arc::new(DiffPoller::new(
            WALLET_BALANCE,
            hub.clone(),
            Arc::new(Snapshots::new()),
        ));
        Arc::new(BalanceRefresher::new(
            node.clone(),
            poller,
            Duration::from_millis(10),
        ))
    }

    async fn next(sub: &mut crate::events::Subscription) -> ServerEvent {
        tokio::time::timeout(Duration::from_secs(2), sub.next())
            .await
            .expect("event in time")
            .expect("stream open")
    }

    fn forward(n: u64) -> ForwardSuccessEvent {
        ForwardSuccessEvent {
            timestamp_ns: n,
            settled_ns: n + 1,
            chan_id_in: "1".to_string(),
            chan_id_out: "2".to_string(),
            amt_in_msat: 1_010,
            amt_out_msat: 1_000,
            fee_msat: 10,
        }
    }

    #[tokio::test]
    async fn test_settled_invoice_published_and_refreshes_balance() {
        let node = FakeNode::ready();
        node.set_balance(WalletBalance {
            onchain_confirmed_balance: 5,
            ..WalletBalance::default()
        });
        node.push_invoices(vec![
            Ok(invoice("1", InvoiceState::Open)),
            Ok(invoice("1", InvoiceState::Settled)),
        ]);
        let hub = Arc::new(EventHub::new());
        hub.start().await;
        let (mut sub, _) = hub.add_subscriber();

        let handle = tokio::spawn(run_invoice_listener(
            node.clone(),
            hub.clone(),
            refresher(&node, &hub),
            Duration::from_secs(5),
        ));

        let first = next(&mut sub).await;
        assert_eq!(first.event, LN_INVOICE_STATUS);
        assert!(first.data.contains("\"open\""));
        let second = next(&mut sub).await;
        assert!(second.data.contains("\"settled\""));
        let balance = next(&mut sub).await;
        assert_eq!(balance.event, WALLET_BALANCE);
        assert_eq!(node.balance_calls(), 1);

        handle.abort();
        hub.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_invoice_listener_restarts_after_unrecoverable_error() {
        let node = FakeNode::ready();
        node.push_invoices(vec![
            Err(GatewayError::Timeout("blip".to_string())),
            Err(GatewayError::Locked("wallet locked".to_string())),
        ]);
        let hub = Arc::new(EventHub::new());

        let handle = tokio::spawn(run_invoice_listener(
            node.clone(),
            hub.clone(),
            refresher(&node, &hub),
            Duration::from_secs(5),
        ));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(node.invoice_listens(), 1);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(node.invoice_listens(), 2);

        handle.abort();
    }

    #[tokio::test]
    async fn test_forwards_published_as_batch() {
        let node = FakeNode::ready();
        node.push_forwards(vec![
            Ok(forward(1)),
            Err(GatewayError::Timeout("blip".to_string())),
            Ok(forward(2)),
        ]);
        let hub = Arc::new(EventHub::new());
        hub.start().await;
        let (mut sub, _) = hub.add_subscriber();

        let handle = tokio::spawn(run_forward_listener(
            node.clone(),
            hub.clone(),
            Duration::from_secs(5),
        ));

        let event = next(&mut sub).await;
        assert_eq!(event.event, LN_FORWARD_SUCCESSES);
        let forwards: Vec<ForwardSuccessEvent> = serde_json::from_str(&event.data).unwrap();
        assert_eq!(forwards, vec![forward(1), forward(2)]);

        handle.abort();
        hub.stop().await;
    }
}
