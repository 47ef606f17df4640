//! `GET /sse/subscribe`
//!
//! A new subscriber first receives the current snapshots (init state, node
//! info, balance, fee revenue), then live hub events in publish order.

use super::ApiState;
use crate::events::{ServerEvent, SYSTEM_STARTUP_INFO};
use crate::node::types::InitState;
use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::{Stream, StreamExt};
use std::convert::Infallible;
use std::time::Duration;
use tracing::info;

/// Reconnect delay suggested to clients
const RETRY_HINT: Duration = Duration::from_secs(3);

/// Convert a hub event to its SSE frame
pub fn to_sse_event(event: ServerEvent, first: bool) -> Event {
    let mut sse = Event::default().event(event.event).data(event.data);
    if event.id != 0 {
        sse = sse.id(event.id.to_string());
    }
    if first {
        sse = sse.retry(RETRY_HINT);
    }
    sse
}

/// Subscribe to live events
pub async fn sse_subscribe(
    State(state): State<ApiState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let hub = state.app.hub.clone();
    let (subscription, id) = hub.add_subscriber_with_replay(state.app.snapshots.replay());
    info!("SSE subscriber {} connected", id);

    // Late joiners also get the readiness summary they missed.
    if state.app.session.state() == InitState::Done {
        if let Some(event) = hub.event(
            SYSTEM_STARTUP_INFO,
            &serde_json::json!({ "lightning": "done" }),
        ) {
            hub.send_to_single(id, event);
        }
    }

    let mut first = true;
    let stream = subscription.map(move |event| {
        let sse = to_sse_event(event, first);
        first = false;
        Ok(sse)
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new().interval(Duration::from_secs(state.app.config.api.sse_ping_secs)),
    )
}

