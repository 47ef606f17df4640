//! Last known value of every replayable event

use crate::events::ServerEvent;
use serde::Serialize;
use std::sync::Mutex;
use tracing::error;

/// Latest payload per event name, replayed to new SSE subscribers
#[derive(Default)]
pub struct Snapshots {
    events: Mutex<Vec<ServerEvent>>,
}

impl Snapshots {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember `payload` as the current value of `event`
    pub fn record<T: Serialize>(&self, event: &str, payload: &T) {
        let data = match serde_json::to_string(payload) {
            Ok(data) => data,
            Err(e) => {
                error!("Failed to serialize {} snapshot: {}", event, e);
                return;
            }
        };

        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        match events.iter_mut().find(|e| e.event == event) {
            Some(existing) => existing.data = data,
            None => events.push(ServerEvent {
                event: event.to_string(),
                data,
                // Replayed events carry no sequence number.
                id: 0,
            }),
        }
    }

    /// Every known snapshot, in first-recorded order
    pub fn replay(&self) -> Vec<ServerEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{LN_INIT_STATE, WALLET_BALANCE};

    #[test]
    fn test_record_replaces_by_name() {
        let snapshots = Snapshots::new();
        assert!(snapshots.replay().is_empty());

        snapshots.record(LN_INIT_STATE, &"OFFLINE");
        snapshots.record(WALLET_BALANCE, &1);
        snapshots.record(LN_INIT_STATE, &"DONE");

        let replay = snapshots.replay();
        assert_eq!(replay.len(), 2);
        assert_eq!(replay[0].event, LN_INIT_STATE);
        assert_eq!(replay[0].data, "\"DONE\"");
        assert_eq!(replay[1].data, "1");
        assert!(replay.iter().all(|e| e.id == 0));
    }
}
