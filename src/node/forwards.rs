//! Forward event bookkeeping
//!
//! Two shapes of backend are handled here:
//!
//! - backends that report a forward's start and its settlement as separate
//!   HTLC events ([`ForwardCorrelator`])
//! - backends with no forward subscription at all, which are polled and
//!   diffed ([`ForwardListDiff`])
//!
//! Fee revenue windows are summed from the settled forwarding history by
//! [`fee_revenue`].

use super::types::{FeeRevenue, ForwardSuccessEvent};
use std::collections::HashMap;
use tracing::{debug, trace};

/// Identifies an HTLC by the channel it arrived on and its index there
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HtlcKey {
    /// Incoming channel id
    pub chan_id_in: String,
    /// Incoming HTLC index
    pub htlc_id_in: u64,
}

/// What happened to a forwarded HTLC
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HtlcEventKind {
    /// Forward started
    Forward {
        /// Amount received (msat)
        amt_in_msat: u64,
        /// Amount sent on (msat)
        amt_out_msat: u64,
    },
    /// Preimage came back; forward complete
    Settle,
    /// Forward failed downstream or on our link
    Fail,
}

/// One HTLC event from the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HtlcEvent {
    /// Correlation key
    pub key: HtlcKey,
    /// Outgoing channel id
    pub chan_id_out: String,
    /// Event time (ns)
    pub timestamp_ns: u64,
    /// What happened
    pub kind: HtlcEventKind,
}

#[derive(Debug, Clone)]
struct PendingForward {
    chan_id_out: String,
    timestamp_ns: u64,
    amt_in_msat: u64,
    amt_out_msat: u64,
}

/// Pairs forward-start events with their settlement
#[derive(Debug, Default)]
pub struct ForwardCorrelator {
    pending: HashMap<HtlcKey, PendingForward>,
}

impl ForwardCorrelator {
    /// Empty correlator
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one event; returns a success once a started forward settles.
    /// Entries are evicted on settlement and on failure.
    pub fn observe(&mut self, event: HtlcEvent) -> Option<ForwardSuccessEvent> {
        match event.kind {
            HtlcEventKind::Forward {
                amt_in_msat,
                amt_out_msat,
            } => {
                trace!("Forward started on {:?}", event.key);
                self.pending.insert(
                    event.key,
                    PendingForward {
                        chan_id_out: event.chan_id_out,
                        timestamp_ns: event.timestamp_ns,
                        amt_in_msat,
                        amt_out_msat,
                    },
                );
                None
            }
            HtlcEventKind::Settle => {
                let Some(started) = self.pending.remove(&event.key) else {
                    // Started before we subscribed; amounts are unknown.
                    debug!("Settle for untracked HTLC {:?}", event.key);
                    return None;
                };
                Some(ForwardSuccessEvent {
                    timestamp_ns: started.timestamp_ns,
                    settled_ns: event.timestamp_ns,
                    chan_id_in: event.key.chan_id_in,
                    chan_id_out: started.chan_id_out,
                    amt_in_msat: started.amt_in_msat,
                    amt_out_msat: started.amt_out_msat,
                    fee_msat: started.amt_in_msat.saturating_sub(started.amt_out_msat),
                })
            }
            HtlcEventKind::Fail => {
                if self.pending.remove(&event.key).is_some() {
                    debug!("Forward failed on {:?}", event.key);
                }
                None
            }
        }
    }

    /// Forwards started but not yet resolved
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Emits only the newly appended suffix of a polled list
#[derive(Debug, Default)]
pub struct ForwardListDiff {
    seen: Option<usize>,
}

impl ForwardListDiff {
    /// Fresh diff; the first observed list only sets the baseline
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries appended since the last call. A shrunk list resets the
    /// baseline without emitting anything.
    pub fn diff<T>(&mut self, mut current: Vec<T>) -> Vec<T> {
        let len = current.len();
        let new_items = match self.seen {
            None => Vec::new(),
            Some(seen) if len > seen => current.split_off(seen),
            Some(seen) if len < seen => {
                debug!("Forward list shrank from {} to {}, resetting baseline", seen, len);
                Vec::new()
            }
            Some(_) => Vec::new(),
        };
        self.seen = Some(len);
        new_items
    }
}

const DAY: i64 = 24 * 60 * 60;

/// Sum `(timestamp, fee_msat)` pairs into rolling windows ending at `now`
pub fn fee_revenue(forwards: impl IntoIterator<Item = (i64, u64)>, now: i64) -> FeeRevenue {
    let mut revenue = FeeRevenue::default();
    for (timestamp, fee) in forwards {
        let age = now - timestamp;
        if age < DAY {
            revenue.day += fee;
        }
        if age < 7 * DAY {
            revenue.week += fee;
        }
        if age < 30 * DAY {
            revenue.month += fee;
        }
        if age < 365 * DAY {
            revenue.year += fee;
        }
        revenue.total += fee;
    }
    revenue
}
