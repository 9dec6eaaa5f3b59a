//! Identifier layer: maps between delivery-layer sequence numbers and the
//! correlation numbers visible on the wire.
//!
//! Two modes, chosen per orchestrator at construction:
//!
//! - `Shared`: the correlation id *is* the delivery id. No bookkeeping.
//! - `Distinct`: correlation ids form a strictly increasing, gap-free
//!   sequence per destination, and a `(destination, correlation) -> delivery`
//!   map is kept as part of orchestrator state. This is what the quorum
//!   composite uses so that N requests to N destinations all carry the
//!   same correlation id and therefore the same message.

use crate::Path;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CorrelationMode {
    Shared,
    Distinct,
}

/// The per-orchestrator correlation state. Serializable because it is part
/// of the snapshot; rebuilt identically by event replay otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationMap {
    mode: CorrelationMode,
    next: BTreeMap<Path, u64>,
    to_delivery: BTreeMap<Path, BTreeMap<u64, u64>>,
}

impl CorrelationMap {
    pub fn new(mode: CorrelationMode) -> Self {
        Self {
            mode,
            next: BTreeMap::new(),
            to_delivery: BTreeMap::new(),
        }
    }

    pub fn mode(&self) -> CorrelationMode {
        self.mode
    }

    /// Allocate (distinct mode) or pass through (shared mode) the
    /// correlation id for a fresh outbound delivery. Must be called exactly
    /// once per delivery; distinct-mode sequences advance as a side effect.
    pub fn delivery_to_correlation(&mut self, destination: &str, delivery_id: u64) -> u64 {
        match self.mode {
            CorrelationMode::Shared => delivery_id,
            CorrelationMode::Distinct => {
                let next = self.next.entry(destination.to_string()).or_insert(0);
                let correlation_id = *next;
                *next += 1;
                self.to_delivery
                    .entry(destination.to_string())
                    .or_default()
                    .insert(correlation_id, delivery_id);
                correlation_id
            }
        }
    }

    /// Resolve a wire correlation id back to the delivery it belongs to.
    pub fn correlation_to_delivery(&self, destination: &str, correlation_id: u64) -> Option<u64> {
        match self.mode {
            CorrelationMode::Shared => Some(correlation_id),
            CorrelationMode::Distinct => self
                .to_delivery
                .get(destination)
                .and_then(|m| m.get(&correlation_id))
                .copied(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_mode_is_identity() {
        let mut ids = CorrelationMap::new(CorrelationMode::Shared);
        assert_eq!(ids.delivery_to_correlation("a", 7), 7);
        assert_eq!(ids.correlation_to_delivery("a", 7), Some(7));
        // no state accumulates
        assert_eq!(ids.correlation_to_delivery("other", 123), Some(123));
    }

    #[test]
    fn distinct_mode_sequences_per_destination_without_gaps() {
        let mut ids = CorrelationMap::new(CorrelationMode::Distinct);
        // interleave destinations; each gets its own 0,1,2,... sequence
        assert_eq!(ids.delivery_to_correlation("a", 10), 0);
        assert_eq!(ids.delivery_to_correlation("b", 11), 0);
        assert_eq!(ids.delivery_to_correlation("a", 12), 1);
        assert_eq!(ids.delivery_to_correlation("a", 13), 2);
        assert_eq!(ids.delivery_to_correlation("b", 14), 1);

        assert_eq!(ids.correlation_to_delivery("a", 0), Some(10));
        assert_eq!(ids.correlation_to_delivery("a", 2), Some(13));
        assert_eq!(ids.correlation_to_delivery("b", 1), Some(14));
        assert_eq!(ids.correlation_to_delivery("b", 2), None);
        assert_eq!(ids.correlation_to_delivery("unknown", 0), None);
    }

    #[test]
    fn distinct_mode_round_trips_through_serde() {
        let mut ids = CorrelationMap::new(CorrelationMode::Distinct);
        ids.delivery_to_correlation("a", 1);
        ids.delivery_to_correlation("a", 2);
        let json = serde_json::to_string(&ids).unwrap();
        let restored: CorrelationMap = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, ids);
    }
}
