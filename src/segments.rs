//! Regulator-segment reconciliation.
//!
//! An institution reclassified mid-history would otherwise appear under
//! two tiers. Every entity takes the segment of its most recent
//! observation, and the consolidated datasets report that resolved tier
//! for the entity's whole history.

use crate::schema::Segment;
use chrono::NaiveDate;

/// Tracks, per entity id, the segment observed at the latest period.
/// Observation order does not matter: the maximum period wins, with
/// incoming-wins tie-breaking on equal periods.
#[derive(Debug, Clone, Default)]
pub struct SegmentLedger {
    entries: Vec<Option<(NaiveDate, Segment)>>,
}

impl SegmentLedger {
    pub fn new() -> Self {
        SegmentLedger::default()
    }

    pub fn observe(&mut self, entity_id: u32, period: NaiveDate, segment: Segment) {
        let idx = entity_id as usize;
        if idx >= self.entries.len() {
            self.entries.resize(idx + 1, None);
        }
        match self.entries[idx] {
            Some((latest, _)) if period < latest => {}
            _ => self.entries[idx] = Some((period, segment)),
        }
    }

    /// The single segment this entity resolves to across its history.
    pub fn resolved(&self, entity_id: u32) -> Segment {
        self.entries
            .get(entity_id as usize)
            .and_then(|entry| entry.map(|(_, segment)| segment))
            .unwrap_or(Segment::Unknown)
    }

    /// Rebuild the ledger under a new entity-id mapping (used when the
    /// dataset re-compacts its dictionaries). `mapping[old] = Some(new)`.
    pub fn remap(&self, mapping: &[Option<u32>]) -> SegmentLedger {
        let mut out = SegmentLedger::new();
        for (old, entry) in self.entries.iter().enumerate() {
            if let (Some(Some(new_id)), Some((period, segment))) =
                (mapping.get(old), entry)
            {
                out.observe(*new_id, *period, *segment);
            }
        }
        out
    }
}
