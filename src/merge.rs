//! Incremental merge into a consolidated dataset.
//!
//! Identifier columns are dictionary-encoded so memory stays proportional
//! to distinct entities and account codes, not to row count; the
//! historical datasets run to tens of millions of rows. The merge key is
//! `(entity, code, period)`; incoming rows replace existing ones, which is
//! what makes reprocessing a corrected period idempotent.

use crate::schema::{IndicatorValue, PygValue, Segment};
use crate::segments::SegmentLedger;
use chrono::NaiveDate;
use log::{debug, warn};
use std::collections::{BTreeMap, HashMap};

/// Equality over the filed portion of a row value. Derived columns are
/// recomputed after every merge, so a replacement only counts as a
/// conflict when the figures the regulator actually filed differ.
pub trait Filed {
    fn same_filing(&self, other: &Self) -> bool;
}

impl Filed for f64 {
    fn same_filing(&self, other: &Self) -> bool {
        self == other
    }
}

impl Filed for PygValue {
    // Only the cumulative is filed; monthly and trailing are derived.
    fn same_filing(&self, other: &Self) -> bool {
        self.cumulative == other.cumulative
    }
}

impl Filed for IndicatorValue {
    fn same_filing(&self, other: &Self) -> bool {
        self == other
    }
}

/// Interned string table for a bounded-cardinality column.
#[derive(Debug, Clone, Default)]
pub struct Dictionary {
    values: Vec<String>,
    index: HashMap<String, u32>,
}

impl Dictionary {
    pub fn new() -> Self {
        Dictionary::default()
    }

    pub fn intern(&mut self, value: &str) -> u32 {
        if let Some(&id) = self.index.get(value) {
            return id;
        }
        let id = self.values.len() as u32;
        self.values.push(value.to_string());
        self.index.insert(value.to_string(), id);
        id
    }

    pub fn get(&self, id: u32) -> &str {
        &self.values[id as usize]
    }

    pub fn id_of(&self, value: &str) -> Option<u32> {
        self.index.get(value).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.values.iter().map(String::as_str)
    }
}

pub type RowKey = (u32, u32, NaiveDate);

/// A canonicalized row headed for the dataset.
#[derive(Debug, Clone)]
pub struct NewRow<V> {
    pub entity: String,
    pub segment: Segment,
    pub period: NaiveDate,
    pub code: String,
    pub value: V,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub inserted: usize,
    pub replaced: usize,
    /// Replacements whose value differed from what was already stored;
    /// logged for audit, resolved incoming-wins.
    pub conflicting: usize,
}

impl MergeStats {
    pub fn total(&self) -> usize {
        self.inserted + self.replaced
    }
}

/// One consolidated dataset: dictionary-encoded identifiers, a segment
/// ledger, and the rows keyed by `(entity_id, code_id, period)`.
#[derive(Debug, Clone, Default)]
pub struct Dataset<V> {
    entities: Dictionary,
    codes: Dictionary,
    segments: SegmentLedger,
    rows: BTreeMap<RowKey, V>,
}

/// A row as collaborators see it: resolved segment, decoded identifiers.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRow<'a, V> {
    pub entity: &'a str,
    pub segment: Segment,
    pub code: &'a str,
    pub period: NaiveDate,
    pub value: &'a V,
}

impl<V> Dataset<V> {
    pub fn new() -> Self {
        Dataset {
            entities: Dictionary::new(),
            codes: Dictionary::new(),
            segments: SegmentLedger::new(),
            rows: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn contains_entity(&self, entity: &str) -> bool {
        self.entities.id_of(entity).is_some()
    }

    pub fn entity_names(&self) -> impl Iterator<Item = &str> {
        self.entities.iter()
    }

    pub fn latest_period(&self) -> Option<NaiveDate> {
        self.rows.keys().map(|(_, _, period)| *period).max()
    }

    /// Merge a batch of rows, replacing on key collision.
    pub fn merge(&mut self, incoming: Vec<NewRow<V>>) -> MergeStats
    where
        V: Filed,
    {
        let mut stats = MergeStats::default();
        for row in incoming {
            let entity_id = self.entities.intern(&row.entity);
            let code_id = self.codes.intern(&row.code);
            self.segments.observe(entity_id, row.period, row.segment);

            let key = (entity_id, code_id, row.period);
            match self.rows.insert(key, row.value) {
                None => stats.inserted += 1,
                Some(previous) => {
                    stats.replaced += 1;
                    if !previous.same_filing(&self.rows[&key]) {
                        stats.conflicting += 1;
                        warn!(
                            "merge conflict for ({}, {}, {}): incoming value wins",
                            row.entity, row.code, row.period
                        );
                    }
                }
            }
        }
        debug!(
            "merged {} rows ({} new, {} replaced, {} conflicting)",
            stats.total(),
            stats.inserted,
            stats.replaced,
            stats.conflicting
        );
        stats
    }

    /// Rebuild the identifier dictionaries so they hold only values still
    /// referenced by rows. Run after merging; replaced history can leave
    /// dangling dictionary entries otherwise.
    pub fn recompact(&mut self) {
        let mut entity_map: Vec<Option<u32>> = vec![None; self.entities.len()];
        let mut code_map: Vec<Option<u32>> = vec![None; self.codes.len()];
        let mut entities = Dictionary::new();
        let mut codes = Dictionary::new();

        let old_rows = std::mem::take(&mut self.rows);
        let mut rows = BTreeMap::new();
        for ((entity_id, code_id, period), value) in old_rows {
            let new_entity = *entity_map[entity_id as usize]
                .get_or_insert_with(|| entities.intern(self.entities.get(entity_id)));
            let new_code = *code_map[code_id as usize]
                .get_or_insert_with(|| codes.intern(self.codes.get(code_id)));
            rows.insert((new_entity, new_code, period), value);
        }

        self.segments = self.segments.remap(&entity_map);
        self.entities = entities;
        self.codes = codes;
        self.rows = rows;
    }

    /// Iterate rows with decoded identifiers and the resolved segment.
    pub fn iter(&self) -> impl Iterator<Item = ResolvedRow<'_, V>> {
        self.rows.iter().map(|((entity_id, code_id, period), value)| {
            ResolvedRow {
                entity: self.entities.get(*entity_id),
                segment: self.segments.resolved(*entity_id),
                code: self.codes.get(*code_id),
                period: *period,
                value,
            }
        })
    }

    pub(crate) fn rows_mut(&mut self) -> &mut BTreeMap<RowKey, V> {
        &mut self.rows
    }

    pub(crate) fn rows(&self) -> &BTreeMap<RowKey, V> {
        &self.rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn row(entity: &str, segment: Segment, period: NaiveDate, code: &str, value: f64) -> NewRow<f64> {
        NewRow {
            entity: entity.to_string(),
            segment,
            period,
            code: code.to_string(),
            value,
        }
    }

    #[test]
    fn test_merge_inserts_and_replaces() {
        let mut ds: Dataset<f64> = Dataset::new();
        let p = date(2023, 1, 31);

        let stats = ds.merge(vec![
            row("ANDINA LTDA", Segment::One, p, "1", 100.0),
            row("ANDINA LTDA", Segment::One, p, "14", 60.0),
        ]);
        assert_eq!(stats.inserted, 2);
        assert_eq!(ds.len(), 2);

        // Reprocessing a corrected period: incoming wins.
        let stats = ds.merge(vec![row("ANDINA LTDA", Segment::One, p, "14", 61.0)]);
        assert_eq!(stats.replaced, 1);
        assert_eq!(stats.conflicting, 1);
        assert_eq!(ds.len(), 2);

        let stored: Vec<f64> = ds.iter().map(|r| *r.value).collect();
        assert!(stored.contains(&61.0));
        assert!(!stored.contains(&60.0));
    }

    #[test]
    fn test_key_uniqueness_after_merge() {
        let mut ds: Dataset<f64> = Dataset::new();
        for _ in 0..3 {
            ds.merge(vec![row("A", Segment::Two, date(2023, 1, 31), "1", 5.0)]);
        }
        assert_eq!(ds.len(), 1);

        let mut keys: Vec<(String, String, NaiveDate)> = ds
            .iter()
            .map(|r| (r.entity.to_string(), r.code.to_string(), r.period))
            .collect();
        let before = keys.len();
        keys.dedup();
        assert_eq!(keys.len(), before);
    }

    #[test]
    fn test_resolved_segment_applied_to_full_history() {
        let mut ds: Dataset<f64> = Dataset::new();
        ds.merge(vec![
            row("A", Segment::Two, date(2020, 1, 31), "1", 1.0),
            row("A", Segment::One, date(2023, 1, 31), "1", 2.0),
        ]);

        let segments: Vec<Segment> = ds.iter().map(|r| r.segment).collect();
        assert!(segments.iter().all(|s| *s == Segment::One));
    }

    #[test]
    fn test_merge_order_independence() {
        let rows = vec![
            row("A", Segment::Two, date(2020, 1, 31), "1", 1.0),
            row("B", Segment::One, date(2021, 5, 31), "14", 2.0),
            row("A", Segment::One, date(2023, 1, 31), "1", 3.0),
        ];

        let mut forward: Dataset<f64> = Dataset::new();
        forward.merge(rows.clone());
        let mut backward: Dataset<f64> = Dataset::new();
        backward.merge(rows.into_iter().rev().collect());

        let collect = |ds: &Dataset<f64>| {
            let mut v: Vec<(String, Segment, String, NaiveDate, f64)> = ds
                .iter()
                .map(|r| {
                    (
                        r.entity.to_string(),
                        r.segment,
                        r.code.to_string(),
                        r.period,
                        *r.value,
                    )
                })
                .collect();
            v.sort_by(|a, b| a.partial_cmp(b).unwrap());
            v
        };
        assert_eq!(collect(&forward), collect(&backward));
    }

    #[test]
    fn test_recompact_drops_dead_dictionary_entries() {
        let mut ds: Dataset<f64> = Dataset::new();
        ds.merge(vec![
            row("KEEP", Segment::One, date(2023, 1, 31), "1", 1.0),
            row("GONE", Segment::Two, date(2023, 1, 31), "1", 1.0),
        ]);
        // Drop GONE's only row directly, simulating replaced-out history.
        let gone_key = *ds
            .rows()
            .keys()
            .find(|(entity_id, _, _)| *entity_id == 1)
            .unwrap();
        ds.rows_mut().remove(&gone_key);

        assert_eq!(ds.entity_count(), 2);
        ds.recompact();
        assert_eq!(ds.entity_count(), 1);
        assert!(ds.contains_entity("KEEP"));
        assert!(!ds.contains_entity("GONE"));

        let rows: Vec<_> = ds.iter().map(|r| r.entity.to_string()).collect();
        assert_eq!(rows, vec!["KEEP".to_string()]);
    }
}
