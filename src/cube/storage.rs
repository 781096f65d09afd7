//! Sparse Cell Stores
//!
//! Two ordered stores per cube: numeric cells and string cells. The string
//! store interns each observed value in a table indexed by a monotonically
//! increasing surrogate double (1.0, 2.0, ...) so the ordered stream
//! machinery can carry string payloads. [`MixedStorage`] composes the two;
//! reads return their union in ascending key order.
//!
//! ## Snapshots
//!
//! Writers build the next version privately and publish it atomically, so a
//! running stream keeps its consistent snapshot and concurrent readers see
//! either the pre-write or post-write state, never an intermediate one.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::area::Area;
use crate::cell::CellValue;
use crate::ident::{compare_keys, IdentifierType, Key, RuleId, EMPTY_KEY};
use crate::plan::combination::CombinationProcessor;
use crate::stream::{CellStream, VecStream};

/// Stored numeric cell: the value plus the rule that produced it, if any.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StoredCell {
    pub value: f64,
    pub rule: Option<RuleId>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct StringCell {
    /// 1-based index into the interning table
    sid: u32,
    rule: Option<RuleId>,
}

type NumericMap = BTreeMap<Key, StoredCell>;

#[derive(Default)]
struct StringTable {
    map: BTreeMap<Key, StringCell>,
    interned: Vec<String>,
}

/// Write operation for area writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Set,
    Add,
}

/// One bulk edit: `Empty` deletes the cell from both stores.
pub type CellEdit = (Key, CellValue, Option<RuleId>);

/// Composed numeric + string store for one cube.
pub struct MixedStorage {
    numeric: ArcSwap<NumericMap>,
    strings: ArcSwap<StringTable>,
    /// serializes writers; readers never take it
    write: Mutex<()>,
}

impl Default for MixedStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MixedStorage {
    pub fn new() -> Self {
        MixedStorage {
            numeric: ArcSwap::from_pointee(NumericMap::new()),
            strings: ArcSwap::from_pointee(StringTable::default()),
            write: Mutex::new(()),
        }
    }

    pub fn values_count(&self) -> usize {
        self.numeric.load().len() + self.strings.load().map.len()
    }

    /// Point lookup against the current snapshots.
    pub fn get(&self, key: &[IdentifierType]) -> (CellValue, Option<RuleId>) {
        if let Some(cell) = self.numeric.load().get(key) {
            return (CellValue::Numeric(cell.value), cell.rule);
        }
        let strings = self.strings.load();
        if let Some(cell) = strings.map.get(key) {
            let value = strings
                .interned
                .get((cell.sid - 1) as usize)
                .cloned()
                .unwrap_or_default();
            return (CellValue::Str(value), cell.rule);
        }
        (CellValue::Empty, None)
    }

    /// All stored cells whose key lies in `area`, ascending key order.
    pub fn get_cell_values(&self, area: &Area) -> Box<dyn CellStream> {
        let numeric = self.numeric.load_full();
        let strings = self.strings.load_full();
        match (numeric.is_empty(), strings.map.is_empty()) {
            (true, true) => Box::new(VecStream::new(Vec::new())),
            (false, true) => Box::new(NumericStream::new(numeric, area.clone())),
            (true, false) => Box::new(StringStream::new(strings, area.clone())),
            (false, false) => Box::new(CombinationProcessor::new(vec![
                Box::new(NumericStream::new(numeric, area.clone())),
                Box::new(StringStream::new(strings, area.clone())),
            ])),
        }
    }

    /// Stored string cells only, for merging under an aggregation stream.
    pub fn get_string_values(&self, area: &Area) -> Box<dyn CellStream> {
        Box::new(StringStream::new(self.strings.load_full(), area.clone()))
    }

    /// Write a single cell; `Empty` deletes it.
    pub fn set_cell(&self, key: &[IdentifierType], value: CellValue, rule: Option<RuleId>) {
        self.apply(vec![(key.to_vec(), value, rule)]);
    }

    /// Apply a batch of edits as one atomic snapshot publication.
    pub fn apply(&self, edits: Vec<CellEdit>) {
        if edits.is_empty() {
            return;
        }
        let _guard = self.write.lock();
        let mut numeric = (**self.numeric.load()).clone();
        let old_strings = self.strings.load();
        let mut string_map = old_strings.map.clone();
        let mut interned = old_strings.interned.clone();
        drop(old_strings);

        for (key, value, rule) in edits {
            match value {
                CellValue::Numeric(v) => {
                    string_map.remove(&key);
                    numeric.insert(key, StoredCell { value: v, rule });
                }
                CellValue::Str(s) => {
                    numeric.remove(&key);
                    // interning surrogate: append-only, 1-based
                    interned.push(s);
                    let sid = interned.len() as u32;
                    string_map.insert(key, StringCell { sid, rule });
                }
                CellValue::Empty | CellValue::Error(_) => {
                    numeric.remove(&key);
                    string_map.remove(&key);
                }
            }
        }
        self.numeric.store(Arc::new(numeric));
        self.strings.store(Arc::new(StringTable {
            map: string_map,
            interned,
        }));
    }

    /// Area write. `Set` with a concrete value writes every cell of the area
    /// densely; `Set` with `Empty` clears the stored cells inside the area;
    /// `Add` adds to the stored numeric cells inside the area.
    pub fn set_area(&self, area: &Area, value: &CellValue, op: WriteOp) {
        let edits: Vec<CellEdit> = match (op, value) {
            (WriteOp::Set, CellValue::Empty) => {
                let mut stream = self.get_cell_values(area);
                let mut edits = Vec::new();
                while stream.next() {
                    edits.push((stream.key().to_vec(), CellValue::Empty, None));
                }
                edits
            }
            (WriteOp::Set, v) => area.keys().map(|k| (k, v.clone(), None)).collect(),
            (WriteOp::Add, v) => {
                let delta = v.as_f64();
                let mut stream = self.get_cell_values(area);
                let mut edits = Vec::new();
                while stream.next() {
                    if let CellValue::Numeric(old) = stream.value() {
                        edits.push((
                            stream.key().to_vec(),
                            CellValue::Numeric(old + delta),
                            None,
                        ));
                    }
                }
                edits
            }
        };
        self.apply(edits);
    }

    /// Bulk ingest from a stream. Records may arrive out of key order for
    /// either store; orderedness is tracked per store and an out-of-order
    /// store is committed wholesale at the end. Returns true when that
    /// fallback commit was needed.
    pub fn set_cell_stream(&self, stream: &mut dyn CellStream) -> bool {
        let mut edits = Vec::new();
        let mut last_num: Key = Vec::new();
        let mut last_str: Key = Vec::new();
        let mut num_ordered = true;
        let mut str_ordered = true;
        while stream.next() {
            let key = stream.key().to_vec();
            let value = stream.value();
            let (last, ordered) = if value.is_string() {
                (&mut last_str, &mut str_ordered)
            } else {
                (&mut last_num, &mut num_ordered)
            };
            if *ordered
                && !last.is_empty()
                && compare_keys(last, &key) != std::cmp::Ordering::Less
            {
                *ordered = false;
            }
            *last = key.clone();
            edits.push((key, value, stream.rule_id()));
        }
        let fallback = !num_ordered || !str_ordered;
        if fallback {
            trace!(records = edits.len(), "unordered ingest, committing at end");
        }
        self.apply(edits);
        fallback
    }

    /// Delete every cell whose coordinate at `ordinal` is one of `ids`.
    /// Used when dimension elements are deleted.
    pub fn delete_coordinate(&self, ordinal: usize, ids: &[IdentifierType]) -> usize {
        let _guard = self.write.lock();
        let mut numeric = (**self.numeric.load()).clone();
        let old_strings = self.strings.load();
        let mut string_map = old_strings.map.clone();
        let interned = old_strings.interned.clone();
        drop(old_strings);

        let before = numeric.len() + string_map.len();
        numeric.retain(|k, _| !ids.contains(&k[ordinal]));
        string_map.retain(|k, _| !ids.contains(&k[ordinal]));
        let removed = before - numeric.len() - string_map.len();

        self.numeric.store(Arc::new(numeric));
        self.strings.store(Arc::new(StringTable {
            map: string_map,
            interned,
        }));
        removed
    }

    /// Keys of the numeric store, for persistence.
    pub fn numeric_snapshot(&self) -> Arc<NumericMap> {
        self.numeric.load_full()
    }

    /// String cells as (key, value, rule) rows, for persistence.
    pub fn string_rows(&self) -> Vec<(Key, String, Option<RuleId>)> {
        let strings = self.strings.load();
        strings
            .map
            .iter()
            .map(|(k, c)| {
                (
                    k.clone(),
                    strings
                        .interned
                        .get((c.sid - 1) as usize)
                        .cloned()
                        .unwrap_or_default(),
                    c.rule,
                )
            })
            .collect()
    }
}

/// Shared cursor logic over a BTreeMap snapshot filtered by an area.
struct BTreeCursor<V: Clone> {
    snap: Arc<BTreeMap<Key, V>>,
    area: Area,
    current: Option<(Key, V)>,
    started: bool,
    exhausted: bool,
}

impl<V: Clone> BTreeCursor<V> {
    fn new(snap: Arc<BTreeMap<Key, V>>, area: Area) -> Self
    where
        V: Clone,
    {
        BTreeCursor {
            snap,
            area,
            current: None,
            started: false,
            exhausted: false,
        }
    }

    /// Find the first stored record at or above `bound` whose key is inside
    /// the area, skipping ahead with an area seek on every miss.
    fn advance(&mut self, mut bound: Bound<Key>) -> bool {
        loop {
            let found = self
                .snap
                .range((bound.clone(), Bound::Unbounded))
                .next()
                .map(|(k, v)| (k.clone(), v.clone()));
            match found {
                None => {
                    self.current = None;
                    self.exhausted = true;
                    return false;
                }
                Some((key, value)) => {
                    if self.area.contains(&key) {
                        self.current = Some((key, value));
                        return true;
                    }
                    match self.area.seek(&key) {
                        Some(target) => bound = Bound::Included(target),
                        None => {
                            self.current = None;
                            self.exhausted = true;
                            return false;
                        }
                    }
                }
            }
        }
    }

    fn next(&mut self) -> bool {
        if self.exhausted {
            return false;
        }
        let bound = if self.started {
            match &self.current {
                Some((k, _)) => Bound::Excluded(k.clone()),
                None => return false,
            }
        } else {
            self.started = true;
            match self.area.path_begin() {
                Some(begin) => Bound::Included(begin),
                None => {
                    self.exhausted = true;
                    return false;
                }
            }
        };
        self.advance(bound)
    }

    fn move_to(&mut self, key: &[IdentifierType], found: &mut bool) -> bool {
        self.started = true;
        self.exhausted = false;
        let has = self.advance(Bound::Included(key.to_vec()));
        *found = has
            && self
                .current
                .as_ref()
                .is_some_and(|(k, _)| compare_keys(k, key) == std::cmp::Ordering::Equal);
        has
    }

    fn reset(&mut self) {
        self.current = None;
        self.started = false;
        self.exhausted = false;
    }

    fn key(&self) -> &[IdentifierType] {
        match &self.current {
            Some((k, _)) => k,
            None => EMPTY_KEY,
        }
    }
}

/// Ordered stream over the numeric store.
pub struct NumericStream {
    cursor: BTreeCursor<StoredCell>,
}

impl NumericStream {
    fn new(snap: Arc<NumericMap>, area: Area) -> Self {
        NumericStream {
            cursor: BTreeCursor::new(snap, area),
        }
    }
}

impl CellStream for NumericStream {
    fn next(&mut self) -> bool {
        self.cursor.next()
    }

    fn move_to(&mut self, key: &[IdentifierType], found: &mut bool) -> bool {
        self.cursor.move_to(key, found)
    }

    fn reset(&mut self) {
        self.cursor.reset();
    }

    fn key(&self) -> &[IdentifierType] {
        self.cursor.key()
    }

    fn value(&self) -> CellValue {
        match &self.cursor.current {
            Some((_, cell)) => CellValue::Numeric(cell.value),
            None => CellValue::Empty,
        }
    }

    fn value_f64(&self) -> f64 {
        self.cursor.current.as_ref().map_or(0.0, |(_, c)| c.value)
    }

    fn rule_id(&self) -> Option<RuleId> {
        self.cursor.current.as_ref().and_then(|(_, c)| c.rule)
    }
}

/// Ordered stream over the string store. `value_f64` exposes the interning
/// surrogate.
pub struct StringStream {
    cursor: BTreeCursor<StringCell>,
    interned: Arc<StringTable>,
}

impl StringStream {
    fn new(snap: Arc<StringTable>, area: Area) -> Self {
        // the cursor walks the map; the full table is retained for lookups
        let map = Arc::new(snap.map.clone());
        StringStream {
            cursor: BTreeCursor::new(map, area),
            interned: snap,
        }
    }
}

impl CellStream for StringStream {
    fn next(&mut self) -> bool {
        self.cursor.next()
    }

    fn move_to(&mut self, key: &[IdentifierType], found: &mut bool) -> bool {
        self.cursor.move_to(key, found)
    }

    fn reset(&mut self) {
        self.cursor.reset();
    }

    fn key(&self) -> &[IdentifierType] {
        self.cursor.key()
    }

    fn value(&self) -> CellValue {
        match &self.cursor.current {
            Some((_, cell)) => CellValue::Str(
                self.interned
                    .interned
                    .get((cell.sid - 1) as usize)
                    .cloned()
                    .unwrap_or_default(),
            ),
            None => CellValue::Empty,
        }
    }

    fn value_f64(&self) -> f64 {
        self.cursor
            .current
            .as_ref()
            .map_or(0.0, |(_, c)| f64::from(c.sid))
    }

    fn rule_id(&self) -> Option<RuleId> {
        self.cursor.current.as_ref().and_then(|(_, c)| c.rule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::area::Set;
    use crate::stream::collect_stream;

    fn area2(d0: &[IdentifierType], d1: &[IdentifierType]) -> Area {
        Area::new(vec![
            Arc::new(Set::from_ids(d0.to_vec())),
            Arc::new(Set::from_ids(d1.to_vec())),
        ])
    }

    #[test]
    fn test_set_and_get() {
        let storage = MixedStorage::new();
        storage.set_cell(&[0, 1], CellValue::Numeric(5.0), None);
        storage.set_cell(&[0, 2], CellValue::Str("west".into()), None);
        assert_eq!(storage.get(&[0, 1]).0, CellValue::Numeric(5.0));
        assert_eq!(storage.get(&[0, 2]).0, CellValue::Str("west".into()));
        assert_eq!(storage.get(&[9, 9]).0, CellValue::Empty);
        assert_eq!(storage.values_count(), 2);
    }

    #[test]
    fn test_kind_switch_is_exclusive() {
        let storage = MixedStorage::new();
        storage.set_cell(&[0, 1], CellValue::Str("x".into()), None);
        storage.set_cell(&[0, 1], CellValue::Numeric(1.0), None);
        assert_eq!(storage.values_count(), 1);
        assert_eq!(storage.get(&[0, 1]).0, CellValue::Numeric(1.0));
    }

    #[test]
    fn test_stream_union_in_key_order() {
        let storage = MixedStorage::new();
        storage.set_cell(&[1, 0], CellValue::Numeric(1.0), None);
        storage.set_cell(&[0, 1], CellValue::Str("s".into()), None);
        storage.set_cell(&[2, 0], CellValue::Numeric(2.0), None);
        let area = area2(&[0, 1, 2], &[0, 1]);
        let mut stream = storage.get_cell_values(&area);
        let out = collect_stream(&mut *stream);
        let keys: Vec<_> = out.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec![vec![0, 1], vec![1, 0], vec![2, 0]]);
    }

    #[test]
    fn test_area_filter_skips_outside() {
        let storage = MixedStorage::new();
        for d0 in 0..4 {
            for d1 in 0..4 {
                storage.set_cell(&[d0, d1], CellValue::Numeric(f64::from(d0 * 10 + d1)), None);
            }
        }
        let area = area2(&[1, 3], &[0, 2]);
        let mut stream = storage.get_cell_values(&area);
        let out = collect_stream(&mut *stream);
        let keys: Vec<_> = out.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(
            keys,
            vec![vec![1, 0], vec![1, 2], vec![3, 0], vec![3, 2]]
        );
    }

    #[test]
    fn test_move_to_seeks() {
        let storage = MixedStorage::new();
        storage.set_cell(&[0, 0], CellValue::Numeric(1.0), None);
        storage.set_cell(&[1, 1], CellValue::Numeric(2.0), None);
        let area = area2(&[0, 1], &[0, 1]);
        let mut stream = storage.get_cell_values(&area);
        let mut found = false;
        assert!(stream.move_to(&[0, 1], &mut found));
        assert!(!found);
        assert_eq!(stream.key(), &[1, 1]);
    }

    #[test]
    fn test_unordered_ingest_commits() {
        let storage = MixedStorage::new();
        let mut input = VecStream::new(vec![
            (vec![0, 0], CellValue::Numeric(1.0)),
            (vec![0, 1], CellValue::Numeric(2.0)),
        ]);
        assert!(!storage.set_cell_stream(&mut input));

        // a second pass with keys below the first is out of order overall,
        // but each call tracks its own order; force disorder inside one call
        struct Unordered {
            records: Vec<(Key, CellValue)>,
            pos: Option<usize>,
        }
        impl CellStream for Unordered {
            fn next(&mut self) -> bool {
                let next = self.pos.map_or(0, |p| p + 1);
                self.pos = Some(next);
                next < self.records.len()
            }
            fn reset(&mut self) {
                self.pos = None;
            }
            fn key(&self) -> &[IdentifierType] {
                match self.pos {
                    Some(p) if p < self.records.len() => &self.records[p].0,
                    _ => EMPTY_KEY,
                }
            }
            fn value(&self) -> CellValue {
                match self.pos {
                    Some(p) if p < self.records.len() => self.records[p].1.clone(),
                    _ => CellValue::Empty,
                }
            }
            fn value_f64(&self) -> f64 {
                self.value().as_f64()
            }
        }
        let mut unordered = Unordered {
            records: vec![
                (vec![2, 0], CellValue::Numeric(3.0)),
                (vec![1, 0], CellValue::Numeric(4.0)),
            ],
            pos: None,
        };
        assert!(storage.set_cell_stream(&mut unordered));
        assert_eq!(storage.get(&[1, 0]).0, CellValue::Numeric(4.0));
        assert_eq!(storage.values_count(), 4);
    }

    #[test]
    fn test_delete_coordinate() {
        let storage = MixedStorage::new();
        storage.set_cell(&[0, 0], CellValue::Numeric(1.0), None);
        storage.set_cell(&[1, 0], CellValue::Numeric(2.0), None);
        storage.set_cell(&[1, 1], CellValue::Str("x".into()), None);
        let removed = storage.delete_coordinate(0, &[1]);
        assert_eq!(removed, 2);
        assert_eq!(storage.values_count(), 1);
    }
}
