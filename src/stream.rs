//! Cell-Value Streams
//!
//! Ordered pull iterators over (key, value) records. Every plan processor
//! and storage reader implements [`CellStream`]; records are always emitted
//! in ascending lexicographic key order.
//!
//! ## Contract
//!
//! - `next()` advances to the next record; `false` means end of stream, after
//!   which `key()` returns the empty sentinel key.
//! - `move_to(key, found)` positions at the smallest record whose key is
//!   >= `key` and sets `found` when the keys match exactly. Returns `false`
//!   when no such record exists.
//! - `reset()` repositions before the first record.
//! - Streams are single-threaded; they are never shared across jobs.

use std::cmp::Ordering;

use crate::cell::CellValue;
use crate::error::{EngineError, Result};
use crate::ident::{compare_keys, BinKey, IdentifierType, RuleId};

/// Pull interface over ordered (key, value) records.
pub trait CellStream {
    /// Advance to the next record. False means end of stream.
    fn next(&mut self) -> bool;

    /// Position at the smallest record with key >= `key`.
    ///
    /// The default implementation scans forward with `next()`; storage-backed
    /// streams override it with an index seek.
    fn move_to(&mut self, key: &[IdentifierType], found: &mut bool) -> bool {
        *found = false;
        if !self.key().is_empty() && compare_keys(self.key(), key) != Ordering::Less {
            *found = compare_keys(self.key(), key) == Ordering::Equal;
            return true;
        }
        while self.next() {
            match compare_keys(self.key(), key) {
                Ordering::Less => {}
                Ordering::Equal => {
                    *found = true;
                    return true;
                }
                Ordering::Greater => return true,
            }
        }
        false
    }

    /// Reposition before the first record.
    fn reset(&mut self);

    /// Key of the current record; empty once the stream is exhausted.
    fn key(&self) -> &[IdentifierType];

    /// Value of the current record.
    fn value(&self) -> CellValue;

    /// Numeric reading of the current record. String cells yield their
    /// interning surrogate so the ordered machinery can carry them.
    fn value_f64(&self) -> f64;

    /// Packed bin-path of the current key, for GPU storage backends.
    fn bin_key(&self) -> Result<BinKey> {
        Err(EngineError::Unsupported("bin-path backend not built"))
    }

    /// Rule that produced the current record, if any.
    fn rule_id(&self) -> Option<RuleId> {
        None
    }
}

/// Drain a stream into a vector, mostly for tests and small materializations.
pub fn collect_stream(stream: &mut dyn CellStream) -> Vec<(Vec<IdentifierType>, CellValue)> {
    let mut out = Vec::new();
    while stream.next() {
        out.push((stream.key().to_vec(), stream.value()));
    }
    out
}

/// Stream over a pre-sorted in-memory vector of records.
///
/// Used for materialized results (aggregation output, cache hits) and as a
/// test fixture.
pub struct VecStream {
    records: Vec<(Vec<IdentifierType>, CellValue)>,
    pos: Option<usize>,
}

impl VecStream {
    /// `records` must already be in ascending key order.
    pub fn new(records: Vec<(Vec<IdentifierType>, CellValue)>) -> Self {
        debug_assert!(records
            .windows(2)
            .all(|w| compare_keys(&w[0].0, &w[1].0) == Ordering::Less));
        VecStream { records, pos: None }
    }
}

impl CellStream for VecStream {
    fn next(&mut self) -> bool {
        let next = self.pos.map_or(0, |p| p + 1);
        if next < self.records.len() {
            self.pos = Some(next);
            true
        } else {
            self.pos = Some(self.records.len());
            false
        }
    }

    fn move_to(&mut self, key: &[IdentifierType], found: &mut bool) -> bool {
        let idx = self
            .records
            .partition_point(|(k, _)| compare_keys(k, key) == Ordering::Less);
        *found = idx < self.records.len() && compare_keys(&self.records[idx].0, key) == Ordering::Equal;
        self.pos = Some(idx);
        idx < self.records.len()
    }

    fn reset(&mut self) {
        self.pos = None;
    }

    fn key(&self) -> &[IdentifierType] {
        match self.pos {
            Some(p) if p < self.records.len() => &self.records[p].0,
            _ => crate::ident::EMPTY_KEY,
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
