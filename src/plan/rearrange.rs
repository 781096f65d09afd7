//! Rearrange Processor
//!
//! Permutes the dimension axes of an input stream into target order. A
//! simple permutation forwards records directly; a "misplaced" dimension is
//! one the target must iterate slower than its source position allows, and
//! those are handled by materializing the input once into a private mixed
//! store, then reading one filtered sub-stream per combination of misplaced
//! coordinates. Total emitted records equal the input record count; only the
//! traversal order differs.

use std::sync::Arc;

use tracing::trace;

use crate::area::{Area, Set};
use crate::cell::CellValue;
use crate::cube::storage::MixedStorage;
use crate::ident::{compare_keys, format_key, IdentifierType, Key, RuleId, EMPTY_KEY, NO_ID};
use crate::stream::CellStream;

struct MisplacedDimension {
    target_ordinal: usize,
    source_ordinal: usize,
    set: Arc<Set>,
    pos: usize,
}

pub struct RearrangeProcessor {
    input: Option<Box<dyn CellStream>>,
    target_area: Area,
    source_area: Area,
    /// source ordinal per target ordinal
    target_to_source: Vec<Option<usize>>,
    /// target ordinal per source ordinal
    source_to_target: Vec<Option<usize>>,
    misplaced: Vec<MisplacedDimension>,
    out_key: Key,
    storage: Option<MixedStorage>,
    cached: Option<Box<dyn CellStream>>,
    positioned: bool,
}

impl RearrangeProcessor {
    /// `dim_mapping` holds (source ordinal, target ordinal) pairs.
    pub fn new(
        input: Box<dyn CellStream>,
        dim_mapping: Vec<(u32, u32)>,
        target_area: Area,
        source_area: Area,
    ) -> Self {
        let mut target_to_source = vec![None; target_area.dim_count()];
        let mut source_to_target = vec![None; source_area.dim_count()];
        for (source, target) in &dim_mapping {
            target_to_source[*target as usize] = Some(*source as usize);
            source_to_target[*source as usize] = Some(*target as usize);
        }
        // a mapped source dimension is misplaced when an earlier mapped source
        // dimension lands on a later target ordinal
        let mut misplaced = Vec::new();
        let mut iterations = 1f64;
        for (source, target) in source_to_target.iter().enumerate() {
            let Some(target) = target else { continue };
            let crossed = source_to_target[..source]
                .iter()
                .flatten()
                .any(|earlier| target < earlier);
            if crossed {
                let set = Arc::clone(source_area.get_dim(source));
                iterations *= set.len() as f64;
                misplaced.push(MisplacedDimension {
                    target_ordinal: *target,
                    source_ordinal: source,
                    set,
                    pos: 0,
                });
            }
        }
        if !misplaced.is_empty() {
            trace!(
                iterations,
                dimensions = misplaced.len(),
                "rearrange with misplaced dimensions"
            );
        }
        RearrangeProcessor {
            input: Some(input),
            target_area,
            source_area,
            target_to_source,
            source_to_target,
            misplaced,
            out_key: Vec::new(),
            storage: None,
            cached: None,
            positioned: false,
        }
    }

    /// Materialize the input into a private store; called on first use.
    fn cache_input(&mut self) {
        self.out_key = self
            .target_area
            .path_begin()
            .unwrap_or_else(|| vec![0; self.target_area.dim_count()]);
        let storage = MixedStorage::new();
        if let Some(mut input) = self.input.take() {
            storage.set_cell_stream(&mut *input);
        }
        trace!(values = storage.values_count(), "rearrange cached input");
        self.storage = Some(storage);
    }

    /// Sub-stream over the current misplaced bucket.
    fn open_bucket(&mut self) {
        let mut select = self.source_area.clone();
        for md in &self.misplaced {
            let value = md.set.at(md.pos);
            self.out_key[md.target_ordinal] = value;
            select.insert(md.source_ordinal, Arc::new(Set::from_ids(vec![value])));
        }
        let storage = self.storage.as_ref().expect("cached before opening");
        self.cached = Some(storage.get_cell_values(&select));
    }

    /// Advance the right-most misplaced iterator, carrying leftward.
    /// False when all iterators wrapped.
    fn advance_buckets(&mut self) -> bool {
        for (offset, md) in self.misplaced.iter_mut().rev().enumerate() {
            md.pos += 1;
            if md.pos < md.set.len() {
                trace!(offset, "rearrange bucket change");
                return true;
            }
            md.pos = 0;
        }
        false
    }

    fn project(&mut self) {
        let in_key = self
            .cached
            .as_ref()
            .map(|c| c.key().to_vec())
            .unwrap_or_default();
        for (source, target) in self.source_to_target.iter().enumerate() {
            if let Some(target) = target {
                self.out_key[*target] = in_key[source];
            }
        }
    }
}

impl CellStream for RearrangeProcessor {
    fn next(&mut self) -> bool {
        if self.out_key.is_empty() {
            self.cache_input();
        }
        loop {
            if self.cached.is_none() {
                self.open_bucket();
            }
            if self.cached.as_mut().is_some_and(|c| c.next()) {
                self.project();
                self.positioned = true;
                trace!(out = %format_key(&self.out_key), "rearrange next");
                return true;
            }
            self.cached = None;
            if !self.advance_buckets() {
                trace!("no more combinations in rearrange");
                self.positioned = false;
                return false;
            }
        }
    }

    fn move_to(&mut self, key: &[IdentifierType], found: &mut bool) -> bool {
        if self.out_key.is_empty() {
            self.cache_input();
        }
        // map the target key back to source coordinates
        let mut move_to_source = vec![NO_ID; self.source_area.dim_count()];
        for (target, source) in self.target_to_source.iter().enumerate() {
            if let Some(source) = source {
                move_to_source[*source] = key[target];
            }
        }
        let mut bucket_changed = self.cached.is_none();
        for md in &mut self.misplaced {
            let new_pos = if key[md.target_ordinal] != NO_ID {
                match md.set.find(key[md.target_ordinal]) {
                    Some(pos) => pos,
                    None => {
                        // requested key outside the area
                        *found = false;
                        self.positioned = false;
                        return false;
                    }
                }
            } else {
                0
            };
            if new_pos != md.pos {
                md.pos = new_pos;
                bucket_changed = true;
            }
        }
        if bucket_changed {
            self.cached = None;
            self.open_bucket();
        }
        let mut sub_found = false;
        if !self
            .cached
            .as_mut()
            .is_some_and(|c| c.move_to(&move_to_source, &mut sub_found))
        {
            // nothing left in this bucket
            let result = self.next();
            *found = false;
            trace!(
                out = %format_key(if result { &self.out_key } else { EMPTY_KEY }),
                to = %format_key(key),
                "rearrange move"
            );
            return result;
        }
        self.project();
        self.positioned = true;
        *found = sub_found && compare_keys(&self.out_key, key) == std::cmp::Ordering::Equal;
        true
    }

    fn reset(&mut self) {
        for md in &mut self.misplaced {
            md.pos = 0;
        }
        self.cached = None;
        self.positioned = false;
    }

    fn key(&self) -> &[IdentifierType] {
        if self.positioned {
            &self.out_key
        } else {
            EMPTY_KEY
        }
    }

    fn value(&self) -> CellValue {
        self.cached
            .as_ref()
            .map_or(CellValue::Empty, |c| c.value())
    }

    fn value_f64(&self) -> f64 {
        self.cached.as_ref().map_or(0.0, |c| c.value_f64())
    }

    fn rule_id(&self) -> Option<RuleId> {
        self.cached.as_ref().and_then(|c| c.rule_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{collect_stream, VecStream};

    fn area2(d0: &[IdentifierType], d1: &[IdentifierType]) -> Area {
        Area::new(vec![
            Arc::new(Set::from_ids(d0.to_vec())),
            Arc::new(Set::from_ids(d1.to_vec())),
        ])
    }

    /// Stored (a,x)=1 (b,x)=2 (a,y)=3 read with axes swapped must emit
    /// (x,a)=1 (x,b)=2 (y,a)=3 in that exact order.
    #[test]
    fn test_axis_swap_order() {
        // source dims: D1 = {a=0, b=1}, D2 = {x=0, y=1}
        let input = VecStream::new(vec![
            (vec![0, 0], CellValue::Numeric(1.0)),
            (vec![0, 1], CellValue::Numeric(3.0)),
            (vec![1, 0], CellValue::Numeric(2.0)),
        ]);
        let source_area = area2(&[0, 1], &[0, 1]);
        let target_area = area2(&[0, 1], &[0, 1]);
        // source dim 0 -> target dim 1, source dim 1 -> target dim 0
        let mapping = vec![(0, 1), (1, 0)];
        let mut proc =
            RearrangeProcessor::new(Box::new(input), mapping, target_area, source_area);
        let out = collect_stream(&mut proc);
        assert_eq!(
            out,
            vec![
                (vec![0, 0], CellValue::Numeric(1.0)),
                (vec![0, 1], CellValue::Numeric(2.0)),
                (vec![1, 0], CellValue::Numeric(3.0)),
            ]
        );
    }

    #[test]
    fn test_record_count_preserved() {
        let records: Vec<(Key, CellValue)> = (0..3)
            .flat_map(|a| (0..4).map(move |b| (vec![a, b], CellValue::Numeric(f64::from(a * 4 + b)))))
            .collect();
        let input = VecStream::new(records.clone());
        let source_area = area2(&[0, 1, 2], &[0, 1, 2, 3]);
        let target_area = Area::new(vec![
            Arc::new(Set::from_ids(vec![0, 1, 2, 3])),
            Arc::new(Set::from_ids(vec![0, 1, 2])),
        ]);
        let mapping = vec![(0, 1), (1, 0)];
        let mut proc =
            RearrangeProcessor::new(Box::new(input), mapping, target_area, source_area);
        let out = collect_stream(&mut proc);
        assert_eq!(out.len(), records.len());
        // ascending in target order
        for w in out.windows(2) {
            assert!(compare_keys(&w[0].0, &w[1].0) == std::cmp::Ordering::Less);
        }
    }

    #[test]
    fn test_move_to_bucket_jump() {
        let input = VecStream::new(vec![
            (vec![0, 0], CellValue::Numeric(1.0)),
            (vec![0, 1], CellValue::Numeric(3.0)),
            (vec![1, 0], CellValue::Numeric(2.0)),
        ]);
        let source_area = area2(&[0, 1], &[0, 1]);
        let target_area = area2(&[0, 1], &[0, 1]);
        let mapping = vec![(0, 1), (1, 0)];
        let mut proc =
            RearrangeProcessor::new(Box::new(input), mapping, target_area, source_area);
        let mut found = false;
        assert!(proc.move_to(&[1, 0], &mut found));
        assert!(found);
        assert_eq!(proc.value(), CellValue::Numeric(3.0));
        assert!(!proc.next());
    }
}
