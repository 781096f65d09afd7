//! Transformation Processor
//!
//! Per-cell transformation of a child stream: scaling by a factor, dimension
//! remapping (via a rearrange wrapper), restriction to singleton targets,
//! expansion along dimensions the source does not iterate, and optional
//! per-dimension multi-map substitution.
//!
//! Every target dimension runs in one of three modes:
//!
//! - **Mapped**: 1:1 with a source dimension; the input coordinate passes
//!   through.
//! - **Singleton**: the target set holds one element; the output coordinate
//!   is fixed.
//! - **Expansion**: the target iterates a set the source does not; each input
//!   record fans out across the expansion combinations.
//!
//! Contiguous spans of expansion dimensions form "expansion ranges"; each
//! range snapshots the input key it must rewind the child to when its
//! iterators advance. The carry logic below reproduces the reference engine's
//! emission order exactly, which downstream ordered merges depend on.

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::trace;

use crate::area::{Area, Set};
use crate::cell::CellValue;
use crate::ident::{compare_keys, format_key, IdentifierType, Key, RuleId, EMPTY_KEY};
use crate::plan::rearrange::RearrangeProcessor;
use crate::plan::{create_processor, PlanNode, SetMultimap};
use crate::stream::CellStream;

struct Expansion {
    set: Arc<Set>,
    pos: usize,
}

struct ExpansionRange {
    first: usize,
    last: usize,
    /// input key to rewind to when this range advances
    snapshot: Key,
}

pub struct TransformationProcessor {
    factor: f64,
    /// (target ordinal, input ordinal) pairs for mapped dimensions
    dim_mapping: Vec<(usize, usize)>,
    /// per target dimension; `Some` marks an expansion dimension
    expansions: Vec<Option<Expansion>>,
    expansion_ranges: Vec<ExpansionRange>,
    child: Option<Box<dyn CellStream>>,
    /// child needs repositioning at `move_to_in_key`
    positioned: bool,
    out_key: Key,
    move_to_in_key: Key,
    last_in_key: Key,
    next_result: bool,
    /// deferred child construction
    builder: ChildBuilder,
}

/// Deferred child construction: the processor graph is built on first
/// `next()` or `move_to()`.
struct ChildBuilder {
    child_stream: Option<Box<dyn CellStream>>,
    dim_mapping: Vec<(u32, u32)>,
    target_area: Area,
    source_area: Area,
}

impl ChildBuilder {
    fn build(&mut self) -> Box<dyn CellStream> {
        let stream = self
            .child_stream
            .take()
            .expect("transformation child built twice");
        if self.dim_mapping.is_empty() {
            stream
        } else {
            Box::new(RearrangeProcessor::new(
                stream,
                self.dim_mapping.clone(),
                self.target_area.clone(),
                self.source_area.clone(),
            ))
        }
    }
}

impl TransformationProcessor {
    /// `raw_mapping` holds (source ordinal, target ordinal) pairs; when
    /// non-empty the child is wrapped in a rearrange processor so its keys
    /// arrive already permuted into target ordinal space.
    pub fn new(
        child: &PlanNode,
        target_area: Area,
        raw_mapping: Vec<(u32, u32)>,
        factor: f64,
    ) -> Self {
        let source_area = child.area().clone();
        let target_dims = target_area.dim_count();

        let mut target_to_source: Vec<Option<usize>> = vec![None; target_dims];
        if !raw_mapping.is_empty() {
            for (source, target) in &raw_mapping {
                target_to_source[*target as usize] = Some(*source as usize);
            }
        }

        let move_to_in_key: Key = if raw_mapping.is_empty() {
            source_area.path_begin().unwrap_or_default()
        } else {
            vec![0; target_dims]
        };

        let mut out_key = vec![0; target_dims];
        let mut dim_mapping = Vec::new();
        let mut expansions: Vec<Option<Expansion>> = Vec::with_capacity(target_dims);
        let mut expansion_ranges: Vec<ExpansionRange> = Vec::new();
        let mut last_expand = 0usize;

        for ordinal in 0..target_dims {
            let target_set = target_area.get_dim(ordinal);
            let source_set: Option<&Arc<Set>> = if !raw_mapping.is_empty() {
                target_to_source[ordinal].map(|s| source_area.get_dim(s))
            } else if target_dims == source_area.dim_count() {
                Some(source_area.get_dim(ordinal))
            } else {
                None
            };

            if target_set.len() == 1 {
                // restricted to a single element
                out_key[ordinal] = target_set.at(0);
                expansions.push(None);
            } else if source_set.is_some_and(|s| **s == **target_set) {
                // mapped 1:1 with a source dimension
                dim_mapping.push((ordinal, ordinal));
                expansions.push(None);
                last_expand = 0;
            } else if source_set.map_or(true, |s| s.len() == 1) {
                // expansion
                if last_expand == 0 {
                    expansion_ranges.push(ExpansionRange {
                        first: ordinal,
                        last: ordinal,
                        snapshot: move_to_in_key.clone(),
                    });
                } else if let Some(range) = expansion_ranges.last_mut() {
                    range.last = ordinal;
                }
                out_key[ordinal] = target_set.at(0);
                expansions.push(Some(Expansion {
                    set: Arc::clone(target_set),
                    pos: 0,
                }));
                last_expand = ordinal;
            } else {
                // N:M substitution, handled by the multi-map wrapper
                dim_mapping.push((ordinal, ordinal));
                expansions.push(None);
                last_expand = 0;
            }
        }
        if last_expand != 0 {
            if let Some(range) = expansion_ranges.last_mut() {
                range.last = target_dims - 1;
            }
        }

        let builder = ChildBuilder {
            child_stream: Some(create_processor(child)),
            dim_mapping: raw_mapping,
            target_area: target_area.clone(),
            source_area,
        };
        TransformationProcessor {
            factor,
            dim_mapping,
            expansions,
            expansion_ranges,
            child: None,
            positioned: false,
            out_key,
            move_to_in_key,
            last_in_key: Vec::new(),
            next_result: false,
            builder,
        }
    }

    fn ensure_child(&mut self) {
        if self.child.is_none() {
            self.child = Some(self.builder.build());
        }
    }

    pub(crate) fn next_impl(&mut self) -> bool {
        'restart: loop {
            let mut new_start = false;
            let has_next;
            if !self.positioned {
                self.ensure_child();
                let child = self.child.as_mut().expect("built above");
                child.reset();
                let mut found = false;
                has_next = child.move_to(&self.move_to_in_key, &mut found);
                if has_next && !found {
                    self.move_to_in_key = child.key().to_vec();
                }
                self.last_in_key.clear();
                self.positioned = true;
                new_start = true;
            } else {
                has_next = self.child.as_mut().is_some_and(|c| c.next());
            }

            if !has_next && new_start {
                self.next_result = false;
                return false;
            }

            let mut next_move_first_dim = self.out_key.len();
            let in_key: Option<Key> = if has_next {
                let key = self
                    .child
                    .as_ref()
                    .map(|c| c.key().to_vec())
                    .unwrap_or_default();
                let compare_to = if self.last_in_key.is_empty() {
                    &self.move_to_in_key
                } else {
                    &self.last_in_key
                };
                for dim in 0..key.len().min(compare_to.len()) {
                    if key[dim] != compare_to[dim] {
                        next_move_first_dim = dim;
                        break;
                    }
                }
                Some(key)
            } else {
                next_move_first_dim = 0;
                None
            };

            // advance every expansion range starting at or after the first
            // changed input dimension, in reverse dimension order
            let first_range = self
                .expansion_ranges
                .iter()
                .position(|r| next_move_first_dim <= r.first);
            if let Some(first_range) = first_range {
                let mut range_idx = self.expansion_ranges.len() - 1;
                loop {
                    let (range_first, range_last) = {
                        let r = &self.expansion_ranges[range_idx];
                        (r.first, r.last)
                    };
                    let mut dim = range_last as isize;
                    while dim >= range_first as isize {
                        let d = dim as usize;
                        if let Some(exp) = self.expansions[d].as_mut() {
                            exp.pos += 1;
                            if exp.pos >= exp.set.len() {
                                exp.pos = 0;
                                self.out_key[d] = exp.set.at(0);
                                if d == 0 {
                                    self.next_result = false;
                                    return false;
                                }
                                // carry continues leftward
                            } else {
                                // successful advance: rewind the child to the
                                // range's snapshot and restart
                                self.out_key[d] = exp.set.at(exp.pos);
                                self.move_to_in_key =
                                    self.expansion_ranges[range_idx].snapshot.clone();
                                for later in range_idx + 1..self.expansion_ranges.len() {
                                    self.expansion_ranges[later].snapshot =
                                        self.move_to_in_key.clone();
                                }
                                self.positioned = false;
                                continue 'restart;
                            }
                        }
                        dim -= 1;
                    }
                    if range_idx == first_range {
                        break;
                    }
                    range_idx -= 1;
                }
                if !has_next {
                    self.next_result = false;
                    return false;
                }
                // every relevant range wrapped completely: continue with the
                // current input record and re-anchor the snapshots on it
                let in_key_ref = in_key.as_ref().expect("has_next implies a record");
                self.move_to_in_key = in_key_ref.clone();
                for later in first_range..self.expansion_ranges.len() {
                    self.expansion_ranges[later].snapshot = in_key_ref.clone();
                }
            }

            if !has_next {
                self.next_result = false;
                return false;
            }
            let in_key = in_key.expect("has_next implies a record");
            for (target, source) in &self.dim_mapping {
                self.out_key[*target] = in_key[*source];
            }
            self.last_in_key = in_key;
            self.next_result = true;
            return true;
        }
    }

    pub(crate) fn move_impl(&mut self, key: &[IdentifierType], found: &mut bool) -> bool {
        // already at or past the requested key?
        let mut first_output_change = key.len();
        if self.next_result {
            let mut diff = 0i32;
            for i in 0..key.len() {
                match self.out_key[i].cmp(&key[i]) {
                    Ordering::Less => {
                        diff = -1;
                        first_output_change = i;
                        break;
                    }
                    Ordering::Greater => {
                        diff = 1;
                        first_output_change = i;
                        break;
                    }
                    Ordering::Equal => {}
                }
            }
            if diff >= 0 {
                *found = diff == 0;
                trace!(out = %format_key(&self.out_key), to = %format_key(key), "transformation move (stationary)");
                return true;
            }
        }

        // new start position for the input
        let mut next_move_in = self.move_to_in_key.clone();
        let mut first_src_dim = key.len();
        for (target, source) in &self.dim_mapping {
            next_move_in[*source] = key[*target];
            first_src_dim = first_src_dim.min(*target);
        }
        let moving_back = !self.last_in_key.is_empty()
            && compare_keys(&next_move_in, &self.last_in_key) == Ordering::Less;

        self.ensure_child();
        if moving_back {
            if let Some(child) = self.child.as_mut() {
                child.reset();
            }
        }
        self.positioned = true;
        let mut input_found = false;
        let has_input = self
            .child
            .as_mut()
            .is_some_and(|c| c.move_to(&next_move_in, &mut input_found));

        if has_input {
            let found_in_key = self
                .child
                .as_ref()
                .map(|c| c.key().to_vec())
                .unwrap_or_default();

            // rewind range snapshots at or after the first changed output dim
            if let Some(pos) = self
                .expansion_ranges
                .iter()
                .position(|r| first_output_change <= r.first)
            {
                self.move_to_in_key = self.expansion_ranges[pos].snapshot.clone();
                for later in pos + 1..self.expansion_ranges.len() {
                    self.expansion_ranges[later].snapshot = self.move_to_in_key.clone();
                }
            }

            self.last_in_key = found_in_key.clone();
            let mut first_output_change = key.len();
            for (target, source) in &self.dim_mapping {
                if found_in_key[*source] != key[*target] {
                    first_output_change = first_output_change.min(*target);
                }
                self.out_key[*target] = found_in_key[*source];
            }

            for target_dim in 0..key.len() {
                if let Some(exp) = self.expansions[target_dim].as_mut() {
                    if target_dim <= first_output_change {
                        match exp.set.find(key[target_dim]) {
                            Some(pos) => exp.pos = pos,
                            None => {
                                // requested key outside the area
                                *found = false;
                                self.next_result = false;
                                return false;
                            }
                        }
                        self.out_key[target_dim] = key[target_dim];
                    } else {
                        exp.pos = 0;
                        self.out_key[target_dim] = exp.set.at(0);
                    }
                }
            }
            *found = compare_keys(&self.out_key, key) == Ordering::Equal;
            self.next_result = true;
            trace!(out = %format_key(&self.out_key), to = %format_key(key), "transformation move");
            true
        } else {
            *found = false;
            if !self.expansion_ranges.is_empty() && self.expansion_ranges[0].first < first_src_dim {
                let (range_first, range_last) = {
                    let r = &self.expansion_ranges[0];
                    (r.first, r.last)
                };
                let mut dim = range_first;
                while dim <= range_last {
                    if let Some(exp) = self.expansions[dim].as_mut() {
                        match exp.set.find(key[dim]) {
                            Some(pos) => exp.pos = pos,
                            None => {
                                self.next_result = false;
                                return false;
                            }
                        }
                        self.out_key[dim] = exp.set.at(exp.pos);
                    }
                    dim += 1;
                }
                while dim < self.out_key.len() {
                    if let Some(exp) = self.expansions[dim].as_mut() {
                        exp.pos = 0;
                        self.out_key[dim] = exp.set.at(0);
                    }
                    dim += 1;
                }
                let mut expand_dim = range_last as isize;
                while expand_dim >= 0 {
                    let d = expand_dim as usize;
                    if let Some(exp) = self.expansions[d].as_mut() {
                        exp.pos += 1;
                        if exp.pos >= exp.set.len() {
                            exp.pos = 0;
                            self.out_key[d] = exp.set.at(0);
                            if d == 0 {
                                break;
                            }
                        } else {
                            self.move_to_in_key = self.expansion_ranges[0].snapshot.clone();
                            for later in 1..self.expansion_ranges.len() {
                                self.expansion_ranges[later].snapshot =
                                    self.move_to_in_key.clone();
                            }
                            self.out_key[d] = exp.set.at(exp.pos);
                            self.positioned = false;
                            let result = self.next_impl();
                            trace!(
                                out = %format_key(if result { &self.out_key } else { EMPTY_KEY }),
                                to = %format_key(key),
                                "transformation move (bucket advance)"
                            );
                            return result;
                        }
                    }
                    expand_dim -= 1;
                }
            }
            self.next_result = false;
            trace!(to = %format_key(key), "transformation move (end)");
            false
        }
    }

    pub(crate) fn current_out_key(&self) -> &[IdentifierType] {
        if self.next_result {
            &self.out_key
        } else {
            EMPTY_KEY
        }
    }

    pub(crate) fn out_key_mut(&mut self) -> &mut Key {
        &mut self.out_key
    }

    pub(crate) fn child_value(&self) -> CellValue {
        match (&self.child, self.next_result) {
            (Some(child), true) => child.value(),
            _ => CellValue::Empty,
        }
    }

    pub(crate) fn child_rule_id(&self) -> Option<RuleId> {
        self.child.as_ref().and_then(|c| c.rule_id())
    }
}

impl CellStream for TransformationProcessor {
    fn next(&mut self) -> bool {
        self.next_impl()
    }

    fn move_to(&mut self, key: &[IdentifierType], found: &mut bool) -> bool {
        self.move_impl(key, found)
    }

    fn reset(&mut self) {
        if let Some(child) = self.child.as_mut() {
            child.reset();
        }
        self.positioned = false;
        self.next_result = false;
    }

    fn key(&self) -> &[IdentifierType] {
        self.current_out_key()
    }

    fn value(&self) -> CellValue {
        let value = self.child_value();
        if (self.factor - 1.0).abs() < f64::EPSILON {
            value
        } else {
            value.scaled(self.factor)
        }
    }

    fn value_f64(&self) -> f64 {
        self.value().as_f64()
    }

    fn rule_id(&self) -> Option<RuleId> {
        self.child_rule_id()
    }
}

// ----------------------------------------------------------------------
// Multi-map substitution
// ----------------------------------------------------------------------

struct MapOperation {
    dim: usize,
    targets: Vec<IdentifierType>,
    idx: usize,
}

/// Transformation with per-dimension multi-map substitution: a single input
/// record fans out into one output record per combination of substituted
/// coordinates. Source ids absent from a dimension's map pass through
/// unchanged.
pub struct TransformationMapProcessor {
    base: TransformationProcessor,
    multi_maps: Vec<Option<Arc<SetMultimap>>>,
    ops: Vec<MapOperation>,
}

impl TransformationMapProcessor {
    pub fn new(
        base: TransformationProcessor,
        multi_maps: Vec<Option<Arc<SetMultimap>>>,
    ) -> Self {
        TransformationMapProcessor {
            base,
            multi_maps,
            ops: Vec::new(),
        }
    }

    fn build_ops(&mut self) {
        self.ops.clear();
        let key = self.base.current_out_key().to_vec();
        for (dim, map) in self.multi_maps.iter().enumerate() {
            let Some(map) = map else { continue };
            let source_id = key[dim];
            let Some(targets) = map.get(&source_id) else {
                continue;
            };
            self.base.out_key_mut()[dim] = targets[0];
            if targets.len() > 1 {
                self.ops.push(MapOperation {
                    dim,
                    targets: targets.clone(),
                    idx: 0,
                });
            }
        }
    }

    /// Advance the substitution odometer, highest dimension fastest.
    fn advance_ops(&mut self) -> bool {
        for op in self.ops.iter_mut().rev() {
            op.idx += 1;
            if op.idx < op.targets.len() {
                return true;
            }
            op.idx = 0;
        }
        false
    }

    fn apply_ops(&mut self) {
        let substitutions: Vec<(usize, IdentifierType)> = self
            .ops
            .iter()
            .map(|op| (op.dim, op.targets[op.idx]))
            .collect();
        for (dim, id) in substitutions {
            self.base.out_key_mut()[dim] = id;
        }
    }
}

impl CellStream for TransformationMapProcessor {
    fn next(&mut self) -> bool {
        loop {
            if self.ops.is_empty() {
                if !self.base.next_impl() {
                    return false;
                }
                self.build_ops();
                self.apply_ops();
                return true;
            }
            if self.advance_ops() {
                self.apply_ops();
                return true;
            }
            self.ops.clear();
        }
    }

    fn reset(&mut self) {
        self.base.reset();
        self.ops.clear();
    }

    fn key(&self) -> &[IdentifierType] {
        self.base.current_out_key()
    }

    fn value(&self) -> CellValue {
        self.base.value()
    }

    fn value_f64(&self) -> f64 {
        self.base.value_f64()
    }

    fn rule_id(&self) -> Option<RuleId> {
        self.base.child_rule_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cube::storage::MixedStorage;
    use crate::stream::collect_stream;

    fn set(ids: &[IdentifierType]) -> Arc<Set> {
        Arc::new(Set::from_ids(ids.to_vec()))
    }

    fn source_node(cells: &[(&[IdentifierType], f64)], area: Area) -> PlanNode {
        let storage = Arc::new(MixedStorage::new());
        for (key, value) in cells {
            storage.set_cell(key, CellValue::Numeric(*value), None);
        }
        PlanNode::Source { storage, area }
    }

    #[test]
    fn test_identity_with_factor() {
        let area = Area::new(vec![set(&[0, 1, 2])]);
        let child = source_node(&[(&[0], 1.0), (&[2], 3.0)], area.clone());
        let mut proc = TransformationProcessor::new(&child, area, Vec::new(), 2.0);
        let out = collect_stream(&mut proc);
        assert_eq!(
            out,
            vec![
                (vec![0], CellValue::Numeric(2.0)),
                (vec![2], CellValue::Numeric(6.0)),
            ]
        );
    }

    #[test]
    fn test_singleton_restriction() {
        // source over one dim; target fixes a second dimension to id 7,
        // with the source dimension explicitly mapped onto target ordinal 0
        let source_area = Area::new(vec![set(&[0, 1])]);
        let child = source_node(&[(&[0], 1.0), (&[1], 2.0)], source_area);
        let target_area = Area::new(vec![set(&[0, 1]), set(&[7])]);
        let mut proc = TransformationProcessor::new(&child, target_area, vec![(0, 0)], 1.0);
        let out = collect_stream(&mut proc);
        assert_eq!(
            out,
            vec![
                (vec![0, 7], CellValue::Numeric(1.0)),
                (vec![1, 7], CellValue::Numeric(2.0)),
            ]
        );
    }

    #[test]
    fn test_expansion_fans_out() {
        // single source cell expands across a two-element target dimension
        let source_area = Area::new(vec![set(&[5]), set(&[0, 1])]);
        let child = source_node(&[(&[5, 0], 1.0), (&[5, 1], 2.0)], source_area);
        let target_area = Area::new(vec![set(&[10, 20]), set(&[0, 1])]);
        let mut proc = TransformationProcessor::new(&child, target_area, Vec::new(), 1.0);
        let out = collect_stream(&mut proc);
        assert_eq!(
            out,
            vec![
                (vec![10, 0], CellValue::Numeric(1.0)),
                (vec![10, 1], CellValue::Numeric(2.0)),
                (vec![20, 0], CellValue::Numeric(1.0)),
                (vec![20, 1], CellValue::Numeric(2.0)),
            ]
        );
    }

    #[test]
    fn test_trailing_expansion() {
        // expansion in the last dimension: each input record fans out in place
        let source_area = Area::new(vec![set(&[0, 1]), set(&[9])]);
        let child = source_node(&[(&[0, 9], 1.0), (&[1, 9], 2.0)], source_area);
        let target_area = Area::new(vec![set(&[0, 1]), set(&[3, 4])]);
        let mut proc = TransformationProcessor::new(&child, target_area, Vec::new(), 1.0);
        let out = collect_stream(&mut proc);
        assert_eq!(
            out,
            vec![
                (vec![0, 3], CellValue::Numeric(1.0)),
                (vec![0, 4], CellValue::Numeric(1.0)),
                (vec![1, 3], CellValue::Numeric(2.0)),
                (vec![1, 4], CellValue::Numeric(2.0)),
            ]
        );
    }

    #[test]
    fn test_move_to_inside_expansion() {
        let source_area = Area::new(vec![set(&[5]), set(&[0, 1])]);
        let child = source_node(&[(&[5, 0], 1.0), (&[5, 1], 2.0)], source_area);
        let target_area = Area::new(vec![set(&[10, 20]), set(&[0, 1])]);
        let mut proc = TransformationProcessor::new(&child, target_area, Vec::new(), 1.0);
        let mut found = false;
        assert!(proc.move_to(&[20, 1], &mut found));
        assert!(found);
        assert_eq!(proc.value(), CellValue::Numeric(2.0));
        assert!(!proc.next());
    }

    #[test]
    fn test_multi_map_fan_out() {
        let area = Area::new(vec![set(&[0, 1])]);
        let child = source_node(&[(&[0], 1.0), (&[1], 5.0)], area.clone());
        let mut map = SetMultimap::new();
        map.insert(0, vec![100, 200]);
        let target_area = Area::new(vec![set(&[1, 100, 200])]);
        let base = TransformationProcessor::new(&child, target_area, Vec::new(), 1.0);
        let mut proc = TransformationMapProcessor::new(base, vec![Some(Arc::new(map))]);
        let out = collect_stream(&mut proc);
        assert_eq!(
            out,
            vec![
                (vec![100], CellValue::Numeric(1.0)),
                (vec![200], CellValue::Numeric(1.0)),
                (vec![1], CellValue::Numeric(5.0)),
            ]
        );
    }
}
