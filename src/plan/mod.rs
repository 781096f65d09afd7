//! Query Plans
//!
//! A plan is a tree of nodes, each carrying its output area. Processors are
//! the streams evaluating the nodes; [`create_processor`] builds one lazily
//! from a node. Emission order is always ascending key order, which is what
//! lets aggregation and combination merge their inputs without buffering.

pub mod aggregation;
pub mod combination;
pub mod rearrange;
pub mod transformation;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::area::Area;
use crate::cell::CellValue;
use crate::cube::storage::MixedStorage;
use crate::ident::{IdentifierType, Key, RuleId};
use crate::pool::ThreadPool;
use crate::stream::{CellStream, VecStream};

use aggregation::AggregationProcessor;
use combination::CombinationProcessor;
use rearrange::RearrangeProcessor;
use transformation::{TransformationMapProcessor, TransformationProcessor};

/// Per-dimension multi-map: source id -> substituted target ids.
pub type SetMultimap = BTreeMap<IdentifierType, Vec<IdentifierType>>;

/// Per-dimension aggregation map: base id -> (target id, weight) pairs.
pub type AggregationMap = Arc<HashMap<IdentifierType, Vec<(IdentifierType, f64)>>>;

/// Evaluates one cell of a rule's target area.
pub trait KeyEvaluator: Send + Sync {
    fn evaluate(&self, key: &[IdentifierType]) -> CellValue;
}

/// One rule overlaid onto a plan: cells inside `area` are replaced by the
/// evaluator's result.
#[derive(Clone)]
pub struct RuleOverlay {
    pub rule_id: RuleId,
    pub area: Area,
    pub evaluator: Arc<dyn KeyEvaluator>,
}

/// Plan node kinds, used in cache fingerprints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Source,
    Materialized,
    Combination,
    Transformation,
    Rearrange,
    Aggregation,
    Rule,
}

/// A query plan node with its output area and children.
pub enum PlanNode {
    /// Stored cells intersected with the area.
    Source {
        storage: Arc<MixedStorage>,
        area: Area,
    },
    /// Pre-computed records, e.g. a cache hit.
    Materialized {
        records: Arc<Vec<(Key, CellValue)>>,
        area: Area,
    },
    /// Ordered merge; later children override duplicate keys.
    Combination { area: Area, children: Vec<PlanNode> },
    /// Per-cell scaling, dimension remapping, expansion, multi-mapping.
    Transformation {
        area: Area,
        child: Box<PlanNode>,
        /// (source ordinal, target ordinal) pairs; empty when axes align
        dim_mapping: Vec<(u32, u32)>,
        multi_maps: Option<Vec<Option<Arc<SetMultimap>>>>,
        factor: f64,
    },
    /// Axis permutation of the child's area into target order.
    Rearrange {
        area: Area,
        child: Box<PlanNode>,
        /// (source ordinal, target ordinal) pairs
        dim_mapping: Vec<(u32, u32)>,
    },
    /// Weighted consolidation of base cells into the target area.
    Aggregation {
        area: Area,
        child: Box<PlanNode>,
        maps: Vec<AggregationMap>,
        pool: Option<Arc<ThreadPool>>,
    },
    /// Rule cells replace underlying cells inside each overlay area.
    Rule {
        area: Area,
        child: Box<PlanNode>,
        /// ordered: first rule wins
        overlays: Vec<RuleOverlay>,
    },
}

impl PlanNode {
    pub fn area(&self) -> &Area {
        match self {
            PlanNode::Source { area, .. }
            | PlanNode::Materialized { area, .. }
            | PlanNode::Combination { area, .. }
            | PlanNode::Transformation { area, .. }
            | PlanNode::Rearrange { area, .. }
            | PlanNode::Aggregation { area, .. }
            | PlanNode::Rule { area, .. } => area,
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            PlanNode::Source { .. } => NodeKind::Source,
            PlanNode::Materialized { .. } => NodeKind::Materialized,
            PlanNode::Combination { .. } => NodeKind::Combination,
            PlanNode::Transformation { .. } => NodeKind::Transformation,
            PlanNode::Rearrange { .. } => NodeKind::Rearrange,
            PlanNode::Aggregation { .. } => NodeKind::Aggregation,
            PlanNode::Rule { .. } => NodeKind::Rule,
        }
    }
}

/// Build the processor evaluating a plan node.
pub fn create_processor(node: &PlanNode) -> Box<dyn CellStream> {
    match node {
        PlanNode::Source { storage, area } => storage.get_cell_values(area),
        PlanNode::Materialized { records, area: _ } => {
            Box::new(VecStream::new(records.as_ref().clone()))
        }
        PlanNode::Combination { children, .. } => Box::new(CombinationProcessor::new(
            children.iter().map(create_processor).collect(),
        )),
        PlanNode::Transformation {
            area,
            child,
            dim_mapping,
            multi_maps,
            factor,
        } => {
            let base = TransformationProcessor::new(
                child,
                area.clone(),
                dim_mapping.clone(),
                *factor,
            );
            match multi_maps {
                Some(maps) if maps.iter().any(Option::is_some) => {
                    Box::new(TransformationMapProcessor::new(base, maps.clone()))
                }
                _ => Box::new(base),
            }
        }
        PlanNode::Rearrange {
            area,
            child,
            dim_mapping,
        } => Box::new(RearrangeProcessor::new(
            create_processor(child),
            dim_mapping.clone(),
            area.clone(),
            child.area().clone(),
        )),
        PlanNode::Aggregation {
            area,
            child,
            maps,
            pool,
        } => Box::new(AggregationProcessor::new(
            child,
            area.clone(),
            maps.clone(),
            pool.clone(),
        )),
        PlanNode::Rule {
            child, overlays, ..
        } => {
            let mut children: Vec<Box<dyn CellStream>> = vec![create_processor(child)];
            // later combination children override earlier ones, so push the
            // overlays in reverse: the first rule ends up with priority
            for overlay in overlays.iter().rev() {
                children.push(Box::new(RuleCellStream::new(overlay.clone())));
            }
            Box::new(CombinationProcessor::new(children))
        }
    }
}

/// Stream of computed rule cells: enumerates the overlay area in key order
/// and evaluates each key, skipping cells that evaluate to empty.
pub struct RuleCellStream {
    overlay: RuleOverlay,
    positions: Vec<usize>,
    state: RuleStreamState,
    current_key: Key,
    current_value: CellValue,
}

enum RuleStreamState {
    Fresh,
    Active,
    Exhausted,
}

impl RuleCellStream {
    pub fn new(overlay: RuleOverlay) -> Self {
        let dims = overlay.area.dim_count();
        RuleCellStream {
            overlay,
            positions: vec![0; dims],
            state: RuleStreamState::Fresh,
            current_key: Vec::new(),
            current_value: CellValue::Empty,
        }
    }

    fn key_at_positions(&self) -> Key {
        self.positions
            .iter()
            .enumerate()
            .map(|(d, p)| self.overlay.area.get_dim(d).at(*p))
            .collect()
    }

    /// Advance the odometer; false on rollover past the end.
    fn step(&mut self) -> bool {
        for d in (0..self.positions.len()).rev() {
            self.positions[d] += 1;
            if self.positions[d] < self.overlay.area.get_dim(d).len() {
                return true;
            }
            self.positions[d] = 0;
        }
        false
    }

    /// Evaluate keys starting at the current odometer position until a
    /// non-empty cell is found. `include_current` evaluates the current
    /// position first.
    fn scan(&mut self, include_current: bool) -> bool {
        let mut first = include_current;
        loop {
            if !first && !self.step() {
                self.state = RuleStreamState::Exhausted;
                self.current_key.clear();
                self.current_value = CellValue::Empty;
                return false;
            }
            first = false;
            let key = self.key_at_positions();
            let value = self.overlay.evaluator.evaluate(&key);
            if !value.is_empty() {
                self.current_key = key;
                self.current_value = value;
                self.state = RuleStreamState::Active;
                return true;
            }
        }
    }
}

impl CellStream for RuleCellStream {
    fn next(&mut self) -> bool {
        match self.state {
            RuleStreamState::Exhausted => false,
            RuleStreamState::Fresh => {
                if self.overlay.area.is_empty() {
                    self.state = RuleStreamState::Exhausted;
                    return false;
                }
                self.positions.iter_mut().for_each(|p| *p = 0);
                self.scan(true)
            }
            RuleStreamState::Active => self.scan(false),
        }
    }

    fn move_to(&mut self, key: &[IdentifierType], found: &mut bool) -> bool {
        *found = false;
        let Some(target) = self.overlay.area.seek(key) else {
            self.state = RuleStreamState::Exhausted;
            self.current_key.clear();
            return false;
        };
        for (d, id) in target.iter().enumerate() {
            match self.overlay.area.get_dim(d).find(*id) {
                Some(pos) => self.positions[d] = pos,
                None => {
                    self.state = RuleStreamState::Exhausted;
                    return false;
                }
            }
        }
        let has = self.scan(true);
        *found = has && self.current_key == key;
        has
    }

    fn reset(&mut self) {
        self.state = RuleStreamState::Fresh;
        self.current_key.clear();
        self.current_value = CellValue::Empty;
    }

    fn key(&self) -> &[IdentifierType] {
        &self.current_key
    }

    fn value(&self) -> CellValue {
        self.current_value.clone()
    }

    fn value_f64(&self) -> f64 {
        self.current_value.as_f64()
    }

    fn rule_id(&self) -> Option<RuleId> {
        match self.state {
            RuleStreamState::Active => Some(self.overlay.rule_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::area::Set;
    use crate::stream::collect_stream;

    struct TimesTen;
    impl KeyEvaluator for TimesTen {
        fn evaluate(&self, key: &[IdentifierType]) -> CellValue {
            if key[0] % 2 == 0 {
                CellValue::Numeric(f64::from(key[0]) * 10.0)
            } else {
                CellValue::Empty
            }
        }
    }

    #[test]
    fn test_rule_cell_stream_skips_empty() {
        let area = Area::new(vec![Arc::new(Set::from_ids(vec![1, 2, 3, 4]))]);
        let overlay = RuleOverlay {
            rule_id: 7,
            area,
            evaluator: Arc::new(TimesTen),
        };
        let mut stream = RuleCellStream::new(overlay);
        let out = collect_stream(&mut stream);
        assert_eq!(
            out,
            vec![
                (vec![2], CellValue::Numeric(20.0)),
                (vec![4], CellValue::Numeric(40.0)),
            ]
        );
    }

    #[test]
    fn test_rule_overlay_beats_source() {
        let storage = Arc::new(MixedStorage::new());
        storage.set_cell(&[2], CellValue::Numeric(1.0), None);
        storage.set_cell(&[3], CellValue::Numeric(3.0), None);
        let area = Area::new(vec![Arc::new(Set::from_ids(vec![1, 2, 3, 4]))]);
        let node = PlanNode::Rule {
            area: area.clone(),
            child: Box::new(PlanNode::Source {
                storage,
                area: area.clone(),
            }),
            overlays: vec![RuleOverlay {
                rule_id: 1,
                area,
                evaluator: Arc::new(TimesTen),
            }],
        };
        let mut stream = create_processor(&node);
        let out = collect_stream(&mut *stream);
        assert_eq!(
            out,
            vec![
                (vec![2], CellValue::Numeric(20.0)),
                (vec![3], CellValue::Numeric(3.0)),
                (vec![4], CellValue::Numeric(40.0)),
            ]
        );
    }
}
