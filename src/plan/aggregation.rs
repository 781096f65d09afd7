//! Aggregation Processor
//!
//! Computes consolidated cells as weighted sums of base cells. The target
//! area may mix base and consolidated coordinates; each dimension carries a
//! map from base id to the (target id, weight) pairs it contributes to, built
//! from the dimension's weighted base-element expansion. A base record fans
//! out over the per-dimension target lists and accumulates into a hash keyed
//! by the target key; results are emitted in sorted order.
//!
//! With a thread pool attached and a plain storage source underneath, the
//! base area is split along the first dimension and partial accumulations run
//! as one pool job per slice, joined through a single thread group.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::area::{Area, Set};
use crate::cell::CellValue;
use crate::cube::storage::MixedStorage;
use crate::error::CellError;
use crate::ident::{compare_keys, IdentifierType, Key, EMPTY_KEY};
use crate::plan::{create_processor, AggregationMap, PlanNode};
use crate::pool::{Priority, ThreadPool};
use crate::stream::CellStream;

/// Maximum number of slices a parallel materialization fans out into.
const MAX_SLICES: usize = 16;

#[derive(Clone, Copy)]
enum Acc {
    Num(f64),
    Err(CellError),
}

impl Acc {
    fn add(&mut self, v: f64) {
        if let Acc::Num(total) = self {
            *total += v;
        }
    }

    fn poison(&mut self, e: CellError) {
        *self = Acc::Err(e);
    }
}

enum AggSource {
    /// generic child plan, drained single-threaded
    Stream(Option<Box<dyn CellStream>>),
    /// plain storage source, eligible for parallel slicing
    Parallel {
        storage: Arc<MixedStorage>,
        area: Area,
        pool: Arc<ThreadPool>,
    },
}

pub struct AggregationProcessor {
    maps: Vec<AggregationMap>,
    source: AggSource,
    results: Option<Vec<(Key, CellValue)>>,
    pos: Option<usize>,
}

impl AggregationProcessor {
    pub fn new(
        child: &PlanNode,
        _target_area: Area,
        maps: Vec<AggregationMap>,
        pool: Option<Arc<ThreadPool>>,
    ) -> Self {
        let source = match (child, pool) {
            (PlanNode::Source { storage, area }, Some(pool))
                if area.get_dim(0).len() > 1 =>
            {
                AggSource::Parallel {
                    storage: Arc::clone(storage),
                    area: area.clone(),
                    pool,
                }
            }
            _ => AggSource::Stream(Some(create_processor(child))),
        };
        AggregationProcessor {
            maps,
            source,
            results: None,
            pos: None,
        }
    }

    fn materialize(&mut self) {
        if self.results.is_some() {
            return;
        }
        let acc = match &mut self.source {
            AggSource::Stream(stream) => {
                let mut acc = HashMap::new();
                if let Some(mut stream) = stream.take() {
                    accumulate(&self.maps, &mut *stream, &mut acc);
                }
                acc
            }
            AggSource::Parallel {
                storage,
                area,
                pool,
            } => {
                let slices = slice_area(area, MAX_SLICES);
                trace!(slices = slices.len(), "parallel aggregation");
                let partials: Arc<Mutex<Vec<HashMap<Key, Acc>>>> =
                    Arc::new(Mutex::new(Vec::with_capacity(slices.len())));
                let group = pool.create_group();
                for slice in slices {
                    let storage = Arc::clone(storage);
                    let maps = self.maps.clone();
                    let partials = Arc::clone(&partials);
                    pool.add_job(&group, Priority::Normal, move || {
                        let mut stream = storage.get_cell_values(&slice);
                        let mut acc = HashMap::new();
                        accumulate(&maps, &mut *stream, &mut acc);
                        partials.lock().push(acc);
                    });
                }
                pool.join(&group);
                let mut merged: HashMap<Key, Acc> = HashMap::new();
                for partial in partials.lock().drain(..) {
                    for (key, value) in partial {
                        let entry = merged.entry(key).or_insert(Acc::Num(0.0));
                        if matches!(entry, Acc::Err(_)) {
                            continue;
                        }
                        match value {
                            Acc::Num(v) => entry.add(v),
                            Acc::Err(e) => entry.poison(e),
                        }
                    }
                }
                merged
            }
        };
        let mut results: Vec<(Key, CellValue)> = acc
            .into_iter()
            .map(|(key, value)| {
                let cell = match value {
                    Acc::Num(v) => CellValue::Numeric(v),
                    Acc::Err(e) => CellValue::Error(e),
                };
                (key, cell)
            })
            .collect();
        results.sort_unstable_by(|(a, _), (b, _)| compare_keys(a, b));
        self.results = Some(results);
    }
}

impl CellStream for AggregationProcessor {
    fn next(&mut self) -> bool {
        self.materialize();
        let results = self.results.as_ref().expect("materialized above");
        let next = self.pos.map_or(0, |p| p + 1);
        self.pos = Some(next.min(results.len()));
        next < results.len()
    }

    fn move_to(&mut self, key: &[IdentifierType], found: &mut bool) -> bool {
        self.materialize();
        let results = self.results.as_ref().expect("materialized above");
        let idx = results
            .partition_point(|(k, _)| compare_keys(k, key) == std::cmp::Ordering::Less);
        *found =
            idx < results.len() && compare_keys(&results[idx].0, key) == std::cmp::Ordering::Equal;
        self.pos = Some(idx);
        idx < results.len()
    }

    fn reset(&mut self) {
        self.pos = None;
    }

    fn key(&self) -> &[IdentifierType] {
        match (&self.results, self.pos) {
            (Some(results), Some(p)) if p < results.len() => &results[p].0,
            _ => EMPTY_KEY,
        }
    }

    fn value(&self) -> CellValue {
        match (&self.results, self.pos) {
            (Some(results), Some(p)) if p < results.len() => results[p].1.clone(),
            _ => CellValue::Empty,
        }
    }

    fn value_f64(&self) -> f64 {
        self.value().as_f64()
    }
}

/// Fan one base stream out into the target accumulator.
fn accumulate(maps: &[AggregationMap], stream: &mut dyn CellStream, acc: &mut HashMap<Key, Acc>) {
    while stream.next() {
        let in_key = stream.key();
        let value = stream.value();
        let numeric = match &value {
            CellValue::Numeric(v) => Some(*v),
            CellValue::Error(_) => None,
            // strings and empties do not consolidate
            CellValue::Str(_) | CellValue::Empty => continue,
        };
        let mut lists: Vec<&[(IdentifierType, f64)]> = Vec::with_capacity(in_key.len());
        let mut reachable = true;
        for (dim, id) in in_key.iter().enumerate() {
            match maps[dim].get(id) {
                Some(list) => lists.push(list.as_slice()),
                None => {
                    reachable = false;
                    break;
                }
            }
        }
        if !reachable {
            continue;
        }
        // odometer over the per-dimension target lists
        let mut positions = vec![0usize; lists.len()];
        'fanout: loop {
            let mut key = Vec::with_capacity(lists.len());
            let mut weight = 1.0;
            for (dim, list) in lists.iter().enumerate() {
                let (target, w) = list[positions[dim]];
                key.push(target);
                weight *= w;
            }
            let entry = acc.entry(key).or_insert(Acc::Num(0.0));
            match numeric {
                Some(v) => entry.add(v * weight),
                None => {
                    if let CellValue::Error(e) = &value {
                        entry.poison(*e);
                    }
                }
            }
            let mut dim = lists.len();
            while dim > 0 {
                dim -= 1;
                positions[dim] += 1;
                if positions[dim] < lists[dim].len() {
                    continue 'fanout;
                }
                positions[dim] = 0;
            }
            break;
        }
    }
}

/// Split the base area into contiguous slices along its first dimension.
fn slice_area(area: &Area, max_slices: usize) -> Vec<Area> {
    let first = area.get_dim(0);
    let ids: Vec<IdentifierType> = first.iter().collect();
    let slices = ids.len().min(max_slices).max(1);
    let chunk = ids.len().div_ceil(slices);
    ids.chunks(chunk)
        .map(|part| {
            let mut slice = area.clone();
            slice.insert(0, Arc::new(Set::from_ids(part.to_vec())));
            slice
        })
        .collect()
}
