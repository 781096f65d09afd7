//! Consolidated-Value Cache
//!
//! Materialized aggregation results keyed by a fingerprint over
//! (cube, area selector, plan kind, relevant change tokens). Because the
//! tokens participate in the fingerprint, any dimension or rule change makes
//! the old entries unreachable; they age out through LRU eviction or a full
//! clear.
//!
//! ## Policies
//!
//! - byte budget with least-recently-used eviction;
//! - admission barrier: only aggregations over sufficiently large base cubes
//!   are worth keeping;
//! - write invalidation: a write touching many cells clears the cache
//!   outright, and so does an accumulation of smaller invalidations;
//! - single-flight: concurrent lookups of one fingerprint compute once.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::cell::CellValue;
use crate::error::Result;
use crate::ident::{CubeId, Key, RuleId};
use crate::plan::NodeKind;

/// Cache tuning, all limits configurable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// byte budget for materialized entries
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,
    /// minimum base-cube cell count before results are admitted
    #[serde(default = "default_barrier_cells")]
    pub barrier_cells: usize,
    /// full clear after this many incremental invalidations
    #[serde(default = "default_clear_barrier")]
    pub clear_barrier: u32,
    /// a single write touching more cells than this clears the cache
    #[serde(default = "default_clear_barrier_cells")]
    pub clear_barrier_cells: usize,
}

fn default_max_bytes() -> usize {
    64 * 1024 * 1024
}
fn default_barrier_cells() -> usize {
    1000
}
fn default_clear_barrier() -> u32 {
    1000
}
fn default_clear_barrier_cells() -> usize {
    10_000
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            max_bytes: default_max_bytes(),
            barrier_cells: default_barrier_cells(),
            clear_barrier: default_clear_barrier(),
            clear_barrier_cells: default_clear_barrier_cells(),
        }
    }
}

/// One materialized row: key, value, producing rule if any.
pub type CachedRow = (Key, CellValue, Option<RuleId>);

/// Materialized area rows.
pub type CachedRows = Arc<Vec<CachedRow>>;

struct Entry {
    data: CachedRows,
    bytes: usize,
    last_used: u64,
}

struct CacheInner {
    entries: HashMap<u64, Entry>,
    total_bytes: usize,
    clock: u64,
    invalidations: u32,
}

struct Flight {
    done: Mutex<bool>,
    cond: Condvar,
}

/// Process-wide cache of consolidated areas. Explicit construction; no
/// implicit global.
pub struct ValueCache {
    config: CacheConfig,
    inner: Mutex<CacheInner>,
    flights: Mutex<HashMap<u64, Arc<Flight>>>,
}

/// Fingerprint over everything that determines a materialized result.
pub fn fingerprint(
    cube: CubeId,
    selector: &[Vec<u32>],
    kind: NodeKind,
    tokens: &[u64],
) -> u64 {
    let mut hasher = DefaultHasher::new();
    cube.hash(&mut hasher);
    for dim in selector {
        dim.hash(&mut hasher);
        0xfeed_u16.hash(&mut hasher);
    }
    kind.hash(&mut hasher);
    tokens.hash(&mut hasher);
    hasher.finish()
}

impl ValueCache {
    pub fn new(config: CacheConfig) -> Self {
        ValueCache {
            config,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                total_bytes: 0,
                clock: 0,
                invalidations: 0,
            }),
            flights: Mutex::new(HashMap::new()),
        }
    }

    /// Look the fingerprint up; on a miss run `compute` exactly once across
    /// all concurrent callers. Returns the rows and whether it was a hit.
    pub fn lookup_or_compute(
        &self,
        fp: u64,
        base_cells: usize,
        compute: impl FnOnce() -> Result<CachedRows>,
    ) -> Result<(CachedRows, bool)> {
        loop {
            if let Some(rows) = self.lookup(fp) {
                return Ok((rows, true));
            }
            let flight = {
                let mut flights = self.flights.lock();
                match flights.get(&fp) {
                    Some(flight) => Arc::clone(flight),
                    None => {
                        let flight = Arc::new(Flight {
                            done: Mutex::new(false),
                            cond: Condvar::new(),
                        });
                        flights.insert(fp, Arc::clone(&flight));
                        break;
                    }
                }
            };
            // another caller is computing this fingerprint
            let mut done = flight.done.lock();
            while !*done {
                flight.cond.wait(&mut done);
            }
        }

        let result = compute();
        if let Ok(rows) = &result {
            if base_cells >= self.config.barrier_cells {
                self.insert(fp, Arc::clone(rows));
            } else {
                trace!(base_cells, "result below cache admission barrier");
            }
        }
        let flight = self.flights.lock().remove(&fp);
        if let Some(flight) = flight {
            *flight.done.lock() = true;
            flight.cond.notify_all();
        }
        result.map(|rows| (rows, false))
    }

    fn lookup(&self, fp: u64) -> Option<CachedRows> {
        let mut inner = self.inner.lock();
        inner.clock += 1;
        let clock = inner.clock;
        let entry = inner.entries.get_mut(&fp)?;
        entry.last_used = clock;
        Some(Arc::clone(&entry.data))
    }

    fn insert(&self, fp: u64, data: CachedRows) {
        let bytes = estimate_bytes(&data);
        if bytes > self.config.max_bytes {
            return;
        }
        let mut inner = self.inner.lock();
        inner.clock += 1;
        let clock = inner.clock;
        if let Some(old) = inner.entries.remove(&fp) {
            inner.total_bytes -= old.bytes;
        }
        while inner.total_bytes + bytes > self.config.max_bytes {
            let victim = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| *k);
            match victim {
                Some(key) => {
                    if let Some(evicted) = inner.entries.remove(&key) {
                        inner.total_bytes -= evicted.bytes;
                        trace!(fingerprint = key, "cache eviction");
                    }
                }
                None => break,
            }
        }
        inner.total_bytes += bytes;
        inner.entries.insert(
            fp,
            Entry {
                data,
                bytes,
                last_used: clock,
            },
        );
    }

    /// Record a cube write touching `cells` cells.
    pub fn invalidate_write(&self, cells: usize) {
        let mut inner = self.inner.lock();
        if cells > self.config.clear_barrier_cells {
            debug!(cells, "large write, clearing value cache");
            Self::clear_locked(&mut inner);
            return;
        }
        inner.invalidations += 1;
        if inner.invalidations >= self.config.clear_barrier {
            debug!("invalidation barrier reached, clearing value cache");
            Self::clear_locked(&mut inner);
        }
    }

    pub fn clear(&self) {
        Self::clear_locked(&mut self.inner.lock());
    }

    fn clear_locked(inner: &mut CacheInner) {
        inner.entries.clear();
        inner.total_bytes = 0;
        inner.invalidations = 0;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> usize {
        self.inner.lock().total_bytes
    }
}

fn estimate_bytes(rows: &CachedRows) -> usize {
    rows.iter()
        .map(|(key, value, _)| {
            32 + key.len() * std::mem::size_of::<u32>()
                + match value {
                    CellValue::Str(s) => s.len(),
                    _ => std::mem::size_of::<f64>(),
                }
        })
        .sum()
}
