//! Engine
//!
//! Orchestrates the whole system: the dimension/cube registry, the query
//! pipeline (plan construction, aggregation, rule overlays, caching), cell
//! writes with splashing and lock undo capture, the mutation journal, and
//! snapshot save/load with journal replay.
//!
//! ## Concurrency model
//!
//! - The registry sits behind one `RwLock`; queries take a short read lock to
//!   snapshot what they need (storage handles, dimension views) and then run
//!   lock-free against those snapshots.
//! - Cell stores publish copy-on-write snapshots, so readers see pre-write or
//!   post-write state, never an intermediate one. A per-cube write mutex
//!   serializes writers.
//! - Parallel aggregation fans out on the worker pool inside one thread
//!   group; the request joins the group before returning.
//! - A background sweep rolls back locks whose session has expired.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::area::{Area, AreaSelector, DimSelector, Set};
use crate::cache::{fingerprint, CachedRow, CachedRows, ValueCache};
use crate::cell::CellValue;
use crate::config::Config;
use crate::cube::storage::{CellEdit, MixedStorage};
use crate::cube::Cube;
use crate::dimension::{Dimension, Element, ElementId, ElementKind};
use crate::error::{EngineError, Result};
use crate::ident::{CubeId, DimensionId, IdentifierType, Key, LockId, RuleId, SessionId};
use crate::lock::{LockManager, UndoRecord};
use crate::persist::journal::{self, JournalRecord, JournalService};
use crate::persist::snapshot::{self, Registry};
use crate::plan::combination::CombinationProcessor;
use crate::plan::{
    create_processor, AggregationMap, KeyEvaluator, NodeKind, PlanNode, RuleOverlay,
};
use crate::pool::ThreadPool;
use crate::rule::eval::{evaluate, CellResolver};
use crate::rule::{parser, CompiledRule, CoordRef};
use crate::session::SessionRegistry;
use crate::splash::{splash_edits, SplashLimits, SplashMode};
use crate::stream::CellStream;

/// The system session: replay, maintenance, and administrative writes.
pub const SYSTEM_SESSION: SessionId = 0;

/// Result of a point query.
#[derive(Debug, Clone, PartialEq)]
pub struct CellResult {
    pub value: CellValue,
    pub rule: Option<RuleId>,
}

/// Result of a bulk replace: rows that failed, by input index.
#[derive(Debug, Default)]
pub struct BulkResult {
    pub applied: usize,
    pub errors: Vec<(usize, EngineError)>,
}

/// One page of an export.
#[derive(Debug, Clone)]
pub struct ExportPage {
    pub rows: Vec<CachedRow>,
    pub last_key: Option<Key>,
    pub complete: bool,
}

/// Numeric filter for exports.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Condition {
    Gt(f64),
    Ge(f64),
    Lt(f64),
    Le(f64),
    Eq(f64),
    Ne(f64),
}

impl Condition {
    fn matches(&self, value: &CellValue) -> bool {
        let v = value.as_f64();
        match self {
            Condition::Gt(x) => v > *x,
            Condition::Ge(x) => v >= *x,
            Condition::Lt(x) => v < *x,
            Condition::Le(x) => v <= *x,
            Condition::Eq(x) => v == *x,
            Condition::Ne(x) => v != *x,
        }
    }
}

/// Goal-seek tuning.
#[derive(Debug, Clone, Copy)]
pub struct GoalseekOptions {
    pub tolerance: f64,
    pub timeout: Duration,
    pub cell_limit: usize,
}

impl Default for GoalseekOptions {
    fn default() -> Self {
        GoalseekOptions {
            tolerance: 1e-9,
            timeout: Duration::from_secs(10),
            cell_limit: 100_000,
        }
    }
}

struct CubeEntry {
    cube: Cube,
    storage: Arc<MixedStorage>,
    rules: Vec<CompiledRule>,
    next_rule_id: RuleId,
    /// bumped on rule changes
    rules_token: u64,
    /// bumped on cell writes
    data_token: AtomicU64,
    /// serializes write requests on this cube
    write_lock: Arc<Mutex<()>>,
}

struct EngineState {
    dimensions: BTreeMap<DimensionId, Dimension>,
    cubes: BTreeMap<CubeId, CubeEntry>,
    next_dimension_id: DimensionId,
    next_cube_id: CubeId,
}

/// The in-memory OLAP engine. One instance owns one database directory.
pub struct Engine {
    config: Config,
    data_dir: PathBuf,
    pool: Arc<ThreadPool>,
    cache: Arc<ValueCache>,
    sessions: Arc<SessionRegistry>,
    locks: Arc<LockManager>,
    state: Arc<RwLock<EngineState>>,
    journal: Option<Arc<JournalService>>,
    stop: Arc<AtomicBool>,
    sweeper: Option<JoinHandle<()>>,
}

// ----------------------------------------------------------------------
// Query context: everything a query needs after the registry lock drops
// ----------------------------------------------------------------------

struct DimView {
    all: Arc<Set>,
    base: HashMap<ElementId, Arc<Vec<(ElementId, f64)>>>,
    kinds: HashMap<ElementId, ElementKind>,
}

struct QueryContext {
    cube_id: CubeId,
    storage: Arc<MixedStorage>,
    dims: Vec<DimView>,
    rules: Arc<Vec<CompiledRule>>,
    tokens: Vec<u64>,
    pool: Arc<ThreadPool>,
    parallel_threshold: usize,
}

thread_local! {
    static EVALUATING: RefCell<HashSet<(CubeId, Key)>> = RefCell::new(HashSet::new());
}

impl QueryContext {
    fn dim_count(&self) -> usize {
        self.dims.len()
    }

    fn validate_key(&self, key: &[IdentifierType]) -> Result<()> {
        if key.len() != self.dim_count() {
            return Err(EngineError::InvalidPath(format!(
                "key has {} coordinates, cube has {} dimensions",
                key.len(),
                self.dim_count()
            )));
        }
        for (dim, id) in key.iter().enumerate() {
            if !self.dims[dim].kinds.contains_key(id) {
                return Err(EngineError::InvalidPath(format!(
                    "unknown element {id} in dimension ordinal {dim}"
                )));
            }
        }
        Ok(())
    }

    fn is_base_key(&self, key: &[IdentifierType]) -> bool {
        key.iter()
            .enumerate()
            .all(|(dim, id)| self.dims[dim].kinds.get(id) != Some(&ElementKind::Consolidated))
    }

    fn is_string_key(&self, key: &[IdentifierType]) -> bool {
        key.iter()
            .enumerate()
            .any(|(dim, id)| self.dims[dim].kinds.get(id) == Some(&ElementKind::Str))
    }

    fn rule_area(&self, rule: &CompiledRule) -> Area {
        Area::new(
            rule.target
                .iter()
                .enumerate()
                .map(|(dim, slot)| match slot {
                    Some(id) => Arc::new(Set::from_ids(vec![*id])),
                    None => Arc::clone(&self.dims[dim].all),
                })
                .collect(),
        )
    }

    /// Evaluate one rule cell under the per-thread recursion guard.
    fn guarded_rule_eval(self: &Arc<Self>, rule: &CompiledRule, key: &[IdentifierType]) -> CellValue {
        let guard_key = (self.cube_id, key.to_vec());
        let entered = EVALUATING.with(|set| set.borrow_mut().insert(guard_key.clone()));
        if !entered {
            return CellValue::Error(crate::error::CellError::RuleCircular);
        }
        let value = evaluate(&rule.expr, key, &ResolverView(Arc::clone(self)));
        EVALUATING.with(|set| set.borrow_mut().remove(&guard_key));
        value
    }

    /// Point read with consolidation and rule overlays.
    fn cell_with_rule(self: &Arc<Self>, key: &[IdentifierType]) -> Result<CellResult> {
        self.validate_key(key)?;
        for rule in self.rules.iter() {
            if rule.matches(key) {
                let value = self.guarded_rule_eval(rule, key);
                if !value.is_empty() {
                    return Ok(CellResult {
                        value,
                        rule: Some(rule.id),
                    });
                }
            }
        }
        if self.is_base_key(key) {
            let (value, rule) = self.storage.get(key);
            return Ok(CellResult { value, rule });
        }
        // point-mode aggregation over the expanded base area
        let (base_area, maps) = self.expansion_for(&Area::from_key(key))?;
        let child = self.rule_overlaid_source(base_area);
        let target = Area::from_key(key);
        let node = PlanNode::Aggregation {
            area: target,
            child: Box::new(child),
            maps,
            pool: None,
        };
        let mut stream = create_processor(&node);
        let mut found = false;
        if stream.move_to(key, &mut found) && found {
            Ok(CellResult {
                value: stream.value(),
                rule: None,
            })
        } else {
            Ok(CellResult {
                value: CellValue::Empty,
                rule: None,
            })
        }
    }

    /// Per-dimension aggregation maps and the base area for a target area.
    fn expansion_for(&self, requested: &Area) -> Result<(Area, Vec<AggregationMap>)> {
        let mut base_dims = Vec::with_capacity(self.dim_count());
        let mut maps = Vec::with_capacity(self.dim_count());
        for dim in 0..self.dim_count() {
            let mut map: HashMap<IdentifierType, Vec<(IdentifierType, f64)>> = HashMap::new();
            for target in requested.get_dim(dim).iter() {
                let base = self.dims[dim]
                    .base
                    .get(&target)
                    .cloned()
                    .ok_or_else(|| EngineError::UnknownId(target))?;
                for (b, w) in base.iter() {
                    map.entry(*b).or_default().push((target, *w));
                }
            }
            base_dims.push(Arc::new(map.keys().copied().collect::<Set>()));
            maps.push(Arc::new(map));
        }
        Ok((Area::new(base_dims), maps))
    }

    /// Source over `area`, with rule overlays restricted to it.
    fn rule_overlaid_source(self: &Arc<Self>, area: Area) -> PlanNode {
        let source = PlanNode::Source {
            storage: Arc::clone(&self.storage),
            area: area.clone(),
        };
        let overlays = self.overlays_for(&area);
        if overlays.is_empty() {
            source
        } else {
            PlanNode::Rule {
                area,
                child: Box::new(source),
                overlays,
            }
        }
    }

    fn overlays_for(self: &Arc<Self>, area: &Area) -> Vec<RuleOverlay> {
        self.rules
            .iter()
            .filter_map(|rule| {
                let overlay_area = self.rule_area(rule).intersect(area);
                if overlay_area.is_empty() {
                    return None;
                }
                Some(RuleOverlay {
                    rule_id: rule.id,
                    area: overlay_area,
                    evaluator: Arc::new(CompiledEvaluator {
                        ctx: Arc::clone(self),
                        rule: rule.clone(),
                    }),
                })
            })
            .collect()
    }

    /// Ordered stream over an area query, plus whether aggregation was
    /// involved (which decides cache participation).
    fn area_stream(self: &Arc<Self>, requested: &Area) -> Result<(Box<dyn CellStream>, bool)> {
        let all_base = (0..self.dim_count()).all(|dim| {
            requested
                .get_dim(dim)
                .iter()
                .all(|id| self.dims[dim].kinds.get(&id) != Some(&ElementKind::Consolidated))
        });
        if all_base {
            let node = self.rule_overlaid_source(requested.clone());
            return Ok((create_processor(&node), false));
        }
        let (base_area, maps) = self.expansion_for(requested)?;
        let child = self.rule_overlaid_source(base_area.clone());
        let pool = if base_area.size() >= self.parallel_threshold as f64 {
            Some(Arc::clone(&self.pool))
        } else {
            None
        };
        let agg = PlanNode::Aggregation {
            area: requested.clone(),
            child: Box::new(child),
            maps,
            pool,
        };
        let overlays = self.overlays_for(requested);
        let plan = if overlays.is_empty() {
            agg
        } else {
            PlanNode::Rule {
                area: requested.clone(),
                child: Box::new(agg),
                overlays,
            }
        };
        let plan_stream = create_processor(&plan);
        // string cells live at base coordinates inside the requested area
        let base_part = requested.intersect(&base_area);
        let stream: Box<dyn CellStream> = if base_part.is_empty() {
            plan_stream
        } else {
            let strings = self.storage.get_string_values(&base_part);
            Box::new(CombinationProcessor::new(vec![plan_stream, strings]))
        };
        Ok((stream, true))
    }
}

/// `CellResolver` view of the context for rule evaluation.
struct ResolverView(Arc<QueryContext>);

impl CellResolver for ResolverView {
    fn cell(&self, key: &[IdentifierType]) -> CellValue {
        match self.0.cell_with_rule(key) {
            Ok(result) => result.value,
            Err(_) => CellValue::Error(crate::error::CellError::Internal),
        }
    }
}

struct CompiledEvaluator {
    ctx: Arc<QueryContext>,
    rule: CompiledRule,
}

impl KeyEvaluator for CompiledEvaluator {
    fn evaluate(&self, key: &[IdentifierType]) -> CellValue {
        self.ctx.guarded_rule_eval(&self.rule, key)
    }
}

// ----------------------------------------------------------------------
// Engine
// ----------------------------------------------------------------------

impl Engine {
    /// Open (or create) the database in `config.storage.data_dir`: load the
    /// snapshot, replay the journal, start the journal writer and the lock
    /// sweep.
    pub fn new(config: Config) -> Result<Self> {
        let data_dir = config.storage.data_dir.clone();
        fs::create_dir_all(&data_dir)?;
        let pool_size = if config.engine.pool_size == 0 {
            ThreadPool::default_size()
        } else {
            config.engine.pool_size
        };
        let pool = Arc::new(ThreadPool::with_size(pool_size));
        let cache = Arc::new(ValueCache::new(config.cache.clone()));
        let sessions = Arc::new(SessionRegistry::new(Duration::from_secs(
            config.engine.session_idle_secs,
        )));
        let locks = Arc::new(LockManager::new(
            config.locks.clone(),
            &data_dir.join("locks"),
        )?);

        let mut engine = Engine {
            config,
            data_dir,
            pool,
            cache,
            sessions,
            locks,
            state: Arc::new(RwLock::new(EngineState {
                dimensions: BTreeMap::new(),
                cubes: BTreeMap::new(),
                next_dimension_id: 0,
                next_cube_id: 0,
            })),
            journal: None,
            stop: Arc::new(AtomicBool::new(false)),
            sweeper: None,
        };
        engine.load()?;
        engine.journal = Some(Arc::new(JournalService::start(
            &engine.data_dir,
            engine.config.storage.journal_rotate_bytes,
        )?));
        engine.start_sweeper();
        info!(dir = %engine.data_dir.display(), "engine started");
        Ok(engine)
    }

    /// Stop background workers and flush the journal. Called by `Drop`.
    pub fn shutdown(&mut self) {
        if self.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.sweeper.take() {
            let _ = handle.join();
        }
        if let Some(journal) = &self.journal {
            journal.flush();
        }
        self.journal = None;
        self.pool.shutdown();
        info!("engine stopped");
    }

    fn start_sweeper(&mut self) {
        let stop = Arc::clone(&self.stop);
        let locks = Arc::clone(&self.locks);
        let sessions = Arc::clone(&self.sessions);
        let state = Arc::clone(&self.state);
        let cache = Arc::clone(&self.cache);
        let journal = self.journal.clone();
        let interval = Duration::from_secs(self.locks.sweep_interval_secs().max(1));
        let handle = std::thread::Builder::new()
            .name("cubist-lock-sweep".to_string())
            .spawn(move || {
                let mut last_sweep = Instant::now();
                while !stop.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(50));
                    if last_sweep.elapsed() < interval {
                        continue;
                    }
                    last_sweep = Instant::now();
                    sessions.expire_idle();
                    let expired = locks.sweep_expired(|session| {
                        session == SYSTEM_SESSION || sessions.is_active(session)
                    });
                    for lock in expired {
                        let records = lock.journal.lock().drain_for_rollback();
                        match records {
                            Ok(records) => {
                                if let Some(journal) = &journal {
                                    for record in &records {
                                        let (type_code, encoded) =
                                            encode_cell_value(&record.old);
                                        journal.append(JournalRecord::new(
                                            &SYSTEM_SESSION.to_string(),
                                            "",
                                            "SET_CELL",
                                            vec![
                                                lock.cube.to_string(),
                                                crate::persist::join_ids(
                                                    record.key.iter().copied(),
                                                ),
                                                type_code.to_string(),
                                                encoded,
                                                splash_mode_name(SplashMode::Disabled)
                                                    .to_string(),
                                            ],
                                        ));
                                    }
                                }
                                apply_undo_records(&state, &cache, lock.cube, records);
                            }
                            Err(e) => warn!(lock = lock.id, "sweep rollback failed: {e}"),
                        }
                    }
                }
            });
        match handle {
            Ok(handle) => self.sweeper = Some(handle),
            Err(e) => warn!("failed to start lock sweep: {e}"),
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.config.engine.read_only {
            return Err(EngineError::ReadOnly);
        }
        if self.stop.load(Ordering::SeqCst) {
            return Err(EngineError::Shutdown);
        }
        Ok(())
    }

    /// Structural changes are refused while any cube referencing the
    /// dimension holds a live lock.
    fn check_dimension_unlocked(&self, dim: DimensionId) -> Result<()> {
        let state = self.state.read();
        for entry in state.cubes.values() {
            if entry.cube.dimension_ids().contains(&dim)
                && !self.locks.locks_for_cube(entry.cube.id()).is_empty()
            {
                return Err(EngineError::DimensionLocked(format!(
                    "cube '{}' is locked",
                    entry.cube.name()
                )));
            }
        }
        Ok(())
    }

    fn check_session(&self, session: SessionId) -> Result<()> {
        if session == SYSTEM_SESSION || self.sessions.is_active(session) {
            Ok(())
        } else {
            Err(EngineError::NotAuthorized(format!(
                "session {session} is not active"
            )))
        }
    }

    fn journal_append(&self, session: SessionId, command: &str, args: Vec<String>) {
        if let Some(journal) = &self.journal {
            journal.append(JournalRecord::new(
                &session.to_string(),
                "",
                command,
                args,
            ));
        }
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    pub fn create_session(&self) -> SessionId {
        self.sessions.create()
    }

    pub fn touch_session(&self, session: SessionId) -> bool {
        self.sessions.touch(session)
    }

    pub fn terminate_session(&self, session: SessionId) {
        self.sessions.terminate(session);
    }

    // ------------------------------------------------------------------
    // Dimension registry
    // ------------------------------------------------------------------

    pub fn create_dimension(&self, name: &str) -> Result<DimensionId> {
        self.check_writable()?;
        let id = self.create_dimension_internal(name, None)?;
        self.journal_append(
            SYSTEM_SESSION,
            "ADD_DIMENSION",
            vec![id.to_string(), name.to_string()],
        );
        Ok(id)
    }

    fn create_dimension_internal(&self, name: &str, id: Option<DimensionId>) -> Result<DimensionId> {
        let mut state = self.state.write();
        if state.dimensions.values().any(|d| d.name() == name) {
            return Err(EngineError::NameInUse(name.to_string()));
        }
        let id = id.unwrap_or(state.next_dimension_id);
        let dimension = Dimension::new(id, name)?;
        state.dimensions.insert(id, dimension);
        state.next_dimension_id = state.next_dimension_id.max(id + 1);
        debug!(dimension = id, name, "dimension created");
        Ok(id)
    }

    pub fn delete_dimension(&self, id: DimensionId) -> Result<()> {
        self.check_writable()?;
        {
            let mut state = self.state.write();
            if !state.dimensions.contains_key(&id) {
                return Err(EngineError::UnknownId(id));
            }
            if let Some(cube) = state
                .cubes
                .values()
                .find(|entry| entry.cube.dimension_ids().contains(&id))
            {
                return Err(EngineError::DimensionLocked(format!(
                    "dimension {id} is used by cube '{}'",
                    cube.cube.name()
                )));
            }
            state.dimensions.remove(&id);
        }
        snapshot::remove_dimension_file(&self.data_dir, id)?;
        self.journal_append(SYSTEM_SESSION, "DELETE_DIMENSION", vec![id.to_string()]);
        Ok(())
    }

    pub fn dimension_id(&self, name: &str) -> Result<DimensionId> {
        self.state
            .read()
            .dimensions
            .values()
            .find(|d| d.name() == name)
            .map(Dimension::id)
            .ok_or_else(|| EngineError::UnknownDimension(name.to_string()))
    }

    /// Run a closure against a dimension under the registry read lock.
    pub fn with_dimension<R>(
        &self,
        id: DimensionId,
        f: impl FnOnce(&Dimension) -> R,
    ) -> Result<R> {
        let state = self.state.read();
        let dim = state.dimensions.get(&id).ok_or(EngineError::UnknownId(id))?;
        Ok(f(dim))
    }

    pub fn element_id(&self, dim: DimensionId, name: &str) -> Result<ElementId> {
        self.with_dimension(dim, |d| d.element_by_name(name).map(|e| e.id))?
    }

    pub fn element_info(&self, dim: DimensionId, id: ElementId) -> Result<Element> {
        self.with_dimension(dim, |d| d.element(id).cloned())?
    }

    // ------------------------------------------------------------------
    // Dimension operations
    // ------------------------------------------------------------------

    pub fn add_element(
        &self,
        dim: DimensionId,
        name: &str,
        kind: ElementKind,
    ) -> Result<ElementId> {
        self.check_writable()?;
        let id = self.add_element_internal(dim, name, kind)?;
        self.journal_append(
            SYSTEM_SESSION,
            "ADD_ELEMENT",
            vec![dim.to_string(), name.to_string(), kind.code().to_string()],
        );
        Ok(id)
    }

    fn add_element_internal(
        &self,
        dim: DimensionId,
        name: &str,
        kind: ElementKind,
    ) -> Result<ElementId> {
        let mut state = self.state.write();
        let dimension = state
            .dimensions
            .get_mut(&dim)
            .ok_or(EngineError::UnknownId(dim))?;
        dimension.add_element(name, kind)
    }

    pub fn rename_element(&self, dim: DimensionId, id: ElementId, name: &str) -> Result<()> {
        self.check_writable()?;
        self.rename_element_internal(dim, id, name)?;
        self.journal_append(
            SYSTEM_SESSION,
            "RENAME_ELEMENT",
            vec![dim.to_string(), id.to_string(), name.to_string()],
        );
        Ok(())
    }

    fn rename_element_internal(&self, dim: DimensionId, id: ElementId, name: &str) -> Result<()> {
        let mut state = self.state.write();
        let dimension = state
            .dimensions
            .get_mut(&dim)
            .ok_or(EngineError::UnknownId(dim))?;
        dimension.rename_element(id, name)
    }

    pub fn change_element_kind(
        &self,
        dim: DimensionId,
        id: ElementId,
        kind: ElementKind,
    ) -> Result<()> {
        self.check_writable()?;
        self.check_dimension_unlocked(dim)?;
        self.change_element_kind_internal(dim, id, kind)?;
        self.journal_append(
            SYSTEM_SESSION,
            "CHANGE_ELEMENT",
            vec![dim.to_string(), id.to_string(), kind.code().to_string()],
        );
        Ok(())
    }

    fn change_element_kind_internal(
        &self,
        dim: DimensionId,
        id: ElementId,
        kind: ElementKind,
    ) -> Result<()> {
        let mut state = self.state.write();
        let dimension = state
            .dimensions
            .get_mut(&dim)
            .ok_or(EngineError::UnknownId(dim))?;
        dimension.change_kind(id, kind)?;
        // cells of the old kind no longer fit the element
        let cleared = Self::clear_element_cells(&state, dim, &[id]);
        self.cache.invalidate_write(cleared.max(1));
        Ok(())
    }

    pub fn move_element(&self, dim: DimensionId, id: ElementId, position: u32) -> Result<()> {
        self.check_writable()?;
        self.move_element_internal(dim, id, position)?;
        self.journal_append(
            SYSTEM_SESSION,
            "MOVE_ELEMENT",
            vec![dim.to_string(), id.to_string(), position.to_string()],
        );
        Ok(())
    }

    fn move_element_internal(&self, dim: DimensionId, id: ElementId, position: u32) -> Result<()> {
        let mut state = self.state.write();
        let dimension = state
            .dimensions
            .get_mut(&dim)
            .ok_or(EngineError::UnknownId(dim))?;
        dimension.move_element(id, position)
    }

    pub fn add_children(
        &self,
        dim: DimensionId,
        parent: ElementId,
        children: &[(ElementId, f64)],
    ) -> Result<()> {
        self.check_writable()?;
        self.check_dimension_unlocked(dim)?;
        self.add_children_internal(dim, parent, children)?;
        self.journal_append(
            SYSTEM_SESSION,
            "ADD_CHILDREN",
            vec![
                dim.to_string(),
                parent.to_string(),
                crate::persist::join_ids(children.iter().map(|(c, _)| *c)),
                children
                    .iter()
                    .map(|(_, w)| w.to_string())
                    .collect::<Vec<_>>()
                    .join(","),
            ],
        );
        Ok(())
    }

    fn add_children_internal(
        &self,
        dim: DimensionId,
        parent: ElementId,
        children: &[(ElementId, f64)],
    ) -> Result<()> {
        let mut state = self.state.write();
        let dimension = state
            .dimensions
            .get_mut(&dim)
            .ok_or(EngineError::UnknownId(dim))?;
        dimension.add_children(parent, children)?;
        // the parent's stored base cells are now consolidated coordinates
        let cleared = Self::clear_element_cells(&state, dim, &[parent]);
        self.cache.invalidate_write(cleared.max(1));
        Ok(())
    }

    pub fn remove_children(
        &self,
        dim: DimensionId,
        parent: ElementId,
        children: Option<&[ElementId]>,
    ) -> Result<()> {
        self.check_writable()?;
        self.check_dimension_unlocked(dim)?;
        self.remove_children_internal(dim, parent, children)?;
        self.journal_append(
            SYSTEM_SESSION,
            "REMOVE_CHILDREN",
            vec![
                dim.to_string(),
                parent.to_string(),
                children
                    .map(|c| crate::persist::join_ids(c.iter().copied()))
                    .unwrap_or_default(),
            ],
        );
        Ok(())
    }

    fn remove_children_internal(
        &self,
        dim: DimensionId,
        parent: ElementId,
        children: Option<&[ElementId]>,
    ) -> Result<()> {
        let mut state = self.state.write();
        let dimension = state
            .dimensions
            .get_mut(&dim)
            .ok_or(EngineError::UnknownId(dim))?;
        dimension.remove_children(parent, children)?;
        self.cache.invalidate_write(1);
        Ok(())
    }

    pub fn delete_element(&self, dim: DimensionId, id: ElementId) -> Result<()> {
        self.check_writable()?;
        self.check_dimension_unlocked(dim)?;
        self.delete_elements_internal(dim, &[id])?;
        self.journal_append(
            SYSTEM_SESSION,
            "DELETE_ELEMENT",
            vec![dim.to_string(), id.to_string()],
        );
        Ok(())
    }

    /// Batched delete; semantics match sequential single deletes.
    pub fn delete_elements(&self, dim: DimensionId, ids: &[ElementId]) -> Result<()> {
        self.check_writable()?;
        self.check_dimension_unlocked(dim)?;
        self.delete_elements_internal(dim, ids)?;
        self.journal_append(
            SYSTEM_SESSION,
            "DELETE_ELEMENTS",
            vec![dim.to_string(), crate::persist::join_ids(ids.iter().copied())],
        );
        Ok(())
    }

    fn delete_elements_internal(&self, dim: DimensionId, ids: &[ElementId]) -> Result<()> {
        let mut state = self.state.write();
        let dimension = state
            .dimensions
            .get_mut(&dim)
            .ok_or(EngineError::UnknownId(dim))?;
        if ids.len() == 1 {
            dimension.delete_element(ids[0])?;
        } else {
            dimension.delete_elements(ids)?;
        }
        let cleared = Self::clear_element_cells(&state, dim, ids);
        // drop rules referencing the deleted elements
        let dim_ordinals: Vec<(CubeId, usize)> = state
            .cubes
            .iter()
            .flat_map(|(cube_id, entry)| {
                entry
                    .cube
                    .dimension_ids()
                    .iter()
                    .enumerate()
                    .filter(|(_, d)| **d == dim)
                    .map(|(ordinal, _)| (*cube_id, ordinal))
                    .collect::<Vec<_>>()
            })
            .collect();
        for (cube_id, ordinal) in dim_ordinals {
            if let Some(entry) = state.cubes.get_mut(&cube_id) {
                let before = entry.rules.len();
                entry
                    .rules
                    .retain(|rule| !ids.iter().any(|id| rule.references_element(ordinal, *id)));
                if entry.rules.len() != before {
                    entry.rules_token += 1;
                }
            }
        }
        self.cache.invalidate_write(cleared.max(1));
        Ok(())
    }

    /// Remove stored cells whose coordinate in `dim` is one of `ids`, in
    /// every cube referencing the dimension.
    fn clear_element_cells(state: &EngineState, dim: DimensionId, ids: &[ElementId]) -> usize {
        let mut cleared = 0;
        for entry in state.cubes.values() {
            for (ordinal, cube_dim) in entry.cube.dimension_ids().iter().enumerate() {
                if *cube_dim == dim {
                    cleared += entry.storage.delete_coordinate(ordinal, ids);
                    entry.data_token.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
        cleared
    }

    pub fn clear_elements(&self, dim: DimensionId) -> Result<()> {
        self.check_writable()?;
        self.check_dimension_unlocked(dim)?;
        self.clear_elements_internal(dim)?;
        self.journal_append(SYSTEM_SESSION, "CLEAR_ELEMENTS", vec![dim.to_string()]);
        Ok(())
    }

    fn clear_elements_internal(&self, dim: DimensionId) -> Result<()> {
        let mut state = self.state.write();
        let dimension = state
            .dimensions
            .get_mut(&dim)
            .ok_or(EngineError::UnknownId(dim))?;
        let all: Vec<ElementId> = dimension.all_ids().iter().collect();
        dimension.clear_elements();
        let cleared = Self::clear_element_cells(&state, dim, &all);
        self.cache.invalidate_write(cleared.max(1));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Cube registry
    // ------------------------------------------------------------------

    pub fn create_cube(&self, name: &str, dims: &[DimensionId]) -> Result<CubeId> {
        self.check_writable()?;
        let id = self.create_cube_internal(name, dims, None)?;
        self.journal_append(
            SYSTEM_SESSION,
            "ADD_CUBE",
            vec![
                id.to_string(),
                name.to_string(),
                crate::persist::join_ids(dims.iter().copied()),
            ],
        );
        Ok(id)
    }

    fn create_cube_internal(
        &self,
        name: &str,
        dims: &[DimensionId],
        id: Option<CubeId>,
    ) -> Result<CubeId> {
        let mut state = self.state.write();
        if state.cubes.values().any(|e| e.cube.name() == name) {
            return Err(EngineError::NameInUse(name.to_string()));
        }
        if dims.is_empty() {
            return Err(EngineError::InvalidPath("cube needs dimensions".to_string()));
        }
        for dim in dims {
            if !state.dimensions.contains_key(dim) {
                return Err(EngineError::UnknownId(*dim));
            }
        }
        let id = id.unwrap_or(state.next_cube_id);
        let cube = Cube::new(id, name, dims.to_vec())?;
        state.cubes.insert(
            id,
            CubeEntry {
                cube,
                storage: Arc::new(MixedStorage::new()),
                rules: Vec::new(),
                next_rule_id: 1,
                rules_token: 0,
                data_token: AtomicU64::new(0),
                write_lock: Arc::new(Mutex::new(())),
            },
        );
        state.next_cube_id = state.next_cube_id.max(id + 1);
        debug!(cube = id, name, "cube created");
        Ok(id)
    }

    pub fn delete_cube(&self, id: CubeId) -> Result<()> {
        self.check_writable()?;
        {
            let mut state = self.state.write();
            if state.cubes.remove(&id).is_none() {
                return Err(EngineError::UnknownId(id));
            }
        }
        snapshot::remove_cube_file(&self.data_dir, id)?;
        self.cache.clear();
        self.journal_append(SYSTEM_SESSION, "DELETE_CUBE", vec![id.to_string()]);
        Ok(())
    }

    pub fn cube_id(&self, name: &str) -> Result<CubeId> {
        self.state
            .read()
            .cubes
            .values()
            .find(|e| e.cube.name() == name)
            .map(|e| e.cube.id())
            .ok_or_else(|| EngineError::UnknownCube(name.to_string()))
    }

    pub fn cube_info(&self, id: CubeId) -> Result<Cube> {
        let state = self.state.read();
        state
            .cubes
            .get(&id)
            .map(|e| e.cube.clone())
            .ok_or(EngineError::UnknownId(id))
    }

    pub fn cube_cell_count(&self, id: CubeId) -> Result<usize> {
        let state = self.state.read();
        state
            .cubes
            .get(&id)
            .map(|e| e.storage.values_count())
            .ok_or(EngineError::UnknownId(id))
    }

    // ------------------------------------------------------------------
    // Query context
    // ------------------------------------------------------------------

    fn query_context(&self, cube: CubeId) -> Result<Arc<QueryContext>> {
        let state = self.state.read();
        let entry = state.cubes.get(&cube).ok_or(EngineError::UnknownId(cube))?;
        let mut dims = Vec::new();
        let mut tokens = Vec::new();
        for dim_id in entry.cube.dimension_ids() {
            let dim = state
                .dimensions
                .get(dim_id)
                .ok_or(EngineError::UnknownId(*dim_id))?;
            tokens.push(dim.token());
            dims.push(DimView {
                all: Arc::new(dim.all_ids()),
                base: dim.base_map(),
                kinds: dim.kind_map(),
            });
        }
        tokens.push(entry.rules_token);
        tokens.push(entry.data_token.load(Ordering::SeqCst));
        Ok(Arc::new(QueryContext {
            cube_id: cube,
            storage: Arc::clone(&entry.storage),
            dims,
            rules: Arc::new(entry.rules.clone()),
            tokens,
            pool: Arc::clone(&self.pool),
            parallel_threshold: self.config.engine.parallel_aggregation_cells,
        }))
    }

    fn resolve_selector(&self, ctx: &QueryContext, selector: &AreaSelector) -> Result<Area> {
        if selector.len() != ctx.dim_count() {
            return Err(EngineError::InvalidPath(format!(
                "selector has {} entries, cube has {} dimensions",
                selector.len(),
                ctx.dim_count()
            )));
        }
        let mut dims = Vec::with_capacity(selector.len());
        for (ordinal, entry) in selector.iter().enumerate() {
            let set = match entry {
                DimSelector::All => Arc::clone(&ctx.dims[ordinal].all),
                DimSelector::Ids(ids) => {
                    for id in ids {
                        if !ctx.dims[ordinal].kinds.contains_key(id) {
                            return Err(EngineError::UnknownId(*id));
                        }
                    }
                    Arc::new(Set::from_ids(ids.clone()))
                }
            };
            dims.push(set);
        }
        Ok(Area::new(dims))
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Point query: value plus the rule that produced it, if any.
    pub fn cell_value(&self, cube: CubeId, key: &[IdentifierType]) -> Result<CellResult> {
        let ctx = self.query_context(cube)?;
        ctx.cell_with_rule(key)
    }

    /// Area query: ordered rows of every non-empty cell in the area.
    pub fn cell_area(&self, cube: CubeId, selector: &AreaSelector) -> Result<CachedRows> {
        let ctx = self.query_context(cube)?;
        let requested = self.resolve_selector(&ctx, selector)?;
        let (mut stream, aggregated) = ctx.area_stream(&requested)?;
        if !aggregated {
            return Ok(Arc::new(collect_rows(&mut *stream, &self.stop)?));
        }
        let selector_ids: Vec<Vec<u32>> = (0..requested.dim_count())
            .map(|d| requested.get_dim(d).iter().collect())
            .collect();
        let fp = fingerprint(cube, &selector_ids, NodeKind::Aggregation, &ctx.tokens);
        let base_cells = ctx.storage.values_count();
        let stop = Arc::clone(&self.stop);
        let (rows, hit) = self.cache.lookup_or_compute(fp, base_cells, move || {
            Ok(Arc::new(collect_rows(&mut *stream, &stop)?))
        })?;
        if hit {
            debug!(cube, "area query served from cache");
        }
        Ok(rows)
    }

    /// Paged export with an optional value condition.
    pub fn cell_export(
        &self,
        cube: CubeId,
        selector: &AreaSelector,
        page_size: usize,
        after_key: Option<&[IdentifierType]>,
        condition: Option<Condition>,
    ) -> Result<ExportPage> {
        let rows = self.cell_area(cube, selector)?;
        let start = match after_key {
            Some(key) => rows.partition_point(|(k, _, _)| {
                crate::ident::compare_keys(k, key) != std::cmp::Ordering::Greater
            }),
            None => 0,
        };
        let mut page = Vec::with_capacity(page_size.min(1024));
        let mut index = start;
        while index < rows.len() && page.len() < page_size {
            let row = &rows[index];
            if condition.map_or(true, |c| c.matches(&row.1)) {
                page.push(row.clone());
            }
            index += 1;
        }
        let complete = index >= rows.len();
        let last_key = page.last().map(|(k, _, _)| k.clone()).or_else(|| {
            if complete {
                None
            } else {
                rows.get(index.saturating_sub(1)).map(|(k, _, _)| k.clone())
            }
        });
        Ok(ExportPage {
            rows: page,
            last_key,
            complete,
        })
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Write one cell. Consolidated coordinates are splashed onto their base
    /// cells according to `mode`.
    pub fn cell_replace(
        &self,
        cube: CubeId,
        key: &[IdentifierType],
        value: CellValue,
        mode: SplashMode,
        session: SessionId,
    ) -> Result<()> {
        self.check_writable()?;
        self.check_session(session)?;
        self.cell_replace_internal(cube, key, &value, mode, session)?;
        let (type_code, encoded) = encode_cell_value(&value);
        self.journal_append(
            session,
            "SET_CELL",
            vec![
                cube.to_string(),
                crate::persist::join_ids(key.iter().copied()),
                type_code.to_string(),
                encoded,
                splash_mode_name(mode).to_string(),
            ],
        );
        Ok(())
    }

    fn cell_replace_internal(
        &self,
        cube: CubeId,
        key: &[IdentifierType],
        value: &CellValue,
        mode: SplashMode,
        session: SessionId,
    ) -> Result<()> {
        let ctx = self.query_context(cube)?;
        ctx.validate_key(key)?;
        let write_lock = {
            let state = self.state.read();
            let entry = state.cubes.get(&cube).ok_or(EngineError::UnknownId(cube))?;
            Arc::clone(&entry.write_lock)
        };
        let _write_guard = write_lock.lock();

        let edits: Vec<CellEdit> = if ctx.is_base_key(key) {
            match value {
                CellValue::Str(_) => {
                    if !ctx.is_string_key(key) {
                        return Err(EngineError::TypeMismatch(
                            "string write to a numeric cell".to_string(),
                        ));
                    }
                    vec![(key.to_vec(), value.clone(), None)]
                }
                CellValue::Numeric(v) => {
                    if ctx.is_string_key(key) {
                        return Err(EngineError::TypeMismatch(
                            "numeric write to a string cell".to_string(),
                        ));
                    }
                    let new = match mode {
                        SplashMode::Add => ctx.storage.get(key).0.as_f64() + v,
                        _ => *v,
                    };
                    vec![(key.to_vec(), CellValue::Numeric(new), None)]
                }
                CellValue::Empty => vec![(key.to_vec(), CellValue::Empty, None)],
                CellValue::Error(_) => {
                    return Err(EngineError::TypeMismatch(
                        "error markers cannot be written".to_string(),
                    ));
                }
            }
        } else {
            // consolidated coordinate: splash
            match value {
                CellValue::Str(_) => {
                    return Err(EngineError::TypeMismatch(
                        "string write to a consolidated cell".to_string(),
                    ));
                }
                CellValue::Error(_) => {
                    return Err(EngineError::TypeMismatch(
                        "error markers cannot be written".to_string(),
                    ));
                }
                CellValue::Empty => {
                    let base = self.expand_base_cells(&ctx, key)?;
                    base.into_iter()
                        .map(|(k, _)| (k, CellValue::Empty, None))
                        .collect()
                }
                CellValue::Numeric(v) => {
                    let base = self.expand_base_cells(&ctx, key)?;
                    let storage = Arc::clone(&ctx.storage);
                    let limits = SplashLimits {
                        allow: self.config.engine.splash_limit_allow,
                        warn: self.config.engine.splash_limit_warn,
                        reject: self.config.engine.splash_limit_reject,
                    };
                    let numeric_edits = splash_edits(
                        mode,
                        *v,
                        &base,
                        move |k| storage.get(k).0.as_f64(),
                        &limits,
                    )?;
                    numeric_edits
                        .into_iter()
                        .map(|(k, v)| (k, CellValue::Numeric(v), None))
                        .collect()
                }
            }
        };
        self.apply_edits(cube, &ctx, session, edits)
    }

    /// Weighted base-cell expansion of a consolidated key, with the splash
    /// reject limit enforced before materialization.
    fn expand_base_cells(
        &self,
        ctx: &QueryContext,
        key: &[IdentifierType],
    ) -> Result<Vec<(Key, f64)>> {
        let mut lists: Vec<Arc<Vec<(ElementId, f64)>>> = Vec::with_capacity(key.len());
        let mut count = 1f64;
        for (dim, id) in key.iter().enumerate() {
            let base = ctx.dims[dim]
                .base
                .get(id)
                .cloned()
                .ok_or(EngineError::UnknownId(*id))?;
            count *= base.len() as f64;
            lists.push(base);
        }
        if count > self.config.engine.splash_limit_reject {
            return Err(EngineError::SplashRejected(format!(
                "{count} base cells exceed the reject limit"
            )));
        }
        let mut cells = Vec::with_capacity(count as usize);
        let mut positions = vec![0usize; lists.len()];
        'fanout: loop {
            let mut cell_key = Vec::with_capacity(lists.len());
            let mut weight = 1.0;
            for (dim, list) in lists.iter().enumerate() {
                let (id, w) = list[positions[dim]];
                cell_key.push(id);
                weight *= w;
            }
            cells.push((cell_key, weight));
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
        Ok(cells)
    }

    /// Check locks, capture undo records, apply the edits, invalidate.
    fn apply_edits(
        &self,
        cube: CubeId,
        ctx: &QueryContext,
        session: SessionId,
        edits: Vec<CellEdit>,
    ) -> Result<()> {
        if edits.is_empty() {
            return Ok(());
        }
        let cube_locks = self.locks.locks_for_cube(cube);
        // conflicts first, before any state changes
        for (key, _, _) in &edits {
            for lock in &cube_locks {
                if lock.area.contains(key)
                    && lock.session != session
                    && session != SYSTEM_SESSION
                {
                    return Err(EngineError::LockConflict(cube));
                }
            }
        }
        for (key, _, _) in &edits {
            for lock in &cube_locks {
                if lock.area.contains(key) {
                    let (old, rule) = ctx.storage.get(key);
                    lock.journal.lock().push(UndoRecord {
                        key: key.clone(),
                        old,
                        rule,
                    })?;
                }
            }
        }
        let touched = edits.len();
        ctx.storage.apply(edits);
        {
            let state = self.state.read();
            if let Some(entry) = state.cubes.get(&cube) {
                entry.data_token.fetch_add(1, Ordering::SeqCst);
            }
        }
        self.cache.invalidate_write(touched);
        Ok(())
    }

    /// Bulk replace with a per-row error map; each row is atomic on its own.
    pub fn cell_replace_bulk(
        &self,
        cube: CubeId,
        rows: &[(Key, CellValue)],
        mode: SplashMode,
        session: SessionId,
    ) -> Result<BulkResult> {
        self.check_writable()?;
        self.check_session(session)?;
        let mut result = BulkResult::default();
        for (index, (key, value)) in rows.iter().enumerate() {
            match self.cell_replace(cube, key, value.clone(), mode, session) {
                Ok(()) => result.applied += 1,
                Err(e) => result.errors.push((index, e)),
            }
        }
        Ok(result)
    }

    /// Adjust the cell at `key` until the consolidated read hits `target`.
    pub fn cell_goalseek(
        &self,
        cube: CubeId,
        key: &[IdentifierType],
        target: f64,
        opts: GoalseekOptions,
        session: SessionId,
    ) -> Result<()> {
        self.check_writable()?;
        self.check_session(session)?;
        let ctx = self.query_context(cube)?;
        ctx.validate_key(key)?;
        if !ctx.is_base_key(key) {
            let cells: f64 = key
                .iter()
                .enumerate()
                .map(|(dim, id)| {
                    ctx.dims[dim].base.get(id).map_or(1.0, |b| b.len() as f64)
                })
                .product();
            if cells > opts.cell_limit as f64 {
                return Err(EngineError::CellLimit {
                    touched: cells as usize,
                    limit: opts.cell_limit,
                });
            }
        }
        let start = Instant::now();
        for _ in 0..self.config.engine.goalseek_max_iterations {
            let current = self.cell_value(cube, key)?.value.as_f64();
            if (current - target).abs() <= opts.tolerance {
                return Ok(());
            }
            if start.elapsed() > opts.timeout {
                return Err(EngineError::Timeout);
            }
            let delta = target - current;
            self.cell_replace(
                cube,
                key,
                CellValue::Numeric(delta),
                SplashMode::Add,
                session,
            )?;
        }
        let current = self.cell_value(cube, key)?.value.as_f64();
        if (current - target).abs() <= opts.tolerance {
            Ok(())
        } else {
            Err(EngineError::Timeout)
        }
    }

    // ------------------------------------------------------------------
    // Rules
    // ------------------------------------------------------------------

    pub fn rule_create(&self, cube: CubeId, text: &str) -> Result<RuleId> {
        self.check_writable()?;
        let id = self.rule_create_internal(cube, text, None)?;
        self.journal_append(
            SYSTEM_SESSION,
            "RULE_ADD",
            vec![cube.to_string(), id.to_string(), text.to_string()],
        );
        Ok(id)
    }

    fn rule_create_internal(
        &self,
        cube: CubeId,
        text: &str,
        id: Option<RuleId>,
    ) -> Result<RuleId> {
        let compiled_parts = self.compile_rule(cube, text)?;
        let mut state = self.state.write();
        let entry = state.cubes.get_mut(&cube).ok_or(EngineError::UnknownId(cube))?;
        let id = id.unwrap_or(entry.next_rule_id);
        entry.next_rule_id = entry.next_rule_id.max(id + 1);
        let (target, expr) = compiled_parts;
        entry.rules.push(CompiledRule {
            id,
            text: text.to_string(),
            target,
            expr,
        });
        entry.rules_token += 1;
        debug!(cube, rule = id, "rule created");
        Ok(id)
    }

    fn compile_rule(
        &self,
        cube: CubeId,
        text: &str,
    ) -> Result<(CoordRef<ElementId>, crate::rule::Expr<CoordRef<ElementId>>)> {
        let parsed = parser::parse_rule(text)?;
        let state = self.state.read();
        let entry = state.cubes.get(&cube).ok_or(EngineError::UnknownId(cube))?;
        let dims: Vec<&Dimension> = entry
            .cube
            .dimension_ids()
            .iter()
            .map(|id| {
                state
                    .dimensions
                    .get(id)
                    .ok_or(EngineError::UnknownId(*id))
            })
            .collect::<Result<_>>()?;
        let resolve = |coords: CoordRef<String>| -> Result<CoordRef<ElementId>> {
            if coords.len() != dims.len() {
                return Err(EngineError::ParseError(format!(
                    "coordinate list has {} entries, cube has {} dimensions",
                    coords.len(),
                    dims.len()
                )));
            }
            coords
                .into_iter()
                .enumerate()
                .map(|(ordinal, slot)| match slot {
                    None => Ok(None),
                    Some(name) => dims[ordinal]
                        .element_by_name(&name)
                        .map(|e| Some(e.id)),
                })
                .collect()
        };
        let target = resolve(parsed.target)?;
        let expr = parsed.expr.map_sources(&mut |coords| resolve(coords))?;
        Ok((target, expr))
    }

    pub fn rule_modify(&self, cube: CubeId, id: RuleId, text: &str) -> Result<()> {
        self.check_writable()?;
        self.rule_modify_internal(cube, id, text)?;
        self.journal_append(
            SYSTEM_SESSION,
            "RULE_MOD",
            vec![cube.to_string(), id.to_string(), text.to_string()],
        );
        Ok(())
    }

    fn rule_modify_internal(&self, cube: CubeId, id: RuleId, text: &str) -> Result<()> {
        let (target, expr) = self.compile_rule(cube, text)?;
        let mut state = self.state.write();
        let entry = state.cubes.get_mut(&cube).ok_or(EngineError::UnknownId(cube))?;
        let rule = entry
            .rules
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(EngineError::NoSuchRule(id))?;
        rule.text = text.to_string();
        rule.target = target;
        rule.expr = expr;
        entry.rules_token += 1;
        Ok(())
    }

    pub fn rule_delete(&self, cube: CubeId, id: RuleId) -> Result<()> {
        self.check_writable()?;
        self.rule_delete_internal(cube, id)?;
        self.journal_append(
            SYSTEM_SESSION,
            "RULE_DEL",
            vec![cube.to_string(), id.to_string()],
        );
        Ok(())
    }

    fn rule_delete_internal(&self, cube: CubeId, id: RuleId) -> Result<()> {
        let mut state = self.state.write();
        let entry = state.cubes.get_mut(&cube).ok_or(EngineError::UnknownId(cube))?;
        let before = entry.rules.len();
        entry.rules.retain(|r| r.id != id);
        if entry.rules.len() == before {
            return Err(EngineError::NoSuchRule(id));
        }
        entry.rules_token += 1;
        Ok(())
    }

    pub fn rule_list(&self, cube: CubeId) -> Result<Vec<(RuleId, String)>> {
        let state = self.state.read();
        let entry = state.cubes.get(&cube).ok_or(EngineError::UnknownId(cube))?;
        Ok(entry.rules.iter().map(|r| (r.id, r.text.clone())).collect())
    }

    // ------------------------------------------------------------------
    // Locks
    // ------------------------------------------------------------------

    pub fn lock_acquire(
        &self,
        cube: CubeId,
        selector: &AreaSelector,
        session: SessionId,
    ) -> Result<LockId> {
        self.check_writable()?;
        self.check_session(session)?;
        let ctx = self.query_context(cube)?;
        let area = self.resolve_selector(&ctx, selector)?;
        let lock = self.locks.acquire(cube, area, session)?;
        Ok(lock.id)
    }

    pub fn lock_commit(&self, lock_id: LockId, session: SessionId) -> Result<()> {
        self.check_session(session)?;
        let lock = self.locks.get(lock_id)?;
        if lock.session != session && session != SYSTEM_SESSION {
            return Err(EngineError::NotAuthorized(format!(
                "lock {lock_id} belongs to session {}",
                lock.session
            )));
        }
        lock.journal.lock().discard()?;
        self.locks.release(lock_id)?;
        info!(lock = lock_id, "lock committed");
        Ok(())
    }

    pub fn lock_rollback(&self, lock_id: LockId, session: SessionId) -> Result<()> {
        self.check_session(session)?;
        let lock = self.locks.get(lock_id)?;
        if lock.session != session && session != SYSTEM_SESSION {
            return Err(EngineError::NotAuthorized(format!(
                "lock {lock_id} belongs to session {}",
                lock.session
            )));
        }
        let records = lock.journal.lock().drain_for_rollback()?;
        let restored = records.len();
        apply_undo_records(&self.state, &self.cache, lock.cube, records.clone());
        // journal the restores so replay reproduces the rollback
        for record in records {
            let (type_code, encoded) = encode_cell_value(&record.old);
            self.journal_append(
                session,
                "SET_CELL",
                vec![
                    lock.cube.to_string(),
                    crate::persist::join_ids(record.key.iter().copied()),
                    type_code.to_string(),
                    encoded,
                    splash_mode_name(SplashMode::Disabled).to_string(),
                ],
            );
        }
        self.locks.release(lock_id)?;
        info!(lock = lock_id, restored, "lock rolled back");
        Ok(())
    }

    /// Bytes held by the lock's undo journal.
    pub fn lock_byte_count(&self, lock_id: LockId) -> Result<u64> {
        let lock = self.locks.get(lock_id)?;
        let bytes = lock.journal.lock().byte_count();
        Ok(bytes)
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Write the full snapshot and archive the journal.
    pub fn save(&self) -> Result<()> {
        self.check_writable()?;
        if let Some(journal) = &self.journal {
            journal.flush();
        }
        let state = self.state.read();
        let registry = Registry {
            last_saved: chrono::Utc::now().timestamp(),
            dimensions: state
                .dimensions
                .values()
                .map(|d| (d.id(), d.name().to_string()))
                .collect(),
            cubes: state
                .cubes
                .values()
                .map(|e| {
                    (
                        e.cube.id(),
                        e.cube.name().to_string(),
                        e.cube.dimension_ids().to_vec(),
                    )
                })
                .collect(),
        };
        for dim in state.dimensions.values() {
            snapshot::save_dimension(&self.data_dir, dim)?;
        }
        for entry in state.cubes.values() {
            let rules: Vec<(RuleId, String)> = entry
                .rules
                .iter()
                .map(|r| (r.id, r.text.clone()))
                .collect();
            snapshot::save_cube(&self.data_dir, &entry.cube, &entry.storage, &rules)?;
        }
        snapshot::save_registry(&self.data_dir, &registry)?;
        drop(state);
        journal::archive_journal(&self.data_dir, self.config.storage.keep_archived_journals)?;
        if let Some(journal) = &self.journal {
            journal.reopen();
        }
        info!("snapshot saved");
        Ok(())
    }

    fn load(&mut self) -> Result<()> {
        let Some(registry) = snapshot::load_registry(&self.data_dir)? else {
            return Ok(());
        };
        let mut pending_rules: Vec<(CubeId, RuleId, String)> = Vec::new();
        {
            let mut state = self.state.write();
            for (id, _) in &registry.dimensions {
                let dim = snapshot::load_dimension(&self.data_dir, *id)?;
                state.next_dimension_id = state.next_dimension_id.max(id + 1);
                state.dimensions.insert(*id, dim);
            }
            for (id, _, _) in &registry.cubes {
                let file = snapshot::load_cube(&self.data_dir, *id)?;
                let storage = Arc::new(MixedStorage::new());
                storage.apply(file.cells);
                state.next_cube_id = state.next_cube_id.max(id + 1);
                state.cubes.insert(
                    *id,
                    CubeEntry {
                        cube: file.cube,
                        storage,
                        rules: Vec::new(),
                        next_rule_id: 1,
                        rules_token: 0,
                        data_token: AtomicU64::new(0),
                        write_lock: Arc::new(Mutex::new(())),
                    },
                );
                pending_rules
                    .extend(file.rules.into_iter().map(|(rid, text)| (*id, rid, text)));
            }
        }
        // rules compile once every dimension and cube is in place
        for (cube, rule_id, text) in pending_rules {
            if let Err(e) = self.rule_create_internal(cube, &text, Some(rule_id)) {
                warn!(cube, rule = rule_id, "dropping unparsable rule: {e}");
            }
        }
        let records = journal::read_journal(&self.data_dir, registry.last_saved)?;
        let count = records.len();
        for record in records {
            if let Err(e) = self.apply_record(&record) {
                warn!(command = %record.command, "journal replay skipped record: {e}");
            }
        }
        if count > 0 {
            info!(records = count, "journal replayed");
        }
        Ok(())
    }

    /// Apply one journal record during replay.
    fn apply_record(&self, record: &JournalRecord) -> Result<()> {
        let args = &record.args;
        let arg = |i: usize| -> Result<&String> {
            args.get(i).ok_or_else(|| {
                EngineError::FileCorrupt(format!("{}: missing argument {i}", record.command))
            })
        };
        let parse_u32 = |i: usize| -> Result<u32> {
            arg(i)?.parse::<u32>().map_err(|_| {
                EngineError::FileCorrupt(format!("{}: bad numeric argument {i}", record.command))
            })
        };
        match record.command.as_str() {
            "ADD_DIMENSION" => {
                self.create_dimension_internal(arg(1)?, Some(parse_u32(0)?))?;
            }
            "DELETE_DIMENSION" => {
                let id = parse_u32(0)?;
                self.state.write().dimensions.remove(&id);
            }
            "ADD_CUBE" => {
                let dims: Vec<DimensionId> = crate::persist::parse_ids(arg(2)?)?;
                self.create_cube_internal(arg(1)?, &dims, Some(parse_u32(0)?))?;
            }
            "DELETE_CUBE" => {
                let id = parse_u32(0)?;
                self.state.write().cubes.remove(&id);
            }
            "ADD_ELEMENT" => {
                let kind = ElementKind::from_code(parse_u32(2)?)
                    .ok_or_else(|| EngineError::FileCorrupt("bad kind code".to_string()))?;
                self.add_element_internal(parse_u32(0)?, arg(1)?, kind)?;
            }
            "RENAME_ELEMENT" => {
                self.rename_element_internal(parse_u32(0)?, parse_u32(1)?, arg(2)?)?;
            }
            "CHANGE_ELEMENT" => {
                let kind = ElementKind::from_code(parse_u32(2)?)
                    .ok_or_else(|| EngineError::FileCorrupt("bad kind code".to_string()))?;
                self.change_element_kind_internal(parse_u32(0)?, parse_u32(1)?, kind)?;
            }
            "MOVE_ELEMENT" => {
                self.move_element_internal(parse_u32(0)?, parse_u32(1)?, parse_u32(2)?)?;
            }
            "ADD_CHILDREN" => {
                let children: Vec<u32> = crate::persist::parse_ids(arg(2)?)?;
                let weights: Vec<f64> = if arg(3)?.is_empty() {
                    Vec::new()
                } else {
                    arg(3)?
                        .split(',')
                        .map(|w| {
                            w.parse::<f64>().map_err(|_| {
                                EngineError::FileCorrupt(format!("bad weight '{w}'"))
                            })
                        })
                        .collect::<Result<_>>()?
                };
                let pairs: Vec<(u32, f64)> = children.into_iter().zip(weights).collect();
                self.add_children_internal(parse_u32(0)?, parse_u32(1)?, &pairs)?;
            }
            "REMOVE_CHILDREN" => {
                let which: Vec<u32> = crate::persist::parse_ids(arg(2)?)?;
                let which = if which.is_empty() { None } else { Some(which) };
                self.remove_children_internal(parse_u32(0)?, parse_u32(1)?, which.as_deref())?;
            }
            "DELETE_ELEMENT" => {
                self.delete_elements_internal(parse_u32(0)?, &[parse_u32(1)?])?;
            }
            "DELETE_ELEMENTS" => {
                let ids: Vec<u32> = crate::persist::parse_ids(arg(1)?)?;
                self.delete_elements_internal(parse_u32(0)?, &ids)?;
            }
            "CLEAR_ELEMENTS" => {
                self.clear_elements_internal(parse_u32(0)?)?;
            }
            "SET_CELL" => {
                let cube = parse_u32(0)?;
                let key: Key = crate::persist::parse_ids(arg(1)?)?;
                let value = decode_cell_value(arg(2)?, arg(3)?)?;
                let mode = splash_mode_from_name(arg(4)?)?;
                self.cell_replace_internal(cube, &key, &value, mode, SYSTEM_SESSION)?;
            }
            "RULE_ADD" => {
                self.rule_create_internal(parse_u32(0)?, arg(2)?, Some(parse_u32(1)?))?;
            }
            "RULE_MOD" => {
                self.rule_modify_internal(parse_u32(0)?, parse_u32(1)?, arg(2)?)?;
            }
            "RULE_DEL" => {
                self.rule_delete_internal(parse_u32(0)?, parse_u32(1)?)?;
            }
            other => {
                return Err(EngineError::FileCorrupt(format!(
                    "unknown journal command '{other}'"
                )));
            }
        }
        Ok(())
    }

    /// The value cache, exposed for diagnostics.
    pub fn cache(&self) -> &ValueCache {
        &self.cache
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ----------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------

fn collect_rows(stream: &mut dyn CellStream, stop: &AtomicBool) -> Result<Vec<CachedRow>> {
    let mut rows = Vec::new();
    let mut ticks = 0u32;
    while stream.next() {
        ticks += 1;
        if ticks % 1024 == 0 && stop.load(Ordering::Relaxed) {
            return Err(EngineError::Cancelled);
        }
        rows.push((stream.key().to_vec(), stream.value(), stream.rule_id()));
    }
    Ok(rows)
}

fn apply_undo_records(
    state: &Arc<RwLock<EngineState>>,
    cache: &Arc<ValueCache>,
    cube: CubeId,
    records: Vec<UndoRecord>,
) {
    let storage = {
        let state = state.read();
        match state.cubes.get(&cube) {
            Some(entry) => {
                entry.data_token.fetch_add(1, Ordering::SeqCst);
                Arc::clone(&entry.storage)
            }
            None => return,
        }
    };
    let count = records.len();
    // newest first: later writes to the same cell are undone before earlier
    // ones, leaving the oldest recorded value in place
    storage.apply(
        records
            .into_iter()
            .map(|r| (r.key, r.old, r.rule))
            .collect(),
    );
    cache.invalidate_write(count);
}

fn encode_cell_value(value: &CellValue) -> (u8, String) {
    match value {
        CellValue::Numeric(v) => (1, v.to_string()),
        CellValue::Str(s) => (2, s.clone()),
        CellValue::Empty | CellValue::Error(_) => (0, String::new()),
    }
}

fn decode_cell_value(type_code: &str, encoded: &str) -> Result<CellValue> {
    match type_code {
        "0" => Ok(CellValue::Empty),
        "1" => encoded
            .parse::<f64>()
            .map(CellValue::Numeric)
            .map_err(|_| EngineError::FileCorrupt(format!("bad cell value '{encoded}'"))),
        "2" => Ok(CellValue::Str(encoded.to_string())),
        other => Err(EngineError::FileCorrupt(format!(
            "bad cell type code '{other}'"
        ))),
    }
}

fn splash_mode_name(mode: SplashMode) -> &'static str {
    match mode {
        SplashMode::Disabled => "disabled",
        SplashMode::Equal => "equal",
        SplashMode::Proportional => "proportional",
        SplashMode::Add => "add",
    }
}

fn splash_mode_from_name(name: &str) -> Result<SplashMode> {
    match name {
        "disabled" => Ok(SplashMode::Disabled),
        "equal" => Ok(SplashMode::Equal),
        "proportional" => Ok(SplashMode::Proportional),
        "add" => Ok(SplashMode::Add),
        other => Err(EngineError::FileCorrupt(format!(
            "bad splash mode '{other}'"
        ))),
    }
}
