//! Area Locks and the Rollback Journal
//!
//! A lock reserves an area of a cube for one session. While it is alive,
//! every cell modification intersecting the area appends an undo record to
//! the lock's journal; `rollback` replays the records newest-first,
//! `commit` discards them. Two locks on the same cube must not overlap.
//!
//! The journal is memory-bounded: once the in-memory buffer exceeds its
//! budget the buffered records spill, in chronological order, to a file
//! beside the database. The spill file is itself bounded; exceeding that
//! budget fails the write rather than growing without limit.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::area::Area;
use crate::cell::CellValue;
use crate::error::{EngineError, Result};
use crate::ident::{CubeId, Key, LockId, RuleId, SessionId};

/// Lock subsystem configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// in-memory undo budget per lock, bytes
    #[serde(default = "default_memory_budget")]
    pub memory_budget: usize,
    /// spill-file budget per lock, bytes
    #[serde(default = "default_file_budget")]
    pub file_budget: u64,
    /// seconds between lock sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_memory_budget() -> usize {
    10 * 1024 * 1024
}
fn default_file_budget() -> u64 {
    50 * 1024 * 1024
}
fn default_sweep_interval() -> u64 {
    60
}

impl Default for LockConfig {
    fn default() -> Self {
        LockConfig {
            memory_budget: default_memory_budget(),
            file_budget: default_file_budget(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

/// One undo record: the cell's previous value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UndoRecord {
    pub key: Key,
    pub old: CellValue,
    pub rule: Option<RuleId>,
}

impl UndoRecord {
    fn estimate_bytes(&self) -> usize {
        32 + self.key.len() * 4
            + match &self.old {
                CellValue::Str(s) => s.len(),
                _ => 8,
            }
    }
}

/// Append-only undo journal with file spillover.
pub struct RollbackJournal {
    spill_path: PathBuf,
    mem: Vec<UndoRecord>,
    mem_bytes: usize,
    spill_bytes: u64,
    memory_budget: usize,
    file_budget: u64,
}

impl RollbackJournal {
    fn new(spill_path: PathBuf, config: &LockConfig) -> Self {
        RollbackJournal {
            spill_path,
            mem: Vec::new(),
            mem_bytes: 0,
            spill_bytes: 0,
            memory_budget: config.memory_budget,
            file_budget: config.file_budget,
        }
    }

    /// Record a cell's previous value.
    pub fn push(&mut self, record: UndoRecord) -> Result<()> {
        let bytes = record.estimate_bytes();
        if self.mem_bytes + bytes > self.memory_budget {
            self.spill()?;
        }
        self.mem_bytes += bytes;
        self.mem.push(record);
        Ok(())
    }

    /// Flush the buffered records to the spill file, oldest first.
    fn spill(&mut self) -> Result<()> {
        if self.mem.is_empty() {
            return Ok(());
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.spill_path)?;
        let mut writer = BufWriter::new(file);
        for record in &self.mem {
            let frame = bincode::serialize(record)
                .map_err(|e| EngineError::FileCorrupt(format!("undo frame encode: {e}")))?;
            writer.write_all(&(frame.len() as u32).to_le_bytes())?;
            writer.write_all(&frame)?;
            self.spill_bytes += 4 + frame.len() as u64;
        }
        writer.flush()?;
        debug!(bytes = self.spill_bytes, "rollback journal spilled to file");
        if self.spill_bytes > self.file_budget {
            return Err(EngineError::OutOfMemory(
                "rollback spill file budget exceeded".to_string(),
            ));
        }
        self.mem.clear();
        self.mem_bytes = 0;
        Ok(())
    }

    /// All undo records, newest first, ready for replay.
    pub fn drain_for_rollback(&mut self) -> Result<Vec<UndoRecord>> {
        let mut records = self.read_spilled()?;
        records.append(&mut self.mem);
        records.reverse();
        self.discard()?;
        Ok(records)
    }

    fn read_spilled(&self) -> Result<Vec<UndoRecord>> {
        if !self.spill_path.exists() {
            return Ok(Vec::new());
        }
        let mut reader = BufReader::new(File::open(&self.spill_path)?);
        let mut records = Vec::new();
        let mut len_buf = [0u8; 4];
        loop {
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            let mut frame = vec![0u8; len];
            reader.read_exact(&mut frame)?;
            let record: UndoRecord = bincode::deserialize(&frame)
                .map_err(|e| EngineError::FileCorrupt(format!("undo frame decode: {e}")))?;
            records.push(record);
        }
        Ok(records)
    }

    /// Drop every record and the spill file.
    pub fn discard(&mut self) -> Result<()> {
        self.mem.clear();
        self.mem_bytes = 0;
        self.spill_bytes = 0;
        if self.spill_path.exists() {
            fs::remove_file(&self.spill_path)?;
        }
        Ok(())
    }

    /// Bytes currently held by the journal, memory and file combined.
    pub fn byte_count(&self) -> u64 {
        self.mem_bytes as u64 + self.spill_bytes
    }
}

/// A live lock over a cube area.
pub struct CubeLock {
    pub id: LockId,
    pub cube: CubeId,
    pub area: Area,
    pub session: SessionId,
    pub journal: Mutex<RollbackJournal>,
}

/// Registry of live locks; conflict checks and the sweep run here.
pub struct LockManager {
    config: LockConfig,
    spill_dir: PathBuf,
    locks: Mutex<HashMap<LockId, Arc<CubeLock>>>,
    next_id: AtomicU64,
}

impl LockManager {
    pub fn new(config: LockConfig, spill_dir: &Path) -> Result<Self> {
        fs::create_dir_all(spill_dir)?;
        Ok(LockManager {
            config,
            spill_dir: spill_dir.to_path_buf(),
            locks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Acquire a lock; fails with `LockConflict` when the area overlaps an
    /// existing lock on the same cube.
    pub fn acquire(&self, cube: CubeId, area: Area, session: SessionId) -> Result<Arc<CubeLock>> {
        let mut locks = self.locks.lock();
        for lock in locks.values() {
            if lock.cube == cube && lock.area.overlaps(&area) {
                return Err(EngineError::LockConflict(cube));
            }
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let spill_path = self.spill_dir.join(format!("lock_{id}.undo"));
        let lock = Arc::new(CubeLock {
            id,
            cube,
            area,
            session,
            journal: Mutex::new(RollbackJournal::new(spill_path, &self.config)),
        });
        locks.insert(id, Arc::clone(&lock));
        info!(lock = id, cube, session, "lock acquired");
        Ok(lock)
    }

    pub fn get(&self, id: LockId) -> Result<Arc<CubeLock>> {
        self.locks
            .lock()
            .get(&id)
            .cloned()
            .ok_or(EngineError::UnknownId(id as u32))
    }

    /// Remove the lock from the registry; the caller owns the journal fate.
    pub fn release(&self, id: LockId) -> Result<Arc<CubeLock>> {
        self.locks
            .lock()
            .remove(&id)
            .ok_or(EngineError::UnknownId(id as u32))
    }

    /// The lock covering `key` on `cube`, if any.
    pub fn covering(&self, cube: CubeId, key: &[u32]) -> Option<Arc<CubeLock>> {
        self.locks
            .lock()
            .values()
            .find(|l| l.cube == cube && l.area.contains(key))
            .cloned()
    }

    pub fn locks_for_cube(&self, cube: CubeId) -> Vec<Arc<CubeLock>> {
        self.locks
            .lock()
            .values()
            .filter(|l| l.cube == cube)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn sweep_interval_secs(&self) -> u64 {
        self.config.sweep_interval_secs
    }

    /// Remove locks whose session is no longer alive and hand them to the
    /// caller for implicit rollback.
    pub fn sweep_expired(&self, is_active: impl Fn(SessionId) -> bool) -> Vec<Arc<CubeLock>> {
        let mut locks = self.locks.lock();
        let expired: Vec<LockId> = locks
            .values()
            .filter(|l| !is_active(l.session))
            .map(|l| l.id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| {
                let lock = locks.remove(&id);
                if let Some(lock) = &lock {
                    warn!(lock = lock.id, session = lock.session, "sweeping orphaned lock");
                }
                lock
            })
            .collect()
    }
}
