//! Journal Files
//!
//! Append-only change log: `journal_<n>.log` files with one mutation per
//! line, `timestamp;user;event;COMMAND;arg1;arg2;...`. The writer scans for
//! the last existing file on open, appends to it, and rotates to the next
//! number once a file grows past the configured threshold. A successful
//! snapshot save archives the journal files (rename to `.archived`) or
//! deletes them.
//!
//! Appends are funneled through a background writer thread; `flush` drains
//! the queue before returning so callers can rely on durability points.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, unbounded, Sender};
use tracing::{debug, error, warn};

use crate::error::{EngineError, Result};
use crate::persist::{escape_field, split_line};

const JOURNAL_STEM: &str = "journal";

/// One journal line.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalRecord {
    /// unix seconds
    pub timestamp: i64,
    pub user: String,
    pub event: String,
    pub command: String,
    pub args: Vec<String>,
}

impl JournalRecord {
    pub fn new(user: &str, event: &str, command: &str, args: Vec<String>) -> Self {
        JournalRecord {
            timestamp: chrono::Utc::now().timestamp(),
            user: user.to_string(),
            event: event.to_string(),
            command: command.to_string(),
            args,
        }
    }

    fn to_line(&self) -> String {
        let mut fields = vec![
            self.timestamp.to_string(),
            escape_field(&self.user),
            escape_field(&self.event),
            self.command.clone(),
        ];
        fields.extend(self.args.iter().map(|a| escape_field(a)));
        fields.join(";")
    }

    fn parse(line: &str) -> Result<Self> {
        let fields = split_line(line);
        if fields.len() < 4 {
            return Err(EngineError::FileCorrupt(format!(
                "journal line too short: '{line}'"
            )));
        }
        let timestamp = fields[0]
            .parse::<i64>()
            .map_err(|_| EngineError::FileCorrupt(format!("bad journal timestamp '{}'", fields[0])))?;
        Ok(JournalRecord {
            timestamp,
            user: fields[1].clone(),
            event: fields[2].clone(),
            command: fields[3].clone(),
            args: fields[4..].to_vec(),
        })
    }
}

fn journal_path(dir: &Path, index: u32) -> PathBuf {
    dir.join(format!("{JOURNAL_STEM}_{index}.log"))
}

/// Index of the last existing journal file, scanning upward from zero.
fn last_journal_index(dir: &Path) -> u32 {
    let mut index = 0;
    while journal_path(dir, index + 1).exists() {
        index += 1;
    }
    index
}

/// Synchronous journal writer with size-based rotation.
pub struct JournalWriter {
    dir: PathBuf,
    index: u32,
    writer: BufWriter<File>,
    bytes: u64,
    rotate_bytes: u64,
}

impl JournalWriter {
    pub fn open(dir: &Path, rotate_bytes: u64) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let index = last_journal_index(dir);
        let path = journal_path(dir, index);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| EngineError::FileOpen(format!("{}: {e}", path.display())))?;
        let bytes = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(JournalWriter {
            dir: dir.to_path_buf(),
            index,
            writer: BufWriter::new(file),
            bytes,
            rotate_bytes,
        })
    }

    pub fn append(&mut self, record: &JournalRecord) -> Result<()> {
        let line = record.to_line();
        writeln!(self.writer, "{line}")?;
        self.bytes += line.len() as u64 + 1;
        if self.bytes > self.rotate_bytes {
            self.rotate()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    fn rotate(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.index += 1;
        let path = journal_path(&self.dir, self.index);
        debug!(file = %path.display(), "journal rotation");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| EngineError::FileOpen(format!("{}: {e}", path.display())))?;
        self.writer = BufWriter::new(file);
        self.bytes = 0;
        Ok(())
    }
}

/// Read every journal record in file-number order, skipping records older
/// than `since` (unix seconds).
pub fn read_journal(dir: &Path, since: i64) -> Result<Vec<JournalRecord>> {
    let mut records = Vec::new();
    let mut index = 0;
    loop {
        let path = journal_path(dir, index);
        if !path.exists() {
            break;
        }
        let reader = BufReader::new(File::open(&path)?);
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() || line.starts_with('#') {
                continue;
            }
            match JournalRecord::parse(&line) {
                Ok(record) => {
                    if record.timestamp >= since {
                        records.push(record);
                    }
                }
                Err(e) => {
                    // a torn final line after a crash is salvage, not failure
                    warn!(file = %path.display(), error = %e, "skipping bad journal line");
                }
            }
        }
        index += 1;
    }
    Ok(records)
}

/// Archive (or delete) every journal file after a successful save.
pub fn archive_journal(dir: &Path, keep: bool) -> Result<()> {
    let mut index = 0;
    loop {
        let path = journal_path(dir, index);
        if !path.exists() {
            break;
        }
        if keep {
            let stamp = chrono::Utc::now().timestamp();
            let archived = dir.join(format!("{JOURNAL_STEM}_{index}.log.{stamp}.archived"));
            fs::rename(&path, archived)?;
        } else {
            fs::remove_file(&path)?;
        }
        index += 1;
    }
    Ok(())
}

enum JournalMsg {
    Append(JournalRecord),
    Flush(Sender<()>),
    /// reopen after the files were archived away
    Reopen(Sender<()>),
    Shutdown,
}

/// Background journal service: appends run on a dedicated writer thread and
/// `flush` drains the queue.
pub struct JournalService {
    tx: Sender<JournalMsg>,
    handle: Option<JoinHandle<()>>,
}

impl JournalService {
    pub fn start(dir: &Path, rotate_bytes: u64) -> Result<Self> {
        let mut writer = JournalWriter::open(dir, rotate_bytes)?;
        let dir = dir.to_path_buf();
        let (tx, rx) = unbounded::<JournalMsg>();
        let handle = std::thread::Builder::new()
            .name("cubist-journal".to_string())
            .spawn(move || {
                while let Ok(msg) = rx.recv() {
                    match msg {
                        JournalMsg::Append(record) => {
                            if let Err(e) = writer.append(&record) {
                                error!("journal append failed: {e}");
                            }
                        }
                        JournalMsg::Flush(reply) => {
                            if let Err(e) = writer.flush() {
                                error!("journal flush failed: {e}");
                            }
                            let _ = reply.send(());
                        }
                        JournalMsg::Reopen(reply) => {
                            let _ = writer.flush();
                            match JournalWriter::open(&dir, writer.rotate_bytes) {
                                Ok(fresh) => writer = fresh,
                                Err(e) => error!("journal reopen failed: {e}"),
                            }
                            let _ = reply.send(());
                        }
                        JournalMsg::Shutdown => {
                            let _ = writer.flush();
                            break;
                        }
                    }
                }
            })?;
        Ok(JournalService {
            tx,
            handle: Some(handle),
        })
    }

    pub fn append(&self, record: JournalRecord) {
        let _ = self.tx.send(JournalMsg::Append(record));
    }

    /// Drain the queue and sync the file.
    pub fn flush(&self) {
        let (reply_tx, reply_rx) = bounded(1);
        if self.tx.send(JournalMsg::Flush(reply_tx)).is_ok() {
            let _ = reply_rx.recv();
        }
    }

    /// Start a fresh journal file; call after archiving the old ones.
    pub fn reopen(&self) {
        let (reply_tx, reply_rx) = bounded(1);
        if self.tx.send(JournalMsg::Reopen(reply_tx)).is_ok() {
            let _ = reply_rx.recv();
        }
    }
}

impl Drop for JournalService {
    fn drop(&mut self) {
        let _ = self.tx.send(JournalMsg::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(command: &str, args: &[&str]) -> JournalRecord {
        JournalRecord::new("admin", "", command, args.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_append_and_read() {
        let temp = TempDir::new().unwrap();
        let mut writer = JournalWriter::open(temp.path(), 1_000_000).unwrap();
        writer.append(&record("ADD_ELEMENT", &["0", "a", "1"])).unwrap();
        writer.append(&record("SET_CELL", &["1", "0,1", "42"])).unwrap();
        writer.flush().unwrap();

        let records = read_journal(temp.path(), 0).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].command, "ADD_ELEMENT");
        assert_eq!(records[0].args, vec!["0", "a", "1"]);
        assert_eq!(records[1].command, "SET_CELL");
    }

    #[test]
    fn test_rotation_and_ordered_read() {
        let temp = TempDir::new().unwrap();
        let mut writer = JournalWriter::open(temp.path(), 64).unwrap();
        for i in 0..20 {
            writer
                .append(&record("SET_CELL", &["1", "0", &i.to_string()]))
                .unwrap();
        }
        writer.flush().unwrap();
        assert!(journal_path(temp.path(), 1).exists());

        let records = read_journal(temp.path(), 0).unwrap();
        assert_eq!(records.len(), 20);
        let values: Vec<String> = records.iter().map(|r| r.args[2].clone()).collect();
        let expected: Vec<String> = (0..20).map(|i| i.to_string()).collect();
        assert_eq!(values, expected);
    }

    #[test]
    fn test_reopen_appends_to_last_file() {
        let temp = TempDir::new().unwrap();
        {
            let mut writer = JournalWriter::open(temp.path(), 64).unwrap();
            for i in 0..10 {
                writer
                    .append(&record("SET_CELL", &["1", "0", &i.to_string()]))
                    .unwrap();
            }
            writer.flush().unwrap();
        }
        {
            let mut writer = JournalWriter::open(temp.path(), 64).unwrap();
            writer.append(&record("SET_CELL", &["1", "0", "99"])).unwrap();
            writer.flush().unwrap();
        }
        let records = read_journal(temp.path(), 0).unwrap();
        assert_eq!(records.last().unwrap().args[2], "99");
    }

    #[test]
    fn test_torn_line_is_skipped() {
        let temp = TempDir::new().unwrap();
        let mut writer = JournalWriter::open(temp.path(), 1_000_000).unwrap();
        writer.append(&record("SET_CELL", &["1", "0", "1"])).unwrap();
        writer.flush().unwrap();
        // simulate a crash mid-write
        let path = journal_path(temp.path(), 0);
        let mut contents = fs::read_to_string(&path).unwrap();
        contents.push_str("170000;us");
        fs::write(&path, contents).unwrap();

        let records = read_journal(temp.path(), 0).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_archive() {
        let temp = TempDir::new().unwrap();
        {
            let mut writer = JournalWriter::open(temp.path(), 1_000_000).unwrap();
            writer.append(&record("SET_CELL", &["1", "0", "1"])).unwrap();
            writer.flush().unwrap();
        }
        archive_journal(temp.path(), false).unwrap();
        assert!(read_journal(temp.path(), 0).unwrap().is_empty());
    }

    #[test]
    fn test_service_flush_drains() {
        let temp = TempDir::new().unwrap();
        let service = JournalService::start(temp.path(), 1_000_000).unwrap();
        for i in 0..50 {
            service.append(record("SET_CELL", &["1", "0", &i.to_string()]));
        }
        service.flush();
        let records = read_journal(temp.path(), 0).unwrap();
        assert_eq!(records.len(), 50);
    }
}
