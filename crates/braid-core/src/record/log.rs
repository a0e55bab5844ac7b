//! The append-only event log file.
//!
//! One workspace, one file: `.braid/issues.jsonl`. [`EventLog`] owns the
//! path and hands out positions; it never interprets records beyond schema
//! validation. Appends take the exclusive advisory lock, reads take the
//! shared one, and a reconciliation rewrite replaces the file atomically
//! via a temp file and rename.
//!
//! A crash can leave a torn final line. Writers repair it by truncating to
//! the last complete record before appending; readers simply ignore the
//! torn tail. Either way every complete record survives.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::lock::{DEFAULT_LOCK_TIMEOUT, LogReadLock, LogWriteLock};
use crate::record::{Record, codec};

use super::codec::RecordId;

/// File name of the event log inside the workspace data directory.
pub const LOG_FILE: &str = "issues.jsonl";

/// A record read back from the log, with its position and identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// 0-based index among record lines. Comments and blanks do not count;
    /// skipped unknown-type records do.
    pub position: u64,
    /// Content-addressed identity, recomputed at parse time.
    pub id: RecordId,
    pub record: Record,
}

/// Outcome of a torn-tail repair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub path: PathBuf,
    pub bytes_removed: u64,
}

impl RecoveryReport {
    #[must_use]
    pub const fn was_torn(&self) -> bool {
        self.bytes_removed > 0
    }
}

/// Handle to one workspace's append-only log.
///
/// The handle caches the next append position and revalidates it under the
/// write lock whenever the file length moved underneath it, so several
/// processes can interleave appends and still hand out consistent
/// positions.
#[derive(Debug)]
pub struct EventLog {
    path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
    known_len: u64,
    next_position: u64,
}

impl EventLog {
    /// Open (creating if missing) the log at `path`, repairing any torn
    /// tail left by a crashed writer.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let lock_path = lock_path_for(&path);
        let mut log = Self {
            path,
            lock_path,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            // Forces the first refresh to scan the file.
            known_len: u64::MAX,
            next_position: 0,
        };

        let lock = LogWriteLock::acquire(&log.lock_path, log.lock_timeout)?;
        let mut file = log.open_file()?;
        log.refresh_locked(&mut file)?;
        drop(lock);
        Ok(log)
    }

    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Position the next appended record will receive.
    #[must_use]
    pub const fn next_position(&self) -> u64 {
        self.next_position
    }

    /// Validate and append one record, returning its position.
    ///
    /// The write is flushed with `sync_all` before the position is handed
    /// back, so an acknowledged append survives a crash.
    pub fn append(&mut self, record: &Record) -> Result<u64> {
        record.validate()?;
        let line = codec::to_line(record).map_err(|e| Error::storage("serialize record", e))?;

        let _lock = LogWriteLock::acquire(&self.lock_path, self.lock_timeout)?;
        let mut file = self.open_file()?;
        self.refresh_locked(&mut file)?;

        file.seek(SeekFrom::End(0))?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_all()?;

        let position = self.next_position;
        self.next_position += 1;
        self.known_len += line.len() as u64 + 1;
        Ok(position)
    }

    /// Read every record at or past `position`, in log order.
    ///
    /// Lazy in the cursor sense: callers restart from any previously
    /// returned position. A torn final line is skipped (with a warning),
    /// never repaired, since readers may not hold the write lock.
    pub fn read_from(&self, position: u64) -> Result<Vec<LogEntry>> {
        let content = {
            let _lock = LogReadLock::acquire(&self.lock_path, self.lock_timeout)?;
            match std::fs::read_to_string(&self.path) {
                Ok(content) => content,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
                Err(e) => return Err(Error::storage("read event log", e)),
            }
        };

        let keep = complete_len(&content);
        if keep < content.len() {
            tracing::warn!(
                path = %self.path.display(),
                bytes = content.len() - keep,
                "ignoring torn trailing line in event log"
            );
        }

        let mut entries = codec::parse_lines(&content[..keep])
            .map_err(|e| Error::storage(format!("parse {}", self.path.display()), e))?;
        entries.retain(|entry| entry.position >= position);
        Ok(entries)
    }

    /// Read the whole log.
    pub fn read_all(&self) -> Result<Vec<LogEntry>> {
        self.read_from(0)
    }

    /// Atomically replace the log's contents with `records`.
    ///
    /// Used after reconciliation. The new body is written to a temp file
    /// in the same directory, synced, then renamed over the log, so
    /// readers observe either the old log or the new one.
    pub fn rewrite(&mut self, records: &[Record]) -> Result<()> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| Error::storage_msg("event log path has no parent directory"))?;

        let _lock = LogWriteLock::acquire(&self.lock_path, self.lock_timeout)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        for record in records {
            codec::write_line(tmp.as_file_mut(), record)
                .map_err(|e| Error::storage("write rewritten event log", e))?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .map_err(|e| Error::storage("replace event log", e))?;

        self.next_position = records.len() as u64;
        self.known_len = std::fs::metadata(&self.path)?.len();
        Ok(())
    }

    /// Repair a torn tail in place, without appending anything.
    pub fn recover(&mut self) -> Result<RecoveryReport> {
        let _lock = LogWriteLock::acquire(&self.lock_path, self.lock_timeout)?;
        let mut file = self.open_file()?;
        let bytes_removed = if tail_is_torn(&mut file)? {
            recover_in_place(&mut file, &self.path)?
        } else {
            0
        };
        self.refresh_locked(&mut file)?;
        Ok(RecoveryReport {
            path: self.path.clone(),
            bytes_removed,
        })
    }

    fn open_file(&self) -> Result<File> {
        Ok(OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?)
    }

    /// Bring `next_position` back in line with the file, repairing a torn
    /// tail first. Caller must hold the write lock.
    fn refresh_locked(&mut self, file: &mut File) -> Result<()> {
        if tail_is_torn(file)? {
            recover_in_place(file, &self.path)?;
        }
        let len = file.metadata()?.len();
        if len != self.known_len {
            file.seek(SeekFrom::Start(0))?;
            let mut content = String::new();
            file.read_to_string(&mut content)?;
            self.next_position = count_record_lines(&content);
            self.known_len = len;
        }
        Ok(())
    }
}

/// Lock file sits next to the log: `issues.jsonl.lock`.
fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map_or_else(|| std::ffi::OsString::from("log"), ToOwned::to_owned);
    name.push(".lock");
    path.with_file_name(name)
}

/// Length of the prefix ending at the last complete (newline-terminated)
/// line. The empty file and a file ending in `\n` are already complete.
fn complete_len(content: &str) -> usize {
    if content.is_empty() || content.ends_with('\n') {
        content.len()
    } else {
        content.rfind('\n').map_or(0, |pos| pos + 1)
    }
}

fn count_record_lines(body: &str) -> u64 {
    body.lines()
        .filter(|line| {
            let trimmed = line.trim();
            !trimmed.is_empty() && !trimmed.starts_with('#')
        })
        .count() as u64
}

fn tail_is_torn(file: &mut File) -> Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0_u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

/// Truncate the file to its last complete line. Caller must hold the
/// write lock.
fn recover_in_place(file: &mut File, path: &Path) -> Result<u64> {
    file.seek(SeekFrom::Start(0))?;
    let mut content = String::new();
    file.read_to_string(&mut content)?;

    let keep = complete_len(&content);
    let removed = (content.len() - keep) as u64;
    if removed > 0 {
        file.set_len(keep as u64)?;
        file.sync_all()?;
        tracing::warn!(
            path = %path.display(),
            bytes_removed = removed,
            "dropped torn trailing line from event log"
        );
    }
    Ok(removed)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
