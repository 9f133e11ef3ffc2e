// Durable Consensus State
//
// Crash-durable storage for the hard state, the log entries and the
// snapshot. The byte layout is private to each implementation; the
// framing used by `FileStorage` is length-prefixed bincode records with
// CRC validation and corruption detection.
//
// Writes are small and synchronous: the actor requires every barrier to
// complete before the RPC reply that depends on it leaves the node.

use crate::consensus::{HardState, LogEntry, LogIndex, Snapshot};
use crate::error::{RaftError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Everything a node must recover after a crash
#[derive(Debug, Clone)]
pub struct DurableState {
    pub hard_state: HardState,
    pub snapshot: Snapshot,
    /// Entries beyond the snapshot, in log order
    pub entries: Vec<LogEntry>,
}

/// Crash-durable backing store for one consensus actor
pub trait Storage: Send + 'static {
    /// Recover the persisted state, or `None` on first boot
    fn load(&mut self) -> Result<Option<DurableState>>;

    /// Persist the hard state; must be durable on return
    fn save_hard_state(&mut self, state: &HardState) -> Result<()>;

    /// Persist entries appended at the tail of the log
    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<()>;

    /// Discard persisted entries from `from` through the tail
    fn truncate(&mut self, from: LogIndex) -> Result<()>;

    /// Replace the snapshot and rewrite the remaining log tail
    fn save_snapshot(&mut self, snapshot: &Snapshot, tail: &[LogEntry]) -> Result<()>;
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| RaftError::Storage(format!("encode failed: {e}")))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(|e| RaftError::Storage(format!("decode failed: {e}")))
}

/// Volatile implementation for tests and embedded single-process use
#[derive(Default)]
pub struct MemoryStorage {
    state: Option<DurableState>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn state_mut(&mut self) -> &mut DurableState {
        self.state.get_or_insert_with(|| DurableState {
            hard_state: HardState::default(),
            snapshot: Snapshot {
                index: 0,
                term: 0,
                data: Default::default(),
            },
            entries: Vec::new(),
        })
    }
}

impl Storage for MemoryStorage {
    fn load(&mut self) -> Result<Option<DurableState>> {
        Ok(self.state.clone())
    }

    fn save_hard_state(&mut self, state: &HardState) -> Result<()> {
        self.state_mut().hard_state = state.clone();
        Ok(())
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<()> {
        self.state_mut().entries.extend_from_slice(entries);
        Ok(())
    }

    fn truncate(&mut self, from: LogIndex) -> Result<()> {
        let state = self.state_mut();
        let keep = from.saturating_sub(state.snapshot.index + 1) as usize;
        state.entries.truncate(keep);
        Ok(())
    }

    fn save_snapshot(&mut self, snapshot: &Snapshot, tail: &[LogEntry]) -> Result<()> {
        let state = self.state_mut();
        state.snapshot = snapshot.clone();
        state.entries = tail.to_vec();
        Ok(())
    }
}

const META_FILE: &str = "meta.raft";
const SNAPSHOT_FILE: &str = "snapshot.raft";
const LOG_FILE: &str = "log.raft";

/// File-backed storage: one small rewritten-in-place meta file for the
/// hard state, one for the snapshot, and an append-only record file for
/// the log tail. Record framing is `[len u32][crc32 u32][payload]`.
pub struct FileStorage {
    dir: PathBuf,
    /// Open append handle for the log file
    log: Option<File>,
    /// In-memory mirror of the persisted tail, for rewrites
    entries: Vec<LogEntry>,
    base_index: LogIndex,
}

impl FileStorage {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        std::fs::create_dir_all(dir.as_ref())?;
        Ok(Self {
            dir: dir.as_ref().to_path_buf(),
            log: None,
            entries: Vec::new(),
            base_index: 0,
        })
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn write_framed(&self, name: &str, payload: &[u8]) -> Result<()> {
        let path = self.path(name);
        let tmp = path.with_extension("tmp");
        let mut file = File::create(&tmp)?;
        file.write_all(&(payload.len() as u32).to_le_bytes())?;
        file.write_all(&crc32fast::hash(payload).to_le_bytes())?;
        file.write_all(payload)?;
        file.sync_all()?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn read_framed(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path(name);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&path)?;
        if bytes.len() < 8 {
            return Err(RaftError::Storage(format!("{name} is truncated")));
        }
        let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        let crc = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let payload = bytes
            .get(8..8 + len)
            .ok_or_else(|| RaftError::Storage(format!("{name} is truncated")))?;
        if crc32fast::hash(payload) != crc {
            return Err(RaftError::Storage(format!("{name} failed CRC validation")));
        }
        Ok(Some(payload.to_vec()))
    }

    fn log_writer(&mut self) -> Result<&mut File> {
        match &mut self.log {
            Some(file) => Ok(file),
            slot => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(self.dir.join(LOG_FILE))?;
                Ok(slot.insert(file))
            }
        }
    }

    fn append_records(&mut self, entries: &[LogEntry]) -> Result<()> {
        let mut buffer = Vec::new();
        for entry in entries {
            let payload = encode(entry)?;
            buffer.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            buffer.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
            buffer.extend_from_slice(&payload);
        }
        let file = self.log_writer()?;
        file.write_all(&buffer)?;
        file.sync_data()?;
        Ok(())
    }

    fn rewrite_log(&mut self) -> Result<()> {
        let tmp = self.path(LOG_FILE).with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            let mut buffer = Vec::new();
            for entry in &self.entries {
                let payload = encode(entry)?;
                buffer.extend_from_slice(&(payload.len() as u32).to_le_bytes());
                buffer.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
                buffer.extend_from_slice(&payload);
            }
            file.write_all(&buffer)?;
            file.sync_all()?;
        }
        self.log = None;
        std::fs::rename(&tmp, self.path(LOG_FILE))?;
        Ok(())
    }

    fn read_log_records(&self) -> Result<Vec<LogEntry>> {
        let path = self.path(LOG_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut bytes = Vec::new();
        File::open(&path)?.read_to_end(&mut bytes)?;

        let mut entries = Vec::new();
        let mut offset = 0usize;
        while offset < bytes.len() {
            let index = self.base_index + entries.len() as u64 + 1;
            let header = bytes.get(offset..offset + 8).ok_or(RaftError::Corruption {
                index,
                reason: "truncated record header".to_string(),
            })?;
            let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
            let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
            let payload =
                bytes
                    .get(offset + 8..offset + 8 + len)
                    .ok_or(RaftError::Corruption {
                        index,
                        reason: "truncated record payload".to_string(),
                    })?;
            if crc32fast::hash(payload) != crc {
                return Err(RaftError::Corruption {
                    index,
                    reason: "record failed CRC validation".to_string(),
                });
            }
            entries.push(decode::<LogEntry>(payload)?);
            offset += 8 + len;
        }
        Ok(entries)
    }
}

impl Storage for FileStorage {
    fn load(&mut self) -> Result<Option<DurableState>> {
        let Some(meta) = self.read_framed(META_FILE)? else {
            return Ok(None);
        };
        let hard_state: HardState = decode(&meta)?;

        let snapshot_bytes = self
            .read_framed(SNAPSHOT_FILE)?
            .ok_or_else(|| RaftError::Storage("snapshot file is missing".to_string()))?;
        let snapshot: Snapshot = decode(&snapshot_bytes)?;

        self.base_index = snapshot.index;
        self.entries = self.read_log_records()?;

        Ok(Some(DurableState {
            hard_state,
            snapshot,
            entries: self.entries.clone(),
        }))
    }

    fn save_hard_state(&mut self, state: &HardState) -> Result<()> {
        let payload = encode(state)?;
        self.write_framed(META_FILE, &payload)
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<()> {
        self.append_records(entries)?;
        self.entries.extend_from_slice(entries);
        Ok(())
    }

    fn truncate(&mut self, from: LogIndex) -> Result<()> {
        let keep = from.saturating_sub(self.base_index + 1) as usize;
        if keep >= self.entries.len() {
            return Ok(());
        }
        self.entries.truncate(keep);
        self.rewrite_log()
    }

    fn save_snapshot(&mut self, snapshot: &Snapshot, tail: &[LogEntry]) -> Result<()> {
        let payload = encode(snapshot)?;
        self.write_framed(SNAPSHOT_FILE, &payload)?;
        self.base_index = snapshot.index;
        self.entries = tail.to_vec();
        self.rewrite_log()
    }
}
