//! Write-Ahead Logging (WAL) and snapshot persistence for the run store

use super::table::TableSet;
use crate::core::{
    Event, EventId, MethodInstance, Point, Result, Run, RunId, RunStatus, StoreError,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::warn;

pub const WAL_FILE_NAME: &str = "assimrun.wal";
pub const SNAPSHOT_FILE_NAME: &str = "assimrun.snapshot";

// ============================================================================
// WAL Entry Types
// ============================================================================

/// One durable mutation. Entries are validated before they are logged, so
/// replay never has to reject one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WalEntry {
    CreateRun(Run),
    SetRunStatus {
        run_id: RunId,
        status: RunStatus,
        error: Option<String>,
        finished_at: Option<DateTime<Utc>>,
    },
    AppendEvent(Event),
    UpsertMethod(MethodInstance),
    UpsertPoint(Point),
    DeleteRuns { run_ids: Vec<RunId> },
    /// Entries that must become visible together.
    Batch(Vec<WalEntry>),
}

impl WalEntry {
    /// Highest event id this entry appends, if any.
    pub fn max_event_id(&self) -> Option<EventId> {
        match self {
            Self::AppendEvent(event) => Some(event.id),
            Self::Batch(entries) => entries.iter().filter_map(Self::max_event_id).max(),
            _ => None,
        }
    }
}

// ============================================================================
// Store Snapshot
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub version: u32,
    pub runs: Vec<Run>,
    pub methods: Vec<MethodInstance>,
    pub events: Vec<Event>,
    pub points: Vec<Point>,
    /// Kept separately from `events`: the sweeper may have deleted the
    /// newest events, but their ids must never be handed out again.
    pub next_event_id: EventId,
    pub metadata: SnapshotMetadata,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub created_at: DateTime<Utc>,
    pub run_count: usize,
    pub event_count: usize,
    pub point_count: usize,
}

impl StoreSnapshot {
    pub fn new(tables: &TableSet, next_event_id: EventId) -> Self {
        let (runs, methods, events, points) = tables.to_rows();
        let metadata = SnapshotMetadata {
            created_at: Utc::now(),
            run_count: runs.len(),
            event_count: events.len(),
            point_count: points.len(),
        };

        Self {
            version: 1,
            runs,
            methods,
            events,
            points,
            next_event_id,
            metadata,
        }
    }
}

// ============================================================================
// Durability Configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DurabilityMode {
    /// fsync after every entry.
    #[default]
    Sync,
    /// Flush to the OS after every entry, no fsync.
    Async,
    /// Memory only.
    None,
}

impl FromStr for DurabilityMode {
    type Err = String;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.to_ascii_lowercase().as_str() {
            "sync" => Ok(Self::Sync),
            "async" => Ok(Self::Async),
            "none" | "memory" => Ok(Self::None),
            other => Err(format!(
                "durability must be one of: sync, async, none (got '{other}')"
            )),
        }
    }
}

// ============================================================================
// WAL Manager
// ============================================================================

pub struct WalManager {
    wal_path: PathBuf,
    wal_file: Option<BufWriter<File>>,
    durability_mode: DurabilityMode,
    entries_since_checkpoint: usize,
    checkpoint_threshold: usize,
    /// Length of the complete frames on disk. Bytes past it belong to a
    /// write that never returned `Ok`.
    committed_len: u64,
}

impl WalManager {
    /// Open the log for appending. A torn tail left by a crash is cut off
    /// first, so new frames never land behind it.
    pub fn new<P: AsRef<Path>>(wal_path: P, durability_mode: DurabilityMode) -> Result<Self> {
        let wal_path = wal_path.as_ref().to_path_buf();
        if let Some(parent) = wal_path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                StoreError::IoError(format!("Failed to create WAL directory: {}", e))
            })?;
        }

        let mut committed_len = 0;
        let wal_file = if durability_mode != DurabilityMode::None {
            let (_, valid_len) = read_frames(&wal_path)?;
            committed_len = valid_len;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&wal_path)
                .map_err(|e| StoreError::IoError(format!("Failed to open WAL file: {}", e)))?;
            Some(BufWriter::new(file))
        } else {
            None
        };

        let mut wal = Self {
            wal_path,
            wal_file,
            durability_mode,
            entries_since_checkpoint: 0,
            checkpoint_threshold: 1000,
            committed_len,
        };
        wal.discard_torn_bytes()?;
        Ok(wal)
    }

    /// Frame: little-endian u32 length followed by a MessagePack body.
    ///
    /// On failure the file is cut back to the last complete frame, so a
    /// later successful append is never hidden behind a partial one.
    pub fn append(&mut self, entry: &WalEntry) -> Result<()> {
        if self.durability_mode == DurabilityMode::None {
            return Ok(());
        }
        let serialized = rmp_serde::to_vec_named(entry)?;
        let mut frame = Vec::with_capacity(4 + serialized.len());
        frame.extend_from_slice(&(serialized.len() as u32).to_le_bytes());
        frame.extend_from_slice(&serialized);

        self.discard_torn_bytes()?;
        match self.write_frame(&frame) {
            Ok(()) => {
                self.committed_len += frame.len() as u64;
                self.entries_since_checkpoint += 1;
                Ok(())
            }
            Err(err) => {
                if let Err(rollback) = self.truncate_to_committed() {
                    warn!(
                        path = %self.wal_path.display(),
                        error = %rollback,
                        "could not roll back failed WAL append"
                    );
                }
                Err(err)
            }
        }
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        let file = self
            .wal_file
            .as_mut()
            .ok_or_else(|| StoreError::IoError("WAL file not initialized".to_string()))?;
        file.write_all(frame)
            .map_err(|e| StoreError::IoError(format!("Failed to write WAL: {}", e)))?;
        file.flush()
            .map_err(|e| StoreError::IoError(format!("Failed to flush WAL: {}", e)))?;
        if self.durability_mode == DurabilityMode::Sync {
            file.get_mut()
                .sync_data()
                .map_err(|e| StoreError::IoError(format!("Failed to sync WAL: {}", e)))?;
        }
        Ok(())
    }

    /// Cut anything past `committed_len`, whoever wrote it.
    fn discard_torn_bytes(&mut self) -> Result<()> {
        let Some(writer) = self.wal_file.as_ref() else {
            return Ok(());
        };
        let on_disk = writer
            .get_ref()
            .metadata()
            .map_err(|e| StoreError::IoError(format!("Failed to stat WAL: {}", e)))?
            .len();
        if on_disk > self.committed_len {
            warn!(
                path = %self.wal_path.display(),
                torn_bytes = on_disk - self.committed_len,
                "discarding incomplete WAL frame"
            );
            self.truncate_to_committed()?;
        }
        Ok(())
    }

    /// Drop unflushed bytes and shrink the file to `committed_len`. If the
    /// truncation fails the next append retries it before writing.
    fn truncate_to_committed(&mut self) -> Result<()> {
        let writer = self
            .wal_file
            .take()
            .ok_or_else(|| StoreError::IoError("WAL file not initialized".to_string()))?;
        let (file, _unflushed) = writer.into_parts();
        let result = file
            .set_len(self.committed_len)
            .and_then(|()| file.sync_data());
        self.wal_file = Some(BufWriter::new(file));
        result.map_err(|e| StoreError::IoError(format!("Failed to truncate WAL: {}", e)))
    }

    /// Read every complete entry. A torn final frame (crash mid-append) is
    /// dropped; that write never returned, so nobody observed it.
    pub fn read_all(&self) -> Result<Vec<WalEntry>> {
        read_frames(&self.wal_path).map(|(entries, _)| entries)
    }

    pub fn clear(&mut self) -> Result<()> {
        if self.durability_mode == DurabilityMode::None {
            return Ok(());
        }
        self.committed_len = 0;
        self.truncate_to_committed()?;
        self.entries_since_checkpoint = 0;
        Ok(())
    }

    pub fn needs_checkpoint(&self) -> bool {
        self.entries_since_checkpoint >= self.checkpoint_threshold
    }

    pub fn entries_since_checkpoint(&self) -> usize {
        self.entries_since_checkpoint
    }

    pub fn set_checkpoint_threshold(&mut self, threshold: usize) {
        self.checkpoint_threshold = threshold.max(1);
    }
}

/// Complete entries of the log at `path` and the byte length they span.
fn read_frames(path: &Path) -> Result<(Vec<WalEntry>, u64)> {
    if !path.exists() {
        return Ok((Vec::new(), 0));
    }
    let file = File::open(path)
        .map_err(|e| StoreError::IoError(format!("Failed to open WAL for reading: {}", e)))?;
    let mut reader = BufReader::new(file);
    let mut entries = Vec::new();
    let mut valid_len = 0u64;
    loop {
        let mut len_bytes = [0u8; 4];
        match reader.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => {
                return Err(StoreError::IoError(format!(
                    "Failed to read WAL entry length: {}",
                    e
                )));
            }
        }
        let len = u32::from_le_bytes(len_bytes) as usize;
        let mut data = vec![0u8; len];
        match reader.read_exact(&mut data) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                warn!(
                    path = %path.display(),
                    recovered = entries.len(),
                    "discarding torn WAL tail"
                );
                break;
            }
            Err(e) => {
                return Err(StoreError::IoError(format!(
                    "Failed to read WAL entry data: {}",
                    e
                )));
            }
        }
        let entry: WalEntry = rmp_serde::from_slice(&data)?;
        entries.push(entry);
        valid_len += 4 + len as u64;
    }
    Ok((entries, valid_len))
}

// ============================================================================
// Snapshot Manager
// ============================================================================

pub struct SnapshotManager {
    snapshot_path: PathBuf,
}

impl SnapshotManager {
    pub fn new<P: AsRef<Path>>(snapshot_path: P) -> Self {
        Self {
            snapshot_path: snapshot_path.as_ref().to_path_buf(),
        }
    }

    /// Write to a temp file, fsync, then rename over the old snapshot.
    pub fn save(&self, snapshot: &StoreSnapshot) -> Result<()> {
        if let Some(parent) = self.snapshot_path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                StoreError::IoError(format!("Failed to create snapshot directory: {}", e))
            })?;
        }
        let temp_path = self.snapshot_path.with_extension("tmp");
        let temp_file = File::create(&temp_path)
            .map_err(|e| StoreError::IoError(format!("Failed to create temp file: {}", e)))?;
        let mut writer = BufWriter::new(temp_file);
        let serialized = rmp_serde::to_vec_named(snapshot)?;
        writer
            .write_all(&serialized)
            .map_err(|e| StoreError::IoError(format!("Failed to write snapshot: {}", e)))?;
        writer
            .flush()
            .map_err(|e| StoreError::IoError(format!("Failed to flush snapshot: {}", e)))?;
        writer
            .get_mut()
            .sync_all()
            .map_err(|e| StoreError::IoError(format!("Failed to sync snapshot: {}", e)))?;
        fs::rename(&temp_path, &self.snapshot_path)
            .map_err(|e| StoreError::IoError(format!("Failed to rename snapshot: {}", e)))?;
        Ok(())
    }

    pub fn load(&self) -> Result<Option<StoreSnapshot>> {
        if !self.snapshot_path.exists() {
            return Ok(None);
        }
        let mut file = File::open(&self.snapshot_path)
            .map_err(|e| StoreError::IoError(format!("Failed to open snapshot: {}", e)))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .map_err(|e| StoreError::IoError(format!("Failed to read snapshot: {}", e)))?;
        let snapshot: StoreSnapshot = rmp_serde::from_slice(&data)?;
        Ok(Some(snapshot))
    }
}

// ============================================================================
// Persistence Manager
// ============================================================================

/// Tables and id counter rebuilt from disk.
#[derive(Debug, Default)]
pub struct RecoveredState {
    pub tables: TableSet,
    pub next_event_id: EventId,
    pub replayed_entries: usize,
}

pub struct PersistenceManager {
    wal: WalManager,
    snapshot: SnapshotManager,
    durability_mode: DurabilityMode,
}

impl PersistenceManager {
    pub fn new<P: AsRef<Path>>(data_dir: P, durability_mode: DurabilityMode) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        let wal = WalManager::new(data_dir.join(WAL_FILE_NAME), durability_mode)?;
        let snapshot = SnapshotManager::new(data_dir.join(SNAPSHOT_FILE_NAME));
        Ok(Self {
            wal,
            snapshot,
            durability_mode,
        })
    }

    pub fn log(&mut self, entry: &WalEntry) -> Result<()> {
        self.wal.append(entry)
    }

    pub fn checkpoint(&mut self, tables: &TableSet, next_event_id: EventId) -> Result<()> {
        if self.durability_mode == DurabilityMode::None {
            return Ok(());
        }
        let snapshot = StoreSnapshot::new(tables, next_event_id);
        self.snapshot.save(&snapshot)?;
        self.wal.clear()?;
        Ok(())
    }

    pub fn needs_checkpoint(&self) -> bool {
        self.wal.needs_checkpoint()
    }

    /// Load the last snapshot and replay the WAL on top of it.
    pub fn recover(&self) -> Result<RecoveredState> {
        let mut state = match self.snapshot.load()? {
            Some(snapshot) => RecoveredState {
                tables: TableSet::from_rows(
                    snapshot.runs,
                    snapshot.methods,
                    snapshot.events,
                    snapshot.points,
                ),
                next_event_id: snapshot.next_event_id,
                replayed_entries: 0,
            },
            None => RecoveredState {
                next_event_id: 1,
                ..RecoveredState::default()
            },
        };

        for entry in self.wal.read_all()? {
            if let Some(id) = entry.max_event_id() {
                state.next_event_id = state.next_event_id.max(id + 1);
            }
            state.tables.apply(entry);
            state.replayed_entries += 1;
        }

        if let Some(max_id) = state.tables.max_event_id() {
            state.next_event_id = state.next_event_id.max(max_id + 1);
        }
        Ok(state)
    }

    pub fn wal_mut(&mut self) -> &mut WalManager {
        &mut self.wal
    }
}
