use std::collections::BTreeMap;
use std::io::{Read, Seek, SeekFrom, Write as IoWrite};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{IntegrityFault, LedgerError};

/// WAL magic bytes: "CLWL" (Conclave Ledger WAL)
const WAL_MAGIC: [u8; 4] = [b'C', b'L', b'W', b'L'];
/// Current WAL format version
const WAL_VERSION: u16 = 1;
/// Segment header size: magic(4) + version(2) + reserved(2) = 8
const SEGMENT_HEADER_SIZE: usize = 8;
/// Entry header: length(4) + sequence(8)
const ENTRY_HEADER_SIZE: usize = 12;
/// Entry overhead: length(4) + sequence(8) + crc32(4) = 16
const ENTRY_OVERHEAD: usize = 16;

/// Storage backend trait: file-backed and in-memory WAL.
pub trait WalStorage: Send + Sync {
    /// Create a new segment (truncates if exists).
    fn create_segment(&self, segment_id: u64) -> Result<Box<dyn SegmentWriter>, LedgerError>;
    /// Open an existing segment for appending.
    fn append_segment(&self, segment_id: u64) -> Result<Box<dyn SegmentWriter>, LedgerError>;
    fn open_segment(&self, segment_id: u64) -> Result<Box<dyn SegmentReader>, LedgerError>;
    /// Live segment ids in ascending order. Quarantined segments are not listed.
    fn list_segments(&self) -> Result<Vec<u64>, LedgerError>;
    /// Move a segment aside. Quarantined bytes are kept, never deleted.
    fn quarantine_segment(&self, segment_id: u64) -> Result<(), LedgerError>;
}

pub trait SegmentWriter: Send + Sync {
    fn write_all(&mut self, data: &[u8]) -> Result<(), LedgerError>;
    fn flush(&mut self) -> Result<(), LedgerError>;
    fn sync(&mut self) -> Result<(), LedgerError>;
    fn position(&self) -> u64;
    /// Length of the segment as the storage itself reports it. Used after a
    /// failed write to tell "nothing landed" from "some bytes landed".
    fn durable_len(&self) -> Result<u64, LedgerError>;
}

pub trait SegmentReader: Send {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), LedgerError>;
    fn read_to_end(&mut self, buf: &mut Vec<u8>) -> Result<usize, LedgerError>;
    fn seek_to(&mut self, pos: u64) -> Result<(), LedgerError>;
    fn len(&self) -> Result<u64, LedgerError>;
}

// ---- File-backed storage ----

pub struct FileStorage {
    data_dir: PathBuf,
}

impl FileStorage {
    pub fn new(data_dir: PathBuf) -> Result<Self, LedgerError> {
        std::fs::create_dir_all(&data_dir)?;
        Ok(Self { data_dir })
    }

    fn segment_path(&self, segment_id: u64) -> PathBuf {
        self.data_dir.join(format!("wal-{:016x}.seg", segment_id))
    }
}

impl WalStorage for FileStorage {
    fn create_segment(&self, segment_id: u64) -> Result<Box<dyn SegmentWriter>, LedgerError> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(self.segment_path(segment_id))?;
        Ok(Box::new(FileSegmentWriter { file, position: 0 }))
    }

    fn append_segment(&self, segment_id: u64) -> Result<Box<dyn SegmentWriter>, LedgerError> {
        let file = std::fs::OpenOptions::new()
            .append(true)
            .open(self.segment_path(segment_id))?;
        let position = file.metadata()?.len();
        Ok(Box::new(FileSegmentWriter { file, position }))
    }

    fn open_segment(&self, segment_id: u64) -> Result<Box<dyn SegmentReader>, LedgerError> {
        let path = self.segment_path(segment_id);
        let file = std::fs::File::open(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => LedgerError::SegmentNotFound(segment_id),
            _ => LedgerError::Io(e),
        })?;
        let len = file.metadata()?.len();
        Ok(Box::new(FileSegmentReader { file, len }))
    }

    fn list_segments(&self) -> Result<Vec<u64>, LedgerError> {
        let mut segments = Vec::new();
        for entry in std::fs::read_dir(&self.data_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(hex) = name.strip_prefix("wal-").and_then(|s| s.strip_suffix(".seg")) {
                if let Ok(id) = u64::from_str_radix(hex, 16) {
                    segments.push(id);
                }
            }
        }
        segments.sort_unstable();
        Ok(segments)
    }

    fn quarantine_segment(&self, segment_id: u64) -> Result<(), LedgerError> {
        let from = self.segment_path(segment_id);
        let to = from.with_extension("seg.quarantined");
        std::fs::rename(&from, &to)?;
        Ok(())
    }
}

struct FileSegmentWriter {
    file: std::fs::File,
    position: u64,
}

impl SegmentWriter for FileSegmentWriter {
    fn write_all(&mut self, data: &[u8]) -> Result<(), LedgerError> {
        self.file.write_all(data)?;
        self.position += data.len() as u64;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), LedgerError> {
        self.file.flush()?;
        Ok(())
    }

    fn sync(&mut self) -> Result<(), LedgerError> {
        self.file.sync_data()?;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn durable_len(&self) -> Result<u64, LedgerError> {
        Ok(self.file.metadata()?.len())
    }
}

struct FileSegmentReader {
    file: std::fs::File,
    len: u64,
}

impl SegmentReader for FileSegmentReader {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), LedgerError> {
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn read_to_end(&mut self, buf: &mut Vec<u8>) -> Result<usize, LedgerError> {
        Ok(self.file.read_to_end(buf)?)
    }

    fn seek_to(&mut self, pos: u64) -> Result<(), LedgerError> {
        self.file.seek(SeekFrom::Start(pos))?;
        Ok(())
    }

    fn len(&self) -> Result<u64, LedgerError> {
        Ok(self.len)
    }
}

// ---- In-memory storage ----

#[derive(Default)]
struct MemorySegments {
    live: BTreeMap<u64, Vec<u8>>,
    quarantined: BTreeMap<u64, Vec<u8>>,
}

/// In-memory storage. Clones share the same segments, so a test can keep a
/// handle to inject faults or inspect bytes while the ledger owns another.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    segments: Arc<Mutex<MemorySegments>>,
    unavailable: Arc<AtomicBool>,
    tear_next: Arc<AtomicBool>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every storage operation fail with [`LedgerError::Unavailable`]
    /// without touching any bytes.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// The next write persists only half of its bytes and then fails.
    pub fn tear_next_write(&self) {
        self.tear_next.store(true, Ordering::SeqCst);
    }

    pub fn segment_bytes(&self, segment_id: u64) -> Option<Vec<u8>> {
        self.lock().live.get(&segment_id).cloned()
    }

    pub fn replace_segment(&self, segment_id: u64, bytes: Vec<u8>) {
        self.lock().live.insert(segment_id, bytes);
    }

    pub fn quarantined_segments(&self) -> Vec<u64> {
        self.lock().quarantined.keys().copied().collect()
    }

    fn lock(&self) -> MutexGuard<'_, MemorySegments> {
        self.segments.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_available(&self) -> Result<(), LedgerError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(LedgerError::Unavailable)
        } else {
            Ok(())
        }
    }
}

impl WalStorage for MemoryStorage {
    fn create_segment(&self, segment_id: u64) -> Result<Box<dyn SegmentWriter>, LedgerError> {
        self.check_available()?;
        self.lock().live.insert(segment_id, Vec::new());
        Ok(Box::new(MemorySegmentWriter {
            segment_id,
            storage: self.clone(),
        }))
    }

    fn append_segment(&self, segment_id: u64) -> Result<Box<dyn SegmentWriter>, LedgerError> {
        self.check_available()?;
        if !self.lock().live.contains_key(&segment_id) {
            return Err(LedgerError::SegmentNotFound(segment_id));
        }
        Ok(Box::new(MemorySegmentWriter {
            segment_id,
            storage: self.clone(),
        }))
    }

    fn open_segment(&self, segment_id: u64) -> Result<Box<dyn SegmentReader>, LedgerError> {
        self.check_available()?;
        let data = self
            .lock()
            .live
            .get(&segment_id)
            .cloned()
            .ok_or(LedgerError::SegmentNotFound(segment_id))?;
        Ok(Box::new(MemorySegmentReader { data, position: 0 }))
    }

    fn list_segments(&self) -> Result<Vec<u64>, LedgerError> {
        self.check_available()?;
        Ok(self.lock().live.keys().copied().collect())
    }

    fn quarantine_segment(&self, segment_id: u64) -> Result<(), LedgerError> {
        self.check_available()?;
        let mut segments = self.lock();
        let bytes = segments
            .live
            .remove(&segment_id)
            .ok_or(LedgerError::SegmentNotFound(segment_id))?;
        segments.quarantined.insert(segment_id, bytes);
        Ok(())
    }
}

struct MemorySegmentWriter {
    segment_id: u64,
    storage: MemoryStorage,
}

impl SegmentWriter for MemorySegmentWriter {
    fn write_all(&mut self, data: &[u8]) -> Result<(), LedgerError> {
        self.storage.check_available()?;
        let torn = self.storage.tear_next.swap(false, Ordering::SeqCst);
        let mut segments = self.storage.lock();
        let segment = segments.live.entry(self.segment_id).or_default();
        if torn {
            segment.extend_from_slice(&data[..data.len() / 2]);
            return Err(LedgerError::Unavailable);
        }
        segment.extend_from_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), LedgerError> {
        Ok(())
    }

    fn sync(&mut self) -> Result<(), LedgerError> {
        self.storage.check_available()
    }

    fn position(&self) -> u64 {
        self.storage
            .lock()
            .live
            .get(&self.segment_id)
            .map(|v| v.len() as u64)
            .unwrap_or(0)
    }

    fn durable_len(&self) -> Result<u64, LedgerError> {
        Ok(self.position())
    }
}

struct MemorySegmentReader {
    data: Vec<u8>,
    position: usize,
}

impl SegmentReader for MemorySegmentReader {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), LedgerError> {
        let end = self.position + buf.len();
        if end > self.data.len() {
            return Err(LedgerError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "read past end of memory segment",
            )));
        }
        buf.copy_from_slice(&self.data[self.position..end]);
        self.position = end;
        Ok(())
    }

    fn read_to_end(&mut self, buf: &mut Vec<u8>) -> Result<usize, LedgerError> {
        let remaining = &self.data[self.position.min(self.data.len())..];
        buf.extend_from_slice(remaining);
        let n = remaining.len();
        self.position = self.data.len();
        Ok(n)
    }

    fn seek_to(&mut self, pos: u64) -> Result<(), LedgerError> {
        self.position = pos as usize;
        Ok(())
    }

    fn len(&self) -> Result<u64, LedgerError> {
        Ok(self.data.len() as u64)
    }
}

// ---- Segment metadata ----

#[derive(Clone, Debug)]
pub struct SegmentMeta {
    pub id: u64,
    pub first_sequence: u64,
    pub entry_count: u64,
    pub size_bytes: u64,
}

#[derive(Clone, Copy, Debug)]
struct EntryLocation {
    segment_id: u64,
    offset: u64,
    length: u32,
}

// ---- WAL configuration ----

pub struct WalConfig {
    /// Maximum segment size before rotation (default: 64MB)
    pub max_segment_size: u64,
    pub sync_mode: SyncMode,
    /// Batch interval for batched sync (default: 10ms)
    pub batch_interval: Duration,
    /// Maximum entries per batch (default: 1000)
    pub max_batch_size: usize,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            max_segment_size: 64 * 1024 * 1024,
            sync_mode: SyncMode::Immediate,
            batch_interval: Duration::from_millis(10),
            max_batch_size: 1000,
        }
    }
}

/// Sync mode for the WAL.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// fsync after every write: an acknowledged append survives a crash
    Immediate,
    /// fsync in batches: small loss window
    Batched,
    /// No explicit fsync
    OsManaged,
}

/// One decoded entry found while scanning at open.
#[derive(Clone, Debug)]
pub struct RawEntry {
    pub sequence: u64,
    pub segment_id: u64,
    pub offset: u64,
    pub bytes: Vec<u8>,
}

/// The valid prefix found at open, and the fault that ended it, if any.
#[derive(Debug, Default)]
pub struct WalRecovery {
    pub entries: Vec<RawEntry>,
    pub fault: Option<IntegrityFault>,
}

/// A write that did not complete.
#[derive(Debug)]
pub enum WalWriteError {
    /// Nothing reached storage; the log is unchanged.
    Clean(LedgerError),
    /// Some bytes may have reached storage. The writer is closed.
    Partial(IntegrityFault),
}

// ---- Write-ahead log ----

/// Append-only, crash-recoverable journal of serialized envelopes.
///
/// Segment format: `[magic:4][version:2][reserved:2][entries...]`
/// Entry format:   `[length:4][sequence:8][envelope_json:N][crc32:4]`
///
/// The CRC covers the sequence and the body. Sequences are dense from 0, so
/// the entry index doubles as a sequence-to-location map.
pub struct WriteAheadLog {
    config: WalConfig,
    storage: Arc<dyn WalStorage>,
    writer: Option<Box<dyn SegmentWriter>>,
    current_segment: u64,
    segments: Vec<SegmentMeta>,
    index: Vec<EntryLocation>,
    unsynced: usize,
    last_sync: Instant,
}

impl WriteAheadLog {
    /// Scan every segment and open for appending.
    ///
    /// Scanning stops at the first damaged entry. A damaged final entry of
    /// the final segment is a torn tail; damage anywhere else is corruption.
    /// When either is found no writer is opened.
    pub fn open(
        config: WalConfig,
        storage: Arc<dyn WalStorage>,
    ) -> Result<(Self, WalRecovery), LedgerError> {
        let ids = storage.list_segments()?;
        let mut recovery = WalRecovery::default();
        let mut segments = Vec::new();
        let mut expected = 0u64;

        for (i, &segment_id) in ids.iter().enumerate() {
            let mut reader = storage.open_segment(segment_id)?;
            let mut data = Vec::new();
            reader.read_to_end(&mut data)?;

            let before = recovery.entries.len();
            let first_sequence = expected;
            let fault = scan_segment(
                segment_id,
                &data,
                i + 1 == ids.len(),
                &mut expected,
                &mut recovery.entries,
            );
            segments.push(SegmentMeta {
                id: segment_id,
                first_sequence,
                entry_count: (recovery.entries.len() - before) as u64,
                size_bytes: data.len() as u64,
            });
            if let Some(fault) = fault {
                warn!(segment_id, fault = %fault, "WAL scan stopped at damaged entry");
                recovery.fault = Some(fault);
                break;
            }
        }

        let index = recovery
            .entries
            .iter()
            .map(|e| EntryLocation {
                segment_id: e.segment_id,
                offset: e.offset,
                length: e.bytes.len() as u32,
            })
            .collect();

        let mut wal = Self {
            config,
            storage,
            writer: None,
            current_segment: ids.last().copied().unwrap_or(0),
            segments,
            index,
            unsynced: 0,
            last_sync: Instant::now(),
        };
        if recovery.fault.is_none() {
            wal.open_writer()?;
        }

        info!(
            segments = wal.segments.len(),
            entries = wal.index.len(),
            faulted = recovery.fault.is_some(),
            "WAL opened"
        );
        Ok((wal, recovery))
    }

    pub fn open_file(
        config: WalConfig,
        data_dir: PathBuf,
    ) -> Result<(Self, WalRecovery), LedgerError> {
        Self::open(config, Arc::new(FileStorage::new(data_dir)?))
    }

    pub fn open_memory(config: WalConfig) -> Result<(Self, WalRecovery), LedgerError> {
        Self::open(config, Arc::new(MemoryStorage::new()))
    }

    /// Number of valid entries; also the next sequence.
    pub fn len(&self) -> u64 {
        self.index.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn segments(&self) -> &[SegmentMeta] {
        &self.segments
    }

    pub fn storage(&self) -> &Arc<dyn WalStorage> {
        &self.storage
    }

    /// Segment and byte offset just past the last readable entry.
    pub fn end_position(&self) -> (u64, u64) {
        match self.index.last() {
            Some(loc) => (
                loc.segment_id,
                loc.offset + (ENTRY_OVERHEAD + loc.length as usize) as u64,
            ),
            None => (self.current_segment, SEGMENT_HEADER_SIZE as u64),
        }
    }

    /// Drop entries from `len` onward from the readable index and stop
    /// writing. Used when a later check rejects part of the scanned prefix.
    pub fn truncate_readable(&mut self, len: u64) {
        self.index.truncate(len as usize);
        self.writer = None;
    }

    /// Write one entry and sync it according to the sync mode.
    pub fn append(&mut self, sequence: u64, bytes: &[u8]) -> Result<(), WalWriteError> {
        debug_assert_eq!(sequence, self.len());
        if self.writer.is_none() {
            let next = self.next_segment_id();
            self.start_segment(next).map_err(WalWriteError::Clean)?;
        }
        let segment_id = self.current_segment;
        let Some(writer) = self.writer.as_mut() else {
            return Err(WalWriteError::Clean(LedgerError::Closed));
        };

        let entry = encode_entry(sequence, bytes);
        let offset = writer.position();
        if let Err(e) = writer.write_all(&entry) {
            let landed = writer.durable_len().map(|len| len != offset).unwrap_or(true);
            if !landed {
                return Err(WalWriteError::Clean(e));
            }
            self.writer = None;
            return Err(WalWriteError::Partial(IntegrityFault::WriteFailure {
                segment_id,
                offset,
                reason: e.to_string(),
            }));
        }

        let synced = match self.config.sync_mode {
            SyncMode::Immediate => writer.sync(),
            SyncMode::Batched => {
                self.unsynced += 1;
                if self.unsynced >= self.config.max_batch_size
                    || self.last_sync.elapsed() >= self.config.batch_interval
                {
                    self.unsynced = 0;
                    self.last_sync = Instant::now();
                    writer.sync()
                } else {
                    writer.flush()
                }
            }
            SyncMode::OsManaged => Ok(()),
        };
        if let Err(e) = synced {
            self.writer = None;
            return Err(WalWriteError::Partial(IntegrityFault::WriteFailure {
                segment_id,
                offset,
                reason: format!("sync failed: {e}"),
            }));
        }
        let size = writer.position();

        self.index.push(EntryLocation {
            segment_id,
            offset,
            length: bytes.len() as u32,
        });
        if let Some(last) = self.segments.last_mut() {
            last.entry_count += 1;
            last.size_bytes = size;
        }
        debug!(sequence, segment_id, offset, "WAL entry written");

        if size >= self.config.max_segment_size {
            if let Err(e) = self.rotate_segment() {
                // The entry is durable; the next append retries the rotation.
                warn!(error = %e, "WAL segment rotation failed");
                self.writer = None;
            }
        }
        Ok(())
    }

    /// Force buffered entries to storage.
    pub fn sync(&mut self) -> Result<(), LedgerError> {
        if let Some(writer) = self.writer.as_mut() {
            writer.sync()?;
        }
        self.unsynced = 0;
        self.last_sync = Instant::now();
        Ok(())
    }

    /// Read up to `limit` entry bodies starting at `from`.
    pub fn read_entries(&self, from: u64, limit: usize) -> Result<Vec<(u64, Vec<u8>)>, LedgerError> {
        let start = from as usize;
        if start >= self.index.len() {
            return Ok(Vec::new());
        }
        let end = start.saturating_add(limit).min(self.index.len());
        let mut out = Vec::with_capacity(end - start);

        let mut pos = start;
        while pos < end {
            let segment_id = self.index[pos].segment_id;
            let mut reader = self.storage.open_segment(segment_id)?;
            while pos < end && self.index[pos].segment_id == segment_id {
                let loc = self.index[pos];
                reader.seek_to(loc.offset)?;
                let mut buf = vec![0u8; ENTRY_OVERHEAD + loc.length as usize];
                reader.read_exact(&mut buf)?;
                let sequence = le_u64(&buf[4..ENTRY_HEADER_SIZE]);
                let body_end = ENTRY_HEADER_SIZE + loc.length as usize;
                let body = &buf[ENTRY_HEADER_SIZE..body_end];
                if sequence != pos as u64 || entry_crc(sequence, body) != le_u32(&buf[body_end..]) {
                    return Err(LedgerError::Corruption {
                        segment_id,
                        offset: loc.offset,
                        reason: "entry changed after open".into(),
                    });
                }
                out.push((sequence, body.to_vec()));
                pos += 1;
            }
        }
        Ok(out)
    }

    // ---- Internal helpers ----

    fn open_writer(&mut self) -> Result<(), LedgerError> {
        match self.segments.last() {
            Some(last)
                if last.size_bytes >= SEGMENT_HEADER_SIZE as u64
                    && last.size_bytes < self.config.max_segment_size =>
            {
                let id = last.id;
                self.writer = Some(self.storage.append_segment(id)?);
                self.current_segment = id;
                Ok(())
            }
            _ => {
                let next = self.next_segment_id();
                self.start_segment(next)
            }
        }
    }

    fn next_segment_id(&self) -> u64 {
        self.current_segment + 1
    }

    fn start_segment(&mut self, segment_id: u64) -> Result<(), LedgerError> {
        let mut writer = self.storage.create_segment(segment_id)?;
        write_segment_header(&mut *writer)?;
        writer.sync()?;
        self.writer = Some(writer);
        self.current_segment = segment_id;
        self.segments.push(SegmentMeta {
            id: segment_id,
            first_sequence: self.len(),
            entry_count: 0,
            size_bytes: SEGMENT_HEADER_SIZE as u64,
        });
        Ok(())
    }

    fn rotate_segment(&mut self) -> Result<(), LedgerError> {
        if let Some(writer) = self.writer.as_mut() {
            writer.sync()?;
        }
        let next = self.next_segment_id();
        self.start_segment(next)?;
        info!(segment_id = next, "WAL segment rotated");
        Ok(())
    }
}

/// Set aside every segment from `segment_id` onward, first copying the
/// entries before `offset` in `segment_id` into a fresh segment.
///
/// The fresh segment is written before anything is moved, so a crash in
/// between leaves a log that scans to the same fault and can be cut again.
pub fn quarantine_from(
    storage: &dyn WalStorage,
    segment_id: u64,
    offset: u64,
) -> Result<u64, LedgerError> {
    let ids = storage.list_segments()?;
    let new_id = ids.last().copied().unwrap_or(0).max(segment_id) + 1;

    let mut prefix = Vec::new();
    if ids.contains(&segment_id) {
        let mut data = Vec::new();
        storage.open_segment(segment_id)?.read_to_end(&mut data)?;
        let end = (offset as usize).min(data.len());
        if end > SEGMENT_HEADER_SIZE {
            prefix.extend_from_slice(&data[SEGMENT_HEADER_SIZE..end]);
        }
    }

    let mut writer = storage.create_segment(new_id)?;
    write_segment_header(&mut *writer)?;
    writer.write_all(&prefix)?;
    writer.sync()?;
    drop(writer);

    let mut moved = 0;
    for id in ids.into_iter().filter(|id| *id >= segment_id) {
        storage.quarantine_segment(id)?;
        moved += 1;
    }
    warn!(
        from_segment = segment_id,
        quarantined = moved,
        new_segment = new_id,
        kept_bytes = prefix.len(),
        "WAL segments quarantined"
    );
    Ok(new_id)
}

fn scan_segment(
    segment_id: u64,
    data: &[u8],
    is_last: bool,
    expected: &mut u64,
    entries: &mut Vec<RawEntry>,
) -> Option<IntegrityFault> {
    let damaged = |offset: usize, reason: &str| {
        if is_last {
            IntegrityFault::TornTail {
                segment_id,
                offset: offset as u64,
            }
        } else {
            IntegrityFault::Corruption {
                segment_id,
                offset: offset as u64,
                reason: reason.to_string(),
            }
        }
    };

    if data.len() < SEGMENT_HEADER_SIZE {
        return Some(damaged(0, "truncated segment header"));
    }
    if data[..4] != WAL_MAGIC {
        return Some(IntegrityFault::Corruption {
            segment_id,
            offset: 0,
            reason: "invalid magic".into(),
        });
    }

    let mut pos = SEGMENT_HEADER_SIZE;
    while pos < data.len() {
        if data.len() - pos < ENTRY_OVERHEAD {
            return Some(damaged(pos, "truncated entry"));
        }
        let length = le_u32(&data[pos..pos + 4]) as usize;
        let sequence = le_u64(&data[pos + 4..pos + ENTRY_HEADER_SIZE]);
        if length == 0 {
            return Some(damaged(pos, "zero-length entry"));
        }
        let end = pos + ENTRY_OVERHEAD + length;
        if end > data.len() {
            return Some(damaged(pos, "entry runs past end of segment"));
        }
        let body = &data[pos + ENTRY_HEADER_SIZE..end - 4];
        if entry_crc(sequence, body) != le_u32(&data[end - 4..end]) {
            return Some(if is_last && end == data.len() {
                IntegrityFault::TornTail {
                    segment_id,
                    offset: pos as u64,
                }
            } else {
                IntegrityFault::Corruption {
                    segment_id,
                    offset: pos as u64,
                    reason: "crc mismatch".into(),
                }
            });
        }
        if sequence != *expected {
            return Some(IntegrityFault::Corruption {
                segment_id,
                offset: pos as u64,
                reason: format!("expected sequence {}, found {}", expected, sequence),
            });
        }
        entries.push(RawEntry {
            sequence,
            segment_id,
            offset: pos as u64,
            bytes: body.to_vec(),
        });
        *expected += 1;
        pos = end;
    }
    None
}

fn encode_entry(sequence: u64, bytes: &[u8]) -> Vec<u8> {
    let mut entry = Vec::with_capacity(ENTRY_OVERHEAD + bytes.len());
    entry.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    entry.extend_from_slice(&sequence.to_le_bytes());
    entry.extend_from_slice(bytes);
    entry.extend_from_slice(&entry_crc(sequence, bytes).to_le_bytes());
    entry
}

fn entry_crc(sequence: u64, body: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&sequence.to_le_bytes());
    hasher.update(body);
    hasher.finalize()
}

fn le_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

fn write_segment_header(writer: &mut dyn SegmentWriter) -> Result<(), LedgerError> {
    let mut header = [0u8; SEGMENT_HEADER_SIZE];
    header[..4].copy_from_slice(&WAL_MAGIC);
    header[4..6].copy_from_slice(&WAL_VERSION.to_le_bytes());
    // bytes 6..8 reserved
    writer.write_all(&header)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(i: u64) -> Vec<u8> {
        format!("{{\"entry\":{i}}}").into_bytes()
    }

    fn fill(wal: &mut WriteAheadLog, n: u64) {
        for i in 0..n {
            let seq = wal.len();
            wal.append(seq, &body(i)).unwrap();
        }
    }

    #[test]
    fn append_and_read_roundtrip() {
        let (mut wal, recovery) = WriteAheadLog::open_memory(WalConfig::default()).unwrap();
        assert!(recovery.entries.is_empty());
        assert!(recovery.fault.is_none());

        fill(&mut wal, 10);
        assert_eq!(wal.len(), 10);

        let entries = wal.read_entries(4, 3).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0], (4, body(4)));
        assert_eq!(entries[2], (6, body(6)));
        assert!(wal.read_entries(10, 5).unwrap().is_empty());
    }

    #[test]
    fn segment_rotation() {
        let config = WalConfig {
            max_segment_size: 80,
            ..WalConfig::default()
        };
        let storage = MemoryStorage::new();
        let (mut wal, _) = WriteAheadLog::open(config, Arc::new(storage.clone())).unwrap();
        fill(&mut wal, 20);
        assert!(wal.segments().len() > 1);
        assert_eq!(wal.read_entries(0, 100).unwrap().len(), 20);

        let (reopened, recovery) = WriteAheadLog::open(WalConfig::default(), Arc::new(storage)).unwrap();
        assert!(recovery.fault.is_none());
        assert_eq!(reopened.len(), 20);
        assert_eq!(recovery.entries[19].bytes, body(19));
    }

    #[test]
    fn torn_tail_is_detected_on_open() {
        let storage = MemoryStorage::new();
        let (mut wal, _) = WriteAheadLog::open(WalConfig::default(), Arc::new(storage.clone())).unwrap();
        fill(&mut wal, 3);
        drop(wal);

        let mut bytes = storage.segment_bytes(1).unwrap();
        let valid_len = bytes.len() as u64;
        bytes.extend_from_slice(&encode_entry(3, &body(3))[..10]);
        storage.replace_segment(1, bytes);

        let (wal, recovery) = WriteAheadLog::open(WalConfig::default(), Arc::new(storage)).unwrap();
        assert_eq!(wal.len(), 3);
        assert_eq!(
            recovery.fault,
            Some(IntegrityFault::TornTail {
                segment_id: 1,
                offset: valid_len
            })
        );
    }

    #[test]
    fn crc_failure_before_the_tail_is_corruption() {
        let storage = MemoryStorage::new();
        let (mut wal, _) = WriteAheadLog::open(WalConfig::default(), Arc::new(storage.clone())).unwrap();
        fill(&mut wal, 4);
        drop(wal);

        let mut bytes = storage.segment_bytes(1).unwrap();
        // First body byte of the first entry.
        bytes[SEGMENT_HEADER_SIZE + ENTRY_HEADER_SIZE] ^= 0xff;
        storage.replace_segment(1, bytes);

        let (wal, recovery) = WriteAheadLog::open(WalConfig::default(), Arc::new(storage)).unwrap();
        assert!(wal.is_empty());
        assert!(matches!(
            recovery.fault,
            Some(IntegrityFault::Corruption { segment_id: 1, offset: 8, .. })
        ));
    }

    #[test]
    fn unavailable_storage_fails_cleanly() {
        let storage = MemoryStorage::new();
        let (mut wal, _) = WriteAheadLog::open(WalConfig::default(), Arc::new(storage.clone())).unwrap();
        fill(&mut wal, 2);

        storage.set_unavailable(true);
        assert!(matches!(
            wal.append(2, &body(2)),
            Err(WalWriteError::Clean(LedgerError::Unavailable))
        ));
        storage.set_unavailable(false);
        wal.append(2, &body(2)).unwrap();
        assert_eq!(wal.len(), 3);
    }

    #[test]
    fn partial_write_closes_the_writer() {
        let storage = MemoryStorage::new();
        let (mut wal, _) = WriteAheadLog::open(WalConfig::default(), Arc::new(storage.clone())).unwrap();
        fill(&mut wal, 2);
        let before = storage.segment_bytes(1).unwrap().len() as u64;

        storage.tear_next_write();
        match wal.append(2, &body(2)) {
            Err(WalWriteError::Partial(IntegrityFault::WriteFailure { segment_id, offset, .. })) => {
                assert_eq!(segment_id, 1);
                assert_eq!(offset, before);
            }
            other => panic!("expected partial write, got {other:?}"),
        }
        assert_eq!(wal.len(), 2);

        let (_, recovery) = WriteAheadLog::open(WalConfig::default(), Arc::new(storage)).unwrap();
        assert!(matches!(recovery.fault, Some(IntegrityFault::TornTail { .. })));
    }

    #[test]
    fn quarantine_keeps_the_valid_prefix() {
        let storage = MemoryStorage::new();
        let (mut wal, _) = WriteAheadLog::open(WalConfig::default(), Arc::new(storage.clone())).unwrap();
        fill(&mut wal, 3);
        drop(wal);

        let mut bytes = storage.segment_bytes(1).unwrap();
        let cut = bytes.len() as u64;
        bytes.extend_from_slice(b"garbage");
        storage.replace_segment(1, bytes);

        let new_id = quarantine_from(&storage, 1, cut).unwrap();
        assert_eq!(new_id, 2);
        assert_eq!(storage.quarantined_segments(), vec![1]);

        let (wal, recovery) = WriteAheadLog::open(WalConfig::default(), Arc::new(storage)).unwrap();
        assert!(recovery.fault.is_none());
        assert_eq!(wal.len(), 3);
        assert_eq!(wal.read_entries(2, 1).unwrap()[0].1, body(2));
    }

    #[test]
    fn file_backed_crash_recovery() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (mut wal, _) =
                WriteAheadLog::open_file(WalConfig::default(), dir.path().to_path_buf()).unwrap();
            fill(&mut wal, 5);
            // dropped without shutdown
        }
        let (mut wal, recovery) =
            WriteAheadLog::open_file(WalConfig::default(), dir.path().to_path_buf()).unwrap();
        assert!(recovery.fault.is_none());
        assert_eq!(recovery.entries.len(), 5);
        wal.append(5, &body(5)).unwrap();
        assert_eq!(wal.read_entries(0, 10).unwrap().len(), 6);
    }

    #[test]
    fn file_backed_quarantine_renames_segments() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().to_path_buf()).unwrap();
        let (mut wal, _) =
            WriteAheadLog::open(WalConfig::default(), Arc::new(FileStorage::new(dir.path().to_path_buf()).unwrap())).unwrap();
        fill(&mut wal, 2);
        drop(wal);

        quarantine_from(&storage, 1, SEGMENT_HEADER_SIZE as u64).unwrap();
        assert!(dir.path().join("wal-0000000000000001.seg.quarantined").exists());
        assert_eq!(storage.list_segments().unwrap(), vec![2]);
    }
}
