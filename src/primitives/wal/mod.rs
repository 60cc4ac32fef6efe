#![forbid(unsafe_code)]

//! Log device contract used to persist large update payloads.
//!
//! The transactional core only needs two operations: append an opaque payload
//! to a group and receive a sequence number, and load it back later. An append
//! is durable once it returns.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use bytes::Bytes;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::types::checksum::{crc32, frame_crc32};
use crate::types::{BasaltError, Result};

/// Logical stream inside a log device.
pub type LogGroup = u32;
/// Sequence number of an appended payload, unique within its group.
pub type LogSeq = u64;

/// Group used for spilled block-update payloads.
pub const UPDATE_GROUP: LogGroup = 1;

const LOG_MAGIC: [u8; 4] = *b"BSLG";
const LOG_FORMAT_VERSION: u16 = 1;
const FILE_HEADER_LEN: usize = 12;
const FRAME_HEADER_LEN: usize = 24;

/// Append/load contract of the write-ahead log device.
pub trait LogDevice: Send + Sync {
    /// Appends `payload` to `group` and returns its sequence number.
    fn append(&self, group: LogGroup, payload: &[u8]) -> Result<LogSeq>;
    /// Loads the payload previously appended as `(group, seq)`.
    fn load(&self, group: LogGroup, seq: LogSeq) -> Result<Bytes>;
}

/// Statistics tracked by log devices.
#[derive(Clone, Debug, Default)]
pub struct LogStats {
    /// Number of payloads appended.
    pub appends: u64,
    /// Payload bytes appended.
    pub bytes_appended: u64,
    /// Number of payloads loaded.
    pub loads: u64,
}

#[derive(Default)]
struct MemLogState {
    next_seq: FxHashMap<LogGroup, LogSeq>,
    frames: FxHashMap<(LogGroup, LogSeq), (u32, Bytes)>,
    stats: LogStats,
}

/// In-memory log device; payloads are checksummed like file frames.
#[derive(Default)]
pub struct MemLog {
    state: Mutex<MemLogState>,
}

impl MemLog {
    /// Creates an empty in-memory log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the current statistics.
    pub fn stats(&self) -> LogStats {
        self.state.lock().stats.clone()
    }
}

impl LogDevice for MemLog {
    fn append(&self, group: LogGroup, payload: &[u8]) -> Result<LogSeq> {
        let mut state = self.state.lock();
        let next = state.next_seq.entry(group).or_insert(1);
        let seq = *next;
        *next += 1;
        let crc = frame_crc32(group, seq, payload);
        state
            .frames
            .insert((group, seq), (crc, Bytes::copy_from_slice(payload)));
        state.stats.appends += 1;
        state.stats.bytes_appended += payload.len() as u64;
        Ok(seq)
    }

    fn load(&self, group: LogGroup, seq: LogSeq) -> Result<Bytes> {
        let mut state = self.state.lock();
        let (crc, payload) = state
            .frames
            .get(&(group, seq))
            .cloned()
            .ok_or(BasaltError::NotFound)?;
        if frame_crc32(group, seq, &payload) != crc {
            return Err(BasaltError::Corruption("log payload crc mismatch"));
        }
        state.stats.loads += 1;
        Ok(payload)
    }
}

#[derive(Clone, Debug)]
struct FrameHeader {
    group: LogGroup,
    seq: LogSeq,
    len: u32,
    payload_crc32: u32,
}

impl FrameHeader {
    fn encode(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut buf = [0u8; FRAME_HEADER_LEN];
        buf[0..4].copy_from_slice(&self.group.to_be_bytes());
        buf[4..12].copy_from_slice(&self.seq.to_be_bytes());
        buf[12..16].copy_from_slice(&self.len.to_be_bytes());
        buf[16..20].copy_from_slice(&self.payload_crc32.to_be_bytes());
        let crc = crc32(&buf[0..20]);
        buf[20..24].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    fn decode(src: &[u8; FRAME_HEADER_LEN]) -> Result<Self> {
        let stored = u32::from_be_bytes([src[20], src[21], src[22], src[23]]);
        if crc32(&src[0..20]) != stored {
            return Err(BasaltError::Corruption("log frame header crc mismatch"));
        }
        let mut group = [0u8; 4];
        group.copy_from_slice(&src[0..4]);
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&src[4..12]);
        let mut len = [0u8; 4];
        len.copy_from_slice(&src[12..16]);
        let mut payload_crc = [0u8; 4];
        payload_crc.copy_from_slice(&src[16..20]);
        Ok(Self {
            group: u32::from_be_bytes(group),
            seq: u64::from_be_bytes(seq),
            len: u32::from_be_bytes(len),
            payload_crc32: u32::from_be_bytes(payload_crc),
        })
    }
}

fn encode_file_header() -> [u8; FILE_HEADER_LEN] {
    let mut buf = [0u8; FILE_HEADER_LEN];
    buf[0..4].copy_from_slice(&LOG_MAGIC);
    buf[4..6].copy_from_slice(&LOG_FORMAT_VERSION.to_be_bytes());
    let crc = crc32(&buf[0..8]);
    buf[8..12].copy_from_slice(&crc.to_be_bytes());
    buf
}

fn validate_file_header(buf: &[u8; FILE_HEADER_LEN]) -> Result<()> {
    if buf[0..4] != LOG_MAGIC {
        return Err(BasaltError::Corruption("log magic mismatch"));
    }
    if u16::from_be_bytes([buf[4], buf[5]]) != LOG_FORMAT_VERSION {
        return Err(BasaltError::Corruption("log format version mismatch"));
    }
    if buf[6..8] != [0, 0] {
        return Err(BasaltError::Corruption("log reserved header bytes non-zero"));
    }
    let stored = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
    if crc32(&buf[0..8]) != stored {
        return Err(BasaltError::Corruption("log header crc mismatch"));
    }
    Ok(())
}

struct FileLogState {
    file: File,
    append_offset: u64,
    index: FxHashMap<(LogGroup, LogSeq), u64>,
    next_seq: FxHashMap<LogGroup, LogSeq>,
    stats: LogStats,
}

/// File-backed log device.
///
/// Frames are appended sequentially and synced before `append` returns. On
/// reopen the `(group, seq)` index is rebuilt by scanning the file; scanning
/// stops at the first torn or corrupt frame and the file is truncated there.
pub struct FileLog {
    state: Mutex<FileLogState>,
}

impl FileLog {
    /// Opens or creates the log at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = file.metadata()?.len();
        if len < FILE_HEADER_LEN as u64 {
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&encode_file_header())?;
            file.sync_all()?;
        } else {
            let mut header = [0u8; FILE_HEADER_LEN];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut header)?;
            validate_file_header(&header)?;
        }
        let mut state = FileLogState {
            file,
            append_offset: FILE_HEADER_LEN as u64,
            index: FxHashMap::default(),
            next_seq: FxHashMap::default(),
            stats: LogStats::default(),
        };
        Self::replay(&mut state)?;
        debug!(
            path = %path.display(),
            frames = state.index.len(),
            append_offset = state.append_offset,
            "log device opened"
        );
        Ok(Self {
            state: Mutex::new(state),
        })
    }

    fn replay(state: &mut FileLogState) -> Result<()> {
        let end = state.file.metadata()?.len();
        let mut offset = FILE_HEADER_LEN as u64;
        loop {
            if offset + FRAME_HEADER_LEN as u64 > end {
                break;
            }
            let mut raw = [0u8; FRAME_HEADER_LEN];
            state.file.seek(SeekFrom::Start(offset))?;
            state.file.read_exact(&mut raw)?;
            let header = match FrameHeader::decode(&raw) {
                Ok(header) => header,
                Err(_) => break,
            };
            let payload_end = offset + FRAME_HEADER_LEN as u64 + u64::from(header.len);
            if payload_end > end {
                break;
            }
            let mut payload = vec![0u8; header.len as usize];
            state.file.read_exact(&mut payload)?;
            if frame_crc32(header.group, header.seq, &payload) != header.payload_crc32 {
                break;
            }
            state.index.insert((header.group, header.seq), offset);
            let next = state.next_seq.entry(header.group).or_insert(1);
            *next = (*next).max(header.seq + 1);
            offset = payload_end;
        }
        if offset < end {
            warn!(valid_up_to = offset, file_len = end, "truncating torn log tail");
            state.file.set_len(offset)?;
        }
        state.append_offset = offset;
        Ok(())
    }

    /// Returns a copy of the current statistics.
    pub fn stats(&self) -> LogStats {
        self.state.lock().stats.clone()
    }

    /// Number of frames currently indexed.
    pub fn frame_count(&self) -> usize {
        self.state.lock().index.len()
    }
}

impl LogDevice for FileLog {
    fn append(&self, group: LogGroup, payload: &[u8]) -> Result<LogSeq> {
        let len = u32::try_from(payload.len())
            .map_err(|_| BasaltError::Invalid("log payload too large"))?;
        let mut state = self.state.lock();
        let seq = *state.next_seq.get(&group).unwrap_or(&1);
        let header = FrameHeader {
            group,
            seq,
            len,
            payload_crc32: frame_crc32(group, seq, payload),
        };
        let offset = state.append_offset;
        state.file.seek(SeekFrom::Start(offset))?;
        state.file.write_all(&header.encode())?;
        state.file.write_all(payload)?;
        state.file.sync_data()?;
        state.append_offset = offset + FRAME_HEADER_LEN as u64 + u64::from(len);
        state.index.insert((group, seq), offset);
        state.next_seq.insert(group, seq + 1);
        state.stats.appends += 1;
        state.stats.bytes_appended += u64::from(len);
        Ok(seq)
    }

    fn load(&self, group: LogGroup, seq: LogSeq) -> Result<Bytes> {
        let mut state = self.state.lock();
        let offset = *state
            .index
            .get(&(group, seq))
            .ok_or(BasaltError::NotFound)?;
        let mut raw = [0u8; FRAME_HEADER_LEN];
        state.file.seek(SeekFrom::Start(offset))?;
        state.file.read_exact(&mut raw)?;
        let header = FrameHeader::decode(&raw)?;
        if header.group != group || header.seq != seq {
            return Err(BasaltError::Corruption("log index points at foreign frame"));
        }
        let mut payload = vec![0u8; header.len as usize];
        state.file.read_exact(&mut payload)?;
        if frame_crc32(group, seq, &payload) != header.payload_crc32 {
            return Err(BasaltError::Corruption("log payload crc mismatch"));
        }
        state.stats.loads += 1;
        Ok(Bytes::from(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn mem_log_sequences_per_group() -> Result<()> {
        let log = MemLog::new();
        assert_eq!(log.append(1, b"a")?, 1);
        assert_eq!(log.append(1, b"b")?, 2);
        assert_eq!(log.append(2, b"c")?, 1);
        assert_eq!(&log.load(1, 2)?[..], b"b");
        assert_eq!(&log.load(2, 1)?[..], b"c");
        assert!(matches!(log.load(3, 1), Err(BasaltError::NotFound)));
        assert_eq!(log.stats().appends, 3);
        Ok(())
    }

    #[test]
    fn file_log_reopens_with_index() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("updates.log");
        {
            let log = FileLog::open(&path)?;
            assert_eq!(log.append(UPDATE_GROUP, b"first")?, 1);
            assert_eq!(log.append(UPDATE_GROUP, b"second")?, 2);
            assert_eq!(log.append(7, b"other")?, 1);
        }
        let log = FileLog::open(&path)?;
        assert_eq!(log.frame_count(), 3);
        assert_eq!(&log.load(UPDATE_GROUP, 1)?[..], b"first");
        assert_eq!(&log.load(7, 1)?[..], b"other");
        assert_eq!(log.append(UPDATE_GROUP, b"third")?, 3);
        Ok(())
    }

    #[test]
    fn file_log_truncates_torn_tail() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("torn.log");
        {
            let log = FileLog::open(&path)?;
            log.append(UPDATE_GROUP, b"kept")?;
            log.append(UPDATE_GROUP, b"torn-away")?;
        }
        let len = std::fs::metadata(&path)?.len();
        let file = OpenOptions::new().write(true).open(&path)?;
        file.set_len(len - 3)?;
        drop(file);

        let log = FileLog::open(&path)?;
        assert_eq!(log.frame_count(), 1);
        assert_eq!(&log.load(UPDATE_GROUP, 1)?[..], b"kept");
        assert!(matches!(log.load(UPDATE_GROUP, 2), Err(BasaltError::NotFound)));
        assert_eq!(log.append(UPDATE_GROUP, b"again")?, 2);
        Ok(())
    }

    #[test]
    fn file_log_rejects_foreign_header() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("foreign.log");
        std::fs::write(&path, b"NOTALOGFILE!")?;
        assert!(matches!(
            FileLog::open(&path),
            Err(BasaltError::Corruption(_))
        ));
        Ok(())
    }
}
