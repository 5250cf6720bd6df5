//! The Write-Ahead Log manager.
//!
//! The log is a single append-only file that starts with an eight byte
//! magic header. A record's LSN is its byte offset in the file. Every record
//! carries a fixed prefix:
//!
//! ```text
//! total_len u32 | tx_id u32 | prev_lsn u64 | undo_next u64 | kind u8 | crc u32
//! ```
//!
//! followed by a kind-specific payload. The CRC covers the prefix fields
//! before it and the payload.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Buf, BufMut, BytesMut};
use crc32fast::Hasher;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{Result, StoreError};
use crate::failpoint::{self, Failpoint};
use crate::log_op::LogOperation;
use crate::page_id::PageId;
use crate::{Lsn, TxId};

pub const LOG_MAGIC: &[u8; 8] = b"ARBORWAL";
pub const FIRST_LSN: Lsn = LOG_MAGIC.len() as Lsn;
pub const RECORD_PREFIX_SIZE: usize = 29;
const CRC_OFFSET: usize = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    Update = 1,
    Compensation = 2,
    Skip = 3,
    Commit = 4,
    Abort = 5,
    End = 6,
    Checkpoint = 7,
}

impl RecordKind {
    fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            1 => RecordKind::Update,
            2 => RecordKind::Compensation,
            3 => RecordKind::Skip,
            4 => RecordKind::Commit,
            5 => RecordKind::Abort,
            6 => RecordKind::End,
            7 => RecordKind::Checkpoint,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LogBody {
    /// A redoable and undoable change.
    Update(LogOperation),
    /// Redo-only record written while undoing. Its `undo_next` names the
    /// next record of the transaction still to be undone.
    Compensation(LogOperation),
    /// Ends a nested top action. Undo jumps over the action to `undo_next`.
    Skip,
    /// Carries the pages whose deallocation was deferred to commit, so that
    /// restart can finish a commit that crashed before its end record.
    Commit { deferred: Vec<(PageId, u32)> },
    Abort,
    End,
    Checkpoint { redo_start: Lsn },
}

impl LogBody {
    pub fn kind(&self) -> RecordKind {
        match self {
            LogBody::Update(_) => RecordKind::Update,
            LogBody::Compensation(_) => RecordKind::Compensation,
            LogBody::Skip => RecordKind::Skip,
            LogBody::Commit { .. } => RecordKind::Commit,
            LogBody::Abort => RecordKind::Abort,
            LogBody::End => RecordKind::End,
            LogBody::Checkpoint { .. } => RecordKind::Checkpoint,
        }
    }

    pub fn operation(&self) -> Option<&LogOperation> {
        match self {
            LogBody::Update(op) | LogBody::Compensation(op) => Some(op),
            _ => None,
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        match self {
            LogBody::Update(op) | LogBody::Compensation(op) => op.encode(buf),
            LogBody::Commit { deferred } => {
                buf.put_u16(deferred.len() as u16);
                for (page, unit) in deferred {
                    page.encode(buf);
                    buf.put_u32(*unit);
                }
            }
            LogBody::Checkpoint { redo_start } => buf.put_u64(*redo_start),
            LogBody::Skip | LogBody::Abort | LogBody::End => {}
        }
    }

    fn decode(kind: RecordKind, mut payload: &[u8], lsn: Lsn) -> Result<Self> {
        Ok(match kind {
            RecordKind::Update => LogBody::Update(LogOperation::decode(&mut payload, lsn)?),
            RecordKind::Compensation => {
                LogBody::Compensation(LogOperation::decode(&mut payload, lsn)?)
            }
            RecordKind::Skip => LogBody::Skip,
            RecordKind::Commit => {
                if payload.remaining() < 2 {
                    return Err(StoreError::corrupt(lsn, "commit record truncated"));
                }
                let count = payload.get_u16() as usize;
                if payload.remaining() < count * (PageId::SIZE + 4) {
                    return Err(StoreError::corrupt(lsn, "commit record truncated"));
                }
                let mut deferred = Vec::with_capacity(count);
                for _ in 0..count {
                    let page = PageId::decode(&mut payload);
                    deferred.push((page, payload.get_u32()));
                }
                LogBody::Commit { deferred }
            }
            RecordKind::Abort => LogBody::Abort,
            RecordKind::End => LogBody::End,
            RecordKind::Checkpoint => {
                if payload.remaining() < 8 {
                    return Err(StoreError::corrupt(lsn, "checkpoint record truncated"));
                }
                LogBody::Checkpoint {
                    redo_start: payload.get_u64(),
                }
            }
        })
    }
}

/// A single record in the WAL.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub lsn: Lsn,
    pub tx_id: TxId,
    pub prev_lsn: Lsn,
    pub undo_next: Lsn,
    pub body: LogBody,
    len: u32,
}

impl LogRecord {
    /// LSN of the record that follows this one.
    pub fn end_lsn(&self) -> Lsn {
        self.lsn + self.len as Lsn
    }

    pub fn is_redoable(&self) -> bool {
        self.body.operation().is_some()
    }

    fn parse(lsn: Lsn, bytes: &[u8]) -> Result<Self> {
        if bytes.len() < RECORD_PREFIX_SIZE {
            return Err(StoreError::corrupt(lsn, "record prefix truncated"));
        }
        let mut prefix = &bytes[..RECORD_PREFIX_SIZE];
        let len = prefix.get_u32();
        let tx_id = prefix.get_u32();
        let prev_lsn = prefix.get_u64();
        let undo_next = prefix.get_u64();
        let raw_kind = prefix.get_u8();
        let crc = prefix.get_u32();

        if (len as usize) < RECORD_PREFIX_SIZE || bytes.len() < len as usize {
            return Err(StoreError::corrupt(lsn, format!("bad record length {len}")));
        }
        let payload = &bytes[RECORD_PREFIX_SIZE..len as usize];
        let mut hasher = Hasher::new();
        hasher.update(&bytes[..CRC_OFFSET]);
        hasher.update(payload);
        if hasher.finalize() != crc {
            return Err(StoreError::corrupt(lsn, "crc mismatch"));
        }
        let kind = RecordKind::from_u8(raw_kind)
            .ok_or_else(|| StoreError::corrupt(lsn, format!("unknown record kind {raw_kind}")))?;
        Ok(LogRecord {
            lsn,
            tx_id,
            prev_lsn,
            undo_next,
            body: LogBody::decode(kind, payload, lsn)?,
            len,
        })
    }
}

fn encode_record(tx_id: TxId, prev_lsn: Lsn, undo_next: Lsn, body: &LogBody) -> BytesMut {
    let mut payload = BytesMut::new();
    body.encode(&mut payload);
    let total_len = (RECORD_PREFIX_SIZE + payload.len()) as u32;

    let mut record = BytesMut::with_capacity(total_len as usize);
    record.put_u32(total_len);
    record.put_u32(tx_id);
    record.put_u64(prev_lsn);
    record.put_u64(undo_next);
    record.put_u8(body.kind() as u8);

    let mut hasher = Hasher::new();
    hasher.update(&record[..CRC_OFFSET]);
    hasher.update(&payload);
    record.put_u32(hasher.finalize());
    record.extend_from_slice(&payload);
    record
}

struct WalInner {
    file: File,
    /// Appended records not yet written to the file.
    buffer: BytesMut,
    buffer_start: Lsn,
    next_lsn: Lsn,
}

impl WalInner {
    fn write_out(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.file.seek(SeekFrom::Start(self.buffer_start))?;
        self.file.write_all(&self.buffer)?;
        self.buffer.clear();
        self.buffer_start = self.next_lsn;
        Ok(())
    }
}

/// The WAL manager.
pub struct WalManager {
    inner: Mutex<WalInner>,
    /// Every record starting below this LSN is durable.
    flushed_lsn: AtomicU64,
    capacity: usize,
    path: PathBuf,
}

impl WalManager {
    /// Opens the log, creating it if needed. A torn or corrupt tail left by
    /// a crash is cut off.
    pub fn open<P: AsRef<Path>>(path: P, buffer_capacity: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;
        let end = if contents.is_empty() {
            file.write_all(LOG_MAGIC)?;
            file.sync_all()?;
            FIRST_LSN
        } else {
            if contents.len() < LOG_MAGIC.len() || &contents[..LOG_MAGIC.len()] != LOG_MAGIC {
                return Err(StoreError::corrupt(0, "log file header mismatch"));
            }
            let end = Self::valid_prefix(&contents);
            if end < contents.len() as Lsn {
                warn!(
                    ?path,
                    valid = end,
                    size = contents.len(),
                    "cutting torn log tail"
                );
                file.set_len(end)?;
                file.sync_all()?;
            }
            end
        };
        debug!(?path, next_lsn = end, "opened log");

        Ok(Self {
            inner: Mutex::new(WalInner {
                file,
                buffer: BytesMut::with_capacity(buffer_capacity),
                buffer_start: end,
                next_lsn: end,
            }),
            flushed_lsn: AtomicU64::new(end),
            capacity: buffer_capacity,
            path,
        })
    }

    fn valid_prefix(contents: &[u8]) -> Lsn {
        let mut lsn = FIRST_LSN;
        while (lsn as usize) < contents.len() {
            match LogRecord::parse(lsn, &contents[lsn as usize..]) {
                Ok(record) => lsn = record.end_lsn(),
                Err(_) => break,
            }
        }
        lsn
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends a record to the log buffer and returns its LSN. The record
    /// is not durable until `flush` covers it.
    pub fn append(&self, tx_id: TxId, prev_lsn: Lsn, undo_next: Lsn, body: &LogBody) -> Result<Lsn> {
        let record = encode_record(tx_id, prev_lsn, undo_next, body);
        let mut inner = self.inner.lock();
        if inner.buffer.len() + record.len() > self.capacity {
            inner.write_out()?;
        }
        let lsn = inner.next_lsn;
        inner.buffer.extend_from_slice(&record);
        inner.next_lsn += record.len() as Lsn;
        Ok(lsn)
    }

    /// Makes every record up to and including the one at `lsn` durable.
    pub fn flush(&self, lsn: Lsn) -> Result<()> {
        if lsn < self.flushed_lsn.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        failpoint::check(Failpoint::WalFlush)?;
        inner.write_out()?;
        inner.file.sync_data()?;
        self.flushed_lsn.store(inner.next_lsn, Ordering::Release);
        Ok(())
    }

    pub fn flush_all(&self) -> Result<()> {
        self.flush(self.next_lsn())
    }

    pub fn next_lsn(&self) -> Lsn {
        self.inner.lock().next_lsn
    }

    pub fn flushed_lsn(&self) -> Lsn {
        self.flushed_lsn.load(Ordering::Acquire)
    }

    pub fn read_record(&self, lsn: Lsn) -> Result<LogRecord> {
        let mut inner = self.inner.lock();
        if lsn < FIRST_LSN || lsn >= inner.next_lsn {
            return Err(StoreError::corrupt(lsn, "LSN outside the log"));
        }
        if lsn >= inner.buffer_start {
            let start = (lsn - inner.buffer_start) as usize;
            return LogRecord::parse(lsn, &inner.buffer[start..]);
        }

        let mut prefix = [0u8; RECORD_PREFIX_SIZE];
        inner.file.seek(SeekFrom::Start(lsn))?;
        inner.file.read_exact(&mut prefix)?;
        let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        if len < RECORD_PREFIX_SIZE || lsn + len as Lsn > inner.buffer_start {
            return Err(StoreError::corrupt(lsn, format!("bad record length {len}")));
        }
        let mut bytes = vec![0u8; len];
        bytes[..RECORD_PREFIX_SIZE].copy_from_slice(&prefix);
        inner.file.read_exact(&mut bytes[RECORD_PREFIX_SIZE..])?;
        LogRecord::parse(lsn, &bytes)
    }

    /// Iterates over the records from `from` up to the current end of log.
    pub fn records(&self, from: Lsn) -> LogIter<'_> {
        LogIter {
            wal: self,
            next: from.max(FIRST_LSN),
            end: self.next_lsn(),
        }
    }
}

pub struct LogIter<'a> {
    wal: &'a WalManager,
    next: Lsn,
    end: Lsn,
}

impl Iterator for LogIter<'_> {
    type Item = Result<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.end {
            return None;
        }
        match self.wal.read_record(self.next) {
            Ok(record) => {
                self.next = record.end_lsn();
                Some(Ok(record))
            }
            Err(e) => {
                self.next = self.end;
                Some(Err(e))
            }
        }
    }
}
