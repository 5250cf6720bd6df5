//! Log operations: the closed set of changes the store writes to the log,
//! with their encoding and their redo and undo actions.
//!
//! Redo is idempotent. Allocation redo consults the allocation map; every
//! other operation compares the page LSN with the record's LSN. Undo writes
//! a compensation record for whatever it changes.

use bytes::{Buf, BufMut};
use tracing::error;

use crate::blink::tree::undo_user_record;
use crate::blob;
use crate::error::{RedoOutcome, Result, StoreError};
use crate::field::Field;
use crate::latch::LatchMode;
use crate::page::{Page, PageKind, PageType, FLAG_COMPRESSED, FLAG_LAST_IN_LEVEL, FLAG_UNIQUE, SLOT_EXTERNALIZED};
use crate::page_id::PageId;
use crate::transaction::Tx;
use crate::Lsn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordAction {
    Insert = 1,
    Update = 2,
    Delete = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PointerKind {
    Prev = 1,
    Low = 2,
}

/// The complete header state a format establishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFormat {
    pub kind: PageKind,
    pub unit: u32,
    pub page_type: PageType,
    pub root: PageId,
    pub key_type: Field,
    pub value_type: Field,
    pub height: u8,
    pub unique: bool,
    pub compressed: bool,
    pub last_in_level: bool,
    pub prev: PageId,
    pub low: PageId,
}

impl PageFormat {
    const SIZE: usize = 1 + 4 + 1 + PageId::SIZE + 1 + 1 + 1 + 1 + PageId::SIZE + PageId::SIZE;

    /// A fresh B-link page with no siblings or children.
    pub fn blink(
        unit: u32,
        page_type: PageType,
        root: PageId,
        key_type: Field,
        value_type: Field,
        unique: bool,
    ) -> Self {
        Self {
            kind: PageKind::Blink,
            unit,
            page_type,
            root,
            key_type,
            value_type,
            height: 0,
            unique,
            compressed: false,
            last_in_level: true,
            prev: PageId::NONE,
            low: PageId::NONE,
        }
    }

    pub fn read(page: &Page) -> Self {
        let flags = page.flags();
        Self {
            kind: page.kind().unwrap_or(PageKind::Free),
            unit: page.unit(),
            page_type: page.page_type().unwrap_or(PageType::Leaf),
            root: page.base_page(),
            key_type: Field::from_id(page.key_type_id()).unwrap_or(Field::Null),
            value_type: Field::from_id(page.value_type_id()).unwrap_or(Field::Null),
            height: page.height(),
            unique: flags & FLAG_UNIQUE != 0,
            compressed: flags & FLAG_COMPRESSED != 0,
            last_in_level: flags & FLAG_LAST_IN_LEVEL != 0,
            prev: page.prev_page(),
            low: page.low_page(),
        }
    }

    fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.unique {
            flags |= FLAG_UNIQUE;
        }
        if self.compressed {
            flags |= FLAG_COMPRESSED;
        }
        if self.last_in_level {
            flags |= FLAG_LAST_IN_LEVEL;
        }
        flags
    }

    /// Resets the page to this header with no records. The LSN is kept.
    pub fn apply(&self, page: &mut Page) {
        page.reset(self.kind);
        page.set_unit(self.unit);
        page.set_base_page(self.root);
        page.set_flags(self.flags());
        page.set_page_type(self.page_type);
        page.set_key_type_id(self.key_type.id());
        page.set_value_type_id(self.value_type.id());
        page.set_height(self.height);
        page.set_prev_page(self.prev);
        page.set_low_page(self.low);
    }

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.kind as u8);
        buf.put_u32(self.unit);
        buf.put_u8(self.page_type as u8);
        self.root.encode(buf);
        buf.put_u8(self.key_type.id());
        buf.put_u8(self.value_type.id());
        buf.put_u8(self.height);
        buf.put_u8(self.flags());
        self.prev.encode(buf);
        self.low.encode(buf);
    }

    fn decode(buf: &mut &[u8], lsn: Lsn) -> Result<Self> {
        need(buf, Self::SIZE, lsn)?;
        let kind = PageKind::from_u8(buf.get_u8())
            .ok_or_else(|| StoreError::corrupt(lsn, "bad page kind"))?;
        let unit = buf.get_u32();
        let page_type = PageType::from_u8(buf.get_u8())
            .ok_or_else(|| StoreError::corrupt(lsn, "bad page type"))?;
        let root = PageId::decode(buf);
        let key_type = Field::from_id(buf.get_u8()).map_err(|_| StoreError::corrupt(lsn, "bad key type"))?;
        let value_type =
            Field::from_id(buf.get_u8()).map_err(|_| StoreError::corrupt(lsn, "bad value type"))?;
        let height = buf.get_u8();
        let flags = buf.get_u8();
        let prev = PageId::decode(buf);
        let low = PageId::decode(buf);
        Ok(Self {
            kind,
            unit,
            page_type,
            root,
            key_type,
            value_type,
            height,
            unique: flags & FLAG_UNIQUE != 0,
            compressed: flags & FLAG_COMPRESSED != 0,
            last_in_level: flags & FLAG_LAST_IN_LEVEL != 0,
            prev,
            low,
        })
    }
}

/// A record-level change on a B-link page. Values are the stored bytes:
/// for an externalized value that is the overflow page id.
///
/// For inserts and deletes `value` is the record inserted or removed. For
/// updates `value` is the new value and `old_value` the replaced one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordOp {
    pub action: RecordAction,
    pub smo: bool,
    pub page: PageId,
    pub root: PageId,
    pub pos: u16,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub externalized: bool,
    pub old_value: Vec<u8>,
    pub old_externalized: bool,
}

impl RecordOp {
    fn size(&self) -> usize {
        1 + 1 + PageId::SIZE * 2 + 2 + 1 + 2 * 3 + self.key.len() + self.value.len() + self.old_value.len()
    }

    fn flags(externalized: bool) -> u8 {
        if externalized {
            SLOT_EXTERNALIZED
        } else {
            0
        }
    }

    /// The physical inverse at the same slot.
    pub fn inverse(&self) -> RecordOp {
        let mut inverse = self.clone();
        match self.action {
            RecordAction::Insert => inverse.action = RecordAction::Delete,
            RecordAction::Delete => inverse.action = RecordAction::Insert,
            RecordAction::Update => {
                inverse.value = self.old_value.clone();
                inverse.externalized = self.old_externalized;
                inverse.old_value = self.value.clone();
                inverse.old_externalized = self.externalized;
            }
        }
        inverse
    }

    pub(crate) fn apply(&self, page: &mut Page) -> Result<()> {
        let pos = self.pos as usize;
        match self.action {
            RecordAction::Insert => {
                if !page.insert_record(pos, &self.key, &self.value, Self::flags(self.externalized))? {
                    return Err(StoreError::fatal(self.page, "logged insert does not fit"));
                }
            }
            RecordAction::Delete => {
                if page.key(pos)? != self.key.as_slice() {
                    return Err(StoreError::fatal(
                        self.page,
                        format!("logged delete at slot {pos} names a different key"),
                    ));
                }
                page.remove_record(pos)?;
            }
            RecordAction::Update => {
                if !page.replace_value(pos, &self.value, Self::flags(self.externalized))? {
                    return Err(StoreError::fatal(self.page, "logged update does not fit"));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LogOperation {
    AllocatePage {
        page: PageId,
        unit: u32,
    },
    /// Only ever written as a compensation record.
    DeallocatePage {
        page: PageId,
        unit: u32,
    },
    Format {
        page: PageId,
        before: PageFormat,
        after: PageFormat,
    },
    Record(RecordOp),
    Pointer {
        kind: PointerKind,
        page: PageId,
        root: PageId,
        old: PageId,
        new: PageId,
    },
    LastInLevel {
        page: PageId,
        root: PageId,
        old: bool,
        new: bool,
    },
    /// One chunk of an overflow chain, with the chunk it replaced. A fresh
    /// page has an empty previous chunk.
    BlobChunk {
        page: PageId,
        unit: u32,
        next: PageId,
        data: Vec<u8>,
        old_next: PageId,
        old_data: Vec<u8>,
    },
}

const TAG_ALLOCATE: u8 = 1;
const TAG_DEALLOCATE: u8 = 2;
const TAG_FORMAT: u8 = 3;
const TAG_RECORD: u8 = 4;
const TAG_POINTER: u8 = 5;
const TAG_LAST_IN_LEVEL: u8 = 6;
const TAG_BLOB_CHUNK: u8 = 7;

fn need(buf: &[u8], len: usize, lsn: Lsn) -> Result<()> {
    if buf.remaining() < len {
        return Err(StoreError::corrupt(lsn, "log operation truncated"));
    }
    Ok(())
}

fn decode_bytes(buf: &mut &[u8], lsn: Lsn) -> Result<Vec<u8>> {
    need(buf, 2, lsn)?;
    let len = buf.get_u16() as usize;
    need(buf, len, lsn)?;
    let bytes = buf[..len].to_vec();
    buf.advance(len);
    Ok(bytes)
}

impl LogOperation {
    /// The page the operation changes.
    pub fn page_id(&self) -> PageId {
        match self {
            LogOperation::AllocatePage { page, .. }
            | LogOperation::DeallocatePage { page, .. }
            | LogOperation::Format { page, .. }
            | LogOperation::Pointer { page, .. }
            | LogOperation::LastInLevel { page, .. }
            | LogOperation::BlobChunk { page, .. } => *page,
            LogOperation::Record(op) => op.page,
        }
    }

    /// Encoded size in bytes.
    pub fn size(&self) -> usize {
        1 + match self {
            LogOperation::AllocatePage { .. } | LogOperation::DeallocatePage { .. } => PageId::SIZE + 4,
            LogOperation::Format { .. } => PageId::SIZE + 2 * PageFormat::SIZE,
            LogOperation::Record(op) => op.size(),
            LogOperation::Pointer { .. } => 1 + 4 * PageId::SIZE,
            LogOperation::LastInLevel { .. } => 2 * PageId::SIZE + 2,
            LogOperation::BlobChunk { data, old_data, .. } => {
                3 * PageId::SIZE + 4 + 2 + data.len() + 2 + old_data.len()
            }
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        match self {
            LogOperation::AllocatePage { page, unit } => {
                buf.put_u8(TAG_ALLOCATE);
                page.encode(buf);
                buf.put_u32(*unit);
            }
            LogOperation::DeallocatePage { page, unit } => {
                buf.put_u8(TAG_DEALLOCATE);
                page.encode(buf);
                buf.put_u32(*unit);
            }
            LogOperation::Format { page, before, after } => {
                buf.put_u8(TAG_FORMAT);
                page.encode(buf);
                before.encode(buf);
                after.encode(buf);
            }
            LogOperation::Record(op) => {
                buf.put_u8(TAG_RECORD);
                buf.put_u8(op.action as u8);
                buf.put_u8(op.smo as u8);
                op.page.encode(buf);
                op.root.encode(buf);
                buf.put_u16(op.pos);
                buf.put_u8(op.externalized as u8 | (op.old_externalized as u8) << 1);
                for bytes in [&op.key, &op.value, &op.old_value] {
                    buf.put_u16(bytes.len() as u16);
                    buf.put_slice(bytes);
                }
            }
            LogOperation::Pointer {
                kind,
                page,
                root,
                old,
                new,
            } => {
                buf.put_u8(TAG_POINTER);
                buf.put_u8(*kind as u8);
                page.encode(buf);
                root.encode(buf);
                old.encode(buf);
                new.encode(buf);
            }
            LogOperation::LastInLevel {
                page,
                root,
                old,
                new,
            } => {
                buf.put_u8(TAG_LAST_IN_LEVEL);
                page.encode(buf);
                root.encode(buf);
                buf.put_u8(*old as u8);
                buf.put_u8(*new as u8);
            }
            LogOperation::BlobChunk {
                page,
                unit,
                next,
                data,
                old_next,
                old_data,
            } => {
                buf.put_u8(TAG_BLOB_CHUNK);
                page.encode(buf);
                buf.put_u32(*unit);
                next.encode(buf);
                buf.put_u16(data.len() as u16);
                buf.put_slice(data);
                old_next.encode(buf);
                buf.put_u16(old_data.len() as u16);
                buf.put_slice(old_data);
            }
        }
    }

    pub fn decode(buf: &mut &[u8], lsn: Lsn) -> Result<Self> {
        need(buf, 1, lsn)?;
        let op = match buf.get_u8() {
            tag @ (TAG_ALLOCATE | TAG_DEALLOCATE) => {
                need(buf, PageId::SIZE + 4, lsn)?;
                let page = PageId::decode(buf);
                let unit = buf.get_u32();
                if tag == TAG_ALLOCATE {
                    LogOperation::AllocatePage { page, unit }
                } else {
                    LogOperation::DeallocatePage { page, unit }
                }
            }
            TAG_FORMAT => {
                need(buf, PageId::SIZE, lsn)?;
                let page = PageId::decode(buf);
                let before = PageFormat::decode(buf, lsn)?;
                let after = PageFormat::decode(buf, lsn)?;
                LogOperation::Format { page, before, after }
            }
            TAG_RECORD => {
                need(buf, 2 + 2 * PageId::SIZE + 3, lsn)?;
                let action = match buf.get_u8() {
                    1 => RecordAction::Insert,
                    2 => RecordAction::Update,
                    3 => RecordAction::Delete,
                    other => return Err(StoreError::corrupt(lsn, format!("bad record action {other}"))),
                };
                let smo = buf.get_u8() != 0;
                let page = PageId::decode(buf);
                let root = PageId::decode(buf);
                let pos = buf.get_u16();
                let flags = buf.get_u8();
                let key = decode_bytes(buf, lsn)?;
                let value = decode_bytes(buf, lsn)?;
                let old_value = decode_bytes(buf, lsn)?;
                LogOperation::Record(RecordOp {
                    action,
                    smo,
                    page,
                    root,
                    pos,
                    key,
                    value,
                    externalized: flags & 1 != 0,
                    old_value,
                    old_externalized: flags & 2 != 0,
                })
            }
            TAG_POINTER => {
                need(buf, 1 + 4 * PageId::SIZE, lsn)?;
                let kind = match buf.get_u8() {
                    1 => PointerKind::Prev,
                    2 => PointerKind::Low,
                    other => return Err(StoreError::corrupt(lsn, format!("bad pointer kind {other}"))),
                };
                LogOperation::Pointer {
                    kind,
                    page: PageId::decode(buf),
                    root: PageId::decode(buf),
                    old: PageId::decode(buf),
                    new: PageId::decode(buf),
                }
            }
            TAG_LAST_IN_LEVEL => {
                need(buf, 2 * PageId::SIZE + 2, lsn)?;
                LogOperation::LastInLevel {
                    page: PageId::decode(buf),
                    root: PageId::decode(buf),
                    old: buf.get_u8() != 0,
                    new: buf.get_u8() != 0,
                }
            }
            TAG_BLOB_CHUNK => {
                need(buf, 2 * PageId::SIZE + 4, lsn)?;
                let page = PageId::decode(buf);
                let unit = buf.get_u32();
                let next = PageId::decode(buf);
                let data = decode_bytes(buf, lsn)?;
                need(buf, PageId::SIZE, lsn)?;
                let old_next = PageId::decode(buf);
                let old_data = decode_bytes(buf, lsn)?;
                LogOperation::BlobChunk {
                    page,
                    unit,
                    next,
                    data,
                    old_next,
                    old_data,
                }
            }
            other => return Err(StoreError::corrupt(lsn, format!("unknown operation tag {other}"))),
        };
        Ok(op)
    }

    /// Applies a page-level change to a latched page image.
    pub(crate) fn apply(&self, page: &mut Page) -> Result<()> {
        match self {
            LogOperation::AllocatePage { page: id, .. } | LogOperation::DeallocatePage { page: id, .. } => {
                Err(StoreError::fatal(*id, "allocation changes are not page changes"))
            }
            LogOperation::Format { after, .. } => {
                after.apply(page);
                Ok(())
            }
            LogOperation::Record(op) => op.apply(page),
            LogOperation::Pointer { kind, new, .. } => {
                match kind {
                    PointerKind::Prev => page.set_prev_page(*new),
                    PointerKind::Low => page.set_low_page(*new),
                }
                Ok(())
            }
            LogOperation::LastInLevel { new, .. } => {
                let flags = page.flags();
                page.set_flags(if *new {
                    flags | FLAG_LAST_IN_LEVEL
                } else {
                    flags & !FLAG_LAST_IN_LEVEL
                });
                Ok(())
            }
            LogOperation::BlobChunk {
                unit, next, data, ..
            } => blob::apply_chunk(page, *unit, *next, data),
        }
    }

    /// Replays the operation if the store does not reflect it yet.
    pub fn redo(&self, tx: &Tx, lsn: Lsn) -> Result<RedoOutcome> {
        let bm = tx.buffer_manager();
        match self {
            LogOperation::AllocatePage { page, unit } => {
                if bm.is_allocated(*page)? {
                    return Ok(RedoOutcome::AlreadySatisfied);
                }
                bm.allocate_at(*page, *unit, lsn)?;
                Ok(RedoOutcome::Applied)
            }
            LogOperation::DeallocatePage { page, .. } => {
                if !bm.is_allocated(*page)? {
                    return Ok(RedoOutcome::AlreadySatisfied);
                }
                bm.delete_page_immediately(*page)?;
                Ok(RedoOutcome::Applied)
            }
            _ => {
                let mut handle = bm.fix(self.page_id(), LatchMode::Exclusive)?;
                if handle.lsn()? >= lsn {
                    return Ok(RedoOutcome::AlreadySatisfied);
                }
                self.apply(handle.page_mut()?)?;
                handle.set_lsn(lsn)?;
                Ok(RedoOutcome::Applied)
            }
        }
    }

    /// Reverses the operation, logging a compensation record whose
    /// `undo_next` continues the transaction's undo chain.
    pub fn undo(&self, tx: &Tx, lsn: Lsn, undo_next: Lsn) -> Result<()> {
        let bm = tx.buffer_manager();
        match self {
            LogOperation::AllocatePage { page, unit } => {
                if !bm.is_allocated(*page)? {
                    error!(page = %page, lsn, "undo of allocation found the page missing");
                    return Err(StoreError::fatal(*page, "undo of allocation found no page"));
                }
                bm.delete_page(tx, *page, Some(*unit), true, Some(undo_next))
            }
            LogOperation::DeallocatePage { page, .. } => {
                error!(page = %page, lsn, "undo invoked on a deallocation record");
                Err(StoreError::Unsupported("undo of a page deallocation"))
            }
            LogOperation::Record(op) if !op.smo => undo_user_record(tx, op, undo_next),
            _ => {
                let inverse = self.inverse()?;
                let mut handle = bm.fix(inverse.page_id(), LatchMode::Exclusive)?;
                let clr = tx.log_clr(inverse.clone(), undo_next)?;
                inverse.apply(handle.page_mut()?)?;
                handle.set_lsn(clr)
            }
        }
    }

    /// The physical inverse of a page-level change.
    pub fn inverse(&self) -> Result<LogOperation> {
        Ok(match self {
            LogOperation::Format { page, before, after } => LogOperation::Format {
                page: *page,
                before: *after,
                after: *before,
            },
            LogOperation::Record(op) => LogOperation::Record(op.inverse()),
            LogOperation::Pointer {
                kind,
                page,
                root,
                old,
                new,
            } => LogOperation::Pointer {
                kind: *kind,
                page: *page,
                root: *root,
                old: *new,
                new: *old,
            },
            LogOperation::LastInLevel {
                page,
                root,
                old,
                new,
            } => LogOperation::LastInLevel {
                page: *page,
                root: *root,
                old: *new,
                new: *old,
            },
            LogOperation::BlobChunk {
                page,
                unit,
                next,
                data,
                old_next,
                old_data,
            } => LogOperation::BlobChunk {
                page: *page,
                unit: *unit,
                next: *old_next,
                data: old_data.clone(),
                old_next: *next,
                old_data: data.clone(),
            },
            LogOperation::AllocatePage { .. } | LogOperation::DeallocatePage { .. } => {
                return Err(StoreError::Unsupported("operation has no page-level inverse"))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn samples() -> Vec<LogOperation> {
        let page = PageId::new(0, 4);
        let root = PageId::new(0, 1);
        let format = PageFormat::blink(3, PageType::Leaf, root, Field::Int, Field::Bytes, true);
        vec![
            LogOperation::AllocatePage { page, unit: 3 },
            LogOperation::DeallocatePage { page, unit: 3 },
            LogOperation::Format {
                page,
                before: PageFormat::read(&Page::new(page)),
                after: format,
            },
            LogOperation::Record(RecordOp {
                action: RecordAction::Update,
                smo: true,
                page,
                root,
                pos: 7,
                key: vec![1, 2],
                value: vec![3],
                externalized: false,
                old_value: PageId::new(0, 9).to_bytes().to_vec(),
                old_externalized: true,
            }),
            LogOperation::Pointer {
                kind: PointerKind::Low,
                page,
                root,
                old: PageId::NONE,
                new: PageId::new(0, 5),
            },
            LogOperation::LastInLevel {
                page,
                root,
                old: true,
                new: false,
            },
            LogOperation::BlobChunk {
                page,
                unit: 3,
                next: PageId::NONE,
                data: vec![9; 40],
                old_next: PageId::new(0, 12),
                old_data: vec![1; 3],
            },
        ]
    }

    #[test]
    fn size_matches_encoding() {
        for op in samples() {
            let mut buf = BytesMut::new();
            op.encode(&mut buf);
            assert_eq!(buf.len(), op.size(), "{op:?}");
            let mut slice = &buf[..];
            assert_eq!(LogOperation::decode(&mut slice, 8).unwrap(), op);
            assert!(slice.is_empty());
        }
    }

    #[test]
    fn truncated_operation_is_corrupt() {
        let mut buf = BytesMut::new();
        samples()[3].encode(&mut buf);
        let mut slice = &buf[..buf.len() - 1];
        assert!(matches!(
            LogOperation::decode(&mut slice, 8),
            Err(StoreError::CorruptLog { lsn: 8, .. })
        ));
    }

    #[test]
    fn inverse_of_inverse_is_identity() {
        for op in samples().into_iter().skip(2) {
            assert_eq!(op.inverse().unwrap().inverse().unwrap(), op);
        }
        assert!(samples()[0].inverse().is_err());
    }

    #[test]
    fn physical_record_changes_apply_in_place() {
        let mut page = Page::new(PageId::new(0, 4));
        let insert = RecordOp {
            action: RecordAction::Insert,
            smo: true,
            page: page.id,
            root: page.id,
            pos: 0,
            key: b"k".to_vec(),
            value: b"v".to_vec(),
            externalized: false,
            old_value: Vec::new(),
            old_externalized: false,
        };
        insert.apply(&mut page).unwrap();
        assert_eq!(page.value(0).unwrap(), b"v");
        insert.inverse().apply(&mut page).unwrap();
        assert_eq!(page.record_count(), 0);
    }
}
