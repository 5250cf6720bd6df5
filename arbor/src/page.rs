//! The layout of a page on disk.
//!
//! Every page starts with a generic header. B-link pages add a reserved
//! region for tree metadata, followed by a slot directory that grows up from
//! `SLOT_BASE` and record bytes that grow down from the end of the page:
//!
//! ```text
//! 0   lsn             u64
//! 8   checksum        u32   crc32 of everything but these four bytes
//! 12  kind            u8
//! 13  reserved        u8
//! 14  record count    u16
//! 16  upper           u16   start of the record area
//! 18  unit            u32   allocation unit
//! 22  base page       6     root of the owning index
//! 28  fragmented      u16   bytes lost to deleted or shrunk records
//! 30  flags           u8    unique, last-in-level, compressed
//! 31  page type       u8
//! 32  key type        u8
//! 33  value type      u8
//! 34  height          u8
//! 35  prev page       6     right sibling in the B-link chain
//! 41  low page        6     leftmost child of an index page
//! 48  slots           8 bytes each: offset u16, key len u16, value len u16, flags u8, pad
//! ```

use std::fmt;
use std::ops::Range;

use crc32fast::Hasher;

use crate::error::{Result, StoreError};
use crate::page_id::PageId;
use crate::{Lsn, PAGE_SIZE};

const LSN: usize = 0;
const CHECKSUM: usize = 8;
const KIND: usize = 12;
const RECORD_COUNT: usize = 14;
const UPPER: usize = 16;
const UNIT: usize = 18;
const BASE_PAGE: usize = 22;
const FRAGMENTED: usize = 28;
pub const HEADER_SIZE: usize = 30;

const FLAGS: usize = 30;
const PAGE_TYPE: usize = 31;
const KEY_TYPE: usize = 32;
const VALUE_TYPE: usize = 33;
const HEIGHT: usize = 34;
const PREV_PAGE: usize = 35;
const LOW_PAGE: usize = 41;

pub const SLOT_BASE: usize = 48;
pub const SLOT_SIZE: usize = 8;

/// Bytes available to slots and records on a B-link page.
pub const USABLE_SPACE: usize = PAGE_SIZE - SLOT_BASE;

pub const FLAG_UNIQUE: u8 = 1;
pub const FLAG_LAST_IN_LEVEL: u8 = 2;
pub const FLAG_COMPRESSED: u8 = 8;

/// Per-slot flag: the stored value is a page id into the overflow store.
pub const SLOT_EXTERNALIZED: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageKind {
    Free = 0,
    Meta = 1,
    Blink = 2,
    Blob = 3,
}

impl PageKind {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(PageKind::Free),
            1 => Some(PageKind::Meta),
            2 => Some(PageKind::Blink),
            3 => Some(PageKind::Blob),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    Leaf = 1,
    Index = 2,
}

impl PageType {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(PageType::Leaf),
            2 => Some(PageType::Index),
            _ => None,
        }
    }
}

/// One entry of the slot directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub offset: u16,
    pub key_len: u16,
    pub value_len: u16,
    pub flags: u8,
}

impl Slot {
    fn record_len(&self) -> usize {
        self.key_len as usize + self.value_len as usize
    }
}

/// A page is a fixed-size block of data that is read from and written to disk.
#[derive(Clone)]
pub struct Page {
    pub id: PageId,
    data: Box<[u8; PAGE_SIZE]>,
}

impl Page {
    pub fn new(id: PageId) -> Self {
        let mut page = Page {
            id,
            data: Box::new([0; PAGE_SIZE]),
        };
        page.set_u16(UPPER, PAGE_SIZE as u16);
        page
    }

    pub fn from_bytes(id: PageId, bytes: &[u8]) -> Result<Self> {
        if bytes.len() != PAGE_SIZE {
            return Err(StoreError::fatal(
                id,
                format!("page image has {} bytes", bytes.len()),
            ));
        }
        let mut data = Box::new([0; PAGE_SIZE]);
        data.copy_from_slice(bytes);
        Ok(Page { id, data })
    }

    pub fn as_bytes(&self) -> &[u8; PAGE_SIZE] {
        &self.data
    }

    pub fn is_zeroed(&self) -> bool {
        self.data.iter().all(|b| *b == 0)
    }

    /// Resets the page to an empty page of the given kind, keeping its LSN.
    pub fn reset(&mut self, kind: PageKind) {
        let lsn = self.lsn();
        self.data.fill(0);
        self.set_lsn(lsn);
        self.set_kind(kind);
        self.set_u16(UPPER, PAGE_SIZE as u16);
    }

    // --- checked access -------------------------------------------------

    fn range(&self, offset: usize, len: usize) -> Result<Range<usize>> {
        match offset.checked_add(len) {
            Some(end) if end <= PAGE_SIZE => Ok(offset..end),
            _ => Err(StoreError::fatal(
                self.id,
                format!("access of {len} bytes at offset {offset} exceeds the page"),
            )),
        }
    }

    pub fn read_bytes(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let range = self.range(offset, len)?;
        Ok(&self.data[range])
    }

    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        let range = self.range(offset, bytes.len())?;
        self.data[range].copy_from_slice(bytes);
        Ok(())
    }

    // Header fields live at fixed offsets well inside the page.

    fn u16_at(&self, offset: usize) -> u16 {
        u16::from_be_bytes([self.data[offset], self.data[offset + 1]])
    }

    fn set_u16(&mut self, offset: usize, value: u16) {
        self.data[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
    }

    fn u32_at(&self, offset: usize) -> u32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.data[offset..offset + 4]);
        u32::from_be_bytes(raw)
    }

    fn set_u32(&mut self, offset: usize, value: u32) {
        self.data[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
    }

    fn page_id_at(&self, offset: usize) -> PageId {
        let mut raw = &self.data[offset..offset + PageId::SIZE];
        PageId::decode(&mut raw)
    }

    fn set_page_id_at(&mut self, offset: usize, id: PageId) {
        self.data[offset..offset + PageId::SIZE].copy_from_slice(&id.to_bytes());
    }

    // --- generic header -------------------------------------------------

    pub fn lsn(&self) -> Lsn {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.data[LSN..LSN + 8]);
        u64::from_be_bytes(raw)
    }

    pub fn set_lsn(&mut self, lsn: Lsn) {
        self.data[LSN..LSN + 8].copy_from_slice(&lsn.to_be_bytes());
    }

    pub fn kind(&self) -> Option<PageKind> {
        PageKind::from_u8(self.data[KIND])
    }

    pub fn set_kind(&mut self, kind: PageKind) {
        self.data[KIND] = kind as u8;
    }

    pub fn record_count(&self) -> usize {
        self.u16_at(RECORD_COUNT) as usize
    }

    fn set_record_count(&mut self, count: usize) {
        self.set_u16(RECORD_COUNT, count as u16);
    }

    fn upper(&self) -> usize {
        self.u16_at(UPPER) as usize
    }

    fn set_upper(&mut self, upper: usize) {
        self.set_u16(UPPER, upper as u16);
    }

    pub fn fragmented(&self) -> usize {
        self.u16_at(FRAGMENTED) as usize
    }

    fn set_fragmented(&mut self, bytes: usize) {
        self.set_u16(FRAGMENTED, bytes as u16);
    }

    pub fn unit(&self) -> u32 {
        self.u32_at(UNIT)
    }

    pub fn set_unit(&mut self, unit: u32) {
        self.set_u32(UNIT, unit);
    }

    pub fn base_page(&self) -> PageId {
        self.page_id_at(BASE_PAGE)
    }

    pub fn set_base_page(&mut self, id: PageId) {
        self.set_page_id_at(BASE_PAGE, id);
    }

    // --- B-link region --------------------------------------------------

    pub fn flags(&self) -> u8 {
        self.data[FLAGS]
    }

    pub fn set_flags(&mut self, flags: u8) {
        self.data[FLAGS] = flags;
    }

    pub fn page_type(&self) -> Option<PageType> {
        PageType::from_u8(self.data[PAGE_TYPE])
    }

    pub fn set_page_type(&mut self, page_type: PageType) {
        self.data[PAGE_TYPE] = page_type as u8;
    }

    pub fn key_type_id(&self) -> u8 {
        self.data[KEY_TYPE]
    }

    pub fn set_key_type_id(&mut self, id: u8) {
        self.data[KEY_TYPE] = id;
    }

    pub fn value_type_id(&self) -> u8 {
        self.data[VALUE_TYPE]
    }

    pub fn set_value_type_id(&mut self, id: u8) {
        self.data[VALUE_TYPE] = id;
    }

    pub fn height(&self) -> u8 {
        self.data[HEIGHT]
    }

    pub fn set_height(&mut self, height: u8) {
        self.data[HEIGHT] = height;
    }

    pub fn prev_page(&self) -> PageId {
        self.page_id_at(PREV_PAGE)
    }

    pub fn set_prev_page(&mut self, id: PageId) {
        self.set_page_id_at(PREV_PAGE, id);
    }

    pub fn low_page(&self) -> PageId {
        self.page_id_at(LOW_PAGE)
    }

    pub fn set_low_page(&mut self, id: PageId) {
        self.set_page_id_at(LOW_PAGE, id);
    }

    // --- checksum -------------------------------------------------------

    pub fn compute_checksum(bytes: &[u8; PAGE_SIZE]) -> u32 {
        let mut hasher = Hasher::new();
        hasher.update(&bytes[..CHECKSUM]);
        hasher.update(&bytes[CHECKSUM + 4..]);
        hasher.finalize()
    }

    pub fn stored_checksum(bytes: &[u8; PAGE_SIZE]) -> u32 {
        u32::from_be_bytes([
            bytes[CHECKSUM],
            bytes[CHECKSUM + 1],
            bytes[CHECKSUM + 2],
            bytes[CHECKSUM + 3],
        ])
    }

    pub fn stamp_checksum(bytes: &mut [u8; PAGE_SIZE]) {
        let crc = Self::compute_checksum(bytes);
        bytes[CHECKSUM..CHECKSUM + 4].copy_from_slice(&crc.to_be_bytes());
    }

    // --- slot directory -------------------------------------------------

    fn slot_offset(pos: usize) -> usize {
        SLOT_BASE + pos * SLOT_SIZE
    }

    fn slots_end(&self) -> usize {
        Self::slot_offset(self.record_count())
    }

    pub fn slot(&self, pos: usize) -> Result<Slot> {
        if pos >= self.record_count() {
            return Err(StoreError::fatal(
                self.id,
                format!("slot {pos} out of range ({} records)", self.record_count()),
            ));
        }
        let raw = self.read_bytes(Self::slot_offset(pos), SLOT_SIZE)?;
        let slot = Slot {
            offset: u16::from_be_bytes([raw[0], raw[1]]),
            key_len: u16::from_be_bytes([raw[2], raw[3]]),
            value_len: u16::from_be_bytes([raw[4], raw[5]]),
            flags: raw[6],
        };
        self.range(slot.offset as usize, slot.record_len())?;
        Ok(slot)
    }

    fn write_slot(&mut self, pos: usize, slot: Slot) -> Result<()> {
        let mut raw = [0u8; SLOT_SIZE];
        raw[0..2].copy_from_slice(&slot.offset.to_be_bytes());
        raw[2..4].copy_from_slice(&slot.key_len.to_be_bytes());
        raw[4..6].copy_from_slice(&slot.value_len.to_be_bytes());
        raw[6] = slot.flags;
        self.write_bytes(Self::slot_offset(pos), &raw)
    }

    pub fn key(&self, pos: usize) -> Result<&[u8]> {
        let slot = self.slot(pos)?;
        self.read_bytes(slot.offset as usize, slot.key_len as usize)
    }

    pub fn value(&self, pos: usize) -> Result<&[u8]> {
        let slot = self.slot(pos)?;
        self.read_bytes(
            slot.offset as usize + slot.key_len as usize,
            slot.value_len as usize,
        )
    }

    pub fn slot_flags(&self, pos: usize) -> Result<u8> {
        Ok(self.slot(pos)?.flags)
    }

    pub fn set_slot_flags(&mut self, pos: usize, flags: u8) -> Result<()> {
        let mut slot = self.slot(pos)?;
        slot.flags = flags;
        self.write_slot(pos, slot)
    }

    /// Space a new record may use, counting fragmented bytes that a
    /// compaction would reclaim.
    pub fn free_space(&self) -> usize {
        self.contiguous_free() + self.fragmented()
    }

    fn contiguous_free(&self) -> usize {
        self.upper().saturating_sub(self.slots_end())
    }

    pub fn fits(&self, key_len: usize, value_len: usize) -> bool {
        self.free_space() >= key_len + value_len + SLOT_SIZE
    }

    /// Inserts a record at `pos`, shifting later slots. Returns false and
    /// leaves the page untouched when the record does not fit.
    pub fn insert_record(&mut self, pos: usize, key: &[u8], value: &[u8], flags: u8) -> Result<bool> {
        let count = self.record_count();
        if pos > count {
            return Err(StoreError::fatal(
                self.id,
                format!("insert position {pos} beyond {count} records"),
            ));
        }
        let len = key.len() + value.len();
        if u16::try_from(key.len()).is_err() || u16::try_from(value.len()).is_err() {
            return Ok(false);
        }
        if !self.fits(key.len(), value.len()) {
            return Ok(false);
        }
        if self.contiguous_free() < len + SLOT_SIZE {
            self.compact()?;
        }

        let offset = self.upper() - len;
        self.write_bytes(offset, key)?;
        self.write_bytes(offset + key.len(), value)?;
        self.set_upper(offset);

        let from = Self::slot_offset(pos);
        let to = Self::slot_offset(count);
        self.data.copy_within(from..to, from + SLOT_SIZE);
        self.set_record_count(count + 1);
        self.write_slot(
            pos,
            Slot {
                offset: offset as u16,
                key_len: key.len() as u16,
                value_len: value.len() as u16,
                flags,
            },
        )?;
        Ok(true)
    }

    pub fn remove_record(&mut self, pos: usize) -> Result<()> {
        let slot = self.slot(pos)?;
        let count = self.record_count();
        let from = Self::slot_offset(pos + 1);
        let to = Self::slot_offset(count);
        self.data.copy_within(from..to, Self::slot_offset(pos));
        self.set_record_count(count - 1);
        if count == 1 {
            self.set_upper(PAGE_SIZE);
            self.set_fragmented(0);
        } else {
            self.set_fragmented(self.fragmented() + slot.record_len());
        }
        Ok(())
    }

    /// Replaces the value of the record at `pos`. Returns false and leaves
    /// the page untouched when the new value does not fit.
    pub fn replace_value(&mut self, pos: usize, value: &[u8], flags: u8) -> Result<bool> {
        let mut slot = self.slot(pos)?;
        if u16::try_from(value.len()).is_err() {
            return Ok(false);
        }
        if value.len() <= slot.value_len as usize {
            self.write_bytes(slot.offset as usize + slot.key_len as usize, value)?;
            self.set_fragmented(self.fragmented() + slot.value_len as usize - value.len());
            slot.value_len = value.len() as u16;
            slot.flags = flags;
            return self.write_slot(pos, slot).map(|_| true);
        }

        let needed = slot.key_len as usize + value.len();
        if self.free_space() + slot.record_len() < needed {
            return Ok(false);
        }
        let key = self.key(pos)?.to_vec();
        self.set_fragmented(self.fragmented() + slot.record_len());
        self.write_slot(
            pos,
            Slot {
                offset: PAGE_SIZE as u16,
                key_len: 0,
                value_len: 0,
                flags: slot.flags,
            },
        )?;
        if self.contiguous_free() < needed {
            self.compact()?;
        }
        let offset = self.upper() - needed;
        self.write_bytes(offset, &key)?;
        self.write_bytes(offset + key.len(), value)?;
        self.set_upper(offset);
        self.write_slot(
            pos,
            Slot {
                offset: offset as u16,
                key_len: key.len() as u16,
                value_len: value.len() as u16,
                flags,
            },
        )?;
        Ok(true)
    }

    /// Rewrites the record area so that all free space is contiguous.
    pub fn compact(&mut self) -> Result<()> {
        let count = self.record_count();
        let mut records = Vec::with_capacity(count);
        for pos in 0..count {
            let slot = self.slot(pos)?;
            let bytes = self.read_bytes(slot.offset as usize, slot.record_len())?.to_vec();
            records.push((slot, bytes));
        }
        let mut upper = PAGE_SIZE;
        for (pos, (mut slot, bytes)) in records.into_iter().enumerate() {
            upper -= bytes.len();
            self.write_bytes(upper, &bytes)?;
            slot.offset = upper as u16;
            self.write_slot(pos, slot)?;
        }
        self.set_upper(upper);
        self.set_fragmented(0);
        Ok(())
    }

    pub fn clear_records(&mut self) {
        self.set_record_count(0);
        self.set_upper(PAGE_SIZE);
        self.set_fragmented(0);
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("id", &self.id)
            .field("kind", &self.kind())
            .field("lsn", &self.lsn())
            .field("records", &self.record_count())
            .finish()
    }
}
