//! Metadata attached to an index at runtime.
//!
//! The set of things that can be attached is closed, so `Attachments` is a
//! struct with one optional field per kind. The `Attachment` trait maps each
//! kind to its field for the generic `get`/`set`/`check`/`remove` calls.

use std::fmt;

use crate::field::Field;
use crate::page_id::PageId;

/// Shape of an index, estimated by random root-to-leaf probes.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexStatistics {
    pub height: u8,
    pub probes: usize,
    pub avg_fanout: f64,
    pub avg_leaf_entries: f64,
    pub estimated_leaf_pages: u64,
    pub estimated_records: u64,
}

impl fmt::Display for IndexStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "height={} probes={} fanout={:.1} leaf_entries={:.1} ~leaves={} ~records={}",
            self.height,
            self.probes,
            self.avg_fanout,
            self.avg_leaf_entries,
            self.estimated_leaf_pages,
            self.estimated_records
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDescriptor {
    pub name: String,
    pub root: PageId,
    pub key_type: Field,
    pub value_type: Field,
    pub unique: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttachmentKind {
    Descriptor,
    Statistics,
}

pub trait Attachment: Sized {
    const KIND: AttachmentKind;

    fn slot(attachments: &Attachments) -> &Option<Self>;

    fn slot_mut(attachments: &mut Attachments) -> &mut Option<Self>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attachments {
    descriptor: Option<IndexDescriptor>,
    statistics: Option<IndexStatistics>,
}

impl Attachment for IndexDescriptor {
    const KIND: AttachmentKind = AttachmentKind::Descriptor;

    fn slot(attachments: &Attachments) -> &Option<Self> {
        &attachments.descriptor
    }

    fn slot_mut(attachments: &mut Attachments) -> &mut Option<Self> {
        &mut attachments.descriptor
    }
}

impl Attachment for IndexStatistics {
    const KIND: AttachmentKind = AttachmentKind::Statistics;

    fn slot(attachments: &Attachments) -> &Option<Self> {
        &attachments.statistics
    }

    fn slot_mut(attachments: &mut Attachments) -> &mut Option<Self> {
        &mut attachments.statistics
    }
}

impl Attachments {
    pub fn get<T: Attachment>(&self) -> Option<&T> {
        T::slot(self).as_ref()
    }

    /// Attaches `value`, returning what it replaced.
    pub fn set<T: Attachment>(&mut self, value: T) -> Option<T> {
        T::slot_mut(self).replace(value)
    }

    pub fn check<T: Attachment>(&self) -> bool {
        T::slot(self).is_some()
    }

    pub fn remove<T: Attachment>(&mut self) -> Option<T> {
        T::slot_mut(self).take()
    }

    pub fn kinds(&self) -> Vec<AttachmentKind> {
        let mut kinds = Vec::new();
        if self.descriptor.is_some() {
            kinds.push(IndexDescriptor::KIND);
        }
        if self.statistics.is_some() {
            kinds.push(IndexStatistics::KIND);
        }
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(height: u8) -> IndexStatistics {
        IndexStatistics {
            height,
            probes: 4,
            avg_fanout: 10.0,
            avg_leaf_entries: 20.0,
            estimated_leaf_pages: 10,
            estimated_records: 200,
        }
    }

    #[test]
    fn attachments_are_typed_slots() {
        let mut attachments = Attachments::default();
        assert!(!attachments.check::<IndexStatistics>());
        assert!(attachments.kinds().is_empty());

        assert_eq!(attachments.set(stats(1)), None);
        assert_eq!(attachments.set(stats(2)), Some(stats(1)));
        assert_eq!(attachments.get::<IndexStatistics>().map(|s| s.height), Some(2));
        assert!(!attachments.check::<IndexDescriptor>());
        assert_eq!(attachments.kinds(), vec![AttachmentKind::Statistics]);

        assert_eq!(attachments.remove::<IndexStatistics>(), Some(stats(2)));
        assert!(attachments.get::<IndexStatistics>().is_none());
    }

    #[test]
    fn statistics_render_compactly() {
        assert_eq!(
            stats(3).to_string(),
            "height=3 probes=4 fanout=10.0 leaf_entries=20.0 ~leaves=10 ~records=200"
        );
    }
}
