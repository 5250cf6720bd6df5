//! Dewey-style structural node labels.
//!
//! A label is a document number followed by one division per tree level.
//! The document node has no divisions. Division 1 below any element is
//! reserved for its attribute root; children use divisions from 2 upward.
//! The byte encoding is a sequence of big-endian u32 values, so plain byte
//! comparison yields document order.

use std::fmt;
use std::str::FromStr;

use crate::error::{Result, StoreError};

pub const ATTRIBUTE_ROOT_DIVISION: u32 = 1;
pub const FIRST_CHILD_DIVISION: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeweyId {
    doc: u32,
    divisions: Vec<u32>,
}

impl DeweyId {
    pub fn document(doc: u32) -> Self {
        Self {
            doc,
            divisions: Vec::new(),
        }
    }

    pub fn new(doc: u32, divisions: Vec<u32>) -> Self {
        Self { doc, divisions }
    }

    pub fn doc(&self) -> u32 {
        self.doc
    }

    pub fn divisions(&self) -> &[u32] {
        &self.divisions
    }

    pub fn level(&self) -> usize {
        self.divisions.len()
    }

    pub fn is_document(&self) -> bool {
        self.divisions.is_empty()
    }

    pub fn child(&self, division: u32) -> Self {
        let mut divisions = self.divisions.clone();
        divisions.push(division);
        Self {
            doc: self.doc,
            divisions,
        }
    }

    pub fn attribute_root(&self) -> Self {
        self.child(ATTRIBUTE_ROOT_DIVISION)
    }

    pub fn is_attribute_root(&self) -> bool {
        self.divisions.last() == Some(&ATTRIBUTE_ROOT_DIVISION)
    }

    pub fn parent(&self) -> Option<Self> {
        if self.divisions.is_empty() {
            return None;
        }
        Some(Self {
            doc: self.doc,
            divisions: self.divisions[..self.divisions.len() - 1].to_vec(),
        })
    }

    pub fn is_ancestor_of(&self, other: &DeweyId) -> bool {
        self.doc == other.doc
            && self.divisions.len() < other.divisions.len()
            && other.divisions.starts_with(&self.divisions)
    }

    pub fn is_child_of(&self, parent: &DeweyId) -> bool {
        parent.is_ancestor_of(self) && self.level() == parent.level() + 1
    }

    /// Smallest label that can belong to a non-attribute child.
    pub fn first_child_bound(&self) -> Self {
        self.child(FIRST_CHILD_DIVISION)
    }

    /// Smallest label ordered after this node and its whole subtree.
    pub fn next_sibling_bound(&self) -> Self {
        let mut bound = self.clone();
        match bound.divisions.last_mut() {
            Some(last) => *last = last.saturating_add(1),
            None => bound.doc = bound.doc.saturating_add(1),
        }
        bound
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 * (1 + self.divisions.len()));
        out.extend_from_slice(&self.doc.to_be_bytes());
        for division in &self.divisions {
            out.extend_from_slice(&division.to_be_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 || bytes.len() % 4 != 0 {
            return Err(StoreError::InvalidArgument(format!(
                "dewey id encoding of {} bytes",
                bytes.len()
            )));
        }
        let mut words = bytes
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]));
        let doc = words.next().unwrap_or_default();
        Ok(Self {
            doc,
            divisions: words.collect(),
        })
    }
}

impl fmt::Display for DeweyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.doc)?;
        for division in &self.divisions {
            write!(f, ".{division}")?;
        }
        Ok(())
    }
}

impl FromStr for DeweyId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split('.').map(|p| {
            p.parse::<u32>()
                .map_err(|_| StoreError::InvalidArgument(format!("bad dewey id '{s}'")))
        });
        let doc = parts
            .next()
            .ok_or_else(|| StoreError::InvalidArgument("empty dewey id".to_string()))??;
        Ok(Self {
            doc,
            divisions: parts.collect::<Result<Vec<_>>>()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> DeweyId {
        s.parse().unwrap()
    }

    #[test]
    fn byte_order_is_document_order() {
        let ordered = ["1", "1.1", "1.1.3", "1.2", "1.2.2", "1.2.2.7", "1.3", "1.300", "2"];
        for pair in ordered.windows(2) {
            let (a, b) = (id(pair[0]), id(pair[1]));
            assert!(a < b, "{a} < {b}");
            assert!(a.to_bytes() < b.to_bytes(), "{a} < {b} as bytes");
        }
    }

    #[test]
    fn relationships() {
        let node = id("4.2.5");
        assert_eq!(node.parent(), Some(id("4.2")));
        assert!(id("4.2").is_ancestor_of(&id("4.2.5.3")));
        assert!(!id("4.2").is_ancestor_of(&id("4.3.5")));
        assert!(node.is_child_of(&id("4.2")));
        assert!(!id("4.2.5.3").is_child_of(&id("4.2")));
        assert!(node.attribute_root().is_attribute_root());
        assert_eq!(node.first_child_bound(), id("4.2.5.2"));
        assert_eq!(node.next_sibling_bound(), id("4.2.6"));
        assert!(node.next_sibling_bound() > id("4.2.5.99.1"));
        assert_eq!(DeweyId::document(4).parent(), None);
    }

    #[test]
    fn parse_and_encode() {
        let node = id("7.2.10");
        assert_eq!(node.to_string(), "7.2.10");
        assert_eq!(DeweyId::from_bytes(&node.to_bytes()).unwrap(), node);
        assert!("7..2".parse::<DeweyId>().is_err());
        assert!(DeweyId::from_bytes(&[1, 2, 3]).is_err());
    }
}
