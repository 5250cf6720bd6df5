//! Page addressing: a container number plus a page number.

use std::fmt;

use bytes::{Buf, BufMut};

use crate::error::{Result, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId {
    container: u16,
    number: u32,
}

impl PageId {
    /// The "no page" sentinel. Encodes as all ones.
    pub const NONE: PageId = PageId {
        container: u16::MAX,
        number: u32::MAX,
    };

    pub const SIZE: usize = 6;

    pub const fn new(container: u16, number: u32) -> Self {
        Self { container, number }
    }

    pub fn container(&self) -> u16 {
        self.container
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn is_none(&self) -> bool {
        *self == Self::NONE
    }

    pub fn is_some(&self) -> bool {
        !self.is_none()
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[..2].copy_from_slice(&self.container.to_be_bytes());
        out[2..].copy_from_slice(&self.number.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::SIZE {
            return Err(StoreError::InvalidArgument(format!(
                "page id needs {} bytes, got {}",
                Self::SIZE,
                bytes.len()
            )));
        }
        let mut buf = bytes;
        Ok(Self::decode(&mut buf))
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.container);
        buf.put_u32(self.number);
    }

    /// Callers check `buf.remaining() >= PageId::SIZE` first.
    pub fn decode(buf: &mut impl Buf) -> Self {
        let container = buf.get_u16();
        let number = buf.get_u32();
        Self { container, number }
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "none")
        } else {
            write!(f, "{}:{}", self.container, self.number)
        }
    }
}
