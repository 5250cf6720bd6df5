//! Field types of keys and values. A page records the type of its keys and
//! values, and every comparison on the page goes through that type.

use std::cmp::Ordering;

use crate::dewey::DeweyId;
use crate::error::{Result, StoreError};
use crate::page_id::PageId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Field {
    Null = 0,
    Byte = 1,
    Int = 2,
    Long = 3,
    String = 4,
    PageId = 5,
    DeweyId = 6,
    Bytes = 7,
}

impl Field {
    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn from_id(id: u8) -> Result<Self> {
        Ok(match id {
            0 => Field::Null,
            1 => Field::Byte,
            2 => Field::Int,
            3 => Field::Long,
            4 => Field::String,
            5 => Field::PageId,
            6 => Field::DeweyId,
            7 => Field::Bytes,
            _ => {
                return Err(StoreError::InvalidArgument(format!(
                    "unknown field type {id}"
                )))
            }
        })
    }

    /// Total order over encoded values of this type. Values of the wrong
    /// width fall back to byte order.
    pub fn compare(self, a: &[u8], b: &[u8]) -> Ordering {
        match self {
            Field::Null => Ordering::Equal,
            Field::Int => match (decode_int(a), decode_int(b)) {
                (Some(x), Some(y)) => x.cmp(&y),
                _ => a.cmp(b),
            },
            Field::Long => match (decode_long(a), decode_long(b)) {
                (Some(x), Some(y)) => x.cmp(&y),
                _ => a.cmp(b),
            },
            // Big-endian page ids and dewey ids sort like their values, and
            // UTF-8 byte order is code point order.
            Field::Byte | Field::String | Field::PageId | Field::DeweyId | Field::Bytes => a.cmp(b),
        }
    }

    /// Human-readable rendering for page dumps.
    pub fn display(self, value: &[u8]) -> String {
        match self {
            Field::Null => "null".to_string(),
            Field::Byte if value.len() == 1 => value[0].to_string(),
            Field::Int => decode_int(value).map_or_else(|| hex(value), |v| v.to_string()),
            Field::Long => decode_long(value).map_or_else(|| hex(value), |v| v.to_string()),
            Field::String => String::from_utf8_lossy(value).into_owned(),
            Field::PageId => {
                PageId::from_bytes(value).map_or_else(|_| hex(value), |id| id.to_string())
            }
            Field::DeweyId => {
                DeweyId::from_bytes(value).map_or_else(|_| hex(value), |id| id.to_string())
            }
            Field::Byte | Field::Bytes => hex(value),
        }
    }
}

pub fn encode_int(value: i32) -> [u8; 4] {
    value.to_be_bytes()
}

pub fn encode_long(value: i64) -> [u8; 8] {
    value.to_be_bytes()
}

pub fn decode_int(bytes: &[u8]) -> Option<i32> {
    <[u8; 4]>::try_from(bytes).ok().map(i32::from_be_bytes)
}

pub fn decode_long(bytes: &[u8]) -> Option<i64> {
    <[u8; 8]>::try_from(bytes).ok().map(i64::from_be_bytes)
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_ints_compare_numerically() {
        assert_eq!(
            Field::Int.compare(&encode_int(-5), &encode_int(3)),
            Ordering::Less
        );
        // Byte order would get this one wrong.
        assert!(encode_int(-5).as_slice() > encode_int(3).as_slice());
        assert_eq!(
            Field::Long.compare(&encode_long(7), &encode_long(7)),
            Ordering::Equal
        );
    }

    #[test]
    fn ids_round_trip_and_render() {
        for field in [
            Field::Null,
            Field::Byte,
            Field::Int,
            Field::Long,
            Field::String,
            Field::PageId,
            Field::DeweyId,
            Field::Bytes,
        ] {
            assert_eq!(Field::from_id(field.id()).unwrap(), field);
        }
        assert!(Field::from_id(99).is_err());
        assert_eq!(Field::Int.display(&encode_int(-12)), "-12");
        assert_eq!(Field::Bytes.display(&[0xab, 0x01]), "ab01");
        assert_eq!(Field::PageId.display(&PageId::new(1, 2).to_bytes()), "1:2");
    }
}
