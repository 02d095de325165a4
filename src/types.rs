//! Tagged-variant type system.
//!
//! The engine dispatches on concrete type tags at the storage boundary
//! instead of going through trait objects. [`DataType`] describes a column,
//! [`DataValue`] carries one value of any kind.

use bytes::{Buf, BufMut};
pub use ordered_float::OrderedFloat;

use crate::compress::CompressedReader;
use crate::error::{StorageResult, TracedStorageError};

/// A wrapper around `f64` providing `Eq` and `Ord`.
pub type F64 = OrderedFloat<f64>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataType {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt16,
    UInt32,
    UInt64,
    Float64,
    String,
    Array(Box<DataType>),
}

/// One value of any [`DataType`].
///
/// Values of the same kind compare by value; the derived cross-kind order is
/// only ever exercised by accident and never by well-typed key tuples.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum DataValue {
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float64(F64),
    String(String),
    Array(Vec<DataValue>),
}

/// A key tuple: the values of the sort-key columns at one row.
pub type Row = Vec<DataValue>;

impl DataType {
    /// The value a missing column materializes as.
    pub fn default_value(&self) -> DataValue {
        match self {
            Self::Int8 => DataValue::Int8(0),
            Self::Int16 => DataValue::Int16(0),
            Self::Int32 => DataValue::Int32(0),
            Self::Int64 => DataValue::Int64(0),
            Self::UInt16 => DataValue::UInt16(0),
            Self::UInt32 => DataValue::UInt32(0),
            Self::UInt64 => DataValue::UInt64(0),
            Self::Float64 => DataValue::Float64(F64::from(0.0)),
            Self::String => DataValue::String(String::new()),
            Self::Array(_) => DataValue::Array(vec![]),
        }
    }

    pub fn nested_type(&self) -> Option<&DataType> {
        match self {
            Self::Array(inner) => Some(inner),
            _ => None,
        }
    }

    /// Appends the binary encoding of `value` to `buf`. Fixed-width numerics
    /// are little-endian; strings are length-prefixed.
    pub fn serialize_value(&self, value: &DataValue, buf: &mut Vec<u8>) {
        match (self, value) {
            (Self::Int8, DataValue::Int8(v)) => buf.put_i8(*v),
            (Self::Int16, DataValue::Int16(v)) => buf.put_i16_le(*v),
            (Self::Int32, DataValue::Int32(v)) => buf.put_i32_le(*v),
            (Self::Int64, DataValue::Int64(v)) => buf.put_i64_le(*v),
            (Self::UInt16, DataValue::UInt16(v)) => buf.put_u16_le(*v),
            (Self::UInt32, DataValue::UInt32(v)) => buf.put_u32_le(*v),
            (Self::UInt64, DataValue::UInt64(v)) => buf.put_u64_le(*v),
            (Self::Float64, DataValue::Float64(v)) => buf.put_f64_le(v.into_inner()),
            (Self::String, DataValue::String(v)) => {
                buf.put_u32_le(v.len() as u32);
                buf.put_slice(v.as_bytes());
            }
            (Self::Array(nested), DataValue::Array(vs)) => {
                buf.put_u64_le(vs.len() as u64);
                for v in vs {
                    nested.serialize_value(v, buf);
                }
            }
            (ty, v) => panic!("value {v:?} does not match type {ty:?}"),
        }
    }

    /// Decodes one value from an in-memory buffer (the primary index scan).
    pub fn deserialize_value(&self, buf: &mut &[u8]) -> StorageResult<DataValue> {
        macro_rules! need {
            ($n:expr) => {
                if buf.remaining() < $n {
                    return Err(TracedStorageError::decode("unexpected end of index"));
                }
            };
        }
        Ok(match self {
            Self::Int8 => {
                need!(1);
                DataValue::Int8(buf.get_i8())
            }
            Self::Int16 => {
                need!(2);
                DataValue::Int16(buf.get_i16_le())
            }
            Self::Int32 => {
                need!(4);
                DataValue::Int32(buf.get_i32_le())
            }
            Self::Int64 => {
                need!(8);
                DataValue::Int64(buf.get_i64_le())
            }
            Self::UInt16 => {
                need!(2);
                DataValue::UInt16(buf.get_u16_le())
            }
            Self::UInt32 => {
                need!(4);
                DataValue::UInt32(buf.get_u32_le())
            }
            Self::UInt64 => {
                need!(8);
                DataValue::UInt64(buf.get_u64_le())
            }
            Self::Float64 => {
                need!(8);
                DataValue::Float64(F64::from(buf.get_f64_le()))
            }
            Self::String => {
                need!(4);
                let len = buf.get_u32_le() as usize;
                need!(len);
                let bytes = buf.copy_to_bytes(len);
                DataValue::String(
                    String::from_utf8(bytes.to_vec())
                        .map_err(|e| TracedStorageError::decode(e))?,
                )
            }
            Self::Array(nested) => {
                need!(8);
                let len = buf.get_u64_le() as usize;
                let mut vs = Vec::with_capacity(len);
                for _ in 0..len {
                    vs.push(nested.deserialize_value(buf)?);
                }
                DataValue::Array(vs)
            }
        })
    }

    /// Decodes one scalar value from a compressed column stream. Array
    /// values never appear here: arrays are stored as separate size and
    /// value streams.
    pub fn read_value(&self, reader: &mut CompressedReader) -> StorageResult<DataValue> {
        let mut scratch = [0u8; 8];
        Ok(match self {
            Self::Int8 => {
                reader.read_exact(&mut scratch[..1])?;
                DataValue::Int8(scratch[0] as i8)
            }
            Self::Int16 => {
                reader.read_exact(&mut scratch[..2])?;
                DataValue::Int16(i16::from_le_bytes(scratch[..2].try_into().unwrap()))
            }
            Self::Int32 => {
                reader.read_exact(&mut scratch[..4])?;
                DataValue::Int32(i32::from_le_bytes(scratch[..4].try_into().unwrap()))
            }
            Self::Int64 => {
                reader.read_exact(&mut scratch)?;
                DataValue::Int64(i64::from_le_bytes(scratch))
            }
            Self::UInt16 => {
                reader.read_exact(&mut scratch[..2])?;
                DataValue::UInt16(u16::from_le_bytes(scratch[..2].try_into().unwrap()))
            }
            Self::UInt32 => {
                reader.read_exact(&mut scratch[..4])?;
                DataValue::UInt32(u32::from_le_bytes(scratch[..4].try_into().unwrap()))
            }
            Self::UInt64 => {
                reader.read_exact(&mut scratch)?;
                DataValue::UInt64(u64::from_le_bytes(scratch))
            }
            Self::Float64 => {
                reader.read_exact(&mut scratch)?;
                DataValue::Float64(F64::from(f64::from_le_bytes(scratch)))
            }
            Self::String => {
                reader.read_exact(&mut scratch[..4])?;
                let len = u32::from_le_bytes(scratch[..4].try_into().unwrap()) as usize;
                let mut bytes = vec![0u8; len];
                reader.read_exact(&mut bytes)?;
                DataValue::String(
                    String::from_utf8(bytes).map_err(|e| TracedStorageError::decode(e))?,
                )
            }
            Self::Array(_) => {
                return Err(TracedStorageError::logical(
                    "array values are not stored inline",
                ))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_roundtrip_via_buf() {
        let cases = [
            (DataType::Int32, DataValue::Int32(-42)),
            (DataType::UInt16, DataValue::UInt16(19723)),
            (DataType::Float64, DataValue::Float64(F64::from(2.5))),
            (DataType::String, DataValue::String("hello".into())),
            (
                DataType::Array(Box::new(DataType::Int64)),
                DataValue::Array(vec![DataValue::Int64(1), DataValue::Int64(2)]),
            ),
        ];
        for (ty, value) in cases {
            let mut buf = vec![];
            ty.serialize_value(&value, &mut buf);
            let mut slice = &buf[..];
            assert_eq!(ty.deserialize_value(&mut slice).unwrap(), value);
            assert!(slice.is_empty());
        }
    }

    #[test]
    fn test_value_ordering() {
        assert!(DataValue::Int32(1) < DataValue::Int32(2));
        assert!(DataValue::Float64(F64::from(1.5)) < DataValue::Float64(F64::from(2.0)));
        assert!(DataValue::String("a".into()) < DataValue::String("b".into()));
    }
}
