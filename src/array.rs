//! Typed column vectors.
//!
//! [`ArrayImpl`] is the in-memory representation of one column: a tagged
//! variant of plain vectors, with arrays stored as cumulative offsets over a
//! boxed nested array (recursing for arrays of arrays).

use crate::types::{DataType, DataValue, F64};

#[derive(Debug, Clone, PartialEq)]
pub enum ArrayImpl {
    Int8(Vec<i8>),
    Int16(Vec<i16>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    UInt16(Vec<u16>),
    UInt32(Vec<u32>),
    UInt64(Vec<u64>),
    Float64(Vec<F64>),
    String(Vec<String>),
    List(ListArray),
}

/// Array-valued column: `offsets[i]` is the cumulative element count through
/// row `i`; `values` holds the flattened elements.
#[derive(Debug, Clone, PartialEq)]
pub struct ListArray {
    pub elem_type: DataType,
    pub offsets: Vec<u64>,
    pub values: Box<ArrayImpl>,
}

/// Dispatches an expression over every scalar variant of [`ArrayImpl`].
macro_rules! for_all_scalar {
    ($self:expr, $data:ident, $body:expr) => {
        match $self {
            ArrayImpl::Int8($data) => $body,
            ArrayImpl::Int16($data) => $body,
            ArrayImpl::Int32($data) => $body,
            ArrayImpl::Int64($data) => $body,
            ArrayImpl::UInt16($data) => $body,
            ArrayImpl::UInt32($data) => $body,
            ArrayImpl::UInt64($data) => $body,
            ArrayImpl::Float64($data) => $body,
            ArrayImpl::String($data) => $body,
            ArrayImpl::List(_) => unreachable!("list handled by caller"),
        }
    };
}

impl ArrayImpl {
    pub fn new(datatype: &DataType) -> Self {
        match datatype {
            DataType::Int8 => Self::Int8(vec![]),
            DataType::Int16 => Self::Int16(vec![]),
            DataType::Int32 => Self::Int32(vec![]),
            DataType::Int64 => Self::Int64(vec![]),
            DataType::UInt16 => Self::UInt16(vec![]),
            DataType::UInt32 => Self::UInt32(vec![]),
            DataType::UInt64 => Self::UInt64(vec![]),
            DataType::Float64 => Self::Float64(vec![]),
            DataType::String => Self::String(vec![]),
            DataType::Array(nested) => Self::List(ListArray {
                elem_type: (**nested).clone(),
                offsets: vec![],
                values: Box::new(Self::new(nested)),
            }),
        }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            Self::Int8(_) => DataType::Int8,
            Self::Int16(_) => DataType::Int16,
            Self::Int32(_) => DataType::Int32,
            Self::Int64(_) => DataType::Int64,
            Self::UInt16(_) => DataType::UInt16,
            Self::UInt32(_) => DataType::UInt32,
            Self::UInt64(_) => DataType::UInt64,
            Self::Float64(_) => DataType::Float64,
            Self::String(_) => DataType::String,
            Self::List(list) => DataType::Array(Box::new(list.elem_type.clone())),
        }
    }

    pub fn len(&self) -> usize {
        if let Self::List(list) = self {
            return list.offsets.len();
        }
        for_all_scalar!(self, data, data.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, idx: usize) -> DataValue {
        match self {
            Self::Int8(data) => DataValue::Int8(data[idx]),
            Self::Int16(data) => DataValue::Int16(data[idx]),
            Self::Int32(data) => DataValue::Int32(data[idx]),
            Self::Int64(data) => DataValue::Int64(data[idx]),
            Self::UInt16(data) => DataValue::UInt16(data[idx]),
            Self::UInt32(data) => DataValue::UInt32(data[idx]),
            Self::UInt64(data) => DataValue::UInt64(data[idx]),
            Self::Float64(data) => DataValue::Float64(data[idx]),
            Self::String(data) => DataValue::String(data[idx].clone()),
            Self::List(list) => {
                let begin = if idx == 0 { 0 } else { list.offsets[idx - 1] } as usize;
                let end = list.offsets[idx] as usize;
                DataValue::Array((begin..end).map(|i| list.values.get(i)).collect())
            }
        }
    }

    /// Appends one value. Panics if the value kind does not match the array.
    pub fn push(&mut self, value: DataValue) {
        match (self, value) {
            (Self::Int8(data), DataValue::Int8(v)) => data.push(v),
            (Self::Int16(data), DataValue::Int16(v)) => data.push(v),
            (Self::Int32(data), DataValue::Int32(v)) => data.push(v),
            (Self::Int64(data), DataValue::Int64(v)) => data.push(v),
            (Self::UInt16(data), DataValue::UInt16(v)) => data.push(v),
            (Self::UInt32(data), DataValue::UInt32(v)) => data.push(v),
            (Self::UInt64(data), DataValue::UInt64(v)) => data.push(v),
            (Self::Float64(data), DataValue::Float64(v)) => data.push(v),
            (Self::String(data), DataValue::String(v)) => data.push(v),
            (Self::List(list), DataValue::Array(vs)) => {
                for v in vs {
                    list.values.push(v);
                }
                list.offsets.push(list.values.len() as u64);
            }
            (array, v) => panic!("value {v:?} does not match array {:?}", array.data_type()),
        }
    }

    /// A new array holding `self[perm[0]], self[perm[1]], ...`.
    pub fn take(&self, perm: &[usize]) -> Self {
        if let Self::List(_) = self {
            let mut out = Self::new(&self.data_type());
            for &i in perm {
                out.push(self.get(i));
            }
            return out;
        }
        for_all_scalar!(self, data, {
            Self::from_vec(perm.iter().map(|&i| data[i].clone()).collect())
        })
    }

    fn from_vec<T>(data: Vec<T>) -> Self
    where
        Vec<T>: Into<ArrayImpl>,
    {
        data.into()
    }
}

macro_rules! impl_from_vec {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<Vec<$ty>> for ArrayImpl {
                fn from(data: Vec<$ty>) -> Self {
                    ArrayImpl::$variant(data)
                }
            }
        )*
    };
}

impl_from_vec! {
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    u16 => UInt16,
    u32 => UInt32,
    u64 => UInt64,
    F64 => Float64,
    String => String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_push_get_take() {
        let mut a = ArrayImpl::new(&DataType::Int32);
        for v in [3, 1, 2] {
            a.push(DataValue::Int32(v));
        }
        assert_eq!(a.len(), 3);
        assert_eq!(a.get(1), DataValue::Int32(1));
        let taken = a.take(&[1, 2, 0]);
        assert_eq!(
            (0..3).map(|i| taken.get(i)).collect::<Vec<_>>(),
            vec![
                DataValue::Int32(1),
                DataValue::Int32(2),
                DataValue::Int32(3)
            ]
        );
    }

    #[test]
    fn test_list_roundtrip() {
        let ty = DataType::Array(Box::new(DataType::Int64));
        let mut a = ArrayImpl::new(&ty);
        let rows = vec![
            DataValue::Array(vec![DataValue::Int64(1), DataValue::Int64(2)]),
            DataValue::Array(vec![]),
            DataValue::Array(vec![DataValue::Int64(3)]),
        ];
        for row in &rows {
            a.push(row.clone());
        }
        assert_eq!(a.len(), 3);
        for (i, row) in rows.iter().enumerate() {
            assert_eq!(&a.get(i), row);
        }
        let taken = a.take(&[2, 0]);
        assert_eq!(taken.get(0), rows[2]);
        assert_eq!(taken.get(1), rows[0]);
    }

    #[test]
    fn test_nested_list() {
        let ty = DataType::Array(Box::new(DataType::Array(Box::new(DataType::Int32))));
        let mut a = ArrayImpl::new(&ty);
        let row = DataValue::Array(vec![
            DataValue::Array(vec![DataValue::Int32(1)]),
            DataValue::Array(vec![DataValue::Int32(2), DataValue::Int32(3)]),
        ]);
        a.push(row.clone());
        assert_eq!(a.get(0), row);
    }
}
