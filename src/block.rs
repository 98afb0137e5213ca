use std::sync::Arc;

use half::f16;
use itertools::Itertools;

use crate::{
    num::{DataType, Scalar, dispatch},
    runtime::KernelError,
    shape::{Coords, Shape},
};

/// Typed, shared storage of a [`Block`].
#[derive(Debug, Clone, PartialEq)]
pub enum Buffer {
    Bool(Arc<[bool]>),
    I32(Arc<[i32]>),
    I64(Arc<[i64]>),
    F16(Arc<[f16]>),
    F32(Arc<[f32]>),
    F64(Arc<[f64]>),
}

impl Buffer {
    pub fn data_type(&self) -> DataType {
        match self {
            Buffer::Bool(_) => DataType::Bool,
            Buffer::I32(_) => DataType::I32,
            Buffer::I64(_) => DataType::I64,
            Buffer::F16(_) => DataType::F16,
            Buffer::F32(_) => DataType::F32,
            Buffer::F64(_) => DataType::F64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Buffer::Bool(data) => data.len(),
            Buffer::I32(data) => data.len(),
            Buffer::I64(data) => data.len(),
            Buffer::F16(data) => data.len(),
            Buffer::F32(data) => data.len(),
            Buffer::F64(data) => data.len(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A dense, local, row-major n-d value. The unit of data every kernel consumes and produces.
///
/// Cloning a block and [reshaping](Block::reshape) it share the underlying buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    shape: Shape,
    data: Buffer,
}

impl Block {
    pub fn new(shape: impl Into<Shape>, data: Buffer) -> Result<Self, KernelError> {
        let shape = shape.into();
        if shape.size() != data.len() {
            return Err(KernelError::Size(shape.size(), data.len()));
        }
        Ok(Self { shape, data })
    }

    #[inline]
    pub fn from_vec<T: Scalar>(shape: impl Into<Shape>, data: Vec<T>) -> Result<Self, KernelError> {
        Self::new(shape, T::into_buffer(data.into()))
    }

    /// A 0-d block holding `value`.
    #[inline]
    pub fn scalar<T: Scalar>(value: T) -> Self {
        let data = T::into_buffer([value].into());
        Self {
            shape: Shape::default(),
            data,
        }
    }

    pub fn full<T: Scalar>(shape: impl Into<Shape>, value: T) -> Self {
        let shape = shape.into();
        let data = T::into_buffer(vec![value; shape.size()].into());
        Self { shape, data }
    }

    /// A block of type `r#type` filled with `value` converted into it.
    pub fn full_as(shape: impl Into<Shape>, r#type: DataType, value: f64) -> Self {
        dispatch!(r#type, T => Self::full(shape, T::from_f64(value)))
    }

    #[inline]
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    #[inline]
    pub fn data_type(&self) -> DataType {
        self.data.data_type()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn buffer(&self) -> &Buffer {
        &self.data
    }

    /// Borrows the elements. Fails if `T` is not the block's type.
    #[inline]
    pub fn read<T: Scalar>(&self) -> Result<&[T], KernelError> {
        match T::from_buffer(&self.data) {
            Some(data) => Ok(data),
            None => Err(KernelError::Type(T::DATA_TYPE, self.data_type())),
        }
    }

    /// Copies the elements out, converting them into `T`.
    pub fn to_vec<T: Scalar>(&self) -> Vec<T> {
        dispatch!(self.data_type(), U => match U::from_buffer(&self.data) {
            Some(data) => data.iter().map(|&x| x.cast::<T>()).collect(),
            None => unreachable!(),
        })
    }

    /// Converts the block into another type. Shares the buffer if the type is unchanged.
    pub fn cast(&self, r#type: DataType) -> Block {
        if r#type == self.data_type() {
            return self.clone();
        }
        let data = dispatch!(r#type, T => T::into_buffer(self.to_vec::<T>().into()));
        Block {
            shape: self.shape.clone(),
            data,
        }
    }

    /// Reinterprets the block under a new shape of equal size.
    pub fn reshape(&self, shape: impl Into<Shape>) -> Result<Block, KernelError> {
        let shape = shape.into();
        if shape.size() != self.shape.size() {
            return Err(KernelError::Shape(self.shape.clone(), shape));
        }
        let data = self.data.clone();
        Ok(Block { shape, data })
    }

    /// Native-endian bytes of the elements.
    pub fn to_bytes(&self) -> Vec<u8> {
        dispatch!(self.data_type(), T => match T::from_buffer(&self.data) {
            Some(data) => bytemuck::cast_slice::<T, u8>(data).to_vec(),
            None => unreachable!(),
        })
    }

    /// Reads a block of type `r#type` from native-endian `bytes`.
    pub fn from_bytes(
        shape: impl Into<Shape>,
        r#type: DataType,
        bytes: &[u8],
    ) -> Result<Block, KernelError> {
        let shape = shape.into();
        if bytes.len() != shape.size() * r#type.size() {
            return Err(KernelError::Size(shape.size() * r#type.size(), bytes.len()));
        }
        dispatch!(r#type, T => {
            let data: Vec<T> = bytes
                .chunks_exact(r#type.size())
                .map(bytemuck::checked::try_pod_read_unaligned::<T>)
                .try_collect()
                .map_err(|err| KernelError::Bytes(format!("{err:?}")))?;
            Block::from_vec(shape, data)
        })
    }
}

/// Copies an `extent`-sized window at `src_offset` of `src` into `dst` at `dst_offset`.
/// Both buffers are row-major over their shapes.
pub fn copy_region<T: Copy>(
    src: &[T],
    src_shape: &[usize],
    src_offset: &[usize],
    dst: &mut [T],
    dst_shape: &[usize],
    dst_offset: &[usize],
    extent: &[usize],
) {
    let src_strides = crate::shape::strides(src_shape);
    let dst_strides = crate::shape::strides(dst_shape);
    let Some((&row, outer)) = extent.split_last() else {
        dst[0] = src[0];
        return;
    };
    for coord in Coords::new(outer.to_vec()) {
        let position = |offset: &[usize], strides: &[usize]| -> usize {
            let outer: usize = coord
                .iter()
                .zip(offset)
                .zip(strides)
                .map(|((x, o), s)| (x + o) * s)
                .sum();
            outer + offset[offset.len() - 1]
        };
        let src_start = position(src_offset, &src_strides);
        let dst_start = position(dst_offset, &dst_strides);
        dst[dst_start..dst_start + row].copy_from_slice(&src[src_start..src_start + row]);
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use half::f16;

    use super::{Block, copy_region};
    use crate::num::DataType;

    #[test]
    fn test_block_cast() -> Result<(), Box<dyn Error>> {
        let block = Block::from_vec([2, 2], vec![1.5f32, -2.0, 0.0, 3.25])?;
        assert_eq!(block.data_type(), DataType::F32);
        assert_eq!(block.cast(DataType::I64).read::<i64>()?, &[1, -2, 0, 3]);
        assert_eq!(
            block.cast(DataType::Bool).read::<bool>()?,
            &[true, true, false, true]
        );
        assert!(block.read::<f64>().is_err());
        assert!(Block::from_vec([3], vec![1i32, 2]).is_err());
        Ok(())
    }

    #[test]
    fn test_block_bytes() -> Result<(), Box<dyn Error>> {
        fastrand::seed(42);
        let data: Vec<_> = (0..12).map(|_| f16::from_f32(fastrand::f32())).collect();
        let block = Block::from_vec([3, 4], data)?;
        let bytes = block.to_bytes();
        assert_eq!(bytes.len(), 24);
        let other = Block::from_bytes([3, 4], DataType::F16, &bytes)?;
        assert_eq!(block, other);

        let bools = Block::from_bytes([3], DataType::Bool, &[0, 1, 0])?;
        assert_eq!(bools.read::<bool>()?, &[false, true, false]);
        assert!(Block::from_bytes([1], DataType::Bool, &[2]).is_err());
        Ok(())
    }

    #[test]
    fn test_copy_region() {
        let src: Vec<usize> = (0..12).collect();
        let mut dst = vec![0; 6];
        // rows 1..3 and columns 1..3 of a 3x4 source into the bottom of a 3x2 destination
        copy_region(&src, &[3, 4], &[1, 1], &mut dst, &[3, 2], &[1, 0], &[2, 2]);
        assert_eq!(dst, vec![0, 0, 5, 6, 9, 10]);

        let mut dst = vec![0];
        copy_region(&[7], &[], &[], &mut dst, &[], &[], &[]);
        assert_eq!(dst, vec![7]);
    }
}
