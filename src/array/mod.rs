//! Block-distributed arrays.

use std::sync::Arc;

use itertools::Itertools;
use thiserror::Error;

pub use grid::ArrayGrid;

use crate::{
    block::{Block, copy_region},
    num::{DataType, Scalar, Zero, dispatch},
    runtime::{DeviceId, KernelError, ObjectRef},
    shape::Shape,
};

pub mod grid;

/// Configuration errors of array operations. Raised before any kernel is submitted.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ArrayError {
    #[error("block shape {1} does not partition shape {0}")]
    BlockShape(Shape, Shape),
    #[error("shape {0} has a zero-length axis")]
    EmptyAxis(Shape),
    #[error("axis {0} is out of range for an array of {1} dimensions")]
    Axis(usize, usize),
    #[error("axis {0} is repeated")]
    DuplicateAxis(usize),
    #[error("shapes {0} and {1} cannot be broadcast")]
    Broadcast(Shape, Shape),
    #[error("shape {0} mismatches {1}")]
    Shape(Shape, Shape),
    #[error("block extents {lhs} and {rhs} mismatch along axis {axis}")]
    BlockMismatch { axis: usize, lhs: usize, rhs: usize },
    #[error("contracted axes have lengths {0} and {1}")]
    ContractionLength(usize, usize),
    #[error("axis of length {len} does not split into {sections} equal sections")]
    Split { len: usize, sections: usize },
    #[error("cannot reshape {0} into {1}")]
    Reshape(Shape, Shape),
    #[error("range {start}..{end} is invalid for axis {axis} of length {len}")]
    Slice {
        axis: usize,
        start: usize,
        end: usize,
        len: usize,
    },
    #[error("step must be non-zero")]
    Step,
    #[error("operation is undefined for data type {0}")]
    Type(DataType),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("no arrays given")]
    NoArrays,
    #[error("array of shape {0} is not a single element")]
    NotScalar(Shape),
}

/// One block of a [`BlockArray`]: where it lives, the handle to its value, and its extent.
#[derive(Debug, Clone)]
pub struct BlockRecord {
    pub device: DeviceId,
    pub object: ObjectRef,
    pub shape: Shape,
}

/// An immutable array partitioned into blocks that are distributed across devices.
///
/// Clones share their block records.
#[derive(Debug, Clone)]
pub struct BlockArray {
    grid: ArrayGrid,
    blocks: Arc<[BlockRecord]>,
}

impl BlockArray {
    /// Pairs a grid with its row-major block records.
    pub fn new(grid: ArrayGrid, blocks: impl Into<Arc<[BlockRecord]>>) -> Result<Self, ArrayError> {
        let blocks = blocks.into();
        if blocks.len() != grid.num_blocks() {
            return Err(ArrayError::Shape(
                grid.grid_shape().clone(),
                Shape::from([blocks.len()]),
            ));
        }
        for (coord, record) in grid.coords().zip_eq(blocks.iter()) {
            let extent = Shape::from(grid.extent(&coord));
            if record.shape != extent {
                return Err(ArrayError::Shape(extent, record.shape.clone()));
            }
        }
        Ok(Self { grid, blocks })
    }

    #[inline]
    pub fn grid(&self) -> &ArrayGrid {
        &self.grid
    }

    #[inline]
    pub fn shape(&self) -> &Shape {
        self.grid.shape()
    }

    #[inline]
    pub fn block_shape(&self) -> &Shape {
        self.grid.block_shape()
    }

    #[inline]
    pub fn grid_shape(&self) -> &Shape {
        self.grid.grid_shape()
    }

    #[inline]
    pub fn data_type(&self) -> DataType {
        self.grid.data_type()
    }

    #[inline]
    pub fn ndim(&self) -> usize {
        self.grid.ndim()
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.shape().size()
    }

    #[inline]
    pub fn blocks(&self) -> &Arc<[BlockRecord]> {
        &self.blocks
    }

    /// The record of the block at `coord`.
    pub fn block(&self, coord: &[usize]) -> Option<&BlockRecord> {
        let valid = coord.len() == self.ndim()
            && coord.iter().zip(self.grid_shape().iter()).all(|(x, dim)| x < dim);
        match valid {
            true => self.blocks.get(self.grid.index(coord)),
            false => None,
        }
    }

    async fn resolve(&self, record: &BlockRecord) -> Result<Block, KernelError> {
        let block = record.object.get().await?.into_block()?;
        if block.shape() != &record.shape {
            return Err(KernelError::Shape(record.shape.clone(), block.shape().clone()));
        }
        if block.data_type() != self.data_type() {
            return Err(KernelError::Type(self.data_type(), block.data_type()));
        }
        Ok(block)
    }

    /// Waits for every block and assembles them into one dense block.
    /// Fails with the first failed block.
    pub async fn fetch(&self) -> Result<Block, KernelError> {
        let blocks = self.blocks.iter().map(|record| self.resolve(record));
        let blocks = futures::future::try_join_all(blocks).await?;

        let shape = self.shape().clone();
        dispatch!(self.data_type(), T => {
            let mut output = vec![T::zero(); shape.size()];
            for (coord, block) in self.grid.coords().zip_eq(&blocks) {
                let zero = vec![0; shape.len()];
                copy_region(
                    block.read::<T>()?,
                    block.shape(),
                    &zero,
                    &mut output,
                    &shape,
                    &self.grid.offset(&coord),
                    block.shape(),
                );
            }
            Block::from_vec(shape, output)
        })
    }

    /// Waits for the block at `coord`.
    pub async fn fetch_block(&self, coord: &[usize]) -> Result<Block, crate::Error> {
        let record = self
            .block(coord)
            .ok_or_else(|| ArrayError::Shape(self.grid_shape().clone(), Shape::from(coord)))?;
        Ok(self.resolve(record).await?)
    }

    /// The only element of a single-element array.
    pub async fn item<T: Scalar>(&self) -> Result<T, crate::Error> {
        if self.size() != 1 {
            return Err(ArrayError::NotScalar(self.shape().clone()).into());
        }
        let block = self.fetch().await?;
        let value = block.to_vec::<T>().first().copied();
        Ok(value.ok_or_else(|| ArrayError::NotScalar(self.shape().clone()))?)
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::{ArrayError, ArrayGrid, BlockArray, BlockRecord};
    use crate::{
        block::Block,
        num::DataType,
        runtime::{DeviceId, KernelError, ObjectRef, Value},
        shape::Shape,
    };

    fn record(block: Block) -> BlockRecord {
        BlockRecord {
            device: DeviceId(0),
            shape: block.shape().clone(),
            object: ObjectRef::resolved(Ok(Value::Block(block))),
        }
    }

    #[tokio::test]
    async fn test_fetch_assembles_blocks() -> Result<(), Box<dyn Error>> {
        let grid = ArrayGrid::new([3, 3], [2, 2], DataType::I32)?;
        let blocks = vec![
            record(Block::from_vec([2, 2], vec![0i32, 1, 3, 4])?),
            record(Block::from_vec([2, 1], vec![2i32, 5])?),
            record(Block::from_vec([1, 2], vec![6i32, 7])?),
            record(Block::from_vec([1, 1], vec![8i32])?),
        ];
        let array = BlockArray::new(grid, blocks)?;
        let dense = array.fetch().await?;
        assert_eq!(dense.read::<i32>()?, &(0..9).collect::<Vec<_>>()[..]);

        let corner = array.fetch_block(&[1, 1]).await?;
        assert_eq!(corner.read::<i32>()?, &[8]);
        assert!(array.fetch_block(&[2, 0]).await.is_err());
        assert!(matches!(
            array.item::<i32>().await,
            Err(crate::Error::Array(ArrayError::NotScalar(_)))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_fetch_propagates_failure() -> Result<(), Box<dyn Error>> {
        let grid = ArrayGrid::new([2], [1], DataType::F64)?;
        let failed = BlockRecord {
            device: DeviceId(0),
            shape: Shape::from([1]),
            object: ObjectRef::resolved(Err(KernelError::Panicked("lost".into()))),
        };
        let blocks = vec![record(Block::from_vec([1], vec![1.0f64])?), failed];
        let array = BlockArray::new(grid.clone(), blocks)?;
        assert_eq!(array.fetch().await, Err(KernelError::Panicked("lost".into())));
        assert!(array.fetch_block(&[0]).await.is_ok());

        let mismatched = vec![record(Block::from_vec([2], vec![1.0f64, 2.0])?)];
        assert!(BlockArray::new(grid, mismatched).is_err());
        Ok(())
    }
}
