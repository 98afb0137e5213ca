use std::ops::Range;

use itertools::Itertools;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::ArrayError;
use crate::{
    num::DataType,
    shape::{Coords, Shape},
};

/// Geometry of a block-partitioned array.
///
/// Blocks tile the shape exactly. Boundary blocks along an axis may be shorter than `block_shape`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ArrayGrid {
    shape: Shape,
    block_shape: Shape,
    grid_shape: Shape,
    r#type: DataType,
}

impl ArrayGrid {
    /// Fails on zero-length axes and empty blocks. Block extents larger than the axis are clamped.
    pub fn new(
        shape: impl Into<Shape>,
        block_shape: impl Into<Shape>,
        r#type: DataType,
    ) -> Result<Self, ArrayError> {
        let shape = shape.into();
        let block_shape = block_shape.into();
        if shape.len() != block_shape.len() || block_shape.contains(&0) {
            return Err(ArrayError::BlockShape(shape, block_shape));
        }
        if shape.contains(&0) {
            return Err(ArrayError::EmptyAxis(shape));
        }

        let block_shape = Shape::from(
            shape
                .iter()
                .zip_eq(block_shape.iter())
                .map(|(&dim, &block)| block.min(dim))
                .collect_vec(),
        );
        let grid_shape = Shape::from(
            shape
                .iter()
                .zip_eq(block_shape.iter())
                .map(|(&dim, &block)| dim.div_ceil(block))
                .collect_vec(),
        );
        Ok(Self {
            shape,
            block_shape,
            grid_shape,
            r#type,
        })
    }

    #[inline]
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    #[inline]
    pub fn block_shape(&self) -> &Shape {
        &self.block_shape
    }

    #[inline]
    pub fn grid_shape(&self) -> &Shape {
        &self.grid_shape
    }

    #[inline]
    pub fn data_type(&self) -> DataType {
        self.r#type
    }

    #[inline]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    #[inline]
    pub fn num_blocks(&self) -> usize {
        self.grid_shape.size()
    }

    /// Block coordinates in row-major order.
    #[inline]
    pub fn coords(&self) -> Coords {
        self.grid_shape.coords()
    }

    /// Row-major position of the block at `coord`.
    #[inline]
    pub fn index(&self, coord: &[usize]) -> usize {
        self.grid_shape.flatten(coord)
    }

    /// Global coordinate of the first element of the block at `coord`.
    pub fn offset(&self, coord: &[usize]) -> Vec<usize> {
        coord.iter().zip_eq(self.block_shape.iter()).map(|(x, b)| x * b).collect()
    }

    /// Shape of the block at `coord`.
    pub fn extent(&self, coord: &[usize]) -> Vec<usize> {
        itertools::izip!(coord, self.block_shape.iter(), self.shape.iter())
            .map(|(x, &b, &dim)| b.min(dim - x * b))
            .collect()
    }

    /// Same geometry holding elements of another type.
    pub fn with_type(&self, r#type: DataType) -> Self {
        Self {
            r#type,
            ..self.clone()
        }
    }

    /// Block indices along `axis` whose elements intersect `start..end`.
    pub fn overlap(&self, axis: usize, start: usize, end: usize) -> Range<usize> {
        let block = self.block_shape[axis];
        match start < end {
            true => start / block..end.div_ceil(block),
            false => 0..0,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use itertools::Itertools;

    use super::ArrayGrid;
    use crate::{array::ArrayError, num::DataType, shape::Shape};

    #[test]
    fn test_array_grid() -> Result<(), Box<dyn Error>> {
        let grid = ArrayGrid::new([5, 4], [2, 8], DataType::F32)?;
        assert_eq!(grid.block_shape(), &Shape::from([2, 4]));
        assert_eq!(grid.grid_shape(), &Shape::from([3, 1]));
        assert_eq!(grid.extent(&[2, 0]), vec![1, 4]);
        assert_eq!(grid.offset(&[2, 0]), vec![4, 0]);
        assert_eq!(grid.overlap(0, 1, 4), 0..2);

        let sizes: usize = grid.coords().map(|coord| grid.extent(&coord).iter().product::<usize>()).sum();
        assert_eq!(sizes, 20);
        assert_eq!(grid.coords().collect_vec().len(), grid.num_blocks());

        let scalar = ArrayGrid::new(Shape::default(), Shape::default(), DataType::I64)?;
        assert_eq!(scalar.num_blocks(), 1);
        assert_eq!(scalar.extent(&[]), Vec::<usize>::new());
        Ok(())
    }

    #[test]
    fn test_array_grid_errors() {
        assert!(matches!(
            ArrayGrid::new([3, 0], [1, 1], DataType::F32),
            Err(ArrayError::EmptyAxis(_))
        ));
        assert!(matches!(
            ArrayGrid::new([3, 3], [1], DataType::F32),
            Err(ArrayError::BlockShape(..))
        ));
        assert!(matches!(
            ArrayGrid::new([3], [0], DataType::F32),
            Err(ArrayError::BlockShape(..))
        ));
    }
}
