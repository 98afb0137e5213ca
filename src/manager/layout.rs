use std::{cmp::Reverse, ops::Range};

use itertools::Itertools;

use super::ComputeManager;
use crate::{
    Error,
    array::{ArrayError, ArrayGrid, BlockArray, BlockRecord},
    kernels::{Gather, Piece, Regroup, Relabel, Transpose},
    shape::{Coords, Shape},
};

/// The flat range of a block if its elements are contiguous in row-major order.
fn contiguous(shape: &Shape, offset: &[usize], extent: &[usize]) -> Option<Range<usize>> {
    let outer = extent.iter().take_while(|&&x| x == 1).count();
    let full = (outer + 1..shape.len()).all(|axis| extent[axis] == shape[axis]);
    match full {
        true => {
            let start = shape.flatten(offset);
            Some(start..start + extent.iter().product::<usize>())
        }
        false => None,
    }
}

fn check_axis(axis: usize, ndim: usize) -> Result<(), ArrayError> {
    match axis < ndim {
        true => Ok(()),
        false => Err(ArrayError::Axis(axis, ndim)),
    }
}

/// Checks that `axes` permute `ndim` axes.
pub(crate) fn check_axes(axes: &[usize], ndim: usize) -> Result<(), ArrayError> {
    for &axis in axes {
        check_axis(axis, ndim)?;
    }
    if let Some(axis) = axes.iter().duplicates().next() {
        return Err(ArrayError::DuplicateAxis(*axis));
    }
    Ok(())
}

impl ComputeManager {
    /// Windows of the blocks of `x` covering the region at `start` with `extent`,
    /// each destined for `dst_offset` plus its position in the region.
    pub(crate) fn collect_pieces(
        &self,
        x: &BlockArray,
        start: &[usize],
        extent: &[usize],
        dst_offset: &[usize],
    ) -> Vec<(BlockRecord, Piece)> {
        let grid = x.grid();
        let ranges = (0..x.ndim())
            .map(|axis| grid.overlap(axis, start[axis], start[axis] + extent[axis]))
            .collect_vec();
        let lengths = ranges.iter().map(|range| range.len()).collect_vec();

        let mut pieces = vec![];
        for local in Coords::new(lengths) {
            let coord = local.iter().zip(&ranges).map(|(x, range)| x + range.start).collect_vec();
            let Some(record) = x.block(&coord) else {
                continue;
            };
            let offset = grid.offset(&coord);
            let mut piece = Piece {
                src_offset: vec![],
                dst_offset: vec![],
                extent: vec![],
            };
            for axis in 0..x.ndim() {
                let lo = start[axis].max(offset[axis]);
                let hi = (start[axis] + extent[axis]).min(offset[axis] + record.shape[axis]);
                piece.src_offset.push(lo - offset[axis]);
                piece.dst_offset.push(dst_offset[axis] + lo - start[axis]);
                piece.extent.push(hi - lo);
            }
            pieces.push((record.clone(), piece));
        }
        pieces
    }

    /// Produces the block at `coord` of `grid` from `pieces`.
    ///
    /// A single piece covering a whole source block of the right extent reuses its record.
    /// Otherwise a gather runs on the device holding the largest piece.
    pub(crate) fn emit(
        &self,
        grid: &ArrayGrid,
        coord: &[usize],
        pieces: Vec<(BlockRecord, Piece)>,
    ) -> Result<BlockRecord, Error> {
        let shape = Shape::from(grid.extent(coord));
        if let [(record, piece)] = pieces.as_slice() {
            let whole = piece.src_offset.iter().all(|&x| x == 0)
                && piece.extent.as_slice() == record.shape.as_slice()
                && record.shape == shape;
            if whole {
                return Ok(record.clone());
            }
        }

        let device = pieces
            .iter()
            .rev()
            .max_by_key(|(_, piece)| piece.extent.iter().product::<usize>())
            .map(|(record, _)| record.device)
            .unwrap_or_else(|| self.place(grid, coord));
        let (records, pieces): (Vec<_>, Vec<_>) = pieces.into_iter().unzip();
        let args = records.into_iter().map(|record| record.object.into()).collect();
        let kernel = Gather {
            shape,
            r#type: grid.data_type(),
            pieces,
        };
        Ok(self.record(grid, coord, kernel, args, device)?)
    }

    /// Re-partitions `x` into blocks of `block_shape`. Blocks that keep their extent are shared.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub fn rechunk(&self, x: &BlockArray, block_shape: impl Into<Shape>) -> Result<BlockArray, Error> {
        let grid = ArrayGrid::new(x.shape().clone(), block_shape, x.data_type())?;
        if grid.block_shape() == x.block_shape() {
            return Ok(x.clone());
        }
        log::debug!("rechunk {} from {} to {}", x.shape(), x.block_shape(), grid.block_shape());

        let zero = vec![0; x.ndim()];
        let blocks: Vec<_> = grid
            .coords()
            .map(|coord| {
                let pieces = self.collect_pieces(x, &grid.offset(&coord), &grid.extent(&coord), &zero);
                self.emit(&grid, &coord, pieces)
            })
            .try_collect()?;
        Ok(BlockArray::new(grid, blocks)?)
    }

    /// The sub-array of `x` at `ranges`, one per axis. Keeps the block shape of `x`.
    pub fn slice(&self, x: &BlockArray, ranges: &[Range<usize>]) -> Result<BlockArray, Error> {
        if ranges.len() != x.ndim() {
            return Err(ArrayError::Axis(ranges.len(), x.ndim()).into());
        }
        for (axis, (range, &len)) in ranges.iter().zip(x.shape().iter()).enumerate() {
            if range.start >= range.end || range.end > len {
                let (start, end) = (range.start, range.end);
                return Err(ArrayError::Slice { axis, start, end, len }.into());
            }
        }

        let shape = ranges.iter().map(|range| range.len()).collect_vec();
        let grid = ArrayGrid::new(shape, x.block_shape().clone(), x.data_type())?;
        let zero = vec![0; x.ndim()];
        let blocks: Vec<_> = grid
            .coords()
            .map(|coord| {
                let start = grid
                    .offset(&coord)
                    .iter()
                    .zip(ranges)
                    .map(|(x, range)| x + range.start)
                    .collect_vec();
                let pieces = self.collect_pieces(x, &start, &grid.extent(&coord), &zero);
                self.emit(&grid, &coord, pieces)
            })
            .try_collect()?;
        Ok(BlockArray::new(grid, blocks)?)
    }

    /// Splits `axis` into `sections` equal parts.
    ///
    /// Cuts on block boundaries only share block records. Straddling blocks are sliced by a gather.
    pub fn split(&self, x: &BlockArray, sections: usize, axis: usize) -> Result<Vec<BlockArray>, Error> {
        check_axis(axis, x.ndim())?;
        let len = x.shape()[axis];
        if sections == 0 || len % sections != 0 {
            return Err(ArrayError::Split { len, sections }.into());
        }
        let step = len / sections;
        (0..sections)
            .map(|section| {
                let ranges = x
                    .shape()
                    .iter()
                    .enumerate()
                    .map(|(index, &dim)| match index == axis {
                        true => section * step..(section + 1) * step,
                        false => 0..dim,
                    })
                    .collect_vec();
                self.slice(x, &ranges)
            })
            .try_collect()
    }

    /// Joins `arrays` along `axis`.
    ///
    /// All arrays must agree off `axis` in shape and block shape. The most common block
    /// extent on `axis` wins, smaller on ties, and the other inputs are re-chunked to it.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub fn concatenate(&self, arrays: &[BlockArray], axis: usize) -> Result<BlockArray, Error> {
        let Some(first) = arrays.first() else {
            return Err(ArrayError::NoArrays.into());
        };
        let ndim = first.ndim();
        check_axis(axis, ndim)?;
        for x in arrays {
            if x.ndim() != ndim {
                return Err(ArrayError::Shape(first.shape().clone(), x.shape().clone()).into());
            }
            for other in (0..ndim).filter(|&other| other != axis) {
                if x.shape()[other] != first.shape()[other] {
                    return Err(ArrayError::Shape(first.shape().clone(), x.shape().clone()).into());
                }
                let (lhs, rhs) = (first.block_shape()[other], x.block_shape()[other]);
                if lhs != rhs {
                    return Err(ArrayError::BlockMismatch { axis: other, lhs, rhs }.into());
                }
            }
        }

        let r#type = arrays
            .iter()
            .map(BlockArray::data_type)
            .reduce(|x, y| x.promote(y))
            .unwrap_or(first.data_type());
        let counts = arrays.iter().map(|x| x.block_shape()[axis]).counts();
        let block = counts
            .into_iter()
            .max_by_key(|&(block, count)| (count, Reverse(block)))
            .map(|(block, _)| block)
            .unwrap_or(first.block_shape()[axis]);

        let inputs: Vec<_> = arrays
            .iter()
            .map(|x| {
                let x = self.astype(x, r#type)?;
                let mut block_shape = x.block_shape().to_vec();
                block_shape[axis] = block.min(x.shape()[axis]);
                self.rechunk(&x, block_shape)
            })
            .try_collect()?;

        let mut shape = first.shape().to_vec();
        shape[axis] = inputs.iter().map(|x| x.shape()[axis]).sum();
        let mut block_shape = first.block_shape().to_vec();
        block_shape[axis] = block;
        let grid = ArrayGrid::new(shape, block_shape, r#type)?;

        let bounds = inputs
            .iter()
            .scan(0, |offset, x| {
                let start = *offset;
                *offset += x.shape()[axis];
                Some(start..*offset)
            })
            .collect_vec();
        let blocks: Vec<_> = grid
            .coords()
            .map(|coord| {
                let offset = grid.offset(&coord);
                let extent = grid.extent(&coord);
                let (lo, hi) = (offset[axis], offset[axis] + extent[axis]);
                let mut pieces = vec![];
                for (x, bound) in inputs.iter().zip(&bounds) {
                    let (start, end) = (lo.max(bound.start), hi.min(bound.end));
                    if start >= end {
                        continue;
                    }
                    let mut src = offset.clone();
                    src[axis] = start - bound.start;
                    let mut region = extent.clone();
                    region[axis] = end - start;
                    let mut dst = vec![0; ndim];
                    dst[axis] = start - lo;
                    pieces.extend(self.collect_pieces(x, &src, &region, &dst));
                }
                self.emit(&grid, &coord, pieces)
            })
            .try_collect()?;
        log::debug!("concatenate {} arrays into {}", arrays.len(), grid.shape());
        Ok(BlockArray::new(grid, blocks)?)
    }

    /// Reshapes `x`, choosing the block shape with [`ComputeManager::compute_block_shape`].
    pub fn reshape(&self, x: &BlockArray, shape: impl Into<Shape>) -> Result<BlockArray, Error> {
        let shape = shape.into();
        let block_shape = self.compute_block_shape(&shape, x.data_type());
        self.reshape_with(x, shape, block_shape)
    }

    /// Reshapes `x` into `shape` with blocks of `block_shape`.
    ///
    /// If every block of `x` is a contiguous run of elements and the new blocks are the same runs,
    /// each block is relabelled in place. Otherwise elements are regrouped into new blocks.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub fn reshape_with(
        &self,
        x: &BlockArray,
        shape: impl Into<Shape>,
        block_shape: impl Into<Shape>,
    ) -> Result<BlockArray, Error> {
        let shape = shape.into();
        if shape.size() != x.size() {
            return Err(ArrayError::Reshape(x.shape().clone(), shape).into());
        }
        if &shape == x.shape() {
            return self.rechunk(x, block_shape);
        }
        let grid = ArrayGrid::new(shape, block_shape, x.data_type())?;

        let runs = |grid: &ArrayGrid| -> Option<Vec<Range<usize>>> {
            grid.coords()
                .map(|coord| contiguous(grid.shape(), &grid.offset(&coord), &grid.extent(&coord)))
                .collect()
        };
        let aligned = match (runs(x.grid()), runs(&grid)) {
            (Some(old), Some(new)) => old == new,
            _ => false,
        };
        if aligned {
            log::debug!("relabel {} as {}", x.shape(), grid.shape());
            return self.relabel(x, grid);
        }

        log::debug!("regroup {} into {}", x.shape(), grid.shape());
        let old = x.grid();
        let blocks: Vec<_> = grid
            .coords()
            .map(|coord| {
                let offset = grid.offset(&coord);
                let last = offset
                    .iter()
                    .zip(grid.extent(&coord))
                    .map(|(x, e)| x + e - 1)
                    .collect_vec();
                let (lo, hi) = (grid.shape().flatten(&offset), grid.shape().flatten(&last));
                // every old block whose leading block index lies between those of the first and last element
                let rows = match old.ndim() {
                    0 => 0..1,
                    _ => {
                        let row = |flat: usize| old.shape().unflatten(flat)[0] / old.block_shape()[0];
                        row(lo)..row(hi) + 1
                    }
                };
                let sources = old
                    .coords()
                    .filter(|source| source.first().is_none_or(|row| rows.contains(row)))
                    .collect_vec();
                let args = sources
                    .iter()
                    .filter_map(|source| x.block(source))
                    .map(|record| (&record.object).into())
                    .collect();
                let kernel = Regroup {
                    src_shape: old.shape().clone(),
                    src_block_shape: old.block_shape().clone(),
                    sources,
                    dst_shape: grid.shape().clone(),
                    offset,
                    extent: grid.extent(&coord),
                    r#type: grid.data_type(),
                };
                let device = self.place(&grid, &coord);
                self.record(&grid, &coord, kernel, args, device)
            })
            .try_collect()?;
        Ok(BlockArray::new(grid, blocks)?)
    }

    fn relabel(&self, x: &BlockArray, grid: ArrayGrid) -> Result<BlockArray, Error> {
        let blocks: Vec<_> = grid
            .coords()
            .zip_eq(x.blocks().iter())
            .map(|(coord, record)| {
                let kernel = Relabel {
                    shape: grid.extent(&coord).into(),
                };
                self.record(&grid, &coord, kernel, vec![(&record.object).into()], record.device)
            })
            .try_collect()?;
        Ok(BlockArray::new(grid, blocks)?)
    }

    /// Inserts an axis of length 1 before `axis`.
    pub fn expand_dims(&self, x: &BlockArray, axis: usize) -> Result<BlockArray, Error> {
        check_axis(axis, x.ndim() + 1)?;
        let mut shape = x.shape().to_vec();
        let mut block_shape = x.block_shape().to_vec();
        shape.insert(axis, 1);
        block_shape.insert(axis, 1);
        let grid = ArrayGrid::new(shape, block_shape, x.data_type())?;
        self.relabel(x, grid)
    }

    /// Drops every axis of length 1.
    pub fn squeeze(&self, x: &BlockArray) -> Result<BlockArray, Error> {
        let (shape, block_shape): (Vec<_>, Vec<_>) = x
            .shape()
            .iter()
            .zip(x.block_shape().iter())
            .filter(|(dim, _)| **dim != 1)
            .map(|(&dim, &block)| (dim, block))
            .unzip();
        if shape.len() == x.ndim() {
            return Ok(x.clone());
        }
        let grid = ArrayGrid::new(shape, block_shape, x.data_type())?;
        self.relabel(x, grid)
    }

    /// Permutes the axes of `x`. Axis `i` of the result is axis `axes[i]` of `x`.
    pub fn transpose(&self, x: &BlockArray, axes: &[usize]) -> Result<BlockArray, Error> {
        if axes.len() != x.ndim() {
            return Err(ArrayError::Axis(axes.len(), x.ndim()).into());
        }
        check_axes(axes, x.ndim())?;
        let shape = axes.iter().map(|&axis| x.shape()[axis]).collect_vec();
        let block_shape = axes.iter().map(|&axis| x.block_shape()[axis]).collect_vec();
        let grid = ArrayGrid::new(shape, block_shape, x.data_type())?;

        let blocks: Vec<_> = grid
            .coords()
            .map(|coord| {
                let mut source = vec![0; axes.len()];
                for (index, &axis) in axes.iter().enumerate() {
                    source[axis] = coord[index];
                }
                let record = x
                    .block(&source)
                    .ok_or_else(|| ArrayError::Shape(x.grid_shape().clone(), Shape::from(source)))?;
                let kernel = Transpose { axes: axes.to_vec() };
                let args = vec![(&record.object).into()];
                Ok::<_, Error>(self.record(&grid, &coord, kernel, args, record.device)?)
            })
            .try_collect()?;
        Ok(BlockArray::new(grid, blocks)?)
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use itertools::Itertools;

    use super::contiguous;
    use crate::{
        array::ArrayError,
        block::Block,
        manager::tests::manager,
        num::DataType,
        runtime::SystemKind,
        shape::Shape,
    };

    fn iota(shape: impl Into<Shape>) -> Result<Block, Box<dyn Error>> {
        let shape = shape.into();
        Ok(Block::from_vec(shape.clone(), (0..shape.size() as i64).collect_vec())?)
    }

    #[test]
    fn test_contiguous() {
        let shape = Shape::from([4, 6]);
        assert_eq!(contiguous(&shape, &[2, 0], &[2, 6]), Some(12..24));
        assert_eq!(contiguous(&shape, &[1, 2], &[1, 3]), Some(8..11));
        assert_eq!(contiguous(&shape, &[0, 0], &[2, 3]), None);
    }

    #[tokio::test]
    async fn test_concatenate() -> Result<(), Box<dyn Error>> {
        let manager = manager(SystemKind::Workers, 4)?;
        let a = iota([4, 4])?;
        let b = Block::from_vec([2, 4], vec![100.0f32; 8])?;
        let expected = a
            .to_vec::<f64>()
            .into_iter()
            .chain(std::iter::repeat_n(100.0, 8))
            .collect_vec();

        for block in [[1, 2], [2, 2], [3, 2]] {
            let x = manager.array_with(&a, block)?;
            let y = manager.array_with(&b, [2, 2])?;
            let z = manager.concatenate(&[x, y], 0)?;
            assert_eq!(z.shape(), &Shape::from([6, 4]));
            assert_eq!(z.data_type(), DataType::F64);
            assert_eq!(z.fetch().await?.read::<f64>()?, &expected[..], "block {block:?}");
        }

        // blocks aligned with the output are shared
        let x = manager.array_with(&a, [2, 2])?;
        let y = manager.astype(&manager.array_with(&b, [2, 2])?, DataType::I64)?;
        let z = manager.concatenate(&[x.clone(), y], 0)?;
        assert_eq!(z.blocks()[0].object.id(), x.blocks()[0].object.id());

        let w = manager.array_with(&b, [2, 1])?;
        assert!(matches!(
            manager.concatenate(&[x.clone(), w], 0),
            Err(crate::Error::Array(ArrayError::BlockMismatch { axis: 1, .. }))
        ));
        assert!(manager.concatenate(&[], 0).is_err());
        manager.system().shutdown();
        Ok(())
    }

    #[tokio::test]
    async fn test_split_shares_aligned_blocks() -> Result<(), Box<dyn Error>> {
        let manager = manager(SystemKind::Serial, 1)?;
        let a = iota([6, 2])?;
        let x = manager.array_with(&a, [2, 2])?;

        let parts = manager.split(&x, 3, 0)?;
        assert_eq!(parts.len(), 3);
        for (part, record) in parts.iter().zip(x.blocks().iter()) {
            assert_eq!(part.blocks()[0].object.id(), record.object.id());
        }

        // cuts through the middle of blocks
        let parts = manager.split(&x, 2, 0)?;
        assert_eq!(parts[1].fetch().await?.read::<i64>()?, &[6, 7, 8, 9, 10, 11]);
        assert!(matches!(
            manager.split(&x, 4, 0),
            Err(crate::Error::Array(ArrayError::Split { len: 6, sections: 4 }))
        ));

        let window = manager.slice(&x, &[1..5, 1..2])?;
        assert_eq!(window.fetch().await?.read::<i64>()?, &[3, 5, 7, 9]);
        assert!(manager.slice(&x, &[0..7, 0..2]).is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_reshape() -> Result<(), Box<dyn Error>> {
        let manager = manager(SystemKind::Workers, 3)?;
        let a = iota([4, 6])?;
        let x = manager.array_with(&a, [2, 6])?;

        // rows are contiguous runs, so this one only relabels
        let y = manager.reshape_with(&x, [2, 12], [1, 12])?;
        assert_eq!(y.fetch().await?.read::<i64>()?, a.read::<i64>()?);

        for (shape, block) in [(vec![3, 8], vec![2, 3]), (vec![24], vec![5]), (vec![2, 3, 4], vec![1, 2, 3])] {
            let y = manager.reshape_with(&x, shape.clone(), block)?;
            let y = y.fetch().await?;
            assert_eq!(y.shape().to_vec(), shape);
            assert_eq!(y.read::<i64>()?, a.read::<i64>()?);
        }

        let z = manager.reshape(&x, [6, 4])?;
        assert_eq!(z.fetch().await?.read::<i64>()?, a.read::<i64>()?);
        assert!(matches!(
            manager.reshape(&x, [5, 5]),
            Err(crate::Error::Array(ArrayError::Reshape(..)))
        ));

        let e = manager.expand_dims(&x, 1)?;
        assert_eq!(e.shape(), &Shape::from([4, 1, 6]));
        let s = manager.squeeze(&e)?;
        assert_eq!(s.shape(), x.shape());
        assert_eq!(s.fetch().await?.read::<i64>()?, a.read::<i64>()?);
        manager.system().shutdown();
        Ok(())
    }

    #[tokio::test]
    async fn test_transpose() -> Result<(), Box<dyn Error>> {
        let manager = manager(SystemKind::Scheduled, 2)?;
        let a = iota([2, 3, 4])?;
        let x = manager.array_with(&a, [1, 2, 3])?;
        let y = manager.transpose(&x, &[2, 0, 1])?;
        assert_eq!(y.shape(), &Shape::from([4, 2, 3]));

        let y = y.fetch().await?;
        let y = y.read::<i64>()?;
        for (i, j, k) in itertools::iproduct!(0..2, 0..3, 0..4) {
            assert_eq!(y[k * 6 + i * 3 + j], (i * 12 + j * 4 + k) as i64);
        }
        assert!(manager.transpose(&x, &[0, 0, 1]).is_err());

        let r = manager.rechunk(&x, [2, 3, 2])?;
        assert_eq!(r.block_shape(), &Shape::from([2, 3, 2]));
        assert_eq!(r.fetch().await?.read::<i64>()?, a.read::<i64>()?);
        manager.system().shutdown();
        Ok(())
    }
}
