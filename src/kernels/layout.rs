use itertools::Itertools;
use rustc_hash::FxHashMap as HashMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::unpack;
use crate::{
    block::{Block, copy_region},
    num::{DataType, Scalar, dispatch},
    runtime::{Execute, Kernel, KernelError, Value},
    shape::Shape,
};

/// A window of one source block that lands in the output block.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Piece {
    pub src_offset: Vec<usize>,
    pub dst_offset: Vec<usize>,
    pub extent: Vec<usize>,
}

impl Piece {
    fn fits(offset: &[usize], extent: &[usize], shape: &[usize]) -> bool {
        offset.len() == shape.len()
            && extent.len() == shape.len()
            && itertools::izip!(offset, extent, shape).all(|(o, e, s)| o + e <= *s)
    }
}

/// Assembles a block of `shape` from windows of its arguments, one argument per piece.
/// Elements no piece covers are zero.
#[derive(Debug, Clone, Kernel)]
#[kernel(crate = "crate")]
pub struct Gather {
    pub shape: Shape,
    pub r#type: DataType,
    pub pieces: Vec<Piece>,
}

impl Gather {
    fn gather<T: Scalar>(&self, sources: &[Block]) -> Result<Block, KernelError> {
        let mut output = vec![T::zero(); self.shape.size()];
        for (piece, source) in self.pieces.iter().zip_eq(sources) {
            let valid = Piece::fits(&piece.src_offset, &piece.extent, source.shape())
                && Piece::fits(&piece.dst_offset, &piece.extent, &self.shape);
            if !valid {
                return Err(KernelError::Argument(format!(
                    "piece {piece:?} does not fit {} into {}",
                    source.shape(),
                    self.shape
                )));
            }
            if piece.extent.contains(&0) {
                continue;
            }
            copy_region(
                source.read::<T>()?,
                source.shape(),
                &piece.src_offset,
                &mut output,
                &self.shape,
                &piece.dst_offset,
                &piece.extent,
            );
        }
        Block::from_vec(self.shape.clone(), output)
    }
}

impl Execute for Gather {
    fn execute(&self, args: Vec<Value>) -> Result<Value, KernelError> {
        if args.len() != self.pieces.len() {
            return Err(KernelError::Arity(self.name(), self.pieces.len(), args.len()));
        }
        let sources: Vec<_> = args
            .into_iter()
            .map(|arg| arg.into_block().map(|block| block.cast(self.r#type)))
            .try_collect()?;
        dispatch!(self.r#type, T => self.gather::<T>(&sources)).map(Value::Block)
    }
}

/// A run of `len` diagonal elements of one source block.
/// Element `k` is read at `src + k` and written at `dst + k`, on every axis at once.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Run {
    pub src: Vec<usize>,
    pub dst: Vec<usize>,
    pub len: usize,
}

impl Run {
    fn fits(offset: &[usize], len: usize, shape: &[usize]) -> bool {
        offset.len() == shape.len() && offset.iter().zip(shape).all(|(o, s)| o + len <= *s)
    }
}

/// Assembles a block of `shape` from diagonal runs of its arguments, one argument per run.
/// Elements no run covers are zero.
#[derive(Debug, Clone, Kernel)]
#[kernel(crate = "crate")]
pub struct Diagonal {
    pub shape: Shape,
    pub r#type: DataType,
    pub runs: Vec<Run>,
}

impl Diagonal {
    fn diagonal<T: Scalar>(&self, sources: &[Block]) -> Result<Block, KernelError> {
        let mut output = vec![T::zero(); self.shape.size()];
        let dst_step: usize = self.shape.strides().iter().sum();
        for (run, source) in self.runs.iter().zip_eq(sources) {
            let valid = Run::fits(&run.src, run.len, source.shape())
                && Run::fits(&run.dst, run.len, &self.shape);
            if !valid {
                return Err(KernelError::Argument(format!(
                    "run {run:?} does not fit {} into {}",
                    source.shape(),
                    self.shape
                )));
            }
            if run.len == 0 {
                continue;
            }
            let data = source.read::<T>()?;
            let src_step: usize = source.shape().strides().iter().sum();
            let src = source.shape().flatten(&run.src);
            let dst = self.shape.flatten(&run.dst);
            for k in 0..run.len {
                output[dst + k * dst_step] = data[src + k * src_step];
            }
        }
        Block::from_vec(self.shape.clone(), output)
    }
}

impl Execute for Diagonal {
    fn execute(&self, args: Vec<Value>) -> Result<Value, KernelError> {
        if args.len() != self.runs.len() {
            return Err(KernelError::Arity(self.name(), self.runs.len(), args.len()));
        }
        let sources: Vec<_> = args
            .into_iter()
            .map(|arg| arg.into_block().map(|block| block.cast(self.r#type)))
            .try_collect()?;
        dispatch!(self.r#type, T => self.diagonal::<T>(&sources)).map(Value::Block)
    }
}

/// Builds one block of a reshaped array by reading elements in row-major order.
///
/// The output block sits at `offset` with `extent` in an array of `dst_shape`. The arguments are
/// the blocks at `sources` of the source array of `src_shape`, blocked by `src_block_shape`.
#[derive(Debug, Clone, Kernel)]
#[kernel(crate = "crate")]
pub struct Regroup {
    pub src_shape: Shape,
    pub src_block_shape: Shape,
    pub sources: Vec<Vec<usize>>,
    pub dst_shape: Shape,
    pub offset: Vec<usize>,
    pub extent: Vec<usize>,
    pub r#type: DataType,
}

impl Regroup {
    fn regroup<T: Scalar>(&self, blocks: &[Block]) -> Result<Block, KernelError> {
        let lookup: HashMap<&[usize], (&Shape, &[T])> = self
            .sources
            .iter()
            .map(Vec::as_slice)
            .zip_eq(blocks)
            .map(|(coord, block)| Ok((coord, (block.shape(), block.read::<T>()?))))
            .try_collect::<_, _, KernelError>()?;

        let extent = Shape::from(self.extent.clone());
        let mut output = Vec::with_capacity(extent.size());
        let mut block_coord = vec![0; self.src_shape.len()];
        let mut local = vec![0; self.src_shape.len()];
        for coord in extent.coords() {
            let global = coord.iter().zip(&self.offset).map(|(x, o)| x + o).collect_vec();
            let flat = self.dst_shape.flatten(&global);
            let source = self.src_shape.unflatten(flat);
            for (axis, &x) in source.iter().enumerate() {
                block_coord[axis] = x / self.src_block_shape[axis];
                local[axis] = x % self.src_block_shape[axis];
            }
            let Some((shape, data)) = lookup.get(block_coord.as_slice()) else {
                return Err(KernelError::Argument(format!(
                    "element {global:?} needs source block {block_coord:?}"
                )));
            };
            output.push(data[shape.flatten(&local)]);
        }
        Block::from_vec(extent, output)
    }
}

impl Execute for Regroup {
    fn execute(&self, args: Vec<Value>) -> Result<Value, KernelError> {
        if args.len() != self.sources.len() {
            return Err(KernelError::Arity(self.name(), self.sources.len(), args.len()));
        }
        if self.src_shape.size() != self.dst_shape.size() {
            return Err(KernelError::Shape(self.src_shape.clone(), self.dst_shape.clone()));
        }
        let blocks: Vec<_> = args
            .into_iter()
            .map(|arg| arg.into_block().map(|block| block.cast(self.r#type)))
            .try_collect()?;
        dispatch!(self.r#type, T => self.regroup::<T>(&blocks)).map(Value::Block)
    }
}

/// Gives a block a new shape of equal size without moving elements.
#[derive(Debug, Clone, Kernel)]
#[kernel(crate = "crate")]
pub struct Relabel {
    pub shape: Shape,
}

impl Execute for Relabel {
    fn execute(&self, args: Vec<Value>) -> Result<Value, KernelError> {
        let [x] = unpack::<1>(self, args)?;
        x.into_block()?.reshape(self.shape.clone()).map(Value::Block)
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::{Diagonal, Gather, Piece, Regroup, Run};
    use crate::{
        block::Block,
        num::DataType,
        runtime::{Execute, KernelError, Value},
        shape::Shape,
    };

    #[test]
    fn test_gather_pieces() -> Result<(), Box<dyn Error>> {
        let a = Block::from_vec([2, 2], vec![1i64, 2, 3, 4])?;
        let b = Block::from_vec([2, 1], vec![true, false])?;
        let kernel = Gather {
            shape: Shape::from([2, 3]),
            r#type: DataType::I64,
            pieces: vec![
                Piece {
                    src_offset: vec![0, 1],
                    dst_offset: vec![0, 0],
                    extent: vec![2, 1],
                },
                Piece {
                    src_offset: vec![0, 0],
                    dst_offset: vec![0, 2],
                    extent: vec![2, 1],
                },
            ],
        };
        let c = kernel.execute(vec![a.clone().into(), b.into()])?.into_block()?;
        assert_eq!(c.read::<i64>()?, &[2, 0, 1, 4, 0, 0]);

        let error = kernel.execute(vec![a.into()]);
        assert_eq!(error.unwrap_err(), KernelError::Arity("gather", 2, 1));
        Ok(())
    }

    #[test]
    fn test_diagonal_runs() -> Result<(), Box<dyn Error>> {
        // scatter a vector segment onto a diagonal that enters the block from the side
        let vector = Block::from_vec([3], vec![1.0f64, 2.0, 3.0])?;
        let scatter = Diagonal {
            shape: Shape::from([2, 3]),
            r#type: DataType::F64,
            runs: vec![Run {
                src: vec![1],
                dst: vec![0, 1],
                len: 2,
            }],
        };
        let block = scatter.execute(vec![vector.clone().into()])?.into_block()?;
        assert_eq!(block.read::<f64>()?, &[0.0, 2.0, 0.0, 0.0, 0.0, 3.0]);

        // and read it back
        let gather = Diagonal {
            shape: Shape::from([3]),
            r#type: DataType::F64,
            runs: vec![Run {
                src: vec![0, 1],
                dst: vec![1],
                len: 2,
            }],
        };
        let back = gather.execute(vec![block.into()])?.into_block()?;
        assert_eq!(back.read::<f64>()?, &[0.0, 2.0, 3.0]);

        let long = Diagonal {
            runs: vec![Run {
                src: vec![0],
                dst: vec![0, 1],
                len: 3,
            }],
            ..scatter
        };
        assert!(matches!(
            long.execute(vec![vector.into()]),
            Err(KernelError::Argument(_))
        ));
        Ok(())
    }

    #[test]
    fn test_regroup() -> Result<(), Box<dyn Error>> {
        // a (2, 4) array in (1, 4) blocks, read back as the second (4, 1) block of a (8, 1) array
        let rows = [
            Block::from_vec([1, 4], vec![0.0f32, 1.0, 2.0, 3.0])?,
            Block::from_vec([1, 4], vec![4.0f32, 5.0, 6.0, 7.0])?,
        ];
        let kernel = Regroup {
            src_shape: Shape::from([2, 4]),
            src_block_shape: Shape::from([1, 4]),
            sources: vec![vec![0, 0], vec![1, 0]],
            dst_shape: Shape::from([8, 1]),
            offset: vec![2, 0],
            extent: vec![4, 1],
            r#type: DataType::F32,
        };
        let args: Vec<Value> = rows.iter().cloned().map(Value::Block).collect();
        let block = kernel.execute(args)?.into_block()?;
        assert_eq!(block.read::<f32>()?, &[2.0, 3.0, 4.0, 5.0]);

        let missing = Regroup {
            sources: vec![vec![0, 0]],
            ..kernel
        };
        assert!(missing.execute(vec![rows[0].clone().into()]).is_err());
        Ok(())
    }
}
