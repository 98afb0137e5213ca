use itertools::Itertools;

use super::{ComputeManager, layout::check_axes};
use crate::{
    Error,
    array::{ArrayError, ArrayGrid, BlockArray, BlockRecord},
    kernels::{Combine, Finalize, Reduce, ReduceOp},
    runtime::{DeviceId, ObjectRef},
    shape::Shape,
};

impl ComputeManager {
    /// Merges `partials` pairwise, level by level, keeping their order.
    /// Each merge runs on the device of its left operand.
    pub(crate) fn tree(
        &self,
        op: ReduceOp,
        mut partials: Vec<(ObjectRef, DeviceId)>,
    ) -> Result<Option<(ObjectRef, DeviceId)>, Error> {
        while partials.len() > 1 {
            let mut level = Vec::with_capacity(partials.len().div_ceil(2));
            let mut pending = partials.into_iter();
            while let Some((lhs, device)) = pending.next() {
                match pending.next() {
                    Some((rhs, _)) => {
                        let object = self.call(Combine { op }, vec![lhs.into(), rhs.into()], device)?;
                        level.push((object, device));
                    }
                    None => level.push((lhs, device)),
                }
            }
            partials = level;
        }
        Ok(partials.pop())
    }

    /// Reduces `x` along `axes`, or along every axis if `None`.
    ///
    /// Each block is reduced on its own device. Partials of the same output block are then merged
    /// in ascending block order. Arg reductions take either every axis or exactly one.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all, fields(op = op.name())))]
    pub fn reduce(
        &self,
        op: ReduceOp,
        x: &BlockArray,
        axes: Option<&[usize]>,
        keepdims: bool,
        ddof: usize,
    ) -> Result<BlockArray, Error> {
        let ndim = x.ndim();
        let axes = match axes {
            Some(axes) => {
                check_axes(axes, ndim)?;
                axes.to_vec()
            }
            None => (0..ndim).collect_vec(),
        };
        let index_strides = match (op.is_arg(), axes.as_slice()) {
            (false, _) => vec![0; ndim],
            (true, axes) if axes.len() == ndim => x.shape().strides(),
            (true, &[axis]) => (0..ndim).map(|index| (index == axis) as usize).collect(),
            (true, _) => {
                let message = format!("{op} along {} of {ndim} axes", axes.len());
                return Err(ArrayError::Unsupported(message).into());
            }
        };

        let reduced = |axis: usize| axes.contains(&axis);
        let kept = |values: &[usize]| -> Vec<usize> {
            (0..ndim)
                .filter(|&axis| keepdims || !reduced(axis))
                .map(|axis| match reduced(axis) {
                    true => 1,
                    false => values[axis],
                })
                .collect()
        };
        let grid = ArrayGrid::new(
            kept(x.shape()),
            kept(x.block_shape()),
            op.output(x.data_type()),
        )?;

        // partials grouped by output block, in ascending block order within each group
        let mut groups: Vec<Vec<(ObjectRef, DeviceId)>> = vec![vec![]; grid.num_blocks()];
        let keep_grid = Shape::from(
            (0..ndim)
                .map(|axis| match reduced(axis) {
                    true => 1,
                    false => x.grid_shape()[axis],
                })
                .collect_vec(),
        );
        for (coord, record) in x.grid().coords().zip_eq(x.blocks().iter()) {
            let kernel = Reduce {
                op,
                axes: axes.clone(),
                offset: x.grid().offset(&coord),
                index_strides: index_strides.clone(),
            };
            let object = self.call(kernel, vec![(&record.object).into()], record.device)?;
            let target = coord
                .iter()
                .enumerate()
                .map(|(axis, &x)| if reduced(axis) { 0 } else { x })
                .collect_vec();
            groups[keep_grid.flatten(&target)].push((object, record.device));
        }

        let blocks: Vec<_> = grid
            .coords()
            .zip_eq(groups)
            .map(|(coord, partials)| -> Result<BlockRecord, Error> {
                let (root, device) = self
                    .tree(op, partials)?
                    .ok_or_else(|| ArrayError::BlockShape(x.shape().clone(), x.block_shape().clone()))?;
                let kernel = Finalize {
                    op,
                    r#type: grid.data_type(),
                    shape: grid.extent(&coord).into(),
                    ddof,
                };
                Ok(self.record(&grid, &coord, kernel, vec![root.into()], device)?)
            })
            .try_collect()?;
        log::debug!(
            "{op} of {} blocks over axes {axes:?} into {} blocks",
            x.blocks().len(),
            blocks.len()
        );
        Ok(BlockArray::new(grid, blocks)?)
    }

    pub fn sum(&self, x: &BlockArray, axes: Option<&[usize]>, keepdims: bool) -> Result<BlockArray, Error> {
        self.reduce(ReduceOp::Sum, x, axes, keepdims, 0)
    }

    pub fn mean(&self, x: &BlockArray, axes: Option<&[usize]>, keepdims: bool) -> Result<BlockArray, Error> {
        self.reduce(ReduceOp::Mean, x, axes, keepdims, 0)
    }

    /// Variance with `ddof` delta degrees of freedom.
    pub fn var(
        &self,
        x: &BlockArray,
        axes: Option<&[usize]>,
        keepdims: bool,
        ddof: usize,
    ) -> Result<BlockArray, Error> {
        self.reduce(ReduceOp::Var, x, axes, keepdims, ddof)
    }

    pub fn std(
        &self,
        x: &BlockArray,
        axes: Option<&[usize]>,
        keepdims: bool,
        ddof: usize,
    ) -> Result<BlockArray, Error> {
        self.reduce(ReduceOp::Std, x, axes, keepdims, ddof)
    }

    pub fn min(&self, x: &BlockArray, axes: Option<&[usize]>, keepdims: bool) -> Result<BlockArray, Error> {
        self.reduce(ReduceOp::Min, x, axes, keepdims, 0)
    }

    pub fn max(&self, x: &BlockArray, axes: Option<&[usize]>, keepdims: bool) -> Result<BlockArray, Error> {
        self.reduce(ReduceOp::Max, x, axes, keepdims, 0)
    }

    pub fn all(&self, x: &BlockArray, axes: Option<&[usize]>, keepdims: bool) -> Result<BlockArray, Error> {
        self.reduce(ReduceOp::All, x, axes, keepdims, 0)
    }

    pub fn any(&self, x: &BlockArray, axes: Option<&[usize]>, keepdims: bool) -> Result<BlockArray, Error> {
        self.reduce(ReduceOp::Any, x, axes, keepdims, 0)
    }

    /// Index of the minimum, flat if `axis` is `None`.
    pub fn argmin(&self, x: &BlockArray, axis: Option<usize>) -> Result<BlockArray, Error> {
        let axes = axis.map(|axis| [axis]);
        self.reduce(ReduceOp::ArgMin, x, axes.as_ref().map(|x| &x[..]), false, 0)
    }

    /// Index of the maximum, flat if `axis` is `None`.
    pub fn argmax(&self, x: &BlockArray, axis: Option<usize>) -> Result<BlockArray, Error> {
        let axes = axis.map(|axis| [axis]);
        self.reduce(ReduceOp::ArgMax, x, axes.as_ref().map(|x| &x[..]), false, 0)
    }
}
