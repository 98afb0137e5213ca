use itertools::Itertools;

use super::{ComputeManager, layout::check_axes};
use crate::{
    Error,
    array::{ArrayError, ArrayGrid, BlockArray, BlockRecord},
    kernels::{Contract, ReduceOp},
    shape::{Coords, Shape},
};

impl ComputeManager {
    /// Contracts `lhs_axes` of `lhs` with `rhs_axes` of `rhs`.
    ///
    /// Contracted axes must agree in length and block extent. Every output block sums one partial
    /// product per contraction block. A partial runs where the output block is placed if that
    /// device holds one of its inputs, otherwise next to its left input.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub fn tensordot(
        &self,
        lhs: &BlockArray,
        rhs: &BlockArray,
        lhs_axes: &[usize],
        rhs_axes: &[usize],
    ) -> Result<BlockArray, Error> {
        if lhs_axes.len() != rhs_axes.len() {
            return Err(ArrayError::Shape(Shape::from(lhs_axes), Shape::from(rhs_axes)).into());
        }
        check_axes(lhs_axes, lhs.ndim())?;
        check_axes(rhs_axes, rhs.ndim())?;
        for (&x, &y) in lhs_axes.iter().zip(rhs_axes) {
            let (lhs_len, rhs_len) = (lhs.shape()[x], rhs.shape()[y]);
            if lhs_len != rhs_len {
                return Err(ArrayError::ContractionLength(lhs_len, rhs_len).into());
            }
            let (lhs_block, rhs_block) = (lhs.block_shape()[x], rhs.block_shape()[y]);
            if lhs_block != rhs_block {
                let error = ArrayError::BlockMismatch {
                    axis: x,
                    lhs: lhs_block,
                    rhs: rhs_block,
                };
                return Err(error.into());
            }
        }

        let lhs_free = (0..lhs.ndim()).filter(|axis| !lhs_axes.contains(axis)).collect_vec();
        let rhs_free = (0..rhs.ndim()).filter(|axis| !rhs_axes.contains(axis)).collect_vec();
        let pick = |axes: &[usize], values: &Shape| axes.iter().map(|&axis| values[axis]).collect_vec();
        let shape = [pick(&lhs_free, lhs.shape()), pick(&rhs_free, rhs.shape())].concat();
        let block_shape = [pick(&lhs_free, lhs.block_shape()), pick(&rhs_free, rhs.block_shape())].concat();
        let r#type = lhs.data_type().promote(rhs.data_type()).arithmetic();
        let grid = ArrayGrid::new(shape, block_shape, r#type)?;
        let contraction = lhs_axes.iter().map(|&axis| lhs.grid_shape()[axis]).collect_vec();

        let mut tasks = 0;
        let blocks: Vec<_> = grid
            .coords()
            .map(|coord| -> Result<BlockRecord, Error> {
                let (lhs_coord, rhs_coord) = coord.split_at(lhs_free.len());
                let target = self.place(&grid, &coord);
                let mut partials = vec![];
                for k in Coords::new(contraction.clone()) {
                    let mut x = vec![0; lhs.ndim()];
                    let mut y = vec![0; rhs.ndim()];
                    for (&axis, &c) in lhs_free.iter().zip(lhs_coord) {
                        x[axis] = c;
                    }
                    for (&axis, &c) in rhs_free.iter().zip(rhs_coord) {
                        y[axis] = c;
                    }
                    for ((&l, &r), &c) in lhs_axes.iter().zip(rhs_axes).zip(&k) {
                        x[l] = c;
                        y[r] = c;
                    }
                    let (Some(x), Some(y)) = (lhs.block(&x), rhs.block(&y)) else {
                        return Err(ArrayError::Shape(lhs.grid_shape().clone(), rhs.grid_shape().clone()).into());
                    };
                    let device = match target == x.device || target == y.device {
                        true => target,
                        false => x.device,
                    };
                    let kernel = Contract {
                        lhs_axes: lhs_axes.to_vec(),
                        rhs_axes: rhs_axes.to_vec(),
                        r#type,
                    };
                    let args = vec![(&x.object).into(), (&y.object).into()];
                    partials.push((self.call(kernel, args, device)?, device));
                }
                tasks += partials.len();
                let (object, device) = self
                    .tree(ReduceOp::Sum, partials)?
                    .ok_or_else(|| ArrayError::Shape(lhs.shape().clone(), rhs.shape().clone()))?;
                Ok(BlockRecord {
                    device,
                    object,
                    shape: grid.extent(&coord).into(),
                })
            })
            .try_collect()?;
        log::debug!("tensordot into {} blocks with {tasks} partial products", blocks.len());
        Ok(BlockArray::new(grid, blocks)?)
    }

    /// Contracts the last `n` axes of `lhs` with the first `n` axes of `rhs`.
    pub fn tensordot_n(&self, lhs: &BlockArray, rhs: &BlockArray, n: usize) -> Result<BlockArray, Error> {
        if n > lhs.ndim() {
            return Err(ArrayError::Axis(n, lhs.ndim()).into());
        }
        if n > rhs.ndim() {
            return Err(ArrayError::Axis(n, rhs.ndim()).into());
        }
        let lhs_axes = (lhs.ndim() - n..lhs.ndim()).collect_vec();
        let rhs_axes = (0..n).collect_vec();
        self.tensordot(lhs, rhs, &lhs_axes, &rhs_axes)
    }

    /// Matrix product of 1-d and 2-d arrays.
    pub fn matmul(&self, lhs: &BlockArray, rhs: &BlockArray) -> Result<BlockArray, Error> {
        let supported = |x: &BlockArray| (1..=2).contains(&x.ndim());
        if !supported(lhs) || !supported(rhs) {
            let message = format!("matmul of {}-d and {}-d arrays", lhs.ndim(), rhs.ndim());
            return Err(ArrayError::Unsupported(message).into());
        }
        self.tensordot(lhs, rhs, &[lhs.ndim() - 1], &[0])
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use itertools::Itertools;

    use crate::{
        array::ArrayError,
        block::Block,
        manager::tests::manager,
        num::DataType,
        runtime::SystemKind,
        shape::Shape,
    };

    #[tokio::test]
    async fn test_identity_matmul() -> Result<(), Box<dyn Error>> {
        let manager = manager(SystemKind::Workers, 4)?;
        fastrand::seed(5);
        let data: Vec<f64> = (0..4 * 6).map(|_| fastrand::f64()).collect();
        let dense = Block::from_vec([4, 6], data.clone())?;
        for (eye, block) in [([2, 2], [2, 3]), ([4, 1], [1, 6]), ([3, 3], [3, 2])] {
            let identity = manager.rechunk(&manager.identity(4, DataType::F64)?, eye)?;
            let x = manager.array_with(&dense, block)?;
            let y = manager.matmul(&identity, &x)?;
            assert_eq!(y.shape(), &Shape::from([4, 6]));
            assert_eq!(y.fetch().await?.read::<f64>()?, &data[..], "{eye:?} @ {block:?}");
        }
        manager.system().shutdown();
        Ok(())
    }

    #[tokio::test]
    async fn test_tensordot() -> Result<(), Box<dyn Error>> {
        let manager = manager(SystemKind::Scheduled, 3)?;
        let a = (0..2 * 3 * 4).map(|x| x as i32).collect_vec();
        let b = (0..3 * 4 * 2).map(|x| (x % 5) as i32).collect_vec();
        let x = manager.array_with(&Block::from_vec([2, 3, 4], a.clone())?, [1, 2, 3])?;
        let y = manager.array_with(&Block::from_vec([3, 4, 2], b.clone())?, [2, 3, 1])?;

        let z = manager.tensordot_n(&x, &y, 2)?;
        assert_eq!(z.shape(), &Shape::from([2, 2]));
        assert_eq!(z.data_type(), DataType::I32);
        let z = z.fetch().await?;
        let expected = (0..2)
            .cartesian_product(0..2)
            .map(|(i, j)| (0..12).map(|p| a[i * 12 + p] * b[p * 2 + j]).sum::<i32>())
            .collect_vec();
        assert_eq!(z.read::<i32>()?, &expected[..]);

        let misaligned = manager.array_with(&Block::from_vec([3, 4, 2], b)?, [3, 3, 1])?;
        assert!(matches!(
            manager.tensordot_n(&x, &misaligned, 2),
            Err(crate::Error::Array(ArrayError::BlockMismatch { axis: 1, .. }))
        ));
        assert!(matches!(
            manager.matmul(&x, &y),
            Err(crate::Error::Array(ArrayError::Unsupported(_)))
        ));
        manager.system().shutdown();
        Ok(())
    }

    #[tokio::test]
    async fn test_vector_products() -> Result<(), Box<dyn Error>> {
        let manager = manager(SystemKind::Serial, 1)?;
        let v = manager.array_with(&Block::from_vec([3], vec![1.0f32, 2.0, 3.0])?, [2])?;
        let dot = manager.matmul(&v, &v)?;
        assert_eq!(dot.shape(), &Shape::default());
        assert_eq!(dot.item::<f32>().await?, 14.0);

        let m = manager.array_with(&Block::from_vec([3, 2], vec![1i64, 0, 0, 1, 1, 1])?, [2, 1])?;
        let w = manager.matmul(&v, &m)?;
        assert_eq!(w.data_type(), DataType::F64);
        assert_eq!(w.fetch().await?.read::<f64>()?, &[4.0, 5.0]);

        let short = manager.array_with(&Block::from_vec([2], vec![1.0f32; 2])?, [2])?;
        assert!(matches!(
            manager.matmul(&short, &m),
            Err(crate::Error::Array(ArrayError::ContractionLength(2, 3)))
        ));
        Ok(())
    }
}
