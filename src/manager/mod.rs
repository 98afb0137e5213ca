//! Translates array operations into per-block kernel calls.

use std::{cmp::Reverse, sync::Arc};

use itertools::Itertools;

use crate::{
    Error,
    array::{ArrayError, ArrayGrid, BlockArray, BlockRecord},
    grid::DeviceGrid,
    kernels::{Astype, BinaryFn, Identity, Map, UnaryFn, Zip},
    num::DataType,
    runtime::{Arg, DeviceId, Kernel, ObjectRef, System, SystemError},
    shape::Shape,
};

pub mod create;
pub mod layout;
pub mod linalg;
pub mod reduce;

/// Issues the kernels of array operations onto a [`System`], placing blocks with a [`DeviceGrid`].
#[derive(Debug, Clone)]
pub struct ComputeManager {
    system: Arc<dyn System>,
    grid: Arc<dyn DeviceGrid>,
    block_memory: usize,
}

/// Shrinks the largest block extent so that its axis gains at least one block.
/// Ties go to the lowest axis. Returns `false` once every extent is 1.
fn split_largest(shape: &[usize], block: &mut [usize]) -> bool {
    let Some(axis) = (0..block.len())
        .filter(|&axis| block[axis] > 1)
        .max_by_key(|&axis| (block[axis], Reverse(axis)))
    else {
        return false;
    };
    let dim = shape[axis];
    let count = dim.div_ceil(block[axis]);
    let even = dim.div_ceil(count + 1);
    block[axis] = match dim.div_ceil(even) > count {
        true => even,
        false => (dim.div_ceil(count) - 1).max(1),
    };
    true
}

impl ComputeManager {
    pub fn new(system: Arc<dyn System>, grid: Arc<dyn DeviceGrid>, block_memory: usize) -> Self {
        Self {
            system,
            grid,
            block_memory,
        }
    }

    #[inline]
    pub fn system(&self) -> &Arc<dyn System> {
        &self.system
    }

    #[inline]
    pub fn device_grid(&self) -> &Arc<dyn DeviceGrid> {
        &self.grid
    }

    #[inline]
    pub fn devices(&self) -> &[DeviceId] {
        self.grid.devices()
    }

    /// Per-block byte budget.
    #[inline]
    pub fn block_memory(&self) -> usize {
        self.block_memory
    }

    /// Submits one kernel call.
    #[inline]
    pub fn call(
        &self,
        kernel: impl Kernel,
        args: Vec<Arg>,
        device: DeviceId,
    ) -> Result<ObjectRef, SystemError> {
        self.system.call(Box::new(kernel), args, device)
    }

    /// The device the grid assigns to the block at `coord`.
    #[inline]
    pub(crate) fn place(&self, grid: &ArrayGrid, coord: &[usize]) -> DeviceId {
        self.grid.get_device(coord, grid.grid_shape())
    }

    /// Submits a kernel producing the block at `coord` of `grid`.
    pub(crate) fn record(
        &self,
        grid: &ArrayGrid,
        coord: &[usize],
        kernel: impl Kernel,
        args: Vec<Arg>,
        device: DeviceId,
    ) -> Result<BlockRecord, SystemError> {
        let object = self.call(kernel, args, device)?;
        let shape = Shape::from(grid.extent(coord));
        Ok(BlockRecord {
            device,
            object,
            shape,
        })
    }

    /// Chooses a block shape for an array of `shape` holding `r#type`.
    ///
    /// The array is first cut along the cluster shape. Then the largest block extent is split
    /// until there are at least as many blocks as devices, and then until a block fits in the
    /// block memory.
    pub fn compute_block_shape(&self, shape: &Shape, r#type: DataType) -> Shape {
        let cluster = self.grid.cluster_shape_for(shape.len());
        let mut block = shape
            .iter()
            .zip_eq(cluster.iter())
            .map(|(&dim, &cluster)| dim.div_ceil(cluster.min(dim).max(1)).max(1))
            .collect_vec();

        let count = |block: &[usize]| -> usize {
            shape.iter().zip(block).map(|(&dim, &b)| dim.div_ceil(b)).product()
        };
        let bytes = |block: &[usize]| block.iter().product::<usize>() * r#type.size();

        let devices = self.devices().len();
        while count(&block) < devices && split_largest(shape, &mut block) {}
        while bytes(&block) > self.block_memory && split_largest(shape, &mut block) {}
        block.into()
    }

    /// Runs `kernel` once per block on the block's device.
    /// The result has the same geometry, holding `r#type`.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all, fields(kernel = kernel.name())))]
    pub fn map_blocks<K: Kernel + Clone>(
        &self,
        x: &BlockArray,
        kernel: K,
        r#type: DataType,
    ) -> Result<BlockArray, Error> {
        let grid = x.grid().with_type(r#type);
        let blocks: Vec<_> = x
            .blocks()
            .iter()
            .map(|record| -> Result<_, SystemError> {
                let object = self.call(kernel.clone(), vec![(&record.object).into()], record.device)?;
                Ok(BlockRecord {
                    device: record.device,
                    object,
                    shape: record.shape.clone(),
                })
            })
            .try_collect()?;
        log::debug!("{} on {} blocks", kernel.name(), blocks.len());
        Ok(BlockArray::new(grid, blocks)?)
    }

    pub fn map_uop(&self, op: UnaryFn, x: &BlockArray) -> Result<BlockArray, Error> {
        self.map_blocks(x, Map { op }, op.output(x.data_type()))
    }

    pub fn astype(&self, x: &BlockArray, r#type: DataType) -> Result<BlockArray, Error> {
        match x.data_type() == r#type {
            true => Ok(x.clone()),
            false => self.map_blocks(x, Astype { r#type }, r#type),
        }
    }

    /// A copy with fresh block handles.
    pub fn copy(&self, x: &BlockArray) -> Result<BlockArray, Error> {
        self.map_blocks(x, Identity, x.data_type())
    }

    /// Applies a binary op under trailing-dimension broadcasting.
    ///
    /// Broadcast operands reuse their single block along size-1 axes. Each output block is
    /// computed on the device of the larger operand block, the left one on ties.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all, fields(op = op.name())))]
    pub fn map_bop(&self, op: BinaryFn, lhs: &BlockArray, rhs: &BlockArray) -> Result<BlockArray, Error> {
        let r#type = op.output(lhs.data_type().promote(rhs.data_type()));
        self.zip_blocks(Zip { op }, &[lhs, rhs], r#type)
    }

    /// Runs `kernel` once per output block on the matching blocks of every operand, under
    /// trailing-dimension broadcasting. The result holds `r#type`.
    pub(crate) fn zip_blocks<K: Kernel + Clone>(
        &self,
        kernel: K,
        operands: &[&BlockArray],
        r#type: DataType,
    ) -> Result<BlockArray, Error> {
        let (first, rest) = operands.split_first().ok_or(ArrayError::NoArrays)?;
        let shape = rest.iter().try_fold(first.shape().clone(), |shape, x| {
            shape
                .broadcast(x.shape())
                .ok_or_else(|| ArrayError::Broadcast(shape.clone(), x.shape().clone()))
        })?;
        let ndim = shape.len();

        // along each axis, the largest block extent among operands spanning it
        let block_shape = (0..ndim)
            .map(|axis| {
                operands
                    .iter()
                    .filter_map(|x| {
                        let local = axis.checked_sub(ndim - x.ndim())?;
                        (x.shape()[local] == shape[axis]).then_some(x.block_shape()[local])
                    })
                    .max()
                    .unwrap_or(1)
            })
            .collect_vec();

        // operands whose blocks disagree with the output on non-broadcast axes are re-chunked
        let conform = |x: &BlockArray| -> Result<BlockArray, Error> {
            let pad = ndim - x.ndim();
            let target = (0..x.ndim())
                .map(|axis| match x.shape()[axis] == shape[axis + pad] {
                    true => block_shape[axis + pad],
                    false => 1,
                })
                .collect_vec();
            match x.block_shape().as_slice() == target.as_slice() {
                true => Ok(x.clone()),
                false => self.rechunk(x, target),
            }
        };
        let operands: Vec<_> = operands.iter().map(|x| conform(x)).try_collect()?;

        let grid = ArrayGrid::new(shape.clone(), block_shape, r#type)?;
        let source = |x: &BlockArray, coord: &[usize]| -> Result<BlockRecord, ArrayError> {
            let pad = ndim - x.ndim();
            let coord = (0..x.ndim())
                .map(|axis| match x.shape()[axis] == shape[axis + pad] {
                    true => coord[axis + pad],
                    false => 0,
                })
                .collect_vec();
            x.block(&coord)
                .cloned()
                .ok_or_else(|| ArrayError::Shape(x.shape().clone(), shape.clone()))
        };

        let mut blocks = Vec::with_capacity(grid.num_blocks());
        for coord in grid.coords() {
            let sources: Vec<_> = operands.iter().map(|x| source(x, &coord)).try_collect()?;
            // `max_by_key` keeps the last maximum, so walk backwards to favour the first operand
            let device = sources
                .iter()
                .rev()
                .max_by_key(|record| record.shape.size())
                .map(|record| record.device)
                .unwrap_or_else(|| self.place(&grid, &coord));
            let args = sources.into_iter().map(|record| record.object.into()).collect();
            blocks.push(self.record(&grid, &coord, kernel.clone(), args, device)?);
        }
        log::debug!("{} on {} blocks of {}", kernel.name(), blocks.len(), grid.block_shape());
        Ok(BlockArray::new(grid, blocks)?)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{error::Error, sync::Arc};

    use itertools::Itertools;

    use super::ComputeManager;
    use crate::{
        block::Block,
        grid::GridKind,
        kernels::{BinaryFn, UnaryFn},
        num::DataType,
        runtime::{KernelRegistry, SystemKind},
        shape::Shape,
    };

    pub fn manager(kind: SystemKind, num_devices: usize) -> Result<ComputeManager, Box<dyn Error>> {
        let registry = Arc::new(KernelRegistry::new().add_default_kernels());
        let system = kind.build(num_devices, registry)?;
        system.init()?;
        let grid = GridKind::Cyclic.build([num_devices], system.devices().to_vec())?;
        Ok(ComputeManager::new(system, grid, 1 << 20))
    }

    #[test]
    fn test_compute_block_shape() -> Result<(), Box<dyn Error>> {
        fastrand::seed(3);
        for devices in [1, 2, 3, 4, 7] {
            let manager = manager(SystemKind::Workers, devices)?;
            for _ in 0..32 {
                let ndim = fastrand::usize(1..=3);
                let shape = Shape::from((0..ndim).map(|_| fastrand::usize(1..=12)).collect_vec());
                let block = manager.compute_block_shape(&shape, DataType::F32);
                assert_eq!(block.len(), ndim);
                assert!(block.iter().zip(shape.iter()).all(|(&b, &d)| b >= 1 && b <= d));
                let count: usize = shape.iter().zip(block.iter()).map(|(d, b)| d.div_ceil(*b)).product();
                assert!(count >= devices.min(shape.size()), "{shape} into {block}");
                assert_eq!(block, manager.compute_block_shape(&shape, DataType::F32));
            }
            manager.system().shutdown();
        }
        Ok(())
    }

    #[test]
    fn test_block_memory_budget() -> Result<(), Box<dyn Error>> {
        let manager = manager(SystemKind::Serial, 1)?;
        let shape = Shape::from([1024, 1024]);
        let block = manager.compute_block_shape(&shape, DataType::F64);
        assert!(block.size() * 8 <= manager.block_memory());
        assert_eq!(manager.compute_block_shape(&Shape::from([10]), DataType::F64), Shape::from([10]));
        Ok(())
    }

    #[tokio::test]
    async fn test_broadcast_add() -> Result<(), Box<dyn Error>> {
        let manager = manager(SystemKind::Workers, 3)?;
        fastrand::seed(11);
        let a: Vec<f64> = (0..16).map(|_| fastrand::f64()).collect();
        let b: Vec<f64> = (0..4).map(|_| fastrand::f64()).collect();
        let x = manager.array_with(&Block::from_vec([4, 4], a.clone())?, [2, 2])?;
        let y = manager.array_with(&Block::from_vec([4], b.clone())?, [2])?;

        let z = manager.map_bop(BinaryFn::Add, &x, &y)?;
        assert_eq!(z.block_shape(), &Shape::from([2, 2]));
        let z = z.fetch().await?;
        let expected = (0..16).map(|i| a[i] + b[i % 4]).collect_vec();
        assert_eq!(z.read::<f64>()?, &expected[..]);

        // a column against a row broadcasts both ways
        let column = manager.array_with(&Block::from_vec([3, 1], vec![1i32, 2, 3])?, [2, 1])?;
        let row = manager.array_with(&Block::from_vec([4], vec![10i32, 20, 30, 40])?, [3])?;
        let sum = manager.map_bop(BinaryFn::Multiply, &column, &row)?;
        assert_eq!(sum.shape(), &Shape::from([3, 4]));
        assert_eq!(sum.block_shape(), &Shape::from([2, 3]));
        let dense = sum.fetch().await?;
        let expected = (1..=3).cartesian_product([10, 20, 30, 40]).map(|(x, y)| x * y).collect_vec();
        assert_eq!(dense.read::<i32>()?, &expected[..]);

        let bad = manager.array_with(&Block::from_vec([3], vec![1.0f64; 3])?, [3])?;
        assert!(manager.map_bop(BinaryFn::Add, &x, &bad).is_err());
        manager.system().shutdown();
        Ok(())
    }

    #[tokio::test]
    async fn test_map_uop() -> Result<(), Box<dyn Error>> {
        let manager = manager(SystemKind::Scheduled, 2)?;
        let x = manager.array_with(&Block::from_vec([5], vec![1.0f32, -4.0, 9.0, f32::NAN, 0.0])?, [2])?;
        let nan = manager.map_uop(UnaryFn::Isnan, &x)?;
        assert_eq!(nan.data_type(), DataType::Bool);
        assert_eq!(nan.fetch().await?.read::<bool>()?, &[false, false, false, true, false]);

        let abs = manager.map_uop(UnaryFn::Absolute, &x)?;
        let int = manager.astype(&abs, DataType::I64)?;
        assert_eq!(int.fetch().await?.read::<i64>()?, &[1, 4, 9, 0, 0]);
        assert_eq!(int.grid(), &x.grid().with_type(DataType::I64));
        manager.system().shutdown();
        Ok(())
    }
}
