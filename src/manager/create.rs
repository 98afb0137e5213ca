use std::sync::Arc;

use itertools::Itertools;

use super::ComputeManager;
use crate::{
    Error,
    array::{ArrayError, ArrayGrid, BlockArray, BlockRecord},
    block::{Block, copy_region},
    kernels::{Arange, BinaryFn, Diagonal, Eye, Fill, Identity, ParseText, Piece, Run, Select, UnaryFn},
    num::{DataType, Zero, dispatch},
    runtime::{Arg, Execute, KernelError, Value},
    shape::Shape,
};

/// Copies the window at `offset` with `extent` out of `block`.
fn window(block: &Block, offset: &[usize], extent: &[usize]) -> Result<Block, KernelError> {
    if block.shape().as_slice() == extent {
        return Ok(block.clone());
    }
    dispatch!(block.data_type(), T => {
        let mut data = vec![T::zero(); extent.iter().product()];
        let zero = vec![0; extent.len()];
        copy_region(block.read::<T>()?, block.shape(), offset, &mut data, extent, &zero, extent);
        Block::from_vec(extent.to_vec(), data)
    })
}

impl ComputeManager {
    /// Issues `kernel` for every block of `grid` on the block's assigned device.
    fn generate<K: Execute + Clone>(
        &self,
        grid: ArrayGrid,
        kernel: impl Fn(&[usize], Vec<usize>) -> K,
    ) -> Result<BlockArray, Error> {
        let blocks: Vec<_> = grid
            .coords()
            .map(|coord| {
                let device = self.place(&grid, &coord);
                let kernel = kernel(&grid.offset(&coord), grid.extent(&coord));
                self.record(&grid, &coord, kernel, vec![], device)
            })
            .try_collect()?;
        Ok(BlockArray::new(grid, blocks)?)
    }

    /// Distributes a local block with a block shape from [`ComputeManager::compute_block_shape`].
    pub fn array(&self, block: &Block) -> Result<BlockArray, Error> {
        let block_shape = self.compute_block_shape(block.shape(), block.data_type());
        self.array_with(block, block_shape)
    }

    /// Distributes a local block in blocks of `block_shape`.
    pub fn array_with(&self, block: &Block, block_shape: impl Into<Shape>) -> Result<BlockArray, Error> {
        let grid = ArrayGrid::new(block.shape().clone(), block_shape, block.data_type())?;
        let blocks: Vec<_> = grid
            .coords()
            .map(|coord| -> Result<BlockRecord, Error> {
                let part = window(block, &grid.offset(&coord), &grid.extent(&coord))?;
                let device = self.place(&grid, &coord);
                Ok(self.record(&grid, &coord, Identity, vec![Arg::Value(part.into())], device)?)
            })
            .try_collect()?;
        Ok(BlockArray::new(grid, blocks)?)
    }

    /// An array of `shape` with every element `value`.
    pub fn full(&self, shape: impl Into<Shape>, value: f64, r#type: DataType) -> Result<BlockArray, Error> {
        let shape = shape.into();
        let block_shape = self.compute_block_shape(&shape, r#type);
        let grid = ArrayGrid::new(shape, block_shape, r#type)?;
        self.generate(grid, |_, extent| Fill {
            shape: extent.into(),
            r#type,
            value,
        })
    }

    pub fn zeros(&self, shape: impl Into<Shape>, r#type: DataType) -> Result<BlockArray, Error> {
        self.full(shape, 0.0, r#type)
    }

    pub fn ones(&self, shape: impl Into<Shape>, r#type: DataType) -> Result<BlockArray, Error> {
        self.full(shape, 1.0, r#type)
    }

    /// An array whose values are unspecified. Currently zero-filled.
    pub fn empty(&self, shape: impl Into<Shape>, r#type: DataType) -> Result<BlockArray, Error> {
        self.zeros(shape, r#type)
    }

    /// An array with the geometry and type of `x`, every element `value`.
    pub fn full_like(&self, x: &BlockArray, value: f64) -> Result<BlockArray, Error> {
        let r#type = x.data_type();
        self.generate(x.grid().clone(), |_, extent| Fill {
            shape: extent.into(),
            r#type,
            value,
        })
    }

    pub fn zeros_like(&self, x: &BlockArray) -> Result<BlockArray, Error> {
        self.full_like(x, 0.0)
    }

    pub fn ones_like(&self, x: &BlockArray) -> Result<BlockArray, Error> {
        self.full_like(x, 1.0)
    }

    /// Like [`ComputeManager::empty`], zero-filled.
    pub fn empty_like(&self, x: &BlockArray) -> Result<BlockArray, Error> {
        self.zeros_like(x)
    }

    fn range(&self, start: f64, step: f64, len: usize, r#type: DataType) -> Result<BlockArray, Error> {
        let shape = Shape::from([len]);
        let block_shape = self.compute_block_shape(&shape, r#type);
        let grid = ArrayGrid::new(shape, block_shape, r#type)?;
        self.generate(grid, |offset, extent| Arange {
            start,
            step,
            offset: offset[0],
            len: extent[0],
            r#type,
        })
    }

    /// Values from `start` up to `stop`, exclusive, spaced by `step`.
    pub fn arange(&self, start: f64, stop: f64, step: f64, r#type: DataType) -> Result<BlockArray, Error> {
        if step == 0.0 || !step.is_finite() {
            return Err(ArrayError::Step.into());
        }
        let len = ((stop - start) / step).ceil();
        if !(len >= 1.0) {
            return Err(ArrayError::EmptyAxis(Shape::from([0])).into());
        }
        self.range(start, step, len as usize, r#type)
    }

    /// `num` evenly spaced values from `start` to `stop`, which is included if `endpoint` is set.
    pub fn linspace(
        &self,
        start: f64,
        stop: f64,
        num: usize,
        endpoint: bool,
        r#type: DataType,
    ) -> Result<BlockArray, Error> {
        let step = match (num, endpoint) {
            (0, _) => return Err(ArrayError::EmptyAxis(Shape::from([0])).into()),
            (1, true) => 0.0,
            (num, true) => (stop - start) / (num - 1) as f64,
            (num, false) => (stop - start) / num as f64,
        };
        self.range(start, step, num, r#type)
    }

    /// `base` raised to `num` evenly spaced exponents from `start` to `stop`.
    pub fn logspace(
        &self,
        start: f64,
        stop: f64,
        num: usize,
        endpoint: bool,
        base: f64,
        r#type: DataType,
    ) -> Result<BlockArray, Error> {
        let exponents = self.linspace(start, stop, num, endpoint, DataType::F64)?;
        let base = self.full(Shape::default(), base, DataType::F64)?;
        let values = self.map_bop(BinaryFn::Power, &base, &exponents)?;
        self.astype(&values, r#type)
    }

    /// An `n` by `m` array with ones on the diagonal.
    pub fn eye(&self, n: usize, m: usize, r#type: DataType) -> Result<BlockArray, Error> {
        let shape = Shape::from([n, m]);
        let block_shape = self.compute_block_shape(&shape, r#type);
        let grid = ArrayGrid::new(shape, block_shape, r#type)?;
        self.generate(grid, |offset, extent| Eye {
            shape: extent.into(),
            offset: offset.to_vec(),
            r#type,
        })
    }

    pub fn identity(&self, n: usize, r#type: DataType) -> Result<BlockArray, Error> {
        self.eye(n, n, r#type)
    }

    /// Issues one [`Diagonal`] kernel for the block at `coord` of `grid`, taking a run from every
    /// block of `x` that `run` accepts. `run` sees the offset and extent of each source block.
    fn diagonal_block(
        &self,
        grid: &ArrayGrid,
        coord: &[usize],
        x: &BlockArray,
        run: impl Fn(&[usize], &[usize]) -> Option<Run>,
    ) -> Result<BlockRecord, Error> {
        let (runs, args): (Vec<_>, Vec<_>) = x
            .grid()
            .coords()
            .zip_eq(x.blocks().iter())
            .filter_map(|(source, record)| {
                let step = run(&x.grid().offset(&source), &x.grid().extent(&source))?;
                Some((step, Arg::from(&record.object)))
            })
            .unzip();
        let kernel = Diagonal {
            shape: grid.extent(coord).into(),
            r#type: grid.data_type(),
            runs,
        };
        let device = self.place(grid, coord);
        Ok(self.record(grid, coord, kernel, args, device)?)
    }

    /// A square array with `x` on its diagonal if `x` is a vector, or the diagonal of `x` if it
    /// is a matrix.
    pub fn diag(&self, x: &BlockArray) -> Result<BlockArray, Error> {
        let r#type = x.data_type();
        let (shape, square) = match x.shape().as_slice() {
            &[n] => (Shape::from([n, n]), true),
            &[n, m] => (Shape::from([n.min(m)]), false),
            _ => return Err(ArrayError::Unsupported(format!("diag of a {}-d array", x.ndim())).into()),
        };
        let block_shape = self.compute_block_shape(&shape, r#type);
        let grid = ArrayGrid::new(shape, block_shape, r#type)?;

        let blocks: Vec<_> = grid
            .coords()
            .map(|coord| {
                let offset = grid.offset(&coord);
                let extent = grid.extent(&coord);
                match square {
                    // diagonal indices crossing this block, taken from the vector blocks they live in
                    true => {
                        let lo = offset[0].max(offset[1]);
                        let hi = (offset[0] + extent[0]).min(offset[1] + extent[1]);
                        self.diagonal_block(&grid, &coord, x, |src, span| {
                            let (start, end) = (lo.max(src[0]), hi.min(src[0] + span[0]));
                            (start < end).then(|| Run {
                                src: vec![start - src[0]],
                                dst: vec![start - offset[0], start - offset[1]],
                                len: end - start,
                            })
                        })
                    }
                    false => {
                        let (lo, hi) = (offset[0], offset[0] + extent[0]);
                        self.diagonal_block(&grid, &coord, x, |src, span| {
                            let start = lo.max(src[0]).max(src[1]);
                            let end = hi.min(src[0] + span[0]).min(src[1] + span[1]);
                            (start < end).then(|| Run {
                                src: vec![start - src[0], start - src[1]],
                                dst: vec![start - lo],
                                len: end - start,
                            })
                        })
                    }
                }
            })
            .try_collect()?;
        log::debug!("diag of {} into {} blocks", x.shape(), blocks.len());
        Ok(BlockArray::new(grid, blocks)?)
    }

    /// Elements of `x` where `cond` is true and of `y` elsewhere, under broadcasting.
    pub fn r#where(&self, cond: &BlockArray, x: &BlockArray, y: &BlockArray) -> Result<BlockArray, Error> {
        let r#type = x.data_type().promote(y.data_type());
        self.zip_blocks(Select, &[cond, x, y], r#type)
    }

    /// Reads an array of `shape` from native-endian bytes.
    pub fn frombuffer(&self, bytes: &[u8], shape: impl Into<Shape>, r#type: DataType) -> Result<BlockArray, Error> {
        let block = Block::from_bytes(shape, r#type, bytes)?;
        self.array(&block)
    }

    /// Parses delimited text into a 2-d array with one row per data line.
    ///
    /// Each device parses one chunk of lines. If any chunk fails, the whole text is parsed again
    /// locally, and that parse reports the error.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn loadtxt(
        &self,
        text: &str,
        delimiter: Option<char>,
        r#type: DataType,
    ) -> Result<BlockArray, Error> {
        let lines = text.lines().collect_vec();
        let devices = self.devices();
        let size = lines.len().div_ceil(devices.len()).max(1);

        let mut chunks = vec![];
        for (index, chunk) in lines.chunks(size).enumerate() {
            let kernel = ParseText {
                text: Arc::from(chunk.join("\n")),
                delimiter,
                r#type,
                first_line: index * size + 1,
            };
            let device = devices[index % devices.len()];
            chunks.push((self.call(kernel, vec![], device)?, device));
        }

        let results = futures::future::try_join_all(chunks.iter().map(|(object, _)| object.get())).await;
        let parsed = results.and_then(|values| {
            let blocks: Vec<_> = values.into_iter().map(Value::into_block).try_collect()?;
            let columns = blocks
                .iter()
                .filter(|block| block.shape()[0] > 0)
                .map(|block| block.shape()[1])
                .all_equal_value();
            match columns {
                Ok(columns) => Ok((blocks, columns)),
                Err(None) => Ok((blocks, 0)),
                Err(Some((x, y))) => Err(KernelError::Parse {
                    line: 0,
                    message: format!("chunks have {x} and {y} columns"),
                }),
            }
        });

        let (blocks, columns) = match parsed {
            Ok(parsed) => parsed,
            Err(err) => {
                log::warn!("distributed parse failed: {err}; parsing locally");
                let kernel = ParseText {
                    text: Arc::from(text),
                    delimiter,
                    r#type,
                    first_line: 1,
                };
                let block = kernel.execute(vec![])?.into_block()?;
                if block.is_empty() {
                    return Err(ArrayError::EmptyAxis(block.shape().clone()).into());
                }
                return self.array(&block);
            }
        };

        let rows: usize = blocks.iter().map(|block| block.shape()[0]).sum();
        let shape = Shape::from([rows, columns]);
        if rows == 0 || columns == 0 {
            return Err(ArrayError::EmptyAxis(shape).into());
        }
        log::debug!("parsed {rows} rows in {} chunks", blocks.len());

        // stitch the parsed chunks into evenly sized blocks
        let block_shape = self.compute_block_shape(&shape, r#type);
        let grid = ArrayGrid::new(shape, block_shape, r#type)?;
        let sources = chunks
            .into_iter()
            .zip_eq(&blocks)
            .scan(0, |start, ((object, device), block)| {
                let rows = block.shape()[0];
                let record = BlockRecord {
                    device,
                    object,
                    shape: block.shape().clone(),
                };
                let range = *start..*start + rows;
                *start += rows;
                Some((record, range))
            })
            .filter(|(_, range)| !range.is_empty())
            .collect_vec();
        let records: Vec<_> = grid
            .coords()
            .map(|coord| {
                let offset = grid.offset(&coord);
                let extent = grid.extent(&coord);
                let (lo, hi) = (offset[0], offset[0] + extent[0]);
                let pieces = sources
                    .iter()
                    .filter(|(_, range)| range.start < hi && lo < range.end)
                    .map(|(record, range)| {
                        let (start, end) = (lo.max(range.start), hi.min(range.end));
                        let piece = Piece {
                            src_offset: vec![start - range.start, offset[1]],
                            dst_offset: vec![start - lo, 0],
                            extent: vec![end - start, extent[1]],
                        };
                        (record.clone(), piece)
                    })
                    .collect_vec();
                self.emit(&grid, &coord, pieces)
            })
            .try_collect()?;
        Ok(BlockArray::new(grid, records)?)
    }

    /// Whether `|a - b| <= atol + rtol * |b|` holds everywhere, under broadcasting.
    pub async fn allclose(&self, a: &BlockArray, b: &BlockArray, rtol: f64, atol: f64) -> Result<bool, Error> {
        let scalar = |value: f64| self.full(Shape::default(), value, DataType::F64);
        let diff = self.map_bop(BinaryFn::Subtract, a, b)?;
        let diff = self.map_uop(UnaryFn::Absolute, &diff)?;
        let scale = self.map_uop(UnaryFn::Absolute, b)?;
        let scale = self.map_bop(BinaryFn::Multiply, &scalar(rtol)?, &scale)?;
        let bound = self.map_bop(BinaryFn::Add, &scalar(atol)?, &scale)?;
        let close = self.map_bop(BinaryFn::LessEqual, &diff, &bound)?;
        self.all(&close, None, false)?.item::<bool>().await
    }
}
