use std::cmp::Ordering;

use super::{
    ops::{BinaryFn, ReduceOp, zip},
    unpack,
};
use crate::{
    block::Block,
    num::{DataType, Scalar, dispatch},
    runtime::{Execute, Kernel, KernelError, Value},
    shape::Shape,
};

/// Maps flat indices of a block onto flat indices of its reduction.
#[derive(Debug, Clone)]
struct Folding {
    shape: Shape,
    strides: Vec<usize>,
    reduced: Vec<bool>,
    output: Shape,
    output_strides: Vec<usize>,
}

impl Folding {
    fn new(shape: &Shape, axes: &[usize]) -> Result<Self, KernelError> {
        if let Some(axis) = axes.iter().find(|&&axis| axis >= shape.len()) {
            return Err(KernelError::Argument(format!(
                "axis {axis} out of range for block of shape {shape}"
            )));
        }
        let reduced: Vec<_> = (0..shape.len()).map(|axis| axes.contains(&axis)).collect();
        let output: Shape = shape
            .iter()
            .zip(&reduced)
            .map(|(&dim, &reduced)| if reduced { 1 } else { dim })
            .collect::<Vec<_>>()
            .into();
        Ok(Self {
            strides: shape.strides(),
            shape: shape.clone(),
            reduced,
            output_strides: output.strides(),
            output,
        })
    }

    #[inline]
    fn coord(&self, index: usize, axis: usize) -> usize {
        index / self.strides[axis] % self.shape[axis]
    }

    #[inline]
    fn output(&self, index: usize) -> usize {
        (0..self.shape.len())
            .filter(|&axis| !self.reduced[axis])
            .map(|axis| self.coord(index, axis) * self.output_strides[axis])
            .sum()
    }

    /// Number of elements folded into each output element.
    #[inline]
    fn count(&self) -> usize {
        self.shape.size() / self.output.size()
    }
}

fn fold<T: Scalar>(
    x: &Block,
    folding: &Folding,
    init: T,
    f: impl Fn(T, T) -> T,
) -> Result<Block, KernelError> {
    let data = x.read::<T>()?;
    let mut output = vec![init; folding.output.size()];
    for (index, &value) in data.iter().enumerate() {
        let index = folding.output(index);
        output[index] = f(output[index], value);
    }
    Block::from_vec(folding.output.clone(), output)
}

fn fold_first<T: Scalar>(
    x: &Block,
    folding: &Folding,
    f: impl Fn(T, T) -> T,
) -> Result<Block, KernelError> {
    let data = x.read::<T>()?;
    let mut output: Vec<Option<T>> = vec![None; folding.output.size()];
    for (index, &value) in data.iter().enumerate() {
        let index = folding.output(index);
        output[index] = Some(match output[index] {
            Some(current) => f(current, value),
            None => value,
        });
    }
    let output = output.into_iter().map(|x| x.unwrap_or_else(T::zero)).collect();
    Block::from_vec(folding.output.clone(), output)
}

/// Welford's online algorithm per output element. Returns the mean and the sum of squared deviations.
fn welford(x: &Block, folding: &Folding) -> Result<(Block, Block), KernelError> {
    let x = x.cast(DataType::F64);
    let data = x.read::<f64>()?;
    let mut state = vec![(0usize, 0.0f64, 0.0f64); folding.output.size()];
    for (index, &x) in data.iter().enumerate() {
        let (count, mean, m2) = &mut state[folding.output(index)];
        *count += 1;
        let delta = x - *mean;
        *mean += delta / *count as f64;
        *m2 += delta * (x - *mean);
    }
    let (mean, m2): (Vec<_>, Vec<_>) = state.into_iter().map(|(_, mean, m2)| (mean, m2)).unzip();
    let mean = Block::from_vec(folding.output.clone(), mean)?;
    let m2 = Block::from_vec(folding.output.clone(), m2)?;
    Ok((mean, m2))
}

/// Picks the winning `(value, index)` candidate of an arg reduction.
/// The first NaN wins; ties go to the lower index.
fn pick<T: Scalar>(op: ReduceOp, lhs: (T, i64), rhs: (T, i64)) -> (T, i64) {
    let lower = if lhs.1 <= rhs.1 { lhs } else { rhs };
    match (lhs.0.is_nan(), rhs.0.is_nan()) {
        (true, true) => lower,
        (true, false) => lhs,
        (false, true) => rhs,
        (false, false) => match (op, lhs.0.partial_cmp(&rhs.0)) {
            (ReduceOp::ArgMax, Some(Ordering::Greater)) | (ReduceOp::ArgMin, Some(Ordering::Less)) => lhs,
            (ReduceOp::ArgMax, Some(Ordering::Less)) | (ReduceOp::ArgMin, Some(Ordering::Greater)) => rhs,
            _ => lower,
        },
    }
}

fn arg<T: Scalar>(
    x: &Block,
    folding: &Folding,
    op: ReduceOp,
    offset: &[usize],
    index_strides: &[usize],
) -> Result<Vec<Block>, KernelError> {
    let data = x.read::<T>()?;
    let mut output: Vec<Option<(T, i64)>> = vec![None; folding.output.size()];
    for (local, &value) in data.iter().enumerate() {
        let index: usize = (0..folding.shape.len())
            .map(|axis| (offset[axis] + folding.coord(local, axis)) * index_strides[axis])
            .sum();
        let candidate = (value, index as i64);
        let slot = &mut output[folding.output(local)];
        *slot = Some(match *slot {
            Some(current) => pick(op, current, candidate),
            None => candidate,
        });
    }
    let (values, indices): (Vec<T>, Vec<i64>) = output
        .into_iter()
        .map(|x| x.unwrap_or((T::zero(), 0)))
        .unzip();
    let values = Block::from_vec(folding.output.clone(), values)?;
    let indices = Block::from_vec(folding.output.clone(), indices)?;
    Ok(vec![values, indices])
}

/// First phase of a reduction: folds one block along `axes`, keeping them as size 1.
///
/// `offset` is the block's position in the array, and the index of an arg candidate
/// is the dot product of its global coordinate with `index_strides`.
#[derive(Debug, Clone, Kernel)]
#[kernel(crate = "crate")]
pub struct Reduce {
    pub op: ReduceOp,
    pub axes: Vec<usize>,
    pub offset: Vec<usize>,
    pub index_strides: Vec<usize>,
}

impl Execute for Reduce {
    fn execute(&self, args: Vec<Value>) -> Result<Value, KernelError> {
        let [x] = unpack::<1>(self, args)?;
        let x = x.into_block()?;
        let folding = Folding::new(x.shape(), &self.axes)?;

        let partial = match self.op {
            ReduceOp::Sum => match x.data_type().accumulator() {
                DataType::F64 => vec![fold(&x.cast(DataType::F64), &folding, 0.0f64, |a, b| a + b)?],
                _ => vec![fold(&x.cast(DataType::I64), &folding, 0i64, i64::wrapping_add)?],
            },
            ReduceOp::Mean => {
                let sum = fold(&x.cast(DataType::F64), &folding, 0.0f64, |a, b| a + b)?;
                let count = Block::scalar(folding.count() as i64);
                vec![sum, count]
            }
            ReduceOp::Var | ReduceOp::Std => {
                let (mean, m2) = welford(&x, &folding)?;
                let count = Block::scalar(folding.count() as i64);
                vec![count, mean, m2]
            }
            ReduceOp::Min => dispatch!(x.data_type(), T => vec![fold_first(&x, &folding, T::min_nan)?]),
            ReduceOp::Max => dispatch!(x.data_type(), T => vec![fold_first(&x, &folding, T::max_nan)?]),
            ReduceOp::All => vec![fold(&x.cast(DataType::Bool), &folding, true, |a, b| a && b)?],
            ReduceOp::Any => vec![fold(&x.cast(DataType::Bool), &folding, false, |a, b| a || b)?],
            ReduceOp::ArgMin | ReduceOp::ArgMax => {
                let ndim = x.shape().len();
                if self.offset.len() != ndim || self.index_strides.len() != ndim {
                    return Err(KernelError::Argument(format!(
                        "arg reduction of a {ndim}-d block needs {ndim}-d offset and strides"
                    )));
                }
                let (offset, strides) = (&self.offset, &self.index_strides);
                dispatch!(x.data_type(), T => arg::<T>(&x, &folding, self.op, offset, strides)?)
            }
        };
        Ok(Value::Tuple(partial))
    }
}

fn tuple<const N: usize>(kernel: &dyn Kernel, value: Value) -> Result<[Block; N], KernelError> {
    let blocks = value.into_tuple()?;
    let len = blocks.len();
    blocks
        .try_into()
        .map_err(|_| KernelError::Argument(format!("{} expects a {N}-tuple, got {len}", kernel.name())))
}

/// Second phase of a reduction: merges two partials of the same output block.
///
/// Two plain blocks are summed, which is how partial products of a contraction merge.
#[derive(Debug, Clone, Kernel)]
#[kernel(crate = "crate")]
pub struct Combine {
    pub op: ReduceOp,
}

impl Combine {
    /// Chan's parallel update of `(count, mean, m2)` triples.
    fn variance(&self, lhs: [Block; 3], rhs: [Block; 3]) -> Result<Vec<Block>, KernelError> {
        let [count_a, mean_a, m2_a] = lhs;
        let [count_b, mean_b, m2_b] = rhs;
        let na = count_a.read::<i64>()?[0];
        let nb = count_b.read::<i64>()?[0];
        let n = na + nb;
        let (ma, mb) = (mean_a.read::<f64>()?, mean_b.read::<f64>()?);
        let (m2a, m2b) = (m2_a.read::<f64>()?, m2_b.read::<f64>()?);
        if ma.len() != mb.len() || m2a.len() != m2b.len() {
            return Err(KernelError::Shape(mean_a.shape().clone(), mean_b.shape().clone()));
        }

        let (fa, fb, f) = (na as f64, nb as f64, n as f64);
        let (mean, m2): (Vec<_>, Vec<_>) = itertools::izip!(ma, mb, m2a, m2b)
            .map(|(&ma, &mb, &m2a, &m2b)| {
                let delta = mb - ma;
                let mean = ma + delta * fb / f;
                let m2 = m2a + m2b + delta * delta * fa * fb / f;
                (mean, m2)
            })
            .unzip();
        let shape = mean_a.shape().clone();
        Ok(vec![
            Block::scalar(n),
            Block::from_vec(shape.clone(), mean)?,
            Block::from_vec(shape, m2)?,
        ])
    }

    fn arg(&self, lhs: [Block; 2], rhs: [Block; 2]) -> Result<Vec<Block>, KernelError> {
        let [values_a, indices_a] = lhs;
        let [values_b, indices_b] = rhs;
        let (ia, ib) = (indices_a.read::<i64>()?, indices_b.read::<i64>()?);
        if values_a.shape() != values_b.shape() {
            return Err(KernelError::Shape(values_a.shape().clone(), values_b.shape().clone()));
        }
        dispatch!(values_a.data_type(), T => {
            let (va, vb) = (values_a.read::<T>()?, values_b.read::<T>()?);
            let (values, indices): (Vec<T>, Vec<i64>) = itertools::izip!(va, ia, vb, ib)
                .map(|(&va, &ia, &vb, &ib)| pick(self.op, (va, ia), (vb, ib)))
                .unzip();
            let shape = values_a.shape().clone();
            Ok(vec![Block::from_vec(shape.clone(), values)?, Block::from_vec(shape, indices)?])
        })
    }
}

impl Execute for Combine {
    fn execute(&self, args: Vec<Value>) -> Result<Value, KernelError> {
        let [lhs, rhs] = unpack::<2>(self, args)?;
        if let (Value::Block(lhs), Value::Block(rhs)) = (&lhs, &rhs) {
            return BinaryFn::Add.apply(lhs, rhs).map(Value::Block);
        }

        let partial = match self.op {
            ReduceOp::Sum => {
                let ([lhs], [rhs]) = (tuple::<1>(self, lhs)?, tuple::<1>(self, rhs)?);
                vec![BinaryFn::Add.apply(&lhs, &rhs)?]
            }
            ReduceOp::Mean => {
                let [sum_a, count_a] = tuple::<2>(self, lhs)?;
                let [sum_b, count_b] = tuple::<2>(self, rhs)?;
                vec![
                    BinaryFn::Add.apply(&sum_a, &sum_b)?,
                    BinaryFn::Add.apply(&count_a, &count_b)?,
                ]
            }
            ReduceOp::Var | ReduceOp::Std => {
                self.variance(tuple::<3>(self, lhs)?, tuple::<3>(self, rhs)?)?
            }
            ReduceOp::Min | ReduceOp::Max => {
                let ([lhs], [rhs]) = (tuple::<1>(self, lhs)?, tuple::<1>(self, rhs)?);
                let op = self.op;
                dispatch!(lhs.data_type(), T => vec![zip(&lhs, &rhs, move |x: T, y: T| match op {
                    ReduceOp::Min => x.min_nan(y),
                    _ => x.max_nan(y),
                })?])
            }
            ReduceOp::All => {
                let ([lhs], [rhs]) = (tuple::<1>(self, lhs)?, tuple::<1>(self, rhs)?);
                vec![BinaryFn::LogicalAnd.apply(&lhs, &rhs)?]
            }
            ReduceOp::Any => {
                let ([lhs], [rhs]) = (tuple::<1>(self, lhs)?, tuple::<1>(self, rhs)?);
                vec![BinaryFn::LogicalOr.apply(&lhs, &rhs)?]
            }
            ReduceOp::ArgMin | ReduceOp::ArgMax => {
                self.arg(tuple::<2>(self, lhs)?, tuple::<2>(self, rhs)?)?
            }
        };
        Ok(Value::Tuple(partial))
    }
}

/// Last phase of a reduction: turns the root partial into the result block of `shape`.
#[derive(Debug, Clone, Kernel)]
#[kernel(crate = "crate")]
pub struct Finalize {
    pub op: ReduceOp,
    pub r#type: DataType,
    pub shape: Shape,
    /// Delta degrees of freedom of variance and standard deviation.
    pub ddof: usize,
}

impl Execute for Finalize {
    fn execute(&self, args: Vec<Value>) -> Result<Value, KernelError> {
        let [partial] = unpack::<1>(self, args)?;
        let output = match self.op {
            ReduceOp::Sum | ReduceOp::Min | ReduceOp::Max | ReduceOp::All | ReduceOp::Any => {
                let [value] = tuple::<1>(self, partial)?;
                value.cast(self.r#type)
            }
            ReduceOp::Mean => {
                let [sum, count] = tuple::<2>(self, partial)?;
                let count = count.read::<i64>()?[0] as f64;
                let mean = sum.read::<f64>()?.iter().map(|x| x / count).collect();
                Block::from_vec(sum.shape().clone(), mean)?.cast(self.r#type)
            }
            ReduceOp::Var | ReduceOp::Std => {
                let [count, _, m2] = tuple::<3>(self, partial)?;
                let count = count.read::<i64>()?[0];
                let dof = count - self.ddof as i64;
                let std = self.op == ReduceOp::Std;
                let output = m2
                    .read::<f64>()?
                    .iter()
                    .map(|&m2| match dof > 0 {
                        true if std => (m2 / dof as f64).sqrt(),
                        true => m2 / dof as f64,
                        false => f64::NAN,
                    })
                    .collect();
                Block::from_vec(m2.shape().clone(), output)?.cast(self.r#type)
            }
            ReduceOp::ArgMin | ReduceOp::ArgMax => {
                let [_, indices] = tuple::<2>(self, partial)?;
                indices
            }
        };
        Ok(output.reshape(self.shape.clone())?.into())
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::{Combine, Finalize, Reduce};
    use crate::{
        block::Block,
        kernels::ops::ReduceOp,
        num::DataType,
        runtime::{Execute, Value},
        shape::Shape,
    };

    fn reduce(op: ReduceOp, x: &Block, axes: &[usize], offset: &[usize]) -> Result<Value, Box<dyn Error>> {
        let reduce = Reduce {
            op,
            axes: axes.to_vec(),
            offset: offset.to_vec(),
            index_strides: Shape::from([2, 4]).strides(),
        };
        Ok(reduce.execute(vec![x.clone().into()])?)
    }

    #[test]
    fn test_variance_merge() -> Result<(), Box<dyn Error>> {
        fastrand::seed(42);
        let data: Vec<f64> = (0..8).map(|_| fastrand::f64() * 10.0).collect();
        let lhs = Block::from_vec([1, 3], data[..3].to_vec())?;
        let rhs = Block::from_vec([1, 5], data[3..].to_vec())?;

        let combine = Combine { op: ReduceOp::Var };
        let lhs = reduce(ReduceOp::Var, &lhs, &[1], &[0, 0])?;
        let rhs = reduce(ReduceOp::Var, &rhs, &[1], &[0, 3])?;
        let merged = combine.execute(vec![lhs, rhs])?;
        let finalize = Finalize {
            op: ReduceOp::Var,
            r#type: DataType::F64,
            shape: Shape::from([1]),
            ddof: 1,
        };
        let var = finalize.execute(vec![merged])?.into_block()?.read::<f64>()?[0];

        let mean = data.iter().sum::<f64>() / 8.0;
        let expected = data.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / 7.0;
        assert!((var - expected).abs() < 1e-9, "{var} != {expected}");
        Ok(())
    }

    #[test]
    fn test_arg_ties() -> Result<(), Box<dyn Error>> {
        // a 2x4 array split into two 2x2 blocks; the maximum 5 appears at flat indices 1 and 6
        let lhs = Block::from_vec([2, 2], vec![0i32, 5, 1, 2])?;
        let rhs = Block::from_vec([2, 2], vec![3i32, 4, 5, 5])?;
        let combine = Combine { op: ReduceOp::ArgMax };
        let finalize = Finalize {
            op: ReduceOp::ArgMax,
            r#type: DataType::I64,
            shape: Shape::default(),
            ddof: 0,
        };

        let a = reduce(ReduceOp::ArgMax, &lhs, &[0, 1], &[0, 0])?;
        let b = reduce(ReduceOp::ArgMax, &rhs, &[0, 1], &[0, 2])?;
        let merged = combine.execute(vec![b.clone(), a.clone()])?;
        let index = finalize.clone().execute(vec![merged])?.into_block()?;
        assert_eq!(index.read::<i64>()?, &[1]);

        let nan = Block::from_vec([2, 2], vec![0.0f32, 1.0, f32::NAN, f32::NAN])?;
        let c = reduce(ReduceOp::ArgMin, &nan, &[0, 1], &[0, 2])?;
        let index = finalize.execute(vec![c])?.into_block()?;
        assert_eq!(index.read::<i64>()?, &[6]);
        Ok(())
    }

    #[test]
    fn test_partial_sum() -> Result<(), Box<dyn Error>> {
        let x = Block::from_vec([2, 3], vec![true, false, true, true, true, true])?;
        let partial = reduce(ReduceOp::Sum, &x, &[1], &[0, 0])?.into_tuple()?;
        assert_eq!(partial[0].shape().to_vec(), vec![2, 1]);
        assert_eq!(partial[0].read::<i64>()?, &[2, 3]);

        let all = reduce(ReduceOp::All, &x, &[0], &[0, 0])?.into_tuple()?;
        assert_eq!(all[0].read::<bool>()?, &[true, false, true]);
        Ok(())
    }
}
