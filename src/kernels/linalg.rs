use itertools::Itertools;

use super::unpack;
use crate::{
    block::Block,
    num::{DataType, Number, dispatch, dispatch_number},
    runtime::{Execute, Kernel, KernelError, Value},
    shape::Shape,
};

fn check_permutation(axes: &[usize], ndim: usize) -> Result<(), KernelError> {
    let valid = axes.len() == ndim && axes.iter().all(|&axis| axis < ndim) && axes.iter().all_unique();
    match valid {
        true => Ok(()),
        false => Err(KernelError::Argument(format!(
            "axes {axes:?} do not permute {ndim} dimensions"
        ))),
    }
}

/// Permutes the axes of `x`. Axis `i` of the result is axis `axes[i]` of `x`.
pub fn transpose_block(x: &Block, axes: &[usize]) -> Result<Block, KernelError> {
    let shape = x.shape();
    check_permutation(axes, shape.len())?;
    if axes.iter().enumerate().all(|(index, &axis)| index == axis) {
        return Ok(x.clone());
    }

    let strides = shape.strides();
    let strides = axes.iter().map(|&axis| strides[axis]).collect_vec();
    let output = Shape::from(axes.iter().map(|&axis| shape[axis]).collect_vec());
    dispatch!(x.data_type(), T => {
        let data = x.read::<T>()?;
        let transposed: Vec<T> = output
            .coords()
            .map(|coord| coord.iter().zip(&strides).map(|(x, s)| x * s).sum::<usize>())
            .map(|index| data[index])
            .collect();
        Block::from_vec(output, transposed)
    })
}

#[derive(Debug, Clone, Kernel)]
#[kernel(crate = "crate")]
pub struct Transpose {
    pub axes: Vec<usize>,
}

impl Execute for Transpose {
    fn execute(&self, args: Vec<Value>) -> Result<Value, KernelError> {
        let [x] = unpack::<1>(self, args)?;
        let x = x.into_block()?;
        transpose_block(&x, &self.axes).map(Value::Block)
    }
}

/// Row-major `(m, k) x (k, n)` product.
fn gemm<T: Number>(a: &[T], b: &[T], m: usize, k: usize, n: usize) -> Vec<T> {
    let mut c = vec![T::zero(); m * n];
    if m == 0 || n == 0 {
        return c;
    }
    let row = |(i, c): (usize, &mut [T])| {
        for p in 0..k {
            let x = a[i * k + p];
            let b = &b[p * n..(p + 1) * n];
            for (c, &y) in c.iter_mut().zip(b) {
                *c = c.add(x.mul(y));
            }
        }
    };

    #[cfg(not(feature = "rayon"))]
    c.chunks_mut(n).enumerate().for_each(row);
    #[cfg(feature = "rayon")]
    {
        use rayon::prelude::*;
        c.par_chunks_mut(n).enumerate().for_each(row);
    }
    c
}

/// Contracts `lhs_axes` of the left block with `rhs_axes` of the right block.
///
/// The result holds the free axes of the left block followed by the free axes of the right one.
#[derive(Debug, Clone, Kernel)]
#[kernel(crate = "crate")]
pub struct Contract {
    pub lhs_axes: Vec<usize>,
    pub rhs_axes: Vec<usize>,
    pub r#type: DataType,
}

impl Execute for Contract {
    fn execute(&self, args: Vec<Value>) -> Result<Value, KernelError> {
        let [lhs, rhs] = unpack::<2>(self, args)?;
        let lhs = lhs.into_block()?.cast(self.r#type);
        let rhs = rhs.into_block()?.cast(self.r#type);

        let (lhs_shape, rhs_shape) = (lhs.shape().clone(), rhs.shape().clone());
        let mismatch = || KernelError::Shape(lhs_shape.clone(), rhs_shape.clone());
        if self.lhs_axes.len() != self.rhs_axes.len() {
            return Err(mismatch());
        }
        for (&x, &y) in self.lhs_axes.iter().zip(&self.rhs_axes) {
            if x >= lhs_shape.len() || y >= rhs_shape.len() || lhs_shape[x] != rhs_shape[y] {
                return Err(mismatch());
            }
        }

        let lhs_free = (0..lhs_shape.len()).filter(|axis| !self.lhs_axes.contains(axis)).collect_vec();
        let rhs_free = (0..rhs_shape.len()).filter(|axis| !self.rhs_axes.contains(axis)).collect_vec();
        let lhs_order = lhs_free.iter().chain(&self.lhs_axes).copied().collect_vec();
        let rhs_order = self.rhs_axes.iter().chain(&rhs_free).copied().collect_vec();
        let lhs = transpose_block(&lhs, &lhs_order)?;
        let rhs = transpose_block(&rhs, &rhs_order)?;

        let m: usize = lhs_free.iter().map(|&axis| lhs_shape[axis]).product();
        let n: usize = rhs_free.iter().map(|&axis| rhs_shape[axis]).product();
        let k: usize = self.lhs_axes.iter().map(|&axis| lhs_shape[axis]).product();
        let shape = lhs_free
            .iter()
            .map(|&axis| lhs_shape[axis])
            .chain(rhs_free.iter().map(|&axis| rhs_shape[axis]))
            .collect_vec();

        let undefined = || KernelError::Argument(format!("contraction is undefined for {}", self.r#type));
        dispatch_number!(self.r#type, T => {
            let output = gemm(lhs.read::<T>()?, rhs.read::<T>()?, m, k, n);
            Block::from_vec(shape, output).map(Value::Block)
        }, else => Err(undefined()))
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::{Contract, transpose_block};
    use crate::{
        block::Block,
        num::DataType,
        runtime::{Execute, KernelError},
        shape::Shape,
    };

    #[test]
    fn test_transpose_block() -> Result<(), Box<dyn Error>> {
        let x = Block::from_vec([2, 3], (0..6).collect::<Vec<i32>>())?;
        let y = transpose_block(&x, &[1, 0])?;
        assert_eq!(y.shape(), &Shape::from([3, 2]));
        assert_eq!(y.read::<i32>()?, &[0, 3, 1, 4, 2, 5]);
        assert!(transpose_block(&x, &[0, 0]).is_err());
        Ok(())
    }

    #[test]
    fn test_contract() -> Result<(), Box<dyn Error>> {
        fastrand::seed(7);
        let (m, k, n) = (3, 4, 5);
        let a: Vec<f64> = (0..m * k).map(|_| fastrand::f64()).collect();
        let b: Vec<f64> = (0..k * n).map(|_| fastrand::f64()).collect();
        let lhs = Block::from_vec([m, k], a.clone())?;
        // store the right operand as (n, k) and contract its last axis
        let rhs = transpose_block(&Block::from_vec([k, n], b.clone())?, &[1, 0])?;

        let kernel = Contract {
            lhs_axes: vec![1],
            rhs_axes: vec![1],
            r#type: DataType::F64,
        };
        let c = kernel.execute(vec![lhs.clone().into(), rhs.into()])?.into_block()?;
        assert_eq!(c.shape(), &Shape::from([m, n]));
        let c = c.read::<f64>()?;
        for i in 0..m {
            for j in 0..n {
                let expected: f64 = (0..k).map(|p| a[i * k + p] * b[p * n + j]).sum();
                assert!((c[i * n + j] - expected).abs() < 1e-12);
            }
        }

        // contracted lengths 4 and 5 disagree
        let short = Block::from_vec([m, n], vec![0.0f64; m * n])?;
        let error = kernel.execute(vec![lhs.into(), short.into()]);
        assert!(matches!(error, Err(KernelError::Shape(..))));
        Ok(())
    }
}
