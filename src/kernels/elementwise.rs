use super::{
    ops::{BinaryFn, UnaryFn},
    unpack,
};
use crate::{
    block::Block,
    num::{DataType, Scalar, dispatch},
    runtime::{Execute, Kernel, KernelError, Value},
};

/// Passes its argument through. Places literal blocks onto devices.
#[derive(Debug, Clone, Kernel)]
#[kernel(crate = "crate")]
pub struct Identity;

impl Execute for Identity {
    fn execute(&self, args: Vec<Value>) -> Result<Value, KernelError> {
        let [x] = unpack::<1>(self, args)?;
        Ok(x)
    }
}

#[derive(Debug, Clone, Kernel)]
#[kernel(crate = "crate")]
pub struct Map {
    pub op: UnaryFn,
}

impl Execute for Map {
    fn execute(&self, args: Vec<Value>) -> Result<Value, KernelError> {
        let [x] = unpack::<1>(self, args)?;
        let x = x.into_block()?;
        self.op.apply(&x).map(Value::Block)
    }
}

/// A binary op on two blocks, broadcasting within the blocks.
#[derive(Debug, Clone, Kernel)]
#[kernel(crate = "crate")]
pub struct Zip {
    pub op: BinaryFn,
}

impl Execute for Zip {
    fn execute(&self, args: Vec<Value>) -> Result<Value, KernelError> {
        let [lhs, rhs] = unpack::<2>(self, args)?;
        let (lhs, rhs) = (lhs.into_block()?, rhs.into_block()?);
        self.op.apply(&lhs, &rhs).map(Value::Block)
    }
}

#[derive(Debug, Clone, Kernel)]
#[kernel(crate = "crate")]
pub struct Astype {
    pub r#type: DataType,
}

impl Execute for Astype {
    fn execute(&self, args: Vec<Value>) -> Result<Value, KernelError> {
        let [x] = unpack::<1>(self, args)?;
        let x = x.into_block()?;
        Ok(x.cast(self.r#type).into())
    }
}

/// Takes elements of the second argument where the first is true and of the third elsewhere,
/// broadcasting within the blocks.
#[derive(Debug, Clone, Kernel)]
#[kernel(crate = "crate")]
pub struct Select;

impl Select {
    fn select<T: Scalar>(cond: &Block, x: &Block, y: &Block) -> Result<Block, KernelError> {
        let shape = cond
            .shape()
            .broadcast(x.shape())
            .and_then(|shape| shape.broadcast(y.shape()))
            .ok_or_else(|| KernelError::Shape(x.shape().clone(), y.shape().clone()))?;
        let [c, a, b] = [cond, x, y].map(|block| block.shape().broadcast_strides(&shape));
        let position = |coord: &[usize], strides: &[usize]| -> usize {
            coord.iter().zip(strides).map(|(x, s)| x * s).sum()
        };

        let (mask, lhs, rhs) = (cond.read::<bool>()?, x.read::<T>()?, y.read::<T>()?);
        let output: Vec<T> = shape
            .coords()
            .map(|coord| match mask[position(&coord, &c)] {
                true => lhs[position(&coord, &a)],
                false => rhs[position(&coord, &b)],
            })
            .collect();
        Block::from_vec(shape, output)
    }
}

impl Execute for Select {
    fn execute(&self, args: Vec<Value>) -> Result<Value, KernelError> {
        let [cond, x, y] = unpack::<3>(self, args)?;
        let (cond, x, y) = (cond.into_block()?, x.into_block()?, y.into_block()?);
        let r#type = x.data_type().promote(y.data_type());
        let cond = cond.cast(DataType::Bool);
        let (x, y) = (x.cast(r#type), y.cast(r#type));
        dispatch!(r#type, T => Self::select::<T>(&cond, &x, &y)).map(Value::Block)
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::{Astype, Map, Select, Zip};
    use crate::{
        block::Block,
        kernels::ops::{BinaryFn, UnaryFn},
        num::DataType,
        runtime::{Execute, KernelError, Value},
    };

    #[test]
    fn test_elementwise_kernels() -> Result<(), Box<dyn Error>> {
        let x = Block::from_vec([3], vec![1.0f64, 4.0, 9.0])?;
        let y = Map { op: UnaryFn::Sqrt }.execute(vec![x.clone().into()])?.into_block()?;
        assert_eq!(y.read::<f64>()?, &[1.0, 2.0, 3.0]);

        let z = Zip { op: BinaryFn::Subtract }
            .execute(vec![x.clone().into(), y.into()])?
            .into_block()?;
        assert_eq!(z.read::<f64>()?, &[0.0, 2.0, 6.0]);

        let z = Astype { r#type: DataType::I32 }.execute(vec![z.into()])?.into_block()?;
        assert_eq!(z.read::<i32>()?, &[0, 2, 6]);

        let error = Zip { op: BinaryFn::Add }.execute(vec![Value::Block(x)]);
        assert_eq!(error.unwrap_err(), KernelError::Arity("zip", 2, 1));
        Ok(())
    }

    #[test]
    fn test_select_broadcast() -> Result<(), Box<dyn Error>> {
        // a column of conditions against a row and a scalar
        let cond = Block::from_vec([2, 1], vec![1i32, 0])?;
        let x = Block::from_vec([3], vec![1.5f64, 2.5, 3.5])?;
        let y = Block::scalar(-1i64);
        let z = Select
            .execute(vec![cond.into(), x.into(), y.into()])?
            .into_block()?;
        assert_eq!(z.data_type(), DataType::F64);
        assert_eq!(z.shape().as_slice(), &[2, 3]);
        assert_eq!(z.read::<f64>()?, &[1.5, 2.5, 3.5, -1.0, -1.0, -1.0]);

        let cond = Block::from_vec([2], vec![true, false])?;
        let x = Block::from_vec([3], vec![0i32; 3])?;
        let error = Select.execute(vec![cond.clone().into(), x.clone().into(), x.into()]);
        assert!(matches!(error, Err(KernelError::Shape(..))));
        let error = Select.execute(vec![cond.into()]);
        assert_eq!(error.unwrap_err(), KernelError::Arity("select", 3, 1));
        Ok(())
    }
}
