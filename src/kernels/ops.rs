use std::fmt::Display;

use crate::{
    block::Block,
    num::{DataType, Number, Scalar, dispatch, dispatch_number},
    runtime::KernelError,
};

/// How an op derives the type it computes in and the type it yields from its input type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeRule {
    /// Computes and yields the input's arithmetic type.
    Same,
    /// Computes and yields a float type.
    Float,
    /// Compares in the input type and yields booleans.
    Predicate,
    /// Computes on booleans.
    Logical,
}

impl TypeRule {
    pub const fn compute(self, input: DataType) -> DataType {
        match self {
            TypeRule::Same => input.arithmetic(),
            TypeRule::Float => input.float(),
            TypeRule::Predicate => input,
            TypeRule::Logical => DataType::Bool,
        }
    }

    pub const fn output(self, input: DataType) -> DataType {
        match self {
            TypeRule::Same => input.arithmetic(),
            TypeRule::Float => input.float(),
            TypeRule::Predicate | TypeRule::Logical => DataType::Bool,
        }
    }
}

macro_rules! op_table {
    ($(#[$attr:meta])* $table:ident { $($variant:ident => $name:literal, $rule:ident;)* }) => {
        $(#[$attr])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $table {
            $($variant,)*
        }

        impl $table {
            pub const ALL: &'static [$table] = &[$($table::$variant,)*];

            pub const fn name(self) -> &'static str {
                match self {
                    $($table::$variant => $name,)*
                }
            }

            pub const fn rule(self) -> TypeRule {
                match self {
                    $($table::$variant => TypeRule::$rule,)*
                }
            }

            /// Type of the op's result on an input of `input`.
            #[inline]
            pub const fn output(self, input: DataType) -> DataType {
                self.rule().output(input)
            }
        }

        impl Display for $table {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.name())
            }
        }
    };
}

op_table!(
    /// Elementwise ops of one operand.
    UnaryFn {
        Negative => "negative", Same;
        Positive => "positive", Same;
        Absolute => "absolute", Same;
        Square => "square", Same;
        Sign => "sign", Same;
        Floor => "floor", Same;
        Ceil => "ceil", Same;
        Sqrt => "sqrt", Float;
        Cbrt => "cbrt", Float;
        Exp => "exp", Float;
        Exp2 => "exp2", Float;
        Expm1 => "expm1", Float;
        Log => "log", Float;
        Log2 => "log2", Float;
        Log10 => "log10", Float;
        Log1p => "log1p", Float;
        Sin => "sin", Float;
        Cos => "cos", Float;
        Tan => "tan", Float;
        Arcsin => "arcsin", Float;
        Arccos => "arccos", Float;
        Arctan => "arctan", Float;
        Sinh => "sinh", Float;
        Cosh => "cosh", Float;
        Tanh => "tanh", Float;
        Arcsinh => "arcsinh", Float;
        Arccosh => "arccosh", Float;
        Arctanh => "arctanh", Float;
        Reciprocal => "reciprocal", Float;
        Rint => "rint", Float;
        Isnan => "isnan", Predicate;
        Isinf => "isinf", Predicate;
        Isfinite => "isfinite", Predicate;
        LogicalNot => "logical_not", Logical;
    }
);

op_table!(
    /// Elementwise ops of two broadcast operands.
    BinaryFn {
        Add => "add", Same;
        Subtract => "subtract", Same;
        Multiply => "multiply", Same;
        Power => "power", Same;
        Maximum => "maximum", Same;
        Minimum => "minimum", Same;
        Divide => "divide", Float;
        Arctan2 => "arctan2", Float;
        Hypot => "hypot", Float;
        Equal => "equal", Predicate;
        NotEqual => "not_equal", Predicate;
        Less => "less", Predicate;
        LessEqual => "less_equal", Predicate;
        Greater => "greater", Predicate;
        GreaterEqual => "greater_equal", Predicate;
        LogicalAnd => "logical_and", Logical;
        LogicalOr => "logical_or", Logical;
        LogicalXor => "logical_xor", Logical;
    }
);

/// Applies `f` to every element.
pub fn map<T: Scalar, U: Scalar>(
    x: &Block,
    f: impl Fn(T) -> U + Send + Sync,
) -> Result<Block, KernelError> {
    let data = x.read::<T>()?;

    #[cfg(not(feature = "rayon"))]
    let output: Vec<U> = data.iter().map(|&x| f(x)).collect();
    #[cfg(feature = "rayon")]
    let output: Vec<U> = {
        use rayon::prelude::*;
        data.par_iter().map(|&x| f(x)).collect()
    };

    Block::from_vec(x.shape().clone(), output)
}

/// Applies `f` to pairs of elements of the broadcast operands.
pub fn zip<T: Scalar, U: Scalar>(
    lhs: &Block,
    rhs: &Block,
    f: impl Fn(T, T) -> U + Send + Sync,
) -> Result<Block, KernelError> {
    let x = lhs.read::<T>()?;
    let y = rhs.read::<T>()?;
    if lhs.shape() == rhs.shape() {
        #[cfg(not(feature = "rayon"))]
        let output: Vec<U> = x.iter().zip(y).map(|(&x, &y)| f(x, y)).collect();
        #[cfg(feature = "rayon")]
        let output: Vec<U> = {
            use rayon::prelude::*;
            x.par_iter().zip(y).map(|(&x, &y)| f(x, y)).collect()
        };
        return Block::from_vec(lhs.shape().clone(), output);
    }

    let shape = lhs
        .shape()
        .broadcast(rhs.shape())
        .ok_or_else(|| KernelError::Shape(lhs.shape().clone(), rhs.shape().clone()))?;
    let strides = shape.strides();
    let lhs_strides = lhs.shape().broadcast_strides(&shape);
    let rhs_strides = rhs.shape().broadcast_strides(&shape);
    let position = |mut index: usize, other: &[usize]| {
        let mut position = 0;
        for (stride, other) in strides.iter().zip(other) {
            position += index / stride * other;
            index %= stride;
        }
        position
    };
    let element = |index: usize| f(x[position(index, &lhs_strides)], y[position(index, &rhs_strides)]);

    #[cfg(not(feature = "rayon"))]
    let output: Vec<U> = (0..shape.size()).map(element).collect();
    #[cfg(feature = "rayon")]
    let output: Vec<U> = {
        use rayon::prelude::*;
        (0..shape.size()).into_par_iter().map(element).collect()
    };

    Block::from_vec(shape, output)
}

impl UnaryFn {
    fn float_fn(self) -> Option<fn(f64) -> f64> {
        use UnaryFn::*;
        let f: fn(f64) -> f64 = match self {
            Sqrt => f64::sqrt,
            Cbrt => f64::cbrt,
            Exp => f64::exp,
            Exp2 => f64::exp2,
            Expm1 => f64::exp_m1,
            Log => f64::ln,
            Log2 => f64::log2,
            Log10 => f64::log10,
            Log1p => f64::ln_1p,
            Sin => f64::sin,
            Cos => f64::cos,
            Tan => f64::tan,
            Arcsin => f64::asin,
            Arccos => f64::acos,
            Arctan => f64::atan,
            Sinh => f64::sinh,
            Cosh => f64::cosh,
            Tanh => f64::tanh,
            Arcsinh => f64::asinh,
            Arccosh => f64::acosh,
            Arctanh => f64::atanh,
            Reciprocal => |x| 1.0 / x,
            Rint => f64::round_ties_even,
            _ => return None,
        };
        Some(f)
    }

    fn number_fn<T: Number>(self) -> Option<fn(T) -> T> {
        use UnaryFn::*;
        let f: fn(T) -> T = match self {
            Negative => <T as Number>::neg,
            Positive => |x| x,
            Absolute => <T as Number>::abs,
            Square => |x| x.mul(x),
            Sign => <T as Number>::signum,
            Floor => <T as Number>::floor,
            Ceil => <T as Number>::ceil,
            _ => return None,
        };
        Some(f)
    }

    fn predicate_fn(self) -> Option<fn(f64) -> bool> {
        use UnaryFn::*;
        let f: fn(f64) -> bool = match self {
            Isnan => f64::is_nan,
            Isinf => f64::is_infinite,
            Isfinite => f64::is_finite,
            _ => return None,
        };
        Some(f)
    }

    fn undefined(self, r#type: DataType) -> KernelError {
        KernelError::Argument(format!("{self} is undefined for {}", r#type))
    }

    pub fn apply(self, x: &Block) -> Result<Block, KernelError> {
        let r#type = self.rule().compute(x.data_type());
        let x = x.cast(r#type);
        match self.rule() {
            TypeRule::Same => dispatch_number!(r#type, T => {
                let f = self.number_fn::<T>().ok_or_else(|| self.undefined(r#type))?;
                map(&x, f)
            }, else => Err(self.undefined(r#type))),
            TypeRule::Float => {
                let f = self.float_fn().ok_or_else(|| self.undefined(r#type))?;
                dispatch_number!(r#type, T => map(&x, |x: T| T::from_f64(f(x.to_f64()))),
                    else => Err(self.undefined(r#type)))
            }
            TypeRule::Predicate => {
                let f = self.predicate_fn().ok_or_else(|| self.undefined(r#type))?;
                dispatch!(r#type, T => map(&x, |x: T| f(x.to_f64())))
            }
            TypeRule::Logical => map(&x, |x: bool| !x),
        }
    }
}

impl BinaryFn {
    fn number_fn<T: Number>(self) -> Option<fn(T, T) -> T> {
        use BinaryFn::*;
        let f: fn(T, T) -> T = match self {
            Add => <T as Number>::add,
            Subtract => <T as Number>::sub,
            Multiply => <T as Number>::mul,
            Power => <T as Number>::pow,
            Maximum => <T as Scalar>::max_nan,
            Minimum => <T as Scalar>::min_nan,
            _ => return None,
        };
        Some(f)
    }

    fn float_fn(self) -> Option<fn(f64, f64) -> f64> {
        use BinaryFn::*;
        let f: fn(f64, f64) -> f64 = match self {
            Divide => |x, y| x / y,
            Arctan2 => f64::atan2,
            Hypot => f64::hypot,
            _ => return None,
        };
        Some(f)
    }

    fn predicate_fn<T: Scalar>(self) -> Option<fn(T, T) -> bool> {
        use BinaryFn::*;
        let f: fn(T, T) -> bool = match self {
            Equal => |x, y| x == y,
            NotEqual => |x, y| x != y,
            Less => |x, y| x < y,
            LessEqual => |x, y| x <= y,
            Greater => |x, y| x > y,
            GreaterEqual => |x, y| x >= y,
            _ => return None,
        };
        Some(f)
    }

    fn logical_fn(self) -> Option<fn(bool, bool) -> bool> {
        use BinaryFn::*;
        let f: fn(bool, bool) -> bool = match self {
            LogicalAnd => |x, y| x && y,
            LogicalOr => |x, y| x || y,
            LogicalXor => |x, y| x ^ y,
            _ => return None,
        };
        Some(f)
    }

    fn undefined(self, r#type: DataType) -> KernelError {
        KernelError::Argument(format!("{self} is undefined for {}", r#type))
    }

    pub fn apply(self, lhs: &Block, rhs: &Block) -> Result<Block, KernelError> {
        let input = lhs.data_type().promote(rhs.data_type());
        let r#type = self.rule().compute(input);
        let (lhs, rhs) = (lhs.cast(r#type), rhs.cast(r#type));
        match self.rule() {
            TypeRule::Same => dispatch_number!(r#type, T => {
                let f = self.number_fn::<T>().ok_or_else(|| self.undefined(r#type))?;
                zip(&lhs, &rhs, f)
            }, else => Err(self.undefined(r#type))),
            TypeRule::Float => {
                let f = self.float_fn().ok_or_else(|| self.undefined(r#type))?;
                dispatch_number!(r#type, T => zip(&lhs, &rhs, |x: T, y: T| T::from_f64(f(x.to_f64(), y.to_f64()))),
                    else => Err(self.undefined(r#type)))
            }
            TypeRule::Predicate => dispatch!(r#type, T => {
                let f = self.predicate_fn::<T>().ok_or_else(|| self.undefined(r#type))?;
                zip(&lhs, &rhs, f)
            }),
            TypeRule::Logical => {
                let f = self.logical_fn().ok_or_else(|| self.undefined(r#type))?;
                zip(&lhs, &rhs, f)
            }
        }
    }
}

/// Reductions along axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    Sum,
    Mean,
    Var,
    Std,
    Min,
    Max,
    All,
    Any,
    ArgMin,
    ArgMax,
}

impl ReduceOp {
    pub const fn name(self) -> &'static str {
        match self {
            ReduceOp::Sum => "sum",
            ReduceOp::Mean => "mean",
            ReduceOp::Var => "var",
            ReduceOp::Std => "std",
            ReduceOp::Min => "min",
            ReduceOp::Max => "max",
            ReduceOp::All => "all",
            ReduceOp::Any => "any",
            ReduceOp::ArgMin => "argmin",
            ReduceOp::ArgMax => "argmax",
        }
    }

    pub const fn output(self, input: DataType) -> DataType {
        match self {
            ReduceOp::Sum => input.sum(),
            ReduceOp::Mean | ReduceOp::Var | ReduceOp::Std => input.float(),
            ReduceOp::Min | ReduceOp::Max => input,
            ReduceOp::All | ReduceOp::Any => DataType::Bool,
            ReduceOp::ArgMin | ReduceOp::ArgMax => DataType::I64,
        }
    }

    #[inline]
    pub const fn is_arg(self) -> bool {
        matches!(self, ReduceOp::ArgMin | ReduceOp::ArgMax)
    }
}

impl Display for ReduceOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::{BinaryFn, UnaryFn};
    use crate::{block::Block, num::DataType};

    #[test]
    fn test_unary_table() -> Result<(), Box<dyn Error>> {
        let x = Block::from_vec([4], vec![-1.5f32, 0.0, 2.25, 4.0])?;
        for &op in UnaryFn::ALL {
            let y = op.apply(&x)?;
            assert_eq!(y.data_type(), op.output(DataType::F32), "{op}");
            assert_eq!(y.shape(), x.shape());
        }
        let y = UnaryFn::Sqrt.apply(&x)?.to_vec::<f32>();
        assert!(y[0].is_nan());
        assert_eq!(&y[1..], &[0.0, 1.5, 2.0]);
        let y = UnaryFn::Absolute.apply(&Block::from_vec([2], vec![true, false])?)?;
        assert_eq!(y.read::<i64>()?, &[1, 0]);
        let y = UnaryFn::Sign.apply(&Block::from_vec([3], vec![-4i32, 0, 9])?)?;
        assert_eq!(y.read::<i32>()?, &[-1, 0, 1]);
        Ok(())
    }

    #[test]
    fn test_binary_broadcast() -> Result<(), Box<dyn Error>> {
        fastrand::seed(42);
        let a: Vec<f64> = (0..12).map(|_| fastrand::f64()).collect();
        let b: Vec<f64> = (0..4).map(|_| fastrand::f64()).collect();
        let lhs = Block::from_vec([3, 4], a.clone())?;
        let rhs = Block::from_vec([4], b.clone())?;
        let y = BinaryFn::Add.apply(&lhs, &rhs)?;
        assert_eq!(y.shape().to_vec(), vec![3, 4]);
        for (index, &y) in y.read::<f64>()?.iter().enumerate() {
            assert_eq!(y, a[index] + b[index % 4]);
        }

        let column = Block::from_vec([3, 1], vec![1i32, 2, 3])?;
        let row = Block::from_vec([1, 2], vec![10i64, 20])?;
        let y = BinaryFn::Multiply.apply(&column, &row)?;
        assert_eq!(y.data_type(), DataType::I64);
        assert_eq!(y.read::<i64>()?, &[10, 20, 20, 40, 30, 60]);

        let y = BinaryFn::Divide.apply(&column, &Block::scalar(2i32))?;
        assert_eq!(y.read::<f64>()?, &[0.5, 1.0, 1.5]);
        let y = BinaryFn::Greater.apply(&column, &Block::scalar(1.5f32))?;
        assert_eq!(y.read::<bool>()?, &[false, true, true]);

        let pair = Block::from_vec([2], vec![1.0f64, 2.0])?;
        assert!(BinaryFn::Add.apply(&lhs, &pair).is_err());
        Ok(())
    }
}
