use std::{fmt::Debug, sync::Arc};

use bytemuck::{CheckedBitPattern, NoUninit};
use derive_more::Display;
use half::f16;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::block::Buffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum DataType {
    #[display("bool")]
    Bool,
    #[display("i32")]
    I32,
    #[display("i64")]
    I64,
    #[display("f16")]
    F16,
    #[display("f32")]
    F32,
    #[display("f64")]
    F64,
}

impl DataType {
    /// Width of one element in bytes.
    pub const fn size(self) -> usize {
        match self {
            DataType::Bool => 1,
            DataType::I32 => 4,
            DataType::I64 => 8,
            DataType::F16 => 2,
            DataType::F32 => 4,
            DataType::F64 => 8,
        }
    }

    pub const fn is_float(self) -> bool {
        matches!(self, DataType::F16 | DataType::F32 | DataType::F64)
    }

    pub const fn is_integer(self) -> bool {
        matches!(self, DataType::I32 | DataType::I64)
    }

    /// The smallest type both `self` and `other` convert into without losing range.
    pub const fn promote(self, other: Self) -> Self {
        use DataType::*;
        match (self, other) {
            (Bool, x) | (x, Bool) => x,
            (F64, _) | (_, F64) => F64,
            (I32 | I64, F16 | F32) | (F16 | F32, I32 | I64) => F64,
            (F32, _) | (_, F32) => F32,
            (F16, F16) => F16,
            (I64, _) | (_, I64) => I64,
            (I32, I32) => I32,
        }
    }

    /// Type arithmetic is carried out in. Booleans count as integers.
    pub const fn arithmetic(self) -> Self {
        match self {
            DataType::Bool => DataType::I64,
            x => x,
        }
    }

    /// Result type of transcendental ops.
    pub const fn float(self) -> Self {
        match self {
            DataType::F16 | DataType::F32 | DataType::F64 => self,
            _ => DataType::F64,
        }
    }

    /// Type partial reductions accumulate in.
    pub const fn accumulator(self) -> Self {
        match self {
            DataType::F16 | DataType::F32 | DataType::F64 => DataType::F64,
            _ => DataType::I64,
        }
    }

    /// Result type of a sum.
    pub const fn sum(self) -> Self {
        match self {
            DataType::Bool | DataType::I32 | DataType::I64 => DataType::I64,
            x => x,
        }
    }
}

impl std::str::FromStr for DataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bool" => Ok(DataType::Bool),
            "i32" | "int32" => Ok(DataType::I32),
            "i64" | "int64" => Ok(DataType::I64),
            "f16" | "float16" => Ok(DataType::F16),
            "f32" | "float32" => Ok(DataType::F32),
            "f64" | "float64" => Ok(DataType::F64),
            _ => Err(format!("unknown data type `{s}`")),
        }
    }
}

pub trait Zero {
    fn zero() -> Self;
}

pub trait One {
    fn one() -> Self;
}

macro_rules! impl_zero_one {
    ($ty:ty, $zero:expr, $one:expr) => {
        impl Zero for $ty {
            #[inline]
            fn zero() -> Self {
                $zero
            }
        }

        impl One for $ty {
            #[inline]
            fn one() -> Self {
                $one
            }
        }
    };
}

impl_zero_one!(bool, false, true);
impl_zero_one!(i32, 0, 1);
impl_zero_one!(i64, 0, 1);
impl_zero_one!(f16, f16::ZERO, f16::ONE);
impl_zero_one!(f32, 0.0, 1.0);
impl_zero_one!(f64, 0.0, 1.0);

mod sealed {
    use half::f16;

    pub trait Sealed {}

    impl Sealed for bool {}
    impl Sealed for i32 {}
    impl Sealed for i64 {}
    impl Sealed for f16 {}
    impl Sealed for f32 {}
    impl Sealed for f64 {}
}

/// An element type a [`Block`](crate::block::Block) can hold.
pub trait Scalar:
    Debug
    + Copy
    + PartialEq
    + PartialOrd
    + Send
    + Sync
    + NoUninit
    + CheckedBitPattern
    + Zero
    + One
    + sealed::Sealed
    + 'static
{
    const DATA_TYPE: DataType;

    fn from_f64(value: f64) -> Self;
    fn to_f64(self) -> f64;
    fn from_i64(value: i64) -> Self;
    fn to_i64(self) -> i64;

    #[inline]
    fn is_nan(self) -> bool {
        false
    }

    fn into_buffer(data: Arc<[Self]>) -> Buffer;
    fn from_buffer(buffer: &Buffer) -> Option<&Arc<[Self]>>;

    /// Maximum that propagates NaN.
    #[inline]
    fn max_nan(self, rhs: Self) -> Self {
        match (self.is_nan(), rhs.is_nan()) {
            (true, _) => self,
            (_, true) => rhs,
            _ if rhs > self => rhs,
            _ => self,
        }
    }

    /// Minimum that propagates NaN.
    #[inline]
    fn min_nan(self, rhs: Self) -> Self {
        match (self.is_nan(), rhs.is_nan()) {
            (true, _) => self,
            (_, true) => rhs,
            _ if rhs < self => rhs,
            _ => self,
        }
    }

    /// Converts into another scalar type with `as`-like semantics.
    #[inline]
    fn cast<U: Scalar>(self) -> U {
        let through_float = U::DATA_TYPE.is_float()
            || (Self::DATA_TYPE.is_float() && U::DATA_TYPE == DataType::Bool);
        match through_float {
            true => U::from_f64(self.to_f64()),
            false => U::from_i64(self.to_i64()),
        }
    }
}

macro_rules! impl_scalar {
    ($ty:ty, $variant:ident, $from_f64:expr, $to_f64:expr, $from_i64:expr, $to_i64:expr) => {
        impl Scalar for $ty {
            const DATA_TYPE: DataType = DataType::$variant;

            #[inline]
            fn from_f64(value: f64) -> Self {
                $from_f64(value)
            }

            #[inline]
            fn to_f64(self) -> f64 {
                $to_f64(self)
            }

            #[inline]
            fn from_i64(value: i64) -> Self {
                $from_i64(value)
            }

            #[inline]
            fn to_i64(self) -> i64 {
                $to_i64(self)
            }

            #[inline]
            fn is_nan(self) -> bool {
                self.to_f64().is_nan()
            }

            #[inline]
            fn into_buffer(data: Arc<[Self]>) -> Buffer {
                Buffer::$variant(data)
            }

            #[inline]
            fn from_buffer(buffer: &Buffer) -> Option<&Arc<[Self]>> {
                match buffer {
                    Buffer::$variant(data) => Some(data),
                    _ => None,
                }
            }
        }
    };
}

impl_scalar!(
    bool,
    Bool,
    |x: f64| x != 0.0,
    |x: bool| x as u8 as f64,
    |x: i64| x != 0,
    |x: bool| x as i64
);
impl_scalar!(
    i32,
    I32,
    |x: f64| x as i32,
    |x: i32| x as f64,
    |x: i64| x as i32,
    |x: i32| x as i64
);
impl_scalar!(
    i64,
    I64,
    |x: f64| x as i64,
    |x: i64| x as f64,
    |x: i64| x,
    |x: i64| x
);
impl_scalar!(
    f16,
    F16,
    f16::from_f64,
    f16::to_f64,
    |x: i64| f16::from_f64(x as f64),
    |x: f16| x.to_f64() as i64
);
impl_scalar!(
    f32,
    F32,
    |x: f64| x as f32,
    |x: f32| x as f64,
    |x: i64| x as f32,
    |x: f32| x as i64
);
impl_scalar!(
    f64,
    F64,
    |x: f64| x,
    |x: f64| x,
    |x: i64| x as f64,
    |x: f64| x as i64
);

/// Scalars supporting arithmetic. Integer ops wrap on overflow.
pub trait Number: Scalar {
    fn add(self, rhs: Self) -> Self;
    fn sub(self, rhs: Self) -> Self;
    fn mul(self, rhs: Self) -> Self;
    fn pow(self, rhs: Self) -> Self;
    fn neg(self) -> Self;
    fn abs(self) -> Self;
    fn signum(self) -> Self;
    fn floor(self) -> Self;
    fn ceil(self) -> Self;
}

macro_rules! impl_number_int {
    ($ty:ty) => {
        impl Number for $ty {
            #[inline]
            fn add(self, rhs: Self) -> Self {
                self.wrapping_add(rhs)
            }

            #[inline]
            fn sub(self, rhs: Self) -> Self {
                self.wrapping_sub(rhs)
            }

            #[inline]
            fn mul(self, rhs: Self) -> Self {
                self.wrapping_mul(rhs)
            }

            #[inline]
            fn pow(self, rhs: Self) -> Self {
                match u32::try_from(rhs) {
                    Ok(exp) => self.wrapping_pow(exp),
                    Err(_) => 0,
                }
            }

            #[inline]
            fn neg(self) -> Self {
                self.wrapping_neg()
            }

            #[inline]
            fn abs(self) -> Self {
                self.wrapping_abs()
            }

            #[inline]
            fn signum(self) -> Self {
                <$ty>::signum(self)
            }

            #[inline]
            fn floor(self) -> Self {
                self
            }

            #[inline]
            fn ceil(self) -> Self {
                self
            }
        }
    };
}

macro_rules! impl_number_float {
    ($ty:ty) => {
        impl Number for $ty {
            #[inline]
            fn add(self, rhs: Self) -> Self {
                self + rhs
            }

            #[inline]
            fn sub(self, rhs: Self) -> Self {
                self - rhs
            }

            #[inline]
            fn mul(self, rhs: Self) -> Self {
                self * rhs
            }

            #[inline]
            fn pow(self, rhs: Self) -> Self {
                self.powf(rhs)
            }

            #[inline]
            fn neg(self) -> Self {
                -self
            }

            #[inline]
            fn abs(self) -> Self {
                <$ty>::abs(self)
            }

            #[inline]
            fn signum(self) -> Self {
                match self {
                    x if x.is_nan() => x,
                    x if x == 0.0 => 0.0,
                    x => <$ty>::signum(x),
                }
            }

            #[inline]
            fn floor(self) -> Self {
                <$ty>::floor(self)
            }

            #[inline]
            fn ceil(self) -> Self {
                <$ty>::ceil(self)
            }
        }
    };
}

impl_number_int!(i32);
impl_number_int!(i64);
impl_number_float!(f32);
impl_number_float!(f64);

impl Number for f16 {
    #[inline]
    fn add(self, rhs: Self) -> Self {
        self + rhs
    }

    #[inline]
    fn sub(self, rhs: Self) -> Self {
        self - rhs
    }

    #[inline]
    fn mul(self, rhs: Self) -> Self {
        self * rhs
    }

    #[inline]
    fn pow(self, rhs: Self) -> Self {
        f16::from_f32(self.to_f32().powf(rhs.to_f32()))
    }

    #[inline]
    fn neg(self) -> Self {
        -self
    }

    #[inline]
    fn abs(self) -> Self {
        f16::from_f32(self.to_f32().abs())
    }

    #[inline]
    fn signum(self) -> Self {
        f16::from_f32(Number::signum(self.to_f32()))
    }

    #[inline]
    fn floor(self) -> Self {
        f16::from_f32(self.to_f32().floor())
    }

    #[inline]
    fn ceil(self) -> Self {
        f16::from_f32(self.to_f32().ceil())
    }
}

/// Runs `$body` with `$T` aliased to the scalar type for `$type`.
macro_rules! dispatch {
    ($type:expr, $T:ident => $body:expr) => {
        match $type {
            $crate::num::DataType::Bool => {
                type $T = bool;
                $body
            }
            $crate::num::DataType::I32 => {
                type $T = i32;
                $body
            }
            $crate::num::DataType::I64 => {
                type $T = i64;
                $body
            }
            $crate::num::DataType::F16 => {
                type $T = ::half::f16;
                $body
            }
            $crate::num::DataType::F32 => {
                type $T = f32;
                $body
            }
            $crate::num::DataType::F64 => {
                type $T = f64;
                $body
            }
        }
    };
}

/// Like [`dispatch`], but only for [`Number`] types. Booleans take the `else` arm.
macro_rules! dispatch_number {
    ($type:expr, $T:ident => $body:expr, else => $fallback:expr) => {
        match $type {
            $crate::num::DataType::Bool => $fallback,
            $crate::num::DataType::I32 => {
                type $T = i32;
                $body
            }
            $crate::num::DataType::I64 => {
                type $T = i64;
                $body
            }
            $crate::num::DataType::F16 => {
                type $T = ::half::f16;
                $body
            }
            $crate::num::DataType::F32 => {
                type $T = f32;
                $body
            }
            $crate::num::DataType::F64 => {
                type $T = f64;
                $body
            }
        }
    };
}

pub(crate) use dispatch;
pub(crate) use dispatch_number;
