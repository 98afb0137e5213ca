//! Kernels that run on single blocks, and the CPU implementations of them.

pub use create::{Arange, Eye, Fill, ParseText};
pub use elementwise::{Astype, Identity, Map, Select, Zip};
pub use layout::{Diagonal, Gather, Piece, Regroup, Relabel, Run};
pub use linalg::{Contract, Transpose};
pub use ops::{BinaryFn, ReduceOp, TypeRule, UnaryFn};
pub use reduce::{Combine, Finalize, Reduce};

use crate::runtime::{Kernel, KernelError, KernelRegistry, Value};

pub mod create;
pub mod elementwise;
pub mod layout;
pub mod linalg;
pub mod ops;
pub mod reduce;

/// Splits the arguments of `kernel` into exactly `N` values.
pub fn unpack<const N: usize>(kernel: &dyn Kernel, args: Vec<Value>) -> Result<[Value; N], KernelError> {
    let len = args.len();
    args.try_into()
        .map_err(|_| KernelError::Arity(kernel.name(), N, len))
}

impl KernelRegistry {
    /// Registers every kernel the compute manager issues.
    pub fn add_default_kernels(self) -> Self {
        self.add_kernel::<Identity>()
            .add_kernel::<Map>()
            .add_kernel::<Zip>()
            .add_kernel::<Select>()
            .add_kernel::<Astype>()
            .add_kernel::<Fill>()
            .add_kernel::<Arange>()
            .add_kernel::<Eye>()
            .add_kernel::<ParseText>()
            .add_kernel::<Reduce>()
            .add_kernel::<Combine>()
            .add_kernel::<Finalize>()
            .add_kernel::<Contract>()
            .add_kernel::<Transpose>()
            .add_kernel::<Gather>()
            .add_kernel::<Diagonal>()
            .add_kernel::<Regroup>()
            .add_kernel::<Relabel>()
    }
}
