use std::any::{Any, TypeId};

use dyn_clone::DynClone;
use rustc_hash::FxHashMap as HashMap;
use thiserror::Error;

pub use mosaic_derive::Kernel;

use super::Value;
use crate::{num::DataType, shape::Shape};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum KernelError {
    #[error("unable to execute kernel `{0}`: not registered")]
    Unknown(&'static str),
    #[error("kernel `{0}` expects {1} arguments, got {2}")]
    Arity(&'static str, usize, usize),
    #[error("data type {0} mismatches {1}")]
    Type(DataType, DataType),
    #[error("data len {1} mismatches expected len {0}")]
    Size(usize, usize),
    #[error("shape {0} mismatches {1}")]
    Shape(Shape, Shape),
    #[error("invalid bytes: {0}")]
    Bytes(String),
    #[error("parse error at line {line}: {message}")]
    Parse { line: usize, message: String },
    #[error("kernel `{kernel}` failed: {message}")]
    Failed { kernel: String, message: String },
    #[error("kernel panicked: {0}")]
    Panicked(String),
    #[error("result of a dependency is lost")]
    Disconnected,
    #[error("invalid argument: {0}")]
    Argument(String),
}

/// A unit of work a [`System`](super::System) can run on a block.
///
/// Derive it with `#[derive(Kernel)]`; the name defaults to the snake-cased type name.
pub trait Kernel: Any + std::fmt::Debug + DynClone + Send + Sync {
    fn name(&self) -> &'static str;
    fn as_any(&self) -> &dyn Any;
}

dyn_clone::clone_trait_object!(Kernel);

impl<'a> dyn Kernel + 'a {
    #[inline]
    pub fn downcast_ref<K: Kernel>(&self) -> Option<&K> {
        self.as_any().downcast_ref()
    }
}

/// Implemented for each [`Kernel`] the CPU backend is able to run.
pub trait Execute: Kernel {
    fn execute(&self, args: Vec<Value>) -> Result<Value, KernelError>;
}

type KernelFn = fn(&dyn Kernel, Vec<Value>) -> Result<Value, KernelError>;

/// Maps kernel types to their executions.
#[derive(Debug, Default, Clone)]
pub struct KernelRegistry {
    kernels: HashMap<TypeId, KernelFn>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_kernel<K: Execute>(mut self) -> Self {
        let id = TypeId::of::<K>();
        let f: KernelFn = |kernel: &dyn Kernel, args: Vec<Value>| match kernel.downcast_ref::<K>() {
            Some(kernel) => kernel.execute(args),
            None => unreachable!(),
        };
        self.kernels.insert(id, f);
        self
    }

    #[inline]
    pub fn contains<K: Kernel>(&self) -> bool {
        self.kernels.contains_key(&TypeId::of::<K>())
    }

    pub fn execute(&self, kernel: &dyn Kernel, args: Vec<Value>) -> Result<Value, KernelError> {
        let id = Any::type_id(kernel.as_any());
        match self.kernels.get(&id) {
            Some(f) => f(kernel, args),
            None => {
                log::error!("unable to execute kernel {}", kernel.name());
                Err(KernelError::Unknown(kernel.name()))
            }
        }
    }
}
