//! `mosaic` stores n-dimensional arrays as grids of blocks spread over a set of devices, and
//! evaluates array operations as a graph of per-block kernel calls.
//!
//! ## Key Components
//! 1. **Systems** ([`runtime`]):
//!    - A serial system that runs every kernel inline.
//!    - Worker systems that run kernels on threads, either pinned to devices or freely scheduled.
//!    - Results are lazy handles; a failed kernel fails every dependant, and nothing else.
//!
//! 2. **Placement** ([`grid`]):
//!    - Device grids map block coordinates to devices, cyclically or in packed runs.
//!
//! 3. **Arrays** ([`array`], [`manager`]):
//!    - [`BlockArray`] records geometry and one handle per block.
//!    - [`ComputeManager`] sizes blocks and issues elementwise ops with broadcasting, tree
//!      reductions, blocked tensor contractions and layout changes.
//!
//! 4. **Sessions** ([`context`], [`settings`]):
//!    - [`Context`] builds a system, a device grid and a manager from [`Settings`].
//!
//! Logging goes through the `log` facade; installing a logger is left to the application.

pub mod array;
pub mod block;
pub mod context;
pub mod grid;
pub mod kernels;
pub mod manager;
pub mod num;
pub mod runtime;
pub mod settings;
pub mod shape;

pub use array::{ArrayError, ArrayGrid, BlockArray, BlockRecord};
pub use block::Block;
pub use context::{Context, ContextBuilder};
pub use grid::{DeviceGrid, GridError, GridKind};
pub use manager::ComputeManager;
pub use num::{DataType, Scalar};
pub use runtime::{KernelError, SystemError, SystemKind};
pub use settings::{Settings, SettingsError};
pub use shape::Shape;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Array(#[from] ArrayError),
    #[error(transparent)]
    Kernel(#[from] KernelError),
    #[error(transparent)]
    System(#[from] SystemError),
    #[error(transparent)]
    Grid(#[from] GridError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
}
