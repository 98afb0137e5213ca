use std::{str::FromStr, sync::Arc};

use derive_more::Display;
use futures::{FutureExt, future::Shared};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use kernel::{Execute, Kernel, KernelError, KernelRegistry};
pub use platform::BoxFuture;
pub use serial::SerialSystem;
pub use worker::{Scheduling, WorkerSystem};

use crate::block::Block;

pub mod kernel;
pub mod platform;
pub mod serial;
pub mod worker;

#[derive(Debug, Error)]
pub enum SystemError {
    #[error("system is not running")]
    NotInitialized,
    #[error("system is already running")]
    AlreadyInitialized,
    #[error("unknown device {0}")]
    UnknownDevice(DeviceId),
    #[error("system needs at least one device")]
    NoDevices,
    #[error("failed to build worker runtime: {0}")]
    Runtime(#[from] std::io::Error),
    #[error("unknown system `{0}`; supported are `serial`, `workers` and `scheduled`")]
    Parse(String),
}

/// Identifies one execution slot of a [`System`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("device:{_0}")]
pub struct DeviceId(pub usize);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectTag;

pub type ObjectId = uid::Id<ObjectTag>;

/// What a kernel consumes and produces.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Block(Block),
    Tuple(Vec<Block>),
}

impl Value {
    #[inline]
    pub fn into_block(self) -> Result<Block, KernelError> {
        match self {
            Value::Block(block) => Ok(block),
            Value::Tuple(_) => Err(KernelError::Argument("expected a block, got a tuple".into())),
        }
    }

    #[inline]
    pub fn into_tuple(self) -> Result<Vec<Block>, KernelError> {
        match self {
            Value::Tuple(blocks) => Ok(blocks),
            Value::Block(_) => Err(KernelError::Argument("expected a tuple, got a block".into())),
        }
    }
}

impl From<Block> for Value {
    #[inline]
    fn from(value: Block) -> Self {
        Self::Block(value)
    }
}

type SharedResult = Shared<BoxFuture<'static, Result<Value, KernelError>>>;

/// Handle to the result of a [`System::call`]. May not be resolved yet.
///
/// Clones share the same result; awaiting never re-runs the kernel.
#[derive(Clone)]
pub struct ObjectRef {
    id: ObjectId,
    value: SharedResult,
}

impl std::fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectRef")
            .field("id", &self.id)
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl ObjectRef {
    pub fn resolved(result: Result<Value, KernelError>) -> Self {
        let id = ObjectId::new();
        let value = futures::future::ready(result).boxed().shared();
        // completes on the first poll, after which `peek` sees the result
        let _ = value.clone().now_or_never();
        Self { id, value }
    }

    pub fn pending(receiver: flume::Receiver<Result<Value, KernelError>>) -> Self {
        let id = ObjectId::new();
        let value = async move {
            match receiver.recv_async().await {
                Ok(result) => result,
                Err(_) => Err(KernelError::Disconnected),
            }
        }
        .boxed()
        .shared();
        Self { id, value }
    }

    #[inline]
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// The result, if the handle has already been awaited to completion.
    #[inline]
    pub fn peek(&self) -> Option<&Result<Value, KernelError>> {
        self.value.peek()
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.peek().is_some()
    }

    /// Waits for the result.
    #[inline]
    pub async fn get(&self) -> Result<Value, KernelError> {
        self.value.clone().await
    }
}

/// An argument of a kernel call.
#[derive(Debug, Clone)]
pub enum Arg {
    /// The result of an earlier call. Resolved before the kernel runs.
    Ref(ObjectRef),
    Value(Value),
}

impl From<ObjectRef> for Arg {
    #[inline]
    fn from(value: ObjectRef) -> Self {
        Self::Ref(value)
    }
}

impl From<&ObjectRef> for Arg {
    #[inline]
    fn from(value: &ObjectRef) -> Self {
        Self::Ref(value.clone())
    }
}

impl From<Value> for Arg {
    #[inline]
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<Block> for Arg {
    #[inline]
    fn from(value: Block) -> Self {
        Self::Value(Value::Block(value))
    }
}

/// Waits for every argument. Fails with the first failed dependency.
pub async fn resolve(args: Vec<Arg>) -> Result<Vec<Value>, KernelError> {
    let args = args.into_iter().map(|arg| async move {
        match arg {
            Arg::Ref(object) => object.get().await,
            Arg::Value(value) => Ok(value),
        }
    });
    futures::future::try_join_all(args).await
}

/// An execution substrate: runs kernels on devices and hands back result handles.
pub trait System: std::fmt::Debug + Send + Sync {
    fn init(&self) -> Result<(), SystemError>;

    /// Stops the system. Pending results resolve to [`KernelError::Disconnected`].
    fn shutdown(&self);

    /// Ordered list of devices kernels can be placed on.
    fn devices(&self) -> &[DeviceId];

    /// Submits `kernel` to run on `device` once `args` resolve. Never waits for the kernel.
    fn call(
        &self,
        kernel: Box<dyn Kernel>,
        args: Vec<Arg>,
        device: DeviceId,
    ) -> Result<ObjectRef, SystemError>;

    /// Waits for the result behind `object`, reporting the kernel's failure if it failed.
    fn get(&self, object: &ObjectRef) -> BoxFuture<'static, Result<Value, KernelError>> {
        let object = object.clone();
        async move { object.get().await }.boxed()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum SystemKind {
    /// Runs every kernel on the caller.
    #[default]
    #[display("serial")]
    Serial,
    /// Runs kernels on worker threads, pinned to their devices.
    #[display("workers")]
    Workers,
    /// Runs kernels on worker threads, ignoring the requested device.
    #[display("scheduled")]
    Scheduled,
}

impl FromStr for SystemKind {
    type Err = SystemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "serial" => Ok(Self::Serial),
            "workers" => Ok(Self::Workers),
            "scheduled" => Ok(Self::Scheduled),
            _ => Err(SystemError::Parse(s.into())),
        }
    }
}

impl SystemKind {
    /// Builds the system. `num_devices` is ignored by [`SystemKind::Serial`].
    pub fn build(
        self,
        num_devices: usize,
        registry: Arc<KernelRegistry>,
    ) -> Result<Arc<dyn System>, SystemError> {
        let system: Arc<dyn System> = match self {
            SystemKind::Serial => Arc::new(SerialSystem::new(registry)),
            SystemKind::Workers => {
                Arc::new(WorkerSystem::new(registry, num_devices, Scheduling::Pinned)?)
            }
            SystemKind::Scheduled => {
                Arc::new(WorkerSystem::new(registry, num_devices, Scheduling::Stock)?)
            }
        };
        Ok(system)
    }
}

#[cfg(test)]
mod tests {
    use std::{error::Error, sync::Arc};

    use super::{
        Arg, DeviceId, Execute, Kernel, KernelError, KernelRegistry, ObjectRef, SystemKind, Value,
    };
    use crate::block::Block;

    /// Adds one to every element of an `i64` block.
    #[derive(Debug, Clone, Kernel)]
    #[kernel(crate = "crate")]
    pub struct Increment;

    impl Execute for Increment {
        fn execute(&self, args: Vec<Value>) -> Result<Value, KernelError> {
            let [x] = crate::kernels::unpack::<1>(self, args)?;
            let x = x.into_block()?;
            let data = x.read::<i64>()?.iter().map(|x| x + 1).collect();
            Ok(Block::from_vec(x.shape().clone(), data)?.into())
        }
    }

    #[derive(Debug, Clone, Kernel)]
    #[kernel(crate = "crate", name = "boom")]
    pub struct Panic;

    impl Execute for Panic {
        fn execute(&self, _args: Vec<Value>) -> Result<Value, KernelError> {
            panic!("boom")
        }
    }

    fn registry() -> Arc<KernelRegistry> {
        Arc::new(
            KernelRegistry::new()
                .add_kernel::<Increment>()
                .add_kernel::<Panic>(),
        )
    }

    #[tokio::test]
    async fn test_chain() -> Result<(), Box<dyn Error>> {
        for kind in [SystemKind::Serial, SystemKind::Workers, SystemKind::Scheduled] {
            let system = kind.build(3, registry())?;
            system.init()?;
            let devices = system.devices().to_vec();

            let x = Block::from_vec([4], vec![0i64, 1, 2, 3])?;
            let mut object = system.call(Box::new(Increment), vec![x.into()], devices[0])?;
            for device in devices.iter().cycle().take(10) {
                object = system.call(Box::new(Increment), vec![Arg::Ref(object)], *device)?;
            }
            let value = system.get(&object).await?.into_block()?;
            assert_eq!(value.read::<i64>()?, &[11, 12, 13, 14], "{kind}");

            system.shutdown();
            let x = Block::scalar(0i64);
            assert!(system.call(Box::new(Increment), vec![x.into()], devices[0]).is_err());
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_failure() -> Result<(), Box<dyn Error>> {
        for kind in [SystemKind::Serial, SystemKind::Workers] {
            let system = kind.build(2, registry())?;
            system.init()?;
            let device = system.devices()[0];

            let failed = system.call(Box::new(Panic), vec![], device)?;
            let dependent = system.call(Box::new(Increment), vec![failed.clone().into()], device)?;
            let x = Block::scalar(1i64);
            let independent = system.call(Box::new(Increment), vec![x.into()], device)?;

            let error = system.get(&failed).await.unwrap_err();
            assert_eq!(error, KernelError::Panicked("boom".into()));
            assert_eq!(system.get(&dependent).await.unwrap_err(), error);
            let value = system.get(&independent).await?.into_block()?;
            assert_eq!(value.read::<i64>()?, &[2]);

            assert!(
                system
                    .call(Box::new(Increment), vec![], DeviceId(7))
                    .is_err()
            );
            system.shutdown();
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_serial_unresolved_argument() -> Result<(), Box<dyn Error>> {
        let system = SystemKind::Serial.build(1, registry())?;
        system.init()?;
        assert!(ObjectRef::resolved(Ok(Block::scalar(0i64).into())).is_ready());

        let (sender, receiver) = flume::bounded(1);
        let pending = ObjectRef::pending(receiver);
        assert!(!pending.is_ready());
        let object = system.call(Box::new(Increment), vec![pending.clone().into()], DeviceId(0))?;
        assert!(matches!(
            system.get(&object).await,
            Err(KernelError::Argument(_))
        ));

        sender
            .send(Ok(Block::scalar(1i64).into()))
            .map_err(|_| "receiver dropped")?;
        let object = system.call(Box::new(Increment), vec![pending.into()], DeviceId(0))?;
        let value = system.get(&object).await?.into_block()?;
        assert_eq!(value.read::<i64>()?, &[2]);
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_kernel() -> Result<(), Box<dyn Error>> {
        let system = SystemKind::Serial.build(1, Arc::new(KernelRegistry::new()))?;
        system.init()?;
        let object = system.call(Box::new(Increment), vec![], DeviceId(0))?;
        assert_eq!(
            system.get(&object).await.unwrap_err(),
            KernelError::Unknown("increment")
        );
        Ok(())
    }
}
