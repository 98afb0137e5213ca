use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use futures::FutureExt;

use super::{
    Arg, DeviceId, Kernel, KernelError, KernelRegistry, ObjectRef, System, SystemError, Value,
    platform::catch,
};

/// Takes the values of `args` without waiting.
/// A handle another system has not resolved yet is an error, since nothing here would resolve it.
fn resolve_now(args: Vec<Arg>) -> Result<Vec<Value>, KernelError> {
    args.into_iter()
        .map(|arg| match arg {
            Arg::Ref(object) => object.get().now_or_never().unwrap_or_else(|| {
                Err(KernelError::Argument(format!(
                    "object {:?} is not resolved yet",
                    object.id()
                )))
            }),
            Arg::Value(value) => Ok(value),
        })
        .collect()
}

/// Executes every kernel immediately on the calling thread, on a single device.
#[derive(Debug)]
pub struct SerialSystem {
    registry: Arc<KernelRegistry>,
    devices: [DeviceId; 1],
    live: AtomicBool,
}

impl SerialSystem {
    pub fn new(registry: Arc<KernelRegistry>) -> Self {
        Self {
            registry,
            devices: [DeviceId(0)],
            live: AtomicBool::new(false),
        }
    }
}

impl System for SerialSystem {
    fn init(&self) -> Result<(), SystemError> {
        if self.live.swap(true, Ordering::AcqRel) {
            return Err(SystemError::AlreadyInitialized);
        }
        log::info!("serial system started");
        Ok(())
    }

    fn shutdown(&self) {
        self.live.store(false, Ordering::Release);
    }

    #[inline]
    fn devices(&self) -> &[DeviceId] {
        &self.devices
    }

    fn call(
        &self,
        kernel: Box<dyn Kernel>,
        args: Vec<Arg>,
        device: DeviceId,
    ) -> Result<ObjectRef, SystemError> {
        if !self.live.load(Ordering::Acquire) {
            return Err(SystemError::NotInitialized);
        }
        if !self.devices.contains(&device) {
            return Err(SystemError::UnknownDevice(device));
        }
        let result =
            resolve_now(args).and_then(|args| catch(|| self.registry.execute(kernel.as_ref(), args)));
        Ok(ObjectRef::resolved(result))
    }
}
