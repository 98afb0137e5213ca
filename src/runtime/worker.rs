use std::sync::{Arc, RwLock};

use super::{
    Arg, DeviceId, Kernel, KernelError, KernelRegistry, ObjectRef, System, SystemError, Value,
    platform::catch, resolve,
};

/// How a [`WorkerSystem`] assigns tasks to workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheduling {
    /// Each device owns a worker that runs its tasks in submission order.
    Pinned,
    /// All workers drain one shared queue; the requested device is ignored.
    Stock,
}

#[derive(Debug)]
struct Task {
    kernel: Box<dyn Kernel>,
    args: Vec<Arg>,
    sender: flume::Sender<Result<Value, KernelError>>,
}

#[derive(Debug)]
struct Workers {
    runtime: tokio::runtime::Runtime,
    senders: Vec<flume::Sender<Task>>,
}

/// Runs kernels on a pool of worker threads, one per device.
#[derive(Debug)]
pub struct WorkerSystem {
    registry: Arc<KernelRegistry>,
    scheduling: Scheduling,
    devices: Vec<DeviceId>,
    workers: RwLock<Option<Workers>>,
}

impl WorkerSystem {
    pub fn new(
        registry: Arc<KernelRegistry>,
        num_devices: usize,
        scheduling: Scheduling,
    ) -> Result<Self, SystemError> {
        if num_devices == 0 {
            return Err(SystemError::NoDevices);
        }
        let devices = (0..num_devices).map(DeviceId).collect();
        let workers = RwLock::new(None);
        Ok(Self {
            registry,
            scheduling,
            devices,
            workers,
        })
    }

    #[inline]
    pub fn scheduling(&self) -> Scheduling {
        self.scheduling
    }
}

impl System for WorkerSystem {
    fn init(&self) -> Result<(), SystemError> {
        let mut workers = self.workers.write().expect("failed to lock");
        if workers.is_some() {
            return Err(SystemError::AlreadyInitialized);
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.devices.len())
            .thread_name("mosaic-worker")
            .build()?;
        let senders = match self.scheduling {
            Scheduling::Pinned => self
                .devices
                .iter()
                .map(|&device| {
                    let (sender, receiver) = flume::unbounded();
                    runtime.spawn(serve(device, self.registry.clone(), receiver));
                    sender
                })
                .collect(),
            Scheduling::Stock => {
                let (sender, receiver) = flume::unbounded();
                for &device in &self.devices {
                    runtime.spawn(serve(device, self.registry.clone(), receiver.clone()));
                }
                vec![sender]
            }
        };

        log::info!(
            "worker system started with {} devices ({:?})",
            self.devices.len(),
            self.scheduling
        );
        *workers = Some(Workers { runtime, senders });
        Ok(())
    }

    fn shutdown(&self) {
        let workers = self.workers.write().expect("failed to lock").take();
        if let Some(Workers { runtime, senders }) = workers {
            drop(senders);
            runtime.shutdown_background();
            log::info!("worker system stopped");
        }
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
        let workers = self.workers.read().expect("failed to lock");
        let Some(workers) = workers.as_ref() else {
            return Err(SystemError::NotInitialized);
        };
        let index = self
            .devices
            .iter()
            .position(|&x| x == device)
            .ok_or(SystemError::UnknownDevice(device))?;
        let queue = match self.scheduling {
            Scheduling::Pinned => &workers.senders[index],
            Scheduling::Stock => &workers.senders[0],
        };

        let (sender, receiver) = flume::bounded(1);
        let task = Task {
            kernel,
            args,
            sender,
        };
        if queue.send(task).is_err() {
            return Err(SystemError::NotInitialized);
        }
        Ok(ObjectRef::pending(receiver))
    }
}

impl Drop for WorkerSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn serve(device: DeviceId, registry: Arc<KernelRegistry>, receiver: flume::Receiver<Task>) {
    while let Ok(task) = receiver.recv_async().await {
        let Task {
            kernel,
            args,
            sender,
        } = task;
        let name = kernel.name();

        let result = match resolve(args).await {
            Ok(args) => {
                let registry = registry.clone();
                let start = instant::Instant::now();
                let handle = tokio::task::spawn_blocking(move || {
                    catch(|| registry.execute(kernel.as_ref(), args))
                });
                let result = match handle.await {
                    Ok(result) => result,
                    Err(err) => Err(KernelError::Panicked(err.to_string())),
                };
                log::trace!("{device}: {name} finished in {:?}", start.elapsed());
                result
            }
            Err(err) => {
                log::trace!("{device}: {name} skipped, a dependency failed: {err}");
                Err(err)
            }
        };
        _ = sender.send_async(result).await;
    }
}
