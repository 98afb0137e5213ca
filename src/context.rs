use std::sync::Arc;

use derive_more::Deref;

use crate::{Error, manager::ComputeManager, runtime::KernelRegistry, settings::Settings};

type Hook = Box<dyn FnOnce(&Context) -> Result<(), Error> + Send>;

/// A running session: one system, one device grid and the manager driving them.
///
/// Dropping the context shuts its system down.
#[derive(Debug, Deref)]
pub struct Context {
    settings: Settings,
    #[deref]
    manager: ComputeManager,
}

impl Context {
    pub fn builder(settings: Settings) -> ContextBuilder {
        ContextBuilder::new(settings)
    }

    #[inline]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    #[inline]
    pub fn manager(&self) -> &ComputeManager {
        &self.manager
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        log::info!("shutting down {} system", self.settings.system);
        self.manager.system().shutdown();
    }
}

pub struct ContextBuilder {
    settings: Settings,
    registry: KernelRegistry,
    hooks: Vec<Hook>,
}

impl std::fmt::Debug for ContextBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextBuilder")
            .field("settings", &self.settings)
            .field("hooks", &self.hooks.len())
            .finish_non_exhaustive()
    }
}

impl ContextBuilder {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            registry: KernelRegistry::new().add_default_kernels(),
            hooks: vec![],
        }
    }

    /// Extends the kernel registry, starting from the built-in kernels.
    pub fn registry(mut self, f: impl FnOnce(KernelRegistry) -> KernelRegistry) -> Self {
        self.registry = f(self.registry);
        self
    }

    /// Adds a hook that runs once on the new context. Hooks run in the order they are added.
    pub fn on_create(mut self, hook: impl FnOnce(&Context) -> Result<(), Error> + Send + 'static) -> Self {
        self.hooks.push(Box::new(hook));
        self
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub fn build(self) -> Result<Context, Error> {
        let Self {
            settings,
            registry,
            hooks,
        } = self;
        settings.validate()?;

        let system = settings
            .system
            .build(settings.num_devices, Arc::new(registry))?;
        system.init()?;
        log::info!(
            "started {} system with {} devices",
            settings.system,
            system.devices().len()
        );

        let grid = match settings
            .device_grid
            .build(settings.cluster_shape.clone(), system.devices().to_vec())
        {
            Ok(grid) => grid,
            Err(err) => {
                system.shutdown();
                return Err(err.into());
            }
        };
        let manager = ComputeManager::new(system, grid, settings.block_memory);
        let context = Context { settings, manager };

        for hook in hooks {
            hook(&context)?;
        }
        Ok(context)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        error::Error,
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use super::Context;
    use crate::{
        block::Block,
        grid::{GridError, GridKind},
        kernels::{UnaryFn, unpack},
        num::DataType,
        runtime::{Execute, Kernel, KernelError, SystemKind, Value},
        settings::Settings,
    };

    /// Fails on blocks holding a negative element.
    #[derive(Debug, Clone, Kernel)]
    #[kernel(crate = "crate")]
    struct RejectNegative;

    impl Execute for RejectNegative {
        fn execute(&self, args: Vec<Value>) -> Result<Value, KernelError> {
            let [x] = unpack::<1>(self, args)?;
            let x = x.into_block()?;
            match x.read::<f64>()?.iter().any(|&x| x < 0.0) {
                true => Err(KernelError::Failed {
                    kernel: self.name().into(),
                    message: "negative element".into(),
                }),
                false => Ok(x.into()),
            }
        }
    }

    fn settings(system: SystemKind, num_devices: usize) -> Settings {
        Settings {
            system,
            cluster_shape: vec![num_devices],
            num_devices,
            block_memory: 1 << 20,
            ..Default::default()
        }
    }

    #[test]
    fn test_hooks_in_order() -> Result<(), Box<dyn Error>> {
        let count = Arc::new(AtomicUsize::new(0));
        let first = count.clone();
        let second = count.clone();
        let context = Context::builder(settings(SystemKind::Workers, 2))
            .on_create(move |context| {
                assert_eq!(context.devices().len(), 2);
                assert_eq!(first.fetch_add(1, Ordering::SeqCst), 0);
                Ok(())
            })
            .on_create(move |_| {
                assert_eq!(second.fetch_add(1, Ordering::SeqCst), 1);
                Ok(())
            })
            .build()?;
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(context.settings().num_devices, 2);

        let failed = Context::builder(settings(SystemKind::Serial, 1))
            .on_create(|context| {
                context.zeros([0], DataType::F64)?;
                Ok(())
            })
            .build();
        assert!(matches!(failed, Err(crate::Error::Array(_))));
        Ok(())
    }

    #[test]
    fn test_invalid_grid() {
        let settings = Settings {
            cluster_shape: vec![2, 0],
            ..settings(SystemKind::Serial, 1)
        };
        assert!(matches!(
            Context::builder(settings.clone()).build(),
            Err(crate::Error::Settings(_))
        ));
        let grid = GridKind::Packed.build(settings.cluster_shape, vec![]);
        assert!(matches!(grid, Err(GridError::NoDevices | GridError::EmptyClusterAxis(_))));
    }

    #[tokio::test]
    async fn test_failure_isolation() -> Result<(), Box<dyn Error>> {
        let context = Context::builder(settings(SystemKind::Workers, 3))
            .registry(|registry| registry.add_kernel::<RejectNegative>())
            .build()?;
        let data = vec![1.0, 2.0, -3.0, 4.0, 5.0, 6.0];
        let x = context.array_with(&Block::from_vec([6], data)?, [2])?;

        let checked = context.map_blocks(&x, RejectNegative, DataType::F64)?;
        let doubled = context.map_bop(crate::kernels::BinaryFn::Add, &checked, &checked)?;
        let total = context.sum(&doubled, None, false)?;
        let unrelated = context.map_uop(UnaryFn::Absolute, &x)?;

        match total.fetch().await {
            Err(KernelError::Failed { kernel, .. }) => assert_eq!(kernel, "reject_negative"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(checked.fetch_block(&[0]).await.is_ok());
        assert!(checked.fetch_block(&[1]).await.is_err());
        assert_eq!(
            unrelated.fetch().await?.read::<f64>()?,
            &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]
        );
        Ok(())
    }
}
