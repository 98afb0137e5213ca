use std::panic::{AssertUnwindSafe, catch_unwind};

use super::KernelError;

pub type BoxFuture<'a, T> = futures::future::BoxFuture<'a, T>;

/// Runs `f`, turning a panic into [`KernelError::Panicked`].
pub fn catch<T>(f: impl FnOnce() -> Result<T, KernelError>) -> Result<T, KernelError> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let message = match payload.downcast_ref::<&str>() {
                Some(message) => message.to_string(),
                None => match payload.downcast_ref::<String>() {
                    Some(message) => message.clone(),
                    None => "unknown panic".into(),
                },
            };
            Err(KernelError::Panicked(message))
        }
    }
}
