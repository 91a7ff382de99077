//! Abstraction over the async runtime driving the daemon.
//!
//! The core runs on a single threaded cooperative scheduler; every
//! suspension point is an explicit await. Auxiliary tasks spawned here
//! share the event loop thread, so they may hold non-`Send` handles.

mod tokio;

use std::future::Future;

use crate::dagon::error::*;

pub use self::tokio::{JoinHandle, Runtime};

/// Creates the current thread runtime.
pub fn init() -> Result<Runtime> {
    self::tokio::init().with_kind(ErrorKind::AsyncRuntime)
}

/// Spawns a new task onto the event loop thread.
///
/// May only be called from within the scope of `Runtime::block_on`.
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + 'static,
{
    self::tokio::spawn(future)
}
