use std::future::Future;
use std::io;

pub type JoinHandle<T> = ::tokio::task::JoinHandle<T>;

/// A current thread runtime paired with the local task set that all
/// daemon tasks run on.
pub struct Runtime {
    inner: ::tokio::runtime::Runtime,
    local: ::tokio::task::LocalSet,
}

pub fn init() -> io::Result<Runtime> {
    let inner = ::tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = ::tokio::task::LocalSet::new();
    Ok(Runtime { inner, local })
}

pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + 'static,
{
    ::tokio::task::spawn_local(future)
}

impl Runtime {
    /// Drives `future` to completion, along with every task spawned
    /// onto the local set.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.local.block_on(&self.inner, future)
    }
}
