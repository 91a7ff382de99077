//! Global flags used during the init process of the library.

use std::sync::atomic::{AtomicBool, Ordering};

/// A sticky boolean flag.
pub struct Flag {
    inner: AtomicBool,
}

impl Flag {
    /// Creates a new unset `Flag`.
    pub const fn new() -> Self {
        Self {
            inner: AtomicBool::new(false),
        }
    }

    /// Reports the current value of the flag.
    pub fn test(&self) -> bool {
        self.inner.load(Ordering::Acquire)
    }

    /// Raises the flag.
    pub fn set(&self) {
        self.inner.store(true, Ordering::Release);
    }

    /// Lowers the flag.
    pub fn unset(&self) {
        self.inner.store(false, Ordering::Release);
    }
}
