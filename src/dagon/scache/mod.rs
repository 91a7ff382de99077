//! Interned server name cache.
//!
//! Upstream server names are referenced from every entity beneath
//! them; interning keeps one shared allocation per unique name seen
//! over the lifetime of the daemon.

use std::rc::Rc;

use crate::dagon::collections::{self, HashMap};
use crate::dagon::wire;

/// The server name cache.
#[derive(Default)]
pub struct Scache {
    names: HashMap<String, Rc<str>>,
}

impl Scache {
    pub fn new() -> Self {
        Self {
            names: collections::hash_map(),
        }
    }

    /// Returns the interned copy of `name`, adding it if unseen.
    /// Lookups are case insensitive; the first spelling wins.
    pub fn find_or_add(&mut self, name: &str) -> Rc<str> {
        let key = wire::fold(name);
        if let Some(n) = self.names.get(&key) {
            return n.clone();
        }
        let interned: Rc<str> = Rc::from(name);
        self.names.insert(key, interned.clone());
        interned
    }

    /// Number of unique names interned.
    pub fn count(&self) -> usize {
        self.names.len()
    }
}
