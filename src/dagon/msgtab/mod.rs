//! The command dispatch table.
//!
//! Commands are looked up by case insensitive name. Each command
//! carries one handler per connection role plus a minimum parameter
//! count; the dispatch loop applies the per role policy uniformly
//! when either is violated.

use crate::dagon::collections::{self, HashMap};
use crate::dagon::conn::ConnId;
use crate::dagon::core::Core;
use crate::dagon::topology::EntId;

/// Handler roles, indexed by the connection's state.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Role {
    Unreg = 0,
    Client = 1,
    Server = 2,
    Encap = 3,
}

/// Status a handler reports back to the dispatch loop. Errors never
/// unwind across handler boundaries.
pub enum HandlerStatus {
    /// Carry on; the line has been fully dealt with.
    Continue,
    /// The line was dropped; nothing else to do.
    DropLine,
    /// The link is beyond saving; drop it with the given reason.
    DropLink(String),
}

/// `parv[0]` is the source name; parameters follow.
pub type Handler = fn(&mut Core, ConnId, Option<EntId>, &[&str]) -> HandlerStatus;

/// A handler with its parameter floor.
#[derive(Copy, Clone)]
pub struct MessageEntry {
    pub handler: Handler,
    pub min_para: usize,
}

impl MessageEntry {
    pub const fn new(handler: Handler, min_para: usize) -> Self {
        Self { handler, min_para }
    }
}

/// One command: a handler per role, plus use counters.
pub struct Message {
    pub cmd: &'static str,
    pub entries: [MessageEntry; 4],
    pub count: u64,
    pub rcount: u64,
    pub bytes: u64,
}

impl Message {
    pub fn new(cmd: &'static str, entries: [MessageEntry; 4]) -> Self {
        Self {
            cmd,
            entries,
            count: 0,
            rcount: 0,
            bytes: 0,
        }
    }

    pub fn entry(&self, role: Role) -> MessageEntry {
        self.entries[role as usize]
    }
}

/// The table: command name to message, case insensitive.
#[derive(Default)]
pub struct MsgTable {
    map: HashMap<String, Message>,
}

impl MsgTable {
    pub fn new() -> Self {
        Self {
            map: collections::hash_map(),
        }
    }

    /// Registers a command; re-registration is ignored.
    pub fn add(&mut self, msg: Message) {
        let key = msg.cmd.to_ascii_uppercase();
        self.map.entry(key).or_insert(msg);
    }

    /// Unregisters a command.
    pub fn del(&mut self, cmd: &str) {
        self.map.remove(&cmd.to_ascii_uppercase());
    }

    pub fn find(&self, cmd: &str) -> Option<&Message> {
        self.map.get(&cmd.to_ascii_uppercase())
    }

    pub fn find_mut(&mut self, cmd: &str) -> Option<&mut Message> {
        self.map.get_mut(&cmd.to_ascii_uppercase())
    }

    /// All registered commands, for stats reporting.
    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.map.values()
    }
}

/// Silently ignore the command in this role.
pub fn m_ignore(_core: &mut Core, _conn: ConnId, _src: Option<EntId>, _parv: &[&str]) -> HandlerStatus {
    HandlerStatus::DropLine
}

/// Reject a command that requires registration first.
pub fn m_unregistered(
    core: &mut Core,
    conn: ConnId,
    _src: Option<EntId>,
    _parv: &[&str],
) -> HandlerStatus {
    // only whine once per connection
    let already = core
        .conns
        .get_mut(&conn.raw())
        .map(|c| c.note_unregistered_reply())
        .unwrap_or(true);
    if !already {
        let me = core.me_name().to_string();
        core.send(conn, &format!(":{} 451 * :You have not registered", me));
    }
    HandlerStatus::DropLine
}

/// Reject a registration command arriving twice.
pub fn m_registered(
    core: &mut Core,
    conn: ConnId,
    _src: Option<EntId>,
    _parv: &[&str],
) -> HandlerStatus {
    let me = core.me_name().to_string();
    let target = core
        .conns
        .get(&conn.raw())
        .map(|c| c.display_name().to_string())
        .unwrap_or_else(|| "*".to_string());
    core.send(
        conn,
        &format!(":{} 462 {} :You may not reregister", me, target),
    );
    HandlerStatus::DropLine
}

/// Convenience for building the common ignore entry.
pub const fn mg_ignore() -> MessageEntry {
    MessageEntry::new(m_ignore, 0)
}

/// Convenience for building the common not-registered entry.
pub const fn mg_unreg() -> MessageEntry {
    MessageEntry::new(m_unregistered, 0)
}

/// Convenience for building the common re-registration entry.
pub const fn mg_reg() -> MessageEntry {
    MessageEntry::new(m_registered, 0)
}
