//! Command handlers, registered into the dispatch table.

pub mod cap;
pub mod channel;
pub mod client;
pub mod encap;
pub mod kill;
pub mod ping;
pub mod server;
pub mod squit;

use crate::dagon::conn::{ConnId, Connection};
use crate::dagon::core::Core;
use crate::dagon::msgtab::MsgTable;

/// Registers every command this subsystem implements.
pub fn register(tab: &mut MsgTable) {
    cap::register(tab);
    server::register(tab);
    ping::register(tab);
    squit::register(tab);
    kill::register(tab);
    client::register(tab);
    channel::register(tab);
    encap::register(tab);
}

/// Builds one relay line per eligible server link; borrow friendly
/// two phase helper for handlers that fan a command out.
pub(crate) fn build_relays<F>(
    core: &Core,
    skip: Option<ConnId>,
    need: u32,
    f: F,
) -> Vec<(ConnId, String)>
where
    F: Fn(&Core, &Connection) -> Option<String>,
{
    let mut out = Vec::new();
    for &peer in core.serv_conns.iter() {
        if Some(peer) == skip {
            continue;
        }
        let conn = match core.conns.get(&peer.raw()) {
            Some(c) if !c.is_exiting() => c,
            _ => continue,
        };
        if conn.caps & need != need {
            continue;
        }
        if let Some(line) = f(core, conn) {
            out.push((peer, line));
        }
    }
    out
}

/// Sends a batch built by `build_relays`.
pub(crate) fn send_relays(core: &mut Core, relays: Vec<(ConnId, String)>) {
    for (peer, line) in relays {
        core.send(peer, &line);
    }
}
