//! SQUIT: removing a server, directly linked or remote.

use crate::dagon::conn::ConnId;
use crate::dagon::core::Core;
use crate::dagon::msgtab::{
    mg_ignore, mg_unreg, HandlerStatus, Message, MessageEntry, MsgTable,
};
use crate::dagon::topology::EntId;

pub fn register(tab: &mut MsgTable) {
    tab.add(Message::new(
        "SQUIT",
        [
            mg_unreg(),
            mg_ignore(),
            MessageEntry::new(ms_squit, 2),
            mg_ignore(),
        ],
    ));
}

// SQUIT <target> [<reason>]
fn ms_squit(core: &mut Core, id: ConnId, _src: Option<EntId>, parv: &[&str]) -> HandlerStatus {
    let target = match core.topo.find_any(parv[1]) {
        Some(t) => t,
        // the server may already be gone; natural during splits
        None => return HandlerStatus::DropLine,
    };
    if target == core.topo.me {
        return HandlerStatus::DropLine;
    }
    let reason = if parv.len() > 2 && !parv[2].is_empty() {
        parv[2].to_string()
    } else {
        parv[0].to_string()
    };

    // a directly attached server dies with its connection; anything
    // deeper is pruned from the graph and relayed onward
    let direct = core.topo.get(target).and_then(|e| {
        if e.parent == Some(core.topo.me) {
            e.from
        } else {
            None
        }
    });
    match direct {
        Some(conn) => core.exit_connection(conn, &reason),
        None => core.squit_subtree(target, Some(id), &reason),
    }
    HandlerStatus::Continue
}
