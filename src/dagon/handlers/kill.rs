//! KILL: forced removal of a client, relayed across the mesh.

use crate::dagon::conn::ConnId;
use crate::dagon::core::Core;
use crate::dagon::msgtab::{
    mg_ignore, mg_unreg, HandlerStatus, Message, MessageEntry, MsgTable,
};
use crate::dagon::topology::EntId;

use super::{build_relays, send_relays};

pub fn register(tab: &mut MsgTable) {
    tab.add(Message::new(
        "KILL",
        [
            mg_unreg(),
            mg_ignore(),
            MessageEntry::new(ms_kill, 2),
            mg_ignore(),
        ],
    ));
}

// :<source> KILL <target> :<path>
fn ms_kill(core: &mut Core, id: ConnId, src: Option<EntId>, parv: &[&str]) -> HandlerStatus {
    let src = match src {
        Some(s) => s,
        None => return HandlerStatus::DropLine,
    };
    let target = match core.topo.find_any(parv[1]) {
        Some(t) => t,
        // lost a collision race somewhere else; nothing to do
        None => return HandlerStatus::DropLine,
    };
    if core.topo.get(target).map(|e| e.is_server()).unwrap_or(true) {
        return HandlerStatus::DropLine;
    }
    let path = parv.get(2).copied().unwrap_or("");

    let killed = match core.topo.remove_client(target) {
        Some(e) => e,
        None => return HandlerStatus::DropLine,
    };

    let relays = build_relays(core, Some(id), 0, |c, conn| {
        let src_tok = c
            .topo
            .get(src)
            .map(|e| c.ent_wire_for(e, conn))
            .unwrap_or_else(|| parv[0].to_string());
        Some(format!(
            ":{} KILL {} :{}",
            src_tok,
            c.ent_wire_for(&killed, conn),
            path
        ))
    });
    send_relays(core, relays);

    // a local victim's connection dies with it
    if let Some(conn) = killed.from {
        let local = core
            .conns
            .get(&conn.raw())
            .map(|c| c.entity == Some(killed.id))
            .unwrap_or(false);
        if local {
            core.exit_connection(conn, "Killed");
            core.destroy_connection(conn);
        }
    }
    HandlerStatus::Continue
}

#[cfg(test)]
mod tests {
    use crate::dagon::parse::parse;
    use crate::dagon::testutil::{drain, server_conn, test_core};

    #[test]
    fn test_kill_removes_and_relays() {
        let mut core = test_core();
        let b = server_conn(&mut core, "irc.b.net", "42X");
        let hub = server_conn(&mut core, "irc.hub.net", "99Y");
        parse(
            &mut core,
            b,
            ":42X UID alice 1 1000 +i u host 0 42XAAAAAA :A",
        );
        drain(&mut core, hub);

        parse(
            &mut core,
            hub,
            ":irc.hub.net KILL 42XAAAAAA :irc.hub.net (flood)",
        );
        assert!(core.topo.find_name("alice").is_none());
        let out = drain(&mut core, b);
        assert!(out.contains(&":99Y KILL 42XAAAAAA :irc.hub.net (flood)".to_string()));
        // nothing echoes back toward the killer
        assert!(drain(&mut core, hub).is_empty());
    }

    #[test]
    fn test_kill_unknown_target_is_dropped() {
        let mut core = test_core();
        let b = server_conn(&mut core, "irc.b.net", "42X");
        parse(&mut core, b, ":irc.b.net KILL ghost :path");
        assert!(!core.conns.get(&b.raw()).unwrap().is_exiting());
        assert!(drain(&mut core, b).is_empty());
    }
}
