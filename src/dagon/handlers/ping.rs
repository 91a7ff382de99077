//! PING and PONG, including the end-of-burst handshake.

use slog::info;

use crate::dagon::conn::ConnId;
use crate::dagon::core::Core;
use crate::dagon::msgtab::{
    mg_ignore, HandlerStatus, Message, MessageEntry, MsgTable,
};
use crate::dagon::topology::EntId;

pub fn register(tab: &mut MsgTable) {
    tab.add(Message::new(
        "PING",
        [
            mg_ignore(),
            MessageEntry::new(m_ping, 2),
            MessageEntry::new(m_ping, 2),
            mg_ignore(),
        ],
    ));
    tab.add(Message::new(
        "PONG",
        [
            mg_ignore(),
            MessageEntry::new(ms_pong, 2),
            MessageEntry::new(ms_pong, 2),
            mg_ignore(),
        ],
    ));
}

// route toward an explicit destination, when one is named and it is
// not us; returns the route when the line should be forwarded
fn route_for(core: &Core, dest: &str) -> Option<ConnId> {
    let h = core.topo.find_any(dest)?;
    if h == core.topo.me {
        return None;
    }
    core.topo.get(h).and_then(|e| e.from)
}

// PING <origin> [<destination>]
fn m_ping(core: &mut Core, id: ConnId, src: Option<EntId>, parv: &[&str]) -> HandlerStatus {
    if parv.len() > 2 && !parv[2].is_empty() {
        if let Some(route) = route_for(core, parv[2]) {
            let line = {
                let conn = match core.conns.get(&route.raw()) {
                    Some(c) => c,
                    None => return HandlerStatus::DropLine,
                };
                let token = src
                    .and_then(|s| core.topo.get(s))
                    .map(|e| core.ent_wire_for(e, conn))
                    .unwrap_or_else(|| parv[0].to_string());
                format!(":{} PING {} {}", token, parv[1], parv[2])
            };
            core.send(route, &line);
            return HandlerStatus::Continue;
        }
    }

    let (me_token, me_name) = match core.conns.get(&id.raw()) {
        Some(conn) => (core.me_wire_for(conn), core.me_name().to_string()),
        None => return HandlerStatus::DropLine,
    };
    core.send(
        id,
        &format!(":{} PONG {} :{}", me_token, me_name, parv[1]),
    );
    HandlerStatus::Continue
}

// PONG <origin> [<destination>]
fn ms_pong(core: &mut Core, id: ConnId, _src: Option<EntId>, parv: &[&str]) -> HandlerStatus {
    let was_bursting = core
        .conns
        .get(&id.raw())
        .map(|c| c.awaiting_pong)
        .unwrap_or(false);
    if was_bursting {
        if let Some(conn) = core.conns.get_mut(&id.raw()) {
            conn.awaiting_pong = false;
        }
        let name = core
            .conns
            .get(&id.raw())
            .map(|c| c.display_name().to_string())
            .unwrap_or_default();
        info!(core.log, "End of burst from {}", name);
        return HandlerStatus::Continue;
    }

    if parv.len() > 2 && !parv[2].is_empty() {
        if let Some(route) = route_for(core, parv[2]) {
            let line = format!(":{} PONG {} {}", parv[0], parv[1], parv[2]);
            core.send(route, &line);
        }
    }
    HandlerStatus::Continue
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dagon::testutil::{drain, server_conn, test_core};

    #[test]
    fn test_ping_answered_with_pong() {
        let mut core = test_core();
        let b = server_conn(&mut core, "irc.b.net", "42X");
        crate::dagon::parse::parse(&mut core, b, ":irc.b.net PING irc.b.net");
        let out = drain(&mut core, b);
        assert_eq!(out, vec![":42A PONG irc.a.net :irc.b.net".to_string()]);
    }

    #[test]
    fn test_pong_closes_burst() {
        let mut core = test_core();
        let b = server_conn(&mut core, "irc.b.net", "42X");
        core.conns.get_mut(&b.raw()).unwrap().awaiting_pong = true;
        crate::dagon::parse::parse(&mut core, b, ":irc.b.net PONG irc.b.net :42A");
        assert!(!core.conns.get(&b.raw()).unwrap().awaiting_pong);
    }

    #[test]
    fn test_ping_routed_toward_destination() {
        let mut core = test_core();
        let b = server_conn(&mut core, "irc.b.net", "42X");
        let c = server_conn(&mut core, "irc.c.net", "42C");
        crate::dagon::parse::parse(&mut core, b, ":irc.b.net PING irc.b.net irc.c.net");
        let out = drain(&mut core, c);
        assert_eq!(out, vec![":42X PING irc.b.net irc.c.net".to_string()]);
        assert!(drain(&mut core, b).is_empty());
    }
}
