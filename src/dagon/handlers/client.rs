//! Client introduction and lifetime: UID, NICK, QUIT, AWAY.

use crate::dagon::conn::{caps, ConnId};
use crate::dagon::core::Core;
use crate::dagon::msgtab::{
    mg_ignore, HandlerStatus, Message, MessageEntry, MsgTable,
};
use crate::dagon::topology::{EntId, Entity, Introduction, NewClient};

use super::{build_relays, send_relays};

pub fn register(tab: &mut MsgTable) {
    tab.add(Message::new(
        "UID",
        [
            mg_ignore(),
            mg_ignore(),
            MessageEntry::new(ms_uid, 10),
            mg_ignore(),
        ],
    ));
    tab.add(Message::new(
        "NICK",
        [
            mg_ignore(),
            mg_ignore(),
            MessageEntry::new(ms_nick, 3),
            mg_ignore(),
        ],
    ));
    tab.add(Message::new(
        "QUIT",
        [
            mg_ignore(),
            mg_ignore(),
            MessageEntry::new(ms_quit, 1),
            mg_ignore(),
        ],
    ));
    tab.add(Message::new(
        "AWAY",
        [
            mg_ignore(),
            mg_ignore(),
            MessageEntry::new(ms_away, 1),
            mg_ignore(),
        ],
    ));
}

// a removal the whole mesh must see; the entity is already gone from
// the graph
fn kill_everywhere(core: &mut Core, skip: Option<ConnId>, killed: &Entity, cause: &str) {
    let me_name = core.me_name().to_string();
    let relays = build_relays(core, skip, 0, |c, conn| {
        Some(format!(
            ":{} KILL {} :{} ({})",
            c.me_wire_for(conn),
            c.ent_wire_for(killed, conn),
            me_name,
            cause
        ))
    });
    send_relays(core, relays);
    // a local victim loses its connection too
    if let Some(conn) = killed.from {
        let local = core
            .conns
            .get(&conn.raw())
            .map(|c| c.entity == Some(killed.id))
            .unwrap_or(false);
        if local {
            core.exit_connection(conn, "Nick collision");
            core.destroy_connection(conn);
        }
    }
}

// a removal aimed back at the peer that introduced a doomed newcomer
fn kill_toward(core: &mut Core, id: ConnId, token: &str, cause: &str) {
    let (me_token, me_name) = match core.conns.get(&id.raw()) {
        Some(conn) => (core.me_wire_for(conn), core.me_name().to_string()),
        None => return,
    };
    core.send(
        id,
        &format!(":{} KILL {} :{} ({})", me_token, token, me_name, cause),
    );
}

fn relay_introduction(core: &mut Core, skip: ConnId, added: EntId) {
    let relays = build_relays(core, Some(skip), 0, |c, conn| {
        let ent = c.topo.get(added)?;
        let cx = ent.client()?;
        let server = ent.parent.and_then(|p| c.topo.get(p))?;
        if conn.has_cap(caps::TS6) && ent.sid.is_some() && server.sid.is_some() {
            Some(format!(
                ":{} UID {} {} {} {} {} {} {} {} :{}",
                server.sid.as_deref().unwrap_or(""),
                ent.name,
                ent.hop + 1,
                ent.ts,
                cx.umodes,
                cx.user,
                cx.host,
                if cx.ip.is_empty() { "0" } else { &cx.ip },
                ent.sid.as_deref().unwrap_or(""),
                ent.info
            ))
        } else {
            Some(format!(
                "NICK {} {} {} {} {} {} {} :{}",
                ent.name,
                ent.hop + 1,
                ent.ts,
                cx.umodes,
                cx.user,
                cx.host,
                server.name,
                ent.info
            ))
        }
    });
    send_relays(core, relays);
}

fn introduce(core: &mut Core, id: ConnId, newcomer: NewClient, wire_token: &str) -> HandlerStatus {
    match core.topo.introduce_client(newcomer) {
        Introduction::Added(added) => {
            relay_introduction(core, id, added);
            HandlerStatus::Continue
        }
        Introduction::KeepExisting(_) => {
            // the newcomer lost the timestamp tiebreak; undo it on
            // the introducing side only
            kill_toward(core, id, wire_token, "Nick collision");
            HandlerStatus::Continue
        }
        Introduction::Replaced { killed, added } => {
            kill_everywhere(core, None, &killed, "Nick collision");
            relay_introduction(core, id, added);
            HandlerStatus::Continue
        }
        Introduction::KillBoth { killed } => {
            kill_everywhere(core, None, &killed, "Nick collision");
            kill_toward(core, id, wire_token, "Nick collision");
            HandlerStatus::Continue
        }
        Introduction::ServerCollision(_) => {
            kill_toward(core, id, wire_token, "Nick/server collision");
            HandlerStatus::Continue
        }
    }
}

// :<sid> UID nick hop ts umodes user host ip uid :gecos
fn ms_uid(core: &mut Core, id: ConnId, src: Option<EntId>, parv: &[&str]) -> HandlerStatus {
    let src = match src {
        Some(s) if core.topo.get(s).map(|e| e.is_server()).unwrap_or(false) => s,
        _ => return HandlerStatus::DropLine,
    };
    let ts: u64 = parv[3].parse().unwrap_or(0);
    let hop: u32 = parv[2].parse().unwrap_or(0);
    let newcomer = NewClient {
        server: src,
        nick: parv[1].to_string(),
        hop,
        ts,
        umodes: parv[4].to_string(),
        user: parv[5].to_string(),
        host: parv[6].to_string(),
        ip: if parv[7] == "0" {
            String::new()
        } else {
            parv[7].to_string()
        },
        uid: Some(parv[8].to_string()),
        info: parv[9].to_string(),
        from: Some(id),
    };
    introduce(core, id, newcomer, parv[8])
}

// NICK carries either a name form introduction from a server, or a
// nick change from a client
fn ms_nick(core: &mut Core, id: ConnId, src: Option<EntId>, parv: &[&str]) -> HandlerStatus {
    let src = match src {
        Some(s) => s,
        None => return HandlerStatus::DropLine,
    };
    let src_is_server = core.topo.get(src).map(|e| e.is_server()).unwrap_or(false);

    if src_is_server {
        if parv.len() < 9 {
            return HandlerStatus::DropLine;
        }
        let ts: u64 = parv[3].parse().unwrap_or(0);
        let hop: u32 = parv[2].parse().unwrap_or(0);
        // the named server, not the announcing one, owns the client
        let server = match core.topo.find_name(parv[7]) {
            Some(s) => s,
            None => return HandlerStatus::DropLine,
        };
        let newcomer = NewClient {
            server,
            nick: parv[1].to_string(),
            hop,
            ts,
            umodes: parv[4].to_string(),
            user: parv[5].to_string(),
            host: parv[6].to_string(),
            ip: String::new(),
            uid: None,
            info: parv[8].to_string(),
            from: Some(id),
        };
        return introduce(core, id, newcomer, parv[1]);
    }

    // nick change: :<uid> NICK newnick :<ts>
    let new_nick = parv[1].to_string();
    let ts: u64 = parv[2].parse().unwrap_or(0);
    if let Some(other) = core.topo.find_name(&new_nick) {
        if other != src {
            // a change onto an occupied nick collides exactly like an
            // introduction with the same timestamps
            let (other_ts, same_identity) = {
                let o = match core.topo.get(other) {
                    Some(o) => o,
                    None => return HandlerStatus::DropLine,
                };
                let s = core.topo.get(src);
                let same = match (o.identity(), s.and_then(|e| e.identity())) {
                    (Some((ou, oh)), Some((su, sh))) => {
                        crate::dagon::wire::name_eq(ou, su)
                            && crate::dagon::wire::name_eq(oh, sh)
                    }
                    _ => false,
                };
                (o.ts, same)
            };
            if ts < other_ts || (ts == other_ts && !same_identity) {
                if let Some(killed) = core.topo.remove_client(other) {
                    kill_everywhere(core, None, &killed, "Nick collision");
                }
            }
            if ts > other_ts || (ts == other_ts && !same_identity) {
                let token = core
                    .topo
                    .get(src)
                    .map(|e| e.wire_id().to_string())
                    .unwrap_or(new_nick.clone());
                if let Some(killed) = core.topo.remove_client(src) {
                    kill_everywhere(core, Some(id), &killed, "Nick collision");
                }
                kill_toward(core, id, &token, "Nick collision");
                return HandlerStatus::Continue;
            }
            if ts == other_ts && same_identity {
                // the incumbent stays; the change never happened
                return HandlerStatus::DropLine;
            }
        }
    }

    if core.topo.get(src).is_none() {
        return HandlerStatus::DropLine;
    }
    core.topo.rename_client(src, &new_nick, ts);
    let relays = build_relays(core, Some(id), 0, |c, conn| {
        let ent = c.topo.get(src)?;
        Some(format!(
            ":{} NICK {} :{}",
            c.ent_wire_for(ent, conn),
            ent.name,
            ts
        ))
    });
    send_relays(core, relays);
    HandlerStatus::Continue
}

// :<uid> QUIT :<reason>
fn ms_quit(core: &mut Core, id: ConnId, src: Option<EntId>, parv: &[&str]) -> HandlerStatus {
    let src = match src {
        Some(s) if core.topo.get(s).map(|e| e.is_client()).unwrap_or(false) => s,
        _ => return HandlerStatus::DropLine,
    };
    let reason = parv.get(1).copied().unwrap_or("");
    let relays = build_relays(core, Some(id), 0, |c, conn| {
        let ent = c.topo.get(src)?;
        Some(format!(":{} QUIT :{}", c.ent_wire_for(ent, conn), reason))
    });
    send_relays(core, relays);
    core.topo.remove_client(src);
    HandlerStatus::Continue
}

// :<uid> AWAY [:<message>]
fn ms_away(core: &mut Core, id: ConnId, src: Option<EntId>, parv: &[&str]) -> HandlerStatus {
    let src = match src {
        Some(s) => s,
        None => return HandlerStatus::DropLine,
    };
    let msg = parv.get(1).copied().filter(|m| !m.is_empty());
    if let Some(cx) = core.topo.get_mut(src).and_then(Entity::client_mut) {
        cx.away = msg.map(|m| m.to_string());
    } else {
        return HandlerStatus::DropLine;
    }

    let msg_owned = msg.map(|m| m.to_string());
    let relays = build_relays(core, Some(id), 0, |c, conn| {
        let ent = c.topo.get(src)?;
        let token = c.ent_wire_for(ent, conn);
        Some(match &msg_owned {
            Some(m) => format!(":{} AWAY :{}", token, m),
            None => format!(":{} AWAY", token),
        })
    });
    send_relays(core, relays);
    HandlerStatus::Continue
}

#[cfg(test)]
mod tests {
    use crate::dagon::parse::parse;
    use crate::dagon::testutil::{drain, server_conn, test_core};

    #[test]
    fn test_uid_introduction_relays() {
        let mut core = test_core();
        let b = server_conn(&mut core, "irc.b.net", "42X");
        let hub = server_conn(&mut core, "irc.hub.net", "99Y");

        parse(
            &mut core,
            b,
            ":42X UID alice 1 1000 +i u host 0 42XAAAAAA :A",
        );
        let alice = core.topo.find_name("alice").expect("introduced");
        assert_eq!(core.topo.find_id("42XAAAAAA"), Some(alice));

        let out = drain(&mut core, hub);
        assert!(out
            .iter()
            .any(|l| l == ":42X UID alice 2 1000 +i u host 0 42XAAAAAA :A"));
    }

    #[test]
    fn test_nick_collision_older_wins() {
        let mut core = test_core();
        let b = server_conn(&mut core, "irc.b.net", "42X");
        let hub = server_conn(&mut core, "irc.hub.net", "99Y");

        parse(
            &mut core,
            b,
            ":42X UID alice 1 1000 +i u host 0 42XAAAAAA :A",
        );
        drain(&mut core, b);
        drain(&mut core, hub);

        // the younger alice from the hub loses; a removal goes back
        // toward the hub only
        parse(
            &mut core,
            hub,
            ":99Y UID alice 1 1001 +i u host 0 99YAAAAAA :A",
        );
        let out = drain(&mut core, hub);
        assert!(out
            .iter()
            .any(|l| l.starts_with(":42A KILL 99YAAAAAA :irc.a.net (Nick collision)")));
        assert!(drain(&mut core, b).is_empty());
        assert_eq!(
            core.topo.find_name("alice"),
            core.topo.find_id("42XAAAAAA")
        );
        assert!(core.topo.find_id("99YAAAAAA").is_none());
    }

    #[test]
    fn test_nick_collision_newer_incumbent_evicted() {
        let mut core = test_core();
        let b = server_conn(&mut core, "irc.b.net", "42X");
        let hub = server_conn(&mut core, "irc.hub.net", "99Y");

        parse(
            &mut core,
            b,
            ":42X UID alice 1 1001 +i u host 0 42XAAAAAA :A",
        );
        drain(&mut core, b);
        drain(&mut core, hub);

        parse(
            &mut core,
            hub,
            ":99Y UID alice 1 1000 +i u host 0 99YAAAAAA :A",
        );
        // the incumbent is killed everywhere and the older newcomer
        // is relayed onward
        let out_b = drain(&mut core, b);
        assert!(out_b
            .iter()
            .any(|l| l.starts_with(":42A KILL 42XAAAAAA :")));
        assert!(out_b
            .iter()
            .any(|l| l == ":99Y UID alice 2 1000 +i u host 0 99YAAAAAA :A"));
        assert_eq!(
            core.topo.find_name("alice"),
            core.topo.find_id("99YAAAAAA")
        );
    }

    #[test]
    fn test_equal_ts_differing_identity_kills_both() {
        let mut core = test_core();
        let b = server_conn(&mut core, "irc.b.net", "42X");
        let hub = server_conn(&mut core, "irc.hub.net", "99Y");

        parse(
            &mut core,
            b,
            ":42X UID alice 1 1000 +i u host 0 42XAAAAAA :A",
        );
        drain(&mut core, b);
        drain(&mut core, hub);

        parse(
            &mut core,
            hub,
            ":99Y UID alice 1 1000 +i other host 0 99YAAAAAA :A",
        );
        assert!(core.topo.find_name("alice").is_none());
        let out_b = drain(&mut core, b);
        assert!(out_b
            .iter()
            .any(|l| l.starts_with(":42A KILL 42XAAAAAA :")));
        let out_hub = drain(&mut core, hub);
        assert!(out_hub
            .iter()
            .any(|l| l.starts_with(":42A KILL 99YAAAAAA :")));
    }

    #[test]
    fn test_quit_removes_and_relays() {
        let mut core = test_core();
        let b = server_conn(&mut core, "irc.b.net", "42X");
        let hub = server_conn(&mut core, "irc.hub.net", "99Y");
        parse(
            &mut core,
            b,
            ":42X UID alice 1 1000 +i u host 0 42XAAAAAA :A",
        );
        drain(&mut core, hub);

        parse(&mut core, b, ":42XAAAAAA QUIT :bye");
        assert!(core.topo.find_name("alice").is_none());
        let out = drain(&mut core, hub);
        assert!(out.contains(&":42XAAAAAA QUIT :bye".to_string()));
    }

    #[test]
    fn test_away_set_and_cleared() {
        let mut core = test_core();
        let b = server_conn(&mut core, "irc.b.net", "42X");
        parse(
            &mut core,
            b,
            ":42X UID alice 1 1000 +i u host 0 42XAAAAAA :A",
        );
        let alice = core.topo.find_name("alice").unwrap();

        parse(&mut core, b, ":42XAAAAAA AWAY :gone");
        assert_eq!(
            core.topo
                .get(alice)
                .unwrap()
                .client()
                .unwrap()
                .away
                .as_deref(),
            Some("gone")
        );
        parse(&mut core, b, ":42XAAAAAA AWAY");
        assert!(core.topo.get(alice).unwrap().client().unwrap().away.is_none());
    }

    #[test]
    fn test_nick_change_relays() {
        let mut core = test_core();
        let b = server_conn(&mut core, "irc.b.net", "42X");
        let hub = server_conn(&mut core, "irc.hub.net", "99Y");
        parse(
            &mut core,
            b,
            ":42X UID alice 1 1000 +i u host 0 42XAAAAAA :A",
        );
        drain(&mut core, hub);

        parse(&mut core, b, ":42XAAAAAA NICK alicia :1100");
        let alicia = core.topo.find_name("alicia").expect("renamed");
        assert_eq!(core.topo.find_id("42XAAAAAA"), Some(alicia));
        assert!(core.topo.find_name("alice").is_none());
        let out = drain(&mut core, hub);
        assert!(out.contains(&":42XAAAAAA NICK alicia :1100".to_string()));
    }
}
