//! The message router: given an inbound line on a connection, resolve
//! the source entity, locate a handler, and dispatch.
//!
//! NOTE: `parse()` must not be called recursively by handlers.

use crate::dagon::conn::{ConnId, Status};
use crate::dagon::core::Core;
use crate::dagon::msgtab::{HandlerStatus, MessageEntry, Role};
use crate::dagon::topology::EntId;
use crate::dagon::wire::{self, Params};

/// Numeric replies the router knows by value.
pub mod numeric {
    pub const ERR_NOSUCHNICK: u32 = 401;
    pub const ERR_NOSUCHSERVER: u32 = 402;
    pub const ERR_UNKNOWNCOMMAND: u32 = 421;
    pub const ERR_NOTREGISTERED: u32 = 451;
    pub const ERR_NEEDMOREPARAMS: u32 = 461;
    pub const ERR_ALREADYREGISTRED: u32 = 462;
}

/// Parses one line arriving on `id` and dispatches it.
pub fn parse(core: &mut Core, id: ConnId, line: &str) {
    let tok = match wire::tokenize(line) {
        Some(t) => t,
        None => {
            core.stats.is_empt += 1;
            return;
        }
    };

    let (status, is_server, conn_entity) = match core.conns.get(&id.raw()) {
        Some(c) => (c.status, c.is_server(), c.entity),
        None => return,
    };
    if status == Status::Exiting {
        return;
    }

    // resolve the source prefix; only trusted server links may speak
    // for other entities
    let mut from: Option<EntId> = conn_entity;
    if let Some(sender) = tok.source {
        if is_server {
            match core.topo.find_any(sender) {
                None => {
                    core.stats.is_unpf += 1;
                    remove_unknown(core, id, sender, line);
                    return;
                }
                Some(h) => {
                    let route = core.topo.get(h).and_then(|e| e.from);
                    if route != Some(id) {
                        core.stats.is_wrdi += 1;
                        cancel_clients(core, id, h);
                        return;
                    }
                    from = Some(h);
                }
            }
        }
    }

    if wire::is_numeric(tok.command) && is_server {
        core.stats.is_num += 1;
        do_numeric(core, id, from, tok.command, &tok.args);
        return;
    }

    let role = match status {
        Status::Unknown | Status::Handshake => Role::Unreg,
        Status::Client => Role::Client,
        Status::Server => Role::Server,
        Status::Exiting => return,
    };

    let entry: Option<MessageEntry> = match core.msgtab.find_mut(tok.command) {
        Some(m) => {
            m.count += 1;
            if is_server {
                m.rcount += 1;
            }
            m.bytes += line.len() as u64;
            Some(m.entry(role))
        }
        None => None,
    };

    let entry = match entry {
        Some(e) => e,
        None => {
            // unknown commands from servers may be extensions; only
            // users get told off
            core.stats.is_unco += 1;
            if role == Role::Client {
                let me = core.me_name().to_string();
                let nick = source_name(core, id, from);
                core.send(
                    id,
                    &format!(
                        ":{} {} {} {} :Unknown command",
                        me,
                        numeric::ERR_UNKNOWNCOMMAND,
                        nick,
                        tok.command
                    ),
                );
            }
            return;
        }
    };

    let source = source_name(core, id, from);
    let mut parv: Params<'_> = Params::new();
    parv.push(source.as_str());
    parv.extend(tok.args.iter().copied());
    let parc = parv.len();

    if parc < entry.min_para
        || (entry.min_para > 0 && parv[entry.min_para - 1].is_empty())
    {
        if !is_server {
            let me = core.me_name().to_string();
            let nick = if source.is_empty() { "*" } else { source.as_str() };
            core.send(
                id,
                &format!(
                    ":{} {} {} {} :Not enough parameters",
                    me,
                    numeric::ERR_NEEDMOREPARAMS,
                    nick,
                    tok.command
                ),
            );
            return;
        }
        // a protocol violation on an already trusted link is fatal
        let name = core
            .conns
            .get(&id.raw())
            .map(|c| c.display_name().to_string())
            .unwrap_or_default();
        core.oper_notice(&format!(
            "Dropping server {} due to (invalid) command '{}' with only {} arguments (expecting {})",
            name,
            tok.command,
            parc,
            entry.min_para
        ));
        core.exit_connection(id, "Not enough arguments to server command.");
        return;
    }

    match (entry.handler)(core, id, from, &parv) {
        HandlerStatus::Continue | HandlerStatus::DropLine => {}
        HandlerStatus::DropLink(reason) => core.exit_connection(id, &reason),
    }
}

/// Dispatches an encapsulated subcommand in the Encap role.
pub fn handle_encap(
    core: &mut Core,
    id: ConnId,
    src: Option<EntId>,
    command: &str,
    parv: &[&str],
) {
    let entry = match core.msgtab.find(command) {
        Some(m) => m.entry(Role::Encap),
        None => return,
    };
    let parc = parv.len();
    if parc < entry.min_para
        || (entry.min_para > 0 && parv[entry.min_para - 1].is_empty())
    {
        return;
    }
    match (entry.handler)(core, id, src, parv) {
        HandlerStatus::Continue | HandlerStatus::DropLine => {}
        HandlerStatus::DropLink(reason) => core.exit_connection(id, &reason),
    }
}

fn source_name(core: &Core, id: ConnId, from: Option<EntId>) -> String {
    if let Some(h) = from {
        if let Some(ent) = core.topo.get(h) {
            return ent.name.clone();
        }
    }
    core.conns
        .get(&id.raw())
        .map(|c| c.display_name().to_string())
        .unwrap_or_default()
}

/// An unknown source prefix earns a corrective removal back toward the
/// peer: a KILL for nick shaped tokens, a SQUIT for ids and dotted
/// names.
fn remove_unknown(core: &mut Core, id: ConnId, sender: &str, line: &str) {
    let (me_token, peer_name) = match core.conns.get(&id.raw()) {
        Some(conn) => (core.me_wire_for(conn), conn.display_name().to_string()),
        None => return,
    };
    if wire::token_is_server_like(sender) {
        core.oper_notice(&format!(
            "Unknown prefix ({}) from {}, Squitting {}",
            line, peer_name, sender
        ));
        core.send(
            id,
            &format!(
                ":{} SQUIT {} :(Unknown prefix ({}) from {})",
                me_token, sender, line, peer_name
            ),
        );
    } else {
        let me_name = core.me_name().to_string();
        core.send(
            id,
            &format!(
                ":{} KILL {} :{} (Unknown Client)",
                me_token, sender, me_name
            ),
        );
    }
}

/// A resolved source whose route is not the delivering link changed
/// direction mid flight; this is natural during collision bursts, so
/// the line is dropped without killing anyone.
fn cancel_clients(core: &mut Core, id: ConnId, source: EntId) {
    let source_desc = core
        .topo
        .get(source)
        .map(|e| {
            if e.is_server() {
                format!("{}", e.name)
            } else {
                let (user, host) = e.identity().unwrap_or(("", ""));
                format!("{}[{}@{}]", e.name, user, host)
            }
        })
        .unwrap_or_default();
    let peer = core
        .conns
        .get(&id.raw())
        .map(|c| c.display_name().to_string())
        .unwrap_or_default();
    core.oper_notice(&format!(
        "Message for {} from {} (TS, ignored)",
        source_desc, peer
    ));
}

/// Relays a numeric reply to the target named in its first parameter.
///
/// Numerics are mostly error reports; when something is wrong with one
/// it is dropped, never answered, to avoid reply ping-pong.
fn do_numeric(core: &mut Core, id: ConnId, src: Option<EntId>, num: &str, args: &[&str]) {
    if args.len() < 2 {
        return;
    }
    let src = match src {
        Some(h) => h,
        None => return,
    };
    if !core.topo.get(src).map(|e| e.is_server()).unwrap_or(false) {
        return;
    }

    // remap low numerics so clients do not mistake them for the
    // registration burst
    let mut numeric = num.to_string();
    if numeric.starts_with('0') {
        numeric.replace_range(0..1, "1");
    }
    let value: u32 = numeric.parse().unwrap_or(0);

    // bounded textual reconstruction of the remainder
    let mut buffer = String::new();
    for p in &args[1..args.len() - 1] {
        buffer.push(' ');
        buffer.push_str(p);
    }
    buffer.push_str(" :");
    buffer.push_str(args[args.len() - 1]);

    let target = match core.topo.find_any(args[0]) {
        Some(t) => t,
        None => return,
    };

    if target == core.topo.me {
        // kill crossfire during a collision burst produces these;
        // both sides kill both nicks, so the second kill always
        // misses
        if value != numeric::ERR_NOSUCHNICK && value != numeric::ERR_NOSUCHSERVER {
            let (src_name, peer) = (
                core.topo.get(src).map(|e| e.name.clone()).unwrap_or_default(),
                core.conns
                    .get(&id.raw())
                    .map(|c| c.display_name().to_string())
                    .unwrap_or_default(),
            );
            core.oper_notice(&format!(
                "*** {}(via {}) sent a {} numeric to me:{}",
                src_name, peer, numeric, buffer
            ));
        }
        return;
    }

    let (route, target_token, src_token) = {
        let ent = match core.topo.get(target) {
            Some(e) => e,
            None => return,
        };
        // the collision-burst race applies to locally attached users
        // just the same as to the local node
        if ent.is_client()
            && ent.parent == Some(core.topo.me)
            && (value == numeric::ERR_NOSUCHNICK || value == numeric::ERR_NOSUCHSERVER)
        {
            return;
        }
        let route = match ent.from {
            Some(r) => r,
            None => return,
        };
        if route == id {
            // changed direction, ignore
            return;
        }
        let conn = match core.conns.get(&route.raw()) {
            Some(c) => c,
            None => return,
        };
        let src_token = core
            .topo
            .get(src)
            .map(|e| core.ent_wire_for(e, conn))
            .unwrap_or_default();
        (route, core.ent_wire_for(ent, conn), src_token)
    };
    core.send(
        route,
        &format!(":{} {} {}{}", src_token, numeric, target_token, buffer),
    );
}
