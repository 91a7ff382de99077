//! SERVER and SID: introducing servers, directly or behind a peer.

use crate::dagon::conn::{caps, ConnId};
use crate::dagon::core::Core;
use crate::dagon::handshake::{self, CheckError};
use crate::dagon::msgtab::{
    mg_ignore, mg_reg, HandlerStatus, Message, MessageEntry, MsgTable,
};
use crate::dagon::topology::EntId;
use crate::dagon::wire;

use super::{build_relays, send_relays};

pub fn register(tab: &mut MsgTable) {
    tab.add(Message::new(
        "SERVER",
        [
            MessageEntry::new(mr_server, 4),
            mg_reg(),
            MessageEntry::new(ms_server, 4),
            mg_ignore(),
        ],
    ));
    tab.add(Message::new(
        "SID",
        [
            mg_ignore(),
            mg_reg(),
            MessageEntry::new(ms_sid, 5),
            mg_ignore(),
        ],
    ));
}

/// Strips the optional `[IP]` token and the `(H)` hidden marker from a
/// server info string. An empty remainder gets the conventional
/// placeholder.
pub fn parse_server_gecos(info: &str) -> (String, bool) {
    let mut hidden = false;
    let mut rest = info.trim();

    // the first word may be a bracketed address; only ever one
    if let Some(first) = rest.split(' ').next() {
        if first.contains(']') {
            rest = rest[first.len()..].trim_start();
        }
    }
    if let Some(first) = rest.split(' ').next() {
        if first == "(H)" {
            hidden = true;
            rest = rest[first.len()..].trim_start();
        }
    }

    if rest.is_empty() {
        ("(Unknown Location)".to_string(), hidden)
    } else {
        (rest.to_string(), hidden)
    }
}

// SERVER from an unregistered connection: the peer itself wants in.
//
//      parv[1] = servername
//      parv[2] = hopcount
//      parv[3] = serverinfo
fn mr_server(core: &mut Core, id: ConnId, _src: Option<EntId>, parv: &[&str]) -> HandlerStatus {
    let name = parv[1].to_string();
    let (info, hidden) = parse_server_gecos(parv[3]);

    let peer_desc = core
        .conns
        .get(&id.raw())
        .map(|c| format!("{}[{}]", c.display_name(), c.addr))
        .unwrap_or_default();

    // reject a link that never negotiated timestamps
    let has_ts = core
        .conns
        .get(&id.raw())
        .map(|c| c.has_cap(caps::TS))
        .unwrap_or(false);
    if !has_ts {
        core.oper_notice(&format!("Link {} dropped, non-TS server", peer_desc));
        return HandlerStatus::DropLink("Non-TS server".to_string());
    }

    if !wire::valid_server_name(&name) {
        return HandlerStatus::DropLink("Bogus server name".to_string());
    }

    match handshake::check_server(core, id, &name) {
        Ok(_) => {}
        Err(CheckError::NoEntry) => {
            if core.conf.limits.warn_no_entry {
                core.oper_notice(&format!(
                    "Unauthorised server connection attempt from {}: No entry for servername {}",
                    peer_desc, name
                ));
            }
            return HandlerStatus::DropLink("Invalid servername.".to_string());
        }
        Err(CheckError::BadPassword) => {
            core.oper_notice(&format!(
                "Unauthorised server connection attempt from {}: Bad password for server {}",
                peer_desc, name
            ));
            return HandlerStatus::DropLink("Invalid password.".to_string());
        }
        Err(CheckError::BadHost) => {
            core.oper_notice(&format!(
                "Unauthorised server connection attempt from {}: Invalid host for server {}",
                peer_desc, name
            ));
            return HandlerStatus::DropLink("Invalid host.".to_string());
        }
        Err(CheckError::InvalidName) => {
            core.oper_notice(&format!("Invalid servername {} from {}", name, peer_desc));
            return HandlerStatus::DropLink("Invalid servername.".to_string());
        }
    }

    if core.topo.server_exists(&name).is_some() {
        core.oper_notice(&format!(
            "Attempt to re-introduce server {} from {}",
            name, peer_desc
        ));
        core.send(id, "ERROR :Server already exists.");
        return HandlerStatus::DropLink("Server Exists".to_string());
    }

    let offered_sid = core
        .conns
        .get(&id.raw())
        .and_then(|c| c.offered_sid.clone());
    if let Some(sid) = offered_sid {
        if core.topo.find_id(&sid).is_some() {
            core.oper_notice(&format!(
                "Attempt to re-introduce SID {} from {}",
                sid, peer_desc
            ));
            core.send(id, "ERROR :SID already exists.");
            return HandlerStatus::DropLink("SID Exists".to_string());
        }
    }

    if let Some(conn) = core.conns.get_mut(&id.raw()) {
        conn.name = name;
    }
    handshake::server_estab(core, id, &info, hidden)
}

// checks the hub/leaf policy of the delivering link for a server it
// wants to introduce; every connect block matching the link's name
// contributes its masks
fn hub_leaf_check(core: &Core, link_name: &str, new_name: &str) -> (bool, bool) {
    let mut hub = false;
    let mut leaf = false;
    for block in core.conf.connect.iter() {
        if !wire::mask_match(&block.name, link_name) {
            continue;
        }
        if block
            .hub_mask
            .iter()
            .any(|m| wire::mask_match(m, new_name))
        {
            hub = true;
        }
        if block
            .leaf_mask
            .iter()
            .any(|m| wire::mask_match(m, new_name))
        {
            leaf = true;
        }
    }
    (hub, leaf)
}

fn link_name(core: &Core, id: ConnId) -> String {
    core.conns
        .get(&id.raw())
        .map(|c| c.display_name().to_string())
        .unwrap_or_default()
}

// a server behind an established peer announces another server, name
// form
fn ms_server(core: &mut Core, id: ConnId, src: Option<EntId>, parv: &[&str]) -> HandlerStatus {
    let src = match src {
        Some(s) => s,
        None => return HandlerStatus::DropLine,
    };
    let name = parv[1].to_string();
    let hop: u32 = parv[2].parse().unwrap_or(0);
    let (info, hidden) = parse_server_gecos(parv[3]);
    let peer = link_name(core, id);

    if let Some(existing) = core.topo.server_exists(&name) {
        // behind a host-masked relay the same server may echo back;
        // answering would delink whoever we propagate to
        let (ex_name, ex_from) = match core.topo.get(existing) {
            Some(e) => (e.name.clone(), e.from),
            None => (String::new(), None),
        };
        if !wire::name_eq(&ex_name, &name) && ex_from == Some(id) {
            return HandlerStatus::DropLine;
        }
        core.send(id, &format!("ERROR :Server {} already exists", name));
        core.oper_notice(&format!(
            "Link {} cancelled, server {} already exists",
            peer, name
        ));
        return HandlerStatus::DropLink("Server Exists".to_string());
    }

    // user nicks never contain dots; a dotless server name is a
    // nick/server collision waiting to confuse the whole mesh
    if !name.contains('.') {
        core.send(id, &format!("ERROR :Nickname {} already exists!", name));
        core.oper_notice(&format!(
            "Link {} cancelled: Server/nick collision on {}",
            peer, name
        ));
        return HandlerStatus::DropLink("Nick as Server".to_string());
    }

    if parv[3].is_empty() {
        core.send(id, &format!("ERROR :No server info specified for {}", name));
        return HandlerStatus::DropLine;
    }

    let (hub, leaf) = hub_leaf_check(core, &peer, &name);
    if !hub {
        core.oper_notice(&format!("Non-Hub link {} introduced {}.", peer, name));
        return HandlerStatus::DropLink("No matching hub_mask.".to_string());
    }
    if leaf {
        core.oper_notice(&format!("Link {} introduced leafed server {}.", peer, name));
        return HandlerStatus::DropLink("Leafed Server.".to_string());
    }

    if name.len() > wire::HOST_LEN {
        core.oper_notice(&format!(
            "Link {} introduced server with invalid servername {}",
            peer, name
        ));
        return HandlerStatus::DropLink("Invalid servername introduced.".to_string());
    }

    introduce_server(core, id, src, &name, None, hop, &info, hidden)
}

// SID: id form of the same introduction
//
//      parv[1] = servername
//      parv[2] = hopcount
//      parv[3] = sid
//      parv[4] = serverinfo
fn ms_sid(core: &mut Core, id: ConnId, src: Option<EntId>, parv: &[&str]) -> HandlerStatus {
    let src = match src {
        Some(s) => s,
        None => return HandlerStatus::DropLine,
    };
    let name = parv[1].to_string();
    let hop: u32 = parv[2].parse().unwrap_or(0);
    let sid = parv[3].to_string();
    let (info, hidden) = parse_server_gecos(parv[4]);
    let peer = link_name(core, id);

    if core.topo.server_exists(&name).is_some() {
        core.send(id, &format!("ERROR :Server {} already exists", name));
        core.oper_notice(&format!(
            "Link {} cancelled, server {} already exists",
            peer, name
        ));
        return HandlerStatus::DropLink("Server Exists".to_string());
    }

    if core.topo.find_id(&sid).is_some() {
        core.send(id, &format!("ERROR :SID {} already exists", sid));
        core.oper_notice(&format!(
            "Link {} cancelled, SID {} already exists",
            peer, sid
        ));
        return HandlerStatus::DropLink("Server Exists".to_string());
    }

    if !wire::valid_server_name(&name) {
        core.send(id, "ERROR :Invalid servername");
        core.oper_notice(&format!(
            "Link {} cancelled, servername {} invalid",
            peer, name
        ));
        return HandlerStatus::DropLink("Bogus server name".to_string());
    }

    if !wire::valid_sid(&sid) {
        core.send(id, "ERROR :Invalid SID");
        core.oper_notice(&format!("Link {} cancelled, SID {} invalid", peer, sid));
        return HandlerStatus::DropLink("Bogus SID".to_string());
    }

    let (hub, leaf) = hub_leaf_check(core, &peer, &name);
    if !hub {
        core.send(id, "ERROR :No matching hub_mask");
        core.oper_notice(&format!("Non-Hub link {} introduced {}.", peer, name));
        return HandlerStatus::DropLink("No matching hub_mask.".to_string());
    }
    if leaf {
        core.send(id, "ERROR :Matching leaf_mask");
        core.oper_notice(&format!("Link {} introduced leafed server {}.", peer, name));
        return HandlerStatus::DropLink("Leafed Server.".to_string());
    }

    introduce_server(core, id, src, &name, Some(sid), hop, &info, hidden)
}

// links the remote server into the graph and spreads the word
#[allow(clippy::too_many_arguments)]
fn introduce_server(
    core: &mut Core,
    id: ConnId,
    src: EntId,
    name: &str,
    sid: Option<String>,
    hop: u32,
    info: &str,
    hidden: bool,
) -> HandlerStatus {
    let (src_name, src_sid) = match core.topo.get(src) {
        Some(e) => (e.name.clone(), e.sid.clone()),
        None => return HandlerStatus::DropLine,
    };

    let ent = core
        .topo
        .add_server(src, Some(id), name, sid.clone(), hop, info, hidden);
    let up = core.scache.find_or_add(&src_name);
    if let Some(sx) = core.topo.get_mut(ent).and_then(|e| e.serv_mut()) {
        sx.up = Some(up);
        sx.upid = src_sid.clone();
    }

    let hid = if hidden { "(H) " } else { "" };
    let relays = build_relays(core, Some(id), 0, |_, conn| {
        if conn.has_cap(caps::TS6) && sid.is_some() && src_sid.is_some() {
            Some(format!(
                ":{} SID {} {} {} :{}{}",
                src_sid.as_deref().unwrap_or(""),
                name,
                hop + 1,
                sid.as_deref().unwrap_or(""),
                hid,
                info
            ))
        } else {
            Some(format!(
                ":{} SERVER {} {} :{}{}",
                src_name,
                name,
                hop + 1,
                hid,
                info
            ))
        }
    });
    send_relays(core, relays);

    core.oper_notice(&format!(
        "Server {} being introduced by {}",
        name, src_name
    ));

    // quick, dirty end-of-burst probe toward the new server
    let (me_token, me_name, target) = {
        let conn = match core.conns.get(&id.raw()) {
            Some(c) => c,
            None => return HandlerStatus::Continue,
        };
        let target = core
            .topo
            .get(ent)
            .map(|e| core.ent_wire_for(e, conn))
            .unwrap_or_default();
        (core.me_wire_for(conn), core.me_name().to_string(), target)
    };
    core.send(id, &format!(":{} PING {} {}", me_token, me_name, target));

    HandlerStatus::Continue
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dagon::config::Config;
    use crate::dagon::conn::Status;
    use crate::dagon::core::{event_channel, Core};
    use crate::dagon::linebuf::BUF_DATA_SIZE;
    use crate::dagon::parse::parse;

    const CONF: &str = r#"
[server]
name = "irc.a.net"
sid = "42A"
info = "A Network"
hub = true

[[connect]]
name = "irc.b.net"
host = "*"
accept_password = "s3cret"
send_password = "s3cret"
hub_mask = ["*"]

[[connect]]
name = "irc.hub.net"
host = "*"
accept_password = "s3cret"
hub_mask = ["*"]
leaf_mask = ["*.edu"]
"#;

    fn test_core() -> Core {
        let conf = Config::from_toml_str(CONF).unwrap();
        let log = slog::Logger::root(slog::Discard, slog::o!());
        let (tx, _rx) = event_channel();
        Core::new(conf, log, tx)
    }

    fn drain(core: &mut Core, id: ConnId) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(conn) = core.conns.get_mut(&id.raw()) {
            let mut buf = [0u8; BUF_DATA_SIZE];
            loop {
                let n = conn.sendq.get(&mut buf, false, false);
                if n == 0 {
                    break;
                }
                out.push(String::from_utf8_lossy(&buf[..n]).into_owned());
            }
        }
        out
    }

    fn inbound(core: &mut Core) -> ConnId {
        core.register_connection(None, "203.0.113.7".into(), String::new())
    }

    fn established(core: &mut Core, name: &str, sid: &str) -> ConnId {
        let id = inbound(core);
        parse(core, id, &format!("PASS s3cret TS 6 :{}", sid));
        parse(core, id, "CAPAB :QS EX IE ENCAP TB");
        parse(core, id, &format!("SERVER {} 1 :peer", name));
        assert!(core.conns.get(&id.raw()).unwrap().is_server());
        drain(core, id);
        id
    }

    #[test]
    fn test_gecos_parsing() {
        assert_eq!(parse_server_gecos("B Network"), ("B Network".into(), false));
        assert_eq!(parse_server_gecos("(H) B Network"), ("B Network".into(), true));
        assert_eq!(
            parse_server_gecos("[192.0.2.1] (H) B Network"),
            ("B Network".into(), true)
        );
        assert_eq!(
            parse_server_gecos(""),
            ("(Unknown Location)".into(), false)
        );
    }

    #[test]
    fn test_happy_link() {
        let mut core = test_core();
        let id = inbound(&mut core);

        parse(&mut core, id, "PASS s3cret TS 6 :42X");
        parse(&mut core, id, "CAPAB :TS6 ENCAP");
        parse(&mut core, id, "SERVER irc.b.net 1 :B Network");

        let out = drain(&mut core, id);
        assert!(out.iter().any(|l| l.starts_with("PASS s3cret TS 6 :42A")));
        assert!(out.iter().any(|l| l.starts_with("CAPAB :")));
        assert!(out.iter().any(|l| l == "SERVER irc.a.net 1 :A Network"));
        assert!(out.iter().any(|l| l.starts_with("SVINFO 6 6 0 :")));
        assert_eq!(out.last().unwrap(), "PING :42A");

        // the graph now holds irc.b.net with its id, under us
        let b = core.topo.find_name("irc.b.net").expect("linked");
        let ent = core.topo.get(b).unwrap();
        assert_eq!(ent.sid.as_deref(), Some("42X"));
        assert_eq!(ent.parent, Some(core.topo.me));
        let conn = core.conns.get(&id.raw()).unwrap();
        assert_eq!(conn.status, Status::Server);
        assert_eq!(conn.entity, Some(b));
    }

    #[test]
    fn test_bad_password_rejected() {
        let mut core = test_core();
        let id = inbound(&mut core);
        parse(&mut core, id, "PASS wrong TS 6 :42X");
        parse(&mut core, id, "CAPAB :TS6 ENCAP");
        parse(&mut core, id, "SERVER irc.b.net 1 :B Network");
        assert!(core.conns.get(&id.raw()).unwrap().is_exiting());
        assert!(core.topo.find_name("irc.b.net").is_none());
    }

    #[test]
    fn test_non_ts_link_dropped() {
        let mut core = test_core();
        let id = inbound(&mut core);
        parse(&mut core, id, "PASS s3cret");
        parse(&mut core, id, "SERVER irc.b.net 1 :B Network");
        assert!(core.conns.get(&id.raw()).unwrap().is_exiting());
    }

    #[test]
    fn test_remote_introduction_and_propagation() {
        let mut core = test_core();
        let b = established(&mut core, "irc.b.net", "42X");
        let hub = established(&mut core, "irc.hub.net", "99Y");

        parse(&mut core, b, ":42X SID irc.c.net 2 42C :C Net");

        let c = core.topo.find_name("irc.c.net").expect("introduced");
        let ent = core.topo.get(c).unwrap();
        assert_eq!(ent.sid.as_deref(), Some("42C"));
        assert_eq!(
            ent.parent,
            core.topo.find_name("irc.b.net")
        );
        assert_eq!(ent.from, Some(b));

        // the other peer heard about it in id form with bumped hop
        let out = drain(&mut core, hub);
        assert!(out.contains(&":42X SID irc.c.net 3 42C :C Net".to_string()));
        // and the new server got an end-of-burst probe
        let out_b = drain(&mut core, b);
        assert!(out_b.iter().any(|l| l == ":42A PING irc.a.net 42C"));
    }

    #[test]
    fn test_sid_collision_drops_second_link() {
        let mut core = test_core();
        let b = established(&mut core, "irc.b.net", "42X");
        let hub = established(&mut core, "irc.hub.net", "99Y");

        parse(&mut core, b, ":42X SID irc.c.net 2 42C :C Net");
        drain(&mut core, hub);
        parse(&mut core, hub, ":99Y SID irc.d.net 2 42C :D Net");

        let out = drain(&mut core, hub);
        assert!(out.contains(&"ERROR :SID 42C already exists".to_string()));
        assert!(out
            .iter()
            .any(|l| l.contains("ERROR :Closing Link") && l.contains("Server Exists")));
        assert!(core.conns.get(&hub.raw()).unwrap().is_exiting());
        // the first introduction is untouched
        assert!(core.topo.find_id("42C").is_some());
        assert!(core.topo.find_name("irc.d.net").is_none());
    }

    #[test]
    fn test_hub_leaf_refusal() {
        let mut core = test_core();
        let hub = established(&mut core, "irc.hub.net", "99Y");

        parse(&mut core, hub, ":99Y SID irc.school.edu 2 5CH :School");

        let out = drain(&mut core, hub);
        assert!(out.contains(&"ERROR :Matching leaf_mask".to_string()));
        assert!(out
            .iter()
            .any(|l| l.contains("ERROR :Closing Link") && l.contains("Leafed Server.")));
        assert!(core.topo.find_name("irc.school.edu").is_none());
    }

    #[test]
    fn test_dotless_server_name_is_nick_collision() {
        let mut core = test_core();
        let b = established(&mut core, "irc.b.net", "42X");
        parse(&mut core, b, ":irc.b.net SERVER leafbox 2 :No dots");
        let out = drain(&mut core, b);
        assert!(out.contains(&"ERROR :Nickname leafbox already exists!".to_string()));
        assert!(core.conns.get(&b.raw()).unwrap().is_exiting());
    }

    #[test]
    fn test_duplicate_server_reintroduction() {
        let mut core = test_core();
        let b = established(&mut core, "irc.b.net", "42X");
        let hub = established(&mut core, "irc.hub.net", "99Y");
        parse(&mut core, b, ":42X SID irc.c.net 2 42C :C Net");
        drain(&mut core, hub);

        parse(&mut core, hub, ":99Y SID irc.c.net 2 77Z :Impostor");
        let out = drain(&mut core, hub);
        assert!(out.contains(&"ERROR :Server irc.c.net already exists".to_string()));
        assert!(core.conns.get(&hub.raw()).unwrap().is_exiting());
    }
}
