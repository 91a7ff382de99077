//! ENCAP: encapsulated subcommand relay, and the GCAP payload that
//! rides on it.

use crate::dagon::conn::{caps, ConnId};
use crate::dagon::core::Core;
use crate::dagon::msgtab::{
    mg_ignore, HandlerStatus, Message, MessageEntry, MsgTable,
};
use crate::dagon::parse;
use crate::dagon::topology::{EntId, Entity};
use crate::dagon::wire;

use super::{build_relays, send_relays};

pub fn register(tab: &mut MsgTable) {
    tab.add(Message::new(
        "ENCAP",
        [
            mg_ignore(),
            mg_ignore(),
            MessageEntry::new(ms_encap, 3),
            mg_ignore(),
        ],
    ));
    tab.add(Message::new(
        "GCAP",
        [
            mg_ignore(),
            mg_ignore(),
            mg_ignore(),
            MessageEntry::new(me_gcap, 2),
        ],
    ));
}

// :<source> ENCAP <target mask> <subcommand> [<args>]
fn ms_encap(core: &mut Core, id: ConnId, src: Option<EntId>, parv: &[&str]) -> HandlerStatus {
    let src = match src {
        Some(s) => s,
        None => return HandlerStatus::DropLine,
    };
    let mask = parv[1].to_string();

    // rebuild the tail once; the last parameter goes back behind a
    // colon so embedded spaces survive the relay
    let mut tail = String::new();
    for (i, p) in parv[2..].iter().enumerate() {
        tail.push(' ');
        if i == parv.len() - 3 {
            tail.push(':');
        }
        tail.push_str(p);
    }

    let relays = build_relays(core, Some(id), caps::ENCAP, |c, conn| {
        let ent = c.topo.get(src)?;
        Some(format!(
            ":{} ENCAP {}{}",
            c.ent_wire_for(ent, conn),
            mask,
            tail
        ))
    });
    send_relays(core, relays);

    // execute locally when the mask covers us
    let me_name = core.me_name().to_string();
    if wire::mask_match(&mask, &me_name) {
        let mut sub: Vec<&str> = Vec::with_capacity(parv.len() - 1);
        sub.push(parv[0]);
        sub.extend_from_slice(&parv[3..]);
        parse::handle_encap(core, id, Some(src), parv[2], &sub);
    }
    HandlerStatus::Continue
}

// :<sid> ENCAP * GCAP :<caps>
fn me_gcap(core: &mut Core, _conn: ConnId, src: Option<EntId>, parv: &[&str]) -> HandlerStatus {
    let src = match src {
        Some(s) => s,
        None => return HandlerStatus::DropLine,
    };
    if let Some(sx) = core.topo.get_mut(src).and_then(Entity::serv_mut) {
        sx.fullcaps = Some(parv[1].to_string());
    }
    HandlerStatus::Continue
}

#[cfg(test)]
mod tests {
    use crate::dagon::parse::parse;
    use crate::dagon::testutil::{drain, server_conn, test_core};

    #[test]
    fn test_gcap_stored_on_entity() {
        let mut core = test_core();
        let b = server_conn(&mut core, "irc.b.net", "42X");
        parse(&mut core, b, ":42X ENCAP * GCAP :QS EX IE ZIP");
        let ent = core.conns.get(&b.raw()).unwrap().entity.unwrap();
        assert_eq!(
            core.topo.get(ent).unwrap().serv().unwrap().fullcaps.as_deref(),
            Some("QS EX IE ZIP")
        );
    }

    #[test]
    fn test_encap_relays_to_capable_peers() {
        let mut core = test_core();
        let b = server_conn(&mut core, "irc.b.net", "42X");
        let hub = server_conn(&mut core, "irc.hub.net", "99Y");
        drain(&mut core, hub);

        parse(&mut core, b, ":42X ENCAP * GCAP :QS EX");
        let out = drain(&mut core, hub);
        assert!(out.contains(&":42X ENCAP * GCAP :QS EX".to_string()));
        assert!(drain(&mut core, b).is_empty());
    }
}
