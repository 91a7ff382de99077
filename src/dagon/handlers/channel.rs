//! Room state from peers: SJOIN, TB and BMASK.

use crate::dagon::conn::{caps, ConnId};
use crate::dagon::core::Core;
use crate::dagon::msgtab::{
    mg_ignore, HandlerStatus, Message, MessageEntry, MsgTable,
};
use crate::dagon::topology::room::Modes;
use crate::dagon::topology::{EntId, Topic, ROLE_CHANOP, ROLE_VOICE};

use super::{build_relays, send_relays};

pub fn register(tab: &mut MsgTable) {
    tab.add(Message::new(
        "SJOIN",
        [
            mg_ignore(),
            mg_ignore(),
            MessageEntry::new(ms_sjoin, 5),
            mg_ignore(),
        ],
    ));
    tab.add(Message::new(
        "TB",
        [
            mg_ignore(),
            mg_ignore(),
            MessageEntry::new(ms_tb, 4),
            mg_ignore(),
        ],
    ));
    tab.add(Message::new(
        "BMASK",
        [
            mg_ignore(),
            mg_ignore(),
            MessageEntry::new(ms_bmask, 5),
            mg_ignore(),
        ],
    ));
}

fn parse_modes(simple: &str, params: &[&str]) -> Modes {
    let mut modes = Modes::default();
    let mut params = params.iter();
    for c in simple.chars() {
        match c {
            '+' => {}
            'k' => modes.key = params.next().map(|p| p.to_string()),
            'l' => modes.limit = params.next().and_then(|p| p.parse().ok()),
            other => modes.simple.push(other),
        }
    }
    modes
}

// :<sid> SJOIN <ts> <room> <modes> [<mode params>] :<members>
fn ms_sjoin(core: &mut Core, id: ConnId, _src: Option<EntId>, parv: &[&str]) -> HandlerStatus {
    let ts: u64 = parv[1].parse().unwrap_or(0);
    let name = parv[2].to_string();
    if !name.starts_with('#') {
        return HandlerStatus::DropLine;
    }
    let mode_params = if parv.len() > 5 {
        &parv[4..parv.len() - 1]
    } else {
        &[][..]
    };
    let incoming_modes = parse_modes(parv[3], mode_params);
    let members = parv[parv.len() - 1];

    // the lower creation timestamp wins on merge
    let (keep_their_flags, adopt_their_modes) = match core.topo.room(&name) {
        None => (true, true),
        Some(room) => {
            if ts < room.ts {
                (true, true)
            } else if ts == room.ts {
                (true, false)
            } else {
                (false, false)
            }
        }
    };
    let merged_ts = core.topo.room(&name).map(|r| r.ts.min(ts)).unwrap_or(ts);

    let mut joined: Vec<(EntId, u8)> = Vec::new();
    for token in members.split(' ').filter(|t| !t.is_empty()) {
        let mut flags = 0u8;
        let mut rest = token;
        loop {
            match rest.as_bytes().first() {
                Some(b'@') => flags |= ROLE_CHANOP,
                Some(b'+') => flags |= ROLE_VOICE,
                _ => break,
            }
            rest = &rest[1..];
        }
        let ent = match core.topo.find_any(rest) {
            Some(e) => e,
            None => continue,
        };
        let flags = if keep_their_flags { flags } else { 0 };
        if core.topo.join_room(&name, ts, ent, flags) {
            joined.push((ent, flags));
        }
    }

    if let Some(room) = core.topo.room_mut(&name) {
        room.ts = merged_ts;
        if adopt_their_modes {
            room.modes = incoming_modes;
        }
    }

    if joined.is_empty() {
        return HandlerStatus::DropLine;
    }

    // relay what actually merged, in each peer's wire format
    let modes_str = core
        .topo
        .room(&name)
        .map(|r| r.modes.render())
        .unwrap_or_else(|| "+".to_string());
    let relays = build_relays(core, Some(id), 0, |c, conn| {
        let mut list = String::new();
        for &(ent, flags) in joined.iter() {
            let ent = c.topo.get(ent)?;
            match (flags & ROLE_CHANOP != 0, flags & ROLE_VOICE != 0) {
                (true, true) => list.push_str("@+"),
                (true, false) => list.push('@'),
                (false, true) => list.push('+'),
                (false, false) => {}
            }
            list.push_str(&c.ent_wire_for(ent, conn));
            list.push(' ');
        }
        let me = c.me_wire_for(conn);
        Some(format!(
            ":{} SJOIN {} {} {} :{}",
            me,
            merged_ts,
            name,
            modes_str,
            list.trim_end()
        ))
    });
    send_relays(core, relays);
    HandlerStatus::Continue
}

// :<sid> TB <room> <ts> [<author>] :<topic>
fn ms_tb(core: &mut Core, id: ConnId, src: Option<EntId>, parv: &[&str]) -> HandlerStatus {
    let name = parv[1].to_string();
    let ts: u64 = parv[2].parse().unwrap_or(0);
    let (author, text) = if parv.len() > 4 {
        (parv[3].to_string(), parv[4].to_string())
    } else {
        let author = src
            .and_then(|s| core.topo.get(s))
            .map(|e| e.name.clone())
            .unwrap_or_default();
        (author, parv[3].to_string())
    };

    let accept = match core.topo.room(&name) {
        // rooms we do not know stay unknown; TB never creates one
        None => return HandlerStatus::DropLine,
        Some(room) => match &room.topic {
            None => true,
            // the older topic wins, like the room timestamp
            Some(t) => ts < t.ts,
        },
    };
    if !accept {
        return HandlerStatus::DropLine;
    }
    if let Some(room) = core.topo.room_mut(&name) {
        room.topic = Some(Topic {
            text: text.clone(),
            author: author.clone(),
            ts,
        });
    }

    let relays = build_relays(core, Some(id), caps::TB, |c, conn| {
        Some(format!(
            ":{} TB {} {} {} :{}",
            c.me_wire_for(conn),
            name,
            ts,
            author,
            text
        ))
    });
    send_relays(core, relays);
    HandlerStatus::Continue
}

// :<sid> BMASK <ts> <room> <flag> :<masks>
fn ms_bmask(core: &mut Core, id: ConnId, _src: Option<EntId>, parv: &[&str]) -> HandlerStatus {
    let ts: u64 = parv[1].parse().unwrap_or(0);
    let name = parv[2].to_string();
    let flag = match parv[3].chars().next() {
        Some(f @ ('b' | 'e' | 'I')) => f,
        _ => return HandlerStatus::DropLine,
    };
    let masks = parv[4];

    let accepted = match core.topo.room_mut(&name) {
        None => return HandlerStatus::DropLine,
        Some(room) => {
            // masks from the losing side of a split are stale
            if ts > room.ts {
                return HandlerStatus::DropLine;
            }
            let list = match room.mask_list_mut(flag) {
                Some(l) => l,
                None => return HandlerStatus::DropLine,
            };
            let mut accepted = Vec::new();
            for mask in masks.split(' ').filter(|m| !m.is_empty()) {
                if !list.iter().any(|m| m == mask) {
                    list.push(mask.to_string());
                    accepted.push(mask.to_string());
                }
            }
            accepted
        }
    };
    if accepted.is_empty() {
        return HandlerStatus::DropLine;
    }

    let joined = accepted.join(" ");
    let relays = build_relays(core, Some(id), caps::TS6, |c, conn| {
        Some(format!(
            ":{} BMASK {} {} {} :{}",
            c.me_wire_for(conn),
            ts,
            name,
            flag,
            joined
        ))
    });
    send_relays(core, relays);
    HandlerStatus::Continue
}

#[cfg(test)]
mod tests {
    use crate::dagon::parse::parse;
    use crate::dagon::testutil::{drain, remote_client, server_conn, test_core};
    use crate::dagon::topology::{ROLE_CHANOP, ROLE_VOICE};

    #[test]
    fn test_sjoin_creates_room_with_members() {
        let mut core = test_core();
        let b = server_conn(&mut core, "irc.b.net", "42X");
        remote_client(&mut core, b, "alice", 1000, "42XAAAAAA");
        remote_client(&mut core, b, "bob", 1000, "42XAAAAAB");

        parse(
            &mut core,
            b,
            ":42X SJOIN 900 #chat +nt :@42XAAAAAA +42XAAAAAB",
        );
        let room = core.topo.room("#chat").expect("created");
        assert_eq!(room.ts, 900);
        assert_eq!(room.modes.simple, "nt");
        assert_eq!(room.members.len(), 2);
        let alice = core.topo.find_id("42XAAAAAA").unwrap();
        let bob = core.topo.find_id("42XAAAAAB").unwrap();
        assert_eq!(room.members.get(&alice.raw()), Some(&ROLE_CHANOP));
        assert_eq!(room.members.get(&bob.raw()), Some(&ROLE_VOICE));
    }

    #[test]
    fn test_sjoin_lower_ts_wins() {
        let mut core = test_core();
        let b = server_conn(&mut core, "irc.b.net", "42X");
        let alice = remote_client(&mut core, b, "alice", 1000, "42XAAAAAA");
        remote_client(&mut core, b, "bob", 1000, "42XAAAAAB");
        core.topo.join_room("#chat", 1000, alice, ROLE_CHANOP);
        core.topo.room_mut("#chat").unwrap().modes.simple = "s".to_string();

        // an older creation wipes our modes and keeps theirs
        parse(&mut core, b, ":42X SJOIN 900 #chat +nt :@42XAAAAAB");
        let room = core.topo.room("#chat").unwrap();
        assert_eq!(room.ts, 900);
        assert_eq!(room.modes.simple, "nt");

        // a younger join gains no status
        parse(&mut core, b, ":42X SJOIN 950 #chat +m :@42XAAAAAA");
        let room = core.topo.room("#chat").unwrap();
        assert_eq!(room.ts, 900);
        assert_eq!(room.modes.simple, "nt");
    }

    #[test]
    fn test_sjoin_relays_to_other_peers() {
        let mut core = test_core();
        let b = server_conn(&mut core, "irc.b.net", "42X");
        let hub = server_conn(&mut core, "irc.hub.net", "99Y");
        remote_client(&mut core, b, "alice", 1000, "42XAAAAAA");
        drain(&mut core, hub);

        parse(&mut core, b, ":42X SJOIN 900 #chat +nt :@42XAAAAAA");
        let out = drain(&mut core, hub);
        assert!(out
            .iter()
            .any(|l| l == ":42A SJOIN 900 #chat +nt :@42XAAAAAA"));
    }

    #[test]
    fn test_tb_older_topic_wins() {
        let mut core = test_core();
        let b = server_conn(&mut core, "irc.b.net", "42X");
        let alice = remote_client(&mut core, b, "alice", 1000, "42XAAAAAA");
        core.topo.join_room("#chat", 900, alice, 0);

        parse(&mut core, b, ":42X TB #chat 950 alice :first");
        assert_eq!(
            core.topo.room("#chat").unwrap().topic.as_ref().unwrap().text,
            "first"
        );
        // a younger topic does not replace it
        parse(&mut core, b, ":42X TB #chat 980 bob :second");
        assert_eq!(
            core.topo.room("#chat").unwrap().topic.as_ref().unwrap().text,
            "first"
        );
        // an older one does
        parse(&mut core, b, ":42X TB #chat 940 carol :oldest");
        assert_eq!(
            core.topo.room("#chat").unwrap().topic.as_ref().unwrap().text,
            "oldest"
        );
    }

    #[test]
    fn test_bmask_applies_and_ignores_stale() {
        let mut core = test_core();
        let b = server_conn(&mut core, "irc.b.net", "42X");
        let alice = remote_client(&mut core, b, "alice", 1000, "42XAAAAAA");
        core.topo.join_room("#chat", 900, alice, 0);

        parse(&mut core, b, ":42X BMASK 900 #chat b :*!*@x.example *!*@y.example");
        assert_eq!(core.topo.room("#chat").unwrap().bans.len(), 2);

        // stale timestamp: the masks lost their split
        parse(&mut core, b, ":42X BMASK 950 #chat b :*!*@z.example");
        assert_eq!(core.topo.room("#chat").unwrap().bans.len(), 2);
    }
}
