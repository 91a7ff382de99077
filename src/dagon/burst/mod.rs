//! The burst: transmitting the entire visible state to a newly
//! established peer.
//!
//! Order matters and is observable: servers are announced during link
//! establishment, then every client, then every globally scoped room
//! with its membership, mask lists and optionally its topic, then a
//! PING whose answering PONG marks the end of the burst.

use crate::dagon::conn::{caps, ConnId};
use crate::dagon::core::Core;
use crate::dagon::linebuf::BUF_DATA_SIZE;
use crate::dagon::topology::{EntId, ROLE_CHANOP, ROLE_VOICE};

// the conventional wire threshold for batched lines
const BURST_THRESHOLD: usize = BUF_DATA_SIZE - 3;

// mode parameters per TS5 MODE line
const MAX_MODE_PARAMS: usize = 4;

fn status_prefix(flags: u8) -> &'static str {
    match (flags & ROLE_CHANOP != 0, flags & ROLE_VOICE != 0) {
        (true, true) => "@+",
        (true, false) => "@",
        (false, true) => "+",
        (false, false) => "",
    }
}

/// Bursts clients and rooms to a peer that just reached Server state,
/// then marks end-of-burst with a PING.
pub fn burst_to(core: &mut Core, id: ConnId) {
    let (ts6, has_ex, has_ie, has_tb) = match core.conns.get(&id.raw()) {
        Some(c) => (
            c.has_cap(caps::TS6),
            c.has_cap(caps::EX),
            c.has_cap(caps::IE),
            c.has_cap(caps::TB),
        ),
        None => return,
    };
    let burst_away = core.conf.limits.burst_away;
    let topicwho = core.conf.limits.burst_topicwho;

    let mut lines: Vec<String> = Vec::new();
    burst_clients(core, ts6, burst_away, &mut lines);
    burst_rooms(core, ts6, has_ex, has_ie, has_tb, topicwho, &mut lines);

    for line in lines {
        core.send(id, &line);
    }

    // always a PING after the burst; the matching PONG closes it
    let token = match core.conns.get(&id.raw()) {
        Some(conn) => core.me_wire_for(conn),
        None => return,
    };
    if let Some(conn) = core.conns.get_mut(&id.raw()) {
        conn.awaiting_pong = true;
    }
    core.send(id, &format!("PING :{}", token));
}

fn burst_clients(core: &Core, ts6: bool, burst_away: bool, out: &mut Vec<String>) {
    for &h in core.topo.global_clients.iter() {
        let ent = match core.topo.get(h) {
            Some(e) => e,
            None => continue,
        };
        let cx = match ent.client() {
            Some(c) => c,
            None => continue,
        };
        let server = ent.parent.and_then(|p| core.topo.get(p));
        let umodes = if cx.umodes.is_empty() { "+" } else { &cx.umodes };

        let uses_id = ts6
            && ent.sid.is_some()
            && server.and_then(|s| s.sid.as_deref()).is_some();
        if uses_id {
            let server = server.expect("client has a parent server");
            out.push(format!(
                ":{} UID {} {} {} {} {} {} {} {} :{}",
                server.sid.as_deref().unwrap_or(""),
                ent.name,
                ent.hop + 1,
                ent.ts,
                umodes,
                cx.user,
                cx.host,
                if cx.ip.is_empty() { "0" } else { &cx.ip },
                ent.sid.as_deref().unwrap_or(""),
                ent.info
            ));
        } else {
            out.push(format!(
                "NICK {} {} {} {} {} {} {} :{}",
                ent.name,
                ent.hop + 1,
                ent.ts,
                umodes,
                cx.user,
                cx.host,
                server.map(|s| s.name.as_str()).unwrap_or(""),
                ent.info
            ));
        }

        if burst_away {
            if let Some(away) = cx.away.as_deref().filter(|a| !a.is_empty()) {
                let token = if uses_id { ent.wire_id() } else { &ent.name };
                out.push(format!(":{} AWAY :{}", token, away));
            }
        }
    }
}

fn burst_rooms(
    core: &Core,
    ts6: bool,
    has_ex: bool,
    has_ie: bool,
    has_tb: bool,
    topicwho: bool,
    out: &mut Vec<String>,
) {
    let me_name = core.me_name();
    let me_sid = core.me_sid();
    let me_token = if ts6 { me_sid } else { me_name };

    for room in core.topo.rooms.values() {
        debug_assert!(!room.members.is_empty());
        if room.members.is_empty() || !room.is_global() {
            continue;
        }

        // membership, batched at the wire threshold
        let prefix = format!(
            ":{} SJOIN {} {} {} :",
            me_token,
            room.ts,
            room.name,
            room.modes.render()
        );
        let mlen = prefix.len();
        let mut buf = prefix.clone();
        let mut wrote = false;
        for (&raw, &flags) in room.members.iter() {
            let ent = match core.topo.get(EntId::from(raw)) {
                Some(e) => e,
                None => continue,
            };
            let token = if ts6 { ent.wire_id() } else { ent.name.as_str() };
            let tok = format!("{}{} ", status_prefix(flags), token);
            if buf.len() + tok.len() >= BURST_THRESHOLD && buf.len() > mlen {
                buf.pop();
                out.push(buf);
                buf = prefix.clone();
            }
            buf.push_str(&tok);
            wrote = true;
        }
        if wrote {
            buf.pop();
            out.push(buf);
        }

        // mask lists, flush-and-restart on overflow
        if !room.bans.is_empty() {
            burst_masks(core, ts6, room, 'b', out);
        }
        if has_ex && !room.excepts.is_empty() {
            burst_masks(core, ts6, room, 'e', out);
        }
        if has_ie && !room.invex.is_empty() {
            burst_masks(core, ts6, room, 'I', out);
        }

        if has_tb {
            if let Some(topic) = &room.topic {
                let who = if topicwho {
                    format!("{} ", topic.author)
                } else {
                    String::new()
                };
                out.push(format!(
                    ":{} TB {} {} {}:{}",
                    me_token, room.name, topic.ts, who, topic.text
                ));
            }
        }
    }
}

fn burst_masks(
    core: &Core,
    ts6: bool,
    room: &crate::dagon::topology::Room,
    flag: char,
    out: &mut Vec<String>,
) {
    let list = match room.mask_list(flag) {
        Some(l) => l,
        None => return,
    };

    if ts6 {
        let prefix = format!(
            ":{} BMASK {} {} {} :",
            core.me_sid(),
            room.ts,
            room.name,
            flag
        );
        let mlen = prefix.len();
        let mut buf = prefix.clone();
        for mask in list.iter() {
            let tlen = mask.len() + 1;
            if buf.len() + tlen > BURST_THRESHOLD {
                if buf.len() == mlen {
                    // a single mask that cannot fit at all; the per
                    // line cap upstream makes this unreachable
                    debug_assert!(false, "unfittable mask in burst");
                    continue;
                }
                buf.pop();
                out.push(buf);
                buf = prefix.clone();
            }
            buf.push_str(mask);
            buf.push(' ');
        }
        if buf.len() > mlen {
            buf.pop();
            out.push(buf);
        }
    } else {
        // name form: MODE lines carrying up to four masks each
        let base = format!(":{} MODE {} +", core.me_name(), room.name);
        let mut flags = String::new();
        let mut params = String::new();
        let mut count = 0;
        for mask in list.iter() {
            let tlen = mask.len() + 3;
            if count >= MAX_MODE_PARAMS
                || base.len() + flags.len() + params.len() + tlen + 2 > BURST_THRESHOLD
            {
                out.push(format!("{}{} {}", base, flags, params.trim_end()));
                flags.clear();
                params.clear();
                count = 0;
            }
            flags.push(flag);
            params.push_str(mask);
            params.push(' ');
            count += 1;
        }
        if count != 0 {
            out.push(format!("{}{} {}", base, flags, params.trim_end()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dagon::config::Config;
    use crate::dagon::conn::Status;
    use crate::dagon::core::{event_channel, Core};
    use crate::dagon::linebuf::BUF_DATA_SIZE as CAP;
    use crate::dagon::topology::NewClient;

    fn test_core() -> Core {
        let conf = Config::from_toml_str(
            r#"
[server]
name = "irc.a.net"
sid = "42A"
hub = true
"#,
        )
        .unwrap();
        let log = slog::Logger::root(slog::Discard, slog::o!());
        let (tx, _rx) = event_channel();
        Core::new(conf, log, tx)
    }

    fn peer(core: &mut Core, ts6: bool) -> ConnId {
        let id = core.register_connection(None, "203.0.113.7".into(), String::new());
        let conn = core.conns.get_mut(&id.raw()).unwrap();
        conn.status = Status::Server;
        conn.name = "irc.b.net".to_string();
        conn.caps = caps::TS | caps::EX | caps::IE | caps::TB;
        if ts6 {
            conn.caps |= caps::TS6;
        }
        id
    }

    fn drain(core: &mut Core, id: ConnId) -> Vec<String> {
        let mut out = Vec::new();
        let conn = core.conns.get_mut(&id.raw()).unwrap();
        let mut buf = [0u8; CAP];
        loop {
            let n = conn.sendq.get(&mut buf, false, false);
            if n == 0 {
                break;
            }
            out.push(String::from_utf8_lossy(&buf[..n]).into_owned());
        }
        out
    }

    fn add_client(core: &mut Core, nick: &str, uid: &str) -> crate::dagon::topology::EntId {
        let me = core.topo.me;
        match core.topo.introduce_client(NewClient {
            server: me,
            nick: nick.to_string(),
            hop: 0,
            ts: 1000,
            umodes: "+i".to_string(),
            user: "u".to_string(),
            host: "host".to_string(),
            ip: "192.0.2.9".to_string(),
            uid: Some(uid.to_string()),
            info: "gecos".to_string(),
            from: None,
        }) {
            crate::dagon::topology::Introduction::Added(h) => h,
            _ => panic!("unexpected collision"),
        }
    }

    #[test]
    fn test_burst_ends_with_ping() {
        let mut core = test_core();
        let id = peer(&mut core, true);
        burst_to(&mut core, id);
        let out = drain(&mut core, id);
        assert_eq!(out.last().unwrap(), "PING :42A");
        assert!(core.conns.get(&id.raw()).unwrap().awaiting_pong);
    }

    #[test]
    fn test_burst_uid_form_and_away() {
        let mut core = test_core();
        let alice = add_client(&mut core, "alice", "42AAAAAAB");
        core.topo
            .get_mut(alice)
            .unwrap()
            .client_mut()
            .unwrap()
            .away = Some("gone fishing".to_string());

        let id = peer(&mut core, true);
        burst_to(&mut core, id);
        let out = drain(&mut core, id);
        assert!(out.contains(
            &":42A UID alice 1 1000 +i u host 192.0.2.9 42AAAAAAB :gecos".to_string()
        ));
        assert!(out.contains(&":42AAAAAAB AWAY :gone fishing".to_string()));
    }

    #[test]
    fn test_burst_nick_form_for_plain_peers() {
        let mut core = test_core();
        add_client(&mut core, "alice", "42AAAAAAB");
        let id = peer(&mut core, false);
        burst_to(&mut core, id);
        let out = drain(&mut core, id);
        assert!(out.contains(&"NICK alice 1 1000 +i u host irc.a.net :gecos".to_string()));
    }

    #[test]
    fn test_burst_room_membership_and_masks() {
        let mut core = test_core();
        let alice = add_client(&mut core, "alice", "42AAAAAAB");
        let bob = add_client(&mut core, "bob", "42AAAAAAC");
        core.topo.join_room("#chat", 900, alice, ROLE_CHANOP);
        core.topo.join_room("#chat", 900, bob, ROLE_VOICE);
        {
            let room = core.topo.room_mut("#chat").unwrap();
            room.modes.simple = "nt".to_string();
            room.bans.push("*!*@spam.example".to_string());
            room.topic = Some(crate::dagon::topology::Topic {
                text: "welcome".to_string(),
                author: "alice".to_string(),
                ts: 950,
            });
        }

        let id = peer(&mut core, true);
        burst_to(&mut core, id);
        let out = drain(&mut core, id);

        let sjoin = out.iter().find(|l| l.contains("SJOIN")).unwrap();
        assert!(sjoin.starts_with(":42A SJOIN 900 #chat +nt :"));
        assert!(sjoin.contains("@42AAAAAAB") || sjoin.contains("@+42AAAAAAB"));
        assert!(sjoin.contains("+42AAAAAAC"));

        assert!(out.contains(&":42A BMASK 900 #chat b :*!*@spam.example".to_string()));
        assert!(out
            .iter()
            .any(|l| l == ":42A TB #chat 950 alice :welcome"));
    }

    #[test]
    fn test_burst_splits_large_memberships() {
        let mut core = test_core();
        for i in 0..60 {
            let nick = format!("verylongnickname{:03}", i);
            let uid = format!("42AAA{:04}", i);
            let h = add_client(&mut core, &nick, &uid);
            core.topo.join_room("#big", 900, h, 0);
        }
        let id = peer(&mut core, true);
        burst_to(&mut core, id);
        let out = drain(&mut core, id);

        let sjoins: Vec<_> = out.iter().filter(|l| l.contains("SJOIN")).collect();
        assert!(sjoins.len() > 1);
        for l in sjoins.iter() {
            assert!(l.len() < CAP);
            assert!(!l.ends_with(' '));
        }
        // every member appears exactly once across the batches
        let joined = sjoins
            .iter()
            .map(|l| l.split(" :").nth(1).unwrap_or(""))
            .collect::<Vec<_>>()
            .join(" ");
        assert_eq!(joined.split_whitespace().count(), 60);
    }

    #[test]
    fn test_burst_mask_batches_restart_prefix() {
        let mut core = test_core();
        let alice = add_client(&mut core, "alice", "42AAAAAAB");
        core.topo.join_room("#chat", 900, alice, 0);
        {
            let room = core.topo.room_mut("#chat").unwrap();
            for i in 0..40 {
                room.bans.push(format!("*!*@banned-host-{:02}.example.com", i));
            }
        }
        let id = peer(&mut core, true);
        burst_to(&mut core, id);
        let out = drain(&mut core, id);

        let bmasks: Vec<_> = out.iter().filter(|l| l.contains("BMASK")).collect();
        assert!(bmasks.len() > 1);
        for l in bmasks.iter() {
            assert!(l.starts_with(":42A BMASK 900 #chat b :"));
            assert!(l.len() < CAP);
        }
        let total: usize = bmasks
            .iter()
            .map(|l| l.split(" :").nth(1).unwrap().split_whitespace().count())
            .sum();
        assert_eq!(total, 40);
    }

    #[test]
    fn test_local_rooms_stay_local() {
        let mut core = test_core();
        let alice = add_client(&mut core, "alice", "42AAAAAAB");
        core.topo.join_room("&secret", 900, alice, 0);
        let id = peer(&mut core, true);
        burst_to(&mut core, id);
        let out = drain(&mut core, id);
        assert!(!out.iter().any(|l| l.contains("&secret")));
    }
}
