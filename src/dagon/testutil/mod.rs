//! Shared fixtures for unit tests: a core with a known configuration,
//! transportless connections, and send queue inspection.

use crate::dagon::config::Config;
use crate::dagon::conn::{caps, ConnId, Status};
use crate::dagon::core::{event_channel, Core};
use crate::dagon::linebuf::BUF_DATA_SIZE;
use crate::dagon::topology::{EntId, Introduction, NewClient};

pub const TEST_CONF: &str = r#"
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

pub fn test_core() -> Core {
    let conf = Config::from_toml_str(TEST_CONF).unwrap();
    let log = slog::Logger::root(slog::Discard, slog::o!());
    let (tx, _rx) = event_channel();
    Core::new(conf, log, tx)
}

/// A registered, transportless server link with an entity in the
/// graph.
pub fn server_conn(core: &mut Core, name: &str, sid: &str) -> ConnId {
    let id = core.register_connection(None, "203.0.113.7".into(), String::new());
    let ent = core.topo.add_server(
        core.topo.me,
        Some(id),
        name,
        Some(sid.to_string()),
        1,
        "peer",
        false,
    );
    let conn = core.conns.get_mut(&id.raw()).unwrap();
    conn.status = Status::Server;
    conn.name = name.to_string();
    conn.caps = caps::TS | caps::TS6 | caps::ENCAP | caps::EX | caps::IE | caps::TB;
    conn.entity = Some(ent);
    core.serv_conns.push(id);
    id
}

/// A remote client introduced behind `server`'s entity.
pub fn remote_client(core: &mut Core, via: ConnId, nick: &str, ts: u64, uid: &str) -> EntId {
    let server = core.conns.get(&via.raw()).unwrap().entity.unwrap();
    match core.topo.introduce_client(NewClient {
        server,
        nick: nick.to_string(),
        hop: 1,
        ts,
        umodes: "+i".to_string(),
        user: "u".to_string(),
        host: "host".to_string(),
        ip: "192.0.2.9".to_string(),
        uid: Some(uid.to_string()),
        info: "gecos".to_string(),
        from: Some(via),
    }) {
        Introduction::Added(h) => h,
        _ => panic!("unexpected collision in fixture"),
    }
}

/// Pops every terminated line off a connection's send queue.
pub fn drain(core: &mut Core, id: ConnId) -> Vec<String> {
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
