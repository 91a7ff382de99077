//! Peer link authentication and establishment.
//!
//! `check_server` decides whether an offered server name may register
//! on a connection; `server_estab` performs both sides of the setup:
//! our half of the handshake, the optional compression handoff, graph
//! linkage, propagation to the rest of the mesh, and the burst.

use nix::unistd::dup;
use slog::info;

use crate::dagon::burst;
use crate::dagon::conn::{caps, ConnId, HelperSession, Socket, Status};
use crate::dagon::core::Core;
use crate::dagon::crypto;
use crate::dagon::msgtab::HandlerStatus;
use crate::dagon::wire;

/// Distinct rejection classes, surfaced to operators with their own
/// messages.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum CheckError {
    /// No connect block matches the offered name.
    NoEntry,
    /// A block matched name and host, but the password is wrong, or
    /// no password was presented at all.
    BadPassword,
    /// A block matched the name but not the peer's address.
    BadHost,
    /// The name is too long or malformed.
    InvalidName,
}

/// Finds the connect block authorizing `name` on this connection.
///
/// On success the block is attached to the connection and caps the
/// block does not allow are cleared.
pub fn check_server(core: &mut Core, id: ConnId, name: &str) -> Result<usize, CheckError> {
    let (password, addr) = match core.conns.get(&id.raw()) {
        Some(c) => (c.password.clone(), c.addr.clone()),
        None => return Err(CheckError::NoEntry),
    };
    let password = match password {
        Some(p) => p,
        None => return Err(CheckError::BadPassword),
    };
    if name.len() > wire::HOST_LEN {
        return Err(CheckError::InvalidName);
    }

    let mut error = CheckError::NoEntry;
    let mut found = None;
    for (idx, block) in core.conf.connect.iter().enumerate() {
        if !wire::mask_match(&block.name, name) {
            continue;
        }
        error = CheckError::BadHost;
        if !wire::mask_match(&block.host, &addr) {
            continue;
        }
        error = CheckError::BadPassword;
        if crypto::password_matches(&block.accept_password, &password, block.encrypted) {
            found = Some(idx);
            break;
        }
    }

    let idx = match found {
        Some(idx) => idx,
        None => return Err(error),
    };

    let (compressed, topicburst) = {
        let block = &core.conf.connect[idx];
        (block.compressed, block.topicburst)
    };
    if let Some(conn) = core.conns.get_mut(&id.raw()) {
        conn.sconf = Some(idx);
        // clear what they support but we do not want
        if !compressed {
            conn.clear_cap(caps::ZIP);
        }
        if !topicburst {
            conn.clear_cap(caps::TB);
        }
    }
    Ok(idx)
}

/// Outcome of the compression handoff attempt.
enum StartIo {
    Started,
    /// No live worker; the link continues in plaintext.
    Unavailable,
    /// The pending receive queue exceeds the injection bound.
    Oversize,
}

// hand the link's descriptor to a helper worker, injecting whatever
// we already read ahead of the compressed stream
fn start_io(core: &mut Core, id: ConnId) -> StartIo {
    let inject_cap = core.conf.limits.readbuf_size;
    let level = core
        .conf
        .helper
        .as_ref()
        .map(|h| h.compression_level)
        .unwrap_or(6);

    let (tls_session, recvq_len) = match core.conns.get(&id.raw()) {
        Some(c) => (
            c.helper.clone().filter(|h| h.tls),
            c.recvq.len(),
        ),
        None => return StartIo::Unavailable,
    };
    if recvq_len > inject_cap {
        return StartIo::Oversize;
    }

    // drain fully: both already parsed lines and the partial tail are
    // handed over as pre-received bytes
    let inject = {
        let conn = match core.conns.get_mut(&id.raw()) {
            Some(c) => c,
            None => return StartIo::Unavailable,
        };
        let mut inject = Vec::with_capacity(conn.recvq.len());
        let mut buf = [0u8; crate::dagon::linebuf::BUF_DATA_SIZE];
        loop {
            let n = conn.recvq.get(&mut buf, true, true);
            if n == 0 {
                break;
            }
            inject.extend_from_slice(&buf[..n]);
        }
        inject
    };

    if let Some(session) = tls_session {
        // compression is layered inside the worker already bridging
        // this link; the transport stays put
        if core
            .helpers
            .start_zip_over_tls(session.worker, session.session_id, level, &inject)
        {
            if let Some(conn) = core.conns.get_mut(&id.raw()) {
                if let Some(h) = conn.helper.as_mut() {
                    h.zip = true;
                }
            }
            return StartIo::Started;
        }
        return StartIo::Unavailable;
    }

    let raw_fd = match core.conns.get(&id.raw()).and_then(|c| c.sock.as_ref()) {
        Some(sock) => sock.raw_fd(),
        None => return StartIo::Unavailable,
    };
    let netfd = match dup(raw_fd) {
        Ok(fd) => unsafe {
            use std::os::fd::FromRawFd;
            std::os::fd::OwnedFd::from_raw_fd(fd)
        },
        Err(_) => return StartIo::Unavailable,
    };

    let session = core.helpers.next_session_id();
    match core.helpers.start_zip(netfd, session, level, &inject) {
        Some((worker, ours)) => {
            let _ = ours.set_nonblocking(true);
            let ours = match tokio::net::UnixStream::from_std(ours) {
                Ok(s) => s,
                Err(_) => return StartIo::Unavailable,
            };
            core.swap_transport(id, Socket::unix(ours));
            if let Some(conn) = core.conns.get_mut(&id.raw()) {
                conn.helper = Some(HelperSession {
                    worker,
                    session_id: session,
                    tls: false,
                    zip: true,
                });
            }
            StartIo::Started
        }
        None => StartIo::Unavailable,
    }
}

/// Promotes a connection that passed `check_server` into a registered
/// server link: handshake completion, graph linkage, propagation, and
/// the burst.
pub fn server_estab(core: &mut Core, id: ConnId, info: &str, hidden: bool) -> HandlerStatus {
    let (outbound, name, sconf, offered_sid) = match core.conns.get(&id.raw()) {
        Some(c) => (c.outbound, c.name.clone(), c.sconf, c.offered_sid.clone()),
        None => return HandlerStatus::DropLine,
    };
    let block = match sconf.and_then(|i| core.conf.connect.get(i)) {
        Some(b) => b.clone(),
        None => {
            core.oper_notice(&format!(
                "Warning: Lost connect{{}} block for server {}!",
                name
            ));
            return HandlerStatus::DropLink("Lost connect{} block!".to_string());
        }
    };

    // the candidate authenticated; its password is done with
    if let Some(conn) = core.conns.get_mut(&id.raw()) {
        conn.password = None;
    }

    // a leaf refuses a second link outright
    if !core.conf.server.hub && !core.serv_conns.is_empty() {
        core.stats.is_ref += 1;
        core.send(id, "ERROR :I'm a leaf not a hub");
        return HandlerStatus::DropLink("I'm a leaf".to_string());
    }

    if !outbound {
        // inbound link: our half of the handshake goes out now
        if !block.send_password.is_empty() {
            let line = format!("PASS {} TS 6 :{}", block.send_password, self_sid(core));
            core.send(id, &line);
        }
        let mut mask = caps::TS | caps::QS | caps::EX | caps::IE | caps::ENCAP;
        if block.compressed {
            mask |= caps::ZIP;
        }
        if block.topicburst {
            mask |= caps::TB;
        }
        core.send(id, &format!("CAPAB :{}", caps::render(mask)));
        let line = format!(
            "SERVER {} 1 :{}{}",
            core.me_name(),
            if core.conf.server.hidden { "(H) " } else { "" },
            core.topo
                .get(core.topo.me)
                .map(|e| e.info.clone())
                .unwrap_or_default()
        );
        core.send(id, &line);
    }

    if core
        .conns
        .get(&id.raw())
        .map(|c| c.has_cap(caps::ZIP))
        .unwrap_or(false)
    {
        match start_io(core, id) {
            StartIo::Started => {}
            StartIo::Unavailable => {
                info!(core.log, "Compression unavailable for {}, continuing in plaintext", name);
                if let Some(conn) = core.conns.get_mut(&id.raw()) {
                    conn.clear_cap(caps::ZIP);
                }
            }
            StartIo::Oversize => {
                return HandlerStatus::DropLink(
                    "recvq too large for compression handoff".to_string(),
                );
            }
        }
    }

    let now = core.now;
    core.send(id, &format!("SVINFO 6 6 0 :{}", now));

    // the connection becomes the server entity it authenticated as
    let me = core.topo.me;
    let up_name = {
        let name = core.me_name().to_string();
        core.scache.find_or_add(&name)
    };
    let up_sid = self_sid(core);
    let ent = core
        .topo
        .add_server(me, Some(id), &name, offered_sid.clone(), 1, info, hidden);
    let fullcaps = {
        let conn = match core.conns.get_mut(&id.raw()) {
            Some(c) => c,
            None => return HandlerStatus::DropLine,
        };
        conn.status = Status::Server;
        conn.entity = Some(ent);
        conn.password = None;
        conn.fullcaps.clone()
    };
    if let Some(sx) = core.topo.get_mut(ent).and_then(|e| e.serv_mut()) {
        sx.up = Some(up_name);
        sx.upid = Some(up_sid);
        sx.fullcaps = fullcaps.clone();
    }
    core.serv_conns.push(id);

    let shown_caps = core
        .conns
        .get(&id.raw())
        .map(|c| caps::render(c.caps))
        .unwrap_or_default();
    core.oper_notice(&format!(
        "Link with {} established: ({}) link",
        name, shown_caps
    ));
    info!(core.log, "Link with {} established: ({}) link", name, shown_caps);

    propagate_new_link(core, id, ent, info, hidden, fullcaps.as_deref());
    burst::burst_to(core, id);

    HandlerStatus::Continue
}

fn self_sid(core: &Core) -> String {
    core.me_sid().to_string()
}

// tell every other peer about the new link, and tell the new link
// about every server we already know
fn propagate_new_link(
    core: &mut Core,
    id: ConnId,
    ent: crate::dagon::topology::EntId,
    info: &str,
    hidden: bool,
    fullcaps: Option<&str>,
) {
    let (name, sid) = match core.topo.get(ent) {
        Some(e) => (e.name.clone(), e.sid.clone()),
        None => return,
    };
    let hid = if hidden { "(H) " } else { "" };

    let peers: Vec<ConnId> = core
        .serv_conns
        .iter()
        .copied()
        .filter(|&c| c != id)
        .collect();
    for peer in peers {
        let (ts6, encap) = match core.conns.get(&peer.raw()) {
            Some(c) if !c.is_exiting() => (c.has_cap(caps::TS6), c.has_cap(caps::ENCAP)),
            _ => continue,
        };
        if ts6 && sid.is_some() {
            let line = format!(
                ":{} SID {} 2 {} :{}{}",
                core.me_sid(),
                name,
                sid.as_deref().unwrap_or(""),
                hid,
                info
            );
            core.send(peer, &line);
        } else {
            let line = format!(":{} SERVER {} 2 :{}{}", core.me_name(), name, hid, info);
            core.send(peer, &line);
        }
        if encap {
            if let Some(fc) = fullcaps {
                let token = if ts6 && sid.is_some() {
                    sid.clone().unwrap_or_else(|| name.clone())
                } else {
                    name.clone()
                };
                core.send(peer, &format!(":{} ENCAP * GCAP :{}", token, fc));
            }
        }
    }

    // now the other direction: every known server, oldest links first
    let ts6 = core
        .conns
        .get(&id.raw())
        .map(|c| c.has_cap(caps::TS6))
        .unwrap_or(false);
    let encap = core
        .conns
        .get(&id.raw())
        .map(|c| c.has_cap(caps::ENCAP))
        .unwrap_or(false);
    let known: Vec<_> = core
        .topo
        .global_servers
        .iter()
        .copied()
        .filter(|&h| h != core.topo.me && h != ent)
        .collect();
    for h in known {
        let (line, gcap) = match core.topo.get(h) {
            Some(e) => {
                let sx = match e.serv() {
                    Some(sx) => sx,
                    None => continue,
                };
                let hid = if e.hidden { "(H) " } else { "" };
                let line = if ts6 && e.sid.is_some() && sx.upid.is_some() {
                    format!(
                        ":{} SID {} {} {} :{}{}",
                        sx.upid.as_deref().unwrap_or(""),
                        e.name,
                        e.hop + 1,
                        e.sid.as_deref().unwrap_or(""),
                        hid,
                        e.info
                    )
                } else {
                    format!(
                        ":{} SERVER {} {} :{}{}",
                        sx.up.as_deref().unwrap_or(""),
                        e.name,
                        e.hop + 1,
                        hid,
                        e.info
                    )
                };
                let gcap = sx.fullcaps.as_ref().map(|fc| {
                    let token = if ts6 {
                        e.wire_id().to_string()
                    } else {
                        e.name.clone()
                    };
                    format!(":{} ENCAP * GCAP :{}", token, fc)
                });
                (line, gcap)
            }
            None => continue,
        };
        core.send(id, &line);
        if encap {
            if let Some(g) = gcap {
                core.send(id, &g);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dagon::config::Config;
    use crate::dagon::core::{event_channel, Core};
    use crate::dagon::crypto::Digest;

    fn core_with(conf: &str) -> Core {
        let conf = Config::from_toml_str(conf).unwrap();
        let log = slog::Logger::root(slog::Discard, slog::o!());
        let (tx, _rx) = event_channel();
        Core::new(conf, log, tx)
    }

    fn unknown_conn(core: &mut Core, password: Option<&str>) -> ConnId {
        let id = core.register_connection(None, "203.0.113.7".into(), String::new());
        if let Some(pw) = password {
            core.conns.get_mut(&id.raw()).unwrap().password = Some(pw.to_string());
        }
        id
    }

    const CONF: &str = r#"
[server]
name = "irc.a.net"
sid = "42A"
hub = true

[[connect]]
name = "irc.b.net"
host = "203.0.113.*"
accept_password = "s3cret"
hub_mask = ["*"]
"#;

    #[test]
    fn test_check_server_no_entry() {
        let mut core = core_with(CONF);
        let id = unknown_conn(&mut core, Some("s3cret"));
        assert_eq!(
            check_server(&mut core, id, "irc.evil.net"),
            Err(CheckError::NoEntry)
        );
    }

    #[test]
    fn test_check_server_bad_password() {
        let mut core = core_with(CONF);
        let id = unknown_conn(&mut core, Some("wrong"));
        assert_eq!(
            check_server(&mut core, id, "irc.b.net"),
            Err(CheckError::BadPassword)
        );
        let id = unknown_conn(&mut core, None);
        assert_eq!(
            check_server(&mut core, id, "irc.b.net"),
            Err(CheckError::BadPassword)
        );
    }

    #[test]
    fn test_check_server_bad_host() {
        let mut core = core_with(CONF);
        let id = core.register_connection(None, "198.51.100.9".into(), String::new());
        core.conns.get_mut(&id.raw()).unwrap().password = Some("s3cret".to_string());
        assert_eq!(
            check_server(&mut core, id, "irc.b.net"),
            Err(CheckError::BadHost)
        );
    }

    #[test]
    fn test_check_server_name_too_long() {
        let mut core = core_with(CONF);
        let id = unknown_conn(&mut core, Some("s3cret"));
        let long = format!("irc.{}.net", "x".repeat(80));
        assert_eq!(
            check_server(&mut core, id, &long),
            Err(CheckError::InvalidName)
        );
    }

    #[test]
    fn test_check_server_attaches_block() {
        let mut core = core_with(CONF);
        let id = unknown_conn(&mut core, Some("s3cret"));
        assert_eq!(check_server(&mut core, id, "irc.b.net"), Ok(0));
        let conn = core.conns.get(&id.raw()).unwrap();
        assert_eq!(conn.sconf, Some(0));
    }

    #[test]
    fn test_check_server_clears_unwanted_caps() {
        let mut core = core_with(CONF);
        let id = unknown_conn(&mut core, Some("s3cret"));
        {
            let conn = core.conns.get_mut(&id.raw()).unwrap();
            conn.caps = caps::TS | caps::ZIP | caps::TB;
        }
        check_server(&mut core, id, "irc.b.net").unwrap();
        let conn = core.conns.get(&id.raw()).unwrap();
        // the block allows topicburst (default) but not compression
        assert!(!conn.has_cap(caps::ZIP));
        assert!(conn.has_cap(caps::TB));
    }

    #[test]
    fn test_check_server_encrypted_password() {
        let digest = Digest::of(b"s3cret").hex();
        let conf = format!(
            r#"
[server]
name = "irc.a.net"
sid = "42A"
hub = true

[[connect]]
name = "irc.b.net"
host = "*"
accept_password = "{}"
encrypted = true
hub_mask = ["*"]
"#,
            digest
        );
        let mut core = core_with(&conf);
        let id = unknown_conn(&mut core, Some("s3cret"));
        assert_eq!(check_server(&mut core, id, "irc.b.net"), Ok(0));
    }
}
