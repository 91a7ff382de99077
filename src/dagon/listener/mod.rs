//! Listening sockets and connection admission.
//!
//! Every accepted socket passes the admission ladder before a
//! connection is created: helper availability for TLS listeners, the
//! descriptor budget, persistent ban rules, the silent reject cache,
//! and the per address connect throttle, in that order.

use std::net::SocketAddr;
use std::os::fd::OwnedFd;

use futures::SinkExt;
use slog::{info, warn};
use socket2::{Domain, Protocol, Socket as RawSocket, Type};

use crate::dagon::async_runtime as rt;
use crate::dagon::collections::{self, HashMap, OrderedMap};
use crate::dagon::conn::Socket;
use crate::dagon::core::{Core, Event, EventTx};
use crate::dagon::error::*;
use crate::dagon::wire;

/// A bound listening socket.
pub struct Listener {
    /// Displayable "address/port" name.
    pub name: String,
    pub addr: SocketAddr,
    pub ssl: bool,
    pub active: bool,
}

impl Listener {
    fn new(addr: SocketAddr, ssl: bool) -> Self {
        Self {
            name: format!("{}/{}", addr.ip(), addr.port()),
            addr,
            ssl,
            active: false,
        }
    }
}

/// Cache of recently rejected addresses; repeat offenders are dropped
/// without spending a reply on them.
pub struct RejectCache {
    map: OrderedMap<String, (usize, u64)>,
}

impl RejectCache {
    pub fn new() -> Self {
        Self {
            map: collections::ordered_map(),
        }
    }

    /// Records a rejection for `addr`.
    pub fn add(&mut self, addr: &str, now: u64) {
        let entry = self.map.entry(addr.to_string()).or_insert((0, now));
        entry.0 += 1;
        entry.1 = now;
    }

    /// Reports whether `addr` has been rejected often enough recently
    /// to earn the silent treatment.
    pub fn check(&self, addr: &str, now: u64, limit: usize, window: u64) -> bool {
        match self.map.get(addr) {
            Some(&(count, last)) => count >= limit && last + window > now,
            None => false,
        }
    }

    /// Expires stale entries, oldest first.
    pub fn gc(&mut self, now: u64, window: u64) {
        while let Some((_, &(_, last))) = self.map.front() {
            if last + window <= now {
                self.map.pop_front();
            } else {
                break;
            }
        }
    }
}

impl Default for RejectCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Per address connect rate throttle.
pub struct Throttle {
    map: HashMap<String, (u64, usize)>,
}

impl Throttle {
    pub fn new() -> Self {
        Self {
            map: collections::hash_map(),
        }
    }

    /// Counts a connect from `addr`; reports whether the address is
    /// over its budget for the window.
    pub fn add(&mut self, addr: &str, now: u64, max: usize, window: u64) -> bool {
        let entry = self.map.entry(addr.to_string()).or_insert((now, 0));
        if entry.0 + window <= now {
            *entry = (now, 0);
        }
        entry.1 += 1;
        entry.1 > max
    }

    pub fn gc(&mut self, now: u64, window: u64) {
        self.map.retain(|_, &mut (first, _)| first + window > now);
    }
}

impl Default for Throttle {
    fn default() -> Self {
        Self::new()
    }
}

/// Binds one listen block: non-blocking socket, address reuse, bind,
/// listen.
pub fn bind(addr: SocketAddr) -> Result<std::net::TcpListener> {
    let domain = Domain::for_address(addr);
    let sock = RawSocket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .with_kind(ErrorKind::Listener)?;
    sock.set_reuse_address(true)
        .with_kind_msg(ErrorKind::Listener, "setting SO_REUSEADDR")?;
    sock.set_nonblocking(true).with_kind(ErrorKind::Listener)?;
    sock.bind(&addr.into())
        .with_kind_msg(ErrorKind::Listener, "binding listener socket")?;
    sock.listen(128).with_kind(ErrorKind::Listener)?;
    Ok(sock.into())
}

/// Binds every configured listen block and starts their accept pumps.
pub fn start_all(core: &mut Core) {
    let blocks = core.conf.listen.clone();
    for block in blocks {
        let addr: SocketAddr = match format!("{}:{}", block.host, block.port).parse() {
            Ok(a) => a,
            Err(e) => {
                warn!(core.log, "Bad listen address {}: {}", block.host, e);
                continue;
            }
        };
        let mut listener = Listener::new(addr, block.ssl);
        match bind(addr) {
            Ok(std_listener) => match tokio::net::TcpListener::from_std(std_listener) {
                Ok(tcp) => {
                    listener.active = true;
                    info!(core.log, "Listening on {}", listener.name);
                    let lid = core.listeners.len();
                    rt::spawn(accept_pump(lid, tcp, core.tx.clone()));
                }
                Err(e) => warn!(core.log, "Listener {} failed: {}", listener.name, e),
            },
            Err(e) => warn!(core.log, "Listener {} failed: {}", listener.name, e),
        }
        core.listeners.push(listener);
    }
}

async fn accept_pump(lid: usize, listener: tokio::net::TcpListener, mut tx: EventTx) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let stream = match stream.into_std() {
                    Ok(s) => s,
                    Err(_) => continue,
                };
                if tx.send(Event::Accepted { lid, stream, addr }).await.is_err() {
                    return;
                }
            }
            Err(_) => {
                // transient accept failures (EMFILE and friends) are
                // retried on the next readiness
                futures_timer::Delay::new(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

// best effort reject line on a socket we never promoted
fn write_reject(stream: &std::net::TcpStream, line: &str) {
    use std::io::Write;
    let _ = (&*stream).write_all(line.as_bytes());
    let _ = stream.shutdown(std::net::Shutdown::Both);
}

/// Consults the admission predicate, then promotes the socket into a
/// connection, bridging TLS listeners through a helper worker.
pub fn admit(core: &mut Core, lid: usize, stream: std::net::TcpStream, addr: SocketAddr) {
    core.stats.is_ac += 1;
    let ip = addr.ip().to_string();
    let ssl = core.listeners.get(lid).map(|l| l.ssl).unwrap_or(false);
    let lname = core
        .listeners
        .get(lid)
        .map(|l| l.name.clone())
        .unwrap_or_default();

    if ssl && core.helpers.live_count() == 0 {
        core.stats.is_ref += 1;
        write_reject(&stream, "ERROR :TLS is not available\r\n");
        return;
    }

    if core.conns.len() + 10 >= core.conf.limits.max_connections {
        core.stats.is_ref += 1;
        let msg = format!("All connections in use. ({})", lname);
        core.oper_notice_ratelimited(&msg);
        write_reject(&stream, "ERROR :All connections in use\r\n");
        return;
    }

    // exemption rules beat ban rules
    let exempt = core
        .conf
        .ban
        .iter()
        .any(|b| b.exempt && wire::mask_match(&b.mask, &ip));
    if !exempt {
        if let Some(reason) = core
            .conf
            .ban
            .iter()
            .find(|b| !b.exempt && wire::mask_match(&b.mask, &ip))
            .map(|b| b.reason.clone())
        {
            core.stats.is_ref += 1;
            self::note_reject(core, &ip);
            write_reject(&stream, &format!("ERROR :*** Banned: {}\r\n", reason));
            return;
        }
    }

    let (limit, window) = (core.conf.limits.reject_count, core.conf.limits.reject_duration);
    if core.reject_cache.check(&ip, core.now, limit, window) {
        core.stats.is_ref += 1;
        let _ = stream.shutdown(std::net::Shutdown::Both);
        return;
    }

    let (max, window) = (
        core.conf.limits.throttle_count,
        core.conf.limits.throttle_duration,
    );
    if core.throttle.add(&ip, core.now, max, window) {
        core.stats.is_ref += 1;
        self::note_reject(core, &ip);
        write_reject(&stream, "ERROR :Reconnecting too fast, throttled.\r\n");
        return;
    }

    let local = stream
        .local_addr()
        .map(|a| a.ip().to_string())
        .unwrap_or_default();

    if ssl {
        admit_tls(core, stream, ip, local);
        return;
    }

    let _ = stream.set_nonblocking(true);
    let stream = match tokio::net::TcpStream::from_std(stream) {
        Ok(s) => s,
        Err(_) => return,
    };
    core.register_connection(Some(Socket::tcp(stream)), ip, local);
}

fn note_reject(core: &mut Core, ip: &str) {
    let now = core.now;
    core.reject_cache.add(ip, now);
}

// hand the raw socket to a helper worker and keep our end of a fresh
// socket pair as the transport
fn admit_tls(core: &mut Core, stream: std::net::TcpStream, ip: String, local: String) {
    let netfd = OwnedFd::from(stream);
    let session = core.helpers.next_session_id();
    match core.helpers.start_tls_accept(netfd, session) {
        Some((worker, ours)) => {
            let _ = ours.set_nonblocking(true);
            let ours = match tokio::net::UnixStream::from_std(ours) {
                Ok(s) => s,
                Err(_) => return,
            };
            let id = core.register_connection(Some(Socket::unix(ours)), ip, local);
            if let Some(conn) = core.conns.get_mut(&id.raw()) {
                conn.helper = Some(crate::dagon::conn::HelperSession {
                    worker,
                    session_id: session,
                    tls: true,
                    zip: false,
                });
            }
        }
        None => {
            core.stats.is_ref += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttle_budget() {
        let mut t = Throttle::new();
        assert!(!t.add("192.0.2.1", 100, 2, 60));
        assert!(!t.add("192.0.2.1", 101, 2, 60));
        assert!(t.add("192.0.2.1", 102, 2, 60));
        // a different address has its own budget
        assert!(!t.add("192.0.2.2", 102, 2, 60));
        // the window resets the count
        assert!(!t.add("192.0.2.1", 200, 2, 60));
    }

    #[test]
    fn test_reject_cache_silence_threshold() {
        let mut r = RejectCache::new();
        assert!(!r.check("192.0.2.1", 100, 3, 120));
        r.add("192.0.2.1", 100);
        r.add("192.0.2.1", 101);
        assert!(!r.check("192.0.2.1", 102, 3, 120));
        r.add("192.0.2.1", 102);
        assert!(r.check("192.0.2.1", 103, 3, 120));
        // entries expire with the window
        r.gc(300, 120);
        assert!(!r.check("192.0.2.1", 300, 3, 120));
    }
}
