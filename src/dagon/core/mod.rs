//! The core runtime value and its event loop.
//!
//! All global mutable state is grouped into a single `Core` threaded
//! through every handler; there are no ambient singletons. The loop
//! consumes events one at a time, so lines on a connection are
//! processed strictly in arrival order, and emissions into a peer's
//! send queue preserve program order at that queue.

use std::io;
use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::time::{SystemTime, UNIX_EPOCH};

use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use futures_timer::Delay;
use slog::{info, warn, Logger};

use crate::dagon::async_runtime as rt;
use crate::dagon::collections::{self, HashMap};
use crate::dagon::config::Config;
use crate::dagon::conn::{caps, ConnId, Connection, Socket, SocketWriter, Status};
use crate::dagon::handlers;
use crate::dagon::helper::HelperPool;
use crate::dagon::linebuf::BUF_DATA_SIZE;
use crate::dagon::listener::{self, Listener, RejectCache, Throttle};
use crate::dagon::msgtab::MsgTable;
use crate::dagon::parse;
use crate::dagon::scache::Scache;
use crate::dagon::stats::ServerStats;
use crate::dagon::topology::{EntId, Entity, Topology};

/// Read chunk size of the socket pumps.
pub const READBUF_SIZE: usize = 16384;

// seconds between timer ticks
const TICK_SECS: u64 = 5;

// how long an exiting connection may take to drain its send queue
const EXIT_LINGER: u64 = 10;

/// Seconds since the epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Everything the event loop can wake up for.
pub enum Event {
    /// A listener accepted a socket; admission has not run yet.
    Accepted {
        lid: usize,
        stream: std::net::TcpStream,
        addr: SocketAddr,
    },
    /// An outgoing link attempt finished connecting.
    Connected {
        conf_idx: usize,
        stream: std::net::TcpStream,
        addr: SocketAddr,
    },
    ConnectFailed {
        conf_idx: usize,
        err: io::Error,
    },
    /// Bytes arrived on a connection.
    Read(ConnId, Vec<u8>),
    /// A connection's socket reached EOF or failed.
    Closed(ConnId),
    /// A connection's socket became writable again.
    Writable(ConnId),
    /// A helper worker sent us a control message.
    HelperMsg {
        worker: usize,
        buf: Vec<u8>,
        fds: Vec<OwnedFd>,
    },
    /// A helper worker's control channel or keep-alive pipe died.
    HelperDead {
        worker: usize,
    },
    Tick,
    Shutdown,
}

pub type EventTx = mpsc::Sender<Event>;
pub type EventRx = mpsc::Receiver<Event>;

/// Bound of the core event channel.
pub const CHAN_BOUND: usize = 512;

/// Creates the core event channel.
pub fn event_channel() -> (EventTx, EventRx) {
    mpsc::channel(CHAN_BOUND)
}

/// The runtime value threaded through every handler.
pub struct Core {
    pub conf: Config,
    pub log: Logger,
    pub topo: Topology,
    /// Connection table, keyed by raw connection id.
    pub conns: HashMap<u64, Connection>,
    next_conn: u64,
    /// Registered server links.
    pub serv_conns: Vec<ConnId>,
    pub msgtab: MsgTable,
    pub scache: Scache,
    pub stats: ServerStats,
    pub helpers: HelperPool,
    pub listeners: Vec<Listener>,
    pub reject_cache: RejectCache,
    pub throttle: Throttle,
    pub tx: EventTx,
    pub now: u64,
    last_oper_notice: u64,
}

impl Core {
    /// Builds the runtime value; no sockets are touched yet.
    pub fn new(conf: Config, log: Logger, tx: EventTx) -> Self {
        let topo = Topology::new(&conf.server.name, &conf.server.sid, &conf.server.info);
        let mut msgtab = MsgTable::new();
        handlers::register(&mut msgtab);
        Self {
            conf,
            log,
            topo,
            conns: collections::hash_map(),
            next_conn: 1,
            serv_conns: Vec::new(),
            msgtab,
            scache: Scache::new(),
            stats: ServerStats::new(),
            helpers: HelperPool::new(),
            listeners: Vec::new(),
            reject_cache: RejectCache::new(),
            throttle: Throttle::new(),
            tx,
            now: unix_now(),
            last_oper_notice: 0,
        }
    }

    /// Name of the local node.
    pub fn me_name(&self) -> &str {
        &self.topo.get(self.topo.me).expect("local node in arena").name
    }

    /// Wire id of the local node.
    pub fn me_sid(&self) -> &str {
        self.topo
            .get(self.topo.me)
            .expect("local node in arena")
            .sid
            .as_deref()
            .expect("local node carries an id")
    }

    /// The token a given peer should see for the local node.
    pub fn me_wire_for(&self, conn: &Connection) -> String {
        if conn.has_cap(caps::TS6) {
            self.me_sid().to_string()
        } else {
            self.me_name().to_string()
        }
    }

    /// The token a given peer should see for an entity.
    pub fn ent_wire_for(&self, ent: &Entity, conn: &Connection) -> String {
        if conn.has_cap(caps::TS6) {
            ent.wire_id().to_string()
        } else {
            ent.name.clone()
        }
    }

    /// Operator notice: surfaces to the log on this build.
    pub fn oper_notice(&mut self, msg: &str) {
        info!(self.log, "*** Notice -- {}", msg);
    }

    /// Operator notice rate limited to one per 20 seconds, for
    /// resource exhaustion paths.
    pub fn oper_notice_ratelimited(&mut self, msg: &str) {
        if self.last_oper_notice + 20 <= self.now {
            self.last_oper_notice = self.now;
            self.oper_notice(msg);
        }
    }

    /// Creates a connection around an accepted or connected socket and
    /// starts its read pump.
    pub fn register_connection(
        &mut self,
        sock: Option<Socket>,
        addr: String,
        local_addr: String,
    ) -> ConnId {
        let id = ConnId::from(self.next_conn);
        self.next_conn += 1;
        let mut conn = Connection::new(id, sock.clone(), addr, local_addr, self.now);
        if let Some(sock) = sock {
            conn.pump_stop = Some(spawn_read_pump(sock, id, self.tx.clone()));
        }
        self.conns.insert(id.raw(), conn);
        id
    }

    /// Swaps a connection's transport, restarting its read pump. Any
    /// unread kernel bytes stay with the old descriptor.
    pub fn swap_transport(&mut self, id: ConnId, sock: Socket) {
        let tx = self.tx.clone();
        if let Some(conn) = self.conns.get_mut(&id.raw()) {
            conn.stop_pump();
            conn.sock = Some(sock.clone());
            conn.flush_armed = false;
            conn.pump_stop = Some(spawn_read_pump(sock, id, tx));
        }
    }

    /// Queues a line to a connection and flushes what the socket
    /// accepts.
    pub fn send(&mut self, id: ConnId, line: &str) {
        if let Some(conn) = self.conns.get_mut(&id.raw()) {
            conn.sendq.put(line);
        }
        self.flush_conn(id);
    }

    /// Flushes a connection's send queue; on pressure a one-shot
    /// writability waiter re-arms the flush.
    pub fn flush_conn(&mut self, id: ConnId) {
        let mut fatal = false;
        let mut arm: Option<Socket> = None;
        if let Some(conn) = self.conns.get_mut(&id.raw()) {
            let sock = match conn.sock.clone() {
                Some(s) => s,
                None => return,
            };
            while conn.sendq.has_terminated() {
                let mut sink = SocketWriter(&sock);
                match conn.sendq.flush(&mut sink) {
                    Ok(0) => break,
                    Ok(_) => continue,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        if !conn.flush_armed {
                            conn.flush_armed = true;
                            arm = Some(sock.clone());
                        }
                        break;
                    }
                    Err(_) => {
                        fatal = true;
                        break;
                    }
                }
            }
        }
        if let Some(sock) = arm {
            let mut tx = self.tx.clone();
            rt::spawn(async move {
                let _ = sock.writable().await;
                let _ = tx.send(Event::Writable(id)).await;
            });
        }
        if fatal {
            // surface through the pump's Closed event; just stop the
            // kernel side now
            if let Some(conn) = self.conns.get_mut(&id.raw()) {
                if let Some(sock) = &conn.sock {
                    sock.shutdown();
                }
            }
        }
    }

    /// Transitions a connection to Exiting, detaching everything it
    /// represents in the graph and notifying the rest of the mesh.
    pub fn exit_connection(&mut self, id: ConnId, reason: &str) {
        let (was, addr, name, entity) = match self.conns.get_mut(&id.raw()) {
            Some(conn) => {
                if conn.is_exiting() {
                    return;
                }
                let was = conn.status;
                conn.status = Status::Exiting;
                conn.exit_reason = Some(reason.to_string());
                conn.last_in = self.now;
                (was, conn.addr.clone(), conn.name.clone(), conn.entity)
            }
            None => return,
        };

        if was == Status::Server {
            self.serv_conns.retain(|&c| c != id);
            self.oper_notice(&format!("Server {} split: {}", name, reason));
            if let Some(ent) = entity {
                self.squit_subtree(ent, Some(id), reason);
            }
            if let Some(session) = self.conns.get(&id.raw()).and_then(|c| c.helper.clone()) {
                self.helpers.release_session(session.worker);
            }
        }

        self.send(id, &format!("ERROR :Closing Link: {} ({})", addr, reason));

        let drained = self
            .conns
            .get(&id.raw())
            .map(|c| c.sendq.is_empty())
            .unwrap_or(true);
        if drained {
            self.destroy_connection(id);
        }
    }

    /// Final teardown: the connection leaves the table and the socket
    /// dies.
    pub fn destroy_connection(&mut self, id: ConnId) {
        if let Some(mut conn) = self.conns.remove(&id.raw()) {
            conn.stop_pump();
            if let Some(sock) = &conn.sock {
                sock.shutdown();
            }
            if let Some(session) = &conn.helper {
                if conn.status != Status::Exiting || conn.entity.is_none() {
                    // server exits released theirs already
                    self.helpers.release_session(session.worker);
                }
            }
        }
        self.serv_conns.retain(|&c| c != id);
    }

    /// Removes a server entity and its whole subtree from the graph,
    /// relaying the removal to every other peer: an exit per client,
    /// then the server removal itself.
    pub fn squit_subtree(&mut self, ent: EntId, from: Option<ConnId>, reason: &str) {
        let (root_name, root_wid, parent_name) = match self.topo.get(ent) {
            Some(e) => (
                e.name.clone(),
                e.wire_id().to_string(),
                e.parent
                    .and_then(|p| self.topo.get(p))
                    .map(|p| p.name.clone())
                    .unwrap_or_else(|| self.me_name().to_string()),
            ),
            None => return,
        };
        let split = format!("{} {}", parent_name, root_name);
        let removed = self.topo.remove_server(ent);

        let peers: Vec<ConnId> = self
            .serv_conns
            .iter()
            .copied()
            .filter(|&c| Some(c) != from)
            .collect();
        for client in removed.clients.iter() {
            for &peer in peers.iter() {
                let token = match self.conns.get(&peer.raw()) {
                    Some(conn) if !conn.is_exiting() => self.ent_wire_for(client, conn),
                    _ => continue,
                };
                self.send(peer, &format!(":{} QUIT :{}", token, split));
            }
        }
        for &peer in peers.iter() {
            let (me, target) = match self.conns.get(&peer.raw()) {
                Some(conn) if !conn.is_exiting() => (
                    self.me_wire_for(conn),
                    if conn.has_cap(caps::TS6) {
                        root_wid.clone()
                    } else {
                        root_name.clone()
                    },
                ),
                _ => continue,
            };
            self.send(peer, &format!(":{} SQUIT {} :{}", me, target, reason));
        }
    }

    /// One pass of the event loop. Returns `false` on shutdown.
    pub fn process_event(&mut self, ev: Event) -> bool {
        match ev {
            Event::Accepted { lid, stream, addr } => {
                listener::admit(self, lid, stream, addr);
            }
            Event::Connected {
                conf_idx,
                stream,
                addr,
            } => {
                self.outbound_established(conf_idx, stream, addr);
            }
            Event::ConnectFailed { conf_idx, err } => {
                let name = self
                    .conf
                    .connect
                    .get(conf_idx)
                    .map(|c| c.name.clone())
                    .unwrap_or_default();
                warn!(self.log, "Connect to {} failed: {}", name, err);
            }
            Event::Read(id, bytes) => self.handle_read(id, &bytes),
            Event::Closed(id) => {
                self.exit_connection(id, "Connection closed");
                self.destroy_connection(id);
            }
            Event::Writable(id) => {
                if let Some(conn) = self.conns.get_mut(&id.raw()) {
                    conn.flush_armed = false;
                }
                self.flush_conn(id);
                let done = self
                    .conns
                    .get(&id.raw())
                    .map(|c| c.is_exiting() && c.sendq.is_empty())
                    .unwrap_or(false);
                if done {
                    self.destroy_connection(id);
                }
            }
            Event::HelperMsg { worker, buf, fds } => {
                self.helpers.handle_msg(&self.log, worker, &buf, fds);
            }
            Event::HelperDead { worker } => self.helper_died(worker),
            Event::Tick => self.tick(),
            Event::Shutdown => {
                info!(self.log, "Shutting down");
                let ids: Vec<ConnId> = self.conns.values().map(|c| c.id).collect();
                for id in ids {
                    self.exit_connection(id, "Server shutting down");
                    self.destroy_connection(id);
                }
                return false;
            }
        }
        true
    }

    fn handle_read(&mut self, id: ConnId, bytes: &[u8]) {
        {
            let conn = match self.conns.get_mut(&id.raw()) {
                Some(c) => c,
                None => return,
            };
            if conn.is_exiting() {
                return;
            }
            conn.last_in = self.now;
            conn.ping_sent = false;
            conn.recvq.parse(bytes, false);
        }

        loop {
            let line = {
                let conn = match self.conns.get_mut(&id.raw()) {
                    Some(c) => c,
                    None => return,
                };
                if conn.is_exiting() {
                    return;
                }
                let mut buf = [0u8; BUF_DATA_SIZE];
                let n = conn.recvq.get(&mut buf, false, false);
                if n == 0 {
                    break;
                }
                String::from_utf8_lossy(&buf[..n]).into_owned()
            };
            if line.is_empty() {
                self.stats.is_empt += 1;
                continue;
            }
            parse::parse(self, id, &line);
        }
    }

    fn outbound_established(
        &mut self,
        conf_idx: usize,
        stream: std::net::TcpStream,
        addr: SocketAddr,
    ) {
        let block = match self.conf.connect.get(conf_idx) {
            Some(b) => b.clone(),
            None => return,
        };
        let sock = if block.ssl {
            // outgoing TLS runs through a helper worker, like inbound
            let netfd = std::os::fd::OwnedFd::from(stream);
            let session = self.helpers.next_session_id();
            match self.helpers.start_tls_connect(netfd, session) {
                Some((worker, ours)) => {
                    let _ = ours.set_nonblocking(true);
                    match tokio::net::UnixStream::from_std(ours) {
                        Ok(s) => Some((Socket::unix(s), Some((worker, session)))),
                        Err(_) => return,
                    }
                }
                None => {
                    warn!(self.log, "No helper available for TLS link to {}", block.name);
                    return;
                }
            }
        } else {
            match tokio::net::TcpStream::from_std(stream) {
                Ok(s) => Some((Socket::tcp(s), None)),
                Err(_) => return,
            }
        };
        let (sock, session) = match sock {
            Some(x) => x,
            None => return,
        };
        let id = self.register_connection(Some(sock), addr.ip().to_string(), String::new());
        if let Some((worker, session_id)) = session {
            if let Some(conn) = self.conns.get_mut(&id.raw()) {
                conn.helper = Some(crate::dagon::conn::HelperSession {
                    worker,
                    session_id,
                    tls: true,
                    zip: false,
                });
            }
        }
        if let Some(conn) = self.conns.get_mut(&id.raw()) {
            conn.status = Status::Handshake;
            conn.name = block.name.clone();
            conn.sconf = Some(conf_idx);
            conn.outbound = true;
        }
        info!(self.log, "Connection to server {} established", block.name);

        if !block.send_password.is_empty() {
            let line = format!("PASS {} TS 6 :{}", block.send_password, self.me_sid());
            self.send(id, &line);
        }
        let mut mask = caps::TS | caps::QS | caps::EX | caps::IE | caps::ENCAP;
        if block.compressed {
            mask |= caps::ZIP;
        }
        if block.topicburst {
            mask |= caps::TB;
        }
        self.send(id, &format!("CAPAB :{}", caps::render(mask)));
        let line = format!(
            "SERVER {} 1 :{}{}",
            self.me_name(),
            if self.conf.server.hidden { "(H) " } else { "" },
            self.topo.get(self.topo.me).expect("local node").info
        );
        self.send(id, &line);
    }

    fn helper_died(&mut self, worker: usize) {
        warn!(self.log, "Helper worker {} died", worker);

        // links depending on this worker's transforms are beyond
        // saving
        let dependents: Vec<ConnId> = self
            .conns
            .values()
            .filter(|c| c.helper.as_ref().map(|h| h.worker) == Some(worker))
            .map(|c| c.id)
            .collect();
        for id in dependents {
            if let Some(conn) = self.conns.get_mut(&id.raw()) {
                conn.helper = None;
            }
            self.exit_connection(id, "helper died");
            self.destroy_connection(id);
        }

        let helper_conf = self.conf.helper.clone();
        if let Some(conf) = helper_conf {
            self.helpers
                .restart_worker(worker, &conf, self.tx.clone(), &self.log);
        }
    }

    fn tick(&mut self) {
        self.now = unix_now();
        let ping_time = self.conf.limits.ping_time;
        let reg_timeout = self.conf.limits.registration_timeout;

        let mut to_exit: Vec<(ConnId, &'static str)> = Vec::new();
        let mut to_destroy: Vec<ConnId> = Vec::new();
        let mut to_ping: Vec<ConnId> = Vec::new();

        for conn in self.conns.values() {
            match conn.status {
                Status::Exiting => {
                    if conn.sendq.is_empty() || conn.exit_linger_expired(self.now, EXIT_LINGER) {
                        to_destroy.push(conn.id);
                    }
                }
                Status::Unknown | Status::Handshake => {
                    if conn.first_time + reg_timeout <= self.now {
                        to_exit.push((conn.id, "Connection timed out"));
                    }
                }
                Status::Client | Status::Server => {
                    if conn.last_in + ping_time * 2 <= self.now {
                        to_exit.push((conn.id, "Ping timeout"));
                    } else if conn.last_in + ping_time <= self.now && !conn.ping_sent {
                        to_ping.push(conn.id);
                    }
                }
            }
        }

        for id in to_ping {
            let token = match self.conns.get(&id.raw()) {
                Some(conn) => self.me_wire_for(conn),
                None => continue,
            };
            if let Some(conn) = self.conns.get_mut(&id.raw()) {
                conn.ping_sent = true;
            }
            self.send(id, &format!("PING :{}", token));
        }
        for (id, reason) in to_exit {
            self.exit_connection(id, reason);
        }
        for id in to_destroy {
            self.destroy_connection(id);
        }

        let now = self.now;
        let reject_window = self.conf.limits.reject_duration;
        let throttle_window = self.conf.limits.throttle_duration;
        self.reject_cache.gc(now, reject_window);
        self.throttle.gc(now, throttle_window);
    }
}

fn spawn_read_pump(
    sock: Socket,
    id: ConnId,
    tx: EventTx,
) -> tokio::sync::oneshot::Sender<()> {
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel();
    rt::spawn(read_pump(sock, id, tx, stop_rx));
    stop_tx
}

async fn read_pump(
    sock: Socket,
    id: ConnId,
    mut tx: EventTx,
    mut stop: tokio::sync::oneshot::Receiver<()>,
) {
    let mut buf = vec![0u8; READBUF_SIZE];
    loop {
        tokio::select! {
            // the stop signal must win over readiness, or a transport
            // swap could sip bytes that now belong to a helper
            biased;
            _ = &mut stop => return,
            ready = sock.readable() => {
                if ready.is_err() {
                    let _ = tx.send(Event::Closed(id)).await;
                    return;
                }
                loop {
                    match sock.try_read(&mut buf) {
                        Ok(0) => {
                            let _ = tx.send(Event::Closed(id)).await;
                            return;
                        }
                        Ok(n) => {
                            if tx.send(Event::Read(id, buf[..n].to_vec())).await.is_err() {
                                return;
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(_) => {
                            let _ = tx.send(Event::Closed(id)).await;
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Timer task feeding `Event::Tick` into the loop.
pub async fn tick_pump(mut tx: EventTx) {
    loop {
        Delay::new(std::time::Duration::from_secs(TICK_SECS)).await;
        if tx.send(Event::Tick).await.is_err() {
            return;
        }
    }
}

/// Signal task: a Ctrl-C turns into a clean shutdown event.
pub async fn signal_pump(mut tx: EventTx) {
    if tokio::signal::ctrl_c().await.is_ok() {
        let _ = tx.send(Event::Shutdown).await;
    }
}

/// Dial task for an outgoing link attempt.
pub async fn connect_pump(conf_idx: usize, addr: String, port: u16, mut tx: EventTx) {
    let ev = match tokio::net::TcpStream::connect((addr.as_str(), port)).await {
        Ok(stream) => {
            let peer = stream
                .peer_addr()
                .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
            match stream.into_std() {
                Ok(stream) => Event::Connected {
                    conf_idx,
                    stream,
                    addr: peer,
                },
                Err(err) => Event::ConnectFailed { conf_idx, err },
            }
        }
        Err(err) => Event::ConnectFailed { conf_idx, err },
    };
    let _ = tx.send(ev).await;
}

/// Runs the core loop to completion.
pub async fn run(mut core: Core, mut rx: EventRx) {
    while let Some(ev) = rx.next().await {
        if !core.process_event(ev) {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dagon::conn::HelperSession;
    use crate::dagon::testutil::{server_conn, test_core};

    #[test]
    fn test_helper_death_drops_dependent_links() {
        let mut core = test_core();
        let b = server_conn(&mut core, "irc.b.net", "42X");
        let hub = server_conn(&mut core, "irc.hub.net", "99Y");

        // both links ride worker 0's transforms
        for id in [b, hub] {
            core.conns.get_mut(&id.raw()).unwrap().helper = Some(HelperSession {
                worker: 0,
                session_id: 1,
                tls: true,
                zip: false,
            });
        }

        assert!(core.process_event(Event::HelperDead { worker: 0 }));
        for id in [b, hub] {
            let gone = match core.conns.get(&id.raw()) {
                None => true,
                Some(c) => c.is_exiting(),
            };
            assert!(gone);
        }
        assert!(core.topo.find_name("irc.b.net").is_none());
        assert!(core.topo.find_name("irc.hub.net").is_none());
    }

    #[test]
    fn test_ping_probe_then_timeout() {
        let mut core = test_core();
        let b = server_conn(&mut core, "irc.b.net", "42X");
        let ping_time = core.conf.limits.ping_time;

        // quiet for one interval: a probe goes out
        core.conns.get_mut(&b.raw()).unwrap().last_in = unix_now() - ping_time - 1;
        core.tick();
        {
            let conn = core.conns.get(&b.raw()).unwrap();
            assert!(conn.ping_sent);
            assert!(!conn.is_exiting());
        }

        // quiet for two: the link is gone
        core.conns.get_mut(&b.raw()).unwrap().last_in = unix_now() - ping_time * 2 - 1;
        core.tick();
        let gone = match core.conns.get(&b.raw()) {
            None => true,
            Some(c) => c.is_exiting(),
        };
        assert!(gone);
        assert!(core.topo.find_name("irc.b.net").is_none());
    }

    #[test]
    fn test_unregistered_connection_times_out() {
        let mut core = test_core();
        let id = core.register_connection(None, "203.0.113.9".into(), String::new());
        core.conns.get_mut(&id.raw()).unwrap().first_time =
            unix_now() - core.conf.limits.registration_timeout - 1;
        core.tick();
        let gone = match core.conns.get(&id.raw()) {
            None => true,
            Some(c) => c.is_exiting(),
        };
        assert!(gone);
    }

    #[test]
    fn test_read_event_dispatches_lines_in_order() {
        let mut core = test_core();
        let b = server_conn(&mut core, "irc.b.net", "42X");
        core.process_event(Event::Read(
            b,
            b":42X SID irc.c.net 2 42C :C Net\r\n:42C UID alice 2 1000 +i u host 0 42CAAAAAA :A\r\n"
                .to_vec(),
        ));
        // the second line depends on the first having been processed
        assert!(core.topo.find_id("42C").is_some());
        assert!(core.topo.find_name("alice").is_some());
    }
}
