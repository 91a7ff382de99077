//! The helper worker pool: TLS and compression run in separate
//! processes, attached to existing connections by passing file
//! descriptors over a datagram control channel.
//!
//! Each control message is a single command byte, up to four passed
//! descriptors, and up to about a KiB of inline bytes. Inbound
//! messages are dispatched on the command byte alone. Multi byte ids
//! are host endian 16 bit; string fields are NUL delimited.
//!
//! A failed send or an EOF on the keep-alive pipe marks the worker
//! dead: its queued commands and held descriptors are released, the
//! process is killed and reaped, a replacement is spawned, and fresh
//! certificate material is re-sent.

use std::collections::VecDeque;
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command};

use futures::channel::mpsc as fmpsc;
use futures::{SinkExt, StreamExt};
use nix::cmsg_space;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::socket::{
    recvmsg, sendmsg, socketpair, AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags,
    SockFlag, SockType,
};
use slog::{warn, Logger};
use tokio::io::unix::AsyncFd;

use crate::dagon::async_runtime as rt;
use crate::dagon::collections::{self, HashMap};
use crate::dagon::config;
use crate::dagon::core::{Event, EventTx};

/// Most descriptors one control message may carry.
pub const MAX_PASS_FD: usize = 4;

// inline read size of the control channel
const CTL_READSIZE: usize = 2048;

/// Command bytes, core originated.
pub mod cmd {
    /// Begin TLS accept on fd 0, plaintext on fd 1.
    pub const TLS_ACCEPT: u8 = b'A';
    /// Begin TLS connect on fd 0, plaintext on fd 1.
    pub const TLS_CONNECT: u8 = b'C';
    /// Begin a compression session on fd 0 (raw) and fd 1 (plain).
    pub const ZIP: u8 = b'Z';
    /// Begin compression over an existing TLS bridged session.
    pub const ZIP_OVER_TLS: u8 = b'Y';
    /// Re-key: cert, key and DH parameter paths.
    pub const REKEY: u8 = b'K';
    /// Request compression stats for a session.
    pub const STATS: u8 = b'S';
}

/// One queued control message with the descriptors it carries. The
/// descriptors belong to the worker from the moment the send succeeds;
/// dropping an unsent buffer closes them.
pub struct CtlBuf {
    pub buf: Vec<u8>,
    pub fds: Vec<OwnedFd>,
}

impl CtlBuf {
    fn new(buf: Vec<u8>, fds: Vec<OwnedFd>) -> Self {
        debug_assert!(fds.len() <= MAX_PASS_FD);
        Self { buf, fds }
    }
}

/// Compression statistics reported by a worker.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct ZipStats {
    pub bytes_in: u64,
    pub bytes_in_wire: u64,
    pub bytes_out: u64,
    pub bytes_out_wire: u64,
}

/// A spawned worker process.
pub struct Worker {
    pub id: usize,
    /// Sessions currently attached to this worker.
    pub cli_count: usize,
    pub dead: bool,
    pub pid: Option<u32>,
    child: Option<Child>,
    tx: Option<fmpsc::UnboundedSender<CtlBuf>>,
}

impl Worker {
    fn dead_placeholder(id: usize) -> Self {
        Self {
            id,
            cli_count: 0,
            dead: true,
            pid: None,
            child: None,
            tx: None,
        }
    }

    fn enqueue(&mut self, buf: CtlBuf) -> bool {
        match &self.tx {
            Some(tx) => {
                if tx.unbounded_send(buf).is_err() {
                    self.dead = true;
                    return false;
                }
                true
            }
            None => false,
        }
    }

    fn kill_and_reap(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        self.tx = None;
        self.dead = true;
    }
}

/// The worker set plus session bookkeeping.
pub struct HelperPool {
    pub workers: Vec<Worker>,
    next_session: u16,
    pending_stats: HashMap<u16, oneshot::Sender<ZipStats>>,
}

impl Default for HelperPool {
    fn default() -> Self {
        Self::new()
    }
}

impl HelperPool {
    pub fn new() -> Self {
        Self {
            workers: Vec::new(),
            next_session: 1,
            pending_stats: collections::hash_map(),
        }
    }

    /// Spawns the configured number of workers and sends each its
    /// initial certificate material.
    pub fn start(&mut self, conf: &config::Helper, tx: EventTx, log: &Logger) {
        for i in 0..conf.count {
            let worker = spawn_worker(i, conf, tx.clone(), log);
            self.workers.push(worker);
            self.rekey_one(i, &conf.ssl_cert, &conf.ssl_private_key, &conf.ssl_dh_params);
        }
    }

    /// Replaces a dead worker in place and re-keys the replacement.
    pub fn restart_worker(
        &mut self,
        idx: usize,
        conf: &config::Helper,
        tx: EventTx,
        log: &Logger,
    ) {
        if idx >= self.workers.len() {
            return;
        }
        self.workers[idx].kill_and_reap();
        self.workers[idx] = spawn_worker(idx, conf, tx, log);
        self.rekey_one(idx, &conf.ssl_cert, &conf.ssl_private_key, &conf.ssl_dh_params);
    }

    /// Number of workers able to take sessions.
    pub fn live_count(&self) -> usize {
        self.workers.iter().filter(|w| !w.dead).count()
    }

    /// Allocates a correlation id for a new session.
    pub fn next_session_id(&mut self) -> u16 {
        let id = self.next_session;
        self.next_session = self.next_session.wrapping_add(1).max(1);
        id
    }

    // the worker with the fewest sessions takes the next one
    fn pick(&self) -> Option<usize> {
        self.workers
            .iter()
            .filter(|w| !w.dead)
            .min_by_key(|w| w.cli_count)
            .map(|w| w.id)
    }

    fn start_bridged(
        &mut self,
        command: u8,
        netfd: OwnedFd,
        session: u16,
        trailer: Option<(u8, &[u8])>,
    ) -> Option<(usize, std::os::unix::net::UnixStream)> {
        let idx = self.pick()?;
        let (ours, theirs) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )
        .ok()?;

        let mut buf = Vec::with_capacity(8);
        buf.push(command);
        buf.extend_from_slice(&session.to_ne_bytes());
        if let Some((level, inject)) = trailer {
            buf.push(level);
            buf.extend_from_slice(inject);
        }

        let worker = &mut self.workers[idx];
        if !worker.enqueue(CtlBuf::new(buf, vec![netfd, theirs])) {
            return None;
        }
        worker.cli_count += 1;
        Some((idx, std::os::unix::net::UnixStream::from(ours)))
    }

    /// Hands an accepted socket to a worker for TLS; returns our end
    /// of the plaintext pair.
    pub fn start_tls_accept(
        &mut self,
        netfd: OwnedFd,
        session: u16,
    ) -> Option<(usize, std::os::unix::net::UnixStream)> {
        self.start_bridged(cmd::TLS_ACCEPT, netfd, session, None)
    }

    /// Hands an outgoing socket to a worker for TLS.
    pub fn start_tls_connect(
        &mut self,
        netfd: OwnedFd,
        session: u16,
    ) -> Option<(usize, std::os::unix::net::UnixStream)> {
        self.start_bridged(cmd::TLS_CONNECT, netfd, session, None)
    }

    /// Hands a link's socket to a worker for compression, injecting
    /// bytes we already read ahead of the compressed stream.
    pub fn start_zip(
        &mut self,
        netfd: OwnedFd,
        session: u16,
        level: u8,
        inject: &[u8],
    ) -> Option<(usize, std::os::unix::net::UnixStream)> {
        self.start_bridged(cmd::ZIP, netfd, session, Some((level, inject)))
    }

    /// Layers compression onto a session the worker already bridges
    /// for TLS; no descriptors move.
    pub fn start_zip_over_tls(
        &mut self,
        idx: usize,
        session: u16,
        level: u8,
        inject: &[u8],
    ) -> bool {
        let worker = match self.workers.get_mut(idx) {
            Some(w) if !w.dead => w,
            _ => return false,
        };
        let mut buf = Vec::with_capacity(4 + inject.len());
        buf.push(cmd::ZIP_OVER_TLS);
        buf.extend_from_slice(&session.to_ne_bytes());
        buf.push(level);
        buf.extend_from_slice(inject);
        worker.enqueue(CtlBuf::new(buf, Vec::new()))
    }

    /// A session closed; the worker sheds it.
    pub fn release_session(&mut self, idx: usize) {
        if let Some(w) = self.workers.get_mut(idx) {
            w.cli_count = w.cli_count.saturating_sub(1);
        }
    }

    fn rekey_one(&mut self, idx: usize, cert: &str, key: &str, dh: &str) {
        if let Some(w) = self.workers.get_mut(idx) {
            w.enqueue(CtlBuf::new(rekey_message(cert, key, dh), Vec::new()));
        }
    }

    /// Sends fresh certificate material to every worker. Duplicate
    /// sends are idempotent: the worker keeps the latest material.
    pub fn rekey_all(&mut self, cert: &str, key: &str, dh: &str) {
        for idx in 0..self.workers.len() {
            self.rekey_one(idx, cert, key, dh);
        }
    }

    /// Asks a worker for the compression counters of one session.
    pub fn request_stats(
        &mut self,
        idx: usize,
        session: u16,
        server_name: &str,
    ) -> Option<oneshot::Receiver<ZipStats>> {
        let worker = match self.workers.get_mut(idx) {
            Some(w) if !w.dead => w,
            _ => return None,
        };
        let mut buf = Vec::with_capacity(4 + server_name.len());
        buf.push(cmd::STATS);
        buf.extend_from_slice(&session.to_ne_bytes());
        buf.extend_from_slice(server_name.as_bytes());
        if !worker.enqueue(CtlBuf::new(buf, Vec::new())) {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        self.pending_stats.insert(session, tx);
        Some(rx)
    }

    /// Processes one worker originated control message, dispatched on
    /// its first byte.
    pub fn handle_msg(&mut self, log: &Logger, worker: usize, buf: &[u8], _fds: Vec<OwnedFd>) {
        if buf.is_empty() {
            return;
        }
        match buf[0] {
            cmd::STATS => {
                if let Some((session, stats)) = parse_stats_reply(buf) {
                    if let Some(tx) = self.pending_stats.remove(&session) {
                        let _ = tx.send(stats);
                    }
                }
            }
            other => {
                warn!(
                    log,
                    "Unknown helper command {:?} from worker {}", other as char, worker
                );
            }
        }
    }
}

/// `K` message body: four NUL terminated strings.
pub fn rekey_message(cert: &str, key: &str, dh: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + cert.len() + key.len() + dh.len());
    buf.push(cmd::REKEY);
    buf.push(0);
    buf.extend_from_slice(cert.as_bytes());
    buf.push(0);
    buf.extend_from_slice(key.as_bytes());
    buf.push(0);
    buf.extend_from_slice(dh.as_bytes());
    buf.push(0);
    buf
}

/// Stats reply: id, then four NUL separated decimal counters.
pub fn parse_stats_reply(buf: &[u8]) -> Option<(u16, ZipStats)> {
    if buf.len() < 3 || buf[0] != cmd::STATS {
        return None;
    }
    let session = u16::from_ne_bytes([buf[1], buf[2]]);
    let mut fields = buf[3..]
        .split(|&b| b == 0)
        .filter(|f| !f.is_empty())
        .map(|f| std::str::from_utf8(f).ok()?.parse::<u64>().ok());
    let mut next = || fields.next().flatten();
    let stats = ZipStats {
        bytes_in: next()?,
        bytes_in_wire: next()?,
        bytes_out: next()?,
        bytes_out_wire: next()?,
    };
    Some((session, stats))
}

fn set_nonblocking(fd: RawFd) {
    let _ = fcntl(fd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK));
}

// spawn one worker process: a datagram control pair plus a keep-alive
// pipe, every other descriptor closed before exec
fn spawn_worker(id: usize, conf: &config::Helper, tx: EventTx, log: &Logger) -> Worker {
    let (parent_ctl, child_ctl) = match socketpair(
        AddressFamily::Unix,
        SockType::Datagram,
        None,
        SockFlag::empty(),
    ) {
        Ok(pair) => pair,
        Err(e) => {
            warn!(log, "Helper control socketpair failed: {}", e);
            return Worker::dead_placeholder(id);
        }
    };
    let (pipe_read, pipe_write) = match nix::unistd::pipe() {
        Ok((r, w)) => unsafe { (OwnedFd::from_raw_fd(r), OwnedFd::from_raw_fd(w)) },
        Err(e) => {
            warn!(log, "Helper keep-alive pipe failed: {}", e);
            return Worker::dead_placeholder(id);
        }
    };

    let keep = [child_ctl.as_raw_fd(), pipe_write.as_raw_fd()];
    let mut command = Command::new(&conf.path);
    command
        .env("CTL_FD", child_ctl.as_raw_fd().to_string())
        .env("CTL_PIPE", pipe_write.as_raw_fd().to_string())
        .env("SSL_CERT", &conf.ssl_cert)
        .env("SSL_PRIVATE_KEY", &conf.ssl_private_key)
        .env("SSL_DH_PARAMS", &conf.ssl_dh_params);
    unsafe {
        command.pre_exec(move || {
            // keep only the whitelisted descriptors; close-on-exec
            // ones take care of themselves
            for fd in 3..1024 {
                if keep.contains(&fd) {
                    continue;
                }
                let flags = libc::fcntl(fd, libc::F_GETFD);
                if flags >= 0 && flags & libc::FD_CLOEXEC == 0 {
                    libc::close(fd);
                }
            }
            Ok(())
        });
    }

    let child = match command.spawn() {
        Ok(c) => c,
        Err(e) => {
            warn!(log, "Unable to spawn helper {}: {}", conf.path, e);
            return Worker::dead_placeholder(id);
        }
    };
    drop(child_ctl);
    drop(pipe_write);

    set_nonblocking(parent_ctl.as_raw_fd());
    set_nonblocking(pipe_read.as_raw_fd());

    let (cmd_tx, cmd_rx) = fmpsc::unbounded();
    let pid = child.id();
    rt::spawn(worker_pump(id, parent_ctl, pipe_read, cmd_rx, tx));

    Worker {
        id,
        cli_count: 0,
        dead: false,
        pid: Some(pid),
        child: Some(child),
        tx: Some(cmd_tx),
    }
}

struct FdIo(OwnedFd);

impl AsRawFd for FdIo {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

#[derive(Debug)]
enum PumpIo {
    Progress,
    WouldBlock,
    Dead,
}

fn recv_ctl(fd: RawFd) -> Result<Option<CtlBuf>, PumpIo> {
    let mut buf = vec![0u8; CTL_READSIZE];
    let mut space = cmsg_space!([RawFd; MAX_PASS_FD]);
    let (bytes, fds) = {
        let mut iov = [IoSliceMut::new(&mut buf)];
        match recvmsg::<()>(fd, &mut iov, Some(&mut space), MsgFlags::empty()) {
            Ok(msg) => {
                let mut fds = Vec::new();
                for c in msg.cmsgs() {
                    if let ControlMessageOwned::ScmRights(received) = c {
                        for raw in received {
                            fds.push(unsafe { OwnedFd::from_raw_fd(raw) });
                        }
                    }
                }
                (msg.bytes, fds)
            }
            Err(Errno::EAGAIN) => return Err(PumpIo::WouldBlock),
            Err(_) => return Err(PumpIo::Dead),
        }
    };
    if bytes == 0 && fds.is_empty() {
        return Ok(None);
    }
    buf.truncate(bytes);
    Ok(Some(CtlBuf::new(buf, fds)))
}

fn send_ctl(fd: RawFd, cb: &CtlBuf) -> PumpIo {
    let iov = [IoSlice::new(&cb.buf)];
    let raw: Vec<RawFd> = cb.fds.iter().map(|f| f.as_raw_fd()).collect();
    let cmsgs: &[ControlMessage<'_>] = if raw.is_empty() {
        &[]
    } else {
        &[ControlMessage::ScmRights(&raw)]
    };
    // datagram framed; a short write does not happen
    match sendmsg::<()>(fd, &iov, cmsgs, MsgFlags::empty(), None) {
        Ok(_) => PumpIo::Progress,
        Err(Errno::EAGAIN) => PumpIo::WouldBlock,
        Err(_) => PumpIo::Dead,
    }
}

fn drain_writes(fd: RawFd, writeq: &mut VecDeque<CtlBuf>) -> PumpIo {
    while let Some(front) = writeq.front() {
        match send_ctl(fd, front) {
            PumpIo::Progress => {
                // the descriptors now belong to the worker; our dups
                // close with the buffer
                writeq.pop_front();
            }
            other => return other,
        }
    }
    PumpIo::Progress
}

async fn worker_pump(
    id: usize,
    ctl: OwnedFd,
    pipe: OwnedFd,
    mut rx: fmpsc::UnboundedReceiver<CtlBuf>,
    mut tx: EventTx,
) {
    let ctl = match AsyncFd::new(FdIo(ctl)) {
        Ok(fd) => fd,
        Err(_) => {
            let _ = tx.send(Event::HelperDead { worker: id }).await;
            return;
        }
    };
    let pipe = match AsyncFd::new(FdIo(pipe)) {
        Ok(fd) => fd,
        Err(_) => {
            let _ = tx.send(Event::HelperDead { worker: id }).await;
            return;
        }
    };
    let mut writeq: VecDeque<CtlBuf> = VecDeque::new();

    loop {
        tokio::select! {
            cmd = rx.next() => match cmd {
                Some(buf) => {
                    writeq.push_back(buf);
                    match drain_writes(ctl.get_ref().as_raw_fd(), &mut writeq) {
                        PumpIo::Dead => {
                            let _ = tx.send(Event::HelperDead { worker: id }).await;
                            return;
                        }
                        // on pressure the queue head stays; write
                        // readiness re-arms the drain
                        PumpIo::WouldBlock | PumpIo::Progress => {}
                    }
                }
                // the pool replaced this worker
                None => return,
            },
            guard = ctl.writable(), if !writeq.is_empty() => {
                let mut guard = match guard {
                    Ok(g) => g,
                    Err(_) => {
                        let _ = tx.send(Event::HelperDead { worker: id }).await;
                        return;
                    }
                };
                match drain_writes(ctl.get_ref().as_raw_fd(), &mut writeq) {
                    PumpIo::Dead => {
                        let _ = tx.send(Event::HelperDead { worker: id }).await;
                        return;
                    }
                    PumpIo::WouldBlock => guard.clear_ready(),
                    PumpIo::Progress => {}
                }
            },
            guard = ctl.readable() => {
                let mut guard = match guard {
                    Ok(g) => g,
                    Err(_) => {
                        let _ = tx.send(Event::HelperDead { worker: id }).await;
                        return;
                    }
                };
                loop {
                    match recv_ctl(ctl.get_ref().as_raw_fd()) {
                        Ok(Some(cb)) => {
                            let ev = Event::HelperMsg { worker: id, buf: cb.buf, fds: cb.fds };
                            if tx.send(ev).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) | Err(PumpIo::Dead) => {
                            let _ = tx.send(Event::HelperDead { worker: id }).await;
                            return;
                        }
                        Err(PumpIo::WouldBlock) => {
                            guard.clear_ready();
                            break;
                        }
                        Err(PumpIo::Progress) => unreachable!(),
                    }
                }
            },
            guard = pipe.readable() => {
                let mut guard = match guard {
                    Ok(g) => g,
                    Err(_) => {
                        let _ = tx.send(Event::HelperDead { worker: id }).await;
                        return;
                    }
                };
                let mut scratch = [0u8; 64];
                match nix::unistd::read(pipe.get_ref().as_raw_fd(), &mut scratch) {
                    Ok(0) => {
                        let _ = tx.send(Event::HelperDead { worker: id }).await;
                        return;
                    }
                    Ok(_) => {}
                    Err(Errno::EAGAIN) => guard.clear_ready(),
                    Err(_) => {
                        let _ = tx.send(Event::HelperDead { worker: id }).await;
                        return;
                    }
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rekey_message_framing() {
        let msg = rekey_message("/etc/cert.pem", "/etc/key.pem", "");
        assert_eq!(msg[0], cmd::REKEY);
        let fields: Vec<&[u8]> = msg[2..].split(|&b| b == 0).collect();
        assert_eq!(fields[0], b"/etc/cert.pem");
        assert_eq!(fields[1], b"/etc/key.pem");
        assert_eq!(fields[2], b"");
    }

    #[test]
    fn test_stats_reply_roundtrip() {
        let mut buf = vec![cmd::STATS];
        buf.extend_from_slice(&7u16.to_ne_bytes());
        buf.extend_from_slice(b"100\x0190\x01200\x01150");
        // NUL separated, not 0x01
        let buf: Vec<u8> = buf
            .into_iter()
            .map(|b| if b == 1 { 0 } else { b })
            .collect();
        let (session, stats) = parse_stats_reply(&buf).unwrap();
        assert_eq!(session, 7);
        assert_eq!(
            stats,
            ZipStats {
                bytes_in: 100,
                bytes_in_wire: 90,
                bytes_out: 200,
                bytes_out_wire: 150,
            }
        );
        assert!(parse_stats_reply(b"X").is_none());
    }

    #[test]
    fn test_ctl_fd_passing_loopback() {
        // pass a descriptor to ourselves over a datagram pair, the
        // way a worker receives one
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::Datagram,
            None,
            SockFlag::empty(),
        )
        .unwrap();
        let (pr, pw) = nix::unistd::pipe().unwrap();
        let pw = unsafe { OwnedFd::from_raw_fd(pw) };

        let cb = CtlBuf::new(vec![cmd::TLS_ACCEPT, 1, 0], vec![pw]);
        assert!(matches!(send_ctl(a.as_raw_fd(), &cb), PumpIo::Progress));
        drop(cb);

        let got = recv_ctl(b.as_raw_fd()).unwrap().unwrap();
        assert_eq!(got.buf, vec![cmd::TLS_ACCEPT, 1, 0]);
        assert_eq!(got.fds.len(), 1);

        // prove the passed descriptor is the write end of our pipe
        nix::unistd::write(got.fds[0].as_raw_fd(), b"ok").unwrap();
        let mut out = [0u8; 2];
        nix::unistd::read(pr.as_raw_fd(), &mut out).unwrap();
        assert_eq!(&out, b"ok");
    }

    #[test]
    fn test_scheduling_prefers_least_loaded() {
        let mut pool = HelperPool::new();
        for id in 0..3 {
            pool.workers.push(Worker {
                id,
                cli_count: 3 - id,
                dead: false,
                pid: None,
                child: None,
                tx: None,
            });
        }
        pool.workers[2].dead = true;
        // worker 1 carries fewer sessions than worker 0; 2 is dead
        assert_eq!(pool.pick(), Some(1));
        pool.workers[1].cli_count = 10;
        assert_eq!(pool.pick(), Some(0));
    }

    #[test]
    fn test_session_ids_skip_zero() {
        let mut pool = HelperPool::new();
        pool.next_session = u16::MAX;
        let a = pool.next_session_id();
        let b = pool.next_session_id();
        assert_eq!(a, u16::MAX);
        assert_eq!(b, 1);
    }
}
