//! Per socket connection state.
//!
//! A `Connection` exists for every open socket, from accept until its
//! state machine reaches `Exiting` and the queues have drained. The
//! transport is either the accepted TCP stream, or our end of a local
//! socket pair when TLS or compression has been handed to a helper
//! process.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;

use either::Either;
use tokio::net::{TcpStream, UnixStream};

use crate::dagon::linebuf::LineBuf;
use crate::dagon::topology::EntId;

/// Unique connection id.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
#[repr(transparent)]
pub struct ConnId(u64);

impl ConnId {
    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl From<u64> for ConnId {
    #[inline]
    fn from(raw: u64) -> ConnId {
        ConnId(raw)
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Link capabilities, negotiated during the handshake and cleared when
/// either end lacks them.
pub mod caps {
    /// Peer speaks timestamped links. Required for any server link.
    pub const TS: u32 = 0x001;
    /// Quit storm suppression.
    pub const QS: u32 = 0x002;
    /// Ban exceptions.
    pub const EX: u32 = 0x004;
    /// Invite exceptions.
    pub const IE: u32 = 0x008;
    /// Compressed link through a helper worker.
    pub const ZIP: u32 = 0x010;
    /// Topic burst.
    pub const TB: u32 = 0x020;
    /// Encapsulated command relay.
    pub const ENCAP: u32 = 0x040;
    /// Peer understands the id wire format. Implied by the handshake,
    /// never advertised.
    pub const TS6: u32 = 0x100;

    /// Caps we advertise, in CAPAB order.
    pub const LIST: &[(&str, u32)] = &[
        ("TS", TS),
        ("QS", QS),
        ("EX", EX),
        ("IE", IE),
        ("ZIP", ZIP),
        ("TB", TB),
        ("ENCAP", ENCAP),
    ];

    /// Parses a CAPAB token list into a bit set.
    pub fn parse(tokens: &str) -> u32 {
        let mut set = 0;
        for tok in tokens.split(' ').filter(|t| !t.is_empty()) {
            for (name, bit) in LIST.iter() {
                if tok.eq_ignore_ascii_case(name) {
                    set |= bit;
                }
            }
        }
        set
    }

    /// Renders a bit set back into the token list.
    pub fn render(mask: u32) -> String {
        let mut out = String::new();
        for (name, bit) in LIST.iter() {
            if mask & bit != 0 {
                if !out.is_empty() {
                    out.push(' ');
                }
                out.push_str(name);
            }
        }
        out
    }
}

/// Connection role in the state machine.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Status {
    Unknown,
    Handshake,
    Client,
    Server,
    Exiting,
}

/// The transport under a connection: a TCP stream, or our end of a
/// unix pair once a helper bridges the real socket.
#[derive(Clone)]
pub struct Socket {
    inner: Either<Rc<TcpStream>, Rc<UnixStream>>,
}

impl Socket {
    pub fn tcp(stream: TcpStream) -> Self {
        Self {
            inner: Either::Left(Rc::new(stream)),
        }
    }

    pub fn unix(stream: UnixStream) -> Self {
        Self {
            inner: Either::Right(Rc::new(stream)),
        }
    }

    pub fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match &self.inner {
            Either::Left(s) => s.try_read(buf),
            Either::Right(s) => s.try_read(buf),
        }
    }

    pub fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        match &self.inner {
            Either::Left(s) => s.try_write(buf),
            Either::Right(s) => s.try_write(buf),
        }
    }

    pub fn try_write_vectored(&self, bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
        match &self.inner {
            Either::Left(s) => s.try_write_vectored(bufs),
            Either::Right(s) => s.try_write_vectored(bufs),
        }
    }

    pub async fn readable(&self) -> io::Result<()> {
        match &self.inner {
            Either::Left(s) => s.readable().await,
            Either::Right(s) => s.readable().await,
        }
    }

    pub async fn writable(&self) -> io::Result<()> {
        match &self.inner {
            Either::Left(s) => s.writable().await,
            Either::Right(s) => s.writable().await,
        }
    }

    pub fn raw_fd(&self) -> RawFd {
        match &self.inner {
            Either::Left(s) => s.as_raw_fd(),
            Either::Right(s) => s.as_raw_fd(),
        }
    }

    /// Forces the kernel side closed so pump tasks holding clones wake
    /// up; the descriptor itself dies with the last clone.
    pub fn shutdown(&self) {
        let _ = nix::sys::socket::shutdown(self.raw_fd(), nix::sys::socket::Shutdown::Both);
    }
}

/// `io::Write` view of a `Socket`, for flushing a send queue. Writes
/// never block; pressure surfaces as `WouldBlock`.
pub struct SocketWriter<'a>(pub &'a Socket);

impl io::Write for SocketWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.try_write(buf)
    }

    fn write_vectored(&mut self, bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
        self.0.try_write_vectored(bufs)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Transform sessions a helper worker runs for this connection.
#[derive(Debug, Clone)]
pub struct HelperSession {
    pub worker: usize,
    /// Correlation id used in helper commands.
    pub session_id: u16,
    pub tls: bool,
    pub zip: bool,
}

/// One per open socket.
pub struct Connection {
    pub id: ConnId,
    /// `None` only in unit tests; queues still work without a
    /// transport.
    pub sock: Option<Socket>,
    /// Textual peer address.
    pub addr: String,
    /// Textual local address.
    pub local_addr: String,
    pub status: Status,
    pub caps: u32,
    /// The raw CAPAB string the peer sent, relayed via GCAP.
    pub fullcaps: Option<String>,
    pub recvq: LineBuf,
    pub sendq: LineBuf,
    pub helper: Option<HelperSession>,
    pub first_time: u64,
    pub last_in: u64,
    pub ping_sent: bool,
    /// Set between the end of our burst and the peer's answering
    /// PONG.
    pub awaiting_pong: bool,
    /// Password presented with PASS, zeroed after registration.
    pub password: Option<String>,
    /// Wire id offered with PASS.
    pub offered_sid: Option<String>,
    /// Index of the matched connect block.
    pub sconf: Option<usize>,
    /// The entity this connection represents once registered.
    pub entity: Option<EntId>,
    /// Offered or confirmed server name.
    pub name: String,
    /// We initiated this connection.
    pub outbound: bool,
    /// A write readiness waiter is outstanding.
    pub flush_armed: bool,
    pub exit_reason: Option<String>,
    /// Stops the read pump when the transport is swapped or torn
    /// down.
    pub pump_stop: Option<tokio::sync::oneshot::Sender<()>>,
    notified_unreg: bool,
}

impl Connection {
    pub fn new(id: ConnId, sock: Option<Socket>, addr: String, local_addr: String, now: u64) -> Self {
        Self {
            id,
            sock,
            addr,
            local_addr,
            status: Status::Unknown,
            caps: 0,
            fullcaps: None,
            recvq: LineBuf::new(),
            sendq: LineBuf::new(),
            helper: None,
            first_time: now,
            last_in: now,
            ping_sent: false,
            awaiting_pong: false,
            password: None,
            offered_sid: None,
            sconf: None,
            entity: None,
            name: String::new(),
            outbound: false,
            flush_armed: false,
            exit_reason: None,
            pump_stop: None,
            notified_unreg: false,
        }
    }

    /// Reports whether an exiting connection has outstayed its drain
    /// window. `last_in` is stamped when the exit begins.
    pub fn exit_linger_expired(&self, now: u64, linger: u64) -> bool {
        self.last_in + linger <= now
    }

    /// Tells the read pump to let go of its transport clone.
    pub fn stop_pump(&mut self) {
        if let Some(stop) = self.pump_stop.take() {
            let _ = stop.send(());
        }
    }

    pub fn is_registered(&self) -> bool {
        matches!(self.status, Status::Client | Status::Server)
    }

    pub fn is_server(&self) -> bool {
        self.status == Status::Server
    }

    pub fn is_exiting(&self) -> bool {
        self.status == Status::Exiting
    }

    pub fn has_cap(&self, cap: u32) -> bool {
        self.caps & cap != 0
    }

    pub fn clear_cap(&mut self, cap: u32) {
        self.caps &= !cap;
    }

    /// The display name used in notices about this connection.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            "*"
        } else {
            &self.name
        }
    }

    /// Reports whether the not-registered reply was already sent, and
    /// marks it sent.
    pub fn note_unregistered_reply(&mut self) -> bool {
        let seen = self.notified_unreg;
        self.notified_unreg = true;
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caps_parse_render() {
        let set = caps::parse("TS6 ENCAP zip unknown TB");
        assert!(set & caps::ENCAP != 0);
        assert!(set & caps::ZIP != 0);
        assert!(set & caps::TB != 0);
        // TS6 is not an advertised token
        assert_eq!(set & caps::TS6, 0);
        assert_eq!(caps::render(caps::TS | caps::TB), "TS TB");
    }

    #[test]
    fn test_status_predicates() {
        let mut c = Connection::new(ConnId::from(1), None, "192.0.2.1".into(), "".into(), 0);
        assert!(!c.is_registered());
        c.status = Status::Server;
        assert!(c.is_registered() && c.is_server());
        c.status = Status::Exiting;
        assert!(c.is_exiting());
    }
}
