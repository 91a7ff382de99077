//! Line framed byte queues.
//!
//! A `LineBuf` accumulates inbound bytes into terminated lines, and
//! stages outbound lines for flushing. Line payloads are reference
//! counted, so the lines of one queue can be attached onto another
//! without copying a single byte.
//!
//! Lines are capped at `BUF_DATA_SIZE` bytes including the terminator.
//! A logical line that exceeds the cap is truncated and force
//! terminated, and the remainder of it is discarded up to the next
//! CR/LF, so an overlong line never bleeds into the one after it.

use std::cell::{Ref, RefCell};
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;

use smallvec::SmallVec;

/// Per line capacity, including the CR+LF terminator.
pub const BUF_DATA_SIZE: usize = 512;

// Longest stored line body: the cap less one, as in the wire grammar
// (510 bytes of text plus CR+LF).
const MAX_STORED: usize = BUF_DATA_SIZE - 1;

struct Line {
    buf: Vec<u8>,
    terminated: bool,
    raw: bool,
}

type LineRef = Rc<RefCell<Line>>;

impl Line {
    fn new(raw: bool) -> LineRef {
        Rc::new(RefCell::new(Line {
            buf: Vec::with_capacity(BUF_DATA_SIZE),
            terminated: false,
            raw,
        }))
    }
}

/// An ordered queue of line buffers.
pub struct LineBuf {
    list: VecDeque<LineRef>,
    len: usize,
    writeofs: usize,
    flushing: bool,
    discarding: bool,
}

impl Default for LineBuf {
    fn default() -> Self {
        Self::new()
    }
}

// skip to the end of the line, then over the trailing CR/LF run;
// returns the number of bytes covered within this chunk
fn skip_crlf(data: &[u8]) -> usize {
    let mut i = 0;
    while i < data.len() && data[i] != b'\r' && data[i] != b'\n' {
        i += 1;
    }
    while i < data.len() && (data[i] == b'\r' || data[i] == b'\n') {
        i += 1;
    }
    i
}

fn is_eol(b: u8) -> bool {
    b == b'\r' || b == b'\n'
}

impl LineBuf {
    /// Creates an empty `LineBuf`.
    pub fn new() -> Self {
        Self {
            list: VecDeque::new(),
            len: 0,
            writeofs: 0,
            flushing: false,
            discarding: false,
        }
    }

    /// Total byte length of all queued lines.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Reports whether the queue holds no lines at all.
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Number of queued lines, the partial tail included.
    pub fn num_lines(&self) -> usize {
        self.list.len()
    }

    /// Reports whether any terminated line is ready for `get`.
    pub fn has_terminated(&self) -> bool {
        self.list
            .front()
            .map(|l| l.borrow().terminated)
            .unwrap_or(false)
    }

    // copy one segment of `data` into `line`, honoring the cap;
    // returns the bytes consumed from `data`
    fn copy_segment(&mut self, line: &LineRef, data: &[u8], raw: bool) -> usize {
        let mut line = line.borrow_mut();
        if line.terminated {
            return 0;
        }
        line.raw = raw;

        let clen = skip_crlf(data);
        let space = MAX_STORED - line.buf.len();

        if clen > space {
            // overflow: truncate at capacity and force terminate
            let before = line.buf.len();
            line.buf.extend_from_slice(&data[..space]);
            if !raw {
                while line.buf.last().map(|&b| is_eol(b)).unwrap_or(false) {
                    line.buf.pop();
                }
            }
            line.terminated = true;
            self.len += line.buf.len() - before;
            if !is_eol(data[clen - 1]) {
                // the terminator of this line has not arrived yet;
                // keep discarding until it does
                self.discarding = true;
            }
            return clen;
        }

        let before = line.buf.len();
        line.buf.extend_from_slice(&data[..clen]);

        if clen == 0 || !is_eol(data[clen - 1]) {
            // no linefeed, bail for the next time
            self.len += line.buf.len() - before;
            return clen;
        }

        if !raw {
            while line.buf.last().map(|&b| is_eol(b)).unwrap_or(false) {
                line.buf.pop();
            }
        }
        line.terminated = true;
        self.len += line.buf.len() - before;
        clen
    }

    /// Appends inbound bytes, splitting them into lines on CR/LF
    /// boundaries. In raw mode terminators are preserved in the stored
    /// payload; otherwise they are stripped on terminate.
    ///
    /// Returns the number of line segments processed.
    pub fn parse(&mut self, mut data: &[u8], raw: bool) -> usize {
        let mut linecnt = 0;

        if self.discarding {
            let mut i = 0;
            while i < data.len() && !is_eol(data[i]) {
                i += 1;
            }
            if i == data.len() {
                return 0;
            }
            while i < data.len() && is_eol(data[i]) {
                i += 1;
            }
            self.discarding = false;
            data = &data[i..];
        }

        // first, if we have a partial tail, squeeze data into it
        if let Some(tail) = self.list.back().cloned() {
            if !tail.borrow().terminated {
                debug_assert!(!self.flushing || self.list.len() > 1);
                let cpylen = self.copy_segment(&tail, data, raw);
                linecnt += 1;
                if cpylen == data.len() {
                    return linecnt;
                }
                data = &data[cpylen..];
            }
        }

        while !data.is_empty() {
            let line = Line::new(raw);
            self.list.push_back(line.clone());
            let cpylen = self.copy_segment(&line, data, raw);
            data = &data[cpylen..];
            linecnt += 1;
        }
        linecnt
    }

    fn put_normalized(&mut self, text: &[u8]) {
        debug_assert!(self
            .list
            .back()
            .map(|l| l.borrow().terminated)
            .unwrap_or(true));

        let line = Line::new(false);
        {
            let mut l = line.borrow_mut();
            let take = text.len().min(BUF_DATA_SIZE - 2);
            l.buf.extend_from_slice(&text[..take]);
            while l.buf.last().map(|&b| is_eol(b) || b == 0).unwrap_or(false) {
                l.buf.pop();
            }
            l.buf.extend_from_slice(b"\r\n");
            l.terminated = true;
            self.len += l.buf.len();
        }
        self.list.push_back(line);
    }

    /// Appends an outbound line. The stored payload always ends in
    /// CR+LF, is truncated to the conventional 510 byte body, and is
    /// never empty (an empty body becomes just CR+LF).
    pub fn put(&mut self, text: &str) {
        self.put_normalized(text.as_bytes());
    }

    /// Appends an outbound line built from a prefix and a body.
    pub fn put_msg(&mut self, prefix: &str, body: &str) {
        let mut s = Vec::with_capacity(prefix.len() + body.len());
        s.extend_from_slice(prefix.as_bytes());
        s.extend_from_slice(body.as_bytes());
        self.put_normalized(&s);
    }

    // the line at the head is done with; unlink and release it
    fn done_line(&mut self) {
        if let Some(line) = self.list.pop_front() {
            self.len -= line.borrow().buf.len();
            self.writeofs = 0;
            self.flushing = false;
        }
    }

    /// Consumes the oldest terminated line (or the partial tail if
    /// `partial` is set), copying its payload into `dst`.
    ///
    /// Lines stored raw are trimmed of leading and trailing CR/LF when
    /// read back non-raw. Returns the number of bytes copied.
    pub fn get(&mut self, dst: &mut [u8], partial: bool, raw: bool) -> usize {
        let n = {
            let line = match self.list.front() {
                Some(l) => l.borrow(),
                None => return 0,
            };
            if !(partial || line.terminated) {
                return 0;
            }

            let mut payload = &line.buf[..];
            if line.raw && !raw {
                while payload.first().map(|&b| is_eol(b)).unwrap_or(false) {
                    payload = &payload[1..];
                }
                while payload.last().map(|&b| is_eol(b)).unwrap_or(false) {
                    payload = &payload[..payload.len() - 1];
                }
            }
            let n = payload.len().min(dst.len());
            debug_assert!(payload.len() <= dst.len());
            dst[..n].copy_from_slice(&payload[..n]);
            n
        };
        self.done_line();
        n
    }

    /// Writes as many contiguous terminated lines as the sink accepts,
    /// coalescing adjacent lines into a single vectored write. A
    /// partially written line is resumed on the next call.
    ///
    /// Would-block is reported through the sink's error, as is an
    /// empty queue.
    pub fn flush<W: io::Write>(&mut self, sink: &mut W) -> io::Result<usize> {
        const MAX_IOV: usize = 16;

        let mut guards: SmallVec<[Ref<'_, Line>; MAX_IOV]> = SmallVec::new();
        for line in self.list.iter().take(MAX_IOV) {
            let l = line.borrow();
            if !l.terminated {
                break;
            }
            guards.push(l);
        }
        if guards.is_empty() {
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }

        let written = {
            let mut slices: SmallVec<[io::IoSlice<'_>; MAX_IOV]> = SmallVec::new();
            for (i, g) in guards.iter().enumerate() {
                let ofs = if i == 0 && self.flushing {
                    self.writeofs
                } else {
                    0
                };
                slices.push(io::IoSlice::new(&g.buf[ofs..]));
            }
            sink.write_vectored(&slices)?
        };
        drop(guards);

        self.advance(written);
        Ok(written)
    }

    // consume `n` flushed bytes from the head of the queue
    fn advance(&mut self, mut n: usize) {
        while n > 0 {
            let remaining = {
                let head = match self.list.front() {
                    Some(l) => l.borrow(),
                    None => break,
                };
                head.buf.len() - if self.flushing { self.writeofs } else { 0 }
            };
            if n >= remaining {
                n -= remaining;
                self.done_line();
            } else {
                let base = if self.flushing { self.writeofs } else { 0 };
                self.writeofs = base + n;
                self.flushing = true;
                n = 0;
            }
        }
    }

    /// Appends every terminated line of `src` to this queue by shared
    /// reference; no payload bytes are copied.
    pub fn attach(&mut self, src: &LineBuf) {
        for line in src.list.iter() {
            if !line.borrow().terminated {
                continue;
            }
            self.len += line.borrow().buf.len();
            self.list.push_back(line.clone());
        }
    }

    /// Drops every queued line.
    pub fn donebuf(&mut self) {
        while !self.list.is_empty() {
            self.done_line();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get_string(lb: &mut LineBuf, partial: bool, raw: bool) -> Option<String> {
        let mut buf = [0u8; BUF_DATA_SIZE];
        if lb.list.is_empty() {
            return None;
        }
        if !(partial || lb.has_terminated()) {
            return None;
        }
        let n = lb.get(&mut buf, partial, raw);
        Some(String::from_utf8_lossy(&buf[..n]).into_owned())
    }

    #[test]
    fn test_put_then_get_roundtrip() {
        let mut lb = LineBuf::new();
        lb.put("PING :irc.a.net");
        assert_eq!(lb.len(), "PING :irc.a.net\r\n".len());

        let mut rx = LineBuf::new();
        let mut wire = [0u8; BUF_DATA_SIZE];
        let n = lb.get(&mut wire, false, true);
        rx.parse(&wire[..n], false);
        assert_eq!(get_string(&mut rx, false, false).unwrap(), "PING :irc.a.net");
        assert_eq!(rx.len(), 0);
    }

    #[test]
    fn test_parse_splits_lines() {
        let mut lb = LineBuf::new();
        lb.parse(b"one\r\ntwo\nthree", false);
        assert_eq!(get_string(&mut lb, false, false).unwrap(), "one");
        assert_eq!(get_string(&mut lb, false, false).unwrap(), "two");
        // "three" is still partial
        assert_eq!(get_string(&mut lb, false, false), None);
        lb.parse(b"\r\n", false);
        assert_eq!(get_string(&mut lb, false, false).unwrap(), "three");
    }

    #[test]
    fn test_partial_resumes_across_chunks() {
        let mut lb = LineBuf::new();
        lb.parse(b"PI", false);
        lb.parse(b"NG :x\r\n", false);
        assert_eq!(get_string(&mut lb, false, false).unwrap(), "PING :x");
    }

    #[test]
    fn test_overlong_line_force_terminates() {
        // 600 bytes of A followed by CRLF: the first get yields the
        // truncated line, the remainder up to the CRLF is discarded,
        // and the next line is not corrupted
        let mut data = vec![b'A'; 600];
        data.extend_from_slice(b"\r\n");
        let mut lb = LineBuf::new();
        lb.parse(&data, false);

        let got = get_string(&mut lb, false, false).unwrap();
        assert_eq!(got.len(), MAX_STORED);
        assert!(got.bytes().all(|b| b == b'A'));
        assert_eq!(get_string(&mut lb, false, false), None);

        lb.parse(b"NEXT\r\n", false);
        assert_eq!(get_string(&mut lb, false, false).unwrap(), "NEXT");
    }

    #[test]
    fn test_overlong_line_discard_spans_chunks() {
        let mut lb = LineBuf::new();
        lb.parse(&vec![b'A'; 600], false);
        lb.parse(&vec![b'B'; 100], false);
        lb.parse(b"tail\r\nNEXT\r\n", false);

        let got = get_string(&mut lb, false, false).unwrap();
        assert_eq!(got.len(), MAX_STORED);
        assert_eq!(get_string(&mut lb, false, false).unwrap(), "NEXT");
    }

    #[test]
    fn test_put_truncates_and_normalizes() {
        let mut lb = LineBuf::new();
        let long = "B".repeat(600);
        lb.put(&long);
        {
            let head = lb.list.front().unwrap().borrow();
            assert_eq!(head.buf.len(), BUF_DATA_SIZE);
            assert!(head.buf.ends_with(b"\r\n"));
        }

        let mut lb2 = LineBuf::new();
        lb2.put("");
        assert_eq!(lb2.list.front().unwrap().borrow().buf.as_slice(), b"\r\n");

        let mut lb3 = LineBuf::new();
        lb3.put("hello\r\n");
        assert_eq!(
            lb3.list.front().unwrap().borrow().buf.as_slice(),
            b"hello\r\n"
        );
    }

    #[test]
    fn test_byte_len_matches_line_sum() {
        let mut lb = LineBuf::new();
        lb.put("alpha");
        lb.put("beta gamma");
        lb.parse(b"partial", false);
        let sum: usize = lb.list.iter().map(|l| l.borrow().buf.len()).sum();
        assert_eq!(lb.len(), sum);
    }

    #[test]
    fn test_attach_shares_payloads() {
        let mut src = LineBuf::new();
        src.put("shared");
        src.parse(b"not-finished", false);

        let mut dst = LineBuf::new();
        dst.attach(&src);

        // only the terminated line was linked, and its payload is shared
        assert_eq!(dst.num_lines(), 1);
        assert_eq!(Rc::strong_count(src.list.front().unwrap()), 2);
        assert_eq!(dst.len(), "shared\r\n".len());

        assert_eq!(get_string(&mut dst, false, true).unwrap(), "shared\r\n");
        assert_eq!(Rc::strong_count(src.list.front().unwrap()), 1);
    }

    #[test]
    fn test_flush_coalesces_and_resumes() {
        struct Sink {
            accept: usize,
            data: Vec<u8>,
        }
        impl io::Write for Sink {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                let n = buf.len().min(self.accept);
                if n == 0 {
                    return Err(io::Error::from(io::ErrorKind::WouldBlock));
                }
                self.data.extend_from_slice(&buf[..n]);
                Ok(n)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut lb = LineBuf::new();
        lb.put("first");
        lb.put("second");

        let mut sink = Sink {
            accept: 4,
            data: Vec::new(),
        };
        // drain in 4 byte slices, resuming mid line every time
        loop {
            match lb.flush(&mut sink) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => panic!("{}", e),
            }
        }
        assert_eq!(sink.data, b"first\r\nsecond\r\n");
        assert!(lb.is_empty());
        assert_eq!(lb.len(), 0);
    }

    #[test]
    fn test_flush_empty_is_would_block() {
        let mut lb = LineBuf::new();
        let mut sink = Vec::new();
        let err = lb.flush(&mut sink).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_get_raw_partial_drains_everything() {
        let mut lb = LineBuf::new();
        lb.parse(b"full line\r\nhalf", true);
        let mut buf = [0u8; BUF_DATA_SIZE];
        let n = lb.get(&mut buf, true, true);
        assert_eq!(&buf[..n], b"full line\r\n");
        let n = lb.get(&mut buf, true, true);
        assert_eq!(&buf[..n], b"half");
        assert!(lb.is_empty());
    }
}
