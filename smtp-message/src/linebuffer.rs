//! The line assembler: an owning byte buffer that yields complete lines, line
//! fragments, or fixed-size binary blocks, depending on its current mode.

/// How lines are terminated on the wire.
///
/// `Auto` latches onto whichever of CR-LF or bare LF shows up first and keeps
/// using it for the rest of the connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Terminator {
    CrLf,
    Lf,
    Auto,
}

#[derive(Debug, thiserror::Error)]
pub enum LineBufferError {
    #[error("input line longer than the hard limit of {limit} bytes")]
    LineTooLong { limit: usize },
}

/// One unit extracted from the buffer.
///
/// `eol_size` is the number of terminator bytes that were consumed but are
/// not part of `bytes`: 2 for CR-LF, 1 for LF, and 0 for fragments and
/// expect-N blocks.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Line {
    pub bytes: Vec<u8>,
    pub eol_size: usize,
}

impl Line {
    pub fn is_fragment(&self) -> bool {
        self.eol_size == 0
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Mode {
    Line,
    Expect(u64),
    Transparent,
}

pub const DEFAULT_SOFT_LIMIT: usize = 64 * 1024;
pub const DEFAULT_HARD_LIMIT: usize = 1024 * 1024;

pub struct LineBuffer {
    buf: Vec<u8>,
    terminator: Terminator,
    fragments: bool,
    mode: Mode,
    soft_limit: usize,
    hard_limit: usize,
}

impl LineBuffer {
    pub fn new(terminator: Terminator) -> LineBuffer {
        LineBuffer::with_limits(terminator, DEFAULT_SOFT_LIMIT, DEFAULT_HARD_LIMIT)
    }

    pub fn with_limits(terminator: Terminator, soft_limit: usize, hard_limit: usize) -> LineBuffer {
        LineBuffer {
            buf: Vec::new(),
            terminator,
            fragments: false,
            mode: Mode::Line,
            soft_limit,
            hard_limit,
        }
    }

    /// Appends raw bytes from the transport.
    pub fn add(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pushes bytes back to the front of the buffer, to be extracted before
    /// anything already stored. Used when a consumer discovers it has been
    /// handed bytes belonging to the next protocol phase.
    pub fn prepend(&mut self, data: &[u8]) {
        if !data.is_empty() {
            let mut v = Vec::with_capacity(data.len() + self.buf.len());
            v.extend_from_slice(data);
            v.append(&mut self.buf);
            self.buf = v;
        }
    }

    /// True once the buffered byte count calls for transport-level flow
    /// control. Not an error: the caller should stop reading until the
    /// buffer drains.
    pub fn over_soft_limit(&self) -> bool {
        self.buf.len() >= self.soft_limit
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Enables or disables fragment extraction: with fragments on, a partial
    /// line is yielded (with `eol_size == 0`) instead of waiting for its
    /// terminator. Used during data transfer to stream content.
    pub fn set_fragments(&mut self, on: bool) {
        self.fragments = on;
    }

    /// Switches the next extractions to deliver exactly `n` bytes in total,
    /// each extraction yielding whatever is available, before reverting to
    /// line mode.
    pub fn expect(&mut self, n: u64) {
        self.mode = if n == 0 { Mode::Line } else { Mode::Expect(n) };
    }

    /// Fully transparent mode: every buffered byte is passed through as-is.
    pub fn expect_all(&mut self) {
        self.mode = Mode::Transparent;
    }

    pub fn in_line_mode(&self) -> bool {
        self.mode == Mode::Line
    }

    /// Extracts the next unit, or `None` if more input is needed.
    pub fn next(&mut self) -> Result<Option<Line>, LineBufferError> {
        match self.mode {
            Mode::Transparent => {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                let bytes = std::mem::take(&mut self.buf);
                Ok(Some(Line { bytes, eol_size: 0 }))
            }
            Mode::Expect(n) => {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                let take = std::cmp::min(n, self.buf.len() as u64) as usize;
                let bytes = self.buf.drain(..take).collect::<Vec<u8>>();
                let left = n - take as u64;
                self.mode = if left == 0 { Mode::Line } else { Mode::Expect(left) };
                Ok(Some(Line { bytes, eol_size: 0 }))
            }
            Mode::Line => self.next_line(),
        }
    }

    fn next_line(&mut self) -> Result<Option<Line>, LineBufferError> {
        if let Terminator::Auto = self.terminator {
            // Latch on the first LF seen; until then there is no line anyway.
            if let Some(p) = memchr(b'\n', &self.buf) {
                self.terminator = if p > 0 && self.buf[p - 1] == b'\r' {
                    Terminator::CrLf
                } else {
                    Terminator::Lf
                };
            }
        }

        let found = match self.terminator {
            Terminator::CrLf => find_crlf(&self.buf).map(|p| (p, 2)),
            Terminator::Lf => memchr(b'\n', &self.buf).map(|p| (p, 1)),
            Terminator::Auto => None,
        };

        if let Some((pos, eol_size)) = found {
            let start = pos + 1 - eol_size;
            let mut bytes = self.buf.drain(..=pos).collect::<Vec<u8>>();
            bytes.truncate(start);
            if bytes.len() > self.hard_limit {
                return Err(LineBufferError::LineTooLong { limit: self.hard_limit });
            }
            return Ok(Some(Line { bytes, eol_size }));
        }

        if self.fragments {
            // Hold back a trailing CR so a split CR-LF is not delivered as
            // content.
            let mut take = self.buf.len();
            if matches!(self.terminator, Terminator::CrLf | Terminator::Auto)
                && self.buf.last() == Some(&b'\r')
            {
                take -= 1;
            }
            if take > 0 {
                let bytes = self.buf.drain(..take).collect::<Vec<u8>>();
                return Ok(Some(Line { bytes, eol_size: 0 }));
            }
            return Ok(None);
        }

        if self.buf.len() > self.hard_limit {
            return Err(LineBufferError::LineTooLong { limit: self.hard_limit });
        }
        Ok(None)
    }
}

fn memchr(needle: u8, haystack: &[u8]) -> Option<usize> {
    haystack.iter().position(|&b| b == needle)
}

/// Index of the LF of the first CR-LF pair.
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n").map(|p| p + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(lb: &mut LineBuffer) -> Vec<Line> {
        let mut out = Vec::new();
        while let Some(l) = lb.next().unwrap() {
            out.push(l);
        }
        out
    }

    #[test]
    fn crlf_lines() {
        let mut lb = LineBuffer::new(Terminator::CrLf);
        lb.add(b"HELO here\r\nNOOP\r\npartial");
        let lines = drain(&mut lb);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].bytes, b"HELO here");
        assert_eq!(lines[0].eol_size, 2);
        assert_eq!(lines[1].bytes, b"NOOP");
        lb.add(b"\r\n");
        assert_eq!(drain(&mut lb)[0].bytes, b"partial");
    }

    #[test]
    fn auto_detect_latches() {
        // First line ends in bare LF: LF latches, later CR stays in content.
        let mut lb = LineBuffer::new(Terminator::Auto);
        lb.add(b"one\ntwo\r\n");
        let lines = drain(&mut lb);
        assert_eq!(lines[0].bytes, b"one");
        assert_eq!(lines[0].eol_size, 1);
        assert_eq!(lines[1].bytes, b"two\r");
        assert_eq!(lines[1].eol_size, 1);
    }

    #[test]
    fn auto_detect_crlf() {
        let mut lb = LineBuffer::new(Terminator::Auto);
        lb.add(b"one\r\ntwo\n");
        let lines = drain(&mut lb);
        // CR-LF latched: the bare-LF line stays incomplete.
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].bytes, b"one");
        assert_eq!(lines[0].eol_size, 2);
    }

    #[test]
    fn concatenation_homomorphism() {
        // Feeding a+b yields the same sequence of lines as feeding a then b,
        // whatever the split point.
        let input: &[u8] = b"alpha\r\nbeta\r\ngamma delta\r\n";
        let whole = {
            let mut lb = LineBuffer::new(Terminator::CrLf);
            lb.add(input);
            drain(&mut lb)
        };
        for split in 0..input.len() {
            let mut lb = LineBuffer::new(Terminator::CrLf);
            let mut got = Vec::new();
            lb.add(&input[..split]);
            got.extend(drain(&mut lb));
            lb.add(&input[split..]);
            got.extend(drain(&mut lb));
            assert_eq!(got, whole, "split at {}", split);
        }
    }

    #[test]
    fn fragments_hold_back_cr() {
        let mut lb = LineBuffer::new(Terminator::CrLf);
        lb.set_fragments(true);
        lb.add(b"body text\r");
        let l = lb.next().unwrap().unwrap();
        assert_eq!(l.bytes, b"body text");
        assert_eq!(l.eol_size, 0);
        assert!(lb.next().unwrap().is_none());
        lb.add(b"\nnext");
        let l = lb.next().unwrap().unwrap();
        assert_eq!(l.bytes, b"\r");
        assert_eq!(l.eol_size, 2);
        assert_eq!(lb.next().unwrap().unwrap().bytes, b"next");
    }

    #[test]
    fn expect_n_then_line_mode() {
        let mut lb = LineBuffer::new(Terminator::CrLf);
        lb.expect(5);
        lb.add(b"Hel");
        assert_eq!(lb.next().unwrap().unwrap().bytes, b"Hel");
        lb.add(b"loQUIT\r\n");
        let l = lb.next().unwrap().unwrap();
        assert_eq!(l.bytes, b"lo");
        assert_eq!(l.eol_size, 0);
        assert!(lb.in_line_mode());
        assert_eq!(lb.next().unwrap().unwrap().bytes, b"QUIT");
    }

    #[test]
    fn transparent_mode() {
        let mut lb = LineBuffer::new(Terminator::CrLf);
        lb.expect_all();
        lb.add(b"anything\r\ngoes\x00");
        assert_eq!(lb.next().unwrap().unwrap().bytes, b"anything\r\ngoes\x00");
        assert!(lb.next().unwrap().is_none());
    }

    #[test]
    fn hard_limit_without_partial_delivery() {
        let mut lb = LineBuffer::with_limits(Terminator::CrLf, 8, 16);
        lb.add(&vec![b'a'; 17]);
        assert!(matches!(
            lb.next(),
            Err(LineBufferError::LineTooLong { limit: 16 })
        ));
    }

    #[test]
    fn soft_limit_is_advisory() {
        let mut lb = LineBuffer::with_limits(Terminator::CrLf, 4, 1024);
        lb.add(b"abcdef");
        assert!(lb.over_soft_limit());
        lb.add(b"\r\n");
        assert_eq!(lb.next().unwrap().unwrap().bytes, b"abcdef");
        assert!(!lb.over_soft_limit());
    }

    #[test]
    fn prepend_goes_first() {
        let mut lb = LineBuffer::new(Terminator::CrLf);
        lb.add(b"second\r\n");
        lb.prepend(b"first\r\n");
        assert_eq!(lb.next().unwrap().unwrap().bytes, b"first");
        assert_eq!(lb.next().unwrap().unwrap().bytes, b"second");
    }
}
