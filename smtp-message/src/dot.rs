//! Dot-stuffing codecs for the DATA transfer phase.
//!
//! The unstuffer consumes raw wire bytes (so it is safe to feed it line
//! fragments split at arbitrary points), removes the escaping dots and
//! detects the terminating `CRLF.CRLF`. The stuffer does the reverse for the
//! client side.

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum UnstuffState {
    /// At the start of a line.
    LineStart,
    /// Consumed a line-start dot; nothing emitted yet.
    AfterDot,
    /// Mid-line.
    Middle,
    /// Saw a CR mid-line (already emitted).
    Cr,
    /// Saw `.` then CR at line start; neither emitted yet.
    DotCr,
    Done,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct UnstuffResult {
    /// Bytes of the input consumed. Less than the input length only once the
    /// end-of-message marker has been seen; the remainder belongs to the
    /// next protocol phase.
    pub consumed: usize,
    /// True once the terminating lone dot has been consumed.
    pub done: bool,
}

pub struct Unstuffer {
    state: UnstuffState,
}

impl Default for Unstuffer {
    fn default() -> Unstuffer {
        Unstuffer::new()
    }
}

impl Unstuffer {
    pub fn new() -> Unstuffer {
        Unstuffer { state: UnstuffState::LineStart }
    }

    pub fn is_done(&self) -> bool {
        self.state == UnstuffState::Done
    }

    /// Processes `input`, appending unstuffed content bytes to `out`.
    pub fn unstuff(&mut self, input: &[u8], out: &mut Vec<u8>) -> UnstuffResult {
        use UnstuffState::*;
        for (i, &b) in input.iter().enumerate() {
            match (self.state, b) {
                (Done, _) => {
                    return UnstuffResult { consumed: i, done: true };
                }
                (LineStart, b'.') => self.state = AfterDot,
                (LineStart, b'\r') => {
                    out.push(b'\r');
                    self.state = Cr;
                }
                (LineStart, c) => {
                    out.push(c);
                    self.state = Middle;
                }
                (AfterDot, b'\r') => self.state = DotCr,
                (AfterDot, c) => {
                    out.push(c);
                    self.state = Middle;
                }
                (DotCr, b'\n') => {
                    self.state = Done;
                    return UnstuffResult { consumed: i + 1, done: true };
                }
                (DotCr, c) => {
                    out.push(b'\r');
                    out.push(c);
                    self.state = if c == b'\r' { Cr } else { Middle };
                }
                (Middle, b'\r') => {
                    out.push(b'\r');
                    self.state = Cr;
                }
                (Middle, c) => out.push(c),
                (Cr, b'\n') => {
                    out.push(b'\n');
                    self.state = LineStart;
                }
                (Cr, b'\r') => out.push(b'\r'),
                (Cr, c) => {
                    out.push(c);
                    self.state = Middle;
                }
            }
        }
        UnstuffResult { consumed: input.len(), done: self.state == Done }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum StuffState {
    LineStart,
    Middle,
    Cr,
}

/// Escapes content for the wire: a dot at the start of a line doubles, and
/// `finish` appends the terminating `.CRLF` (prefixed by CRLF if the content
/// did not end on a line boundary).
pub struct Stuffer {
    state: StuffState,
}

impl Default for Stuffer {
    fn default() -> Stuffer {
        Stuffer::new()
    }
}

impl Stuffer {
    pub fn new() -> Stuffer {
        Stuffer { state: StuffState::LineStart }
    }

    pub fn stuff(&mut self, input: &[u8], out: &mut Vec<u8>) {
        use StuffState::*;
        for &b in input {
            if self.state == LineStart && b == b'.' {
                out.push(b'.');
            }
            out.push(b);
            self.state = match (self.state, b) {
                (_, b'\r') => Cr,
                (Cr, b'\n') => LineStart,
                _ => Middle,
            };
        }
    }

    pub fn finish(&mut self, out: &mut Vec<u8>) {
        if self.state != StuffState::LineStart {
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b".\r\n");
        self.state = StuffState::LineStart;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::show_bytes;

    fn unstuff_all(chunks: &[&[u8]]) -> (Vec<u8>, Vec<u8>, bool) {
        let mut u = Unstuffer::new();
        let mut out = Vec::new();
        let mut rest = Vec::new();
        let mut done = false;
        for (n, chunk) in chunks.iter().enumerate() {
            let r = u.unstuff(chunk, &mut out);
            if r.done {
                done = true;
                rest.extend_from_slice(&chunk[r.consumed..]);
                for later in &chunks[n + 1..] {
                    rest.extend_from_slice(later);
                }
                break;
            }
        }
        (out, rest, done)
    }

    #[test]
    fn unstuffs() {
        let tests: &[(&[&[u8]], &[u8], &[u8])] = &[
            (&[b"foo", b" bar", b"\r\n", b".\r", b"\n"], b"foo bar\r\n", b""),
            (&[b"\r\n.\r\n"], b"\r\n", b""),
            (&[b".baz\r\n", b".\r\n"], b"baz\r\n", b""),
            (&[b" .baz", b"\r\n.", b"\r\n"], b" .baz\r\n", b""),
            (&[b".\r\n"], b"", b""),
            (&[b"..\r\n.\r\n"], b".\r\n", b""),
            (&[b"foo\r\n. ", b"bar\r\n.\r\n"], b"foo\r\n bar\r\n", b""),
            (&[b"\r\r\n.\r\n"], b"\r\r\n", b""),
            (&[b".\r\nMAIL FROM"], b"", b"MAIL FROM"),
            (&[b"..\r\n.\r\nMAIL FROM"], b".\r\n", b"MAIL FROM"),
        ];
        for (chunks, content, rest) in tests {
            let (out, got_rest, done) = unstuff_all(chunks);
            println!("content: {:?}", show_bytes(&out));
            assert!(done);
            assert_eq!(&out[..], *content);
            assert_eq!(&got_rest[..], *rest);
        }
    }

    #[test]
    fn unstuff_not_done_without_marker() {
        let mut u = Unstuffer::new();
        let mut out = Vec::new();
        let r = u.unstuff(b"hello\r\n", &mut out);
        assert!(!r.done);
        assert_eq!(r.consumed, 7);
        assert_eq!(out, b"hello\r\n");
    }

    #[test]
    fn unstuff_split_points_agree() {
        // Chunking must never change the output.
        let wire: &[u8] = b"a\r\n..b\r\n.c\r\n\r\n.\r\nrest";
        let (whole, rest, _) = unstuff_all(&[wire]);
        for split in 0..wire.len() {
            let (out, r, done) = unstuff_all(&[&wire[..split], &wire[split..]]);
            assert!(done, "split {}", split);
            assert_eq!(out, whole, "split {}", split);
            assert_eq!(r, rest, "split {}", split);
        }
        assert_eq!(whole, b"a\r\n.b\r\nc\r\n\r\n");
        assert_eq!(rest, b"rest");
    }

    #[test]
    fn stuffs() {
        let tests: &[(&[u8], &[u8])] = &[
            (b"foo bar baz", b"foo bar baz\r\n.\r\n"),
            (b"foo\r\n. bar\r\n", b"foo\r\n.. bar\r\n.\r\n"),
            (b"", b".\r\n"),
            (b".", b"..\r\n.\r\n"),
            (b"\r", b"\r\r\n.\r\n"),
            (b"foo bar\r\n", b"foo bar\r\n.\r\n"),
        ];
        for (content, wire) in tests {
            let mut s = Stuffer::new();
            let mut out = Vec::new();
            s.stuff(content, &mut out);
            s.finish(&mut out);
            assert_eq!(&out[..], *wire, "{:?}", show_bytes(content));
        }
    }

    #[test]
    fn stuff_then_unstuff_is_identity() {
        let contents: &[&[u8]] = &[
            b"Hello\r\n",
            b".leading dot\r\nmore\r\n",
            b"no final newline",
            b"..\r\n",
        ];
        for content in contents {
            let mut s = Stuffer::new();
            let mut wire = Vec::new();
            s.stuff(content, &mut wire);
            s.finish(&mut wire);

            let mut u = Unstuffer::new();
            let mut out = Vec::new();
            let r = u.unstuff(&wire, &mut out);
            assert!(r.done);
            let mut expected = content.to_vec();
            if !expected.ends_with(b"\r\n") {
                expected.extend_from_slice(b"\r\n");
            }
            assert_eq!(out, expected);
        }
    }
}
