use std::fmt;

/// A three-digit SMTP reply code.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReplyCode(u16);

#[allow(dead_code)]
impl ReplyCode {
    pub const SYSTEM_STATUS: ReplyCode = ReplyCode(211);
    pub const HELP_MESSAGE: ReplyCode = ReplyCode(214);
    pub const SERVICE_READY: ReplyCode = ReplyCode(220);
    pub const CLOSING_CHANNEL: ReplyCode = ReplyCode(221);
    pub const AUTH_SUCCEEDED: ReplyCode = ReplyCode(235);
    pub const OKAY: ReplyCode = ReplyCode(250);
    pub const USER_NOT_LOCAL_WILL_FORWARD: ReplyCode = ReplyCode(251);
    pub const CANNOT_VRFY_BUT_PLEASE_TRY: ReplyCode = ReplyCode(252);
    pub const AUTH_CHALLENGE: ReplyCode = ReplyCode(334);
    pub const START_MAIL_INPUT: ReplyCode = ReplyCode(354);
    pub const SERVICE_NOT_AVAILABLE: ReplyCode = ReplyCode(421);
    pub const MAILBOX_TEMPORARILY_UNAVAILABLE: ReplyCode = ReplyCode(450);
    pub const LOCAL_ERROR: ReplyCode = ReplyCode(451);
    pub const INSUFFICIENT_STORAGE: ReplyCode = ReplyCode(452);
    pub const AUTH_TEMPORARY_FAILURE: ReplyCode = ReplyCode(454);
    pub const COMMAND_UNRECOGNIZED: ReplyCode = ReplyCode(500);
    pub const SYNTAX_ERROR: ReplyCode = ReplyCode(501);
    pub const COMMAND_UNIMPLEMENTED: ReplyCode = ReplyCode(502);
    pub const BAD_SEQUENCE: ReplyCode = ReplyCode(503);
    pub const PARAMETER_UNIMPLEMENTED: ReplyCode = ReplyCode(504);
    pub const AUTH_REQUIRED: ReplyCode = ReplyCode(530);
    pub const AUTH_FAILED: ReplyCode = ReplyCode(535);
    pub const MAILBOX_UNAVAILABLE: ReplyCode = ReplyCode(550);
    pub const POLICY_REASON: ReplyCode = ReplyCode(550);
    pub const USER_NOT_LOCAL: ReplyCode = ReplyCode(551);
    pub const EXCEEDED_STORAGE: ReplyCode = ReplyCode(552);
    pub const MAILBOX_NAME_INCORRECT: ReplyCode = ReplyCode(553);
    pub const TRANSACTION_FAILED: ReplyCode = ReplyCode(554);
    pub const PARAMETER_NOT_SUPPORTED: ReplyCode = ReplyCode(555);

    pub fn custom(code: u16) -> ReplyCode {
        assert!((100..1000).contains(&code));
        ReplyCode(code)
    }

    pub fn code(self) -> u16 {
        self.0
    }

    pub fn kind(self) -> ReplyCodeKind {
        match self.0 / 100 {
            1 => ReplyCodeKind::PositivePreliminary,
            2 => ReplyCodeKind::PositiveCompletion,
            3 => ReplyCodeKind::PositiveIntermediate,
            4 => ReplyCodeKind::TransientNegative,
            _ => ReplyCodeKind::PermanentNegative,
        }
    }

    pub fn is_success(self) -> bool {
        matches!(
            self.kind(),
            ReplyCodeKind::PositiveCompletion | ReplyCodeKind::PositiveIntermediate
        )
    }
}

impl fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReplyCodeKind {
    PositivePreliminary,
    PositiveCompletion,
    PositiveIntermediate,
    TransientNegative,
    PermanentNegative,
}

#[derive(Debug, thiserror::Error)]
pub enum ReplyError {
    #[error("reply line does not start with a three-digit code: {0:?}")]
    BadCode(String),
    #[error("reply code changed mid-reply: {0} then {1}")]
    CodeChanged(ReplyCode, ReplyCode),
    #[error("reply text contains bytes not allowed on the wire")]
    BadText,
}

/// A complete (possibly multi-line) SMTP reply.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Reply {
    pub code: ReplyCode,
    pub text: Vec<String>,
}

impl Reply {
    pub fn new(code: ReplyCode, text: impl Into<String>) -> Reply {
        Reply {
            code,
            text: vec![text.into()],
        }
    }

    pub fn with_lines(code: ReplyCode, text: Vec<String>) -> Reply {
        assert!(!text.is_empty());
        Reply { code, text }
    }

    /// The reply as wire bytes, `-` on all but the last line.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let last = self.text.len() - 1;
        for (i, line) in self.text.iter().enumerate() {
            let sep = if i == last { ' ' } else { '-' };
            out.extend_from_slice(format!("{}{}{}\r\n", self.code, sep, line).as_bytes());
        }
        out
    }

    /// The first text line, for logging and envelope failure reasons.
    pub fn summary(&self) -> &str {
        &self.text[0]
    }

    /// Parses one reply line (without its terminator) into the code, the
    /// last-line flag and the text.
    pub fn parse_line(line: &str) -> Result<(ReplyCode, bool, String), ReplyError> {
        let bytes = line.as_bytes();
        if bytes.len() < 3 || !bytes[..3].iter().all(|b| b.is_ascii_digit()) {
            return Err(ReplyError::BadCode(line.to_owned()));
        }
        let code = line[..3].parse::<u16>().map_err(|_| ReplyError::BadCode(line.to_owned()))?;
        if code < 100 {
            return Err(ReplyError::BadCode(line.to_owned()));
        }
        let (last, text) = match bytes.get(3) {
            None => (true, ""),
            Some(b' ') => (true, &line[4..]),
            Some(b'-') => (false, &line[4..]),
            Some(_) => return Err(ReplyError::BadCode(line.to_owned())),
        };
        Ok((ReplyCode::custom(code), last, text.to_owned()))
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.text.join(" / "))
    }
}

/// Collates reply lines into complete replies, one connection's worth at a
/// time. Continuation lines must repeat the code of the first line.
#[derive(Default)]
pub struct ReplyAccumulator {
    partial: Vec<(ReplyCode, String)>,
}

impl ReplyAccumulator {
    pub fn new() -> ReplyAccumulator {
        ReplyAccumulator { partial: Vec::new() }
    }

    pub fn add_line(&mut self, line: &str) -> Result<Option<Reply>, ReplyError> {
        let (code, last, text) = Reply::parse_line(line)?;
        if let Some((first, _)) = self.partial.first() {
            if *first != code {
                let first = *first;
                self.partial.clear();
                return Err(ReplyError::CodeChanged(first, code));
            }
        }
        self.partial.push((code, text));
        if last {
            let text = self.partial.drain(..).map(|(_, t)| t).collect();
            Ok(Some(Reply { code, text }))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_line_wire() {
        let r = Reply::new(ReplyCode::OKAY, "Okay");
        assert_eq!(r.to_wire(), b"250 Okay\r\n");
    }

    #[test]
    fn multi_line_wire() {
        let r = Reply::with_lines(
            ReplyCode::OKAY,
            vec!["mail.example.org".into(), "PIPELINING".into(), "SIZE 1000".into()],
        );
        assert_eq!(
            r.to_wire(),
            b"250-mail.example.org\r\n250-PIPELINING\r\n250 SIZE 1000\r\n"
        );
    }

    #[test]
    fn parse_lines() {
        assert_eq!(
            Reply::parse_line("250 All is well").unwrap(),
            (ReplyCode::OKAY, true, "All is well".to_owned())
        );
        assert_eq!(
            Reply::parse_line("450-Temporary").unwrap(),
            (ReplyCode::custom(450), false, "Temporary".to_owned())
        );
        assert!(Reply::parse_line("25x oops").is_err());
        assert!(Reply::parse_line("").is_err());
    }

    #[test]
    fn accumulates_multi_line() {
        let mut acc = ReplyAccumulator::new();
        assert!(acc.add_line("250-a").unwrap().is_none());
        assert!(acc.add_line("250-b").unwrap().is_none());
        let r = acc.add_line("250 c").unwrap().unwrap();
        assert_eq!(r.code, ReplyCode::OKAY);
        assert_eq!(r.text, vec!["a", "b", "c"]);
    }

    #[test]
    fn code_change_is_an_error() {
        let mut acc = ReplyAccumulator::new();
        assert!(acc.add_line("250-a").unwrap().is_none());
        assert!(acc.add_line("550 b").is_err());
    }

    #[test]
    fn kinds() {
        assert_eq!(ReplyCode::OKAY.kind(), ReplyCodeKind::PositiveCompletion);
        assert_eq!(
            ReplyCode::START_MAIL_INPUT.kind(),
            ReplyCodeKind::PositiveIntermediate
        );
        assert_eq!(
            ReplyCode::LOCAL_ERROR.kind(),
            ReplyCodeKind::TransientNegative
        );
        assert_eq!(
            ReplyCode::MAILBOX_UNAVAILABLE.kind(),
            ReplyCodeKind::PermanentNegative
        );
    }
}
