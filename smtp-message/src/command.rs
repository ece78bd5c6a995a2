//! SMTP command parsing. One complete line in (terminator already stripped
//! by the line assembler), one decoded command out.

use crate::addr::{Email, Hostname, ReversePath};
use crate::body::BodyType;

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("command not recognized")]
    Unrecognized,
    #[error("syntax error in {0} arguments")]
    Syntax(&'static str),
}

/// ESMTP parameters accepted on MAIL FROM.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MailParams {
    pub size: Option<u64>,
    pub body: Option<BodyType>,
    pub smtputf8: bool,
    pub auth: Option<String>,
    pub other: Vec<(String, Option<String>)>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Command {
    Helo {
        hostname: Hostname,
    },
    Ehlo {
        hostname: Hostname,
    },
    Mail {
        from: ReversePath,
        params: MailParams,
        /// Whitespace crept in around the FROM: colon; accepted, warned once.
        sloppy: bool,
    },
    Rcpt {
        to: Email,
        params: Vec<(String, Option<String>)>,
        sloppy: bool,
    },
    Data,
    Bdat {
        size: u64,
        last: bool,
    },
    Rset,
    Noop,
    Quit,
    Vrfy {
        name: String,
    },
    Expn {
        name: String,
    },
    Help,
    StartTls,
    Auth {
        mechanism: String,
        initial: Option<String>,
    },
}

impl Command {
    /// Parses a command line. `permissive` allows MAIL/RCPT addresses
    /// without angle brackets.
    pub fn parse(line: &str, permissive: bool) -> Result<Command, ParseError> {
        let line = line.trim_end_matches(|c| c == ' ' || c == '\t');
        let (verb, rest) = match line.find(' ') {
            Some(p) => (&line[..p], line[p + 1..].trim_start()),
            None => (line, ""),
        };
        let verb = verb.to_ascii_uppercase();
        match verb.as_str() {
            "HELO" => Ok(Command::Helo {
                hostname: parse_hostname_arg(rest)?,
            }),
            "EHLO" => Ok(Command::Ehlo {
                hostname: parse_hostname_arg(rest)?,
            }),
            "MAIL" => parse_mail(rest, permissive),
            "RCPT" => parse_rcpt(rest, permissive),
            "DATA" => no_args(rest, Command::Data, "DATA"),
            "BDAT" => parse_bdat(rest),
            "RSET" => no_args(rest, Command::Rset, "RSET"),
            "NOOP" => Ok(Command::Noop),
            "QUIT" => no_args(rest, Command::Quit, "QUIT"),
            "VRFY" => {
                if rest.is_empty() {
                    Err(ParseError::Syntax("VRFY"))
                } else {
                    Ok(Command::Vrfy { name: rest.to_owned() })
                }
            }
            "EXPN" => {
                if rest.is_empty() {
                    Err(ParseError::Syntax("EXPN"))
                } else {
                    Ok(Command::Expn { name: rest.to_owned() })
                }
            }
            "HELP" => Ok(Command::Help),
            "STARTTLS" => no_args(rest, Command::StartTls, "STARTTLS"),
            "AUTH" => parse_auth(rest),
            _ => Err(ParseError::Unrecognized),
        }
    }

    /// The command as wire bytes, for the client side.
    pub fn to_wire(&self) -> Vec<u8> {
        let s = match self {
            Command::Helo { hostname } => format!("HELO {}\r\n", hostname),
            Command::Ehlo { hostname } => format!("EHLO {}\r\n", hostname),
            Command::Mail { from, params, .. } => {
                let mut s = format!("MAIL FROM:<{}>", from);
                if let Some(size) = params.size {
                    s.push_str(&format!(" SIZE={}", size));
                }
                if let Some(body) = params.body {
                    if let Some(v) = body.as_mail_parameter() {
                        s.push_str(&format!(" BODY={}", v));
                    }
                }
                if params.smtputf8 {
                    s.push_str(" SMTPUTF8");
                }
                if let Some(auth) = &params.auth {
                    s.push_str(&format!(" AUTH={}", auth));
                }
                s.push_str("\r\n");
                s
            }
            Command::Rcpt { to, .. } => format!("RCPT TO:<{}>\r\n", to),
            Command::Data => "DATA\r\n".to_owned(),
            Command::Bdat { size, last } => {
                if *last {
                    format!("BDAT {} LAST\r\n", size)
                } else {
                    format!("BDAT {}\r\n", size)
                }
            }
            Command::Rset => "RSET\r\n".to_owned(),
            Command::Noop => "NOOP\r\n".to_owned(),
            Command::Quit => "QUIT\r\n".to_owned(),
            Command::Vrfy { name } => format!("VRFY {}\r\n", name),
            Command::Expn { name } => format!("EXPN {}\r\n", name),
            Command::Help => "HELP\r\n".to_owned(),
            Command::StartTls => "STARTTLS\r\n".to_owned(),
            Command::Auth { mechanism, initial } => match initial {
                Some(i) => format!("AUTH {} {}\r\n", mechanism, i),
                None => format!("AUTH {}\r\n", mechanism),
            },
        };
        s.into_bytes()
    }
}

fn no_args(rest: &str, cmd: Command, what: &'static str) -> Result<Command, ParseError> {
    if rest.is_empty() {
        Ok(cmd)
    } else {
        Err(ParseError::Syntax(what))
    }
}

fn parse_hostname_arg(rest: &str) -> Result<Hostname, ParseError> {
    Hostname::parse_complete(rest.trim()).ok_or(ParseError::Syntax("EHLO"))
}

/// Splits `FROM:<path> params` / `TO:<path> params` after the keyword,
/// reporting whether whitespace crept in around the colon.
fn keyword_and_path<'a>(
    rest: &'a str,
    keyword: &str,
    what: &'static str,
) -> Result<(&'a str, bool), ParseError> {
    let kl = keyword.len();
    if rest.len() < kl || !rest[..kl].eq_ignore_ascii_case(keyword) {
        return Err(ParseError::Syntax(what));
    }
    let mut sloppy = false;
    let mut after = &rest[kl..];
    if after.starts_with(' ') || after.starts_with('\t') {
        sloppy = true;
        after = after.trim_start();
    }
    if !after.starts_with(':') {
        return Err(ParseError::Syntax(what));
    }
    after = &after[1..];
    if after.starts_with(' ') || after.starts_with('\t') {
        sloppy = true;
        after = after.trim_start();
    }
    Ok((after, sloppy))
}

/// The address part ends at the closing bracket, or at the first space for
/// unbracketed forms; everything after is the parameter list.
fn split_address_and_params<'a>(s: &'a str, what: &'static str) -> Result<(&'a str, &'a str), ParseError> {
    if s.starts_with('<') {
        match s.find('>') {
            Some(p) => Ok((&s[..=p], s[p + 1..].trim_start())),
            None => Err(ParseError::Syntax(what)),
        }
    } else {
        match s.find(' ') {
            Some(p) => Ok((&s[..p], s[p + 1..].trim_start())),
            None => Ok((s, "")),
        }
    }
}

fn parse_mail(rest: &str, permissive: bool) -> Result<Command, ParseError> {
    let (after, sloppy) = keyword_and_path(rest, "FROM", "MAIL")?;
    let (addr, rawparams) = split_address_and_params(after, "MAIL")?;

    let from = if addr == "<>" {
        ReversePath::Null
    } else if addr.starts_with('<') {
        ReversePath::Mailbox(
            Email::parse_bracketed(addr).ok_or(ParseError::Syntax("MAIL"))?,
        )
    } else if permissive && !addr.is_empty() {
        ReversePath::Mailbox(Email::parse_complete(addr).ok_or(ParseError::Syntax("MAIL"))?)
    } else {
        return Err(ParseError::Syntax("MAIL"));
    };

    let mut params = MailParams::default();
    for tok in rawparams.split_whitespace() {
        let (key, value) = match tok.find('=') {
            Some(p) => (&tok[..p], Some(&tok[p + 1..])),
            None => (tok, None),
        };
        if key.eq_ignore_ascii_case("SIZE") {
            let v = value.ok_or(ParseError::Syntax("MAIL"))?;
            params.size = Some(v.parse::<u64>().map_err(|_| ParseError::Syntax("MAIL"))?);
        } else if key.eq_ignore_ascii_case("BODY") {
            let v = value.ok_or(ParseError::Syntax("MAIL"))?;
            params.body =
                Some(BodyType::from_mail_parameter(v).ok_or(ParseError::Syntax("MAIL"))?);
        } else if key.eq_ignore_ascii_case("SMTPUTF8") {
            if value.is_some() {
                return Err(ParseError::Syntax("MAIL"));
            }
            params.smtputf8 = true;
        } else if key.eq_ignore_ascii_case("AUTH") {
            params.auth = Some(value.unwrap_or("").to_owned());
        } else {
            params
                .other
                .push((key.to_owned(), value.map(|v| v.to_owned())));
        }
    }

    Ok(Command::Mail { from, params, sloppy })
}

fn parse_rcpt(rest: &str, permissive: bool) -> Result<Command, ParseError> {
    let (after, sloppy) = keyword_and_path(rest, "TO", "RCPT")?;
    let (addr, rawparams) = split_address_and_params(after, "RCPT")?;

    let to = if addr.starts_with('<') {
        Email::parse_bracketed(addr).ok_or(ParseError::Syntax("RCPT"))?
    } else if permissive && !addr.is_empty() {
        Email::parse_complete(addr).ok_or(ParseError::Syntax("RCPT"))?
    } else {
        return Err(ParseError::Syntax("RCPT"));
    };

    let params = rawparams
        .split_whitespace()
        .map(|tok| match tok.find('=') {
            Some(p) => (tok[..p].to_owned(), Some(tok[p + 1..].to_owned())),
            None => (tok.to_owned(), None),
        })
        .collect();

    Ok(Command::Rcpt { to, params, sloppy })
}

fn parse_bdat(rest: &str) -> Result<Command, ParseError> {
    let mut it = rest.split_whitespace();
    let size = it
        .next()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or(ParseError::Syntax("BDAT"))?;
    let last = match it.next() {
        None => false,
        Some(w) if w.eq_ignore_ascii_case("LAST") => true,
        Some(_) => return Err(ParseError::Syntax("BDAT")),
    };
    if it.next().is_some() {
        return Err(ParseError::Syntax("BDAT"));
    }
    Ok(Command::Bdat { size, last })
}

fn parse_auth(rest: &str) -> Result<Command, ParseError> {
    let mut it = rest.split_whitespace();
    let mechanism = it
        .next()
        .ok_or(ParseError::Syntax("AUTH"))?
        .to_ascii_uppercase();
    let initial = it.next().map(|s| s.to_owned());
    if it.next().is_some() {
        return Err(ParseError::Syntax("AUTH"));
    }
    Ok(Command::Auth { mechanism, initial })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> Command {
        Command::parse(line, false).unwrap()
    }

    #[test]
    fn basic_verbs() {
        assert_eq!(parse("DATA"), Command::Data);
        assert_eq!(parse("RSET"), Command::Rset);
        assert_eq!(parse("rSeT \t "), Command::Rset);
        assert_eq!(parse("QUIT"), Command::Quit);
        assert_eq!(parse("NOOP"), Command::Noop);
        assert_eq!(parse("STARTTLS"), Command::StartTls);
        assert!(Command::parse("FOO", false).is_err());
        assert!(Command::parse("DATA now", false).is_err());
    }

    #[test]
    fn ehlo_and_helo() {
        match parse("EHLO foo.bar.baz") {
            Command::Ehlo { hostname } => assert_eq!(hostname.raw(), "foo.bar.baz"),
            other => panic!("unexpected: {:?}", other),
        }
        match parse("helo [127.0.0.1]") {
            Command::Helo { hostname } => assert_eq!(hostname.raw(), "[127.0.0.1]"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn mail_null_and_mailbox() {
        match parse("MAIL FROM:<>") {
            Command::Mail { from, sloppy, .. } => {
                assert_eq!(from, ReversePath::Null);
                assert!(!sloppy);
            }
            other => panic!("unexpected: {:?}", other),
        }
        match parse("MAIL FROM:<hello@world.example>") {
            Command::Mail { from, .. } => {
                assert_eq!(from.as_email().unwrap().to_string(), "hello@world.example")
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn mail_params() {
        match parse("MAIL FROM:<a@b.c> SIZE=1234 BODY=8BITMIME SMTPUTF8 AUTH=<>") {
            Command::Mail { params, .. } => {
                assert_eq!(params.size, Some(1234));
                assert_eq!(params.body, Some(BodyType::EightBitMime));
                assert!(params.smtputf8);
                assert_eq!(params.auth.as_deref(), Some("<>"));
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(Command::parse("MAIL FROM:<a@b.c> SIZE=abc", false).is_err());
        assert!(Command::parse("MAIL FROM:<a@b.c> BODY=QUANTUM", false).is_err());
    }

    #[test]
    fn sloppy_spacing_flagged() {
        match parse("MAIL FROM : <a@b.c>") {
            Command::Mail { from, sloppy, .. } => {
                assert!(sloppy);
                assert_eq!(from.as_email().unwrap().to_string(), "a@b.c");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn bare_addresses_only_when_permissive() {
        assert!(Command::parse("MAIL FROM:foo@bar.example", false).is_err());
        match Command::parse("MAIL FROM:foo@bar.example", true).unwrap() {
            Command::Mail { from, .. } => {
                assert_eq!(from.as_email().unwrap().to_string(), "foo@bar.example")
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn rcpt() {
        match parse("rCpT To:<foo@bar.baz>") {
            Command::Rcpt { to, .. } => assert_eq!(to.to_string(), "foo@bar.baz"),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(Command::parse("RCPT TO:", false).is_err());
    }

    #[test]
    fn bdat() {
        assert_eq!(parse("BDAT 1000"), Command::Bdat { size: 1000, last: false });
        assert_eq!(parse("BDAT 0 LAST"), Command::Bdat { size: 0, last: true });
        assert!(Command::parse("BDAT", false).is_err());
        assert!(Command::parse("BDAT ten", false).is_err());
        assert!(Command::parse("BDAT 5 FIRST", false).is_err());
    }

    #[test]
    fn auth() {
        assert_eq!(
            parse("AUTH plain AGFsaWNlAHNlc2FtZQ=="),
            Command::Auth {
                mechanism: "PLAIN".into(),
                initial: Some("AGFsaWNlAHNlc2FtZQ==".into()),
            }
        );
        assert_eq!(
            parse("AUTH LOGIN"),
            Command::Auth { mechanism: "LOGIN".into(), initial: None }
        );
        assert!(Command::parse("AUTH", false).is_err());
    }

    #[test]
    fn wire_roundtrip() {
        let cmds = vec![
            "EHLO relay.example\r\n",
            "MAIL FROM:<a@b.c> SIZE=7 SMTPUTF8\r\n",
            "RCPT TO:<x@y.z>\r\n",
            "DATA\r\n",
            "BDAT 12 LAST\r\n",
            "QUIT\r\n",
        ];
        for wire in cmds {
            let parsed = Command::parse(&wire[..wire.len() - 2], false).unwrap();
            assert_eq!(parsed.to_wire(), wire.as_bytes(), "{}", wire);
        }
    }
}
