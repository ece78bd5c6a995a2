//! RFC-5321 address syntax: hostnames, localparts, mailboxes and the
//! reverse-path.

use std::{
    fmt,
    net::{Ipv4Addr, Ipv6Addr},
};

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while1},
    character::complete::char,
    combinator::{map, map_opt, opt, recognize, verify},
    multi::separated_list1,
    sequence::{delimited, pair, preceded},
    IResult,
};

/// Note: comparison happens only on the raw text, so a `Hostname` that was
/// assembled by hand rather than parsed may compare in surprising ways.
#[derive(Clone, Debug, Eq)]
pub enum Hostname {
    AsciiDomain { raw: String },
    Utf8Domain { raw: String, punycode: String },
    Ipv4 { raw: String, ip: Ipv4Addr },
    Ipv6 { raw: String, ip: Ipv6Addr },
}

impl Hostname {
    pub fn raw(&self) -> &str {
        match self {
            Hostname::AsciiDomain { raw } => raw,
            Hostname::Utf8Domain { raw, .. } => raw,
            Hostname::Ipv4 { raw, .. } => raw,
            Hostname::Ipv6 { raw, .. } => raw,
        }
    }

    /// The all-ASCII rendition: the punycode form for UTF-8 domains, the raw
    /// text for everything else. This is what a downgraded message puts on
    /// the wire.
    pub fn to_ascii(&self) -> &str {
        match self {
            Hostname::Utf8Domain { punycode, .. } => punycode,
            other => other.raw(),
        }
    }

    pub fn is_ascii(&self) -> bool {
        !matches!(self, Hostname::Utf8Domain { .. })
    }

    pub fn parse(input: &str) -> IResult<&str, Hostname> {
        alt((ipv6_literal, ipv4_literal, domain))(input)
    }

    pub fn parse_complete(input: &str) -> Option<Hostname> {
        match Hostname::parse(input) {
            Ok(("", h)) => Some(h),
            _ => None,
        }
    }
}

impl PartialEq for Hostname {
    fn eq(&self, other: &Hostname) -> bool {
        self.raw() == other.raw()
    }
}

impl fmt::Display for Hostname {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.raw())
    }
}

fn is_hex_or_sep(c: char) -> bool {
    c.is_ascii_hexdigit() || c == ':' || c == '.'
}

fn ipv6_literal(input: &str) -> IResult<&str, Hostname> {
    map_opt(
        recognize(delimited(tag("[IPv6:"), take_while1(is_hex_or_sep), char(']'))),
        |raw: &str| {
            let inner = &raw[6..raw.len() - 1];
            let ip = inner.parse::<Ipv6Addr>().ok()?;
            Some(Hostname::Ipv6 { raw: raw.to_owned(), ip })
        },
    )(input)
}

fn ipv4_literal(input: &str) -> IResult<&str, Hostname> {
    map_opt(
        recognize(delimited(
            char('['),
            take_while1(|c: char| c.is_ascii_digit() || c == '.'),
            char(']'),
        )),
        |raw: &str| {
            let inner = &raw[1..raw.len() - 1];
            let ip = inner.parse::<Ipv4Addr>().ok()?;
            Some(Hostname::Ipv4 { raw: raw.to_owned(), ip })
        },
    )(input)
}

fn is_label_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || !c.is_ascii()
}

fn label(input: &str) -> IResult<&str, &str> {
    verify(take_while1(is_label_char), |l: &str| {
        !l.starts_with('-') && !l.ends_with('-')
    })(input)
}

fn domain(input: &str) -> IResult<&str, Hostname> {
    map_opt(
        recognize(separated_list1(char('.'), label)),
        |raw: &str| {
            if raw.is_ascii() {
                Some(Hostname::AsciiDomain { raw: raw.to_owned() })
            } else {
                let punycode = idna::domain_to_ascii(raw).ok()?;
                Some(Hostname::Utf8Domain { raw: raw.to_owned(), punycode })
            }
        },
    )(input)
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Localpart {
    Ascii { raw: String },
    QuotedAscii { raw: String },
    Utf8 { raw: String },
    QuotedUtf8 { raw: String },
}

impl Localpart {
    pub fn raw(&self) -> &str {
        match self {
            Localpart::Ascii { raw } => raw,
            Localpart::QuotedAscii { raw } => raw,
            Localpart::Utf8 { raw } => raw,
            Localpart::QuotedUtf8 { raw } => raw,
        }
    }

    pub fn is_ascii(&self) -> bool {
        matches!(self, Localpart::Ascii { .. } | Localpart::QuotedAscii { .. })
    }

    /// Strips the quoting of a quoted-string localpart; dot-string forms are
    /// returned as-is.
    pub fn unquote(&self) -> String {
        match self {
            Localpart::Ascii { raw } | Localpart::Utf8 { raw } => raw.clone(),
            Localpart::QuotedAscii { raw } | Localpart::QuotedUtf8 { raw } => {
                let mut out = String::with_capacity(raw.len());
                let mut escaped = false;
                for c in raw[1..raw.len() - 1].chars() {
                    if escaped {
                        out.push(c);
                        escaped = false;
                    } else if c == '\\' {
                        escaped = true;
                    } else {
                        out.push(c);
                    }
                }
                out
            }
        }
    }

    pub fn parse(input: &str) -> IResult<&str, Localpart> {
        alt((
            map(quoted_string, |raw: &str| {
                if raw.is_ascii() {
                    Localpart::QuotedAscii { raw: raw.to_owned() }
                } else {
                    Localpart::QuotedUtf8 { raw: raw.to_owned() }
                }
            }),
            map(dot_string, |raw: &str| {
                if raw.is_ascii() {
                    Localpart::Ascii { raw: raw.to_owned() }
                } else {
                    Localpart::Utf8 { raw: raw.to_owned() }
                }
            }),
        ))(input)
    }
}

impl fmt::Display for Localpart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.raw())
    }
}

fn is_atext(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || "!#$%&'*+-/=?^_`{|}~".contains(c)
        || !c.is_ascii()
}

fn dot_string(input: &str) -> IResult<&str, &str> {
    recognize(separated_list1(char('.'), take_while1(is_atext)))(input)
}

fn quoted_string(input: &str) -> IResult<&str, &str> {
    if !input.starts_with('"') {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Char,
        )));
    }
    let mut escaped = false;
    let mut content = 0usize;
    for (i, c) in input[1..].char_indices() {
        if escaped {
            if c.is_control() {
                break;
            }
            escaped = false;
            content += 1;
        } else if c == '\\' {
            escaped = true;
        } else if c == '"' {
            if content == 0 {
                break;
            }
            let end = 1 + i + 1;
            return Ok((&input[end..], &input[..end]));
        } else if c.is_control() {
            break;
        } else {
            content += 1;
        }
    }
    Err(nom::Err::Error(nom::error::Error::new(
        input,
        nom::error::ErrorKind::Verify,
    )))
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Email {
    pub localpart: Localpart,
    pub hostname: Option<Hostname>,
}

impl Email {
    pub fn parse(input: &str) -> IResult<&str, Email> {
        map(
            pair(Localpart::parse, opt(preceded(char('@'), Hostname::parse))),
            |(localpart, hostname)| Email { localpart, hostname },
        )(input)
    }

    /// Parses exactly `<mailbox>`, consuming the whole input.
    pub fn parse_bracketed(input: &str) -> Option<Email> {
        match delimited(char('<'), Email::parse, char('>'))(input) {
            Ok(("", email)) => Some(email),
            _ => None,
        }
    }

    pub fn parse_complete(input: &str) -> Option<Email> {
        match Email::parse(input) {
            Ok(("", email)) => Some(email),
            _ => None,
        }
    }

    pub fn is_ascii(&self) -> bool {
        self.localpart.is_ascii() && self.hostname.as_ref().map(|h| h.is_ascii()).unwrap_or(true)
    }

    /// The ASCII rendition used when downgrading an SMTPUTF8 message: the
    /// domain goes to punycode, but a non-ASCII localpart has no ASCII form.
    pub fn to_ascii(&self) -> Option<String> {
        if !self.localpart.is_ascii() {
            return None;
        }
        match &self.hostname {
            Some(h) => Some(format!("{}@{}", self.localpart.raw(), h.to_ascii())),
            None => Some(self.localpart.raw().to_owned()),
        }
    }
}

impl fmt::Display for Email {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.hostname {
            Some(h) => write!(f, "{}@{}", self.localpart, h),
            None => self.localpart.fmt(f),
        }
    }
}

/// The MAIL FROM argument: either the null reverse-path `<>` or a mailbox.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ReversePath {
    Null,
    Mailbox(Email),
}

impl ReversePath {
    pub fn as_email(&self) -> Option<&Email> {
        match self {
            ReversePath::Null => None,
            ReversePath::Mailbox(e) => Some(e),
        }
    }

    pub fn is_ascii(&self) -> bool {
        self.as_email().map(|e| e.is_ascii()).unwrap_or(true)
    }
}

impl fmt::Display for ReversePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReversePath::Null => Ok(()),
            ReversePath::Mailbox(e) => e.fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostname_valid() {
        let tests: &[(&str, &str)] = &[
            ("foo--bar", "foo--bar"),
            ("foo.bar.baz", "foo.bar.baz"),
            ("1.2.3.4", "1.2.3.4"),
        ];
        for (inp, raw) in tests {
            let h = Hostname::parse_complete(inp).unwrap();
            assert!(matches!(h, Hostname::AsciiDomain { .. }));
            assert_eq!(h.raw(), *raw);
        }

        match Hostname::parse_complete("[123.255.37.2]").unwrap() {
            Hostname::Ipv4 { raw, ip } => {
                assert_eq!(raw, "[123.255.37.2]");
                assert_eq!(ip, "123.255.37.2".parse::<Ipv4Addr>().unwrap());
            }
            other => panic!("unexpected: {:?}", other),
        }

        match Hostname::parse_complete("[IPv6:0::ffff:8.7.6.5]").unwrap() {
            Hostname::Ipv6 { ip, .. } => {
                assert_eq!(ip, "0::ffff:8.7.6.5".parse::<Ipv6Addr>().unwrap())
            }
            other => panic!("unexpected: {:?}", other),
        }

        match Hostname::parse_complete("élégance.fr").unwrap() {
            Hostname::Utf8Domain { punycode, .. } => {
                assert_eq!(punycode, "xn--lgance-9uab.fr")
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn hostname_invalid() {
        for inp in &["-foo.bar", "foo-.bar", "[1.2.3]", "[IPv6:zz]"] {
            assert!(Hostname::parse_complete(inp).is_none(), "{}", inp);
        }
    }

    #[test]
    fn localpart_unquoting() {
        let tests: &[(&str, &str)] = &[
            ("t+e-s.t_i+n-g", "t+e-s.t_i+n-g"),
            (r#""quoted\"example""#, r#"quoted"example"#),
            (r#""escaped\\exa\mple""#, r#"escaped\example"#),
        ];
        for (inp, out) in tests {
            let (rest, lp) = Localpart::parse(inp).unwrap();
            assert_eq!(rest, "");
            assert_eq!(lp.unquote(), *out);
        }
    }

    #[test]
    fn email_valid() {
        let e = Email::parse_complete("t+e-s.t_i+n-g@foo.bar.baz").unwrap();
        assert_eq!(e.localpart.raw(), "t+e-s.t_i+n-g");
        assert_eq!(e.hostname.as_ref().unwrap().raw(), "foo.bar.baz");

        let e = Email::parse_complete("postmaster").unwrap();
        assert!(e.hostname.is_none());

        let e = Email::parse_bracketed(r#"<"quoted\"example"@example.org>"#).unwrap();
        assert_eq!(e.localpart.unquote(), r#"quoted"example"#);

        let e = Email::parse_complete("tést@exámple.org").unwrap();
        assert!(!e.is_ascii());
        assert!(e.to_ascii().is_none());

        let e = Email::parse_complete("test@bücher.de").unwrap();
        assert_eq!(e.to_ascii().unwrap(), "test@xn--bcher-kva.de");
    }

    #[test]
    fn email_invalid() {
        for inp in &["@foo.bar", "", "<>", r#""""#] {
            assert!(Email::parse_complete(inp).is_none(), "{:?}", inp);
        }
    }

    #[test]
    fn email_display_roundtrip() {
        for inp in &["a@b.c", "postmaster", r#""a b"@c.d"#] {
            let e = Email::parse_complete(inp).unwrap();
            assert_eq!(&e.to_string(), inp);
        }
    }
}
