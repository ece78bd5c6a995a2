//! The envelope file: one header per line, fixed field order, LF line
//! endings, a CRC32 of everything above it in the last field.

use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};

use smtp_message::BodyType;

pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("envelope is not valid UTF-8")]
    NotUtf8,
    #[error("envelope line {0} is not a ‘Name: value’ header")]
    Malformed(usize),
    #[error("unknown or out-of-order envelope field ‘{0}’")]
    UnexpectedField(String),
    #[error("missing envelope field ‘{0}’")]
    MissingField(&'static str),
    #[error("bad value for envelope field ‘{0}’")]
    BadValue(&'static str),
    #[error("unsupported envelope format version {0}")]
    BadVersion(u32),
    #[error("envelope CRC mismatch: stored {stored:08x}, computed {computed:08x}")]
    CrcMismatch { stored: u32, computed: u32 },
}

/// The authoritative per-message metadata. Addresses are kept in their text
/// form; they were validated by the protocol engines on the way in.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Envelope {
    pub timestamp: DateTime<Utc>,
    pub from: String,
    pub from_auth_in: Option<String>,
    pub to_local: Vec<String>,
    pub to_remote: Vec<String>,
    pub to_delivered: Vec<String>,
    pub forward_to: Option<String>,
    pub selector: Option<String>,
    pub client_socket_address: String,
    pub client_authenticated: bool,
    pub client_secure: bool,
    pub client_cipher: String,
    pub body: BodyType,
    pub content_size: u64,
    pub retry_count: u32,
    pub reason: String,
}

impl Envelope {
    pub fn new(client_socket_address: impl Into<String>) -> Envelope {
        Envelope {
            // Second precision: the timestamp must survive a serialization
            // round-trip byte-identically.
            timestamp: Utc.timestamp(Utc::now().timestamp(), 0),
            from: String::new(),
            from_auth_in: None,
            to_local: Vec::new(),
            to_remote: Vec::new(),
            to_delivered: Vec::new(),
            forward_to: None,
            selector: None,
            client_socket_address: client_socket_address.into(),
            client_authenticated: false,
            client_secure: false,
            client_cipher: String::new(),
            body: BodyType::SevenBit,
            content_size: 0,
            retry_count: 0,
            reason: String::new(),
        }
    }

    pub fn recipient_count(&self) -> usize {
        self.to_local.len() + self.to_remote.len()
    }

    /// Serializes the envelope, CRC last.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut s = String::new();
        s.push_str(&format!("X-Spool-Format: {}\n", FORMAT_VERSION));
        s.push_str(&format!(
            "X-Timestamp: {}\n",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
        ));
        s.push_str(&format!("X-From: {}\n", self.from));
        if let Some(auth) = &self.from_auth_in {
            s.push_str(&format!("X-From-Auth-In: {}\n", auth));
        }
        for a in &self.to_local {
            s.push_str(&format!("X-To-Local: {}\n", a));
        }
        for a in &self.to_remote {
            s.push_str(&format!("X-To-Remote: {}\n", a));
        }
        for a in &self.to_delivered {
            s.push_str(&format!("X-To-Delivered: {}\n", a));
        }
        if let Some(fwd) = &self.forward_to {
            s.push_str(&format!("X-Forward-To: {}\n", fwd));
        }
        if let Some(sel) = &self.selector {
            s.push_str(&format!("X-Selector: {}\n", sel));
        }
        s.push_str(&format!(
            "X-Client-Socket-Address: {}\n",
            self.client_socket_address
        ));
        s.push_str(&format!(
            "X-Client-Authenticated: {}\n",
            if self.client_authenticated { 1 } else { 0 }
        ));
        s.push_str(&format!(
            "X-Client-Secure: {}\n",
            if self.client_secure { 1 } else { 0 }
        ));
        s.push_str(&format!("X-Client-Cipher: {}\n", self.client_cipher));
        s.push_str(&format!("X-Body: {}\n", self.body));
        s.push_str(&format!("X-Content-Size: {}\n", self.content_size));
        s.push_str(&format!("X-Retry-Count: {}\n", self.retry_count));
        s.push_str(&format!("X-Reason: {}\n", self.reason));
        let mut bytes = s.into_bytes();
        let crc = crc32(&bytes);
        bytes.extend_from_slice(format!("X-CRC: {:08x}\n", crc).as_bytes());
        bytes
    }

    /// Parses and verifies an envelope. The CRC covers every byte before the
    /// X-CRC line, LF-normalised; a mismatch rejects the whole file.
    pub fn from_bytes(data: &[u8]) -> Result<Envelope, EnvelopeError> {
        let text = std::str::from_utf8(data).map_err(|_| EnvelopeError::NotUtf8)?;
        let normalised = text.replace("\r\n", "\n");

        let crc_line_start = normalised
            .trim_end_matches('\n')
            .rfind('\n')
            .map(|p| p + 1)
            .unwrap_or(0);
        let computed = crc32(normalised[..crc_line_start].as_bytes());

        let mut fields = Vec::new();
        for (n, line) in normalised.lines().enumerate() {
            if line.is_empty() {
                continue;
            }
            let sep = line.find(": ").ok_or(EnvelopeError::Malformed(n + 1))?;
            fields.push((&line[..sep], &line[sep + 2..]));
        }

        let mut cursor = Cursor { fields: &fields, pos: 0 };

        let version: u32 = cursor.required("X-Spool-Format")?;
        if version != FORMAT_VERSION {
            return Err(EnvelopeError::BadVersion(version));
        }
        let timestamp = cursor.required_with("X-Timestamp", |v| {
            DateTime::parse_from_rfc3339(v)
                .map(|d| d.with_timezone(&Utc))
                .ok()
        })?;
        let from = cursor.required_raw("X-From")?.to_owned();
        let from_auth_in = cursor.optional_raw("X-From-Auth-In").map(str::to_owned);
        let to_local = cursor.repeated("X-To-Local");
        let to_remote = cursor.repeated("X-To-Remote");
        let to_delivered = cursor.repeated("X-To-Delivered");
        let forward_to = cursor.optional_raw("X-Forward-To").map(str::to_owned);
        let selector = cursor.optional_raw("X-Selector").map(str::to_owned);
        let client_socket_address = cursor.required_raw("X-Client-Socket-Address")?.to_owned();
        let client_authenticated = cursor.required_bool("X-Client-Authenticated")?;
        let client_secure = cursor.required_bool("X-Client-Secure")?;
        let client_cipher = cursor.required_raw("X-Client-Cipher")?.to_owned();
        let body = cursor.required_with("X-Body", |v| BodyType::from_str(v).ok())?;
        let content_size: u64 = cursor.required("X-Content-Size")?;
        let retry_count: u32 = cursor.required("X-Retry-Count")?;
        let reason = cursor.required_raw("X-Reason")?.to_owned();
        let stored = cursor.required_with("X-CRC", |v| u32::from_str_radix(v, 16).ok())?;

        if let Some((name, _)) = cursor.peek() {
            return Err(EnvelopeError::UnexpectedField(name.to_owned()));
        }
        if stored != computed {
            return Err(EnvelopeError::CrcMismatch { stored, computed });
        }

        Ok(Envelope {
            timestamp,
            from,
            from_auth_in,
            to_local,
            to_remote,
            to_delivered,
            forward_to,
            selector,
            client_socket_address,
            client_authenticated,
            client_secure,
            client_cipher,
            body,
            content_size,
            retry_count,
            reason,
        })
    }
}

fn crc32(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Walks the header list enforcing the fixed field order.
struct Cursor<'a> {
    fields: &'a [(&'a str, &'a str)],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn peek(&self) -> Option<(&'a str, &'a str)> {
        self.fields.get(self.pos).copied()
    }

    fn required_raw(&mut self, name: &'static str) -> Result<&'a str, EnvelopeError> {
        match self.peek() {
            Some((n, v)) if n == name => {
                self.pos += 1;
                Ok(v)
            }
            Some((n, _)) => Err(EnvelopeError::UnexpectedField(n.to_owned())),
            None => Err(EnvelopeError::MissingField(name)),
        }
    }

    fn optional_raw(&mut self, name: &'static str) -> Option<&'a str> {
        match self.peek() {
            Some((n, v)) if n == name => {
                self.pos += 1;
                Some(v)
            }
            _ => None,
        }
    }

    fn repeated(&mut self, name: &'static str) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(v) = self.optional_raw(name) {
            out.push(v.to_owned());
        }
        out
    }

    fn required<T: FromStr>(&mut self, name: &'static str) -> Result<T, EnvelopeError> {
        self.required_raw(name)?
            .parse()
            .map_err(|_| EnvelopeError::BadValue(name))
    }

    fn required_with<T>(
        &mut self,
        name: &'static str,
        f: impl Fn(&str) -> Option<T>,
    ) -> Result<T, EnvelopeError> {
        f(self.required_raw(name)?).ok_or(EnvelopeError::BadValue(name))
    }

    fn required_bool(&mut self, name: &'static str) -> Result<bool, EnvelopeError> {
        match self.required_raw(name)? {
            "0" => Ok(false),
            "1" => Ok(true),
            _ => Err(EnvelopeError::BadValue(name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Envelope {
        let mut e = Envelope::new("192.0.2.7:4321");
        e.from = "sender@origin.example".into();
        e.from_auth_in = Some("alice".into());
        e.to_local = vec!["postmaster".into()];
        e.to_remote = vec!["x@r1.example".into(), "y@r1.example".into()];
        e.forward_to = Some("smarthost.example:25".into());
        e.selector = Some("upstream-a".into());
        e.client_authenticated = true;
        e.client_cipher = "TLS_AES_128_GCM_SHA256".into();
        e.body = BodyType::EightBitMime;
        e.content_size = 4242;
        e.reason = String::new();
        e
    }

    #[test]
    fn roundtrip_is_byte_identical() {
        let e = sample();
        let bytes = e.to_bytes();
        let parsed = Envelope::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, e);
        assert_eq!(parsed.to_bytes(), bytes);
    }

    #[test]
    fn minimal_roundtrip() {
        let mut e = Envelope::new("127.0.0.1:1");
        e.to_remote = vec!["a@b.c".into()];
        let parsed = Envelope::from_bytes(&e.to_bytes()).unwrap();
        assert_eq!(parsed, e);
    }

    #[test]
    fn corrupted_byte_is_rejected() {
        let mut bytes = sample().to_bytes();
        // Flip one byte of the from address.
        let pos = bytes.windows(6).position(|w| w == b"sender").unwrap();
        bytes[pos] = b'S';
        match Envelope::from_bytes(&bytes) {
            Err(EnvelopeError::CrcMismatch { .. }) => (),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn unknown_field_is_rejected() {
        let mut e = sample();
        e.reason = String::new();
        let text = String::from_utf8(e.to_bytes()).unwrap();
        let bad = text.replace("X-Reason: ", "X-Wormhole: ");
        match Envelope::from_bytes(bad.as_bytes()) {
            Err(EnvelopeError::UnexpectedField(f)) => assert_eq!(f, "X-Wormhole"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn bad_version_is_rejected() {
        let text = String::from_utf8(sample().to_bytes()).unwrap();
        let bad = text.replace("X-Spool-Format: 1", "X-Spool-Format: 9");
        // Version check fires before the CRC check so readers can bail early.
        match Envelope::from_bytes(bad.as_bytes()) {
            Err(EnvelopeError::BadVersion(9)) => (),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn crc_is_lf_normalised() {
        // A CRLF rendition of the same envelope still verifies.
        let bytes = sample().to_bytes();
        let crlf = String::from_utf8(bytes.clone())
            .unwrap()
            .replace('\n', "\r\n");
        let parsed = Envelope::from_bytes(crlf.as_bytes()).unwrap();
        assert_eq!(parsed.to_bytes(), bytes);
    }
}
