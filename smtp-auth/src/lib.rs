//! SASL authentication for the SMTP server and client sides, plus the
//! secrets file both read their credentials from.
//!
//! The provider bundles PLAIN, LOGIN and CRAM-MD5. SCRAM mechanisms would
//! slot into the same registry but are not supplied here.

mod client;
mod secrets;
mod server;

pub use client::{ClientAuth, ClientSession};
pub use secrets::{ClientAccount, Secrets, SecretsError};
pub use server::{ServerAuth, ServerSession, ServerStep};

/// Mechanisms bundled with this provider, in server advertisement order.
pub const MECHANISMS: &[&str] = &["CRAM-MD5", "PLAIN", "LOGIN"];

/// Client-side preference, strongest first.
pub const CLIENT_PREFERENCE: &[&str] = &["CRAM-MD5", "PLAIN", "LOGIN"];

pub(crate) fn b64_encode(data: &[u8]) -> String {
    base64::encode(data)
}

/// Decodes a base64 SASL argument; the single `=` token stands for an empty
/// initial response.
pub(crate) fn b64_decode(data: &str) -> Option<Vec<u8>> {
    if data == "=" {
        return Some(Vec::new());
    }
    base64::decode(data.trim()).ok()
}

pub(crate) fn cram_md5_digest(secret: &[u8], challenge: &[u8]) -> String {
    use hmac::{Hmac, Mac};
    use md5::Md5;

    let mut mac = <Hmac<Md5> as Mac>::new_from_slice(secret)
        .expect("hmac accepts any key length");
    mac.update(challenge);
    let digest = mac.finalize().into_bytes();
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        out.push_str(&format!("{:02x}", b));
    }
    out
}
