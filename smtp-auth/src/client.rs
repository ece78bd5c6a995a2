//! Client-side SASL: mechanism selection against the server's advertised
//! list and response generation.

use crate::{b64_decode, b64_encode, cram_md5_digest, ClientAccount, CLIENT_PREFERENCE};

pub struct ClientAuth {
    account: ClientAccount,
}

/// One in-flight authentication exchange.
pub struct ClientSession {
    mechanism: &'static str,
    account: ClientAccount,
    login_sent_user: bool,
}

impl ClientAuth {
    pub fn new(account: ClientAccount) -> ClientAuth {
        ClientAuth { account }
    }

    /// Picks the best mutually supported mechanism, by our preference order.
    pub fn select(&self, offered: &[String]) -> Option<&'static str> {
        CLIENT_PREFERENCE
            .iter()
            .find(|pref| offered.iter().any(|o| o.eq_ignore_ascii_case(pref)))
            .copied()
    }

    /// Starts an exchange. Returns the session and the optional
    /// initial-response argument for the AUTH command.
    pub fn start(&self, mechanism: &'static str) -> (ClientSession, Option<String>) {
        let session = ClientSession {
            mechanism,
            account: self.account.clone(),
            login_sent_user: false,
        };
        let initial = match mechanism {
            "PLAIN" => {
                let mut raw = Vec::new();
                raw.push(0);
                raw.extend_from_slice(session.account.id.as_bytes());
                raw.push(0);
                raw.extend_from_slice(session.account.secret.as_bytes());
                Some(b64_encode(&raw))
            }
            _ => None,
        };
        (session, initial)
    }
}

impl ClientSession {
    /// Answers a `334` challenge. `None` means the exchange cannot proceed
    /// and should be cancelled with `*`.
    pub fn respond(&mut self, challenge_b64: &str) -> Option<String> {
        match self.mechanism {
            "PLAIN" => {
                // Everything went in the initial response; an empty
                // continuation satisfies servers that challenge anyway.
                let mut raw = Vec::new();
                raw.push(0);
                raw.extend_from_slice(self.account.id.as_bytes());
                raw.push(0);
                raw.extend_from_slice(self.account.secret.as_bytes());
                Some(b64_encode(&raw))
            }
            "LOGIN" => {
                if !self.login_sent_user {
                    self.login_sent_user = true;
                    Some(b64_encode(self.account.id.as_bytes()))
                } else {
                    Some(b64_encode(self.account.secret.as_bytes()))
                }
            }
            "CRAM-MD5" => {
                let challenge = b64_decode(challenge_b64)?;
                let digest = cram_md5_digest(self.account.secret.as_bytes(), &challenge);
                Some(b64_encode(
                    format!("{} {}", self.account.id, digest).as_bytes(),
                ))
            }
            _ => None,
        }
    }
}
