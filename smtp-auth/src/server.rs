//! Server-side SASL: challenge/response state machines for the AUTH command.

use rand::Rng;

use crate::{b64_decode, b64_encode, cram_md5_digest, Secrets, MECHANISMS};

/// What the protocol engine should do next.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ServerStep {
    /// Send `334 <challenge>` and feed the next client line back in.
    Challenge(String),
    /// Authentication succeeded for this identity; send `235`.
    Success { id: String },
    /// Authentication failed; send `535`.
    Failure,
}

pub struct ServerAuth {
    secrets: Secrets,
    challenge_hostname: String,
}

enum MechState {
    Plain,
    LoginWantUser,
    LoginWantPass { id: String },
    CramMd5 { challenge: String },
    Rejected,
}

pub struct ServerSession {
    state: MechState,
    secrets: Secrets,
}

impl ServerAuth {
    pub fn new(secrets: Secrets, challenge_hostname: impl Into<String>) -> ServerAuth {
        ServerAuth {
            secrets,
            challenge_hostname: challenge_hostname.into(),
        }
    }

    /// The mechanisms to advertise in the EHLO response.
    pub fn mechanisms(&self) -> Vec<&'static str> {
        MECHANISMS.to_vec()
    }

    pub fn supports(&self, mechanism: &str) -> bool {
        MECHANISMS.iter().any(|m| m.eq_ignore_ascii_case(mechanism))
    }

    /// Starts an authentication exchange. Returns the session and the first
    /// step; `initial` is the optional initial-response argument of AUTH.
    pub fn start(&self, mechanism: &str, initial: Option<&str>) -> (ServerSession, ServerStep) {
        let mechanism = mechanism.to_ascii_uppercase();
        let mut session = ServerSession {
            state: MechState::Rejected,
            secrets: self.secrets.clone(),
        };
        let step = match mechanism.as_str() {
            "PLAIN" => {
                session.state = MechState::Plain;
                match initial {
                    Some(arg) => session.apply(arg),
                    None => ServerStep::Challenge(String::new()),
                }
            }
            "LOGIN" => {
                if initial.is_some() {
                    // LOGIN has no initial response.
                    ServerStep::Failure
                } else {
                    session.state = MechState::LoginWantUser;
                    ServerStep::Challenge(b64_encode(b"Username:"))
                }
            }
            "CRAM-MD5" => {
                if initial.is_some() {
                    ServerStep::Failure
                } else {
                    let challenge = format!(
                        "<{}.{}@{}>",
                        rand::thread_rng().gen::<u32>(),
                        std::process::id(),
                        self.challenge_hostname,
                    );
                    let encoded = b64_encode(challenge.as_bytes());
                    session.state = MechState::CramMd5 { challenge };
                    ServerStep::Challenge(encoded)
                }
            }
            _ => ServerStep::Failure,
        };
        (session, step)
    }
}

impl ServerSession {
    /// Applies one client continuation line (base64, already stripped of the
    /// terminator). A lone `*` cancel is handled by the protocol engine, not
    /// here.
    pub fn apply(&mut self, line: &str) -> ServerStep {
        match std::mem::replace(&mut self.state, MechState::Rejected) {
            MechState::Plain => {
                let decoded = match b64_decode(line) {
                    Some(d) => d,
                    None => return ServerStep::Failure,
                };
                // authzid NUL authcid NUL passwd
                let parts = decoded.split(|&b| b == 0).collect::<Vec<_>>();
                if parts.len() != 3 {
                    return ServerStep::Failure;
                }
                let id = match std::str::from_utf8(parts[1]) {
                    Ok(s) => s.to_owned(),
                    Err(_) => return ServerStep::Failure,
                };
                let pass = match std::str::from_utf8(parts[2]) {
                    Ok(s) => s,
                    Err(_) => return ServerStep::Failure,
                };
                self.check_plain(&id, pass)
            }
            MechState::LoginWantUser => {
                let id = match b64_decode(line).and_then(|d| String::from_utf8(d).ok()) {
                    Some(s) => s,
                    None => return ServerStep::Failure,
                };
                self.state = MechState::LoginWantPass { id };
                ServerStep::Challenge(b64_encode(b"Password:"))
            }
            MechState::LoginWantPass { id } => {
                let pass = match b64_decode(line).and_then(|d| String::from_utf8(d).ok()) {
                    Some(s) => s,
                    None => return ServerStep::Failure,
                };
                self.check_plain(&id, &pass)
            }
            MechState::CramMd5 { challenge } => {
                let decoded = match b64_decode(line).and_then(|d| String::from_utf8(d).ok()) {
                    Some(s) => s,
                    None => return ServerStep::Failure,
                };
                // "<id> <hex-digest>"
                let mut it = decoded.rsplitn(2, ' ');
                let digest = it.next().unwrap_or("");
                let id = match it.next() {
                    Some(s) => s.to_owned(),
                    None => return ServerStep::Failure,
                };
                match self.secrets.server_secret(&id) {
                    Some(secret)
                        if cram_md5_digest(secret.as_bytes(), challenge.as_bytes())
                            == digest.to_ascii_lowercase() =>
                    {
                        ServerStep::Success { id }
                    }
                    _ => ServerStep::Failure,
                }
            }
            MechState::Rejected => ServerStep::Failure,
        }
    }

    fn check_plain(&self, id: &str, pass: &str) -> ServerStep {
        match self.secrets.server_secret(id) {
            Some(secret) if secret == pass => ServerStep::Success { id: id.to_owned() },
            _ => ServerStep::Failure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth() -> ServerAuth {
        let secrets = Secrets::parse("plain server alice sesame", "test").unwrap();
        ServerAuth::new(secrets, "mx.example.org")
    }

    #[test]
    fn plain_with_initial_response() {
        let (_, step) = auth().start("PLAIN", Some(&b64_encode(b"\0alice\0sesame")));
        assert_eq!(step, ServerStep::Success { id: "alice".into() });
    }

    #[test]
    fn plain_in_two_steps() {
        let (mut s, step) = auth().start("plain", None);
        assert_eq!(step, ServerStep::Challenge(String::new()));
        assert_eq!(
            s.apply(&b64_encode(b"\0alice\0sesame")),
            ServerStep::Success { id: "alice".into() }
        );
    }

    #[test]
    fn plain_wrong_password() {
        let (_, step) = auth().start("PLAIN", Some(&b64_encode(b"\0alice\0wrong")));
        assert_eq!(step, ServerStep::Failure);
    }

    #[test]
    fn login_exchange() {
        let (mut s, step) = auth().start("LOGIN", None);
        assert_eq!(step, ServerStep::Challenge(b64_encode(b"Username:")));
        assert_eq!(
            s.apply(&b64_encode(b"alice")),
            ServerStep::Challenge(b64_encode(b"Password:"))
        );
        assert_eq!(
            s.apply(&b64_encode(b"sesame")),
            ServerStep::Success { id: "alice".into() }
        );
    }

    #[test]
    fn cram_md5_exchange() {
        let (mut s, step) = auth().start("CRAM-MD5", None);
        let challenge = match step {
            ServerStep::Challenge(c) => String::from_utf8(b64_decode(&c).unwrap()).unwrap(),
            other => panic!("unexpected: {:?}", other),
        };
        assert!(challenge.starts_with('<') && challenge.ends_with('>'));
        let digest = cram_md5_digest(b"sesame", challenge.as_bytes());
        let response = b64_encode(format!("alice {}", digest).as_bytes());
        assert_eq!(s.apply(&response), ServerStep::Success { id: "alice".into() });
    }

    #[test]
    fn unknown_mechanism_fails() {
        let (_, step) = auth().start("SCRAM-SHA-256", None);
        assert_eq!(step, ServerStep::Failure);
    }
}
