//! The secrets file.
//!
//! One credential per line:
//!
//! ```text
//! # mechanism  role    id       secret    [selector]
//! plain        server  alice    sesame
//! plain        client  relay    hunter2   upstream-a
//! ```
//!
//! The `plain` mechanism row also serves LOGIN and CRAM-MD5, which all key
//! off the plaintext secret. Blank lines and `#` comments are ignored.

use std::{collections::HashMap, fs, path::Path};

#[derive(Debug, thiserror::Error)]
pub enum SecretsError {
    #[error("reading secrets file ‘{0}’")]
    Read(String, #[source] std::io::Error),
    #[error("secrets file ‘{0}’ line {1}: expected ‘mechanism role id secret [selector]’")]
    Malformed(String, usize),
    #[error("secrets file ‘{0}’ line {1}: unknown mechanism ‘{2}’")]
    UnknownMechanism(String, usize, String),
    #[error("secrets file ‘{0}’ line {1}: unknown role ‘{2}’")]
    UnknownRole(String, usize, String),
}

/// A client-side account: the identity and plaintext secret used towards an
/// upstream server, keyed by the envelope selector tag.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClientAccount {
    pub id: String,
    pub secret: String,
}

#[derive(Clone, Debug, Default)]
pub struct Secrets {
    server: HashMap<String, String>,
    client: HashMap<String, ClientAccount>,
}

impl Secrets {
    pub fn load(path: &Path) -> Result<Secrets, SecretsError> {
        let name = path.display().to_string();
        let data =
            fs::read_to_string(path).map_err(|e| SecretsError::Read(name.clone(), e))?;
        Secrets::parse(&data, &name)
    }

    pub fn parse(data: &str, name: &str) -> Result<Secrets, SecretsError> {
        let mut secrets = Secrets::default();
        for (n, raw) in data.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields = line.split_whitespace().collect::<Vec<_>>();
            if fields.len() < 4 || fields.len() > 5 {
                return Err(SecretsError::Malformed(name.to_owned(), n + 1));
            }
            if !fields[0].eq_ignore_ascii_case("plain") {
                return Err(SecretsError::UnknownMechanism(
                    name.to_owned(),
                    n + 1,
                    fields[0].to_owned(),
                ));
            }
            match fields[1].to_ascii_lowercase().as_str() {
                "server" => {
                    secrets
                        .server
                        .insert(fields[2].to_owned(), fields[3].to_owned());
                }
                "client" => {
                    let selector = fields.get(4).copied().unwrap_or("").to_owned();
                    secrets.client.insert(
                        selector,
                        ClientAccount {
                            id: fields[2].to_owned(),
                            secret: fields[3].to_owned(),
                        },
                    );
                }
                other => {
                    return Err(SecretsError::UnknownRole(
                        name.to_owned(),
                        n + 1,
                        other.to_owned(),
                    ))
                }
            }
        }
        Ok(secrets)
    }

    pub fn server_secret(&self, id: &str) -> Option<&str> {
        self.server.get(id).map(|s| s.as_str())
    }

    /// The client account for the given selector tag, falling back to the
    /// untagged account.
    pub fn client_account(&self, selector: &str) -> Option<&ClientAccount> {
        self.client
            .get(selector)
            .or_else(|| self.client.get(""))
    }

    pub fn has_server_secrets(&self) -> bool {
        !self.server.is_empty()
    }

    pub fn has_client_accounts(&self) -> bool {
        !self.client.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILE: &str = "\
# test secrets
plain server alice sesame
plain server bob   letmein

plain client relay hunter2
plain client other swordfish upstream-b
";

    #[test]
    fn parses_and_looks_up() {
        let s = Secrets::parse(FILE, "test").unwrap();
        assert_eq!(s.server_secret("alice"), Some("sesame"));
        assert_eq!(s.server_secret("bob"), Some("letmein"));
        assert_eq!(s.server_secret("mallory"), None);
        assert_eq!(
            s.client_account("").unwrap(),
            &ClientAccount { id: "relay".into(), secret: "hunter2".into() }
        );
        assert_eq!(s.client_account("upstream-b").unwrap().id, "other");
        // Unknown selectors fall back to the untagged account.
        assert_eq!(s.client_account("nope").unwrap().id, "relay");
    }

    #[test]
    fn rejects_malformed() {
        assert!(Secrets::parse("plain server alice", "t").is_err());
        assert!(Secrets::parse("scram-sha-1 server a b", "t").is_err());
        assert!(Secrets::parse("plain sideways a b", "t").is_err());
    }
}
