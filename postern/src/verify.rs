//! Recipient verification callouts.
//!
//! The built-in verifier classifies recipients against the configured list
//! of local domains. `file:` and `net:` callouts answer with one line:
//!
//! ```text
//! LOCAL <mailbox>
//! REMOTE [rewritten-address [forward-to]]
//! REJECT <code> <text>
//! BLACKHOLE
//! ```

use std::path::PathBuf;

use smol::{net::TcpStream, unblock};
use tracing::warn;

use futures::io::{AsyncReadExt, AsyncWriteExt};

use smtp_message::{Email, Reply, ReplyCode};
use smtp_server::VerifyOutcome;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum VerifierSpec {
    /// Classify by the local domain list.
    Builtin,
    File(PathBuf),
    Net(String),
}

impl VerifierSpec {
    pub fn parse(spec: &str) -> anyhow::Result<VerifierSpec> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Ok(VerifierSpec::Builtin);
        }
        if let Some(rest) = spec.strip_prefix("net:") {
            return Ok(VerifierSpec::Net(rest.to_owned()));
        }
        let path = spec.strip_prefix("file:").unwrap_or(spec);
        Ok(VerifierSpec::File(PathBuf::from(path)))
    }
}

pub struct Verifier {
    spec: VerifierSpec,
    local_domains: Vec<String>,
}

impl Verifier {
    pub fn new(spec: VerifierSpec, local_domains: Vec<String>) -> Verifier {
        Verifier {
            spec,
            local_domains,
        }
    }

    pub async fn verify(&self, rcpt: &Email, from: &str, peer: &str) -> VerifyOutcome {
        match &self.spec {
            VerifierSpec::Builtin => self.builtin(rcpt),
            VerifierSpec::File(exe) => {
                let exe = exe.clone();
                let args = vec![rcpt.to_string(), from.to_owned(), peer.to_owned()];
                let output =
                    unblock(move || std::process::Command::new(&exe).args(&args).output()).await;
                match output {
                    Ok(out) if out.status.success() => {
                        let line = String::from_utf8_lossy(&out.stdout);
                        parse_response(line.lines().next().unwrap_or(""), rcpt)
                    }
                    Ok(_) | Err(_) => transient_refusal(),
                }
            }
            VerifierSpec::Net(addr) => match self.net(addr, rcpt, from).await {
                Ok(line) => parse_response(&line, rcpt),
                Err(e) => {
                    warn!(error = %e, addr = addr.as_str(), "verifier callout failed");
                    transient_refusal()
                }
            },
        }
    }

    fn builtin(&self, rcpt: &Email) -> VerifyOutcome {
        let domain = rcpt.hostname.as_ref().map(|h| h.to_ascii());
        let is_local = match domain {
            // A bare localpart (e.g. `postmaster`) is ours by definition.
            None => true,
            Some(d) => self
                .local_domains
                .iter()
                .any(|l| l.eq_ignore_ascii_case(d)),
        };
        if is_local {
            VerifyOutcome::Local {
                mailbox: rcpt.localpart.unquote(),
            }
        } else {
            VerifyOutcome::Remote {
                address: rcpt.clone(),
                forward_to: None,
            }
        }
    }

    async fn net(&self, addr: &str, rcpt: &Email, from: &str) -> std::io::Result<String> {
        let mut stream = TcpStream::connect(addr).await?;
        stream
            .write_all(format!("{} {}\n", rcpt, from).as_bytes())
            .await?;
        let mut response = Vec::new();
        let mut buf = [0u8; 512];
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            response.extend_from_slice(&buf[..n]);
            if response.contains(&b'\n') {
                break;
            }
        }
        Ok(String::from_utf8_lossy(&response)
            .lines()
            .next()
            .unwrap_or("")
            .to_owned())
    }
}

fn transient_refusal() -> VerifyOutcome {
    VerifyOutcome::Rejected {
        reply: Reply::new(ReplyCode::LOCAL_ERROR, "cannot verify recipient now"),
    }
}

fn parse_response(line: &str, rcpt: &Email) -> VerifyOutcome {
    let mut words = line.split_whitespace();
    match words.next().map(|w| w.to_ascii_uppercase()).as_deref() {
        Some("LOCAL") => {
            let mailbox = words
                .next()
                .map(str::to_owned)
                .unwrap_or_else(|| rcpt.localpart.unquote());
            VerifyOutcome::Local { mailbox }
        }
        Some("REMOTE") => {
            let address = match words.next() {
                Some(a) => match Email::parse_complete(a) {
                    Some(e) => e,
                    None => return transient_refusal(),
                },
                None => rcpt.clone(),
            };
            VerifyOutcome::Remote {
                address,
                forward_to: words.next().map(str::to_owned),
            }
        }
        Some("BLACKHOLE") => VerifyOutcome::Blackhole,
        Some("REJECT") => {
            let code = words
                .next()
                .and_then(|w| w.parse::<u16>().ok())
                .filter(|c| (500..600).contains(c))
                .unwrap_or(550);
            let text = words.collect::<Vec<_>>().join(" ");
            VerifyOutcome::Rejected {
                reply: Reply::new(
                    ReplyCode::custom(code),
                    if text.is_empty() {
                        "recipient refused".to_owned()
                    } else {
                        text
                    },
                ),
            }
        }
        _ => transient_refusal(),
    }
}
