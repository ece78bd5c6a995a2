//! Filter callouts: inspect (and possibly rewrite) a spooled message before
//! it is accepted or forwarded.
//!
//! Specifier grammar: `exit:<N>`, `file:<path>`, `net:<host>:<port>`,
//! `spam:<host>:<port>`, `spam-edit:<host>:<port>`, or a comma-separated
//! chain of those. A bare path means `file:`.

use std::path::{Path, PathBuf};

use smol::{net::TcpStream, unblock};
use tracing::{debug, warn};

use futures::io::{AsyncReadExt, AsyncWriteExt};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FilterSpec {
    Exit(u32),
    File(PathBuf),
    Net(String),
    Spam { addr: String, edit: bool },
    Chain(Vec<FilterSpec>),
}

impl FilterSpec {
    pub fn parse(spec: &str) -> anyhow::Result<FilterSpec> {
        FilterSpec::parse_inner(spec, true)
    }

    fn parse_inner(spec: &str, allow_chain: bool) -> anyhow::Result<FilterSpec> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Ok(FilterSpec::Exit(0));
        }
        if allow_chain && spec.contains(',') {
            let parts = spec
                .split(',')
                .map(|p| FilterSpec::parse_inner(p, false))
                .collect::<anyhow::Result<Vec<_>>>()?;
            return Ok(FilterSpec::Chain(parts));
        }
        if let Some(rest) = spec.strip_prefix("exit:") {
            let code = rest
                .parse::<u32>()
                .map_err(|_| anyhow::anyhow!("exit: wants a numeric code, got {:?}", rest))?;
            return Ok(FilterSpec::Exit(code));
        }
        if let Some(rest) = spec.strip_prefix("net:") {
            return Ok(FilterSpec::Net(rest.to_owned()));
        }
        if let Some(rest) = spec.strip_prefix("spam:") {
            return Ok(FilterSpec::Spam { addr: rest.to_owned(), edit: false });
        }
        if let Some(rest) = spec.strip_prefix("spam-edit:") {
            return Ok(FilterSpec::Spam { addr: rest.to_owned(), edit: true });
        }
        let path = spec.strip_prefix("file:").unwrap_or(spec);
        Ok(FilterSpec::File(PathBuf::from(path)))
    }
}

/// Startup validation: `file:` callouts must point at an existing path.
/// Misconfigured filters are fatal before any mail is accepted.
pub fn checked(spec: FilterSpec) -> anyhow::Result<FilterSpec> {
    check(&spec)?;
    Ok(spec)
}

fn check(spec: &FilterSpec) -> anyhow::Result<()> {
    match spec {
        FilterSpec::File(path) => {
            anyhow::ensure!(
                path.exists(),
                "filter executable ‘{}’ does not exist",
                path.display()
            );
            Ok(())
        }
        FilterSpec::Chain(parts) => parts.iter().try_for_each(check),
        _ => Ok(()),
    }
}

/// The four-way filter result, plus the response/reason strings.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FilterVerdict {
    Ok,
    /// Accept on the wire but quietly drop the message.
    Abandon,
    Retry { text: String },
    Reject { code: u16, text: String },
}

impl FilterVerdict {
    fn from_code(code: u32, text: String) -> FilterVerdict {
        match code {
            0 => FilterVerdict::Ok,
            100 => FilterVerdict::Abandon,
            400..=499 => FilterVerdict::Retry {
                text: or_default(text, "filter asked for retry"),
            },
            500..=599 => FilterVerdict::Reject {
                code: code as u16,
                text: or_default(text, "rejected by filter"),
            },
            _ => FilterVerdict::Reject {
                code: 550,
                text: or_default(text, "rejected by filter"),
            },
        }
    }
}

fn or_default(text: String, default: &str) -> String {
    if text.trim().is_empty() {
        default.to_owned()
    } else {
        text.trim().to_owned()
    }
}

/// Output of one filter run: the verdict, and replacement content when a
/// `spam-edit:` callout rewrote the message.
pub struct FilterOutput {
    pub verdict: FilterVerdict,
    pub rewritten_content: Option<Vec<u8>>,
}

impl FilterOutput {
    fn ok() -> FilterOutput {
        FilterOutput { verdict: FilterVerdict::Ok, rewritten_content: None }
    }

    fn of(verdict: FilterVerdict) -> FilterOutput {
        FilterOutput { verdict, rewritten_content: None }
    }
}

/// Runs a filter against the message identified by `id`, whose content and
/// envelope live at the given paths.
pub async fn run_filter(
    spec: &FilterSpec,
    id: &str,
    content_path: &Path,
    envelope_path: &Path,
) -> FilterOutput {
    match spec {
        FilterSpec::Exit(code) => FilterOutput::of(FilterVerdict::from_code(*code, String::new())),

        FilterSpec::File(exe) => run_file(exe, content_path, envelope_path).await,

        FilterSpec::Net(addr) => run_net(addr, id).await,

        FilterSpec::Spam { addr, edit } => run_spam(addr, *edit, content_path).await,

        FilterSpec::Chain(parts) => {
            let mut rewritten = None;
            for part in parts {
                let out = Box::pin(run_filter(part, id, content_path, envelope_path)).await;
                if out.rewritten_content.is_some() {
                    rewritten = out.rewritten_content;
                }
                if out.verdict != FilterVerdict::Ok {
                    return FilterOutput { verdict: out.verdict, rewritten_content: rewritten };
                }
            }
            FilterOutput { verdict: FilterVerdict::Ok, rewritten_content: rewritten }
        }
    }
}

/// `file:` — run the executable with the content and envelope paths as
/// arguments; the exit code carries the verdict and the first line of
/// stdout the response text.
async fn run_file(exe: &Path, content_path: &Path, envelope_path: &Path) -> FilterOutput {
    let exe = exe.to_owned();
    let content = content_path.to_owned();
    let envelope = envelope_path.to_owned();
    let output = unblock(move || {
        std::process::Command::new(&exe)
            .arg(&content)
            .arg(&envelope)
            .output()
    })
    .await;
    match output {
        Ok(output) => {
            let code = output.status.code().unwrap_or(-1);
            let text = String::from_utf8_lossy(&output.stdout)
                .lines()
                .next()
                .unwrap_or("")
                .to_owned();
            debug!(code, text = text.as_str(), "file filter finished");
            if code < 0 {
                return FilterOutput::of(FilterVerdict::Reject {
                    code: 550,
                    text: "filter terminated abnormally".to_owned(),
                });
            }
            FilterOutput::of(FilterVerdict::from_code(code as u32, text))
        }
        Err(e) => {
            warn!(error = %e, "spawning filter failed");
            FilterOutput::of(FilterVerdict::Retry {
                text: "filter unavailable".to_owned(),
            })
        }
    }
}

/// `net:` — one request line with the message id, one response line with a
/// code and text.
async fn run_net(addr: &str, id: &str) -> FilterOutput {
    match net_exchange(addr, id).await {
        Ok((code, text)) => FilterOutput::of(FilterVerdict::from_code(code, text)),
        Err(e) => {
            warn!(error = %e, addr, "network filter failed");
            FilterOutput::of(FilterVerdict::Retry {
                text: "filter unavailable".to_owned(),
            })
        }
    }
}

async fn net_exchange(addr: &str, id: &str) -> std::io::Result<(u32, String)> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(format!("{}\n", id).as_bytes()).await?;
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
    let line = String::from_utf8_lossy(&response);
    let line = line.lines().next().unwrap_or("");
    let mut it = line.splitn(2, ' ');
    let code = it
        .next()
        .and_then(|w| w.parse::<u32>().ok())
        .ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "unparseable filter response")
        })?;
    Ok((code, it.next().unwrap_or("").to_owned()))
}

/// `spam:` / `spam-edit:` — SPAMC 1.5 CHECK or PROCESS. The verdict comes
/// from the `Spam:` response header; PROCESS additionally returns the
/// rewritten message after the blank line.
async fn run_spam(addr: &str, edit: bool, content_path: &Path) -> FilterOutput {
    let content = {
        let path = content_path.to_owned();
        match unblock(move || std::fs::read(&path)).await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "reading content for spam check failed");
                return FilterOutput::of(FilterVerdict::Retry {
                    text: "spool read failure".to_owned(),
                });
            }
        }
    };
    match spam_exchange(addr, edit, &content).await {
        Ok((spammy, rewritten)) => {
            if spammy {
                FilterOutput::of(FilterVerdict::Reject {
                    code: 550,
                    text: "message classified as spam".to_owned(),
                })
            } else {
                FilterOutput {
                    verdict: FilterVerdict::Ok,
                    rewritten_content: rewritten,
                }
            }
        }
        Err(e) => {
            warn!(error = %e, addr, "spam filter failed");
            FilterOutput::of(FilterVerdict::Retry {
                text: "spam filter unavailable".to_owned(),
            })
        }
    }
}

async fn spam_exchange(
    addr: &str,
    edit: bool,
    content: &[u8],
) -> std::io::Result<(bool, Option<Vec<u8>>)> {
    let mut stream = TcpStream::connect(addr).await?;
    let verb = if edit { "PROCESS" } else { "CHECK" };
    let header = format!(
        "{} SPAMC/1.5\r\nContent-length: {}\r\n\r\n",
        verb,
        content.len()
    );
    stream.write_all(header.as_bytes()).await?;
    stream.write_all(content).await?;
    stream.close().await?;

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await?;

    let header_end = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| p + 4)
        .unwrap_or(response.len());
    let headers = String::from_utf8_lossy(&response[..header_end]).to_string();
    let spammy = headers
        .lines()
        .any(|l| l.to_ascii_lowercase().starts_with("spam:") && l.to_ascii_lowercase().contains("true"));
    let rewritten = if edit && header_end < response.len() {
        Some(response[header_end..].to_vec())
    } else {
        None
    };
    Ok((spammy, rewritten))
}
