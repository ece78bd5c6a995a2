//! Local delivery: fan a spooled message out into per-mailbox directories,
//! either plain or Maildir.

use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use smol::unblock;
use tracing::debug;

use smtp_spool::Envelope;

pub struct Deliverer {
    base: PathBuf,
    maildir: bool,
    seq: AtomicU64,
}

impl Deliverer {
    pub fn new(base: PathBuf, maildir: bool) -> Deliverer {
        Deliverer {
            base,
            maildir,
            seq: AtomicU64::new(1),
        }
    }

    fn unique_name(&self) -> String {
        format!(
            "{}.{}.{}",
            chrono::Utc::now().timestamp(),
            std::process::id(),
            self.seq.fetch_add(1, Ordering::Relaxed),
        )
    }

    /// Delivers one copy of the content into `mailbox`. Partially-written
    /// files never appear under their final name; a hard link is tried
    /// first and silently degrades to a copy across filesystems.
    pub async fn deliver(
        &self,
        mailbox: &str,
        content_path: &Path,
        envelope: &Envelope,
        id: &str,
    ) -> std::io::Result<()> {
        let mailbox_dir = self.base.join(sanitize(mailbox));
        let unique = self.unique_name();
        let content_path = content_path.to_owned();
        let maildir = self.maildir;
        let envelope_bytes = envelope.to_bytes();
        let id = id.to_owned();

        debug!(mailbox, id = id.as_str(), "delivering locally");
        unblock(move || {
            if maildir {
                for sub in &["tmp", "new", "cur"] {
                    std::fs::create_dir_all(mailbox_dir.join(sub))?;
                }
                let tmp = mailbox_dir.join("tmp").join(&unique);
                link_or_copy(&content_path, &tmp)?;
                std::fs::rename(&tmp, mailbox_dir.join("new").join(&unique))?;
            } else {
                std::fs::create_dir_all(&mailbox_dir)?;
                let ctmp = mailbox_dir.join(format!("{}.content.new", id));
                link_or_copy(&content_path, &ctmp)?;
                std::fs::rename(&ctmp, mailbox_dir.join(format!("{}.content", id)))?;
                let etmp = mailbox_dir.join(format!("{}.envelope.new", id));
                std::fs::write(&etmp, &envelope_bytes)?;
                std::fs::rename(&etmp, mailbox_dir.join(format!("{}.envelope", id)))?;
            }
            Ok(())
        })
        .await
    }
}

/// Mailbox names come from the verifier; keep them inside the base dir.
fn sanitize(mailbox: &str) -> String {
    let cleaned = mailbox
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' || c == '+' {
                c
            } else {
                '_'
            }
        })
        .collect::<String>();
    let trimmed = cleaned.trim_matches('.').to_owned();
    if trimmed.is_empty() {
        "_".to_owned()
    } else {
        trimmed
    }
}

fn link_or_copy(src: &Path, dst: &Path) -> std::io::Result<()> {
    match std::fs::hard_link(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => std::fs::copy(src, dst).map(|_| ()),
    }
}
