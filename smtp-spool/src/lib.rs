//! The on-disk message spool.
//!
//! For MessageId `m` the spool directory holds `m.content` and `m.envelope`;
//! the envelope suffix becomes `.envelope.busy` while a forwarder owns the
//! message and `.envelope.bad` once it has terminally failed. Renaming the
//! envelope is the atomic state transition, and the `.busy` suffix is itself
//! the lock token — no advisory locks anywhere.

use std::{
    io::{Read, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use openat::Dir;
use smol::unblock;
use tracing::{debug, warn};

mod envelope;

pub use envelope::{Envelope, EnvelopeError, FORMAT_VERSION};

pub const ENVELOPE_SUFFIX: &str = ".envelope";
pub const BUSY_SUFFIX: &str = ".envelope.busy";
pub const BAD_SUFFIX: &str = ".envelope.bad";
pub const CONTENT_SUFFIX: &str = ".content";
pub const NEW_SUFFIX: &str = ".new";

#[derive(Debug, thiserror::Error)]
pub enum SpoolError {
    #[error("opening spool directory ‘{0}’")]
    Opening(PathBuf, #[source] std::io::Error),
    #[error("listing spool directory")]
    Listing(#[source] std::io::Error),
    #[error("creating ‘{0}’ in the spool")]
    Creating(String, #[source] std::io::Error),
    #[error("writing ‘{0}’")]
    Writing(String, #[source] std::io::Error),
    #[error("reading ‘{0}’")]
    Reading(String, #[source] std::io::Error),
    #[error("renaming ‘{0}’ to ‘{1}’")]
    Renaming(String, String, #[source] std::io::Error),
    #[error("removing ‘{0}’")]
    Removing(String, #[source] std::io::Error),
    #[error("envelope ‘{0}’ rejected")]
    Envelope(String, #[source] EnvelopeError),
    #[error("message ‘{0}’ vanished from the spool")]
    Vanished(String),
}

/// Spool state of a message, encoded in the envelope filename suffix.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SpoolState {
    New,
    Busy,
    Bad,
}

impl SpoolState {
    fn suffix(self) -> &'static str {
        match self {
            SpoolState::New => ENVELOPE_SUFFIX,
            SpoolState::Busy => BUSY_SUFFIX,
            SpoolState::Bad => BAD_SUFFIX,
        }
    }
}

/// An opaque message identifier, unique within the spool directory for the
/// process lifetime and lexicographically ordered by mint time.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct MessageId(Arc<String>);

impl MessageId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the startup sweep found and did.
#[derive(Debug, Default, Eq, PartialEq)]
pub struct SweepReport {
    /// Stale `.busy` envelopes renamed back to `new`.
    pub unlocked: usize,
    /// Orphan content files removed.
    pub orphans_removed: usize,
    /// Envelopes without content, parked as `.bad`.
    pub corrupt: usize,
}

pub struct Spool {
    dir: Arc<Dir>,
    path: PathBuf,
    prefix: String,
    seq: AtomicU64,
    retry_limit: u32,
}

impl Spool {
    /// Opens (creating if needed) the spool directory.
    pub async fn open(
        path: PathBuf,
        prefix: impl Into<String>,
        retry_limit: u32,
    ) -> Result<Spool, SpoolError> {
        let dir = {
            let path = path.clone();
            unblock(move || {
                std::fs::create_dir_all(&path)
                    .and_then(|()| Dir::open(&path))
                    .map_err(|e| SpoolError::Opening(path.clone(), e))
            })
            .await?
        };
        Ok(Spool {
            dir: Arc::new(dir),
            path,
            prefix: prefix.into(),
            seq: AtomicU64::new(1),
            retry_limit,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn content_path(&self, id: &MessageId) -> PathBuf {
        self.path.join(format!("{}{}", id, CONTENT_SUFFIX))
    }

    pub fn envelope_path(&self, id: &MessageId, state: SpoolState) -> PathBuf {
        self.path.join(format!("{}{}", id, state.suffix()))
    }

    fn mint(&self) -> MessageId {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        MessageId(Arc::new(format!(
            "{}.{}.{}.{:06}",
            self.prefix,
            chrono::Utc::now().timestamp(),
            std::process::id(),
            seq,
        )))
    }

    /// Starts a new message: mints an id and opens `<id>.content.new` for
    /// streaming. Commit order is content first, then the envelope rename.
    pub async fn create(&self) -> Result<SpoolWriter, SpoolError> {
        let id = self.mint();
        let name = format!("{}{}{}", id, CONTENT_SUFFIX, NEW_SUFFIX);
        let file = {
            let dir = self.dir.clone();
            let name2 = name.clone();
            unblock(move || {
                dir.new_file(name2.as_str(), 0o600)
                    .map_err(|e| SpoolError::Creating(name2.clone(), e))
            })
            .await?
        };
        debug!(id = %id, "new spool entry");
        Ok(SpoolWriter {
            dir: self.dir.clone(),
            id,
            file: Some(Arc::new(file)),
            written: 0,
        })
    }

    /// Snapshot enumeration of `new` messages, lexicographic by MessageId.
    /// `.busy` and `.bad` entries are skipped.
    pub async fn list(&self) -> Result<Vec<MessageId>, SpoolError> {
        let dir = self.dir.clone();
        let mut names = unblock(move || {
            let it = dir.list_self().map_err(SpoolError::Listing)?;
            let mut names = Vec::new();
            for entry in it {
                let entry = entry.map_err(SpoolError::Listing)?;
                if let Some(name) = entry.file_name().to_str() {
                    if name.ends_with(ENVELOPE_SUFFIX) {
                        names.push(name[..name.len() - ENVELOPE_SUFFIX.len()].to_owned());
                    }
                }
            }
            Ok::<_, SpoolError>(names)
        })
        .await?;
        names.sort();
        Ok(names.into_iter().map(|n| MessageId(Arc::new(n))).collect())
    }

    /// Takes the `.busy` lock. `Ok(false)` means somebody else got there
    /// first (or the message is gone), which is not an error.
    pub async fn lock(&self, id: &MessageId) -> Result<bool, SpoolError> {
        self.rename_envelope(id, SpoolState::New, SpoolState::Busy, true)
            .await
    }

    /// Releases a locked message back to `new` (transient failure path).
    pub async fn unlock(&self, id: &MessageId) -> Result<(), SpoolError> {
        self.rename_envelope(id, SpoolState::Busy, SpoolState::New, false)
            .await
            .map(|_| ())
    }

    async fn rename_envelope(
        &self,
        id: &MessageId,
        from: SpoolState,
        to: SpoolState,
        missing_ok: bool,
    ) -> Result<bool, SpoolError> {
        let dir = self.dir.clone();
        let old = format!("{}{}", id, from.suffix());
        let new = format!("{}{}", id, to.suffix());
        unblock(move || match dir.local_rename(old.as_str(), new.as_str()) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && missing_ok => Ok(false),
            Err(e) => Err(SpoolError::Renaming(old, new, e)),
        })
        .await
    }

    /// Removes a locked message entirely (successful delivery).
    pub async fn delete(&self, id: &MessageId) -> Result<(), SpoolError> {
        let dir = self.dir.clone();
        let env = format!("{}{}", id, BUSY_SUFFIX);
        let content = format!("{}{}", id, CONTENT_SUFFIX);
        unblock(move || {
            dir.remove_file(env.as_str())
                .map_err(|e| SpoolError::Removing(env.clone(), e))?;
            match dir.remove_file(content.as_str()) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(SpoolError::Removing(content.clone(), e)),
            }
        })
        .await
    }

    pub async fn read_envelope(
        &self,
        id: &MessageId,
        state: SpoolState,
    ) -> Result<Envelope, SpoolError> {
        let dir = self.dir.clone();
        let name = format!("{}{}", id, state.suffix());
        unblock(move || {
            let mut file = dir
                .open_file(name.as_str())
                .map_err(|e| SpoolError::Reading(name.clone(), e))?;
            let mut data = Vec::new();
            file.read_to_end(&mut data)
                .map_err(|e| SpoolError::Reading(name.clone(), e))?;
            Envelope::from_bytes(&data).map_err(|e| SpoolError::Envelope(name.clone(), e))
        })
        .await
    }

    /// Rewrites the envelope of a locked message in place (atomic via a
    /// `.new` temporary and rename).
    pub async fn write_envelope(
        &self,
        id: &MessageId,
        envelope: &Envelope,
    ) -> Result<(), SpoolError> {
        let dir = self.dir.clone();
        let tmp = format!("{}{}{}", id, BUSY_SUFFIX, NEW_SUFFIX);
        let dst = format!("{}{}", id, BUSY_SUFFIX);
        let bytes = envelope.to_bytes();
        unblock(move || {
            let mut file = dir
                .new_file(tmp.as_str(), 0o600)
                .map_err(|e| SpoolError::Creating(tmp.clone(), e))?;
            file.write_all(&bytes)
                .map_err(|e| SpoolError::Writing(tmp.clone(), e))?;
            drop(file);
            dir.local_rename(tmp.as_str(), dst.as_str())
                .map_err(|e| SpoolError::Renaming(tmp.clone(), dst.clone(), e))
        })
        .await
    }

    /// Records a delivery failure on a locked message: bumps the retry
    /// count, stores the reason, then either releases the message back to
    /// `new` or parks it as `.bad` once the retry limit is crossed.
    /// Returns the resulting state.
    pub async fn fail(
        &self,
        id: &MessageId,
        reason: &str,
    ) -> Result<SpoolState, SpoolError> {
        let mut envelope = self.read_envelope(id, SpoolState::Busy).await?;
        envelope.retry_count += 1;
        envelope.reason = reason.to_owned();
        let over_limit = envelope.retry_count >= self.retry_limit;
        self.write_envelope(id, &envelope).await?;
        if over_limit {
            warn!(id = %id, retries = envelope.retry_count, "retry limit reached, parking as bad");
            self.rename_envelope(id, SpoolState::Busy, SpoolState::Bad, false)
                .await?;
            Ok(SpoolState::Bad)
        } else {
            self.unlock(id).await?;
            Ok(SpoolState::New)
        }
    }

    /// Moves a locked message to `.bad` without touching the envelope, for
    /// when the envelope itself cannot be read.
    pub async fn quarantine(&self, id: &MessageId) -> Result<(), SpoolError> {
        self.rename_envelope(id, SpoolState::Busy, SpoolState::Bad, false)
            .await
            .map(|_| ())
    }

    /// Moves a locked message straight to `.bad` (permanent failure).
    pub async fn park_bad(&self, id: &MessageId, reason: &str) -> Result<(), SpoolError> {
        let mut envelope = self.read_envelope(id, SpoolState::Busy).await?;
        envelope.reason = reason.to_owned();
        self.write_envelope(id, &envelope).await?;
        self.rename_envelope(id, SpoolState::Busy, SpoolState::Bad, false)
            .await
            .map(|_| ())
    }

    pub async fn read_content(&self, id: &MessageId) -> Result<Vec<u8>, SpoolError> {
        let dir = self.dir.clone();
        let name = format!("{}{}", id, CONTENT_SUFFIX);
        unblock(move || {
            let mut file = dir
                .open_file(name.as_str())
                .map_err(|e| SpoolError::Reading(name.clone(), e))?;
            let mut data = Vec::new();
            file.read_to_end(&mut data)
                .map_err(|e| SpoolError::Reading(name.clone(), e))?;
            Ok(data)
        })
        .await
    }

    /// Replaces the content of a message with filtered output, atomically.
    pub async fn replace_content(
        &self,
        id: &MessageId,
        data: Vec<u8>,
    ) -> Result<(), SpoolError> {
        let dir = self.dir.clone();
        let tmp = format!("{}{}{}", id, CONTENT_SUFFIX, NEW_SUFFIX);
        let dst = format!("{}{}", id, CONTENT_SUFFIX);
        unblock(move || {
            let mut file = dir
                .new_file(tmp.as_str(), 0o600)
                .map_err(|e| SpoolError::Creating(tmp.clone(), e))?;
            file.write_all(&data)
                .map_err(|e| SpoolError::Writing(tmp.clone(), e))?;
            drop(file);
            dir.local_rename(tmp.as_str(), dst.as_str())
                .map_err(|e| SpoolError::Renaming(tmp.clone(), dst.clone(), e))
        })
        .await
    }

    /// The startup sweep: recovers stale `.busy` envelopes (the owning
    /// process is gone by definition at startup) and garbage-collects
    /// orphans left by a crash between content and envelope commit.
    pub async fn sweep(&self) -> Result<SweepReport, SpoolError> {
        let dir = self.dir.clone();
        unblock(move || {
            let mut report = SweepReport::default();
            let mut names = Vec::new();
            for entry in dir.list_self().map_err(SpoolError::Listing)? {
                let entry = entry.map_err(SpoolError::Listing)?;
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_owned());
                }
            }

            // Stale locks back to new.
            for name in &names {
                if name.ends_with(BUSY_SUFFIX) {
                    let id = &name[..name.len() - BUSY_SUFFIX.len()];
                    let fresh = format!("{}{}", id, ENVELOPE_SUFFIX);
                    dir.local_rename(name.as_str(), fresh.as_str())
                        .map_err(|e| SpoolError::Renaming(name.clone(), fresh.clone(), e))?;
                    warn!(id, "recovered stale busy envelope");
                    report.unlocked += 1;
                }
            }

            let has = |wanted: &str| names.iter().any(|n| n == wanted);

            for name in &names {
                // Half-written temporaries never survive a restart.
                if name.ends_with(NEW_SUFFIX) {
                    dir.remove_file(name.as_str())
                        .map_err(|e| SpoolError::Removing(name.clone(), e))?;
                    report.orphans_removed += 1;
                    continue;
                }
                // Content without an envelope in any state.
                if name.ends_with(CONTENT_SUFFIX) {
                    let id = &name[..name.len() - CONTENT_SUFFIX.len()];
                    if !has(&format!("{}{}", id, ENVELOPE_SUFFIX))
                        && !has(&format!("{}{}", id, BUSY_SUFFIX))
                        && !has(&format!("{}{}", id, BAD_SUFFIX))
                    {
                        dir.remove_file(name.as_str())
                            .map_err(|e| SpoolError::Removing(name.clone(), e))?;
                        warn!(name = name.as_str(), "removed orphan content file");
                        report.orphans_removed += 1;
                    }
                    continue;
                }
                // Envelope without content is corrupt: park it for the admin.
                if name.ends_with(ENVELOPE_SUFFIX) {
                    let id = &name[..name.len() - ENVELOPE_SUFFIX.len()];
                    if !has(&format!("{}{}", id, CONTENT_SUFFIX)) {
                        let bad = format!("{}{}", id, BAD_SUFFIX);
                        dir.local_rename(name.as_str(), bad.as_str())
                            .map_err(|e| SpoolError::Renaming(name.clone(), bad.clone(), e))?;
                        warn!(id, "envelope without content parked as bad");
                        report.corrupt += 1;
                    }
                }
            }
            Ok(report)
        })
        .await
    }
}

/// Streams content for a message under construction, then commits the pair.
pub struct SpoolWriter {
    dir: Arc<Dir>,
    id: MessageId,
    file: Option<Arc<std::fs::File>>,
    written: u64,
}

impl SpoolWriter {
    pub fn id(&self) -> &MessageId {
        &self.id
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub async fn write(&mut self, data: Vec<u8>) -> Result<(), SpoolError> {
        let file = self.file.clone().expect("write after commit or abandon");
        let id = self.id.clone();
        self.written += data.len() as u64;
        unblock(move || {
            (&*file)
                .write_all(&data)
                .map_err(|e| SpoolError::Writing(format!("{}{}", id, CONTENT_SUFFIX), e))
        })
        .await
    }

    /// Seals the content and writes the envelope under its `.new` name.
    /// The message is not yet visible to the forwarder; that happens at
    /// [`PendingMessage::commit`], leaving a window for the input filter to
    /// inspect or rewrite both files.
    pub async fn close(mut self, envelope: &Envelope) -> Result<PendingMessage, SpoolError> {
        let file = self.file.take().expect("close called twice");
        let dir = self.dir.clone();
        let id = self.id.clone();
        let bytes = envelope.to_bytes();
        unblock(move || {
            // Flush the content and give it its final name.
            {
                let file = file;
                (&*file)
                    .sync_all()
                    .map_err(|e| SpoolError::Writing(format!("{}{}", id, CONTENT_SUFFIX), e))?;
            }
            let ctmp = format!("{}{}{}", id, CONTENT_SUFFIX, NEW_SUFFIX);
            let cdst = format!("{}{}", id, CONTENT_SUFFIX);
            dir.local_rename(ctmp.as_str(), cdst.as_str())
                .map_err(|e| SpoolError::Renaming(ctmp.clone(), cdst.clone(), e))?;

            let etmp = format!("{}{}{}", id, ENVELOPE_SUFFIX, NEW_SUFFIX);
            let mut efile = dir
                .new_file(etmp.as_str(), 0o600)
                .map_err(|e| SpoolError::Creating(etmp.clone(), e))?;
            efile
                .write_all(&bytes)
                .map_err(|e| SpoolError::Writing(etmp.clone(), e))?;
            drop(efile);
            Ok(PendingMessage { dir, id })
        })
        .await
    }

    /// Closes and commits in one step, for callers with no filtering stage.
    pub async fn commit(self, envelope: &Envelope) -> Result<MessageId, SpoolError> {
        self.close(envelope).await?.commit().await
    }

    /// Drops the partial files (filter rejection, protocol abort).
    pub async fn abandon(mut self) -> Result<(), SpoolError> {
        self.file.take();
        remove_uncommitted(self.dir.clone(), self.id.clone()).await
    }
}

async fn remove_uncommitted(dir: Arc<Dir>, id: MessageId) -> Result<(), SpoolError> {
    unblock(move || {
        for name in &[
            format!("{}{}{}", id, CONTENT_SUFFIX, NEW_SUFFIX),
            format!("{}{}", id, CONTENT_SUFFIX),
            format!("{}{}{}", id, ENVELOPE_SUFFIX, NEW_SUFFIX),
        ] {
            match dir.remove_file(name.as_str()) {
                Ok(()) => (),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
                Err(e) => return Err(SpoolError::Removing(name.clone(), e)),
            }
        }
        Ok(())
    })
    .await
}

/// A message whose content is sealed but whose envelope has not yet been
/// renamed into place. The input filter runs against this state.
pub struct PendingMessage {
    dir: Arc<Dir>,
    id: MessageId,
}

impl PendingMessage {
    pub fn id(&self) -> &MessageId {
        &self.id
    }

    /// Relative names of the content and envelope files, for filter argv.
    pub fn content_name(&self) -> String {
        format!("{}{}", self.id, CONTENT_SUFFIX)
    }

    pub fn envelope_name(&self) -> String {
        format!("{}{}{}", self.id, ENVELOPE_SUFFIX, NEW_SUFFIX)
    }

    /// Rewrites the not-yet-committed envelope (a filter changed the
    /// content size or recipients).
    pub async fn rewrite_envelope(&self, envelope: &Envelope) -> Result<(), SpoolError> {
        let dir = self.dir.clone();
        let id = self.id.clone();
        let bytes = envelope.to_bytes();
        unblock(move || {
            let name = format!("{}{}{}", id, ENVELOPE_SUFFIX, NEW_SUFFIX);
            let mut file = dir
                .write_file(name.as_str(), 0o600)
                .map_err(|e| SpoolError::Creating(name.clone(), e))?;
            file.write_all(&bytes)
                .map_err(|e| SpoolError::Writing(name.clone(), e))
        })
        .await
    }

    /// The atomic commit: the envelope takes its final name and the message
    /// enters state `new`.
    pub async fn commit(self) -> Result<MessageId, SpoolError> {
        let dir = self.dir.clone();
        let id = self.id.clone();
        unblock(move || {
            let etmp = format!("{}{}{}", id, ENVELOPE_SUFFIX, NEW_SUFFIX);
            let edst = format!("{}{}", id, ENVELOPE_SUFFIX);
            dir.local_rename(etmp.as_str(), edst.as_str())
                .map_err(|e| SpoolError::Renaming(etmp.clone(), edst.clone(), e))?;
            Ok(id)
        })
        .await
    }

    /// Deletes the files instead of committing (filter said abandon or
    /// reject).
    pub async fn abandon(self) -> Result<(), SpoolError> {
        remove_uncommitted(self.dir, self.id).await
    }
}
