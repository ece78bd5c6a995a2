//! The forwarder: drains the spool by fanning `to_local` recipients into
//! mailboxes and driving one client session per upstream destination for
//! the `to_remote` ones.

use std::{collections::HashSet, sync::Arc, time::Duration};

use smol::channel::{Receiver, TryRecvError};
use tracing::{debug, info, warn};

use smtp_client::{
    Client, Config as ClientConfig, Destination, Sender, TransportErrorSeverity,
};
use smtp_message::{Email, ReversePath};
use smtp_spool::{
    MessageId, Spool, SpoolError, SpoolState, BUSY_SUFFIX, CONTENT_SUFFIX,
};

use crate::deliver::Deliverer;
use crate::filter::{run_filter, FilterSpec, FilterVerdict};

pub struct Forwarder<C: ClientConfig> {
    pub spool: Arc<Spool>,
    pub client: Client<C>,
    pub default_route: Option<String>,
    pub client_filter: FilterSpec,
    pub deliverer: Option<Deliverer>,
}

impl<C: ClientConfig> Forwarder<C> {
    /// Drives forwarding passes until shutdown: on a fixed poll interval,
    /// on wake events (forward-on-disconnect), or both. Wake posts are
    /// coalesced so a burst of disconnects runs a single pass.
    pub async fn run(&self, poll: Option<u64>, wake: Receiver<()>) {
        let mut wake_open = true;
        loop {
            let fire = match (poll, wake_open) {
                (Some(secs), true) => {
                    enum Woke {
                        Event,
                        Timer,
                        Closed,
                    }
                    let on_event = async {
                        match wake.recv().await {
                            Ok(()) => Woke::Event,
                            Err(_) => Woke::Closed,
                        }
                    };
                    let on_timer = async {
                        smol::Timer::after(Duration::from_secs(secs)).await;
                        Woke::Timer
                    };
                    match smol::future::or(on_event, on_timer).await {
                        Woke::Closed => {
                            wake_open = false;
                            false
                        }
                        _ => true,
                    }
                }
                (Some(secs), false) => {
                    smol::Timer::after(Duration::from_secs(secs)).await;
                    true
                }
                (None, true) => match wake.recv().await {
                    Ok(()) => true,
                    Err(_) => return,
                },
                (None, false) => return,
            };
            if !fire {
                continue;
            }
            while wake_open {
                match wake.try_recv() {
                    Ok(()) => (),
                    Err(TryRecvError::Closed) => {
                        wake_open = false;
                    }
                    Err(TryRecvError::Empty) => break,
                }
            }
            if let Err(e) = self.pass().await {
                warn!(error = %e, "forwarding pass failed");
            }
        }
    }

    /// One pass over the spool: lock, filter, deliver, transmit, settle.
    pub async fn pass(&self) -> Result<(), SpoolError> {
        let ids = self.spool.list().await?;
        if ids.is_empty() {
            return Ok(());
        }
        debug!(messages = ids.len(), "forwarding pass");

        // Destinations that already failed to connect this pass are not
        // retried for later messages.
        let mut unreachable: HashSet<Destination> = HashSet::new();
        let mut current: Option<(Destination, Sender<C>)> = None;

        for id in ids {
            if !self.spool.lock(&id).await? {
                continue;
            }
            if let Err(e) = self.process(&id, &mut current, &mut unreachable).await {
                warn!(id = %id, error = %e, "processing failed, requeueing");
                let _ = self.spool.fail(&id, &e.to_string()).await;
            }
        }

        if let Some((_, sender)) = current.take() {
            sender.quit().await;
        }
        Ok(())
    }

    /// Handles one locked message and releases it (delete / unlock / bad)
    /// on every path that returns `Ok`.
    async fn process(
        &self,
        id: &MessageId,
        current: &mut Option<(Destination, Sender<C>)>,
        unreachable: &mut HashSet<Destination>,
    ) -> Result<(), SpoolError> {
        let content_path = self.spool.path().join(format!("{}{}", id, CONTENT_SUFFIX));
        let envelope_path = self.spool.path().join(format!("{}{}", id, BUSY_SUFFIX));

        if self.spool.read_envelope(id, SpoolState::Busy).await.is_err() {
            warn!(id = %id, "unreadable envelope, quarantining");
            return self.spool.quarantine(id).await;
        }

        // Client-side filter; it may rewrite the files in place.
        let out = run_filter(&self.client_filter, id.as_str(), &content_path, &envelope_path).await;
        let mut envelope = match self.spool.read_envelope(id, SpoolState::Busy).await {
            Ok(envelope) => envelope,
            Err(SpoolError::Envelope(_, e)) => {
                warn!(id = %id, error = %e, "filter left an invalid envelope, quarantining");
                return self.spool.quarantine(id).await;
            }
            Err(e) => return Err(e),
        };
        if let Some(content) = out.rewritten_content {
            envelope.content_size = content.len() as u64;
            self.spool.replace_content(id, content).await?;
            self.spool.write_envelope(id, &envelope).await?;
        }
        match out.verdict {
            FilterVerdict::Ok => (),
            FilterVerdict::Abandon => {
                // Done-signal code -1: drop without trace.
                info!(id = %id, code = -1, "client filter abandoned message");
                return self.spool.delete(id).await;
            }
            FilterVerdict::Reject { text, .. } => {
                // Done-signal code -2: permanent filter failure.
                info!(id = %id, code = -2, reason = text.as_str(), "client filter failed message");
                return self.spool.park_bad(id, &text).await;
            }
            FilterVerdict::Retry { text } => {
                self.spool.fail(id, &text).await?;
                return Ok(());
            }
        }

        // Local fan-out first; remote work only starts once it sticks.
        if !envelope.to_local.is_empty() {
            let deliverer = match &self.deliverer {
                Some(d) => d,
                None => {
                    self.spool.fail(id, "no local delivery configured").await?;
                    return Ok(());
                }
            };
            for mailbox in envelope.to_local.clone() {
                if let Err(e) = deliverer
                    .deliver(&mailbox, &content_path, &envelope, id.as_str())
                    .await
                {
                    warn!(id = %id, mailbox = mailbox.as_str(), error = %e, "local delivery failed");
                    self.spool
                        .fail(id, &format!("local delivery failed: {}", e))
                        .await?;
                    return Ok(());
                }
            }
            let locals = std::mem::take(&mut envelope.to_local);
            envelope.to_delivered.extend(locals);
            self.spool.write_envelope(id, &envelope).await?;
        }

        if envelope.to_remote.is_empty() {
            info!(id = %id, "message delivered locally");
            return self.spool.delete(id).await;
        }

        let from = if envelope.from.is_empty() {
            ReversePath::Null
        } else {
            match Email::parse_complete(&envelope.from) {
                Some(e) => ReversePath::Mailbox(e),
                None => {
                    warn!(id = %id, from = envelope.from.as_str(), "unparseable reverse path");
                    return self.spool.park_bad(id, "unparseable reverse path").await;
                }
            }
        };

        // Partition the remote recipients by route: the per-message
        // override, then the configured upstream, then the recipient's own
        // domain.
        let mut groups: Vec<(Destination, Vec<(String, Email)>)> = Vec::new();
        let mut remaining: Vec<String> = Vec::new();
        let mut reasons: Vec<String> = Vec::new();
        for addr_text in &envelope.to_remote {
            let email = match Email::parse_complete(addr_text) {
                Some(e) => e,
                None => {
                    remaining.push(addr_text.clone());
                    reasons.push(format!("unparseable recipient {:?}", addr_text));
                    continue;
                }
            };
            let dest = if let Some(route) = &envelope.forward_to {
                Destination::from_route(route)
            } else if let Some(route) = &self.default_route {
                Destination::from_route(route)
            } else {
                match &email.hostname {
                    Some(h) => Destination::from_domain(h.to_ascii()),
                    None => {
                        remaining.push(addr_text.clone());
                        reasons.push(format!("no route for bare recipient {:?}", addr_text));
                        continue;
                    }
                }
            };
            match groups.iter_mut().find(|(d, _)| *d == dest) {
                Some((_, v)) => v.push((addr_text.clone(), email)),
                None => groups.push((dest, vec![(addr_text.clone(), email)])),
            }
        }

        let content = self.spool.read_content(id).await?;
        let selector = envelope.selector.clone().unwrap_or_default();
        let mut delivered: Vec<String> = Vec::new();
        let mut message_permanent = false;

        for (dest, rcpts) in groups {
            if unreachable.contains(&dest) {
                remaining.extend(rcpts.iter().map(|(t, _)| t.clone()));
                reasons.push(format!("{} is unreachable", dest));
                continue;
            }

            // One connection at a time, reused while the destination stays
            // the same, torn down as soon as it changes.
            if let Some((d, _)) = current.as_ref() {
                if *d != dest {
                    if let Some((_, sender)) = current.take() {
                        sender.quit().await;
                    }
                }
            }
            if current.is_none() {
                match self.client.connect(&dest).await {
                    Ok(mut sender) => {
                        if let Err(e) = sender.authenticate(&selector).await {
                            warn!(dest = %dest, error = %e, "upstream authentication failed");
                            remaining.extend(rcpts.iter().map(|(t, _)| t.clone()));
                            reasons.push(e.to_string());
                            sender.quit().await;
                            continue;
                        }
                        *current = Some((dest.clone(), sender));
                    }
                    Err(e) => {
                        warn!(dest = %dest, error = %e, "connect failed");
                        unreachable.insert(dest.clone());
                        remaining.extend(rcpts.iter().map(|(t, _)| t.clone()));
                        reasons.push(e.to_string());
                        continue;
                    }
                }
            }

            let sender = &mut current.as_mut().unwrap().1;
            let emails = rcpts.iter().map(|(_, e)| e.clone()).collect::<Vec<_>>();
            match sender.send(&from, &emails, envelope.body, &content).await {
                Ok(outcome) => {
                    info!(
                        id = %id,
                        dest = %dest,
                        code = outcome.final_reply.code.code(),
                        accepted = outcome.accepted.len(),
                        rejected = outcome.rejected.len(),
                        "message transmitted"
                    );
                    delivered.extend(outcome.accepted.iter().map(|&i| rcpts[i].0.clone()));
                    for (i, reply) in outcome.rejected {
                        reasons.push(format!("{}: {}", rcpts[i].0, reply));
                        remaining.push(rcpts[i].0.clone());
                    }
                }
                Err(e) => {
                    warn!(id = %id, dest = %dest, error = %e, "transmission failed");
                    match e.severity() {
                        TransportErrorSeverity::MailPermanent => message_permanent = true,
                        TransportErrorSeverity::NetworkTransient => {
                            unreachable.insert(dest.clone());
                        }
                        _ => (),
                    }
                    // The connection state is undefined after an error.
                    if let Some((_, sender)) = current.take() {
                        sender.quit().await;
                    }
                    remaining.extend(rcpts.iter().map(|(t, _)| t.clone()));
                    reasons.push(e.to_string());
                }
            }
        }

        envelope.to_delivered.extend(delivered);
        if remaining.is_empty() {
            info!(id = %id, "message fully delivered");
            self.spool.delete(id).await
        } else {
            envelope.to_remote = remaining;
            let reason = reasons
                .last()
                .cloned()
                .unwrap_or_else(|| "delivery failed".to_owned());
            self.spool.write_envelope(id, &envelope).await?;
            if message_permanent && envelope.to_delivered.is_empty() {
                self.spool.park_bad(id, &reason).await
            } else {
                self.spool.fail(id, &reason).await.map(|_| ())
            }
        }
    }
}
