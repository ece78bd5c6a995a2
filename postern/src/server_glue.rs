//! Binds the server protocol engine to the spool, the verifier and the
//! input filter.

use std::{io, pin::Pin, sync::Arc};

use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tracing::{debug, info, warn};

use smtp_auth::ServerAuth;
use smtp_server::{
    ConnectionMetadata, DynIo, MailTransaction, MessageOutcome, VerifyOutcome,
};
use smtp_spool::{Envelope, Spool, SpoolWriter};

use crate::filter::{run_filter, FilterSpec, FilterVerdict};
use crate::verify::Verifier;

pub struct ServerGlue {
    pub hostname: String,
    pub size_limit: u64,
    pub require_auth: bool,
    pub spool: Arc<Spool>,
    pub auth: Option<ServerAuth>,
    pub acceptor: Option<async_tls::TlsAcceptor>,
    pub verifier: Verifier,
    pub filter: FilterSpec,
}

fn storage_err(e: smtp_spool::SpoolError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

impl ServerGlue {
    fn received_header(
        &self,
        id: &str,
        txn: &MailTransaction,
        conn_meta: &ConnectionMetadata<()>,
    ) -> Vec<u8> {
        let _ = txn;
        let helo = conn_meta
            .hello
            .as_ref()
            .map(|h| h.hostname.as_str())
            .unwrap_or("unknown");
        let with = match (conn_meta.is_encrypted, conn_meta.authenticated.is_some()) {
            (false, false) => "ESMTP",
            (false, true) => "ESMTPA",
            (true, false) => "ESMTPS",
            (true, true) => "ESMTPSA",
        };
        format!(
            "Received: from {} ({}) by {} with {} id {}; {}\r\n",
            helo,
            conn_meta.peer_addr,
            self.hostname,
            with,
            id,
            chrono::Utc::now().to_rfc2822(),
        )
        .into_bytes()
    }
}

#[async_trait]
impl smtp_server::Config for ServerGlue {
    type ConnectionUserMeta = ();
    type Message = SpoolWriter;

    fn hostname(&self) -> &str {
        &self.hostname
    }

    fn max_size(&self) -> u64 {
        self.size_limit
    }

    fn require_auth(&self) -> bool {
        self.require_auth
    }

    fn auth(&self) -> Option<&ServerAuth> {
        self.auth.as_ref()
    }

    fn can_do_tls(&self, conn_meta: &ConnectionMetadata<()>) -> bool {
        self.acceptor.is_some() && !conn_meta.is_encrypted
    }

    async fn tls_accept(
        &self,
        io: DynIo,
        _conn_meta: &mut ConnectionMetadata<()>,
    ) -> io::Result<(DynIo, String)> {
        let acceptor = self
            .acceptor
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "TLS not configured"))?;
        let stream = acceptor.accept(io).await?;
        let (r, w) = stream.split();
        let io = duplexify::Duplex::new(
            Box::pin(r) as Pin<Box<dyn Send + AsyncRead>>,
            Box::pin(w) as Pin<Box<dyn Send + AsyncWrite>>,
        );
        // The acceptor does not surface the negotiated cipher; the envelope
        // field is allowed to stay empty.
        Ok((io, String::new()))
    }

    async fn verify(
        &self,
        rcpt: &smtp_message::Email,
        txn: &MailTransaction,
        conn_meta: &mut ConnectionMetadata<()>,
    ) -> VerifyOutcome {
        self.verifier
            .verify(rcpt, &txn.from.to_string(), &conn_meta.peer_addr)
            .await
    }

    async fn message_open(
        &self,
        txn: &MailTransaction,
        conn_meta: &mut ConnectionMetadata<()>,
    ) -> io::Result<SpoolWriter> {
        let mut writer = self.spool.create().await.map_err(storage_err)?;
        let header = self.received_header(writer.id().to_string().as_str(), txn, conn_meta);
        writer.write(header).await.map_err(storage_err)?;
        Ok(writer)
    }

    async fn message_write(&self, msg: &mut SpoolWriter, data: Vec<u8>) -> io::Result<()> {
        msg.write(data).await.map_err(storage_err)
    }

    async fn message_finish(
        &self,
        msg: SpoolWriter,
        txn: MailTransaction,
        conn_meta: &mut ConnectionMetadata<()>,
    ) -> io::Result<MessageOutcome> {
        if self.size_limit > 0 && msg.written() > self.size_limit {
            msg.abandon().await.map_err(storage_err)?;
            return Ok(MessageOutcome::Rejected {
                code: 552,
                text: "message size exceeds fixed maximum".to_owned(),
            });
        }

        let mut envelope = Envelope::new(conn_meta.peer_addr.clone());
        envelope.from = txn.from.to_string();
        envelope.from_auth_in = txn
            .from_auth
            .clone()
            .or_else(|| conn_meta.authenticated.clone());
        envelope.to_local = txn.to_local.clone();
        envelope.to_remote = txn.to_remote.iter().map(|e| e.to_string()).collect();
        envelope.forward_to = txn.forward_to.clone();
        envelope.client_authenticated = conn_meta.authenticated.is_some();
        envelope.client_secure = conn_meta.is_encrypted;
        envelope.client_cipher = conn_meta.cipher.clone();
        envelope.body = txn.body;
        envelope.content_size = msg.written();

        let pending = msg.close(&envelope).await.map_err(storage_err)?;
        let id = pending.id().clone();
        let content_path = self.spool.path().join(pending.content_name());
        let envelope_path = self.spool.path().join(pending.envelope_name());

        let out = run_filter(&self.filter, id.as_str(), &content_path, &envelope_path).await;
        if let Some(content) = out.rewritten_content {
            envelope.content_size = content.len() as u64;
            self.spool
                .replace_content(&id, content)
                .await
                .map_err(storage_err)?;
            pending.rewrite_envelope(&envelope).await.map_err(storage_err)?;
        }

        match out.verdict {
            FilterVerdict::Ok => {
                let id = pending.commit().await.map_err(storage_err)?;
                info!(id = %id, size = envelope.content_size, "message spooled");
                Ok(MessageOutcome::Accepted { id: id.to_string() })
            }
            FilterVerdict::Abandon => {
                debug!(id = %id, "filter abandoned message");
                pending.abandon().await.map_err(storage_err)?;
                Ok(MessageOutcome::Abandoned)
            }
            FilterVerdict::Reject { code, text } => {
                debug!(id = %id, code, "filter rejected message");
                pending.abandon().await.map_err(storage_err)?;
                Ok(MessageOutcome::Rejected { code, text })
            }
            FilterVerdict::Retry { text } => {
                pending.abandon().await.map_err(storage_err)?;
                Ok(MessageOutcome::Retry { text })
            }
        }
    }

    async fn message_abort(&self, msg: SpoolWriter) {
        if let Err(e) = msg.abandon().await {
            warn!(error = %e, "dropping partial spool files failed");
        }
    }
}
