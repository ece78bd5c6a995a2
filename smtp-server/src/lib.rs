//! The server-side SMTP protocol engine.
//!
//! [`interact`] drives one connection from banner to QUIT: it assembles
//! lines, decodes commands, walks the transaction state machine, calls out
//! to the [`Config`] for policy (recipient verification, message storage,
//! TLS, SASL), and batches replies so that a pipelined request batch gets a
//! pipelined response batch.

use std::{io, pin::Pin, sync::Arc};

use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace, warn};

use smtp_auth::{ServerAuth, ServerSession, ServerStep};
use smtp_message::{
    BodyType, Command, Email, Line, LineBuffer, Reply, ReplyCode, ReversePath, Terminator,
    Unstuffer,
};

pub const RDBUF_SIZE: usize = 16 * 1024;

pub type DynIo =
    duplexify::Duplex<Pin<Box<dyn Send + AsyncRead>>, Pin<Box<dyn Send + AsyncWrite>>>;

#[derive(Clone, Copy, Eq, PartialEq)]
pub enum IsAlreadyTls {
    Yes,
    No,
}

pub struct HelloInfo {
    pub is_ehlo: bool,
    pub hostname: String,
}

pub struct ConnectionMetadata<U> {
    pub user: U,
    pub peer_addr: String,
    pub hello: Option<HelloInfo>,
    pub is_encrypted: bool,
    pub cipher: String,
    pub authenticated: Option<String>,
}

/// The transaction under construction between MAIL FROM and end-of-data.
pub struct MailTransaction {
    pub from: ReversePath,
    pub from_auth: Option<String>,
    pub body: BodyType,
    pub declared_size: Option<u64>,
    pub to_local: Vec<String>,
    pub to_remote: Vec<Email>,
    pub forward_to: Option<String>,
    pub blackholed: usize,
    used_bdat: bool,
}

impl MailTransaction {
    pub fn recipient_count(&self) -> usize {
        self.to_local.len() + self.to_remote.len()
    }
}

/// Recipient classification, the verifier contract.
pub enum VerifyOutcome {
    /// Deliver into a local mailbox of this name.
    Local { mailbox: String },
    /// Forward to a remote system, possibly rewritten, possibly with a
    /// routing override.
    Remote {
        address: Email,
        forward_to: Option<String>,
    },
    /// Refused; the reply should carry 550/551/553.
    Rejected { reply: Reply },
    /// Accepted on the wire but silently discarded.
    Blackhole,
}

/// What became of a completed message, after the input filter ran.
pub enum MessageOutcome {
    Accepted { id: String },
    Abandoned,
    Rejected { code: u16, text: String },
    Retry { text: String },
}

#[async_trait]
pub trait Config: Send + Sync {
    type ConnectionUserMeta: Send;
    type Message: Send;

    fn hostname(&self) -> &str;

    /// EHLO SIZE value; 0 leaves the limit unenforced.
    fn max_size(&self) -> u64 {
        0
    }

    fn require_auth(&self) -> bool {
        false
    }

    fn require_tls(&self) -> bool {
        false
    }

    fn with_vrfy(&self) -> bool {
        false
    }

    fn with_chunking(&self) -> bool {
        true
    }

    fn with_smtputf8(&self) -> bool {
        true
    }

    /// Reject non-ASCII addresses that arrive without the SMTPUTF8
    /// parameter.
    fn smtputf8_strict(&self) -> bool {
        false
    }

    /// Accept MAIL/RCPT addresses without angle brackets.
    fn permissive_addresses(&self) -> bool {
        false
    }

    fn error_limit(&self) -> u32 {
        8
    }

    fn auth(&self) -> Option<&ServerAuth> {
        None
    }

    fn can_do_tls(&self, conn_meta: &ConnectionMetadata<Self::ConnectionUserMeta>) -> bool {
        let _ = conn_meta;
        false
    }

    /// Wraps the transport in TLS after a STARTTLS. Returns the secured
    /// stream and the negotiated cipher name.
    async fn tls_accept(
        &self,
        io: DynIo,
        conn_meta: &mut ConnectionMetadata<Self::ConnectionUserMeta>,
    ) -> io::Result<(DynIo, String)>;

    async fn verify(
        &self,
        rcpt: &Email,
        txn: &MailTransaction,
        conn_meta: &mut ConnectionMetadata<Self::ConnectionUserMeta>,
    ) -> VerifyOutcome;

    /// Opens message storage for an accepted transaction; content bytes
    /// follow via [`Config::message_write`].
    async fn message_open(
        &self,
        txn: &MailTransaction,
        conn_meta: &mut ConnectionMetadata<Self::ConnectionUserMeta>,
    ) -> io::Result<Self::Message>;

    async fn message_write(&self, msg: &mut Self::Message, data: Vec<u8>) -> io::Result<()>;

    /// End of content: run the input filter and settle the message.
    async fn message_finish(
        &self,
        msg: Self::Message,
        txn: MailTransaction,
        conn_meta: &mut ConnectionMetadata<Self::ConnectionUserMeta>,
    ) -> io::Result<MessageOutcome>;

    /// Drop a partial message (protocol abort, line-limit overflow).
    async fn message_abort(&self, msg: Self::Message);

    fn command_read_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(5)
    }

    fn reply_write_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(5)
    }
}

enum Phase<M> {
    /// Inside a SASL exchange.
    Auth(ServerSession),
    /// Collecting DATA content.
    Data { msg: M, unstuffer: Unstuffer },
    /// Collecting one BDAT chunk.
    Bdat { msg: M, remaining: u64, last: bool },
    /// Storage died mid-DATA: eat input until the terminator, then reply.
    DataDiscard { unstuffer: Unstuffer, reply: Reply },
    /// Storage died mid-BDAT: eat the rest of the chunk, then reply.
    BdatDiscard { remaining: u64, reply: Reply },
}

/// Replies queued for a pipelined batch, flushed at sync points.
struct ReplyBatch {
    bytes: Vec<u8>,
}

impl ReplyBatch {
    fn new() -> ReplyBatch {
        ReplyBatch { bytes: Vec::new() }
    }

    fn push(&mut self, reply: Reply) {
        trace!(reply = %reply, "queueing reply");
        self.bytes.extend_from_slice(&reply.to_wire());
    }

    fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.bytes)
    }

    fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

async fn io_with_timeout<T>(
    fut: impl std::future::Future<Output = io::Result<T>>,
    timeout: chrono::Duration,
    what: &'static str,
) -> io::Result<T> {
    smol::future::or(fut, async {
        smol::Timer::after(timeout.to_std().unwrap_or_default()).await;
        Err(io::Error::new(io::ErrorKind::TimedOut, what))
    })
    .await
}

/// Runs one SMTP session over `io` until QUIT, peer close, or a fatal
/// protocol error. The error return is routed by the caller (the accept
/// loop owns the session).
pub async fn interact<IO, Cfg>(
    io: IO,
    is_already_tls: IsAlreadyTls,
    peer_addr: String,
    metadata: Cfg::ConnectionUserMeta,
    cfg: Arc<Cfg>,
) -> io::Result<()>
where
    IO: 'static + Send + AsyncRead + AsyncWrite,
    Cfg: Config,
{
    let (io_r, io_w) = io.split();
    let io = duplexify::Duplex::new(
        Box::pin(io_r) as Pin<Box<dyn Send + AsyncRead>>,
        Box::pin(io_w) as Pin<Box<dyn Send + AsyncWrite>>,
    );
    let conn_meta = ConnectionMetadata {
        user: metadata,
        peer_addr,
        hello: None,
        is_encrypted: is_already_tls == IsAlreadyTls::Yes,
        cipher: String::new(),
        authenticated: None,
    };
    Session {
        cfg,
        io,
        lb: LineBuffer::new(Terminator::Auto),
        conn_meta,
        txn: None,
        phase: None,
        pending_bdat_msg: None,
        batch: ReplyBatch::new(),
        error_count: 0,
    }
    .run()
    .await
}

struct Session<Cfg: Config> {
    cfg: Arc<Cfg>,
    io: DynIo,
    lb: LineBuffer,
    conn_meta: ConnectionMetadata<Cfg::ConnectionUserMeta>,
    txn: Option<MailTransaction>,
    phase: Option<Phase<Cfg::Message>>,
    /// Message storage held open between BDAT chunks.
    pending_bdat_msg: Option<Cfg::Message>,
    batch: ReplyBatch,
    error_count: u32,
}

/// What to do after handling one input unit.
enum Flow {
    /// Keep going; flush only at end of batch.
    Continue,
    /// This command is a sync point: flush the response batch now.
    Flush,
    /// Clean end of session (QUIT).
    Close,
    /// Fatal: flush what we have and drop the connection.
    Die(io::Error),
}

impl<Cfg: Config> Session<Cfg> {
    async fn run(mut self) -> io::Result<()> {
        self.batch.push(Reply::new(
            ReplyCode::SERVICE_READY,
            format!("{} ESMTP service ready", self.cfg.hostname()),
        ));
        self.flush().await?;

        let mut rdbuf = [0u8; RDBUF_SIZE];
        loop {
            // Drain every complete unit already buffered before reading
            // again; replies accumulate per batch.
            loop {
                let unit = match self.lb.next() {
                    Ok(Some(unit)) => unit,
                    Ok(None) => break,
                    Err(e) => {
                        // Hard-limit overflow. A partially spooled message
                        // is deleted before the 421 goes out.
                        warn!(error = %e, "line assembler overflow");
                        self.abort_partial_message().await;
                        self.batch.push(Reply::new(
                            ReplyCode::SERVICE_NOT_AVAILABLE,
                            "line too long, closing connection",
                        ));
                        self.flush().await?;
                        return Err(io::Error::new(io::ErrorKind::InvalidData, e.to_string()));
                    }
                };
                match self.handle_unit(unit).await {
                    Flow::Continue => (),
                    Flow::Flush => self.flush().await?,
                    Flow::Close => {
                        self.flush().await?;
                        return Ok(());
                    }
                    Flow::Die(e) => {
                        self.flush().await?;
                        return Err(e);
                    }
                }
            }

            // End of the input batch: everything buffered goes out.
            self.flush().await?;

            let n = io_with_timeout(
                self.io.read(&mut rdbuf),
                self.cfg.command_read_timeout(),
                "timed out waiting for a command",
            )
            .await?;
            if n == 0 {
                // Peer closed. Mid-message that is an abort.
                self.abort_partial_message().await;
                return Ok(());
            }
            self.lb.add(&rdbuf[..n]);
        }
    }

    async fn flush(&mut self) -> io::Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let bytes = self.batch.take();
        io_with_timeout(
            self.io.write_all(&bytes),
            self.cfg.reply_write_timeout(),
            "timed out sending replies",
        )
        .await
    }

    async fn abort_partial_message(&mut self) {
        match self.phase.take() {
            Some(Phase::Data { msg, .. }) | Some(Phase::Bdat { msg, .. }) => {
                self.cfg.message_abort(msg).await;
            }
            _ => (),
        }
        if let Some(msg) = self.pending_bdat_msg.take() {
            self.cfg.message_abort(msg).await;
        }
    }

    async fn handle_unit(&mut self, unit: Line) -> Flow {
        match self.phase.take() {
            None => self.handle_command_line(unit).await,
            Some(Phase::Auth(session)) => self.handle_auth_line(session, unit).await,
            Some(Phase::Data { msg, unstuffer }) => {
                self.handle_data_unit(msg, unstuffer, unit).await
            }
            Some(Phase::Bdat { msg, remaining, last }) => {
                self.handle_bdat_unit(msg, remaining, last, unit).await
            }
            Some(Phase::DataDiscard { mut unstuffer, reply }) => {
                let mut wire = unit.bytes;
                if unit.eol_size > 0 {
                    wire.extend_from_slice(b"\r\n");
                }
                let mut sink = Vec::new();
                let res = unstuffer.unstuff(&wire, &mut sink);
                if res.done {
                    self.lb.set_fragments(false);
                    self.lb.prepend(&wire[res.consumed..]);
                    self.txn = None;
                    self.batch.push(reply);
                    Flow::Flush
                } else {
                    self.phase = Some(Phase::DataDiscard { unstuffer, reply });
                    Flow::Continue
                }
            }
            Some(Phase::BdatDiscard { remaining, reply }) => {
                let left = remaining - unit.bytes.len() as u64;
                if left == 0 {
                    self.txn = None;
                    self.batch.push(reply);
                    Flow::Flush
                } else {
                    self.phase = Some(Phase::BdatDiscard { remaining: left, reply });
                    Flow::Continue
                }
            }
        }
    }

    fn bad_client(&mut self, reply: Reply) -> Flow {
        self.error_count += 1;
        if self.error_count >= self.cfg.error_limit() {
            warn!(
                peer = %self.conn_meta.peer_addr,
                errors = self.error_count,
                "client error limit reached"
            );
            self.batch.push(Reply::new(
                ReplyCode::SERVICE_NOT_AVAILABLE,
                "too many errors, closing connection",
            ));
            return Flow::Die(io::Error::new(
                io::ErrorKind::InvalidData,
                "client error limit reached",
            ));
        }
        self.batch.push(reply);
        Flow::Continue
    }

    fn bad_sequence(&mut self) -> Flow {
        self.bad_client(Reply::new(ReplyCode::BAD_SEQUENCE, "bad sequence of commands"))
    }

    async fn handle_command_line(&mut self, unit: Line) -> Flow {
        debug_assert!(unit.eol_size > 0, "command phase always runs in line mode");
        let line = match std::str::from_utf8(&unit.bytes) {
            Ok(l) => l,
            Err(_) => {
                return self.bad_client(Reply::new(
                    ReplyCode::COMMAND_UNRECOGNIZED,
                    "command line is not valid text",
                ));
            }
        };
        trace!(line, "command");
        let cmd = match Command::parse(line, self.cfg.permissive_addresses()) {
            Ok(cmd) => cmd,
            Err(smtp_message::ParseError::Unrecognized) => {
                return self.bad_client(Reply::new(
                    ReplyCode::COMMAND_UNRECOGNIZED,
                    "command not recognized",
                ));
            }
            Err(smtp_message::ParseError::Syntax(what)) => {
                return self.bad_client(Reply::new(
                    ReplyCode::SYNTAX_ERROR,
                    format!("syntax error in {} arguments", what),
                ));
            }
        };

        // Between BDAT chunks only more BDAT, RSET or QUIT make sense; any
        // other command abandons the half-assembled message.
        if self.pending_bdat_msg.is_some() {
            match cmd {
                Command::Bdat { .. } | Command::Rset | Command::Quit => (),
                _ => {
                    self.abort_partial_message().await;
                    return self.bad_sequence();
                }
            }
        }

        match cmd {
            Command::Ehlo { hostname } => self.do_hello(true, hostname.to_string()),
            Command::Helo { hostname } => self.do_hello(false, hostname.to_string()),
            Command::Mail { from, params, sloppy } => self.do_mail(from, params, sloppy),
            Command::Rcpt { to, sloppy, .. } => self.do_rcpt(to, sloppy).await,
            Command::Data => self.do_data().await,
            Command::Bdat { size, last } => self.do_bdat(size, last).await,
            Command::Rset => {
                self.abort_partial_message().await;
                self.txn = None;
                self.batch.push(Reply::new(ReplyCode::OKAY, "OK"));
                Flow::Flush
            }
            Command::Noop => {
                self.batch.push(Reply::new(ReplyCode::OKAY, "OK"));
                Flow::Flush
            }
            Command::Quit => {
                self.abort_partial_message().await;
                self.batch.push(Reply::new(
                    ReplyCode::CLOSING_CHANNEL,
                    format!("{} closing connection", self.cfg.hostname()),
                ));
                Flow::Close
            }
            Command::Vrfy { name } => self.do_vrfy(name).await,
            Command::Expn { .. } => {
                self.batch
                    .push(Reply::new(ReplyCode::COMMAND_UNIMPLEMENTED, "EXPN not available"));
                Flow::Continue
            }
            Command::Help => {
                self.batch.push(Reply::new(
                    ReplyCode::HELP_MESSAGE,
                    "see RFC-5321; supported: EHLO MAIL RCPT DATA BDAT RSET NOOP VRFY QUIT",
                ));
                Flow::Continue
            }
            Command::StartTls => self.do_starttls().await,
            Command::Auth { mechanism, initial } => self.do_auth(mechanism, initial),
        }
    }

    fn do_hello(&mut self, is_ehlo: bool, hostname: String) -> Flow {
        // EHLO resets the transaction but keeps any authenticated identity.
        self.txn = None;
        self.conn_meta.hello = Some(HelloInfo { is_ehlo, hostname });
        if !is_ehlo {
            self.batch
                .push(Reply::new(ReplyCode::OKAY, self.cfg.hostname().to_owned()));
            return Flow::Continue;
        }
        let mut lines = vec![self.cfg.hostname().to_owned()];
        if self.cfg.max_size() > 0 {
            lines.push(format!("SIZE {}", self.cfg.max_size()));
        }
        lines.push("8BITMIME".to_owned());
        lines.push("PIPELINING".to_owned());
        if self.cfg.with_chunking() {
            lines.push("CHUNKING".to_owned());
            lines.push("BINARYMIME".to_owned());
        }
        if self.cfg.with_smtputf8() {
            lines.push("SMTPUTF8".to_owned());
        }
        if self.cfg.with_vrfy() {
            lines.push("VRFY".to_owned());
        }
        if let Some(auth) = self.cfg.auth() {
            lines.push(format!("AUTH {}", auth.mechanisms().join(" ")));
        }
        if self.cfg.can_do_tls(&self.conn_meta) {
            lines.push("STARTTLS".to_owned());
        }
        self.batch.push(Reply::with_lines(ReplyCode::OKAY, lines));
        Flow::Continue
    }

    fn warn_sloppy(&self, sloppy: bool) {
        if sloppy {
            debug!(peer = %self.conn_meta.peer_addr, "whitespace between keyword and colon");
        }
    }

    fn do_mail(
        &mut self,
        from: ReversePath,
        params: smtp_message::MailParams,
        sloppy: bool,
    ) -> Flow {
        self.warn_sloppy(sloppy);
        if self.conn_meta.hello.is_none() || self.txn.is_some() {
            return self.bad_sequence();
        }
        if self.cfg.require_auth() && self.conn_meta.authenticated.is_none() {
            self.batch
                .push(Reply::new(ReplyCode::AUTH_REQUIRED, "authentication required"));
            return Flow::Continue;
        }
        if self.cfg.require_tls() && !self.conn_meta.is_encrypted {
            self.batch.push(Reply::new(
                ReplyCode::AUTH_REQUIRED,
                "must issue STARTTLS first",
            ));
            return Flow::Continue;
        }
        if params.smtputf8 && !self.cfg.with_smtputf8() {
            self.batch.push(Reply::new(
                ReplyCode::PARAMETER_NOT_SUPPORTED,
                "SMTPUTF8 not supported",
            ));
            return Flow::Continue;
        }
        let body = if params.smtputf8 {
            BodyType::Smtputf8
        } else {
            params.body.unwrap_or(BodyType::SevenBit)
        };
        if body == BodyType::BinaryMime && !self.cfg.with_chunking() {
            self.batch.push(Reply::new(
                ReplyCode::SYNTAX_ERROR,
                "BINARYMIME requires CHUNKING",
            ));
            return Flow::Continue;
        }
        if self.cfg.smtputf8_strict() && !params.smtputf8 && !from.is_ascii() {
            self.batch.push(Reply::new(
                ReplyCode::SYNTAX_ERROR,
                "non-ASCII address without SMTPUTF8",
            ));
            return Flow::Continue;
        }
        if let Some(size) = params.size {
            let max = self.cfg.max_size();
            if max > 0 && size > max {
                self.batch.push(Reply::new(
                    ReplyCode::EXCEEDED_STORAGE,
                    "message size exceeds fixed maximum",
                ));
                return Flow::Continue;
            }
        }
        self.txn = Some(MailTransaction {
            from,
            from_auth: params.auth,
            body,
            declared_size: params.size,
            to_local: Vec::new(),
            to_remote: Vec::new(),
            forward_to: None,
            blackholed: 0,
            used_bdat: false,
        });
        self.batch.push(Reply::new(ReplyCode::OKAY, "OK"));
        Flow::Continue
    }

    async fn do_rcpt(&mut self, to: Email, sloppy: bool) -> Flow {
        self.warn_sloppy(sloppy);
        let mut txn = match self.txn.take() {
            Some(txn) => txn,
            None => return self.bad_sequence(),
        };
        if self.cfg.smtputf8_strict() && txn.body != BodyType::Smtputf8 && !to.is_ascii() {
            self.txn = Some(txn);
            self.batch.push(Reply::new(
                ReplyCode::MAILBOX_NAME_INCORRECT,
                "non-ASCII address without SMTPUTF8",
            ));
            return Flow::Continue;
        }
        // The verifier may be asynchronous; while it runs, later pipelined
        // commands just sit in the line assembler.
        match self.cfg.verify(&to, &txn, &mut self.conn_meta).await {
            VerifyOutcome::Local { mailbox } => {
                txn.to_local.push(mailbox);
                self.batch.push(Reply::new(ReplyCode::OKAY, "OK"));
            }
            VerifyOutcome::Remote { address, forward_to } => {
                if forward_to.is_some() {
                    txn.forward_to = forward_to;
                }
                txn.to_remote.push(address);
                self.batch.push(Reply::new(ReplyCode::OKAY, "OK"));
            }
            VerifyOutcome::Rejected { reply } => self.batch.push(reply),
            VerifyOutcome::Blackhole => {
                txn.blackholed += 1;
                self.batch.push(Reply::new(ReplyCode::OKAY, "OK"));
            }
        }
        self.txn = Some(txn);
        Flow::Continue
    }

    async fn do_data(&mut self) -> Flow {
        match &self.txn {
            None => return self.bad_sequence(),
            Some(txn)
                if txn.used_bdat
                    || (txn.recipient_count() == 0 && txn.blackholed == 0)
                    // RFC-3030: BINARYMIME content only moves over BDAT.
                    || txn.body == BodyType::BinaryMime =>
            {
                return self.bad_sequence();
            }
            Some(_) => (),
        }
        let txn = self.txn.as_ref().unwrap();
        let msg = match self.cfg.message_open(txn, &mut self.conn_meta).await {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "opening message storage failed");
                self.batch
                    .push(Reply::new(ReplyCode::LOCAL_ERROR, "storage unavailable"));
                return Flow::Flush;
            }
        };
        self.batch.push(Reply::new(
            ReplyCode::START_MAIL_INPUT,
            "start mail input; end with <CRLF>.<CRLF>",
        ));
        self.lb.set_fragments(true);
        self.phase = Some(Phase::Data {
            msg,
            unstuffer: Unstuffer::new(),
        });
        Flow::Flush
    }

    async fn handle_data_unit(
        &mut self,
        mut msg: Cfg::Message,
        mut unstuffer: Unstuffer,
        unit: Line,
    ) -> Flow {
        // Reconstitute the wire bytes: complete lines are normalised to
        // CRLF (content is CRLF by definition), fragments pass through.
        let mut wire = unit.bytes;
        if unit.eol_size > 0 {
            wire.extend_from_slice(b"\r\n");
        }
        let mut content = Vec::with_capacity(wire.len());
        let res = unstuffer.unstuff(&wire, &mut content);
        if !content.is_empty() {
            if let Err(e) = self.cfg.message_write(&mut msg, content).await {
                warn!(error = %e, "writing content failed");
                self.cfg.message_abort(msg).await;
                if res.done {
                    self.lb.set_fragments(false);
                    self.lb.prepend(&wire[res.consumed..]);
                    self.txn = None;
                    self.batch
                        .push(Reply::new(ReplyCode::LOCAL_ERROR, "storage failure"));
                    return Flow::Flush;
                }
                self.phase = Some(Phase::DataDiscard {
                    unstuffer,
                    reply: Reply::new(ReplyCode::LOCAL_ERROR, "storage failure"),
                });
                return Flow::Continue;
            }
        }
        if !res.done {
            self.phase = Some(Phase::Data { msg, unstuffer });
            return Flow::Continue;
        }
        // End of text. Anything past the terminator belongs to the next
        // batch of commands.
        self.lb.set_fragments(false);
        self.lb.prepend(&wire[res.consumed..]);
        self.finish_message(msg, false).await
    }

    async fn do_bdat(&mut self, size: u64, last: bool) -> Flow {
        match &mut self.txn {
            None => return self.bad_sequence(),
            Some(txn) if txn.recipient_count() == 0 && txn.blackholed == 0 => {
                return self.bad_sequence();
            }
            Some(txn) => txn.used_bdat = true,
        }
        if !self.cfg.with_chunking() {
            return self.bad_client(Reply::new(
                ReplyCode::COMMAND_UNIMPLEMENTED,
                "CHUNKING not available",
            ));
        }
        let msg = match self.pending_bdat_msg.take() {
            Some(msg) => Ok(msg),
            None => {
                let txn = self.txn.as_ref().unwrap();
                self.cfg.message_open(txn, &mut self.conn_meta).await
            }
        };
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "opening message storage failed");
                let reply = Reply::new(ReplyCode::LOCAL_ERROR, "storage unavailable");
                if size == 0 {
                    self.txn = None;
                    self.batch.push(reply);
                    return Flow::Flush;
                }
                // The chunk bytes still arrive; eat them.
                self.lb.expect(size);
                self.phase = Some(Phase::BdatDiscard { remaining: size, reply });
                return Flow::Continue;
            }
        };
        if size == 0 {
            if last {
                return self.finish_message(msg, true).await;
            }
            self.pending_bdat_msg = Some(msg);
            self.batch.push(Reply::new(ReplyCode::OKAY, "OK"));
            return Flow::Continue;
        }
        self.lb.expect(size);
        self.phase = Some(Phase::Bdat { msg, remaining: size, last });
        Flow::Continue
    }

    async fn handle_bdat_unit(
        &mut self,
        mut msg: Cfg::Message,
        remaining: u64,
        last: bool,
        unit: Line,
    ) -> Flow {
        let left = remaining - unit.bytes.len() as u64;
        if let Err(e) = self.cfg.message_write(&mut msg, unit.bytes).await {
            warn!(error = %e, "writing content failed");
            self.cfg.message_abort(msg).await;
            let reply = Reply::new(ReplyCode::LOCAL_ERROR, "storage failure");
            if left == 0 {
                self.txn = None;
                self.batch.push(reply);
                return Flow::Flush;
            }
            self.phase = Some(Phase::BdatDiscard { remaining: left, reply });
            return Flow::Continue;
        }
        if left > 0 {
            self.phase = Some(Phase::Bdat { msg, remaining: left, last });
            return Flow::Continue;
        }
        if last {
            return self.finish_message(msg, true).await;
        }
        self.pending_bdat_msg = Some(msg);
        self.batch.push(Reply::new(ReplyCode::OKAY, "OK"));
        Flow::Continue
    }

    async fn finish_message(&mut self, msg: Cfg::Message, chunked: bool) -> Flow {
        let txn = self.txn.take().expect("transaction present at end of data");
        if txn.recipient_count() == 0 {
            // Every recipient blackholed: accept and drop.
            self.cfg.message_abort(msg).await;
            self.batch.push(Reply::new(ReplyCode::OKAY, "OK"));
            return Flow::Flush;
        }
        match self.cfg.message_finish(msg, txn, &mut self.conn_meta).await {
            Ok(MessageOutcome::Accepted { id }) => {
                let text = if chunked {
                    format!("Message accepted id={}", id)
                } else {
                    format!("OK id={}", id)
                };
                self.batch.push(Reply::new(ReplyCode::OKAY, text));
            }
            Ok(MessageOutcome::Abandoned) => {
                self.batch.push(Reply::new(ReplyCode::OKAY, "OK"));
            }
            Ok(MessageOutcome::Rejected { code, text }) => {
                let code = if (500..600).contains(&code) { code } else { 550 };
                self.batch.push(Reply::new(ReplyCode::custom(code), text));
            }
            Ok(MessageOutcome::Retry { text }) => {
                self.batch
                    .push(Reply::new(ReplyCode::INSUFFICIENT_STORAGE, text));
            }
            Err(e) => {
                warn!(error = %e, "finishing message failed");
                self.batch
                    .push(Reply::new(ReplyCode::LOCAL_ERROR, "storage failure"));
            }
        }
        Flow::Flush
    }

    async fn do_vrfy(&mut self, name: String) -> Flow {
        if !self.cfg.with_vrfy() {
            self.batch.push(Reply::new(
                ReplyCode::COMMAND_UNIMPLEMENTED,
                "VRFY not available",
            ));
            return Flow::Continue;
        }
        let email = match Email::parse_complete(name.trim_matches(|c| c == '<' || c == '>')) {
            Some(e) => e,
            None => {
                self.batch
                    .push(Reply::new(ReplyCode::SYNTAX_ERROR, "unrecognized address"));
                return Flow::Continue;
            }
        };
        let probe = MailTransaction {
            from: ReversePath::Null,
            from_auth: None,
            body: BodyType::SevenBit,
            declared_size: None,
            to_local: Vec::new(),
            to_remote: Vec::new(),
            forward_to: None,
            blackholed: 0,
            used_bdat: false,
        };
        match self.cfg.verify(&email, &probe, &mut self.conn_meta).await {
            VerifyOutcome::Local { mailbox } => {
                self.batch.push(Reply::new(ReplyCode::OKAY, mailbox));
            }
            VerifyOutcome::Remote { address, .. } => {
                self.batch
                    .push(Reply::new(ReplyCode::OKAY, format!("<{}>", address)));
            }
            VerifyOutcome::Blackhole => {
                self.batch.push(Reply::new(
                    ReplyCode::CANNOT_VRFY_BUT_PLEASE_TRY,
                    "cannot verify",
                ));
            }
            VerifyOutcome::Rejected { reply } => self.batch.push(reply),
        }
        Flow::Continue
    }

    async fn do_starttls(&mut self) -> Flow {
        if !self.cfg.can_do_tls(&self.conn_meta) {
            return self.bad_client(Reply::new(
                ReplyCode::COMMAND_UNIMPLEMENTED,
                "STARTTLS not available",
            ));
        }
        if self.lb.buffered() > 0 {
            // RFC-3207: no pipelining across STARTTLS.
            return self.bad_client(Reply::new(
                ReplyCode::BAD_SEQUENCE,
                "no pipelining across STARTTLS",
            ));
        }
        self.batch
            .push(Reply::new(ReplyCode::SERVICE_READY, "ready to start TLS"));
        if let Err(e) = self.flush().await {
            return Flow::Die(e);
        }
        // Hand the transport to the TLS provider; a placeholder duplex
        // stands in while it negotiates.
        let io = std::mem::replace(
            &mut self.io,
            duplexify::Duplex::new(
                Box::pin(futures::io::empty()) as Pin<Box<dyn Send + AsyncRead>>,
                Box::pin(futures::io::sink()) as Pin<Box<dyn Send + AsyncWrite>>,
            ),
        );
        match self.cfg.tls_accept(io, &mut self.conn_meta).await {
            Ok((io, cipher)) => {
                self.io = io;
                self.conn_meta.is_encrypted = true;
                self.conn_meta.cipher = cipher;
                // Fresh session: the peer must EHLO again and the old
                // authentication does not survive the transition.
                self.conn_meta.hello = None;
                self.conn_meta.authenticated = None;
                self.txn = None;
                self.lb = LineBuffer::new(Terminator::Auto);
                Flow::Continue
            }
            Err(e) => {
                warn!(error = %e, "TLS accept failed");
                Flow::Die(e)
            }
        }
    }

    fn do_auth(&mut self, mechanism: String, initial: Option<String>) -> Flow {
        let cfg = self.cfg.clone();
        let auth = match cfg.auth() {
            Some(auth) => auth,
            None => {
                return self.bad_client(Reply::new(
                    ReplyCode::COMMAND_UNIMPLEMENTED,
                    "AUTH not available",
                ));
            }
        };
        if self.conn_meta.authenticated.is_some() || self.txn.is_some() {
            return self.bad_sequence();
        }
        if !auth.supports(&mechanism) {
            self.batch.push(Reply::new(
                ReplyCode::PARAMETER_UNIMPLEMENTED,
                "mechanism not supported",
            ));
            return Flow::Flush;
        }
        let (session, step) = auth.start(&mechanism, initial.as_deref());
        self.apply_auth_step(session, step)
    }

    async fn handle_auth_line(&mut self, mut session: ServerSession, unit: Line) -> Flow {
        let line = match std::str::from_utf8(&unit.bytes) {
            Ok(l) => l.trim(),
            Err(_) => "",
        };
        if line == "*" {
            self.batch.push(Reply::new(
                ReplyCode::SYNTAX_ERROR,
                "authentication cancelled",
            ));
            return Flow::Flush;
        }
        let step = session.apply(line);
        self.apply_auth_step(session, step)
    }

    fn apply_auth_step(&mut self, session: ServerSession, step: ServerStep) -> Flow {
        match step {
            ServerStep::Challenge(challenge) => {
                self.batch
                    .push(Reply::new(ReplyCode::AUTH_CHALLENGE, challenge));
                self.phase = Some(Phase::Auth(session));
                Flow::Flush
            }
            ServerStep::Success { id } => {
                debug!(id = id.as_str(), "authenticated");
                self.conn_meta.authenticated = Some(id);
                self.batch.push(Reply::new(
                    ReplyCode::AUTH_SUCCEEDED,
                    "authentication successful",
                ));
                Flow::Flush
            }
            ServerStep::Failure => {
                self.error_count += 1;
                self.batch
                    .push(Reply::new(ReplyCode::AUTH_FAILED, "authentication failed"));
                Flow::Flush
            }
        }
    }
}

#[cfg(test)]
mod tests;
