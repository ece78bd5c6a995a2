//! The client-side SMTP protocol engine.
//!
//! [`Client`] resolves destinations and opens connections; [`Sender`] owns
//! one live connection and pushes messages over it. The policy knobs
//! (STARTTLS, AUTH, pipelining, downgrades, chunking) live on the
//! [`Config`] trait.

use std::{fmt, io, net::IpAddr, pin::Pin, sync::Arc};

use async_std_resolver::AsyncStdResolver;
use async_trait::async_trait;
use bitflags::bitflags;
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use rand::prelude::SliceRandom;
use smol::net::TcpStream;
use tracing::{debug, trace, warn};
use trust_dns_resolver::error::{ResolveError, ResolveErrorKind};

use smtp_auth::{ClientAccount, ClientAuth};
use smtp_message::{
    BodyType, Command, Email, LineBuffer, MailParams, Reply, ReplyAccumulator, ReplyCodeKind,
    ReversePath, Stuffer, Terminator,
};

pub const SMTP_PORT: u16 = 25;

const RDBUF_SIZE: usize = 16 * 1024;

pub type DynIo =
    duplexify::Duplex<Pin<Box<dyn Send + AsyncRead>>, Pin<Box<dyn Send + AsyncWrite>>>;

#[async_trait]
pub trait Config: Send + Sync {
    fn ehlo_hostname(&self) -> String;

    fn can_do_tls(&self) -> bool {
        true
    }

    fn must_do_tls(&self) -> bool {
        false
    }

    /// Note: if this can only fail, make `can_do_tls` return false.
    async fn tls_connect(&self, io: DynIo) -> io::Result<DynIo>;

    /// The account to authenticate with, chosen by the message's selector
    /// tag. `None` means do not authenticate.
    fn client_account(&self, selector: &str) -> Option<ClientAccount> {
        let _ = selector;
        None
    }

    /// Try MAIL FROM even if authentication failed.
    fn authentication_fallthrough(&self) -> bool {
        false
    }

    /// Any rejected recipient aborts the whole message.
    fn must_accept_all_recipients(&self) -> bool {
        false
    }

    /// Fail 8-bit messages to servers without 8BITMIME instead of sending
    /// them anyway.
    fn eightbit_strict(&self) -> bool {
        false
    }

    /// Fail SMTPUTF8 messages to servers without SMTPUTF8 instead of
    /// downgrading the addresses to punycode.
    fn smtputf8_strict(&self) -> bool {
        false
    }

    fn bdat_chunk_size(&self) -> usize {
        1_000_000
    }

    /// Time from connect to the 220 banner.
    fn ready_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(1)
    }

    /// Time from any outgoing command to its reply.
    fn response_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(5)
    }

    fn command_write_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(5)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("retrieving MX records for ‘{0}’")]
    DnsMx(String, #[source] ResolveError),

    #[error("retrieving address records for ‘{0}’")]
    DnsIp(String, #[source] ResolveError),

    #[error("destination ‘{0}’ has no usable address")]
    NoAddress(String),

    #[error("connecting to {0}:{1}")]
    Connecting(IpAddr, u16, #[source] io::Error),

    #[error("receiving reply bytes")]
    ReceivingReplyBytes(#[source] io::Error),

    #[error("timed out waiting for a reply")]
    TimedOutWaitingForReply,

    #[error("connection aborted")]
    ConnectionAborted,

    #[error("cannot parse reply: {0:?}")]
    SyntaxError(String),

    #[error("timed out sending a command")]
    TimedOutSendingCommand,

    #[error("sending command")]
    SendingCommand(#[source] io::Error),

    #[error("negotiating TLS")]
    NegotiatingTls(#[source] io::Error),

    #[error("remote server cannot do TLS")]
    CannotDoTls,

    #[error("authentication failed: {0}")]
    AuthenticationFailed(Reply),

    #[error("no shared authentication mechanism")]
    NoSharedMechanism,

    #[error("8-bit message but remote server has no 8BITMIME")]
    CannotDoEightBit,

    #[error("UTF-8 addresses but remote server has no SMTPUTF8")]
    CannotDoSmtpUtf8,

    #[error("all recipients were refused")]
    AllRecipientsRefused(Reply),

    #[error("recipient refused: {0}")]
    RecipientRefused(Reply),

    #[error("mail-level transient issue: {0}")]
    TransientMail(Reply),

    #[error("mail-level permanent issue: {0}")]
    PermanentMail(Reply),

    #[error("unexpected reply code: {0}")]
    UnexpectedReplyCode(Reply),
}

pub enum TransportErrorSeverity {
    Local,
    NetworkTransient,
    MailTransient,
    MailPermanent,
}

impl TransportError {
    pub fn severity(&self) -> TransportErrorSeverity {
        use TransportError::*;
        match self {
            DnsMx(_, _) | DnsIp(_, _) | NoAddress(_) => TransportErrorSeverity::NetworkTransient,
            Connecting(_, _, _)
            | ReceivingReplyBytes(_)
            | TimedOutWaitingForReply
            | ConnectionAborted
            | TimedOutSendingCommand
            | SendingCommand(_)
            | NegotiatingTls(_)
            | CannotDoTls => TransportErrorSeverity::NetworkTransient,
            SyntaxError(_) | UnexpectedReplyCode(_) => TransportErrorSeverity::MailTransient,
            AuthenticationFailed(_) | NoSharedMechanism => TransportErrorSeverity::MailTransient,
            CannotDoEightBit | CannotDoSmtpUtf8 => TransportErrorSeverity::MailPermanent,
            AllRecipientsRefused(r) | RecipientRefused(r) | TransientMail(r)
            | PermanentMail(r) => match r.code.kind() {
                ReplyCodeKind::PermanentNegative => TransportErrorSeverity::MailPermanent,
                _ => TransportErrorSeverity::MailTransient,
            },
        }
    }
}

/// Where a message is headed: an explicit host:port, or MX routing for a
/// recipient domain.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Destination {
    pub host: String,
    pub port: u16,
    pub use_mx: bool,
}

impl Destination {
    /// Parses a `host[:port]` route string, as used by `--forward-to` and
    /// the envelope's routing override.
    pub fn from_route(route: &str) -> Destination {
        match route.rfind(':') {
            Some(p) if route[p + 1..].chars().all(|c| c.is_ascii_digit()) && p + 1 < route.len() => {
                Destination {
                    host: route[..p].to_owned(),
                    port: route[p + 1..].parse().unwrap_or(SMTP_PORT),
                    use_mx: false,
                }
            }
            _ => Destination {
                host: route.to_owned(),
                port: SMTP_PORT,
                use_mx: false,
            },
        }
    }

    pub fn from_domain(domain: &str) -> Destination {
        Destination {
            host: domain.to_owned(),
            port: SMTP_PORT,
            use_mx: true,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

bitflags! {
    struct Extensions: u16 {
        const STARTTLS  = 0b0000_0001;
        const PIPELINING = 0b0000_0010;
        const CHUNKING  = 0b0000_0100;
        const EIGHTBITMIME = 0b0000_1000;
        const SMTPUTF8  = 0b0001_0000;
        const AUTH      = 0b0010_0000;
        const SIZE      = 0b0100_0000;
    }
}

/// What happened to one message on the wire. Recipients are identified by
/// their index into the slice passed to [`Sender::send`].
pub struct SendOutcome {
    pub accepted: Vec<usize>,
    /// Rejected recipients with the server's reply.
    pub rejected: Vec<(usize, Reply)>,
    /// The reply to the final end-of-content command.
    pub final_reply: Reply,
}

pub struct Client<Cfg> {
    resolver: AsyncStdResolver,
    cfg: Arc<Cfg>,
}

impl<Cfg: Config> Client<Cfg> {
    pub fn new(resolver: AsyncStdResolver, cfg: Arc<Cfg>) -> Client<Cfg> {
        Client { resolver, cfg }
    }

    /// Opens a connection to the destination and walks it through banner,
    /// EHLO and STARTTLS.
    pub async fn connect(&self, dest: &Destination) -> Result<Sender<Cfg>, TransportError> {
        if dest.use_mx {
            self.connect_to_mx(dest).await
        } else if let Ok(ip) = dest.host.parse::<IpAddr>() {
            self.connect_to_ip(ip, dest.port).await
        } else {
            self.connect_to_host(&dest.host, dest.port).await
        }
    }

    async fn connect_to_mx(&self, dest: &Destination) -> Result<Sender<Cfg>, TransportError> {
        let lookup = match self.resolver.mx_lookup(dest.host.as_str()).await {
            Ok(l) => l,
            Err(e) => {
                if let ResolveErrorKind::NoRecordsFound { .. } = e.kind() {
                    // No MX: fall back to the address records of the domain.
                    return self.connect_to_host(&dest.host, dest.port).await;
                }
                return Err(TransportError::DnsMx(dest.host.clone(), e));
            }
        };

        let mut mx_records = std::collections::BTreeMap::new();
        for record in lookup.iter() {
            mx_records
                .entry(record.preference())
                .or_insert_with(Vec::new)
                .push(record.exchange().to_utf8());
        }
        if mx_records.is_empty() {
            return self.connect_to_host(&dest.host, dest.port).await;
        }

        // By increasing preference; same-preference exchanges in random
        // order.
        let mut first_error = None;
        for (_, mut mxes) in mx_records {
            mxes.shuffle(&mut rand::thread_rng());
            for mx in mxes {
                let mx = mx.trim_end_matches('.');
                match self.connect_to_host(mx, dest.port).await {
                    Ok(sender) => return Ok(sender),
                    Err(e) => first_error = first_error.or(Some(e)),
                }
            }
        }
        Err(first_error.unwrap_or_else(|| TransportError::NoAddress(dest.host.clone())))
    }

    async fn connect_to_host(&self, host: &str, port: u16) -> Result<Sender<Cfg>, TransportError> {
        let lookup = self
            .resolver
            .lookup_ip(host)
            .await
            .map_err(|e| TransportError::DnsIp(host.to_owned(), e))?;
        let mut first_error = None;
        for ip in lookup.iter() {
            match self.connect_to_ip(ip, port).await {
                Ok(sender) => return Ok(sender),
                Err(e) => first_error = first_error.or(Some(e)),
            }
        }
        Err(first_error.unwrap_or_else(|| TransportError::NoAddress(host.to_owned())))
    }

    pub async fn connect_to_ip(
        &self,
        ip: IpAddr,
        port: u16,
    ) -> Result<Sender<Cfg>, TransportError> {
        trace!(ip = %ip, port, "connecting");
        let io = TcpStream::connect((ip, port))
            .await
            .map_err(|e| TransportError::Connecting(ip, port, e))?;
        let (reader, writer) = io.split();
        self.connect_to_stream(duplexify::Duplex::new(
            Box::pin(reader) as Pin<Box<dyn Send + AsyncRead>>,
            Box::pin(writer) as Pin<Box<dyn Send + AsyncWrite>>,
        ))
        .await
    }

    /// Runs the connection preamble over an arbitrary stream.
    pub async fn connect_to_stream(&self, io: DynIo) -> Result<Sender<Cfg>, TransportError> {
        Sender::handshake(io, self.cfg.clone()).await
    }
}

fn verify_reply(r: Reply, expected: ReplyCodeKind) -> Result<Reply, TransportError> {
    use ReplyCodeKind::*;
    match r.code.kind() {
        k if k == expected => Ok(r),
        TransientNegative => Err(TransportError::TransientMail(r)),
        PermanentNegative => Err(TransportError::PermanentMail(r)),
        _ => Err(TransportError::UnexpectedReplyCode(r)),
    }
}

pub struct Sender<Cfg> {
    io: DynIo,
    lb: LineBuffer,
    acc: ReplyAccumulator,
    extensions: Extensions,
    auth_mechanisms: Vec<String>,
    authenticated_as: Option<String>,
    esmtp: bool,
    cfg: Arc<Cfg>,
}

impl<Cfg: Config> Sender<Cfg> {
    /// Walks a fresh stream through banner, EHLO and STARTTLS.
    pub async fn handshake(io: DynIo, cfg: Arc<Cfg>) -> Result<Sender<Cfg>, TransportError> {
        let mut sender = Sender {
            io,
            lb: LineBuffer::new(Terminator::Auto),
            acc: ReplyAccumulator::new(),
            extensions: Extensions::empty(),
            auth_mechanisms: Vec::new(),
            authenticated_as: None,
            esmtp: true,
            cfg,
        };

        // Banner.
        let reply = sender.read_reply(sender.cfg.ready_timeout()).await?;
        verify_reply(reply, ReplyCodeKind::PositiveCompletion)?;

        sender.hello().await?;

        // STARTTLS when available and wanted.
        let mut did_tls = false;
        if sender.extensions.contains(Extensions::STARTTLS) && sender.cfg.can_do_tls() {
            sender.send_command(Command::StartTls).await?;
            let reply = sender.read_reply(sender.cfg.response_timeout()).await?;
            if reply.code.kind() == ReplyCodeKind::PositiveCompletion {
                let io = std::mem::replace(
                    &mut sender.io,
                    duplexify::Duplex::new(
                        Box::pin(futures::io::empty()) as Pin<Box<dyn Send + AsyncRead>>,
                        Box::pin(futures::io::sink()) as Pin<Box<dyn Send + AsyncWrite>>,
                    ),
                );
                sender.io = sender
                    .cfg
                    .tls_connect(io)
                    .await
                    .map_err(TransportError::NegotiatingTls)?;
                // The session restarts from EHLO on the secured channel.
                sender.lb = LineBuffer::new(Terminator::Auto);
                sender.hello().await?;
                did_tls = true;
            } else {
                warn!(reply = %reply, "server refused STARTTLS");
            }
        }
        if !did_tls && sender.cfg.must_do_tls() {
            return Err(TransportError::CannotDoTls);
        }

        Ok(sender)
    }

    pub fn is_esmtp(&self) -> bool {
        self.esmtp
    }

    pub fn authenticated_as(&self) -> Option<&str> {
        self.authenticated_as.as_deref()
    }

    async fn read_reply(&mut self, timeout: chrono::Duration) -> Result<Reply, TransportError> {
        let mut rdbuf = [0u8; RDBUF_SIZE];
        loop {
            while let Some(line) = self
                .lb
                .next()
                .map_err(|e| TransportError::SyntaxError(e.to_string()))?
            {
                let text = std::str::from_utf8(&line.bytes)
                    .map_err(|_| TransportError::SyntaxError("reply is not text".to_owned()))?;
                trace!(line = text, "reply line");
                if let Some(reply) = self
                    .acc
                    .add_line(text)
                    .map_err(|e| TransportError::SyntaxError(e.to_string()))?
                {
                    return Ok(reply);
                }
            }
            let std_timeout = timeout.to_std().unwrap_or_default();
            let read = self.io.read(&mut rdbuf);
            let n = smol::future::or(
                async { read.await.map_err(TransportError::ReceivingReplyBytes) },
                async {
                    smol::Timer::after(std_timeout).await;
                    Err(TransportError::TimedOutWaitingForReply)
                },
            )
            .await?;
            if n == 0 {
                return Err(TransportError::ConnectionAborted);
            }
            self.lb.add(&rdbuf[..n]);
        }
    }

    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let timeout = self.cfg.command_write_timeout().to_std().unwrap_or_default();
        let write = self.io.write_all(bytes);
        smol::future::or(
            async { write.await.map_err(TransportError::SendingCommand) },
            async {
                smol::Timer::after(timeout).await;
                Err(TransportError::TimedOutSendingCommand)
            },
        )
        .await
    }

    async fn send_command(&mut self, cmd: Command) -> Result<(), TransportError> {
        let wire = cmd.to_wire();
        trace!(cmd = %String::from_utf8_lossy(&wire).trim_end(), "sending command");
        self.write_all(&wire).await
    }

    /// EHLO, falling back to HELO when the server does not speak ESMTP.
    async fn hello(&mut self) -> Result<(), TransportError> {
        let hostname = smtp_message::Hostname::parse_complete(&self.cfg.ehlo_hostname())
            .unwrap_or(smtp_message::Hostname::AsciiDomain {
                raw: "localhost".to_owned(),
            });
        self.send_command(Command::Ehlo {
            hostname: hostname.clone(),
        })
        .await?;
        let reply = self.read_reply(self.cfg.response_timeout()).await?;
        if reply.code.kind() == ReplyCodeKind::PermanentNegative {
            // Ancient server: HELO, and no extensions at all.
            debug!("EHLO refused, falling back to HELO");
            self.esmtp = false;
            self.extensions = Extensions::empty();
            self.auth_mechanisms.clear();
            self.send_command(Command::Helo { hostname }).await?;
            let reply = self.read_reply(self.cfg.response_timeout()).await?;
            verify_reply(reply, ReplyCodeKind::PositiveCompletion)?;
            return Ok(());
        }
        let reply = verify_reply(reply, ReplyCodeKind::PositiveCompletion)?;

        self.extensions = Extensions::empty();
        self.auth_mechanisms.clear();
        for line in reply.text.iter().skip(1) {
            let mut words = line.split_whitespace();
            let keyword = match words.next() {
                Some(w) => w.to_ascii_uppercase(),
                None => continue,
            };
            match keyword.as_str() {
                "STARTTLS" => self.extensions.insert(Extensions::STARTTLS),
                "PIPELINING" => self.extensions.insert(Extensions::PIPELINING),
                "CHUNKING" => self.extensions.insert(Extensions::CHUNKING),
                "8BITMIME" => self.extensions.insert(Extensions::EIGHTBITMIME),
                "SMTPUTF8" => self.extensions.insert(Extensions::SMTPUTF8),
                "SIZE" => self.extensions.insert(Extensions::SIZE),
                "AUTH" => {
                    self.extensions.insert(Extensions::AUTH);
                    self.auth_mechanisms = words.map(|w| w.to_owned()).collect();
                }
                _ => (),
            }
        }
        Ok(())
    }

    /// Authenticates for the given selector tag if the server offers AUTH
    /// and the configuration has a matching account. A selector change on a
    /// live connection is the caller's cue to reconnect.
    pub async fn authenticate(&mut self, selector: &str) -> Result<(), TransportError> {
        if self.authenticated_as.is_some() {
            return Ok(());
        }
        let account = match self.cfg.client_account(selector) {
            Some(account) => account,
            None => return Ok(()),
        };
        if !self.extensions.contains(Extensions::AUTH) {
            return Ok(());
        }
        let auth = ClientAuth::new(account.clone());
        let mechanism = match auth.select(&self.auth_mechanisms) {
            Some(m) => m,
            None => {
                if self.cfg.authentication_fallthrough() {
                    warn!("no shared SASL mechanism, continuing unauthenticated");
                    return Ok(());
                }
                return Err(TransportError::NoSharedMechanism);
            }
        };
        debug!(mechanism, "authenticating");
        let (mut session, initial) = auth.start(mechanism);
        self.send_command(Command::Auth {
            mechanism: mechanism.to_owned(),
            initial,
        })
        .await?;
        loop {
            let reply = self.read_reply(self.cfg.response_timeout()).await?;
            match reply.code.code() {
                334 => {
                    let challenge = reply.summary().trim().to_owned();
                    match session.respond(&challenge) {
                        Some(response) => self.write_all(format!("{}\r\n", response).as_bytes()).await?,
                        None => self.write_all(b"*\r\n").await?,
                    }
                }
                235 => {
                    self.authenticated_as = Some(account.id);
                    return Ok(());
                }
                _ => {
                    if self.cfg.authentication_fallthrough() {
                        warn!(reply = %reply, "authentication failed, continuing anyway");
                        return Ok(());
                    }
                    return Err(TransportError::AuthenticationFailed(reply));
                }
            }
        }
    }

    /// Transmits one message. `content` is the unescaped CRLF-terminated
    /// body; dot-stuffing or BDAT framing happens here.
    pub async fn send(
        &mut self,
        from: &ReversePath,
        rcpts: &[Email],
        body: BodyType,
        content: &[u8],
    ) -> Result<SendOutcome, TransportError> {
        assert!(!rcpts.is_empty(), "send requires at least one recipient");

        // Negotiate the representation downward when the server is behind.
        let mut body = body;
        let mut smtputf8 = body == BodyType::Smtputf8;
        if smtputf8 && !self.extensions.contains(Extensions::SMTPUTF8) {
            if self.cfg.smtputf8_strict() {
                return Err(TransportError::CannotDoSmtpUtf8);
            }
            // Downgrade: addresses go to their ASCII rendition below.
            warn!("server has no SMTPUTF8, downgrading addresses");
            smtputf8 = false;
            body = BodyType::EightBitMime;
        }
        if matches!(body, BodyType::EightBitMime)
            && !self.extensions.contains(Extensions::EIGHTBITMIME)
        {
            if self.cfg.eightbit_strict() {
                return Err(TransportError::CannotDoEightBit);
            }
            warn!("server has no 8BITMIME, sending as 7bit");
            body = BodyType::SevenBit;
        }
        let chunked = body == BodyType::BinaryMime && self.extensions.contains(Extensions::CHUNKING);

        let from_text = match (smtputf8, from) {
            (_, ReversePath::Null) => String::new(),
            (true, ReversePath::Mailbox(e)) => e.to_string(),
            (false, ReversePath::Mailbox(e)) => match e.to_ascii() {
                Some(s) => s,
                None => return Err(TransportError::CannotDoSmtpUtf8),
            },
        };
        let mut rcpt_texts = Vec::with_capacity(rcpts.len());
        for r in rcpts {
            if smtputf8 {
                rcpt_texts.push(r.to_string());
            } else {
                match r.to_ascii() {
                    Some(s) => rcpt_texts.push(s),
                    None => return Err(TransportError::CannotDoSmtpUtf8),
                }
            }
        }

        let mut params = MailParams::default();
        if self.esmtp {
            if self.extensions.contains(Extensions::SIZE) {
                params.size = Some(content.len() as u64);
            }
            params.body = match body {
                BodyType::SevenBit => None,
                other => Some(other),
            };
            params.smtputf8 = smtputf8;
        }

        // MAIL and RCPT, pipelined when the server allows it.
        let mail_wire = mail_from_wire(&from_text, &params);
        let pipelining = self.extensions.contains(Extensions::PIPELINING);
        if pipelining {
            let mut batch = mail_wire;
            for r in &rcpt_texts {
                batch.extend_from_slice(format!("RCPT TO:<{}>\r\n", r).as_bytes());
            }
            self.write_all(&batch).await?;
        } else {
            self.write_all(&mail_wire).await?;
        }

        let reply = self.read_reply(self.cfg.response_timeout()).await?;
        verify_reply(reply, ReplyCodeKind::PositiveCompletion)?;

        let mut accepted = Vec::new();
        let mut rejected = Vec::new();
        for (i, r) in rcpt_texts.iter().enumerate() {
            if !pipelining {
                self.write_all(format!("RCPT TO:<{}>\r\n", r).as_bytes())
                    .await?;
            }
            let reply = self.read_reply(self.cfg.response_timeout()).await?;
            if reply.code.is_success() {
                accepted.push(i);
            } else {
                debug!(rcpt = r.as_str(), reply = %reply, "recipient refused");
                if self.cfg.must_accept_all_recipients() {
                    return Err(TransportError::RecipientRefused(reply));
                }
                rejected.push((i, reply));
            }
        }
        if accepted.is_empty() {
            let reply = rejected
                .last()
                .map(|(_, r)| r.clone())
                .expect("at least one recipient was attempted");
            return Err(TransportError::AllRecipientsRefused(reply));
        }

        let final_reply = if chunked {
            self.send_bdat(content).await?
        } else {
            self.send_data(content).await?
        };

        Ok(SendOutcome {
            accepted,
            rejected,
            final_reply,
        })
    }

    async fn send_data(&mut self, content: &[u8]) -> Result<Reply, TransportError> {
        self.send_command(Command::Data).await?;
        let reply = self.read_reply(self.cfg.response_timeout()).await?;
        verify_reply(reply, ReplyCodeKind::PositiveIntermediate)?;

        let mut stuffer = Stuffer::new();
        let mut wire = Vec::with_capacity(content.len() + 8);
        stuffer.stuff(content, &mut wire);
        stuffer.finish(&mut wire);
        self.write_all(&wire).await?;

        let reply = self.read_reply(self.cfg.response_timeout()).await?;
        verify_reply(reply, ReplyCodeKind::PositiveCompletion)
    }

    async fn send_bdat(&mut self, content: &[u8]) -> Result<Reply, TransportError> {
        let chunk_size = std::cmp::max(1, self.cfg.bdat_chunk_size());
        let mut chunks = content.chunks(chunk_size).peekable();
        if chunks.peek().is_none() {
            // Empty body: a single zero-length terminal chunk.
            self.send_command(Command::Bdat { size: 0, last: true }).await?;
            let reply = self.read_reply(self.cfg.response_timeout()).await?;
            return verify_reply(reply, ReplyCodeKind::PositiveCompletion);
        }
        let mut last_reply = None;
        while let Some(chunk) = chunks.next() {
            let last = chunks.peek().is_none();
            let mut wire = Command::Bdat {
                size: chunk.len() as u64,
                last,
            }
            .to_wire();
            wire.extend_from_slice(chunk);
            self.write_all(&wire).await?;
            let reply = self.read_reply(self.cfg.response_timeout()).await?;
            let reply = verify_reply(reply, ReplyCodeKind::PositiveCompletion)?;
            last_reply = Some(reply);
        }
        Ok(last_reply.expect("at least one chunk was sent"))
    }

    /// Ends the session politely. Errors are ignored: the connection is
    /// going away regardless.
    pub async fn quit(mut self) {
        if self.send_command(Command::Quit).await.is_ok() {
            let _ = self.read_reply(self.cfg.response_timeout()).await;
        }
        let _ = self.io.close().await;
    }
}

fn mail_from_wire(from: &str, params: &MailParams) -> Vec<u8> {
    let mut s = format!("MAIL FROM:<{}>", from);
    if let Some(size) = params.size {
        s.push_str(&format!(" SIZE={}", size));
    }
    if let Some(body) = params.body {
        if let Some(v) = body.as_mail_parameter() {
            s.push_str(&format!(" BODY={}", v));
        }
    }
    if params.smtputf8 {
        s.push_str(" SMTPUTF8");
    }
    s.push_str("\r\n");
    s.into_bytes()
}

#[cfg(test)]
mod tests;
