use super::*;

use std::{
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

use futures::{executor, io::Cursor};

struct SharedWriter(Arc<Mutex<Vec<u8>>>);

impl AsyncWrite for SharedWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

struct TestConfig {
    must_accept_all: bool,
    eightbit_strict: bool,
    smtputf8_strict: bool,
    chunk_size: usize,
    account: Option<ClientAccount>,
}

impl Default for TestConfig {
    fn default() -> TestConfig {
        TestConfig {
            must_accept_all: false,
            eightbit_strict: false,
            smtputf8_strict: false,
            chunk_size: 1_000_000,
            account: None,
        }
    }
}

#[async_trait]
impl Config for TestConfig {
    fn ehlo_hostname(&self) -> String {
        "relay.test".to_owned()
    }

    fn can_do_tls(&self) -> bool {
        false
    }

    async fn tls_connect(&self, _io: DynIo) -> io::Result<DynIo> {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "tls connect not implemented for tests",
        ))
    }

    fn client_account(&self, _selector: &str) -> Option<ClientAccount> {
        self.account.clone()
    }

    fn must_accept_all_recipients(&self) -> bool {
        self.must_accept_all
    }

    fn eightbit_strict(&self) -> bool {
        self.eightbit_strict
    }

    fn smtputf8_strict(&self) -> bool {
        self.smtputf8_strict
    }

    fn bdat_chunk_size(&self) -> usize {
        self.chunk_size
    }
}

fn handshake(
    cfg: TestConfig,
    server_script: &'static [u8],
) -> (Result<Sender<TestConfig>, TransportError>, Arc<Mutex<Vec<u8>>>) {
    let out = Arc::new(Mutex::new(Vec::new()));
    let io = duplexify::Duplex::new(
        Box::pin(Cursor::new(server_script)) as Pin<Box<dyn Send + AsyncRead>>,
        Box::pin(SharedWriter(out.clone())) as Pin<Box<dyn Send + AsyncWrite>>,
    );
    let res = executor::block_on(Sender::handshake(io, Arc::new(cfg)));
    (res, out)
}

fn rcpt(addr: &str) -> Email {
    Email::parse_complete(addr).unwrap()
}

fn from(addr: &str) -> ReversePath {
    ReversePath::Mailbox(Email::parse_complete(addr).unwrap())
}

const FULL_EHLO: &[u8] = b"220 mx.example ready\r\n\
                           250-mx.example\r\n\
                           250-PIPELINING\r\n\
                           250-SIZE 1000000\r\n\
                           250-CHUNKING\r\n\
                           250-8BITMIME\r\n\
                           250-AUTH CRAM-MD5 PLAIN LOGIN\r\n\
                           250 SMTPUTF8\r\n";

#[test]
fn handshake_parses_extensions() {
    let (sender, out) = handshake(TestConfig::default(), FULL_EHLO);
    let sender = sender.unwrap();
    assert!(sender.is_esmtp());
    assert_eq!(
        out.lock().unwrap().as_slice(),
        b"EHLO relay.test\r\n" as &[u8]
    );
}

#[test]
fn helo_fallback_on_permanent_ehlo_failure() {
    let (sender, out) = handshake(
        TestConfig::default(),
        b"220 old.example ready\r\n\
          500 what is EHLO\r\n\
          250 old.example\r\n",
    );
    let sender = sender.unwrap();
    assert!(!sender.is_esmtp());
    assert_eq!(
        out.lock().unwrap().as_slice(),
        b"EHLO relay.test\r\nHELO relay.test\r\n" as &[u8]
    );
}

#[test]
fn pipelined_send_with_partial_rejection() {
    let script: &[u8] = b"220 mx ready\r\n\
                          250-mx.example\r\n\
                          250-PIPELINING\r\n\
                          250-SIZE 1000000\r\n\
                          250 8BITMIME\r\n\
                          250 sender ok\r\n\
                          250 rcpt one ok\r\n\
                          550 no such user\r\n\
                          354 go ahead\r\n\
                          250 queued\r\n";
    let (sender, out) = handshake(TestConfig::default(), script);
    let mut sender = sender.unwrap();
    let outcome = executor::block_on(sender.send(
        &from("a@x.example"),
        &[rcpt("b@y.example"), rcpt("c@y.example")],
        BodyType::SevenBit,
        b"Hi\r\n",
    ))
    .unwrap();

    assert_eq!(outcome.accepted, vec![0]);
    assert_eq!(outcome.rejected.len(), 1);
    assert_eq!(outcome.rejected[0].0, 1);
    assert_eq!(outcome.rejected[0].1.code.code(), 550);
    assert_eq!(outcome.final_reply.code.code(), 250);

    let wire = out.lock().unwrap().clone();
    let expected: &[u8] = b"EHLO relay.test\r\n\
                            MAIL FROM:<a@x.example> SIZE=4\r\n\
                            RCPT TO:<b@y.example>\r\n\
                            RCPT TO:<c@y.example>\r\n\
                            DATA\r\n\
                            Hi\r\n\
                            .\r\n";
    assert_eq!(
        String::from_utf8_lossy(&wire),
        String::from_utf8_lossy(expected)
    );
}

#[test]
fn must_accept_all_recipients_aborts() {
    let script: &[u8] = b"220 mx ready\r\n\
                          250-mx.example\r\n\
                          250 PIPELINING\r\n\
                          250 sender ok\r\n\
                          250 one ok\r\n\
                          550 no such user\r\n";
    let mut cfg = TestConfig::default();
    cfg.must_accept_all = true;
    let (sender, _) = handshake(cfg, script);
    let mut sender = sender.unwrap();
    let res = executor::block_on(sender.send(
        &from("a@x.example"),
        &[rcpt("b@y.example"), rcpt("c@y.example")],
        BodyType::SevenBit,
        b"Hi\r\n",
    ));
    assert!(matches!(res, Err(TransportError::RecipientRefused(_))));
}

#[test]
fn all_recipients_refused_is_an_error() {
    let script: &[u8] = b"220 mx ready\r\n\
                          250 mx.example\r\n\
                          250 sender ok\r\n\
                          550 no such user\r\n";
    let (sender, _) = handshake(TestConfig::default(), script);
    let mut sender = sender.unwrap();
    let res = executor::block_on(sender.send(
        &from("a@x.example"),
        &[rcpt("b@y.example")],
        BodyType::SevenBit,
        b"Hi\r\n",
    ));
    match res {
        Err(TransportError::AllRecipientsRefused(r)) => assert_eq!(r.code.code(), 550),
        other => panic!("unexpected: {:?}", other.map(|_| ())),
    }
}

#[test]
fn dot_stuffing_on_the_wire() {
    let script: &[u8] = b"220 mx ready\r\n\
                          250 mx.example\r\n\
                          250 ok\r\n\
                          250 ok\r\n\
                          354 go\r\n\
                          250 queued\r\n";
    let (sender, out) = handshake(TestConfig::default(), script);
    let mut sender = sender.unwrap();
    executor::block_on(sender.send(
        &from("a@x.example"),
        &[rcpt("b@y.example")],
        BodyType::SevenBit,
        b".hidden\r\nbody\r\n",
    ))
    .unwrap();
    let wire = out.lock().unwrap().clone();
    let text = String::from_utf8_lossy(&wire).to_string();
    assert!(text.contains("DATA\r\n..hidden\r\nbody\r\n.\r\n"), "{}", text);
}

#[test]
fn binarymime_uses_bdat_chunks() {
    let script: &[u8] = b"220 mx ready\r\n\
                          250-mx.example\r\n\
                          250-CHUNKING\r\n\
                          250 8BITMIME\r\n\
                          250 sender ok\r\n\
                          250 rcpt ok\r\n\
                          250 chunk\r\n\
                          250 chunk\r\n\
                          250 accepted\r\n";
    let mut cfg = TestConfig::default();
    cfg.chunk_size = 5;
    let (sender, out) = handshake(cfg, script);
    let mut sender = sender.unwrap();
    let outcome = executor::block_on(sender.send(
        &from("a@x.example"),
        &[rcpt("b@y.example")],
        BodyType::BinaryMime,
        b"Hello, Wrld\n",
    ))
    .unwrap();
    assert_eq!(outcome.final_reply.code.code(), 250);

    let wire = out.lock().unwrap().clone();
    let text = String::from_utf8_lossy(&wire).to_string();
    assert!(text.contains("BDAT 5\r\nHello"), "{}", text);
    assert!(text.contains("BDAT 5\r\n, Wrl"), "{}", text);
    assert!(text.contains("BDAT 2 LAST\r\nd\n"), "{}", text);
    assert!(text.contains("BODY=BINARYMIME"), "{}", text);
}

#[test]
fn eightbit_to_legacy_server() {
    let script: &[u8] = b"220 mx ready\r\n\
                          250 mx.example\r\n\
                          250 ok\r\n\
                          250 ok\r\n\
                          354 go\r\n\
                          250 queued\r\n";

    // Strict: refuse to downgrade.
    let mut cfg = TestConfig::default();
    cfg.eightbit_strict = true;
    let (sender, _) = handshake(cfg, script);
    let mut sender = sender.unwrap();
    let res = executor::block_on(sender.send(
        &from("a@x.example"),
        &[rcpt("b@y.example")],
        BodyType::EightBitMime,
        b"caf\xc3\xa9\r\n",
    ));
    assert!(matches!(res, Err(TransportError::CannotDoEightBit)));

    // Default: send anyway, with no BODY parameter.
    let (sender, out) = handshake(TestConfig::default(), script);
    let mut sender = sender.unwrap();
    executor::block_on(sender.send(
        &from("a@x.example"),
        &[rcpt("b@y.example")],
        BodyType::EightBitMime,
        b"caf\xc3\xa9\r\n",
    ))
    .unwrap();
    let text = String::from_utf8_lossy(&out.lock().unwrap().clone()).to_string();
    assert!(!text.contains("BODY="), "{}", text);
}

#[test]
fn smtputf8_downgrades_to_punycode() {
    let script: &[u8] = b"220 mx ready\r\n\
                          250-mx.example\r\n\
                          250 8BITMIME\r\n\
                          250 ok\r\n\
                          250 ok\r\n\
                          354 go\r\n\
                          250 queued\r\n";
    let (sender, out) = handshake(TestConfig::default(), script);
    let mut sender = sender.unwrap();
    executor::block_on(sender.send(
        &from("a@x.example"),
        &[rcpt("test@bücher.de")],
        BodyType::Smtputf8,
        b"hi\r\n",
    ))
    .unwrap();
    let text = String::from_utf8_lossy(&out.lock().unwrap().clone()).to_string();
    assert!(text.contains("RCPT TO:<test@xn--bcher-kva.de>"), "{}", text);
    assert!(!text.contains("SMTPUTF8"), "{}", text);

    // A non-ASCII localpart has no ASCII rendition: downgrade must fail.
    let (sender, _) = handshake(TestConfig::default(), script);
    let mut sender = sender.unwrap();
    let res = executor::block_on(sender.send(
        &from("a@x.example"),
        &[rcpt("tést@bücher.de")],
        BodyType::Smtputf8,
        b"hi\r\n",
    ));
    assert!(matches!(res, Err(TransportError::CannotDoSmtpUtf8)));
}

#[test]
fn authenticates_with_plain_initial_response() {
    let script: &[u8] = b"220 mx ready\r\n\
                          250-mx.example\r\n\
                          250 AUTH PLAIN LOGIN\r\n\
                          235 welcome\r\n";
    let mut cfg = TestConfig::default();
    cfg.account = Some(ClientAccount {
        id: "relay".into(),
        secret: "hunter2".into(),
    });
    let (sender, out) = handshake(cfg, script);
    let mut sender = sender.unwrap();
    executor::block_on(sender.authenticate("")).unwrap();
    assert_eq!(sender.authenticated_as(), Some("relay"));
    let text = String::from_utf8_lossy(&out.lock().unwrap().clone()).to_string();
    // base64("\0relay\0hunter2")
    assert!(text.contains("AUTH PLAIN AHJlbGF5AGh1bnRlcjI=\r\n"), "{}", text);
}

#[test]
fn authentication_failure_is_fatal_without_fallthrough() {
    let script: &[u8] = b"220 mx ready\r\n\
                          250-mx.example\r\n\
                          250 AUTH PLAIN\r\n\
                          535 nope\r\n";
    let mut cfg = TestConfig::default();
    cfg.account = Some(ClientAccount {
        id: "relay".into(),
        secret: "wrong".into(),
    });
    let (sender, _) = handshake(cfg, script);
    let mut sender = sender.unwrap();
    let res = executor::block_on(sender.authenticate(""));
    assert!(matches!(res, Err(TransportError::AuthenticationFailed(_))));
}

#[test]
fn destination_route_parsing() {
    let d = Destination::from_route("smarthost.example:587");
    assert_eq!((d.host.as_str(), d.port, d.use_mx), ("smarthost.example", 587, false));
    let d = Destination::from_route("smarthost.example");
    assert_eq!((d.host.as_str(), d.port, d.use_mx), ("smarthost.example", 25, false));
    let d = Destination::from_domain("y.example");
    assert_eq!((d.host.as_str(), d.port, d.use_mx), ("y.example", 25, true));
    assert_eq!(Destination::from_route("mx.example:587").to_string(), "mx.example:587");
}
