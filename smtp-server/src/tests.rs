use super::*;

use std::{
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

use futures::{executor, io::Cursor};

use smtp_auth::Secrets;

/// Used as `println!("{:?}", show_bytes(b))`
fn show_bytes(b: &[u8]) -> String {
    if b.len() > 2048 {
        format!("{{too long, size = {}}}", b.len())
    } else if let Ok(s) = std::str::from_utf8(b) {
        s.into()
    } else {
        format!("{:?}", b)
    }
}

/// AsyncWrite into a shared buffer, so the response bytes survive the
/// session future.
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

type StoredMail = (String, Vec<String>, Vec<u8>);

struct TestConfig {
    mails: Arc<Mutex<Vec<StoredMail>>>,
    auth: Option<ServerAuth>,
    require_auth: bool,
    error_limit: u32,
}

impl TestConfig {
    fn new(mails: Arc<Mutex<Vec<StoredMail>>>) -> TestConfig {
        TestConfig {
            mails,
            auth: None,
            require_auth: false,
            error_limit: 8,
        }
    }

    fn with_auth(mails: Arc<Mutex<Vec<StoredMail>>>, require: bool) -> TestConfig {
        let secrets = Secrets::parse("plain server alice sesame", "test").unwrap();
        TestConfig {
            mails,
            auth: Some(ServerAuth::new(secrets, "test.example.org")),
            require_auth: require,
            error_limit: 8,
        }
    }
}

#[async_trait]
impl Config for TestConfig {
    type ConnectionUserMeta = ();
    type Message = Vec<u8>;

    fn hostname(&self) -> &str {
        "test.example.org"
    }

    fn max_size(&self) -> u64 {
        1000
    }

    fn error_limit(&self) -> u32 {
        self.error_limit
    }

    fn require_auth(&self) -> bool {
        self.require_auth
    }

    fn auth(&self) -> Option<&ServerAuth> {
        self.auth.as_ref()
    }

    async fn tls_accept(
        &self,
        _io: DynIo,
        _conn_meta: &mut ConnectionMetadata<()>,
    ) -> io::Result<(DynIo, String)> {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "tls accept not implemented for tests",
        ))
    }

    async fn verify(
        &self,
        rcpt: &Email,
        _txn: &MailTransaction,
        _conn_meta: &mut ConnectionMetadata<()>,
    ) -> VerifyOutcome {
        if rcpt.localpart.raw() == "baz" {
            VerifyOutcome::Rejected {
                reply: Reply::new(ReplyCode::MAILBOX_UNAVAILABLE, "no user 'baz'"),
            }
        } else if rcpt.localpart.raw() == "hole" {
            VerifyOutcome::Blackhole
        } else if rcpt.hostname.as_ref().map(|h| h.raw()) == Some("local.example") {
            VerifyOutcome::Local {
                mailbox: rcpt.localpart.raw().to_owned(),
            }
        } else {
            VerifyOutcome::Remote {
                address: rcpt.clone(),
                forward_to: None,
            }
        }
    }

    async fn message_open(
        &self,
        _txn: &MailTransaction,
        _conn_meta: &mut ConnectionMetadata<()>,
    ) -> io::Result<Vec<u8>> {
        Ok(Vec::new())
    }

    async fn message_write(&self, msg: &mut Vec<u8>, data: Vec<u8>) -> io::Result<()> {
        msg.extend_from_slice(&data);
        Ok(())
    }

    async fn message_finish(
        &self,
        msg: Vec<u8>,
        txn: MailTransaction,
        _conn_meta: &mut ConnectionMetadata<()>,
    ) -> io::Result<MessageOutcome> {
        if msg.windows(5).any(|w| w == b"World") {
            return Ok(MessageOutcome::Rejected {
                code: 550,
                text: "don't you dare say 'World'!".to_owned(),
            });
        }
        let mut to = txn.to_local.clone();
        to.extend(txn.to_remote.iter().map(|e| e.to_string()));
        self.mails
            .lock()
            .unwrap()
            .push((txn.from.to_string(), to, msg));
        Ok(MessageOutcome::Accepted { id: "42".to_owned() })
    }

    async fn message_abort(&self, _msg: Vec<u8>) {}
}

fn run_session(cfg: TestConfig, input: &'static [u8]) -> (io::Result<()>, Vec<u8>) {
    let out = Arc::new(Mutex::new(Vec::new()));
    let io = duplexify::Duplex::new(Cursor::new(input), SharedWriter(out.clone()));
    let res = executor::block_on(interact(
        io,
        IsAlreadyTls::No,
        "192.0.2.9:55555".to_owned(),
        (),
        Arc::new(cfg),
    ));
    let bytes = out.lock().unwrap().clone();
    (res, bytes)
}

const EHLO_REPLY: &str = "250-test.example.org\r\n\
                          250-SIZE 1000\r\n\
                          250-8BITMIME\r\n\
                          250-PIPELINING\r\n\
                          250-CHUNKING\r\n\
                          250-BINARYMIME\r\n\
                          250 SMTPUTF8\r\n";

const BANNER: &str = "220 test.example.org ESMTP service ready\r\n";

#[test]
fn happy_path_single_message() {
    let mails = Arc::new(Mutex::new(Vec::new()));
    let (res, out) = run_session(
        TestConfig::new(mails.clone()),
        b"EHLO foo\r\n\
          MAIL FROM:<a@x>\r\n\
          RCPT TO:<b@y>\r\n\
          DATA\r\n\
          Hello\r\n\
          .\r\n\
          QUIT\r\n",
    );
    res.unwrap();
    let expected = format!(
        "{}{}250 OK\r\n\
         250 OK\r\n\
         354 start mail input; end with <CRLF>.<CRLF>\r\n\
         250 OK id=42\r\n\
         221 test.example.org closing connection\r\n",
        BANNER, EHLO_REPLY
    );
    println!("expected:\n{}\ngot:\n{}", expected, show_bytes(&out));
    assert_eq!(out, expected.as_bytes());

    let mails = mails.lock().unwrap();
    assert_eq!(mails.len(), 1);
    assert_eq!(mails[0].0, "a@x");
    assert_eq!(mails[0].1, vec!["b@y"]);
    assert_eq!(mails[0].2, b"Hello\r\n");
}

#[test]
fn pipelined_batch_with_one_reject() {
    let mails = Arc::new(Mutex::new(Vec::new()));
    let (res, out) = run_session(
        TestConfig::new(mails.clone()),
        b"EHLO foo\r\n\
          MAIL FROM:<a@x>\r\nRCPT TO:<ok@y>\r\nRCPT TO:<baz@y>\r\nDATA\r\n\
          Hello\r\n\
          .\r\n\
          QUIT\r\n",
    );
    res.unwrap();
    let expected = format!(
        "{}{}250 OK\r\n\
         250 OK\r\n\
         550 no user 'baz'\r\n\
         354 start mail input; end with <CRLF>.<CRLF>\r\n\
         250 OK id=42\r\n\
         221 test.example.org closing connection\r\n",
        BANNER, EHLO_REPLY
    );
    println!("expected:\n{}\ngot:\n{}", expected, show_bytes(&out));
    assert_eq!(out, expected.as_bytes());
    assert_eq!(mails.lock().unwrap()[0].1, vec!["ok@y"]);
}

#[test]
fn bdat_chunking() {
    let mails = Arc::new(Mutex::new(Vec::new()));
    let (res, out) = run_session(
        TestConfig::new(mails.clone()),
        b"EHLO foo\r\n\
          MAIL FROM:<a@x> BODY=BINARYMIME\r\n\
          RCPT TO:<b@y>\r\n\
          BDAT 5\r\nHelloBDAT 7 LAST\r\n, Wrld\nQUIT\r\n",
    );
    res.unwrap();
    let expected = format!(
        "{}{}250 OK\r\n\
         250 OK\r\n\
         250 OK\r\n\
         250 Message accepted id=42\r\n\
         221 test.example.org closing connection\r\n",
        BANNER, EHLO_REPLY
    );
    println!("expected:\n{}\ngot:\n{}", expected, show_bytes(&out));
    assert_eq!(out, expected.as_bytes());

    let mails = mails.lock().unwrap();
    assert_eq!(mails[0].2, b"Hello, Wrld\n");
    assert_eq!(mails[0].2.len(), 12);
}

#[test]
fn bdat_zero_last_is_empty_data() {
    let mails = Arc::new(Mutex::new(Vec::new()));
    let (res, out) = run_session(
        TestConfig::new(mails.clone()),
        b"EHLO foo\r\n\
          MAIL FROM:<a@x>\r\n\
          RCPT TO:<b@y>\r\n\
          BDAT 0 LAST\r\n\
          QUIT\r\n",
    );
    res.unwrap();
    assert!(show_bytes(&out).contains("250 Message accepted id=42"));
    assert_eq!(mails.lock().unwrap()[0].2, b"");
}

#[test]
fn data_after_bdat_is_bad_sequence() {
    let mails = Arc::new(Mutex::new(Vec::new()));
    let (res, out) = run_session(
        TestConfig::new(mails),
        b"EHLO foo\r\n\
          MAIL FROM:<a@x>\r\n\
          RCPT TO:<b@y>\r\n\
          BDAT 2\r\nhiDATA\r\n\
          QUIT\r\n",
    );
    res.unwrap();
    assert!(show_bytes(&out).contains("503 bad sequence of commands"));
}

#[test]
fn mail_before_ehlo_is_bad_sequence() {
    let mails = Arc::new(Mutex::new(Vec::new()));
    let (res, out) = run_session(TestConfig::new(mails), b"MAIL FROM:<a@x>\r\nQUIT\r\n");
    res.unwrap();
    assert!(show_bytes(&out).contains("503 bad sequence of commands"));
}

#[test]
fn rcpt_before_mail_is_bad_sequence() {
    let mails = Arc::new(Mutex::new(Vec::new()));
    let (res, out) = run_session(
        TestConfig::new(mails),
        b"EHLO foo\r\nRCPT TO:<b@y>\r\nQUIT\r\n",
    );
    res.unwrap();
    assert!(show_bytes(&out).contains("503 bad sequence of commands"));
}

#[test]
fn data_without_rcpt_is_bad_sequence() {
    let mails = Arc::new(Mutex::new(Vec::new()));
    let (res, out) = run_session(
        TestConfig::new(mails),
        b"EHLO foo\r\nMAIL FROM:<a@x>\r\nDATA\r\nQUIT\r\n",
    );
    res.unwrap();
    assert!(show_bytes(&out).contains("503 bad sequence of commands"));
}

#[test]
fn oversize_declaration_rejected() {
    let mails = Arc::new(Mutex::new(Vec::new()));
    let (res, out) = run_session(
        TestConfig::new(mails),
        b"EHLO foo\r\nMAIL FROM:<a@x> SIZE=5000\r\nQUIT\r\n",
    );
    res.unwrap();
    assert!(show_bytes(&out).contains("552 message size exceeds fixed maximum"));
}

#[test]
fn message_rejected_by_content_filter() {
    let mails = Arc::new(Mutex::new(Vec::new()));
    let (res, out) = run_session(
        TestConfig::new(mails.clone()),
        b"EHLO foo\r\n\
          MAIL FROM:<a@x>\r\n\
          RCPT TO:<b@y>\r\n\
          DATA\r\n\
          Hello World\r\n\
          .\r\n\
          QUIT\r\n",
    );
    res.unwrap();
    assert!(show_bytes(&out).contains("550 don't you dare say 'World'!"));
    assert!(mails.lock().unwrap().is_empty());
}

#[test]
fn blackholed_recipients_accepted_and_dropped() {
    let mails = Arc::new(Mutex::new(Vec::new()));
    let (res, out) = run_session(
        TestConfig::new(mails.clone()),
        b"EHLO foo\r\n\
          MAIL FROM:<a@x>\r\n\
          RCPT TO:<hole@y>\r\n\
          DATA\r\n\
          vanishes\r\n\
          .\r\n\
          QUIT\r\n",
    );
    res.unwrap();
    let s = show_bytes(&out);
    assert!(s.contains("354"));
    // Accepted on the wire, stored nowhere.
    assert_eq!(s.matches("250 OK\r\n").count(), 3);
    assert!(mails.lock().unwrap().is_empty());
}

#[test]
fn local_recipients_partitioned() {
    let mails = Arc::new(Mutex::new(Vec::new()));
    let (res, _) = run_session(
        TestConfig::new(mails.clone()),
        b"EHLO foo\r\n\
          MAIL FROM:<a@x>\r\n\
          RCPT TO:<alice@local.example>\r\n\
          RCPT TO:<b@y>\r\n\
          DATA\r\nhi\r\n.\r\nQUIT\r\n",
    );
    res.unwrap();
    let mails = mails.lock().unwrap();
    // Local mailbox name first, then the remote address.
    assert_eq!(mails[0].1, vec!["alice", "b@y"]);
}

#[test]
fn error_limit_drops_connection() {
    let mails = Arc::new(Mutex::new(Vec::new()));
    let mut cfg = TestConfig::new(mails);
    cfg.error_limit = 3;
    let (res, out) = run_session(cfg, b"WIBBLE\r\nWOBBLE\r\nWUBBLE\r\nNOOP\r\n");
    assert!(res.is_err());
    let s = show_bytes(&out);
    assert!(s.contains("421 too many errors, closing connection"));
    // The third bad command is answered by the 421, not a 500.
    assert_eq!(s.matches("500").count(), 2);
}

#[test]
fn auth_login_exchange_then_mail() {
    let mails = Arc::new(Mutex::new(Vec::new()));
    let (res, out) = run_session(
        TestConfig::with_auth(mails.clone(), true),
        b"EHLO foo\r\n\
          MAIL FROM:<a@x>\r\n\
          AUTH LOGIN\r\n\
          YWxpY2U=\r\n\
          c2VzYW1l\r\n\
          EHLO again\r\n\
          MAIL FROM:<a@x>\r\n\
          RCPT TO:<b@y>\r\n\
          DATA\r\nhi\r\n.\r\nQUIT\r\n",
    );
    res.unwrap();
    let s = show_bytes(&out);
    assert!(s.contains("AUTH CRAM-MD5 PLAIN LOGIN"));
    // MAIL before AUTH is refused when authentication is mandatory.
    assert!(s.contains("530 authentication required"));
    assert!(s.contains("334 VXNlcm5hbWU6"));
    assert!(s.contains("334 UGFzc3dvcmQ6"));
    assert!(s.contains("235 authentication successful"));
    // EHLO reset the transaction but kept the identity: MAIL now passes.
    assert!(s.contains("250 OK id=42"));
    assert_eq!(mails.lock().unwrap().len(), 1);
}

#[test]
fn auth_plain_initial_response() {
    let mails = Arc::new(Mutex::new(Vec::new()));
    // base64("\0alice\0sesame")
    let (res, out) = run_session(
        TestConfig::with_auth(mails, false),
        b"EHLO foo\r\nAUTH PLAIN AGFsaWNlAHNlc2FtZQ==\r\nQUIT\r\n",
    );
    res.unwrap();
    assert!(show_bytes(&out).contains("235 authentication successful"));
}

#[test]
fn auth_cancel_with_star() {
    let mails = Arc::new(Mutex::new(Vec::new()));
    let (res, out) = run_session(
        TestConfig::with_auth(mails, false),
        b"EHLO foo\r\nAUTH LOGIN\r\n*\r\nQUIT\r\n",
    );
    res.unwrap();
    assert!(show_bytes(&out).contains("501 authentication cancelled"));
}

#[test]
fn auth_bad_password_rejected() {
    let mails = Arc::new(Mutex::new(Vec::new()));
    let (res, out) = run_session(
        TestConfig::with_auth(mails, false),
        b"EHLO foo\r\nAUTH PLAIN AGFsaWNlAHdyb25n\r\nQUIT\r\n",
    );
    res.unwrap();
    assert!(show_bytes(&out).contains("535 authentication failed"));
}

#[test]
fn unknown_mechanism_rejected() {
    let mails = Arc::new(Mutex::new(Vec::new()));
    let (res, out) = run_session(
        TestConfig::with_auth(mails, false),
        b"EHLO foo\r\nAUTH SCRAM-SHA-256\r\nQUIT\r\n",
    );
    res.unwrap();
    assert!(show_bytes(&out).contains("504 mechanism not supported"));
}

#[test]
fn starttls_unavailable() {
    let mails = Arc::new(Mutex::new(Vec::new()));
    let (res, out) = run_session(
        TestConfig::new(mails),
        b"EHLO foo\r\nSTARTTLS\r\nQUIT\r\n",
    );
    res.unwrap();
    assert!(show_bytes(&out).contains("502 STARTTLS not available"));
}

#[test]
fn dot_stuffing_removed_and_lone_dot_never_delivered() {
    let mails = Arc::new(Mutex::new(Vec::new()));
    let (res, _) = run_session(
        TestConfig::new(mails.clone()),
        b"EHLO foo\r\n\
          MAIL FROM:<a@x>\r\n\
          RCPT TO:<b@y>\r\n\
          DATA\r\n\
          ..twodots\r\n\
          middle\r\n\
          .\r\n\
          QUIT\r\n",
    );
    res.unwrap();
    let mails = mails.lock().unwrap();
    assert_eq!(mails[0].2, b".twodots\r\nmiddle\r\n");
}

#[test]
fn replies_form_a_legal_sequence() {
    // Every reply line starts with three digits; multi-line replies carry
    // the dash on all but the last line.
    let mails = Arc::new(Mutex::new(Vec::new()));
    let (res, out) = run_session(
        TestConfig::new(mails),
        b"EHLO foo\r\nNOOP\r\nHELP\r\nVRFY whatever\r\nQUIT\r\n",
    );
    res.unwrap();
    let text = String::from_utf8(out).unwrap();
    let mut acc = smtp_message::ReplyAccumulator::new();
    for line in text.split("\r\n").filter(|l| !l.is_empty()) {
        acc.add_line(line).unwrap();
    }
}
