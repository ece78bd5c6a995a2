//! Wiring: configuration, TLS, the listener, and the forwarder task.

use std::{convert::TryFrom, io::BufReader, sync::Arc};

use anyhow::Context;
use futures::io::AsyncWriteExt;
use tracing::{debug, info};

use smtp_auth::{Secrets, ServerAuth};
use smtp_client::Client;
use smtp_spool::Spool;

mod client_glue;
mod deliver;
mod dnsbl;
mod filter;
mod forward;
mod opt;
mod server_glue;
mod verify;

pub use opt::Opt;

use client_glue::ClientGlue;
use deliver::Deliverer;
use dnsbl::DnsBlocklist;
use filter::FilterSpec;
use forward::Forwarder;
use server_glue::ServerGlue;
use verify::{Verifier, VerifierSpec};

struct NoCertVerifier;

impl rustls::ServerCertVerifier for NoCertVerifier {
    fn verify_server_cert(
        &self,
        _roots: &rustls::RootCertStore,
        _presented_certs: &[rustls::Certificate],
        _dns_name: webpki::DNSNameRef<'_>,
        _ocsp_response: &[u8],
    ) -> Result<rustls::ServerCertVerified, rustls::TLSError> {
        Ok(rustls::ServerCertVerified::assertion())
    }
}

fn load_acceptor(tls_config: &str) -> anyhow::Result<async_tls::TlsAcceptor> {
    let mut parts = tls_config.splitn(2, ',');
    let cert_file = parts.next().unwrap_or_default();
    let key_file = parts
        .next()
        .ok_or_else(|| anyhow::anyhow!("--tls-config wants ‘cert-file,key-file’"))?;

    let certs = rustls_pemfile::certs(&mut BufReader::new(
        std::fs::File::open(cert_file)
            .with_context(|| format!("opening the certificate file ‘{}’", cert_file))?,
    ))
    .with_context(|| format!("parsing the certificate file ‘{}’", cert_file))?
    .into_iter()
    .map(rustls::Certificate)
    .collect::<Vec<_>>();
    anyhow::ensure!(!certs.is_empty(), "no certificates in ‘{}’", cert_file);

    let keys = rustls_pemfile::pkcs8_private_keys(&mut BufReader::new(
        std::fs::File::open(key_file)
            .with_context(|| format!("opening the key file ‘{}’", key_file))?,
    ))
    .with_context(|| format!("parsing the key file ‘{}’", key_file))?;
    anyhow::ensure!(
        keys.len() == 1,
        "expected exactly one key in ‘{}’, found {}",
        key_file,
        keys.len()
    );
    let key = rustls::PrivateKey(keys.into_iter().next().unwrap());

    let mut cfg = rustls::ServerConfig::new(rustls::NoClientAuth::new());
    cfg.set_single_cert(certs, key)
        .context("setting the key and certificates")?;
    Ok(async_tls::TlsAcceptor::from(cfg))
}

fn client_connector() -> async_tls::TlsConnector {
    let mut cfg = rustls::ClientConfig::new();
    cfg.dangerous()
        .set_certificate_verifier(Arc::new(NoCertVerifier));
    async_tls::TlsConnector::from(cfg)
}

pub fn run(opt: &Opt, shutdown: smol::channel::Receiver<()>) -> anyhow::Result<()> {
    opt.validate()?;
    info!("postern starting up");

    let listener = std::net::TcpListener::bind((opt.listen, opt.port))
        .with_context(|| format!("binding {}:{}", opt.listen, opt.port))?;

    let ex = Arc::new(smol::Executor::new());
    let ex2 = ex.clone();
    smol::block_on(ex2.run(serve(opt, listener, shutdown, ex)))
}

async fn serve(
    opt: &Opt,
    listener: std::net::TcpListener,
    shutdown: smol::channel::Receiver<()>,
    ex: Arc<smol::Executor<'_>>,
) -> anyhow::Result<()> {
    // Callout specifiers; misconfiguration is fatal before the first
    // connection is accepted.
    let input_filter = match &opt.filter {
        Some(spec) => filter::checked(FilterSpec::parse(spec)?)?,
        None => FilterSpec::Exit(0),
    };
    let client_filter = match &opt.client_filter {
        Some(spec) => filter::checked(FilterSpec::parse(spec)?)?,
        None => FilterSpec::Exit(0),
    };
    let verifier_spec = match &opt.address_verifier {
        Some(spec) => VerifierSpec::parse(spec)?,
        None => VerifierSpec::Builtin,
    };

    let server_secrets = opt
        .server_auth
        .as_ref()
        .map(|p| Secrets::load(p))
        .transpose()
        .context("loading the server secrets file")?;
    let client_secrets = opt
        .client_auth
        .as_ref()
        .map(|p| Secrets::load(p))
        .transpose()
        .context("loading the client secrets file")?;

    let spool = Arc::new(
        Spool::open(opt.spool_dir.clone(), "postern", opt.retry_limit)
            .await
            .context("opening the spool directory")?,
    );
    let report = spool.sweep().await.context("sweeping the spool")?;
    info!(
        unlocked = report.unlocked,
        orphans = report.orphans_removed,
        corrupt = report.corrupt,
        "spool swept"
    );

    let acceptor = match (&opt.tls, &opt.tls_config) {
        (true, Some(tc)) => Some(load_acceptor(tc)?),
        _ => None,
    };

    let resolver = async_std_resolver::resolver_from_system_conf()
        .await
        .context("configuring a resolver from system configuration")?;

    let (wake_tx, wake_rx) = smol::channel::unbounded::<()>();

    // The forwarder drains the spool on its own schedule.
    let forwarder = Forwarder {
        spool: spool.clone(),
        client: Client::new(
            resolver.clone(),
            Arc::new(ClientGlue::new(
                opt.hostname.clone(),
                client_connector(),
                client_secrets,
            )),
        ),
        default_route: opt.forward_to.clone(),
        client_filter,
        deliverer: opt
            .deliver_to
            .as_ref()
            .map(|p| Deliverer::new(p.clone(), opt.maildir)),
    };
    let poll = opt.poll;
    ex.spawn(async move { forwarder.run(poll, wake_rx).await })
        .detach();

    let dnsbl = DnsBlocklist::new(resolver, opt.dnsbl.clone(), opt.dnsbl_threshold);

    let server_cfg = Arc::new(ServerGlue {
        hostname: opt.hostname.clone(),
        size_limit: opt.size_limit,
        require_auth: opt.require_auth,
        spool,
        auth: server_secrets.map(|s| ServerAuth::new(s, opt.hostname.clone())),
        acceptor,
        verifier: Verifier::new(verifier_spec, opt.domains.clone()),
        filter: input_filter,
    });

    let listener = smol::net::TcpListener::try_from(listener).context("making listener async")?;
    info!(port = opt.port, "server up, waiting for connections");

    let accept_loop = async {
        loop {
            let (stream, peer) = listener.accept().await.context("accepting a connection")?;
            debug!(peer = %peer, "incoming connection");

            if !opt.remote_clients && !peer.ip().is_loopback() {
                info!(peer = %peer, "refusing non-local client");
                ex.spawn(refuse(stream, "554 access denied\r\n")).detach();
                continue;
            }
            if dnsbl.is_configured() && dnsbl.is_blocked(peer.ip()).await {
                info!(peer = %peer, "refusing blocklisted client");
                ex.spawn(refuse(stream, "554 access denied\r\n")).detach();
                continue;
            }

            let cfg = server_cfg.clone();
            let wake = wake_tx.clone();
            let forward_on_disconnect = opt.forward_on_disconnect;
            ex.spawn(async move {
                let res = smtp_server::interact(
                    stream,
                    smtp_server::IsAlreadyTls::No,
                    peer.to_string(),
                    (),
                    cfg,
                )
                .await;
                if let Err(e) = res {
                    info!(peer = %peer, error = %e, "session ended with an error");
                }
                if forward_on_disconnect {
                    let _ = wake.try_send(());
                }
            })
            .detach();
        }
    };

    smol::future::or(accept_loop, async {
        let _ = shutdown.recv().await;
        info!("shutting down");
        Ok(())
    })
    .await
}

async fn refuse(mut stream: smol::net::TcpStream, line: &'static str) {
    let _ = stream.write_all(line.as_bytes()).await;
    let _ = stream.close().await;
}
