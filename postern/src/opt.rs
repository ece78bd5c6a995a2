use std::{net::IpAddr, path::PathBuf};

use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "postern",
    about = "A small store-and-forward SMTP relay: accepts submissions, spools \
             them as envelope/content pairs, filters them, and forwards them \
             upstream or into local mailboxes."
)]
pub struct Opt {
    /// SMTP submission port
    #[structopt(long, default_value = "25")]
    pub port: u16,

    /// Address to listen on
    #[structopt(long, default_value = "0.0.0.0")]
    pub listen: IpAddr,

    /// Hostname used in the banner, EHLO responses and Received headers
    #[structopt(long, default_value = "postern.localdomain")]
    pub hostname: String,

    /// Spool directory
    #[structopt(long, parse(from_os_str), default_value = "/var/spool/postern")]
    pub spool_dir: PathBuf,

    /// Default upstream server, as host or host:port
    #[structopt(long, value_name = "host:port")]
    pub forward_to: Option<String>,

    /// Input filter specifier (exit:N, file:PATH, net:HOST:PORT,
    /// spam:HOST:PORT, spam-edit:HOST:PORT, or a comma-separated chain)
    #[structopt(long, value_name = "spec")]
    pub filter: Option<String>,

    /// Outbound per-message filter specifier
    #[structopt(long, value_name = "spec")]
    pub client_filter: Option<String>,

    /// Recipient verifier specifier (file:PATH or net:HOST:PORT; the
    /// built-in verifier classifies against --domain)
    #[structopt(long, value_name = "spec")]
    pub address_verifier: Option<String>,

    /// Domains considered local, repeatable
    #[structopt(long = "domain", value_name = "domain")]
    pub domains: Vec<String>,

    /// Base directory for local mailboxes
    #[structopt(long, parse(from_os_str), value_name = "dir")]
    pub deliver_to: Option<PathBuf>,

    /// Use the Maildir layout for local mailboxes
    #[structopt(long)]
    pub maildir: bool,

    /// Accept connections from non-localhost clients
    #[structopt(long)]
    pub remote_clients: bool,

    /// Advertise and accept STARTTLS (requires --tls-config)
    #[structopt(long)]
    pub tls: bool,

    /// TLS server certificate and key PEM files
    #[structopt(long, value_name = "cert-file,key-file")]
    pub tls_config: Option<String>,

    /// Server-side SASL secrets file; enables AUTH
    #[structopt(long, parse(from_os_str), value_name = "file")]
    pub server_auth: Option<PathBuf>,

    /// Require authentication before MAIL
    #[structopt(long)]
    pub require_auth: bool,

    /// Client-side SASL secrets file, used towards upstream servers
    #[structopt(long, parse(from_os_str), value_name = "file")]
    pub client_auth: Option<PathBuf>,

    /// Forward spooled mail every this many seconds
    #[structopt(long, value_name = "sec")]
    pub poll: Option<u64>,

    /// Forward spooled mail whenever a submitting client disconnects
    #[structopt(long)]
    pub forward_on_disconnect: bool,

    /// Maximum message size advertised via EHLO SIZE
    #[structopt(long, default_value = "10000000", value_name = "bytes")]
    pub size_limit: u64,

    /// Delivery attempts before a message is parked as bad
    #[structopt(long, default_value = "8")]
    pub retry_limit: u32,

    /// DNS blocklist domains, repeatable
    #[structopt(long = "dnsbl", value_name = "domain")]
    pub dnsbl: Vec<String>,

    /// Blocklist hits required to deny a connection
    #[structopt(long, default_value = "1")]
    pub dnsbl_threshold: usize,

    /// Log to this file instead of stderr (the POSTERN_LOG environment
    /// variable overrides it)
    #[structopt(long, parse(from_os_str), value_name = "file")]
    pub log_file: Option<PathBuf>,

    /// Log level: 0 warnings, 1 info, 2 debug, 3 trace
    #[structopt(long, default_value = "1")]
    pub log_level: u8,

    /// Shorthand for --log-level 2
    #[structopt(short, long)]
    pub verbose: bool,
}

impl Opt {
    /// Cross-flag validation; violations are fatal configuration errors.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.tls && self.tls_config.is_none() {
            anyhow::bail!("--tls requires --tls-config");
        }
        if let Some(tc) = &self.tls_config {
            if tc.splitn(2, ',').count() != 2 {
                anyhow::bail!("--tls-config wants ‘cert-file,key-file’");
            }
        }
        if self.require_auth && self.server_auth.is_none() {
            anyhow::bail!("--require-auth needs --server-auth");
        }
        if !self.domains.is_empty() && self.deliver_to.is_none() {
            anyhow::bail!("--domain needs --deliver-to for local delivery");
        }
        if self.dnsbl_threshold == 0 {
            anyhow::bail!("--dnsbl-threshold must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Opt {
        Opt::from_iter_safe(std::iter::once("postern").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn defaults() {
        let opt = parse(&[]);
        assert_eq!(opt.port, 25);
        assert_eq!(opt.size_limit, 10_000_000);
        assert_eq!(opt.retry_limit, 8);
        assert!(opt.validate().is_ok());
    }

    #[test]
    fn repeatable_flags() {
        let opt = parse(&[
            "--domain", "a.example",
            "--domain", "b.example",
            "--deliver-to", "/tmp/mail",
            "--dnsbl", "zen.example",
        ]);
        assert_eq!(opt.domains, vec!["a.example", "b.example"]);
        assert_eq!(opt.dnsbl, vec!["zen.example"]);
        assert!(opt.validate().is_ok());
    }

    #[test]
    fn validation_catches_inconsistencies() {
        assert!(parse(&["--tls"]).validate().is_err());
        assert!(parse(&["--require-auth"]).validate().is_err());
        assert!(parse(&["--domain", "a.example"]).validate().is_err());
        assert!(parse(&["--tls", "--tls-config", "cert.pem,key.pem"])
            .validate()
            .is_ok());
    }

    #[test]
    fn unknown_flag_is_a_usage_error() {
        assert!(Opt::from_iter_safe(&["postern", "--wibble"]).is_err());
    }
}
