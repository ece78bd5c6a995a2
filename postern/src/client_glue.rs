//! Binds the client protocol engine to the local configuration: EHLO name,
//! outbound TLS and the client-side SASL accounts.

use std::{io, pin::Pin};

use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite};

use smtp_auth::{ClientAccount, Secrets};
use smtp_client::DynIo;

pub struct ClientGlue {
    hostname: String,
    connector: async_tls::TlsConnector,
    secrets: Option<Secrets>,
}

impl ClientGlue {
    pub fn new(
        hostname: String,
        connector: async_tls::TlsConnector,
        secrets: Option<Secrets>,
    ) -> ClientGlue {
        ClientGlue {
            hostname,
            connector,
            secrets,
        }
    }
}

#[async_trait]
impl smtp_client::Config for ClientGlue {
    fn ehlo_hostname(&self) -> String {
        self.hostname.clone()
    }

    async fn tls_connect(&self, io: DynIo) -> io::Result<DynIo> {
        // Upstream certificates are not verified: the relay typically talks
        // to a smarthost it does not control the PKI of, and opportunistic
        // TLS still beats plaintext.
        let stream = self.connector.connect("upstream", io).await?;
        let (r, w) = stream.split();
        Ok(duplexify::Duplex::new(
            Box::pin(r) as Pin<Box<dyn Send + AsyncRead>>,
            Box::pin(w) as Pin<Box<dyn Send + AsyncWrite>>,
        ))
    }

    fn client_account(&self, selector: &str) -> Option<ClientAccount> {
        self.secrets
            .as_ref()
            .and_then(|s| s.client_account(selector))
            .cloned()
    }
}
