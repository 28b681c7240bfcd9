//! TLS connector for the Line Client.
//!
//! `tokio-tls` 0.3 (wrapping the unmaintained `native-tls` 0.1 generation)
//! predates async/await and is no longer maintained upstream. `tokio-rustls`
//! + `webpki-roots` serves the identical "wrap a TcpStream in TLS" role and
//! is the stack `Terkwood-quinn` uses for the same purpose; this is a
//! like-for-like crate swap, not a new concern, and is recorded in
//! DESIGN.md.

use std::sync::Arc;
use std::time::Duration;

use rustls::ClientConfig;
use tokio::net::TcpStream;
use tokio_rustls::webpki::DNSNameRef;
use tokio_rustls::{client::TlsStream, TlsConnector};

use crate::errors::Error;

/// Builds a `TlsConnector` trusting the Mozilla root set, matching what a
/// stock `irc.chat.twitch.tv:6697` client needs and nothing more.
pub fn connector() -> TlsConnector {
    let mut config = ClientConfig::new();
    config
        .root_store
        .add_server_trust_anchors(&webpki_roots::TLS_SERVER_ROOTS);
    TlsConnector::from(Arc::new(config))
}

/// Connect a TLS-wrapped socket to `host:port`, with TCP keepalive applied
/// to the underlying socket before the handshake.
pub async fn connect_tls(
    connector: &TlsConnector,
    host: &str,
    addr: &str,
    keepalive: Duration,
) -> Result<TlsStream<TcpStream>, Error> {
    let tcp = TcpStream::connect(addr).await?;
    tcp.set_keepalive(Some(keepalive)).ok();
    let dns_name = DNSNameRef::try_from_ascii_str(host)
        .map_err(|e| Error::Tls(Box::new(e)))?;
    connector
        .connect(dns_name, tcp)
        .await
        .map_err(|e| Error::Tls(Box::new(e)))
}
