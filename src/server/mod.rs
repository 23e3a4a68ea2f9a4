//! LDAP server: listener, per-connection protocol and pluggable handlers.

mod bind;
mod dispatch;
mod extended;
pub mod handler;
pub mod memory;
pub mod paging;
pub mod protocol;
pub mod root_dse;
mod search;

pub use handler::{
    HandlerFactory, Handlers, PagingHandler, PagingResponse, RequestContext, RequestHandler, RootDseHandler,
    SearchOutcome, Token,
};
pub use memory::MemoryDirectory;
pub use paging::{PagingRegistry, PagingRequest};
pub use protocol::ServerProtocol;

use crate::config::ServerOptions;
use crate::metrics::Metrics;
use crate::queue::Queue;
use crate::transport::{TlsUpgrade, Transport};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

pub struct LdapServer {
    options: Arc<ServerOptions>,
    factory: Arc<dyn HandlerFactory>,
    metrics: Arc<Metrics>,
    tls_config: Option<Arc<rustls::ServerConfig>>,
}

impl LdapServer {
    pub fn new(
        options: ServerOptions,
        factory: Arc<dyn HandlerFactory>,
        metrics: Arc<Metrics>,
        tls_config: Option<Arc<rustls::ServerConfig>>,
    ) -> Self {
        Self {
            options: Arc::new(options),
            factory,
            metrics,
            tls_config,
        }
    }

    pub async fn start(&self) -> Result<()> {
        let addr = parse_listen_url(&self.options.listen)?;
        info!("Starting LDAP server on {}", addr);

        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))?;
        self.run(listener).await
    }

    /// Accept loop over an already bound listener.
    pub async fn run(&self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr().context("Listener address")?;
        info!(
            "LDAP server listening on {} ({})",
            addr,
            if self.options.is_ldaps() { "ldaps" } else { "ldap" }
        );
        if self.options.is_ldaps() && self.tls_config.is_none() {
            anyhow::bail!("LDAPS listener requires a TLS configuration");
        }

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    debug!("New connection from {}", peer_addr);
                    let options = Arc::clone(&self.options);
                    let handlers = Handlers::from_factory(self.factory.as_ref());
                    let metrics = Arc::clone(&self.metrics);
                    let tls_config = self.tls_config.clone();

                    tokio::spawn(async move {
                        let mut transport = Transport::tcp(stream);
                        if options.is_ldaps() {
                            let Some(config) = tls_config.clone() else {
                                return;
                            };
                            transport = match transport.upgrade(TlsUpgrade::server(config)).await {
                                Ok(upgraded) => upgraded,
                                Err(e) => {
                                    error!("TLS handshake failed for {}: {}", peer_addr, e);
                                    return;
                                }
                            };
                        }
                        serve_connection(transport, peer_addr.to_string(), options, handlers, tls_config, metrics)
                            .await;
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }

    /// Serve one connection that was accepted elsewhere.
    pub async fn serve(&self, transport: Transport, peer: impl Into<String>) {
        serve_connection(
            transport,
            peer.into(),
            Arc::clone(&self.options),
            Handlers::from_factory(self.factory.as_ref()),
            self.tls_config.clone(),
            Arc::clone(&self.metrics),
        )
        .await
    }
}

async fn serve_connection(
    transport: Transport,
    peer: String,
    options: Arc<ServerOptions>,
    handlers: Handlers,
    tls_config: Option<Arc<rustls::ServerConfig>>,
    metrics: Arc<Metrics>,
) {
    let start_tls = if options.is_ldaps() { None } else { tls_config };
    metrics.connection_opened();
    let protocol = ServerProtocol::new(
        Box::new(Queue::new(transport)),
        options,
        handlers,
        Arc::clone(&metrics),
        peer.clone(),
    )
    .with_tls_config(start_tls);
    if let Err(e) = protocol.run().await {
        error!("Error handling client {}: {}", peer, e);
    }
    metrics.connection_closed();
}

/// `ldap://host:port` or `ldaps://host:port`; `ldap://:port` binds all interfaces.
pub fn parse_listen_url(url: &str) -> Result<SocketAddr> {
    let rest = url
        .strip_prefix("ldap://")
        .or_else(|| url.strip_prefix("ldaps://"))
        .ok_or_else(|| anyhow::anyhow!("Invalid URL scheme, expected ldap:// or ldaps://"))?;
    let rest = rest.trim_start_matches('/').trim_end_matches('/');

    match rest.strip_prefix(':') {
        Some(port) => {
            let port: u16 = port.parse().context("Invalid port number")?;
            Ok(SocketAddr::from(([0, 0, 0, 0], port)))
        }
        None => rest
            .parse()
            .with_context(|| format!("Failed to parse address: {}", rest)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_listen_url() {
        let addr = parse_listen_url("ldap://127.0.0.1:1389").unwrap();
        assert_eq!(addr.port(), 1389);
        assert_eq!(addr.ip().to_string(), "127.0.0.1");

        let addr = parse_listen_url("ldaps://0.0.0.0:636/").unwrap();
        assert_eq!(addr.port(), 636);
    }

    #[test]
    fn test_parse_listen_url_port_only() {
        let addr = parse_listen_url("ldap://:1389").unwrap();
        assert_eq!(addr, SocketAddr::from(([0, 0, 0, 0], 1389)));
        let addr = parse_listen_url("ldap:///127.0.0.1:1389").unwrap();
        assert_eq!(addr.port(), 1389);
    }

    #[test]
    fn test_parse_listen_url_errors() {
        assert!(parse_listen_url("http://127.0.0.1:1389").is_err());
        assert!(parse_listen_url("ldap://:99999").is_err());
        assert!(parse_listen_url("ldap://:abc").is_err());
        assert!(parse_listen_url("ldap://invalid:address").is_err());
    }

    #[tokio::test]
    async fn test_ldaps_requires_tls_config() {
        let options = ServerOptions {
            listen: "ldaps://127.0.0.1:0".into(),
            ..Default::default()
        };
        let directory = MemoryDirectory::new(vec![]).unwrap();
        let server = LdapServer::new(options, Arc::new(directory), Arc::new(Metrics::new()), None);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        assert!(server.run(listener).await.is_err());
    }
}
