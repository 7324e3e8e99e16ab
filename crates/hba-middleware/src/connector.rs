//! Transport seam between links and the hardware daemon.
//!
//! Links never open sockets themselves.  They ask a [`Connector`] for a fresh
//! byte stream, so the same bus runs against the real daemon over TCP
//! ([`TcpConnector`]) or against the in-process
//! [`SimDaemon`][crate::sim::SimDaemon] in tests.

use async_trait::async_trait;
use hba_types::{DEFAULT_HOST, DEFAULT_PORT, HbaError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// A full-duplex byte stream to the daemon.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Opens new connections to the daemon.
///
/// # Contract
///
/// * `connect` – returns a fresh, independent connection every call.  Each
///   link owns exactly one.
/// * `describe` – a human readable address used in logs and errors.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Transport>, HbaError>;

    fn describe(&self) -> String;
}

/// Plain TCP connector; the daemon listens on `localhost:8870` by default.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            addr: format!("{host}:{port}"),
        }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_PORT)
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, HbaError> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|source| HbaError::Connect {
                addr: self.addr.clone(),
                source,
            })?;
        // Commands are tiny; do not let Nagle hold them back.
        stream.set_nodelay(true).map_err(|source| HbaError::Connect {
            addr: self.addr.clone(),
            source,
        })?;
        debug!(addr = %self.addr, "connected to hba daemon");
        Ok(Box::new(stream))
    }

    fn describe(&self) -> String {
        self.addr.clone()
    }
}
