//! Byte-stream transports
//!
//! The engine is handed an already-connected duplex stream. DNS, TLS and WebSocket
//! framing belong to the [`Connector`] that produced it.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use super::config::{ConnectionOptions, TransportScheme};

/// A connected duplex byte stream
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Opens transports for the client, once per connection attempt
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, options: &ConnectionOptions) -> io::Result<Box<dyn Transport>>;
}

/// Plain TCP connector
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, options: &ConnectionOptions) -> io::Result<Box<dyn Transport>> {
        if options.transport != TransportScheme::Tcp {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("{} transport needs a dedicated connector", options.transport),
            ));
        }

        let address = options.address();
        debug!("Opening TCP connection to {}", address);
        let stream = TcpStream::connect(&address).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}
