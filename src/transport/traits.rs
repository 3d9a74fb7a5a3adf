//! Transport trait abstraction for the emulator's uplink

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// A byte stream to the tracker server
#[async_trait]
pub trait TransportStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Close the transport gracefully
    async fn shutdown(&mut self) -> Result<()>;
}

/// Factory for uplink connections, called again on every reconnect
#[async_trait]
pub trait TransportConnector: Send + Sync + 'static {
    type Stream: TransportStream;

    async fn connect(&self) -> Result<Self::Stream>;

    /// Remote endpoint, for logging
    fn endpoint(&self) -> &str;
}
