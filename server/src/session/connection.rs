//! Individual tracker session handling

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracker_shared::DeviceIdentity;

/// Write half of a device transport
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Handle to write to a specific tracker connection
#[derive(Clone)]
pub struct SessionHandle {
    pub connection_id: u64,
    pub addr: SocketAddr,
    pub connected_at: Instant,
    writer: Arc<Mutex<BoxedWriter>>,
}

impl SessionHandle {
    pub fn new<W>(connection_id: u64, addr: SocketAddr, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            connection_id,
            addr,
            connected_at: Instant::now(),
            writer: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    /// Write raw bytes to this tracker
    ///
    /// Writes from the ingest worker (acks) and the dispatcher (commands)
    /// are serialised by the writer lock, so frames never interleave.
    pub async fn send(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await
    }

    /// Shut down the write side
    pub async fn shutdown(&self) -> std::io::Result<()> {
        self.writer.lock().await.shutdown().await
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("connection_id", &self.connection_id)
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}

/// Snapshot of one registry entry
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub identity: DeviceIdentity,
    pub connection_id: u64,
    pub addr: SocketAddr,
    pub connected_at: Instant,
    pub idle: Duration,
}
