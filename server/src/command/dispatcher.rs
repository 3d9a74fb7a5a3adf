//! Command dispatcher for sending commands to trackers

use crate::session::SessionRegistry;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use tracker_shared::{codec, DeviceIdentity, FrameError};

/// Writes operator commands to connected trackers
pub struct CommandDispatcher {
    registry: Arc<SessionRegistry>,
    serial: AtomicU16,
}

impl CommandDispatcher {
    /// Create a new command dispatcher
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            serial: AtomicU16::new(0),
        }
    }

    /// Get the next outbound frame serial
    pub fn next_serial(&self) -> u16 {
        self.serial.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// Write raw bytes to a tracker
    ///
    /// Returns false if the tracker has no live session or the write fails.
    pub async fn send(&self, identity: &DeviceIdentity, payload: &[u8]) -> bool {
        let Some(handle) = self.registry.get(identity).await else {
            info!(imei = %identity, "Device not connected");
            return false;
        };

        match handle.send(payload).await {
            Ok(()) => {
                info!(
                    imei = %identity,
                    peer = %handle.addr,
                    bytes = %hex::encode(payload),
                    ">>> Sent command"
                );
                true
            }
            Err(e) => {
                warn!(imei = %identity, error = %e, "Failed to write command");
                false
            }
        }
    }

    /// Frame `payload` under `protocol` with the next serial, then send it
    pub async fn send_frame(
        &self,
        identity: &DeviceIdentity,
        protocol: u8,
        payload: &[u8],
    ) -> Result<bool, FrameError> {
        let frame = codec::encode(protocol, self.next_serial(), payload)?;
        Ok(self.send(identity, &frame).await)
    }

    /// Write raw bytes to every connected tracker, returning how many accepted it
    pub async fn broadcast(&self, payload: &[u8]) -> usize {
        let mut delivered = 0;
        for (identity, handle) in self.registry.handles().await {
            match handle.send(payload).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!(imei = %identity, error = %e, "Failed to broadcast"),
            }
        }
        delivered
    }
}
