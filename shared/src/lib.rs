//! Tracker Shared Protocol Types
//!
//! This crate provides the wire codec and packet types for communication
//! between GT06-class vehicle trackers and the ingest server.

pub mod codec;
pub mod identity;
pub mod packet;

use bytes::Bytes;
use prost::Message;

pub use codec::{Frame, FrameDecoder, FrameError};
pub use identity::{DeviceIdentity, IdentityError};
pub use packet::{interpret, AlarmKind, CellTower, Fix, Login, Packet, PacketError, StatusFlags, StatusInfo};

/// Session timing defaults
pub mod timing {
    /// Sessions idle this long are evicted by the sweeper
    pub const SESSION_MAX_IDLE_SECS: u64 = 30 * 60;

    /// How often the sweeper runs
    pub const SWEEP_INTERVAL_SECS: u64 = 5 * 60;

    /// Emulator heartbeat cadence
    pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

    /// Emulator location cadence
    pub const REPORT_INTERVAL_SECS: u64 = 10;
}

/// Acknowledgment response codes
pub mod ack_code {
    use crate::packet::protocol;

    pub const LOGIN_OK: u8 = 0x00;
    pub const OK: u8 = 0x01;

    /// Response code used when acknowledging `protocol`
    pub fn for_protocol(protocol: u8) -> u8 {
        if protocol == protocol::LOGIN {
            LOGIN_OK
        } else {
            OK
        }
    }
}

/// Build the acknowledgment for an inbound frame
pub fn ack_for(frame: &Frame) -> Bytes {
    codec::ack(
        frame.protocol,
        frame.serial,
        ack_code::for_protocol(frame.protocol),
    )
}

/// Topic fix-update notifications are published on
pub const FIX_UPDATE_TOPIC: &str = "device-fix-updates";

/// Real-time fix notification payload
#[derive(Clone, PartialEq, Message)]
pub struct FixUpdate {
    #[prost(string, tag = "1")]
    pub imei: String,

    /// Fix time, ms since Unix epoch
    #[prost(int64, tag = "2")]
    pub timestamp_ms: i64,

    #[prost(double, tag = "3")]
    pub latitude: f64,

    #[prost(double, tag = "4")]
    pub longitude: f64,

    #[prost(uint32, tag = "5")]
    pub speed_kmh: u32,

    #[prost(uint32, tag = "6")]
    pub heading: u32,

    #[prost(string, optional, tag = "7")]
    pub alarm: Option<String>,
}

impl FixUpdate {
    /// Create a notification for a fix, optionally raised by an alarm
    pub fn new(identity: &DeviceIdentity, fix: &Fix, alarm: Option<AlarmKind>) -> Self {
        Self {
            imei: identity.to_string(),
            timestamp_ms: fix.timestamp.timestamp_millis(),
            latitude: fix.latitude,
            longitude: fix.longitude,
            speed_kmh: u32::from(fix.speed),
            heading: u32::from(fix.course),
            alarm: alarm.map(|a| a.to_string()),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.encode_to_vec())
    }
}
