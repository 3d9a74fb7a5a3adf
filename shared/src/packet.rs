//! Packet interpreter: protocol number + payload -> typed packet
//!
//! Offsets below are relative to the start of the payload (the byte after
//! the protocol number).

use bytes::{BufMut, BytesMut};
use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};
use std::fmt;
use thiserror::Error;

use crate::codec::Frame;
use crate::identity::{DeviceIdentity, IdentityError, BCD_LEN};

/// Protocol numbers understood by the interpreter
pub mod protocol {
    pub const LOGIN: u8 = 0x01;
    pub const HEARTBEAT: u8 = 0x11;
    pub const LOCATION: u8 = 0x12;
    pub const STATUS: u8 = 0x13;
    pub const ALARM: u8 = 0x15;
}

/// Coordinate scale: raw int32 units per degree
pub const COORDINATE_SCALE: f64 = 1_800_000.0;

/// Location payload size (date .. battery)
pub const LOCATION_LEN: usize = 27;

/// Alarm payload size (location layout + alarm code)
pub const ALARM_LEN: usize = LOCATION_LEN + 1;

/// Status payload size (status byte, battery, gsm signal)
pub const STATUS_LEN: usize = 3;

/// Capability serial bytes following the identity in a login
pub const CAPABILITY_LEN: usize = 6;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("Protocol {protocol:#04x} payload truncated: need {needed} bytes, have {actual}")]
    Truncated {
        protocol: u8,
        needed: usize,
        actual: usize,
    },

    #[error("Invalid fix date {0:02x?}")]
    InvalidDate([u8; 6]),

    #[error("Invalid identity: {0}")]
    Identity(#[from] IdentityError),
}

/// Device status bits shared by location, alarm and status payloads
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusFlags {
    pub gps_fixed: bool,
    pub ignition: bool,
    pub charging: bool,
    pub acc: bool,
    pub defense: bool,
}

impl StatusFlags {
    pub fn from_byte(byte: u8) -> Self {
        Self {
            gps_fixed: byte & 0x40 != 0,
            ignition: byte & 0x20 != 0,
            charging: byte & 0x10 != 0,
            acc: byte & 0x08 != 0,
            defense: byte & 0x04 != 0,
        }
    }

    pub fn to_byte(self) -> u8 {
        (u8::from(self.gps_fixed) << 6)
            | (u8::from(self.ignition) << 5)
            | (u8::from(self.charging) << 4)
            | (u8::from(self.acc) << 3)
            | (u8::from(self.defense) << 2)
    }
}

/// Serving GSM cell at the time of the fix
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CellTower {
    pub mcc: u16,
    pub mnc: u8,
    pub lac: u16,
    pub cell_id: u16,
}

/// One GPS sample
#[derive(Debug, Clone, PartialEq)]
pub struct Fix {
    pub timestamp: DateTime<Utc>,
    pub satellites: u8,
    pub latitude: f64,
    pub longitude: f64,
    /// km/h
    pub speed: u8,
    /// Degrees, 10-bit field
    pub course: u16,
    /// High nibble of the course word
    pub course_status: u8,
    pub cell: CellTower,
    pub flags: StatusFlags,
    pub battery: u8,
}

impl Fix {
    fn parse(protocol: u8, payload: &[u8]) -> Result<Self, PacketError> {
        require(protocol, payload, LOCATION_LEN)?;

        let date = [
            payload[0], payload[1], payload[2], payload[3], payload[4], payload[5],
        ];
        let timestamp = NaiveDate::from_ymd_opt(
            2000 + i32::from(date[0]),
            u32::from(date[1]),
            u32::from(date[2]),
        )
        .and_then(|d| d.and_hms_opt(u32::from(date[3]), u32::from(date[4]), u32::from(date[5])))
        .map(|naive| naive.and_utc())
        .ok_or(PacketError::InvalidDate(date))?;

        let course_word = be_u16(payload, 16);

        Ok(Self {
            timestamp,
            satellites: payload[6],
            latitude: f64::from(be_i32(payload, 7)) / COORDINATE_SCALE,
            longitude: f64::from(be_i32(payload, 11)) / COORDINATE_SCALE,
            speed: payload[15],
            course: course_word & 0x03FF,
            course_status: ((course_word >> 10) & 0x0F) as u8,
            cell: CellTower {
                mcc: be_u16(payload, 18),
                mnc: payload[20],
                lac: be_u16(payload, 21),
                cell_id: be_u16(payload, 23),
            },
            flags: StatusFlags::from_byte(payload[25]),
            battery: payload[26],
        })
    }

    /// Encode into the location payload layout
    pub fn to_payload(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(ALARM_LEN);
        self.put(&mut buf);
        buf.to_vec()
    }

    fn put(&self, buf: &mut BytesMut) {
        let ts = self.timestamp;
        buf.put_u8(ts.year().saturating_sub(2000).clamp(0, 255) as u8);
        buf.put_u8(ts.month() as u8);
        buf.put_u8(ts.day() as u8);
        buf.put_u8(ts.hour() as u8);
        buf.put_u8(ts.minute() as u8);
        buf.put_u8(ts.second() as u8);
        buf.put_u8(self.satellites);
        buf.put_i32((self.latitude * COORDINATE_SCALE).round() as i32);
        buf.put_i32((self.longitude * COORDINATE_SCALE).round() as i32);
        buf.put_u8(self.speed);
        buf.put_u16((u16::from(self.course_status & 0x0F) << 10) | (self.course & 0x03FF));
        buf.put_u16(self.cell.mcc);
        buf.put_u8(self.cell.mnc);
        buf.put_u16(self.cell.lac);
        buf.put_u16(self.cell.cell_id);
        buf.put_u8(self.flags.to_byte());
        buf.put_u8(self.battery);
    }
}

/// Status report without position
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusInfo {
    pub flags: StatusFlags,
    pub battery: u8,
    pub gsm_signal: u8,
}

impl StatusInfo {
    fn parse(payload: &[u8]) -> Result<Self, PacketError> {
        require(protocol::STATUS, payload, STATUS_LEN)?;
        Ok(Self {
            flags: StatusFlags::from_byte(payload[0]),
            battery: payload[1],
            gsm_signal: payload[2],
        })
    }

    pub fn to_payload(&self) -> Vec<u8> {
        vec![self.flags.to_byte(), self.battery, self.gsm_signal]
    }
}

/// Alarm reasons carried by protocol 0x15
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmKind {
    Sos,
    PowerCut,
    Vibration,
    EnterFence,
    ExitFence,
    OverSpeed,
    PowerOn,
    PowerOff,
    EnterSleep,
    ExitSleep,
    Displacement,
    Collision,
    LowBattery,
    Unknown(u8),
}

impl AlarmKind {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => Self::Sos,
            0x02 => Self::PowerCut,
            0x03 => Self::Vibration,
            0x04 => Self::EnterFence,
            0x05 => Self::ExitFence,
            0x06 => Self::OverSpeed,
            0x09 => Self::PowerOn,
            0x0A => Self::PowerOff,
            0x0B => Self::EnterSleep,
            0x0C => Self::ExitSleep,
            0x0D => Self::Displacement,
            0x0E => Self::Collision,
            0x0F => Self::LowBattery,
            other => Self::Unknown(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::Sos => 0x01,
            Self::PowerCut => 0x02,
            Self::Vibration => 0x03,
            Self::EnterFence => 0x04,
            Self::ExitFence => 0x05,
            Self::OverSpeed => 0x06,
            Self::PowerOn => 0x09,
            Self::PowerOff => 0x0A,
            Self::EnterSleep => 0x0B,
            Self::ExitSleep => 0x0C,
            Self::Displacement => 0x0D,
            Self::Collision => 0x0E,
            Self::LowBattery => 0x0F,
            Self::Unknown(code) => code,
        }
    }
}

impl fmt::Display for AlarmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Sos => "SOS",
            Self::PowerCut => "PowerCut",
            Self::Vibration => "Vibration",
            Self::EnterFence => "EnterFence",
            Self::ExitFence => "ExitFence",
            Self::OverSpeed => "OverSpeed",
            Self::PowerOn => "PowerOn",
            Self::PowerOff => "PowerOff",
            Self::EnterSleep => "EnterSleep",
            Self::ExitSleep => "ExitSleep",
            Self::Displacement => "Displacement",
            Self::Collision => "Collision",
            Self::LowBattery => "LowBattery",
            Self::Unknown(code) => return write!(f, "unknown({code:#04x})"),
        };
        f.write_str(label)
    }
}

/// Encode an alarm payload: location layout followed by the alarm code
pub fn alarm_payload(fix: &Fix, alarm: AlarmKind) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(ALARM_LEN);
    fix.put(&mut buf);
    buf.put_u8(alarm.code());
    buf.to_vec()
}

/// Login request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Login {
    pub identity: DeviceIdentity,
    /// Hex of the bytes following the identity (model/capability code)
    pub capability: String,
}

impl Login {
    fn parse(payload: &[u8]) -> Result<Self, PacketError> {
        let identity = identity_prefix(protocol::LOGIN, payload)?;
        let tail = &payload[BCD_LEN..payload.len().min(BCD_LEN + CAPABILITY_LEN)];
        Ok(Self {
            identity,
            capability: hex::encode(tail),
        })
    }

    /// Encode a login payload; `capability` must already be raw bytes
    pub fn payload(identity: &DeviceIdentity, capability: &[u8]) -> Vec<u8> {
        let mut out = identity.to_bcd().to_vec();
        out.extend_from_slice(&capability[..capability.len().min(CAPABILITY_LEN)]);
        out
    }
}

/// Closed set of packets the ingest pipeline dispatches on
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Login(Login),
    Heartbeat { identity: DeviceIdentity },
    Location(Fix),
    Status(StatusInfo),
    Alarm { fix: Fix, alarm: AlarmKind },
    Unknown { protocol: u8 },
}

impl Packet {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::Login(_) => "login",
            Packet::Heartbeat { .. } => "heartbeat",
            Packet::Location(_) => "location",
            Packet::Status(_) => "status",
            Packet::Alarm { .. } => "alarm",
            Packet::Unknown { .. } => "unknown",
        }
    }
}

/// Interpret a decoded frame by its protocol number
///
/// Unsupported protocol numbers yield `Packet::Unknown` rather than an error.
pub fn interpret(frame: &Frame) -> Result<Packet, PacketError> {
    let payload = &frame.payload[..];
    let packet = match frame.protocol {
        protocol::LOGIN => Packet::Login(Login::parse(payload)?),
        protocol::HEARTBEAT => Packet::Heartbeat {
            identity: identity_prefix(protocol::HEARTBEAT, payload)?,
        },
        protocol::LOCATION => Packet::Location(Fix::parse(protocol::LOCATION, payload)?),
        protocol::STATUS => Packet::Status(StatusInfo::parse(payload)?),
        protocol::ALARM => {
            require(protocol::ALARM, payload, ALARM_LEN)?;
            Packet::Alarm {
                fix: Fix::parse(protocol::ALARM, payload)?,
                alarm: AlarmKind::from_code(payload[LOCATION_LEN]),
            }
        }
        other => Packet::Unknown { protocol: other },
    };
    Ok(packet)
}

fn identity_prefix(protocol: u8, payload: &[u8]) -> Result<DeviceIdentity, PacketError> {
    require(protocol, payload, BCD_LEN)?;
    Ok(DeviceIdentity::from_bcd(&payload[..BCD_LEN])?)
}

fn require(protocol: u8, payload: &[u8], needed: usize) -> Result<(), PacketError> {
    if payload.len() < needed {
        return Err(PacketError::Truncated {
            protocol,
            needed,
            actual: payload.len(),
        });
    }
    Ok(())
}

fn be_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

fn be_i32(buf: &[u8], at: usize) -> i32 {
    i32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn location_payload() -> Vec<u8> {
        let mut p = vec![
            24, 3, 15, 10, 30, 45, // 2024-03-15 10:30:45
            9,    // satellites
        ];
        p.extend_from_slice(&1_800_000i32.to_be_bytes()); // lat 1.0
        p.extend_from_slice(&(-3_600_000i32).to_be_bytes()); // lon -2.0
        p.push(60); // speed
        p.extend_from_slice(&((0b0101u16 << 10) | 270).to_be_bytes());
        p.extend_from_slice(&404u16.to_be_bytes()); // mcc
        p.push(45); // mnc
        p.extend_from_slice(&0x1234u16.to_be_bytes()); // lac
        p.extend_from_slice(&0xABCDu16.to_be_bytes()); // cell id
        p.push(0x60); // gps fixed + ignition
        p.push(87); // battery
        p
    }

    #[test]
    fn test_location_fields() {
        let frame = Frame::new(protocol::LOCATION, 1, location_payload());
        let Packet::Location(fix) = interpret(&frame).expect("valid location") else {
            panic!("expected location");
        };

        assert_eq!(
            fix.timestamp,
            Utc.with_ymd_and_hms(2024, 3, 15, 10, 30, 45).unwrap()
        );
        assert_eq!(fix.satellites, 9);
        assert_eq!(fix.latitude, 1.0);
        assert_eq!(fix.longitude, -2.0);
        assert_eq!(fix.speed, 60);
        assert_eq!(fix.course, 270);
        assert_eq!(fix.course_status, 0b0101);
        assert_eq!(
            fix.cell,
            CellTower {
                mcc: 404,
                mnc: 45,
                lac: 0x1234,
                cell_id: 0xABCD
            }
        );
        assert!(fix.flags.gps_fixed);
        assert!(fix.flags.ignition);
        assert!(!fix.flags.charging);
        assert_eq!(fix.battery, 87);
    }

    #[test]
    fn test_fix_payload_roundtrip() {
        let frame = Frame::new(protocol::LOCATION, 1, location_payload());
        let Packet::Location(fix) = interpret(&frame).expect("valid location") else {
            panic!("expected location");
        };
        assert_eq!(fix.to_payload(), location_payload());
    }

    #[test]
    fn test_status_flags() {
        let flags = StatusFlags::from_byte(0x60);
        assert!(flags.gps_fixed);
        assert!(flags.ignition);
        assert!(!flags.charging);
        assert!(!flags.acc);
        assert!(!flags.defense);

        let all = StatusFlags::from_byte(0x7C);
        assert!(all.charging && all.acc && all.defense);
        assert_eq!(all.to_byte(), 0x7C);
    }

    #[test]
    fn test_status_packet() {
        let frame = Frame::new(protocol::STATUS, 2, vec![0x18, 55, 4]);
        assert_eq!(
            interpret(&frame).expect("valid status"),
            Packet::Status(StatusInfo {
                flags: StatusFlags {
                    charging: true,
                    acc: true,
                    ..Default::default()
                },
                battery: 55,
                gsm_signal: 4,
            })
        );
    }

    #[test]
    fn test_login_packet() {
        let id = DeviceIdentity::parse("123456789012345").expect("valid imei");
        let payload = Login::payload(&id, &[0x36, 0x08, 0x01, 0x00, 0x32, 0x01]);
        let frame = Frame::new(protocol::LOGIN, 1, payload);

        let Packet::Login(login) = interpret(&frame).expect("valid login") else {
            panic!("expected login");
        };
        assert_eq!(login.identity, id);
        assert_eq!(login.capability, "360801003201");
    }

    #[test]
    fn test_login_without_capability() {
        let id = DeviceIdentity::parse("123456789012345").expect("valid imei");
        let frame = Frame::new(protocol::LOGIN, 1, id.to_bcd().to_vec());
        let Packet::Login(login) = interpret(&frame).expect("valid login") else {
            panic!("expected login");
        };
        assert!(login.capability.is_empty());
    }

    #[test]
    fn test_heartbeat_packet() {
        let id = DeviceIdentity::parse("123456789012345").expect("valid imei");
        let frame = Frame::new(protocol::HEARTBEAT, 3, id.to_bcd().to_vec());
        assert_eq!(
            interpret(&frame).expect("valid heartbeat"),
            Packet::Heartbeat { identity: id }
        );
    }

    #[test]
    fn test_alarm_codes() {
        let mut payload = location_payload();
        payload.push(0x01);
        let frame = Frame::new(protocol::ALARM, 4, payload.clone());
        let Packet::Alarm { alarm, fix } = interpret(&frame).expect("valid alarm") else {
            panic!("expected alarm");
        };
        assert_eq!(alarm, AlarmKind::Sos);
        assert_eq!(alarm_payload(&fix, alarm), payload);

        assert_eq!(AlarmKind::from_code(0x0F), AlarmKind::LowBattery);
        assert_eq!(AlarmKind::from_code(0x07), AlarmKind::Unknown(0x07));
        assert_eq!(AlarmKind::Unknown(0x07).to_string(), "unknown(0x07)");
        assert_eq!(AlarmKind::PowerCut.to_string(), "PowerCut");
        assert_eq!(AlarmKind::Sos.to_string(), "SOS");
    }

    #[test]
    fn test_unknown_protocol_is_not_an_error() {
        let frame = Frame::new(0x22, 5, vec![0u8; 4]);
        assert_eq!(
            interpret(&frame).expect("unknown is not an error"),
            Packet::Unknown { protocol: 0x22 }
        );
    }

    #[test]
    fn test_truncated_payloads() {
        let frame = Frame::new(protocol::LOCATION, 1, vec![0u8; 10]);
        assert_eq!(
            interpret(&frame),
            Err(PacketError::Truncated {
                protocol: protocol::LOCATION,
                needed: LOCATION_LEN,
                actual: 10
            })
        );

        let alarm = Frame::new(protocol::ALARM, 1, location_payload());
        assert!(matches!(
            interpret(&alarm),
            Err(PacketError::Truncated { needed: ALARM_LEN, .. })
        ));

        let heartbeat = Frame::new(protocol::HEARTBEAT, 1, vec![0x01; 4]);
        assert!(matches!(interpret(&heartbeat), Err(PacketError::Truncated { .. })));
    }

    #[test]
    fn test_invalid_date() {
        let mut payload = location_payload();
        payload[1] = 13;
        let frame = Frame::new(protocol::LOCATION, 1, payload);
        assert!(matches!(interpret(&frame), Err(PacketError::InvalidDate(_))));
    }
}
