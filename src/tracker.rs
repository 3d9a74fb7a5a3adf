//! Simulated tracker state and the frames it emits

use anyhow::Result;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracker_shared::packet::{alarm_payload, protocol};
use tracker_shared::{
    codec, AlarmKind, CellTower, DeviceIdentity, Fix, Login, StatusFlags, StatusInfo,
};

const KM_PER_DEGREE: f64 = 111.32;

/// Capability bytes sent after the identity in a login
const CAPABILITY: [u8; 6] = [0x36, 0x08, 0x01, 0x00, 0x32, 0x01];

/// One emulated device moving at constant speed along a fixed heading
#[derive(Debug, Clone)]
pub struct SimulatedTracker {
    identity: DeviceIdentity,
    latitude: f64,
    longitude: f64,
    /// Degrees clockwise from north
    heading: u16,
    speed_kmh: u8,
    battery: u8,
    serial: u16,
}

impl SimulatedTracker {
    pub fn new(
        identity: DeviceIdentity,
        latitude: f64,
        longitude: f64,
        heading: u16,
        speed_kmh: u8,
    ) -> Self {
        Self {
            identity,
            latitude,
            longitude,
            heading: heading % 360,
            speed_kmh,
            battery: 100,
            serial: 0,
        }
    }

    pub fn position(&self) -> (f64, f64) {
        (self.latitude, self.longitude)
    }

    fn next_serial(&mut self) -> u16 {
        self.serial = self.serial.wrapping_add(1);
        self.serial
    }

    fn frame(&mut self, protocol: u8, payload: &[u8]) -> Result<Bytes> {
        let serial = self.next_serial();
        Ok(codec::encode(protocol, serial, payload)?)
    }

    pub fn login_frame(&mut self) -> Result<Bytes> {
        let payload = Login::payload(&self.identity, &CAPABILITY);
        self.frame(protocol::LOGIN, &payload)
    }

    pub fn heartbeat_frame(&mut self) -> Result<Bytes> {
        let payload = self.identity.to_bcd();
        self.frame(protocol::HEARTBEAT, &payload)
    }

    pub fn status_frame(&mut self) -> Result<Bytes> {
        let payload = self.status().to_payload();
        self.frame(protocol::STATUS, &payload)
    }

    /// Move for `elapsed`, then report the new position
    pub fn location_frame(&mut self, elapsed: Duration, now: DateTime<Utc>) -> Result<Bytes> {
        self.advance(elapsed);
        let payload = self.fix(now).to_payload();
        self.frame(protocol::LOCATION, &payload)
    }

    pub fn alarm_frame(&mut self, alarm: AlarmKind, now: DateTime<Utc>) -> Result<Bytes> {
        let payload = alarm_payload(&self.fix(now), alarm);
        self.frame(protocol::ALARM, &payload)
    }

    /// Dead-reckon along the heading on a spherical earth
    fn advance(&mut self, elapsed: Duration) {
        let distance_km = f64::from(self.speed_kmh) * elapsed.as_secs_f64() / 3600.0;
        let heading = f64::from(self.heading).to_radians();

        let lat = self.latitude + distance_km * heading.cos() / KM_PER_DEGREE;
        self.latitude = lat.clamp(-89.9, 89.9);

        let lon_scale = KM_PER_DEGREE * self.latitude.to_radians().cos();
        let mut lon = self.longitude + distance_km * heading.sin() / lon_scale;
        if lon > 180.0 {
            lon -= 360.0;
        } else if lon < -180.0 {
            lon += 360.0;
        }
        self.longitude = lon;

        // Lose a percent per report, never below 20
        self.battery = self.battery.saturating_sub(1).max(20);
    }

    fn flags(&self) -> StatusFlags {
        StatusFlags {
            gps_fixed: true,
            ignition: self.speed_kmh > 0,
            charging: false,
            acc: self.speed_kmh > 0,
            defense: false,
        }
    }

    fn status(&self) -> StatusInfo {
        StatusInfo {
            flags: self.flags(),
            battery: self.battery,
            gsm_signal: 4,
        }
    }

    fn fix(&self, now: DateTime<Utc>) -> Fix {
        Fix {
            timestamp: now,
            satellites: 9,
            latitude: self.latitude,
            longitude: self.longitude,
            speed: self.speed_kmh,
            course: self.heading,
            course_status: 0b0001,
            cell: CellTower {
                mcc: 404,
                mnc: 45,
                lac: 0x1A2B,
                cell_id: 0x3C4D,
            },
            flags: self.flags(),
            battery: self.battery,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tracker_shared::{interpret, Packet};

    fn tracker(heading: u16, speed: u8) -> SimulatedTracker {
        SimulatedTracker::new(
            DeviceIdentity::parse("123456789012345").unwrap(),
            12.0,
            77.0,
            heading,
            speed,
        )
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap()
    }

    #[test]
    fn test_login_frame_carries_identity() {
        let mut t = tracker(0, 0);
        let frame = codec::decode(&t.login_frame().unwrap()).unwrap();
        assert_eq!(frame.serial, 1);

        let Packet::Login(login) = interpret(&frame).unwrap() else {
            panic!("expected login");
        };
        assert_eq!(login.identity.as_str(), "123456789012345");
        assert_eq!(login.capability, "360801003201");
    }

    #[test]
    fn test_serials_increment_across_frame_kinds() {
        let mut t = tracker(0, 0);
        t.login_frame().unwrap();
        t.heartbeat_frame().unwrap();
        let frame = codec::decode(&t.status_frame().unwrap()).unwrap();
        assert_eq!(frame.serial, 3);
    }

    #[test]
    fn test_location_drifts_north() {
        let mut t = tracker(0, 60);
        let bytes = t.location_frame(Duration::from_secs(3600), now()).unwrap();
        let frame = codec::decode(&bytes).unwrap();

        let Packet::Location(fix) = interpret(&frame).unwrap() else {
            panic!("expected location");
        };
        // 60 km due north is a little over half a degree
        assert!((fix.latitude - (12.0 + 60.0 / KM_PER_DEGREE)).abs() < 1e-5);
        assert!((fix.longitude - 77.0).abs() < 1e-5);
        assert_eq!(fix.course, 0);
        assert_eq!(fix.speed, 60);
        assert!(fix.flags.gps_fixed && fix.flags.ignition);
        assert_eq!(fix.timestamp, now());
    }

    #[test]
    fn test_stationary_tracker_keeps_position() {
        let mut t = tracker(90, 0);
        t.location_frame(Duration::from_secs(600), now()).unwrap();
        assert_eq!(t.position(), (12.0, 77.0));
    }

    #[test]
    fn test_alarm_frame() {
        let mut t = tracker(45, 30);
        let frame = codec::decode(&t.alarm_frame(AlarmKind::Sos, now()).unwrap()).unwrap();
        let Packet::Alarm { fix, alarm } = interpret(&frame).unwrap() else {
            panic!("expected alarm");
        };
        assert_eq!(alarm, AlarmKind::Sos);
        assert_eq!(fix.course, 45);
    }
}
