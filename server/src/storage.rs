//! Device storage collaborator
//!
//! The pipeline only sees the [`DeviceStore`] trait. [`MemoryStore`] keeps
//! everything in process and backs the binary and the tests.

use crate::error::StorageError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracker_shared::{AlarmKind, DeviceIdentity, Fix, StatusInfo};

/// Persisted device profile plus cached state
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRecord {
    pub identity: DeviceIdentity,
    pub device_name: String,
    pub vehicle_number: String,
    pub protocol_version: String,
    pub is_active: bool,
    /// Capability serial reported at the last login
    pub capability: Option<String>,
    pub last_connection: Option<DateTime<Utc>>,
    pub last_status: Option<StatusInfo>,
    pub last_fix: Option<Fix>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeviceRecord {
    /// Profile synthesized for a device seen for the first time
    pub fn synthesized(identity: &DeviceIdentity, now: DateTime<Utc>) -> Self {
        Self {
            identity: identity.clone(),
            device_name: format!("Device-{identity}"),
            vehicle_number: format!("VH-{}", identity.suffix(6)),
            protocol_version: "V5".into(),
            is_active: true,
            capability: None,
            last_connection: None,
            last_status: None,
            last_fix: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Profile fields refreshed by non-location packets
#[derive(Debug, Clone, PartialEq)]
pub enum ProfileUpdate {
    Login { capability: String },
    Heartbeat,
    Status(StatusInfo),
}

/// One row of fix history
#[derive(Debug, Clone, PartialEq)]
pub struct LocationRecord {
    pub identity: DeviceIdentity,
    pub fix: Fix,
    pub alarm: Option<AlarmKind>,
    pub received_at: DateTime<Utc>,
    /// Raw frame as hex
    pub raw: String,
}

/// Storage backend contract
#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Create the device if unseen, then apply `update`
    async fn upsert_device(
        &self,
        identity: &DeviceIdentity,
        update: ProfileUpdate,
    ) -> Result<DeviceRecord, StorageError>;

    /// Append to the fix history
    async fn append_location(&self, record: LocationRecord) -> Result<(), StorageError>;

    /// Replace the cached last fix
    async fn update_last_fix(&self, identity: &DeviceIdentity, fix: &Fix)
        -> Result<(), StorageError>;
}

/// In-process store
#[derive(Default)]
pub struct MemoryStore {
    devices: RwLock<HashMap<DeviceIdentity, DeviceRecord>>,
    locations: RwLock<Vec<LocationRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn device(&self, identity: &DeviceIdentity) -> Option<DeviceRecord> {
        self.devices.read().await.get(identity).cloned()
    }

    pub async fn device_count(&self) -> usize {
        self.devices.read().await.len()
    }

    /// Fix history for one device, oldest first
    pub async fn locations_for(&self, identity: &DeviceIdentity) -> Vec<LocationRecord> {
        self.locations
            .read()
            .await
            .iter()
            .filter(|r| &r.identity == identity)
            .cloned()
            .collect()
    }

    pub async fn location_count(&self) -> usize {
        self.locations.read().await.len()
    }
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn upsert_device(
        &self,
        identity: &DeviceIdentity,
        update: ProfileUpdate,
    ) -> Result<DeviceRecord, StorageError> {
        let now = Utc::now();
        let mut devices = self.devices.write().await;
        let record = devices
            .entry(identity.clone())
            .or_insert_with(|| DeviceRecord::synthesized(identity, now));

        match update {
            ProfileUpdate::Login { capability } => {
                record.capability = Some(capability);
                record.is_active = true;
            }
            ProfileUpdate::Heartbeat => {}
            ProfileUpdate::Status(status) => record.last_status = Some(status),
        }
        record.last_connection = Some(now);
        record.updated_at = now;

        Ok(record.clone())
    }

    async fn append_location(&self, record: LocationRecord) -> Result<(), StorageError> {
        self.locations.write().await.push(record);
        Ok(())
    }

    async fn update_last_fix(
        &self,
        identity: &DeviceIdentity,
        fix: &Fix,
    ) -> Result<(), StorageError> {
        let mut devices = self.devices.write().await;
        let record = devices
            .get_mut(identity)
            .ok_or_else(|| StorageError::UnknownDevice(identity.to_string()))?;

        let now = Utc::now();
        record.last_fix = Some(fix.clone());
        record.last_connection = Some(now);
        record.updated_at = now;
        Ok(())
    }
}
