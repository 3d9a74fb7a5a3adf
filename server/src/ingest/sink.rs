//! Backend sink: storage writes and fix notifications for one connection
//!
//! Jobs run in arrival order on a task of their own, so the socket loop never
//! waits on a backend. A failing call is logged and the next step still runs.

use crate::notify::Notifier;
use crate::storage::{DeviceStore, LocationRecord, ProfileUpdate};
use bytes::Bytes;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use tracker_shared::{AlarmKind, DeviceIdentity, Fix, FixUpdate, StatusInfo, FIX_UPDATE_TOPIC};

/// Backend work produced by one decoded frame
#[derive(Debug, Clone)]
pub enum BackendJob {
    Login {
        identity: DeviceIdentity,
        capability: String,
    },
    Heartbeat {
        identity: DeviceIdentity,
    },
    Status {
        identity: DeviceIdentity,
        status: StatusInfo,
    },
    Fix {
        identity: DeviceIdentity,
        fix: Fix,
        alarm: Option<AlarmKind>,
        raw: Bytes,
    },
}

/// Applies backend jobs against the storage and notification collaborators
#[derive(Clone)]
pub struct BackendSink {
    store: Arc<dyn DeviceStore>,
    notifier: Arc<dyn Notifier>,
}

impl BackendSink {
    pub fn new(store: Arc<dyn DeviceStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }

    /// Start a sink task fed by a bounded channel
    ///
    /// The task ends once every sender is dropped and the queue is drained.
    pub fn spawn(self, capacity: usize) -> (mpsc::Sender<BackendJob>, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<BackendJob>(capacity);
        let task = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                self.apply(job).await;
            }
        });
        (tx, task)
    }

    /// Apply one job, logging any backend failure
    pub async fn apply(&self, job: BackendJob) {
        match job {
            BackendJob::Login {
                identity,
                capability,
            } => {
                match self
                    .store
                    .upsert_device(&identity, ProfileUpdate::Login { capability })
                    .await
                {
                    Ok(record) => info!(
                        imei = %identity,
                        name = %record.device_name,
                        vehicle = %record.vehicle_number,
                        "Device login recorded"
                    ),
                    Err(e) => error!(imei = %identity, error = %e, "Failed to record login"),
                }
            }
            BackendJob::Heartbeat { identity } => {
                if let Err(e) = self
                    .store
                    .upsert_device(&identity, ProfileUpdate::Heartbeat)
                    .await
                {
                    error!(imei = %identity, error = %e, "Failed to refresh connectivity");
                }
            }
            BackendJob::Status { identity, status } => {
                if let Err(e) = self
                    .store
                    .upsert_device(&identity, ProfileUpdate::Status(status))
                    .await
                {
                    error!(imei = %identity, error = %e, "Failed to update status");
                }
            }
            BackendJob::Fix {
                identity,
                fix,
                alarm,
                raw,
            } => self.apply_fix(identity, fix, alarm, raw).await,
        }
    }

    async fn apply_fix(
        &self,
        identity: DeviceIdentity,
        fix: Fix,
        alarm: Option<AlarmKind>,
        raw: Bytes,
    ) {
        let record = LocationRecord {
            identity: identity.clone(),
            fix: fix.clone(),
            alarm,
            received_at: Utc::now(),
            raw: hex::encode(&raw),
        };
        if let Err(e) = self.store.append_location(record).await {
            error!(imei = %identity, error = %e, "Failed to append location");
        }

        if let Err(e) = self.store.update_last_fix(&identity, &fix).await {
            error!(imei = %identity, error = %e, "Failed to update last fix");
        }

        let update = FixUpdate::new(&identity, &fix, alarm);
        match self.notifier.publish(FIX_UPDATE_TOPIC, update.to_bytes()).await {
            Ok(()) => debug!(
                imei = %identity,
                lat = fix.latitude,
                lon = fix.longitude,
                "Fix update published"
            ),
            Err(e) => error!(imei = %identity, error = %e, "Failed to publish fix update"),
        }
    }
}
