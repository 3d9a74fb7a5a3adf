//! Connection worker: bytes in, acknowledgments out

use super::sink::{BackendJob, BackendSink};
use crate::notify::Notifier;
use crate::session::{SessionHandle, SessionRegistry};
use crate::storage::DeviceStore;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracker_shared::{
    ack_for, interpret, AlarmKind, DeviceIdentity, Fix, Frame, FrameDecoder, Login, Packet,
};

/// Everything a connection worker shares with the rest of the server
#[derive(Clone)]
pub struct IngestContext {
    pub registry: Arc<SessionRegistry>,
    pub sink: BackendSink,
    pub sink_capacity: usize,
    pub read_buffer_size: usize,
}

impl IngestContext {
    pub fn new(
        registry: Arc<SessionRegistry>,
        store: Arc<dyn DeviceStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            registry,
            sink: BackendSink::new(store, notifier),
            sink_capacity: 256,
            read_buffer_size: 1024,
        }
    }
}

/// Serve one accepted tracker connection until the transport closes
///
/// Returns once the worker has stopped and the backend sink has drained.
pub async fn serve_connection<S>(stream: S, addr: SocketAddr, ctx: IngestContext)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let handle = SessionHandle::new(ctx.registry.next_connection_id(), addr, writer);
    let (jobs, sink_task) = ctx.sink.clone().spawn(ctx.sink_capacity);

    info!(peer = %addr, connection_id = handle.connection_id, "Tracker connected");

    ConnectionWorker::new(reader, handle, ctx.registry.clone(), jobs, ctx.read_buffer_size)
        .run()
        .await;

    if let Err(e) = sink_task.await {
        error!(peer = %addr, error = %e, "Backend sink task failed");
    }
}

/// Per-connection ingest state
pub struct ConnectionWorker<R> {
    reader: R,
    handle: SessionHandle,
    registry: Arc<SessionRegistry>,
    jobs: mpsc::Sender<BackendJob>,
    decoder: FrameDecoder,
    read_buf: Vec<u8>,
    /// Identity presented on this connection, if any
    identity: Option<DeviceIdentity>,
    /// Whether `identity` came from a login and is in the registry
    registered: bool,
}

impl<R> ConnectionWorker<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(
        reader: R,
        handle: SessionHandle,
        registry: Arc<SessionRegistry>,
        jobs: mpsc::Sender<BackendJob>,
        read_buffer_size: usize,
    ) -> Self {
        Self {
            reader,
            handle,
            registry,
            jobs,
            decoder: FrameDecoder::new(),
            read_buf: vec![0u8; read_buffer_size.max(64)],
            identity: None,
            registered: false,
        }
    }

    /// Read until the transport closes, then release the session
    pub async fn run(mut self) {
        loop {
            match self.reader.read(&mut self.read_buf).await {
                Ok(0) => {
                    info!(peer = %self.handle.addr, imei = ?self.identity, "Tracker disconnected");
                    break;
                }
                Ok(n) => {
                    self.decoder.extend(&self.read_buf[..n]);
                    self.process_buffered().await;
                }
                Err(e) => {
                    warn!(peer = %self.handle.addr, error = %e, "Read error");
                    break;
                }
            }
        }

        self.close().await;
    }

    /// Handle every complete frame currently buffered, in arrival order
    async fn process_buffered(&mut self) {
        loop {
            match self.decoder.decode_next() {
                Ok(Some(frame)) => self.handle_frame(frame).await,
                Ok(None) => break,
                Err(e) => debug!(
                    peer = %self.handle.addr,
                    error = %e,
                    discarded = self.decoder.discarded_bytes(),
                    "Discarded malformed frame"
                ),
            }
        }
    }

    async fn handle_frame(&mut self, frame: Frame) {
        let packet = match interpret(&frame) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(
                    peer = %self.handle.addr,
                    protocol = frame.protocol,
                    error = %e,
                    "Dropping undecodable packet"
                );
                return;
            }
        };

        debug!(
            peer = %self.handle.addr,
            kind = packet.kind(),
            serial = frame.serial,
            "Frame received"
        );

        if self.registered {
            if let Some(identity) = &self.identity {
                self.registry.touch(identity).await;
            }
        }

        match packet {
            Packet::Login(login) => self.on_login(login).await,
            Packet::Heartbeat { identity } => self.on_heartbeat(identity).await,
            Packet::Status(status) => {
                if let Some(identity) = self.attributed("status") {
                    self.enqueue(BackendJob::Status { identity, status }).await;
                }
            }
            Packet::Location(fix) => self.on_fix(&frame, fix, None).await,
            Packet::Alarm { fix, alarm } => self.on_fix(&frame, fix, Some(alarm)).await,
            Packet::Unknown { protocol } => {
                warn!(
                    peer = %self.handle.addr,
                    protocol = format_args!("{protocol:#04x}"),
                    "Dropping frame with unsupported protocol"
                );
                return;
            }
        }

        self.acknowledge(&frame).await;
    }

    async fn on_login(&mut self, login: Login) {
        let identity = login.identity;

        // Same socket, different device: drop the old binding first
        if let Some(previous) = self.identity.take() {
            if self.registered && previous != identity {
                self.registry.release(&previous, self.handle.connection_id).await;
            }
        }

        if let Some(replaced) = self
            .registry
            .upsert(identity.clone(), self.handle.clone())
            .await
        {
            if replaced.connection_id != self.handle.connection_id {
                info!(
                    imei = %identity,
                    old_peer = %replaced.addr,
                    new_peer = %self.handle.addr,
                    "Session superseded by new connection"
                );
            }
        }

        self.identity = Some(identity.clone());
        self.registered = true;
        info!(imei = %identity, peer = %self.handle.addr, "Device logged in");

        self.enqueue(BackendJob::Login {
            identity,
            capability: login.capability,
        })
        .await;
    }

    async fn on_heartbeat(&mut self, identity: DeviceIdentity) {
        match &self.identity {
            None => {
                debug!(
                    imei = %identity,
                    peer = %self.handle.addr,
                    "Heartbeat before login; tracking identity without a session"
                );
                self.identity = Some(identity.clone());
            }
            Some(bound) if *bound != identity => warn!(
                bound = %bound,
                reported = %identity,
                "Heartbeat identity differs from connection identity"
            ),
            Some(_) => {}
        }

        self.enqueue(BackendJob::Heartbeat { identity }).await;
    }

    async fn on_fix(&mut self, frame: &Frame, fix: Fix, alarm: Option<AlarmKind>) {
        let Some(identity) = self.attributed(if alarm.is_some() { "alarm" } else { "location" })
        else {
            return;
        };

        if let Some(alarm) = alarm {
            info!(imei = %identity, alarm = %alarm, "Alarm received");
        }

        self.enqueue(BackendJob::Fix {
            identity,
            fix,
            alarm,
            raw: frame.to_bytes().unwrap_or_default(),
        })
        .await;
    }

    /// Identity to persist a position/status frame under
    fn attributed(&self, kind: &'static str) -> Option<DeviceIdentity> {
        if self.identity.is_none() {
            warn!(peer = %self.handle.addr, kind, "Frame before login; not persisted");
        }
        self.identity.clone()
    }

    async fn enqueue(&self, job: BackendJob) {
        if self.jobs.send(job).await.is_err() {
            error!(peer = %self.handle.addr, "Backend sink stopped; dropping job");
        }
    }

    async fn acknowledge(&self, frame: &Frame) {
        if let Err(e) = self.handle.send(&ack_for(frame)).await {
            warn!(peer = %self.handle.addr, error = %e, "Failed to write acknowledgment");
        }
    }

    async fn close(&self) {
        let Some(identity) = self.identity.as_ref().filter(|_| self.registered) else {
            return;
        };

        if self.registry.release(identity, self.handle.connection_id).await {
            info!(imei = %identity, "Session released");
        } else {
            debug!(imei = %identity, "Session already superseded or swept");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use crate::notify::BroadcastNotifier;
    use crate::storage::{DeviceRecord, LocationRecord, MemoryStore, ProfileUpdate};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use prost::Message;
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, DuplexStream};
    use tokio::task::JoinHandle;
    use tokio::time::timeout;
    use tracker_shared::packet::{alarm_payload, protocol};
    use tracker_shared::{codec, ack_code, CellTower, FixUpdate, StatusFlags, FIX_UPDATE_TOPIC};

    const IMEI: &str = "123456789012345";

    fn imei() -> DeviceIdentity {
        DeviceIdentity::parse(IMEI).unwrap()
    }

    fn addr() -> SocketAddr {
        "192.0.2.10:51000".parse().unwrap()
    }

    fn frame(protocol: u8, serial: u16, payload: &[u8]) -> Vec<u8> {
        codec::encode(protocol, serial, payload).unwrap().to_vec()
    }

    fn login_frame(serial: u16) -> Vec<u8> {
        frame(
            protocol::LOGIN,
            serial,
            &Login::payload(&imei(), &[0x36, 0x08, 0x01, 0x00, 0x32, 0x01]),
        )
    }

    fn sample_fix() -> Fix {
        Fix {
            timestamp: Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap(),
            satellites: 8,
            latitude: 1.0,
            longitude: 103.5,
            speed: 48,
            course: 135,
            course_status: 0b0001,
            cell: CellTower {
                mcc: 525,
                mnc: 1,
                lac: 0x0102,
                cell_id: 0x0304,
            },
            flags: StatusFlags::from_byte(0x60),
            battery: 80,
        }
    }

    struct Harness {
        device: DuplexStream,
        decoder: FrameDecoder,
        task: JoinHandle<()>,
    }

    impl Harness {
        fn start(ctx: IngestContext) -> Self {
            let (device, server) = tokio::io::duplex(4096);
            Self {
                device,
                decoder: FrameDecoder::new(),
                task: tokio::spawn(serve_connection(server, addr(), ctx)),
            }
        }

        async fn send(&mut self, bytes: &[u8]) {
            self.device.write_all(bytes).await.unwrap();
        }

        async fn read_frame(&mut self) -> Frame {
            let mut buf = [0u8; 256];
            loop {
                if let Ok(Some(frame)) = self.decoder.decode_next() {
                    return frame;
                }
                let n = timeout(Duration::from_secs(2), self.device.read(&mut buf))
                    .await
                    .expect("timed out waiting for a frame")
                    .unwrap();
                assert!(n > 0, "server closed the connection");
                self.decoder.extend(&buf[..n]);
            }
        }

        /// Close the device side and wait for the worker and sink to finish
        async fn close(self) {
            drop(self.device);
            timeout(Duration::from_secs(2), self.task)
                .await
                .expect("worker did not stop")
                .unwrap();
        }
    }

    struct Backends {
        registry: Arc<SessionRegistry>,
        store: Arc<MemoryStore>,
        notifier: Arc<BroadcastNotifier>,
    }

    impl Backends {
        fn new() -> Self {
            Self {
                registry: Arc::new(SessionRegistry::new()),
                store: Arc::new(MemoryStore::new()),
                notifier: Arc::new(BroadcastNotifier::new(16)),
            }
        }

        fn context(&self) -> IngestContext {
            IngestContext::new(self.registry.clone(), self.store.clone(), self.notifier.clone())
        }
    }

    struct FailingStore;

    #[async_trait]
    impl DeviceStore for FailingStore {
        async fn upsert_device(
            &self,
            _identity: &DeviceIdentity,
            _update: ProfileUpdate,
        ) -> Result<DeviceRecord, StorageError> {
            Err(StorageError::Backend("database unavailable".into()))
        }

        async fn append_location(&self, _record: LocationRecord) -> Result<(), StorageError> {
            Err(StorageError::Backend("database unavailable".into()))
        }

        async fn update_last_fix(
            &self,
            _identity: &DeviceIdentity,
            _fix: &Fix,
        ) -> Result<(), StorageError> {
            Err(StorageError::Backend("database unavailable".into()))
        }
    }

    #[tokio::test]
    async fn test_login_then_location_end_to_end() {
        let backends = Backends::new();
        let mut updates = backends.notifier.subscribe();
        let mut conn = Harness::start(backends.context());

        conn.send(&login_frame(1)).await;
        let ack = conn.read_frame().await;
        assert_eq!(ack.to_bytes().unwrap(), codec::ack(protocol::LOGIN, 1, ack_code::LOGIN_OK));

        assert_eq!(backends.registry.count().await, 1);
        let session = backends.registry.get(&imei()).await.expect("session registered");
        assert_eq!(session.addr, addr());

        conn.send(&frame(protocol::LOCATION, 2, &sample_fix().to_payload())).await;
        let ack = conn.read_frame().await;
        assert_eq!(ack.protocol, protocol::LOCATION);
        assert_eq!(ack.serial, 2);
        assert_eq!(&ack.payload[..], &[ack_code::OK]);

        let notification = timeout(Duration::from_secs(2), updates.recv())
            .await
            .expect("no fix update published")
            .unwrap();
        assert_eq!(notification.topic, FIX_UPDATE_TOPIC);
        let update = FixUpdate::decode(notification.payload).unwrap();
        assert_eq!(update.imei, IMEI);
        assert_eq!(update.latitude, 1.0);
        assert_eq!(update.speed_kmh, 48);
        assert_eq!(update.heading, 135);
        assert!(update.alarm.is_none());

        conn.close().await;

        assert_eq!(backends.registry.count().await, 0);

        let record = backends.store.device(&imei()).await.expect("device record");
        assert_eq!(record.device_name, format!("Device-{IMEI}"));
        assert_eq!(record.capability.as_deref(), Some("360801003201"));
        assert_eq!(record.last_fix, Some(sample_fix()));

        let history = backends.store.locations_for(&imei()).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].fix.latitude, 1.0);
        assert!(history[0].raw.starts_with("7878"));
    }

    #[tokio::test]
    async fn test_alarm_and_status_are_persisted() {
        let backends = Backends::new();
        let mut updates = backends.notifier.subscribe();
        let mut conn = Harness::start(backends.context());

        conn.send(&login_frame(1)).await;
        conn.read_frame().await;

        conn.send(&frame(protocol::STATUS, 2, &[0x50, 33, 4])).await;
        assert_eq!(conn.read_frame().await.protocol, protocol::STATUS);

        let payload = alarm_payload(&sample_fix(), AlarmKind::Sos);
        conn.send(&frame(protocol::ALARM, 3, &payload)).await;
        assert_eq!(conn.read_frame().await.protocol, protocol::ALARM);

        let update = FixUpdate::decode(updates.recv().await.unwrap().payload).unwrap();
        assert_eq!(update.alarm.as_deref(), Some("SOS"));

        conn.close().await;

        let record = backends.store.device(&imei()).await.unwrap();
        let status = record.last_status.expect("status stored");
        assert!(status.flags.gps_fixed && status.flags.charging);
        assert_eq!(status.battery, 33);
        assert_eq!(
            backends.store.locations_for(&imei()).await[0].alarm,
            Some(AlarmKind::Sos)
        );
    }

    #[tokio::test]
    async fn test_two_frames_in_one_write_are_acked_in_order() {
        let backends = Backends::new();
        let mut conn = Harness::start(backends.context());

        let mut chunk = login_frame(10);
        chunk.extend(frame(protocol::HEARTBEAT, 11, &imei().to_bcd()));
        conn.send(&chunk).await;

        assert_eq!(conn.read_frame().await.serial, 10);
        assert_eq!(conn.read_frame().await.serial, 11);
        conn.close().await;
    }

    #[tokio::test]
    async fn test_frame_split_across_writes() {
        let backends = Backends::new();
        let mut conn = Harness::start(backends.context());

        let login = login_frame(1);
        conn.send(&login[..7]).await;
        tokio::task::yield_now().await;
        conn.send(&login[7..]).await;

        assert_eq!(conn.read_frame().await.protocol, protocol::LOGIN);
        assert_eq!(backends.registry.count().await, 1);
        conn.close().await;
    }

    #[tokio::test]
    async fn test_garbage_and_unknown_frames_do_not_close_connection() {
        let backends = Backends::new();
        let mut conn = Harness::start(backends.context());

        let mut corrupt = login_frame(1);
        corrupt[6] ^= 0xFF;

        conn.send(&[0x00, 0x13, 0x37]).await;
        conn.send(&corrupt).await;
        conn.send(&frame(0x22, 2, &[1, 2, 3])).await;
        conn.send(&login_frame(3)).await;

        // Neither the corrupt nor the unknown frame is acknowledged
        let ack = conn.read_frame().await;
        assert_eq!(ack.protocol, protocol::LOGIN);
        assert_eq!(ack.serial, 3);
        assert_eq!(backends.registry.count().await, 1);
        conn.close().await;
    }

    #[tokio::test]
    async fn test_frames_before_login_are_not_registered() {
        let backends = Backends::new();
        let mut conn = Harness::start(backends.context());

        conn.send(&frame(protocol::LOCATION, 1, &sample_fix().to_payload())).await;
        assert_eq!(conn.read_frame().await.protocol, protocol::LOCATION);

        conn.send(&frame(protocol::HEARTBEAT, 2, &imei().to_bcd())).await;
        assert_eq!(conn.read_frame().await.protocol, protocol::HEARTBEAT);
        assert_eq!(backends.registry.count().await, 0);

        conn.send(&frame(protocol::LOCATION, 3, &sample_fix().to_payload())).await;
        conn.read_frame().await;
        conn.close().await;

        // First fix had no identity; the second is attributed via the heartbeat
        assert_eq!(backends.store.location_count().await, 1);
        assert!(backends.store.device(&imei()).await.is_some());
    }

    #[tokio::test]
    async fn test_storage_failure_does_not_block_acks() {
        let registry = Arc::new(SessionRegistry::new());
        let notifier = Arc::new(BroadcastNotifier::new(16));
        let mut updates = notifier.subscribe();
        let ctx = IngestContext::new(registry.clone(), Arc::new(FailingStore), notifier.clone());
        let mut conn = Harness::start(ctx);

        conn.send(&login_frame(1)).await;
        assert_eq!(conn.read_frame().await.protocol, protocol::LOGIN);

        conn.send(&frame(protocol::LOCATION, 2, &sample_fix().to_payload())).await;
        assert_eq!(conn.read_frame().await.protocol, protocol::LOCATION);

        // Notification still goes out after both storage calls fail
        assert!(timeout(Duration::from_secs(2), updates.recv()).await.is_ok());
        assert_eq!(registry.count().await, 1);
        conn.close().await;
    }

    #[tokio::test]
    async fn test_redial_supersedes_old_connection() {
        let backends = Backends::new();
        let mut old = Harness::start(backends.context());
        let mut new = Harness::start(backends.context());

        old.send(&login_frame(1)).await;
        old.read_frame().await;
        let old_id = backends.registry.get(&imei()).await.unwrap().connection_id;

        new.send(&login_frame(1)).await;
        new.read_frame().await;
        let new_id = backends.registry.get(&imei()).await.unwrap().connection_id;
        assert_ne!(old_id, new_id);

        old.close().await;
        assert_eq!(
            backends.registry.get(&imei()).await.map(|h| h.connection_id),
            Some(new_id)
        );

        new.close().await;
        assert_eq!(backends.registry.count().await, 0);
    }
}
