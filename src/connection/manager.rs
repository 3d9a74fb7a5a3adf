//! Connection manager with persistent uplink and automatic reconnection

use crate::tracker::SimulatedTracker;
use crate::transport::{TransportConnector, TransportStream};
use anyhow::{anyhow, Result};
use chrono::Utc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, timeout, Instant, MissedTickBehavior};
use tracing::debug;
use tracker_shared::packet::protocol;
use tracker_shared::{timing, AlarmKind, DeviceIdentity, Frame, FrameDecoder};

/// Events emitted by the connection manager
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Connected and login sent
    Connected { endpoint: String },
    /// Connection dropped; a reconnect follows
    Disconnected { reason: String },
    /// Connect attempt failed or timed out
    ConnectionFailed { reason: String, retry_in: Duration },
    /// Server acknowledged one of our frames
    Acknowledged { protocol: u8, serial: u16, code: u8 },
    /// Any other frame from the server
    Command(Frame),
}

/// Configuration for the emulated tracker
#[derive(Debug, Clone)]
pub struct EmulatorConfig {
    pub identity: DeviceIdentity,
    pub latitude: f64,
    pub longitude: f64,
    pub heading: u16,
    pub speed_kmh: u8,
    pub heartbeat_interval: Duration,
    pub report_interval: Duration,
    /// Raised once after every login
    pub alarm_on_connect: Option<AlarmKind>,
    /// Reconnection delay (initial)
    pub reconnect_delay: Duration,
    /// Maximum reconnection delay
    pub max_reconnect_delay: Duration,
    /// Connection timeout
    pub connect_timeout: Duration,
}

impl EmulatorConfig {
    /// Defaults for everything but the identity
    pub fn new(identity: DeviceIdentity) -> Self {
        Self {
            identity,
            latitude: 12.9716,
            longitude: 77.5946,
            heading: 90,
            speed_kmh: 40,
            heartbeat_interval: Duration::from_secs(timing::HEARTBEAT_INTERVAL_SECS),
            report_interval: Duration::from_secs(timing::REPORT_INTERVAL_SECS),
            alarm_on_connect: None,
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Runs the tracker's uplink on a background task
pub struct ConnectionManager {
    identity: DeviceIdentity,
    event_rx: mpsc::Receiver<ConnectionEvent>,
    task: JoinHandle<()>,
}

impl ConnectionManager {
    /// Create a new connection manager and start the connection loop
    pub fn new<C: TransportConnector>(config: EmulatorConfig, connector: C) -> Self {
        let (event_tx, event_rx) = mpsc::channel::<ConnectionEvent>(100);
        let identity = config.identity.clone();

        let task = tokio::spawn(async move {
            connection_loop(config, connector, event_tx).await;
        });

        Self {
            identity,
            event_rx,
            task,
        }
    }

    /// Receive the next connection event
    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        self.event_rx.recv().await
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Stop the connection loop
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Delay before the next attempt after `current`
fn next_backoff(current: Duration, max: Duration) -> Duration {
    std::cmp::min(current * 2, max)
}

/// Main connection loop with reconnection logic
async fn connection_loop<C: TransportConnector>(
    config: EmulatorConfig,
    connector: C,
    event_tx: mpsc::Sender<ConnectionEvent>,
) {
    let mut tracker = SimulatedTracker::new(
        config.identity.clone(),
        config.latitude,
        config.longitude,
        config.heading,
        config.speed_kmh,
    );
    let mut reconnect_delay = config.reconnect_delay;

    loop {
        match timeout(config.connect_timeout, connector.connect()).await {
            Ok(Ok(stream)) => {
                reconnect_delay = config.reconnect_delay;

                let endpoint = connector.endpoint();
                let reason = match handle_connection(stream, &config, &mut tracker, &event_tx, endpoint)
                    .await
                {
                    Ok(()) => "Server closed connection".to_string(),
                    Err(e) => e.to_string(),
                };
                let _ = event_tx.send(ConnectionEvent::Disconnected { reason }).await;
            }
            Ok(Err(e)) => {
                let _ = event_tx
                    .send(ConnectionEvent::ConnectionFailed {
                        reason: e.to_string(),
                        retry_in: reconnect_delay,
                    })
                    .await;
            }
            Err(_) => {
                let _ = event_tx
                    .send(ConnectionEvent::ConnectionFailed {
                        reason: format!("timed out after {:?}", config.connect_timeout),
                        retry_in: reconnect_delay,
                    })
                    .await;
            }
        }

        if event_tx.is_closed() {
            return;
        }

        tokio::time::sleep(reconnect_delay).await;
        reconnect_delay = next_backoff(reconnect_delay, config.max_reconnect_delay);
    }
}

/// Drive one live connection, closing the transport if it fails
async fn handle_connection<S: TransportStream>(
    mut stream: S,
    config: &EmulatorConfig,
    tracker: &mut SimulatedTracker,
    event_tx: &mpsc::Sender<ConnectionEvent>,
    endpoint: &str,
) -> Result<()> {
    let result = drive(&mut stream, config, tracker, event_tx, endpoint).await;
    if result.is_err() {
        let _ = TransportStream::shutdown(&mut stream).await;
    }
    result
}

/// Log in, then report until the server closes the stream or a write fails
async fn drive<S>(
    stream: S,
    config: &EmulatorConfig,
    tracker: &mut SimulatedTracker,
    event_tx: &mpsc::Sender<ConnectionEvent>,
    endpoint: &str,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);

    writer.write_all(&tracker.login_frame()?).await?;
    writer.write_all(&tracker.status_frame()?).await?;
    if let Some(alarm) = config.alarm_on_connect {
        writer.write_all(&tracker.alarm_frame(alarm, Utc::now())?).await?;
    }
    let _ = event_tx
        .send(ConnectionEvent::Connected {
            endpoint: endpoint.to_string(),
        })
        .await;

    let mut decoder = FrameDecoder::new();
    let mut read_buf = vec![0u8; 1024];

    let mut heartbeat = interval_at(
        Instant::now() + config.heartbeat_interval,
        config.heartbeat_interval,
    );
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut report = interval(config.report_interval);
    report.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_report = Instant::now();

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                writer.write_all(&tracker.heartbeat_frame()?).await?;
            }

            _ = report.tick() => {
                let now = Instant::now();
                let elapsed = now - last_report;
                last_report = now;
                writer.write_all(&tracker.location_frame(elapsed, Utc::now())?).await?;
                let (lat, lon) = tracker.position();
                debug!(lat, lon, ">>> Location");
            }

            result = reader.read(&mut read_buf) => {
                let n = result.map_err(|e| anyhow!("Read error: {e}"))?;
                if n == 0 {
                    return Ok(());
                }
                decoder.extend(&read_buf[..n]);

                loop {
                    match decoder.decode_next() {
                        Ok(Some(frame)) => {
                            let _ = event_tx.send(classify(frame)).await;
                        }
                        Ok(None) => break,
                        Err(e) => debug!(error = %e, "Skipped malformed inbound frame"),
                    }
                }
            }
        }
    }
}

/// Acknowledgments echo one of our protocols with a single response byte
fn classify(frame: Frame) -> ConnectionEvent {
    let ours = matches!(
        frame.protocol,
        protocol::LOGIN | protocol::HEARTBEAT | protocol::LOCATION | protocol::STATUS | protocol::ALARM
    );
    if ours && frame.payload.len() == 1 {
        ConnectionEvent::Acknowledged {
            protocol: frame.protocol,
            serial: frame.serial,
            code: frame.payload[0],
        }
    } else {
        ConnectionEvent::Command(frame)
    }
}
