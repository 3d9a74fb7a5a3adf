mod connection;
mod tracker;
mod transport;

use anyhow::Context;
use clap::Parser;
use connection::{ConnectionEvent, ConnectionManager, EmulatorConfig};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use tracker_shared::{ack_code, timing, AlarmKind, DeviceIdentity};
use transport::TcpConnector;

/// Plays a GPS tracker against the ingest server
#[derive(Parser, Debug)]
#[command(name = "tracker-emulator", version)]
struct Args {
    /// Server device port
    #[arg(long, env = "TRACKER_SERVER", default_value = "127.0.0.1:5020")]
    server: String,

    /// 15-digit IMEI to log in with
    #[arg(long, env = "TRACKER_IMEI", default_value = "358920100000001")]
    imei: DeviceIdentity,

    #[arg(long, default_value_t = 12.9716, allow_negative_numbers = true)]
    lat: f64,

    #[arg(long, default_value_t = 77.5946, allow_negative_numbers = true)]
    lon: f64,

    /// Degrees clockwise from north
    #[arg(long, default_value_t = 90)]
    heading: u16,

    #[arg(long, default_value_t = 40)]
    speed: u8,

    #[arg(long, default_value_t = timing::HEARTBEAT_INTERVAL_SECS)]
    heartbeat_secs: u64,

    #[arg(long, default_value_t = timing::REPORT_INTERVAL_SECS)]
    report_secs: u64,

    /// Alarm code (hex or decimal) to raise after each login, e.g. 0x01 for SOS
    #[arg(long, value_parser = parse_alarm)]
    alarm: Option<AlarmKind>,

    /// Default log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: tracing::Level,
}

fn parse_alarm(s: &str) -> Result<AlarmKind, String> {
    let code = match s.strip_prefix("0x") {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse(),
    }
    .map_err(|e| format!("invalid alarm code {s:?}: {e}"))?;
    Ok(AlarmKind::from_code(code))
}

impl Args {
    fn config(&self) -> anyhow::Result<EmulatorConfig> {
        if self.heartbeat_secs == 0 || self.report_secs == 0 {
            anyhow::bail!("heartbeat and report intervals must be at least one second");
        }
        Ok(EmulatorConfig {
            latitude: self.lat,
            longitude: self.lon,
            heading: self.heading,
            speed_kmh: self.speed,
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs),
            report_interval: Duration::from_secs(self.report_secs),
            alarm_on_connect: self.alarm,
            ..EmulatorConfig::new(self.imei.clone())
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(args.log_level.into()))
        .init();

    let config = args.config().context("invalid emulator arguments")?;
    info!(
        imei = %config.identity,
        server = %args.server,
        heartbeat_secs = args.heartbeat_secs,
        report_secs = args.report_secs,
        "Tracker emulator starting"
    );

    let mut conn = ConnectionManager::new(config, TcpConnector::new(args.server.clone()));

    loop {
        tokio::select! {
            event = conn.recv() => match event {
                Some(event) => log_event(conn.identity(), event),
                None => {
                    error!("Connection loop ended");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                conn.stop();
                break;
            }
        }
    }

    Ok(())
}

fn log_event(imei: &DeviceIdentity, event: ConnectionEvent) {
    match event {
        ConnectionEvent::Connected { endpoint } => {
            info!(imei = %imei, endpoint = %endpoint, "Connected, login sent");
        }
        ConnectionEvent::Disconnected { reason } => {
            warn!(imei = %imei, reason = %reason, "Disconnected");
        }
        ConnectionEvent::ConnectionFailed { reason, retry_in } => {
            warn!(reason = %reason, retry_in_ms = retry_in.as_millis() as u64, "Connect failed");
        }
        ConnectionEvent::Acknowledged {
            protocol,
            serial,
            code,
        } => {
            let accepted = code == ack_code::for_protocol(protocol);
            info!(
                protocol = format_args!("{protocol:#04x}"),
                serial,
                code,
                accepted,
                "<<< Ack"
            );
        }
        ConnectionEvent::Command(frame) => {
            info!(
                protocol = format_args!("{:#04x}", frame.protocol),
                serial = frame.serial,
                payload = %hex::encode(&frame.payload),
                "<<< Command"
            );
        }
    }
}
