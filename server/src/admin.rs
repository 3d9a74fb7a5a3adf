//! Line-oriented operator console
//!
//! One command per line, one reply per command:
//!
//! ```text
//! LIST                                   -> "<imei> <peer> <idle_secs>" per session, then "OK <count>"
//! SEND <imei> <hex>                      -> OK | NOT_CONNECTED
//! FRAME <imei> <protocol-hex> <payload-hex>
//! ```
//!
//! Malformed input gets `ERR <reason>`.

use crate::command::CommandDispatcher;
use crate::session::SessionRegistry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};
use tracker_shared::DeviceIdentity;

pub struct AdminConsole {
    registry: Arc<SessionRegistry>,
    dispatcher: Arc<CommandDispatcher>,
}

impl AdminConsole {
    pub fn new(registry: Arc<SessionRegistry>, dispatcher: Arc<CommandDispatcher>) -> Self {
        Self {
            registry,
            dispatcher,
        }
    }

    /// Execute one console line and return the reply
    pub async fn execute(&self, line: &str) -> String {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return err("empty command");
        };
        let args: Vec<&str> = words.collect();

        match (verb.to_ascii_uppercase().as_str(), args.as_slice()) {
            ("LIST", []) => self.list().await,
            ("SEND", [imei, payload]) => {
                let identity = match DeviceIdentity::parse(imei) {
                    Ok(id) => id,
                    Err(e) => return err(e),
                };
                let bytes = match hex::decode(payload) {
                    Ok(b) if !b.is_empty() => b,
                    Ok(_) => return err("empty payload"),
                    Err(e) => return err(e),
                };
                delivery(self.dispatcher.send(&identity, &bytes).await)
            }
            ("FRAME", [imei, protocol, payload]) => {
                let identity = match DeviceIdentity::parse(imei) {
                    Ok(id) => id,
                    Err(e) => return err(e),
                };
                let protocol = match u8::from_str_radix(protocol.trim_start_matches("0x"), 16) {
                    Ok(p) => p,
                    Err(e) => return err(e),
                };
                let bytes = match hex::decode(payload) {
                    Ok(b) => b,
                    Err(e) => return err(e),
                };
                match self.dispatcher.send_frame(&identity, protocol, &bytes).await {
                    Ok(sent) => delivery(sent),
                    Err(e) => err(e),
                }
            }
            ("LIST" | "SEND" | "FRAME", _) => err("wrong number of arguments"),
            _ => err(format!("unknown command {verb}")),
        }
    }

    async fn list(&self) -> String {
        let sessions = self.registry.list_active().await;
        let mut out = String::new();
        for s in &sessions {
            out.push_str(&format!("{} {} {}\n", s.identity, s.addr, s.idle.as_secs()));
        }
        out.push_str(&format!("OK {}", sessions.len()));
        out
    }

    /// Accept console clients until the listener fails
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        info!(addr = %listener.local_addr()?, "Admin console listening");
        loop {
            let (stream, peer) = listener.accept().await?;
            let console = self.clone();
            tokio::spawn(async move {
                if let Err(e) = console.handle_client(stream, peer).await {
                    warn!(peer = %peer, error = %e, "Admin client error");
                }
            });
        }
    }

    async fn handle_client(&self, stream: TcpStream, peer: SocketAddr) -> std::io::Result<()> {
        debug!(peer = %peer, "Admin client connected");
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let reply = self.execute(&line).await;
            writer.write_all(reply.as_bytes()).await?;
            writer.write_all(b"\n").await?;
        }

        debug!(peer = %peer, "Admin client disconnected");
        Ok(())
    }
}

fn delivery(sent: bool) -> String {
    if sent { "OK" } else { "NOT_CONNECTED" }.to_string()
}

fn err(reason: impl std::fmt::Display) -> String {
    format!("ERR {reason}")
}
