// ===============================
// src/control.rs
// ===============================
//
// Control channel: listener TCP yang menerima tepat satu pesan per koneksi.
// Setiap koneksi: handshake HMAC -> baca satu frame JSON -> tutup -> dispatch.
// Pesan: string "shutdown" (case-insensitive) atau objek {from, to, data}.
//
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::handshake::{self, HandshakeError};
use crate::metrics::CONTROL_MESSAGES;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingInfo {
    pub from: String,
    pub to: String,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    Shutdown,
    Trade(TradingInfo),
    UnknownText(String),
    Malformed(String),
}

impl ControlMessage {
    pub fn decode(bytes: &[u8]) -> Self {
        match serde_json::from_slice::<Value>(bytes) {
            Ok(Value::String(s)) if s.eq_ignore_ascii_case("shutdown") => ControlMessage::Shutdown,
            Ok(Value::String(s)) => ControlMessage::UnknownText(s),
            Ok(v @ Value::Object(_)) => match serde_json::from_value::<TradingInfo>(v) {
                Ok(info) => ControlMessage::Trade(info),
                Err(e) => ControlMessage::Malformed(format!("unexpected key in trading info: {e}")),
            },
            Ok(other) => ControlMessage::Malformed(format!("unknown type of message: {other}")),
            Err(e) => ControlMessage::Malformed(format!("not json: {e}")),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Shutdown => "shutdown",
            ControlMessage::Trade(_) => "trade",
            ControlMessage::UnknownText(_) | ControlMessage::Malformed(_) => "unknown",
        }
    }
}

/// Receives every authenticated trade message, in arrival order.
#[async_trait]
pub trait MessageHandler: Send {
    /// An `Err` is fatal: the server closes and `run` returns it.
    async fn on_trading_info(&mut self, info: TradingInfo) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Idle,
    Accepting,
    Serving,
    Closed,
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("address {0} is already in use")]
    AddrInUse(String),
    #[error("bind {addr}: {source}")]
    Bind { addr: String, source: std::io::Error },
    #[error("listener is closed")]
    Closed,
    #[error("connection to {0} refused, the server is down")]
    Refused(String),
    #[error("connect {addr}: {source}")]
    Connect { addr: String, source: std::io::Error },
    #[error("control channel: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("not connected")]
    NotConnected,
    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Pause before the next accept after `failures` consecutive errors (EMFILE and friends).
fn accept_backoff(failures: u32) -> Duration {
    Duration::from_millis(50u64.saturating_mul(1 << failures.min(7)))
}

pub struct ControlServer {
    listener: Option<TcpListener>,
    key: Vec<u8>,
    state: ServerState,
}

impl ControlServer {
    pub async fn bind(addr: &str, password: &str) -> Result<Self, ControlError> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            error!(%addr, error = %e, "control listener bind failed");
            if e.kind() == ErrorKind::AddrInUse {
                ControlError::AddrInUse(addr.to_string())
            } else {
                ControlError::Bind { addr: addr.to_string(), source: e }
            }
        })?;
        info!(%addr, "control listener ready");
        Ok(Self { listener: Some(listener), key: password.as_bytes().to_vec(), state: ServerState::Idle })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    /// Serves one connection at a time until a shutdown message arrives
    /// or the handler reports a fatal error. The listener is released either way.
    pub async fn run<H: MessageHandler>(&mut self, handler: &mut H) -> anyhow::Result<()> {
        let listener = self.listener.take().ok_or(ControlError::Closed)?;
        let result = self.serve(&listener, handler).await;
        drop(listener);
        self.state = ServerState::Closed;
        result
    }

    async fn serve<H: MessageHandler>(&mut self, listener: &TcpListener, handler: &mut H) -> anyhow::Result<()> {
        let mut failures = 0u32;
        loop {
            self.state = ServerState::Accepting;
            let (mut stream, peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    let pause = accept_backoff(failures);
                    failures = failures.saturating_add(1);
                    error!(error = %e, failures, retry_in_ms = pause.as_millis() as u64, "control accept failed");
                    tokio::time::sleep(pause).await;
                    continue;
                }
            };
            failures = 0;
            self.state = ServerState::Serving;
            debug!(%peer, state = ?self.state, "connection accepted");

            let received = receive(&mut stream, &self.key).await;
            let _ = stream.shutdown().await;
            drop(stream);

            let msg = match received {
                Ok(msg) => msg,
                Err(e) => {
                    CONTROL_MESSAGES.with_label_values(&["dropped"]).inc();
                    warn!(%peer, error = %e, "connection dropped");
                    continue;
                }
            };
            CONTROL_MESSAGES.with_label_values(&[msg.kind()]).inc();

            match msg {
                ControlMessage::Shutdown => {
                    info!(%peer, "shutdown requested, trading server stopped");
                    return Ok(());
                }
                ControlMessage::UnknownText(text) => warn!(%peer, %text, "got unknown text message"),
                ControlMessage::Malformed(reason) => error!(%peer, %reason, "message ignored"),
                ControlMessage::Trade(info) => handler.on_trading_info(info).await?,
            }
        }
    }
}

async fn receive(stream: &mut TcpStream, key: &[u8]) -> Result<ControlMessage, HandshakeError> {
    handshake::accept_auth(stream, key).await?;
    let frame = handshake::read_frame(stream).await?;
    Ok(ControlMessage::decode(&frame))
}

/// Authenticated sender for the control channel.
pub struct ControlClient {
    stream: Option<TcpStream>,
    addr: String,
}

impl ControlClient {
    pub async fn connect(addr: &str, password: &str) -> Result<Self, ControlError> {
        let mut stream = TcpStream::connect(addr).await.map_err(|e| {
            if e.kind() == ErrorKind::ConnectionRefused {
                error!(%addr, "connection refused, is the trading server running?");
                ControlError::Refused(addr.to_string())
            } else {
                error!(%addr, error = %e, "connect failed");
                ControlError::Connect { addr: addr.to_string(), source: e }
            }
        })?;
        if let Err(e) = handshake::connect_auth(&mut stream, password.as_bytes()).await {
            error!(%addr, error = %e, "control authentication failed");
            return Err(e.into());
        }
        Ok(Self { stream: Some(stream), addr: addr.to_string() })
    }

    #[cfg(test)]
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Fire-and-forget; the server sends no reply.
    pub async fn send(&mut self, msg: &Value) -> Result<(), ControlError> {
        let stream = self.stream.as_mut().ok_or(ControlError::NotConnected)?;
        let payload = serde_json::to_vec(msg)?;
        handshake::write_frame(stream, &payload).await?;
        info!(addr = %self.addr, bytes = payload.len(), "message sent");
        Ok(())
    }

    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
    }

    pub async fn send_close(&mut self, msg: &Value) -> Result<(), ControlError> {
        let sent = self.send(msg).await;
        self.close().await;
        sent
    }

    pub async fn stop_server(&mut self) -> Result<(), ControlError> {
        self.send_close(&Value::String("shutdown".into())).await
    }
}
