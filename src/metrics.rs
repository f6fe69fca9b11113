// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use tracing::{error, info};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Control channel --------
pub static CONTROL_MESSAGES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "control_messages_total",
            "control messages by kind (trade, shutdown, unknown, dropped)",
        ),
        &["kind"],
    )
    .unwrap()
});

// -------- Trading --------
pub static INTENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("trade_intents_total", "trade intents by outcome (placed, rejected, failed)"),
        &["outcome"],
    )
    .unwrap()
});

pub static ORDERS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("orders_confirmed_total", "orders confirmed by broker").unwrap());

pub static BROKER_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("broker_errors_total", "failed broker calls (label: op)"),
        &["op"],
    )
    .unwrap()
});

// ---- Config visibility ----
pub static CONFIG_BROKER: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_broker", "configured broker & exchange (labels: broker, exchange)"),
        &["broker", "exchange"],
    )
    .unwrap()
});

pub fn init() {
    for m in [
        REGISTRY.register(Box::new(CONTROL_MESSAGES.clone())),
        REGISTRY.register(Box::new(INTENTS.clone())),
        REGISTRY.register(Box::new(ORDERS.clone())),
        REGISTRY.register(Box::new(BROKER_ERRORS.clone())),
        REGISTRY.register(Box::new(CONFIG_BROKER.clone())),
    ] {
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Serve one HTTP request (GET / or /metrics), tiny HTTP 1.1 responder
fn handle_client(mut stream: TcpStream) {
    let mut _req_buf = [0u8; 1024];
    let _ = stream.read(&mut _req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

// Dedicated OS thread; never touches session state.
pub fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = match TcpListener::bind(&addr) {
            Ok(l) => l,
            Err(e) => {
                error!(%addr, ?e, "metrics bind failed");
                return;
            }
        };
        info!(%addr, "metrics listening on http://{addr}/ (and /metrics)");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => error!(?e, "metrics accept error"),
            }
        }
    });
}
