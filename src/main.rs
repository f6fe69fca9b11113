// ===============================
// src/main.rs
// ===============================
/*
 cd /home/kukuhtw/rust/degiro_autotrader

 # jalankan server (default subcommand)
 BUDGET=10000 LISTENER_PASSWORD=secret cargo run --release

 # kirim instruksi & hentikan server
 cargo run -- send intents.json
 cargo run -- stop

 # konfigurasi aktif
 curl -s localhost:9898/metrics | grep '^config_broker'
*/
/*
=============================================================================
Project : degiro_autotrader - Degiro session & order execution engine in Rust
Module  : main.rs
Version : 0.5.0
Author  : Kukuh Tripamungkas Wicaksono (Kukuh TW)
Email   : kukuhtw@gmail.com
WhatsApp: https://wa.me/628129893706
LinkedIn: https://id.linkedin.com/in/kukuhtw
License : MIT (see LICENSE)

Summary : Listens for authenticated trade messages on a local control
          channel, sizes them against a budget, refreshes the broker
          session and places two-phase limit orders on Degiro.

(c) 2025 Kukuh TW. All rights reserved where applicable.
=============================================================================
*/
mod domain;
mod config;
mod metrics;
mod risk;
mod broker;           // capability trait + session context
mod degiro;           // wire types & endpoints
mod gateway_degiro;   // real Degiro REST client
mod executor;
mod handshake;
mod control;          // one-message-per-connection control listener

use anyhow::Context;
use serde_json::Value;
use tracing::{info, warn};

use crate::broker::{Broker, SessionContext};
use crate::config::{Cli, Command};
use crate::control::{ControlClient, ControlServer};
use crate::executor::Dispatcher;
use crate::gateway_degiro::DegiroClient;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // ---- Load config ----
    let cli = config::load();

    match cli.command.clone().unwrap_or(Command::Serve) {
        Command::Serve => serve(&cli).await,
        Command::Send { file } => {
            let raw = std::fs::read_to_string(&file).with_context(|| format!("read {}", file.display()))?;
            let msg: Value = serde_json::from_str(&raw).with_context(|| format!("parse {}", file.display()))?;
            let mut client = ControlClient::connect(&cli.listener_addr(), &cli.listener_password).await?;
            client.send_close(&msg).await?;
            Ok(())
        }
        Command::Stop => {
            let mut client = ControlClient::connect(&cli.listener_addr(), &cli.listener_password).await?;
            client.stop_server().await?;
            Ok(())
        }
        Command::Orders { from, to, all } => {
            let (client, ctx) = signed_in(&cli).await?;
            let result = client.get_orders(&ctx, from.as_deref(), to.as_deref(), !all).await;
            sign_out(&client, &ctx).await;
            for o in result? {
                info!(
                    order_id = ?o.order_id,
                    product_id = ?o.product_id,
                    side = ?o.buysell,
                    size = o.size,
                    price = o.price,
                    status = ?o.status,
                    active = o.is_active,
                    created = ?o.created,
                    "order"
                );
            }
            Ok(())
        }
        Command::Cancel { order_id } => {
            let (client, ctx) = signed_in(&cli).await?;
            let result = client.cancel_order(&ctx, &order_id).await;
            sign_out(&client, &ctx).await;
            Ok(result?)
        }
        Command::Search { text, by, exchange, limit } => {
            let (client, ctx) = signed_in(&cli).await?;
            let ids = client.lookup(&ctx, &text, &by, exchange.as_deref(), limit).await;
            sign_out(&client, &ctx).await;
            if ids.is_empty() {
                warn!(%text, "no product found");
            }
            for (exchange, id) in ids {
                info!(%exchange, product_id = %id, "product");
            }
            Ok(())
        }
    }
}

async fn serve(cli: &Cli) -> anyhow::Result<()> {
    // ---- Metrics ----
    metrics::init();
    if let Some(port) = cli.metrics_port {
        metrics::serve_metrics(port);
    }

    let settings = cli.settings();
    let addr = cli.listener_addr();
    info!(
        broker = %settings.broker_name,
        exchange = %settings.exchange,
        budget = settings.budget,
        listener = %addr,
        "startup config"
    );
    if settings.budget <= 0.0 {
        warn!("BUDGET is not set, every trade intent will be rejected");
    }
    metrics::CONFIG_BROKER
        .with_label_values(&[settings.broker_name.as_str(), settings.exchange.as_str()])
        .set(1);

    let client = DegiroClient::new(&cli.base_url)?;
    let mut server = ControlServer::bind(&addr, &cli.listener_password).await?;
    if let Some(bound) = server.local_addr() {
        info!(%bound, "waiting for trading info");
    }
    let mut dispatcher = Dispatcher::new(client, settings);

    let result = server.run(&mut dispatcher).await;
    info!(state = ?server.state(), "control listener released");
    dispatcher.shutdown().await;
    if let Err(e) = &result {
        tracing::error!(error = %e, "trading server terminated");
    }
    result
}

async fn signed_in(cli: &Cli) -> anyhow::Result<(DegiroClient, SessionContext)> {
    let client = DegiroClient::new(&cli.base_url)?;
    let mut ctx = SessionContext::new();
    client.login(&mut ctx, &cli.credentials()).await?;
    client.get_config(&mut ctx).await?;
    client.get_account_profile(&mut ctx).await?;
    Ok((client, ctx))
}

async fn sign_out(client: &DegiroClient, ctx: &SessionContext) {
    if let Err(e) = client.logout(ctx).await {
        warn!(error = %e, "logout failed");
    }
}
