// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : degiro_autotrader - Degiro session & order execution engine in Rust
Module  : config.rs
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
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use dotenvy::dotenv;

use crate::broker::Credentials;
use crate::degiro::DEFAULT_BASE_URL;
use crate::domain::Exchange;
use crate::executor::TradingSettings;

#[derive(Parser, Debug, Clone)]
#[command(name = "degiro_autotrader", version, about = "Degiro order execution engine")]
pub struct Cli {
    #[arg(long, env = "DEGIRO_USER", default_value = "")]
    pub user: String,
    #[arg(long, env = "DEGIRO_PASSWORD", default_value = "", hide_env_values = true)]
    pub password: String,
    #[arg(long, env = "DEGIRO_BASE_URL", default_value = DEFAULT_BASE_URL)]
    pub base_url: String,

    /// Messages addressed to any other broker are dropped.
    #[arg(long, env = "BROKER_NAME", default_value = "degiro")]
    pub broker_name: String,
    #[arg(long, env = "EXCHANGE", default_value = "XET")]
    pub exchange: Exchange,
    /// Trading budget; 0 rejects every intent.
    #[arg(long, env = "BUDGET", default_value_t = 0.0, value_parser = parse_budget)]
    pub budget: f64,

    #[arg(long, env = "LISTENER_HOST", default_value = "127.0.0.1")]
    pub listener_host: String,
    #[arg(long, env = "LISTENER_PORT", default_value_t = 6000)]
    pub listener_port: u16,
    #[arg(long, env = "LISTENER_PASSWORD", default_value = "", hide_env_values = true)]
    pub listener_password: String,

    #[arg(long, env = "METRICS_PORT")]
    pub metrics_port: Option<u16>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the control listener (default)
    Serve,
    /// Send a JSON instruction file to a running server
    Send { file: PathBuf },
    /// Ask a running server to shut down
    Stop,
    /// List orders (active only unless --all)
    Orders {
        /// dd.mm.YYYY
        #[arg(long)]
        from: Option<String>,
        /// dd.mm.YYYY
        #[arg(long)]
        to: Option<String>,
        #[arg(long)]
        all: bool,
    },
    /// Cancel an order by id
    Cancel { order_id: String },
    /// Look up product ids per exchange
    Search {
        text: String,
        /// name | isin | symbol
        #[arg(long, default_value = "isin")]
        by: String,
        #[arg(long)]
        exchange: Option<String>,
        #[arg(long)]
        limit: Option<u32>,
    },
}

fn parse_budget(raw: &str) -> Result<f64, String> {
    let budget: f64 = raw.trim().parse().map_err(|e| format!("{raw:?}: {e}"))?;
    if !budget.is_finite() || budget < 0.0 {
        return Err(format!("budget must be a finite non-negative number, got {raw:?}"));
    }
    Ok(budget)
}

impl Cli {
    pub fn listener_addr(&self) -> String {
        format!("{}:{}", self.listener_host, self.listener_port)
    }

    pub fn credentials(&self) -> Credentials {
        Credentials { username: self.user.clone(), password: self.password.clone() }
    }

    pub fn settings(&self) -> TradingSettings {
        TradingSettings {
            broker_name: self.broker_name.clone(),
            exchange: self.exchange,
            budget: self.budget,
            credentials: self.credentials(),
        }
    }
}

pub fn load() -> Cli {
    // Pastikan .env dibaca sebelum clap membaca env
    let _ = dotenv();
    Cli::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_subcommands() {
        let cli = Cli::try_parse_from(["bot", "--user", "jan", "--budget", "10000"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.exchange, Exchange::Xet);
        assert_eq!(cli.listener_addr(), "127.0.0.1:6000");
        let s = cli.settings();
        assert_eq!(s.budget, 10_000.0);
        assert_eq!(s.credentials.username, "jan");

        let cli = Cli::try_parse_from(["bot", "--exchange", "FRA", "orders", "--all"]).unwrap();
        assert_eq!(cli.exchange, Exchange::Fra);
        assert!(matches!(cli.command, Some(Command::Orders { all: true, from: None, to: None })));
    }

    #[test]
    fn non_finite_budget_is_rejected() {
        for bad in ["NaN", "inf", "-inf", "-5", "lots"] {
            assert!(Cli::try_parse_from(["bot", "--budget", bad]).is_err(), "{bad}");
        }
        let cli = Cli::try_parse_from(["bot", "--budget", "2500.5"]).unwrap();
        assert_eq!(cli.budget, 2500.5);
    }

    #[test]
    fn unknown_exchange_is_rejected() {
        assert!(Cli::try_parse_from(["bot", "--exchange", "NYSE"]).is_err());
    }
}
