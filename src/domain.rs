// ===============================
// src/domain.rs
// ===============================
use std::fmt;
use std::str::FromStr;

use ahash::AHashMap as HashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Arah transaksi, persis seperti string yang dipakai Degiro ("BUY"/"SELL").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BuySell { Buy, Sell }

impl BuySell {
    pub fn as_str(&self) -> &'static str {
        match self { BuySell::Buy => "BUY", BuySell::Sell => "SELL" }
    }
}

impl FromStr for BuySell {
    type Err = OrderError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BUY" => Ok(BuySell::Buy),
            "SELL" => Ok(BuySell::Sell),
            other => Err(OrderError::UnknownSide(other.to_string())),
        }
    }
}

impl fmt::Display for BuySell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Order type codes: 0 limit, 1 stop limit, 2 market, 3 stop loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderType { Limit, StopLimit, Market, StopLoss }

impl OrderType {
    pub fn code(&self) -> u8 {
        match self {
            OrderType::Limit => 0,
            OrderType::StopLimit => 1,
            OrderType::Market => 2,
            OrderType::StopLoss => 3,
        }
    }
}

impl TryFrom<u8> for OrderType {
    type Error = OrderError;
    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(OrderType::Limit),
            1 => Ok(OrderType::StopLimit),
            2 => Ok(OrderType::Market),
            3 => Ok(OrderType::StopLoss),
            other => Err(OrderError::UnknownOrderType(other)),
        }
    }
}

/// Validity ("timeType" di API): 1 daily, 3 unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity { Daily, Unlimited }

impl Validity {
    pub fn code(&self) -> u8 {
        match self { Validity::Daily => 1, Validity::Unlimited => 3 }
    }
}

impl TryFrom<u8> for Validity {
    type Error = OrderError;
    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(Validity::Daily),
            3 => Ok(Validity::Unlimited),
            other => Err(OrderError::UnknownValidity(other)),
        }
    }
}

/// Exchanges yang dikenal. Mapping kode internal broker <-> kode pasar pendek.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Exchange { Xet, Fra }

impl Exchange {
    pub const ALL: [Exchange; 2] = [Exchange::Xet, Exchange::Fra];

    pub fn code(&self) -> u32 {
        match self { Exchange::Xet => 194, Exchange::Fra => 195 }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.code() == code)
    }

    pub fn as_str(&self) -> &'static str {
        match self { Exchange::Xet => "XET", Exchange::Fra => "FRA" }
    }
}

impl FromStr for Exchange {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|e| e.as_str() == s)
            .ok_or_else(|| format!("unknown exchange: {s:?}"))
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Field used to match products in a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchBy { Name, Isin, Symbol }

impl FromStr for SearchBy {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "name" => Ok(SearchBy::Name),
            "isin" => Ok(SearchBy::Isin),
            "symbol" => Ok(SearchBy::Symbol),
            other => Err(format!("search by {other:?} not supported (name|isin|symbol)")),
        }
    }
}

/// Selector for the per-account "update" endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind { CashFunds, Portfolio }

impl DataKind {
    pub fn as_str(&self) -> &'static str {
        match self { DataKind::CashFunds => "cashFunds", DataKind::Portfolio => "portfolio" }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrderError {
    #[error("only \"BUY\" or \"SELL\" allowed, got {0:?}")]
    UnknownSide(String),
    #[error("only 0 (limit), 1 (stop limit), 2 (market) or 3 (stop loss) allowed, got {0}")]
    UnknownOrderType(u8),
    #[error("only 1 (daily) or 3 (unlimited) allowed, got {0}")]
    UnknownValidity(u8),
    #[error("order size must not be zero")]
    ZeroSize,
    #[error("limit is required for limit order")]
    LimitRequired,
    #[error("limit is not allowed for market order")]
    LimitNotAllowed,
    #[error("stop loss is not allowed for {0} order")]
    StopLossNotAllowed(&'static str),
}

/// Order yang sudah tervalidasi dan siap dikirim ke checkOrder.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub buy_sell: BuySell,
    pub product_id: String,
    pub size: u64,
    pub limit: Option<f64>,
    pub stop_loss: Option<f64>,
    pub order_type: OrderType,
    pub validity: Validity,
}

impl OrderRequest {
    /// Validates size and the limit/stop combination for the order type.
    /// A price of exactly zero counts as unset.
    pub fn new(
        buy_sell: BuySell,
        product_id: impl Into<String>,
        size: u64,
        limit: Option<f64>,
        stop_loss: Option<f64>,
        order_type: OrderType,
        validity: Validity,
    ) -> Result<Self, OrderError> {
        let limit = limit.filter(|p| *p != 0.0);
        let stop_loss = stop_loss.filter(|p| *p != 0.0);

        if size == 0 {
            return Err(OrderError::ZeroSize);
        }
        match order_type {
            OrderType::Limit => {
                if limit.is_none() {
                    return Err(OrderError::LimitRequired);
                }
                if stop_loss.is_some() {
                    return Err(OrderError::StopLossNotAllowed("limit"));
                }
            }
            OrderType::Market => {
                if limit.is_some() {
                    return Err(OrderError::LimitNotAllowed);
                }
                if stop_loss.is_some() {
                    return Err(OrderError::StopLossNotAllowed("market"));
                }
            }
            OrderType::StopLimit | OrderType::StopLoss => {}
        }

        Ok(Self { buy_sell, product_id: product_id.into(), size, limit, stop_loss, order_type, validity })
    }
}

/// Hasil akhir handshake dua fase.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderConfirmation {
    pub confirmation_id: String,
    pub order_id: String,
    /// Informational only, summed per currency from the check phase.
    pub fees: HashMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PortfolioPosition {
    pub product_id: String,
    pub position_type: String,
    pub break_even_price: f64,
    pub price: f64,
    pub size: f64,
    pub value: f64,
}

/// Order history row.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRecord {
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default, deserialize_with = "crate::degiro::de_opt_id")]
    pub product_id: Option<String>,
    #[serde(default)]
    pub size: f64,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub buysell: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub created: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limit_order(limit: Option<f64>, stop: Option<f64>, ty: OrderType) -> Result<OrderRequest, OrderError> {
        OrderRequest::new(BuySell::Buy, "331868", 10, limit, stop, ty, Validity::Daily)
    }

    #[test]
    fn limit_order_needs_limit_and_no_stop() {
        assert_eq!(limit_order(None, None, OrderType::Limit), Err(OrderError::LimitRequired));
        assert_eq!(
            limit_order(Some(12.5), Some(11.0), OrderType::Limit),
            Err(OrderError::StopLossNotAllowed("limit"))
        );
        assert!(limit_order(Some(12.5), None, OrderType::Limit).is_ok());
    }

    #[test]
    fn market_order_rejects_prices() {
        assert_eq!(limit_order(Some(12.5), None, OrderType::Market), Err(OrderError::LimitNotAllowed));
        assert_eq!(
            limit_order(None, Some(11.0), OrderType::Market),
            Err(OrderError::StopLossNotAllowed("market"))
        );
        assert!(limit_order(None, None, OrderType::Market).is_ok());
    }

    #[test]
    fn stop_orders_accept_any_combination() {
        assert!(limit_order(Some(1.0), Some(2.0), OrderType::StopLimit).is_ok());
        assert!(limit_order(None, Some(2.0), OrderType::StopLoss).is_ok());
    }

    #[test]
    fn zero_size_rejected() {
        let r = OrderRequest::new(BuySell::Sell, "1", 0, Some(1.0), None, OrderType::Limit, Validity::Daily);
        assert_eq!(r, Err(OrderError::ZeroSize));
    }

    #[test]
    fn enum_membership() {
        assert!("HOLD".parse::<BuySell>().is_err());
        assert!("buy".parse::<BuySell>().is_err());
        assert_eq!("SELL".parse::<BuySell>(), Ok(BuySell::Sell));
        assert_eq!(Validity::try_from(2), Err(OrderError::UnknownValidity(2)));
        assert_eq!(Validity::try_from(3).map(|v| v.code()), Ok(3));
        assert_eq!(OrderType::try_from(4), Err(OrderError::UnknownOrderType(4)));
        assert!("ticker".parse::<SearchBy>().is_err());
    }

    #[test]
    fn exchange_table_is_bidirectional() {
        assert_eq!(Exchange::from_code(194), Some(Exchange::Xet));
        assert_eq!(Exchange::from_code(195), Some(Exchange::Fra));
        assert_eq!(Exchange::from_code(196), None);
        assert_eq!("XET".parse::<Exchange>().map(|e| e.code()), Ok(194));
        assert_eq!("FRA".parse::<Exchange>().map(|e| e.code()), Ok(195));
        assert!("NYSE".parse::<Exchange>().is_err());
    }
}
