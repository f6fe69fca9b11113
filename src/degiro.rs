// ===============================
// src/degiro.rs
// ===============================
//
// Helper untuk Degiro: endpoint builder + model wire (request/response).
// Semua respons di-parse lewat struct eksplisit; kegagalan parse dilaporkan
// sebagai BrokerError::Parse oleh gateway, bukan panic.
//
use ahash::AHashMap as HashMap;
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value;
use url::Url;

use crate::domain::{OrderRequest, PortfolioPosition};

pub const DEFAULT_BASE_URL: &str = "https://trader.degiro.nl/";

pub const USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.11 (KHTML, like Gecko) Chrome/23.0.1271.64 Safari/537.11";

pub type CashPosition = HashMap<String, f64>;
pub type Portfolio = HashMap<String, PortfolioPosition>;

/// Endpoint builder relative to a single base URL (swappable for tests).
#[derive(Debug, Clone)]
pub struct Endpoints {
    base: Url,
}

impl Endpoints {
    pub fn new(base: &str) -> Result<Self, url::ParseError> {
        let mut base = Url::parse(base)?;
        if !base.path().ends_with('/') {
            let p = format!("{}/", base.path());
            base.set_path(&p);
        }
        Ok(Self { base })
    }

    fn at(&self, path: &str) -> Result<Url, url::ParseError> {
        self.base.join(path)
    }

    pub fn login(&self) -> Result<Url, url::ParseError> { self.at("login/secure/login") }
    pub fn config(&self) -> Result<Url, url::ParseError> { self.at("login/secure/config") }
    pub fn client(&self) -> Result<Url, url::ParseError> { self.at("pa/secure/client") }
    pub fn order_history(&self) -> Result<Url, url::ParseError> { self.at("reporting/secure/v4/order-history") }
    pub fn product_lookup(&self) -> Result<Url, url::ParseError> { self.at("product_search/secure/v5/products/lookup") }

    pub fn logout(&self, session_id: &str) -> Result<Url, url::ParseError> {
        self.at(&format!("trading/secure/logout;jsessionid={}", urlencoding::encode(session_id)))
    }

    pub fn update(&self, account_id: u64, session_id: &str) -> Result<Url, url::ParseError> {
        self.at(&format!(
            "trading/secure/v5/update/{};jsessionid={}",
            account_id,
            urlencoding::encode(session_id)
        ))
    }

    pub fn check_order(&self, session_id: &str) -> Result<Url, url::ParseError> {
        self.at(&format!("trading/secure/v5/checkOrder;jsessionid={}", urlencoding::encode(session_id)))
    }

    /// Dipakai untuk confirm (POST) maupun cancel (DELETE).
    pub fn order(&self, id: &str, session_id: &str) -> Result<Url, url::ParseError> {
        self.at(&format!(
            "trading/secure/v5/order/{};jsessionid={}",
            urlencoding::encode(id),
            urlencoding::encode(session_id)
        ))
    }
}

// ---- ids can arrive as strings or numbers ----

pub fn de_id<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    match Value::deserialize(d)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(de::Error::custom(format!("expected string or number id, got {other}"))),
    }
}

pub fn de_opt_id<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    match Value::deserialize(d)? {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        other => Err(de::Error::custom(format!("expected string or number id, got {other}"))),
    }
}

/// Numbers sometimes come back as strings.
pub fn number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

// ---- login ----

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest<'a> {
    pub username: &'a str,
    pub password: &'a str,
    pub is_pass_code_reset: bool,
    pub is_redirect_to_mobile: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub status: i64,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Generic `{ "data": ... }` envelope.
#[derive(Debug, Deserialize)]
pub struct DataEnvelope<T> {
    pub data: T,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientProfile {
    pub int_account: u64,
}

// ---- update endpoint (cashFunds / portfolio) ----

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateResponse {
    #[serde(default)]
    pub cash_funds: Option<ValueList>,
    #[serde(default)]
    pub portfolio: Option<ValueList>,
}

#[derive(Debug, Deserialize)]
pub struct ValueList {
    #[serde(default)]
    pub value: Vec<UpdateItem>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateItem {
    #[serde(default, deserialize_with = "de_opt_id")]
    pub id: Option<String>,
    #[serde(default)]
    pub value: Vec<NamedValue>,
}

#[derive(Debug, Deserialize)]
pub struct NamedValue {
    pub name: String,
    #[serde(default)]
    pub value: Value,
}

impl UpdateItem {
    fn field(&self, name: &str) -> Option<&Value> {
        self.value.iter().find(|nv| nv.name == name).map(|nv| &nv.value)
    }
}

/// currencyCode -> value. Tiap fetch menggantikan snapshot sebelumnya.
pub fn parse_cash(list: &ValueList) -> Result<CashPosition, String> {
    let mut cash = CashPosition::new();
    for item in &list.value {
        let currency = item
            .field("currencyCode")
            .and_then(Value::as_str)
            .ok_or("cash item without currencyCode")?;
        let amount = item
            .field("value")
            .and_then(number)
            .ok_or_else(|| format!("cash item {currency} without numeric value"))?;
        cash.insert(currency.to_string(), amount);
    }
    Ok(cash)
}

/// Keeps only positionType == "PRODUCT" with size > 0. Other rows (CASH, FLATEX) may lack a size.
pub fn parse_portfolio(list: &ValueList) -> Result<Portfolio, String> {
    let mut out = Portfolio::new();
    for item in &list.value {
        let id = item.id.clone().ok_or("portfolio item without id")?;
        let position_type = item
            .field("positionType")
            .and_then(Value::as_str)
            .ok_or_else(|| format!("position {id} without positionType"))?;
        if position_type != "PRODUCT" {
            continue;
        }
        let size = item
            .field("size")
            .and_then(number)
            .ok_or_else(|| format!("position {id} without numeric size"))?;
        let num = |name: &str| item.field(name).and_then(number).unwrap_or(0.0);

        if size > 0.0 {
            out.insert(
                id.clone(),
                PortfolioPosition {
                    product_id: id,
                    position_type: position_type.to_string(),
                    break_even_price: num("breakEvenPrice"),
                    price: num("price"),
                    size,
                    value: num("value"),
                },
            );
        }
    }
    Ok(out)
}

// ---- orders ----

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderBody<'a> {
    pub buy_sell: &'static str,
    pub order_type: u8,
    pub product_id: &'a str,
    pub time_type: u8,
    pub size: u64,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
}

impl<'a> From<&'a OrderRequest> for OrderBody<'a> {
    fn from(o: &'a OrderRequest) -> Self {
        Self {
            buy_sell: o.buy_sell.as_str(),
            order_type: o.order_type.code(),
            product_id: &o.product_id,
            time_type: o.validity.code(),
            size: o.size,
            price: o.limit,
            stop_price: o.stop_loss,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckOrderData {
    #[serde(default)]
    pub confirmation_id: Option<String>,
    #[serde(default)]
    pub transaction_fees: Vec<TransactionFee>,
}

#[derive(Debug, Deserialize)]
pub struct TransactionFee {
    pub currency: String,
    #[serde(default)]
    pub amount: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmOrderData {
    #[serde(deserialize_with = "de_id")]
    pub order_id: String,
}

pub fn sum_fees(fees: &[TransactionFee]) -> HashMap<String, f64> {
    let mut total = HashMap::new();
    for fee in fees {
        *total.entry(fee.currency.clone()).or_insert(0.0) += fee.amount;
    }
    total
}

// ---- product search ----

#[derive(Debug, Deserialize)]
pub struct ProductsResponse {
    #[serde(default)]
    pub products: Vec<Product>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(default)]
    pub isin: String,
    #[serde(default)]
    pub symbol: String,
    #[serde(default, deserialize_with = "de_opt_id")]
    pub exchange_id: Option<String>,
}
