// ===============================
// src/executor.rs
// ===============================
//
// Trade intent -> sizing -> refresh state -> product lookup -> two-phase order.
// Satu intent gagal tidak menghentikan intent lain di batch yang sama;
// satu-satunya pengecualian adalah login gagal (fatal).
//
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::broker::{Broker, BrokerError, Credentials, SessionContext};
use crate::control::{MessageHandler, TradingInfo};
use crate::degiro::number;
use crate::domain::{BuySell, DataKind, Exchange, OrderConfirmation, OrderError, OrderRequest, OrderType, SearchBy, Validity};
use crate::metrics::INTENTS;
use crate::risk::{self, RiskError};

#[derive(Debug, Clone)]
pub struct TradingSettings {
    pub broker_name: String,
    pub exchange: Exchange,
    pub budget: f64,
    pub credentials: Credentials,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TradeIntent {
    pub isin: String,
    pub transaction: BuySell,
    pub price: f64,
    /// Below 1.0 this is a fraction of budget.
    pub size: f64,
}

#[derive(Debug, Error)]
pub enum IntentError {
    #[error("unexpected key in trading info ({0:?} expected)")]
    MissingKey(&'static str),
    #[error("the {key} is not valid: {value}")]
    InvalidValue { key: &'static str, value: String },
    #[error(transparent)]
    Risk(#[from] RiskError),
    #[error(transparent)]
    Order(#[from] OrderError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("no product id found for {isin} on {exchange}")]
    NoProduct { isin: String, exchange: Exchange },
    #[error("no open position for product {0}")]
    NoPosition(String),
}

impl IntentError {
    fn outcome(&self) -> &'static str {
        match self {
            IntentError::Broker(_) | IntentError::NoProduct { .. } | IntentError::NoPosition(_) => "failed",
            _ => "rejected",
        }
    }
}

impl TradeIntent {
    pub fn from_value(v: &Value) -> Result<Self, IntentError> {
        let field = |key: &'static str| v.get(key).filter(|x| !x.is_null()).ok_or(IntentError::MissingKey(key));
        let invalid = |key: &'static str, x: &Value| IntentError::InvalidValue { key, value: x.to_string() };

        let isin = field("isin")?;
        let isin = isin.as_str().filter(|s| !s.is_empty()).ok_or_else(|| invalid("isin", isin))?;

        let transaction = field("transaction")?;
        let transaction = transaction
            .as_str()
            .and_then(|s| s.parse::<BuySell>().ok())
            .ok_or_else(|| invalid("transaction", transaction))?;

        let price = field("price")?;
        let price = number(price).filter(|p| p.is_finite()).ok_or_else(|| invalid("price", price))?;

        let size = field("size")?;
        let size = number(size).filter(|s| s.is_finite()).ok_or_else(|| invalid("size", size))?;

        Ok(Self { isin: isin.to_string(), transaction, price, size })
    }
}

/// `data` may hold one intent object or an array of them.
pub fn intents(data: &Value) -> Vec<&Value> {
    match data {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    }
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub placed: Vec<OrderConfirmation>,
    pub skipped: usize,
}

pub struct TradeExecutor<'a, B: Broker> {
    broker: &'a B,
    ctx: &'a mut SessionContext,
    settings: &'a TradingSettings,
}

impl<'a, B: Broker> TradeExecutor<'a, B> {
    pub fn new(broker: &'a B, ctx: &'a mut SessionContext, settings: &'a TradingSettings) -> Self {
        Self { broker, ctx, settings }
    }

    /// Only a fatal broker error (login) comes back as `Err`.
    pub async fn execute_batch(&mut self, data: &Value) -> Result<BatchReport, BrokerError> {
        let mut report = BatchReport::default();
        for (idx, raw) in intents(data).into_iter().enumerate() {
            match self.execute(raw).await {
                Ok(conf) => {
                    INTENTS.with_label_values(&["placed"]).inc();
                    report.placed.push(conf);
                }
                Err(IntentError::Broker(e)) if e.is_fatal() => return Err(e),
                Err(e) => {
                    INTENTS.with_label_values(&[e.outcome()]).inc();
                    error!(intent = idx, error = %e, "trade intent skipped");
                    report.skipped += 1;
                }
            }
        }
        Ok(report)
    }

    pub async fn execute(&mut self, raw: &Value) -> Result<OrderConfirmation, IntentError> {
        let budget = self.settings.budget;
        let exchange = self.settings.exchange;

        let intent = TradeIntent::from_value(raw)?;
        let mut size = risk::resolve_size(intent.size, intent.price, budget)?;
        risk::check_volume(intent.price, size, budget)?;

        self.refresh().await?;

        let product_id = self
            .broker
            .search_product_id(&*self.ctx, &intent.isin, SearchBy::Isin, Some(exchange))
            .await?
            .remove(&exchange)
            .ok_or_else(|| IntentError::NoProduct { isin: intent.isin.clone(), exchange })?;

        if intent.transaction == BuySell::Sell {
            let existing = self
                .ctx
                .portfolio
                .get(&product_id)
                .map(|p| p.size)
                .ok_or_else(|| IntentError::NoPosition(product_id.clone()))?;
            let adjusted = risk::adjust_sell_size(existing, size, intent.price, budget);
            if adjusted != size {
                info!(%product_id, requested = size, selling = adjusted, "closing whole position");
                size = adjusted;
            }
        }

        let order = OrderRequest::new(
            intent.transaction,
            product_id,
            size,
            Some(intent.price),
            None,
            OrderType::Limit,
            Validity::Daily,
        )?;
        info!(isin = %intent.isin, side = %order.buy_sell, size = order.size, limit = intent.price, "placing order");
        Ok(self.broker.place_order(&*self.ctx, &order).await?)
    }

    /// Snapshots are cleared first; nothing from a previous cycle survives.
    async fn refresh(&mut self) -> Result<(), BrokerError> {
        self.ctx.clear_snapshots();
        self.broker.login(&mut *self.ctx, &self.settings.credentials).await?;
        self.broker.get_config(&mut *self.ctx).await?;
        self.broker.get_account_profile(&mut *self.ctx).await?;
        self.broker.get_data(&mut *self.ctx, DataKind::CashFunds).await?;
        self.broker.get_data(&mut *self.ctx, DataKind::Portfolio).await?;
        Ok(())
    }
}

/// Owns the broker and the session; receives messages from the control channel.
pub struct Dispatcher<B: Broker> {
    broker: B,
    ctx: SessionContext,
    settings: TradingSettings,
}

impl<B: Broker> Dispatcher<B> {
    pub fn new(broker: B, settings: TradingSettings) -> Self {
        Self { broker, ctx: SessionContext::new(), settings }
    }

    #[cfg(test)]
    pub fn broker(&self) -> &B { &self.broker }

    #[cfg(test)]
    pub fn context(&self) -> &SessionContext { &self.ctx }

    /// Logs out if a session exists. Failures are only logged.
    pub async fn shutdown(&mut self) {
        if !self.ctx.session.signed_up {
            return;
        }
        match self.broker.logout(&self.ctx).await {
            Ok(()) => self.ctx.session.signed_up = false,
            Err(e) => warn!(error = %e, "logout failed"),
        }
    }
}

#[async_trait]
impl<B: Broker> MessageHandler for Dispatcher<B> {
    async fn on_trading_info(&mut self, info: TradingInfo) -> anyhow::Result<()> {
        if !info.to.eq_ignore_ascii_case(&self.settings.broker_name) {
            warn!(to = %info.to, from = %info.from, "unknown broker, message dropped");
            return Ok(());
        }
        info!(from = %info.from, to = %info.to, "got trading info");

        let mut exec = TradeExecutor::new(&self.broker, &mut self.ctx, &self.settings);
        let report = exec.execute_batch(&info.data).await?;
        info!(placed = report.placed.len(), skipped = report.skipped, "batch done");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::ProductIds;
    use crate::degiro::ClientProfile;
    use crate::domain::PortfolioPosition;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// In-memory broker: every product lives on XET.
    #[derive(Default)]
    struct PaperBroker {
        products: Vec<(&'static str, &'static str)>,
        holdings: Vec<(&'static str, f64)>,
        fail_login: bool,
        logins: AtomicUsize,
        logouts: AtomicUsize,
        placed: Mutex<Vec<OrderRequest>>,
    }

    impl PaperBroker {
        fn new() -> Self {
            Self {
                products: vec![("DE0007164600", "331868"), ("DE0005190003", "331890")],
                holdings: vec![("331868", 100.0)],
                ..Default::default()
            }
        }
        fn placed(&self) -> Vec<OrderRequest> { self.placed.lock().unwrap().clone() }
    }

    #[async_trait]
    impl Broker for PaperBroker {
        async fn login(&self, ctx: &mut SessionContext, _creds: &Credentials) -> Result<(), BrokerError> {
            self.logins.fetch_add(1, Ordering::SeqCst);
            if self.fail_login {
                return Err(BrokerError::AuthFailed("status 3".into()));
            }
            ctx.session.signed_up = true;
            ctx.session.session_id = Some("paper".into());
            Ok(())
        }
        async fn logout(&self, ctx: &SessionContext) -> Result<(), BrokerError> {
            ctx.require_account()?;
            self.logouts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn get_config(&self, ctx: &mut SessionContext) -> Result<(), BrokerError> {
            ctx.config = Some(json!({}));
            Ok(())
        }
        async fn get_account_profile(&self, ctx: &mut SessionContext) -> Result<(), BrokerError> {
            ctx.profile = Some(ClientProfile { int_account: 1 });
            Ok(())
        }
        async fn get_data(&self, ctx: &mut SessionContext, kind: DataKind) -> Result<(), BrokerError> {
            ctx.require_account()?;
            match kind {
                DataKind::CashFunds => {
                    ctx.cash.insert("EUR".into(), 10_000.0);
                }
                DataKind::Portfolio => {
                    for (id, size) in &self.holdings {
                        ctx.portfolio.insert(
                            id.to_string(),
                            PortfolioPosition {
                                product_id: id.to_string(),
                                position_type: "PRODUCT".into(),
                                break_even_price: 40.0,
                                price: 50.0,
                                size: *size,
                                value: size * 50.0,
                            },
                        );
                    }
                }
            }
            Ok(())
        }
        async fn search_product_id(
            &self,
            ctx: &SessionContext,
            text: &str,
            _by: SearchBy,
            exchange: Option<Exchange>,
        ) -> Result<ProductIds, BrokerError> {
            ctx.require_account()?;
            let mut out = ProductIds::new();
            if exchange.map_or(true, |x| x == Exchange::Xet) {
                for (isin, id) in &self.products {
                    if isin.eq_ignore_ascii_case(text) {
                        out.insert(Exchange::Xet, id.to_string());
                    }
                }
            }
            Ok(out)
        }
        async fn place_order(&self, ctx: &SessionContext, order: &OrderRequest) -> Result<OrderConfirmation, BrokerError> {
            ctx.require_account()?;
            let mut placed = self.placed.lock().unwrap();
            placed.push(order.clone());
            Ok(OrderConfirmation {
                confirmation_id: format!("c-{}", placed.len()),
                order_id: format!("o-{}", placed.len()),
                fees: Default::default(),
            })
        }
    }

    fn settings(budget: f64) -> TradingSettings {
        TradingSettings {
            broker_name: "degiro".into(),
            exchange: Exchange::Xet,
            budget,
            credentials: Credentials { username: "u".into(), password: "p".into() },
        }
    }

    async fn run(broker: &PaperBroker, budget: f64, data: Value) -> Result<BatchReport, BrokerError> {
        let settings = settings(budget);
        let mut ctx = SessionContext::new();
        TradeExecutor::new(broker, &mut ctx, &settings).execute_batch(&data).await
    }

    #[test]
    fn intent_extraction() {
        let ok = TradeIntent::from_value(&json!({
            "isin": "DE0007164600", "transaction": "BUY", "price": "50.0", "size": 0.25
        }))
        .unwrap();
        assert_eq!(ok.price, 50.0);
        assert_eq!(ok.transaction, BuySell::Buy);

        let missing = TradeIntent::from_value(&json!({ "isin": "X", "transaction": "BUY", "size": 1 }));
        assert!(matches!(missing, Err(IntentError::MissingKey("price"))));

        let bad = TradeIntent::from_value(&json!({ "isin": "X", "transaction": "BUY", "price": "abc", "size": 1 }));
        assert!(matches!(bad, Err(IntentError::InvalidValue { key: "price", .. })));

        let side = TradeIntent::from_value(&json!({ "isin": "X", "transaction": "HOLD", "price": 1, "size": 1 }));
        assert!(matches!(side, Err(IntentError::InvalidValue { key: "transaction", .. })));
    }

    #[tokio::test]
    async fn quotient_intent_becomes_limit_order() {
        let broker = PaperBroker::new();
        let report = run(&broker, 10_000.0, json!({
            "isin": "DE0007164600", "transaction": "BUY", "price": 50.0, "size": 0.25
        }))
        .await
        .unwrap();

        assert_eq!(report.placed.len(), 1);
        let placed = broker.placed();
        assert_eq!(placed[0].size, 50);
        assert_eq!(placed[0].product_id, "331868");
        assert_eq!(placed[0].limit, Some(50.0));
        assert_eq!(placed[0].stop_loss, None);
        assert_eq!(placed[0].order_type, OrderType::Limit);
        assert_eq!(placed[0].validity, Validity::Daily);
    }

    #[tokio::test]
    async fn small_intent_rejected_before_broker_calls() {
        let broker = PaperBroker::new();
        let report = run(&broker, 10_000.0, json!({
            "isin": "DE0007164600", "transaction": "BUY", "price": 50.0, "size": 1
        }))
        .await
        .unwrap();

        assert_eq!(report.skipped, 1);
        assert_eq!(broker.logins.load(Ordering::SeqCst), 0);
        assert!(broker.placed().is_empty());
    }

    #[tokio::test]
    async fn batch_isolation() {
        let broker = PaperBroker::new();
        let report = run(&broker, 10_000.0, json!([
            { "isin": "DE0007164600", "transaction": "BUY", "price": 50.0, "size": 10 },
            { "isin": "DE0005190003", "transaction": "BUY", "size": 10 },
            { "isin": "DE0005190003", "transaction": "BUY", "price": 80.0, "size": 5 }
        ]))
        .await
        .unwrap();

        assert_eq!(report.placed.len(), 2);
        assert_eq!(report.skipped, 1);
        let ids: Vec<_> = broker.placed().into_iter().map(|o| o.product_id).collect();
        assert_eq!(ids, vec!["331868", "331890"]);
    }

    #[tokio::test]
    async fn sell_closes_position_instead_of_leaving_dust() {
        let broker = PaperBroker::new();
        run(&broker, 10_000.0, json!({
            "isin": "DE0007164600", "transaction": "SELL", "price": 50.0, "size": 99
        }))
        .await
        .unwrap();
        run(&broker, 10_000.0, json!({
            "isin": "DE0007164600", "transaction": "SELL", "price": 50.0, "size": 40
        }))
        .await
        .unwrap();

        let sizes: Vec<_> = broker.placed().into_iter().map(|o| (o.buy_sell, o.size)).collect();
        assert_eq!(sizes, vec![(BuySell::Sell, 100), (BuySell::Sell, 40)]);
    }

    #[tokio::test]
    async fn sell_without_position_or_product_is_skipped() {
        let broker = PaperBroker::new();
        let report = run(&broker, 10_000.0, json!([
            { "isin": "DE0005190003", "transaction": "SELL", "price": 80.0, "size": 5 },
            { "isin": "US0000000000", "transaction": "BUY", "price": 80.0, "size": 5 }
        ]))
        .await
        .unwrap();
        assert_eq!(report.skipped, 2);
        assert!(broker.placed().is_empty());
    }

    #[tokio::test]
    async fn zero_budget_rejects_everything() {
        let broker = PaperBroker::new();
        let report = run(&broker, 0.0, json!([
            { "isin": "DE0007164600", "transaction": "BUY", "price": 50.0, "size": 10 },
            { "isin": "DE0007164600", "transaction": "BUY", "price": 50.0, "size": 0.5 }
        ]))
        .await
        .unwrap();
        assert_eq!(report.skipped, 2);
        assert!(broker.placed().is_empty());
    }

    #[tokio::test]
    async fn login_failure_is_fatal_for_the_batch() {
        let broker = PaperBroker { fail_login: true, ..PaperBroker::new() };
        let err = run(&broker, 10_000.0, json!([
            { "isin": "DE0007164600", "transaction": "BUY", "price": 50.0, "size": 10 },
            { "isin": "DE0007164600", "transaction": "BUY", "price": 50.0, "size": 10 }
        ]))
        .await
        .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(broker.logins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dispatcher_checks_broker_name() {
        let mut d = Dispatcher::new(PaperBroker::new(), settings(10_000.0));
        let intent = json!({ "isin": "DE0007164600", "transaction": "BUY", "price": 50.0, "size": 10 });

        d.on_trading_info(TradingInfo { from: "wikifolio".into(), to: "comdirect".into(), data: intent.clone() })
            .await
            .unwrap();
        assert!(d.broker().placed().is_empty());
        assert!(!d.context().session.signed_up);

        d.on_trading_info(TradingInfo { from: "wikifolio".into(), to: "DeGiro".into(), data: intent })
            .await
            .unwrap();
        assert_eq!(d.broker().placed().len(), 1);
        assert!(d.context().session.signed_up);
    }

    #[tokio::test]
    async fn dispatcher_surfaces_fatal_login() {
        let broker = PaperBroker { fail_login: true, ..PaperBroker::new() };
        let mut d = Dispatcher::new(broker, settings(10_000.0));
        let r = d
            .on_trading_info(TradingInfo {
                from: "x".into(),
                to: "degiro".into(),
                data: json!({ "isin": "DE0007164600", "transaction": "BUY", "price": 50.0, "size": 10 }),
            })
            .await;
        assert!(r.is_err());
    }

    #[tokio::test]
    async fn shutdown_logs_out_only_with_a_session() {
        let mut idle = Dispatcher::new(PaperBroker::new(), settings(10_000.0));
        idle.shutdown().await;
        assert_eq!(idle.broker().logouts.load(Ordering::SeqCst), 0);

        let mut d = Dispatcher::new(PaperBroker::new(), settings(10_000.0));
        d.on_trading_info(TradingInfo {
            from: "wikifolio".into(),
            to: "degiro".into(),
            data: json!({ "isin": "DE0007164600", "transaction": "BUY", "price": 50.0, "size": 10 }),
        })
        .await
        .unwrap();
        d.shutdown().await;
        assert_eq!(d.broker().logouts.load(Ordering::SeqCst), 1);
        assert!(!d.context().session.signed_up);

        d.shutdown().await;
        assert_eq!(d.broker().logouts.load(Ordering::SeqCst), 1);
    }
}
