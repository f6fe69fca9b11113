// ===============================
// src/gateway_degiro.rs
// ===============================
use async_trait::async_trait;
use chrono::{Duration, Local, NaiveDate};
use reqwest::{header, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::broker::{Broker, BrokerError, Credentials, ProductIds, SessionContext};
use crate::degiro::{
    parse_cash, parse_portfolio, sum_fees, CheckOrderData, ClientProfile, ConfirmOrderData,
    DataEnvelope, Endpoints, LoginRequest, LoginResponse, OrderBody, ProductsResponse,
    UpdateResponse, USER_AGENT,
};
use crate::domain::{DataKind, Exchange, OrderConfirmation, OrderRecord, OrderRequest, SearchBy};
use crate::metrics::{BROKER_ERRORS, ORDERS};

const MAX_ORDER_WINDOW_DAYS: i64 = 90;

/// Confirmation token from the check phase. Never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmationId(String);

impl ConfirmationId {
    pub fn new(raw: Option<String>) -> Option<Self> {
        raw.filter(|s| !s.trim().is_empty()).map(ConfirmationId)
    }
    pub fn as_str(&self) -> &str { &self.0 }
}

/// Phase 1 result. Phase 2 consumes it, so a confirm without a check is unrepresentable.
#[derive(Debug)]
pub struct OrderCheck {
    pub confirmation_id: ConfirmationId,
    pub fees: ahash::AHashMap<String, f64>,
}

/// Degiro REST client (unofficial web API).
pub struct DegiroClient {
    http: reqwest::Client,
    endpoints: Endpoints,
}

impl DegiroClient {
    pub fn new(base_url: &str) -> Result<Self, BrokerError> {
        let endpoints = Endpoints::new(base_url)
            .map_err(|e| BrokerError::InvalidArgument(format!("base url {base_url:?}: {e}")))?;

        let mut headers = header::HeaderMap::new();
        headers.insert(header::ACCEPT, header::HeaderValue::from_static("application/json, text/plain, */*"));
        headers.insert(header::ACCEPT_LANGUAGE, header::HeaderValue::from_static("en-US,en;q=0.8"));

        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .build()
            .map_err(|source| BrokerError::Transport { op: "client", source })?;

        info!(base = %base_url, "degiro client created");
        Ok(Self { http, endpoints })
    }

    // ---------------------------------------------------------------
    // plumbing
    // ---------------------------------------------------------------

    fn url(op: &'static str, r: Result<Url, url::ParseError>) -> Result<Url, BrokerError> {
        r.map_err(|e| fail(op, BrokerError::InvalidArgument(e.to_string())))
    }

    async fn send(op: &'static str, req: RequestBuilder, ok: &[StatusCode]) -> Result<Response, BrokerError> {
        let rsp = req
            .send()
            .await
            .map_err(|source| fail(op, BrokerError::Transport { op, source }))?;
        if !ok.contains(&rsp.status()) {
            return Err(fail(op, BrokerError::Status { op, status: rsp.status() }));
        }
        Ok(rsp)
    }

    async fn json<T: DeserializeOwned>(op: &'static str, rsp: Response) -> Result<T, BrokerError> {
        let body = rsp
            .text()
            .await
            .map_err(|source| fail(op, BrokerError::Transport { op, source }))?;
        serde_json::from_str(&body).map_err(|e| fail(op, BrokerError::parse(op, e)))
    }

    // ---------------------------------------------------------------
    // session
    // ---------------------------------------------------------------

    async fn try_login(&self, creds: &Credentials) -> Result<String, String> {
        let url = self.endpoints.login().map_err(|e| e.to_string())?;
        let payload = LoginRequest {
            username: &creds.username,
            password: &creds.password,
            is_pass_code_reset: false,
            is_redirect_to_mobile: false,
        };
        let rsp = self.http.post(url).json(&payload).send().await.map_err(|e| e.to_string())?;
        if rsp.status() != StatusCode::OK {
            return Err(format!("response status code {}", rsp.status()));
        }
        let body: LoginResponse = rsp.json().await.map_err(|e| e.to_string())?;
        match body.session_id {
            Some(id) if body.status == 0 && !id.is_empty() => Ok(id),
            _ => Err(format!("login status {}", body.status)),
        }
    }

    // ---------------------------------------------------------------
    // orders
    // ---------------------------------------------------------------

    /// Phase 1: non-binding check.
    pub async fn check_order(&self, ctx: &SessionContext, order: &OrderRequest) -> Result<OrderCheck, BrokerError> {
        const OP: &str = "check_order";
        let (session_id, account) = ctx.require_account()?;
        let url = Self::url(OP, self.endpoints.check_order(session_id))?;
        let req = self
            .http
            .post(url)
            .query(&[("intAccount", account.to_string()), ("sessionId", session_id.to_string())])
            .json(&OrderBody::from(order));
        let rsp = Self::send(OP, req, &[StatusCode::OK]).await?;
        let env: DataEnvelope<CheckOrderData> = Self::json(OP, rsp).await?;

        let fees = sum_fees(&env.data.transaction_fees);
        let confirmation_id = ConfirmationId::new(env.data.confirmation_id)
            .ok_or_else(|| fail(OP, BrokerError::NoConfirmation))?;
        info!(confirmation_id = confirmation_id.as_str(), ?fees, "order checked");
        Ok(OrderCheck { confirmation_id, fees })
    }

    /// Phase 2: binding confirm, same body as the check.
    pub async fn confirm_order(
        &self,
        ctx: &SessionContext,
        order: &OrderRequest,
        check: OrderCheck,
    ) -> Result<OrderConfirmation, BrokerError> {
        const OP: &str = "confirm_order";
        let (session_id, account) = ctx.require_account()?;
        let url = Self::url(OP, self.endpoints.order(check.confirmation_id.as_str(), session_id))?;
        let req = self
            .http
            .post(url)
            .query(&[("intAccount", account.to_string()), ("sessionId", session_id.to_string())])
            .json(&OrderBody::from(order));
        let rsp = Self::send(OP, req, &[StatusCode::OK]).await?;
        let env: DataEnvelope<ConfirmOrderData> = Self::json(OP, rsp).await?;

        ORDERS.inc();
        info!(order_id = %env.data.order_id, "placed order");
        Ok(OrderConfirmation {
            confirmation_id: check.confirmation_id.0,
            order_id: env.data.order_id,
            fees: check.fees,
        })
    }

    pub async fn cancel_order(&self, ctx: &SessionContext, order_id: &str) -> Result<(), BrokerError> {
        const OP: &str = "cancel_order";
        let (session_id, account) = ctx.require_account()?;
        let url = Self::url(OP, self.endpoints.order(order_id, session_id))?;
        let req = self
            .http
            .delete(url)
            .form(&[("intAccount", account.to_string()), ("sessionId", session_id.to_string())]);
        Self::send(OP, req, &[StatusCode::OK]).await?;
        info!(%order_id, "deleted order");
        Ok(())
    }

    /// Dates as `dd.mm.yyyy`; defaults to the last 90 days.
    pub async fn get_orders(
        &self,
        ctx: &SessionContext,
        from_date: Option<&str>,
        to_date: Option<&str>,
        active: bool,
    ) -> Result<Vec<OrderRecord>, BrokerError> {
        const OP: &str = "get_orders";
        let (session_id, account) = ctx.require_account()?;
        let (from, to) = order_window(from_date, to_date, Local::now().date_naive()).map_err(|e| {
            warn!(%e, "order history query rejected");
            e
        })?;

        let url = Self::url(OP, self.endpoints.order_history())?;
        let req = self.http.get(url).query(&[
            ("fromDate", from.format("%d/%m/%Y").to_string()),
            ("toDate", to.format("%d/%m/%Y").to_string()),
            ("intAccount", account.to_string()),
            ("sessionId", session_id.to_string()),
        ]);
        let rsp = Self::send(OP, req, &[StatusCode::OK]).await?;
        let env: DataEnvelope<Vec<OrderRecord>> = Self::json(OP, rsp).await?;

        let orders: Vec<OrderRecord> = env.data.into_iter().filter(|o| !active || o.is_active).collect();
        info!(count = orders.len(), active, "got orders");
        Ok(orders)
    }

    /// String-facing lookup: unknown `by` or exchange yields an empty map, as do broker failures.
    pub async fn lookup(
        &self,
        ctx: &SessionContext,
        text: &str,
        by: &str,
        exchange: Option<&str>,
        limit: Option<u32>,
    ) -> ProductIds {
        let by: SearchBy = match by.parse() {
            Ok(b) => b,
            Err(e) => {
                warn!(%e, "product search rejected");
                return ProductIds::new();
            }
        };
        let exchange = match exchange.map(str::parse::<Exchange>).transpose() {
            Ok(x) => x,
            Err(e) => {
                warn!(%e, "product search rejected");
                return ProductIds::new();
            }
        };
        self.search(ctx, text, by, exchange, limit).await.unwrap_or_default()
    }

    /// `limit` is sent only when set; the broker applies its own default otherwise.
    pub async fn search(
        &self,
        ctx: &SessionContext,
        text: &str,
        by: SearchBy,
        exchange: Option<Exchange>,
        limit: Option<u32>,
    ) -> Result<ProductIds, BrokerError> {
        const OP: &str = "search_product_id";
        let (session_id, account) = ctx.require_account()?;
        let url = Self::url(OP, self.endpoints.product_lookup())?;
        let mut query = vec![("searchText", text.to_string())];
        if let Some(limit) = limit {
            query.push(("limit", limit.to_string()));
        }
        query.extend([
            ("offset", "0".to_string()),
            ("intAccount", account.to_string()),
            ("sessionId", session_id.to_string()),
        ]);
        let req = self.http.get(url).query(&query);
        let rsp = Self::send(OP, req, &[StatusCode::OK]).await?;
        let body: ProductsResponse = Self::json(OP, rsp).await?;

        let mut found = ProductIds::new();
        for product in body.products {
            let Some(market) = product
                .exchange_id
                .as_deref()
                .and_then(|c| c.parse::<u32>().ok())
                .and_then(Exchange::from_code)
            else {
                debug!(id = %product.id, exchange_id = ?product.exchange_id, "skip product on unmapped exchange");
                continue;
            };
            if exchange.is_some_and(|x| x != market) {
                continue;
            }
            let hit = match by {
                SearchBy::Isin => product.isin.eq_ignore_ascii_case(text),
                SearchBy::Symbol => product.symbol.eq_ignore_ascii_case(text),
                SearchBy::Name => true,
            };
            if hit {
                found.insert(market, product.id);
            }
        }

        if found.is_empty() {
            info!(%text, "no product id found");
        } else {
            info!(?found, "product ids found");
        }
        Ok(found)
    }
}

#[async_trait]
impl Broker for DegiroClient {
    async fn login(&self, ctx: &mut SessionContext, creds: &Credentials) -> Result<(), BrokerError> {
        if ctx.session.signed_up {
            warn!("already signed up");
            return Ok(());
        }
        match self.try_login(creds).await {
            Ok(session_id) => {
                ctx.session.session_id = Some(session_id);
                ctx.session.signed_up = true;
                info!(user = %creds.username, "logged in");
                Ok(())
            }
            Err(reason) => {
                ctx.session.signed_up = false;
                BROKER_ERRORS.with_label_values(&["login"]).inc();
                error!(%reason, "login failed");
                Err(BrokerError::AuthFailed(reason))
            }
        }
    }

    async fn logout(&self, ctx: &SessionContext) -> Result<(), BrokerError> {
        const OP: &str = "logout";
        let (session_id, account) = ctx.require_account()?;
        let url = Self::url(OP, self.endpoints.logout(session_id))?;
        let req = self
            .http
            .get(url)
            .query(&[("intAccount", account.to_string()), ("sessionId", session_id.to_string())]);
        Self::send(OP, req, &[StatusCode::OK]).await?;
        info!("logged out");
        Ok(())
    }

    async fn get_config(&self, ctx: &mut SessionContext) -> Result<(), BrokerError> {
        const OP: &str = "get_config";
        let session_id = ctx.require_session()?;
        let url = Self::url(OP, self.endpoints.config())?;
        let req = self.http.get(url).header(header::COOKIE, format!("JSESSIONID={session_id}"));
        let rsp = Self::send(OP, req, &[StatusCode::OK]).await?;
        let env: DataEnvelope<Value> = Self::json(OP, rsp).await?;
        ctx.config = Some(env.data);
        info!("got configuration");
        Ok(())
    }

    async fn get_account_profile(&self, ctx: &mut SessionContext) -> Result<(), BrokerError> {
        const OP: &str = "get_account_profile";
        let session_id = ctx.require_session()?;
        let url = Self::url(OP, self.endpoints.client())?;
        let req = self.http.get(url).query(&[("sessionId", session_id)]);
        let rsp = Self::send(OP, req, &[StatusCode::OK]).await?;
        let env: DataEnvelope<ClientProfile> = Self::json(OP, rsp).await?;
        info!(account = env.data.int_account, "got client information");
        ctx.profile = Some(env.data);
        Ok(())
    }

    async fn get_data(&self, ctx: &mut SessionContext, kind: DataKind) -> Result<(), BrokerError> {
        const OP: &str = "get_data";
        let (session_id, account) = ctx.require_account()?;
        let url = Self::url(OP, self.endpoints.update(account, session_id))?;
        let req = self.http.get(url).query(&[(kind.as_str(), 0)]);
        let rsp = Self::send(OP, req, &[StatusCode::OK, StatusCode::CREATED]).await?;
        let body: UpdateResponse = Self::json(OP, rsp).await?;

        match kind {
            DataKind::CashFunds => {
                let list = body.cash_funds.ok_or_else(|| fail(OP, BrokerError::parse(OP, "missing cashFunds")))?;
                let cash = parse_cash(&list).map_err(|e| fail(OP, BrokerError::parse(OP, e)))?;
                info!(eur = cash.get("EUR").copied().unwrap_or_default(), currencies = cash.len(), "got capital");
                ctx.cash = cash;
            }
            DataKind::Portfolio => {
                let list = body.portfolio.ok_or_else(|| fail(OP, BrokerError::parse(OP, "missing portfolio")))?;
                let portfolio = parse_portfolio(&list).map_err(|e| fail(OP, BrokerError::parse(OP, e)))?;
                info!(positions = portfolio.len(), "got portfolio");
                ctx.portfolio = portfolio;
            }
        }
        Ok(())
    }

    async fn search_product_id(
        &self,
        ctx: &SessionContext,
        text: &str,
        by: SearchBy,
        exchange: Option<Exchange>,
    ) -> Result<ProductIds, BrokerError> {
        self.search(ctx, text, by, exchange, None).await
    }

    async fn place_order(&self, ctx: &SessionContext, order: &OrderRequest) -> Result<OrderConfirmation, BrokerError> {
        let check = self.check_order(ctx, order).await?;
        self.confirm_order(ctx, order, check).await
    }
}

fn fail(op: &'static str, e: BrokerError) -> BrokerError {
    BROKER_ERRORS.with_label_values(&[op]).inc();
    error!(op, error = %e, "broker call failed");
    e
}

fn parse_date(s: &str) -> Result<NaiveDate, BrokerError> {
    NaiveDate::parse_from_str(s, "%d.%m.%Y")
        .map_err(|_| BrokerError::InvalidArgument(format!("date in format \"dd.mm.YYYY\" is required, got {s:?}")))
}

/// Resolve and validate the order-history window.
pub fn order_window(
    from: Option<&str>,
    to: Option<&str>,
    today: NaiveDate,
) -> Result<(NaiveDate, NaiveDate), BrokerError> {
    let to = to.map(parse_date).transpose()?.unwrap_or(today);
    let from = from.map(parse_date).transpose()?.unwrap_or(today - Duration::days(MAX_ORDER_WINDOW_DAYS));
    if (to - from).num_days() > MAX_ORDER_WINDOW_DAYS {
        return Err(BrokerError::InvalidArgument("the maximal time interval is 90 days".into()));
    }
    if to < from {
        return Err(BrokerError::InvalidArgument("negative time interval is not allowed".into()));
    }
    Ok((from, to))
}
