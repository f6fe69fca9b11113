// ===============================
// src/broker.rs
// ===============================
use std::fmt;

use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::degiro::{CashPosition, ClientProfile, Portfolio};
use crate::domain::{DataKind, Exchange, OrderConfirmation, OrderError, OrderRequest, SearchBy};

/// exchange -> productId
pub type ProductIds = HashMap<Exchange, String>;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("not signed up")]
    NotSignedUp,
    #[error("session id does not exist")]
    MissingSession,
    #[error("account id does not exist")]
    MissingAccount,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid order: {0}")]
    InvalidOrder(#[from] OrderError),
    #[error("login failed: {0}")]
    AuthFailed(String),
    #[error("{op}: response status code {status}")]
    Status { op: &'static str, status: reqwest::StatusCode },
    #[error("{op}: transport error: {source}")]
    Transport { op: &'static str, #[source] source: reqwest::Error },
    #[error("{op}: unexpected response: {detail}")]
    Parse { op: &'static str, detail: String },
    #[error("order check returned no confirmation id")]
    NoConfirmation,
}

impl BrokerError {
    /// Login failure ends the process; everything else only aborts the operation.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BrokerError::AuthFailed(_))
    }

    pub fn parse(op: &'static str, detail: impl fmt::Display) -> Self {
        BrokerError::Parse { op, detail: detail.to_string() }
    }
}

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials").field("username", &self.username).field("password", &"***").finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Session {
    pub session_id: Option<String>,
    pub signed_up: bool,
}

/// Semua state sesi & snapshot akun, dimiliki eksplisit (tanpa global).
#[derive(Debug, Default)]
pub struct SessionContext {
    pub session: Session,
    pub config: Option<Value>,
    pub profile: Option<ClientProfile>,
    pub cash: CashPosition,
    pub portfolio: Portfolio,
}

impl SessionContext {
    pub fn new() -> Self { Self::default() }

    /// signedUp + sessionId; cukup untuk config/profile.
    pub fn require_session(&self) -> Result<&str, BrokerError> {
        if !self.session.signed_up {
            warn!("not signed up");
            return Err(BrokerError::NotSignedUp);
        }
        match self.session.session_id.as_deref() {
            Some(id) if !id.is_empty() => Ok(id),
            _ => {
                warn!("session id does not exist");
                Err(BrokerError::MissingSession)
            }
        }
    }

    /// signedUp + sessionId + accountId; required by every data/order call.
    pub fn require_account(&self) -> Result<(&str, u64), BrokerError> {
        let session_id = self.require_session()?;
        match self.profile.as_ref().map(|p| p.int_account) {
            Some(acc) if acc != 0 => Ok((session_id, acc)),
            _ => {
                warn!("account id does not exist");
                Err(BrokerError::MissingAccount)
            }
        }
    }

    /// Drop per-cycle snapshots so a failed refresh never leaves stale data behind.
    pub fn clear_snapshots(&mut self) {
        self.config = None;
        self.profile = None;
        self.cash.clear();
        self.portfolio.clear();
    }
}

/// Capability set the executor needs from a broker.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn login(&self, ctx: &mut SessionContext, creds: &Credentials) -> Result<(), BrokerError>;

    /// Requires the full session; local state is left untouched.
    async fn logout(&self, ctx: &SessionContext) -> Result<(), BrokerError>;

    async fn get_config(&self, ctx: &mut SessionContext) -> Result<(), BrokerError>;

    async fn get_account_profile(&self, ctx: &mut SessionContext) -> Result<(), BrokerError>;

    async fn get_data(&self, ctx: &mut SessionContext, kind: DataKind) -> Result<(), BrokerError>;

    /// Empty map when nothing matches.
    async fn search_product_id(
        &self,
        ctx: &SessionContext,
        text: &str,
        by: SearchBy,
        exchange: Option<Exchange>,
    ) -> Result<ProductIds, BrokerError>;

    async fn place_order(&self, ctx: &SessionContext, order: &OrderRequest) -> Result<OrderConfirmation, BrokerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preconditions_checked_in_order() {
        let mut ctx = SessionContext::new();
        assert!(matches!(ctx.require_account(), Err(BrokerError::NotSignedUp)));

        ctx.session.signed_up = true;
        assert!(matches!(ctx.require_account(), Err(BrokerError::MissingSession)));

        ctx.session.session_id = Some("s1".into());
        assert!(matches!(ctx.require_account(), Err(BrokerError::MissingAccount)));
        assert_eq!(ctx.require_session().unwrap(), "s1");

        ctx.profile = Some(ClientProfile { int_account: 42 });
        assert_eq!(ctx.require_account().unwrap(), ("s1", 42));

        ctx.clear_snapshots();
        assert!(matches!(ctx.require_account(), Err(BrokerError::MissingAccount)));
        assert!(ctx.session.signed_up);
    }

    #[test]
    fn only_login_failure_is_fatal() {
        assert!(BrokerError::AuthFailed("bad".into()).is_fatal());
        assert!(!BrokerError::NoConfirmation.is_fatal());
        assert!(!BrokerError::MissingAccount.is_fatal());
    }
}
