//! Payment-provider boundary.
//!
//! The core only needs three calls: open a checkout session for a held slot,
//! ask whether a session was paid, and refund a session after a cancellation.
//! Checkout pages, webhooks and provider SDKs live outside this crate.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use ulid::Ulid;

use crate::model::{IntentId, PaymentSession};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    Declined(String),
    UnknownSession(String),
    Timeout,
    Unavailable(String),
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayError::Declined(reason) => write!(f, "declined: {reason}"),
            GatewayError::UnknownSession(s) => write!(f, "unknown session: {s}"),
            GatewayError::Timeout => write!(f, "gateway timeout"),
            GatewayError::Unavailable(msg) => write!(f, "gateway unavailable: {msg}"),
        }
    }
}

impl std::error::Error for GatewayError {}

/// Result of asking the provider about a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionVerification {
    pub paid: bool,
    pub amount: u64,
    pub reservation_ref: IntentId,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_session(
        &self,
        amount: u64,
        currency: &str,
        reservation_ref: IntentId,
    ) -> Result<PaymentSession, GatewayError>;

    async fn verify_session(&self, session_ref: &str) -> Result<SessionVerification, GatewayError>;

    async fn refund_session(&self, session_ref: &str, amount: u64) -> Result<(), GatewayError>;
}

#[derive(Debug, Clone)]
struct MockSession {
    amount: u64,
    reservation_ref: IntentId,
    paid_amount: Option<u64>,
}

/// In-memory gateway for development, the demo binary and tests.
///
/// Sessions start unpaid; call [`MockPaymentGateway::mark_paid`] to simulate the
/// customer finishing checkout.
#[derive(Debug, Default)]
pub struct MockPaymentGateway {
    sessions: DashMap<String, MockSession>,
    fail_create: AtomicBool,
    fail_refund: AtomicBool,
    created: AtomicU64,
    refunds: Mutex<Vec<(String, u64)>>,
}

impl MockPaymentGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `create_session` calls fail.
    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_refund(&self, fail: bool) {
        self.fail_refund.store(fail, Ordering::SeqCst);
    }

    /// Simulate a completed checkout for the full session amount.
    pub fn mark_paid(&self, session_ref: &str) -> bool {
        match self.sessions.get_mut(session_ref) {
            Some(mut s) => {
                s.paid_amount = Some(s.amount);
                true
            }
            None => false,
        }
    }

    /// Simulate a checkout that captured a different amount.
    pub fn mark_paid_amount(&self, session_ref: &str, amount: u64) -> bool {
        match self.sessions.get_mut(session_ref) {
            Some(mut s) => {
                s.paid_amount = Some(amount);
                true
            }
            None => false,
        }
    }

    /// Simulate a gateway reporting the session under another reservation.
    pub fn set_reservation_ref(&self, session_ref: &str, reservation_ref: IntentId) -> bool {
        match self.sessions.get_mut(session_ref) {
            Some(mut s) => {
                s.reservation_ref = reservation_ref;
                true
            }
            None => false,
        }
    }

    pub fn sessions_created(&self) -> u64 {
        self.created.load(Ordering::SeqCst)
    }

    pub fn refunds(&self) -> Vec<(String, u64)> {
        self.refunds.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl PaymentGateway for MockPaymentGateway {
    async fn create_session(
        &self,
        amount: u64,
        currency: &str,
        reservation_ref: IntentId,
    ) -> Result<PaymentSession, GatewayError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(GatewayError::Unavailable("mock configured to fail".into()));
        }
        let session_ref = format!("cs_mock_{}", Ulid::new());
        self.sessions.insert(
            session_ref.clone(),
            MockSession {
                amount,
                reservation_ref,
                paid_amount: None,
            },
        );
        self.created.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(%session_ref, amount, currency, %reservation_ref, "mock checkout session created");
        Ok(PaymentSession {
            redirect_url: format!("https://checkout.mock/pay/{session_ref}"),
            session_ref,
        })
    }

    async fn verify_session(&self, session_ref: &str) -> Result<SessionVerification, GatewayError> {
        let s = self
            .sessions
            .get(session_ref)
            .ok_or_else(|| GatewayError::UnknownSession(session_ref.to_string()))?;
        Ok(SessionVerification {
            paid: s.paid_amount.is_some(),
            amount: s.paid_amount.unwrap_or(0),
            reservation_ref: s.reservation_ref,
        })
    }

    async fn refund_session(&self, session_ref: &str, amount: u64) -> Result<(), GatewayError> {
        if self.fail_refund.load(Ordering::SeqCst) {
            return Err(GatewayError::Timeout);
        }
        if !self.sessions.contains_key(session_ref) {
            return Err(GatewayError::UnknownSession(session_ref.to_string()));
        }
        if let Ok(mut refunds) = self.refunds.lock() {
            refunds.push((session_ref.to_string(), amount));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn session_is_unpaid_until_marked() {
        let gw = MockPaymentGateway::new();
        let intent = Ulid::new();
        let session = gw.create_session(1500, "usd", intent).await.unwrap();
        assert!(session.redirect_url.ends_with(&session.session_ref));

        let v = gw.verify_session(&session.session_ref).await.unwrap();
        assert!(!v.paid);
        assert_eq!(v.reservation_ref, intent);

        assert!(gw.mark_paid(&session.session_ref));
        let v = gw.verify_session(&session.session_ref).await.unwrap();
        assert!(v.paid);
        assert_eq!(v.amount, 1500);
    }

    #[tokio::test]
    async fn create_failure_is_reported() {
        let gw = MockPaymentGateway::new();
        gw.set_fail_create(true);
        let err = gw.create_session(100, "usd", Ulid::new()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Unavailable(_)));
        assert_eq!(gw.sessions_created(), 0);
    }

    #[tokio::test]
    async fn unknown_session_cannot_be_verified_or_refunded() {
        let gw = MockPaymentGateway::new();
        assert!(matches!(
            gw.verify_session("nope").await,
            Err(GatewayError::UnknownSession(_))
        ));
        assert!(gw.refund_session("nope", 10).await.is_err());
        assert!(gw.refunds().is_empty());
    }

    #[tokio::test]
    async fn refunds_are_recorded() {
        let gw = MockPaymentGateway::new();
        let s = gw.create_session(900, "usd", Ulid::new()).await.unwrap();
        gw.refund_session(&s.session_ref, 900).await.unwrap();
        assert_eq!(gw.refunds(), vec![(s.session_ref, 900)]);
    }
}
