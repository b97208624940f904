use ulid::Ulid;

use crate::model::{ActorId, BucketKey, SlotId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Lost a race, or the slot is already occupied or its hold has lapsed.
    SlotUnavailable(SlotId),
    InvalidTransition {
        entity: Ulid,
        from: &'static str,
        op: &'static str,
    },
    Unauthorized(ActorId),
    CapacityExceeded(u32),
    PreconditionFailed(&'static str),
    /// Opaque failure reported by the payment gateway.
    PaymentError(String),
    NotFound(Ulid),
    NoSuchBucket(BucketKey),
    UnknownSession(String),
    AlreadyExists(String),
    PriceNotSet {
        slot_id: SlotId,
        activity: String,
    },
    Conflict(&'static str),
    InvalidInput(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl CoreError {
    /// Race losses and lapsed holds both mean "pick another slot".
    pub fn is_slot_unavailable(&self) -> bool {
        matches!(self, CoreError::SlotUnavailable(_))
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::SlotUnavailable(_) => "slot_unavailable",
            CoreError::InvalidTransition { .. } => "invalid_transition",
            CoreError::Unauthorized(_) => "unauthorized",
            CoreError::CapacityExceeded(_) => "capacity_exceeded",
            CoreError::PreconditionFailed(_) => "precondition_failed",
            CoreError::PaymentError(_) => "payment_error",
            CoreError::NotFound(_)
            | CoreError::NoSuchBucket(_)
            | CoreError::UnknownSession(_) => "not_found",
            CoreError::AlreadyExists(_) => "already_exists",
            CoreError::PriceNotSet { .. } => "price_not_set",
            CoreError::Conflict(_) => "conflict",
            CoreError::InvalidInput(_) => "invalid_input",
            CoreError::LimitExceeded(_) => "limit_exceeded",
            CoreError::WalError(_) => "wal_error",
        }
    }
}

impl std::fmt::Display for CoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoreError::SlotUnavailable(id) => write!(f, "slot no longer available: {id}"),
            CoreError::InvalidTransition { entity, from, op } => {
                write!(f, "cannot {op} {entity}: currently {from}")
            }
            CoreError::Unauthorized(actor) => write!(f, "actor {actor} is not allowed to do that"),
            CoreError::CapacityExceeded(max) => {
                write!(f, "capacity {max} exceeded: roster is full")
            }
            CoreError::PreconditionFailed(msg) => write!(f, "precondition failed: {msg}"),
            CoreError::PaymentError(msg) => write!(f, "payment error: {msg}"),
            CoreError::NotFound(id) => write!(f, "not found: {id}"),
            CoreError::NoSuchBucket(key) => write!(f, "no slots generated for {key}"),
            CoreError::UnknownSession(s) => write!(f, "unknown payment session: {s}"),
            CoreError::AlreadyExists(what) => write!(f, "already exists: {what}"),
            CoreError::PriceNotSet { slot_id, activity } => {
                write!(f, "no price set for {activity} on slot {slot_id}")
            }
            CoreError::Conflict(msg) => write!(f, "conflict: {msg}"),
            CoreError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            CoreError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            CoreError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for CoreError {}
