//! Data structures shared across the gateway, orchestrator and reconciler.

mod catalog;
mod pricing;
mod request;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};
use thiserror::Error;

pub use catalog::*;
pub use pricing::*;
pub use request::*;

/// Internal unit of account. Balances and prices are always whole credits.
pub type Credits = i64;

/// Chat-platform identity of a user; doubles as the ledger key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(i64);

impl UserId {
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic local task identifier assigned by the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(i64);

impl TaskId {
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Maximum accepted length for provider-issued payment identifiers.
pub const PAYMENT_ID_MAX_LENGTH: usize = 64;

/// Errors emitted when a provider payment id fails validation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PaymentIdError {
    #[error("payment id must not be empty")]
    Empty,
    #[error("payment id must be at most {PAYMENT_ID_MAX_LENGTH} characters")]
    TooLong,
    #[error("payment id contains unsupported characters")]
    InvalidCharacters,
}

/// Payment identifier issued by the payment provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PaymentId(String);

impl PaymentId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn parse(value: &str) -> Result<Self, PaymentIdError> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(PaymentIdError::Empty);
        }
        if trimmed.len() > PAYMENT_ID_MAX_LENGTH {
            return Err(PaymentIdError::TooLong);
        }
        if !trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(PaymentIdError::InvalidCharacters);
        }
        Ok(Self::new(trimmed))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for PaymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity fields refreshed on every contact with the chat platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub platform_id: UserId,
    pub username: Option<String>,
    pub full_name: Option<String>,
    pub is_admin: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserRecord {
    pub platform_id: UserId,
    pub username: Option<String>,
    pub full_name: Option<String>,
    pub balance: Credits,
    pub is_admin: bool,
    pub is_banned: bool,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Operator-facing way to address a user: numeric platform id or `@username`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserLookup {
    PlatformId(UserId),
    Username(String),
}

impl UserLookup {
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        if let Ok(id) = trimmed.parse::<i64>() {
            return Some(Self::PlatformId(UserId::new(id)));
        }
        let name = trimmed.trim_start_matches('@');
        if name.is_empty() {
            None
        } else {
            Some(Self::Username(name.to_string()))
        }
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskKind {
    ProductCard,
    NormalizeOwn,
    NormalizeNew,
    #[serde(rename = "video_balance")]
    #[strum(serialize = "video_balance")]
    VideoBalance,
    #[serde(rename = "video_pro6")]
    #[strum(serialize = "video_pro6")]
    VideoPro6,
    #[serde(rename = "video_pro10")]
    #[strum(serialize = "video_pro10")]
    VideoPro10,
    #[serde(rename = "video_super6")]
    #[strum(serialize = "video_super6")]
    VideoSuper6,
    PhotoScene,
    PhotoPose,
    PhotoCustom,
}

impl TaskKind {
    pub fn is_video(self) -> bool {
        matches!(
            self,
            Self::VideoBalance | Self::VideoPro6 | Self::VideoPro10 | Self::VideoSuper6
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub user_id: UserId,
    pub kind: TaskKind,
    pub cost: Credits,
    pub input_params: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    pub id: TaskId,
    pub user_id: UserId,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub cost: Credits,
    pub input_params: Value,
    pub result_refs: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Terminal state written by `finalize_task`.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskResolution {
    Completed { result_refs: Value },
    Failed { error: String },
}

impl TaskResolution {
    pub fn status(&self) -> TaskStatus {
        match self {
            Self::Completed { .. } => TaskStatus::Completed,
            Self::Failed { .. } => TaskStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// The task moved to its terminal state; `refunded` is non-zero only for
    /// failures.
    Finalized { refunded: Credits },
    AlreadyTerminal,
    Missing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveOutcome {
    Reserved { balance: Credits },
    Insufficient { balance: Credits },
    UnknownUser,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Succeeded,
    Cancelled,
    Rejected,
}

impl PaymentStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPayment {
    pub payment_id: PaymentId,
    pub user_id: UserId,
    pub amount_minor: i64,
    pub currency: String,
    pub credits: Credits,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentRecord {
    pub payment_id: PaymentId,
    pub user_id: UserId,
    pub amount_minor: i64,
    pub currency: String,
    pub credits: Credits,
    pub status: PaymentStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied { user_id: UserId, balance: Credits },
    AlreadyApplied,
}

/// A top-up offer: fiat amount in minor units and the credits it buys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentPackage {
    pub amount_minor: i64,
    pub credits: Credits,
}

impl PaymentPackage {
    /// Parses `"299:30"` or `"299.50:30"` (major units, then credits).
    pub fn parse(raw: &str) -> Option<Self> {
        let (amount, credits) = raw.trim().split_once(':')?;
        let amount_minor = parse_major_amount(amount.trim())?;
        let credits = credits.trim().parse::<Credits>().ok()?;
        if amount_minor <= 0 || credits <= 0 {
            return None;
        }
        Some(Self {
            amount_minor,
            credits,
        })
    }
}

fn parse_major_amount(raw: &str) -> Option<i64> {
    let (major, minor) = match raw.split_once('.') {
        Some((major, minor)) => (major, minor),
        None => (raw, ""),
    };
    let major = major.parse::<i64>().ok()?;
    let minor = match minor.len() {
        0 => 0,
        1 => minor.parse::<i64>().ok()? * 10,
        2 => minor.parse::<i64>().ok()?,
        _ => return None,
    };
    major.checked_mul(100)?.checked_add(minor)
}

/// Renders minor units as the provider's decimal string, e.g. `29900` -> `"299.00"`.
pub fn format_minor_amount(amount_minor: i64) -> String {
    let sign = if amount_minor < 0 { "-" } else { "" };
    let abs = amount_minor.unsigned_abs();
    format!("{sign}{}.{:02}", abs / 100, abs % 100)
}

/// Aggregates shown to operators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    pub users: u64,
    pub banned_users: u64,
    pub outstanding_credits: Credits,
    pub pending_tasks: u64,
    pub processing_tasks: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub succeeded_payments: u64,
    pub credits_sold: Credits,
}
