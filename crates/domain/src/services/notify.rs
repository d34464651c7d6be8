use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::model::{Credits, PaymentId, PaymentStatus, TaskId, TaskKind, UserId};

/// What happened to the credits reserved for a failed generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundState {
    /// Nothing was reserved.
    NotCharged,
    Returned,
    /// The reservation is still held; the startup sweep gives it back.
    Pending,
}

/// Everything the core tells a user, rendered to text by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    GenerationDelivered {
        user_id: UserId,
        task_id: TaskId,
        kind: TaskKind,
        media_urls: Vec<String>,
        charged: Credits,
        balance: Credits,
    },
    GenerationFailed {
        user_id: UserId,
        task_id: Option<TaskId>,
        cause: String,
        refund: RefundState,
    },
    InsufficientFunds {
        user_id: UserId,
        required: Credits,
        available: Credits,
    },
    PaymentSucceeded {
        user_id: UserId,
        payment_id: PaymentId,
        credits: Credits,
        balance: Credits,
    },
    PaymentClosed {
        user_id: UserId,
        payment_id: PaymentId,
        status: PaymentStatus,
    },
    PaymentTimedOut {
        user_id: UserId,
        payment_id: PaymentId,
    },
    CreditsGranted {
        user_id: UserId,
        credits: Credits,
        balance: Credits,
    },
}

impl Notification {
    pub fn user_id(&self) -> UserId {
        match self {
            Self::GenerationDelivered { user_id, .. }
            | Self::GenerationFailed { user_id, .. }
            | Self::InsufficientFunds { user_id, .. }
            | Self::PaymentSucceeded { user_id, .. }
            | Self::PaymentClosed { user_id, .. }
            | Self::PaymentTimedOut { user_id, .. }
            | Self::CreditsGranted { user_id, .. } => *user_id,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NotifyError {
    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError>;
}

/// Logs notifications instead of delivering them; used when no chat
/// transport is wired.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        info!(user_id = %notification.user_id(), ?notification, "notification");
        Ok(())
    }
}
