//! User-facing copy. Each notification maps to one template; `{name}`
//! placeholders are filled from the notification's fields.

use std::collections::HashMap;

use cardsmith_domain::services::{Notification, RefundState};

const DEFAULTS: &[(&str, &str)] = &[
    (
        "generation_delivered",
        "Done! {charged} credit(s) spent, balance: {balance}.",
    ),
    (
        "generation_failed_refunded",
        "Generation failed: {cause}. Credits returned to balance.",
    ),
    (
        "generation_failed_refund_pending",
        "Generation failed: {cause}. Your credits are on hold until the refund goes through.",
    ),
    ("generation_failed", "Generation failed: {cause}."),
    (
        "insufficient_funds",
        "Not enough credits: {required} needed, you have {available}. Top up to continue.",
    ),
    (
        "payment_succeeded",
        "Payment received, {credits} credits added. Balance: {balance}.",
    ),
    ("payment_closed", "Payment {payment_id} was {status}."),
    (
        "payment_timed_out",
        "Payment {payment_id} was not confirmed in time. If you paid, credits arrive automatically.",
    ),
    (
        "credits_granted",
        "You received {credits} credits. Balance: {balance}.",
    ),
];

#[derive(Debug, Clone)]
pub struct MessageCatalog {
    templates: HashMap<&'static str, String>,
}

impl Default for MessageCatalog {
    fn default() -> Self {
        Self {
            templates: DEFAULTS
                .iter()
                .map(|(key, template)| (*key, (*template).to_string()))
                .collect(),
        }
    }
}

impl MessageCatalog {
    /// Replaces a template; unknown keys are ignored.
    pub fn with_template(mut self, key: &str, template: impl Into<String>) -> Self {
        if let Some(slot) = self.templates.get_mut(key) {
            *slot = template.into();
        }
        self
    }

    pub fn render(&self, notification: &Notification) -> String {
        let (key, fields): (&str, Vec<(&str, String)>) = match notification {
            Notification::GenerationDelivered {
                charged, balance, ..
            } => (
                "generation_delivered",
                vec![("charged", charged.to_string()), ("balance", balance.to_string())],
            ),
            Notification::GenerationFailed { cause, refund, .. } => (
                match refund {
                    RefundState::Returned => "generation_failed_refunded",
                    RefundState::Pending => "generation_failed_refund_pending",
                    RefundState::NotCharged => "generation_failed",
                },
                vec![("cause", cause.clone())],
            ),
            Notification::InsufficientFunds {
                required,
                available,
                ..
            } => (
                "insufficient_funds",
                vec![
                    ("required", required.to_string()),
                    ("available", available.to_string()),
                ],
            ),
            Notification::PaymentSucceeded {
                credits, balance, ..
            } => (
                "payment_succeeded",
                vec![("credits", credits.to_string()), ("balance", balance.to_string())],
            ),
            Notification::PaymentClosed {
                payment_id, status, ..
            } => (
                "payment_closed",
                vec![
                    ("payment_id", payment_id.to_string()),
                    ("status", status.to_string()),
                ],
            ),
            Notification::PaymentTimedOut { payment_id, .. } => (
                "payment_timed_out",
                vec![("payment_id", payment_id.to_string())],
            ),
            Notification::CreditsGranted {
                credits, balance, ..
            } => (
                "credits_granted",
                vec![("credits", credits.to_string()), ("balance", balance.to_string())],
            ),
        };

        let mut text = self.templates.get(key).cloned().unwrap_or_default();
        for (name, value) in fields {
            text = text.replace(&format!("{{{name}}}"), &value);
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cardsmith_domain::model::UserId;

    #[test]
    fn renders_refund_copy() {
        let text = MessageCatalog::default().render(&Notification::GenerationFailed {
            user_id: UserId::new(1),
            task_id: None,
            cause: "generation took too long".into(),
            refund: RefundState::Returned,
        });
        assert_eq!(
            text,
            "Generation failed: generation took too long. Credits returned to balance."
        );
    }

    #[test]
    fn held_credits_are_not_reported_as_returned() {
        let text = MessageCatalog::default().render(&Notification::GenerationFailed {
            user_id: UserId::new(1),
            task_id: None,
            cause: "internal error: database is locked".into(),
            refund: RefundState::Pending,
        });
        assert!(!text.contains("returned to balance"));
        assert!(text.contains("on hold"));
    }

    #[test]
    fn overrides_replace_defaults() {
        let catalog = MessageCatalog::default().with_template("credits_granted", "+{credits}");
        let text = catalog.render(&Notification::CreditsGranted {
            user_id: UserId::new(1),
            credits: 5,
            balance: 9,
        });
        assert_eq!(text, "+5");
    }
}
