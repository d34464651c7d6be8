use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub struct Amount {
    pub value: String,
    pub currency: String,
}

#[derive(Debug, Serialize)]
pub struct Confirmation<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub return_url: &'a str,
}

#[derive(Debug, Serialize)]
pub struct Customer<'a> {
    pub email: &'a str,
}

#[derive(Debug, Serialize)]
pub struct ReceiptItem<'a> {
    pub description: &'a str,
    pub quantity: &'static str,
    pub amount: Amount,
    pub vat_code: u8,
    pub payment_mode: &'static str,
    pub payment_subject: &'static str,
}

#[derive(Debug, Serialize)]
pub struct Receipt<'a> {
    pub customer: Customer<'a>,
    pub items: Vec<ReceiptItem<'a>>,
}

#[derive(Debug, Serialize)]
pub struct CreatePaymentBody<'a> {
    pub amount: Amount,
    pub confirmation: Confirmation<'a>,
    pub capture: bool,
    pub description: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt: Option<Receipt<'a>>,
    pub metadata: &'a BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct ConfirmationResponse {
    #[serde(default)]
    pub confirmation_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PaymentResponse {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub paid: bool,
    #[serde(default)]
    pub confirmation: Option<ConfirmationResponse>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct ErrorResponse {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
}
