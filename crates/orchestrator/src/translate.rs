//! Prompt translation seam. The generation models expect English prompts;
//! anything non-ASCII is handed to a translator first.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TranslateError {
    #[error("translation request failed: {0}")]
    Transport(String),
    #[error("translation response malformed: {0}")]
    Decode(String),
}

#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(&self, text: &str) -> Result<String, TranslateError>;
}

/// Returns prompts untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughTranslator;

#[async_trait]
impl Translator for PassthroughTranslator {
    async fn translate(&self, text: &str) -> Result<String, TranslateError> {
        Ok(text.to_string())
    }
}

/// Talks to a LibreTranslate-compatible `POST /translate` endpoint.
#[derive(Clone)]
pub struct HttpTranslator {
    http: Client,
    url: String,
}

#[derive(Serialize)]
struct TranslateRequest<'a> {
    q: &'a str,
    source: &'static str,
    target: &'static str,
    format: &'static str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TranslateResponse {
    translated_text: String,
}

impl HttpTranslator {
    pub fn new(base_url: &str) -> Result<Self, TranslateError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|err| TranslateError::Transport(err.to_string()))?;
        Ok(Self {
            http,
            url: format!("{}/translate", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl Translator for HttpTranslator {
    async fn translate(&self, text: &str) -> Result<String, TranslateError> {
        let response = self
            .http
            .post(&self.url)
            .json(&TranslateRequest {
                q: text,
                source: "auto",
                target: "en",
                format: "text",
            })
            .send()
            .await
            .map_err(|err| TranslateError::Transport(err.to_string()))?
            .error_for_status()
            .map_err(|err| TranslateError::Transport(err.to_string()))?;
        let body: TranslateResponse = response
            .json()
            .await
            .map_err(|err| TranslateError::Decode(err.to_string()))?;
        Ok(body.translated_text)
    }
}

/// ASCII prompts pass through; otherwise the translation is used, falling
/// back to the original text when the translator fails or returns nothing.
pub async fn prepare_prompt<T>(translator: &T, prompt: &str) -> String
where
    T: Translator + ?Sized,
{
    let prompt = prompt.trim();
    if prompt.is_ascii() {
        return prompt.to_string();
    }
    match translator.translate(prompt).await {
        Ok(translated) if !translated.trim().is_empty() => translated.trim().to_string(),
        Ok(_) => prompt.to_string(),
        Err(err) => {
            warn!(%err, "prompt translation failed, using original text");
            prompt.to_string()
        }
    }
}
