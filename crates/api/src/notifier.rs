use std::time::Duration;

use async_trait::async_trait;
use cardsmith_domain::services::{Notification, Notifier, NotifyError};
use metrics::counter;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::messages::MessageCatalog;

/// Delivers notifications through the chat platform's bot API: result media
/// first, then the rendered text.
#[derive(Clone)]
pub struct ChatNotifier {
    http: Client,
    endpoint: String,
    messages: MessageCatalog,
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: i64,
    text: &'a str,
}

#[derive(Serialize)]
struct SendPhoto<'a> {
    chat_id: i64,
    photo: &'a str,
}

#[derive(Serialize)]
struct SendVideo<'a> {
    chat_id: i64,
    video: &'a str,
}

#[derive(Deserialize)]
struct BotResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

impl ChatNotifier {
    pub fn new(api_base_url: &str, bot_token: &str, messages: MessageCatalog) -> Result<Self, NotifyError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| NotifyError::Delivery(err.to_string()))?;
        Ok(Self {
            http,
            endpoint: format!("{}/bot{}", api_base_url.trim_end_matches('/'), bot_token),
            messages,
        })
    }

    async fn call<T: Serialize + ?Sized>(&self, method: &'static str, body: &T) -> Result<(), NotifyError> {
        let response = self
            .http
            .post(format!("{}/{method}", self.endpoint))
            .json(body)
            .send()
            .await
            .map_err(|err| NotifyError::Delivery(err.to_string()))?;
        let status = response.status();
        let parsed: BotResponse = response
            .json()
            .await
            .map_err(|err| NotifyError::Delivery(format!("http {status}: {err}")))?;
        if !parsed.ok {
            counter!("gateway_notifications_total", "method" => method, "result" => "error")
                .increment(1);
            return Err(NotifyError::Delivery(
                parsed
                    .description
                    .unwrap_or_else(|| format!("{method} refused (http {status})")),
            ));
        }
        counter!("gateway_notifications_total", "method" => method, "result" => "ok").increment(1);
        Ok(())
    }
}

#[async_trait]
impl Notifier for ChatNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        let chat_id = notification.user_id().get();
        if let Notification::GenerationDelivered {
            media_urls, kind, ..
        } = &notification
        {
            for url in media_urls {
                if kind.is_video() {
                    self.call("sendVideo", &SendVideo { chat_id, video: url }).await?;
                } else {
                    self.call("sendPhoto", &SendPhoto { chat_id, photo: url }).await?;
                }
            }
        }
        let text = self.messages.render(&notification);
        debug!(chat_id, "sending notification");
        self.call("sendMessage", &SendMessage { chat_id, text: &text }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cardsmith_domain::model::{TaskId, TaskKind, UserId};
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn delivery_sends_media_before_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botTOKEN/sendPhoto"))
            .and(body_partial_json(json!({
                "chat_id": 42,
                "photo": "https://bot.example/media/abc.png"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/botTOKEN/sendMessage"))
            .and(body_partial_json(json!({
                "chat_id": 42,
                "text": "Done! 1 credit(s) spent, balance: 9."
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = ChatNotifier::new(&server.uri(), "TOKEN", MessageCatalog::default()).unwrap();
        notifier
            .notify(Notification::GenerationDelivered {
                user_id: UserId::new(42),
                task_id: TaskId::new(1),
                kind: TaskKind::PhotoCustom,
                media_urls: vec!["https://bot.example/media/abc.png".into()],
                charged: 1,
                balance: 9,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn refused_calls_surface_the_description() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botTOKEN/sendMessage"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "ok": false,
                "description": "Forbidden: bot was blocked by the user"
            })))
            .mount(&server)
            .await;

        let notifier = ChatNotifier::new(&server.uri(), "TOKEN", MessageCatalog::default()).unwrap();
        let err = notifier
            .notify(Notification::CreditsGranted {
                user_id: UserId::new(42),
                credits: 5,
                balance: 5,
            })
            .await
            .unwrap_err();
        assert_eq!(
            err,
            NotifyError::Delivery("Forbidden: bot was blocked by the user".into())
        );
    }
}
