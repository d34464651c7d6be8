//! HTTP client for the remote generation API plus the trait seam the
//! orchestrator drives.

use std::time::Duration;

use async_trait::async_trait;
use cardsmith_domain::config::GenerationConfig;
use metrics::counter;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

mod types;

pub use types::{RemoteState, TaskSnapshot};
use types::{CreateTaskRequest, CreatedTask, Envelope, RecordInfo};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GenerationError {
    #[error("provider rejected the task: {0}")]
    RemoteRejected(String),
    #[error("remote task failed: {0}")]
    RemoteFailed(String),
    #[error("remote task still unfinished after {attempts} polls")]
    Timeout { attempts: u32 },
    #[error("transport error: {message}")]
    Transport { message: String, transient: bool },
    #[error("malformed provider response: {0}")]
    Decode(String),
    #[error("polling cancelled")]
    Cancelled,
}

impl GenerationError {
    fn transport(err: reqwest::Error) -> Self {
        let transient = err.is_timeout() || err.is_connect() || err.is_request();
        Self::Transport {
            message: err.to_string(),
            transient,
        }
    }

    /// Reading a body can fail mid-stream; only a complete but unparsable
    /// body is a decode error.
    fn body(err: reqwest::Error) -> Self {
        if err.is_body() || err.is_timeout() {
            Self::Transport {
                message: err.to_string(),
                transient: true,
            }
        } else {
            Self::Decode(err.to_string())
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport {
                transient: true,
                ..
            }
        )
    }
}

#[async_trait]
pub trait GenerationApi: Send + Sync {
    /// Submits a fresh remote job; there is no client-side deduplication.
    async fn create_task(&self, model: &str, input: &Value) -> Result<String, GenerationError>;
    async fn query_task(&self, task_id: &str) -> Result<TaskSnapshot, GenerationError>;
    async fn download(&self, url: &str) -> Result<Vec<u8>, GenerationError>;
}

#[derive(Clone)]
pub struct HttpGenerationClient {
    http: Client,
    base_url: String,
    api_key: String,
    download_timeout: Duration,
}

impl HttpGenerationClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        download_timeout: Duration,
    ) -> Result<Self, GenerationError> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(GenerationError::transport)?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            download_timeout,
        })
    }

    pub fn from_config(config: &GenerationConfig) -> Result<Self, GenerationError> {
        Self::new(
            config.base_url(),
            config.api_key(),
            config.download_timeout(),
        )
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }
}

#[async_trait]
impl GenerationApi for HttpGenerationClient {
    async fn create_task(&self, model: &str, input: &Value) -> Result<String, GenerationError> {
        let response = self
            .http
            .post(self.endpoint("jobs/createTask"))
            .bearer_auth(&self.api_key)
            .json(&CreateTaskRequest { model, input })
            .send()
            .await
            .map_err(GenerationError::transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            counter!("generation_api_calls_total", "call" => "create", "result" => "rejected")
                .increment(1);
            return Err(GenerationError::RemoteRejected(format!(
                "http {status}: {}",
                body.trim()
            )));
        }

        let envelope: Envelope<CreatedTask> = response
            .json()
            .await
            .map_err(|err| GenerationError::Decode(err.to_string()))?;
        if envelope.code != 200 {
            counter!("generation_api_calls_total", "call" => "create", "result" => "rejected")
                .increment(1);
            return Err(GenerationError::RemoteRejected(
                envelope
                    .msg
                    .unwrap_or_else(|| format!("provider code {}", envelope.code)),
            ));
        }
        let created = envelope
            .data
            .ok_or_else(|| GenerationError::Decode("createTask response without data".into()))?;
        counter!("generation_api_calls_total", "call" => "create", "result" => "ok").increment(1);
        debug!(model, remote_task_id = %created.task_id, "remote task created");
        Ok(created.task_id)
    }

    async fn query_task(&self, task_id: &str) -> Result<TaskSnapshot, GenerationError> {
        let response = self
            .http
            .get(self.endpoint("jobs/recordInfo"))
            .bearer_auth(&self.api_key)
            .query(&[("taskId", task_id)])
            .send()
            .await
            .map_err(GenerationError::transport)?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(GenerationError::Transport {
                message: format!("recordInfo returned http {status}"),
                transient: true,
            });
        }
        if !status.is_success() {
            return Err(GenerationError::Transport {
                message: format!("recordInfo returned http {status}"),
                transient: false,
            });
        }

        let envelope: Envelope<RecordInfo> =
            response.json().await.map_err(GenerationError::body)?;
        if envelope.code != 200 {
            return Err(GenerationError::RemoteFailed(
                envelope
                    .msg
                    .unwrap_or_else(|| format!("provider code {}", envelope.code)),
            ));
        }
        let record = envelope
            .data
            .ok_or_else(|| GenerationError::Decode("recordInfo response without data".into()))?;
        TaskSnapshot::from_record(record).map_err(|err| GenerationError::Decode(err.to_string()))
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, GenerationError> {
        let response = self
            .http
            .get(url)
            .timeout(self.download_timeout)
            .send()
            .await
            .map_err(GenerationError::transport)?;
        let status = response.status();
        if !status.is_success() {
            return Err(GenerationError::Transport {
                message: format!("artifact download returned http {status}"),
                transient: status.is_server_error(),
            });
        }
        let bytes = response
            .bytes()
            .await
            .map_err(GenerationError::transport)?;
        counter!("generation_downloaded_bytes_total").increment(bytes.len() as u64);
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> HttpGenerationClient {
        HttpGenerationClient::new(server.uri(), "secret", Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn create_task_posts_model_and_input() {
        let server = MockServer::start().await;
        let input = json!({"prompt": "studio", "image_urls": ["https://cdn.example/a.png"]});
        Mock::given(method("POST"))
            .and(path("/jobs/createTask"))
            .and(header("authorization", "Bearer secret"))
            .and(body_json(json!({"model": "google/nano-banana-edit", "input": input})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 200,
                "msg": "success",
                "data": {"taskId": "remote-1"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let task_id = client(&server)
            .create_task("google/nano-banana-edit", &input)
            .await
            .unwrap();
        assert_eq!(task_id, "remote-1");
    }

    #[tokio::test]
    async fn create_task_surfaces_body_level_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/jobs/createTask"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 402,
                "msg": "insufficient provider credits"
            })))
            .mount(&server)
            .await;

        let err = client(&server)
            .create_task("m", &json!({}))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            GenerationError::RemoteRejected("insufficient provider credits".into())
        );
    }

    #[tokio::test]
    async fn query_task_reads_record_info() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jobs/recordInfo"))
            .and(query_param("taskId", "remote-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 200,
                "data": {
                    "state": "success",
                    "resultJson": "{\"resultUrls\":[\"https://cdn.example/out.png\"]}"
                }
            })))
            .mount(&server)
            .await;

        let snapshot = client(&server).query_task("remote-1").await.unwrap();
        assert_eq!(snapshot.state, RemoteState::Success);
        assert_eq!(snapshot.result_urls, vec!["https://cdn.example/out.png"]);
    }

    #[tokio::test]
    async fn query_task_treats_server_errors_as_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jobs/recordInfo"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = client(&server).query_task("remote-1").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn query_task_treats_a_truncated_body_as_transient() {
        use std::io::{Read, Write};

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = [0u8; 1024];
            let _ = stream.read(&mut request);
            stream
                .write_all(
                    b"HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 200\r\n\r\n{\"code\": 200, \"data\": {",
                )
                .unwrap();
        });

        let client =
            HttpGenerationClient::new(format!("http://{address}"), "secret", Duration::from_secs(5))
                .unwrap();
        let err = client.query_task("remote-1").await.unwrap_err();
        server.join().unwrap();
        assert!(err.is_transient(), "got {err:?}");
    }

    #[tokio::test]
    async fn query_task_rejects_malformed_json() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jobs/recordInfo"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let err = client(&server).query_task("remote-1").await.unwrap_err();
        assert!(matches!(err, GenerationError::Decode(_)));
    }

    #[tokio::test]
    async fn download_returns_artifact_bytes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files/out.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8, 2, 3]))
            .mount(&server)
            .await;

        let bytes = client(&server)
            .download(&format!("{}/files/out.png", server.uri()))
            .await
            .unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
    }
}
