use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Serialize)]
pub struct CreateTaskRequest<'a> {
    pub model: &'a str,
    pub input: &'a Value,
}

/// Every generation API response wraps its payload in this envelope;
/// `code != 200` signals a body-level failure.
#[derive(Debug, Deserialize)]
pub struct Envelope<T> {
    pub code: i64,
    #[serde(default)]
    pub msg: Option<String>,
    pub data: Option<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedTask {
    pub task_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordInfo {
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub result_json: Option<Value>,
    #[serde(default)]
    pub fail_msg: Option<String>,
    #[serde(default)]
    pub fail_code: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultPayload {
    #[serde(default)]
    pub result_urls: Vec<String>,
}

/// Remote job state as reported by `recordInfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteState {
    Queued,
    Processing,
    Success,
    Fail,
    Unknown(String),
}

impl RemoteState {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "queued" | "waiting" => Self::Queued,
            "processing" | "generating" => Self::Processing,
            "success" => Self::Success,
            "fail" | "failed" | "error" => Self::Fail,
            other => Self::Unknown(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSnapshot {
    pub state: RemoteState,
    pub result_urls: Vec<String>,
    pub fail_message: Option<String>,
}

impl TaskSnapshot {
    pub fn from_record(record: RecordInfo) -> Result<Self, serde_json::Error> {
        let state = RemoteState::parse(record.state.as_deref().unwrap_or_default());
        let result_urls = match (&state, record.result_json) {
            (RemoteState::Success, Some(raw)) => parse_result_json(raw)?.result_urls,
            _ => Vec::new(),
        };
        let fail_message = record.fail_msg.filter(|msg| !msg.trim().is_empty()).or_else(|| {
            record.fail_code.and_then(|code| match code {
                Value::Null => None,
                Value::String(code) => Some(format!("failure code {code}")),
                other => Some(format!("failure code {other}")),
            })
        });
        Ok(Self {
            state,
            result_urls,
            fail_message,
        })
    }
}

/// `resultJson` arrives either as a JSON-encoded string or as an inline object.
fn parse_result_json(raw: Value) -> Result<ResultPayload, serde_json::Error> {
    match raw {
        Value::String(encoded) if encoded.trim().is_empty() => Ok(ResultPayload::default()),
        Value::String(encoded) => serde_json::from_str(&encoded),
        Value::Null => Ok(ResultPayload::default()),
        other => serde_json::from_value(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> RecordInfo {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn result_json_accepts_encoded_string_and_object() {
        let encoded = record(json!({
            "state": "success",
            "resultJson": "{\"resultUrls\":[\"https://cdn.example/1.png\"]}"
        }));
        let inline = record(json!({
            "state": "success",
            "resultJson": {"resultUrls": ["https://cdn.example/1.png"]}
        }));
        let left = TaskSnapshot::from_record(encoded).unwrap();
        let right = TaskSnapshot::from_record(inline).unwrap();
        assert_eq!(left, right);
        assert_eq!(left.result_urls, vec!["https://cdn.example/1.png"]);
    }

    #[test]
    fn state_aliases_map_to_canonical_states() {
        assert_eq!(RemoteState::parse("waiting"), RemoteState::Queued);
        assert_eq!(RemoteState::parse("generating"), RemoteState::Processing);
        assert_eq!(RemoteState::parse("FAILED"), RemoteState::Fail);
        assert_eq!(RemoteState::parse("error"), RemoteState::Fail);
        assert_eq!(
            RemoteState::parse("paused"),
            RemoteState::Unknown("paused".into())
        );
    }

    #[test]
    fn fail_code_backs_up_missing_message() {
        let snapshot = TaskSnapshot::from_record(record(json!({
            "state": "fail",
            "failMsg": "",
            "failCode": 501
        })))
        .unwrap();
        assert_eq!(snapshot.state, RemoteState::Fail);
        assert_eq!(snapshot.fail_message.as_deref(), Some("failure code 501"));
    }
}
