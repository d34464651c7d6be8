use std::sync::Arc;
use std::time::Duration;

use cardsmith_domain::config::GenerationConfig;
use metrics::counter;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::remote::{GenerationApi, GenerationError, RemoteState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl PollPolicy {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn from_config(config: &GenerationConfig) -> Self {
        Self::new(config.poll_interval(), config.max_poll_attempts())
    }
}

/// Cooperative cancellation shared between an orchestration and whoever may
/// abort it. Cancelling never touches remote state.
#[derive(Debug, Clone)]
pub struct CancelToken {
    sender: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        // The sender lives as long as `self`, so `changed` cannot fail here.
        while !*receiver.borrow_and_update() {
            if receiver.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Polls `task_id` until it reaches a terminal state and returns its result
/// URLs. A transient transport failure is retried once silently; a second
/// consecutive one degrades to `RemoteFailed`.
pub async fn await_result<G>(
    api: &G,
    task_id: &str,
    policy: PollPolicy,
    cancel: &CancelToken,
) -> Result<Vec<String>, GenerationError>
where
    G: GenerationApi + ?Sized,
{
    let mut retried_transient = false;
    for attempt in 1..=policy.max_attempts {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(GenerationError::Cancelled),
            _ = sleep(policy.interval) => {}
        }

        let snapshot = match api.query_task(task_id).await {
            Ok(snapshot) => {
                retried_transient = false;
                snapshot
            }
            Err(err) if err.is_transient() && !retried_transient => {
                retried_transient = true;
                counter!("generation_polls_total", "result" => "transient").increment(1);
                warn!(remote_task_id = task_id, attempt, %err, "transient poll failure, retrying");
                continue;
            }
            Err(GenerationError::Transport { message, .. }) => {
                counter!("generation_polls_total", "result" => "transport").increment(1);
                return Err(GenerationError::RemoteFailed(message));
            }
            Err(err) => return Err(err),
        };

        match snapshot.state {
            RemoteState::Success => {
                counter!("generation_polls_total", "result" => "success").increment(1);
                if snapshot.result_urls.is_empty() {
                    return Err(GenerationError::Decode(
                        "successful task carried no result urls".into(),
                    ));
                }
                return Ok(snapshot.result_urls);
            }
            RemoteState::Fail => {
                counter!("generation_polls_total", "result" => "fail").increment(1);
                return Err(GenerationError::RemoteFailed(
                    snapshot
                        .fail_message
                        .unwrap_or_else(|| "generation failed".into()),
                ));
            }
            RemoteState::Queued | RemoteState::Processing => {
                debug!(remote_task_id = task_id, attempt, state = ?snapshot.state, "task pending");
            }
            RemoteState::Unknown(state) => {
                debug!(remote_task_id = task_id, attempt, state, "unknown task state, polling on");
            }
        }
    }

    counter!("generation_polls_total", "result" => "timeout").increment(1);
    Err(GenerationError::Timeout {
        attempts: policy.max_attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::TaskSnapshot;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Replays scripted poll answers; the last one repeats forever.
    struct ScriptedApi {
        answers: Mutex<VecDeque<Result<TaskSnapshot, GenerationError>>>,
        polls: AtomicUsize,
    }

    impl ScriptedApi {
        fn new(answers: Vec<Result<TaskSnapshot, GenerationError>>) -> Self {
            Self {
                answers: Mutex::new(answers.into()),
                polls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl GenerationApi for ScriptedApi {
        async fn create_task(&self, _: &str, _: &Value) -> Result<String, GenerationError> {
            Ok("remote".into())
        }

        async fn query_task(&self, _: &str) -> Result<TaskSnapshot, GenerationError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            let mut answers = self.answers.lock().unwrap();
            if answers.len() > 1 {
                answers.pop_front().unwrap()
            } else {
                answers.front().cloned().unwrap()
            }
        }

        async fn download(&self, _: &str) -> Result<Vec<u8>, GenerationError> {
            Ok(Vec::new())
        }
    }

    fn state(state: RemoteState) -> Result<TaskSnapshot, GenerationError> {
        let result_urls = if state == RemoteState::Success {
            vec!["https://cdn.example/out.png".to_string()]
        } else {
            Vec::new()
        };
        Ok(TaskSnapshot {
            state,
            result_urls,
            fail_message: None,
        })
    }

    fn transient() -> Result<TaskSnapshot, GenerationError> {
        Err(GenerationError::Transport {
            message: "connection reset".into(),
            transient: true,
        })
    }

    fn policy(max_attempts: u32) -> PollPolicy {
        PollPolicy::new(Duration::from_millis(1), max_attempts)
    }

    #[tokio::test]
    async fn resolves_after_processing_states() {
        let api = ScriptedApi::new(vec![
            state(RemoteState::Queued),
            state(RemoteState::Processing),
            state(RemoteState::Unknown("paused".into())),
            state(RemoteState::Success),
        ]);
        let urls = await_result(&api, "t", policy(10), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(urls, vec!["https://cdn.example/out.png"]);
        assert_eq!(api.polls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn one_transient_error_is_retried() {
        let api = ScriptedApi::new(vec![transient(), state(RemoteState::Success)]);
        let urls = await_result(&api, "t", policy(10), &CancelToken::new()).await;
        assert!(urls.is_ok());
    }

    #[tokio::test]
    async fn consecutive_transient_errors_degrade_to_remote_failure() {
        let api = ScriptedApi::new(vec![transient(), transient()]);
        let err = await_result(&api, "t", policy(10), &CancelToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, GenerationError::RemoteFailed("connection reset".into()));
        assert_eq!(api.polls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn terminal_failure_is_not_retried() {
        let api = ScriptedApi::new(vec![Ok(TaskSnapshot {
            state: RemoteState::Fail,
            result_urls: Vec::new(),
            fail_message: Some("nsfw".into()),
        })]);
        let err = await_result(&api, "t", policy(10), &CancelToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, GenerationError::RemoteFailed("nsfw".into()));
        assert_eq!(api.polls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let api = ScriptedApi::new(vec![state(RemoteState::Processing)]);
        let err = await_result(&api, "t", policy(3), &CancelToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, GenerationError::Timeout { attempts: 3 });
        assert_eq!(api.polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancellation_stops_polling() {
        let api = ScriptedApi::new(vec![state(RemoteState::Processing)]);
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = await_result(&api, "t", policy(100), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, GenerationError::Cancelled);
        assert_eq!(api.polls.load(Ordering::SeqCst), 0);
        assert!(cancel.is_cancelled());
    }
}
