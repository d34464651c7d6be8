use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cardsmith_domain::config::ModelTable;
use cardsmith_domain::model::{
    Credits, FinalizeOutcome, GenerationRequest, NewTask, PriceTable, ReserveOutcome, TaskId,
    TaskKind, TaskResolution, UserId,
};
use cardsmith_domain::storage::{Ledger, StorageError, StorageResult};
use futures::stream::{self, StreamExt, TryStreamExt};
use metrics::{counter, histogram};
use serde_json::json;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::plan::{plan_request, Plan, PlanError, SubJob};
use crate::poll::{await_result, CancelToken, PollPolicy};
use crate::remote::{GenerationApi, GenerationError};
use crate::translate::{PassthroughTranslator, Translator};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("{0}")]
    Validation(String),
    #[error("not enough credits: {required} required, {available} available")]
    InsufficientFunds { required: Credits, available: Credits },
    #[error("the generation service refused the job: {0}")]
    RemoteRejected(String),
    #[error("generation failed: {0}")]
    RemoteFailed(String),
    #[error("generation took too long")]
    Timeout,
    #[error("network error: {0}")]
    Transport(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::InsufficientFunds { .. } => "insufficient_funds",
            Self::RemoteRejected(_) => "remote_rejected",
            Self::RemoteFailed(_) => "remote_failed",
            Self::Timeout => "timeout",
            Self::Transport(_) => "transport",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<GenerationError> for OrchestratorError {
    fn from(value: GenerationError) -> Self {
        match value {
            GenerationError::RemoteRejected(message) => Self::RemoteRejected(message),
            GenerationError::RemoteFailed(message) => Self::RemoteFailed(message),
            GenerationError::Timeout { .. } => Self::Timeout,
            GenerationError::Transport { message, .. } => Self::Transport(message),
            GenerationError::Decode(message) => Self::RemoteFailed(message),
            GenerationError::Cancelled => Self::Internal("generation cancelled".into()),
        }
    }
}

impl From<StorageError> for OrchestratorError {
    fn from(value: StorageError) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<PlanError> for OrchestratorError {
    fn from(value: PlanError) -> Self {
        match value {
            PlanError::Validation(message) => Self::Validation(message),
            PlanError::Storage(err) => err.into(),
        }
    }
}

/// A downloaded result, in planned order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub label: String,
    pub url: String,
    pub bytes: Vec<u8>,
}

/// Terminal result of one request. `Rejected` means no reservation was held;
/// `Refunded` means one was taken and given back. `RefundPending` means the
/// ledger could not be settled and the reservation is still held.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    Delivered {
        task_id: TaskId,
        kind: TaskKind,
        artifacts: Vec<Artifact>,
        charged: Credits,
        balance: Credits,
    },
    Refunded {
        task_id: Option<TaskId>,
        error: OrchestratorError,
        refunded: Credits,
    },
    RefundPending {
        task_id: Option<TaskId>,
        error: OrchestratorError,
    },
    Rejected {
        error: OrchestratorError,
    },
}

impl RequestOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Delivered { .. } => "delivered",
            Self::Refunded { .. } => "refunded",
            Self::RefundPending { .. } => "refund_pending",
            Self::Rejected { .. } => "rejected",
        }
    }
}

/// Drives generation requests through plan, reserve, dispatch and finalize.
pub struct Orchestrator<L, G: ?Sized> {
    ledger: Arc<L>,
    api: Arc<G>,
    translator: Arc<dyn Translator>,
    prices: PriceTable,
    models: ModelTable,
    poll: PollPolicy,
    fan_out: usize,
    settle_attempts: u32,
    settle_backoff: Duration,
}

impl<L, G> Orchestrator<L, G>
where
    L: Ledger,
    G: GenerationApi + ?Sized,
{
    pub const DEFAULT_FAN_OUT: usize = 3;
    pub const DEFAULT_SETTLE_ATTEMPTS: u32 = 3;
    pub const DEFAULT_SETTLE_BACKOFF: Duration = Duration::from_millis(200);

    pub fn new(ledger: Arc<L>, api: Arc<G>, poll: PollPolicy) -> Self {
        Self {
            ledger,
            api,
            translator: Arc::new(PassthroughTranslator),
            prices: PriceTable::default(),
            models: ModelTable::default(),
            poll,
            fan_out: Self::DEFAULT_FAN_OUT,
            settle_attempts: Self::DEFAULT_SETTLE_ATTEMPTS,
            settle_backoff: Self::DEFAULT_SETTLE_BACKOFF,
        }
    }

    pub fn with_translator(mut self, translator: Arc<dyn Translator>) -> Self {
        self.translator = translator;
        self
    }

    pub fn with_prices(mut self, prices: PriceTable) -> Self {
        self.prices = prices;
        self
    }

    pub fn with_models(mut self, models: ModelTable) -> Self {
        self.models = models;
        self
    }

    pub fn with_fan_out(mut self, fan_out: usize) -> Self {
        self.fan_out = fan_out.max(1);
        self
    }

    /// Bounds the retries of the ledger writes that settle a request.
    pub fn with_settle_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.settle_attempts = attempts.max(1);
        self.settle_backoff = backoff;
        self
    }

    pub fn ledger(&self) -> &Arc<L> {
        &self.ledger
    }

    pub fn prices(&self) -> &PriceTable {
        &self.prices
    }

    /// Runs one request to completion. Every failure is folded into the
    /// returned outcome after the ledger has been settled.
    pub async fn run(
        &self,
        user: UserId,
        request: GenerationRequest,
        cancel: &CancelToken,
    ) -> RequestOutcome {
        let kind = request.kind();
        let started = Instant::now();
        let outcome = self.execute(user, &request, cancel).await;
        counter!(
            "orchestrator_requests_total",
            "kind" => kind.as_ref().to_owned(),
            "outcome" => outcome.label()
        )
        .increment(1);
        histogram!("orchestrator_request_seconds", "kind" => kind.as_ref().to_owned())
            .record(started.elapsed().as_secs_f64());
        outcome
    }

    async fn execute(
        &self,
        user: UserId,
        request: &GenerationRequest,
        cancel: &CancelToken,
    ) -> RequestOutcome {
        let plan = match plan_request(
            self.ledger.as_ref(),
            self.translator.as_ref(),
            &self.prices,
            &self.models,
            request,
        )
        .await
        {
            Ok(plan) => plan,
            Err(err) => {
                return RequestOutcome::Rejected { error: err.into() };
            }
        };
        let cost = plan.total_cost();

        match self.ledger.reserve(user, cost).await {
            Ok(ReserveOutcome::Reserved { balance }) => {
                info!(user_id = %user, kind = %plan.kind, cost, balance, "credits reserved");
            }
            Ok(ReserveOutcome::Insufficient { balance }) => {
                return RequestOutcome::Rejected {
                    error: OrchestratorError::InsufficientFunds {
                        required: cost,
                        available: balance,
                    },
                };
            }
            Ok(ReserveOutcome::UnknownUser) => {
                return RequestOutcome::Rejected {
                    error: OrchestratorError::Validation("unknown user".into()),
                };
            }
            Err(err) => {
                error!(user_id = %user, %err, "reservation failed");
                return RequestOutcome::Rejected { error: err.into() };
            }
        }

        let task_id = match self
            .ledger
            .create_task(NewTask {
                user_id: user,
                kind: plan.kind,
                cost,
                input_params: plan.input_params.clone(),
            })
            .await
        {
            Ok(task_id) => task_id,
            Err(err) => {
                error!(user_id = %user, %err, "task creation failed, refunding reservation");
                let ledger = self.ledger.as_ref();
                return match self.settle("refund", move || ledger.refund(user, cost)).await {
                    Ok(_) => RequestOutcome::Refunded {
                        task_id: None,
                        error: err.into(),
                        refunded: cost,
                    },
                    Err(refund_err) => {
                        // No task row exists, so the startup sweep cannot return these.
                        error!(user_id = %user, cost, %refund_err, "refund failed, credits held");
                        RequestOutcome::RefundPending {
                            task_id: None,
                            error: err.into(),
                        }
                    }
                };
            }
        };

        let dispatched = match self.ledger.mark_processing(task_id).await {
            Ok(true) => {
                info!(
                    user_id = %user,
                    task_id = %task_id,
                    subjobs = plan.jobs.len(),
                    "task dispatched"
                );
                self.dispatch(&plan, cancel).await
            }
            Ok(false) => Err(OrchestratorError::Internal(
                "task left the pending state before dispatch".into(),
            )),
            Err(err) => Err(err.into()),
        };

        match dispatched {
            Ok(artifacts) => self.deliver(user, task_id, &plan, artifacts).await,
            Err(err) => self.fail(user, task_id, cost, err).await,
        }
    }

    async fn dispatch(
        &self,
        plan: &Plan,
        cancel: &CancelToken,
    ) -> Result<Vec<Artifact>, OrchestratorError> {
        let finished: Vec<(&SubJob, Vec<String>)> = if plan.is_chained() {
            let mut finished = Vec::with_capacity(plan.jobs.len());
            let mut previous: Option<String> = None;
            for job in &plan.jobs {
                let urls = self.run_job(job, previous.as_deref(), cancel).await?;
                previous = urls.first().cloned();
                finished.push((job, urls));
            }
            finished
        } else {
            stream::iter(plan.jobs.iter().map(|job| async move {
                let urls = self.run_job(job, None, cancel).await?;
                Ok::<_, OrchestratorError>((job, urls))
            }))
            .buffered(self.fan_out)
            .try_collect()
            .await?
        };

        let deliverables = finished
            .into_iter()
            .filter(|(job, _)| job.deliver)
            .flat_map(|(job, urls)| urls.into_iter().map(move |url| (job.label.clone(), url)));
        stream::iter(deliverables.map(|(label, url)| async move {
            let bytes = self
                .api
                .download(&url)
                .await
                .map_err(|err| OrchestratorError::Transport(err.to_string()))?;
            Ok::<_, OrchestratorError>(Artifact { label, url, bytes })
        }))
        .buffered(self.fan_out)
        .try_collect()
        .await
    }

    async fn run_job(
        &self,
        job: &SubJob,
        predecessor: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<Vec<String>, OrchestratorError> {
        let images = job.resolve_images(predecessor).ok_or_else(|| {
            OrchestratorError::Internal(format!("{} is missing its input image", job.label))
        })?;
        let payload = job.payload(&images);
        let remote_id = match self.api.create_task(&job.model, &payload).await {
            Ok(remote_id) => remote_id,
            Err(err) => {
                counter!("orchestrator_subjobs_total", "result" => "create_failed").increment(1);
                return Err(err.into());
            }
        };
        match await_result(self.api.as_ref(), &remote_id, self.poll, cancel).await {
            Ok(urls) => {
                counter!("orchestrator_subjobs_total", "result" => "ok").increment(1);
                Ok(urls)
            }
            Err(err) => {
                counter!("orchestrator_subjobs_total", "result" => "failed").increment(1);
                warn!(remote_task_id = %remote_id, label = %job.label, %err, "sub-job failed");
                Err(err.into())
            }
        }
    }

    async fn deliver(
        &self,
        user: UserId,
        task_id: TaskId,
        plan: &Plan,
        artifacts: Vec<Artifact>,
    ) -> RequestOutcome {
        let result_refs = json!(artifacts
            .iter()
            .map(|artifact| artifact.url.as_str())
            .collect::<Vec<_>>());
        let charged = plan.total_cost();
        let ledger = self.ledger.as_ref();
        let completed = self
            .settle("complete", move || {
                ledger.finalize_task(
                    task_id,
                    TaskResolution::Completed {
                        result_refs: result_refs.clone(),
                    },
                )
            })
            .await;
        match completed {
            Ok(FinalizeOutcome::Finalized { .. }) => {}
            Ok(other) => {
                // Recovery already failed and refunded this task.
                warn!(task_id = %task_id, ?other, "task finalized elsewhere, results discarded");
                return RequestOutcome::Refunded {
                    task_id: Some(task_id),
                    error: OrchestratorError::Internal("task expired before completion".into()),
                    refunded: charged,
                };
            }
            Err(err) => {
                error!(task_id = %task_id, %err, "completing task failed");
                return self.fail(user, task_id, charged, err.into()).await;
            }
        }

        let balance = match self.ledger.find_user(user).await {
            Ok(Some(record)) => record.balance,
            Ok(None) => 0,
            Err(err) => {
                warn!(user_id = %user, %err, "balance lookup after delivery failed");
                0
            }
        };
        info!(
            user_id = %user,
            task_id = %task_id,
            artifacts = artifacts.len(),
            charged,
            "task completed"
        );
        RequestOutcome::Delivered {
            task_id,
            kind: plan.kind,
            artifacts,
            charged,
            balance,
        }
    }

    async fn fail(
        &self,
        user: UserId,
        task_id: TaskId,
        cost: Credits,
        err: OrchestratorError,
    ) -> RequestOutcome {
        let error_text = err.to_string();
        let ledger = self.ledger.as_ref();
        let finalized = self
            .settle("fail", move || {
                ledger.finalize_task(
                    task_id,
                    TaskResolution::Failed {
                        error: error_text.clone(),
                    },
                )
            })
            .await;
        let refunded = match finalized {
            Ok(FinalizeOutcome::Finalized { refunded }) => refunded,
            Ok(other) => {
                // Settled by the startup sweep, which refunds on failure.
                warn!(task_id = %task_id, ?other, "task already settled");
                cost
            }
            Err(storage_err) => {
                // The task stays open; the startup sweep refunds it later.
                error!(task_id = %task_id, %storage_err, "failing task failed, credits held");
                return RequestOutcome::RefundPending {
                    task_id: Some(task_id),
                    error: err,
                };
            }
        };
        info!(
            user_id = %user,
            task_id = %task_id,
            refunded,
            cause = err.label(),
            "task failed"
        );
        RequestOutcome::Refunded {
            task_id: Some(task_id),
            error: err,
            refunded,
        }
    }

    /// Retries a ledger write with linear backoff.
    async fn settle<T, F, Fut>(&self, step: &'static str, mut write: F) -> StorageResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match write().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.settle_attempts => {
                    counter!("orchestrator_settle_retries_total", "step" => step).increment(1);
                    warn!(step, attempt, %err, "ledger write failed, retrying");
                    sleep(self.settle_backoff * attempt).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
