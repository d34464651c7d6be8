//! Generation-job orchestration: the remote generation client, request
//! planning, the reserve/dispatch/finalize pipeline and startup recovery.

pub mod pipeline;
pub mod plan;
pub mod poll;
pub mod recovery;
pub mod remote;
pub mod translate;


pub use pipeline::{Artifact, Orchestrator, OrchestratorError, RequestOutcome};
pub use plan::{plan_request, JobImage, PayloadShape, Plan, PlanError, SubJob};
pub use poll::{await_result, CancelToken, PollPolicy};
pub use recovery::{cleanup_expired_tasks, recover_stale_tasks, RecoveredTask};
pub use remote::{GenerationApi, GenerationError, HttpGenerationClient, RemoteState, TaskSnapshot};
pub use translate::{prepare_prompt, HttpTranslator, PassthroughTranslator, TranslateError, Translator};
