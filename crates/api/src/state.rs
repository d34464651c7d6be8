use std::sync::Arc;
use std::time::Duration;

use cardsmith_domain::model::{PaymentPackage, UserId};
use cardsmith_domain::services::{ConversationStore, GenerationRun, Notifier, TelemetryGuard};
use cardsmith_orchestrator::{CancelToken, GenerationApi, Orchestrator};
use cardsmith_reconciler::{PaymentProvider, TopUpService};
use cardsmith_storage::SeaOrmStorage;
use moka::ops::compute::Op;
use moka::sync::Cache;

use crate::media::MediaStore;

pub type GatewayOrchestrator = Orchestrator<SeaOrmStorage, dyn GenerationApi>;
pub type GatewayTopUps = TopUpService<SeaOrmStorage, dyn PaymentProvider, dyn Notifier>;

#[derive(Clone)]
pub struct AppState {
    storage: SeaOrmStorage,
    orchestrator: Arc<GatewayOrchestrator>,
    top_ups: Arc<GatewayTopUps>,
    notifier: Arc<dyn Notifier>,
    conversations: ConversationStore,
    media: MediaStore,
    in_flight: Cache<UserId, (GenerationRun, CancelToken)>,
    packages: Arc<[PaymentPackage]>,
    admins: Arc<[UserId]>,
    telemetry: TelemetryGuard,
}

pub struct AppStateParts {
    pub storage: SeaOrmStorage,
    pub orchestrator: Arc<GatewayOrchestrator>,
    pub top_ups: Arc<GatewayTopUps>,
    pub notifier: Arc<dyn Notifier>,
    pub conversations: ConversationStore,
    pub media: MediaStore,
    pub packages: Vec<PaymentPackage>,
    pub admins: Vec<UserId>,
    pub telemetry: TelemetryGuard,
}

impl AppState {
    /// Bounds how long a cancel handle outlives a wedged orchestration.
    const IN_FLIGHT_TTL: Duration = Duration::from_secs(6 * 3_600);

    pub fn new(parts: AppStateParts) -> Self {
        Self {
            storage: parts.storage,
            orchestrator: parts.orchestrator,
            top_ups: parts.top_ups,
            notifier: parts.notifier,
            conversations: parts.conversations,
            media: parts.media,
            in_flight: Cache::builder().time_to_live(Self::IN_FLIGHT_TTL).build(),
            packages: parts.packages.into(),
            admins: parts.admins.into(),
            telemetry: parts.telemetry,
        }
    }

    pub fn storage(&self) -> &SeaOrmStorage {
        &self.storage
    }

    pub fn orchestrator(&self) -> &Arc<GatewayOrchestrator> {
        &self.orchestrator
    }

    pub fn top_ups(&self) -> &GatewayTopUps {
        self.top_ups.as_ref()
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    pub fn conversations(&self) -> &ConversationStore {
        &self.conversations
    }

    pub fn media(&self) -> &MediaStore {
        &self.media
    }

    /// Registers a fresh cancel handle for the user's running request.
    pub fn track_request(&self, user: UserId, run: GenerationRun) -> CancelToken {
        let token = CancelToken::new();
        self.in_flight.insert(user, (run, token.clone()));
        token
    }

    /// Drops the cancel handle if it still belongs to `run`.
    pub fn untrack_request(&self, user: UserId, run: GenerationRun) {
        self.in_flight.entry(user).and_compute_with(|current| match current {
            Some(entry) if entry.value().0 == run => Op::Remove,
            _ => Op::Nop,
        });
    }

    /// Returns `true` when a running request was signalled.
    pub fn cancel_request(&self, user: UserId) -> bool {
        match self.in_flight.remove(&user) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn packages(&self) -> &[PaymentPackage] {
        &self.packages
    }

    pub fn is_admin(&self, user: UserId) -> bool {
        self.admins.contains(&user)
    }

    pub fn telemetry(&self) -> &TelemetryGuard {
        &self.telemetry
    }
}
