use std::{path::Path, sync::Arc, time::Duration};

#[cfg(unix)]
use std::fs;

use actix_web::{middleware::Logger, web, App, HttpServer};
use cardsmith_domain::config::{
    load_price_table, ConfigError, GatewayConfig, GenerationConfig, PaymentConfig,
};
use cardsmith_domain::services::{
    init_telemetry, ConversationStore, Notification, Notifier, NotifyError, RefundState,
    TelemetryConfig, TelemetryError,
};
use cardsmith_domain::storage::StorageError;
use cardsmith_orchestrator::{
    cleanup_expired_tasks, recover_stale_tasks, recovery::INTERRUPTED_ERROR, GenerationApi,
    GenerationError, HttpGenerationClient, HttpTranslator, Orchestrator, PassthroughTranslator,
    PollPolicy, TranslateError, Translator,
};
use cardsmith_reconciler::{
    HttpPaymentProvider, PaymentProvider, ProviderError, ReconcileError, TopUpService, WatchPolicy,
};
use cardsmith_storage::SeaOrmStorage;
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    handlers::{admin_routes, media::MAX_UPLOAD_BYTES, metrics_handler, public_routes},
    media::MediaStore,
    messages::MessageCatalog,
    notifier::ChatNotifier,
    state::{AppState, AppStateParts},
};

const CLEANUP_INTERVAL: Duration = Duration::from_secs(3_600);

pub async fn run() -> Result<(), BootstrapError> {
    let config = GatewayConfig::load_from_env()?;
    let generation = GenerationConfig::load_from_env()?;
    let payment = PaymentConfig::load_from_env()?;
    let prices = load_price_table()?;

    let telemetry_config = TelemetryConfig::from_env("API");
    let telemetry = init_telemetry(&telemetry_config)?;

    let storage = SeaOrmStorage::connect(config.database_url()).await?;
    let ledger = Arc::new(storage.clone());

    let notifier: Arc<dyn Notifier> = Arc::new(ChatNotifier::new(
        config.chat_api_base_url(),
        config.bot_token(),
        MessageCatalog::default(),
    )?);

    let api: Arc<dyn GenerationApi> = Arc::new(HttpGenerationClient::from_config(&generation)?);
    let translator: Arc<dyn Translator> = match generation.translate_url() {
        Some(url) => Arc::new(HttpTranslator::new(url)?),
        None => Arc::new(PassthroughTranslator),
    };
    let orchestrator = Orchestrator::new(
        Arc::clone(&ledger),
        api,
        PollPolicy::from_config(&generation),
    )
    .with_translator(translator)
    .with_prices(prices)
    .with_models(generation.models().clone())
    .with_fan_out(generation.fan_out());

    let provider: Arc<dyn PaymentProvider> = Arc::new(HttpPaymentProvider::from_config(&payment)?);
    let top_ups = TopUpService::new(
        Arc::clone(&ledger),
        provider,
        Arc::clone(&notifier),
        WatchPolicy::from_config(&payment),
        payment.currency(),
    );

    // Startup order: settle interrupted work before accepting new requests.
    recover_interrupted(&storage, notifier.as_ref(), config.orchestration_window()).await?;
    let resumed = top_ups.resume_pending().await?;
    info!(watchers = resumed.len(), "payment watchers resumed");
    spawn_cleanup(storage.clone(), config.task_retention());

    let state = AppState::new(AppStateParts {
        storage,
        orchestrator: Arc::new(orchestrator),
        top_ups: Arc::new(top_ups),
        notifier,
        conversations: ConversationStore::default(),
        media: MediaStore::new(config.public_base_url(), config.media_ttl()),
        packages: payment.packages().to_vec(),
        admins: config.admin_ids().to_vec(),
        telemetry,
    });

    // Operator routes and metrics move to the internal listener when one is
    // configured.
    let operator_on_public = !config.has_internal_listener();
    if operator_on_public {
        warn!("no internal listener configured; operator routes are served publicly");
    }

    let public_state = state.clone();
    let mut public_server = HttpServer::new(move || {
        let mut app = App::new()
            .app_data(web::Data::new(public_state.clone()))
            .app_data(web::PayloadConfig::new(MAX_UPLOAD_BYTES))
            .wrap(Logger::default())
            .configure(public_routes);

        if operator_on_public {
            app = app
                .configure(admin_routes)
                .route("/metrics", web::get().to(metrics_handler));
        }

        app
    });

    #[cfg(unix)]
    {
        if let Some(socket) = config.api_unix_socket() {
            cleanup_socket(socket)?;
            public_server = public_server.bind_uds(socket)?;
        } else {
            public_server = public_server.bind(config.api_bind_address())?;
        }
    }

    #[cfg(not(unix))]
    {
        if let Some(socket) = config.api_unix_socket() {
            return Err(BootstrapError::Io(std::io::Error::other(format!(
                "unix socket '{socket}' requested but this platform does not support it"
            ))));
        }
        public_server = public_server.bind(config.api_bind_address())?;
    }

    let public_server = public_server.run();

    let internal_server = if config.has_internal_listener() {
        let internal_state = state.clone();
        let mut internal_server = HttpServer::new(move || {
            App::new()
                .app_data(web::Data::new(internal_state.clone()))
                .wrap(Logger::default())
                .route("/metrics", web::get().to(metrics_handler))
                .configure(admin_routes)
        });

        #[cfg(unix)]
        {
            if let Some(socket) = config.internal_unix_socket() {
                cleanup_socket(socket)?;
                internal_server = internal_server.bind_uds(socket)?;
            } else if let Some(addr) = config.internal_bind_address() {
                internal_server = internal_server.bind(addr)?;
            } else {
                return Err(BootstrapError::Io(std::io::Error::other(
                    "internal listener configured but no bind target provided",
                )));
            }
        }

        #[cfg(not(unix))]
        {
            if let Some(socket) = config.internal_unix_socket() {
                return Err(BootstrapError::Io(std::io::Error::other(format!(
                    "internal unix socket '{socket}' requested but this platform does not support it"
                ))));
            }
            if let Some(addr) = config.internal_bind_address() {
                internal_server = internal_server.bind(addr)?;
            } else {
                return Err(BootstrapError::Io(std::io::Error::other(
                    "internal listener configured but no bind target provided",
                )));
            }
        }

        Some(internal_server.run())
    } else {
        None
    };

    if let Some(internal) = internal_server {
        tokio::try_join!(public_server, internal)?;
    } else {
        public_server.await?;
    }

    Ok(())
}

/// Fails tasks orphaned by the previous process and tells their owners.
pub(crate) async fn recover_interrupted<N>(
    storage: &SeaOrmStorage,
    notifier: &N,
    window: Duration,
) -> Result<usize, StorageError>
where
    N: Notifier + ?Sized,
{
    let recovered = recover_stale_tasks(storage, window).await?;
    for entry in &recovered {
        let notification = Notification::GenerationFailed {
            user_id: entry.task.user_id,
            task_id: Some(entry.task.id),
            cause: INTERRUPTED_ERROR.to_string(),
            refund: if entry.refunded > 0 {
                RefundState::Returned
            } else {
                RefundState::NotCharged
            },
        };
        if let Err(err) = notifier.notify(notification).await {
            warn!(task_id = %entry.task.id, ?err, "failed to report recovered task");
        }
    }
    Ok(recovered.len())
}

fn spawn_cleanup(storage: SeaOrmStorage, retention: Duration) {
    actix_web::rt::spawn(async move {
        let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(err) = cleanup_expired_tasks(&storage, retention).await {
                warn!(?err, "task cleanup failed");
            }
        }
    });
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("generation client error: {0}")]
    Generation(#[from] GenerationError),
    #[error("translator error: {0}")]
    Translate(#[from] TranslateError),
    #[error("payment client error: {0}")]
    Payment(#[from] ProviderError),
    #[error("notifier error: {0}")]
    Notify(#[from] NotifyError),
    #[error("payment recovery error: {0}")]
    Reconcile(#[from] ReconcileError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(unix)]
fn cleanup_socket(path: &str) -> std::io::Result<()> {
    let socket_path = Path::new(path);
    if socket_path.exists() {
        fs::remove_file(socket_path)?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn cleanup_socket(_path: &str) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    #[cfg(unix)]
    #[actix_web::test]
    async fn cleanup_socket_removes_stale_file() {
        use super::cleanup_socket;

        let path = std::env::temp_dir().join(format!(
            "cardsmith-test-{}-{}.sock",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::SystemTime::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        std::fs::write(&path, b"stub").expect("write socket file");
        cleanup_socket(path.to_str().unwrap()).expect("cleanup succeeds");
        assert!(!path.exists());
    }
}
