use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use actix_web::{body::to_bytes, http::StatusCode, test, web, App};
use async_trait::async_trait;
use cardsmith_domain::model::{
    CatalogKind, NewCatalogEntry, NewTask, PaymentId, PaymentPackage, TaskKind, UserId,
    UserProfile,
};
use cardsmith_domain::services::{
    init_telemetry, ConversationStore, Notification, Notifier, NotifyError, RefundState,
    TelemetryConfig,
};
use cardsmith_domain::storage::{BalanceStore, CatalogStore, TaskStore, UserStore};
use cardsmith_orchestrator::{
    GenerationApi, GenerationError, Orchestrator, PollPolicy, RemoteState, TaskSnapshot,
};
use cardsmith_reconciler::{
    CreatedPayment, PaymentProvider, PaymentRequest, PaymentSnapshot, ProviderError,
    ProviderStatus, TopUpService, WatchPolicy,
};
use cardsmith_storage::SeaOrmStorage;
use serde_json::{json, Value};
use tokio::time::sleep;

use crate::application::recover_interrupted;
use crate::handlers::{
    admin::{GrantResponse, OPERATOR_HEADER},
    admin_routes,
    conversation::{CancelResponse, SelectionResponse, StartResponse},
    media::UploadResponse,
    payments::{CreatePaymentResponse, PackageView},
    public_routes,
    users::{BalanceResponse, UserView},
};
use crate::media::MediaStore;
use crate::state::{AppState, AppStateParts};

const ADMIN: i64 = 1;
const BASE_URL: &str = "https://bot.example";

/// Generation API double: every job succeeds with one image once `open` is
/// set; until then jobs stay in `processing`.
struct MockApi {
    created: AtomicUsize,
    open: AtomicBool,
}

impl MockApi {
    fn new(open: bool) -> Arc<Self> {
        Arc::new(Self {
            created: AtomicUsize::new(0),
            open: AtomicBool::new(open),
        })
    }

    fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationApi for MockApi {
    async fn create_task(&self, _model: &str, _input: &Value) -> Result<String, GenerationError> {
        Ok(self.created.fetch_add(1, Ordering::SeqCst).to_string())
    }

    async fn query_task(&self, task_id: &str) -> Result<TaskSnapshot, GenerationError> {
        if !self.open.load(Ordering::SeqCst) {
            return Ok(TaskSnapshot {
                state: RemoteState::Processing,
                result_urls: Vec::new(),
                fail_message: None,
            });
        }
        Ok(TaskSnapshot {
            state: RemoteState::Success,
            result_urls: vec![format!("https://cdn.example/{task_id}.png")],
            fail_message: None,
        })
    }

    async fn download(&self, _url: &str) -> Result<Vec<u8>, GenerationError> {
        Ok(b"artifact".to_vec())
    }
}

struct StubProvider;

#[async_trait]
impl PaymentProvider for StubProvider {
    async fn create_payment(
        &self,
        _request: &PaymentRequest,
    ) -> Result<CreatedPayment, ProviderError> {
        Ok(CreatedPayment {
            payment_id: PaymentId::new("pay-1"),
            confirmation_url: "https://pay.example/checkout/pay-1".into(),
        })
    }

    async fn query_payment(
        &self,
        _payment_id: &PaymentId,
    ) -> Result<PaymentSnapshot, ProviderError> {
        Ok(PaymentSnapshot {
            status: ProviderStatus::Pending,
            paid: false,
            metadata: Default::default(),
        })
    }

    async fn cancel_payment(&self, _payment_id: &PaymentId) -> Result<bool, ProviderError> {
        Ok(true)
    }
}

#[derive(Default)]
struct Recorder(Mutex<Vec<Notification>>);

impl Recorder {
    fn events(&self) -> Vec<Notification> {
        self.0.lock().unwrap().clone()
    }

    async fn wait_for(&self, count: usize) -> Vec<Notification> {
        for _ in 0..500 {
            let events = self.events();
            if events.len() >= count {
                return events;
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {count} notifications, got {:?}", self.events());
    }
}

#[async_trait]
impl Notifier for Recorder {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        self.0.lock().unwrap().push(notification);
        Ok(())
    }
}

async fn build_state(api: Arc<MockApi>) -> (AppState, Arc<Recorder>) {
    let storage = SeaOrmStorage::connect("sqlite::memory:")
        .await
        .expect("storage inits");
    let ledger = Arc::new(storage.clone());
    let recorder = Arc::new(Recorder::default());
    let notifier: Arc<dyn Notifier> = recorder.clone();
    let api: Arc<dyn GenerationApi> = api;
    let orchestrator = Orchestrator::new(
        Arc::clone(&ledger),
        api,
        PollPolicy::new(Duration::from_millis(2), 1_000),
    );
    let provider: Arc<dyn PaymentProvider> = Arc::new(StubProvider);
    let top_ups = TopUpService::new(
        ledger,
        provider,
        Arc::clone(&notifier),
        WatchPolicy::new(Duration::from_millis(5), Duration::ZERO),
        "RUB",
    );
    let telemetry = init_telemetry(&TelemetryConfig::from_env("API_TEST")).expect("telemetry inits");

    let state = AppState::new(AppStateParts {
        storage,
        orchestrator: Arc::new(orchestrator),
        top_ups: Arc::new(top_ups),
        notifier,
        conversations: ConversationStore::default(),
        media: MediaStore::new(BASE_URL, Duration::from_secs(60)),
        packages: vec![PaymentPackage {
            amount_minor: 29_900,
            credits: 30,
        }],
        admins: vec![UserId::new(ADMIN)],
        telemetry,
    });
    (state, recorder)
}

macro_rules! init_app {
    ($state:expr) => {
        test::init_service(
            App::new()
                .app_data(web::Data::new($state.clone()))
                .configure(public_routes)
                .configure(admin_routes),
        )
        .await
    };
}

async fn register(state: &AppState, platform_id: i64, username: &str) {
    state
        .storage()
        .get_or_create_user(UserProfile {
            platform_id: UserId::new(platform_id),
            username: Some(username.into()),
            full_name: None,
            is_admin: platform_id == ADMIN,
        })
        .await
        .unwrap();
}

async fn balance(state: &AppState, platform_id: i64) -> i64 {
    state
        .storage()
        .find_user(UserId::new(platform_id))
        .await
        .unwrap()
        .unwrap()
        .balance
}

fn photo_custom(user_id: i64) -> Value {
    json!({
        "user_id": user_id,
        "request": {
            "variant": "photo_custom",
            "image": "https://bot.example/media/source",
            "prompt": "on a marble table"
        }
    })
}

#[actix_web::test]
async fn registers_users_and_reports_balance() {
    let (state, _) = build_state(MockApi::new(true)).await;
    let app = init_app!(state);

    let req = test::TestRequest::post()
        .uri("/api/v1/users")
        .set_json(json!({"platform_id": 42, "username": "alice", "full_name": "Alice"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = to_bytes(resp.into_body()).await.unwrap();
    let user: UserView = serde_json::from_slice(&body).unwrap();
    assert_eq!(user.platform_id, 42);
    assert_eq!(user.balance, 0);
    assert!(!user.is_admin);

    let req = test::TestRequest::get()
        .uri("/api/v1/users/42/balance")
        .to_request();
    let parsed: BalanceResponse = test::call_and_read_body_json(&app, req).await;
    assert_eq!(parsed.balance, 0);

    let req = test::TestRequest::get()
        .uri("/api/v1/users/7/balance")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[actix_web::test]
async fn operator_routes_require_an_admin_header() {
    let (state, recorder) = build_state(MockApi::new(true)).await;
    register(&state, 42, "alice").await;
    let app = init_app!(state);

    let req = test::TestRequest::post()
        .uri("/api/v1/admin/users/42/grant")
        .set_json(json!({"credits": 5}))
        .to_request();
    assert_eq!(
        test::call_service(&app, req).await.status(),
        StatusCode::UNAUTHORIZED
    );

    let req = test::TestRequest::post()
        .uri("/api/v1/admin/users/42/grant")
        .insert_header((OPERATOR_HEADER, "42"))
        .set_json(json!({"credits": 5}))
        .to_request();
    assert_eq!(
        test::call_service(&app, req).await.status(),
        StatusCode::UNAUTHORIZED
    );

    let req = test::TestRequest::post()
        .uri("/api/v1/admin/users/@Alice/grant")
        .insert_header((OPERATOR_HEADER, ADMIN.to_string()))
        .set_json(json!({"credits": 5}))
        .to_request();
    let granted: GrantResponse = test::call_and_read_body_json(&app, req).await;
    assert_eq!(granted.platform_id, 42);
    assert_eq!(granted.balance, 5);
    assert!(matches!(
        recorder.events().as_slice(),
        [Notification::CreditsGranted { credits: 5, .. }]
    ));

    let req = test::TestRequest::get()
        .uri("/api/v1/admin/stats")
        .insert_header((OPERATOR_HEADER, ADMIN.to_string()))
        .to_request();
    let stats: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(stats["users"], 1);
    assert_eq!(stats["outstanding_credits"], 5);
}

#[actix_web::test]
async fn banned_users_never_reach_the_orchestrator() {
    let api = MockApi::new(true);
    let (state, _) = build_state(api.clone()).await;
    register(&state, 42, "alice").await;
    state.storage().credit(UserId::new(42), 3).await.unwrap();
    let app = init_app!(state);

    let req = test::TestRequest::post()
        .uri("/api/v1/admin/users/42/ban")
        .insert_header((OPERATOR_HEADER, ADMIN.to_string()))
        .to_request();
    let user: UserView = test::call_and_read_body_json(&app, req).await;
    assert!(user.is_banned);

    let req = test::TestRequest::post()
        .uri("/api/v1/generate")
        .set_json(photo_custom(42))
        .to_request();
    assert_eq!(
        test::call_service(&app, req).await.status(),
        StatusCode::FORBIDDEN
    );
    assert_eq!(api.created(), 0);
    assert_eq!(balance(&state, 42).await, 3);

    let req = test::TestRequest::post()
        .uri("/api/v1/admin/users/42/unban")
        .insert_header((OPERATOR_HEADER, ADMIN.to_string()))
        .to_request();
    let user: UserView = test::call_and_read_body_json(&app, req).await;
    assert!(!user.is_banned);
}

#[actix_web::test]
async fn generation_delivers_through_the_media_cache() {
    let (state, recorder) = build_state(MockApi::new(true)).await;
    register(&state, 42, "alice").await;
    state.storage().credit(UserId::new(42), 3).await.unwrap();
    let app = init_app!(state);

    let req = test::TestRequest::post()
        .uri("/api/v1/generate")
        .set_json(photo_custom(42))
        .to_request();
    assert_eq!(
        test::call_service(&app, req).await.status(),
        StatusCode::ACCEPTED
    );

    let events = recorder.wait_for(1).await;
    let Notification::GenerationDelivered {
        kind,
        media_urls,
        charged,
        balance: reported,
        ..
    } = &events[0]
    else {
        panic!("unexpected notification {:?}", events[0]);
    };
    assert_eq!(*kind, TaskKind::PhotoCustom);
    assert_eq!(*charged, 1);
    assert_eq!(*reported, 2);
    assert_eq!(media_urls.len(), 1);
    assert_eq!(balance(&state, 42).await, 2);

    let path = media_urls[0].strip_prefix(BASE_URL).unwrap().to_string();
    let req = test::TestRequest::get().uri(&path).to_request();
    let body = test::call_and_read_body(&app, req).await;
    assert_eq!(body.as_ref(), b"artifact");
}

#[actix_web::test]
async fn insufficient_funds_is_reported_without_remote_calls() {
    let api = MockApi::new(true);
    let (state, recorder) = build_state(api.clone()).await;
    register(&state, 42, "alice").await;
    let app = init_app!(state);

    let req = test::TestRequest::post()
        .uri("/api/v1/generate")
        .set_json(photo_custom(42))
        .to_request();
    assert_eq!(
        test::call_service(&app, req).await.status(),
        StatusCode::ACCEPTED
    );

    let events = recorder.wait_for(1).await;
    assert!(matches!(
        events.as_slice(),
        [Notification::InsufficientFunds {
            required: 1,
            available: 0,
            ..
        }]
    ));
    assert_eq!(api.created(), 0);
}

#[actix_web::test]
async fn second_request_is_refused_and_cancel_refunds() {
    let api = MockApi::new(false);
    let (state, recorder) = build_state(api.clone()).await;
    register(&state, 42, "alice").await;
    state.storage().credit(UserId::new(42), 2).await.unwrap();
    let app = init_app!(state);

    let req = test::TestRequest::post()
        .uri("/api/v1/generate")
        .set_json(photo_custom(42))
        .to_request();
    assert_eq!(
        test::call_service(&app, req).await.status(),
        StatusCode::ACCEPTED
    );

    let req = test::TestRequest::post()
        .uri("/api/v1/generate")
        .set_json(photo_custom(42))
        .to_request();
    assert_eq!(
        test::call_service(&app, req).await.status(),
        StatusCode::CONFLICT
    );

    for _ in 0..200 {
        if api.created() == 1 {
            break;
        }
        sleep(Duration::from_millis(5)).await;
    }
    let req = test::TestRequest::delete()
        .uri("/api/v1/conversations/42")
        .to_request();
    let cancelled: CancelResponse = test::call_and_read_body_json(&app, req).await;
    assert!(cancelled.generation_cancelled);

    let events = recorder.wait_for(1).await;
    assert!(matches!(
        events.as_slice(),
        [Notification::GenerationFailed {
            refund: RefundState::Returned,
            ..
        }]
    ));
    assert_eq!(balance(&state, 42).await, 2);
    assert!(state.conversations().get(UserId::new(42)).is_none());
}

#[actix_web::test]
async fn cancel_right_after_acceptance_reaches_the_run() {
    let api = MockApi::new(false);
    let (state, recorder) = build_state(api.clone()).await;
    register(&state, 42, "alice").await;
    state.storage().credit(UserId::new(42), 2).await.unwrap();
    let app = init_app!(state);

    let req = test::TestRequest::post()
        .uri("/api/v1/generate")
        .set_json(photo_custom(42))
        .to_request();
    assert_eq!(
        test::call_service(&app, req).await.status(),
        StatusCode::ACCEPTED
    );
    let req = test::TestRequest::delete()
        .uri("/api/v1/conversations/42")
        .to_request();
    let cancelled: CancelResponse = test::call_and_read_body_json(&app, req).await;
    assert!(cancelled.generation_cancelled);

    let events = recorder.wait_for(1).await;
    assert!(matches!(
        events.as_slice(),
        [Notification::GenerationFailed {
            refund: RefundState::Returned,
            ..
        }]
    ));
    assert_eq!(balance(&state, 42).await, 2);
    assert!(state.conversations().get(UserId::new(42)).is_none());
}

#[actix_web::test]
async fn scene_selection_flow_dispatches_selected_elements() {
    let (state, recorder) = build_state(MockApi::new(true)).await;
    register(&state, 42, "alice").await;
    state.storage().credit(UserId::new(42), 5).await.unwrap();
    let beach = state
        .storage()
        .insert_catalog_entry(NewCatalogEntry::active(
            CatalogKind::PhotoScene,
            "Beach",
            "on a sunny beach",
        ))
        .await
        .unwrap();
    state
        .storage()
        .insert_catalog_entry(NewCatalogEntry::active(
            CatalogKind::PhotoScene,
            "Studio",
            "in a white studio",
        ))
        .await
        .unwrap();
    let pose = state
        .storage()
        .insert_catalog_entry(NewCatalogEntry::active(CatalogKind::Pose, "Sitting", "sitting"))
        .await
        .unwrap();
    let app = init_app!(state);

    let req = test::TestRequest::post()
        .uri("/api/v1/conversations/42/start")
        .set_json(json!({"flow": "scene", "image": "https://bot.example/media/source"}))
        .to_request();
    let started: StartResponse = test::call_and_read_body_json(&app, req).await;
    assert_eq!(started.elements.len(), 2);

    let req = test::TestRequest::post()
        .uri("/api/v1/conversations/42/toggle")
        .set_json(json!({"element_id": pose.id}))
        .to_request();
    assert_eq!(
        test::call_service(&app, req).await.status(),
        StatusCode::NOT_FOUND
    );

    let req = test::TestRequest::post()
        .uri("/api/v1/conversations/42/toggle")
        .set_json(json!({"element_id": beach.id}))
        .to_request();
    let selection: SelectionResponse = test::call_and_read_body_json(&app, req).await;
    assert_eq!(selection.selected, vec![beach.id]);

    let req = test::TestRequest::post()
        .uri("/api/v1/conversations/42/confirm")
        .to_request();
    assert_eq!(
        test::call_service(&app, req).await.status(),
        StatusCode::ACCEPTED
    );

    let events = recorder.wait_for(1).await;
    assert!(matches!(
        events.as_slice(),
        [Notification::GenerationDelivered {
            kind: TaskKind::PhotoScene,
            charged: 1,
            ..
        }]
    ));
    assert_eq!(balance(&state, 42).await, 4);

    let req = test::TestRequest::post()
        .uri("/api/v1/conversations/42/confirm")
        .to_request();
    assert_eq!(
        test::call_service(&app, req).await.status(),
        StatusCode::BAD_REQUEST
    );
}

#[actix_web::test]
async fn uploads_are_served_back_by_key() {
    let (state, _) = build_state(MockApi::new(true)).await;
    let app = init_app!(state);

    let req = test::TestRequest::post()
        .uri("/api/v1/media")
        .insert_header(("content-type", "image/png"))
        .set_payload(&b"\x89PNG-bytes"[..])
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let body = to_bytes(resp.into_body()).await.unwrap();
    let uploaded: UploadResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(uploaded.url, format!("{BASE_URL}/media/{}", uploaded.key));

    let req = test::TestRequest::get()
        .uri(&format!("/media/{}", uploaded.key))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get("content-type").unwrap().to_str().unwrap(),
        "image/png"
    );

    let req = test::TestRequest::post()
        .uri("/api/v1/media")
        .insert_header(("content-type", "text/plain"))
        .set_payload("hello")
        .to_request();
    assert_eq!(
        test::call_service(&app, req).await.status(),
        StatusCode::BAD_REQUEST
    );
}

#[actix_web::test]
async fn payments_use_configured_packages() {
    let (state, _) = build_state(MockApi::new(true)).await;
    register(&state, 42, "alice").await;
    let app = init_app!(state);

    let req = test::TestRequest::get()
        .uri("/api/v1/payments/packages")
        .to_request();
    let packages: Vec<PackageView> = test::call_and_read_body_json(&app, req).await;
    assert_eq!(packages.len(), 1);
    assert_eq!(packages[0].amount, "299.00");
    assert_eq!(packages[0].credits, 30);

    let req = test::TestRequest::post()
        .uri("/api/v1/payments")
        .set_json(json!({"user_id": 42, "package": 0}))
        .to_request();
    let created: CreatePaymentResponse = test::call_and_read_body_json(&app, req).await;
    assert_eq!(created.payment_id, "pay-1");
    assert_eq!(created.pay_url, "https://pay.example/checkout/pay-1");

    let req = test::TestRequest::post()
        .uri("/api/v1/payments")
        .set_json(json!({"user_id": 42, "package": 3}))
        .to_request();
    assert_eq!(
        test::call_service(&app, req).await.status(),
        StatusCode::BAD_REQUEST
    );
}

#[actix_web::test]
async fn startup_recovery_refunds_and_notifies() {
    let (state, recorder) = build_state(MockApi::new(true)).await;
    register(&state, 42, "alice").await;
    let storage = state.storage().clone();
    storage.credit(UserId::new(42), 4).await.unwrap();
    storage.reserve(UserId::new(42), 2).await.unwrap();
    let task_id = storage
        .create_task(NewTask {
            user_id: UserId::new(42),
            kind: TaskKind::PhotoCustom,
            cost: 2,
            input_params: json!({}),
        })
        .await
        .unwrap();
    storage.mark_processing(task_id).await.unwrap();
    sleep(Duration::from_millis(5)).await;

    let recovered = recover_interrupted(&storage, recorder.as_ref(), Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(recovered, 1);
    assert_eq!(balance(&state, 42).await, 4);
    assert!(matches!(
        recorder.events().as_slice(),
        [Notification::GenerationFailed {
            refund: RefundState::Returned,
            task_id: Some(id),
            ..
        }] if *id == task_id
    ));

    let again = recover_interrupted(&storage, recorder.as_ref(), Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(again, 0);
    assert_eq!(balance(&state, 42).await, 4);
}
