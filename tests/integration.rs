use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::TimeDelta;
use ride_dispatch::api::rest::router;
use ride_dispatch::backend::{DispatchApi, HistoryPage, HistoryQuery, SyncRequest};
use ride_dispatch::clock::ManualClock;
use ride_dispatch::engine::machine::Event;
use ride_dispatch::engine::sync::{SyncDecision, SyncTrigger};
use ride_dispatch::error::AppError;
use ride_dispatch::models::snapshot::ServerDriverState;
use ride_dispatch::observability::metrics::Metrics;
use ride_dispatch::runtime::{run_driver_runtime, RuntimeChannels, RuntimeSettings};
use ride_dispatch::session::{DriverSession, SessionDeps, SessionSettings};
use ride_dispatch::state::AppState;
use ride_dispatch::store::memory::MemoryStore;
use ride_dispatch::transport::events::{InboundEvent, OutboundEvent};
use ride_dispatch::transport::{ConnectionState, EventSink};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot, watch, Notify};
use tower::ServiceExt;

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<OutboundEvent>>,
}

impl RecordingSink {
    fn names(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().iter().map(|e| e.name()).collect()
    }

    fn count(&self, name: &str) -> usize {
        self.names().into_iter().filter(|n| *n == name).count()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: OutboundEvent) -> Result<(), AppError> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }

    fn emit_with_ack(&self, event: OutboundEvent) -> Result<oneshot::Receiver<Value>, AppError> {
        self.events.lock().unwrap().push(event);
        let (_reply, rx) = oneshot::channel();
        Ok(rx)
    }
}

/// Answers every state push with the state it was given.
#[derive(Default)]
struct EchoApi {
    pushes: AtomicUsize,
}

impl EchoApi {
    fn pushes(&self) -> usize {
        self.pushes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DispatchApi for EchoApi {
    async fn push_state(&self, request: &SyncRequest) -> Result<ServerDriverState, AppError> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        Ok(ServerDriverState {
            is_online: request.snapshot.is_online,
            queue_position: request.snapshot.queue_position,
            vehicle_type: request.snapshot.vehicle_type,
            pickup_location: request.snapshot.pickup_location.clone(),
            active_ride: request.active_ride.clone(),
        })
    }

    async fn fetch_driver_status(&self, _driver_id: &str) -> Result<ServerDriverState, AppError> {
        Ok(ServerDriverState::default())
    }

    async fn fetch_ride_history(
        &self,
        _driver_id: &str,
        query: &HistoryQuery,
    ) -> Result<HistoryPage, AppError> {
        Ok(HistoryPage {
            rides: Vec::new(),
            page: query.page,
            total_pages: 3,
            total: 42,
        })
    }
}

struct Harness<A = EchoApi> {
    app: axum::Router,
    session: Arc<DriverSession>,
    sink: Arc<RecordingSink>,
    api: Arc<A>,
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
    metrics: Metrics,
    shutdown: watch::Receiver<bool>,
    replies: mpsc::UnboundedReceiver<Event>,
}

fn setup() -> Harness {
    setup_with_store(Arc::new(MemoryStore::new()))
}

fn setup_with_store(store: Arc<MemoryStore>) -> Harness {
    build(store, Arc::new(EchoApi::default()))
}

fn build<A: DispatchApi + 'static>(store: Arc<MemoryStore>, api: Arc<A>) -> Harness<A> {
    let sink = Arc::new(RecordingSink::default());
    let clock = Arc::new(ManualClock::default());
    let metrics = Metrics::new();

    let (session, replies) = DriverSession::new(
        SessionDeps {
            driver_id: "driver-1".to_string(),
            sink: sink.clone(),
            api: api.clone(),
            store: store.clone(),
            clock: clock.clone(),
            metrics: metrics.clone(),
        },
        SessionSettings::default(),
    );
    let (state, shutdown) = AppState::new(session.clone(), metrics.clone());

    Harness {
        app: router(Arc::new(state)),
        session,
        sink,
        api,
        store,
        clock,
        metrics,
        shutdown,
        replies,
    }
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn post_request(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn push(session: &DriverSession, wire: Value) {
    let event: InboundEvent = serde_json::from_value(wire).unwrap();
    session.dispatch(Event::Inbound(event)).await;
}

async fn go_online<A>(h: &Harness<A>) {
    let response = h
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            "/driver/online",
            json!({ "vehicleType": "auto", "pickupLocation": "booth-7" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    push(
        &h.session,
        json!({ "event": "driverOnlineConfirmed", "data": { "queuePosition": 3 } }),
    )
    .await;
}

async fn accept_ride_a<A>(h: &Harness<A>) {
    push(
        &h.session,
        json!({
            "event": "newRideRequest",
            "data": { "rideId": "A", "estimatedFare": 120.0 }
        }),
    )
    .await;

    let response = h
        .app
        .clone()
        .oneshot(post_request("/rides/A/accept"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    push(
        &h.session,
        json!({
            "event": "rideAcceptConfirmed",
            "data": { "rideId": "A", "startOTP": "1111", "endOTP": "2222", "queueNumber": 2 }
        }),
    )
    .await;
}

async fn driver_view<A>(h: &Harness<A>) -> Value {
    let response = h.app.clone().oneshot(get_request("/driver")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    body_json(response).await
}

#[tokio::test]
async fn health_returns_ok() {
    let h = setup();
    let response = h.app.clone().oneshot(get_request("/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["driverId"], "driver-1");
    assert_eq!(body["online"], false);
    assert_eq!(body["connected"], false);
    assert!(body["activeRideId"].is_null());
}

#[tokio::test]
async fn metrics_returns_prometheus_format() {
    let h = setup();
    let response = h.app.clone().oneshot(get_request("/metrics")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.contains("text/plain"));

    let body = body_string(response).await;
    assert!(body.contains("reconciliations_total"));
}

#[tokio::test]
async fn go_online_without_vehicle_type_is_rejected() {
    let h = setup();
    let response = h
        .app
        .clone()
        .oneshot(json_request("POST", "/driver/online", json!({})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert!(body["error"].as_str().unwrap().contains("vehicle type"));
    assert!(h.sink.names().is_empty());
}

#[tokio::test]
async fn go_online_waits_for_server_confirmation() {
    let h = setup();
    let response = h
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            "/driver/online",
            json!({ "vehicleType": "car" }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["driver"]["status"], "GOING_ONLINE");
    assert_eq!(h.sink.count("driverGoOnline"), 1);

    push(
        &h.session,
        json!({ "event": "driverOnlineConfirmed", "data": { "queuePosition": 4 } }),
    )
    .await;

    let view = driver_view(&h).await;
    assert_eq!(view["driver"]["status"], "ONLINE");
    assert_eq!(view["driver"]["queuePosition"], 4);
}

#[tokio::test]
async fn double_accept_emits_once() {
    let h = setup();
    go_online(&h).await;
    push(
        &h.session,
        json!({ "event": "newRideRequest", "data": { "rideId": "A" } }),
    )
    .await;

    for _ in 0..2 {
        let response = h
            .app
            .clone()
            .oneshot(post_request("/rides/A/accept"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    assert_eq!(h.sink.count("driverAcceptRide"), 1);
    let view = driver_view(&h).await;
    assert_eq!(view["requests"][0]["accepting"], true);
}

#[tokio::test]
async fn accept_unknown_request_is_not_found() {
    let h = setup();
    go_online(&h).await;

    let response = h
        .app
        .clone()
        .oneshot(post_request("/rides/missing/accept"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn otp_flow_completes_ride_into_history() {
    let h = setup();
    go_online(&h).await;
    accept_ride_a(&h).await;

    let view = driver_view(&h).await;
    assert_eq!(view["activeRide"]["ride"]["status"], "accepted");

    let response = h
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            "/ride/otp",
            json!({ "phase": "start", "otp": "1111" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(h.sink.count("verifyStartOTP"), 1);

    push(
        &h.session,
        json!({ "event": "otpVerificationSuccess", "data": { "rideId": "A", "phase": "start" } }),
    )
    .await;
    let view = driver_view(&h).await;
    assert_eq!(view["activeRide"]["ride"]["status"], "ride_started");

    let response = h
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            "/ride/otp",
            json!({ "phase": "end", "otp": "2222" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    push(
        &h.session,
        json!({ "event": "otpVerificationSuccess", "data": { "rideId": "A", "phase": "end" } }),
    )
    .await;

    let view = driver_view(&h).await;
    assert_eq!(view["activeRide"]["ride"]["status"], "completed");
    assert_eq!(view["history"][0]["id"], "A");

    h.clock.advance(TimeDelta::seconds(6));
    h.session.tick().await;
    let view = driver_view(&h).await;
    assert!(view["activeRide"].is_null());
    assert_eq!(view["driver"]["status"], "ONLINE");
}

#[tokio::test]
async fn wrong_otp_is_refused_and_input_kept() {
    let h = setup();
    go_online(&h).await;
    accept_ride_a(&h).await;

    let response = h
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            "/ride/otp",
            json!({ "phase": "start", "otp": "9999" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(h.sink.count("verifyStartOTP"), 0);

    let view = driver_view(&h).await;
    assert_eq!(view["otpEntry"]["input"], "9999");
    assert_eq!(view["activeRide"]["ride"]["status"], "accepted");
}

#[tokio::test]
async fn end_otp_before_start_is_refused() {
    let h = setup();
    go_online(&h).await;
    accept_ride_a(&h).await;

    let response = h
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            "/ride/otp",
            json!({ "phase": "end", "otp": "2222" }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(h.sink.count("verifyEndOTP"), 0);
}

#[tokio::test]
async fn going_offline_mid_ride_is_refused() {
    let h = setup();
    go_online(&h).await;
    accept_ride_a(&h).await;

    let response = h
        .app
        .clone()
        .oneshot(post_request("/driver/offline"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(h.sink.count("driverGoOffline"), 0);
}

#[tokio::test]
async fn cancel_requires_confirmation() {
    let h = setup();
    go_online(&h).await;
    accept_ride_a(&h).await;

    let response = h
        .app
        .clone()
        .oneshot(json_request("POST", "/ride/cancel", json!({ "confirmed": false })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = h
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            "/ride/cancel",
            json!({ "confirmed": true, "reason": "rider not at pickup" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(h.sink.count("cancelRide"), 1);

    let body = body_json(response).await;
    assert!(body["activeRide"].is_null());
}

#[tokio::test]
async fn identical_snapshots_push_once() {
    let h = setup();
    go_online(&h).await;
    h.clock.advance(TimeDelta::seconds(30));

    let first = h.session.sync(SyncTrigger::Routine).await.unwrap();
    let pushes = h.api.pushes();
    h.clock.advance(TimeDelta::seconds(30));
    let second = h.session.sync(SyncTrigger::Routine).await.unwrap();

    assert_eq!(first, SyncDecision::Send);
    assert_eq!(second, SyncDecision::SkipUnchanged);
    assert_eq!(h.api.pushes(), pushes);
}

#[tokio::test]
async fn forced_sync_goes_through_http() {
    let h = setup();
    let response = h.app.clone().oneshot(post_request("/sync")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["decision"], "send");
    assert_eq!(h.api.pushes(), 1);
}

#[tokio::test]
async fn location_updates_are_gated() {
    let h = setup();

    let response = h
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            "/driver/location",
            json!({ "lat": 12.97, "lng": 77.59 }),
        ))
        .await
        .unwrap();
    assert_eq!(body_json(response).await["sent"], false);

    go_online(&h).await;
    for expected in [true, false] {
        let response = h
            .app
            .clone()
            .oneshot(json_request(
                "POST",
                "/driver/location",
                json!({ "lat": 12.97, "lng": 77.59 }),
            ))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["sent"], expected);
    }
    assert_eq!(h.sink.count("updateDriverLocation"), 1);

    let response = h
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            "/driver/location",
            json!({ "lat": 120.0, "lng": 77.59 }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn ride_history_passes_paging_through() {
    let h = setup();
    let response = h
        .app
        .clone()
        .oneshot(get_request("/rides/history?page=2&limit=5&status=completed"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["page"], 2);
    assert_eq!(body["totalPages"], 3);
}

#[tokio::test]
async fn state_survives_a_new_session() {
    let store = Arc::new(MemoryStore::new());
    let first = setup_with_store(store.clone());
    go_online(&first).await;
    accept_ride_a(&first).await;
    drop(first);

    let second = setup_with_store(store);
    let view = driver_view(&second).await;

    assert_eq!(view["driver"]["status"], "ONLINE");
    assert_eq!(view["activeRide"]["ride"]["id"], "A");
    assert_eq!(view["activeRide"]["ride"]["startOTP"], "1111");
}

#[tokio::test]
async fn logout_clears_storage_and_requests_shutdown() {
    let h = setup();
    go_online(&h).await;
    assert!(!h.store.is_empty());

    let response = h
        .app
        .clone()
        .oneshot(post_request("/session/logout"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(h.store.is_empty());
    assert!(*h.shutdown.borrow());
    assert_eq!(h.sink.count("driverGoOffline"), 1);
}

#[tokio::test]
async fn logout_mid_ride_is_refused() {
    let h = setup();
    go_online(&h).await;
    accept_ride_a(&h).await;

    let response = h
        .app
        .clone()
        .oneshot(post_request("/session/logout"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert!(!h.store.is_empty());
    assert!(!*h.shutdown.borrow());
}

#[tokio::test(start_paused = true)]
async fn runtime_reconciles_after_reconnect_settles() {
    let h = setup();
    let (inbound_tx, inbound) = broadcast::channel(16);
    let (connection_tx, connection) = watch::channel(ConnectionState::Connected {
        reconnected: false,
    });
    let (shutdown_tx, shutdown) = watch::channel(false);

    let handle = tokio::spawn(run_driver_runtime(
        h.session.clone(),
        RuntimeChannels {
            inbound,
            connection,
            replies: h.replies,
            shutdown,
        },
        RuntimeSettings::default(),
        h.metrics.clone(),
    ));

    inbound_tx
        .send(serde_json::from_value(json!({ "event": "queuePositionUpdated", "data": { "queuePosition": 9 } })).unwrap())
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    connection_tx
        .send(ConnectionState::Disconnected {
            reason: "network".to_string(),
        })
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    connection_tx
        .send(ConnectionState::Connected { reconnected: true })
        .unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(h.api.pushes(), 0);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(h.api.pushes(), 1);
    assert_eq!(h.metrics.reconnects_total.get(), 1);
    assert!(h.session.view().connection.is_connected());

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}

/// Holds every state push until the test opens the gate.
#[derive(Default)]
struct GatedApi {
    entered: Notify,
    gate: Notify,
}

#[async_trait]
impl DispatchApi for GatedApi {
    async fn push_state(&self, _request: &SyncRequest) -> Result<ServerDriverState, AppError> {
        self.entered.notify_one();
        self.gate.notified().await;
        Ok(ServerDriverState::default())
    }

    async fn fetch_driver_status(&self, _driver_id: &str) -> Result<ServerDriverState, AppError> {
        Ok(ServerDriverState::default())
    }

    async fn fetch_ride_history(
        &self,
        _driver_id: &str,
        _query: &HistoryQuery,
    ) -> Result<HistoryPage, AppError> {
        Err(AppError::Transport("unavailable".to_string()))
    }
}

/// Rejects the token on every call.
#[derive(Default)]
struct RejectingApi {
    calls: AtomicUsize,
}

#[async_trait]
impl DispatchApi for RejectingApi {
    async fn push_state(&self, _request: &SyncRequest) -> Result<ServerDriverState, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(AppError::Unauthorized("token expired".to_string()))
    }

    async fn fetch_driver_status(&self, _driver_id: &str) -> Result<ServerDriverState, AppError> {
        Err(AppError::Unauthorized("token expired".to_string()))
    }

    async fn fetch_ride_history(
        &self,
        _driver_id: &str,
        _query: &HistoryQuery,
    ) -> Result<HistoryPage, AppError> {
        Err(AppError::Unauthorized("token expired".to_string()))
    }
}

#[tokio::test]
async fn sync_answer_overtaken_by_going_online_keeps_driver_online() {
    let h = build(Arc::new(MemoryStore::new()), Arc::new(GatedApi::default()));

    let session = h.session.clone();
    let in_flight = tokio::spawn(async move { session.sync(SyncTrigger::Forced).await });
    h.api.entered.notified().await;

    go_online(&h).await;
    assert_eq!(driver_view(&h).await["driver"]["status"], "ONLINE");

    h.api.gate.notify_one();
    assert_eq!(in_flight.await.unwrap().unwrap(), SyncDecision::Send);

    let view = driver_view(&h).await;
    assert_eq!(view["driver"]["status"], "ONLINE");
    assert_eq!(view["driver"]["queuePosition"], 3);
}

#[tokio::test]
async fn rejected_token_is_not_retried() {
    let h = build(Arc::new(MemoryStore::new()), Arc::new(RejectingApi::default()));

    let err = h.session.sync(SyncTrigger::Forced).await.unwrap_err();
    assert!(matches!(err, AppError::Unauthorized(_)));
    assert_eq!(h.api.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn runtime_outlives_a_stopped_transport() {
    let mut h = setup();
    let (_inbound_tx, inbound) = broadcast::channel(16);
    let (connection_tx, connection) = watch::channel(ConnectionState::Connected {
        reconnected: false,
    });
    let (shutdown_tx, shutdown) = watch::channel(false);

    let handle = tokio::spawn(run_driver_runtime(
        h.session.clone(),
        RuntimeChannels {
            inbound,
            connection,
            replies: std::mem::replace(&mut h.replies, mpsc::unbounded_channel().1),
            shutdown,
        },
        RuntimeSettings::default(),
        h.metrics.clone(),
    ));

    go_online(&h).await;
    push(
        &h.session,
        json!({ "event": "newRideRequest", "data": { "rideId": "A", "estimatedFare": 120.0 } }),
    )
    .await;
    let response = h
        .app
        .clone()
        .oneshot(post_request("/rides/A/accept"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(h.session.view().requests[0].accepting);

    connection_tx
        .send(ConnectionState::GaveUp { attempts: 5 })
        .unwrap();
    drop(connection_tx);
    tokio::time::sleep(Duration::from_millis(10)).await;

    h.clock.advance(TimeDelta::seconds(11));
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(!handle.is_finished());
    let view = h.session.view();
    assert_eq!(view.requests.len(), 1);
    assert!(!view.requests[0].accepting);
    assert!(view.last_error.is_some());

    let response = h
        .app
        .clone()
        .oneshot(post_request("/rides/A/accept"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}
