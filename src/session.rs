//! One driver session per login.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::TimeDelta;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{DispatchApi, HistoryPage, HistoryQuery, SyncRequest};
use crate::clock::Clock;
use crate::engine::location::LocationGate;
use crate::engine::machine::{DriverAction, DriverMachine, DriverView, Effect, Event, MachineSettings};
use crate::engine::ride::OtpPhase;
use crate::engine::sync::{SyncController, SyncDecision, SyncPolicy, SyncTrigger};
use crate::engine::throttle::{retry_with_backoff, Backoff};
use crate::error::AppError;
use crate::geo;
use crate::models::driver::{DriverStatus, GeoPoint, VehicleType};
use crate::observability::metrics::Metrics;
use crate::store::{DriverStore, KeyValueStore};
use crate::transport::events::{
    AcceptConfirmed, AcceptError, InboundEvent, LocationUpdate, OnlineConfirmed,
    OfflineConfirmed, OtpRejected, OtpVerified, OutboundEvent,
};
use crate::transport::frame::AckReply;
use crate::transport::{ConnectionState, EventSink};

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub machine: MachineSettings,
    pub sync: SyncPolicy,
    pub sync_retry: Backoff,
    pub location_min_interval: TimeDelta,
    pub location_min_distance_m: f64,
    pub vehicle_type: Option<VehicleType>,
    pub pickup_location: Option<String>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            machine: MachineSettings::default(),
            sync: SyncPolicy::default(),
            sync_retry: Backoff {
                max_attempts: 3,
                ..Backoff::default()
            },
            location_min_interval: TimeDelta::seconds(5),
            location_min_distance_m: 25.0,
            vehicle_type: None,
            pickup_location: None,
        }
    }
}

pub struct SessionDeps {
    pub driver_id: String,
    pub sink: Arc<dyn EventSink>,
    pub api: Arc<dyn DispatchApi>,
    pub store: Arc<dyn KeyValueStore>,
    pub clock: Arc<dyn Clock>,
    pub metrics: Metrics,
}

pub struct DriverSession {
    session_id: Uuid,
    driver_id: String,
    machine: Mutex<DriverMachine>,
    sync: Mutex<SyncController>,
    location: Mutex<LocationGate>,
    store: DriverStore,
    sink: Arc<dyn EventSink>,
    api: Arc<dyn DispatchApi>,
    clock: Arc<dyn Clock>,
    metrics: Metrics,
    sync_retry: Backoff,
    ack_wait: Duration,
    view: watch::Sender<DriverView>,
    replies: mpsc::UnboundedSender<Event>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl DriverSession {
    /// Builds the session and restores whatever storage kept for this driver.
    /// The receiver yields events derived from ack replies; feed them back
    /// through [`DriverSession::dispatch`].
    pub fn new(
        deps: SessionDeps,
        settings: SessionSettings,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Event>) {
        let store = DriverStore::new(deps.store, &deps.driver_id);
        let persisted = store.load();
        let last_sync_at = persisted.last_sync_at;

        let ack_wait = settings
            .machine
            .action_timeout
            .to_std()
            .unwrap_or(Duration::from_secs(10));
        let mut machine = DriverMachine::new(deps.driver_id.clone(), settings.machine);
        machine.set_profile(settings.vehicle_type, settings.pickup_location);
        let outcome = machine.restore(persisted);
        deps.metrics
            .reconciliations_total
            .with_label_values(&[outcome.as_str()])
            .inc();

        let mut sync = SyncController::new(settings.sync);
        sync.restore(last_sync_at);

        let (view, _unused_rx) = watch::channel(machine.view());
        let (replies, replies_rx) = mpsc::unbounded_channel();

        let session_id = Uuid::new_v4();
        info!(
            driver_id = %deps.driver_id,
            session_id = %session_id,
            restored = outcome.as_str(),
            "driver session created"
        );

        let session = Arc::new(Self {
            session_id,
            driver_id: deps.driver_id,
            machine: Mutex::new(machine),
            sync: Mutex::new(sync),
            location: Mutex::new(LocationGate::new(
                settings.location_min_interval,
                settings.location_min_distance_m,
            )),
            store,
            sink: deps.sink,
            api: deps.api,
            clock: deps.clock,
            metrics: deps.metrics,
            sync_retry: settings.sync_retry,
            ack_wait,
            view,
            replies,
        });
        session.publish(&lock(&session.machine));
        (session, replies_rx)
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn driver_id(&self) -> &str {
        &self.driver_id
    }

    pub fn view(&self) -> DriverView {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DriverView> {
        self.view.subscribe()
    }

    /// Pushes restored state to the server on mount. Falls back to a plain
    /// status fetch when the push fails.
    pub async fn mount(&self) {
        match self.sync(SyncTrigger::Mount).await {
            Ok(decision) => debug!(decision = decision.as_str(), "mount sync finished"),
            Err(err) => {
                warn!(error = %err, "mount sync failed; recovering driver status");
                if let Err(err) = self.recover().await {
                    warn!(error = %err, "driver status recovery failed");
                }
            }
        }
    }

    pub async fn act(&self, action: DriverAction) -> Result<DriverView, AppError> {
        let triggers = {
            let mut machine = lock(&self.machine);
            let now = self.clock.now();
            let result = machine.apply_action(action, now);
            let triggers = match result {
                Ok(effects) => self.execute(&machine, effects),
                Err(err) => {
                    self.publish(&machine);
                    return Err(err);
                }
            };
            self.publish(&machine);
            triggers
        };
        self.run_syncs(triggers).await;
        Ok(self.view())
    }

    pub async fn dispatch(&self, event: Event) {
        let triggers = self.apply(event);
        self.run_syncs(triggers).await;
    }

    fn apply(&self, event: Event) -> Vec<SyncTrigger> {
        let mut machine = lock(&self.machine);
        let effects = machine.apply(event, self.clock.now());
        let triggers = self.execute(&machine, effects);
        self.publish(&machine);
        triggers
    }

    /// Ticks the machine and fires a debounced change sync once it is due.
    pub async fn tick(&self) {
        self.dispatch(Event::Tick).await;
        let due = lock(&self.sync).change_due(self.clock.now());
        if due {
            self.run_syncs(vec![SyncTrigger::Change]).await;
        }
    }

    pub async fn connection_changed(&self, state: ConnectionState) {
        self.dispatch(Event::Connection(state)).await;
    }

    async fn run_syncs(&self, triggers: Vec<SyncTrigger>) {
        for trigger in triggers {
            if let Err(err) = self.sync(trigger).await {
                warn!(trigger = trigger.as_str(), error = %err, "requested sync failed");
            }
        }
    }

    /// Pushes the current snapshot when the sync policy allows it and applies
    /// the server's answer.
    pub async fn sync(&self, trigger: SyncTrigger) -> Result<SyncDecision, AppError> {
        let now = self.clock.now();
        let (snapshot, otp_pending, active_ride) = {
            let machine = lock(&self.machine);
            (
                machine.snapshot(),
                machine.has_pending_otp(),
                machine.persisted().active_ride,
            )
        };

        let decision = lock(&self.sync).decide(trigger, &snapshot, otp_pending, now);
        if decision != SyncDecision::Send {
            self.metrics
                .sync_calls_total
                .with_label_values(&[decision.as_str()])
                .inc();
            return Ok(decision);
        }

        let request = SyncRequest {
            driver_id: self.driver_id.clone(),
            snapshot: snapshot.clone(),
            active_ride,
            sent_at: now,
        };
        let started = Instant::now();
        let api = &self.api;
        let body = &request;
        let result = retry_with_backoff(
            self.sync_retry,
            "state_sync",
            AppError::is_transient,
            move || api.push_state(body),
        )
        .await;
        let outcome = if result.is_ok() { "ok" } else { "failed" };
        self.metrics
            .sync_latency_seconds
            .with_label_values(&[outcome])
            .observe(started.elapsed().as_secs_f64());
        self.metrics.sync_calls_total.with_label_values(&[outcome]).inc();

        match result {
            Ok(server) => {
                let done = self.clock.now();
                lock(&self.sync).record_success(snapshot.clone(), done);
                if let Err(err) = self.store.record_sync(done) {
                    warn!(error = %err, "failed to persist sync time");
                }
                info!(
                    driver_id = %self.driver_id,
                    trigger = trigger.as_str(),
                    server_online = server.is_online,
                    "state synced"
                );
                let follow_ups = self.apply(Event::SyncResponse {
                    sent: snapshot,
                    state: server,
                });
                if !follow_ups.is_empty() {
                    lock(&self.sync).note_change(done);
                }
                Ok(decision)
            }
            Err(err) => {
                lock(&self.sync).record_failure();
                warn!(driver_id = %self.driver_id, trigger = trigger.as_str(), error = %err, "state sync failed");
                Err(err)
            }
        }
    }

    /// Fetches the server's view of this driver and reconciles against it.
    pub async fn recover(&self) -> Result<(), AppError> {
        let server = self.api.fetch_driver_status(&self.driver_id).await?;
        info!(driver_id = %self.driver_id, server_online = server.is_online, "recovered driver status");
        self.dispatch(Event::ServerState(server)).await;
        Ok(())
    }

    pub async fn history(&self, query: HistoryQuery) -> Result<HistoryPage, AppError> {
        self.api.fetch_ride_history(&self.driver_id, &query).await
    }

    /// Sends a location fix if the driver is online and the fix moved far
    /// enough since the last one. Returns whether it was sent.
    pub fn report_location(&self, point: GeoPoint) -> Result<bool, AppError> {
        if !geo::is_valid(&point) {
            return Err(AppError::Validation("location is out of range".to_string()));
        }
        let now = self.clock.now();
        let (online, ride_id) = {
            let mut machine = lock(&self.machine);
            machine.set_location(point);
            let ride_id = machine.snapshot().active_ride_id;
            (machine.driver().status.is_online(), ride_id)
        };

        if !lock(&self.location).admit(point, online, now) {
            return Ok(false);
        }
        let event = OutboundEvent::UpdateDriverLocation(LocationUpdate {
            driver_id: self.driver_id.clone(),
            location: point,
            ride_id,
        });
        self.metrics
            .outbound_events_total
            .with_label_values(&[event.name()])
            .inc();
        self.sink.emit(event)?;
        Ok(true)
    }

    /// Goes offline if needed and wipes this driver's stored state. Refused
    /// while a ride is in progress.
    pub async fn logout(&self) -> Result<(), AppError> {
        let (online, riding) = {
            let machine = lock(&self.machine);
            (
                machine.driver().status != DriverStatus::Offline,
                machine.snapshot().active_ride_id.is_some(),
            )
        };
        if riding {
            return Err(AppError::Guard(
                "finish the active ride before signing out".to_string(),
            ));
        }
        if online {
            self.act(DriverAction::GoOffline).await?;
        }

        self.store.clear()?;
        lock(&self.sync).forget();
        lock(&self.location).reset();
        info!(driver_id = %self.driver_id, "driver signed out");
        Ok(())
    }

    /// Carries out machine effects. Sync requests are returned so they run
    /// after the machine lock is released.
    fn execute(&self, machine: &DriverMachine, effects: Vec<Effect>) -> Vec<SyncTrigger> {
        let mut triggers = Vec::new();
        let mut persist = false;
        for effect in effects {
            match effect {
                Effect::Emit(event) => self.emit(event),
                Effect::Persist => persist = true,
                Effect::Notify(notice) => {
                    info!(level = ?notice.level, message = %notice.message, "driver notice")
                }
                Effect::CollectPayment { ride_id, fare } => {
                    info!(ride_id = %ride_id, fare = ?fare, "collect payment from rider")
                }
                Effect::RequestSync(SyncTrigger::Change) => {
                    lock(&self.sync).note_change(self.clock.now())
                }
                Effect::RequestSync(trigger) => triggers.push(trigger),
                Effect::Reconciled(outcome) => self
                    .metrics
                    .reconciliations_total
                    .with_label_values(&[outcome.as_str()])
                    .inc(),
                Effect::Transition(event) => self
                    .metrics
                    .transitions_total
                    .with_label_values(&[event])
                    .inc(),
            }
        }

        if persist {
            if let Err(err) = self.store.save(&machine.persisted()) {
                warn!(driver_id = %self.driver_id, error = %err, "failed to persist driver state");
            }
            self.sink.set_identity(machine.identity());
            lock(&self.sync).note_change(self.clock.now());
        }

        let driver = machine.driver();
        self.metrics
            .driver_online
            .set(i64::from(driver.status.is_online()));
        self.metrics
            .queue_position
            .set(driver.queue_position.map_or(0, i64::from));
        triggers
    }

    fn emit(&self, event: OutboundEvent) {
        self.metrics
            .outbound_events_total
            .with_label_values(&[event.name()])
            .inc();
        debug!(event = event.name(), "emitting event");

        if !event.expects_ack() {
            if let Err(err) = self.sink.emit(event) {
                warn!(error = %err, "failed to emit event");
            }
            return;
        }

        match self.sink.emit_with_ack(event.clone()) {
            Ok(reply) => {
                tokio::spawn(forward_ack(event, reply, self.ack_wait, self.replies.clone()));
            }
            Err(err) => {
                warn!(event = event.name(), error = %err, "failed to emit event");
                let failure = json!({ "success": false, "message": err.to_string() });
                if let Some(mapped) = map_ack(&event, AckReply::from_value(failure)) {
                    let _ = self.replies.send(mapped);
                }
            }
        }
    }

    fn publish(&self, machine: &DriverMachine) {
        let view = machine.view();
        self.view.send_if_modified(|current| {
            if *current == view {
                return false;
            }
            *current = view;
            true
        });
    }
}

async fn forward_ack(
    event: OutboundEvent,
    reply: oneshot::Receiver<Value>,
    wait: Duration,
    replies: mpsc::UnboundedSender<Event>,
) {
    let value = match tokio::time::timeout(wait, reply).await {
        Ok(Ok(value)) => value,
        Ok(Err(_)) => {
            debug!(event = event.name(), "ack dropped without reply");
            return;
        }
        Err(_) => {
            debug!(event = event.name(), "no ack before the action deadline");
            return;
        }
    };
    if let Some(mapped) = map_ack(&event, AckReply::from_value(value)) {
        if replies.send(mapped).is_err() {
            debug!(event = event.name(), "session gone before ack arrived");
        }
    }
}

/// Turns an ack reply into the machine event the matching server push would
/// have produced.
pub fn map_ack(event: &OutboundEvent, reply: AckReply) -> Option<Event> {
    let success = reply.is_success();
    let payload = reply.payload();
    match event {
        OutboundEvent::DriverGoOnline(_) => Some(if success {
            let confirmed: OnlineConfirmed = serde_json::from_value(payload).unwrap_or_default();
            Event::Inbound(InboundEvent::DriverOnlineConfirmed(confirmed))
        } else {
            Event::GoOnlineRejected(
                reply
                    .message
                    .unwrap_or_else(|| "server refused to put you online".to_string()),
            )
        }),
        OutboundEvent::DriverGoOffline(_) => {
            if success {
                Some(Event::Inbound(InboundEvent::DriverOfflineConfirmed(
                    OfflineConfirmed::default(),
                )))
            } else {
                warn!(error = ?reply.message, "go offline rejected");
                None
            }
        }
        OutboundEvent::DriverAcceptRide(accept) => {
            if !success {
                return Some(Event::Inbound(InboundEvent::RideAcceptError(AcceptError {
                    ride_id: Some(accept.ride_id.clone()),
                    message: reply.message,
                })));
            }
            let mut payload = payload;
            if let Value::Object(fields) = &mut payload {
                fields
                    .entry("rideId")
                    .or_insert_with(|| Value::String(accept.ride_id.clone()));
            }
            match serde_json::from_value::<AcceptConfirmed>(payload) {
                Ok(confirmed) => Some(Event::Inbound(InboundEvent::RideAcceptConfirmed(confirmed))),
                Err(err) => {
                    debug!(ride_id = %accept.ride_id, error = %err, "accept ack without details; waiting for confirmation event");
                    None
                }
            }
        }
        OutboundEvent::VerifyStartOtp(verify) | OutboundEvent::VerifyEndOtp(verify) => {
            let phase = match event {
                OutboundEvent::VerifyStartOtp(_) => OtpPhase::Start,
                _ => OtpPhase::End,
            };
            Some(Event::Inbound(if success {
                let end_otp = payload
                    .get("endOTP")
                    .or_else(|| payload.get("endOtp"))
                    .and_then(|value| serde_json::from_value(value.clone()).ok());
                InboundEvent::OtpVerificationSuccess(OtpVerified {
                    ride_id: verify.ride_id.clone(),
                    phase: Some(phase),
                    end_otp,
                })
            } else {
                InboundEvent::OtpVerificationError(OtpRejected {
                    ride_id: Some(verify.ride_id.clone()),
                    phase: Some(phase),
                    message: reply.message,
                })
            }))
        }
        OutboundEvent::CancelRide(cancel) => {
            if !success {
                warn!(ride_id = %cancel.ride_id, error = ?reply.message, "cancel rejected by server");
            }
            None
        }
        OutboundEvent::RegisterDriver(_) | OutboundEvent::UpdateDriverLocation(_) => None,
    }
}
