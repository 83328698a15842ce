//! Driver/ride reducer: `(state, event) -> effects`, no I/O.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::engine::optimistic::Optimistic;
use crate::engine::reconcile::{reconcile_ride, Outcome, Resolution, Tiered};
use crate::engine::ride::{next_status, otp_gate, OtpGate, OtpPhase, RideEvent};
use crate::engine::sync::SyncTrigger;
use crate::error::AppError;
use crate::models::driver::{Driver, DriverStatus, GeoPoint, VehicleType};
use crate::models::ride::{Otp, Ride, RideRequest, RideStatus};
use crate::models::snapshot::{ServerDriverState, SyncSnapshot};
use crate::store::PersistedState;
use crate::transport::events::{
    AcceptConfirmed, AcceptError, AcceptRide, CancelRide, DriverIdentity, DriverRef,
    InboundEvent, OnlineConfirmed, OtpRejected, OtpVerified, OutboundEvent, RideCancelled,
    RideProgress, StatusOverride, VerifyOtp,
};
use crate::transport::ConnectionState;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MachineSettings {
    /// Deadline for go-online, accept and OTP verification replies.
    pub action_timeout: TimeDelta,
    /// How long a completed ride stays on screen.
    pub completion_display: TimeDelta,
    pub notice_ttl: TimeDelta,
    pub history_limit: usize,
}

impl Default for MachineSettings {
    fn default() -> Self {
        Self {
            action_timeout: TimeDelta::seconds(10),
            completion_display: TimeDelta::seconds(5),
            notice_ttl: TimeDelta::seconds(4),
            history_limit: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// Auto-dismissing message for the driver.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notice {
    pub id: u64,
    pub level: NoticeLevel,
    pub message: String,
    pub expires_at: DateTime<Utc>,
}

/// What the driver typed into the OTP field. Kept across failed attempts.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OtpEntry {
    pub phase: OtpPhase,
    pub input: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Verification {
    pub phase: OtpPhase,
    pub action: Optimistic,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveRide {
    pub ride: Ride,
    pub verification: Option<Verification>,
    /// Set once the ride is terminal; the ride leaves the view at this time.
    pub clear_at: Option<DateTime<Utc>>,
}

impl ActiveRide {
    fn new(ride: Ride) -> Self {
        Self {
            ride,
            verification: None,
            clear_at: None,
        }
    }

    fn is_live(&self) -> bool {
        !self.ride.effective_status().is_terminal()
    }

    fn verifying(&self, phase: OtpPhase) -> bool {
        self.verification
            .as_ref()
            .is_some_and(|v| v.phase == phase && v.action.is_pending())
    }
}

/// Things the machine cannot do itself.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Emit(OutboundEvent),
    /// Persisted fields changed.
    Persist,
    Notify(Notice),
    CollectPayment { ride_id: String, fare: Option<f64> },
    RequestSync(SyncTrigger),
    Reconciled(Outcome),
    Transition(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DriverAction {
    GoOnline {
        vehicle_type: Option<VehicleType>,
        pickup_location: Option<String>,
    },
    GoOffline,
    AcceptRide {
        ride_id: String,
    },
    DeclineRide {
        ride_id: String,
    },
    VerifyOtp {
        phase: OtpPhase,
        code: String,
    },
    CancelRide {
        confirmed: bool,
        reason: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Inbound(InboundEvent),
    Connection(ConnectionState),
    /// The go-online ack came back negative.
    GoOnlineRejected(String),
    /// Driver state returned by status recovery.
    ServerState(ServerDriverState),
    /// Answer to a state push of `sent`.
    SyncResponse {
        sent: SyncSnapshot,
        state: ServerDriverState,
    },
    Tick,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestView {
    #[serde(flatten)]
    pub request: RideRequest,
    pub accepting: bool,
}

/// Everything the presentation layer renders.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverView {
    pub driver: Driver,
    pub connection: ConnectionState,
    pub reauth_required: bool,
    pub going_online: Option<Optimistic>,
    pub requests: Vec<RequestView>,
    pub active_ride: Option<ActiveRide>,
    pub otp_entry: Option<OtpEntry>,
    pub last_error: Option<String>,
    pub notices: Vec<Notice>,
    pub history: Vec<Ride>,
}

impl DriverView {
    pub fn offline(driver_id: &str) -> Self {
        DriverMachine::new(driver_id, MachineSettings::default()).view()
    }
}

#[derive(Debug, Clone)]
pub struct DriverMachine {
    driver: Driver,
    going_online: Option<Optimistic>,
    requests: Vec<RideRequest>,
    accepting: HashMap<String, Optimistic>,
    active: Option<ActiveRide>,
    history: VecDeque<Ride>,
    otp_entry: Option<OtpEntry>,
    last_error: Option<String>,
    notices: Vec<Notice>,
    next_notice_id: u64,
    connection: ConnectionState,
    settings: MachineSettings,
}

impl DriverMachine {
    pub fn new(driver_id: impl Into<String>, settings: MachineSettings) -> Self {
        Self {
            driver: Driver::new(driver_id),
            going_online: None,
            requests: Vec::new(),
            accepting: HashMap::new(),
            active: None,
            history: VecDeque::new(),
            otp_entry: None,
            last_error: None,
            notices: Vec::new(),
            next_notice_id: 1,
            connection: ConnectionState::default(),
            settings,
        }
    }

    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    pub fn active_ride(&self) -> Option<&Ride> {
        self.active.as_ref().map(|active| &active.ride)
    }

    pub fn requests(&self) -> &[RideRequest] {
        &self.requests
    }

    pub fn is_accepting(&self, ride_id: &str) -> bool {
        self.accepting
            .get(ride_id)
            .is_some_and(Optimistic::is_pending)
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn otp_entry(&self) -> Option<&OtpEntry> {
        self.otp_entry.as_ref()
    }

    pub fn notices(&self) -> &[Notice] {
        &self.notices
    }

    pub fn history(&self) -> impl Iterator<Item = &Ride> {
        self.history.iter()
    }

    pub fn identity(&self) -> DriverIdentity {
        DriverIdentity {
            driver_id: self.driver.id.clone(),
            vehicle_type: self.driver.vehicle_type,
            pickup_location: self.driver.pickup_location.clone(),
        }
    }

    /// Sets profile defaults used when a go-online action carries none.
    pub fn set_profile(&mut self, vehicle_type: Option<VehicleType>, pickup_location: Option<String>) {
        if vehicle_type.is_some() {
            self.driver.vehicle_type = vehicle_type;
        }
        if pickup_location.is_some() {
            self.driver.pickup_location = pickup_location;
        }
    }

    pub fn set_location(&mut self, point: GeoPoint) {
        self.driver.last_location = Some(point);
    }

    fn live_ride(&self) -> Option<&Ride> {
        self.active
            .as_ref()
            .filter(|active| active.is_live())
            .map(|active| &active.ride)
    }

    pub fn snapshot(&self) -> SyncSnapshot {
        SyncSnapshot {
            is_online: self.driver.status.is_online(),
            queue_position: self.driver.queue_position,
            active_ride_id: self.live_ride().map(|ride| ride.id.clone()),
            vehicle_type: self.driver.vehicle_type,
            pickup_location: self.driver.pickup_location.clone(),
        }
    }

    /// The active ride still has an OTP gate ahead of it.
    pub fn has_pending_otp(&self) -> bool {
        self.live_ride().is_some_and(Ride::has_pending_otp)
    }

    pub fn persisted(&self) -> PersistedState {
        PersistedState {
            status: self.driver.status.durable(),
            queue_position: self.driver.queue_position,
            active_ride: self.live_ride().cloned(),
            vehicle_type: self.driver.vehicle_type,
            pickup_location: self.driver.pickup_location.clone(),
            last_sync_at: None,
        }
    }

    pub fn view(&self) -> DriverView {
        DriverView {
            driver: self.driver.clone(),
            connection: self.connection.clone(),
            reauth_required: self.connection == ConnectionState::AuthRejected,
            going_online: self.going_online.clone(),
            requests: self
                .requests
                .iter()
                .map(|request| RequestView {
                    request: request.clone(),
                    accepting: self.is_accepting(&request.ride_id),
                })
                .collect(),
            active_ride: self.active.clone(),
            otp_entry: self.otp_entry.clone(),
            last_error: self.last_error.clone(),
            notices: self.notices.clone(),
            history: self.history.iter().cloned().collect(),
        }
    }

    /// Loads what storage held before a reload. The stored ride only fills an
    /// empty slot or a less complete record of the same ride.
    pub fn restore(&mut self, state: PersistedState) -> Outcome {
        self.driver.status = state.status.durable();
        self.driver.queue_position = if self.driver.status.is_online() {
            state.queue_position
        } else {
            None
        };
        self.set_profile(state.vehicle_type, state.pickup_location);

        let stored = state
            .active_ride
            .filter(|ride| !ride.effective_status().is_terminal());
        let resolution = reconcile_ride(self.live_ride(), Tiered::Cached(stored));
        let outcome = resolution.outcome;
        self.install(resolution);
        info!(
            driver_id = %self.driver.id,
            status = ?self.driver.status,
            ride_id = ?self.live_ride().map(|ride| ride.id.as_str()),
            outcome = outcome.as_str(),
            "restored driver state"
        );
        outcome
    }

    pub fn apply_action(
        &mut self,
        action: DriverAction,
        now: DateTime<Utc>,
    ) -> Result<Vec<Effect>, AppError> {
        let mut effects = Vec::new();
        match action {
            DriverAction::GoOnline {
                vehicle_type,
                pickup_location,
            } => self.go_online(vehicle_type, pickup_location, now, &mut effects)?,
            DriverAction::GoOffline => self.go_offline(&mut effects)?,
            DriverAction::AcceptRide { ride_id } => self.accept(ride_id, now, &mut effects)?,
            DriverAction::DeclineRide { ride_id } => self.decline(&ride_id, &mut effects)?,
            DriverAction::VerifyOtp { phase, code } => {
                self.verify_otp(phase, code, now, &mut effects)?
            }
            DriverAction::CancelRide { confirmed, reason } => {
                self.cancel(confirmed, reason, now, &mut effects)?
            }
        }
        Ok(effects)
    }

    pub fn apply(&mut self, event: Event, now: DateTime<Utc>) -> Vec<Effect> {
        let mut effects = Vec::new();
        match event {
            Event::Inbound(event) => self.on_inbound(event, now, &mut effects),
            Event::Connection(state) => self.on_connection(state, &mut effects),
            Event::GoOnlineRejected(message) => self.fail_going_online(message, now, &mut effects),
            Event::ServerState(state) => self.on_server_state(state, false, now, &mut effects),
            Event::SyncResponse { sent, state } => {
                let stale = self.snapshot() != sent;
                self.on_server_state(state, stale, now, &mut effects)
            }
            Event::Tick => self.on_tick(now, &mut effects),
        }
        effects
    }

    fn go_online(
        &mut self,
        vehicle_type: Option<VehicleType>,
        pickup_location: Option<String>,
        now: DateTime<Utc>,
        effects: &mut Vec<Effect>,
    ) -> Result<(), AppError> {
        if self.driver.status != DriverStatus::Offline {
            debug!(driver_id = %self.driver.id, status = ?self.driver.status, "go online ignored");
            return Ok(());
        }
        self.require_link()?;

        let vehicle_type = vehicle_type
            .or(self.driver.vehicle_type)
            .ok_or_else(|| AppError::Validation("vehicle type is required to go online".to_string()))?;
        self.driver.vehicle_type = Some(vehicle_type);
        if pickup_location.is_some() {
            self.driver.pickup_location = pickup_location;
        }

        self.driver.status = DriverStatus::GoingOnline;
        self.going_online = Some(Optimistic::begin(now, self.settings.action_timeout));
        self.last_error = None;

        info!(driver_id = %self.driver.id, vehicle_type = %vehicle_type, "going online");
        effects.push(Effect::Transition("go_online_requested"));
        effects.push(Effect::Emit(OutboundEvent::DriverGoOnline(self.identity())));
        effects.push(Effect::Persist);
        Ok(())
    }

    /// Actions that need a server answer are refused once the transport has
    /// stopped reconnecting.
    fn require_link(&self) -> Result<(), AppError> {
        if !self.connection.is_terminal() {
            return Ok(());
        }
        Err(AppError::Transport(
            self.connection
                .failure_reason()
                .unwrap_or_else(|| "dispatch server unreachable".to_string()),
        ))
    }

    fn go_offline(&mut self, effects: &mut Vec<Effect>) -> Result<(), AppError> {
        if let Some(ride) = self.live_ride() {
            return Err(AppError::Guard(format!(
                "cannot go offline during ride {} ({})",
                ride.id,
                ride.effective_status()
            )));
        }
        if self.driver.status == DriverStatus::Offline && self.going_online.is_none() {
            return Ok(());
        }

        self.set_offline();
        self.active = None;
        self.otp_entry = None;

        info!(driver_id = %self.driver.id, "went offline");
        effects.push(Effect::Transition("go_offline"));
        effects.push(Effect::Emit(OutboundEvent::DriverGoOffline(DriverRef {
            driver_id: self.driver.id.clone(),
        })));
        effects.push(Effect::Persist);
        Ok(())
    }

    fn set_offline(&mut self) {
        self.driver.status = DriverStatus::Offline;
        self.driver.queue_position = None;
        self.going_online = None;
        self.requests.clear();
        self.accepting.clear();
    }

    fn accept(
        &mut self,
        ride_id: String,
        now: DateTime<Utc>,
        effects: &mut Vec<Effect>,
    ) -> Result<(), AppError> {
        if self.driver.status != DriverStatus::Online {
            return Err(AppError::Guard("go online before accepting rides".to_string()));
        }
        self.require_link()?;
        if self.is_accepting(&ride_id) {
            debug!(ride_id = %ride_id, "accept already in flight");
            return Ok(());
        }
        if let Some(ride) = self.live_ride() {
            return Err(AppError::Guard(format!(
                "finish ride {} before accepting another",
                ride.id
            )));
        }
        if !self.requests.iter().any(|request| request.ride_id == ride_id) {
            return Err(AppError::NotFound(format!(
                "ride request {ride_id} is no longer available"
            )));
        }

        self.accepting.insert(
            ride_id.clone(),
            Optimistic::begin(now, self.settings.action_timeout),
        );
        info!(ride_id = %ride_id, "accepting ride");
        effects.push(Effect::Transition("accept_requested"));
        effects.push(Effect::Emit(OutboundEvent::DriverAcceptRide(AcceptRide {
            ride_id,
            driver_id: self.driver.id.clone(),
        })));
        Ok(())
    }

    fn decline(&mut self, ride_id: &str, effects: &mut Vec<Effect>) -> Result<(), AppError> {
        if self.is_accepting(ride_id) {
            return Err(AppError::Conflict(format!(
                "ride {ride_id} is being accepted"
            )));
        }
        let before = self.requests.len();
        self.requests.retain(|request| request.ride_id != ride_id);
        if self.requests.len() == before {
            return Err(AppError::NotFound(format!("no ride request {ride_id}")));
        }
        self.accepting.remove(ride_id);
        debug!(ride_id = %ride_id, "declined ride request");
        effects.push(Effect::Transition("declined"));
        Ok(())
    }

    fn verify_otp(
        &mut self,
        phase: OtpPhase,
        code: String,
        now: DateTime<Utc>,
        effects: &mut Vec<Effect>,
    ) -> Result<(), AppError> {
        self.require_link()?;
        let Some(active) = self.active.as_mut().filter(|active| active.is_live()) else {
            return Err(AppError::Guard("no active ride".to_string()));
        };
        let status = active.ride.effective_status();
        if status != phase.required_status() {
            return Err(AppError::Guard(format!(
                "{} OTP cannot be entered while the ride is {status}",
                phase.as_str()
            )));
        }
        if active.verifying(phase) {
            return Ok(());
        }

        let entry = self.otp_entry.insert(OtpEntry {
            phase,
            input: code.clone(),
            error: None,
        });
        let otp = match Otp::parse(&code) {
            Ok(otp) => otp,
            Err(err) => {
                entry.error = Some(err.to_string());
                return Err(err);
            }
        };

        match otp_gate(&active.ride, phase) {
            OtpGate::Required(expected) => {
                if !expected.matches(&otp) {
                    entry.error = Some("incorrect OTP".to_string());
                    return Err(AppError::Guard("incorrect OTP".to_string()));
                }
                let verify = VerifyOtp {
                    ride_id: active.ride.id.clone(),
                    otp,
                };
                active.verification = Some(Verification {
                    phase,
                    action: Optimistic::begin(now, self.settings.action_timeout),
                });
                info!(ride_id = %verify.ride_id, phase = phase.as_str(), "verifying OTP");
                effects.push(Effect::Emit(match phase {
                    OtpPhase::Start => OutboundEvent::VerifyStartOtp(verify),
                    OtpPhase::End => OutboundEvent::VerifyEndOtp(verify),
                }));
                Ok(())
            }
            OtpGate::NotIssued => {
                info!(
                    ride_id = %active.ride.id,
                    phase = phase.as_str(),
                    "no OTP issued for this phase; advancing without verification"
                );
                self.advance(phase, None, None, now, effects)?;
                effects.push(Effect::RequestSync(SyncTrigger::Forced));
                Ok(())
            }
        }
    }

    /// Moves the active ride through a verified OTP gate. The end gate runs
    /// straight on to completion.
    fn advance(
        &mut self,
        phase: OtpPhase,
        end_otp: Option<Otp>,
        fare: Option<f64>,
        now: DateTime<Utc>,
        effects: &mut Vec<Effect>,
    ) -> Result<(), AppError> {
        let Some(active) = self.active.as_mut() else {
            return Err(AppError::Guard("no active ride".to_string()));
        };
        let event = phase.verified_event();
        let to = next_status(active.ride.effective_status(), event)?;
        active.ride.set_status(to, now);
        if let Some(verification) = active.verification.as_mut() {
            verification.action.confirm(now);
        }
        active.verification = None;
        if self.otp_entry.as_ref().is_some_and(|entry| entry.phase == phase) {
            self.otp_entry = None;
        }
        if fare.is_some() {
            active.ride.fare = fare;
        }
        info!(ride_id = %active.ride.id, status = %to, "ride advanced");
        effects.push(Effect::Transition(event.as_str()));

        match phase {
            OtpPhase::Start => {
                if let Some(otp) = end_otp {
                    active.ride.end_otp = Some(otp);
                }
            }
            OtpPhase::End => {
                effects.push(Effect::CollectPayment {
                    ride_id: active.ride.id.clone(),
                    fare: active.ride.fare.or(active.ride.estimated_fare),
                });
                self.complete(now, effects)?;
            }
        }
        effects.push(Effect::Persist);
        Ok(())
    }

    fn complete(&mut self, now: DateTime<Utc>, effects: &mut Vec<Effect>) -> Result<(), AppError> {
        let Some(active) = self.active.as_mut() else {
            return Err(AppError::Guard("no active ride".to_string()));
        };
        let to = next_status(active.ride.effective_status(), RideEvent::Completed)?;
        active.ride.set_status(to, now);
        active.verification = None;
        active.clear_at = Some(now + self.settings.completion_display);
        let finished = active.ride.clone();
        self.otp_entry = None;

        info!(ride_id = %finished.id, fare = ?finished.fare, "ride completed");
        effects.push(Effect::Transition(RideEvent::Completed.as_str()));
        self.push_history(finished);
        Ok(())
    }

    fn push_history(&mut self, ride: Ride) {
        self.history.retain(|entry| entry.id != ride.id);
        self.history.push_front(ride);
        self.history.truncate(self.settings.history_limit);
    }

    fn cancel(
        &mut self,
        confirmed: bool,
        reason: Option<String>,
        now: DateTime<Utc>,
        effects: &mut Vec<Effect>,
    ) -> Result<(), AppError> {
        let Some(ride) = self.live_ride() else {
            return Err(AppError::Guard("no active ride to cancel".to_string()));
        };
        if !confirmed {
            return Err(AppError::Guard(
                "cancelling a ride needs confirmation".to_string(),
            ));
        }
        let ride_id = ride.id.clone();
        next_status(ride.effective_status(), RideEvent::Cancel)?;

        effects.push(Effect::Emit(OutboundEvent::CancelRide(CancelRide {
            ride_id: ride_id.clone(),
            driver_id: self.driver.id.clone(),
            reason,
        })));
        self.drop_ride(&ride_id, "ride cancelled", now, effects);
        Ok(())
    }

    /// Cancels and clears the active ride.
    fn drop_ride(&mut self, ride_id: &str, message: &str, now: DateTime<Utc>, effects: &mut Vec<Effect>) {
        self.active = None;
        self.otp_entry = None;
        info!(ride_id = %ride_id, "ride cancelled");
        effects.push(Effect::Transition(RideEvent::Cancel.as_str()));
        effects.push(Effect::Persist);
        self.notify(NoticeLevel::Warning, message, now, effects);
    }

    fn notify(
        &mut self,
        level: NoticeLevel,
        message: impl Into<String>,
        now: DateTime<Utc>,
        effects: &mut Vec<Effect>,
    ) {
        let notice = Notice {
            id: self.next_notice_id,
            level,
            message: message.into(),
            expires_at: now + self.settings.notice_ttl,
        };
        self.next_notice_id += 1;
        self.notices.push(notice.clone());
        effects.push(Effect::Notify(notice));
    }

    fn on_inbound(&mut self, event: InboundEvent, now: DateTime<Utc>, effects: &mut Vec<Effect>) {
        debug!(event = event.name(), "applying inbound event");
        match event {
            InboundEvent::DriverOnlineConfirmed(confirmed) => {
                self.on_online_confirmed(confirmed, now, effects)
            }
            InboundEvent::DriverOfflineConfirmed(_) => {
                if self.driver.status != DriverStatus::Offline {
                    self.set_offline();
                    effects.push(Effect::Transition("offline_confirmed"));
                    effects.push(Effect::Persist);
                }
            }
            InboundEvent::NewRideRequest(request) => self.on_ride_request(request, now, effects),
            InboundEvent::RideAcceptConfirmed(confirmed) => {
                self.on_accept_confirmed(confirmed, now, effects)
            }
            InboundEvent::RideAcceptError(error) => self.on_accept_error(error, now, effects),
            InboundEvent::RideAssigned(assigned) => {
                let ride_id = assigned.ride.id.clone();
                self.install_claimed(assigned.ride, now, effects);
                self.notify(
                    NoticeLevel::Info,
                    format!("ride {ride_id} assigned by dispatch"),
                    now,
                    effects,
                );
            }
            InboundEvent::OtpVerificationSuccess(verified) => {
                self.on_otp_verified(verified, now, effects)
            }
            InboundEvent::OtpVerificationError(rejected) => self.on_otp_rejected(rejected),
            InboundEvent::RideStarted(progress) => {
                self.on_progress(OtpPhase::Start, progress, now, effects)
            }
            InboundEvent::RideEnded(progress) => {
                self.on_progress(OtpPhase::End, progress, now, effects)
            }
            InboundEvent::RideCompleted(progress) => self.on_completed(progress, now, effects),
            InboundEvent::RideCancelled(cancelled) => self.on_cancelled(cancelled, now, effects),
            InboundEvent::RideTaken(taken) => {
                let was_accepting = self.is_accepting(&taken.ride_id);
                self.purge_request(&taken.ride_id);
                if was_accepting {
                    self.notify(
                        NoticeLevel::Warning,
                        "ride was taken by another driver",
                        now,
                        effects,
                    );
                }
            }
            InboundEvent::QueuePositionUpdated(update) => {
                if self.driver.status.is_online() && self.driver.queue_position != update.queue_position {
                    self.driver.queue_position = update.queue_position;
                    effects.push(Effect::Persist);
                }
            }
            InboundEvent::DriverStatusUpdated(update) => self.on_override(update, false, now, effects),
            InboundEvent::StatusChangedByAdmin(update) => self.on_override(update, true, now, effects),
        }
    }

    fn on_online_confirmed(
        &mut self,
        confirmed: OnlineConfirmed,
        now: DateTime<Utc>,
        effects: &mut Vec<Effect>,
    ) {
        let in_time = self
            .going_online
            .as_mut()
            .is_some_and(|action| action.confirm(now));
        if !in_time && self.driver.status == DriverStatus::Offline {
            warn!(driver_id = %self.driver.id, "online confirmation arrived after the action resolved; adopting");
        }
        self.going_online = None;
        self.driver.status = DriverStatus::Online;
        self.driver.queue_position = confirmed.queue_position;
        if confirmed.pickup_location.is_some() {
            self.driver.pickup_location = confirmed.pickup_location;
        }
        self.last_error = None;

        info!(driver_id = %self.driver.id, queue_position = ?self.driver.queue_position, "driver online");
        effects.push(Effect::Transition("online_confirmed"));
        effects.push(Effect::Persist);
    }

    fn fail_going_online(&mut self, message: String, now: DateTime<Utc>, effects: &mut Vec<Effect>) {
        let Some(action) = self.going_online.as_mut() else {
            return;
        };
        if !action.reject(message.clone()) {
            return;
        }
        warn!(driver_id = %self.driver.id, error = %message, "go online failed");
        self.set_offline();
        self.last_error = Some(message.clone());
        effects.push(Effect::Transition("go_online_failed"));
        effects.push(Effect::Persist);
        self.notify(NoticeLevel::Error, message, now, effects);
    }

    fn on_ride_request(&mut self, mut request: RideRequest, now: DateTime<Utc>, effects: &mut Vec<Effect>) {
        if self.driver.status != DriverStatus::Online {
            debug!(ride_id = %request.ride_id, "ignoring ride request while not online");
            return;
        }
        let duplicate = self.requests.iter().any(|r| r.ride_id == request.ride_id)
            || self.active_ride().is_some_and(|ride| ride.id == request.ride_id);
        if duplicate {
            debug!(ride_id = %request.ride_id, "duplicate ride request");
            return;
        }
        request.received_at.get_or_insert(now);
        info!(ride_id = %request.ride_id, "ride request received");
        self.requests.push(request);
        effects.push(Effect::Transition("request_received"));
    }

    fn purge_request(&mut self, ride_id: &str) {
        self.requests.retain(|request| request.ride_id != ride_id);
        self.accepting.remove(ride_id);
    }

    fn on_accept_confirmed(
        &mut self,
        confirmed: AcceptConfirmed,
        now: DateTime<Utc>,
        effects: &mut Vec<Effect>,
    ) {
        let in_time = self
            .accepting
            .get_mut(&confirmed.ride_id)
            .is_some_and(|action| action.confirm(now));
        if !in_time {
            warn!(
                ride_id = %confirmed.ride_id,
                "accept confirmation without a pending accept; server is authoritative"
            );
        }

        let request = self
            .requests
            .iter()
            .find(|request| request.ride_id == confirmed.ride_id);
        let mut ride = match (confirmed.ride, request) {
            (Some(mut ride), request) => {
                if let Some(request) = request {
                    ride.fill_missing_from(&Ride::from_request(request));
                }
                ride
            }
            (None, Some(request)) => Ride::from_request(request),
            (None, None) => Ride::new(confirmed.ride_id.clone()),
        };
        ride.id = confirmed.ride_id;
        if confirmed.queue_number.is_some() {
            ride.queue_number = confirmed.queue_number;
        }
        if confirmed.start_otp.is_some() {
            ride.start_otp = confirmed.start_otp;
        }
        if confirmed.end_otp.is_some() {
            ride.end_otp = confirmed.end_otp;
        }
        self.install_claimed(ride, now, effects);
    }

    /// Installs a ride this driver now owns, from an accept confirmation or an
    /// admin assignment.
    fn install_claimed(&mut self, mut ride: Ride, now: DateTime<Utc>, effects: &mut Vec<Effect>) {
        if ride.effective_status() == RideStatus::Pending {
            match next_status(RideStatus::Pending, RideEvent::AcceptConfirmed) {
                Ok(status) => ride.set_status(status, now),
                Err(err) => warn!(ride_id = %ride.id, error = %err, "cannot accept ride"),
            }
        }
        self.purge_request(&ride.id);

        let ride_id = ride.id.clone();
        let resolution = reconcile_ride(self.live_ride(), Tiered::Authoritative(Some(ride)));
        let outcome = resolution.outcome;
        self.install(resolution);

        info!(ride_id = %ride_id, outcome = outcome.as_str(), "ride accepted");
        effects.push(Effect::Transition(RideEvent::AcceptConfirmed.as_str()));
        effects.push(Effect::Reconciled(outcome));
        effects.push(Effect::Persist);
    }

    /// Replaces the active slot with a reconciled ride. Verification state
    /// survives only when the ride id is unchanged.
    fn install(&mut self, resolution: Resolution) {
        match resolution.ride {
            None => self.active = None,
            Some(mut ride) => {
                if ride.effective_status() == RideStatus::Pending {
                    ride.status = Some(RideStatus::Accepted);
                }
                match self.active.as_mut() {
                    Some(active) if active.ride.id == ride.id => active.ride = ride,
                    _ => {
                        self.otp_entry = None;
                        self.active = Some(ActiveRide::new(ride));
                    }
                }
            }
        }
    }

    fn on_accept_error(&mut self, error: AcceptError, now: DateTime<Utc>, effects: &mut Vec<Effect>) {
        let message = error
            .message
            .unwrap_or_else(|| "ride is no longer available".to_string());
        let rejected: Vec<String> = match error.ride_id {
            Some(ride_id) => vec![ride_id],
            None => self
                .accepting
                .iter()
                .filter(|(_, action)| action.is_pending())
                .map(|(ride_id, _)| ride_id.clone())
                .collect(),
        };
        for ride_id in &rejected {
            if let Some(action) = self.accepting.get_mut(ride_id) {
                action.reject(message.clone());
            }
            self.purge_request(ride_id);
            warn!(ride_id = %ride_id, error = %message, "accept rejected");
        }
        effects.push(Effect::Transition("accept_rejected"));
        self.notify(NoticeLevel::Warning, message, now, effects);
    }

    /// Resolves which gate a server OTP event refers to.
    fn phase_for(&self, ride_id: Option<&str>, phase: Option<OtpPhase>) -> Option<OtpPhase> {
        let active = self.active.as_ref().filter(|active| active.is_live())?;
        if ride_id.is_some_and(|id| id != active.ride.id) {
            return None;
        }
        phase
            .or(active.verification.as_ref().map(|v| v.phase))
            .or(match active.ride.effective_status() {
                RideStatus::Accepted => Some(OtpPhase::Start),
                RideStatus::RideStarted => Some(OtpPhase::End),
                _ => None,
            })
    }

    fn on_otp_verified(&mut self, verified: OtpVerified, now: DateTime<Utc>, effects: &mut Vec<Effect>) {
        let Some(phase) = self.phase_for(Some(&verified.ride_id), verified.phase) else {
            warn!(ride_id = %verified.ride_id, "OTP verification for a ride that is not active");
            return;
        };
        let at_gate = self
            .active_ride()
            .is_some_and(|ride| ride.effective_status() == phase.required_status());
        if !at_gate {
            debug!(ride_id = %verified.ride_id, phase = phase.as_str(), "ride already past this gate");
            return;
        }
        if let Err(err) = self.advance(phase, verified.end_otp, None, now, effects) {
            warn!(ride_id = %verified.ride_id, error = %err, "ignoring OTP verification");
        }
    }

    fn on_otp_rejected(&mut self, rejected: OtpRejected) {
        let Some(phase) = self.phase_for(rejected.ride_id.as_deref(), rejected.phase) else {
            return;
        };
        let message = rejected
            .message
            .unwrap_or_else(|| "OTP verification failed".to_string());
        if let Some(verification) = self.active.as_mut().and_then(|a| a.verification.as_mut()) {
            verification.action.reject(message.clone());
        }
        if let Some(active) = self.active.as_mut() {
            active.verification = None;
        }
        warn!(phase = phase.as_str(), error = %message, "OTP rejected by server");
        match self.otp_entry.as_mut() {
            Some(entry) if entry.phase == phase => entry.error = Some(message),
            _ => {
                self.otp_entry = Some(OtpEntry {
                    phase,
                    input: String::new(),
                    error: Some(message),
                })
            }
        }
    }

    fn on_progress(
        &mut self,
        phase: OtpPhase,
        progress: RideProgress,
        now: DateTime<Utc>,
        effects: &mut Vec<Effect>,
    ) {
        let Some(ride) = self.live_ride().filter(|ride| ride.id == progress.ride_id) else {
            debug!(ride_id = %progress.ride_id, "progress for a ride that is not active");
            return;
        };
        if ride.effective_status() != phase.required_status() {
            if let (Some(otp), Some(active)) = (progress.end_otp, self.active.as_mut()) {
                active.ride.end_otp.get_or_insert(otp);
                effects.push(Effect::Persist);
            }
            debug!(ride_id = %progress.ride_id, phase = phase.as_str(), "ride already past this gate");
            return;
        }
        if let Err(err) = self.advance(phase, progress.end_otp, progress.fare, now, effects) {
            warn!(ride_id = %progress.ride_id, error = %err, "ignoring ride progress");
        }
    }

    fn on_completed(&mut self, progress: RideProgress, now: DateTime<Utc>, effects: &mut Vec<Effect>) {
        let Some(ride) = self.live_ride().filter(|ride| ride.id == progress.ride_id) else {
            debug!(ride_id = %progress.ride_id, "completion for a ride that is not active");
            return;
        };
        let status = ride.effective_status();
        if status == RideStatus::RideStarted {
            if let Err(err) = self.advance(OtpPhase::End, None, progress.fare, now, effects) {
                warn!(ride_id = %progress.ride_id, error = %err, "ignoring ride completion");
            }
            return;
        }
        if let Err(err) = next_status(status, RideEvent::Completed) {
            warn!(ride_id = %progress.ride_id, error = %err, "ignoring ride completion");
            return;
        }
        if let (Some(fare), Some(active)) = (progress.fare, self.active.as_mut()) {
            active.ride.fare = Some(fare);
        }
        if let Err(err) = self.complete(now, effects) {
            warn!(ride_id = %progress.ride_id, error = %err, "ignoring ride completion");
            return;
        }
        effects.push(Effect::Persist);
    }

    fn on_cancelled(&mut self, cancelled: RideCancelled, now: DateTime<Utc>, effects: &mut Vec<Effect>) {
        let is_active = self
            .live_ride()
            .is_some_and(|ride| ride.id == cancelled.ride_id);
        if is_active {
            let message = match cancelled.cancelled_by.as_deref() {
                Some(by) => format!("ride cancelled by {by}"),
                None => "ride cancelled".to_string(),
            };
            self.drop_ride(&cancelled.ride_id, &message, now, effects);
            return;
        }
        if self.requests.iter().any(|r| r.ride_id == cancelled.ride_id) {
            self.purge_request(&cancelled.ride_id);
            effects.push(Effect::Transition(RideEvent::Withdrawn.as_str()));
        }
    }

    fn on_override(
        &mut self,
        update: StatusOverride,
        by_admin: bool,
        now: DateTime<Utc>,
        effects: &mut Vec<Effect>,
    ) {
        let was_online = self.driver.status.is_online();
        if update.is_online {
            if let Some(action) = self.going_online.as_mut() {
                action.confirm(now);
            }
            self.going_online = None;
            self.driver.status = DriverStatus::Online;
            self.driver.queue_position = update.queue_position;
        } else {
            self.set_offline();
        }
        info!(
            driver_id = %self.driver.id,
            online = update.is_online,
            by_admin,
            reason = ?update.reason,
            "driver status overridden"
        );
        effects.push(Effect::Transition("status_override"));
        effects.push(Effect::Persist);

        if by_admin && was_online != update.is_online {
            let message = match (update.is_online, update.reason) {
                (true, _) => "dispatch set you online".to_string(),
                (false, Some(reason)) => format!("dispatch set you offline: {reason}"),
                (false, None) => "dispatch set you offline".to_string(),
            };
            self.notify(NoticeLevel::Info, message, now, effects);
        }
    }

    fn on_connection(&mut self, state: ConnectionState, effects: &mut Vec<Effect>) {
        debug!(?state, "connection state changed");
        let failure = state.failure_reason();
        self.connection = state;
        let Some(reason) = failure else {
            return;
        };
        if self.connection.is_terminal() {
            warn!(driver_id = %self.driver.id, error = %reason, "transport stopped for good");
            self.last_error = Some(reason.clone());
        }

        let pending = self
            .going_online
            .as_mut()
            .is_some_and(|action| action.reject(reason.clone()));
        if pending {
            warn!(driver_id = %self.driver.id, error = %reason, "connection failed while going online");
            self.set_offline();
            self.last_error = Some(reason);
            effects.push(Effect::Transition("go_online_failed"));
            effects.push(Effect::Persist);
        }
    }

    /// A `stale` answer only merges the ride; local status is kept.
    fn on_server_state(
        &mut self,
        mut state: ServerDriverState,
        stale: bool,
        now: DateTime<Utc>,
        effects: &mut Vec<Effect>,
    ) {
        let before = self.view_status();

        let server_ride = state
            .active_ride
            .take()
            .filter(|ride| !ride.effective_status().is_terminal());
        let resolution = reconcile_ride(self.live_ride(), Tiered::Authoritative(server_ride));
        let outcome = resolution.outcome;
        self.install(resolution);
        effects.push(Effect::Reconciled(outcome));

        if stale {
            debug!(driver_id = %self.driver.id, "local state moved during sync; keeping local status");
            effects.push(Effect::RequestSync(SyncTrigger::Change));
        } else {
            self.adopt_server_status(state);
        }

        let after = self.view_status();
        if before != after {
            effects.push(Effect::Persist);
            if before.0 != after.0 || before.1 != after.1 {
                self.notify(NoticeLevel::Info, "status updated from server", now, effects);
            }
        }
    }

    fn adopt_server_status(&mut self, state: ServerDriverState) {
        if self.going_online.as_ref().is_some_and(Optimistic::is_pending) {
            debug!(driver_id = %self.driver.id, "go online pending; keeping local status");
        } else if state.is_online != self.driver.status.is_online() {
            warn!(
                driver_id = %self.driver.id,
                local_online = self.driver.status.is_online(),
                server_online = state.is_online,
                "server disagrees on online status; adopting server"
            );
            if state.is_online {
                self.driver.status = DriverStatus::Online;
            } else {
                self.set_offline();
            }
        }
        if self.driver.status == DriverStatus::Online {
            self.driver.queue_position = state.queue_position;
        }
        self.set_profile(state.vehicle_type, state.pickup_location);
    }

    /// What the driver sees at a glance: online status, active ride and its
    /// status, queue position.
    fn view_status(&self) -> (DriverStatus, Option<(String, RideStatus)>, Option<u32>) {
        (
            self.driver.status,
            self.live_ride()
                .map(|ride| (ride.id.clone(), ride.effective_status())),
            self.driver.queue_position,
        )
    }

    fn on_tick(&mut self, now: DateTime<Utc>, effects: &mut Vec<Effect>) {
        let timed_out = self
            .going_online
            .as_mut()
            .is_some_and(|action| action.expire(now));
        if timed_out {
            let message = self
                .going_online
                .as_ref()
                .and_then(Optimistic::failure)
                .map(|failure| failure.message())
                .unwrap_or_default();
            warn!(driver_id = %self.driver.id, "go online timed out");
            self.set_offline();
            self.last_error = Some(message.clone());
            effects.push(Effect::Transition("go_online_timed_out"));
            effects.push(Effect::Persist);
            self.notify(NoticeLevel::Error, message, now, effects);
        }

        let mut expired = Vec::new();
        for (ride_id, action) in self.accepting.iter_mut() {
            if action.expire(now) {
                expired.push(ride_id.clone());
            }
        }
        for ride_id in expired {
            self.accepting.remove(&ride_id);
            warn!(ride_id = %ride_id, "accept timed out; request kept for retry");
            effects.push(Effect::Transition("accept_timed_out"));
            self.notify(
                NoticeLevel::Warning,
                "no response to accept, please try again",
                now,
                effects,
            );
        }

        let verification_timed_out = self
            .active
            .as_mut()
            .and_then(|active| active.verification.as_mut())
            .is_some_and(|verification| verification.action.expire(now));
        if verification_timed_out {
            if let Some(active) = self.active.as_mut() {
                if let Some(verification) = active.verification.take() {
                    let message = verification
                        .action
                        .failure()
                        .map(|failure| failure.message())
                        .unwrap_or_default();
                    warn!(ride_id = %active.ride.id, phase = verification.phase.as_str(), "OTP verification timed out");
                    if let Some(entry) = self.otp_entry.as_mut().filter(|e| e.phase == verification.phase) {
                        entry.error = Some(message);
                    }
                }
            }
        }

        self.notices.retain(|notice| notice.expires_at > now);

        let clear = self
            .active
            .as_ref()
            .and_then(|active| active.clear_at)
            .is_some_and(|at| at <= now);
        if clear {
            if let Some(active) = self.active.take() {
                debug!(ride_id = %active.ride.id, "clearing finished ride from view");
            }
            effects.push(Effect::Persist);
        }
    }
}
