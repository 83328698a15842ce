use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tracing::debug;

use crate::engine::throttle::{Debouncer, SlidingWindowLimiter, Throttle};
use crate::models::snapshot::SyncSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    /// Session restored from storage.
    Mount,
    /// Transport came back after a drop.
    Reconnect,
    /// Periodic background sync.
    Routine,
    /// Local state changed; arrives debounced.
    Change,
    /// Explicit user or caller request.
    Forced,
}

impl SyncTrigger {
    fn bypasses_snapshot_check(&self) -> bool {
        matches!(
            self,
            SyncTrigger::Mount | SyncTrigger::Reconnect | SyncTrigger::Forced
        )
    }

    fn is_background(&self) -> bool {
        matches!(self, SyncTrigger::Routine | SyncTrigger::Change)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncTrigger::Mount => "mount",
            SyncTrigger::Reconnect => "reconnect",
            SyncTrigger::Routine => "routine",
            SyncTrigger::Change => "change",
            SyncTrigger::Forced => "forced",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDecision {
    Send,
    SkipUnchanged,
    /// An OTP gate is still open on the active ride and the last sync is recent.
    SuppressedOtp,
    Throttled,
    RateLimited,
}

impl SyncDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncDecision::Send => "send",
            SyncDecision::SkipUnchanged => "skip_unchanged",
            SyncDecision::SuppressedOtp => "suppressed_otp",
            SyncDecision::Throttled => "throttled",
            SyncDecision::RateLimited => "rate_limited",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncPolicy {
    pub min_interval: TimeDelta,
    pub otp_suppression: TimeDelta,
    pub debounce: TimeDelta,
    pub max_per_minute: usize,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            min_interval: TimeDelta::seconds(5),
            otp_suppression: TimeDelta::seconds(60),
            debounce: TimeDelta::milliseconds(1500),
            max_per_minute: 6,
        }
    }
}

/// Decides whether a state push to the server should happen now. Holds no
/// network handle; the caller performs the call and reports back.
#[derive(Debug)]
pub struct SyncController {
    policy: SyncPolicy,
    last_sent: Option<SyncSnapshot>,
    last_success_at: Option<DateTime<Utc>>,
    throttle: Throttle<&'static str>,
    limiter: SlidingWindowLimiter,
    debouncer: Debouncer,
}

const SYNC_KEY: &str = "state_sync";

impl SyncController {
    pub fn new(policy: SyncPolicy) -> Self {
        Self {
            throttle: Throttle::new(policy.min_interval),
            limiter: SlidingWindowLimiter::per_minute(policy.max_per_minute),
            debouncer: Debouncer::new(policy.debounce),
            policy,
            last_sent: None,
            last_success_at: None,
        }
    }

    /// Seeds the last-success time from storage after a reload.
    pub fn restore(&mut self, last_success_at: Option<DateTime<Utc>>) {
        self.last_success_at = last_success_at;
    }

    pub fn last_success_at(&self) -> Option<DateTime<Utc>> {
        self.last_success_at
    }

    pub fn decide(
        &mut self,
        trigger: SyncTrigger,
        snapshot: &SyncSnapshot,
        otp_pending: bool,
        now: DateTime<Utc>,
    ) -> SyncDecision {
        let decision = self.evaluate(trigger, snapshot, otp_pending, now);
        debug!(
            trigger = trigger.as_str(),
            decision = decision.as_str(),
            otp_pending,
            "sync decision"
        );
        decision
    }

    fn evaluate(
        &mut self,
        trigger: SyncTrigger,
        snapshot: &SyncSnapshot,
        otp_pending: bool,
        now: DateTime<Utc>,
    ) -> SyncDecision {
        if !trigger.bypasses_snapshot_check() && self.last_sent.as_ref() == Some(snapshot) {
            return SyncDecision::SkipUnchanged;
        }

        if trigger.is_background() && otp_pending {
            let recent = self
                .last_success_at
                .is_some_and(|at| now - at <= self.policy.otp_suppression);
            if recent {
                return SyncDecision::SuppressedOtp;
            }
        }

        if trigger != SyncTrigger::Forced && self.throttle.try_acquire(SYNC_KEY, now).is_err() {
            return SyncDecision::Throttled;
        }

        if !self.limiter.try_acquire(now) {
            return SyncDecision::RateLimited;
        }

        SyncDecision::Send
    }

    pub fn record_success(&mut self, snapshot: SyncSnapshot, now: DateTime<Utc>) {
        self.last_sent = Some(snapshot);
        self.last_success_at = Some(now);
    }

    /// A failed push leaves the last snapshot untouched so the next attempt is
    /// not skipped as unchanged, and reopens the throttle.
    pub fn record_failure(&mut self) {
        self.throttle.reset(&SYNC_KEY);
    }

    /// Invalidates the remembered snapshot, e.g. after storage was cleared.
    pub fn forget(&mut self) {
        self.last_sent = None;
        self.last_success_at = None;
        self.debouncer.cancel();
    }

    pub fn note_change(&mut self, now: DateTime<Utc>) {
        self.debouncer.trigger(now);
    }

    /// True once a burst of changes has gone quiet.
    pub fn change_due(&mut self, now: DateTime<Utc>) -> bool {
        self.debouncer.poll(now)
    }
}
