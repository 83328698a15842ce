use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

/// Lifecycle of an action applied optimistically before the server answered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Optimistic {
    Pending {
        started_at: DateTime<Utc>,
        deadline: DateTime<Utc>,
    },
    Confirmed {
        at: DateTime<Utc>,
    },
    Failed {
        reason: Failure,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum Failure {
    TimedOut,
    Rejected(String),
}

impl Failure {
    pub fn message(&self) -> String {
        match self {
            Failure::TimedOut => "no response from server, please try again".to_string(),
            Failure::Rejected(message) => message.clone(),
        }
    }
}

impl Optimistic {
    pub fn begin(now: DateTime<Utc>, timeout: TimeDelta) -> Self {
        Optimistic::Pending {
            started_at: now,
            deadline: now + timeout,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Optimistic::Pending { .. })
    }

    /// Returns false when the action had already resolved.
    pub fn confirm(&mut self, now: DateTime<Utc>) -> bool {
        if !self.is_pending() {
            return false;
        }
        *self = Optimistic::Confirmed { at: now };
        true
    }

    pub fn reject(&mut self, message: impl Into<String>) -> bool {
        if !self.is_pending() {
            return false;
        }
        *self = Optimistic::Failed {
            reason: Failure::Rejected(message.into()),
        };
        true
    }

    /// Moves a pending action past its deadline to `Failed(TimedOut)`.
    /// Returns true only on that transition.
    pub fn expire(&mut self, now: DateTime<Utc>) -> bool {
        match self {
            Optimistic::Pending { deadline, .. } if now >= *deadline => {
                *self = Optimistic::Failed {
                    reason: Failure::TimedOut,
                };
                true
            }
            _ => false,
        }
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Optimistic::Failed { reason } => Some(reason),
            _ => None,
        }
    }
}
