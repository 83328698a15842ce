pub mod ack;
pub mod blacklist;
pub mod events;
pub mod frame;
pub mod socket;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::AppError;
use crate::transport::events::{DriverIdentity, OutboundEvent};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Connecting,
    Connected {
        reconnected: bool,
    },
    Disconnected {
        reason: String,
    },
    /// The server refused the token. No further attempts are made with it.
    AuthRejected,
    GaveUp {
        attempts: u32,
    },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected { .. })
    }

    /// No further connection attempts will be made.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionState::AuthRejected | ConnectionState::GaveUp { .. }
        )
    }

    /// Text to show when this state aborts an action waiting on the server.
    pub fn failure_reason(&self) -> Option<String> {
        match self {
            ConnectionState::Connecting | ConnectionState::Connected { .. } => None,
            ConnectionState::Disconnected { reason } => Some(format!("connection lost: {reason}")),
            ConnectionState::AuthRejected => {
                Some("session expired, please sign in again".to_string())
            }
            ConnectionState::GaveUp { attempts } => Some(format!(
                "could not reach dispatch server after {attempts} attempts"
            )),
        }
    }
}

/// Outbound half of the event channel, as seen by the driver session.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: OutboundEvent) -> Result<(), AppError>;

    /// Sends the event and returns a receiver resolved once with the remote ack.
    fn emit_with_ack(&self, event: OutboundEvent) -> Result<oneshot::Receiver<Value>, AppError>;

    /// Identity to re-announce after a reconnect.
    fn set_identity(&self, _identity: DriverIdentity) {}
}
