use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::AppError;
use crate::transport::events::{InboundEvent, OutboundEvent};

pub const ACK_EVENT: &str = "ack";

/// One websocket text message: a named event, its payload and, when the
/// sender wants a reply, an ack id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<u64>,
}

impl Frame {
    pub fn outbound(event: &OutboundEvent, ack: Option<u64>) -> Result<Self, AppError> {
        let mut value = serde_json::to_value(event)
            .map_err(|err| AppError::Internal(format!("failed to encode {}: {err}", event.name())))?;
        let data = value.get_mut("data").map(Value::take).unwrap_or(Value::Null);

        Ok(Self {
            event: event.name().to_string(),
            data,
            ack,
        })
    }

    pub fn ack_reply(ack: u64, data: Value) -> Self {
        Self {
            event: ACK_EVENT.to_string(),
            data,
            ack: Some(ack),
        }
    }

    pub fn is_ack(&self) -> bool {
        self.event == ACK_EVENT
    }

    pub fn to_text(&self) -> Result<String, AppError> {
        serde_json::to_string(self)
            .map_err(|err| AppError::Internal(format!("failed to encode frame: {err}")))
    }

    pub fn parse(text: &str) -> Result<Self, AppError> {
        serde_json::from_str(text)
            .map_err(|err| AppError::Transport(format!("malformed frame: {err}")))
    }

    pub fn into_inbound(self) -> Result<InboundEvent, AppError> {
        let data = match self.data {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };
        let name = self.event;
        serde_json::from_value(serde_json::json!({ "event": name, "data": data }))
            .map_err(|err| AppError::Transport(format!("unreadable {name} event: {err}")))
    }
}

/// Body of an ack callback. Servers answer `{success, message?, ...}`; a reply
/// without a `success` flag counts as success unless it carries an error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AckReply {
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default, alias = "error")]
    pub message: Option<String>,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl AckReply {
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(_) => serde_json::from_value(value).unwrap_or_default(),
            Value::Bool(success) => Self {
                success: Some(success),
                ..Self::default()
            },
            _ => Self::default(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.success.unwrap_or(self.message.is_none())
    }

    /// Payload fields with the envelope flags stripped, for decoding into an
    /// event payload.
    pub fn payload(&self) -> Value {
        Value::Object(self.data.clone())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{AckReply, Frame};
    use crate::transport::events::{DriverRef, InboundEvent, OutboundEvent};

    #[test]
    fn outbound_frame_carries_name_data_and_ack() {
        let event = OutboundEvent::DriverGoOffline(DriverRef {
            driver_id: "d1".to_string(),
        });
        let frame = Frame::outbound(&event, Some(7)).unwrap();

        let value: serde_json::Value = serde_json::from_str(&frame.to_text().unwrap()).unwrap();
        assert_eq!(value, json!({ "event": "driverGoOffline", "data": { "driverId": "d1" }, "ack": 7 }));
    }

    #[test]
    fn empty_payload_decodes_for_unit_like_events() {
        let frame = Frame::parse(r#"{"event":"driverOfflineConfirmed"}"#).unwrap();
        let event = frame.into_inbound().unwrap();
        assert!(matches!(event, InboundEvent::DriverOfflineConfirmed(_)));
    }

    #[test]
    fn unknown_event_is_a_transport_error() {
        let frame = Frame::parse(r#"{"event":"surgePricing","data":{}}"#).unwrap();
        assert!(frame.into_inbound().is_err());
    }

    #[test]
    fn ack_reply_success_rules() {
        assert!(AckReply::from_value(json!({ "queuePosition": 3 })).is_success());
        assert!(!AckReply::from_value(json!({ "error": "ride taken" })).is_success());
        assert!(!AckReply::from_value(json!({ "success": false })).is_success());
        assert!(AckReply::from_value(json!(true)).is_success());

        let reply = AckReply::from_value(json!({ "success": true, "queuePosition": 3 }));
        assert_eq!(reply.payload(), json!({ "queuePosition": 3 }));
    }
}
