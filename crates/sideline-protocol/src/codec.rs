//! Codec for encoding and decoding Sideline events.
//!
//! Events are JSON text frames. Decoding first reads the `type` tag so that
//! unknown event types can be reported by name instead of as a generic
//! parse failure.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::events::{Inbound, Outbound};

/// Maximum frame size (64 KiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Frame is not an object with a string `type` field.
    #[error("Frame has no type tag")]
    MissingType,

    /// Frame carries a type this side does not understand.
    #[error("Unknown event type: {0}")]
    UnknownType(String),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid frame data.
    #[error("Invalid frame: {0}")]
    Invalid(String),
}

/// Encode an outbound event.
///
/// # Errors
///
/// Returns an error if serialization fails or the frame is too large.
pub fn encode_outbound(event: &Outbound) -> Result<String, ProtocolError> {
    checked(serde_json::to_string(event)?)
}

/// Encode an inbound event (used by the alert service).
///
/// # Errors
///
/// Returns an error if serialization fails or the frame is too large.
pub fn encode_inbound(event: &Inbound) -> Result<String, ProtocolError> {
    checked(serde_json::to_string(event)?)
}

/// Decode an inbound event.
///
/// An `emergency_alert` whose envelope has no `data` object is read as if
/// the envelope itself were the payload.
///
/// # Errors
///
/// Returns an error if the frame is too large, untagged, of an unknown
/// type, or malformed.
pub fn decode_inbound(text: &str) -> Result<Inbound, ProtocolError> {
    let (kind, mut object) = split_tag(text)?;
    if !Inbound::TYPES.contains(&kind.as_str()) {
        return Err(ProtocolError::UnknownType(kind));
    }

    if kind == "emergency_alert" && !matches!(object.get("data"), Some(Value::Object(_))) {
        object.remove("type");
        let mut envelope = Map::new();
        envelope.insert("type".into(), Value::String(kind));
        if let Some(severity) = object.remove("severity") {
            envelope.insert("severity".into(), severity);
        }
        if let Some(message) = object.remove("message") {
            envelope.insert("message".into(), message);
        }
        envelope.insert("data".into(), Value::Object(object));
        return Ok(serde_json::from_value(Value::Object(envelope))?);
    }

    Ok(serde_json::from_value(Value::Object(object))?)
}

/// Decode an outbound event (used by the alert service).
///
/// # Errors
///
/// Returns an error if the frame is too large, untagged, of an unknown
/// type, or malformed.
pub fn decode_outbound(text: &str) -> Result<Outbound, ProtocolError> {
    let (kind, object) = split_tag(text)?;
    match kind.as_str() {
        "ping" | "emergency_response" => Ok(serde_json::from_value(Value::Object(object))?),
        _ => Err(ProtocolError::UnknownType(kind)),
    }
}

fn checked(text: String) -> Result<String, ProtocolError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    Ok(text)
}

fn split_tag(text: &str) -> Result<(String, Map<String, Value>), ProtocolError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }

    let object = match serde_json::from_str::<Value>(text)? {
        Value::Object(object) => object,
        _ => return Err(ProtocolError::MissingType),
    };

    match object.get("type") {
        Some(Value::String(kind)) => Ok((kind.clone(), object)),
        _ => Err(ProtocolError::MissingType),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EmergencyAlertData, EmergencyResponse, Responder, ResponderStatus};
    use crate::identity::{Identity, Role};

    #[test]
    fn test_decode_alert_scenario() {
        let text = r#"{"type":"emergency_alert","data":{"id":"e1","athlete_id":"42","athlete_name":"Mike Chen"}}"#;
        match decode_inbound(text).unwrap() {
            Inbound::EmergencyAlert { data, severity, .. } => {
                assert_eq!(data, EmergencyAlertData::new("e1", "42", "Mike Chen"));
                assert!(severity.is_none());
            }
            other => panic!("Expected EmergencyAlert, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_alert_from_service() {
        let text = r#"{
            "type": "emergency_alert",
            "severity": "critical",
            "message": "URGENT: Athlete Mike Chen needs immediate assistance!",
            "data": {
                "id": "emergency_1714572202.51",
                "type": "cardiac_anomaly",
                "athlete_id": "42",
                "athlete_name": "Mike Chen",
                "timestamp": "2024-05-01T14:03:22.512341",
                "location": {"latitude": 40.71, "longitude": -74.0},
                "vital_signs": {
                    "heart_rate": 180,
                    "blood_pressure": "160/100",
                    "oxygen_saturation": 88,
                    "respiratory_rate": 28
                },
                "status": "active"
            }
        }"#;

        match decode_inbound(text).unwrap() {
            Inbound::EmergencyAlert { data, severity, message } => {
                assert_eq!(severity.as_deref(), Some("critical"));
                assert!(message.unwrap().contains("Mike Chen"));
                assert_eq!(data.vital_signs.heart_rate, Some(180.0));
                assert_eq!(data.vital_signs.blood_pressure.as_deref(), Some("160/100"));
                assert_eq!(data.location.unwrap().accuracy, None);
                assert!(data.parsed_timestamp().is_some());
            }
            other => panic!("Expected EmergencyAlert, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_flat_alert() {
        let text = r#"{"type":"emergency_alert","severity":"critical","id":"e2","athlete_id":"9","athlete_name":"Ana"}"#;
        match decode_inbound(text).unwrap() {
            Inbound::EmergencyAlert { data, severity, .. } => {
                assert_eq!(data.id, "e2");
                assert_eq!(data.athlete_name, "Ana");
                assert_eq!(severity.as_deref(), Some("critical"));
            }
            other => panic!("Expected EmergencyAlert, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_update_scenario() {
        let text = r#"{"type":"emergency_update","emergency_id":"e1","responder":{"identityId":"7","role":"teammate","status":"responding","eta":3}}"#;
        assert_eq!(
            decode_inbound(text).unwrap(),
            Inbound::update(
                "e1",
                Responder::new("7", Role::Teammate, ResponderStatus::Responding, Some(3))
            )
        );
    }

    #[test]
    fn test_decode_unknown_type() {
        match decode_inbound(r#"{"type":"team_huddle","at":3}"#) {
            Err(ProtocolError::UnknownType(kind)) => assert_eq!(kind, "team_huddle"),
            other => panic!("Expected UnknownType error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_untagged_and_malformed() {
        assert!(matches!(decode_inbound("[1,2]"), Err(ProtocolError::MissingType)));
        assert!(matches!(decode_inbound(r#"{"type":7}"#), Err(ProtocolError::MissingType)));
        assert!(matches!(decode_inbound("{not json"), Err(ProtocolError::Json(_))));
        assert!(matches!(
            decode_inbound(r#"{"type":"emergency_resolved"}"#),
            Err(ProtocolError::Json(_))
        ));
    }

    #[test]
    fn test_frame_too_large() {
        let padding = "x".repeat(MAX_FRAME_SIZE);
        let text = format!(r#"{{"type":"error","message":"{padding}"}}"#);
        assert!(matches!(decode_inbound(&text), Err(ProtocolError::FrameTooLarge(_))));
        assert!(matches!(
            encode_inbound(&Inbound::error(padding)),
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn test_outbound_through_service_side() {
        let identity = Identity::new("7", Role::Teammate);
        let event = Outbound::from(
            EmergencyResponse::new("e1", &identity, ResponderStatus::Unavailable).with_eta(None),
        );
        let text = encode_outbound(&event).unwrap();
        assert!(!text.contains("\"eta\""));
        assert_eq!(decode_outbound(&text).unwrap(), event);

        let ping = decode_outbound(r#"{"type":"ping","timestamp":1714572202000}"#).unwrap();
        assert_eq!(ping, Outbound::Ping { timestamp: 1_714_572_202_000 });

        assert!(matches!(
            decode_outbound(r#"{"type":"emergency_alert"}"#),
            Err(ProtocolError::UnknownType(_))
        ));
    }
}
