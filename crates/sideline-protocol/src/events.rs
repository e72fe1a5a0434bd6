//! Event types for the Sideline alert channel.
//!
//! Every message on the wire is a JSON object tagged by its `type` field.
//! [`Inbound`] events travel from the alert service to a device and
//! [`Outbound`] events travel the other way.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::{Identity, Role};

/// Milliseconds since the Unix epoch, as carried by `ping` frames.
#[must_use]
pub fn now_millis() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default()
}

/// RFC 3339 UTC timestamp with millisecond precision.
#[must_use]
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Geographic position of a device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
}

/// Vital signs captured when the anomaly was detected.
///
/// Carried through untouched; nothing here is validated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VitalSigns {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heart_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heart_rhythm: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blood_pressure: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oxygen_saturation: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub respiratory_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anomaly_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// Payload of an `emergency_alert` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyAlertData {
    /// Emergency identifier.
    pub id: String,
    /// Identity of the athlete in distress.
    pub athlete_id: String,
    /// Display name of the athlete.
    pub athlete_name: String,
    /// When the service raised the alert.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// Where the athlete was when the alert was raised.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    /// Vital-sign snapshot.
    #[serde(default)]
    pub vital_signs: VitalSigns,
    /// Service-side status, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl EmergencyAlertData {
    /// Create alert data with no timestamp, location or vitals.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        athlete_id: impl Into<String>,
        athlete_name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            athlete_id: athlete_id.into(),
            athlete_name: athlete_name.into(),
            timestamp: None,
            location: None,
            vital_signs: VitalSigns::default(),
            status: None,
        }
    }

    /// Parse the alert timestamp.
    ///
    /// Accepts RFC 3339 and naive ISO-8601 (read as UTC, which is what the
    /// service emits).
    #[must_use]
    pub fn parsed_timestamp(&self) -> Option<DateTime<Utc>> {
        let raw = self.timestamp.as_deref()?;
        if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
            return Some(ts.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| naive.and_utc())
    }
}

/// A responder's declared availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponderStatus {
    Responding,
    Unavailable,
}

impl ResponderStatus {
    /// Wire name of the status.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponderStatus::Responding => "responding",
            ResponderStatus::Unavailable => "unavailable",
        }
    }
}

/// A participant who declared a status for an emergency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Responder {
    /// Identity of the responder. The service spells it `user_id`.
    #[serde(rename = "user_id", alias = "identityId", alias = "identity_id")]
    pub identity_id: String,
    /// Role of the responder.
    pub role: Role,
    /// Declared status.
    pub status: ResponderStatus,
    /// Estimated arrival in minutes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<u32>,
}

impl Responder {
    /// Create a responder entry.
    #[must_use]
    pub fn new(
        identity_id: impl Into<String>,
        role: Role,
        status: ResponderStatus,
        eta: Option<u32>,
    ) -> Self {
        Self {
            identity_id: identity_id.into(),
            role,
            status,
            eta,
        }
    }
}

/// An event sent by the alert service to a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Inbound {
    /// A new medical emergency.
    #[serde(rename = "emergency_alert")]
    EmergencyAlert {
        data: EmergencyAlertData,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        severity: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// A responder declared a status for an emergency.
    #[serde(rename = "emergency_update")]
    EmergencyUpdate {
        emergency_id: String,
        responder: Responder,
    },

    /// The emergency is over.
    #[serde(rename = "emergency_resolved")]
    EmergencyResolved { emergency_id: String },

    /// Reply to a keepalive ping.
    #[serde(rename = "pong")]
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// The service could not process something we sent.
    #[serde(rename = "error")]
    Error { message: String },
}

impl Inbound {
    /// Wire type names of all inbound events.
    pub const TYPES: [&'static str; 5] = [
        "emergency_alert",
        "emergency_update",
        "emergency_resolved",
        "pong",
        "error",
    ];

    /// Get the wire type name.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Inbound::EmergencyAlert { .. } => "emergency_alert",
            Inbound::EmergencyUpdate { .. } => "emergency_update",
            Inbound::EmergencyResolved { .. } => "emergency_resolved",
            Inbound::Pong { .. } => "pong",
            Inbound::Error { .. } => "error",
        }
    }

    /// Create an `emergency_alert` event without severity or message.
    #[must_use]
    pub fn alert(data: EmergencyAlertData) -> Self {
        Inbound::EmergencyAlert {
            data,
            severity: None,
            message: None,
        }
    }

    /// Create an `emergency_update` event.
    #[must_use]
    pub fn update(emergency_id: impl Into<String>, responder: Responder) -> Self {
        Inbound::EmergencyUpdate {
            emergency_id: emergency_id.into(),
            responder,
        }
    }

    /// Create an `emergency_resolved` event.
    #[must_use]
    pub fn resolved(emergency_id: impl Into<String>) -> Self {
        Inbound::EmergencyResolved {
            emergency_id: emergency_id.into(),
        }
    }

    /// Create a `pong` event.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Inbound::Pong { timestamp }
    }

    /// Create an `error` event.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Inbound::Error {
            message: message.into(),
        }
    }
}

/// Payload of an `emergency_response` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyResponse {
    pub emergency_id: String,
    pub user_id: String,
    pub role: Role,
    pub status: ResponderStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<u32>,
    /// Subject of the emergency; lets the service route the update back to them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub athlete_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    pub timestamp: String,
}

impl EmergencyResponse {
    /// Create a response from `identity`, stamped with the current time.
    #[must_use]
    pub fn new(emergency_id: impl Into<String>, identity: &Identity, status: ResponderStatus) -> Self {
        Self {
            emergency_id: emergency_id.into(),
            user_id: identity.id.clone(),
            role: identity.role,
            status,
            eta: None,
            athlete_id: None,
            location: None,
            timestamp: now_rfc3339(),
        }
    }

    /// Set the estimated arrival in minutes.
    #[must_use]
    pub fn with_eta(mut self, eta: Option<u32>) -> Self {
        self.eta = eta;
        self
    }

    /// Set the subject of the emergency.
    #[must_use]
    pub fn with_athlete(mut self, athlete_id: Option<String>) -> Self {
        self.athlete_id = athlete_id;
        self
    }

    /// Attach the responder's location.
    #[must_use]
    pub fn with_location(mut self, location: Option<Location>) -> Self {
        self.location = location;
        self
    }
}

/// An event sent by a device to the alert service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Outbound {
    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping { timestamp: u64 },

    /// "I am responding" / "I am unavailable".
    #[serde(rename = "emergency_response")]
    EmergencyResponse(EmergencyResponse),
}

impl Outbound {
    /// Get the wire type name.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Outbound::Ping { .. } => "ping",
            Outbound::EmergencyResponse(_) => "emergency_response",
        }
    }

    /// Create a ping stamped with the current time.
    #[must_use]
    pub fn ping() -> Self {
        Outbound::Ping {
            timestamp: now_millis(),
        }
    }
}

impl From<EmergencyResponse> for Outbound {
    fn from(response: EmergencyResponse) -> Self {
        Outbound::EmergencyResponse(response)
    }
}
