//! Emergency sessions and responder aggregation.
//!
//! A session is the tracked state of one in-progress emergency. Its
//! responder list is append-only; the summary is derived from it on demand.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sideline_protocol::{EmergencyAlertData, Location, Responder, ResponderStatus, VitalSigns};
use tracing::debug;

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Resolved,
}

/// State of one emergency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencySession {
    /// Emergency identifier.
    pub id: String,
    /// Identity of the athlete in distress.
    pub subject_id: String,
    /// Display name of the athlete.
    pub subject_name: String,
    /// When the alert was raised (receipt time if the service sent none).
    pub started_at: DateTime<Utc>,
    /// Where the athlete was.
    pub location: Option<Location>,
    /// Vital signs at the time of the alert.
    pub vital_snapshot: VitalSigns,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// Responders, in arrival order.
    pub responders: Vec<Responder>,
    /// Severity label from the alert envelope.
    pub severity: Option<String>,
    /// Human-readable message from the alert envelope.
    pub message: Option<String>,
}

impl EmergencySession {
    /// Create an active session from alert data.
    #[must_use]
    pub fn from_alert(
        data: &EmergencyAlertData,
        severity: Option<String>,
        message: Option<String>,
    ) -> Self {
        Self {
            id: data.id.clone(),
            subject_id: data.athlete_id.clone(),
            subject_name: data.athlete_name.clone(),
            started_at: data.parsed_timestamp().unwrap_or_else(Utc::now),
            location: data.location,
            vital_snapshot: data.vital_signs.clone(),
            status: SessionStatus::Active,
            responders: Vec::new(),
            severity,
            message,
        }
    }

    /// Refresh subject, vitals and location from a repeated alert.
    ///
    /// Responders and the start time are kept.
    pub fn refresh(
        &mut self,
        data: &EmergencyAlertData,
        severity: Option<String>,
        message: Option<String>,
    ) {
        self.subject_id = data.athlete_id.clone();
        self.subject_name = data.athlete_name.clone();
        if data.location.is_some() {
            self.location = data.location;
        }
        self.vital_snapshot = data.vital_signs.clone();
        if severity.is_some() {
            self.severity = severity;
        }
        if message.is_some() {
            self.message = message;
        }
    }

    /// Check if the session is still active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    /// Record a responder.
    ///
    /// With `dedupe` set, an entry from the same identity is updated in place
    /// and `false` is returned; otherwise the responder is appended.
    pub fn add_responder(&mut self, responder: Responder, dedupe: bool) -> bool {
        if dedupe {
            if let Some(existing) = self
                .responders
                .iter_mut()
                .find(|r| r.identity_id == responder.identity_id)
            {
                debug!(
                    emergency = %self.id,
                    responder = %responder.identity_id,
                    "Updating existing responder"
                );
                *existing = responder;
                return false;
            }
        }
        self.responders.push(responder);
        true
    }

    /// Latest declaration from `identity_id`, if any.
    #[must_use]
    pub fn responder(&self, identity_id: &str) -> Option<&Responder> {
        self.responders
            .iter()
            .rev()
            .find(|r| r.identity_id == identity_id)
    }

    /// Summarize the responder list.
    #[must_use]
    pub fn summary(&self) -> ResponderSummary {
        ResponderSummary::of(&self.responders)
    }
}

/// Aggregate view over a responder list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponderSummary {
    /// Entries with status `responding`.
    pub responding_count: usize,
    /// Entries with status `unavailable`.
    pub unavailable_count: usize,
    /// Smallest ETA among responding entries that declared one.
    pub earliest_eta: Option<u32>,
}

impl ResponderSummary {
    /// Summarize `responders`.
    #[must_use]
    pub fn of(responders: &[Responder]) -> Self {
        responders
            .iter()
            .fold(Self::default(), |mut summary, responder| {
                match responder.status {
                    ResponderStatus::Responding => {
                        summary.responding_count += 1;
                        if let Some(eta) = responder.eta {
                            summary.earliest_eta =
                                Some(summary.earliest_eta.map_or(eta, |best| best.min(eta)));
                        }
                    }
                    ResponderStatus::Unavailable => summary.unavailable_count += 1,
                }
                summary
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sideline_protocol::Role;

    fn responder(id: &str, status: ResponderStatus, eta: Option<u32>) -> Responder {
        Responder::new(id, Role::Teammate, status, eta)
    }

    #[test]
    fn test_session_from_alert() {
        let mut data = EmergencyAlertData::new("e1", "42", "Mike Chen");
        data.timestamp = Some("2024-05-01T14:03:22Z".into());
        let session = EmergencySession::from_alert(&data, Some("critical".into()), None);

        assert_eq!(session.id, "e1");
        assert_eq!(session.subject_id, "42");
        assert_eq!(session.subject_name, "Mike Chen");
        assert_eq!(session.started_at.to_rfc3339(), "2024-05-01T14:03:22+00:00");
        assert!(session.is_active());
        assert!(session.responders.is_empty());
    }

    #[test]
    fn test_session_without_timestamp_uses_receipt_time() {
        let before = Utc::now();
        let session =
            EmergencySession::from_alert(&EmergencyAlertData::new("e1", "42", "Mike"), None, None);
        assert!(session.started_at >= before);
    }

    #[test]
    fn test_add_responder_appends_duplicates() {
        let mut session =
            EmergencySession::from_alert(&EmergencyAlertData::new("e1", "42", "Mike"), None, None);

        assert!(session.add_responder(responder("7", ResponderStatus::Responding, Some(3)), false));
        assert!(session.add_responder(responder("7", ResponderStatus::Responding, Some(2)), false));
        assert_eq!(session.responders.len(), 2);
        assert_eq!(session.responder("7").unwrap().eta, Some(2));
    }

    #[test]
    fn test_add_responder_dedupe() {
        let mut session =
            EmergencySession::from_alert(&EmergencyAlertData::new("e1", "42", "Mike"), None, None);

        session.add_responder(responder("7", ResponderStatus::Responding, Some(3)), true);
        session.add_responder(responder("8", ResponderStatus::Unavailable, None), true);
        assert!(!session.add_responder(responder("7", ResponderStatus::Unavailable, None), true));

        assert_eq!(session.responders.len(), 2);
        assert_eq!(session.responders[0].identity_id, "7");
        assert_eq!(session.responders[0].status, ResponderStatus::Unavailable);
    }

    #[test]
    fn test_summary() {
        let responders = vec![
            responder("1", ResponderStatus::Responding, Some(5)),
            responder("2", ResponderStatus::Unavailable, Some(1)),
            responder("3", ResponderStatus::Responding, None),
            responder("4", ResponderStatus::Responding, Some(3)),
        ];
        let summary = ResponderSummary::of(&responders);

        assert_eq!(summary.responding_count, 3);
        assert_eq!(summary.unavailable_count, 1);
        // Unavailable ETAs never count
        assert_eq!(summary.earliest_eta, Some(3));
    }

    #[test]
    fn test_summary_without_etas() {
        let summary = ResponderSummary::of(&[responder("1", ResponderStatus::Responding, None)]);
        assert_eq!(summary.earliest_eta, None);
        assert_eq!(ResponderSummary::of(&[]), ResponderSummary::default());
    }
}
