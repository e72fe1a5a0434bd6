//! Session tracker.
//!
//! The tracker owns the set of active emergencies and applies inbound
//! events to it in arrival order. It only reports facts; collaborators
//! decide what to show or where to navigate.

use serde::{Deserialize, Serialize};
use sideline_protocol::{EmergencyAlertData, Inbound, Responder};
use tracing::{debug, info, warn};

use crate::session::{EmergencySession, SessionStatus};

/// What happens to an active session when a different emergency is alerted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackerPolicy {
    /// Single slot: the new alert overwrites the active session.
    Replace,
    /// Ordered set keyed by emergency id: nothing in flight is lost.
    #[default]
    Retain,
}

/// Tracker configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Slot policy for concurrent alerts.
    #[serde(default)]
    pub policy: TrackerPolicy,
    /// Key responders by identity instead of appending every declaration.
    #[serde(default)]
    pub dedupe_responders: bool,
}

/// Why an event left the tracker untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    /// The event referenced an emergency that is not tracked.
    UnknownEmergency(String),
    /// The event does not concern sessions (keepalive, service errors).
    NotSessionEvent(&'static str),
}

/// A fact produced by applying an event.
///
/// Sessions are snapshots; mutating them does not affect the tracker.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionChange {
    /// A new emergency is being tracked.
    Created(EmergencySession),
    /// A new emergency overwrote the previous one (`Replace` policy).
    Replaced {
        previous: EmergencySession,
        current: EmergencySession,
    },
    /// A repeated alert refreshed an already tracked emergency.
    Updated(EmergencySession),
    /// A responder declared a status.
    ResponderAdded {
        session: EmergencySession,
        responder: Responder,
    },
    /// The emergency is over and is no longer tracked.
    Resolved(EmergencySession),
    /// Nothing changed.
    Ignored(IgnoreReason),
}

impl SessionChange {
    /// The session this change concerns, if any.
    #[must_use]
    pub fn session(&self) -> Option<&EmergencySession> {
        match self {
            SessionChange::Created(session)
            | SessionChange::Updated(session)
            | SessionChange::Resolved(session)
            | SessionChange::ResponderAdded { session, .. } => Some(session),
            SessionChange::Replaced { current, .. } => Some(current),
            SessionChange::Ignored(_) => None,
        }
    }

    /// Check if the change left the tracker untouched.
    #[must_use]
    pub fn is_ignored(&self) -> bool {
        matches!(self, SessionChange::Ignored(_))
    }

    /// Short label for logs and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            SessionChange::Created(_) => "created",
            SessionChange::Replaced { .. } => "replaced",
            SessionChange::Updated(_) => "updated",
            SessionChange::ResponderAdded { .. } => "responder_added",
            SessionChange::Resolved(_) => "resolved",
            SessionChange::Ignored(_) => "ignored",
        }
    }
}

/// Tracks active emergency sessions.
#[derive(Debug, Default)]
pub struct SessionTracker {
    config: TrackerConfig,
    /// Active sessions, least recently alerted first.
    sessions: Vec<EmergencySession>,
}

impl SessionTracker {
    /// Create a tracker with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a tracker with a custom configuration.
    #[must_use]
    pub fn with_config(config: TrackerConfig) -> Self {
        Self {
            config,
            sessions: Vec::new(),
        }
    }

    /// Get the configuration.
    #[must_use]
    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Apply an inbound event.
    pub fn apply(&mut self, event: &Inbound) -> SessionChange {
        match event {
            Inbound::EmergencyAlert {
                data,
                severity,
                message,
            } => self.alert(data, severity.clone(), message.clone()),
            Inbound::EmergencyUpdate {
                emergency_id,
                responder,
            } => self.add_responder(emergency_id, responder.clone()),
            Inbound::EmergencyResolved { emergency_id } => self.resolve(emergency_id),
            Inbound::Pong { .. } | Inbound::Error { .. } => {
                SessionChange::Ignored(IgnoreReason::NotSessionEvent(event.kind()))
            }
        }
    }

    /// The session collaborators should show: the most recently alerted one.
    #[must_use]
    pub fn current(&self) -> Option<&EmergencySession> {
        self.sessions.last()
    }

    /// All active sessions, least recently alerted first.
    #[must_use]
    pub fn sessions(&self) -> &[EmergencySession] {
        &self.sessions
    }

    /// Look up a session by emergency id.
    #[must_use]
    pub fn get(&self, emergency_id: &str) -> Option<&EmergencySession> {
        self.sessions.iter().find(|s| s.id == emergency_id)
    }

    /// Number of active sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check if nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drop a session the collaborator knows is over.
    pub fn resolve_locally(&mut self, emergency_id: &str) -> SessionChange {
        self.resolve(emergency_id)
    }

    fn alert(
        &mut self,
        data: &EmergencyAlertData,
        severity: Option<String>,
        message: Option<String>,
    ) -> SessionChange {
        if let Some(index) = self.sessions.iter().position(|s| s.id == data.id) {
            debug!(emergency = %data.id, "Refreshing tracked emergency");
            // A re-alert makes the session the most recent one
            let mut existing = self.sessions.remove(index);
            existing.refresh(data, severity, message);
            self.sessions.push(existing.clone());
            return SessionChange::Updated(existing);
        }

        let session = EmergencySession::from_alert(data, severity, message);
        info!(
            emergency = %session.id,
            subject = %session.subject_id,
            "Emergency alert received"
        );

        let previous = match self.config.policy {
            TrackerPolicy::Replace => self.sessions.drain(..).last(),
            TrackerPolicy::Retain => None,
        };
        self.sessions.push(session.clone());

        match previous {
            Some(previous) => {
                warn!(
                    previous = %previous.id,
                    current = %session.id,
                    "Active emergency overwritten by new alert"
                );
                SessionChange::Replaced {
                    previous,
                    current: session,
                }
            }
            None => SessionChange::Created(session),
        }
    }

    fn add_responder(&mut self, emergency_id: &str, responder: Responder) -> SessionChange {
        let dedupe = self.config.dedupe_responders;
        let Some(session) = self.sessions.iter_mut().find(|s| s.id == emergency_id) else {
            debug!(emergency = %emergency_id, "Update for untracked emergency ignored");
            return SessionChange::Ignored(IgnoreReason::UnknownEmergency(emergency_id.into()));
        };

        session.add_responder(responder.clone(), dedupe);
        debug!(
            emergency = %emergency_id,
            responder = %responder.identity_id,
            status = responder.status.as_str(),
            "Responder recorded"
        );
        SessionChange::ResponderAdded {
            session: session.clone(),
            responder,
        }
    }

    fn resolve(&mut self, emergency_id: &str) -> SessionChange {
        let Some(index) = self.sessions.iter().position(|s| s.id == emergency_id) else {
            debug!(emergency = %emergency_id, "Resolution for untracked emergency ignored");
            return SessionChange::Ignored(IgnoreReason::UnknownEmergency(emergency_id.into()));
        };

        let mut session = self.sessions.remove(index);
        session.status = SessionStatus::Resolved;
        info!(emergency = %emergency_id, "Emergency resolved");
        SessionChange::Resolved(session)
    }
}
