//! Where an identity should be taken when an emergency arrives.

use sideline_protocol::{Identity, Role};

use crate::session::EmergencySession;

/// Destination for an identity, given a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// The identity is the athlete in distress.
    Subject,
    /// Staff expected to respond to the athlete's emergency.
    Respond { athlete_id: String },
    /// Show a notification only.
    NotifyOnly,
}

/// Decide the destination for `identity` when `session` is raised.
#[must_use]
pub fn destination(identity: &Identity, session: &EmergencySession) -> Destination {
    if identity.id == session.subject_id {
        return Destination::Subject;
    }
    match identity.role {
        Role::Coach | Role::Referee => Destination::Respond {
            athlete_id: session.subject_id.clone(),
        },
        Role::Athlete | Role::Teammate => Destination::NotifyOnly,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sideline_protocol::EmergencyAlertData;

    fn session() -> EmergencySession {
        EmergencySession::from_alert(&EmergencyAlertData::new("e1", "42", "Mike Chen"), None, None)
    }

    #[test]
    fn test_subject_goes_to_own_screen() {
        let identity = Identity::new("42", Role::Athlete);
        assert_eq!(destination(&identity, &session()), Destination::Subject);
    }

    #[test]
    fn test_staff_respond() {
        for role in [Role::Coach, Role::Referee] {
            assert_eq!(
                destination(&Identity::new("7", role), &session()),
                Destination::Respond {
                    athlete_id: "42".into()
                }
            );
        }
    }

    #[test]
    fn test_others_notified_only() {
        for role in [Role::Athlete, Role::Teammate] {
            assert_eq!(
                destination(&Identity::new("7", role), &session()),
                Destination::NotifyOnly
            );
        }
    }
}
