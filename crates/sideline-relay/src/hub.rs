//! Connection registry and emergency registry.
//!
//! Connections are grouped by channel key (`id:role`); one identity may hold
//! several sockets. Every event is encoded once and the text is shared by all
//! recipients.

use crate::metrics;
use dashmap::DashMap;
use serde::Deserialize;
use sideline_protocol::events::{now_millis, now_rfc3339};
use sideline_protocol::{
    codec, EmergencyAlertData, Identity, Inbound, Location, Responder, ResponderStatus, Role,
    VitalSigns,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Frames queued for one socket.
pub type Outbox = mpsc::UnboundedReceiver<Arc<str>>;

/// Roles that receive the staff variant of a new alert.
const STAFF_ROLES: [Role; 3] = [Role::Coach, Role::Referee, Role::Teammate];

/// Roles that see every responder update.
const COORDINATOR_ROLES: [Role; 2] = [Role::Coach, Role::Referee];

struct Peer {
    id: u64,
    tx: mpsc::UnboundedSender<Arc<str>>,
}

/// A registered socket. Pass it back to [`Hub::unregister`] on disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerHandle {
    pub identity: Identity,
    id: u64,
}

/// Body of `POST /trigger-emergency`.
#[derive(Debug, Clone, Deserialize)]
pub struct TriggerRequest {
    pub athlete_id: String,
    pub athlete_name: String,
    #[serde(default)]
    pub location: Option<Location>,
    #[serde(default)]
    pub vital_signs: Option<VitalSigns>,
}

/// An `emergency_response` as sent by a device.
///
/// Read leniently: only the emergency id is required and a missing status
/// counts as responding.
#[derive(Debug, Clone, Deserialize)]
pub struct ResponseFrame {
    pub emergency_id: String,
    #[serde(default)]
    pub status: Option<ResponderStatus>,
    #[serde(default)]
    pub eta: Option<u32>,
    #[serde(default)]
    pub athlete_id: Option<String>,
}

/// Shared relay state.
#[derive(Default)]
pub struct Hub {
    peers: DashMap<String, Vec<Peer>>,
    emergencies: DashMap<String, EmergencyAlertData>,
    next_peer: AtomicU64,
}

impl Hub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a socket for `identity`.
    pub fn register(&self, identity: Identity) -> (PeerHandle, Outbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_peer.fetch_add(1, Ordering::Relaxed);
        self.peers
            .entry(identity.channel_key())
            .or_default()
            .push(Peer { id, tx });
        debug!(%identity, peer = id, "Registered");
        (PeerHandle { identity, id }, rx)
    }

    /// Remove a socket. Keys with no sockets left are dropped.
    pub fn unregister(&self, handle: &PeerHandle) {
        let key = handle.identity.channel_key();
        if let Some(mut peers) = self.peers.get_mut(&key) {
            peers.retain(|peer| peer.id != handle.id);
        }
        self.peers.remove_if(&key, |_, peers| peers.is_empty());
        debug!(identity = %handle.identity, peer = handle.id, "Unregistered");
    }

    /// Number of open sockets.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.peers.iter().map(|entry| entry.value().len()).sum()
    }

    /// Send an event to every socket of one identity.
    pub fn send_to(&self, identity: &Identity, event: &Inbound) -> usize {
        let Some(text) = encode(event) else { return 0 };
        let key = identity.channel_key();
        self.peers
            .get(&key)
            .map_or(0, |peers| deliver(peers.value(), &text))
    }

    /// Send an event to every socket whose identity has one of `roles`.
    pub fn broadcast_roles(&self, roles: &[Role], event: &Inbound) -> usize {
        let Some(text) = encode(event) else { return 0 };
        let suffixes: Vec<String> = roles.iter().map(|role| format!(":{}", role)).collect();
        self.peers
            .iter()
            .filter(|entry| suffixes.iter().any(|suffix| entry.key().ends_with(suffix)))
            .map(|entry| deliver(entry.value(), &text))
            .sum()
    }

    /// Send an event to every socket.
    pub fn broadcast_all(&self, event: &Inbound) -> usize {
        self.broadcast_roles(&Role::ALL, event)
    }

    /// Register a new emergency and alert the athlete and staff.
    pub fn trigger(&self, request: TriggerRequest) -> EmergencyAlertData {
        let vital_signs = request.vital_signs.unwrap_or_else(|| VitalSigns {
            heart_rate: Some(180.0),
            blood_pressure: Some("160/100".into()),
            oxygen_saturation: Some(88.0),
            respiratory_rate: Some(28.0),
            ..Default::default()
        });
        let data = EmergencyAlertData {
            id: format!("emergency_{}", now_millis()),
            athlete_id: request.athlete_id,
            athlete_name: request.athlete_name,
            timestamp: Some(now_rfc3339()),
            location: request.location,
            vital_signs,
            status: Some("active".into()),
        };
        self.emergencies.insert(data.id.clone(), data.clone());
        metrics::record_emergency("triggered", self.emergencies.len());

        let athlete = Identity::new(data.athlete_id.clone(), Role::Athlete);
        let to_athlete = Inbound::EmergencyAlert {
            data: data.clone(),
            severity: Some("critical".into()),
            message: Some("Medical emergency detected. Help is on the way.".into()),
        };
        let to_staff = Inbound::EmergencyAlert {
            data: data.clone(),
            severity: Some("critical".into()),
            message: Some(format!(
                "URGENT: Athlete {} needs immediate assistance!",
                data.athlete_name
            )),
        };

        let mut recipients = self.send_to(&athlete, &to_athlete);
        recipients += self.broadcast_roles(&STAFF_ROLES, &to_staff);
        info!(emergency = %data.id, athlete = %athlete, recipients, "Emergency triggered");
        data
    }

    /// Active emergencies by id.
    #[must_use]
    pub fn active(&self) -> BTreeMap<String, EmergencyAlertData> {
        self.emergencies
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Resolve an emergency. Returns `false` if it was not active.
    pub fn resolve(&self, emergency_id: &str) -> bool {
        if self.emergencies.remove(emergency_id).is_none() {
            return false;
        }
        metrics::record_emergency("resolved", self.emergencies.len());
        let recipients = self.broadcast_all(&Inbound::resolved(emergency_id));
        info!(emergency = %emergency_id, recipients, "Emergency resolved");
        true
    }

    /// Relay a device's response as an `emergency_update`.
    ///
    /// The responder is always the sender's own identity.
    pub fn respond(&self, from: &Identity, frame: ResponseFrame) -> usize {
        let responder = Responder::new(
            from.id.clone(),
            from.role,
            frame.status.unwrap_or(ResponderStatus::Responding),
            frame.eta,
        );
        let update = Inbound::update(frame.emergency_id.clone(), responder);

        let mut recipients = 0;
        if let Some(athlete_id) = frame.athlete_id {
            recipients += self.send_to(&Identity::new(athlete_id, Role::Athlete), &update);
        }
        recipients += self.broadcast_roles(&COORDINATOR_ROLES, &update);
        debug!(emergency = %frame.emergency_id, responder = %from, recipients, "Response relayed");
        recipients
    }
}

fn encode(event: &Inbound) -> Option<Arc<str>> {
    match codec::encode_inbound(event) {
        Ok(text) => {
            metrics::record_message(event.kind(), "outbound");
            Some(Arc::from(text))
        }
        Err(e) => {
            warn!(kind = event.kind(), error = %e, "Failed to encode event");
            metrics::record_error("encode");
            None
        }
    }
}

fn deliver(peers: &[Peer], text: &Arc<str>) -> usize {
    peers
        .iter()
        .filter(|peer| peer.tx.send(Arc::clone(text)).is_ok())
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(text: Option<Arc<str>>) -> Inbound {
        codec::decode_inbound(&text.unwrap()).unwrap()
    }

    fn trigger_for(hub: &Hub, athlete_id: &str) -> EmergencyAlertData {
        hub.trigger(TriggerRequest {
            athlete_id: athlete_id.into(),
            athlete_name: "Mike Chen".into(),
            location: None,
            vital_signs: None,
        })
    }

    #[test]
    fn test_register_and_unregister() {
        let hub = Hub::new();
        let coach = Identity::new("5", Role::Coach);
        let (first, _rx1) = hub.register(coach.clone());
        let (second, _rx2) = hub.register(coach.clone());
        assert_eq!(hub.connection_count(), 2);

        hub.unregister(&first);
        assert_eq!(hub.connection_count(), 1);
        hub.unregister(&second);
        assert_eq!(hub.connection_count(), 0);
        assert!(hub.peers.is_empty());
    }

    #[test]
    fn test_trigger_alerts_athlete_and_staff() {
        let hub = Hub::new();
        let (_a, mut athlete) = hub.register(Identity::new("42", Role::Athlete));
        let (_o, mut other_athlete) = hub.register(Identity::new("43", Role::Athlete));
        let (_c, mut coach) = hub.register(Identity::new("5", Role::Coach));
        let (_t, mut teammate) = hub.register(Identity::new("7", Role::Teammate));

        let data = trigger_for(&hub, "42");
        assert!(data.id.starts_with("emergency_"));
        assert_eq!(data.status.as_deref(), Some("active"));
        assert_eq!(data.vital_signs.heart_rate, Some(180.0));
        assert!(hub.active().contains_key(&data.id));

        match decode(athlete.try_recv().ok()) {
            Inbound::EmergencyAlert { data: got, message, severity } => {
                assert_eq!(got, data);
                assert_eq!(severity.as_deref(), Some("critical"));
                assert_eq!(message.as_deref(), Some("Medical emergency detected. Help is on the way."));
            }
            other => panic!("Expected alert, got {:?}", other),
        }
        for rx in [&mut coach, &mut teammate] {
            match decode(rx.try_recv().ok()) {
                Inbound::EmergencyAlert { message, .. } => assert_eq!(
                    message.as_deref(),
                    Some("URGENT: Athlete Mike Chen needs immediate assistance!")
                ),
                other => panic!("Expected alert, got {:?}", other),
            }
        }
        assert!(other_athlete.try_recv().is_err());
    }

    #[test]
    fn test_respond_routes_to_subject_and_coordinators() {
        let hub = Hub::new();
        let (_a, mut athlete) = hub.register(Identity::new("42", Role::Athlete));
        let (_r, mut referee) = hub.register(Identity::new("8", Role::Referee));
        let (_t, mut teammate) = hub.register(Identity::new("7", Role::Teammate));

        let frame = ResponseFrame {
            emergency_id: "e1".into(),
            status: None,
            eta: Some(3),
            athlete_id: Some("42".into()),
        };
        assert_eq!(hub.respond(&Identity::new("7", Role::Teammate), frame), 2);

        let expected = Inbound::update(
            "e1",
            Responder::new("7", Role::Teammate, ResponderStatus::Responding, Some(3)),
        );
        assert_eq!(decode(athlete.try_recv().ok()), expected);
        assert_eq!(decode(referee.try_recv().ok()), expected);
        assert!(teammate.try_recv().is_err());
    }

    #[test]
    fn test_resolve_broadcasts_to_everyone() {
        let hub = Hub::new();
        let data = trigger_for(&hub, "42");
        let (_t, mut teammate) = hub.register(Identity::new("7", Role::Teammate));
        let (_a, mut athlete) = hub.register(Identity::new("43", Role::Athlete));

        assert!(hub.resolve(&data.id));
        assert!(!hub.resolve(&data.id));
        assert!(hub.active().is_empty());
        for rx in [&mut teammate, &mut athlete] {
            assert_eq!(decode(rx.try_recv().ok()), Inbound::resolved(data.id.clone()));
        }
    }

    #[test]
    fn test_closed_receiver_is_not_counted() {
        let hub = Hub::new();
        let coach = Identity::new("5", Role::Coach);
        let (_handle, rx) = hub.register(coach.clone());
        drop(rx);
        assert_eq!(hub.send_to(&coach, &Inbound::resolved("e1")), 0);
    }
}
