//! Dispatch facade.
//!
//! The one handle collaborators hold. It owns the channel manager, the
//! session tracker and the cadence engine; a pump task applies inbound
//! events to the tracker in arrival order and fans the resulting changes
//! out to subscribers.

use parking_lot::RwLock;
use sideline_core::{
    destination, CadenceEngine, CadenceParams, Destination, EmergencySession, ResponderSummary,
    SessionChange, SessionTracker, TrackerConfig,
};
use sideline_protocol::{EmergencyResponse, Identity, Location, ResponderStatus};
use sideline_transport::Connector;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::{ChannelConfig, ChannelEvent, ChannelManager, ChannelState, SendError};
use crate::metrics;

const CHANGE_CAPACITY: usize = 256;

/// Settings for the components a dispatcher owns.
#[derive(Debug, Clone, Default)]
pub struct DispatchOptions {
    pub channel: ChannelConfig,
    pub tracker: TrackerConfig,
    pub cadence: CadenceParams,
}

/// Entry point for collaborators.
pub struct Dispatcher {
    identity: Identity,
    channel: ChannelManager,
    tracker: Arc<RwLock<SessionTracker>>,
    changes: broadcast::Sender<SessionChange>,
    cadence: CadenceEngine,
    location: RwLock<Option<Location>>,
    pump: JoinHandle<()>,
}

impl Dispatcher {
    /// Create a dispatcher with default settings.
    ///
    /// Must be called within a Tokio runtime.
    #[must_use]
    pub fn new(identity: Identity, connector: Arc<dyn Connector>) -> Self {
        Self::with_options(identity, connector, DispatchOptions::default())
    }

    /// Create a dispatcher.
    ///
    /// Must be called within a Tokio runtime.
    #[must_use]
    pub fn with_options(
        identity: Identity,
        connector: Arc<dyn Connector>,
        options: DispatchOptions,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        let tracker = Arc::new(RwLock::new(SessionTracker::with_config(options.tracker)));

        let pump = tokio::spawn(pump(
            identity.clone(),
            event_rx,
            Arc::clone(&tracker),
            changes.clone(),
        ));

        Self {
            channel: ChannelManager::new(options.channel, connector, event_tx),
            identity,
            tracker,
            changes,
            cadence: CadenceEngine::new(options.cadence),
            location: RwLock::new(None),
            pump,
        }
    }

    /// Identity this dispatcher acts for.
    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Open the alert channel.
    pub fn connect(&self) {
        self.channel.connect(self.identity.clone());
    }

    /// Close the alert channel. Closing twice is a no-op.
    pub async fn close(&self) {
        self.channel.close().await;
    }

    /// Current channel state.
    #[must_use]
    pub fn channel_state(&self) -> ChannelState {
        self.channel.state()
    }

    /// Watch channel state changes.
    #[must_use]
    pub fn watch_channel(&self) -> watch::Receiver<ChannelState> {
        self.channel.watch_state()
    }

    /// Receive every session change from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionChange> {
        self.changes.subscribe()
    }

    /// Call `handler` for every session change until the returned
    /// subscription is dropped or unsubscribed.
    pub fn on_change<F>(&self, mut handler: F) -> Subscription
    where
        F: FnMut(&SessionChange) + Send + 'static,
    {
        let mut rx = self.changes.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(change) => handler(&change),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Session change handler lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Subscription {
            handle: Some(handle),
        }
    }

    /// Declare this identity's status for an emergency.
    ///
    /// The response carries the subject of the emergency, when tracked, and
    /// the last known device location. It is not retried.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Rejected`] when the channel is not open, or a
    /// transport error when the write fails.
    pub async fn respond(
        &self,
        session_id: &str,
        status: ResponderStatus,
        eta: Option<u32>,
    ) -> Result<(), SendError> {
        let athlete_id = self
            .tracker
            .read()
            .get(session_id)
            .map(|session| session.subject_id.clone());
        let location = *self.location.read();

        let response = EmergencyResponse::new(session_id, &self.identity, status)
            .with_eta(eta)
            .with_athlete(athlete_id)
            .with_location(location);

        info!(emergency = %session_id, status = status.as_str(), ?eta, "Responding");
        self.channel.send(&response.into()).await
    }

    /// Most recent active emergency.
    #[must_use]
    pub fn current(&self) -> Option<EmergencySession> {
        self.tracker.read().current().cloned()
    }

    /// All active emergencies, least recently alerted first.
    #[must_use]
    pub fn sessions(&self) -> Vec<EmergencySession> {
        self.tracker.read().sessions().to_vec()
    }

    /// Responder summary of the current emergency.
    #[must_use]
    pub fn summary(&self) -> Option<ResponderSummary> {
        self.tracker.read().current().map(EmergencySession::summary)
    }

    /// Where this identity belongs for the current emergency.
    #[must_use]
    pub fn destination(&self) -> Option<Destination> {
        self.tracker
            .read()
            .current()
            .map(|session| destination(&self.identity, session))
    }

    /// Stop tracking an emergency without waiting for the service.
    pub fn resolve_locally(&self, session_id: &str) -> SessionChange {
        // Publish under the lock so subscribers see changes in apply order
        let mut tracker = self.tracker.write();
        let change = tracker.resolve_locally(session_id);
        if !change.is_ignored() {
            metrics::record_session_change(change.kind());
            let _ = self.changes.send(change.clone());
        }
        change
    }

    /// Update the device location attached to responses.
    pub fn set_location(&self, location: Option<Location>) {
        *self.location.write() = location;
    }

    /// CPR cadence engine.
    #[must_use]
    pub fn cadence(&self) -> &CadenceEngine {
        &self.cadence
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

async fn pump(
    identity: Identity,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    tracker: Arc<RwLock<SessionTracker>>,
    changes: broadcast::Sender<SessionChange>,
) {
    while let Some(event) = events.recv().await {
        let inbound = match event {
            ChannelEvent::State(state) => {
                debug!(%state, "Channel state changed");
                continue;
            }
            ChannelEvent::Inbound(inbound) => inbound,
        };

        let mut guard = tracker.write();
        let change = guard.apply(&inbound);
        if let SessionChange::Ignored(reason) = &change {
            debug!(kind = inbound.kind(), ?reason, "Event left sessions untouched");
            continue;
        }

        metrics::record_session_change(change.kind());
        if let Some(session) = change.session() {
            info!(
                change = change.kind(),
                emergency = %session.id,
                destination = ?destination(&identity, session),
                "Session changed"
            );
        }
        let _ = changes.send(change);
        drop(guard);
    }
}

/// Handle for an [`Dispatcher::on_change`] handler.
#[must_use = "dropping the subscription stops delivery"]
pub struct Subscription {
    handle: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Stop delivering changes to the handler.
    pub fn unsubscribe(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stop();
    }
}
