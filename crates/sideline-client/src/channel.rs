//! Channel manager.
//!
//! Keeps one supervised connection to the alert service per identity. A
//! supervisor task owns the connection together with its keepalive and
//! reconnect timers; cancelling the task tears all of them down at once.
//!
//! Every state write and every forwarded event carries the generation of
//! the supervisor that produced it. `connect` and `close` bump the
//! generation first, so a superseded supervisor can no longer write.

use parking_lot::{Mutex, RwLock};
use sideline_protocol::{Identity, Inbound, Outbound};
use sideline_transport::{Connection, Connector, TransportError};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics;

/// Channel timing.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelConfig {
    /// Interval between keepalive pings while open.
    pub keepalive_interval: Duration,
    /// Delay before the first reconnect after a loss.
    pub reconnect_delay: Duration,
    /// Upper bound for the reconnect delay.
    pub reconnect_max_delay: Duration,
    /// Growth factor per consecutive retry; 1.0 keeps the delay fixed.
    pub backoff_multiplier: f64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(5),
            reconnect_max_delay: Duration::from_secs(60),
            backoff_multiplier: 1.0,
        }
    }
}

impl ChannelConfig {
    /// Delay before the reconnect that follows `retries` earlier retries
    /// since the channel was last open.
    #[must_use]
    pub fn reconnect_delay_for(&self, retries: u32) -> Duration {
        let cap = self.reconnect_max_delay.max(self.reconnect_delay);
        let multiplier = self.backoff_multiplier.max(1.0);
        let exponent = i32::try_from(retries).unwrap_or(i32::MAX);
        let secs = self.reconnect_delay.as_secs_f64() * multiplier.powi(exponent);

        if secs.is_finite() && secs < cap.as_secs_f64() {
            Duration::from_secs_f64(secs)
        } else {
            cap
        }
    }
}

/// Why the channel is disconnected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `close()` was called.
    Closed,
    /// A newer `connect()` took over.
    Superseded,
    /// An open connection ended unexpectedly.
    Lost(String),
    /// A connection attempt failed.
    ConnectFailed(String),
}

/// Channel lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    /// No connection. `None` before the first connect.
    Disconnected(Option<DisconnectReason>),
    /// A connection attempt is in progress.
    Connecting,
    /// Connected; sends go to the wire.
    Open,
}

impl ChannelState {
    /// Check if the channel is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self, ChannelState::Open)
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelState::Disconnected(None) => write!(f, "disconnected"),
            ChannelState::Disconnected(Some(reason)) => write!(f, "disconnected ({:?})", reason),
            ChannelState::Connecting => write!(f, "connecting"),
            ChannelState::Open => write!(f, "open"),
        }
    }
}

/// Something the channel reports, in the order it happened.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// The channel changed state.
    State(ChannelState),
    /// An event arrived from the alert service.
    Inbound(Inbound),
}

/// Outbound send failure.
#[derive(Debug, Error)]
pub enum SendError {
    /// The channel was not open; nothing was written.
    #[error("Channel is not open")]
    Rejected,

    /// The write itself failed.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

struct Inner {
    generation: Mutex<u64>,
    state: watch::Sender<ChannelState>,
    connection: RwLock<Option<Arc<dyn Connection>>>,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl Inner {
    fn advance(&self) -> u64 {
        let mut generation = self.generation.lock();
        *generation += 1;
        *generation
    }

    fn publish(&self, generation: u64, state: ChannelState) -> bool {
        let current = self.generation.lock();
        if *current != generation {
            return false;
        }
        self.set_state(state);
        true
    }

    // Caller holds the generation lock.
    fn set_state(&self, state: ChannelState) {
        debug!(%state, "Channel state");
        metrics::set_channel_open(state.is_open());
        self.state.send_replace(state.clone());
        let _ = self.events.send(ChannelEvent::State(state));
    }

    fn attach(&self, generation: u64, connection: Arc<dyn Connection>) -> bool {
        let current = self.generation.lock();
        if *current != generation {
            return false;
        }
        *self.connection.write() = Some(connection);
        self.set_state(ChannelState::Open);
        true
    }

    fn detach(&self, connection: &Arc<dyn Connection>) {
        let mut slot = self.connection.write();
        if slot.as_ref().is_some_and(|c| c.id() == connection.id()) {
            *slot = None;
        }
    }

    fn deliver(&self, generation: u64, event: Inbound) -> bool {
        let current = self.generation.lock();
        *current == generation && self.events.send(ChannelEvent::Inbound(event)).is_ok()
    }
}

struct Supervisor {
    identity: Identity,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns the alert channel for one identity at a time.
pub struct ChannelManager {
    config: ChannelConfig,
    connector: Arc<dyn Connector>,
    inner: Arc<Inner>,
    supervisor: Mutex<Option<Supervisor>>,
}

impl ChannelManager {
    /// Create a manager. State changes and inbound events are delivered on
    /// `events` in arrival order.
    #[must_use]
    pub fn new(
        config: ChannelConfig,
        connector: Arc<dyn Connector>,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Self {
        let (state, _) = watch::channel(ChannelState::Disconnected(None));
        Self {
            config,
            connector,
            inner: Arc::new(Inner {
                generation: Mutex::new(0),
                state,
                connection: RwLock::new(None),
                events,
            }),
            supervisor: Mutex::new(None),
        }
    }

    /// Get the channel configuration.
    #[must_use]
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.inner.state.borrow().clone()
    }

    /// Watch state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.inner.state.subscribe()
    }

    /// Identity of the running supervisor, if any.
    #[must_use]
    pub fn identity(&self) -> Option<Identity> {
        self.supervisor.lock().as_ref().map(|s| s.identity.clone())
    }

    /// Open the channel for `identity`, superseding any previous one.
    ///
    /// Returns immediately; progress is reported through state changes.
    /// Must be called within a Tokio runtime.
    pub fn connect(&self, identity: Identity) {
        let cancel = CancellationToken::new();
        let mut supervisor = self.supervisor.lock();
        let generation = self.inner.advance();

        if let Some(previous) = supervisor.take() {
            info!(identity = %previous.identity, "Superseding alert channel");
            previous.cancel.cancel();
            self.inner.connection.write().take();
            self.inner
                .publish(generation, ChannelState::Disconnected(Some(DisconnectReason::Superseded)));
        }

        info!(%identity, transport = self.connector.name(), "Connecting alert channel");
        let handle = tokio::spawn(supervise(
            Arc::clone(&self.inner),
            Arc::clone(&self.connector),
            self.config.clone(),
            identity.clone(),
            generation,
            cancel.clone(),
        ));

        *supervisor = Some(Supervisor {
            identity,
            cancel,
            handle,
        });
    }

    /// Close the channel and cancel every timer it owns, including a
    /// pending reconnect. Closing twice is a no-op.
    pub async fn close(&self) {
        let (generation, previous) = {
            let mut supervisor = self.supervisor.lock();
            (self.inner.advance(), supervisor.take())
        };

        let Some(previous) = previous else {
            debug!("Alert channel already closed");
            return;
        };

        self.inner.connection.write().take();
        previous.cancel.cancel();
        if let Err(e) = previous.handle.await {
            if e.is_panic() {
                warn!("Channel supervisor panicked: {}", e);
            }
        }

        self.inner
            .publish(generation, ChannelState::Disconnected(Some(DisconnectReason::Closed)));
        info!(identity = %previous.identity, "Alert channel closed");
    }

    /// Send an event on the open channel.
    ///
    /// Nothing is queued: when the channel is not open the event is
    /// dropped and [`SendError::Rejected`] is returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel is not open or the write fails.
    pub async fn send(&self, event: &Outbound) -> Result<(), SendError> {
        let connection = self.inner.connection.read().clone();
        let Some(connection) = connection.filter(|c| c.is_open()) else {
            debug!(kind = event.kind(), "Channel not open, dropping outbound event");
            metrics::record_send_rejected(event.kind());
            return Err(SendError::Rejected);
        };

        connection.send(event).await.map_err(|e| {
            warn!(kind = event.kind(), "Send failed: {}", e);
            SendError::Transport(e)
        })?;
        metrics::record_message(event.kind(), "out");
        Ok(())
    }
}

impl fmt::Debug for ChannelManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelManager")
            .field("config", &self.config)
            .field("transport", &self.connector.name())
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for ChannelManager {
    fn drop(&mut self) {
        if let Some(supervisor) = self.supervisor.get_mut().take() {
            supervisor.cancel.cancel();
        }
    }
}

async fn supervise(
    inner: Arc<Inner>,
    connector: Arc<dyn Connector>,
    config: ChannelConfig,
    identity: Identity,
    generation: u64,
    cancel: CancellationToken,
) {
    let mut retries: u32 = 0;

    loop {
        if !inner.publish(generation, ChannelState::Connecting) {
            return;
        }
        metrics::record_connect_attempt();

        let attempt = tokio::select! {
            _ = cancel.cancelled() => return,
            result = connector.connect(&identity) => result,
        };

        let reason = match attempt {
            Ok(connection) => {
                retries = 0;
                match run_connection(&inner, &config, generation, &cancel, Arc::from(connection))
                    .await
                {
                    Some(reason) => reason,
                    None => return,
                }
            }
            Err(e) => {
                warn!(%identity, "Connect failed: {}", e);
                DisconnectReason::ConnectFailed(e.to_string())
            }
        };

        if !inner.publish(generation, ChannelState::Disconnected(Some(reason))) {
            return;
        }

        let delay = config.reconnect_delay_for(retries);
        retries = retries.saturating_add(1);
        info!(%identity, ?delay, "Reconnect scheduled");

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = time::sleep(delay) => {}
        }
        metrics::record_reconnect();
    }
}

/// Drive one open connection. Returns `None` when cancelled.
async fn run_connection(
    inner: &Inner,
    config: &ChannelConfig,
    generation: u64,
    cancel: &CancellationToken,
    connection: Arc<dyn Connection>,
) -> Option<DisconnectReason> {
    if !inner.attach(generation, Arc::clone(&connection)) {
        close_quietly(connection.as_ref()).await;
        return None;
    }
    info!(connection = %connection.id(), remote = ?connection.remote_addr(), "Alert channel open");

    let period = config.keepalive_interval.max(Duration::from_millis(1));
    let mut keepalive = time::interval_at(Instant::now() + period, period);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let reason = loop {
        tokio::select! {
            _ = cancel.cancelled() => break None,
            _ = keepalive.tick() => match connection.send(&Outbound::ping()).await {
                Ok(()) => metrics::record_message("ping", "out"),
                Err(e) => debug!("Keepalive ping failed: {}", e),
            },
            result = connection.recv() => match result {
                Ok(Some(event)) => {
                    metrics::record_message(event.kind(), "in");
                    if !inner.deliver(generation, event) {
                        break None;
                    }
                }
                Ok(None) => break Some(DisconnectReason::Lost("closed by service".into())),
                Err(e) if e.is_frame_error() => {
                    warn!("Dropping inbound frame: {}", e);
                    metrics::record_protocol_error();
                }
                Err(e) => break Some(DisconnectReason::Lost(e.to_string())),
            },
        }
    };

    inner.detach(&connection);
    close_quietly(connection.as_ref()).await;
    reason
}

async fn close_quietly(connection: &dyn Connection) {
    if let Err(e) = connection.close().await {
        debug!(connection = %connection.id(), "Close failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_delay_is_fixed() {
        let config = ChannelConfig::default();
        for retries in [0, 1, 5, 100] {
            assert_eq!(config.reconnect_delay_for(retries), Duration::from_secs(5));
        }
    }

    #[test]
    fn test_capped_backoff() {
        let config = ChannelConfig {
            backoff_multiplier: 2.0,
            ..Default::default()
        };
        assert_eq!(config.reconnect_delay_for(0), Duration::from_secs(5));
        assert_eq!(config.reconnect_delay_for(1), Duration::from_secs(10));
        assert_eq!(config.reconnect_delay_for(3), Duration::from_secs(40));
        assert_eq!(config.reconnect_delay_for(4), Duration::from_secs(60));
        assert_eq!(config.reconnect_delay_for(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_shrinking_multiplier_is_fixed() {
        let config = ChannelConfig {
            backoff_multiplier: 0.5,
            ..Default::default()
        };
        assert_eq!(config.reconnect_delay_for(3), Duration::from_secs(5));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ChannelState::Open.to_string(), "open");
        assert_eq!(ChannelState::Disconnected(None).to_string(), "disconnected");
        assert!(ChannelState::Disconnected(Some(DisconnectReason::Closed))
            .to_string()
            .contains("Closed"));
    }
}
