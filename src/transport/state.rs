//! Connection state machine shared by both transports.

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

/// Transport connection state.
///
/// Transitions: Disconnected -> Connecting -> Connected; Connected ->
/// Lost on heartbeat timeout, hardware unplug or read error; Lost ->
/// Reconnecting -> Connected, or back to Disconnected once the retry
/// limit is exhausted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Lost,
    Reconnecting,
}

/// Emitted on every state transition. Advisory for consumers; the
/// transport remains the authority on its own state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChangeEvent {
    pub state: ConnectionState,
    pub message: String,
    pub can_reconnect: bool,
}

const EVENT_CAPACITY: usize = 16;

/// Holds the current state and fans out transition events.
///
/// Events go through a bounded broadcast channel; slow subscribers observe
/// `Lagged` and can resubscribe, the producer never blocks.
pub struct StateTracker {
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<StateChangeEvent>,
}

impl StateTracker {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { state_tx, events_tx }
    }

    pub fn current(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.current() == ConnectionState::Connected
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChangeEvent> {
        self.events_tx.subscribe()
    }

    /// Watch-style view of the current state, for callers that only care
    /// about the latest value rather than every transition.
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn transition(
        &self,
        state: ConnectionState,
        message: impl Into<String>,
        can_reconnect: bool,
    ) {
        let message = message.into();
        self.state_tx.send_replace(state);
        log::info!("Connection state -> {:?}: {}", state, message);
        let _ = self.events_tx.send(StateChangeEvent {
            state,
            message,
            can_reconnect,
        });
    }
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}
