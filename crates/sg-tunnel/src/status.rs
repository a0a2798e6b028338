//! Tunnel status broadcast to the host UI.

use crate::error::ErrorCode;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Connection state as seen by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No tunnel
    Disconnected,
    /// Tunnel is starting
    Connecting,
    /// Tunnel is running
    Connected,
    /// Tunnel dropped and is being re-established
    Reasserting,
    /// Tunnel is shutting down
    Disconnecting,
    /// Last attempt failed; see the error code
    Invalid,
}

impl ConnectionState {
    /// Check if the tunnel is usable
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Check if a tunnel exists or is being brought up
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Reasserting
        )
    }

    /// Display label
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting...",
            ConnectionState::Connected => "Connected",
            ConnectionState::Reasserting => "Reasserting",
            ConnectionState::Disconnecting => "Disconnecting...",
            ConnectionState::Invalid => "Invalid",
        }
    }
}

/// State plus the code of the most recent failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub state: ConnectionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorCode>,
}

impl Status {
    /// Status without an error
    pub fn new(state: ConnectionState) -> Self {
        Self { state, error: None }
    }

    /// Failed status. `NoError` is dropped so it never shows up as a failure.
    pub fn invalid(code: ErrorCode) -> Self {
        Self {
            state: ConnectionState::Invalid,
            error: code.is_failure().then_some(code).or(Some(ErrorCode::Undefined)),
        }
    }

    pub fn disconnected() -> Self {
        Self::new(ConnectionState::Disconnected)
    }

    pub fn connecting() -> Self {
        Self::new(ConnectionState::Connecting)
    }

    pub fn connected() -> Self {
        Self::new(ConnectionState::Connected)
    }

    pub fn reasserting() -> Self {
        Self::new(ConnectionState::Reasserting)
    }

    pub fn disconnecting() -> Self {
        Self::new(ConnectionState::Disconnecting)
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::disconnected()
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.error {
            Some(code) => write!(f, "{} [{}]", self.state.label(), code),
            None => f.write_str(self.state.label()),
        }
    }
}

/// Receiving side of the status channel
pub type StatusReceiver = watch::Receiver<Status>;

/// Single-value broadcast of the latest [`Status`]
///
/// The whole value is replaced at once, so readers never see a state
/// paired with another transition's error code.
#[derive(Debug, Clone)]
pub struct StatusChannel {
    tx: watch::Sender<Status>,
}

impl StatusChannel {
    /// Create a channel starting at `initial`
    pub fn new(initial: Status) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Publish a new status; returns whether it changed
    pub fn publish(&self, status: Status) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        })
    }

    /// Latest published status
    pub fn current(&self) -> Status {
        *self.tx.borrow()
    }

    /// Subscribe to status changes
    pub fn subscribe(&self) -> StatusReceiver {
        self.tx.subscribe()
    }
}

impl Default for StatusChannel {
    fn default() -> Self {
        Self::new(Status::disconnected())
    }
}
