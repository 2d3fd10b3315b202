//! Connection state machine
//!
//! ```text
//!  Closed/Failed ──► Connecting ──► Connected ──► Authenticating ──► Ready
//!                        │              │                │             │
//!                        └──────────────┴───► Closing ◄──┴─────────────┘
//!                                                │
//!                                      Closed ◄──┴──► Failed
//! ```
//!
//! `Closed` and `Failed` are terminal until the connection is started
//! again. Every exit from an active state goes through `Closing`.

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No socket. Initial state and terminal state after a clean stop
    #[default]
    Closed,
    /// Socket connect in progress
    Connecting,
    /// TCP link is up, handshake not started
    Connected,
    /// Hello/authenticate exchange in progress
    Authenticating,
    /// Authenticated; general traffic allowed
    Ready,
    /// Socket being released
    Closing,
    /// Terminal state after an abnormal stop
    Failed,
}

impl ConnectionState {
    /// `Closed` or `Failed`
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }

    /// `Closed`, `Closing` or `Failed`
    pub fn is_closed_or_closing_or_failed(self) -> bool {
        self.is_terminal() || self == ConnectionState::Closing
    }

    /// `Closed` or `Closing`
    pub fn is_closed_or_closing(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Closing)
    }

    /// States in which the socket is established
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            ConnectionState::Connected | ConnectionState::Authenticating | ConnectionState::Ready
        )
    }

    pub fn is_ready(self) -> bool {
        self == ConnectionState::Ready
    }

    /// Whether moving from `self` to `next` is a legal transition
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        matches!(
            (self, next),
            (Closed, Connecting)
                | (Failed, Connecting)
                | (Connecting, Connected)
                | (Connected, Authenticating)
                | (Authenticating, Ready)
                | (Connecting | Connected | Authenticating | Ready, Closing)
                | (Closing, Closed)
                | (Closing, Failed)
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Closed => "CLOSED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Authenticating => "AUTHENTICATING",
            ConnectionState::Ready => "READY",
            ConnectionState::Closing => "CLOSING",
            ConnectionState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}
