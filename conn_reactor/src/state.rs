//! The connection state machine's vocabulary.

use serde::{Deserialize, Serialize};

/// Where a connection is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum ConnectionState {
    #[strum(serialize = "Plaintext")]
    Plaintext,
    #[strum(serialize = "SSL init")]
    TlsInit,
    #[strum(serialize = "SSL connecting")]
    TlsConnecting,
    #[strum(serialize = "Plaintext connecting")]
    PlaintextConnecting,
    #[strum(serialize = "SSL accept read")]
    TlsAcceptRead,
    #[strum(serialize = "SSL accept write")]
    TlsAcceptWrite,
    #[strum(serialize = "SSL connect read")]
    TlsConnectRead,
    #[strum(serialize = "SSL connect write")]
    TlsConnectWrite,
    #[strum(serialize = "SSL starttls read")]
    TlsStartTlsRead,
    #[strum(serialize = "SSL starttls write")]
    TlsStartTlsWrite,
    #[strum(serialize = "SSL read")]
    TlsRead,
    #[strum(serialize = "SSL write")]
    TlsWrite,
    #[strum(serialize = "SSL user ready")]
    TlsReady,
    #[strum(serialize = "Closing")]
    Closing,
    #[strum(serialize = "Dead")]
    Dead,
}

/// How a listener or outbound connection uses TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TlsMode {
    /// Plaintext only.
    None,
    /// Plaintext at first; the server side of a later STARTTLS upgrade.
    StartTlsServer,
    /// Plaintext at first; the client side of a later STARTTLS upgrade.
    StartTlsClient,
    /// Handshake immediately after accept or connect.
    Immediate,
}

/// Which handshake primitive a connection is driving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeRole {
    Accept,
    Connect,
    StartTls,
}

/// The result of one attempt at advancing a handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeOutcome {
    Complete,
    Failed,
    WantRead,
    WantWrite,
}

/// The readiness a connection is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
    Both,
    /// Ask the application.
    Application,
    /// Not to be waited on at all.
    Nothing,
}

/// Which half of a plaintext connection to shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Read,
    Write,
    Both,
}

impl Direction {
    /// Parse the `"r"`, `"w"`, `"rw"` notation, case-insensitively.
    pub fn parse(text: &str) -> Option<Self> {
        match text.to_ascii_lowercase().as_str() {
            "r" => Some(Self::Read),
            "w" => Some(Self::Write),
            "rw" => Some(Self::Both),
            _ => None,
        }
    }
}

impl HandshakeRole {
    /// The retry state for this role when the handshake is blocked on `outcome`.
    /// Only meaningful for `WantRead` and `WantWrite`.
    pub fn pending_state(self, outcome: HandshakeOutcome) -> ConnectionState {
        use ConnectionState::*;

        match (self, outcome) {
            (Self::Accept, HandshakeOutcome::WantRead) => TlsAcceptRead,
            (Self::Accept, HandshakeOutcome::WantWrite) => TlsAcceptWrite,
            (Self::Connect, HandshakeOutcome::WantRead) => TlsConnectRead,
            (Self::Connect, HandshakeOutcome::WantWrite) => TlsConnectWrite,
            (Self::StartTls, HandshakeOutcome::WantRead) => TlsStartTlsRead,
            (Self::StartTls, HandshakeOutcome::WantWrite) => TlsStartTlsWrite,
            (_, HandshakeOutcome::Complete) => TlsReady,
            (_, HandshakeOutcome::Failed) => Closing,
        }
    }
}

impl ConnectionState {
    /// For handshake retry states, the primitive that must be retried.
    pub fn handshake_role(self) -> Option<HandshakeRole> {
        use ConnectionState::*;

        match self {
            TlsAcceptRead | TlsAcceptWrite => Some(HandshakeRole::Accept),
            TlsConnectRead | TlsConnectWrite => Some(HandshakeRole::Connect),
            TlsStartTlsRead | TlsStartTlsWrite => Some(HandshakeRole::StartTls),
            _ => None,
        }
    }

    /// What the multiplexer should wait for on a connection in this state.
    pub fn interest(self) -> Interest {
        use ConnectionState::*;

        match self {
            Plaintext | TlsReady => Interest::Application,
            TlsInit => Interest::Both,
            TlsAcceptRead | TlsConnectRead | TlsStartTlsRead | TlsRead => Interest::Read,
            TlsAcceptWrite | TlsConnectWrite | TlsStartTlsWrite | TlsWrite => Interest::Write,
            TlsConnecting | PlaintextConnecting => Interest::Write,
            Closing | Dead => Interest::Nothing,
        }
    }

    /// Still completing an outbound `connect()`.
    pub fn is_connecting(self) -> bool {
        matches!(self, Self::TlsConnecting | Self::PlaintextConnecting)
    }

    /// Application data flows over TLS in this state.
    pub fn is_tls_established(self) -> bool {
        matches!(self, Self::TlsReady | Self::TlsRead | Self::TlsWrite)
    }

    pub fn is_dead(self) -> bool {
        self == Self::Dead
    }
}
