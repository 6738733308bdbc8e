//! A single-threaded connection reactor for plaintext and TLS sockets.
//!
//! The [`Reactor`] owns a set of listeners and connections, multiplexes them
//! with `select(2)`, and drives each connection through its state machine:
//! non-blocking connects, TLS handshakes (immediate or via STARTTLS), reads,
//! writes and timeouts. Everything the host application needs to know is
//! delivered as a [`ConnectionEvent`] to its [`ConnectionHandler`].
//!
//! Diagnostics are emitted through `tracing`; see [`tracing_config`] for ways
//! of collecting them.

pub mod id;
pub use id::*;

pub mod error;
pub use error::*;

pub mod address;
pub use address::AddressFamily;

pub mod socket;
pub use socket::SockType;

pub mod tls;

mod certificate;
pub use certificate::*;

mod state;
pub use state::*;

mod handler;
pub use handler::*;

mod connection;
pub use connection::Connection;

mod listener;
pub use listener::*;

mod interest;
pub use interest::InterestSets;

mod reactor;
pub use reactor::*;

pub mod config;
pub use config::{ReactorConfig, ServerSettings, ServerTlsSettings};

pub mod tracing_config;
