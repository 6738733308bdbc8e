use crate::id::*;
use crate::state::TlsMode;
use crate::Connection;

use std::net::SocketAddr;

/// The events a [`Reactor`](crate::Reactor) raises into the host application.
#[derive(Debug,Clone,Copy,PartialEq,Eq,Hash,strum::Display)]
pub enum ConnectionEvent
{
    /// Server side: a connection was accepted. Delivered through
    /// [`ConnectionHandler::new_connection`], never `handle_event`.
    #[strum(serialize = "New connection")]
    NewConnection,
    /// Client side: `connect()` is about to be called
    #[strum(serialize = "Connect start")]
    ConnectStart,
    /// Client side: `connect()` succeeded
    #[strum(serialize = "Connect complete")]
    ConnectComplete,
    /// Client side: `connect()` failed; the connection will close
    #[strum(serialize = "Connect failed")]
    ConnectFailed,
    /// The TLS handshake finished, so the peer certificate is available
    #[strum(serialize = "SSL handshake OK")]
    SslHandshakeOk,
    /// The TLS handshake failed; the connection will close
    #[strum(serialize = "SSL handshake failed")]
    SslHandshakeFailed,
    /// Does the application want to read? Answer [`CallbackResult::Ok`] for yes.
    #[strum(serialize = "Read check")]
    ReadCheck,
    /// Does the application want to write? Answer [`CallbackResult::Ok`] for yes.
    #[strum(serialize = "Write check")]
    WriteCheck,
    /// Data can be read with [`Connection::read`]
    #[strum(serialize = "Read")]
    Read,
    /// Data can be written with [`Connection::write`]
    #[strum(serialize = "Write")]
    Write,
    /// The connection has outlived its maximum lifetime. Raised every cycle
    /// until the application closes it.
    #[strum(serialize = "Timeout")]
    Timeout,
    /// The connection has been torn down. Raised exactly once.
    #[strum(serialize = "Closed")]
    Closed,
    /// The connection is about to be removed from the reactor.
    #[strum(serialize = "Cleanup")]
    Cleanup,
}

/// The application's answer to an event.
#[derive(Debug,Clone,Copy,PartialEq,Eq)]
pub enum CallbackResult
{
    /// Yes, or nothing to report
    Ok,
    /// No, or reject
    Failed,
    /// Upgrade this connection to TLS now. Only meaningful in answer to
    /// `Read` or `Write`.
    StartTls,
}

impl From<bool> for CallbackResult
{
    fn from(yes: bool) -> Self
    {
        if yes { Self::Ok } else { Self::Failed }
    }
}

/// What is known about a connection when it has just been accepted.
#[derive(Debug,Clone)]
pub struct NewConnectionInfo
{
    pub id: ConnectionId,
    pub listener: ListenerId,
    pub peer: SocketAddr,
    pub tls_mode: TlsMode,
}

/// Implemented by the host application to receive connection events.
///
/// `Data` is the per-connection state the application keeps; it is stored in
/// the [`Connection`] and available through [`Connection::data`].
///
/// A handler may freely call [`Connection::read`], [`Connection::write`],
/// [`Connection::close`] and [`Connection::start_tls`] on the connection it is
/// given. Events those calls cause (`Closed`, handshake results) are delivered
/// as soon as the current call returns.
pub trait ConnectionHandler
{
    type Data;

    /// A listener accepted a connection. Return `None` to reject it, which
    /// closes the new socket before any TLS work is done.
    fn new_connection(&mut self, info: &NewConnectionInfo) -> Option<Self::Data>;

    /// Something happened on `conn`.
    fn handle_event(&mut self, conn: &mut Connection<Self::Data>, event: ConnectionEvent) -> CallbackResult;
}
