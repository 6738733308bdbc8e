use crate::address::AddressFamily;
use crate::certificate::PeerCertificate;
use crate::error::ConnectionError;
use crate::handler::ConnectionEvent;
use crate::id::ConnectionId;
use crate::socket::{self, is_transient, ConnectStatus, SockType};
use crate::state::*;

use std::{
    collections::VecDeque,
    fmt::Display,
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr},
    os::unix::io::{AsRawFd, RawFd},
    sync::Arc,
    time::{Duration, Instant},
};

use rustls::{ClientConfig, ClientConnection, ServerConfig, ServerConnection, ServerName};
use socket2::Socket;

/// Where a connection gets its TLS session from, if it ever has one.
pub(crate) enum TlsContext {
    /// The reactor's shared server context
    Server(Arc<ServerConfig>),
    /// A context owned by this connection, and the name to verify the server against
    Client(Arc<ClientConfig>, ServerName),
}

/// Write out whatever TLS records the session has queued.
///
/// Returns `Ok(false)` if the socket would block before everything was sent.
fn flush_tls(session: &mut rustls::Connection, socket: &mut Socket) -> io::Result<bool> {
    while session.wants_write() {
        match session.write_tls(socket) {
            Ok(0) => return Ok(false),
            Ok(_) => {}
            Err(e) if is_transient(&e) => return Ok(false),
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

/// Push a handshake forward as far as the socket allows.
fn drive_handshake(
    session: &mut rustls::Connection,
    socket: &mut Socket,
) -> Result<HandshakeOutcome, String> {
    loop {
        match flush_tls(session, socket) {
            Ok(true) => {}
            Ok(false) => return Ok(HandshakeOutcome::WantWrite),
            Err(e) => return Err(e.to_string()),
        }

        if !session.is_handshaking() {
            return Ok(HandshakeOutcome::Complete);
        }

        match session.read_tls(socket) {
            Ok(0) => return Err("connection closed during handshake".to_string()),
            Ok(_) => {
                if let Err(e) = session.process_new_packets() {
                    // Let the peer know why, if the socket will take it
                    let _ = session.write_tls(socket);
                    return Err(e.to_string());
                }
            }
            Err(e) if is_transient(&e) => return Ok(HandshakeOutcome::WantRead),
            Err(e) => return Err(e.to_string()),
        }
    }
}

/// The result of one application read on a TLS session.
enum TlsRead {
    Data(usize),
    PeerClosed,
    Failed(String),
}

fn read_tls_plaintext(session: &mut rustls::Connection, socket: &mut Socket, buf: &mut [u8]) -> TlsRead {
    loop {
        match session.reader().read(buf) {
            Ok(0) if !buf.is_empty() => return TlsRead::PeerClosed,
            Ok(n) => return TlsRead::Data(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return TlsRead::PeerClosed,
            Err(e) => return TlsRead::Failed(e.to_string()),
        }

        match session.read_tls(socket) {
            Ok(0) => return TlsRead::PeerClosed,
            Ok(_) => {
                if let Err(e) = session.process_new_packets() {
                    let _ = session.write_tls(socket);
                    return TlsRead::Failed(e.to_string());
                }
            }
            Err(e) if is_transient(&e) => return TlsRead::Data(0),
            Err(e) => return TlsRead::Failed(e.to_string()),
        }
    }
}

/// One socket with its protocol state and the application's data for it.
pub struct Connection<D> {
    id: ConnectionId,
    socket: Option<Socket>,
    socktype: SockType,
    peer: SocketAddr,
    state: ConnectionState,
    tls_mode: TlsMode,
    handshake: Option<HandshakeRole>,
    context: Option<TlsContext>,
    session: Option<rustls::Connection>,
    started: Instant,
    elapsed: Option<Duration>,
    max_lifetime: Option<Duration>,
    last_error: Option<io::Error>,
    events: VecDeque<ConnectionEvent>,
    data: D,
}

impl<D> Connection<D> {
    pub(crate) fn new(id: ConnectionId, socket: Socket, peer: SocketAddr, state: ConnectionState, data: D) -> Self {
        Self {
            id,
            socket: Some(socket),
            socktype: SockType::Stream,
            peer,
            state,
            tls_mode: TlsMode::None,
            handshake: None,
            context: None,
            session: None,
            started: Instant::now(),
            elapsed: None,
            max_lifetime: None,
            last_error: None,
            events: VecDeque::new(),
            data,
        }
    }

    pub(crate) fn with_tls(mut self, mode: TlsMode, context: Option<TlsContext>) -> Self {
        self.tls_mode = mode;
        self.context = context;
        self
    }

    pub(crate) fn with_max_lifetime(mut self, max_lifetime: Option<Duration>) -> Self {
        self.max_lifetime = max_lifetime;
        self
    }

    pub(crate) fn with_socktype(mut self, socktype: SockType) -> Self {
        self.socktype = socktype;
        self
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn tls_mode(&self) -> TlsMode {
        self.tls_mode
    }

    pub fn socktype(&self) -> SockType {
        self.socktype
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn family(&self) -> AddressFamily {
        AddressFamily::of(&self.peer)
    }

    /// The peer's address, without the port
    pub fn print_ip(&self) -> String {
        self.peer.ip().to_string()
    }

    /// The peer's address and port
    pub fn print_address(&self) -> String {
        self.peer.to_string()
    }

    pub fn data(&self) -> &D {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut D {
        &mut self.data
    }

    /// The error that made an outbound connect fail, if it did.
    pub fn last_error(&self) -> Option<&io::Error> {
        self.last_error.as_ref()
    }

    /// How long the connection has existed. Stops counting once it is closed.
    pub fn elapsed(&self) -> Duration {
        self.elapsed.unwrap_or_else(|| self.started.elapsed())
    }

    pub fn max_lifetime(&self) -> Option<Duration> {
        self.max_lifetime
    }

    pub(crate) fn is_timed_out(&self, now: Instant) -> bool {
        match self.max_lifetime {
            Some(max) if !self.state.is_dead() => now.saturating_duration_since(self.started) > max,
            _ => false,
        }
    }

    pub fn is_tls(&self) -> bool {
        self.session.is_some()
    }

    pub(crate) fn raw_fd(&self) -> Option<RawFd> {
        self.socket.as_ref().map(AsRawFd::as_raw_fd)
    }

    pub(crate) fn raise(&mut self, event: ConnectionEvent) {
        self.events.push_back(event);
    }

    pub(crate) fn next_event(&mut self) -> Option<ConnectionEvent> {
        self.events.pop_front()
    }

    /// Decrypted data the TLS session holds which the socket will not
    /// signal as readable again.
    pub(crate) fn has_buffered_plaintext(&mut self) -> bool {
        match self.session.as_mut() {
            Some(session) if self.state.is_tls_established() => session
                .process_new_packets()
                .map_or(false, |io| io.plaintext_bytes_to_read() > 0),
            _ => false,
        }
    }

    /// The certificate the peer presented during the TLS handshake.
    pub fn peer_certificate(&self) -> Option<PeerCertificate> {
        let certs = self.session.as_ref()?.peer_certificates()?;
        PeerCertificate::from_der(&certs.first()?.0)
    }

    /// Tear the connection down after a fatal error, returning the sentinel
    /// the caller should see.
    fn fail(&mut self, reason: &dyn Display) -> ConnectionError {
        tracing::info!(id = %self.id, peer = %self.peer, %reason, "Closing connection");
        self.state = ConnectionState::Closing;
        self.cleanup();
        ConnectionError::Closed
    }

    /// Release the socket and any TLS session, and mark the connection dead.
    /// Calling this again has no effect.
    pub fn cleanup(&mut self) {
        if self.state.is_dead() {
            return;
        }

        if let (Some(session), Some(socket)) = (self.session.as_mut(), self.socket.as_mut()) {
            session.send_close_notify();
            let _ = flush_tls(session, socket);
        }

        self.session = None;
        self.context = None;
        self.socket = None;
        self.elapsed = Some(self.started.elapsed());
        self.state = ConnectionState::Dead;
        self.raise(ConnectionEvent::Closed);
    }

    /// Close the connection. Plaintext connections may shut down just one
    /// direction; TLS connections only close fully.
    pub fn close(&mut self, direction: Direction) {
        match (self.state, direction) {
            (ConnectionState::Dead | ConnectionState::Closing, _) => {}
            (_, Direction::Both) => {
                self.state = ConnectionState::Closing;
                self.cleanup();
            }
            (ConnectionState::Plaintext, half) => {
                let how = if half == Direction::Read { Shutdown::Read } else { Shutdown::Write };
                if let Some(socket) = self.socket.as_ref() {
                    if let Err(e) = socket.shutdown(how) {
                        tracing::debug!(id = %self.id, error = %e, "shutdown() failed");
                    }
                }
            }
            (state, half) => {
                tracing::debug!(id = %self.id, %state, ?half, "Half-close ignored on encrypted connection");
            }
        }
    }

    /// Create a TLS session from the connection's context and start the
    /// handshake in the given role.
    pub(crate) fn begin_handshake(&mut self, role: HandshakeRole) -> HandshakeOutcome {
        let session = match &self.context {
            Some(TlsContext::Server(config)) => ServerConnection::new(Arc::clone(config)).map(rustls::Connection::from),
            Some(TlsContext::Client(config, name)) => {
                ClientConnection::new(Arc::clone(config), name.clone()).map(rustls::Connection::from)
            }
            None => Err(rustls::Error::General("no TLS context".to_string())),
        };

        self.handshake = Some(role);
        self.state = ConnectionState::TlsInit;

        match session {
            Ok(session) => {
                self.session = Some(session);
                self.advance_handshake()
            }
            Err(e) => self.handshake_failed(&e),
        }
    }

    fn handshake_failed(&mut self, reason: &dyn Display) -> HandshakeOutcome {
        tracing::warn!(id = %self.id, peer = %self.peer, %reason, "TLS handshake failed");
        self.raise(ConnectionEvent::SslHandshakeFailed);
        self.state = ConnectionState::Closing;
        self.cleanup();
        HandshakeOutcome::Failed
    }

    /// Retry the pending handshake. The role recorded when the handshake
    /// began (and encoded in the retry state) decides where it lands.
    pub(crate) fn advance_handshake(&mut self) -> HandshakeOutcome {
        let role = match self.state.handshake_role().or(self.handshake) {
            Some(role) => role,
            None => return self.handshake_failed(&"no handshake in progress"),
        };

        self.state = ConnectionState::TlsInit;

        let result = match (self.session.as_mut(), self.socket.as_mut()) {
            (Some(session), Some(socket)) => drive_handshake(session, socket),
            _ => Err("no TLS session".to_string()),
        };

        match result {
            Ok(HandshakeOutcome::Complete) => {
                self.state = ConnectionState::TlsReady;
                tracing::info!(id = %self.id, peer = %self.peer, ?role, "TLS handshake completed");
                self.raise(ConnectionEvent::SslHandshakeOk);
                HandshakeOutcome::Complete
            }
            Ok(pending) => {
                self.state = role.pending_state(pending);
                pending
            }
            Err(reason) => self.handshake_failed(&reason),
        }
    }

    /// Upgrade a plaintext connection to TLS, in the role chosen when it was
    /// created. The handshake result is reported through events.
    pub fn start_tls(&mut self) -> Result<(), ConnectionError> {
        let server = match self.tls_mode {
            TlsMode::StartTlsServer => true,
            TlsMode::StartTlsClient => false,
            _ => {
                tracing::error!(id = %self.id, "STARTTLS not requested when the connection was created");
                return Err(ConnectionError::StartTls("not requested when the connection was created"));
            }
        };
        if self.state != ConnectionState::Plaintext {
            return Err(ConnectionError::StartTls("connection is not in plaintext state"));
        }
        if self.context.is_none() {
            tracing::error!(id = %self.id, "STARTTLS failed, no certificate prepared");
            return Err(ConnectionError::StartTls("no TLS context available"));
        }

        tracing::debug!(id = %self.id, mode = if server { "server" } else { "client" }, "Initiating STARTTLS");
        self.begin_handshake(HandshakeRole::StartTls);
        Ok(())
    }

    /// Start connecting to the peer. Returns `false` if the connect failed
    /// outright, in which case the connection has been torn down.
    pub(crate) fn connect(&mut self) -> bool {
        let result = match self.socket.as_ref() {
            Some(socket) => socket::start_connect(socket, self.peer),
            None => return false,
        };

        match result {
            Ok(ConnectStatus::Connected) => {
                self.raise(ConnectionEvent::ConnectComplete);
                if self.tls_mode == TlsMode::Immediate {
                    self.begin_handshake(HandshakeRole::Connect);
                } else {
                    self.state = ConnectionState::Plaintext;
                }
                true
            }
            Ok(ConnectStatus::InProgress) => {
                self.state = if self.tls_mode == TlsMode::Immediate {
                    ConnectionState::TlsConnecting
                } else {
                    ConnectionState::PlaintextConnecting
                };
                true
            }
            Err(e) => {
                tracing::error!(id = %self.id, peer = %self.peer, error = %e, "connect failed");
                self.last_error = Some(e);
                self.raise(ConnectionEvent::ConnectFailed);
                self.state = ConnectionState::Closing;
                self.cleanup();
                false
            }
        }
    }

    /// Resolve a non-blocking connect once the socket is writable.
    pub(crate) fn complete_connect(&mut self) {
        let result = match self.socket.as_ref() {
            Some(socket) => socket.take_error(),
            None => return,
        };

        match result {
            Ok(None) => {
                self.raise(ConnectionEvent::ConnectComplete);
                if self.state == ConnectionState::PlaintextConnecting {
                    self.state = ConnectionState::Plaintext;
                } else {
                    self.begin_handshake(HandshakeRole::Connect);
                }
            }
            Ok(Some(e)) | Err(e) => {
                tracing::debug!(id = %self.id, peer = %self.peer, error = %e, "connect() failed");
                self.last_error = Some(e);
                self.raise(ConnectionEvent::ConnectFailed);
                self.state = ConnectionState::Closing;
                self.cleanup();
            }
        }
    }

    /// Send any TLS records still queued from an earlier operation. Returns
    /// the connection to `TlsReady` once everything has gone.
    pub(crate) fn flush(&mut self) -> Result<(), ConnectionError> {
        let flushed = match (self.session.as_mut(), self.socket.as_mut()) {
            (Some(session), Some(socket)) => flush_tls(session, socket),
            _ => return Ok(()),
        };

        match flushed {
            Ok(true) => {
                if matches!(self.state, ConnectionState::TlsRead | ConnectionState::TlsWrite) {
                    self.state = ConnectionState::TlsReady;
                }
                Ok(())
            }
            Ok(false) => {
                if self.state.is_tls_established() {
                    self.state = ConnectionState::TlsWrite;
                }
                Ok(())
            }
            Err(e) => Err(self.fail(&e)),
        }
    }

    /// Read data from the connection.
    ///
    /// `Ok(0)` means nothing is available right now. A fatal error, or the
    /// peer closing a TLS session, tears the connection down and returns
    /// [`ConnectionError::Closed`]. A plaintext peer that has finished
    /// sending gives [`ConnectionError::EndOfStream`].
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, ConnectionError> {
        match self.state {
            ConnectionState::Dead | ConnectionState::Closing => Err(ConnectionError::Closed),
            ConnectionState::Plaintext => self.plaintext_read(buf),
            ConnectionState::TlsReady | ConnectionState::TlsRead | ConnectionState::TlsWrite => self.tls_read(buf),
            state if state.handshake_role().is_some() => self.retry_handshake(),
            _ => Ok(0),
        }
    }

    /// Write data to the connection, returning how much was accepted.
    ///
    /// For TLS connections this also sends any records still queued, so a
    /// write of an empty buffer is a flush.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, ConnectionError> {
        match self.state {
            ConnectionState::Dead | ConnectionState::Closing => Err(ConnectionError::Closed),
            ConnectionState::Plaintext => self.plaintext_write(buf),
            ConnectionState::TlsReady | ConnectionState::TlsRead | ConnectionState::TlsWrite => self.tls_write(buf),
            state if state.handshake_role().is_some() => self.retry_handshake(),
            _ => Ok(0),
        }
    }

    fn retry_handshake(&mut self) -> Result<usize, ConnectionError> {
        match self.advance_handshake() {
            HandshakeOutcome::Failed => Err(ConnectionError::Closed),
            _ => Ok(0),
        }
    }

    fn plaintext_read(&mut self, buf: &mut [u8]) -> Result<usize, ConnectionError> {
        let result = match self.socket.as_mut() {
            Some(socket) => socket.read(buf),
            None => return Err(ConnectionError::Closed),
        };

        match result {
            Ok(0) if !buf.is_empty() && self.socktype == SockType::Stream => Err(ConnectionError::EndOfStream),
            Ok(n) => Ok(n),
            Err(e) if is_transient(&e) => Ok(0),
            Err(e) => Err(self.fail(&e)),
        }
    }

    fn plaintext_write(&mut self, buf: &[u8]) -> Result<usize, ConnectionError> {
        if buf.is_empty() {
            return Ok(0);
        }

        let result = match self.socket.as_mut() {
            Some(socket) => socket.write(buf),
            None => return Err(ConnectionError::Closed),
        };

        match result {
            Ok(n) => Ok(n),
            Err(e) if is_transient(&e) => Ok(0),
            Err(e) => Err(self.fail(&e)),
        }
    }

    fn tls_read(&mut self, buf: &mut [u8]) -> Result<usize, ConnectionError> {
        let result = match (self.session.as_mut(), self.socket.as_mut()) {
            (Some(session), Some(socket)) => read_tls_plaintext(session, socket, buf),
            _ => return Err(self.fail(&"no TLS session")),
        };

        match result {
            TlsRead::Data(n) => {
                // Reading can queue records of our own, such as alerts or key updates
                self.flush()?;
                Ok(n)
            }
            TlsRead::PeerClosed => Err(self.fail(&"connection closed by peer")),
            TlsRead::Failed(reason) => {
                tracing::warn!(id = %self.id, peer = %self.peer, %reason, "TLS error while reading");
                Err(self.fail(&reason))
            }
        }
    }

    fn tls_write(&mut self, buf: &[u8]) -> Result<usize, ConnectionError> {
        let written = match self.session.as_mut() {
            Some(session) if !buf.is_empty() => session.writer().write(buf),
            Some(_) => Ok(0),
            None => return Err(self.fail(&"no TLS session")),
        };

        match written {
            Ok(n) => {
                self.flush()?;
                Ok(n)
            }
            Err(e) => {
                tracing::warn!(id = %self.id, peer = %self.peer, error = %e, "TLS error while writing");
                Err(self.fail(&e))
            }
        }
    }
}
