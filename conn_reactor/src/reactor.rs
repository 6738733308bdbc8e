use crate::*;
use crate::connection::TlsContext;
use crate::interest::fits_fd_set;

use std::{
    io,
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use rustls::ServerConfig;

/// Where and how to make an outbound connection.
#[derive(Clone, Debug)]
pub struct ConnectRequest {
    /// Numeric address or host name, optionally with a `/service` suffix
    pub host: String,
    pub port: u16,
    pub socktype: SockType,
    /// Local address to bind to before connecting
    pub local: Option<String>,
    pub tls_mode: TlsMode,
    /// Name to send and verify for TLS; the peer's address if absent
    pub server_name: Option<String>,
    /// Client certificate to present
    pub cert_file: Option<PathBuf>,
    /// Client key, if not in `cert_file`
    pub key_file: Option<PathBuf>,
    pub max_lifetime: Option<Duration>,
}

impl ConnectRequest {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            socktype: SockType::Stream,
            local: None,
            tls_mode: TlsMode::None,
            server_name: None,
            cert_file: None,
            key_file: None,
            max_lifetime: None,
        }
    }

    pub fn tls(mut self, mode: TlsMode) -> Self {
        self.tls_mode = mode;
        self
    }

    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    pub fn client_certificate(mut self, cert_file: impl Into<PathBuf>, key_file: Option<PathBuf>) -> Self {
        self.cert_file = Some(cert_file.into());
        self.key_file = key_file;
        self
    }

    pub fn local_address(mut self, local: impl Into<String>) -> Self {
        self.local = Some(local.into());
        self
    }

    pub fn datagram(mut self) -> Self {
        self.socktype = SockType::Datagram;
        self
    }

    pub fn max_lifetime(mut self, max_lifetime: Duration) -> Self {
        self.max_lifetime = Some(max_lifetime);
        self
    }
}

/// Hand every queued event on `conn` to the handler, including any raised
/// by the handler's own calls while doing so.
fn deliver<H: ConnectionHandler>(handler: &mut H, conn: &mut Connection<H::Data>) {
    while let Some(event) = conn.next_event() {
        tracing::trace!(id = %conn.id(), %event, "Delivering event");
        handler.handle_event(conn, event);
    }
}

/// Raise `event` and return the handler's answer, once any events the
/// handler caused have been delivered too.
fn call<H: ConnectionHandler>(handler: &mut H, conn: &mut Connection<H::Data>, event: ConnectionEvent) -> CallbackResult {
    let result = handler.handle_event(conn, event);
    deliver(handler, conn);
    result
}

fn start_tls_on_request<H: ConnectionHandler>(handler: &mut H, conn: &mut Connection<H::Data>) {
    if let Err(e) = conn.start_tls() {
        tracing::error!(id = %conn.id(), error = %e, "STARTTLS failed");
    }
    deliver(handler, conn);
}

/// Copy an error that has to be both kept and reported.
fn copy_error(e: &io::Error) -> io::Error {
    e.raw_os_error()
        .map(io::Error::from_raw_os_error)
        .unwrap_or_else(|| io::Error::new(e.kind(), e.to_string()))
}

/// The single-threaded connection reactor. Owns the listeners, the active
/// connections, the server TLS context and the application's handler.
///
/// One cycle is [`build_interest_sets`](Self::build_interest_sets), a wait,
/// [`dispatch_listeners`](Self::dispatch_listeners) and then
/// [`dispatch_active`](Self::dispatch_active); [`run_once`](Self::run_once)
/// does all four. Dead connections stay in place until [`reap`](Self::reap).
pub struct Reactor<H: ConnectionHandler> {
    handler: H,
    listeners: Vec<Listener>,
    connections: Vec<Connection<H::Data>>,
    server_tls: Option<Arc<ServerConfig>>,
    listener_ids: ListenerIdGenerator,
    connection_ids: ConnectionIdGenerator,
}

impl<H: ConnectionHandler> Reactor<H> {
    fn new(handler: H) -> Self {
        socket::ignore_sigpipe();

        Self {
            handler,
            listeners: Vec::new(),
            connections: Vec::new(),
            server_tls: None,
            listener_ids: ListenerIdGenerator::new(1),
            connection_ids: ConnectionIdGenerator::new(1),
        }
    }

    /// A reactor for outbound connections only.
    pub fn init_client(handler: H) -> Self {
        Self::new(handler)
    }

    /// A reactor listening as `settings` describe.
    ///
    /// A certificate that can't be loaded disables TLS: the plaintext port is
    /// still opened, without STARTTLS, and the TLS port is not. It is an error
    /// if a requested port can't be listened on at all.
    pub fn init_server(settings: &ServerSettings, handler: H) -> Result<Self, ListenerError> {
        let mut reactor = Self::new(handler);

        let tls_available = match &settings.tls {
            Some(tls) => reactor.load_server_certificate(tls),
            None => false,
        };

        let local_v4 = settings.local_v4.as_deref();
        let local_v6 = settings.local_v6.as_deref();

        if let Some(port) = settings.port {
            let mode = if tls_available { TlsMode::StartTlsServer } else { TlsMode::None };
            reactor.listen(port, settings.backlog, settings.max_lifetime(), mode, local_v4, local_v6)?;
        }

        if let (true, Some(port)) = (tls_available, settings.tls.as_ref().and_then(|t| t.port)) {
            reactor.listen(port, settings.backlog, settings.max_lifetime(), TlsMode::Immediate, local_v4, local_v6)?;
        }

        Ok(reactor)
    }

    pub fn init_server_from_config(config: &ReactorConfig, handler: H) -> Result<Self, ListenerError> {
        Self::init_server(&config.server, handler)
    }

    fn load_server_certificate(&mut self, settings: &ServerTlsSettings) -> bool {
        let config = tls::load_identity(&settings.cert_file, settings.key_file.as_deref()).and_then(|identity| {
            tls::server_config(identity, settings.root_ca_file.as_deref(), settings.require_client_cert)
        });

        match config {
            Ok(config) => {
                self.server_tls = Some(config);
                true
            }
            Err(e) => {
                tracing::error!(error = %e, "Cannot load server certificate");
                tracing::info!("No server certificate - disabling TLS connections");
                false
            }
        }
    }

    pub fn has_server_tls(&self) -> bool {
        self.server_tls.is_some()
    }

    /// Listen on `port` with one listener per address family, each bound to
    /// the matching local address or the wildcard. Succeeds if at least one
    /// family could listen.
    pub fn listen(
        &mut self,
        port: u16,
        backlog: i32,
        max_lifetime: Option<Duration>,
        tls_mode: TlsMode,
        local_v4: Option<&str>,
        local_v6: Option<&str>,
    ) -> Result<Vec<ListenerId>, ListenerError> {
        if matches!(tls_mode, TlsMode::Immediate | TlsMode::StartTlsServer) && self.server_tls.is_none() {
            return Err(ListenerError::NoTlsConfig);
        }

        let mut opened = Vec::new();

        for family in AddressFamily::all() {
            let local = match family {
                AddressFamily::V4 => local_v4,
                AddressFamily::V6 => local_v6,
            };
            let ip = address::local_bind_address(local, family).unwrap_or_else(|| family.unspecified());

            let id = self.listener_ids.next();
            match Listener::open(id, SocketAddr::new(ip, port), backlog, tls_mode, max_lifetime) {
                Ok(listener) if fits_fd_set(listener.raw_fd()) => {
                    opened.push(id);
                    self.listeners.push(listener);
                }
                Ok(_) => tracing::error!(%family, port, "Listener socket number too high for select()"),
                Err(e) => tracing::warn!(%family, port, error = %e, "Cannot listen"),
            }
        }

        if opened.is_empty() {
            return Err(ListenerError::NoListener(port));
        }
        Ok(opened)
    }

    pub fn listeners(&self) -> &[Listener] {
        &self.listeners
    }

    pub fn listener(&self, id: ListenerId) -> Option<&Listener> {
        self.listeners.iter().find(|l| l.id() == id)
    }

    /// Accept one connection waiting on a listener.
    ///
    /// The handler sees it first and may reject it; an immediate-TLS
    /// connection then starts its handshake straight away. Returns `None` if
    /// nothing was waiting, or the connection didn't survive that far.
    pub fn accept(&mut self, listener: ListenerId) -> Option<ConnectionId> {
        let listener = self.listeners.iter().find(|l| l.id() == listener)?;
        let (socket, peer) = listener.accept()?;

        let id = self.connection_ids.next();
        let tls_mode = listener.tls_mode();
        let info = NewConnectionInfo {
            id,
            listener: listener.id(),
            peer,
            tls_mode,
        };
        let max_lifetime = listener.max_lifetime();

        let data = match self.handler.new_connection(&info) {
            Some(data) => data,
            None => {
                tracing::info!(%id, %peer, "Connection rejected");
                return None;
            }
        };

        let (state, context) = match tls_mode {
            TlsMode::Immediate => (ConnectionState::TlsInit, self.server_tls.clone().map(TlsContext::Server)),
            TlsMode::StartTlsServer => (ConnectionState::Plaintext, self.server_tls.clone().map(TlsContext::Server)),
            _ => (ConnectionState::Plaintext, None),
        };

        let mut conn = Connection::new(id, socket, peer, state, data)
            .with_tls(tls_mode, context)
            .with_max_lifetime(max_lifetime);

        if !conn.raw_fd().map_or(false, fits_fd_set) {
            tracing::error!(%id, %peer, "Socket number too high for select(); dropping connection");
            conn.close(Direction::Both);
        } else if tls_mode == TlsMode::Immediate {
            conn.begin_handshake(HandshakeRole::Accept);
        }

        deliver(&mut self.handler, &mut conn);

        if conn.state().is_dead() {
            call(&mut self.handler, &mut conn, ConnectionEvent::Cleanup);
            return None;
        }

        tracing::info!(%id, %peer, "Incoming connection");
        self.connections.push(conn);
        Some(id)
    }

    /// Start an outbound connection. `ConnectStart` is raised before
    /// connecting; the connect result arrives as `ConnectComplete` or
    /// `ConnectFailed`, now or in a later cycle.
    pub fn prepare_connection(&mut self, request: &ConnectRequest, data: H::Data) -> Result<ConnectionId, ListenerError> {
        let peer = address::resolve(&request.host, request.port).map_err(|e| {
            tracing::error!(host = %request.host, error = %e, "Invalid destination address");
            e
        })?;
        let family = AddressFamily::of(&peer);
        tracing::debug!(%peer, %family, "Will connect");

        let tls_mode = match (request.socktype, request.tls_mode) {
            (SockType::Datagram, mode) if mode != TlsMode::None => {
                tracing::warn!(%peer, "TLS is not available on datagram sockets");
                TlsMode::None
            }
            (_, mode) => mode,
        };

        let local = address::local_bind_address(request.local.as_deref(), family);
        let socket = socket::outbound_socket(family, request.socktype, local).map_err(|e| {
            tracing::error!(error = %e, "No socket available");
            e
        })?;

        let context = match tls_mode {
            TlsMode::None | TlsMode::StartTlsServer => None,
            TlsMode::Immediate | TlsMode::StartTlsClient => Some(self.client_context(request, peer)?),
        };

        let id = self.connection_ids.next();
        let mut conn = Connection::new(id, socket, peer, ConnectionState::PlaintextConnecting, data)
            .with_tls(tls_mode, context)
            .with_socktype(request.socktype)
            .with_max_lifetime(request.max_lifetime);

        if !conn.raw_fd().map_or(false, fits_fd_set) {
            tracing::error!(%id, %peer, "Socket number too high for select()");
            conn.close(Direction::Both);
            deliver(&mut self.handler, &mut conn);
            return Err(ListenerError::IoError(io::Error::from_raw_os_error(libc::EMFILE)));
        }

        call(&mut self.handler, &mut conn, ConnectionEvent::ConnectStart);

        let connected = conn.connect();
        deliver(&mut self.handler, &mut conn);

        if !connected {
            let error = conn.last_error().map(copy_error).unwrap_or_else(|| io::ErrorKind::NotConnected.into());
            call(&mut self.handler, &mut conn, ConnectionEvent::Cleanup);
            return Err(ListenerError::ConnectFailed(peer, error));
        }

        self.connections.push(conn);
        Ok(id)
    }

    fn client_context(&self, request: &ConnectRequest, peer: SocketAddr) -> Result<TlsContext, ListenerError> {
        let identity = match &request.cert_file {
            Some(cert_file) => Some(tls::load_identity(cert_file, request.key_file.as_deref()).map_err(|e| {
                tracing::error!(cert = ?cert_file, key = ?request.key_file, error = %e, "Client certificate not available");
                e
            })?),
            None => None,
        };

        let (name, send_sni) = tls::server_name_for(request.server_name.as_deref(), peer.ip())?;
        let config = tls::client_config(identity, send_sni)?;

        Ok(TlsContext::Client(config, name))
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&Connection<H::Data>> {
        self.connections.iter().find(|c| c.id() == id)
    }

    pub fn connection_mut(&mut self, id: ConnectionId) -> Option<&mut Connection<H::Data>> {
        self.connections.iter_mut().find(|c| c.id() == id)
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection<H::Data>> {
        self.connections.iter()
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    fn parts(&mut self, id: ConnectionId) -> Result<(&mut H, &mut Connection<H::Data>), ConnectionError> {
        let conn = self
            .connections
            .iter_mut()
            .find(|c| c.id() == id)
            .ok_or(ConnectionError::Closed)?;
        Ok((&mut self.handler, conn))
    }

    /// [`Connection::read`] on the connection with this id, from outside a
    /// handler call.
    pub fn read(&mut self, id: ConnectionId, buf: &mut [u8]) -> Result<usize, ConnectionError> {
        let (handler, conn) = self.parts(id)?;
        let result = conn.read(buf);
        deliver(handler, conn);
        result
    }

    /// [`Connection::write`] on the connection with this id, from outside a
    /// handler call.
    pub fn write(&mut self, id: ConnectionId, buf: &[u8]) -> Result<usize, ConnectionError> {
        let (handler, conn) = self.parts(id)?;
        let result = conn.write(buf);
        deliver(handler, conn);
        result
    }

    pub fn close_connection(&mut self, id: ConnectionId, direction: Direction) {
        if let Ok((handler, conn)) = self.parts(id) {
            conn.close(direction);
            deliver(handler, conn);
        }
    }

    /// Upgrade a plaintext connection to TLS. Returns whether the upgrade
    /// could be started; its outcome is reported through events.
    pub fn start_tls(&mut self, id: ConnectionId) -> bool {
        match self.parts(id) {
            Ok((handler, conn)) => {
                let started = conn.start_tls().is_ok();
                deliver(handler, conn);
                started
            }
            Err(_) => false,
        }
    }

    pub fn peer_certificate(&self, id: ConnectionId) -> Option<PeerCertificate> {
        self.connection(id)?.peer_certificate()
    }

    /// Work out what every socket is waiting for.
    ///
    /// Listeners wait for reads. Connections exchanging data are asked
    /// through `ReadCheck` and `WriteCheck`; one that wants neither is
    /// finished and is closed here. Connections mid-handshake wait for
    /// whatever the handshake needs, and outbound connects for writability.
    pub fn build_interest_sets(&mut self) -> InterestSets {
        let mut sets = InterestSets::new();

        for listener in &self.listeners {
            sets.add_read(listener.raw_fd());
        }

        let handler = &mut self.handler;
        for conn in self.connections.iter_mut() {
            let fd = match conn.raw_fd() {
                Some(fd) => fd,
                None => continue,
            };

            match conn.state().interest() {
                Interest::Nothing => {}
                Interest::Read => sets.add_read(fd),
                Interest::Write => sets.add_write(fd),
                Interest::Both => {
                    sets.add_read(fd);
                    sets.add_write(fd);
                }
                Interest::Application => {
                    let want_read = call(handler, conn, ConnectionEvent::ReadCheck) == CallbackResult::Ok;
                    if conn.state().is_dead() {
                        continue;
                    }
                    let want_write = call(handler, conn, ConnectionEvent::WriteCheck) == CallbackResult::Ok;
                    if conn.state().is_dead() {
                        continue;
                    }

                    if want_read {
                        sets.add_read(fd);
                        if conn.has_buffered_plaintext() {
                            sets.add_buffered(fd);
                        }
                    }
                    if want_write {
                        sets.add_write(fd);
                    }
                    if !want_read && !want_write {
                        tracing::debug!(id = %conn.id(), "Done with connection");
                        conn.close(Direction::Both);
                        deliver(handler, conn);
                    }
                }
            }
        }

        sets
    }

    /// Accept one connection on every listener that is ready.
    pub fn dispatch_listeners(&mut self, ready: &InterestSets) {
        let ready: Vec<ListenerId> = self
            .listeners
            .iter()
            .filter(|l| ready.is_readable(l.raw_fd()))
            .map(Listener::id)
            .collect();

        for id in ready {
            self.accept(id);
        }
    }

    /// Advance every connection that is ready: retry pending handshakes,
    /// resolve outbound connects, and raise `Read` and `Write` (reads
    /// first). Then raise `Timeout` on any connection past its lifetime.
    pub fn dispatch_active(&mut self, ready: &InterestSets) {
        let now = Instant::now();
        let handler = &mut self.handler;

        for conn in self.connections.iter_mut() {
            let fd = match conn.raw_fd() {
                Some(fd) => fd,
                None => continue,
            };

            if ready.is_readable(fd) {
                let state = conn.state();
                if state.handshake_role().is_some() || state == ConnectionState::TlsInit {
                    conn.advance_handshake();
                    deliver(handler, conn);
                } else if !state.is_connecting() {
                    let result = call(handler, conn, ConnectionEvent::Read);
                    if conn.state().is_dead() {
                        continue;
                    }
                    if result == CallbackResult::StartTls {
                        start_tls_on_request(handler, conn);
                    }
                }
            }

            if ready.is_writable(fd) && !conn.state().is_dead() {
                let mut result = CallbackResult::Ok;
                let state = conn.state();

                if state.is_connecting() {
                    conn.complete_connect();
                    deliver(handler, conn);

                    if matches!(conn.state(), ConnectionState::Plaintext | ConnectionState::TlsReady)
                        && call(handler, conn, ConnectionEvent::WriteCheck) == CallbackResult::Ok
                    {
                        result = call(handler, conn, ConnectionEvent::Write);
                    }
                } else if state.handshake_role().is_some() || state == ConnectionState::TlsInit {
                    conn.advance_handshake();
                    deliver(handler, conn);
                } else {
                    if state == ConnectionState::TlsWrite {
                        // Queued records go out before anything new
                        let _ = conn.flush();
                        deliver(handler, conn);
                    }
                    if !conn.state().is_dead() {
                        result = call(handler, conn, ConnectionEvent::Write);
                    }
                }

                if conn.state().is_dead() {
                    continue;
                }
                if result == CallbackResult::StartTls {
                    start_tls_on_request(handler, conn);
                }
            }

            if conn.is_timed_out(now) {
                call(handler, conn, ConnectionEvent::Timeout);
            }
        }
    }

    /// One full cycle: build the interest sets, wait up to `timeout` for
    /// readiness, then dispatch listeners and active connections in that
    /// order. Returns the number of ready sockets.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        let mut sets = self.build_interest_sets();
        let ready = sets.wait(timeout)?;

        self.dispatch_listeners(&sets);
        self.dispatch_active(&sets);

        Ok(ready)
    }

    /// Connections that are not dead yet.
    pub fn active_count(&self) -> usize {
        self.connections.iter().filter(|c| !c.state().is_dead()).count()
    }

    /// Remove dead connections, raising `Cleanup` for each, and return how
    /// many remain.
    pub fn reap(&mut self) -> usize {
        let handler = &mut self.handler;
        let connections = std::mem::take(&mut self.connections);

        for mut conn in connections {
            if conn.state().is_dead() {
                call(handler, &mut conn, ConnectionEvent::Cleanup);
            } else {
                self.connections.push(conn);
            }
        }

        self.connections.len()
    }

    /// Close every listener and every connection, and drop the server TLS
    /// context.
    pub fn shutdown_all(&mut self) {
        for listener in self.listeners.drain(..) {
            tracing::info!(id = %listener.id(), address = %listener.local_addr(), "Closing listener");
        }

        let handler = &mut self.handler;
        for conn in self.connections.iter_mut() {
            conn.close(Direction::Both);
            deliver(handler, conn);
        }

        self.server_tls = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        events: Vec<(ConnectionId, ConnectionEvent)>,
    }

    impl ConnectionHandler for Recorder {
        type Data = ();

        fn new_connection(&mut self, _info: &NewConnectionInfo) -> Option<()> {
            Some(())
        }

        fn handle_event(&mut self, conn: &mut Connection<()>, event: ConnectionEvent) -> CallbackResult {
            self.events.push((conn.id(), event));
            CallbackResult::Ok
        }
    }

    #[test]
    fn connect_to_nowhere() {
        let mut reactor = Reactor::init_client(Recorder::default());

        let result = reactor.prepare_connection(&ConnectRequest::new("not an address!", 1984), ());
        assert!(matches!(result, Err(ListenerError::Resolve(_))));
        assert_eq!(reactor.active_count(), 0);
    }

    #[test]
    fn immediate_tls_needs_a_certificate() {
        let mut reactor = Reactor::init_client(Recorder::default());

        let result = reactor.listen(0, 5, None, TlsMode::Immediate, Some("127.0.0.1"), None);
        assert!(matches!(result, Err(ListenerError::NoTlsConfig)));
        assert!(reactor.listeners().is_empty());
    }

    #[test]
    fn refused_connection_fails() {
        // Find a port nobody is listening on
        let port = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };

        let mut reactor = Reactor::init_client(Recorder::default());
        let id = match reactor.prepare_connection(&ConnectRequest::new("127.0.0.1", port), ()) {
            Ok(id) => id,
            // Refused synchronously
            Err(ListenerError::ConnectFailed(..)) => return,
            Err(e) => panic!("unexpected error {}", e),
        };

        for _ in 0..50 {
            reactor.run_once(Some(Duration::from_millis(20))).unwrap();
            if reactor.active_count() == 0 {
                break;
            }
        }

        assert_eq!(reactor.active_count(), 0);
        assert!(reactor.connection(id).unwrap().last_error().is_some());

        let events: Vec<_> = reactor.handler().events.iter().map(|(_, e)| *e).collect();
        assert_eq!(events[0], ConnectionEvent::ConnectStart);
        assert!(events.contains(&ConnectionEvent::ConnectFailed));
        assert_eq!(events.iter().filter(|e| **e == ConnectionEvent::Closed).count(), 1);

        assert_eq!(reactor.reap(), 0);
        assert_eq!(reactor.handler().events.last(), Some(&(id, ConnectionEvent::Cleanup)));
    }
}
