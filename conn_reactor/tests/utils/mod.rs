use conn_reactor::*;

use std::{
    path::PathBuf,
    time::Duration,
};

/// A scriptable peer: what it sends, what it got, and when it upgrades.
#[derive(Clone, Debug, Default)]
pub struct Peer {
    pub inbox: Vec<u8>,
    pub outbox: Vec<u8>,
    /// Send back everything received
    pub echo: bool,
    /// The other side has stopped sending
    pub finished: bool,
    /// Upgrade to TLS once the input ends with this
    pub starttls_on: Option<&'static [u8]>,
    /// Sent in plaintext just before upgrading
    pub starttls_reply: Option<&'static [u8]>,
    /// Queued once a TLS handshake completes
    pub after_tls: Vec<u8>,
    pub certificate: Option<PeerCertificate>,
    /// Leave the connection open when its lifetime runs out
    pub ignore_timeout: bool,
}

impl Peer {
    pub fn sending(data: &[u8]) -> Self {
        Self {
            outbox: data.to_vec(),
            ..Default::default()
        }
    }

    pub fn echo() -> Self {
        Self {
            echo: true,
            ..Default::default()
        }
    }
}

/// Drives every connection from a [`Peer`], and logs every event it sees.
#[derive(Default)]
pub struct TestHandler {
    pub log: Vec<(ConnectionId, ConnectionEvent)>,
    /// Template for accepted connections
    pub server: Peer,
    pub reject: bool,
    pub accepted: Vec<NewConnectionInfo>,
    pub rejected: usize,
}

impl TestHandler {
    pub fn serving(server: Peer) -> Self {
        Self {
            server,
            ..Default::default()
        }
    }

    pub fn events_for(&self, id: ConnectionId) -> Vec<ConnectionEvent> {
        self.log.iter().filter(|(c, _)| *c == id).map(|(_, e)| *e).collect()
    }

    pub fn count(&self, id: ConnectionId, event: ConnectionEvent) -> usize {
        self.log.iter().filter(|(c, e)| *c == id && *e == event).count()
    }

    fn on_read(conn: &mut Connection<Peer>) -> CallbackResult {
        let mut buf = vec![0u8; 64 * 1024];

        // Take everything available, so large transfers need few cycles
        loop {
            match conn.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => conn.data_mut().inbox.extend_from_slice(&buf[..n]),
                Err(ConnectionError::EndOfStream) => {
                    conn.data_mut().finished = true;
                    return CallbackResult::Ok;
                }
                Err(_) => return CallbackResult::Failed,
            }
            if conn.data().starttls_on.is_some() {
                break;
            }
        }

        let peer = conn.data_mut();
        if let Some(trigger) = peer.starttls_on {
            if peer.inbox.ends_with(trigger) {
                peer.inbox.clear();
                peer.starttls_on = None;

                if let Some(reply) = peer.starttls_reply {
                    if conn.write(reply).is_err() {
                        return CallbackResult::Failed;
                    }
                }
                return CallbackResult::StartTls;
            }
        }

        if peer.echo {
            let received: Vec<u8> = peer.inbox.drain(..).collect();
            peer.outbox.extend_from_slice(&received);
        }
        CallbackResult::Ok
    }

    fn on_write(conn: &mut Connection<Peer>) -> CallbackResult {
        let mut outbox = std::mem::take(&mut conn.data_mut().outbox);

        match conn.write(&outbox) {
            Ok(n) => {
                outbox.drain(..n);
                conn.data_mut().outbox = outbox;
                CallbackResult::Ok
            }
            Err(_) => CallbackResult::Failed,
        }
    }
}

impl ConnectionHandler for TestHandler {
    type Data = Peer;

    fn new_connection(&mut self, info: &NewConnectionInfo) -> Option<Peer> {
        if self.reject {
            self.rejected += 1;
            return None;
        }
        self.accepted.push(info.clone());
        Some(self.server.clone())
    }

    fn handle_event(&mut self, conn: &mut Connection<Peer>, event: ConnectionEvent) -> CallbackResult {
        self.log.push((conn.id(), event));

        match event {
            ConnectionEvent::ReadCheck => (!conn.data().finished).into(),
            ConnectionEvent::WriteCheck => (!conn.data().outbox.is_empty()).into(),
            ConnectionEvent::Read => Self::on_read(conn),
            ConnectionEvent::Write => Self::on_write(conn),
            ConnectionEvent::SslHandshakeOk => {
                let certificate = conn.peer_certificate();
                let peer = conn.data_mut();
                peer.certificate = certificate;
                let queued = std::mem::take(&mut peer.after_tls);
                peer.outbox.extend_from_slice(&queued);
                CallbackResult::Ok
            }
            ConnectionEvent::Timeout => {
                if !conn.data().ignore_timeout {
                    conn.close(Direction::Both);
                }
                CallbackResult::Ok
            }
            _ => CallbackResult::Ok,
        }
    }
}

/// Run reactor cycles until `done` holds, for at most 500 cycles.
pub fn run_until(reactor: &mut Reactor<TestHandler>, done: impl FnMut(&Reactor<TestHandler>) -> bool) -> bool {
    run_cycles_until(reactor, 500, done)
}

pub fn run_cycles_until(
    reactor: &mut Reactor<TestHandler>,
    cycles: usize,
    mut done: impl FnMut(&Reactor<TestHandler>) -> bool,
) -> bool {
    for _ in 0..cycles {
        if done(reactor) {
            return true;
        }
        reactor.run_once(Some(Duration::from_millis(10))).unwrap();
    }
    done(reactor)
}

/// The IPv4 port a reactor listens on with the given TLS mode.
pub fn v4_port(reactor: &Reactor<TestHandler>, mode: TlsMode) -> u16 {
    reactor
        .listeners()
        .iter()
        .find(|l| l.family() == AddressFamily::V4 && l.tls_mode() == mode)
        .expect("no IPv4 listener")
        .local_addr()
        .port()
}

pub fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("conn_reactor-{}-{}", name, std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Bytes that make a misplaced or repeated chunk show up in a comparison.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// A self-signed certificate and its key in one PEM file.
pub fn write_identity(name: &str) -> PathBuf {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
    let path = scratch_dir(name).join("server.pem");
    std::fs::write(&path, format!("{}{}", certified.cert.pem(), certified.key_pair.serialize_pem())).unwrap();
    path
}

pub fn server_settings(port: Option<u16>, tls: Option<ServerTlsSettings>) -> ServerSettings {
    ServerSettings {
        port,
        tls,
        local_v4: Some("127.0.0.1".to_string()),
        local_v6: Some("::1".to_string()),
        ..Default::default()
    }
}

pub fn tls_settings(cert_file: PathBuf, port: Option<u16>) -> ServerTlsSettings {
    ServerTlsSettings {
        cert_file,
        key_file: None,
        port,
        root_ca_file: None,
        require_client_cert: false,
    }
}
