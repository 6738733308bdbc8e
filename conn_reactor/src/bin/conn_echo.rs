//! A line echo server, driven by the connection reactor.
//!
//! Every line a client sends is sent back. `STARTTLS` upgrades a plaintext
//! connection when a certificate is configured, and `QUIT` ends it once any
//! pending output has been sent.

use conn_reactor::*;
use conn_reactor::tracing_config::build_subscriber;

use std::{
    path::PathBuf,
    time::Duration,
};
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(rename_all = "kebab")]
struct Opts
{
    /// Config file location
    #[structopt(short, long)]
    config: Option<PathBuf>,

    /// Plaintext port, if there is no config file
    #[structopt(short, long, default_value = "5555")]
    port: u16,

    /// Close connections older than this many seconds
    #[structopt(long)]
    max_lifetime: Option<u64>,
}

#[derive(Default)]
struct EchoSession
{
    input: Vec<u8>,
    output: Vec<u8>,
    done: bool,
}

struct EchoHandler;

impl EchoHandler
{
    /// Handle every complete line received so far. Returns whether the
    /// client asked for STARTTLS.
    fn process_lines(conn: &mut Connection<EchoSession>) -> bool
    {
        let starttls_allowed = conn.tls_mode() == TlsMode::StartTlsServer && conn.state() == ConnectionState::Plaintext;
        let session = conn.data_mut();

        while let Some(end) = session.input.iter().position(|b| *b == b'\n')
        {
            let line: Vec<u8> = session.input.drain(..=end).collect();
            let command = String::from_utf8_lossy(&line).trim().to_ascii_uppercase();

            match command.as_str()
            {
                "QUIT" =>
                {
                    session.output.extend_from_slice(b"BYE\n");
                    session.done = true;
                    return false;
                }
                "STARTTLS" if starttls_allowed && session.output.is_empty() =>
                {
                    return true;
                }
                _ => session.output.extend_from_slice(&line),
            }
        }
        false
    }

    fn on_read(conn: &mut Connection<EchoSession>) -> CallbackResult
    {
        let mut buf = [0u8; 4096];

        match conn.read(&mut buf)
        {
            Ok(n) => conn.data_mut().input.extend_from_slice(&buf[..n]),
            Err(ConnectionError::EndOfStream) =>
            {
                conn.data_mut().done = true;
                return CallbackResult::Ok;
            }
            Err(_) => return CallbackResult::Failed,
        }

        if Self::process_lines(conn)
        {
            // The go-ahead has to leave in plaintext, before the handshake starts
            if conn.write(b"OK begin TLS\n").is_err()
            {
                return CallbackResult::Failed;
            }
            return CallbackResult::StartTls;
        }
        CallbackResult::Ok
    }

    fn on_write(conn: &mut Connection<EchoSession>) -> CallbackResult
    {
        let output = std::mem::take(&mut conn.data_mut().output);

        match conn.write(&output)
        {
            Ok(n) =>
            {
                conn.data_mut().output = output[n..].to_vec();
                CallbackResult::Ok
            }
            Err(_) => CallbackResult::Failed,
        }
    }
}

impl ConnectionHandler for EchoHandler
{
    type Data = EchoSession;

    fn new_connection(&mut self, info: &NewConnectionInfo) -> Option<EchoSession>
    {
        tracing::info!(id = %info.id, peer = %info.peer, "New client");
        Some(EchoSession::default())
    }

    fn handle_event(&mut self, conn: &mut Connection<EchoSession>, event: ConnectionEvent) -> CallbackResult
    {
        match event
        {
            ConnectionEvent::ReadCheck => (!conn.data().done).into(),
            ConnectionEvent::WriteCheck => (!conn.data().output.is_empty()).into(),
            ConnectionEvent::Read => Self::on_read(conn),
            ConnectionEvent::Write => Self::on_write(conn),
            ConnectionEvent::SslHandshakeOk =>
            {
                if let Some(cert) = conn.peer_certificate()
                {
                    tracing::info!(id = %conn.id(), subject = %cert.subject, "Client certificate");
                }
                CallbackResult::Ok
            }
            ConnectionEvent::Timeout =>
            {
                tracing::info!(id = %conn.id(), elapsed = ?conn.elapsed(), "Client timed out");
                conn.close(Direction::Both);
                CallbackResult::Ok
            }
            ConnectionEvent::Closed =>
            {
                tracing::info!(id = %conn.id(), peer = %conn.print_address(), elapsed = ?conn.elapsed(), "Client gone");
                CallbackResult::Ok
            }
            _ => CallbackResult::Ok,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>>
{
    let opts = Opts::from_args();

    let config = match &opts.config
    {
        Some(path) => config::load_config(path)?,
        None => ReactorConfig {
            server: ServerSettings {
                port: Some(opts.port),
                max_lifetime_ms: opts.max_lifetime.map_or(0, |secs| secs * 1000),
                ..Default::default()
            },
            logging: Default::default(),
        },
    };

    let subscriber = build_subscriber(config.logging.clone())?;
    tracing::subscriber::set_global_default(subscriber)?;

    let mut reactor = Reactor::init_server_from_config(&config, EchoHandler)?;

    for listener in reactor.listeners()
    {
        tracing::info!(id = %listener.id(), address = %listener.local_addr(), tls = ?listener.tls_mode(), "Ready");
    }

    loop
    {
        reactor.run_once(Some(Duration::from_secs(1)))?;
        reactor.reap();
    }
}
