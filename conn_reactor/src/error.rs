use thiserror::Error;
use std::path::PathBuf;

/// An error that might occur on a single connection.
#[derive(Error,Debug)]
pub enum ConnectionError
{
    /// The connection has been torn down. Returned by reads and writes after
    /// any fatal condition, once the `Closed` event has been queued.
    #[error("Connection closed")]
    Closed,
    /// A plaintext peer has shut down its sending side. The connection stays
    /// open for writing until it is closed.
    #[error("End of stream")]
    EndOfStream,
    #[error("STARTTLS not possible: {0}")]
    StartTls(&'static str),
}

/// Failure to turn a textual address into a socket address.
#[derive(Error,Debug)]
pub enum ResolveError
{
    #[error("Invalid address {0}")]
    InvalidAddress(String),
    #[error("Unknown service {0}")]
    UnknownService(String),
    #[error("Lookup of {0} failed: {1}")]
    Lookup(String, std::io::Error),
}

/// An error that might occur when configuring a listener or an outbound connection.
#[derive(Error,Debug)]
pub enum ListenerError
{
    #[error("TLS requested with no TLS config")]
    NoTlsConfig,
    #[error("I/O Error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("No listener could be created on port {0}")]
    NoListener(u16),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error("connect to {0} failed: {1}")]
    ConnectFailed(std::net::SocketAddr, std::io::Error),
}

/// Problems loading certificates and keys, or building TLS contexts.
#[derive(Error,Debug)]
pub enum TlsError
{
    #[error("Cannot read {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("No certificate found in {0}")]
    NoCertificate(PathBuf),
    #[error("No private key found in {0}")]
    NoPrivateKey(PathBuf),
    #[error("Unusable private key in {0}: {1}")]
    BadKey(PathBuf, String),
    #[error("Cannot decrypt private key in {0}: {1}")]
    Decrypt(PathBuf, String),
    #[error("Private/public key mismatch for certificate {0}")]
    KeyMismatch(PathBuf),
    #[error("Unusable certificate: {0}")]
    BadCertificate(String),
    #[error("No usable root CA certificates in {0}")]
    NoRootCertificates(PathBuf),
    #[error("Invalid TLS server name {0}")]
    InvalidServerName(String),
    #[error("TLS configuration error: {0}")]
    Rustls(#[from] rustls::Error),
}

/// An error loading configuration.
#[derive(Error,Debug)]
pub enum ConfigError
{
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Format error: {0}")]
    FormatError(#[from] serde_json::Error),
}

impl ConnectionError
{
    /// Whether this is the closed-connection sentinel.
    pub fn is_closed(&self) -> bool
    {
        matches!(self, Self::Closed)
    }
}
