use crate::error::ConfigError;

use std::collections::HashMap;
use tracing_core::{
    LevelFilter,
};
use std::{
    path::{
        Path,
        PathBuf,
    },
    fs::File,
    io::BufReader,
    time::Duration,
};

#[derive(Clone,Debug,serde::Serialize,serde::Deserialize)]
#[serde(rename_all="lowercase")]
pub enum BuiltinLogTarget
{
    Stdout,
    Stderr,
}

#[derive(Clone,Debug,serde::Serialize,serde::Deserialize)]
#[serde(untagged)]
pub enum LogTarget
{
    File { filename: PathBuf },
    Builtin(BuiltinLogTarget),
}

#[derive(Clone,Copy,Debug,PartialEq,Eq,serde::Serialize,serde::Deserialize)]
#[serde(rename_all ="lowercase")]
pub enum LogLevel
{
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Off,
}

#[derive(Clone,Debug,serde::Deserialize)]
pub struct LogEntry
{
    pub target: LogTarget,
    #[serde(default)]
    pub modules: Vec<String>,
    pub level: Option<LogLevel>,
}

#[derive(Clone,Debug,serde::Deserialize)]
#[serde(rename_all="kebab-case")]
pub struct LoggingConfig
{
    /// Directory for file log targets
    #[serde(default="default_log_dir")]
    pub dir: PathBuf,
    pub default_level: Option<LogLevel>,
    #[serde(default)]
    pub module_levels: HashMap<String, LogLevel>,
    #[serde(default="default_log_targets")]
    pub targets: Vec<LogEntry>,
}

fn default_log_dir() -> PathBuf
{
    PathBuf::from(".")
}

fn default_log_targets() -> Vec<LogEntry>
{
    vec![LogEntry { target: LogTarget::Builtin(BuiltinLogTarget::Stderr), modules: Vec::new(), level: None }]
}

impl Default for LoggingConfig
{
    fn default() -> Self
    {
        Self {
            dir: default_log_dir(),
            default_level: Some(LogLevel::Info),
            module_levels: HashMap::new(),
            targets: default_log_targets(),
        }
    }
}

/// Certificate settings for a server's TLS listeners.
#[derive(Clone,Debug,serde::Serialize,serde::Deserialize)]
pub struct ServerTlsSettings
{
    pub cert_file: PathBuf,
    /// Where the private key is, if not in `cert_file`
    pub key_file: Option<PathBuf>,
    /// Port for immediate-TLS connections. Without it, TLS is only
    /// available through STARTTLS on the plaintext port.
    pub port: Option<u16>,
    /// Root CA bundle to verify client certificates against
    pub root_ca_file: Option<PathBuf>,
    #[serde(default)]
    pub require_client_cert: bool,
}

/// What [`Reactor::init_server`](crate::Reactor::init_server) should listen on.
#[derive(Clone,Debug,serde::Serialize,serde::Deserialize)]
pub struct ServerSettings
{
    /// Plaintext (or STARTTLS) port. `None` for no plaintext listener; port 0
    /// picks a free one.
    pub port: Option<u16>,
    #[serde(default="default_backlog")]
    pub backlog: i32,
    /// Maximum connection lifetime before timeouts are raised; 0 for none
    #[serde(default)]
    pub max_lifetime_ms: u64,
    pub tls: Option<ServerTlsSettings>,
    pub local_v4: Option<String>,
    pub local_v6: Option<String>,
}

fn default_backlog() -> i32
{
    512
}

impl Default for ServerSettings
{
    fn default() -> Self
    {
        Self {
            port: None,
            backlog: default_backlog(),
            max_lifetime_ms: 0,
            tls: None,
            local_v4: None,
            local_v6: None,
        }
    }
}

impl ServerSettings
{
    pub fn max_lifetime(&self) -> Option<Duration>
    {
        (self.max_lifetime_ms > 0).then(|| Duration::from_millis(self.max_lifetime_ms))
    }
}

/// A configuration file for a reactor-driven server.
#[derive(Clone,Debug,serde::Deserialize)]
pub struct ReactorConfig
{
    #[serde(flatten)]
    pub server: ServerSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

pub fn load_config(filename: impl AsRef<Path>) -> Result<ReactorConfig, ConfigError>
{
    let file = File::open(filename)?;
    let reader = BufReader::new(file);
    Ok(serde_json::from_reader(reader)?)
}

impl From<LogLevel> for LevelFilter
{
    fn from(arg: LogLevel) -> LevelFilter
    {
        match arg
        {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info  => LevelFilter::INFO,
            LogLevel::Warn  => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Off   => LevelFilter::OFF,
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn full_config()
    {
        let config: ReactorConfig = serde_json::from_str(r#"{
            "port": 1984,
            "max_lifetime_ms": 30000,
            "tls": {
                "cert_file": "/etc/reactor/server.crt",
                "port": 1985,
                "require_client_cert": true
            },
            "local_v4": "127.0.0.1",
            "logging": {
                "default-level": "debug",
                "module-levels": { "rustls": "warn" },
                "targets": [ { "target": { "filename": "reactor.log" }, "level": "info" }, { "target": "stdout" } ]
            }
        }"#).unwrap();

        assert_eq!(config.server.port, Some(1984));
        assert_eq!(config.server.backlog, 512);
        assert_eq!(config.server.max_lifetime(), Some(Duration::from_secs(30)));
        assert_eq!(config.server.local_v6, None);

        let tls = config.server.tls.unwrap();
        assert_eq!(tls.port, Some(1985));
        assert_eq!(tls.key_file, None);
        assert!(tls.require_client_cert);

        assert_eq!(config.logging.default_level, Some(LogLevel::Debug));
        assert_eq!(config.logging.module_levels.get("rustls"), Some(&LogLevel::Warn));
        assert_eq!(config.logging.targets.len(), 2);
        assert!(matches!(config.logging.targets[0].target, LogTarget::File { .. }));
        assert_eq!(config.logging.dir, PathBuf::from("."));
    }

    #[test]
    fn minimal_config()
    {
        let config: ReactorConfig = serde_json::from_str(r#"{ "port": 0 }"#).unwrap();

        assert_eq!(config.server.max_lifetime(), None);
        assert!(config.server.tls.is_none());
        assert_eq!(config.logging.targets.len(), 1);
    }

    #[test]
    fn missing_file()
    {
        assert!(matches!(load_config("/nonexistent/reactor.json"), Err(ConfigError::IoError(_))));
    }
}
