use crate::config::*;
use tracing_subscriber::{
    prelude::*,
    filter::filter_fn,
    layer::Context,
    Layer,
    registry::LookupSpan,
};
use tracing_core::{
    field::{Field, Visit},
    LevelFilter,
};
use tracing::{Event, Level, Subscriber};
use chrono::{DateTime, Utc};

use std::{
    fmt,
    io::{
        Error as IoError
    },
    path::Path,
};

fn build_target<S>(conf: LogEntry, dir: impl AsRef<Path>) -> Result<Box<dyn Layer<S> + Send + Sync + 'static>, IoError>
    where S: Subscriber + Send + Sync,
          for<'span> S: LookupSpan<'span>,

{
    let layer = match &conf.target
    {
        LogTarget::File { filename } =>
        {
            std::fs::create_dir_all(dir.as_ref())?;
            tracing_subscriber::fmt::layer()
                                     .with_writer(tracing_appender::rolling::daily(dir, filename))
                                     .with_ansi(false)
                                     .boxed()
        }
        LogTarget::Builtin(BuiltinLogTarget::Stdout) =>
        {
            tracing_subscriber::fmt::layer().with_writer(std::io::stdout).boxed()
        }
        LogTarget::Builtin(BuiltinLogTarget::Stderr) =>
        {
            tracing_subscriber::fmt::layer().with_writer(std::io::stderr).boxed()
        }
    };

    let filter = filter_fn(move |metadata| {
        let level: tracing_core::LevelFilter = if let Some(level) = conf.level { level.into() } else { LevelFilter::TRACE };
        metadata.level() <= &level &&
            (
                conf.modules.is_empty() ||
                    if let Some(module) = metadata.module_path() {
                        conf.modules.iter().any(|m| module.starts_with(m))
                    } else {
                        true
                    }
            )
    });

    Ok(layer.with_filter(filter).boxed())
}

/// Build a subscriber writing to every target in `conf`.
pub fn build_subscriber(conf: LoggingConfig) -> Result<impl Subscriber, IoError>
{
    let mut layers = Vec::new();

    for target in conf.targets
    {
        layers.push(build_target(target, &conf.dir)?);
    }

    // The global filter is for excluding overly verbose messages from external modules - its default
    // needs to be permissive so that individual log targets can filter as they need to
    let filter = tracing_subscriber::filter::Targets::new()
                    .with_default(conf.default_level.unwrap_or(LogLevel::Trace))
                    .with_targets(conf.module_levels);

    Ok(tracing_subscriber::registry()
            .with(filter)
            .with(layers)
        )
}

/// Severity of a diagnostic passed to an info handler, most severe first.
#[derive(Clone,Copy,Debug,PartialEq,Eq,PartialOrd,Ord,strum::Display)]
pub enum InfoLevel
{
    Critical,
    Error,
    Warn,
    Info,
    Debug,
}

impl From<InfoLevel> for Level
{
    fn from(level: InfoLevel) -> Level
    {
        match level
        {
            InfoLevel::Critical | InfoLevel::Error => Level::ERROR,
            InfoLevel::Warn => Level::WARN,
            InfoLevel::Info => Level::INFO,
            InfoLevel::Debug => Level::DEBUG,
        }
    }
}

impl From<&Level> for InfoLevel
{
    fn from(level: &Level) -> InfoLevel
    {
        match *level
        {
            Level::ERROR => InfoLevel::Error,
            Level::WARN => InfoLevel::Warn,
            Level::INFO => InfoLevel::Info,
            _ => InfoLevel::Debug,
        }
    }
}

/// One diagnostic, as delivered to an info handler.
#[derive(Clone,Debug)]
pub struct InfoRecord
{
    pub timestamp: DateTime<Utc>,
    pub level: InfoLevel,
    /// The module that emitted it
    pub origin: String,
    pub message: String,
}

pub type InfoCallback = Box<dyn Fn(&InfoRecord) + Send + Sync + 'static>;

#[derive(Default)]
struct MessageVisitor
{
    message: String,
    fields: Vec<String>,
}

impl Visit for MessageVisitor
{
    fn record_str(&mut self, field: &Field, value: &str)
    {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push(format!("{}={}", field.name(), value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug)
    {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.fields.push(format!("{}={:?}", field.name(), value));
        }
    }
}

impl MessageVisitor
{
    fn into_text(self) -> String
    {
        if self.fields.is_empty() {
            self.message
        } else {
            format!("{} {}", self.message, self.fields.join(" "))
        }
    }
}

/// A layer handing every event at or above a minimum severity to a callback.
pub struct InfoHandlerLayer
{
    callback: InfoCallback,
    minimum: Level,
}

impl InfoHandlerLayer
{
    pub fn new(callback: InfoCallback, minimum: InfoLevel) -> Self
    {
        Self { callback, minimum: minimum.into() }
    }
}

impl<S: Subscriber> Layer<S> for InfoHandlerLayer
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>)
    {
        let metadata = event.metadata();
        if *metadata.level() > self.minimum {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        (self.callback)(&InfoRecord {
            timestamp: Utc::now(),
            level: metadata.level().into(),
            origin: metadata.module_path().unwrap_or_else(|| metadata.target()).to_string(),
            message: visitor.into_text(),
        });
    }
}

/// Send diagnostics at or above `minimum` to `callback`, as the process's
/// global subscriber. Fails if one is already installed.
pub fn register_info_handler(callback: impl Fn(&InfoRecord) + Send + Sync + 'static, minimum: InfoLevel)
        -> Result<(), tracing_subscriber::util::TryInitError>
{
    tracing_subscriber::registry()
            .with(InfoHandlerLayer::new(Box::new(callback), minimum))
            .try_init()
}

/// Write diagnostics at or above `minimum` to standard error. For hosts that
/// have not registered an info handler.
pub fn init_default_logging(minimum: InfoLevel) -> Result<(), tracing_subscriber::util::TryInitError>
{
    tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_filter(LevelFilter::from_level(minimum.into())))
            .try_init()
}
