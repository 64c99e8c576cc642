use std::str::FromStr;

use serde::Deserialize;
use tracing::metadata::LevelFilter;
use tracing_subscriber::{
    Layer, Registry, filter::FilterFn, fmt::time::ChronoUtc,
    prelude::__tracing_subscriber_SubscriberExt, util::SubscriberInitExt,
};

/// Log a lifecycle event inside an `internal` span
///
/// Defaults to TRACE; pass `level = INFO` (etc.) first to raise it.
#[macro_export]
macro_rules! internal {
    (level = $level:ident, $($msg:expr),*) => {{
        let span = $crate::tracing::span!($crate::tracing::Level::$level, "internal");
        let _enter = span.enter();

        $crate::tracing::event!($crate::tracing::Level::$level, $($msg),*)
    }};

    ($($msg:expr),*) => {
        $crate::internal!(level = TRACE, $($msg),*)
    };
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum LogFormat {
    /// Single-line human readable events
    #[default]
    Compact,
    /// One JSON object per event
    Json,
}

const fn default_ansi() -> bool {
    true
}

/// The `logging` section of the configuration
///
/// ```ron
/// logging: (
///     level: Some("debug"),
///     format: Json,
/// )
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Most verbose level kept; `LOG_LEVEL` takes precedence
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub format: LogFormat,
    /// Colour compact output
    #[serde(default = "default_ansi")]
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: None,
            format: LogFormat::default(),
            ansi: default_ansi(),
        }
    }
}

impl LogConfig {
    /// The level to filter at, given the value of `LOG_LEVEL`
    ///
    /// The environment wins over the configuration. Without either, debug
    /// builds log everything and release builds log INFO and above.
    pub fn level(&self, env: Option<&str>) -> LevelFilter {
        let default = if cfg!(debug_assertions) {
            LevelFilter::TRACE
        } else {
            LevelFilter::INFO
        };

        env.or(self.level.as_deref()).map_or(default, |level| {
            LevelFilter::from_str(level).unwrap_or_else(|_| {
                eprintln!("Invalid log level specified {level}, defaulting to {default}");
                default
            })
        })
    }
}

fn is_silo_target(target: &str) -> bool {
    target.starts_with("silo")
}

/// Install the global subscriber
///
/// Only events from `silo*` targets are kept.
pub fn init(config: &LogConfig) {
    let level = config.level(std::env::var("LOG_LEVEL").ok().as_deref());

    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        LogFormat::Compact => tracing_subscriber::fmt::layer()
            .compact()
            .with_ansi(config.ansi)
            .with_thread_names(true)
            .with_timer(ChronoUtc::rfc_3339())
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_thread_names(true)
            .with_timer(ChronoUtc::rfc_3339())
            .boxed(),
    };

    Registry::default()
        .with(
            layer
                .with_filter(level)
                .with_filter(FilterFn::new(|metadata| is_silo_target(metadata.target()))),
        )
        .init();
}
