//! Tracing subscriber setup
//!
//! Binaries call [`init_logging`] once with a [`LogConfig`], usually read from
//! the environment. Output goes to the console, to a daily-rotated file, or
//! both, as text or JSON. Library code only uses the `tracing` macros with
//! structured fields:
//!
//! ```rust,ignore
//! tracing::warn!(job_id = %job.id, row = 5, error = %err, "Row rejected");
//! ```
//!
//! ```no_run
//! use sacra_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     init_logging(&LogConfig::from_env()?)?;
//!     tracing::info!("Importer ready");
//!     Ok(())
//! }
//! ```

use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::fmt::{self, format::FmtSpan};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Where log lines go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogOutput {
    #[default]
    Console,
    File,
    Both,
}

impl LogOutput {
    const NAMES: &'static [(&'static str, LogOutput)] = &[
        ("console", LogOutput::Console),
        ("stdout", LogOutput::Console),
        ("file", LogOutput::File),
        ("both", LogOutput::Both),
    ];

    fn console(self) -> bool {
        self != LogOutput::File
    }

    fn file(self) -> bool {
        self != LogOutput::Console
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    const NAMES: &'static [(&'static str, LogFormat)] = &[("text", LogFormat::Text), ("json", LogFormat::Json)];
}

fn lookup<T: Copy>(what: &str, value: &str, names: &[(&str, T)]) -> Result<T> {
    names
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(value.trim()))
        .map(|(_, v)| *v)
        .ok_or_else(|| anyhow!("Invalid {}: {}", what, value))
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Level,
    pub output: LogOutput,
    pub format: LogFormat,
    /// Only read when `output` includes a file
    pub log_dir: PathBuf,
    /// Rotated files are named `<prefix>.<date>`
    pub log_file_prefix: String,
    /// Extra `EnvFilter` directives, comma separated (`sqlx=warn,sacra_import=debug`)
    pub filter_directives: Option<String>,
    /// Emit file and line of each event
    pub include_location: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            output: LogOutput::Console,
            format: LogFormat::Text,
            log_dir: PathBuf::from("./logs"),
            log_file_prefix: "sacra".to_string(),
            filter_directives: None,
            include_location: false,
        }
    }
}

impl LogConfig {
    /// Read `LOG_LEVEL`, `LOG_OUTPUT`, `LOG_FORMAT`, `LOG_DIR`,
    /// `LOG_FILE_PREFIX`, `LOG_FILTER` and `LOG_INCLUDE_LOCATION`; unset
    /// variables keep their defaults
    pub fn from_env() -> Result<Self> {
        let var = |name: &str| std::env::var(name).ok();
        let mut config = Self::default();

        if let Some(level) = var("LOG_LEVEL") {
            config.level = level
                .trim()
                .parse()
                .map_err(|_| anyhow!("Invalid log level: {}", level))?;
        }
        if let Some(output) = var("LOG_OUTPUT") {
            config.output = lookup("log output", &output, LogOutput::NAMES)?;
        }
        if let Some(format) = var("LOG_FORMAT") {
            config.format = lookup("log format", &format, LogFormat::NAMES)?;
        }
        if let Some(dir) = var("LOG_DIR") {
            config.log_dir = dir.into();
        }
        if let Some(prefix) = var("LOG_FILE_PREFIX") {
            config.log_file_prefix = prefix;
        }
        config.filter_directives = var("LOG_FILTER").or(config.filter_directives);
        if let Some(flag) = var("LOG_INCLUDE_LOCATION") {
            config.include_location = flag
                .trim()
                .parse()
                .with_context(|| format!("LOG_INCLUDE_LOCATION must be true or false, got {}", flag))?;
        }

        Ok(config)
    }

    fn env_filter(&self) -> Result<EnvFilter> {
        let directives = self.filter_directives.as_deref().unwrap_or_default();
        directives
            .split(',')
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .try_fold(
                EnvFilter::from_default_env().add_directive(self.level.into()),
                |filter, directive| -> Result<EnvFilter> {
                    let parsed = directive
                        .parse()
                        .with_context(|| format!("Bad log filter directive '{}'", directive))?;
                    Ok(filter.add_directive(parsed))
                },
            )
    }

    fn layer<W>(&self, writer: W, ansi: bool) -> BoxedLayer
    where
        W: for<'w> fmt::MakeWriter<'w> + Send + Sync + 'static,
    {
        let layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(ansi)
            .with_file(self.include_location)
            .with_line_number(self.include_location)
            .with_span_events(FmtSpan::CLOSE);

        match self.format {
            LogFormat::Text => layer.boxed(),
            LogFormat::Json => layer.json().boxed(),
        }
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LogConfig) -> Result<()> {
    let mut layers: Vec<BoxedLayer> = Vec::new();

    if config.output.console() {
        layers.push(config.layer(std::io::stdout, true));
    }
    if config.output.file() {
        std::fs::create_dir_all(&config.log_dir)
            .with_context(|| format!("Cannot create log directory {}", config.log_dir.display()))?;
        let appender = tracing_appender::rolling::daily(&config.log_dir, &config.log_file_prefix);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        // flushed on drop; the subscriber outlives every caller
        std::mem::forget(guard);
        layers.push(config.layer(writer, false));
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(config.env_filter()?)
        .try_init()
        .context("Failed to install tracing subscriber")
}

/// Subscriber for tests: captured per test, installed at most once
pub fn init_test_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sacra_import=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
