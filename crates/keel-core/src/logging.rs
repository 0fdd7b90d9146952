//! Subscriber setup for hosts: env-driven filter, a daily rolling log file
//! and an in-memory ring of recent lines the host can print on exit.

use std::collections::VecDeque;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use anyhow::Context;
use tracing::field::{Field, Visit};
use tracing_appender::rolling;
use tracing_subscriber::layer::{Context as LayerContext, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

const LOG_FILE_PREFIX: &str = "keel.log";
const RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "TRACE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl From<&tracing::Level> for LogLevel {
    fn from(level: &tracing::Level) -> Self {
        if *level == tracing::Level::ERROR {
            Self::Error
        } else if *level == tracing::Level::WARN {
            Self::Warn
        } else if *level == tracing::Level::INFO {
            Self::Info
        } else if *level == tracing::Level::DEBUG {
            Self::Debug
        } else {
            Self::Trace
        }
    }
}

/// A log line as kept in the ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub level: LogLevel,
    pub target: String,
    pub message: String,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:>5} {}: {}", self.level, self.target, self.message)
    }
}

/// Recent log lines shared between the subscriber and the host.
pub type LogBuffer = Arc<Mutex<VecDeque<LogEntry>>>;

pub fn new_log_buffer(capacity: usize) -> LogBuffer {
    Arc::new(Mutex::new(VecDeque::with_capacity(capacity)))
}

/// Entries at `level` or above, oldest first.
pub fn recent_entries(buffer: &LogBuffer, level: LogLevel) -> Vec<LogEntry> {
    let Ok(ring) = buffer.lock() else {
        return Vec::new();
    };
    ring.iter().filter(|e| e.level >= level).cloned().collect()
}

/// How [`init`] sets up logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOptions {
    /// Used when neither `KEEL_LOG` nor `RUST_LOG` is set.
    pub filter: String,
    /// Directory for the log file; [`log_dir`] when unset.
    pub dir: Option<PathBuf>,
    pub capture_lines: usize,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            dir: None,
            capture_lines: 256,
        }
    }
}

/// `KEEL_LOG_DIR` if set, else `~/Library/Logs/keel` on macOS and
/// `<data dir>/keel/logs` elsewhere.
pub fn log_dir() -> PathBuf {
    std::env::var_os("KEEL_LOG_DIR")
        .map(PathBuf::from)
        .or_else(platform_log_dir)
        .unwrap_or_else(|| PathBuf::from("logs"))
}

#[cfg(target_os = "macos")]
fn platform_log_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join("Library/Logs/keel"))
}

#[cfg(not(target_os = "macos"))]
fn platform_log_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|data| data.join("keel").join("logs"))
}

/// Delete `keel.log*` files in `dir` last modified before `now - max_age`.
/// Returns how many were removed.
fn prune_logs(dir: &Path, max_age: Duration, now: SystemTime) -> usize {
    let Some(cutoff) = now.checked_sub(max_age) else {
        return 0;
    };
    let Ok(listing) = fs::read_dir(dir) else {
        return 0;
    };
    listing
        .flatten()
        .filter(|item| item.file_name().to_string_lossy().starts_with(LOG_FILE_PREFIX))
        .filter(|item| {
            item.metadata()
                .and_then(|meta| meta.modified())
                .is_ok_and(|modified| modified < cutoff)
        })
        .filter(|item| fs::remove_file(item.path()).is_ok())
        .count()
}

/// Pushes every event into the shared ring, dropping the oldest line when
/// full.
struct RingLayer {
    ring: LogBuffer,
    capacity: usize,
}

impl RingLayer {
    fn push(&self, entry: LogEntry) {
        let Ok(mut ring) = self.ring.lock() else {
            return;
        };
        while ring.len() >= self.capacity.max(1) {
            ring.pop_front();
        }
        ring.push_back(entry);
    }
}

impl<S: tracing::Subscriber> Layer<S> for RingLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _: LayerContext<'_, S>) {
        let meta = event.metadata();
        let mut fields = FieldRecorder::default();
        event.record(&mut fields);
        self.push(LogEntry {
            level: meta.level().into(),
            target: meta.target().to_string(),
            message: fields.render(),
        });
    }
}

/// Collects the message and `key=value` fields of one event.
#[derive(Default)]
struct FieldRecorder {
    message: String,
    extra: Vec<String>,
}

impl FieldRecorder {
    fn render(mut self) -> String {
        if self.message.is_empty() {
            return self.extra.join(" ");
        }
        for field in self.extra {
            self.message.push(' ');
            self.message.push_str(&field);
        }
        self.message
    }
}

impl Visit for FieldRecorder {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            name => self.extra.push(format!("{name}={value}")),
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        match field.name() {
            "message" => self.message = format!("{value:?}"),
            name => self.extra.push(format!("{name}={value:?}")),
        }
    }
}

/// Install the global subscriber and return the ring of recent lines.
///
/// The filter comes from `KEEL_LOG`, then `RUST_LOG`, then
/// `options.filter`. Log files rotate daily and are kept for a week.
pub fn init(options: &LogOptions) -> anyhow::Result<LogBuffer> {
    let filter = match EnvFilter::try_from_env("KEEL_LOG") {
        Ok(filter) => filter,
        Err(_) => match EnvFilter::try_from_default_env() {
            Ok(filter) => filter,
            Err(_) => EnvFilter::try_new(&options.filter)
                .with_context(|| format!("invalid log filter: {}", options.filter))?,
        },
    };

    let dir = options.dir.clone().unwrap_or_else(log_dir);
    if let Err(err) = fs::create_dir_all(&dir) {
        eprintln!("keel: cannot create log directory {}: {err}", dir.display());
    }
    prune_logs(&dir, RETENTION, SystemTime::now());

    let file = tracing_subscriber::fmt::layer()
        .with_writer(rolling::daily(&dir, LOG_FILE_PREFIX))
        .with_ansi(false)
        .with_target(true);
    let ring = new_log_buffer(options.capture_lines);

    tracing_subscriber::registry()
        .with(filter)
        .with(file)
        .with(RingLayer {
            ring: ring.clone(),
            capacity: options.capture_lines,
        })
        .try_init()
        .context("a global tracing subscriber is already installed")?;

    Ok(ring)
}
