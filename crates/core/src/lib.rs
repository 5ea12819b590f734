//! tailgate core types: log records, worker identity, resume cursors, config.

#![forbid(unsafe_code)]

mod config;
mod cursor;
mod error;
mod line;

pub use config::{BrokerConfig, Config};
pub use cursor::ResumeCursor;
pub use error::{Error, Result};
pub use line::{parse_source_line, sniff_level, truncate_line, SourceLine, TRUNCATION_MARKER};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Identity of a single upstream log source: one container of one pod.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerKey {
    pub cluster: String,
    pub namespace: String,
    pub pod: String,
    pub container: String,
}

impl WorkerKey {
    pub fn new(
        cluster: impl Into<String>,
        namespace: impl Into<String>,
        pod: impl Into<String>,
        container: impl Into<String>,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            namespace: namespace.into(),
            pod: pod.into(),
            container: container.into(),
        }
    }
}

impl fmt::Display for WorkerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.cluster, self.namespace, self.pod, self.container
        )
    }
}

/// Severity sniffed out of a log line. Ordering is by severity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "err" | "error" | "fatal" => Ok(LogLevel::Error),
            other => Err(Error::Internal(format!("unknown log level: {other}"))),
        }
    }
}

/// One log line after the worker stamped it with `(ts, seq)`.
///
/// Serde field names are the broker wire contract: `ts,seq,pod,container,
/// line,truncated,level`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Source timestamp in nanoseconds since the epoch.
    pub ts: i64,
    /// Monotonic per-worker sequence, starting at 1.
    pub seq: u64,
    pub pod: String,
    pub container: String,
    pub line: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub truncated: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub ts_estimated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<LogLevel>,
}

fn is_false(v: &bool) -> bool {
    !*v
}

impl Record {
    pub fn cursor(&self) -> ResumeCursor {
        ResumeCursor::new(self.ts, self.seq)
    }

    /// The SSE event id echoed to clients and accepted back on reconnect.
    pub fn event_id(&self) -> String {
        self.cursor().to_string()
    }

    /// Rough in-memory footprint used for the ring's byte bound.
    pub fn approx_bytes(&self) -> usize {
        self.line.len() + self.pod.len() + self.container.len() + 64
    }
}

/// Pod state transition surfaced on app streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PodChange {
    Added,
    Removed,
    Ready,
    Restart,
}

impl PodChange {
    pub fn as_str(&self) -> &'static str {
        match self {
            PodChange::Added => "added",
            PodChange::Removed => "removed",
            PodChange::Ready => "ready",
            PodChange::Restart => "restart",
        }
    }
}

/// Control events interleaved with log records on a subscriber stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    PodLifecycle { pod: String, change: PodChange },
    StreamError { message: String, retry: bool },
    RateLimited,
    Lag { dropped: u64 },
}

impl ControlEvent {
    /// The SSE `event:` name for this control record.
    pub fn event_name(&self) -> &'static str {
        match self {
            ControlEvent::PodLifecycle { .. } => "pod-lifecycle",
            ControlEvent::StreamError { .. } => "stream-error",
            ControlEvent::RateLimited => "rate-limited",
            ControlEvent::Lag { .. } => "lag",
        }
    }

    /// JSON payload for the SSE `data:` field.
    pub fn data(&self) -> serde_json::Value {
        match self {
            ControlEvent::PodLifecycle { pod, change } => {
                serde_json::json!({ "pod": pod, "change": change.as_str() })
            }
            ControlEvent::StreamError { message, retry } => {
                serde_json::json!({ "message": message, "retry": retry })
            }
            ControlEvent::RateLimited => serde_json::json!({}),
            ControlEvent::Lag { dropped } => serde_json::json!({ "dropped": dropped }),
        }
    }
}

/// Items flowing from workers and aggregators into a subscriber queue.
#[derive(Debug, Clone)]
pub enum StreamItem {
    Record(Arc<Record>),
    Control(ControlEvent),
}
