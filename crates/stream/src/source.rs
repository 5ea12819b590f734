//! Seam traits between the streaming core and its collaborators: the
//! upstream log reader, pod discovery, and the optional shared broker.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tailgate_core::{Record, Result, ResumeCursor, SourceLine, WorkerKey};

/// Handle to a spawned streaming task: a bounded receiver plus the token
/// that stops the producer.
pub struct StreamHandle<T> {
    pub rx: mpsc::Receiver<T>,
    pub cancel: CancellationToken,
}

impl<T> StreamHandle<T> {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Options for opening one upstream read.
#[derive(Debug, Clone, Default)]
pub struct TailOptions {
    /// Server-side tail; `None` streams from `since` or from now.
    pub tail_lines: Option<i64>,
    /// Only lines at or after this timestamp (ns).
    pub since_ns: Option<i64>,
    pub follow: bool,
    /// Lines over this many bytes are truncated in the pump.
    pub max_line_bytes: usize,
}

/// One event out of an upstream read. After `Eof` or `Error` the producer
/// task ends and the channel closes.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceItem {
    Line(SourceLine),
    /// Upstream closed cleanly: pod finished or the server ended the stream.
    Eof,
    /// Upstream failed. Retry policy lives in the worker.
    Error(String),
}

/// Adapter over the cluster's pod-logs endpoint. The pool guarantees at most
/// one open stream per key; implementations do not enforce it.
#[async_trait]
pub trait LogSource: Send + Sync {
    async fn open(&self, key: &WorkerKey, opts: TailOptions) -> Result<StreamHandle<SourceItem>>;
}

/// Pod as the aggregator sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct PodSummary {
    pub name: String,
    pub containers: Vec<String>,
    pub ready: bool,
    pub restarts: i32,
    /// Succeeded or Failed phase.
    pub terminal: bool,
}

/// Pod lifecycle event from the discovery watcher.
#[derive(Debug, Clone)]
pub enum PodEvent {
    Applied(PodSummary),
    Deleted(String),
}

/// Read-path discovery collaborator. May be informer-backed with TTL
/// fallbacks; the core depends only on these calls.
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<PodSummary>>;

    /// Look up one pod by name. `NotFound` when it does not exist.
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<PodSummary>;

    /// Resolve an app name to the label selector and current pod set.
    async fn resolve_app_pods(
        &self,
        namespace: &str,
        app: &str,
    ) -> Result<(String, Vec<PodSummary>)>;

    async fn watch_pods(&self, namespace: &str, selector: &str)
        -> Result<StreamHandle<PodEvent>>;
}

/// Optional external stream broker. One stream and one TTL lock per
/// [`WorkerKey`]; the lock holder is the single writer cluster-wide.
#[async_trait]
pub trait LogBroker: Send + Sync {
    /// Append one record to the key's stream, trimming to the configured
    /// max length.
    async fn publish(&self, key: &WorkerKey, record: &Record) -> Result<()>;

    /// Take the per-key writer lock. `false` means another holder owns it.
    async fn try_lock(&self, key: &WorkerKey, holder: &str) -> Result<bool>;

    /// Extend the lock. `false` means the lock was lost or stolen.
    async fn renew_lock(&self, key: &WorkerKey, holder: &str) -> Result<bool>;

    async fn release_lock(&self, key: &WorkerKey, holder: &str) -> Result<()>;

    /// Blocking-read records appended after `after` (follower mode).
    async fn follow(
        &self,
        key: &WorkerKey,
        after: Option<ResumeCursor>,
    ) -> Result<StreamHandle<Record>>;
}
