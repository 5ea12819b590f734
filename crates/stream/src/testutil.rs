//! In-memory fakes for the seam traits, shared by the crate's tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tailgate_core::{Error, Record, Result, ResumeCursor, SourceLine, WorkerKey};

use crate::source::{
    Discovery, LogBroker, LogSource, PodEvent, PodSummary, SourceItem, StreamHandle, TailOptions,
};

/// Build a timestamped upstream line the way the kubelet would emit it.
pub fn line(ts: i64, text: &str) -> SourceItem {
    SourceItem::Line(SourceLine { ts: Some(ts), line: text.to_string(), truncated: false })
}

/// Upstream fake: every successful `open` hands the test the worker key and
/// a sender to drive the stream with. The first `fail_opens` calls error out.
pub struct ChannelSource {
    opens_tx: mpsc::UnboundedSender<(WorkerKey, mpsc::Sender<SourceItem>)>,
    opened: AtomicUsize,
    fail_opens: AtomicUsize,
}

impl ChannelSource {
    pub fn new(
        fail_opens: usize,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<(WorkerKey, mpsc::Sender<SourceItem>)>) {
        let (opens_tx, opens_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                opens_tx,
                opened: AtomicUsize::new(0),
                fail_opens: AtomicUsize::new(fail_opens),
            }),
            opens_rx,
        )
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LogSource for ChannelSource {
    async fn open(&self, key: &WorkerKey, _opts: TailOptions) -> Result<StreamHandle<SourceItem>> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let failures = self.fail_opens.load(Ordering::SeqCst);
        if failures > 0 {
            self.fail_opens
                .store(failures.saturating_sub(1), Ordering::SeqCst);
            return Err(Error::UpstreamUnavailable("scripted open failure".into()));
        }
        let (tx, rx) = mpsc::channel(64);
        let _ = self.opens_tx.send((key.clone(), tx));
        Ok(StreamHandle { rx, cancel: CancellationToken::new() })
    }
}

/// In-memory stand-in for the Redis broker: per-key record vectors, live
/// taps for followers, and a holder-checked TTL-less lock.
pub struct MemBroker {
    streams: Mutex<HashMap<String, Vec<Record>>>,
    taps: Mutex<HashMap<String, Vec<mpsc::Sender<Record>>>>,
    locks: Mutex<HashMap<String, String>>,
    allow_renew: AtomicBool,
    published: AtomicUsize,
}

impl MemBroker {
    pub fn new() -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            taps: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            allow_renew: AtomicBool::new(true),
            published: AtomicUsize::new(0),
        }
    }

    pub fn published(&self) -> usize {
        self.published.load(Ordering::SeqCst)
    }

    /// Make every later renewal fail, simulating lock revocation.
    pub fn revoke_renewals(&self) {
        self.allow_renew.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl LogBroker for MemBroker {
    async fn publish(&self, key: &WorkerKey, record: &Record) -> Result<()> {
        let id = key.to_string();
        self.streams
            .lock()
            .unwrap()
            .entry(id.clone())
            .or_default()
            .push(record.clone());
        self.published.fetch_add(1, Ordering::SeqCst);
        let mut taps = self.taps.lock().unwrap();
        if let Some(senders) = taps.get_mut(&id) {
            senders.retain(|tx| tx.try_send(record.clone()).is_ok());
        }
        Ok(())
    }

    async fn try_lock(&self, key: &WorkerKey, holder: &str) -> Result<bool> {
        let mut locks = self.locks.lock().unwrap();
        match locks.get(&key.to_string()) {
            Some(current) => Ok(current == holder),
            None => {
                locks.insert(key.to_string(), holder.to_string());
                Ok(true)
            }
        }
    }

    async fn renew_lock(&self, key: &WorkerKey, holder: &str) -> Result<bool> {
        if !self.allow_renew.load(Ordering::SeqCst) {
            return Ok(false);
        }
        Ok(self
            .locks
            .lock()
            .unwrap()
            .get(&key.to_string())
            .map_or(false, |h| h == holder))
    }

    async fn release_lock(&self, key: &WorkerKey, holder: &str) -> Result<()> {
        let mut locks = self.locks.lock().unwrap();
        if locks.get(&key.to_string()).map_or(false, |h| h == holder) {
            locks.remove(&key.to_string());
        }
        Ok(())
    }

    async fn follow(
        &self,
        key: &WorkerKey,
        after: Option<ResumeCursor>,
    ) -> Result<StreamHandle<Record>> {
        let id = key.to_string();
        let (tx, rx) = mpsc::channel(1024);
        let streams = self.streams.lock().unwrap();
        if let Some(backlog) = streams.get(&id) {
            for r in backlog {
                if after.map_or(true, |c| c.precedes(r.ts, r.seq)) {
                    let _ = tx.try_send(r.clone());
                }
            }
        }
        self.taps.lock().unwrap().entry(id).or_default().push(tx);
        drop(streams);
        Ok(StreamHandle { rx, cancel: CancellationToken::new() })
    }
}

/// Scripted discovery: tests mutate the pod list between resyncs.
pub struct StaticDiscovery {
    pods: Mutex<Vec<PodSummary>>,
    events_tx: Mutex<Option<mpsc::Sender<PodEvent>>>,
}

impl StaticDiscovery {
    pub fn new(pods: Vec<PodSummary>) -> Arc<Self> {
        Arc::new(Self { pods: Mutex::new(pods), events_tx: Mutex::new(None) })
    }

    pub fn set_pods(&self, pods: Vec<PodSummary>) {
        *self.pods.lock().unwrap() = pods;
    }

    /// Push a pod event as the informer would.
    pub async fn emit(&self, ev: PodEvent) {
        let tx = self.events_tx.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx.send(ev).await;
        }
    }
}

pub fn pod(name: &str, containers: &[&str]) -> PodSummary {
    PodSummary {
        name: name.to_string(),
        containers: containers.iter().map(|c| c.to_string()).collect(),
        ready: true,
        restarts: 0,
        terminal: false,
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn list_pods(&self, _namespace: &str, _selector: &str) -> Result<Vec<PodSummary>> {
        Ok(self.pods.lock().unwrap().clone())
    }

    async fn get_pod(&self, _namespace: &str, name: &str) -> Result<PodSummary> {
        self.pods
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.name == name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("pod {name} not found")))
    }

    async fn resolve_app_pods(
        &self,
        _namespace: &str,
        app: &str,
    ) -> Result<(String, Vec<PodSummary>)> {
        let pods = self.pods.lock().unwrap().clone();
        if pods.is_empty() {
            return Err(Error::NotFound(format!("app {app} has no pods")));
        }
        Ok((format!("app={app}"), pods))
    }

    async fn watch_pods(
        &self,
        _namespace: &str,
        _selector: &str,
    ) -> Result<StreamHandle<PodEvent>> {
        let (tx, rx) = mpsc::channel(64);
        *self.events_tx.lock().unwrap() = Some(tx);
        Ok(StreamHandle { rx, cancel: CancellationToken::new() })
    }
}
