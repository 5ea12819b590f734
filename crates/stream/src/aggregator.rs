//! App streams: bind one subscriber to the worker set behind a selector and
//! keep that set current while the stream is live.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tailgate_core::{ControlEvent, PodChange, ResumeCursor, WorkerKey};

use crate::pool::WorkerPool;
use crate::source::{Discovery, PodEvent, PodSummary};
use crate::subscriber::Subscription;
use crate::worker::{Worker, WorkerState};

/// One app stream request after resolution.
#[derive(Debug, Clone)]
pub struct AppStreamSpec {
    pub namespace: String,
    pub selector: String,
    pub tail: i64,
    pub resume: Option<ResumeCursor>,
}

pub struct Aggregator {
    pool: Arc<WorkerPool>,
    discovery: Arc<dyn Discovery>,
}

impl Aggregator {
    pub fn new(pool: Arc<WorkerPool>, discovery: Arc<dyn Discovery>) -> Self {
        Self { pool, discovery }
    }

    /// Drive one app stream until `cancel` fires. `initial` is the pod set
    /// the handler already resolved; it attaches quietly, later churn emits
    /// `pod-lifecycle` markers. Workers that drain under us are re-acquired
    /// on the next sync, so the stream survives pod churn and worker
    /// restarts without a reconnect.
    pub async fn run(
        &self,
        spec: AppStreamSpec,
        sub: Subscription,
        initial: Vec<PodSummary>,
        cancel: CancellationToken,
    ) {
        info!(ns = %spec.namespace, selector = %spec.selector, sub = %sub.id, "app stream starting");
        let cfg = self.pool.config();
        let mut attached: HashMap<WorkerKey, Arc<Worker>> = HashMap::new();
        let mut seen: HashMap<String, PodSummary> = HashMap::new();
        // Delivered position per attachment, refreshed on every sync; a
        // drained worker's replacement re-attaches from here rather than
        // from the stream-start cursor.
        let mut resumes: HashMap<WorkerKey, ResumeCursor> = HashMap::new();
        self.sync(&spec, &sub, &mut attached, &mut seen, &mut resumes, initial, true);

        // Pod events flow through a forwarder that keeps a watcher alive;
        // the periodic resync covers anything the watcher misses.
        let (ev_tx, mut ev_rx) = mpsc::channel::<PodEvent>(64);
        tokio::spawn(forward_pod_events(
            Arc::clone(&self.discovery),
            spec.namespace.clone(),
            spec.selector.clone(),
            ev_tx,
            cancel.child_token(),
            cfg.app_resync(),
        ));

        let mut resync = tokio::time::interval_at(
            tokio::time::Instant::now() + cfg.app_resync(),
            cfg.app_resync(),
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = resync.tick() => {
                    match self.discovery.list_pods(&spec.namespace, &spec.selector).await {
                        Ok(pods) => {
                            self.sync(&spec, &sub, &mut attached, &mut seen, &mut resumes, pods, false)
                        }
                        Err(e) => debug!(error = %e, "pod resync failed; keeping current set"),
                    }
                }
                ev = ev_rx.recv() => {
                    let Some(ev) = ev else { break };
                    let mut pods: Vec<PodSummary> = seen.values().cloned().collect();
                    match ev {
                        PodEvent::Applied(p) => {
                            pods.retain(|x| x.name != p.name);
                            pods.push(p);
                        }
                        PodEvent::Deleted(name) => pods.retain(|x| x.name != name),
                    }
                    self.sync(&spec, &sub, &mut attached, &mut seen, &mut resumes, pods, false);
                }
            }
        }
        for worker in attached.values() {
            worker.detach(sub.id);
        }
        info!(ns = %spec.namespace, selector = %spec.selector, sub = %sub.id, "app stream ended");
    }

    /// Reconcile the attached worker set against `pods`, emitting lifecycle
    /// markers for the differences. `quiet` suppresses markers for the
    /// initial attach.
    fn sync(
        &self,
        spec: &AppStreamSpec,
        sub: &Subscription,
        attached: &mut HashMap<WorkerKey, Arc<Worker>>,
        seen: &mut HashMap<String, PodSummary>,
        resumes: &mut HashMap<WorkerKey, ResumeCursor>,
        pods: Vec<PodSummary>,
        quiet: bool,
    ) {
        let cfg = self.pool.config();
        // Remember how far each attachment has been delivered before
        // dropping drained workers; their replacements resume from here.
        for (key, worker) in attached.iter() {
            if let Some(cursor) = worker.subscriber_cursor(sub.id) {
                if cursor.seq > 0 {
                    resumes.insert(key.clone(), cursor);
                }
            }
        }
        // Drop attachments to workers that drained under us; re-acquired
        // below if the pod is still desired.
        attached.retain(|_, w| w.state() < WorkerState::Draining);

        for pod in &pods {
            match seen.get(&pod.name) {
                None if !quiet => {
                    sub.send_control(ControlEvent::PodLifecycle {
                        pod: pod.name.clone(),
                        change: PodChange::Added,
                    });
                }
                Some(old) if !quiet => {
                    if !old.ready && pod.ready {
                        sub.send_control(ControlEvent::PodLifecycle {
                            pod: pod.name.clone(),
                            change: PodChange::Ready,
                        });
                    }
                    if pod.restarts > old.restarts {
                        sub.send_control(ControlEvent::PodLifecycle {
                            pod: pod.name.clone(),
                            change: PodChange::Restart,
                        });
                    }
                }
                _ => {}
            }
        }

        let removed: Vec<String> = seen
            .keys()
            .filter(|name| !pods.iter().any(|p| &p.name == *name))
            .cloned()
            .collect();
        for name in removed {
            seen.remove(&name);
            if !quiet {
                sub.send_control(ControlEvent::PodLifecycle {
                    pod: name.clone(),
                    change: PodChange::Removed,
                });
            }
            let stale: Vec<WorkerKey> =
                attached.keys().filter(|k| k.pod == name).cloned().collect();
            for key in stale {
                if let Some(worker) = attached.remove(&key) {
                    worker.detach(sub.id);
                }
                resumes.remove(&key);
            }
        }

        for pod in pods {
            if !pod.terminal {
                for container in &pod.containers {
                    let key = WorkerKey::new(
                        cfg.cluster.clone(),
                        spec.namespace.clone(),
                        pod.name.clone(),
                        container.clone(),
                    );
                    if attached.contains_key(&key) {
                        continue;
                    }
                    let worker = self.pool.acquire(key.clone());
                    let resume = resumes.get(&key).copied().or(spec.resume);
                    match worker.attach(sub, spec.tail, resume) {
                        Ok(()) => {
                            attached.insert(key, worker);
                        }
                        Err(e) => {
                            debug!(key = %key, error = %e, "attach failed; retrying on next sync")
                        }
                    }
                }
            }
            seen.insert(pod.name.clone(), pod);
        }
    }
}

/// Keep a pod watcher open, forwarding its events; re-open after failures.
async fn forward_pod_events(
    discovery: Arc<dyn Discovery>,
    namespace: String,
    selector: String,
    tx: mpsc::Sender<PodEvent>,
    cancel: CancellationToken,
    retry_after: Duration,
) {
    loop {
        let mut handle = match discovery.watch_pods(&namespace, &selector).await {
            Ok(h) => h,
            Err(e) => {
                warn!(ns = %namespace, error = %e, "pod watch unavailable; relying on resync");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(retry_after) => continue,
                }
            }
        };
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    handle.cancel();
                    return;
                }
                ev = handle.rx.recv() => match ev {
                    Some(ev) => {
                        if tx.send(ev).await.is_err() {
                            return;
                        }
                    }
                    None => break,
                }
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(retry_after) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriber::FilterSet;
    use crate::testutil::{line, pod, ChannelSource, StaticDiscovery};
    use std::time::Duration;
    use tailgate_core::{Config, StreamItem};
    use tokio::time::timeout;

    fn test_cfg() -> Config {
        Config { retry_base_delay_ms: 5, app_resync_secs: 1, ..Config::default() }
    }

    async fn next_item(
        rx: &mut mpsc::Receiver<StreamItem>,
    ) -> StreamItem {
        timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("stream item in time")
            .expect("stream open")
    }

    #[tokio::test]
    async fn app_stream_survives_pod_churn_with_lifecycle_markers() {
        let (source, mut opens) = ChannelSource::new(0);
        let pool = WorkerPool::new(test_cfg(), Arc::clone(&source) as _, None);
        let discovery = StaticDiscovery::new(vec![pod("p1", &["app"]), pod("p2", &["app"])]);
        let agg = Aggregator::new(Arc::clone(&pool), Arc::clone(&discovery) as _);

        let (sub, mut rx) = Subscription::new("alice", FilterSet::default(), 64);
        let cancel = CancellationToken::new();
        let spec = AppStreamSpec {
            namespace: "apps".into(),
            selector: "app=web".into(),
            tail: 10,
            resume: None,
        };
        let initial = discovery.list_pods("apps", "app=web").await.unwrap();
        let run_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            agg.run(spec, sub, initial, run_cancel).await;
        });

        // Both initial pods get workers; no lifecycle markers for them.
        let (k1, tx1) = opens.recv().await.expect("first worker opened");
        let (k2, tx2) = opens.recv().await.expect("second worker opened");
        let mut pods = vec![k1.pod.clone(), k2.pod.clone()];
        pods.sort();
        assert_eq!(pods, vec!["p1", "p2"]);
        let p2_tx = if k1.pod == "p2" { &tx1 } else { &tx2 };

        p2_tx.send(line(10, "from p2")).await.unwrap();
        assert!(matches!(next_item(&mut rx).await, StreamItem::Record(r) if r.pod == "p2"));

        // p3 appears: marker plus a third worker, no reconnect needed.
        discovery.set_pods(vec![pod("p1", &["app"]), pod("p2", &["app"]), pod("p3", &["app"])]);
        // Give the forwarder a beat to have the watch registered.
        tokio::time::sleep(Duration::from_millis(50)).await;
        discovery.emit(PodEvent::Applied(pod("p3", &["app"]))).await;
        assert!(matches!(
            next_item(&mut rx).await,
            StreamItem::Control(ControlEvent::PodLifecycle { pod, change: PodChange::Added })
                if pod == "p3"
        ));
        let (k3, tx3) = opens.recv().await.expect("third worker opened");
        assert_eq!(k3.pod, "p3");

        // p1 goes away: marker, p2 and p3 keep streaming.
        discovery.set_pods(vec![pod("p2", &["app"]), pod("p3", &["app"])]);
        discovery.emit(PodEvent::Deleted("p1".into())).await;
        assert!(matches!(
            next_item(&mut rx).await,
            StreamItem::Control(ControlEvent::PodLifecycle { pod, change: PodChange::Removed })
                if pod == "p1"
        ));

        tx3.send(line(20, "from p3")).await.unwrap();
        assert!(matches!(next_item(&mut rx).await, StreamItem::Record(r) if r.pod == "p3"));
        p2_tx.send(line(30, "p2 again")).await.unwrap();
        assert!(matches!(next_item(&mut rx).await, StreamItem::Record(r) if r.pod == "p2"));

        // p1's worker lost its only subscriber.
        let p1_key = if k1.pod == "p1" { k1 } else { k2 };
        let p1_worker = pool.acquire(p1_key);
        assert_eq!(p1_worker.subscriber_count(), 0);

        cancel.cancel();
        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn reattaches_a_drained_worker_without_duplicates() {
        let (source, mut opens) = ChannelSource::new(0);
        let pool = WorkerPool::new(test_cfg(), Arc::clone(&source) as _, None);
        let discovery = StaticDiscovery::new(vec![pod("p1", &["app"])]);
        let agg = Aggregator::new(Arc::clone(&pool), Arc::clone(&discovery) as _);

        let (sub, mut rx) = Subscription::new("alice", FilterSet::default(), 64);
        let cancel = CancellationToken::new();
        let spec = AppStreamSpec {
            namespace: "apps".into(),
            selector: "app=web".into(),
            tail: 10,
            resume: None,
        };
        let initial = discovery.list_pods("apps", "app=web").await.unwrap();
        let run_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            agg.run(spec, sub, initial, run_cancel).await;
        });

        let (key, tx) = opens.recv().await.expect("worker opened");
        tx.send(line(10, "a")).await.unwrap();
        tx.send(line(20, "b")).await.unwrap();
        assert!(matches!(next_item(&mut rx).await, StreamItem::Record(r) if r.event_id() == "10-1"));
        assert!(matches!(next_item(&mut rx).await, StreamItem::Record(r) if r.event_id() == "20-2"));

        // The worker gives up mid-stream, as it would after exhausting its
        // upstream retries. The app stream stays open.
        let worker = pool.acquire(key);
        worker.drain(Some(ControlEvent::StreamError {
            message: "upstream unavailable".into(),
            retry: true,
        }));
        assert!(matches!(
            next_item(&mut rx).await,
            StreamItem::Control(ControlEvent::StreamError { .. })
        ));

        // The next resync acquires a replacement seeded with the old
        // position; delivery resumes past what was already seen, with no
        // duplicate of "a"/"b" and the sequence continuing.
        let (_, tx2) = opens.recv().await.expect("replacement worker opened");
        tx2.send(line(30, "c")).await.unwrap();
        match next_item(&mut rx).await {
            StreamItem::Record(r) => {
                assert_eq!(r.event_id(), "30-3");
                assert_eq!(r.line, "c");
            }
            other => panic!("unexpected {other:?}"),
        }

        cancel.cancel();
        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn ready_and_restart_transitions_emit_markers() {
        let (source, mut opens) = ChannelSource::new(0);
        let pool = WorkerPool::new(test_cfg(), Arc::clone(&source) as _, None);
        let mut p1 = pod("p1", &["app"]);
        p1.ready = false;
        let discovery = StaticDiscovery::new(vec![p1.clone()]);
        let agg = Aggregator::new(Arc::clone(&pool), Arc::clone(&discovery) as _);

        let (sub, mut rx) = Subscription::new("alice", FilterSet::default(), 64);
        let cancel = CancellationToken::new();
        let spec = AppStreamSpec {
            namespace: "apps".into(),
            selector: "app=web".into(),
            tail: 0,
            resume: None,
        };
        let run_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            agg.run(spec, sub, vec![p1], run_cancel).await;
        });
        let _ = opens.recv().await.expect("worker opened");
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut ready = pod("p1", &["app"]);
        ready.restarts = 1;
        discovery.emit(PodEvent::Applied(ready)).await;

        let mut changes = Vec::new();
        for _ in 0..2 {
            if let StreamItem::Control(ControlEvent::PodLifecycle { change, .. }) =
                next_item(&mut rx).await
            {
                changes.push(change);
            }
        }
        assert!(changes.contains(&PodChange::Ready));
        assert!(changes.contains(&PodChange::Restart));

        cancel.cancel();
        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }
}
