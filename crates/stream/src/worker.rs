//! Worker: the single writer for one (pod, container) log source.
//!
//! A worker owns at most one upstream read, drains it into its ring (and the
//! shared broker when it holds the writer lock), and multicasts records to
//! its subscriber handles. Lifecycle is driven by subscriber count and the
//! idle TTL; all transitions are one-way.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use metrics::counter;
use rand::Rng;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tailgate_core::{
    sniff_level, Config, ControlEvent, Error, Record, Result, ResumeCursor, SourceLine, WorkerKey,
};

use crate::ring::RingBuffer;
use crate::source::{LogBroker, LogSource, SourceItem, TailOptions};
use crate::subscriber::{OfferOutcome, SubscriberHandle, Subscription};

/// Worker lifecycle. Transitions are one-way per instance:
/// Starting → Running → Draining → Terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WorkerState {
    Starting,
    Running,
    Draining,
    Terminated,
}

pub struct Worker {
    key: WorkerKey,
    cfg: Arc<Config>,
    /// Writer-lock holder id (one per gateway replica).
    holder: String,
    ring: Mutex<RingBuffer>,
    subs: Mutex<HashMap<Uuid, Arc<SubscriberHandle>>>,
    state_tx: watch::Sender<WorkerState>,
    seq: AtomicU64,
    last_ts: AtomicI64,
    idle_since: Mutex<Option<Instant>>,
    cancel: CancellationToken,
}

impl Worker {
    /// Spawn the worker's read loop and idle reaper. The worker starts with
    /// zero subscribers, so the idle TTL clock is already running.
    ///
    /// `resume_from` seeds `(ts, seq)` from the previous generation for this
    /// key: the replacement continues the same monotonic position line, its
    /// first upstream read starts past `ts` instead of re-tailing history,
    /// and a reconnecting client's cursor still lines up.
    pub fn spawn(
        key: WorkerKey,
        cfg: Arc<Config>,
        source: Arc<dyn LogSource>,
        broker: Option<Arc<dyn LogBroker>>,
        holder: String,
        resume_from: Option<ResumeCursor>,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(WorkerState::Starting);
        let position = resume_from.unwrap_or_default();
        let worker = Arc::new(Self {
            ring: Mutex::new(RingBuffer::new(
                cfg.worker_buffer_lines,
                cfg.worker_buffer_max_bytes,
            )),
            subs: Mutex::new(HashMap::new()),
            state_tx,
            seq: AtomicU64::new(position.seq),
            last_ts: AtomicI64::new(position.ts),
            idle_since: Mutex::new(Some(Instant::now())),
            cancel: parent.child_token(),
            key,
            cfg,
            holder,
        });
        tokio::spawn(run(Arc::clone(&worker), source, broker));
        tokio::spawn(idle_reaper(Arc::clone(&worker)));
        worker
    }

    /// Last stamped position. The pool seeds this key's next generation
    /// with it.
    pub fn position(&self) -> ResumeCursor {
        ResumeCursor::new(
            self.last_ts.load(Ordering::Relaxed),
            self.seq.load(Ordering::Relaxed),
        )
    }

    /// Delivered position of one attached subscriber, if still attached.
    pub fn subscriber_cursor(&self, id: Uuid) -> Option<ResumeCursor> {
        lock(&self.subs).get(&id).map(|h| h.cursor())
    }

    pub fn key(&self) -> &WorkerKey {
        &self.key
    }

    pub fn state(&self) -> WorkerState {
        *self.state_tx.borrow()
    }

    pub fn state_rx(&self) -> watch::Receiver<WorkerState> {
        self.state_tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subs).len()
    }

    /// Attach a subscriber: ring backfill strictly past its cursor (capped
    /// by `tail`), then live fan-out. Rejected while draining so the client
    /// can retry onto a fresh worker.
    pub fn attach(&self, sub: &Subscription, tail: i64, resume: Option<ResumeCursor>) -> Result<()> {
        if self.state() >= WorkerState::Draining {
            return Err(Error::UpstreamUnavailable(format!(
                "worker {} is draining; retry",
                self.key
            )));
        }
        let handle = sub.handle(resume);
        let mut subs = lock(&self.subs);
        {
            let ring = lock(&self.ring);
            let backfill = ring.backfill(resume, tail);
            if let (Some(cur), Some(first)) = (resume, backfill.first()) {
                if cur.seq > 0 {
                    if first.seq > cur.seq + 1 {
                        // Resume landed outside the ring window; the seq gap
                        // is the exact number of evicted records.
                        handle
                            .send_control(ControlEvent::Lag { dropped: first.seq - cur.seq - 1 });
                    } else if first.seq <= cur.seq && first.ts > cur.ts {
                        // The position restarted under this key (no seed
                        // survived, e.g. across a process restart). The true
                        // loss is unknowable; flag the discontinuity.
                        handle.send_control(ControlEvent::Lag { dropped: 1 });
                    }
                }
            }
            for record in &backfill {
                handle.offer(record);
            }
        }
        subs.insert(handle.id(), handle);
        *lock(&self.idle_since) = None;
        Ok(())
    }

    /// O(1) removal by subscriber id. Reaching zero subscribers starts the
    /// idle TTL clock.
    pub fn detach(&self, id: Uuid) {
        let mut subs = lock(&self.subs);
        subs.remove(&id);
        if subs.is_empty() {
            *lock(&self.idle_since) = Some(Instant::now());
        }
    }

    /// Begin draining: new attaches are rejected, the read loop stops, and
    /// in-flight subscribers keep whatever is already queued.
    pub fn drain(&self, notify: Option<ControlEvent>) {
        self.set_state(WorkerState::Draining);
        if let Some(ev) = notify {
            self.broadcast(ev);
        }
        self.cancel.cancel();
    }

    fn set_state(&self, next: WorkerState) {
        self.state_tx.send_if_modified(|cur| {
            if next > *cur {
                *cur = next;
                true
            } else {
                false
            }
        });
    }

    fn broadcast(&self, ev: ControlEvent) {
        for handle in lock(&self.subs).values() {
            handle.send_control(ev.clone());
        }
    }

    /// Stamp one upstream line with `(ts, seq)`. Timestamps never go
    /// backwards; missing or unparsable ones are synthesised as
    /// `max(last_ts + 1, now)`.
    fn stamp(&self, sl: SourceLine) -> Arc<Record> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let prev = self.last_ts.load(Ordering::Relaxed);
        let (ts, estimated) = match sl.ts {
            Some(t) => (t.max(prev), false),
            None => ((prev + 1).max(now_nanos()), true),
        };
        self.last_ts.store(ts, Ordering::Relaxed);
        let level = sniff_level(&sl.line);
        Arc::new(Record {
            ts,
            seq,
            pod: self.key.pod.clone(),
            container: self.key.container.clone(),
            line: sl.line,
            truncated: sl.truncated,
            ts_estimated: estimated,
            level,
        })
    }

    /// Ring insert plus non-blocking fan-out. Handles whose receiver went
    /// away are detached here.
    fn publish(&self, record: Arc<Record>) {
        lock(&self.ring).push(Arc::clone(&record));
        counter!("tailgate_records_total", 1);
        let mut subs = lock(&self.subs);
        let mut gone = Vec::new();
        for (id, handle) in subs.iter() {
            if handle.offer(&record) == OfferOutcome::Gone {
                gone.push(*id);
            }
        }
        for id in gone {
            subs.remove(&id);
        }
        if subs.is_empty() {
            let mut idle = lock(&self.idle_since);
            if idle.is_none() {
                *idle = Some(Instant::now());
            }
        }
    }

    /// Adopt stamps produced by the remote leader (follower mode).
    fn adopt(&self, record: Record) {
        self.seq.fetch_max(record.seq, Ordering::Relaxed);
        self.last_ts.fetch_max(record.ts, Ordering::Relaxed);
        self.publish(Arc::new(record));
    }

    async fn run_leader(&self, source: Arc<dyn LogSource>, broker: Option<Arc<dyn LogBroker>>) {
        let renew_every = self
            .cfg
            .broker
            .as_ref()
            .map(|b| b.lock_renew_interval())
            .unwrap_or(Duration::from_secs(3600));
        let mut renew = tokio::time::interval_at(
            tokio::time::Instant::now() + renew_every,
            renew_every,
        );
        let mut attempts: u32 = 0;
        loop {
            if self.cancel.is_cancelled() || self.state() >= WorkerState::Draining {
                return;
            }
            let first_open = self.seq.load(Ordering::Relaxed) == 0;
            let last_ts = self.last_ts.load(Ordering::Relaxed);
            let opts = TailOptions {
                tail_lines: first_open.then(|| self.cfg.clamp_tail(None)),
                since_ns: (!first_open && last_ts > 0).then(|| last_ts + 1),
                follow: true,
                max_line_bytes: self.cfg.max_line_bytes,
            };
            let mut handle = match source.open(&self.key, opts).await {
                Ok(h) => h,
                Err(e) => {
                    attempts += 1;
                    if attempts > self.cfg.retry_attempts {
                        warn!(key = %self.key, error = %e, "upstream retries exhausted");
                        self.drain(Some(ControlEvent::StreamError {
                            message: format!("upstream unavailable: {e}"),
                            retry: true,
                        }));
                        return;
                    }
                    debug!(key = %self.key, attempt = attempts, error = %e, "upstream open failed; backing off");
                    if self.pause(backoff_delay(self.cfg.retry_base_delay(), attempts)).await {
                        return;
                    }
                    continue;
                }
            };
            self.set_state(WorkerState::Running);
            info!(key = %self.key, "worker running");
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        handle.cancel();
                        return;
                    }
                    _ = renew.tick(), if broker.is_some() => {
                        let b = broker.as_ref().map(Arc::clone);
                        let lost = match b {
                            Some(b) => !b.renew_lock(&self.key, &self.holder).await.unwrap_or(false),
                            None => false,
                        };
                        if lost {
                            warn!(key = %self.key, "writer lock lost; draining");
                            handle.cancel();
                            self.drain(Some(ControlEvent::StreamError {
                                message: "writer lock lost".into(),
                                retry: true,
                            }));
                            return;
                        }
                    }
                    item = handle.rx.recv() => match item {
                        Some(SourceItem::Line(sl)) => {
                            attempts = 0;
                            let record = self.stamp(sl);
                            if let Some(b) = &broker {
                                if let Err(e) = b.publish(&self.key, &record).await {
                                    warn!(key = %self.key, error = %e, "broker publish failed; draining");
                                    handle.cancel();
                                    self.drain(Some(ControlEvent::StreamError {
                                        message: format!("broker unavailable: {e}"),
                                        retry: true,
                                    }));
                                    return;
                                }
                            }
                            self.publish(record);
                        }
                        Some(SourceItem::Eof) => {
                            info!(key = %self.key, "upstream ended; serving ring for terminated-pod ttl");
                            handle.cancel();
                            if let Some(b) = &broker {
                                let _ = b.release_lock(&self.key, &self.holder).await;
                            }
                            self.pause(self.cfg.terminated_log_ttl()).await;
                            return;
                        }
                        Some(SourceItem::Error(msg)) => {
                            warn!(key = %self.key, error = %msg, "upstream read error");
                            handle.cancel();
                            break;
                        }
                        None => {
                            warn!(key = %self.key, "upstream channel closed");
                            break;
                        }
                    }
                }
            }
            attempts += 1;
            if attempts > self.cfg.retry_attempts {
                self.drain(Some(ControlEvent::StreamError {
                    message: "upstream unavailable: retries exhausted".into(),
                    retry: true,
                }));
                return;
            }
            if self.pause(backoff_delay(self.cfg.retry_base_delay(), attempts)).await {
                return;
            }
        }
    }

    /// Follower mode: read the broker stream, never the cluster. Returns
    /// true when this worker took the writer lock and should lead.
    async fn run_follower(&self, broker: Arc<dyn LogBroker>) -> bool {
        let ttl = self
            .cfg
            .broker
            .as_ref()
            .map(|b| b.lock_ttl())
            .unwrap_or(Duration::from_secs(15));
        let mut promote = tokio::time::interval_at(tokio::time::Instant::now() + ttl, ttl);
        let mut attempts: u32 = 0;
        loop {
            if self.cancel.is_cancelled() || self.state() >= WorkerState::Draining {
                return false;
            }
            let after = lock(&self.ring).last_cursor();
            let mut handle = match broker.follow(&self.key, after).await {
                Ok(h) => h,
                Err(e) => {
                    attempts += 1;
                    if attempts > self.cfg.retry_attempts {
                        self.drain(Some(ControlEvent::StreamError {
                            message: format!("broker unavailable: {e}"),
                            retry: true,
                        }));
                        return false;
                    }
                    if self.pause(backoff_delay(self.cfg.retry_base_delay(), attempts)).await {
                        return false;
                    }
                    continue;
                }
            };
            self.set_state(WorkerState::Running);
            info!(key = %self.key, "worker following broker stream");
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        handle.cancel();
                        return false;
                    }
                    _ = promote.tick() => {
                        if broker.try_lock(&self.key, &self.holder).await.unwrap_or(false) {
                            info!(key = %self.key, "writer lock acquired; promoting to leader");
                            handle.cancel();
                            return true;
                        }
                    }
                    item = handle.rx.recv() => match item {
                        Some(record) => {
                            attempts = 0;
                            self.adopt(record);
                        }
                        None => break,
                    }
                }
            }
            attempts += 1;
            if attempts > self.cfg.retry_attempts {
                self.drain(Some(ControlEvent::StreamError {
                    message: "broker stream closed".into(),
                    retry: true,
                }));
                return false;
            }
            if self.pause(backoff_delay(self.cfg.retry_base_delay(), attempts)).await {
                return false;
            }
        }
    }

    /// Cancellable sleep. Returns true when the worker was cancelled.
    async fn pause(&self, d: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => true,
            _ = tokio::time::sleep(d) => false,
        }
    }
}

async fn run(worker: Arc<Worker>, source: Arc<dyn LogSource>, broker: Option<Arc<dyn LogBroker>>) {
    info!(key = %worker.key, "worker starting");
    match broker {
        None => worker.run_leader(source, None).await,
        Some(b) => {
            loop {
                if worker.cancel.is_cancelled() || worker.state() >= WorkerState::Draining {
                    break;
                }
                match b.try_lock(&worker.key, &worker.holder).await {
                    Ok(true) => {
                        worker.run_leader(Arc::clone(&source), Some(Arc::clone(&b))).await;
                        let _ = b.release_lock(&worker.key, &worker.holder).await;
                        break;
                    }
                    Ok(false) => {
                        // Lock held by another replica: follow its stream.
                        if !worker.run_follower(Arc::clone(&b)).await {
                            break;
                        }
                        // Promoted; the next try_lock is reentrant for us.
                    }
                    Err(e) => {
                        warn!(key = %worker.key, error = %e, "broker lock unavailable");
                        worker.drain(Some(ControlEvent::StreamError {
                            message: format!("broker unavailable: {e}"),
                            retry: true,
                        }));
                        break;
                    }
                }
            }
        }
    }
    worker.set_state(WorkerState::Draining);
    // Release the ring and drop subscriber handles so their streams see the
    // channel close once the clients' own senders go away.
    lock(&worker.ring).clear();
    lock(&worker.subs).clear();
    worker.set_state(WorkerState::Terminated);
    info!(key = %worker.key, "worker terminated");
}

/// Terminate the worker once it has had zero subscribers for the idle TTL.
async fn idle_reaper(worker: Arc<Worker>) {
    let ttl = worker.cfg.idle_ttl();
    let tick = (ttl / 4).max(Duration::from_millis(10));
    loop {
        tokio::select! {
            _ = worker.cancel.cancelled() => return,
            _ = tokio::time::sleep(tick) => {}
        }
        if worker.state() == WorkerState::Terminated {
            return;
        }
        let idle = lock(&worker.idle_since).map_or(false, |t| t.elapsed() >= ttl);
        if idle {
            debug!(key = %worker.key, "idle ttl elapsed; draining");
            worker.drain(None);
            return;
        }
    }
}

/// Exponential backoff with ±20% jitter, capped at 5s.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(1u32 << attempt.min(8).saturating_sub(1));
    let capped = exp.min(Duration::from_secs(5));
    capped.mul_f64(rand::thread_rng().gen_range(0.8..1.2))
}

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
