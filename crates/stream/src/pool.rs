//! Worker pool: the process-wide index of live workers.
//!
//! At most one worker exists per key locally; under broker mode the per-key
//! writer lock extends that to the whole cluster. Creation is serialised by
//! the index mutex so concurrent acquires for one key observe one worker.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use arc_swap::ArcSwap;
use metrics::gauge;
use rustc_hash::FxHashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use tailgate_core::{Config, ControlEvent, ResumeCursor, WorkerKey};

use crate::source::{LogBroker, LogSource};
use crate::worker::{Worker, WorkerState};

pub struct WorkerPool {
    cfg: ArcSwap<Config>,
    source: Arc<dyn LogSource>,
    broker: Option<Arc<dyn LogBroker>>,
    workers: Mutex<FxHashMap<WorkerKey, Arc<Worker>>>,
    /// Last stamped position per key. Replacement workers are seeded from
    /// it so `(ts, seq)` stays monotonic across generations and resume
    /// cursors from a drained worker still line up.
    positions: Mutex<FxHashMap<WorkerKey, ResumeCursor>>,
    /// Lock-holder id for this gateway replica.
    replica: String,
    root: CancellationToken,
}

impl WorkerPool {
    pub fn new(
        cfg: Config,
        source: Arc<dyn LogSource>,
        broker: Option<Arc<dyn LogBroker>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg: ArcSwap::from_pointee(cfg),
            source,
            broker,
            workers: Mutex::new(FxHashMap::default()),
            positions: Mutex::new(FxHashMap::default()),
            replica: Uuid::new_v4().to_string(),
            root: CancellationToken::new(),
        })
    }

    /// The snapshot handed to new workers. Running workers keep the one they
    /// were built with.
    pub fn config(&self) -> Arc<Config> {
        self.cfg.load_full()
    }

    pub fn replica(&self) -> &str {
        &self.replica
    }

    pub fn worker_count(&self) -> usize {
        lock(&self.workers).len()
    }

    /// Get or create the worker for `key`. Idempotent: concurrent callers
    /// observe the same worker; a draining or terminated entry is replaced
    /// with a fresh one.
    pub fn acquire(self: &Arc<Self>, key: WorkerKey) -> Arc<Worker> {
        let mut workers = lock(&self.workers);
        if let Some(existing) = workers.get(&key) {
            if existing.state() < WorkerState::Draining {
                return Arc::clone(existing);
            }
        }
        let seed = workers
            .get(&key)
            .map(|w| w.position())
            .filter(|p| p.seq > 0)
            .or_else(|| lock(&self.positions).get(&key).copied());
        debug!(key = %key, seed = ?seed, "spawning worker");
        let worker = Worker::spawn(
            key.clone(),
            self.config(),
            Arc::clone(&self.source),
            self.broker.clone(),
            self.replica.clone(),
            seed,
            &self.root,
        );
        workers.insert(key.clone(), Arc::clone(&worker));
        gauge!("tailgate_workers", workers.len() as f64);
        drop(workers);

        // Purge the index entry once this worker terminates, remembering
        // its position for the next generation.
        let pool = Arc::downgrade(self);
        let mut state = worker.state_rx();
        let entry = Arc::clone(&worker);
        tokio::spawn(async move {
            while *state.borrow() != WorkerState::Terminated {
                if state.changed().await.is_err() {
                    break;
                }
            }
            if let Some(pool) = pool.upgrade() {
                let position = entry.position();
                if position.seq > 0 {
                    let mut positions = lock(&pool.positions);
                    // Coarse bound; losing a seed only costs a lag marker.
                    if positions.len() >= 8192 {
                        positions.clear();
                    }
                    positions.insert(entry.key().clone(), position);
                }
                let mut workers = lock(&pool.workers);
                if let Some(current) = workers.get(entry.key()) {
                    if Arc::ptr_eq(current, &entry) {
                        workers.remove(entry.key());
                    }
                }
                gauge!("tailgate_workers", workers.len() as f64);
            }
        });
        worker
    }

    /// Swap the config snapshot and drain running workers; clients get a
    /// retry hint and rebuild onto workers carrying the new snapshot.
    pub fn reload(&self, cfg: Config) {
        info!("configuration reloaded; draining workers");
        self.cfg.store(Arc::new(cfg));
        for worker in lock(&self.workers).values() {
            worker.drain(Some(ControlEvent::StreamError {
                message: "configuration reloaded; reconnect".into(),
                retry: true,
            }));
        }
    }

    /// Cancel every worker and await their Terminated transitions, bounded
    /// by `timeout`.
    pub async fn shutdown(&self, timeout: Duration) {
        info!(workers = self.worker_count(), "pool shutting down");
        self.root.cancel();
        let workers: Vec<Arc<Worker>> = lock(&self.workers).values().cloned().collect();
        let deadline = tokio::time::Instant::now() + timeout;
        for worker in workers {
            let mut state = worker.state_rx();
            let _ = tokio::time::timeout_at(deadline, async {
                while *state.borrow() != WorkerState::Terminated {
                    if state.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await;
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
