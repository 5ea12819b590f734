//! Pod discovery and lifecycle watching for app streams.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, ListParams},
    runtime::watcher::{self, Event},
    Client,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tailgate_core::{Error, Result};
use tailgate_stream::{Discovery, PodEvent, PodSummary, StreamHandle};

/// Kube-backed discovery with a short list cache, so a burst of stream
/// admissions for the same app does not hammer the API server.
pub struct KubeDiscovery {
    client: Client,
    cache_ttl: Duration,
    cache: Mutex<HashMap<(String, String), (Instant, Vec<PodSummary>)>>,
}

impl KubeDiscovery {
    pub fn new(client: Client) -> Self {
        let secs = std::env::var("TAILGATE_DISCOVERY_CACHE_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(2);
        Self {
            client,
            cache_ttl: Duration::from_secs(secs),
            cache: Mutex::new(HashMap::new()),
        }
    }
}

fn summarize(pod: &Pod) -> Option<PodSummary> {
    let name = pod.metadata.name.clone()?;
    let containers: Vec<String> = pod
        .spec
        .as_ref()
        .map(|s| s.containers.iter().map(|c| c.name.clone()).collect())
        .unwrap_or_default();
    let status = pod.status.as_ref();
    let phase = status.and_then(|s| s.phase.as_deref()).unwrap_or("");
    let terminal = matches!(phase, "Succeeded" | "Failed");
    let (ready, restarts) = status
        .and_then(|s| s.container_statuses.as_ref())
        .map(|cs| {
            (
                !cs.is_empty() && cs.iter().all(|c| c.ready),
                cs.iter().map(|c| c.restart_count).sum::<i32>(),
            )
        })
        .unwrap_or((false, 0));
    Some(PodSummary { name, containers, ready, restarts, terminal })
}

#[async_trait]
impl Discovery for KubeDiscovery {
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<PodSummary>> {
        let cache_key = (namespace.to_string(), selector.to_string());
        {
            let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some((at, pods)) = cache.get(&cache_key) {
                if at.elapsed() < self.cache_ttl {
                    return Ok(pods.clone());
                }
            }
        }
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(selector);
        let list = api
            .list(&lp)
            .await
            .map_err(|e| Error::UpstreamUnavailable(e.to_string()))?;
        let pods: Vec<PodSummary> = list.items.iter().filter_map(summarize).collect();
        debug!(ns = %namespace, selector = %selector, pods = pods.len(), "pods listed");
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(cache_key, (Instant::now(), pods.clone()));
        Ok(pods)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<PodSummary> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pod = match api.get(name).await {
            Ok(pod) => pod,
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                return Err(Error::NotFound(format!("pod {namespace}/{name} not found")));
            }
            Err(e) => return Err(Error::UpstreamUnavailable(e.to_string())),
        };
        summarize(&pod)
            .ok_or_else(|| Error::NotFound(format!("pod {namespace}/{name} not found")))
    }

    async fn resolve_app_pods(
        &self,
        namespace: &str,
        app: &str,
    ) -> Result<(String, Vec<PodSummary>)> {
        // Chart convention first, legacy label second.
        for selector in [format!("app.kubernetes.io/name={app}"), format!("app={app}")] {
            let pods = self.list_pods(namespace, &selector).await?;
            if !pods.is_empty() {
                return Ok((selector, pods));
            }
        }
        Err(Error::NotFound(format!("app {app} has no pods in {namespace}")))
    }

    async fn watch_pods(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<StreamHandle<PodEvent>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let cfg = watcher::Config::default().labels(selector);
        let (tx, rx) = mpsc::channel(256);
        let cancel = CancellationToken::new();
        let child = cancel.clone();
        let scope = format!("{namespace}/{selector}");
        tokio::spawn(async move {
            let stream = watcher::watcher(api, cfg);
            futures::pin_mut!(stream);
            info!(scope = %scope, "pod watcher started");
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    next = stream.try_next() => match next {
                        Ok(Some(Event::Applied(pod))) => {
                            if let Some(summary) = summarize(&pod) {
                                if tx.send(PodEvent::Applied(summary)).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Ok(Some(Event::Deleted(pod))) => {
                            if let Some(name) = pod.metadata.name.clone() {
                                if tx.send(PodEvent::Deleted(name)).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Ok(Some(Event::Restarted(pods))) => {
                            debug!(scope = %scope, count = pods.len(), "watch restart");
                            for pod in &pods {
                                if let Some(summary) = summarize(pod) {
                                    if tx.send(PodEvent::Applied(summary)).await.is_err() {
                                        return;
                                    }
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(scope = %scope, error = %e, "pod watcher error");
                            break;
                        }
                    }
                }
            }
            debug!(scope = %scope, "pod watcher ended");
        });
        Ok(StreamHandle { rx, cancel })
    }
}
