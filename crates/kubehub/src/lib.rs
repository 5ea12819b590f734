//! tailgate kube integration: the upstream log reader over the pod-logs
//! endpoint, plus pod discovery for app streams.

#![forbid(unsafe_code)]

mod discovery;

pub use discovery::KubeDiscovery;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, LogParams},
    Client,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tailgate_core::{
    parse_source_line, truncate_line, Error, Result, WorkerKey, TRUNCATION_MARKER,
};
use tailgate_stream::{LogSource, SourceItem, StreamHandle, TailOptions};

/// Upstream reader over the cluster's pod-logs endpoint. One instance is
/// shared by every worker; each `open` spawns its own pump task. A
/// semaphore bounds in-flight connection attempts so a reconnect storm
/// cannot burst the API server.
pub struct KubeLogSource {
    client: Client,
    queue_cap: usize,
    open_permits: std::sync::Arc<tokio::sync::Semaphore>,
}

impl KubeLogSource {
    pub fn new(client: Client) -> Self {
        let queue_cap = std::env::var("TAILGATE_SOURCE_QUEUE_CAP")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1024);
        let concurrent_opens = std::env::var("TAILGATE_SOURCE_OPEN_CONCURRENCY")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(32);
        Self {
            client,
            queue_cap,
            open_permits: std::sync::Arc::new(tokio::sync::Semaphore::new(concurrent_opens)),
        }
    }
}

#[async_trait]
impl LogSource for KubeLogSource {
    async fn open(&self, key: &WorkerKey, opts: TailOptions) -> Result<StreamHandle<SourceItem>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &key.namespace);
        let mut lp = LogParams::default();
        lp.container = Some(key.container.clone());
        lp.follow = opts.follow;
        lp.timestamps = true;
        lp.tail_lines = opts.tail_lines;
        if let Some(ns) = opts.since_ns {
            // The API accepts second precision; the worker's cursor gate
            // absorbs the sub-second overlap.
            lp.since_time = chrono::DateTime::from_timestamp(
                ns.div_euclid(1_000_000_000),
                ns.rem_euclid(1_000_000_000) as u32,
            );
        }

        debug!(key = %key, follow = lp.follow, tail = ?lp.tail_lines, since = ?opts.since_ns, "opening log stream");
        let permit = self
            .open_permits
            .acquire()
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;
        let reader = api
            .log_stream(&key.pod, &lp)
            .await
            .map_err(|e| Error::UpstreamUnavailable(e.to_string()))?;
        drop(permit);

        let (tx, rx) = mpsc::channel(self.queue_cap);
        let cancel = CancellationToken::new();
        let child = cancel.clone();
        let max = opts.max_line_bytes;
        let label = key.to_string();
        tokio::spawn(async move {
            use tokio_util::{compat::FuturesAsyncReadCompatExt, io::ReaderStream};
            let bytes = ReaderStream::new(reader.compat());
            pump_lines(bytes, tx, child, max, &label).await;
        });
        Ok(StreamHandle { rx, cancel })
    }
}

/// Consume a byte stream, split it into lines, and forward parsed
/// [`SourceItem`]s into the bounded channel. Sends apply backpressure to the
/// upstream read rather than dropping; subscriber-side drops are the only
/// sanctioned ones.
///
/// A line that outgrows `max_line_bytes` before its newline arrives is cut
/// in place and the remainder of the physical line discarded, so one
/// pathological line cannot grow the buffer without bound.
async fn pump_lines<S, E>(
    stream: S,
    tx: mpsc::Sender<SourceItem>,
    cancel: CancellationToken,
    max_line_bytes: usize,
    ctx: &str,
) where
    S: futures::Stream<Item = std::result::Result<bytes::Bytes, E>>,
    E: std::fmt::Display,
{
    let max = if max_line_bytes == 0 { usize::MAX } else { max_line_bytes };
    let stream = stream.fuse();
    futures::pin_mut!(stream);
    let mut buf = bytes::BytesMut::new();
    let mut discarding = false;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(ctx = %ctx, "log pump cancelled");
                return;
            }
            next = stream.next() => match next {
                Some(Ok(chunk)) => {
                    buf.extend_from_slice(&chunk);
                    loop {
                        if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                            let line = buf.split_to(pos);
                            let _ = buf.split_to(1); // drop '\n'
                            if discarding {
                                discarding = false;
                                continue;
                            }
                            if !forward_line(&tx, &line, max).await {
                                return;
                            }
                        } else {
                            if !discarding && buf.len() > max {
                                let prefix = String::from_utf8_lossy(&buf[..max]);
                                let cut = format!("{prefix}{TRUNCATION_MARKER}");
                                let item = SourceItem::Line(parse_source_line(&cut, true));
                                if tx.send(item).await.is_err() {
                                    return;
                                }
                                buf.clear();
                                discarding = true;
                            }
                            break;
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!(ctx = %ctx, error = %e, "log stream error");
                    let _ = tx.send(SourceItem::Error(e.to_string())).await;
                    return;
                }
                None => {
                    if !buf.is_empty() && !discarding {
                        let _ = forward_line(&tx, &buf, max).await;
                    }
                    debug!(ctx = %ctx, "log stream ended");
                    let _ = tx.send(SourceItem::Eof).await;
                    return;
                }
            }
        }
    }
}

async fn forward_line(tx: &mpsc::Sender<SourceItem>, raw: &[u8], max: usize) -> bool {
    let text = String::from_utf8_lossy(raw);
    let (line, truncated) = truncate_line(&text, max);
    tx.send(SourceItem::Line(parse_source_line(&line, truncated)))
        .await
        .is_ok()
}
