//! HTTP surface: the single-pod and app streaming endpoints plus health.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::Stream;
use metrics::counter;
use regex::Regex;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use tailgate_core::{ControlEvent, Error, ResumeCursor, StreamItem, WorkerKey};
use tailgate_stream::{
    Aggregator, AppStreamSpec, Discovery, FilterSet, Subscription, Worker, WorkerPool,
};

use crate::auth::Authenticator;
use crate::ratelimit::RateLimiter;
use crate::sse::{resolve_resume, to_event};

pub struct AppState {
    pub pool: Arc<WorkerPool>,
    pub discovery: Arc<dyn Discovery>,
    pub auth: Arc<dyn Authenticator>,
    pub limiter: RateLimiter,
}

#[derive(Debug, Default, Deserialize)]
pub struct LogQuery {
    pub tail: Option<i64>,
    pub since: Option<String>,
    pub container: Option<String>,
    pub level: Option<String>,
    pub regex: Option<String>,
    /// App streams only: explicit selector overriding app-name resolution.
    pub selector: Option<String>,
}

/// Pre-upgrade errors become JSON bodies with a matching status; anything
/// after the SSE upgrade travels as control events instead.
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Invalid(_) => StatusCode::BAD_REQUEST,
            Error::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            Error::UpstreamUnavailable(_) | Error::BrokerUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Error::ClientGone | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({
            "error": self.0.kind(),
            "message": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}

fn build_filters(q: &LogQuery) -> Result<FilterSet, Error> {
    let min_level = match q.level.as_deref() {
        Some(s) => {
            Some(s.parse().map_err(|_| Error::Invalid(format!("unknown level: {s}")))?)
        }
        None => None,
    };
    let regex = match q.regex.as_deref() {
        Some(s) => Some(Regex::new(s).map_err(|e| Error::Invalid(format!("bad regex: {e}")))?),
        None => None,
    };
    Ok(FilterSet { min_level, regex, container: q.container.clone() })
}

/// Detaches the subscriber and stops its aggregator when the client goes
/// away, however the response future is dropped.
struct StreamGuard {
    workers: Vec<Arc<Worker>>,
    sub_id: Uuid,
    cancel: Option<CancellationToken>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.detach(self.sub_id);
        }
        if let Some(cancel) = &self.cancel {
            cancel.cancel();
        }
        counter!("tailgate_streams_closed_total", 1);
    }
}

fn sse_response(
    rx: mpsc::Receiver<StreamItem>,
    guard: StreamGuard,
    close_on_error: bool,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream =
        futures::stream::unfold((rx, guard, false), move |(mut rx, guard, done)| async move {
            if done {
                return None;
            }
            let item = rx.recv().await?;
            // Single-source streams end after a terminal stream-error; app
            // streams stay open because the aggregator respawns workers.
            let terminal = close_on_error
                && matches!(item, StreamItem::Control(ControlEvent::StreamError { .. }));
            Some((Ok(to_event(&item)), (rx, guard, terminal)))
        });
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("ping"),
    )
}

/// Acquire can race a worker into Draining; one retry gets a fresh one.
fn attach_with_retry(
    pool: &Arc<WorkerPool>,
    key: WorkerKey,
    sub: &Subscription,
    tail: i64,
    resume: Option<ResumeCursor>,
) -> Result<Arc<Worker>, Error> {
    let worker = pool.acquire(key.clone());
    match worker.attach(sub, tail, resume) {
        Ok(()) => Ok(worker),
        Err(_) => {
            let worker = pool.acquire(key);
            worker.attach(sub, tail, resume)?;
            Ok(worker)
        }
    }
}

pub async fn pod_logs(
    State(state): State<Arc<AppState>>,
    Path((ns, pod)): Path<(String, String)>,
    Query(q): Query<LogQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let principal = state.auth.authenticate(&headers).await?;
    let cfg = state.pool.config();
    if !cfg.namespace_allowed(&ns) {
        return Err(Error::Forbidden(format!("namespace {ns} is not allowed")).into());
    }
    if !state.limiter.allow(&principal.subject) {
        counter!("tailgate_rate_limited_total", 1);
        return Err(Error::RateLimited(format!(
            "stream admissions exhausted for {}",
            principal.subject
        ))
        .into());
    }
    let filters = build_filters(&q)?;
    let tail = cfg.clamp_tail(q.tail);
    let resume = resolve_resume(&headers, q.since.as_deref());

    let summary = state.discovery.get_pod(&ns, &pod).await?;
    let containers: Vec<String> = match &q.container {
        Some(c) => {
            if !summary.containers.contains(c) {
                return Err(
                    Error::NotFound(format!("container {c} not found in pod {pod}")).into()
                );
            }
            vec![c.clone()]
        }
        None => summary.containers.clone(),
    };
    if containers.is_empty() {
        return Err(Error::NotFound(format!("pod {pod} has no containers")).into());
    }

    let (sub, rx) =
        Subscription::new(principal.subject.clone(), filters, cfg.subscriber_buffer_lines);
    let mut workers = Vec::with_capacity(containers.len());
    for container in containers {
        let key = WorkerKey::new(cfg.cluster.clone(), ns.clone(), pod.clone(), container);
        workers.push(attach_with_retry(&state.pool, key, &sub, tail, resume)?);
    }
    info!(ns = %ns, pod = %pod, sub = %sub.id, principal = %principal.subject, "pod stream started");
    counter!("tailgate_streams_total", 1);
    let guard = StreamGuard { workers, sub_id: sub.id, cancel: None };
    Ok(sse_response(rx, guard, true))
}

pub async fn app_logs(
    State(state): State<Arc<AppState>>,
    Path((ns, app)): Path<(String, String)>,
    Query(q): Query<LogQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let principal = state.auth.authenticate(&headers).await?;
    let cfg = state.pool.config();
    if !cfg.namespace_allowed(&ns) {
        return Err(Error::Forbidden(format!("namespace {ns} is not allowed")).into());
    }
    if !state.limiter.allow(&principal.subject) {
        counter!("tailgate_rate_limited_total", 1);
        return Err(Error::RateLimited(format!(
            "stream admissions exhausted for {}",
            principal.subject
        ))
        .into());
    }
    let filters = build_filters(&q)?;
    let tail = cfg.clamp_tail(q.tail);
    // An app cursor spans many workers whose sequence lines are unrelated;
    // resume by time so one pod's seq does not gate or flag another's.
    let resume =
        resolve_resume(&headers, q.since.as_deref()).map(|c| ResumeCursor::at_time(c.ts));

    let (selector, pods) = match &q.selector {
        Some(sel) => (sel.clone(), state.discovery.list_pods(&ns, sel).await?),
        None => state.discovery.resolve_app_pods(&ns, &app).await?,
    };
    if pods.is_empty() {
        return Err(Error::NotFound(format!("no pods match app {app}")).into());
    }

    let (sub, rx) =
        Subscription::new(principal.subject.clone(), filters, cfg.subscriber_buffer_lines);
    let sub_id = sub.id;
    let cancel = CancellationToken::new();
    let aggregator = Aggregator::new(Arc::clone(&state.pool), Arc::clone(&state.discovery));
    let spec = AppStreamSpec { namespace: ns.clone(), selector, tail, resume };
    tokio::spawn({
        let cancel = cancel.clone();
        async move { aggregator.run(spec, sub, pods, cancel).await }
    });
    info!(ns = %ns, app = %app, sub = %sub_id, principal = %principal.subject, "app stream started");
    counter!("tailgate_streams_total", 1);
    let guard = StreamGuard { workers: Vec::new(), sub_id, cancel: Some(cancel) };
    Ok(sse_response(rx, guard, false))
}

pub async fn healthz(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok", "workers": state.pool.worker_count() }))
}
