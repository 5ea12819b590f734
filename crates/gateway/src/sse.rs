//! SSE framing: stream items onto the wire, resume tokens off of it.

use axum::http::HeaderMap;
use axum::response::sse::Event;

use tailgate_core::{ResumeCursor, StreamItem};

/// Resolve the resume cursor for a request. The `Last-Event-ID` header wins
/// over the `since` parameter; a malformed header falls back to `since`.
pub fn resolve_resume(headers: &HeaderMap, since: Option<&str>) -> Option<ResumeCursor> {
    if let Some(raw) = headers.get("last-event-id").and_then(|v| v.to_str().ok()) {
        if let Some(cursor) = ResumeCursor::parse(raw) {
            return Some(cursor);
        }
    }
    since.and_then(parse_since)
}

/// `since` accepts RFC3339 or a raw nanosecond count.
fn parse_since(s: &str) -> Option<ResumeCursor> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return dt.timestamp_nanos_opt().map(ResumeCursor::at_time);
    }
    s.parse::<i64>().ok().map(ResumeCursor::at_time)
}

/// One stream item as an SSE frame. Records carry their cursor as the event
/// id so reconnects resume exactly past the last delivered record; control
/// events use their own `event:` names and never carry an id.
pub fn to_event(item: &StreamItem) -> Event {
    match item {
        StreamItem::Record(r) => Event::default()
            .id(r.event_id())
            .event("log")
            .data(serde_json::to_string(r.as_ref()).unwrap_or_default()),
        StreamItem::Control(c) => Event::default().event(c.event_name()).data(c.data().to_string()),
    }
}
