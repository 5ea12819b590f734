//! Subscriber state and the non-blocking fan-out discipline.
//!
//! A [`Subscription`] is one client stream: a bounded delivery queue shared
//! by every worker feeding it, plus shared drop accounting. Each worker gets
//! its own [`SubscriberHandle`] carrying a per-attachment resume cursor, so
//! app streams can interleave pods without one pod's clock gating another's.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use metrics::counter;
use regex::Regex;
use tokio::sync::mpsc;
use uuid::Uuid;

use tailgate_core::{ControlEvent, LogLevel, Record, ResumeCursor, StreamItem};

/// Subscriber-side predicates, applied after backfill selection but before
/// the delivery queue.
#[derive(Debug, Default)]
pub struct FilterSet {
    /// Minimum severity; records with no sniffed level always pass.
    pub min_level: Option<LogLevel>,
    pub regex: Option<Regex>,
    pub container: Option<String>,
}

impl FilterSet {
    pub fn matches(&self, record: &Record) -> bool {
        if let Some(min) = self.min_level {
            if let Some(level) = record.level {
                if level < min {
                    return false;
                }
            }
        }
        if let Some(re) = &self.regex {
            if !re.is_match(&record.line) {
                return false;
            }
        }
        if let Some(container) = &self.container {
            if record.container != *container {
                return false;
            }
        }
        true
    }
}

/// One client stream. Cheap to clone handles off; owns nothing but the
/// sending side of the delivery queue.
pub struct Subscription {
    pub id: Uuid,
    pub principal: String,
    tx: mpsc::Sender<StreamItem>,
    filters: Arc<FilterSet>,
    dropped: Arc<AtomicU64>,
}

impl Subscription {
    /// Build a subscription with a delivery queue of `queue_cap` items.
    pub fn new(
        principal: impl Into<String>,
        filters: FilterSet,
        queue_cap: usize,
    ) -> (Self, mpsc::Receiver<StreamItem>) {
        let (tx, rx) = mpsc::channel(queue_cap.max(1));
        let sub = Self {
            id: Uuid::new_v4(),
            principal: principal.into(),
            tx,
            filters: Arc::new(filters),
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (sub, rx)
    }

    /// Fresh per-worker handle seeded at `resume`.
    pub fn handle(&self, resume: Option<ResumeCursor>) -> Arc<SubscriberHandle> {
        Arc::new(SubscriberHandle {
            id: self.id,
            tx: self.tx.clone(),
            filters: Arc::clone(&self.filters),
            dropped: Arc::clone(&self.dropped),
            cursor: Mutex::new(resume.unwrap_or_default()),
        })
    }

    /// Push a control event, best-effort.
    pub fn send_control(&self, event: ControlEvent) -> bool {
        self.tx.try_send(StreamItem::Control(event)).is_ok()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Outcome of offering one record to a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    Delivered,
    /// Rejected by the filter set; cursor advanced so reconnect does not
    /// replay the line.
    Filtered,
    /// At or before the attachment cursor.
    AlreadySeen,
    /// Queue full; counted against the subscriber's lag.
    Dropped,
    /// Receiver is gone; the worker detaches this handle.
    Gone,
}

/// Worker-side view of one subscriber attachment.
pub struct SubscriberHandle {
    id: Uuid,
    tx: mpsc::Sender<StreamItem>,
    filters: Arc<FilterSet>,
    dropped: Arc<AtomicU64>,
    cursor: Mutex<ResumeCursor>,
}

impl SubscriberHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn cursor(&self) -> ResumeCursor {
        *self.cursor.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn advance(&self, record: &Record) {
        let mut cur = self.cursor.lock().unwrap_or_else(|e| e.into_inner());
        *cur = record.cursor();
    }

    /// Non-blocking fan-out of one record. The worker is never blocked by a
    /// slow client: overflow increments `dropped` and the next successful
    /// emission is preceded by a `lag` control event.
    pub fn offer(&self, record: &Arc<Record>) -> OfferOutcome {
        if !self.cursor().precedes(record.ts, record.seq) {
            return OfferOutcome::AlreadySeen;
        }
        if !self.filters.matches(record) {
            self.advance(record);
            return OfferOutcome::Filtered;
        }
        let behind = self.dropped.swap(0, Ordering::AcqRel);
        if behind > 0 {
            if self
                .tx
                .try_send(StreamItem::Control(ControlEvent::Lag { dropped: behind }))
                .is_err()
            {
                // Still congested; restore the count plus this record.
                self.dropped.fetch_add(behind + 1, Ordering::AcqRel);
                counter!("tailgate_records_dropped_total", 1);
                return OfferOutcome::Dropped;
            }
        }
        match self.tx.try_send(StreamItem::Record(Arc::clone(record))) {
            Ok(()) => {
                self.advance(record);
                OfferOutcome::Delivered
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::AcqRel);
                counter!("tailgate_records_dropped_total", 1);
                OfferOutcome::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => OfferOutcome::Gone,
        }
    }

    /// Push a control event, best-effort. Returns false when the receiver
    /// is gone.
    pub fn send_control(&self, event: ControlEvent) -> bool {
        !matches!(
            self.tx.try_send(StreamItem::Control(event)),
            Err(mpsc::error::TrySendError::Closed(_))
        )
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(ts: i64, seq: u64, line: &str) -> Arc<Record> {
        Arc::new(Record {
            ts,
            seq,
            pod: "web-1".into(),
            container: "app".into(),
            line: line.into(),
            truncated: false,
            ts_estimated: false,
            level: tailgate_core::sniff_level(line),
        })
    }

    #[tokio::test]
    async fn cursor_gate_skips_already_seen() {
        let (sub, mut rx) = Subscription::new("alice", FilterSet::default(), 8);
        let h = sub.handle(Some(ResumeCursor::new(100, 2)));
        assert_eq!(h.offer(&rec(100, 2, "old")), OfferOutcome::AlreadySeen);
        assert_eq!(h.offer(&rec(100, 3, "new")), OfferOutcome::Delivered);
        assert!(matches!(rx.recv().await, Some(StreamItem::Record(r)) if r.seq == 3));
    }

    #[tokio::test]
    async fn filtered_records_advance_cursor_but_not_dropped() {
        let filters = FilterSet { min_level: Some(LogLevel::Warn), ..Default::default() };
        let (sub, mut rx) = Subscription::new("alice", filters, 8);
        let h = sub.handle(None);
        assert_eq!(h.offer(&rec(1, 1, "INFO quiet")), OfferOutcome::Filtered);
        assert_eq!(h.cursor(), ResumeCursor::new(1, 1));
        assert_eq!(sub.dropped(), 0);
        // Replaying the filtered record after reconnecting at its cursor
        // does nothing.
        assert_eq!(h.offer(&rec(1, 1, "INFO quiet")), OfferOutcome::AlreadySeen);
        assert_eq!(h.offer(&rec(2, 2, "ERROR loud")), OfferOutcome::Delivered);
        assert!(matches!(rx.recv().await, Some(StreamItem::Record(r)) if r.seq == 2));
    }

    #[tokio::test]
    async fn overflow_drops_and_surfaces_lag() {
        let (sub, mut rx) = Subscription::new("alice", FilterSet::default(), 2);
        let h = sub.handle(None);
        for i in 1..=10 {
            h.offer(&rec(i, i as u64, "x"));
        }
        assert_eq!(sub.dropped(), 8);

        // Drain the two queued records, then the next offer emits lag first.
        assert!(matches!(rx.recv().await, Some(StreamItem::Record(r)) if r.seq == 1));
        assert!(matches!(rx.recv().await, Some(StreamItem::Record(r)) if r.seq == 2));
        assert_eq!(h.offer(&rec(11, 11, "live")), OfferOutcome::Delivered);
        assert!(matches!(
            rx.recv().await,
            Some(StreamItem::Control(ControlEvent::Lag { dropped: 8 }))
        ));
        assert!(matches!(rx.recv().await, Some(StreamItem::Record(r)) if r.seq == 11));
    }

    #[tokio::test]
    async fn closed_receiver_reports_gone() {
        let (sub, rx) = Subscription::new("alice", FilterSet::default(), 2);
        let h = sub.handle(None);
        drop(rx);
        assert_eq!(h.offer(&rec(1, 1, "x")), OfferOutcome::Gone);
        assert!(!h.send_control(ControlEvent::RateLimited));
    }

    #[test]
    fn container_filter_matches_exactly() {
        let filters =
            FilterSet { container: Some("app".into()), ..Default::default() };
        assert!(filters.matches(&rec(1, 1, "x")));
        let other = Record { container: "sidecar".into(), ..(*rec(1, 1, "x")).clone() };
        assert!(!filters.matches(&other));
    }
}
