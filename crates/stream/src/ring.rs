//! Bounded recent-history buffer per worker, used for backfill on attach
//! and reconnect.

use std::collections::VecDeque;
use std::sync::Arc;

use tailgate_core::{Record, ResumeCursor};

/// FIFO ring bounded by line count AND total bytes. Eviction happens on
/// push when either bound is exceeded.
pub struct RingBuffer {
    buf: VecDeque<Arc<Record>>,
    bytes: usize,
    max_lines: usize,
    max_bytes: usize,
}

impl RingBuffer {
    pub fn new(max_lines: usize, max_bytes: usize) -> Self {
        Self { buf: VecDeque::with_capacity(max_lines.min(1024)), bytes: 0, max_lines, max_bytes }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn push(&mut self, record: Arc<Record>) {
        self.bytes += record.approx_bytes();
        self.buf.push_back(record);
        while self.buf.len() > self.max_lines || (self.bytes > self.max_bytes && self.buf.len() > 1)
        {
            if let Some(evicted) = self.buf.pop_front() {
                self.bytes -= evicted.approx_bytes();
            }
        }
    }

    /// Cursor of the newest record, if any.
    pub fn last_cursor(&self) -> Option<ResumeCursor> {
        self.buf.back().map(|r| r.cursor())
    }

    /// Records strictly after `cursor`, newest `tail` of them. `tail = 0`
    /// returns nothing (live-only attach).
    pub fn backfill(&self, cursor: Option<ResumeCursor>, tail: i64) -> Vec<Arc<Record>> {
        if tail <= 0 {
            return Vec::new();
        }
        let mut out: Vec<Arc<Record>> = self
            .buf
            .iter()
            .filter(|r| cursor.map_or(true, |c| c.precedes(r.ts, r.seq)))
            .cloned()
            .collect();
        let tail = tail as usize;
        if out.len() > tail {
            out.drain(..out.len() - tail);
        }
        out
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(ts: i64, seq: u64) -> Arc<Record> {
        Arc::new(Record {
            ts,
            seq,
            pod: "web-1".into(),
            container: "app".into(),
            line: format!("line {seq}"),
            truncated: false,
            ts_estimated: false,
            level: None,
        })
    }

    #[test]
    fn evicts_fifo_on_line_bound() {
        let mut ring = RingBuffer::new(3, usize::MAX);
        for i in 1..=5 {
            ring.push(rec(i as i64, i));
        }
        assert_eq!(ring.len(), 3);
        let all = ring.backfill(None, 100);
        assert_eq!(all.first().map(|r| r.seq), Some(3));
        assert_eq!(all.last().map(|r| r.seq), Some(5));
    }

    #[test]
    fn evicts_on_byte_bound() {
        let mut ring = RingBuffer::new(1000, 200);
        for i in 1..=10 {
            ring.push(rec(i as i64, i));
        }
        assert!(ring.len() < 10);
        // Newest record always survives.
        assert_eq!(ring.last_cursor().map(|c| c.seq), Some(10));
    }

    #[test]
    fn backfill_is_strictly_after_cursor_and_tail_capped() {
        let mut ring = RingBuffer::new(100, usize::MAX);
        for i in 1..=8 {
            ring.push(rec(i as i64 * 10, i));
        }
        let after = ring.backfill(Some(ResumeCursor::new(30, 3)), 100);
        assert_eq!(after.iter().map(|r| r.seq).collect::<Vec<_>>(), vec![4, 5, 6, 7, 8]);

        let capped = ring.backfill(None, 2);
        assert_eq!(capped.iter().map(|r| r.seq).collect::<Vec<_>>(), vec![7, 8]);

        assert!(ring.backfill(Some(ResumeCursor::at_time(i64::MAX)), 10).is_empty());
        assert!(ring.backfill(None, 0).is_empty());
    }
}
