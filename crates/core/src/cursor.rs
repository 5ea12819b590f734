//! Resume cursors and their event-id encoding.

use std::fmt;

/// Position in a worker's stream: `(source timestamp ns, sequence)`.
///
/// Encoded on the wire as the SSE event id `"{ts}-{seq}"`; a client replays
/// the id in `Last-Event-ID` and resumes strictly past it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct ResumeCursor {
    pub ts: i64,
    pub seq: u64,
}

impl ResumeCursor {
    pub fn new(ts: i64, seq: u64) -> Self {
        Self { ts, seq }
    }

    /// Cursor pointing at a timestamp with no sequence component, as built
    /// from a `since` query parameter. `seq = 0` so the first record at the
    /// exact timestamp is still delivered.
    pub fn at_time(ts: i64) -> Self {
        Self { ts, seq: 0 }
    }

    /// True when `(ts, seq)` lies strictly after this cursor.
    pub fn precedes(&self, ts: i64, seq: u64) -> bool {
        (ts, seq) > (self.ts, self.seq)
    }

    /// Parse an event id previously produced by `Display`. Anything that
    /// does not round-trip is rejected.
    pub fn parse(s: &str) -> Option<Self> {
        let (ts, seq) = s.split_once('-')?;
        Some(Self { ts: ts.parse().ok()?, seq: seq.parse().ok()? })
    }
}

impl fmt::Display for ResumeCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ts, self.seq)
    }
}
