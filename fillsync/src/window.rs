//! Splits a time range into windows no longer than the maximum span the source accepts in a
//! single historical query.

use std::fmt;
use std::time::Duration;

use crate::datapoint::Timestamp;

/// Half-open interval `[start, end)` in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Window {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl Window {
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    pub fn len_ms(&self) -> i64 {
        self.end - self.start
    }

    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts < self.end
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", fmt_ts(self.start), fmt_ts(self.end))
    }
}

fn fmt_ts(ts: Timestamp) -> String {
    chrono::DateTime::from_timestamp_millis(ts)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| ts.to_string())
}

/// Order in which the windows are handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Oldest to newest, windows anchored at `from`. Used by frontfill and streaming.
    Forward,
    /// Newest to oldest, windows anchored at `to`. Used by backfill.
    Backward,
}

/// Finite sequence of windows covering `[from, to)` exactly. The remaining range is kept in the
/// iterator, so a clone resumes from wherever the original currently is.
#[derive(Debug, Clone)]
pub struct Windows {
    from: Timestamp,
    to: Timestamp,
    max_span: i64,
    direction: Direction,
}

impl Iterator for Windows {
    type Item = Window;

    fn next(&mut self) -> Option<Self::Item> {
        if self.from >= self.to {
            return None;
        }
        match self.direction {
            Direction::Forward => {
                let end = self.from.saturating_add(self.max_span).min(self.to);
                let window = Window::new(self.from, end);
                self.from = end;
                Some(window)
            }
            Direction::Backward => {
                let start = self.to.saturating_sub(self.max_span).max(self.from);
                let window = Window::new(start, self.to);
                self.to = start;
                Some(window)
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.to.saturating_sub(self.from).max(0);
        let count = remaining / self.max_span + i64::from(remaining % self.max_span != 0);
        let count = usize::try_from(count).unwrap_or(usize::MAX);
        (count, Some(count))
    }
}

/// Plans the windows for `[from, to)`. `from >= to` yields nothing. A zero `max_span` is treated
/// as 1ms, configuration rejects it before it gets here.
pub fn plan(from: Timestamp, to: Timestamp, max_span: Duration, direction: Direction) -> Windows {
    let max_span = i64::try_from(max_span.as_millis())
        .unwrap_or(i64::MAX)
        .max(1);
    Windows {
        from,
        to,
        max_span,
        direction,
    }
}
