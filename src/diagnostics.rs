//! Bounded log of recent operational events
//!
//! Keeps the last N session events (state transitions, flush outcomes,
//! capture errors) for inspection without unbounded growth. Oldest entries
//! are evicted first.

use serde::Serialize;
use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

/// Maximum number of events retained by default.
const MAX_EVENT_HISTORY: usize = 64;

/// One recorded operational event.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticEvent {
    /// Unix timestamp (seconds).
    pub timestamp: u64,
    /// Short category: "state", "flush", "capture", "transcript".
    pub category: &'static str,
    pub message: String,
}

/// Ring buffer of recent operational events.
#[derive(Debug)]
pub struct DiagnosticsLog {
    events: VecDeque<DiagnosticEvent>,
    capacity: usize,
}

impl Default for DiagnosticsLog {
    fn default() -> Self {
        Self::new(MAX_EVENT_HISTORY)
    }
}

impl DiagnosticsLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn record(&mut self, category: &'static str, message: impl Into<String>) {
        while self.events.len() >= self.capacity.max(1) {
            self.events.pop_front();
        }
        self.events.push_back(DiagnosticEvent {
            timestamp: unix_now(),
            category,
            message: message.into(),
        });
    }

    /// Retained events, oldest first.
    pub fn recent(&self) -> impl Iterator<Item = &DiagnosticEvent> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_in_order() {
        let mut diag = DiagnosticsLog::new(10);
        diag.record("state", "Idle -> Recording");
        diag.record("flush", "partial failed: timeout");

        let messages: Vec<&str> = diag.recent().map(|e| e.message.as_str()).collect();
        assert_eq!(
            messages,
            vec!["Idle -> Recording", "partial failed: timeout"]
        );
    }

    #[test]
    fn evicts_oldest_beyond_capacity() {
        let mut diag = DiagnosticsLog::new(3);
        for i in 0..5 {
            diag.record("state", format!("event {}", i));
        }

        assert_eq!(diag.len(), 3);
        let messages: Vec<&str> = diag.recent().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["event 2", "event 3", "event 4"]);
    }

    #[test]
    fn clear_empties_the_log() {
        let mut diag = DiagnosticsLog::default();
        diag.record("capture", "No audio input device found");
        diag.clear();
        assert!(diag.is_empty());
    }
}
