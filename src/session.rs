//! Session identity and the per-session aggregate

use uuid::Uuid;

use crate::chunks::ChunkBuffer;
use crate::normalize::Speaker;

/// Generate an opaque session identifier: UTC timestamp prefix plus a
/// random suffix. Unique with overwhelming probability within a running
/// process; no coordination with other processes is attempted.
pub fn generate_session_id() -> String {
    let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
    format!("{}-{}", stamp, Uuid::new_v4().simple())
}

/// One recording session: identity, speaker role, fragment buffers and the
/// partial-flush guard. Owned and mutated only by the capture state machine.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub speaker: Speaker,
    pub chunks: ChunkBuffer,
    /// True while a partial flush is outstanding. Sends must never overlap.
    pub send_in_flight: bool,
    /// Last normalized partial delivered, kept for optional duplicate
    /// suppression across consecutive flushes.
    pub last_partial: Option<String>,
}

impl Session {
    pub fn new(speaker: Speaker) -> Self {
        Self {
            id: generate_session_id(),
            speaker,
            chunks: ChunkBuffer::new(),
            send_in_flight: false,
            last_partial: None,
        }
    }

    /// Reset for the next session: fresh identifier, cleared buffers.
    pub fn reset(&mut self, speaker: Speaker) {
        self.id = generate_session_id();
        self.speaker = speaker;
        self.chunks.clear();
        self.send_in_flight = false;
        self.last_partial = None;
    }
}
