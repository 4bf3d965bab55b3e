//! Fragment buffer for a capture session
//!
//! Accumulates raw audio fragments in two ordered sequences: `full` (the
//! entire session, append-only) and `pending` (the suffix not yet sent).
//! A partial flush takes `pending`; the final flush takes `full`.

/// Buffer of raw audio fragments for one session.
///
/// Invariant: `pending` is always the most-recently-appended suffix of
/// `full` that has not been taken yet.
#[derive(Debug, Default)]
pub struct ChunkBuffer {
    full: Vec<Vec<u8>>,
    pending: Vec<Vec<u8>>,
}

impl ChunkBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment to both sequences. Callers only hand over
    /// non-empty fragments.
    pub fn append(&mut self, fragment: Vec<u8>) {
        self.full.push(fragment.clone());
        self.pending.push(fragment);
    }

    /// Take the pending fragments, leaving `full` untouched.
    /// Safe to call with nothing pending (returns an empty Vec).
    pub fn take_pending(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.pending)
    }

    /// Take the entire session history, clearing the buffer.
    /// Used once, at session end.
    pub fn take_full(&mut self) -> Vec<Vec<u8>> {
        self.pending.clear();
        std::mem::take(&mut self.full)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn full_len(&self) -> usize {
        self.full.len()
    }

    /// Total bytes held across the full history.
    pub fn memory_bytes(&self) -> usize {
        self.full.iter().map(Vec::len).sum()
    }

    pub fn clear(&mut self) {
        self.full.clear();
        self.pending.clear();
    }
}
