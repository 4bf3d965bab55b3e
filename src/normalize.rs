//! Speaker roles and transcript normalization
//!
//! Raw transcript text is turned into clean, speaker-prefixed lines before
//! it is surfaced to the host. Normalization is idempotent: feeding its own
//! output back in does not double-prefix lines.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Boundary where a sentence-like unit ends: terminal punctuation followed
/// by whitespace. The punctuation stays with the preceding unit.
static SENTENCE_BOUNDARY: Lazy<Regex> = Lazy::new(|| Regex::new(r"[.?!]\s+").unwrap());

/// Who is speaking in the consultation. The wire string goes to the
/// transcription endpoint; the display label prefixes transcript lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Patient,
    Clinician,
}

impl Speaker {
    /// Role string sent as request metadata.
    pub fn as_str(&self) -> &'static str {
        match self {
            Speaker::Patient => "patient",
            Speaker::Clinician => "clinician",
        }
    }

    /// Display label used to prefix transcript lines.
    pub fn display_label(&self) -> &'static str {
        match self {
            Speaker::Patient => "Paciente",
            Speaker::Clinician => "Médico",
        }
    }
}

impl Default for Speaker {
    fn default() -> Self {
        Speaker::Clinician
    }
}

/// Split raw text into trimmed sentence-like units.
///
/// Lines are split first; within a line, a unit ends where `.`, `?` or `!`
/// is immediately followed by whitespace (the regex engine has no
/// lookbehind, so the boundary match is cut after its first byte — the
/// punctuation characters are all single-byte). Empty units are dropped;
/// every non-whitespace character of the input survives, in order.
pub fn split_sentences(raw: &str) -> Vec<String> {
    let mut units = Vec::new();
    for line in raw.lines() {
        let mut start = 0;
        for boundary in SENTENCE_BOUNDARY.find_iter(line) {
            let cut = boundary.start() + 1;
            push_unit(&mut units, &line[start..cut]);
            start = boundary.end();
        }
        push_unit(&mut units, &line[start..]);
    }
    units
}

fn push_unit(units: &mut Vec<String>, unit: &str) {
    let trimmed = unit.trim();
    if !trimmed.is_empty() {
        units.push(trimmed.to_string());
    }
}

/// Normalize a raw transcript into speaker-prefixed lines.
///
/// Units already carrying the speaker prefix (case-insensitive
/// `"<label>:"`) are left alone. Empty or whitespace-only input yields an
/// empty Vec; callers treat that as "no new content" and skip dispatch.
pub fn normalize(raw: &str, speaker: Speaker) -> Vec<String> {
    let label = speaker.display_label();
    let prefix_probe = format!("{}:", label.to_lowercase());
    split_sentences(raw)
        .into_iter()
        .map(|unit| {
            if unit.to_lowercase().starts_with(&prefix_probe) {
                unit
            } else {
                format!("{}: {}", label, unit)
            }
        })
        .collect()
}
