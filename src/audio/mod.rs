//! Microphone capture boundary
//!
//! Captures from the default input device and delivers fixed-cadence raw
//! PCM16 fragments into the session event loop. Flush payloads are framed
//! as in-memory WAV before they go to the gateway.

pub mod capture;
mod wav;

pub use capture::{CaptureError, CaptureHandle};
pub use wav::encode_wav;
