//! Transcription gateway
//!
//! Sends buffered session audio to the remote transcription endpoint and
//! parses the response.

mod gateway;

pub use gateway::{transcribe, GatewayError, TranscriptResult};
