//! HTTP client for the transcription endpoint
//!
//! One multipart POST per flush: the audio payload plus speaker role and
//! session identifier as metadata. No retries anywhere — a dropped partial
//! is acceptable because the final flush re-sends the complete audio.

use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use std::sync::OnceLock;
use std::time::Duration;

use crate::normalize::Speaker;

/// Shared HTTP client for reuse across requests (avoids connection setup
/// overhead per flush).
static HTTP_CLIENT: OnceLock<Client> = OnceLock::new();

fn http_client() -> &'static Client {
    HTTP_CLIENT.get_or_init(|| {
        Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .expect("Failed to build HTTP client")
    })
}

/// Errors that can occur during a gateway exchange.
#[derive(Debug)]
pub enum GatewayError {
    /// The network exchange did not complete.
    Transport(String),
    /// The endpoint answered with a non-success status; the body is kept as
    /// diagnostic text.
    Service { status: u16, body: String },
    /// The endpoint answered with a success status but an undecodable body.
    InvalidResponse(String),
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayError::Transport(e) => write!(f, "Transport error: {}", e),
            GatewayError::Service { status, body } => {
                write!(f, "Transcription service error ({}): {}", status, body)
            }
            GatewayError::InvalidResponse(e) => {
                write!(f, "Invalid transcription response: {}", e)
            }
        }
    }
}

impl std::error::Error for GatewayError {}

/// Response shape of the transcription endpoint. The transcript may arrive
/// under either field name depending on the backend route.
#[derive(Debug, Deserialize)]
struct TranscribeResponse {
    #[serde(default)]
    transcripcion: Option<String>,
    #[serde(default)]
    texto: Option<String>,
}

impl TranscribeResponse {
    fn into_text(self) -> String {
        self.transcripcion.or(self.texto).unwrap_or_default()
    }
}

/// Result of one flush: the raw transcript text. Empty means the service
/// heard nothing new — a valid outcome, not an error.
#[derive(Debug, Clone)]
pub struct TranscriptResult {
    pub text: String,
}

impl TranscriptResult {
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// Send one flush of session audio to the transcription endpoint.
pub async fn transcribe(
    endpoint: &str,
    audio_wav: Vec<u8>,
    speaker: Speaker,
    session_id: &str,
) -> Result<TranscriptResult, GatewayError> {
    log::debug!(
        "Transcribing {} bytes for session {} ({})",
        audio_wav.len(),
        session_id,
        speaker.as_str()
    );

    let file_part = Part::bytes(audio_wav)
        .file_name("grabacion.wav")
        .mime_str("audio/wav")
        .map_err(|e| GatewayError::Transport(e.to_string()))?;

    let form = Form::new()
        .part("file", file_part)
        .text("speaker", speaker.as_str())
        .text("session_id", session_id.to_string());

    let response = http_client()
        .post(endpoint)
        .multipart(form)
        .send()
        .await
        .map_err(|e| GatewayError::Transport(e.to_string()))?;

    let status = response.status();

    if status.is_success() {
        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        let parsed: TranscribeResponse = serde_json::from_str(&body)
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;

        let text = parsed.into_text();
        log::info!(
            "Transcription returned {} chars for session {}",
            text.len(),
            session_id
        );
        Ok(TranscriptResult { text })
    } else {
        let body = response.text().await.unwrap_or_default();
        log::error!(
            "Transcription service error ({}): {}",
            status.as_u16(),
            body
        );
        Err(GatewayError::Service {
            status: status.as_u16(),
            body,
        })
    }
}
