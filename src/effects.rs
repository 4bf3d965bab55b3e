//! Effect runner
//!
//! Executes effects produced by the state machine: device control through
//! the capture module, gateway exchanges through the transcription module.
//! Completion events are fed back into the event loop over the provided
//! channel.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};

use crate::audio::{self, CaptureHandle};
use crate::normalize::Speaker;
use crate::settings::AppSettings;
use crate::state_machine::{Effect, Event, FlushOutcome};
use crate::transcription;

/// Sample rate assumed when no capture is active (zero-fragment payloads).
const FALLBACK_SAMPLE_RATE: u32 = 16_000;

/// Trait for running effects asynchronously.
/// Completion events are sent back via the provided channel.
pub trait EffectRunner: Send + Sync + 'static {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>);
}

struct ActiveCapture {
    session_id: String,
    handle: CaptureHandle,
}

/// Effect runner backed by the real capture device and HTTP gateway.
pub struct PipelineEffectRunner {
    settings: AppSettings,
    active: Arc<Mutex<Option<ActiveCapture>>>,
}

impl PipelineEffectRunner {
    pub fn new(settings: AppSettings) -> Arc<Self> {
        Arc::new(Self {
            settings,
            active: Arc::new(Mutex::new(None)),
        })
    }
}

impl EffectRunner for PipelineEffectRunner {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>) {
        match effect {
            Effect::StartCapture { session_id } => {
                let active = self.active.clone();
                let interval = self.settings.fragment_interval_ms;

                tokio::spawn(async move {
                    let events = tx.clone();
                    let sid = session_id.clone();
                    // Device acquisition blocks; keep it off the event loop
                    let started = tokio::task::spawn_blocking(move || {
                        audio::capture::start(sid, events, interval)
                    })
                    .await;

                    match started {
                        Ok(Ok(handle)) => {
                            let mut slot = active.lock().await;
                            if let Some(old) = slot.take() {
                                log::warn!(
                                    "Releasing stale capture for session {}",
                                    old.session_id
                                );
                            }
                            *slot = Some(ActiveCapture {
                                session_id: session_id.clone(),
                                handle,
                            });
                            drop(slot);

                            let _ = tx.send(Event::CaptureStarted { session_id }).await;
                        }
                        Ok(Err(e)) => {
                            let _ = tx
                                .send(Event::CaptureFailed {
                                    session_id,
                                    error: e.to_string(),
                                })
                                .await;
                        }
                        Err(e) => {
                            let _ = tx
                                .send(Event::CaptureFailed {
                                    session_id,
                                    error: format!("capture task failed: {}", e),
                                })
                                .await;
                        }
                    }
                });
            }

            Effect::StopCapture { session_id } => {
                let active = self.active.clone();
                tokio::spawn(async move {
                    let slot = active.lock().await;
                    match slot.as_ref() {
                        Some(capture) if capture.session_id == session_id => {
                            capture.handle.stop();
                        }
                        _ => log::warn!("StopCapture: no active capture for session {}", session_id),
                    }
                });
            }

            Effect::ReleaseCapture { session_id } => {
                let active = self.active.clone();
                tokio::spawn(async move {
                    let mut slot = active.lock().await;
                    match slot.take() {
                        Some(capture) if capture.session_id == session_id => {
                            drop(capture);
                            log::info!("Capture released for session {}", session_id);
                        }
                        Some(other) => {
                            // Don't tear down a capture that belongs to a
                            // newer session.
                            log::warn!(
                                "ReleaseCapture: session mismatch ({} active, {} requested)",
                                other.session_id,
                                session_id
                            );
                            *slot = Some(other);
                        }
                        None => log::warn!(
                            "ReleaseCapture: no active capture for session {}",
                            session_id
                        ),
                    }
                });
            }

            Effect::SendPartial {
                session_id,
                speaker,
                fragments,
            } => {
                let endpoint = self.settings.transcribe_url.clone();
                let active = self.active.clone();
                tokio::spawn(async move {
                    let outcome =
                        run_flush(&endpoint, speaker, &session_id, fragments, &active).await;
                    let _ = tx
                        .send(Event::PartialFlushed {
                            session_id,
                            outcome,
                        })
                        .await;
                });
            }

            Effect::SendFinal {
                session_id,
                speaker,
                fragments,
            } => {
                let endpoint = self.settings.transcribe_url.clone();
                let active = self.active.clone();
                tokio::spawn(async move {
                    let outcome =
                        run_flush(&endpoint, speaker, &session_id, fragments, &active).await;
                    let _ = tx
                        .send(Event::FinalFlushed {
                            session_id,
                            outcome,
                        })
                        .await;
                });
            }

            Effect::EmitPartial { .. } | Effect::EmitFinal { .. } | Effect::EmitState { .. } => {
                unreachable!("callback effects are handled in run_capture_loop");
            }
        }
    }
}

/// Frame the flushed fragments as WAV and run one gateway exchange.
async fn run_flush(
    endpoint: &str,
    speaker: Speaker,
    session_id: &str,
    fragments: Vec<Vec<u8>>,
    active: &Arc<Mutex<Option<ActiveCapture>>>,
) -> FlushOutcome {
    let sample_rate = {
        let slot = active.lock().await;
        slot.as_ref()
            .map(|capture| capture.handle.sample_rate())
            .unwrap_or(FALLBACK_SAMPLE_RATE)
    };

    let pcm: Vec<u8> = fragments.concat();
    let wav = match audio::encode_wav(&pcm, sample_rate) {
        Ok(wav) => wav,
        Err(e) => return FlushOutcome::Failed(format!("WAV framing failed: {}", e)),
    };

    match transcription::transcribe(endpoint, wav, speaker, session_id).await {
        Ok(result) => FlushOutcome::Transcript(result.text),
        Err(e) => FlushOutcome::Failed(e.to_string()),
    }
}

/// Stub effect runner for development runs without a device or network.
/// Acknowledges capture immediately and answers every flush with a canned
/// transcript naming the payload size.
#[allow(dead_code)]
pub struct StubEffectRunner;

#[allow(dead_code)]
impl StubEffectRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl EffectRunner for StubEffectRunner {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>) {
        match effect {
            Effect::StartCapture { session_id } => {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    let _ = tx.send(Event::CaptureStarted { session_id }).await;
                });
            }

            Effect::StopCapture { .. } | Effect::ReleaseCapture { .. } => {}

            Effect::SendPartial {
                session_id,
                fragments,
                ..
            } => {
                tokio::spawn(async move {
                    let bytes: usize = fragments.iter().map(Vec::len).sum();
                    let _ = tx
                        .send(Event::PartialFlushed {
                            session_id,
                            outcome: FlushOutcome::Transcript(format!(
                                "[{} bytes transcritos]",
                                bytes
                            )),
                        })
                        .await;
                });
            }

            Effect::SendFinal {
                session_id,
                fragments,
                ..
            } => {
                tokio::spawn(async move {
                    let bytes: usize = fragments.iter().map(Vec::len).sum();
                    let _ = tx
                        .send(Event::FinalFlushed {
                            session_id,
                            outcome: FlushOutcome::Transcript(format!(
                                "[{} bytes transcritos en total]",
                                bytes
                            )),
                        })
                        .await;
                });
            }

            Effect::EmitPartial { .. } | Effect::EmitFinal { .. } | Effect::EmitState { .. } => {
                unreachable!("callback effects are handled in run_capture_loop");
            }
        }
    }
}
