//! consulta-transcribe: incremental consultation dictation
//!
//! Captures microphone audio, forwards chunked fragments to a remote
//! transcription endpoint, and surfaces speaker-prefixed partial and final
//! transcripts through host callbacks. All session behavior runs through a
//! single-writer event loop over the state machine in `state_machine`.

pub mod audio;
pub mod chunks;
pub mod diagnostics;
pub mod effects;
pub mod normalize;
pub mod session;
pub mod settings;
pub mod state_machine;
pub mod transcription;

use std::sync::Arc;

use tokio::sync::mpsc;

use diagnostics::DiagnosticsLog;
use effects::{EffectRunner, PipelineEffectRunner};
use state_machine::{Effect, Event, FlushOutcome, SessionOptions};

pub use normalize::Speaker;

/// Outbound callbacks to the host. Each is invoked synchronously within the
/// event-loop tick that produced it; the host must not assume batching.
pub struct SessionCallbacks {
    pub on_partial: Box<dyn Fn(&str) + Send>,
    pub on_final: Box<dyn Fn(&str) + Send>,
    pub on_state_change: Box<dyn Fn(bool) + Send>,
}

impl SessionCallbacks {
    /// Callbacks that do nothing; useful for tests and headless runs.
    pub fn noop() -> Self {
        Self {
            on_partial: Box::new(|_| {}),
            on_final: Box::new(|_| {}),
            on_state_change: Box::new(|_| {}),
        }
    }
}

/// Handle for dispatching host commands into the event loop.
#[derive(Clone)]
pub struct CaptureController {
    tx: mpsc::Sender<Event>,
}

impl CaptureController {
    pub async fn start(&self, speaker: Speaker) -> Result<(), mpsc::error::SendError<Event>> {
        self.tx.send(Event::StartRequested { speaker }).await
    }

    pub async fn stop(&self) -> Result<(), mpsc::error::SendError<Event>> {
        self.tx.send(Event::StopRequested).await
    }

    pub async fn shutdown(&self) -> Result<(), mpsc::error::SendError<Event>> {
        self.tx.send(Event::Shutdown).await
    }

    pub fn sender(&self) -> mpsc::Sender<Event> {
        self.tx.clone()
    }
}

/// Create the event channel and a controller for it.
pub fn capture_channel() -> (CaptureController, mpsc::Receiver<Event>, mpsc::Sender<Event>) {
    let (tx, rx) = mpsc::channel::<Event>(32);
    (CaptureController { tx: tx.clone() }, rx, tx)
}

/// Run the capture event loop until `Shutdown` or channel close.
///
/// Single writer: every event goes through the state machine here. Callback
/// effects are delivered inline; device and network effects are handed to
/// the runner, which reports back over `tx`.
pub async fn run_capture_loop(
    mut rx: mpsc::Receiver<Event>,
    tx: mpsc::Sender<Event>,
    runner: Arc<dyn EffectRunner>,
    callbacks: SessionCallbacks,
    options: SessionOptions,
) {
    let mut machine = state_machine::CaptureSession::new(options);
    let mut diag = DiagnosticsLog::default();
    log::info!("Capture loop started");

    while let Some(event) = rx.recv().await {
        if matches!(event, Event::Shutdown) {
            log::info!("Shutdown requested, leaving capture loop");
            break;
        }

        record_event(&mut diag, &event);

        let before = machine.state();
        let effects = machine.apply(event);
        let after = machine.state();
        if before != after {
            log::info!("State transition: {:?} -> {:?}", before, after);
            diag.record("state", format!("{:?} -> {:?}", before, after));
        }

        for effect in effects {
            match effect {
                Effect::EmitPartial { text } => (callbacks.on_partial)(&text),
                Effect::EmitFinal { text } => {
                    diag.record("transcript", format!("final: {} chars", text.len()));
                    (callbacks.on_final)(&text);
                }
                Effect::EmitState { recording } => (callbacks.on_state_change)(recording),
                other => runner.spawn(other, tx.clone()),
            }
        }
    }

    log::info!("Capture loop ended ({} diagnostic events)", diag.len());
}

/// Keep failures visible in the bounded diagnostics ring.
fn record_event(diag: &mut DiagnosticsLog, event: &Event) {
    match event {
        Event::CaptureFailed { error, .. } => diag.record("capture", error.clone()),
        Event::PartialFlushed {
            outcome: FlushOutcome::Failed(err),
            ..
        } => diag.record("flush", format!("partial failed: {}", err)),
        Event::FinalFlushed {
            outcome: FlushOutcome::Failed(err),
            ..
        } => diag.record("flush", format!("final failed: {}", err)),
        _ => {}
    }
}

/// CLI entry: Enter toggles recording, `q` quits. Partial and final
/// transcripts are printed as they arrive.
pub fn run() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .format_target(false)
        .init();

    let app_settings = settings::load_settings();
    log::info!("Transcription endpoint: {}", app_settings.transcribe_url);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime");

    let (controller, rx, tx) = capture_channel();
    let runner = PipelineEffectRunner::new(app_settings.clone());
    let options = SessionOptions {
        suppress_duplicate_partials: app_settings.suppress_duplicate_partials,
    };

    let callbacks = SessionCallbacks {
        on_partial: Box::new(|text| println!("--- parcial ---\n{}", text)),
        on_final: Box::new(|text| println!("=== transcripción final ===\n{}", text)),
        on_state_change: Box::new(|recording| {
            if recording {
                println!("[grabando] Enter para detener");
            } else {
                println!("[detenido] Enter para grabar, q para salir");
            }
        }),
    };

    // Stdin thread: Enter toggles recording, "q" (or EOF) shuts down.
    let speaker = app_settings.speaker;
    let stdin_tx = controller.sender();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut recording = false;
        let mut line = String::new();
        loop {
            line.clear();
            match stdin.read_line(&mut line) {
                Ok(0) | Err(_) => {
                    let _ = stdin_tx.blocking_send(Event::Shutdown);
                    break;
                }
                Ok(_) => {}
            }
            if line.trim().eq_ignore_ascii_case("q") {
                let _ = stdin_tx.blocking_send(Event::Shutdown);
                break;
            }
            let event = if recording {
                Event::StopRequested
            } else {
                Event::StartRequested { speaker }
            };
            recording = !recording;
            if stdin_tx.blocking_send(event).is_err() {
                break;
            }
        }
    });

    println!("[detenido] Enter para grabar, q para salir");
    runtime.block_on(run_capture_loop(rx, tx, runner, callbacks, options));
}
