//! Capture session state machine
//!
//! Implements the session workflow using a single-writer pattern: every
//! event goes through `CaptureSession::apply`, which mutates the owned
//! session aggregate and returns the effects to execute. The event loop is
//! the only caller, so sends never overlap and fragment ordering is
//! auditable in one place.

use crate::normalize::{normalize, Speaker};
use crate::session::Session;

/// Lifecycle of the capture workflow. A send in flight is tracked as a flag
/// on the session aggregate, not as a state: sends must not block fragment
/// accumulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Recording,
    Stopping,
}

/// Outcome of one gateway exchange, fed back by the effect runner.
#[derive(Debug, Clone)]
pub enum FlushOutcome {
    /// Raw transcript text. Empty means "nothing new", not failure.
    Transcript(String),
    /// The exchange failed; recoverable, the text is diagnostic only.
    Failed(String),
}

/// Events consumed by the state machine.
/// Sent from the host controller, the capture device and the effect runner.
#[derive(Debug, Clone)]
pub enum Event {
    /// Host asked to start a session.
    StartRequested { speaker: Speaker },
    /// Host asked to stop the active session.
    StopRequested,
    /// Capture device acquired; fragments will follow.
    CaptureStarted { session_id: String },
    /// Capture device could not be acquired; the session stays idle.
    CaptureFailed { session_id: String, error: String },
    /// One cadence worth of raw audio arrived from the device.
    FragmentArrived { session_id: String, bytes: Vec<u8> },
    /// A partial flush finished (success, empty or failure).
    PartialFlushed {
        session_id: String,
        outcome: FlushOutcome,
    },
    /// The final flush finished; session resources must be torn down.
    FinalFlushed {
        session_id: String,
        outcome: FlushOutcome,
    },
    /// Shut the event loop down (handled at the loop edge).
    Shutdown,
}

/// Effects produced by a transition. Device and network effects go to the
/// effect runner; `Emit*` effects are delivered inline by the event loop as
/// host callbacks.
#[derive(Debug, Clone)]
pub enum Effect {
    StartCapture {
        session_id: String,
    },
    StopCapture {
        session_id: String,
    },
    ReleaseCapture {
        session_id: String,
    },
    SendPartial {
        session_id: String,
        speaker: Speaker,
        fragments: Vec<Vec<u8>>,
    },
    SendFinal {
        session_id: String,
        speaker: Speaker,
        fragments: Vec<Vec<u8>>,
    },
    EmitPartial {
        text: String,
    },
    EmitFinal {
        text: String,
    },
    EmitState {
        recording: bool,
    },
}

/// Options affecting dispatch behavior.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Skip a partial whose normalized text equals the previous one.
    /// Off by default.
    pub suppress_duplicate_partials: bool,
}

/// The capture workflow: owns the session aggregate and applies events.
#[derive(Debug)]
pub struct CaptureSession {
    state: State,
    session: Session,
    options: SessionOptions,
}

impl CaptureSession {
    pub fn new(options: SessionOptions) -> Self {
        Self {
            state: State::Idle,
            session: Session::new(Speaker::default()),
            options,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn session_id(&self) -> &str {
        &self.session.id
    }

    /// Apply one event, returning the effects to execute.
    /// Events carrying a stale session id are dropped silently.
    pub fn apply(&mut self, event: Event) -> Vec<Effect> {
        match event {
            Event::StartRequested { speaker } => self.on_start_requested(speaker),
            Event::StopRequested => self.on_stop_requested(),
            Event::Shutdown => Vec::new(),
            Event::CaptureStarted { session_id } => {
                if self.is_stale(&session_id) {
                    return Vec::new();
                }
                self.on_capture_started()
            }
            Event::CaptureFailed { session_id, error } => {
                if self.is_stale(&session_id) {
                    return Vec::new();
                }
                self.on_capture_failed(error)
            }
            Event::FragmentArrived { session_id, bytes } => {
                if self.is_stale(&session_id) {
                    return Vec::new();
                }
                self.on_fragment(bytes)
            }
            Event::PartialFlushed {
                session_id,
                outcome,
            } => {
                if self.is_stale(&session_id) {
                    return Vec::new();
                }
                self.on_partial_flushed(outcome)
            }
            Event::FinalFlushed {
                session_id,
                outcome,
            } => {
                if self.is_stale(&session_id) {
                    return Vec::new();
                }
                self.on_final_flushed(outcome)
            }
        }
    }

    fn is_stale(&self, session_id: &str) -> bool {
        session_id != self.session.id
    }

    fn on_start_requested(&mut self, speaker: Speaker) -> Vec<Effect> {
        if self.state != State::Idle {
            log::warn!(
                "Start ignored: session {} is {:?}",
                self.session.id,
                self.state
            );
            return Vec::new();
        }

        self.session.reset(speaker);
        log::info!(
            "Session {} starting ({})",
            self.session.id,
            speaker.as_str()
        );
        vec![Effect::StartCapture {
            session_id: self.session.id.clone(),
        }]
    }

    fn on_capture_started(&mut self) -> Vec<Effect> {
        if self.state != State::Idle {
            return Vec::new();
        }
        self.state = State::Recording;
        log::info!("Session {} recording", self.session.id);
        vec![Effect::EmitState { recording: true }]
    }

    /// DeviceUnavailable and PermissionDenied both land here: the start
    /// transition aborts and the session stays idle. No state callback
    /// fires because none was emitted for the attempt.
    fn on_capture_failed(&mut self, error: String) -> Vec<Effect> {
        log::error!(
            "Session {} could not start capture: {}",
            self.session.id,
            error
        );
        Vec::new()
    }

    fn on_fragment(&mut self, bytes: Vec<u8>) -> Vec<Effect> {
        if bytes.is_empty() {
            return Vec::new();
        }
        match self.state {
            State::Recording => {
                self.session.chunks.append(bytes);
                self.maybe_flush_partial()
            }
            // The device may deliver a trailing block between the stop
            // signal and the final dispatch; keep it for the final request.
            State::Stopping => {
                self.session.chunks.append(bytes);
                Vec::new()
            }
            State::Idle => Vec::new(),
        }
    }

    /// Partial-flush routine: a no-op while a send is outstanding (the
    /// fragment stays buffered for the next flush or the final). The guard
    /// is cleared by `PartialFlushed` in every case.
    fn maybe_flush_partial(&mut self) -> Vec<Effect> {
        if self.session.send_in_flight || !self.session.chunks.has_pending() {
            return Vec::new();
        }
        self.session.send_in_flight = true;
        let fragments = self.session.chunks.take_pending();
        vec![Effect::SendPartial {
            session_id: self.session.id.clone(),
            speaker: self.session.speaker,
            fragments,
        }]
    }

    fn on_stop_requested(&mut self) -> Vec<Effect> {
        if self.state != State::Recording {
            log::warn!(
                "Stop ignored: session {} is {:?}",
                self.session.id,
                self.state
            );
            return Vec::new();
        }

        self.state = State::Stopping;
        log::info!("Session {} stopping", self.session.id);

        let mut effects = vec![Effect::StopCapture {
            session_id: self.session.id.clone(),
        }];

        if self.session.send_in_flight {
            // The final is dispatched when the outstanding partial resolves.
        } else if self.session.chunks.has_pending() {
            // Drain captured-but-unsent audio before the final request.
            effects.extend(self.maybe_flush_partial());
        } else {
            effects.push(self.begin_final_flush());
        }

        effects
    }

    /// Exactly one final request per session, over the entire history.
    fn begin_final_flush(&mut self) -> Effect {
        let fragments = self.session.chunks.take_full();
        Effect::SendFinal {
            session_id: self.session.id.clone(),
            speaker: self.session.speaker,
            fragments,
        }
    }

    fn on_partial_flushed(&mut self, outcome: FlushOutcome) -> Vec<Effect> {
        self.session.send_in_flight = false;

        let mut effects = Vec::new();
        match outcome {
            FlushOutcome::Transcript(raw) => {
                let lines = normalize(&raw, self.session.speaker);
                if lines.is_empty() {
                    log::debug!("Session {}: empty partial, nothing new", self.session.id);
                } else {
                    let text = lines.join("\n");
                    if self.options.suppress_duplicate_partials
                        && self.session.last_partial.as_deref() == Some(text.as_str())
                    {
                        log::debug!(
                            "Session {}: duplicate partial suppressed",
                            self.session.id
                        );
                    } else {
                        self.session.last_partial = Some(text.clone());
                        effects.push(Effect::EmitPartial { text });
                    }
                }
            }
            FlushOutcome::Failed(err) => {
                // Recoverable: the final flush re-sends the complete audio.
                log::warn!(
                    "Session {}: partial flush failed: {}",
                    self.session.id,
                    err
                );
            }
        }

        if self.state == State::Stopping {
            effects.push(self.begin_final_flush());
        }

        effects
    }

    fn on_final_flushed(&mut self, outcome: FlushOutcome) -> Vec<Effect> {
        if self.state != State::Stopping {
            return Vec::new();
        }

        let mut effects = Vec::new();
        match outcome {
            FlushOutcome::Transcript(raw) => {
                let lines = normalize(&raw, self.session.speaker);
                if lines.is_empty() {
                    log::info!("Session {}: final transcript empty", self.session.id);
                } else {
                    effects.push(Effect::EmitFinal {
                        text: lines.join("\n"),
                    });
                }
            }
            FlushOutcome::Failed(err) => {
                // Swallowed; the teardown below still runs.
                log::error!(
                    "Session {}: final flush failed: {}",
                    self.session.id,
                    err
                );
            }
        }

        // Device release and reset run on every path.
        effects.push(Effect::ReleaseCapture {
            session_id: self.session.id.clone(),
        });
        let speaker = self.session.speaker;
        self.session.reset(speaker);
        self.state = State::Idle;
        effects.push(Effect::EmitState { recording: false });
        effects
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> CaptureSession {
        CaptureSession::new(SessionOptions::default())
    }

    fn machine_with_dedup() -> CaptureSession {
        CaptureSession::new(SessionOptions {
            suppress_duplicate_partials: true,
        })
    }

    /// Start a session and acknowledge the device, returning the session id.
    fn start_session(m: &mut CaptureSession, speaker: Speaker) -> String {
        let effects = m.apply(Event::StartRequested { speaker });
        assert!(matches!(effects.as_slice(), [Effect::StartCapture { .. }]));
        let id = m.session_id().to_string();
        let effects = m.apply(Event::CaptureStarted {
            session_id: id.clone(),
        });
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::EmitState { recording: true })));
        assert_eq!(m.state(), State::Recording);
        id
    }

    fn fragment(id: &str, bytes: &[u8]) -> Event {
        Event::FragmentArrived {
            session_id: id.to_string(),
            bytes: bytes.to_vec(),
        }
    }

    fn partial_ok(id: &str, text: &str) -> Event {
        Event::PartialFlushed {
            session_id: id.to_string(),
            outcome: FlushOutcome::Transcript(text.to_string()),
        }
    }

    fn final_ok(id: &str, text: &str) -> Event {
        Event::FinalFlushed {
            session_id: id.to_string(),
            outcome: FlushOutcome::Transcript(text.to_string()),
        }
    }

    #[test]
    fn start_from_idle_requests_capture() {
        let mut m = machine();
        let effects = m.apply(Event::StartRequested {
            speaker: Speaker::Clinician,
        });
        assert!(matches!(effects.as_slice(), [Effect::StartCapture { .. }]));
        // Device not acknowledged yet
        assert_eq!(m.state(), State::Idle);
    }

    #[test]
    fn capture_failure_leaves_session_idle() {
        let mut m = machine();
        m.apply(Event::StartRequested {
            speaker: Speaker::Clinician,
        });
        let id = m.session_id().to_string();
        let effects = m.apply(Event::CaptureFailed {
            session_id: id,
            error: "Microphone access denied".to_string(),
        });
        assert!(effects.is_empty());
        assert_eq!(m.state(), State::Idle);
    }

    #[test]
    fn stale_events_are_dropped() {
        let mut m = machine();
        let id = start_session(&mut m, Speaker::Clinician);

        let effects = m.apply(fragment("some-old-session", &[1, 2]));
        assert!(effects.is_empty());

        let effects = m.apply(partial_ok("some-old-session", "texto viejo"));
        assert!(effects.is_empty());

        // The live session is unaffected
        assert_eq!(m.state(), State::Recording);
        assert_eq!(m.session_id(), id);
    }

    #[test]
    fn first_fragment_triggers_partial_flush() {
        let mut m = machine();
        let id = start_session(&mut m, Speaker::Patient);

        let effects = m.apply(fragment(&id, b"Me due"));
        match effects.as_slice() {
            [Effect::SendPartial {
                fragments, speaker, ..
            }] => {
                assert_eq!(fragments, &vec![b"Me due".to_vec()]);
                assert_eq!(*speaker, Speaker::Patient);
            }
            other => panic!("expected SendPartial, got {:?}", other),
        }
    }

    #[test]
    fn fragment_while_send_in_flight_is_buffered_not_sent() {
        let mut m = machine();
        let id = start_session(&mut m, Speaker::Patient);

        // First fragment dispatches a flush; second arrives mid-flight
        assert_eq!(m.apply(fragment(&id, b"Me due")).len(), 1);
        let effects = m.apply(fragment(&id, b"le la espalda."));
        assert!(effects.is_empty(), "no overlapping sends allowed");

        // Flush resolves: guard clears, no automatic retrigger
        let effects = m.apply(partial_ok(&id, "Me duele"));
        assert!(effects
            .iter()
            .all(|e| !matches!(e, Effect::SendPartial { .. })));

        // The buffered fragment goes out on the next trigger
        let effects = m.apply(fragment(&id, b" mucho"));
        match effects.as_slice() {
            [Effect::SendPartial { fragments, .. }] => {
                assert_eq!(
                    fragments,
                    &vec![b"le la espalda.".to_vec(), b" mucho".to_vec()]
                );
            }
            other => panic!("expected SendPartial, got {:?}", other),
        }
    }

    #[test]
    fn empty_fragment_is_ignored() {
        let mut m = machine();
        let id = start_session(&mut m, Speaker::Clinician);
        assert!(m.apply(fragment(&id, b"")).is_empty());
    }

    #[test]
    fn partial_result_is_normalized_and_emitted() {
        let mut m = machine();
        let id = start_session(&mut m, Speaker::Clinician);
        m.apply(fragment(&id, b"audio"));

        let effects = m.apply(partial_ok(&id, "Dolor lumbar. Revision en 3 dias"));
        match effects.as_slice() {
            [Effect::EmitPartial { text }] => {
                assert_eq!(text, "Médico: Dolor lumbar.\nMédico: Revision en 3 dias");
            }
            other => panic!("expected EmitPartial, got {:?}", other),
        }
    }

    #[test]
    fn empty_partial_result_emits_nothing() {
        let mut m = machine();
        let id = start_session(&mut m, Speaker::Clinician);
        m.apply(fragment(&id, b"audio"));

        let effects = m.apply(partial_ok(&id, "   "));
        assert!(effects.is_empty());
    }

    #[test]
    fn failed_partial_is_swallowed_and_recording_continues() {
        let mut m = machine();
        let id = start_session(&mut m, Speaker::Clinician);
        m.apply(fragment(&id, b"audio"));

        let effects = m.apply(Event::PartialFlushed {
            session_id: id.clone(),
            outcome: FlushOutcome::Failed("Transport error: refused".to_string()),
        });
        assert!(effects.is_empty());
        assert_eq!(m.state(), State::Recording);

        // Guard cleared: the next fragment can flush again
        let effects = m.apply(fragment(&id, b"mas audio"));
        assert!(matches!(effects.as_slice(), [Effect::SendPartial { .. }]));
    }

    #[test]
    fn duplicate_partials_pass_through_by_default() {
        let mut m = machine();
        let id = start_session(&mut m, Speaker::Clinician);

        m.apply(fragment(&id, b"a"));
        let first = m.apply(partial_ok(&id, "Dolor lumbar."));
        m.apply(fragment(&id, b"b"));
        let second = m.apply(partial_ok(&id, "Dolor lumbar."));

        assert!(matches!(first.as_slice(), [Effect::EmitPartial { .. }]));
        assert!(matches!(second.as_slice(), [Effect::EmitPartial { .. }]));
    }

    #[test]
    fn duplicate_partials_suppressed_when_enabled() {
        let mut m = machine_with_dedup();
        let id = start_session(&mut m, Speaker::Clinician);

        m.apply(fragment(&id, b"a"));
        let first = m.apply(partial_ok(&id, "Dolor lumbar."));
        m.apply(fragment(&id, b"b"));
        let second = m.apply(partial_ok(&id, "Dolor lumbar."));
        m.apply(fragment(&id, b"c"));
        let third = m.apply(partial_ok(&id, "Otra cosa."));

        assert!(matches!(first.as_slice(), [Effect::EmitPartial { .. }]));
        assert!(second.is_empty(), "identical partial must be suppressed");
        assert!(matches!(third.as_slice(), [Effect::EmitPartial { .. }]));
    }

    #[test]
    fn stop_without_pending_dispatches_final_immediately() {
        let mut m = machine();
        let id = start_session(&mut m, Speaker::Clinician);
        m.apply(fragment(&id, b"uno"));
        m.apply(partial_ok(&id, "uno"));

        let effects = m.apply(Event::StopRequested);
        assert!(matches!(effects[0], Effect::StopCapture { .. }));
        match &effects[1] {
            Effect::SendFinal { fragments, .. } => {
                assert_eq!(fragments, &vec![b"uno".to_vec()]);
            }
            other => panic!("expected SendFinal, got {:?}", other),
        }
        assert_eq!(m.state(), State::Stopping);
    }

    #[test]
    fn stop_with_pending_drains_before_final() {
        let mut m = machine();
        let id = start_session(&mut m, Speaker::Clinician);
        m.apply(fragment(&id, b"uno"));
        m.apply(partial_ok(&id, "uno"));
        // Buffered but unsent (no trigger since last flush resolved before it)
        m.apply(fragment(&id, b"dos"));
        m.apply(fragment(&id, b"tres"));
        // "dos" triggered a flush; "tres" arrived mid-flight
        m.apply(partial_ok(&id, "dos"));

        let effects = m.apply(Event::StopRequested);
        assert!(matches!(effects[0], Effect::StopCapture { .. }));
        match &effects[1] {
            Effect::SendPartial { fragments, .. } => {
                assert_eq!(fragments, &vec![b"tres".to_vec()]);
            }
            other => panic!("expected draining SendPartial, got {:?}", other),
        }

        // Drain resolves: now the final goes out over the entire history
        let effects = m.apply(partial_ok(&id, "tres"));
        let send_final = effects
            .iter()
            .find_map(|e| match e {
                Effect::SendFinal { fragments, .. } => Some(fragments.clone()),
                _ => None,
            })
            .expect("final must follow the drain");
        assert_eq!(
            send_final,
            vec![b"uno".to_vec(), b"dos".to_vec(), b"tres".to_vec()]
        );
    }

    #[test]
    fn stop_waits_for_in_flight_partial_before_final() {
        let mut m = machine();
        let id = start_session(&mut m, Speaker::Clinician);
        m.apply(fragment(&id, b"uno"));

        // Flush for "uno" still outstanding
        let effects = m.apply(Event::StopRequested);
        assert_eq!(effects.len(), 1, "only StopCapture until the send resolves");
        assert!(matches!(effects[0], Effect::StopCapture { .. }));

        let effects = m.apply(partial_ok(&id, "uno"));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::SendFinal { .. })));
    }

    #[test]
    fn final_request_carries_every_fragment_in_arrival_order() {
        let mut m = machine();
        let id = start_session(&mut m, Speaker::Patient);

        let sent: Vec<Vec<u8>> = vec![b"f1".to_vec(), b"f2".to_vec(), b"f3".to_vec()];
        m.apply(fragment(&id, &sent[0]));
        m.apply(partial_ok(&id, "f1"));
        m.apply(fragment(&id, &sent[1]));
        m.apply(partial_ok(&id, "f2"));
        m.apply(fragment(&id, &sent[2]));
        m.apply(partial_ok(&id, "f3"));

        let effects = m.apply(Event::StopRequested);
        let final_fragments = effects
            .iter()
            .find_map(|e| match e {
                Effect::SendFinal { fragments, .. } => Some(fragments.clone()),
                _ => None,
            })
            .expect("final dispatched on stop");
        assert_eq!(final_fragments, sent);
        assert_eq!(final_fragments.concat(), b"f1f2f3".to_vec());
    }

    #[test]
    fn final_result_emits_transcript_then_releases_and_resets() {
        let mut m = machine();
        let id = start_session(&mut m, Speaker::Clinician);
        m.apply(fragment(&id, b"uno"));
        m.apply(partial_ok(&id, "uno"));
        m.apply(Event::StopRequested);

        let effects = m.apply(final_ok(&id, "Dolor lumbar. Revision en 3 dias"));
        assert!(matches!(&effects[0], Effect::EmitFinal { text }
            if text == "Médico: Dolor lumbar.\nMédico: Revision en 3 dias"));
        assert!(matches!(effects[1], Effect::ReleaseCapture { .. }));
        assert!(matches!(
            effects[2],
            Effect::EmitState { recording: false }
        ));
        assert_eq!(m.state(), State::Idle);
        assert_ne!(m.session_id(), id, "fresh identifier for the next session");
    }

    #[test]
    fn stop_with_zero_fragments_still_issues_final_and_releases() {
        let mut m = machine();
        let id = start_session(&mut m, Speaker::Clinician);

        let effects = m.apply(Event::StopRequested);
        match &effects[1] {
            Effect::SendFinal { fragments, .. } => assert!(fragments.is_empty()),
            other => panic!("expected SendFinal, got {:?}", other),
        }

        // Empty result: no EmitFinal, but teardown runs
        let effects = m.apply(final_ok(&id, ""));
        assert!(effects
            .iter()
            .all(|e| !matches!(e, Effect::EmitFinal { .. })));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::ReleaseCapture { .. })));
        assert_eq!(m.state(), State::Idle);
    }

    #[test]
    fn final_failure_still_releases_and_resets() {
        let mut m = machine();
        let id = start_session(&mut m, Speaker::Clinician);
        m.apply(fragment(&id, b"uno"));
        m.apply(partial_ok(&id, "uno"));
        m.apply(Event::StopRequested);

        let effects = m.apply(Event::FinalFlushed {
            session_id: id,
            outcome: FlushOutcome::Failed("Transcription service error (500)".to_string()),
        });
        assert!(effects
            .iter()
            .all(|e| !matches!(e, Effect::EmitFinal { .. })));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::ReleaseCapture { .. })));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::EmitState { recording: false })));
        assert_eq!(m.state(), State::Idle);
    }

    #[test]
    fn fragment_during_stopping_joins_the_final_request() {
        let mut m = machine();
        let id = start_session(&mut m, Speaker::Clinician);
        m.apply(fragment(&id, b"uno"));

        // Stop while the flush for "uno" is outstanding
        m.apply(Event::StopRequested);
        // A trailing block arrives before the final is dispatched
        m.apply(fragment(&id, b"cola"));

        let effects = m.apply(partial_ok(&id, "uno"));
        let final_fragments = effects
            .iter()
            .find_map(|e| match e {
                Effect::SendFinal { fragments, .. } => Some(fragments.clone()),
                _ => None,
            })
            .expect("final dispatched after in-flight partial resolved");
        assert_eq!(final_fragments, vec![b"uno".to_vec(), b"cola".to_vec()]);
    }

    #[test]
    fn stop_in_idle_and_start_while_recording_are_ignored() {
        let mut m = machine();
        assert!(m.apply(Event::StopRequested).is_empty());

        let _id = start_session(&mut m, Speaker::Clinician);
        let effects = m.apply(Event::StartRequested {
            speaker: Speaker::Patient,
        });
        assert!(effects.is_empty());
        assert_eq!(m.state(), State::Recording);
    }
}
