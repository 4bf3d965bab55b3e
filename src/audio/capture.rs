//! Audio capture using CPAL
//!
//! Captures from the default input device, converts samples to i16 mono and
//! delivers raw PCM16LE fragments into the session event loop at a fixed
//! cadence. The capture callback never blocks: fragments are handed over
//! with `try_send` and dropped (with a warning) if the loop is backed up.
//!
//! The CPAL stream is not `Send`, so a dedicated thread owns it. `stop()`
//! ceases fragment delivery; dropping the handle ends the thread, which
//! releases the device.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig};
use tokio::sync::mpsc;

use crate::state_machine::Event;

/// Errors that can occur while starting audio capture. All of them abort
/// the start transition; the session stays idle.
#[derive(Debug, Clone)]
pub enum CaptureError {
    /// The platform offers no capture device.
    DeviceUnavailable,
    /// The user (or OS) declined microphone access.
    PermissionDenied,
    /// The device exposes no usable input configuration.
    NoSupportedConfig,
    /// The input stream could not be created or started.
    StreamFailed(String),
}

impl std::fmt::Display for CaptureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureError::DeviceUnavailable => write!(f, "No audio input device found"),
            CaptureError::PermissionDenied => write!(f, "Microphone access denied"),
            CaptureError::NoSupportedConfig => write!(f, "No supported audio configuration"),
            CaptureError::StreamFailed(e) => write!(f, "Failed to start audio stream: {}", e),
        }
    }
}

impl std::error::Error for CaptureError {}

/// Handle to an active capture.
///
/// `stop()` ceases fragment delivery while keeping the device acquired;
/// dropping the handle closes the release channel, letting the capture
/// thread drop the stream and give the device back.
pub struct CaptureHandle {
    _release: std::sync::mpsc::Sender<()>,
    is_capturing: Arc<AtomicBool>,
    sample_rate: u32,
}

impl CaptureHandle {
    /// Signal the device to cease fragment delivery. Hardware resources are
    /// kept until the handle is dropped.
    pub fn stop(&self) {
        self.is_capturing.store(false, Ordering::SeqCst);
        log::info!("Capture ceased, device held until session teardown");
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Acquire the default input device and start delivering fragments of
/// `fragment_interval_ms` worth of audio as `FragmentArrived` events.
///
/// Blocks while the device is opened; run it off the event loop
/// (`spawn_blocking`).
pub fn start(
    session_id: String,
    events: mpsc::Sender<Event>,
    fragment_interval_ms: u64,
) -> Result<CaptureHandle, CaptureError> {
    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<u32, CaptureError>>();
    let is_capturing = Arc::new(AtomicBool::new(true));
    let flag = is_capturing.clone();

    std::thread::spawn(move || {
        capture_thread(
            session_id,
            events,
            fragment_interval_ms,
            flag,
            release_rx,
            ready_tx,
        );
    });

    match ready_rx.recv() {
        Ok(Ok(sample_rate)) => Ok(CaptureHandle {
            _release: release_tx,
            is_capturing,
            sample_rate,
        }),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(CaptureError::StreamFailed(
            "capture thread exited before startup".to_string(),
        )),
    }
}

/// Owns the CPAL stream for the lifetime of one session.
fn capture_thread(
    session_id: String,
    events: mpsc::Sender<Event>,
    fragment_interval_ms: u64,
    is_capturing: Arc<AtomicBool>,
    release_rx: std::sync::mpsc::Receiver<()>,
    ready_tx: std::sync::mpsc::Sender<Result<u32, CaptureError>>,
) {
    let stream = match open_stream(session_id, events, fragment_interval_ms, is_capturing) {
        Ok((stream, sample_rate)) => {
            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(classify_play_error(e)));
                return;
            }
            let _ = ready_tx.send(Ok(sample_rate));
            stream
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    // Park until every handle is gone, then drop the stream.
    let _ = release_rx.recv();
    drop(stream);
    log::debug!("Capture thread released the device");
}

fn open_stream(
    session_id: String,
    events: mpsc::Sender<Event>,
    fragment_interval_ms: u64,
    is_capturing: Arc<AtomicBool>,
) -> Result<(Stream, u32), CaptureError> {
    let host = cpal::default_host();

    let device = host
        .default_input_device()
        .ok_or(CaptureError::DeviceUnavailable)?;

    log::info!("Using audio input device: {:?}", device.name());

    let supported_config = device.default_input_config().map_err(|e| match e {
        cpal::DefaultStreamConfigError::DeviceNotAvailable => CaptureError::DeviceUnavailable,
        _ => CaptureError::NoSupportedConfig,
    })?;

    log::info!(
        "Audio config: {} Hz, {} channels, {:?}",
        supported_config.sample_rate().0,
        supported_config.channels(),
        supported_config.sample_format()
    );

    let sample_format = supported_config.sample_format();
    let config: StreamConfig = supported_config.into();
    let sample_rate = config.sample_rate.0;
    if config.channels == 0 {
        return Err(CaptureError::NoSupportedConfig);
    }

    let fragment_bytes = fragment_byte_len(sample_rate, fragment_interval_ms);

    let stream = match sample_format {
        SampleFormat::I16 => build_stream_typed::<i16>(
            &device,
            &config,
            session_id,
            events,
            is_capturing,
            fragment_bytes,
        ),
        SampleFormat::U16 => build_stream_typed::<u16>(
            &device,
            &config,
            session_id,
            events,
            is_capturing,
            fragment_bytes,
        ),
        SampleFormat::F32 => build_stream_typed::<f32>(
            &device,
            &config,
            session_id,
            events,
            is_capturing,
            fragment_bytes,
        ),
        _ => Err(CaptureError::NoSupportedConfig),
    }?;

    Ok((stream, sample_rate))
}

/// Bytes of mono PCM16 per fragment at the given cadence.
fn fragment_byte_len(sample_rate: u32, fragment_interval_ms: u64) -> usize {
    let samples = (sample_rate as u64 * fragment_interval_ms / 1000).max(1);
    (samples * 2) as usize
}

fn build_stream_typed<T>(
    device: &Device,
    config: &StreamConfig,
    session_id: String,
    events: mpsc::Sender<Event>,
    is_capturing: Arc<AtomicBool>,
    fragment_bytes: usize,
) -> Result<Stream, CaptureError>
where
    T: cpal::Sample + cpal::SizedSample + Send + 'static,
    f32: cpal::FromSample<T>,
{
    let channels = config.channels as usize;
    let mut accumulator: Vec<u8> = Vec::with_capacity(fragment_bytes);
    let err_fn = |err| log::error!("Audio stream error: {}", err);

    let stream = device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                if !is_capturing.load(Ordering::SeqCst) {
                    return;
                }

                for frame in data.chunks(channels) {
                    // Downmix to mono, then convert to i16 for the wire
                    let mono: f32 = frame
                        .iter()
                        .map(|&s| {
                            let sample_f32: f32 = cpal::Sample::from_sample(s);
                            sample_f32
                        })
                        .sum::<f32>()
                        / frame.len() as f32;
                    accumulator.extend_from_slice(&float_to_i16(mono).to_le_bytes());

                    if accumulator.len() >= fragment_bytes {
                        let bytes = std::mem::take(&mut accumulator);
                        let delivered = events.try_send(Event::FragmentArrived {
                            session_id: session_id.clone(),
                            bytes,
                        });
                        if delivered.is_err() {
                            log::warn!("Fragment dropped: event queue full or closed");
                        }
                    }
                }
            },
            err_fn,
            None,
        )
        .map_err(classify_build_error)?;

    Ok(stream)
}

/// Convert a float sample to i16 with clamping.
fn float_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

fn classify_build_error(e: cpal::BuildStreamError) -> CaptureError {
    match e {
        cpal::BuildStreamError::DeviceNotAvailable => CaptureError::DeviceUnavailable,
        other => classify_message(&other.to_string()),
    }
}

fn classify_play_error(e: cpal::PlayStreamError) -> CaptureError {
    match e {
        cpal::PlayStreamError::DeviceNotAvailable => CaptureError::DeviceUnavailable,
        other => classify_message(&other.to_string()),
    }
}

/// CPAL reports a declined microphone as a backend-specific error; classify
/// by message so the session surfaces `PermissionDenied` distinctly.
fn classify_message(message: &str) -> CaptureError {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("authoriz") {
        CaptureError::PermissionDenied
    } else {
        CaptureError::StreamFailed(message.to_string())
    }
}
