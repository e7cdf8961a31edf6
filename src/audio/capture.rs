//! Microphone capture using CPAL
//!
//! `MicrophoneCapture` opens the input device when a session starts and
//! pushes one `AudioFrame` per device callback into a bounded channel.
//! The callback never blocks: if the consumer falls behind, frames are
//! dropped and counted.
//!
//! The CPAL stream lives on a dedicated thread so that the returned
//! `CaptureHandle` is `Send` and can be owned by async tasks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Sample, SampleFormat, Stream, StreamConfig};
use thiserror::Error;
use tokio::sync::mpsc;

/// How long `start()` waits for the audio thread to report the stream state
const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

/// One device buffer of captured audio
///
/// Samples are interleaved f32 in `[-1.0, 1.0]`.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFrame {
    /// Duration of this frame in milliseconds
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 || self.channels == 0 {
            return 0;
        }
        let frames = self.samples.len() as u64 / self.channels as u64;
        frames * 1000 / self.sample_rate as u64
    }
}

/// Errors that can occur while acquiring the microphone
#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    /// The OS or the user refused access, or no device is available
    #[error("Microphone unavailable: {0}")]
    PermissionDenied(String),
    #[error("No supported audio input configuration")]
    NoSupportedConfig,
    #[error("Failed to create audio input stream: {0}")]
    StreamCreationFailed(String),
}

/// Source of live microphone frames
pub trait CaptureSource: Send + Sync + 'static {
    /// Acquire the device and start emitting frames into `frames`
    ///
    /// May block briefly while the device opens; call from a blocking context.
    fn start(&self, frames: mpsc::Sender<AudioFrame>) -> Result<CaptureHandle, CaptureError>;
}

/// Owns a running capture; stopping releases the device
///
/// `stop()` is idempotent and also runs on drop.
pub struct CaptureHandle {
    stop_fn: Option<Box<dyn FnOnce() + Send>>,
}

impl CaptureHandle {
    pub fn new(stop_fn: impl FnOnce() + Send + 'static) -> Self {
        Self {
            stop_fn: Some(Box::new(stop_fn)),
        }
    }

    /// Handle that owns nothing (for sources without a device)
    pub fn detached() -> Self {
        Self { stop_fn: None }
    }

    pub fn stop(&mut self) {
        if let Some(stop) = self.stop_fn.take() {
            stop();
        }
    }

    pub fn is_running(&self) -> bool {
        self.stop_fn.is_some()
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for CaptureHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureHandle")
            .field("running", &self.is_running())
            .finish()
    }
}

/// CPAL-backed capture from the default (or a named) input device
#[derive(Debug, Clone, Default)]
pub struct MicrophoneCapture {
    device_name: Option<String>,
}

impl MicrophoneCapture {
    pub fn new(device_name: Option<String>) -> Self {
        Self { device_name }
    }
}

impl CaptureSource for MicrophoneCapture {
    fn start(&self, frames: mpsc::Sender<AudioFrame>) -> Result<CaptureHandle, CaptureError> {
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<(), CaptureError>>(1);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let device_name = self.device_name.clone();

        let thread = std::thread::Builder::new()
            .name("parla-capture".to_string())
            .spawn(move || run_capture_thread(device_name, frames, ready_tx, stop_rx))
            .map_err(|e| CaptureError::StreamCreationFailed(e.to_string()))?;

        match ready_rx.recv_timeout(STARTUP_TIMEOUT) {
            Ok(Ok(())) => Ok(CaptureHandle::new(move || stop_capture_thread(stop_tx, thread))),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = stop_tx.send(());
                Err(CaptureError::StreamCreationFailed(
                    "Audio input did not start in time".to_string(),
                ))
            }
        }
    }
}

fn stop_capture_thread(stop_tx: std_mpsc::Sender<()>, thread: JoinHandle<()>) {
    let _ = stop_tx.send(());
    if thread.join().is_err() {
        log::error!("Capture thread panicked");
    }
    log::info!("Microphone released");
}

/// Body of the dedicated audio thread: build, play, then park until stopped
fn run_capture_thread(
    device_name: Option<String>,
    frames: mpsc::Sender<AudioFrame>,
    ready_tx: std_mpsc::SyncSender<Result<(), CaptureError>>,
    stop_rx: std_mpsc::Receiver<()>,
) {
    let dropped = Arc::new(AtomicU64::new(0));

    let stream = match open_input_stream(device_name.as_deref(), frames, dropped.clone()) {
        Ok(stream) => stream,
        Err(e) => {
            log::error!("Failed to open microphone: {}", e);
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(CaptureError::StreamCreationFailed(format!(
            "Failed to start stream: {}",
            e
        ))));
        return;
    }

    let _ = ready_tx.send(Ok(()));

    // Blocks until stop() sends or the handle is dropped
    let _ = stop_rx.recv();
    drop(stream);

    let dropped = dropped.load(Ordering::Relaxed);
    if dropped > 0 {
        log::warn!("Capture: {} frames dropped under backpressure", dropped);
    }
}

fn select_input_device(host: &cpal::Host, name: Option<&str>) -> Result<Device, CaptureError> {
    if let Some(wanted) = name {
        let devices = host
            .input_devices()
            .map_err(|e| CaptureError::PermissionDenied(e.to_string()))?;
        for device in devices {
            if device.name().map(|n| n == wanted).unwrap_or(false) {
                return Ok(device);
            }
        }
        log::warn!("Input device '{}' not found, using default", wanted);
    }

    host.default_input_device()
        .ok_or_else(|| CaptureError::PermissionDenied("no audio input device available".to_string()))
}

fn open_input_stream(
    device_name: Option<&str>,
    frames: mpsc::Sender<AudioFrame>,
    dropped: Arc<AtomicU64>,
) -> Result<Stream, CaptureError> {
    let host = cpal::default_host();
    let device = select_input_device(&host, device_name)?;

    log::info!("Using audio input device: {:?}", device.name());

    let supported_config = device.default_input_config().map_err(|e| match e {
        cpal::DefaultStreamConfigError::DeviceNotAvailable => {
            CaptureError::PermissionDenied("input device not available".to_string())
        }
        _ => CaptureError::NoSupportedConfig,
    })?;

    log::info!(
        "Audio input config: {} Hz, {} channels, {:?}",
        supported_config.sample_rate().0,
        supported_config.channels(),
        supported_config.sample_format()
    );

    let sample_format = supported_config.sample_format();
    let config: StreamConfig = supported_config.into();

    match sample_format {
        SampleFormat::I16 => build_stream_typed::<i16>(&device, &config, frames, dropped),
        SampleFormat::U16 => build_stream_typed::<u16>(&device, &config, frames, dropped),
        SampleFormat::F32 => build_stream_typed::<f32>(&device, &config, frames, dropped),
        _ => Err(CaptureError::NoSupportedConfig),
    }
}

fn build_stream_typed<T>(
    device: &Device,
    config: &StreamConfig,
    frames: mpsc::Sender<AudioFrame>,
    dropped: Arc<AtomicU64>,
) -> Result<Stream, CaptureError>
where
    T: cpal::SizedSample + Send + 'static,
    f32: cpal::FromSample<T>,
{
    let sample_rate = config.sample_rate.0;
    let channels = config.channels;
    let err_fn = |err| log::error!("Audio input stream error: {}", err);

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let frame = AudioFrame {
                    samples: data.iter().map(|&s| f32::from_sample(s)).collect(),
                    sample_rate,
                    channels,
                };
                if frames.try_send(frame).is_err() {
                    dropped.fetch_add(1, Ordering::Relaxed);
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => {
                CaptureError::PermissionDenied("input device not available".to_string())
            }
            other => CaptureError::StreamCreationFailed(other.to_string()),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_frame_duration() {
        let frame = AudioFrame {
            samples: vec![0.0; 4800 * 2],
            sample_rate: 48_000,
            channels: 2,
        };
        assert_eq!(frame.duration_ms(), 100);

        let empty = AudioFrame {
            samples: Vec::new(),
            sample_rate: 0,
            channels: 1,
        };
        assert_eq!(empty.duration_ms(), 0);
    }

    #[test]
    fn test_handle_stop_is_idempotent() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut handle = CaptureHandle::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(handle.is_running());
        handle.stop();
        handle.stop();
        assert!(!handle.is_running());
        drop(handle);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handle_drop_stops() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        drop(CaptureHandle::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_detached_handle_stop_is_noop() {
        let mut handle = CaptureHandle::detached();
        handle.stop();
        assert!(!handle.is_running());
    }

    #[test]
    fn test_permission_denied_message() {
        let err = CaptureError::PermissionDenied("no audio input device available".to_string());
        assert!(err.to_string().contains("Microphone unavailable"));
    }
}
