//! Speaker output with a sample-accurate clock
//!
//! The output callback mixes scheduled voices into the device buffer and
//! advances a frame counter; that counter is the playback clock the
//! scheduler reads. Voices are placed by start frame, so back-to-back
//! buffers are contiguous on the device timeline regardless of when they
//! arrived.
//!
//! The stream runs on its own thread (CPAL streams are not `Send`). The
//! only state shared with the callback is the mixer behind one mutex.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleRate, Stream, StreamConfig};
use thiserror::Error;
use tokio::sync::mpsc;

use super::encoder::{downmix, resample};
use super::playback::{BufferId, DecodedAudio, PlaybackSink, OUTPUT_SAMPLE_RATE};

const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Error)]
pub enum OutputError {
    #[error("No audio output device available")]
    NoOutputDevice,
    #[error("No supported audio output configuration")]
    NoSupportedConfig,
    #[error("Failed to create audio output stream: {0}")]
    StreamCreationFailed(String),
}

/// Factory for a playback sink bound to a real (or fake) output device
pub trait AudioOutput: Send + Sync + 'static {
    /// Acquire the output device; finished buffers are reported on `ended`
    ///
    /// May block briefly while the device opens; call from a blocking context.
    fn open(&self, ended: mpsc::UnboundedSender<BufferId>) -> Result<Box<dyn PlaybackSink>, OutputError>;
}

/// One scheduled buffer inside the mixer, already at device rate, mono
struct Voice {
    id: BufferId,
    start_frame: u64,
    samples: Vec<f32>,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

#[derive(Default)]
struct Mixer {
    voices: Vec<Voice>,
    /// End frame of the most recently scheduled voice
    tail_frame: u64,
}

/// State shared between the sink handle and the audio callback
struct SharedClock {
    mixer: Mutex<Mixer>,
    frames_rendered: AtomicU64,
    sample_rate: u32,
}

impl SharedClock {
    fn mixer(&self) -> MutexGuard<'_, Mixer> {
        self.mixer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn now(&self) -> f64 {
        self.frames_rendered.load(Ordering::Acquire) as f64 / self.sample_rate as f64
    }

    /// Mix scheduled voices into `data` and advance the clock
    fn render(&self, data: &mut [f32], channels: usize, ended: &mpsc::UnboundedSender<BufferId>) {
        data.fill(0.0);
        let frames = (data.len() / channels.max(1)) as u64;
        let base = self.frames_rendered.load(Ordering::Acquire);
        let window_end = base + frames;

        let mut mixer = self.mixer();
        for voice in mixer.voices.iter() {
            let from = voice.start_frame.max(base);
            let to = voice.end_frame().min(window_end);
            for frame in from..to {
                let sample = voice.samples[(frame - voice.start_frame) as usize];
                let offset = (frame - base) as usize * channels;
                for out in &mut data[offset..offset + channels] {
                    *out += sample;
                }
            }
        }

        mixer.voices.retain(|voice| {
            if voice.end_frame() <= window_end {
                let _ = ended.send(voice.id);
                false
            } else {
                true
            }
        });
        // Advance under the lock so `schedule` never sees a stale position
        self.frames_rendered.store(window_end, Ordering::Release);
        drop(mixer);

        for out in data.iter_mut() {
            *out = out.clamp(-1.0, 1.0);
        }
    }
}

/// Sink handle for an open output device
pub struct SpeakerSink {
    shared: Arc<SharedClock>,
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl PlaybackSink for SpeakerSink {
    fn now(&self) -> f64 {
        self.shared.now()
    }

    fn schedule(&self, id: BufferId, audio: DecodedAudio, start_at: f64) -> f64 {
        let mono = downmix(&audio.samples, audio.channels);
        let samples = resample(&mono, audio.sample_rate, self.shared.sample_rate);
        let requested = (start_at * self.shared.sample_rate as f64).round() as u64;

        let mut mixer = self.shared.mixer();
        let rendered = self.shared.frames_rendered.load(Ordering::Acquire);
        // Within a frame of the previous tail is a continuation; rounding
        // must not open a gap or an overlap between them
        let aligned = if requested.abs_diff(mixer.tail_frame) <= 1 {
            mixer.tail_frame
        } else {
            requested
        };
        // A start that already passed plays from the next rendered frame
        let start_frame = aligned.max(rendered);
        mixer.tail_frame = start_frame + samples.len() as u64;
        mixer.voices.push(Voice {
            id,
            start_frame,
            samples,
        });

        start_frame as f64 / self.shared.sample_rate as f64
    }

    fn cancel(&self, id: BufferId) {
        let mut mixer = self.shared.mixer();
        mixer.voices.retain(|v| v.id != id);
        mixer.tail_frame = mixer.voices.iter().map(Voice::end_frame).max().unwrap_or(0);
    }
}

impl Drop for SpeakerSink {
    fn drop(&mut self) {
        self.shared.mixer().voices.clear();
        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Playback thread panicked");
            }
        }
        log::info!("Speaker released");
    }
}

/// CPAL-backed output on the default (or a named) device
#[derive(Debug, Clone, Default)]
pub struct SpeakerOutput {
    device_name: Option<String>,
}

impl SpeakerOutput {
    pub fn new(device_name: Option<String>) -> Self {
        Self { device_name }
    }
}

impl AudioOutput for SpeakerOutput {
    fn open(&self, ended: mpsc::UnboundedSender<BufferId>) -> Result<Box<dyn PlaybackSink>, OutputError> {
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<Arc<SharedClock>, OutputError>>(1);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let device_name = self.device_name.clone();

        let thread = std::thread::Builder::new()
            .name("parla-playback".to_string())
            .spawn(move || run_output_thread(device_name, ended, ready_tx, stop_rx))
            .map_err(|e| OutputError::StreamCreationFailed(e.to_string()))?;

        match ready_rx.recv_timeout(STARTUP_TIMEOUT) {
            Ok(Ok(shared)) => Ok(Box::new(SpeakerSink {
                shared,
                stop_tx: Some(stop_tx),
                thread: Some(thread),
            })),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = stop_tx.send(());
                Err(OutputError::StreamCreationFailed(
                    "Audio output did not start in time".to_string(),
                ))
            }
        }
    }
}

fn run_output_thread(
    device_name: Option<String>,
    ended: mpsc::UnboundedSender<BufferId>,
    ready_tx: std_mpsc::SyncSender<Result<Arc<SharedClock>, OutputError>>,
    stop_rx: std_mpsc::Receiver<()>,
) {
    let (stream, shared) = match open_output_stream(device_name.as_deref(), ended) {
        Ok(pair) => pair,
        Err(e) => {
            log::error!("Failed to open speaker: {}", e);
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(OutputError::StreamCreationFailed(format!(
            "Failed to start stream: {}",
            e
        ))));
        return;
    }

    let _ = ready_tx.send(Ok(shared));
    let _ = stop_rx.recv();
    drop(stream);
}

fn select_output_device(host: &cpal::Host, name: Option<&str>) -> Result<Device, OutputError> {
    if let Some(wanted) = name {
        if let Ok(devices) = host.output_devices() {
            for device in devices {
                if device.name().map(|n| n == wanted).unwrap_or(false) {
                    return Ok(device);
                }
            }
        }
        log::warn!("Output device '{}' not found, using default", wanted);
    }
    host.default_output_device().ok_or(OutputError::NoOutputDevice)
}

/// Prefer a native 24 kHz f32 config (mono, then stereo); otherwise take
/// the device default and resample on schedule
fn select_output_config(device: &Device) -> Result<StreamConfig, OutputError> {
    let target = SampleRate(OUTPUT_SAMPLE_RATE);
    let native = device.supported_output_configs().ok().and_then(|configs| {
        let mut candidates: Vec<_> = configs
            .filter(|c| {
                c.sample_format() == cpal::SampleFormat::F32
                    && c.min_sample_rate() <= target
                    && c.max_sample_rate() >= target
                    && c.channels() <= 2
            })
            .collect();
        candidates.sort_by_key(|c| c.channels());
        candidates.into_iter().next()
    });

    if let Some(config) = native {
        return Ok(config.with_sample_rate(target).config());
    }

    let fallback = device
        .default_output_config()
        .map_err(|_| OutputError::NoSupportedConfig)?;
    if fallback.sample_format() != cpal::SampleFormat::F32 {
        return Err(OutputError::NoSupportedConfig);
    }
    Ok(fallback.config())
}

fn open_output_stream(
    device_name: Option<&str>,
    ended: mpsc::UnboundedSender<BufferId>,
) -> Result<(Stream, Arc<SharedClock>), OutputError> {
    let host = cpal::default_host();
    let device = select_output_device(&host, device_name)?;
    let config = select_output_config(&device)?;

    log::info!(
        "Using audio output device: {:?} ({} Hz, {} channels)",
        device.name(),
        config.sample_rate.0,
        config.channels
    );

    let shared = Arc::new(SharedClock {
        mixer: Mutex::new(Mixer::default()),
        frames_rendered: AtomicU64::new(0),
        sample_rate: config.sample_rate.0,
    });

    let channels = config.channels as usize;
    let callback_shared = shared.clone();
    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                callback_shared.render(data, channels, &ended);
            },
            |err| log::error!("Audio output stream error: {}", err),
            None,
        )
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => OutputError::NoOutputDevice,
            other => OutputError::StreamCreationFailed(other.to_string()),
        })?;

    Ok((stream, shared))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock(rate: u32) -> SharedClock {
        SharedClock {
            mixer: Mutex::new(Mixer::default()),
            frames_rendered: AtomicU64::new(0),
            sample_rate: rate,
        }
    }

    #[test]
    fn test_render_advances_clock() {
        let shared = clock(100);
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut data = vec![0.0f32; 50 * 2];

        shared.render(&mut data, 2, &tx);

        assert_eq!(shared.now(), 0.5);
    }

    #[test]
    fn test_back_to_back_voices_are_contiguous() {
        let shared = clock(10);
        let (tx, mut rx) = mpsc::unbounded_channel();
        shared.mixer().voices.push(Voice {
            id: 1,
            start_frame: 0,
            samples: vec![0.1; 3],
        });
        shared.mixer().voices.push(Voice {
            id: 2,
            start_frame: 3,
            samples: vec![0.2; 3],
        });

        let mut data = vec![0.0f32; 8];
        shared.render(&mut data, 1, &tx);

        assert_eq!(data, vec![0.1, 0.1, 0.1, 0.2, 0.2, 0.2, 0.0, 0.0]);
        assert_eq!(rx.try_recv().ok(), Some(1));
        assert_eq!(rx.try_recv().ok(), Some(2));
    }

    #[test]
    fn test_voice_spanning_callbacks_reports_end_once() {
        let shared = clock(10);
        let (tx, mut rx) = mpsc::unbounded_channel();
        shared.mixer().voices.push(Voice {
            id: 7,
            start_frame: 2,
            samples: vec![0.5; 4],
        });

        let mut first = vec![0.0f32; 4];
        shared.render(&mut first, 1, &tx);
        assert_eq!(first, vec![0.0, 0.0, 0.5, 0.5]);
        assert!(rx.try_recv().is_err());

        let mut second = vec![0.0f32; 4];
        shared.render(&mut second, 1, &tx);
        assert_eq!(second, vec![0.5, 0.5, 0.0, 0.0]);
        assert_eq!(rx.try_recv().ok(), Some(7));
        assert!(shared.mixer().voices.is_empty());
    }

    fn sink(rate: u32) -> SpeakerSink {
        SpeakerSink {
            shared: Arc::new(clock(rate)),
            stop_tx: None,
            thread: None,
        }
    }

    fn audio(frames: usize, rate: u32) -> DecodedAudio {
        DecodedAudio {
            samples: vec![0.1; frames],
            sample_rate: rate,
            channels: 1,
        }
    }

    #[test]
    fn test_late_start_is_moved_to_clock_and_reported() {
        let sink = sink(10);
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut data = vec![0.0f32; 8];
        sink.shared.render(&mut data, 1, &tx);

        let start = sink.schedule(0, audio(3, 10), 0.2);

        assert_eq!(start, 0.8);
        assert_eq!(sink.shared.mixer().voices[0].start_frame, 8);
        assert_eq!(sink.shared.mixer().tail_frame, 11);
    }

    #[test]
    fn test_rounding_drift_snaps_to_previous_tail() {
        let sink = sink(10);

        assert_eq!(sink.schedule(0, audio(3, 10), 0.0), 0.0);
        // One frame past the tail: still contiguous
        assert_eq!(sink.schedule(1, audio(3, 10), 0.4), 0.3);
        // A real gap is kept
        assert_eq!(sink.schedule(2, audio(3, 10), 1.0), 1.0);

        let starts: Vec<u64> = sink.shared.mixer().voices.iter().map(|v| v.start_frame).collect();
        assert_eq!(starts, vec![0, 3, 10]);
    }

    #[test]
    fn test_cancel_rewinds_tail_to_remaining_voices() {
        let sink = sink(10);
        sink.schedule(0, audio(3, 10), 0.0);
        sink.schedule(1, audio(3, 10), 0.3);

        sink.cancel(1);
        assert_eq!(sink.shared.mixer().tail_frame, 3);
        sink.cancel(0);
        assert_eq!(sink.shared.mixer().tail_frame, 0);
    }

    #[test]
    fn test_mono_voice_is_copied_to_every_channel() {
        let shared = clock(10);
        let (tx, _rx) = mpsc::unbounded_channel();
        shared.mixer().voices.push(Voice {
            id: 0,
            start_frame: 0,
            samples: vec![0.25, 0.5],
        });

        let mut data = vec![0.0f32; 4];
        shared.render(&mut data, 2, &tx);
        assert_eq!(data, vec![0.25, 0.25, 0.5, 0.5]);
    }
}
