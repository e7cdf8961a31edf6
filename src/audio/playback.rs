//! Gap-free scheduling of reply audio on the output device clock
//!
//! Every inbound chunk is decoded and placed at
//! `start = max(now, last_scheduled_end)` on the sink's own timeline, so
//! bursty arrival neither leaves gaps nor overlaps buffers. An interruption
//! cancels everything still live and rewinds `last_scheduled_end` to the
//! current clock time.
//!
//! The scheduler is the single writer of its live set and end counter;
//! callers only go through its methods.

use std::collections::BTreeMap;

use thiserror::Error;

/// Sample rate of reply audio unless the payload says otherwise
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Identifies one scheduled buffer for cancel/ended bookkeeping
pub type BufferId = u64;

/// Malformed inbound audio; the chunk is dropped and playback continues
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("audio payload is empty")]
    Empty,
    #[error("audio payload has odd length {0}, expected PCM16")]
    OddLength(usize),
    #[error("unsupported audio format ({sample_rate} Hz, {channels} channels)")]
    UnsupportedFormat { sample_rate: u32, channels: u16 },
}

/// Decoded reply audio, interleaved f32
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl DecodedAudio {
    /// Playback length in seconds
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 || self.channels == 0 {
            return 0.0;
        }
        let frames = self.samples.len() / self.channels as usize;
        frames as f64 / self.sample_rate as f64
    }
}

/// Decode little-endian PCM16 into f32 samples
pub fn decode_pcm16(bytes: &[u8], sample_rate: u32, channels: u16) -> Result<DecodedAudio, DecodeError> {
    if sample_rate == 0 || channels == 0 {
        return Err(DecodeError::UnsupportedFormat {
            sample_rate,
            channels,
        });
    }
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::OddLength(bytes.len()));
    }

    let samples = bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect();

    Ok(DecodedAudio {
        samples,
        sample_rate,
        channels,
    })
}

/// Output device abstraction with its own monotonic clock
///
/// Times are seconds on the device timeline, never wall-clock time.
pub trait PlaybackSink: Send {
    /// Current position of the output clock
    fn now(&self) -> f64;

    /// Start `audio` at `start_at` on the output clock
    ///
    /// Returns the start actually used, which is later than `start_at` when
    /// that moment already passed. When the buffer finishes the sink
    /// reports `id` on its ended channel.
    fn schedule(&self, id: BufferId, audio: DecodedAudio, start_at: f64) -> f64;

    /// Stop a buffer immediately; it must not produce sound afterwards
    fn cancel(&self, id: BufferId);
}

/// A buffer the scheduler has placed on the timeline
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledBuffer {
    pub id: BufferId,
    pub start: f64,
    pub duration: f64,
}

impl ScheduledBuffer {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// Counters kept by the scheduler for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackStats {
    pub scheduled: u64,
    pub completed: u64,
    pub decode_errors: u64,
    pub interruptions: u64,
    pub cancelled: u64,
}

pub struct PlaybackScheduler {
    sink: Box<dyn PlaybackSink>,
    live: BTreeMap<BufferId, ScheduledBuffer>,
    last_scheduled_end: f64,
    next_id: BufferId,
    stats: PlaybackStats,
}

impl PlaybackScheduler {
    pub fn new(sink: Box<dyn PlaybackSink>) -> Self {
        let now = sink.now();
        Self {
            sink,
            live: BTreeMap::new(),
            last_scheduled_end: now,
            next_id: 0,
            stats: PlaybackStats::default(),
        }
    }

    /// Decode a PCM16 mono chunk and queue it right after the previous one
    pub fn enqueue_pcm16(&mut self, bytes: &[u8], sample_rate: u32) -> Result<ScheduledBuffer, DecodeError> {
        match decode_pcm16(bytes, sample_rate, 1) {
            Ok(audio) => Ok(self.schedule(audio)),
            Err(e) => {
                self.stats.decode_errors += 1;
                Err(e)
            }
        }
    }

    /// Queue already-decoded audio right after the previous buffer
    pub fn schedule(&mut self, audio: DecodedAudio) -> ScheduledBuffer {
        let now = self.sink.now();
        let requested = now.max(self.last_scheduled_end);
        let id = self.next_id;
        self.next_id += 1;

        let duration = audio.duration();
        let start = self.sink.schedule(id, audio, requested);
        let buffer = ScheduledBuffer { id, start, duration };
        self.last_scheduled_end = buffer.end();
        self.live.insert(buffer.id, buffer);
        self.stats.scheduled += 1;

        if self.stats.scheduled % 100 == 0 {
            log::debug!(
                "Playback: {} buffers scheduled, {} live, queued until {:.3}s (now {:.3}s)",
                self.stats.scheduled,
                self.live.len(),
                self.last_scheduled_end,
                now
            );
        }

        buffer
    }

    /// Playback-ended notification from the sink
    ///
    /// Returns false for ids that are no longer live (already cancelled).
    pub fn on_ended(&mut self, id: BufferId) -> bool {
        let removed = self.live.remove(&id).is_some();
        if removed {
            self.stats.completed += 1;
        }
        removed
    }

    /// Barge-in: hard-stop everything live and restart the timeline at now
    ///
    /// Returns the number of buffers cut.
    pub fn interrupt(&mut self) -> usize {
        let cut = self.cancel_all();
        self.last_scheduled_end = self.sink.now();
        self.stats.interruptions += 1;
        if cut > 0 {
            log::info!("Playback: interrupted, {} buffers discarded", cut);
        }
        cut
    }

    /// Cancel every live buffer without counting an interruption (teardown)
    pub fn clear(&mut self) -> usize {
        let cut = self.cancel_all();
        self.last_scheduled_end = self.sink.now();
        cut
    }

    fn cancel_all(&mut self) -> usize {
        let live = std::mem::take(&mut self.live);
        for id in live.keys() {
            self.sink.cancel(*id);
        }
        self.stats.cancelled += live.len() as u64;
        live.len()
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn is_playing(&self) -> bool {
        !self.live.is_empty()
    }

    pub fn last_scheduled_end(&self) -> f64 {
        self.last_scheduled_end
    }

    pub fn stats(&self) -> PlaybackStats {
        self.stats
    }

    /// Live buffers in schedule order
    pub fn live_buffers(&self) -> Vec<ScheduledBuffer> {
        self.live.values().copied().collect()
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// What a `ManualSink` has been asked to do
    #[derive(Debug, Default)]
    pub struct SinkLog {
        pub now: f64,
        pub scheduled: Vec<(BufferId, f64, f64)>,
        pub cancelled: Vec<BufferId>,
        /// Added to every requested start, like a device that starts late
        pub start_delay: f64,
    }

    /// Sink whose clock only moves when the test says so
    #[derive(Clone, Default)]
    pub struct ManualSink {
        pub log: Arc<Mutex<SinkLog>>,
    }

    impl ManualSink {
        pub fn set_now(&self, t: f64) {
            self.log.lock().unwrap().now = t;
        }
    }

    impl PlaybackSink for ManualSink {
        fn now(&self) -> f64 {
            self.log.lock().unwrap().now
        }

        fn schedule(&self, id: BufferId, audio: DecodedAudio, start_at: f64) -> f64 {
            let mut log = self.log.lock().unwrap();
            let start = start_at + log.start_delay;
            log.scheduled.push((id, start, audio.duration()));
            start
        }

        fn cancel(&self, id: BufferId) {
            self.log.lock().unwrap().cancelled.push(id);
        }
    }

    /// `seconds` of 24 kHz mono PCM16 silence
    pub fn pcm_seconds(seconds: f64) -> Vec<u8> {
        vec![0u8; (OUTPUT_SAMPLE_RATE as f64 * seconds) as usize * 2]
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    fn scheduler() -> (PlaybackScheduler, ManualSink) {
        let sink = ManualSink::default();
        (PlaybackScheduler::new(Box::new(sink.clone())), sink)
    }

    #[test]
    fn test_three_one_second_chunks_play_back_to_back() {
        let (mut s, _sink) = scheduler();

        let starts: Vec<f64> = (0..3)
            .map(|_| s.enqueue_pcm16(&pcm_seconds(1.0), OUTPUT_SAMPLE_RATE).unwrap().start)
            .collect();

        assert_eq!(starts, vec![0.0, 1.0, 2.0]);
        assert_eq!(s.last_scheduled_end(), 3.0);
        assert_eq!(s.live_count(), 3);
    }

    #[test]
    fn test_late_chunk_starts_at_clock_not_in_the_past() {
        let (mut s, sink) = scheduler();

        s.enqueue_pcm16(&pcm_seconds(0.5), OUTPUT_SAMPLE_RATE).unwrap();
        sink.set_now(2.0);
        let late = s.enqueue_pcm16(&pcm_seconds(0.5), OUTPUT_SAMPLE_RATE).unwrap();

        assert_eq!(late.start, 2.0);
        assert_eq!(s.last_scheduled_end(), 2.5);
    }

    #[test]
    fn test_next_chunk_follows_where_the_sink_actually_started() {
        let (mut s, sink) = scheduler();
        sink.log.lock().unwrap().start_delay = 0.25;
        let first = s.enqueue_pcm16(&pcm_seconds(1.0), OUTPUT_SAMPLE_RATE).unwrap();
        sink.log.lock().unwrap().start_delay = 0.0;
        let second = s.enqueue_pcm16(&pcm_seconds(1.0), OUTPUT_SAMPLE_RATE).unwrap();

        assert_eq!(first.start, 0.25);
        assert_eq!(second.start, 1.25);
        assert_eq!(s.last_scheduled_end(), 2.25);
        assert_eq!(s.live_buffers(), vec![first, second]);
    }

    #[test]
    fn test_bursty_arrival_never_overlaps() {
        let (mut s, sink) = scheduler();
        let durations = [0.2, 0.04, 1.3, 0.5, 0.01, 0.75, 0.3];
        let clock = [0.0, 0.0, 0.1, 0.1, 3.0, 3.0, 3.2];

        for (d, t) in durations.iter().zip(clock.iter()) {
            sink.set_now(*t);
            s.enqueue_pcm16(&pcm_seconds(*d), OUTPUT_SAMPLE_RATE).unwrap();
        }

        let log = sink.log.lock().unwrap();
        for pair in log.scheduled.windows(2) {
            let (_, start_a, dur_a) = pair[0];
            let (_, start_b, _) = pair[1];
            assert!(start_b >= start_a, "start times must not decrease");
            assert!(start_b + 1e-9 >= start_a + dur_a, "buffers must not overlap");
        }
    }

    #[test]
    fn test_interrupt_cancels_live_set_and_rewinds() {
        let (mut s, sink) = scheduler();
        for _ in 0..3 {
            s.enqueue_pcm16(&pcm_seconds(1.0), OUTPUT_SAMPLE_RATE).unwrap();
        }
        sink.set_now(0.4);

        let cut = s.interrupt();

        assert_eq!(cut, 3);
        assert_eq!(s.live_count(), 0);
        assert_eq!(s.last_scheduled_end(), 0.4);
        assert_eq!(sink.log.lock().unwrap().cancelled, vec![0, 1, 2]);

        let next = s.enqueue_pcm16(&pcm_seconds(1.0), OUTPUT_SAMPLE_RATE).unwrap();
        assert_eq!(next.start, 0.4);
        assert_eq!(s.stats().interruptions, 1);
    }

    #[test]
    fn test_ended_removes_from_live_set() {
        let (mut s, _sink) = scheduler();
        let a = s.enqueue_pcm16(&pcm_seconds(0.1), OUTPUT_SAMPLE_RATE).unwrap();
        let b = s.enqueue_pcm16(&pcm_seconds(0.1), OUTPUT_SAMPLE_RATE).unwrap();

        assert!(s.on_ended(a.id));
        assert!(!s.on_ended(a.id));
        assert_eq!(s.live_buffers(), vec![b]);
        assert_eq!(s.stats().completed, 1);
    }

    #[test]
    fn test_ended_after_interrupt_is_ignored() {
        let (mut s, _sink) = scheduler();
        let a = s.enqueue_pcm16(&pcm_seconds(0.1), OUTPUT_SAMPLE_RATE).unwrap();
        s.interrupt();
        assert!(!s.on_ended(a.id));
    }

    #[test]
    fn test_decode_error_drops_chunk_and_playback_continues() {
        let (mut s, _sink) = scheduler();
        s.enqueue_pcm16(&pcm_seconds(1.0), OUTPUT_SAMPLE_RATE).unwrap();

        assert_eq!(
            s.enqueue_pcm16(&[1, 2, 3], OUTPUT_SAMPLE_RATE),
            Err(DecodeError::OddLength(3))
        );
        assert_eq!(s.enqueue_pcm16(&[], OUTPUT_SAMPLE_RATE), Err(DecodeError::Empty));

        let next = s.enqueue_pcm16(&pcm_seconds(1.0), OUTPUT_SAMPLE_RATE).unwrap();
        assert_eq!(next.start, 1.0);
        assert_eq!(s.stats().decode_errors, 2);
    }

    #[test]
    fn test_decode_pcm16_values() {
        let audio = decode_pcm16(&[0x00, 0x80, 0x00, 0x40, 0x00, 0x00], 24_000, 1).unwrap();
        assert_eq!(audio.samples, vec![-1.0, 0.5, 0.0]);
        assert!((audio.duration() - 3.0 / 24_000.0).abs() < 1e-12);
    }

    #[test]
    fn test_decode_rejects_zero_rate() {
        assert!(matches!(
            decode_pcm16(&[0, 0], 0, 1),
            Err(DecodeError::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn test_clear_cancels_without_counting_interrupt() {
        let (mut s, sink) = scheduler();
        s.enqueue_pcm16(&pcm_seconds(1.0), OUTPUT_SAMPLE_RATE).unwrap();
        assert_eq!(s.clear(), 1);
        assert_eq!(s.stats().interruptions, 0);
        assert_eq!(sink.log.lock().unwrap().cancelled, vec![0]);
    }
}
