//! Audio I/O for live sessions
//!
//! Microphone capture and outbound encoding on one side, reply decoding,
//! scheduling and speaker output on the other. Uses CPAL for both devices.

pub mod capture;
pub mod encoder;
pub mod output;
pub mod playback;

pub use capture::{AudioFrame, CaptureError, CaptureHandle, CaptureSource, MicrophoneCapture};
pub use encoder::{AudioFormat, FrameEncoder, OutboundPacket, TARGET_SAMPLE_RATE};
pub use output::{AudioOutput, OutputError, SpeakerOutput, SpeakerSink};
pub use playback::{
    decode_pcm16, BufferId, DecodeError, DecodedAudio, PlaybackScheduler, PlaybackSink,
    PlaybackStats, ScheduledBuffer, OUTPUT_SAMPLE_RATE,
};
