//! audio - Capture, playback, and scheduling for live sessions
//!
//! Uses ALSA for audio I/O. Inbound model audio arrives as base64 PCM16 and
//! is laid out gaplessly by the playback scheduler.

mod alsa_device;
mod audio_system;
mod backend;
pub mod pcm;
mod play;
mod record;
pub mod scheduler;

pub use audio_system::{AlsaBackend, AudioConfig};
pub use backend::{AudioBackend, AudioFault, AudioInput, AudioOutput, FaultSender, FrameCallback};
pub use pcm::AudioBuffer;
pub use scheduler::{PlaybackScheduler, SourceId};
