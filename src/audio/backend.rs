//! Audio processing contexts used by a live session.
//!
//! A session owns two independent contexts: an input context that captures
//! microphone frames and an output context that plays scheduled buffers on
//! its own clock. They run at different sample rates and are never merged.

use anyhow::Result;
use tokio::sync::mpsc;

use super::pcm::AudioBuffer;
use super::scheduler::SourceId;

/// Called once per captured frame, on the capture thread.
pub type FrameCallback = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// A device thread stopped on an unrecoverable error. The session treats
/// either kind as fatal.
#[derive(Debug, Clone, PartialEq)]
pub enum AudioFault {
    Capture(String),
    Playback(String),
}

pub type FaultSender = mpsc::UnboundedSender<AudioFault>;

pub trait AudioInput: Send {
    fn sample_rate(&self) -> u32;

    /// Open the microphone and start delivering mono frames of exactly
    /// `frame_size` samples to `on_frame`. Fails when no microphone can be
    /// opened.
    fn start_capture(&mut self, frame_size: usize, on_frame: FrameCallback) -> Result<()>;

    /// Detach the capture node. No `on_frame` call happens after this returns.
    fn disconnect(&mut self);

    fn close(&mut self);
}

pub trait AudioOutput: Send {
    fn sample_rate(&self) -> u32;

    /// Playback clock in seconds, monotonically increasing from 0.
    fn current_time(&self) -> f64;

    /// Play `buffer` starting at `when` on the playback clock. A source that
    /// finishes on its own is reported through the `ended` sender passed to
    /// [`AudioBackend::open_output`].
    fn start_source(&mut self, id: SourceId, buffer: AudioBuffer, when: f64) -> Result<()>;

    /// Stop a scheduled or playing source. Unknown ids are ignored.
    fn stop_source(&mut self, id: SourceId);

    /// Close the context; everything still scheduled is discarded.
    fn close(&mut self);
}

pub trait AudioBackend: Send + Sync + 'static {
    type Input: AudioInput + 'static;
    type Output: AudioOutput + 'static;

    /// `faults` receives an [`AudioFault::Capture`] if the microphone dies
    /// after capture has started.
    fn open_input(&self, sample_rate: u32, faults: FaultSender) -> Result<Self::Input>;

    /// `faults` receives an [`AudioFault::Playback`] if the device dies;
    /// after that `start_source` fails.
    fn open_output(
        &self,
        sample_rate: u32,
        ended: mpsc::UnboundedSender<SourceId>,
        faults: FaultSender,
    ) -> Result<Self::Output>;
}
