//! ALSA-backed audio system: builds the capture and playback contexts a
//! live session asks for.

use anyhow::Result;
use tokio::sync::mpsc;

use super::backend::{AudioBackend, FaultSender};
use super::play::AlsaOutput;
use super::record::AlsaInput;
use super::scheduler::SourceId;
use crate::config::Config;

/// Audio system configuration.
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// ALSA capture device name (e.g. "default", "plughw:0,0")
    pub capture_device: String,
    /// ALSA playback device name
    pub playback_device: String,
    /// Desired ALSA playback period size (0 = let ALSA decide)
    pub playback_period_size: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            capture_device: "default".to_string(),
            playback_device: "default".to_string(),
            playback_period_size: 1024,
        }
    }
}

impl From<&Config> for AudioConfig {
    fn from(config: &Config) -> Self {
        Self {
            capture_device: config.capture_device.to_string(),
            playback_device: config.playback_device.to_string(),
            playback_period_size: config.playback_period_size,
        }
    }
}

pub struct AlsaBackend {
    config: AudioConfig,
}

impl AlsaBackend {
    pub fn new(config: AudioConfig) -> Self {
        log::info!(
            "AlsaBackend capture: \"{}\", playback: \"{}\", period: {}",
            config.capture_device,
            config.playback_device,
            config.playback_period_size,
        );
        Self { config }
    }
}

impl AudioBackend for AlsaBackend {
    type Input = AlsaInput;
    type Output = AlsaOutput;

    fn open_input(&self, sample_rate: u32, faults: FaultSender) -> Result<AlsaInput> {
        Ok(AlsaInput::new(&self.config.capture_device, sample_rate, faults))
    }

    fn open_output(
        &self,
        sample_rate: u32,
        ended: mpsc::UnboundedSender<SourceId>,
        faults: FaultSender,
    ) -> Result<AlsaOutput> {
        let period_size = if self.config.playback_period_size > 0 {
            Some(self.config.playback_period_size)
        } else {
            None
        };
        AlsaOutput::open(
            &self.config.playback_device,
            sample_rate,
            period_size,
            ended,
            faults,
        )
    }
}
