//! ALSA PCM device wrappers for the capture and playback contexts.

use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};
use anyhow::{Context, Result};

/// Parameters negotiated with the ALSA hardware.
#[derive(Debug, Clone)]
pub struct AlsaParams {
    pub channels: u32,
    /// Period size in frames
    pub period_size: usize,
}

/// Open a mono PCM device for capture at exactly `sample_rate`.
pub fn open_capture(device: &str, sample_rate: u32) -> Result<(PCM, AlsaParams)> {
    open_pcm(device, Direction::Capture, sample_rate, 1, None)
}

/// Open a PCM device for playback at exactly `sample_rate`.
///
/// Mono is requested first; devices that only take stereo get the mono
/// signal duplicated by the caller.
pub fn open_playback(
    device: &str,
    sample_rate: u32,
    period_size: Option<usize>,
) -> Result<(PCM, AlsaParams)> {
    match open_pcm(device, Direction::Playback, sample_rate, 1, period_size) {
        Ok(opened) => Ok(opened),
        Err(e) => {
            log::debug!("Mono playback unavailable on '{}' ({:#}), trying stereo", device, e);
            open_pcm(device, Direction::Playback, sample_rate, 2, period_size)
        }
    }
}

struct Request<'a> {
    device: &'a str,
    direction: Direction,
    sample_rate: u32,
    channels: u32,
    period_size: Option<usize>,
}

impl Request<'_> {
    fn label(&self) -> &'static str {
        match self.direction {
            Direction::Capture => "Capture",
            Direction::Playback => "Playback",
        }
    }
}

fn open_pcm(
    device: &str,
    direction: Direction,
    sample_rate: u32,
    channels: u32,
    period_size: Option<usize>,
) -> Result<(PCM, AlsaParams)> {
    let req = Request {
        device,
        direction,
        sample_rate,
        channels,
        period_size,
    };
    let pcm = PCM::new(req.device, req.direction, false).with_context(|| {
        format!("Failed to open PCM device '{}' for {}", req.device, req.label())
    })?;
    configure(&pcm, &req)?;

    let hwp = pcm.hw_params_current()?;
    let rate = hwp.get_rate()?;
    let params = AlsaParams {
        channels: hwp.get_channels()?,
        period_size: hwp.get_period_size()? as usize,
    };
    drop(hwp);

    // 会话两端的采样率由远端模型决定，不能将就硬件协商出的其他采样率
    if rate != req.sample_rate {
        anyhow::bail!(
            "{} device '{}' negotiated {}Hz, {}Hz required (use a plug/default device)",
            req.label(),
            req.device,
            rate,
            req.sample_rate
        );
    }

    log::info!(
        "ALSA {} '{}': {}Hz x{} ch, period {}",
        req.label(),
        req.device,
        rate,
        params.channels,
        params.period_size,
    );
    Ok((pcm, params))
}

fn configure(pcm: &PCM, req: &Request<'_>) -> Result<()> {
    let hwp = HwParams::any(pcm).context("Failed to initialize HwParams")?;
    hwp.set_access(Access::RWInterleaved)?;
    hwp.set_format(Format::S16LE)?;
    hwp.set_channels(req.channels)?;
    hwp.set_rate_near(req.sample_rate, ValueOr::Nearest)?;
    if let Some(frames) = req.period_size {
        hwp.set_period_size_near(frames as alsa::pcm::Frames, ValueOr::Nearest)?;
    }
    pcm.hw_params(&hwp)?;
    Ok(())
}
