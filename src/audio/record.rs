//! Capture context: ALSA microphone → fixed-size mono float frames.
//!
//! Capture runs on a dedicated OS thread (not a tokio task) so a blocking
//! `readi` never stalls the network side.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use alsa::pcm::PCM;
use anyhow::{Context, Result};

use super::alsa_device::{self, AlsaParams};
use super::backend::{AudioFault, AudioInput, FaultSender, FrameCallback};

/// Downmixes interleaved i16 periods to mono and cuts them into frames of
/// exactly `frame_size` samples. A partial frame is carried into the next
/// period.
struct FrameAssembler {
    frame_size: usize,
    channels: usize,
    pending: Vec<f32>,
}

impl FrameAssembler {
    fn new(frame_size: usize, channels: usize) -> Self {
        Self {
            frame_size,
            channels: channels.max(1),
            pending: Vec::with_capacity(frame_size * 2),
        }
    }

    /// Feed one ALSA read. `emit` is called once per completed frame, in
    /// order. Returns the number of frames emitted.
    fn push(&mut self, interleaved: &[i16], mut emit: impl FnMut(&[f32]) -> bool) -> usize {
        for frame in interleaved.chunks_exact(self.channels) {
            let sum: f32 = frame.iter().map(|&s| s as f32 / 32768.0).sum();
            self.pending.push(sum / self.channels as f32);
        }

        let mut emitted = 0;
        while self.pending.len() >= self.frame_size {
            if !emit(&self.pending[..self.frame_size]) {
                break;
            }
            self.pending.drain(..self.frame_size);
            emitted += 1;
        }
        emitted
    }

    fn pending(&self) -> usize {
        self.pending.len()
    }
}

pub struct AlsaInput {
    device: String,
    sample_rate: u32,
    faults: FaultSender,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl AlsaInput {
    /// No device is opened until [`AudioInput::start_capture`].
    pub fn new(device: &str, sample_rate: u32, faults: FaultSender) -> Self {
        Self {
            device: device.to_string(),
            sample_rate,
            faults,
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }
}

impl AudioInput for AlsaInput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn start_capture(&mut self, frame_size: usize, on_frame: FrameCallback) -> Result<()> {
        if self.handle.is_some() {
            anyhow::bail!("Capture already running on '{}'", self.device);
        }
        if frame_size == 0 {
            anyhow::bail!("Frame size must be positive");
        }

        // 打开麦克风失败（设备不存在/无权限）直接返回错误，由会话决定断开
        let (pcm, params) = alsa_device::open_capture(&self.device, self.sample_rate)?;

        let running = Arc::new(AtomicBool::new(true));
        self.running = running.clone();
        let faults = self.faults.clone();

        let handle = thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || {
                if let Err(e) = capture_thread(pcm, params, frame_size, on_frame, &running) {
                    log::error!("Capture thread error: {:#}", e);
                    // 主动停止时不算故障
                    if running.load(Ordering::SeqCst) {
                        let _ = faults.send(AudioFault::Capture(format!("{:#}", e)));
                    }
                }
            })?;
        self.handle = Some(handle);
        Ok(())
    }

    fn disconnect(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }

    fn close(&mut self) {
        self.disconnect();
    }
}

impl Drop for AlsaInput {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn capture_thread(
    pcm: PCM,
    params: AlsaParams,
    frame_size: usize,
    mut on_frame: FrameCallback,
    running: &AtomicBool,
) -> Result<()> {
    let channels = params.channels.max(1) as usize;
    let io = pcm.io_i16()?;

    let mut read_buf = vec![0i16; params.period_size * channels];
    let mut frames = FrameAssembler::new(frame_size, channels);

    log::info!(
        "Capture started: ch={}, period={}, frame={}",
        channels,
        params.period_size,
        frame_size,
    );

    while running.load(Ordering::Relaxed) {
        match io.readi(&mut read_buf) {
            Ok(n) => {
                frames.push(&read_buf[..n * channels], |frame| {
                    if !running.load(Ordering::Relaxed) {
                        return false;
                    }
                    on_frame(frame);
                    true
                });
            }
            Err(e) => {
                log::warn!("ALSA capture error: {}, recovering...", e);
                pcm.prepare()
                    .with_context(|| format!("Failed to recover PCM capture after: {}", e))?;
            }
        }
    }

    log::info!("Capture stopped ({} samples discarded)", frames.pending());
    Ok(())
}
