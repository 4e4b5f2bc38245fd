//! Playback context: a timeline of scheduled sources mixed onto an ALSA
//! device by a dedicated thread.
//!
//! The playback clock is the number of frames handed to ALSA divided by the
//! sample rate, so it starts at zero when the context opens and only moves
//! forward (silence is written while nothing is scheduled).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use alsa::pcm::PCM;
use anyhow::{Context, Result};
use tokio::sync::mpsc;

use super::alsa_device::{self, AlsaParams};
use super::backend::{AudioFault, AudioOutput, FaultSender};
use super::pcm::AudioBuffer;
use super::scheduler::SourceId;

#[derive(Debug)]
struct Voice {
    id: SourceId,
    start_frame: u64,
    samples: Vec<f32>,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

#[derive(Default)]
struct Timeline {
    voices: Vec<Voice>,
}

impl Timeline {
    fn insert(&mut self, voice: Voice) {
        self.voices.push(voice);
    }

    fn remove(&mut self, id: SourceId) -> bool {
        let before = self.voices.len();
        self.voices.retain(|v| v.id != id);
        self.voices.len() != before
    }

    fn clear(&mut self) {
        self.voices.clear();
    }

    /// Mix frames `[pos, pos + out.len())` into `out` and return the ids of
    /// sources that finish inside that window.
    fn render(&mut self, pos: u64, out: &mut [f32]) -> Vec<SourceId> {
        out.fill(0.0);
        let end = pos + out.len() as u64;

        for voice in &self.voices {
            if voice.start_frame >= end || voice.end_frame() <= pos {
                continue;
            }
            let from = voice.start_frame.max(pos);
            let to = voice.end_frame().min(end);
            for frame in from..to {
                out[(frame - pos) as usize] += voice.samples[(frame - voice.start_frame) as usize];
            }
        }

        let mut finished = Vec::new();
        self.voices.retain(|voice| {
            if voice.end_frame() <= end {
                finished.push(voice.id);
                false
            } else {
                true
            }
        });
        finished
    }
}

/// Turn a buffer requested at `when` seconds into a voice on the frame
/// timeline. A start that has already passed plays immediately rather than
/// being cut.
fn place_voice(
    id: SourceId,
    buffer: AudioBuffer,
    when: f64,
    sample_rate: u32,
    frames_played: u64,
) -> Result<Voice> {
    if buffer.sample_rate != sample_rate {
        anyhow::bail!(
            "Buffer rate {}Hz does not match playback context {}Hz",
            buffer.sample_rate,
            sample_rate
        );
    }
    let requested = (when.max(0.0) * sample_rate as f64).round() as u64;
    Ok(Voice {
        id,
        start_frame: requested.max(frames_played),
        samples: buffer.samples,
    })
}

fn lock(timeline: &Mutex<Timeline>) -> MutexGuard<'_, Timeline> {
    timeline.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct AlsaOutput {
    sample_rate: u32,
    timeline: Arc<Mutex<Timeline>>,
    frames_played: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl AlsaOutput {
    pub fn open(
        device: &str,
        sample_rate: u32,
        period_size: Option<usize>,
        ended: mpsc::UnboundedSender<SourceId>,
        faults: FaultSender,
    ) -> Result<Self> {
        let (pcm, params) = alsa_device::open_playback(device, sample_rate, period_size)?;

        let timeline = Arc::new(Mutex::new(Timeline::default()));
        let frames_played = Arc::new(AtomicU64::new(0));
        let running = Arc::new(AtomicBool::new(true));

        let handle = {
            let timeline = timeline.clone();
            let frames_played = frames_played.clone();
            let running = running.clone();
            thread::Builder::new()
                .name("audio-play".into())
                .spawn(move || {
                    let result =
                        play_thread(pcm, params, &timeline, &frames_played, &ended, &running);
                    // 线程退出后不再接受新的音源
                    let stopped_by_owner = !running.swap(false, Ordering::SeqCst);
                    lock(&timeline).clear();
                    if let Err(e) = result {
                        log::error!("Playback thread error: {:#}", e);
                        if !stopped_by_owner {
                            let _ = faults.send(AudioFault::Playback(format!("{:#}", e)));
                        }
                    }
                })?
        };

        Ok(Self {
            sample_rate,
            timeline,
            frames_played,
            running,
            handle: Some(handle),
        })
    }
}

impl AudioOutput for AlsaOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn current_time(&self) -> f64 {
        self.frames_played.load(Ordering::SeqCst) as f64 / self.sample_rate as f64
    }

    fn start_source(&mut self, id: SourceId, buffer: AudioBuffer, when: f64) -> Result<()> {
        if self.handle.is_none() || !self.running.load(Ordering::SeqCst) {
            anyhow::bail!("Playback context is closed");
        }
        let voice = place_voice(
            id,
            buffer,
            when,
            self.sample_rate,
            self.frames_played.load(Ordering::SeqCst),
        )?;
        lock(&self.timeline).insert(voice);
        Ok(())
    }

    fn stop_source(&mut self, id: SourceId) {
        lock(&self.timeline).remove(id);
    }

    fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        lock(&self.timeline).clear();
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for AlsaOutput {
    fn drop(&mut self) {
        self.close();
    }
}

fn play_thread(
    pcm: PCM,
    params: AlsaParams,
    timeline: &Mutex<Timeline>,
    frames_played: &AtomicU64,
    ended: &mpsc::UnboundedSender<SourceId>,
    running: &AtomicBool,
) -> Result<()> {
    let channels = params.channels.max(1) as usize;
    let period = params.period_size.max(1);
    let io = pcm.io_i16()?;

    let mut mix = vec![0f32; period];
    let mut out = vec![0i16; period * channels];

    log::info!("Playback started: ch={}, period={}", channels, period);

    while running.load(Ordering::Relaxed) {
        let pos = frames_played.load(Ordering::SeqCst);
        let finished = lock(timeline).render(pos, &mut mix);

        // 单声道混音结果复制到设备的每个声道
        for (i, &s) in mix.iter().enumerate() {
            let v = (s.clamp(-1.0, 1.0) * 32768.0) as i16;
            for ch in 0..channels {
                out[i * channels + ch] = v;
            }
        }

        let mut frames_written = 0;
        let mut retry_count = 0u32;
        while frames_written < period {
            match io.writei(&out[frames_written * channels..]) {
                Ok(n) => {
                    frames_written += n;
                    retry_count = 0;
                }
                Err(e) => {
                    log::warn!("ALSA XRUN or error: {}, recovering...", e);
                    retry_count += 1;
                    pcm.prepare().with_context(|| {
                        format!("Failed to recover PCM playback after: {}", e)
                    })?;
                    if retry_count >= 3 {
                        log::error!(
                            "Max recovery retries ({}) reached. Dropping {} unwritten frames.",
                            retry_count,
                            period - frames_written
                        );
                        break;
                    }
                }
            }
        }

        frames_played.fetch_add(period as u64, Ordering::SeqCst);
        for id in finished {
            let _ = ended.send(id);
        }
    }

    log::info!("Playback stopped");
    Ok(())
}
