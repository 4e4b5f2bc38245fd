//! Playback schedule for inbound model audio.
//!
//! Buffers are laid back to back on the output clock: the start of buffer
//! n+1 is the end of buffer n, or "now" when the queue has drained. An
//! interruption drops every live source and rewinds the cursor to zero.

use std::collections::BTreeMap;

pub type SourceId = u64;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledSource {
    pub id: SourceId,
    /// Start time on the output clock, in seconds.
    pub start_time: f64,
    /// Duration in seconds.
    pub duration: f64,
}

impl ScheduledSource {
    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration
    }
}

#[derive(Debug, Default)]
pub struct PlaybackScheduler {
    next_start_time: f64,
    live: BTreeMap<SourceId, ScheduledSource>,
    next_id: SourceId,
}

impl PlaybackScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a slot for a buffer of `duration` seconds, given the output
    /// clock reads `now`.
    pub fn schedule(&mut self, duration: f64, now: f64) -> ScheduledSource {
        let start_time = self.next_start_time.max(now);
        self.next_id += 1;
        let source = ScheduledSource {
            id: self.next_id,
            start_time,
            duration,
        };
        self.live.insert(source.id, source);
        self.next_start_time = start_time + duration;
        source
    }

    /// A source played to completion. Returns false for ids no longer live.
    pub fn finish(&mut self, id: SourceId) -> bool {
        self.live.remove(&id).is_some()
    }

    /// Drop all live sources and rewind the cursor. Returns the ids that
    /// must be stopped on the output context, in scheduling order.
    pub fn interrupt(&mut self) -> Vec<SourceId> {
        let stopped: Vec<SourceId> = self.live.keys().copied().collect();
        self.live.clear();
        self.next_start_time = 0.0;
        stopped
    }

    /// Forget everything; used when the output context goes away.
    pub fn reset(&mut self) {
        self.live.clear();
        self.next_start_time = 0.0;
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn is_live(&self, id: SourceId) -> bool {
        self.live.contains_key(&id)
    }
}
