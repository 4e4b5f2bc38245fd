//! Full-duplex live session: microphone frames out, synthesized speech in.
//!
//! Lifecycle:
//! - `connect` allocates a 24 kHz output context and a 16 kHz input context,
//!   opens the remote channel, and spawns a driver task that handles channel
//!   events and source-ended notifications one at a time.
//! - On `Open` capture starts; every 4096-sample frame reports its RMS to the
//!   volume callback and is forwarded to the channel.
//! - Inbound audio is laid out back to back on the output clock; an
//!   interruption stops everything that is queued.
//! - `disconnect` (or a remote close/error) releases everything; the caller's
//!   `on_close` runs exactly once per connected session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use tokio::sync::mpsc;

use crate::audio::pcm;
use crate::audio::{
    AudioBackend, AudioFault, AudioInput, AudioOutput, FrameCallback, PlaybackScheduler, SourceId,
};
use crate::net_link::{LiveChannel, LiveTransport, NetEvent};
use crate::protocol::{ServerMessage, SetupMessage};

pub type VolumeCallback = Arc<dyn Fn(f32) + Send + Sync>;
type CloseCallback = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub setup: SetupMessage,
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub frame_size: usize,
}

struct SessionState<I, O, C> {
    /// Epoch of the session currently holding resources, 0 when idle.
    epoch: u64,
    channel: Option<C>,
    input: Option<I>,
    output: Option<O>,
    scheduler: PlaybackScheduler,
}

impl<I: AudioInput, O: AudioOutput, C> SessionState<I, O, C> {
    fn is_allocated(&self) -> bool {
        self.epoch != 0
    }

    /// Detach everything from the state. The caller closes the returned
    /// contexts after dropping the lock, since closing joins device threads.
    fn release(&mut self) -> Released<I, O, C> {
        self.scheduler.reset();
        self.epoch = 0;
        Released {
            input: self.input.take(),
            output: self.output.take(),
            _channel: self.channel.take(),
        }
    }
}

struct Released<I, O, C> {
    input: Option<I>,
    output: Option<O>,
    _channel: Option<C>,
}

impl<I: AudioInput, O: AudioOutput, C> Released<I, O, C> {
    /// 每一步都先判断资源是否存在，可重复调用
    fn close(mut self) {
        if let Some(input) = self.input.as_mut() {
            input.disconnect();
            input.close();
        }
        if let Some(output) = self.output.as_mut() {
            output.close();
        }
    }
}

struct Shared<B: AudioBackend, T: LiveTransport> {
    backend: B,
    transport: T,
    settings: SessionSettings,
    on_volume: VolumeCallback,
    connected: Arc<AtomicBool>,
    next_epoch: AtomicU64,
    state: Mutex<SessionState<B::Input, B::Output, T::Channel>>,
    closers: Mutex<HashMap<u64, CloseCallback>>,
}

pub struct LiveSession<B: AudioBackend, T: LiveTransport> {
    shared: Arc<Shared<B, T>>,
}

impl<B: AudioBackend, T: LiveTransport> LiveSession<B, T> {
    /// No I/O happens until [`LiveSession::connect`].
    pub fn new<F>(backend: B, transport: T, settings: SessionSettings, on_volume: F) -> Self
    where
        F: Fn(f32) + Send + Sync + 'static,
    {
        Self {
            shared: Arc::new(Shared {
                backend,
                transport,
                settings,
                on_volume: Arc::new(on_volume),
                connected: Arc::new(AtomicBool::new(false)),
                next_epoch: AtomicU64::new(0),
                state: Mutex::new(SessionState {
                    epoch: 0,
                    channel: None,
                    input: None,
                    output: None,
                    scheduler: PlaybackScheduler::new(),
                }),
                closers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Open the remote channel and both audio contexts.
    ///
    /// Returns once the channel handshake completes. A call while connected
    /// (or while a connect is in flight) is a no-op. Connection errors are
    /// returned to the caller and `on_close` is not invoked for them.
    pub async fn connect<F>(&self, on_close: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let shared = &self.shared;
        let (epoch, ended_rx, faults_rx) = {
            let mut state = shared.lock_state();
            if shared.connected.load(Ordering::SeqCst) || state.is_allocated() {
                log::debug!("connect() ignored, session already active");
                return Ok(());
            }

            let epoch = shared.next_epoch.fetch_add(1, Ordering::SeqCst) + 1;
            let (ended_tx, ended_rx) = mpsc::unbounded_channel();
            let (faults_tx, faults_rx) = mpsc::unbounded_channel();
            // 输出 24kHz、输入 16kHz，两个独立上下文，不能合并
            let output = shared.backend.open_output(
                shared.settings.output_sample_rate,
                ended_tx,
                faults_tx.clone(),
            )?;
            let input = match shared
                .backend
                .open_input(shared.settings.input_sample_rate, faults_tx)
            {
                Ok(input) => input,
                Err(e) => {
                    drop(state);
                    let mut output = output;
                    output.close();
                    return Err(e);
                }
            };
            state.epoch = epoch;
            state.output = Some(output);
            state.input = Some(input);
            (epoch, ended_rx, faults_rx)
        };
        shared.lock_closers().insert(epoch, Box::new(on_close));

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        log::info!("Live session #{} connecting", epoch);
        let channel = match shared.transport.connect(&shared.settings.setup, events_tx).await {
            Ok(channel) => channel,
            Err(e) => {
                log::warn!("Live session #{} failed to connect: {:#}", epoch, e);
                shared.cleanup(Some(epoch));
                shared.lock_closers().remove(&epoch);
                return Err(e);
            }
        };

        {
            let mut state = shared.lock_state();
            if state.epoch != epoch {
                // disconnect() 在握手期间被调用
                drop(state);
                log::info!("Live session #{} cancelled during handshake", epoch);
                channel.close();
            } else {
                state.channel = Some(channel);
            }
        }

        tokio::spawn(drive(self.shared.clone(), epoch, events_rx, ended_rx, faults_rx));
        Ok(())
    }

    /// Tear the session down. Safe to call repeatedly or before `connect`.
    pub fn disconnect(&self) {
        self.shared.disconnect();
    }

    #[cfg(test)]
    fn playback_state(&self) -> (usize, f64) {
        let state = self.shared.lock_state();
        (state.scheduler.live_count(), state.scheduler.next_start_time())
    }
}

impl<B: AudioBackend, T: LiveTransport> Drop for LiveSession<B, T> {
    fn drop(&mut self) {
        self.shared.disconnect();
    }
}

enum Flow {
    Continue,
    Stop,
}

async fn drive<B: AudioBackend, T: LiveTransport>(
    shared: Arc<Shared<B, T>>,
    epoch: u64,
    mut events: mpsc::UnboundedReceiver<NetEvent>,
    mut ended: mpsc::UnboundedReceiver<SourceId>,
    mut faults: mpsc::UnboundedReceiver<AudioFault>,
) {
    loop {
        tokio::select! {
            event = events.recv() => {
                let flow = match event {
                    Some(event) => shared.handle_event(epoch, event),
                    // 传输层没有发 Close 就退出了，按关闭处理
                    None => {
                        shared.finish(epoch);
                        Flow::Stop
                    }
                };
                if let Flow::Stop = flow {
                    break;
                }
            }
            Some(id) = ended.recv() => shared.handle_source_ended(epoch, id),
            Some(fault) = faults.recv() => shared.handle_fault(epoch, fault),
        }
    }
    log::debug!("Live session #{} driver stopped", epoch);
}

impl<B: AudioBackend, T: LiveTransport> Shared<B, T> {
    fn lock_state(&self) -> MutexGuard<'_, SessionState<B::Input, B::Output, T::Channel>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_closers(&self) -> MutexGuard<'_, HashMap<u64, CloseCallback>> {
        self.closers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle_event(self: &Arc<Self>, epoch: u64, event: NetEvent) -> Flow {
        match event {
            NetEvent::Open => {
                if self.lock_state().epoch == epoch {
                    self.connected.store(true, Ordering::SeqCst);
                    log::info!("Live session #{} open", epoch);
                    self.start_audio_input(epoch);
                }
                Flow::Continue
            }
            NetEvent::Message(msg) => {
                self.handle_message(epoch, &msg);
                Flow::Continue
            }
            NetEvent::Close => {
                log::info!("Live session #{} closed", epoch);
                self.finish(epoch);
                Flow::Stop
            }
            NetEvent::Error(err) => {
                log::error!("Live session #{} error: {}", epoch, err);
                self.finish(epoch);
                Flow::Stop
            }
        }
    }

    fn start_audio_input(self: &Arc<Self>, epoch: u64) {
        let result = {
            let mut state = self.lock_state();
            if state.epoch != epoch {
                return;
            }
            let Some(channel) = state.channel.clone() else {
                return;
            };
            let on_frame = self.frame_callback(channel);
            let frame_size = self.settings.frame_size;
            match state.input.as_mut() {
                Some(input) => input.start_capture(frame_size, on_frame),
                None => return,
            }
        };

        if let Err(e) = result {
            // 麦克风不可用对会话是致命的，不重试，经由关闭路径通知调用方
            log::warn!("Microphone unavailable: {:#}", e);
            self.disconnect();
        }
    }

    /// Runs on the capture thread; must not take the session lock.
    fn frame_callback(&self, channel: T::Channel) -> FrameCallback {
        let connected = self.connected.clone();
        let on_volume = self.on_volume.clone();
        let sample_rate = self.settings.input_sample_rate;
        Box::new(move |samples: &[f32]| {
            if !connected.load(Ordering::SeqCst) {
                return;
            }
            on_volume(pcm::rms(samples));
            channel.send_realtime_input(pcm::encode_frame(samples, sample_rate));
        })
    }

    fn handle_message(&self, epoch: u64, msg: &ServerMessage) {
        let mut state = self.lock_state();
        if state.epoch != epoch {
            return;
        }
        let SessionState {
            output, scheduler, ..
        } = &mut *state;
        let Some(output) = output.as_mut() else {
            return;
        };

        if let Some(payload) = msg.audio_payload() {
            match pcm::decode_audio(&payload.data, output.sample_rate()) {
                Ok(buffer) => {
                    let source = scheduler.schedule(buffer.duration(), output.current_time());
                    log::trace!(
                        "Scheduling source {} ({} samples) at {:.3}s..{:.3}s, {} queued",
                        source.id,
                        buffer.len(),
                        source.start_time,
                        source.end_time(),
                        scheduler.live_count()
                    );
                    if let Err(e) = output.start_source(source.id, buffer, source.start_time) {
                        log::warn!("Failed to start playback source {}: {:#}", source.id, e);
                        scheduler.finish(source.id);
                    }
                }
                // 单个坏包直接丢弃，会话继续
                Err(e) => log::warn!("Dropping inbound audio payload: {}", e),
            }
        }

        if msg.server_content.as_ref().is_some_and(|c| c.turn_complete) {
            log::debug!("Model turn complete, {} sources queued", scheduler.live_count());
        }

        if msg.is_interrupted() {
            let stopped = scheduler.interrupt();
            log::debug!("Interrupted, flushing {} queued sources", stopped.len());
            for id in stopped {
                output.stop_source(id);
            }
        }
    }

    fn handle_source_ended(&self, epoch: u64, id: SourceId) {
        let mut state = self.lock_state();
        if state.epoch == epoch && state.scheduler.is_live(id) {
            state.scheduler.finish(id);
            log::trace!(
                "Source {} ended, next start {:.3}s",
                id,
                state.scheduler.next_start_time()
            );
        }
    }

    /// A device thread died. Same path as a denied microphone: close the
    /// channel and let its `Close` deliver `on_close`.
    fn handle_fault(&self, epoch: u64, fault: AudioFault) {
        if self.lock_state().epoch != epoch {
            return;
        }
        match fault {
            AudioFault::Capture(e) => log::error!("Microphone failed: {}", e),
            AudioFault::Playback(e) => log::error!("Playback device failed: {}", e),
        }
        self.disconnect();
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let channel = self.lock_state().channel.clone();
        if let Some(channel) = channel {
            channel.close();
        }
        self.cleanup(None);
    }

    /// Release everything held by `epoch` (or by whichever session is
    /// current when `epoch` is `None`).
    fn cleanup(&self, epoch: Option<u64>) {
        let released = {
            let mut state = self.lock_state();
            if epoch.is_some_and(|e| e != state.epoch) {
                return;
            }
            if state.is_allocated() {
                log::debug!("Releasing live session #{}", state.epoch);
                self.connected.store(false, Ordering::SeqCst);
            }
            state.release()
        };
        released.close();
    }

    /// Remote close or error: clean up, then notify the caller once.
    fn finish(&self, epoch: u64) {
        self.cleanup(Some(epoch));
        let closer = self.lock_closers().remove(&epoch);
        if let Some(on_close) = closer {
            on_close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioBuffer, FaultSender};
    use crate::protocol::Blob;
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    // ======================== Fakes ========================

    #[derive(Default)]
    struct BackendProbe {
        clock: Mutex<f64>,
        started: Mutex<Vec<(SourceId, f64, f64)>>,
        stopped: Mutex<Vec<SourceId>>,
        mic: Mutex<Option<FrameCallback>>,
        mic_denied: AtomicBool,
        ended_tx: Mutex<Option<mpsc::UnboundedSender<SourceId>>>,
        faults_tx: Mutex<Option<FaultSender>>,
        output_dead: AtomicBool,
        on_input_close: Mutex<Option<Box<dyn FnOnce() + Send>>>,
        outputs_opened: AtomicUsize,
        outputs_closed: AtomicUsize,
        inputs_closed: AtomicUsize,
    }

    #[derive(Clone, Default)]
    struct FakeBackend {
        probe: Arc<BackendProbe>,
    }

    impl FakeBackend {
        fn set_time(&self, t: f64) {
            *self.probe.clock.lock().unwrap() = t;
        }

        fn capture(&self, samples: &[f32]) {
            if let Some(on_frame) = self.probe.mic.lock().unwrap().as_mut() {
                on_frame(samples);
            }
        }

        fn mic_open(&self) -> bool {
            self.probe.mic.lock().unwrap().is_some()
        }

        fn started(&self) -> Vec<(SourceId, f64, f64)> {
            self.probe.started.lock().unwrap().clone()
        }

        fn stopped(&self) -> Vec<SourceId> {
            self.probe.stopped.lock().unwrap().clone()
        }

        fn fault(&self, fault: AudioFault) {
            if let Some(tx) = self.probe.faults_tx.lock().unwrap().as_ref() {
                let _ = tx.send(fault);
            }
        }

        fn finish_source(&self, id: SourceId) {
            if let Some(tx) = self.probe.ended_tx.lock().unwrap().as_ref() {
                let _ = tx.send(id);
            }
        }
    }

    struct FakeInput {
        probe: Arc<BackendProbe>,
        sample_rate: u32,
    }

    impl AudioInput for FakeInput {
        fn sample_rate(&self) -> u32 {
            self.sample_rate
        }

        fn start_capture(&mut self, frame_size: usize, on_frame: FrameCallback) -> Result<()> {
            assert_eq!(frame_size, 4096);
            if self.probe.mic_denied.load(Ordering::SeqCst) {
                anyhow::bail!("Permission denied");
            }
            *self.probe.mic.lock().unwrap() = Some(on_frame);
            Ok(())
        }

        fn disconnect(&mut self) {
            *self.probe.mic.lock().unwrap() = None;
        }

        fn close(&mut self) {
            self.probe.inputs_closed.fetch_add(1, Ordering::SeqCst);
            let hook = self.probe.on_input_close.lock().unwrap().take();
            if let Some(hook) = hook {
                hook();
            }
        }
    }

    struct FakeOutput {
        probe: Arc<BackendProbe>,
        sample_rate: u32,
    }

    impl AudioOutput for FakeOutput {
        fn sample_rate(&self) -> u32 {
            self.sample_rate
        }

        fn current_time(&self) -> f64 {
            *self.probe.clock.lock().unwrap()
        }

        fn start_source(&mut self, id: SourceId, buffer: AudioBuffer, when: f64) -> Result<()> {
            assert_eq!(buffer.sample_rate, self.sample_rate);
            if self.probe.output_dead.load(Ordering::SeqCst) {
                anyhow::bail!("Playback context is closed");
            }
            self.probe
                .started
                .lock()
                .unwrap()
                .push((id, when, buffer.duration()));
            Ok(())
        }

        fn stop_source(&mut self, id: SourceId) {
            self.probe.stopped.lock().unwrap().push(id);
        }

        fn close(&mut self) {
            self.probe.outputs_closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl AudioBackend for FakeBackend {
        type Input = FakeInput;
        type Output = FakeOutput;

        fn open_input(&self, sample_rate: u32, faults: FaultSender) -> Result<FakeInput> {
            *self.probe.faults_tx.lock().unwrap() = Some(faults);
            Ok(FakeInput {
                probe: self.probe.clone(),
                sample_rate,
            })
        }

        fn open_output(
            &self,
            sample_rate: u32,
            ended: mpsc::UnboundedSender<SourceId>,
            _faults: FaultSender,
        ) -> Result<FakeOutput> {
            self.probe.outputs_opened.fetch_add(1, Ordering::SeqCst);
            *self.probe.ended_tx.lock().unwrap() = Some(ended);
            Ok(FakeOutput {
                probe: self.probe.clone(),
                sample_rate,
            })
        }
    }

    #[derive(Default)]
    struct TransportProbe {
        events: Mutex<Option<mpsc::UnboundedSender<NetEvent>>>,
        sent: Mutex<Vec<Blob>>,
        connects: AtomicUsize,
        closes: AtomicUsize,
        refuse: AtomicBool,
    }

    #[derive(Clone)]
    struct FakeChannel {
        probe: Arc<TransportProbe>,
    }

    impl LiveChannel for FakeChannel {
        fn send_realtime_input(&self, chunk: Blob) {
            self.probe.sent.lock().unwrap().push(chunk);
        }

        fn close(&self) {
            // 和真实链路一样：关闭请求之后由远端回一个 Close 事件
            if self.probe.closes.fetch_add(1, Ordering::SeqCst) == 0 {
                if let Some(events) = self.probe.events.lock().unwrap().as_ref() {
                    let _ = events.send(NetEvent::Close);
                }
            }
        }
    }

    #[derive(Clone, Default)]
    struct FakeTransport {
        probe: Arc<TransportProbe>,
    }

    impl FakeTransport {
        fn emit(&self, event: NetEvent) {
            let events = self.probe.events.lock().unwrap();
            events.as_ref().unwrap().send(event).unwrap();
        }

        fn sent(&self) -> Vec<Blob> {
            self.probe.sent.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl LiveTransport for FakeTransport {
        type Channel = FakeChannel;

        async fn connect(
            &self,
            setup: &SetupMessage,
            events: mpsc::UnboundedSender<NetEvent>,
        ) -> Result<FakeChannel> {
            assert!(setup.setup.model.starts_with("models/"));
            self.probe.connects.fetch_add(1, Ordering::SeqCst);
            if self.probe.refuse.load(Ordering::SeqCst) {
                anyhow::bail!("handshake refused");
            }
            self.probe.closes.store(0, Ordering::SeqCst);
            events.send(NetEvent::Open).unwrap();
            *self.probe.events.lock().unwrap() = Some(events);
            Ok(FakeChannel {
                probe: self.probe.clone(),
            })
        }
    }

    // ======================== Helpers ========================

    struct Harness {
        backend: FakeBackend,
        transport: FakeTransport,
        volumes: Arc<Mutex<Vec<f32>>>,
        closes: Arc<AtomicUsize>,
        session: LiveSession<FakeBackend, FakeTransport>,
    }

    impl Harness {
        fn new() -> Self {
            let backend = FakeBackend::default();
            let transport = FakeTransport::default();
            let volumes = Arc::new(Mutex::new(Vec::new()));
            let sink = volumes.clone();
            let session = LiveSession::new(
                backend.clone(),
                transport.clone(),
                settings(),
                move |level| sink.lock().unwrap().push(level),
            );
            Self {
                backend,
                transport,
                volumes,
                closes: Arc::new(AtomicUsize::new(0)),
                session,
            }
        }

        async fn connect(&self) -> Result<()> {
            let closes = self.closes.clone();
            self.session
                .connect(move || {
                    closes.fetch_add(1, Ordering::SeqCst);
                })
                .await
        }

        /// Connect and wait until the capture pipeline is running.
        async fn open(&self) {
            self.connect().await.unwrap();
            let backend = self.backend.clone();
            settle(move || backend.mic_open()).await;
        }

        fn volumes(&self) -> Vec<f32> {
            self.volumes.lock().unwrap().clone()
        }

        fn close_count(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }

        async fn deliver(&self, msg: ServerMessage) {
            self.transport.emit(NetEvent::Message(msg));
            // 驱动任务在同一个 runtime 上，让出时间给它处理
            settle_for(Duration::from_millis(20)).await;
        }
    }

    fn settings() -> SessionSettings {
        SessionSettings {
            setup: SetupMessage::audio("test-model", "Zephyr"),
            input_sample_rate: 16000,
            output_sample_rate: 24000,
            frame_size: 4096,
        }
    }

    async fn settle<F: Fn() -> bool>(cond: F) {
        for _ in 0..400 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    async fn settle_for(d: Duration) {
        tokio::time::sleep(d).await;
    }

    fn audio_message(seconds: f64) -> ServerMessage {
        let samples = (seconds * 24000.0).round() as usize;
        let data = STANDARD.encode(vec![0u8; samples * 2]);
        let text = format!(
            r#"{{"serverContent":{{"modelTurn":{{"parts":[{{"inlineData":{{"mimeType":"audio/pcm;rate=24000","data":"{}"}}}}]}}}}}}"#,
            data
        );
        serde_json::from_str(&text).unwrap()
    }

    fn interrupted_message() -> ServerMessage {
        serde_json::from_str(r#"{"serverContent":{"interrupted":true}}"#).unwrap()
    }

    const EPS: f64 = 1e-9;

    // ======================== Tests ========================

    #[tokio::test]
    async fn test_disconnect_before_connect_is_silent() {
        let h = Harness::new();
        h.session.disconnect();
        h.session.disconnect();

        assert!(!h.session.is_connected());
        assert!(h.volumes().is_empty());
        assert_eq!(h.close_count(), 0);
        assert_eq!(h.backend.probe.outputs_opened.load(Ordering::SeqCst), 0);
        assert_eq!(h.session.playback_state(), (0, 0.0));
    }

    #[tokio::test]
    async fn test_captured_frames_report_volume_and_are_forwarded() {
        let h = Harness::new();
        h.open().await;
        assert!(h.session.is_connected());

        let frame = vec![0.5f32; 4096];
        for _ in 0..3 {
            h.backend.capture(&frame);
        }

        let volumes = h.volumes();
        assert_eq!(volumes.len(), 3);
        for v in volumes {
            assert!((v - 0.5).abs() < 1e-6);
        }

        let sent = h.transport.sent();
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|b| b.mime_type == "audio/pcm;rate=16000"));
        let decoded = pcm::decode_audio(&sent[0].data, 16000).unwrap();
        assert_eq!(decoded.len(), 4096);
        assert_eq!(decoded.samples[0], 0.5);
    }

    #[tokio::test]
    async fn test_volume_follows_capture_order() {
        let h = Harness::new();
        h.open().await;

        for level in [0.1f32, 0.4, 0.2] {
            h.backend.capture(&vec![level; 4096]);
        }
        let volumes = h.volumes();
        assert_eq!(volumes.len(), 3);
        for (got, want) in volumes.iter().zip([0.1f32, 0.4, 0.2]) {
            assert!((got - want).abs() < 1e-6);
        }
    }

    #[tokio::test]
    async fn test_inbound_audio_is_scheduled_back_to_back() {
        let h = Harness::new();
        h.open().await;
        h.backend.set_time(0.0);

        h.deliver(audio_message(1.0)).await;
        h.deliver(audio_message(1.5)).await;

        let started = h.backend.started();
        assert_eq!(started.len(), 2);
        assert!((started[0].1 - 0.0).abs() < EPS);
        assert!((started[1].1 - 1.0).abs() < EPS);
        assert_eq!(h.session.playback_state().0, 2);
        assert!((h.session.playback_state().1 - 2.5).abs() < EPS);
    }

    #[tokio::test]
    async fn test_interruption_flushes_queued_audio() {
        let h = Harness::new();
        h.open().await;

        h.deliver(audio_message(1.0)).await;
        let first = h.backend.started()[0].0;

        h.backend.set_time(0.3);
        h.deliver(interrupted_message()).await;
        assert_eq!(h.backend.stopped(), vec![first]);
        assert_eq!(h.session.playback_state(), (0, 0.0));

        h.deliver(audio_message(0.8)).await;
        let started = h.backend.started();
        assert_eq!(started.len(), 2);
        assert!((started[1].1 - 0.3).abs() < EPS, "third buffer must start now");
        assert!(h.session.is_connected(), "interruption keeps the session open");
        assert!(h.backend.mic_open());
    }

    #[tokio::test]
    async fn test_audio_and_interruption_in_one_message() {
        let h = Harness::new();
        h.open().await;

        let mut msg = audio_message(0.5);
        msg.server_content.as_mut().unwrap().interrupted = true;
        h.deliver(msg).await;

        // 音频先被排入再被打断清空
        let started = h.backend.started();
        assert_eq!(started.len(), 1);
        assert_eq!(h.backend.stopped(), vec![started[0].0]);
        assert_eq!(h.session.playback_state(), (0, 0.0));
    }

    #[tokio::test]
    async fn test_source_ended_removes_live_source() {
        let h = Harness::new();
        h.open().await;

        h.deliver(audio_message(1.0)).await;
        h.deliver(audio_message(1.0)).await;
        assert_eq!(h.session.playback_state().0, 2);

        let first = h.backend.started()[0].0;
        h.backend.finish_source(first);
        settle(|| h.session.playback_state().0 == 1).await;
        // 播放结束不回退游标
        assert!((h.session.playback_state().1 - 2.0).abs() < EPS);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_dropped() {
        let h = Harness::new();
        h.open().await;

        let bad: ServerMessage = serde_json::from_str(
            r#"{"serverContent":{"modelTurn":{"parts":[{"inlineData":{"mimeType":"audio/pcm","data":"%%%"}}]}}}"#,
        )
        .unwrap();
        h.deliver(bad).await;
        assert!(h.backend.started().is_empty());
        assert!(h.session.is_connected());

        h.deliver(audio_message(0.25)).await;
        assert_eq!(h.backend.started().len(), 1);
    }

    #[tokio::test]
    async fn test_no_callbacks_after_disconnect() {
        let h = Harness::new();
        h.open().await;

        h.backend.capture(&vec![0.2f32; 4096]);
        h.session.disconnect();
        assert!(!h.session.is_connected());
        assert!(!h.backend.mic_open());

        h.backend.capture(&vec![0.2f32; 4096]);
        assert_eq!(h.volumes().len(), 1);
        assert_eq!(h.transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_frame_handler_checks_connected_flag() {
        let h = Harness::new();
        h.open().await;

        // 采集节点还挂着，但会话已标记为断开
        h.session.shared.connected.store(false, Ordering::SeqCst);
        h.backend.capture(&vec![0.2f32; 4096]);
        assert!(h.volumes().is_empty());
        assert!(h.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_releases_everything_and_closes_once() {
        let h = Harness::new();
        h.open().await;
        h.deliver(audio_message(1.0)).await;

        h.session.disconnect();
        h.session.disconnect();

        assert_eq!(h.session.playback_state(), (0, 0.0));
        assert_eq!(h.backend.probe.outputs_closed.load(Ordering::SeqCst), 1);
        assert_eq!(h.backend.probe.inputs_closed.load(Ordering::SeqCst), 1);
        assert_eq!(h.transport.probe.closes.load(Ordering::SeqCst), 1);

        settle(|| h.close_count() == 1).await;
        settle_for(Duration::from_millis(20)).await;
        assert_eq!(h.close_count(), 1);
    }

    #[tokio::test]
    async fn test_remote_error_cleans_up_and_notifies() {
        let h = Harness::new();
        h.open().await;

        h.transport.emit(NetEvent::Error("connection reset".to_string()));
        settle(|| h.close_count() == 1).await;

        assert!(!h.session.is_connected());
        assert!(!h.backend.mic_open());
        assert_eq!(h.backend.probe.outputs_closed.load(Ordering::SeqCst), 1);

        // 之后的 disconnect 不会再触发 on_close
        h.session.disconnect();
        settle_for(Duration::from_millis(20)).await;
        assert_eq!(h.close_count(), 1);
    }

    #[tokio::test]
    async fn test_remote_close_cleans_up_and_notifies() {
        let h = Harness::new();
        h.open().await;

        h.transport.emit(NetEvent::Close);
        settle(|| h.close_count() == 1).await;
        assert!(!h.session.is_connected());
        assert_eq!(h.backend.probe.inputs_closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_second_connect_while_connected_is_noop() {
        let h = Harness::new();
        h.open().await;
        h.connect().await.unwrap();

        assert_eq!(h.transport.probe.connects.load(Ordering::SeqCst), 1);
        assert_eq!(h.backend.probe.outputs_opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connect_error_propagates_and_releases() {
        let h = Harness::new();
        h.transport.probe.refuse.store(true, Ordering::SeqCst);

        let err = h.connect().await.unwrap_err();
        assert!(err.to_string().contains("handshake refused"));
        assert!(!h.session.is_connected());
        assert_eq!(h.backend.probe.outputs_closed.load(Ordering::SeqCst), 1);
        assert_eq!(h.close_count(), 0);

        // 失败之后可以重新连接
        h.transport.probe.refuse.store(false, Ordering::SeqCst);
        h.open().await;
        assert!(h.session.is_connected());
    }

    #[tokio::test]
    async fn test_microphone_denied_ends_session_via_close() {
        let h = Harness::new();
        h.backend.probe.mic_denied.store(true, Ordering::SeqCst);

        h.connect().await.unwrap();
        settle(|| h.close_count() == 1).await;

        assert!(!h.session.is_connected());
        assert!(h.transport.sent().is_empty());
        assert_eq!(h.transport.probe.closes.load(Ordering::SeqCst), 1);
        assert_eq!(h.backend.probe.outputs_closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reconnect_starts_with_fresh_schedule() {
        let h = Harness::new();
        h.open().await;
        h.deliver(audio_message(2.0)).await;
        h.session.disconnect();
        settle(|| h.close_count() == 1).await;

        h.backend.set_time(0.0);
        h.open().await;
        h.deliver(audio_message(0.5)).await;

        let started = h.backend.started();
        assert_eq!(started.len(), 2);
        assert!((started[1].1 - 0.0).abs() < EPS);
        assert_eq!(h.transport.probe.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_capture_fault_ends_session_via_close() {
        let h = Harness::new();
        h.open().await;
        h.backend.capture(&vec![0.3f32; 4096]);

        h.backend.fault(AudioFault::Capture("device unplugged".to_string()));
        settle(|| h.close_count() == 1).await;

        assert!(!h.session.is_connected());
        assert!(!h.backend.mic_open());
        assert_eq!(h.transport.probe.closes.load(Ordering::SeqCst), 1);
        assert_eq!(h.backend.probe.inputs_closed.load(Ordering::SeqCst), 1);

        settle_for(Duration::from_millis(20)).await;
        assert_eq!(h.close_count(), 1);
        assert_eq!(h.volumes().len(), 1);
    }

    #[tokio::test]
    async fn test_playback_fault_ends_session_via_close() {
        let h = Harness::new();
        h.open().await;
        h.deliver(audio_message(1.0)).await;

        h.backend.fault(AudioFault::Playback("write failed".to_string()));
        settle(|| h.close_count() == 1).await;

        assert!(!h.session.is_connected());
        assert_eq!(h.session.playback_state(), (0, 0.0));
        assert_eq!(h.backend.probe.outputs_closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejected_sources_do_not_accumulate() {
        let h = Harness::new();
        h.open().await;
        h.deliver(audio_message(1.0)).await;
        assert_eq!(h.session.playback_state().0, 1);

        h.backend.probe.output_dead.store(true, Ordering::SeqCst);
        for _ in 0..3 {
            h.deliver(audio_message(0.5)).await;
        }
        assert_eq!(h.backend.started().len(), 1);
        assert_eq!(h.session.playback_state().0, 1);
    }

    #[tokio::test]
    async fn test_devices_are_closed_outside_session_lock() {
        let h = Harness::new();
        h.open().await;

        let lock_free = Arc::new(AtomicBool::new(false));
        let seen = lock_free.clone();
        let shared = h.session.shared.clone();
        *h.backend.probe.on_input_close.lock().unwrap() = Some(Box::new(move || {
            seen.store(shared.state.try_lock().is_ok(), Ordering::SeqCst);
        }));

        h.session.disconnect();
        assert_eq!(h.backend.probe.inputs_closed.load(Ordering::SeqCst), 1);
        assert!(lock_free.load(Ordering::SeqCst));
    }
}
