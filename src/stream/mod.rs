//! Per-stream state machine — the client-facing façade (spec.md §4.1, §6
//! "Client API").
//!
//! One [`Stream`] exists per client recognition session, created at
//! `load_sound_model` and torn down at `unload_sound_model`. It owns (via
//! `Arc`) its attached stage-1 engine, and owns its stage-2 engines and LAB
//! reader outright. External events are funneled through [`Stream::handle_event`] —
//! the single exhaustive dispatcher spec.md §9 calls for in place of the
//! source's objects-with-virtual-`ProcessEvent`.

pub mod state;

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::buffering::{ReaderLifecycle, RingReader};
use crate::config::{CaptureProfile, ConfidenceLevel, RecognitionConfig, StageTolerances, DEFAULT_DELAY, LAB_DELAY};
use crate::dsp::DspSession;
use crate::engine1::{DetectionSink, GmmDetection, Stage1Engine};
use crate::engine2::{AlgorithmKind, Stage2Engine, StageVerdict, Verdict};
use crate::error::{Result, SoundTriggerError};
use crate::events::{AbortReason, ClientEvent};
use crate::model::{SoundModel, S_STAGE_PDK, S_STAGE_RNN, S_STAGE_USER};
use crate::plugin::{PluginHandle, StubPlugin};
use crate::registry::RecognitionRegistry;
use crate::resource::{InputMode, OperatingMode, ResourceManager};
use crate::timer::DeferredStopTimer;
use crate::vui::{DetectionFields, VoiceUiInterface};

pub use state::{DetectedKind, Event, RestoreState, State};

const STAGE2_BUFFER_FRAMES: usize = 320;
const STAGE2_MAX_PROCESSING_BYTES: usize = 10 * 1024 * 1024;
const LAB_RING_CAPACITY: usize = 8 * 1024 * 1024;

/// Default stage-2 plugin factory used when the caller does not supply a
/// real acoustic backend — mirrors the teacher crate's `StubModel` as a
/// development placeholder (spec.md §9 "Plugin loading").
pub fn default_plugin_factory(_algorithm: AlgorithmKind) -> PluginHandle {
    PluginHandle::new(StubPlugin::new(10))
}

struct Stage2Slot {
    engine: Stage2Engine,
}

struct StreamInner {
    state: State,
    state_for_restore: RestoreState,
    paused: bool,
    pending_stop: bool,
    wake_lock: bool,
    capture_requested: bool,
    device_id: Option<u32>,
    ec_rx_dev: Option<u32>,
    module_type: u32,
    miid: u32,
    sound_model: Option<SoundModel>,
    recognition_config: RecognitionConfig,
    stage1: Option<Arc<Stage1Engine>>,
    stage2: Vec<Stage2Slot>,
    lab_reader: Option<RingReader>,
}

/// One client recognition session (spec.md §3 "Stream").
pub struct Stream {
    id: u64,
    resource_manager: Arc<dyn ResourceManager>,
    vui: Arc<dyn VoiceUiInterface>,
    registry: Arc<RecognitionRegistry>,
    callback: Mutex<Option<Box<dyn Fn(ClientEvent) + Send + Sync>>>,
    timer: Mutex<Option<DeferredStopTimer>>,
    self_weak: Mutex<Weak<Stream>>,
    inner: Mutex<StreamInner>,
}

impl Stream {
    /// `idle -> load -> loaded` (spec.md §4.1 canonical transitions):
    /// resolve the capture profile, instantiate the stage-1/stage-2
    /// engines, register with the shared stage-1 engine.
    pub fn load_sound_model(
        id: u64,
        model_bytes: &[u8],
        module_type: u32,
        registry: Arc<RecognitionRegistry>,
        resource_manager: Arc<dyn ResourceManager>,
        vui: Arc<dyn VoiceUiInterface>,
        dsp_factory: impl FnOnce() -> Box<dyn DspSession>,
        plugin_factory: &dyn Fn(AlgorithmKind) -> PluginHandle,
    ) -> Result<Arc<Stream>> {
        let model = SoundModel::parse(model_bytes)?;

        let stage2_specs: Vec<AlgorithmKind> = {
            let mut specs = Vec::new();
            if model.find_stage(S_STAGE_PDK).is_some() || model.find_stage(S_STAGE_RNN).is_some() {
                specs.push(AlgorithmKind::KeywordDetection);
            }
            if model.find_stage(S_STAGE_USER).is_some() {
                specs.push(AlgorithmKind::UserVerification);
            }
            specs
        };

        let profile = resource_manager.get_capture_profile(OperatingMode::LowPower, InputMode::Handset);
        resource_manager.register_stream(id);

        let gate = registry.detection_gate();
        let stage1 = registry.engine_for(module_type, {
            let gate = Arc::clone(&gate);
            move || Stage1Engine::new(module_type, dsp_factory(), gate, LAB_RING_CAPACITY, true)
        });

        let lab_reader_id = stage1.ring().add_reader();
        let lab_reader = stage1.ring().reader(lab_reader_id);
        let miid = synthetic_miid(id);

        let stream = Arc::new(Stream {
            id,
            resource_manager: Arc::clone(&resource_manager),
            vui: Arc::clone(&vui),
            registry: Arc::clone(&registry),
            callback: Mutex::new(None),
            timer: Mutex::new(None),
            self_weak: Mutex::new(Weak::new()),
            inner: Mutex::new(StreamInner {
                state: State::Idle,
                state_for_restore: RestoreState::None,
                paused: false,
                pending_stop: false,
                wake_lock: false,
                capture_requested: false,
                device_id: None,
                ec_rx_dev: None,
                module_type,
                miid,
                sound_model: Some(model),
                recognition_config: RecognitionConfig::default(),
                stage1: Some(Arc::clone(&stage1)),
                stage2: Vec::new(),
                lab_reader: Some(lab_reader),
            }),
        });

        *stream.self_weak.lock() = Arc::downgrade(&stream);

        let timer_weak = Arc::downgrade(&stream);
        *stream.timer.lock() = Some(DeferredStopTimer::spawn(move || {
            if let Some(stream) = timer_weak.upgrade() {
                stream.on_deferred_stop_fired();
            }
        }));

        let mut stage2 = Vec::new();
        for algorithm in stage2_specs {
            let verdict_weak = Arc::downgrade(&stream);
            let engine = Stage2Engine::new(
                algorithm,
                plugin_factory(algorithm),
                stage1.ring(),
                StageTolerances::default(),
                profile.clone(),
                STAGE2_BUFFER_FRAMES,
                STAGE2_MAX_PROCESSING_BYTES,
                move |verdict| {
                    if let Some(stream) = verdict_weak.upgrade() {
                        stream.handle_stage2_verdict(verdict);
                    }
                },
            );
            stage2.push(Stage2Slot { engine });
        }

        // `register_reader` only finds a home once `load` has inserted this
        // stream's entry — load first, then wire up index publication.
        stage1.load(id, Arc::clone(&stream) as Arc<dyn DetectionSink>, miid, &profile)?;
        stage1.register_reader(id, lab_reader_id);
        for slot in &stage2 {
            stage1.register_reader(id, slot.engine.reader_id());
        }

        {
            let mut inner = stream.inner.lock();
            inner.stage2 = stage2;
            inner.state = State::Loaded;
        }

        info!(stream_id = id, module_type, "stream loaded");
        Ok(stream)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> State {
        self.inner.lock().state
    }

    /// The MIID this stream's stage-1 engine correlates DSP events on —
    /// callers driving a real DSP session tag their events with this value
    /// (spec.md §6 "DSP session interface").
    pub fn miid(&self) -> u32 {
        self.inner.lock().miid
    }

    pub fn paused(&self) -> bool {
        self.inner.lock().paused
    }

    /// Platform-level toggle for whether a stage-2 rejection surfaces as
    /// `ClientEvent::Failure` or restarts silently (spec.md §7 scenario 3).
    /// Off by default; not exposed through the client-facing recognition
    /// config since it's a deployment policy, not a per-session request.
    pub fn set_notify_stage2_reject(&self, notify: bool) {
        self.inner.lock().recognition_config.notify_stage2_reject = notify;
    }

    pub fn register_callback(&self, cb: impl Fn(ClientEvent) + Send + Sync + 'static) {
        *self.callback.lock() = Some(Box::new(cb));
    }

    /// The single exhaustive event dispatcher spec.md §9 calls for, in
    /// place of the source's objects-with-virtual-`ProcessEvent`.
    pub fn handle_event(&self, event: Event) -> Result<()> {
        match event {
            Event::LoadSoundModel => Err(SoundTriggerError::InvalidArgument(
                "load_sound_model is a constructor, not a re-entrant event".into(),
            )),
            Event::UnloadSoundModel => self.unload_sound_model(),
            Event::RecognitionConfig => Ok(()), // see `recognition_config` (needs payload)
            Event::Start => self.start(),
            Event::Stop => self.stop(),
            Event::ReadBuffer => Ok(()), // see `read` (needs a buffer)
            Event::StopBuffering => self.stop_buffering(),
            Event::Pause => self.pause(),
            Event::Resume => self.resume(),
            Event::InternalPause => self.internal_pause(),
            Event::InternalResume => self.internal_resume(),
            Event::DeviceConnected(dev) => self.device_connected(dev),
            Event::DeviceDisconnected(dev) => self.device_disconnected(dev),
            Event::ConcurrentStreamChanged { active } => self.concurrent_stream_changed(active),
            Event::EcRef { rx_dev, enable } => self.ec_ref(rx_dev, enable),
            Event::SsrOffline => self.ssr_offline(),
            Event::SsrOnline => self.ssr_online(),
            Event::Detected(_) => Ok(()), // delivered internally via DetectionSink/stage-2 callbacks
        }
    }

    /// `loaded -> recognition_config -> loaded`: parse via the voice-UI
    /// interface, merge in caller-supplied fields (spec.md §6).
    pub fn recognition_config(
        &self,
        opaque: &[u8],
        capture_requested: bool,
        num_phrases: u32,
        confidence_levels: Vec<ConfidenceLevel>,
    ) -> Result<()> {
        let mut cfg = self.vui.parse_recognition_config(opaque)?;
        cfg.capture_requested = capture_requested;
        cfg.num_phrases = num_phrases;
        if !confidence_levels.is_empty() {
            cfg.confidence_levels = confidence_levels;
        }

        let mut inner = self.inner.lock();
        if inner.state != State::Loaded {
            return Err(SoundTriggerError::InvalidArgument(
                "recognition_config only valid in loaded state".into(),
            ));
        }
        inner.capture_requested = cfg.capture_requested;
        inner.recognition_config = cfg;
        Ok(())
    }

    /// `loaded|detected -> start -> active`: open/start device, start
    /// stage-1 and stage-2 engines, reset readers.
    pub fn start(&self) -> Result<()> {
        self.timer_cancel();
        let mut inner = self.inner.lock();
        if inner.state == State::Ssr {
            return Err(SoundTriggerError::SsrInProgress);
        }
        if !matches!(inner.state, State::Loaded | State::Detected) {
            return Err(SoundTriggerError::InvalidArgument(
                "start only valid from loaded/detected".into(),
            ));
        }
        if inner.paused {
            return Err(SoundTriggerError::DeviceBusy);
        }
        let restarting = inner.state == State::Detected;
        let stage1 = inner
            .stage1
            .clone()
            .ok_or(SoundTriggerError::NotRunning)?;
        let threshold = default_confidence(&inner.recognition_config);

        self.resource_manager.concurrent_stream_status(self.id, true);
        if let Err(err) = stage1.start(self.id) {
            self.resource_manager.concurrent_stream_status(self.id, false);
            return Err(err);
        }

        for (idx, slot) in inner.stage2.iter().enumerate() {
            // `detected -> start -> active` tries a cheap in-place restart
            // first; a genuinely idle engine falls back to a full start.
            let result = if restarting {
                match slot.engine.restart(threshold) {
                    Err(SoundTriggerError::RestartIgnored) => slot
                        .engine
                        .load_sound_model(&[])
                        .and_then(|_| slot.engine.start_recognition(threshold)),
                    other => other,
                }
            } else {
                slot.engine
                    .load_sound_model(&[])
                    .and_then(|_| slot.engine.start_recognition(threshold))
            };
            if let Err(err) = result {
                // Roll back engines already started, in reverse order.
                for rollback in inner.stage2[..idx].iter().rev() {
                    rollback.engine.stop_recognition();
                }
                let _ = stage1.stop(self.id);
                self.resource_manager.concurrent_stream_status(self.id, false);
                return Err(err);
            }
        }

        if let Some(reader) = inner.lab_reader.as_mut() {
            reader.reset();
        }
        inner.state = State::Active;
        inner.paused = false;
        Ok(())
    }

    /// `* -> stop -> loaded`: reference-counted stop on shared resources.
    pub fn stop(&self) -> Result<()> {
        self.timer_cancel();
        let mut inner = self.inner.lock();
        if inner.state == State::Ssr {
            return Err(SoundTriggerError::SsrInProgress);
        }
        if matches!(inner.state, State::Idle | State::Loaded) {
            return Ok(());
        }
        for slot in &inner.stage2 {
            slot.engine.stop_recognition();
        }
        if let Some(stage1) = inner.stage1.clone() {
            stage1.stop(self.id)?;
            stage1.finish_detection(self.id);
        }
        if let Some(reader) = inner.lab_reader.as_mut() {
            reader.update_state(ReaderLifecycle::Disabled);
        }
        self.resource_manager.concurrent_stream_status(self.id, false);
        let had_wake_lock = inner.wake_lock;
        inner.wake_lock = false;
        inner.state = State::Loaded;
        drop(inner);
        if had_wake_lock {
            self.resource_manager.release_wake_lock(self.id);
        }
        Ok(())
    }

    /// `read(buf, size) -> bytes_read`; throttles to roughly real time when
    /// the reader is empty (spec.md §8 boundary behavior).
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let profile = {
            let inner = self.inner.lock();
            inner
                .stage1
                .as_ref()
                .map(|s| s.merged_profile())
                .unwrap_or_default()
        };

        let n = {
            let mut inner = self.inner.lock();
            let reader = inner
                .lab_reader
                .as_mut()
                .ok_or(SoundTriggerError::NotRunning)?;
            reader.read(buf)
        };

        if n == 0 {
            let denom = (profile.sample_rate as u64 * profile.bit_width as u64 * profile.channels as u64).max(1);
            let sleep_ms = (buf.len() as u64 * 8000) / denom;
            std::thread::sleep(Duration::from_millis(sleep_ms));
        }
        Ok(n)
    }

    /// `buffering -> stop_buffering -> buffering`: disable reader, release
    /// sleep-monitor vote, arm deferred stop.
    pub fn stop_buffering(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != State::Buffering {
            return Ok(());
        }
        if let Some(reader) = inner.lab_reader.as_mut() {
            reader.update_state(ReaderLifecycle::Disabled);
        }
        drop(inner);
        self.resource_manager.vote_sleep_monitor(self.id, false, false);
        self.arm_deferred_stop(LAB_DELAY);
        Ok(())
    }

    /// Client-visible pause; emits `ABORT`.
    pub fn pause(&self) -> Result<()> {
        self.do_pause(true)
    }

    pub fn internal_pause(&self) -> Result<()> {
        self.do_pause(false)
    }

    pub fn resume(&self) -> Result<()> {
        self.do_resume()
    }

    pub fn internal_resume(&self) -> Result<()> {
        self.do_resume()
    }

    fn do_pause(&self, external: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state == State::Ssr {
            return Err(SoundTriggerError::SsrInProgress);
        }
        if !matches!(inner.state, State::Active | State::Detected | State::Buffering) {
            inner.paused = true;
            return Ok(());
        }
        for slot in &inner.stage2 {
            slot.engine.stop_recognition();
        }
        if let Some(stage1) = inner.stage1.clone() {
            let _ = stage1.stop(self.id);
        }
        inner.paused = true;
        inner.state = State::Loaded;
        drop(inner);
        if external {
            self.emit(ClientEvent::Abort {
                stream_id: self.id,
                reason: AbortReason::ConcurrentCapture,
            });
        }
        Ok(())
    }

    fn do_resume(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state == State::Ssr {
            return Err(SoundTriggerError::SsrInProgress);
        }
        if !inner.paused {
            return Ok(());
        }
        inner.paused = false;
        let stage1 = inner.stage1.clone();
        let threshold = default_confidence(&inner.recognition_config);
        if let Some(stage1) = &stage1 {
            stage1.start(self.id)?;
        }
        for slot in &inner.stage2 {
            let _ = slot.engine.start_recognition(threshold);
        }
        inner.state = State::Active;
        Ok(())
    }

    pub fn device_connected(&self, device_id: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.device_id = Some(device_id);
        let re_arm = matches!(inner.state, State::Buffering | State::Detected);
        if let Some(stage1) = inner.stage1.clone() {
            if matches!(inner.state, State::Active | State::Buffering | State::Detected) {
                stage1.start(self.id)?;
            }
        }
        let threshold = default_confidence(&inner.recognition_config);
        if re_arm {
            for slot in &inner.stage2 {
                let _ = slot.engine.start_recognition(threshold);
            }
            if let Some(reader) = inner.lab_reader.as_mut() {
                reader.reset();
            }
            inner.state = State::Active;
        }
        Ok(())
    }

    pub fn device_disconnected(&self, device_id: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.device_id != Some(device_id) {
            return Ok(());
        }
        for slot in &inner.stage2 {
            slot.engine.stop_recognition();
        }
        if let Some(stage1) = inner.stage1.clone() {
            let _ = stage1.stop(self.id);
        }
        if let Some(reader) = inner.lab_reader.as_mut() {
            reader.reset();
        }
        inner.device_id = None;
        Ok(())
    }

    /// `any loaded+ -> concurrent_stream(active=false) -> idle`, replayed
    /// back on `active=true` (spec.md §4.1 canonical transitions).
    /// `any loaded+ -> concurrent_stream(active=false) -> profile change ->
    /// idle`: only fires when the resource manager reports the aggregate
    /// capture profile actually changed (spec.md §4.2).
    pub fn concurrent_stream_changed(&self, active: bool) -> Result<()> {
        if !self.resource_manager.update_capture_profile(self.id, active) {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        if !active {
            if inner.state == State::Idle {
                return Ok(());
            }
            if let Some(stage1) = inner.stage1.clone() {
                let _ = stage1.reconfigure_detection_graph(self.id);
            }
            inner.state_for_restore = RestoreState::from_state(inner.state);
            inner.state = State::Idle;
        } else if inner.state == State::Idle {
            let restore = inner.state_for_restore;
            if restore == RestoreState::Active {
                if let Some(stage1) = inner.stage1.clone() {
                    stage1.start(self.id)?;
                }
            }
            inner.state = restore.as_state();
        }
        Ok(())
    }

    pub fn ec_ref(&self, rx_dev: u32, enable: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        let first_time = inner.ec_rx_dev.is_none();
        if let Some(stage1) = inner.stage1.clone() {
            stage1.set_ec_ref(self.id, rx_dev, enable, first_time)?;
        }
        inner.ec_rx_dev = if enable { Some(rx_dev) } else { None };
        Ok(())
    }

    /// `any -> ssr_offline -> ssr`: remember restore-state, stop and unload.
    pub fn ssr_offline(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.state_for_restore = RestoreState::from_state(inner.state);
        for slot in &inner.stage2 {
            slot.engine.stop_recognition();
        }
        if let Some(stage1) = inner.stage1.clone() {
            let _ = stage1.stop(self.id);
            let _ = stage1.unload(self.id);
        }
        inner.state = State::Ssr;
        drop(inner);
        self.emit(ClientEvent::Abort {
            stream_id: self.id,
            reason: AbortReason::ServiceRestart,
        });
        Ok(())
    }

    /// `ssr -> ssr_online -> restore-state`: replay load, config, and start.
    pub fn ssr_online(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let restore = inner.state_for_restore;
        let profile = inner
            .stage1
            .as_ref()
            .map(|s| s.merged_profile())
            .unwrap_or_default();
        let miid = inner.miid;
        let stage1 = inner.stage1.clone();
        drop(inner);

        if let Some(stage1) = &stage1 {
            let sink = self
                .self_weak
                .lock()
                .upgrade()
                .ok_or(SoundTriggerError::Other(anyhow::anyhow!("stream already dropped")))?;
            stage1.load(self.id, sink as Arc<dyn DetectionSink>, miid, &profile)?;
            if restore == RestoreState::Active {
                stage1.start(self.id)?;
            }
        }

        let mut inner = self.inner.lock();
        inner.state = restore.as_state();
        Ok(())
    }

    /// `* -> unload -> (destroyed)`.
    pub fn unload_sound_model(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state == State::Ssr {
            return Err(SoundTriggerError::SsrInProgress);
        }
        if matches!(inner.state, State::Active | State::Buffering | State::Detected) {
            return Err(SoundTriggerError::InvalidArgument(
                "stop before unload".into(),
            ));
        }
        let module_type = inner.module_type;
        if let Some(stage1) = inner.stage1.take() {
            stage1.unload(self.id)?;
        }
        inner.stage2.clear();
        inner.state = State::Idle;
        drop(inner);
        self.registry.release_if_unused(module_type);
        self.resource_manager.deregister_stream(self.id);
        Ok(())
    }

    fn on_deferred_stop_fired(&self) {
        let should_stop = {
            let inner = self.inner.lock();
            matches!(inner.state, State::Detected | State::Buffering)
        };
        if should_stop {
            if let Err(err) = self.stop() {
                warn!(stream_id = self.id, error = %err, "deferred stop failed");
            }
        }
    }

    fn arm_deferred_stop(&self, delay: Duration) {
        if let Some(timer) = self.timer.lock().as_ref() {
            timer.arm(delay);
        }
    }

    fn timer_cancel(&self) {
        if let Some(timer) = self.timer.lock().as_ref() {
            timer.cancel();
        }
    }

    fn emit(&self, event: ClientEvent) {
        if let Some(cb) = self.callback.lock().as_ref() {
            cb(event);
        }
    }

    fn handle_stage2_verdict(&self, verdict: StageVerdict) {
        let mut inner = self.inner.lock();
        if inner.state != State::Buffering {
            debug!(stream_id = self.id, "stale stage-2 verdict ignored");
            return;
        }

        if !verdict.success {
            for slot in &inner.stage2 {
                slot.engine.stop_recognition();
            }
            let capture_requested = inner.capture_requested;
            if !capture_requested {
                if let Some(reader) = inner.lab_reader.as_mut() {
                    reader.update_state(ReaderLifecycle::Disabled);
                }
            }
            let had_wake_lock = inner.wake_lock;
            inner.wake_lock = false;
            inner.state = State::Active;
            let stage1 = inner.stage1.clone();
            let threshold = default_confidence(&inner.recognition_config);
            let notify_reject = inner.recognition_config.notify_stage2_reject;
            drop(inner);

            if had_wake_lock {
                self.resource_manager.release_wake_lock(self.id);
            }
            self.timer_cancel();
            // Platform-configured "notify second-stage failure" is off by
            // default: the engine restarts silently (spec.md §7, scenario 3).
            if notify_reject {
                self.emit(ClientEvent::Failure {
                    stream_id: self.id,
                    reason: "stage-2 rejection".to_string(),
                });
            }
            if let Some(stage1) = &stage1 {
                let _ = stage1.start(self.id);
                stage1.finish_detection(self.id);
            }
            let inner = self.inner.lock();
            for slot in &inner.stage2 {
                let _ = slot.engine.start_recognition(threshold);
            }
            return;
        }

        let all_required_succeeded = inner
            .stage2
            .iter()
            .all(|slot| matches!(slot.engine.verdict(), Verdict::Success));
        if !all_required_succeeded {
            debug!(stream_id = self.id, "waiting on remaining stage-2 engines");
            return;
        }

        let capture_requested = inner.capture_requested;
        if !capture_requested {
            if let Some(reader) = inner.lab_reader.as_mut() {
                reader.reset();
            }
            inner.state = State::Detected;
        }
        let stage1 = inner.stage1.clone();
        drop(inner);

        self.emit_success(0, Vec::new(), Some(verdict.confidence as f32 / 255.0), 0);
        self.arm_deferred_stop(DEFAULT_DELAY);
        if let Some(stage1) = stage1 {
            stage1.finish_detection(self.id);
        }
    }

    fn emit_success(
        &self,
        keyword_index: u32,
        confidence_levels: Vec<ConfidenceLevel>,
        uv_score: Option<f32>,
        timestamp_ms: u64,
    ) {
        let fields = DetectionFields {
            keyword_index,
            confidence_levels,
            uv_score,
            timestamp_ms,
        };
        let payload = self.vui.build_detection_event(&fields).unwrap_or_default();
        self.emit(ClientEvent::Success {
            stream_id: self.id,
            payload,
        });
    }
}

impl DetectionSink for Stream {
    /// `active -> detected(gmm, ...) -> detected|buffering` (spec.md §4.1
    /// canonical transitions; §4.2 "invokes the stream's
    /// `set_engine_detection_state(GMM_DETECTED)`").
    fn on_gmm_detected(&self, detection: GmmDetection) {
        let mut inner = self.inner.lock();
        if inner.state != State::Active {
            // Absorbed silently but forces engine resynchronization
            // (spec.md §8 "Boundary behaviors").
            let stage1 = inner.stage1.clone();
            drop(inner);
            if let Some(stage1) = stage1 {
                stage1.finish_detection(self.id);
            }
            return;
        }

        let has_stage2 = !inner.stage2.is_empty();
        let capture_requested = inner.capture_requested;
        inner.wake_lock = true;

        if !has_stage2 && !capture_requested {
            inner.state = State::Detected;
            let stage1 = inner.stage1.clone();
            let confidence_levels: Vec<ConfidenceLevel> = detection
                .confidence_levels
                .iter()
                .enumerate()
                .map(|(i, &level)| ConfidenceLevel {
                    phrase_id: i as u32,
                    level,
                })
                .collect();
            drop(inner);
            self.resource_manager.acquire_wake_lock(self.id);
            self.emit_success(0, confidence_levels, None, detection.indices.2 as u64);
            self.arm_deferred_stop(DEFAULT_DELAY);
            if let Some(stage1) = stage1 {
                stage1.finish_detection(self.id);
            }
        } else {
            inner.state = State::Buffering;
            if let Some(reader) = inner.lab_reader.as_mut() {
                reader.update_state(ReaderLifecycle::Enabled);
            }
            for slot in &inner.stage2 {
                slot.engine.set_detected(true);
            }
            drop(inner);
            self.resource_manager.acquire_wake_lock(self.id);
            self.resource_manager.vote_sleep_monitor(self.id, true, false);
            self.arm_deferred_stop(LAB_DELAY);
        }
    }
}

fn synthetic_miid(stream_id: u64) -> u32 {
    (stream_id as u32).wrapping_mul(2_654_435_761).max(1)
}

fn default_confidence(cfg: &RecognitionConfig) -> u8 {
    cfg.confidence_levels.first().map(|c| c.level).unwrap_or(50)
}
