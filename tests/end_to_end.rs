//! End-to-end exercises of the full stream/engine1/engine2 pipeline, driven
//! through synthetic DSP events exactly as a real vendor DSP session would
//! deliver them — not by calling `Stream::on_gmm_detected` directly, so the
//! ring-buffer index publication and stage-2 read-window math get a faithful
//! workout.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;

use sthal_core::config::CaptureProfile;
use sthal_core::dsp::{DspEvent, DspSession, FakeDspSession};
use sthal_core::engine2::AlgorithmKind;
use sthal_core::error::Result;
use sthal_core::model::{F_STAGE_GMM, S_STAGE_PDK, S_STAGE_USER};
use sthal_core::plugin::{ParamId, PluginHandle, Stage2Plugin};
use sthal_core::registry::RecognitionRegistry;
use sthal_core::resource::InMemoryResourceManager;
use sthal_core::vui::TlvVui;
use sthal_core::{default_plugin_factory, AbortReason, ClientEvent, Stream};
use sthal_core::stream::State;

const SML_MAGIC: u32 = 0x0018_0CC8;
const SML_HEADER_VERSION: u16 = 3;
const SML_MODEL_VERSION: u16 = 0x0300;
const HEADER_LEN: usize = 12;
const BIG_MODEL_ENTRY_LEN: usize = 16;

/// Build a synthetic sound-model blob naming one big-model entry per
/// `(type, size)` pair — duplicated here rather than imported from the
/// library's own `#[cfg(test)]` helper, which integration tests can't see.
fn build_blob(models: &[(u16, u32)]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&SML_MAGIC.to_le_bytes());
    buf.extend_from_slice(&SML_HEADER_VERSION.to_le_bytes());
    buf.extend_from_slice(&SML_MODEL_VERSION.to_le_bytes());
    buf.push(models.len() as u8);
    buf.extend_from_slice(&[0u8; 3]);

    let payload_start = HEADER_LEN + models.len() * BIG_MODEL_ENTRY_LEN;
    let mut payload = Vec::new();
    let mut offsets = Vec::new();
    for (_, size) in models {
        offsets.push(payload_start as u32 + payload.len() as u32);
        payload.extend(vec![0xABu8; *size as usize]);
    }

    for (i, (ty, size)) in models.iter().enumerate() {
        buf.extend_from_slice(&1u16.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf.extend_from_slice(&offsets[i].to_le_bytes());
        buf.extend_from_slice(&size.to_le_bytes());
        buf.extend_from_slice(&ty.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());
    }

    buf.extend_from_slice(&payload);
    buf
}

fn gmm_only_blob() -> Vec<u8> {
    build_blob(&[(F_STAGE_GMM as u16, 16)])
}

fn two_stage_blob() -> Vec<u8> {
    build_blob(&[
        (F_STAGE_GMM as u16, 16),
        (S_STAGE_PDK as u16, 16),
        (S_STAGE_USER as u16, 16),
    ])
}

/// Lets test code retain a handle to the `FakeDspSession` a `Stream`
/// consumed via its `dsp_factory` closure, so PCM and detection events can
/// be injected from outside after construction.
#[derive(Clone)]
struct SharedFakeDsp(Arc<StdMutex<FakeDspSession>>);

impl SharedFakeDsp {
    fn new() -> Self {
        Self(Arc::new(StdMutex::new(FakeDspSession::new())))
    }

    fn push_pcm(&self, bytes: &[u8]) {
        self.0.lock().unwrap().push_pcm(bytes);
    }

    fn emit_event(&self, event: DspEvent) {
        self.0.lock().unwrap().emit_event(event);
    }

    fn is_started(&self) -> bool {
        self.0.lock().unwrap().is_started()
    }

    fn is_opened(&self) -> bool {
        self.0.lock().unwrap().is_opened()
    }
}

impl DspSession for SharedFakeDsp {
    fn open(&mut self, profile: &CaptureProfile) -> Result<()> {
        self.0.lock().unwrap().open(profile)
    }
    fn close(&mut self) -> Result<()> {
        self.0.lock().unwrap().close()
    }
    fn start(&mut self) -> Result<()> {
        self.0.lock().unwrap().start()
    }
    fn stop(&mut self) -> Result<()> {
        self.0.lock().unwrap().stop()
    }
    fn set_param(&mut self, tag: u32, miid: u32, payload: &[u8]) -> Result<()> {
        self.0.lock().unwrap().set_param(tag, miid, payload)
    }
    fn get_param(&mut self, tag: u32, miid: u32) -> Result<Vec<u8>> {
        self.0.lock().unwrap().get_param(tag, miid)
    }
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.0.lock().unwrap().read(buf)
    }
    fn register_callback(&mut self, sender: Sender<DspEvent>) -> Result<()> {
        self.0.lock().unwrap().register_callback(sender)
    }
}

/// A deterministic stage-2 plugin that reports a detection, at a fixed
/// confidence, as soon as it has seen any non-empty frame window.
struct InstantDetectPlugin {
    confidence: u8,
    detected: bool,
}

impl InstantDetectPlugin {
    fn new(confidence: u8) -> Self {
        Self {
            confidence,
            detected: false,
        }
    }
}

impl Stage2Plugin for InstantDetectPlugin {
    fn init(&mut self, _model_bytes: &[u8]) -> Result<()> {
        self.detected = false;
        Ok(())
    }

    fn process(&mut self, frames: &[f32]) -> Result<()> {
        if !frames.is_empty() {
            self.detected = true;
        }
        Ok(())
    }

    fn set_param(&mut self, id: ParamId, _payload: &[u8]) -> Result<()> {
        if id == ParamId::ReinitAll {
            self.detected = false;
        }
        Ok(())
    }

    fn get_param(&mut self, id: ParamId) -> Result<Vec<u8>> {
        match id {
            ParamId::Result => Ok(vec![self.detected as u8, self.confidence]),
            _ => Ok(Vec::new()),
        }
    }

    fn end(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A stage-2 plugin that never detects — drives the read window to exhaust
/// its whole budget and report a clean reject.
struct NeverDetectPlugin;

impl Stage2Plugin for NeverDetectPlugin {
    fn init(&mut self, _model_bytes: &[u8]) -> Result<()> {
        Ok(())
    }
    fn process(&mut self, _frames: &[f32]) -> Result<()> {
        Ok(())
    }
    fn set_param(&mut self, _id: ParamId, _payload: &[u8]) -> Result<()> {
        Ok(())
    }
    fn get_param(&mut self, id: ParamId) -> Result<Vec<u8>> {
        match id {
            ParamId::Result => Ok(vec![0, 0]),
            _ => Ok(Vec::new()),
        }
    }
    fn end(&mut self) -> Result<()> {
        Ok(())
    }
}

fn load_loud_pcm(dsp: &SharedFakeDsp, bytes: usize) {
    let loud: Vec<u8> = (0..bytes / 2)
        .flat_map(|_| 30_000i16.to_le_bytes())
        .collect();
    dsp.push_pcm(&loud);
}

fn recv_event(rx: &std::sync::mpsc::Receiver<ClientEvent>) -> ClientEvent {
    rx.recv_timeout(Duration::from_secs(2))
        .expect("expected a client callback within 2s")
}

fn wait_for_state(stream: &Arc<Stream>, state: State, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if stream.state() == state {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn scenario_1_happy_path_single_stage() {
    let registry = Arc::new(RecognitionRegistry::new());
    let resource_manager = Arc::new(InMemoryResourceManager::new());
    let vui = Arc::new(TlvVui::new());
    let dsp = SharedFakeDsp::new();
    let dsp_for_factory = dsp.clone();

    let blob = gmm_only_blob();
    let stream = Stream::load_sound_model(
        1,
        &blob,
        1,
        registry,
        resource_manager,
        vui,
        move || Box::new(dsp_for_factory),
        &default_plugin_factory,
    )
    .unwrap();

    let (tx, rx) = std::sync::mpsc::channel();
    stream.register_callback(move |event| {
        let _ = tx.send(event);
    });

    stream.start().unwrap();
    assert_eq!(stream.state(), State::Active);

    dsp.emit_event(DspEvent::GenericInfo {
        miid: stream.miid(),
        confidence_levels: vec![80],
        timestamp_ms: 0,
        indices: (0, 0, 0),
    });

    let event = recv_event(&rx);
    assert!(matches!(event, ClientEvent::Success { stream_id: 1, .. }));
    assert_eq!(stream.state(), State::Detected);

    // Default deferred-stop delay is 1000ms; give it margin.
    assert!(wait_for_state(&stream, State::Loaded, Duration::from_millis(2000)));
}

#[test]
fn scenario_2_two_stage_success_reaches_buffering() {
    let registry = Arc::new(RecognitionRegistry::new());
    let resource_manager = Arc::new(InMemoryResourceManager::new());
    let vui = Arc::new(TlvVui::new());
    let dsp = SharedFakeDsp::new();
    let dsp_for_factory = dsp.clone();

    let plugin_factory = |algorithm: AlgorithmKind| -> PluginHandle {
        match algorithm {
            AlgorithmKind::KeywordDetection => PluginHandle::new(InstantDetectPlugin::new(72)),
            AlgorithmKind::UserVerification => PluginHandle::new(InstantDetectPlugin::new(85)),
            AlgorithmKind::Custom => PluginHandle::new(InstantDetectPlugin::new(0)),
        }
    };

    let blob = two_stage_blob();
    let stream = Stream::load_sound_model(
        2,
        &blob,
        1,
        registry,
        resource_manager,
        vui,
        move || Box::new(dsp_for_factory),
        &plugin_factory,
    )
    .unwrap();

    stream.recognition_config(&[], true, 1, Vec::new()).unwrap();

    let (tx, rx) = std::sync::mpsc::channel();
    stream.register_callback(move |event| {
        let _ = tx.send(event);
    });

    stream.start().unwrap();
    load_loud_pcm(&dsp, 100_000);

    dsp.emit_event(DspEvent::GenericInfo {
        miid: stream.miid(),
        confidence_levels: vec![80],
        timestamp_ms: 0,
        indices: (16_000, 32_000, 32_000),
    });

    let event = recv_event(&rx);
    assert!(matches!(event, ClientEvent::Success { stream_id: 2, .. }));
    assert_eq!(stream.state(), State::Buffering);
}

#[test]
fn scenario_3_two_stage_reject_not_notified() {
    let registry = Arc::new(RecognitionRegistry::new());
    let resource_manager = Arc::new(InMemoryResourceManager::new());
    let vui = Arc::new(TlvVui::new());
    let dsp = SharedFakeDsp::new();
    let dsp_for_factory = dsp.clone();

    let plugin_factory = |algorithm: AlgorithmKind| -> PluginHandle {
        match algorithm {
            AlgorithmKind::KeywordDetection => PluginHandle::new(NeverDetectPlugin),
            AlgorithmKind::UserVerification => PluginHandle::new(InstantDetectPlugin::new(85)),
            AlgorithmKind::Custom => PluginHandle::new(NeverDetectPlugin),
        }
    };

    let blob = two_stage_blob();
    let stream = Stream::load_sound_model(
        3,
        &blob,
        1,
        registry,
        resource_manager,
        vui,
        move || Box::new(dsp_for_factory),
        &plugin_factory,
    )
    .unwrap();

    stream.recognition_config(&[], true, 1, Vec::new()).unwrap();

    let (tx, rx) = std::sync::mpsc::channel();
    stream.register_callback(move |event| {
        let _ = tx.send(event);
    });

    stream.start().unwrap();
    load_loud_pcm(&dsp, 100_000);

    dsp.emit_event(DspEvent::GenericInfo {
        miid: stream.miid(),
        confidence_levels: vec![80],
        timestamp_ms: 0,
        indices: (16_000, 32_000, 32_000),
    });

    assert!(wait_for_state(&stream, State::Active, Duration::from_secs(2)));
    assert!(rx.try_recv().is_err(), "rejected second stage must not notify the client");
}

#[test]
fn scenario_4_concurrent_pause_and_resume() {
    let registry = Arc::new(RecognitionRegistry::new());
    let resource_manager = Arc::new(InMemoryResourceManager::new());
    let vui = Arc::new(TlvVui::new());
    let dsp = SharedFakeDsp::new();
    let dsp_for_factory = dsp.clone();

    let blob = gmm_only_blob();
    let stream = Stream::load_sound_model(
        4,
        &blob,
        1,
        registry,
        resource_manager,
        vui,
        move || Box::new(dsp_for_factory),
        &default_plugin_factory,
    )
    .unwrap();

    let (tx, rx) = std::sync::mpsc::channel();
    stream.register_callback(move |event| {
        let _ = tx.send(event);
    });

    stream.start().unwrap();
    assert!(dsp.is_started());

    stream.pause().unwrap();
    let event = recv_event(&rx);
    assert!(matches!(
        event,
        ClientEvent::Abort {
            stream_id: 4,
            reason: AbortReason::ConcurrentCapture
        }
    ));
    assert_eq!(stream.state(), State::Loaded);
    assert!(stream.paused());
    assert!(!dsp.is_started());

    stream.internal_resume().unwrap();
    assert_eq!(stream.state(), State::Active);
    assert!(!stream.paused());
    assert!(dsp.is_started());
    assert!(rx.try_recv().is_err(), "internal resume must not notify the client");
}

#[test]
fn scenario_5_device_switch_mid_buffering() {
    let registry = Arc::new(RecognitionRegistry::new());
    let resource_manager = Arc::new(InMemoryResourceManager::new());
    let vui = Arc::new(TlvVui::new());
    let dsp = SharedFakeDsp::new();
    let dsp_for_factory = dsp.clone();

    let plugin_factory = |algorithm: AlgorithmKind| -> PluginHandle {
        match algorithm {
            AlgorithmKind::KeywordDetection => PluginHandle::new(InstantDetectPlugin::new(72)),
            AlgorithmKind::UserVerification => PluginHandle::new(InstantDetectPlugin::new(85)),
            AlgorithmKind::Custom => PluginHandle::new(InstantDetectPlugin::new(0)),
        }
    };

    let blob = two_stage_blob();
    let stream = Stream::load_sound_model(
        5,
        &blob,
        1,
        registry,
        resource_manager,
        vui,
        move || Box::new(dsp_for_factory),
        &plugin_factory,
    )
    .unwrap();

    stream.recognition_config(&[], true, 1, Vec::new()).unwrap();
    stream.start().unwrap();
    stream.device_connected(100).unwrap(); // establishes the stream's device id while Active

    load_loud_pcm(&dsp, 100_000);
    dsp.emit_event(DspEvent::GenericInfo {
        miid: stream.miid(),
        confidence_levels: vec![80],
        timestamp_ms: 0,
        indices: (16_000, 32_000, 32_000),
    });
    assert!(wait_for_state(&stream, State::Buffering, Duration::from_secs(2)));

    stream.device_disconnected(100).unwrap();
    stream.device_connected(200).unwrap();

    assert_eq!(stream.state(), State::Active);
}

#[test]
fn scenario_6_ssr_during_detection_restores_active() {
    let registry = Arc::new(RecognitionRegistry::new());
    let resource_manager = Arc::new(InMemoryResourceManager::new());
    let vui = Arc::new(TlvVui::new());
    let dsp = SharedFakeDsp::new();
    let dsp_for_factory = dsp.clone();

    let plugin_factory = |algorithm: AlgorithmKind| -> PluginHandle {
        match algorithm {
            AlgorithmKind::KeywordDetection => PluginHandle::new(InstantDetectPlugin::new(72)),
            AlgorithmKind::UserVerification => PluginHandle::new(InstantDetectPlugin::new(85)),
            AlgorithmKind::Custom => PluginHandle::new(InstantDetectPlugin::new(0)),
        }
    };

    let blob = two_stage_blob();
    let stream = Stream::load_sound_model(
        6,
        &blob,
        1,
        registry,
        resource_manager,
        vui,
        move || Box::new(dsp_for_factory),
        &plugin_factory,
    )
    .unwrap();

    stream.recognition_config(&[], true, 1, Vec::new()).unwrap();

    let (tx, rx) = std::sync::mpsc::channel();
    stream.register_callback(move |event| {
        let _ = tx.send(event);
    });

    stream.start().unwrap();
    load_loud_pcm(&dsp, 100_000);
    dsp.emit_event(DspEvent::GenericInfo {
        miid: stream.miid(),
        confidence_levels: vec![80],
        timestamp_ms: 0,
        indices: (16_000, 32_000, 32_000),
    });
    assert!(wait_for_state(&stream, State::Buffering, Duration::from_secs(2)));
    let _ = recv_event(&rx); // stage-2 confirmation arrives once both engines finish

    stream.ssr_offline().unwrap();
    assert_eq!(stream.state(), State::Ssr);
    let event = recv_event(&rx);
    assert!(matches!(
        event,
        ClientEvent::Abort {
            stream_id: 6,
            reason: AbortReason::ServiceRestart
        }
    ));
    assert!(!dsp.is_opened());

    stream.ssr_online().unwrap();
    assert_eq!(stream.state(), State::Active);
    assert!(dsp.is_opened());
    assert!(dsp.is_started());
}

#[test]
fn scenario_7_stage2_reject_notified_when_platform_opts_in() {
    let registry = Arc::new(RecognitionRegistry::new());
    let resource_manager = Arc::new(InMemoryResourceManager::new());
    let vui = Arc::new(TlvVui::new());
    let dsp = SharedFakeDsp::new();
    let dsp_for_factory = dsp.clone();

    let plugin_factory = |algorithm: AlgorithmKind| -> PluginHandle {
        match algorithm {
            AlgorithmKind::KeywordDetection => PluginHandle::new(NeverDetectPlugin),
            AlgorithmKind::UserVerification => PluginHandle::new(InstantDetectPlugin::new(85)),
            AlgorithmKind::Custom => PluginHandle::new(NeverDetectPlugin),
        }
    };

    let blob = two_stage_blob();
    let stream = Stream::load_sound_model(
        7,
        &blob,
        1,
        registry,
        resource_manager,
        vui,
        move || Box::new(dsp_for_factory),
        &plugin_factory,
    )
    .unwrap();

    stream.recognition_config(&[], true, 1, Vec::new()).unwrap();
    stream.set_notify_stage2_reject(true);

    let (tx, rx) = std::sync::mpsc::channel();
    stream.register_callback(move |event| {
        let _ = tx.send(event);
    });

    stream.start().unwrap();
    load_loud_pcm(&dsp, 100_000);
    dsp.emit_event(DspEvent::GenericInfo {
        miid: stream.miid(),
        confidence_levels: vec![80],
        timestamp_ms: 0,
        indices: (16_000, 32_000, 32_000),
    });

    let event = recv_event(&rx);
    assert!(matches!(
        event,
        ClientEvent::Failure { stream_id: 7, .. }
    ));
    assert!(wait_for_state(&stream, State::Active, Duration::from_secs(2)));
}

#[test]
fn scenario_8_mutating_events_rejected_during_ssr() {
    let blob = two_stage_blob();
    let registry = Arc::new(RecognitionRegistry::new());
    let resource_manager = Arc::new(InMemoryResourceManager::new());
    let vui = Arc::new(TlvVui::new());
    let dsp = SharedFakeDsp::new();
    let dsp_for_factory = dsp.clone();

    let stream = Stream::load_sound_model(
        8,
        &blob,
        1,
        registry,
        resource_manager,
        vui,
        move || Box::new(dsp_for_factory),
        &default_plugin_factory,
    )
    .unwrap();

    stream.start().unwrap();
    stream.ssr_offline().unwrap();
    assert_eq!(stream.state(), State::Ssr);

    assert!(matches!(stream.stop(), Err(sthal_core::SoundTriggerError::SsrInProgress)));
    assert!(matches!(stream.start(), Err(sthal_core::SoundTriggerError::SsrInProgress)));
    assert_eq!(stream.state(), State::Ssr);

    stream.ssr_online().unwrap();
    assert_eq!(stream.state(), State::Active);
}
