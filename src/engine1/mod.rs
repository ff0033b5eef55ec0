//! Stage-1 shared detection engine (spec.md §4.2).
//!
//! One instance per `module_type`, shared by every stream that has loaded a
//! model of that type. Owns the DSP session, multiplexes streams, runs the
//! event-dispatch thread that drains the DSP callback queue, and owns the
//! [`RingBuffer`] that fans PCM out to every attached stream's stage-2
//! engines and LAB reader.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::buffering::{ReaderId, RingBuffer};
use crate::config::CaptureProfile;
use crate::dsp::{DspEvent, DspSession};
use crate::error::{Result, SoundTriggerError};
use crate::registry::GlobalDetectionGate;

/// Sub-state machine for the shared engine (spec.md §4.2 "Sub-state
/// machine"). Advances to `Active` as soon as any attached stream starts,
/// recedes to `Loaded` when the last one stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage1State {
    Idle,
    Loaded,
    Active,
    Buffering,
    Detected,
}

/// Normalized fields forwarded to a stream on a first-stage detection
/// (spec.md §4.2 "Event dispatch").
#[derive(Debug, Clone)]
pub struct GmmDetection {
    pub stream_id: u64,
    pub confidence_levels: Vec<u8>,
    pub indices: (usize, usize, usize),
}

/// A stream's view of a first-stage detection (spec.md §4.2 "invokes the
/// stream's `set_engine_detection_state(GMM_DETECTED)`"). Implemented by
/// the per-stream state machine; kept as a trait so `engine1` does not
/// depend on `stream`.
pub trait DetectionSink: Send + Sync {
    fn on_gmm_detected(&self, detection: GmmDetection);
}

struct AttachedStream {
    sink: Arc<dyn DetectionSink>,
    reader_ids: Vec<ReaderId>,
    miid: Option<u32>,
    active: bool,
    history_ms: u32,
    preroll_ms: u32,
}

struct EngineState {
    sub_state: Stage1State,
    streams: HashMap<u64, AttachedStream>,
    miid_to_stream: HashMap<u32, u64>,
    /// Streams whose detection arrived while another stream was already
    /// `buffering`/`detected` — replayed in order once the gate frees up.
    queued_events: VecDeque<DspEvent>,
    currently_detecting: Option<u64>,
    profile: CaptureProfile,
    ec_refcount: u32,
    ec_rx_dev: Option<u32>,
}

/// One shared stage-1 engine (spec.md §3 "Engine (stage 1)").
pub struct Stage1Engine {
    module_type: u32,
    dsp: Mutex<Box<dyn DspSession>>,
    ring: RingBuffer,
    state: Mutex<EngineState>,
    gate: Arc<dyn GlobalDetectionGate>,
    supports_multi_model: bool,
    dispatch_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    pcm_pump: Mutex<Option<std::thread::JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
}

impl Stage1Engine {
    pub fn new(
        module_type: u32,
        mut dsp: Box<dyn DspSession>,
        gate: Arc<dyn GlobalDetectionGate>,
        ring_capacity: usize,
        supports_multi_model: bool,
    ) -> Arc<Self> {
        let (tx, rx) = unbounded();
        let _ = dsp.register_callback(tx);

        let engine = Arc::new(Self {
            module_type,
            dsp: Mutex::new(dsp),
            ring: RingBuffer::new(ring_capacity),
            state: Mutex::new(EngineState {
                sub_state: Stage1State::Idle,
                streams: HashMap::new(),
                miid_to_stream: HashMap::new(),
                queued_events: VecDeque::new(),
                currently_detecting: None,
                profile: CaptureProfile::default(),
                ec_refcount: 0,
                ec_rx_dev: None,
            }),
            gate,
            supports_multi_model,
            dispatch_thread: Mutex::new(None),
            pcm_pump: Mutex::new(None),
            shutdown: Arc::new(AtomicBool::new(false)),
        });

        let dispatcher = Arc::clone(&engine);
        let handle = std::thread::spawn(move || dispatcher.dispatch_loop(rx));
        *engine.dispatch_thread.lock() = Some(handle);

        let pump = Arc::clone(&engine);
        let pump_handle = std::thread::spawn(move || pump.pcm_pump_loop());
        *engine.pcm_pump.lock() = Some(pump_handle);

        engine
    }

    pub fn module_type(&self) -> u32 {
        self.module_type
    }

    pub fn ring(&self) -> &RingBuffer {
        &self.ring
    }

    pub fn stream_count(&self) -> usize {
        self.state.lock().streams.len()
    }

    pub fn merged_profile(&self) -> CaptureProfile {
        self.state.lock().profile.clone()
    }

    /// Register a reader (LAB or a stage-2 engine's) as belonging to
    /// `stream_id`'s engine chain, so index publication reaches it (spec.md
    /// §4.4 "Index publication").
    pub fn register_reader(&self, stream_id: u64, reader_id: ReaderId) {
        if let Some(stream) = self.state.lock().streams.get_mut(&stream_id) {
            stream.reader_ids.push(reader_id);
        }
    }

    /// Attach a sound model for `stream_id` (spec.md §4.2 "load").
    pub fn load(
        &self,
        stream_id: u64,
        sink: Arc<dyn DetectionSink>,
        miid: u32,
        profile: &CaptureProfile,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let is_first = state.streams.is_empty();

        if !is_first && !self.supports_multi_model {
            return Err(SoundTriggerError::InvalidArgument(format!(
                "module {} does not support multi-model load",
                self.module_type
            )));
        }

        state.profile = state.profile.merge_max(profile);
        if is_first {
            self.dsp.lock().open(&state.profile)?;
            state.sub_state = Stage1State::Loaded;
        }

        state.miid_to_stream.insert(miid, stream_id);
        state.streams.insert(
            stream_id,
            AttachedStream {
                sink,
                reader_ids: Vec::new(),
                miid: Some(miid),
                active: false,
                history_ms: 0,
                preroll_ms: 0,
            },
        );
        info!(stream_id, module_type = self.module_type, "stage-1 load");
        Ok(())
    }

    /// Detach `stream_id`; tears the DSP graph down once the last stream
    /// leaves (spec.md §4.2 "unload").
    pub fn unload(&self, stream_id: u64) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(stream) = state.streams.remove(&stream_id) {
            if let Some(miid) = stream.miid {
                state.miid_to_stream.remove(&miid);
            }
        }
        if state.streams.is_empty() {
            self.dsp.lock().close()?;
            state.sub_state = Stage1State::Idle;
        }
        Ok(())
    }

    /// Reference-counted start: issues the DSP `start` only for the first
    /// stream to become active (spec.md §4.2 "start/stop").
    pub fn start(&self, stream_id: u64) -> Result<()> {
        let mut state = self.state.lock();
        let was_any_active = state.streams.values().any(|s| s.active);
        let stream = state
            .streams
            .get_mut(&stream_id)
            .ok_or_else(|| SoundTriggerError::InvalidArgument("unknown stream".into()))?;
        if stream.active {
            return Ok(());
        }
        stream.active = true;
        if !was_any_active {
            self.dsp.lock().start()?;
            state.sub_state = Stage1State::Active;
        }
        Ok(())
    }

    /// Reference-counted stop: issues the DSP `stop` only once the last
    /// active stream stops.
    pub fn stop(&self, stream_id: u64) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(stream) = state.streams.get_mut(&stream_id) {
            stream.active = false;
        }
        let any_active = state.streams.values().any(|s| s.active);
        if !any_active {
            self.dsp.lock().stop()?;
            if state.sub_state != Stage1State::Idle {
                state.sub_state = Stage1State::Loaded;
            }
        }
        Ok(())
    }

    /// Merge-max the buffer config across streams and push to DSP (spec.md
    /// §4.2 "update_buf_config"). Ring capacity is fixed at construction;
    /// this tracks the logical config so future ring sizing decisions have
    /// somewhere to read from.
    pub fn update_buf_config(&self, stream_id: u64, history_ms: u32, preroll_ms: u32) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(stream) = state.streams.get_mut(&stream_id) {
            stream.history_ms = history_ms;
            stream.preroll_ms = preroll_ms;
        }
        Ok(())
    }

    pub fn setup_session_device(&self, _stream_id: u64, _device_id: u32) -> Result<()> {
        Ok(())
    }

    pub fn connect_session_device(&self, _stream_id: u64, _device_id: u32) -> Result<()> {
        Ok(())
    }

    pub fn disconnect_session_device(&self, _stream_id: u64, _device_id: u32) -> Result<()> {
        Ok(())
    }

    /// Refcounted echo-reference binding: first `enable` programs the
    /// module, last `disable` clears it (spec.md §4.2 "set_ec_ref").
    pub fn set_ec_ref(&self, _stream_id: u64, rx_dev: u32, enable: bool, first_time: bool) -> Result<()> {
        let mut state = self.state.lock();
        if enable {
            if first_time || state.ec_refcount == 0 {
                self.dsp.lock().set_param(EC_REF_TAG, 0, &rx_dev.to_le_bytes())?;
                state.ec_rx_dev = Some(rx_dev);
            }
            state.ec_refcount += 1;
        } else if state.ec_refcount > 0 {
            state.ec_refcount -= 1;
            if state.ec_refcount == 0 {
                self.dsp.lock().set_param(EC_REF_TAG, 0, &[])?;
                state.ec_rx_dev = None;
            }
        }
        Ok(())
    }

    /// Tear down and re-open the graph using the current shared capture
    /// profile without losing streams' loaded state (spec.md §4.2
    /// "reconfigure_detection_graph").
    pub fn reconfigure_detection_graph(&self, _stream_id: u64) -> Result<()> {
        let state = self.state.lock();
        let profile = state.profile.clone();
        drop(state);
        let mut dsp = self.dsp.lock();
        dsp.close()?;
        dsp.open(&profile)?;
        Ok(())
    }

    pub fn get_parameters(&self, tag: u32, miid: u32) -> Result<Vec<u8>> {
        self.dsp.lock().get_param(tag, miid)
    }

    /// Called by the stream (via its stage-2 engines finishing, or directly
    /// on reject/success) once a detection lifecycle is over. Releases the
    /// global gate and replays the next queued detection, if any (spec.md
    /// §4.2 "Concurrent detections... are serialized").
    pub fn finish_detection(&self, stream_id: u64) {
        self.gate.release(stream_id);
        let next_event = {
            let mut state = self.state.lock();
            if state.currently_detecting == Some(stream_id) {
                state.currently_detecting = None;
                if state.sub_state == Stage1State::Buffering || state.sub_state == Stage1State::Detected {
                    state.sub_state = Stage1State::Active;
                }
            }
            state.queued_events.pop_front()
        };
        if let Some(event) = next_event {
            self.dispatch_event(event);
        }
    }

    fn dispatch_loop(self: Arc<Self>, rx: Receiver<DspEvent>) {
        for event in rx.iter() {
            self.dispatch_event(event);
        }
    }

    /// Continuously drains PCM out of the DSP session into the shared ring
    /// (spec.md §4.4 "the writer... draining DSP PCM"). Runs independent of
    /// sub-state — a session with no attached streams simply drains zero
    /// bytes every poll.
    fn pcm_pump_loop(self: Arc<Self>) {
        let writer = self.ring.writer();
        let mut buf = vec![0u8; 4096];
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return;
            }
            let n = self.dsp.lock().read(&mut buf).unwrap_or(0);
            if n > 0 {
                writer.write(&buf[..n]);
            } else {
                std::thread::sleep(Duration::from_millis(10));
            }
        }
    }

    fn dispatch_event(&self, event: DspEvent) {
        let miid = event.miid();
        let stream_id = {
            let state = self.state.lock();
            state.miid_to_stream.get(&miid).copied()
        };
        let Some(stream_id) = stream_id else {
            warn!(miid, "stage-1 event for unknown MIID; dropping");
            return;
        };

        if !self.gate.try_acquire(stream_id) {
            debug!(stream_id, "detection queued behind another active stream");
            self.state.lock().queued_events.push_back(event);
            return;
        }

        let (confidence_levels, indices) = match &event {
            DspEvent::GenericInfo {
                confidence_levels,
                indices,
                ..
            } => (confidence_levels.clone(), *indices),
            DspEvent::MmaDetection { stats, indices, .. } => {
                (stats.iter().map(|s| s.best_confidence).collect(), *indices)
            }
        };

        let sink = {
            let mut state = self.state.lock();
            state.currently_detecting = Some(stream_id);
            state.sub_state = Stage1State::Buffering;
            let Some(stream) = state.streams.get(&stream_id) else {
                drop(state);
                self.gate.release(stream_id);
                return;
            };
            self.ring.publish_indices(&stream.reader_ids, indices);
            Arc::clone(&stream.sink)
        };

        sink.on_gmm_detected(GmmDetection {
            stream_id,
            confidence_levels,
            indices,
        });
    }
}

/// Placeholder parameter tag for the echo-reference binding — real values
/// are vendor-defined and out of this crate's scope (spec.md §1 "Out of
/// scope").
const EC_REF_TAG: u32 = 0xEC_0001;

impl Drop for Stage1Engine {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.pcm_pump.lock().take() {
            let _ = handle.join();
        }
        // The dispatch thread exits once the DSP session's sender is
        // dropped and the channel drains; nothing else to signal here.
        if let Some(handle) = self.dispatch_thread.lock().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::FakeDspSession;
    use crate::registry::DetectionGate;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct RecordingSink {
        events: StdMutex<Vec<GmmDetection>>,
    }

    impl DetectionSink for RecordingSink {
        fn on_gmm_detected(&self, detection: GmmDetection) {
            self.events.lock().unwrap().push(detection);
        }
    }

    #[test]
    fn load_opens_dsp_session_on_first_stream() {
        let dsp = FakeDspSession::new();
        let gate = Arc::new(DetectionGate::new());
        let engine = Stage1Engine::new(1, Box::new(dsp), gate, 4096, false);
        let sink = Arc::new(RecordingSink {
            events: StdMutex::new(Vec::new()),
        });
        engine.load(1, sink, 10, &CaptureProfile::default()).unwrap();
        assert_eq!(engine.stream_count(), 1);
    }

    #[test]
    fn second_stream_rejected_without_multi_model_support() {
        let dsp = FakeDspSession::new();
        let gate = Arc::new(DetectionGate::new());
        let engine = Stage1Engine::new(1, Box::new(dsp), gate, 4096, false);
        let sink = Arc::new(RecordingSink {
            events: StdMutex::new(Vec::new()),
        });
        engine.load(1, Arc::clone(&sink) as Arc<dyn DetectionSink>, 10, &CaptureProfile::default()).unwrap();
        let result = engine.load(2, sink, 11, &CaptureProfile::default());
        assert!(result.is_err());
    }

    #[test]
    fn start_stop_are_reference_counted() {
        let dsp = FakeDspSession::new();
        let gate = Arc::new(DetectionGate::new());
        let engine = Stage1Engine::new(1, Box::new(dsp), gate, 4096, true);
        let sink = Arc::new(RecordingSink {
            events: StdMutex::new(Vec::new()),
        });
        engine.load(1, Arc::clone(&sink) as Arc<dyn DetectionSink>, 10, &CaptureProfile::default()).unwrap();
        engine.load(2, sink, 11, &CaptureProfile::default()).unwrap();
        engine.start(1).unwrap();
        engine.start(2).unwrap();
        engine.stop(1).unwrap();
        engine.stop(2).unwrap();
    }

    #[test]
    fn concurrent_detections_on_same_engine_are_serialized() {
        let _ = AtomicUsize::new(0);
        let dsp = FakeDspSession::new();
        let gate = Arc::new(DetectionGate::new());
        let engine = Stage1Engine::new(1, Box::new(dsp), gate, 4096, true);

        let sink_a = Arc::new(RecordingSink {
            events: StdMutex::new(Vec::new()),
        });
        let sink_b = Arc::new(RecordingSink {
            events: StdMutex::new(Vec::new()),
        });
        engine.load(1, Arc::clone(&sink_a) as Arc<dyn DetectionSink>, 10, &CaptureProfile::default()).unwrap();
        engine.load(2, Arc::clone(&sink_b) as Arc<dyn DetectionSink>, 11, &CaptureProfile::default()).unwrap();

        // Directly exercise dispatch_event rather than the DSP callback
        // channel, to keep the test deterministic.
        engine.dispatch_event(DspEvent::GenericInfo {
            miid: 10,
            confidence_levels: vec![80],
            timestamp_ms: 0,
            indices: (0, 100, 100),
        });
        engine.dispatch_event(DspEvent::GenericInfo {
            miid: 11,
            confidence_levels: vec![70],
            timestamp_ms: 0,
            indices: (0, 100, 100),
        });

        assert_eq!(sink_a.events.lock().unwrap().len(), 1);
        assert_eq!(sink_b.events.lock().unwrap().len(), 0, "second stream should be queued");

        engine.finish_detection(1);
        assert_eq!(sink_b.events.lock().unwrap().len(), 1, "queued detection replays once the first finishes");
    }
}
