//! Stage-2 verification engine (spec.md §4.3).
//!
//! One instance per `(stream, algorithm)` pair. Owns a ring-buffer reader,
//! a loaded [`PluginHandle`], and a worker thread that runs one algorithm
//! pass per detection: pull PCM from the reader, feed it to the plugin
//! frame-by-frame, and report success/reject back through `on_verdict`.
//!
//! The worker is cooperative, not preemptible — `exit_buffering` is polled
//! between frames, matching the source's behavior (spec.md §9 "open
//! questions": a stop racing a start drops the first detection — "stops win
//! on tie").

use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::buffering::{RingBuffer, RingReader, ReaderLifecycle};
use crate::config::{CaptureProfile, StageTolerances};
use crate::config::round_down_to_10ms;
use crate::error::{Result, SoundTriggerError};
use crate::plugin::{read_result, ParamId, PluginHandle};

/// Which algorithm this engine runs — determines the read-window formula
/// (spec.md §4.3 step 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlgorithmKind {
    KeywordDetection,
    UserVerification,
    Custom,
}

/// Current verdict state, mirroring the source's `idle|pending|success|reject`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Idle,
    Pending,
    Success,
    Reject,
}

/// Reported back to the stream when a worker pass completes while the
/// stream hasn't stopped meanwhile (spec.md §4.3 step 5).
#[derive(Debug, Clone, Copy)]
pub struct StageVerdict {
    pub algorithm: AlgorithmKind,
    pub success: bool,
    pub confidence: u8,
}

struct WorkerFlags {
    processing_started: bool,
    exit_buffering: bool,
    shutdown: bool,
    /// Bumped on every `set_detected`/`stop_recognition` so a worker pass
    /// that finishes after a later stop can tell its result is stale.
    generation: u64,
}

struct Stage2Shared {
    algorithm: AlgorithmKind,
    plugin: PluginHandle,
    reader: Mutex<RingReader>,
    tolerances: StageTolerances,
    profile: CaptureProfile,
    buffer_size_frames: usize,
    max_processing_bytes: usize,
    confidence_threshold: Mutex<u8>,
    verdict: Mutex<Verdict>,
    flags: Mutex<WorkerFlags>,
    cv: Condvar,
    on_verdict: Box<dyn Fn(StageVerdict) + Send + Sync>,
}

/// A per-`(stream, algorithm)` stage-2 engine (spec.md §3 "Engine (stage 2)").
pub struct Stage2Engine {
    shared: Arc<Stage2Shared>,
    worker: Option<JoinHandle<()>>,
    reader_id: crate::buffering::ReaderId,
}

impl Stage2Engine {
    /// Register a ring-buffer reader and spawn the worker thread. The
    /// engine is idle (reader `Prepared`, not `Enabled`) until
    /// `set_detected(true)` is called.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        algorithm: AlgorithmKind,
        plugin: PluginHandle,
        ring: &RingBuffer,
        tolerances: StageTolerances,
        profile: CaptureProfile,
        buffer_size_frames: usize,
        max_processing_bytes: usize,
        on_verdict: impl Fn(StageVerdict) + Send + Sync + 'static,
    ) -> Self {
        let reader_id = ring.add_reader();
        let reader = ring.reader(reader_id);

        let shared = Arc::new(Stage2Shared {
            algorithm,
            plugin,
            reader: Mutex::new(reader),
            tolerances,
            profile,
            buffer_size_frames,
            max_processing_bytes,
            confidence_threshold: Mutex::new(0),
            verdict: Mutex::new(Verdict::Idle),
            flags: Mutex::new(WorkerFlags {
                processing_started: false,
                exit_buffering: false,
                shutdown: false,
                generation: 0,
            }),
            cv: Condvar::new(),
            on_verdict: Box::new(on_verdict),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::spawn(move || Self::worker_loop(worker_shared));

        Self {
            shared,
            worker: Some(worker),
            reader_id,
        }
    }

    pub fn reader_id(&self) -> crate::buffering::ReaderId {
        self.reader_id
    }

    pub fn algorithm(&self) -> AlgorithmKind {
        self.shared.algorithm
    }

    /// Initialize the plugin with this stage's model bytes.
    pub fn load_sound_model(&self, model_bytes: &[u8]) -> Result<()> {
        self.shared.plugin.0.lock().init(model_bytes)
    }

    /// Apply the confidence threshold and reinit the plugin; mark `pending`.
    pub fn start_recognition(&self, confidence_threshold: u8) -> Result<()> {
        *self.shared.confidence_threshold.lock() = confidence_threshold;
        {
            let mut plugin = self.shared.plugin.0.lock();
            plugin.set_param(ParamId::ThresholdConfig, &[confidence_threshold])?;
            plugin.set_param(ParamId::ReinitAll, &[])?;
        }
        *self.shared.verdict.lock() = Verdict::Pending;
        Ok(())
    }

    /// Called by the stream when stage 1 has triggered: enables the reader
    /// and wakes the worker.
    pub fn set_detected(&self, detected: bool) {
        if !detected {
            return;
        }
        self.shared
            .reader
            .lock()
            .update_state(ReaderLifecycle::Enabled);
        let mut flags = self.shared.flags.lock();
        flags.generation += 1;
        flags.processing_started = true;
        flags.exit_buffering = false;
        drop(flags);
        self.shared.cv.notify_all();
    }

    /// Clear `processing_started`, set `exit_buffering`, and disable the
    /// reader (spec.md §4.3 "restart/stop_recognition").
    pub fn stop_recognition(&self) {
        {
            let mut flags = self.shared.flags.lock();
            flags.generation += 1;
            flags.processing_started = false;
            flags.exit_buffering = true;
        }
        self.shared
            .reader
            .lock()
            .update_state(ReaderLifecycle::Disabled);
        self.shared.cv.notify_all();
        *self.shared.verdict.lock() = Verdict::Idle;
    }

    /// Restart an already-active engine in place. Returns `RestartIgnored`
    /// if the engine was not in an active sub-state (`processing_started`
    /// false); spec.md's state machine falls back to `start_recognition` on
    /// that code rather than treating it as a hard failure.
    pub fn restart(&self, confidence_threshold: u8) -> Result<()> {
        if !self.shared.flags.lock().processing_started {
            return Err(SoundTriggerError::RestartIgnored);
        }
        self.stop_recognition();
        self.start_recognition(confidence_threshold)
    }

    pub fn verdict(&self) -> Verdict {
        *self.shared.verdict.lock()
    }

    fn worker_loop(shared: Arc<Stage2Shared>) {
        loop {
            let generation = {
                let mut flags = shared.flags.lock();
                loop {
                    if flags.shutdown {
                        return;
                    }
                    if flags.processing_started {
                        break;
                    }
                    shared.cv.wait(&mut flags);
                }
                if flags.shutdown {
                    return;
                }
                // "Stops win on tie": if exit_buffering was already set
                // before this pass ever started, drop the detection.
                if flags.exit_buffering {
                    flags.processing_started = false;
                    continue;
                }
                flags.generation
            };

            let outcome = Self::run_once(&shared, generation);

            let mut flags = shared.flags.lock();
            let stale = flags.generation != generation || !flags.processing_started;
            flags.processing_started = false;
            drop(flags);

            if stale {
                debug!("stage-2 pass finished after stream moved on; dropping verdict");
                continue;
            }

            if let Some(verdict) = outcome {
                *shared.verdict.lock() = if verdict.success {
                    Verdict::Success
                } else {
                    Verdict::Reject
                };
                (shared.on_verdict)(verdict);
            }
        }
    }

    /// One algorithm pass: compute the read window, stream PCM through the
    /// plugin, and return a verdict — or `None` if cancelled mid-flight
    /// (spec.md §4.3 "Cancellation").
    fn run_once(shared: &Arc<Stage2Shared>, generation: u64) -> Option<StageVerdict> {
        let (start, end, ftrt) = shared.reader.lock().get_indices();
        let tol = &shared.tolerances;
        let profile = &shared.profile;

        let (pre_start_offset, window_bytes) = match shared.algorithm {
            AlgorithmKind::UserVerification => {
                let pre = start.saturating_sub(tol.data_before_kw_start_bytes(profile));
                let window_end = end + tol.kw_end_tol_bytes(profile);
                (pre, window_end.saturating_sub(pre))
            }
            AlgorithmKind::KeywordDetection | AlgorithmKind::Custom => {
                let start_tol = tol.kw_start_tol_bytes(profile);
                let pre = if start > start_tol { start - start_tol } else { 0 };
                let window = (end.saturating_sub(start))
                    + tol.kw_start_tol_bytes(profile)
                    + tol.kw_end_tol_bytes(profile)
                    + tol.data_after_kw_end_bytes(profile);
                (pre, window)
            }
        };

        // ftrt caps how much PCM actually exists past the detection point;
        // the window formula above is a ceiling, not a guarantee.
        let ftrt_available = round_down_to_10ms(ftrt, profile);
        let read_budget = window_bytes.min(ftrt_available).min(shared.max_processing_bytes);

        {
            let mut reader = shared.reader.lock();
            reader.seek_absolute(pre_start_offset);
        }

        let frame_bytes =
            shared.buffer_size_frames * profile.bytes_per_sample() as usize * profile.channels.max(1) as usize;
        let mut byte_buf = vec![0u8; frame_bytes.max(2)];
        let mut total_read = 0usize;

        loop {
            if Self::is_cancelled(shared, generation) {
                debug!("stage-2 worker cancelled mid-window; dropping result");
                return None;
            }

            if shared.reader.lock().lifecycle() == ReaderLifecycle::Disabled {
                warn!("ring reader disabled mid-window; buffer gone");
                return None;
            }

            let remaining = read_budget.saturating_sub(total_read);
            if remaining == 0 {
                break;
            }
            let want = remaining.min(byte_buf.len());

            let n = shared.reader.lock().read(&mut byte_buf[..want]);
            if n == 0 {
                let got = shared
                    .reader
                    .lock()
                    .wait_for_buffers(1, std::time::Duration::from_millis(200));
                if !got {
                    // Contained to this worker (spec.md §9 "RingBufferUnderrun
                    // propagates up as IoError to the stage-2 worker only") —
                    // the stream never sees this, the pass just finishes on
                    // whatever PCM it already collected.
                    let err = SoundTriggerError::RingBufferUnderrun;
                    debug!(error = %err, "stage-2 read window starved of PCM before it filled");
                    break;
                }
                continue;
            }

            let samples = pcm_bytes_to_f32(&byte_buf[..n], profile.bit_width);
            if let Err(err) = shared.plugin.0.lock().process(&samples) {
                warn!(error = %err, "stage-2 plugin process failed");
                break;
            }
            total_read += n;

            let result = match read_result(&mut *shared.plugin.0.lock()) {
                Ok(r) => r,
                Err(err) => {
                    warn!(error = %err, "stage-2 plugin get_param(RESULT) failed");
                    break;
                }
            };
            if result.is_detected {
                let _ = shared.plugin.0.lock().set_param(ParamId::ReinitAll, &[]);
                return Some(StageVerdict {
                    algorithm: shared.algorithm,
                    success: true,
                    confidence: result.confidence,
                });
            }
        }

        let _ = shared.plugin.0.lock().set_param(ParamId::ReinitAll, &[]);
        Some(StageVerdict {
            algorithm: shared.algorithm,
            success: false,
            confidence: 0,
        })
    }

    fn is_cancelled(shared: &Arc<Stage2Shared>, generation: u64) -> bool {
        let flags = shared.flags.lock();
        flags.shutdown || flags.exit_buffering || flags.generation != generation
    }
}

/// Convert little-endian PCM bytes to normalized `f32` samples. Only 16-bit
/// is exercised in production; other widths fall back to a best-effort
/// byte-count-based read so the worker never panics on an unexpected
/// profile.
fn pcm_bytes_to_f32(bytes: &[u8], bit_width: u16) -> Vec<f32> {
    match bit_width {
        16 => bytes
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]) as f32 / i16::MAX as f32)
            .collect(),
        8 => bytes.iter().map(|&b| (b as f32 - 128.0) / 128.0).collect(),
        _ => bytes
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f32 / i32::MAX as f32)
            .collect(),
    }
}

impl Drop for Stage2Engine {
    fn drop(&mut self) {
        {
            let mut flags = self.shared.flags.lock();
            flags.shutdown = true;
        }
        self.shared.cv.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
