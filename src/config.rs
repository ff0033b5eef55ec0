//! Shared configuration and data-model types (spec.md §3, §6).
//!
//! These are plain data — no behavior — shared by the stream state machine,
//! the stage-1 engine, and the stage-2 engines.

use std::time::Duration;

/// Tuple `(sample_rate, bit_width, channels, snd_name, EC_required)` — the
/// shared input configuration a stage-1 engine negotiates across all of its
/// attached streams. The active profile is always the pointwise maximum
/// across streams (spec.md §3, "global invariants").
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureProfile {
    pub sample_rate: u32,
    pub bit_width: u16,
    pub channels: u16,
    pub snd_name: String,
    pub ec_required: bool,
    /// `true` when the DSP graph runs in the Low-Power-Island mode.
    pub lpi: bool,
}

impl CaptureProfile {
    pub fn bytes_per_sample(&self) -> u32 {
        (self.bit_width as u32 / 8).max(1)
    }

    /// Merge two profiles by taking the maximum along every numeric axis and
    /// OR-ing the boolean flags. Used when a new stream joins a stage-1
    /// engine and the shared profile must grow to cover it.
    pub fn merge_max(&self, other: &CaptureProfile) -> CaptureProfile {
        CaptureProfile {
            sample_rate: self.sample_rate.max(other.sample_rate),
            bit_width: self.bit_width.max(other.bit_width),
            channels: self.channels.max(other.channels),
            snd_name: if other.sample_rate > self.sample_rate {
                other.snd_name.clone()
            } else {
                self.snd_name.clone()
            },
            ec_required: self.ec_required || other.ec_required,
            lpi: self.lpi && other.lpi,
        }
    }
}

impl Default for CaptureProfile {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            bit_width: 16,
            channels: 1,
            snd_name: "va-mic".to_string(),
            ec_required: false,
            lpi: true,
        }
    }
}

/// How aggressively the DSP graph should run its first-stage detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionPerfMode {
    Low,
    High,
}

/// Per-phrase confidence threshold, parsed from the `CONFIDENCE_LEVELS` TLV.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfidenceLevel {
    pub phrase_id: u32,
    pub level: u8,
}

/// Per-user verification threshold, parsed alongside `ConfidenceLevel`s when
/// the vendor schema carries per-user data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserConfidenceLevel {
    pub user_id: u32,
    pub level: u8,
}

/// Recognition config as handed to `Stream::recognition_config` (spec.md §6).
/// The opaque vendor payload is parsed into this shape by the voice-UI
/// interface before the state machine ever sees it.
#[derive(Debug, Clone)]
pub struct RecognitionConfig {
    pub capture_handle: i32,
    pub capture_device: i32,
    pub capture_requested: bool,
    pub num_phrases: u32,
    pub confidence_levels: Vec<ConfidenceLevel>,
    pub user_levels: Vec<UserConfidenceLevel>,
    /// History buffer duration, milliseconds.
    pub history_ms: u32,
    /// Pre-roll duration, milliseconds.
    pub preroll_ms: u32,
    pub detection_perf_mode: DetectionPerfMode,
    pub keyword_indices: Vec<u32>,
    /// Platform opt-in for a client-visible `FAILURE` callback on stage-2
    /// rejection (spec.md §7 scenario 3). Off by default: a reject silently
    /// restarts the engines and re-arms.
    pub notify_stage2_reject: bool,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            capture_handle: 0,
            capture_device: 0,
            capture_requested: false,
            num_phrases: 1,
            confidence_levels: Vec::new(),
            user_levels: Vec::new(),
            history_ms: 1000,
            preroll_ms: 500,
            detection_perf_mode: DetectionPerfMode::Low,
            keyword_indices: Vec::new(),
            notify_stage2_reject: false,
        }
    }
}

/// Stage-2 read-window tolerances (spec.md §4.3 step 2), expressed in
/// milliseconds and convertible to a byte count for a given capture profile.
#[derive(Debug, Clone, Copy)]
pub struct StageTolerances {
    pub kw_start_tol_ms: u32,
    pub kw_end_tol_ms: u32,
    pub data_after_kw_end_ms: u32,
    pub data_before_kw_start_ms: u32,
}

impl Default for StageTolerances {
    fn default() -> Self {
        Self {
            kw_start_tol_ms: 300,
            kw_end_tol_ms: 300,
            data_after_kw_end_ms: 500,
            data_before_kw_start_ms: 500,
        }
    }
}

impl StageTolerances {
    pub fn kw_start_tol_bytes(&self, profile: &CaptureProfile) -> usize {
        ms_to_bytes(self.kw_start_tol_ms, profile)
    }

    pub fn kw_end_tol_bytes(&self, profile: &CaptureProfile) -> usize {
        ms_to_bytes(self.kw_end_tol_ms, profile)
    }

    pub fn data_after_kw_end_bytes(&self, profile: &CaptureProfile) -> usize {
        ms_to_bytes(self.data_after_kw_end_ms, profile)
    }

    pub fn data_before_kw_start_bytes(&self, profile: &CaptureProfile) -> usize {
        ms_to_bytes(self.data_before_kw_start_ms, profile)
    }
}

fn ms_to_bytes(ms: u32, profile: &CaptureProfile) -> usize {
    let bytes_per_sec =
        profile.sample_rate as u64 * profile.bytes_per_sample() as u64 * profile.channels as u64;
    ((bytes_per_sec * ms as u64) / 1000) as usize
}

/// Deferred-stop delays (spec.md §4.1, §4.5).
pub const LAB_DELAY: Duration = Duration::from_millis(10_000);
pub const DEFAULT_DELAY: Duration = Duration::from_millis(1_000);

/// Round a byte count down to a multiple of 10 ms for the given profile —
/// used to quantize `ftrt` before it becomes a stage-2 read window
/// (spec.md §8, "`ftrt` is rounded down to a multiple of 10 ms").
pub fn round_down_to_10ms(bytes: usize, profile: &CaptureProfile) -> usize {
    let unit = ms_to_bytes(10, profile).max(1);
    (bytes / unit) * unit
}
