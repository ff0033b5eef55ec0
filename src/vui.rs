//! Voice-UI interface — the opaque, vendor-UUID-scoped plugin that
//! translates model/recognition-config blobs into normalized fields
//! (spec.md §3 "Voice-UI interface", §6 "Voice-UI interface (plugin)").
//!
//! The core never interprets a vendor blob directly; it always goes
//! through a [`VoiceUiInterface`] implementor. This crate ships one
//! TLV-parsing default, [`TlvVui`], for the wire format spec.md documents;
//! tests exercise it directly rather than through a separate stub.

use crate::config::{ConfidenceLevel, DetectionPerfMode, RecognitionConfig, UserConfidenceLevel};
use crate::error::{Result, SoundTriggerError};

/// Parameter-bus keys exchanged with the voice-UI interface (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKey {
    FstageSoundModelType,
    FstageSoundModelId,
    FstageSoundModelState,
    FstageSoundModelAdd,
    FstageSoundModelDelete,
    FstageBufferingConfig,
    FstageDetectionUvScore,
    SstageConfLevel,
    SstageDetLevel,
    RecognitionMode,
    RecognitionConfig,
    DetectionResult,
    DetectionEvent,
    KeywordIndex,
    KeywordStats,
    FtrtData,
    FtrtDataSize,
    LabReadOffset,
    StreamAttributes,
    DefaultBufferConfig,
    ProcessLabData,
}

/// A value carried on the parameter bus. Kept deliberately loose (the real
/// vendor payloads are opaque byte blobs); typed accessors narrow it at the
/// call site.
#[derive(Debug, Clone)]
pub enum ParamValue {
    Int(i64),
    Float(f32),
    Bytes(Vec<u8>),
    Levels(Vec<ConfidenceLevel>),
}

/// TLV key IDs for the recognition-config opaque payload (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TlvKey {
    ConfidenceLevels = 1,
    HistoryBufferConfig = 2,
    KeywordIndices = 3,
    Timestamp = 4,
    DetectionPerfMode = 5,
    ContextRecognitionInfo = 6,
    ContextEventInfo = 7,
}

impl TlvKey {
    fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            1 => Self::ConfidenceLevels,
            2 => Self::HistoryBufferConfig,
            3 => Self::KeywordIndices,
            4 => Self::Timestamp,
            5 => Self::DetectionPerfMode,
            6 => Self::ContextRecognitionInfo,
            7 => Self::ContextEventInfo,
            _ => return None,
        })
    }
}

/// One first-stage detection's normalized fields, handed to
/// [`VoiceUiInterface::build_detection_event`] to assemble the opaque
/// client-facing payload.
#[derive(Debug, Clone)]
pub struct DetectionFields {
    pub keyword_index: u32,
    pub confidence_levels: Vec<ConfidenceLevel>,
    pub uv_score: Option<f32>,
    pub timestamp_ms: u64,
}

/// Contract for a vendor-specific model parser / config translator.
pub trait VoiceUiInterface: Send + Sync {
    /// Parse the opaque `recognition_config` payload into normalized fields.
    fn parse_recognition_config(&self, opaque: &[u8]) -> Result<RecognitionConfig>;

    /// Build the opaque vendor payload carried on a client `SUCCESS` callback.
    fn build_detection_event(&self, fields: &DetectionFields) -> Result<Vec<u8>>;

    /// Pass-through get on the parameter bus.
    fn get_param(&self, key: ParamKey) -> Option<ParamValue>;

    /// Pass-through set on the parameter bus.
    fn set_param(&self, key: ParamKey, value: ParamValue) -> Result<()>;
}

/// TLV-format implementation for the wire format described in spec.md §6.
#[derive(Debug, Default)]
pub struct TlvVui;

impl TlvVui {
    pub fn new() -> Self {
        Self
    }
}

impl VoiceUiInterface for TlvVui {
    fn parse_recognition_config(&self, opaque: &[u8]) -> Result<RecognitionConfig> {
        let mut cfg = RecognitionConfig::default();
        let mut cursor = 0usize;

        while cursor + 8 <= opaque.len() {
            let key_raw = u32::from_le_bytes(opaque[cursor..cursor + 4].try_into().unwrap());
            let len = u32::from_le_bytes(opaque[cursor + 4..cursor + 8].try_into().unwrap()) as usize;
            cursor += 8;
            if cursor + len > opaque.len() {
                return Err(SoundTriggerError::InvalidArgument(
                    "recognition config TLV exceeds payload length".into(),
                ));
            }
            let value = &opaque[cursor..cursor + len];

            match TlvKey::from_u32(key_raw) {
                Some(TlvKey::ConfidenceLevels) => {
                    cfg.confidence_levels = value
                        .chunks_exact(5)
                        .map(|c| ConfidenceLevel {
                            phrase_id: u32::from_le_bytes(c[0..4].try_into().unwrap()),
                            level: c[4],
                        })
                        .collect();
                }
                Some(TlvKey::HistoryBufferConfig) => {
                    if value.len() >= 8 {
                        cfg.history_ms = u32::from_le_bytes(value[0..4].try_into().unwrap());
                        cfg.preroll_ms = u32::from_le_bytes(value[4..8].try_into().unwrap());
                    }
                }
                Some(TlvKey::KeywordIndices) => {
                    cfg.keyword_indices = value
                        .chunks_exact(4)
                        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
                        .collect();
                }
                Some(TlvKey::DetectionPerfMode) => {
                    if let Some(&b) = value.first() {
                        cfg.detection_perf_mode = if b == 0 {
                            DetectionPerfMode::Low
                        } else {
                            DetectionPerfMode::High
                        };
                    }
                }
                // Timestamp / context info TLVs carry diagnostic data the
                // state machine does not act on directly.
                Some(TlvKey::Timestamp)
                | Some(TlvKey::ContextRecognitionInfo)
                | Some(TlvKey::ContextEventInfo) => {}
                None => {
                    tracing::debug!(key = key_raw, len, "skipping unknown recognition config TLV");
                }
            }

            cursor += len;
        }

        Ok(cfg)
    }

    fn build_detection_event(&self, fields: &DetectionFields) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.extend_from_slice(&fields.keyword_index.to_le_bytes());
        out.extend_from_slice(&fields.timestamp_ms.to_le_bytes());
        out.push(fields.confidence_levels.len() as u8);
        for level in &fields.confidence_levels {
            out.extend_from_slice(&level.phrase_id.to_le_bytes());
            out.push(level.level);
        }
        if let Some(score) = fields.uv_score {
            out.push(1);
            out.extend_from_slice(&score.to_le_bytes());
        } else {
            out.push(0);
        }
        Ok(out)
    }

    fn get_param(&self, _key: ParamKey) -> Option<ParamValue> {
        None
    }

    fn set_param(&self, _key: ParamKey, _value: ParamValue) -> Result<()> {
        Ok(())
    }
}

/// A user verification payload passed alongside confidence levels, also
/// carried through `SSTAGE_*_CONF_LEVEL` / `SSTAGE_*_DET_LEVEL` parameters
/// when the plugin is a user-verification stage-2 algorithm.
pub fn user_levels_from_bytes(value: &[u8]) -> Vec<UserConfidenceLevel> {
    value
        .chunks_exact(5)
        .map(|c| UserConfidenceLevel {
            user_id: u32::from_le_bytes(c[0..4].try_into().unwrap()),
            level: c[4],
        })
        .collect()
}
