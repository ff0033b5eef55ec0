//! Sound-model blob layout (spec.md §6, "Persistent/wire formats").
//!
//! The blob itself is opaque to everything except this parser and the
//! voice-UI interface: the state machine and engines only ever see a
//! [`SoundModel`] and its [`BigModel`] entries, never raw bytes.

use crate::error::{Result, SoundTriggerError};

pub const SML_MAGIC: u32 = 0x0018_0CC8;
pub const SML_HEADER_VERSION: u16 = 3;
pub const SML_MODEL_VERSION: u16 = 0x0300;
pub const MAX_BIG_MODELS: usize = 3;

/// Low byte of a big-model's `type` field — selects which stage the model
/// data belongs to. Bits may combine (e.g. a PDK model also marks GMM).
pub const F_STAGE_GMM: u8 = 1;
pub const S_STAGE_PDK: u8 = 2;
pub const S_STAGE_USER: u8 = 4;
pub const S_STAGE_RNN: u8 = 8;
pub const S_STAGE_UDK: u8 = 0x40;

const HEADER_LEN: usize = 12;
const BIG_MODEL_ENTRY_LEN: usize = 16;

/// One `{versionMajor, versionMinor, offset, size, type}` entry describing a
/// contiguous region of the blob that belongs to one algorithm stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BigModel {
    pub version_major: u16,
    pub version_minor: u16,
    pub offset: u32,
    pub size: u32,
    /// Low byte: stage mask (`F_STAGE_*` / `S_STAGE_*`). High byte: nonzero
    /// for third-party (vendor-specific) variants of a stage.
    pub ty: u16,
}

impl BigModel {
    pub fn stage_mask(&self) -> u8 {
        (self.ty & 0x00FF) as u8
    }

    pub fn is_third_party(&self) -> bool {
        (self.ty & 0xFF00) != 0
    }

    pub fn is_gmm(&self) -> bool {
        self.stage_mask() & F_STAGE_GMM != 0
    }

    pub fn is_pdk(&self) -> bool {
        self.stage_mask() & S_STAGE_PDK != 0
    }

    pub fn is_user_verification(&self) -> bool {
        self.stage_mask() & S_STAGE_USER != 0
    }

    pub fn is_rnn(&self) -> bool {
        self.stage_mask() & S_STAGE_RNN != 0
    }

    pub fn is_udk(&self) -> bool {
        self.stage_mask() & S_STAGE_UDK != 0
    }
}

/// A parsed sound-model blob: header + big-model directory + the raw bytes
/// (kept around so [`SoundModel::model_bytes`] can slice out each stage's
/// payload for the stage-2 plugin's `init`).
#[derive(Debug, Clone)]
pub struct SoundModel {
    pub header_version: u16,
    pub model_version: u16,
    pub big_models: Vec<BigModel>,
    raw: Vec<u8>,
}

impl SoundModel {
    /// Parse a raw sound-model blob per the vendor Sound-Model-Library
    /// layout. Never mutates or copies `bytes` beyond what's needed to own
    /// the backing storage.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(SoundTriggerError::InvalidArgument(
                "sound model blob shorter than header".into(),
            ));
        }

        let magic = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        if magic != SML_MAGIC {
            return Err(SoundTriggerError::InvalidArgument(format!(
                "bad sound model magic: {magic:#x}"
            )));
        }

        let header_version = u16::from_le_bytes(bytes[4..6].try_into().unwrap());
        if header_version != SML_HEADER_VERSION {
            return Err(SoundTriggerError::InvalidArgument(format!(
                "unsupported sound model header version: {header_version}"
            )));
        }

        let model_version = u16::from_le_bytes(bytes[6..8].try_into().unwrap());
        if model_version != SML_MODEL_VERSION {
            return Err(SoundTriggerError::InvalidArgument(format!(
                "unsupported sound model version: {model_version:#x}"
            )));
        }

        let num_big_models = bytes[8] as usize;
        if num_big_models > MAX_BIG_MODELS {
            return Err(SoundTriggerError::InvalidArgument(format!(
                "too many big models: {num_big_models} (max {MAX_BIG_MODELS})"
            )));
        }

        let dir_len = num_big_models * BIG_MODEL_ENTRY_LEN;
        if bytes.len() < HEADER_LEN + dir_len {
            return Err(SoundTriggerError::InvalidArgument(
                "sound model blob truncated before big-model directory".into(),
            ));
        }

        let mut big_models = Vec::with_capacity(num_big_models);
        for i in 0..num_big_models {
            let base = HEADER_LEN + i * BIG_MODEL_ENTRY_LEN;
            let entry = &bytes[base..base + BIG_MODEL_ENTRY_LEN];
            let big_model = BigModel {
                version_major: u16::from_le_bytes(entry[0..2].try_into().unwrap()),
                version_minor: u16::from_le_bytes(entry[2..4].try_into().unwrap()),
                offset: u32::from_le_bytes(entry[4..8].try_into().unwrap()),
                size: u32::from_le_bytes(entry[8..12].try_into().unwrap()),
                ty: u16::from_le_bytes(entry[12..14].try_into().unwrap()),
            };
            let end = big_model.offset as u64 + big_model.size as u64;
            if end > bytes.len() as u64 {
                return Err(SoundTriggerError::InvalidArgument(format!(
                    "big model {i} region [{}, {}) exceeds blob length {}",
                    big_model.offset,
                    end,
                    bytes.len()
                )));
            }
            big_models.push(big_model);
        }

        Ok(Self {
            header_version,
            model_version,
            big_models,
            raw: bytes.to_vec(),
        })
    }

    /// Slice out the payload for one big-model entry.
    pub fn model_bytes(&self, big_model: &BigModel) -> &[u8] {
        let start = big_model.offset as usize;
        let end = start + big_model.size as usize;
        &self.raw[start..end]
    }

    /// Find the first big-model entry matching the given stage mask bit.
    pub fn find_stage(&self, stage_bit: u8) -> Option<&BigModel> {
        self.big_models
            .iter()
            .find(|m| m.stage_mask() & stage_bit != 0)
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }
}
