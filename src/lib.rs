//! # sthal-core
//!
//! Audio-HAL voice-trigger recognition core: per-(module_type) stage-1
//! keyword spotting shared across concurrent client sessions, with optional
//! per-stream stage-2 confirmation (keyword re-scoring, user verification).
//!
//! ## Architecture
//!
//! ```text
//! DspSession (module_type) → Stage1Engine → RingBuffer ──┬─→ Stage2Engine (keyword)
//!         │                       │                       └─→ Stage2Engine (user verification)
//!   DspEvent callback     DetectionSink::on_gmm_detected
//!         │                       │
//!         └──────────────→ Stream (per-session state machine) → ClientEvent callback
//! ```
//!
//! One [`Stage1Engine`](engine1::Stage1Engine) per `module_type` is shared by
//! every [`Stream`](stream::Stream) that loads a model of that type; a
//! [`RecognitionRegistry`](registry::RecognitionRegistry) owns the arena and
//! the cross-engine detection gate. All engine mutation happens behind
//! `parking_lot` mutexes; DSP events cross thread boundaries on a
//! `crossbeam_channel`.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod buffering;
pub mod config;
pub mod dsp;
pub mod engine1;
pub mod engine2;
pub mod error;
pub mod events;
pub mod model;
pub mod plugin;
pub mod registry;
pub mod resource;
pub mod stream;
pub mod timer;
pub mod vui;

pub use error::{Result, SoundTriggerError};
pub use events::{AbortReason, ClientEvent};
pub use registry::RecognitionRegistry;
pub use stream::{default_plugin_factory, Stream};
