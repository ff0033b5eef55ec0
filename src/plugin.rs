//! Stage-2 plugin ABI (spec.md §4.3 "Plugin contract").
//!
//! The real algorithm (CNN/RNN keyword confirmation, user verification) is a
//! dynamically-loaded library behind a narrow v-table in production. This
//! crate depends only on the [`Stage2Plugin`] trait — the dynamic-load entry
//! point is a narrow capability interface, per spec.md §9 "Plugin loading".
//!
//! `&mut self` throughout expresses that decoders are stateful (internal
//! score buffers, RNN hidden states); all mutation is serialized through
//! [`PluginHandle`]'s `parking_lot::Mutex`, the same pattern the teacher
//! crate uses for `ModelHandle` around `SpeechModel`.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;

/// Parameter IDs used on the stage-2 plugin's `set_param`/`get_param` calls
/// (spec.md §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamId {
    ThresholdConfig,
    ReinitAll,
    Result,
    InmodelBufferSize,
    ScratchParam,
    Stage1UvScore,
}

/// The outcome of one stage-2 processing pass, read back via
/// `get_param(RESULT)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PluginResult {
    pub is_detected: bool,
    pub confidence: u8,
}

/// Contract for all stage-2 algorithms (keyword detection, user
/// verification, or a custom third-party stage).
pub trait Stage2Plugin: Send + 'static {
    /// Initialize from the raw model bytes sliced out of the sound-model
    /// blob for this plugin's stage.
    fn init(&mut self, model_bytes: &[u8]) -> Result<()>;

    /// Feed one window of input frames. Implementations accumulate internal
    /// state across calls until a verdict is ready.
    fn process(&mut self, frames: &[f32]) -> Result<()>;

    fn set_param(&mut self, id: ParamId, payload: &[u8]) -> Result<()>;

    /// Read back a parameter. `RESULT` is the only ID the worker loop reads
    /// after every `process` call.
    fn get_param(&mut self, id: ParamId) -> Result<Vec<u8>>;

    /// Tear down, releasing any backing resources (scratch buffers, native
    /// handles).
    fn end(&mut self) -> Result<()>;
}

/// Read back the current detection verdict via `get_param(RESULT)`.
pub fn read_result(plugin: &mut dyn Stage2Plugin) -> Result<PluginResult> {
    let payload = plugin.get_param(ParamId::Result)?;
    if payload.len() < 2 {
        return Ok(PluginResult::default());
    }
    Ok(PluginResult {
        is_detected: payload[0] != 0,
        confidence: payload[1],
    })
}

/// Thread-safe reference-counted handle to any [`Stage2Plugin`] implementor.
/// `parking_lot::Mutex` is used for the same reasons as the engine's model
/// handle: non-poisoning on panic, cheap uncontended lock.
#[derive(Clone)]
pub struct PluginHandle(pub Arc<Mutex<dyn Stage2Plugin>>);

impl PluginHandle {
    pub fn new<P: Stage2Plugin>(plugin: P) -> Self {
        Self(Arc::new(Mutex::new(plugin)))
    }
}

impl std::fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHandle").finish_non_exhaustive()
    }
}

/// A deterministic test/placeholder plugin: detects once `process` has seen
/// at least `min_frames` samples whose mean magnitude clears `threshold`.
/// Mirrors the teacher crate's `StubModel` — exercises the full pipeline
/// end-to-end before a real acoustic backend is wired in.
pub struct StubPlugin {
    threshold: u8,
    min_frames: usize,
    seen_frames: usize,
    energy_accum: f32,
    reinit_count: u32,
}

impl StubPlugin {
    pub fn new(min_frames: usize) -> Self {
        Self {
            threshold: 50,
            min_frames,
            seen_frames: 0,
            energy_accum: 0.0,
            reinit_count: 0,
        }
    }
}

impl Stage2Plugin for StubPlugin {
    fn init(&mut self, _model_bytes: &[u8]) -> Result<()> {
        self.seen_frames = 0;
        self.energy_accum = 0.0;
        Ok(())
    }

    fn process(&mut self, frames: &[f32]) -> Result<()> {
        self.seen_frames += frames.len();
        self.energy_accum += frames.iter().map(|s| s.abs()).sum::<f32>();
        Ok(())
    }

    fn set_param(&mut self, id: ParamId, payload: &[u8]) -> Result<()> {
        match id {
            ParamId::ThresholdConfig => {
                if let Some(&b) = payload.first() {
                    self.threshold = b;
                }
            }
            ParamId::ReinitAll => {
                self.seen_frames = 0;
                self.energy_accum = 0.0;
                self.reinit_count += 1;
            }
            _ => {}
        }
        Ok(())
    }

    fn get_param(&mut self, id: ParamId) -> Result<Vec<u8>> {
        match id {
            ParamId::Result => {
                let mean = if self.seen_frames == 0 {
                    0.0
                } else {
                    self.energy_accum / self.seen_frames as f32
                };
                let confidence = (mean * 255.0).clamp(0.0, 255.0) as u8;
                let detected =
                    self.seen_frames >= self.min_frames && confidence >= self.threshold;
                Ok(vec![detected as u8, confidence])
            }
            _ => Ok(Vec::new()),
        }
    }

    fn end(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_plugin_detects_above_threshold_after_min_frames() {
        let mut plugin = StubPlugin::new(100);
        plugin.init(&[]).unwrap();
        plugin.set_param(ParamId::ThresholdConfig, &[10]).unwrap();
        plugin.process(&vec![0.9f32; 100]).unwrap();
        let result = read_result(&mut plugin).unwrap();
        assert!(result.is_detected);
    }

    #[test]
    fn stub_plugin_no_detect_before_min_frames() {
        let mut plugin = StubPlugin::new(1000);
        plugin.init(&[]).unwrap();
        plugin.process(&vec![0.9f32; 100]).unwrap();
        let result = read_result(&mut plugin).unwrap();
        assert!(!result.is_detected);
    }

    #[test]
    fn reinit_clears_accumulated_energy() {
        let mut plugin = StubPlugin::new(10);
        plugin.init(&[]).unwrap();
        plugin.process(&vec![0.9f32; 100]).unwrap();
        plugin.set_param(ParamId::ReinitAll, &[]).unwrap();
        let result = read_result(&mut plugin).unwrap();
        assert!(!result.is_detected);
        assert_eq!(plugin.reinit_count, 1);
    }
}
