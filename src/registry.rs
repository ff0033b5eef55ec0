//! Recognition registry — process-wide arena for stage-1 engines (spec.md
//! §9 "Global state (engine-instance map, global detection map)").
//!
//! The original keeps an engine-instance map and a detection-active map as
//! process globals. Both collapse into one value here, owned by whoever
//! constructs the recognition core and threaded through every stream and
//! engine constructor — never a `static`/singleton.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::engine1::Stage1Engine;

/// Serializes detection across stage-1 engines sharing the same low-power
/// hardware (spec.md §4.2 "A **global** detection-active map prevents
/// cross-engine double-wake on shared hardware").
pub trait GlobalDetectionGate: Send + Sync {
    /// Attempt to become the sole actively-detecting stream process-wide.
    /// Returns `true` if acquired.
    fn try_acquire(&self, stream_id: u64) -> bool;
    fn release(&self, stream_id: u64);
    fn current_holder(&self) -> Option<u64>;
}

#[derive(Default)]
struct GateState {
    holder: Option<u64>,
}

/// Default in-process implementation of [`GlobalDetectionGate`].
#[derive(Default)]
pub struct DetectionGate {
    state: Mutex<GateState>,
}

impl DetectionGate {
    pub fn new() -> Self {
        Self::default()
    }
}

impl GlobalDetectionGate for DetectionGate {
    fn try_acquire(&self, stream_id: u64) -> bool {
        let mut state = self.state.lock();
        match state.holder {
            None => {
                state.holder = Some(stream_id);
                true
            }
            Some(current) => current == stream_id,
        }
    }

    fn release(&self, stream_id: u64) {
        let mut state = self.state.lock();
        if state.holder == Some(stream_id) {
            state.holder = None;
        }
    }

    fn current_holder(&self) -> Option<u64> {
        self.state.lock().holder
    }
}

/// Arena of stage-1 engines keyed by `module_type` (spec.md §9 "Model as an
/// arena of engines indexed by `module_type`; each stream holds a handle
/// (id), not a raw reference").
pub struct RecognitionRegistry {
    engines: Mutex<HashMap<u32, Arc<Stage1Engine>>>,
    gate: Arc<dyn GlobalDetectionGate>,
}

impl RecognitionRegistry {
    pub fn new() -> Self {
        Self {
            engines: Mutex::new(HashMap::new()),
            gate: Arc::new(DetectionGate::new()),
        }
    }

    pub fn with_gate(gate: Arc<dyn GlobalDetectionGate>) -> Self {
        Self {
            engines: Mutex::new(HashMap::new()),
            gate,
        }
    }

    pub fn detection_gate(&self) -> Arc<dyn GlobalDetectionGate> {
        Arc::clone(&self.gate)
    }

    /// Fetch the stage-1 engine for `module_type`, inserting a fresh one
    /// built by `build` if this is the first stream of that type (spec.md
    /// §4.2 "created lazily on first matching `load`").
    pub fn engine_for(
        &self,
        module_type: u32,
        build: impl FnOnce() -> Arc<Stage1Engine>,
    ) -> Arc<Stage1Engine> {
        let mut engines = self.engines.lock();
        Arc::clone(engines.entry(module_type).or_insert_with(build))
    }

    /// Drop the engine for `module_type` once its last stream detaches
    /// (spec.md §3 "Engine (stage 1)" lifetime). No-op if streams remain
    /// attached or no such engine exists.
    pub fn release_if_unused(&self, module_type: u32) {
        let mut engines = self.engines.lock();
        if let Some(engine) = engines.get(&module_type) {
            if engine.stream_count() == 0 {
                engines.remove(&module_type);
            }
        }
    }

    pub fn engine_count(&self) -> usize {
        self.engines.lock().len()
    }
}

impl Default for RecognitionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detection_gate_serializes_across_engines() {
        let gate = DetectionGate::new();
        assert!(gate.try_acquire(1));
        assert!(!gate.try_acquire(2));
        assert!(gate.try_acquire(1)); // re-entrant for the current holder
        gate.release(1);
        assert!(gate.try_acquire(2));
    }

    #[test]
    fn release_is_a_no_op_for_non_holder() {
        let gate = DetectionGate::new();
        gate.try_acquire(1);
        gate.release(2);
        assert_eq!(gate.current_holder(), Some(1));
    }
}
