//! Per-stream state machine types (spec.md §4.1).
//!
//! Re-expressed per the source's own design note (spec.md §9): a sum type
//! over the six states with a single exhaustive dispatcher, rather than the
//! original's objects-with-virtual-`ProcessEvent`. `mod.rs` holds the
//! dispatcher and its side effects; this module only holds the shapes.

/// The six states a stream can be in (spec.md §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Loaded,
    Active,
    Detected,
    Buffering,
    Ssr,
}

/// What to restore to on `ssr_online` (spec.md §4.1 "ssr -> restore-state",
/// §8 "restores the pre-SSR state ... as recorded in `state_for_restore`").
///
/// `None` is the pre-construction sentinel carried over from the original's
/// `ST_STATE_NONE` (SPEC_FULL.md §4): distinct from `Idle` so a stream that
/// never reached `Idle` before an `ssr_offline` still round-trips exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreState {
    None,
    Idle,
    Loaded,
    Active,
}

impl RestoreState {
    pub fn from_state(state: State) -> Self {
        match state {
            State::Idle => RestoreState::Idle,
            State::Loaded => RestoreState::Loaded,
            State::Active | State::Detected | State::Buffering => RestoreState::Active,
            State::Ssr => RestoreState::None,
        }
    }

    pub fn as_state(self) -> State {
        match self {
            RestoreState::None | RestoreState::Idle => State::Idle,
            RestoreState::Loaded => State::Loaded,
            RestoreState::Active => State::Active,
        }
    }
}

/// First-stage/second-stage detection kinds (spec.md §4.1 events list).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectedKind {
    Gmm,
    KwSuccess,
    KwReject,
    UvSuccess,
    UvReject,
}

/// External events a stream reacts to (spec.md §4.1 "Events (external)").
#[derive(Debug, Clone, Copy)]
pub enum Event {
    LoadSoundModel,
    UnloadSoundModel,
    RecognitionConfig,
    Start,
    Stop,
    ReadBuffer,
    StopBuffering,
    Pause,
    Resume,
    InternalPause,
    InternalResume,
    DeviceConnected(u32),
    DeviceDisconnected(u32),
    ConcurrentStreamChanged { active: bool },
    EcRef { rx_dev: u32, enable: bool },
    SsrOffline,
    SsrOnline,
    Detected(DetectedKind),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restore_state_round_trips_through_active_states() {
        for state in [State::Active, State::Detected, State::Buffering] {
            assert_eq!(RestoreState::from_state(state).as_state(), State::Active);
        }
    }

    #[test]
    fn ssr_state_maps_to_none_sentinel() {
        assert_eq!(RestoreState::from_state(State::Ssr), RestoreState::None);
        assert_eq!(RestoreState::None.as_state(), State::Idle);
    }
}
