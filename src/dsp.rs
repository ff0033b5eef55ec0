//! DSP graph session — external collaborator (spec.md §1 "Out of scope",
//! §6 "DSP session interface"). This crate depends only on the [`DspSession`]
//! trait; the actual DSP graph driver lives outside this crate, the same way
//! the teacher crate treats `cpal::Stream` as an external capture device
//! behind its own `AudioCapture` wrapper.

use crossbeam_channel::Sender;

use crate::config::CaptureProfile;
use crate::error::Result;

/// One per-model statistic carried on a PDK-variant detection event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelStat {
    pub model_id: u32,
    pub best_confidence: u8,
}

/// Events the DSP session callback raises asynchronously (spec.md §6).
#[derive(Debug, Clone)]
pub enum DspEvent {
    /// First-stage detection payload with confidence levels and timestamp.
    GenericInfo {
        miid: u32,
        confidence_levels: Vec<u8>,
        timestamp_ms: u64,
        /// Byte offsets into the ring buffer: `(start, end, ftrt)`.
        indices: (usize, usize, usize),
    },
    /// PDK variant with per-model stats.
    MmaDetection {
        miid: u32,
        stats: Vec<ModelStat>,
        timestamp_ms: u64,
        indices: (usize, usize, usize),
    },
}

impl DspEvent {
    pub fn miid(&self) -> u32 {
        match self {
            DspEvent::GenericInfo { miid, .. } => *miid,
            DspEvent::MmaDetection { miid, .. } => *miid,
        }
    }

    pub fn indices(&self) -> (usize, usize, usize) {
        match self {
            DspEvent::GenericInfo { indices, .. } => *indices,
            DspEvent::MmaDetection { indices, .. } => *indices,
        }
    }
}

/// Contract for the DSP graph driver (spec.md §6 "DSP session interface").
/// One implementor instance backs one stage-1 engine (one per `module_type`).
pub trait DspSession: Send {
    /// Open the graph for the given shared capture profile.
    fn open(&mut self, profile: &CaptureProfile) -> Result<()>;

    fn close(&mut self) -> Result<()>;

    fn start(&mut self) -> Result<()>;

    fn stop(&mut self) -> Result<()>;

    fn set_param(&mut self, tag: u32, miid: u32, payload: &[u8]) -> Result<()>;

    fn get_param(&mut self, tag: u32, miid: u32) -> Result<Vec<u8>>;

    /// Drain PCM produced since the last call. Returns bytes written into
    /// `buf`, which may be less than `buf.len()`.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Register to receive asynchronous detection events. Only one
    /// registration is meaningful per session; re-registering replaces the
    /// previous sender.
    fn register_callback(&mut self, sender: Sender<DspEvent>) -> Result<()>;
}

/// An in-memory [`DspSession`] used by tests and as a development
/// placeholder — mirrors the role of the teacher crate's stub inference
/// backend: it lets the rest of the pipeline be exercised end-to-end
/// without real hardware.
pub struct FakeDspSession {
    opened: bool,
    started: bool,
    profile: Option<CaptureProfile>,
    sender: Option<Sender<DspEvent>>,
    pcm: std::collections::VecDeque<u8>,
}

impl Default for FakeDspSession {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeDspSession {
    pub fn new() -> Self {
        Self {
            opened: false,
            started: false,
            profile: None,
            sender: None,
            pcm: std::collections::VecDeque::new(),
        }
    }

    /// Push synthetic PCM bytes that a subsequent `read()` will drain.
    pub fn push_pcm(&mut self, bytes: &[u8]) {
        self.pcm.extend(bytes.iter().copied());
    }

    /// Simulate the DSP callback firing a detection event.
    pub fn emit_event(&self, event: DspEvent) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(event);
        }
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_opened(&self) -> bool {
        self.opened
    }
}

impl DspSession for FakeDspSession {
    fn open(&mut self, profile: &CaptureProfile) -> Result<()> {
        self.opened = true;
        self.profile = Some(profile.clone());
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.opened = false;
        self.profile = None;
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.started = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.started = false;
        Ok(())
    }

    fn set_param(&mut self, _tag: u32, _miid: u32, _payload: &[u8]) -> Result<()> {
        Ok(())
    }

    fn get_param(&mut self, _tag: u32, _miid: u32) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = buf.len().min(self.pcm.len());
        for slot in buf.iter_mut().take(n) {
            *slot = self.pcm.pop_front().unwrap();
        }
        Ok(n)
    }

    fn register_callback(&mut self, sender: Sender<DspEvent>) -> Result<()> {
        self.sender = Some(sender);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_session_open_start_stop_close_roundtrip() {
        let mut session = FakeDspSession::new();
        let profile = CaptureProfile::default();
        session.open(&profile).unwrap();
        session.start().unwrap();
        assert!(session.is_started());
        session.stop().unwrap();
        assert!(!session.is_started());
        session.close().unwrap();
    }

    #[test]
    fn push_and_read_pcm() {
        let mut session = FakeDspSession::new();
        session.push_pcm(&[1, 2, 3, 4]);
        let mut buf = [0u8; 2];
        assert_eq!(session.read(&mut buf).unwrap(), 2);
        assert_eq!(buf, [1, 2]);
        assert_eq!(session.read(&mut buf).unwrap(), 2);
        assert_eq!(buf, [3, 4]);
        assert_eq!(session.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn emit_event_delivers_to_registered_channel() {
        let mut session = FakeDspSession::new();
        let (tx, rx) = crossbeam_channel::unbounded();
        session.register_callback(tx).unwrap();
        session.emit_event(DspEvent::GenericInfo {
            miid: 1,
            confidence_levels: vec![80],
            timestamp_ms: 0,
            indices: (0, 100, 100),
        });
        let event = rx.recv_timeout(std::time::Duration::from_millis(100)).unwrap();
        assert_eq!(event.miid(), 1);
    }
}
