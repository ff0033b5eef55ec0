//! Ring buffer + multi-reader fan-out (spec.md §3 "Ring buffer", §4.4).
//!
//! Unlike the teacher crate's SPSC `ringbuf::HeapRb` (one producer, one
//! consumer), the stage-1 engine here must fan PCM out to N independent
//! readers — the client LAB reader and one reader per stage-2 engine — each
//! advancing at its own pace. `ringbuf` has no multi-reader primitive, so
//! this module is a small purpose-built ring keeping the teacher's
//! concurrency idiom (`parking_lot::Mutex`, non-poisoning, cheap
//! uncontended lock) rather than its crate.

pub mod ring;

pub use ring::{ReaderId, ReaderLifecycle, RingBuffer, RingReader, RingWriter};
