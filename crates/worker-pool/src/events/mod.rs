//! Action event emission.

mod emitter;

pub use emitter::EventEmitter;
