//! In-memory stand-ins for the engine and the event sink.
//!
//! Used by unit and integration tests to drive the pipeline without a real
//! engine binary:
//!
//! - [`FakeEngine`]: materializes trees from a local directory, returns
//!   configured results, records calls, supports failure injection
//! - [`MemoryRecorder`]: collects emitted events for assertions

mod engine;
mod failure;
mod recorder;

pub use engine::{EngineCall, FakeEngine};
pub use failure::{EngineOp, FailureConfig, FailureInjector};
pub use recorder::MemoryRecorder;
