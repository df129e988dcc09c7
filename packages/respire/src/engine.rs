//! The execution engine.
//!
//! A native out-of-process executor: it consumes registry files, builds
//! the dependency graph, schedules system commands in parallel, follows
//! include edges to pull in sub-registries as their producers run,
//! honors build targets, detects cycles, and emits a structured event
//! stream. The `respire-engine` binary wraps [`run`]; embedders and
//! tests call it in-process.

mod events;
mod exec;
mod graph;
mod state;

pub use events::{Event, EventSink, JsonLineSink};
pub use exec::{EngineOptions, EngineOutcome, STATE_FILE_NAME, run};
