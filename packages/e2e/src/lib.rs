//! End-to-end scenario support for respire.
//!
//! The scenario binary is a complete build program: it registers every
//! test build function, routes respire's internal tools (the engine
//! re-invokes the binary in host mode), routes the test command tools
//! (`tool-cat`/`tool-echo`), and only then runs scenarios.

pub mod functions;
pub mod harness;
