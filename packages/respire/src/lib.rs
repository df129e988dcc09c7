//! Respire: an incremental build system with dynamically constructed
//! build graphs.
//!
//! Build functions run *during* the build. Each one declares work into a
//! registry (system commands, includes of other registries, build
//! targets), may request other build functions via [`Registry::sub_respire`]
//! and pass the resulting futures around, and is memoized by a content
//! fingerprint of its parameters. The out-of-process [`engine`] consumes
//! registries and re-runs only what changed.
//!
//! A build program is an ordinary binary that registers its functions and
//! record tags in [`schema`], routes internal tool invocations through
//! [`tools::run_internal_tool`], and enters [`driver::main`].
//!
//! [`Registry::sub_respire`]: registry::Registry::sub_respire

pub mod codec;
pub mod driver;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod fs;
pub mod future;
pub mod host;
pub mod progress;
pub mod registry;
pub mod schema;
pub mod tools;

pub use codec::Value;
pub use error::RespireError;
pub use future::Future;
pub use registry::{CommandSpec, Registry};
pub use schema::FunctionId;
