//! Error kinds shared between the host and the engine.
//!
//! These are the errors that cross a process boundary: the engine embeds
//! them in `ProcessingComplete` and `SignalRespireError` events, and the
//! host surfaces them as the failure cause of an invocation. Everything
//! else in the crate uses plain [`color_eyre::Report`]s.

use derive_more::{Display, Error};
use serde::{Deserialize, Serialize};

/// A build failure with a defined cause.
#[derive(Clone, Eq, PartialEq, Debug, Display, Error, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum RespireError {
    /// A registry file could not be parsed or violated the schema.
    #[display("invalid registry file {path}: {reason}")]
    InvalidRegistryFile { path: String, reason: String },

    /// Two commands declare the same hard output.
    #[display("output conflict on {output}: `{first}` and `{second}`")]
    OutputConflict {
        output: String,
        first: String,
        second: String,
    },

    /// A future or command cycle. The chain is rendered in traversal order.
    #[display("cyclic dependency detected:\n{}", chain.join(" ->\n"))]
    CyclicDependency { chain: Vec<String> },

    /// The requested build function is not registered.
    #[display("build function {name:?} is not registered for module {module:?}")]
    MissingFunction { module: String, name: String },

    /// A value fell through every encoding classification.
    #[display("value cannot be serialized: {reason}")]
    RejectedUnserializable { reason: String },

    /// A plain (already-flattened) decode met a future envelope.
    #[display("expected flattened content, found future for {value_path}")]
    UnexpectedFuture { value_path: String },

    /// A child process exited nonzero. Captured streams are attached when
    /// the command redirected them.
    #[display("command failed with status {status}: {command}")]
    CommandFailed {
        command: String,
        status: i32,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        stdout: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        stderr: Option<String>,
    },

    /// A command exited zero but a declared hard output is absent.
    #[display("command did not produce declared output {output}: {command}")]
    MissingOutput { command: String, output: String },

    /// A record tag or function reference could not be resolved against the
    /// process tables.
    #[display("module lookup failed: {what}")]
    ModuleLookupFailed { what: String },

    /// An envelope object is missing required keys or carries wrong types.
    #[display("malformed envelope: {reason}")]
    MalformedEnvelope { reason: String },
}

impl RespireError {
    /// Short machine name of the kind, used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRegistryFile { .. } => "InvalidRegistryFile",
            Self::OutputConflict { .. } => "OutputConflict",
            Self::CyclicDependency { .. } => "CyclicDependency",
            Self::MissingFunction { .. } => "MissingFunction",
            Self::RejectedUnserializable { .. } => "RejectedUnserializable",
            Self::UnexpectedFuture { .. } => "UnexpectedFuture",
            Self::CommandFailed { .. } => "CommandFailed",
            Self::MissingOutput { .. } => "MissingOutput",
            Self::ModuleLookupFailed { .. } => "ModuleLookupFailed",
            Self::MalformedEnvelope { .. } => "MalformedEnvelope",
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn roundtrips_through_serde() {
        let err = RespireError::CommandFailed {
            command: "cat a b".into(),
            status: 1,
            stdout: Some("/logs/x_stdout.txt".into()),
            stderr: None,
        };
        let encoded = serde_json::to_string(&err).unwrap();
        let decoded: RespireError = serde_json::from_str(&encoded).unwrap();
        assert_eq!(err, decoded);
    }

    #[test]
    fn renders_cycle_chain_in_order() {
        let err = RespireError::CyclicDependency {
            chain: vec!["a.respire:F".into(), "b.respire:G".into()],
        };
        assert_eq!(
            err.to_string(),
            "cyclic dependency detected:\na.respire:F ->\nb.respire:G"
        );
    }
}
