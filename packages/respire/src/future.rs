//! Futures: symbolic references to a subrespire's not-yet-computed output.

use serde::{Deserialize, Serialize};

/// A handle to the return value of a subrespire invocation.
///
/// The value is identified by the path its flattened form will be written
/// to; two futures are the same future iff they resolve through the same
/// value path, regardless of where they were minted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Future {
    /// Where the resolved value will be serialized.
    pub value_filepath: String,
    /// The generated registry whose execution produces the value.
    pub include_filepath: String,
    /// Module of the build function this future came from.
    pub source_module: String,
    /// Name of the build function this future came from.
    pub source_function: String,
}

impl PartialEq for Future {
    fn eq(&self, other: &Self) -> bool {
        self.value_filepath == other.value_filepath
    }
}

impl Eq for Future {}

impl Future {
    /// The `module:function` identifier of the producing invocation, used
    /// in cycle-detection frames and error messages.
    pub fn source_identifier(&self) -> String {
        format!("{}:{}", self.source_module, self.source_function)
    }
}
