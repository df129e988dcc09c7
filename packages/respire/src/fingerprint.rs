//! Invocation fingerprints and the file paths derived from them.
//!
//! A subrespire invocation is identified by the SHA-256 of
//! `module:function:params`, where params is the codec's canonical JSON.
//! Everything the invocation writes lives at paths derived from that
//! fingerprint, so equal invocations share their entire directory
//! footprint across runs and across concurrent hosts.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

pub const PARAMS_EXTENSION: &str = ".respire.params.json";
pub const GEN_REGISTRY_EXTENSION: &str = ".respire.gen.reg";
pub const REGISTRY_EXTENSION: &str = ".respire.reg";
pub const OUTPUT_EXTENSION: &str = ".respire.output.json";
pub const FLATTENED_OUTPUT_EXTENSION: &str = ".respire.flattened.output.json";
pub const DEPS_EXTENSION: &str = ".respire.deps";
pub const TIMESTAMP_EXTENSION: &str = ".respire.timestamp";

/// Callback-command params and deps use their own extensions so they never
/// collide with subrespire state for the same (module, function).
pub const CALLBACK_PARAMS_EXTENSION: &str = ".callback.params.json";
pub const CALLBACK_DEPS_EXTENSION: &str = ".callback.deps";

/// Generated file names must stay under this length, extension included.
const MAX_FILE_LENGTH: usize = 200;

const fn max_extension_length() -> usize {
    let extensions = [
        PARAMS_EXTENSION,
        GEN_REGISTRY_EXTENSION,
        REGISTRY_EXTENSION,
        OUTPUT_EXTENSION,
        FLATTENED_OUTPUT_EXTENSION,
        DEPS_EXTENSION,
        TIMESTAMP_EXTENSION,
    ];
    let mut longest = 0;
    let mut i = 0;
    while i < extensions.len() {
        if extensions[i].len() > longest {
            longest = extensions[i].len();
        }
        i += 1;
    }
    longest
}

/// Hex SHA-256 of the given text.
pub fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// The `module:function` key identifying a build function.
pub fn respire_identifier(module: &str, function: &str) -> String {
    format!("{module}:{function}")
}

/// The base filename for one invocation: a human-readable descriptor
/// prefix followed by the full fingerprint.
///
/// The descriptor is the identifier with filename-hostile characters
/// replaced, truncated so that base + longest extension fits the length
/// budget; it exists purely so the generated files describe themselves
/// instead of being stone-cold hashes.
pub fn hashed_base_filename(module: &str, function: &str, params_json: &str) -> String {
    let key = respire_identifier(module, function);
    let hash = sha256_hex(&format!("{key}:{params_json}"));

    let max_base_len = MAX_FILE_LENGTH - max_extension_length() - 1;
    debug_assert!(hash.len() <= max_base_len);
    let descriptor_len = max_base_len - hash.len();

    let descriptor: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || "-_.() ".contains(c) {
                c
            } else {
                '_'
            }
        })
        .take(descriptor_len)
        .collect();

    format!("{descriptor}_{hash}")
}

/// The seven files derived from one invocation fingerprint.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct SubrespirePaths {
    pub params: PathBuf,
    pub gen_registry: PathBuf,
    pub registry: PathBuf,
    pub output: PathBuf,
    pub flattened_output: PathBuf,
    pub deps: PathBuf,
    pub timestamp: PathBuf,
}

impl SubrespirePaths {
    /// Derive all paths for a base filename under the given out directory.
    pub fn new(out_dir: impl AsRef<Path>, base: &str) -> Self {
        let join = |extension: &str| out_dir.as_ref().join(format!("{base}{extension}"));
        Self {
            params: join(PARAMS_EXTENSION),
            gen_registry: join(GEN_REGISTRY_EXTENSION),
            registry: join(REGISTRY_EXTENSION),
            output: join(OUTPUT_EXTENSION),
            flattened_output: join(FLATTENED_OUTPUT_EXTENSION),
            deps: join(DEPS_EXTENSION),
            timestamp: join(TIMESTAMP_EXTENSION),
        }
    }

    /// Derive the paths for an invocation directly.
    pub fn for_invocation(
        out_dir: impl AsRef<Path>,
        module: &str,
        function: &str,
        params_json: &str,
    ) -> Self {
        Self::new(out_dir, &hashed_base_filename(module, function, params_json))
    }
}

/// Where command log captures live under the out directory.
pub fn log_directory(out_dir: impl AsRef<Path>) -> PathBuf {
    out_dir.as_ref().join("logs")
}

/// Default stdout/stderr capture paths for a command that did not redirect
/// its own streams: `logs/<sha256(command)>_std{out,err}.txt`.
pub fn default_capture_paths(out_dir: impl AsRef<Path>, command: &str) -> (PathBuf, PathBuf) {
    let logs = log_directory(out_dir);
    let hash = sha256_hex(command);
    (
        logs.join(format!("{hash}_stdout.txt")),
        logs.join(format!("{hash}_stderr.txt")),
    )
}
