//! File fingerprints and the persisted staleness record.
//!
//! A command is re-run when the observed fingerprint of any input differs
//! from what was recorded at its last successful run. Fingerprints carry
//! the mtime alongside the content hash: touching a file re-triggers its
//! consumers even when the bytes are unchanged, which is what makes a
//! touched registry or build script re-run its commands.

use std::{
    collections::{BTreeMap, HashMap},
    io::Read,
    path::{Path, PathBuf},
    time::UNIX_EPOCH,
};

use color_eyre::{Result, eyre::Context};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};
use walkdir::WalkDir;

use crate::{fingerprint::sha256_hex, fs};

/// Observed identity of a file or directory at a point in time.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct FileStamp {
    pub mtime_nanos: u128,
    pub size: u64,
    pub digest: String,
}

/// Stamp a path, or `None` when nothing exists there.
///
/// Directories are stamped by their sorted recursive entry listing:
/// membership changes re-trigger consumers, edits inside member files do
/// not (declare the files themselves for that).
pub fn stamp(path: &Path) -> Result<Option<FileStamp>> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).context(format!("stat: {path:?}")),
    };
    let mtime_nanos = metadata
        .modified()
        .with_context(|| format!("mtime: {path:?}"))?
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();

    if metadata.is_dir() {
        let mut names = Vec::new();
        for entry in WalkDir::new(path).min_depth(1) {
            let entry = entry.with_context(|| format!("walk directory: {path:?}"))?;
            let relative = entry
                .path()
                .strip_prefix(path)
                .with_context(|| format!("relativize {:?}", entry.path()))?;
            names.push(relative.to_string_lossy().into_owned());
        }
        names.sort();
        let digest = blake3::hash(names.join("\n").as_bytes())
            .to_hex()
            .to_string();
        return Ok(Some(FileStamp {
            mtime_nanos,
            size: names.len() as u64,
            digest,
        }));
    }

    let mut file =
        std::fs::File::open(path).with_context(|| format!("open for hashing: {path:?}"))?;
    let mut hasher = blake3::Hasher::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let len = file
            .read(&mut buffer)
            .with_context(|| format!("read for hashing: {path:?}"))?;
        if len == 0 {
            break;
        }
        hasher.update(&buffer[..len]);
    }
    Ok(Some(FileStamp {
        mtime_nanos,
        size: metadata.len(),
        digest: hasher.finalize().to_hex().to_string(),
    }))
}

/// Per-run stamp memo. Producers invalidate their outputs after running
/// so consumers observe fresh stamps.
#[derive(Debug, Default)]
pub struct StampCache {
    entries: HashMap<PathBuf, Option<FileStamp>>,
}

impl StampCache {
    pub fn get(&mut self, path: &Path) -> Result<Option<FileStamp>> {
        if let Some(stamp) = self.entries.get(path) {
            return Ok(stamp.clone());
        }
        let stamp = stamp(path)?;
        trace!(?path, present = stamp.is_some(), "stamped path");
        self.entries.insert(path.to_path_buf(), stamp.clone());
        Ok(stamp)
    }

    pub fn invalidate(&mut self, path: &Path) {
        self.entries.remove(path);
    }
}

/// What was true about a command at its last successful run.
#[derive(Clone, Eq, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct CommandRecord {
    /// Stamps of every input at the time the run succeeded.
    pub inputs: BTreeMap<String, FileStamp>,
    /// Extra inputs the command's deps file declared.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub discovered_deps: Vec<String>,
}

/// The engine's cross-run memory, persisted beside the root registry.
#[derive(Clone, Eq, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct EngineState {
    pub commands: BTreeMap<String, CommandRecord>,
}

impl EngineState {
    /// Load from disk; a missing or unreadable state file just means a
    /// full rebuild.
    pub fn load(path: &Path) -> Self {
        match fs::read_optional(path) {
            Ok(Some(contents)) => match serde_json::from_str(&contents) {
                Ok(state) => state,
                Err(err) => {
                    warn!(?path, %err, "state file is unreadable, rebuilding from scratch");
                    Self::default()
                }
            },
            Ok(None) => Self::default(),
            Err(err) => {
                warn!(?path, %err, "state file is unreadable, rebuilding from scratch");
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let contents =
            serde_json::to_string_pretty(self).expect("engine state always serializes");
        fs::write_if_differ(path, &contents).context("write engine state")?;
        debug!(?path, commands = self.commands.len(), "saved engine state");
        Ok(())
    }
}

/// Stable identity of a command node across runs: the command line plus
/// its hard outputs.
pub fn command_identity(command: &str, outputs: &[String]) -> String {
    sha256_hex(&format!("{command}\u{0}{}", outputs.join("\u{0}")))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn stamps_files_and_absence() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("a.txt");
        assert_eq!(stamp(&file)?, None);

        fs::write_atomic(&file, "contents")?;
        let first = stamp(&file)?.expect("file exists");
        assert_eq!(first.size, 8);

        // Same content, same digest; mtime may move.
        let second = stamp(&file)?.expect("file exists");
        assert_eq!(first.digest, second.digest);
        Ok(())
    }

    #[test]
    fn directory_stamps_track_membership_only() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let tracked = dir.path().join("inputs");
        fs::create_dir_all(&tracked)?;
        fs::write_atomic(tracked.join("one.txt"), "foo")?;
        let before = stamp(&tracked)?.expect("directory exists");

        // Editing a member does not change the listing digest.
        fs::write_atomic(tracked.join("one.txt"), "changed")?;
        let edited = stamp(&tracked)?.expect("directory exists");
        assert_eq!(before.digest, edited.digest);

        // Adding a member does.
        fs::write_atomic(tracked.join("two.txt"), "bar")?;
        let added = stamp(&tracked)?.expect("directory exists");
        assert_ne!(before.digest, added.digest);
        assert_eq!(added.size, 2);
        Ok(())
    }

    #[test]
    fn state_survives_a_round_trip_and_tolerates_corruption() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("state.json");

        let mut state = EngineState::default();
        state.commands.insert(
            command_identity("cat a", &["b".into()]),
            CommandRecord {
                inputs: BTreeMap::from([(
                    "a".to_owned(),
                    FileStamp {
                        mtime_nanos: 1,
                        size: 2,
                        digest: "d".into(),
                    },
                )]),
                discovered_deps: vec!["extra".into()],
            },
        );
        state.save(&path)?;
        assert_eq!(EngineState::load(&path), state);

        fs::write_atomic(&path, "{corrupt")?;
        assert_eq!(EngineState::load(&path), EngineState::default());
        Ok(())
    }
}
