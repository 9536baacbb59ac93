//! Patch manifest: the sidecar that travels with a binary through the
//! patch pipeline.
//!
//! The manifest records byte ranges that earlier patch steps consume as
//! data (and that must therefore never be rewritten), single junk bytes
//! that may be overwritten exactly once, and audit metadata about the last
//! save. It is serialised as JSON next to the ELF as
//! `<elf>.ebp.manifest`; unknown keys are ignored on load so older
//! manifests stay readable.

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Extension appended to the ELF file name to form the sidecar path.
const MANIFEST_SUFFIX: &str = ".ebp.manifest";

fn default_message() -> String {
    "There is no recorded description of this dependency.".to_owned()
}

/// A byte range some emitted instruction reads from.
///
/// The writer checks this list before every write and refuses to touch a
/// registered range. Note it does not check whether the value would
/// actually change; it gets angry if you even try.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataDependency {
    /// Virtual address the dependency starts at.
    pub address: u64,
    /// Number of bytes covered.
    pub length: u32,
    /// Why this range matters.
    #[serde(default = "default_message")]
    pub message: String,
}

impl DataDependency {
    pub fn new(address: u64, length: u32, message: impl Into<String>) -> Self {
        Self {
            address,
            length,
            message: message.into(),
        }
    }

    /// End of the range (exclusive).
    pub fn end(&self) -> u64 {
        self.address + u64::from(self.length)
    }

    /// Whether `[va, va+len)` overlaps this dependency.
    pub fn collides_with(&self, va: u64, len: usize) -> bool {
        len > 0 && va < self.end() && self.address < va + len as u64
    }
}

impl fmt::Display for DataDependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "0x{:08x} -> 0x{:08x} ({} bytes): {}",
            self.address,
            self.end(),
            self.length,
            self.message
        )
    }
}

/// Persistent record of the patch process for one binary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatchManifest {
    /// When the binary was last written.
    #[serde(default)]
    pub last_saved: Option<DateTime<Utc>>,
    /// Where the binary was last written to.
    #[serde(default)]
    pub last_saved_path: Option<PathBuf>,
    /// Ranges in use as data; writing over them is forbidden.
    #[serde(default)]
    pub data_dependencies: Vec<DataDependency>,
    /// Single bytes holding junk values that can be changed at will, once.
    #[serde(default)]
    pub junk_offsets: Vec<u64>,
}

impl PatchManifest {
    /// Sidecar path for the given ELF path.
    pub fn path_for(elf_path: &Path) -> PathBuf {
        let mut name = elf_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        name.push_str(MANIFEST_SUFFIX);
        elf_path.with_file_name(name)
    }

    /// Load the manifest accompanying `elf_path`, or start a fresh one if
    /// no sidecar exists yet.
    pub fn load_for(elf_path: &Path) -> Result<Self> {
        let path = Self::path_for(elf_path);
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(&path)?;
        let manifest = serde_json::from_str(&contents)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
        Ok(manifest)
    }

    /// Persist the manifest next to the ELF being saved at `elf_path`.
    ///
    /// Written to a sibling temporary file and renamed into place so a
    /// crash never leaves a half-written sidecar.
    pub fn save(&mut self, elf_path: &Path) -> Result<()> {
        self.last_saved = Some(Utc::now());
        self.last_saved_path = Some(elf_path.to_path_buf());

        let path = Self::path_for(elf_path);
        let directory = path.parent().unwrap_or_else(|| Path::new("."));
        let mut file = tempfile::NamedTempFile::new_in(directory)?;
        let json = serde_json::to_string_pretty(self)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
        file.write_all(json.as_bytes())?;
        file.persist(&path).map_err(|err| err.error)?;
        Ok(())
    }

    /// Whether any byte of `[va, va+len)` is inside a dependency range.
    pub fn has_dependency(&self, va: u64, len: usize) -> bool {
        self.data_dependencies
            .iter()
            .any(|dep| dep.collides_with(va, len))
    }

    /// All dependencies colliding with `[va, va+len)`.
    pub fn collisions(&self, va: u64, len: usize) -> impl Iterator<Item = &DataDependency> {
        self.data_dependencies
            .iter()
            .filter(move |dep| dep.collides_with(va, len))
    }

    /// Record a new dependency, consuming any junk offsets it covers.
    pub fn record_dependency(&mut self, va: u64, len: u32, message: impl Into<String>) {
        self.junk_offsets
            .retain(|&junk| junk < va || junk >= va + u64::from(len));
        self.data_dependencies
            .push(DataDependency::new(va, len, message));
    }

    /// Deep copy used before tentative patching.
    pub fn snapshot(&self) -> Self {
        self.clone()
    }

    /// Replace the current state wholesale (tentative patch rollback).
    pub fn restore(&mut self, snapshot: Self) {
        *self = snapshot;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collision_detection() {
        let dep = DataDependency::new(0x100, 4, "xor base");
        assert!(dep.collides_with(0x100, 1));
        assert!(dep.collides_with(0x103, 1));
        assert!(dep.collides_with(0xfe, 4));
        assert!(!dep.collides_with(0x104, 4));
        assert!(!dep.collides_with(0xfc, 4));
        assert!(!dep.collides_with(0x100, 0));
    }

    #[test]
    fn test_record_dependency_consumes_junk() {
        let mut manifest = PatchManifest::default();
        manifest.junk_offsets = vec![0x10, 0x20, 0x30];
        manifest.record_dependency(0x1f, 4, "claimed");
        assert_eq!(manifest.junk_offsets, vec![0x10, 0x30]);
        assert!(manifest.has_dependency(0x20, 1));
    }

    #[test]
    fn test_snapshot_restore_is_idempotent() {
        let mut manifest = PatchManifest::default();
        manifest.record_dependency(0x100, 8, "seed");
        manifest.junk_offsets.push(0x200);

        let snapshot = manifest.snapshot();
        manifest.record_dependency(0x300, 2, "speculative");
        manifest.junk_offsets.push(0x400);
        manifest.restore(snapshot.clone());

        assert_eq!(manifest, snapshot);
    }

    #[test]
    fn test_sidecar_path() {
        let path = PatchManifest::path_for(Path::new("/tmp/build/internal.elf"));
        assert_eq!(
            path,
            PathBuf::from("/tmp/build/internal.elf.ebp.manifest")
        );
    }

    #[test]
    fn test_json_round_trip_ignores_unknown_keys() {
        let json = r#"{
            "last_saved": "2024-03-01T12:00:00Z",
            "last_saved_path": "/tmp/out.elf",
            "data_dependencies": [{"address": 16, "length": 2, "message": "m"}],
            "junk_offsets": [7],
            "some_future_key": true
        }"#;
        let manifest: PatchManifest = serde_json::from_str(json).unwrap();
        assert_eq!(manifest.junk_offsets, vec![7]);
        assert_eq!(manifest.data_dependencies.len(), 1);
        assert!(manifest.last_saved.is_some());
    }

    #[test]
    fn test_dependency_message_defaults() {
        let json = r#"{"data_dependencies": [{"address": 1, "length": 1}]}"#;
        let manifest: PatchManifest = serde_json::from_str(json).unwrap();
        assert!(!manifest.data_dependencies[0].message.is_empty());
    }
}
