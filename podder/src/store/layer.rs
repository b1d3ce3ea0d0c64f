//! A single layer directory and the paths within it (spec §3).

use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::error::Result;

/// A layer directory identified by a human-readable name.
///
/// Holds only the name and the store root it lives under — the parent link
/// is resolved on demand from disk, never cached as an owning reference, so
/// there's no possibility of an owning cycle (spec Design Note, §9).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    name: String,
    path: PathBuf,
}

impl Layer {
    pub(crate) fn new(store_root: &Path, name: impl Into<String>) -> Self {
        let name = name.into();
        let path = store_root.join(&name);
        Self { name, path }
    }

    /// The layer's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The layer's directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `{layer}/root` — the layer's own filesystem contents.
    #[must_use]
    pub fn root_dir(&self) -> PathBuf {
        self.path.join("root")
    }

    /// `{layer}/merged` — mount point for the assembled overlay union.
    #[must_use]
    pub fn merged_dir(&self) -> PathBuf {
        self.path.join("merged")
    }

    /// `{layer}/run` — mount point for the ephemeral tmpfs (upper+work+`/run`).
    #[must_use]
    pub fn run_dir(&self) -> PathBuf {
        self.path.join("run")
    }

    /// `{layer}/config.ini`.
    #[must_use]
    pub fn config_path(&self) -> PathBuf {
        self.path.join("config.ini")
    }

    /// `{layer}/parent`.
    #[must_use]
    pub fn parent_path(&self) -> PathBuf {
        self.path.join("parent")
    }

    /// `{layer}/init.pid`.
    #[must_use]
    pub fn init_pid_path(&self) -> PathBuf {
        self.path.join("init.pid")
    }

    /// Reads this layer's own (non-inherited) configuration.
    pub fn config(&self) -> Result<Config> {
        Config::load(&self.config_path())
    }

    /// Reads the name of this layer's parent, if any. Absent means the
    /// layer is a chain root.
    pub fn parent_name(&self) -> Result<Option<String>> {
        let path = self.parent_path();
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)?;
        let name = raw.trim();
        Ok(if name.is_empty() {
            None
        } else {
            Some(name.to_owned())
        })
    }
}
