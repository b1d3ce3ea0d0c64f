//! The layer store (C1): on-disk layout, parent-chain traversal, config
//! inheritance, and the create/resolve/remove/list operations spec §4.1
//! names.

mod layer;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

pub use layer::Layer;

use crate::config::Config;
use crate::error::{Error, Result};

/// A store-wide summary of one layer, for the `list` operation.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct LayerSummary {
    /// The layer's name.
    pub name: String,
    /// The layer's parent, if any.
    pub parent: Option<String>,
    /// The PID of its init process, if currently running.
    pub running_pid: Option<u32>,
}

/// The layer store rooted at a single directory (spec §6: defaults to
/// `$XDG_DATA_HOME/podder` or `~/.local/share/podder`, overridable via
/// `PODDER_STORE`).
#[derive(Debug, Clone)]
pub struct LayerStore {
    root: PathBuf,
}

impl LayerStore {
    /// Opens (creating if necessary) the store at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Opens the store at the default location: `$PODDER_STORE`, else
    /// `$XDG_DATA_HOME/podder`, else `~/.local/share/podder`.
    pub fn open_default() -> Result<Self> {
        Self::open(default_store_root())
    }

    /// The store's root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves `name` to a [`Layer`], failing [`Error::NotFound`] if the
    /// directory doesn't exist.
    pub fn resolve(&self, name: &str) -> Result<Layer> {
        validate_name(name)?;
        let layer = Layer::new(&self.root, name);
        if !layer.path().is_dir() {
            return Err(Error::NotFound(name.to_owned()));
        }
        Ok(layer)
    }

    /// Follows `parent` from `name` to produce `[L0..Lk]`, `L0` being
    /// `name` and `Lk` a chain root. Fails [`Error::Cycle`] or
    /// [`Error::BrokenParent`].
    pub fn chain(&self, name: &str) -> Result<Vec<Layer>> {
        let mut seen = HashSet::new();
        let mut chain = Vec::new();
        let mut current = self.resolve(name)?;

        loop {
            if !seen.insert(current.name().to_owned()) {
                return Err(Error::Cycle(current.name().to_owned()));
            }
            let parent_name = current.parent_name()?;
            chain.push(current.clone());

            let Some(parent_name) = parent_name else {
                break;
            };
            current = self.resolve(&parent_name).map_err(|_| {
                Error::BrokenParent(chain.last().unwrap().name().to_owned(), parent_name)
            })?;
        }
        Ok(chain)
    }

    /// Creates a new layer named `name` with optional `parent` and own
    /// `config`. Atomic: stages into a sibling temp directory, then
    /// `rename`s into place (spec §4.1 "Atomicity"), grounded on the
    /// teacher's `DiskManager::create_base` staging pattern.
    pub fn create(&self, name: &str, parent: Option<&str>, config: Option<&Config>) -> Result<Layer> {
        validate_name(name)?;
        let layer = Layer::new(&self.root, name);
        if layer.path().is_dir() {
            return Err(Error::Exists(name.to_owned()));
        }
        if let Some(parent) = parent {
            self.resolve(parent)
                .map_err(|_| Error::NotFound(parent.to_owned()))?;
        }

        let staging = self.root.join(format!(".{name}.tmp-{}", std::process::id()));
        if staging.exists() {
            std::fs::remove_dir_all(&staging)?;
        }
        std::fs::create_dir_all(staging.join("root"))?;

        if let Some(parent) = parent {
            std::fs::write(staging.join("parent"), parent)?;
        }
        if let Some(config) = config {
            config.save(&staging.join("config.ini"))?;
        }

        std::fs::rename(&staging, layer.path())?;
        tracing::info!(layer = name, ?parent, "created layer");
        Ok(layer)
    }

    /// Folds the parent chain into a single effective configuration
    /// (spec §3): deepest ancestor first, requested layer's own config last
    /// (and therefore highest priority).
    pub fn effective_config(&self, name: &str) -> Result<Config> {
        let chain = self.chain(name)?;
        let configs: Vec<Config> = chain
            .iter()
            .rev() // chain() is leaf-first; merge wants root-first.
            .map(Layer::config)
            .collect::<Result<_>>()?;
        Ok(Config::merge_chain(configs.iter()))
    }

    /// Removes a layer. Fails [`Error::InUse`] if it's running, or
    /// [`Error::HasChildren`] if another layer names it as parent.
    pub fn remove(&self, name: &str) -> Result<()> {
        let layer = self.resolve(name)?;

        if self.is_running(name)?.is_some() {
            return Err(Error::InUse(name.to_owned()));
        }
        let children = self.children_of(name)?;
        if !children.is_empty() {
            return Err(Error::HasChildren(name.to_owned()));
        }

        std::fs::remove_dir_all(layer.path())?;
        tracing::info!(layer = name, "removed layer");
        Ok(())
    }

    /// Lists every layer name that declares `name` as its parent.
    pub fn children_of(&self, name: &str) -> Result<Vec<String>> {
        let mut children = Vec::new();
        for summary in self.list()? {
            if summary.parent.as_deref() == Some(name) {
                children.push(summary.name);
            }
        }
        Ok(children)
    }

    /// Enumerates every layer in the store.
    pub fn list(&self) -> Result<Vec<LayerSummary>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue; // staging directories
            }
            let layer = Layer::new(&self.root, &name);
            out.push(LayerSummary {
                parent: layer.parent_name()?,
                running_pid: self.is_running(&name)?,
                name,
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    /// Writes `init.pid` for `name`, exclusively — a concurrent `start` on
    /// the same layer fails [`Error::AlreadyRunning`] (spec §5).
    pub fn set_running(&self, name: &str, pid: u32) -> Result<()> {
        let layer = self.resolve(name)?;
        if self.is_running(name)?.is_some() {
            return Err(Error::AlreadyRunning(name.to_owned()));
        }
        use std::io::Write;
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(layer.init_pid_path())?;
        write!(f, "{pid}")?;
        Ok(())
    }

    /// Removes `init.pid` for `name`, if present.
    pub fn clear_running(&self, name: &str) -> Result<()> {
        let layer = self.resolve(name)?;
        let path = layer.init_pid_path();
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Returns the recorded PID iff the process still exists; a stale
    /// `init.pid` (no such process) is reaped and `None` is returned.
    pub fn is_running(&self, name: &str) -> Result<Option<u32>> {
        let layer = self.resolve(name)?;
        let path = layer.init_pid_path();
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)?;
        let Ok(pid) = raw.trim().parse::<u32>() else {
            std::fs::remove_file(&path)?;
            return Ok(None);
        };
        if process_alive(pid) {
            Ok(Some(pid))
        } else {
            std::fs::remove_file(&path)?;
            Ok(None)
        }
    }
}

/// Probes liveness with a zero-signal `kill`, per spec §4.6.
#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid as libc::pid_t), None).is_ok()
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    false
}

/// A layer name must be non-empty, contain no path separators or `..`, and
/// not collide with the store's own staging-directory convention.
fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.starts_with('.')
    {
        return Err(Error::ConfigInvalid(format!("invalid layer name: {name}")));
    }
    Ok(())
}

/// `$PODDER_STORE`, else `$XDG_DATA_HOME/podder`, else `~/.local/share/podder`.
fn default_store_root() -> PathBuf {
    if let Ok(dir) = std::env::var("PODDER_STORE") {
        return PathBuf::from(dir);
    }
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(xdg).join("podder");
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local/share/podder");
    }
    PathBuf::from("podder")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, LayerStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LayerStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn create_then_resolve_round_trips() {
        let (_dir, store) = store();
        store.create("base", None, None).unwrap();
        let layer = store.resolve("base").unwrap();
        assert_eq!(layer.name(), "base");
        assert!(layer.root_dir().is_dir());
    }

    #[test]
    fn create_requires_existing_parent() {
        let (_dir, store) = store();
        let err = store.create("child", Some("missing"), None).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn create_rejects_duplicate_name() {
        let (_dir, store) = store();
        store.create("base", None, None).unwrap();
        let err = store.create("base", None, None).unwrap_err();
        assert!(matches!(err, Error::Exists(_)));
    }

    #[test]
    fn chain_follows_parent_links_leaf_first() {
        let (_dir, store) = store();
        store.create("root", None, None).unwrap();
        store.create("mid", Some("root"), None).unwrap();
        store.create("leaf", Some("mid"), None).unwrap();

        let names: Vec<_> = store
            .chain("leaf")
            .unwrap()
            .into_iter()
            .map(|l| l.name().to_owned())
            .collect();
        assert_eq!(names, vec!["leaf", "mid", "root"]);
    }

    #[test]
    fn chain_detects_broken_parent() {
        let (_dir, store) = store();
        store.create("leaf", None, None).unwrap();
        std::fs::write(store.resolve("leaf").unwrap().parent_path(), "ghost").unwrap();
        let err = store.chain("leaf").unwrap_err();
        assert!(matches!(err, Error::BrokenParent(_, _)));
    }

    #[test]
    fn effective_config_folds_root_to_leaf() {
        let (_dir, store) = store();
        let mut root_cfg = Config::empty();
        root_cfg.set("storage", "ephemeral", "false");
        store.create("root", None, Some(&root_cfg)).unwrap();

        let mut leaf_cfg = Config::empty();
        leaf_cfg.set("container", "hostname", "leaf");
        store.create("leaf", Some("root"), Some(&leaf_cfg)).unwrap();

        let effective = store.effective_config("leaf").unwrap();
        assert_eq!(effective.get("storage", "ephemeral"), Some("false"));
        assert_eq!(effective.get("container", "hostname"), Some("leaf"));
    }

    #[test]
    fn remove_fails_with_children() {
        let (_dir, store) = store();
        store.create("root", None, None).unwrap();
        store.create("leaf", Some("root"), None).unwrap();
        let err = store.remove("root").unwrap_err();
        assert!(matches!(err, Error::HasChildren(_)));
    }

    #[test]
    fn remove_fails_while_running() {
        let (_dir, store) = store();
        store.create("base", None, None).unwrap();
        store.set_running("base", std::process::id()).unwrap();
        let err = store.remove("base").unwrap_err();
        assert!(matches!(err, Error::InUse(_)));
    }

    #[test]
    fn set_running_twice_fails_already_running() {
        let (_dir, store) = store();
        store.create("base", None, None).unwrap();
        store.set_running("base", std::process::id()).unwrap();
        let err = store.set_running("base", std::process::id()).unwrap_err();
        assert!(matches!(err, Error::AlreadyRunning(_)));
    }

    #[test]
    fn is_running_reaps_stale_pid_file() {
        let (_dir, store) = store();
        store.create("base", None, None).unwrap();
        let layer = store.resolve("base").unwrap();
        // A PID essentially guaranteed not to exist.
        std::fs::write(layer.init_pid_path(), "999999999").unwrap();
        assert_eq!(store.is_running("base").unwrap(), None);
        assert!(!layer.init_pid_path().exists());
    }

    #[test]
    fn list_reports_parent_and_running_state() {
        let (_dir, store) = store();
        store.create("root", None, None).unwrap();
        store.create("leaf", Some("root"), None).unwrap();
        store.set_running("leaf", std::process::id()).unwrap();

        let summaries = store.list().unwrap();
        let leaf = summaries.iter().find(|s| s.name == "leaf").unwrap();
        assert_eq!(leaf.parent.as_deref(), Some("root"));
        assert_eq!(leaf.running_pid, Some(std::process::id()));
    }
}
