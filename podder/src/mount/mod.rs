//! The mount planner (C4): builds the overlayfs lower/upper/work plan from
//! a layer chain and performs the overlay + auxiliary mounts (spec §4.4).
//!
//! Grounded on the `vibesrc-coop` sandbox namespace module's
//! `child_setup_fs`/`setup_overlay`/`setup_bind_mounts` sequence: make
//! mount propagation private first, then overlay, then the auxiliary
//! mounts, then `pivot_root`.

use std::path::{Path, PathBuf};

use crate::config::StorageConfig;
use crate::error::{Error, Result};
use crate::store::Layer;

/// A fully resolved mount plan for one `start`.
#[derive(Debug, Clone)]
pub struct MountPlan {
    /// Lowerdirs in overlay mount-string order: the chain root (`Lk`) comes
    /// first, the layer immediately below the top (`L1`) comes last, and —
    /// in ephemeral mode — the top layer's own `root/` is appended after
    /// that. Overlayfs gives the *last*-listed lowerdir the highest
    /// precedence among lowers (the first is the "least" one, per the
    /// `nya3jp-cros-bazel` container-mount helper this is grounded on), so
    /// this ordering makes more recently stacked layers correctly shadow
    /// older ones.
    pub lowerdirs: Vec<PathBuf>,
    /// Overlay upperdir.
    pub upperdir: PathBuf,
    /// Overlay workdir (must be on the same filesystem as `upperdir`).
    pub workdir: PathBuf,
    /// Overlay mount point — `L0/merged`.
    pub merged: PathBuf,
    /// The tmpfs mount point backing `upperdir`/`workdir` in ephemeral mode.
    pub ephemeral_tmpfs: Option<PathBuf>,
}

impl MountPlan {
    /// Builds the plan for the given chain (leaf-first, as returned by
    /// `LayerStore::chain`) and its effective storage configuration.
    pub fn build(chain: &[Layer], storage: &StorageConfig) -> Result<Self> {
        let top = chain.first().ok_or_else(|| {
            Error::ConfigInvalid("mount plan requires a non-empty chain".to_owned())
        })?;
        let ancestors = &chain[1..];

        // `chain` is leaf-first ([L0, L1, .., Lk]); the overlay mount
        // string wants the deepest ancestor first, so reverse it.
        let mut lowerdirs: Vec<PathBuf> = ancestors.iter().rev().map(Layer::root_dir).collect();
        let (upperdir, workdir, ephemeral_tmpfs) = if storage.ephemeral {
            lowerdirs.push(top.root_dir());
            let run = top.run_dir();
            (run.join("upper"), run.join("work"), Some(run))
        } else {
            (top.root_dir(), top.run_dir().join("work"), None)
        };

        if lowerdirs.is_empty() {
            return Err(Error::ConfigInvalid(format!(
                "layer {} has no lower directories to mount",
                top.name()
            )));
        }

        Ok(Self {
            lowerdirs,
            upperdir,
            workdir,
            merged: top.merged_dir(),
            ephemeral_tmpfs,
        })
    }

    /// Renders the `lowerdir=...` option value in overlay syntax.
    #[must_use]
    pub fn lowerdir_option(&self) -> String {
        self.lowerdirs
            .iter()
            .map(|p| p.to_string_lossy())
            .collect::<Vec<_>>()
            .join(":")
    }
}

#[cfg(unix)]
mod linux {
    use std::os::unix::fs::FileTypeExt;
    use std::path::Path;

    use nix::mount::{MntFlags, MsFlags, mount, umount2};
    use nix::sys::stat::{Mode, SFlag, mknod};

    use super::MountPlan;
    use crate::error::{Error, Result};

    fn mount_err(what: &str, e: impl std::fmt::Display) -> Error {
        Error::MountFailed(format!("{what}: {e}"))
    }

    /// Makes mount propagation private for the whole tree, so none of the
    /// mounts performed from here leak to the host (spec §4.4 "propagation
    /// is made private on entry").
    pub fn make_private() -> Result<()> {
        mount(
            None::<&str>,
            "/",
            None::<&str>,
            MsFlags::MS_REC | MsFlags::MS_PRIVATE,
            None::<&str>,
        )
        .map_err(|e| mount_err("make mount propagation private", e))
    }

    /// Mounts the ephemeral tmpfs (if any), then the overlay union at
    /// `plan.merged`.
    pub fn mount_overlay(plan: &MountPlan) -> Result<()> {
        if let Some(run) = &plan.ephemeral_tmpfs {
            std::fs::create_dir_all(run)?;
            mount(
                Some("tmpfs"),
                run,
                Some("tmpfs"),
                MsFlags::MS_NOSUID,
                None::<&str>,
            )
            .map_err(|e| mount_err("mount ephemeral tmpfs", e))?;
        }
        std::fs::create_dir_all(&plan.upperdir)?;
        std::fs::create_dir_all(&plan.workdir)?;
        std::fs::create_dir_all(&plan.merged)?;

        let options = format!(
            "lowerdir={},upperdir={},workdir={}",
            plan.lowerdir_option(),
            plan.upperdir.display(),
            plan.workdir.display(),
        );
        mount(
            Some("overlay"),
            &plan.merged,
            Some("overlay"),
            MsFlags::MS_NOSUID,
            Some(options.as_str()),
        )
        .map_err(|e| mount_err("mount overlay", e))
    }

    /// Performs `pivot_root` into `new_root` and `chdir`s to `/`. The old
    /// root filesystem is left mounted at `/.podder-old-root` — `mount_aux`
    /// still needs it as the bind-mount source for the minimal device set
    /// and the re-exposed `/run` tmpfs — so callers must not tear it down
    /// until after `mount_aux` runs; use [`unmount_old_root`] for that.
    pub fn pivot_root(new_root: &Path) -> Result<()> {
        let old_root = new_root.join(".podder-old-root");
        std::fs::create_dir_all(&old_root)?;

        nix::unistd::pivot_root(new_root, &old_root)
            .map_err(|e| mount_err("pivot_root", e))?;
        std::env::set_current_dir("/")?;
        Ok(())
    }

    /// Lazily unmounts and removes `/.podder-old-root`. Must be called after
    /// `mount_aux` (spec §4.4): the device set and `/run` re-exposure both
    /// bind-mount from under the old root, which disappears once this runs.
    pub fn unmount_old_root() -> Result<()> {
        umount2("/.podder-old-root", MntFlags::MNT_DETACH)
            .map_err(|e| mount_err("unmount old root", e))?;
        std::fs::remove_dir("/.podder-old-root").ok();
        Ok(())
    }

    /// Mounts `/proc`, `/sys`, `/dev`, `/dev/pts`, and re-exposes `/run`
    /// inside the new root (must be called after `pivot_root` and before
    /// `unmount_old_root`, spec §4.4).
    pub fn mount_aux(run_source: Option<&Path>) -> Result<()> {
        std::fs::create_dir_all("/proc")?;
        mount(
            Some("proc"),
            "/proc",
            Some("proc"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
            None::<&str>,
        )
        .map_err(|e| mount_err("mount /proc", e))?;

        std::fs::create_dir_all("/sys")?;
        mount(
            Some("/sys"),
            "/sys",
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(|e| mount_err("bind-mount /sys", e))?;
        mount(
            None::<&str>,
            "/sys",
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(|e| mount_err("remount /sys read-only", e))?;

        std::fs::create_dir_all("/dev")?;
        mount(
            Some("tmpfs"),
            "/dev",
            Some("tmpfs"),
            MsFlags::MS_NOSUID,
            Some("mode=0755"),
        )
        .map_err(|e| mount_err("mount /dev tmpfs", e))?;

        for name in ["null", "zero", "full", "random", "urandom", "tty", "ptmx"] {
            let host = format!("/.podder-old-root/dev/{name}");
            let target = format!("/dev/{name}");
            if !Path::new(&host).exists() {
                continue;
            }
            std::fs::write(&target, b"").ok();
            if let Err(e) = mount(
                Some(host.as_str()),
                target.as_str(),
                None::<&str>,
                MsFlags::MS_BIND,
                None::<&str>,
            ) {
                tracing::warn!(device = name, error = %e, "failed to bind-mount device node");
            }
        }

        std::fs::create_dir_all("/dev/pts")?;
        mount(
            Some("devpts"),
            "/dev/pts",
            Some("devpts"),
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
            Some("newinstance,ptmxmode=0666,mode=0620"),
        )
        .map_err(|e| mount_err("mount /dev/pts", e))?;

        std::fs::create_dir_all("/run")?;
        if let Some(source) = run_source {
            // `source` is the tmpfs backing overlay upper/work as it was
            // reachable before `pivot_root`; find it under the relocated old
            // root rather than at its original absolute path, which now
            // resolves (if at all) against the new root instead.
            let host = Path::new("/.podder-old-root")
                .join(source.strip_prefix("/").unwrap_or(source));
            mount(
                Some(&host),
                "/run",
                None::<&str>,
                MsFlags::MS_BIND,
                None::<&str>,
            )
            .map_err(|e| mount_err("bind-mount /run", e))?;
        } else {
            mount(
                Some("tmpfs"),
                "/run",
                Some("tmpfs"),
                MsFlags::MS_NOSUID,
                None::<&str>,
            )
            .map_err(|e| mount_err("mount /run tmpfs", e))?;
        }

        Ok(())
    }

    /// Creates a character-device whiteout marker (`0/0`) at `path`, used
    /// both by the tar importer (spec §4.3) and directly testable here.
    pub fn mknod_whiteout(path: &Path) -> Result<()> {
        mknod(
            path,
            SFlag::S_IFCHR,
            Mode::empty(),
            nix::sys::stat::makedev(0, 0),
        )
        .map_err(|e| mount_err("mknod whiteout", e))
    }

    /// Returns whether `path` is itself a character device with major/minor
    /// `0/0` — the overlayfs whiteout convention.
    #[must_use]
    pub fn is_whiteout_device(path: &Path) -> bool {
        let Ok(meta) = std::fs::symlink_metadata(path) else {
            return false;
        };
        if !meta.file_type().is_char_device() {
            return false;
        }
        let rdev = std::os::unix::fs::MetadataExt::rdev(&meta);
        rdev == 0
    }
}

#[cfg(unix)]
pub use linux::{
    make_private, mknod_whiteout, mount_aux, mount_overlay, pivot_root, unmount_old_root,
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LayerStore;

    #[test]
    fn ephemeral_plan_appends_top_layer_as_highest_priority_lower() {
        let dir = tempfile::tempdir().unwrap();
        let store = LayerStore::open(dir.path()).unwrap();
        store.create("base", None, None).unwrap();
        store.create("top", Some("base"), None).unwrap();

        let chain = store.chain("top").unwrap();
        let plan = MountPlan::build(&chain, &StorageConfig { ephemeral: true }).unwrap();

        assert_eq!(plan.lowerdirs.len(), 2);
        assert_eq!(plan.lowerdirs[0], chain[1].root_dir());
        assert_eq!(plan.lowerdirs[1], chain[0].root_dir());
        assert!(plan.ephemeral_tmpfs.is_some());
    }

    #[test]
    fn three_layer_chain_orders_lowers_deepest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = LayerStore::open(dir.path()).unwrap();
        store.create("base", None, None).unwrap();
        store.create("mid", Some("base"), None).unwrap();
        store.create("leaf", Some("mid"), None).unwrap();

        let chain = store.chain("leaf").unwrap();
        let plan = MountPlan::build(&chain, &StorageConfig { ephemeral: false }).unwrap();

        // chain() is leaf-first: [leaf, mid, base]. Ancestors are
        // [mid, base]; the overlay string wants deepest (base) first.
        assert_eq!(plan.lowerdirs, vec![chain[2].root_dir(), chain[1].root_dir()]);
    }

    #[test]
    fn persistent_plan_uses_top_root_as_upper() {
        let dir = tempfile::tempdir().unwrap();
        let store = LayerStore::open(dir.path()).unwrap();
        store.create("base", None, None).unwrap();
        store.create("top", Some("base"), None).unwrap();

        let chain = store.chain("top").unwrap();
        let plan = MountPlan::build(&chain, &StorageConfig { ephemeral: false }).unwrap();

        assert_eq!(plan.upperdir, chain[0].root_dir());
        assert_eq!(plan.lowerdirs, vec![chain[1].root_dir()]);
        assert!(plan.ephemeral_tmpfs.is_none());
    }

    #[test]
    fn root_layer_plan_has_at_least_one_lower() {
        let dir = tempfile::tempdir().unwrap();
        let store = LayerStore::open(dir.path()).unwrap();
        store.create("only", None, None).unwrap();

        let chain = store.chain("only").unwrap();
        let plan = MountPlan::build(&chain, &StorageConfig { ephemeral: true }).unwrap();
        assert_eq!(plan.lowerdirs.len(), 1);
    }
}
