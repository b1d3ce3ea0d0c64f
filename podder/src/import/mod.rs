//! The image importer (C3): turns a fetched OCI image into a layer chain
//! using the layer store (spec §4.3).
//!
//! Each layer blob is extracted inside a short-lived user namespace mapping
//! the caller's own id plus its full subordinate uid/gid range (the same
//! mapping `launch` builds for a container's own namespace), so entries
//! owned by non-zero uids can be `chown`ed to something other than id 0
//! and whiteout entries can be written as real `0/0` character devices,
//! all without the extracting process needing any host privilege.

mod tarext;

use std::path::Path;

use crate::error::{Error, Result};
use crate::store::{Layer, LayerStore};

pub use tarext::extract_layer;

/// Derives the content-addressed store name for one image layer blob
/// (`sha256-<hex>`, filesystem-safe per the layer data model), so pulling
/// the same base image twice reuses the already-extracted layer instead of
/// re-extracting it (spec §4.3, re-pull idempotency).
fn content_layer_name(digest: &str) -> String {
    digest.replacen(':', "-", 1)
}

/// Imports `reference` into the store under `name`, extracting any layer
/// blob not already present and chaining them bottom-up (base layer
/// first, most recently pulled layer becomes `name`'s parent).
///
/// The resulting `name` layer carries an `[image]` section recording the
/// pulled reference and resolved manifest digest, purely as provenance for
/// `list`/`status` — it plays no part in effective-configuration merging
/// beyond being an ordinary inherited section.
pub async fn pull(
    store: &LayerStore,
    client: &podder_oci::Client,
    reference: &str,
    name: &str,
) -> Result<Layer> {
    let image = client.fetch(reference).await?;

    let mut parent: Option<String> = None;
    for blob in &image.layers {
        let layer_name = content_layer_name(&blob.digest);
        if store.resolve(&layer_name).is_err() {
            let layer = store.create(&layer_name, parent.as_deref(), None)?;
            extract_blob(&blob.data, &blob.media_type, &layer.root_dir())?;
            tracing::info!(layer = %layer_name, digest = %blob.digest, "extracted image layer");
        }
        parent = Some(layer_name);
    }

    if store.resolve(name).is_err() {
        let mut meta = crate::config::Config::empty();
        meta.set("image", "reference", reference);
        if let Some(digest) = &image.manifest_digest {
            meta.set("image", "digest", digest.as_str());
        }
        if let Some(image_config) = image.image_config() {
            meta.set_container_defaults(
                &image_config.command(),
                image_config.env.as_deref().unwrap_or_default(),
                image_config.working_dir.as_deref(),
            );
        }
        store.create(name, parent.as_deref(), Some(&meta))?;
    }
    tracing::info!(name, reference, "pulled image");
    store.resolve(name)
}

/// Extracts `data` inside a short-lived user namespace mapping the same
/// subordinate uid/gid ranges the namespace launcher uses (spec §4.5), not
/// just the caller's own single id: a layer tar commonly contains entries
/// owned by non-zero uids, and without the subordinate range mapped in,
/// `chown`s for anything but uid/gid 0 fail inside the namespace.
///
/// The extraction happens in a forked child; the parent writes the child's
/// `uid_map`/`gid_map` (an unprivileged process can only self-map a single
/// id, but can write an arbitrary multi-range map for a *child's* namespace
/// — the same constraint `launch::write_id_maps` works around), so the two
/// synchronize over a pipe before the child proceeds.
#[cfg(unix)]
fn extract_blob(data: &[u8], media_type: &str, dest: &Path) -> Result<()> {
    use nix::sched::{CloneFlags, unshare};
    use nix::sys::wait::waitpid;
    use nix::unistd::{ForkResult, fork, getgid, getuid, pipe, read, write};

    let (ready_r, ready_w) = pipe().map_err(|e| Error::NamespaceSetupFailed(e.to_string()))?;
    let (go_r, go_w) = pipe().map_err(|e| Error::NamespaceSetupFailed(e.to_string()))?;
    let (status_r, status_w) =
        pipe().map_err(|e| Error::NamespaceSetupFailed(e.to_string()))?;
    let owner_uid = getuid().as_raw();
    let owner_gid = getgid().as_raw();

    // Safety: the forked child only runs the closure below before exiting;
    // it never returns into the caller's stack.
    match unsafe { fork() }.map_err(|e| Error::NamespaceSetupFailed(e.to_string()))? {
        ForkResult::Parent { child } => {
            drop(ready_w);
            drop(go_r);
            drop(status_w);

            let mut ready = [0u8; 1];
            let _ = read(&ready_r, &mut ready);

            let map_result = crate::launch::write_id_maps(child, owner_uid, owner_gid);
            let _ = write(&go_w, &[u8::from(map_result.is_ok())]);
            drop(go_w);

            let mut buf = [0u8; 1];
            let _ = read(&status_r, &mut buf);
            let _ = waitpid(child, None);
            map_result?;
            if buf.first() == Some(&1) {
                Ok(())
            } else {
                Err(Error::NamespaceSetupFailed(format!(
                    "layer extraction into {} failed",
                    dest.display()
                )))
            }
        }
        ForkResult::Child => {
            drop(ready_r);
            drop(go_w);
            drop(status_r);

            let result = (|| -> Result<()> {
                unshare(CloneFlags::CLONE_NEWUSER)
                    .map_err(|e| Error::NamespaceSetupFailed(e.to_string()))?;
                write(&ready_w, &[1]).map_err(|e| Error::NamespaceSetupFailed(e.to_string()))?;

                let mut go = [0u8; 1];
                read(&go_r, &mut go).map_err(|e| Error::NamespaceSetupFailed(e.to_string()))?;
                if go.first() != Some(&1) {
                    return Err(Error::NamespaceSetupFailed(
                        "parent failed to write id maps".to_owned(),
                    ));
                }

                tarext::extract_layer(data, media_type, dest)
            })();
            let _ = write(&status_w, &[u8::from(result.is_ok())]);
            std::process::exit(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_layer_name_is_stable_for_a_given_digest() {
        let a = content_layer_name("sha256:abcdef0123456789abcdef0123456789");
        let b = content_layer_name("sha256:abcdef0123456789abcdef0123456789");
        assert_eq!(a, b);
        assert_eq!(a, "sha256-abcdef0123456789abcdef0123456789");
    }

    #[test]
    fn content_layer_name_differs_across_digests() {
        let a = content_layer_name("sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
        let b = content_layer_name("sha256:bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb");
        assert_ne!(a, b);
    }
}
