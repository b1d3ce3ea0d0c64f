//! Tar extraction for one OCI layer blob, including the whiteout and
//! opaque-directory conventions from the OCI image spec (spec §4.3).

use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use tar::{Archive, EntryType};

use crate::error::{Error, Result};
use crate::mount;

/// Extracts a layer blob into `dest` (a layer's `root/` directory),
/// selecting the decompressor from the blob's media type. Media types that
/// aren't a (gzip/zstd/uncompressed) tar layer are rejected rather than
/// guessed at, per spec §7's `UnsupportedMediaType` error kind.
pub fn extract_layer(reader: impl Read, media_type: &str, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)?;
    if !media_type.contains("tar") {
        return Err(Error::UnsupportedMediaType(media_type.to_owned()));
    }
    if media_type.contains("gzip") {
        extract_tar(flate2::read::GzDecoder::new(reader), dest)
    } else if media_type.contains("zstd") {
        let decoder = zstd::stream::read::Decoder::new(reader)
            .map_err(|e| Error::ConfigInvalid(format!("zstd layer: {e}")))?;
        extract_tar(decoder, dest)
    } else {
        extract_tar(reader, dest)
    }
}

fn extract_tar(reader: impl Read, dest: &Path) -> Result<()> {
    let mut archive = Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_unpack_xattrs(false);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let raw_path = entry.path()?.into_owned();
        let rel = sanitize_path(&raw_path)?;
        let target = dest.join(&rel);

        if let Some(name) = rel.file_name().and_then(|n| n.to_str()) {
            if name == ".wh..wh..opq" {
                let parent = target.parent().unwrap_or(dest);
                fs::create_dir_all(parent)?;
                xattr::set(parent, "trusted.overlay.opaque", b"y")
                    .map_err(|e| Error::Io(std::io::Error::other(e)))?;
                continue;
            }
            if let Some(victim) = name.strip_prefix(".wh.") {
                let parent = target.parent().unwrap_or(dest);
                fs::create_dir_all(parent)?;
                let whiteout_path = parent.join(victim);
                // Remove a previous entry at this path first: within a
                // single layer a whiteout always wins, and mknod fails over
                // an existing directory.
                let _ = fs::remove_file(&whiteout_path);
                let _ = fs::remove_dir_all(&whiteout_path);
                mount::mknod_whiteout(&whiteout_path)?;
                continue;
            }
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let entry_type = entry.header().entry_type();
        let owner = (entry.header().uid().ok(), entry.header().gid().ok());
        match entry_type {
            EntryType::Directory => {
                fs::create_dir_all(&target)?;
            }
            EntryType::Char | EntryType::Block => {
                // Device nodes need CAP_MKNOD; extraction already runs
                // inside a namespace mapping the caller's subordinate id
                // ranges (see `import::pull`) so this usually succeeds, but
                // a host with no subordinate id ranges configured may still
                // lack it. Downgrade rather than fail the whole pull over
                // one device entry.
                if let Err(e) = entry.unpack(&target) {
                    tracing::warn!(path = %rel.display(), error = %e, "failed to create device node");
                }
            }
            _ => {
                entry.unpack(&target)?;
            }
        }
        preserve_owner(&target, owner, &rel);
    }
    Ok(())
}

/// Chowns `target` to the uid/gid recorded in its tar header (spec §4.3:
/// "preserve owner, within the mapped range"). Ids outside the namespace's
/// mapped subordinate range can't be chowned to and are left as whatever
/// the extracting process's own id mapped to; that's downgraded to a
/// warning rather than failing the extraction.
fn preserve_owner(target: &Path, owner: (Option<u64>, Option<u64>), rel: &Path) {
    let (Some(uid), Some(gid)) = owner else {
        return;
    };
    let uid = nix::unistd::Uid::from_raw(uid as u32);
    let gid = nix::unistd::Gid::from_raw(gid as u32);
    if let Err(e) = nix::unistd::chown(target, Some(uid), Some(gid)) {
        tracing::warn!(path = %rel.display(), error = %e, "failed to preserve entry ownership");
    }
}

/// Rejects absolute paths and `..` components, returning the path to
/// extract to relative to the destination root.
fn sanitize_path(path: &Path) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::ConfigInvalid(format!(
                    "tar entry escapes extraction root: {}",
                    path.display()
                )));
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn build_tar(entries: &[(&str, tar::EntryType, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, kind, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(*kind);
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn extracts_regular_files_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        let tar_bytes = build_tar(&[
            ("etc/", tar::EntryType::Directory, b""),
            ("etc/motd", tar::EntryType::Regular, b"hello\n"),
        ]);
        extract_layer(tar_bytes.as_slice(), "application/vnd.oci.image.layer.v1.tar", dir.path())
            .unwrap();

        assert_eq!(
            fs::read_to_string(dir.path().join("etc/motd")).unwrap(),
            "hello\n"
        );
    }

    #[test]
    fn whiteout_entry_creates_char_0_0_device() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("etc")).unwrap();
        fs::write(dir.path().join("etc/shadow"), b"x").unwrap();

        let tar_bytes = build_tar(&[("etc/.wh.shadow", tar::EntryType::Regular, b"")]);
        extract_layer(tar_bytes.as_slice(), "application/vnd.oci.image.layer.v1.tar", dir.path())
            .unwrap();

        assert!(mount::is_whiteout_device(&dir.path().join("etc/shadow")));
    }

    #[test]
    fn opaque_marker_sets_overlay_xattr_on_directory() {
        let dir = tempfile::tempdir().unwrap();
        let tar_bytes = build_tar(&[(
            "var/cache/.wh..wh..opq",
            tar::EntryType::Regular,
            b"",
        )]);
        extract_layer(tar_bytes.as_slice(), "application/vnd.oci.image.layer.v1.tar", dir.path())
            .unwrap();

        let value = xattr::get(dir.path().join("var/cache"), "trusted.overlay.opaque").unwrap();
        assert_eq!(value, Some(b"y".to_vec()));
    }

    #[test]
    fn rejects_unsupported_media_type() {
        let dir = tempfile::tempdir().unwrap();
        let err = extract_layer(&b""[..], "application/vnd.oci.image.config.v1+json", dir.path())
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedMediaType(_)));
    }

    #[test]
    fn rejects_path_traversal() {
        assert!(sanitize_path(Path::new("../../etc/passwd")).is_err());
        assert!(sanitize_path(Path::new("/etc/passwd")).is_err());
        assert!(sanitize_path(Path::new("a/./b")).is_ok());
    }
}
