//! End-to-end layer-store scenarios that don't need namespace/mount
//! privilege: chain resolution, config inheritance, and the mount plan a
//! `start` would build from them, exercised against a real on-disk store
//! rather than the pure-function unit tests colocated with each module.

use podder::config::Config;
use podder::mount::MountPlan;
use podder::{Error, LayerStore};

fn open_store() -> (tempfile::TempDir, LayerStore) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = LayerStore::open(dir.path()).expect("open store");
    (dir, store)
}

/// Mirrors spec §8 scenario 3: `create persistent --parent ubuntu` with
/// `ephemeral=false`, stacking a second layer on a base and resolving the
/// effective configuration and mount plan together.
#[test]
fn persistent_layer_stacks_on_base_with_merged_config() {
    let (_dir, store) = open_store();

    let mut base_cfg = Config::empty();
    base_cfg.set("storage", "ephemeral", "true");
    base_cfg.set("container", "command", "/bin/sh");
    store.create("ubuntu", None, Some(&base_cfg)).unwrap();

    let mut leaf_cfg = Config::empty();
    leaf_cfg.set("storage", "ephemeral", "false");
    store.create("persistent", Some("ubuntu"), Some(&leaf_cfg)).unwrap();

    let effective = store.effective_config("persistent").unwrap();
    assert_eq!(effective.get("storage", "ephemeral"), Some("false"));
    assert_eq!(effective.get("container", "command"), Some("/bin/sh"));

    let chain = store.chain("persistent").unwrap();
    let storage = effective.storage().unwrap();
    assert!(!storage.ephemeral);

    let plan = MountPlan::build(&chain, &storage).unwrap();
    assert_eq!(plan.upperdir, chain[0].root_dir());
    assert!(plan.ephemeral_tmpfs.is_none());
}

/// Mirrors spec §8 scenario 4: removing a layer another layer names as
/// parent is refused, regardless of how deep the chain gets.
#[test]
fn rm_refuses_while_a_descendant_exists_anywhere_in_the_chain() {
    let (_dir, store) = open_store();
    store.create("ubuntu", None, None).unwrap();
    store.create("persistent", Some("ubuntu"), None).unwrap();

    let err = store.remove("ubuntu").unwrap_err();
    assert!(matches!(err, Error::HasChildren(_)));
    // Refused, not partially applied: the layer and its child both survive.
    assert!(store.resolve("ubuntu").is_ok());
    assert!(store.resolve("persistent").is_ok());
}

/// A three-layer image-like chain (base, intermediate, top-named-after-tag)
/// round-trips through `chain` exactly as `pull` would have built it, and
/// its mount plan orders lowers deepest-first with the top layer's own
/// `root/` last.
#[test]
fn three_layer_image_chain_orders_lowers_and_exposes_parent_round_trip() {
    let (_dir, store) = open_store();
    store.create("sha256-aaaa", None, None).unwrap();
    store.create("sha256-bbbb", Some("sha256-aaaa"), None).unwrap();
    store.create("ubuntu", Some("sha256-bbbb"), None).unwrap();

    let chain = store.chain("ubuntu").unwrap();
    let names: Vec<_> = chain.iter().map(podder::Layer::name).collect();
    assert_eq!(names, vec!["ubuntu", "sha256-bbbb", "sha256-aaaa"]);

    let storage = podder::config::StorageConfig { ephemeral: true };
    let plan = MountPlan::build(&chain, &storage).unwrap();
    assert_eq!(
        plan.lowerdirs,
        vec![
            chain[2].root_dir(),
            chain[1].root_dir(),
            chain[0].root_dir(),
        ]
    );
}

/// Re-running `create` for a digest-derived layer name that already exists
/// is the idempotency guarantee `import::pull` relies on (spec §4.3, final
/// paragraph) — exercised here at the store level.
#[test]
fn creating_an_existing_layer_name_fails_exists_not_silently_succeeds() {
    let (_dir, store) = open_store();
    store.create("sha256-aaaa", None, None).unwrap();
    let err = store.create("sha256-aaaa", None, None).unwrap_err();
    assert!(matches!(err, Error::Exists(_)));
}
