//! Error types for podder's layer store and launch pipeline.

/// Alias for `Result<T, podder::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the layer store, mount planner, namespace launcher,
/// and lifecycle tracker.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// No layer with this name exists in the store.
    #[error("layer not found: {0}")]
    NotFound(String),

    /// A layer with this name already exists.
    #[error("layer already exists: {0}")]
    Exists(String),

    /// Following `parent` links revisited a layer already on the path.
    #[error("cycle in parent chain at: {0}")]
    Cycle(String),

    /// A layer's `parent` points at a name that doesn't resolve.
    #[error("broken parent link: {0} -> {1}")]
    BrokenParent(String, String),

    /// `rm` was attempted on a layer with a live `init.pid`.
    #[error("layer in use (running): {0}")]
    InUse(String),

    /// `rm` was attempted on a layer that another layer names as parent.
    #[error("layer has children: {0}")]
    HasChildren(String),

    /// `start` was attempted on a layer that is already running.
    #[error("already running: {0}")]
    AlreadyRunning(String),

    /// Mounting the overlay or an auxiliary filesystem failed.
    #[error("mount failed: {0}")]
    MountFailed(String),

    /// Namespace creation, UID/GID mapping, or pivot failed.
    #[error("namespace setup failed: {0}")]
    NamespaceSetupFailed(String),

    /// The init process failed to `execve`.
    #[error("exec failed: {0}")]
    ExecFailed(String),

    /// The caller lacks the privilege a step required.
    #[error("permission denied: {0}")]
    Permission(String),

    /// `config.ini` contains a value that can't be interpreted.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// A layer blob's media type isn't one of the (gzip/zstd/plain) tar
    /// encodings this importer knows how to decode.
    #[error("unsupported layer media type: {0}")]
    UnsupportedMediaType(String),

    /// An OCI pull/import error, propagated from `podder-oci` or the
    /// extraction stage.
    #[error(transparent)]
    Oci(#[from] podder_oci::Error),

    /// Underlying I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// `nix` syscall error (namespaces, mounts, signals).
    #[cfg(unix)]
    #[error(transparent)]
    Nix(#[from] nix::Error),
}
