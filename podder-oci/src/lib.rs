//! The registry client (C2): resolves an image reference, including
//! manifest lists, to this host's platform, and fetches every layer blob.
//!
//! Built directly on `oci_client::Client::pull`, which already performs the
//! bearer-token auth handshake, manifest negotiation, and per-blob digest
//! verification — podder-oci supplies a `linux/{amd64,arm64}` platform
//! resolver and reshapes the result into podder's own `FetchedImage`.

use std::str::FromStr;
use std::time::Duration;

use oci_client::client::{ClientConfig, ClientProtocol, ImageData};
use oci_client::manifest::ImageIndexEntry;
use oci_client::secrets::RegistryAuth;
use oci_client::{Client as RawClient, Reference};
use sha2::{Digest, Sha256};

/// Number of attempts `fetch` makes before giving up on a [`Error::Network`]
/// classification (spec §7: "Network and transient I/O errors in C2 are
/// retried with capped exponential backoff; persistent failure is
/// surfaced").
const MAX_ATTEMPTS: u32 = 4;

/// Base delay for the exponential backoff between retries; doubled on each
/// subsequent attempt (200ms, 400ms, 800ms, ...).
const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

/// Errors from resolving a reference or fetching its image contents.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The reference string could not be parsed as
    /// `[registry/]repository[:tag|@digest]`.
    #[error("invalid image reference: {0}")]
    InvalidReference(String),

    /// An anonymous client hit a registry that requires credentials it was
    /// never given a chance to supply.
    #[error("authentication required for {0}")]
    AuthRequired(String),

    /// The registry rejected the credentials (or the token obtained via the
    /// bearer challenge) this client was configured with.
    #[error("authentication failed for {0}")]
    AuthFailed(String),

    /// No manifest in a manifest list matched this host's platform.
    #[error("no manifest matches this host's platform for {0}")]
    NoMatchingPlatform(String),

    /// A fetched blob's digest didn't match the one named in its manifest.
    #[error("digest mismatch fetching {0}")]
    DigestMismatch(String),

    /// A layer or manifest media type this client doesn't know how to
    /// decode.
    #[error("unsupported media type fetching {0}")]
    UnsupportedMediaType(String),

    /// A transient transport failure (connection reset, timeout, 5xx). Only
    /// surfaced after [`MAX_ATTEMPTS`] retries have all failed the same way.
    #[error("network error fetching {0}")]
    Network(String),

    /// The registry or transport failed in a way that isn't one of the
    /// above: unexpected status codes, malformed JSON.
    #[error("registry request failed: {0}")]
    Registry(String),
}

/// One fetched layer blob, still compressed as the registry served it.
#[derive(Debug, Clone)]
pub struct FetchedLayer {
    /// Content digest of the blob, computed over `data` (`sha256:...`).
    pub digest: String,
    /// OCI/Docker layer media type, used to pick the right decompressor.
    pub media_type: String,
    /// The blob's raw bytes.
    pub data: Vec<u8>,
}

/// Subset of the OCI/Docker image configuration relevant to a container
/// launch — the entrypoint/cmd/env/workdir/user spec §4.2 step 4 says the
/// config blob supplies as defaults.
#[non_exhaustive]
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct ImageConfig {
    /// Default command (`CMD`).
    #[serde(default, alias = "Cmd")]
    pub cmd: Option<Vec<String>>,
    /// Default entrypoint (`ENTRYPOINT`).
    #[serde(default, alias = "Entrypoint")]
    pub entrypoint: Option<Vec<String>>,
    /// Default environment variables, `KEY=VALUE` per entry.
    #[serde(default, alias = "Env")]
    pub env: Option<Vec<String>>,
    /// Default working directory.
    #[serde(default, alias = "WorkingDir")]
    pub working_dir: Option<String>,
    /// Default user (`uid[:gid]` or name, as the image declares it).
    #[serde(default, alias = "User")]
    pub user: Option<String>,
}

impl ImageConfig {
    /// Returns the combined entrypoint + cmd as the final argv, the way the
    /// OCI runtime spec defines "effective command" for an image that sets
    /// both.
    #[must_use]
    pub fn command(&self) -> Vec<String> {
        let mut parts = Vec::new();
        if let Some(ep) = &self.entrypoint {
            parts.extend(ep.iter().cloned());
        }
        if let Some(cmd) = &self.cmd {
            parts.extend(cmd.iter().cloned());
        }
        parts
    }
}

/// The top-level OCI/Docker image config JSON wraps the fields relevant to
/// execution under a nested `"config"` key.
#[derive(serde::Deserialize)]
struct ImageConfigEnvelope {
    config: Option<ImageConfig>,
}

/// Parses an image config blob's `"config"` object, if present. A config
/// blob that doesn't parse (or doesn't carry the key) yields `None` rather
/// than a hard failure — image configs vary in how much of the spec they
/// populate, and a missing default command is not itself an error.
#[must_use]
pub fn parse_image_config(data: &[u8]) -> Option<ImageConfig> {
    serde_json::from_slice::<ImageConfigEnvelope>(data)
        .ok()?
        .config
}

/// A fully fetched image: ordered layers (base first) plus the raw config
/// blob, for callers that want to inspect image-level metadata.
#[derive(Debug, Clone)]
pub struct FetchedImage {
    /// Layer blobs in manifest order (base layer first).
    pub layers: Vec<FetchedLayer>,
    /// The image config blob (JSON), unparsed.
    pub config: Vec<u8>,
    /// Digest of the resolved manifest (after any manifest-list step), if
    /// the registry reported one.
    pub manifest_digest: Option<String>,
}

impl FetchedImage {
    /// Parses [`FetchedImage::config`]'s `"config"` object, if present.
    #[must_use]
    pub fn image_config(&self) -> Option<ImageConfig> {
        parse_image_config(&self.config)
    }
}

/// Thin wrapper over `oci_client::Client`, configured with a platform
/// resolver that picks this host's (architecture, os) out of a manifest
/// list.
pub struct Client {
    inner: RawClient,
    auth: RegistryAuth,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl Client {
    /// Builds a client for anonymous pulls over HTTPS.
    #[must_use]
    pub fn new() -> Self {
        Self::with_auth(RegistryAuth::Anonymous)
    }

    /// Builds a client using the given registry credentials.
    #[must_use]
    pub fn with_auth(auth: RegistryAuth) -> Self {
        let config = ClientConfig {
            protocol: ClientProtocol::Https,
            platform_resolver: Some(Box::new(host_platform_resolver)),
            ..Default::default()
        };
        Self {
            inner: RawClient::new(config),
            auth,
        }
    }

    /// Resolves `reference` and downloads its manifest, config, and every
    /// layer blob.
    ///
    /// Network-classified failures are retried with capped exponential
    /// backoff (spec §7); every other classification is surfaced on first
    /// occurrence.
    pub async fn fetch(&self, reference: &str) -> Result<FetchedImage, Error> {
        let parsed = Reference::from_str(reference)
            .map_err(|e| Error::InvalidReference(format!("{reference}: {e}")))?;

        let accepted = vec![
            oci_client::manifest::IMAGE_MANIFEST_MEDIA_TYPE,
            oci_client::manifest::IMAGE_MANIFEST_LIST_MEDIA_TYPE,
            oci_client::manifest::IMAGE_DOCKER_LAYER_GZIP_MEDIA_TYPE,
            oci_client::manifest::IMAGE_LAYER_GZIP_MEDIA_TYPE,
            oci_client::manifest::IMAGE_LAYER_MEDIA_TYPE,
        ];

        tracing::info!(reference = %parsed, "pulling image");

        let mut attempt = 0u32;
        let image: ImageData = loop {
            attempt += 1;
            match self.inner.pull(&parsed, &self.auth, accepted.clone()).await {
                Ok(image) => break image,
                Err(e) => {
                    let classified = classify_error(&parsed, e, &self.auth);
                    if matches!(classified, Error::Network(_)) && attempt < MAX_ATTEMPTS {
                        let delay = RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
                        tracing::warn!(
                            reference = %parsed,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "retrying after network error"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(classified);
                }
            }
        };

        let layers = image
            .layers
            .into_iter()
            .map(|l| FetchedLayer {
                digest: format!("sha256:{:x}", Sha256::digest(&l.data)),
                media_type: l.media_type,
                data: l.data,
            })
            .collect();

        Ok(FetchedImage {
            layers,
            config: image.config.data,
            manifest_digest: image.digest,
        })
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

fn host_platform_resolver(manifests: &[ImageIndexEntry]) -> Option<String> {
    manifests
        .iter()
        .find(|m| {
            m.platform
                .as_ref()
                .is_some_and(|p| p.os == host_os() && p.architecture == host_arch())
        })
        .map(|m| m.digest.clone())
}

#[cfg(target_os = "linux")]
fn host_os() -> &'static str {
    "linux"
}
#[cfg(not(target_os = "linux"))]
fn host_os() -> &'static str {
    std::env::consts::OS
}

#[cfg(target_arch = "aarch64")]
fn host_arch() -> &'static str {
    "arm64"
}
#[cfg(target_arch = "x86_64")]
fn host_arch() -> &'static str {
    "amd64"
}
#[cfg(not(any(target_arch = "aarch64", target_arch = "x86_64")))]
fn host_arch() -> &'static str {
    std::env::consts::ARCH
}

/// Classifies a raw `oci_client` error into one of podder's error kinds by
/// inspecting its message — `oci_client` doesn't expose a typed reason for
/// most failures, so this is the same string-sniffing approach the teacher's
/// `bux-oci` falls back to for anything beyond its own `Registry(String)`
/// catch-all.
fn classify_error(
    reference: &Reference,
    e: oci_client::errors::OciDistributionError,
    auth: &RegistryAuth,
) -> Error {
    let msg = e.to_string();
    let lower = msg.to_lowercase();
    if lower.contains("401") || lower.contains("unauthorized") {
        // `oci_client::Client::pull` already performed the bearer-challenge
        // handshake internally before this error surfaced, so a persisting
        // 401 means the credentials it was given (or the lack of any, for
        // an anonymous client) were rejected — spec §8's boundary test:
        // "same endpoint returning 401 after token → AuthFailed".
        if matches!(auth, RegistryAuth::Anonymous) {
            Error::AuthRequired(reference.to_string())
        } else {
            Error::AuthFailed(reference.to_string())
        }
    } else if lower.contains("no platform") || lower.contains("platform") && lower.contains("match")
    {
        Error::NoMatchingPlatform(reference.to_string())
    } else if lower.contains("digest") {
        Error::DigestMismatch(reference.to_string())
    } else if lower.contains("media type") || lower.contains("mediatype") {
        Error::UnsupportedMediaType(reference.to_string())
    } else if lower.contains("timed out")
        || lower.contains("timeout")
        || lower.contains("connection")
        || lower.contains("reset")
        || lower.contains("dns")
        || lower.contains("503")
        || lower.contains("502")
        || lower.contains("504")
    {
        Error::Network(msg)
    } else {
        Error::Registry(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_arch_matches_known_target() {
        let arch = host_arch();
        assert!(arch == "amd64" || arch == "arm64" || !arch.is_empty());
    }

    #[test]
    fn platform_resolver_skips_entries_without_platform() {
        let entries: Vec<ImageIndexEntry> = Vec::new();
        assert_eq!(host_platform_resolver(&entries), None);
    }

    #[test]
    fn parse_image_config_combines_entrypoint_and_cmd() {
        let data = br#"{"config":{"Entrypoint":["/bin/sh","-c"],"Cmd":["echo hi"],"Env":["PATH=/usr/bin"],"WorkingDir":"/app"}}"#;
        let config = parse_image_config(data).unwrap();
        assert_eq!(config.command(), vec!["/bin/sh", "-c", "echo hi"]);
        assert_eq!(config.env, Some(vec!["PATH=/usr/bin".to_owned()]));
        assert_eq!(config.working_dir.as_deref(), Some("/app"));
    }

    #[test]
    fn parse_image_config_tolerates_missing_config_key() {
        assert!(parse_image_config(br#"{"architecture":"amd64"}"#).is_none());
    }
}
