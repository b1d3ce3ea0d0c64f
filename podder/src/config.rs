//! `config.ini` model: sections of key→value pairs, and the left-fold merge
//! that produces a layer's effective configuration from its parent chain.
//!
//! Parsing/writing is delegated to the `ini` crate; everything above that
//! boundary works on the plain `Config` map so the merge fold stays a pure
//! function over data, never a mutable global (spec Design Note, §9).

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{Error, Result};

/// A parsed `config.ini`: section name → (key → value).
///
/// Uses `BTreeMap` rather than a hash map so iteration order (and therefore
/// any serialized round-trip) is deterministic, which matters for tests that
/// assert on `config.ini` contents after a merge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    sections: BTreeMap<String, BTreeMap<String, String>>,
}

impl Config {
    /// Returns an empty configuration — a valid effective configuration per
    /// spec invariant: "the effective configuration of any layer is
    /// defined; the empty configuration is valid."
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Reads and parses a `config.ini` file. A missing file is treated as an
    /// empty configuration, matching "all optional" in the layer data model.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::empty());
        }
        let ini = ini::Ini::load_from_file(path)
            .map_err(|e| Error::ConfigInvalid(format!("{}: {e}", path.display())))?;

        let mut sections = BTreeMap::new();
        for (section, props) in ini.iter() {
            let name = section.unwrap_or("").to_owned();
            let kv = sections.entry(name).or_insert_with(BTreeMap::new);
            for (k, v) in props.iter() {
                kv.insert(k.to_owned(), v.to_owned());
            }
        }
        Ok(Self { sections })
    }

    /// Writes this configuration to `path` as `config.ini`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut ini = ini::Ini::new();
        for (section, kv) in &self.sections {
            let mut s = ini.with_section(Some(section.as_str()));
            for (k, v) in kv {
                s.set(k, v);
            }
        }
        ini.write_to_file(path)
            .map_err(|e| Error::Io(std::io::Error::other(e)))
    }

    /// Returns the value of `key` within `section`, if present.
    #[must_use]
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections.get(section)?.get(key).map(String::as_str)
    }

    /// Returns all values for `key` within `section` as written, split on
    /// newlines — used for repeated keys (`env`), which the `ini` crate
    /// represents as a single multi-line value when written by `set_multi`.
    /// For the simpler model here, repeated `env =` lines are instead
    /// accumulated by the caller before `save`, so this simply returns the
    /// one stored value.
    #[must_use]
    pub fn section(&self, section: &str) -> Option<&BTreeMap<String, String>> {
        self.sections.get(section)
    }

    /// Sets `key` within `section`, creating the section if absent.
    pub fn set(&mut self, section: &str, key: &str, value: impl Into<String>) {
        self.sections
            .entry(section.to_owned())
            .or_default()
            .insert(key.to_owned(), value.into());
    }

    /// Merges `other` on top of `self`: every key `other` defines overwrites
    /// the same key in `self`; keys only in `self` are kept.
    fn overlay(&mut self, other: &Config) {
        for (section, kv) in &other.sections {
            let dst = self.sections.entry(section.clone()).or_default();
            for (k, v) in kv {
                dst.insert(k.clone(), v.clone());
            }
        }
    }

    /// Folds an ordered list of per-layer configs, root-first, into the
    /// effective configuration: "starting from the deepest ancestor's
    /// configuration and applying each descendant's configuration in order,
    /// with the descendant overwriting matching keys" (spec §3).
    #[must_use]
    pub fn merge_chain<'a>(root_to_leaf: impl IntoIterator<Item = &'a Config>) -> Config {
        let mut acc = Config::empty();
        for cfg in root_to_leaf {
            acc.overlay(cfg);
        }
        acc
    }
}

/// `[container]` section, recognised keys (spec §6).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerConfig {
    /// Shell-split command, `[container] command`.
    pub command: Vec<String>,
    /// `KEY=VALUE` environment entries, `[container] env` (one per line).
    pub env: Vec<String>,
    /// Absolute working directory, `[container] workdir`.
    pub workdir: Option<String>,
    /// Container hostname, `[container] hostname`.
    pub hostname: Option<String>,
    /// `uid[:gid]`, `[container] user`.
    pub user: Option<(u32, Option<u32>)>,
}

/// `[namespaces]` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamespacesConfig {
    /// `host` or `private` (default `private`).
    pub net_host: bool,
}

impl Default for NamespacesConfig {
    fn default() -> Self {
        Self { net_host: false }
    }
}

/// `[storage]` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageConfig {
    /// Whether the writable top layer lives in a tmpfs (default `true`).
    pub ephemeral: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { ephemeral: true }
    }
}

/// `[network]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkConfig {
    /// Host interface name to move into the container via the macvlan helper.
    pub macvlan: Option<String>,
    /// Optional MAC address to assign to the moved interface.
    pub macvlan_mac: Option<String>,
}

impl Config {
    /// Interprets the `[container]` section, applying shell-word splitting
    /// to `command` and parsing `user` as `uid[:gid]`.
    pub fn container(&self) -> Result<ContainerConfig> {
        let Some(kv) = self.section("container") else {
            return Ok(ContainerConfig::default());
        };

        let command = match kv.get("command") {
            Some(s) => shell_split(s)?,
            None => Vec::new(),
        };
        let env = kv
            .get("env")
            .map(|s| s.lines().map(str::to_owned).collect())
            .unwrap_or_default();
        let workdir = kv.get("workdir").cloned();
        let hostname = kv.get("hostname").cloned();
        let user = kv.get("user").map(|s| parse_user(s)).transpose()?;

        Ok(ContainerConfig {
            command,
            env,
            workdir,
            hostname,
            user,
        })
    }

    /// Interprets the `[namespaces]` section.
    pub fn namespaces(&self) -> Result<NamespacesConfig> {
        let net_host = match self.get("namespaces", "net") {
            None | Some("private") => false,
            Some("host") => true,
            Some(other) => {
                return Err(Error::ConfigInvalid(format!(
                    "[namespaces] net: expected host|private, got {other}"
                )));
            }
        };
        Ok(NamespacesConfig { net_host })
    }

    /// Interprets the `[storage]` section.
    pub fn storage(&self) -> Result<StorageConfig> {
        let ephemeral = match self.get("storage", "ephemeral") {
            None => true,
            Some("true") => true,
            Some("false") => false,
            Some(other) => {
                return Err(Error::ConfigInvalid(format!(
                    "[storage] ephemeral: expected true|false, got {other}"
                )));
            }
        };
        Ok(StorageConfig { ephemeral })
    }

    /// Interprets the `[network]` section.
    #[must_use]
    pub fn network(&self) -> NetworkConfig {
        NetworkConfig {
            macvlan: self.get("network", "macvlan").map(str::to_owned),
            macvlan_mac: self.get("network", "macvlan_mac").map(str::to_owned),
        }
    }

    /// Sets `[container] command`/`env`/`workdir` from an image's resolved
    /// defaults (spec §4.2 step 4 / §4.3 step 4: "the config blob supplies
    /// the default entrypoint/cmd/env/workdir"). A field left empty/`None`
    /// by the image is simply not written, leaving the key unset (and thus
    /// inheritable from an ancestor, or absent) rather than overwritten with
    /// an empty value.
    pub(crate) fn set_container_defaults(
        &mut self,
        command: &[String],
        env: &[String],
        workdir: Option<&str>,
    ) {
        if !command.is_empty() {
            self.set("container", "command", shell_join(command));
        }
        if !env.is_empty() {
            self.set("container", "env", env.join("\n"));
        }
        if let Some(workdir) = workdir {
            self.set("container", "workdir", workdir);
        }
    }
}

/// Splits a shell-like command string into words, honoring single and
/// double quotes. Minimal by design: no variable expansion, no globbing —
/// `config.ini` commands are meant to be literal argv, not shell scripts.
fn shell_split(s: &str) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut started = false;

    for c in s.chars() {
        match c {
            '\'' if !in_double => {
                in_single = !in_single;
                started = true;
            }
            '"' if !in_single => {
                in_double = !in_double;
                started = true;
            }
            c if c.is_whitespace() && !in_single && !in_double => {
                if started {
                    words.push(std::mem::take(&mut current));
                    started = false;
                }
            }
            c => {
                current.push(c);
                started = true;
            }
        }
    }
    if in_single || in_double {
        return Err(Error::ConfigInvalid(format!(
            "unterminated quote in command: {s}"
        )));
    }
    if started {
        words.push(current);
    }
    Ok(words)
}

/// Joins words into a single shell-like command string, the inverse of
/// [`shell_split`]. Quotes a word in double quotes if it contains whitespace
/// or a double quote, preferring single quotes when the word itself
/// contains a `"` but no `'`. A word containing both quote characters has no
/// exact representation in this minimal grammar; it is wrapped in double
/// quotes and the embedded `"` left as-is, which will split incorrectly on
/// re-parse — acceptable since image configs essentially never hit this.
fn shell_join(words: &[String]) -> String {
    words
        .iter()
        .map(|w| {
            let needs_quote = w.is_empty() || w.chars().any(char::is_whitespace) || w.contains('\'') || w.contains('"');
            if !needs_quote {
                w.clone()
            } else if w.contains('"') && !w.contains('\'') {
                format!("'{w}'")
            } else {
                format!("\"{w}\"")
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parses `[container] user = uid[:gid]`.
fn parse_user(s: &str) -> Result<(u32, Option<u32>)> {
    match s.split_once(':') {
        Some((uid, gid)) => {
            let uid = uid
                .parse()
                .map_err(|_| Error::ConfigInvalid(format!("invalid uid: {uid}")))?;
            let gid = gid
                .parse()
                .map_err(|_| Error::ConfigInvalid(format!("invalid gid: {gid}")))?;
            Ok((uid, Some(gid)))
        }
        None => {
            let uid = s
                .parse()
                .map_err(|_| Error::ConfigInvalid(format!("invalid uid: {s}")))?;
            Ok((uid, None))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_overrides_left_to_right() {
        let mut root = Config::empty();
        root.set("container", "workdir", "/root-wd");
        root.set("storage", "ephemeral", "true");

        let mut mid = Config::empty();
        mid.set("container", "workdir", "/mid-wd");

        let mut leaf = Config::empty();
        leaf.set("container", "hostname", "leaf-host");

        let effective = Config::merge_chain([&root, &mid, &leaf]);
        assert_eq!(effective.get("container", "workdir"), Some("/mid-wd"));
        assert_eq!(effective.get("container", "hostname"), Some("leaf-host"));
        assert_eq!(effective.get("storage", "ephemeral"), Some("true"));
    }

    #[test]
    fn empty_chain_is_empty_config() {
        let effective = Config::merge_chain(std::iter::empty());
        assert_eq!(effective, Config::empty());
    }

    #[test]
    fn shell_split_handles_quotes() {
        let words = shell_split(r#"/bin/sh -c "echo 'hi there'""#).unwrap();
        assert_eq!(words, vec!["/bin/sh", "-c", "echo hi there"]);
    }

    #[test]
    fn shell_split_rejects_unterminated_quote() {
        assert!(shell_split("echo \"unterminated").is_err());
    }

    #[test]
    fn shell_join_quotes_words_with_whitespace() {
        let s = shell_join(&["/bin/sh".into(), "-c".into(), "echo hi there".into()]);
        assert_eq!(shell_split(&s).unwrap(), vec!["/bin/sh", "-c", "echo hi there"]);
    }

    #[test]
    fn shell_join_round_trips_plain_words() {
        let words = vec!["/usr/bin/env".to_string(), "bash".to_string()];
        assert_eq!(shell_join(&words), "/usr/bin/env bash");
    }

    #[test]
    fn set_container_defaults_skips_empty_fields() {
        let mut cfg = Config::empty();
        cfg.set_container_defaults(&["/bin/sh".into()], &[], None);
        assert_eq!(cfg.get("container", "command"), Some("/bin/sh"));
        assert_eq!(cfg.get("container", "env"), None);
        assert_eq!(cfg.get("container", "workdir"), None);
    }

    #[test]
    fn user_parses_uid_and_optional_gid() {
        assert_eq!(parse_user("1000").unwrap(), (1000, None));
        assert_eq!(parse_user("1000:1001").unwrap(), (1000, Some(1001)));
        assert!(parse_user("notanumber").is_err());
    }

    #[test]
    fn storage_defaults_to_ephemeral() {
        let cfg = Config::empty();
        assert!(cfg.storage().unwrap().ephemeral);
    }

    #[test]
    fn namespaces_rejects_unknown_net_value() {
        let mut cfg = Config::empty();
        cfg.set("namespaces", "net", "bogus");
        assert!(cfg.namespaces().is_err());
    }
}
