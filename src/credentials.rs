//! Registry credential state.
//!
//! Handles the docker `config.json` written for the ephemeral registry, the
//! encoded auth handed to pushes, the `CNB_REGISTRY_AUTH` value phases read,
//! and the scoped `DOCKER_CONFIG` export.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Environment variable docker tooling reads its config directory from.
pub const DOCKER_CONFIG_ENV: &str = "DOCKER_CONFIG";

/// Registry assumed for references without an explicit host.
pub const DEFAULT_REGISTRY: &str = "index.docker.io";

const CONFIG_FILE: &str = "config.json";

/// A single registry entry in `config.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthEntry {
    /// `base64(username:password)`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub auth: String,
}

/// The subset of a docker CLI `config.json` the harness reads and writes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerConfig {
    #[serde(default)]
    pub auths: BTreeMap<String, AuthEntry>,
}

impl DockerConfig {
    /// Loads `config.json` from `dir`; a missing file yields an empty config.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Writes `config.json` into `dir`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(dir.join(CONFIG_FILE), content)?;
        Ok(())
    }

    /// Records basic-auth credentials for `registry`.
    pub fn add_basic_auth(&mut self, registry: &str, username: &str, password: &str) {
        let auth = STANDARD.encode(format!("{}:{}", username, password));
        self.auths.insert(registry.to_string(), AuthEntry { auth });
    }

    /// Returns the stored `base64(username:password)` for `registry`.
    pub fn basic_auth(&self, registry: &str) -> Option<&str> {
        self.auths
            .get(registry)
            .map(|entry| entry.auth.as_str())
            .filter(|auth| !auth.is_empty())
    }
}

/// Credentials handed to image pushes against the ephemeral registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryCredentials {
    /// Directory holding the `config.json` with the registry's auth.
    pub config_dir: PathBuf,
    /// Engine-API style encoded auth (`X-Registry-Auth`). The docker CLI
    /// engine ignores it and reads `config_dir` instead.
    pub encoded_auth: String,
}

#[derive(Serialize)]
struct EncodedAuthPayload<'a> {
    username: &'a str,
    password: &'a str,
    serveraddress: &'a str,
}

/// Encodes credentials the way the docker engine API expects them.
pub fn encode_auth(username: &str, password: &str, server: &str) -> Result<String> {
    let payload = serde_json::to_vec(&EncodedAuthPayload {
        username,
        password,
        serveraddress: server,
    })?;
    Ok(URL_SAFE.encode(payload))
}

/// Returns the registry host of an image reference.
pub fn registry_of(reference: &str) -> &str {
    match reference.split_once('/') {
        Some((first, _))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            first
        }
        _ => DEFAULT_REGISTRY,
    }
}

/// Builds the `CNB_REGISTRY_AUTH` value for `references` from `config_dir`.
///
/// Only the registry part of each reference matters; references on
/// registries without stored credentials are omitted.
pub fn build_registry_auth(config_dir: &Path, references: &[&str]) -> Result<String> {
    let config = DockerConfig::load(config_dir)?;
    let mut headers = BTreeMap::new();

    for reference in references {
        let registry = registry_of(reference);
        if let Some(auth) = config.basic_auth(registry) {
            headers.insert(registry.to_string(), format!("Basic {}", auth));
        }
    }

    Ok(serde_json::to_string(&headers)?)
}

/// Sets a process-wide environment variable until restored or dropped.
///
/// The variable is global to the process: two guards for the same key must
/// not be alive at once.
#[derive(Debug)]
pub struct ScopedEnvVar {
    key: String,
    previous: Option<OsString>,
    restored: bool,
}

impl ScopedEnvVar {
    /// Sets `key` to `value`, remembering the previous value.
    pub fn set(key: impl Into<String>, value: impl AsRef<std::ffi::OsStr>) -> Self {
        let key = key.into();
        let previous = std::env::var_os(&key);
        std::env::set_var(&key, value);
        tracing::debug!(key = %key, "exported environment variable");

        Self {
            key,
            previous,
            restored: false,
        }
    }

    /// Returns the variable name.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Restores the previous value, or unsets the variable if there was none.
    pub fn restore(&mut self) {
        if self.restored {
            return;
        }
        match self.previous.take() {
            Some(previous) => std::env::set_var(&self.key, previous),
            None => std::env::remove_var(&self.key),
        }
        self.restored = true;
        tracing::debug!(key = %self.key, "restored environment variable");
    }
}

impl Drop for ScopedEnvVar {
    fn drop(&mut self) {
        self.restore();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn registry_of_reference() {
        assert_eq!(registry_of("localhost:5000/some-repo"), "localhost:5000");
        assert_eq!(registry_of("gcr.io/project/image:tag"), "gcr.io");
        assert_eq!(registry_of("localhost/image"), "localhost");
        assert_eq!(registry_of("library/busybox"), DEFAULT_REGISTRY);
        assert_eq!(registry_of("busybox"), DEFAULT_REGISTRY);
    }

    #[test]
    fn config_round_trips_through_disk() {
        let temp = TempDir::new().unwrap();
        let mut config = DockerConfig::default();
        config.add_basic_auth("localhost:5000", "user", "pass");
        config.save(temp.path()).unwrap();

        let loaded = DockerConfig::load(temp.path()).unwrap();
        assert_eq!(loaded.basic_auth("localhost:5000"), Some("dXNlcjpwYXNz"));
        assert_eq!(loaded.basic_auth("other:5000"), None);
    }

    #[test]
    fn missing_config_is_empty() {
        let temp = TempDir::new().unwrap();
        let config = DockerConfig::load(temp.path()).unwrap();
        assert!(config.auths.is_empty());
    }

    #[test]
    fn registry_auth_ignores_repository_path() {
        let temp = TempDir::new().unwrap();
        let mut config = DockerConfig::default();
        config.add_basic_auth("localhost:5000", "user", "pass");
        config.save(temp.path()).unwrap();

        let a = build_registry_auth(temp.path(), &["localhost:5000/some-repo"]).unwrap();
        let b = build_registry_auth(temp.path(), &["localhost:5000/other/repo:tag"]).unwrap();

        assert_eq!(a, r#"{"localhost:5000":"Basic dXNlcjpwYXNz"}"#);
        assert_eq!(a, b);
    }

    #[test]
    fn registry_auth_omits_unknown_registries() {
        let temp = TempDir::new().unwrap();
        let value = build_registry_auth(temp.path(), &["gcr.io/some/repo"]).unwrap();
        assert_eq!(value, "{}");
    }

    #[test]
    fn encoded_auth_is_url_safe_json() {
        let encoded = encode_auth("user", "pass", "localhost:5000").unwrap();
        let decoded = URL_SAFE.decode(encoded).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(value["username"], "user");
        assert_eq!(value["password"], "pass");
        assert_eq!(value["serveraddress"], "localhost:5000");
    }

    #[test]
    fn scoped_env_var_unsets_when_previously_absent() {
        let key = "LIFECYCLE_ACCEPTANCE_TEST_SCOPED_UNSET";
        std::env::remove_var(key);

        {
            let guard = ScopedEnvVar::set(key, "/tmp/config");
            assert_eq!(guard.key(), key);
            assert_eq!(std::env::var(key).unwrap(), "/tmp/config");
        }

        assert!(std::env::var_os(key).is_none());
    }

    #[test]
    fn scoped_env_var_restores_previous_value() {
        let key = "LIFECYCLE_ACCEPTANCE_TEST_SCOPED_RESTORE";
        std::env::set_var(key, "original");

        let mut guard = ScopedEnvVar::set(key, "temporary");
        assert_eq!(std::env::var(key).unwrap(), "temporary");
        guard.restore();
        assert_eq!(std::env::var(key).unwrap(), "original");

        // Restoring twice must not clobber later changes.
        std::env::set_var(key, "changed");
        drop(guard);
        assert_eq!(std::env::var(key).unwrap(), "changed");

        std::env::remove_var(key);
    }
}
