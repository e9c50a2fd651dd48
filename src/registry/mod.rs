//! Ephemeral registry support.
//!
//! [`RegistryHandle`] abstracts the running registry. [`DockerRegistry`] is
//! the real implementation: a `registry:2` container behind an in-process
//! [`gate`] that enforces auth and per-repository privileges.
//! [`TargetRegistry`] owns a handle for the lifetime of one phase test.

mod docker;
pub mod gate;
mod target;

pub use docker::DockerRegistry;
pub use target::{network_mode_for, NetworkMode, TargetRegistry, INACCESSIBLE_IMAGE_NAME};

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Access a registry grants to a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Privilege {
    /// Pull and push allowed.
    #[default]
    ReadWrite,
    /// Pull allowed, push rejected.
    ReadOnly,
    /// Every request rejected.
    Inaccessible,
}

impl Privilege {
    /// Returns true if a request with `method` is allowed.
    pub fn allows(self, method: &str) -> bool {
        match self {
            Privilege::ReadWrite => true,
            Privilege::ReadOnly => matches!(method, "GET" | "HEAD"),
            Privilege::Inaccessible => false,
        }
    }
}

/// Per-repository privileges shared between a handle and its gate.
#[derive(Debug, Clone, Default)]
pub struct PrivilegeTable {
    inner: Arc<RwLock<HashMap<String, Privilege>>>,
}

impl PrivilegeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the privilege of repository `name`.
    pub fn set(&self, name: &str, privilege: Privilege) {
        let mut table = self.inner.write().unwrap_or_else(|e| e.into_inner());
        table.insert(name.to_string(), privilege);
    }

    /// Returns the privilege of `name`; unlisted repositories are read-write.
    pub fn get(&self, name: &str) -> Privilege {
        let table = self.inner.read().unwrap_or_else(|e| e.into_inner());
        table.get(name).copied().unwrap_or_default()
    }
}

/// A running (or startable) ephemeral registry.
#[async_trait]
pub trait RegistryHandle: Send + Sync {
    /// Starts the registry and writes its credentials to `auth_dir/config.json`.
    async fn start(&mut self, auth_dir: &Path) -> Result<()>;

    /// Stops the registry.
    async fn stop(&mut self) -> Result<()>;

    /// Host the registry is reachable on.
    fn host(&self) -> &str;

    /// Port the registry is reachable on.
    fn port(&self) -> u16;

    /// Changes the privilege of repository `name` and returns its qualified name.
    fn set_privilege(&self, name: &str, privilege: Privilege) -> String;

    /// Engine-API encoded auth for pushes.
    fn encoded_auth(&self) -> String;

    /// Qualifies a local repository name with the registry address.
    fn repo_name(&self, name: &str) -> String {
        format!("{}:{}/{}", self.host(), self.port(), name)
    }

    fn set_read_only(&self, name: &str) -> String {
        self.set_privilege(name, Privilege::ReadOnly)
    }

    fn set_read_write(&self, name: &str) -> String {
        self.set_privilege(name, Privilege::ReadWrite)
    }

    fn set_inaccessible(&self, name: &str) -> String {
        self.set_privilege(name, Privilege::Inaccessible)
    }
}
