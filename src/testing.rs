//! In-memory collaborators for exercising the harness without a daemon.
//!
//! All fakes can share one [`EventLog`] so tests can assert the order in
//! which the harness touched them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::compiler::BinaryCompiler;
use crate::credentials::{encode_auth, DockerConfig, RegistryCredentials};
use crate::engine::{BuildRequest, DaemonInfo, ImageEngine};
use crate::error::{Error, Result};
use crate::registry::{Privilege, RegistryHandle};

/// Held by tests that start a registry target, which exports
/// `DOCKER_CONFIG` process-wide.
pub static DOCKER_CONFIG_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Ordered record of collaborator calls, e.g. `"build some-app-image-…"`.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<String>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: impl Into<String>) {
        lock(&self.events).push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        lock(&self.events).clone()
    }

    /// Index of the first event starting with `prefix`.
    pub fn position(&self, prefix: &str) -> Option<usize> {
        lock(&self.events).iter().position(|e| e.starts_with(prefix))
    }
}

#[derive(Debug, Default)]
struct EngineState {
    builds: Vec<BuildRequest>,
    pushes: Vec<(String, RegistryCredentials)>,
    remove_attempts: Vec<String>,
    removed: Vec<String>,
}

/// An [`ImageEngine`] that records calls and fails on request.
#[derive(Debug, Clone)]
pub struct RecordingEngine {
    info: DaemonInfo,
    log: EventLog,
    state: Arc<Mutex<EngineState>>,
    fail_build: Vec<String>,
    fail_push: Vec<String>,
    fail_remove: Vec<String>,
}

impl Default for RecordingEngine {
    fn default() -> Self {
        Self::with_daemon_info(DaemonInfo {
            os_type: "linux".to_string(),
            architecture: "amd64".to_string(),
        })
    }
}

impl RecordingEngine {
    /// An engine reporting a linux/amd64 daemon.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_daemon_info(info: DaemonInfo) -> Self {
        Self {
            info,
            log: EventLog::new(),
            state: Arc::default(),
            fail_build: Vec::new(),
            fail_push: Vec::new(),
            fail_remove: Vec::new(),
        }
    }

    /// Records into `log` instead of a private log.
    pub fn sharing(mut self, log: &EventLog) -> Self {
        self.log = log.clone();
        self
    }

    /// Fails builds of references containing `pattern`.
    pub fn fail_build_of(mut self, pattern: &str) -> Self {
        self.fail_build.push(pattern.to_string());
        self
    }

    /// Fails pushes of references containing `pattern`.
    pub fn fail_push_of(mut self, pattern: &str) -> Self {
        self.fail_push.push(pattern.to_string());
        self
    }

    /// Fails removals of references containing `pattern`.
    pub fn fail_remove_of(mut self, pattern: &str) -> Self {
        self.fail_remove.push(pattern.to_string());
        self
    }

    /// References of successful builds, in order.
    pub fn built(&self) -> Vec<String> {
        lock(&self.state)
            .builds
            .iter()
            .map(|r| r.image_ref.clone())
            .collect()
    }

    /// Successful build requests, in order.
    pub fn build_requests(&self) -> Vec<BuildRequest> {
        lock(&self.state).builds.clone()
    }

    /// References of successful pushes, in order.
    pub fn pushed(&self) -> Vec<String> {
        lock(&self.state)
            .pushes
            .iter()
            .map(|(r, _)| r.clone())
            .collect()
    }

    /// Credentials each successful push was given.
    pub fn push_credentials(&self) -> Vec<RegistryCredentials> {
        lock(&self.state)
            .pushes
            .iter()
            .map(|(_, c)| c.clone())
            .collect()
    }

    /// Every reference passed to remove, including failed ones.
    pub fn remove_attempts(&self) -> Vec<String> {
        lock(&self.state).remove_attempts.clone()
    }

    /// References removed successfully.
    pub fn removed(&self) -> Vec<String> {
        lock(&self.state).removed.clone()
    }

    pub fn events(&self) -> Vec<String> {
        self.log.events()
    }

    fn fails(patterns: &[String], image_ref: &str) -> bool {
        patterns.iter().any(|p| image_ref.contains(p.as_str()))
    }

    fn failure(action: &'static str, image_ref: &str) -> Error {
        Error::Engine {
            action,
            image: image_ref.to_string(),
            reason: "injected failure".to_string(),
        }
    }
}

#[async_trait]
impl ImageEngine for RecordingEngine {
    async fn daemon_info(&self) -> Result<DaemonInfo> {
        Ok(self.info.clone())
    }

    async fn build(&self, request: &BuildRequest) -> Result<()> {
        self.log.record(format!("build {}", request.image_ref));
        if Self::fails(&self.fail_build, &request.image_ref) {
            return Err(Self::failure("build", &request.image_ref));
        }
        lock(&self.state).builds.push(request.clone());
        Ok(())
    }

    async fn push(&self, image_ref: &str, credentials: &RegistryCredentials) -> Result<()> {
        self.log.record(format!("push {}", image_ref));
        if Self::fails(&self.fail_push, image_ref) {
            return Err(Self::failure("push", image_ref));
        }
        lock(&self.state)
            .pushes
            .push((image_ref.to_string(), credentials.clone()));
        Ok(())
    }

    async fn remove(&self, image_ref: &str) -> Result<()> {
        self.log.record(format!("remove {}", image_ref));
        let mut state = lock(&self.state);
        state.remove_attempts.push(image_ref.to_string());
        if Self::fails(&self.fail_remove, image_ref) {
            return Err(Self::failure("remove", image_ref));
        }
        state.removed.push(image_ref.to_string());
        Ok(())
    }
}

/// File [`RecordingCompiler`] writes into the destination directory.
pub const FAKE_BINARY_NAME: &str = "lifecycle";

/// A [`BinaryCompiler`] that writes a placeholder binary.
#[derive(Debug, Clone, Default)]
pub struct RecordingCompiler {
    log: EventLog,
    calls: Arc<Mutex<Vec<(String, String, PathBuf)>>>,
    fail: bool,
}

impl RecordingCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sharing(mut self, log: &EventLog) -> Self {
        self.log = log.clone();
        self
    }

    /// Makes every compilation fail.
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    /// `(os, arch, dest)` of every call.
    pub fn calls(&self) -> Vec<(String, String, PathBuf)> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl BinaryCompiler for RecordingCompiler {
    async fn compile_and_copy(&self, os: &str, arch: &str, dest: &Path) -> Result<()> {
        self.log.record(format!("compile {}/{}", os, arch));
        lock(&self.calls).push((os.to_string(), arch.to_string(), dest.to_path_buf()));
        if self.fail {
            return Err(Error::Compile("injected failure".to_string()));
        }
        std::fs::create_dir_all(dest)?;
        std::fs::write(dest.join(FAKE_BINARY_NAME), b"binary")?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    starts: usize,
    stops: usize,
    running: bool,
    privileges: HashMap<String, Privilege>,
    auth_dir: Option<PathBuf>,
}

/// A [`RegistryHandle`] on `localhost:5000` that only records state.
///
/// Clones share state, so a test can keep one clone while the harness owns
/// another.
#[derive(Debug, Clone, Default)]
pub struct FakeRegistry {
    log: EventLog,
    state: Arc<Mutex<RegistryState>>,
    fail_start: bool,
}

impl FakeRegistry {
    pub const HOST: &'static str = "localhost";
    pub const PORT: u16 = 5000;
    pub const USERNAME: &'static str = "some-user";
    pub const PASSWORD: &'static str = "some-password";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn sharing(mut self, log: &EventLog) -> Self {
        self.log = log.clone();
        self
    }

    /// Makes `start` fail before writing any credentials.
    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    pub fn privilege_of(&self, name: &str) -> Option<Privilege> {
        lock(&self.state).privileges.get(name).copied()
    }

    pub fn starts(&self) -> usize {
        lock(&self.state).starts
    }

    pub fn stops(&self) -> usize {
        lock(&self.state).stops
    }

    pub fn is_running(&self) -> bool {
        lock(&self.state).running
    }

    /// Credential directory the registry was started with.
    pub fn auth_dir(&self) -> Option<PathBuf> {
        lock(&self.state).auth_dir.clone()
    }

    fn address(&self) -> String {
        format!("{}:{}", Self::HOST, Self::PORT)
    }
}

#[async_trait]
impl RegistryHandle for FakeRegistry {
    async fn start(&mut self, auth_dir: &Path) -> Result<()> {
        self.log.record("registry start");
        if self.fail_start {
            return Err(Error::Registry("injected failure".to_string()));
        }

        let mut config = DockerConfig::load(auth_dir)?;
        config.add_basic_auth(&self.address(), Self::USERNAME, Self::PASSWORD);
        config.save(auth_dir)?;

        let mut state = lock(&self.state);
        state.starts += 1;
        state.running = true;
        state.auth_dir = Some(auth_dir.to_path_buf());
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.log.record("registry stop");
        let mut state = lock(&self.state);
        state.stops += 1;
        state.running = false;
        Ok(())
    }

    fn host(&self) -> &str {
        Self::HOST
    }

    fn port(&self) -> u16 {
        Self::PORT
    }

    fn set_privilege(&self, name: &str, privilege: Privilege) -> String {
        lock(&self.state)
            .privileges
            .insert(name.to_string(), privilege);
        self.repo_name(name)
    }

    fn encoded_auth(&self) -> String {
        encode_auth(Self::USERNAME, Self::PASSWORD, &self.address()).unwrap_or_default()
    }
}
