//! The ephemeral registry owned by one phase test.

use std::net::IpAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use crate::builder::{unique_name, FixtureImageBuilder, FixtureTemplate};
use crate::config::HarnessConfig;
use crate::credentials::{build_registry_auth, RegistryCredentials, ScopedEnvVar, DOCKER_CONFIG_ENV};
use crate::engine::ImageEngine;
use crate::error::{Error, Result};
use crate::fixtures::{cleanup_fixtures, FixtureState, RegistryFixtures};
use crate::metadata::PreparedMetadata;

use super::RegistryHandle;

/// Repository name of the fixture no request may reach.
pub const INACCESSIBLE_IMAGE_NAME: &str = "inaccessible-image";

const AUTH_DIR_PREFIX: &str = "test.docker.config.dir";
const AUTH_PROBE_REPO: &str = "some-repo";

const READ_ONLY_APP_PREFIX: &str = "some-read-only-app-image-";
const READ_ONLY_CACHE_PREFIX: &str = "some-read-only-cache-image-";
const READ_ONLY_RUN_PREFIX: &str = "some-read-only-run-image-";
const READ_WRITE_APP_PREFIX: &str = "some-read-write-app-image-";
const READ_WRITE_CACHE_PREFIX: &str = "some-read-write-cache-image-";
const READ_WRITE_OTHER_APP_PREFIX: &str = "some-other-read-write-app-image-";
const SOME_APP_PREFIX: &str = "some-app-image-";
const SOME_CACHE_PREFIX: &str = "some-cache-image-";

/// Container network mode needed to reach the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    #[default]
    Default,
    Host,
}

impl NetworkMode {
    pub fn as_str(self) -> &'static str {
        match self {
            NetworkMode::Default => "default",
            NetworkMode::Host => "host",
        }
    }
}

impl std::fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Picks the network mode for a registry bound to `host`.
///
/// A loopback-only registry is unreachable from a bridged container, so it
/// requires host networking.
pub fn network_mode_for(host: &str) -> NetworkMode {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let loopback = host.eq_ignore_ascii_case("localhost")
        || host.parse::<IpAddr>().map(|ip| ip.is_loopback()).unwrap_or(false);

    if loopback {
        NetworkMode::Host
    } else {
        NetworkMode::Default
    }
}

/// A running registry, its credential directory and the images pushed to it.
pub struct TargetRegistry {
    registry: Box<dyn RegistryHandle>,
    auth_dir: Option<TempDir>,
    env_guard: Option<ScopedEnvVar>,
    network: NetworkMode,
    auth_config: String,
    fixtures: FixtureState<RegistryFixtures>,
    running: bool,
}

impl TargetRegistry {
    pub fn new(registry: Box<dyn RegistryHandle>) -> Self {
        Self {
            registry,
            auth_dir: None,
            env_guard: None,
            network: NetworkMode::Default,
            auth_config: String::new(),
            fixtures: FixtureState::Uninitialized,
            running: false,
        }
    }

    /// Starts the registry, exports its credentials and pushes the fixtures.
    ///
    /// `DOCKER_CONFIG` points at the credential directory until
    /// [`stop`](Self::stop); two targets must not be started at once in one
    /// process.
    pub async fn start(&mut self, engine: &dyn ImageEngine, config: &HarnessConfig) -> Result<()> {
        if self.running {
            return Err(Error::Config("registry target already started".to_string()));
        }

        let auth_dir = tempfile::Builder::new().prefix(AUTH_DIR_PREFIX).tempdir()?;
        self.registry.start(auth_dir.path()).await?;
        self.running = true;

        let config_dir = auth_dir.path().to_path_buf();
        self.auth_dir = Some(auth_dir);

        self.network = network_mode_for(self.registry.host());
        self.env_guard = Some(ScopedEnvVar::set(DOCKER_CONFIG_ENV, &config_dir));

        let probe = self.registry.repo_name(AUTH_PROBE_REPO);
        self.auth_config = build_registry_auth(&config_dir, &[probe.as_str()])?;

        tracing::info!(
            host = %self.registry.host(),
            port = self.registry.port(),
            network = %self.network,
            "registry target started"
        );

        self.create_fixtures(engine, config).await
    }

    /// Builds and pushes the nine registry fixtures, restricting each image
    /// only after its push completed.
    ///
    /// Images built before a failure are still recorded so
    /// [`remove_local_intermediates`](Self::remove_local_intermediates)
    /// removes them.
    pub async fn create_fixtures(
        &mut self,
        engine: &dyn ImageEngine,
        config: &HarnessConfig,
    ) -> Result<()> {
        if !self.fixtures.needs_creation() {
            return Ok(());
        }
        let credentials = self.credentials()?;
        let metadata = PreparedMetadata::load(&config.testdata_dir)?;
        let builder = FixtureImageBuilder::new(engine, config, &metadata);

        let mut fixtures = RegistryFixtures::default();
        let populated = populate(
            self.registry.as_ref(),
            &builder,
            &credentials,
            &mut fixtures,
        )
        .await;
        self.fixtures = FixtureState::Ready(fixtures);

        if populated.is_ok() {
            tracing::info!("created registry fixtures");
        }
        populated
    }

    /// Stops the registry, restores `DOCKER_CONFIG` and removes the
    /// credential directory. Fixture references are kept for the sweep.
    pub async fn stop(&mut self) -> Result<()> {
        if !self.running {
            return Ok(());
        }
        self.running = false;

        let stopped = self.registry.stop().await;

        if let Some(mut guard) = self.env_guard.take() {
            guard.restore();
        }
        let removed = match self.auth_dir.take() {
            Some(dir) => dir.close().map_err(Error::from),
            None => Ok(()),
        };

        tracing::info!("registry target stopped");
        stopped.and(removed)
    }

    /// Removes the daemon-local copies left by building before pushing.
    pub async fn remove_local_intermediates(&self, engine: &dyn ImageEngine) -> Result<()> {
        match &self.fixtures {
            FixtureState::Ready(fixtures) => cleanup_fixtures(engine, fixtures).await,
            FixtureState::Uninitialized | FixtureState::Suppressed => Ok(()),
        }
    }

    /// Qualifies `name` with the running registry's address.
    pub fn repo_name(&self, name: &str) -> Result<String> {
        if !self.running {
            return Err(Error::RegistryNotActive);
        }
        Ok(self.registry.repo_name(name))
    }

    /// Credentials for pushing to the running registry.
    pub fn credentials(&self) -> Result<RegistryCredentials> {
        match (&self.auth_dir, self.running) {
            (Some(dir), true) => Ok(RegistryCredentials {
                config_dir: dir.path().to_path_buf(),
                encoded_auth: self.registry.encoded_auth(),
            }),
            _ => Err(Error::RegistryNotActive),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Directory holding the registry's `config.json`, while running.
    pub fn docker_config_dir(&self) -> Option<&Path> {
        self.auth_dir.as_ref().map(TempDir::path)
    }

    pub fn network(&self) -> NetworkMode {
        self.network
    }

    /// The `CNB_REGISTRY_AUTH` value for the registry.
    pub fn auth_config(&self) -> &str {
        &self.auth_config
    }

    pub fn fixtures(&self) -> &FixtureState<RegistryFixtures> {
        &self.fixtures
    }

    pub fn handle(&self) -> &dyn RegistryHandle {
        self.registry.as_ref()
    }
}

async fn populate(
    registry: &dyn RegistryHandle,
    builder: &FixtureImageBuilder<'_>,
    credentials: &RegistryCredentials,
    fixtures: &mut RegistryFixtures,
) -> Result<()> {
    let pusher = FixturePusher {
        registry,
        builder,
        credentials,
    };

    fixtures.inaccessible_image = registry.set_inaccessible(INACCESSIBLE_IMAGE_NAME);

    let name = pusher
        .push(FixtureTemplate::App, READ_ONLY_APP_PREFIX, &mut fixtures.read_only_app_image)
        .await?;
    registry.set_read_only(&name);

    let name = pusher
        .push(FixtureTemplate::Cache, READ_ONLY_CACHE_PREFIX, &mut fixtures.read_only_cache_image)
        .await?;
    registry.set_read_only(&name);

    let name = pusher
        .push(FixtureTemplate::FullRun, READ_ONLY_RUN_PREFIX, &mut fixtures.read_only_run_image)
        .await?;
    registry.set_read_only(&name);

    let name = pusher
        .push(FixtureTemplate::App, READ_WRITE_APP_PREFIX, &mut fixtures.read_write_app_image)
        .await?;
    registry.set_read_write(&name);

    let name = pusher
        .push(
            FixtureTemplate::Cache,
            READ_WRITE_CACHE_PREFIX,
            &mut fixtures.read_write_cache_image,
        )
        .await?;
    registry.set_read_write(&name);

    let name = pusher
        .push(
            FixtureTemplate::App,
            READ_WRITE_OTHER_APP_PREFIX,
            &mut fixtures.read_write_other_app_image,
        )
        .await?;
    registry.set_read_write(&name);

    pusher
        .push(FixtureTemplate::App, SOME_APP_PREFIX, &mut fixtures.some_app_image)
        .await?;
    pusher
        .push(FixtureTemplate::Cache, SOME_CACHE_PREFIX, &mut fixtures.some_cache_image)
        .await?;

    Ok(())
}

struct FixturePusher<'a> {
    registry: &'a dyn RegistryHandle,
    builder: &'a FixtureImageBuilder<'a>,
    credentials: &'a RegistryCredentials,
}

impl FixturePusher<'_> {
    /// Builds a uniquely named image and pushes it, returning the repository
    /// name.
    ///
    /// `slot` receives the reference once the local build exists, so a failed
    /// push still leaves the intermediate recorded for removal.
    async fn push(
        &self,
        template: FixtureTemplate,
        prefix: &str,
        slot: &mut String,
    ) -> Result<String> {
        let name = unique_name(prefix);
        let image = self.registry.repo_name(&name);

        *slot = self.builder.build(template, &image).await?;
        self.builder.engine().push(&image, self.credentials).await?;
        tracing::debug!(image = %image, "pushed registry fixture");
        Ok(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Privilege;
    use crate::testing::{FakeRegistry, RecordingEngine, DOCKER_CONFIG_LOCK};
    use std::path::PathBuf;

    fn config() -> HarnessConfig {
        HarnessConfig::default()
            .with_testdata_dir(PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("testdata"))
    }

    #[test]
    fn loopback_hosts_need_host_networking() {
        assert_eq!(network_mode_for("localhost"), NetworkMode::Host);
        assert_eq!(network_mode_for("LOCALHOST"), NetworkMode::Host);
        assert_eq!(network_mode_for("127.0.0.1"), NetworkMode::Host);
        assert_eq!(network_mode_for("127.1.2.3"), NetworkMode::Host);
        assert_eq!(network_mode_for("::1"), NetworkMode::Host);
        assert_eq!(network_mode_for("[::1]"), NetworkMode::Host);
    }

    #[test]
    fn other_hosts_use_default_networking() {
        assert_eq!(network_mode_for("192.168.1.20"), NetworkMode::Default);
        assert_eq!(network_mode_for("registry.example.com"), NetworkMode::Default);
        assert_eq!(network_mode_for("0.0.0.0"), NetworkMode::Default);
        assert_eq!(NetworkMode::Host.to_string(), "host");
    }

    #[test]
    fn repo_name_requires_running_registry() {
        let target = TargetRegistry::new(Box::new(FakeRegistry::new()));
        assert!(matches!(
            target.repo_name("some-repo"),
            Err(Error::RegistryNotActive)
        ));
        assert!(target.credentials().is_err());
    }

    #[tokio::test]
    async fn start_pushes_every_fixture_then_restricts_it() {
        let _env = DOCKER_CONFIG_LOCK.lock().await;
        let engine = RecordingEngine::new();
        let registry = FakeRegistry::new();
        let mut target = TargetRegistry::new(Box::new(registry.clone()));

        target.start(&engine, &config()).await.unwrap();

        let fixtures = target.fixtures().ready().cloned().unwrap();
        assert_eq!(fixtures.inaccessible_image, "localhost:5000/inaccessible-image");
        assert_eq!(engine.built().len(), 8);
        assert_eq!(engine.pushed().len(), 8);
        assert!(fixtures
            .read_only_app_image
            .starts_with("localhost:5000/some-read-only-app-image-"));

        let ro_name = fixtures
            .read_only_app_image
            .trim_start_matches("localhost:5000/");
        assert_eq!(registry.privilege_of(ro_name), Some(Privilege::ReadOnly));
        assert_eq!(
            registry.privilege_of(INACCESSIBLE_IMAGE_NAME),
            Some(Privilege::Inaccessible)
        );

        let events = engine.events();
        let push_at = events
            .iter()
            .position(|e| e == &format!("push {}", fixtures.read_only_run_image))
            .unwrap();
        let build_at = events
            .iter()
            .position(|e| e == &format!("build {}", fixtures.read_only_run_image))
            .unwrap();
        assert!(build_at < push_at);

        target.stop().await.unwrap();
    }

    #[tokio::test]
    async fn read_only_run_image_uses_full_base() {
        let _env = DOCKER_CONFIG_LOCK.lock().await;
        let engine = RecordingEngine::new();
        let mut target = TargetRegistry::new(Box::new(FakeRegistry::new()));
        let config = config();

        target.start(&engine, &config).await.unwrap();
        let run_image = target.fixtures().ready().unwrap().read_only_run_image.clone();

        let request = engine
            .build_requests()
            .into_iter()
            .find(|r| r.image_ref == run_image)
            .unwrap();
        assert_eq!(request.build_arg("fromImage"), Some(config.base_image_full.as_str()));
        assert!(request.build_arg("metadata").is_none());

        target.stop().await.unwrap();
    }

    #[tokio::test]
    async fn intermediates_skip_inaccessible_image() {
        let _env = DOCKER_CONFIG_LOCK.lock().await;
        let engine = RecordingEngine::new();
        let mut target = TargetRegistry::new(Box::new(FakeRegistry::new()));
        target.start(&engine, &config()).await.unwrap();
        target.stop().await.unwrap();

        target.remove_local_intermediates(&engine).await.unwrap();

        let mut removed = engine.removed();
        removed.sort();
        let mut built = engine.built();
        built.sort();
        assert_eq!(removed, built);
        assert!(removed.iter().all(|r| !r.contains("inaccessible")));
    }

    #[tokio::test]
    async fn failed_push_keeps_partial_fixtures_for_cleanup() {
        let _env = DOCKER_CONFIG_LOCK.lock().await;
        let engine = RecordingEngine::new().fail_push_of(READ_WRITE_CACHE_PREFIX);
        let mut target = TargetRegistry::new(Box::new(FakeRegistry::new()));

        assert!(target.start(&engine, &config()).await.is_err());
        assert!(target.is_running());

        target.stop().await.unwrap();
        target.remove_local_intermediates(&engine).await.unwrap();

        let fixtures = target.fixtures().ready().cloned().unwrap();
        assert!(fixtures.some_app_image.is_empty());
        assert_eq!(engine.removed().len(), 5);
    }

    #[tokio::test]
    async fn second_start_is_refused() {
        let _env = DOCKER_CONFIG_LOCK.lock().await;
        let engine = RecordingEngine::new();
        let mut target = TargetRegistry::new(Box::new(FakeRegistry::new()));
        target.start(&engine, &config()).await.unwrap();

        assert!(matches!(
            target.start(&engine, &config()).await,
            Err(Error::Config(_))
        ));
        target.stop().await.unwrap();
    }

    #[tokio::test]
    async fn failed_build_records_only_built_images() {
        let _env = DOCKER_CONFIG_LOCK.lock().await;
        let engine = RecordingEngine::new().fail_build_of(READ_WRITE_APP_PREFIX);
        let mut target = TargetRegistry::new(Box::new(FakeRegistry::new()));

        assert!(target.start(&engine, &config()).await.is_err());
        target.stop().await.unwrap();
        target.remove_local_intermediates(&engine).await.unwrap();

        let fixtures = target.fixtures().ready().cloned().unwrap();
        assert!(fixtures.read_write_app_image.is_empty());
        assert!(!fixtures.read_only_run_image.is_empty());

        let mut attempts = engine.remove_attempts();
        attempts.sort();
        let mut built = engine.built();
        built.sort();
        assert_eq!(built.len(), 3);
        assert_eq!(attempts, built);
    }

    #[tokio::test]
    async fn pushes_use_the_target_credentials() {
        let _env = DOCKER_CONFIG_LOCK.lock().await;
        let engine = RecordingEngine::new();
        let mut target = TargetRegistry::new(Box::new(FakeRegistry::new()));
        target.start(&engine, &config()).await.unwrap();

        let expected = target.credentials().unwrap();
        let used = engine.push_credentials();
        assert_eq!(used.len(), 8);
        assert!(used.iter().all(|c| c == &expected));
        assert!(expected.config_dir.join("config.json").is_file());
        assert!(!expected.encoded_auth.is_empty());

        target.stop().await.unwrap();
    }
}
