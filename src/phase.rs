//! Phase test orchestration.
//!
//! A [`PhaseTest`] provisions everything one phase needs (daemon fixtures,
//! an optional ephemeral registry, the compiled phase binary and a test
//! image) and tears it all down again in [`PhaseTest::stop`].
//!
//! ```text
//! start: daemon fixtures -> registry + credential mirror -> hooks -> compile -> test image
//! stop:  daemon fixtures -> registry + local intermediates -> test image
//! ```

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use crate::compiler::{BinaryCompiler, MakeCompiler};
use crate::config::{validate_phase_name, HarnessConfig, PhaseTestOptions, Validate};
use crate::daemon::TargetDaemon;
use crate::engine::{BuildRequest, DockerCli, ImageEngine};
use crate::error::{Error, Result};
use crate::fixtures::{DaemonFixtures, RegistryFixtures};
use crate::fsutil;
use crate::registry::{DockerRegistry, NetworkMode, RegistryHandle, TargetRegistry};

/// Directory the phase binaries live in inside the test image.
pub const CONTAINER_BINARY_ROOT: &str = "/cnb/lifecycle";

/// Repository prefix of test images.
pub const TEST_IMAGE_PREFIX: &str = "lifecycle/acceptance/";

/// Subdirectory of the test context copied into the image root.
const CONTAINER_DIR: &str = "container";

/// Credential mirror location, relative to [`CONTAINER_DIR`].
const DOCKER_CONFIG_MIRROR: &str = "docker-config";

/// Callback run during [`PhaseTest::start_with`] once the registry is up.
pub type StartHook = Box<dyn FnOnce(&mut PhaseTest) -> Result<()> + Send>;

/// External primitives a phase test drives.
pub struct Collaborators {
    pub engine: Arc<dyn ImageEngine>,
    pub compiler: Arc<dyn BinaryCompiler>,
    /// Registry handle; ignored when the registry is suppressed.
    pub registry: Option<Box<dyn RegistryHandle>>,
}

impl Collaborators {
    /// Docker CLI engine, `make` compiler and a `registry:2` backed registry.
    pub fn docker(config: &HarnessConfig) -> Self {
        Self {
            engine: Arc::new(DockerCli::with_cli_path(&config.docker_cli)),
            compiler: Arc::new(MakeCompiler::new(&config.lifecycle_source_dir)),
            registry: Some(Box::new(DockerRegistry::from_config(config))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Started,
    Stopped,
}

/// Registry details handed to a test body.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryEnv {
    pub host: String,
    pub port: u16,
    pub network: NetworkMode,
    /// `CNB_REGISTRY_AUTH` value for the registry.
    pub auth_config: String,
    pub fixtures: Option<RegistryFixtures>,
}

/// Snapshot of a started phase test.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseEnv {
    pub phase_name: String,
    pub os: String,
    pub arch: String,
    pub test_image_ref: String,
    pub container_binary_path: String,
    pub container_binary_dir: PathBuf,
    pub docker_config_mirror: PathBuf,
    pub daemon_fixtures: Option<DaemonFixtures>,
    pub registry: Option<RegistryEnv>,
}

impl PhaseEnv {
    /// Network mode containers under test should use.
    pub fn network(&self) -> NetworkMode {
        self.registry
            .as_ref()
            .map(|r| r.network)
            .unwrap_or_default()
    }
}

/// One acceptance test run of a lifecycle phase.
///
/// A phase test is started once and stopped once; callers must call
/// [`stop`](Self::stop) even when [`start`](Self::start) or the test body
/// failed, or use [`run`](Self::run).
pub struct PhaseTest {
    phase_name: String,
    test_image_context: PathBuf,
    container_binary_dir: PathBuf,
    container_binary_path: String,
    test_image_ref: String,
    config: HarnessConfig,
    engine: Arc<dyn ImageEngine>,
    compiler: Arc<dyn BinaryCompiler>,
    daemon: TargetDaemon,
    registry: Option<TargetRegistry>,
    lifecycle: Lifecycle,
    test_image_built: bool,
}

impl PhaseTest {
    /// Creates a phase test against the local docker daemon, configured from
    /// `LIFECYCLE_ACCEPTANCE_*` environment variables.
    pub async fn new(
        phase_name: &str,
        test_image_context: impl Into<PathBuf>,
        options: PhaseTestOptions,
    ) -> Result<Self> {
        let config = HarnessConfig::from_env();
        let collaborators = Collaborators::docker(&config);
        Self::with_collaborators(phase_name, test_image_context, options, config, collaborators)
            .await
    }

    /// Creates a phase test with explicit configuration and collaborators.
    pub async fn with_collaborators(
        phase_name: &str,
        test_image_context: impl Into<PathBuf>,
        options: PhaseTestOptions,
        config: HarnessConfig,
        collaborators: Collaborators,
    ) -> Result<Self> {
        let mut validation = validate_phase_name(phase_name);
        validation.merge(config.validate());
        for warning in &validation.warnings {
            tracing::warn!(phase = %phase_name, "{}", warning);
        }
        validation.into_result()?;

        let Collaborators {
            engine,
            compiler,
            registry,
        } = collaborators;

        let mut daemon = TargetDaemon::detect(engine.as_ref()).await?;
        if options.without_daemon_fixtures {
            daemon.suppress_fixtures();
        }

        let registry = if options.without_registry {
            None
        } else {
            let handle = registry.ok_or_else(|| {
                Error::Config("registry support requested but no registry handle given".to_string())
            })?;
            Some(TargetRegistry::new(handle))
        };

        let test_image_context = test_image_context.into();
        let container_binary_dir = test_image_context
            .join(CONTAINER_DIR)
            .join("cnb")
            .join("lifecycle");

        tracing::debug!(
            phase = %phase_name,
            context = ?test_image_context,
            registry = registry.is_some(),
            "created phase test"
        );

        Ok(Self {
            phase_name: phase_name.to_string(),
            container_binary_path: format!("{}/{}", CONTAINER_BINARY_ROOT, phase_name),
            test_image_ref: format!("{}{}", TEST_IMAGE_PREFIX, phase_name),
            test_image_context,
            container_binary_dir,
            config,
            engine,
            compiler,
            daemon,
            registry,
            lifecycle: Lifecycle::Created,
            test_image_built: false,
        })
    }

    /// Provisions fixtures, compiles the phase and builds the test image.
    pub async fn start(&mut self) -> Result<()> {
        self.start_with(Vec::new()).await
    }

    /// Like [`start`](Self::start), running `hooks` after the registry is up
    /// and before compilation.
    ///
    /// The first failing step aborts the start; everything created up to
    /// that point is still released by [`stop`](Self::stop).
    pub async fn start_with(&mut self, hooks: Vec<StartHook>) -> Result<()> {
        if self.lifecycle != Lifecycle::Created {
            return Err(Error::Config(format!(
                "phase test for {} cannot be started twice",
                self.phase_name
            )));
        }
        self.lifecycle = Lifecycle::Started;
        tracing::info!(phase = %self.phase_name, "starting phase test");

        let engine = Arc::clone(&self.engine);

        self.daemon
            .create_fixtures(engine.as_ref(), &self.config)
            .await?;

        if let Some(registry) = self.registry.as_mut() {
            registry.start(engine.as_ref(), &self.config).await?;

            let mirror = self.test_image_context.join(CONTAINER_DIR).join(DOCKER_CONFIG_MIRROR);
            fsutil::reset_dir(&mirror)?;
            if let Some(config_dir) = registry.docker_config_dir() {
                fsutil::recursive_copy(config_dir, &mirror)?;
            }
        }

        for hook in hooks {
            hook(self)?;
        }

        self.compiler
            .compile_and_copy(self.daemon.os(), self.daemon.arch(), &self.container_binary_dir)
            .await?;

        let request = BuildRequest::new(&self.test_image_ref, &self.test_image_context)
            .with_dockerfile(self.test_image_context.join(&self.config.dockerfile_name));
        engine.build(&request).await?;
        self.test_image_built = true;

        tracing::info!(phase = %self.phase_name, image = %self.test_image_ref, "phase test started");
        Ok(())
    }

    /// Releases everything [`start`](Self::start) created.
    ///
    /// Every teardown step runs even if an earlier one failed; the first
    /// failure is returned. Calling it again is a no-op.
    pub async fn stop(&mut self) -> Result<()> {
        if self.lifecycle == Lifecycle::Stopped {
            return Ok(());
        }
        self.lifecycle = Lifecycle::Stopped;
        tracing::info!(phase = %self.phase_name, "stopping phase test");

        let engine = Arc::clone(&self.engine);
        let mut outcomes = Vec::new();

        outcomes.push(self.daemon.remove_fixtures(engine.as_ref()).await);

        if let Some(registry) = self.registry.as_mut() {
            outcomes.push(registry.stop().await);
            outcomes.push(registry.remove_local_intermediates(engine.as_ref()).await);
        }

        if self.test_image_built {
            outcomes.push(engine.remove(&self.test_image_ref).await);
            self.test_image_built = false;
        }

        let mut errors = outcomes.into_iter().filter_map(Result::err);
        let first = errors.next();
        for e in errors {
            tracing::warn!(phase = %self.phase_name, error = %e, "additional teardown failure");
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Starts the test, runs `body` and always stops it afterwards.
    ///
    /// The body's error wins over a teardown error.
    pub async fn run<F, Fut, T>(mut self, body: F) -> Result<T>
    where
        F: FnOnce(PhaseEnv) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let outcome = match self.start().await {
            Ok(()) => body(self.env()).await,
            Err(e) => Err(e),
        };
        let stopped = self.stop().await;

        match (outcome, stopped) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(teardown)) => {
                tracing::warn!(error = %teardown, "teardown failed after test failure");
                Err(e)
            }
        }
    }

    /// Qualifies `repo_name` with the running registry's address.
    pub fn reg_repo_name(&self, repo_name: &str) -> Result<String> {
        self.registry
            .as_ref()
            .ok_or(Error::RegistryNotActive)?
            .repo_name(repo_name)
    }

    pub fn phase_name(&self) -> &str {
        &self.phase_name
    }

    /// Host directory the compiled binaries are copied to.
    pub fn container_binary_dir(&self) -> &Path {
        &self.container_binary_dir
    }

    /// Path of the phase binary inside the test image.
    pub fn container_binary_path(&self) -> &str {
        &self.container_binary_path
    }

    pub fn test_image_ref(&self) -> &str {
        &self.test_image_ref
    }

    pub fn test_image_context(&self) -> &Path {
        &self.test_image_context
    }

    /// Where the registry credentials are mirrored inside the test context.
    pub fn docker_config_mirror(&self) -> PathBuf {
        self.test_image_context
            .join(CONTAINER_DIR)
            .join(DOCKER_CONFIG_MIRROR)
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn daemon(&self) -> &TargetDaemon {
        &self.daemon
    }

    pub fn registry(&self) -> Option<&TargetRegistry> {
        self.registry.as_ref()
    }

    pub fn daemon_fixtures(&self) -> Option<&DaemonFixtures> {
        self.daemon.fixtures().ready()
    }

    pub fn registry_fixtures(&self) -> Option<&RegistryFixtures> {
        self.registry.as_ref().and_then(|r| r.fixtures().ready())
    }

    /// Snapshot of the resolved paths, fixtures and registry details.
    pub fn env(&self) -> PhaseEnv {
        PhaseEnv {
            phase_name: self.phase_name.clone(),
            os: self.daemon.os().to_string(),
            arch: self.daemon.arch().to_string(),
            test_image_ref: self.test_image_ref.clone(),
            container_binary_path: self.container_binary_path.clone(),
            container_binary_dir: self.container_binary_dir.clone(),
            docker_config_mirror: self.docker_config_mirror(),
            daemon_fixtures: self.daemon_fixtures().cloned(),
            registry: self.registry.as_ref().map(|r| RegistryEnv {
                host: r.handle().host().to_string(),
                port: r.handle().port(),
                network: r.network(),
                auth_config: r.auth_config().to_string(),
                fixtures: r.fixtures().ready().cloned(),
            }),
        }
    }
}

impl Drop for PhaseTest {
    fn drop(&mut self) {
        if self.lifecycle == Lifecycle::Started {
            tracing::warn!(
                phase = %self.phase_name,
                "phase test dropped without stop, fixtures may have leaked"
            );
        }
    }
}
