//! The local container daemon and its fixture images.

use crate::builder::{unique_name, FixtureImageBuilder, FixtureTemplate};
use crate::config::HarnessConfig;
use crate::engine::ImageEngine;
use crate::error::Result;
use crate::fixtures::{cleanup_fixtures, DaemonFixtures, FixtureState};
use crate::metadata::PreparedMetadata;

/// Prefix of the daemon app fixture image.
pub const APP_IMAGE_PREFIX: &str = "some-app-image-";
/// Prefix of the daemon cache fixture image.
pub const CACHE_IMAGE_PREFIX: &str = "some-cache-image-";
/// Prefix of the daemon run fixture image.
pub const RUN_IMAGE_PREFIX: &str = "some-run-image-";

/// Maps architecture spellings some daemons report to the canonical name.
pub fn normalize_arch(arch: &str) -> String {
    match arch {
        "x86_64" => "amd64".to_string(),
        "aarch64" => "arm64".to_string(),
        other => other.to_string(),
    }
}

/// The daemon phases run against, plus the fixture images it holds.
#[derive(Debug, Clone)]
pub struct TargetDaemon {
    os: String,
    arch: String,
    fixtures: FixtureState<DaemonFixtures>,
}

impl TargetDaemon {
    /// Creates a target for a daemon with the given OS and architecture.
    pub fn new(os: impl Into<String>, arch: &str) -> Self {
        Self {
            os: os.into(),
            arch: normalize_arch(arch),
            fixtures: FixtureState::Uninitialized,
        }
    }

    /// Queries `engine` for the daemon's platform.
    pub async fn detect(engine: &dyn ImageEngine) -> Result<Self> {
        let info = engine.daemon_info().await?;
        let daemon = Self::new(info.os_type, &info.architecture);

        tracing::info!(os = %daemon.os, arch = %daemon.arch, "detected target daemon");
        Ok(daemon)
    }

    pub fn os(&self) -> &str {
        &self.os
    }

    pub fn arch(&self) -> &str {
        &self.arch
    }

    pub fn fixtures(&self) -> &FixtureState<DaemonFixtures> {
        &self.fixtures
    }

    /// Turns fixture creation and removal into no-ops.
    pub fn suppress_fixtures(&mut self) {
        self.fixtures = FixtureState::Suppressed;
    }

    /// Builds the app, cache and run fixture images once.
    ///
    /// Later calls, and calls after [`suppress_fixtures`](Self::suppress_fixtures),
    /// do nothing. Images built before a failure stay recorded so
    /// [`remove_fixtures`](Self::remove_fixtures) still removes them.
    pub async fn create_fixtures(
        &mut self,
        engine: &dyn ImageEngine,
        config: &HarnessConfig,
    ) -> Result<()> {
        if !self.fixtures.needs_creation() {
            return Ok(());
        }

        let metadata = PreparedMetadata::load(&config.testdata_dir)?;
        let builder = FixtureImageBuilder::new(engine, config, &metadata);

        let mut fixtures = DaemonFixtures::default();
        let built = build_all(&builder, &mut fixtures).await;

        if built.is_ok() {
            tracing::info!(
                app = %fixtures.app_image,
                cache = %fixtures.cache_image,
                run = %fixtures.run_image,
                "created daemon fixtures"
            );
        }
        self.fixtures = FixtureState::Ready(fixtures);
        built
    }

    /// Removes every fixture image this target created.
    pub async fn remove_fixtures(&self, engine: &dyn ImageEngine) -> Result<()> {
        match &self.fixtures {
            FixtureState::Ready(fixtures) => cleanup_fixtures(engine, fixtures).await,
            FixtureState::Uninitialized | FixtureState::Suppressed => Ok(()),
        }
    }
}

/// Builds app, cache and run in order, recording each reference once built.
async fn build_all(
    builder: &FixtureImageBuilder<'_>,
    fixtures: &mut DaemonFixtures,
) -> Result<()> {
    fixtures.app_image = builder
        .build(FixtureTemplate::App, &unique_name(APP_IMAGE_PREFIX))
        .await?;
    fixtures.cache_image = builder
        .build(FixtureTemplate::Cache, &unique_name(CACHE_IMAGE_PREFIX))
        .await?;
    fixtures.run_image = builder
        .build(FixtureTemplate::Run, &unique_name(RUN_IMAGE_PREFIX))
        .await?;
    Ok(())
}
