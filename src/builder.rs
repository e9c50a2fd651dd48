//! Fixture image builder.
//!
//! Turns a fixture template plus prepared metadata into a built image
//! through the [`ImageEngine`] build primitive.

use std::path::PathBuf;

use crate::config::HarnessConfig;
use crate::engine::{BuildRequest, ImageEngine};
use crate::error::Result;
use crate::metadata::PreparedMetadata;

/// Build context holding the app image Dockerfile.
pub const APP_IMAGE_CONTEXT: &str = "app-image";

/// Build context holding the cache (and run) image Dockerfile.
pub const CACHE_IMAGE_CONTEXT: &str = "cache-image";

const SUFFIX_LEN: usize = 10;

/// Appends a random lowercase suffix to `prefix`.
///
/// Fixture names are unique per run so concurrent or leftover images on a
/// shared daemon never collide.
pub fn unique_name(prefix: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}{}", prefix, &suffix[..SUFFIX_LEN])
}

/// The kinds of fixture image the harness knows how to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixtureTemplate {
    /// App image labelled with app metadata.
    App,
    /// Cache image labelled with cache metadata.
    Cache,
    /// Run image on the minimal base image.
    Run,
    /// Run image on the full base image.
    FullRun,
}

impl FixtureTemplate {
    fn context_name(self) -> &'static str {
        match self {
            FixtureTemplate::App => APP_IMAGE_CONTEXT,
            FixtureTemplate::Cache | FixtureTemplate::Run | FixtureTemplate::FullRun => {
                CACHE_IMAGE_CONTEXT
            }
        }
    }
}

/// Builds fixture images from templates.
pub struct FixtureImageBuilder<'a> {
    engine: &'a dyn ImageEngine,
    config: &'a HarnessConfig,
    metadata: &'a PreparedMetadata,
}

impl<'a> FixtureImageBuilder<'a> {
    /// Creates a builder that issues builds to `engine`.
    pub fn new(
        engine: &'a dyn ImageEngine,
        config: &'a HarnessConfig,
        metadata: &'a PreparedMetadata,
    ) -> Self {
        Self {
            engine,
            config,
            metadata,
        }
    }

    /// Describes the build of `template` tagged as `image_ref`.
    pub fn request(&self, template: FixtureTemplate, image_ref: &str) -> BuildRequest {
        let context: PathBuf = self.config.testdata_dir.join(template.context_name());
        let request = BuildRequest::new(image_ref, context);

        match template {
            FixtureTemplate::App => request
                .with_build_arg("fromImage", &self.config.base_image)
                .with_build_arg("metadata", &self.metadata.app),
            FixtureTemplate::Cache => request
                .with_build_arg("fromImage", &self.config.base_image)
                .with_build_arg("metadata", &self.metadata.cache),
            FixtureTemplate::Run => request.with_build_arg("fromImage", &self.config.base_image),
            FixtureTemplate::FullRun => {
                request.with_build_arg("fromImage", &self.config.base_image_full)
            }
        }
    }

    /// Builds `template` as `image_ref` and returns the reference.
    pub async fn build(&self, template: FixtureTemplate, image_ref: &str) -> Result<String> {
        let request = self.request(template, image_ref);
        self.engine.build(&request).await?;
        Ok(image_ref.to_string())
    }

    /// Returns the engine builds are issued to.
    pub fn engine(&self) -> &'a dyn ImageEngine {
        self.engine
    }
}
