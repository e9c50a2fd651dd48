//! Fixture image sets and the cleanup sweep shared by all of them.
//!
//! Each set exposes its images as `(label, image)` pairs so teardown can walk
//! any set the same way. Images whose reference contains
//! [`INACCESSIBLE_MARKER`] are never removed: they were made unreachable on
//! purpose and a removal attempt would itself fail. This is a naming
//! convention of the fixture names generated here, not a general rule.

use serde::{Deserialize, Serialize};

use crate::engine::ImageEngine;
use crate::error::{CleanupFailure, Error, Result};

/// Substring marking an image as deliberately unreachable.
pub const INACCESSIBLE_MARKER: &str = "inaccessible";

/// A collection of fixture images that can be enumerated for cleanup.
pub trait FixtureSet {
    /// Returns every `(label, image)` pair, including empty references.
    fn images(&self) -> Vec<(&'static str, &str)>;
}

/// Daemon-local images used when a phase runs without a registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonFixtures {
    pub app_image: String,
    pub cache_image: String,
    pub run_image: String,
}

impl FixtureSet for DaemonFixtures {
    fn images(&self) -> Vec<(&'static str, &str)> {
        vec![
            ("app_image", self.app_image.as_str()),
            ("cache_image", self.cache_image.as_str()),
            ("run_image", self.run_image.as_str()),
        ]
    }
}

/// Registry-hosted images across the permission states tests exercise.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryFixtures {
    pub inaccessible_image: String,
    pub read_only_app_image: String,
    pub read_only_cache_image: String,
    pub read_only_run_image: String,
    pub read_write_app_image: String,
    pub read_write_cache_image: String,
    pub read_write_other_app_image: String,
    pub some_app_image: String,
    pub some_cache_image: String,
}

impl FixtureSet for RegistryFixtures {
    fn images(&self) -> Vec<(&'static str, &str)> {
        vec![
            ("inaccessible_image", self.inaccessible_image.as_str()),
            ("read_only_app_image", self.read_only_app_image.as_str()),
            ("read_only_cache_image", self.read_only_cache_image.as_str()),
            ("read_only_run_image", self.read_only_run_image.as_str()),
            ("read_write_app_image", self.read_write_app_image.as_str()),
            ("read_write_cache_image", self.read_write_cache_image.as_str()),
            (
                "read_write_other_app_image",
                self.read_write_other_app_image.as_str(),
            ),
            ("some_app_image", self.some_app_image.as_str()),
            ("some_cache_image", self.some_cache_image.as_str()),
        ]
    }
}

/// Creation state of a fixture set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixtureState<T> {
    /// Not created yet.
    Uninitialized,
    /// Creation was turned off for this test.
    Suppressed,
    /// Created and owned by the target.
    Ready(T),
}

impl<T> Default for FixtureState<T> {
    fn default() -> Self {
        FixtureState::Uninitialized
    }
}

impl<T> FixtureState<T> {
    /// Returns true if the fixtures still have to be built.
    pub fn needs_creation(&self) -> bool {
        matches!(self, FixtureState::Uninitialized)
    }

    /// Returns the created fixtures, if any.
    pub fn ready(&self) -> Option<&T> {
        match self {
            FixtureState::Ready(fixtures) => Some(fixtures),
            _ => None,
        }
    }
}

/// Returns true if the image was made unreachable on purpose.
pub fn is_deliberately_inaccessible(image: &str) -> bool {
    image.contains(INACCESSIBLE_MARKER)
}

/// Images a sweep over `set` will attempt to remove.
pub fn removable_images<S: FixtureSet + ?Sized>(set: &S) -> Vec<(&'static str, &str)> {
    set.images()
        .into_iter()
        .filter(|(_, image)| !image.is_empty())
        .filter(|(_, image)| !is_deliberately_inaccessible(image))
        .collect()
}

/// Removes every removable image of `set` from the daemon.
///
/// A failed removal does not stop the sweep; all failures are returned
/// together once every image has been attempted.
pub async fn cleanup_fixtures<S: FixtureSet + ?Sized>(
    engine: &dyn ImageEngine,
    set: &S,
) -> Result<()> {
    let mut failures = Vec::new();

    for (label, image) in removable_images(set) {
        if let Err(e) = engine.remove(image).await {
            tracing::warn!(image = %image, label = %label, error = %e, "failed to remove fixture image");
            failures.push(CleanupFailure {
                label: label.to_string(),
                image: image.to_string(),
                reason: e.to_string(),
            });
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(Error::Cleanup { failures })
    }
}
