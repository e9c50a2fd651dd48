//! Image metadata schemas and fixture metadata preparation.
//!
//! Fixture images carry lifecycle metadata as a label. The JSON fixtures on
//! disk are pretty-printed for readability; [`minify`] validates them against
//! the schema the phase expects and flattens them into a single build argument.

use std::collections::BTreeMap;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// File name of the app image metadata fixture.
pub const APP_METADATA_FILE: &str = "app_image_metadata.json";

/// File name of the cache image metadata fixture.
pub const CACHE_METADATA_FILE: &str = "cache_image_metadata.json";

/// Digest of a single exported layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerMetadata {
    #[serde(default)]
    pub sha: String,
}

/// A buildpack layer as recorded in image metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildpackLayerMetadata {
    #[serde(default)]
    pub sha: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub build: bool,
    #[serde(default)]
    pub launch: bool,
    #[serde(default)]
    pub cache: bool,
}

/// Persistent buildpack store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildpackStore {
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Layers contributed by one buildpack.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildpackLayersMetadata {
    #[serde(rename = "key", default)]
    pub id: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub layers: BTreeMap<String, BuildpackLayerMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store: Option<BuildpackStore>,
}

/// Run image the app image was exported on top of.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunImageMetadata {
    #[serde(rename = "topLayer", default)]
    pub top_layer: String,
    #[serde(default)]
    pub reference: String,
}

/// Run image references advertised by the stack.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackRunImage {
    #[serde(default)]
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mirrors: Vec<String>,
}

/// Stack section of the app image metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackMetadata {
    #[serde(rename = "runImage", default)]
    pub run_image: StackRunImage,
}

/// Metadata label of an exported app image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayersMetadata {
    #[serde(default)]
    pub app: Vec<LayerMetadata>,
    #[serde(rename = "sbom", default, skip_serializing_if = "Option::is_none")]
    pub bom: Option<LayerMetadata>,
    #[serde(default)]
    pub buildpacks: Vec<BuildpackLayersMetadata>,
    #[serde(default)]
    pub config: LayerMetadata,
    #[serde(default)]
    pub launcher: LayerMetadata,
    #[serde(rename = "process-types", default)]
    pub process_types: LayerMetadata,
    #[serde(rename = "runImage", default)]
    pub run_image: RunImageMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<StackMetadata>,
}

/// Metadata label of a cache image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheMetadata {
    #[serde(default)]
    pub buildpacks: Vec<BuildpackLayersMetadata>,
}

/// Reads a JSON fixture, validates it against `T` and re-serializes it compactly.
///
/// Fields unknown to `T` are dropped. Two fixtures that deserialize to equal
/// values produce byte-identical output.
pub fn minify<T>(path: impl AsRef<Path>) -> Result<String>
where
    T: DeserializeOwned + Serialize,
{
    let path = path.as_ref();
    let raw = std::fs::read(path).map_err(|source| Error::Fixture {
        path: path.to_path_buf(),
        source,
    })?;

    let value: T = serde_json::from_slice(&raw)?;
    Ok(serde_json::to_string(&value)?)
}

/// Minified metadata build arguments for the app and cache fixture images.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedMetadata {
    pub app: String,
    pub cache: String,
}

impl PreparedMetadata {
    /// Minifies both metadata fixtures found in `testdata_dir`.
    pub fn load(testdata_dir: &Path) -> Result<Self> {
        let app = minify::<LayersMetadata>(testdata_dir.join(APP_METADATA_FILE))?;
        let cache = minify::<CacheMetadata>(testdata_dir.join(CACHE_METADATA_FILE))?;

        tracing::debug!(dir = ?testdata_dir, "prepared fixture metadata");
        Ok(Self { app, cache })
    }
}
