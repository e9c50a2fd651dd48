//! Harness configuration and validation.
//!
//! Validates configuration before any image or registry is created so that
//! misconfiguration fails fast instead of leaking half-provisioned fixtures.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Prefix for environment variables that override [`HarnessConfig`] fields.
pub const ENV_PREFIX: &str = "LIFECYCLE_ACCEPTANCE_";

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation errors (fatal).
    pub errors: Vec<String>,
    /// List of validation warnings (non-fatal).
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Adds an error to the result.
    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    /// Adds a warning to the result.
    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Merges another validation result into this one.
    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Converts to a Result, failing if there are errors.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    /// Validates the configuration and returns any issues found.
    fn validate(&self) -> ValidationResult;
}

/// Harness-wide settings shared by every phase test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// Directory holding metadata fixtures and fixture build contexts.
    #[serde(default = "default_testdata_dir")]
    pub testdata_dir: PathBuf,

    /// Base image every fixture image is built from.
    #[serde(default = "default_base_image")]
    pub base_image: String,

    /// Larger base image used for the registry run image.
    #[serde(default = "default_base_image_full")]
    pub base_image_full: String,

    /// Name of the Dockerfile inside the test image context.
    #[serde(default = "default_dockerfile_name")]
    pub dockerfile_name: String,

    /// Docker CLI binary.
    #[serde(default = "default_docker_cli")]
    pub docker_cli: String,

    /// Root of the lifecycle source tree the compiler runs `make` in.
    #[serde(default = "default_lifecycle_source_dir")]
    pub lifecycle_source_dir: PathBuf,

    /// Image backing the ephemeral registry.
    #[serde(default = "default_registry_image")]
    pub registry_image: String,
}

fn default_testdata_dir() -> PathBuf {
    PathBuf::from("testdata")
}

fn default_base_image() -> String {
    if cfg!(windows) {
        "mcr.microsoft.com/windows/nanoserver:1809".to_string()
    } else {
        "busybox".to_string()
    }
}

fn default_base_image_full() -> String {
    if cfg!(windows) {
        "mcr.microsoft.com/windows/servercore:1809".to_string()
    } else {
        "ubuntu:bionic".to_string()
    }
}

fn default_dockerfile_name() -> String {
    if cfg!(windows) {
        "Dockerfile.windows".to_string()
    } else {
        "Dockerfile".to_string()
    }
}

fn default_docker_cli() -> String {
    "docker".to_string()
}

fn default_lifecycle_source_dir() -> PathBuf {
    PathBuf::from("..")
}

fn default_registry_image() -> String {
    "registry:2".to_string()
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            testdata_dir: default_testdata_dir(),
            base_image: default_base_image(),
            base_image_full: default_base_image_full(),
            dockerfile_name: default_dockerfile_name(),
            docker_cli: default_docker_cli(),
            lifecycle_source_dir: default_lifecycle_source_dir(),
            registry_image: default_registry_image(),
        }
    }
}

impl HarnessConfig {
    /// Loads a configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;

        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse harness config: {}", e)))
    }

    /// Builds the default configuration with `LIFECYCLE_ACCEPTANCE_*` overrides applied.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from `lookup`, keyed by the full environment variable name.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |name: &str| {
            lookup(&format!("{}{}", ENV_PREFIX, name)).filter(|v| !v.trim().is_empty())
        };

        if let Some(v) = get("TESTDATA_DIR") {
            self.testdata_dir = PathBuf::from(v);
        }
        if let Some(v) = get("BASE_IMAGE") {
            self.base_image = v;
        }
        if let Some(v) = get("BASE_IMAGE_FULL") {
            self.base_image_full = v;
        }
        if let Some(v) = get("DOCKERFILE") {
            self.dockerfile_name = v;
        }
        if let Some(v) = get("DOCKER_CLI") {
            self.docker_cli = v;
        }
        if let Some(v) = get("LIFECYCLE_SOURCE_DIR") {
            self.lifecycle_source_dir = PathBuf::from(v);
        }
        if let Some(v) = get("REGISTRY_IMAGE") {
            self.registry_image = v;
        }
        self
    }

    /// Sets the testdata directory.
    pub fn with_testdata_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.testdata_dir = dir.into();
        self
    }

    /// Sets the fixture base image.
    pub fn with_base_image(mut self, image: impl Into<String>) -> Self {
        self.base_image = image.into();
        self
    }
}

impl Validate for HarnessConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.base_image.trim().is_empty() {
            result.add_error("base_image cannot be empty");
        }
        if self.base_image_full.trim().is_empty() {
            result.add_error("base_image_full cannot be empty");
        }
        if self.dockerfile_name.trim().is_empty() {
            result.add_error("dockerfile_name cannot be empty");
        }
        if self.docker_cli.trim().is_empty() {
            result.add_error("docker_cli cannot be empty");
        }

        if !self.testdata_dir.is_dir() {
            result.add_warning(format!(
                "testdata_dir '{}' does not exist, fixture builds will fail",
                self.testdata_dir.display()
            ));
        }

        result
    }
}

/// Toggles resolved before any resource of a phase test is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PhaseTestOptions {
    /// Skip building the daemon fixture images.
    #[serde(default)]
    pub without_daemon_fixtures: bool,
    /// Run the phase without an ephemeral registry.
    #[serde(default)]
    pub without_registry: bool,
}

impl PhaseTestOptions {
    /// Suppresses daemon fixture creation.
    pub fn without_daemon_fixtures(mut self) -> Self {
        self.without_daemon_fixtures = true;
        self
    }

    /// Suppresses the registry target.
    pub fn without_registry(mut self) -> Self {
        self.without_registry = true;
        self
    }
}

/// Validates a phase name before it is baked into paths and image references.
pub fn validate_phase_name(phase_name: &str) -> ValidationResult {
    let mut result = ValidationResult::default();

    if phase_name.trim().is_empty() {
        result.add_error("phase name cannot be empty");
        return result;
    }
    if phase_name.contains('/') || phase_name.contains('\\') {
        result.add_error(format!("phase name '{}' must not contain path separators", phase_name));
    }
    if phase_name.chars().any(char::is_whitespace) {
        result.add_error(format!("phase name '{}' must not contain whitespace", phase_name));
    }
    if phase_name.chars().any(|c| c.is_ascii_uppercase()) {
        result.add_error(format!(
            "phase name '{}' must be lowercase to form a valid image reference",
            phase_name
        ));
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_uses_linux_images() {
        let config = HarnessConfig::default();
        if !cfg!(windows) {
            assert_eq!(config.base_image, "busybox");
            assert_eq!(config.base_image_full, "ubuntu:bionic");
            assert_eq!(config.dockerfile_name, "Dockerfile");
        }
        assert_eq!(config.registry_image, "registry:2");
    }

    #[test]
    fn overrides_replace_only_set_values() {
        let env = HashMap::from([
            ("LIFECYCLE_ACCEPTANCE_BASE_IMAGE".to_string(), "alpine".to_string()),
            ("LIFECYCLE_ACCEPTANCE_TESTDATA_DIR".to_string(), "fixtures".to_string()),
            ("LIFECYCLE_ACCEPTANCE_DOCKER_CLI".to_string(), "  ".to_string()),
        ]);

        let config = HarnessConfig::default().with_overrides(|k| env.get(k).cloned());

        assert_eq!(config.base_image, "alpine");
        assert_eq!(config.testdata_dir, PathBuf::from("fixtures"));
        assert_eq!(config.docker_cli, "docker");
    }

    #[test]
    fn config_parses_partial_toml() {
        let config: HarnessConfig = toml::from_str(
            r#"
base_image = "alpine:3"
lifecycle_source_dir = "/src/lifecycle"
"#,
        )
        .unwrap();

        assert_eq!(config.base_image, "alpine:3");
        assert_eq!(config.lifecycle_source_dir, PathBuf::from("/src/lifecycle"));
        assert_eq!(config.docker_cli, "docker");
    }

    #[test]
    fn config_loads_from_file() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("harness.toml");
        std::fs::write(&path, "registry_image = \"registry:2.8\"\n").unwrap();

        let config = HarnessConfig::load(&path).unwrap();
        assert_eq!(config.registry_image, "registry:2.8");
    }

    #[test]
    fn empty_base_image_fails_validation() {
        let config = HarnessConfig::default().with_base_image("");
        let result = config.validate();
        assert!(!result.is_valid());
        assert!(result.errors.iter().any(|e| e.contains("base_image")));
    }

    #[test]
    fn missing_testdata_dir_only_warns() {
        let config = HarnessConfig::default().with_testdata_dir("/definitely/not/here");
        let result = config.validate();
        assert!(result.is_valid());
        assert!(result.warnings.iter().any(|w| w.contains("testdata_dir")));
    }

    #[test]
    fn phase_name_rules() {
        assert!(validate_phase_name("detect").is_valid());
        assert!(validate_phase_name("export").is_valid());
        assert!(!validate_phase_name("").is_valid());
        assert!(!validate_phase_name("de tect").is_valid());
        assert!(!validate_phase_name("a/b").is_valid());
        assert!(!validate_phase_name("Detect").is_valid());
    }

    #[test]
    fn validation_into_result_joins_errors() {
        let mut result = ValidationResult::default();
        result.add_error("first");
        result.add_error("second");
        let err = result.into_result().unwrap_err();
        assert!(err.to_string().contains("first; second"));
    }

    #[test]
    fn options_builders_set_flags() {
        let options = PhaseTestOptions::default().without_registry();
        assert!(options.without_registry);
        assert!(!options.without_daemon_fixtures);

        let options = options.without_daemon_fixtures();
        assert!(options.without_daemon_fixtures);
    }
}
