//! Container engine primitives the fixtures are built with.
//!
//! The harness never talks to the daemon directly; everything goes through
//! [`ImageEngine`] so tests can substitute a recording engine.

mod docker;

pub use docker::DockerCli;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::credentials::RegistryCredentials;
use crate::error::Result;

/// Operating system and architecture reported by the local daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonInfo {
    #[serde(rename = "OSType")]
    pub os_type: String,
    #[serde(rename = "Architecture")]
    pub architecture: String,
}

/// A single image build: tag, context and parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    /// Tag applied to the built image.
    pub image_ref: String,
    /// Build context directory.
    pub context: PathBuf,
    /// `--build-arg` pairs, in order.
    pub build_args: Vec<(String, String)>,
    /// Dockerfile override (`-f`).
    pub dockerfile: Option<PathBuf>,
}

impl BuildRequest {
    /// Creates a build of `context` tagged as `image_ref`.
    pub fn new(image_ref: impl Into<String>, context: impl Into<PathBuf>) -> Self {
        Self {
            image_ref: image_ref.into(),
            context: context.into(),
            build_args: Vec::new(),
            dockerfile: None,
        }
    }

    /// Adds a `--build-arg key=value`.
    pub fn with_build_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.build_args.push((key.into(), value.into()));
        self
    }

    /// Builds from `dockerfile` instead of the context's default Dockerfile.
    pub fn with_dockerfile(mut self, dockerfile: impl Into<PathBuf>) -> Self {
        self.dockerfile = Some(dockerfile.into());
        self
    }

    /// Returns the value of a build argument, if set.
    pub fn build_arg(&self, key: &str) -> Option<&str> {
        self.build_args
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Renders the `docker build` argument list.
    pub fn cli_args(&self) -> Vec<String> {
        let mut args = vec!["build".to_string(), "-t".to_string(), self.image_ref.clone()];

        for (key, value) in &self.build_args {
            args.push("--build-arg".to_string());
            args.push(format!("{}={}", key, value));
        }

        if let Some(dockerfile) = &self.dockerfile {
            args.push("-f".to_string());
            args.push(dockerfile.display().to_string());
        }

        args.push(self.context.display().to_string());
        args
    }
}

/// Image lifecycle primitives of the local container daemon.
///
/// All calls block until the underlying tool returns; no timeouts are imposed.
#[async_trait]
pub trait ImageEngine: Send + Sync {
    /// Queries the daemon for its OS type and architecture.
    async fn daemon_info(&self) -> Result<DaemonInfo>;

    /// Builds and tags an image.
    async fn build(&self, request: &BuildRequest) -> Result<()>;

    /// Pushes an image using the given registry credentials.
    async fn push(&self, image_ref: &str, credentials: &RegistryCredentials) -> Result<()>;

    /// Removes an image from the daemon.
    async fn remove(&self, image_ref: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_args_render_in_order() {
        let request = BuildRequest::new("some-app-image-abc", "testdata/app-image")
            .with_build_arg("fromImage", "busybox")
            .with_build_arg("metadata", r#"{"app":[]}"#);

        assert_eq!(
            request.cli_args(),
            vec![
                "build",
                "-t",
                "some-app-image-abc",
                "--build-arg",
                "fromImage=busybox",
                "--build-arg",
                r#"metadata={"app":[]}"#,
                "testdata/app-image",
            ]
        );
    }

    #[test]
    fn dockerfile_override_precedes_context() {
        let request = BuildRequest::new("lifecycle/acceptance/detect", "ctx")
            .with_dockerfile("ctx/Dockerfile");

        let args = request.cli_args();
        assert_eq!(&args[3..], &["-f", "ctx/Dockerfile", "ctx"]);
    }

    #[test]
    fn build_arg_lookup() {
        let request = BuildRequest::new("img", "ctx").with_build_arg("fromImage", "busybox");
        assert_eq!(request.build_arg("fromImage"), Some("busybox"));
        assert_eq!(request.build_arg("metadata"), None);
    }

    #[test]
    fn daemon_info_parses_docker_json() {
        let info: DaemonInfo = serde_json::from_str(
            r#"{"ID":"abc","OSType":"linux","Architecture":"x86_64","NCPU":8}"#,
        )
        .unwrap();
        assert_eq!(info.os_type, "linux");
        assert_eq!(info.architecture, "x86_64");
    }
}
