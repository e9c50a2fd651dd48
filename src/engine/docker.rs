//! Docker CLI backed image engine.

use std::process::Output;

use async_trait::async_trait;
use tokio::process::Command;

use crate::credentials::RegistryCredentials;
use crate::error::{Error, Result};

use super::{BuildRequest, DaemonInfo, ImageEngine};

/// Image engine that shells out to the `docker` CLI.
///
/// Pushes authenticate through `docker --config <dir>` with the
/// `config.json` in [`RegistryCredentials::config_dir`]. The CLI has no way
/// to accept an `X-Registry-Auth` header, so
/// [`RegistryCredentials::encoded_auth`] is unused here; it is for engines
/// that talk to the daemon API directly.
#[derive(Debug, Clone)]
pub struct DockerCli {
    /// Path to the docker CLI binary.
    cli_path: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerCli {
    /// Creates an engine using the default `docker` command.
    pub fn new() -> Self {
        Self {
            cli_path: "docker".to_string(),
        }
    }

    /// Creates an engine with a custom CLI path.
    pub fn with_cli_path(cli_path: impl Into<String>) -> Self {
        Self {
            cli_path: cli_path.into(),
        }
    }

    /// Returns the CLI path.
    pub fn cli_path(&self) -> &str {
        &self.cli_path
    }

    async fn run(&self, action: &'static str, subject: &str, args: &[String]) -> Result<Output> {
        tracing::debug!(cli = %self.cli_path, args = ?args, "running docker");

        let output = Command::new(&self.cli_path)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::Engine {
                action,
                image: subject.to_string(),
                reason: format!("failed to run {}: {}", self.cli_path, e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Engine {
                action,
                image: subject.to_string(),
                reason: stderr.trim().to_string(),
            });
        }

        Ok(output)
    }

    /// Starts a detached container and returns its ID.
    pub async fn run_detached(&self, image: &str, run_args: &[String]) -> Result<String> {
        let mut args = vec!["run".to_string(), "-d".to_string(), "--rm".to_string()];
        args.extend(run_args.iter().cloned());
        args.push(image.to_string());

        let output = self.run("run", image, &args).await?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Resolves the host port a container port is published on.
    pub async fn published_port(&self, container_id: &str, container_port: &str) -> Result<u16> {
        let args = vec![
            "port".to_string(),
            container_id.to_string(),
            container_port.to_string(),
        ];
        let output = self.run("port", container_id, &args).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        parse_published_port(&stdout).ok_or_else(|| Error::Engine {
            action: "port",
            image: container_id.to_string(),
            reason: format!("unexpected port mapping output: {}", stdout.trim()),
        })
    }

    /// Force-removes a container.
    pub async fn remove_container(&self, container_id: &str) -> Result<()> {
        let args = vec!["rm".to_string(), "-f".to_string(), container_id.to_string()];
        self.run("rm", container_id, &args).await?;
        Ok(())
    }
}

fn push_args(image_ref: &str, credentials: &RegistryCredentials) -> Vec<String> {
    vec![
        "--config".to_string(),
        credentials.config_dir.display().to_string(),
        "push".to_string(),
        image_ref.to_string(),
    ]
}

/// Extracts the port from `docker port` output such as `127.0.0.1:49153`.
fn parse_published_port(output: &str) -> Option<u16> {
    output
        .lines()
        .filter_map(|line| line.trim().rsplit(':').next())
        .find_map(|port| port.parse().ok())
}

#[async_trait]
impl ImageEngine for DockerCli {
    async fn daemon_info(&self) -> Result<DaemonInfo> {
        let args = vec![
            "info".to_string(),
            "--format".to_string(),
            "{{json .}}".to_string(),
        ];
        let output = self.run("info", "daemon", &args).await?;
        let info: DaemonInfo = serde_json::from_slice(&output.stdout)?;
        Ok(info)
    }

    async fn build(&self, request: &BuildRequest) -> Result<()> {
        tracing::info!(
            image = %request.image_ref,
            context = ?request.context,
            "building image"
        );
        self.run("build", &request.image_ref, &request.cli_args())
            .await?;
        Ok(())
    }

    async fn push(&self, image_ref: &str, credentials: &RegistryCredentials) -> Result<()> {
        tracing::info!(image = %image_ref, "pushing image");
        self.run("push", image_ref, &push_args(image_ref, credentials))
            .await?;
        Ok(())
    }

    async fn remove(&self, image_ref: &str) -> Result<()> {
        tracing::info!(image = %image_ref, "removing image");
        let args = vec![
            "image".to_string(),
            "rm".to_string(),
            "-f".to_string(),
            image_ref.to_string(),
        ];
        self.run("remove", image_ref, &args).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ipv4_port_mapping() {
        assert_eq!(parse_published_port("127.0.0.1:49153\n"), Some(49153));
    }

    #[test]
    fn parses_first_of_multiple_mappings() {
        assert_eq!(
            parse_published_port("0.0.0.0:32768\n[::]:32768\n"),
            Some(32768)
        );
    }

    #[test]
    fn push_authenticates_through_config_dir() {
        let credentials = RegistryCredentials {
            config_dir: "/tmp/test.docker.config.dir".into(),
            encoded_auth: "e30=".to_string(),
        };

        let args = push_args("localhost:5000/some-repo", &credentials);

        assert_eq!(
            args,
            vec![
                "--config",
                "/tmp/test.docker.config.dir",
                "push",
                "localhost:5000/some-repo"
            ]
        );
    }

    #[test]
    fn rejects_garbage_port_output() {
        assert_eq!(parse_published_port("no mapping"), None);
    }

    #[tokio::test]
    async fn missing_cli_is_an_engine_error() {
        let engine = DockerCli::with_cli_path("/nonexistent/docker-cli");
        let err = engine.remove("some-image").await.unwrap_err();

        match err {
            Error::Engine { action, image, .. } => {
                assert_eq!(action, "remove");
                assert_eq!(image, "some-image");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
