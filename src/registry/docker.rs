//! Registry backed by a `registry:2` container behind the privilege gate.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::backoff::{wait_until, ExponentialBackoff};
use crate::config::HarnessConfig;
use crate::credentials::{encode_auth, DockerConfig};
use crate::engine::DockerCli;
use crate::error::{Error, Result};

use super::gate::{self, GateState};
use super::{Privilege, PrivilegeTable, RegistryHandle};

const REGISTRY_HOST: &str = "localhost";
const UPSTREAM_PORT: &str = "5000";
const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

struct GateServer {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// An ephemeral registry: an upstream `registry:2` container published on
/// loopback, fronted by an auth and privilege gate served in-process.
pub struct DockerRegistry {
    docker: DockerCli,
    image: String,
    port: u16,
    username: String,
    password: String,
    encoded_auth: String,
    privileges: PrivilegeTable,
    container_id: Option<String>,
    server: Option<GateServer>,
}

impl DockerRegistry {
    /// Creates a registry that will run `image` through `docker`.
    pub fn new(docker: DockerCli, image: impl Into<String>) -> Self {
        let user = uuid::Uuid::new_v4().simple().to_string();
        Self {
            docker,
            image: image.into(),
            port: 0,
            username: format!("user-{}", &user[..8]),
            password: uuid::Uuid::new_v4().simple().to_string(),
            encoded_auth: String::new(),
            privileges: PrivilegeTable::new(),
            container_id: None,
            server: None,
        }
    }

    /// Creates a registry from harness settings.
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self::new(
            DockerCli::with_cli_path(&config.docker_cli),
            &config.registry_image,
        )
    }

    /// Returns the privilege table the gate enforces.
    pub fn privileges(&self) -> PrivilegeTable {
        self.privileges.clone()
    }

    fn address(&self) -> String {
        format!("{}:{}", REGISTRY_HOST, self.port)
    }

    async fn start_inner(&mut self, auth_dir: &Path) -> Result<()> {
        let run_args = vec![
            "-p".to_string(),
            format!("127.0.0.1::{}", UPSTREAM_PORT),
            "-e".to_string(),
            "REGISTRY_HTTP_RELATIVEURLS=true".to_string(),
        ];
        let container_id = self.docker.run_detached(&self.image, &run_args).await?;
        self.container_id = Some(container_id.clone());

        let upstream_port = self
            .docker
            .published_port(&container_id, &format!("{}/tcp", UPSTREAM_PORT))
            .await?;
        let upstream = SocketAddr::from(([127, 0, 0, 1], upstream_port));

        let ready = wait_until(
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(2)),
            STARTUP_TIMEOUT,
            || upstream_ready(upstream),
        )
        .await;
        if !ready {
            return Err(Error::Registry(format!(
                "upstream registry on {} not ready after {:?}",
                upstream, STARTUP_TIMEOUT
            )));
        }

        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        self.port = listener.local_addr()?.port();

        let address = self.address();
        let mut docker_config = DockerConfig::load(auth_dir)?;
        docker_config.add_basic_auth(&address, &self.username, &self.password);
        docker_config.save(auth_dir)?;
        let basic_auth = docker_config
            .basic_auth(&address)
            .map(ToString::to_string)
            .ok_or_else(|| Error::Registry("failed to record registry credentials".to_string()))?;
        self.encoded_auth = encode_auth(&self.username, &self.password, &address)?;

        let state = Arc::new(GateState {
            upstream,
            basic_auth,
            privileges: self.privileges.clone(),
        });
        let app = gate::router(state);
        let (shutdown, shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = served {
                tracing::warn!(error = %e, "registry gate stopped with error");
            }
        });
        self.server = Some(GateServer { shutdown, handle });

        tracing::info!(
            address = %address,
            upstream = %upstream,
            container = %container_id,
            "started ephemeral registry"
        );
        Ok(())
    }
}

/// Returns true once the upstream registry answers `GET /v2/` successfully.
async fn upstream_ready(upstream: SocketAddr) -> bool {
    let Ok(stream) = TcpStream::connect(upstream).await else {
        return false;
    };
    let Ok((mut sender, conn)) = http1::handshake(TokioIo::new(stream)).await else {
        return false;
    };
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let Ok(request) = Request::builder()
        .uri("/v2/")
        .header(header::HOST, upstream.to_string())
        .body(Body::empty())
    else {
        return false;
    };

    matches!(
        sender.send_request(request).await,
        Ok(response) if response.status().is_success()
    )
}

#[async_trait]
impl RegistryHandle for DockerRegistry {
    async fn start(&mut self, auth_dir: &Path) -> Result<()> {
        if self.server.is_some() || self.container_id.is_some() {
            return Err(Error::Registry("registry already started".to_string()));
        }

        let started = self.start_inner(auth_dir).await;
        if started.is_err() {
            if let Err(e) = self.stop().await {
                tracing::warn!(error = %e, "failed to clean up partially started registry");
            }
        }
        started
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(mut server) = self.server.take() {
            let _ = server.shutdown.send(());
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut server.handle)
                .await
                .is_err()
            {
                tracing::debug!("registry gate did not drain in time, aborting");
                server.handle.abort();
            }
        }

        if let Some(container_id) = self.container_id.take() {
            self.docker.remove_container(&container_id).await?;
            tracing::info!(container = %container_id, "stopped ephemeral registry");
        }

        Ok(())
    }

    fn host(&self) -> &str {
        REGISTRY_HOST
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn set_privilege(&self, name: &str, privilege: Privilege) -> String {
        self.privileges.set(name, privilege);
        tracing::debug!(repository = %name, privilege = ?privilege, "set repository privilege");
        self.repo_name(name)
    }

    fn encoded_auth(&self) -> String {
        self.encoded_auth.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_registry_has_unique_credentials() {
        let a = DockerRegistry::new(DockerCli::new(), "registry:2");
        let b = DockerRegistry::new(DockerCli::new(), "registry:2");
        assert_ne!(a.username, b.username);
        assert_ne!(a.password, b.password);
        assert!(a.encoded_auth().is_empty());
    }

    #[test]
    fn privileges_are_shared_with_handle() {
        let registry = DockerRegistry::new(DockerCli::new(), "registry:2");
        let table = registry.privileges();

        let qualified = registry.set_read_only("some-repo");

        assert_eq!(qualified, "localhost:0/some-repo");
        assert_eq!(table.get("some-repo"), Privilege::ReadOnly);
    }

    #[tokio::test]
    async fn failed_start_leaves_nothing_running() {
        let temp = tempfile::TempDir::new().unwrap();
        let mut registry = DockerRegistry::new(
            DockerCli::with_cli_path("/nonexistent/docker-cli"),
            "registry:2",
        );

        assert!(registry.start(temp.path()).await.is_err());
        assert!(registry.container_id.is_none());
        assert!(registry.server.is_none());
    }

    #[tokio::test]
    async fn upstream_probe_fails_on_closed_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        assert!(!upstream_ready(addr).await);
    }
}
