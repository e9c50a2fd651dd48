//! Auth and privilege gate in front of an upstream registry.
//!
//! Every request must carry the registry's basic-auth credentials. Requests
//! against a repository are then checked against the [`PrivilegeTable`] and,
//! if allowed, forwarded unbuffered to the upstream registry over a fresh
//! HTTP/1.1 connection.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, Response, StatusCode, Uri};
use axum::response::IntoResponse;
use axum::Router;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;

use crate::error::{Error, Result};

use super::PrivilegeTable;

const REALM: &str = "lifecycle-acceptance";

/// Shared state of a gate.
#[derive(Debug, Clone)]
pub struct GateState {
    /// Address of the upstream registry.
    pub upstream: SocketAddr,
    /// Expected `base64(username:password)`.
    pub basic_auth: String,
    /// Repository privileges.
    pub privileges: PrivilegeTable,
}

/// What the gate does with a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Pass the request to the upstream registry.
    Forward,
    /// Missing or wrong credentials.
    Challenge,
    /// The repository's privilege forbids the request.
    Deny { repository: String },
}

/// Extracts the repository name from a registry API path.
///
/// `/v2/<name>/manifests/<ref>`, `/v2/<name>/blobs/...` and
/// `/v2/<name>/tags/list` address `<name>`; `/v2/` addresses none.
pub fn repository_of(path: &str) -> Option<&str> {
    let rest = path.strip_prefix("/v2/")?;

    ["/manifests/", "/blobs/", "/tags/"]
        .iter()
        .filter_map(|marker| rest.find(marker))
        .min()
        .map(|end| &rest[..end])
        .filter(|name| !name.is_empty())
}

/// Decides how to handle a request.
pub fn decide(state: &GateState, method: &Method, path: &str, headers: &HeaderMap) -> Decision {
    let expected = format!("Basic {}", state.basic_auth);
    let authorized = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !authorized {
        return Decision::Challenge;
    }

    match repository_of(path) {
        Some(repository) if !state.privileges.get(repository).allows(method.as_str()) => {
            Decision::Deny {
                repository: repository.to_string(),
            }
        }
        _ => Decision::Forward,
    }
}

/// Builds the gate router.
pub fn router(state: Arc<GateState>) -> Router {
    Router::new().fallback(handle).with_state(state)
}

async fn handle(State(state): State<Arc<GateState>>, request: Request) -> Response<Body> {
    let decision = decide(
        &state,
        request.method(),
        request.uri().path(),
        request.headers(),
    );
    tracing::debug!(
        method = %request.method(),
        uri = %request.uri(),
        decision = ?decision,
        "registry gate"
    );

    match decision {
        Decision::Forward => match forward(state.upstream, request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, "registry gate failed to reach upstream");
                (StatusCode::BAD_GATEWAY, e.to_string()).into_response()
            }
        },
        Decision::Challenge => unauthorized("authentication required"),
        Decision::Deny { repository } => {
            unauthorized(&format!("access to {} denied", repository))
        }
    }
}

fn unauthorized(message: &str) -> Response<Body> {
    let body = serde_json::json!({
        "errors": [{ "code": "UNAUTHORIZED", "message": message }]
    });

    let mut response = (StatusCode::UNAUTHORIZED, body.to_string()).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    if let Ok(challenge) = HeaderValue::from_str(&format!("Basic realm=\"{}\"", REALM)) {
        headers.insert(header::WWW_AUTHENTICATE, challenge);
    }
    response
}

/// Forwards `request` to `upstream`, streaming both bodies.
///
/// The `Host` header is preserved so upstream redirects point back at the gate.
pub async fn forward(upstream: SocketAddr, request: Request) -> Result<Response<Body>> {
    let stream = TcpStream::connect(upstream)
        .await
        .map_err(|e| Error::Registry(format!("failed to connect to upstream {}: {}", upstream, e)))?;

    let (mut sender, conn) = http1::Builder::new()
        .handshake(TokioIo::new(stream))
        .await
        .map_err(|e| Error::Registry(format!("upstream handshake failed: {}", e)))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::debug!(error = %e, "upstream registry connection ended");
        }
    });

    let (mut parts, body) = request.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map_or("/", |pq| pq.as_str())
        .to_string();
    parts.uri = path_and_query
        .parse::<Uri>()
        .map_err(|e| Error::Registry(format!("invalid upstream uri: {}", e)))?;
    parts.headers.remove(header::AUTHORIZATION);
    parts
        .headers
        .insert(header::CONNECTION, HeaderValue::from_static("close"));

    let response = sender
        .send_request(Request::from_parts(parts, body))
        .await
        .map_err(|e| Error::Registry(format!("upstream request failed: {}", e)))?;

    let (parts, incoming) = response.into_parts();
    Ok(Response::from_parts(parts, Body::new(incoming)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Privilege;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    const AUTH: &str = "dXNlcjpwYXNz";

    fn state(upstream: SocketAddr) -> GateState {
        GateState {
            upstream,
            basic_auth: AUTH.to_string(),
            privileges: PrivilegeTable::new(),
        }
    }

    fn authed(method: Method, uri: &str) -> Request {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Basic {}", AUTH))
            .body(Body::empty())
            .unwrap()
    }

    fn unused_addr() -> SocketAddr {
        "127.0.0.1:9".parse().unwrap()
    }

    #[test]
    fn repository_extraction() {
        assert_eq!(repository_of("/v2/"), None);
        assert_eq!(repository_of("/v2/some-repo/manifests/latest"), Some("some-repo"));
        assert_eq!(
            repository_of("/v2/org/some-repo/blobs/uploads/abc"),
            Some("org/some-repo")
        );
        assert_eq!(repository_of("/v2/some-repo/tags/list"), Some("some-repo"));
        assert_eq!(repository_of("/healthz"), None);
    }

    #[test]
    fn missing_credentials_are_challenged() {
        let state = state(unused_addr());
        let decision = decide(&state, &Method::GET, "/v2/", &HeaderMap::new());
        assert_eq!(decision, Decision::Challenge);
    }

    #[test]
    fn read_only_repository_rejects_push() {
        let state = state(unused_addr());
        state.privileges.set("some-repo", Privilege::ReadOnly);

        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Basic {}", AUTH)).unwrap(),
        );

        assert_eq!(
            decide(&state, &Method::GET, "/v2/some-repo/manifests/latest", &headers),
            Decision::Forward
        );
        assert_eq!(
            decide(&state, &Method::POST, "/v2/some-repo/blobs/uploads/", &headers),
            Decision::Deny {
                repository: "some-repo".to_string()
            }
        );
    }

    #[test]
    fn inaccessible_repository_rejects_pull() {
        let state = state(unused_addr());
        state.privileges.set("inaccessible-image", Privilege::Inaccessible);

        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Basic {}", AUTH)).unwrap(),
        );

        assert!(matches!(
            decide(&state, &Method::HEAD, "/v2/inaccessible-image/manifests/latest", &headers),
            Decision::Deny { .. }
        ));
        assert_eq!(decide(&state, &Method::GET, "/v2/", &headers), Decision::Forward);
    }

    #[test]
    fn inaccessible_repository_rejects_push() {
        let state = state(unused_addr());
        state.privileges.set("inaccessible-image", Privilege::Inaccessible);

        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Basic {}", AUTH)).unwrap(),
        );

        let uploads = [
            (Method::POST, "/v2/inaccessible-image/blobs/uploads/"),
            (Method::PATCH, "/v2/inaccessible-image/blobs/uploads/abc"),
            (Method::PUT, "/v2/inaccessible-image/blobs/uploads/abc?digest=sha256:00"),
            (Method::PUT, "/v2/inaccessible-image/manifests/latest"),
        ];
        for (method, path) in uploads {
            assert_eq!(
                decide(&state, &method, path, &headers),
                Decision::Deny {
                    repository: "inaccessible-image".to_string()
                },
                "{} {} was not denied",
                method,
                path
            );
        }
    }

    #[tokio::test]
    async fn challenge_carries_basic_realm() {
        let app = router(Arc::new(state(unused_addr())));
        let request = Request::builder().uri("/v2/").body(Body::empty()).unwrap();

        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let challenge = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        assert!(challenge.starts_with("Basic realm="));
    }

    #[tokio::test]
    async fn allowed_request_is_forwarded_with_host_preserved() {
        async fn echo(request: Request) -> String {
            let host = request
                .headers()
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            let auth = request.headers().contains_key(header::AUTHORIZATION);
            format!("{} {} {}", request.uri(), host, auth)
        }

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let app = Router::new().fallback(echo);
            let _ = axum::serve(listener, app).await;
        });

        let app = router(Arc::new(state(upstream)));
        let mut request = authed(Method::GET, "/v2/some-repo/tags/list?n=10");
        request
            .headers_mut()
            .insert(header::HOST, HeaderValue::from_static("localhost:5555"));

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(
            String::from_utf8_lossy(&body),
            "/v2/some-repo/tags/list?n=10 localhost:5555 false"
        );
    }

    #[tokio::test]
    async fn denied_request_never_reaches_upstream() {
        let gate_state = state(unused_addr());
        gate_state.privileges.set("some-repo", Privilege::ReadOnly);
        let app = router(Arc::new(gate_state));

        let response = app
            .oneshot(authed(Method::PUT, "/v2/some-repo/manifests/latest"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn inaccessible_push_is_unauthorized() {
        let gate_state = state(unused_addr());
        gate_state
            .privileges
            .set("inaccessible-image", Privilege::Inaccessible);
        let app = router(Arc::new(gate_state));

        for method in [Method::POST, Method::PATCH, Method::PUT] {
            let response = app
                .clone()
                .oneshot(authed(method, "/v2/inaccessible-image/blobs/uploads/"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }
    }

    #[tokio::test]
    async fn unreachable_upstream_is_bad_gateway() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed = listener.local_addr().unwrap();
        drop(listener);

        let app = router(Arc::new(state(closed)));
        let response = app.oneshot(authed(Method::GET, "/v2/")).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
