use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Request, State},
    response::{IntoResponse, Response},
};
use base64::Engine;
use cache::CacheBackend;
use config::{Config, GroupIdentifier};
use graph::GraphClient;
use http::{HeaderMap, HeaderName, HeaderValue, header};
use identity::{AzureClaims, User};
use sha2::{Digest, Sha256};

use crate::{
    error::ProxyError,
    metrics,
    transport::KubeTransport,
    user::{self, GroupDirectory},
};

const IMPERSONATE_USER: &str = "impersonate-user";
const IMPERSONATE_GROUP: &str = "impersonate-group";
const IMPERSONATE_EXTRA_PREFIX: &str = "impersonate-extra-";
const IMPERSONATE_UID: &str = "impersonate-uid";

/// Sub-protocol segment kubectl uses to smuggle the bearer token into
/// websocket upgrades (`kubectl exec`, `attach`, `port-forward`).
const WS_BEARER_PREFIX: &str = "base64url.bearer.authorization.k8s.io.";

/// Shared state for the proxy and health handlers.
pub(crate) struct AppState {
    pub(crate) config: Arc<Config>,
    pub(crate) cache: Arc<dyn CacheBackend>,
    pub(crate) directory: Arc<dyn GroupDirectory>,
    pub(crate) transport: Arc<dyn KubeTransport>,
    pub(crate) graph: Arc<GraphClient>,
    pub(crate) sa_token: String,
}

/// Fallback handler: every path not claimed by a health route is proxied to
/// the API server.
pub(crate) async fn handler(State(state): State<Arc<AppState>>, req: Request) -> Response {
    match proxy_request(state, req).await {
        Ok(response) => response,
        Err(error) => error.into_response(),
    }
}

async fn proxy_request(state: Arc<AppState>, mut req: Request) -> Result<Response, ProxyError> {
    let claims = req
        .extensions()
        .get::<AzureClaims>()
        .cloned()
        .ok_or(ProxyError::MissingIdentity)?;

    let identity = claims.translate(Some(&state.config.azure.tenant_id))?;

    let key = subject_key(&identity.subject);
    let cached = state.cache.get_user(&key).await?;

    metrics::record_cache_lookup(cached.is_some());

    // Client-supplied impersonation headers would let a caller act as someone
    // the proxy never resolved.
    if let Some(name) = find_impersonation_header(req.headers()) {
        return Err(ProxyError::ImpersonationHeader(name));
    }

    let user = match cached {
        Some(user) => user,
        None => resolve_user(&state, &identity, &key).await?,
    };

    let kubectl_version = kubectl_version(req.headers());

    rewrite_headers(req.headers_mut(), &state, &user)?;

    metrics::record_request(kubectl_version);

    Ok(state.transport.forward(req).await?)
}

async fn resolve_user(
    state: &AppState,
    identity: &identity::TranslatedIdentity,
    key: &str,
) -> Result<User, ProxyError> {
    let (username, user_type) = user::classify(identity);
    let groups = state.directory.groups(&identity.object_id, user_type).await?;
    let limit = state.config.azure.max_group_count;

    if groups.len() > limit - 1 {
        return Err(ProxyError::TooManyGroups {
            count: groups.len(),
            limit,
        });
    }

    let user = User {
        username,
        object_id: identity.object_id.clone(),
        groups,
        user_type,
    };

    state.cache.set_user(key, &user).await?;

    Ok(user)
}

fn rewrite_headers(headers: &mut HeaderMap, state: &AppState, user: &User) -> Result<(), ProxyError> {
    headers.remove(header::AUTHORIZATION);

    // The header may arrive split over several lines; rewrite them as one.
    let protocols = headers
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect::<Vec<_>>()
        .join(", ");

    if !protocols.is_empty() {
        match rewrite_websocket_protocols(&protocols) {
            Some(kept) => {
                headers.insert(header::SEC_WEBSOCKET_PROTOCOL, header_value(&kept)?);
            }
            None => {
                headers.remove(header::SEC_WEBSOCKET_PROTOCOL);
            }
        }
    }

    headers.insert(header::AUTHORIZATION, header_value(&format!("Bearer {}", state.sa_token))?);
    headers.insert(HeaderName::from_static(IMPERSONATE_USER), header_value(&user.username)?);

    for group in &user.groups {
        let value = match state.config.azure.group_identifier {
            GroupIdentifier::Name => &group.name,
            GroupIdentifier::ObjectId => &group.object_id,
        };

        headers.append(HeaderName::from_static(IMPERSONATE_GROUP), header_value(value)?);
    }

    Ok(())
}

fn header_value(value: &str) -> Result<HeaderValue, ProxyError> {
    HeaderValue::from_str(value).map_err(|_| ProxyError::InvalidHeader(value.to_string()))
}

/// Returns the first client-supplied impersonation header, if any. Header
/// names in a [`HeaderMap`] are already lowercase.
fn find_impersonation_header(headers: &HeaderMap) -> Option<String> {
    headers
        .keys()
        .map(|name| name.as_str())
        .find(|name| {
            *name == IMPERSONATE_USER
                || *name == IMPERSONATE_GROUP
                || *name == IMPERSONATE_UID
                || name.starts_with(IMPERSONATE_EXTRA_PREFIX)
        })
        .map(ToOwned::to_owned)
}

/// Drops bearer-token segments from a `Sec-WebSocket-Protocol` value,
/// preserving everything else. Returns `None` when no segment survives.
fn rewrite_websocket_protocols(value: &str) -> Option<String> {
    let kept: Vec<&str> = value
        .split(',')
        .map(str::trim)
        .filter(|segment| !segment.is_empty() && !is_bearer_segment(segment))
        .collect();

    if kept.is_empty() { None } else { Some(kept.join(", ")) }
}

fn is_bearer_segment(segment: &str) -> bool {
    segment.len() >= WS_BEARER_PREFIX.len() && segment[..WS_BEARER_PREFIX.len()].eq_ignore_ascii_case(WS_BEARER_PREFIX)
}

/// Extracts the kubectl version from the user agent for the request counter.
fn kubectl_version(headers: &HeaderMap) -> String {
    headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .and_then(|agent| agent.strip_prefix("kubectl/"))
        .and_then(|rest| rest.split_whitespace().next())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| "unknown".to_string())
}

/// Cache key for a resolved identity: a digest of the subject claim, so raw
/// subjects never appear in an external cache.
fn subject_key(subject: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(Sha256::digest(subject.as_bytes()))
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use cache::MemoryCache;
    use config::{AzureConfig, CredentialKind};
    use graph::GraphError;
    use http::StatusCode;
    use identity::{Group, UserType};

    use super::*;
    use crate::transport::TransportError;

    const TENANT: &str = "1f0c2779-2a83-4a70-9d0f-7e55e1a36502";

    struct FakeDirectory {
        groups: Vec<Group>,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl GroupDirectory for FakeDirectory {
        async fn groups(&self, _object_id: &str, _user_type: UserType) -> Result<Vec<Group>, GraphError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.groups.clone())
        }
    }

    struct FakeTransport {
        seen: Mutex<Option<http::request::Parts>>,
    }

    #[async_trait::async_trait]
    impl KubeTransport for FakeTransport {
        async fn forward(&self, req: Request) -> Result<Response, TransportError> {
            let (parts, _) = req.into_parts();
            *self.seen.lock().unwrap() = Some(parts);

            Ok(Response::builder().status(StatusCode::OK).body(Body::from("ok")).unwrap())
        }
    }

    fn groups(names: &[&str]) -> Vec<Group> {
        names
            .iter()
            .enumerate()
            .map(|(i, name)| Group {
                name: name.to_string(),
                object_id: format!("00000000-0000-0000-0000-00000000000{i}"),
            })
            .collect()
    }

    fn test_config(max_group_count: usize) -> Config {
        Config {
            server: Default::default(),
            metrics: Default::default(),
            azure: AzureConfig {
                tenant_id: TENANT.to_string(),
                client_id: "client-id".to_string(),
                client_secret: Some("secret".to_string().into()),
                credential: CredentialKind::ClientSecret,
                group_sync_interval: Duration::from_secs(300),
                group_filter_prefix: None,
                max_group_count,
                group_identifier: Default::default(),
            },
            kubernetes: Default::default(),
            cache: Default::default(),
        }
    }

    fn test_state(directory_groups: Vec<Group>, max_group_count: usize) -> (Arc<AppState>, Arc<FakeDirectory>, Arc<FakeTransport>) {
        let config = test_config(max_group_count);

        let directory = Arc::new(FakeDirectory {
            groups: directory_groups,
            calls: AtomicUsize::new(0),
        });

        let transport = Arc::new(FakeTransport { seen: Mutex::new(None) });

        let state = Arc::new(AppState {
            graph: Arc::new(GraphClient::new(&config.azure)),
            config: Arc::new(config),
            cache: Arc::new(MemoryCache::new(Duration::from_secs(600))),
            directory: directory.clone(),
            transport: transport.clone(),
            sa_token: "sa-token".to_string(),
        });

        (state, directory, transport)
    }

    fn request(claims: AzureClaims) -> Request {
        let mut req = Request::builder()
            .method("GET")
            .uri("/api/v1/namespaces")
            .header("authorization", "Bearer user-token")
            .header("user-agent", "kubectl/v1.28.2 (linux/amd64) kubernetes/89a4ea3")
            .body(Body::empty())
            .unwrap();

        req.extensions_mut().insert(claims);
        req
    }

    fn claims() -> AzureClaims {
        AzureClaims {
            sub: Some("sub-abc".to_string()),
            oid: Some("6d9d0982-6425-4c49-a8e9-0d2e2b5b4a9c".to_string()),
            preferred_username: Some("jane.doe@example.com".to_string()),
            tid: Some(TENANT.to_string()),
            groups: vec![],
        }
    }

    #[tokio::test]
    async fn client_impersonation_headers_are_rejected() {
        let (state, directory, _) = test_state(groups(&["aks-admins"]), 50);

        let mut req = request(claims());
        req.headers_mut().insert("Impersonate-User", "root".parse().unwrap());

        let response = handler(State(state), req).await;

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(directory.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn impersonate_extra_headers_are_rejected() {
        let (state, _, _) = test_state(groups(&["aks-admins"]), 50);

        let mut req = request(claims());
        req.headers_mut()
            .insert("Impersonate-Extra-Scopes", "admin".parse().unwrap());

        let response = handler(State(state), req).await;

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn too_many_groups_is_rejected() {
        let (state, _, transport) = test_state(groups(&["a", "b", "c"]), 3);

        let response = handler(State(state), request(claims())).await;

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(transport.seen.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn group_count_just_under_limit_passes() {
        let (state, _, _) = test_state(groups(&["a", "b"]), 3);

        let response = handler(State(state), request(claims())).await;

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn tenant_mismatch_is_unauthorized() {
        let (state, _, _) = test_state(groups(&[]), 50);

        let mut bad_claims = claims();
        bad_claims.tid = Some("00000000-0000-0000-0000-000000000000".to_string());

        let response = handler(State(state), request(bad_claims)).await;

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn missing_claim_is_internal_error() {
        let (state, _, _) = test_state(groups(&[]), 50);

        let mut bad_claims = claims();
        bad_claims.oid = None;

        let response = handler(State(state), request(bad_claims)).await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn forwarded_request_carries_impersonation() {
        let (state, _, transport) = test_state(groups(&["aks-admins", "aks-view", "platform"]), 50);

        let response = handler(State(state), request(claims())).await;

        assert_eq!(response.status(), StatusCode::OK);

        let seen = transport.seen.lock().unwrap().take().unwrap();

        assert_eq!(seen.headers.get("authorization").unwrap(), "Bearer sa-token");
        assert_eq!(seen.headers.get("impersonate-user").unwrap(), "jane.doe@example.com");

        let forwarded_groups: Vec<_> = seen.headers.get_all("impersonate-group").iter().collect();

        assert_eq!(forwarded_groups, vec!["aks-admins", "aks-view", "platform"]);
    }

    #[tokio::test]
    async fn second_request_is_served_from_cache() {
        let (state, directory, _) = test_state(groups(&["aks-admins"]), 50);

        let first = handler(State(state.clone()), request(claims())).await;
        let second = handler(State(state), request(claims())).await;

        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(directory.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn websocket_bearer_protocol_is_stripped() {
        let (state, _, transport) = test_state(groups(&["aks-admins"]), 50);

        let mut req = request(claims());
        req.headers_mut().insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            "fake, base64url.bearer.authorization.k8s.io.fakeToken, fake"
                .parse()
                .unwrap(),
        );

        handler(State(state), req).await;

        let seen = transport.seen.lock().unwrap().take().unwrap();

        assert_eq!(seen.headers.get(header::SEC_WEBSOCKET_PROTOCOL).unwrap(), "fake, fake");
    }

    #[tokio::test]
    async fn websocket_protocols_on_separate_lines_are_merged() {
        let (state, _, transport) = test_state(groups(&["aks-admins"]), 50);

        let mut req = request(claims());
        req.headers_mut().append(
            header::SEC_WEBSOCKET_PROTOCOL,
            "v4.channel.k8s.io, base64url.bearer.authorization.k8s.io.fakeToken"
                .parse()
                .unwrap(),
        );
        req.headers_mut()
            .append(header::SEC_WEBSOCKET_PROTOCOL, "v5.channel.k8s.io".parse().unwrap());

        handler(State(state), req).await;

        let seen = transport.seen.lock().unwrap().take().unwrap();
        let values: Vec<_> = seen.headers.get_all(header::SEC_WEBSOCKET_PROTOCOL).iter().collect();

        assert_eq!(values, vec!["v4.channel.k8s.io, v5.channel.k8s.io"]);
    }

    #[test]
    fn websocket_rewrite_drops_only_bearer_segments() {
        let rewritten =
            rewrite_websocket_protocols("v4.channel.k8s.io, base64url.bearer.authorization.k8s.io.dG9rZW4");

        assert_eq!(rewritten.as_deref(), Some("v4.channel.k8s.io"));
    }

    #[test]
    fn websocket_rewrite_removes_header_when_nothing_survives() {
        assert_eq!(rewrite_websocket_protocols("base64url.bearer.authorization.k8s.io.dG9rZW4"), None);
    }

    #[test]
    fn kubectl_version_from_user_agent() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::USER_AGENT,
            "kubectl/v1.28.2 (linux/amd64) kubernetes/89a4ea3".parse().unwrap(),
        );

        assert_eq!(kubectl_version(&headers), "v1.28.2");
    }

    #[test]
    fn non_kubectl_user_agent_is_unknown() {
        let mut headers = HeaderMap::new();
        headers.insert(header::USER_AGENT, "curl/8.0.1".parse().unwrap());

        assert_eq!(kubectl_version(&headers), "unknown");
        assert_eq!(kubectl_version(&HeaderMap::new()), "unknown");
    }

    #[test]
    fn subject_key_is_stable_and_opaque() {
        let first = subject_key("sub-abc");
        let second = subject_key("sub-abc");

        assert_eq!(first, second);
        assert!(!first.contains("sub-abc"));
        assert_ne!(first, subject_key("sub-abd"));
    }
}
