use std::sync::Arc;

use axum::{Json, body::Body, extract::State};
use http::{Request, StatusCode, header};
use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec,
};

use crate::{proxy::AppState, transport::KubeTransport};

/// Resources the proxy's service account must be allowed to impersonate for
/// any request to succeed.
const IMPERSONATED_RESOURCES: &[&str] = &["users", "groups", "serviceaccounts"];

const ACCESS_REVIEW_PATH: &str = "/apis/authorization.k8s.io/v1/selfsubjectaccessreviews";

#[derive(Debug, serde::Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub(crate) enum HealthState {
    Ok,
    Error,
}

/// Liveness: the proxy is alive as long as its own directory credential can
/// still produce tokens.
pub(crate) async fn healthz(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthState>) {
    if state.graph.tokens().is_valid().await {
        (StatusCode::OK, Json(HealthState::Ok))
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, Json(HealthState::Error))
    }
}

/// Readiness: the API server is reachable and the service account may
/// impersonate users, groups and service accounts.
pub(crate) async fn readyz(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthState>) {
    for resource in IMPERSONATED_RESOURCES {
        match can_impersonate(&state, resource).await {
            Ok(true) => {}
            Ok(false) => {
                log::warn!("readiness check failed: impersonating `{resource}` is not allowed");
                return (StatusCode::INTERNAL_SERVER_ERROR, Json(HealthState::Error));
            }
            Err(error) => {
                log::warn!("readiness check failed: {error}");
                return (StatusCode::INTERNAL_SERVER_ERROR, Json(HealthState::Error));
            }
        }
    }

    (StatusCode::OK, Json(HealthState::Ok))
}

/// Asks the API server whether the proxy may impersonate `resource` by
/// posting a `SelfSubjectAccessReview` through the regular transport.
async fn can_impersonate(state: &AppState, resource: &str) -> anyhow::Result<bool> {
    let review = SelfSubjectAccessReview {
        spec: SelfSubjectAccessReviewSpec {
            resource_attributes: Some(ResourceAttributes {
                resource: Some(resource.to_string()),
                verb: Some("impersonate".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        },
        ..Default::default()
    };

    let request = Request::builder()
        .method(http::Method::POST)
        .uri(ACCESS_REVIEW_PATH)
        .header(header::AUTHORIZATION, format!("Bearer {}", state.sa_token))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_vec(&review)?))?;

    let response = state.transport.forward(request).await?;

    if !response.status().is_success() {
        anyhow::bail!("access review returned status {}", response.status());
    }

    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024).await?;
    let review: SelfSubjectAccessReview = serde_json::from_slice(&body)?;

    Ok(review.status.map(|status| status.allowed).unwrap_or(false))
}
