use axum::response::{IntoResponse, Response};
use cache::CacheError;
use graph::GraphError;
use http::StatusCode;
use identity::ClaimsError;

use crate::transport::TransportError;

/// Everything that can stop a request from reaching the API server.
///
/// Response bodies are deliberately generic; details stay in the logs.
#[derive(Debug, thiserror::Error)]
pub(crate) enum ProxyError {
    #[error("request carried no verified identity")]
    MissingIdentity,

    #[error(transparent)]
    Claims(#[from] ClaimsError),

    #[error("request carried an impersonation header `{0}`")]
    ImpersonationHeader(String),

    #[error("user resolved to {count} groups, limit is {limit}")]
    TooManyGroups { count: usize, limit: usize },

    #[error("`{0}` is not a legal header value")]
    InvalidHeader(String),

    #[error(transparent)]
    Directory(#[from] GraphError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Upstream(#[from] TransportError),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ProxyError::Claims(ClaimsError::TenantMismatch) => {
                log::warn!("rejecting request: {self}");
                (StatusCode::UNAUTHORIZED, "Unauthorized")
            }
            ProxyError::ImpersonationHeader(_) => {
                log::warn!("rejecting request: {self}");
                (StatusCode::FORBIDDEN, "User unauthorized")
            }
            ProxyError::TooManyGroups { .. } => {
                log::warn!("rejecting request: {self}");
                (StatusCode::FORBIDDEN, "Too many groups")
            }
            ProxyError::Directory(_) => {
                log::error!("failed to resolve the user: {self}");
                (StatusCode::FORBIDDEN, "Unable to get user")
            }
            ProxyError::MissingIdentity | ProxyError::Claims(ClaimsError::MissingClaim(_)) => {
                log::error!("failed to establish identity: {self}");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
            ProxyError::InvalidHeader(_) | ProxyError::Cache(_) | ProxyError::Upstream(_) => {
                log::error!("failed to proxy request: {self}");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        };

        (status, body).into_response()
    }
}
