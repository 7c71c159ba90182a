#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Token validation failed")]
    Unauthorized,
    #[error("Key set unavailable")]
    KeySetUnavailable,
    #[error("Invalid token: {0}")]
    InvalidToken(&'static str),
}
