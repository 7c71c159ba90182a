use std::str::FromStr;

use config::AzureConfig;
use http::{header::AUTHORIZATION, request::Parts};
use identity::AzureClaims;
use jwt_compact::{Algorithm, AlgorithmExt, TimeOptions, UntrustedToken, jwk::JsonWebKey};
use serde_json::Value;

use super::AuthResult;
use super::error::AuthError;
use super::jwks::{Alg, Jwks, JwksCache};

const BEARER_TOKEN_LENGTH: usize = 6;

/// Claims inspected during validation. The flattened remainder is what the
/// pipeline consumes once the token is trusted.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub(super) struct TokenClaims {
    #[serde(default)]
    iss: Option<String>,
    #[serde(default)]
    aud: Option<Value>,
    #[serde(flatten)]
    azure: AzureClaims,
}

impl TokenClaims {
    fn has_audience(&self, expected: &str) -> bool {
        match &self.aud {
            Some(Value::String(aud)) => aud == expected,
            Some(Value::Array(auds)) => auds.iter().any(|aud| aud.as_str() == Some(expected)),
            _ => false,
        }
    }
}

pub struct JwtAuth {
    expected_issuer: String,
    expected_audience: String,
    jwks_cache: JwksCache,
}

impl JwtAuth {
    pub fn new(azure: &AzureConfig) -> Self {
        JwtAuth {
            expected_issuer: format!("https://login.microsoftonline.com/{}/v2.0", azure.tenant_id),
            expected_audience: azure.client_id.clone(),
            jwks_cache: JwksCache::new(&azure.tenant_id),
        }
    }

    pub async fn authenticate(&self, parts: &Parts) -> AuthResult<AzureClaims> {
        let token_header = parts
            .headers
            .get(AUTHORIZATION)
            .ok_or(AuthError::InvalidToken("missing token"))?;

        let token_str = token_header
            .to_str()
            .map_err(|_| AuthError::InvalidToken("invalid token"))?;

        // RFC 7235: the authentication scheme is case-insensitive
        if token_str.len() > BEARER_TOKEN_LENGTH
            && token_str[..BEARER_TOKEN_LENGTH].eq_ignore_ascii_case("bearer")
            && token_str.chars().nth(BEARER_TOKEN_LENGTH) == Some(' ')
        {
            let token_str = &token_str[BEARER_TOKEN_LENGTH + 1..];

            if token_str.is_empty() {
                return Err(AuthError::InvalidToken("missing token"));
            }

            let token = UntrustedToken::new(token_str).map_err(|_| AuthError::InvalidToken("invalid token"))?;
            let jwks = self.jwks_cache.get().await.map_err(|error| {
                log::error!("failed to fetch the Azure AD signing keys: {error}");
                AuthError::KeySetUnavailable
            })?;

            let validated = self.validate_token(&jwks, token).ok_or(AuthError::Unauthorized)?;

            Ok(validated.claims().custom.azure.clone())
        } else if token_str.eq_ignore_ascii_case("bearer") {
            Err(AuthError::InvalidToken("missing token"))
        } else {
            Err(AuthError::InvalidToken("token must be prefixed with Bearer"))
        }
    }

    fn validate_token(
        &self,
        jwks: &Jwks<'_>,
        untrusted_token: UntrustedToken<'_>,
    ) -> Option<jwt_compact::Token<TokenClaims>> {
        use jwt_compact::alg::*;

        let time_options = TimeOptions::default();
        let mut validation_results = Vec::new();

        // Collect all potential validation results to prevent timing attacks
        for jwk in &jwks.keys {
            let kid_matches = match (&untrusted_token.header().key_id, &jwk.key_id) {
                (Some(expected), Some(kid)) => expected == kid,
                (Some(_), None) => false,
                (None, _) => true,
            };

            if let Ok(alg) = Alg::from_str(untrusted_token.algorithm()) {
                let decode_result = match alg {
                    Alg::RS256 => decode(Rsa::rs256(), &jwk.key, &untrusted_token),
                    Alg::RS384 => decode(Rsa::rs384(), &jwk.key, &untrusted_token),
                    Alg::RS512 => decode(Rsa::rs512(), &jwk.key, &untrusted_token),
                    Alg::PS256 => decode(Rsa::ps256(), &jwk.key, &untrusted_token),
                    Alg::PS384 => decode(Rsa::ps384(), &jwk.key, &untrusted_token),
                    Alg::PS512 => decode(Rsa::ps512(), &jwk.key, &untrusted_token),
                };

                if let Some(token) = decode_result {
                    let claims = token.claims();

                    let time_valid = claims.validate_expiration(&time_options).is_ok()
                        && (claims.not_before.is_none() || claims.validate_maturity(&time_options).is_ok());

                    let issuer_valid = claims.custom.iss.as_deref() == Some(self.expected_issuer.as_str());
                    let audience_valid = claims.custom.has_audience(&self.expected_audience);

                    validation_results.push((kid_matches, time_valid, issuer_valid, audience_valid, token));
                }
            }
        }

        validation_results
            .into_iter()
            .find(|(kid_matches, time_valid, issuer_valid, audience_valid, _)| {
                *kid_matches && *time_valid && *issuer_valid && *audience_valid
            })
            .map(|(_, _, _, _, token)| token)
    }
}

fn decode<A: Algorithm>(
    alg: A,
    jwk: &JsonWebKey<'_>,
    untrusted_token: &UntrustedToken<'_>,
) -> Option<jwt_compact::Token<TokenClaims>>
where
    A::VerifyingKey: std::fmt::Debug + for<'a> TryFrom<&'a JsonWebKey<'a>>,
{
    let key = A::VerifyingKey::try_from(jwk).ok()?;
    alg.validator(&key).validate(untrusted_token).ok()
}
