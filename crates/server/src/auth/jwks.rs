use std::{
    borrow::Cow,
    str::FromStr,
    time::{Duration, Instant},
};

use jwt_compact::jwk::JsonWebKey;
use tokio::sync::{Mutex, RwLock};

/// How long a fetched key set is trusted before it is re-fetched. Azure AD
/// rotates signing keys without notice.
const KEY_SET_TTL: Duration = Duration::from_secs(60 * 60);

pub struct JwksCache {
    url: String,
    jwks: RwLock<Option<(Jwks<'static>, Instant)>>,
    refresh_lock: Mutex<()>,
    client: reqwest::Client,
}

impl JwksCache {
    pub fn new(tenant_id: &str) -> Self {
        Self {
            url: format!("https://login.microsoftonline.com/{tenant_id}/discovery/v2.0/keys"),
            jwks: RwLock::new(None),
            refresh_lock: Mutex::new(()),
            client: reqwest::Client::new(),
        }
    }

    pub async fn get(&self) -> anyhow::Result<Jwks<'static>> {
        if let Some((jwks, cached_at)) = self.jwks.read().await.as_ref()
            && cached_at.elapsed() < KEY_SET_TTL
        {
            return Ok(jwks.clone());
        }

        let _refresh_guard = self.refresh_lock.lock().await;

        // Double-check: another task might have refreshed while we were waiting
        if let Some((jwks, cached_at)) = self.jwks.read().await.as_ref()
            && cached_at.elapsed() < KEY_SET_TTL
        {
            return Ok(jwks.clone());
        }

        let jwks: Jwks<'static> = self.client.get(&self.url).send().await?.json().await?;

        {
            let mut cache = self.jwks.write().await;
            *cache = Some((jwks.clone(), Instant::now()));
        }

        Ok(jwks)
    }
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct Jwks<'a> {
    pub keys: Vec<Jwk<'a>>,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct Jwk<'a> {
    #[serde(flatten)]
    pub key: JsonWebKey<'a>,
    #[serde(rename = "kid")]
    pub key_id: Option<Cow<'a, str>>,
}

/// Signing algorithms Azure AD actually issues tokens with.
#[derive(Debug, Clone, Copy)]
pub enum Alg {
    RS256,
    RS384,
    RS512,
    PS256,
    PS384,
    PS512,
}

impl FromStr for Alg {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RS256" => Ok(Alg::RS256),
            "RS384" => Ok(Alg::RS384),
            "RS512" => Ok(Alg::RS512),
            "PS256" => Ok(Alg::PS256),
            "PS384" => Ok(Alg::PS384),
            "PS512" => Ok(Alg::PS512),
            _ => Err(anyhow::Error::msg(format!("Unsupported algorithm: {s}"))),
        }
    }
}
