use std::{fs, path::Path};

use anyhow::{Context, bail};

use crate::{CacheBackendKind, Config, CredentialKind};

pub(crate) fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let path = path.as_ref();

    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read configuration from {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("failed to parse configuration from {}", path.display()))?;

    config.validate()?;

    Ok(config)
}

pub(crate) fn validate(config: &Config) -> anyhow::Result<()> {
    if config.cache.backend == CacheBackendKind::Redis && config.cache.url.is_none() {
        bail!("cache backend is `redis` but no cache.url is configured");
    }

    if config.azure.credential == CredentialKind::ClientSecret && config.azure.client_secret.is_none() {
        bail!("azure.credential is `client_secret` but no azure.client_secret is configured");
    }

    if config.azure.max_group_count < 1 {
        bail!("azure.max_group_count must be at least 1");
    }

    Ok(())
}
