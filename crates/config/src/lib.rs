//! azad-kube-proxy configuration structures to map the TOML configuration.

#![deny(missing_docs)]

mod cors;
mod loader;

use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    path::{Path, PathBuf},
    time::Duration,
};

pub use cors::*;
use duration_str::deserialize_duration;
use secrecy::SecretString;
use serde::Deserialize;
use url::Url;

/// Main configuration structure for the proxy.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Proxy listener settings.
    #[serde(default)]
    pub server: ServerConfig,
    /// Metrics/health listener settings.
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Azure AD tenant, credentials and group resolution policy.
    pub azure: AzureConfig,
    /// Kubernetes API server connection settings.
    #[serde(default)]
    pub kubernetes: KubernetesConfig,
    /// Identity/group cache backend selection.
    #[serde(default)]
    pub cache: CacheConfig,
}

impl Config {
    /// Load and validate configuration from a file path.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
        loader::load(path)
    }

    /// Validates cross-field constraints that serde cannot express.
    pub fn validate(&self) -> anyhow::Result<()> {
        loader::validate(self)
    }
}

/// Proxy listener configuration.
#[derive(Default, Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// The socket address the proxy listener should bind to.
    pub listen_address: Option<SocketAddr>,
    /// TLS configuration for the proxy listener. Plaintext when absent.
    pub tls: Option<TlsServerConfig>,
    /// CORS policy applied to proxied routes.
    pub cors: Option<CorsConfig>,
}

/// TLS configuration for the proxy listener.
#[derive(Default, Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsServerConfig {
    /// Path to the TLS certificate PEM file.
    pub certificate: PathBuf,
    /// Path to the TLS private key PEM file.
    pub key: PathBuf,
}

/// Metrics/health listener configuration. Always plaintext, separate port.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MetricsConfig {
    /// The socket address the metrics listener should bind to.
    pub listen_address: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        MetricsConfig {
            listen_address: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 8081)),
        }
    }
}

/// Azure AD configuration: token validation, directory credentials and group
/// resolution policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AzureConfig {
    /// Azure AD tenant id tokens must be issued for.
    pub tenant_id: String,

    /// Application (client) id of the proxy; the expected token audience.
    pub client_id: String,

    /// Client secret for the client-credential flow. Required unless the
    /// managed-identity credential is selected.
    pub client_secret: Option<SecretString>,

    /// How the proxy authenticates to the directory for group lookups.
    #[serde(default)]
    pub credential: CredentialKind,

    /// Interval between background group syncs. User cache entries live for
    /// twice this duration.
    #[serde(default = "default_group_sync_interval", deserialize_with = "deserialize_duration")]
    pub group_sync_interval: Duration,

    /// Optional display-name prefix limiting which groups are synced.
    pub group_filter_prefix: Option<String>,

    /// Requests resolving to this many groups or more are rejected.
    #[serde(default = "default_max_group_count")]
    pub max_group_count: usize,

    /// Whether `Impersonate-Group` carries group names or object ids.
    #[serde(default)]
    pub group_identifier: GroupIdentifier,
}

fn default_group_sync_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_max_group_count() -> usize {
    50
}

/// Credential flow used for directory (Microsoft Graph) access.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    /// OAuth2 client credentials with `client_secret`.
    #[default]
    ClientSecret,
    /// Azure managed identity via the instance metadata service.
    ManagedIdentity,
}

/// Value sent in `Impersonate-Group` headers.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GroupIdentifier {
    /// The group display name.
    #[default]
    Name,
    /// The group object id.
    ObjectId,
}

/// Kubernetes API server connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KubernetesConfig {
    /// Base URL of the Kubernetes API server.
    pub host: Url,
    /// Path to the service-account token file, read once at startup.
    pub token_path: PathBuf,
    /// Path to the CA bundle used to verify the API server certificate.
    pub ca_path: Option<PathBuf>,
    /// Disable API server certificate verification.
    pub insecure_skip_verify: bool,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        KubernetesConfig {
            host: Url::parse("https://kubernetes.default.svc").expect("static URL is valid"),
            token_path: PathBuf::from("/var/run/secrets/kubernetes.io/serviceaccount/token"),
            ca_path: Some(PathBuf::from(
                "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt",
            )),
            insecure_skip_verify: false,
        }
    }
}

/// Identity/group cache backend selection.
#[derive(Default, Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Which backend stores user and group records.
    pub backend: CacheBackendKind,
    /// Connection string for the redis backend, e.g. `redis://127.0.0.1/0`.
    pub url: Option<String>,
}

/// Available cache backends.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    /// In-process store with per-entry TTL.
    #[default]
    Memory,
    /// External redis store.
    Redis,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use indoc::indoc;

    use crate::{CacheBackendKind, Config, CredentialKind, GroupIdentifier};

    fn minimal() -> &'static str {
        indoc! {r#"
            [azure]
            tenant_id = "1f0c2779-2a83-4a70-9d0f-7e55e1a36502"
            client_id = "e9c847f5-8c31-4fa2-b99d-2f1f0e6f3a11"
            client_secret = "super-secret"
        "#}
    }

    #[test]
    fn minimal_config_defaults() {
        let config: Config = toml::from_str(minimal()).unwrap();

        insta::assert_debug_snapshot!(&config, @r#"
        Config {
            server: ServerConfig {
                listen_address: None,
                tls: None,
                cors: None,
            },
            metrics: MetricsConfig {
                listen_address: 0.0.0.0:8081,
            },
            azure: AzureConfig {
                tenant_id: "1f0c2779-2a83-4a70-9d0f-7e55e1a36502",
                client_id: "e9c847f5-8c31-4fa2-b99d-2f1f0e6f3a11",
                client_secret: Some(
                    SecretBox<str>([REDACTED]),
                ),
                credential: ClientSecret,
                group_sync_interval: 300s,
                group_filter_prefix: None,
                max_group_count: 50,
                group_identifier: Name,
            },
            kubernetes: KubernetesConfig {
                host: Url {
                    scheme: "https",
                    cannot_be_a_base: false,
                    username: "",
                    password: None,
                    host: Some(
                        Domain(
                            "kubernetes.default.svc",
                        ),
                    ),
                    port: None,
                    path: "/",
                    query: None,
                    fragment: None,
                },
                token_path: "/var/run/secrets/kubernetes.io/serviceaccount/token",
                ca_path: Some(
                    "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt",
                ),
                insecure_skip_verify: false,
            },
            cache: CacheConfig {
                backend: Memory,
                url: None,
            },
        }
        "#);
    }

    #[test]
    fn group_sync_interval_parses_duration_strings() {
        let input = indoc! {r#"
            [azure]
            tenant_id = "t"
            client_id = "c"
            group_sync_interval = "90s"
        "#};

        let config: Config = toml::from_str(input).unwrap();

        assert_eq!(config.azure.group_sync_interval, Duration::from_secs(90));
    }

    #[test]
    fn group_identifier_object_id() {
        let input = indoc! {r#"
            [azure]
            tenant_id = "t"
            client_id = "c"
            group_identifier = "OBJECTID"
        "#};

        let config: Config = toml::from_str(input).unwrap();

        assert_eq!(config.azure.group_identifier, GroupIdentifier::ObjectId);
    }

    #[test]
    fn managed_identity_credential() {
        let input = indoc! {r#"
            [azure]
            tenant_id = "t"
            client_id = "c"
            credential = "managed_identity"
        "#};

        let config: Config = toml::from_str(input).unwrap();

        assert_eq!(config.azure.credential, CredentialKind::ManagedIdentity);
    }

    #[test]
    fn redis_cache_backend() {
        let input = indoc! {r#"
            [azure]
            tenant_id = "t"
            client_id = "c"
            client_secret = "s"

            [cache]
            backend = "redis"
            url = "redis://127.0.0.1/0"
        "#};

        let config: Config = toml::from_str(input).unwrap();

        assert_eq!(config.cache.backend, CacheBackendKind::Redis);
        assert_eq!(config.cache.url.as_deref(), Some("redis://127.0.0.1/0"));
        config.validate().unwrap();
    }

    #[test]
    fn redis_backend_without_url_fails_validation() {
        let input = indoc! {r#"
            [azure]
            tenant_id = "t"
            client_id = "c"
            client_secret = "s"

            [cache]
            backend = "redis"
        "#};

        let config: Config = toml::from_str(input).unwrap();
        let error = config.validate().unwrap_err();

        insta::assert_snapshot!(error.to_string(), @"cache backend is `redis` but no cache.url is configured");
    }

    #[test]
    fn client_secret_credential_requires_secret() {
        let input = indoc! {r#"
            [azure]
            tenant_id = "t"
            client_id = "c"
        "#};

        let config: Config = toml::from_str(input).unwrap();
        let error = config.validate().unwrap_err();

        insta::assert_snapshot!(error.to_string(), @"azure.credential is `client_secret` but no azure.client_secret is configured");
    }

    #[test]
    fn max_group_count_of_zero_fails_validation() {
        let input = indoc! {r#"
            [azure]
            tenant_id = "t"
            client_id = "c"
            client_secret = "s"
            max_group_count = 0
        "#};

        let config: Config = toml::from_str(input).unwrap();
        let error = config.validate().unwrap_err();

        insta::assert_snapshot!(error.to_string(), @"azure.max_group_count must be at least 1");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let input = indoc! {r#"
            [azure]
            tenant_id = "t"
            client_id = "c"
            no_such_field = true
        "#};

        let result: Result<Config, _> = toml::from_str(input);

        assert!(result.is_err());
    }

    #[test]
    fn tls_and_cors() {
        let input = indoc! {r#"
            [server]
            listen_address = "0.0.0.0:8080"

            [server.tls]
            certificate = "/etc/proxy/tls.crt"
            key = "/etc/proxy/tls.key"

            [server.cors]
            allow_origins = ["https://portal.example.com"]
            allow_credentials = true
            max_age = "60s"

            [azure]
            tenant_id = "t"
            client_id = "c"
            client_secret = "s"
        "#};

        let config: Config = toml::from_str(input).unwrap();
        let cors = config.server.cors.unwrap();

        assert!(cors.allow_credentials);
        assert_eq!(cors.max_age, Some(Duration::from_secs(60)));
        assert_eq!(
            config.server.tls.unwrap().certificate.to_str(),
            Some("/etc/proxy/tls.crt")
        );
    }
}
