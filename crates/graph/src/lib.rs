//! Microsoft Graph client used for group membership lookups and the
//! background group sync.

#![deny(missing_docs)]

mod sync;
mod token;

use cache::{CacheBackend, CacheError};
use config::AzureConfig;
use identity::{Group, UserType};

pub use sync::{GroupLister, GroupSyncer, SyncReason};
pub use token::TokenProvider;

const GRAPH_BASE_URL: &str = "https://graph.microsoft.com/v1.0";

/// Errors from directory lookups.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// The proxy's own directory credential could not be exercised.
    #[error("directory credential error: {0}")]
    Credential(String),

    /// Transport-level failure talking to the directory.
    #[error("directory request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The directory answered with a non-success status.
    #[error("directory responded with status {status}: {message}")]
    Api {
        /// HTTP status returned by the directory.
        status: u16,
        /// Response body, truncated by the caller when logged.
        message: String,
    },

    /// Reading or writing group records failed.
    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Client for the Microsoft Graph directory API.
pub struct GraphClient {
    client: reqwest::Client,
    tokens: TokenProvider,
}

impl GraphClient {
    /// Creates a client authenticating with the configured directory
    /// credential.
    pub fn new(azure: &AzureConfig) -> Self {
        let client = reqwest::Client::new();
        let tokens = TokenProvider::new(client.clone(), azure);

        Self { client, tokens }
    }

    /// The token provider backing this client. Exposed for the liveness
    /// probe.
    pub fn tokens(&self) -> &TokenProvider {
        &self.tokens
    }

    /// Returns the object ids of every group the principal is a transitive
    /// member of.
    pub async fn member_group_ids(&self, object_id: &str, user_type: UserType) -> Result<Vec<String>, GraphError> {
        let url = format!(
            "{GRAPH_BASE_URL}/{}/{object_id}/getMemberGroups",
            member_groups_segment(user_type)
        );

        let token = self.tokens.bearer().await?;

        let response = self
            .client
            .post(url)
            .bearer_auth(token)
            .json(&serde_json::json!({ "securityEnabledOnly": false }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        let page: ValuePage<String> = response.json().await?;

        Ok(page.value)
    }

    /// Resolves member group ids against the synced group records.
    ///
    /// Ids the sync has not seen are dropped silently; a group outside the
    /// configured filter must not grant access.
    pub async fn resolve_groups(
        &self,
        cache: &dyn CacheBackend,
        object_id: &str,
        user_type: UserType,
    ) -> Result<Vec<Group>, GraphError> {
        let ids = self.member_group_ids(object_id, user_type).await?;
        let mut groups = Vec::with_capacity(ids.len());

        for id in ids {
            if let Some(group) = cache.get_group(&id).await? {
                groups.push(group);
            }
        }

        Ok(groups)
    }

    /// Lists all directory groups, optionally restricted to display names
    /// starting with `filter_prefix`. Follows `@odata.nextLink` paging.
    pub(crate) async fn fetch_all_groups(&self, filter_prefix: Option<&str>) -> Result<Vec<Group>, GraphError> {
        let mut groups = Vec::new();
        let mut next = Some(groups_url(filter_prefix));

        while let Some(url) = next {
            let token = self.tokens.bearer().await?;
            let response = self.client.get(url).bearer_auth(token).send().await?;

            if !response.status().is_success() {
                return Err(api_error(response).await);
            }

            let page: GroupPage = response.json().await?;

            groups.extend(page.value.into_iter().map(|group| Group {
                name: group.display_name,
                object_id: group.id,
            }));

            next = page.next_link;
        }

        Ok(groups)
    }
}

fn groups_url(filter_prefix: Option<&str>) -> String {
    let mut url = format!("{GRAPH_BASE_URL}/groups?$select=id,displayName");

    if let Some(prefix) = filter_prefix {
        // OData string literals escape a single quote by doubling it
        let prefix = prefix.replace('\'', "''");
        url.push_str(&format!("&$filter=startswith(displayName,'{prefix}')"));
    }

    url
}

fn member_groups_segment(user_type: UserType) -> &'static str {
    match user_type {
        UserType::NormalUser => "users",
        UserType::ServicePrincipal => "servicePrincipals",
    }
}

async fn api_error(response: reqwest::Response) -> GraphError {
    let status = response.status().as_u16();
    let message = response.text().await.unwrap_or_default();

    GraphError::Api { status, message }
}

#[derive(serde::Deserialize)]
struct ValuePage<T> {
    value: Vec<T>,
}

#[derive(serde::Deserialize)]
struct GroupPage {
    value: Vec<DirectoryGroup>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(serde::Deserialize)]
struct DirectoryGroup {
    id: String,
    #[serde(rename = "displayName")]
    display_name: String,
}

#[cfg(test)]
mod tests {
    use cache::MemoryCache;

    use super::*;

    #[test]
    fn membership_endpoint_per_user_type() {
        assert_eq!(member_groups_segment(UserType::NormalUser), "users");
        assert_eq!(member_groups_segment(UserType::ServicePrincipal), "servicePrincipals");
    }

    #[test]
    fn groups_url_without_filter() {
        assert_eq!(
            groups_url(None),
            "https://graph.microsoft.com/v1.0/groups?$select=id,displayName"
        );
    }

    #[test]
    fn groups_url_escapes_quotes_in_the_filter_prefix() {
        let url = groups_url(Some("o'brien-"));

        assert!(url.ends_with("&$filter=startswith(displayName,'o''brien-')"));
    }

    #[test]
    fn group_page_parses_next_link() {
        let page: GroupPage = serde_json::from_str(
            r#"{
                "@odata.context": "https://graph.microsoft.com/v1.0/$metadata#groups(id,displayName)",
                "@odata.nextLink": "https://graph.microsoft.com/v1.0/groups?$skiptoken=abc",
                "value": [
                    {"id": "a7a3f9e1-93c0-4bcd-b9d7-30e087cbb1a2", "displayName": "aks-admins"}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(page.value.len(), 1);
        assert_eq!(page.value[0].display_name, "aks-admins");
        assert!(page.next_link.is_some());
    }

    #[test]
    fn member_ids_page_parses() {
        let page: ValuePage<String> = serde_json::from_str(
            r#"{"value": ["a7a3f9e1-93c0-4bcd-b9d7-30e087cbb1a2", "0b663a1e-79cc-4a44-ba4c-01c6d7df1ec9"]}"#,
        )
        .unwrap();

        assert_eq!(page.value.len(), 2);
    }

    #[tokio::test]
    async fn unknown_group_ids_are_dropped() {
        let cache = MemoryCache::new(std::time::Duration::from_secs(60));

        cache
            .set_group(
                "known",
                &Group {
                    name: "aks-admins".to_string(),
                    object_id: "known".to_string(),
                },
            )
            .await
            .unwrap();

        let mut groups = Vec::new();

        for id in ["known", "unknown"] {
            if let Some(group) = cache.get_group(id).await.unwrap() {
                groups.push(group);
            }
        }

        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].name, "aks-admins");
    }
}
