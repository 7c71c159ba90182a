use cache::CacheBackend;
use graph::{GraphClient, GraphError};
use identity::{Group, TranslatedIdentity, User, UserType};
use std::sync::Arc;

/// Directory lookups the pipeline performs on a cache miss. Behind a trait so
/// pipeline tests run without a live directory.
#[async_trait::async_trait]
pub(crate) trait GroupDirectory: Send + Sync {
    async fn groups(&self, object_id: &str, user_type: UserType) -> Result<Vec<Group>, GraphError>;
}

/// The production directory: membership ids from Microsoft Graph, names from
/// the synced group records.
pub(crate) struct GraphDirectory {
    graph: Arc<GraphClient>,
    cache: Arc<dyn CacheBackend>,
}

impl GraphDirectory {
    pub(crate) fn new(graph: Arc<GraphClient>, cache: Arc<dyn CacheBackend>) -> Self {
        Self { graph, cache }
    }
}

#[async_trait::async_trait]
impl GroupDirectory for GraphDirectory {
    async fn groups(&self, object_id: &str, user_type: UserType) -> Result<Vec<Group>, GraphError> {
        self.graph.resolve_groups(self.cache.as_ref(), object_id, user_type).await
    }
}

/// Derives the impersonated username and user type from a translated
/// identity.
///
/// A principal without a human-readable username is a service principal and
/// is impersonated by its object id.
pub(crate) fn classify(identity: &TranslatedIdentity) -> (String, UserType) {
    if identity.username.is_empty() {
        (identity.object_id.clone(), UserType::ServicePrincipal)
    } else {
        (identity.username.clone(), UserType::NormalUser)
    }
}
