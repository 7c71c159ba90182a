use std::{sync::Arc, time::Duration};

use cache::CacheBackend;
use identity::Group;
use tokio_util::sync::CancellationToken;

use crate::{GraphClient, GraphError};

/// Directory group listing, behind a trait so the sync loop can run against
/// a fake directory in tests.
#[async_trait::async_trait]
pub trait GroupLister: Send + Sync {
    /// Lists all directory groups, optionally restricted to display names
    /// starting with `filter_prefix`.
    async fn list_groups(&self, filter_prefix: Option<&str>) -> Result<Vec<Group>, GraphError>;
}

#[async_trait::async_trait]
impl GroupLister for GraphClient {
    async fn list_groups(&self, filter_prefix: Option<&str>) -> Result<Vec<Group>, GraphError> {
        self.fetch_all_groups(filter_prefix).await
    }
}

/// Why a sync pass was started. Only affects logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncReason {
    /// The first pass during startup. A failure here is fatal.
    Initial,
    /// A periodic pass from the background ticker.
    Ticker,
}

impl std::fmt::Display for SyncReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncReason::Initial => f.write_str("initial"),
            SyncReason::Ticker => f.write_str("ticker"),
        }
    }
}

/// Periodically copies directory groups into the cache.
///
/// The request path never lists groups itself; it resolves membership ids
/// against whatever the last sync pass stored.
pub struct GroupSyncer {
    lister: Arc<dyn GroupLister>,
    cache: Arc<dyn CacheBackend>,
    interval: Duration,
    filter_prefix: Option<String>,
}

impl GroupSyncer {
    /// Creates a syncer refreshing every `interval`.
    pub fn new(
        lister: Arc<dyn GroupLister>,
        cache: Arc<dyn CacheBackend>,
        interval: Duration,
        filter_prefix: Option<String>,
    ) -> Self {
        Self {
            lister,
            cache,
            interval,
            filter_prefix,
        }
    }

    /// Runs one sync pass, overwriting every group record it lists.
    pub async fn sync(&self, reason: SyncReason) -> Result<usize, GraphError> {
        let result = self.sync_inner().await;

        match &result {
            Ok(count) => {
                log::info!("group sync ({reason}) stored {count} groups");

                metrics::counter!("azad_proxy_group_sync_total", "result" => "success").increment(1);
                metrics::gauge!("azad_proxy_synced_groups").set(*count as f64);
            }
            Err(error) => {
                log::error!("group sync ({reason}) failed: {error}");

                metrics::counter!("azad_proxy_group_sync_total", "result" => "error").increment(1);
            }
        }

        result
    }

    async fn sync_inner(&self) -> Result<usize, GraphError> {
        let groups = self.lister.list_groups(self.filter_prefix.as_deref()).await?;
        let count = groups.len();

        for group in groups {
            self.cache.set_group(&group.object_id, &group).await?;
        }

        Ok(count)
    }

    /// Runs the periodic sync loop until `cancel` fires.
    ///
    /// The first tick is skipped; the caller performs the initial sync before
    /// spawning this loop. Ticker failures are logged and the loop keeps
    /// going, an in-flight pass completes before shutdown is honored.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::debug!("group sync loop stopping");
                    break;
                }
                _ = ticker.tick() => {
                    // Errors are already logged in sync(); a transient
                    // directory outage must not kill the loop.
                    let _ = self.sync(SyncReason::Ticker).await;
                }
            }
        }
    }
}
