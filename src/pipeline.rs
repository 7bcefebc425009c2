use futures::FutureExt;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::filter::ServerListFilter;
use crate::registry::ServerRegistry;
use crate::server::Server;
use crate::server_list::ServerList;
use crate::updater::UpdateAction;

/// One update cycle: fetch, filter, swap the all-servers snapshot.
pub struct UpdatePipeline {
    name: String,
    server_list: Arc<dyn ServerList>,
    filter: Option<Arc<dyn ServerListFilter>>,
    registry: Arc<ServerRegistry>,
    failures: AtomicU64,
    cycles: AtomicU64,
}

impl UpdatePipeline {
    pub fn new(
        name: impl Into<String>,
        server_list: Arc<dyn ServerList>,
        filter: Option<Arc<dyn ServerListFilter>>,
        registry: Arc<ServerRegistry>,
    ) -> Self {
        Self {
            name: name.into(),
            server_list,
            filter,
            registry,
            failures: AtomicU64::new(0),
            cycles: AtomicU64::new(0),
        }
    }

    /// Loads the initial list. A failed fetch leaves the balancer empty until the next cycle.
    pub async fn run_initial(&self) -> bool {
        match self.server_list.initial_list_of_servers().await {
            Ok(servers) => {
                self.apply(servers);
                true
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!("[{}] Initial server list fetch failed: {}", self.name, e);
                false
            }
        }
    }

    pub async fn run_cycle(&self) -> bool {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        match self.server_list.updated_list_of_servers().await {
            Ok(servers) => {
                self.apply(servers);
                true
            }
            Err(e) => {
                let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    "[{}] Server list update failed, keeping previous list ({} failures so far): {}",
                    self.name, failures, e
                );
                false
            }
        }
    }

    fn apply(&self, servers: Vec<Server>) {
        let fetched = servers.len();
        let servers = match &self.filter {
            Some(filter) => filter.filtered_list_of_servers(servers),
            None => servers,
        };
        let previous = self.registry.all_servers().len();
        let snapshot = self.registry.replace_all(servers);
        let pruned = self
            .registry
            .stats()
            .prune(snapshot.iter().map(|s| s.id()));
        if previous != snapshot.len() {
            info!(
                "[{}] Server list changed: {} -> {} servers ({} fetched)",
                self.name,
                previous,
                snapshot.len(),
                fetched
            );
        } else {
            debug!("[{}] Server list refreshed: {} servers", self.name, snapshot.len());
        }
        if pruned > 0 {
            debug!("[{}] Reclaimed stats for {} departed servers", self.name, pruned);
        }
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Wraps [`run_cycle`](Self::run_cycle) for a [`ServerListUpdater`](crate::updater::ServerListUpdater).
    pub fn action(self: &Arc<Self>) -> UpdateAction {
        let pipeline = self.clone();
        Arc::new(move || {
            let pipeline = pipeline.clone();
            async move { pipeline.run_cycle().await }
            .boxed()
        })
    }
}
