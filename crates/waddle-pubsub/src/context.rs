//! State shared by the engine and the cluster task executor.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use crate::cluster::{ClusterTask, TaskExecutor, TaskOutcome};
use crate::config::PubSubConfig;
use crate::error::PubSubError;
use crate::node::Node;
use crate::persistence::{NodeKey, PersistenceGateway, PubSubStore};
use crate::presence::PresenceTracker;
use crate::registry::ServiceRegistry;
use crate::router::NotificationRouter;
use crate::service::{PubSubService, ServiceId};

/// Services, persistence and presence of one member.
pub struct EngineContext {
    /// Engine configuration.
    pub config: PubSubConfig,
    /// Live services.
    pub registry: ServiceRegistry,
    /// Write-behind persistence.
    pub gateway: Arc<PersistenceGateway>,
    /// Presence subsystem.
    pub presence: Arc<dyn PresenceTracker>,
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("gateway", &self.gateway)
            .finish()
    }
}

impl EngineContext {
    /// Wire a context together.
    pub fn new(
        config: PubSubConfig,
        store: Arc<dyn PubSubStore>,
        router: Arc<dyn NotificationRouter>,
        presence: Arc<dyn PresenceTracker>,
    ) -> Self {
        let gateway = Arc::new(PersistenceGateway::new(store, &config));
        let registry = ServiceRegistry::new(&config, router, Arc::clone(&presence));
        Self {
            config,
            registry,
            gateway,
            presence,
        }
    }

    /// Resolve a service, creating and loading a personal one on first use.
    pub async fn service(&self, id: &ServiceId) -> Result<Arc<PubSubService>, PubSubError> {
        let (service, created) = self.registry.get_or_create(id);
        if created {
            self.load_service_nodes(&service).await?;
        }
        service.touch();
        Ok(service)
    }

    /// Load every stored node of a service into its cache.
    #[instrument(skip(self, service), fields(service = %service.id()))]
    pub async fn load_service_nodes(&self, service: &PubSubService) -> Result<usize, PubSubError> {
        let snapshots = self.gateway.load_nodes(&service.id().to_string()).await?;
        let mut loaded = 0;
        for snapshot in snapshots {
            let node_id = snapshot.node.node_id.clone();
            match Node::from_snapshot(snapshot) {
                Ok(node) => {
                    service.install_node(Arc::new(node));
                    loaded += 1;
                }
                Err(e) => warn!(node = %node_id, error = %e, "Skipping corrupt stored node"),
            }
        }
        debug!(loaded, "Loaded pubsub nodes");
        Ok(loaded)
    }

    /// Cached node, or the stored one loaded into the cache.
    pub async fn find_node(
        &self,
        service: &PubSubService,
        node_id: &str,
    ) -> Result<Option<Arc<Node>>, PubSubError> {
        if let Some(node) = service.get_node(node_id) {
            return Ok(Some(node));
        }

        let key = NodeKey::new(service.id().to_string(), node_id);
        let Some(snapshot) = self.gateway.load_node(&key).await? else {
            return Ok(None);
        };
        let loaded = Arc::new(Node::from_snapshot(snapshot)?);

        // Another request may have loaded or created it meanwhile.
        let node = service.install_if_absent(loaded);
        debug!(service = %service.id(), node = %node_id, "Loaded node on cache miss");
        Ok(Some(node))
    }

    /// Like [`find_node`](Self::find_node), failing with `NodeNotFound`.
    pub async fn node(
        &self,
        service: &PubSubService,
        node_id: &str,
    ) -> Result<Arc<Node>, PubSubError> {
        self.find_node(service, node_id)
            .await?
            .ok_or_else(|| PubSubError::NodeNotFound(node_id.to_string()))
    }

    /// Flush and drop personal services idle for longer than the configured
    /// timeout. A service whose flush fails stays cached.
    pub async fn evict_idle_services(&self) -> usize {
        let idle = self.config.personal_service_idle_timeout;
        let mut evicted = 0;
        for owner in self.registry.idle_personal_services(idle) {
            let service_id = ServiceId::Personal(owner.clone()).to_string();
            if let Err(e) = self.gateway.flush_service(&service_id).await {
                warn!(owner = %owner, error = %e, "Not evicting service with unflushed changes");
                continue;
            }
            if self.registry.evict_if_idle(&owner, idle) {
                evicted += 1;
            }
        }
        evicted
    }
}

#[async_trait]
impl TaskExecutor for EngineContext {
    async fn execute(&self, task: ClusterTask) -> TaskOutcome {
        task.run(self).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use jid::BareJid;

    use super::*;
    use crate::node::NodeConfig;
    use crate::persistence::InMemoryPubSubStore;
    use crate::presence::InMemoryPresence;
    use crate::router::ChannelRouter;

    fn context(config: PubSubConfig) -> (EngineContext, Arc<InMemoryPubSubStore>) {
        let store = Arc::new(InMemoryPubSubStore::new());
        let (router, _rx) = ChannelRouter::new(16);
        let ctx = EngineContext::new(
            config,
            store.clone(),
            Arc::new(router),
            Arc::new(InMemoryPresence::new()),
        );
        (ctx, store)
    }

    fn owner() -> BareJid {
        "juliet@capulet.lit".parse().expect("valid jid")
    }

    fn leaf(service: ServiceId, id: &str) -> Node {
        Node::new_leaf(
            service,
            id,
            "juliet@capulet.lit".parse().expect("valid jid"),
            NodeConfig::pep_default(),
        )
    }

    #[tokio::test]
    async fn test_cache_miss_loads_from_store() {
        let (ctx, _store) = context(PubSubConfig::default());
        ctx.gateway.create_node(leaf(ServiceId::Shared, "news").to_stored());

        let shared = ctx.registry.shared();
        assert!(shared.get_node("news").is_none());
        let node = ctx.node(&shared, "news").await.expect("load");
        assert_eq!(node.id(), "news");
        assert!(shared.get_node("news").is_some());

        assert!(matches!(
            ctx.node(&shared, "missing").await,
            Err(PubSubError::NodeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_personal_service_is_loaded_on_creation() {
        let (ctx, _store) = context(PubSubConfig::default());
        let id = ServiceId::Personal(owner());
        ctx.gateway.create_node(leaf(id.clone(), "mood").to_stored());

        let service = ctx.service(&id).await.expect("service");
        assert!(service.get_node("mood").is_some());
    }

    #[tokio::test]
    async fn test_eviction_flushes_first() {
        let config = PubSubConfig {
            personal_service_idle_timeout: Duration::ZERO,
            ..PubSubConfig::default()
        };
        let (ctx, store) = context(config);
        let id = ServiceId::Personal(owner());
        let service = ctx.service(&id).await.expect("service");
        let node = leaf(id.clone(), "mood");
        ctx.gateway.create_node(node.to_stored());
        service.create_node(node);

        assert_eq!(ctx.evict_idle_services().await, 1);
        assert!(ctx.registry.resolve(&id).is_none());
        assert!(store.contains_node(&NodeKey::new("juliet@capulet.lit", "mood")));

        let service = ctx.service(&id).await.expect("service");
        assert!(service.get_node("mood").is_some());
    }
}
