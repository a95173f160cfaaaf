//! Service registry: the shared service and the cache of personal services.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use jid::BareJid;
use tracing::{debug, info, instrument};

use crate::config::PubSubConfig;
use crate::presence::PresenceTracker;
use crate::router::NotificationRouter;
use crate::service::{PubSubService, ServiceId};

/// Holds every live pubsub service of this member.
///
/// The shared service lives as long as the registry. Personal eventing
/// services are created on first use and evicted once idle; callers must
/// re-resolve a service by ID instead of keeping it.
pub struct ServiceRegistry {
    admins: Vec<BareJid>,
    router: Arc<dyn NotificationRouter>,
    presence: Arc<dyn PresenceTracker>,
    shared: Arc<PubSubService>,
    personal: DashMap<BareJid, Arc<PubSubService>>,
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("shared", &self.shared)
            .field("personal", &self.personal.len())
            .finish()
    }
}

impl ServiceRegistry {
    /// Create a registry with an empty shared service.
    pub fn new(
        config: &PubSubConfig,
        router: Arc<dyn NotificationRouter>,
        presence: Arc<dyn PresenceTracker>,
    ) -> Self {
        let shared = Arc::new(PubSubService::new(
            ServiceId::Shared,
            config.domain.clone(),
            config.admins.clone(),
            Arc::clone(&router),
            Arc::clone(&presence),
        ));
        Self {
            admins: config.admins.clone(),
            router,
            presence,
            shared,
            personal: DashMap::new(),
        }
    }

    /// The shared service.
    pub fn shared(&self) -> Arc<PubSubService> {
        Arc::clone(&self.shared)
    }

    /// Look up a service without creating it.
    pub fn resolve(&self, id: &ServiceId) -> Option<Arc<PubSubService>> {
        match id {
            ServiceId::Shared => Some(self.shared()),
            ServiceId::Personal(owner) => self
                .personal
                .get(owner)
                .map(|entry| Arc::clone(entry.value())),
        }
    }

    /// Look up a service, creating a personal one on first use.
    ///
    /// The flag is `true` when the service was just created and still needs
    /// its nodes loaded.
    pub fn get_or_create(&self, id: &ServiceId) -> (Arc<PubSubService>, bool) {
        let owner = match id {
            ServiceId::Shared => return (self.shared(), false),
            ServiceId::Personal(owner) => owner,
        };

        let mut created = false;
        let service = self
            .personal
            .entry(owner.clone())
            .or_insert_with(|| {
                created = true;
                Arc::new(PubSubService::new(
                    id.clone(),
                    owner.to_string(),
                    self.admins.clone(),
                    Arc::clone(&self.router),
                    Arc::clone(&self.presence),
                ))
            })
            .value()
            .clone();

        if created {
            debug!(owner = %owner, "Created personal eventing service");
        }
        (service, created)
    }

    /// Cached personal services.
    pub fn personal_services(&self) -> Vec<Arc<PubSubService>> {
        self.personal
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Owners of personal services not accessed for `idle`.
    pub fn idle_personal_services(&self, idle: Duration) -> Vec<BareJid> {
        let now = Instant::now();
        self.personal
            .iter()
            .filter(|entry| now.duration_since(entry.value().last_access()) >= idle)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Drop a personal service if it is still idle.
    #[instrument(skip(self), fields(owner = %owner))]
    pub fn evict_if_idle(&self, owner: &BareJid, idle: Duration) -> bool {
        let now = Instant::now();
        let evicted = self
            .personal
            .remove_if(owner, |_, service| {
                now.duration_since(service.last_access()) >= idle
            })
            .is_some();
        if evicted {
            info!("Evicted idle personal eventing service");
        }
        evicted
    }

    /// Drop a personal service unconditionally.
    pub fn remove(&self, owner: &BareJid) -> Option<Arc<PubSubService>> {
        self.personal.remove(owner).map(|(_, service)| service)
    }
}
