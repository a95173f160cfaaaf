//! Durable storage for pubsub state.
//!
//! The engine never talks to a store directly: every write goes through the
//! [`PersistenceGateway`], which batches operations and flushes them to a
//! [`PubSubStore`] implementation.

mod gateway;
mod libsql_store;
mod memory;

pub use gateway::PersistenceGateway;
pub use libsql_store::LibSqlPubSubStore;
pub use memory::InMemoryPubSubStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jid::BareJid;

use crate::affiliation::NodeAffiliate;
use crate::error::PersistenceError;
use crate::node::{CollectionSettings, NodeConfig, NodeType};
use crate::subscription::NodeSubscription;

/// Identifies a node across services.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey {
    /// Service ID (`pubsub` or a bare JID).
    pub service_id: String,
    /// Node ID.
    pub node_id: String,
}

impl NodeKey {
    /// Create a key.
    pub fn new(service_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            node_id: node_id.into(),
        }
    }
}

impl std::fmt::Display for NodeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.service_id, self.node_id)
    }
}

/// Stored node row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredNode {
    /// Owning service.
    pub service_id: String,
    /// Node ID.
    pub node_id: String,
    /// Leaf or collection.
    pub node_type: NodeType,
    /// Parent collection.
    pub parent: Option<String>,
    /// Creator JID.
    pub creator: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub modified_at: DateTime<Utc>,
    /// Node configuration.
    pub config: NodeConfig,
    /// Collection settings, for collections.
    pub collection: Option<CollectionSettings>,
}

impl StoredNode {
    /// Key of this node.
    pub fn key(&self) -> NodeKey {
        NodeKey::new(self.service_id.clone(), self.node_id.clone())
    }
}

/// Stored item row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredItem {
    /// Owning service.
    pub service_id: String,
    /// Node ID.
    pub node_id: String,
    /// Item ID.
    pub item_id: String,
    /// Publisher JID.
    pub publisher: String,
    /// Serialized payload.
    pub payload: Option<String>,
    /// Publication time.
    pub published_at: DateTime<Utc>,
}

impl StoredItem {
    /// Key of the owning node.
    pub fn key(&self) -> NodeKey {
        NodeKey::new(self.service_id.clone(), self.node_id.clone())
    }
}

/// Everything stored about one node.
#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    /// Node row.
    pub node: StoredNode,
    /// Affiliations.
    pub affiliations: Vec<NodeAffiliate>,
    /// Subscriptions.
    pub subscriptions: Vec<NodeSubscription>,
    /// Items, oldest first.
    pub items: Vec<StoredItem>,
}

/// Durable store for pubsub state.
///
/// Writes are upserts and removals of absent rows succeed, so replaying a
/// batch is harmless.
#[async_trait]
pub trait PubSubStore: Send + Sync {
    /// Insert or update a node row.
    async fn save_node(&self, node: &StoredNode) -> Result<(), PersistenceError>;

    /// Remove a node with its affiliations, subscriptions and items.
    async fn remove_node(&self, key: &NodeKey) -> Result<(), PersistenceError>;

    /// Load one node with everything attached to it.
    async fn load_node(&self, key: &NodeKey) -> Result<Option<NodeSnapshot>, PersistenceError>;

    /// Load every node of a service.
    async fn load_nodes(&self, service_id: &str) -> Result<Vec<NodeSnapshot>, PersistenceError>;

    /// Insert or update an affiliation.
    async fn save_affiliation(
        &self,
        key: &NodeKey,
        affiliate: &NodeAffiliate,
    ) -> Result<(), PersistenceError>;

    /// Remove an affiliation.
    async fn remove_affiliation(&self, key: &NodeKey, jid: &BareJid)
        -> Result<(), PersistenceError>;

    /// Insert or update a subscription.
    async fn save_subscription(
        &self,
        key: &NodeKey,
        subscription: &NodeSubscription,
    ) -> Result<(), PersistenceError>;

    /// Remove a subscription.
    async fn remove_subscription(
        &self,
        key: &NodeKey,
        subscription_id: &str,
    ) -> Result<(), PersistenceError>;

    /// Load one subscription.
    async fn load_subscription(
        &self,
        key: &NodeKey,
        subscription_id: &str,
    ) -> Result<Option<NodeSubscription>, PersistenceError>;

    /// Insert or replace an item; a replaced item becomes the newest.
    async fn save_item(&self, item: &StoredItem) -> Result<(), PersistenceError>;

    /// Remove an item.
    async fn remove_item(&self, key: &NodeKey, item_id: &str) -> Result<(), PersistenceError>;

    /// Items of a node, oldest first.
    async fn load_items(&self, key: &NodeKey) -> Result<Vec<StoredItem>, PersistenceError>;

    /// Remove every item of a node.
    async fn purge_items(&self, key: &NodeKey) -> Result<(), PersistenceError>;
}
