//! In-memory store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use jid::BareJid;

use crate::affiliation::NodeAffiliate;
use crate::error::PersistenceError;
use crate::subscription::NodeSubscription;

use super::{NodeKey, NodeSnapshot, PubSubStore, StoredItem, StoredNode};

/// `DashMap`-backed store for standalone use and tests.
///
/// Counts write calls and can be told to fail writes, which makes batching
/// and retry behavior observable.
#[derive(Debug, Default)]
pub struct InMemoryPubSubStore {
    nodes: DashMap<NodeKey, StoredNode>,
    affiliations: DashMap<NodeKey, HashMap<BareJid, NodeAffiliate>>,
    subscriptions: DashMap<NodeKey, HashMap<String, NodeSubscription>>,
    items: DashMap<NodeKey, Vec<StoredItem>>,
    writes: AtomicUsize,
    fail_writes: AtomicBool,
}

impl InMemoryPubSubStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of write calls that reached the store.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make every following write fail until switched off.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Whether a node row exists.
    pub fn contains_node(&self, key: &NodeKey) -> bool {
        self.nodes.contains_key(key)
    }

    fn write(&self) -> Result<(), PersistenceError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PersistenceError::Database("writes disabled".to_string()));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn snapshot(&self, node: StoredNode) -> NodeSnapshot {
        let key = node.key();
        NodeSnapshot {
            affiliations: self
                .affiliations
                .get(&key)
                .map(|entry| entry.values().cloned().collect())
                .unwrap_or_default(),
            subscriptions: self
                .subscriptions
                .get(&key)
                .map(|entry| entry.values().cloned().collect())
                .unwrap_or_default(),
            items: self
                .items
                .get(&key)
                .map(|entry| entry.clone())
                .unwrap_or_default(),
            node,
        }
    }
}

#[async_trait]
impl PubSubStore for InMemoryPubSubStore {
    async fn save_node(&self, node: &StoredNode) -> Result<(), PersistenceError> {
        self.write()?;
        self.nodes.insert(node.key(), node.clone());
        Ok(())
    }

    async fn remove_node(&self, key: &NodeKey) -> Result<(), PersistenceError> {
        self.write()?;
        self.nodes.remove(key);
        self.affiliations.remove(key);
        self.subscriptions.remove(key);
        self.items.remove(key);
        Ok(())
    }

    async fn load_node(&self, key: &NodeKey) -> Result<Option<NodeSnapshot>, PersistenceError> {
        let node = self.nodes.get(key).map(|entry| entry.clone());
        Ok(node.map(|node| self.snapshot(node)))
    }

    async fn load_nodes(&self, service_id: &str) -> Result<Vec<NodeSnapshot>, PersistenceError> {
        let nodes: Vec<StoredNode> = self
            .nodes
            .iter()
            .filter(|entry| entry.key().service_id == service_id)
            .map(|entry| entry.value().clone())
            .collect();
        Ok(nodes.into_iter().map(|node| self.snapshot(node)).collect())
    }

    async fn save_affiliation(
        &self,
        key: &NodeKey,
        affiliate: &NodeAffiliate,
    ) -> Result<(), PersistenceError> {
        self.write()?;
        self.affiliations
            .entry(key.clone())
            .or_default()
            .insert(affiliate.jid.clone(), affiliate.clone());
        Ok(())
    }

    async fn remove_affiliation(
        &self,
        key: &NodeKey,
        jid: &BareJid,
    ) -> Result<(), PersistenceError> {
        self.write()?;
        if let Some(mut entry) = self.affiliations.get_mut(key) {
            entry.remove(jid);
        }
        Ok(())
    }

    async fn save_subscription(
        &self,
        key: &NodeKey,
        subscription: &NodeSubscription,
    ) -> Result<(), PersistenceError> {
        self.write()?;
        self.subscriptions
            .entry(key.clone())
            .or_default()
            .insert(subscription.id.clone(), subscription.clone());
        Ok(())
    }

    async fn remove_subscription(
        &self,
        key: &NodeKey,
        subscription_id: &str,
    ) -> Result<(), PersistenceError> {
        self.write()?;
        if let Some(mut entry) = self.subscriptions.get_mut(key) {
            entry.remove(subscription_id);
        }
        Ok(())
    }

    async fn load_subscription(
        &self,
        key: &NodeKey,
        subscription_id: &str,
    ) -> Result<Option<NodeSubscription>, PersistenceError> {
        Ok(self
            .subscriptions
            .get(key)
            .and_then(|entry| entry.get(subscription_id).cloned()))
    }

    async fn save_item(&self, item: &StoredItem) -> Result<(), PersistenceError> {
        self.write()?;
        let mut items = self.items.entry(item.key()).or_default();
        items.retain(|existing| existing.item_id != item.item_id);
        items.push(item.clone());
        Ok(())
    }

    async fn remove_item(&self, key: &NodeKey, item_id: &str) -> Result<(), PersistenceError> {
        self.write()?;
        if let Some(mut items) = self.items.get_mut(key) {
            items.retain(|existing| existing.item_id != item_id);
        }
        Ok(())
    }

    async fn load_items(&self, key: &NodeKey) -> Result<Vec<StoredItem>, PersistenceError> {
        Ok(self
            .items
            .get(key)
            .map(|entry| entry.clone())
            .unwrap_or_default())
    }

    async fn purge_items(&self, key: &NodeKey) -> Result<(), PersistenceError> {
        self.write()?;
        self.items.remove(key);
        Ok(())
    }
}
