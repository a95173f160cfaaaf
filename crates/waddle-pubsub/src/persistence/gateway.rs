//! Write-behind gateway in front of a [`PubSubStore`].
//!
//! Mutations are queued per node and coalesced until the next flush. A flush
//! runs on a timer, when too many items are pending, before a node or
//! subscription is loaded, and on shutdown.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use jid::BareJid;
use rand::Rng;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::affiliation::NodeAffiliate;
use crate::config::{PubSubConfig, MIN_FLUSH_INTERVAL};
use crate::error::PersistenceError;
use crate::lock;
use crate::metrics;
use crate::subscription::NodeSubscription;

use super::{NodeKey, NodeSnapshot, PubSubStore, StoredItem, StoredNode};

/// A queued mutation of one node.
#[derive(Debug, Clone)]
enum NodeOp {
    Create(StoredNode),
    Update(StoredNode),
    Remove,
    SaveAffiliation {
        affiliate: NodeAffiliate,
        create: bool,
    },
    RemoveAffiliation(BareJid),
    SaveSubscription {
        subscription: NodeSubscription,
        create: bool,
    },
    RemoveSubscription(String),
    SaveItem(StoredItem),
    RemoveItem(String),
    Purge,
}

impl NodeOp {
    fn is_item_op(&self) -> bool {
        matches!(self, NodeOp::SaveItem(_) | NodeOp::RemoveItem(_) | NodeOp::Purge)
    }
}

/// Batches pubsub writes and flushes them to the store.
pub struct PersistenceGateway {
    store: Arc<dyn PubSubStore>,
    pending: Mutex<HashMap<NodeKey, Vec<NodeOp>>>,
    flush_lock: tokio::sync::Mutex<()>,
    flush_requested: Notify,
    flush_interval: Duration,
    max_items_flush: usize,
    cancel: CancellationToken,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for PersistenceGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceGateway")
            .field("pending_nodes", &lock::lock(&self.pending).len())
            .field("flush_interval", &self.flush_interval)
            .field("max_items_flush", &self.max_items_flush)
            .finish()
    }
}

impl PersistenceGateway {
    /// Create a gateway. The flush timer is not running until [`start`].
    ///
    /// [`start`]: PersistenceGateway::start
    pub fn new(store: Arc<dyn PubSubStore>, config: &PubSubConfig) -> Self {
        Self {
            store,
            pending: Mutex::new(HashMap::new()),
            flush_lock: tokio::sync::Mutex::new(()),
            flush_requested: Notify::new(),
            flush_interval: config.flush_interval.max(MIN_FLUSH_INTERVAL),
            max_items_flush: config.max_items_flush,
            cancel: CancellationToken::new(),
            timer: Mutex::new(None),
        }
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<dyn PubSubStore> {
        &self.store
    }

    /// Effective flush interval.
    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    /// Whether any operation is queued for `key`.
    pub fn has_pending(&self, key: &NodeKey) -> bool {
        lock::lock(&self.pending)
            .get(key)
            .is_some_and(|ops| !ops.is_empty())
    }

    /// Number of queued item saves across all nodes.
    pub fn pending_items(&self) -> usize {
        Self::count_items(&lock::lock(&self.pending))
    }

    fn count_items(pending: &HashMap<NodeKey, Vec<NodeOp>>) -> usize {
        pending
            .values()
            .flatten()
            .filter(|op| matches!(op, NodeOp::SaveItem(_)))
            .count()
    }

    /// Start the periodic flush timer.
    pub fn start(self: &Arc<Self>) {
        let mut timer = lock::lock(&self.timer);
        if timer.is_some() {
            return;
        }

        let interval = self.flush_interval;
        let offset_ms = rand::rng().random_range(0..interval.as_millis().max(1) as u64);
        let offset = Duration::from_millis(offset_ms);
        let gateway = Arc::clone(self);
        let cancel = self.cancel.clone();

        *timer = Some(tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + offset, interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                    _ = gateway.flush_requested.notified() => {
                        debug!("Early flush requested");
                    }
                }
                if let Err(e) = gateway.flush_all().await {
                    warn!(error = %e, "Periodic pubsub flush failed");
                }
            }
            debug!("Pubsub flush timer stopped");
        }));

        info!(
            interval_secs = interval.as_secs(),
            offset_ms, "Started pubsub flush timer"
        );
    }

    /// Stop the timer and write everything still queued.
    pub async fn shutdown(&self) -> Result<(), PersistenceError> {
        self.cancel.cancel();
        let handle = lock::lock(&self.timer).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Pubsub flush timer ended abnormally");
            }
        }
        self.flush_all().await
    }

    fn with_ops<R>(&self, key: &NodeKey, f: impl FnOnce(&mut Vec<NodeOp>) -> R) -> R {
        let mut pending = lock::lock(&self.pending);
        let ops = pending.entry(key.clone()).or_default();
        let result = f(ops);
        if ops.is_empty() {
            pending.remove(key);
        }
        result
    }

    /// Queue the creation of a node.
    pub fn create_node(&self, node: StoredNode) {
        let key = node.key();
        self.with_ops(&key, |ops| ops.push(NodeOp::Create(node)));
    }

    /// Queue a node update, replacing any update not yet flushed.
    pub fn update_node(&self, node: StoredNode) {
        let key = node.key();
        self.with_ops(&key, |ops| {
            let last = ops.iter_mut().rev().find(|op| {
                matches!(op, NodeOp::Create(_) | NodeOp::Update(_) | NodeOp::Remove)
            });
            match last {
                Some(NodeOp::Create(pending)) | Some(NodeOp::Update(pending)) => *pending = node,
                _ => ops.push(NodeOp::Update(node)),
            }
        });
    }

    /// Queue a node removal, dropping everything queued for it.
    pub fn remove_node(&self, key: &NodeKey) {
        self.with_ops(key, |ops| {
            let created = ops.iter().any(|op| matches!(op, NodeOp::Create(_)));
            let removed = ops.iter().any(|op| matches!(op, NodeOp::Remove));
            ops.clear();
            if !created || removed {
                ops.push(NodeOp::Remove);
            }
        });
    }

    /// Queue a new affiliation.
    pub fn create_affiliation(&self, key: &NodeKey, affiliate: NodeAffiliate) {
        self.save_affiliation(key, affiliate, true);
    }

    /// Queue an affiliation change.
    pub fn update_affiliation(&self, key: &NodeKey, affiliate: NodeAffiliate) {
        self.save_affiliation(key, affiliate, false);
    }

    fn save_affiliation(&self, key: &NodeKey, affiliate: NodeAffiliate, create: bool) {
        self.with_ops(key, |ops| {
            for op in ops.iter_mut().rev() {
                match op {
                    NodeOp::RemoveAffiliation(jid) if *jid == affiliate.jid => break,
                    NodeOp::SaveAffiliation {
                        affiliate: pending,
                        create: pending_create,
                    } if pending.jid == affiliate.jid => {
                        *pending = affiliate;
                        *pending_create |= create;
                        return;
                    }
                    _ => {}
                }
            }
            ops.push(NodeOp::SaveAffiliation { affiliate, create });
        });
    }

    /// Queue the removal of an affiliation.
    pub fn remove_affiliation(&self, key: &NodeKey, jid: &BareJid) {
        self.with_ops(key, |ops| {
            let mut created = false;
            let mut boundary = 0;
            for (i, op) in ops.iter().enumerate().rev() {
                if matches!(op, NodeOp::RemoveAffiliation(pending) if pending == jid) {
                    boundary = i + 1;
                    break;
                }
            }
            let mut i = boundary;
            while i < ops.len() {
                match &ops[i] {
                    NodeOp::SaveAffiliation { affiliate, create } if affiliate.jid == *jid => {
                        created |= *create;
                        ops.remove(i);
                    }
                    _ => i += 1,
                }
            }
            if !created {
                ops.push(NodeOp::RemoveAffiliation(jid.clone()));
            }
        });
    }

    /// Queue a new subscription.
    pub fn create_subscription(&self, key: &NodeKey, subscription: NodeSubscription) {
        self.save_subscription(key, subscription, true);
    }

    /// Queue a subscription change.
    pub fn update_subscription(&self, key: &NodeKey, subscription: NodeSubscription) {
        self.save_subscription(key, subscription, false);
    }

    fn save_subscription(&self, key: &NodeKey, subscription: NodeSubscription, create: bool) {
        self.with_ops(key, |ops| {
            for op in ops.iter_mut().rev() {
                match op {
                    NodeOp::RemoveSubscription(id) if *id == subscription.id => break,
                    NodeOp::SaveSubscription {
                        subscription: pending,
                        create: pending_create,
                    } if pending.id == subscription.id => {
                        *pending = subscription;
                        *pending_create |= create;
                        return;
                    }
                    _ => {}
                }
            }
            ops.push(NodeOp::SaveSubscription {
                subscription,
                create,
            });
        });
    }

    /// Queue the removal of a subscription.
    pub fn remove_subscription(&self, key: &NodeKey, subscription_id: &str) {
        self.with_ops(key, |ops| {
            let mut created = false;
            let mut boundary = 0;
            for (i, op) in ops.iter().enumerate().rev() {
                if matches!(op, NodeOp::RemoveSubscription(id) if id == subscription_id) {
                    boundary = i + 1;
                    break;
                }
            }
            let mut i = boundary;
            while i < ops.len() {
                match &ops[i] {
                    NodeOp::SaveSubscription {
                        subscription,
                        create,
                    } if subscription.id == subscription_id => {
                        created |= *create;
                        ops.remove(i);
                    }
                    _ => i += 1,
                }
            }
            if !created {
                ops.push(NodeOp::RemoveSubscription(subscription_id.to_string()));
            }
        });
    }

    /// Queue a published item. Requests an early flush once too many items
    /// are waiting.
    pub fn save_item(&self, item: StoredItem) {
        let key = item.key();
        let pending_items = {
            let mut pending = lock::lock(&self.pending);
            let ops = pending.entry(key).or_default();
            ops.retain(|op| match op {
                NodeOp::SaveItem(pending) => pending.item_id != item.item_id,
                NodeOp::RemoveItem(id) => *id != item.item_id,
                _ => true,
            });
            ops.push(NodeOp::SaveItem(item));
            Self::count_items(&pending)
        };

        if pending_items > self.max_items_flush {
            debug!(pending_items, "Pending item threshold exceeded");
            self.flush_requested.notify_one();
        }
    }

    /// Queue an item deletion.
    pub fn remove_item(&self, key: &NodeKey, item_id: &str) {
        self.with_ops(key, |ops| {
            ops.retain(|op| match op {
                NodeOp::SaveItem(pending) => pending.item_id != item_id,
                NodeOp::RemoveItem(id) => id != item_id,
                _ => true,
            });
            ops.push(NodeOp::RemoveItem(item_id.to_string()));
        });
    }

    /// Queue a purge of every item of a node.
    pub fn purge(&self, key: &NodeKey) {
        self.with_ops(key, |ops| {
            ops.retain(|op| !op.is_item_op());
            ops.push(NodeOp::Purge);
        });
    }

    /// Flush every queued operation.
    #[instrument(skip(self))]
    pub async fn flush_all(&self) -> Result<(), PersistenceError> {
        let _guard = self.flush_lock.lock().await;
        let batch: Vec<(NodeKey, Vec<NodeOp>)> =
            std::mem::take(&mut *lock::lock(&self.pending)).into_iter().collect();
        let result = self.write_batch(batch).await;
        metrics::record_flush("all", result.is_ok());
        result
    }

    /// Flush the operations queued for one node.
    #[instrument(skip(self), fields(node = %key))]
    pub async fn flush_node(&self, key: &NodeKey) -> Result<(), PersistenceError> {
        let _guard = self.flush_lock.lock().await;
        let batch: Vec<(NodeKey, Vec<NodeOp>)> = lock::lock(&self.pending)
            .remove_entry(key)
            .into_iter()
            .collect();
        let result = self.write_batch(batch).await;
        metrics::record_flush("node", result.is_ok());
        result
    }

    /// Flush the operations queued for every node of one service.
    #[instrument(skip(self))]
    pub async fn flush_service(&self, service_id: &str) -> Result<(), PersistenceError> {
        let _guard = self.flush_lock.lock().await;
        let batch: Vec<(NodeKey, Vec<NodeOp>)> = {
            let mut pending = lock::lock(&self.pending);
            let keys: Vec<NodeKey> = pending
                .keys()
                .filter(|key| key.service_id == service_id)
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|key| pending.remove_entry(&key))
                .collect()
        };
        let result = self.write_batch(batch).await;
        metrics::record_flush("service", result.is_ok());
        result
    }

    async fn write_batch(&self, batch: Vec<(NodeKey, Vec<NodeOp>)>) -> Result<(), PersistenceError> {
        if batch.is_empty() {
            return Ok(());
        }
        let nodes = batch.len();
        let mut remaining = batch.into_iter();

        while let Some((key, ops)) = remaining.next() {
            let mut ops = ops.into_iter();
            while let Some(op) = ops.next() {
                if let Err(e) = self.apply(&key, &op).await {
                    warn!(node = %key, error = %e, "Pubsub flush failed, re-queueing");
                    let mut failed = vec![(key, std::iter::once(op).chain(ops).collect())];
                    failed.extend(remaining);
                    self.requeue(failed);
                    return Err(e);
                }
            }
        }

        debug!(nodes, "Flushed pubsub changes");
        Ok(())
    }

    /// Put unflushed operations back ahead of anything queued meanwhile.
    fn requeue(&self, failed: Vec<(NodeKey, Vec<NodeOp>)>) {
        let mut pending = lock::lock(&self.pending);
        for (key, mut ops) in failed {
            if let Some(newer) = pending.remove(&key) {
                ops.extend(newer);
            }
            pending.insert(key, ops);
        }
    }

    async fn apply(&self, key: &NodeKey, op: &NodeOp) -> Result<(), PersistenceError> {
        match op {
            NodeOp::Create(node) | NodeOp::Update(node) => self.store.save_node(node).await,
            NodeOp::Remove => self.store.remove_node(key).await,
            NodeOp::SaveAffiliation { affiliate, .. } => {
                self.store.save_affiliation(key, affiliate).await
            }
            NodeOp::RemoveAffiliation(jid) => self.store.remove_affiliation(key, jid).await,
            NodeOp::SaveSubscription { subscription, .. } => {
                self.store.save_subscription(key, subscription).await
            }
            NodeOp::RemoveSubscription(id) => self.store.remove_subscription(key, id).await,
            NodeOp::SaveItem(item) => self.store.save_item(item).await,
            NodeOp::RemoveItem(id) => self.store.remove_item(key, id).await,
            NodeOp::Purge => self.store.purge_items(key).await,
        }
    }

    /// Load a node after writing its pending changes.
    pub async fn load_node(&self, key: &NodeKey) -> Result<Option<NodeSnapshot>, PersistenceError> {
        self.flush_node(key).await?;
        self.store.load_node(key).await
    }

    /// Load every node of a service after writing its pending changes.
    pub async fn load_nodes(&self, service_id: &str) -> Result<Vec<NodeSnapshot>, PersistenceError> {
        self.flush_service(service_id).await?;
        self.store.load_nodes(service_id).await
    }

    /// Load a subscription after writing the node's pending changes.
    pub async fn load_subscription(
        &self,
        key: &NodeKey,
        subscription_id: &str,
    ) -> Result<Option<NodeSubscription>, PersistenceError> {
        self.flush_node(key).await?;
        self.store.load_subscription(key, subscription_id).await
    }

    /// Load the stored items of a node, oldest first, after writing its
    /// pending changes.
    pub async fn load_items(&self, key: &NodeKey) -> Result<Vec<StoredItem>, PersistenceError> {
        self.flush_node(key).await?;
        self.store.load_items(key).await
    }
}

impl Drop for PersistenceGateway {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::affiliation::Affiliation;
    use crate::node::{NodeConfig, NodeType};
    use crate::persistence::InMemoryPubSubStore;
    use crate::subscription::SubscriptionState;

    fn gateway(max_items_flush: usize) -> (Arc<PersistenceGateway>, Arc<InMemoryPubSubStore>) {
        let store = Arc::new(InMemoryPubSubStore::new());
        let config = PubSubConfig {
            max_items_flush,
            ..PubSubConfig::default()
        };
        let gateway = Arc::new(PersistenceGateway::new(store.clone(), &config));
        (gateway, store)
    }

    fn node(node_id: &str, title: &str) -> StoredNode {
        let now = Utc::now();
        let mut config = NodeConfig::leaf_default();
        config.title = Some(title.to_string());
        StoredNode {
            service_id: "pubsub".to_string(),
            node_id: node_id.to_string(),
            node_type: NodeType::Leaf,
            parent: None,
            creator: "owner@example.com".to_string(),
            created_at: now,
            modified_at: now,
            config,
            collection: None,
        }
    }

    fn item(node_id: &str, item_id: &str) -> StoredItem {
        StoredItem {
            service_id: "pubsub".to_string(),
            node_id: node_id.to_string(),
            item_id: item_id.to_string(),
            publisher: "owner@example.com".to_string(),
            payload: None,
            published_at: Utc::now(),
        }
    }

    fn bare(s: &str) -> BareJid {
        s.parse().expect("valid jid")
    }

    #[tokio::test]
    async fn test_create_then_remove_never_reaches_store() {
        let (gateway, store) = gateway(1000);
        let key = NodeKey::new("pubsub", "n");
        gateway.create_node(node("n", "a"));
        gateway.save_item(item("n", "i1"));
        gateway.remove_node(&key);

        assert!(!gateway.has_pending(&key));
        gateway.flush_all().await.expect("flush");
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_trailing_updates_collapse() {
        let (gateway, store) = gateway(1000);
        let key = NodeKey::new("pubsub", "n");
        gateway.create_node(node("n", "a"));
        gateway.update_node(node("n", "b"));
        gateway.update_node(node("n", "c"));
        gateway.flush_all().await.expect("flush");

        assert_eq!(store.write_count(), 1);
        let snapshot = store.load_node(&key).await.expect("load").expect("node");
        assert_eq!(snapshot.node.config.title.as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn test_remove_of_existing_node_is_queued() {
        let (gateway, store) = gateway(1000);
        let key = NodeKey::new("pubsub", "n");
        gateway.create_node(node("n", "a"));
        gateway.flush_all().await.expect("flush");

        gateway.update_node(node("n", "b"));
        gateway.remove_node(&key);
        gateway.create_node(node("n", "c"));
        gateway.remove_node(&key);
        gateway.flush_all().await.expect("flush");

        assert!(!store.contains_node(&key));
    }

    #[tokio::test]
    async fn test_subscription_create_and_cancel_cancel_out() {
        let (gateway, store) = gateway(1000);
        let key = NodeKey::new("pubsub", "n");
        let subscription = NodeSubscription::new(
            "n",
            "sub-1",
            bare("a@example.com"),
            "a@example.com".parse().expect("valid jid"),
            SubscriptionState::Subscribed,
        );
        gateway.create_affiliation(&key, NodeAffiliate::new(bare("a@example.com"), Affiliation::None));
        gateway.create_subscription(&key, subscription.clone());
        gateway.update_subscription(&key, subscription);
        gateway.remove_subscription(&key, "sub-1");
        gateway.remove_affiliation(&key, &bare("a@example.com"));

        gateway.flush_all().await.expect("flush");
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_item_delete_cancels_pending_save() {
        let (gateway, store) = gateway(1000);
        let key = NodeKey::new("pubsub", "n");
        gateway.save_item(item("n", "i1"));
        gateway.save_item(item("n", "i2"));
        gateway.remove_item(&key, "i1");
        gateway.save_item(item("n", "i2"));

        let items = gateway.load_items(&key).await.expect("load");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].item_id, "i2");
        // One save of i2 plus the delete of i1.
        assert_eq!(store.write_count(), 2);
    }

    #[tokio::test]
    async fn test_purge_drops_pending_items() {
        let (gateway, store) = gateway(1000);
        let key = NodeKey::new("pubsub", "n");
        store.save_item(&item("n", "old")).await.expect("save");
        gateway.save_item(item("n", "i1"));
        gateway.purge(&key);
        assert_eq!(gateway.pending_items(), 0);

        assert!(gateway.load_items(&key).await.expect("load").is_empty());
    }

    #[tokio::test]
    async fn test_failed_flush_requeues_in_order() {
        let (gateway, store) = gateway(1000);
        let key = NodeKey::new("pubsub", "n");
        gateway.create_node(node("n", "a"));
        gateway.save_item(item("n", "i1"));

        store.set_fail_writes(true);
        assert!(gateway.flush_all().await.is_err());
        assert!(gateway.has_pending(&key));

        gateway.save_item(item("n", "i2"));
        store.set_fail_writes(false);
        gateway.flush_all().await.expect("flush");

        let ids: Vec<String> = store
            .load_items(&key)
            .await
            .expect("load")
            .into_iter()
            .map(|item| item.item_id)
            .collect();
        assert_eq!(ids, vec!["i1", "i2"]);
        assert!(store.contains_node(&key));
    }

    #[tokio::test]
    async fn test_load_node_flushes_that_node_only() {
        let (gateway, store) = gateway(1000);
        gateway.create_node(node("a", "a"));
        gateway.create_node(node("b", "b"));

        let snapshot = gateway
            .load_node(&NodeKey::new("pubsub", "a"))
            .await
            .expect("load");
        assert!(snapshot.is_some());
        assert!(!store.contains_node(&NodeKey::new("pubsub", "b")));
        assert!(gateway.has_pending(&NodeKey::new("pubsub", "b")));
    }

    #[tokio::test]
    async fn test_item_threshold_triggers_early_flush() {
        let (gateway, store) = gateway(2);
        gateway.start();
        for id in ["i1", "i2", "i3"] {
            gateway.save_item(item("n", id));
        }

        let key = NodeKey::new("pubsub", "n");
        let mut flushed = false;
        for _ in 0..100 {
            if store.load_items(&key).await.expect("load").len() == 3 {
                flushed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(flushed);
        gateway.shutdown().await.expect("shutdown");
    }

    #[tokio::test]
    async fn test_shutdown_flushes() {
        let (gateway, store) = gateway(1000);
        gateway.start();
        gateway.create_node(node("n", "a"));
        gateway.shutdown().await.expect("shutdown");
        assert!(store.contains_node(&NodeKey::new("pubsub", "n")));
    }

    #[test]
    fn test_interval_has_floor() {
        let store = Arc::new(InMemoryPubSubStore::new());
        let config = PubSubConfig {
            flush_interval: Duration::from_secs(1),
            ..PubSubConfig::default()
        };
        let gateway = PersistenceGateway::new(store, &config);
        assert_eq!(gateway.flush_interval(), MIN_FLUSH_INTERVAL);
    }
}
