//! libSQL-backed pubsub storage.
//!
//! Nodes, affiliations, subscriptions and items live in four tables keyed by
//! `(service_id, node_id)`. Configuration and subscription options are stored
//! as JSON columns. Items keep insertion order through an autoincrement
//! sequence column.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jid::BareJid;
use libsql::Connection;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::affiliation::{Affiliation, NodeAffiliate};
use crate::error::PersistenceError;
use crate::node::NodeType;
use crate::subscription::NodeSubscription;

use super::{NodeKey, NodeSnapshot, PubSubStore, StoredItem, StoredNode};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS pubsub_nodes (
    service_id TEXT NOT NULL,
    node_id TEXT NOT NULL,
    node_type TEXT NOT NULL,
    parent TEXT,
    creator TEXT NOT NULL,
    created_at TEXT NOT NULL,
    modified_at TEXT NOT NULL,
    config TEXT NOT NULL,
    collection TEXT,
    PRIMARY KEY (service_id, node_id)
);

CREATE TABLE IF NOT EXISTS pubsub_affiliations (
    service_id TEXT NOT NULL,
    node_id TEXT NOT NULL,
    jid TEXT NOT NULL,
    affiliation TEXT NOT NULL,
    PRIMARY KEY (service_id, node_id, jid)
);

CREATE TABLE IF NOT EXISTS pubsub_subscriptions (
    service_id TEXT NOT NULL,
    node_id TEXT NOT NULL,
    subscription_id TEXT NOT NULL,
    data TEXT NOT NULL,
    PRIMARY KEY (service_id, node_id, subscription_id)
);

CREATE TABLE IF NOT EXISTS pubsub_items (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    service_id TEXT NOT NULL,
    node_id TEXT NOT NULL,
    item_id TEXT NOT NULL,
    publisher TEXT NOT NULL,
    payload TEXT,
    published_at TEXT NOT NULL,
    UNIQUE (service_id, node_id, item_id)
);

CREATE INDEX IF NOT EXISTS idx_pubsub_items_node ON pubsub_items(service_id, node_id, seq);
"#;

/// Pubsub store on a libSQL connection.
#[derive(Clone)]
pub struct LibSqlPubSubStore {
    conn: Arc<Mutex<Connection>>,
    initialized: Arc<AtomicBool>,
}

impl LibSqlPubSubStore {
    /// Wrap a connection. Tables are created on first use.
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            initialized: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Open a local database file, or `:memory:`.
    pub async fn open_local(path: &str) -> Result<Self, PersistenceError> {
        let db = libsql::Builder::new_local(path).build().await?;
        let conn = db.connect()?;
        Ok(Self::new(conn))
    }

    async fn connection(&self) -> Result<tokio::sync::MutexGuard<'_, Connection>, PersistenceError> {
        let conn = self.conn.lock().await;
        if !self.initialized.load(Ordering::Acquire) {
            conn.execute_batch(SCHEMA).await?;
            self.initialized.store(true, Ordering::Release);
            debug!("Initialized pubsub tables");
        }
        Ok(conn)
    }
}

fn parse_time(value: &str) -> Result<DateTime<Utc>, PersistenceError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| PersistenceError::Corrupt(format!("timestamp {value}: {e}")))
}

async fn read_node(
    conn: &Connection,
    key: &NodeKey,
) -> Result<Option<StoredNode>, PersistenceError> {
    let mut rows = conn
        .query(
            "SELECT node_type, parent, creator, created_at, modified_at, config, collection \
             FROM pubsub_nodes WHERE service_id = ? AND node_id = ?",
            libsql::params![key.service_id.clone(), key.node_id.clone()],
        )
        .await?;

    let Some(row) = rows.next().await? else {
        return Ok(None);
    };

    let node_type: String = row.get(0)?;
    let parent: Option<String> = row.get(1).ok();
    let creator: String = row.get(2)?;
    let created_at: String = row.get(3)?;
    let modified_at: String = row.get(4)?;
    let config: String = row.get(5)?;
    let collection: Option<String> = row.get(6).ok();

    Ok(Some(StoredNode {
        service_id: key.service_id.clone(),
        node_id: key.node_id.clone(),
        node_type: NodeType::from_str(&node_type)
            .ok_or_else(|| PersistenceError::Corrupt(format!("node type {node_type}")))?,
        parent,
        creator,
        created_at: parse_time(&created_at)?,
        modified_at: parse_time(&modified_at)?,
        config: serde_json::from_str(&config)?,
        collection: collection
            .map(|json| serde_json::from_str(&json))
            .transpose()?,
    }))
}

async fn read_affiliations(
    conn: &Connection,
    key: &NodeKey,
) -> Result<Vec<NodeAffiliate>, PersistenceError> {
    let mut rows = conn
        .query(
            "SELECT jid, affiliation FROM pubsub_affiliations WHERE service_id = ? AND node_id = ?",
            libsql::params![key.service_id.clone(), key.node_id.clone()],
        )
        .await?;

    let mut affiliations = Vec::new();
    while let Some(row) = rows.next().await? {
        let jid: String = row.get(0)?;
        let affiliation: String = row.get(1)?;
        let jid: BareJid = jid
            .parse()
            .map_err(|e| PersistenceError::Corrupt(format!("affiliation jid {jid}: {e}")))?;
        let affiliation = Affiliation::from_str(&affiliation)
            .ok_or_else(|| PersistenceError::Corrupt(format!("affiliation {affiliation}")))?;
        affiliations.push(NodeAffiliate::new(jid, affiliation));
    }
    Ok(affiliations)
}

async fn read_subscriptions(
    conn: &Connection,
    key: &NodeKey,
) -> Result<Vec<NodeSubscription>, PersistenceError> {
    let mut rows = conn
        .query(
            "SELECT data FROM pubsub_subscriptions WHERE service_id = ? AND node_id = ?",
            libsql::params![key.service_id.clone(), key.node_id.clone()],
        )
        .await?;

    let mut subscriptions = Vec::new();
    while let Some(row) = rows.next().await? {
        let data: String = row.get(0)?;
        subscriptions.push(serde_json::from_str(&data)?);
    }
    Ok(subscriptions)
}

async fn read_items(conn: &Connection, key: &NodeKey) -> Result<Vec<StoredItem>, PersistenceError> {
    let mut rows = conn
        .query(
            "SELECT item_id, publisher, payload, published_at FROM pubsub_items \
             WHERE service_id = ? AND node_id = ? ORDER BY seq ASC",
            libsql::params![key.service_id.clone(), key.node_id.clone()],
        )
        .await?;

    let mut items = Vec::new();
    while let Some(row) = rows.next().await? {
        let item_id: String = row.get(0)?;
        let publisher: String = row.get(1)?;
        let payload: Option<String> = row.get(2).ok();
        let published_at: String = row.get(3)?;
        items.push(StoredItem {
            service_id: key.service_id.clone(),
            node_id: key.node_id.clone(),
            item_id,
            publisher,
            payload,
            published_at: parse_time(&published_at)?,
        });
    }
    Ok(items)
}

async fn read_snapshot(
    conn: &Connection,
    key: &NodeKey,
) -> Result<Option<NodeSnapshot>, PersistenceError> {
    let Some(node) = read_node(conn, key).await? else {
        return Ok(None);
    };
    Ok(Some(NodeSnapshot {
        affiliations: read_affiliations(conn, key).await?,
        subscriptions: read_subscriptions(conn, key).await?,
        items: read_items(conn, key).await?,
        node,
    }))
}

#[async_trait]
impl PubSubStore for LibSqlPubSubStore {
    #[instrument(skip(self, node), fields(node = %node.key()))]
    async fn save_node(&self, node: &StoredNode) -> Result<(), PersistenceError> {
        let conn = self.connection().await?;
        let config = serde_json::to_string(&node.config)?;
        let collection = node
            .collection
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        conn.execute(
            r#"
            INSERT INTO pubsub_nodes
                (service_id, node_id, node_type, parent, creator, created_at, modified_at, config, collection)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(service_id, node_id) DO UPDATE SET
                node_type = excluded.node_type,
                parent = excluded.parent,
                modified_at = excluded.modified_at,
                config = excluded.config,
                collection = excluded.collection
            "#,
            libsql::params![
                node.service_id.clone(),
                node.node_id.clone(),
                node.node_type.as_str(),
                node.parent.clone(),
                node.creator.clone(),
                node.created_at.to_rfc3339(),
                node.modified_at.to_rfc3339(),
                config,
                collection,
            ],
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(node = %key))]
    async fn remove_node(&self, key: &NodeKey) -> Result<(), PersistenceError> {
        let conn = self.connection().await?;
        for table in [
            "pubsub_items",
            "pubsub_subscriptions",
            "pubsub_affiliations",
            "pubsub_nodes",
        ] {
            conn.execute(
                &format!("DELETE FROM {table} WHERE service_id = ? AND node_id = ?"),
                libsql::params![key.service_id.clone(), key.node_id.clone()],
            )
            .await?;
        }
        Ok(())
    }

    #[instrument(skip(self), fields(node = %key))]
    async fn load_node(&self, key: &NodeKey) -> Result<Option<NodeSnapshot>, PersistenceError> {
        let conn = self.connection().await?;
        read_snapshot(&conn, key).await
    }

    #[instrument(skip(self))]
    async fn load_nodes(&self, service_id: &str) -> Result<Vec<NodeSnapshot>, PersistenceError> {
        let conn = self.connection().await?;
        let mut rows = conn
            .query(
                "SELECT node_id FROM pubsub_nodes WHERE service_id = ? ORDER BY node_id",
                libsql::params![service_id.to_string()],
            )
            .await?;

        let mut keys = Vec::new();
        while let Some(row) = rows.next().await? {
            let node_id: String = row.get(0)?;
            keys.push(NodeKey::new(service_id, node_id));
        }

        let mut snapshots = Vec::with_capacity(keys.len());
        for key in &keys {
            if let Some(snapshot) = read_snapshot(&conn, key).await? {
                snapshots.push(snapshot);
            }
        }
        debug!(count = snapshots.len(), "Loaded pubsub nodes");
        Ok(snapshots)
    }

    async fn save_affiliation(
        &self,
        key: &NodeKey,
        affiliate: &NodeAffiliate,
    ) -> Result<(), PersistenceError> {
        let conn = self.connection().await?;
        conn.execute(
            r#"
            INSERT INTO pubsub_affiliations (service_id, node_id, jid, affiliation)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(service_id, node_id, jid) DO UPDATE SET affiliation = excluded.affiliation
            "#,
            libsql::params![
                key.service_id.clone(),
                key.node_id.clone(),
                affiliate.jid.to_string(),
                affiliate.affiliation.as_str(),
            ],
        )
        .await?;
        Ok(())
    }

    async fn remove_affiliation(
        &self,
        key: &NodeKey,
        jid: &BareJid,
    ) -> Result<(), PersistenceError> {
        let conn = self.connection().await?;
        conn.execute(
            "DELETE FROM pubsub_affiliations WHERE service_id = ? AND node_id = ? AND jid = ?",
            libsql::params![key.service_id.clone(), key.node_id.clone(), jid.to_string()],
        )
        .await?;
        Ok(())
    }

    async fn save_subscription(
        &self,
        key: &NodeKey,
        subscription: &NodeSubscription,
    ) -> Result<(), PersistenceError> {
        let conn = self.connection().await?;
        let data = serde_json::to_string(subscription)?;
        conn.execute(
            r#"
            INSERT INTO pubsub_subscriptions (service_id, node_id, subscription_id, data)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(service_id, node_id, subscription_id) DO UPDATE SET data = excluded.data
            "#,
            libsql::params![
                key.service_id.clone(),
                key.node_id.clone(),
                subscription.id.clone(),
                data,
            ],
        )
        .await?;
        Ok(())
    }

    async fn remove_subscription(
        &self,
        key: &NodeKey,
        subscription_id: &str,
    ) -> Result<(), PersistenceError> {
        let conn = self.connection().await?;
        conn.execute(
            "DELETE FROM pubsub_subscriptions WHERE service_id = ? AND node_id = ? AND subscription_id = ?",
            libsql::params![
                key.service_id.clone(),
                key.node_id.clone(),
                subscription_id.to_string(),
            ],
        )
        .await?;
        Ok(())
    }

    async fn load_subscription(
        &self,
        key: &NodeKey,
        subscription_id: &str,
    ) -> Result<Option<NodeSubscription>, PersistenceError> {
        let conn = self.connection().await?;
        let mut rows = conn
            .query(
                "SELECT data FROM pubsub_subscriptions WHERE service_id = ? AND node_id = ? AND subscription_id = ?",
                libsql::params![
                    key.service_id.clone(),
                    key.node_id.clone(),
                    subscription_id.to_string(),
                ],
            )
            .await?;

        match rows.next().await? {
            Some(row) => {
                let data: String = row.get(0)?;
                Ok(Some(serde_json::from_str(&data)?))
            }
            None => Ok(None),
        }
    }

    async fn save_item(&self, item: &StoredItem) -> Result<(), PersistenceError> {
        let conn = self.connection().await?;
        // Delete first so a replaced item takes a fresh sequence number.
        conn.execute(
            "DELETE FROM pubsub_items WHERE service_id = ? AND node_id = ? AND item_id = ?",
            libsql::params![
                item.service_id.clone(),
                item.node_id.clone(),
                item.item_id.clone(),
            ],
        )
        .await?;
        conn.execute(
            r#"
            INSERT INTO pubsub_items (service_id, node_id, item_id, publisher, payload, published_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
            libsql::params![
                item.service_id.clone(),
                item.node_id.clone(),
                item.item_id.clone(),
                item.publisher.clone(),
                item.payload.clone(),
                item.published_at.to_rfc3339(),
            ],
        )
        .await?;
        Ok(())
    }

    async fn remove_item(&self, key: &NodeKey, item_id: &str) -> Result<(), PersistenceError> {
        let conn = self.connection().await?;
        conn.execute(
            "DELETE FROM pubsub_items WHERE service_id = ? AND node_id = ? AND item_id = ?",
            libsql::params![key.service_id.clone(), key.node_id.clone(), item_id.to_string()],
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(node = %key))]
    async fn load_items(&self, key: &NodeKey) -> Result<Vec<StoredItem>, PersistenceError> {
        let conn = self.connection().await?;
        read_items(&conn, key).await
    }

    #[instrument(skip(self), fields(node = %key))]
    async fn purge_items(&self, key: &NodeKey) -> Result<(), PersistenceError> {
        let conn = self.connection().await?;
        conn.execute(
            "DELETE FROM pubsub_items WHERE service_id = ? AND node_id = ?",
            libsql::params![key.service_id.clone(), key.node_id.clone()],
        )
        .await?;
        Ok(())
    }
}
