//! Leaf node item storage.

use std::collections::VecDeque;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use jid::Jid;
use minidom::Element;

use crate::error::PersistenceError;
use crate::lock;
use crate::persistence::StoredItem;

/// An item published to a leaf node.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedItem {
    /// Item ID, unique within the node.
    pub id: String,
    /// Node the item was published to.
    pub node_id: String,
    /// Entity that published the item.
    pub publisher: Jid,
    /// Item payload.
    pub payload: Option<Element>,
    /// Publication time.
    pub published_at: DateTime<Utc>,
}

impl PublishedItem {
    /// Create an item published now.
    pub fn new(
        node_id: impl Into<String>,
        id: impl Into<String>,
        publisher: Jid,
        payload: Option<Element>,
    ) -> Self {
        Self {
            id: id.into(),
            node_id: node_id.into(),
            publisher,
            payload,
            published_at: Utc::now(),
        }
    }

    /// Serialized payload, if any.
    pub fn payload_xml(&self) -> Option<String> {
        self.payload.as_ref().map(String::from)
    }

    /// Size of the serialized payload in bytes.
    pub fn payload_size(&self) -> usize {
        self.payload_xml().map(|xml| xml.len()).unwrap_or(0)
    }

    /// Record form for a durable store.
    pub fn to_stored(&self, service_id: &str) -> StoredItem {
        StoredItem {
            service_id: service_id.to_string(),
            node_id: self.node_id.clone(),
            item_id: self.id.clone(),
            publisher: self.publisher.to_string(),
            payload: self.payload_xml(),
            published_at: self.published_at,
        }
    }

    /// Rebuild an item from its stored record.
    pub fn from_stored(stored: &StoredItem) -> Result<Self, PersistenceError> {
        let publisher = stored.publisher.parse::<Jid>().map_err(|e| {
            PersistenceError::Corrupt(format!("item {} publisher: {}", stored.item_id, e))
        })?;

        let payload = match stored.payload {
            Some(ref xml) => Some(xml.parse::<Element>().map_err(|e| {
                PersistenceError::Corrupt(format!("item {} payload: {}", stored.item_id, e))
            })?),
            None => None,
        };

        Ok(Self {
            id: stored.item_id.clone(),
            node_id: stored.node_id.clone(),
            publisher,
            payload,
            published_at: stored.published_at,
        })
    }
}

/// Items held by a leaf node, oldest first.
#[derive(Debug, Default)]
pub struct LeafState {
    items: RwLock<VecDeque<PublishedItem>>,
}

impl LeafState {
    /// Store an item, replacing any item with the same ID, and evict the
    /// oldest items beyond `limit`. Returns the evicted items.
    pub fn publish(&self, item: PublishedItem, limit: Option<usize>) -> Vec<PublishedItem> {
        let mut items = lock::write(&self.items);

        if let Some(pos) = items.iter().position(|existing| existing.id == item.id) {
            items.remove(pos);
        }
        items.push_back(item);

        let mut evicted = Vec::new();
        if let Some(limit) = limit {
            while items.len() > limit {
                match items.pop_front() {
                    Some(old) => evicted.push(old),
                    None => break,
                }
            }
        }
        evicted
    }

    /// Remove an item by ID.
    pub fn retract(&self, item_id: &str) -> Option<PublishedItem> {
        let mut items = lock::write(&self.items);
        let pos = items.iter().position(|item| item.id == item_id)?;
        items.remove(pos)
    }

    /// Remove every item, returning how many were held.
    pub fn purge(&self) -> usize {
        let mut items = lock::write(&self.items);
        let count = items.len();
        items.clear();
        count
    }

    /// Drop the oldest items beyond `limit`, e.g. after `max_items` shrank.
    pub fn truncate(&self, limit: Option<usize>) -> Vec<PublishedItem> {
        let Some(limit) = limit else {
            return Vec::new();
        };
        let mut items = lock::write(&self.items);
        let excess = items.len().saturating_sub(limit);
        items.drain(..excess).collect()
    }

    /// The newest `max` items (all when `None`), oldest first.
    pub fn items(&self, max: Option<usize>) -> Vec<PublishedItem> {
        let items = lock::read(&self.items);
        let skip = max.map(|m| items.len().saturating_sub(m)).unwrap_or(0);
        items.iter().skip(skip).cloned().collect()
    }

    /// Look up one item.
    pub fn get(&self, item_id: &str) -> Option<PublishedItem> {
        lock::read(&self.items)
            .iter()
            .find(|item| item.id == item_id)
            .cloned()
    }

    /// The most recently published item.
    pub fn last(&self) -> Option<PublishedItem> {
        lock::read(&self.items).back().cloned()
    }

    /// Number of items held.
    pub fn len(&self) -> usize {
        lock::read(&self.items).len()
    }

    /// Whether the leaf holds no items.
    pub fn is_empty(&self) -> bool {
        lock::read(&self.items).is_empty()
    }

    /// Replace the whole item list, e.g. after loading from the store.
    pub fn replace_all(&self, loaded: Vec<PublishedItem>) {
        *lock::write(&self.items) = loaded.into();
    }
}
