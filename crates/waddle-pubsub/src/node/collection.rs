//! Collection nodes: child bookkeeping, association rules and hierarchy queries.

use std::fmt;
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use jid::{BareJid, Jid};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dispatch;
use crate::error::PubSubError;
use crate::form::{DataForm, FormField};
use crate::lock;
use crate::service::PubSubService;
use crate::stanzas;

use super::Node;

/// Recursion bound for hierarchy walks.
pub const MAX_HIERARCHY_DEPTH: usize = 64;

/// Who may associate new child nodes with a collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssociationPolicy {
    /// Anyone.
    #[default]
    All,
    /// Owners of the collection and service administrators.
    Owners,
    /// Owners, administrators and the trusted list.
    Whitelist,
}

impl AssociationPolicy {
    /// Parse from a form value.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "all" => Some(AssociationPolicy::All),
            "owners" => Some(AssociationPolicy::Owners),
            "whitelist" => Some(AssociationPolicy::Whitelist),
            _ => None,
        }
    }
}

impl fmt::Display for AssociationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AssociationPolicy::All => "all",
            AssociationPolicy::Owners => "owners",
            AssociationPolicy::Whitelist => "whitelist",
        };
        write!(f, "{}", s)
    }
}

/// Collection-only configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSettings {
    /// Association policy.
    pub association_policy: AssociationPolicy,
    /// JIDs allowed to associate under the whitelist policy.
    pub trusted: Vec<BareJid>,
    /// Maximum direct leaf children, -1 for unlimited.
    pub max_leaf_nodes: i32,
}

impl Default for CollectionSettings {
    fn default() -> Self {
        Self {
            association_policy: AssociationPolicy::All,
            trusted: Vec::new(),
            max_leaf_nodes: -1,
        }
    }
}

impl CollectionSettings {
    /// Apply one form field; `false` if the variable is not a collection one.
    pub fn apply_field(&mut self, field: &FormField) -> Result<bool, PubSubError> {
        match field.var.as_str() {
            "pubsub#leaf_node_association_policy" | "pubsub#children_association_policy" => {
                self.association_policy = field
                    .first_value()
                    .and_then(AssociationPolicy::from_str)
                    .ok_or_else(|| {
                        PubSubError::not_acceptable(format!("invalid {}", field.var))
                    })?;
            }
            "pubsub#leaf_node_association_whitelist"
            | "pubsub#children_association_whitelist" => {
                self.trusted = field
                    .values
                    .iter()
                    .filter_map(|v| v.parse::<Jid>().ok())
                    .map(|jid| jid.to_bare())
                    .collect();
            }
            "pubsub#leaf_nodes_max" | "pubsub#children_max" => {
                self.max_leaf_nodes = match field.first_value().filter(|v| !v.is_empty()) {
                    None => -1,
                    Some(_) => {
                        let max = field.int_value()?;
                        i32::try_from(max.max(-1)).map_err(|_| {
                            PubSubError::not_acceptable(format!("{} out of range", field.var))
                        })?
                    }
                };
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// Append the collection fields to a configuration form.
    pub fn append_fields(&self, form: &mut DataForm) {
        form.push(
            FormField::new(
                "pubsub#children_association_policy",
                self.association_policy.to_string(),
            )
            .with_type("list-single"),
        );
        form.push(
            FormField::multi(
                "pubsub#children_association_whitelist",
                self.trusted.iter().map(ToString::to_string).collect(),
            )
            .with_type("jid-multi"),
        );
        form.push(
            FormField::new("pubsub#children_max", self.max_leaf_nodes.to_string())
                .with_type("text-single"),
        );
    }
}

/// State held by a collection node.
#[derive(Debug)]
pub struct CollectionState {
    children: DashMap<String, Arc<Node>>,
    settings: RwLock<CollectionSettings>,
}

impl CollectionState {
    /// Create an empty collection.
    pub fn new(settings: CollectionSettings) -> Self {
        Self {
            children: DashMap::new(),
            settings: RwLock::new(settings),
        }
    }

    /// Current settings.
    pub fn settings(&self) -> CollectionSettings {
        lock::read(&self.settings).clone()
    }

    /// Replace the settings.
    pub fn set_settings(&self, settings: CollectionSettings) {
        *lock::write(&self.settings) = settings;
    }
}

impl Node {
    /// Record `child` as a direct child. No-op on leaves.
    pub fn add_child_node(&self, child: Arc<Node>) {
        if let Some(collection) = self.collection() {
            collection.children.insert(child.id().to_string(), child);
        }
    }

    /// Forget a direct child.
    pub fn remove_child_node(&self, child_id: &str) -> Option<Arc<Node>> {
        self.collection()
            .and_then(|collection| collection.children.remove(child_id))
            .map(|(_, child)| child)
    }

    /// Direct children.
    pub fn children(&self) -> Vec<Arc<Node>> {
        self.collection()
            .map(|collection| {
                collection
                    .children
                    .iter()
                    .map(|entry| Arc::clone(entry.value()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether `node` is a direct child.
    pub fn is_child_node(&self, node: &Node) -> bool {
        self.collection()
            .is_some_and(|collection| collection.children.contains_key(node.id()))
    }

    /// Whether `node` sits anywhere below this collection.
    pub fn is_descendant_node(&self, node: &Node) -> bool {
        self.is_descendant_within(node.id(), MAX_HIERARCHY_DEPTH)
    }

    fn is_descendant_within(&self, node_id: &str, depth: usize) -> bool {
        let Some(collection) = self.collection() else {
            return false;
        };
        if depth == 0 {
            return false;
        }
        if collection.children.contains_key(node_id) {
            return true;
        }
        self.children()
            .iter()
            .any(|child| child.is_descendant_within(node_id, depth - 1))
    }

    /// Whether `user` may associate a new child with this collection.
    pub fn is_association_allowed(&self, service: &PubSubService, user: &BareJid) -> bool {
        let Some(collection) = self.collection() else {
            return false;
        };
        let settings = lock::read(&collection.settings);
        match settings.association_policy {
            AssociationPolicy::All => true,
            AssociationPolicy::Owners => self.is_admin(service, user),
            AssociationPolicy::Whitelist => {
                self.is_admin(service, user) || settings.trusted.contains(user)
            }
        }
    }

    /// Whether the direct leaf children already hit the limit.
    pub fn is_max_leaf_node_reached(&self) -> bool {
        let Some(collection) = self.collection() else {
            return false;
        };
        let max = lock::read(&collection.settings).max_leaf_nodes;
        if max < 0 {
            return false;
        }
        let leaves = collection
            .children
            .iter()
            .filter(|entry| entry.value().is_leaf())
            .count();
        leaves >= max as usize
    }

    /// Notify subscribers that `child` joined this collection.
    pub fn child_node_added(&self, service: &PubSubService, child: &Node) {
        let event = stanzas::build_items_event(self.id(), &[(child.id().to_string(), None)]);
        dispatch::broadcast_collection_event(service, self, child, "child-added", event);
    }

    /// Notify subscribers that `child` is being deleted.
    pub fn child_node_deleted(&self, service: &PubSubService, child: &Node) {
        let event = stanzas::build_delete_event(child.id());
        dispatch::broadcast_collection_event(service, self, child, "child-deleted", event);
    }

    /// Prepare for deletion: move every child up to this node's parent and
    /// detach this node from its own parent.
    pub fn deleting_node(&self, service: &PubSubService) {
        let grandparent_id = self.parent_id();
        let grandparent = grandparent_id
            .as_deref()
            .and_then(|id| service.get_node(id));

        if let Some(collection) = self.collection() {
            let children: Vec<Arc<Node>> = collection
                .children
                .iter()
                .map(|entry| Arc::clone(entry.value()))
                .collect();
            collection.children.clear();

            for child in children {
                debug!(
                    node = %self.id(),
                    child = %child.id(),
                    new_parent = ?grandparent_id,
                    "Reparenting child of deleted collection"
                );
                child.set_parent(grandparent_id.clone());
                if let Some(ref parent) = grandparent {
                    parent.add_child_node(child);
                }
            }
        }

        if let Some(parent) = grandparent {
            parent.remove_child_node(self.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeConfig;
    use crate::presence::InMemoryPresence;
    use crate::router::ChannelRouter;
    use crate::service::ServiceId;

    fn creator() -> jid::Jid {
        "owner@example.com/desk".parse().expect("valid jid")
    }

    fn collection(id: &str) -> Arc<Node> {
        Arc::new(Node::new_collection(
            ServiceId::Shared,
            id,
            creator(),
            NodeConfig::collection_default(),
            CollectionSettings::default(),
        ))
    }

    fn leaf(id: &str) -> Arc<Node> {
        Arc::new(Node::new_leaf(
            ServiceId::Shared,
            id,
            creator(),
            NodeConfig::leaf_default(),
        ))
    }

    #[test]
    fn test_descendant_query() {
        let root = collection("root");
        let a = collection("a");
        let b = leaf("b");
        a.add_child_node(Arc::clone(&b));
        root.add_child_node(Arc::clone(&a));

        assert!(root.is_descendant_node(&b));
        assert!(root.is_child_node(&a));
        assert!(!root.is_child_node(&b));
        assert!(!a.is_descendant_node(&root));
    }

    #[test]
    fn test_max_leaf_counts_only_leaves() {
        let root = collection("root");
        root.collection()
            .expect("collection")
            .set_settings(CollectionSettings {
                max_leaf_nodes: 1,
                ..Default::default()
            });

        root.add_child_node(collection("sub"));
        assert!(!root.is_max_leaf_node_reached());

        root.add_child_node(leaf("l1"));
        assert!(root.is_max_leaf_node_reached());
    }

    #[test]
    fn test_unlimited_leaf_nodes() {
        let root = collection("root");
        for i in 0..5 {
            root.add_child_node(leaf(&format!("l{}", i)));
        }
        assert!(!root.is_max_leaf_node_reached());
    }

    #[test]
    fn test_policy_field_aliases() {
        let mut settings = CollectionSettings::default();
        assert!(settings
            .apply_field(&FormField::new("pubsub#children_association_policy", "owners"))
            .expect("valid"));
        assert_eq!(settings.association_policy, AssociationPolicy::Owners);

        assert!(settings
            .apply_field(&FormField::new("pubsub#leaf_node_association_policy", "whitelist"))
            .expect("valid"));
        assert_eq!(settings.association_policy, AssociationPolicy::Whitelist);

        assert!(settings
            .apply_field(&FormField::new("pubsub#leaf_node_association_policy", "friends"))
            .is_err());
        assert_eq!(settings.association_policy, AssociationPolicy::Whitelist);
    }

    #[test]
    fn test_whitelist_drops_invalid_entries() {
        let mut settings = CollectionSettings::default();
        settings
            .apply_field(&FormField::multi(
                "pubsub#children_association_whitelist",
                vec![
                    "a@example.com".to_string(),
                    "@example.com".to_string(),
                    "b@example.com/phone".to_string(),
                    "c@example.com".to_string(),
                ],
            ))
            .expect("valid");
        assert_eq!(settings.trusted.len(), 3);
        assert!(settings
            .trusted
            .contains(&"b@example.com".parse::<BareJid>().expect("valid jid")));
    }

    #[test]
    fn test_deleting_keeps_uncached_grandparent_id() {
        let (router, _rx) = ChannelRouter::new(4);
        let service = PubSubService::new(
            ServiceId::Shared,
            "pubsub.example.com",
            Vec::new(),
            Arc::new(router),
            Arc::new(InMemoryPresence::new()),
        );
        let c = collection("c");
        c.set_parent(Some("gone".to_string()));
        let x = leaf("x");
        x.set_parent(Some("c".to_string()));
        c.add_child_node(Arc::clone(&x));

        c.deleting_node(&service);

        assert_eq!(x.parent_id().as_deref(), Some("gone"));
        assert!(c.children().is_empty());
    }

    #[test]
    fn test_max_leaf_nodes_field() {
        let mut settings = CollectionSettings::default();
        settings
            .apply_field(&FormField::new("pubsub#leaf_nodes_max", "3"))
            .expect("valid");
        assert_eq!(settings.max_leaf_nodes, 3);

        settings
            .apply_field(&FormField::new("pubsub#children_max", "-1"))
            .expect("valid");
        assert_eq!(settings.max_leaf_nodes, -1);

        assert!(settings
            .apply_field(&FormField::new("pubsub#children_max", "many"))
            .is_err());
    }
}
