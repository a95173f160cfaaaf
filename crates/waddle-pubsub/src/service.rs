//! PubSub services: the shared `pubsub` service and personal eventing services.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use jid::{BareJid, Jid};
use minidom::Element;
use tracing::{debug, info};

use crate::error::PubSubError;
use crate::lock;
use crate::metrics;
use crate::node::{Node, MAX_HIERARCHY_DEPTH};
use crate::presence::PresenceTracker;
use crate::router::NotificationRouter;
use crate::subscription::NodeSubscription;

/// Reserved service ID of the shared pubsub service.
pub const SHARED_SERVICE_ID: &str = "pubsub";

/// Identifies a pubsub service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ServiceId {
    /// The shared service.
    Shared,
    /// The personal eventing service of a user.
    Personal(BareJid),
}

impl ServiceId {
    /// Parse a stored service ID: the sentinel or a bare JID.
    pub fn parse(s: &str) -> Option<Self> {
        if s == SHARED_SERVICE_ID {
            return Some(ServiceId::Shared);
        }
        s.parse::<BareJid>().ok().map(ServiceId::Personal)
    }

    /// Whether this is a personal eventing service.
    pub fn is_personal(&self) -> bool {
        matches!(self, ServiceId::Personal(_))
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceId::Shared => write!(f, "{}", SHARED_SERVICE_ID),
            ServiceId::Personal(jid) => write!(f, "{}", jid),
        }
    }
}

/// A namespace of nodes.
pub struct PubSubService {
    id: ServiceId,
    address: String,
    nodes: DashMap<String, Arc<Node>>,
    admins: Vec<BareJid>,
    router: Arc<dyn NotificationRouter>,
    presence: Arc<dyn PresenceTracker>,
    last_access: RwLock<Instant>,
}

impl fmt::Debug for PubSubService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PubSubService")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("nodes", &self.nodes.len())
            .finish()
    }
}

impl PubSubService {
    /// Create an empty service.
    ///
    /// `address` is the `from` of its notifications: the configured domain for
    /// the shared service, the user's bare JID for personal ones.
    pub fn new(
        id: ServiceId,
        address: impl Into<String>,
        admins: Vec<BareJid>,
        router: Arc<dyn NotificationRouter>,
        presence: Arc<dyn PresenceTracker>,
    ) -> Self {
        Self {
            id,
            address: address.into(),
            nodes: DashMap::new(),
            admins,
            router,
            presence,
            last_access: RwLock::new(Instant::now()),
        }
    }

    /// Service ID.
    pub fn id(&self) -> &ServiceId {
        &self.id
    }

    /// Address notifications are sent from.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Presence subsystem.
    pub fn presence(&self) -> &dyn PresenceTracker {
        self.presence.as_ref()
    }

    /// Record an access for idle eviction.
    pub fn touch(&self) {
        *lock::write(&self.last_access) = Instant::now();
    }

    /// Time of the last access.
    pub fn last_access(&self) -> Instant {
        *lock::read(&self.last_access)
    }

    /// Whether `jid` administers this service. The owner of a personal
    /// service administers it.
    pub fn is_service_admin(&self, jid: &BareJid) -> bool {
        if let ServiceId::Personal(ref owner) = self.id {
            if owner == jid {
                return true;
            }
        }
        self.admins.contains(jid)
    }

    /// Cached node lookup.
    pub fn get_node(&self, node_id: &str) -> Option<Arc<Node>> {
        self.nodes.get(node_id).map(|entry| Arc::clone(entry.value()))
    }

    /// All cached nodes.
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Nodes without a parent.
    pub fn root_nodes(&self) -> Vec<Arc<Node>> {
        self.nodes
            .iter()
            .filter(|entry| entry.value().parent_id().is_none())
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Add a node and link it under its parent, replacing any cached node
    /// with that ID.
    pub fn create_node(&self, node: Node) -> Arc<Node> {
        let node = Arc::new(node);
        self.install_node(Arc::clone(&node));
        info!(service = %self.id, node = %node.id(), "Created pubsub node");
        node
    }

    /// Add a newly created node unless its ID is taken.
    pub fn try_create_node(&self, node: Arc<Node>) -> Result<Arc<Node>, PubSubError> {
        if self.insert_vacant(&node).is_err() {
            return Err(PubSubError::Conflict(format!("node {} exists", node.id())));
        }
        self.link_node(&node);
        info!(service = %self.id, node = %node.id(), "Created pubsub node");
        Ok(node)
    }

    /// Cache a loaded node unless another one got there first; returns the
    /// node that ends up cached.
    pub fn install_if_absent(&self, node: Arc<Node>) -> Arc<Node> {
        match self.insert_vacant(&node) {
            Ok(()) => {
                self.link_node(&node);
                node
            }
            Err(existing) => existing,
        }
    }

    /// Place a node in the map, replacing any cached node with that ID, and
    /// restore child links in both directions. Used for reloads.
    pub fn install_node(&self, node: Arc<Node>) {
        if let Some(previous) = self.get_node(node.id()) {
            let old_parent = previous.parent_id();
            if old_parent != node.parent_id() {
                if let Some(old) = old_parent.and_then(|id| self.get_node(&id)) {
                    old.remove_child_node(node.id());
                }
            }
        }

        self.link_node(&node);

        if let Some(previous) = self.nodes.insert(node.id().to_string(), node) {
            debug!(service = %self.id, node = %previous.id(), "Replaced cached node");
        }
    }

    fn insert_vacant(&self, node: &Arc<Node>) -> Result<(), Arc<Node>> {
        match self.nodes.entry(node.id().to_string()) {
            Entry::Occupied(existing) => Err(Arc::clone(existing.get())),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(node));
                Ok(())
            }
        }
    }

    fn link_node(&self, node: &Arc<Node>) {
        if let Some(parent) = node.parent_id().and_then(|id| self.get_node(&id)) {
            parent.add_child_node(Arc::clone(node));
        }

        if node.is_collection() {
            for entry in self.nodes.iter() {
                let candidate = entry.value();
                if candidate.id() != node.id()
                    && candidate.parent_id().as_deref() == Some(node.id())
                {
                    node.add_child_node(Arc::clone(candidate));
                }
            }
        }
    }

    /// Remove a node: its children move up to its parent first. Removing an
    /// unknown node is a no-op.
    pub fn remove_node(&self, node_id: &str) -> Option<Arc<Node>> {
        let node = self.get_node(node_id)?;
        node.deleting_node(self);
        self.nodes.remove(node_id);
        info!(service = %self.id, node = %node_id, "Removed pubsub node");
        Some(node)
    }

    /// Move `node` under `new_parent`, updating both child maps.
    pub fn reparent(&self, node: &Arc<Node>, new_parent: Option<&str>) {
        if let Some(old) = node.parent_id().and_then(|id| self.get_node(&id)) {
            old.remove_child_node(node.id());
        }
        node.set_parent(new_parent.map(String::from));
        if let Some(parent) = new_parent.and_then(|id| self.get_node(id)) {
            parent.add_child_node(Arc::clone(node));
        }
    }

    /// Ancestor collections, nearest first.
    pub fn ancestors(&self, node: &Node) -> Vec<Arc<Node>> {
        let mut ancestors = Vec::new();
        let mut seen = HashSet::new();
        let mut next = node.parent_id();

        while let Some(parent_id) = next {
            if ancestors.len() >= MAX_HIERARCHY_DEPTH || !seen.insert(parent_id.clone()) {
                break;
            }
            let Some(parent) = self.get_node(&parent_id) else {
                break;
            };
            next = parent.parent_id();
            ancestors.push(parent);
        }

        ancestors
    }

    /// Whether attaching `node_id` under `parent_id` would close a loop.
    pub fn would_create_cycle(&self, node_id: &str, parent_id: &str) -> bool {
        if node_id == parent_id {
            return true;
        }
        match self.get_node(parent_id) {
            Some(parent) => self
                .ancestors(&parent)
                .iter()
                .any(|ancestor| ancestor.id() == node_id),
            None => false,
        }
    }

    /// Register a subscription, starting presence tracking when the node is
    /// presence-based and this is the owner's first unfiltered subscription.
    pub fn add_subscription(&self, node: &Node, subscription: NodeSubscription) {
        let owner = subscription.owner.clone();
        let unfiltered = subscription.presence_states.is_empty();
        let only = node.add_subscription(subscription);

        if node.is_presence_based_delivery() && only && unfiltered {
            self.presence.presence_subscription_required(node, &owner);
        }
    }

    /// Send a notification stanza without waiting for delivery.
    pub fn send_notification(&self, node: &Node, stanza: Element, to: &Jid) {
        let event = stanza
            .children()
            .next()
            .and_then(|event| event.children().next())
            .map(|child| child.name().to_string())
            .unwrap_or_default();
        debug!(service = %self.id, node = %node.id(), to = %to, event = %event, "Sending pubsub notification");
        metrics::record_notification(&event, &self.id.to_string());
        self.router.route(to, stanza);
    }
}
