//! PubSub nodes.
//!
//! A [`Node`] is either a leaf (holds published items) or a collection (holds
//! child nodes). Both kinds own affiliations and subscriptions in concurrent
//! maps; scalar state sits behind short `std::sync::RwLock` sections that are
//! never held across an await point.

mod collection;
mod config;
mod leaf;

pub use collection::{AssociationPolicy, CollectionSettings, CollectionState, MAX_HIERARCHY_DEPTH};
pub use config::{
    AccessModel, NodeConfig, PublishModel, SendLastPublishedItem, DEFAULT_MAX_PAYLOAD_SIZE,
};
pub use leaf::{LeafState, PublishedItem};

use std::fmt;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use jid::{BareJid, Jid};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::affiliation::{Affiliation, NodeAffiliate};
use crate::error::{PersistenceError, PubSubError};
use crate::form::{DataForm, FormField};
use crate::lock;
use crate::persistence::{NodeKey, NodeSnapshot, StoredNode};
use crate::presence::PresenceTracker;
use crate::service::{PubSubService, ServiceId};
use crate::stanzas::NS_PUBSUB_NODE_CONFIG;
use crate::subscription::{NodeSubscription, SubscriptionState};

/// Kind of node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    /// Holds published items.
    #[default]
    Leaf,
    /// Holds child nodes.
    Collection,
}

impl NodeType {
    /// Parse from a `pubsub#node_type` value.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "leaf" => Some(NodeType::Leaf),
            "collection" => Some(NodeType::Collection),
            _ => None,
        }
    }

    /// Attribute value.
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Leaf => "leaf",
            NodeType::Collection => "collection",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kind-specific node state.
#[derive(Debug)]
pub enum NodeKind {
    /// Leaf node items.
    Leaf(LeafState),
    /// Collection node children and settings.
    Collection(CollectionState),
}

/// A subscription removed by [`Node::cancel_subscription`].
#[derive(Debug, Clone)]
pub struct CancelledSubscription {
    /// The removed subscription.
    pub subscription: NodeSubscription,
    /// Whether the owner's `none` affiliation went with it.
    pub affiliation_removed: bool,
}

/// Effects of a committed configuration form.
#[derive(Debug, Default)]
pub struct ConfigureOutcome {
    /// Old and new parent when `pubsub#collection` moved the node.
    pub parent_change: Option<(Option<String>, Option<String>)>,
    /// Affiliations set by `pubsub#owner` / `pubsub#publisher`.
    pub affiliations_set: Vec<NodeAffiliate>,
    /// Affiliations dropped because the JID left the owner/publisher lists.
    pub affiliations_removed: Vec<BareJid>,
    /// Items evicted because the item limit shrank.
    pub evicted_items: Vec<PublishedItem>,
}

/// A validated, not yet applied configuration.
#[derive(Debug, Clone)]
struct StagedConfig {
    config: NodeConfig,
    settings: Option<CollectionSettings>,
    parent: Option<Option<String>>,
    owners: Option<Vec<BareJid>>,
    publishers: Option<Vec<BareJid>>,
}

/// A node of a pubsub service.
#[derive(Debug)]
pub struct Node {
    id: String,
    service_id: ServiceId,
    creator: Jid,
    created_at: DateTime<Utc>,
    modified_at: RwLock<DateTime<Utc>>,
    config: RwLock<NodeConfig>,
    parent: RwLock<Option<String>>,
    affiliates: DashMap<BareJid, NodeAffiliate>,
    subscriptions: DashMap<String, NodeSubscription>,
    kind: NodeKind,
}

impl Node {
    fn new(
        service_id: ServiceId,
        id: impl Into<String>,
        creator: Jid,
        config: NodeConfig,
        kind: NodeKind,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            service_id,
            creator,
            created_at: now,
            modified_at: RwLock::new(now),
            config: RwLock::new(config),
            parent: RwLock::new(None),
            affiliates: DashMap::new(),
            subscriptions: DashMap::new(),
            kind,
        }
    }

    /// Create a leaf node.
    pub fn new_leaf(
        service_id: ServiceId,
        id: impl Into<String>,
        creator: Jid,
        config: NodeConfig,
    ) -> Self {
        Self::new(
            service_id,
            id,
            creator,
            config,
            NodeKind::Leaf(LeafState::default()),
        )
    }

    /// Create a collection node.
    pub fn new_collection(
        service_id: ServiceId,
        id: impl Into<String>,
        creator: Jid,
        config: NodeConfig,
        settings: CollectionSettings,
    ) -> Self {
        Self::new(
            service_id,
            id,
            creator,
            config,
            NodeKind::Collection(CollectionState::new(settings)),
        )
    }

    /// Node ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Owning service.
    pub fn service_id(&self) -> &ServiceId {
        &self.service_id
    }

    /// Persistence key of this node.
    pub fn key(&self) -> NodeKey {
        NodeKey::new(self.service_id.to_string(), self.id.clone())
    }

    /// Entity that created the node.
    pub fn creator(&self) -> &Jid {
        &self.creator
    }

    /// Creation time.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Last modification time.
    pub fn modified_at(&self) -> DateTime<Utc> {
        *lock::read(&self.modified_at)
    }

    fn touch(&self) {
        *lock::write(&self.modified_at) = Utc::now();
    }

    /// Node type.
    pub fn node_type(&self) -> NodeType {
        match self.kind {
            NodeKind::Leaf(_) => NodeType::Leaf,
            NodeKind::Collection(_) => NodeType::Collection,
        }
    }

    /// Whether this is a collection node.
    pub fn is_collection(&self) -> bool {
        matches!(self.kind, NodeKind::Collection(_))
    }

    /// Whether this is a leaf node.
    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Leaf(_))
    }

    /// Leaf state, for leaf nodes.
    pub fn leaf(&self) -> Option<&LeafState> {
        match self.kind {
            NodeKind::Leaf(ref leaf) => Some(leaf),
            NodeKind::Collection(_) => None,
        }
    }

    /// Collection state, for collection nodes.
    pub fn collection(&self) -> Option<&CollectionState> {
        match self.kind {
            NodeKind::Collection(ref collection) => Some(collection),
            NodeKind::Leaf(_) => None,
        }
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> NodeConfig {
        lock::read(&self.config).clone()
    }

    /// Whether notifications only go to online subscribers.
    pub fn is_presence_based_delivery(&self) -> bool {
        lock::read(&self.config).presence_based_delivery
    }

    /// Parent collection ID.
    pub fn parent_id(&self) -> Option<String> {
        lock::read(&self.parent).clone()
    }

    /// Set the parent collection ID. Child maps are maintained by the caller.
    pub fn set_parent(&self, parent: Option<String>) {
        *lock::write(&self.parent) = parent;
    }

    // ------------------------------------------------------------------
    // Affiliations
    // ------------------------------------------------------------------

    /// Affiliation of a JID, `none` when it has no entry.
    pub fn affiliation(&self, jid: &BareJid) -> Affiliation {
        self.affiliates
            .get(jid)
            .map(|entry| entry.affiliation)
            .unwrap_or_default()
    }

    /// Affiliation entry of a JID.
    pub fn affiliate(&self, jid: &BareJid) -> Option<NodeAffiliate> {
        self.affiliates.get(jid).map(|entry| entry.clone())
    }

    /// All affiliation entries.
    pub fn affiliates(&self) -> Vec<NodeAffiliate> {
        self.affiliates.iter().map(|entry| entry.clone()).collect()
    }

    /// JIDs affiliated as owner.
    pub fn owners(&self) -> Vec<BareJid> {
        self.with_affiliation(Affiliation::Owner)
    }

    /// JIDs affiliated as publisher.
    pub fn publishers(&self) -> Vec<BareJid> {
        self.with_affiliation(Affiliation::Publisher)
    }

    fn with_affiliation(&self, affiliation: Affiliation) -> Vec<BareJid> {
        self.affiliates
            .iter()
            .filter(|entry| entry.affiliation == affiliation)
            .map(|entry| entry.jid.clone())
            .collect()
    }

    /// Owner of the node or administrator of its service.
    pub fn is_admin(&self, service: &PubSubService, jid: &BareJid) -> bool {
        self.affiliation(jid) == Affiliation::Owner || service.is_service_admin(jid)
    }

    /// Set a JID's affiliation, creating the entry when missing.
    ///
    /// Setting `none` on a JID without subscriptions drops the entry, so the
    /// effect is the same however often it is applied.
    pub fn upsert_affiliation(&self, jid: BareJid, affiliation: Affiliation) {
        if affiliation == Affiliation::None && !self.has_subscriptions_of(&jid) {
            self.affiliates.remove(&jid);
            return;
        }
        self.affiliates
            .entry(jid.clone())
            .and_modify(|entry| entry.affiliation = affiliation)
            .or_insert_with(|| NodeAffiliate::new(jid, affiliation));
    }

    /// Drop an affiliation. A JID that still holds subscriptions is
    /// downgraded to `none` instead.
    pub fn remove_affiliation(&self, jid: &BareJid) -> Option<NodeAffiliate> {
        if self.has_subscriptions_of(jid) {
            self.upsert_affiliation(jid.clone(), Affiliation::None);
            return self.affiliate(jid);
        }
        self.affiliates.remove(jid).map(|(_, entry)| entry)
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Look up a subscription by ID.
    pub fn subscription(&self, subscription_id: &str) -> Option<NodeSubscription> {
        self.subscriptions
            .get(subscription_id)
            .map(|entry| entry.clone())
    }

    /// All subscriptions.
    pub fn subscriptions(&self) -> Vec<NodeSubscription> {
        self.subscriptions
            .iter()
            .map(|entry| entry.clone())
            .collect()
    }

    /// Subscriptions requested by `owner`.
    pub fn subscriptions_of(&self, owner: &BareJid) -> Vec<NodeSubscription> {
        self.subscriptions
            .iter()
            .filter(|entry| entry.owner == *owner)
            .map(|entry| entry.clone())
            .collect()
    }

    /// Subscriptions delivering to exactly `jid`.
    pub fn subscriptions_for(&self, jid: &Jid) -> Vec<NodeSubscription> {
        self.subscriptions
            .iter()
            .filter(|entry| entry.jid == *jid)
            .map(|entry| entry.clone())
            .collect()
    }

    fn has_subscriptions_of(&self, owner: &BareJid) -> bool {
        self.subscriptions.iter().any(|entry| entry.owner == *owner)
    }

    /// Whether `jid` holds an active subscription, by owner or subscriber.
    pub fn has_active_subscription(&self, jid: &BareJid) -> bool {
        self.subscriptions
            .iter()
            .any(|entry| (entry.owner == *jid || entry.jid.to_bare() == *jid) && entry.is_active())
    }

    /// Insert a subscription as is, making sure its owner is affiliated.
    ///
    /// Returns `true` when it is the owner's only subscription.
    pub fn add_subscription(&self, subscription: NodeSubscription) -> bool {
        let owner = subscription.owner.clone();
        self.affiliates
            .entry(owner.clone())
            .or_insert_with(|| NodeAffiliate::new(owner.clone(), Affiliation::None));
        self.subscriptions
            .insert(subscription.id.clone(), subscription);
        self.subscriptions_of(&owner).len() == 1
    }

    /// Create a subscription for `jid` on behalf of `owner`.
    ///
    /// Node-level rules only; access model checks involving presence or
    /// rosters happen before this is called.
    pub fn create_subscription(
        &self,
        owner: BareJid,
        jid: Jid,
        owner_is_admin: bool,
        options: Option<&DataForm>,
        multiple_allowed: bool,
    ) -> Result<NodeSubscription, PubSubError> {
        let config = self.config();

        if !config.subscription_enabled {
            return Err(PubSubError::FeatureNotImplemented("subscribe"));
        }
        if self.affiliation(&owner) == Affiliation::Outcast {
            return Err(PubSubError::forbidden(format!(
                "{} is an outcast of {}",
                owner, self.id
            )));
        }

        let existing = self.subscriptions_for(&jid);
        if existing.iter().any(NodeSubscription::is_authorization_pending) {
            return Err(PubSubError::PendingSubscription(jid.to_string()));
        }
        if !multiple_allowed {
            if let Some(subscription) = existing.into_iter().next() {
                return Ok(subscription);
            }
        }

        let state = if config.access_model == AccessModel::Authorize && !owner_is_admin {
            SubscriptionState::Pending
        } else if config.subscription_config_required {
            SubscriptionState::Unconfigured
        } else {
            SubscriptionState::Subscribed
        };

        let mut subscription = NodeSubscription::new(
            self.id.clone(),
            NodeSubscription::generate_id(),
            owner,
            jid,
            state,
        );
        if let Some(form) = options {
            let pending = subscription.state == SubscriptionState::Pending;
            subscription.configure(form)?;
            if pending {
                subscription.state = SubscriptionState::Pending;
            }
        }

        debug!(
            node = %self.id,
            subscription = %subscription.id,
            jid = %subscription.jid,
            state = %subscription.state,
            "Created subscription"
        );

        self.add_subscription(subscription.clone());
        Ok(subscription)
    }

    /// Replace a cached subscription with a fresh copy.
    pub fn replace_subscription(&self, subscription: NodeSubscription) {
        self.subscriptions
            .insert(subscription.id.clone(), subscription);
    }

    /// Apply subscription options.
    pub fn configure_subscription(
        &self,
        subscription_id: &str,
        form: &DataForm,
    ) -> Result<NodeSubscription, PubSubError> {
        let mut entry = self
            .subscriptions
            .get_mut(subscription_id)
            .ok_or_else(|| PubSubError::SubscriptionNotFound(subscription_id.to_string()))?;
        entry.configure(form)?;
        Ok(entry.clone())
    }

    /// Owner decision on a pending subscription.
    ///
    /// Approved subscriptions become subscribed (or unconfigured when the
    /// node requires options); denied ones are cancelled.
    pub fn approve_subscription(
        &self,
        subscription_id: &str,
        allow: bool,
        presence: &dyn PresenceTracker,
    ) -> Result<NodeSubscription, PubSubError> {
        let current = self
            .subscription(subscription_id)
            .ok_or_else(|| PubSubError::SubscriptionNotFound(subscription_id.to_string()))?;
        if !current.is_authorization_pending() {
            return Err(PubSubError::bad_request(format!(
                "subscription {} is not pending",
                subscription_id
            )));
        }

        if !allow {
            return self
                .cancel_subscription(subscription_id, presence)
                .map(|cancelled| cancelled.subscription)
                .ok_or_else(|| PubSubError::SubscriptionNotFound(subscription_id.to_string()));
        }

        let required = lock::read(&self.config).subscription_config_required;
        let mut entry = self
            .subscriptions
            .get_mut(subscription_id)
            .ok_or_else(|| PubSubError::SubscriptionNotFound(subscription_id.to_string()))?;
        entry.state = if required {
            SubscriptionState::Unconfigured
        } else {
            SubscriptionState::Subscribed
        };
        Ok(entry.clone())
    }

    /// Remove a subscription. Applying it to an unknown ID is a no-op.
    ///
    /// When the owner has no subscriptions left its `none` affiliation is
    /// dropped, and presence tracking stops on presence-based nodes.
    pub fn cancel_subscription(
        &self,
        subscription_id: &str,
        presence: &dyn PresenceTracker,
    ) -> Option<CancelledSubscription> {
        let (_, subscription) = self.subscriptions.remove(subscription_id)?;
        let owner = subscription.owner.clone();

        let mut affiliation_removed = false;
        if !self.has_subscriptions_of(&owner) {
            if self.affiliation(&owner) == Affiliation::None {
                affiliation_removed = self.affiliates.remove(&owner).is_some();
            }
            if self.is_presence_based_delivery() {
                presence.presence_subscription_not_required(self, &owner);
            }
        }

        debug!(
            node = %self.id,
            subscription = %subscription_id,
            "Cancelled subscription"
        );

        Some(CancelledSubscription {
            subscription,
            affiliation_removed,
        })
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    fn stage_configuration(
        &self,
        service: &PubSubService,
        form: &DataForm,
    ) -> Result<StagedConfig, PubSubError> {
        let mut staged = StagedConfig {
            config: self.config(),
            settings: self.collection().map(CollectionState::settings),
            parent: None,
            owners: None,
            publishers: None,
        };

        for field in &form.fields {
            if staged.config.apply_field(field)? {
                continue;
            }
            if let Some(ref mut settings) = staged.settings {
                if settings.apply_field(field)? {
                    continue;
                }
            }

            match field.var.as_str() {
                "pubsub#collection" => {
                    let new_parent = field
                        .first_value()
                        .filter(|v| !v.is_empty())
                        .map(String::from);
                    if let Some(ref parent_id) = new_parent {
                        self.validate_new_parent(service, parent_id)?;
                    }
                    staged.parent = Some(new_parent);
                }
                "pubsub#owner" => {
                    let owners = parse_jid_list(field);
                    if owners.is_empty() {
                        return Err(PubSubError::not_acceptable(
                            "a node needs at least one owner",
                        ));
                    }
                    staged.owners = Some(owners);
                }
                "pubsub#publisher" => staged.publishers = Some(parse_jid_list(field)),
                _ => {}
            }
        }

        Ok(staged)
    }

    fn validate_new_parent(
        &self,
        service: &PubSubService,
        parent_id: &str,
    ) -> Result<(), PubSubError> {
        if self.parent_id().as_deref() == Some(parent_id) {
            return Ok(());
        }
        let parent = service
            .get_node(parent_id)
            .ok_or_else(|| PubSubError::NodeNotFound(parent_id.to_string()))?;
        if !parent.is_collection() {
            return Err(PubSubError::not_acceptable(format!(
                "{} is not a collection node",
                parent_id
            )));
        }
        if service.would_create_cycle(&self.id, parent_id) {
            return Err(PubSubError::not_acceptable(format!(
                "{} cannot become a child of {}",
                self.id, parent_id
            )));
        }
        if self.is_leaf() && parent.is_max_leaf_node_reached() {
            return Err(PubSubError::MaxLeafNodesReached(parent_id.to_string()));
        }
        Ok(())
    }

    fn commit(self: &Arc<Self>, service: &PubSubService, staged: StagedConfig) -> ConfigureOutcome {
        let mut outcome = ConfigureOutcome::default();

        let limit = staged.config.item_limit();
        *lock::write(&self.config) = staged.config;
        if let Some(leaf) = self.leaf() {
            outcome.evicted_items = leaf.truncate(limit);
        }
        if let (Some(settings), Some(collection)) = (staged.settings, self.collection()) {
            collection.set_settings(settings);
        }

        if let Some(owners) = staged.owners {
            self.replace_affiliation_set(Affiliation::Owner, owners, &mut outcome);
        }
        if let Some(publishers) = staged.publishers {
            self.replace_affiliation_set(Affiliation::Publisher, publishers, &mut outcome);
        }

        if let Some(new_parent) = staged.parent {
            let old_parent = self.parent_id();
            if old_parent != new_parent {
                service.reparent(self, new_parent.as_deref());
                outcome.parent_change = Some((old_parent, new_parent));
            }
        }

        self.touch();
        outcome
    }

    fn replace_affiliation_set(
        &self,
        affiliation: Affiliation,
        jids: Vec<BareJid>,
        outcome: &mut ConfigureOutcome,
    ) {
        for current in self.with_affiliation(affiliation) {
            if !jids.contains(&current) {
                match self.remove_affiliation(&current) {
                    Some(downgraded) => outcome.affiliations_set.push(downgraded),
                    None => outcome.affiliations_removed.push(current),
                }
            }
        }
        for jid in jids {
            if self.affiliation(&jid) != affiliation {
                self.upsert_affiliation(jid.clone(), affiliation);
                outcome
                    .affiliations_set
                    .push(NodeAffiliate::new(jid, affiliation));
            }
        }
    }

    /// Validate and apply a whole configuration form.
    ///
    /// Nothing changes unless every field is valid. Unknown variables are
    /// ignored.
    pub fn configure(
        self: &Arc<Self>,
        service: &PubSubService,
        form: &DataForm,
    ) -> Result<ConfigureOutcome, PubSubError> {
        let staged = self.stage_configuration(service, form)?;
        Ok(self.commit(service, staged))
    }

    /// Apply a single configuration field.
    pub fn configure_field(
        self: &Arc<Self>,
        service: &PubSubService,
        field: &FormField,
    ) -> Result<ConfigureOutcome, PubSubError> {
        let form = DataForm::new(NS_PUBSUB_NODE_CONFIG).with_field(field.clone());
        self.configure(service, &form)
    }

    /// Current configuration as a `pubsub#node_config` form.
    pub fn configuration_form(&self) -> DataForm {
        let mut form = DataForm::new(NS_PUBSUB_NODE_CONFIG);
        form.push(FormField::new("pubsub#node_type", self.node_type().as_str()).with_type("fixed"));
        self.config().append_fields(&mut form, self.is_leaf());
        form.push(
            FormField::new("pubsub#collection", self.parent_id().unwrap_or_default())
                .with_type("text-single"),
        );
        form.push(
            FormField::multi(
                "pubsub#owner",
                self.owners().iter().map(ToString::to_string).collect(),
            )
            .with_type("jid-multi"),
        );
        form.push(
            FormField::multi(
                "pubsub#publisher",
                self.publishers().iter().map(ToString::to_string).collect(),
            )
            .with_type("jid-multi"),
        );
        if let Some(collection) = self.collection() {
            collection.settings().append_fields(&mut form);
        }
        form
    }

    // ------------------------------------------------------------------
    // Persistence records
    // ------------------------------------------------------------------

    /// Node record for a durable store.
    pub fn to_stored(&self) -> StoredNode {
        StoredNode {
            service_id: self.service_id.to_string(),
            node_id: self.id.clone(),
            node_type: self.node_type(),
            parent: self.parent_id(),
            creator: self.creator.to_string(),
            created_at: self.created_at,
            modified_at: self.modified_at(),
            config: self.config(),
            collection: self.collection().map(CollectionState::settings),
        }
    }

    /// Full node state for a durable store.
    pub fn snapshot(&self) -> NodeSnapshot {
        let service_id = self.service_id.to_string();
        NodeSnapshot {
            node: self.to_stored(),
            affiliations: self.affiliates(),
            subscriptions: self.subscriptions(),
            items: self
                .leaf()
                .map(|leaf| {
                    leaf.items(None)
                        .iter()
                        .map(|item| item.to_stored(&service_id))
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    /// Rebuild a node from stored state. Child links are restored when the
    /// node is installed in its service.
    pub fn from_snapshot(snapshot: NodeSnapshot) -> Result<Self, PersistenceError> {
        let stored = snapshot.node;
        let service_id = ServiceId::parse(&stored.service_id).ok_or_else(|| {
            PersistenceError::Corrupt(format!("invalid service id {}", stored.service_id))
        })?;
        let creator = stored.creator.parse::<Jid>().map_err(|e| {
            PersistenceError::Corrupt(format!("node {} creator: {}", stored.node_id, e))
        })?;

        let kind = match stored.node_type {
            NodeType::Leaf => NodeKind::Leaf(LeafState::default()),
            NodeType::Collection => NodeKind::Collection(CollectionState::new(
                stored.collection.unwrap_or_default(),
            )),
        };
        let limit = stored.config.item_limit();

        let node = Self {
            id: stored.node_id,
            service_id,
            creator,
            created_at: stored.created_at,
            modified_at: RwLock::new(stored.modified_at),
            config: RwLock::new(stored.config),
            parent: RwLock::new(stored.parent),
            affiliates: DashMap::new(),
            subscriptions: DashMap::new(),
            kind,
        };

        for affiliate in snapshot.affiliations {
            node.affiliates.insert(affiliate.jid.clone(), affiliate);
        }
        for subscription in snapshot.subscriptions {
            node.subscriptions
                .insert(subscription.id.clone(), subscription);
        }
        if let Some(leaf) = node.leaf() {
            let items = snapshot
                .items
                .iter()
                .map(PublishedItem::from_stored)
                .collect::<Result<Vec<_>, _>>()?;
            leaf.replace_all(items);
            leaf.truncate(limit);
        }

        Ok(node)
    }
}

fn parse_jid_list(field: &FormField) -> Vec<BareJid> {
    field
        .values
        .iter()
        .filter_map(|v| v.parse::<BareJid>().ok())
        .collect()
}
