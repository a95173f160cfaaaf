//! The pubsub engine.
//!
//! [`PubSubEngine`] is what the stream layer calls. Every operation follows
//! the same path: resolve the service and node (loading on cache miss),
//! check the requester's rights, mutate the cached node, queue the change in
//! the persistence gateway, replicate it to the other cluster members and
//! finally notify subscribers.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use jid::{BareJid, Jid};
use minidom::Element;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::affiliation::{Affiliation, NodeAffiliate};
use crate::cluster::{
    ClusterTask, ClusterTransport, StandaloneTransport, TaskExecutor, TaskNode, TaskSubscription,
};
use crate::config::PubSubConfig;
use crate::context::EngineContext;
use crate::dispatch;
use crate::error::PubSubError;
use crate::form::DataForm;
use crate::lock;
use crate::metrics;
use crate::node::{
    AccessModel, CollectionSettings, Node, NodeConfig, NodeType, PublishModel, PublishedItem,
    SendLastPublishedItem,
};
use crate::pep::PepHandler;
use crate::persistence::PubSubStore;
use crate::presence::PresenceTracker;
use crate::router::NotificationRouter;
use crate::service::{PubSubService, ServiceId};
use crate::stanzas;
use crate::subscription::{NodeSubscription, SubscriptionState};

/// A node creation request.
#[derive(Debug, Clone, Default)]
pub struct CreateNodeRequest {
    /// Requested node ID; `None` creates an instant node.
    pub node_id: Option<String>,
    /// Leaf or collection.
    pub node_type: NodeType,
    /// Parent collection.
    pub parent: Option<String>,
    /// Initial configuration.
    pub form: Option<DataForm>,
}

impl CreateNodeRequest {
    /// Request a leaf node.
    pub fn leaf(node_id: impl Into<String>) -> Self {
        Self {
            node_id: Some(node_id.into()),
            ..Self::default()
        }
    }

    /// Request a collection node.
    pub fn collection(node_id: impl Into<String>) -> Self {
        Self {
            node_id: Some(node_id.into()),
            node_type: NodeType::Collection,
            ..Self::default()
        }
    }

    /// Place the node under a collection.
    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    /// Attach an initial configuration form.
    pub fn with_form(mut self, form: DataForm) -> Self {
        self.form = Some(form);
        self
    }

    /// Node type and parent, letting the form override the request fields.
    fn resolved(&self) -> Result<(NodeType, Option<String>, Option<DataForm>), PubSubError> {
        let mut node_type = self.node_type;
        let mut parent = self.parent.clone();
        let mut rest = None;

        if let Some(ref form) = self.form {
            let mut remaining = form.clone();
            remaining.fields.clear();
            for field in &form.fields {
                match field.var.as_str() {
                    "pubsub#node_type" => {
                        let value = field.first_value().unwrap_or_default();
                        node_type = NodeType::from_str(value).ok_or_else(|| {
                            PubSubError::not_acceptable(format!("invalid node type {value}"))
                        })?;
                    }
                    "pubsub#collection" => {
                        parent = field
                            .first_value()
                            .filter(|v| !v.is_empty())
                            .map(String::from);
                    }
                    _ => remaining.push(field.clone()),
                }
            }
            rest = Some(remaining);
        }

        Ok((node_type, parent, rest))
    }
}

/// Publish-subscribe engine of one cluster member.
pub struct PubSubEngine {
    ctx: Arc<EngineContext>,
    transport: Arc<dyn ClusterTransport>,
    cancel: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for PubSubEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSubEngine")
            .field("member", self.transport.local_member())
            .field("context", &self.ctx)
            .finish()
    }
}

impl PubSubEngine {
    /// Create an engine. Nothing runs until [`start`](Self::start).
    pub fn new(
        config: PubSubConfig,
        store: Arc<dyn PubSubStore>,
        router: Arc<dyn NotificationRouter>,
        presence: Arc<dyn PresenceTracker>,
        transport: Arc<dyn ClusterTransport>,
    ) -> Self {
        Self {
            ctx: Arc::new(EngineContext::new(config, store, router, presence)),
            transport,
            cancel: CancellationToken::new(),
            sweeper: Mutex::new(None),
        }
    }

    /// Create an engine that is not part of a cluster.
    pub fn standalone(
        config: PubSubConfig,
        store: Arc<dyn PubSubStore>,
        router: Arc<dyn NotificationRouter>,
        presence: Arc<dyn PresenceTracker>,
    ) -> Self {
        Self::new(
            config,
            store,
            router,
            presence,
            Arc::new(StandaloneTransport::new()),
        )
    }

    /// Shared state, also the cluster task executor.
    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    /// Cluster transport.
    pub fn transport(&self) -> &Arc<dyn ClusterTransport> {
        &self.transport
    }

    /// Load the shared service, accept cluster tasks and start the flush
    /// timer and idle sweep.
    #[instrument(skip_all, fields(member = %self.transport.local_member()))]
    pub async fn start(&self) -> Result<(), PubSubError> {
        let shared = self.ctx.registry.shared();
        self.ctx.load_service_nodes(&shared).await?;

        let executor: Arc<dyn TaskExecutor> = self.ctx.clone();
        self.transport.bind(executor);
        self.ctx.gateway.start();

        let mut sweeper = lock::lock(&self.sweeper);
        if sweeper.is_none() {
            let ctx = Arc::clone(&self.ctx);
            let cancel = self.cancel.clone();
            let period = self.ctx.config.sweep_interval;
            *sweeper = Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            let evicted = ctx.evict_idle_services().await;
                            if evicted > 0 {
                                debug!(evicted, "Swept idle personal services");
                            }
                        }
                    }
                }
            }));
        }

        info!(nodes = shared.nodes().len(), "PubSub engine started");
        Ok(())
    }

    /// Stop background tasks and write everything still queued.
    pub async fn stop(&self) -> Result<(), PubSubError> {
        self.cancel.cancel();
        let sweeper = lock::lock(&self.sweeper).take();
        if let Some(sweeper) = sweeper {
            if let Err(e) = sweeper.await {
                warn!(error = %e, "Idle sweep ended abnormally");
            }
        }
        self.ctx.gateway.shutdown().await?;
        info!("PubSub engine stopped");
        Ok(())
    }

    /// Write this member's pending changes and ask every other member to do
    /// the same.
    pub async fn flush(&self) -> Result<(), PubSubError> {
        self.ctx.gateway.flush_all().await?;
        self.transport
            .do_synchronous_cluster_task(&ClusterTask::Flush { node: None }, false)
            .await;
        Ok(())
    }

    /// Flush one node here, then have peers reload it from storage.
    async fn replicate_node(&self, node: &Node) -> Result<(), PubSubError> {
        self.ctx.gateway.flush_node(&node.key()).await?;
        self.transport
            .broadcast_task(&ClusterTask::RefreshNode(TaskNode::of(node)));
        Ok(())
    }

    /// Flush one node here, then have peers reload one subscription.
    async fn replicate_subscription(
        &self,
        node: &Node,
        subscription: &NodeSubscription,
    ) -> Result<(), PubSubError> {
        self.ctx.gateway.flush_node(&node.key()).await?;
        self.transport
            .broadcast_task(&ClusterTask::ModifySubscription(TaskSubscription::of(
                node,
                subscription,
            )));
        Ok(())
    }

    fn replicate_affiliation(&self, node: &Node, jid: &BareJid, affiliation: Affiliation) {
        self.transport.broadcast_task(&ClusterTask::Affiliation {
            node: TaskNode::of(node),
            jid: jid.clone(),
            affiliation,
        });
    }

    fn require_admin(
        service: &PubSubService,
        node: &Node,
        requester: &BareJid,
    ) -> Result<(), PubSubError> {
        if node.is_admin(service, requester) {
            Ok(())
        } else {
            Err(PubSubError::forbidden(format!(
                "{} does not own {}",
                requester,
                node.id()
            )))
        }
    }

    /// Access model check for reading items and subscribing.
    fn check_access(
        service: &PubSubService,
        node: &Node,
        requester: &BareJid,
        subscribing: bool,
    ) -> Result<(), PubSubError> {
        let affiliation = node.affiliation(requester);
        if affiliation == Affiliation::Outcast {
            return Err(PubSubError::forbidden(format!(
                "{} is an outcast of {}",
                requester,
                node.id()
            )));
        }
        if node.is_admin(service, requester) || affiliation >= Affiliation::Member {
            return Ok(());
        }

        let mut owners = node.owners();
        if let ServiceId::Personal(owner) = service.id() {
            owners.push(owner.clone());
        }
        let presence = service.presence();

        match node.config().access_model {
            AccessModel::Open => Ok(()),
            AccessModel::Presence => {
                if owners
                    .iter()
                    .any(|owner| presence.has_presence_subscription(requester, owner))
                {
                    Ok(())
                } else {
                    Err(PubSubError::PresenceSubscriptionRequired)
                }
            }
            AccessModel::Roster => {
                if owners
                    .iter()
                    .any(|owner| presence.is_roster_contact(owner, requester))
                {
                    Ok(())
                } else {
                    Err(PubSubError::NotInRosterGroup)
                }
            }
            AccessModel::Whitelist => Err(PubSubError::ClosedNode),
            AccessModel::Authorize => {
                if subscribing || node.has_active_subscription(requester) {
                    Ok(())
                } else {
                    Err(PubSubError::forbidden("an approved subscription is required"))
                }
            }
        }
    }

    fn check_publish(
        service: &PubSubService,
        node: &Node,
        publisher: &BareJid,
    ) -> Result<(), PubSubError> {
        let affiliation = node.affiliation(publisher);
        if affiliation == Affiliation::Outcast {
            return Err(PubSubError::forbidden(format!(
                "{} is an outcast of {}",
                publisher,
                node.id()
            )));
        }
        if node.is_admin(service, publisher) || affiliation.can_publish() {
            return Ok(());
        }
        match node.config().publish_model {
            PublishModel::Open => Ok(()),
            PublishModel::Subscribers if node.has_active_subscription(publisher) => Ok(()),
            _ => Err(PubSubError::forbidden(format!(
                "{} may not publish to {}",
                publisher,
                node.id()
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Nodes
    // ------------------------------------------------------------------

    /// Create a node.
    #[instrument(skip_all, fields(service = %service_id, requester = %requester))]
    pub async fn create_node(
        &self,
        service_id: &ServiceId,
        requester: &Jid,
        request: CreateNodeRequest,
    ) -> Result<Arc<Node>, PubSubError> {
        let service = self.ctx.service(service_id).await?;
        let owner = requester.to_bare();

        if service_id.is_personal() && !service.is_service_admin(&owner) {
            return Err(PubSubError::forbidden(
                "only the owner creates nodes in a personal service",
            ));
        }

        let (node_type, parent_id, form) = request.resolved()?;
        let node_id = request
            .node_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        if self.ctx.find_node(&service, &node_id).await?.is_some() {
            return Err(PubSubError::Conflict(format!("node {} exists", node_id)));
        }

        let parent = match parent_id {
            Some(ref parent_id) => {
                let parent = self.ctx.node(&service, parent_id).await?;
                if !parent.is_collection() {
                    return Err(PubSubError::not_acceptable(format!(
                        "{} is not a collection node",
                        parent_id
                    )));
                }
                if !parent.is_association_allowed(&service, &owner) {
                    return Err(PubSubError::forbidden(format!(
                        "{} may not add nodes to {}",
                        owner, parent_id
                    )));
                }
                if node_type == NodeType::Leaf && parent.is_max_leaf_node_reached() {
                    return Err(PubSubError::MaxLeafNodesReached(parent_id.clone()));
                }
                Some(parent)
            }
            None => None,
        };

        let config = match (node_type, service_id.is_personal()) {
            (NodeType::Leaf, true) => PepHandler::config_for_node(&node_id),
            (NodeType::Leaf, false) => NodeConfig::leaf_default(),
            (NodeType::Collection, _) => NodeConfig::collection_default(),
        };
        let node = Arc::new(match node_type {
            NodeType::Leaf => Node::new_leaf(service_id.clone(), node_id, requester.clone(), config),
            NodeType::Collection => Node::new_collection(
                service_id.clone(),
                node_id,
                requester.clone(),
                config,
                CollectionSettings::default(),
            ),
        });
        node.set_parent(parent_id);
        node.upsert_affiliation(owner, Affiliation::Owner);

        if let Some(ref form) = form {
            node.configure(&service, form)?;
        }

        let node = service.try_create_node(node)?;

        self.ctx.gateway.create_node(node.to_stored());
        for affiliate in node.affiliates() {
            self.ctx.gateway.create_affiliation(&node.key(), affiliate);
        }
        self.replicate_node(&node).await?;

        if let Some(parent) = parent {
            parent.child_node_added(&service, &node);
        }

        Ok(node)
    }

    /// Delete a node. Its children move up to its parent.
    #[instrument(skip_all, fields(service = %service_id, requester = %requester, node = %node_id))]
    pub async fn delete_node(
        &self,
        service_id: &ServiceId,
        requester: &Jid,
        node_id: &str,
    ) -> Result<(), PubSubError> {
        let service = self.ctx.service(service_id).await?;
        let node = self.ctx.node(&service, node_id).await?;
        Self::require_admin(&service, &node, &requester.to_bare())?;

        if node.config().notify_delete {
            dispatch::broadcast_node_event(&service, &node, stanzas::build_delete_event(node_id));
        }
        if let Some(parent) = node.parent_id().and_then(|id| service.get_node(&id)) {
            parent.child_node_deleted(&service, &node);
        }

        let children = node.children();
        service.remove_node(node_id);

        if node.is_presence_based_delivery() {
            let owners: HashSet<BareJid> = node
                .subscriptions()
                .into_iter()
                .map(|subscription| subscription.owner)
                .collect();
            for owner in owners {
                service
                    .presence()
                    .presence_subscription_not_required(&node, &owner);
            }
        }

        self.ctx.gateway.remove_node(&node.key());
        for child in &children {
            self.ctx.gateway.update_node(child.to_stored());
        }
        self.transport
            .broadcast_task(&ClusterTask::RemoveNode(TaskNode::of(&node)));
        Ok(())
    }

    /// Apply a configuration form.
    #[instrument(skip_all, fields(service = %service_id, requester = %requester, node = %node_id))]
    pub async fn configure_node(
        &self,
        service_id: &ServiceId,
        requester: &Jid,
        node_id: &str,
        form: &DataForm,
    ) -> Result<(), PubSubError> {
        let service = self.ctx.service(service_id).await?;
        let node = self.ctx.node(&service, node_id).await?;
        let requester = requester.to_bare();
        Self::require_admin(&service, &node, &requester)?;

        let new_parent = form
            .field("pubsub#collection")
            .and_then(|field| field.first_value())
            .filter(|value| !value.is_empty())
            .map(String::from);
        let mut added_to = None;
        if let Some(parent_id) = new_parent {
            if node.parent_id().as_deref() != Some(parent_id.as_str()) {
                let parent = self.ctx.node(&service, &parent_id).await?;
                if parent.is_collection() && !parent.is_association_allowed(&service, &requester) {
                    return Err(PubSubError::forbidden(format!(
                        "{} may not add nodes to {}",
                        requester, parent_id
                    )));
                }
                added_to = Some(parent);
            }
        }

        let outcome = node.configure(&service, form)?;
        let key = node.key();

        self.ctx.gateway.update_node(node.to_stored());
        for affiliate in &outcome.affiliations_set {
            self.ctx.gateway.update_affiliation(&key, affiliate.clone());
        }
        for jid in &outcome.affiliations_removed {
            self.ctx.gateway.remove_affiliation(&key, jid);
        }
        for item in &outcome.evicted_items {
            self.ctx.gateway.remove_item(&key, &item.id);
        }
        self.replicate_node(&node).await?;

        if outcome.parent_change.is_some() {
            if let Some(parent) = added_to {
                parent.child_node_added(&service, &node);
            }
        }

        let config = node.config();
        if config.notify_config {
            let form = node.configuration_form();
            let payload = config.deliver_payloads.then_some(&form);
            dispatch::broadcast_node_event(
                &service,
                &node,
                stanzas::build_configuration_event(node_id, payload),
            );
        }
        Ok(())
    }

    /// Current configuration form of a node.
    pub async fn node_configuration(
        &self,
        service_id: &ServiceId,
        requester: &Jid,
        node_id: &str,
    ) -> Result<DataForm, PubSubError> {
        let service = self.ctx.service(service_id).await?;
        let node = self.ctx.node(&service, node_id).await?;
        Self::require_admin(&service, &node, &requester.to_bare())?;
        Ok(node.configuration_form())
    }

    // ------------------------------------------------------------------
    // Items
    // ------------------------------------------------------------------

    /// Publish an item, creating a PEP node on first publish. Returns the
    /// item ID.
    #[instrument(skip_all, fields(service = %service_id, publisher = %publisher, node = %node_id))]
    pub async fn publish(
        &self,
        service_id: &ServiceId,
        publisher: &Jid,
        node_id: &str,
        item_id: Option<String>,
        payload: Option<Element>,
    ) -> Result<String, PubSubError> {
        let service = self.ctx.service(service_id).await?;
        let publisher_bare = publisher.to_bare();

        let node = match self.ctx.find_node(&service, node_id).await? {
            Some(node) => node,
            None if service_id.is_personal() && service.is_service_admin(&publisher_bare) => {
                debug!(node = %node_id, "Auto-creating PEP node");
                match self
                    .create_node(service_id, publisher, CreateNodeRequest::leaf(node_id))
                    .await
                {
                    Ok(node) => node,
                    Err(PubSubError::Conflict(_)) => self.ctx.node(&service, node_id).await?,
                    Err(e) => return Err(e),
                }
            }
            None => return Err(PubSubError::NodeNotFound(node_id.to_string())),
        };

        let Some(leaf) = node.leaf() else {
            return Err(PubSubError::FeatureNotImplemented("publish"));
        };
        Self::check_publish(&service, &node, &publisher_bare)?;

        let config = node.config();
        let item_id = item_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let item = PublishedItem::new(node_id, item_id.clone(), publisher.clone(), payload);
        let size = item.payload_size();
        if size > config.max_payload_size {
            return Err(PubSubError::PayloadTooBig {
                size,
                max: config.max_payload_size,
            });
        }

        let key = node.key();
        let service_key = service.id().to_string();
        let evicted = leaf.publish(item.clone(), config.item_limit());
        for old in &evicted {
            self.ctx.gateway.remove_item(&key, &old.id);
        }
        self.ctx.gateway.save_item(item.to_stored(&service_key));
        metrics::record_item_published(&service_key);

        let recipients = dispatch::broadcast_publication(&service, &node, &item);
        debug!(node = %node_id, item = %item_id, recipients, "Published item");
        Ok(item_id)
    }

    /// Retract items.
    #[instrument(skip_all, fields(service = %service_id, requester = %requester, node = %node_id))]
    pub async fn retract(
        &self,
        service_id: &ServiceId,
        requester: &Jid,
        node_id: &str,
        item_ids: &[String],
        notify: bool,
    ) -> Result<(), PubSubError> {
        let service = self.ctx.service(service_id).await?;
        let node = self.ctx.node(&service, node_id).await?;
        let Some(leaf) = node.leaf() else {
            return Err(PubSubError::FeatureNotImplemented("retract-items"));
        };
        let requester = requester.to_bare();
        let privileged =
            node.is_admin(&service, &requester) || node.affiliation(&requester).can_publish();

        self.load_items(&node).await?;
        let mut targets = Vec::with_capacity(item_ids.len());
        for item_id in item_ids {
            let item = leaf
                .get(item_id)
                .ok_or_else(|| PubSubError::ItemNotFound(item_id.clone()))?;
            if !privileged && item.publisher.to_bare() != requester {
                return Err(PubSubError::forbidden(format!(
                    "{} did not publish {}",
                    requester, item_id
                )));
            }
            targets.push(item.id);
        }

        let key = node.key();
        for item_id in &targets {
            leaf.retract(item_id);
            self.ctx.gateway.remove_item(&key, item_id);
        }

        if notify || node.config().notify_retract {
            dispatch::broadcast_retraction(&service, &node, &targets);
        }
        Ok(())
    }

    /// Remove every item of a leaf node.
    #[instrument(skip_all, fields(service = %service_id, requester = %requester, node = %node_id))]
    pub async fn purge(
        &self,
        service_id: &ServiceId,
        requester: &Jid,
        node_id: &str,
    ) -> Result<(), PubSubError> {
        let service = self.ctx.service(service_id).await?;
        let node = self.ctx.node(&service, node_id).await?;
        Self::require_admin(&service, &node, &requester.to_bare())?;
        let Some(leaf) = node.leaf() else {
            return Err(PubSubError::FeatureNotImplemented("purge-nodes"));
        };

        let purged = leaf.purge();
        self.ctx.gateway.purge(&node.key());
        debug!(node = %node_id, purged, "Purged node");

        dispatch::broadcast_node_event(&service, &node, stanzas::build_purge_event(node_id));
        Ok(())
    }

    /// Current items of a leaf, read through storage after every member
    /// wrote its pending changes for the node. Oldest first.
    async fn load_items(&self, node: &Node) -> Result<Vec<PublishedItem>, PubSubError> {
        let Some(leaf) = node.leaf() else {
            return Ok(Vec::new());
        };
        let key = node.key();
        self.ctx.gateway.flush_node(&key).await?;
        self.transport
            .do_synchronous_cluster_task(
                &ClusterTask::Flush {
                    node: Some(TaskNode::of(node)),
                },
                false,
            )
            .await;

        let stored = self.ctx.gateway.load_items(&key).await?;
        let mut items = stored
            .iter()
            .map(PublishedItem::from_stored)
            .collect::<Result<Vec<_>, _>>()?;
        if let Some(limit) = node.config().item_limit() {
            if items.len() > limit {
                items.drain(..items.len() - limit);
            }
        }
        leaf.replace_all(items.clone());
        Ok(items)
    }

    /// Retrieve items, newest `max_items` or the listed IDs. Oldest first.
    #[instrument(skip_all, fields(service = %service_id, requester = %requester, node = %node_id))]
    pub async fn items(
        &self,
        service_id: &ServiceId,
        requester: &Jid,
        node_id: &str,
        max_items: Option<usize>,
        item_ids: &[String],
    ) -> Result<Vec<PublishedItem>, PubSubError> {
        let service = self.ctx.service(service_id).await?;
        let node = self.ctx.node(&service, node_id).await?;
        if node.is_collection() {
            return Err(PubSubError::FeatureNotImplemented("retrieve-items"));
        }
        Self::check_access(&service, &node, &requester.to_bare(), false)?;

        let mut items = self.load_items(&node).await?;
        if !item_ids.is_empty() {
            items.retain(|item| item_ids.contains(&item.id));
            if items.is_empty() {
                return Err(PubSubError::ItemNotFound(item_ids.join(",")));
            }
        }
        if let Some(max) = max_items {
            if items.len() > max {
                items.drain(..items.len() - max);
            }
        }
        Ok(items)
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Subscribe `jid` to a node.
    #[instrument(skip_all, fields(service = %service_id, requester = %requester, jid = %jid, node = %node_id))]
    pub async fn subscribe(
        &self,
        service_id: &ServiceId,
        requester: &Jid,
        node_id: &str,
        jid: &Jid,
        options: Option<&DataForm>,
    ) -> Result<NodeSubscription, PubSubError> {
        let service = self.ctx.service(service_id).await?;
        let node = self.ctx.node(&service, node_id).await?;
        let requester_bare = requester.to_bare();
        let owner = jid.to_bare();
        let is_admin = node.is_admin(&service, &requester_bare);

        if owner != requester_bare && !is_admin {
            return Err(PubSubError::InvalidJid(jid.to_string()));
        }
        Self::check_access(&service, &node, &owner, true)?;

        let existing = node.subscriptions_for(jid);
        let had_affiliation = node.affiliate(&owner).is_some();
        let subscription = node.create_subscription(
            owner.clone(),
            jid.clone(),
            node.is_admin(&service, &owner),
            options,
            self.ctx.config.multiple_subscriptions,
        )?;
        if existing.iter().any(|s| s.id == subscription.id) {
            return Ok(subscription);
        }

        if node.is_presence_based_delivery()
            && subscription.presence_states.is_empty()
            && node.subscriptions_of(&owner).len() == 1
        {
            service
                .presence()
                .presence_subscription_required(&node, &owner);
        }

        let key = node.key();
        if !had_affiliation {
            self.ctx
                .gateway
                .create_affiliation(&key, NodeAffiliate::new(owner, Affiliation::None));
        }
        self.ctx
            .gateway
            .create_subscription(&key, subscription.clone());
        self.transport
            .broadcast_task(&ClusterTask::NewSubscription(TaskSubscription::of(
                &node,
                &subscription,
            )));
        if options.is_some() {
            self.replicate_subscription(&node, &subscription).await?;
        }

        if subscription.state == SubscriptionState::Subscribed {
            self.send_last_item(&service, &node, &subscription).await?;
        }
        Ok(subscription)
    }

    async fn send_last_item(
        &self,
        service: &PubSubService,
        node: &Node,
        subscription: &NodeSubscription,
    ) -> Result<bool, PubSubError> {
        if node.config().send_last_published_item == SendLastPublishedItem::Never {
            return Ok(false);
        }
        let Some(last) = self.load_items(node).await?.pop() else {
            return Ok(false);
        };
        if !subscription.can_send_events(node, service.presence()) {
            return Ok(false);
        }
        dispatch::send_item_to(service, node, &last, subscription);
        Ok(true)
    }

    /// Pick the subscription a request refers to.
    fn resolve_subscription(
        node: &Node,
        jid: &Jid,
        subid: Option<&str>,
    ) -> Result<NodeSubscription, PubSubError> {
        let mut candidates = node.subscriptions_for(jid);
        match subid {
            Some(id) => candidates
                .into_iter()
                .find(|subscription| subscription.id == id)
                .ok_or_else(|| PubSubError::SubscriptionNotFound(id.to_string())),
            None => match candidates.len() {
                0 => Err(PubSubError::SubscriptionNotFound(jid.to_string())),
                1 => Ok(candidates.remove(0)),
                _ => Err(PubSubError::bad_request("subid-required")),
            },
        }
    }

    fn check_subscriber(
        service: &PubSubService,
        node: &Node,
        requester: &Jid,
        jid: &Jid,
    ) -> Result<(), PubSubError> {
        let requester = requester.to_bare();
        if jid.to_bare() == requester || node.is_admin(service, &requester) {
            Ok(())
        } else {
            Err(PubSubError::forbidden(format!(
                "{} may not manage subscriptions of {}",
                requester, jid
            )))
        }
    }

    async fn cancel(
        &self,
        service: &PubSubService,
        node: &Node,
        subscription_id: &str,
    ) -> Option<NodeSubscription> {
        let cancelled = node.cancel_subscription(subscription_id, service.presence())?;
        let key = node.key();
        self.ctx.gateway.remove_subscription(&key, subscription_id);
        if cancelled.affiliation_removed {
            self.ctx
                .gateway
                .remove_affiliation(&key, &cancelled.subscription.owner);
        }
        self.transport
            .broadcast_task(&ClusterTask::CancelSubscription(TaskSubscription::of(
                node,
                &cancelled.subscription,
            )));
        Some(cancelled.subscription)
    }

    /// Cancel a subscription.
    #[instrument(skip_all, fields(service = %service_id, requester = %requester, jid = %jid, node = %node_id))]
    pub async fn unsubscribe(
        &self,
        service_id: &ServiceId,
        requester: &Jid,
        node_id: &str,
        jid: &Jid,
        subid: Option<&str>,
    ) -> Result<NodeSubscription, PubSubError> {
        let service = self.ctx.service(service_id).await?;
        let node = self.ctx.node(&service, node_id).await?;
        Self::check_subscriber(&service, &node, requester, jid)?;

        let subscription = Self::resolve_subscription(&node, jid, subid)?;
        self.cancel(&service, &node, &subscription.id)
            .await
            .ok_or_else(|| PubSubError::SubscriptionNotFound(subscription.id))
    }

    /// A subscription with its options.
    pub async fn subscription_options(
        &self,
        service_id: &ServiceId,
        requester: &Jid,
        node_id: &str,
        jid: &Jid,
        subid: Option<&str>,
    ) -> Result<NodeSubscription, PubSubError> {
        let service = self.ctx.service(service_id).await?;
        let node = self.ctx.node(&service, node_id).await?;
        Self::check_subscriber(&service, &node, requester, jid)?;
        Self::resolve_subscription(&node, jid, subid)
    }

    /// Submit subscription options.
    #[instrument(skip_all, fields(service = %service_id, requester = %requester, jid = %jid, node = %node_id))]
    pub async fn configure_subscription(
        &self,
        service_id: &ServiceId,
        requester: &Jid,
        node_id: &str,
        jid: &Jid,
        subid: Option<&str>,
        form: &DataForm,
    ) -> Result<NodeSubscription, PubSubError> {
        let service = self.ctx.service(service_id).await?;
        let node = self.ctx.node(&service, node_id).await?;
        Self::check_subscriber(&service, &node, requester, jid)?;

        let current = Self::resolve_subscription(&node, jid, subid)?;
        let subscription = node.configure_subscription(&current.id, form)?;
        self.ctx
            .gateway
            .update_subscription(&node.key(), subscription.clone());
        self.replicate_subscription(&node, &subscription).await?;
        Ok(subscription)
    }

    /// Owner decision on a pending subscription.
    #[instrument(skip_all, fields(service = %service_id, requester = %requester, node = %node_id))]
    pub async fn approve_subscription(
        &self,
        service_id: &ServiceId,
        requester: &Jid,
        node_id: &str,
        subscription_id: &str,
        allow: bool,
    ) -> Result<NodeSubscription, PubSubError> {
        let service = self.ctx.service(service_id).await?;
        let node = self.ctx.node(&service, node_id).await?;
        Self::require_admin(&service, &node, &requester.to_bare())?;

        let pending = node
            .subscription(subscription_id)
            .ok_or_else(|| PubSubError::SubscriptionNotFound(subscription_id.to_string()))?;
        let subscription = node.approve_subscription(subscription_id, allow, service.presence())?;
        let key = node.key();

        if !allow {
            self.ctx.gateway.remove_subscription(&key, subscription_id);
            if node.affiliate(&pending.owner).is_none() {
                self.ctx.gateway.remove_affiliation(&key, &pending.owner);
            }
            self.transport
                .broadcast_task(&ClusterTask::CancelSubscription(TaskSubscription::of(
                    &node,
                    &pending,
                )));
            return Ok(subscription);
        }

        self.ctx
            .gateway
            .update_subscription(&key, subscription.clone());
        self.replicate_subscription(&node, &subscription).await?;
        if subscription.state == SubscriptionState::Subscribed {
            self.send_last_item(&service, &node, &subscription).await?;
        }
        Ok(subscription)
    }

    /// Send the last published item of every node `jid` is subscribed to
    /// with `on_sub_and_presence`, typically when it comes online.
    pub async fn deliver_last_published_items(
        &self,
        service_id: &ServiceId,
        jid: &Jid,
    ) -> Result<usize, PubSubError> {
        let Some(service) = self.ctx.registry.resolve(service_id) else {
            return Ok(0);
        };
        let mut sent = 0;
        for node in service.nodes() {
            if node.config().send_last_published_item != SendLastPublishedItem::OnSubAndPresence {
                continue;
            }
            for subscription in node.subscriptions_for(jid) {
                if subscription.is_active() && self.send_last_item(&service, &node, &subscription).await? {
                    sent += 1;
                }
            }
        }
        Ok(sent)
    }

    // ------------------------------------------------------------------
    // Owner use cases
    // ------------------------------------------------------------------

    /// Affiliations of a node.
    pub async fn affiliations(
        &self,
        service_id: &ServiceId,
        requester: &Jid,
        node_id: &str,
    ) -> Result<Vec<NodeAffiliate>, PubSubError> {
        let service = self.ctx.service(service_id).await?;
        let node = self.ctx.node(&service, node_id).await?;
        Self::require_admin(&service, &node, &requester.to_bare())?;
        Ok(node.affiliates())
    }

    /// Change affiliations. Outcasts lose their subscriptions; `none`
    /// removes the entry unless the JID is still subscribed.
    #[instrument(skip_all, fields(service = %service_id, requester = %requester, node = %node_id))]
    pub async fn set_affiliations(
        &self,
        service_id: &ServiceId,
        requester: &Jid,
        node_id: &str,
        changes: &[(BareJid, Affiliation)],
    ) -> Result<(), PubSubError> {
        let service = self.ctx.service(service_id).await?;
        let node = self.ctx.node(&service, node_id).await?;
        Self::require_admin(&service, &node, &requester.to_bare())?;

        let mut owners = node.owners();
        for (jid, affiliation) in changes {
            owners.retain(|owner| owner != jid);
            if *affiliation == Affiliation::Owner {
                owners.push(jid.clone());
            }
        }
        if owners.is_empty() {
            return Err(PubSubError::not_acceptable("a node needs at least one owner"));
        }

        let key = node.key();
        for (jid, affiliation) in changes {
            if *affiliation == Affiliation::Outcast {
                for subscription in node.subscriptions_of(jid) {
                    self.cancel(&service, &node, &subscription.id).await;
                }
            }

            let existed = node.affiliate(jid).is_some();
            if *affiliation == Affiliation::None {
                match node.remove_affiliation(jid) {
                    Some(_) if node.affiliate(jid).is_some() => {
                        self.ctx
                            .gateway
                            .update_affiliation(&key, NodeAffiliate::new(jid.clone(), Affiliation::None));
                    }
                    _ => self.ctx.gateway.remove_affiliation(&key, jid),
                }
            } else {
                node.upsert_affiliation(jid.clone(), *affiliation);
                let affiliate = NodeAffiliate::new(jid.clone(), *affiliation);
                if existed {
                    self.ctx.gateway.update_affiliation(&key, affiliate);
                } else {
                    self.ctx.gateway.create_affiliation(&key, affiliate);
                }
            }
            self.replicate_affiliation(&node, jid, *affiliation);
        }
        Ok(())
    }

    /// Subscriptions of a node.
    pub async fn node_subscriptions(
        &self,
        service_id: &ServiceId,
        requester: &Jid,
        node_id: &str,
    ) -> Result<Vec<NodeSubscription>, PubSubError> {
        let service = self.ctx.service(service_id).await?;
        let node = self.ctx.node(&service, node_id).await?;
        Self::require_admin(&service, &node, &requester.to_bare())?;
        Ok(node.subscriptions())
    }

    /// Owner changes to subscriptions: `None` cancels, `Some(state)` sets the
    /// state of the addressed subscription or creates one.
    #[instrument(skip_all, fields(service = %service_id, requester = %requester, node = %node_id))]
    pub async fn set_node_subscriptions(
        &self,
        service_id: &ServiceId,
        requester: &Jid,
        node_id: &str,
        changes: &[(Jid, Option<SubscriptionState>, Option<String>)],
    ) -> Result<(), PubSubError> {
        let service = self.ctx.service(service_id).await?;
        let node = self.ctx.node(&service, node_id).await?;
        Self::require_admin(&service, &node, &requester.to_bare())?;
        let key = node.key();

        for (jid, state, subid) in changes {
            let current = Self::resolve_subscription(&node, jid, subid.as_deref()).ok();
            match (state, current) {
                (None, Some(subscription)) => {
                    self.cancel(&service, &node, &subscription.id).await;
                }
                (None, None) => {}
                (Some(state), Some(mut subscription)) => {
                    subscription.state = *state;
                    node.replace_subscription(subscription.clone());
                    self.ctx.gateway.update_subscription(&key, subscription.clone());
                    self.replicate_subscription(&node, &subscription).await?;
                }
                (Some(state), None) => {
                    let owner = jid.to_bare();
                    let had_affiliation = node.affiliate(&owner).is_some();
                    let subscription = NodeSubscription::new(
                        node_id,
                        NodeSubscription::generate_id(),
                        owner.clone(),
                        jid.clone(),
                        *state,
                    );
                    service.add_subscription(&node, subscription.clone());
                    if !had_affiliation {
                        self.ctx
                            .gateway
                            .create_affiliation(&key, NodeAffiliate::new(owner, Affiliation::None));
                    }
                    self.ctx
                        .gateway
                        .create_subscription(&key, subscription.clone());
                    self.transport
                        .broadcast_task(&ClusterTask::NewSubscription(TaskSubscription::of(
                            &node,
                            &subscription,
                        )));
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------

    /// disco#items entries: root nodes of the service, children of a
    /// collection, or item names of a leaf.
    pub async fn disco_items(
        &self,
        service_id: &ServiceId,
        requester: &Jid,
        node_id: Option<&str>,
    ) -> Result<Vec<Element>, PubSubError> {
        let service = self.ctx.service(service_id).await?;

        let nodes = match node_id {
            None => service.root_nodes(),
            Some(node_id) => {
                let node = self.ctx.node(&service, node_id).await?;
                if node.is_leaf() {
                    Self::check_access(&service, &node, &requester.to_bare(), false)?;
                    let items = self.load_items(&node).await?;
                    return Ok(items
                        .iter()
                        .map(|item| {
                            stanzas::build_disco_item(service.address(), None, Some(&item.id))
                        })
                        .collect());
                }
                node.children()
            }
        };

        let mut nodes = nodes;
        nodes.sort_by(|a, b| a.id().cmp(b.id()));
        Ok(nodes
            .iter()
            .map(|node| {
                let title = node.config().title;
                stanzas::build_disco_item(service.address(), Some(node.id()), title.as_deref())
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::form::FormField;
    use crate::persistence::InMemoryPubSubStore;
    use crate::presence::InMemoryPresence;
    use crate::router::{ChannelRouter, OutboundStanza};
    use crate::stanzas::{NS_PUBSUB_EVENT, NS_PUBSUB_NODE_CONFIG};

    struct Harness {
        engine: PubSubEngine,
        presence: Arc<InMemoryPresence>,
        rx: mpsc::Receiver<OutboundStanza>,
    }

    impl Harness {
        fn drain(&mut self) -> Vec<OutboundStanza> {
            let mut out = Vec::new();
            while let Ok(stanza) = self.rx.try_recv() {
                out.push(stanza);
            }
            out
        }
    }

    async fn harness() -> Harness {
        let (router, rx) = ChannelRouter::new(64);
        let presence = Arc::new(InMemoryPresence::new());
        let engine = PubSubEngine::standalone(
            PubSubConfig::default(),
            Arc::new(InMemoryPubSubStore::new()),
            Arc::new(router),
            presence.clone(),
        );
        engine.start().await.expect("start");
        Harness {
            engine,
            presence,
            rx,
        }
    }

    fn jid(s: &str) -> Jid {
        s.parse().expect("valid jid")
    }

    fn bare(s: &str) -> BareJid {
        s.parse().expect("valid jid")
    }

    fn payload(text: &str) -> Element {
        Element::builder("entry", "urn:example").append(text).build()
    }

    #[tokio::test]
    async fn test_publish_notifies_and_items_reads_back() {
        let mut h = harness().await;
        let owner = jid("hamlet@denmark.lit/elsinore");
        h.engine
            .create_node(&ServiceId::Shared, &owner, CreateNodeRequest::leaf("musings"))
            .await
            .expect("create");
        h.engine
            .subscribe(
                &ServiceId::Shared,
                &jid("horatio@denmark.lit"),
                "musings",
                &jid("horatio@denmark.lit"),
                None,
            )
            .await
            .expect("subscribe");

        let id = h
            .engine
            .publish(&ServiceId::Shared, &owner, "musings", None, Some(payload("to be")))
            .await
            .expect("publish");

        let out = h.drain();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to, jid("horatio@denmark.lit"));
        assert!(out[0].stanza.get_child("event", NS_PUBSUB_EVENT).is_some());

        let items = h
            .engine
            .items(&ServiceId::Shared, &owner, "musings", None, &[])
            .await
            .expect("items");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, id);
    }

    #[tokio::test]
    async fn test_publishers_model_rejects_strangers() {
        let h = harness().await;
        h.engine
            .create_node(
                &ServiceId::Shared,
                &jid("hamlet@denmark.lit"),
                CreateNodeRequest::leaf("musings"),
            )
            .await
            .expect("create");

        let result = h
            .engine
            .publish(
                &ServiceId::Shared,
                &jid("iago@venice.lit"),
                "musings",
                None,
                None,
            )
            .await;
        assert!(matches!(result, Err(PubSubError::Forbidden(_))));
    }

    #[tokio::test]
    async fn test_duplicate_node_conflicts() {
        let h = harness().await;
        let owner = jid("hamlet@denmark.lit");
        h.engine
            .create_node(&ServiceId::Shared, &owner, CreateNodeRequest::leaf("n"))
            .await
            .expect("create");
        assert!(matches!(
            h.engine
                .create_node(&ServiceId::Shared, &owner, CreateNodeRequest::leaf("n"))
                .await,
            Err(PubSubError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_instant_node_gets_generated_id() {
        let h = harness().await;
        let node = h
            .engine
            .create_node(
                &ServiceId::Shared,
                &jid("hamlet@denmark.lit"),
                CreateNodeRequest::default(),
            )
            .await
            .expect("create");
        assert!(!node.id().is_empty());
    }

    #[tokio::test]
    async fn test_pep_publish_auto_creates() {
        let h = harness().await;
        let juliet = jid("juliet@capulet.lit/balcony");
        let service = ServiceId::Personal(juliet.to_bare());

        h.engine
            .publish(
                &service,
                &juliet,
                "http://jabber.org/protocol/mood",
                None,
                Some(Element::builder("mood", "http://jabber.org/protocol/mood").build()),
            )
            .await
            .expect("publish");

        let node = h
            .engine
            .context()
            .registry
            .resolve(&service)
            .and_then(|s| s.get_node("http://jabber.org/protocol/mood"))
            .expect("auto-created");
        assert_eq!(node.config().access_model, AccessModel::Presence);
        assert_eq!(node.affiliation(&juliet.to_bare()), Affiliation::Owner);

        let stranger = h
            .engine
            .publish(&service, &jid("romeo@montague.lit"), "other", None, None)
            .await;
        assert!(matches!(stranger, Err(PubSubError::NodeNotFound(_))));
    }

    #[tokio::test]
    async fn test_payload_size_limit() {
        let h = harness().await;
        let owner = jid("hamlet@denmark.lit");
        let form = DataForm::new(NS_PUBSUB_NODE_CONFIG)
            .with_field(FormField::new("pubsub#max_payload_size", "16"));
        h.engine
            .create_node(
                &ServiceId::Shared,
                &owner,
                CreateNodeRequest::leaf("small").with_form(form),
            )
            .await
            .expect("create");

        let result = h
            .engine
            .publish(
                &ServiceId::Shared,
                &owner,
                "small",
                None,
                Some(payload("this payload is well beyond sixteen bytes")),
            )
            .await;
        assert!(matches!(result, Err(PubSubError::PayloadTooBig { max: 16, .. })));
    }

    #[tokio::test]
    async fn test_presence_access_model() {
        let h = harness().await;
        let juliet = jid("juliet@capulet.lit");
        let service = ServiceId::Personal(juliet.to_bare());
        h.engine
            .publish(&service, &juliet, "mood", None, None)
            .await
            .expect("publish");

        let romeo = jid("romeo@montague.lit/garden");
        assert!(matches!(
            h.engine.subscribe(&service, &romeo, "mood", &romeo, None).await,
            Err(PubSubError::PresenceSubscriptionRequired)
        ));

        h.presence
            .add_presence_subscription(romeo.to_bare(), juliet.to_bare());
        h.engine
            .subscribe(&service, &romeo, "mood", &romeo, None)
            .await
            .expect("subscribe");
    }

    #[tokio::test]
    async fn test_authorize_model_needs_approval() {
        let mut h = harness().await;
        let owner = jid("hamlet@denmark.lit");
        let form = DataForm::new(NS_PUBSUB_NODE_CONFIG)
            .with_field(FormField::new("pubsub#access_model", "authorize"));
        h.engine
            .create_node(
                &ServiceId::Shared,
                &owner,
                CreateNodeRequest::leaf("private").with_form(form),
            )
            .await
            .expect("create");
        h.engine
            .publish(&ServiceId::Shared, &owner, "private", Some("one".into()), None)
            .await
            .expect("publish");

        let horatio = jid("horatio@denmark.lit");
        let pending = h
            .engine
            .subscribe(&ServiceId::Shared, &horatio, "private", &horatio, None)
            .await
            .expect("subscribe");
        assert_eq!(pending.state, SubscriptionState::Pending);
        assert!(h.drain().is_empty());

        let approved = h
            .engine
            .approve_subscription(&ServiceId::Shared, &owner, "private", &pending.id, true)
            .await
            .expect("approve");
        assert_eq!(approved.state, SubscriptionState::Subscribed);

        // Last published item goes out on approval.
        let out = h.drain();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to, horatio);
    }

    #[tokio::test]
    async fn test_outcast_loses_subscriptions() {
        let h = harness().await;
        let owner = jid("hamlet@denmark.lit");
        h.engine
            .create_node(&ServiceId::Shared, &owner, CreateNodeRequest::leaf("n"))
            .await
            .expect("create");
        let iago = jid("iago@venice.lit");
        h.engine
            .subscribe(&ServiceId::Shared, &iago, "n", &iago, None)
            .await
            .expect("subscribe");

        h.engine
            .set_affiliations(
                &ServiceId::Shared,
                &owner,
                "n",
                &[(iago.to_bare(), Affiliation::Outcast)],
            )
            .await
            .expect("set");

        let subs = h
            .engine
            .node_subscriptions(&ServiceId::Shared, &owner, "n")
            .await
            .expect("subscriptions");
        assert!(subs.is_empty());
        assert!(matches!(
            h.engine
                .subscribe(&ServiceId::Shared, &iago, "n", &iago, None)
                .await,
            Err(PubSubError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_last_owner_cannot_be_removed() {
        let h = harness().await;
        let owner = jid("hamlet@denmark.lit");
        h.engine
            .create_node(&ServiceId::Shared, &owner, CreateNodeRequest::leaf("n"))
            .await
            .expect("create");
        let result = h
            .engine
            .set_affiliations(
                &ServiceId::Shared,
                &owner,
                "n",
                &[(bare("hamlet@denmark.lit"), Affiliation::None)],
            )
            .await;
        assert!(matches!(result, Err(PubSubError::NotAcceptable(_))));
    }

    #[tokio::test]
    async fn test_unsubscribe_requires_subid_when_ambiguous() {
        let h = harness().await;
        let owner = jid("hamlet@denmark.lit");
        h.engine
            .create_node(&ServiceId::Shared, &owner, CreateNodeRequest::leaf("n"))
            .await
            .expect("create");
        let horatio = jid("horatio@denmark.lit");
        let first = h
            .engine
            .subscribe(&ServiceId::Shared, &horatio, "n", &horatio, None)
            .await
            .expect("subscribe");
        h.engine
            .subscribe(&ServiceId::Shared, &horatio, "n", &horatio, None)
            .await
            .expect("subscribe");

        assert!(matches!(
            h.engine
                .unsubscribe(&ServiceId::Shared, &horatio, "n", &horatio, None)
                .await,
            Err(PubSubError::BadRequest(_))
        ));
        let cancelled = h
            .engine
            .unsubscribe(&ServiceId::Shared, &horatio, "n", &horatio, Some(&first.id))
            .await
            .expect("unsubscribe");
        assert_eq!(cancelled.id, first.id);
    }

    #[tokio::test]
    async fn test_delete_reparents_and_notifies() {
        let mut h = harness().await;
        let owner = jid("hamlet@denmark.lit");
        let shared = ServiceId::Shared;
        h.engine
            .create_node(&shared, &owner, CreateNodeRequest::collection("p"))
            .await
            .expect("create p");
        h.engine
            .create_node(&shared, &owner, CreateNodeRequest::collection("c").with_parent("p"))
            .await
            .expect("create c");
        h.engine
            .create_node(&shared, &owner, CreateNodeRequest::leaf("x").with_parent("c"))
            .await
            .expect("create x");
        let watcher = jid("watcher@denmark.lit");
        h.engine
            .subscribe(&shared, &watcher, "c", &watcher, None)
            .await
            .expect("subscribe");
        h.drain();

        h.engine.delete_node(&shared, &owner, "c").await.expect("delete");

        let service = h.engine.context().registry.shared();
        let p = service.get_node("p").expect("p");
        let x = service.get_node("x").expect("x");
        assert!(p.is_child_node(&x));
        assert_eq!(x.parent_id().as_deref(), Some("p"));

        let out = h.drain();
        assert!(out.iter().any(|o| o.to == watcher));

        h.engine.flush().await.expect("flush");
        let stored = h
            .engine
            .context()
            .gateway
            .load_node(&x.key())
            .await
            .expect("load")
            .expect("x stored");
        assert_eq!(stored.node.parent.as_deref(), Some("p"));
    }

    #[tokio::test]
    async fn test_configure_rejects_cycle() {
        let h = harness().await;
        let owner = jid("hamlet@denmark.lit");
        let shared = ServiceId::Shared;
        h.engine
            .create_node(&shared, &owner, CreateNodeRequest::collection("root"))
            .await
            .expect("create");
        h.engine
            .create_node(&shared, &owner, CreateNodeRequest::collection("a").with_parent("root"))
            .await
            .expect("create");

        let form = DataForm::new(NS_PUBSUB_NODE_CONFIG)
            .with_field(FormField::new("pubsub#collection", "a"));
        assert!(matches!(
            h.engine.configure_node(&shared, &owner, "root", &form).await,
            Err(PubSubError::NotAcceptable(_))
        ));
    }

    #[tokio::test]
    async fn test_disco_items_lists_roots_children_and_items() {
        let h = harness().await;
        let owner = jid("hamlet@denmark.lit");
        let shared = ServiceId::Shared;
        h.engine
            .create_node(&shared, &owner, CreateNodeRequest::collection("root"))
            .await
            .expect("create");
        h.engine
            .create_node(&shared, &owner, CreateNodeRequest::leaf("leaf").with_parent("root"))
            .await
            .expect("create");
        h.engine
            .publish(&shared, &owner, "leaf", Some("i1".into()), None)
            .await
            .expect("publish");

        let roots = h.engine.disco_items(&shared, &owner, None).await.expect("roots");
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].attr("node"), Some("root"));

        let children = h
            .engine
            .disco_items(&shared, &owner, Some("root"))
            .await
            .expect("children");
        assert_eq!(children[0].attr("node"), Some("leaf"));

        let items = h
            .engine
            .disco_items(&shared, &owner, Some("leaf"))
            .await
            .expect("items");
        assert_eq!(items[0].attr("name"), Some("i1"));
        assert_eq!(items[0].attr("node"), None);
    }
}
