//! Cluster replication of the pubsub node cache.
//!
//! Every mutation that other members must see is wrapped in a [`ClusterTask`],
//! executed locally, and shipped to peers by a [`ClusterTransport`]. Tasks
//! carry identifiers and scalar values only; each member re-resolves the
//! service and node against its own cache, and a node it does not hold is
//! skipped silently.

mod codec;
mod transport;

pub use codec::{decode_task, encode_task, CodecError, TASK_FORMAT_VERSION};
pub use transport::{
    ClusterError, ClusterTransport, InProcessCluster, InProcessTransport, MemberId,
    StandaloneTransport, TaskExecutor, TaskReply,
};

use std::sync::Arc;

use jid::{BareJid, Jid};
use tracing::{debug, warn};

use crate::affiliation::Affiliation;
use crate::context::EngineContext;
use crate::metrics;
use crate::node::Node;
use crate::persistence::NodeKey;
use crate::service::{PubSubService, ServiceId};
use crate::subscription::{NodeSubscription, SubscriptionState};

/// Local result of running a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The task changed local state.
    Applied,
    /// The target service or node is not cached here.
    Skipped,
}

/// A node addressed by identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskNode {
    /// Service ID string (`pubsub` or a bare JID).
    pub service_id: String,
    /// Node ID.
    pub node_id: String,
}

impl TaskNode {
    /// Address a node.
    pub fn new(service_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            node_id: node_id.into(),
        }
    }

    /// Address of a cached node.
    pub fn of(node: &Node) -> Self {
        Self::new(node.service_id().to_string(), node.id())
    }

    /// Persistence key of the node.
    pub fn key(&self) -> NodeKey {
        NodeKey::new(self.service_id.clone(), self.node_id.clone())
    }

    fn service(&self, ctx: &EngineContext) -> Option<Arc<PubSubService>> {
        let id = ServiceId::parse(&self.service_id)?;
        ctx.registry.resolve(&id)
    }

    fn resolve(&self, ctx: &EngineContext) -> Option<(Arc<PubSubService>, Arc<Node>)> {
        let service = self.service(ctx)?;
        let node = service.get_node(&self.node_id)?;
        Some((service, node))
    }
}

/// The replicated fields of a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSubscription {
    /// Node the subscription belongs to.
    pub node: TaskNode,
    /// Subscription ID.
    pub subscription_id: String,
    /// Owner bare JID.
    pub owner: BareJid,
    /// Subscribed JID.
    pub jid: Jid,
    /// Subscription state.
    pub state: SubscriptionState,
}

impl TaskSubscription {
    /// Capture a subscription of `node`.
    pub fn of(node: &Node, subscription: &NodeSubscription) -> Self {
        Self {
            node: TaskNode::of(node),
            subscription_id: subscription.id.clone(),
            owner: subscription.owner.clone(),
            jid: subscription.jid.clone(),
            state: subscription.state,
        }
    }

    /// Rebuild an equivalent subscription with default options.
    pub fn to_subscription(&self) -> NodeSubscription {
        NodeSubscription::new(
            self.node.node_id.clone(),
            self.subscription_id.clone(),
            self.owner.clone(),
            self.jid.clone(),
            self.state,
        )
    }
}

/// Replicated pubsub mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterTask {
    /// Upsert an affiliation.
    Affiliation {
        /// Target node.
        node: TaskNode,
        /// Affiliated bare JID.
        jid: BareJid,
        /// New affiliation.
        affiliation: Affiliation,
    },
    /// Add a subscription from its replicated fields.
    NewSubscription(TaskSubscription),
    /// Reload a subscription from storage.
    ModifySubscription(TaskSubscription),
    /// Cancel a subscription.
    CancelSubscription(TaskSubscription),
    /// Reload a whole node from storage.
    RefreshNode(TaskNode),
    /// Drop a node from the local cache.
    RemoveNode(TaskNode),
    /// Write this member's pending changes, optionally for one node only.
    Flush {
        /// Node to flush, or everything.
        node: Option<TaskNode>,
    },
}

impl ClusterTask {
    /// Short name for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ClusterTask::Affiliation { .. } => "affiliation",
            ClusterTask::NewSubscription(_) => "new_subscription",
            ClusterTask::ModifySubscription(_) => "modify_subscription",
            ClusterTask::CancelSubscription(_) => "cancel_subscription",
            ClusterTask::RefreshNode(_) => "refresh_node",
            ClusterTask::RemoveNode(_) => "remove_node",
            ClusterTask::Flush { .. } => "flush",
        }
    }

    /// Apply the task against this member's cache.
    pub async fn run(&self, ctx: &EngineContext) -> TaskOutcome {
        let outcome = self.apply(ctx).await;
        debug!(task = self.kind(), outcome = ?outcome, "Ran cluster task");
        metrics::record_cluster_task(self.kind(), outcome == TaskOutcome::Applied);
        outcome
    }

    async fn apply(&self, ctx: &EngineContext) -> TaskOutcome {
        match self {
            ClusterTask::Affiliation {
                node,
                jid,
                affiliation,
            } => {
                let Some((_, node)) = node.resolve(ctx) else {
                    return TaskOutcome::Skipped;
                };
                node.upsert_affiliation(jid.clone(), *affiliation);
                TaskOutcome::Applied
            }

            ClusterTask::NewSubscription(task) => {
                let Some((service, node)) = task.node.resolve(ctx) else {
                    return TaskOutcome::Skipped;
                };
                service.add_subscription(&node, task.to_subscription());
                if let Err(e) = ctx.gateway.flush_all().await {
                    warn!(error = %e, "Flush after replicated subscription failed");
                }
                TaskOutcome::Applied
            }

            ClusterTask::ModifySubscription(task) => {
                let Some((_, node)) = task.node.resolve(ctx) else {
                    return TaskOutcome::Skipped;
                };
                match ctx
                    .gateway
                    .load_subscription(&task.node.key(), &task.subscription_id)
                    .await
                {
                    Ok(Some(subscription)) => {
                        node.replace_subscription(subscription);
                        TaskOutcome::Applied
                    }
                    Ok(None) => TaskOutcome::Skipped,
                    Err(e) => {
                        warn!(
                            node = %task.node.node_id,
                            subscription = %task.subscription_id,
                            error = %e,
                            "Failed to reload subscription"
                        );
                        TaskOutcome::Skipped
                    }
                }
            }

            ClusterTask::CancelSubscription(task) => {
                let Some((service, node)) = task.node.resolve(ctx) else {
                    return TaskOutcome::Skipped;
                };
                match node.cancel_subscription(&task.subscription_id, service.presence()) {
                    Some(_) => TaskOutcome::Applied,
                    None => TaskOutcome::Skipped,
                }
            }

            ClusterTask::RefreshNode(target) => {
                let Some(service) = target.service(ctx) else {
                    return TaskOutcome::Skipped;
                };
                match ctx.gateway.load_node(&target.key()).await {
                    Ok(Some(snapshot)) => match Node::from_snapshot(snapshot) {
                        Ok(node) => {
                            service.install_node(Arc::new(node));
                            TaskOutcome::Applied
                        }
                        Err(e) => {
                            warn!(node = %target.node_id, error = %e, "Stored node is corrupt");
                            TaskOutcome::Skipped
                        }
                    },
                    Ok(None) => TaskOutcome::Skipped,
                    Err(e) => {
                        warn!(node = %target.node_id, error = %e, "Failed to reload node");
                        TaskOutcome::Skipped
                    }
                }
            }

            ClusterTask::RemoveNode(target) => {
                let Some(service) = target.service(ctx) else {
                    return TaskOutcome::Skipped;
                };
                match service.remove_node(&target.node_id) {
                    Some(_) => TaskOutcome::Applied,
                    None => TaskOutcome::Skipped,
                }
            }

            ClusterTask::Flush { node } => {
                let result = match node {
                    Some(target) => ctx.gateway.flush_node(&target.key()).await,
                    None => ctx.gateway.flush_all().await,
                };
                match result {
                    Ok(()) => TaskOutcome::Applied,
                    Err(e) => {
                        warn!(error = %e, "Cluster flush failed");
                        TaskOutcome::Skipped
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PubSubConfig;
    use crate::node::NodeConfig;
    use crate::persistence::{InMemoryPubSubStore, PubSubStore};
    use crate::presence::{InMemoryPresence, PresenceTracker};
    use crate::router::ChannelRouter;

    fn context() -> EngineContext {
        let (router, _rx) = ChannelRouter::new(16);
        EngineContext::new(
            PubSubConfig::default(),
            Arc::new(InMemoryPubSubStore::new()),
            Arc::new(router),
            Arc::new(InMemoryPresence::new()),
        )
    }

    fn bare(s: &str) -> BareJid {
        s.parse().expect("valid jid")
    }

    fn presence_context() -> (EngineContext, Arc<InMemoryPresence>, Arc<Node>) {
        let (router, _rx) = ChannelRouter::new(16);
        let presence = Arc::new(InMemoryPresence::new());
        let ctx = EngineContext::new(
            PubSubConfig::default(),
            Arc::new(InMemoryPubSubStore::new()),
            Arc::new(router),
            presence.clone(),
        );
        let node = ctx.registry.shared().create_node(Node::new_leaf(
            ServiceId::Shared,
            "status",
            "owner@example.com".parse().expect("valid jid"),
            NodeConfig::pep_default(),
        ));
        (ctx, presence, node)
    }

    fn new_subscription(id: &str, jid: &str) -> ClusterTask {
        let jid: Jid = jid.parse().expect("valid jid");
        ClusterTask::NewSubscription(TaskSubscription {
            node: TaskNode::new("pubsub", "status"),
            subscription_id: id.to_string(),
            owner: jid.to_bare(),
            jid,
            state: SubscriptionState::Subscribed,
        })
    }

    fn add_leaf(ctx: &EngineContext, id: &str) -> Arc<Node> {
        let service = ctx.registry.shared();
        service.create_node(Node::new_leaf(
            ServiceId::Shared,
            id,
            "owner@example.com".parse().expect("valid jid"),
            NodeConfig::leaf_default(),
        ))
    }

    #[tokio::test]
    async fn test_affiliation_task_is_idempotent() {
        let ctx = context();
        let node = add_leaf(&ctx, "news");
        let task = ClusterTask::Affiliation {
            node: TaskNode::new("pubsub", "news"),
            jid: bare("romeo@montague.lit"),
            affiliation: Affiliation::Publisher,
        };

        assert_eq!(task.run(&ctx).await, TaskOutcome::Applied);
        assert_eq!(task.run(&ctx).await, TaskOutcome::Applied);

        let matching: Vec<_> = node
            .affiliates()
            .into_iter()
            .filter(|a| a.jid == bare("romeo@montague.lit"))
            .collect();
        assert_eq!(matching.len(), 1);
        assert_eq!(matching[0].affiliation, Affiliation::Publisher);
    }

    #[tokio::test]
    async fn test_tasks_on_absent_node_are_skipped() {
        let ctx = context();
        let node = TaskNode::new("pubsub", "missing");
        let subscription = TaskSubscription {
            node: node.clone(),
            subscription_id: "s1".to_string(),
            owner: bare("a@example.com"),
            jid: "a@example.com".parse().expect("valid jid"),
            state: SubscriptionState::Subscribed,
        };

        for task in [
            ClusterTask::Affiliation {
                node: node.clone(),
                jid: bare("a@example.com"),
                affiliation: Affiliation::Member,
            },
            ClusterTask::NewSubscription(subscription.clone()),
            ClusterTask::ModifySubscription(subscription.clone()),
            ClusterTask::CancelSubscription(subscription),
            ClusterTask::RefreshNode(node.clone()),
            ClusterTask::RemoveNode(node),
        ] {
            assert_eq!(task.run(&ctx).await, TaskOutcome::Skipped, "{}", task.kind());
        }
        assert!(ctx.registry.shared().get_node("missing").is_none());
    }

    #[tokio::test]
    async fn test_uncached_personal_service_is_skipped() {
        let ctx = context();
        let task = ClusterTask::RemoveNode(TaskNode::new("juliet@capulet.lit", "mood"));
        assert_eq!(task.run(&ctx).await, TaskOutcome::Skipped);
        assert!(ctx
            .registry
            .resolve(&ServiceId::Personal(bare("juliet@capulet.lit")))
            .is_none());
    }

    #[tokio::test]
    async fn test_new_subscription_adds_none_affiliation() {
        let ctx = context();
        let node = add_leaf(&ctx, "news");
        let task = ClusterTask::NewSubscription(TaskSubscription {
            node: TaskNode::new("pubsub", "news"),
            subscription_id: "s1".to_string(),
            owner: bare("a@example.com"),
            jid: "a@example.com/desk".parse().expect("valid jid"),
            state: SubscriptionState::Subscribed,
        });

        assert_eq!(task.run(&ctx).await, TaskOutcome::Applied);
        assert_eq!(node.affiliation(&bare("a@example.com")), Affiliation::None);
        assert!(node.affiliate(&bare("a@example.com")).is_some());
        assert!(node.subscription("s1").is_some());
    }

    #[tokio::test]
    async fn test_cancel_subscription_task_is_idempotent() {
        let ctx = context();
        let node = add_leaf(&ctx, "news");
        let subscription = node
            .create_subscription(
                bare("a@example.com"),
                "a@example.com".parse().expect("valid jid"),
                false,
                None,
                true,
            )
            .expect("subscribe");
        let task = ClusterTask::CancelSubscription(TaskSubscription::of(&node, &subscription));

        assert_eq!(task.run(&ctx).await, TaskOutcome::Applied);
        assert_eq!(task.run(&ctx).await, TaskOutcome::Skipped);
        assert!(node.affiliate(&bare("a@example.com")).is_none());
    }

    #[tokio::test]
    async fn test_new_subscription_tracks_presence_for_first_subscription() {
        let (ctx, presence, node) = presence_context();
        let romeo = bare("romeo@montague.lit");

        let task = new_subscription("s1", "romeo@montague.lit/orchard");
        assert_eq!(task.run(&ctx).await, TaskOutcome::Applied);
        assert!(presence.is_tracking("status", &romeo));

        presence.presence_subscription_not_required(&node, &romeo);
        let second = new_subscription("s2", "romeo@montague.lit/chamber");
        assert_eq!(second.run(&ctx).await, TaskOutcome::Applied);
        assert_eq!(node.subscriptions_of(&romeo).len(), 2);
        assert!(!presence.is_tracking("status", &romeo));
    }

    #[tokio::test]
    async fn test_filtered_subscription_does_not_track_presence() {
        let (ctx, presence, node) = presence_context();
        let mercutio: Jid = "mercutio@verona.lit".parse().expect("valid jid");
        let mut subscription = NodeSubscription::new(
            "status",
            "s1",
            mercutio.to_bare(),
            mercutio.clone(),
            SubscriptionState::Subscribed,
        );
        subscription.presence_states = vec!["chat".to_string()];

        ctx.registry.shared().add_subscription(&node, subscription);

        assert!(node.subscription("s1").is_some());
        assert!(!presence.is_tracking("status", &mercutio.to_bare()));
    }

    #[tokio::test]
    async fn test_new_subscription_on_plain_node_does_not_track_presence() {
        let (router, _rx) = ChannelRouter::new(16);
        let presence = Arc::new(InMemoryPresence::new());
        let ctx = EngineContext::new(
            PubSubConfig::default(),
            Arc::new(InMemoryPubSubStore::new()),
            Arc::new(router),
            presence.clone(),
        );
        add_leaf(&ctx, "status");

        let task = new_subscription("s1", "romeo@montague.lit");
        assert_eq!(task.run(&ctx).await, TaskOutcome::Applied);
        assert!(!presence.is_tracking("status", &bare("romeo@montague.lit")));
    }

    #[tokio::test]
    async fn test_new_subscription_flushes_pending_changes() {
        let (ctx, _presence, node) = presence_context();
        ctx.gateway.create_node(node.to_stored());
        assert!(ctx.gateway.has_pending(&node.key()));

        let task = new_subscription("s1", "romeo@montague.lit");
        assert_eq!(task.run(&ctx).await, TaskOutcome::Applied);

        assert!(!ctx.gateway.has_pending(&node.key()));
        let stored = ctx
            .gateway
            .store()
            .load_node(&node.key())
            .await
            .expect("load")
            .expect("node flushed");
        assert_eq!(stored.node.node_id, "status");
    }
}
