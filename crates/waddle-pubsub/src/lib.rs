//! # waddle-pubsub
//!
//! Publish-Subscribe (XEP-0060) node engine for Waddle Social, with cluster
//! replication of the in-memory node cache.
//!
//! ## Architecture
//!
//! - **Services**: one shared `pubsub` service plus one personal eventing
//!   (XEP-0163) service per user, held by the [`ServiceRegistry`]
//! - **Nodes**: leaf nodes hold published items, collection nodes hold child
//!   nodes; both own affiliations and subscriptions
//! - **Persistence gateway**: batches writes to a [`PubSubStore`] and flushes
//!   them periodically or on demand
//! - **Cluster tasks**: a closed set of replicated commands that peers replay
//!   against their own cache, shipped by a [`ClusterTransport`]
//! - **Dispatch**: computes the subscriber set of an event, walking the node
//!   hierarchy, and routes notifications through a [`NotificationRouter`]
//!
//! The stream layer talks to [`PubSubEngine`] directly or hands pubsub IQs to
//! [`handle_pubsub_iq`].
//!
//! ## XEP Support
//!
//! - XEP-0060 (Publish-Subscribe), including collection nodes
//! - XEP-0163 (Personal Eventing Protocol) auto-create
//! - XEP-0030 (Service Discovery) item listings
//! - XEP-0131 (SHIM) SubID headers

pub mod cluster;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod engine;
pub mod form;
pub mod handler;
pub mod metrics;
pub mod node;
pub mod pep;
pub mod persistence;
pub mod presence;
pub mod registry;
pub mod router;
pub mod service;
pub mod stanzas;

mod affiliation;
mod error;
mod lock;
mod subscription;

pub use affiliation::{Affiliation, NodeAffiliate};
pub use cluster::{
    decode_task, encode_task, ClusterError, ClusterTask, ClusterTransport, InProcessCluster,
    InProcessTransport, MemberId, StandaloneTransport, TaskExecutor, TaskNode, TaskOutcome,
    TaskReply, TaskSubscription,
};
pub use config::PubSubConfig;
pub use context::EngineContext;
pub use engine::{CreateNodeRequest, PubSubEngine};
pub use error::{PersistenceError, PubSubError, StanzaErrorCondition, StanzaErrorType};
pub use form::{DataForm, FormField};
pub use handler::{handle_disco_items, handle_pubsub_iq, is_disco_items_query};
pub use node::{
    AccessModel, AssociationPolicy, CollectionSettings, Node, NodeConfig, NodeType, PublishModel,
    PublishedItem, SendLastPublishedItem,
};
pub use persistence::{
    InMemoryPubSubStore, LibSqlPubSubStore, NodeKey, NodeSnapshot, PersistenceGateway,
    PubSubStore, StoredItem, StoredNode,
};
pub use presence::{InMemoryPresence, PresenceTracker};
pub use registry::ServiceRegistry;
pub use router::{ChannelRouter, NotificationRouter, OutboundStanza};
pub use service::{PubSubService, ServiceId, SHARED_SERVICE_ID};
pub use subscription::{NodeSubscription, SubscriptionDepth, SubscriptionState, SubscriptionType};
