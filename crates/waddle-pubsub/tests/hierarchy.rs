//! Collection node behavior: reparenting, leaf limits, association policy,
//! descendant queries and child-node event fan-out.

mod common;

use std::sync::Arc;

use common::{bare, form, jid, TestMember};
use waddle_pubsub::stanzas::{NS_PUBSUB_EVENT, NS_PUBSUB_NODE_CONFIG, NS_PUBSUB_SUBSCRIBE_OPTIONS};
use waddle_pubsub::{
    AssociationPolicy, ChannelRouter, CollectionSettings, CreateNodeRequest, InMemoryPresence,
    InMemoryPubSubStore, Node, NodeConfig, PubSubError, PubSubService, ServiceId,
};

fn service() -> PubSubService {
    let (router, _rx) = ChannelRouter::new(16);
    PubSubService::new(
        ServiceId::Shared,
        "pubsub.shakespeare.lit",
        Vec::new(),
        Arc::new(router),
        Arc::new(InMemoryPresence::new()),
    )
}

fn collection(id: &str, parent: Option<&str>, settings: CollectionSettings) -> Node {
    let node = Node::new_collection(
        ServiceId::Shared,
        id,
        jid("owner@shakespeare.lit"),
        NodeConfig::collection_default(),
        settings,
    );
    node.set_parent(parent.map(String::from));
    node
}

fn leaf(id: &str, parent: Option<&str>) -> Node {
    let node = Node::new_leaf(
        ServiceId::Shared,
        id,
        jid("owner@shakespeare.lit"),
        NodeConfig::leaf_default(),
    );
    node.set_parent(parent.map(String::from));
    node
}

#[test]
fn test_deleting_collection_moves_children_to_grandparent() {
    let service = service();
    let p = service.create_node(collection("p", None, CollectionSettings::default()));
    let c = service.create_node(collection("c", Some("p"), CollectionSettings::default()));
    let l1 = service.create_node(leaf("l1", Some("c")));
    let l2 = service.create_node(leaf("l2", Some("c")));

    c.deleting_node(&service);

    assert_eq!(l1.parent_id().as_deref(), Some("p"));
    assert_eq!(l2.parent_id().as_deref(), Some("p"));
    assert!(p.is_child_node(&l1));
    assert!(p.is_child_node(&l2));
    assert!(!p.is_child_node(&c));
    assert!(c.children().is_empty());
}

#[test]
fn test_max_leaf_nodes_counts_only_leaves() {
    let service = service();
    let settings = CollectionSettings {
        max_leaf_nodes: 1,
        ..CollectionSettings::default()
    };
    let root = service.create_node(collection("root", None, settings));
    assert!(!root.is_max_leaf_node_reached());

    service.create_node(collection("nested", Some("root"), CollectionSettings::default()));
    assert!(!root.is_max_leaf_node_reached());

    service.create_node(leaf("only", Some("root")));
    assert!(root.is_max_leaf_node_reached());
}

#[test]
fn test_whitelist_association_policy() {
    let service = service();
    let settings = CollectionSettings {
        association_policy: AssociationPolicy::Whitelist,
        trusted: vec![bare("b@shakespeare.lit")],
        ..CollectionSettings::default()
    };
    let root = service.create_node(collection("root", None, settings));
    root.upsert_affiliation(bare("owner@shakespeare.lit"), waddle_pubsub::Affiliation::Owner);

    assert!(root.is_association_allowed(&service, &bare("b@shakespeare.lit")));
    assert!(!root.is_association_allowed(&service, &bare("c@shakespeare.lit")));
    assert!(root.is_association_allowed(&service, &bare("owner@shakespeare.lit")));
}

#[test]
fn test_descendant_query_follows_the_chain() {
    let service = service();
    let root = service.create_node(collection("root", None, CollectionSettings::default()));
    let a = service.create_node(collection("a", Some("root"), CollectionSettings::default()));
    let b = service.create_node(collection("b", Some("a"), CollectionSettings::default()));

    assert!(root.is_descendant_node(&b));
    assert!(a.is_descendant_node(&b));
    assert!(!b.is_descendant_node(&a));
    assert!(!root.is_child_node(&b));
}

#[test]
fn test_invalid_association_policy_leaves_node_untouched() {
    let service = service();
    let root = Arc::new(collection("root", None, CollectionSettings::default()));
    service.install_node(Arc::clone(&root));

    let submitted = form(
        NS_PUBSUB_NODE_CONFIG,
        &[
            ("pubsub#title", "Renamed"),
            ("pubsub#children_association_policy", "everyone-please"),
        ],
    );
    let result = root.configure(&service, &submitted);

    assert!(matches!(result, Err(PubSubError::NotAcceptable(_))));
    let settings = root.collection().expect("collection").settings();
    assert_eq!(settings.association_policy, AssociationPolicy::All);
    assert_eq!(root.config().title, None);
}

#[tokio::test]
async fn test_nodes_subscription_on_root_sees_child_added_below() {
    let mut member = TestMember::start(Arc::new(InMemoryPubSubStore::new()), None).await;
    let engine = &member.engine;
    let owner = jid("owner@shakespeare.lit/desk");
    let shared = ServiceId::Shared;

    engine
        .create_node(&shared, &owner, CreateNodeRequest::collection("root"))
        .await
        .expect("root");
    engine
        .create_node(&shared, &owner, CreateNodeRequest::collection("a").with_parent("root"))
        .await
        .expect("a");

    let watcher = jid("watcher@shakespeare.lit");
    let options = form(
        NS_PUBSUB_SUBSCRIBE_OPTIONS,
        &[
            ("pubsub#subscription_type", "nodes"),
            ("pubsub#subscription_depth", "all"),
        ],
    );
    engine
        .subscribe(&shared, &watcher, "root", &watcher, Some(&options))
        .await
        .expect("subscribe");
    member.drain();

    member
        .engine
        .create_node(&shared, &owner, CreateNodeRequest::leaf("x").with_parent("a"))
        .await
        .expect("x");

    let out = member.drain();
    let to_watcher: Vec<_> = out.iter().filter(|o| o.to == watcher).collect();
    assert_eq!(to_watcher.len(), 1);
    let event = to_watcher[0]
        .stanza
        .get_child("event", NS_PUBSUB_EVENT)
        .expect("event");
    let items = event.get_child("items", NS_PUBSUB_EVENT).expect("items");
    assert_eq!(items.attr("node"), Some("a"));
    assert_eq!(common::event_item_ids(to_watcher[0]), vec!["x".to_string()]);
}

#[tokio::test]
async fn test_leaf_limit_rejects_extra_children() {
    let member = TestMember::start(Arc::new(InMemoryPubSubStore::new()), None).await;
    let owner = jid("owner@shakespeare.lit");
    let shared = ServiceId::Shared;

    let settings = form(NS_PUBSUB_NODE_CONFIG, &[("pubsub#children_max", "1")]);
    member
        .engine
        .create_node(
            &shared,
            &owner,
            CreateNodeRequest::collection("root").with_form(settings),
        )
        .await
        .expect("root");
    member
        .engine
        .create_node(&shared, &owner, CreateNodeRequest::leaf("one").with_parent("root"))
        .await
        .expect("one");

    let second = member
        .engine
        .create_node(&shared, &owner, CreateNodeRequest::leaf("two").with_parent("root"))
        .await;
    assert!(matches!(second, Err(PubSubError::MaxLeafNodesReached(_))));
}

#[tokio::test]
async fn test_association_policy_guards_node_creation() {
    let member = TestMember::start(Arc::new(InMemoryPubSubStore::new()), None).await;
    let owner = jid("owner@shakespeare.lit");
    let shared = ServiceId::Shared;

    let settings = form(
        NS_PUBSUB_NODE_CONFIG,
        &[("pubsub#children_association_policy", "owners")],
    );
    member
        .engine
        .create_node(
            &shared,
            &owner,
            CreateNodeRequest::collection("root").with_form(settings),
        )
        .await
        .expect("root");

    let stranger = member
        .engine
        .create_node(
            &shared,
            &jid("iago@venice.lit"),
            CreateNodeRequest::leaf("intrusion").with_parent("root"),
        )
        .await;
    assert!(matches!(stranger, Err(PubSubError::Forbidden(_))));

    member
        .engine
        .create_node(&shared, &owner, CreateNodeRequest::leaf("welcome").with_parent("root"))
        .await
        .expect("owner may associate");
}
