//! Notification fan-out.
//!
//! Works out which subscriptions an event reaches, walking up the node
//! hierarchy, and sends one stanza per subscriber JID. A JID holding several
//! qualifying subscriptions gets a single stanza carrying every SubID.

use jid::Jid;
use minidom::Element;
use tracing::trace;

use crate::node::{Node, PublishedItem};
use crate::service::PubSubService;
use crate::stanzas;
use crate::subscription::{NodeSubscription, SubscriptionType};

/// Subscriber JIDs with the IDs of their qualifying subscriptions, in first
/// seen order.
#[derive(Debug, Default)]
struct Targets {
    entries: Vec<(Jid, Vec<String>)>,
}

impl Targets {
    fn add(&mut self, subscription: &NodeSubscription) {
        match self
            .entries
            .iter_mut()
            .find(|(jid, _)| *jid == subscription.jid)
        {
            Some((_, ids)) => {
                if !ids.contains(&subscription.id) {
                    ids.push(subscription.id.clone());
                }
            }
            None => self
                .entries
                .push((subscription.jid.clone(), vec![subscription.id.clone()])),
        }
    }

    fn send(self, service: &PubSubService, node: &Node, event: &Element) -> usize {
        let count = self.entries.len();
        for (jid, subids) in self.entries {
            let message = stanzas::build_event_message(
                service.address(),
                &jid.to_string(),
                event.clone(),
                &subids,
            );
            service.send_notification(node, message, &jid);
        }
        count
    }
}

/// Notify subscribers of `leaf` and of its ancestor collections about a
/// published item.
pub fn broadcast_publication(service: &PubSubService, leaf: &Node, item: &PublishedItem) -> usize {
    let presence = service.presence();
    let mut targets = Targets::default();

    for subscription in leaf.subscriptions() {
        if subscription.can_send_publication_event(leaf, leaf, item, presence) {
            targets.add(&subscription);
        }
    }
    for ancestor in service.ancestors(leaf) {
        for subscription in ancestor.subscriptions() {
            if subscription.can_send_publication_event(&ancestor, leaf, item, presence) {
                targets.add(&subscription);
            }
        }
    }

    let payload = if leaf.config().deliver_payloads {
        item.payload.clone()
    } else {
        None
    };
    let event = stanzas::build_items_event(leaf.id(), &[(item.id.clone(), payload)]);
    let sent = targets.send(service, leaf, &event);
    trace!(node = %leaf.id(), item = %item.id, recipients = sent, "Broadcast publication");
    sent
}

/// Notify about retracted items, reaching the same audience as publications
/// apart from keyword filters.
pub fn broadcast_retraction(service: &PubSubService, leaf: &Node, item_ids: &[String]) -> usize {
    if item_ids.is_empty() {
        return 0;
    }
    let presence = service.presence();
    let mut targets = Targets::default();

    for subscription in leaf.subscriptions() {
        if subscription.can_send_events(leaf, presence) {
            targets.add(&subscription);
        }
    }
    for ancestor in service.ancestors(leaf) {
        for subscription in ancestor.subscriptions() {
            if subscription.subscription_type == SubscriptionType::Items
                && subscription.depth.covers(&ancestor, leaf)
                && subscription.can_send_events(&ancestor, presence)
            {
                targets.add(&subscription);
            }
        }
    }

    let event = stanzas::build_retract_event(leaf.id(), item_ids);
    targets.send(service, leaf, &event)
}

/// Notify the node's own subscribers about a node-level event (purge,
/// deletion, configuration change).
pub fn broadcast_node_event(service: &PubSubService, node: &Node, event: Element) -> usize {
    let presence = service.presence();
    let mut targets = Targets::default();

    for subscription in node.subscriptions() {
        if subscription.can_send_events(node, presence) {
            targets.add(&subscription);
        }
    }

    targets.send(service, node, &event)
}

/// Notify about a child node event fired on `collection`: its own qualifying
/// subscriptions plus those of every ancestor.
pub fn broadcast_collection_event(
    service: &PubSubService,
    collection: &Node,
    child: &Node,
    kind: &str,
    event: Element,
) -> usize {
    let presence = service.presence();
    let mut targets = Targets::default();

    for subscription in collection.subscriptions() {
        if subscription.can_send_child_node_event(collection, child, presence) {
            targets.add(&subscription);
        }
    }
    for ancestor in service.ancestors(collection) {
        for subscription in ancestor.subscriptions() {
            if subscription.can_send_child_node_event(&ancestor, child, presence) {
                targets.add(&subscription);
            }
        }
    }

    let sent = targets.send(service, collection, &event);
    trace!(
        collection = %collection.id(),
        child = %child.id(),
        kind,
        recipients = sent,
        "Broadcast collection event"
    );
    sent
}

/// Send one item to one subscriber, e.g. the last published item on
/// subscription.
pub fn send_item_to(
    service: &PubSubService,
    node: &Node,
    item: &PublishedItem,
    subscription: &NodeSubscription,
) {
    let payload = if node.config().deliver_payloads {
        item.payload.clone()
    } else {
        None
    };
    let event = stanzas::build_items_event(node.id(), &[(item.id.clone(), payload)]);
    let message = stanzas::build_event_message(
        service.address(),
        &subscription.jid.to_string(),
        event,
        std::slice::from_ref(&subscription.id),
    );
    service.send_notification(node, message, &subscription.jid);
}
