//! Presence subsystem seam.
//!
//! The engine asks the presence layer which show values a subscriber is
//! currently broadcasting, whether presence-based nodes need to track an
//! owner, and how the requester relates to a node owner's roster.

use dashmap::{DashMap, DashSet};
use jid::{BareJid, Jid};
use tracing::debug;

use crate::node::Node;

/// Show value reported for an available resource without `<show/>`.
pub const SHOW_ONLINE: &str = "online";

/// Presence information consumed by the engine.
pub trait PresenceTracker: Send + Sync {
    /// Show values currently broadcast by `jid`. For a bare JID this covers
    /// every available resource. Empty means offline.
    fn show_values(&self, jid: &Jid) -> Vec<String>;

    /// A presence-based node gained its first subscription from `owner`.
    fn presence_subscription_required(&self, node: &Node, owner: &BareJid);

    /// A presence-based node lost the last subscription from `owner`.
    fn presence_subscription_not_required(&self, node: &Node, owner: &BareJid);

    /// Whether `contact` is subscribed to the presence of `user`.
    fn has_presence_subscription(&self, contact: &BareJid, user: &BareJid) -> bool;

    /// Whether `contact` is in the roster of `user`.
    fn is_roster_contact(&self, user: &BareJid, contact: &BareJid) -> bool;
}

/// In-memory presence tracker for standalone use and tests.
#[derive(Debug, Default)]
pub struct InMemoryPresence {
    available: DashMap<String, (BareJid, String)>,
    subscriptions: DashSet<(BareJid, BareJid)>,
    rosters: DashSet<(BareJid, BareJid)>,
    tracked: DashSet<(String, BareJid)>,
}

impl InMemoryPresence {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a resource available with a show value (`online` when absent).
    pub fn set_available(&self, jid: &Jid, show: Option<&str>) {
        self.available.insert(
            jid.to_string(),
            (jid.to_bare(), show.unwrap_or(SHOW_ONLINE).to_string()),
        );
    }

    /// Mark a resource unavailable.
    pub fn set_unavailable(&self, jid: &Jid) {
        self.available.remove(&jid.to_string());
    }

    /// Record that `contact` is subscribed to `user`'s presence.
    pub fn add_presence_subscription(&self, contact: BareJid, user: BareJid) {
        self.subscriptions.insert((contact, user));
    }

    /// Add `contact` to `user`'s roster.
    pub fn add_roster_contact(&self, user: BareJid, contact: BareJid) {
        self.rosters.insert((user, contact));
    }

    /// Whether presence of `owner` is tracked for `node_id`.
    pub fn is_tracking(&self, node_id: &str, owner: &BareJid) -> bool {
        self.tracked.contains(&(node_id.to_string(), owner.clone()))
    }
}

impl PresenceTracker for InMemoryPresence {
    fn show_values(&self, jid: &Jid) -> Vec<String> {
        let key = jid.to_string();
        let bare = jid.to_bare();

        if key != bare.to_string() {
            return self
                .available
                .get(&key)
                .map(|entry| vec![entry.1.clone()])
                .unwrap_or_default();
        }

        let mut shows: Vec<String> = self
            .available
            .iter()
            .filter(|entry| entry.value().0 == bare)
            .map(|entry| entry.value().1.clone())
            .collect();
        shows.sort();
        shows.dedup();
        shows
    }

    fn presence_subscription_required(&self, node: &Node, owner: &BareJid) {
        debug!(node = %node.id(), owner = %owner, "Tracking presence for subscriber");
        self.tracked.insert((node.id().to_string(), owner.clone()));
    }

    fn presence_subscription_not_required(&self, node: &Node, owner: &BareJid) {
        debug!(node = %node.id(), owner = %owner, "No longer tracking presence for subscriber");
        self.tracked.remove(&(node.id().to_string(), owner.clone()));
    }

    fn has_presence_subscription(&self, contact: &BareJid, user: &BareJid) -> bool {
        contact == user || self.subscriptions.contains(&(contact.clone(), user.clone()))
    }

    fn is_roster_contact(&self, user: &BareJid, contact: &BareJid) -> bool {
        user == contact || self.rosters.contains(&(user.clone(), contact.clone()))
    }
}
