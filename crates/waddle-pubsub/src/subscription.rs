//! Node subscriptions and subscription options (XEP-0060 Section 6.3).

use std::fmt;

use chrono::{DateTime, Utc};
use jid::{BareJid, Jid};
use rand::distr::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::PubSubError;
use crate::form::{DataForm, FormField};
use crate::node::{Node, PublishedItem};
use crate::presence::PresenceTracker;
use crate::stanzas::NS_PUBSUB_SUBSCRIBE_OPTIONS;

/// Length of generated subscription IDs.
pub const SUBSCRIPTION_ID_LEN: usize = 40;

/// Lifecycle state of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionState {
    /// Awaiting approval by a node owner.
    Pending,
    /// Receiving notifications.
    Subscribed,
    /// Waiting for the subscriber to submit subscription options.
    Unconfigured,
}

impl SubscriptionState {
    /// Parse a state from its attribute value.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SubscriptionState::Pending),
            "subscribed" => Some(SubscriptionState::Subscribed),
            "unconfigured" => Some(SubscriptionState::Unconfigured),
            _ => None,
        }
    }

    /// Attribute value for this state.
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionState::Pending => "pending",
            SubscriptionState::Subscribed => "subscribed",
            SubscriptionState::Unconfigured => "unconfigured",
        }
    }
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a subscription to a collection node is notified about.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionType {
    /// Items published to descendant leaf nodes.
    Items,
    /// Child nodes being added to or removed from the hierarchy.
    #[default]
    Nodes,
}

impl SubscriptionType {
    /// Parse from a `pubsub#subscription_type` value.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "items" => Some(SubscriptionType::Items),
            "nodes" => Some(SubscriptionType::Nodes),
            _ => None,
        }
    }
}

impl fmt::Display for SubscriptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SubscriptionType::Items => "items",
            SubscriptionType::Nodes => "nodes",
        };
        write!(f, "{}", s)
    }
}

/// How deep below a collection node a subscription reaches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionDepth {
    /// Direct children only.
    #[default]
    One,
    /// Every descendant.
    All,
}

impl SubscriptionDepth {
    /// Parse from a `pubsub#subscription_depth` value.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "1" => Some(SubscriptionDepth::One),
            "all" => Some(SubscriptionDepth::All),
            _ => None,
        }
    }

    /// Whether `origin` is within reach of a subscription held on `holder`.
    pub fn covers(&self, holder: &Node, origin: &Node) -> bool {
        match self {
            SubscriptionDepth::One => holder.is_child_node(origin),
            SubscriptionDepth::All => holder.is_descendant_node(origin),
        }
    }
}

impl fmt::Display for SubscriptionDepth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SubscriptionDepth::One => "1",
            SubscriptionDepth::All => "all",
        };
        write!(f, "{}", s)
    }
}

/// A subscription of a JID to a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSubscription {
    /// Subscription ID, unique within the node.
    pub id: String,
    /// Node the subscription belongs to.
    pub node_id: String,
    /// Bare JID of the entity that requested the subscription.
    pub owner: BareJid,
    /// JID receiving notifications; may be a full JID and may differ from the owner.
    pub jid: Jid,
    /// Current state.
    pub state: SubscriptionState,
    /// Whether notifications are delivered at all.
    pub deliver: bool,
    /// Presence show values that gate delivery; empty means no filter.
    pub presence_states: Vec<String>,
    /// Notification scope on collection nodes.
    pub subscription_type: SubscriptionType,
    /// Depth on collection nodes.
    pub depth: SubscriptionDepth,
    /// Instant after which the subscription is inactive.
    pub expire: Option<DateTime<Utc>>,
    /// Only deliver items whose payload contains this text.
    pub keyword: Option<String>,
}

impl NodeSubscription {
    /// Create a subscription with default options.
    pub fn new(
        node_id: impl Into<String>,
        id: impl Into<String>,
        owner: BareJid,
        jid: Jid,
        state: SubscriptionState,
    ) -> Self {
        Self {
            id: id.into(),
            node_id: node_id.into(),
            owner,
            jid,
            state,
            deliver: true,
            presence_states: Vec::new(),
            subscription_type: SubscriptionType::default(),
            depth: SubscriptionDepth::default(),
            expire: None,
            keyword: None,
        }
    }

    /// Generate a fresh random subscription ID.
    pub fn generate_id() -> String {
        rand::rng()
            .sample_iter(&Alphanumeric)
            .take(SUBSCRIPTION_ID_LEN)
            .map(char::from)
            .collect()
    }

    /// Whether the subscription has passed its expiry instant.
    pub fn is_expired(&self) -> bool {
        self.expire.is_some_and(|expire| expire <= Utc::now())
    }

    /// Subscribed and not expired.
    pub fn is_active(&self) -> bool {
        self.state == SubscriptionState::Subscribed && !self.is_expired()
    }

    /// Awaiting approval by a node owner.
    pub fn is_authorization_pending(&self) -> bool {
        self.state == SubscriptionState::Pending
    }

    /// Apply a submitted subscription options form.
    ///
    /// The whole form is validated before anything is changed. An
    /// unconfigured subscription becomes subscribed once options arrive.
    pub fn configure(&mut self, form: &DataForm) -> Result<(), PubSubError> {
        let mut staged = self.clone();

        for field in &form.fields {
            match field.var.as_str() {
                "pubsub#deliver" => staged.deliver = field.bool_value()?,
                "pubsub#show-values" => {
                    staged.presence_states = field
                        .values
                        .iter()
                        .filter(|v| !v.is_empty())
                        .cloned()
                        .collect();
                }
                "pubsub#subscription_type" => {
                    staged.subscription_type = field
                        .first_value()
                        .and_then(SubscriptionType::from_str)
                        .ok_or_else(|| {
                            PubSubError::not_acceptable("invalid pubsub#subscription_type")
                        })?;
                }
                "pubsub#subscription_depth" => {
                    staged.depth = field
                        .first_value()
                        .and_then(SubscriptionDepth::from_str)
                        .ok_or_else(|| {
                            PubSubError::not_acceptable("invalid pubsub#subscription_depth")
                        })?;
                }
                "pubsub#expire" => {
                    staged.expire = match field.first_value().filter(|v| !v.is_empty()) {
                        None => None,
                        Some(value) => Some(
                            DateTime::parse_from_rfc3339(value)
                                .map_err(|_| PubSubError::not_acceptable("invalid pubsub#expire"))?
                                .with_timezone(&Utc),
                        ),
                    };
                }
                "x-pubsub#keywords" => {
                    staged.keyword = field
                        .first_value()
                        .filter(|v| !v.is_empty())
                        .map(String::from);
                }
                _ => {}
            }
        }

        if staged.state == SubscriptionState::Unconfigured {
            staged.state = SubscriptionState::Subscribed;
        }

        *self = staged;
        Ok(())
    }

    /// Current options as a result form.
    pub fn options_form(&self) -> DataForm {
        let mut form = DataForm::new(NS_PUBSUB_SUBSCRIBE_OPTIONS);
        form.push(
            FormField::new("pubsub#deliver", if self.deliver { "1" } else { "0" })
                .with_type("boolean")
                .with_label("Enable delivery?"),
        );
        form.push(
            FormField::multi("pubsub#show-values", self.presence_states.clone())
                .with_type("list-multi")
                .with_label("Receive notifications only when available"),
        );
        form.push(
            FormField::new("pubsub#subscription_type", self.subscription_type.to_string())
                .with_type("list-single"),
        );
        form.push(
            FormField::new("pubsub#subscription_depth", self.depth.to_string())
                .with_type("list-single"),
        );
        if let Some(expire) = self.expire {
            form.push(FormField::new("pubsub#expire", expire.to_rfc3339()).with_type("text-single"));
        }
        if let Some(ref keyword) = self.keyword {
            form.push(FormField::new("x-pubsub#keywords", keyword.as_str()).with_type("text-single"));
        }
        form
    }

    /// Whether the subscriber should be notified at all right now.
    ///
    /// Requires an active subscription with delivery on. When the node
    /// delivers on presence, or the subscription filters on show values, the
    /// subscriber has to be online with a matching show value.
    pub fn can_send_events(&self, node: &Node, presence: &dyn PresenceTracker) -> bool {
        if !self.is_active() || !self.deliver {
            return false;
        }

        if node.is_presence_based_delivery() || !self.presence_states.is_empty() {
            let shows = presence.show_values(&self.jid);
            if shows.is_empty() {
                return false;
            }
            if !self.presence_states.is_empty()
                && !shows.iter().any(|show| self.presence_states.contains(show))
            {
                return false;
            }
        }

        true
    }

    /// Whether an item published on `leaf` reaches this subscription held on `holder`.
    pub fn can_send_publication_event(
        &self,
        holder: &Node,
        leaf: &Node,
        item: &PublishedItem,
        presence: &dyn PresenceTracker,
    ) -> bool {
        if !self.can_send_events(holder, presence) {
            return false;
        }

        if holder.is_collection()
            && (self.subscription_type != SubscriptionType::Items
                || !self.depth.covers(holder, leaf))
        {
            return false;
        }

        self.keyword_matches(item)
    }

    /// Whether a child-node event originating at `origin` reaches this
    /// subscription held on collection `holder`.
    pub fn can_send_child_node_event(
        &self,
        holder: &Node,
        origin: &Node,
        presence: &dyn PresenceTracker,
    ) -> bool {
        holder.is_collection()
            && self.subscription_type == SubscriptionType::Nodes
            && self.depth.covers(holder, origin)
            && self.can_send_events(holder, presence)
    }

    fn keyword_matches(&self, item: &PublishedItem) -> bool {
        match self.keyword {
            None => true,
            Some(ref keyword) => item
                .payload_xml()
                .is_some_and(|xml| xml.contains(keyword.as_str())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_subscription() -> NodeSubscription {
        NodeSubscription::new(
            "princely_musings",
            NodeSubscription::generate_id(),
            "hamlet@denmark.lit".parse().expect("valid jid"),
            "hamlet@denmark.lit/castle".parse().expect("valid jid"),
            SubscriptionState::Subscribed,
        )
    }

    #[test]
    fn test_generated_id_length() {
        let id = NodeSubscription::generate_id();
        assert_eq!(id.len(), SUBSCRIPTION_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(id, NodeSubscription::generate_id());
    }

    #[test]
    fn test_defaults() {
        let sub = test_subscription();
        assert!(sub.deliver);
        assert!(sub.presence_states.is_empty());
        assert_eq!(sub.subscription_type, SubscriptionType::Nodes);
        assert_eq!(sub.depth, SubscriptionDepth::One);
        assert!(sub.is_active());
    }

    #[test]
    fn test_configure_options() {
        let mut sub = test_subscription();
        sub.state = SubscriptionState::Unconfigured;

        let form = DataForm::new(NS_PUBSUB_SUBSCRIBE_OPTIONS)
            .with_field(FormField::new("pubsub#deliver", "false"))
            .with_field(FormField::multi(
                "pubsub#show-values",
                vec!["chat".to_string(), "online".to_string()],
            ))
            .with_field(FormField::new("pubsub#subscription_type", "items"))
            .with_field(FormField::new("pubsub#subscription_depth", "all"));

        sub.configure(&form).expect("valid options");

        assert!(!sub.deliver);
        assert_eq!(sub.presence_states, vec!["chat", "online"]);
        assert_eq!(sub.subscription_type, SubscriptionType::Items);
        assert_eq!(sub.depth, SubscriptionDepth::All);
        assert_eq!(sub.state, SubscriptionState::Subscribed);
    }

    #[test]
    fn test_configure_rejects_bad_depth_without_changes() {
        let mut sub = test_subscription();
        let form = DataForm::new(NS_PUBSUB_SUBSCRIBE_OPTIONS)
            .with_field(FormField::new("pubsub#deliver", "0"))
            .with_field(FormField::new("pubsub#subscription_depth", "7"));

        assert!(sub.configure(&form).is_err());
        assert!(sub.deliver);
        assert_eq!(sub.depth, SubscriptionDepth::One);
    }

    #[test]
    fn test_expired_subscription_is_inactive() {
        let mut sub = test_subscription();
        sub.expire = Some(Utc::now() - chrono::Duration::seconds(5));
        assert!(sub.is_expired());
        assert!(!sub.is_active());
    }

    #[test]
    fn test_options_form_round_trip() {
        let mut sub = test_subscription();
        sub.keyword = Some("elsinore".to_string());
        let form = sub.options_form();

        let mut other = test_subscription();
        other.configure(&form).expect("own form is valid");
        assert_eq!(other.keyword.as_deref(), Some("elsinore"));
        assert_eq!(other.depth, sub.depth);
    }
}
