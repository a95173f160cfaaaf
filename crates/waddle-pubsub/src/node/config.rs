//! PubSub node configuration.
//!
//! Defines node configuration options including access models and publish
//! models, and how `pubsub#node_config` form fields map onto them.

use std::fmt;

use jid::BareJid;
use serde::{Deserialize, Serialize};

use crate::error::PubSubError;
use crate::form::{DataForm, FormField};

/// Default payload size limit in bytes.
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 5120;

/// Access model for a PubSub node.
///
/// Determines who can subscribe to and retrieve items from the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessModel {
    /// Anyone can subscribe and retrieve items.
    Open,
    /// Only entities with a presence subscription to the owner can access.
    /// This is the default for PEP nodes.
    #[default]
    Presence,
    /// Only entities in the owner's roster can access.
    Roster,
    /// Only explicitly affiliated JIDs can access.
    Whitelist,
    /// Subscriptions need approval by an owner.
    Authorize,
}

impl AccessModel {
    /// Parse an access model from a string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "open" => Some(AccessModel::Open),
            "presence" => Some(AccessModel::Presence),
            "roster" => Some(AccessModel::Roster),
            "whitelist" => Some(AccessModel::Whitelist),
            "authorize" => Some(AccessModel::Authorize),
            _ => None,
        }
    }
}

impl fmt::Display for AccessModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AccessModel::Open => "open",
            AccessModel::Presence => "presence",
            AccessModel::Roster => "roster",
            AccessModel::Whitelist => "whitelist",
            AccessModel::Authorize => "authorize",
        };
        write!(f, "{}", s)
    }
}

/// Publish model for a PubSub node.
///
/// Determines who can publish to the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishModel {
    /// Only owners and publishers can publish.
    #[default]
    Publishers,
    /// Only subscribers can publish.
    Subscribers,
    /// Anyone can publish.
    Open,
}

impl PublishModel {
    /// Parse a publish model from a string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "publishers" => Some(PublishModel::Publishers),
            "subscribers" => Some(PublishModel::Subscribers),
            "open" => Some(PublishModel::Open),
            _ => None,
        }
    }
}

impl fmt::Display for PublishModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PublishModel::Publishers => "publishers",
            PublishModel::Subscribers => "subscribers",
            PublishModel::Open => "open",
        };
        write!(f, "{}", s)
    }
}

/// When to send the last published item to a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendLastPublishedItem {
    /// Never send last item automatically.
    Never,
    /// Send on subscription only.
    #[default]
    OnSub,
    /// Send on subscription and when contact comes online (PEP default).
    OnSubAndPresence,
}

impl SendLastPublishedItem {
    /// Parse from a string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "never" => Some(SendLastPublishedItem::Never),
            "on_sub" => Some(SendLastPublishedItem::OnSub),
            "on_sub_and_presence" => Some(SendLastPublishedItem::OnSubAndPresence),
            _ => None,
        }
    }
}

impl fmt::Display for SendLastPublishedItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SendLastPublishedItem::Never => "never",
            SendLastPublishedItem::OnSub => "on_sub",
            SendLastPublishedItem::OnSubAndPresence => "on_sub_and_presence",
        };
        write!(f, "{}", s)
    }
}

/// Configuration for a PubSub node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Access model (who can subscribe/retrieve).
    pub access_model: AccessModel,
    /// Publish model (who can publish).
    pub publish_model: PublishModel,
    /// Maximum number of items to keep (0 = unlimited, 1 = typical for PEP).
    pub max_items: u32,
    /// Whether to persist items across server restarts.
    pub persist_items: bool,
    /// Whether to deliver payloads in notifications.
    pub deliver_payloads: bool,
    /// Whether to notify subscribers when the configuration changes.
    pub notify_config: bool,
    /// Whether to notify on item retraction.
    pub notify_retract: bool,
    /// Whether to notify on node deletion.
    pub notify_delete: bool,
    /// Only notify subscribers that are online.
    pub presence_based_delivery: bool,
    /// Whether subscriptions are allowed at all.
    pub subscription_enabled: bool,
    /// New subscriptions start unconfigured until options are submitted.
    pub subscription_config_required: bool,
    /// Largest accepted payload in bytes.
    pub max_payload_size: usize,
    /// Whether to send last published item on subscription.
    pub send_last_published_item: SendLastPublishedItem,
    /// Friendly node name.
    pub title: Option<String>,
    /// Node description.
    pub description: Option<String>,
    /// People to contact with questions about the node.
    pub contacts: Vec<BareJid>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::leaf_default()
    }
}

impl NodeConfig {
    /// Default configuration for leaf nodes on the shared service.
    pub fn leaf_default() -> Self {
        Self {
            access_model: AccessModel::Open,
            publish_model: PublishModel::Publishers,
            max_items: 10,
            persist_items: true,
            deliver_payloads: true,
            notify_config: true,
            notify_retract: true,
            notify_delete: true,
            presence_based_delivery: false,
            subscription_enabled: true,
            subscription_config_required: false,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            send_last_published_item: SendLastPublishedItem::OnSub,
            title: None,
            description: None,
            contacts: Vec::new(),
        }
    }

    /// Default configuration for collection nodes.
    ///
    /// Leaf settings are carried but never used.
    pub fn collection_default() -> Self {
        Self {
            max_items: 0,
            send_last_published_item: SendLastPublishedItem::Never,
            ..Self::leaf_default()
        }
    }

    /// Default configuration for PEP nodes (XEP-0163).
    ///
    /// - Access model: presence (roster-based)
    /// - Max items: 1 (only latest item kept)
    /// - Persist items: true
    /// - Presence-based delivery
    pub fn pep_default() -> Self {
        Self {
            access_model: AccessModel::Presence,
            max_items: 1,
            presence_based_delivery: true,
            send_last_published_item: SendLastPublishedItem::OnSubAndPresence,
            ..Self::leaf_default()
        }
    }

    /// Configuration for a public node (anyone can subscribe).
    pub fn public() -> Self {
        Self::leaf_default()
    }

    /// Configuration for a whitelist-only node.
    pub fn whitelist() -> Self {
        Self {
            access_model: AccessModel::Whitelist,
            ..Self::leaf_default()
        }
    }

    /// Number of items a leaf keeps, `None` meaning unbounded.
    ///
    /// Non-persistent leaves only remember the last item.
    pub fn item_limit(&self) -> Option<usize> {
        if !self.persist_items {
            return Some(1);
        }
        match self.max_items {
            0 => None,
            n => Some(n as usize),
        }
    }

    /// Apply one form field. Returns `false` for variables this struct does
    /// not own, leaving them to the node.
    pub fn apply_field(&mut self, field: &FormField) -> Result<bool, PubSubError> {
        match field.var.as_str() {
            "pubsub#deliver_payloads" => self.deliver_payloads = field.bool_value()?,
            "pubsub#notify_config" => self.notify_config = field.bool_value()?,
            "pubsub#notify_delete" => self.notify_delete = field.bool_value()?,
            "pubsub#notify_retract" => self.notify_retract = field.bool_value()?,
            "pubsub#presence_based_delivery" => {
                self.presence_based_delivery = field.bool_value()?
            }
            "pubsub#subscribe" => self.subscription_enabled = field.bool_value()?,
            "pubsub#subscription_required" => {
                self.subscription_config_required = field.bool_value()?
            }
            "pubsub#persist_items" => self.persist_items = field.bool_value()?,
            "pubsub#access_model" => {
                self.access_model = field
                    .first_value()
                    .and_then(AccessModel::from_str)
                    .ok_or_else(|| PubSubError::not_acceptable("invalid pubsub#access_model"))?;
            }
            "pubsub#publish_model" => {
                self.publish_model = field
                    .first_value()
                    .and_then(PublishModel::from_str)
                    .ok_or_else(|| PubSubError::not_acceptable("invalid pubsub#publish_model"))?;
            }
            "pubsub#send_last_published_item" => {
                self.send_last_published_item = field
                    .first_value()
                    .and_then(SendLastPublishedItem::from_str)
                    .ok_or_else(|| {
                        PubSubError::not_acceptable("invalid pubsub#send_last_published_item")
                    })?;
            }
            "pubsub#send_item_subscribe" => {
                let send = field.bool_value()?;
                self.send_last_published_item = match (send, self.send_last_published_item) {
                    (false, _) => SendLastPublishedItem::Never,
                    (true, SendLastPublishedItem::Never) => SendLastPublishedItem::OnSub,
                    (true, current) => current,
                };
            }
            "pubsub#max_items" => {
                self.max_items = match field.first_value() {
                    Some("max") => 0,
                    _ => match field.int_value()? {
                        -1 => 0,
                        n if n < 0 => {
                            return Err(PubSubError::not_acceptable("negative pubsub#max_items"))
                        }
                        n => u32::try_from(n)
                            .map_err(|_| PubSubError::not_acceptable("pubsub#max_items too large"))?,
                    },
                };
            }
            "pubsub#max_payload_size" => {
                let size = field.int_value()?;
                self.max_payload_size = usize::try_from(size)
                    .map_err(|_| PubSubError::not_acceptable("invalid pubsub#max_payload_size"))?;
            }
            "pubsub#title" => self.title = non_empty(field),
            "pubsub#description" => self.description = non_empty(field),
            "pubsub#contact" => {
                self.contacts = field
                    .values
                    .iter()
                    .filter_map(|v| v.parse::<BareJid>().ok())
                    .collect();
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// Append the fields this struct owns to a configuration form.
    pub fn append_fields(&self, form: &mut DataForm, leaf: bool) {
        form.push(bool_field("pubsub#deliver_payloads", self.deliver_payloads));
        form.push(bool_field("pubsub#notify_config", self.notify_config));
        form.push(bool_field("pubsub#notify_delete", self.notify_delete));
        form.push(bool_field("pubsub#notify_retract", self.notify_retract));
        form.push(bool_field(
            "pubsub#presence_based_delivery",
            self.presence_based_delivery,
        ));
        form.push(bool_field("pubsub#subscribe", self.subscription_enabled));
        form.push(bool_field(
            "pubsub#subscription_required",
            self.subscription_config_required,
        ));
        form.push(
            FormField::new("pubsub#access_model", self.access_model.to_string())
                .with_type("list-single"),
        );
        form.push(
            FormField::new("pubsub#publish_model", self.publish_model.to_string())
                .with_type("list-single"),
        );
        form.push(
            FormField::new("pubsub#title", self.title.clone().unwrap_or_default())
                .with_type("text-single"),
        );
        form.push(
            FormField::new(
                "pubsub#description",
                self.description.clone().unwrap_or_default(),
            )
            .with_type("text-single"),
        );
        form.push(
            FormField::multi(
                "pubsub#contact",
                self.contacts.iter().map(|jid| jid.to_string()).collect(),
            )
            .with_type("jid-multi"),
        );

        if leaf {
            form.push(bool_field("pubsub#persist_items", self.persist_items));
            form.push(
                FormField::new("pubsub#max_items", self.max_items.to_string())
                    .with_type("text-single"),
            );
            form.push(
                FormField::new("pubsub#max_payload_size", self.max_payload_size.to_string())
                    .with_type("text-single"),
            );
            form.push(
                FormField::new(
                    "pubsub#send_last_published_item",
                    self.send_last_published_item.to_string(),
                )
                .with_type("list-single"),
            );
        }
    }
}

fn non_empty(field: &FormField) -> Option<String> {
    field
        .first_value()
        .filter(|v| !v.is_empty())
        .map(String::from)
}

fn bool_field(var: &str, value: bool) -> FormField {
    FormField::new(var, if value { "1" } else { "0" }).with_type("boolean")
}
