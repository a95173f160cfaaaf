//! Error types for the PubSub engine.

use minidom::Element;
use thiserror::Error;
use xmpp_parsers::stanza_error::{DefinedCondition, ErrorType, StanzaError};

use crate::stanzas::{NS_PUBSUB_ERRORS, NS_STANZAS};

/// PubSub engine errors.
///
/// Every variant maps onto an XMPP stanza error so the request handler can
/// answer the requesting entity without further translation.
#[derive(Debug, Error)]
pub enum PubSubError {
    /// The node does not exist.
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// The item does not exist.
    #[error("Item not found: {0}")]
    ItemNotFound(String),

    /// The entity is not subscribed, or the SubID is unknown.
    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    /// The node already exists.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The requesting entity lacks the required affiliation.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// A configuration value was rejected.
    #[error("Not acceptable: {0}")]
    NotAcceptable(String),

    /// The operation is not allowed on this node.
    #[error("Not allowed: {0}")]
    NotAllowed(String),

    /// The request was malformed.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// The node or service does not support the named pubsub feature.
    #[error("Feature not implemented: {0}")]
    FeatureNotImplemented(&'static str),

    /// A collection node already holds its maximum number of leaf children.
    #[error("Maximum leaf nodes reached on collection {0}")]
    MaxLeafNodesReached(String),

    /// Published payload exceeds the node's size limit.
    #[error("Payload too big: {size} bytes exceeds {max}")]
    PayloadTooBig {
        /// Size of the rejected payload.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The subscriber already has a subscription awaiting approval.
    #[error("Subscription pending approval for {0}")]
    PendingSubscription(String),

    /// Presence access model without a presence subscription.
    #[error("Presence subscription required")]
    PresenceSubscriptionRequired,

    /// Roster access model and the requester is not in the owner's roster.
    #[error("Not in roster")]
    NotInRosterGroup,

    /// Whitelist access model and the requester is not whitelisted.
    #[error("Node is closed")]
    ClosedNode,

    /// A JID could not be parsed or does not match the requester.
    #[error("Invalid JID: {0}")]
    InvalidJid(String),

    /// The durable store failed.
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// Internal engine error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PubSubError {
    /// Create a new bad request error.
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    /// Create a new not acceptable error.
    pub fn not_acceptable(msg: impl Into<String>) -> Self {
        Self::NotAcceptable(msg.into())
    }

    /// Create a new forbidden error.
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    /// Create a new internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// The RFC 6120 defined condition for this error.
    pub fn condition(&self) -> StanzaErrorCondition {
        match self {
            Self::NodeNotFound(_) | Self::ItemNotFound(_) => StanzaErrorCondition::ItemNotFound,
            Self::SubscriptionNotFound(_) => StanzaErrorCondition::UnexpectedRequest,
            Self::Conflict(_) | Self::MaxLeafNodesReached(_) => StanzaErrorCondition::Conflict,
            Self::Forbidden(_) => StanzaErrorCondition::Forbidden,
            Self::NotAcceptable(_) | Self::PayloadTooBig { .. } => {
                StanzaErrorCondition::NotAcceptable
            }
            Self::NotAllowed(_) | Self::ClosedNode => StanzaErrorCondition::NotAllowed,
            Self::BadRequest(_) | Self::InvalidJid(_) => StanzaErrorCondition::BadRequest,
            Self::FeatureNotImplemented(_) => StanzaErrorCondition::FeatureNotImplemented,
            Self::PendingSubscription(_)
            | Self::PresenceSubscriptionRequired
            | Self::NotInRosterGroup => StanzaErrorCondition::NotAuthorized,
            Self::Persistence(_) | Self::Internal(_) => StanzaErrorCondition::InternalServerError,
        }
    }

    /// The RFC 6120 error type for this error.
    pub fn error_type(&self) -> StanzaErrorType {
        match self.condition() {
            StanzaErrorCondition::Forbidden | StanzaErrorCondition::NotAuthorized => {
                StanzaErrorType::Auth
            }
            StanzaErrorCondition::BadRequest | StanzaErrorCondition::NotAcceptable => {
                StanzaErrorType::Modify
            }
            StanzaErrorCondition::InternalServerError => StanzaErrorType::Wait,
            _ => StanzaErrorType::Cancel,
        }
    }

    /// The XEP-0060 application-specific condition, if one applies.
    pub fn pubsub_condition(&self) -> Option<&'static str> {
        match self {
            Self::SubscriptionNotFound(_) => Some("not-subscribed"),
            Self::MaxLeafNodesReached(_) => Some("max-nodes-exceeded"),
            Self::PayloadTooBig { .. } => Some("payload-too-big"),
            Self::PendingSubscription(_) => Some("pending-subscription"),
            Self::PresenceSubscriptionRequired => Some("presence-subscription-required"),
            Self::NotInRosterGroup => Some("not-in-roster-group"),
            Self::ClosedNode => Some("closed-node"),
            Self::InvalidJid(_) => Some("invalid-jid"),
            Self::FeatureNotImplemented(_) => Some("unsupported"),
            _ => None,
        }
    }

    /// Build the `<error/>` child of an error stanza.
    pub fn to_error_element(&self) -> Element {
        let mut builder = Element::builder("error", "jabber:client")
            .attr("type", self.error_type().as_str())
            .append(Element::builder(self.condition().as_str(), NS_STANZAS).build());

        if let Some(app) = self.app_condition_element() {
            builder = builder.append(app);
        }

        builder.build()
    }

    /// Convert into an `xmpp_parsers` stanza error for an IQ error payload.
    pub fn to_stanza_error(&self) -> StanzaError {
        let mut stanza_error = StanzaError::new(
            self.error_type().into(),
            self.condition().into(),
            "en",
            self.to_string(),
        );
        stanza_error.other = self.app_condition_element();
        stanza_error
    }

    fn app_condition_element(&self) -> Option<Element> {
        let app = self.pubsub_condition()?;
        let mut app_elem = Element::builder(app, NS_PUBSUB_ERRORS);
        if let Self::FeatureNotImplemented(feature) = self {
            app_elem = app_elem.attr("feature", *feature);
        }
        Some(app_elem.build())
    }
}

/// Errors raised by a durable store.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// The database driver failed.
    #[error("Database error: {0}")]
    Database(String),

    /// A stored record could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A stored record is structurally invalid.
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl From<libsql::Error> for PersistenceError {
    fn from(e: libsql::Error) -> Self {
        PersistenceError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(e: serde_json::Error) -> Self {
        PersistenceError::Serialization(e.to_string())
    }
}

/// XMPP stanza error conditions (RFC 6120 Section 8.3.3) used by pubsub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorCondition {
    /// Bad request (malformed request, invalid JID)
    BadRequest,
    /// Conflict (node exists, too many nodes)
    Conflict,
    /// Feature not implemented
    FeatureNotImplemented,
    /// Forbidden (insufficient affiliation)
    Forbidden,
    /// Internal server error
    InternalServerError,
    /// Item not found
    ItemNotFound,
    /// Not acceptable
    NotAcceptable,
    /// Not allowed
    NotAllowed,
    /// Not authorized
    NotAuthorized,
    /// Unexpected request
    UnexpectedRequest,
}

impl StanzaErrorCondition {
    /// Get the element name for this condition.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad-request",
            Self::Conflict => "conflict",
            Self::FeatureNotImplemented => "feature-not-implemented",
            Self::Forbidden => "forbidden",
            Self::InternalServerError => "internal-server-error",
            Self::ItemNotFound => "item-not-found",
            Self::NotAcceptable => "not-acceptable",
            Self::NotAllowed => "not-allowed",
            Self::NotAuthorized => "not-authorized",
            Self::UnexpectedRequest => "unexpected-request",
        }
    }
}

impl From<StanzaErrorCondition> for DefinedCondition {
    fn from(condition: StanzaErrorCondition) -> Self {
        match condition {
            StanzaErrorCondition::BadRequest => DefinedCondition::BadRequest,
            StanzaErrorCondition::Conflict => DefinedCondition::Conflict,
            StanzaErrorCondition::FeatureNotImplemented => DefinedCondition::FeatureNotImplemented,
            StanzaErrorCondition::Forbidden => DefinedCondition::Forbidden,
            StanzaErrorCondition::InternalServerError => DefinedCondition::InternalServerError,
            StanzaErrorCondition::ItemNotFound => DefinedCondition::ItemNotFound,
            StanzaErrorCondition::NotAcceptable => DefinedCondition::NotAcceptable,
            StanzaErrorCondition::NotAllowed => DefinedCondition::NotAllowed,
            StanzaErrorCondition::NotAuthorized => DefinedCondition::NotAuthorized,
            StanzaErrorCondition::UnexpectedRequest => DefinedCondition::UnexpectedRequest,
        }
    }
}

impl std::fmt::Display for StanzaErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// XMPP stanza error types (RFC 6120 Section 8.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorType {
    /// Retry after providing credentials
    Auth,
    /// Do not retry (unrecoverable error)
    Cancel,
    /// Retry after changing the data sent
    Modify,
    /// Retry after waiting (temporary error)
    Wait,
}

impl StanzaErrorType {
    /// Get the type attribute value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Cancel => "cancel",
            Self::Modify => "modify",
            Self::Wait => "wait",
        }
    }
}

impl From<StanzaErrorType> for ErrorType {
    fn from(error_type: StanzaErrorType) -> Self {
        match error_type {
            StanzaErrorType::Auth => ErrorType::Auth,
            StanzaErrorType::Cancel => ErrorType::Cancel,
            StanzaErrorType::Modify => ErrorType::Modify,
            StanzaErrorType::Wait => ErrorType::Wait,
        }
    }
}

impl std::fmt::Display for StanzaErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
