//! PubSub stanza parsing and building.
//!
//! Handles XML parsing of PubSub IQ stanzas and building of event
//! notifications and responses.

use minidom::Element;
use xmpp_parsers::iq::{Iq, IqType};

use crate::affiliation::NodeAffiliate;
use crate::error::PubSubError;
use crate::form::DataForm;
use crate::subscription::NodeSubscription;

/// Main PubSub namespace (XEP-0060).
pub const NS_PUBSUB: &str = "http://jabber.org/protocol/pubsub";

/// PubSub event namespace for notifications.
pub const NS_PUBSUB_EVENT: &str = "http://jabber.org/protocol/pubsub#event";

/// PubSub owner namespace for node management.
pub const NS_PUBSUB_OWNER: &str = "http://jabber.org/protocol/pubsub#owner";

/// PubSub errors namespace.
pub const NS_PUBSUB_ERRORS: &str = "http://jabber.org/protocol/pubsub#errors";

/// `FORM_TYPE` of node configuration forms.
pub const NS_PUBSUB_NODE_CONFIG: &str = "http://jabber.org/protocol/pubsub#node_config";

/// `FORM_TYPE` of subscription options forms.
pub const NS_PUBSUB_SUBSCRIBE_OPTIONS: &str = "http://jabber.org/protocol/pubsub#subscribe_options";

/// RFC 6120 stanza error conditions.
pub const NS_STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";

/// XEP-0131 stanza headers.
pub const NS_SHIM: &str = "http://jabber.org/protocol/shim";

/// XEP-0030 item discovery.
pub const NS_DISCO_ITEMS: &str = "http://jabber.org/protocol/disco#items";

/// Client stream namespace.
pub const NS_CLIENT: &str = "jabber:client";

/// A PubSub item with optional ID and payload.
#[derive(Debug, Clone)]
pub struct PubSubItem {
    /// Optional item ID. If None, server generates one.
    pub id: Option<String>,
    /// The item payload (any XML element).
    pub payload: Option<Element>,
}

impl PubSubItem {
    /// Create a new PubSubItem with an ID and payload.
    pub fn new(id: Option<String>, payload: Option<Element>) -> Self {
        Self { id, payload }
    }

    /// Create a PubSubItem from a minidom Element.
    pub fn from_element(elem: &Element) -> Self {
        let id = elem.attr("id").map(String::from);
        let payload = elem.children().next().cloned();
        Self { id, payload }
    }

    /// Build an item element for inclusion in responses.
    pub fn to_element(&self, ns: &str) -> Element {
        let mut builder = Element::builder("item", ns);

        if let Some(ref id) = self.id {
            builder = builder.attr("id", id);
        }

        if let Some(ref payload) = self.payload {
            builder = builder.append(payload.clone());
        }

        builder.build()
    }
}

/// One `<affiliation/>` of an owner affiliations request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffiliationEntry {
    /// Affected JID.
    pub jid: String,
    /// Requested affiliation.
    pub affiliation: String,
}

/// One `<subscription/>` of an owner subscriptions request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionEntry {
    /// Subscriber JID.
    pub jid: String,
    /// Requested state (`subscribed`, `none`, ...).
    pub subscription: String,
    /// Subscription the entry applies to.
    pub subid: Option<String>,
}

/// Parsed PubSub request types.
#[derive(Debug, Clone)]
pub enum PubSubRequest {
    /// Publish an item to a node.
    Publish {
        /// Node name to publish to.
        node: String,
        /// The item to publish.
        item: PubSubItem,
    },
    /// Retract (delete) items from a node.
    Retract {
        /// Node name.
        node: String,
        /// Item IDs to retract.
        item_ids: Vec<String>,
        /// Whether to notify subscribers of retraction.
        notify: bool,
    },
    /// Retrieve items from a node.
    Items {
        /// Node name.
        node: String,
        /// Maximum number of items to return.
        max_items: Option<u32>,
        /// Specific item IDs to retrieve.
        item_ids: Vec<String>,
    },
    /// Create a new node.
    CreateNode {
        /// Node name; `None` asks for an instant node.
        node: Option<String>,
        /// Initial configuration.
        config: Option<DataForm>,
    },
    /// Delete a node.
    DeleteNode {
        /// Node name.
        node: String,
    },
    /// Purge all items of a node.
    Purge {
        /// Node name.
        node: String,
    },
    /// Subscribe to a node.
    Subscribe {
        /// Node name.
        node: String,
        /// JID to subscribe.
        jid: String,
        /// Subscription options submitted with the request.
        options: Option<DataForm>,
    },
    /// Unsubscribe from a node.
    Unsubscribe {
        /// Node name.
        node: String,
        /// JID to unsubscribe.
        jid: String,
        /// Optional subscription ID.
        subid: Option<String>,
    },
    /// Retrieve subscription options.
    Options {
        /// Node name.
        node: String,
        /// Subscribed JID.
        jid: String,
        /// Optional subscription ID.
        subid: Option<String>,
    },
    /// Submit subscription options.
    SetOptions {
        /// Node name.
        node: String,
        /// Subscribed JID.
        jid: String,
        /// Optional subscription ID.
        subid: Option<String>,
        /// Submitted form.
        form: DataForm,
    },
    /// Retrieve the node configuration form.
    Configure {
        /// Node name.
        node: String,
    },
    /// Submit a node configuration form.
    SubmitConfiguration {
        /// Node name.
        node: String,
        /// Submitted form.
        form: DataForm,
    },
    /// List node affiliations (owner).
    Affiliations {
        /// Node name.
        node: String,
    },
    /// Change node affiliations (owner).
    ModifyAffiliations {
        /// Node name.
        node: String,
        /// Requested changes.
        entries: Vec<AffiliationEntry>,
    },
    /// List node subscriptions (owner).
    Subscriptions {
        /// Node name.
        node: String,
    },
    /// Change node subscriptions (owner).
    ModifySubscriptions {
        /// Node name.
        node: String,
        /// Requested changes.
        entries: Vec<SubscriptionEntry>,
    },
}

/// Check if an IQ is a PubSub request.
pub fn is_pubsub_iq(iq: &Iq) -> bool {
    match &iq.payload {
        IqType::Get(elem) | IqType::Set(elem) => {
            elem.name() == "pubsub" && (elem.ns() == NS_PUBSUB || elem.ns() == NS_PUBSUB_OWNER)
        }
        _ => false,
    }
}

fn required_attr(elem: &Element, name: &str) -> Result<String, PubSubError> {
    elem.attr(name)
        .map(String::from)
        .ok_or_else(|| PubSubError::bad_request(format!("Missing {} attribute", name)))
}

fn node_attr(elem: &Element) -> Result<String, PubSubError> {
    required_attr(elem, "node")
}

/// Parse a PubSub IQ stanza into a structured request.
pub fn parse_pubsub_iq(iq: &Iq) -> Result<PubSubRequest, PubSubError> {
    let (pubsub_elem, is_set) = match &iq.payload {
        IqType::Get(elem) => (elem, false),
        IqType::Set(elem) => (elem, true),
        _ => return Err(PubSubError::bad_request("PubSub IQ must be get or set")),
    };

    if pubsub_elem.name() != "pubsub" {
        return Err(PubSubError::bad_request("Expected pubsub element"));
    }

    if pubsub_elem.ns() == NS_PUBSUB_OWNER {
        return parse_owner_request(pubsub_elem, is_set);
    }
    if pubsub_elem.ns() != NS_PUBSUB {
        return Err(PubSubError::bad_request("Expected pubsub element"));
    }

    if let Some(publish) = pubsub_elem.get_child("publish", NS_PUBSUB) {
        let node = node_attr(publish)?;
        let item = publish
            .get_child("item", NS_PUBSUB)
            .map(PubSubItem::from_element)
            .unwrap_or_else(|| PubSubItem::new(None, None));

        return Ok(PubSubRequest::Publish { node, item });
    }

    if let Some(retract) = pubsub_elem.get_child("retract", NS_PUBSUB) {
        let node = node_attr(retract)?;
        let notify = retract
            .attr("notify")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let item_ids: Vec<String> = retract
            .children()
            .filter(|c| c.is("item", NS_PUBSUB))
            .filter_map(|c| c.attr("id").map(String::from))
            .collect();
        if item_ids.is_empty() {
            return Err(PubSubError::bad_request("Missing item id"));
        }

        return Ok(PubSubRequest::Retract {
            node,
            item_ids,
            notify,
        });
    }

    if let Some(items) = pubsub_elem.get_child("items", NS_PUBSUB) {
        let node = node_attr(items)?;
        let max_items = items.attr("max_items").and_then(|s| s.parse().ok());

        let item_ids: Vec<String> = items
            .children()
            .filter(|c| c.is("item", NS_PUBSUB))
            .filter_map(|c| c.attr("id").map(String::from))
            .collect();

        return Ok(PubSubRequest::Items {
            node,
            max_items,
            item_ids,
        });
    }

    if let Some(create) = pubsub_elem.get_child("create", NS_PUBSUB) {
        let node = create.attr("node").map(String::from);
        let config = pubsub_elem
            .get_child("configure", NS_PUBSUB)
            .and_then(DataForm::find_in);

        return Ok(PubSubRequest::CreateNode { node, config });
    }

    if let Some(subscribe) = pubsub_elem.get_child("subscribe", NS_PUBSUB) {
        let node = node_attr(subscribe)?;
        let jid = required_attr(subscribe, "jid")?;
        let options = pubsub_elem
            .get_child("options", NS_PUBSUB)
            .and_then(DataForm::find_in);

        return Ok(PubSubRequest::Subscribe { node, jid, options });
    }

    if let Some(unsubscribe) = pubsub_elem.get_child("unsubscribe", NS_PUBSUB) {
        let node = node_attr(unsubscribe)?;
        let jid = required_attr(unsubscribe, "jid")?;
        let subid = unsubscribe.attr("subid").map(String::from);

        return Ok(PubSubRequest::Unsubscribe { node, jid, subid });
    }

    if let Some(options) = pubsub_elem.get_child("options", NS_PUBSUB) {
        let node = node_attr(options)?;
        let jid = required_attr(options, "jid")?;
        let subid = options.attr("subid").map(String::from);

        if !is_set {
            return Ok(PubSubRequest::Options { node, jid, subid });
        }
        let form = DataForm::find_in(options)
            .ok_or_else(|| PubSubError::bad_request("Missing options form"))?;
        return Ok(PubSubRequest::SetOptions {
            node,
            jid,
            subid,
            form,
        });
    }

    Err(PubSubError::FeatureNotImplemented("unsupported-request"))
}

fn parse_owner_request(pubsub_elem: &Element, is_set: bool) -> Result<PubSubRequest, PubSubError> {
    if let Some(configure) = pubsub_elem.get_child("configure", NS_PUBSUB_OWNER) {
        let node = node_attr(configure)?;
        if !is_set {
            return Ok(PubSubRequest::Configure { node });
        }
        let form = DataForm::find_in(configure)
            .ok_or_else(|| PubSubError::bad_request("Missing configuration form"))?;
        return Ok(PubSubRequest::SubmitConfiguration { node, form });
    }

    if let Some(delete) = pubsub_elem.get_child("delete", NS_PUBSUB_OWNER) {
        return Ok(PubSubRequest::DeleteNode {
            node: node_attr(delete)?,
        });
    }

    if let Some(purge) = pubsub_elem.get_child("purge", NS_PUBSUB_OWNER) {
        return Ok(PubSubRequest::Purge {
            node: node_attr(purge)?,
        });
    }

    if let Some(affiliations) = pubsub_elem.get_child("affiliations", NS_PUBSUB_OWNER) {
        let node = node_attr(affiliations)?;
        if !is_set {
            return Ok(PubSubRequest::Affiliations { node });
        }
        let entries = affiliations
            .children()
            .filter(|c| c.is("affiliation", NS_PUBSUB_OWNER))
            .map(|c| {
                Ok(AffiliationEntry {
                    jid: required_attr(c, "jid")?,
                    affiliation: required_attr(c, "affiliation")?,
                })
            })
            .collect::<Result<Vec<_>, PubSubError>>()?;
        return Ok(PubSubRequest::ModifyAffiliations { node, entries });
    }

    if let Some(subscriptions) = pubsub_elem.get_child("subscriptions", NS_PUBSUB_OWNER) {
        let node = node_attr(subscriptions)?;
        if !is_set {
            return Ok(PubSubRequest::Subscriptions { node });
        }
        let entries = subscriptions
            .children()
            .filter(|c| c.is("subscription", NS_PUBSUB_OWNER))
            .map(|c| {
                Ok(SubscriptionEntry {
                    jid: required_attr(c, "jid")?,
                    subscription: required_attr(c, "subscription")?,
                    subid: c.attr("subid").map(String::from),
                })
            })
            .collect::<Result<Vec<_>, PubSubError>>()?;
        return Ok(PubSubRequest::ModifySubscriptions { node, entries });
    }

    Err(PubSubError::FeatureNotImplemented("unsupported-request"))
}

// ============================================================================
// Event payloads
// ============================================================================

fn event(child: Element) -> Element {
    Element::builder("event", NS_PUBSUB_EVENT)
        .append(child)
        .build()
}

/// `<event><items node><item id>payload</item>...</items></event>`.
pub fn build_items_event(node: &str, items: &[(String, Option<Element>)]) -> Element {
    let mut items_elem = Element::builder("items", NS_PUBSUB_EVENT).attr("node", node);

    for (id, payload) in items {
        items_elem = items_elem
            .append(PubSubItem::new(Some(id.clone()), payload.clone()).to_element(NS_PUBSUB_EVENT));
    }

    event(items_elem.build())
}

/// `<event><items node><retract id/>...</items></event>`.
pub fn build_retract_event(node: &str, item_ids: &[String]) -> Element {
    let mut items_elem = Element::builder("items", NS_PUBSUB_EVENT).attr("node", node);

    for id in item_ids {
        items_elem = items_elem.append(
            Element::builder("retract", NS_PUBSUB_EVENT)
                .attr("id", id)
                .build(),
        );
    }

    event(items_elem.build())
}

/// `<event><purge node/></event>`.
pub fn build_purge_event(node: &str) -> Element {
    event(
        Element::builder("purge", NS_PUBSUB_EVENT)
            .attr("node", node)
            .build(),
    )
}

/// `<event><delete node/></event>`.
pub fn build_delete_event(node: &str) -> Element {
    event(
        Element::builder("delete", NS_PUBSUB_EVENT)
            .attr("node", node)
            .build(),
    )
}

/// `<event><configuration node>form?</configuration></event>`.
pub fn build_configuration_event(node: &str, form: Option<&DataForm>) -> Element {
    let mut configuration = Element::builder("configuration", NS_PUBSUB_EVENT).attr("node", node);
    if let Some(form) = form {
        configuration = configuration.append(form.to_element("result"));
    }
    event(configuration.build())
}

/// Wrap an event in a message, adding SubID headers when the recipient
/// holds several subscriptions.
pub fn build_event_message(from: &str, to: &str, event: Element, subids: &[String]) -> Element {
    let mut message = Element::builder("message", NS_CLIENT)
        .attr("from", from)
        .attr("to", to)
        .append(event);

    if subids.len() > 1 {
        let mut headers = Element::builder("headers", NS_SHIM);
        for subid in subids {
            headers = headers.append(
                Element::builder("header", NS_SHIM)
                    .attr("name", "SubID")
                    .append(subid.as_str())
                    .build(),
            );
        }
        message = message.append(headers.build());
    }

    message.build()
}

// ============================================================================
// IQ results
// ============================================================================

fn pubsub(ns: &str, child: Element) -> Element {
    Element::builder("pubsub", ns).append(child).build()
}

/// `<pubsub><items node>...</items></pubsub>`.
pub fn build_items_result(node: &str, items: &[PubSubItem]) -> Element {
    let mut items_elem = Element::builder("items", NS_PUBSUB).attr("node", node);

    for item in items {
        items_elem = items_elem.append(item.to_element(NS_PUBSUB));
    }

    pubsub(NS_PUBSUB, items_elem.build())
}

/// `<pubsub><publish node><item id/></publish></pubsub>`.
pub fn build_publish_result(node: &str, item_id: &str) -> Element {
    let item_elem = Element::builder("item", NS_PUBSUB)
        .attr("id", item_id)
        .build();

    pubsub(
        NS_PUBSUB,
        Element::builder("publish", NS_PUBSUB)
            .attr("node", node)
            .append(item_elem)
            .build(),
    )
}

/// `<pubsub><create node/></pubsub>`.
pub fn build_create_result(node: &str) -> Element {
    pubsub(
        NS_PUBSUB,
        Element::builder("create", NS_PUBSUB)
            .attr("node", node)
            .build(),
    )
}

fn subscription_element(ns: &str, subscription: &NodeSubscription) -> Element {
    Element::builder("subscription", ns)
        .attr("node", &subscription.node_id)
        .attr("jid", subscription.jid.to_string())
        .attr("subid", &subscription.id)
        .attr("subscription", subscription.state.as_str())
        .build()
}

/// `<pubsub><subscription .../></pubsub>`.
pub fn build_subscription_result(subscription: &NodeSubscription) -> Element {
    pubsub(NS_PUBSUB, subscription_element(NS_PUBSUB, subscription))
}

/// `<pubsub><options node jid subid>form</options></pubsub>`.
pub fn build_options_result(subscription: &NodeSubscription) -> Element {
    pubsub(
        NS_PUBSUB,
        Element::builder("options", NS_PUBSUB)
            .attr("node", &subscription.node_id)
            .attr("jid", subscription.jid.to_string())
            .attr("subid", &subscription.id)
            .append(subscription.options_form().to_element("form"))
            .build(),
    )
}

/// `<pubsub xmlns=owner><configure node>form</configure></pubsub>`.
pub fn build_configure_result(node: &str, form: &DataForm) -> Element {
    pubsub(
        NS_PUBSUB_OWNER,
        Element::builder("configure", NS_PUBSUB_OWNER)
            .attr("node", node)
            .append(form.to_element("form"))
            .build(),
    )
}

/// `<pubsub xmlns=owner><affiliations node>...</affiliations></pubsub>`.
pub fn build_affiliations_result(node: &str, affiliates: &[NodeAffiliate]) -> Element {
    let mut affiliations = Element::builder("affiliations", NS_PUBSUB_OWNER).attr("node", node);
    for affiliate in affiliates {
        affiliations = affiliations.append(
            Element::builder("affiliation", NS_PUBSUB_OWNER)
                .attr("jid", affiliate.jid.to_string())
                .attr("affiliation", affiliate.affiliation.as_str())
                .build(),
        );
    }
    pubsub(NS_PUBSUB_OWNER, affiliations.build())
}

/// `<pubsub xmlns=owner><subscriptions node>...</subscriptions></pubsub>`.
pub fn build_subscriptions_result(node: &str, subscriptions: &[NodeSubscription]) -> Element {
    let mut list = Element::builder("subscriptions", NS_PUBSUB_OWNER).attr("node", node);
    for subscription in subscriptions {
        list = list.append(subscription_element(NS_PUBSUB_OWNER, subscription));
    }
    pubsub(NS_PUBSUB_OWNER, list.build())
}

/// One disco#items `<item/>`.
pub fn build_disco_item(jid: &str, node: Option<&str>, name: Option<&str>) -> Element {
    let mut item = Element::builder("item", NS_DISCO_ITEMS).attr("jid", jid);
    if let Some(node) = node {
        item = item.attr("node", node);
    }
    if let Some(name) = name {
        item = item.attr("name", name);
    }
    item.build()
}

/// `<query xmlns=disco#items node?>items</query>`.
pub fn build_disco_items(node: Option<&str>, items: Vec<Element>) -> Element {
    let mut query = Element::builder("query", NS_DISCO_ITEMS);
    if let Some(node) = node {
        query = query.attr("node", node);
    }
    for item in items {
        query = query.append(item);
    }
    query.build()
}

/// Build a result IQ answering `original_iq`.
pub fn build_result(original_iq: &Iq, payload: Option<Element>) -> Iq {
    Iq {
        from: original_iq.to.clone(),
        to: original_iq.from.clone(),
        id: original_iq.id.clone(),
        payload: IqType::Result(payload),
    }
}

/// Build an error IQ answering `original_iq`.
pub fn build_error(original_iq: &Iq, error: &PubSubError) -> Iq {
    Iq {
        from: original_iq.to.clone(),
        to: original_iq.from.clone(),
        id: original_iq.id.clone(),
        payload: IqType::Error(error.to_stanza_error()),
    }
}
