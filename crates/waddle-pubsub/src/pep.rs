//! XEP-0163: Personal Eventing Protocol (PEP).
//!
//! PEP is a simplified profile of PubSub that uses the bare JID as the
//! service address. Nodes are created on first publish with defaults that
//! depend on the node name.

use jid::BareJid;
use xmpp_parsers::iq::Iq;

use crate::node::{AccessModel, NodeConfig};
use crate::service::ServiceId;
use crate::stanzas::is_pubsub_iq;

/// Check if an IQ is a PEP request.
///
/// A PEP request is a PubSub IQ sent to the user's own bare JID, or with no
/// `to` at all.
pub fn is_pep_request(iq: &Iq, user_jid: &BareJid) -> bool {
    if !is_pubsub_iq(iq) {
        return false;
    }

    match &iq.to {
        None => true,
        Some(to_jid) => to_jid.to_bare() == *user_jid,
    }
}

/// The service an IQ from `from` addressed to `to` is meant for.
///
/// No `to` means the sender's own PEP service, a `to` with a localpart is
/// that user's PEP service, and anything else is the shared service.
pub fn target_service(from: &BareJid, to: Option<&jid::Jid>) -> ServiceId {
    match to {
        None => ServiceId::Personal(from.clone()),
        Some(to) if to.node().is_some() => ServiceId::Personal(to.to_bare()),
        Some(_) => ServiceId::Shared,
    }
}

/// Handler for PEP node defaults.
pub struct PepHandler;

impl PepHandler {
    /// Check if a node name is a well-known PEP node.
    pub fn is_well_known_node(node: &str) -> bool {
        // XEP-0402 Bookmarks
        node == "urn:xmpp:bookmarks:1" ||
        // XEP-0084 User Avatar
        node == "urn:xmpp:avatar:data" ||
        node == "urn:xmpp:avatar:metadata" ||
        // XEP-0172 User Nickname
        node == "http://jabber.org/protocol/nick" ||
        // XEP-0107 User Mood
        node == "http://jabber.org/protocol/mood" ||
        // XEP-0108 User Activity
        node == "http://jabber.org/protocol/activity" ||
        // XEP-0118 User Tune
        node == "http://jabber.org/protocol/tune" ||
        // XEP-0080 User Location
        node == "http://jabber.org/protocol/geoloc" ||
        // XEP-0277 Microblogging
        node == "urn:xmpp:microblog:0" ||
        // XEP-0384 OMEMO
        node.starts_with("eu.siacs.conversations.axolotl")
    }

    /// Default access model for an auto-created node.
    pub fn default_access_model_for_node(node: &str) -> AccessModel {
        // Bookmarks are private to the owner
        if node == "urn:xmpp:bookmarks:1" {
            return AccessModel::Whitelist;
        }

        // OMEMO bundles must be fetchable by anyone
        if node.starts_with("eu.siacs.conversations.axolotl") {
            return AccessModel::Open;
        }

        AccessModel::Presence
    }

    /// Configuration for a node created by a first publish.
    pub fn config_for_node(node: &str) -> NodeConfig {
        let mut config = NodeConfig::pep_default();
        config.access_model = Self::default_access_model_for_node(node);

        match node {
            // One item per bookmarked room.
            "urn:xmpp:bookmarks:1" => {
                config.max_items = 0;
                config.notify_retract = true;
            }
            "urn:xmpp:microblog:0" => config.max_items = 0,
            _ => {}
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minidom::Element;
    use xmpp_parsers::iq::IqType;

    use crate::stanzas::NS_PUBSUB;

    fn make_pubsub_iq(to: Option<&str>) -> Iq {
        let pubsub = Element::builder("pubsub", NS_PUBSUB)
            .append(Element::builder("items", NS_PUBSUB).attr("node", "test").build())
            .build();

        Iq {
            from: Some("user@example.com/resource".parse().expect("valid jid")),
            to: to.map(|s| s.parse().expect("valid jid")),
            id: "test-1".to_string(),
            payload: IqType::Get(pubsub),
        }
    }

    fn user() -> BareJid {
        "user@example.com".parse().expect("valid jid")
    }

    #[test]
    fn test_is_pep_request() {
        assert!(is_pep_request(&make_pubsub_iq(None), &user()));
        assert!(is_pep_request(&make_pubsub_iq(Some("user@example.com")), &user()));
        assert!(!is_pep_request(&make_pubsub_iq(Some("other@example.com")), &user()));
    }

    #[test]
    fn test_target_service() {
        assert_eq!(target_service(&user(), None), ServiceId::Personal(user()));

        let other: jid::Jid = "other@example.com/phone".parse().expect("valid jid");
        assert_eq!(
            target_service(&user(), Some(&other)),
            ServiceId::Personal("other@example.com".parse().expect("valid jid"))
        );

        let shared: jid::Jid = "pubsub.example.com".parse().expect("valid jid");
        assert_eq!(target_service(&user(), Some(&shared)), ServiceId::Shared);
    }

    #[test]
    fn test_is_well_known_node() {
        assert!(PepHandler::is_well_known_node("urn:xmpp:bookmarks:1"));
        assert!(PepHandler::is_well_known_node("urn:xmpp:avatar:data"));
        assert!(PepHandler::is_well_known_node("eu.siacs.conversations.axolotl.devicelist"));
        assert!(!PepHandler::is_well_known_node("custom:node"));
    }

    #[test]
    fn test_node_defaults() {
        let bookmarks = PepHandler::config_for_node("urn:xmpp:bookmarks:1");
        assert_eq!(bookmarks.access_model, AccessModel::Whitelist);
        assert_eq!(bookmarks.item_limit(), None);

        let omemo = PepHandler::config_for_node("eu.siacs.conversations.axolotl.devicelist");
        assert_eq!(omemo.access_model, AccessModel::Open);

        let mood = PepHandler::config_for_node("http://jabber.org/protocol/mood");
        assert_eq!(mood.access_model, AccessModel::Presence);
        assert!(mood.presence_based_delivery);
        assert_eq!(mood.item_limit(), Some(1));
    }
}
