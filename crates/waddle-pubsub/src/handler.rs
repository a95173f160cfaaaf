//! IQ entry points: pubsub requests and disco#items queries.
//!
//! Both handlers always produce a reply IQ; engine errors become stanza
//! errors.

use jid::{BareJid, Jid};
use minidom::Element;
use tracing::{debug, warn};
use xmpp_parsers::iq::{Iq, IqType};

use crate::affiliation::Affiliation;
use crate::engine::{CreateNodeRequest, PubSubEngine};
use crate::error::PubSubError;
use crate::pep;
use crate::stanzas::{self, PubSubItem, PubSubRequest, NS_DISCO_ITEMS};
use crate::subscription::SubscriptionState;

fn parse_jid(s: &str) -> Result<Jid, PubSubError> {
    s.parse::<Jid>()
        .map_err(|_| PubSubError::InvalidJid(s.to_string()))
}

fn parse_bare_jid(s: &str) -> Result<BareJid, PubSubError> {
    s.parse::<BareJid>()
        .map_err(|_| PubSubError::InvalidJid(s.to_string()))
}

fn requester(iq: &Iq) -> Result<Jid, PubSubError> {
    iq.from
        .clone()
        .ok_or_else(|| PubSubError::bad_request("missing from address"))
}

/// Answer a pubsub IQ.
pub async fn handle_pubsub_iq(engine: &PubSubEngine, iq: &Iq) -> Iq {
    match dispatch_pubsub(engine, iq).await {
        Ok(payload) => stanzas::build_result(iq, payload),
        Err(e) => {
            debug!(id = %iq.id, error = %e, "PubSub request failed");
            stanzas::build_error(iq, &e)
        }
    }
}

async fn dispatch_pubsub(engine: &PubSubEngine, iq: &Iq) -> Result<Option<Element>, PubSubError> {
    let from = requester(iq)?;
    let service = pep::target_service(&from.to_bare(), iq.to.as_ref());
    let request = stanzas::parse_pubsub_iq(iq)?;

    match request {
        PubSubRequest::Publish { node, item } => {
            let item_id = engine
                .publish(&service, &from, &node, item.id, item.payload)
                .await?;
            Ok(Some(stanzas::build_publish_result(&node, &item_id)))
        }
        PubSubRequest::Retract {
            node,
            item_ids,
            notify,
        } => {
            engine
                .retract(&service, &from, &node, &item_ids, notify)
                .await?;
            Ok(None)
        }
        PubSubRequest::Items {
            node,
            max_items,
            item_ids,
        } => {
            let max = max_items.map(|n| n as usize);
            let items: Vec<PubSubItem> = engine
                .items(&service, &from, &node, max, &item_ids)
                .await?
                .into_iter()
                .map(|item| PubSubItem::new(Some(item.id), item.payload))
                .collect();
            Ok(Some(stanzas::build_items_result(&node, &items)))
        }
        PubSubRequest::CreateNode { node, config } => {
            let request = CreateNodeRequest {
                node_id: node,
                form: config,
                ..CreateNodeRequest::default()
            };
            let created = engine.create_node(&service, &from, request).await?;
            Ok(Some(stanzas::build_create_result(created.id())))
        }
        PubSubRequest::DeleteNode { node } => {
            engine.delete_node(&service, &from, &node).await?;
            Ok(None)
        }
        PubSubRequest::Purge { node } => {
            engine.purge(&service, &from, &node).await?;
            Ok(None)
        }
        PubSubRequest::Subscribe { node, jid, options } => {
            let jid = parse_jid(&jid)?;
            let subscription = engine
                .subscribe(&service, &from, &node, &jid, options.as_ref())
                .await?;
            Ok(Some(stanzas::build_subscription_result(&subscription)))
        }
        PubSubRequest::Unsubscribe { node, jid, subid } => {
            let jid = parse_jid(&jid)?;
            engine
                .unsubscribe(&service, &from, &node, &jid, subid.as_deref())
                .await?;
            Ok(None)
        }
        PubSubRequest::Options { node, jid, subid } => {
            let jid = parse_jid(&jid)?;
            let subscription = engine
                .subscription_options(&service, &from, &node, &jid, subid.as_deref())
                .await?;
            Ok(Some(stanzas::build_options_result(&subscription)))
        }
        PubSubRequest::SetOptions {
            node,
            jid,
            subid,
            form,
        } => {
            let jid = parse_jid(&jid)?;
            engine
                .configure_subscription(&service, &from, &node, &jid, subid.as_deref(), &form)
                .await?;
            Ok(None)
        }
        PubSubRequest::Configure { node } => {
            let form = engine.node_configuration(&service, &from, &node).await?;
            Ok(Some(stanzas::build_configure_result(&node, &form)))
        }
        PubSubRequest::SubmitConfiguration { node, form } => {
            engine.configure_node(&service, &from, &node, &form).await?;
            Ok(None)
        }
        PubSubRequest::Affiliations { node } => {
            let affiliates = engine.affiliations(&service, &from, &node).await?;
            Ok(Some(stanzas::build_affiliations_result(&node, &affiliates)))
        }
        PubSubRequest::ModifyAffiliations { node, entries } => {
            let changes = entries
                .iter()
                .map(|entry| {
                    let jid = parse_bare_jid(&entry.jid)?;
                    let affiliation = Affiliation::from_str(&entry.affiliation).ok_or_else(|| {
                        PubSubError::not_acceptable(format!(
                            "invalid affiliation {}",
                            entry.affiliation
                        ))
                    })?;
                    Ok((jid, affiliation))
                })
                .collect::<Result<Vec<_>, PubSubError>>()?;
            engine
                .set_affiliations(&service, &from, &node, &changes)
                .await?;
            Ok(None)
        }
        PubSubRequest::Subscriptions { node } => {
            let subscriptions = engine.node_subscriptions(&service, &from, &node).await?;
            Ok(Some(stanzas::build_subscriptions_result(&node, &subscriptions)))
        }
        PubSubRequest::ModifySubscriptions { node, entries } => {
            let changes = entries
                .iter()
                .map(|entry| {
                    let jid = parse_jid(&entry.jid)?;
                    let state = match entry.subscription.as_str() {
                        "none" => None,
                        other => Some(SubscriptionState::from_str(other).ok_or_else(|| {
                            PubSubError::not_acceptable(format!("invalid subscription {}", other))
                        })?),
                    };
                    Ok((jid, state, entry.subid.clone()))
                })
                .collect::<Result<Vec<_>, PubSubError>>()?;
            engine
                .set_node_subscriptions(&service, &from, &node, &changes)
                .await?;
            Ok(None)
        }
    }
}

/// Check if an IQ is a disco#items query.
pub fn is_disco_items_query(iq: &Iq) -> bool {
    match &iq.payload {
        IqType::Get(elem) => elem.name() == "query" && elem.ns() == NS_DISCO_ITEMS,
        _ => false,
    }
}

/// Answer a disco#items query addressed to a pubsub service or PEP account.
pub async fn handle_disco_items(engine: &PubSubEngine, iq: &Iq) -> Iq {
    let result = async {
        let IqType::Get(ref query) = iq.payload else {
            return Err(PubSubError::bad_request("disco#items must be IQ get"));
        };
        let from = requester(iq)?;
        let service = pep::target_service(&from.to_bare(), iq.to.as_ref());
        let node = query.attr("node");
        let items = engine.disco_items(&service, &from, node).await?;
        Ok(stanzas::build_disco_items(node, items))
    }
    .await;

    match result {
        Ok(query) => stanzas::build_result(iq, Some(query)),
        Err(e) => {
            warn!(id = %iq.id, error = %e, "disco#items query failed");
            stanzas::build_error(iq, &e)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::PubSubConfig;
    use crate::persistence::InMemoryPubSubStore;
    use crate::presence::InMemoryPresence;
    use crate::router::ChannelRouter;
    use crate::stanzas::{NS_PUBSUB, NS_PUBSUB_OWNER};

    async fn engine() -> PubSubEngine {
        let (router, _rx) = ChannelRouter::new(64);
        let engine = PubSubEngine::standalone(
            PubSubConfig::default(),
            Arc::new(InMemoryPubSubStore::new()),
            Arc::new(router),
            Arc::new(InMemoryPresence::new()),
        );
        engine.start().await.expect("start");
        engine
    }

    fn iq(from: &str, to: &str, payload: IqType) -> Iq {
        Iq {
            from: Some(from.parse().expect("valid jid")),
            to: Some(to.parse().expect("valid jid")),
            id: "req-1".to_string(),
            payload,
        }
    }

    fn pubsub(child: Element) -> Element {
        Element::builder("pubsub", NS_PUBSUB).append(child).build()
    }

    fn result_payload(reply: Iq) -> Option<Element> {
        match reply.payload {
            IqType::Result(payload) => payload,
            other => panic!("expected result, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_create_publish_items_over_iq() {
        let engine = engine().await;
        let owner = "hamlet@denmark.lit/castle";

        let create = iq(
            owner,
            "pubsub.localhost",
            IqType::Set(pubsub(
                Element::builder("create", NS_PUBSUB).attr("node", "musings").build(),
            )),
        );
        let created = result_payload(handle_pubsub_iq(&engine, &create).await);
        assert!(created.is_some());

        let publish = iq(
            owner,
            "pubsub.localhost",
            IqType::Set(pubsub(
                Element::builder("publish", NS_PUBSUB)
                    .attr("node", "musings")
                    .append(
                        Element::builder("item", NS_PUBSUB)
                            .attr("id", "soliloquy")
                            .append(Element::builder("entry", "urn:example").build())
                            .build(),
                    )
                    .build(),
            )),
        );
        let published = result_payload(handle_pubsub_iq(&engine, &publish).await)
            .expect("publish payload");
        let item = published
            .get_child("publish", NS_PUBSUB)
            .and_then(|p| p.get_child("item", NS_PUBSUB))
            .expect("item");
        assert_eq!(item.attr("id"), Some("soliloquy"));

        let items = iq(
            "horatio@denmark.lit/home",
            "pubsub.localhost",
            IqType::Get(pubsub(
                Element::builder("items", NS_PUBSUB).attr("node", "musings").build(),
            )),
        );
        let listed = result_payload(handle_pubsub_iq(&engine, &items).await).expect("items");
        let ids: Vec<_> = listed
            .get_child("items", NS_PUBSUB)
            .expect("items element")
            .children()
            .filter_map(|c| c.attr("id"))
            .collect();
        assert_eq!(ids, vec!["soliloquy"]);
    }

    #[tokio::test]
    async fn test_missing_node_is_item_not_found() {
        let engine = engine().await;
        let request = iq(
            "hamlet@denmark.lit/castle",
            "pubsub.localhost",
            IqType::Get(pubsub(
                Element::builder("items", NS_PUBSUB).attr("node", "nowhere").build(),
            )),
        );
        let reply = handle_pubsub_iq(&engine, &request).await;
        assert!(matches!(reply.payload, IqType::Error(_)));
        assert_eq!(reply.id, "req-1");
    }

    #[tokio::test]
    async fn test_invalid_affiliation_is_rejected() {
        let engine = engine().await;
        let owner = "hamlet@denmark.lit/castle";
        let create = iq(
            owner,
            "pubsub.localhost",
            IqType::Set(pubsub(
                Element::builder("create", NS_PUBSUB).attr("node", "n").build(),
            )),
        );
        handle_pubsub_iq(&engine, &create).await;

        let modify = iq(
            owner,
            "pubsub.localhost",
            IqType::Set(
                Element::builder("pubsub", NS_PUBSUB_OWNER)
                    .append(
                        Element::builder("affiliations", NS_PUBSUB_OWNER)
                            .attr("node", "n")
                            .append(
                                Element::builder("affiliation", NS_PUBSUB_OWNER)
                                    .attr("jid", "horatio@denmark.lit")
                                    .attr("affiliation", "emperor")
                                    .build(),
                            )
                            .build(),
                    )
                    .build(),
            ),
        );
        let reply = handle_pubsub_iq(&engine, &modify).await;
        assert!(matches!(reply.payload, IqType::Error(_)));
    }

    #[tokio::test]
    async fn test_disco_items_lists_root_nodes() {
        let engine = engine().await;
        let owner = "hamlet@denmark.lit/castle";
        for node in ["b", "a"] {
            let create = iq(
                owner,
                "pubsub.localhost",
                IqType::Set(pubsub(
                    Element::builder("create", NS_PUBSUB).attr("node", node).build(),
                )),
            );
            handle_pubsub_iq(&engine, &create).await;
        }

        let query = iq(
            owner,
            "pubsub.localhost",
            IqType::Get(Element::builder("query", NS_DISCO_ITEMS).build()),
        );
        assert!(is_disco_items_query(&query));
        let reply = result_payload(handle_disco_items(&engine, &query).await).expect("query");
        let nodes: Vec<_> = reply.children().filter_map(|c| c.attr("node")).collect();
        assert_eq!(nodes, vec!["a", "b"]);
    }
}
