//! Shared helpers for the pubsub integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Once};
use std::time::Duration;

use jid::{BareJid, Jid};
use minidom::Element;
use tokio::sync::mpsc;
use waddle_pubsub::{
    ChannelRouter, ClusterTransport, DataForm, FormField, InMemoryPresence, OutboundStanza,
    PubSubConfig, PubSubEngine, PubSubStore,
};

/// Install a test log writer once. `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".to_string());
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Timeout for synchronous cluster tasks in tests.
pub const CLUSTER_TIMEOUT: Duration = Duration::from_millis(500);

/// An engine with its outbound queue and presence tracker.
pub struct TestMember {
    pub engine: PubSubEngine,
    pub presence: Arc<InMemoryPresence>,
    pub outbound: mpsc::Receiver<OutboundStanza>,
}

impl TestMember {
    /// Create and start an engine.
    pub async fn start(store: Arc<dyn PubSubStore>, transport: Option<Arc<dyn ClusterTransport>>) -> Self {
        init_tracing();
        let (router, outbound) = ChannelRouter::new(256);
        let presence = Arc::new(InMemoryPresence::new());
        let config = PubSubConfig {
            domain: "pubsub.shakespeare.lit".to_string(),
            cluster_timeout: CLUSTER_TIMEOUT,
            ..PubSubConfig::default()
        };
        let engine = match transport {
            Some(transport) => PubSubEngine::new(
                config,
                store,
                Arc::new(router),
                presence.clone(),
                transport,
            ),
            None => PubSubEngine::standalone(config, store, Arc::new(router), presence.clone()),
        };
        engine.start().await.expect("engine starts");
        Self {
            engine,
            presence,
            outbound,
        }
    }

    /// Everything routed so far.
    pub fn drain(&mut self) -> Vec<OutboundStanza> {
        let mut out = Vec::new();
        while let Ok(stanza) = self.outbound.try_recv() {
            out.push(stanza);
        }
        out
    }
}

pub fn jid(s: &str) -> Jid {
    s.parse().expect("valid jid")
}

pub fn bare(s: &str) -> BareJid {
    s.parse().expect("valid bare jid")
}

pub fn entry(text: &str) -> Element {
    Element::builder("entry", "http://www.w3.org/2005/Atom")
        .append(Element::builder("title", "http://www.w3.org/2005/Atom").append(text).build())
        .build()
}

/// A submit form of `form_type` with single-valued fields.
pub fn form(form_type: &str, fields: &[(&str, &str)]) -> DataForm {
    fields
        .iter()
        .fold(DataForm::new(form_type), |form, (var, value)| {
            form.with_field(FormField::new(*var, *value))
        })
}

/// Item IDs carried by an event notification.
pub fn event_item_ids(stanza: &OutboundStanza) -> Vec<String> {
    stanza
        .stanza
        .children()
        .flat_map(|event| event.children())
        .flat_map(|items| items.children())
        .filter_map(|item| item.attr("id").map(String::from))
        .collect()
}
