//! Outbound stanza routing seam.

use jid::Jid;
use minidom::Element;
use tokio::sync::mpsc;
use tracing::warn;

/// Hands stanzas to the stream layer. Delivery is never awaited.
pub trait NotificationRouter: Send + Sync {
    /// Route a stanza addressed to `to`.
    fn route(&self, to: &Jid, stanza: Element);
}

/// A stanza on its way to the stream layer.
#[derive(Debug, Clone)]
pub struct OutboundStanza {
    /// Recipient.
    pub to: Jid,
    /// The stanza.
    pub stanza: Element,
}

/// Router backed by a bounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelRouter {
    sender: mpsc::Sender<OutboundStanza>,
}

impl ChannelRouter {
    /// Create a router and the receiving end the stream layer drains.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<OutboundStanza>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }
}

impl NotificationRouter for ChannelRouter {
    fn route(&self, to: &Jid, stanza: Element) {
        let outbound = OutboundStanza {
            to: to.clone(),
            stanza,
        };
        if let Err(e) = self.sender.try_send(outbound) {
            warn!(to = %to, error = %e, "Dropping outbound pubsub stanza");
        }
    }
}
