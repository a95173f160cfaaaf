//! Node affiliations (XEP-0060 Section 4.1).

use std::fmt;

use jid::BareJid;
use serde::{Deserialize, Serialize};

/// A user's standing on a node, ordered from least to most privileged.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Affiliation {
    /// Blocked from every interaction with the node
    Outcast,
    /// No standing beyond an optional subscription
    #[default]
    None,
    /// May subscribe and retrieve items on whitelist nodes
    Member,
    /// May publish items
    Publisher,
    /// Full configuration rights
    Owner,
}

impl Affiliation {
    /// Parse an affiliation from its XEP-0060 attribute value.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "owner" => Some(Affiliation::Owner),
            "publisher" => Some(Affiliation::Publisher),
            "member" => Some(Affiliation::Member),
            "none" => Some(Affiliation::None),
            "outcast" => Some(Affiliation::Outcast),
            _ => None,
        }
    }

    /// Attribute value for this affiliation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Affiliation::Owner => "owner",
            Affiliation::Publisher => "publisher",
            Affiliation::Member => "member",
            Affiliation::None => "none",
            Affiliation::Outcast => "outcast",
        }
    }

    /// Whether this affiliation may publish under the `publishers` model.
    pub fn can_publish(&self) -> bool {
        matches!(self, Affiliation::Owner | Affiliation::Publisher)
    }
}

impl fmt::Display for Affiliation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An affiliation entry on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAffiliate {
    /// Affiliated bare JID.
    pub jid: BareJid,
    /// Current affiliation.
    pub affiliation: Affiliation,
}

impl NodeAffiliate {
    /// Create a new affiliate.
    pub fn new(jid: BareJid, affiliation: Affiliation) -> Self {
        Self { jid, affiliation }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_affiliation_round_trip_names() {
        for aff in [
            Affiliation::Owner,
            Affiliation::Publisher,
            Affiliation::Member,
            Affiliation::None,
            Affiliation::Outcast,
        ] {
            assert_eq!(Affiliation::from_str(aff.as_str()), Some(aff));
        }
        assert_eq!(Affiliation::from_str("admin"), None);
    }

    #[test]
    fn test_affiliation_ordering() {
        assert!(Affiliation::Owner > Affiliation::Publisher);
        assert!(Affiliation::Member > Affiliation::None);
        assert!(Affiliation::None > Affiliation::Outcast);
    }

    #[test]
    fn test_can_publish() {
        assert!(Affiliation::Owner.can_publish());
        assert!(Affiliation::Publisher.can_publish());
        assert!(!Affiliation::Member.can_publish());
    }
}
