//! Engine configuration.
//!
//! Node configuration arrives through data forms; this struct only carries the
//! engine's own tunables, loaded the same way the server loads its XMPP
//! settings: defaults overridden by `WADDLE_PUBSUB_*` environment variables.

use std::time::Duration;

use jid::BareJid;
use tracing::warn;

/// Lower bound for the periodic persistence flush.
pub const MIN_FLUSH_INTERVAL: Duration = Duration::from_secs(20);

/// Configuration for the PubSub engine.
#[derive(Debug, Clone)]
pub struct PubSubConfig {
    /// Address of the shared service, used as `from` on its notifications.
    pub domain: String,
    /// Period of the persistence flush timer (never below [`MIN_FLUSH_INTERVAL`]).
    pub flush_interval: Duration,
    /// Pending item count that triggers an early flush.
    pub max_items_flush: usize,
    /// Idle time after which a personal eventing service is evicted from cache.
    pub personal_service_idle_timeout: Duration,
    /// How often the idle sweep runs.
    pub sweep_interval: Duration,
    /// Per-member timeout for synchronous cluster tasks.
    pub cluster_timeout: Duration,
    /// Whether one JID may hold several subscriptions to the same node.
    pub multiple_subscriptions: bool,
    /// Service administrators (treated as owners of every node).
    pub admins: Vec<BareJid>,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            domain: "pubsub.localhost".to_string(),
            flush_interval: Duration::from_secs(120),
            max_items_flush: 1000,
            personal_service_idle_timeout: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
            cluster_timeout: Duration::from_millis(5000),
            multiple_subscriptions: true,
            admins: Vec::new(),
        }
    }
}

impl PubSubConfig {
    /// Create configuration from environment variables.
    ///
    /// Environment variables:
    /// - `WADDLE_PUBSUB_DOMAIN`: shared service address (default: pubsub.localhost)
    /// - `WADDLE_PUBSUB_FLUSH_INTERVAL_SECS`: flush period, minimum 20 (default: 120)
    /// - `WADDLE_PUBSUB_MAX_ITEMS_FLUSH`: early flush threshold (default: 1000)
    /// - `WADDLE_PUBSUB_PERSONAL_IDLE_SECS`: personal service idle timeout (default: 1800)
    /// - `WADDLE_PUBSUB_SWEEP_INTERVAL_SECS`: idle sweep period (default: 300)
    /// - `WADDLE_PUBSUB_CLUSTER_TIMEOUT_MS`: synchronous cluster task timeout (default: 5000)
    /// - `WADDLE_PUBSUB_MULTIPLE_SUBSCRIPTIONS`: allow several subscriptions per JID (default: true)
    /// - `WADDLE_PUBSUB_ADMINS`: comma-separated bare JIDs of service admins
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let domain = std::env::var("WADDLE_PUBSUB_DOMAIN").unwrap_or(defaults.domain);

        let flush_interval = env_u64("WADDLE_PUBSUB_FLUSH_INTERVAL_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.flush_interval)
            .max(MIN_FLUSH_INTERVAL);

        let max_items_flush = env_u64("WADDLE_PUBSUB_MAX_ITEMS_FLUSH")
            .map(|v| v as usize)
            .unwrap_or(defaults.max_items_flush);

        let personal_service_idle_timeout = env_u64("WADDLE_PUBSUB_PERSONAL_IDLE_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.personal_service_idle_timeout);

        let sweep_interval = env_u64("WADDLE_PUBSUB_SWEEP_INTERVAL_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.sweep_interval);

        let cluster_timeout = env_u64("WADDLE_PUBSUB_CLUSTER_TIMEOUT_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.cluster_timeout);

        let multiple_subscriptions = std::env::var("WADDLE_PUBSUB_MULTIPLE_SUBSCRIPTIONS")
            .map(|v| v.to_lowercase() != "false" && v != "0")
            .unwrap_or(defaults.multiple_subscriptions);

        let admins = std::env::var("WADDLE_PUBSUB_ADMINS")
            .map(|v| parse_admins(&v))
            .unwrap_or_default();

        Self {
            domain,
            flush_interval,
            max_items_flush,
            personal_service_idle_timeout,
            sweep_interval,
            cluster_timeout,
            multiple_subscriptions,
            admins,
        }
    }

    /// Whether the given bare JID is a service administrator.
    pub fn is_admin(&self, jid: &BareJid) -> bool {
        self.admins.iter().any(|admin| admin == jid)
    }
}

fn env_u64(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(variable = name, value = %raw, "Ignoring non-numeric configuration value");
            None
        }
    }
}

fn parse_admins(raw: &str) -> Vec<BareJid> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| match s.parse::<BareJid>() {
            Ok(jid) => Some(jid),
            Err(e) => {
                warn!(entry = s, error = %e, "Dropping invalid admin JID");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PubSubConfig::default();
        assert_eq!(config.flush_interval, Duration::from_secs(120));
        assert_eq!(config.max_items_flush, 1000);
        assert!(config.multiple_subscriptions);
        assert!(config.admins.is_empty());
    }

    #[test]
    fn test_parse_admins_drops_invalid_entries() {
        let admins = parse_admins("admin@example.com, ,user@example.com/phone, ops@example.com");
        assert_eq!(admins.len(), 2);
        assert_eq!(admins[0].to_string(), "admin@example.com");
        assert_eq!(admins[1].to_string(), "ops@example.com");
    }

    #[test]
    fn test_is_admin() {
        let config = PubSubConfig {
            admins: parse_admins("admin@example.com"),
            ..Default::default()
        };
        let admin: BareJid = "admin@example.com".parse().expect("valid jid");
        let user: BareJid = "user@example.com".parse().expect("valid jid");
        assert!(config.is_admin(&admin));
        assert!(!config.is_admin(&user));
    }
}
