use std::time::Duration;

use serde::Deserialize;

use fedmq_utils::deserialize_duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Network {
    #[serde(default)]
    pub connectors: Vec<NetworkConnector>,
}

/// Settings for one network connector, every bridge it establishes inherits them.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConnector {
    #[serde(default = "NetworkConnector::name_default")]
    pub name: String,
    //Only forward destinations that have consumers on the remote broker.
    #[serde(default)]
    pub dynamic_only: bool,
    //Maximum number of bridge traversals a message may make.
    #[serde(default = "NetworkConnector::network_ttl_default")]
    pub network_ttl: u32,
    //Credit window of each upstream subscription.
    #[serde(default = "NetworkConnector::prefetch_size_default")]
    pub prefetch_size: usize,
    //Collapse remote consumers on the same destination into one subscription.
    #[serde(default = "NetworkConnector::conduit_subscriptions_default")]
    pub conduit_subscriptions: bool,
    #[serde(default)]
    pub decrease_network_consumer_priority: bool,
    //Hand inbound forwards to an ordered worker that waits out flow control. When off, they
    //are enqueued on the reader and refused at once while the local broker is over its ceiling.
    #[serde(default = "NetworkConnector::dispatch_async_default")]
    pub dispatch_async: bool,
    #[serde(default = "NetworkConnector::handshake_timeout_default", deserialize_with = "deserialize_duration")]
    pub handshake_timeout: Duration,
    #[serde(default = "NetworkConnector::drain_timeout_default", deserialize_with = "deserialize_duration")]
    pub drain_timeout: Duration,
    //Pause of a subscription after the remote broker refused one of its forwards.
    #[serde(default = "NetworkConnector::redelivery_delay_default", deserialize_with = "deserialize_duration")]
    pub redelivery_delay: Duration,
    //Destination names (or prefixes ending with '>') never bridged.
    #[serde(default)]
    pub excluded_destinations: Vec<String>,
}

impl Default for NetworkConnector {
    #[inline]
    fn default() -> Self {
        Self {
            name: Self::name_default(),
            dynamic_only: false,
            network_ttl: Self::network_ttl_default(),
            prefetch_size: Self::prefetch_size_default(),
            conduit_subscriptions: Self::conduit_subscriptions_default(),
            decrease_network_consumer_priority: false,
            dispatch_async: Self::dispatch_async_default(),
            handshake_timeout: Self::handshake_timeout_default(),
            drain_timeout: Self::drain_timeout_default(),
            redelivery_delay: Self::redelivery_delay_default(),
            excluded_destinations: Vec::new(),
        }
    }
}

impl NetworkConnector {
    fn name_default() -> String {
        "bridge".into()
    }
    fn network_ttl_default() -> u32 {
        1
    }
    fn prefetch_size_default() -> usize {
        1000
    }
    fn conduit_subscriptions_default() -> bool {
        true
    }
    fn dispatch_async_default() -> bool {
        true
    }
    fn handshake_timeout_default() -> Duration {
        Duration::from_secs(10)
    }
    fn drain_timeout_default() -> Duration {
        Duration::from_secs(5)
    }
    fn redelivery_delay_default() -> Duration {
        Duration::from_secs(1)
    }

    #[inline]
    pub fn is_excluded(&self, destination: &str) -> bool {
        self.excluded_destinations.iter().any(|pattern| match pattern.strip_suffix('>') {
            Some(prefix) => destination.starts_with(prefix),
            None => pattern == destination,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::NetworkConnector;

    #[test]
    fn test_excluded() {
        let c = NetworkConnector {
            excluded_destinations: vec!["audit".into(), "local.>".into()],
            ..Default::default()
        };
        assert!(c.is_excluded("audit"));
        assert!(c.is_excluded("local.orders"));
        assert!(!c.is_excluded("orders"));
        assert!(!c.is_excluded("audit.x"));
    }
}
