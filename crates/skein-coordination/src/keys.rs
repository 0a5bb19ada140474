//! Store key naming.
//!
//! All keys live under one namespace prefix so several deployments can share a
//! store: `{ns}:lock:{name}`, `{ns}:limiter:{name}`,
//! `{ns}:queue:{channel}:ready` and `{ns}:queue:{channel}:inflight`.

/// Key builder for one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    namespace: String,
}

impl KeySpace {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn lock(&self, name: &str) -> String {
        format!("{}:lock:{}", self.namespace, name)
    }

    pub fn limiter(&self, name: &str) -> String {
        format!("{}:limiter:{}", self.namespace, name)
    }

    pub fn channel(&self, channel: &str) -> ChannelKeys {
        ChannelKeys {
            ready: format!("{}:queue:{}:ready", self.namespace, channel),
            in_flight: format!("{}:queue:{}:inflight", self.namespace, channel),
        }
    }
}

/// The two ordered collections that make up a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelKeys {
    /// Messages waiting for a consumer, scored by enqueue/retry time.
    pub ready: String,
    /// Leased messages, scored by lease deadline.
    pub in_flight: String,
}
