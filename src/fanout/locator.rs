use async_trait::async_trait;

use crate::config::LocatorConfig;

/// Looks up which peer serves a destination host
#[async_trait]
pub trait Locator: Send + Sync {
    /// Name of the peer (command or address) for `host`, if any.
    async fn locate(&self, host: &str) -> Option<String>;
}

/// Locator backed by a fixed host → peer table
#[derive(Debug, Clone, Default)]
pub struct StaticLocator {
    config: LocatorConfig,
}

impl StaticLocator {
    pub fn new(mut config: LocatorConfig) -> Self {
        config.hosts = config
            .hosts
            .into_iter()
            .map(|(host, peer)| (host.to_ascii_lowercase(), peer))
            .collect();
        Self { config }
    }
}

#[async_trait]
impl Locator for StaticLocator {
    async fn locate(&self, host: &str) -> Option<String> {
        self.config
            .hosts
            .get(&host.to_ascii_lowercase())
            .or(self.config.default.as_ref())
            .cloned()
    }
}
