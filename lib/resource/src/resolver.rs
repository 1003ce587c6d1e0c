//! Service address resolution for remote resources. The resolver is a
//! pluggable seam — static map here, DNS/registry backends elsewhere — so
//! the HTTP handler never hard-codes topology.

use common::{ErrorKind, TxError, TxResult};
use dashmap::DashMap;
use reqwest::Url;

pub trait AddressResolver: Send + Sync {
    /// Base URL of the service owning `resource_id`.
    fn resolve(&self, resource_id: &str) -> TxResult<Url>;
}

/// Fixed resource-to-URL table, populated at startup.
#[derive(Debug, Default)]
pub struct StaticResolver {
    addresses: DashMap<String, Url>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, resource_id: impl Into<String>, base_url: &str) -> TxResult<()> {
        let url = Url::parse(base_url).map_err(|e| {
            TxError::new(ErrorKind::ServiceNotResolvable, format!("bad url {}: {}", base_url, e))
        })?;
        self.addresses.insert(resource_id.into(), url);
        Ok(())
    }
}

impl AddressResolver for StaticResolver {
    fn resolve(&self, resource_id: &str) -> TxResult<Url> {
        self.addresses
            .get(resource_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| {
                TxError::new(
                    ErrorKind::ServiceNotResolvable,
                    format!("no address for resource {}", resource_id),
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_resources_resolve() {
        let resolver = StaticResolver::new();
        resolver.register("pay", "http://127.0.0.1:9200").unwrap();
        let url = resolver.resolve("pay").unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:9200/");
    }

    #[test]
    fn unknown_resources_are_not_resolvable() {
        let resolver = StaticResolver::new();
        let err = resolver.resolve("ghost").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServiceNotResolvable);
    }

    #[test]
    fn malformed_urls_are_rejected_at_registration() {
        let resolver = StaticResolver::new();
        assert!(resolver.register("bad", "not a url").is_err());
    }
}
