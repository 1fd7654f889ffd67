//! Provider registry: maps a connection's `platform_type` to an adapter.
//!
//! Grounded on the teacher's `sources/factory.rs` name-to-implementation
//! lookup, narrowed from a generic source factory to a fixed three-way
//! provider map plus an `Unknown` fallthrough (spec §7 `ProviderUnknown`).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::{google::GoogleCalendarProvider, ics::IcsCalendarProvider, stub::StubCalendarProvider};
use super::CalendarProvider;

pub struct ProviderRegistry {
    providers: HashMap<&'static str, Arc<dyn CalendarProvider>>,
}

impl ProviderRegistry {
    pub fn new(request_timeout: Duration) -> Self {
        let mut providers: HashMap<&'static str, Arc<dyn CalendarProvider>> = HashMap::new();
        providers.insert(
            "google",
            Arc::new(GoogleCalendarProvider::new(request_timeout)),
        );
        let naver: Arc<dyn CalendarProvider> = Arc::new(IcsCalendarProvider::new(request_timeout));
        providers.insert("naver", Arc::clone(&naver));
        providers.insert("ics", naver);
        providers.insert("kakao", Arc::new(StubCalendarProvider::new("kakao")));
        Self { providers }
    }

    pub fn get(&self, platform_type: &str) -> Option<Arc<dyn CalendarProvider>> {
        self.providers.get(platform_type).cloned()
    }

    /// Register (or override) a single provider under `platform_type`.
    /// Used by integration tests to substitute a scripted fake for a real
    /// network-backed adapter without changing the lookup surface.
    pub fn with_provider(
        mut self,
        platform_type: &'static str,
        provider: Arc<dyn CalendarProvider>,
    ) -> Self {
        self.providers.insert(platform_type, provider);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_platforms_resolve() {
        let registry = ProviderRegistry::new(Duration::from_secs(30));
        assert!(registry.get("google").is_some());
        assert!(registry.get("naver").is_some());
        assert!(registry.get("kakao").is_some());
    }

    #[test]
    fn test_unknown_platform_resolves_to_none() {
        let registry = ProviderRegistry::new(Duration::from_secs(30));
        assert!(registry.get("bogus").is_none());
    }
}
