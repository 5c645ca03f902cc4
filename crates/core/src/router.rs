//! Routing from a device's reported identity to its protocol adapter.
//!
//! Routes are checked in registration order, so a model-specific route must be
//! registered before the manufacturer-wide route it refines.

use crate::adapters::fiio::FiioAdapter;
use crate::adapters::jds::JdsAdapter;
use crate::adapters::moondrop::MoondropAdapter;
use crate::adapters::moondrop_legacy::MoondropLegacyAdapter;
use crate::adapters::qudelix::QudelixAdapter;
use crate::adapters::topping::ToppingAdapter;
use crate::adapters::{AdapterConfig, PeqAdapter};
use std::sync::Arc;
use tracing::debug;

/// Which product names a route accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelMatcher {
    Any,
    /// Case-insensitive exact product names.
    OneOf(&'static [&'static str]),
}

impl ModelMatcher {
    fn matches(&self, model: &str) -> bool {
        match self {
            Self::Any => true,
            Self::OneOf(models) => models.iter().any(|m| m.eq_ignore_ascii_case(model)),
        }
    }
}

struct AdapterRoute {
    /// Lowercase substrings of the manufacturer string.
    manufacturers: &'static [&'static str],
    models: ModelMatcher,
    adapter: Arc<dyn PeqAdapter>,
}

/// Ordered `(manufacturer, model) -> adapter` table.
pub struct AdapterRegistry {
    routes: Vec<AdapterRoute>,
}

/// Moondrop products still on the register-addressed firmware.
pub const MOONDROP_LEGACY_MODELS: &[&str] = &["MOONDROP Dawn Pro", "ECHO-A"];

impl AdapterRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    /// Every supported vendor, all sharing `config`.
    pub fn with_defaults(config: AdapterConfig) -> Self {
        let mut registry = Self::new();
        registry
            .register(
                &["fiio", "jadeaudio"],
                ModelMatcher::Any,
                Arc::new(FiioAdapter::new(config)),
            )
            .register(
                &["moondrop"],
                ModelMatcher::OneOf(MOONDROP_LEGACY_MODELS),
                Arc::new(MoondropLegacyAdapter::new(config)),
            )
            .register(
                &["moondrop"],
                ModelMatcher::Any,
                Arc::new(MoondropAdapter::new(config)),
            )
            .register(
                &["qudelix"],
                ModelMatcher::Any,
                Arc::new(QudelixAdapter::new(config)),
            )
            .register(
                &["jds labs"],
                ModelMatcher::Any,
                Arc::new(JdsAdapter::new(config)),
            )
            .register(
                &["topping"],
                ModelMatcher::Any,
                Arc::new(ToppingAdapter::new(config)),
            );
        registry
    }

    /// Append a route. `manufacturers` are lowercase substrings.
    pub fn register(
        &mut self,
        manufacturers: &'static [&'static str],
        models: ModelMatcher,
        adapter: Arc<dyn PeqAdapter>,
    ) -> &mut Self {
        self.routes.push(AdapterRoute {
            manufacturers,
            models,
            adapter,
        });
        self
    }

    /// First adapter whose route accepts this device, if any.
    pub fn resolve_adapter(&self, manufacturer: &str, model: &str) -> Option<Arc<dyn PeqAdapter>> {
        let manufacturer = manufacturer.trim().to_lowercase();
        let model = model.trim();
        let route = self.routes.iter().find(|r| {
            r.manufacturers.iter().any(|m| manufacturer.contains(m)) && r.models.matches(model)
        })?;
        debug!(
            %manufacturer,
            model,
            adapter = route.adapter.name(),
            "Adapter resolved"
        );
        Some(Arc::clone(&route.adapter))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::with_defaults(AdapterConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter_name(manufacturer: &str, model: &str) -> Option<&'static str> {
        AdapterRegistry::default()
            .resolve_adapter(manufacturer, model)
            .map(|a| a.name())
    }

    #[test]
    fn fiio_family_shares_one_adapter() {
        assert_eq!(adapter_name("FiiO", "FIIO KA17"), Some("fiio"));
        assert_eq!(adapter_name("JadeAudio", "JA11"), Some("fiio"));
    }

    #[test]
    fn moondrop_legacy_models_take_precedence() {
        assert_eq!(
            adapter_name("Moondrop", "MOONDROP Dawn Pro"),
            Some("moondrop-legacy")
        );
        assert_eq!(adapter_name("MOONDROP", "echo-a"), Some("moondrop-legacy"));
        assert_eq!(adapter_name("Moondrop", "Quark2"), Some("moondrop"));
    }

    #[test]
    fn manufacturer_matched_by_substring() {
        assert_eq!(adapter_name("JDS Labs, Inc.", "Element IV"), Some("jds-labs"));
        assert_eq!(adapter_name("Qudelix Inc", "5K"), Some("qudelix"));
        assert_eq!(adapter_name("TOPPING", "DX5"), Some("topping"));
    }

    #[test]
    fn unknown_manufacturer_has_no_adapter() {
        assert_eq!(adapter_name("Logitech", "G502"), None);
        assert!(AdapterRegistry::new().is_empty());
    }
}
