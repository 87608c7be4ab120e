//! The capability probe: which named properties do the platform's sink and
//! decoder factories expose?
//!
//! Enumerates element factories filtered by `SINK | DECODER` plus the media
//! class matching a source type, then tries three increasingly expensive
//! ways to list a factory's properties:
//!
//! 1. the registry's cached element type, no instantiation
//! 2. loading the plugin feature, then retrying the cheap path
//! 3. instantiating a real element and listing its object properties
//!
//! Probe misses are recoverable: a factory that yields nothing at every
//! step is skipped.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use rialto_core::types::MediaSourceType;

/// Opaque handle to one element factory in the registry.
pub type FactoryHandle = u64;

/// Classification of a factory, derived from its klass metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FactoryClass {
    pub is_sink: bool,
    pub is_decoder: bool,
    pub media: Option<MediaSourceType>,
}

/// The registry collaborator wrapping element-factory enumeration.
pub trait FactoryRegistry: Send + Sync {
    /// All factories known to the registry.
    fn factories(&self) -> Vec<FactoryHandle>;

    /// A factory's klass metadata.
    fn classify(&self, factory: FactoryHandle) -> FactoryClass;

    /// Property names from the factory's cached element type, when the
    /// type is already loaded.
    fn cached_properties(&self, factory: FactoryHandle) -> Option<Vec<String>>;

    /// Forces the plugin feature to load; returns whether it loaded.
    fn load_feature(&self, factory: FactoryHandle) -> bool;

    /// Property names from a freshly-instantiated element.
    fn instantiated_properties(&self, factory: FactoryHandle) -> Option<Vec<String>>;
}

/// Probes factories for supported property names.
pub struct CapabilityProbe {
    registry: Arc<dyn FactoryRegistry>,
}

impl CapabilityProbe {
    #[must_use]
    pub fn new(registry: Arc<dyn FactoryRegistry>) -> Self {
        Self { registry }
    }

    /// Returns the subset of `property_names` that some sink or decoder
    /// factory matching `media_type` exposes.
    pub fn supported_properties(
        &self,
        media_type: MediaSourceType,
        property_names: &[String],
    ) -> Vec<String> {
        let mut found: HashSet<&str> = HashSet::new();

        for factory in self.matching_factories(media_type) {
            if found.len() == property_names.len() {
                break;
            }
            let Some(exposed) = self.probe_factory(factory) else {
                debug!(factory, "factory yielded no properties at any probe step");
                continue;
            };
            for wanted in property_names {
                if exposed.iter().any(|name| name == wanted) {
                    found.insert(wanted.as_str());
                }
            }
        }

        // Preserve the caller's ordering.
        property_names
            .iter()
            .filter(|name| found.contains(name.as_str()))
            .cloned()
            .collect()
    }

    fn matching_factories(&self, media_type: MediaSourceType) -> Vec<FactoryHandle> {
        self.registry
            .factories()
            .into_iter()
            .filter(|factory| {
                let class = self.registry.classify(*factory);
                if !class.is_sink && !class.is_decoder {
                    return false;
                }
                match media_type {
                    MediaSourceType::Unknown => true,
                    wanted => class.media == Some(wanted),
                }
            })
            .collect()
    }

    fn probe_factory(&self, factory: FactoryHandle) -> Option<Vec<String>> {
        if let Some(properties) = self.registry.cached_properties(factory) {
            return Some(properties);
        }
        if self.registry.load_feature(factory) {
            if let Some(properties) = self.registry.cached_properties(factory) {
                return Some(properties);
            }
        }
        self.registry.instantiated_properties(factory)
    }
}
