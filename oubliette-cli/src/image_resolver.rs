//! Resolves a project's configured container type to an image reference.

use std::collections::HashMap;

use oubliette_core::container::ImageResolver;
use oubliette_core::ContainerTypeEntry;

/// Looks up an image in the deployment's configured `container_types`
/// table (`oubliette-core::config::Config::container_types`).
pub struct ConfigImageResolver {
    container_types: HashMap<String, ContainerTypeEntry>,
}

impl ConfigImageResolver {
    pub fn new(container_types: HashMap<String, ContainerTypeEntry>) -> Self {
        Self { container_types }
    }
}

impl ImageResolver for ConfigImageResolver {
    fn resolve(&self, container_type: &str) -> Option<String> {
        self.container_types
            .get(container_type)
            .map(|entry| entry.image.clone())
    }
}
