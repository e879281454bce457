//! Shared types used across capgrid crates.

use serde::{Deserialize, Serialize};

/// Kind of resource a capacity pool hands out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Compute,
    Container,
}

impl ResourceType {
    pub fn label(&self) -> &'static str {
        match self {
            ResourceType::Compute => "compute",
            ResourceType::Container => "container",
        }
    }
}

/// Ordered tenant/group links a request is restricted to.
///
/// An empty scope is the global scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantScope(Vec<String>);

impl TenantScope {
    pub fn new(links: Vec<String>) -> Self {
        Self(links)
    }

    pub fn global() -> Self {
        Self(Vec::new())
    }

    pub fn is_global(&self) -> bool {
        self.0.is_empty()
    }

    pub fn links(&self) -> &[String] {
        &self.0
    }

    /// Strict membership used for capacity pools: a tenant scope only sees
    /// entities tagged with one of its links, the global scope only sees
    /// untagged (global) entities.
    pub fn owns(&self, entity_links: &[String]) -> bool {
        if self.is_global() {
            entity_links.is_empty()
        } else {
            entity_links.iter().any(|l| self.0.contains(l))
        }
    }

    /// Relaxed visibility used for endpoints, profiles and hosts: global
    /// entities are visible from every scope.
    pub fn sees(&self, entity_links: &[String]) -> bool {
        entity_links.is_empty() || self.owns(entity_links)
    }
}

impl From<Vec<String>> for TenantScope {
    fn from(links: Vec<String>) -> Self {
        Self(links)
    }
}
