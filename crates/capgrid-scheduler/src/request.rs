//! Reservation requests.

use std::collections::BTreeMap;

use capgrid_state::{Link, TenantScope};
use serde::{Deserialize, Serialize};

use crate::error::ReservationError;

/// Immutable input of one reservation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationRequest {
    pub description_link: Link,
    pub resource_count: u64,
    /// Tenant/group links. Empty = global.
    #[serde(default)]
    pub tenant_scope: TenantScope,
    #[serde(default)]
    pub custom_properties: BTreeMap<String, String>,
    /// Correlation id for deterministic host grouping. Defaults to the
    /// task id when unset.
    #[serde(default)]
    pub context_id: Option<String>,
}

impl ReservationRequest {
    pub fn new(description_link: &str, resource_count: u64) -> Self {
        Self {
            description_link: description_link.to_string(),
            resource_count,
            tenant_scope: TenantScope::global(),
            custom_properties: BTreeMap::new(),
            context_id: None,
        }
    }

    pub fn for_tenants(mut self, tenants: &[&str]) -> Self {
        self.tenant_scope = TenantScope::new(tenants.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn with_context_id(mut self, context_id: &str) -> Self {
        self.context_id = Some(context_id.to_string());
        self
    }

    pub fn with_property(mut self, key: &str, value: &str) -> Self {
        self.custom_properties
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn validate(&self) -> Result<(), ReservationError> {
        if self.resource_count < 1 {
            return Err(ReservationError::Validation(format!(
                "resource count must be at least 1, got {}",
                self.resource_count
            )));
        }
        if self.description_link.is_empty() {
            return Err(ReservationError::Validation(
                "resource description link is empty".to_string(),
            ));
        }
        Ok(())
    }
}
