//! redb table definitions for the capgrid state store.
//!
//! Each table uses `&str` keys (document self links, or task ids) and
//! `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Capacity pools keyed by self link.
pub const CAPACITY_POOLS: TableDefinition<&str, &[u8]> = TableDefinition::new("capacity_pools");

/// Resource pools keyed by self link.
pub const RESOURCE_POOLS: TableDefinition<&str, &[u8]> = TableDefinition::new("resource_pools");

pub const ENDPOINTS: TableDefinition<&str, &[u8]> = TableDefinition::new("endpoints");

pub const PROFILES: TableDefinition<&str, &[u8]> = TableDefinition::new("profiles");

pub const DESCRIPTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("descriptions");

pub const HOSTS: TableDefinition<&str, &[u8]> = TableDefinition::new("hosts");

/// Journaled task documents keyed by task id.
pub const TASKS: TableDefinition<&str, &[u8]> = TableDefinition::new("tasks");
