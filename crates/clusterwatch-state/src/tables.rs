//! redb table definitions for the registry store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Health subscriptions keyed by `{cluster_id}`.
pub const SUBSCRIPTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("subscriptions");

/// Engine liveness records keyed by `{engine_id}`.
pub const ENGINES: TableDefinition<&str, &[u8]> = TableDefinition::new("engines");
