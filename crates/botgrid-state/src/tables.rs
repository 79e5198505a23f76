//! redb table definitions for the BotGrid state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Group definitions keyed by group name.
pub const GROUPS: TableDefinition<&str, &[u8]> = TableDefinition::new("groups");

/// Account leases keyed by account id.
pub const ACCOUNT_LEASES: TableDefinition<&str, &[u8]> = TableDefinition::new("account_leases");

/// Execution records keyed by `{session_id}:{instance}:{seq}`.
pub const EXECUTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("executions");
