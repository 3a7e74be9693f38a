//! redb table definitions for the DroneGrid state store.
//!
//! Record tables use `u64` keys (the record id) and `&[u8]` values
//! (JSON-serialized domain types).

use redb::TableDefinition;

/// Hosts keyed by host id.
pub const HOSTS: TableDefinition<u64, &[u8]> = TableDefinition::new("hosts");

/// Labels keyed by label id.
pub const LABELS: TableDefinition<u64, &[u8]> = TableDefinition::new("labels");

/// Atomic groups keyed by atomic group id.
pub const ATOMIC_GROUPS: TableDefinition<u64, &[u8]> = TableDefinition::new("atomic_groups");

/// Jobs keyed by job id.
pub const JOBS: TableDefinition<u64, &[u8]> = TableDefinition::new("jobs");

/// Host queue entries keyed by entry id.
pub const QUEUE_ENTRIES: TableDefinition<u64, &[u8]> = TableDefinition::new("host_queue_entries");

/// Special tasks keyed by task id.
pub const SPECIAL_TASKS: TableDefinition<u64, &[u8]> = TableDefinition::new("special_tasks");

/// Last allocated id per record table, keyed by table name.
pub const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("id_counters");
