/// SQL DDL for the idempotency store.
///
/// Records are stored as JSON documents next to the columns used for lookup
/// and cleanup, so the record shape can evolve without migrations.

pub const SCHEMA_VERSION: i32 = 1;

pub const CREATE_TABLES_SQL: &str = "
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL,
    description TEXT
);

-- One row per tracked operation
CREATE TABLE IF NOT EXISTS operation_states (
    id TEXT PRIMARY KEY,
    plan_id TEXT NOT NULL,
    resource_kind TEXT NOT NULL,
    resource_id TEXT NOT NULL,
    status TEXT NOT NULL,
    fingerprint TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    state_json TEXT NOT NULL
);

-- Pre/post-execution checkpoints
CREATE TABLE IF NOT EXISTS checkpoints (
    id TEXT PRIMARY KEY,
    operation_id TEXT NOT NULL,
    plan_id TEXT NOT NULL,
    stage TEXT NOT NULL,
    created_at TEXT NOT NULL,
    checkpoint_json TEXT NOT NULL
);

-- Exclusive resource leases
CREATE TABLE IF NOT EXISTS resource_ownership (
    resource_kind TEXT NOT NULL,
    resource_id TEXT NOT NULL,
    owner_plan_id TEXT NOT NULL,
    owner_op_id TEXT NOT NULL,
    acquired_at TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    PRIMARY KEY (resource_kind, resource_id)
);
";

pub const CREATE_INDEXES_SQL: &str = "
CREATE INDEX IF NOT EXISTS idx_operation_states_resource ON operation_states(resource_kind, resource_id);
CREATE INDEX IF NOT EXISTS idx_operation_states_plan ON operation_states(plan_id);
CREATE INDEX IF NOT EXISTS idx_checkpoints_operation ON checkpoints(operation_id, created_at);
CREATE INDEX IF NOT EXISTS idx_ownership_expiry ON resource_ownership(expires_at);
";
