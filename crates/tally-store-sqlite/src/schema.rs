//! SQL schema for the Tally SQLite store.
//!
//! Executed once at connection startup. Future migrations will be gated on
//! the `user_version` pragma.

/// Full schema DDL; idempotent thanks to `CREATE TABLE IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS plans (
    plan_id       TEXT PRIMARY KEY,
    name          TEXT NOT NULL,
    code          TEXT NOT NULL UNIQUE,
    price         INTEGER NOT NULL,     -- minor currency units
    description   TEXT,
    duration      INTEGER NOT NULL,
    duration_unit TEXT NOT NULL,        -- 'day' | 'month' | 'lifetime'
    limits_json   TEXT NOT NULL,        -- serialized LimitSnapshot
    status        TEXT NOT NULL DEFAULT 'active',
    created_at    INTEGER NOT NULL      -- epoch millis
);

-- limits_json is copied verbatim from the plan row at registration time.
-- Instances never read back through to the plan.
CREATE TABLE IF NOT EXISTS subscription_instances (
    instance_id   TEXT PRIMARY KEY,
    subject_id    TEXT NOT NULL,
    plan_id       TEXT NOT NULL REFERENCES plans(plan_id),
    name          TEXT NOT NULL,
    price         INTEGER NOT NULL,
    duration      INTEGER NOT NULL,
    duration_unit TEXT NOT NULL,
    limits_json   TEXT NOT NULL,
    start_at      INTEGER NOT NULL,
    end_at        INTEGER NOT NULL,
    status        TEXT NOT NULL DEFAULT 'active',  -- 'active' | 'canceled' | 'expired'
    created_at    INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS instances_subject_idx
    ON subscription_instances(subject_id, status, start_at, end_at);

-- Usage counters. Rows are append-only apart from the guarded counter
-- updates; no row is ever deleted (closed windows are kept for history).
CREATE TABLE IF NOT EXISTS usage_records (
    instance_id      TEXT NOT NULL REFERENCES subscription_instances(instance_id),
    subject_id       TEXT NOT NULL,
    module_key       TEXT NOT NULL,     -- normalized (trimmed, lowercased)
    function_key     TEXT,              -- NULL = module-level counter
    window_type      TEXT NOT NULL DEFAULT 'calendar',
    window_unit      TEXT NOT NULL DEFAULT 'month',
    window_size      INTEGER NOT NULL DEFAULT 1,
    window_start     INTEGER NOT NULL,
    window_end       INTEGER NOT NULL,
    used             INTEGER NOT NULL DEFAULT 0,
    quota            INTEGER NOT NULL,  -- total grantable: base + bonus
    last_bonus_at    INTEGER,
    bonus_source     TEXT,
    bonus_expires_at INTEGER,
    CHECK (used >= 0 AND quota >= 0)
);

-- The composite identity. COALESCE folds NULL function keys into the index
-- so module-level rows collide like any other; concurrent creators of the
-- same window converge onto one row via this constraint.
CREATE UNIQUE INDEX IF NOT EXISTS usage_window_key ON usage_records (
    instance_id, subject_id, module_key,
    COALESCE(function_key, ''), window_start, window_end
);

CREATE INDEX IF NOT EXISTS usage_bonus_expiry_idx
    ON usage_records(bonus_expires_at) WHERE bonus_source IS NOT NULL;

PRAGMA user_version = 1;
";
