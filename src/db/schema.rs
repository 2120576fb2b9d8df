/// Schema for the local store, the mutation queue and the response cache.
pub const SCHEMA: &str = r#"
-- Domain records, keyed by the client-generated id
CREATE TABLE IF NOT EXISTS records (
    local_id TEXT PRIMARY KEY,
    remote_id TEXT,
    sync_status TEXT NOT NULL,
    last_modified TEXT NOT NULL,
    payload TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_records_remote_id ON records(remote_id);

-- Pending writes, at most one per record
CREATE TABLE IF NOT EXISTS mutation_queue (
    local_id TEXT PRIMARY KEY,
    seq INTEGER NOT NULL,
    operation TEXT NOT NULL DEFAULT 'upsert',
    remote_id TEXT,
    payload TEXT NOT NULL,
    last_modified TEXT NOT NULL,
    enqueued_at TEXT NOT NULL,
    revision INTEGER NOT NULL DEFAULT 1,
    attempts INTEGER NOT NULL DEFAULT 0,
    next_attempt_at TEXT NOT NULL,
    last_error TEXT,
    dead_letter INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_mutation_queue_seq ON mutation_queue(seq);

-- Versioned response cache partitions
CREATE TABLE IF NOT EXISTS cache_partitions (
    name TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    version TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS cache_entries (
    partition TEXT NOT NULL,
    request_key TEXT NOT NULL,
    version TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    captured_at TEXT NOT NULL,
    PRIMARY KEY (partition, request_key)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_captured
    ON cache_entries(partition, captured_at);
"#;
