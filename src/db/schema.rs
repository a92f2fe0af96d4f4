/// Schema for the offline mutation queue.
pub const SCHEMA: &str = r#"
-- seq gives FIFO order even when enqueue timestamps collide
CREATE TABLE IF NOT EXISTS pending_mutations (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    endpoint TEXT NOT NULL,
    method TEXT NOT NULL,
    content_type TEXT,
    payload BLOB NOT NULL,
    enqueued_at TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT
);
"#;
