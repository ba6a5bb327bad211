//! Database schema for the local store

use crate::error::Result;
use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i64 = 1;

/// SQL to create the database schema
const SCHEMA_SQL: &str = r#"
-- Collections (schema stored as JSON)
CREATE TABLE IF NOT EXISTS collections (
    name TEXT PRIMARY KEY,
    schema TEXT NOT NULL,
    load_state TEXT NOT NULL DEFAULT 'not_load',
    replicas INTEGER NOT NULL DEFAULT 0,
    next_auto_id INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL
);

-- Entities (one row per primary key; row data stored as JSON)
CREATE TABLE IF NOT EXISTS entities (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    collection TEXT NOT NULL REFERENCES collections(name),
    pk TEXT NOT NULL,
    data TEXT NOT NULL,
    UNIQUE(collection, pk)
);

CREATE INDEX IF NOT EXISTS idx_entities_collection ON entities(collection, id);

-- Indexes declared on collection fields
CREATE TABLE IF NOT EXISTS indexes (
    collection TEXT NOT NULL REFERENCES collections(name),
    index_name TEXT NOT NULL,
    field_name TEXT NOT NULL,
    index_type TEXT NOT NULL,
    metric_type TEXT NOT NULL,
    params TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (collection, index_name)
);

-- BM25 text index; one row per (entity, sparse output field)
CREATE VIRTUAL TABLE IF NOT EXISTS entities_fts USING fts5(
    collection UNINDEXED,
    field UNINDEXED,
    entity_id UNINDEXED,
    body,
    tokenize='porter unicode61'
);

-- Store state (schema version)
CREATE TABLE IF NOT EXISTS store_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Ensure the database schema is up to date
pub fn ensure_schema(conn: &Connection) -> Result<()> {
    let table_exists: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='store_state'",
        [],
        |row| row.get(0),
    )?;

    if !table_exists {
        conn.execute_batch(SCHEMA_SQL)?;

        conn.execute(
            "INSERT INTO store_state (key, value) VALUES ('schema_version', ?1)",
            [SCHEMA_VERSION.to_string()],
        )?;

        tracing::info!("Created local store schema version {}", SCHEMA_VERSION);
    } else {
        let version: i64 = conn
            .query_row(
                "SELECT CAST(value AS INTEGER) FROM store_state WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if version < SCHEMA_VERSION {
            migrate(conn, version)?;
        }
    }

    Ok(())
}

/// Migrate from an older schema version
fn migrate(conn: &Connection, from_version: i64) -> Result<()> {
    tracing::info!(
        "Migrating local store from version {} to {}",
        from_version,
        SCHEMA_VERSION
    );

    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute(
        "INSERT OR REPLACE INTO store_state (key, value) VALUES ('schema_version', ?1)",
        [SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema_version(conn: &Connection) -> i64 {
        conn.query_row(
            "SELECT CAST(value AS INTEGER) FROM store_state WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .unwrap()
    }

    #[test]
    fn test_schema_creation() {
        let conn = Connection::open_in_memory().unwrap();
        ensure_schema(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        assert!(tables.contains(&"collections".to_string()));
        assert!(tables.contains(&"entities".to_string()));
        assert!(tables.contains(&"indexes".to_string()));
        assert!(tables.contains(&"entities_fts".to_string()));
        assert!(tables.contains(&"store_state".to_string()));
    }

    #[test]
    fn test_schema_version() {
        let conn = Connection::open_in_memory().unwrap();
        ensure_schema(&conn).unwrap();
        assert_eq!(schema_version(&conn), SCHEMA_VERSION);
    }

    #[test]
    fn test_idempotent_schema() {
        let conn = Connection::open_in_memory().unwrap();

        ensure_schema(&conn).unwrap();
        ensure_schema(&conn).unwrap();
        ensure_schema(&conn).unwrap();

        assert_eq!(schema_version(&conn), SCHEMA_VERSION);
    }

    #[test]
    fn test_migrates_unversioned_store() {
        let conn = Connection::open_in_memory().unwrap();
        ensure_schema(&conn).unwrap();
        conn.execute("DELETE FROM store_state", []).unwrap();

        ensure_schema(&conn).unwrap();
        assert_eq!(schema_version(&conn), SCHEMA_VERSION);
    }
}
