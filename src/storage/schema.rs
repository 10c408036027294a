//! Schema for the anomaly, incident and dispatch tables.

use anyhow::Result;
use rusqlite::Connection;

const SCHEMA_VERSION: i64 = 1;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS anomalies (
            id TEXT PRIMARY KEY,
            metric_name TEXT NOT NULL,
            source TEXT NOT NULL,
            value REAL NOT NULL,
            score REAL NOT NULL,
            confidence REAL NOT NULL,
            severity TEXT NOT NULL,
            description TEXT NOT NULL,
            recommendations_json TEXT NOT NULL DEFAULT '[]',
            baseline_mean REAL NOT NULL,
            baseline_stddev REAL NOT NULL,
            detected_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS incidents (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            source TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'open',
            severity TEXT NOT NULL,
            correlation_key TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        -- An anomaly belongs to at most one incident.
        CREATE TABLE IF NOT EXISTS incident_anomalies (
            anomaly_id TEXT PRIMARY KEY,
            incident_id TEXT NOT NULL REFERENCES incidents(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS alert_dispatches (
            id TEXT PRIMARY KEY,
            entity_kind TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            channel TEXT NOT NULL,
            status TEXT NOT NULL,
            attempt_count INTEGER NOT NULL DEFAULT 0,
            last_attempt_at TEXT,
            last_error TEXT,
            detected_at TEXT NOT NULL,
            envelope_json TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE (entity_id, channel)
        );

        CREATE INDEX IF NOT EXISTS idx_anomalies_detected ON anomalies(detected_at);
        CREATE INDEX IF NOT EXISTS idx_anomalies_source ON anomalies(source, detected_at);
        CREATE INDEX IF NOT EXISTS idx_incidents_status ON incidents(status, updated_at);
        CREATE INDEX IF NOT EXISTS idx_incident_anomalies_incident ON incident_anomalies(incident_id);
        CREATE INDEX IF NOT EXISTS idx_dispatches_status ON alert_dispatches(status);",
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        rusqlite::params![SCHEMA_VERSION],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        for table in ["anomalies", "incidents", "incident_anomalies", "alert_dispatches"] {
            let count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
                .unwrap();
            assert_eq!(count, 0, "{} should start empty", table);
        }

        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap(); // Should not error
    }
}
