//! Anomaly records.

use anyhow::Result;
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use super::{parse_enum, parse_ts, parse_uuid, ts, Pool};
use crate::detect::{Anomaly, Severity};

const COLUMNS: &str = "id, metric_name, source, value, score, confidence, severity, description,
     recommendations_json, baseline_mean, baseline_stddev, detected_at";

/// Filters for [`list`]. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AnomalyQuery {
    pub source: Option<String>,
    pub metric_name: Option<String>,
    pub min_severity: Option<Severity>,
    pub limit: usize,
}

pub fn save(pool: &Pool, a: &Anomaly) -> Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT OR REPLACE INTO anomalies (id, metric_name, source, value, score, confidence, severity,
             description, recommendations_json, baseline_mean, baseline_stddev, detected_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            a.id.to_string(),
            a.metric_name,
            a.source,
            a.value,
            a.score,
            a.confidence,
            a.severity.to_string(),
            a.description,
            serde_json::to_string(&a.recommendations)?,
            a.baseline_mean,
            a.baseline_stddev,
            ts(&a.detected_at),
        ],
    )?;
    Ok(())
}

pub fn get(pool: &Pool, id: Uuid) -> Result<Option<Anomaly>> {
    let conn = pool.get()?;
    let sql = format!("SELECT {} FROM anomalies WHERE id = ?1", COLUMNS);
    let found = conn
        .query_row(&sql, params![id.to_string()], from_row)
        .optional()?;
    Ok(found)
}

/// Newest first.
pub fn list(pool: &Pool, q: &AnomalyQuery) -> Result<Vec<Anomaly>> {
    let conn = pool.get()?;
    let sql = format!(
        "SELECT {} FROM anomalies
         WHERE (?1 IS NULL OR source = ?1) AND (?2 IS NULL OR metric_name = ?2)
         ORDER BY detected_at DESC",
        COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![q.source, q.metric_name], from_row)?;

    let limit = if q.limit == 0 { usize::MAX } else { q.limit };
    let mut out = Vec::new();
    for r in rows {
        let a = r?;
        if q.min_severity.map_or(true, |min| a.severity >= min) {
            out.push(a);
            if out.len() >= limit {
                break;
            }
        }
    }
    Ok(out)
}

/// Anomalies that make up an incident, oldest first.
pub fn for_incident(pool: &Pool, incident_id: Uuid) -> Result<Vec<Anomaly>> {
    let conn = pool.get()?;
    let sql = format!(
        "SELECT {} FROM anomalies
         WHERE id IN (SELECT anomaly_id FROM incident_anomalies WHERE incident_id = ?1)
         ORDER BY detected_at ASC",
        COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![incident_id.to_string()], from_row)?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

fn from_row(row: &Row<'_>) -> rusqlite::Result<Anomaly> {
    let recommendations: String = row.get(8)?;
    Ok(Anomaly {
        id: parse_uuid(0, &row.get::<_, String>(0)?)?,
        metric_name: row.get(1)?,
        source: row.get(2)?,
        value: row.get(3)?,
        score: row.get(4)?,
        confidence: row.get(5)?,
        severity: parse_enum(6, &row.get::<_, String>(6)?)?,
        description: row.get(7)?,
        recommendations: serde_json::from_str(&recommendations).unwrap_or_default(),
        baseline_mean: row.get(9)?,
        baseline_stddev: row.get(10)?,
        detected_at: parse_ts(11, &row.get::<_, String>(11)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::open_pool;
    use chrono::{Duration, Utc};

    fn anomaly(source: &str, severity: Severity, offset_secs: i64) -> Anomaly {
        Anomaly {
            id: Uuid::new_v4(),
            metric_name: "cpu".into(),
            source: source.into(),
            value: 95.0,
            score: 8.0,
            confidence: 1.0,
            severity,
            detected_at: Utc::now() + Duration::seconds(offset_secs),
            description: "CPU usage anomaly".into(),
            recommendations: vec!["Check for runaway processes".into()],
            baseline_mean: 50.0,
            baseline_stddev: 2.0,
        }
    }

    #[test]
    fn test_save_and_get() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let pool = open_pool(&dir.path().join("a.db"))?;
        let a = anomaly("host1", Severity::Critical, 0);
        save(&pool, &a)?;

        let loaded = get(&pool, a.id)?.expect("saved anomaly");
        assert_eq!(loaded.id, a.id);
        assert_eq!(loaded.severity, Severity::Critical);
        assert_eq!(loaded.recommendations, a.recommendations);
        assert_eq!(loaded.detected_at.timestamp_micros(), a.detected_at.timestamp_micros());
        assert!(get(&pool, Uuid::new_v4())?.is_none());
        Ok(())
    }

    #[test]
    fn test_list_filters_and_orders() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let pool = open_pool(&dir.path().join("a.db"))?;
        save(&pool, &anomaly("host1", Severity::Warning, 0))?;
        save(&pool, &anomaly("host1", Severity::Critical, 10))?;
        save(&pool, &anomaly("host2", Severity::Critical, 20))?;

        let all = list(&pool, &AnomalyQuery::default())?;
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].source, "host2", "newest first");

        let host1 = list(
            &pool,
            &AnomalyQuery {
                source: Some("host1".into()),
                ..Default::default()
            },
        )?;
        assert_eq!(host1.len(), 2);

        let critical = list(
            &pool,
            &AnomalyQuery {
                min_severity: Some(Severity::Critical),
                limit: 1,
                ..Default::default()
            },
        )?;
        assert_eq!(critical.len(), 1);
        assert_eq!(critical[0].source, "host2");
        Ok(())
    }
}
