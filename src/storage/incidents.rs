//! Incident records and their anomaly membership.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::{parse_enum, parse_ts, parse_uuid, ts, Pool};
use crate::detect::{Incident, IncidentStatus};

const COLUMNS: &str = "id, title, source, status, severity, correlation_key, created_at, updated_at";

/// Insert or update an incident and (re)assign its anomalies to it.
pub fn save(pool: &Pool, incident: &Incident) -> Result<()> {
    let mut conn = pool.get()?;
    let tx = conn.transaction()?;
    let id = incident.id.to_string();
    tx.execute(
        "INSERT INTO incidents (id, title, source, status, severity, correlation_key, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(id) DO UPDATE SET
             title = excluded.title,
             status = excluded.status,
             severity = excluded.severity,
             updated_at = excluded.updated_at",
        params![
            id,
            incident.title,
            incident.source,
            incident.status.to_string(),
            incident.severity.to_string(),
            ts(&incident.correlation_key),
            ts(&incident.created_at),
            ts(&incident.updated_at),
        ],
    )
    .context("Failed to upsert incident")?;
    for anomaly_id in &incident.anomaly_ids {
        tx.execute(
            "INSERT INTO incident_anomalies (anomaly_id, incident_id) VALUES (?1, ?2)
             ON CONFLICT(anomaly_id) DO UPDATE SET incident_id = excluded.incident_id",
            params![anomaly_id.to_string(), id],
        )?;
    }
    tx.commit()?;
    Ok(())
}

pub fn get(pool: &Pool, id: Uuid) -> Result<Option<Incident>> {
    let conn = pool.get()?;
    let sql = format!("SELECT {} FROM incidents WHERE id = ?1", COLUMNS);
    let Some(mut incident) = conn
        .query_row(&sql, params![id.to_string()], from_row)
        .optional()?
    else {
        return Ok(None);
    };
    incident.anomaly_ids = members(&conn, id)?;
    Ok(Some(incident))
}

/// Most recently updated first.
pub fn list(pool: &Pool, status: Option<IncidentStatus>, limit: usize) -> Result<Vec<Incident>> {
    let conn = pool.get()?;
    let sql = format!(
        "SELECT {} FROM incidents WHERE (?1 IS NULL OR status = ?1)
         ORDER BY updated_at DESC LIMIT ?2",
        COLUMNS
    );
    let limit = if limit == 0 { -1 } else { limit as i64 };
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![status.map(|s| s.to_string()), limit], from_row)?;
    let mut out = Vec::new();
    for r in rows {
        let mut incident = r?;
        incident.anomaly_ids = members(&conn, incident.id)?;
        out.push(incident);
    }
    Ok(out)
}

/// Every incident that is not resolved, oldest first.
pub fn load_open(pool: &Pool) -> Result<Vec<Incident>> {
    let mut open: Vec<Incident> = list(pool, None, 0)?
        .into_iter()
        .filter(|i| i.status.is_open())
        .collect();
    open.sort_by_key(|i| i.created_at);
    Ok(open)
}

pub fn delete(pool: &Pool, id: Uuid) -> Result<bool> {
    let conn = pool.get()?;
    let changed = conn.execute("DELETE FROM incidents WHERE id = ?1", params![id.to_string()])?;
    Ok(changed > 0)
}

fn members(conn: &Connection, id: Uuid) -> Result<BTreeSet<Uuid>> {
    let mut stmt = conn.prepare("SELECT anomaly_id FROM incident_anomalies WHERE incident_id = ?1")?;
    let rows = stmt.query_map(params![id.to_string()], |row| parse_uuid(0, &row.get::<_, String>(0)?))?;
    let mut out = BTreeSet::new();
    for r in rows {
        out.insert(r?);
    }
    Ok(out)
}

fn from_row(row: &Row<'_>) -> rusqlite::Result<Incident> {
    Ok(Incident {
        id: parse_uuid(0, &row.get::<_, String>(0)?)?,
        title: row.get(1)?,
        source: row.get(2)?,
        status: parse_enum(3, &row.get::<_, String>(3)?)?,
        severity: parse_enum(4, &row.get::<_, String>(4)?)?,
        anomaly_ids: BTreeSet::new(),
        correlation_key: parse_ts(5, &row.get::<_, String>(5)?)?,
        created_at: parse_ts(6, &row.get::<_, String>(6)?)?,
        updated_at: parse_ts(7, &row.get::<_, String>(7)?)?,
    })
}
