//! Alert dispatch journal.
//!
//! One row per (entity, channel). The router writes the row before every
//! send attempt, so a restart can tell how many attempts were used.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

use super::{parse_enum, parse_ts, parse_uuid, ts, Pool};
use crate::alerts::{AlertDispatch, DispatchStatus, EntityRef, Envelope};

const COLUMNS: &str = "id, entity_kind, entity_id, channel, status, attempt_count, last_attempt_at,
     last_error, created_at, detected_at, envelope_json";

/// A journaled dispatch plus what is needed to send it again.
#[derive(Debug, Clone)]
pub struct JournaledDispatch {
    pub dispatch: AlertDispatch,
    pub envelope: Envelope,
    pub detected_at: DateTime<Utc>,
}

pub fn save(pool: &Pool, d: &AlertDispatch, envelope: &Envelope, detected_at: DateTime<Utc>) -> Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO alert_dispatches (id, entity_kind, entity_id, channel, status, attempt_count,
             last_attempt_at, last_error, created_at, detected_at, envelope_json, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT(entity_id, channel) DO UPDATE SET
             id = excluded.id,
             status = excluded.status,
             attempt_count = excluded.attempt_count,
             last_attempt_at = excluded.last_attempt_at,
             last_error = excluded.last_error,
             created_at = excluded.created_at,
             updated_at = excluded.updated_at",
        params![
            d.id.to_string(),
            d.entity.kind(),
            d.entity.id().to_string(),
            d.channel,
            d.status.to_string(),
            d.attempt_count,
            d.last_attempt_at.as_ref().map(ts),
            d.last_error,
            ts(&d.created_at),
            ts(&detected_at),
            serde_json::to_string(envelope)?,
            ts(&Utc::now()),
        ],
    )
    .context("Failed to journal alert dispatch")?;
    Ok(())
}

/// Newest first; `limit == 0` means no limit.
pub fn list(pool: &Pool, status: Option<DispatchStatus>, limit: usize) -> Result<Vec<AlertDispatch>> {
    let conn = pool.get()?;
    let sql = format!(
        "SELECT {} FROM alert_dispatches WHERE (?1 IS NULL OR status = ?1)
         ORDER BY created_at DESC LIMIT ?2",
        COLUMNS
    );
    let limit = if limit == 0 { -1 } else { limit as i64 };
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![status.map(|s| s.to_string()), limit], |row| {
        journaled_from_row(row).map(|j| j.dispatch)
    })?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

/// Everything a restarted router needs: pending and failed rows, plus
/// rows sent at or after `sent_since`.
pub fn load_for_resume(pool: &Pool, sent_since: DateTime<Utc>) -> Result<Vec<JournaledDispatch>> {
    let conn = pool.get()?;
    let sql = format!(
        "SELECT {} FROM alert_dispatches
         WHERE status IN ('pending', 'failed') OR (status = 'sent' AND last_attempt_at >= ?1)
         ORDER BY detected_at ASC",
        COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![ts(&sent_since)], journaled_from_row)?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

fn journaled_from_row(row: &Row<'_>) -> rusqlite::Result<JournaledDispatch> {
    let kind: String = row.get(1)?;
    let entity_id = parse_uuid(2, &row.get::<_, String>(2)?)?;
    let entity = EntityRef::from_parts(&kind, entity_id).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            format!("unknown entity kind '{}'", kind).into(),
        )
    })?;
    let last_attempt_at = match row.get::<_, Option<String>>(6)? {
        Some(raw) => Some(parse_ts(6, &raw)?),
        None => None,
    };
    let envelope_json: String = row.get(10)?;
    let envelope = serde_json::from_str(&envelope_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(10, rusqlite::types::Type::Text, Box::new(e)))?;

    Ok(JournaledDispatch {
        dispatch: AlertDispatch {
            id: parse_uuid(0, &row.get::<_, String>(0)?)?,
            entity,
            channel: row.get(3)?,
            status: parse_enum(4, &row.get::<_, String>(4)?)?,
            attempt_count: row.get(5)?,
            last_attempt_at,
            last_error: row.get(7)?,
            created_at: parse_ts(8, &row.get::<_, String>(8)?)?,
        },
        envelope,
        detected_at: parse_ts(9, &row.get::<_, String>(9)?)?,
    })
}
