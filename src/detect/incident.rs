//! Groups anomalies on the same source into incidents.
//!
//! Correlation runs synchronously when an anomaly arrives. Decisions for
//! one source are serialized behind that source's lock; different sources
//! correlate in parallel.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::detect::{Anomaly, Incident, IncidentStatus};
use crate::storage::{self, Pool};

#[derive(Debug, Error)]
pub enum IncidentError {
    #[error("incident {0} not found")]
    NotFound(Uuid),
    #[error("incident {0} is resolved and can no longer change status")]
    Resolved(Uuid),
    #[error("anomaly {anomaly} already belongs to incident {incident}")]
    AlreadyCorrelated { anomaly: Uuid, incident: Uuid },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CorrelationOutcome {
    /// No open incident matched; a new one was opened.
    Created,
    /// Joined an open incident without changing its severity.
    Merged,
    /// Joined an open incident and raised its severity.
    Escalated,
}

#[derive(Debug, Clone)]
pub struct Correlation {
    pub incident: Incident,
    pub outcome: CorrelationOutcome,
}

/// Start of the correlation bucket `at` falls into.
pub fn correlation_bucket(at: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    let w = window.num_seconds().max(1);
    let secs = at.timestamp();
    DateTime::from_timestamp(secs - secs.rem_euclid(w), 0).unwrap_or(at)
}

#[derive(Default)]
struct SourceIncidents {
    open: Vec<Incident>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct IncidentCorrelator {
    window: Duration,
    pool: Option<Pool>,
    sources: Mutex<HashMap<String, Arc<Mutex<SourceIncidents>>>>,
    /// Open incident id -> source.
    index: Mutex<HashMap<Uuid, String>>,
}

impl IncidentCorrelator {
    pub fn new(window: Duration, pool: Option<Pool>) -> Self {
        Self {
            window,
            pool,
            sources: Mutex::new(HashMap::new()),
            index: Mutex::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn slot(&self, source: &str) -> Arc<Mutex<SourceIncidents>> {
        lock(&self.sources).entry(source.to_string()).or_default().clone()
    }

    /// Attach `anomaly` to an open incident on its source, or open a new one.
    pub fn correlate(&self, anomaly: &Anomaly) -> Result<Correlation, IncidentError> {
        let slot = self.slot(&anomaly.source);
        let mut state = lock(&slot);

        if let Some(existing) = state.open.iter().find(|i| i.anomaly_ids.contains(&anomaly.id)) {
            return Err(IncidentError::AlreadyCorrelated {
                anomaly: anomaly.id,
                incident: existing.id,
            });
        }

        let window = self.window;
        let candidate = state
            .open
            .iter()
            .enumerate()
            .filter(|(_, i)| (i.updated_at - anomaly.detected_at).abs() <= window)
            .max_by_key(|(_, i)| i.updated_at)
            .map(|(pos, _)| pos);

        let correlation = match candidate {
            Some(pos) => {
                let incident = &mut state.open[pos];
                let before = incident.severity;
                incident.anomaly_ids.insert(anomaly.id);
                incident.severity = incident.severity.max(anomaly.severity);
                incident.updated_at = incident.updated_at.max(anomaly.detected_at);
                let outcome = if incident.severity > before {
                    CorrelationOutcome::Escalated
                } else {
                    CorrelationOutcome::Merged
                };
                debug!(incident = %incident.id, anomaly = %anomaly.id, ?outcome, "Anomaly merged into incident");
                Correlation {
                    incident: incident.clone(),
                    outcome,
                }
            }
            None => {
                let incident = Incident {
                    id: Uuid::new_v4(),
                    title: format!("{} anomaly on {}", anomaly.metric_name, anomaly.source),
                    source: anomaly.source.clone(),
                    status: IncidentStatus::Open,
                    severity: anomaly.severity,
                    anomaly_ids: BTreeSet::from([anomaly.id]),
                    correlation_key: correlation_bucket(anomaly.detected_at, window),
                    created_at: anomaly.detected_at,
                    updated_at: anomaly.detected_at,
                };
                info!(incident = %incident.id, source = %incident.source, severity = %incident.severity, "Opened incident");
                lock(&self.index).insert(incident.id, incident.source.clone());
                state.open.push(incident.clone());
                Correlation {
                    incident,
                    outcome: CorrelationOutcome::Created,
                }
            }
        };

        self.persist(&correlation.incident);
        let removed = self.reconcile(&mut state);
        if removed.contains(&correlation.incident.id) {
            // Our incident was folded into an older duplicate; report that one.
            if let Some(kept) = state
                .open
                .iter()
                .find(|i| i.anomaly_ids.contains(&anomaly.id))
            {
                return Ok(Correlation {
                    incident: kept.clone(),
                    outcome: CorrelationOutcome::Merged,
                });
            }
        }
        Ok(correlation)
    }

    /// Fold together open incidents on one source that lie within a window
    /// of each other. Correlation never produces such pairs, so any found
    /// here came from an inconsistent restore. Returns the ids removed.
    fn reconcile(&self, state: &mut SourceIncidents) -> Vec<Uuid> {
        let mut removed = Vec::new();
        state.open.sort_by_key(|i| i.created_at);
        let mut i = 0;
        while i < state.open.len() {
            let mut j = i + 1;
            while j < state.open.len() {
                if (state.open[i].updated_at - state.open[j].updated_at).abs() <= self.window {
                    let dup = state.open.remove(j);
                    let keep = &mut state.open[i];
                    error!(
                        kept = %keep.id,
                        duplicate = %dup.id,
                        source = %keep.source,
                        "CorrelationRace: duplicate open incidents merged"
                    );
                    keep.anomaly_ids.extend(dup.anomaly_ids.iter().copied());
                    keep.severity = keep.severity.max(dup.severity);
                    keep.updated_at = keep.updated_at.max(dup.updated_at);
                    if dup.status == IncidentStatus::Investigating {
                        keep.status = IncidentStatus::Investigating;
                    }
                    lock(&self.index).remove(&dup.id);
                    self.persist(keep);
                    self.forget(dup.id);
                    removed.push(dup.id);
                } else {
                    j += 1;
                }
            }
            i += 1;
        }
        removed
    }

    /// Operator-driven status change. `Resolved` is terminal.
    pub fn set_status(&self, id: Uuid, status: IncidentStatus) -> Result<Incident, IncidentError> {
        let source = lock(&self.index).get(&id).cloned();
        let Some(source) = source else {
            return match self.load(id)? {
                Some(i) if i.status == IncidentStatus::Resolved => Err(IncidentError::Resolved(id)),
                _ => Err(IncidentError::NotFound(id)),
            };
        };

        let slot = self.slot(&source);
        let mut state = lock(&slot);
        let pos = state
            .open
            .iter()
            .position(|i| i.id == id)
            .ok_or(IncidentError::NotFound(id))?;

        state.open[pos].status = status;
        let incident = if status == IncidentStatus::Resolved {
            lock(&self.index).remove(&id);
            state.open.remove(pos)
        } else {
            state.open[pos].clone()
        };
        info!(incident = %id, %status, "Incident status changed");
        self.persist(&incident);
        Ok(incident)
    }

    /// Look up an incident, open ones from memory, others from storage.
    pub fn get(&self, id: Uuid) -> Result<Option<Incident>, IncidentError> {
        let source = lock(&self.index).get(&id).cloned();
        if let Some(source) = source {
            let slot = self.slot(&source);
            let state = lock(&slot);
            if let Some(i) = state.open.iter().find(|i| i.id == id) {
                return Ok(Some(i.clone()));
            }
        }
        self.load(id)
    }

    /// All open and investigating incidents, oldest first.
    pub fn open_incidents(&self) -> Vec<Incident> {
        let slots: Vec<_> = lock(&self.sources).values().cloned().collect();
        let mut out: Vec<Incident> = slots
            .iter()
            .flat_map(|slot| lock(slot).open.clone())
            .collect();
        out.sort_by_key(|i| i.created_at);
        out
    }

    /// Rebuild the open-incident index from storage.
    pub fn restore(&self) -> Result<usize, IncidentError> {
        let Some(pool) = &self.pool else {
            return Ok(0);
        };
        let incidents = storage::incidents::load_open(pool)?;
        let mut grouped: HashMap<String, Vec<Incident>> = HashMap::new();
        for incident in incidents {
            grouped.entry(incident.source.clone()).or_default().push(incident);
        }

        let mut restored = 0;
        for (source, incidents) in grouped {
            let slot = self.slot(&source);
            let mut state = lock(&slot);
            {
                let mut index = lock(&self.index);
                for incident in &incidents {
                    index.insert(incident.id, source.clone());
                }
            }
            state.open.extend(incidents);
            self.reconcile(&mut state);
            restored += state.open.len();
        }
        info!(restored, "Restored open incidents");
        Ok(restored)
    }

    fn load(&self, id: Uuid) -> Result<Option<Incident>, IncidentError> {
        match &self.pool {
            Some(pool) => Ok(storage::incidents::get(pool, id)?),
            None => Ok(None),
        }
    }

    fn persist(&self, incident: &Incident) {
        let Some(pool) = &self.pool else { return };
        if let Err(e) = storage::incidents::save(pool, incident) {
            error!(incident = %incident.id, "Failed to persist incident: {:#}", e);
        }
    }

    fn forget(&self, id: Uuid) {
        let Some(pool) = &self.pool else { return };
        if let Err(e) = storage::incidents::delete(pool, id) {
            error!(incident = %id, "Failed to delete merged incident: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::Severity;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-02T10:00:00Z").unwrap().with_timezone(&Utc)
    }

    fn anomaly(source: &str, severity: Severity, at: DateTime<Utc>) -> Anomaly {
        Anomaly {
            id: Uuid::new_v4(),
            metric_name: "latency".into(),
            source: source.into(),
            value: 900.0,
            score: 6.0,
            confidence: 1.0,
            severity,
            detected_at: at,
            description: "Response time anomaly".into(),
            recommendations: vec![],
            baseline_mean: 120.0,
            baseline_stddev: 20.0,
        }
    }

    fn correlator() -> IncidentCorrelator {
        IncidentCorrelator::new(Duration::minutes(10), None)
    }

    #[test]
    fn test_bucket_truncates_to_window() {
        let at = t0() + Duration::minutes(7) + Duration::seconds(13);
        assert_eq!(correlation_bucket(at, Duration::minutes(10)), t0());
    }

    #[test]
    fn test_anomalies_five_minutes_apart_share_an_incident() {
        let c = correlator();
        let first = c.correlate(&anomaly("db1", Severity::Warning, t0())).unwrap();
        assert_eq!(first.outcome, CorrelationOutcome::Created);

        let second = c
            .correlate(&anomaly("db1", Severity::Critical, t0() + Duration::minutes(5)))
            .unwrap();
        assert_eq!(second.outcome, CorrelationOutcome::Escalated);
        assert_eq!(second.incident.id, first.incident.id);
        assert_eq!(second.incident.severity, Severity::Critical);
        assert_eq!(second.incident.anomaly_ids.len(), 2);
        assert_eq!(second.incident.updated_at, t0() + Duration::minutes(5));
        assert_eq!(c.open_incidents().len(), 1);
    }

    #[test]
    fn test_merge_across_bucket_boundary() {
        let c = correlator();
        let a = c.correlate(&anomaly("db1", Severity::Warning, t0() + Duration::minutes(8))).unwrap();
        let b = c.correlate(&anomaly("db1", Severity::Warning, t0() + Duration::minutes(13))).unwrap();
        assert_eq!(b.outcome, CorrelationOutcome::Merged);
        assert_eq!(a.incident.id, b.incident.id);
    }

    #[test]
    fn test_gap_beyond_window_opens_new_incident() {
        let c = correlator();
        let a = c.correlate(&anomaly("db1", Severity::Warning, t0())).unwrap();
        let b = c
            .correlate(&anomaly("db1", Severity::Warning, t0() + Duration::minutes(10) + Duration::seconds(1)))
            .unwrap();
        assert_eq!(b.outcome, CorrelationOutcome::Created);
        assert_ne!(a.incident.id, b.incident.id);

        // Exactly one window apart is still the same incident.
        let c2 = correlator();
        let x = c2.correlate(&anomaly("db1", Severity::Warning, t0())).unwrap();
        let y = c2
            .correlate(&anomaly("db1", Severity::Warning, t0() + Duration::minutes(10)))
            .unwrap();
        assert_eq!(x.incident.id, y.incident.id);
    }

    #[test]
    fn test_sources_do_not_mix() {
        let c = correlator();
        let a = c.correlate(&anomaly("db1", Severity::Warning, t0())).unwrap();
        let b = c.correlate(&anomaly("db2", Severity::Warning, t0())).unwrap();
        assert_ne!(a.incident.id, b.incident.id);
        assert_eq!(c.open_incidents().len(), 2);
    }

    #[test]
    fn test_same_anomaly_cannot_join_twice() {
        let c = correlator();
        let a = anomaly("db1", Severity::Warning, t0());
        c.correlate(&a).unwrap();
        assert!(matches!(c.correlate(&a), Err(IncidentError::AlreadyCorrelated { .. })));
    }

    #[test]
    fn test_concurrent_same_source_creates_one_incident() {
        let c = Arc::new(correlator());
        std::thread::scope(|s| {
            for n in 0..16 {
                let c = Arc::clone(&c);
                s.spawn(move || {
                    let at = t0() + Duration::seconds(n * 10);
                    c.correlate(&anomaly("db1", Severity::Warning, at)).unwrap();
                });
            }
        });
        let open = c.open_incidents();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].anomaly_ids.len(), 16);
    }

    #[test]
    fn test_resolved_is_terminal() {
        let c = correlator();
        let a = c.correlate(&anomaly("db1", Severity::Warning, t0())).unwrap();
        let id = a.incident.id;

        let inv = c.set_status(id, IncidentStatus::Investigating).unwrap();
        assert_eq!(inv.status, IncidentStatus::Investigating);

        // Investigating incidents still absorb anomalies.
        let m = c.correlate(&anomaly("db1", Severity::Warning, t0() + Duration::minutes(1))).unwrap();
        assert_eq!(m.incident.id, id);

        let resolved = c.set_status(id, IncidentStatus::Resolved).unwrap();
        assert_eq!(resolved.status, IncidentStatus::Resolved);
        assert!(c.open_incidents().is_empty());
        assert!(matches!(c.set_status(id, IncidentStatus::Open), Err(IncidentError::NotFound(_))));

        // The next anomaly opens a fresh incident.
        let fresh = c.correlate(&anomaly("db1", Severity::Warning, t0() + Duration::minutes(2))).unwrap();
        assert_eq!(fresh.outcome, CorrelationOutcome::Created);
        assert_ne!(fresh.incident.id, id);
    }

    #[test]
    fn test_restore_and_terminal_status_from_storage() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let pool = storage::open_pool(&dir.path().join("c.db"))?;
        let c = IncidentCorrelator::new(Duration::minutes(10), Some(pool.clone()));
        let open = c.correlate(&anomaly("db1", Severity::Warning, t0()))?;
        let closed = c.correlate(&anomaly("db2", Severity::Critical, t0()))?;
        c.set_status(closed.incident.id, IncidentStatus::Resolved)?;

        let fresh = IncidentCorrelator::new(Duration::minutes(10), Some(pool));
        assert_eq!(fresh.restore()?, 1);
        assert_eq!(fresh.open_incidents()[0].id, open.incident.id);
        assert!(matches!(
            fresh.set_status(closed.incident.id, IncidentStatus::Open),
            Err(IncidentError::Resolved(_))
        ));

        let merged = fresh.correlate(&anomaly("db1", Severity::Critical, t0() + Duration::minutes(3)))?;
        assert_eq!(merged.incident.id, open.incident.id);
        assert_eq!(merged.outcome, CorrelationOutcome::Escalated);
        Ok(())
    }

    #[test]
    fn test_restore_folds_duplicates() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let pool = storage::open_pool(&dir.path().join("c.db"))?;
        for offset in [0, 2] {
            let at = t0() + Duration::minutes(offset);
            storage::incidents::save(
                &pool,
                &Incident {
                    id: Uuid::new_v4(),
                    title: "latency anomaly on db1".into(),
                    source: "db1".into(),
                    status: IncidentStatus::Open,
                    severity: Severity::Warning,
                    anomaly_ids: BTreeSet::from([Uuid::new_v4()]),
                    correlation_key: t0(),
                    created_at: at,
                    updated_at: at,
                },
            )?;
        }
        let c = IncidentCorrelator::new(Duration::minutes(10), Some(pool.clone()));
        assert_eq!(c.restore()?, 1);
        assert_eq!(c.open_incidents()[0].anomaly_ids.len(), 2);
        assert_eq!(storage::incidents::list(&pool, None, 0)?.len(), 1);
        Ok(())
    }
}
