//! Alert routing: envelopes, channels, dispatch records and the router.

pub mod channel;
pub mod router;
pub mod webhook;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::detect::{Anomaly, Incident, Severity};

pub use channel::{AlertChannel, SendError};
pub use router::{AlertRouter, RouterSettings};

/// What a dispatch is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum EntityRef {
    Anomaly(Uuid),
    Incident(Uuid),
}

impl EntityRef {
    pub fn id(&self) -> Uuid {
        match self {
            EntityRef::Anomaly(id) | EntityRef::Incident(id) => *id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            EntityRef::Anomaly(_) => "anomaly",
            EntityRef::Incident(_) => "incident",
        }
    }

    pub fn from_parts(kind: &str, id: Uuid) -> Option<Self> {
        match kind {
            "anomaly" => Some(EntityRef::Anomaly(id)),
            "incident" => Some(EntityRef::Incident(id)),
            _ => None,
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

/// Anything the router can notify about.
#[derive(Debug, Clone)]
pub enum AlertEntity {
    Anomaly(Anomaly),
    Incident(Incident),
}

impl AlertEntity {
    pub fn entity_ref(&self) -> EntityRef {
        match self {
            AlertEntity::Anomaly(a) => EntityRef::Anomaly(a.id),
            AlertEntity::Incident(i) => EntityRef::Incident(i.id),
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            AlertEntity::Anomaly(a) => a.severity,
            AlertEntity::Incident(i) => i.severity,
        }
    }

    /// Orders channel queues.
    pub fn detected_at(&self) -> DateTime<Utc> {
        match self {
            AlertEntity::Anomaly(a) => a.detected_at,
            AlertEntity::Incident(i) => i.updated_at,
        }
    }

    pub fn envelope(&self) -> Envelope {
        match self {
            AlertEntity::Anomaly(a) => Envelope::for_anomaly(a),
            AlertEntity::Incident(i) => Envelope::for_incident(i),
        }
    }
}

/// Channel-neutral notification body. Channels render it however their
/// endpoint expects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub title: String,
    pub severity: Severity,
    pub description: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Envelope {
    pub fn for_anomaly(a: &Anomaly) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert("anomaly_id".into(), a.id.to_string().into());
        metadata.insert("metric".into(), a.metric_name.clone().into());
        metadata.insert("source".into(), a.source.clone().into());
        metadata.insert("value".into(), serde_json::json!(a.value));
        metadata.insert("score".into(), serde_json::json!(a.score));
        metadata.insert("confidence".into(), serde_json::json!(a.confidence));
        metadata.insert("detected_at".into(), a.detected_at.to_rfc3339().into());
        metadata.insert("recommendations".into(), serde_json::json!(a.recommendations));
        Self {
            title: format!("{} anomaly on {}", a.metric_name, a.source),
            severity: a.severity,
            description: a.description.clone(),
            metadata,
        }
    }

    pub fn for_incident(i: &Incident) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert("incident_id".into(), i.id.to_string().into());
        metadata.insert("source".into(), i.source.clone().into());
        metadata.insert("status".into(), i.status.to_string().into());
        metadata.insert("anomaly_count".into(), serde_json::json!(i.anomaly_ids.len()));
        metadata.insert("created_at".into(), i.created_at.to_rfc3339().into());
        metadata.insert("updated_at".into(), i.updated_at.to_rfc3339().into());
        Self {
            title: i.title.clone(),
            severity: i.severity,
            description: format!(
                "{} incident on {} with {} correlated anomal{}",
                i.severity,
                i.source,
                i.anomaly_ids.len(),
                if i.anomaly_ids.len() == 1 { "y" } else { "ies" }
            ),
            metadata,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchStatus {
    Pending,
    Sent,
    Failed,
}

impl fmt::Display for DispatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchStatus::Pending => write!(f, "pending"),
            DispatchStatus::Sent => write!(f, "sent"),
            DispatchStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for DispatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DispatchStatus::Pending),
            "sent" => Ok(DispatchStatus::Sent),
            "failed" => Ok(DispatchStatus::Failed),
            other => Err(format!("unknown dispatch status '{}'", other)),
        }
    }
}

/// Delivery record for one (entity, channel) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertDispatch {
    pub id: Uuid,
    pub entity: EntityRef,
    pub channel: String,
    pub attempt_count: u32,
    pub status: DispatchStatus,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AlertDispatch {
    pub fn new(entity: EntityRef, channel: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity,
            channel: channel.to_string(),
            attempt_count: 0,
            status: DispatchStatus::Pending,
            last_attempt_at: None,
            last_error: None,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::IncidentStatus;
    use std::collections::BTreeSet;

    #[test]
    fn test_entity_ref_json_shape() {
        let id = Uuid::new_v4();
        let json = serde_json::to_value(EntityRef::Incident(id)).unwrap();
        assert_eq!(json["kind"], "incident");
        assert_eq!(json["id"], id.to_string());
        assert_eq!(EntityRef::from_parts("anomaly", id), Some(EntityRef::Anomaly(id)));
        assert_eq!(EntityRef::from_parts("other", id), None);
    }

    #[test]
    fn test_incident_envelope() {
        let now = Utc::now();
        let incident = Incident {
            id: Uuid::new_v4(),
            title: "cpu anomaly on host1".into(),
            source: "host1".into(),
            status: IncidentStatus::Open,
            severity: Severity::Critical,
            anomaly_ids: BTreeSet::from([Uuid::new_v4(), Uuid::new_v4()]),
            correlation_key: now,
            created_at: now,
            updated_at: now,
        };
        let env = AlertEntity::Incident(incident.clone()).envelope();
        assert_eq!(env.title, incident.title);
        assert_eq!(env.severity, Severity::Critical);
        assert!(env.description.contains("2 correlated anomalies"));
        assert_eq!(env.metadata["anomaly_count"], 2);
    }
}
