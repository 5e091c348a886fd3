//! Outbound message bodies. The target id is written under the field name
//! the pipeline kind uses (`cellId` or `vehicleId`).

use crate::domain::{Vehicle, WorkKind};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use serde_json::Value;

/// A listing as reported alongside a search result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingSummary {
    pub id: String,
    pub country: String,
    pub cell_id: String,
    pub search_last_updated: NaiveDate,
}

impl ListingSummary {
    pub fn to_vehicle(&self) -> Vehicle {
        Vehicle::observed(
            self.id.clone(),
            self.country.clone(),
            self.cell_id.clone(),
            self.search_last_updated,
        )
    }
}

/// Success message: `{<idField>, scraped, jobId}` plus, for searches, the
/// base cell and the listings found in the leaf.
#[derive(Debug, Clone, PartialEq)]
pub struct ScrapedRecord {
    pub kind: WorkKind,
    pub target_id: String,
    pub scraped: Value,
    pub job_id: String,
    pub base_cell_id: Option<String>,
    pub vehicles: Option<Vec<ListingSummary>>,
}

impl ScrapedRecord {
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

impl Serialize for ScrapedRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry(self.kind.id_field(), &self.target_id)?;
        if let Some(base) = &self.base_cell_id {
            map.serialize_entry("baseCellId", base)?;
        }
        map.serialize_entry("scraped", &self.scraped)?;
        if let Some(vehicles) = &self.vehicles {
            map.serialize_entry("vehicles", vehicles)?;
        }
        map.serialize_entry("jobId", &self.job_id)?;
        map.end()
    }
}

/// Dead-letter message: `{<idField>, error, timestamp, jobId}`.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureRecord {
    pub kind: WorkKind,
    pub target_id: Option<String>,
    pub error: String,
    pub timestamp: DateTime<Utc>,
    pub job_id: Option<String>,
}

impl FailureRecord {
    pub fn new(
        kind: WorkKind,
        target_id: Option<String>,
        error: impl Into<String>,
        job_id: Option<String>,
    ) -> Self {
        Self {
            kind,
            target_id,
            error: error.into(),
            timestamp: Utc::now(),
            job_id,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

impl Serialize for FailureRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(4))?;
        map.serialize_entry(self.kind.id_field(), &self.target_id)?;
        map.serialize_entry("error", &self.error)?;
        map.serialize_entry(
            "timestamp",
            &self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        )?;
        map.serialize_entry("jobId", &self.job_id)?;
        map.end()
    }
}
