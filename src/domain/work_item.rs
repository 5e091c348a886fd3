//! Queue messages decoded into typed work items.

use super::cell::{Cell, Coordinate};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

const DEFAULT_COUNTRY: &str = "US";

/// Broker-specific position needed to settle exactly one message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeliveryPosition {
    /// Partitioned log: settling commits `offset + 1`.
    Log {
        topic: String,
        partition: i32,
        offset: i64,
    },
    /// Queue broker: settling acks the delivery tag.
    Queue { delivery_tag: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkKind {
    CellSearch,
    VehiclePricing,
    VehicleDetail,
}

impl WorkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkKind::CellSearch => "cell_search",
            WorkKind::VehiclePricing => "vehicle_pricing",
            WorkKind::VehicleDetail => "vehicle_detail",
        }
    }

    /// Name of the target id field in outbound messages.
    pub fn id_field(&self) -> &'static str {
        match self {
            WorkKind::CellSearch => "cellId",
            WorkKind::VehiclePricing | WorkKind::VehicleDetail => "vehicleId",
        }
    }
}

impl fmt::Display for WorkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bounds of a cell to refine, as carried on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellTarget {
    #[serde(default, alias = "cellId", deserialize_with = "optional_id")]
    pub id: Option<String>,
    pub top_right_lat: f64,
    pub top_right_lng: f64,
    pub bottom_left_lat: f64,
    pub bottom_left_lng: f64,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub cell_size: Option<f64>,
}

impl CellTarget {
    pub fn to_cell(&self) -> Result<Cell, super::cell::CellError> {
        Cell::new(
            Coordinate::new(self.top_right_lat, self.top_right_lng),
            Coordinate::new(self.bottom_left_lat, self.bottom_left_lng),
            self.country.as_deref().unwrap_or(DEFAULT_COUNTRY),
            self.cell_size.unwrap_or(0.0),
        )
    }
}

/// A listing plus the date/time window a pricing or detail fetch covers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleTarget {
    #[serde(alias = "id", deserialize_with = "required_id")]
    pub vehicle_id: String,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkPayload {
    CellSearch(CellTarget),
    VehiclePricing(VehicleTarget),
    VehicleDetail(VehicleTarget),
}

impl WorkPayload {
    pub fn kind(&self) -> WorkKind {
        match self {
            WorkPayload::CellSearch(_) => WorkKind::CellSearch,
            WorkPayload::VehiclePricing(_) => WorkKind::VehiclePricing,
            WorkPayload::VehicleDetail(_) => WorkKind::VehicleDetail,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub payload: WorkPayload,
    pub job_id: String,
    pub position: DeliveryPosition,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkItemError {
    Malformed {
        kind: WorkKind,
        target_id: Option<String>,
        reason: String,
    },
    MissingJobId {
        kind: WorkKind,
        target_id: Option<String>,
    },
}

impl WorkItemError {
    /// Best-effort target id recovered from the raw message, for failure records.
    pub fn target_id(&self) -> Option<&str> {
        match self {
            WorkItemError::Malformed { target_id, .. }
            | WorkItemError::MissingJobId { target_id, .. } => target_id.as_deref(),
        }
    }
}

impl fmt::Display for WorkItemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkItemError::Malformed { kind, reason, .. } => {
                write!(f, "malformed {kind} message: {reason}")
            }
            WorkItemError::MissingJobId { kind, .. } => {
                write!(f, "{kind} message has no jobId")
            }
        }
    }
}

impl std::error::Error for WorkItemError {}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    #[serde(default, deserialize_with = "optional_id")]
    job_id: Option<String>,
}

impl WorkItem {
    /// Decodes a raw message body for the pipeline `kind`.
    pub fn parse(
        kind: WorkKind,
        body: &[u8],
        position: DeliveryPosition,
    ) -> Result<Self, WorkItemError> {
        let value: serde_json::Value =
            serde_json::from_slice(body).map_err(|err| WorkItemError::Malformed {
                kind,
                target_id: None,
                reason: err.to_string(),
            })?;
        let target_id = raw_target_id(kind, &value);

        let envelope = Envelope::deserialize(&value).map_err(|err| WorkItemError::Malformed {
            kind,
            target_id: target_id.clone(),
            reason: err.to_string(),
        })?;
        let job_id = envelope.job_id.ok_or(WorkItemError::MissingJobId {
            kind,
            target_id: target_id.clone(),
        })?;

        let malformed = |err: serde_json::Error| WorkItemError::Malformed {
            kind,
            target_id: target_id.clone(),
            reason: err.to_string(),
        };
        let payload = match kind {
            WorkKind::CellSearch => {
                WorkPayload::CellSearch(CellTarget::deserialize(&value).map_err(malformed)?)
            }
            WorkKind::VehiclePricing => {
                WorkPayload::VehiclePricing(VehicleTarget::deserialize(&value).map_err(malformed)?)
            }
            WorkKind::VehicleDetail => {
                WorkPayload::VehicleDetail(VehicleTarget::deserialize(&value).map_err(malformed)?)
            }
        };

        Ok(Self {
            payload,
            job_id,
            position,
        })
    }

    pub fn kind(&self) -> WorkKind {
        self.payload.kind()
    }

    /// Id of the cell or listing this item targets, if the message carried one.
    pub fn target_id(&self) -> Option<String> {
        match &self.payload {
            WorkPayload::CellSearch(target) => target.id.clone().or_else(|| {
                target.to_cell().ok().map(|cell| cell.id().to_string())
            }),
            WorkPayload::VehiclePricing(target) | WorkPayload::VehicleDetail(target) => {
                Some(target.vehicle_id.clone())
            }
        }
    }
}

fn raw_target_id(kind: WorkKind, value: &serde_json::Value) -> Option<String> {
    let keys: &[&str] = match kind {
        WorkKind::CellSearch => &["cellId", "id"],
        WorkKind::VehiclePricing | WorkKind::VehicleDetail => &["vehicleId", "id"],
    };
    keys.iter()
        .filter_map(|key| value.get(*key))
        .find_map(id_from_value)
}

fn id_from_value(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn optional_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(id_from_value))
}

fn required_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    id_from_value(&value).ok_or_else(|| serde::de::Error::custom("id must be a string or number"))
}
