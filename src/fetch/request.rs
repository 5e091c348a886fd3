//! Request shapes for the three marketplace calls and the structural checks
//! a response must pass before it counts as a success.

use super::error::FetchError;
use crate::domain::{Cell, VehicleTarget};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const SEARCH_PATH: &str = "/api/v2/search";
pub const PRICING_PATH: &str = "/api/vehicle/daily_pricing";
pub const DETAIL_PATH: &str = "/api/vehicle/detail";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Search,
    Pricing,
    Detail,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Search => "search",
            RequestKind::Pricing => "pricing",
            RequestKind::Detail => "detail",
        }
    }
}

/// One logical call, relative to the marketplace origin.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub kind: RequestKind,
    pub method: HttpMethod,
    pub path: &'static str,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchSort {
    pub direction: SortDirection,
    #[serde(rename = "type")]
    pub kind: String,
}

impl Default for SearchSort {
    fn default() -> Self {
        Self {
            direction: SortDirection::Asc,
            kind: "DISTANCE".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchFilters {
    pub engines: Vec<String>,
    pub makes: Vec<String>,
    pub models: Vec<String>,
    pub tmv_tiers: Vec<String>,
    pub features: Vec<String>,
    pub types: Vec<String>,
}

/// Filters and sort fixed for a whole run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchOptions {
    pub filters: SearchFilters,
    pub sort: SearchSort,
}

impl FetchRequest {
    /// Bounding-box search over `cell`.
    pub fn search(cell: &Cell, options: &SearchOptions) -> Self {
        let tr = cell.top_right();
        let bl = cell.bottom_left();
        let filters = &options.filters;
        let body = json!({
            "filters": {
                "location": {
                    "country": cell.country(),
                    "type": "boundingbox",
                    "bottomLeft": { "lat": bl.lat, "lng": bl.lng },
                    "topRight": { "lat": tr.lat, "lng": tr.lng },
                },
                "engines": filters.engines,
                "makes": filters.makes,
                "models": filters.models,
                "tmvTiers": filters.tmv_tiers,
                "features": filters.features,
                "types": filters.types,
            },
            "sorts": options.sort,
        });

        Self {
            kind: RequestKind::Search,
            method: HttpMethod::Post,
            path: SEARCH_PATH,
            query: Vec::new(),
            body: Some(body),
        }
    }

    /// Daily pricing for one listing over `[startDate, endDate]`.
    pub fn pricing(target: &VehicleTarget) -> Self {
        let query = vec![
            ("end".to_string(), target.end_date.clone().unwrap_or_default()),
            (
                "start".to_string(),
                target.start_date.clone().unwrap_or_default(),
            ),
            ("vehicleId".to_string(), target.vehicle_id.clone()),
        ];
        Self {
            kind: RequestKind::Pricing,
            method: HttpMethod::Get,
            path: PRICING_PATH,
            query,
            body: None,
        }
    }

    /// Listing detail for one trip window.
    pub fn detail(target: &VehicleTarget) -> Self {
        let field = |value: &Option<String>| value.clone().unwrap_or_default();
        let query = vec![
            ("endDate".to_string(), field(&target.end_date)),
            ("endTime".to_string(), field(&target.end_time)),
            ("startDate".to_string(), field(&target.start_date)),
            ("startTime".to_string(), field(&target.start_time)),
            ("vehicleId".to_string(), target.vehicle_id.clone()),
        ];
        Self {
            kind: RequestKind::Detail,
            method: HttpMethod::Get,
            path: DETAIL_PATH,
            query,
            body: None,
        }
    }
}

/// Checks that `body` has the shape `kind` promises.
pub fn validate_response(kind: RequestKind, body: &Value) -> Result<(), FetchError> {
    match kind {
        RequestKind::Search => SearchPage::from_body(body).map(|_| ()),
        RequestKind::Pricing => {
            if !body
                .get("dailyPricingResponses")
                .map(Value::is_array)
                .unwrap_or(false)
            {
                return Err(FetchError::MalformedResponse(
                    "dailyPricingResponses must be an array".to_string(),
                ));
            }
            if !body
                .get("calendarCurrencyHeader")
                .map(Value::is_string)
                .unwrap_or(false)
            {
                return Err(FetchError::MalformedResponse(
                    "calendarCurrencyHeader must be a string".to_string(),
                ));
            }
            Ok(())
        }
        RequestKind::Detail => {
            if body.is_object() {
                Ok(())
            } else {
                Err(FetchError::MalformedResponse(
                    "detail response must be an object".to_string(),
                ))
            }
        }
    }
}

/// The parts of a search response the refinement loop reads.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchPage {
    /// Number of listings in the page.
    pub count: usize,
    /// Radius the marketplace actually applied; zero means the area cannot shrink further.
    pub applied_radius: Option<f64>,
}

impl SearchPage {
    pub fn from_body(body: &Value) -> Result<Self, FetchError> {
        let vehicles = body
            .get("vehicles")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                FetchError::MalformedResponse("search response has no vehicles array".to_string())
            })?;
        let applied_radius = body
            .pointer("/searchLocation/appliedRadius/value")
            .and_then(Value::as_f64);
        Ok(Self {
            count: vehicles.len(),
            applied_radius,
        })
    }

    pub fn radius_exhausted(&self) -> bool {
        self.applied_radius == Some(0.0)
    }
}

/// Listing ids found in a search response, as strings.
pub fn listing_ids(body: &Value) -> Vec<String> {
    body.get("vehicles")
        .and_then(Value::as_array)
        .map(|vehicles| {
            vehicles
                .iter()
                .filter_map(|vehicle| match vehicle.get("id") {
                    Some(Value::String(id)) => Some(id.clone()),
                    Some(Value::Number(id)) => Some(id.to_string()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}
