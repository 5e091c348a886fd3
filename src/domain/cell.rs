//! Rectangular search partitions and their content-addressed identity.

use super::geohash::{self, CELL_ID_PRECISION};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A latitude/longitude pair in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

/// Outcome of the last fetch against a cell.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellStatus {
    #[default]
    Success,
    Failed,
}

impl CellStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CellStatus::Success => "success",
            CellStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for CellStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CellError {
    NonFinite,
    Degenerate {
        top_right: Coordinate,
        bottom_left: Coordinate,
    },
    InvalidDivider {
        divider: usize,
    },
}

impl fmt::Display for CellError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellError::NonFinite => write!(f, "cell corners must be finite numbers"),
            CellError::Degenerate {
                top_right,
                bottom_left,
            } => write!(
                f,
                "cell is degenerate: top right ({}, {}) must be north-east of bottom left ({}, {})",
                top_right.lat, top_right.lng, bottom_left.lat, bottom_left.lng
            ),
            CellError::InvalidDivider { divider } => {
                write!(f, "split divider must be at least 2 (got {divider})")
            }
        }
    }
}

impl std::error::Error for CellError {}

/// Rectangular geographic region used as a search partition.
///
/// The id is derived from both corners, so two cells with equal corners are
/// the same cell regardless of how they were produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Cell {
    id: String,
    country: String,
    cell_size: f64,
    top_right: Coordinate,
    bottom_left: Coordinate,
    vehicle_count: Option<usize>,
    status: CellStatus,
    last_updated: Option<NaiveDate>,
}

impl Cell {
    /// Builds a cell after checking the rectangle is finite and non-degenerate.
    pub fn new(
        top_right: Coordinate,
        bottom_left: Coordinate,
        country: impl Into<String>,
        cell_size: f64,
    ) -> Result<Self, CellError> {
        let corners = [top_right.lat, top_right.lng, bottom_left.lat, bottom_left.lng];
        if corners.iter().any(|value| !value.is_finite()) {
            return Err(CellError::NonFinite);
        }
        if top_right.lat <= bottom_left.lat || top_right.lng <= bottom_left.lng {
            return Err(CellError::Degenerate {
                top_right,
                bottom_left,
            });
        }

        Ok(Self {
            id: cell_id(top_right, bottom_left),
            country: country.into(),
            cell_size,
            top_right,
            bottom_left,
            vehicle_count: None,
            status: CellStatus::Success,
            last_updated: None,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn country(&self) -> &str {
        &self.country
    }

    /// Side length class inherited from the calibration grid.
    pub fn cell_size(&self) -> f64 {
        self.cell_size
    }

    pub fn top_right(&self) -> Coordinate {
        self.top_right
    }

    pub fn bottom_left(&self) -> Coordinate {
        self.bottom_left
    }

    /// Result density observed at the last fetch, `None` until measured.
    pub fn vehicle_count(&self) -> Option<usize> {
        self.vehicle_count
    }

    pub fn status(&self) -> CellStatus {
        self.status
    }

    pub fn last_updated(&self) -> Option<NaiveDate> {
        self.last_updated
    }

    pub fn width(&self) -> f64 {
        self.top_right.lng - self.bottom_left.lng
    }

    pub fn height(&self) -> f64 {
        self.top_right.lat - self.bottom_left.lat
    }

    pub fn area(&self) -> f64 {
        self.width() * self.height()
    }

    pub fn record_success(&mut self, vehicle_count: usize, date: NaiveDate) {
        self.vehicle_count = Some(vehicle_count);
        self.status = CellStatus::Success;
        self.last_updated = Some(date);
    }

    pub fn record_failure(&mut self, date: NaiveDate) {
        self.status = CellStatus::Failed;
        self.last_updated = Some(date);
    }

    pub(crate) fn restore(
        &mut self,
        vehicle_count: Option<usize>,
        status: CellStatus,
        last_updated: Option<NaiveDate>,
    ) {
        self.vehicle_count = vehicle_count;
        self.status = status;
        self.last_updated = last_updated;
    }

    /// Splits the cell into `divider × divider` equal sub-cells.
    ///
    /// Interior edges are computed once and shared by neighbours, and the
    /// outer edges reuse this cell's exact corners, so the children tile the
    /// parent with no gap or overlap. Children are ordered column by column,
    /// west to east, south to north within each column.
    pub fn split(&self, divider: usize) -> Result<Vec<Cell>, CellError> {
        if divider < 2 {
            return Err(CellError::InvalidDivider { divider });
        }

        let lat_edges = edges(self.bottom_left.lat, self.top_right.lat, divider);
        let lng_edges = edges(self.bottom_left.lng, self.top_right.lng, divider);

        let mut cells = Vec::with_capacity(divider * divider);
        for column in lng_edges.windows(2) {
            for row in lat_edges.windows(2) {
                cells.push(Cell::new(
                    Coordinate::new(row[1], column[1]),
                    Coordinate::new(row[0], column[0]),
                    self.country.clone(),
                    self.cell_size,
                )?);
            }
        }
        Ok(cells)
    }
}

/// Derives the content-addressed id of a rectangle from its corners.
pub fn cell_id(top_right: Coordinate, bottom_left: Coordinate) -> String {
    format!(
        "{}.{}",
        geohash::encode(top_right.lat, top_right.lng, CELL_ID_PRECISION),
        geohash::encode(bottom_left.lat, bottom_left.lng, CELL_ID_PRECISION)
    )
}

fn edges(start: f64, end: f64, divider: usize) -> Vec<f64> {
    let step = (end - start) / divider as f64;
    let mut edges: Vec<f64> = (0..divider).map(|i| start + step * i as f64).collect();
    edges.push(end);
    edges
}
