//! Tabular row formats for persisted cells and listings.
//!
//! One descriptor per table, with free functions converting records to and
//! from string rows. Empty strings stand for missing values.

use super::cell::{Cell, CellStatus, Coordinate};
use super::vehicle::Vehicle;
use anyhow::{bail, Context, Result};
use chrono::NaiveDate;

pub const DATE_FORMAT: &str = "%Y-%m-%d";

const BASE_GRID_HEADERS: &[&str] = &[
    "id",
    "country",
    "cell_size",
    "status",
    "top_right_lat",
    "top_right_lng",
    "bottom_left_lat",
    "bottom_left_lng",
    "search_last_updated",
];

const OPTIMAL_GRID_HEADERS: &[&str] = &[
    "id",
    "country",
    "base_cell_size",
    "vehicle_count",
    "status",
    "top_right_lat",
    "top_right_lng",
    "bottom_left_lat",
    "bottom_left_lng",
    "search_last_updated",
];

const VEHICLE_HEADERS: &[&str] = &[
    "id",
    "cell_id",
    "country",
    "status",
    "pricing_last_updated",
    "search_last_updated",
    "detail_last_updated",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowFormat {
    /// Calibration cells, before any refinement.
    BaseGrid,
    /// Accepted leaves of the adaptive search.
    OptimalGrid,
    Vehicles,
}

impl RowFormat {
    pub fn headers(&self) -> &'static [&'static str] {
        match self {
            RowFormat::BaseGrid => BASE_GRID_HEADERS,
            RowFormat::OptimalGrid => OPTIMAL_GRID_HEADERS,
            RowFormat::Vehicles => VEHICLE_HEADERS,
        }
    }
}

pub fn cell_to_row(format: RowFormat, cell: &Cell) -> Result<Vec<String>> {
    let tr = cell.top_right();
    let bl = cell.bottom_left();
    let corners = [
        tr.lat.to_string(),
        tr.lng.to_string(),
        bl.lat.to_string(),
        bl.lng.to_string(),
    ];
    let updated = format_date(cell.last_updated());

    let mut row = vec![cell.id().to_string(), cell.country().to_string()];
    match format {
        RowFormat::BaseGrid => {
            row.push(cell.cell_size().to_string());
            row.push(cell.status().to_string());
        }
        RowFormat::OptimalGrid => {
            row.push(cell.cell_size().to_string());
            row.push(
                cell.vehicle_count()
                    .map(|count| count.to_string())
                    .unwrap_or_default(),
            );
            row.push(cell.status().to_string());
        }
        RowFormat::Vehicles => bail!("vehicle row format cannot encode a cell"),
    }
    row.extend(corners);
    row.push(updated);
    Ok(row)
}

pub fn cell_from_row(format: RowFormat, row: &[&str]) -> Result<Cell> {
    let fields = Fields::new(format, row)?;
    let vehicle_count = match format {
        RowFormat::BaseGrid => None,
        RowFormat::OptimalGrid => fields
            .optional("vehicle_count")
            .map(|value| value.parse::<usize>())
            .transpose()
            .context("vehicle_count must be a non-negative integer")?,
        RowFormat::Vehicles => bail!("vehicle row format cannot decode a cell"),
    };
    let size_column = match format {
        RowFormat::OptimalGrid => "base_cell_size",
        _ => "cell_size",
    };

    let mut cell = Cell::new(
        Coordinate::new(
            fields.number("top_right_lat")?,
            fields.number("top_right_lng")?,
        ),
        Coordinate::new(
            fields.number("bottom_left_lat")?,
            fields.number("bottom_left_lng")?,
        ),
        fields.required("country")?,
        fields.number(size_column)?,
    )?;

    let stored_id = fields.required("id")?;
    if stored_id != cell.id() {
        bail!(
            "row id {stored_id} does not match corners (expected {})",
            cell.id()
        );
    }

    cell.restore(
        vehicle_count,
        fields.status()?,
        fields.date("search_last_updated")?,
    );
    Ok(cell)
}

pub fn vehicle_to_row(vehicle: &Vehicle) -> Vec<String> {
    vec![
        vehicle.id.clone(),
        vehicle.cell_id.clone().unwrap_or_default(),
        vehicle.country.clone().unwrap_or_default(),
        vehicle.status.to_string(),
        format_date(vehicle.pricing_last_updated),
        format_date(vehicle.search_last_updated),
        format_date(vehicle.detail_last_updated),
    ]
}

pub fn vehicle_from_row(row: &[&str]) -> Result<Vehicle> {
    let fields = Fields::new(RowFormat::Vehicles, row)?;
    let mut vehicle = Vehicle::new(fields.required("id")?);
    vehicle.cell_id = fields.optional("cell_id").map(str::to_string);
    vehicle.country = fields.optional("country").map(str::to_string);
    vehicle.status = fields.status()?;
    vehicle.pricing_last_updated = fields.date("pricing_last_updated")?;
    vehicle.search_last_updated = fields.date("search_last_updated")?;
    vehicle.detail_last_updated = fields.date("detail_last_updated")?;
    Ok(vehicle)
}

fn format_date(date: Option<NaiveDate>) -> String {
    date.map(|d| d.format(DATE_FORMAT).to_string())
        .unwrap_or_default()
}

struct Fields<'a> {
    headers: &'static [&'static str],
    row: &'a [&'a str],
}

impl<'a> Fields<'a> {
    fn new(format: RowFormat, row: &'a [&'a str]) -> Result<Self> {
        let headers = format.headers();
        if row.len() != headers.len() {
            bail!(
                "expected {} columns for {:?}, got {}",
                headers.len(),
                format,
                row.len()
            );
        }
        Ok(Self { headers, row })
    }

    fn optional(&self, column: &str) -> Option<&'a str> {
        let index = self.headers.iter().position(|h| *h == column)?;
        let value = self.row[index].trim();
        (!value.is_empty()).then_some(value)
    }

    fn required(&self, column: &str) -> Result<&'a str> {
        self.optional(column)
            .with_context(|| format!("{column} cannot be empty"))
    }

    fn number(&self, column: &str) -> Result<f64> {
        self.required(column)?
            .parse::<f64>()
            .with_context(|| format!("{column} must be a number"))
    }

    fn date(&self, column: &str) -> Result<Option<NaiveDate>> {
        self.optional(column)
            .map(|value| NaiveDate::parse_from_str(value, DATE_FORMAT))
            .transpose()
            .with_context(|| format!("{column} must be formatted as yyyy-mm-dd"))
    }

    fn status(&self) -> Result<CellStatus> {
        match self.optional("status") {
            None | Some("success") => Ok(CellStatus::Success),
            Some("failed") => Ok(CellStatus::Failed),
            Some(other) => bail!("unknown status `{other}`"),
        }
    }
}
