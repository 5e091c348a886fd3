//! In-memory bookkeeping of cells and listings touched by the pipelines.
//!
//! Records are keyed by id, so re-inserting the same cell or listing updates
//! it in place. Listing fields merge last-writer-wins per field.

use crate::domain::rows::{cell_to_row, vehicle_to_row, RowFormat};
use crate::domain::{Cell, Vehicle};
use anyhow::Result;
use std::collections::HashMap;
use tokio::sync::Mutex;

#[derive(Debug, Default)]
pub struct MetadataStore {
    inner: Mutex<MetadataInner>,
}

#[derive(Debug, Default)]
struct MetadataInner {
    base_cells: HashMap<String, Cell>,
    optimal_cells: HashMap<String, Cell>,
    vehicles: HashMap<String, Vehicle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetadataCounts {
    pub base_cells: usize,
    pub optimal_cells: usize,
    pub vehicles: usize,
}

impl MetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert_base_cell(&self, cell: Cell) {
        let mut inner = self.inner.lock().await;
        inner.base_cells.insert(cell.id().to_string(), cell);
    }

    pub async fn upsert_optimal_cell(&self, cell: Cell) {
        let mut inner = self.inner.lock().await;
        inner.optimal_cells.insert(cell.id().to_string(), cell);
    }

    pub async fn upsert_vehicle(&self, vehicle: Vehicle) {
        let mut inner = self.inner.lock().await;
        match inner.vehicles.get_mut(&vehicle.id) {
            Some(existing) => existing.merge(vehicle),
            None => {
                inner.vehicles.insert(vehicle.id.clone(), vehicle);
            }
        }
    }

    pub async fn base_cell(&self, id: &str) -> Option<Cell> {
        self.inner.lock().await.base_cells.get(id).cloned()
    }

    pub async fn optimal_cell(&self, id: &str) -> Option<Cell> {
        self.inner.lock().await.optimal_cells.get(id).cloned()
    }

    pub async fn vehicle(&self, id: &str) -> Option<Vehicle> {
        self.inner.lock().await.vehicles.get(id).cloned()
    }

    pub async fn counts(&self) -> MetadataCounts {
        let inner = self.inner.lock().await;
        MetadataCounts {
            base_cells: inner.base_cells.len(),
            optimal_cells: inner.optimal_cells.len(),
            vehicles: inner.vehicles.len(),
        }
    }

    /// Renders one table as rows, sorted by id for stable snapshots.
    pub async fn rows(&self, format: RowFormat) -> Result<Vec<Vec<String>>> {
        let inner = self.inner.lock().await;
        let mut rows = match format {
            RowFormat::BaseGrid => inner
                .base_cells
                .values()
                .map(|cell| cell_to_row(format, cell))
                .collect::<Result<Vec<_>>>()?,
            RowFormat::OptimalGrid => inner
                .optimal_cells
                .values()
                .map(|cell| cell_to_row(format, cell))
                .collect::<Result<Vec<_>>>()?,
            RowFormat::Vehicles => inner.vehicles.values().map(vehicle_to_row).collect(),
        };
        rows.sort_by(|a, b| a[0].cmp(&b[0]));
        Ok(rows)
    }

    /// Drops every record.
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        inner.base_cells.clear();
        inner.optimal_cells.clear();
        inner.vehicles.clear();
    }
}
