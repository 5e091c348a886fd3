//! Base grid generation: tiles a bounding box with square cells of a fixed
//! side length. The last row and column overhang the box edge, matching how
//! the grid is produced upstream (`arange(min, max, size)` origins).

use super::cell::{Cell, Coordinate};
use anyhow::{bail, Result};

/// Axis-aligned bounding box in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub top_right: Coordinate,
    pub bottom_left: Coordinate,
}

impl Bounds {
    pub fn new(top_right: Coordinate, bottom_left: Coordinate) -> Self {
        Self {
            top_right,
            bottom_left,
        }
    }
}

/// Produces the base grid covering `bounds`, column by column.
pub fn calibrate(bounds: Bounds, cell_size: f64, country: &str) -> Result<Vec<Cell>> {
    if !(cell_size.is_finite() && cell_size > 0.0) {
        bail!("cell_size must be a positive number");
    }

    let lng_origins = origins(bounds.bottom_left.lng, bounds.top_right.lng, cell_size);
    let lat_origins = origins(bounds.bottom_left.lat, bounds.top_right.lat, cell_size);
    if lng_origins.is_empty() || lat_origins.is_empty() {
        bail!("bounds must have a positive extent");
    }

    let mut cells = Vec::with_capacity(lng_origins.len() * lat_origins.len());
    for lng in &lng_origins {
        for lat in &lat_origins {
            cells.push(Cell::new(
                Coordinate::new(lat + cell_size, lng + cell_size),
                Coordinate::new(*lat, *lng),
                country,
                cell_size,
            )?);
        }
    }
    Ok(cells)
}

fn origins(start: f64, end: f64, step: f64) -> Vec<f64> {
    let mut origins = Vec::new();
    let mut index = 0u32;
    loop {
        let origin = start + step * f64::from(index);
        if origin >= end {
            break;
        }
        origins.push(origin);
        index += 1;
    }
    origins
}
