//! Data model shared by every pipeline: search cells and their identity,
//! listings, queue work items, job states, and the tabular row formats used
//! by downstream persistence.

pub mod calibrate;
pub mod cell;
pub mod geohash;
pub mod job;
pub mod rows;
pub mod vehicle;
pub mod work_item;

pub use calibrate::{calibrate, Bounds};
pub use cell::{Cell, CellError, CellStatus, Coordinate};
pub use job::JobStatus;
pub use rows::RowFormat;
pub use vehicle::Vehicle;
pub use work_item::{
    CellTarget, DeliveryPosition, VehicleTarget, WorkItem, WorkItemError, WorkKind, WorkPayload,
};
