use crate::domain::WorkKind;

/// Which broker family a deployment consumes from; only affects default names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerFlavor {
    Log,
    Queue,
}

impl BrokerFlavor {
    fn suffix(&self) -> &'static str {
        match self {
            BrokerFlavor::Log => "topic",
            BrokerFlavor::Queue => "queue",
        }
    }
}

/// Source plus the two outbound sinks of one pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destinations {
    pub source: String,
    pub scraped: String,
    pub dead_letter: String,
}

impl Destinations {
    /// Names used by the production deployment, e.g. `TO-BE-SCRAPED-cells-queue`.
    pub fn defaults(kind: WorkKind, flavor: BrokerFlavor) -> Self {
        let stem = match kind {
            WorkKind::CellSearch => "cells",
            WorkKind::VehiclePricing => "dr-availability",
            WorkKind::VehicleDetail => "vehicle-details",
        };
        let suffix = flavor.suffix();
        Self {
            source: format!("TO-BE-SCRAPED-{stem}-{suffix}"),
            scraped: format!("SCRAPED-{stem}-{suffix}"),
            dead_letter: format!("DLQ-{stem}-{suffix}"),
        }
    }
}
