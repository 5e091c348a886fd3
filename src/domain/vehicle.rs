use super::cell::CellStatus;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// A marketplace listing observed inside a cell's search result.
///
/// The three `*_last_updated` stamps are owned by independent pipelines and
/// merged last-writer-wins per field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vehicle {
    pub id: String,
    pub country: Option<String>,
    pub cell_id: Option<String>,
    pub status: CellStatus,
    pub search_last_updated: Option<NaiveDate>,
    pub pricing_last_updated: Option<NaiveDate>,
    pub detail_last_updated: Option<NaiveDate>,
}

impl Vehicle {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            country: None,
            cell_id: None,
            status: CellStatus::Success,
            search_last_updated: None,
            pricing_last_updated: None,
            detail_last_updated: None,
        }
    }

    /// A listing first seen in the search result of `cell_id`.
    pub fn observed(
        id: impl Into<String>,
        country: impl Into<String>,
        cell_id: impl Into<String>,
        date: NaiveDate,
    ) -> Self {
        Self {
            country: Some(country.into()),
            cell_id: Some(cell_id.into()),
            search_last_updated: Some(date),
            ..Self::new(id)
        }
    }

    /// Merges the fields set on `newer` over this record.
    pub fn merge(&mut self, newer: Vehicle) {
        if newer.country.is_some() {
            self.country = newer.country;
        }
        if newer.cell_id.is_some() {
            self.cell_id = newer.cell_id;
        }
        if newer.search_last_updated.is_some() {
            self.search_last_updated = newer.search_last_updated;
        }
        if newer.pricing_last_updated.is_some() {
            self.pricing_last_updated = newer.pricing_last_updated;
        }
        if newer.detail_last_updated.is_some() {
            self.detail_last_updated = newer.detail_last_updated;
        }
        self.status = newer.status;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_keeps_fields_owned_by_other_pipelines() {
        let day1 = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let day2 = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();

        let mut stored = Vehicle::observed("42", "US", "cell-a", day1);
        let mut pricing = Vehicle::new("42");
        pricing.pricing_last_updated = Some(day2);
        stored.merge(pricing);

        assert_eq!(stored.search_last_updated, Some(day1));
        assert_eq!(stored.pricing_last_updated, Some(day2));
        assert_eq!(stored.cell_id.as_deref(), Some("cell-a"));
    }

    #[test]
    fn serializes_camel_case() {
        let day = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        let json = serde_json::to_value(Vehicle::observed("7", "US", "c", day)).unwrap();
        assert_eq!(json["cellId"], "c");
        assert_eq!(json["searchLastUpdated"], "2024-03-09");
        assert_eq!(json["status"], "success");
    }
}
