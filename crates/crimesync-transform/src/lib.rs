//! Flattening of per-area API payloads into persisted rows, and the early
//! duplicate filter applied before upload.

use std::collections::HashSet;

use crimesync_core::{AreaRecord, NormalizedRow, RawCrimeRecord, ReportingPeriod};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "crimesync-transform";

/// Placeholder some upstream tooling writes for a missing value. Never persisted.
pub const MISSING_SENTINEL: &str = "None";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowRejection {
    #[error("crime {id} has no location")]
    MissingLocation { id: i64 },
    #[error("crime {id} has unparseable month {month:?}")]
    BadMonth { id: i64, month: String },
    #[error("crime record {id:?} does not decode: {reason}")]
    Malformed { id: Option<i64>, reason: String },
}

/// Anything the transformer can turn into a [`NormalizedRow`] for a borough.
pub trait IntoCrimeRow {
    fn into_row(self, borough: &str) -> Result<NormalizedRow, RowRejection>;
}

fn scrub(value: Option<String>) -> Option<String> {
    value.filter(|v| v != MISSING_SENTINEL)
}

impl IntoCrimeRow for RawCrimeRecord {
    fn into_row(self, borough: &str) -> Result<NormalizedRow, RowRejection> {
        let Some(location) = self.location else {
            return Err(RowRejection::MissingLocation { id: self.id });
        };
        let period: ReportingPeriod = self.month.parse().map_err(|_| RowRejection::BadMonth {
            id: self.id,
            month: self.month.clone(),
        })?;

        Ok(NormalizedRow {
            category: self.category,
            location_type: scrub(self.location_type),
            location_latitude: location.latitude,
            location_longitude: location.longitude,
            context: scrub(self.context),
            outcome_status: scrub(self.outcome_status.map(|o| o.category)),
            persistent_id: scrub(self.persistent_id),
            id: self.id,
            location_subtype: scrub(self.location_subtype),
            month: period.month(),
            year: period.year(),
            borough: borough.to_string(),
        })
    }
}

/// One element of a fetched JSON array, decoded on its own so a bad record
/// does not take its neighbours down with it.
impl IntoCrimeRow for Value {
    fn into_row(self, borough: &str) -> Result<NormalizedRow, RowRejection> {
        let id = self.get("id").and_then(Value::as_i64);
        let record: RawCrimeRecord =
            serde_json::from_value(self).map_err(|err| RowRejection::Malformed {
                id,
                reason: err.to_string(),
            })?;
        record.into_row(borough)
    }
}

/// Already flat; only the borough tag is (re)applied.
impl IntoCrimeRow for NormalizedRow {
    fn into_row(self, borough: &str) -> Result<NormalizedRow, RowRejection> {
        Ok(NormalizedRow {
            location_type: scrub(self.location_type),
            context: scrub(self.context),
            outcome_status: scrub(self.outcome_status),
            persistent_id: scrub(self.persistent_id),
            location_subtype: scrub(self.location_subtype),
            borough: borough.to_string(),
            ..self
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchRows {
    pub rows: Vec<NormalizedRow>,
    pub areas_with_data: usize,
    pub rejected: usize,
}

/// Flatten one batch. `results[i]` must be the payload fetched for `areas[i]`.
pub fn transform_batch<R: IntoCrimeRow>(areas: &[AreaRecord], results: Vec<Vec<R>>) -> BatchRows {
    if areas.len() != results.len() {
        warn!(
            areas = areas.len(),
            results = results.len(),
            "area/result count mismatch; extra entries ignored"
        );
    }

    let mut out = BatchRows::default();
    for (area, records) in areas.iter().zip(results) {
        if records.is_empty() {
            continue;
        }
        out.areas_with_data += 1;
        out.rows.reserve(records.len());
        for record in records {
            match record.into_row(&area.name) {
                Ok(row) => out.rows.push(row),
                Err(rejection) => {
                    warn!(area = %area.name, %rejection, "dropping crime record");
                    out.rejected += 1;
                }
            }
        }
    }
    out
}

/// Ids already persisted when the run started.
///
/// Loaded once per run, so rows uploaded by an earlier batch of the same run are
/// not in here; the table's primary key with conflict-skip inserts covers that.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExistingIdSet {
    ids: HashSet<i64>,
}

impl ExistingIdSet {
    pub fn new(ids: HashSet<i64>) -> Self {
        Self { ids }
    }

    pub fn contains(&self, id: i64) -> bool {
        self.ids.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Drop rows whose id is already persisted, keeping the rest in order.
    pub fn filter(&self, rows: Vec<NormalizedRow>) -> Vec<NormalizedRow> {
        rows.into_iter().filter(|row| !self.contains(row.id)).collect()
    }
}

impl FromIterator<i64> for ExistingIdSet {
    fn from_iter<I: IntoIterator<Item = i64>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}
