//! Core domain model for crimesync: area inputs, upstream crime records and the
//! persisted row shape, plus the retry policy shared by fetch and upload.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

mod backoff;

pub use backoff::{BackoffPolicy, RetryError};

pub const CRATE_NAME: &str = "crimesync-core";

/// One geographic area (a borough) queried against the crimes endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AreaRecord {
    #[serde(alias = "borough")]
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl AreaRecord {
    pub fn new(name: impl Into<String>, latitude: f64, longitude: f64) -> Self {
        Self {
            name: name.into(),
            latitude,
            longitude,
        }
    }
}

/// A single incident as served by `crimes-street/all-crime`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawCrimeRecord {
    pub category: String,
    #[serde(default)]
    pub location: Option<CrimeLocation>,
    #[serde(default)]
    pub location_type: Option<String>,
    #[serde(default)]
    pub location_subtype: Option<String>,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub outcome_status: Option<OutcomeStatus>,
    #[serde(default)]
    pub persistent_id: Option<String>,
    pub id: i64,
    /// Left empty when absent so the transformer rejects it per record.
    #[serde(default)]
    pub month: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrimeLocation {
    #[serde(deserialize_with = "coordinate_text")]
    pub latitude: String,
    #[serde(deserialize_with = "coordinate_text")]
    pub longitude: String,
    #[serde(default)]
    pub street: Option<Street>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Street {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeStatus {
    pub category: String,
    #[serde(default)]
    pub date: Option<String>,
}

/// The upstream API serializes coordinates as strings; accept bare numbers too.
fn coordinate_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Coordinate {
        Text(String),
        Number(f64),
    }

    Ok(match Coordinate::deserialize(deserializer)? {
        Coordinate::Text(text) => text,
        Coordinate::Number(value) => value.to_string(),
    })
}

/// Column order of the persisted table; bulk inserts bind in this order.
pub const NORMALIZED_COLUMNS: [&str; 12] = [
    "category",
    "location_type",
    "location_latitude",
    "location_longitude",
    "context",
    "outcome_status",
    "persistent_id",
    "id",
    "location_subtype",
    "month",
    "year",
    "borough",
];

/// Flat persisted shape of one incident, tagged with the originating borough.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRow {
    pub category: String,
    pub location_type: Option<String>,
    pub location_latitude: String,
    pub location_longitude: String,
    pub context: Option<String>,
    pub outcome_status: Option<String>,
    pub persistent_id: Option<String>,
    pub id: i64,
    pub location_subtype: Option<String>,
    pub month: i16,
    pub year: i16,
    pub borough: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid reporting period {input:?}: expected YYYY-MM")]
pub struct PeriodParseError {
    pub input: String,
}

/// A `YYYY-MM` month, used both as the query period and to split record months.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReportingPeriod {
    year: i16,
    month: i16,
}

/// The single month the reference deployment ingests.
pub const DEFAULT_PERIOD: ReportingPeriod = ReportingPeriod {
    year: 2024,
    month: 6,
};

impl ReportingPeriod {
    pub fn new(year: i16, month: i16) -> Result<Self, PeriodParseError> {
        if !(1..=9999).contains(&year) || !(1..=12).contains(&month) {
            return Err(PeriodParseError {
                input: format!("{year}-{month}"),
            });
        }
        Ok(Self { year, month })
    }

    pub fn year(&self) -> i16 {
        self.year
    }

    pub fn month(&self) -> i16 {
        self.month
    }
}

impl FromStr for ReportingPeriod {
    type Err = PeriodParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let err = || PeriodParseError {
            input: input.to_string(),
        };
        let (year, month) = input.trim().split_once('-').ok_or_else(err)?;
        if year.len() != 4 || month.is_empty() || month.len() > 2 {
            return Err(err());
        }
        if !year.bytes().chain(month.bytes()).all(|b| b.is_ascii_digit()) {
            return Err(err());
        }
        let year: i16 = year.parse().map_err(|_| err())?;
        let month: i16 = month.parse().map_err(|_| err())?;
        Self::new(year, month).map_err(|_| err())
    }
}

impl fmt::Display for ReportingPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl Serialize for ReportingPeriod {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ReportingPeriod {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}
