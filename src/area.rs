//! Declarative description of one ingestion target.
//!
//! An [`AreaConfig`] is everything the graph builder and the search operator
//! need to know about an area: where it is (WRS-2 path/row pairs), which bands
//! to process, how to pick scenes, and where the artifacts go. It is immutable
//! once validated; the builder refuses to plan a graph for an invalid one.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Highest WRS-2 path number.
const WRS2_MAX_PATH: u16 = 233;
/// Highest WRS-2 row number.
const WRS2_MAX_ROW: u16 = 248;

/// A WRS-2 path/row coordinate.
///
/// Serialized as a two element array, `[path, row]`, which keeps settings
/// files close to how operators usually write these pairs down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "(u16, u16)", into = "(u16, u16)")]
pub struct LocationPair {
    pub path: u16,
    pub row: u16,
}

impl LocationPair {
    pub fn new(path: u16, row: u16) -> Self {
        Self { path, row }
    }

    pub fn is_valid(&self) -> bool {
        (1..=WRS2_MAX_PATH).contains(&self.path) && (1..=WRS2_MAX_ROW).contains(&self.row)
    }
}

impl From<(u16, u16)> for LocationPair {
    fn from((path, row): (u16, u16)) -> Self {
        Self { path, row }
    }
}

impl From<LocationPair> for (u16, u16) {
    fn from(pair: LocationPair) -> Self {
        (pair.path, pair.row)
    }
}

impl fmt::Display for LocationPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}/{:03}", self.path, self.row)
    }
}

/// Inclusive acquisition date window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    /// The `days` long window ending at `end`.
    pub fn lookback(end: NaiveDate, days: u32) -> Self {
        let start = end
            .checked_sub_days(chrono::Days::new(days as u64))
            .unwrap_or(NaiveDate::MIN);
        Self { start, end }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

/// Scene attribute used to rank search candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderBy {
    #[default]
    #[serde(alias = "acquisitiondate")]
    AcquisitionDate,
    #[serde(alias = "cloudCover")]
    CloudCover,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderDirection {
    #[default]
    #[serde(alias = "asc", alias = "ASC")]
    Ascending,
    #[serde(alias = "desc", alias = "DESC")]
    Descending,
}

/// Where the artifacts of an area end up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLocations {
    /// Local directory for downloaded and processed scene assets.
    pub download_dir: Utf8PathBuf,
    /// Local directory receiving the packaged product.
    pub output_dir: Utf8PathBuf,
    /// Remote directory the processed bands are uploaded to.
    pub remote_dir: Utf8PathBuf,
    /// Directory the published band coverages are served from, referenced by
    /// the product metadata document.
    pub metadata_base_dir: Utf8PathBuf,
}

impl OutputLocations {
    /// Conventional layout under `base` for the area called `name`.
    pub fn under(base: &Utf8Path, name: &str) -> Self {
        Self {
            download_dir: base.join("download").join(name),
            output_dir: base.join("repository").join(name),
            remote_dir: base.join("upload").join(name),
            metadata_base_dir: base.join("coverages").join(name),
        }
    }
}

/// One ingestion target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AreaConfig {
    pub name: String,
    pub location_pairs: BTreeSet<LocationPair>,
    /// Processed in this order; each band gets its own independent chain.
    pub bands: Vec<u8>,
    pub cloud_coverage_max: f64,
    pub date_range: DateRange,
    pub order_by: OrderBy,
    pub order_direction: OrderDirection,
    pub download_max: usize,
    pub output: OutputLocations,
}

impl AreaConfig {
    /// Creates an area with the default search policy: cloud coverage up to
    /// 90.9%, oldest acquisition first, a single scene.
    pub fn new(
        name: impl Into<String>,
        location_pairs: impl IntoIterator<Item = (u16, u16)>,
        bands: impl IntoIterator<Item = u8>,
        date_range: DateRange,
    ) -> Self {
        let name = name.into();
        let output = OutputLocations::under(Utf8Path::new("data"), &name);

        Self {
            location_pairs: location_pairs.into_iter().map(LocationPair::from).collect(),
            bands: bands.into_iter().collect(),
            cloud_coverage_max: 90.9,
            date_range,
            order_by: OrderBy::default(),
            order_direction: OrderDirection::default(),
            download_max: 1,
            output,
            name,
        }
    }

    pub fn with_cloud_coverage_max(mut self, value: f64) -> Self {
        self.cloud_coverage_max = value;
        self
    }

    pub fn with_order(mut self, order_by: OrderBy, direction: OrderDirection) -> Self {
        self.order_by = order_by;
        self.order_direction = direction;
        self
    }

    pub fn with_download_max(mut self, value: usize) -> Self {
        self.download_max = value;
        self
    }

    pub fn with_bands(mut self, bands: impl IntoIterator<Item = u8>) -> Self {
        self.bands = bands.into_iter().collect();
        self
    }

    pub fn with_output(mut self, output: OutputLocations) -> Self {
        self.output = output;
        self
    }

    /// Checks every invariant of the area. Called by the graph builder before
    /// any node is created.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::EmptyName);
        }

        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(ConfigError::InvalidName(self.name.clone()));
        }

        if self.bands.is_empty() {
            return Err(ConfigError::NoBands(self.name.clone()));
        }

        let mut seen = HashSet::new();
        for &band in &self.bands {
            if band == 0 {
                return Err(ConfigError::InvalidBand {
                    area: self.name.clone(),
                    band,
                });
            }
            if !seen.insert(band) {
                return Err(ConfigError::DuplicateBand {
                    area: self.name.clone(),
                    band,
                });
            }
        }

        if self.location_pairs.is_empty() {
            return Err(ConfigError::NoLocations(self.name.clone()));
        }

        if let Some(pair) = self.location_pairs.iter().find(|pair| !pair.is_valid()) {
            return Err(ConfigError::InvalidLocation {
                area: self.name.clone(),
                path: pair.path,
                row: pair.row,
            });
        }

        if self.download_max < 1 {
            return Err(ConfigError::InvalidDownloadMax(self.name.clone()));
        }

        if !(0.0..=100.0).contains(&self.cloud_coverage_max) {
            return Err(ConfigError::InvalidCloudCoverage {
                area: self.name.clone(),
                value: self.cloud_coverage_max,
            });
        }

        if self.date_range.start > self.date_range.end {
            return Err(ConfigError::InvalidDateRange {
                area: self.name.clone(),
                start: self.date_range.start,
                end: self.date_range.end,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range() -> DateRange {
        DateRange::new(
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 4, 10).unwrap(),
        )
    }

    fn area() -> AreaConfig {
        AreaConfig::new("B1_B11", [(37, 17), (38, 18), (39, 19)], 1..=11, range())
    }

    #[test]
    fn test_valid_area() {
        assert!(area().validate().is_ok());
    }

    #[test]
    fn test_rejects_empty_bands() {
        let area = area().with_bands([]);
        assert!(matches!(area.validate(), Err(ConfigError::NoBands(_))));
    }

    #[test]
    fn test_rejects_duplicate_band() {
        let area = area().with_bands([1, 2, 1]);
        assert!(matches!(
            area.validate(),
            Err(ConfigError::DuplicateBand { band: 1, .. })
        ));
    }

    #[test]
    fn test_rejects_band_zero() {
        let area = area().with_bands([0, 1]);
        assert!(matches!(
            area.validate(),
            Err(ConfigError::InvalidBand { band: 0, .. })
        ));
    }

    #[test]
    fn test_rejects_missing_locations() {
        let area = AreaConfig::new("empty", Vec::<(u16, u16)>::new(), [1], range());
        assert!(matches!(area.validate(), Err(ConfigError::NoLocations(_))));
    }

    #[test]
    fn test_rejects_invalid_location() {
        let area = AreaConfig::new("far", [(0, 17)], [1], range());
        assert!(matches!(
            area.validate(),
            Err(ConfigError::InvalidLocation { path: 0, row: 17, .. })
        ));

        let area = AreaConfig::new("far", [(37, 249)], [1], range());
        assert!(area.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_download_max() {
        let area = area().with_download_max(0);
        assert!(matches!(
            area.validate(),
            Err(ConfigError::InvalidDownloadMax(_))
        ));
    }

    #[test]
    fn test_rejects_cloud_coverage_out_of_range() {
        let area = area().with_cloud_coverage_max(120.0);
        assert!(matches!(
            area.validate(),
            Err(ConfigError::InvalidCloudCoverage { .. })
        ));
    }

    #[test]
    fn test_rejects_inverted_dates() {
        let mut area = area();
        area.date_range = DateRange::new(range().end, range().start);
        assert!(matches!(
            area.validate(),
            Err(ConfigError::InvalidDateRange { .. })
        ));
    }

    #[test]
    fn test_rejects_odd_name() {
        let area = AreaConfig::new("a b", [(37, 17)], [1], range());
        assert!(matches!(area.validate(), Err(ConfigError::InvalidName(_))));
    }

    #[test]
    fn test_lookback() {
        let end = NaiveDate::from_ymd_opt(2024, 4, 10).unwrap();
        let range = DateRange::lookback(end, 100);
        assert_eq!(range.start, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        assert!(range.contains(end));
        assert!(!range.contains(NaiveDate::from_ymd_opt(2023, 12, 31).unwrap()));
    }

    #[test]
    fn test_location_display() {
        assert_eq!(LocationPair::new(37, 7).to_string(), "037/007");
    }
}
