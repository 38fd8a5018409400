//! Layered run settings.
//!
//! Settings come from up to three layers, each overriding the one before:
//! the built-in defaults, a base TOML file and an optional override file.
//! Tables are merged key by key, any other value (arrays included) from a
//! later layer replaces the earlier one outright.
//!
//! ```toml
//! [collection]
//! name = "Landsat8"
//!
//! [search]
//! cloud_coverage = 50.0
//!
//! [run]
//! max_parallel_tasks = 4
//! retries = 2
//! role_retries = { upload_band = 5 }
//!
//! [[area]]
//! name = "daraa"
//! paths_rows = [[173, 37], [174, 37]]
//! bands = [1, 2, 3]
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::area::{AreaConfig, DateRange, LocationPair, OrderBy, OrderDirection, OutputLocations};
use crate::blueprint::plan_workflows;
use crate::error::ConfigError;
use crate::graph::{Graph, Resampling, Role};

/// Complete settings for one ingestion session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub collection: CollectionSettings,
    pub search: SearchDefaults,
    pub processing: ProcessingOptions,
    pub run: RunConfig,
    #[serde(rename = "area")]
    pub areas: Vec<AreaSettings>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionSettings {
    /// Prefix of every workflow name.
    pub name: String,
    /// Root of the default per-area output layout.
    pub base_dir: Utf8PathBuf,
}

impl Default for CollectionSettings {
    fn default() -> Self {
        Self {
            name: "Landsat8".into(),
            base_dir: "data".into(),
        }
    }
}

/// Scene selection policy applied to areas that don't set their own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchDefaults {
    pub cloud_coverage: f64,
    pub order_by: OrderBy,
    pub order_direction: OrderDirection,
    pub download_max: usize,
    /// Length of the search window ending today, used when no explicit
    /// dates are given.
    pub lookback_days: u32,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

impl Default for SearchDefaults {
    fn default() -> Self {
        Self {
            cloud_coverage: 90.9,
            order_by: OrderBy::AcquisitionDate,
            order_direction: OrderDirection::Ascending,
            download_max: 1,
            lookback_days: 100,
            start_date: None,
            end_date: None,
        }
    }
}

/// One `[[area]]` entry. Unset fields fall back to [`SearchDefaults`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AreaSettings {
    pub name: String,
    pub paths_rows: Vec<LocationPair>,
    pub bands: Vec<u8>,
    #[serde(default)]
    pub cloud_coverage: Option<f64>,
    #[serde(default)]
    pub order_by: Option<OrderBy>,
    #[serde(default)]
    pub order_direction: Option<OrderDirection>,
    #[serde(default)]
    pub download_max: Option<usize>,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub output: Option<OutputLocations>,
}

/// Fixed parameters handed to the processing operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingOptions {
    pub thumbnail_fragment: String,
    pub metadata_fragment: String,
    /// Band asset name, `{band}` is replaced by the band number.
    pub band_fragment: String,
    pub thumbnail_width: u32,
    pub thumbnail_height: u32,
    pub resampling: Resampling,
    /// Overviews are built at every power of two up to this level.
    pub max_overview_level: u32,
    pub compress_overview: String,
    pub creation_options: Vec<String>,
    pub warp_srs: Option<String>,
    pub mask: bool,
    pub templates_dir: Utf8PathBuf,
    pub description_template: Utf8PathBuf,
    pub metadata_template: Utf8PathBuf,
}

impl Default for ProcessingOptions {
    fn default() -> Self {
        Self {
            thumbnail_fragment: "thumb_small.jpg".into(),
            metadata_fragment: "MTL.txt".into(),
            band_fragment: "B{band}.TIF".into(),
            thumbnail_width: 64,
            thumbnail_height: 64,
            resampling: Resampling::Average,
            max_overview_level: 128,
            compress_overview: "PACKBITS".into(),
            creation_options: ["TILED=YES", "BLOCKXSIZE=512", "BLOCKYSIZE=512", "COMPRESS=DEFLATE"]
                .map(String::from)
                .to_vec(),
            warp_srs: None,
            mask: false,
            templates_dir: "templates".into(),
            description_template: "product_abstract.html".into(),
            metadata_template: "metadata.xml".into(),
        }
    }
}

impl ProcessingOptions {
    pub fn band_fragment(&self, band: u8) -> String {
        self.band_fragment.replace("{band}", &band.to_string())
    }

    /// `2, 4, 8, ...` up to `max_overview_level`.
    pub fn overview_scales(&self) -> Vec<u32> {
        std::iter::successors(Some(2_u32), |level| level.checked_mul(2))
            .take_while(|&level| level <= self.max_overview_level)
            .collect()
    }
}

/// Scheduler knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Worker pool size, `0` picks the available parallelism.
    pub max_parallel_tasks: usize,
    /// Extra attempts after a transient failure.
    pub retries: u32,
    /// Per-role override of `retries`, keyed by role name (`upload_band`).
    pub role_retries: BTreeMap<String, u32>,
    #[serde(with = "seconds")]
    pub retry_delay: Duration,
    #[serde(with = "seconds")]
    pub timeout: Duration,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_parallel_tasks: 0,
            retries: 1,
            role_retries: BTreeMap::new(),
            retry_delay: Duration::ZERO,
            timeout: Duration::from_secs(3600),
        }
    }
}

impl RunConfig {
    pub fn with_max_parallel_tasks(mut self, value: usize) -> Self {
        self.max_parallel_tasks = value;
        self
    }

    pub fn with_retries(mut self, value: u32) -> Self {
        self.retries = value;
        self
    }

    pub fn with_role_retries(mut self, role: Role, value: u32) -> Self {
        self.role_retries.insert(role.slug().to_string(), value);
        self
    }

    pub fn with_retry_delay(mut self, value: Duration) -> Self {
        self.retry_delay = value;
        self
    }

    pub fn with_timeout(mut self, value: Duration) -> Self {
        self.timeout = value;
        self
    }

    pub fn retries_for(&self, role: Role) -> u32 {
        self.role_retries
            .get(role.slug())
            .copied()
            .unwrap_or(self.retries)
    }

    /// Number of worker threads to run operators on.
    pub fn workers(&self) -> usize {
        match self.max_parallel_tasks {
            0 => std::thread::available_parallelism().map_or(1, |n| n.get()),
            n => n,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.role_retries.keys().find(|key| Role::from_slug(key).is_none()) {
            Some(key) => Err(ConfigError::UnknownRole(key.clone())),
            None => Ok(()),
        }
    }
}

/// (De)serializes a [`Duration`] as fractional seconds.
mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

impl Settings {
    /// Defaults overlaid with a single TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        Self::layered([toml::from_str::<toml::Table>(source)?])
    }

    /// Defaults, then `base`, then `overrides` if given.
    pub fn load(base: &Utf8Path, overrides: Option<&Utf8Path>) -> Result<Self, ConfigError> {
        let mut layers = vec![read_layer(base)?];
        if let Some(path) = overrides {
            layers.push(read_layer(path)?);
        }
        Self::layered(layers)
    }

    /// Merges `layers` over the defaults, in order.
    pub fn layered(layers: impl IntoIterator<Item = toml::Table>) -> Result<Self, ConfigError> {
        let mut merged = toml::Table::try_from(Settings::default())?;
        for layer in layers {
            merge(&mut merged, layer);
        }

        let settings: Settings = merged.try_into()?;
        settings.run.validate()?;
        Ok(settings)
    }

    /// Resolves every `[[area]]` against the search defaults. Areas without
    /// explicit dates search the `lookback_days` window ending at `today`.
    pub fn areas(&self, today: NaiveDate) -> Result<Vec<AreaConfig>, ConfigError> {
        self.areas
            .iter()
            .map(|entry| {
                let search = &self.search;
                let end = entry.end_date.or(search.end_date).unwrap_or(today);
                let range = match entry.start_date.or(search.start_date) {
                    Some(start) => DateRange::new(start, end),
                    None => DateRange::lookback(end, search.lookback_days),
                };

                let output = entry
                    .output
                    .clone()
                    .unwrap_or_else(|| OutputLocations::under(&self.collection.base_dir, &entry.name));

                let area = AreaConfig::new(
                    entry.name.clone(),
                    entry.paths_rows.iter().copied().map(<(u16, u16)>::from),
                    entry.bands.iter().copied(),
                    range,
                )
                .with_cloud_coverage_max(entry.cloud_coverage.unwrap_or(search.cloud_coverage))
                .with_order(
                    entry.order_by.unwrap_or(search.order_by),
                    entry.order_direction.unwrap_or(search.order_direction),
                )
                .with_download_max(entry.download_max.unwrap_or(search.download_max))
                .with_output(output);

                area.validate()?;
                Ok(area)
            })
            .collect()
    }

    /// Plans the workflow of every configured area.
    pub fn workflows(&self, today: NaiveDate) -> Result<Vec<(String, Graph)>, ConfigError> {
        plan_workflows(&self.collection.name, &self.areas(today)?, &self.processing)
    }
}

fn read_layer(path: &Utf8Path) -> Result<toml::Table, ConfigError> {
    let source = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&source)?)
}

fn merge(base: &mut toml::Table, layer: toml::Table) {
    for (key, value) in layer {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(into)), toml::Value::Table(from)) => merge(into, from),
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}
