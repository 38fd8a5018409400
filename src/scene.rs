//! Scene search: candidates in, the scenes worth processing out.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashSet};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::area::{AreaConfig, DateRange, LocationPair, OrderBy, OrderDirection};
use crate::error::OperatorError;
use crate::operator::{Inputs, OperatorContext, TypedOperator};

/// One catalog entry, the unit every download task works from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneRecord {
    pub scene_id: String,
    pub acquisition_date: NaiveDate,
    pub cloud_cover_percent: f64,
    /// Directory URL holding the scene's assets.
    pub asset_base_url: String,
    pub path: u16,
    pub row: u16,
}

impl SceneRecord {
    pub fn location(&self) -> LocationPair {
        LocationPair::new(self.path, self.row)
    }

    /// Full URL of one asset, e.g. `B4.TIF` or `MTL.txt`.
    pub fn asset_url(&self, fragment: &str) -> String {
        format!(
            "{}/{}_{}",
            self.asset_base_url.trim_end_matches('/'),
            self.scene_id,
            fragment
        )
    }
}

/// Applies the area's selection policy to raw catalog candidates.
///
/// Keeps scenes within the cloud threshold, the date range and the area's
/// path/row pairs, orders them by the configured attribute with the scene id
/// as tie-break, and returns at most `download_max` of them. Candidates
/// reported twice are only considered once.
pub fn select_scenes(
    candidates: impl IntoIterator<Item = SceneRecord>,
    area: &AreaConfig,
) -> Vec<SceneRecord> {
    let mut seen = HashSet::new();

    let mut scenes: Vec<SceneRecord> = candidates
        .into_iter()
        .filter(|scene| scene.cloud_cover_percent <= area.cloud_coverage_max)
        .filter(|scene| area.date_range.contains(scene.acquisition_date))
        .filter(|scene| area.location_pairs.contains(&scene.location()))
        .filter(|scene| seen.insert(scene.scene_id.clone()))
        .collect();

    scenes.sort_by(|a, b| {
        let order = match area.order_by {
            OrderBy::AcquisitionDate => a.acquisition_date.cmp(&b.acquisition_date),
            OrderBy::CloudCover => a.cloud_cover_percent.total_cmp(&b.cloud_cover_percent),
        };

        let order = match area.order_direction {
            OrderDirection::Ascending => order,
            OrderDirection::Descending => order.reverse(),
        };

        match order {
            Ordering::Equal => a.scene_id.cmp(&b.scene_id),
            order => order,
        }
    });

    scenes.truncate(area.download_max);
    scenes
}

/// A source of scene candidates, such as a metadata database or a STAC API.
pub trait Catalog: Send + Sync {
    fn candidates(
        &self,
        locations: &BTreeSet<LocationPair>,
        range: &DateRange,
    ) -> anyhow::Result<Vec<SceneRecord>>;
}

/// Search operator: queries a [`Catalog`] and applies [`select_scenes`].
///
/// Catalog failures are treated as transient.
pub struct CatalogSearch<C> {
    catalog: C,
}

impl<C: Catalog> CatalogSearch<C> {
    pub fn new(catalog: C) -> Self {
        Self { catalog }
    }
}

impl<C: Catalog> TypedOperator for CatalogSearch<C> {
    type Output = Vec<SceneRecord>;

    fn execute(&self, _: &Inputs, ctx: &OperatorContext<'_>) -> Result<Self::Output, OperatorError> {
        ctx.check_cancelled()?;

        let area = ctx.area;
        let candidates = self
            .catalog
            .candidates(&area.location_pairs, &area.date_range)
            .map_err(OperatorError::Transient)?;

        let found = candidates.len();
        let scenes = select_scenes(candidates, area);

        tracing::info!(
            area = %area.name,
            candidates = found,
            selected = scenes.len(),
            "scene search finished"
        );

        Ok(scenes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn scene(id: &str, acquired: NaiveDate, cloud: f64) -> SceneRecord {
        SceneRecord {
            scene_id: id.into(),
            acquisition_date: acquired,
            cloud_cover_percent: cloud,
            asset_base_url: format!("https://landsat.example/c1/L8/173/037/{id}/"),
            path: 173,
            row: 37,
        }
    }

    fn area() -> AreaConfig {
        AreaConfig::new(
            "daraa",
            [(173, 37)],
            [1, 2, 3],
            DateRange::new(date(2024, 1, 1), date(2024, 4, 10)),
        )
    }

    fn candidates() -> Vec<SceneRecord> {
        vec![
            scene("LC08_A", date(2024, 3, 1), 10.0),
            scene("LC08_B", date(2024, 1, 5), 95.0),
            scene("LC08_C", date(2024, 2, 1), 50.0),
            scene("LC08_D", date(2024, 1, 20), 90.9),
            scene("LC08_E", date(2024, 4, 1), 20.0),
        ]
    }

    #[test]
    fn test_picks_earliest_survivor() {
        let scenes = select_scenes(candidates(), &area());

        assert_eq!(scenes.len(), 1);
        // B is older but too cloudy, D sits exactly on the threshold
        assert_eq!(scenes[0].scene_id, "LC08_D");
    }

    #[test]
    fn test_respects_download_max_and_direction() {
        let area = area()
            .with_download_max(3)
            .with_order(OrderBy::AcquisitionDate, OrderDirection::Descending);

        let ids: Vec<_> = select_scenes(candidates(), &area)
            .into_iter()
            .map(|s| s.scene_id)
            .collect();
        assert_eq!(ids, ["LC08_E", "LC08_A", "LC08_C"]);
    }

    #[test]
    fn test_orders_by_cloud_cover() {
        let area = area()
            .with_download_max(10)
            .with_order(OrderBy::CloudCover, OrderDirection::Ascending);

        let ids: Vec<_> = select_scenes(candidates(), &area)
            .into_iter()
            .map(|s| s.scene_id)
            .collect();
        assert_eq!(ids, ["LC08_A", "LC08_E", "LC08_C", "LC08_D"]);
    }

    #[test]
    fn test_ties_break_on_scene_id() {
        let area = area().with_download_max(2);
        let same_day = vec![
            scene("LC08_Z", date(2024, 2, 2), 5.0),
            scene("LC08_M", date(2024, 2, 2), 5.0),
        ];

        let ids: Vec<_> = select_scenes(same_day, &area)
            .into_iter()
            .map(|s| s.scene_id)
            .collect();
        assert_eq!(ids, ["LC08_M", "LC08_Z"]);
    }

    #[test]
    fn test_filters_dates_locations_and_duplicates() {
        let area = area().with_download_max(10);
        let mut elsewhere = scene("LC08_X", date(2024, 2, 2), 5.0);
        elsewhere.row = 38;

        let scenes = select_scenes(
            vec![
                scene("LC08_OLD", date(2023, 12, 31), 5.0),
                elsewhere,
                scene("LC08_A", date(2024, 3, 1), 10.0),
                scene("LC08_A", date(2024, 3, 1), 10.0),
            ],
            &area,
        );

        assert_eq!(scenes.len(), 1);
        assert_eq!(scenes[0].scene_id, "LC08_A");
    }

    #[test]
    fn test_nothing_survives() {
        let area = area().with_cloud_coverage_max(1.0);
        assert!(select_scenes(candidates(), &area).is_empty());
    }

    #[test]
    fn test_asset_url() {
        let scene = scene("LC08_A", date(2024, 3, 1), 10.0);
        assert_eq!(
            scene.asset_url("B4.TIF"),
            "https://landsat.example/c1/L8/173/037/LC08_A/LC08_A_B4.TIF"
        );
    }
}
