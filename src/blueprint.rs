//! Turns an area into its task graph.
//!
//! The shape is fixed: one search, the scene-level side tasks, one
//! fetch-translate-overviews-upload chain per band, a join barrier over the
//! uploads and the assembly tasks after it.
//!
//! ```text
//! search ─┬─ download_thumbnail ── generate_thumbnail ────────────────┐
//!         ├─ download_metadata ───────────────────────┐               │
//!         ├─ generate_html_description ───────────────┼───────────────┤
//!         └─ download_band{b} ─ ... ─ upload_band{b} ─ join ─┬─ generate_metadata ─ product_zip
//!                                                            └─ inspect
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use crate::area::AreaConfig;
use crate::config::ProcessingOptions;
use crate::error::ConfigError;
use crate::graph::{Binding, Graph, Role, TaskId, TaskNode, TaskParams};

/// Accumulates nodes for one area in dependency order.
struct Blueprint<'a> {
    area: &'a AreaConfig,
    nodes: Vec<TaskNode>,
}

impl<'a> Blueprint<'a> {
    fn new(area: &'a AreaConfig) -> Self {
        Self {
            area,
            nodes: Vec::new(),
        }
    }

    fn node(&self, role: Role, band: Option<u8>) -> TaskNode {
        TaskNode::new(&self.area.name, role, band)
    }

    fn add(&mut self, node: TaskNode) -> TaskId {
        let id = node.id();
        self.nodes.push(node);
        id
    }

    fn finish(self) -> Result<Graph, ConfigError> {
        Ok(Graph::from_nodes(Arc::new(self.area.clone()), self.nodes)?)
    }
}

/// Builds the task graph of `area`.
///
/// Deterministic: equal areas and options always produce the same node ids
/// and edges. The area is validated first, so an invalid one never yields a
/// partial graph.
pub fn build(area: &AreaConfig, processing: &ProcessingOptions) -> Result<Graph, ConfigError> {
    area.validate()?;

    let output = &area.output;
    let mut bp = Blueprint::new(area);

    let search = bp.add(bp.node(Role::Search, None));

    let fetch_thumbnail = bp.add(
        bp.node(Role::FetchThumbnail, None)
            .after([search])
            .bind("scenes", Binding::One(search))
            .with_params(TaskParams::Download {
                url_fragment: processing.thumbnail_fragment.clone(),
                destination: output.download_dir.clone(),
            }),
    );

    let render_thumbnail = bp.add(
        bp.node(Role::RenderThumbnail, None)
            .after([fetch_thumbnail])
            .bind("thumbnail", Binding::One(fetch_thumbnail))
            .with_params(TaskParams::Thumbnail {
                width: processing.thumbnail_width,
                height: processing.thumbnail_height,
            }),
    );

    let fetch_metadata = bp.add(
        bp.node(Role::FetchMetadata, None)
            .after([search])
            .bind("scenes", Binding::One(search))
            .with_params(TaskParams::Download {
                url_fragment: processing.metadata_fragment.clone(),
                destination: output.download_dir.clone(),
            }),
    );

    let render_description = bp.add(
        bp.node(Role::RenderDescription, None)
            .after([search])
            .bind("scenes", Binding::One(search))
            .with_params(TaskParams::Template {
                template: processing.templates_dir.join(&processing.description_template),
                destination: output.download_dir.join("description.html"),
            }),
    );

    let mut overviews = Vec::with_capacity(area.bands.len());
    let mut uploads = Vec::with_capacity(area.bands.len());

    for &band in &area.bands {
        let fetch = bp.add(
            bp.node(Role::FetchBand, Some(band))
                .after([search])
                .bind("scenes", Binding::One(search))
                .with_params(TaskParams::Download {
                    url_fragment: processing.band_fragment(band),
                    destination: output.download_dir.clone(),
                }),
        );

        let translate = bp.add(
            bp.node(Role::TranslateBand, Some(band))
                .after([fetch])
                .bind("source", Binding::One(fetch))
                .with_params(TaskParams::Translate {
                    creation_options: processing.creation_options.clone(),
                    warp_srs: processing.warp_srs.clone(),
                    mask: processing.mask,
                }),
        );

        let overview = bp.add(
            bp.node(Role::AddOverviews, Some(band))
                .after([translate])
                .bind("source", Binding::One(translate))
                .with_params(TaskParams::Overviews {
                    resampling: processing.resampling,
                    scales: processing.overview_scales(),
                    compress: processing.compress_overview.clone(),
                }),
        );

        let upload = bp.add(
            bp.node(Role::UploadBand, Some(band))
                .after([overview])
                .bind("source", Binding::One(overview))
                .with_params(TaskParams::Upload {
                    remote_dir: output.remote_dir.clone(),
                }),
        );

        overviews.push(overview);
        uploads.push(upload);
    }

    let join = bp.add(bp.node(Role::Join, None).after(uploads.iter().copied()));

    bp.add(
        bp.node(Role::Inspect, None)
            .after([join])
            .bind("overviews", Binding::Many(overviews)),
    );

    let assemble = bp.add(
        bp.node(Role::AssembleMetadata, None)
            .after([fetch_metadata, join])
            .bind("metadata", Binding::One(fetch_metadata))
            .bind("uploads", Binding::Many(uploads))
            .with_params(TaskParams::Metadata {
                template: processing.templates_dir.join(&processing.metadata_template),
                destination: output.download_dir.join("metadata.xml"),
                coverage_base_dir: output.metadata_base_dir.clone(),
            }),
    );

    bp.add(
        bp.node(Role::Package, None)
            .after([assemble, render_description, render_thumbnail])
            .bind("metadata", Binding::One(assemble))
            .bind("description", Binding::One(render_description))
            .bind("thumbnail", Binding::One(render_thumbnail))
            .with_params(TaskParams::Package {
                output_dir: output.output_dir.clone(),
            }),
    );

    let graph = bp.finish()?;
    tracing::debug!(area = %area.name, nodes = graph.len(), "planned task graph");

    Ok(graph)
}

/// Plans one workflow per area, named `{collection}_{area}`.
///
/// The caller owns the returned list; nothing is registered globally. Two
/// areas mapping to the same workflow name are rejected.
pub fn plan_workflows(
    collection: &str,
    areas: &[AreaConfig],
    processing: &ProcessingOptions,
) -> Result<Vec<(String, Graph)>, ConfigError> {
    let mut seen = HashSet::new();
    let mut workflows = Vec::with_capacity(areas.len());

    for area in areas {
        let name = format!("{collection}_{}", area.name);
        if !seen.insert(name.clone()) {
            return Err(ConfigError::DuplicateWorkflow(name));
        }

        workflows.push((name, build(area, processing)?));
    }

    Ok(workflows)
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::area::DateRange;
    use crate::graph::TaskKind;

    fn range() -> DateRange {
        DateRange::new(
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 4, 10).unwrap(),
        )
    }

    fn area(bands: impl IntoIterator<Item = u8>) -> AreaConfig {
        AreaConfig::new("daraa", [(173, 37), (174, 37)], bands, range())
    }

    fn count(graph: &Graph, role: Role) -> usize {
        graph.by_role(role).count()
    }

    #[test]
    fn test_one_chain_per_band() {
        for bands in [vec![1], vec![1, 2, 3], (1..=11).collect()] {
            let b = bands.len();
            let graph = build(&area(bands), &ProcessingOptions::default()).unwrap();

            assert_eq!(count(&graph, Role::FetchBand), b);
            assert_eq!(count(&graph, Role::TranslateBand), b);
            assert_eq!(count(&graph, Role::AddOverviews), b);
            assert_eq!(count(&graph, Role::UploadBand), b);
            assert_eq!(count(&graph, Role::Join), 1);

            let join = graph.find(Role::Join, None).unwrap();
            assert_eq!(join.upstream().len(), b);
            assert!(join
                .upstream()
                .iter()
                .all(|id| graph.node(*id).unwrap().role() == Role::UploadBand));

            // search, 4 side tasks, join, inspect, metadata, package
            assert_eq!(graph.len(), 9 + 4 * b);
        }
    }

    #[test]
    fn test_chain_wiring() {
        let graph = build(&area([4]), &ProcessingOptions::default()).unwrap();
        let id = |role| graph.find(role, Some(4)).unwrap().id();

        let edges = graph.edges();
        assert!(edges.contains(&(graph.entry(), id(Role::FetchBand))));
        assert!(edges.contains(&(id(Role::FetchBand), id(Role::TranslateBand))));
        assert!(edges.contains(&(id(Role::TranslateBand), id(Role::AddOverviews))));
        assert!(edges.contains(&(id(Role::AddOverviews), id(Role::UploadBand))));
    }

    #[test]
    fn test_build_is_deterministic() {
        let a = build(&area([1, 2, 3]), &ProcessingOptions::default()).unwrap();
        let b = build(&area([1, 2, 3]), &ProcessingOptions::default()).unwrap();

        assert_eq!(a.ids(), b.ids());
        assert_eq!(a.edges(), b.edges());
        assert_eq!(a.to_string(), b.to_string());
    }

    #[test]
    fn test_removing_band_drops_its_chain() {
        let full = build(&area([1, 2, 3]), &ProcessingOptions::default()).unwrap();
        let less = build(&area([1, 2]), &ProcessingOptions::default()).unwrap();

        let removed: Vec<_> = full.ids().difference(&less.ids()).copied().collect();
        assert_eq!(removed.len(), 4);
        assert!(removed
            .iter()
            .all(|id| full.node(*id).unwrap().band() == Some(3)));
        assert!(less.ids().is_subset(&full.ids()));

        assert_eq!(full.find(Role::Join, None).unwrap().upstream().len(), 3);
        assert_eq!(less.find(Role::Join, None).unwrap().upstream().len(), 2);
    }

    #[test]
    fn test_assembly_bindings() {
        let graph = build(&area([2, 1]), &ProcessingOptions::default()).unwrap();
        let assemble = graph.find(Role::AssembleMetadata, None).unwrap();

        let uploads: Vec<_> = [2, 1]
            .into_iter()
            .map(|band| graph.find(Role::UploadBand, Some(band)).unwrap().id())
            .collect();
        assert_eq!(assemble.bindings()["uploads"], Binding::Many(uploads));

        let package = graph.find(Role::Package, None).unwrap();
        assert_eq!(package.kind(), TaskKind::Assemble);
        assert!(package.is_bound_to(assemble.id()));
        assert!(!package.is_bound_to(graph.find(Role::Inspect, None).unwrap().id()));
    }

    #[test]
    fn test_inspect_reads_overviews() {
        let graph = build(&area([1, 2]), &ProcessingOptions::default()).unwrap();
        let inspect = graph.find(Role::Inspect, None).unwrap();
        let join = graph.find(Role::Join, None).unwrap();

        assert_eq!(inspect.upstream(), &[join.id()]);
        assert_eq!(inspect.bindings()["overviews"].producers().len(), 2);
        assert!(graph.downstream(inspect.id()).is_empty());
    }

    #[test]
    fn test_band_params() {
        let graph = build(&area([8]), &ProcessingOptions::default()).unwrap();

        match graph.find(Role::FetchBand, Some(8)).unwrap().params() {
            TaskParams::Download { url_fragment, .. } => assert_eq!(url_fragment, "B8.TIF"),
            other => panic!("unexpected params {other:?}"),
        }

        match graph.find(Role::AddOverviews, Some(8)).unwrap().params() {
            TaskParams::Overviews { scales, compress, .. } => {
                assert_eq!(scales, &[2, 4, 8, 16, 32, 64, 128]);
                assert_eq!(compress, "PACKBITS");
            }
            other => panic!("unexpected params {other:?}"),
        }
    }

    #[test]
    fn test_invalid_area_yields_no_graph() {
        let err = build(&area([]), &ProcessingOptions::default()).unwrap_err();
        assert!(matches!(err, ConfigError::NoBands(_)));
    }

    #[test]
    fn test_plan_workflows_names() {
        let areas = [area([1]), AreaConfig::new("homs", [(174, 36)], [1, 2], range())];
        let workflows = plan_workflows("Landsat8", &areas, &ProcessingOptions::default()).unwrap();

        let names: Vec<_> = workflows.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, ["Landsat8_daraa", "Landsat8_homs"]);
    }

    #[test]
    fn test_plan_workflows_rejects_duplicates() {
        let areas = [area([1]), area([2])];
        let err = plan_workflows("Landsat8", &areas, &ProcessingOptions::default()).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateWorkflow(name) if name == "Landsat8_daraa"));
    }
}
