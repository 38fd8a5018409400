//! Template-backed operators for the description and metadata documents.

use std::fs;

use anyhow::Context as _;
use camino::{Utf8Path, Utf8PathBuf};
use minijinja::{Environment, Value, context};

use crate::error::OperatorError;
use crate::graph::TaskParams;
use crate::operator::{Inputs, OperatorContext, TypedOperator};
use crate::scene::SceneRecord;

/// Renders the node's template into its destination file and returns the
/// path written.
///
/// The template and destination come from the node's parameters; `context`
/// turns the node's inputs into the template context.
pub struct TemplateOperator<F> {
    context: F,
}

impl<F> TemplateOperator<F>
where
    F: Fn(&Inputs, &OperatorContext<'_>) -> Result<Value, OperatorError> + Send + Sync,
{
    pub fn new(context: F) -> Self {
        Self { context }
    }
}

impl<F> TypedOperator for TemplateOperator<F>
where
    F: Fn(&Inputs, &OperatorContext<'_>) -> Result<Value, OperatorError> + Send + Sync,
{
    type Output = Utf8PathBuf;

    fn execute(&self, inputs: &Inputs, ctx: &OperatorContext<'_>) -> Result<Utf8PathBuf, OperatorError> {
        ctx.check_cancelled()?;

        let (template, destination) = match ctx.params() {
            TaskParams::Template { template, destination }
            | TaskParams::Metadata { template, destination, .. } => (template, destination),
            _ => {
                return Err(OperatorError::fatal(anyhow::anyhow!(
                    "task '{}' has no template parameters",
                    ctx.task.name()
                )));
            }
        };

        let source = fs::read_to_string(template)
            .with_context(|| format!("couldn't read template {template}"))
            .map_err(OperatorError::Fatal)?;

        let value = (self.context)(inputs, ctx)?;
        let rendered = Environment::new()
            .render_str(&source, value)
            .with_context(|| format!("couldn't render template {template}"))
            .map_err(OperatorError::Fatal)?;

        write(destination, &rendered).map_err(OperatorError::Transient)?;
        tracing::debug!(task = %ctx.task.name(), path = %destination, "rendered template");

        Ok(destination.clone())
    }
}

fn write(path: &Utf8Path, content: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("couldn't create {parent}"))?;
    }
    fs::write(path, content).with_context(|| format!("couldn't write {path}"))?;
    Ok(())
}

/// Context for the HTML description: the area and the selected scenes.
pub fn description_context(inputs: &Inputs, ctx: &OperatorContext<'_>) -> Result<Value, OperatorError> {
    let scenes = inputs.one::<Vec<SceneRecord>>("scenes")?;
    let area = ctx.area;

    let locations: Vec<String> = area.location_pairs.iter().map(ToString::to_string).collect();

    Ok(context! {
        area => &area.name,
        bands => &area.bands,
        locations => &locations,
        scenes => scenes,
    })
}

/// Context for the product metadata document.
///
/// Expects the metadata fetch to produce the local metadata file and each
/// upload the uploaded file, both as [`Utf8PathBuf`]. Coverages are listed
/// under the node's coverage directory, by file name.
pub fn metadata_context(inputs: &Inputs, ctx: &OperatorContext<'_>) -> Result<Value, OperatorError> {
    let metadata = inputs.one::<Utf8PathBuf>("metadata")?;
    let uploads = inputs.many::<Utf8PathBuf>("uploads")?;

    let base = match ctx.params() {
        TaskParams::Metadata { coverage_base_dir, .. } => coverage_base_dir.as_path(),
        _ => Utf8Path::new(""),
    };

    let coverages: Vec<String> = uploads
        .iter()
        .filter_map(|path| path.file_name())
        .map(|name| base.join(name).into_string())
        .collect();

    Ok(context! {
        area => &ctx.area.name,
        metadata => metadata.as_str(),
        coverages => &coverages,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::NaiveDate;

    use super::*;
    use crate::area::{AreaConfig, DateRange, OutputLocations};
    use crate::core::Dynamic;
    use crate::blueprint::build;
    use crate::config::ProcessingOptions;
    use crate::graph::{Graph, Role};
    use crate::operator::Resolved;
    use crate::scheduler::CancelToken;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: Utf8PathBuf,
        graph: Graph,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();

        fs::create_dir_all(root.join("templates")).unwrap();
        fs::write(
            root.join("templates/product_abstract.html"),
            "<h1>{{ area }}</h1>{% for s in scenes %}<p>{{ s.scene_id }} {{ s.cloud_cover_percent }}%</p>{% endfor %}",
        )
        .unwrap();
        fs::write(
            root.join("templates/metadata.xml"),
            "<product area=\"{{ area }}\" source=\"{{ metadata }}\">{% for c in coverages %}<coverage>{{ c }}</coverage>{% endfor %}</product>",
        )
        .unwrap();

        let processing = ProcessingOptions {
            templates_dir: root.join("templates"),
            ..ProcessingOptions::default()
        };
        let area = AreaConfig::new(
            "daraa",
            [(173, 37)],
            [4],
            DateRange::new(
                NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(2024, 4, 10).unwrap(),
            ),
        )
        .with_output(OutputLocations::under(&root, "daraa"));

        let graph = build(&area, &processing).unwrap();

        Fixture {
            _dir: dir,
            root,
            graph,
        }
    }

    #[test]
    fn test_renders_description() {
        let fx = fixture();
        let node = fx.graph.find(Role::RenderDescription, None).unwrap();

        let mut inputs = Inputs::default();
        inputs.insert(
            "scenes",
            Resolved::One(Arc::new(vec![SceneRecord {
                scene_id: "LC08_A".into(),
                acquisition_date: NaiveDate::from_ymd_opt(2024, 1, 20).unwrap(),
                cloud_cover_percent: 12.5,
                asset_base_url: "https://landsat.example/LC08_A".into(),
                path: 173,
                row: 37,
            }])),
        );

        let cancel = CancelToken::new();
        let ctx = OperatorContext {
            task: node,
            area: fx.graph.area(),
            attempt: 1,
            cancel: &cancel,
        };

        let path = TemplateOperator::new(description_context)
            .execute(&inputs, &ctx)
            .unwrap();

        assert_eq!(path, fx.root.join("download/daraa/description.html"));
        let html = fs::read_to_string(&path).unwrap();
        assert_eq!(html, "<h1>daraa</h1><p>LC08_A 12.5%</p>");
    }

    #[test]
    fn test_renders_metadata() {
        let fx = fixture();
        let node = fx.graph.find(Role::AssembleMetadata, None).unwrap();

        let mut inputs = Inputs::default();
        inputs.insert("metadata", Resolved::One(Arc::new(Utf8PathBuf::from("/tmp/MTL.txt"))));
        inputs.insert(
            "uploads",
            Resolved::Many(vec![Arc::new(Utf8PathBuf::from("/remote/LC08_A_B4.TIF")) as Dynamic]),
        );

        let cancel = CancelToken::new();
        let ctx = OperatorContext {
            task: node,
            area: fx.graph.area(),
            attempt: 1,
            cancel: &cancel,
        };

        let path = TemplateOperator::new(metadata_context)
            .execute(&inputs, &ctx)
            .unwrap();

        let xml = fs::read_to_string(path).unwrap();
        let coverage = fx.root.join("coverages/daraa/LC08_A_B4.TIF");
        assert_eq!(
            xml,
            format!(
                "<product area=\"daraa\" source=\"/tmp/MTL.txt\"><coverage>{coverage}</coverage></product>"
            )
        );
    }

    #[test]
    fn test_missing_template_is_fatal() {
        let fx = fixture();
        fs::remove_file(fx.root.join("templates/product_abstract.html")).unwrap();
        let node = fx.graph.find(Role::RenderDescription, None).unwrap();

        let mut inputs = Inputs::default();
        inputs.insert("scenes", Resolved::One(Arc::new(Vec::<SceneRecord>::new())));

        let cancel = CancelToken::new();
        let ctx = OperatorContext {
            task: node,
            area: fx.graph.area(),
            attempt: 1,
            cancel: &cancel,
        };

        let err = TemplateOperator::new(description_context)
            .execute(&inputs, &ctx)
            .unwrap_err();
        assert!(matches!(err, OperatorError::Fatal(_)));
    }

    #[test]
    fn test_wrong_params_are_fatal() {
        let fx = fixture();
        let node = fx.graph.find(Role::Package, None).unwrap();
        let cancel = CancelToken::new();
        let ctx = OperatorContext {
            task: node,
            area: fx.graph.area(),
            attempt: 1,
            cancel: &cancel,
        };

        let err = TemplateOperator::new(description_context)
            .execute(&Inputs::default(), &ctx)
            .unwrap_err();
        assert!(matches!(err, OperatorError::Fatal(_)));
    }
}
