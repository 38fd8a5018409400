//! The task graph and its nodes.
//!
//! A [`Graph`] is built once per area by the [`blueprint`](crate::blueprint)
//! and never changes afterwards. Nodes are addressed by [`TaskId`], an opaque
//! digest of the area name, the node's role and its band, so the same area
//! always produces the same ids.
//!
//! ## Dependencies and bindings
//!
//! Every node lists its `upstream` nodes, which decide *when* it may run, and
//! its input bindings, which decide *what* it reads. A binding may point past
//! the direct upstreams: `AssembleMetadata` only depends on the join barrier,
//! yet reads every upload result. The graph guarantees that each bound
//! producer is an ancestor of its consumer, so by the time a consumer runs
//! every value it reads has been published.

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use camino::Utf8PathBuf;
use petgraph::algo::{has_path_connecting, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Serialize, Serializer};

use crate::area::AreaConfig;
use crate::core::Hash32;
use crate::error::GraphError;

/// Stable identity of a task node.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(Hash32);

impl TaskId {
    /// Derives the id of the node playing `role` for `band` in `area`.
    pub fn derive(area: &str, role: Role, band: Option<u8>) -> Self {
        let band = band.map(|b| [1, b]).unwrap_or([0, 0]);
        TaskId(Hash32::hash_parts([
            area.as_bytes(),
            role.slug().as_bytes(),
            band.as_slice(),
        ]))
    }

    fn short(&self) -> String {
        let mut hex = self.0.to_hex();
        hex.truncate(12);
        hex
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.short())
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskId({})", self.short())
    }
}

impl Serialize for TaskId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.short())
    }
}

/// Name under which a producer publishes one of its results.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResultKey(Cow<'static, str>);

impl ResultKey {
    /// The key every operator result is published under.
    pub const RESULT: ResultKey = ResultKey(Cow::Borrowed("result"));

    pub fn new(key: impl Into<Cow<'static, str>>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResultKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ResultKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// Coarse node category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Search,
    Fetch,
    Transform,
    Join,
    Assemble,
}

/// The part a node plays in the ingestion workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Search,
    FetchThumbnail,
    RenderThumbnail,
    FetchMetadata,
    RenderDescription,
    FetchBand,
    TranslateBand,
    AddOverviews,
    UploadBand,
    Join,
    Inspect,
    AssembleMetadata,
    Package,
}

impl Role {
    pub const ALL: [Role; 13] = [
        Role::Search,
        Role::FetchThumbnail,
        Role::RenderThumbnail,
        Role::FetchMetadata,
        Role::RenderDescription,
        Role::FetchBand,
        Role::TranslateBand,
        Role::AddOverviews,
        Role::UploadBand,
        Role::Join,
        Role::Inspect,
        Role::AssembleMetadata,
        Role::Package,
    ];

    pub fn kind(&self) -> TaskKind {
        match self {
            Role::Search => TaskKind::Search,
            Role::FetchThumbnail | Role::FetchMetadata | Role::FetchBand => TaskKind::Fetch,
            Role::RenderThumbnail
            | Role::TranslateBand
            | Role::AddOverviews
            | Role::UploadBand
            | Role::Inspect => TaskKind::Transform,
            Role::Join => TaskKind::Join,
            Role::RenderDescription | Role::AssembleMetadata | Role::Package => TaskKind::Assemble,
        }
    }

    /// Stable lowercase name, used for ids, node names and settings keys.
    pub fn slug(&self) -> &'static str {
        match self {
            Role::Search => "search",
            Role::FetchThumbnail => "download_thumbnail",
            Role::RenderThumbnail => "generate_thumbnail",
            Role::FetchMetadata => "download_metadata",
            Role::RenderDescription => "generate_html_description",
            Role::FetchBand => "download_band",
            Role::TranslateBand => "translate_band",
            Role::AddOverviews => "add_overviews_band",
            Role::UploadBand => "upload_band",
            Role::Join => "join",
            Role::Inspect => "inspect",
            Role::AssembleMetadata => "generate_metadata",
            Role::Package => "product_zip",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Role> {
        Role::ALL.into_iter().find(|role| role.slug() == slug)
    }
}

/// Which upstream results a node reads under a given input name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    One(TaskId),
    /// Several producers, read back as a list in this order.
    Many(Vec<TaskId>),
}

impl Binding {
    pub fn producers(&self) -> &[TaskId] {
        match self {
            Binding::One(id) => std::slice::from_ref(id),
            Binding::Many(ids) => ids,
        }
    }
}

/// GDAL resampling algorithms accepted for overview generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resampling {
    Nearest,
    Average,
    Gauss,
    Cubic,
    CubicSpline,
    Lanczos,
    #[serde(rename = "average_mp")]
    AverageMp,
    #[serde(rename = "average_magphase")]
    AverageMagphase,
    Mode,
}

impl Resampling {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resampling::Nearest => "nearest",
            Resampling::Average => "average",
            Resampling::Gauss => "gauss",
            Resampling::Cubic => "cubic",
            Resampling::CubicSpline => "cubicspline",
            Resampling::Lanczos => "lanczos",
            Resampling::AverageMp => "average_mp",
            Resampling::AverageMagphase => "average_magphase",
            Resampling::Mode => "mode",
        }
    }
}

/// Operator parameters fixed at planning time.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskParams {
    None,
    Download {
        /// Appended to the scene's asset base URL, e.g. `B4.TIF`.
        url_fragment: String,
        destination: Utf8PathBuf,
    },
    Thumbnail {
        width: u32,
        height: u32,
    },
    Translate {
        creation_options: Vec<String>,
        /// EPSG code to warp to, if any.
        warp_srs: Option<String>,
        /// Add a nodata bitmask band.
        mask: bool,
    },
    Overviews {
        resampling: Resampling,
        scales: Vec<u32>,
        compress: String,
    },
    Upload {
        remote_dir: Utf8PathBuf,
    },
    Template {
        template: Utf8PathBuf,
        destination: Utf8PathBuf,
    },
    Metadata {
        template: Utf8PathBuf,
        destination: Utf8PathBuf,
        coverage_base_dir: Utf8PathBuf,
    },
    Package {
        output_dir: Utf8PathBuf,
    },
}

/// A unit of work in the graph.
#[derive(Debug, Clone)]
pub struct TaskNode {
    pub(crate) id: TaskId,
    pub(crate) name: String,
    pub(crate) role: Role,
    pub(crate) band: Option<u8>,
    pub(crate) upstream: Vec<TaskId>,
    pub(crate) bindings: BTreeMap<&'static str, Binding>,
    pub(crate) outputs: Vec<ResultKey>,
    pub(crate) params: TaskParams,
}

impl TaskNode {
    pub(crate) fn new(area: &str, role: Role, band: Option<u8>) -> Self {
        let name = match band {
            Some(band) => format!("{}{}", role.slug(), band),
            None => role.slug().to_string(),
        };

        // Join barriers carry no value of their own.
        let outputs = match role {
            Role::Join => vec![],
            _ => vec![ResultKey::RESULT],
        };

        Self {
            id: TaskId::derive(area, role, band),
            name,
            role,
            band,
            upstream: Vec::new(),
            bindings: BTreeMap::new(),
            outputs,
            params: TaskParams::None,
        }
    }

    pub(crate) fn after(mut self, upstream: impl IntoIterator<Item = TaskId>) -> Self {
        for id in upstream {
            if !self.upstream.contains(&id) {
                self.upstream.push(id);
            }
        }
        self
    }

    pub(crate) fn bind(mut self, name: &'static str, binding: Binding) -> Self {
        self.bindings.insert(name, binding);
        self
    }

    pub(crate) fn with_params(mut self, params: TaskParams) -> Self {
        self.params = params;
        self
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TaskKind {
        self.role.kind()
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn band(&self) -> Option<u8> {
        self.band
    }

    pub fn upstream(&self) -> &[TaskId] {
        &self.upstream
    }

    pub fn bindings(&self) -> &BTreeMap<&'static str, Binding> {
        &self.bindings
    }

    pub fn outputs(&self) -> &[ResultKey] {
        &self.outputs
    }

    pub fn params(&self) -> &TaskParams {
        &self.params
    }

    /// Whether any binding of this node reads from `producer`.
    pub fn is_bound_to(&self, producer: TaskId) -> bool {
        self.bindings
            .values()
            .any(|binding| binding.producers().contains(&producer))
    }
}

/// An immutable, validated task graph for one area.
pub struct Graph {
    pub(crate) area: Arc<AreaConfig>,
    pub(crate) graph: DiGraph<TaskNode, ()>,
    pub(crate) index: HashMap<TaskId, NodeIndex>,
    pub(crate) entry: TaskId,
}

impl Graph {
    /// Assembles and validates a graph from nodes listed in dependency order:
    /// every upstream must appear before the nodes that depend on it.
    pub(crate) fn from_nodes(
        area: Arc<AreaConfig>,
        nodes: impl IntoIterator<Item = TaskNode>,
    ) -> Result<Self, GraphError> {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();

        for node in nodes {
            if index.contains_key(&node.id) {
                return Err(GraphError::DuplicateTask(node.id));
            }

            let upstream: Vec<NodeIndex> = node
                .upstream
                .iter()
                .map(|dep| {
                    index.get(dep).copied().ok_or(GraphError::UnknownUpstream {
                        task: node.id,
                        upstream: *dep,
                    })
                })
                .collect::<Result<_, _>>()?;

            let id = node.id;
            let at = graph.add_node(node);
            for dep in upstream {
                graph.add_edge(dep, at, ());
            }
            index.insert(id, at);
        }

        if let Err(cycle) = toposort(&graph, None) {
            return Err(GraphError::Cycle(graph[cycle.node_id()].id));
        }

        for &at in index.values() {
            let node = &graph[at];
            for (&binding, target) in &node.bindings {
                for producer in target.producers() {
                    let reachable = index
                        .get(producer)
                        .is_some_and(|&from| from != at && has_path_connecting(&graph, from, at, None));

                    if !reachable {
                        return Err(GraphError::UnreachableBinding {
                            task: node.id,
                            binding,
                            producer: *producer,
                        });
                    }
                }
            }
        }

        let entry = graph
            .node_weights()
            .find(|node| node.role == Role::Search)
            .map(|node| node.id)
            .ok_or(GraphError::MissingEntry)?;

        Ok(Self {
            area,
            graph,
            index,
            entry,
        })
    }

    pub fn area(&self) -> &AreaConfig {
        &self.area
    }

    /// The search node every run starts from.
    pub fn entry(&self) -> TaskId {
        self.entry
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn node(&self, id: TaskId) -> Option<&TaskNode> {
        self.index.get(&id).map(|&at| &self.graph[at])
    }

    /// All nodes, in the order the builder created them.
    pub fn nodes(&self) -> impl Iterator<Item = &TaskNode> {
        self.graph.node_weights()
    }

    pub fn ids(&self) -> BTreeSet<TaskId> {
        self.index.keys().copied().collect()
    }

    /// Every dependency edge as `(upstream, downstream)`.
    pub fn edges(&self) -> BTreeSet<(TaskId, TaskId)> {
        self.graph
            .raw_edges()
            .iter()
            .map(|edge| (self.graph[edge.source()].id, self.graph[edge.target()].id))
            .collect()
    }

    /// Nodes that list `id` among their upstreams.
    pub fn downstream(&self, id: TaskId) -> Vec<TaskId> {
        let Some(&at) = self.index.get(&id) else {
            return vec![];
        };

        let mut ids: Vec<TaskId> = self
            .graph
            .neighbors_directed(at, petgraph::Direction::Outgoing)
            .map(|next| self.graph[next].id)
            .collect();
        ids.sort_by_key(|id| self.index[id]);
        ids
    }

    /// Every node reachable from `id`, not including `id` itself.
    pub fn descendants(&self, id: TaskId) -> BTreeSet<TaskId> {
        let Some(&at) = self.index.get(&id) else {
            return BTreeSet::new();
        };

        let mut seen = BTreeSet::new();
        let mut dfs = petgraph::visit::Dfs::new(&self.graph, at);
        while let Some(next) = dfs.next(&self.graph) {
            if next != at {
                seen.insert(self.graph[next].id);
            }
        }
        seen
    }

    /// Finds the node playing `role`, for per-band roles the one of `band`.
    pub fn find(&self, role: Role, band: Option<u8>) -> Option<&TaskNode> {
        self.node(TaskId::derive(&self.area.name, role, band))
    }

    pub fn by_name(&self, name: &str) -> Option<&TaskNode> {
        self.nodes().find(|node| node.name == name)
    }

    pub fn by_role(&self, role: Role) -> impl Iterator<Item = &TaskNode> {
        self.nodes().filter(move |node| node.role == role)
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("area", &self.area.name)
            .field("nodes", &self.graph.node_count())
            .field("edges", &self.graph.edge_count())
            .finish()
    }
}

/// Renders the graph as a Mermaid flowchart.
impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph LR")?;

        for node in self.nodes() {
            let name = node.name.replace('"', "\\\"");
            writeln!(f, "    {}[\"{}\"]", node.id, name)?;
        }

        for (source, target) in self.graph.raw_edges().iter().map(|e| (e.source(), e.target())) {
            writeln!(f, "    {} --> {}", self.graph[source].id, self.graph[target].id)?;
        }

        Ok(())
    }
}
