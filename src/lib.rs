#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod area;
mod blueprint;
mod config;
mod core;
mod error;
mod graph;
#[cfg(feature = "logging")]
mod logging;
pub mod operator;
#[cfg(feature = "minijinja")]
pub mod render;
pub mod scene;
pub mod scheduler;
mod store;

use chrono::NaiveDate;

pub use crate::area::{AreaConfig, DateRange, LocationPair, OrderBy, OrderDirection, OutputLocations};
pub use crate::blueprint::{build, plan_workflows};
pub use crate::config::{
    AreaSettings, CollectionSettings, ProcessingOptions, RunConfig, SearchDefaults, Settings,
};
pub use crate::core::Dynamic;
pub use crate::error::*;
pub use crate::graph::{
    Binding, Graph, Resampling, ResultKey, Role, TaskId, TaskKind, TaskNode, TaskParams,
};
#[cfg(feature = "logging")]
pub use crate::logging::init_logging;
pub use crate::operator::{
    FnOperator, Inputs, Operation, Operator, OperatorContext, Operators, TypedOperator, from_fn,
};
pub use crate::scene::{Catalog, CatalogSearch, SceneRecord};
pub use crate::scheduler::{CancelToken, NodeReport, RunReport, RunStatus, Scheduler, SkipReason, Status};
pub use crate::store::ResultStore;

/// Plans one workflow per configured area and runs them in order.
///
/// `today` anchors areas that only give a lookback window.
pub fn ingest(
    settings: &Settings,
    operators: &Operators,
    today: NaiveDate,
) -> Result<Vec<(String, RunReport)>, SchedulerError> {
    let workflows = settings.workflows(today)?;
    tracing::info!(collection = %settings.collection.name, workflows = workflows.len(), "planned workflows");

    Scheduler::new(settings.run.clone()).run_all(&workflows, operators)
}
