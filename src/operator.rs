//! The seam between the scheduler and the code that does the actual work.
//!
//! Downloading, GDAL processing, uploading and packaging all live outside this
//! crate. They plug in as [`Operator`]s, one per [`Operation`], registered in
//! an [`Operators`] table before a run starts. Most implementations should
//! write a [`TypedOperator`] instead and let the blanket impl erase the output.

use std::any::type_name;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::area::AreaConfig;
use crate::core::Dynamic;
use crate::error::{ConfigError, InputError, OperatorError};
use crate::graph::{Graph, Role, TaskNode, TaskParams};
use crate::scheduler::CancelToken;

/// The external operations a workflow is made of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Search,
    Fetch,
    Transform,
    AddOverviews,
    Upload,
    RenderDescription,
    RenderMetadata,
    Inspect,
    Package,
}

impl Operation {
    /// The operation backing a role, `None` for the join barrier, which the
    /// scheduler resolves itself.
    pub fn for_role(role: Role) -> Option<Operation> {
        let op = match role {
            Role::Search => Operation::Search,
            Role::FetchThumbnail | Role::FetchMetadata | Role::FetchBand => Operation::Fetch,
            Role::RenderThumbnail | Role::TranslateBand => Operation::Transform,
            Role::AddOverviews => Operation::AddOverviews,
            Role::UploadBand => Operation::Upload,
            Role::RenderDescription => Operation::RenderDescription,
            Role::AssembleMetadata => Operation::RenderMetadata,
            Role::Inspect => Operation::Inspect,
            Role::Package => Operation::Package,
            Role::Join => return None,
        };
        Some(op)
    }
}

/// An input as resolved from the result store.
#[derive(Clone)]
pub(crate) enum Resolved {
    One(Dynamic),
    Many(Vec<Dynamic>),
}

/// The upstream values an operator invocation reads, by binding name.
#[derive(Clone, Default)]
pub struct Inputs {
    values: BTreeMap<&'static str, Resolved>,
}

impl Inputs {
    pub(crate) fn insert(&mut self, name: &'static str, value: Resolved) {
        self.values.insert(name, value);
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.values.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Reads a single-producer input as `T`.
    pub fn one<T: 'static>(&self, name: &str) -> Result<&T, InputError> {
        match self.values.get(name) {
            Some(Resolved::One(value)) => {
                value
                    .downcast_ref::<T>()
                    .ok_or_else(|| InputError::TypeMismatch {
                        name: name.to_string(),
                        expected: type_name::<T>(),
                    })
            }
            Some(Resolved::Many(_)) => Err(InputError::Shape {
                name: name.to_string(),
                found: "a list of producers",
                expected: "a single producer",
            }),
            None => Err(InputError::Missing(name.to_string())),
        }
    }

    /// Reads a multi-producer input, in binding order.
    pub fn many<T: 'static>(&self, name: &str) -> Result<Vec<&T>, InputError> {
        match self.values.get(name) {
            Some(Resolved::Many(values)) => values
                .iter()
                .map(|value| {
                    value
                        .downcast_ref::<T>()
                        .ok_or_else(|| InputError::TypeMismatch {
                            name: name.to_string(),
                            expected: type_name::<T>(),
                        })
                })
                .collect(),
            Some(Resolved::One(_)) => Err(InputError::Shape {
                name: name.to_string(),
                found: "a single producer",
                expected: "a list of producers",
            }),
            None => Err(InputError::Missing(name.to_string())),
        }
    }
}

impl fmt::Debug for Inputs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.values.keys()).finish()
    }
}

/// Everything an operator may look at besides its inputs.
#[derive(Clone, Copy)]
pub struct OperatorContext<'a> {
    pub task: &'a TaskNode,
    pub area: &'a AreaConfig,
    /// 1-based attempt counter.
    pub attempt: u32,
    pub cancel: &'a CancelToken,
}

impl OperatorContext<'_> {
    pub fn params(&self) -> &TaskParams {
        self.task.params()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fails with [`OperatorError::Cancelled`] once the run was cancelled.
    pub fn check_cancelled(&self) -> Result<(), OperatorError> {
        if self.cancel.is_cancelled() {
            return Err(OperatorError::Cancelled);
        }
        Ok(())
    }
}

/// An operator with a concrete output type.
pub trait TypedOperator: Send + Sync {
    type Output: Send + Sync + 'static;

    fn execute(
        &self,
        inputs: &Inputs,
        ctx: &OperatorContext<'_>,
    ) -> Result<Self::Output, OperatorError>;
}

/// The type-erased operator the scheduler invokes.
pub trait Operator: Send + Sync {
    fn execute(&self, inputs: &Inputs, ctx: &OperatorContext<'_>) -> Result<Dynamic, OperatorError>;

    fn output_type_name(&self) -> &'static str;
}

impl<T> Operator for T
where
    T: TypedOperator + 'static,
{
    fn execute(&self, inputs: &Inputs, ctx: &OperatorContext<'_>) -> Result<Dynamic, OperatorError> {
        Ok(Arc::new(T::execute(self, inputs, ctx)?))
    }

    fn output_type_name(&self) -> &'static str {
        type_name::<T::Output>()
    }
}

/// Adapts a closure into an operator.
pub struct FnOperator<F>(F);

pub fn from_fn<F, R>(f: F) -> FnOperator<F>
where
    F: Fn(&Inputs, &OperatorContext<'_>) -> Result<R, OperatorError> + Send + Sync,
    R: Send + Sync + 'static,
{
    FnOperator(f)
}

impl<F, R> TypedOperator for FnOperator<F>
where
    F: Fn(&Inputs, &OperatorContext<'_>) -> Result<R, OperatorError> + Send + Sync,
    R: Send + Sync + 'static,
{
    type Output = R;

    fn execute(&self, inputs: &Inputs, ctx: &OperatorContext<'_>) -> Result<R, OperatorError> {
        (self.0)(inputs, ctx)
    }
}

/// Operators available to a run, keyed by the operation they implement.
#[derive(Clone, Default)]
pub struct Operators {
    table: HashMap<Operation, Arc<dyn Operator>>,
}

impl Operators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, operation: Operation, operator: impl Operator + 'static) {
        self.table.insert(operation, Arc::new(operator));
    }

    pub fn with(mut self, operation: Operation, operator: impl Operator + 'static) -> Self {
        self.register(operation, operator);
        self
    }

    pub fn get(&self, operation: Operation) -> Option<&Arc<dyn Operator>> {
        self.table.get(&operation)
    }

    /// The operator for every non-join node of `graph`.
    ///
    /// Fails on the first node, in build order, whose operation has nothing
    /// registered, so a run never starts with a hole in its table.
    pub(crate) fn resolve(
        &self,
        graph: &Graph,
    ) -> Result<HashMap<crate::graph::TaskId, Arc<dyn Operator>>, ConfigError> {
        let mut resolved = HashMap::new();

        for node in graph.nodes() {
            let Some(operation) = Operation::for_role(node.role()) else {
                continue;
            };

            let operator = self
                .get(operation)
                .ok_or_else(|| ConfigError::MissingOperator {
                    task: node.name().to_string(),
                    role: node.role(),
                    operation,
                })?;

            resolved.insert(node.id(), Arc::clone(operator));
        }

        Ok(resolved)
    }
}

impl fmt::Debug for Operators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.table.iter().map(|(op, o)| (op, o.output_type_name())))
            .finish()
    }
}
