use chrono::NaiveDate;
use serde::Serialize;
use thiserror::Error;

use crate::graph::{ResultKey, Role, TaskId};
use crate::operator::Operation;

/// Coarse classification of everything that can go wrong in a run.
///
/// This is what the run report exposes per node; the detailed error message
/// is kept next to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network or subprocess failure, eligible for the node's retry budget.
    TransientOperator,
    /// Operator failure that retrying cannot fix.
    FatalOperator,
    /// Malformed configuration, raised before any node executes.
    FatalConfiguration,
    /// An upstream node never produced a valid result.
    UpstreamFailure,
    /// The run-level deadline expired.
    Timeout,
    /// The operator observed the cancellation token and gave up.
    Cancelled,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::TransientOperator => "transient operator error",
            ErrorKind::FatalOperator => "fatal operator error",
            ErrorKind::FatalConfiguration => "fatal configuration error",
            ErrorKind::UpstreamFailure => "upstream failure",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Area name must not be empty")]
    EmptyName,

    #[error("Area name '{0}' may only contain ASCII letters, digits, '_' and '-'")]
    InvalidName(String),

    #[error("Area '{0}' has no bands")]
    NoBands(String),

    #[error("Area '{area}': band {band} is not a valid band number")]
    InvalidBand { area: String, band: u8 },

    #[error("Area '{area}': band {band} is listed more than once")]
    DuplicateBand { area: String, band: u8 },

    #[error("Area '{0}' has no path/row pairs")]
    NoLocations(String),

    #[error("Area '{area}': ({path}, {row}) is not a valid WRS-2 path/row pair")]
    InvalidLocation { area: String, path: u16, row: u16 },

    #[error("Area '{0}': download_max must be at least 1")]
    InvalidDownloadMax(String),

    #[error("Area '{area}': cloud coverage threshold {value} is outside 0..=100")]
    InvalidCloudCoverage { area: String, value: f64 },

    #[error("Area '{area}': date range starts at {start} but ends at {end}")]
    InvalidDateRange {
        area: String,
        start: NaiveDate,
        end: NaiveDate,
    },

    #[error("Workflow '{0}' is defined more than once")]
    DuplicateWorkflow(String),

    #[error("Unknown task role '{0}' in run.role_retries")]
    UnknownRole(String),

    #[error("Task '{task}' ({role:?}) has no operator registered for {operation:?}")]
    MissingOperator {
        task: String,
        role: Role,
        operation: Operation,
    },

    #[error("Invalid task graph:\n{0}")]
    Graph(#[from] GraphError),

    #[error("Couldn't read settings file.\n{0}")]
    Io(#[from] std::io::Error),

    #[error("Couldn't parse settings.\n{0}")]
    Parse(#[from] toml::de::Error),

    #[error("Couldn't serialize default settings.\n{0}")]
    Serialize(#[from] toml::ser::Error),
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Task {0} is declared more than once")]
    DuplicateTask(TaskId),

    #[error("Task {task} depends on unknown task {upstream}")]
    UnknownUpstream { task: TaskId, upstream: TaskId },

    #[error("Task {task} binds '{binding}' to {producer}, which is not one of its ancestors")]
    UnreachableBinding {
        task: TaskId,
        binding: &'static str,
        producer: TaskId,
    },

    #[error("Cycle detected in task graph at {0}")]
    Cycle(TaskId),

    #[error("Task graph has no search node")]
    MissingEntry,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Task {0} is not part of this run")]
    UnknownTask(TaskId),

    #[error("Task {producer} does not declare result key '{key}'")]
    UndeclaredKey { producer: TaskId, key: ResultKey },

    #[error("Result '{key}' of task {producer} was already published")]
    AlreadyPublished { producer: TaskId, key: ResultKey },

    #[error("Result '{key}' of task {producer} has not been published yet")]
    NotPublished { producer: TaskId, key: ResultKey },

    #[error("Task {consumer} has no input binding on task {producer}")]
    NotBound { consumer: TaskId, producer: TaskId },

    #[error("Result '{key}' of task {producer} is not a {expected}")]
    TypeMismatch {
        producer: TaskId,
        key: ResultKey,
        expected: &'static str,
    },
}

#[derive(Debug, Error)]
pub enum InputError {
    #[error("Input '{0}' is not bound for this task")]
    Missing(String),

    #[error("Input '{name}' is bound to {found}, expected {expected}")]
    Shape {
        name: String,
        found: &'static str,
        expected: &'static str,
    },

    #[error("Input '{name}' is not a {expected}")]
    TypeMismatch {
        name: String,
        expected: &'static str,
    },
}

/// The error half of an operator's `Result`.
#[derive(Debug, Error)]
pub enum OperatorError {
    /// Worth another attempt: flaky network, busy remote host, killed
    /// subprocess.
    #[error("{0}")]
    Transient(anyhow::Error),

    /// Retrying the same inputs will fail the same way.
    #[error("{0}")]
    Fatal(anyhow::Error),

    #[error("Operator observed cancellation")]
    Cancelled,

    #[error("Couldn't resolve operator inputs.\n{0}")]
    Input(#[from] InputError),
}

impl OperatorError {
    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        OperatorError::Transient(err.into())
    }

    pub fn fatal(err: impl Into<anyhow::Error>) -> Self {
        OperatorError::Fatal(err.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            OperatorError::Transient(_) => ErrorKind::TransientOperator,
            OperatorError::Fatal(_) | OperatorError::Input(_) => ErrorKind::FatalOperator,
            OperatorError::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, OperatorError::Transient(_))
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Configuration rejected before the run started.\n{0}")]
    Config(#[from] ConfigError),

    #[error("Failed to build worker pool.\n{0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("Invalid progress bar template.\n{0}")]
    Progress(#[from] indicatif::style::TemplateError),
}

impl SchedulerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SchedulerError::Config(_) => ErrorKind::FatalConfiguration,
            SchedulerError::ThreadPool(_) | SchedulerError::Progress(_) => ErrorKind::FatalOperator,
        }
    }
}
