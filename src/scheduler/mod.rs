//! Runs a task graph on a bounded worker pool.
//!
//! The scheduling loop keeps, for every node, the number of upstreams that
//! have not settled yet. Nodes whose count drops to zero become ready; a
//! ready node whose upstreams all succeeded is handed to a worker, any other
//! is marked upstream-failed on the spot and settles its own dependents in
//! turn. Workers report back over a channel, and the loop waits on that
//! channel with the run deadline as timeout.
//!
//! Only the loop touches the run state. Workers see the graph, their resolved
//! inputs and the cancellation token, and publish nothing themselves: the
//! loop publishes each result when the completion arrives.

mod cancel;
mod report;
mod state;


use std::collections::{HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc::{RecvTimeoutError, Sender, channel};
use std::time::{Duration, Instant};

use chrono::Utc;
use indicatif::ProgressStyle;
use tracing::Span;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::config::RunConfig;
use crate::core::Dynamic;
use crate::error::{OperatorError, SchedulerError};
use crate::graph::{Binding, Graph, ResultKey, Role, TaskId, TaskNode};
use crate::operator::{Inputs, Operator, OperatorContext, Operators, Resolved};
use crate::scene::SceneRecord;

pub use cancel::CancelToken;
pub use report::{NodeReport, RunReport, RunStatus};
pub use state::{SkipReason, Status};

use state::RunState;

/// Executes graphs according to a [`RunConfig`].
#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    config: RunConfig,
}

impl Scheduler {
    pub fn new(config: RunConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Runs `graph` to completion, or until the run deadline.
    ///
    /// Configuration problems, including an operation with no registered
    /// operator, are reported as errors before any node executes. Everything
    /// that goes wrong afterwards ends up in the returned report.
    pub fn run(&self, graph: &Graph, operators: &Operators) -> Result<RunReport, SchedulerError> {
        self.config.validate()?;
        let operators = operators.resolve(graph)?;

        let workers = self.config.workers();
        // one extra thread hosts the scheduling loop itself
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers + 1)
            .thread_name(|i| format!("sceneflow-{i}"))
            .build()?;

        let root_span = tracing::info_span!("workflow", area = %graph.area().name);
        root_span.pb_set_length(graph.len() as u64);
        root_span.pb_set_style(
            &ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
                .progress_chars("=>-"),
        );
        root_span.pb_set_message(&format!("ingesting {}", graph.area().name));

        let task_style = ProgressStyle::default_spinner().template("{spinner:.blue} {msg}")?;

        let started_at = Utc::now();
        let started = Instant::now();
        let cancel = CancelToken::new();
        let mut state = RunState::new(graph);

        tracing::info!(
            area = %graph.area().name,
            tasks = graph.len(),
            workers,
            "starting workflow"
        );

        let timed_out = pool.scope(|scope| {
            let _enter = root_span.enter();

            let mut run = Run {
                config: &self.config,
                graph,
                operators: &operators,
                cancel: &cancel,
                span: &root_span,
                style: &task_style,
                state: &mut state,
                remaining: graph
                    .nodes()
                    .map(|node| (node.id(), node.upstream().len()))
                    .collect(),
                ready: VecDeque::new(),
                running: 0,
                workers,
                // too far out to represent means no deadline at all
                deadline: started.checked_add(self.config.timeout),
            };

            run.drive(scope)
        });

        let report = RunReport::new(graph, &state, started_at, started.elapsed(), timed_out);

        match report.error {
            None => tracing::info!(area = %report.area, elapsed = ?report.duration, "workflow succeeded"),
            Some(kind) => tracing::error!(area = %report.area, error = %kind, "workflow failed"),
        }

        Ok(report)
    }

    /// Runs several planned workflows one after the other.
    pub fn run_all(
        &self,
        workflows: &[(String, Graph)],
        operators: &Operators,
    ) -> Result<Vec<(String, RunReport)>, SchedulerError> {
        workflows
            .iter()
            .map(|(name, graph)| {
                tracing::info!(workflow = %name, "running workflow");
                Ok((name.clone(), self.run(graph, operators)?))
            })
            .collect()
    }
}

/// What a worker sends back once its operator returns.
struct Completion {
    id: TaskId,
    result: Result<Dynamic, OperatorError>,
    elapsed: Duration,
}

/// The scheduling loop of a single run.
struct Run<'m, 'g> {
    config: &'g RunConfig,
    graph: &'g Graph,
    operators: &'g HashMap<TaskId, Arc<dyn Operator>>,
    cancel: &'g CancelToken,
    span: &'g Span,
    style: &'g ProgressStyle,
    state: &'m mut RunState<'g>,
    /// Upstreams of each node that have not settled yet.
    remaining: HashMap<TaskId, usize>,
    ready: VecDeque<TaskId>,
    running: usize,
    workers: usize,
    deadline: Option<Instant>,
}

impl<'g> Run<'_, 'g> {
    /// Returns whether the run deadline expired.
    fn drive<'s>(&mut self, scope: &rayon::Scope<'s>) -> bool
    where
        'g: 's,
    {
        let (sender, receiver) = channel::<Completion>();

        self.ready.push_back(self.graph.entry());

        loop {
            self.dispatch(scope, &sender);

            if self.state.is_done() {
                return false;
            }

            if self.running == 0 && self.ready.is_empty() {
                tracing::error!("no task is running or ready, abandoning the run");
                return false;
            }

            let done = match self.deadline {
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        self.expire();
                        return true;
                    }

                    match receiver.recv_timeout(left) {
                        Ok(done) => done,
                        Err(RecvTimeoutError::Timeout) => {
                            self.expire();
                            return true;
                        }
                        Err(RecvTimeoutError::Disconnected) => return false,
                    }
                }
                None => match receiver.recv() {
                    Ok(done) => done,
                    Err(_) => return false,
                },
            };

            self.running -= 1;
            self.complete(done);
        }
    }

    /// Starts ready nodes while worker slots are free. Join barriers need no
    /// slot, they settle immediately.
    fn dispatch<'s>(&mut self, scope: &rayon::Scope<'s>, sender: &Sender<Completion>)
    where
        'g: 's,
    {
        while let Some(id) = self.ready.pop_front() {
            let Some(node) = self.graph.node(id) else {
                continue;
            };

            if node.role() == Role::Join {
                self.state.start(id);
                self.state.succeed(id, Duration::ZERO);
                self.span.pb_inc(1);
                tracing::debug!(task = %node.name(), "all uploads finished");
                self.release(id);
                continue;
            }

            if self.running >= self.workers {
                self.ready.push_front(id);
                break;
            }

            match self.inputs(node) {
                Ok(inputs) => self.spawn(scope, sender, node, inputs),
                Err(err) => {
                    self.state.start(id);
                    self.settle_failed(node, err, Duration::ZERO);
                }
            }
        }
    }

    fn inputs(&self, node: &TaskNode) -> Result<Inputs, OperatorError> {
        let store = self.state.store();
        let mut inputs = Inputs::default();

        for (&name, binding) in node.bindings() {
            let value = match binding {
                Binding::One(producer) => Resolved::One(
                    store
                        .fetch(node.id(), *producer, &ResultKey::RESULT)
                        .map_err(OperatorError::fatal)?,
                ),
                Binding::Many(producers) => Resolved::Many(
                    store
                        .fetch_all(node.id(), producers, &ResultKey::RESULT)
                        .map_err(OperatorError::fatal)?,
                ),
            };
            inputs.insert(name, value);
        }

        Ok(inputs)
    }

    fn spawn<'s>(
        &mut self,
        scope: &rayon::Scope<'s>,
        sender: &Sender<Completion>,
        node: &'g TaskNode,
        inputs: Inputs,
    ) where
        'g: 's,
    {
        let Some(operator) = self.operators.get(&node.id()).cloned() else {
            // resolved before the run, so every non-join node has one
            self.state.start(node.id());
            self.settle_failed(
                node,
                OperatorError::fatal(anyhow::anyhow!("no operator for task '{}'", node.name())),
                Duration::ZERO,
            );
            return;
        };

        let attempt = self.state.start(node.id());
        self.running += 1;

        let delay = match attempt {
            1 => Duration::ZERO,
            _ => self.config.retry_delay,
        };

        let area = self.graph.area();
        let cancel = self.cancel;
        let parent = self.span.clone();
        let style = self.style.clone();
        let sender = sender.clone();

        scope.spawn(move |_| {
            let span = tracing::info_span!(parent: &parent, "task", task = %node.name(), attempt);
            span.pb_set_style(&style);
            span.pb_set_message(&format!("running {}", node.name()));
            let _enter = span.enter();

            let ctx = OperatorContext {
                task: node,
                area,
                attempt,
                cancel,
            };

            let start = Instant::now();
            let result = execute(operator.as_ref(), &inputs, &ctx, delay);

            // the loop stops listening once the run has timed out
            let _ = sender.send(Completion {
                id: node.id(),
                result,
                elapsed: start.elapsed(),
            });
        });
    }

    fn complete(&mut self, done: Completion) {
        let Completion { id, result, elapsed } = done;
        let Some(node) = self.graph.node(id) else {
            return;
        };

        match result.and_then(|value| self.accept(node, value)) {
            Ok(()) => {
                self.state.succeed(id, elapsed);
                self.span.pb_inc(1);
                tracing::debug!(task = %node.name(), ?elapsed, "task succeeded");

                if node.role() == Role::Search && self.found_nothing(id) {
                    let skipped = self.state.skip_unfinished(SkipReason::NoScenes);
                    self.span.pb_inc(skipped as u64);
                    tracing::info!(
                        area = %self.graph.area().name,
                        skipped,
                        "no scene matched the search, nothing to ingest"
                    );
                    return;
                }

                self.release(id);
            }
            Err(err) if err.is_retryable() && self.state.attempts(id) <= self.config.retries_for(node.role()) => {
                tracing::warn!(
                    task = %node.name(),
                    attempt = self.state.attempts(id),
                    error = %err,
                    "task failed, retrying"
                );
                self.state.retry(id, err.kind(), format!("{err:#}"), elapsed);
                self.ready.push_back(id);
            }
            Err(err) => self.settle_failed(node, err, elapsed),
        }
    }

    /// Checks a successful result and publishes it.
    fn accept(&self, node: &TaskNode, value: Dynamic) -> Result<(), OperatorError> {
        if node.role() == Role::Search && value.downcast_ref::<Vec<SceneRecord>>().is_none() {
            return Err(OperatorError::fatal(anyhow::anyhow!(
                "search operator must return a list of scene records"
            )));
        }

        self.state
            .store()
            .publish(node.id(), &ResultKey::RESULT, value)
            .map_err(OperatorError::fatal)
    }

    fn found_nothing(&self, search: TaskId) -> bool {
        self.state
            .store()
            .peek::<Vec<SceneRecord>>(search, &ResultKey::RESULT)
            .is_ok_and(|scenes| scenes.is_empty())
    }

    fn settle_failed(&mut self, node: &TaskNode, err: OperatorError, elapsed: Duration) {
        tracing::error!(
            task = %node.name(),
            attempts = self.state.attempts(node.id()),
            error = %err,
            "task failed"
        );
        self.state.fail(node.id(), err.kind(), format!("{err:#}"), elapsed);
        self.span.pb_inc(1);
        self.release(node.id());
    }

    /// Settles one dependency for every dependent of `id`, cascading upstream
    /// failures through the graph.
    fn release(&mut self, id: TaskId) {
        let mut settled = vec![id];

        while let Some(done) = settled.pop() {
            for next in self.graph.downstream(done) {
                let Some(count) = self.remaining.get_mut(&next) else {
                    continue;
                };

                *count = count.saturating_sub(1);
                if *count > 0 {
                    continue;
                }

                let Some(node) = self.graph.node(next) else {
                    continue;
                };

                let cause = node
                    .upstream()
                    .iter()
                    .copied()
                    .find(|&up| self.state.status(up) != Status::Succeeded);

                match cause {
                    None => self.ready.push_back(next),
                    Some(cause) => {
                        self.state.upstream_failed(next, cause);
                        self.span.pb_inc(1);
                        tracing::warn!(task = %node.name(), "skipping task, an upstream task failed");
                        settled.push(next);
                    }
                }
            }
        }
    }

    fn expire(&mut self) {
        self.cancel.cancel();
        let skipped = self.state.skip_unfinished(SkipReason::Timeout);
        self.span.pb_inc(skipped as u64);
        tracing::error!(
            area = %self.graph.area().name,
            timeout = ?self.config.timeout,
            skipped,
            running = self.running,
            "run deadline expired, cancelling"
        );
    }
}

/// Invokes `operator` on a worker thread after the retry `delay`, turning
/// panics in either into fatal errors.
fn execute(
    operator: &dyn Operator,
    inputs: &Inputs,
    ctx: &OperatorContext<'_>,
    delay: Duration,
) -> Result<Dynamic, OperatorError> {
    let attempt = || {
        if !delay.is_zero() && ctx.cancel.wait_timeout(delay) {
            return Err(OperatorError::Cancelled);
        }
        ctx.check_cancelled()?;
        operator.execute(inputs, ctx)
    };

    // Operators only see shared, immutable data, so a panic can't leave
    // anything half-written behind.
    match catch_unwind(AssertUnwindSafe(attempt)) {
        Ok(result) => result,
        Err(panic) => {
            let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                format!("operator panicked: {s}")
            } else if let Some(s) = panic.downcast_ref::<String>() {
                format!("operator panicked: {s}")
            } else {
                String::from("operator panicked with unknown payload")
            };

            Err(OperatorError::fatal(anyhow::anyhow!(msg)))
        }
    }
}
