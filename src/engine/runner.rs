mod diagnostics;

use std::collections::{BTreeMap, BTreeSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc::channel;
use std::time::{Duration, Instant};

use console::style;
use tracing::{Level, Span};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::cache::{CacheStore, Fingerprint};
use crate::config::RunConfig;
use crate::core::Value;
use crate::engine::plan::{InstanceId, Plan};
use crate::engine::{Inputs, Outputs, TaskNode};
use crate::error::{KumikiError, RootCause, RunError, TaskError};
use crate::telemetry::Invocation;
use crate::Workflow;

pub use diagnostics::{Diagnostics, TaskExecution};

/// Lifecycle of a node instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Waiting for at least one producer instance.
    Pending,
    /// Every producer is done; waiting for a worker.
    Ready,
    Running,
    Done,
    Failed,
}

/// The record of one node instance after a run.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Instance label, `name` for scalar nodes or `name[i,j]` for indexed ones.
    pub instance: String,
    pub node: String,
    pub status: Status,
    /// Resolved inputs, absent if the instance was never admitted.
    pub inputs: Option<Inputs>,
    pub outputs: Option<Arc<Outputs>>,
    pub error: Option<Arc<TaskError>>,
    pub fingerprint: Option<Fingerprint>,
    /// Served from the cache without running the body.
    pub cached: bool,
    /// Body run time.
    pub duration: Option<Duration>,
}

/// Everything a run produced.
#[derive(Debug)]
pub struct Outcome {
    /// Requested outputs by alias. Outputs of nodes indexed over an axis are
    /// nested arrays in axis order.
    pub outputs: BTreeMap<String, Value>,
    /// Every instance, in construction order.
    pub results: Vec<ExecutionResult>,
    pub diagnostics: Diagnostics,
}

impl Outcome {
    pub fn get(&self, alias: &str) -> Option<&Value> {
        self.outputs.get(alias)
    }

    /// Number of body invocations.
    pub fn executed(&self) -> usize {
        self.diagnostics.execution_times.len()
    }

    /// Number of instances served from the cache.
    pub fn cached(&self) -> usize {
        self.results.iter().filter(|result| result.cached).count()
    }

    pub fn failed(&self) -> impl Iterator<Item = &ExecutionResult> {
        self.results
            .iter()
            .filter(|result| result.status == Status::Failed)
    }

    /// Looks an instance up by its label.
    pub fn result(&self, instance: &str) -> Option<&ExecutionResult> {
        self.results.iter().find(|result| result.instance == instance)
    }
}

/// Owns the worker pool and the cache handle for as long as it lives.
///
/// ```rust,no_run
/// use kumiki::{Blueprint, Outputs, RunConfig, Submitter, TaskNode};
///
/// # fn main() -> anyhow::Result<()> {
/// let mut blueprint = Blueprint::new();
/// let answer = blueprint.add_node(
///     TaskNode::builder("answer")
///         .output("value")
///         .run(|_| Ok(Outputs::new().with("value", 42))),
/// )?;
/// let workflow = blueprint.finalize([("answer", answer.out("value"))])?;
///
/// let submitter = Submitter::new(RunConfig::default().cache_dir(".kumiki"))?;
/// let outcome = submitter.run(&workflow)?;
/// assert_eq!(outcome.get("answer"), Some(&42.into()));
/// # Ok(())
/// # }
/// ```
pub struct Submitter {
    pool: rayon::ThreadPool,
    cache: Option<CacheStore>,
    config: RunConfig,
}

impl Submitter {
    pub fn new(config: RunConfig) -> Result<Self, KumikiError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.jobs)
            .thread_name(|i| format!("kumiki-worker-{i}"))
            .build()?;

        let cache = match &config.cache_dir {
            Some(dir) => Some(CacheStore::open(dir)?),
            None => None,
        };

        Ok(Self {
            pool,
            cache,
            config,
        })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn cache(&self) -> Option<&CacheStore> {
        self.cache.as_ref()
    }

    /// Runs every instance of `workflow` and collects the requested outputs.
    ///
    /// Instances become ready as soon as all their producer instances are
    /// done, and ready instances are admitted in construction order, at most
    /// `jobs` at a time. The coordinating loop runs on the calling thread; the
    /// bodies run on the pool.
    ///
    /// A failed instance fails every instance downstream of it, without
    /// running them, while independent branches carry on. If any requested
    /// output could not be produced, the error carries the partial outcome.
    pub fn run(&self, workflow: &Workflow) -> Result<Outcome, RunError> {
        let s = Instant::now();
        let plan = Plan::new(workflow);
        let total = plan.len();
        let jobs = self.config.jobs;

        if self.config.progress {
            eprintln!(
                "Running {} with {} instance(s) on {} worker(s).",
                style("kumiki").red(),
                total,
                style(jobs).blue()
            );
        }

        let root_span = tracing::span!(Level::INFO, "workflow", label = %self.config.label);
        if self.config.progress {
            root_span.pb_set_style(&crate::utils::get_style_run());
            root_span.pb_set_length(total as u64);
            root_span.pb_set_message("Running tasks...");
        }
        let _enter = root_span.enter();

        let mut state = RunState::new(workflow, &plan);
        let task_style = crate::utils::get_style_task();

        self.pool.in_place_scope(|scope| -> Result<(), RunError> {
            // (instance, result, start, duration)
            let (sender, receiver) =
                channel::<(InstanceId, Result<Outputs, TaskError>, Instant, Duration)>();
            let mut running = 0;

            loop {
                while running < jobs
                    && let Some(id) = state.ready.pop_first()
                {
                    let instance = &plan.instances[id];
                    let node = &workflow.graph[instance.node].node;

                    let inputs = plan.resolve(workflow, id, |dep, output| state.output(dep, output));

                    let fingerprint = match Fingerprint::of(node, &inputs) {
                        Ok(fingerprint) => fingerprint,
                        Err(err) => {
                            tracing::error!("Task {} failed: {}", instance.label, err);
                            state.table[id].inputs = Some(inputs);
                            state.fail(&plan, id, err.into());
                            state.report(&root_span);
                            continue;
                        }
                    };

                    state.table[id].inputs = Some(inputs.clone());
                    state.table[id].fingerprint = Some(fingerprint);

                    if let Some(outputs) = self.lookup(&fingerprint, &instance.label) {
                        tracing::debug!("Cache hit for {} ({})", instance.label, fingerprint);
                        state.complete(&plan, id, outputs, true);
                        state.report(&root_span);
                        continue;
                    }

                    state.table[id].status = Status::Running;
                    running += 1;

                    let sender = sender.clone();
                    let task_style = task_style.clone();
                    let label = instance.label.clone();

                    scope.spawn(move |_| {
                        let span = tracing::span!(Level::INFO, "task", name = %label);
                        span.pb_set_style(&task_style);
                        span.pb_set_message(&format!("Running {label}"));
                        let _enter = span.enter();

                        let start = Instant::now();
                        let result = execute(node, &inputs);
                        let duration = start.elapsed();

                        if let Ok(outputs) = &result
                            && let Some(cache) = &self.cache
                        {
                            guarded(&label, "caching", || {
                                if let Err(err) = cache.store(&fingerprint, node.name(), outputs) {
                                    tracing::warn!("Couldn't cache the result of {}: {}", label, err);
                                }
                            });
                        }

                        // The receiver outlives the scope.
                        let _ = sender.send((id, result, start, duration));

                        guarded(&label, "telemetry", || {
                            self.record(node, &inputs, &label, s, start, duration);
                        });
                    });
                }

                if state.finished == total {
                    return Ok(());
                }

                if running == 0 {
                    return Err(RunError::Stalled(total - state.finished));
                }

                let Ok((id, result, start, duration)) = receiver.recv() else {
                    return Err(RunError::Stalled(total - state.finished));
                };
                running -= 1;

                let label = plan.instances[id].label.clone();
                state.table[id].duration = Some(duration);
                state.diagnostics.execution_times.insert(
                    label.clone(),
                    TaskExecution {
                        node: state.table[id].node.clone(),
                        start,
                        duration,
                    },
                );

                match result {
                    Ok(outputs) => state.complete(&plan, id, outputs, false),
                    Err(err) => {
                        tracing::error!("Task {} failed: {}", label, err);
                        state.fail(&plan, id, err);
                    }
                }
                state.report(&root_span);
            }
        })?;

        state.finish(workflow, &plan, s)
    }

    fn lookup(&self, fingerprint: &Fingerprint, label: &str) -> Option<Outputs> {
        let cache = self.cache.as_ref()?;

        match cache.lookup(fingerprint) {
            Ok(outputs) => outputs,
            Err(err) => {
                tracing::warn!("Cache lookup for {} failed: {}", label, err);
                None
            }
        }
    }

    fn record(
        &self,
        node: &TaskNode,
        inputs: &Inputs,
        label: &str,
        origin: Instant,
        start: Instant,
        duration: Duration,
    ) {
        let Some(sink) = &self.config.telemetry else {
            return;
        };

        let input = node
            .identify_by
            .as_deref()
            .and_then(|name| inputs.value(name).ok())
            .map(|value| match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_else(|| label.to_string());

        let invocation = Invocation {
            start: start.duration_since(origin),
            end: (start + duration).duration_since(origin),
            input,
            output_dir: self.config.output_dir.clone(),
            label: self.config.label.clone(),
            operation: node.name().to_string(),
        };

        if let Err(err) = sink.record(&invocation) {
            tracing::warn!("Couldn't record telemetry for {}: {:#}", label, err);
        }
    }
}

/// Runs bookkeeping that must not take the worker down with it.
fn guarded(label: &str, what: &str, f: impl FnOnce()) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
        tracing::warn!(
            "Panic in {} for {}: {}",
            what,
            label,
            panic_message(panic.as_ref())
        );
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("unknown payload")
    }
}

/// Runs a body, turning a panic or a missing output into a task failure.
fn execute(node: &TaskNode, inputs: &Inputs) -> Result<Outputs, TaskError> {
    let mut outputs = match catch_unwind(AssertUnwindSafe(|| (node.body)(inputs))) {
        Ok(Ok(outputs)) => outputs,
        Ok(Err(err)) => return Err(TaskError::from_body(err)),
        Err(panic) => return Err(TaskError::Panic(panic_message(panic.as_ref()))),
    };

    outputs
        .conform(node.name(), &node.outputs)
        .map_err(TaskError::MissingOutput)?;

    Ok(outputs)
}

/// Instance-state table, only ever touched by the coordinating loop.
struct RunState {
    table: Vec<ExecutionResult>,
    /// Producer instances each instance still waits for.
    remaining: Vec<usize>,
    ready: BTreeSet<InstanceId>,
    finished: usize,
    reported: usize,
    diagnostics: Diagnostics,
}

impl RunState {
    fn new(workflow: &Workflow, plan: &Plan) -> Self {
        let mut state = RunState {
            table: Vec::with_capacity(plan.len()),
            remaining: Vec::with_capacity(plan.len()),
            ready: BTreeSet::new(),
            finished: 0,
            reported: 0,
            diagnostics: Diagnostics::default(),
        };

        for (id, instance) in plan.instances.iter().enumerate() {
            let status = if instance.deps.is_empty() {
                state.ready.insert(id);
                Status::Ready
            } else {
                Status::Pending
            };

            state.remaining.push(instance.deps.len());
            state.table.push(ExecutionResult {
                instance: instance.label.clone(),
                node: workflow.graph[instance.node].node.name().to_string(),
                status,
                inputs: None,
                outputs: None,
                error: None,
                fingerprint: None,
                cached: false,
                duration: None,
            });
        }

        state
    }

    fn output(&self, id: InstanceId, output: &str) -> Value {
        self.table[id]
            .outputs
            .as_ref()
            .and_then(|outputs| outputs.get(output))
            .cloned()
            .unwrap_or(Value::Null)
    }

    fn complete(&mut self, plan: &Plan, id: InstanceId, outputs: Outputs, cached: bool) {
        let entry = &mut self.table[id];
        entry.status = Status::Done;
        entry.outputs = Some(Arc::new(outputs));
        entry.cached = cached;
        self.finished += 1;

        for &dependent in &plan.dependents[id] {
            self.remaining[dependent] -= 1;
            if self.remaining[dependent] == 0 && self.table[dependent].status == Status::Pending {
                self.table[dependent].status = Status::Ready;
                self.ready.insert(dependent);
            }
        }
    }

    /// Fails an instance and, transitively, everything downstream of it.
    fn fail(&mut self, plan: &Plan, id: InstanceId, error: TaskError) {
        let error = Arc::new(error);

        let (root, cause) = match error.as_ref() {
            TaskError::DependencyFailed { root, cause, .. } => (root.clone(), cause.clone()),
            _ => (plan.instances[id].label.clone(), error.clone()),
        };

        self.mark_failed(id, error);

        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            for &dependent in &plan.dependents[current] {
                if self.table[dependent].status != Status::Pending {
                    continue;
                }

                let error = TaskError::DependencyFailed {
                    dependency: plan.instances[current].label.clone(),
                    root: root.clone(),
                    cause: cause.clone(),
                };

                self.mark_failed(dependent, Arc::new(error));
                stack.push(dependent);
            }
        }
    }

    fn mark_failed(&mut self, id: InstanceId, error: Arc<TaskError>) {
        let entry = &mut self.table[id];
        entry.status = Status::Failed;
        entry.error = Some(error);
        self.finished += 1;
    }

    fn report(&mut self, span: &Span) {
        span.pb_inc((self.finished - self.reported) as u64);
        self.reported = self.finished;
    }

    /// Failed instances upstream of `id` whose own body or inputs failed.
    fn root_failures(&self, plan: &Plan, id: InstanceId) -> BTreeSet<InstanceId> {
        let mut roots = BTreeSet::new();
        let mut seen = BTreeSet::from([id]);
        let mut stack = vec![id];

        while let Some(current) = stack.pop() {
            let entry = &self.table[current];
            if entry.status != Status::Failed {
                continue;
            }

            match entry.error.as_deref() {
                Some(TaskError::DependencyFailed { .. }) => {
                    for &dep in &plan.instances[current].deps {
                        if seen.insert(dep) {
                            stack.push(dep);
                        }
                    }
                }
                Some(_) => {
                    roots.insert(current);
                }
                None => {}
            }
        }

        roots
    }

    /// Collects the requested outputs.
    fn finish(self, workflow: &Workflow, plan: &Plan, s: Instant) -> Result<Outcome, RunError> {
        let mut outputs = BTreeMap::new();
        let mut failed = Vec::new();
        let mut roots = BTreeSet::new();

        for requested in &workflow.outputs {
            let selection = plan.select(workflow, requested.node, &[], &[]);
            let mut values = Vec::with_capacity(selection.len());
            let mut complete = true;

            for id in selection {
                if self.table[id].status == Status::Done {
                    values.push(self.output(id, &requested.output));
                } else {
                    complete = false;
                    roots.extend(self.root_failures(plan, id));
                }
            }

            if complete {
                let value = plan.gather(workflow, requested.node, &[], values);
                outputs.insert(requested.alias.clone(), value);
            } else {
                failed.push(requested.alias.clone());
            }
        }

        let causes: Vec<RootCause> = roots
            .into_iter()
            .filter_map(|id| {
                let entry = &self.table[id];
                Some(RootCause {
                    instance: entry.instance.clone(),
                    error: entry.error.clone()?,
                })
            })
            .collect();

        let outcome = Outcome {
            outputs,
            results: self.table,
            diagnostics: self.diagnostics,
        };

        tracing::info!(
            "Run complete: {} executed, {} cached, {} failed {}",
            outcome.executed(),
            outcome.cached(),
            outcome.failed().count(),
            crate::utils::as_overhead(s)
        );

        if failed.is_empty() {
            Ok(outcome)
        } else {
            Err(RunError::TasksFailed {
                failed,
                causes,
                outcome: Box::new(outcome),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Blueprint;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn submitter(jobs: usize) -> Submitter {
        Submitter::new(RunConfig::default().jobs(jobs).progress(false)).unwrap()
    }

    #[test]
    fn test_single_node() {
        let mut blueprint = Blueprint::new();
        let node = blueprint
            .add_node(
                TaskNode::builder("add")
                    .input("a", 2)
                    .input("b", 3)
                    .output("sum")
                    .run(|inputs| {
                        let sum = inputs.get::<i64>("a")? + inputs.get::<i64>("b")?;
                        Ok(Outputs::new().with("sum", sum))
                    }),
            )
            .unwrap();
        let workflow = blueprint.finalize([("sum", node.out("sum"))]).unwrap();

        let outcome = submitter(1).run(&workflow).unwrap();
        assert_eq!(outcome.get("sum"), Some(&json!(5)));
        assert_eq!(outcome.executed(), 1);
        assert_eq!(outcome.results[0].status, Status::Done);
        assert!(outcome.results[0].duration.is_some());
    }

    #[test]
    fn test_jobs_bound_is_respected() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut blueprint = Blueprint::new();
        let stream = blueprint.split("i", 0..8).unwrap();
        let (a, p) = (active.clone(), peak.clone());
        let work = blueprint
            .add_node(
                TaskNode::builder("work")
                    .input("i", &stream)
                    .output("out")
                    .run(move |inputs| {
                        let now = a.fetch_add(1, Ordering::SeqCst) + 1;
                        p.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(10));
                        a.fetch_sub(1, Ordering::SeqCst);
                        Ok(Outputs::new().with("out", inputs.get::<i64>("i")?))
                    }),
            )
            .unwrap();
        blueprint.combine("i").unwrap();
        let workflow = blueprint.finalize([("all", work.out("out"))]).unwrap();

        let outcome = submitter(2).run(&workflow).unwrap();
        assert_eq!(outcome.get("all"), Some(&json!([0, 1, 2, 3, 4, 5, 6, 7])));
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_missing_output_fails_instance() {
        let mut blueprint = Blueprint::new();
        let node = blueprint
            .add_node(
                TaskNode::builder("lazy")
                    .output("out")
                    .run(|_| Ok(Outputs::new())),
            )
            .unwrap();
        let workflow = blueprint.finalize([("out", node.out("out"))]).unwrap();

        let Err(RunError::TasksFailed { failed, causes, .. }) = submitter(1).run(&workflow) else {
            panic!("expected failure");
        };
        assert_eq!(failed, vec!["out".to_string()]);
        assert!(matches!(*causes[0].error, TaskError::MissingOutput(ref name) if name == "out"));
    }

    #[test]
    fn test_empty_workflow() {
        let workflow = Blueprint::new().finalize(Vec::<(&str, _)>::new()).unwrap();
        let outcome = submitter(1).run(&workflow).unwrap();
        assert!(outcome.outputs.is_empty());
        assert!(outcome.results.is_empty());
    }
}
