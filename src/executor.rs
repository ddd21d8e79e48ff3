use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::graph::Plan;
use crate::registry::{Registry, Template};
use crate::store::{RESERVED_NAMES, ResultStore};
use crate::task::{MapSource, MapSpec};
use crate::{fanout, runner};
use crate::{BoxTask, Task, TaskArgs, TaskValue, WoveError};

/// The orchestration entry point: owns the registry, computes the tiered
/// plan once per run, and walks it tier by tier.
///
/// A task failure never aborts the run; it is recorded in the result store
/// and propagated to the task's transitive dependents, while independent
/// branches keep executing in later tiers. Only pre-execution graph errors
/// (and external cancellation) surface as `Err` from `run`.
#[derive(Default)]
pub struct Wove {
    registry: Registry,
    debug: bool,
}

/// What one spawned unit reports back to the tier loop.
type UnitOutcome = (String, Duration, Result<TaskValue, WoveError>);

impl Wove {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, task: impl Task + 'static) -> Result<(), WoveError> {
        self.registry.register(task)
    }

    pub fn register_boxed(&mut self, task: BoxTask) -> Result<(), WoveError> {
        self.registry.register_boxed(task)
    }

    /// Bulk-load a template before local registrations, so local
    /// definitions can refine inherited ones.
    pub fn install(&mut self, template: &dyn Template) -> Result<(), WoveError> {
        self.registry.install(template)
    }

    /// When set, the plan report is printed before execution starts.
    pub fn debug(&mut self, on: bool) -> &mut Self {
        self.debug = on;
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Run with seed values injected as already-completed pseudo-tasks.
    pub async fn run(&self, seeds: TaskArgs) -> Result<ResultStore, WoveError> {
        self.run_with_ctx(CancellationToken::new(), seeds).await
    }

    /// Like `run`, but cancellable from outside. Cancellation aborts the
    /// whole run with `ContextCancelled`.
    pub async fn run_with_ctx(
        &self,
        ctx: CancellationToken,
        seeds: TaskArgs,
    ) -> Result<ResultStore, WoveError> {
        let mut seed_names: Vec<String> = seeds.keys().cloned().collect();
        seed_names.sort_unstable();
        for name in &seed_names {
            if RESERVED_NAMES.contains(&name.as_str()) {
                return Err(WoveError::ReservedName(name.clone()));
            }
            if self.registry.contains(name) {
                return Err(WoveError::SeedCollision(name.clone()));
            }
        }

        let plan = Plan::build(&self.registry, &seed_names)?;
        if self.debug {
            println!("{}", plan.render());
        }

        let mut store = ResultStore::new();
        for name in &seed_names {
            store.declare(name);
            if let Some(value) = seeds.get(name) {
                store.commit_value(name, value.clone());
            }
        }
        for name in self.registry.names() {
            store.declare(name);
        }

        for (tier_index, tier) in plan.tiers().iter().enumerate() {
            self.run_tier(&ctx, &plan, tier_index, tier, &mut store).await;
            if ctx.is_cancelled() {
                return Err(WoveError::ContextCancelled(
                    "execution cancelled".to_string(),
                ));
            }
        }

        debug!(
            completed = store.names().len(),
            ok = store.is_ok(),
            "run finished"
        );
        Ok(store)
    }

    async fn run_tier(
        &self,
        run_ctx: &CancellationToken,
        plan: &Plan,
        tier_index: usize,
        tier: &[String],
        store: &mut ResultStore,
    ) {
        let tier_ctx = run_ctx.child_token();
        let mut units: JoinSet<UnitOutcome> = JoinSet::new();
        let mut spawned: HashMap<tokio::task::Id, String> = HashMap::new();

        for name in tier {
            if store.has_error(name) {
                debug!(task = %name, "skipped, failed dependency");
                continue;
            }
            let entry = match self.registry.entry(name) {
                Some(entry) => entry,
                None => continue,
            };

            // Scalar dependency values; a map-source task is resolved
            // separately into the item list, not into args.
            let mut args = TaskArgs::new();
            for dep in entry.task.depends_on() {
                if let Some(value) = store.value(&dep) {
                    args.insert(dep, value.clone());
                }
            }

            // The source iterable is materialized once, at the start of
            // the tier. A non-list source is this task's own runtime
            // error, not a fatal one.
            let map = match entry.task.map() {
                Some(spec) => match resolve_items(name, &spec, store) {
                    Ok(items) => Some((spec, items)),
                    Err(error) => {
                        fail_task(plan, store, name, Arc::new(error));
                        continue;
                    }
                },
                None => None,
            };

            let task = Arc::clone(&entry.task);
            let policy = entry.policy.clone();
            let unit_ctx = tier_ctx.clone();
            let unit_name = name.clone();
            let handle = units.spawn(async move {
                let started = Instant::now();
                let work = async {
                    match map {
                        Some((spec, items)) => {
                            fanout::run_mapped(
                                unit_ctx.clone(),
                                &unit_name,
                                &task,
                                &policy,
                                &args,
                                &spec,
                                items,
                            )
                            .await
                        }
                        None => {
                            runner::run_attempts(
                                unit_ctx.clone(),
                                &unit_name,
                                &task,
                                &policy,
                                &args,
                            )
                            .await
                        }
                    }
                };
                let result = tokio::select! {
                    _ = unit_ctx.cancelled() => Err(WoveError::ContextCancelled(
                        "tier cancelled".to_string(),
                    )),
                    result = work => result,
                };
                (unit_name, started.elapsed(), result)
            });
            spawned.insert(handle.id(), name.clone());
        }

        if spawned.is_empty() {
            return;
        }
        debug!(tier = tier_index, tasks = spawned.len(), "tier started");

        // Drain the whole tier. The first genuine failure cancels the
        // tier token; siblings then wind down as ContextCancelled, which
        // is not an outcome for them. Values completed before the
        // cancellation are still committed.
        let mut completed: Vec<(String, TaskValue)> = Vec::new();
        let mut failed: Vec<(String, Arc<WoveError>)> = Vec::new();
        while let Some(joined) = units.join_next_with_id().await {
            match joined {
                Ok((_id, (name, elapsed, result))) => match result {
                    Ok(value) => {
                        store.record_timing(&name, elapsed);
                        debug!(task = %name, ?elapsed, "task completed");
                        completed.push((name, value));
                    }
                    Err(WoveError::ContextCancelled(_)) if tier_ctx.is_cancelled() => {}
                    Err(error) => {
                        store.record_timing(&name, elapsed);
                        warn!(task = %name, error = %error, "task failed");
                        tier_ctx.cancel();
                        failed.push((name, Arc::new(error)));
                    }
                },
                Err(join_error) => {
                    let name = spawned
                        .get(&join_error.id())
                        .cloned()
                        .unwrap_or_else(|| "<unknown>".to_string());
                    warn!(task = %name, error = %join_error, "task panicked");
                    tier_ctx.cancel();
                    let error = WoveError::TaskExecution(format!("task {name} panicked"));
                    failed.push((name, Arc::new(error)));
                }
            }
        }

        for (name, value) in completed {
            store.commit_value(&name, value);
        }
        for (name, error) in failed {
            fail_task(plan, store, &name, error);
        }
    }
}

fn resolve_items(
    name: &str,
    spec: &MapSpec,
    store: &ResultStore,
) -> Result<Vec<TaskValue>, WoveError> {
    match &spec.source {
        MapSource::Literal(items) => Ok(items.clone()),
        MapSource::Task(source) => match store.value(source) {
            Some(TaskValue::Array(items)) => Ok(items.clone()),
            Some(other) => Err(WoveError::MapSourceNotIterable {
                task: name.to_string(),
                found: value_kind(other).to_string(),
            }),
            None => Err(WoveError::TaskExecution(format!(
                "map source {source:?} of task {name:?} has no value"
            ))),
        },
    }
}

fn value_kind(value: &TaskValue) -> &'static str {
    match value {
        TaskValue::Null => "null",
        TaskValue::Bool(_) => "a bool",
        TaskValue::Number(_) => "a number",
        TaskValue::String(_) => "a string",
        TaskValue::Array(_) => "a list",
        TaskValue::Object(_) => "an object",
    }
}

/// Record `error` on `name`, then breadth-first mark every transitive
/// dependent with the same shared error object.
fn fail_task(plan: &Plan, store: &mut ResultStore, name: &str, error: Arc<WoveError>) {
    store.commit_error(name, Arc::clone(&error));
    let mut queue: VecDeque<&str> = plan.dependents_of(name).collect();
    while let Some(dependent) = queue.pop_front() {
        if store.has_error(dependent) {
            continue;
        }
        debug!(task = %dependent, origin = %name, "failure propagated");
        store.commit_error(dependent, Arc::clone(&error));
        queue.extend(plan.dependents_of(dependent));
    }
}
