use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt::Write as _;

use tracing::debug;

use crate::registry::Registry;
use crate::task::MapSource;
use crate::WoveError;

/// Tiered execution plan: a snapshot of the registry's dependency graph,
/// computed once at the start of a run.
///
/// Seed names satisfy dependencies but are never scheduled, so they appear
/// in no tier.
#[derive(Debug)]
pub struct Plan {
    /// Flat topological order over all tasks.
    order: Vec<String>,
    /// Generations of mutually independent tasks; tier `k` only depends on
    /// tiers `0..k`.
    tiers: Vec<Vec<String>>,
    /// Declared dependencies per task, seeds included.
    dependencies: HashMap<String, BTreeSet<String>>,
    /// Inverse adjacency, restricted to tasks.
    dependents: HashMap<String, Vec<String>>,
}

impl Plan {
    /// Pure function of the registry snapshot and the run's seed names.
    /// Every error raised here is fatal to the whole run; no task has
    /// executed yet.
    pub(crate) fn build(registry: &Registry, seeds: &[String]) -> Result<Plan, WoveError> {
        let seed_set: HashSet<&str> = seeds.iter().map(String::as_str).collect();
        let mut dependencies: HashMap<String, BTreeSet<String>> = HashMap::new();

        for (name, entry) in registry.iter() {
            let mut deps = BTreeSet::new();
            for dep in entry.task.depends_on() {
                if !registry.contains(&dep) && !seed_set.contains(dep.as_str()) {
                    return Err(WoveError::UnknownDependency {
                        task: name.clone(),
                        dependency: dep,
                    });
                }
                deps.insert(dep);
            }
            if let Some(spec) = entry.task.map() {
                if let MapSource::Task(source) = &spec.source {
                    if !registry.contains(source) && !seed_set.contains(source.as_str()) {
                        return Err(WoveError::UnknownMapSource {
                            task: name.clone(),
                            source_task: source.clone(),
                        });
                    }
                    deps.insert(source.clone());
                }
                if spec.item_param.is_empty()
                    || registry.contains(&spec.item_param)
                    || seed_set.contains(spec.item_param.as_str())
                {
                    return Err(WoveError::ItemParamShadowed {
                        task: name.clone(),
                        param: spec.item_param,
                    });
                }
            }
            dependencies.insert(name.clone(), deps);
        }

        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        let mut in_degrees: HashMap<&str, usize> = HashMap::new();
        for name in registry.names() {
            // Seeds are committed before tier 0, so they never count
            // toward a task's unresolved in-degree.
            let task_deps: Vec<&String> = dependencies[name]
                .iter()
                .filter(|dep| registry.contains(dep))
                .collect();
            in_degrees.insert(name, task_deps.len());
            for dep in task_deps {
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .push(name.clone());
            }
        }

        let order = Self::topological_order(registry, &dependents, in_degrees.clone());
        if order.len() != registry.len() {
            return Err(WoveError::CircularDependency);
        }
        let tiers = Self::generations(registry, &dependents, in_degrees);

        debug!(tasks = order.len(), tiers = tiers.len(), "plan built");
        Ok(Plan {
            order,
            tiers,
            dependencies,
            dependents,
        })
    }

    /// Kahn's algorithm; the caller compares the result length against the
    /// task count to detect cycles.
    fn topological_order(
        registry: &Registry,
        dependents: &HashMap<String, Vec<String>>,
        mut in_degrees: HashMap<&str, usize>,
    ) -> Vec<String> {
        let mut queue: VecDeque<&str> = registry
            .names()
            .iter()
            .filter(|name| in_degrees[name.as_str()] == 0)
            .map(String::as_str)
            .collect();
        let mut order = Vec::new();

        while let Some(name) = queue.pop_front() {
            order.push(name.to_string());
            for child in dependents.get(name).into_iter().flatten() {
                let degree = in_degrees
                    .get_mut(child.as_str())
                    .expect("dependent is a registered task");
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(child);
                }
            }
        }
        order
    }

    /// Second Kahn pass, grouping simultaneously-ready tasks into
    /// successive generations.
    fn generations(
        registry: &Registry,
        dependents: &HashMap<String, Vec<String>>,
        mut in_degrees: HashMap<&str, usize>,
    ) -> Vec<Vec<String>> {
        let declaration_index: HashMap<&str, usize> = registry
            .names()
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), i))
            .collect();
        let mut ready: Vec<String> = registry
            .names()
            .iter()
            .filter(|name| in_degrees[name.as_str()] == 0)
            .cloned()
            .collect();
        let mut tiers = Vec::new();

        while !ready.is_empty() {
            let mut next = Vec::new();
            for name in &ready {
                for child in dependents.get(name).into_iter().flatten() {
                    let degree = in_degrees
                        .get_mut(child.as_str())
                        .expect("dependent is a registered task");
                    *degree -= 1;
                    if *degree == 0 {
                        next.push(child.clone());
                    }
                }
            }
            next.sort_by_key(|name| declaration_index[name.as_str()]);
            tiers.push(std::mem::replace(&mut ready, next));
        }
        tiers
    }

    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn tiers(&self) -> &[Vec<String>] {
        &self.tiers
    }

    pub fn dependencies_of(&self, name: &str) -> impl Iterator<Item = &str> {
        self.dependencies
            .get(name)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }

    pub fn dependents_of(&self, name: &str) -> impl Iterator<Item = &str> {
        self.dependents
            .get(name)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }

    /// Human-readable report of the detected tasks, their dependency and
    /// dependent sets, and the tier plan.
    pub fn render(&self) -> String {
        let mut out = String::from("tasks:\n");
        for name in &self.order {
            let deps = self
                .dependencies_of(name)
                .collect::<Vec<_>>()
                .join(", ");
            let mut dependents = self.dependents_of(name).collect::<Vec<_>>();
            dependents.sort_unstable();
            let _ = writeln!(
                out,
                "  {name}  deps=[{deps}]  dependents=[{}]",
                dependents.join(", ")
            );
        }
        out.push_str("tiers:\n");
        for (index, tier) in self.tiers.iter().enumerate() {
            let _ = writeln!(out, "  {index}: {}", tier.join(", "));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NonBlockingTask;
    use serde_json::json;

    fn noop(name: &str) -> NonBlockingTask {
        NonBlockingTask::new(name, |_args| async { Ok(json!(null)) })
    }

    fn registry_of(tasks: Vec<NonBlockingTask>) -> Registry {
        let mut registry = Registry::new();
        for task in tasks {
            registry.register(task).unwrap();
        }
        registry
    }

    #[test]
    fn diamond_produces_three_tiers() {
        let registry = registry_of(vec![
            noop("a"),
            noop("b").depends_on(["a"]),
            noop("c").depends_on(["a"]),
            noop("d").depends_on(["b", "c"]),
        ]);
        let plan = Plan::build(&registry, &[]).unwrap();

        assert_eq!(plan.tiers(), [vec!["a"], vec!["b", "c"], vec!["d"]]);
        assert_eq!(plan.order()[0], "a");
        assert_eq!(plan.order()[3], "d");
    }

    #[test]
    fn cycle_is_a_fatal_build_error() {
        let registry = registry_of(vec![
            noop("a").depends_on(["b"]),
            noop("b").depends_on(["a"]),
        ]);
        let err = Plan::build(&registry, &[]).unwrap_err();
        assert!(matches!(err, WoveError::CircularDependency));
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let registry = registry_of(vec![noop("a").depends_on(["a"])]);
        let err = Plan::build(&registry, &[]).unwrap_err();
        assert!(matches!(err, WoveError::CircularDependency));
    }

    #[test]
    fn unknown_dependency_is_fatal() {
        let registry = registry_of(vec![noop("a").depends_on(["ghost"])]);
        let err = Plan::build(&registry, &[]).unwrap_err();
        assert!(matches!(err, WoveError::UnknownDependency { .. }));
    }

    #[test]
    fn seeds_satisfy_dependencies_without_occupying_a_tier() {
        let registry = registry_of(vec![noop("double").depends_on(["x"])]);
        let plan = Plan::build(&registry, &["x".to_string()]).unwrap();
        assert_eq!(plan.tiers(), [vec!["double"]]);
    }

    #[test]
    fn map_source_task_becomes_a_dependency() {
        let registry = registry_of(vec![
            noop("items"),
            noop("scan").map_over_task("items", "item"),
        ]);
        let plan = Plan::build(&registry, &[]).unwrap();
        assert_eq!(plan.tiers(), [vec!["items"], vec!["scan"]]);
        assert_eq!(plan.dependencies_of("scan").collect::<Vec<_>>(), ["items"]);
    }

    #[test]
    fn unknown_map_source_is_fatal() {
        let registry = registry_of(vec![noop("scan").map_over_task("ghost", "item")]);
        let err = Plan::build(&registry, &[]).unwrap_err();
        assert!(matches!(err, WoveError::UnknownMapSource { .. }));
    }

    #[test]
    fn item_param_must_not_shadow_a_task() {
        let registry = registry_of(vec![
            noop("items"),
            noop("other"),
            noop("scan")
                .map_over_task("items", "other")
                .depends_on(["other"]),
        ]);
        let err = Plan::build(&registry, &[]).unwrap_err();
        assert!(matches!(err, WoveError::ItemParamShadowed { .. }));
    }

    #[test]
    fn render_lists_tasks_and_tiers() {
        let registry = registry_of(vec![noop("a"), noop("b").depends_on(["a"])]);
        let plan = Plan::build(&registry, &[]).unwrap();
        let report = plan.render();
        assert!(report.contains("a  deps=[]  dependents=[b]"));
        assert!(report.contains("0: a"));
        assert!(report.contains("1: b"));
    }
}
