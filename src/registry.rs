use std::collections::HashMap;
use std::sync::Arc;

use crate::store::RESERVED_NAMES;
use crate::task::ExecutionPolicy;
use crate::{BoxTask, Task, WoveError};

/// A reusable bundle of tasks bound to a receiver instance. Implementors
/// typically capture an `Arc<Self>` in each task body, so one template can
/// be installed into several runs. Installed tasks may be refined by later
/// local registrations of the same name.
pub trait Template {
    fn tasks(&self) -> Vec<BoxTask>;
}

pub(crate) struct TaskEntry {
    pub(crate) task: BoxTask,
    /// Effective policy after overlaying every registration of this name.
    pub(crate) policy: ExecutionPolicy,
}

/// Collects task descriptors by name, in declaration order.
///
/// Registering a name again replaces the task body, dependencies, and map
/// source outright, but unset policy fields fall back to the earlier
/// registration, so a local task can refine an inherited one without
/// restating its whole policy.
#[derive(Default)]
pub struct Registry {
    entries: HashMap<String, TaskEntry>,
    order: Vec<String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, task: impl Task + 'static) -> Result<(), WoveError> {
        self.register_boxed(Arc::new(task))
    }

    pub fn register_boxed(&mut self, task: BoxTask) -> Result<(), WoveError> {
        let name = task.name().to_string();
        if RESERVED_NAMES.contains(&name.as_str()) {
            return Err(WoveError::ReservedName(name));
        }
        let policy = match self.entries.get(&name) {
            Some(prior) => task.policy().or(&prior.policy),
            None => task.policy(),
        };
        policy.validate(&name, task.map().is_some())?;
        if !self.entries.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.entries.insert(name, TaskEntry { task, policy });
        Ok(())
    }

    /// Bulk-load a template's tasks. Call before local registrations so
    /// the local definitions win the overlay.
    pub fn install(&mut self, template: &dyn Template) -> Result<(), WoveError> {
        for task in template.tasks() {
            self.register_boxed(task)?;
        }
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Task names in first-registration order.
    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub(crate) fn entry(&self, name: &str) -> Option<&TaskEntry> {
        self.entries.get(name)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&String, &TaskEntry)> {
        self.order
            .iter()
            .filter_map(|name| self.entries.get(name).map(|entry| (name, entry)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NonBlockingTask;
    use serde_json::json;
    use std::time::Duration;

    fn noop(name: &str) -> NonBlockingTask {
        NonBlockingTask::new(name, |_args| async { Ok(json!(null)) })
    }

    #[test]
    fn reserved_names_are_rejected() {
        let mut registry = Registry::new();
        let err = registry.register(noop("errors")).unwrap_err();
        assert!(matches!(err, WoveError::ReservedName(_)));
    }

    #[test]
    fn re_registration_overlays_unset_policy_fields() {
        let mut registry = Registry::new();
        registry
            .register(noop("fetch").retries(3).timeout(Duration::from_secs(9)))
            .unwrap();
        registry
            .register(noop("fetch").timeout(Duration::from_secs(1)))
            .unwrap();

        let entry = registry.entry("fetch").unwrap();
        assert_eq!(entry.policy.retries, Some(3));
        assert_eq!(entry.policy.timeout, Some(Duration::from_secs(1)));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.names(), ["fetch"]);
    }

    #[test]
    fn throttling_on_unmapped_task_is_rejected() {
        let mut registry = Registry::new();
        let err = registry.register(noop("fetch").workers(2)).unwrap_err();
        assert!(matches!(err, WoveError::InvalidPolicy { .. }));
    }

    #[test]
    fn inherited_throttling_must_stay_mapped() {
        // A template registers a mapped task with a worker bound; a local
        // override that drops the map source inherits the bound and must
        // be rejected.
        let mut registry = Registry::new();
        registry
            .register(
                noop("scan")
                    .map_over(vec![json!(1)], "item")
                    .workers(2),
            )
            .unwrap();
        let err = registry.register(noop("scan")).unwrap_err();
        assert!(matches!(err, WoveError::InvalidPolicy { .. }));
    }

    #[test]
    fn declaration_order_is_first_registration_order() {
        let mut registry = Registry::new();
        registry.register(noop("b")).unwrap();
        registry.register(noop("a")).unwrap();
        registry.register(noop("b")).unwrap();
        assert_eq!(registry.names(), ["b", "a"]);
    }
}
