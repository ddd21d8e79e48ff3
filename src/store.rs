use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::{TaskValue, WoveError};

/// Names the store exposes as accessors; task and seed names must not
/// collide with them.
pub(crate) const RESERVED_NAMES: &[&str] = &["values", "errors", "timings", "order"];

/// Terminal outcomes of one run: per task name a value or an error (never
/// both), the elapsed wall-clock time where the task actually ran, and the
/// declaration-ordered name list. Handed back to the caller read-only once
/// the run finishes.
#[derive(Debug, Default)]
pub struct ResultStore {
    values: HashMap<String, TaskValue>,
    errors: HashMap<String, Arc<WoveError>>,
    timings: HashMap<String, Duration>,
    order: Vec<String>,
}

impl ResultStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn declare(&mut self, name: &str) {
        self.order.push(name.to_string());
    }

    pub(crate) fn commit_value(&mut self, name: &str, value: TaskValue) {
        debug_assert!(
            !self.errors.contains_key(name),
            "task {name} already has an error"
        );
        self.values.insert(name.to_string(), value);
    }

    pub(crate) fn commit_error(&mut self, name: &str, error: Arc<WoveError>) {
        debug_assert!(
            !self.values.contains_key(name),
            "task {name} already has a value"
        );
        self.errors.insert(name.to_string(), error);
    }

    pub(crate) fn record_timing(&mut self, name: &str, elapsed: Duration) {
        self.timings.insert(name.to_string(), elapsed);
    }

    pub(crate) fn has_error(&self, name: &str) -> bool {
        self.errors.contains_key(name)
    }

    pub fn value(&self, name: &str) -> Option<&TaskValue> {
        self.values.get(name)
    }

    pub fn error(&self, name: &str) -> Option<&WoveError> {
        self.errors.get(name).map(Arc::as_ref)
    }

    /// The shared error object, identical across a failed task and all of
    /// its transitive dependents.
    pub fn shared_error(&self, name: &str) -> Option<&Arc<WoveError>> {
        self.errors.get(name)
    }

    pub fn timing(&self, name: &str) -> Option<Duration> {
        self.timings.get(name).copied()
    }

    /// All seed and task names in declaration order.
    pub fn names(&self) -> &[String] {
        &self.order
    }

    /// True when no task failed.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn outcomes_are_kept_separate() {
        let mut store = ResultStore::new();
        store.declare("a");
        store.declare("b");
        store.commit_value("a", json!(1));
        store.commit_error("b", Arc::new(WoveError::TaskExecution("boom".into())));
        store.record_timing("a", Duration::from_millis(3));

        assert_eq!(store.value("a"), Some(&json!(1)));
        assert!(store.error("a").is_none());
        assert!(store.value("b").is_none());
        assert!(store.error("b").is_some());
        assert_eq!(store.names(), ["a", "b"]);
        assert!(!store.is_ok());
        assert_eq!(store.timing("a"), Some(Duration::from_millis(3)));
        assert!(store.timing("b").is_none());
    }
}
