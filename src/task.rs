use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{TaskArgs, TaskValue, WoveError};

/// Per-task execution policy. Every field is optional; on re-registration
/// of the same task name, unset fields fall back to the earlier
/// registration (see `Registry::register`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionPolicy {
    /// Additional attempts after the first failure.
    pub retries: Option<u32>,
    /// Fixed delay between attempts.
    pub backoff: Option<Duration>,
    /// Per-attempt time budget; each retry gets a fresh budget.
    pub timeout: Option<Duration>,
    /// Mapped tasks only: bound on concurrent in-flight invocations.
    pub workers: Option<usize>,
    /// Mapped tasks only: at most this many invocations start per minute.
    pub limit_per_minute: Option<u32>,
}

impl ExecutionPolicy {
    /// Field-wise overlay: `self` wins where set, `fallback` fills the rest.
    pub(crate) fn or(self, fallback: &ExecutionPolicy) -> ExecutionPolicy {
        ExecutionPolicy {
            retries: self.retries.or(fallback.retries),
            backoff: self.backoff.or(fallback.backoff),
            timeout: self.timeout.or(fallback.timeout),
            workers: self.workers.or(fallback.workers),
            limit_per_minute: self.limit_per_minute.or(fallback.limit_per_minute),
        }
    }

    pub(crate) fn validate(&self, task: &str, mapped: bool) -> Result<(), WoveError> {
        let reject = |reason: &str| {
            Err(WoveError::InvalidPolicy {
                task: task.to_string(),
                reason: reason.to_string(),
            })
        };
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return reject("timeout must be positive");
        }
        if self.workers == Some(0) {
            return reject("workers must be positive");
        }
        if self.limit_per_minute == Some(0) {
            return reject("limit_per_minute must be positive");
        }
        if !mapped && (self.workers.is_some() || self.limit_per_minute.is_some()) {
            return reject("workers and limit_per_minute require a map source");
        }
        Ok(())
    }
}

/// Where a mapped task's elements come from.
#[derive(Debug, Clone)]
pub enum MapSource {
    /// Resolved at run time from the named task's committed value,
    /// which must be a list.
    Task(String),
    /// Captured at registration time.
    Literal(Vec<TaskValue>),
}

#[derive(Debug, Clone)]
pub struct MapSpec {
    pub source: MapSource,
    /// Args key the current element is delivered under. Must not shadow a
    /// task or seed name.
    pub item_param: String,
}

#[async_trait]
pub trait Task: Send + Sync {
    fn name(&self) -> &str;

    fn depends_on(&self) -> Vec<String> {
        Vec::new()
    }

    fn policy(&self) -> ExecutionPolicy {
        ExecutionPolicy::default()
    }

    fn map(&self) -> Option<MapSpec> {
        None
    }

    /// One invocation. For mapped tasks, `args` additionally carries the
    /// current element under the declared item parameter.
    async fn invoke(
        &self,
        ctx: CancellationToken,
        args: TaskArgs,
    ) -> Result<TaskValue, WoveError>;
}

type AsyncBody = dyn Fn(TaskArgs) -> BoxFuture<'static, Result<TaskValue, WoveError>>
    + Send
    + Sync;
type BlockingBody = dyn Fn(TaskArgs) -> Result<TaskValue, WoveError> + Send + Sync;

/// A task whose body is an async function, run directly on the scheduler.
pub struct NonBlockingTask {
    name: String,
    depends_on: Vec<String>,
    policy: ExecutionPolicy,
    map: Option<MapSpec>,
    body: Arc<AsyncBody>,
}

impl NonBlockingTask {
    pub fn new<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(TaskArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TaskValue, WoveError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            depends_on: Vec::new(),
            policy: ExecutionPolicy::default(),
            map: None,
            body: Arc::new(move |args| body(args).boxed()),
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.policy.retries = Some(retries);
        self
    }

    pub fn backoff(mut self, backoff: Duration) -> Self {
        self.policy.backoff = Some(backoff);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.policy.timeout = Some(timeout);
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.policy.workers = Some(workers);
        self
    }

    pub fn limit_per_minute(mut self, limit: u32) -> Self {
        self.policy.limit_per_minute = Some(limit);
        self
    }

    /// Map this task over a literal list of items.
    pub fn map_over(mut self, items: Vec<TaskValue>, item_param: impl Into<String>) -> Self {
        self.map = Some(MapSpec {
            source: MapSource::Literal(items),
            item_param: item_param.into(),
        });
        self
    }

    /// Map this task over the list produced by another task.
    pub fn map_over_task(
        mut self,
        source: impl Into<String>,
        item_param: impl Into<String>,
    ) -> Self {
        self.map = Some(MapSpec {
            source: MapSource::Task(source.into()),
            item_param: item_param.into(),
        });
        self
    }
}

#[async_trait]
impl Task for NonBlockingTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn depends_on(&self) -> Vec<String> {
        self.depends_on.clone()
    }

    fn policy(&self) -> ExecutionPolicy {
        self.policy.clone()
    }

    fn map(&self) -> Option<MapSpec> {
        self.map.clone()
    }

    async fn invoke(
        &self,
        _ctx: CancellationToken,
        args: TaskArgs,
    ) -> Result<TaskValue, WoveError> {
        (self.body)(args).await
    }
}

/// A task whose body blocks. Dispatched through the runtime's blocking
/// pool so it does not stall the cooperative scheduler. A timed-out
/// attempt's body keeps running on the pool; only its result is discarded.
pub struct BlockingTask {
    name: String,
    depends_on: Vec<String>,
    policy: ExecutionPolicy,
    map: Option<MapSpec>,
    body: Arc<BlockingBody>,
}

impl BlockingTask {
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(TaskArgs) -> Result<TaskValue, WoveError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            depends_on: Vec::new(),
            policy: ExecutionPolicy::default(),
            map: None,
            body: Arc::new(body),
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.policy.retries = Some(retries);
        self
    }

    pub fn backoff(mut self, backoff: Duration) -> Self {
        self.policy.backoff = Some(backoff);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.policy.timeout = Some(timeout);
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.policy.workers = Some(workers);
        self
    }

    pub fn limit_per_minute(mut self, limit: u32) -> Self {
        self.policy.limit_per_minute = Some(limit);
        self
    }

    pub fn map_over(mut self, items: Vec<TaskValue>, item_param: impl Into<String>) -> Self {
        self.map = Some(MapSpec {
            source: MapSource::Literal(items),
            item_param: item_param.into(),
        });
        self
    }

    pub fn map_over_task(
        mut self,
        source: impl Into<String>,
        item_param: impl Into<String>,
    ) -> Self {
        self.map = Some(MapSpec {
            source: MapSource::Task(source.into()),
            item_param: item_param.into(),
        });
        self
    }
}

#[async_trait]
impl Task for BlockingTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn depends_on(&self) -> Vec<String> {
        self.depends_on.clone()
    }

    fn policy(&self) -> ExecutionPolicy {
        self.policy.clone()
    }

    fn map(&self) -> Option<MapSpec> {
        self.map.clone()
    }

    async fn invoke(
        &self,
        _ctx: CancellationToken,
        args: TaskArgs,
    ) -> Result<TaskValue, WoveError> {
        let body = Arc::clone(&self.body);
        tokio::task::spawn_blocking(move || body(args))
            .await
            .map_err(|e| WoveError::TaskExecution(format!("blocking task panicked: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_overlay_keeps_earlier_values() {
        let earlier = ExecutionPolicy {
            retries: Some(2),
            timeout: Some(Duration::from_secs(5)),
            ..Default::default()
        };
        let later = ExecutionPolicy {
            timeout: Some(Duration::from_secs(1)),
            ..Default::default()
        };
        let merged = later.or(&earlier);
        assert_eq!(merged.retries, Some(2));
        assert_eq!(merged.timeout, Some(Duration::from_secs(1)));
        assert!(merged.workers.is_none());
    }

    #[test]
    fn throttle_policy_requires_map_source() {
        let policy = ExecutionPolicy {
            workers: Some(4),
            ..Default::default()
        };
        assert!(policy.validate("plain", false).is_err());
        assert!(policy.validate("mapped", true).is_ok());
    }

    #[test]
    fn zero_valued_policy_fields_are_rejected() {
        let policy = ExecutionPolicy {
            timeout: Some(Duration::ZERO),
            ..Default::default()
        };
        assert!(policy.validate("t", false).is_err());

        let policy = ExecutionPolicy {
            limit_per_minute: Some(0),
            ..Default::default()
        };
        assert!(policy.validate("t", true).is_err());
    }
}
