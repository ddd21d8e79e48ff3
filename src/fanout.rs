use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::runner::run_attempts;
use crate::task::{ExecutionPolicy, MapSpec};
use crate::{BoxTask, TaskArgs, TaskValue, WoveError};

/// One concurrent invocation per element, retry/timeout applied per
/// element, output order matching input order. The first element failure
/// fails the whole mapped task; the remaining element futures are dropped
/// and any values already produced are discarded.
pub(crate) async fn run_mapped(
    ctx: CancellationToken,
    name: &str,
    task: &BoxTask,
    policy: &ExecutionPolicy,
    args: &TaskArgs,
    spec: &MapSpec,
    items: Vec<TaskValue>,
) -> Result<TaskValue, WoveError> {
    let workers = policy.workers.map(|capacity| Arc::new(Semaphore::new(capacity)));
    let limit_per_minute = policy.limit_per_minute;
    debug!(
        task = name,
        items = items.len(),
        workers = ?policy.workers,
        limit_per_minute = ?limit_per_minute,
        "fanning out"
    );

    let invocations = items.into_iter().enumerate().map(|(index, item)| {
        let ctx = ctx.clone();
        let workers = workers.clone();
        let mut call_args = args.clone();
        call_args.insert(spec.item_param.clone(), item);
        let label = format!("{name}[{index}]");
        async move {
            // Fixed stagger schedule: invocation i starts no earlier than
            // i * (60 / limit) seconds in, independent of completion order.
            if let Some(limit) = limit_per_minute {
                let delay = Duration::from_secs_f64(index as f64 * 60.0 / f64::from(limit));
                if !delay.is_zero() {
                    sleep(delay).await;
                }
            }
            let _permit = match &workers {
                Some(semaphore) => Some(semaphore.acquire().await.map_err(|_| {
                    WoveError::TaskExecution(format!("{label}: worker semaphore closed"))
                })?),
                None => None,
            };
            run_attempts(ctx, &label, task, policy, &call_args).await
        }
    });

    let values = try_join_all(invocations).await?;
    Ok(TaskValue::Array(values))
}
