use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::task::ExecutionPolicy;
use crate::{BoxTask, TaskArgs, TaskValue, WoveError};

/// One invocation context: `retries + 1` attempts, each bounded by the
/// per-attempt timeout. A timed-out attempt is just a failed attempt. On
/// exhaustion the last attempt's error is returned as-is; the caller owns
/// recording it.
pub(crate) async fn run_attempts(
    ctx: CancellationToken,
    name: &str,
    task: &BoxTask,
    policy: &ExecutionPolicy,
    args: &TaskArgs,
) -> Result<TaskValue, WoveError> {
    let attempts = policy.retries.unwrap_or(0) + 1;
    let mut attempt = 0u32;

    loop {
        if ctx.is_cancelled() {
            return Err(WoveError::ContextCancelled(format!(
                "task {name} cancelled before attempt {}",
                attempt + 1
            )));
        }

        let invocation = task.invoke(ctx.clone(), args.clone());
        let outcome = match policy.timeout {
            Some(limit) => match timeout(limit, invocation).await {
                Ok(result) => result,
                Err(_) => Err(WoveError::AttemptTimeout {
                    task: name.to_string(),
                    timeout: limit,
                }),
            },
            None => invocation.await,
        };

        match outcome {
            Ok(value) => {
                if attempt > 0 {
                    debug!(task = name, attempt = attempt + 1, "recovered after retry");
                }
                return Ok(value);
            }
            Err(error) => {
                attempt += 1;
                if attempt >= attempts {
                    return Err(error);
                }
                warn!(
                    task = name,
                    attempt,
                    remaining = attempts - attempt,
                    error = %error,
                    "attempt failed, retrying"
                );
                if let Some(delay) = policy.backoff {
                    tokio::select! {
                        _ = ctx.cancelled() => {
                            return Err(WoveError::ContextCancelled(format!(
                                "task {name} cancelled during retry wait"
                            )));
                        }
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
    }
}
