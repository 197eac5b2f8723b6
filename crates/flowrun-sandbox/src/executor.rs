use std::sync::Arc;
use std::time::{Duration, Instant};

use flowrun_core::{StepError, StepErrorKind, StepOutcome, ValueRef};
use flowrun_registry::{LogSink, StepHandler, StepInvocation};

use crate::Limits;

/// Everything observed from one sandboxed step invocation.
#[derive(Debug)]
pub struct StepExecution {
    pub outcome: StepOutcome,
    /// Diagnostic lines the step emitted, in order, truncated at the log
    /// budget.
    pub logs: Vec<String>,
    pub duration: Duration,
}

impl StepExecution {
    fn new(outcome: StepOutcome, logs: Vec<String>, started: Instant) -> Self {
        Self {
            outcome,
            logs,
            duration: started.elapsed(),
        }
    }
}

/// Executes one step's handler in an isolated task with bounded budgets.
#[derive(Debug, Default, Clone)]
pub struct SandboxedExecutor {}

impl SandboxedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the handler with the resolved input and scoped connection value.
    ///
    /// Never returns an error: every failure mode is folded into the
    /// outcome (`Timeout`, `ResourceExceeded`, `Thrown`, `Crash`).
    pub async fn execute(
        &self,
        handler: Arc<dyn StepHandler>,
        input: ValueRef,
        connection: Option<ValueRef>,
        limits: &Limits,
    ) -> StepExecution {
        let started = Instant::now();
        let (logs, mut log_rx) = LogSink::collector();
        let invocation = StepInvocation::new(input)
            .with_connection(connection)
            .with_logs(logs);

        // The handler runs on its own task so a panic is contained and a
        // timeout can abort it without affecting other in-flight steps.
        let task = tokio::spawn(handler.execute(invocation));
        let abort = task.abort_handle();

        let outcome = match tokio::time::timeout(limits.timeout, task).await {
            Err(_elapsed) => {
                abort.abort();
                StepOutcome::Failed {
                    error: StepError::new(
                        StepErrorKind::Timeout,
                        format!(
                            "step exceeded wall-clock budget of {}ms",
                            limits.timeout.as_millis()
                        ),
                    ),
                }
            }
            Ok(Err(join_err)) => {
                let message = if join_err.is_panic() {
                    "step execution context panicked"
                } else {
                    "step execution context was cancelled"
                };
                StepOutcome::Failed {
                    error: StepError::new(StepErrorKind::Crash, message),
                }
            }
            Ok(Ok(Err(error))) => StepOutcome::Failed { error },
            Ok(Ok(Ok(output))) => match output_size(&output) {
                size if size > limits.max_output_bytes => StepOutcome::Failed {
                    error: StepError::new(
                        StepErrorKind::ResourceExceeded,
                        format!(
                            "step output of {size} bytes exceeds budget of {} bytes",
                            limits.max_output_bytes
                        ),
                    ),
                },
                _ => StepOutcome::Success { output },
            },
        };

        let mut lines = Vec::new();
        let mut truncated = false;
        while let Ok(line) = log_rx.try_recv() {
            if lines.len() < limits.max_log_lines {
                lines.push(line);
            } else {
                truncated = true;
            }
        }
        if truncated {
            tracing::debug!("step log output truncated at {} lines", limits.max_log_lines);
        }

        StepExecution::new(outcome, lines, started)
    }
}

fn output_size(output: &ValueRef) -> usize {
    serde_json::to_vec(output.as_ref())
        .map(|bytes| bytes.len())
        .unwrap_or(usize::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowrun_mock::{MockBehavior, MockHandler};
    use serde_json::json;

    fn limits_ms(ms: u64) -> Limits {
        Limits::default().with_timeout(Duration::from_millis(ms))
    }

    #[tokio::test]
    async fn test_success_with_output() {
        let handler = Arc::new(
            MockHandler::new().default_behavior(MockBehavior::output(json!({"ok": true}))),
        );
        let executor = SandboxedExecutor::new();
        let execution = executor
            .execute(handler, json!({}).into(), None, &Limits::default())
            .await;
        assert_eq!(
            execution.outcome.success().unwrap().as_ref(),
            &json!({"ok": true})
        );
    }

    #[tokio::test]
    async fn test_timeout_is_reported_with_duration() {
        let handler = Arc::new(MockHandler::new().default_behavior(MockBehavior::Sleep(
            Duration::from_secs(60),
            json!(null).into(),
        )));
        let executor = SandboxedExecutor::new();
        let limits = limits_ms(50);
        let execution = executor
            .execute(handler, json!({}).into(), None, &limits)
            .await;
        let error = execution.outcome.failed().unwrap();
        assert_eq!(error.kind, StepErrorKind::Timeout);
        assert!(execution.duration >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_panic_surfaces_as_crash() {
        let handler = Arc::new(MockHandler::new().default_behavior(MockBehavior::Panic));
        let executor = SandboxedExecutor::new();
        let execution = executor
            .execute(handler, json!({}).into(), None, &Limits::default())
            .await;
        assert_eq!(
            execution.outcome.failed().unwrap().kind,
            StepErrorKind::Crash
        );
    }

    #[tokio::test]
    async fn test_thrown_error_passes_through() {
        let error = StepError::thrown("bad credentials").with_code("AUTH");
        let handler =
            Arc::new(MockHandler::new().default_behavior(MockBehavior::Error(error.clone())));
        let executor = SandboxedExecutor::new();
        let execution = executor
            .execute(handler, json!({}).into(), None, &Limits::default())
            .await;
        assert_eq!(execution.outcome.failed(), Some(&error));
    }

    #[tokio::test]
    async fn test_output_budget_enforced() {
        let big = "x".repeat(1024);
        let handler =
            Arc::new(MockHandler::new().default_behavior(MockBehavior::output(json!(big))));
        let executor = SandboxedExecutor::new();
        let limits = Limits {
            max_output_bytes: 100,
            ..Limits::default()
        };
        let execution = executor
            .execute(handler, json!({}).into(), None, &limits)
            .await;
        assert_eq!(
            execution.outcome.failed().unwrap().kind,
            StepErrorKind::ResourceExceeded
        );
    }

    #[tokio::test]
    async fn test_logs_are_captured_in_order() {
        use flowrun_registry::{StepHandler, StepInvocation};
        use futures::FutureExt as _;

        struct Chatty;
        impl StepHandler for Chatty {
            fn execute(
                &self,
                invocation: StepInvocation,
            ) -> futures::future::BoxFuture<'static, Result<ValueRef, StepError>> {
                async move {
                    invocation.logs.line("first");
                    invocation.logs.line("second");
                    Ok(invocation.input)
                }
                .boxed()
            }
        }

        let executor = SandboxedExecutor::new();
        let execution = executor
            .execute(Arc::new(Chatty), json!({}).into(), None, &Limits::default())
            .await;
        assert_eq!(execution.logs, vec!["first", "second"]);
    }
}
