//! Built-in step capabilities available without any external piece.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt as _;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use flowrun_core::{CapabilityRef, StepError, ValueRef};
use flowrun_registry::{StepHandler, StepInvocation, StepRegistry};

/// Returns its resolved input unchanged. Useful as a terminal step and
/// for shaping data with input templates alone.
pub struct EchoStep;

impl StepHandler for EchoStep {
    fn execute(&self, invocation: StepInvocation) -> BoxFuture<'static, Result<ValueRef, StepError>> {
        async move { Ok(invocation.input) }.boxed()
    }
}

#[derive(Serialize, Deserialize, schemars::JsonSchema)]
struct DelayInput {
    /// Milliseconds to sleep before completing.
    ms: u64,
}

#[derive(Serialize, Deserialize, schemars::JsonSchema)]
struct DelayOutput {
    slept_ms: u64,
}

/// Sleeps for the requested duration. The sandbox timeout still applies.
pub struct DelayStep;

impl StepHandler for DelayStep {
    fn validate_input(&self, input: &ValueRef) -> Result<(), StepError> {
        serde_json::from_value::<DelayInput>(input.as_ref().clone())
            .map(|_| ())
            .map_err(|e| StepError::input_invalid(format!("invalid delay input: {e}")))
    }

    fn execute(&self, invocation: StepInvocation) -> BoxFuture<'static, Result<ValueRef, StepError>> {
        async move {
            let input: DelayInput = serde_json::from_value(invocation.input.as_ref().clone())
                .map_err(|e| StepError::input_invalid(format!("invalid delay input: {e}")))?;
            tokio::time::sleep(Duration::from_millis(input.ms)).await;
            let output = serde_json::to_value(DelayOutput {
                slept_ms: input.ms,
            })
            .map_err(|e| StepError::thrown(e.to_string()))?;
            Ok(output.into())
        }
        .boxed()
    }
}

#[derive(Serialize, Deserialize, schemars::JsonSchema)]
struct LogInput {
    message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    level: Option<String>,
}

/// Emits a line to the step's captured log and passes the message through.
pub struct LogStep;

impl StepHandler for LogStep {
    fn validate_input(&self, input: &ValueRef) -> Result<(), StepError> {
        serde_json::from_value::<LogInput>(input.as_ref().clone())
            .map(|_| ())
            .map_err(|e| StepError::input_invalid(format!("invalid log input: {e}")))
    }

    fn execute(&self, invocation: StepInvocation) -> BoxFuture<'static, Result<ValueRef, StepError>> {
        async move {
            let input: LogInput = serde_json::from_value(invocation.input.as_ref().clone())
                .map_err(|e| StepError::input_invalid(format!("invalid log input: {e}")))?;
            let level = input.level.as_deref().unwrap_or("info");
            invocation.logs.line(format!("[{level}] {}", input.message));
            Ok(serde_json::json!({ "message": input.message }).into())
        }
        .boxed()
    }
}

/// Register all built-in capabilities under the `core` piece.
pub fn register_builtins(registry: &mut StepRegistry) -> flowrun_registry::Result<()> {
    registry.register(CapabilityRef::new("core", "echo", 1), Arc::new(EchoStep))?;
    registry.register(CapabilityRef::new("core", "delay", 1), Arc::new(DelayStep))?;
    registry.register(CapabilityRef::new("core", "log", 1), Arc::new(LogStep))?;
    Ok(())
}
