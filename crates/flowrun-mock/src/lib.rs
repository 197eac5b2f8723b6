//! Mock step handlers used by engine tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt as _;

use flowrun_core::{StepError, ValueRef};
use flowrun_registry::{StepHandler, StepInvocation};

/// What a mock capability does for a given input.
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Return the given output.
    Output(ValueRef),
    /// Fail with the given error.
    Error(StepError),
    /// Sleep, then return the given output.
    Sleep(Duration, ValueRef),
    /// Panic inside the sandbox.
    Panic,
}

impl MockBehavior {
    pub fn output(value: impl Into<ValueRef>) -> Self {
        Self::Output(value.into())
    }
}

/// A scripted handler mapping serialized inputs to behaviors.
///
/// Inputs without a scripted behavior fall back to the default behavior
/// (echoing the input back).
#[derive(Default)]
pub struct MockHandler {
    behaviors: HashMap<String, MockBehavior>,
    default: Option<MockBehavior>,
    invocations: AtomicU32,
}

impl MockHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn behavior(mut self, input: impl Into<ValueRef>, behavior: MockBehavior) -> Self {
        self.behaviors
            .insert(Self::key(&input.into()), behavior);
        self
    }

    pub fn default_behavior(mut self, behavior: MockBehavior) -> Self {
        self.default = Some(behavior);
        self
    }

    /// How many times `execute` has been invoked, across all inputs.
    pub fn invocations(&self) -> u32 {
        self.invocations.load(Ordering::SeqCst)
    }

    fn key(input: &ValueRef) -> String {
        serde_json::to_string(input.as_ref()).unwrap_or_default()
    }
}

impl StepHandler for MockHandler {
    fn execute(
        &self,
        invocation: StepInvocation,
    ) -> BoxFuture<'static, Result<ValueRef, StepError>> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let behavior = self
            .behaviors
            .get(&Self::key(&invocation.input))
            .or(self.default.as_ref())
            .cloned();
        async move {
            match behavior {
                None => Ok(invocation.input),
                Some(MockBehavior::Output(output)) => Ok(output),
                Some(MockBehavior::Error(error)) => Err(error),
                Some(MockBehavior::Sleep(duration, output)) => {
                    tokio::time::sleep(duration).await;
                    Ok(output)
                }
                Some(MockBehavior::Panic) => panic!("mock handler panic"),
            }
        }
        .boxed()
    }
}

/// Echoes the resolved input back as the output.
pub struct EchoHandler;

impl StepHandler for EchoHandler {
    fn execute(
        &self,
        invocation: StepInvocation,
    ) -> BoxFuture<'static, Result<ValueRef, StepError>> {
        async move { Ok(invocation.input) }.boxed()
    }
}

/// Fails a configurable number of times before succeeding; used to test
/// per-step retry.
pub struct FlakyHandler {
    failures_before_success: u32,
    attempts: Mutex<u32>,
    output: ValueRef,
}

impl FlakyHandler {
    pub fn new(failures_before_success: u32, output: impl Into<ValueRef>) -> Self {
        Self {
            failures_before_success,
            attempts: Mutex::new(0),
            output: output.into(),
        }
    }
}

impl StepHandler for FlakyHandler {
    fn execute(
        &self,
        _invocation: StepInvocation,
    ) -> BoxFuture<'static, Result<ValueRef, StepError>> {
        let attempt = {
            let mut attempts = self.attempts.lock().expect("attempts lock");
            *attempts += 1;
            *attempts
        };
        let result = if attempt <= self.failures_before_success {
            Err(StepError::thrown(format!("flaky failure on attempt {attempt}")))
        } else {
            Ok(self.output.clone())
        };
        async move { result }.boxed()
    }
}
