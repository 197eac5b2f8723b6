use futures::future::BoxFuture;
use tokio::sync::mpsc;

use flowrun_core::{StepError, ValueRef};

/// Sink for diagnostic log lines emitted by a step implementation.
///
/// Lines are captured by the sandbox and attached to the step's log entry;
/// they never reach the host process's own logging.
#[derive(Clone)]
pub struct LogSink {
    tx: Option<mpsc::UnboundedSender<String>>,
}

impl LogSink {
    /// A sink whose lines are collected through the returned receiver.
    pub fn collector() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that discards everything.
    pub fn discard() -> Self {
        Self { tx: None }
    }

    pub fn line(&self, line: impl Into<String>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(line.into());
        }
    }
}

/// Everything a step implementation receives for one invocation.
///
/// Capabilities are explicit: the handler sees its resolved input, the
/// scoped connection value injected for this single invocation, and a log
/// sink. Nothing ambient.
pub struct StepInvocation {
    pub input: ValueRef,
    pub connection: Option<ValueRef>,
    pub logs: LogSink,
}

impl StepInvocation {
    pub fn new(input: ValueRef) -> Self {
        Self {
            input,
            connection: None,
            logs: LogSink::discard(),
        }
    }

    pub fn with_connection(mut self, connection: Option<ValueRef>) -> Self {
        self.connection = connection;
        self
    }

    pub fn with_logs(mut self, logs: LogSink) -> Self {
        self.logs = logs;
        self
    }
}

/// A loadable step implementation: one action or trigger capability.
pub trait StepHandler: Send + Sync {
    /// Validate the resolved input before execution. Failures here abort
    /// the run without invoking `execute`.
    fn validate_input(&self, _input: &ValueRef) -> Result<(), StepError> {
        Ok(())
    }

    /// Execute the step, returning its output value or a structured error.
    fn execute(&self, invocation: StepInvocation) -> BoxFuture<'static, Result<ValueRef, StepError>>;
}
