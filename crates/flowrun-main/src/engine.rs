use std::sync::Arc;

use error_stack::ResultExt as _;
use tokio::sync::watch;

use flowrun_interpreter::FlowInterpreter;
use flowrun_queue::Dispatcher;
use flowrun_registry::{StaticConnections, StepRegistry};
use flowrun_state::InMemoryRunStore;
use flowrun_worker::{LocalBroker, Worker};

use crate::builtins::register_builtins;
use crate::flowrun_config::FlowrunConfig;
use crate::{MainError, Result};

/// A fully wired in-process engine: store, dispatcher, and one worker.
pub struct Engine {
    pub store: Arc<InMemoryRunStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub worker: Arc<Worker>,
}

impl Engine {
    pub fn build(config: &FlowrunConfig) -> Result<Self> {
        let mut registry = StepRegistry::new();
        register_builtins(&mut registry).change_context(MainError::RegisterBuiltins)?;

        let mut connections = StaticConnections::new();
        for (name, value) in &config.connections {
            connections = connections.with(name.clone(), value.clone());
        }

        let store = Arc::new(InMemoryRunStore::new());
        let dispatcher = Dispatcher::new(store.clone(), config.queue_config());

        let mut interpreter = FlowInterpreter::new(
            store.clone(),
            Arc::new(registry),
            Arc::new(connections),
        )
        .with_limits(config.limits());
        if let Some(deadline) = config.run_deadline() {
            interpreter = interpreter.with_run_deadline(deadline);
        }

        let worker = Arc::new(Worker::new(
            LocalBroker::new(dispatcher.clone()),
            Arc::new(interpreter),
            config.worker_config(),
        ));

        Ok(Self {
            store,
            dispatcher,
            worker,
        })
    }

    /// Start the worker loop; returns the shutdown handle and the task.
    pub fn start_worker(&self) -> (watch::Sender<bool>, tokio::task::JoinHandle<()>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(self.worker.clone().run(shutdown_rx));
        (shutdown_tx, handle)
    }

    /// Stop the worker and the dispatcher's sweeper.
    pub async fn shutdown(
        &self,
        shutdown_tx: watch::Sender<bool>,
        handle: tokio::task::JoinHandle<()>,
    ) {
        let _ = shutdown_tx.send(true);
        let _ = handle.await;
        self.dispatcher.shutdown().await;
    }
}
