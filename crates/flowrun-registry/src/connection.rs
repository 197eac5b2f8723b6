use std::collections::HashMap;

use error_stack::report;
use futures::future::BoxFuture;
use futures::FutureExt as _;

use flowrun_core::ValueRef;

use crate::{RegistryError, Result};

/// External provider of scoped connection/secret values.
///
/// Given a connection reference declared on a step, returns the credential
/// value that is visible only inside the sandbox for that one invocation.
/// Authentication itself is the provider's concern, not the engine's.
pub trait ConnectionProvider: Send + Sync {
    fn connection(&self, reference: &str) -> BoxFuture<'_, Result<ValueRef>>;
}

/// Static in-memory provider, used by tests and single-process setups.
#[derive(Default)]
pub struct StaticConnections {
    values: HashMap<String, ValueRef>,
}

impl StaticConnections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, reference: impl Into<String>, value: impl Into<ValueRef>) -> Self {
        self.values.insert(reference.into(), value.into());
        self
    }
}

impl ConnectionProvider for StaticConnections {
    fn connection(&self, reference: &str) -> BoxFuture<'_, Result<ValueRef>> {
        let result = self
            .values
            .get(reference)
            .cloned()
            .ok_or_else(|| report!(RegistryError::UnknownConnection(reference.to_string())));
        async move { result }.boxed()
    }
}
