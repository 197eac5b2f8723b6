use std::collections::HashMap;
use std::sync::Arc;

use error_stack::report;

use flowrun_core::CapabilityRef;

use crate::handler::StepHandler;
use crate::{RegistryError, Result};

/// Maps a stable `(piece, operation, version)` key to its handler.
///
/// Populated once at process start; resolution never falls back to runtime
/// reflection. The engine itself embeds no piece-specific logic.
#[derive(Default)]
pub struct StepRegistry {
    handlers: HashMap<CapabilityRef, Arc<dyn StepHandler>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        capability: CapabilityRef,
        handler: Arc<dyn StepHandler>,
    ) -> Result<()> {
        if self.handlers.contains_key(&capability) {
            return Err(report!(RegistryError::DuplicateCapability(capability)));
        }
        tracing::debug!(%capability, "registering step handler");
        self.handlers.insert(capability, handler);
        Ok(())
    }

    pub fn resolve(&self, capability: &CapabilityRef) -> Result<Arc<dyn StepHandler>> {
        self.handlers
            .get(capability)
            .cloned()
            .ok_or_else(|| report!(RegistryError::UnknownCapability(capability.clone())))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::StepInvocation;
    use flowrun_core::{StepError, ValueRef};
    use futures::future::BoxFuture;
    use futures::FutureExt as _;

    struct Echo;

    impl StepHandler for Echo {
        fn execute(
            &self,
            invocation: StepInvocation,
        ) -> BoxFuture<'static, Result<ValueRef, StepError>> {
            async move { Ok(invocation.input) }.boxed()
        }
    }

    #[test]
    fn test_register_and_resolve() {
        let mut registry = StepRegistry::new();
        let capability = CapabilityRef::new("core", "echo", 1);
        registry
            .register(capability.clone(), Arc::new(Echo))
            .unwrap();

        assert!(registry.resolve(&capability).is_ok());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = StepRegistry::new();
        let capability = CapabilityRef::new("core", "echo", 1);
        registry
            .register(capability.clone(), Arc::new(Echo))
            .unwrap();
        let err = registry
            .register(capability, Arc::new(Echo))
            .unwrap_err();
        assert!(matches!(
            err.current_context(),
            RegistryError::DuplicateCapability(_)
        ));
    }

    #[test]
    fn test_unknown_capability() {
        let registry = StepRegistry::new();
        let err = registry
            .resolve(&CapabilityRef::new("core", "missing", 1))
            .map(|_| ())
            .unwrap_err();
        assert!(matches!(
            err.current_context(),
            RegistryError::UnknownCapability(_)
        ));
    }

    #[test]
    fn test_versions_are_distinct_keys() {
        let mut registry = StepRegistry::new();
        registry
            .register(CapabilityRef::new("core", "echo", 1), Arc::new(Echo))
            .unwrap();
        registry
            .register(CapabilityRef::new("core", "echo", 2), Arc::new(Echo))
            .unwrap();
        assert_eq!(registry.len(), 2);
    }
}
