use flowrun_core::CapabilityRef;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("no handler registered for capability {0}")]
    UnknownCapability(CapabilityRef),

    #[error("capability {0} is already registered")]
    DuplicateCapability(CapabilityRef),

    #[error("unknown connection reference {0:?}")]
    UnknownConnection(String),
}

pub type Result<T, E = error_stack::Report<RegistryError>> = std::result::Result<T, E>;
