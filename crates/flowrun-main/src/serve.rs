use error_stack::ResultExt as _;

use flowrun_core::FlowVersion;
use flowrun_state::RunStateStore as _;

use crate::engine::Engine;
use crate::flowrun_config::FlowrunConfig;
use crate::{MainError, Result};

/// Run a resident engine until interrupted.
///
/// Flow versions given on the command line are registered up front; the
/// dispatcher is the embedding seam for anything that wants to enqueue
/// runs against this process.
pub async fn serve(config: &FlowrunConfig, versions: Vec<FlowVersion>) -> Result<()> {
    let engine = Engine::build(config)?;
    for version in versions {
        tracing::info!(flow_id = %version.flow_id, version = version.version, "registered flow version");
        engine
            .store
            .put_flow_version(version)
            .await
            .change_context(MainError::FlowExecution)?;
    }

    let (shutdown_tx, handle) = engine.start_worker();
    tracing::info!("engine serving; press ctrl-c to stop");

    tokio::signal::ctrl_c()
        .await
        .change_context(MainError::FlowExecution)?;
    tracing::info!("shutting down");
    engine.shutdown(shutdown_tx, handle).await;
    Ok(())
}
