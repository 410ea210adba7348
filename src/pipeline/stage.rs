//! Pipeline stage trait

use anyhow::Result;
use async_trait::async_trait;

/// A long-running unit of the receive pipeline
#[async_trait]
pub trait PipelineStage: Send + Sync {
    /// Run the stage until it is cancelled or its output closes
    async fn run(&mut self) -> Result<()>;

    /// Get the name of this stage for logging
    fn name(&self) -> &'static str;

    /// Gracefully shutdown the stage
    async fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}
