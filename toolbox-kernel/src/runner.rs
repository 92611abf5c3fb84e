//! Seam between the scheduler and whatever executes a handler.

use async_trait::async_trait;
use toolbox_primitives::ToolId;
use toolbox_sandbox::{Inputs, Outputs, Sandbox, SandboxResult, UpdateCallback};

/// Executes one handler invocation.
#[async_trait]
pub trait HandlerRunner: Send + Sync {
    /// Tool whose handler this runner invokes.
    fn tool_id(&self) -> ToolId;

    /// Runs the handler once.
    async fn run(
        &self,
        inputs: &Inputs,
        changed: Option<&str>,
        update: Option<UpdateCallback>,
    ) -> SandboxResult<Option<Outputs>>;
}

#[async_trait]
impl HandlerRunner for Sandbox {
    fn tool_id(&self) -> ToolId {
        self.definition().id()
    }

    async fn run(
        &self,
        inputs: &Inputs,
        changed: Option<&str>,
        update: Option<UpdateCallback>,
    ) -> SandboxResult<Option<Outputs>> {
        Sandbox::run(self, inputs, changed, update).await
    }
}
