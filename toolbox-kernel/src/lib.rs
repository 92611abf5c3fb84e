//! Execution kernel for user-authored tools.
//!
//! A [`Scheduler`] serializes run requests against one [`HandlerRunner`] and
//! applies the configured discard strategy. [`ToolKernel`] wires a
//! [`Sandbox`] behind a scheduler.

#![warn(missing_docs, clippy::pedantic)]

mod observer;
mod runner;
mod scheduler;

use std::sync::Arc;

use toolbox_primitives::{SchedulingStrategy, ToolId};
use toolbox_sandbox::Sandbox;

pub use observer::{
    CollectingRunObserver, CompositeRunObserver, RecordedEvent, RunEvent, RunObserver,
    TracingRunObserver,
};
pub use runner::HandlerRunner;
pub use scheduler::{
    ExecutionRequest, FailureHook, RunHooks, RunOutcome, RunTicket, Scheduler, SchedulerConfig,
    StartHook, SuccessHook,
};

/// One tool's sandbox behind its scheduler.
#[derive(Debug, Clone)]
pub struct ToolKernel {
    sandbox: Arc<Sandbox>,
    scheduler: Scheduler,
}

impl ToolKernel {
    /// Creates a kernel reporting run events to [`TracingRunObserver`].
    #[must_use]
    pub fn new(sandbox: Sandbox, strategy: SchedulingStrategy) -> Self {
        Self::with_observer(sandbox, strategy, Arc::new(TracingRunObserver))
    }

    /// Creates a kernel reporting run events to `observer`.
    #[must_use]
    pub fn with_observer(
        sandbox: Sandbox,
        strategy: SchedulingStrategy,
        observer: Arc<dyn RunObserver>,
    ) -> Self {
        let sandbox = Arc::new(sandbox);
        let scheduler = Scheduler::with_observer(
            Arc::clone(&sandbox) as Arc<dyn HandlerRunner>,
            SchedulerConfig::new(strategy),
            observer,
        );
        Self { sandbox, scheduler }
    }

    /// Returns the identifier of the wrapped tool.
    #[must_use]
    pub fn tool_id(&self) -> ToolId {
        self.sandbox.definition().id()
    }

    /// Returns the wrapped sandbox.
    #[must_use]
    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    /// Returns the active scheduling strategy.
    #[must_use]
    pub fn strategy(&self) -> SchedulingStrategy {
        self.scheduler.config().strategy()
    }

    /// Queues a run request.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime; see [`Scheduler::commit`].
    pub fn commit(&self, request: ExecutionRequest) -> RunTicket {
        self.scheduler.commit(request)
    }

    /// Returns `true` while a request is queued or running.
    #[must_use]
    pub fn has_pending_requests(&self) -> bool {
        self.scheduler.has_pending_requests()
    }

    /// Discards every queued request that has not started.
    pub fn clear_queue(&self) -> usize {
        self.scheduler.clear_queue()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;
    use toolbox_capabilities::{CapabilityLoader, StaticFetcher};
    use toolbox_primitives::ToolDefinition;
    use toolbox_sandbox::Inputs;

    const COUNTER: &str = r"
        local total = 0
        function handler(inputs)
          total = total + (inputs.step or 1)
          return { total = total }
        end
    ";

    async fn kernel(strategy: SchedulingStrategy, observer: Arc<dyn RunObserver>) -> ToolKernel {
        let sandbox = Sandbox::builder(ToolDefinition::new(ToolId::random(), COUNTER))
            .loader(
                CapabilityLoader::builder()
                    .fetcher(Arc::new(StaticFetcher::new()))
                    .build(),
            )
            .build()
            .await
            .unwrap();
        ToolKernel::with_observer(sandbox, strategy, observer)
    }

    #[tokio::test]
    async fn counter_advances_through_the_scheduler() {
        let observer = Arc::new(CollectingRunObserver::new());
        let kernel = kernel(SchedulingStrategy::QueueAll, Arc::clone(&observer) as _).await;

        let first = kernel.commit(ExecutionRequest::new(Inputs::new())).await;
        let second = kernel
            .commit(ExecutionRequest::new(Inputs::new()).with_changed("step"))
            .await;

        assert_eq!(first.outputs().unwrap().to_json(), json!({ "total": 1 }));
        assert_eq!(second.outputs().unwrap().to_json(), json!({ "total": 2 }));
        assert_eq!(
            observer.events_for(kernel.tool_id()),
            [
                RecordedEvent::Started,
                RecordedEvent::Succeeded(Some(r#"{"total":1}"#.into())),
                RecordedEvent::Started,
                RecordedEvent::Succeeded(Some(r#"{"total":2}"#.into())),
            ]
        );
        assert!(!kernel.has_pending_requests());
    }

    #[tokio::test]
    async fn defaults_to_keep_latest() {
        let kernel = kernel(SchedulingStrategy::default(), Arc::new(TracingRunObserver)).await;
        assert_eq!(kernel.strategy(), SchedulingStrategy::KeepLatest);
        assert_eq!(kernel.clear_queue(), 0);
    }
}
