//! Run lifecycle observers.

use std::sync::{Arc, Mutex, PoisonError};

use toolbox_primitives::ToolId;
use toolbox_sandbox::{Outputs, SandboxError};
use tracing::{debug, warn};

/// Lifecycle event emitted by a scheduler.
#[derive(Debug)]
pub enum RunEvent<'a> {
    /// A request left the queue and its handler is about to run.
    Started,
    /// The handler returned.
    Succeeded {
        /// Returned outputs, if any.
        outputs: Option<&'a Outputs>,
    },
    /// The handler failed.
    Failed {
        /// Failure cause.
        error: &'a SandboxError,
    },
    /// Requests were dropped before they started.
    Discarded {
        /// Number of dropped requests.
        count: usize,
    },
}

/// Observer invoked for every run lifecycle event.
pub trait RunObserver: Send + Sync {
    /// Records an event for the supplied tool.
    fn on_event(&self, tool_id: ToolId, event: &RunEvent<'_>);
}

/// Observer that emits run events to the tracing system.
#[derive(Debug, Default)]
pub struct TracingRunObserver;

impl RunObserver for TracingRunObserver {
    fn on_event(&self, tool_id: ToolId, event: &RunEvent<'_>) {
        match event {
            RunEvent::Started => debug!(%tool_id, "run started"),
            RunEvent::Succeeded { outputs } => debug!(
                %tool_id,
                outputs = outputs.map_or(0, Outputs::len),
                "run succeeded"
            ),
            RunEvent::Failed { error } => warn!(
                %tool_id,
                category = ?error.category(),
                error = %error,
                "run failed"
            ),
            RunEvent::Discarded { count } => debug!(%tool_id, count, "queued runs discarded"),
        }
    }
}

/// Owned copy of a [`RunEvent`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordedEvent {
    /// See [`RunEvent::Started`].
    Started,
    /// See [`RunEvent::Succeeded`]; carries the outputs rendered as JSON text.
    Succeeded(Option<String>),
    /// See [`RunEvent::Failed`]; carries the error message.
    Failed(String),
    /// See [`RunEvent::Discarded`].
    Discarded(usize),
}

impl From<&RunEvent<'_>> for RecordedEvent {
    fn from(event: &RunEvent<'_>) -> Self {
        match event {
            RunEvent::Started => Self::Started,
            RunEvent::Succeeded { outputs } => {
                Self::Succeeded(outputs.map(|outputs| outputs.to_json().to_string()))
            }
            RunEvent::Failed { error } => Self::Failed(error.to_string()),
            RunEvent::Discarded { count } => Self::Discarded(*count),
        }
    }
}

/// Observer that records events in memory, for status panes and tests.
#[derive(Debug, Default)]
pub struct CollectingRunObserver {
    events: Mutex<Vec<(ToolId, RecordedEvent)>>,
}

impl CollectingRunObserver {
    /// Creates an empty observer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of the recorded events without tool ids.
    #[must_use]
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, event)| event.clone())
            .collect()
    }

    /// Returns the events recorded for one tool.
    #[must_use]
    pub fn events_for(&self, tool_id: ToolId) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(id, _)| *id == tool_id)
            .map(|(_, event)| event.clone())
            .collect()
    }
}

impl RunObserver for CollectingRunObserver {
    fn on_event(&self, tool_id: ToolId, event: &RunEvent<'_>) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((tool_id, event.into()));
    }
}

/// Composite observer that forwards events to a collection of observers.
#[derive(Default)]
pub struct CompositeRunObserver {
    observers: Vec<Arc<dyn RunObserver>>,
}

impl CompositeRunObserver {
    /// Creates a new composite observer from the supplied list.
    #[must_use]
    pub fn new<I>(observers: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn RunObserver>>,
    {
        Self {
            observers: observers.into_iter().collect(),
        }
    }

    /// Adds an observer to the composite set.
    pub fn push(&mut self, observer: Arc<dyn RunObserver>) {
        self.observers.push(observer);
    }
}

impl RunObserver for CompositeRunObserver {
    fn on_event(&self, tool_id: ToolId, event: &RunEvent<'_>) {
        for observer in &self.observers {
            observer.on_event(tool_id, event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_forwards_to_every_observer() {
        let first = Arc::new(CollectingRunObserver::new());
        let second = Arc::new(CollectingRunObserver::new());
        let composite = CompositeRunObserver::new([
            Arc::new(TracingRunObserver) as Arc<dyn RunObserver>,
            Arc::clone(&first) as Arc<dyn RunObserver>,
            Arc::clone(&second) as Arc<dyn RunObserver>,
        ]);

        let tool_id = ToolId::random();
        composite.on_event(tool_id, &RunEvent::Started);
        composite.on_event(tool_id, &RunEvent::Discarded { count: 2 });

        let expected = [RecordedEvent::Started, RecordedEvent::Discarded(2)];
        assert_eq!(first.events(), expected);
        assert_eq!(second.events_for(tool_id), expected);
        assert!(second.events_for(ToolId::random()).is_empty());
    }

    #[test]
    fn failures_record_their_message() {
        let observer = CollectingRunObserver::new();
        let error = SandboxError::MissingEntryPoint {
            tool: "adder".into(),
        };
        observer.on_event(ToolId::random(), &RunEvent::Failed { error: &error });

        assert_eq!(observer.events(), [RecordedEvent::Failed(error.to_string())]);
    }
}
