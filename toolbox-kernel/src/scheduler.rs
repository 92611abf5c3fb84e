//! Serialized execution of run requests against a single handler.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinError;
use toolbox_primitives::{SchedulingStrategy, ToolId};
use toolbox_sandbox::{Inputs, Outputs, SandboxError, UpdateCallback};

use crate::observer::{RunEvent, RunObserver, TracingRunObserver};
use crate::runner::HandlerRunner;

/// Called when a request leaves the queue.
pub type StartHook = Box<dyn FnOnce() + Send>;
/// Called with the outputs of a successful run.
pub type SuccessHook = Box<dyn FnOnce(Option<&Outputs>) + Send>;
/// Called with the cause of a failed run.
pub type FailureHook = Box<dyn FnOnce(&SandboxError) + Send>;

/// Optional per-request lifecycle callbacks. Discarded requests fire none of them.
#[derive(Default)]
pub struct RunHooks {
    on_start: Option<StartHook>,
    on_success: Option<SuccessHook>,
    on_error: Option<FailureHook>,
}

impl RunHooks {
    /// Creates an empty set of hooks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the start hook.
    #[must_use]
    pub fn on_start(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_start = Some(Box::new(hook));
        self
    }

    /// Sets the success hook.
    #[must_use]
    pub fn on_success(mut self, hook: impl FnOnce(Option<&Outputs>) + Send + 'static) -> Self {
        self.on_success = Some(Box::new(hook));
        self
    }

    /// Sets the failure hook.
    #[must_use]
    pub fn on_error(mut self, hook: impl FnOnce(&SandboxError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(hook));
        self
    }
}

impl fmt::Debug for RunHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunHooks")
            .field("on_start", &self.on_start.is_some())
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// One invocation waiting for its turn.
pub struct ExecutionRequest {
    inputs: Inputs,
    changed: Option<String>,
    update: Option<UpdateCallback>,
    hooks: RunHooks,
}

impl ExecutionRequest {
    /// Creates a request for the given input values.
    #[must_use]
    pub fn new(inputs: Inputs) -> Self {
        Self {
            inputs,
            changed: None,
            update: None,
            hooks: RunHooks::default(),
        }
    }

    /// Names the input whose change triggered this run.
    #[must_use]
    pub fn with_changed(mut self, input_id: impl Into<String>) -> Self {
        self.changed = Some(input_id.into());
        self
    }

    /// Sets the callback receiving partial outputs while the handler runs.
    #[must_use]
    pub fn with_update(mut self, update: UpdateCallback) -> Self {
        self.update = Some(update);
        self
    }

    /// Attaches lifecycle hooks.
    #[must_use]
    pub fn with_hooks(mut self, hooks: RunHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Returns the input values.
    #[must_use]
    pub fn inputs(&self) -> &Inputs {
        &self.inputs
    }

    /// Returns the changed input id, if any.
    #[must_use]
    pub fn changed(&self) -> Option<&str> {
        self.changed.as_deref()
    }
}

impl fmt::Debug for ExecutionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionRequest")
            .field("inputs", &self.inputs)
            .field("changed", &self.changed)
            .field("hooks", &self.hooks)
            .finish_non_exhaustive()
    }
}

/// Final state of a committed request.
#[derive(Clone, Debug)]
pub enum RunOutcome {
    /// The handler returned.
    Completed(Option<Outputs>),
    /// The handler failed; the error is passed through unchanged.
    Failed(SandboxError),
    /// The request was dropped before it started.
    Discarded,
}

impl RunOutcome {
    /// Returns `true` for discarded requests.
    #[must_use]
    pub fn is_discarded(&self) -> bool {
        matches!(self, Self::Discarded)
    }

    /// Returns the outputs of a completed run.
    #[must_use]
    pub fn outputs(&self) -> Option<&Outputs> {
        match self {
            Self::Completed(outputs) => outputs.as_ref(),
            _ => None,
        }
    }

    /// Returns the error of a failed run.
    #[must_use]
    pub fn error(&self) -> Option<&SandboxError> {
        match self {
            Self::Failed(error) => Some(error),
            _ => None,
        }
    }
}

/// Handle resolving to a request's [`RunOutcome`].
///
/// Dropping the ticket does not cancel the request.
#[derive(Debug)]
pub struct RunTicket {
    receiver: oneshot::Receiver<RunOutcome>,
}

impl Future for RunTicket {
    type Output = RunOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|outcome| outcome.unwrap_or(RunOutcome::Discarded))
    }
}

/// Scheduler settings.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulerConfig {
    strategy: SchedulingStrategy,
}

impl SchedulerConfig {
    /// Creates a configuration with the supplied strategy.
    #[must_use]
    pub const fn new(strategy: SchedulingStrategy) -> Self {
        Self { strategy }
    }

    /// Returns the configured strategy.
    #[must_use]
    pub const fn strategy(self) -> SchedulingStrategy {
        self.strategy
    }
}

struct Pending {
    request: ExecutionRequest,
    reply: oneshot::Sender<RunOutcome>,
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<Pending>,
    running: bool,
}

struct Shared {
    runner: Arc<dyn HandlerRunner>,
    observer: Arc<dyn RunObserver>,
    config: SchedulerConfig,
    state: Mutex<QueueState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tool_id(&self) -> ToolId {
        self.runner.tool_id()
    }

    fn discarded(&self, dropped: Vec<Pending>) -> usize {
        let count = dropped.len();
        // Dropping the senders resolves the tickets as discarded.
        drop(dropped);
        if count > 0 {
            self.observer
                .on_event(self.tool_id(), &RunEvent::Discarded { count });
        }
        count
    }

    async fn execute(&self, request: ExecutionRequest) -> RunOutcome {
        let ExecutionRequest {
            inputs,
            changed,
            update,
            hooks,
        } = request;
        let tool_id = self.tool_id();

        self.observer.on_event(tool_id, &RunEvent::Started);
        if let Some(on_start) = hooks.on_start {
            on_start();
        }

        // The run gets its own task so a panic fails only this request.
        let runner = Arc::clone(&self.runner);
        let run = tokio::spawn(async move {
            runner.run(&inputs, changed.as_deref(), update).await
        });
        let result = run.await.unwrap_or_else(|err| {
            Err(SandboxError::Panicked {
                tool: tool_id.to_string(),
                message: panic_message(err),
            })
        });

        match result {
            Ok(outputs) => {
                self.observer.on_event(
                    tool_id,
                    &RunEvent::Succeeded {
                        outputs: outputs.as_ref(),
                    },
                );
                if let Some(on_success) = hooks.on_success {
                    on_success(outputs.as_ref());
                }
                RunOutcome::Completed(outputs)
            }
            Err(error) => {
                self.observer
                    .on_event(tool_id, &RunEvent::Failed { error: &error });
                if let Some(on_error) = hooks.on_error {
                    on_error(&error);
                }
                RunOutcome::Failed(error)
            }
        }
    }

    /// Processes requests one at a time until the queue is empty.
    async fn drain(self: Arc<Self>, first: Pending) {
        let mut guard = DrainGuard {
            shared: Arc::clone(&self),
            finished: false,
        };
        let mut current = Some(first);
        while let Some(Pending { request, reply }) = current.take() {
            let outcome = self.execute(request).await;
            {
                let mut state = self.lock();
                current = state.queue.pop_front();
                if current.is_none() {
                    state.running = false;
                }
            }
            // The caller may have dropped its ticket.
            let _ = reply.send(outcome);
        }
        guard.finished = true;
    }
}

/// Hands the queue to a fresh drain task when a drain stops early, for example
/// after a hook panicked, so `running` never sticks.
struct DrainGuard {
    shared: Arc<Shared>,
    finished: bool,
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let mut state = self.shared.lock();
        let next = state.queue.pop_front();
        match (next, Handle::try_current()) {
            (Some(next), Ok(handle)) => {
                drop(state);
                handle.spawn(Arc::clone(&self.shared).drain(next));
            }
            (next, _) => {
                state.running = false;
                // Without a runtime the remaining tickets resolve as discarded.
                let stranded: Vec<_> = next.into_iter().chain(state.queue.drain(..)).collect();
                drop(state);
                drop(stranded);
            }
        }
    }
}

fn panic_message(err: JoinError) -> String {
    match err.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|message| (*message).to_owned())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_owned()),
        Err(_) => "run was cancelled".to_owned(),
    }
}

/// Serializes run requests against one handler.
///
/// At most one request runs at a time. Under
/// [`SchedulingStrategy::KeepLatest`], committing evicts every request that has
/// not started yet, so a burst collapses to the in-flight run plus the newest one.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("Scheduler")
            .field("tool_id", &self.shared.tool_id())
            .field("strategy", &self.shared.config.strategy())
            .field("running", &state.running)
            .field("queued", &state.queue.len())
            .finish()
    }
}

impl Scheduler {
    /// Creates a scheduler that reports to [`TracingRunObserver`].
    #[must_use]
    pub fn new(runner: Arc<dyn HandlerRunner>, config: SchedulerConfig) -> Self {
        Self::with_observer(runner, config, Arc::new(TracingRunObserver))
    }

    /// Creates a scheduler reporting lifecycle events to `observer`.
    #[must_use]
    pub fn with_observer(
        runner: Arc<dyn HandlerRunner>,
        config: SchedulerConfig,
        observer: Arc<dyn RunObserver>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                runner,
                observer,
                config,
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    /// Returns the associated configuration.
    #[must_use]
    pub fn config(&self) -> SchedulerConfig {
        self.shared.config
    }

    /// Queues a request and starts processing if idle.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime while the scheduler is idle.
    pub fn commit(&self, request: ExecutionRequest) -> RunTicket {
        let (reply, receiver) = oneshot::channel();
        let pending = Pending { request, reply };

        let (evicted, start) = {
            let mut state = self.shared.lock();
            let evicted = match self.shared.config.strategy() {
                SchedulingStrategy::KeepLatest => state.queue.drain(..).collect(),
                SchedulingStrategy::QueueAll => Vec::new(),
            };
            if state.running {
                state.queue.push_back(pending);
                (evicted, None)
            } else {
                state.running = true;
                (evicted, Some(pending))
            }
        };

        self.shared.discarded(evicted);
        if let Some(first) = start {
            tokio::spawn(Arc::clone(&self.shared).drain(first));
        }
        RunTicket { receiver }
    }

    /// Returns `true` while a request is queued or running.
    #[must_use]
    pub fn has_pending_requests(&self) -> bool {
        let state = self.shared.lock();
        state.running || !state.queue.is_empty()
    }

    /// Discards every request that has not started; the running one is untouched.
    ///
    /// Returns the number of discarded requests.
    pub fn clear_queue(&self) -> usize {
        let dropped: Vec<_> = self.shared.lock().queue.drain(..).collect();
        self.shared.discarded(dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use crate::observer::{CollectingRunObserver, RecordedEvent};

    struct SlowRunner {
        id: ToolId,
        delay: Duration,
        in_flight: AtomicUsize,
        max_seen: AtomicUsize,
        executed: Mutex<Vec<i64>>,
    }

    impl SlowRunner {
        fn new(delay_ms: u64) -> Arc<Self> {
            Arc::new(Self {
                id: ToolId::random(),
                delay: Duration::from_millis(delay_ms),
                in_flight: AtomicUsize::new(0),
                max_seen: AtomicUsize::new(0),
                executed: Mutex::new(Vec::new()),
            })
        }

        fn executed(&self) -> Vec<i64> {
            self.executed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl HandlerRunner for SlowRunner {
        fn tool_id(&self) -> ToolId {
            self.id
        }

        async fn run(
            &self,
            inputs: &Inputs,
            _changed: Option<&str>,
            _update: Option<UpdateCallback>,
        ) -> Result<Option<Outputs>, SandboxError> {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let n = inputs["n"].as_i64().unwrap();
            self.executed.lock().unwrap().push(n);
            if inputs.contains_key("fail") {
                return Err(SandboxError::InvalidReturnShape {
                    tool: "slow".into(),
                    found: "a value of type number".into(),
                });
            }
            let mut outputs = Inputs::new();
            outputs.insert("n".into(), json!(n));
            Ok(Some(Outputs::from(outputs)))
        }
    }

    fn request(n: i64) -> ExecutionRequest {
        let mut inputs = Inputs::new();
        inputs.insert("n".into(), json!(n));
        ExecutionRequest::new(inputs)
    }

    fn scheduler(runner: &Arc<SlowRunner>, strategy: SchedulingStrategy) -> Scheduler {
        Scheduler::new(
            Arc::clone(runner) as Arc<dyn HandlerRunner>,
            SchedulerConfig::new(strategy),
        )
    }

    #[tokio::test]
    async fn queue_all_runs_everything_in_order_without_overlap() {
        let runner = SlowRunner::new(5);
        let scheduler = scheduler(&runner, SchedulingStrategy::QueueAll);

        let tickets: Vec<_> = (1..=5).map(|n| scheduler.commit(request(n))).collect();
        for (n, ticket) in (1..=5).zip(tickets) {
            let outcome = ticket.await;
            assert_eq!(outcome.outputs().unwrap().value("n"), Some(&json!(n)));
        }

        assert_eq!(runner.executed(), [1, 2, 3, 4, 5]);
        assert_eq!(runner.max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn keep_latest_runs_only_in_flight_and_newest() {
        let runner = SlowRunner::new(30);
        let scheduler = scheduler(&runner, SchedulingStrategy::KeepLatest);
        let starts = Arc::new(AtomicUsize::new(0));

        let tickets: Vec<_> = (1..=4)
            .map(|n| {
                let starts = Arc::clone(&starts);
                let hooks = RunHooks::new().on_start(move || {
                    starts.fetch_add(1, Ordering::SeqCst);
                });
                scheduler.commit(request(n).with_hooks(hooks))
            })
            .collect();

        let outcomes: Vec<RunOutcome> = collect_outcomes(tickets).await;
        assert!(outcomes[0].outputs().is_some());
        assert!(outcomes[1].is_discarded());
        assert!(outcomes[2].is_discarded());
        assert_eq!(outcomes[3].outputs().unwrap().value("n"), Some(&json!(4)));

        assert_eq!(runner.executed(), [1, 4]);
        assert_eq!(starts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn pending_flag_tracks_queue_and_execution() {
        let runner = SlowRunner::new(10);
        let scheduler = scheduler(&runner, SchedulingStrategy::QueueAll);

        assert!(!scheduler.has_pending_requests());
        let ticket = scheduler.commit(request(1));
        assert!(scheduler.has_pending_requests());
        ticket.await;
        assert!(!scheduler.has_pending_requests());
    }

    #[tokio::test]
    async fn clear_queue_spares_the_running_request() {
        let runner = SlowRunner::new(20);
        let observer = Arc::new(CollectingRunObserver::new());
        let scheduler = Scheduler::with_observer(
            Arc::clone(&runner) as Arc<dyn HandlerRunner>,
            SchedulerConfig::new(SchedulingStrategy::QueueAll),
            Arc::clone(&observer) as Arc<dyn RunObserver>,
        );

        let running = scheduler.commit(request(1));
        tokio::task::yield_now().await;
        let queued = [scheduler.commit(request(2)), scheduler.commit(request(3))];
        assert_eq!(scheduler.clear_queue(), 2);

        assert!(running.await.outputs().is_some());
        for ticket in queued {
            assert!(ticket.await.is_discarded());
        }
        assert_eq!(runner.executed(), [1]);
        assert_eq!(
            observer.events(),
            [
                RecordedEvent::Started,
                RecordedEvent::Discarded(2),
                RecordedEvent::Succeeded(Some(r#"{"n":1}"#.into())),
            ]
        );
    }

    #[tokio::test]
    async fn failures_only_affect_their_own_request() {
        let runner = SlowRunner::new(1);
        let scheduler = scheduler(&runner, SchedulingStrategy::QueueAll);
        let errors = Arc::new(AtomicUsize::new(0));

        let failing = {
            let errors = Arc::clone(&errors);
            let mut request = request(1);
            request.inputs.insert("fail".into(), json!(true));
            scheduler.commit(request.with_hooks(RunHooks::new().on_error(move |_| {
                errors.fetch_add(1, Ordering::SeqCst);
            })))
        };
        let healthy = scheduler.commit(request(2));

        assert!(matches!(
            failing.await.error(),
            Some(SandboxError::InvalidReturnShape { .. })
        ));
        assert!(healthy.await.outputs().is_some());
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    struct PanickingRunner {
        id: ToolId,
    }

    #[async_trait]
    impl HandlerRunner for PanickingRunner {
        fn tool_id(&self) -> ToolId {
            self.id
        }

        async fn run(
            &self,
            inputs: &Inputs,
            _changed: Option<&str>,
            _update: Option<UpdateCallback>,
        ) -> Result<Option<Outputs>, SandboxError> {
            if inputs.contains_key("panic") {
                panic!("handler exploded");
            }
            Ok(Some(Outputs::from(inputs.clone())))
        }
    }

    #[tokio::test]
    async fn panicking_runs_fail_without_stalling_the_queue() {
        let runner = Arc::new(PanickingRunner {
            id: ToolId::random(),
        });
        let observer = Arc::new(CollectingRunObserver::new());
        let scheduler = Scheduler::with_observer(
            runner as Arc<dyn HandlerRunner>,
            SchedulerConfig::new(SchedulingStrategy::QueueAll),
            Arc::clone(&observer) as Arc<dyn RunObserver>,
        );
        let errors = Arc::new(AtomicUsize::new(0));

        let panicking = {
            let errors = Arc::clone(&errors);
            let mut request = request(1);
            request.inputs.insert("panic".into(), json!(true));
            scheduler.commit(request.with_hooks(RunHooks::new().on_error(move |_| {
                errors.fetch_add(1, Ordering::SeqCst);
            })))
        };
        let healthy = scheduler.commit(request(2));

        let outcome = panicking.await;
        assert!(matches!(
            outcome.error(),
            Some(SandboxError::Panicked { message, .. }) if message.contains("handler exploded")
        ));
        assert_eq!(healthy.await.outputs().unwrap().value("n"), Some(&json!(2)));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert!(!scheduler.has_pending_requests());
        assert!(matches!(observer.events()[1], RecordedEvent::Failed(_)));
    }

    #[tokio::test]
    async fn panicking_hooks_hand_the_queue_on() {
        let runner = SlowRunner::new(1);
        let scheduler = scheduler(&runner, SchedulingStrategy::QueueAll);

        let broken = scheduler.commit(
            request(1).with_hooks(RunHooks::new().on_start(|| panic!("start hook exploded"))),
        );
        let healthy = scheduler.commit(request(2));

        assert!(broken.await.is_discarded());
        assert_eq!(healthy.await.outputs().unwrap().value("n"), Some(&json!(2)));
        assert_eq!(runner.executed(), [2]);
        assert!(!scheduler.has_pending_requests());

        let after = scheduler.commit(request(3));
        assert!(after.await.outputs().is_some());
    }

    async fn collect_outcomes(tickets: Vec<RunTicket>) -> Vec<RunOutcome> {
        let mut outcomes = Vec::with_capacity(tickets.len());
        for ticket in tickets {
            outcomes.push(ticket.await);
        }
        outcomes
    }
}
