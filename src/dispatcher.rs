//! Transform dispatcher: the single entry point callers use
//!
//! Scripts and resource-sensitive catalog tools run in a worker process;
//! everything else runs in-process under a deadline race. Either way the
//! result passes through the normalizer, so callers see one contract.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, error, warn};

use crate::config::{EngineConfig, RoutingPolicy};
use crate::engine::{Harness, deadline_race};
use crate::isolation::{IsolatedJob, IsolationLayer};
use crate::normalize::normalize;
use crate::types::{Cancelled, ExecutionResult, FailureKind, Target, TransformRequest};

static NEXT_EXECUTION_ID: AtomicU64 = AtomicU64::new(1);

fn next_execution_id() -> u64 {
    NEXT_EXECUTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Where a request will run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    InProcess,
    Isolated,
}

/// Routes requests and owns the execution paths
#[derive(Debug, Clone, Default)]
pub struct Dispatcher {
    config: EngineConfig,
    harness: Harness,
    isolation: IsolationLayer,
}

impl Dispatcher {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            isolation: IsolationLayer::new(config.worker.clone()),
            harness: Harness::new(),
            config,
        }
    }

    /// Builder: replace the harness (e.g. to narrow capabilities)
    pub fn with_harness(mut self, harness: Harness) -> Self {
        self.harness = harness;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Decide where `target` runs under the configured policy
    pub fn route(&self, target: &Target) -> Route {
        if self.config.policy == RoutingPolicy::InProcess {
            return Route::InProcess;
        }
        match target {
            Target::Code(_) => Route::Isolated,
            Target::Tool(id) if id.entry().runs_isolated() => Route::Isolated,
            Target::Tool(_) => Route::InProcess,
        }
    }

    /// Execute a request to completion
    ///
    /// Every failure comes back as an `ExecutionResult::Failure`. `Err` means
    /// only that `cancel` fired first; callers should render nothing for it.
    pub async fn execute(
        &self,
        request: TransformRequest,
        cancel: Option<&CancellationToken>,
    ) -> Result<ExecutionResult, Cancelled> {
        let cancel = cancel.cloned().unwrap_or_default();
        let id = next_execution_id();
        self.execute_with_id(id, request, &cancel)
            .instrument(debug_span!("execution", id))
            .await
    }

    /// Start a request in the background and hand back its handle
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(&self, request: TransformRequest) -> ExecutionHandle {
        let id = next_execution_id();
        let cancel = CancellationToken::new();
        let (tx, rx) = oneshot::channel();

        let dispatcher = self.clone();
        let task_cancel = cancel.clone();
        tokio::spawn(
            async move {
                let outcome = dispatcher.execute_with_id(id, request, &task_cancel).await;
                // A closed receiver means the handle was dropped
                let _ = tx.send(outcome);
            }
            .instrument(debug_span!("execution", id)),
        );

        ExecutionHandle {
            id,
            cancel,
            outcome: Some(rx),
        }
    }

    async fn execute_with_id(
        &self,
        id: u64,
        request: TransformRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, Cancelled> {
        if cancel.is_cancelled() {
            return Err(Cancelled);
        }

        let limits = request.effective_limits(&self.config.limits);
        let route = self.route(&request.target);
        debug!(id, ?route, deadline_ms = limits.deadline_ms, "dispatching transform");

        let TransformRequest {
            target,
            input,
            options,
            ..
        } = request;

        let result = match (route, target) {
            (Route::Isolated, target) => {
                let job = IsolatedJob {
                    target,
                    input,
                    options,
                    // The worker is killed at the deadline; operations need no cap
                    limits: limits.clone().unbounded_operations(),
                };
                self.isolation
                    .run_isolated(&job, limits.deadline(), cancel)
                    .await?
            }
            (Route::InProcess, Target::Code(code)) => {
                self.harness
                    .run_until_cancelled(&code, &input, &options, &limits, cancel)
                    .await?
            }
            (Route::InProcess, Target::Tool(tool)) => {
                let entry = tool.entry();
                deadline_race(
                    move |_stop| entry.invoke(&input, &options),
                    limits.deadline_ms,
                    cancel,
                )
                .await?
            }
        };

        // Canonicalize whatever the path produced
        let result = normalize(&result.to_raw());
        if let ExecutionResult::Failure(failure) = &result {
            match failure.kind {
                FailureKind::Internal => error!(id, message = %failure.message, "execution failed internally"),
                FailureKind::Timeout => warn!(id, message = %failure.message, "execution timed out"),
                _ => debug!(id, kind = %failure.kind, "execution failed"),
            }
        }
        Ok(result)
    }
}

/// One in-flight execution
///
/// Resolves exactly once, or is cancelled. Dropping the handle cancels the
/// execution and tears down any worker it started.
#[derive(Debug)]
pub struct ExecutionHandle {
    id: u64,
    cancel: CancellationToken,
    outcome: Option<oneshot::Receiver<Result<ExecutionResult, Cancelled>>>,
}

impl ExecutionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Cancel the execution; its outcome becomes `Err(Cancelled)`
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token that cancels this execution
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the outcome. A cancelled handle never yields a result.
    pub async fn outcome(mut self) -> Result<ExecutionResult, Cancelled> {
        let Some(receiver) = self.outcome.take() else {
            return Err(Cancelled);
        };
        if self.cancel.is_cancelled() {
            return Err(Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Cancelled),
            received = receiver => match received {
                Ok(outcome) => outcome,
                Err(_) => {
                    error!(id = self.id, "execution task ended without an outcome");
                    Ok(ExecutionResult::internal("execution task ended without an outcome"))
                }
            },
        }
    }
}

impl Drop for ExecutionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Last-result-wins slot for one input field
///
/// Submitting a new request cancels the one before it, so only the newest
/// execution can deliver a result.
#[derive(Debug)]
pub struct ExecutionSlot {
    dispatcher: Dispatcher,
    current: Option<CancellationToken>,
}

impl ExecutionSlot {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            current: None,
        }
    }

    /// Supersede any in-flight execution with `request`
    pub fn submit(&mut self, request: TransformRequest) -> ExecutionHandle {
        self.cancel();
        let handle = self.dispatcher.spawn(request);
        self.current = Some(handle.cancellation_token());
        handle
    }

    /// Cancel the in-flight execution, if any
    pub fn cancel(&mut self) {
        if let Some(previous) = self.current.take() {
            if !previous.is_cancelled() {
                debug!("superseding in-flight execution");
            }
            previous.cancel();
        }
    }
}
