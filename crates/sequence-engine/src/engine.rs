//! Sequence engine: runs one sequence at a time.
//!
//! # Run lifecycle
//! ```text
//! Idle ──run()──> Running ──> Completed | Failed | Stopped | Error ──> Idle
//! ```
//!
//! - `run()` claims the engine's single run slot or fails with
//!   [`EngineError::AlreadyRunning`]. The slot is released by a drop guard,
//!   including when the run future itself is dropped.
//! - Steps execute strictly in order, each in its own task, so a panicking
//!   handler ends the run with `test_error` instead of tearing down the
//!   caller.
//! - `stop()` cancels the run's [`CancellationToken`]; the loop checks it
//!   before every step. The step in flight always finishes.
//! - A step that outlives its time limit is aborted and recorded as a failed
//!   step. The limit is the step's `timeout_seconds` or the engine default;
//!   a delay step's own wait is added on top.
//! - The slot's mutex is never held across an `.await`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use tokio::task::{AbortHandle, JoinError};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use testbench_core::config::TestbenchConfig;
use testbench_core::error::EngineError;
use testbench_core::event::{ProgressKind, RunStatus};
use testbench_core::metrics as names;
use testbench_core::types::{
    SequenceDefinition, StepDefinition, StepKind, StepOutcome, StepResult, StepShell,
};

use crate::backend::InstrumentBackend;
use crate::executor::{ExecutorConfig, StepExecutor};
use crate::reporter::ProgressReporter;
use crate::state::{EngineStatus, RunOutcome, RunSummary, TestId};

/// Default pause between consecutive steps.
pub const DEFAULT_INTER_STEP_DELAY: Duration = Duration::from_millis(10);
/// Default time limit of a single step.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(30);

/// Bookkeeping of the active run.
#[derive(Debug)]
struct ActiveRun {
    test_id: TestId,
    sequence: String,
    total_steps: usize,
    completed_steps: usize,
    cancel: CancellationToken,
}

type RunSlot = Mutex<Option<ActiveRun>>;

fn lock_slot(slot: &RunSlot) -> MutexGuard<'_, Option<ActiveRun>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Releases the run slot when dropped, if it still belongs to `test_id`.
struct RunGuard<'a> {
    slot: &'a RunSlot,
    test_id: TestId,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let mut slot = lock_slot(self.slot);
        if slot
            .as_ref()
            .is_some_and(|active| active.test_id == self.test_id)
        {
            *slot = None;
            gauge!(names::ENGINE_RUNNING).set(0.0);
        }
    }
}

/// Aborts a spawned step task if its awaiting run is dropped.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Test sequence engine.
///
/// Share it behind an `Arc` to call [`stop`](Self::stop) or
/// [`current_status`](Self::current_status) while a run is in progress.
///
/// # Example
/// ```ignore
/// let engine = Arc::new(SequenceEngine::from_config(SimulatedBackend::new(), &config));
/// let reporter = ProgressReporter::new().with_observer(TracingObserver::new());
///
/// let runner = Arc::clone(&engine);
/// let handle = tokio::spawn(async move { runner.run(&sequence, &reporter).await });
///
/// engine.stop();
/// let summary = handle.await??;
/// ```
pub struct SequenceEngine<B: InstrumentBackend> {
    executor: Arc<StepExecutor<B>>,
    inter_step_delay: Duration,
    step_timeout: Duration,
    slot: RunSlot,
}

impl<B: InstrumentBackend> SequenceEngine<B> {
    pub fn new(executor: StepExecutor<B>) -> Self {
        Self {
            executor: Arc::new(executor),
            inter_step_delay: DEFAULT_INTER_STEP_DELAY,
            step_timeout: DEFAULT_STEP_TIMEOUT,
            slot: Mutex::new(None),
        }
    }

    /// Engine configured from the `[engine]`, `[safety]` and `[tolerances]`
    /// sections.
    pub fn from_config(backend: B, config: &TestbenchConfig) -> Self {
        Self::new(StepExecutor::new(backend, ExecutorConfig::from_config(config)))
            .with_inter_step_delay(config.engine.inter_step_delay())
            .with_step_timeout(config.engine.step_timeout())
    }

    pub fn with_inter_step_delay(mut self, delay: Duration) -> Self {
        self.inter_step_delay = delay;
        self
    }

    /// Time limit for steps without their own `timeout_seconds`.
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn executor(&self) -> &StepExecutor<B> {
        &self.executor
    }

    /// Runs `sequence` to completion, stop, or the first unexpected error.
    ///
    /// Progress is reported through `reporter`. Step failures do not end the
    /// run. The only error is [`EngineError::AlreadyRunning`], returned
    /// before any event is emitted.
    pub async fn run(
        &self,
        sequence: &SequenceDefinition,
        reporter: &ProgressReporter,
    ) -> Result<RunSummary, EngineError> {
        let (test_id, cancel, _guard) = self.begin(sequence)?;
        let total_steps = sequence.total_steps();

        info!(
            test_id = %test_id,
            sequence = %sequence.name,
            total_steps,
            "starting test run"
        );
        reporter
            .emit(ProgressKind::TestStarted {
                test_id: test_id.to_string(),
                sequence: sequence.name.clone(),
                total_steps,
            })
            .await;

        let mut results: Vec<StepResult> = Vec::with_capacity(total_steps);
        for (index, step) in sequence.steps.iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }

            let step_number = index + 1;
            let step_name = step.display_name(step_number);
            reporter
                .emit(ProgressKind::StepStarted {
                    test_id: test_id.to_string(),
                    step: step_name.clone(),
                    step_number,
                })
                .await;

            let result = match self.execute_step(step, step_number).await {
                Ok(result) => result,
                Err(e) => return Ok(self.abort(&test_id, sequence, results, e, reporter).await),
            };

            self.record_progress(&test_id, step_number);
            results.push(result.clone());
            reporter
                .emit(ProgressKind::StepCompleted {
                    test_id: test_id.to_string(),
                    step: step_name,
                    result,
                })
                .await;

            tokio::select! {
                _ = tokio::time::sleep(self.inter_step_delay) => {}
                _ = cancel.cancelled() => {}
            }
        }

        let steps_passed = results.iter().filter(|r| r.passed).count();
        let executed = results.len();
        let outcome = if cancel.is_cancelled() && executed < total_steps {
            RunOutcome::Stopped
        } else if steps_passed == executed {
            RunOutcome::Completed
        } else {
            RunOutcome::Failed
        };
        let duration = test_id.elapsed().as_secs_f64();

        reporter
            .emit(ProgressKind::TestCompleted {
                test_id: test_id.to_string(),
                passed: steps_passed == executed,
                steps_passed,
                total_steps: executed,
                duration,
                status: outcome.status().unwrap_or(RunStatus::Failed),
            })
            .await;

        counter!(names::ENGINE_RUNS_TOTAL, names::LABEL_OUTCOME => outcome.as_str()).increment(1);
        info!(
            test_id = %test_id,
            outcome = %outcome,
            steps_passed,
            total_steps = executed,
            duration,
            "test run finished"
        );

        Ok(RunSummary {
            test_id: test_id.to_string(),
            sequence: sequence.name.clone(),
            outcome,
            steps_passed,
            total_steps: executed,
            duration,
            results,
            error: None,
        })
    }

    /// Requests cooperative cancellation of the active run.
    ///
    /// Returns `true` if a run was active. Idempotent and non-blocking.
    pub fn stop(&self) -> bool {
        let slot = lock_slot(&self.slot);
        match slot.as_ref() {
            Some(active) => {
                if !active.cancel.is_cancelled() {
                    info!(test_id = %active.test_id, "stop requested");
                    active.cancel.cancel();
                }
                true
            }
            None => false,
        }
    }

    /// Snapshot of the engine state.
    pub fn current_status(&self) -> EngineStatus {
        let slot = lock_slot(&self.slot);
        match slot.as_ref() {
            Some(active) => EngineStatus {
                running: !active.cancel.is_cancelled(),
                test_id: Some(active.test_id.to_string()),
                sequence: Some(active.sequence.clone()),
                completed_steps: active.completed_steps,
                total_steps: active.total_steps,
            },
            None => EngineStatus::idle(),
        }
    }

    /// Whether a run holds the slot, including one that is stopping.
    pub fn is_busy(&self) -> bool {
        lock_slot(&self.slot).is_some()
    }

    fn begin(
        &self,
        sequence: &SequenceDefinition,
    ) -> Result<(TestId, CancellationToken, RunGuard<'_>), EngineError> {
        let mut slot = lock_slot(&self.slot);
        if let Some(active) = slot.as_ref() {
            warn!(
                active_test_id = %active.test_id,
                sequence = %sequence.name,
                "run rejected: a test is already running"
            );
            counter!(names::ENGINE_RUNS_REJECTED_TOTAL).increment(1);
            return Err(EngineError::AlreadyRunning {
                test_id: active.test_id.to_string(),
            });
        }

        let test_id = TestId::generate();
        let cancel = CancellationToken::new();
        *slot = Some(ActiveRun {
            test_id: test_id.clone(),
            sequence: sequence.name.clone(),
            total_steps: sequence.total_steps(),
            completed_steps: 0,
            cancel: cancel.clone(),
        });
        gauge!(names::ENGINE_RUNNING).set(1.0);

        let guard = RunGuard {
            slot: &self.slot,
            test_id: test_id.clone(),
        };
        Ok((test_id, cancel, guard))
    }

    fn record_progress(&self, test_id: &TestId, step_number: usize) {
        let mut slot = lock_slot(&self.slot);
        if let Some(active) = slot.as_mut().filter(|a| &a.test_id == test_id) {
            active.completed_steps = step_number;
        }
    }

    /// Time limit of `step`.
    fn step_limit(&self, step: &StepDefinition) -> Duration {
        let limit = step.timeout().unwrap_or(self.step_timeout);
        match &step.kind {
            StepKind::Delay(params) => {
                let wait =
                    Duration::from_millis(params.delay_ms).min(self.executor.config().max_delay);
                limit.saturating_add(wait)
            }
            _ => limit,
        }
    }

    /// Executes one step in its own task and finalizes its result.
    async fn execute_step(
        &self,
        step: &StepDefinition,
        step_number: usize,
    ) -> Result<StepResult, EngineError> {
        let shell = StepShell::open(step, step_number);
        let limit = self.step_limit(step);
        let executor = Arc::clone(&self.executor);
        let owned = step.clone();
        let handle = tokio::spawn(async move { executor.execute(&owned).await });
        let _abort = AbortOnDrop(handle.abort_handle());

        let joined = match tokio::time::timeout(limit, handle).await {
            Ok(joined) => joined,
            Err(_) => {
                warn!(
                    step = %shell.step_name,
                    step_number,
                    timeout_ms = limit.as_millis() as u64,
                    "step timed out"
                );
                counter!(names::ENGINE_STEP_TIMEOUTS_TOTAL).increment(1);
                let outcome = StepOutcome::fail(
                    format!("step timed out after {limit:?}"),
                    Default::default(),
                );
                return Ok(Self::finish(shell, outcome));
            }
        };

        let outcome = match joined {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(source)) => {
                return Err(EngineError::StepAborted {
                    step: shell.step_name,
                    step_number,
                    source,
                });
            }
            Err(join_error) => {
                return Err(EngineError::StepPanicked {
                    step: shell.step_name,
                    step_number,
                    reason: join_failure_reason(join_error),
                });
            }
        };
        Ok(Self::finish(shell, outcome))
    }

    /// Closes the step's result and records its metrics.
    fn finish(shell: StepShell, outcome: StepOutcome) -> StepResult {
        let result = shell.finalize(outcome);
        let step_type = result.step_type.clone();
        histogram!(names::ENGINE_STEP_DURATION_SECONDS, names::LABEL_STEP_TYPE => step_type.clone())
            .record(result.duration_seconds);
        counter!(
            names::ENGINE_STEPS_TOTAL,
            names::LABEL_STEP_TYPE => step_type,
            names::LABEL_RESULT => if result.passed { "pass" } else { "fail" }
        )
        .increment(1);
        result
    }

    /// Ends the run after an unexpected error.
    async fn abort(
        &self,
        test_id: &TestId,
        sequence: &SequenceDefinition,
        results: Vec<StepResult>,
        cause: EngineError,
        reporter: &ProgressReporter,
    ) -> RunSummary {
        let message = cause.to_string();
        error!(test_id = %test_id, error = %message, "test run aborted");

        reporter
            .emit(ProgressKind::TestError {
                test_id: test_id.to_string(),
                error: message.clone(),
            })
            .await;
        counter!(names::ENGINE_RUNS_TOTAL, names::LABEL_OUTCOME => RunOutcome::Error.as_str())
            .increment(1);

        RunSummary {
            test_id: test_id.to_string(),
            sequence: sequence.name.clone(),
            outcome: RunOutcome::Error,
            steps_passed: results.iter().filter(|r| r.passed).count(),
            total_steps: results.len(),
            duration: test_id.elapsed().as_secs_f64(),
            results,
            error: Some(message),
        }
    }
}

impl<B: InstrumentBackend> std::fmt::Debug for SequenceEngine<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceEngine")
            .field("backend", &self.executor.backend().name())
            .field("inter_step_delay", &self.inter_step_delay)
            .field("step_timeout", &self.step_timeout)
            .field("status", &self.current_status())
            .finish()
    }
}

fn join_failure_reason(err: JoinError) -> String {
    if err.is_cancelled() {
        return "step task was cancelled".to_owned();
    }
    let payload = err.into_panic();
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("step panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("step panicked: {msg}")
    } else {
        "step panicked".to_owned()
    }
}
