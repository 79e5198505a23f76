//! Restart/retry executor: runs one worker's routine under a restart policy.
//!
//! With restart enabled the routine is a persistent service loop: every
//! success starts the next run from the top, and failures are retried with
//! exponential backoff until the policy's retry budget is spent.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use botgrid_core::{ExecutionMetrics, ExecutionTracker, RestartPolicy, Routine, RoutineContext};

use crate::error::{SchedulerError, SchedulerResult};

/// How an executor run ended without error.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Single run (restart disabled) finished successfully.
    Completed(ExecutionMetrics),
    /// The worker's cancellation token fired.
    Cancelled { runs: u64 },
}

/// Best-effort execution tracking for runs with a bound account.
///
/// Tracker failures are logged and swallowed; they never change the
/// outcome of a run.
#[derive(Clone)]
pub struct TrackingHooks {
    tracker: Arc<dyn ExecutionTracker>,
    session_id: String,
}

impl TrackingHooks {
    pub fn new(tracker: Arc<dyn ExecutionTracker>, session_id: impl Into<String>) -> Self {
        Self {
            tracker,
            session_id: session_id.into(),
        }
    }

    fn start(&self, routine: &str, ctx: &RoutineContext) -> Option<String> {
        let account = ctx.account.as_deref()?;
        match self
            .tracker
            .start_execution(account, routine, &self.session_id, ctx.instance)
        {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(%account, instance = ctx.instance, error = %e, "failed to record execution start");
                None
            }
        }
    }

    fn complete(&self, execution: Option<String>, metrics: &ExecutionMetrics) {
        let Some(id) = execution else { return };
        if let Err(e) = self.tracker.complete_execution(&id, metrics) {
            warn!(execution = %id, error = %e, "failed to record execution completion");
        }
    }

    fn fail(&self, execution: Option<String>, reason: &str) {
        let Some(id) = execution else { return };
        if let Err(e) = self.tracker.fail_execution(&id, reason) {
            warn!(execution = %id, error = %e, "failed to record execution failure");
        }
    }
}

/// Re-executes a routine according to a [`RestartPolicy`].
pub struct RestartExecutor {
    routine_name: String,
    routine: Arc<dyn Routine>,
    policy: RestartPolicy,
    /// Declared configuration defaults for the routine.
    defaults: HashMap<String, Value>,
    /// Group-level overrides of those defaults.
    overrides: HashMap<String, Value>,
    tracking: Option<TrackingHooks>,
}

impl RestartExecutor {
    pub fn new(routine_name: impl Into<String>, routine: Arc<dyn Routine>, policy: RestartPolicy) -> Self {
        Self {
            routine_name: routine_name.into(),
            routine,
            policy,
            defaults: HashMap::new(),
            overrides: HashMap::new(),
            tracking: None,
        }
    }

    pub fn with_variables(
        mut self,
        defaults: HashMap<String, Value>,
        overrides: HashMap<String, Value>,
    ) -> Self {
        self.defaults = defaults;
        self.overrides = overrides;
        self
    }

    pub fn with_tracking(mut self, hooks: TrackingHooks) -> Self {
        self.tracking = Some(hooks);
        self
    }

    pub fn policy(&self) -> &RestartPolicy {
        &self.policy
    }

    /// Run until cancelled, or until the retry budget is exhausted.
    ///
    /// Cancellation is observed between runs and during backoff sleeps;
    /// a run already in progress relies on the routine checking `ctx.cancel`.
    pub async fn run(&self, ctx: &mut RoutineContext) -> SchedulerResult<RunOutcome> {
        if !self.policy.enabled {
            if ctx.is_cancelled() {
                return Ok(RunOutcome::Cancelled { runs: 0 });
            }
            let metrics = self
                .run_once(ctx)
                .await
                .map_err(SchedulerError::RoutineFailed)?;
            return Ok(RunOutcome::Completed(metrics));
        }

        let mut runs: u64 = 0;
        let mut retries: u32 = 0;
        let mut delay = self.policy.initial_delay;

        loop {
            if ctx.is_cancelled() {
                debug!(instance = ctx.instance, runs, "executor cancelled");
                return Ok(RunOutcome::Cancelled { runs });
            }

            let result = self.run_once(ctx).await;
            runs += 1;

            match result {
                Ok(_) => {
                    if self.policy.reset_on_success {
                        retries = 0;
                        delay = self.policy.initial_delay;
                    }
                    debug!(instance = ctx.instance, runs, "routine run succeeded, restarting");
                    // Let siblings run between back-to-back iterations.
                    tokio::task::yield_now().await;
                }
                Err(e) => {
                    if ctx.is_cancelled() {
                        return Ok(RunOutcome::Cancelled { runs });
                    }
                    if self.policy.exhausted(retries) {
                        warn!(
                            instance = ctx.instance,
                            routine = %self.routine_name,
                            retries,
                            error = %e,
                            "retries exhausted"
                        );
                        return Err(SchedulerError::RetriesExhausted {
                            retries,
                            last_error: e,
                        });
                    }

                    retries += 1;
                    info!(
                        instance = ctx.instance,
                        routine = %self.routine_name,
                        retry = retries,
                        delay = ?delay,
                        error = %e,
                        "routine failed, retrying"
                    );

                    tokio::select! {
                        _ = ctx.cancel.cancelled() => return Ok(RunOutcome::Cancelled { runs }),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    delay = self.policy.delay_for(retries);
                }
            }
        }
    }

    /// One iteration: reset variables, execute, record.
    async fn run_once(&self, ctx: &mut RoutineContext) -> anyhow::Result<ExecutionMetrics> {
        ctx.variables.clear_transient();
        ctx.variables.apply_config(&self.defaults, &self.overrides);

        let execution = self
            .tracking
            .as_ref()
            .and_then(|t| t.start(&self.routine_name, ctx));

        let result = self.routine.execute(ctx).await;

        if let Some(tracking) = &self.tracking {
            match &result {
                Ok(metrics) => tracking.complete(execution, metrics),
                Err(e) => tracking.fail(execution, &format!("{e:#}")),
            }
        }
        result
    }
}
