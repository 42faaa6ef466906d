//! Per-task execution supervisor.
//!
//! One instance per running task. Owns the machine lease and the agent
//! session for the task's lifetime and drives the guest run end-to-end:
//! capture, handshake, transfer, execute, heartbeat polling, then a
//! structured teardown that every path (success, timeout, cancellation
//! or failure) must pass through. Nothing leaves a machine allocated
//! past the run deadline plus one grace period.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use shared::SandboxError;

use crate::agent::packages::select_package;
use crate::agent::session::{AgentSession, PollResult};
use crate::agent::AgentConnector;
use crate::config::{AgentConfig, SupervisorConfig};
use crate::models::report::RunArtifacts;
use crate::models::task::Task;
use crate::pool::MachineLease;
use crate::services::{CaptureClient, CaptureHandle, HypervisorClient};

/// Collaborator handles shared by every supervisor instance
#[derive(Clone)]
pub struct SupervisorContext {
    pub connector: Arc<dyn AgentConnector>,
    pub capture: Arc<dyn CaptureClient>,
    pub hypervisor: Arc<dyn HypervisorClient>,
    pub config: SupervisorConfig,
    pub agent_config: AgentConfig,
}

/// Terminal outcome of one guest run
#[derive(Debug)]
pub enum RunOutcome {
    Completed,
    TimedOut,
    Cancelled,
    InfraFailed(SandboxError),
}

/// Outcome plus whatever artifacts were retrieved, on any path
#[derive(Debug)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub artifacts: RunArtifacts,
}

enum ExecEnd {
    Completed,
    TimedOut,
    Cancelled,
}

pub struct ExecutionSupervisor {
    task: Task,
    lease: MachineLease,
    ctx: SupervisorContext,
    cancel: watch::Receiver<bool>,
}

impl ExecutionSupervisor {
    pub fn new(
        task: Task,
        lease: MachineLease,
        ctx: SupervisorContext,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            task,
            lease,
            ctx,
            cancel,
        }
    }

    /// Drive the run to a terminal outcome. Teardown is unconditional:
    /// every branch below funnels through it before returning.
    pub async fn run(mut self) -> RunReport {
        info!(
            task_id = %self.task.id,
            machine_id = %self.lease.machine_id,
            platform = %self.task.platform,
            "Starting guest run"
        );

        let mut artifacts = RunArtifacts::default();

        // Step 1: per-task packet capture on the machine's interface
        let (capture_handle, session, exec_result) = match self
            .ctx
            .capture
            .start_capture(self.task.id, &self.lease.spec.network_interface)
            .await
        {
            Ok(handle) => {
                let (session, result) = self.execute(&mut artifacts).await;
                (Some(handle), session, result)
            }
            Err(e) => (None, None, Err(e)),
        };

        // Steps 6-7, reached from every branch above
        let artifacts = self.teardown(session, capture_handle, artifacts).await;

        let outcome = match exec_result {
            Ok(ExecEnd::Completed) => RunOutcome::Completed,
            Ok(ExecEnd::TimedOut) => RunOutcome::TimedOut,
            Ok(ExecEnd::Cancelled) => RunOutcome::Cancelled,
            Err(e) => RunOutcome::InfraFailed(e),
        };

        info!(
            task_id = %self.task.id,
            machine_id = %self.lease.machine_id,
            outcome = ?outcome,
            events = artifacts.behavior_events.len(),
            "Guest run finished"
        );

        RunReport { outcome, artifacts }
    }

    /// Steps 2-5: session, transfers, execute, heartbeat monitoring.
    /// The session is handed back even when a step fails so teardown can
    /// still attempt a graceful terminate over it.
    async fn execute(
        &mut self,
        artifacts: &mut RunArtifacts,
    ) -> (Option<AgentSession>, Result<ExecEnd, SandboxError>) {
        // Step 2: handshake within the configured deadline
        let mut session = match AgentSession::open(
            self.ctx.connector.as_ref(),
            &self.lease.spec,
            &self.ctx.agent_config,
        )
        .await
        {
            Ok(session) => session,
            Err(e) => return (None, Err(e)),
        };

        let result = self.drive(&mut session, artifacts).await;
        (Some(session), result)
    }

    async fn drive(
        &mut self,
        session: &mut AgentSession,
        artifacts: &mut RunArtifacts,
    ) -> Result<ExecEnd, SandboxError> {
        // Step 3: sample plus analysis package, both checksum-verified
        let sample_bytes = tokio::fs::read(&self.task.sample.path)
            .await
            .map_err(|e| SandboxError::Internal(format!("read spooled sample: {}", e)))?;
        let sample_name = self
            .task
            .sample
            .file_name
            .clone()
            .unwrap_or_else(|| "sample.bin".to_string());
        session.transfer(&sample_name, sample_bytes).await?;

        let package = select_package(self.task.file_type);
        let package_bytes = serde_json::to_vec(&package)
            .map_err(|e| SandboxError::Internal(format!("encode package: {}", e)))?;
        session
            .transfer(&format!("package-{}.json", package.name), package_bytes)
            .await?;

        // Step 4: detonate
        session.execute(&package.name).await?;
        debug!(task_id = %self.task.id, package = %package.name, "Sample executing");

        // Step 5: poll until completion, cancellation, or the run deadline
        let run_deadline = Instant::now() + self.task.max_run_duration;

        loop {
            if *self.cancel.borrow() {
                info!(task_id = %self.task.id, "Cancellation requested");
                return Ok(ExecEnd::Cancelled);
            }
            let now = Instant::now();
            if now >= run_deadline {
                info!(task_id = %self.task.id, "Maximum run duration reached");
                return Ok(ExecEnd::TimedOut);
            }

            let wait = self.ctx.config.poll_interval().min(run_deadline - now);
            let mut cancel = self.cancel.clone();
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.changed() => continue,
            }

            match session.poll().await {
                Ok(PollResult::Running { events, log }) => {
                    artifacts.absorb(events, log);
                }
                Ok(PollResult::Completed {
                    manifest,
                    events,
                    log,
                }) => {
                    artifacts.absorb(events, log);
                    artifacts.manifest = Some(manifest);
                    return Ok(ExecEnd::Completed);
                }
                Err(e) => {
                    if session.silence() >= self.ctx.config.liveness_deadline() {
                        return Err(SandboxError::AgentUnreachable(format!(
                            "no heartbeat within liveness deadline: {}",
                            e
                        )));
                    }
                    debug!(task_id = %self.task.id, error = %e, "Heartbeat missed, within liveness budget");
                }
            }
        }
    }

    /// Steps 6-7: graceful terminate bounded by the grace period, force
    /// power-off if the session did not close, then capture retrieval.
    /// Best-effort throughout; never propagates an error.
    async fn teardown(
        &mut self,
        session: Option<AgentSession>,
        capture_handle: Option<CaptureHandle>,
        mut artifacts: RunArtifacts,
    ) -> RunArtifacts {
        let mut closed = false;

        if let Some(mut session) = session {
            match timeout(self.ctx.config.grace_period(), session.terminate()).await {
                Ok(Ok(true)) => {
                    closed = true;
                    debug!(task_id = %self.task.id, "Guest terminated gracefully");
                }
                Ok(Ok(false)) => {
                    warn!(task_id = %self.task.id, "Guest did not confirm termination")
                }
                Ok(Err(e)) => warn!(task_id = %self.task.id, error = %e, "Terminate failed"),
                Err(_) => {
                    warn!(task_id = %self.task.id, "Grace period elapsed without termination")
                }
            }
        }

        if !closed {
            if let Err(e) = self.ctx.hypervisor.stop_machine(&self.lease.machine_id).await {
                warn!(
                    task_id = %self.task.id,
                    machine_id = %self.lease.machine_id,
                    error = %e,
                    "Force power-off failed"
                );
            }
        }

        if let Some(handle) = capture_handle {
            match self.ctx.capture.stop_capture(handle).await {
                Ok(path) => artifacts.capture_file = Some(path),
                Err(e) => warn!(task_id = %self.task.id, error = %e, "Capture retrieval failed"),
            }
        }

        artifacts
    }
}
