//! Task scheduler.
//!
//! Accepts validated submissions, matches pending tasks to idle machines
//! (priority first, then submission time, ties broken by id), enforces the
//! concurrent-running admission ceiling, spawns one execution supervisor
//! per dispatched task, and maps run outcomes to terminal states with a
//! bounded retry loop for infrastructure failures. The machine goes back
//! to the pool on every terminal transition, after the terminal state has
//! been recorded, including after supervisor crashes.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{watch, Mutex, Notify, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use shared::messaging::TaskEvent;
use shared::SandboxError;

use crate::config::SchedulerConfig;
use crate::fusion::FusionEngine;
use crate::models::report::RunArtifacts;
use crate::models::task::{SubmitTaskRequest, Task, TaskResponse, TaskStatus};
use crate::pool::{MachineLease, MachinePool};
use crate::services::ReportStoreClient;
use crate::supervisor::{ExecutionSupervisor, RunOutcome, RunReport, SupervisorContext};

/// Scheduler counters exposed on the HTTP surface
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStats {
    pub pending: usize,
    pub running: usize,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub retries: u64,
}

struct RunningTask {
    machine_id: String,
    cancel: watch::Sender<bool>,
}

pub struct Scheduler {
    config: SchedulerConfig,
    pool: Arc<MachinePool>,
    supervisor_ctx: SupervisorContext,
    fusion: Arc<FusionEngine>,
    store: ReportStoreClient,

    tasks: RwLock<HashMap<Uuid, Task>>,
    running: RwLock<HashMap<Uuid, RunningTask>>,
    counters: RwLock<SchedulerStats>,

    wake: Notify,
    shutdown: Mutex<bool>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        pool: Arc<MachinePool>,
        supervisor_ctx: SupervisorContext,
        fusion: Arc<FusionEngine>,
        store: ReportStoreClient,
    ) -> Self {
        Self {
            config,
            pool,
            supervisor_ctx,
            fusion,
            store,
            tasks: RwLock::new(HashMap::new()),
            running: RwLock::new(HashMap::new()),
            counters: RwLock::new(SchedulerStats::default()),
            wake: Notify::new(),
            shutdown: Mutex::new(false),
        }
    }

    /// Start the dispatch loop: interval ticks plus wake-ups on submit
    /// and completion.
    pub fn start(self: Arc<Self>) {
        let scheduler = self;
        tokio::spawn(async move {
            info!(
                max_running = scheduler.config.max_running,
                max_retries = scheduler.config.max_retries,
                "Scheduler started"
            );
            let mut ticker = tokio::time::interval(scheduler.config.tick_interval());
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = scheduler.wake.notified() => {}
                }
                if *scheduler.shutdown.lock().await {
                    info!("Scheduler loop stopping");
                    break;
                }
                Arc::clone(&scheduler).dispatch_once().await;
            }
        });
    }

    pub async fn shutdown(&self) {
        *self.shutdown.lock().await = true;
        self.wake.notify_one();
    }

    /// Validate and enqueue a submission
    pub async fn submit(&self, request: SubmitTaskRequest) -> Result<Uuid, SandboxError> {
        if request.platform.trim().is_empty() {
            return Err(SandboxError::InvalidTask(
                "platform tag is required".to_string(),
            ));
        }
        if request.sample.sha256.trim().is_empty() {
            return Err(SandboxError::InvalidTask(
                "sample reference is required".to_string(),
            ));
        }

        let max_run = request
            .max_run_duration
            .unwrap_or_else(|| self.config.default_max_run());
        let task = Task::new(
            request.sample,
            request.platform,
            request.file_type,
            request.priority,
            max_run,
            self.config.max_retries,
        );
        let task_id = task.id;

        info!(
            %task_id,
            platform = %task.platform,
            priority = task.priority.as_str(),
            sha256 = %task.sample.sha256,
            "Task submitted"
        );

        self.store.record(TaskEvent::TaskQueued {
            task_id,
            platform: task.platform.clone(),
            priority: task.priority.as_str().to_string(),
            timestamp: Utc::now(),
        });

        self.tasks.write().await.insert(task_id, task);
        self.wake.notify_one();
        Ok(task_id)
    }

    /// Cancel a task at any point before its terminal state. Running tasks
    /// go through the supervisor's terminate-then-force-poweroff sequence.
    pub async fn cancel(&self, task_id: Uuid) -> Result<(), SandboxError> {
        {
            let running = self.running.read().await;
            if let Some(entry) = running.get(&task_id) {
                info!(%task_id, "Cancelling running task");
                let _ = entry.cancel.send(true);
                return Ok(());
            }
        }

        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(&task_id)
            .ok_or_else(|| SandboxError::NotFound(format!("task {}", task_id)))?;

        if task.is_terminal() {
            return Err(SandboxError::InvalidTask(format!(
                "task {} already reached {}",
                task_id,
                task.status.as_str()
            )));
        }

        // A Running task with no running-map entry is already being
        // finalized; it reaches a terminal state on its own.
        if task.status == TaskStatus::Pending {
            task.transition(TaskStatus::Cancelled)?;
            drop(tasks);

            self.counters.write().await.cancelled += 1;
            self.store.record(TaskEvent::TaskFinished {
                task_id,
                status: TaskStatus::Cancelled.as_str().to_string(),
                result_id: None,
                error_message: None,
                timestamp: Utc::now(),
            });
            info!(%task_id, "Pending task cancelled");
        }

        Ok(())
    }

    /// One matching pass over the pending queue, oldest-priority-first
    pub async fn dispatch_once(self: Arc<Self>) -> usize {
        let candidates: Vec<(Uuid, String)> = {
            let tasks = self.tasks.read().await;
            let mut pending: Vec<&Task> = tasks
                .values()
                .filter(|t| t.status == TaskStatus::Pending)
                .collect();
            pending.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.submitted_at.cmp(&b.submitted_at))
                    .then(a.id.cmp(&b.id))
            });
            pending
                .iter()
                .map(|t| (t.id, t.platform.clone()))
                .collect()
        };

        let mut dispatched = 0;
        for (task_id, platform) in candidates {
            if self.running.read().await.len() >= self.config.max_running {
                debug!("Admission ceiling reached, leaving remaining tasks pending");
                break;
            }

            let lease = match self.pool.allocate(&platform, task_id).await {
                Ok(lease) => lease,
                Err(SandboxError::NoCapacity(_)) => continue, // stays Pending
                Err(e) => {
                    warn!(%task_id, error = %e, "Allocation failed");
                    continue;
                }
            };

            if Arc::clone(&self).dispatch_task(task_id, lease).await {
                dispatched += 1;
            }
        }
        dispatched
    }

    /// Transition one matched task to Running and hand it to a supervisor
    async fn dispatch_task(self: Arc<Self>, task_id: Uuid, lease: MachineLease) -> bool {
        // Register the cancel handle before the task becomes Running, so a
        // cancel arriving mid-dispatch always finds something to flip.
        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.running.write().await.insert(
            task_id,
            RunningTask {
                machine_id: lease.machine_id.clone(),
                cancel: cancel_tx,
            },
        );

        let task_snapshot = {
            let mut tasks = self.tasks.write().await;
            match tasks.get_mut(&task_id) {
                Some(task) if task.status == TaskStatus::Pending => {
                    let moved = task
                        .transition(TaskStatus::Scheduled)
                        .and_then(|_| task.transition(TaskStatus::Running));
                    match moved {
                        Ok(()) => {
                            task.assign_machine(&lease.machine_id);
                            Some(task.clone())
                        }
                        Err(e) => {
                            error!(%task_id, error = %e, "Dispatch transition failed");
                            None
                        }
                    }
                }
                // Cancelled (or otherwise moved on) since the pass started
                _ => None,
            }
        };

        let Some(task) = task_snapshot else {
            self.running.write().await.remove(&task_id);
            if let Err(e) = self.pool.release(&lease.machine_id).await {
                warn!(machine_id = %lease.machine_id, error = %e, "Release of unused machine failed");
            }
            return false;
        };

        info!(
            %task_id,
            machine_id = %lease.machine_id,
            priority = task.priority.as_str(),
            "Task dispatched"
        );

        self.store.record(TaskEvent::TaskStarted {
            task_id,
            machine_id: lease.machine_id.clone(),
            timestamp: Utc::now(),
        });

        let scheduler = Arc::clone(&self);
        tokio::spawn(async move {
            scheduler.run_task(task, lease, cancel_rx).await;
        });
        true
    }

    /// Supervise one run to its terminal outcome. A crashed supervisor is
    /// absorbed into an internal failure so finalization still happens.
    async fn run_task(
        self: Arc<Self>,
        task: Task,
        lease: MachineLease,
        cancel: watch::Receiver<bool>,
    ) {
        let task_id = task.id;
        let machine_id = lease.machine_id.clone();

        let supervisor =
            ExecutionSupervisor::new(task, lease, self.supervisor_ctx.clone(), cancel);

        let report = match tokio::spawn(supervisor.run()).await {
            Ok(report) => report,
            Err(join_error) => {
                error!(%task_id, error = %join_error, "Supervisor crashed");
                RunReport {
                    outcome: RunOutcome::InfraFailed(SandboxError::Internal(format!(
                        "supervisor crashed: {}",
                        join_error
                    ))),
                    artifacts: RunArtifacts::default(),
                }
            }
        };

        self.finalize(task_id, &machine_id, report).await;
    }

    /// Map the run outcome onto the task, then release the machine.
    ///
    /// Ordering is deliberate: the terminal (or retry) state is recorded
    /// first, and the release happens on every path after it.
    async fn finalize(&self, task_id: Uuid, machine_id: &str, report: RunReport) {
        // Fuse signals for runs that produced an analysis
        let fusion_report = match report.outcome {
            RunOutcome::Completed | RunOutcome::TimedOut => {
                let snapshot = self.tasks.read().await.get(&task_id).cloned();
                match snapshot {
                    Some(task) => Some(self.fusion.score(&task, &report.artifacts).await),
                    None => None,
                }
            }
            _ => None,
        };

        if let Some(analysis) = &fusion_report {
            self.store.store_report(analysis);
            self.store.record(TaskEvent::ReportReady {
                report_id: analysis.id,
                task_id,
                verdict: analysis.verdict.as_str().to_string(),
                score: analysis.score,
                timestamp: Utc::now(),
            });
        }

        let mut retried = false;
        let (status, error_message, result_id, retry_count) = {
            let mut tasks = self.tasks.write().await;
            match tasks.get_mut(&task_id) {
                Some(task) => {
                    let applied = match &report.outcome {
                        RunOutcome::Completed => match fusion_report.as_ref() {
                            Some(analysis) => task.mark_completed(analysis.id),
                            None => task.mark_failed("analysis report unavailable"),
                        },
                        RunOutcome::TimedOut => {
                            task.mark_timed_out(fusion_report.as_ref().map(|r| r.id))
                        }
                        RunOutcome::Cancelled => task.transition(TaskStatus::Cancelled),
                        RunOutcome::InfraFailed(e) => {
                            if e.is_infrastructure() && task.can_retry() {
                                retried = true;
                                task.requeue_for_retry(&e.to_string())
                            } else {
                                task.mark_failed(&e.to_string())
                            }
                        }
                    };
                    if let Err(e) = applied {
                        error!(%task_id, error = %e, "Outcome could not be applied");
                    }
                    (
                        task.status,
                        task.error_message.clone(),
                        task.result_id,
                        task.retry_count,
                    )
                }
                None => {
                    error!(%task_id, "Finalizing unknown task");
                    (TaskStatus::Failed, None, None, 0)
                }
            }
        };

        self.running.write().await.remove(&task_id);

        // Unconditional release, after terminal-state assignment
        if let Err(e) = self.pool.release(machine_id).await {
            match &e {
                SandboxError::MachineFaulted(_) => {
                    let failures = self.pool.consecutive_failures(machine_id).await;
                    warn!(%machine_id, failures, "Machine cordoned during release");
                    self.store.record(TaskEvent::MachineCordoned {
                        machine_id: machine_id.to_string(),
                        consecutive_failures: failures,
                        timestamp: Utc::now(),
                    });
                }
                _ => error!(%machine_id, error = %e, "Machine release failed"),
            }
        }

        {
            let mut counters = self.counters.write().await;
            if retried {
                counters.retries += 1;
            } else {
                match status {
                    TaskStatus::Completed => counters.completed += 1,
                    TaskStatus::Failed => counters.failed += 1,
                    TaskStatus::TimedOut => counters.timed_out += 1,
                    TaskStatus::Cancelled => counters.cancelled += 1,
                    _ => {}
                }
            }
        }

        if retried {
            info!(%task_id, retry_count, "Task re-enqueued after infrastructure failure");
            self.store.record(TaskEvent::TaskRetried {
                task_id,
                retry_count,
                reason: error_message.unwrap_or_default(),
                timestamp: Utc::now(),
            });
        } else {
            info!(%task_id, status = status.as_str(), "Task finalized");
            self.store.record(TaskEvent::TaskFinished {
                task_id,
                status: status.as_str().to_string(),
                result_id,
                error_message,
                timestamp: Utc::now(),
            });
        }

        self.wake.notify_one();
    }

    pub async fn task_status(&self, task_id: Uuid) -> Option<TaskResponse> {
        self.tasks.read().await.get(&task_id).map(TaskResponse::from)
    }

    pub async fn stats(&self) -> SchedulerStats {
        let mut stats = self.counters.read().await.clone();
        stats.pending = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .count();
        stats.running = self.running.read().await.len();
        stats
    }
}
