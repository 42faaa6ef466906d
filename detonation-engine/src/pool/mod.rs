//! Machine resource pool.
//!
//! Sole owner of the machine inventory. Other components hold id-based
//! leases, never `Machine` references. The allocate/release critical
//! section covers only the state read-modify-write; the slow revert I/O
//! runs outside the lock once the machine has moved to `Reverting`.

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use shared::SandboxError;

use crate::config::PoolConfig;
use crate::models::machine::{Machine, MachineSpec, MachineState, MachineStatus};
use crate::services::HypervisorClient;

/// Time-bounded borrow of one machine, handed to an execution supervisor
#[derive(Debug, Clone)]
pub struct MachineLease {
    pub machine_id: String,
    pub spec: MachineSpec,
}

/// Pool-wide counters
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub idle: usize,
    pub allocated: usize,
    pub cordoned: usize,
}

pub struct MachinePool {
    config: PoolConfig,
    hypervisor: Arc<dyn HypervisorClient>,
    machines: Mutex<HashMap<String, Machine>>,
}

impl MachinePool {
    pub fn new(config: PoolConfig, hypervisor: Arc<dyn HypervisorClient>) -> Self {
        let machines = config
            .machines
            .iter()
            .map(|spec| (spec.id.clone(), Machine::new(spec.clone())))
            .collect();

        Self {
            config,
            hypervisor,
            machines: Mutex::new(machines),
        }
    }

    /// Bring every offline machine to a clean idle baseline. Individual
    /// failures cordon that machine and do not abort the rest.
    pub async fn start_all(&self) {
        let ids: Vec<String> = {
            let inventory = self.machines.lock().await;
            inventory
                .values()
                .filter(|m| m.state == MachineState::Offline)
                .map(|m| m.spec.id.clone())
                .collect()
        };

        for id in ids {
            if let Err(e) = self.bring_online(&id).await {
                error!(machine_id = %id, error = %e, "Machine failed to come online");
            }
        }
    }

    /// Power on and restore a machine to its baseline
    pub async fn bring_online(&self, machine_id: &str) -> Result<(), SandboxError> {
        let spec = {
            let mut inventory = self.machines.lock().await;
            let machine = inventory
                .get_mut(machine_id)
                .ok_or_else(|| SandboxError::NotFound(format!("machine {}", machine_id)))?;
            machine.transition(MachineState::Starting)?;
            machine.spec.clone()
        };

        if let Err(e) = self.hypervisor.start_machine(machine_id).await {
            self.fault(machine_id).await;
            return Err(e);
        }

        self.revert_outside_lock(machine_id, &spec.snapshot).await?;
        info!(machine_id = %machine_id, platform = %spec.platform, "Machine online");
        Ok(())
    }

    /// Hand out an idle machine matching the platform tag.
    ///
    /// Atomic with respect to concurrent callers: the full read-modify-write
    /// happens under one lock, so no two tasks can receive the same machine.
    pub async fn allocate(
        &self,
        platform: &str,
        task_id: Uuid,
    ) -> Result<MachineLease, SandboxError> {
        let mut inventory = self.machines.lock().await;

        let mut candidates: Vec<&mut Machine> = inventory
            .values_mut()
            .filter(|m| m.is_available() && m.spec.platform == platform)
            .collect();
        // Deterministic pick order keeps scheduling reproducible
        candidates.sort_by(|a, b| a.spec.id.cmp(&b.spec.id));

        match candidates.into_iter().next() {
            Some(machine) => {
                machine.transition(MachineState::Allocated)?;
                machine.current_task = Some(task_id);
                debug!(machine_id = %machine.spec.id, %task_id, "Machine allocated");
                Ok(MachineLease {
                    machine_id: machine.spec.id.clone(),
                    spec: machine.spec.clone(),
                })
            }
            None => Err(SandboxError::NoCapacity(platform.to_string())),
        }
    }

    /// Return a machine to the pool, restoring its baseline snapshot.
    ///
    /// Idempotent: releasing an already-idle machine is a no-op. Terminates
    /// in `Idle` or `Error`, never `Reverting`.
    pub async fn release(&self, machine_id: &str) -> Result<(), SandboxError> {
        let snapshot = {
            let mut inventory = self.machines.lock().await;
            let machine = inventory
                .get_mut(machine_id)
                .ok_or_else(|| SandboxError::NotFound(format!("machine {}", machine_id)))?;

            match machine.state {
                MachineState::Idle => {
                    debug!(machine_id = %machine_id, "Release of idle machine is a no-op");
                    return Ok(());
                }
                MachineState::Reverting => {
                    debug!(machine_id = %machine_id, "Release already in progress");
                    return Ok(());
                }
                MachineState::Error => {
                    return Err(SandboxError::MachineFaulted(machine_id.to_string()));
                }
                MachineState::Allocated => {
                    machine.transition(MachineState::Reverting)?;
                    machine.current_task = None;
                    machine.spec.snapshot.clone()
                }
                state => {
                    return Err(SandboxError::Internal(format!(
                        "release of machine {} in state {}",
                        machine_id,
                        state.as_str()
                    )));
                }
            }
        };

        self.revert_outside_lock(machine_id, &snapshot).await
    }

    /// External health-check hook: put a cordoned machine back through the
    /// offline/starting path.
    pub async fn clear_cordon(&self, machine_id: &str) -> Result<(), SandboxError> {
        {
            let mut inventory = self.machines.lock().await;
            let machine = inventory
                .get_mut(machine_id)
                .ok_or_else(|| SandboxError::NotFound(format!("machine {}", machine_id)))?;
            machine.transition(MachineState::Offline)?;
            machine.consecutive_failures = 0;
        }
        info!(machine_id = %machine_id, "Cordon cleared, restarting machine");
        self.bring_online(machine_id).await
    }

    /// Snapshot revert with bounded retries and backoff. The inventory lock
    /// is only taken to record the outcome.
    async fn revert_outside_lock(
        &self,
        machine_id: &str,
        snapshot: &str,
    ) -> Result<(), SandboxError> {
        let max_attempts = self.config.revert_max_attempts.max(1);

        for attempt in 1..=max_attempts {
            match self.hypervisor.revert_snapshot(machine_id, snapshot).await {
                Ok(()) => {
                    let mut inventory = self.machines.lock().await;
                    if let Some(machine) = inventory.get_mut(machine_id) {
                        machine.transition(MachineState::Idle)?;
                        machine.consecutive_failures = 0;
                    }
                    debug!(machine_id = %machine_id, attempt, "Baseline restored");
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        machine_id = %machine_id,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Snapshot revert failed"
                    );
                    if attempt < max_attempts {
                        let backoff = self.config.revert_backoff() * attempt;
                        let jitter_ms = {
                            let mut rng = rand::thread_rng();
                            rng.gen_range(0..=self.config.revert_backoff_ms / 4 + 1)
                        };
                        tokio::time::sleep(backoff + std::time::Duration::from_millis(jitter_ms))
                            .await;
                    }
                }
            }
        }

        self.fault(machine_id).await;
        Err(SandboxError::MachineFaulted(machine_id.to_string()))
    }

    /// Cordon a machine after an operation failure
    async fn fault(&self, machine_id: &str) {
        let mut inventory = self.machines.lock().await;
        if let Some(machine) = inventory.get_mut(machine_id) {
            machine.state = MachineState::Error;
            machine.current_task = None;
            machine.consecutive_failures += 1;
            error!(
                machine_id = %machine_id,
                consecutive_failures = machine.consecutive_failures,
                "Machine cordoned"
            );
        }
    }

    pub async fn consecutive_failures(&self, machine_id: &str) -> u32 {
        let inventory = self.machines.lock().await;
        inventory
            .get(machine_id)
            .map(|m| m.consecutive_failures)
            .unwrap_or(0)
    }

    pub async fn status(&self) -> Vec<MachineStatus> {
        let inventory = self.machines.lock().await;
        let mut statuses: Vec<MachineStatus> = inventory.values().map(MachineStatus::from).collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    pub async fn stats(&self) -> PoolStats {
        let inventory = self.machines.lock().await;
        let mut stats = PoolStats {
            total: inventory.len(),
            ..Default::default()
        };
        for machine in inventory.values() {
            match machine.state {
                MachineState::Idle => stats.idle += 1,
                MachineState::Allocated => stats.allocated += 1,
                MachineState::Error => stats.cordoned += 1,
                _ => {}
            }
        }
        stats
    }

    pub async fn machine_state(&self, machine_id: &str) -> Option<MachineState> {
        let inventory = self.machines.lock().await;
        inventory.get(machine_id).map(|m| m.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_machines;
    use crate::testkit::StubHypervisor;

    fn pool_config(machines: &str) -> PoolConfig {
        PoolConfig {
            machines: parse_machines(machines).unwrap(),
            revert_max_attempts: 2,
            revert_backoff_ms: 1,
            hypervisor_bin: "vmctl".to_string(),
        }
    }

    fn two_machine_pool(hypervisor: Arc<StubHypervisor>) -> MachinePool {
        MachinePool::new(
            pool_config(
                "vm-01:linux-x64:baseline:vnet0:10.0.0.1,vm-02:linux-x64:baseline:vnet1:10.0.0.2",
            ),
            hypervisor,
        )
    }

    #[tokio::test]
    async fn test_allocation_requires_idle() {
        let pool = two_machine_pool(Arc::new(StubHypervisor::default()));
        // All machines are still offline
        let err = pool.allocate("linux-x64", Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, SandboxError::NoCapacity(_)));
    }

    #[tokio::test]
    async fn test_exclusive_allocation_under_concurrency() {
        let pool = Arc::new(two_machine_pool(Arc::new(StubHypervisor::default())));
        pool.start_all().await;

        let mut handles = Vec::new();
        for _ in 0..4 {
            let pool = Arc::clone(&pool);
            handles.push(tokio::spawn(async move {
                pool.allocate("linux-x64", Uuid::new_v4()).await
            }));
        }

        let mut granted = Vec::new();
        let mut rejected = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(lease) => granted.push(lease.machine_id),
                Err(SandboxError::NoCapacity(_)) => rejected += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        granted.sort();
        granted.dedup();
        assert_eq!(granted.len(), 2, "each machine may be granted once");
        assert_eq!(rejected, 2);
    }

    #[tokio::test]
    async fn test_platform_tag_is_respected() {
        let hypervisor = Arc::new(StubHypervisor::default());
        let pool = MachinePool::new(
            pool_config("vm-01:windows-x64:baseline:vnet0:10.0.0.1"),
            hypervisor,
        );
        pool.start_all().await;

        let err = pool.allocate("linux-x64", Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, SandboxError::NoCapacity(_)));
        assert!(pool.allocate("windows-x64", Uuid::new_v4()).await.is_ok());
    }

    #[tokio::test]
    async fn test_release_returns_machine_to_idle() {
        let hypervisor = Arc::new(StubHypervisor::default());
        let pool = two_machine_pool(Arc::clone(&hypervisor));
        pool.start_all().await;

        let lease = pool.allocate("linux-x64", Uuid::new_v4()).await.unwrap();
        assert_eq!(
            pool.machine_state(&lease.machine_id).await,
            Some(MachineState::Allocated)
        );

        pool.release(&lease.machine_id).await.unwrap();
        assert_eq!(
            pool.machine_state(&lease.machine_id).await,
            Some(MachineState::Idle)
        );
        // start_all powered on and reverted both machines, release adds one revert
        assert_eq!(hypervisor.start_count(), 2);
        assert_eq!(hypervisor.revert_count(), 3);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let hypervisor = Arc::new(StubHypervisor::default());
        let pool = two_machine_pool(Arc::clone(&hypervisor));
        pool.start_all().await;

        let lease = pool.allocate("linux-x64", Uuid::new_v4()).await.unwrap();
        pool.release(&lease.machine_id).await.unwrap();
        let reverts_after_first = hypervisor.revert_count();

        // Second release of an idle machine does not touch the hypervisor
        pool.release(&lease.machine_id).await.unwrap();
        assert_eq!(hypervisor.revert_count(), reverts_after_first);
        assert_eq!(
            pool.machine_state(&lease.machine_id).await,
            Some(MachineState::Idle)
        );
    }

    #[tokio::test]
    async fn test_revert_failure_cordons_machine() {
        let hypervisor = Arc::new(StubHypervisor::default());
        let pool = two_machine_pool(Arc::clone(&hypervisor));
        pool.start_all().await;

        let lease = pool.allocate("linux-x64", Uuid::new_v4()).await.unwrap();
        hypervisor.fail_reverts(usize::MAX);

        let err = pool.release(&lease.machine_id).await.unwrap_err();
        assert!(matches!(err, SandboxError::MachineFaulted(_)));
        // Never stuck in Reverting: ends in Error
        assert_eq!(
            pool.machine_state(&lease.machine_id).await,
            Some(MachineState::Error)
        );
        assert_eq!(pool.consecutive_failures(&lease.machine_id).await, 1);

        // Cordoned machines are excluded from allocation
        let remaining = pool.allocate("linux-x64", Uuid::new_v4()).await.unwrap();
        assert_ne!(remaining.machine_id, lease.machine_id);
        let err = pool.allocate("linux-x64", Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, SandboxError::NoCapacity(_)));
    }

    #[tokio::test]
    async fn test_transient_revert_failure_recovers() {
        let hypervisor = Arc::new(StubHypervisor::default());
        let pool = two_machine_pool(Arc::clone(&hypervisor));
        pool.start_all().await;

        let lease = pool.allocate("linux-x64", Uuid::new_v4()).await.unwrap();
        // One failure, then success: within the retry budget of 2
        hypervisor.fail_reverts(1);

        pool.release(&lease.machine_id).await.unwrap();
        assert_eq!(
            pool.machine_state(&lease.machine_id).await,
            Some(MachineState::Idle)
        );
        assert_eq!(pool.consecutive_failures(&lease.machine_id).await, 0);
    }

    #[tokio::test]
    async fn test_clear_cordon_restores_availability() {
        let hypervisor = Arc::new(StubHypervisor::default());
        let pool = two_machine_pool(Arc::clone(&hypervisor));
        pool.start_all().await;

        let lease = pool.allocate("linux-x64", Uuid::new_v4()).await.unwrap();
        hypervisor.fail_reverts(usize::MAX);
        let _ = pool.release(&lease.machine_id).await;
        assert_eq!(
            pool.machine_state(&lease.machine_id).await,
            Some(MachineState::Error)
        );

        hypervisor.fail_reverts(0);
        pool.clear_cordon(&lease.machine_id).await.unwrap();
        assert_eq!(
            pool.machine_state(&lease.machine_id).await,
            Some(MachineState::Idle)
        );
        assert_eq!(pool.consecutive_failures(&lease.machine_id).await, 0);
    }
}
