use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a disposable analysis machine
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MachineState {
    /// Known to the pool but powered down
    Offline,
    /// Power-on and baseline restore in progress
    Starting,
    /// Clean baseline, available for allocation
    Idle,
    /// Leased to exactly one running task
    Allocated,
    /// Snapshot restore in progress after a run
    Reverting,
    /// Cordoned after repeated failures; needs an external health check
    Error,
}

impl MachineState {
    pub fn can_transition_to(self, next: MachineState) -> bool {
        use MachineState::*;
        matches!(
            (self, next),
            (Offline, Starting)
                | (Starting, Idle)
                | (Starting, Error)
                | (Idle, Allocated)
                | (Allocated, Reverting)
                | (Allocated, Error)
                | (Reverting, Idle)
                | (Reverting, Error)
                | (Error, Offline) // external health-check recovery
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MachineState::Offline => "offline",
            MachineState::Starting => "starting",
            MachineState::Idle => "idle",
            MachineState::Allocated => "allocated",
            MachineState::Reverting => "reverting",
            MachineState::Error => "error",
        }
    }
}

/// Static description of a pool machine, parsed from configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MachineSpec {
    pub id: String,
    pub platform: String,
    pub snapshot: String,
    pub network_interface: String,
    pub guest_addr: String,
}

/// A disposable VM resource, owned exclusively by the pool
#[derive(Debug, Clone)]
pub struct Machine {
    pub spec: MachineSpec,
    pub state: MachineState,
    pub consecutive_failures: u32,
    pub current_task: Option<Uuid>,
    pub last_state_change: DateTime<Utc>,
}

impl Machine {
    pub fn new(spec: MachineSpec) -> Self {
        Self {
            spec,
            state: MachineState::Offline,
            consecutive_failures: 0,
            current_task: None,
            last_state_change: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn is_available(&self) -> bool {
        self.state == MachineState::Idle
    }

    pub fn transition(&mut self, next: MachineState) -> Result<(), shared::SandboxError> {
        if !self.state.can_transition_to(next) {
            return Err(shared::SandboxError::Internal(format!(
                "illegal machine transition {:?} -> {:?} for {}",
                self.state,
                next,
                self.id()
            )));
        }
        self.state = next;
        self.last_state_change = Utc::now();
        Ok(())
    }
}

/// Point-in-time view of one machine, for the HTTP surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineStatus {
    pub id: String,
    pub platform: String,
    pub state: MachineState,
    pub consecutive_failures: u32,
    pub current_task: Option<Uuid>,
    pub last_state_change: DateTime<Utc>,
}

impl From<&Machine> for MachineStatus {
    fn from(m: &Machine) -> Self {
        Self {
            id: m.spec.id.clone(),
            platform: m.spec.platform.clone(),
            state: m.state,
            consecutive_failures: m.consecutive_failures,
            current_task: m.current_task,
            last_state_change: m.last_state_change,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> Machine {
        Machine::new(MachineSpec {
            id: "vm-01".to_string(),
            platform: "linux-x64".to_string(),
            snapshot: "baseline".to_string(),
            network_interface: "vnet0".to_string(),
            guest_addr: "192.168.56.101".to_string(),
        })
    }

    #[test]
    fn test_happy_path_lifecycle() {
        let mut m = machine();
        m.transition(MachineState::Starting).unwrap();
        m.transition(MachineState::Idle).unwrap();
        assert!(m.is_available());
        m.transition(MachineState::Allocated).unwrap();
        m.transition(MachineState::Reverting).unwrap();
        m.transition(MachineState::Idle).unwrap();
        assert!(m.is_available());
    }

    #[test]
    fn test_error_is_reachable_from_operations_only() {
        let mut m = machine();
        // An idle machine cannot fault spontaneously
        m.transition(MachineState::Starting).unwrap();
        m.transition(MachineState::Idle).unwrap();
        assert!(m.transition(MachineState::Error).is_err());

        m.transition(MachineState::Allocated).unwrap();
        m.transition(MachineState::Error).unwrap();
        assert_eq!(m.state, MachineState::Error);

        // Cordoned machines only recover through the health-check path
        assert!(m.transition(MachineState::Idle).is_err());
        m.transition(MachineState::Offline).unwrap();
        m.transition(MachineState::Starting).unwrap();
    }

    #[test]
    fn test_no_allocation_unless_idle() {
        let mut m = machine();
        assert!(m.transition(MachineState::Allocated).is_err());
        m.transition(MachineState::Starting).unwrap();
        assert!(m.transition(MachineState::Allocated).is_err());
    }
}
