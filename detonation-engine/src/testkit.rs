//! Shared test doubles: scripted agent transports and stub collaborators.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use shared::SandboxError;

use crate::agent::protocol::{AgentRequest, AgentResponse};
use crate::agent::transport::{AgentConnector, AgentTransport};
use crate::models::machine::MachineSpec;
use crate::models::report::{
    ArtifactManifest, BehaviorCategory, BehaviorEvent, FuzzyMatch, ManifestEntry, SignatureHit,
};
use crate::models::task::{FileType, SampleRef, Task, TaskPriority};
use crate::pool::MachineLease;
use crate::services::capture::{CaptureClient, CaptureHandle};
use crate::services::hypervisor::HypervisorClient;
use crate::services::intel::{FuzzyHashClient, SignatureClient};

pub fn machine_spec(id: &str) -> MachineSpec {
    MachineSpec {
        id: id.to_string(),
        platform: "linux-x64".to_string(),
        snapshot: "baseline".to_string(),
        network_interface: "vnet0".to_string(),
        guest_addr: "127.0.0.1".to_string(),
    }
}

pub fn lease_for(id: &str, platform: &str) -> MachineLease {
    let mut spec = machine_spec(id);
    spec.platform = platform.to_string();
    MachineLease {
        machine_id: id.to_string(),
        spec,
    }
}

/// A sample spooled to a real temp file so supervisors can read it back
pub fn sample_ref() -> SampleRef {
    let bytes: &[u8] = b"MZ\x90\x00scripted sample";
    let path = std::env::temp_dir().join(format!("detonation-test-{}", Uuid::new_v4()));
    std::fs::write(&path, bytes).expect("write test sample");
    SampleRef {
        sha256: crate::utils::sha256_hex(bytes),
        size: bytes.len() as u64,
        path,
        file_name: Some("sample.exe".to_string()),
    }
}

pub fn sample_task(platform: &str) -> Task {
    sample_task_with_duration(platform, Duration::from_secs(120))
}

pub fn sample_task_with_duration(platform: &str, max_run: Duration) -> Task {
    Task::new(
        sample_ref(),
        platform.to_string(),
        FileType::Exe,
        TaskPriority::Normal,
        max_run,
        1,
    )
}

fn pulse_event() -> BehaviorEvent {
    BehaviorEvent {
        category: BehaviorCategory::FlaggedConnection,
        description: "connect 203.0.113.7:443".to_string(),
        timestamp: Utc::now(),
    }
}

fn completion_event() -> BehaviorEvent {
    BehaviorEvent {
        category: BehaviorCategory::PersistenceModification,
        description: "run-key added".to_string(),
        timestamp: Utc::now(),
    }
}

/// Behavior of one scripted agent connection
#[derive(Debug, Clone)]
pub enum AgentScript {
    /// Never answers anything
    Unreachable,
    /// Acks the handshake with an unsupported protocol version
    WrongVersion,
    /// Corrupts the checksum echoed on transfer
    BadChecksum,
    /// Pulses N times, then signals completion
    Happy { pulses: usize },
    /// Pulses forever but still confirms termination
    NeverCompletes,
    /// Pulses forever and ignores terminate requests
    DeafToTerminate,
    /// Answers the first N calls, then goes silent
    VanishesAfter { calls: usize },
}

impl AgentScript {
    pub fn happy(pulses: usize) -> Self {
        AgentScript::Happy { pulses }
    }
}

pub struct ScriptedTransport {
    script: AgentScript,
    answered: usize,
    pulses_sent: usize,
}

impl ScriptedTransport {
    fn new(script: AgentScript) -> Self {
        Self {
            script,
            answered: 0,
            pulses_sent: 0,
        }
    }

    fn manifest() -> ArtifactManifest {
        ArtifactManifest {
            entries: vec![ManifestEntry {
                name: "execution.log".to_string(),
                kind: "log".to_string(),
                size: 2048,
            }],
        }
    }
}

#[async_trait]
impl AgentTransport for ScriptedTransport {
    async fn call(&mut self, request: AgentRequest) -> Result<AgentResponse, SandboxError> {
        if matches!(self.script, AgentScript::Unreachable) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if let AgentScript::VanishesAfter { calls } = self.script {
            if self.answered >= calls {
                // Emulate the transport-level read deadline
                tokio::time::sleep(Duration::from_millis(20)).await;
                return Err(SandboxError::AgentUnreachable("scripted silence".to_string()));
            }
        }
        self.answered += 1;

        let response = match request {
            AgentRequest::Handshake { version } => match self.script {
                AgentScript::WrongVersion => AgentResponse::HandshakeAck { version: 999 },
                _ => AgentResponse::HandshakeAck { version },
            },
            AgentRequest::Transfer { checksum, .. } => match self.script {
                AgentScript::BadChecksum => AgentResponse::TransferAck {
                    checksum: "deadbeef".to_string(),
                },
                _ => AgentResponse::TransferAck { checksum },
            },
            AgentRequest::Execute { .. } => AgentResponse::Started,
            AgentRequest::Heartbeat => match self.script {
                AgentScript::Happy { pulses } if self.pulses_sent >= pulses => {
                    AgentResponse::Completion {
                        manifest: Self::manifest(),
                        events: vec![completion_event()],
                        log: vec!["process exited".to_string()],
                    }
                }
                _ => {
                    self.pulses_sent += 1;
                    AgentResponse::Pulse {
                        events: vec![pulse_event()],
                        log: vec![format!("pulse {}", self.pulses_sent)],
                    }
                }
            },
            AgentRequest::Terminate => match self.script {
                AgentScript::DeafToTerminate => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    AgentResponse::Terminated
                }
                _ => AgentResponse::Terminated,
            },
        };

        Ok(response)
    }
}

/// Hands out scripted transports: a fixed sequence first, then the
/// repeating default.
pub struct ScriptedConnector {
    sequence: Mutex<VecDeque<AgentScript>>,
    default: Option<AgentScript>,
    connects: AtomicUsize,
}

impl ScriptedConnector {
    pub fn repeating(script: AgentScript) -> Self {
        Self {
            sequence: Mutex::new(VecDeque::new()),
            default: Some(script),
            connects: AtomicUsize::new(0),
        }
    }

    pub fn sequence(scripts: Vec<AgentScript>) -> Self {
        Self {
            sequence: Mutex::new(scripts.into()),
            default: None,
            connects: AtomicUsize::new(0),
        }
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentConnector for ScriptedConnector {
    async fn connect(
        &self,
        _machine: &MachineSpec,
    ) -> Result<Box<dyn AgentTransport>, SandboxError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let script = {
            let mut sequence = self.sequence.lock().unwrap();
            sequence.pop_front().or_else(|| self.default.clone())
        };
        match script {
            Some(script) => Ok(Box::new(ScriptedTransport::new(script))),
            None => Err(SandboxError::AgentUnreachable(
                "no script left for connection".to_string(),
            )),
        }
    }
}

/// Recording hypervisor stub with programmable revert failures
#[derive(Default)]
pub struct StubHypervisor {
    starts: AtomicUsize,
    stops: AtomicUsize,
    reverts: AtomicUsize,
    fail_reverts_remaining: AtomicUsize,
}

impl StubHypervisor {
    /// Fail the next `n` revert attempts (`usize::MAX` = fail forever)
    pub fn fail_reverts(&self, n: usize) {
        self.fail_reverts_remaining.store(n, Ordering::SeqCst);
    }

    pub fn revert_count(&self) -> usize {
        self.reverts.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HypervisorClient for StubHypervisor {
    async fn start_machine(&self, _machine_id: &str) -> Result<(), SandboxError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_machine(&self, _machine_id: &str) -> Result<(), SandboxError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn revert_snapshot(&self, machine_id: &str, _snapshot: &str) -> Result<(), SandboxError> {
        let remaining = self.fail_reverts_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            if remaining != usize::MAX {
                self.fail_reverts_remaining
                    .store(remaining - 1, Ordering::SeqCst);
            }
            return Err(SandboxError::Hypervisor(format!(
                "scripted revert failure for {}",
                machine_id
            )));
        }
        self.reverts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Recording capture stub; no real processes involved
#[derive(Default)]
pub struct StubCapture {
    started: AtomicUsize,
    stopped: AtomicUsize,
    fail_next_start: AtomicBool,
}

impl StubCapture {
    pub fn fail_next_start(&self) {
        self.fail_next_start.store(true, Ordering::SeqCst);
    }

    pub fn started_count(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn stopped_count(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CaptureClient for StubCapture {
    async fn start_capture(
        &self,
        task_id: Uuid,
        _interface: &str,
    ) -> Result<CaptureHandle, SandboxError> {
        if self.fail_next_start.swap(false, Ordering::SeqCst) {
            return Err(SandboxError::Capture("scripted capture failure".to_string()));
        }
        self.started.fetch_add(1, Ordering::SeqCst);
        Ok(CaptureHandle {
            task_id,
            pcap_path: PathBuf::from(format!("/tmp/{}.pcap", task_id)),
        })
    }

    async fn stop_capture(&self, handle: CaptureHandle) -> Result<PathBuf, SandboxError> {
        self.stopped.fetch_add(1, Ordering::SeqCst);
        Ok(handle.pcap_path)
    }
}

/// Intel collaborator that is always down
pub struct FailingIntel;

#[async_trait]
impl SignatureClient for FailingIntel {
    async fn match_sample(&self, _sample: &SampleRef) -> Result<Vec<SignatureHit>, SandboxError> {
        Err(SandboxError::ExternalService("signature service down".to_string()))
    }
}

#[async_trait]
impl FuzzyHashClient for FailingIntel {
    async fn similar_samples(&self, _sample: &SampleRef) -> Result<Vec<FuzzyMatch>, SandboxError> {
        Err(SandboxError::ExternalService("fuzzy service down".to_string()))
    }
}
