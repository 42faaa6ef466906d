/// Configuration module for the detonation engine
///
/// Centralized configuration management with support for:
/// - Environment variable loading
/// - Default values
/// - Configuration validation
/// - Per-subsystem sections (server, pool, scheduler, supervisor, ...)

use std::collections::BTreeMap;
use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::models::machine::MachineSpec;
use crate::models::report::BehaviorCategory;

/// Main configuration structure for the detonation engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub pool: PoolConfig,
    pub capture: CaptureConfig,
    pub scheduler: SchedulerConfig,
    pub supervisor: SupervisorConfig,
    pub agent: AgentConfig,
    pub fusion: FusionConfig,
    pub intel: IntelConfig,
    pub store: StoreConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if present

        Ok(Self {
            server: ServerConfig::from_env()?,
            storage: StorageConfig::from_env()?,
            pool: PoolConfig::from_env()?,
            capture: CaptureConfig::from_env()?,
            scheduler: SchedulerConfig::from_env()?,
            supervisor: SupervisorConfig::from_env()?,
            agent: AgentConfig::from_env()?,
            fusion: FusionConfig::from_env()?,
            intel: IntelConfig::from_env()?,
            store: StoreConfig::from_env()?,
            logging: LoggingConfig::from_env()?,
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.server.validate()?;
        self.pool.validate()?;
        self.scheduler.validate()?;
        self.supervisor.validate()?;
        self.agent.validate()?;
        self.fusion.validate()?;
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            pool: PoolConfig::default(),
            capture: CaptureConfig::default(),
            scheduler: SchedulerConfig::default(),
            supervisor: SupervisorConfig::default(),
            agent: AgentConfig::default(),
            fusion: FusionConfig::default(),
            intel: IntelConfig::default(),
            store: StoreConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    let raw = env::var(key).unwrap_or_else(|_| default.to_string());
    raw.parse()
        .map_err(|e| anyhow::anyhow!("Invalid {}: {}", key, e))
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub enable_cors: bool,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_parse("SERVER_PORT", "8030")?,
            enable_cors: env_parse("ENABLE_CORS", "true")?,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("Server port cannot be 0");
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8030,
            enable_cors: true,
        }
    }
}

/// Local storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub spool_dir: String,
}

impl StorageConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            spool_dir: env::var("SPOOL_DIR").unwrap_or_else(|_| "./spool".to_string()),
        })
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            spool_dir: "./spool".to_string(),
        }
    }
}

/// Machine pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub machines: Vec<MachineSpec>,
    pub revert_max_attempts: u32,
    pub revert_backoff_ms: u64,
    pub hypervisor_bin: String,
}

impl PoolConfig {
    pub fn from_env() -> Result<Self> {
        let machines = match env::var("POOL_MACHINES") {
            Ok(raw) => parse_machines(&raw)?,
            Err(_) => Vec::new(),
        };

        Ok(Self {
            machines,
            revert_max_attempts: env_parse("POOL_REVERT_MAX_ATTEMPTS", "3")?,
            revert_backoff_ms: env_parse("POOL_REVERT_BACKOFF_MS", "2000")?,
            hypervisor_bin: env::var("HYPERVISOR_BIN")
                .unwrap_or_else(|_| "vmctl".to_string()),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.revert_max_attempts == 0 {
            anyhow::bail!("Revert attempts must be at least 1");
        }
        let mut seen = std::collections::HashSet::new();
        for machine in &self.machines {
            if !seen.insert(&machine.id) {
                anyhow::bail!("Duplicate machine id '{}'", machine.id);
            }
        }
        Ok(())
    }

    pub fn revert_backoff(&self) -> Duration {
        Duration::from_millis(self.revert_backoff_ms)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            machines: Vec::new(),
            revert_max_attempts: 3,
            revert_backoff_ms: 2000,
            hypervisor_bin: "vmctl".to_string(),
        }
    }
}

/// Parse `id:platform:snapshot:interface:guest_addr` entries, comma-separated
pub fn parse_machines(raw: &str) -> Result<Vec<MachineSpec>> {
    let mut machines = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let fields: Vec<&str> = entry.split(':').collect();
        if fields.len() != 5 || fields.iter().any(|f| f.is_empty()) {
            anyhow::bail!(
                "Invalid POOL_MACHINES entry '{}': expected id:platform:snapshot:interface:guest_addr",
                entry
            );
        }
        machines.push(MachineSpec {
            id: fields[0].to_string(),
            platform: fields[1].to_string(),
            snapshot: fields[2].to_string(),
            network_interface: fields[3].to_string(),
            guest_addr: fields[4].to_string(),
        });
    }
    Ok(machines)
}

/// Packet capture configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    pub binary: String,
    pub output_dir: String,
}

impl CaptureConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            binary: env::var("CAPTURE_BIN").unwrap_or_else(|_| "tcpdump".to_string()),
            output_dir: env::var("CAPTURE_DIR").unwrap_or_else(|_| "./captures".to_string()),
        })
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            binary: "tcpdump".to_string(),
            output_dir: "./captures".to_string(),
        }
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Admission ceiling on concurrently running tasks, independent of pool size
    pub max_running: usize,
    pub tick_interval_ms: u64,
    /// Bounded retry budget for infrastructure failures
    pub max_retries: u32,
    pub default_max_run_secs: u64,
}

impl SchedulerConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            max_running: env_parse("SCHEDULER_MAX_RUNNING", "8")?,
            tick_interval_ms: env_parse("SCHEDULER_TICK_INTERVAL_MS", "2000")?,
            max_retries: env_parse("SCHEDULER_MAX_RETRIES", "1")?,
            default_max_run_secs: env_parse("SCHEDULER_DEFAULT_MAX_RUN_SECS", "120")?,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_running == 0 {
            anyhow::bail!("Scheduler max_running must be at least 1");
        }
        if self.default_max_run_secs == 0 {
            anyhow::bail!("Default max run duration cannot be 0");
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn default_max_run(&self) -> Duration {
        Duration::from_secs(self.default_max_run_secs)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_running: 8,
            tick_interval_ms: 2000,
            max_retries: 1,
            default_max_run_secs: 120,
        }
    }
}

/// Execution supervisor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    pub poll_interval_ms: u64,
    /// Longest tolerated agent silence before the run is declared unreachable
    pub liveness_deadline_ms: u64,
    /// Wait after a graceful terminate before forcing power-off
    pub grace_period_ms: u64,
}

impl SupervisorConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            poll_interval_ms: env_parse("SUPERVISOR_POLL_INTERVAL_MS", "2000")?,
            liveness_deadline_ms: env_parse("SUPERVISOR_LIVENESS_DEADLINE_MS", "30000")?,
            grace_period_ms: env_parse("SUPERVISOR_GRACE_PERIOD_MS", "5000")?,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            anyhow::bail!("Supervisor poll interval cannot be 0");
        }
        if self.liveness_deadline_ms < self.poll_interval_ms {
            anyhow::bail!("Liveness deadline must cover at least one poll interval");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn liveness_deadline(&self) -> Duration {
        Duration::from_millis(self.liveness_deadline_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            liveness_deadline_ms: 30_000,
            grace_period_ms: 5000,
        }
    }
}

/// Agent protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Guest port the agent listens on
    pub port: u16,
    pub protocol_version: u32,
    pub min_protocol_version: u32,
    pub handshake_deadline_secs: u64,
    pub call_timeout_secs: u64,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            port: env_parse("AGENT_PORT", "8554")?,
            protocol_version: env_parse("AGENT_PROTOCOL_VERSION", "3")?,
            min_protocol_version: env_parse("AGENT_MIN_PROTOCOL_VERSION", "2")?,
            handshake_deadline_secs: env_parse("AGENT_HANDSHAKE_DEADLINE_SECS", "30")?,
            call_timeout_secs: env_parse("AGENT_CALL_TIMEOUT_SECS", "10")?,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_protocol_version > self.protocol_version {
            anyhow::bail!("Minimum protocol version exceeds current protocol version");
        }
        if self.handshake_deadline_secs == 0 {
            anyhow::bail!("Handshake deadline cannot be 0");
        }
        Ok(())
    }

    pub fn handshake_deadline(&self) -> Duration {
        Duration::from_secs(self.handshake_deadline_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            port: 8554,
            protocol_version: 3,
            min_protocol_version: 2,
            handshake_deadline_secs: 30,
            call_timeout_secs: 10,
        }
    }
}

/// Fusion scoring configuration.
///
/// The weighting scheme is a policy choice: everything here is tunable
/// rather than baked into the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionConfig {
    /// Fuzzy matches below this similarity percentage are ignored
    pub similarity_threshold: f64,
    /// Base weight of one fuzzy match, scaled by similarity/100
    pub fuzzy_match_weight: f64,
    pub suspicious_threshold: f64,
    pub malicious_threshold: f64,
    /// Per-category behavior weights, each counted at most once per task
    pub category_weights: BTreeMap<BehaviorCategory, f64>,
}

impl FusionConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        config.similarity_threshold = env_parse("FUSION_SIMILARITY_THRESHOLD", "70")?;
        config.fuzzy_match_weight = env_parse("FUSION_FUZZY_WEIGHT", "25")?;
        config.suspicious_threshold = env_parse("FUSION_SUSPICIOUS_THRESHOLD", "40")?;
        config.malicious_threshold = env_parse("FUSION_MALICIOUS_THRESHOLD", "70")?;

        if let Ok(raw) = env::var("FUSION_CATEGORY_WEIGHTS") {
            config.category_weights = parse_category_weights(&raw)?;
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=100.0).contains(&self.similarity_threshold) {
            anyhow::bail!("Similarity threshold must be within 0..=100");
        }
        if self.suspicious_threshold > self.malicious_threshold {
            anyhow::bail!("Suspicious threshold cannot exceed malicious threshold");
        }
        if self.fuzzy_match_weight < 0.0 {
            anyhow::bail!("Fuzzy match weight cannot be negative");
        }
        if self.category_weights.values().any(|w| *w < 0.0) {
            anyhow::bail!("Behavior category weights cannot be negative");
        }
        Ok(())
    }
}

impl Default for FusionConfig {
    fn default() -> Self {
        let mut category_weights = BTreeMap::new();
        category_weights.insert(BehaviorCategory::PersistenceModification, 25.0);
        category_weights.insert(BehaviorCategory::FlaggedConnection, 30.0);
        category_weights.insert(BehaviorCategory::ProcessInjection, 30.0);
        category_weights.insert(BehaviorCategory::FileSystemTampering, 20.0);
        category_weights.insert(BehaviorCategory::RegistryModification, 10.0);
        category_weights.insert(BehaviorCategory::ServiceInstallation, 20.0);

        Self {
            similarity_threshold: 70.0,
            fuzzy_match_weight: 25.0,
            suspicious_threshold: 40.0,
            malicious_threshold: 70.0,
            category_weights,
        }
    }
}

/// Parse `category=weight` pairs, comma-separated
fn parse_category_weights(raw: &str) -> Result<BTreeMap<BehaviorCategory, f64>> {
    let mut weights = BTreeMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (name, value) = pair
            .split_once('=')
            .with_context(|| format!("Invalid FUSION_CATEGORY_WEIGHTS pair '{}'", pair))?;
        let category = BehaviorCategory::parse(name.trim())
            .with_context(|| format!("Unknown behavior category '{}'", name))?;
        let weight: f64 = value
            .trim()
            .parse()
            .with_context(|| format!("Invalid weight for category '{}'", name))?;
        weights.insert(category, weight);
    }
    Ok(weights)
}

/// Intel collaborator configuration (signature matching + fuzzy hashing)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntelConfig {
    pub endpoint: Option<String>,
    pub request_timeout_secs: u64,
}

impl IntelConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            endpoint: env::var("INTEL_ENDPOINT").ok(),
            request_timeout_secs: env_parse("INTEL_REQUEST_TIMEOUT_SECS", "15")?,
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for IntelConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            request_timeout_secs: 15,
        }
    }
}

/// Persistent store collaborator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub endpoint: Option<String>,
    pub max_attempts: u32,
    pub retry_delay_secs: u64,
}

impl StoreConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            endpoint: env::var("STORE_ENDPOINT").ok(),
            max_attempts: env_parse("STORE_MAX_ATTEMPTS", "5")?,
            retry_delay_secs: env_parse("STORE_RETRY_DELAY_SECS", "3")?,
        })
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            max_attempts: 5,
            retry_delay_secs: 3,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl LoggingConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string()),
        })
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_machines() {
        let machines =
            parse_machines("vm-01:windows-x64:baseline:vnet0:192.168.56.101, vm-02:linux-x64:clean:vnet1:192.168.56.102")
                .unwrap();
        assert_eq!(machines.len(), 2);
        assert_eq!(machines[0].id, "vm-01");
        assert_eq!(machines[1].platform, "linux-x64");
        assert_eq!(machines[1].guest_addr, "192.168.56.102");
    }

    #[test]
    fn test_parse_machines_rejects_malformed_entries() {
        assert!(parse_machines("vm-01:windows-x64:baseline").is_err());
        assert!(parse_machines("vm-01:windows-x64::vnet0:10.0.0.1").is_err());
    }

    #[test]
    fn test_parse_category_weights() {
        let weights =
            parse_category_weights("persistence_modification=25, flagged_connection=35").unwrap();
        assert_eq!(
            weights.get(&BehaviorCategory::PersistenceModification),
            Some(&25.0)
        );
        assert_eq!(weights.get(&BehaviorCategory::FlaggedConnection), Some(&35.0));
        assert!(parse_category_weights("nonsense=1").is_err());
    }

    #[test]
    fn test_fusion_threshold_ordering_enforced() {
        let mut config = FusionConfig::default();
        config.suspicious_threshold = 90.0;
        config.malicious_threshold = 50.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_machine_ids_rejected() {
        let mut config = PoolConfig::default();
        config.machines =
            parse_machines("vm-01:linux-x64:s:vnet0:10.0.0.1,vm-01:linux-x64:s:vnet1:10.0.0.2")
                .unwrap();
        assert!(config.validate().is_err());
    }
}
