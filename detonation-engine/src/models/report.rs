use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Final classification of a sample
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Benign,
    Suspicious,
    Malicious,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Benign => "benign",
            Verdict::Suspicious => "suspicious",
            Verdict::Malicious => "malicious",
        }
    }
}

/// A positive result from the static signature-matching collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureHit {
    pub rule_id: String,
    pub rule_name: String,
    pub weight: f64,
}

/// A resemblance match from the fuzzy-hash collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuzzyMatch {
    pub sample_id: String,
    /// Similarity percentage, 0.0..=100.0
    pub similarity: f64,
}

/// Category of an observed guest behavior. Each category is weighted at
/// most once per task during fusion scoring.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum BehaviorCategory {
    PersistenceModification,
    FlaggedConnection,
    ProcessInjection,
    FileSystemTampering,
    RegistryModification,
    ServiceInstallation,
}

impl BehaviorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            BehaviorCategory::PersistenceModification => "persistence_modification",
            BehaviorCategory::FlaggedConnection => "flagged_connection",
            BehaviorCategory::ProcessInjection => "process_injection",
            BehaviorCategory::FileSystemTampering => "file_system_tampering",
            BehaviorCategory::RegistryModification => "registry_modification",
            BehaviorCategory::ServiceInstallation => "service_installation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "persistence_modification" => Some(BehaviorCategory::PersistenceModification),
            "flagged_connection" => Some(BehaviorCategory::FlaggedConnection),
            "process_injection" => Some(BehaviorCategory::ProcessInjection),
            "file_system_tampering" => Some(BehaviorCategory::FileSystemTampering),
            "registry_modification" => Some(BehaviorCategory::RegistryModification),
            "service_installation" => Some(BehaviorCategory::ServiceInstallation),
            _ => None,
        }
    }
}

/// One time-stamped behavior observation reported by the in-guest agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehaviorEvent {
    pub category: BehaviorCategory,
    pub description: String,
    pub timestamp: DateTime<Utc>,
}

/// Listing of guest-side artifacts named in the agent's completion signal
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArtifactManifest {
    pub entries: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub name: String,
    pub kind: String,
    pub size: u64,
}

/// Everything the supervisor managed to retrieve from one guest run.
/// Populated incrementally while the run is polled, so timeout and
/// failure paths still carry whatever was collected up to that point.
#[derive(Debug, Clone, Default)]
pub struct RunArtifacts {
    pub behavior_events: Vec<BehaviorEvent>,
    pub execution_log: Vec<String>,
    pub manifest: Option<ArtifactManifest>,
    pub capture_file: Option<PathBuf>,
}

impl RunArtifacts {
    pub fn absorb(&mut self, events: Vec<BehaviorEvent>, log: Vec<String>) {
        self.behavior_events.extend(events);
        self.execution_log.extend(log);
    }
}

/// Aggregated analysis output. Immutable once built by the fusion engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub id: Uuid,
    pub task_id: Uuid,
    pub sample_sha256: String,
    pub signature_matches: Vec<SignatureHit>,
    pub fuzzy_matches: Vec<FuzzyMatch>,
    pub behavior_events: Vec<BehaviorEvent>,
    pub capture_ref: Option<PathBuf>,
    /// Set when an intel collaborator was unavailable and its signal
    /// degraded to "no matches"
    pub intel_degraded: bool,
    pub score: f64,
    pub verdict: Verdict,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_behavior_category_round_trip() {
        for cat in [
            BehaviorCategory::PersistenceModification,
            BehaviorCategory::FlaggedConnection,
            BehaviorCategory::ProcessInjection,
            BehaviorCategory::FileSystemTampering,
            BehaviorCategory::RegistryModification,
            BehaviorCategory::ServiceInstallation,
        ] {
            assert_eq!(BehaviorCategory::parse(cat.as_str()), Some(cat));
        }
        assert_eq!(BehaviorCategory::parse("unknown"), None);
    }

    #[test]
    fn test_artifacts_absorb_preserves_order() {
        let mut artifacts = RunArtifacts::default();
        artifacts.absorb(
            vec![BehaviorEvent {
                category: BehaviorCategory::FlaggedConnection,
                description: "connect 203.0.113.7:443".to_string(),
                timestamp: Utc::now(),
            }],
            vec!["spawned child process".to_string()],
        );
        artifacts.absorb(
            vec![BehaviorEvent {
                category: BehaviorCategory::PersistenceModification,
                description: "run-key added".to_string(),
                timestamp: Utc::now(),
            }],
            vec![],
        );

        assert_eq!(artifacts.behavior_events.len(), 2);
        assert_eq!(
            artifacts.behavior_events[0].category,
            BehaviorCategory::FlaggedConnection
        );
        assert_eq!(artifacts.execution_log.len(), 1);
    }
}
