//! Result fusion: static signature and fuzzy-hash signals combined with
//! dynamic behavior into one verdict.
//!
//! Scoring is a pure function of its inputs; the same signal set always
//! yields the same score, which audit and regression tests rely on.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::FusionConfig;
use crate::models::report::{
    AnalysisReport, BehaviorEvent, FuzzyMatch, RunArtifacts, SignatureHit, Verdict,
};
use crate::models::task::Task;
use crate::services::{FuzzyHashClient, SignatureClient};

pub struct FusionEngine {
    config: FusionConfig,
    signatures: Arc<dyn SignatureClient>,
    fuzzy: Arc<dyn FuzzyHashClient>,
}

impl FusionEngine {
    pub fn new(
        config: FusionConfig,
        signatures: Arc<dyn SignatureClient>,
        fuzzy: Arc<dyn FuzzyHashClient>,
    ) -> Self {
        Self {
            config,
            signatures,
            fuzzy,
        }
    }

    /// Query the intel collaborators and fuse everything into a report.
    ///
    /// Collaborator failures degrade to "no matches" with the report's
    /// `intel_degraded` flag set; they never fail the task.
    pub async fn score(&self, task: &Task, artifacts: &RunArtifacts) -> AnalysisReport {
        let mut intel_degraded = false;

        let signature_matches = match self.signatures.match_sample(&task.sample).await {
            Ok(matches) => matches,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Signature service degraded to no matches");
                intel_degraded = true;
                Vec::new()
            }
        };

        let fuzzy_matches = match self.fuzzy.similar_samples(&task.sample).await {
            Ok(matches) => matches,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Fuzzy-hash service degraded to no matches");
                intel_degraded = true;
                Vec::new()
            }
        };

        let (score, verdict) = combine(
            &self.config,
            &signature_matches,
            &fuzzy_matches,
            &artifacts.behavior_events,
        );

        info!(
            task_id = %task.id,
            score,
            verdict = verdict.as_str(),
            signatures = signature_matches.len(),
            fuzzy = fuzzy_matches.len(),
            behaviors = artifacts.behavior_events.len(),
            intel_degraded,
            "Fusion verdict"
        );

        AnalysisReport {
            id: Uuid::new_v4(),
            task_id: task.id,
            sample_sha256: task.sample.sha256.clone(),
            signature_matches,
            fuzzy_matches,
            behavior_events: artifacts.behavior_events.clone(),
            capture_ref: artifacts.capture_file.clone(),
            intel_degraded,
            score,
            verdict,
            created_at: Utc::now(),
        }
    }
}

/// Deterministic weighted sum over all contributing signals.
///
/// Each matched signature contributes its weight; each fuzzy match at or
/// above the similarity threshold contributes the base weight scaled by
/// similarity; each behavior category contributes its configured weight at
/// most once, however often it was observed.
pub fn combine(
    config: &FusionConfig,
    signatures: &[SignatureHit],
    fuzzy: &[FuzzyMatch],
    behavior: &[BehaviorEvent],
) -> (f64, Verdict) {
    let mut score = 0.0;

    for hit in signatures {
        score += hit.weight;
    }

    for m in fuzzy {
        if m.similarity >= config.similarity_threshold {
            score += config.fuzzy_match_weight * (m.similarity / 100.0);
        }
    }

    let observed: BTreeSet<_> = behavior.iter().map(|e| e.category).collect();
    for category in observed {
        if let Some(weight) = config.category_weights.get(&category) {
            score += weight;
        }
    }

    (score, classify(config, score))
}

fn classify(config: &FusionConfig, score: f64) -> Verdict {
    if score >= config.malicious_threshold {
        Verdict::Malicious
    } else if score >= config.suspicious_threshold {
        Verdict::Suspicious
    } else {
        Verdict::Benign
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::report::BehaviorCategory;

    fn hit(id: &str, weight: f64) -> SignatureHit {
        SignatureHit {
            rule_id: id.to_string(),
            rule_name: format!("rule {}", id),
            weight,
        }
    }

    fn fuzzy(similarity: f64) -> FuzzyMatch {
        FuzzyMatch {
            sample_id: "seen-before".to_string(),
            similarity,
        }
    }

    fn event(category: BehaviorCategory) -> BehaviorEvent {
        BehaviorEvent {
            category,
            description: "observed".to_string(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_worked_scoring_scenario() {
        // Two signature rules (40 + 30) and an 85% fuzzy match contributing
        // 20 at that similarity, no flagged dynamic events: score 90,
        // malicious at a threshold of 70.
        let mut config = FusionConfig::default();
        config.similarity_threshold = 70.0;
        config.fuzzy_match_weight = 20.0 / 0.85;
        config.malicious_threshold = 70.0;

        let (score, verdict) = combine(
            &config,
            &[hit("a", 40.0), hit("b", 30.0)],
            &[fuzzy(85.0)],
            &[],
        );

        assert!((score - 90.0).abs() < 1e-9, "score was {}", score);
        assert_eq!(verdict, Verdict::Malicious);
    }

    #[test]
    fn test_fuzzy_matches_below_threshold_are_ignored() {
        let config = FusionConfig::default();
        let (score, verdict) = combine(&config, &[], &[fuzzy(config.similarity_threshold - 1.0)], &[]);
        assert_eq!(score, 0.0);
        assert_eq!(verdict, Verdict::Benign);
    }

    #[test]
    fn test_behavior_category_counted_once() {
        let config = FusionConfig::default();
        let once = combine(
            &config,
            &[],
            &[],
            &[event(BehaviorCategory::PersistenceModification)],
        )
        .0;
        let thrice = combine(
            &config,
            &[],
            &[],
            &[
                event(BehaviorCategory::PersistenceModification),
                event(BehaviorCategory::PersistenceModification),
                event(BehaviorCategory::PersistenceModification),
            ],
        )
        .0;
        assert_eq!(once, thrice);

        let two_categories = combine(
            &config,
            &[],
            &[],
            &[
                event(BehaviorCategory::PersistenceModification),
                event(BehaviorCategory::FlaggedConnection),
            ],
        )
        .0;
        assert!(two_categories > once);
    }

    #[test]
    fn test_score_is_monotone_in_signals() {
        let config = FusionConfig::default();
        let events = vec![event(BehaviorCategory::FlaggedConnection)];

        let base = combine(&config, &[hit("a", 15.0)], &[], &events).0;
        let more_signatures = combine(&config, &[hit("a", 15.0), hit("b", 10.0)], &[], &events).0;
        assert!(more_signatures > base);

        let low_similarity = combine(&config, &[hit("a", 15.0)], &[fuzzy(75.0)], &events).0;
        let high_similarity = combine(&config, &[hit("a", 15.0)], &[fuzzy(95.0)], &events).0;
        assert!(low_similarity > base);
        assert!(high_similarity > low_similarity);
    }

    #[test]
    fn test_determinism() {
        let config = FusionConfig::default();
        let signatures = vec![hit("a", 12.5), hit("b", 33.0)];
        let fuzzy_matches = vec![fuzzy(91.0), fuzzy(72.5)];
        let events = vec![
            event(BehaviorCategory::RegistryModification),
            event(BehaviorCategory::FlaggedConnection),
        ];

        let first = combine(&config, &signatures, &fuzzy_matches, &events);
        let second = combine(&config, &signatures, &fuzzy_matches, &events);
        assert_eq!(first.0, second.0);
        assert_eq!(first.1, second.1);
    }

    #[test]
    fn test_classification_thresholds() {
        let config = FusionConfig::default();
        assert_eq!(classify(&config, 0.0), Verdict::Benign);
        assert_eq!(classify(&config, config.suspicious_threshold), Verdict::Suspicious);
        assert_eq!(classify(&config, config.malicious_threshold), Verdict::Malicious);
        assert_eq!(classify(&config, 500.0), Verdict::Malicious);
    }

    #[tokio::test]
    async fn test_intel_outage_degrades_not_fails() {
        use crate::testkit::{sample_task, FailingIntel};

        let engine = FusionEngine::new(
            FusionConfig::default(),
            Arc::new(FailingIntel),
            Arc::new(FailingIntel),
        );

        let task = sample_task("linux-x64");
        let report = engine.score(&task, &RunArtifacts::default()).await;

        assert!(report.intel_degraded);
        assert!(report.signature_matches.is_empty());
        assert_eq!(report.verdict, Verdict::Benign);
    }
}
