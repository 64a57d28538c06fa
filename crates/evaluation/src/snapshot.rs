use chrono::{DateTime, SecondsFormat, Utc};
use evintake_contracts::Signer;
use evintake_contracts::canonical;
use evintake_contracts::decision::{DecisionSnapshot, Recommendation, RuleOutcome, TriggerType};
use evintake_contracts::facts::FactsSnapshot;
use ulid::Ulid;

use crate::Evaluation;

/// Content hash of a facts mapping; independent of insertion order.
pub fn facts_hash(facts: &FactsSnapshot) -> String {
    let value = serde_json::to_value(facts).unwrap_or_else(|_| serde_json::json!({}));
    canonical::hash_canonical_json(&value)
}

pub fn new_snapshot_id() -> String {
    format!("snap_{}", Ulid::new())
}

/// Everything about a snapshot except its version, which the store assigns
/// atomically at commit time.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotDraft {
    pub snapshot_id: String,
    pub application_id: String,
    pub trigger_type: TriggerType,
    pub trigger_metadata: serde_json::Value,
    pub facts_snapshot: FactsSnapshot,
    pub rule_outcomes: Vec<RuleOutcome>,
    pub overall_recommendation: Recommendation,
    pub snapshot_hash: String,
    pub signature: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl SnapshotDraft {
    pub fn into_snapshot(self, snapshot_version: i64) -> DecisionSnapshot {
        DecisionSnapshot {
            snapshot_id: self.snapshot_id,
            application_id: self.application_id,
            snapshot_version,
            trigger_type: self.trigger_type,
            trigger_metadata: self.trigger_metadata,
            facts_snapshot: self.facts_snapshot,
            rule_outcomes: self.rule_outcomes,
            overall_recommendation: self.overall_recommendation,
            snapshot_hash: self.snapshot_hash,
            signature: self.signature,
            created_at: self.created_at,
        }
    }

    /// The payload handed to the signer.
    pub fn manifest(&self) -> serde_json::Value {
        serde_json::json!({
            "snapshot_id": self.snapshot_id,
            "application_id": self.application_id,
            "snapshot_hash": self.snapshot_hash,
            "overall_recommendation": self.overall_recommendation.as_str(),
            "rule_outcomes": self.rule_outcomes,
            "created_at": self.created_at.to_rfc3339_opts(SecondsFormat::Micros, true),
        })
    }
}

pub struct SnapshotBuilder<'a> {
    signer: Option<&'a dyn Signer>,
}

impl<'a> SnapshotBuilder<'a> {
    pub fn new(signer: Option<&'a dyn Signer>) -> Self {
        Self { signer }
    }

    pub fn build(
        &self,
        application_id: &str,
        trigger_type: TriggerType,
        trigger_metadata: serde_json::Value,
        facts_snapshot: FactsSnapshot,
        evaluation: Evaluation,
        created_at: DateTime<Utc>,
    ) -> SnapshotDraft {
        let snapshot_hash = facts_hash(&facts_snapshot);

        let mut draft = SnapshotDraft {
            snapshot_id: new_snapshot_id(),
            application_id: application_id.to_string(),
            trigger_type,
            trigger_metadata,
            facts_snapshot,
            rule_outcomes: evaluation.rule_outcomes,
            overall_recommendation: evaluation.overall_recommendation,
            snapshot_hash,
            signature: None,
            created_at,
        };

        if let Some(signer) = self.signer {
            draft.signature = signer
                .sign(&draft.manifest())
                .as_signed()
                .map(|s| s.to_string());
        }

        draft
    }
}

pub fn verify_snapshot_hash(snapshot: &DecisionSnapshot) -> bool {
    facts_hash(&snapshot.facts_snapshot) == snapshot.snapshot_hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EvaluationEngine;
    use evintake_contracts::ManifestSignature;
    use evintake_contracts::facts::{FactEntry, FactType};

    fn entry(value: serde_json::Value, fact_type: FactType) -> FactEntry {
        FactEntry {
            value,
            fact_type,
            supporting_evidence_id: None,
            confidence: None,
        }
    }

    struct StaticSigner;

    impl Signer for StaticSigner {
        fn sign(&self, manifest: &serde_json::Value) -> ManifestSignature {
            ManifestSignature::Signed(canonical::hash_canonical_json(manifest))
        }
    }

    struct UnsignedStub;

    impl Signer for UnsignedStub {
        fn sign(&self, _manifest: &serde_json::Value) -> ManifestSignature {
            ManifestSignature::Unsigned
        }
    }

    #[test]
    fn facts_hash_is_stable_across_insertion_order() {
        let mut a = FactsSnapshot::new();
        a.insert("b".to_string(), entry(serde_json::json!(2), FactType::Integer));
        a.insert("a".to_string(), entry(serde_json::json!("x"), FactType::String));

        let mut b = FactsSnapshot::new();
        b.insert("a".to_string(), entry(serde_json::json!("x"), FactType::String));
        b.insert("b".to_string(), entry(serde_json::json!(2), FactType::Integer));

        assert_eq!(facts_hash(&a), facts_hash(&b));

        b.insert("c".to_string(), entry(serde_json::json!(false), FactType::Boolean));
        assert_ne!(facts_hash(&a), facts_hash(&b));
    }

    #[test]
    fn builder_records_signature_only_when_signed() {
        let mut facts = FactsSnapshot::new();
        facts.insert("zoning".to_string(), entry(serde_json::json!("C-2"), FactType::String));
        let engine = EvaluationEngine::default();
        let now = Utc::now();

        let unsigned = SnapshotBuilder::new(Some(&UnsignedStub as &dyn Signer)).build(
            "app_1",
            TriggerType::OnDemand,
            serde_json::json!({"triggered_by": "u1", "force": false}),
            facts.clone(),
            engine.evaluate(&facts, None).expect("evaluation should succeed"),
            now,
        );
        assert!(unsigned.signature.is_none());
        assert!(unsigned.snapshot_id.starts_with("snap_"));

        let signed = SnapshotBuilder::new(Some(&StaticSigner as &dyn Signer)).build(
            "app_1",
            TriggerType::OnDemand,
            serde_json::json!({}),
            facts.clone(),
            engine.evaluate(&facts, None).expect("evaluation should succeed"),
            now,
        );
        assert!(signed.signature.is_some());
        assert_eq!(signed.snapshot_hash, unsigned.snapshot_hash);

        let snapshot = signed.into_snapshot(3);
        assert_eq!(snapshot.snapshot_version, 3);
        assert!(verify_snapshot_hash(&snapshot));
    }

    #[test]
    fn tampered_facts_fail_verification() {
        let mut facts = FactsSnapshot::new();
        facts.insert("floors".to_string(), entry(serde_json::json!(2), FactType::Integer));
        let engine = EvaluationEngine::default();
        let mut snapshot = SnapshotBuilder::new(None)
            .build(
                "app_1",
                TriggerType::ManualOverride,
                serde_json::json!({}),
                facts.clone(),
                engine.evaluate(&facts, None).expect("evaluation should succeed"),
                Utc::now(),
            )
            .into_snapshot(1);

        snapshot
            .facts_snapshot
            .insert("floors".to_string(), entry(serde_json::json!(3), FactType::Integer));
        assert!(!verify_snapshot_hash(&snapshot));
    }
}
