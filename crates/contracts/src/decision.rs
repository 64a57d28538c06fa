use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::facts::FactsSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStatus {
    Draft,
    Submitted,
    UnderReview,
    Approved,
    Rejected,
    Conditional,
}

impl ApplicationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ApplicationStatus::Draft => "draft",
            ApplicationStatus::Submitted => "submitted",
            ApplicationStatus::UnderReview => "under_review",
            ApplicationStatus::Approved => "approved",
            ApplicationStatus::Rejected => "rejected",
            ApplicationStatus::Conditional => "conditional",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "draft" => Some(ApplicationStatus::Draft),
            "submitted" => Some(ApplicationStatus::Submitted),
            "under_review" => Some(ApplicationStatus::UnderReview),
            "approved" => Some(ApplicationStatus::Approved),
            "rejected" => Some(ApplicationStatus::Rejected),
            "conditional" => Some(ApplicationStatus::Conditional),
            _ => None,
        }
    }

    pub fn is_decision(self) -> bool {
        matches!(
            self,
            ApplicationStatus::Approved | ApplicationStatus::Rejected | ApplicationStatus::Conditional
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Approved,
    Rejected,
    Conditional,
    InsufficientData,
}

impl Recommendation {
    pub fn as_str(self) -> &'static str {
        match self {
            Recommendation::Approved => "approved",
            Recommendation::Rejected => "rejected",
            Recommendation::Conditional => "conditional",
            Recommendation::InsufficientData => "insufficient_data",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "approved" => Some(Recommendation::Approved),
            "rejected" => Some(Recommendation::Rejected),
            "conditional" => Some(Recommendation::Conditional),
            "insufficient_data" => Some(Recommendation::InsufficientData),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleVerdict {
    Pass,
    Fail,
    Warn,
    NotApplicable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleOutcome {
    pub rule_id: String,
    pub rule_name: String,
    pub outcome: RuleVerdict,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    OnDemand,
    AutoEvaluate,
    ManualOverride,
}

impl TriggerType {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerType::OnDemand => "on_demand",
            TriggerType::AutoEvaluate => "auto_evaluate",
            TriggerType::ManualOverride => "manual_override",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "on_demand" => Some(TriggerType::OnDemand),
            "auto_evaluate" => Some(TriggerType::AutoEvaluate),
            "manual_override" => Some(TriggerType::ManualOverride),
            _ => None,
        }
    }
}

/// An immutable evaluation record. Re-evaluation always produces a new one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionSnapshot {
    pub snapshot_id: String,
    pub application_id: String,
    pub snapshot_version: i64,
    pub trigger_type: TriggerType,
    pub trigger_metadata: serde_json::Value,
    pub facts_snapshot: FactsSnapshot,
    pub rule_outcomes: Vec<RuleOutcome>,
    pub overall_recommendation: Recommendation,
    pub snapshot_hash: String,
    pub signature: Option<String>,
    pub created_at: DateTime<Utc>,
}
