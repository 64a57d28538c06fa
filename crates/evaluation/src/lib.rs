use std::collections::BTreeSet;

use evintake_contracts::decision::{Recommendation, RuleOutcome, RuleVerdict};
use evintake_contracts::facts::FactsSnapshot;

pub mod snapshot;
pub mod status;

pub struct RuleFinding {
    pub verdict: RuleVerdict,
    pub message: String,
}

/// A deterministic check over the full facts mapping. Rules never see each
/// other's results.
pub trait Rule: Send + Sync {
    fn rule_id(&self) -> &'static str;
    fn rule_name(&self) -> &'static str;
    fn evaluate(&self, facts: &FactsSnapshot) -> RuleFinding;
}

/// Folds rule outcomes into one recommendation. Only called with at least
/// one fact on record; the empty case is always `insufficient_data`.
pub trait AggregationPolicy: Send + Sync {
    fn aggregate(&self, outcomes: &[RuleOutcome]) -> Recommendation;
}

/// Any fail rejects, otherwise any warn is conditional, otherwise approved.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorstOutcome;

impl AggregationPolicy for WorstOutcome {
    fn aggregate(&self, outcomes: &[RuleOutcome]) -> Recommendation {
        if outcomes.iter().any(|o| o.outcome == RuleVerdict::Fail) {
            Recommendation::Rejected
        } else if outcomes.iter().any(|o| o.outcome == RuleVerdict::Warn) {
            Recommendation::Conditional
        } else {
            Recommendation::Approved
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FactPresenceRule;

impl Rule for FactPresenceRule {
    fn rule_id(&self) -> &'static str {
        "R000_FACT_PRESENCE"
    }

    fn rule_name(&self) -> &'static str {
        "Facts on record"
    }

    fn evaluate(&self, facts: &FactsSnapshot) -> RuleFinding {
        if facts.is_empty() {
            return RuleFinding {
                verdict: RuleVerdict::NotApplicable,
                message: "no facts on record".to_string(),
            };
        }
        RuleFinding {
            verdict: RuleVerdict::Pass,
            message: format!("{} fact(s) on record", facts.len()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub rule_outcomes: Vec<RuleOutcome>,
    pub overall_recommendation: Recommendation,
    pub facts_count: usize,
    pub rules_evaluated: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvaluationError {
    UnknownRules(Vec<String>),
}

impl std::fmt::Display for EvaluationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvaluationError::UnknownRules(ids) => write!(f, "unknown rule ids: {}", ids.join(", ")),
        }
    }
}

impl std::error::Error for EvaluationError {}

pub struct EvaluationEngine {
    rules: Vec<Box<dyn Rule>>,
    aggregation: Box<dyn AggregationPolicy>,
}

impl Default for EvaluationEngine {
    fn default() -> Self {
        Self::new(vec![Box::new(FactPresenceRule)], Box::new(WorstOutcome))
    }
}

impl EvaluationEngine {
    pub fn new(rules: Vec<Box<dyn Rule>>, aggregation: Box<dyn AggregationPolicy>) -> Self {
        Self { rules, aggregation }
    }

    pub fn rule_ids(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.rule_id()).collect()
    }

    /// Applies the rule set (or the requested subset, in rule-set order).
    pub fn evaluate(
        &self,
        facts: &FactsSnapshot,
        rule_filter: Option<&[String]>,
    ) -> Result<Evaluation, EvaluationError> {
        let selected = match rule_filter {
            None => None,
            Some(ids) => {
                let known = self.rule_ids().into_iter().collect::<BTreeSet<_>>();
                let unknown = ids
                    .iter()
                    .filter(|id| !known.contains(id.as_str()))
                    .cloned()
                    .collect::<BTreeSet<_>>();
                if !unknown.is_empty() {
                    return Err(EvaluationError::UnknownRules(unknown.into_iter().collect()));
                }
                Some(ids.iter().map(String::as_str).collect::<BTreeSet<_>>())
            }
        };

        if facts.is_empty() {
            return Ok(Evaluation {
                rule_outcomes: Vec::new(),
                overall_recommendation: Recommendation::InsufficientData,
                facts_count: 0,
                rules_evaluated: 0,
            });
        }

        let rule_outcomes = self
            .rules
            .iter()
            .filter(|rule| {
                selected
                    .as_ref()
                    .is_none_or(|ids| ids.contains(rule.rule_id()))
            })
            .map(|rule| {
                let finding = rule.evaluate(facts);
                RuleOutcome {
                    rule_id: rule.rule_id().to_string(),
                    rule_name: rule.rule_name().to_string(),
                    outcome: finding.verdict,
                    message: finding.message,
                }
            })
            .collect::<Vec<_>>();

        let overall_recommendation = self.aggregation.aggregate(&rule_outcomes);

        Ok(Evaluation {
            rules_evaluated: rule_outcomes.len(),
            rule_outcomes,
            overall_recommendation,
            facts_count: facts.len(),
        })
    }
}
