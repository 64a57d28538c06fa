use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

pub const FACT_NAME_MAX_LEN: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactType {
    String,
    Number,
    Integer,
    Boolean,
    Date,
    Datetime,
}

impl FactType {
    pub fn as_str(self) -> &'static str {
        match self {
            FactType::String => "string",
            FactType::Number => "number",
            FactType::Integer => "integer",
            FactType::Boolean => "boolean",
            FactType::Date => "date",
            FactType::Datetime => "datetime",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "string" => Some(FactType::String),
            "number" => Some(FactType::Number),
            "integer" => Some(FactType::Integer),
            "boolean" => Some(FactType::Boolean),
            "date" => Some(FactType::Date),
            "datetime" => Some(FactType::Datetime),
            _ => None,
        }
    }
}

/// A typed fact value. The variant always agrees with the declared [`FactType`].
#[derive(Debug, Clone, PartialEq)]
pub enum FactValue {
    String(String),
    Number(f64),
    Integer(i64),
    Boolean(bool),
    Date(NaiveDate),
    Datetime(DateTime<Utc>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactValueError {
    pub fact_type: FactType,
    pub message: String,
}

impl std::fmt::Display for FactValueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid {} value: {}", self.fact_type.as_str(), self.message)
    }
}

impl std::error::Error for FactValueError {}

impl FactValue {
    pub fn from_json(
        fact_type: FactType,
        value: &serde_json::Value,
    ) -> Result<Self, FactValueError> {
        let err = |message: &str| FactValueError {
            fact_type,
            message: message.to_string(),
        };

        match fact_type {
            FactType::String => value
                .as_str()
                .map(|s| FactValue::String(s.to_string()))
                .ok_or_else(|| err("expected a JSON string")),
            FactType::Number => {
                let n = value.as_f64().ok_or_else(|| err("expected a JSON number"))?;
                if !n.is_finite() {
                    return Err(err("number must be finite"));
                }
                Ok(FactValue::Number(n))
            }
            FactType::Integer => value
                .as_i64()
                .map(FactValue::Integer)
                .ok_or_else(|| err("expected a JSON integer")),
            FactType::Boolean => value
                .as_bool()
                .map(FactValue::Boolean)
                .ok_or_else(|| err("expected true or false")),
            FactType::Date => {
                let raw = value.as_str().ok_or_else(|| err("expected YYYY-MM-DD"))?;
                NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
                    .map(FactValue::Date)
                    .map_err(|_| err("expected YYYY-MM-DD"))
            }
            FactType::Datetime => {
                let raw = value
                    .as_str()
                    .ok_or_else(|| err("expected an RFC 3339 timestamp"))?;
                crate::parse_device_timestamp(raw)
                    .map(FactValue::Datetime)
                    .ok_or_else(|| err("expected an RFC 3339 timestamp"))
            }
        }
    }

    pub fn fact_type(&self) -> FactType {
        match self {
            FactValue::String(_) => FactType::String,
            FactValue::Number(_) => FactType::Number,
            FactValue::Integer(_) => FactType::Integer,
            FactValue::Boolean(_) => FactType::Boolean,
            FactValue::Date(_) => FactType::Date,
            FactValue::Datetime(_) => FactType::Datetime,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            FactValue::String(s) => serde_json::Value::String(s.clone()),
            FactValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            FactValue::Integer(i) => serde_json::Value::from(*i),
            FactValue::Boolean(b) => serde_json::Value::Bool(*b),
            FactValue::Date(d) => serde_json::Value::String(d.format("%Y-%m-%d").to_string()),
            FactValue::Datetime(ts) => {
                serde_json::Value::String(ts.to_rfc3339_opts(SecondsFormat::Secs, true))
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FactSubmission {
    pub fact_name: String,
    pub fact_type: FactType,
    pub fact_value: serde_json::Value,
    #[serde(default)]
    pub supporting_evidence_id: Option<String>,
    #[serde(default)]
    pub extractor_id: Option<String>,
    #[serde(default)]
    pub extraction_confidence: Option<f64>,
}

/// A submission that passed validation and is ready to be upserted.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedFact {
    pub fact_name: String,
    pub value: FactValue,
    pub supporting_evidence_id: Option<String>,
    pub extractor_id: Option<String>,
    pub extraction_confidence: Option<f64>,
}

impl FactSubmission {
    pub fn validate(self) -> Result<ValidatedFact, String> {
        let fact_name = self.fact_name.trim().to_string();
        if fact_name.is_empty() || fact_name.len() > FACT_NAME_MAX_LEN {
            return Err(format!(
                "fact_name must be 1..={} characters",
                FACT_NAME_MAX_LEN
            ));
        }

        if let Some(confidence) = self.extraction_confidence
            && (!confidence.is_finite() || !(0.0..=1.0).contains(&confidence))
        {
            return Err("extraction_confidence must be between 0 and 1".to_string());
        }

        let value =
            FactValue::from_json(self.fact_type, &self.fact_value).map_err(|e| e.to_string())?;

        Ok(ValidatedFact {
            fact_name,
            value,
            supporting_evidence_id: self
                .supporting_evidence_id
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            extractor_id: self
                .extractor_id
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            extraction_confidence: self.extraction_confidence,
        })
    }
}

/// One entry of the flat mapping fed to rules and hashed into snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactEntry {
    pub value: serde_json::Value,
    #[serde(rename = "type")]
    pub fact_type: FactType,
    pub supporting_evidence_id: Option<String>,
    pub confidence: Option<f64>,
}

pub type FactsSnapshot = BTreeMap<String, FactEntry>;
