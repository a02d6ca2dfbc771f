use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const VALID_CONDITION: &str = "Valid";

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HttpProxyStatus {
    /// One of `valid`, `invalid` or `orphaned`.
    pub current_status: Option<String>,
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<DetailedCondition>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DetailedCondition {
    #[serde(rename = "type")]
    pub type_: String,
    /// `True` or `False`.
    pub status: String,
    pub observed_generation: Option<i64>,
    pub last_transition_time: Option<String>,
    pub reason: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<SubCondition>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub reason: String,
    pub message: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CurrentStatus {
    Valid,
    Invalid,
    Orphaned,
}

// === impl HttpProxyStatus ===

impl HttpProxyStatus {
    pub fn valid_condition(&self) -> Option<&DetailedCondition> {
        self.conditions.iter().find(|c| c.type_ == VALID_CONDITION)
    }

    pub fn is_valid(&self) -> bool {
        self.valid_condition().is_some_and(|c| c.status == "True")
    }

    pub fn current(&self) -> Option<CurrentStatus> {
        match self.current_status.as_deref()? {
            "valid" => Some(CurrentStatus::Valid),
            "invalid" => Some(CurrentStatus::Invalid),
            "orphaned" => Some(CurrentStatus::Orphaned),
            _ => None,
        }
    }

    /// The reasons of all errors on the `Valid` condition.
    pub fn error_reasons(&self) -> Vec<&str> {
        self.valid_condition()
            .map(|c| c.errors.iter().map(|e| e.reason.as_str()).collect())
            .unwrap_or_default()
    }
}

// === impl CurrentStatus ===

impl CurrentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::Invalid => "invalid",
            Self::Orphaned => "orphaned",
        }
    }
}

impl fmt::Display for CurrentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
