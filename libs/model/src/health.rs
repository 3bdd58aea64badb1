//! Health facts published against platform services.

use serde::{Deserialize, Serialize};

/// Severity of a health fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Ok,
    Warning,
    Error,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "Ok"),
            Self::Warning => write!(f, "Warning"),
            Self::Error => write!(f, "Error"),
        }
    }
}

impl std::str::FromStr for HealthState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Ok" => Ok(Self::Ok),
            "Warning" => Ok(Self::Warning),
            "Error" => Ok(Self::Error),
            other => Err(format!("unknown health state: {other}")),
        }
    }
}

/// A named health fact with TTL.
///
/// `property` is the idempotency key: re-publishing with the same service URI
/// and property replaces the previous fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub service_uri: String,
    pub property: String,
    pub description: String,
    pub state: HealthState,

    /// Seconds until the fact expires; `None` means no expiry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<i64>,
}

impl HealthReport {
    pub fn new(
        service_uri: impl Into<String>,
        property: impl Into<String>,
        description: impl Into<String>,
        state: HealthState,
        ttl_seconds: Option<i64>,
    ) -> Self {
        Self {
            service_uri: service_uri.into(),
            property: property.into(),
            description: description.into(),
            state,
            ttl_seconds,
        }
    }
}
