//! Operation result records.
//!
//! Created by the agent after each search-and-download or installation pass,
//! enqueued by the coordinator into the result store, and served by the
//! read-only results endpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of operation a result describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    SearchAndDownload,
    Installation,
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SearchAndDownload => write!(f, "SearchAndDownload"),
            Self::Installation => write!(f, "Installation"),
        }
    }
}

impl std::str::FromStr for OperationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SearchAndDownload" => Ok(Self::SearchAndDownload),
            "Installation" => Ok(Self::Installation),
            other => Err(format!("unknown operation type: {other}")),
        }
    }
}

/// Outcome of an update operation as classified by the update engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateOperationOutcome {
    Succeeded,
    SucceededWithErrors,
    Failed,
    Aborted,
    AbortedWithTimeout,
}

impl UpdateOperationOutcome {
    /// Only a clean success avoids a reschedule of the agent's next attempt.
    pub fn needs_reschedule(self) -> bool {
        self != Self::Succeeded
    }
}

impl std::fmt::Display for UpdateOperationOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Succeeded => "Succeeded",
            Self::SucceededWithErrors => "SucceededWithErrors",
            Self::Failed => "Failed",
            Self::Aborted => "Aborted",
            Self::AbortedWithTimeout => "AbortedWithTimeout",
        };
        write!(f, "{}", name)
    }
}

/// Per-update detail line inside an operation result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateDetail {
    pub update_id: String,
    pub title: String,
    pub description: String,

    /// Per-update outcome, when the engine reports one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_code: Option<UpdateOperationOutcome>,

    /// Engine-native result code (HRESULT-shaped).
    pub hresult: i64,
}

/// Immutable record of one operation on one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    pub node_name: String,
    pub operation_time: DateTime<Utc>,
    pub operation_start_time: DateTime<Utc>,
    pub operation_type: OperationType,
    pub operation_result: UpdateOperationOutcome,

    #[serde(default)]
    pub update_details: Vec<UpdateDetail>,

    /// Query string the search ran with.
    pub windows_update_query: String,

    /// Frequency string in effect when the operation ran.
    pub windows_update_frequency: String,

    pub reboot_required: bool,
}

impl OperationResult {
    /// A "nothing to do" record posted when a search returns zero updates.
    pub fn empty_search(
        node: &str,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
        query: &str,
        frequency: &str,
    ) -> Self {
        Self {
            node_name: node.to_string(),
            operation_time: now,
            operation_start_time: started_at,
            operation_type: OperationType::SearchAndDownload,
            operation_result: UpdateOperationOutcome::Succeeded,
            update_details: Vec::new(),
            windows_update_query: query.to_string(),
            windows_update_frequency: frequency.to_string(),
            reboot_required: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_type_parse() {
        assert_eq!(
            "Installation".parse::<OperationType>().unwrap(),
            OperationType::Installation
        );
        assert_eq!(
            "SearchAndDownload".parse::<OperationType>().unwrap(),
            OperationType::SearchAndDownload
        );
        assert!("installation".parse::<OperationType>().is_err());
    }

    #[test]
    fn test_reschedule_classification() {
        assert!(!UpdateOperationOutcome::Succeeded.needs_reschedule());
        assert!(UpdateOperationOutcome::SucceededWithErrors.needs_reschedule());
        assert!(UpdateOperationOutcome::Failed.needs_reschedule());
        assert!(UpdateOperationOutcome::Aborted.needs_reschedule());
        assert!(UpdateOperationOutcome::AbortedWithTimeout.needs_reschedule());
    }

    #[test]
    fn test_empty_search_record() {
        let start = Utc::now();
        let result = OperationResult::empty_search("n1", start, start, "IsInstalled=0", "None");

        assert_eq!(result.operation_type, OperationType::SearchAndDownload);
        assert_eq!(result.operation_result, UpdateOperationOutcome::Succeeded);
        assert!(result.update_details.is_empty());
        assert!(!result.reboot_required);
    }

    #[test]
    fn test_result_json_roundtrip() {
        let result = OperationResult {
            node_name: "n1".to_string(),
            operation_time: Utc::now(),
            operation_start_time: Utc::now(),
            operation_type: OperationType::Installation,
            operation_result: UpdateOperationOutcome::SucceededWithErrors,
            update_details: vec![UpdateDetail {
                update_id: "u-1".to_string(),
                title: "Security update".to_string(),
                description: "A security update".to_string(),
                result_code: Some(UpdateOperationOutcome::Failed),
                hresult: -2145124329,
            }],
            windows_update_query: "IsInstalled=0".to_string(),
            windows_update_frequency: "Weekly,Wednesday,7:00:00".to_string(),
            reboot_required: true,
        };

        let json = serde_json::to_string(&result).unwrap();
        let parsed: OperationResult = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, result);
    }
}
