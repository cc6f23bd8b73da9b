//! Status surface exposed to the host platform.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use driftgate_store::Artifact;

use crate::engine::{ArchiveInfo, CommandResult};

/// Maximum length of a condition message.
pub const MAX_CONDITION_MESSAGE_LEN: usize = 20_000;

/// Marker appended to truncated messages.
pub const TRUNCATION_MARKER: &str = "...";

/// Condition types.
pub const READY: &str = "Ready";
pub const RECONCILING: &str = "Reconciling";
pub const STALLED: &str = "Stalled";
pub const ARTIFACT_IN_STORAGE: &str = "ArtifactInStorage";

/// Truncate `message` to [`MAX_CONDITION_MESSAGE_LEN`] bytes on a char
/// boundary, appending [`TRUNCATION_MARKER`] when anything was cut.
pub fn truncate_message(message: &str) -> String {
    truncate_to(message, MAX_CONDITION_MESSAGE_LEN)
}

fn truncate_to(message: &str, max_len: usize) -> String {
    if message.len() <= max_len {
        return message.to_string();
    }
    let mut end = max_len.saturating_sub(TRUNCATION_MARKER.len());
    while end > 0 && !message.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &message[..end], TRUNCATION_MARKER)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    pub observed_generation: i64,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_).is_some_and(Condition::is_true)
}

/// Insert or update a condition.
///
/// The transition time only moves when the status changes.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: ConditionStatus,
    reason: &str,
    message: &str,
    generation: i64,
) {
    let message = truncate_message(message);
    match conditions.iter_mut().find(|c| c.type_ == type_) {
        Some(existing) => {
            if existing.status != status {
                existing.last_transition_time = Utc::now();
            }
            existing.status = status;
            existing.reason = reason.to_string();
            existing.message = message;
            existing.observed_generation = generation;
        }
        None => conditions.push(Condition {
            type_: type_.to_string(),
            status,
            reason: reason.to_string(),
            message,
            observed_generation: generation,
            last_transition_time: Utc::now(),
        }),
    }
}

pub fn remove_condition(conditions: &mut Vec<Condition>, type_: &str) {
    conditions.retain(|c| c.type_ != type_);
}

/// Outcome of one deploy, prune or validate attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    pub attempted_at: DateTime<Utc>,
    pub revision: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub objects_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<CommandResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OperationResult {
    /// Whether the attempt finished without engine or invocation errors.
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.result.as_ref().map_or(true, CommandResult::is_success)
    }
}

/// Observed state of a deployment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStatus {
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempted_revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_info: Option<ArchiveInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_deploy_result: Option<OperationResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_prune_result: Option<OperationResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_validate_result: Option<OperationResult>,
}

impl DeploymentStatus {
    pub fn is_ready(&self) -> bool {
        is_condition_true(&self.conditions, READY)
    }

    /// Revision of the last stored archive, if any.
    pub fn archive_revision(&self) -> Option<String> {
        self.archive_info.as_ref().map(ArchiveInfo::revision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_message_untouched() {
        assert_eq!(truncate_message("all good"), "all good");
    }

    #[test]
    fn test_long_message_truncated_with_marker() {
        let long = "x".repeat(MAX_CONDITION_MESSAGE_LEN + 10);
        let truncated = truncate_message(&long);
        assert_eq!(truncated.len(), MAX_CONDITION_MESSAGE_LEN);
        assert!(truncated.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let truncated = truncate_to("ééééé", 6);
        assert_eq!(truncated, "é...");
    }

    #[test]
    fn test_set_condition_keeps_transition_time_when_unchanged() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, READY, ConditionStatus::False, "Progressing", "a", 1);
        let first = conditions[0].last_transition_time;

        set_condition(&mut conditions, READY, ConditionStatus::False, "Progressing", "b", 2);
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, first);
        assert_eq!(conditions[0].message, "b");
        assert_eq!(conditions[0].observed_generation, 2);

        set_condition(&mut conditions, READY, ConditionStatus::True, "Succeeded", "c", 2);
        assert!(conditions[0].last_transition_time >= first);
        assert!(is_condition_true(&conditions, READY));

        remove_condition(&mut conditions, READY);
        assert!(find_condition(&conditions, READY).is_none());
    }

    #[test]
    fn test_operation_result_success() {
        let mut op = OperationResult {
            attempted_at: Utc::now(),
            revision: "r1".to_string(),
            target_name: None,
            objects_hash: None,
            result: Some(CommandResult::default()),
            error: None,
        };
        assert!(op.succeeded());
        op.error = Some("boom".to_string());
        assert!(!op.succeeded());
    }
}
