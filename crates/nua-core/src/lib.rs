//! Core domain model for Nexxus user reconciliation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "nua-core";

/// Marketplace role carried on profiles and mirrored into auth metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Homeowner,
    Cleaner,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Homeowner => "homeowner",
            Role::Cleaner => "cleaner",
            Role::Admin => "admin",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Desired end state for one user, supplied by an operator batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetUser {
    pub email: String,
    pub password: String,
    pub role: Role,
    pub first_name: String,
    pub last_name: String,
}

/// Authentication-provider record of identity and confirmation state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRecord {
    pub id: Uuid,
    pub email: String,
    pub email_confirmed: bool,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Application-side profile row. Invariant restored by reconciliation:
/// `id` equals the auth record id for the same email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub id: Uuid,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Created,
    Updated,
    AlreadyConsistent,
    Failed,
}

/// Step of the per-user procedure at which a failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileStep {
    AuthLookup,
    AuthCreation,
    ProfileLookup,
    ProfileCreation,
    ProfileUpdate,
    Deadline,
}

impl ReconcileStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileStep::AuthLookup => "auth_lookup",
            ReconcileStep::AuthCreation => "auth_creation",
            ReconcileStep::ProfileLookup => "profile_lookup",
            ReconcileStep::ProfileCreation => "profile_creation",
            ReconcileStep::ProfileUpdate => "profile_update",
            ReconcileStep::Deadline => "deadline",
        }
    }
}

/// Per-user result of one reconciliation run. One outcome per input user,
/// in input order; never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationOutcome {
    pub email: String,
    pub status: OutcomeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<ReconcileStep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
}

impl ReconciliationOutcome {
    pub fn success(email: impl Into<String>, status: OutcomeStatus, user_id: Uuid) -> Self {
        Self {
            email: email.into(),
            status,
            failed_step: None,
            error: None,
            user_id: Some(user_id),
        }
    }

    /// `user_id` is present when the auth side was already resolved before
    /// the failure, so operators can follow up on the orphaned half.
    pub fn failed(
        email: impl Into<String>,
        step: ReconcileStep,
        error: impl Into<String>,
        user_id: Option<Uuid>,
    ) -> Self {
        Self {
            email: email.into(),
            status: OutcomeStatus::Failed,
            failed_step: Some(step),
            error: Some(error.into()),
            user_id,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.status == OutcomeStatus::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trips_as_lowercase() {
        let json = serde_json::to_string(&Role::Cleaner).unwrap();
        assert_eq!(json, "\"cleaner\"");
        let back: Role = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Role::Cleaner);
    }

    #[test]
    fn failed_step_serializes_snake_case() {
        let outcome = ReconciliationOutcome::failed(
            "a@x.com",
            ReconcileStep::AuthCreation,
            "rate limited",
            None,
        );
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["failed_step"], "auth_creation");
        assert_eq!(value["status"], "failed");
        assert!(value.get("user_id").is_none());
    }
}
