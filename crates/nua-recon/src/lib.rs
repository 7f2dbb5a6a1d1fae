//! User reconciliation between the auth provider and the profile table.
//!
//! Replaces the pile of one-off diagnose-and-fix scripts with a single
//! data-driven routine: give it a batch of target users and it brings each
//! one to a consistent, linked state, reporting a structured outcome per
//! user. Destructive and credential-changing operations stay separate and
//! explicit (`remove_orphan_profile`, `reset_password`).

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use nua_core::{
    OutcomeStatus, ProfileRecord, ReconcileStep, ReconciliationOutcome, TargetUser,
};
use nua_providers::{
    AdminAuthClient, AuthProvider, BaasConfig, NewAuthUser, ProfilePatch, ProfileStore,
    ProviderError, RestProfileStore,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "nua-recon";

#[derive(Debug, Clone)]
pub struct ReconConfig {
    pub api_url: String,
    pub service_key: String,
    pub reports_dir: PathBuf,
    pub http_timeout_secs: u64,
}

impl ReconConfig {
    pub fn from_env() -> Self {
        Self {
            api_url: std::env::var("NUA_API_URL")
                .unwrap_or_else(|_| "http://localhost:54321".to_string()),
            service_key: std::env::var("NUA_SERVICE_KEY")
                .unwrap_or_else(|_| "dev-service-key".to_string()),
            reports_dir: std::env::var("NUA_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
            http_timeout_secs: std::env::var("NUA_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
        }
    }

    pub fn baas(&self) -> BaasConfig {
        let mut baas = BaasConfig::new(self.api_url.clone(), self.service_key.clone());
        baas.timeout = Duration::from_secs(self.http_timeout_secs);
        baas
    }
}

#[derive(Debug, Clone, Deserialize)]
struct TargetBatchFile {
    targets: Vec<TargetUser>,
}

/// Load an operator batch from a `targets.yaml` file.
pub async fn load_target_batch(path: impl AsRef<Path>) -> Result<Vec<TargetUser>> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let file: TargetBatchFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(file.targets)
}

/// Whole-batch rejections. Everything past validation is per-user.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BatchError {
    #[error("batch must contain at least one target user")]
    Empty,
    #[error("target user with empty email")]
    MissingEmail,
    #[error("duplicate email in batch: {0}")]
    DuplicateEmail(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanKind {
    AuthWithoutProfile,
    ProfileWithoutAuth,
}

/// One stale half of a user, found by `scan_orphans`. Read-only; removal
/// is a separate confirmed operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrphanReport {
    pub kind: OrphanKind,
    pub id: Uuid,
    pub email: String,
}

#[derive(Debug, Error)]
pub enum OrphanRemovalError {
    #[error("orphan removal requires explicit confirmation")]
    NotConfirmed,
    #[error("no profile row {0}")]
    NotFound(Uuid),
    #[error("profile {0} still has a matching auth record; not removing")]
    NotOrphaned(Uuid),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

#[derive(Debug, Error)]
pub enum PasswordResetError {
    #[error("no auth record for {0}")]
    NotFound(String),
    #[error("multiple auth records for {0}; resolve the conflict first")]
    Conflict(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Brings auth records and profile rows into agreement, one user at a time.
///
/// Collaborators are injected so tests substitute in-memory doubles.
#[derive(Clone)]
pub struct Reconciler {
    auth: Arc<dyn AuthProvider>,
    profiles: Arc<dyn ProfileStore>,
}

impl Reconciler {
    pub fn new(auth: Arc<dyn AuthProvider>, profiles: Arc<dyn ProfileStore>) -> Self {
        Self { auth, profiles }
    }

    /// One outcome per input user, in input order. A user's failure never
    /// aborts the rest of the batch.
    pub async fn reconcile(
        &self,
        batch: &[TargetUser],
    ) -> Result<Vec<ReconciliationOutcome>, BatchError> {
        validate_batch(batch)?;
        info!(users = batch.len(), "starting reconcile batch");

        let mut outcomes = Vec::with_capacity(batch.len());
        for user in batch {
            let outcome = self.reconcile_one(user).await;
            log_outcome(&outcome);
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Like [`reconcile`](Self::reconcile), bounded by a whole-batch
    /// deadline. Users not finished by the deadline report a failure at the
    /// `deadline` step with error `"timeout"`.
    pub async fn reconcile_with_deadline(
        &self,
        batch: &[TargetUser],
        deadline: tokio::time::Instant,
    ) -> Result<Vec<ReconciliationOutcome>, BatchError> {
        validate_batch(batch)?;
        info!(users = batch.len(), "starting reconcile batch with deadline");

        let mut outcomes = Vec::with_capacity(batch.len());
        for user in batch {
            if tokio::time::Instant::now() >= deadline {
                let outcome = ReconciliationOutcome::failed(
                    user.email.clone(),
                    ReconcileStep::Deadline,
                    "timeout",
                    None,
                );
                log_outcome(&outcome);
                outcomes.push(outcome);
                continue;
            }
            let outcome = match tokio::time::timeout_at(deadline, self.reconcile_one(user)).await
            {
                Ok(outcome) => outcome,
                Err(_) => ReconciliationOutcome::failed(
                    user.email.clone(),
                    ReconcileStep::Deadline,
                    "timeout",
                    None,
                ),
            };
            log_outcome(&outcome);
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    // The per-user procedure: resolve the auth side, then the profile side,
    // with at most one create per missing half. Provider failures become
    // data, never propagated errors.
    async fn reconcile_one(&self, user: &TargetUser) -> ReconciliationOutcome {
        let email = user.email.as_str();

        let auth_records = match self.auth.find_by_email(email).await {
            Ok(records) => records,
            Err(err) => {
                return ReconciliationOutcome::failed(
                    email,
                    ReconcileStep::AuthLookup,
                    err.to_string(),
                    None,
                )
            }
        };

        if auth_records.len() > 1 {
            // Conflict: the provider should hold at most one record per
            // email. Left to an operator; no writes issued.
            return ReconciliationOutcome::failed(
                email,
                ReconcileStep::AuthLookup,
                format!("{} auth records share this email", auth_records.len()),
                None,
            );
        }

        let (auth_id, auth_created) = match auth_records.into_iter().next() {
            // Existing record is kept as-is: no password or metadata change
            // outside the explicit reset operation.
            Some(record) => (record.id, false),
            None => {
                let request = NewAuthUser {
                    email: user.email.clone(),
                    password: user.password.clone(),
                    email_confirmed: true,
                    metadata: serde_json::json!({
                        "role": user.role.as_str(),
                        "first_name": user.first_name,
                        "last_name": user.last_name,
                    }),
                };
                match self.auth.create(request).await {
                    Ok(record) => (record.id, true),
                    Err(err) => {
                        return ReconciliationOutcome::failed(
                            email,
                            ReconcileStep::AuthCreation,
                            err.to_string(),
                            None,
                        )
                    }
                }
            }
        };

        let existing = match self.profiles.find_by_email(email).await {
            Ok(existing) => existing,
            Err(err) => {
                return ReconciliationOutcome::failed(
                    email,
                    ReconcileStep::ProfileLookup,
                    err.to_string(),
                    Some(auth_id),
                )
            }
        };

        match existing {
            None => {
                let now = Utc::now();
                let record = ProfileRecord {
                    id: auth_id,
                    email: user.email.clone(),
                    first_name: user.first_name.clone(),
                    last_name: user.last_name.clone(),
                    role: user.role,
                    created_at: now,
                    updated_at: now,
                };
                if let Err(err) = self.profiles.create(&record).await {
                    // The auth side is not rolled back; the id in the
                    // outcome lets an operator follow up.
                    return ReconciliationOutcome::failed(
                        email,
                        ReconcileStep::ProfileCreation,
                        err.to_string(),
                        Some(auth_id),
                    );
                }
                let status = if auth_created {
                    OutcomeStatus::Created
                } else {
                    OutcomeStatus::Updated
                };
                ReconciliationOutcome::success(email, status, auth_id)
            }
            Some(profile) => {
                let mut patch = ProfilePatch {
                    id: None,
                    role: None,
                    updated_at: Utc::now(),
                };
                if profile.id != auth_id {
                    patch.id = Some(auth_id);
                }
                if profile.role != user.role {
                    patch.role = Some(user.role);
                }

                if patch.is_empty() {
                    return ReconciliationOutcome::success(
                        email,
                        OutcomeStatus::AlreadyConsistent,
                        auth_id,
                    );
                }

                if let Err(err) = self.profiles.update(profile.id, patch).await {
                    return ReconciliationOutcome::failed(
                        email,
                        ReconcileStep::ProfileUpdate,
                        err.to_string(),
                        Some(auth_id),
                    );
                }
                ReconciliationOutcome::success(email, OutcomeStatus::Updated, auth_id)
            }
        }
    }

    /// Read-only sweep for records missing their other half. An id
    /// mismatch between same-email records is repairable by `reconcile`
    /// and is not reported here.
    pub async fn scan_orphans(&self) -> Result<Vec<OrphanReport>, ProviderError> {
        let auth_records = self.auth.list().await?;
        let profile_rows = self.profiles.list().await?;

        let auth_emails: HashSet<String> = auth_records
            .iter()
            .map(|r| r.email.to_ascii_lowercase())
            .collect();
        let profile_emails: HashSet<String> = profile_rows
            .iter()
            .map(|r| r.email.to_ascii_lowercase())
            .collect();

        let mut reports = Vec::new();
        for record in &auth_records {
            if !profile_emails.contains(&record.email.to_ascii_lowercase()) {
                reports.push(OrphanReport {
                    kind: OrphanKind::AuthWithoutProfile,
                    id: record.id,
                    email: record.email.clone(),
                });
            }
        }
        for row in &profile_rows {
            if !auth_emails.contains(&row.email.to_ascii_lowercase()) {
                reports.push(OrphanReport {
                    kind: OrphanKind::ProfileWithoutAuth,
                    id: row.id,
                    email: row.email.clone(),
                });
            }
        }
        Ok(reports)
    }

    /// Deletes a stale profile row. Refuses without confirmation, and
    /// refuses rows that still have a matching auth record.
    pub async fn remove_orphan_profile(
        &self,
        id: Uuid,
        confirm: bool,
    ) -> Result<(), OrphanRemovalError> {
        if !confirm {
            return Err(OrphanRemovalError::NotConfirmed);
        }

        let rows = self.profiles.list().await?;
        let Some(row) = rows.into_iter().find(|r| r.id == id) else {
            return Err(OrphanRemovalError::NotFound(id));
        };

        let auth_records = self.auth.find_by_email(&row.email).await?;
        if !auth_records.is_empty() {
            return Err(OrphanRemovalError::NotOrphaned(id));
        }

        self.profiles.delete(id).await?;
        warn!(%id, email = %row.email, "removed orphaned profile row");
        Ok(())
    }

    /// The only path that changes a credential.
    pub async fn reset_password(
        &self,
        email: &str,
        new_password: &str,
    ) -> Result<Uuid, PasswordResetError> {
        let mut records = self.auth.find_by_email(email).await?;
        match records.len() {
            0 => Err(PasswordResetError::NotFound(email.to_string())),
            1 => {
                let record = records.remove(0);
                self.auth.set_password(record.id, new_password).await?;
                info!(user_id = %record.id, email, "password reset");
                Ok(record.id)
            }
            _ => Err(PasswordResetError::Conflict(email.to_string())),
        }
    }
}

fn validate_batch(batch: &[TargetUser]) -> Result<(), BatchError> {
    if batch.is_empty() {
        return Err(BatchError::Empty);
    }
    let mut seen = HashSet::new();
    for user in batch {
        if user.email.trim().is_empty() {
            return Err(BatchError::MissingEmail);
        }
        if !seen.insert(user.email.to_ascii_lowercase()) {
            return Err(BatchError::DuplicateEmail(user.email.clone()));
        }
    }
    Ok(())
}

fn log_outcome(outcome: &ReconciliationOutcome) {
    if outcome.is_failure() {
        warn!(
            email = %outcome.email,
            step = outcome.failed_step.map(|s| s.as_str()).unwrap_or("unknown"),
            error = outcome.error.as_deref().unwrap_or(""),
            "reconcile failed for user"
        );
    } else {
        info!(email = %outcome.email, status = ?outcome.status, "reconciled user");
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total: usize,
    pub created: usize,
    pub updated: usize,
    pub already_consistent: usize,
    pub failed: usize,
    pub reports_dir: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportManifest {
    pub schema_version: u32,
    pub files: Vec<ReportManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Persist one run's outcomes under `reports/<run_id>/`: the JSON outcome
/// dump, a markdown brief, and a manifest with content hashes.
pub async fn write_run_report(
    reports_root: &Path,
    run_id: Uuid,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    outcomes: &[ReconciliationOutcome],
) -> Result<ReconcileRunSummary> {
    let run_dir = reports_root.join(run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let outcomes_path = run_dir.join("outcomes.json");
    let outcomes_json = serde_json::to_vec_pretty(&serde_json::json!({
        "run_id": run_id,
        "started_at": started_at,
        "finished_at": finished_at,
        "outcomes": outcomes,
    }))
    .context("serializing outcomes")?;
    fs::write(&outcomes_path, &outcomes_json)
        .await
        .context("writing outcomes.json")?;

    let (created, updated, already_consistent, failed) = tally(outcomes);
    let brief = format!(
        "# Reconcile Run Brief\n\n- Run ID: `{run_id}`\n- Started: {started_at}\n- Finished: {finished_at}\n- Users: {}\n\n## Outcomes\n- created: {created}\n- updated: {updated}\n- already_consistent: {already_consistent}\n- failed: {failed}\n",
        outcomes.len(),
    );
    let brief_path = run_dir.join("reconcile_brief.md");
    fs::write(&brief_path, brief)
        .await
        .context("writing reconcile_brief.md")?;

    let manifest = ReportManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("outcomes", &run_dir, &outcomes_path)?,
            manifest_entry("brief", &run_dir, &brief_path)?,
        ],
    };
    let manifest_bytes =
        serde_json::to_vec_pretty(&manifest).context("serializing report manifest")?;
    fs::write(run_dir.join("manifest.json"), manifest_bytes)
        .await
        .context("writing manifest.json")?;

    Ok(ReconcileRunSummary {
        run_id,
        started_at,
        finished_at,
        total: outcomes.len(),
        created,
        updated,
        already_consistent,
        failed,
        reports_dir: run_dir.display().to_string(),
    })
}

fn tally(outcomes: &[ReconciliationOutcome]) -> (usize, usize, usize, usize) {
    let mut counts = (0usize, 0usize, 0usize, 0usize);
    for outcome in outcomes {
        match outcome.status {
            OutcomeStatus::Created => counts.0 += 1,
            OutcomeStatus::Updated => counts.1 += 1,
            OutcomeStatus::AlreadyConsistent => counts.2 += 1,
            OutcomeStatus::Failed => counts.3 += 1,
        }
    }
    counts
}

fn manifest_entry(name: &str, run_dir: &Path, path: &Path) -> Result<ReportManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path.strip_prefix(run_dir).unwrap_or(path).display().to_string();
    Ok(ReportManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

pub fn build_reconciler(config: &ReconConfig) -> Result<Reconciler> {
    let baas = config.baas();
    let auth = AdminAuthClient::new(&baas).context("building auth admin client")?;
    let profiles = RestProfileStore::new(&baas).context("building profile store client")?;
    Ok(Reconciler::new(Arc::new(auth), Arc::new(profiles)))
}

/// CLI entry: load a YAML batch, reconcile it against the environment's
/// backend, and persist a run report.
pub async fn run_batch_from_env(batch_path: &Path) -> Result<ReconcileRunSummary> {
    let config = ReconConfig::from_env();
    let reconciler = build_reconciler(&config)?;
    let targets = load_target_batch(batch_path).await?;

    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    let outcomes = reconciler.reconcile(&targets).await?;
    let finished_at = Utc::now();

    write_run_report(&config.reports_dir, run_id, started_at, finished_at, &outcomes).await
}
