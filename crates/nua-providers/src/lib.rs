//! Collaborator ports for reconciliation + HTTP-backed implementations
//! against the backend-as-a-service admin API, plus in-memory doubles.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nua_core::{AuthRecord, ProfileRecord, Role};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info_span;
use uuid::Uuid;

pub const CRATE_NAME: &str = "nua-providers";

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("http status {status}: {detail}")]
    Http { status: u16, detail: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("decoding response: {0}")]
    Decode(String),
    #[error("{0}")]
    Rejected(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ProviderError::Decode(err.to_string())
        } else {
            ProviderError::Transport(err.to_string())
        }
    }
}

/// Request payload for creating an authentication record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAuthUser {
    pub email: String,
    pub password: String,
    pub email_confirmed: bool,
    pub metadata: serde_json::Value,
}

/// Partial update for a profile row. Only the fields carried are written;
/// `updated_at` is always refreshed alongside them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfilePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    pub updated_at: DateTime<Utc>,
}

impl ProfilePatch {
    pub fn is_empty(&self) -> bool {
        self.id.is_none() && self.role.is_none()
    }
}

/// Service of record for login credentials and confirmation state.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// All auth records carrying this email. More than one is a conflict
    /// the caller must handle; this port only reports what the provider has.
    async fn find_by_email(&self, email: &str) -> Result<Vec<AuthRecord>, ProviderError>;

    async fn create(&self, user: NewAuthUser) -> Result<AuthRecord, ProviderError>;

    /// Explicit credential change. Reconciliation never calls this.
    async fn set_password(&self, id: Uuid, password: &str) -> Result<(), ProviderError>;

    async fn list(&self) -> Result<Vec<AuthRecord>, ProviderError>;
}

/// Service of record for application-level user attributes.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn find_by_email(&self, email: &str) -> Result<Option<ProfileRecord>, ProviderError>;

    async fn create(&self, record: &ProfileRecord) -> Result<(), ProviderError>;

    /// Patch the row currently keyed by `id`.
    async fn update(&self, id: Uuid, patch: ProfilePatch) -> Result<(), ProviderError>;

    async fn delete(&self, id: Uuid) -> Result<(), ProviderError>;

    async fn list(&self) -> Result<Vec<ProfileRecord>, ProviderError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Connection settings for the backend-as-a-service project.
#[derive(Debug, Clone)]
pub struct BaasConfig {
    pub base_url: String,
    pub service_key: String,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl BaasConfig {
    pub fn new(base_url: impl Into<String>, service_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            service_key: service_key.into(),
            timeout: Duration::from_secs(20),
            backoff: BackoffPolicy::default(),
        }
    }
}

async fn send_with_retries(
    backoff: &BackoffPolicy,
    label: &str,
    build: impl Fn() -> reqwest::RequestBuilder,
) -> Result<reqwest::Response, ProviderError> {
    let span = info_span!("baas_request", label);
    let _guard = span.enter();

    let mut last_error: Option<reqwest::Error> = None;

    for attempt in 0..=backoff.max_retries {
        match build().send().await {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    return Ok(resp);
                }
                if classify_status(status) == RetryDisposition::Retryable
                    && attempt < backoff.max_retries
                {
                    tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                    continue;
                }
                let detail = resp.text().await.unwrap_or_default();
                return Err(ProviderError::Http {
                    status: status.as_u16(),
                    detail: if detail.is_empty() {
                        label.to_string()
                    } else {
                        detail
                    },
                });
            }
            Err(err) => {
                if classify_reqwest_error(&err) == RetryDisposition::Retryable
                    && attempt < backoff.max_retries
                {
                    last_error = Some(err);
                    tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                    continue;
                }
                return Err(err.into());
            }
        }
    }

    Err(ProviderError::Transport(
        last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| format!("{label}: retries exhausted")),
    ))
}

/// Wire shape of the admin users endpoint.
#[derive(Debug, Deserialize)]
struct AdminUserRow {
    id: Uuid,
    email: Option<String>,
    email_confirmed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    user_metadata: serde_json::Value,
}

impl AdminUserRow {
    fn into_record(self) -> AuthRecord {
        AuthRecord {
            id: self.id,
            email: self.email.unwrap_or_default(),
            email_confirmed: self.email_confirmed_at.is_some(),
            metadata: self.user_metadata,
        }
    }
}

#[derive(Debug, Deserialize)]
struct AdminUserList {
    users: Vec<AdminUserRow>,
}

/// Auth admin API client (service-role key, `/auth/v1/admin/users`).
#[derive(Debug)]
pub struct AdminAuthClient {
    client: reqwest::Client,
    base_url: String,
    service_key: String,
    backoff: BackoffPolicy,
}

impl AdminAuthClient {
    pub fn new(config: &BaasConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            service_key: config.service_key.clone(),
            backoff: config.backoff,
        })
    }

    fn admin_users_url(&self) -> String {
        format!("{}/auth/v1/admin/users", self.base_url)
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
    }

    async fn fetch_all_users(&self) -> Result<Vec<AuthRecord>, ProviderError> {
        let url = self.admin_users_url();
        let resp = send_with_retries(&self.backoff, "auth.list", || {
            self.authed(self.client.get(&url).query(&[("per_page", "1000")]))
        })
        .await?;
        let list: AdminUserList = resp
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        Ok(list.users.into_iter().map(AdminUserRow::into_record).collect())
    }
}

#[async_trait]
impl AuthProvider for AdminAuthClient {
    // The admin endpoint has no server-side email filter; list and match
    // locally, the way the original tooling did.
    async fn find_by_email(&self, email: &str) -> Result<Vec<AuthRecord>, ProviderError> {
        let users = self.fetch_all_users().await?;
        Ok(users
            .into_iter()
            .filter(|u| u.email.eq_ignore_ascii_case(email))
            .collect())
    }

    async fn create(&self, user: NewAuthUser) -> Result<AuthRecord, ProviderError> {
        let url = self.admin_users_url();
        let body = serde_json::json!({
            "email": user.email,
            "password": user.password,
            "email_confirm": user.email_confirmed,
            "user_metadata": user.metadata,
        });
        let resp = send_with_retries(&self.backoff, "auth.create", || {
            self.authed(self.client.post(&url).json(&body))
        })
        .await?;
        let row: AdminUserRow = resp
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        Ok(row.into_record())
    }

    async fn set_password(&self, id: Uuid, password: &str) -> Result<(), ProviderError> {
        let url = format!("{}/{}", self.admin_users_url(), id);
        let body = serde_json::json!({ "password": password });
        send_with_retries(&self.backoff, "auth.set_password", || {
            self.authed(self.client.put(&url).json(&body))
        })
        .await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<AuthRecord>, ProviderError> {
        self.fetch_all_users().await
    }
}

/// PostgREST-style client for the `user_profiles` table.
#[derive(Debug)]
pub struct RestProfileStore {
    client: reqwest::Client,
    base_url: String,
    service_key: String,
    backoff: BackoffPolicy,
}

impl RestProfileStore {
    pub fn new(config: &BaasConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            service_key: config.service_key.clone(),
            backoff: config.backoff,
        })
    }

    fn table_url(&self) -> String {
        format!("{}/rest/v1/user_profiles", self.base_url)
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
    }
}

#[async_trait]
impl ProfileStore for RestProfileStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<ProfileRecord>, ProviderError> {
        let url = self.table_url();
        let filter = format!("eq.{email}");
        let resp = send_with_retries(&self.backoff, "profiles.find_by_email", || {
            self.authed(
                self.client
                    .get(&url)
                    .query(&[("select", "*"), ("email", filter.as_str())]),
            )
        })
        .await?;
        let rows: Vec<ProfileRecord> = resp
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        if rows.len() > 1 {
            return Err(ProviderError::Rejected(format!(
                "{} profile rows share email {email}",
                rows.len()
            )));
        }
        Ok(rows.into_iter().next())
    }

    async fn create(&self, record: &ProfileRecord) -> Result<(), ProviderError> {
        let url = self.table_url();
        send_with_retries(&self.backoff, "profiles.create", || {
            self.authed(
                self.client
                    .post(&url)
                    .header("Prefer", "return=representation")
                    .json(record),
            )
        })
        .await?;
        Ok(())
    }

    async fn update(&self, id: Uuid, patch: ProfilePatch) -> Result<(), ProviderError> {
        let url = self.table_url();
        let filter = format!("eq.{id}");
        send_with_retries(&self.backoff, "profiles.update", || {
            self.authed(
                self.client
                    .patch(&url)
                    .query(&[("id", filter.as_str())])
                    .json(&patch),
            )
        })
        .await?;
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<(), ProviderError> {
        let url = self.table_url();
        let filter = format!("eq.{id}");
        send_with_retries(&self.backoff, "profiles.delete", || {
            self.authed(self.client.delete(&url).query(&[("id", filter.as_str())]))
        })
        .await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ProfileRecord>, ProviderError> {
        let url = self.table_url();
        let resp = send_with_retries(&self.backoff, "profiles.list", || {
            self.authed(self.client.get(&url).query(&[("select", "*")]))
        })
        .await?;
        resp.json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))
    }
}

/// Per-method call counts, so tests can assert zero-write properties.
#[derive(Debug, Default)]
pub struct CallLog {
    counts: Mutex<HashMap<&'static str, usize>>,
}

impl CallLog {
    fn hit(&self, op: &'static str) {
        let mut counts = self.counts.lock().expect("call log lock");
        *counts.entry(op).or_default() += 1;
    }

    pub fn count(&self, op: &str) -> usize {
        let counts = self.counts.lock().expect("call log lock");
        counts.get(op).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        let counts = self.counts.lock().expect("call log lock");
        counts.values().sum()
    }

    pub fn writes(&self) -> usize {
        ["create", "update", "delete", "set_password"]
            .iter()
            .map(|op| self.count(op))
            .sum()
    }
}

#[derive(Debug, Default)]
struct FailPlan {
    next: Mutex<HashMap<&'static str, String>>,
}

impl FailPlan {
    fn arm(&self, op: &'static str, message: &str) {
        self.next
            .lock()
            .expect("fail plan lock")
            .insert(op, message.to_string());
    }

    fn trip(&self, op: &'static str) -> Result<(), ProviderError> {
        match self.next.lock().expect("fail plan lock").remove(op) {
            Some(message) => Err(ProviderError::Rejected(message)),
            None => Ok(()),
        }
    }
}

/// In-memory auth provider for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryAuthProvider {
    users: Mutex<Vec<AuthRecord>>,
    passwords: Mutex<HashMap<Uuid, String>>,
    pub calls: CallLog,
    fail: FailPlan,
}

impl MemoryAuthProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: AuthRecord, password: &str) {
        self.passwords
            .lock()
            .expect("passwords lock")
            .insert(record.id, password.to_string());
        self.users.lock().expect("users lock").push(record);
    }

    /// Arm a one-shot failure for the named operation.
    pub fn fail_next(&self, op: &'static str, message: &str) {
        self.fail.arm(op, message);
    }

    pub fn records(&self) -> Vec<AuthRecord> {
        self.users.lock().expect("users lock").clone()
    }

    pub fn password_of(&self, id: Uuid) -> Option<String> {
        self.passwords.lock().expect("passwords lock").get(&id).cloned()
    }
}

#[async_trait]
impl AuthProvider for MemoryAuthProvider {
    async fn find_by_email(&self, email: &str) -> Result<Vec<AuthRecord>, ProviderError> {
        self.calls.hit("find_by_email");
        self.fail.trip("find_by_email")?;
        Ok(self
            .users
            .lock()
            .expect("users lock")
            .iter()
            .filter(|u| u.email.eq_ignore_ascii_case(email))
            .cloned()
            .collect())
    }

    async fn create(&self, user: NewAuthUser) -> Result<AuthRecord, ProviderError> {
        self.calls.hit("create");
        self.fail.trip("create")?;
        let mut users = self.users.lock().expect("users lock");
        if users.iter().any(|u| u.email.eq_ignore_ascii_case(&user.email)) {
            return Err(ProviderError::Rejected(format!(
                "email already registered: {}",
                user.email
            )));
        }
        let record = AuthRecord {
            id: Uuid::new_v4(),
            email: user.email,
            email_confirmed: user.email_confirmed,
            metadata: user.metadata,
        };
        self.passwords
            .lock()
            .expect("passwords lock")
            .insert(record.id, user.password);
        users.push(record.clone());
        Ok(record)
    }

    async fn set_password(&self, id: Uuid, password: &str) -> Result<(), ProviderError> {
        self.calls.hit("set_password");
        self.fail.trip("set_password")?;
        let mut passwords = self.passwords.lock().expect("passwords lock");
        if !passwords.contains_key(&id) {
            return Err(ProviderError::Rejected(format!("no auth user {id}")));
        }
        passwords.insert(id, password.to_string());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<AuthRecord>, ProviderError> {
        self.calls.hit("list");
        self.fail.trip("list")?;
        Ok(self.users.lock().expect("users lock").clone())
    }
}

/// In-memory profile table for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryProfileStore {
    rows: Mutex<Vec<ProfileRecord>>,
    pub calls: CallLog,
    fail: FailPlan,
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: ProfileRecord) {
        self.rows.lock().expect("rows lock").push(record);
    }

    pub fn fail_next(&self, op: &'static str, message: &str) {
        self.fail.arm(op, message);
    }

    pub fn rows(&self) -> Vec<ProfileRecord> {
        self.rows.lock().expect("rows lock").clone()
    }
}

#[async_trait]
impl ProfileStore for MemoryProfileStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<ProfileRecord>, ProviderError> {
        self.calls.hit("find_by_email");
        self.fail.trip("find_by_email")?;
        let matches: Vec<ProfileRecord> = self
            .rows
            .lock()
            .expect("rows lock")
            .iter()
            .filter(|r| r.email.eq_ignore_ascii_case(email))
            .cloned()
            .collect();
        if matches.len() > 1 {
            return Err(ProviderError::Rejected(format!(
                "{} profile rows share email {email}",
                matches.len()
            )));
        }
        Ok(matches.into_iter().next())
    }

    async fn create(&self, record: &ProfileRecord) -> Result<(), ProviderError> {
        self.calls.hit("create");
        self.fail.trip("create")?;
        let mut rows = self.rows.lock().expect("rows lock");
        if rows.iter().any(|r| r.id == record.id) {
            return Err(ProviderError::Rejected(format!(
                "duplicate profile id {}",
                record.id
            )));
        }
        rows.push(record.clone());
        Ok(())
    }

    async fn update(&self, id: Uuid, patch: ProfilePatch) -> Result<(), ProviderError> {
        self.calls.hit("update");
        self.fail.trip("update")?;
        let mut rows = self.rows.lock().expect("rows lock");
        let Some(row) = rows.iter_mut().find(|r| r.id == id) else {
            return Err(ProviderError::Rejected(format!("no profile row {id}")));
        };
        if let Some(new_id) = patch.id {
            row.id = new_id;
        }
        if let Some(role) = patch.role {
            row.role = role;
        }
        row.updated_at = patch.updated_at;
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<(), ProviderError> {
        self.calls.hit("delete");
        self.fail.trip("delete")?;
        let mut rows = self.rows.lock().expect("rows lock");
        let before = rows.len();
        rows.retain(|r| r.id != id);
        if rows.len() == before {
            return Err(ProviderError::Rejected(format!("no profile row {id}")));
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ProfileRecord>, ProviderError> {
        self.calls.hit("list");
        self.fail.trip("list")?;
        Ok(self.rows.lock().expect("rows lock").clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delays_double_per_attempt_up_to_the_cap() {
        let policy = BackoffPolicy {
            max_retries: 4,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_millis(1500),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(800));
        // Capped from here on, including attempt indexes past max_retries.
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(1500));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(1500));
    }

    #[test]
    fn server_errors_and_rate_limits_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn admin_row_maps_confirmation_from_timestamp() {
        let confirmed: AdminUserRow = serde_json::from_value(serde_json::json!({
            "id": "6f2f9b5a-0f0e-4d42-9df5-0f3c2c2f8f11",
            "email": "cleaner@nexxus.com",
            "email_confirmed_at": "2026-03-01T09:00:00Z",
            "user_metadata": {"role": "cleaner"}
        }))
        .unwrap();
        assert!(confirmed.into_record().email_confirmed);

        let unconfirmed: AdminUserRow = serde_json::from_value(serde_json::json!({
            "id": "6f2f9b5a-0f0e-4d42-9df5-0f3c2c2f8f12",
            "email": "new@nexxus.com",
            "email_confirmed_at": null
        }))
        .unwrap();
        let record = unconfirmed.into_record();
        assert!(!record.email_confirmed);
        assert!(record.metadata.is_null());
    }

    #[test]
    fn profile_patch_serializes_only_carried_fields() {
        let patch = ProfilePatch {
            id: None,
            role: Some(Role::Cleaner),
            updated_at: Utc::now(),
        };
        let value = serde_json::to_value(&patch).unwrap();
        assert!(value.get("id").is_none());
        assert_eq!(value["role"], "cleaner");
        assert!(value.get("updated_at").is_some());
    }

    #[test]
    fn admin_urls_trim_trailing_slash() {
        let client =
            AdminAuthClient::new(&BaasConfig::new("https://proj.example.co/", "service-key"))
                .unwrap();
        assert_eq!(
            client.admin_users_url(),
            "https://proj.example.co/auth/v1/admin/users"
        );

        let store =
            RestProfileStore::new(&BaasConfig::new("https://proj.example.co/", "service-key"))
                .unwrap();
        assert_eq!(store.table_url(), "https://proj.example.co/rest/v1/user_profiles");
    }

    #[tokio::test]
    async fn memory_auth_counts_calls_and_rejects_duplicates() {
        let auth = MemoryAuthProvider::new();
        let record = auth
            .create(NewAuthUser {
                email: "a@x.com".into(),
                password: "P1!".into(),
                email_confirmed: true,
                metadata: serde_json::json!({"role": "cleaner"}),
            })
            .await
            .unwrap();
        assert_eq!(auth.password_of(record.id).as_deref(), Some("P1!"));

        let dup = auth
            .create(NewAuthUser {
                email: "A@X.COM".into(),
                password: "P2!".into(),
                email_confirmed: true,
                metadata: serde_json::Value::Null,
            })
            .await;
        assert!(dup.is_err());
        assert_eq!(auth.calls.count("create"), 2);
        assert_eq!(auth.calls.count("find_by_email"), 0);
    }

    #[tokio::test]
    async fn memory_fail_next_is_one_shot() {
        let profiles = MemoryProfileStore::new();
        profiles.fail_next("list", "rate limited");
        let err = profiles.list().await.unwrap_err();
        assert!(matches!(err, ProviderError::Rejected(_)));
        assert!(profiles.list().await.is_ok());
        assert_eq!(profiles.calls.count("list"), 2);
    }

    #[tokio::test]
    async fn duplicate_profile_rows_for_one_email_are_rejected() {
        let profiles = MemoryProfileStore::new();
        let now = Utc::now();
        for _ in 0..2 {
            profiles.insert(ProfileRecord {
                id: Uuid::new_v4(),
                email: "dup@x.com".into(),
                first_name: "A".into(),
                last_name: "B".into(),
                role: Role::Cleaner,
                created_at: now,
                updated_at: now,
            });
        }

        let err = profiles.find_by_email("dup@x.com").await.unwrap_err();
        assert!(matches!(err, ProviderError::Rejected(ref msg) if msg.contains("profile rows")));
    }

    #[tokio::test]
    async fn memory_update_patches_id_and_role() {
        let profiles = MemoryProfileStore::new();
        let stale = Uuid::new_v4();
        let now = Utc::now();
        profiles.insert(ProfileRecord {
            id: stale,
            email: "a@x.com".into(),
            first_name: "A".into(),
            last_name: "B".into(),
            role: Role::Homeowner,
            created_at: now,
            updated_at: now,
        });

        let linked = Uuid::new_v4();
        let later = now + chrono::Duration::seconds(5);
        profiles
            .update(
                stale,
                ProfilePatch {
                    id: Some(linked),
                    role: Some(Role::Cleaner),
                    updated_at: later,
                },
            )
            .await
            .unwrap();

        let rows = profiles.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, linked);
        assert_eq!(rows[0].role, Role::Cleaner);
        assert_eq!(rows[0].updated_at, later);
    }
}
