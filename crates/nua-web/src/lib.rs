//! Axum JSON admin API over the reconciler.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use nua_core::{ReconciliationOutcome, TargetUser};
use nua_recon::{OrphanRemovalError, PasswordResetError, Reconciler};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "nua-web";

#[derive(Clone)]
pub struct AppState {
    pub recon: Reconciler,
}

impl AppState {
    pub fn new(recon: Reconciler) -> Self {
        Self { recon }
    }
}

#[derive(Debug, Deserialize)]
pub struct ReconcileRequest {
    pub users: Vec<TargetUser>,
}

#[derive(Debug, Serialize)]
pub struct ReconcileResponse {
    pub run_id: Uuid,
    pub outcomes: Vec<ReconciliationOutcome>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RemoveOrphanRequest {
    #[serde(default)]
    pub confirm: bool,
}

#[derive(Debug, Deserialize)]
pub struct PasswordResetRequest {
    pub email: String,
    pub new_password: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/api/reconcile", post(reconcile_handler))
        .route("/api/orphans", get(orphans_handler))
        .route("/api/orphans/{id}/remove", post(orphan_remove_handler))
        .route("/api/password-resets", post(password_reset_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env(state: AppState) -> anyhow::Result<()> {
    let port: u16 = std::env::var("NUA_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn healthz_handler() -> Response {
    Json(serde_json::json!({"status": "ok"})).into_response()
}

async fn reconcile_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ReconcileRequest>,
) -> Response {
    let run_id = Uuid::new_v4();
    info!(%run_id, users = request.users.len(), "reconcile requested");
    match state.recon.reconcile(&request.users).await {
        Ok(outcomes) => Json(ReconcileResponse { run_id, outcomes }).into_response(),
        // Only malformed batches fail the whole call; per-user failures
        // come back inside the outcomes.
        Err(err) => error_response(StatusCode::BAD_REQUEST, err.to_string()),
    }
}

async fn orphans_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.recon.scan_orphans().await {
        Ok(reports) => Json(reports).into_response(),
        Err(err) => error_response(StatusCode::BAD_GATEWAY, err.to_string()),
    }
}

async fn orphan_remove_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
    Json(request): Json<RemoveOrphanRequest>,
) -> Response {
    match state.recon.remove_orphan_profile(id, request.confirm).await {
        Ok(()) => Json(serde_json::json!({"removed": id})).into_response(),
        Err(OrphanRemovalError::NotConfirmed) => {
            error_response(StatusCode::BAD_REQUEST, "confirmation required")
        }
        Err(OrphanRemovalError::NotFound(id)) => {
            error_response(StatusCode::NOT_FOUND, format!("no profile row {id}"))
        }
        Err(err @ OrphanRemovalError::NotOrphaned(_)) => {
            error_response(StatusCode::CONFLICT, err.to_string())
        }
        Err(OrphanRemovalError::Provider(err)) => {
            error_response(StatusCode::BAD_GATEWAY, err.to_string())
        }
    }
}

async fn password_reset_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PasswordResetRequest>,
) -> Response {
    match state
        .recon
        .reset_password(&request.email, &request.new_password)
        .await
    {
        Ok(user_id) => Json(serde_json::json!({"user_id": user_id})).into_response(),
        Err(err @ PasswordResetError::NotFound(_)) => {
            error_response(StatusCode::NOT_FOUND, err.to_string())
        }
        Err(err @ PasswordResetError::Conflict(_)) => {
            error_response(StatusCode::CONFLICT, err.to_string())
        }
        Err(PasswordResetError::Provider(err)) => {
            error_response(StatusCode::BAD_GATEWAY, err.to_string())
        }
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({"error": message.into()}))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use chrono::Utc;
    use http_body_util::BodyExt;
    use nua_core::{AuthRecord, ProfileRecord, Role};
    use nua_providers::{MemoryAuthProvider, MemoryProfileStore};
    use tower::ServiceExt;

    fn test_app() -> (Arc<MemoryAuthProvider>, Arc<MemoryProfileStore>, Router) {
        let auth = Arc::new(MemoryAuthProvider::new());
        let profiles = Arc::new(MemoryProfileStore::new());
        let recon = Reconciler::new(auth.clone(), profiles.clone());
        (auth, profiles, app(AppState::new(recon)))
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap()
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn healthz_responds_ok() {
        let (_auth, _profiles, app) = test_app();
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn reconcile_creates_user_and_reports_outcome() {
        let (auth, profiles, app) = test_app();
        let resp = app
            .oneshot(json_request(
                "POST",
                "/api/reconcile",
                serde_json::json!({"users": [{
                    "email": "a@x.com",
                    "password": "P1!",
                    "role": "cleaner",
                    "first_name": "A",
                    "last_name": "B"
                }]}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = body_json(resp).await;
        assert_eq!(body["outcomes"][0]["status"], "created");
        assert_eq!(auth.records().len(), 1);
        assert_eq!(profiles.rows().len(), 1);
    }

    #[tokio::test]
    async fn malformed_batch_is_a_bad_request() {
        let (_auth, _profiles, app) = test_app();
        let resp = app
            .oneshot(json_request(
                "POST",
                "/api/reconcile",
                serde_json::json!({"users": []}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = body_json(resp).await;
        assert!(body["error"].as_str().unwrap().contains("at least one"));
    }

    #[tokio::test]
    async fn orphan_listing_and_confirmed_removal() {
        let (_auth, profiles, app) = test_app();
        let stale = Uuid::new_v4();
        let now = Utc::now();
        profiles.insert(ProfileRecord {
            id: stale,
            email: "stale@x.com".into(),
            first_name: "S".into(),
            last_name: "T".into(),
            role: Role::Homeowner,
            created_at: now,
            updated_at: now,
        });

        let listing = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/orphans")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(listing.status(), StatusCode::OK);
        let body = body_json(listing).await;
        assert_eq!(body[0]["kind"], "profile_without_auth");

        let unconfirmed = app
            .clone()
            .oneshot(json_request(
                "POST",
                &format!("/api/orphans/{stale}/remove"),
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(unconfirmed.status(), StatusCode::BAD_REQUEST);
        assert_eq!(profiles.rows().len(), 1);

        let confirmed = app
            .oneshot(json_request(
                "POST",
                &format!("/api/orphans/{stale}/remove"),
                serde_json::json!({"confirm": true}),
            ))
            .await
            .unwrap();
        assert_eq!(confirmed.status(), StatusCode::OK);
        assert!(profiles.rows().is_empty());
    }

    #[tokio::test]
    async fn password_reset_maps_errors_to_statuses() {
        let (auth, _profiles, app) = test_app();
        let id = Uuid::new_v4();
        auth.insert(
            AuthRecord {
                id,
                email: "a@x.com".into(),
                email_confirmed: true,
                metadata: serde_json::Value::Null,
            },
            "OLD",
        );

        let ok = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/password-resets",
                serde_json::json!({"email": "a@x.com", "new_password": "NEW"}),
            ))
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        assert_eq!(auth.password_of(id).as_deref(), Some("NEW"));

        let missing = app
            .oneshot(json_request(
                "POST",
                "/api/password-resets",
                serde_json::json!({"email": "nobody@x.com", "new_password": "NEW"}),
            ))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }
}
