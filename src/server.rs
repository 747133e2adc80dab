//!
//! HACKLINK HTTP server
//! --------------------
//! Axum-based JSON API over the reconciler, the profile and bot stores and
//! the deployment/email adapters.
//!
//! Responsibilities:
//! - Token auth: bearer session tokens issued by the identity provider.
//! - Register/login/logout endpoints backed by the session reconciler.
//! - Daily coin claim and referral economy endpoints.
//! - Bot deployment and lifecycle pass-through, debiting the deploy cost.
//! - Admin console endpoints gated on the configured admin email.
//! - Email-verification landing endpoint serving minimal HTML.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};

use crate::bots::{Bot, BotStatus, BotStore, DeployClient, DeployRequest, EnvVar};
use crate::config::Config;
use crate::email::EmailSender;
use crate::error::AppError;
use crate::identity::{
    ApplicationUser, ApplicationUserPatch, CoinPolicy, IdentityProvider, LocalIdentityProvider, Reconciler, Session,
};
use crate::profiles::{JsonProfileStore, ProfilePatch, ProfileStore};

/// Shared server state injected into all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn ProfileStore>,
    pub provider: Arc<LocalIdentityProvider>,
    pub reconciler: Arc<Reconciler>,
    pub bots: Arc<BotStore>,
    pub deploy: Arc<DeployClient>,
    pub email: Arc<EmailSender>,
}

fn log_startup(config: &Config) {
    let cwd = std::env::current_dir().ok();
    info!(
        target: "startup",
        "HACKLINK starting. cwd={:?}, data_dir='{}', http_port={}, admin='{}', deploy_api='{}'",
        cwd, config.data_dir, config.http_port, config.admin_email, config.deploy_api_url
    );
}

/// Build the application state, spawn the reconciler loop over the identity
/// change feed, and serve the API.
pub async fn run(config: Config) -> anyhow::Result<()> {
    log_startup(&config);
    std::fs::create_dir_all(&config.data_dir)?;

    let store: Arc<dyn ProfileStore> = Arc::new(JsonProfileStore::new(&config.data_dir)?);
    // The confirmation gate stays off: /api/verify-email validates its token
    // against the profile row, and profile rows only exist once a session has
    // been reconciled. Wiring the gated mode up would need confirmation to go
    // through the provider's credential table instead.
    let provider = Arc::new(LocalIdentityProvider::new(false));
    let provider_dyn: Arc<dyn IdentityProvider> = provider.clone();
    let reconciler = Arc::new(Reconciler::new(store.clone(), provider_dyn, CoinPolicy::from(&config)));

    // The reconciler consumes the change feed on its own task; handlers never
    // run reconciliation re-entrantly inside a provider callback.
    let sub = provider.subscribe();
    tokio::spawn(reconciler.clone().run(sub));

    let state = AppState {
        bots: Arc::new(BotStore::new(&config.data_dir)?),
        deploy: Arc::new(DeployClient::new(&config.deploy_api_url, &config.deploy_api_key)),
        email: Arc::new(EmailSender::new(&config.email_fn_url, &config.public_url)),
        store,
        provider,
        reconciler,
        config: config.clone(),
    };

    let app = router(state);
    let addr: SocketAddr = format!("0.0.0.0:{}", config.http_port).parse()?;
    info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { "hacklink ok" }))
        .route("/api/auth/register", post(register))
        .route("/api/auth/login", post(login))
        .route("/api/auth/logout", post(logout))
        .route("/api/auth/me", get(me))
        .route("/api/coins/claim-daily", post(claim_daily))
        .route("/api/bots", get(list_bots))
        .route("/api/bots/deploy", post(deploy_bot))
        .route("/api/bots/{id}/restart", post(restart_bot))
        .route("/api/bots/{id}", delete(delete_bot))
        .route("/api/verify-email", get(verify_email))
        .route("/api/admin/users", get(admin_users))
        .route("/api/admin/users/{id}/coins", put(admin_set_coins))
        .route("/api/admin/coins/transfer", post(admin_transfer))
        .route("/api/admin/bots", get(admin_bots))
        .route("/api/admin/bots/{id}/{action}", post(admin_bot_action))
        .route("/api/admin/bots/{id}", delete(admin_delete_bot))
        .with_state(state)
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let v = headers.get(axum::http::header::AUTHORIZATION)?;
    let s = v.to_str().ok()?;
    s.strip_prefix("Bearer ").map(|t| t.trim().to_string())
}

fn app_error(e: &AppError) -> Response {
    let status = StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(json!({"status": "error", "code": e.code_str(), "message": e.message()})),
    )
        .into_response()
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({"status": "unauthorized"}))).into_response()
}

fn forbidden() -> Response {
    (StatusCode::FORBIDDEN, Json(json!({"status": "forbidden"}))).into_response()
}

/// Resolve the caller's session from the bearer token, or answer 401.
fn require_session(state: &AppState, headers: &HeaderMap) -> Result<Session, Response> {
    let Some(token) = bearer_token(headers) else {
        return Err(unauthorized());
    };
    state.provider.get_session(&token).ok_or_else(unauthorized)
}

/// Admin guard: the caller's profile email must equal the configured admin
/// address. A valid session without a profile is not an admin.
fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<Session, Response> {
    let session = require_session(state, headers)?;
    match state.store.find_by_id(&session.subject) {
        Ok(Some(p)) if p.email == state.config.admin_email => Ok(session),
        Ok(_) => Err(forbidden()),
        Err(e) => Err(app_error(&e)),
    }
}

#[derive(Debug, Deserialize)]
struct RegisterPayload {
    email: String,
    username: String,
    password: String,
    referral_code: Option<String>,
}

async fn register(State(state): State<AppState>, Json(payload): Json<RegisterPayload>) -> Response {
    let session = match state.reconciler.register(
        &payload.email,
        &payload.username,
        &payload.password,
        payload.referral_code.as_deref(),
    ) {
        Ok(Some(s)) => s,
        Ok(None) => {
            // Provider is holding the account until the email is confirmed.
            return (
                StatusCode::OK,
                Json(json!({"status": "ok", "message": "Check your email to verify your account."})),
            )
                .into_response();
        }
        // Provider message surfaced verbatim.
        Err(e) => return app_error(&e),
    };

    // Resolve the profile now so the response can carry it; the change-feed
    // reconciliation for the same session is idempotent against this.
    let profile = match state.reconciler.resolve_or_create_profile(&session) {
        Ok(p) => p,
        Err(e) => {
            // Registered but not fully usable; the session stays valid.
            warn!(target: "auth", "profile creation failed after signup: {}", e);
            return (
                StatusCode::OK,
                Json(json!({"status": "ok", "token": session.token, "user": null})),
            )
                .into_response();
        }
    };

    // Issue and record a verification token, then hand the mail to the
    // external function. A delivery failure is logged, not fatal.
    let token = EmailSender::issue_token();
    if let Err(e) = state.store.update(
        &profile.id,
        ProfilePatch {
            verification_token: Some(Some(token.clone())),
            email_verified: Some(false),
            ..Default::default()
        },
    ) {
        warn!(target: "email", "could not record verification token: {}", e);
    } else {
        let email = state.email.clone();
        let (to, username, user_id) = (profile.email.clone(), profile.username.clone(), profile.id.clone());
        tokio::spawn(async move {
            if let Err(e) = email.send_verification_email(&to, &username, &user_id, &token).await {
                warn!(target: "email", "verification mail failed for {}: {}", to, e);
            }
        });
    }

    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "token": session.token,
            "user": ApplicationUser::from(&profile)
        })),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct LoginPayload {
    identifier: String,
    password: String,
}

async fn login(State(state): State<AppState>, Json(payload): Json<LoginPayload>) -> Response {
    let session = match state.reconciler.login_by_identifier(&payload.identifier, &payload.password) {
        Ok(s) => s,
        Err(e) => return app_error(&e),
    };
    match state.reconciler.resolve_or_create_profile(&session) {
        Ok(profile) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "token": session.token,
                "user": ApplicationUser::from(&profile)
            })),
        )
            .into_response(),
        Err(e) => {
            // Authenticated but without a profile: signed in, not fully usable.
            error!("profile resolution failed at login: {}", e);
            (
                StatusCode::OK,
                Json(json!({"status": "ok", "token": session.token, "user": null})),
            )
                .into_response()
        }
    }
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(token) = bearer_token(&headers) else {
        return unauthorized();
    };
    match state.reconciler.logout(&token) {
        Ok(()) => (StatusCode::OK, Json(json!({"status": "ok"}))).into_response(),
        Err(e) => app_error(&e),
    }
}

async fn me(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let session = match require_session(&state, &headers) {
        Ok(s) => s,
        Err(r) => return r,
    };
    match state.store.find_by_id(&session.subject) {
        Ok(Some(p)) => {
            (StatusCode::OK, Json(json!({"status": "ok", "user": ApplicationUser::from(&p)}))).into_response()
        }
        // Session valid, profile missing: report signed-in-but-unusable.
        Ok(None) => (StatusCode::OK, Json(json!({"status": "ok", "user": null}))).into_response(),
        Err(e) => app_error(&e),
    }
}

async fn claim_daily(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let session = match require_session(&state, &headers) {
        Ok(s) => s,
        Err(r) => return r,
    };
    match state.reconciler.claim_daily_bonus(&session.subject) {
        Ok(p) => (
            StatusCode::OK,
            Json(json!({"status": "ok", "coins": p.coins, "last_claim": p.last_claim})),
        )
            .into_response(),
        Err(e) => app_error(&e),
    }
}

async fn list_bots(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let session = match require_session(&state, &headers) {
        Ok(s) => s,
        Err(r) => return r,
    };
    match state.bots.list_for_owner(&session.subject) {
        Ok(bots) => (StatusCode::OK, Json(json!({"status": "ok", "bots": bots}))).into_response(),
        Err(e) => app_error(&e),
    }
}

#[derive(Debug, Deserialize)]
struct DeployPayload {
    name: String,
    github_repo: String,
    #[serde(default = "default_build_command")]
    build_command: String,
    #[serde(default = "default_start_command")]
    start_command: String,
    #[serde(default)]
    env_vars: Vec<EnvVar>,
}

fn default_build_command() -> String {
    "npm install".to_string()
}

fn default_start_command() -> String {
    "node index.js".to_string()
}

async fn deploy_bot(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<DeployPayload>,
) -> Response {
    let session = match require_session(&state, &headers) {
        Ok(s) => s,
        Err(r) => return r,
    };
    if payload.name.trim().is_empty() || payload.github_repo.trim().is_empty() {
        return app_error(&AppError::user("missing_fields", "name and github_repo are required"));
    }
    let profile = match state.store.find_by_id(&session.subject) {
        Ok(Some(p)) => p,
        Ok(None) => return app_error(&AppError::not_found("profile_not_found", "no profile for session")),
        Err(e) => return app_error(&e),
    };
    let cost = state.config.deploy_cost;
    if profile.coins < cost {
        return app_error(&AppError::user(
            "insufficient_coins",
            format!("You need at least {} coins to deploy a bot.", cost),
        ));
    }

    // Empty env pairs are dropped, matching what the deploy form submits.
    let env_vars: Vec<EnvVar> = payload
        .env_vars
        .into_iter()
        .filter(|e| !e.key.trim().is_empty() && !e.value.trim().is_empty())
        .collect();
    let req = DeployRequest {
        name: payload.name.trim().to_string(),
        repo_url: payload.github_repo.trim().to_string(),
        build_cmd: payload.build_command,
        start_cmd: payload.start_command,
        env_vars,
    };
    let deployment_id = match state.deploy.deploy(&req).await {
        Ok(id) => id,
        Err(e) => return app_error(&AppError::from(e)),
    };

    let bot = Bot {
        id: uuid::Uuid::new_v4().to_string(),
        owner_id: session.subject.clone(),
        name: req.name.clone(),
        github_repo: req.repo_url.clone(),
        status: BotStatus::Deploying,
        deployment_id: Some(deployment_id),
        created_at: chrono::Utc::now(),
    };
    if let Err(e) = state.bots.insert(bot.clone()) {
        return app_error(&e);
    }

    // Debit after the platform accepted the deployment. The reported balance
    // is always the one the store holds: on a failed debit the deployment
    // stands undebited and the response says so.
    let coins = match state.store.update(&profile.id, ProfilePatch { coins: Some(profile.coins - cost), ..Default::default() }) {
        Ok(updated) => {
            if state.reconciler.current_user().map(|u| u.id == updated.id).unwrap_or(false) {
                state
                    .reconciler
                    .update_user(ApplicationUserPatch { coins: Some(updated.coins), ..Default::default() });
            }
            updated.coins
        }
        Err(e) => {
            error!("coin debit failed after deploy: {}", e);
            match state.store.find_by_id(&profile.id) {
                Ok(Some(p)) => p.coins,
                _ => profile.coins,
            }
        }
    };

    (StatusCode::OK, Json(json!({"status": "ok", "bot": bot, "coins": coins}))).into_response()
}

/// Load a bot and check it belongs to the caller.
fn owned_bot(state: &AppState, session: &Session, id: &str) -> Result<Bot, Response> {
    match state.bots.get(id) {
        Ok(Some(b)) if b.owner_id == session.subject => Ok(b),
        // Not distinguishing "someone else's bot" from "no bot" to the caller.
        Ok(_) => Err(app_error(&AppError::not_found("bot_not_found", "no bot for id"))),
        Err(e) => Err(app_error(&e)),
    }
}

async fn restart_bot(State(state): State<AppState>, headers: HeaderMap, Path(id): Path<String>) -> Response {
    let session = match require_session(&state, &headers) {
        Ok(s) => s,
        Err(r) => return r,
    };
    let bot = match owned_bot(&state, &session, &id) {
        Ok(b) => b,
        Err(r) => return r,
    };
    let Some(dep) = bot.deployment_id.as_deref() else {
        return app_error(&AppError::user("not_deployed", "bot has no deployment"));
    };
    if let Err(e) = state.deploy.restart(dep).await {
        return app_error(&AppError::from(e));
    }
    match state.bots.set_status(&id, BotStatus::Running) {
        Ok(b) => (StatusCode::OK, Json(json!({"status": "ok", "bot": b}))).into_response(),
        Err(e) => app_error(&e),
    }
}

async fn delete_bot(State(state): State<AppState>, headers: HeaderMap, Path(id): Path<String>) -> Response {
    let session = match require_session(&state, &headers) {
        Ok(s) => s,
        Err(r) => return r,
    };
    let bot = match owned_bot(&state, &session, &id) {
        Ok(b) => b,
        Err(r) => return r,
    };
    if let Some(dep) = bot.deployment_id.as_deref() {
        if let Err(e) = state.deploy.delete(dep).await {
            return app_error(&AppError::from(e));
        }
    }
    match state.bots.remove(&id) {
        Ok(()) => (StatusCode::OK, Json(json!({"status": "ok"}))).into_response(),
        Err(e) => app_error(&e),
    }
}

#[derive(Debug, Deserialize)]
struct VerifyQuery {
    token: Option<String>,
    user_id: Option<String>,
}

const VERIFY_OK_HTML: &str = "<html><head><title>Email Verified</title></head>\
<body style=\"font-family: sans-serif; max-width: 600px; margin: 50px auto; text-align: center;\">\
<h1>Email Verified</h1><p>Your email has been verified. You can close this tab and sign in.</p>\
</body></html>";

const VERIFY_FAIL_HTML: &str = "<html><head><title>Verification Failed</title></head>\
<body style=\"font-family: sans-serif; max-width: 600px; margin: 50px auto; text-align: center;\">\
<h1>Verification Failed</h1><p>Invalid verification link. Please try again or contact support.</p>\
</body></html>";

async fn verify_email(State(state): State<AppState>, Query(q): Query<VerifyQuery>) -> Response {
    let (Some(token), Some(user_id)) = (q.token, q.user_id) else {
        return (StatusCode::BAD_REQUEST, Html(VERIFY_FAIL_HTML)).into_response();
    };
    let profile = match state.store.find_by_id(&user_id) {
        Ok(Some(p)) => p,
        _ => return (StatusCode::BAD_REQUEST, Html(VERIFY_FAIL_HTML)).into_response(),
    };
    if profile.verification_token.as_deref() != Some(token.as_str()) {
        return (StatusCode::BAD_REQUEST, Html(VERIFY_FAIL_HTML)).into_response();
    }
    let patch = ProfilePatch {
        email_verified: Some(true),
        verification_token: Some(None),
        ..Default::default()
    };
    if state.store.update(&user_id, patch).is_err() {
        return (StatusCode::BAD_REQUEST, Html(VERIFY_FAIL_HTML)).into_response();
    }
    state.provider.confirm_email(&profile.email);
    info!(target: "email", "email verified for {}", profile.email);
    (StatusCode::OK, Html(VERIFY_OK_HTML)).into_response()
}

async fn admin_users(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(r) = require_admin(&state, &headers) {
        return r;
    }
    match state.store.list() {
        Ok(users) => (StatusCode::OK, Json(json!({"status": "ok", "users": users}))).into_response(),
        Err(e) => app_error(&e),
    }
}

#[derive(Debug, Deserialize)]
struct CoinsPayload {
    amount: i64,
}

async fn admin_set_coins(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(payload): Json<CoinsPayload>,
) -> Response {
    if let Err(r) = require_admin(&state, &headers) {
        return r;
    }
    match state.store.update(&id, ProfilePatch { coins: Some(payload.amount), ..Default::default() }) {
        Ok(p) => (StatusCode::OK, Json(json!({"status": "ok", "user": ApplicationUser::from(&p)}))).into_response(),
        Err(e) => app_error(&e),
    }
}

#[derive(Debug, Deserialize)]
struct TransferPayload {
    email_or_username: String,
    amount: i64,
}

async fn admin_transfer(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<TransferPayload>,
) -> Response {
    if let Err(r) = require_admin(&state, &headers) {
        return r;
    }
    if payload.email_or_username.trim().is_empty() || payload.amount <= 0 {
        return app_error(&AppError::user("invalid_transfer", "Invalid transfer details"));
    }
    let target = match state.store.find_by_email(&payload.email_or_username) {
        Ok(Some(p)) => Some(p),
        Ok(None) => match state.store.find_by_username(&payload.email_or_username) {
            Ok(found) => found,
            Err(e) => return app_error(&e),
        },
        Err(e) => return app_error(&e),
    };
    let Some(target) = target else {
        return app_error(&AppError::not_found("user_not_found", "User not found"));
    };
    let Some(new_balance) = target.coins.checked_add(payload.amount) else {
        return app_error(&AppError::user("invalid_transfer", "Invalid transfer details"));
    };
    match state.store.update(&target.id, ProfilePatch { coins: Some(new_balance), ..Default::default() }) {
        Ok(p) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "message": format!("Successfully transferred {} coins to {}", payload.amount, p.username),
                "user": {"id": p.id, "username": p.username, "email": p.email, "newBalance": p.coins}
            })),
        )
            .into_response(),
        Err(e) => app_error(&e),
    }
}

async fn admin_bots(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(r) = require_admin(&state, &headers) {
        return r;
    }
    match state.bots.list_all() {
        Ok(bots) => (StatusCode::OK, Json(json!({"status": "ok", "bots": bots}))).into_response(),
        Err(e) => app_error(&e),
    }
}

async fn admin_bot_action(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((id, action)): Path<(String, String)>,
) -> Response {
    if let Err(r) = require_admin(&state, &headers) {
        return r;
    }
    let bot = match state.bots.get(&id) {
        Ok(Some(b)) => b,
        Ok(None) => return app_error(&AppError::not_found("bot_not_found", "no bot for id")),
        Err(e) => return app_error(&e),
    };
    let Some(dep) = bot.deployment_id.as_deref() else {
        return app_error(&AppError::user("not_deployed", "bot has no deployment"));
    };
    let (result, status) = match action.as_str() {
        "start" => (state.deploy.start(dep).await, BotStatus::Running),
        "stop" => (state.deploy.stop(dep).await, BotStatus::Stopped),
        "restart" => (state.deploy.restart(dep).await, BotStatus::Running),
        _ => return app_error(&AppError::user("unknown_action", "action must be start, stop or restart")),
    };
    if let Err(e) = result {
        return app_error(&AppError::from(e));
    }
    match state.bots.set_status(&id, status) {
        Ok(b) => (StatusCode::OK, Json(json!({"status": "ok", "bot": b}))).into_response(),
        Err(e) => app_error(&e),
    }
}

async fn admin_delete_bot(State(state): State<AppState>, headers: HeaderMap, Path(id): Path<String>) -> Response {
    if let Err(r) = require_admin(&state, &headers) {
        return r;
    }
    let bot = match state.bots.get(&id) {
        Ok(Some(b)) => b,
        Ok(None) => return app_error(&AppError::not_found("bot_not_found", "no bot for id")),
        Err(e) => return app_error(&e),
    };
    if let Some(dep) = bot.deployment_id.as_deref() {
        if let Err(e) = state.deploy.delete(dep).await {
            return app_error(&AppError::from(e));
        }
    }
    match state.bots.remove(&id) {
        Ok(()) => (StatusCode::OK, Json(json!({"status": "ok"}))).into_response(),
        Err(e) => app_error(&e),
    }
}
