//! Session reconciler: keeps the application profile in sync with the
//! identity-provider session and publishes the unified user projection.
//!
//! Invariant held here: every active session has exactly one corresponding
//! profile visible to the application. The profile is created lazily on first
//! sight of a session; later sightings return the stored row unchanged.
//!
//! A profile-layer failure never tears the session down. The user stays
//! authenticated with no published projection, which callers must treat as
//! "not fully usable" rather than "signed out".

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::profiles::{Profile, ProfilePatch, ProfileStore};

use super::provider::{AuthSubscription, IdentityProvider};
use super::session::{Session, SignupMetadata};

/// The in-memory, consumer-facing projection of a profile. Built whole per
/// reconciliation and never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationUser {
    pub id: String,
    pub email: String,
    pub username: String,
    pub coins: i64,
    pub referral_code: String,
    pub last_claim: Option<DateTime<Utc>>,
}

/// Explicit partial update of the published projection. The projection is
/// owned by the reconciler; nothing else writes it directly.
#[derive(Debug, Clone, Default)]
pub struct ApplicationUserPatch {
    pub coins: Option<i64>,
    pub last_claim: Option<DateTime<Utc>>,
    pub username: Option<String>,
}

/// Coin policy knobs, lifted out of [`Config`] so the reconciler carries no
/// server endpoints.
#[derive(Debug, Clone)]
pub struct CoinPolicy {
    pub signup_bonus: i64,
    pub referral_bonus: i64,
    pub referral_code_len: usize,
    pub daily_claim_amount: i64,
    pub claim_cooldown_secs: i64,
}

impl Default for CoinPolicy {
    fn default() -> Self {
        Self {
            signup_bonus: 10,
            referral_bonus: 20,
            referral_code_len: 6,
            daily_claim_amount: 10,
            claim_cooldown_secs: 86_400,
        }
    }
}

impl From<&Config> for CoinPolicy {
    fn from(c: &Config) -> Self {
        Self {
            signup_bonus: c.signup_bonus,
            referral_bonus: c.referral_bonus,
            referral_code_len: c.referral_code_len,
            daily_claim_amount: c.daily_claim_amount,
            claim_cooldown_secs: c.claim_cooldown.as_secs() as i64,
        }
    }
}

const REFERRAL_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

fn gen_referral_code(len: usize) -> String {
    let mut buf = vec![0u8; len];
    let _ = getrandom::getrandom(&mut buf);
    buf.iter()
        .map(|b| REFERRAL_CHARSET[(*b as usize) % REFERRAL_CHARSET.len()] as char)
        .collect()
}

/// Candidate username for a first-time session: the explicit signup claim,
/// else the federated display name the provider attached, else the local part
/// of the email address.
fn derive_username(session: &Session) -> String {
    if let Some(u) = &session.metadata.username {
        let u = u.trim();
        if !u.is_empty() {
            return u.to_string();
        }
    }
    session.email.split('@').next().unwrap_or(&session.email).to_string()
}

impl From<&Profile> for ApplicationUser {
    // Storage-level names map onto the stable projection names here and
    // nowhere else.
    fn from(p: &Profile) -> Self {
        ApplicationUser {
            id: p.id.clone(),
            email: p.email.clone(),
            username: p.username.clone(),
            coins: p.coins,
            referral_code: p.referral_code.clone(),
            last_claim: p.last_claim,
        }
    }
}

/// Provider error wording normalized into the three kinds the UI
/// distinguishes: unconfirmed email, bad credentials, everything else.
fn normalize_auth_error(err: AppError) -> AppError {
    let msg = err.message();
    if msg.contains("Email not confirmed") {
        AppError::auth("email_unconfirmed", "Email not confirmed. Check your inbox for the confirmation link.")
    } else if msg.contains("Invalid login credentials") {
        AppError::auth("invalid_credentials", "Invalid login credentials")
    } else {
        AppError::auth("auth_failed", msg)
    }
}

pub struct Reconciler {
    store: Arc<dyn ProfileStore>,
    provider: Arc<dyn IdentityProvider>,
    policy: CoinPolicy,
    current: RwLock<Option<ApplicationUser>>,
    /// Set on shutdown; publishing becomes a no-op so a reconciliation still
    /// in flight cannot resurrect a torn-down projection.
    closed: AtomicBool,
}

impl Reconciler {
    pub fn new(store: Arc<dyn ProfileStore>, provider: Arc<dyn IdentityProvider>, policy: CoinPolicy) -> Self {
        Self {
            store,
            provider,
            policy,
            current: RwLock::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Consume the provider change feed. The hand-off through the channel is
    /// what guarantees reconciliation runs after the provider's own
    /// notification bookkeeping has returned.
    pub async fn run(self: Arc<Self>, mut sub: AuthSubscription) {
        while let Some((_event, session)) = sub.recv().await {
            if self.closed.load(Ordering::Acquire) {
                break;
            }
            self.on_session_change(session.as_ref());
        }
        sub.unsubscribe();
    }

    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        *self.current.write() = None;
    }

    /// One reconciliation step. Publishes at most one fully populated
    /// projection; a sign-out clears it exactly once.
    pub fn on_session_change(&self, session: Option<&Session>) {
        match session {
            None => {
                self.publish(None);
                info!(target: "reconcile", "session cleared, user signed out");
            }
            Some(s) => match self.resolve_or_create_profile(s) {
                Ok(p) => {
                    info!(target: "reconcile", "session resolved subject={} username={}", s.subject, p.username);
                    self.publish(Some(ApplicationUser::from(&p)));
                }
                Err(e) => {
                    // The session stays valid; only the projection is absent.
                    warn!(target: "reconcile", "profile resolution failed subject={} err={}", s.subject, e);
                    self.publish(None);
                }
            },
        }
    }

    /// Look up the profile for a session, creating it on first sight.
    /// Idempotent: a second call for the same subject returns the stored row
    /// unchanged, with no write.
    pub fn resolve_or_create_profile(&self, session: &Session) -> AppResult<Profile> {
        if let Some(existing) = self.store.find_by_id(&session.subject)? {
            return Ok(existing);
        }

        let referred = session.metadata.referral_code.is_some();
        let coins = if referred { self.policy.referral_bonus } else { self.policy.signup_bonus };
        let mut profile = Profile {
            id: session.subject.clone(),
            email: session.email.clone(),
            username: derive_username(session),
            coins,
            referral_code: gen_referral_code(self.policy.referral_code_len),
            last_claim: None,
            email_verified: false,
            verification_token: None,
        };

        if let Err(first) = self.store.insert(profile.clone()) {
            // A duplicate id means a concurrent reconciliation already created
            // the row; the re-read below returns it.
            if first.code_str() != "duplicate_id" {
                if !first.is_conflict() {
                    return Err(AppError::profile_creation("insert_failed", first.to_string()));
                }
                // One retry with a regenerated referral code; a second failure
                // is surfaced, never silently dropped.
                profile.referral_code = gen_referral_code(self.policy.referral_code_len);
                if let Err(second) = self.store.insert(profile.clone()) {
                    if second.code_str() != "duplicate_id" {
                        return Err(AppError::profile_creation("insert_failed", second.to_string()));
                    }
                }
            }
        }

        // Re-read so store-assigned defaults are captured in the returned row.
        self.store
            .find_by_id(&session.subject)?
            .ok_or_else(|| AppError::internal("insert_lost", "profile missing immediately after insert"))
    }

    /// Resolve a username to its email when the identifier carries no `@`,
    /// then delegate credential verification to the provider. Exactly one
    /// store lookup happens before any provider call.
    pub fn login_by_identifier(&self, identifier: &str, password: &str) -> AppResult<Session> {
        let email = if !identifier.contains('@') {
            match self.store.find_by_username(identifier) {
                Ok(Some(p)) => p.email,
                Ok(None) => {
                    return Err(AppError::not_found(
                        "username_not_found",
                        "Username not found. Sign up first, or try your email address instead.",
                    ))
                }
                Err(e) => return Err(AppError::lookup("lookup_failed", e.message())),
            }
        } else {
            identifier.to_string()
        };
        self.provider
            .sign_in_with_password(&email, password)
            .map_err(normalize_auth_error)
    }

    /// Register a credential with the signup claims attached. Provider
    /// failure messages are surfaced verbatim.
    pub fn register(
        &self,
        email: &str,
        username: &str,
        password: &str,
        referral_code: Option<&str>,
    ) -> AppResult<Option<Session>> {
        if email.trim().is_empty() || username.trim().is_empty() || password.is_empty() {
            return Err(AppError::user("missing_fields", "email, username and password are required"));
        }
        let metadata = SignupMetadata {
            username: Some(username.trim().to_string()),
            referral_code: referral_code.map(|s| s.trim().to_uppercase()).filter(|s| !s.is_empty()),
        };
        self.provider.sign_up(email.trim(), password, metadata)
    }

    pub fn logout(&self, token: &str) -> AppResult<()> {
        self.provider.sign_out(token)
    }

    /// Grant the daily coins when the cooldown has elapsed. The eligibility
    /// check is advisory; the grant itself is one store update. Two
    /// near-simultaneous claims can both pass the check (read-modify-write,
    /// no optimistic guard) -- a known, accepted risk.
    pub fn claim_daily_bonus(&self, user_id: &str) -> AppResult<Profile> {
        let profile = self
            .store
            .find_by_id(user_id)?
            .ok_or_else(|| AppError::not_found("profile_not_found", "no profile for id"))?;
        let now = Utc::now();
        if let Some(last) = profile.last_claim {
            let elapsed = now.signed_duration_since(last).num_seconds();
            if elapsed < self.policy.claim_cooldown_secs {
                return Err(AppError::user(
                    "claim_not_ready",
                    "Daily coins already claimed. Come back tomorrow.",
                ));
            }
        }
        let updated = self.store.update(
            user_id,
            ProfilePatch {
                coins: Some(profile.coins + self.policy.daily_claim_amount),
                last_claim: Some(now),
                ..Default::default()
            },
        )?;
        self.refresh_if_current(&updated);
        Ok(updated)
    }

    pub fn current_user(&self) -> Option<ApplicationUser> {
        self.current.read().clone()
    }

    /// Apply a partial update to the published projection, if one is
    /// published. Consumers go through this; they never write the slot.
    pub fn update_user(&self, patch: ApplicationUserPatch) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let mut cur = self.current.write();
        if let Some(user) = cur.as_mut() {
            if let Some(coins) = patch.coins {
                user.coins = coins;
            }
            if let Some(ts) = patch.last_claim {
                user.last_claim = Some(ts);
            }
            if let Some(name) = patch.username {
                user.username = name;
            }
        }
    }

    pub fn policy(&self) -> &CoinPolicy {
        &self.policy
    }

    fn refresh_if_current(&self, profile: &Profile) {
        let is_current = self.current.read().as_ref().map(|u| u.id == profile.id).unwrap_or(false);
        if is_current {
            self.update_user(ApplicationUserPatch {
                coins: Some(profile.coins),
                last_claim: profile.last_claim,
                ..Default::default()
            });
        }
    }

    fn publish(&self, user: Option<ApplicationUser>) {
        // No-op after teardown: a late reconciliation result is discarded.
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        *self.current.write() = user;
    }
}
