//! Identity provider adapter: the fixed interface the reconciler is built
//! against, plus a local implementation backing the self-hosted service.
//!
//! The change feed is an explicit subscription: `subscribe()` hands back a
//! receiver plus an unsubscribe handle, and the provider pushes
//! `(event, session)` pairs after its own bookkeeping for the triggering call
//! has finished. Consumers therefore never observe a half-updated provider.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use parking_lot::RwLock;
use password_hash::{PasswordHash, SaltString};
use tokio::sync::mpsc;
use tracing::info;

use crate::error::{AppError, AppResult};

use super::session::{Session, SessionManager, SignupMetadata};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthEvent {
    SignedIn,
    SignedOut,
    TokenRefreshed,
}

/// One change-feed notification: the event plus the session it concerns
/// (`None` for sign-out).
pub type AuthChange = (AuthEvent, Option<Session>);

type SubscriberMap = RwLock<HashMap<u64, mpsc::UnboundedSender<AuthChange>>>;

#[derive(Default)]
struct Subscribers {
    next_id: AtomicU64,
    senders: SubscriberMap,
}

impl Subscribers {
    fn notify(&self, change: AuthChange) {
        let senders = self.senders.read();
        for tx in senders.values() {
            // A receiver torn down mid-flight just drops the notification.
            let _ = tx.send(change.clone());
        }
    }
}

/// Handle for one change-feed subscription. Dropping it (or calling
/// `unsubscribe`) detaches the receiver from the provider.
pub struct AuthSubscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<AuthChange>,
    subscribers: Arc<Subscribers>,
}

impl AuthSubscription {
    pub async fn recv(&mut self) -> Option<AuthChange> {
        self.rx.recv().await
    }

    pub fn unsubscribe(self) {
        // Drop runs the removal.
    }
}

impl Drop for AuthSubscription {
    fn drop(&mut self) {
        self.subscribers.senders.write().remove(&self.id);
    }
}

/// The identity provider contract (credential storage, session issuance and
/// the change feed). Everything behind it is an external collaborator as far
/// as the reconciler is concerned.
pub trait IdentityProvider: Send + Sync {
    /// Verify a credential and issue a session. Failure messages are
    /// provider-specific; the reconciler normalizes them.
    fn sign_in_with_password(&self, email: &str, password: &str) -> AppResult<Session>;

    /// Register a credential. Returns a session when the account is usable
    /// immediately, `None` when email confirmation is still pending.
    fn sign_up(&self, email: &str, password: &str, metadata: SignupMetadata) -> AppResult<Option<Session>>;

    fn sign_out(&self, token: &str) -> AppResult<()>;

    fn get_session(&self, token: &str) -> Option<Session>;

    fn subscribe(&self) -> AuthSubscription;
}

struct CredentialRecord {
    subject: String,
    password_phc: String,
    confirmed: bool,
    metadata: SignupMetadata,
}

/// Self-hosted identity provider: argon2 PHC credential table, a confirmation
/// gate matching the managed service's behavior, and session issuance through
/// a [`SessionManager`].
pub struct LocalIdentityProvider {
    sm: SessionManager,
    users: RwLock<HashMap<String, CredentialRecord>>,
    subscribers: Arc<Subscribers>,
    /// When set, a fresh signup cannot sign in until its email is confirmed.
    require_confirmation: bool,
}

fn hash_password(password: &str) -> AppResult<String> {
    let mut salt_bytes = [0u8; 16];
    getrandom::getrandom(&mut salt_bytes)
        .map_err(|e| AppError::internal("entropy_unavailable", e.to_string()))?;
    let salt = SaltString::encode_b64(&salt_bytes)
        .map_err(|e| AppError::internal("salt_encode_failed", e.to_string()))?;
    let argon2 = Argon2::default();
    let phc = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| AppError::internal("hash_failed", e.to_string()))?
        .to_string();
    Ok(phc)
}

fn verify_password(hash: &str, password: &str) -> bool {
    if let Ok(parsed) = PasswordHash::new(hash) {
        let argon2 = Argon2::default();
        argon2.verify_password(password.as_bytes(), &parsed).is_ok()
    } else {
        false
    }
}

impl LocalIdentityProvider {
    pub fn new(require_confirmation: bool) -> Self {
        Self {
            sm: SessionManager::default(),
            users: RwLock::new(HashMap::new()),
            subscribers: Arc::new(Subscribers::default()),
            require_confirmation,
        }
    }

    /// Mark an email confirmed. Invoked by the verification endpoint; not
    /// part of the provider contract the reconciler sees.
    pub fn confirm_email(&self, email: &str) -> bool {
        let mut users = self.users.write();
        match users.get_mut(email) {
            Some(rec) => {
                rec.confirmed = true;
                true
            }
            None => false,
        }
    }

    /// Subject id registered for an email, if any. Used by the server to
    /// correlate verification links.
    pub fn subject_for_email(&self, email: &str) -> Option<String> {
        self.users.read().get(email).map(|r| r.subject.clone())
    }
}

impl IdentityProvider for LocalIdentityProvider {
    fn sign_in_with_password(&self, email: &str, password: &str) -> AppResult<Session> {
        let (subject, metadata) = {
            let users = self.users.read();
            let Some(rec) = users.get(email) else {
                return Err(AppError::auth("provider_error", "Invalid login credentials"));
            };
            if !verify_password(&rec.password_phc, password) {
                return Err(AppError::auth("provider_error", "Invalid login credentials"));
            }
            if !rec.confirmed {
                return Err(AppError::auth("provider_error", "Email not confirmed"));
            }
            (rec.subject.clone(), rec.metadata.clone())
        };
        let session = self.sm.issue(&subject, email, metadata);
        info!(target: "auth", "auth.sign_in subject={}", subject);
        self.subscribers.notify((AuthEvent::SignedIn, Some(session.clone())));
        Ok(session)
    }

    fn sign_up(&self, email: &str, password: &str, metadata: SignupMetadata) -> AppResult<Option<Session>> {
        {
            let mut users = self.users.write();
            if users.contains_key(email) {
                return Err(AppError::auth("provider_error", "User already registered"));
            }
            let rec = CredentialRecord {
                subject: uuid::Uuid::new_v4().to_string(),
                password_phc: hash_password(password)?,
                confirmed: !self.require_confirmation,
                metadata: metadata.clone(),
            };
            users.insert(email.to_string(), rec);
        }
        info!(target: "auth", "auth.sign_up email={}", email);
        if self.require_confirmation {
            return Ok(None);
        }
        // No confirmation gate: the signup is immediately a signed-in session.
        let subject = self
            .subject_for_email(email)
            .ok_or_else(|| AppError::internal("signup_lost", "credential vanished after insert"))?;
        let session = self.sm.issue(&subject, email, metadata);
        self.subscribers.notify((AuthEvent::SignedIn, Some(session.clone())));
        Ok(Some(session))
    }

    fn sign_out(&self, token: &str) -> AppResult<()> {
        // A token that never existed (or is already revoked) removed nothing,
        // so there is no session change to announce.
        if self.sm.sign_out(token) {
            self.subscribers.notify((AuthEvent::SignedOut, None));
        }
        Ok(())
    }

    fn get_session(&self, token: &str) -> Option<Session> {
        self.sm.validate(token)
    }

    fn subscribe(&self) -> AuthSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribers.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.senders.write().insert(id, tx);
        AuthSubscription { id, rx, subscribers: self.subscribers.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_up_then_sign_in() {
        let p = LocalIdentityProvider::new(false);
        let s = p
            .sign_up("a@x.com", "hunter2", SignupMetadata::default())
            .unwrap()
            .expect("unconfirmed flow disabled, session expected");
        assert_eq!(s.email, "a@x.com");
        let s2 = p.sign_in_with_password("a@x.com", "hunter2").unwrap();
        assert_eq!(s2.subject, s.subject);
    }

    #[test]
    fn wrong_password_yields_provider_wording() {
        let p = LocalIdentityProvider::new(false);
        p.sign_up("a@x.com", "hunter2", SignupMetadata::default()).unwrap();
        let err = p.sign_in_with_password("a@x.com", "nope").unwrap_err();
        assert_eq!(err.message(), "Invalid login credentials");
    }

    #[test]
    fn unconfirmed_email_is_gated() {
        let p = LocalIdentityProvider::new(true);
        assert!(p.sign_up("a@x.com", "hunter2", SignupMetadata::default()).unwrap().is_none());
        let err = p.sign_in_with_password("a@x.com", "hunter2").unwrap_err();
        assert_eq!(err.message(), "Email not confirmed");
        assert!(p.confirm_email("a@x.com"));
        assert!(p.sign_in_with_password("a@x.com", "hunter2").is_ok());
    }

    #[test]
    fn duplicate_sign_up_is_rejected() {
        let p = LocalIdentityProvider::new(false);
        p.sign_up("a@x.com", "hunter2", SignupMetadata::default()).unwrap();
        let err = p.sign_up("a@x.com", "other", SignupMetadata::default()).unwrap_err();
        assert_eq!(err.message(), "User already registered");
    }

    #[tokio::test]
    async fn change_feed_delivers_in_emission_order() {
        let p = LocalIdentityProvider::new(false);
        let mut sub = p.subscribe();
        let s = p
            .sign_up("a@x.com", "hunter2", SignupMetadata::default())
            .unwrap()
            .unwrap();
        p.sign_out(&s.token).unwrap();
        let (ev1, sess1) = sub.recv().await.unwrap();
        assert_eq!(ev1, AuthEvent::SignedIn);
        assert_eq!(sess1.unwrap().subject, s.subject);
        let (ev2, sess2) = sub.recv().await.unwrap();
        assert_eq!(ev2, AuthEvent::SignedOut);
        assert!(sess2.is_none());
    }

    #[tokio::test]
    async fn bogus_logout_emits_no_notification() {
        let p = LocalIdentityProvider::new(false);
        let mut sub = p.subscribe();
        p.sign_out("no-such-token").unwrap();
        // The next delivery must be the sign-in below, not a spurious
        // sign-out for a token that was never issued.
        let s = p
            .sign_up("a@x.com", "hunter2", SignupMetadata::default())
            .unwrap()
            .unwrap();
        let (ev, sess) = sub.recv().await.unwrap();
        assert_eq!(ev, AuthEvent::SignedIn);
        assert_eq!(sess.unwrap().subject, s.subject);
    }

    #[tokio::test]
    async fn dropped_subscription_is_detached() {
        let p = LocalIdentityProvider::new(false);
        let sub = p.subscribe();
        drop(sub);
        // Must not panic or block with no live receivers.
        p.sign_up("a@x.com", "hunter2", SignupMetadata::default()).unwrap();
    }
}
