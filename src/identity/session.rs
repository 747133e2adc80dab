use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use base64::Engine;
use parking_lot::RwLock;

use crate::tprintln;

pub type SessionToken = String;

/// Free-form claims attached at registration time. A federated login carries
/// the provider-suggested display name in `username`; a referred signup
/// carries the code the registrant presented in `referral_code`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignupMetadata {
    pub username: Option<String>,
    pub referral_code: Option<String>,
}

/// An authenticated identity-provider artifact. Owned by the provider; the
/// reconciler only ever reads it.
#[derive(Debug, Clone)]
pub struct Session {
    /// Identity subject id, the 1:1 key for the application profile.
    pub subject: String,
    pub email: String,
    pub metadata: SignupMetadata,
    pub token: SessionToken,
    pub issued_at: Instant,
    pub expires_at: Instant,
}

#[derive(Debug)]
struct SessionEntry {
    session: Session,
}

fn gen_token() -> String {
    // 256-bit random token, base64url without padding
    let mut buf = [0u8; 32];
    let _ = getrandom::getrandom(&mut buf);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf)
}

/// Token table for the local identity provider. Constructed once and handed
/// to whoever needs it; holds no ambient global state.
pub struct SessionManager {
    pub ttl: Duration,
    sessions: RwLock<HashMap<SessionToken, SessionEntry>>,
    subject_index: RwLock<HashMap<String, HashSet<SessionToken>>>,
    revoked: RwLock<HashSet<SessionToken>>,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::with_ttl(Duration::from_secs(60 * 60 * 24))
    }
}

impl SessionManager {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            sessions: RwLock::new(HashMap::new()),
            subject_index: RwLock::new(HashMap::new()),
            revoked: RwLock::new(HashSet::new()),
        }
    }

    pub fn issue(&self, subject: &str, email: &str, metadata: SignupMetadata) -> Session {
        let now = Instant::now();
        let token = gen_token();
        let sess = Session {
            subject: subject.to_string(),
            email: email.to_string(),
            metadata,
            token: token.clone(),
            issued_at: now,
            expires_at: now + self.ttl,
        };
        {
            let mut m = self.sessions.write();
            m.insert(token.clone(), SessionEntry { session: sess.clone() });
        }
        {
            let mut idx = self.subject_index.write();
            let set = idx.entry(subject.to_string()).or_insert_with(HashSet::new);
            set.insert(token);
        }
        tprintln!("session.issue subject={} ttl_secs={}", subject, self.ttl.as_secs());
        sess
    }

    pub fn validate(&self, token: &str) -> Option<Session> {
        if self.revoked.read().contains(token) {
            return None;
        }
        let now = Instant::now();
        let mut drop_key: Option<String> = None;
        let out = {
            let map = self.sessions.read();
            if let Some(ent) = map.get(token) {
                if ent.session.expires_at > now {
                    Some(ent.session.clone())
                } else {
                    drop_key = Some(token.to_string());
                    None
                }
            } else {
                None
            }
        };
        if let Some(k) = drop_key {
            self.sessions.write().remove(&k);
        }
        out
    }

    pub fn sign_out(&self, token: &str) -> bool {
        let mut removed = false;
        if let Some(ent) = self.sessions.write().remove(token) {
            removed = true;
            let subject = ent.session.subject;
            let mut idx = self.subject_index.write();
            if let Some(set) = idx.get_mut(&subject) {
                set.remove(token);
            }
            self.revoked.write().insert(token.to_string());
        }
        removed
    }

    /// Revoke every token issued for a subject. Used by the admin path when
    /// an account is removed upstream.
    pub fn revoke_subject(&self, subject: &str) -> usize {
        let mut count = 0usize;
        if let Some(tokens) = self.subject_index.read().get(subject).cloned() {
            let mut s = self.sessions.write();
            let mut r = self.revoked.write();
            for t in tokens.iter() {
                if s.remove(t).is_some() {
                    count += 1;
                }
                r.insert(t.clone());
            }
        }
        tprintln!("session.revoke subject={} count={}", subject, count);
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_then_validate_round_trip() {
        let sm = SessionManager::default();
        let s = sm.issue("u1", "a@x.com", SignupMetadata::default());
        let got = sm.validate(&s.token).expect("session should validate");
        assert_eq!(got.subject, "u1");
        assert_eq!(got.email, "a@x.com");
    }

    #[test]
    fn sign_out_revokes_token() {
        let sm = SessionManager::default();
        let s = sm.issue("u1", "a@x.com", SignupMetadata::default());
        assert!(sm.sign_out(&s.token));
        assert!(sm.validate(&s.token).is_none());
        // idempotent
        assert!(!sm.sign_out(&s.token));
    }

    #[test]
    fn expired_sessions_do_not_validate() {
        let sm = SessionManager::with_ttl(Duration::from_secs(0));
        let s = sm.issue("u1", "a@x.com", SignupMetadata::default());
        assert!(sm.validate(&s.token).is_none());
    }

    #[test]
    fn revoke_subject_drops_all_tokens() {
        let sm = SessionManager::default();
        let s1 = sm.issue("u1", "a@x.com", SignupMetadata::default());
        let s2 = sm.issue("u1", "a@x.com", SignupMetadata::default());
        assert_eq!(sm.revoke_subject("u1"), 2);
        assert!(sm.validate(&s1.token).is_none());
        assert!(sm.validate(&s2.token).is_none());
    }
}
