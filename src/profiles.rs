//! Profile rows and the profile store adapters.
//!
//! The row shape is the application's persisted user record: identity subject
//! id, email, unique username, coin balance, shareable referral code, last
//! daily-claim timestamp and the email-verification fields. Uniqueness of
//! `username` and `referral_code` is enforced here, in the store; callers see
//! violations as `Conflict` and may retry or explain, never as a defect.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub email: String,
    pub username: String,
    pub coins: i64,
    pub referral_code: String,
    #[serde(default)]
    pub last_claim: Option<DateTime<Utc>>,
    #[serde(default)]
    pub email_verified: bool,
    #[serde(default)]
    pub verification_token: Option<String>,
}

/// Partial update applied by id. `None` fields are left untouched; the
/// double-`Option` on `verification_token` distinguishes "leave" from "clear".
#[derive(Debug, Clone, Default)]
pub struct ProfilePatch {
    pub coins: Option<i64>,
    pub last_claim: Option<DateTime<Utc>>,
    pub email_verified: Option<bool>,
    pub verification_token: Option<Option<String>>,
}

impl ProfilePatch {
    fn apply(&self, p: &mut Profile) -> AppResult<()> {
        if let Some(coins) = self.coins {
            if coins < 0 {
                return Err(AppError::user("negative_balance", "coin balance cannot go negative"));
            }
            p.coins = coins;
        }
        if let Some(ts) = self.last_claim {
            p.last_claim = Some(ts);
        }
        if let Some(v) = self.email_verified {
            p.email_verified = v;
        }
        if let Some(tok) = &self.verification_token {
            p.verification_token = tok.clone();
        }
        Ok(())
    }
}

/// Storage adapter for profiles. Lookups are exact-match on a single column;
/// mutations are insert and partial-update-by-id. Nothing here promises
/// multi-row or multi-step atomicity.
pub trait ProfileStore: Send + Sync {
    fn find_by_id(&self, id: &str) -> AppResult<Option<Profile>>;
    fn find_by_username(&self, username: &str) -> AppResult<Option<Profile>>;
    fn find_by_email(&self, email: &str) -> AppResult<Option<Profile>>;
    fn insert(&self, profile: Profile) -> AppResult<()>;
    fn update(&self, id: &str, patch: ProfilePatch) -> AppResult<Profile>;
    fn list(&self) -> AppResult<Vec<Profile>>;
}

fn check_unique(rows: &[Profile], candidate: &Profile) -> AppResult<()> {
    for p in rows {
        if p.id == candidate.id {
            return Err(AppError::conflict("duplicate_id", "profile already exists for this identity"));
        }
        if p.username == candidate.username {
            return Err(AppError::conflict("duplicate_username", "username already taken"));
        }
        if p.referral_code == candidate.referral_code {
            return Err(AppError::conflict("duplicate_referral_code", "referral code already taken"));
        }
    }
    Ok(())
}

/// In-memory store used by tests and as the reference semantics for the
/// file-backed store below.
#[derive(Default)]
pub struct MemoryProfileStore {
    rows: RwLock<HashMap<String, Profile>>,
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProfileStore for MemoryProfileStore {
    fn find_by_id(&self, id: &str) -> AppResult<Option<Profile>> {
        Ok(self.rows.read().get(id).cloned())
    }

    fn find_by_username(&self, username: &str) -> AppResult<Option<Profile>> {
        Ok(self.rows.read().values().find(|p| p.username == username).cloned())
    }

    fn find_by_email(&self, email: &str) -> AppResult<Option<Profile>> {
        Ok(self.rows.read().values().find(|p| p.email == email).cloned())
    }

    fn insert(&self, profile: Profile) -> AppResult<()> {
        let mut rows = self.rows.write();
        let existing: Vec<Profile> = rows.values().cloned().collect();
        check_unique(&existing, &profile)?;
        rows.insert(profile.id.clone(), profile);
        Ok(())
    }

    fn update(&self, id: &str, patch: ProfilePatch) -> AppResult<Profile> {
        let mut rows = self.rows.write();
        let p = rows
            .get_mut(id)
            .ok_or_else(|| AppError::not_found("profile_not_found", "no profile for id"))?;
        patch.apply(p)?;
        Ok(p.clone())
    }

    fn list(&self) -> AppResult<Vec<Profile>> {
        let mut out: Vec<Profile> = self.rows.read().values().cloned().collect();
        out.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(out)
    }
}

/// File-backed store: one JSON document holding all rows under the data root,
/// rewritten whole on every mutation. Mutations are serialised by the lock, so
/// within one process a partial update is a single atomic store operation.
pub struct JsonProfileStore {
    path: PathBuf,
    lock: RwLock<()>,
}

impl JsonProfileStore {
    pub fn new(data_dir: &str) -> AppResult<Self> {
        let path = Path::new(data_dir).join("profiles.json");
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        Ok(Self { path, lock: RwLock::new(()) })
    }

    fn read_rows(&self) -> AppResult<Vec<Profile>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let bytes = std::fs::read(&self.path)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| AppError::io("store_corrupt", format!("profiles file unreadable: {}", e)))
    }

    fn write_rows(&self, rows: &[Profile]) -> AppResult<()> {
        let tmp = self.path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(rows)
            .map_err(|e| AppError::internal("serialize_failed", e.to_string()))?;
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl ProfileStore for JsonProfileStore {
    fn find_by_id(&self, id: &str) -> AppResult<Option<Profile>> {
        let _g = self.lock.read();
        Ok(self.read_rows()?.into_iter().find(|p| p.id == id))
    }

    fn find_by_username(&self, username: &str) -> AppResult<Option<Profile>> {
        let _g = self.lock.read();
        Ok(self.read_rows()?.into_iter().find(|p| p.username == username))
    }

    fn find_by_email(&self, email: &str) -> AppResult<Option<Profile>> {
        let _g = self.lock.read();
        Ok(self.read_rows()?.into_iter().find(|p| p.email == email))
    }

    fn insert(&self, profile: Profile) -> AppResult<()> {
        let _g = self.lock.write();
        let mut rows = self.read_rows()?;
        check_unique(&rows, &profile)?;
        rows.push(profile);
        self.write_rows(&rows)
    }

    fn update(&self, id: &str, patch: ProfilePatch) -> AppResult<Profile> {
        let _g = self.lock.write();
        let mut rows = self.read_rows()?;
        let p = rows
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| AppError::not_found("profile_not_found", "no profile for id"))?;
        patch.apply(p)?;
        let out = p.clone();
        self.write_rows(&rows)?;
        Ok(out)
    }

    fn list(&self) -> AppResult<Vec<Profile>> {
        let _g = self.lock.read();
        let mut rows = self.read_rows()?;
        rows.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(id: &str, username: &str, code: &str) -> Profile {
        Profile {
            id: id.into(),
            email: format!("{}@x.com", username),
            username: username.into(),
            coins: 10,
            referral_code: code.into(),
            last_claim: None,
            email_verified: false,
            verification_token: None,
        }
    }

    #[test]
    fn memory_store_enforces_username_uniqueness() {
        let store = MemoryProfileStore::new();
        store.insert(profile("u1", "alice", "AAAAAA")).unwrap();
        let err = store.insert(profile("u2", "alice", "BBBBBB")).unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(err.code_str(), "duplicate_username");
    }

    #[test]
    fn memory_store_enforces_referral_code_uniqueness() {
        let store = MemoryProfileStore::new();
        store.insert(profile("u1", "alice", "AAAAAA")).unwrap();
        let err = store.insert(profile("u2", "bob", "AAAAAA")).unwrap_err();
        assert_eq!(err.code_str(), "duplicate_referral_code");
    }

    #[test]
    fn patch_rejects_negative_balance() {
        let store = MemoryProfileStore::new();
        store.insert(profile("u1", "alice", "AAAAAA")).unwrap();
        let err = store
            .update("u1", ProfilePatch { coins: Some(-5), ..Default::default() })
            .unwrap_err();
        assert_eq!(err.code_str(), "negative_balance");
    }

    #[test]
    fn json_store_round_trips_rows() {
        let tmp = tempfile::tempdir().unwrap();
        let store = JsonProfileStore::new(tmp.path().to_str().unwrap()).unwrap();
        store.insert(profile("u1", "alice", "AAAAAA")).unwrap();
        store
            .update("u1", ProfilePatch { coins: Some(42), ..Default::default() })
            .unwrap();
        let got = store.find_by_username("alice").unwrap().unwrap();
        assert_eq!(got.id, "u1");
        assert_eq!(got.coins, 42);
        // A second store instance over the same directory sees the same rows.
        let reopened = JsonProfileStore::new(tmp.path().to_str().unwrap()).unwrap();
        assert_eq!(reopened.list().unwrap().len(), 1);
    }
}
