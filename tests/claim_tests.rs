//! Daily-claim eligibility and effect tests, including the 24h boundary.

use std::sync::Arc;

use chrono::{Duration, Utc};
use hacklink::identity::{CoinPolicy, LocalIdentityProvider, Reconciler};
use hacklink::profiles::{MemoryProfileStore, Profile, ProfileStore};

fn seeded(last_claim: Option<chrono::DateTime<Utc>>) -> (Reconciler, Arc<MemoryProfileStore>) {
    let store = Arc::new(MemoryProfileStore::new());
    store
        .insert(Profile {
            id: "u1".into(),
            email: "a@x.com".into(),
            username: "alice".into(),
            coins: 30,
            referral_code: "AAAAAA".into(),
            last_claim,
            email_verified: true,
            verification_token: None,
        })
        .unwrap();
    let provider = Arc::new(LocalIdentityProvider::new(false));
    let r = Reconciler::new(store.clone(), provider, CoinPolicy::default());
    (r, store)
}

#[test]
fn unset_last_claim_is_eligible() {
    let (r, store) = seeded(None);
    let updated = r.claim_daily_bonus("u1").unwrap();
    assert_eq!(updated.coins, 40);
    assert!(updated.last_claim.is_some());
    assert_eq!(store.find_by_id("u1").unwrap().unwrap().coins, 40);
}

#[test]
fn claim_at_23h59m_is_refused_without_a_store_write() {
    let (r, store) = seeded(Some(Utc::now() - Duration::seconds(86_340)));
    let before = store.find_by_id("u1").unwrap().unwrap();
    let err = r.claim_daily_bonus("u1").unwrap_err();
    assert_eq!(err.code_str(), "claim_not_ready");
    let after = store.find_by_id("u1").unwrap().unwrap();
    assert_eq!(after.coins, before.coins);
    assert_eq!(after.last_claim, before.last_claim);
}

#[test]
fn claim_at_exactly_24h_is_accepted() {
    let (r, _store) = seeded(Some(Utc::now() - Duration::seconds(86_400)));
    let updated = r.claim_daily_bonus("u1").unwrap();
    assert_eq!(updated.coins, 40);
}

#[test]
fn claim_for_unknown_profile_is_not_found() {
    let (r, _store) = seeded(None);
    let err = r.claim_daily_bonus("nope").unwrap_err();
    assert_eq!(err.code_str(), "profile_not_found");
}

#[test]
fn back_to_back_claims_hit_the_cooldown() {
    let (r, _store) = seeded(None);
    r.claim_daily_bonus("u1").unwrap();
    let err = r.claim_daily_bonus("u1").unwrap_err();
    assert_eq!(err.code_str(), "claim_not_ready");
}
