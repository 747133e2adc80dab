//! Identity, sessions and the session reconciler.
//! Keep the public surface thin and split implementation across sub-modules.

mod provider;
mod reconciler;
mod session;

pub use provider::{AuthChange, AuthEvent, AuthSubscription, IdentityProvider, LocalIdentityProvider};
pub use reconciler::{ApplicationUser, ApplicationUserPatch, CoinPolicy, Reconciler};
pub use session::{Session, SessionManager, SessionToken, SignupMetadata};
