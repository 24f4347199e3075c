//! Identity provider: who is signed in, and their profile.
//!
//! The sync core never reaches for a global session. Whatever owns sign-in
//! hands an [`IdentityProvider`] to the synchronizer.

use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::watch;
use tracing::{debug, info};

use slope_store::{DataStore, StoreError, StoreExt};
use slope_types::models::{Principal, Profile};

pub trait IdentityProvider: Send + Sync {
    fn current_principal(&self) -> Option<Principal>;

    fn current_profile(&self) -> Option<Profile>;

    /// Fires whenever the principal changes, including sign-out.
    fn on_principal_change(&self) -> watch::Receiver<Option<Principal>>;
}

/// In-memory session. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    principal: watch::Sender<Option<Principal>>,
    profile: RwLock<Option<Profile>>,
}

impl Session {
    pub fn new() -> Self {
        let (principal, _) = watch::channel(None);
        Self {
            inner: Arc::new(SessionInner {
                principal,
                profile: RwLock::new(None),
            }),
        }
    }

    pub fn signed_in(principal: Principal) -> Self {
        let session = Self::new();
        session.sign_in(principal);
        session
    }

    pub fn sign_in(&self, principal: Principal) {
        let previous = self.inner.principal.send_replace(Some(principal.clone()));
        if previous.as_ref().map(|p| p.id) != Some(principal.id) {
            self.set_profile(None);
        }
        info!("Signed in as {}", principal.id);
    }

    pub fn sign_out(&self) {
        if self.inner.principal.send_replace(None).is_some() {
            info!("Signed out");
        }
        self.set_profile(None);
    }

    pub fn set_profile(&self, profile: Option<Profile>) {
        *self.inner.profile.write().unwrap_or_else(PoisonError::into_inner) = profile;
    }

    /// Fetch the signed-in principal's profile and cache it. A principal
    /// without a profile row yet is not an error.
    pub async fn load_profile<S: DataStore>(&self, store: &S) -> Result<Option<Profile>, StoreError> {
        let Some(principal) = self.current_principal() else {
            return Ok(None);
        };

        let profile = match store.fetch_as::<Profile>(principal.id).await {
            Ok(profile) => Some(profile),
            Err(e) if e.is_not_found() => {
                debug!("No profile yet for {}", principal.id);
                None
            }
            Err(e) => return Err(e),
        };

        // The principal may have changed while the fetch was in flight
        if self.current_principal().map(|p| p.id) == Some(principal.id) {
            self.set_profile(profile.clone());
        }
        Ok(profile)
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityProvider for Session {
    fn current_principal(&self) -> Option<Principal> {
        self.inner.principal.borrow().clone()
    }

    fn current_profile(&self) -> Option<Profile> {
        self.inner.profile.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn on_principal_change(&self) -> watch::Receiver<Option<Principal>> {
        self.inner.principal.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn principal() -> Principal {
        Principal {
            id: Uuid::new_v4(),
            email: Some("rider@slope.test".into()),
        }
    }

    #[tokio::test]
    async fn sign_in_and_out_notify_watchers() {
        let session = Session::new();
        let mut changes = session.on_principal_change();
        assert!(session.current_principal().is_none());

        let rider = principal();
        session.sign_in(rider.clone());
        changes.changed().await.unwrap();
        assert_eq!(changes.borrow().as_ref().map(|p| p.id), Some(rider.id));

        session.sign_out();
        changes.changed().await.unwrap();
        assert!(changes.borrow().is_none());
        assert!(session.current_principal().is_none());
    }

    #[test]
    fn switching_principal_clears_profile() {
        let first = principal();
        let session = Session::signed_in(first.clone());
        session.set_profile(Some(Profile {
            id: first.id,
            username: "first".into(),
            full_name: None,
            avatar_url: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }));
        assert!(session.current_profile().is_some());

        session.sign_in(first.clone());
        assert!(session.current_profile().is_some());

        session.sign_in(principal());
        assert!(session.current_profile().is_none());
    }
}
