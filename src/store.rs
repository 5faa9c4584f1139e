//! Consumer-provided persistence boundary.
//!
//! The engine treats persistence as a key-value/record store behind these
//! traits; the consumer chooses the backing (encrypted database, keychain,
//! plain file). [`MemoryStore`] is the bundled in-memory implementation,
//! used by tests and as a bootstrap store.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::config::IdpConfiguration;
use crate::error::StoreError;
use crate::types::{AccessToken, AuthenticationData, ProfileId};

/// Per-profile persistence of authentication state.
///
/// `save_authentication_data` replaces the prior variant atomically —
/// exactly one [`AuthenticationData`] variant is active per profile.
#[async_trait]
pub trait AuthenticationStore: Send + Sync {
    async fn load_authentication_data(
        &self,
        profile: &ProfileId,
    ) -> Result<Option<AuthenticationData>, StoreError>;

    async fn save_authentication_data(
        &self,
        profile: &ProfileId,
        data: AuthenticationData,
    ) -> Result<(), StoreError>;

    async fn load_access_token(
        &self,
        profile: &ProfileId,
    ) -> Result<Option<AccessToken>, StoreError>;

    async fn save_access_token(
        &self,
        profile: &ProfileId,
        token: AccessToken,
    ) -> Result<(), StoreError>;

    /// Remove all authentication state for the profile (logout, tampering,
    /// profile deletion).
    async fn invalidate(&self, profile: &ProfileId) -> Result<(), StoreError>;
}

/// Process-wide persistence of the provider configuration.
///
/// Single writer (the configuration store); clearing forces the next
/// `configuration()` call to re-fetch.
#[async_trait]
pub trait ConfigurationStore: Send + Sync {
    async fn load_configuration(&self) -> Result<Option<IdpConfiguration>, StoreError>;
    async fn save_configuration(&self, config: IdpConfiguration) -> Result<(), StoreError>;
    async fn clear_configuration(&self) -> Result<(), StoreError>;
}

/// In-memory store implementing both persistence traits.
#[derive(Default)]
pub struct MemoryStore {
    auth: RwLock<HashMap<ProfileId, AuthenticationData>>,
    tokens: RwLock<HashMap<ProfileId, AccessToken>>,
    config: RwLock<Option<IdpConfiguration>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuthenticationStore for MemoryStore {
    async fn load_authentication_data(
        &self,
        profile: &ProfileId,
    ) -> Result<Option<AuthenticationData>, StoreError> {
        Ok(self.auth.read().await.get(profile).cloned())
    }

    async fn save_authentication_data(
        &self,
        profile: &ProfileId,
        data: AuthenticationData,
    ) -> Result<(), StoreError> {
        self.auth.write().await.insert(profile.clone(), data);
        Ok(())
    }

    async fn load_access_token(
        &self,
        profile: &ProfileId,
    ) -> Result<Option<AccessToken>, StoreError> {
        Ok(self.tokens.read().await.get(profile).cloned())
    }

    async fn save_access_token(
        &self,
        profile: &ProfileId,
        token: AccessToken,
    ) -> Result<(), StoreError> {
        self.tokens.write().await.insert(profile.clone(), token);
        Ok(())
    }

    async fn invalidate(&self, profile: &ProfileId) -> Result<(), StoreError> {
        self.auth.write().await.remove(profile);
        self.tokens.write().await.remove(profile);
        Ok(())
    }
}

#[async_trait]
impl ConfigurationStore for MemoryStore {
    async fn load_configuration(&self) -> Result<Option<IdpConfiguration>, StoreError> {
        Ok(self.config.read().await.clone())
    }

    async fn save_configuration(&self, config: IdpConfiguration) -> Result<(), StoreError> {
        *self.config.write().await = Some(config);
        Ok(())
    }

    async fn clear_configuration(&self) -> Result<(), StoreError> {
        *self.config.write().await = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SingleSignOnToken;
    use time::OffsetDateTime;

    fn sample_data() -> AuthenticationData {
        AuthenticationData::ExternalToken {
            sso_token: SingleSignOnToken::new("a.b.c"),
            authenticator_id: "kk-1".into(),
            authenticator_name: "Test KK".into(),
        }
    }

    #[tokio::test]
    async fn save_replaces_prior_variant() {
        let store = MemoryStore::new();
        let profile = ProfileId::from("p1".to_string());

        store
            .save_authentication_data(&profile, sample_data())
            .await
            .unwrap();
        let replacement = AuthenticationData::AlternateWithoutToken {
            key_alias: crate::types::KeyAlias::from("alias".to_string()),
            certificate: vec![1],
        };
        store
            .save_authentication_data(&profile, replacement.clone())
            .await
            .unwrap();

        let loaded = store.load_authentication_data(&profile).await.unwrap();
        assert_eq!(loaded, Some(replacement));
    }

    #[tokio::test]
    async fn invalidate_clears_data_and_token() {
        let store = MemoryStore::new();
        let profile = ProfileId::from("p1".to_string());
        let other = ProfileId::from("p2".to_string());

        store
            .save_authentication_data(&profile, sample_data())
            .await
            .unwrap();
        store
            .save_access_token(
                &profile,
                AccessToken {
                    token: "bearer".into(),
                    expires_at: OffsetDateTime::now_utc() + time::Duration::minutes(5),
                },
            )
            .await
            .unwrap();
        store
            .save_authentication_data(&other, sample_data())
            .await
            .unwrap();

        store.invalidate(&profile).await.unwrap();

        assert!(store
            .load_authentication_data(&profile)
            .await
            .unwrap()
            .is_none());
        assert!(store.load_access_token(&profile).await.unwrap().is_none());
        // other profiles are untouched
        assert!(store
            .load_authentication_data(&other)
            .await
            .unwrap()
            .is_some());
    }
}
