//! End-to-end session orchestration.
//!
//! One [`IdpSession`] serves all profiles. Authentication attempts for a
//! single profile are strictly serialized by a per-profile lock; attempts
//! for different profiles share nothing but the configuration cache and
//! proceed in parallel. Tokens are written only after every protocol step
//! succeeded, so a cancelled or failed attempt never leaves partial
//! authentication state behind.

use std::collections::HashMap;
use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::crypto::{ChallengeSigner, SecureElementSigner};
use crate::error::IdpError;
use crate::pairing::PairingProtocol;
use crate::protocol::{IdpProtocol, ProtocolOutcome};
use crate::store::{AuthenticationStore, ConfigurationStore};
use crate::types::{
    AccessToken, AuthenticationData, AuthenticationScope, CardAccessNumber, DeviceInformation,
    KeyAlias, PairingEntry, ProfileId,
};

/// The root use case: login with a health card or a paired device,
/// paired-device management, and session invalidation.
pub struct IdpSession<S, C> {
    protocol: IdpProtocol<C>,
    pairing: PairingProtocol<C>,
    store: Arc<S>,
    locks: Mutex<HashMap<ProfileId, Arc<Mutex<()>>>>,
}

impl<S, C> IdpSession<S, C>
where
    S: AuthenticationStore,
    C: ConfigurationStore,
{
    #[must_use]
    pub fn new(protocol: IdpProtocol<C>, device: DeviceInformation, store: Arc<S>) -> Self {
        Self {
            pairing: PairingProtocol::new(protocol.clone(), device),
            protocol,
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Authenticate with the physical health card.
    ///
    /// At most one attempt runs per profile; a concurrent second call
    /// waits, then observes the session the first one established and
    /// returns it without another challenge round-trip.
    #[instrument(skip(self, card_access_number, signer), fields(profile = %profile))]
    pub async fn authenticate_with_health_card(
        &self,
        profile: &ProfileId,
        card_access_number: CardAccessNumber,
        signer: &dyn ChallengeSigner,
        scope: AuthenticationScope,
    ) -> Result<AccessToken, IdpError> {
        let lock = self.profile_lock(profile).await;
        // Guard drops on every exit path, including cancellation.
        let _guard = lock.lock().await;

        if scope == AuthenticationScope::Default {
            if let Some(token) = self.valid_session_token(profile).await? {
                debug!("session already established, skipping exchange");
                return Ok(token);
            }
        }

        let outcome = self
            .protocol
            .authenticate(scope, Some(&card_access_number), signer)
            .await;
        let outcome = self.flag_key_mismatch(outcome).await?;

        let data = AuthenticationData::DefaultToken {
            sso_token: outcome.sso_token.clone(),
            card_access_number,
            certificate: signer.certificate().to_vec(),
        };
        self.commit(profile, data, outcome.access_token.clone())
            .await?;
        Ok(outcome.access_token)
    }

    /// Authenticate with a previously paired secure-element key.
    ///
    /// Fails with [`IdpError::NotPaired`] unless an alternate pairing is
    /// registered for the profile. A pairing without an active session
    /// requires exactly this call before any bearer-token use — there is
    /// no implicit re-login anywhere else.
    #[instrument(skip(self, key), fields(profile = %profile))]
    pub async fn authenticate_with_paired_device(
        &self,
        profile: &ProfileId,
        key: &SecureElementSigner,
        scope: AuthenticationScope,
    ) -> Result<AccessToken, IdpError> {
        let lock = self.profile_lock(profile).await;
        let _guard = lock.lock().await;

        let data = self
            .store
            .load_authentication_data(profile)
            .await
            .map_err(IdpError::storage)?;
        if data.as_ref().and_then(AuthenticationData::key_alias).is_none() {
            return Err(IdpError::NotPaired);
        }

        if scope == AuthenticationScope::Default {
            if let Some(token) = self.valid_session_token(profile).await? {
                debug!("session already established, skipping exchange");
                return Ok(token);
            }
        }

        let outcome = self.pairing.authenticate_with_key(key, scope).await;
        let outcome = self.flag_key_mismatch(outcome).await?;

        let data = AuthenticationData::AlternateToken {
            sso_token: outcome.sso_token.clone(),
            key_alias: key.alias().clone(),
            certificate: key.certificate().to_vec(),
        };
        self.commit(profile, data, outcome.access_token.clone())
            .await?;
        Ok(outcome.access_token)
    }

    /// Pair a secure-element key, authorized by the health card.
    ///
    /// On success the profile holds an [`AuthenticationData::AlternateWithoutToken`]:
    /// the pairing-scoped session that authorized the registration is not
    /// a business session.
    #[instrument(skip(self, card_access_number, card_signer, key), fields(profile = %profile))]
    pub async fn register_pairing(
        &self,
        profile: &ProfileId,
        card_access_number: CardAccessNumber,
        card_signer: &dyn ChallengeSigner,
        key: &SecureElementSigner,
    ) -> Result<PairingEntry, IdpError> {
        let lock = self.profile_lock(profile).await;
        let _guard = lock.lock().await;

        let result = self.pairing.register(&card_access_number, card_signer, key).await;
        let (entry, _pairing_session) = match result {
            Err(e @ IdpError::DecryptionFailed(_)) => {
                self.invalidate_configuration().await;
                return Err(e);
            }
            other => other?,
        };

        self.store
            .save_authentication_data(
                profile,
                AuthenticationData::AlternateWithoutToken {
                    key_alias: key.alias().clone(),
                    certificate: key.certificate().to_vec(),
                },
            )
            .await
            .map_err(IdpError::storage)?;
        Ok(entry)
    }

    /// List the devices paired for this profile's current session.
    pub async fn list_paired_devices(
        &self,
        profile: &ProfileId,
    ) -> Result<Vec<PairingEntry>, IdpError> {
        let token = self.require_session_token(profile).await?;
        self.pairing.list(&token).await
    }

    /// Delete a paired device by alias. Idempotent: an already-absent
    /// alias deletes successfully.
    pub async fn delete_paired_device(
        &self,
        profile: &ProfileId,
        alias: &KeyAlias,
    ) -> Result<(), IdpError> {
        let token = self.require_session_token(profile).await?;
        self.pairing.delete(&token, alias).await
    }

    /// Clear all authentication state for the profile (logout, detected
    /// tampering, profile deletion). The profile's lock entry is dropped
    /// too, so deleted profiles do not accumulate in the lock map.
    #[instrument(skip(self), fields(profile = %profile))]
    pub async fn invalidate_session(&self, profile: &ProfileId) -> Result<(), IdpError> {
        self.locks.lock().await.remove(profile);
        self.store.invalidate(profile).await.map_err(IdpError::storage)
    }

    /// The cached bearer token for the profile, if the session is still
    /// valid. Never triggers a login.
    pub async fn access_token(
        &self,
        profile: &ProfileId,
    ) -> Result<Option<AccessToken>, IdpError> {
        self.valid_session_token(profile).await
    }

    async fn profile_lock(&self, profile: &ProfileId) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(profile.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// The cached access token, gated on the stored single-sign-on token.
    ///
    /// A token whose embedded expiry lies in the past — organically or
    /// through tampering — means no session.
    async fn valid_session_token(
        &self,
        profile: &ProfileId,
    ) -> Result<Option<AccessToken>, IdpError> {
        let now = OffsetDateTime::now_utc();
        let data = self
            .store
            .load_authentication_data(profile)
            .await
            .map_err(IdpError::storage)?;
        if !data
            .as_ref()
            .and_then(AuthenticationData::sso_token)
            .is_some_and(|t| t.is_valid(now))
        {
            return Ok(None);
        }
        let token = self
            .store
            .load_access_token(profile)
            .await
            .map_err(IdpError::storage)?;
        Ok(token.filter(|t| t.is_valid(now)))
    }

    async fn require_session_token(&self, profile: &ProfileId) -> Result<AccessToken, IdpError> {
        self.valid_session_token(profile)
            .await?
            .ok_or(IdpError::SessionExpired)
    }

    /// Persist tokens all-or-nothing: if the second write fails, the first
    /// is rolled back so the attempt leaves no partial state.
    async fn commit(
        &self,
        profile: &ProfileId,
        data: AuthenticationData,
        token: AccessToken,
    ) -> Result<(), IdpError> {
        let prior = self
            .store
            .load_authentication_data(profile)
            .await
            .map_err(IdpError::storage)?;
        self.store
            .save_authentication_data(profile, data)
            .await
            .map_err(IdpError::storage)?;
        if let Err(e) = self.store.save_access_token(profile, token).await {
            let rollback = match prior {
                Some(previous) => {
                    self.store
                        .save_authentication_data(profile, previous)
                        .await
                }
                None => self.store.invalidate(profile).await,
            };
            if let Err(rollback_error) = rollback {
                warn!(profile = %profile, error = %rollback_error, "token rollback failed");
            }
            return Err(IdpError::storage(e));
        }
        Ok(())
    }

    /// A decrypt failure signals a configuration/key mismatch: the error
    /// stays fatal, but the cached configuration is dropped so the next
    /// attempt starts from a fresh discovery document.
    async fn flag_key_mismatch(
        &self,
        result: Result<ProtocolOutcome, IdpError>,
    ) -> Result<ProtocolOutcome, IdpError> {
        match result {
            Err(e @ IdpError::DecryptionFailed(_)) => {
                self.invalidate_configuration().await;
                Err(e)
            }
            other => other,
        }
    }

    async fn invalidate_configuration(&self) {
        warn!("access token decrypt failed, invalidating cached configuration");
        if let Err(e) = self.protocol.configuration_store().invalidate().await {
            warn!(error = %e, "configuration invalidation failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IdpConfigurationStore;
    use crate::jose;
    use crate::store::MemoryStore;
    use crate::types::SingleSignOnToken;

    fn test_session() -> IdpSession<MemoryStore, MemoryStore> {
        let config_store = Arc::new(IdpConfigurationStore::new(
            "https://idp.example.com/.well-known/openid-configuration"
                .parse()
                .unwrap(),
            MemoryStore::new(),
        ));
        let protocol = IdpProtocol::new(
            config_store,
            "erx-app",
            "https://redirect.example.com/callback".parse().unwrap(),
        );
        IdpSession::new(
            protocol,
            DeviceInformation {
                name: "test device".into(),
                manufacturer: "acme".into(),
                os: "Android".into(),
                os_version: "16".into(),
            },
            Arc::new(MemoryStore::new()),
        )
    }

    fn sso_with_expiry(offset: time::Duration) -> SingleSignOnToken {
        let exp = (OffsetDateTime::now_utc() + offset).unix_timestamp();
        let payload = serde_json::json!({ "exp": exp });
        SingleSignOnToken::new(format!(
            "{}.{}.{}",
            jose::b64(br#"{"alg":"BP256R1"}"#),
            jose::b64(payload.to_string().as_bytes()),
            jose::b64(&[0u8; 64]),
        ))
    }

    async fn seed(
        session: &IdpSession<MemoryStore, MemoryStore>,
        profile: &ProfileId,
        sso_offset: time::Duration,
        token_offset: time::Duration,
    ) {
        session
            .store
            .save_authentication_data(
                profile,
                AuthenticationData::DefaultToken {
                    sso_token: sso_with_expiry(sso_offset),
                    card_access_number: "123456".parse().unwrap(),
                    certificate: vec![1, 2, 3],
                },
            )
            .await
            .unwrap();
        session
            .store
            .save_access_token(
                profile,
                AccessToken {
                    token: "bearer".into(),
                    expires_at: OffsetDateTime::now_utc() + token_offset,
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn valid_session_yields_cached_token() {
        let session = test_session();
        let profile = ProfileId::from("p1".to_string());
        seed(
            &session,
            &profile,
            time::Duration::hours(12),
            time::Duration::minutes(4),
        )
        .await;

        let token = session.access_token(&profile).await.unwrap();
        assert_eq!(token.map(|t| t.token), Some("bearer".into()));
    }

    #[tokio::test]
    async fn expired_sso_token_means_no_session() {
        let session = test_session();
        let profile = ProfileId::from("p1".to_string());
        // a manufactured past expiry behaves exactly like an organic one
        seed(
            &session,
            &profile,
            time::Duration::hours(-1),
            time::Duration::minutes(4),
        )
        .await;

        assert!(session.access_token(&profile).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_access_token_means_no_session() {
        let session = test_session();
        let profile = ProfileId::from("p1".to_string());
        seed(
            &session,
            &profile,
            time::Duration::hours(12),
            time::Duration::seconds(-1),
        )
        .await;

        assert!(session.access_token(&profile).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn invalidate_session_clears_everything() {
        let session = test_session();
        let profile = ProfileId::from("p1".to_string());
        seed(
            &session,
            &profile,
            time::Duration::hours(12),
            time::Duration::minutes(4),
        )
        .await;

        session.invalidate_session(&profile).await.unwrap();
        assert!(session.access_token(&profile).await.unwrap().is_none());
        assert!(session
            .store
            .load_authentication_data(&profile)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn paired_device_login_without_pairing_fails() {
        let session = test_session();
        let profile = ProfileId::from("p1".to_string());
        let key = SecureElementSigner::generate(
            KeyAlias::from("alias-1".to_string()),
            vec![1, 2, 3],
        );

        let err = session
            .authenticate_with_paired_device(&profile, &key, AuthenticationScope::Default)
            .await
            .unwrap_err();
        assert!(matches!(err, IdpError::NotPaired));
    }

    #[tokio::test]
    async fn listing_without_session_fails() {
        let session = test_session();
        let profile = ProfileId::from("p1".to_string());
        let err = session.list_paired_devices(&profile).await.unwrap_err();
        assert!(matches!(err, IdpError::SessionExpired));
    }

    #[tokio::test]
    async fn invalidate_session_evicts_profile_lock() {
        let session = test_session();
        let profile = ProfileId::from("p1".to_string());

        let before = session.profile_lock(&profile).await;
        session.invalidate_session(&profile).await.unwrap();

        assert!(!session.locks.lock().await.contains_key(&profile));
        let after = session.profile_lock(&profile).await;
        assert!(!Arc::ptr_eq(&before, &after));
    }

    #[tokio::test]
    async fn profile_locks_are_per_profile() {
        let session = test_session();
        let p1 = ProfileId::from("p1".to_string());
        let p2 = ProfileId::from("p2".to_string());

        let lock1 = session.profile_lock(&p1).await;
        let lock1_again = session.profile_lock(&p1).await;
        let lock2 = session.profile_lock(&p2).await;

        assert!(Arc::ptr_eq(&lock1, &lock1_again));
        assert!(!Arc::ptr_eq(&lock1, &lock2));

        // holding p1's lock must not block p2
        let _guard = lock1.lock().await;
        assert!(lock2.try_lock().is_ok());
    }
}
