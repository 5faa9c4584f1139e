//! Pairing flows layered on the basic protocol.
//!
//! Registration proves possession of the health card even though the end
//! goal is passwordless future logins: the secure-element public key plus
//! a device descriptor is signed by the card and encrypted to the
//! provider. Alternate login is the basic exchange with the secure-element
//! signer in place of the card. This adapter holds no persistent state.

use serde::Deserialize;
use time::OffsetDateTime;
use tracing::{debug, info, instrument, warn};

use crate::crypto::{self, ChallengeSigner, SecureElementSigner};
use crate::error::IdpError;
use crate::jose;
use crate::protocol::{IdpProtocol, ProtocolOutcome};
use crate::store::ConfigurationStore;
use crate::types::{
    AccessToken, AuthenticationScope, CardAccessNumber, DeviceInformation, KeyAlias, PairingEntry,
};

/// Protocol adapter for secure-element pairing and alternate login.
pub struct PairingProtocol<C> {
    protocol: IdpProtocol<C>,
    device: DeviceInformation,
}

#[derive(Deserialize)]
struct PairingEntriesBody {
    pairing_entries: Vec<PairingEntry>,
}

impl<C: ConfigurationStore> PairingProtocol<C> {
    #[must_use]
    pub fn new(protocol: IdpProtocol<C>, device: DeviceInformation) -> Self {
        Self { protocol, device }
    }

    /// Register a secure-element key with the provider.
    ///
    /// Runs a health-card-authenticated exchange with the
    /// `BiometricPairing` scope, then posts the card-signed registration
    /// data. Returns the created entry together with the pairing-scoped
    /// session that authorized it.
    #[instrument(skip(self, card_signer, key), fields(key_alias = %key.alias()))]
    pub async fn register(
        &self,
        card_access_number: &CardAccessNumber,
        card_signer: &dyn ChallengeSigner,
        key: &SecureElementSigner,
    ) -> Result<(PairingEntry, ProtocolOutcome), IdpError> {
        let outcome = self
            .protocol
            .authenticate(
                AuthenticationScope::BiometricPairing,
                Some(card_access_number),
                card_signer,
            )
            .await?;

        let config = self.protocol.configuration_store().configuration(false).await?;
        let encryption_key = config.encryption_key()?;

        let registration = serde_json::json!({
            "subject_public_key_info": key.public_jwk(),
            "key_identifier": key.alias().as_str(),
            "device_information": self.device,
            "issued_at": OffsetDateTime::now_utc().unix_timestamp(),
        });
        let header = serde_json::json!({
            "alg": "ES256",
            "typ": "JWT",
            "x5c": [jose::b64(card_signer.certificate())],
        });
        let signed_registration = crypto::sign_jws(&header, &registration, card_signer).await?;
        let encrypted_registration =
            jose::encrypt_to_key(signed_registration.as_bytes(), &encryption_key)
                .map_err(|e| {
                    IdpError::ConfigurationInvalid(format!("puk_idp_enc unusable: {e}"))
                })?;

        let response = self
            .protocol
            .http_client()
            .post(config.pairing_endpoint.clone())
            .bearer_auth(&outcome.access_token.token)
            .json(&serde_json::json!({
                "encrypted_registration_data": encrypted_registration,
            }))
            .send()
            .await?;
        let response = Self::ensure_success(response, "pairing registration").await?;
        let entry: PairingEntry = response.json().await?;

        info!(key_alias = %entry.key_alias, "registered paired device");
        Ok((entry, outcome))
    }

    /// Alternate login: the basic exchange with the secure-element signer.
    pub async fn authenticate_with_key(
        &self,
        key: &SecureElementSigner,
        scope: AuthenticationScope,
    ) -> Result<ProtocolOutcome, IdpError> {
        self.protocol.authenticate(scope, None, key).await
    }

    /// List the devices paired for the session behind the bearer token.
    pub async fn list(&self, access_token: &AccessToken) -> Result<Vec<PairingEntry>, IdpError> {
        let config = self.protocol.configuration_store().configuration(false).await?;
        let response = self
            .protocol
            .http_client()
            .get(config.pairing_endpoint.clone())
            .bearer_auth(&access_token.token)
            .send()
            .await?;
        let response = Self::ensure_success(response, "pairing listing").await?;
        let body: PairingEntriesBody = response.json().await?;
        Ok(body.pairing_entries)
    }

    /// Delete a paired device by alias.
    ///
    /// Idempotent: deleting an alias the provider no longer knows (404)
    /// is success.
    #[instrument(skip(self, access_token))]
    pub async fn delete(
        &self,
        access_token: &AccessToken,
        alias: &KeyAlias,
    ) -> Result<(), IdpError> {
        let config = self.protocol.configuration_store().configuration(false).await?;
        let mut url = config.pairing_endpoint.clone();
        url.path_segments_mut()
            .map_err(|()| {
                IdpError::ConfigurationInvalid("pairing endpoint cannot carry a path".into())
            })?
            .push(alias.as_str());

        let response = self
            .protocol
            .http_client()
            .delete(url)
            .bearer_auth(&access_token.token)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            debug!(%alias, "pairing already absent, treating deletion as success");
            return Ok(());
        }
        Self::ensure_success(response, "pairing deletion").await?;
        info!(%alias, "deleted paired device");
        Ok(())
    }

    async fn ensure_success(
        response: reqwest::Response,
        operation: &'static str,
    ) -> Result<reqwest::Response, IdpError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let detail = response.text().await.unwrap_or_default();
        warn!(operation, status, "pairing endpoint rejected the request");
        Err(IdpError::PairingRejected { status, detail })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairing_listing_wire_format_parses() {
        let body: PairingEntriesBody = serde_json::from_str(
            r#"{
                "pairing_entries": [{
                    "key_identifier": "alias-1",
                    "device_information": {
                        "name": "Pixel 9",
                        "manufacturer": "Google",
                        "os": "Android",
                        "os_version": "16"
                    },
                    "created_at": "2026-08-01T10:00:00Z"
                }]
            }"#,
        )
        .unwrap();

        assert_eq!(body.pairing_entries.len(), 1);
        assert_eq!(body.pairing_entries[0].key_alias.as_str(), "alias-1");
        assert_eq!(body.pairing_entries[0].device.manufacturer, "Google");
    }
}
