//! Identity-provider discovery document fetching and caching.
//!
//! The provider publishes a short-lived discovery document naming its
//! endpoints plus two P-256 public keys (encryption, signature). The store
//! caches the assembled [`IdpConfiguration`] in memory and in the
//! consumer's [`ConfigurationStore`]; a cache hit with valid timestamps
//! does no I/O. Validity failures trigger exactly one automatic
//! invalidate-and-refetch — a second consecutive failure surfaces to the
//! caller.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::error::IdpError;
use crate::jose;
use crate::store::ConfigurationStore;

/// Tolerance applied to the issue/expiry instants to absorb clock skew
/// between device and provider.
pub const CLOCK_SKEW_LEEWAY: Duration = Duration::seconds(30);

/// Policy ceiling on a discovery document's validity window.
pub const MAX_CONFIGURATION_AGE: Duration = Duration::hours(24);

/// Socket timeout applied to every configuration request.
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Assembled provider configuration: endpoints, signing certificate, and
/// the two public keys, bounded by a validity window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdpConfiguration {
    pub authorization_endpoint: Url,
    pub authentication_endpoint: Url,
    pub token_endpoint: Url,
    pub pairing_endpoint: Url,
    pub federation_endpoint: Option<Url>,
    /// Certificate the provider signs its documents with (DER bytes).
    pub signing_certificate: Vec<u8>,
    /// Provider encryption public key (P-256 JWK, pass-through).
    pub puk_idp_enc: serde_json::Value,
    /// Provider signature public key (P-256 JWK, pass-through).
    pub puk_idp_sig: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub issued_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

impl IdpConfiguration {
    /// Enforce the validity invariant:
    /// `issued_at − skew ≤ now ≤ expires_at + skew`, window ≤ 24 h.
    pub fn check_validity(&self, now: OffsetDateTime) -> Result<(), IdpError> {
        if self.expires_at - self.issued_at > MAX_CONFIGURATION_AGE {
            return Err(IdpError::ConfigurationInvalid(format!(
                "validity window of {} exceeds the 24h policy ceiling",
                self.expires_at - self.issued_at
            )));
        }
        if now < self.issued_at - CLOCK_SKEW_LEEWAY {
            return Err(IdpError::ConfigurationInvalid(
                "configuration issued in the future".into(),
            ));
        }
        if now > self.expires_at + CLOCK_SKEW_LEEWAY {
            return Err(IdpError::ConfigurationInvalid(
                "configuration expired".into(),
            ));
        }
        Ok(())
    }

    /// The provider's encryption key as a typed P-256 point.
    pub fn encryption_key(&self) -> Result<p256::PublicKey, IdpError> {
        jose::import_public_jwk(&self.puk_idp_enc)
            .map_err(|e| IdpError::ConfigurationInvalid(format!("puk_idp_enc: {e}")))
    }
}

/// Discovery document as published by the provider. Fields beyond the ones
/// named here are provider-specific and ignored.
#[derive(Debug, Deserialize)]
struct DiscoveryDocument {
    authorization_endpoint: Url,
    authentication_endpoint: Url,
    token_endpoint: Url,
    pairing_endpoint: Url,
    #[serde(default)]
    federation_endpoint: Option<Url>,
    uri_puk_idp_enc: Url,
    uri_puk_idp_sig: Url,
    /// Base64 (standard alphabet) DER signing certificate.
    #[serde(default)]
    x5c: Option<String>,
    iat: i64,
    exp: i64,
}

/// Caching fetcher for [`IdpConfiguration`].
///
/// Read by many profiles concurrently, written only here; the old value
/// stays readable until the replacement is committed atomically.
pub struct IdpConfigurationStore<C> {
    discovery_url: Url,
    http: reqwest::Client,
    store: C,
    cache: RwLock<Option<IdpConfiguration>>,
}

impl<C: ConfigurationStore> IdpConfigurationStore<C> {
    #[must_use]
    pub fn new(discovery_url: Url, store: C) -> Self {
        Self {
            discovery_url,
            http: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("failed to build HTTP client"),
            store,
            cache: RwLock::new(None),
        }
    }

    /// Use a custom HTTP client (for connection pool reuse or testing).
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    /// Return a valid configuration, fetching if the cache misses,
    /// `force_refresh` is set, or the cached value fails its validity
    /// check. At most one automatic invalidate-and-retry happens here.
    #[instrument(skip(self))]
    pub async fn configuration(
        &self,
        force_refresh: bool,
    ) -> Result<IdpConfiguration, IdpError> {
        let now = OffsetDateTime::now_utc();

        if !force_refresh {
            if let Some(cached) = self.cached().await? {
                match cached.check_validity(now) {
                    Ok(()) => {
                        debug!("configuration cache hit");
                        return Ok(cached);
                    }
                    Err(e) => {
                        warn!(error = %e, "cached configuration invalid, refetching");
                        self.invalidate().await?;
                    }
                }
            }
        }

        match self.fetch_and_commit(now).await {
            Err(e @ IdpError::ConfigurationInvalid(_)) => {
                warn!(error = %e, "fetched configuration invalid, retrying once");
                self.invalidate().await?;
                self.fetch_and_commit(OffsetDateTime::now_utc()).await
            }
            other => other,
        }
    }

    /// Drop the cached and persisted configuration so the next call
    /// re-fetches.
    pub async fn invalidate(&self) -> Result<(), IdpError> {
        *self.cache.write().await = None;
        self.store
            .clear_configuration()
            .await
            .map_err(IdpError::storage)
    }

    async fn cached(&self) -> Result<Option<IdpConfiguration>, IdpError> {
        if let Some(config) = self.cache.read().await.clone() {
            return Ok(Some(config));
        }
        let persisted = self
            .store
            .load_configuration()
            .await
            .map_err(IdpError::storage)?;
        if let Some(ref config) = persisted {
            *self.cache.write().await = Some(config.clone());
        }
        Ok(persisted)
    }

    async fn fetch_and_commit(
        &self,
        now: OffsetDateTime,
    ) -> Result<IdpConfiguration, IdpError> {
        let config = self.fetch().await?;
        config.check_validity(now)?;
        self.store
            .save_configuration(config.clone())
            .await
            .map_err(IdpError::storage)?;
        *self.cache.write().await = Some(config.clone());
        info!(expires_at = %config.expires_at, "fetched fresh identity provider configuration");
        Ok(config)
    }

    async fn fetch(&self) -> Result<IdpConfiguration, IdpError> {
        let document: DiscoveryDocument = self.get_json(self.discovery_url.clone()).await?;
        let puk_idp_enc: serde_json::Value =
            self.get_json(document.uri_puk_idp_enc.clone()).await?;
        let puk_idp_sig: serde_json::Value =
            self.get_json(document.uri_puk_idp_sig.clone()).await?;

        let signing_certificate = match &document.x5c {
            Some(der_b64) => STANDARD.decode(der_b64).map_err(|e| {
                IdpError::ConfigurationInvalid(format!("malformed x5c certificate: {e}"))
            })?,
            None => Vec::new(),
        };

        Ok(IdpConfiguration {
            authorization_endpoint: document.authorization_endpoint,
            authentication_endpoint: document.authentication_endpoint,
            token_endpoint: document.token_endpoint,
            pairing_endpoint: document.pairing_endpoint,
            federation_endpoint: document.federation_endpoint,
            signing_certificate,
            puk_idp_enc,
            puk_idp_sig,
            issued_at: OffsetDateTime::from_unix_timestamp(document.iat).map_err(|e| {
                IdpError::ConfigurationInvalid(format!("iat out of range: {e}"))
            })?,
            expires_at: OffsetDateTime::from_unix_timestamp(document.exp).map_err(|e| {
                IdpError::ConfigurationInvalid(format!("exp out of range: {e}"))
            })?,
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, IdpError> {
        let response = self
            .http
            .get(url.clone())
            .send()
            .await
            .map_err(|e| IdpError::ConfigurationUnreachable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(IdpError::ConfigurationUnreachable(format!(
                "{url} returned status {}",
                response.status()
            )));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| IdpError::ConfigurationInvalid(format!("malformed document: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_window(issued_at: OffsetDateTime, expires_at: OffsetDateTime) -> IdpConfiguration {
        let endpoint: Url = "https://idp.example.com/x".parse().unwrap();
        IdpConfiguration {
            authorization_endpoint: endpoint.clone(),
            authentication_endpoint: endpoint.clone(),
            token_endpoint: endpoint.clone(),
            pairing_endpoint: endpoint.clone(),
            federation_endpoint: None,
            signing_certificate: Vec::new(),
            puk_idp_enc: serde_json::json!({}),
            puk_idp_sig: serde_json::json!({}),
            issued_at,
            expires_at,
        }
    }

    #[test]
    fn fresh_configuration_is_valid() {
        let now = OffsetDateTime::now_utc();
        let config = config_with_window(now - Duration::hours(1), now + Duration::hours(23));
        assert!(config.check_validity(now).is_ok());
    }

    #[test]
    fn expired_configuration_is_rejected() {
        let now = OffsetDateTime::now_utc();
        let config = config_with_window(now - Duration::hours(24), now - Duration::hours(1));
        assert!(config.check_validity(now).is_err());
    }

    #[test]
    fn future_dated_configuration_is_rejected() {
        let now = OffsetDateTime::now_utc();
        let config = config_with_window(now + Duration::hours(1), now + Duration::hours(2));
        assert!(config.check_validity(now).is_err());
    }

    #[test]
    fn window_above_policy_ceiling_is_rejected() {
        let now = OffsetDateTime::now_utc();
        // 25-hour window: both instants individually plausible, span too wide
        let config = config_with_window(now - Duration::hours(1), now + Duration::hours(24));
        assert!(config.check_validity(now).is_err());
    }

    #[test]
    fn clock_skew_leeway_is_honored_at_both_bounds() {
        let now = OffsetDateTime::now_utc();

        // expired 10s ago: inside the 30s leeway
        let just_expired = config_with_window(now - Duration::hours(23), now - Duration::seconds(10));
        assert!(just_expired.check_validity(now).is_ok());

        // expired 60s ago: beyond the leeway
        let long_expired = config_with_window(now - Duration::hours(23), now - Duration::seconds(60));
        assert!(long_expired.check_validity(now).is_err());

        // issued 10s in the future: inside the leeway
        let just_future = config_with_window(now + Duration::seconds(10), now + Duration::hours(1));
        assert!(just_future.check_validity(now).is_ok());
    }

    #[test]
    fn encryption_key_requires_well_formed_jwk() {
        let now = OffsetDateTime::now_utc();
        let config = config_with_window(now, now + Duration::hours(1));
        assert!(matches!(
            config.encryption_key(),
            Err(IdpError::ConfigurationInvalid(_))
        ));
    }
}
