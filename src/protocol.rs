//! The basic challenge/response exchange against the identity provider.
//!
//! Converts a proof of possession (health-card or secure-element
//! signature) into a [`SingleSignOnToken`] + [`AccessToken`] pair. The
//! flow is linear; the only automatic retry anywhere near it lives in the
//! configuration store. Persistence is the use case's job — nothing here
//! writes to a store, which is what makes cancellation at any await point
//! safe.

use std::sync::Arc;

use serde::Deserialize;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info, instrument, warn};
use url::Url;
use zeroize::Zeroize;

use crate::config::{IdpConfiguration, IdpConfigurationStore};
use crate::crypto::{self, ChallengeSigner};
use crate::error::IdpError;
use crate::jose;
use crate::pkce;
use crate::store::ConfigurationStore;
use crate::types::{AccessToken, AuthenticationScope, CardAccessNumber, SingleSignOnToken};

/// Socket timeout applied to every protocol request. Four network calls
/// bound a single end-to-end exchange, so the worst case stays under a
/// minute.
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Result of one successful exchange, not yet persisted.
#[derive(Debug, Clone)]
pub struct ProtocolOutcome {
    pub sso_token: SingleSignOnToken,
    pub access_token: AccessToken,
}

/// Low-level protocol client, independent of which credential signs the
/// challenge.
pub struct IdpProtocol<C> {
    config_store: Arc<IdpConfigurationStore<C>>,
    http: reqwest::Client,
    client_id: String,
    redirect_uri: Url,
}

// Manual Clone: avoid derive adding a `C: Clone` bound.
impl<C> Clone for IdpProtocol<C> {
    fn clone(&self) -> Self {
        Self {
            config_store: self.config_store.clone(),
            http: self.http.clone(),
            client_id: self.client_id.clone(),
            redirect_uri: self.redirect_uri.clone(),
        }
    }
}

#[derive(Deserialize)]
struct ChallengeBody {
    challenge: String,
}

#[derive(Deserialize)]
struct AuthorizationCodeBody {
    code: String,
}

#[derive(Deserialize)]
struct TokenBody {
    /// Compact JWE under the attempt's token key.
    access_token: String,
    sso_token: String,
    expires_in: i64,
}

impl<C: ConfigurationStore> IdpProtocol<C> {
    #[must_use]
    pub fn new(
        config_store: Arc<IdpConfigurationStore<C>>,
        client_id: impl Into<String>,
        redirect_uri: Url,
    ) -> Self {
        Self {
            config_store,
            http: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("failed to build HTTP client"),
            client_id: client_id.into(),
            redirect_uri,
        }
    }

    /// Use a custom HTTP client (for connection pool reuse or testing).
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    pub(crate) fn configuration_store(&self) -> &Arc<IdpConfigurationStore<C>> {
        &self.config_store
    }

    pub(crate) fn http_client(&self) -> &reqwest::Client {
        &self.http
    }

    /// Run the full exchange: resolve configuration, fetch and sign the
    /// challenge, trade it for an authorization code, exchange the code
    /// for tokens, and decrypt the access token.
    #[instrument(skip(self, signer), fields(scope = scope.as_scope_str()))]
    pub async fn authenticate(
        &self,
        scope: AuthenticationScope,
        card_access_number: Option<&CardAccessNumber>,
        signer: &dyn ChallengeSigner,
    ) -> Result<ProtocolOutcome, IdpError> {
        let config = self.config_store.configuration(false).await?;
        let encryption_key = config.encryption_key()?;

        // Fresh per-attempt material: PKCE verifier and the ephemeral
        // token key the provider will encrypt the response under.
        let code_verifier = pkce::generate_code_verifier();
        let mut token_key = pkce::generate_token_key();

        let result = self
            .exchange(
                &config,
                scope,
                card_access_number,
                signer,
                &encryption_key,
                &code_verifier,
                &token_key,
            )
            .await;
        token_key.zeroize();
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn exchange(
        &self,
        config: &IdpConfiguration,
        scope: AuthenticationScope,
        card_access_number: Option<&CardAccessNumber>,
        signer: &dyn ChallengeSigner,
        encryption_key: &p256::PublicKey,
        code_verifier: &str,
        token_key: &[u8; 32],
    ) -> Result<ProtocolOutcome, IdpError> {
        // Step 2: challenge request
        let url = self.authorization_url(config, scope, card_access_number, code_verifier);
        let response = self.http.get(url).send().await?;
        let response = Self::ensure_success(response, "challenge request").await?;
        let challenge: ChallengeBody = response.json().await?;
        debug!("received challenge");

        // Step 3: attest — the signer sees only the digest
        let header = serde_json::json!({
            "alg": "ES256",
            "typ": "JWT",
            "cty": "NJWT",
            "x5c": [jose::b64(signer.certificate())],
        });
        let payload = serde_json::json!({ "njwt": challenge.challenge });
        let signed_challenge = crypto::sign_jws(&header, &payload, signer).await?;

        // Step 4: submit the signed challenge, encrypted to the provider
        let encrypted_challenge = jose::encrypt_to_key(signed_challenge.as_bytes(), encryption_key)
            .map_err(|e| IdpError::ConfigurationInvalid(format!("puk_idp_enc unusable: {e}")))?;
        let response = self
            .http
            .post(config.authentication_endpoint.clone())
            .form(&[("signed_challenge", encrypted_challenge.as_str())])
            .send()
            .await?;
        let response = Self::ensure_success(response, "signed challenge").await?;
        let authorization: AuthorizationCodeBody = response.json().await?;
        debug!("received authorization code");

        // Step 5: code-for-tokens exchange with PKCE and key verifier
        let key_verifier_claims = serde_json::json!({
            "token_key": jose::b64(token_key),
            "code_verifier": code_verifier,
        });
        let key_verifier =
            jose::encrypt_to_key(key_verifier_claims.to_string().as_bytes(), encryption_key)
                .map_err(|e| {
                    IdpError::ConfigurationInvalid(format!("puk_idp_enc unusable: {e}"))
                })?;
        let params = [
            ("grant_type", "authorization_code"),
            ("code", authorization.code.as_str()),
            ("redirect_uri", self.redirect_uri.as_str()),
            ("client_id", self.client_id.as_str()),
            ("code_verifier", code_verifier),
            ("key_verifier", key_verifier.as_str()),
        ];
        let response = self
            .http
            .post(config.token_endpoint.clone())
            .form(&params)
            .send()
            .await?;
        let response = Self::ensure_success(response, "token exchange").await?;
        let token: TokenBody = response.json().await?;

        // Step 6: decrypt — failure is fatal, never retried, and signals a
        // configuration/key mismatch to the layer above
        let plaintext = jose::decrypt_direct(&token.access_token, token_key)
            .map_err(|e| IdpError::DecryptionFailed(e.to_string()))?;
        let bearer = String::from_utf8(plaintext)
            .map_err(|_| IdpError::DecryptionFailed("access token is not valid UTF-8".into()))?;

        info!("token exchange complete");
        Ok(ProtocolOutcome {
            sso_token: SingleSignOnToken::new(token.sso_token),
            access_token: AccessToken {
                token: bearer,
                expires_at: OffsetDateTime::now_utc() + Duration::seconds(token.expires_in),
            },
        })
    }

    fn authorization_url(
        &self,
        config: &IdpConfiguration,
        scope: AuthenticationScope,
        card_access_number: Option<&CardAccessNumber>,
        code_verifier: &str,
    ) -> Url {
        let mut url = config.authorization_endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("client_id", &self.client_id)
                .append_pair("redirect_uri", self.redirect_uri.as_str())
                .append_pair("state", &pkce::generate_state())
                .append_pair("code_challenge", &pkce::generate_code_challenge(code_verifier))
                .append_pair("code_challenge_method", "S256")
                .append_pair("scope", scope.as_scope_str());
            if let Some(can) = card_access_number {
                query.append_pair("card_access_number", can.as_str());
            }
        }
        url
    }

    /// Checks HTTP response status; returns the response on success or a
    /// rejection with enough detail to diagnose.
    async fn ensure_success(
        response: reqwest::Response,
        operation: &'static str,
    ) -> Result<reqwest::Response, IdpError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let detail = response.text().await.unwrap_or_default();
        warn!(operation, status, "identity provider rejected the request");
        Err(IdpError::ChallengeRejected { status, detail })
    }
}
