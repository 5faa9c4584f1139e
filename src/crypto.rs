//! Challenge-signer capability boundary.
//!
//! The protocol core never sees key material; it hands a 32-byte digest to
//! a [`ChallengeSigner`] and gets back a 64-byte IEEE P1363 signature
//! (raw `r||s`, never DER). Which proof of possession backs the signature
//! — a physical health card behind an APDU round-trip, a secure-element
//! key, or a federated authenticator — is the caller's choice.

use async_trait::async_trait;
use p256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};

use crate::error::IdpError;
use crate::jose;
use crate::types::KeyAlias;

/// Concatenated ECDSA signature length for P-256 (r||s).
pub const SIGNATURE_LENGTH: usize = 64;

/// Error raised by a signer implementation.
pub type SignerError = Box<dyn std::error::Error + Send + Sync>;

/// Proof-of-possession signer supplied by the caller.
///
/// `sign` is awaited from within the protocol flow; a health-card
/// implementation may take seconds while the user taps the card, which is
/// why the contract is asynchronous rather than a blocking callback.
#[async_trait]
pub trait ChallengeSigner: Send + Sync {
    /// The certificate authenticating this signer's public key (DER bytes,
    /// forwarded opaquely to the provider).
    fn certificate(&self) -> &[u8];

    /// Sign a SHA-256 digest, returning a 64-byte concatenated ECDSA
    /// signature.
    async fn sign(&self, digest: &[u8; 32]) -> Result<Vec<u8>, SignerError>;
}

/// Signer backed by a locally held secure-element P-256 key.
pub struct SecureElementSigner {
    key: SigningKey,
    alias: KeyAlias,
    certificate: Vec<u8>,
}

impl SecureElementSigner {
    /// Generate a fresh secure-element key under the given alias.
    ///
    /// The certificate is the health-card certificate the pairing was
    /// authorized with; it travels with every alternate login.
    #[must_use]
    pub fn generate(alias: KeyAlias, certificate: Vec<u8>) -> Self {
        Self {
            key: SigningKey::random(&mut p256::elliptic_curve::rand_core::OsRng),
            alias,
            certificate,
        }
    }

    /// Wrap an existing secure-element key.
    #[must_use]
    pub fn from_key(key: SigningKey, alias: KeyAlias, certificate: Vec<u8>) -> Self {
        Self {
            key,
            alias,
            certificate,
        }
    }

    #[must_use]
    pub fn alias(&self) -> &KeyAlias {
        &self.alias
    }

    /// Public half of the secure-element key, as a JWK for registration.
    #[must_use]
    pub fn public_jwk(&self) -> serde_json::Value {
        jose::export_public_jwk(&self.key.verifying_key().into())
    }
}

#[async_trait]
impl ChallengeSigner for SecureElementSigner {
    fn certificate(&self) -> &[u8] {
        &self.certificate
    }

    async fn sign(&self, digest: &[u8; 32]) -> Result<Vec<u8>, SignerError> {
        let signature: Signature = self.key.sign_prehash(digest)?;
        Ok(signature.to_bytes().to_vec())
    }
}

/// Assemble and sign a compact JWS (`header.payload.signature`).
///
/// The signing input is `b64(header).b64(payload)`; its SHA-256 digest is
/// handed to the signer, and the returned signature must be exactly
/// [`SIGNATURE_LENGTH`] bytes.
pub async fn sign_jws(
    header: &serde_json::Value,
    payload: &serde_json::Value,
    signer: &dyn ChallengeSigner,
) -> Result<String, IdpError> {
    let signing_input = format!(
        "{}.{}",
        jose::b64(header.to_string().as_bytes()),
        jose::b64(payload.to_string().as_bytes()),
    );
    let digest: [u8; 32] = Sha256::digest(signing_input.as_bytes()).into();

    let signature = signer
        .sign(&digest)
        .await
        .map_err(|e| IdpError::Signature(e.to_string()))?;
    if signature.len() != SIGNATURE_LENGTH {
        return Err(IdpError::Signature(format!(
            "expected {SIGNATURE_LENGTH}-byte concatenated signature, got {}",
            signature.len()
        )));
    }

    Ok(format!("{signing_input}.{}", jose::b64(&signature)))
}

/// Verify a compact JWS produced by [`sign_jws`].
///
/// Returns false on any malformed input; never errors.
#[must_use]
pub fn verify_jws(compact: &str, key: &VerifyingKey) -> bool {
    let mut parts = compact.rsplitn(2, '.');
    let (Some(signature_b64), Some(signing_input)) = (parts.next(), parts.next()) else {
        return false;
    };
    let Ok(signature_bytes) = jose::b64d(signature_b64) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(&signature_bytes) else {
        return false;
    };
    let digest: [u8; 32] = Sha256::digest(signing_input.as_bytes()).into();
    key.verify_prehash(&digest, &signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_signer() -> SecureElementSigner {
        SecureElementSigner::generate(KeyAlias::from("alias-1".to_string()), vec![1, 2, 3])
    }

    #[tokio::test]
    async fn signature_is_64_bytes() {
        let signer = test_signer();
        let signature = signer.sign(&[9u8; 32]).await.unwrap();
        assert_eq!(signature.len(), SIGNATURE_LENGTH);
    }

    #[tokio::test]
    async fn jws_round_trips_against_public_key() {
        let signer = test_signer();
        let header = serde_json::json!({ "alg": "ES256", "typ": "JWT" });
        let payload = serde_json::json!({ "njwt": "challenge-token" });

        let jws = sign_jws(&header, &payload, &signer).await.unwrap();
        assert_eq!(jws.split('.').count(), 3);
        assert!(verify_jws(&jws, signer.key.verifying_key()));
    }

    #[tokio::test]
    async fn tampered_jws_fails_verification() {
        let signer = test_signer();
        let header = serde_json::json!({ "alg": "ES256" });
        let payload = serde_json::json!({ "njwt": "challenge-token" });

        let jws = sign_jws(&header, &payload, &signer).await.unwrap();
        let tampered = jws.replace('.', &format!(".{}", jose::b64(b"x")));
        assert!(!verify_jws(&tampered, signer.key.verifying_key()));
        assert!(!verify_jws("garbage", signer.key.verifying_key()));
    }

    #[tokio::test]
    async fn wrong_length_signature_is_rejected() {
        struct ShortSigner;

        #[async_trait]
        impl ChallengeSigner for ShortSigner {
            fn certificate(&self) -> &[u8] {
                &[]
            }
            async fn sign(&self, _digest: &[u8; 32]) -> Result<Vec<u8>, SignerError> {
                Ok(vec![0u8; 48])
            }
        }

        let header = serde_json::json!({});
        let payload = serde_json::json!({});
        let err = sign_jws(&header, &payload, &ShortSigner).await.unwrap_err();
        assert!(matches!(err, IdpError::Signature(_)));
    }

    #[test]
    fn public_jwk_exports_ec_key() {
        let signer = test_signer();
        let jwk = signer.public_jwk();
        assert_eq!(jwk["kty"], "EC");
        assert_eq!(jwk["crv"], "P-256");
    }
}
