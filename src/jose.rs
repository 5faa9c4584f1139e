//! Compact JOSE handling for the identity-provider wire formats.
//!
//! Three shapes cross the wire:
//! - signed tokens (`header.payload.signature`) — parsed only for the
//!   embedded `exp` claim, otherwise opaque,
//! - JWEs addressed to the provider's P-256 encryption key
//!   (ECDH-ES+A256KW key agreement, A256GCM content encryption,
//!   RFC 7516/7518 compact form),
//! - JWEs addressed to the client under the ephemeral token key of the
//!   current attempt (`alg: dir`, A256GCM).
//!
//! The key agreement uses Concat KDF (NIST SP 800-56A §5.8.1) to derive
//! a 256-bit KEK from the ECDH shared secret, then AES-KW wraps the CEK.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use aes_kw::Kek;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use p256::ecdh::EphemeralSecret;
use p256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use p256::{EncodedPoint, PublicKey};
use rand::Rng;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use zeroize::Zeroize;

/// Algorithm identifier for Concat KDF (RFC 7518 §4.6.2).
const ALG_ID: &str = "ECDH-ES+A256KW";
/// AES-256-GCM content encryption key length.
const CEK_LENGTH: usize = 32;
/// AES-KW output for a 32-byte key: 32 + 8 = 40 bytes.
const AES_KW_OUTPUT_LENGTH: usize = 40;
/// GCM authentication tag length.
const TAG_LENGTH: usize = 16;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum JoseError {
    #[error("malformed JOSE object: {0}")]
    Format(String),
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("invalid key: {0}")]
    InvalidKey(String),
}

pub(crate) fn b64(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

pub(crate) fn b64d(s: &str) -> Result<Vec<u8>, JoseError> {
    URL_SAFE_NO_PAD
        .decode(s)
        .map_err(|e| JoseError::Format(e.to_string()))
}

/// Decode the payload of a compact signed token without verifying it.
pub fn decode_payload(compact: &str) -> Result<serde_json::Value, JoseError> {
    let parts: Vec<&str> = compact.split('.').collect();
    if parts.len() != 3 {
        return Err(JoseError::Format(format!(
            "expected 3 parts, got {}",
            parts.len()
        )));
    }
    let payload = b64d(parts[1])?;
    serde_json::from_slice(&payload).map_err(|e| JoseError::Format(e.to_string()))
}

/// Extract the `exp` claim of a compact signed token as an instant.
pub fn token_expiry(compact: &str) -> Result<OffsetDateTime, JoseError> {
    let payload = decode_payload(compact)?;
    let exp = payload
        .get("exp")
        .and_then(serde_json::Value::as_i64)
        .ok_or_else(|| JoseError::Format("missing exp claim".into()))?;
    OffsetDateTime::from_unix_timestamp(exp)
        .map_err(|e| JoseError::Format(format!("exp out of range: {e}")))
}

/// Encrypt plaintext as a compact JWE addressed to the provider's
/// P-256 encryption key (ECDH-ES+A256KW / A256GCM).
pub fn encrypt_to_key(
    plaintext: &[u8],
    recipient: &PublicKey,
) -> Result<String, JoseError> {
    // Ephemeral keypair for the key agreement
    let ephemeral_secret = EphemeralSecret::random(&mut p256::elliptic_curve::rand_core::OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral_secret);
    let ephemeral_point = ephemeral_public.to_encoded_point(false);

    let shared_secret = ephemeral_secret.diffie_hellman(recipient);
    let mut kek_bytes = concat_kdf(shared_secret.raw_secret_bytes().as_slice(), ALG_ID, 256);

    let mut cek: [u8; CEK_LENGTH] = rand::rng().random();

    let kek = Kek::from(
        <[u8; 32]>::try_from(kek_bytes.as_slice())
            .map_err(|_| JoseError::EncryptionFailed("KEK is not 32 bytes".into()))?,
    );
    kek_bytes.zeroize();

    let mut wrapped_cek = [0u8; AES_KW_OUTPUT_LENGTH];
    kek.wrap(&cek, &mut wrapped_cek)
        .map_err(|e| JoseError::EncryptionFailed(format!("AES-KW wrap failed: {e:?}")))?;

    let header = serde_json::json!({
        "alg": ALG_ID,
        "enc": "A256GCM",
        "epk": encode_point_as_jwk(&ephemeral_point),
    });
    let header_b64 = b64(header.to_string().as_bytes());

    let iv: [u8; 12] = rand::rng().random();

    let cipher = Aes256Gcm::new_from_slice(&cek)
        .map_err(|e| JoseError::EncryptionFailed(format!("AES-GCM init: {e:?}")))?;
    cek.zeroize();

    // AAD is the protected header base64url string (RFC 7516 §5.1 step 14)
    let payload = aes_gcm::aead::Payload {
        msg: plaintext,
        aad: header_b64.as_bytes(),
    };
    let ciphertext_with_tag = cipher
        .encrypt(Nonce::from_slice(&iv), payload)
        .map_err(|e| JoseError::EncryptionFailed(format!("AES-GCM encrypt: {e:?}")))?;

    let tag_offset = ciphertext_with_tag.len() - TAG_LENGTH;
    Ok(format!(
        "{}.{}.{}.{}.{}",
        header_b64,
        b64(&wrapped_cek),
        b64(&iv),
        b64(&ciphertext_with_tag[..tag_offset]),
        b64(&ciphertext_with_tag[tag_offset..]),
    ))
}

/// Decrypt a compact ECDH-ES+A256KW / A256GCM JWE with a P-256 private key.
///
/// The provider side of [`encrypt_to_key`]; production code never holds the
/// provider key, but mock providers in tests do.
pub fn decrypt_with_key(
    jwe: &str,
    recipient_secret: &p256::SecretKey,
) -> Result<Vec<u8>, JoseError> {
    let parts = split5(jwe)?;
    let header = decode_header(parts[0])?;
    expect_algorithms(&header, ALG_ID)?;

    let epk = header
        .get("epk")
        .ok_or_else(|| JoseError::Format("missing epk in header".into()))?;
    let sender_public_key = import_public_jwk(epk)?;

    let shared_secret = p256::ecdh::diffie_hellman(
        recipient_secret.to_nonzero_scalar(),
        sender_public_key.as_affine(),
    );
    let mut kek_bytes = concat_kdf(shared_secret.raw_secret_bytes().as_slice(), ALG_ID, 256);

    let encrypted_key = b64d(parts[1])?;
    let kek = Kek::from(
        <[u8; 32]>::try_from(kek_bytes.as_slice())
            .map_err(|_| JoseError::DecryptionFailed("KEK is not 32 bytes".into()))?,
    );
    kek_bytes.zeroize();

    let mut cek = [0u8; CEK_LENGTH];
    kek.unwrap(&encrypted_key, &mut cek)
        .map_err(|e| JoseError::DecryptionFailed(format!("AES-KW unwrap failed: {e:?}")))?;

    let plaintext = gcm_decrypt(&cek, parts[0], parts[2], parts[3], parts[4]);
    cek.zeroize();
    plaintext
}

/// Encrypt plaintext as a compact JWE under a shared 256-bit key
/// (`alg: dir`, A256GCM). Used by mock providers to produce the
/// token-endpoint response.
pub fn encrypt_direct(plaintext: &[u8], key: &[u8; 32]) -> Result<String, JoseError> {
    let header = serde_json::json!({ "alg": "dir", "enc": "A256GCM" });
    let header_b64 = b64(header.to_string().as_bytes());

    let iv: [u8; 12] = rand::rng().random();
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| JoseError::EncryptionFailed(format!("AES-GCM init: {e:?}")))?;
    let payload = aes_gcm::aead::Payload {
        msg: plaintext,
        aad: header_b64.as_bytes(),
    };
    let ciphertext_with_tag = cipher
        .encrypt(Nonce::from_slice(&iv), payload)
        .map_err(|e| JoseError::EncryptionFailed(format!("AES-GCM encrypt: {e:?}")))?;

    let tag_offset = ciphertext_with_tag.len() - TAG_LENGTH;
    Ok(format!(
        "{}..{}.{}.{}",
        header_b64,
        b64(&iv),
        b64(&ciphertext_with_tag[..tag_offset]),
        b64(&ciphertext_with_tag[tag_offset..]),
    ))
}

/// Decrypt a compact `dir`/A256GCM JWE with the ephemeral token key of the
/// current authentication attempt.
pub fn decrypt_direct(jwe: &str, key: &[u8; 32]) -> Result<Vec<u8>, JoseError> {
    let parts = split5(jwe)?;
    if !parts[1].is_empty() {
        return Err(JoseError::Format(
            "direct JWE must have an empty encrypted-key part".into(),
        ));
    }
    let header = decode_header(parts[0])?;
    expect_algorithms(&header, "dir")?;
    gcm_decrypt(key, parts[0], parts[2], parts[3], parts[4])
}

/// Import a P-256 public key from a JWK JSON value.
pub fn import_public_jwk(jwk: &serde_json::Value) -> Result<PublicKey, JoseError> {
    let x_b64 = jwk["x"]
        .as_str()
        .ok_or_else(|| JoseError::InvalidKey("missing x coordinate".into()))?;
    let y_b64 = jwk["y"]
        .as_str()
        .ok_or_else(|| JoseError::InvalidKey("missing y coordinate".into()))?;

    let x_bytes = b64d(x_b64).map_err(|e| JoseError::InvalidKey(e.to_string()))?;
    let y_bytes = b64d(y_b64).map_err(|e| JoseError::InvalidKey(e.to_string()))?;

    // Build uncompressed SEC1 point: 0x04 || x(32) || y(32).
    // Left-pad coordinates to 32 bytes — JWKs may omit leading zeros.
    let mut uncompressed = Vec::with_capacity(65);
    uncompressed.push(0x04);
    if x_bytes.len() < 32 {
        uncompressed.extend(std::iter::repeat_n(0u8, 32 - x_bytes.len()));
    }
    uncompressed.extend_from_slice(&x_bytes);
    if y_bytes.len() < 32 {
        uncompressed.extend(std::iter::repeat_n(0u8, 32 - y_bytes.len()));
    }
    uncompressed.extend_from_slice(&y_bytes);

    let point = EncodedPoint::from_bytes(&uncompressed)
        .map_err(|e| JoseError::InvalidKey(format!("invalid EC point: {e}")))?;

    PublicKey::from_encoded_point(&point)
        .into_option()
        .ok_or_else(|| JoseError::InvalidKey("EC point not on P-256 curve".into()))
}

/// Export a P-256 public key to JWK format.
#[must_use]
pub fn export_public_jwk(key: &PublicKey) -> serde_json::Value {
    let point = key.to_encoded_point(false);
    encode_point_as_jwk(&point)
}

fn encode_point_as_jwk(point: &EncodedPoint) -> serde_json::Value {
    let x = point.x().expect("uncompressed point has x");
    let y = point.y().expect("uncompressed point has y");
    serde_json::json!({
        "kty": "EC",
        "crv": "P-256",
        "x": b64(x.as_slice()),
        "y": b64(y.as_slice()),
    })
}

fn split5(jwe: &str) -> Result<Vec<&str>, JoseError> {
    let parts: Vec<&str> = jwe.split('.').collect();
    if parts.len() != 5 {
        return Err(JoseError::Format(format!(
            "expected 5 parts, got {}",
            parts.len()
        )));
    }
    Ok(parts)
}

fn decode_header(header_b64: &str) -> Result<serde_json::Value, JoseError> {
    let header_bytes = b64d(header_b64)?;
    serde_json::from_slice(&header_bytes).map_err(|e| JoseError::Format(e.to_string()))
}

fn expect_algorithms(header: &serde_json::Value, alg: &str) -> Result<(), JoseError> {
    let actual_alg = header["alg"]
        .as_str()
        .ok_or_else(|| JoseError::Format("missing alg in header".into()))?;
    let enc = header["enc"]
        .as_str()
        .ok_or_else(|| JoseError::Format("missing enc in header".into()))?;
    if actual_alg != alg {
        return Err(JoseError::UnsupportedAlgorithm(format!(
            "alg: expected {alg}, got {actual_alg}"
        )));
    }
    if enc != "A256GCM" {
        return Err(JoseError::UnsupportedAlgorithm(format!(
            "enc: expected A256GCM, got {enc}"
        )));
    }
    Ok(())
}

fn gcm_decrypt(
    key: &[u8; CEK_LENGTH],
    header_b64: &str,
    iv_b64: &str,
    ciphertext_b64: &str,
    tag_b64: &str,
) -> Result<Vec<u8>, JoseError> {
    let iv = b64d(iv_b64)?;
    if iv.len() != 12 {
        return Err(JoseError::Format(format!(
            "expected 12-byte IV, got {}",
            iv.len()
        )));
    }
    let mut ct_with_tag = b64d(ciphertext_b64)?;
    ct_with_tag.extend_from_slice(&b64d(tag_b64)?);

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| JoseError::DecryptionFailed(format!("AES-GCM init: {e:?}")))?;
    let payload = aes_gcm::aead::Payload {
        msg: &ct_with_tag,
        aad: header_b64.as_bytes(),
    };
    cipher
        .decrypt(Nonce::from_slice(&iv), payload)
        .map_err(|e| JoseError::DecryptionFailed(format!("AES-GCM decrypt: {e:?}")))
}

/// Concat KDF (NIST SP 800-56A, single-pass for <= 256 bits).
///
/// SHA-256(00000001 || Z || [len(alg)][alg] || [0] || [0] || [keydatalen])
fn concat_kdf(z: &[u8], alg: &str, key_data_len_bits: u32) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(1u32.to_be_bytes());
    hasher.update(z);
    hasher.update((alg.len() as u32).to_be_bytes());
    hasher.update(alg.as_bytes());
    hasher.update(0u32.to_be_bytes());
    hasher.update(0u32.to_be_bytes());
    hasher.update(key_data_len_bits.to_be_bytes());
    hasher.finalize().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_keypair() -> (p256::SecretKey, PublicKey) {
        let secret = p256::SecretKey::random(&mut p256::elliptic_curve::rand_core::OsRng);
        let public = secret.public_key();
        (secret, public)
    }

    #[test]
    fn ecdh_encrypt_decrypt_round_trip() {
        let (secret, public) = test_keypair();
        let jwe = encrypt_to_key(b"hello provider", &public).unwrap();
        assert_eq!(jwe.split('.').count(), 5);
        let plaintext = decrypt_with_key(&jwe, &secret).unwrap();
        assert_eq!(plaintext, b"hello provider");
    }

    #[test]
    fn ecdh_wrong_key_fails() {
        let (_, public) = test_keypair();
        let (wrong_secret, _) = test_keypair();
        let jwe = encrypt_to_key(b"secret", &public).unwrap();
        assert!(decrypt_with_key(&jwe, &wrong_secret).is_err());
    }

    #[test]
    fn direct_encrypt_decrypt_round_trip() {
        let key = [7u8; 32];
        let jwe = encrypt_direct(b"bearer-token", &key).unwrap();
        assert_eq!(jwe.split('.').count(), 5);
        assert!(jwe.split('.').nth(1).unwrap().is_empty());
        assert_eq!(decrypt_direct(&jwe, &key).unwrap(), b"bearer-token");
    }

    #[test]
    fn direct_wrong_key_fails() {
        let jwe = encrypt_direct(b"bearer-token", &[7u8; 32]).unwrap();
        assert!(matches!(
            decrypt_direct(&jwe, &[8u8; 32]),
            Err(JoseError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let key = [3u8; 32];
        let jwe = encrypt_direct(b"payload", &key).unwrap();
        let parts: Vec<&str> = jwe.split('.').collect();
        let mut ct = b64d(parts[3]).unwrap();
        ct[0] ^= 0xff;
        let tampered = format!("{}..{}.{}.{}", parts[0], parts[2], b64(&ct), parts[4]);
        assert!(decrypt_direct(&tampered, &key).is_err());
    }

    #[test]
    fn rejects_malformed_compact_forms() {
        let key = [0u8; 32];
        assert!(decrypt_direct("not-a-jwe", &key).is_err());
        assert!(decrypt_direct("a.b.c", &key).is_err());
        assert!(decrypt_direct("a.b.c.d.e.f", &key).is_err());
    }

    #[test]
    fn token_expiry_reads_exp_claim() {
        let payload = serde_json::json!({ "exp": 1_700_000_000, "sub": "x" });
        let token = format!(
            "{}.{}.{}",
            b64(br#"{"alg":"BP256R1"}"#),
            b64(payload.to_string().as_bytes()),
            b64(&[0u8; 64]),
        );
        let exp = token_expiry(&token).unwrap();
        assert_eq!(exp.unix_timestamp(), 1_700_000_000);
    }

    #[test]
    fn token_expiry_rejects_missing_claim() {
        let token = format!(
            "{}.{}.{}",
            b64(br#"{"alg":"BP256R1"}"#),
            b64(br#"{"sub":"x"}"#),
            b64(&[0u8; 64]),
        );
        assert!(token_expiry(&token).is_err());
        assert!(token_expiry("opaque").is_err());
    }

    #[test]
    fn jwk_round_trip() {
        let (_, public) = test_keypair();
        let jwk = export_public_jwk(&public);
        let imported = import_public_jwk(&jwk).unwrap();
        assert_eq!(imported, public);
    }

    #[test]
    fn concat_kdf_is_deterministic_32_bytes() {
        let z = [42u8; 32];
        let r1 = concat_kdf(&z, "A256KW", 256);
        let r2 = concat_kdf(&z, "A256KW", 256);
        assert_eq!(r1, r2);
        assert_eq!(r1.len(), 32);
    }
}
