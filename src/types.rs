use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::IdpError;
use crate::jose;

/// Opaque per-user profile identifier.
///
/// Every token and pairing record is keyed by profile; the consumer chooses
/// the format (ULID, UUID, etc.).
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into,
)]
#[serde(transparent)]
pub struct ProfileId(pub String);

impl ProfileId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Secure-element key alias registered with the identity provider.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into,
)]
#[serde(transparent)]
pub struct KeyAlias(pub String);

impl KeyAlias {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Validated card access number (CAN) printed on the health card.
///
/// Guaranteed valid by construction: 6 to 8 ASCII digits. Use
/// `"123456".parse::<CardAccessNumber>()` or `try_from` to create one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CardAccessNumber(String);

impl CardAccessNumber {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CardAccessNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for CardAccessNumber {
    type Err = IdpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(s.to_owned())
    }
}

impl TryFrom<String> for CardAccessNumber {
    type Error = IdpError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        if (6..=8).contains(&s.len()) && s.bytes().all(|b| b.is_ascii_digit()) {
            Ok(Self(s))
        } else {
            Err(IdpError::InvalidCardAccessNumber(format!(
                "expected 6-8 digits, got {} characters",
                s.len()
            )))
        }
    }
}

impl From<CardAccessNumber> for String {
    fn from(can: CardAccessNumber) -> Self {
        can.0
    }
}

/// Signed single-sign-on token issued by the identity provider.
///
/// Opaque `header.payload.signature` string. Only the embedded `exp` claim
/// is ever read; everything else is forwarded verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SingleSignOnToken(String);

impl SingleSignOnToken {
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Expiry instant embedded in the token payload, if parseable.
    #[must_use]
    pub fn expires_at(&self) -> Option<OffsetDateTime> {
        jose::token_expiry(&self.0).ok()
    }

    /// Whether the embedded expiry lies in the future.
    ///
    /// A token whose expiry cannot be read is treated as expired; a
    /// tampered-with or manufactured past expiry behaves exactly like an
    /// organically expired one.
    #[must_use]
    pub fn is_valid(&self, now: OffsetDateTime) -> bool {
        self.expires_at().is_some_and(|exp| exp > now)
    }
}

/// Short-lived decrypted bearer token for business API calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    pub token: String,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

impl AccessToken {
    #[must_use]
    pub fn is_valid(&self, now: OffsetDateTime) -> bool {
        self.expires_at > now
    }
}

/// Authentication state persisted per profile.
///
/// Exactly one variant is active per profile at a time; saving a new one
/// replaces the prior variant atomically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum AuthenticationData {
    /// Health-card-based session.
    DefaultToken {
        sso_token: SingleSignOnToken,
        card_access_number: CardAccessNumber,
        certificate: Vec<u8>,
    },
    /// Secure-element pairing with an active session.
    AlternateToken {
        sso_token: SingleSignOnToken,
        key_alias: KeyAlias,
        certificate: Vec<u8>,
    },
    /// Secure-element pairing registered, no active session. A fresh
    /// alternate login is required before any bearer-token use.
    AlternateWithoutToken {
        key_alias: KeyAlias,
        certificate: Vec<u8>,
    },
    /// Session established through a federated third-party authenticator.
    ExternalToken {
        sso_token: SingleSignOnToken,
        authenticator_id: String,
        authenticator_name: String,
    },
}

impl AuthenticationData {
    /// Active single-sign-on token, if the variant carries one.
    #[must_use]
    pub fn sso_token(&self) -> Option<&SingleSignOnToken> {
        match self {
            Self::DefaultToken { sso_token, .. }
            | Self::AlternateToken { sso_token, .. }
            | Self::ExternalToken { sso_token, .. } => Some(sso_token),
            Self::AlternateWithoutToken { .. } => None,
        }
    }

    /// Registered secure-element alias, if the variant is an alternate one.
    #[must_use]
    pub fn key_alias(&self) -> Option<&KeyAlias> {
        match self {
            Self::AlternateToken { key_alias, .. }
            | Self::AlternateWithoutToken { key_alias, .. } => Some(key_alias),
            _ => None,
        }
    }
}

/// Device metadata attached to every pairing registration for audit purposes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInformation {
    pub name: String,
    pub manufacturer: String,
    pub os: String,
    pub os_version: String,
}

/// A secure-element key registered with the identity provider.
///
/// Serde names follow the pairing-endpoint wire format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingEntry {
    #[serde(rename = "key_identifier")]
    pub key_alias: KeyAlias,
    #[serde(rename = "device_information")]
    pub device: DeviceInformation,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// OAuth scope requested for an authentication attempt.
///
/// The two scopes drive mutually exclusive flows and are never conflated:
/// `Default` yields a prescription-service session, `BiometricPairing`
/// yields a session only good for registering a secure-element key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthenticationScope {
    Default,
    BiometricPairing,
}

impl AuthenticationScope {
    #[must_use]
    pub fn as_scope_str(&self) -> &'static str {
        match self {
            Self::Default => "e-rezept openid",
            Self::BiometricPairing => "pairing openid",
        }
    }
}
