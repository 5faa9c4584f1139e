/// Error raised by a consumer-implemented store.
pub type StoreError = Box<dyn std::error::Error + Send + Sync>;

/// Protocol-level errors surfaced by every public operation.
///
/// Each variant maps to a distinct, actionable situation for the caller:
/// re-tap the card, re-enter credentials, check connectivity, or re-pair
/// the device. Nothing in here carries key material.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum IdpError {
    /// The discovery document is expired, future-dated, or malformed.
    /// One automatic invalidate-and-refetch has already been attempted.
    #[error("identity provider configuration invalid: {0}")]
    ConfigurationInvalid(String),

    /// Transport failure while fetching the discovery document or the
    /// provider's public keys.
    #[error("identity provider configuration unreachable: {0}")]
    ConfigurationUnreachable(String),

    /// The provider rejected the signed challenge or the code exchange
    /// (wrong card, wrong key, clock skew). Never retried automatically;
    /// a 5xx status still counts as retryable for the caller.
    #[error("identity provider rejected the request (status {status}): {detail}")]
    ChallengeRejected { status: u16, detail: String },

    /// The encrypted access token could not be decrypted. Always fatal;
    /// treated as a configuration/key-mismatch signal.
    #[error("access token decryption failed: {0}")]
    DecryptionFailed(String),

    /// Alternate login was attempted but no pairing is registered for
    /// the profile.
    #[error("no paired device registered for this profile")]
    NotPaired,

    /// The pairing endpoint rejected a registration, listing, or deletion.
    #[error("pairing request rejected (status {status}): {detail}")]
    PairingRejected { status: u16, detail: String },

    /// No valid session exists for an operation that needs a bearer token.
    /// The caller must authenticate first; no implicit re-login happens.
    #[error("session expired or not established")]
    SessionExpired,

    /// Network-layer failure (timeout, connection reset). Retryable at the
    /// caller's discretion; challenges are single-use, so nothing below
    /// the use case retries on its own.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// A consumer-provided store failed.
    #[error("store error: {0}")]
    Storage(#[source] StoreError),

    /// The challenge signer (health card or secure element) failed.
    #[error("challenge signing failed: {0}")]
    Signature(String),

    /// A card access number failed validation (6-8 ASCII digits).
    #[error("invalid card access number: {0}")]
    InvalidCardAccessNumber(String),
}

impl IdpError {
    /// Whether the caller may meaningfully retry the same operation.
    ///
    /// Transport-level failures and provider-side 5xx responses qualify;
    /// cryptographic and configuration rejections need user action first.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::ConfigurationUnreachable(_) => true,
            Self::ChallengeRejected { status, .. } | Self::PairingRejected { status, .. } => {
                *status >= 500
            }
            _ => false,
        }
    }

    pub(crate) fn storage(e: StoreError) -> Self {
        Self::Storage(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_matches_taxonomy() {
        assert!(IdpError::ConfigurationUnreachable("down".into()).is_retryable());
        assert!(!IdpError::ConfigurationInvalid("expired".into()).is_retryable());
        assert!(!IdpError::DecryptionFailed("bad tag".into()).is_retryable());
        assert!(!IdpError::NotPaired.is_retryable());
        assert!(!IdpError::ChallengeRejected {
            status: 400,
            detail: "invalid signature".into()
        }
        .is_retryable());
    }

    #[test]
    fn provider_5xx_is_retryable() {
        assert!(IdpError::ChallengeRejected {
            status: 503,
            detail: "maintenance".into()
        }
        .is_retryable());
        assert!(IdpError::PairingRejected {
            status: 502,
            detail: "bad gateway".into()
        }
        .is_retryable());
        assert!(!IdpError::PairingRejected {
            status: 409,
            detail: "alias exists".into()
        }
        .is_retryable());
    }
}
