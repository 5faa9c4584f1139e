#![doc = include_str!("../README.md")]

pub mod config;
pub mod crypto;
pub mod error;
pub mod jose;
pub mod pairing;
pub mod pkce;
pub mod protocol;
pub mod session;
pub mod store;
pub mod types;

// Re-exports for convenient access
pub use config::{IdpConfiguration, IdpConfigurationStore};
pub use crypto::{ChallengeSigner, SecureElementSigner, SignerError};
pub use error::{IdpError, StoreError};
pub use pairing::PairingProtocol;
pub use pkce::{generate_code_challenge, generate_code_verifier, generate_state};
pub use protocol::{IdpProtocol, ProtocolOutcome};
pub use session::IdpSession;
pub use store::{AuthenticationStore, ConfigurationStore, MemoryStore};
pub use types::{
    AccessToken, AuthenticationData, AuthenticationScope, CardAccessNumber, DeviceInformation,
    KeyAlias, PairingEntry, ProfileId, SingleSignOnToken,
};
