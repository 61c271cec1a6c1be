//! Authenticated identity of the logged in user.
//!
//! The identity is issued by the account backend (login or registration) and
//! consists of an opaque user ID and the user's Ed25519 secret key. It lives
//! exactly as long as the session that was started with it.

use super::CommandError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ed25519_dalek::{Signer, SigningKey};
use std::fmt;

/// Device IDs of real devices fit in 32 bits; dummy devices live above.
pub const DUMMY_DEVICE_ID_OFFSET: u64 = 1 << 32;

/// Source of identities. Login, registration and password handling live
/// behind this seam.
pub trait IdentityProvider {
    fn identity(&self) -> Result<Identity, CommandError>;
}

pub struct Identity {
    user_id: String,
    signing_key: SigningKey,
}

impl Identity {
    pub fn new(user_id: &str, signing_key: SigningKey) -> Result<Self, CommandError> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(CommandError::EmptyUserId);
        }
        Ok(Self {
            user_id: user_id.to_string(),
            signing_key,
        })
    }

    /// Decodes a standard base64 secret key as handed out by the backend.
    ///
    /// Accepts the 64 byte libsodium layout (seed followed by public key) as
    /// well as a bare 32 byte seed.
    pub fn from_base64_key(user_id: &str, private_key: &str) -> Result<Self, CommandError> {
        let private_key = private_key.trim();
        if private_key.is_empty() {
            return Err(CommandError::MissingKey(user_id.trim().to_string()));
        }

        let bytes = STANDARD.decode(private_key)?;
        let signing_key = match bytes.len() {
            64 => {
                let mut keypair = [0u8; 64];
                keypair.copy_from_slice(&bytes);
                SigningKey::from_keypair_bytes(&keypair)?
            }
            32 => {
                let mut seed = [0u8; 32];
                seed.copy_from_slice(&bytes);
                SigningKey::from_bytes(&seed)
            }
            other => return Err(CommandError::KeyLength(other)),
        };

        Self::new(user_id, signing_key)
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Base64 encoded detached signature over the UTF-8 bytes of `message`.
    pub fn sign(&self, message: &str) -> String {
        let signature = self.signing_key.sign(message.as_bytes());
        STANDARD.encode(signature.to_bytes())
    }

    pub fn verifying_key(&self) -> ed25519_dalek::VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// ID of the device registered on behalf of this client: `2^32 + userID`.
    pub fn dummy_device_id(&self) -> Result<u64, CommandError> {
        let numeric = self
            .user_id
            .parse::<u64>()
            .map_err(|_| CommandError::NonNumericUserId(self.user_id.clone()))?;
        if numeric >= DUMMY_DEVICE_ID_OFFSET {
            return Err(CommandError::UserIdOutOfRange(numeric));
        }
        Ok(DUMMY_DEVICE_ID_OFFSET + numeric)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signature, Verifier};

    fn key() -> SigningKey {
        SigningKey::from_bytes(&[7u8; 32])
    }

    #[test]
    fn test_dummy_device_id() {
        let identity = Identity::new("7", key()).unwrap();
        assert_eq!(identity.dummy_device_id().unwrap(), 4_294_967_303);
        assert!(identity.dummy_device_id().unwrap() >= DUMMY_DEVICE_ID_OFFSET);
    }

    #[test]
    fn test_dummy_device_id_requires_numeric_user() {
        let identity = Identity::new("alice", key()).unwrap();
        assert!(matches!(
            identity.dummy_device_id(),
            Err(CommandError::NonNumericUserId(_))
        ));

        let identity = Identity::new("4294967296", key()).unwrap();
        assert!(matches!(
            identity.dummy_device_id(),
            Err(CommandError::UserIdOutOfRange(_))
        ));
    }

    #[test]
    fn test_user_id_is_trimmed() {
        let identity = Identity::new(" 12 \n", key()).unwrap();
        assert_eq!(identity.user_id(), "12");
        assert!(Identity::new("  ", key()).is_err());
    }

    #[test]
    fn test_accepts_libsodium_and_seed_keys() {
        let signing_key = key();
        let keypair = STANDARD.encode(signing_key.to_keypair_bytes());
        let seed = STANDARD.encode(signing_key.to_bytes());

        let from_keypair = Identity::from_base64_key("1", &keypair).unwrap();
        let from_seed = Identity::from_base64_key("1", &seed).unwrap();
        assert_eq!(from_keypair.verifying_key(), from_seed.verifying_key());
    }

    #[test]
    fn test_rejects_bad_key_material() {
        assert!(matches!(
            Identity::from_base64_key("1", ""),
            Err(CommandError::MissingKey(_))
        ));
        assert!(matches!(
            Identity::from_base64_key("1", "%%%"),
            Err(CommandError::KeyEncoding(_))
        ));
        assert!(matches!(
            Identity::from_base64_key("1", &STANDARD.encode([1u8; 16])),
            Err(CommandError::KeyLength(16))
        ));
    }

    #[test]
    fn test_signature_verifies() {
        let identity = Identity::new("1", key()).unwrap();
        let encoded = identity.sign("1abcshelly{}1700000000");
        let bytes = STANDARD.decode(encoded).unwrap();
        let signature = Signature::from_slice(&bytes).unwrap();
        assert!(identity
            .verifying_key()
            .verify(b"1abcshelly{}1700000000", &signature)
            .is_ok());
    }
}
