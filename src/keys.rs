use base64::{engine::general_purpose, Engine as _};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{Error, Result};

/// Base64 private/public key pair, as WireGuard prints them.
#[derive(Debug, Clone)]
pub struct KeyPair {
    pub private_b64: String,
    pub public_b64: String,
}

/**
 * @brief Generate a fresh X25519 key pair.
 * @return Base64-encoded private and public keys.
 */
pub fn generate_key_pair() -> KeyPair {
    let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
    let public = PublicKey::from(&secret);
    KeyPair {
        private_b64: general_purpose::STANDARD.encode(secret.to_bytes()),
        public_b64: general_purpose::STANDARD.encode(public.as_bytes()),
    }
}

/**
 * @brief Decode a Base64 key into its 32 raw bytes.
 * @param b64 Base64-encoded key.
 */
pub fn decode_key(b64: &str) -> Result<[u8; 32]> {
    let bytes = general_purpose::STANDARD
        .decode(b64.trim())
        .map_err(|e| Error::validation(format!("key is not valid base64: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| Error::validation("key must decode to 32 bytes"))
}

/**
 * @brief Derive the Base64 public key that belongs to a private key.
 * @param private_b64 Base64-encoded private key.
 */
pub fn public_key_from_private(private_b64: &str) -> Result<String> {
    let secret = StaticSecret::from(decode_key(private_b64)?);
    let public = PublicKey::from(&secret);
    Ok(general_purpose::STANDARD.encode(public.as_bytes()))
}

/**
 * @brief Validate a Base64 public key decodes to 32 bytes.
 * @param b64 Base64-encoded public key.
 */
pub fn validate_public_key_b64(b64: &str) -> Result<()> {
    decode_key(b64).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_pair_is_consistent() {
        let pair = generate_key_pair();
        assert_eq!(public_key_from_private(&pair.private_b64).unwrap(), pair.public_b64);
        assert!(validate_public_key_b64(&pair.public_b64).is_ok());
    }

    #[test]
    fn short_key_is_rejected() {
        assert!(matches!(validate_public_key_b64("AAAA"), Err(Error::Validation(_))));
        assert!(validate_public_key_b64("not base64!").is_err());
    }
}
