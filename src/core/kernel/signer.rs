use crate::core::errors::GatewayError;
use base64::engine::general_purpose;
use base64::Engine;
use ed25519_dalek::{Signature, Signer as Ed25519SignerTrait, SigningKey, Verifier, VerifyingKey};
use zeroize::Zeroizing;

/// Signer trait for payload authentication
///
/// Implementations sign arbitrary payload bytes and expose the public half
/// of their key so the peer can verify.
pub trait Signer: Send + Sync {
    /// Sign `payload` and return the base64-encoded signature
    fn sign_payload(&self, payload: &[u8]) -> String;

    /// Raw public key bytes
    fn public_key_bytes(&self) -> Vec<u8>;

    /// Base64-encoded raw public key
    fn public_key_base64(&self) -> String {
        general_purpose::STANDARD.encode(self.public_key_bytes())
    }
}

/// Ed25519 signer
pub struct Ed25519Signer {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl Ed25519Signer {
    /// Create a new Ed25519 signer from a base64-encoded 32-byte private key
    ///
    /// # Arguments
    /// * `private_key` - Base64-encoded private key bytes
    pub fn new(private_key: &str) -> Result<Self, GatewayError> {
        let key_bytes = Zeroizing::new(
            general_purpose::STANDARD
                .decode(private_key.trim())
                .map_err(|e| GatewayError::AuthError(format!("Invalid private key format: {}", e)))?,
        );

        let seed: [u8; 32] = key_bytes.as_slice().try_into().map_err(|_| {
            GatewayError::AuthError(format!(
                "Invalid private key length: expected 32 bytes, got {}",
                key_bytes.len()
            ))
        })?;

        Ok(Self::from_seed(&Zeroizing::new(seed)))
    }

    /// Create a signer from raw seed bytes
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Base64-encoded private key seed, for persistence
    pub fn private_key_base64(&self) -> Zeroizing<String> {
        Zeroizing::new(general_purpose::STANDARD.encode(self.signing_key.to_bytes()))
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying_key
    }
}

impl Signer for Ed25519Signer {
    fn sign_payload(&self, payload: &[u8]) -> String {
        let signature = Ed25519SignerTrait::sign(&self.signing_key, payload);
        general_purpose::STANDARD.encode(signature.to_bytes())
    }

    fn public_key_bytes(&self) -> Vec<u8> {
        self.verifying_key.to_bytes().to_vec()
    }
}

/// Verify a base64 Ed25519 signature against a base64 raw public key
pub fn verify_ed25519(
    public_key_b64: &str,
    payload: &[u8],
    signature_b64: &str,
) -> Result<(), GatewayError> {
    let key_bytes = general_purpose::STANDARD
        .decode(public_key_b64)
        .map_err(|e| GatewayError::AuthError(format!("Invalid public key encoding: {}", e)))?;
    let key_bytes: [u8; 32] = key_bytes
        .as_slice()
        .try_into()
        .map_err(|_| GatewayError::AuthError("Invalid public key length".to_string()))?;
    let verifying_key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| GatewayError::AuthError(format!("Invalid public key: {}", e)))?;

    let sig_bytes = general_purpose::STANDARD
        .decode(signature_b64)
        .map_err(|e| GatewayError::AuthError(format!("Invalid signature encoding: {}", e)))?;
    let signature = Signature::from_slice(&sig_bytes)
        .map_err(|e| GatewayError::AuthError(format!("Invalid signature: {}", e)))?;

    verifying_key
        .verify(payload, &signature)
        .map_err(|e| GatewayError::AuthError(format!("Signature verification failed: {}", e)))
}
