// Key Management and Signing
//
// secp256k1 ECDSA over 32-byte header/transaction digests. Public keys are
// 33-byte SEC1 compressed points; signatures are 64-byte fixed (r || s).
// The miner identity used by plots is the 32-byte address derived below.

use k256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use std::path::Path;

use super::hash::hash_sha256;

pub const PUBLIC_KEY_BYTES: usize = 33;
pub const SIGNATURE_BYTES: usize = 64;
pub const ADDRESS_BYTES: usize = 32;

pub type PublicKey = [u8; PUBLIC_KEY_BYTES];
pub type SignatureBytes = [u8; SIGNATURE_BYTES];
pub type Address = [u8; ADDRESS_BYTES];

/// Derives the account address from a compressed public key.
/// Rule: address = SHA-256(public_key). Also the 32-byte miner id that
/// plot files are bound to.
pub fn derive_address(pk: &PublicKey) -> Address {
    hash_sha256(pk)
}

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("invalid secret key material")]
    InvalidSecretKey,
    #[error("invalid public key encoding")]
    InvalidPublicKey,
    #[error("signing failed")]
    SigningFailed,
    #[error("key file: {0}")]
    Io(#[from] std::io::Error),
    #[error("key file is not 32 hex-encoded bytes")]
    MalformedKeyFile,
}

/// Verify a 64-byte signature over a 32-byte digest. Malformed keys or
/// signatures simply fail verification; they are peer-supplied data.
pub fn verify_signature(digest: &[u8; 32], sig: &SignatureBytes, pk: &PublicKey) -> bool {
    let Ok(key) = VerifyingKey::from_sec1_bytes(pk) else {
        return false;
    };
    let Ok(sig) = Signature::from_slice(sig) else {
        return false;
    };
    key.verify_prehash(digest, &sig).is_ok()
}

/// Signing seam consumed by the block builder and the miner loop.
/// The production implementation is [`Secp256k1Signer`]; [`MockSigner`]
/// exists for tests and is refused at miner boot without an explicit
/// `SPACETIME_ALLOW_MOCK_SIGNER=1` override.
pub trait Signer: Send + Sync {
    fn sign(&self, digest: &[u8; 32]) -> Result<SignatureBytes, KeyError>;
    fn public_key(&self) -> PublicKey;
    fn is_mock(&self) -> bool {
        false
    }
}

pub struct Secp256k1Signer {
    key: SigningKey,
    public: PublicKey,
}

impl Secp256k1Signer {
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Result<Self, KeyError> {
        let key = SigningKey::from_slice(secret).map_err(|_| KeyError::InvalidSecretKey)?;
        let point = key.verifying_key().to_encoded_point(true);
        let mut public = [0u8; PUBLIC_KEY_BYTES];
        public.copy_from_slice(point.as_bytes());
        Ok(Secp256k1Signer { key, public })
    }

    /// Fresh random keypair from the OS CSRNG.
    pub fn generate() -> Result<Self, KeyError> {
        // Rejection-sample until the scalar is in range; overwhelmingly
        // the first draw succeeds.
        for _ in 0..64 {
            let mut secret = [0u8; 32];
            getrandom::getrandom(&mut secret).map_err(|_| KeyError::InvalidSecretKey)?;
            if let Ok(signer) = Self::from_secret_bytes(&secret) {
                return Ok(signer);
            }
        }
        Err(KeyError::InvalidSecretKey)
    }

    /// Loads the hex-encoded secret key from `path`, generating and
    /// persisting a new one if the file does not exist yet.
    pub fn load_or_generate(path: &Path) -> Result<Self, KeyError> {
        if path.exists() {
            let text = std::fs::read_to_string(path)?;
            let raw = hex::decode(text.trim()).map_err(|_| KeyError::MalformedKeyFile)?;
            let secret: [u8; 32] = raw.try_into().map_err(|_| KeyError::MalformedKeyFile)?;
            return Self::from_secret_bytes(&secret);
        }
        let signer = Self::generate()?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, hex::encode(signer.key.to_bytes()))?;
        Ok(signer)
    }

    pub fn address(&self) -> Address {
        derive_address(&self.public)
    }
}

impl Signer for Secp256k1Signer {
    fn sign(&self, digest: &[u8; 32]) -> Result<SignatureBytes, KeyError> {
        let sig: Signature = self
            .key
            .sign_prehash(digest)
            .map_err(|_| KeyError::SigningFailed)?;
        let mut out = [0u8; SIGNATURE_BYTES];
        out.copy_from_slice(&sig.to_bytes());
        Ok(out)
    }

    fn public_key(&self) -> PublicKey {
        self.public
    }
}

/// Accepts everything, signs nothing real. Test/dev only.
pub struct MockSigner;

impl Signer for MockSigner {
    fn sign(&self, _digest: &[u8; 32]) -> Result<SignatureBytes, KeyError> {
        Ok([0u8; SIGNATURE_BYTES])
    }

    fn public_key(&self) -> PublicKey {
        let mut pk = [0u8; PUBLIC_KEY_BYTES];
        pk[0] = 0x02; // well-formed compressed-point prefix
        pk
    }

    fn is_mock(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_roundtrip() {
        let signer = Secp256k1Signer::from_secret_bytes(&[7u8; 32]).unwrap();
        let digest = hash_sha256(b"header");
        let sig = signer.sign(&digest).unwrap();
        assert!(verify_signature(&digest, &sig, &signer.public_key()));
    }

    #[test]
    fn test_tampered_signature_rejected() {
        let signer = Secp256k1Signer::from_secret_bytes(&[7u8; 32]).unwrap();
        let digest = hash_sha256(b"header");
        let mut sig = signer.sign(&digest).unwrap();
        sig[10] ^= 0xFF;
        assert!(!verify_signature(&digest, &sig, &signer.public_key()));
    }

    #[test]
    fn test_wrong_digest_rejected() {
        let signer = Secp256k1Signer::from_secret_bytes(&[7u8; 32]).unwrap();
        let sig = signer.sign(&hash_sha256(b"one")).unwrap();
        assert!(!verify_signature(&hash_sha256(b"two"), &sig, &signer.public_key()));
    }

    #[test]
    fn test_address_derivation_deterministic() {
        let signer = Secp256k1Signer::from_secret_bytes(&[9u8; 32]).unwrap();
        assert_eq!(signer.address(), derive_address(&signer.public_key()));
        assert_eq!(signer.address().len(), ADDRESS_BYTES);
    }

    #[test]
    fn test_key_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("miner.key");
        let first = Secp256k1Signer::load_or_generate(&path).unwrap();
        let second = Secp256k1Signer::load_or_generate(&path).unwrap();
        assert_eq!(first.public_key(), second.public_key());
    }

    #[test]
    fn test_garbage_public_key_fails_closed() {
        let digest = hash_sha256(b"x");
        assert!(!verify_signature(&digest, &[0u8; 64], &[0xFFu8; 33]));
    }
}
