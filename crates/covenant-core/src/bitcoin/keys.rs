//! secp256k1 key handling.
//!
//! Wraps the `k256` signing types with the conventions the chain expects:
//! compressed SEC1 public keys, DER-encoded low-S signatures, and WIF
//! import/export for private keys. The secret scalar never appears in
//! `Debug` output.

use k256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use k256::ecdsa::{Signature as EcdsaSignature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use thiserror::Error;

use super::address::{Address, Network};
use super::hash::{double_sha256, hash160};

const WIF_MAIN: u8 = 0x80;
const WIF_TEST: u8 = 0xef;

/// Errors from key parsing and signing.
#[derive(Debug, Error)]
pub enum KeyError {
    /// A secret or public key did not parse.
    #[error("invalid key data")]
    InvalidKey,

    /// A WIF string failed to decode.
    #[error("invalid WIF encoding")]
    InvalidWif,

    /// A DER signature did not parse.
    #[error("invalid signature encoding")]
    InvalidSignature,

    /// Signing failed.
    #[error("signing failed")]
    SigningFailed,
}

/// A secp256k1 private key with the network it signs for.
#[derive(Clone)]
pub struct PrivateKey {
    signing: SigningKey,
    net: Network,
}

impl PrivateKey {
    /// Generates a fresh random key.
    #[must_use]
    pub fn generate(net: Network) -> Self {
        PrivateKey {
            signing: SigningKey::random(&mut OsRng),
            net,
        }
    }

    /// Builds a key from 32 secret bytes.
    pub fn from_bytes(bytes: &[u8], net: Network) -> Result<Self, KeyError> {
        let signing = SigningKey::from_slice(bytes).map_err(|_| KeyError::InvalidKey)?;
        Ok(PrivateKey { signing, net })
    }

    /// Imports a compressed-key WIF string.
    pub fn from_wif(wif: &str) -> Result<Self, KeyError> {
        let data = bs58::decode(wif)
            .into_vec()
            .map_err(|_| KeyError::InvalidWif)?;
        // version + 32 secret bytes + compressed marker + 4 checksum
        if data.len() != 38 {
            return Err(KeyError::InvalidWif);
        }
        let (payload, checksum) = data.split_at(data.len() - 4);
        if double_sha256(payload)[..4] != *checksum {
            return Err(KeyError::InvalidWif);
        }
        let net = match payload[0] {
            WIF_MAIN => Network::Main,
            WIF_TEST => Network::Test,
            _ => return Err(KeyError::InvalidWif),
        };
        if payload[33] != 0x01 {
            return Err(KeyError::InvalidWif);
        }
        Self::from_bytes(&payload[1..33], net)
    }

    /// Exports the compressed-key WIF string.
    #[must_use]
    pub fn to_wif(&self) -> String {
        let version = match self.net {
            Network::Main => WIF_MAIN,
            Network::Test => WIF_TEST,
        };
        let mut payload = Vec::with_capacity(38);
        payload.push(version);
        payload.extend_from_slice(&self.signing.to_bytes());
        payload.push(0x01);
        let checksum = double_sha256(&payload);
        payload.extend_from_slice(&checksum[..4]);
        bs58::encode(payload).into_string()
    }

    /// The network this key signs for.
    #[must_use]
    pub const fn network(&self) -> Network {
        self.net
    }

    /// The corresponding public key.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            verifying: *self.signing.verifying_key(),
        }
    }

    /// The P2PKH address of the public key.
    #[must_use]
    pub fn address(&self) -> Address {
        self.public_key().address(self.net)
    }

    /// Signs a 32-byte digest, normalizing to low-S form.
    pub fn sign(&self, digest: &[u8; 32]) -> Result<Signature, KeyError> {
        let sig: EcdsaSignature = self
            .signing
            .sign_prehash(digest)
            .map_err(|_| KeyError::SigningFailed)?;
        let sig = sig.normalize_s().unwrap_or(sig);
        Ok(Signature { inner: sig })
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKey")
            .field("net", &self.net)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// A secp256k1 public key (compressed SEC1 form on the wire).
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey {
    verifying: VerifyingKey,
}

impl PublicKey {
    /// Parses a SEC1 public key (compressed or uncompressed).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let verifying = VerifyingKey::from_sec1_bytes(bytes).map_err(|_| KeyError::InvalidKey)?;
        Ok(PublicKey { verifying })
    }

    /// The compressed SEC1 encoding (33 bytes).
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.verifying.to_encoded_point(true).as_bytes().to_vec()
    }

    /// The P2PKH address for this key on `net`.
    #[must_use]
    pub fn address(&self, net: Network) -> Address {
        Address::pkh(hash160(&self.to_bytes()), net)
    }

    /// Verifies a signature over a 32-byte digest.
    #[must_use]
    pub fn verify(&self, digest: &[u8; 32], signature: &Signature) -> bool {
        self.verifying.verify_prehash(digest, &signature.inner).is_ok()
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.to_bytes()))
    }
}

/// A DER-encodable ECDSA signature.
#[derive(Clone, PartialEq, Eq)]
pub struct Signature {
    inner: EcdsaSignature,
}

impl Signature {
    /// Parses a DER-encoded signature.
    pub fn from_der(bytes: &[u8]) -> Result<Self, KeyError> {
        let inner = EcdsaSignature::from_der(bytes).map_err(|_| KeyError::InvalidSignature)?;
        Ok(Signature { inner })
    }

    /// The DER encoding.
    #[must_use]
    pub fn to_der(&self) -> Vec<u8> {
        self.inner.to_der().as_bytes().to_vec()
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({})", hex::encode(self.to_der()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_key(seed: u8) -> PrivateKey {
        let mut bytes = [seed; 32];
        bytes[0] = 1; // keep the scalar in range
        PrivateKey::from_bytes(&bytes, Network::Test).unwrap()
    }

    #[test]
    fn wif_round_trip() {
        let key = fixed_key(0x42);
        let wif = key.to_wif();
        let back = PrivateKey::from_wif(&wif).unwrap();
        assert_eq!(back.network(), Network::Test);
        assert_eq!(back.address(), key.address());
    }

    #[test]
    fn wif_rejects_corruption() {
        let key = fixed_key(0x42);
        let mut wif = key.to_wif();
        let replacement = if wif.ends_with('1') { '2' } else { '1' };
        wif.pop();
        wif.push(replacement);
        assert!(PrivateKey::from_wif(&wif).is_err());
    }

    #[test]
    fn sign_verify_der_round_trip() {
        let key = fixed_key(0x07);
        let digest = double_sha256(b"message");
        let sig = key.sign(&digest).unwrap();

        let der = sig.to_der();
        let parsed = Signature::from_der(&der).unwrap();
        assert!(key.public_key().verify(&digest, &parsed));

        let other = double_sha256(b"other message");
        assert!(!key.public_key().verify(&other, &parsed));
    }

    #[test]
    fn debug_never_prints_secret() {
        let key = fixed_key(0x55);
        let text = format!("{key:?}");
        assert!(text.contains("redacted"));
        assert!(!text.contains(&hex::encode([0x55u8; 16])));
    }
}
