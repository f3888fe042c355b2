//! Cryptographic collaborators: the CA public key registry and the two
//! primitives offline data authentication needs.
//!
//! The kernel never does maths on its own behalf; everything goes through
//! the [`Crypto`] trait so integrations can substitute hardware or a
//! certified library. [`SoftCrypto`] is the batteries-included software
//! implementation: textbook RSA recovery (EMV signatures are plain
//! modular exponentiation, no OAEP/PSS here) capped at the 1984-bit
//! moduli EMV allows, and SHA-1, which is what EMV 4.4 still mandates for
//! offline authentication.

use std::collections::HashMap;

use crypto_bigint::modular::runtime_mod::{DynResidue, DynResidueParams};
use crypto_bigint::{Encoding, U2048};
use sha1::{Digest, Sha1};
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    /// An EMV signature is exactly as long as the modulus that made it.
    #[error("signature length does not match the modulus")]
    SignatureLengthMismatch,
    #[error("modulus longer than the EMV maximum")]
    ModulusTooLarge,
    #[error("modulus is not an odd number")]
    ModulusNotOdd,
    #[error("exponent longer than the modulus arithmetic supports")]
    ExponentTooLarge,
}

/// An RSA public key as EMV ships it: raw big-endian modulus and exponent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    pub modulus: Vec<u8>,
    pub exponent: Vec<u8>,
}

impl PublicKey {
    pub fn new<M: Into<Vec<u8>>, E: Into<Vec<u8>>>(modulus: M, exponent: E) -> Self {
        PublicKey {
            modulus: modulus.into(),
            exponent: exponent.into(),
        }
    }

    /// Key length in bytes; also the length of anything it signed.
    pub fn byte_len(&self) -> usize {
        self.modulus.len()
    }
}

/// Registry ID: the first five AID bytes, naming the payment system.
pub type Rid = [u8; 5];

/// Read-only registry of certification authority public keys, loaded once
/// at startup and keyed by (RID, CA public key index).
#[derive(Debug, Clone, Default)]
pub struct CaKeyDb {
    keys: HashMap<(Rid, u8), PublicKey>,
}

impl CaKeyDb {
    pub fn new() -> Self {
        CaKeyDb::default()
    }

    pub fn insert(&mut self, rid: Rid, index: u8, key: PublicKey) {
        self.keys.insert((rid, index), key);
    }

    pub fn lookup(&self, rid: Rid, index: u8) -> Option<&PublicKey> {
        self.keys.get(&(rid, index))
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl FromIterator<(Rid, u8, PublicKey)> for CaKeyDb {
    fn from_iter<T: IntoIterator<Item = (Rid, u8, PublicKey)>>(iter: T) -> Self {
        let mut db = CaKeyDb::new();
        for (rid, index, key) in iter {
            db.insert(rid, index, key);
        }
        db
    }
}

/// The primitives the ODA engine runs on. Both operations are pure; the
/// unpredictable number generator is the only stateful member.
pub trait Crypto {
    /// Recover the plaintext of an EMV signature: `signature ^ exponent
    /// mod modulus`, returned at exactly the modulus length.
    fn rsa_recover(&self, key: &PublicKey, signature: &[u8]) -> Result<Vec<u8>, CryptoError>;

    fn sha1(&self, data: &[u8]) -> [u8; 20];

    /// Four cryptographically random bytes for tag 9F37.
    fn unpredictable_number(&mut self) -> [u8; 4];
}

/// Software implementation over `crypto-bigint` fixed 2048-bit arithmetic,
/// which covers the EMV maximum of 248-byte moduli.
#[derive(Debug, Default, Clone, Copy)]
pub struct SoftCrypto;

const WIDTH: usize = U2048::BYTES;

fn to_uint(bytes: &[u8]) -> Result<U2048, CryptoError> {
    if bytes.len() > WIDTH {
        return Err(CryptoError::ModulusTooLarge);
    }
    let mut padded = [0u8; WIDTH];
    padded[WIDTH - bytes.len()..].copy_from_slice(bytes);
    Ok(U2048::from_be_slice(&padded))
}

impl Crypto for SoftCrypto {
    fn rsa_recover(&self, key: &PublicKey, signature: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if signature.len() != key.modulus.len() {
            return Err(CryptoError::SignatureLengthMismatch);
        }
        // Montgomery arithmetic needs an odd modulus; RSA moduli are.
        if key.modulus.last().map_or(true, |b| b & 1 == 0) {
            return Err(CryptoError::ModulusNotOdd);
        }
        let modulus = to_uint(&key.modulus)?;
        let exponent = to_uint(&key.exponent).map_err(|_| CryptoError::ExponentTooLarge)?;
        let base = to_uint(signature)?;

        let params = DynResidueParams::new(&modulus);
        let recovered = DynResidue::new(&base, params).pow(&exponent).retrieve();

        let bytes = recovered.to_be_bytes();
        Ok(bytes[WIDTH - key.modulus.len()..].to_vec())
    }

    fn sha1(&self, data: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    fn unpredictable_number(&mut self) -> [u8; 4] {
        rand::random()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rsa_recover_textbook() {
        // n = 61 * 53 = 3233, e = 17, d = 2753: 65^17 mod 3233 = 2790,
        // so recovering 2790 must give 65 back.
        let key = PublicKey::new(vec![0x0C, 0xA1], vec![0x11]);
        let plain = SoftCrypto.rsa_recover(&key, &[0x0A, 0xE6]).unwrap();
        assert_eq!(plain, vec![0x00, 0x41]);
    }

    #[test]
    fn rsa_recover_checks_signature_length() {
        let key = PublicKey::new(vec![0x0C, 0xA1], vec![0x11]);
        assert_eq!(
            SoftCrypto.rsa_recover(&key, &[0x0A]),
            Err(CryptoError::SignatureLengthMismatch)
        );
    }

    #[test]
    fn rsa_recover_rejects_even_modulus() {
        let key = PublicKey::new(vec![0x0C, 0xA0], vec![0x11]);
        assert_eq!(
            SoftCrypto.rsa_recover(&key, &[0x0A, 0xE6]),
            Err(CryptoError::ModulusNotOdd)
        );
    }

    #[test]
    fn sha1_test_vector() {
        assert_eq!(
            SoftCrypto.sha1(b"abc"),
            [
                0xA9, 0x99, 0x3E, 0x36, 0x47, 0x06, 0x81, 0x6A, 0xBA, 0x3E, 0x25, 0x71, 0x78,
                0x50, 0xC2, 0x6C, 0x9C, 0xD0, 0xD8, 0x9D,
            ]
        );
    }

    #[test]
    fn unpredictable_numbers_vary() {
        let mut crypto = SoftCrypto;
        let first = crypto.unpredictable_number();
        let varied = (0..4).any(|_| crypto.unpredictable_number() != first);
        assert!(varied, "five identical 32-bit draws in a row");
    }

    #[test]
    fn key_db_lookup() {
        let rid: Rid = [0xA0, 0x00, 0x00, 0x00, 0x04];
        let db: CaKeyDb = [(rid, 0x05, PublicKey::new(vec![0x0C, 0xA1], vec![0x03]))]
            .into_iter()
            .collect();
        assert!(db.lookup(rid, 0x05).is_some());
        assert!(db.lookup(rid, 0x06).is_none());
        assert!(db.lookup([0xA0, 0x00, 0x00, 0x01, 0x52], 0x05).is_none());
    }
}
