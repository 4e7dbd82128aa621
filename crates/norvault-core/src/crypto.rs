//! Crypto capability consumed by the storage engine
//!
//! The engine never calls a primitive directly; it goes through
//! [`CryptoProvider`] so a device build can route everything to its own
//! hardware-backed implementation. [`SoftwareCrypto`] is the host
//! implementation on RustCrypto crates.
//!
//! Node derivation follows SLIP-10: the master node is
//! `HMAC-SHA512(curve seed key, seed)` and private child derivation retries
//! with `0x01 || IR || index` when the tweak is out of range.

use std::fmt;
use std::str::FromStr;

use aes::cipher::block_padding::NoPadding;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyInit, KeyIvInit};
use hmac::{Hmac, Mac};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::elliptic_curve::{Field, PrimeField};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256, Sha512};
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::record::HdNode;
use crate::session::SEED_LEN;

/// PBKDF2 rounds for BIP-39 seeds and node passphrase keys
pub const PBKDF2_ROUNDS: u32 = 2048;

/// Seed derivation reports after every iteration
pub const SEED_PROGRESS_STEPS: u32 = PBKDF2_ROUNDS;

/// Stored node key derivation reports in eighths
pub const NODE_KEY_PROGRESS_STEPS: u32 = 8;

/// Hardened index bit
pub const HARDENED: u32 = 0x8000_0000;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Progress sink for long derivations: `(iteration, total)`
pub type Progress<'a> = &'a mut dyn FnMut(u32, u32);

/// Elliptic curves a root node can be derived for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Curve {
    Secp256k1,
    Nist256p1,
    Ed25519,
}

impl Curve {
    pub fn name(self) -> &'static str {
        match self {
            Curve::Secp256k1 => "secp256k1",
            Curve::Nist256p1 => "nist256p1",
            Curve::Ed25519 => "ed25519",
        }
    }

    /// HMAC key for the master node
    fn seed_key(self) -> &'static [u8] {
        match self {
            Curve::Secp256k1 => b"Bitcoin seed",
            Curve::Nist256p1 => b"Nist256p1 seed",
            Curve::Ed25519 => b"ed25519 seed",
        }
    }

    /// Whether `key` is a usable private key on this curve
    fn is_valid_key(self, key: &[u8; 32]) -> bool {
        match self {
            Curve::Secp256k1 => scalar::<k256::Scalar>(key).is_some(),
            Curve::Nist256p1 => scalar::<p256::Scalar>(key).is_some(),
            Curve::Ed25519 => true,
        }
    }

    /// `IL + key mod n`, or `None` when the result is unusable
    fn tweak_add(self, il: &[u8; 32], key: &[u8; 32]) -> Option<Zeroizing<[u8; 32]>> {
        match self {
            Curve::Secp256k1 => tweak_add::<k256::Scalar>(il, key),
            Curve::Nist256p1 => tweak_add::<p256::Scalar>(il, key),
            Curve::Ed25519 => Some(Zeroizing::new(*il)),
        }
    }

    /// Compressed SEC1 public key
    fn public_key(self, key: &[u8; 32]) -> Result<Vec<u8>, CryptoError> {
        match self {
            Curve::Secp256k1 => {
                let secret = k256::SecretKey::from_slice(key)
                    .map_err(|_| CryptoError::InvalidKey(self.name()))?;
                Ok(secret.public_key().to_encoded_point(true).as_bytes().to_vec())
            }
            Curve::Nist256p1 => {
                let secret = p256::SecretKey::from_slice(key)
                    .map_err(|_| CryptoError::InvalidKey(self.name()))?;
                Ok(secret.public_key().to_encoded_point(true).as_bytes().to_vec())
            }
            Curve::Ed25519 => Err(CryptoError::HardenedOnly(self.name())),
        }
    }
}

impl fmt::Display for Curve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Curve {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "secp256k1" => Ok(Curve::Secp256k1),
            "nist256p1" => Ok(Curve::Nist256p1),
            "ed25519" => Ok(Curve::Ed25519),
            _ => Err(CryptoError::InvalidKey("unknown curve")),
        }
    }
}

fn scalar<S>(bytes: &[u8; 32]) -> Option<S>
where
    S: PrimeField<Repr = k256::FieldBytes>,
{
    let value = Option::<S>::from(S::from_repr(k256::FieldBytes::clone_from_slice(bytes)))?;
    (!bool::from(value.is_zero())).then_some(value)
}

fn tweak_add<S>(il: &[u8; 32], key: &[u8; 32]) -> Option<Zeroizing<[u8; 32]>>
where
    S: PrimeField<Repr = k256::FieldBytes>,
{
    let tweak = Option::<S>::from(S::from_repr(k256::FieldBytes::clone_from_slice(il)))?;
    let child = tweak + scalar::<S>(key)?;
    if bool::from(child.is_zero()) {
        return None;
    }
    let mut out = Zeroizing::new([0u8; 32]);
    out.copy_from_slice(&child.to_repr());
    Some(out)
}

fn hmac_sha512(key: &[u8], parts: &[&[u8]]) -> Result<Zeroizing<[u8; 64]>, CryptoError> {
    let mut mac = <Hmac<Sha512> as Mac>::new_from_slice(key)
        .map_err(|_| CryptoError::InvalidKey("hmac-sha512"))?;
    for part in parts {
        mac.update(part);
    }
    let mut out = Zeroizing::new([0u8; 64]);
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// PBKDF2-HMAC-SHA512, one output block, [`PBKDF2_ROUNDS`] iterations
///
/// `progress` sees `0` first and then every `PBKDF2_ROUNDS / steps`
/// iterations.
fn pbkdf2_sha512(
    password: &[u8],
    salt: &[u8],
    steps: u32,
    progress: Progress<'_>,
) -> Result<Zeroizing<[u8; 64]>, CryptoError> {
    let prf = <Hmac<Sha512> as Mac>::new_from_slice(password)
        .map_err(|_| CryptoError::InvalidKey("hmac-sha512"))?;
    let chunk = PBKDF2_ROUNDS / steps.clamp(1, PBKDF2_ROUNDS);

    let mut block = Zeroizing::new([0u8; 64]);
    let mut out = Zeroizing::new([0u8; 64]);
    progress(0, PBKDF2_ROUNDS);
    for iteration in 1..=PBKDF2_ROUNDS {
        let mut mac = prf.clone();
        if iteration == 1 {
            mac.update(salt);
            mac.update(&1u32.to_be_bytes());
        } else {
            mac.update(&block[..]);
        }
        block.copy_from_slice(&mac.finalize().into_bytes());
        for (acc, byte) in out.iter_mut().zip(block.iter()) {
            *acc ^= byte;
        }
        if iteration % chunk == 0 {
            progress(iteration, PBKDF2_ROUNDS);
        }
    }
    Ok(out)
}

fn split(i: &[u8; 64]) -> (Zeroizing<[u8; 32]>, [u8; 32]) {
    let mut il = Zeroizing::new([0u8; 32]);
    let mut ir = [0u8; 32];
    il.copy_from_slice(&i[..32]);
    ir.copy_from_slice(&i[32..]);
    (il, ir)
}

/// AES-256-CBC decryption in place, no padding
pub fn aes256_cbc_decrypt(key: &[u8; 32], iv: &[u8; 16], data: &mut [u8]) -> Result<(), CryptoError> {
    Aes256CbcDec::new(GenericArray::from_slice(key), GenericArray::from_slice(iv))
        .decrypt_padded_mut::<NoPadding>(data)
        .map(|_| ())
        .map_err(|_| CryptoError::Cipher("ciphertext is not a whole number of blocks".into()))
}

/// AES-256-CBC encryption in place, no padding
pub fn aes256_cbc_encrypt(key: &[u8; 32], iv: &[u8; 16], data: &mut [u8]) -> Result<(), CryptoError> {
    let len = data.len();
    Aes256CbcEnc::new(GenericArray::from_slice(key), GenericArray::from_slice(iv))
        .encrypt_padded_mut::<NoPadding>(data, len)
        .map(|_| ())
        .map_err(|_| CryptoError::Cipher("plaintext is not a whole number of blocks".into()))
}

/// ESSIV for the sealed mnemonic: AES-256-ECB of the device serial
/// (repeated to 32 bytes) under `SHA-256(key)`
pub fn essiv(key: &[u8; 32], serial: &[u8]) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    if serial.is_empty() {
        return Err(CryptoError::Cipher("empty device serial".into()));
    }
    let mut essiv_key = Zeroizing::new([0u8; 32]);
    essiv_key.copy_from_slice(&Sha256::digest(key));
    let cipher = aes::Aes256::new(GenericArray::from_slice(&essiv_key[..]));

    let mut out = Zeroizing::new([0u8; 32]);
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = serial[i % serial.len()];
    }
    for block in out.chunks_exact_mut(16) {
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
    }
    Ok(out)
}

/// Seed derivation, node derivation and symmetric primitives
pub trait CryptoProvider {
    /// BIP-39 checksum and wordlist check
    fn mnemonic_check(&self, phrase: &str) -> bool;

    /// BIP-39 seed: PBKDF2-HMAC-SHA512 over the phrase with salt
    /// `"mnemonic" || passphrase`
    fn mnemonic_to_seed(
        &self,
        phrase: &str,
        passphrase: &str,
        progress: Progress<'_>,
    ) -> Result<Zeroizing<[u8; SEED_LEN]>, CryptoError>;

    /// Master node for `curve`
    fn node_from_seed(&self, seed: &[u8], curve: Curve) -> Result<HdNode, CryptoError>;

    /// Private child derivation
    fn node_private_ckd(&self, node: &HdNode, index: u32, curve: Curve) -> Result<HdNode, CryptoError>;

    /// Check a stored node's key against `curve` and return a working copy
    fn node_from_xprv(&self, node: &HdNode, curve: Curve) -> Result<HdNode, CryptoError>;

    /// Key material for stored node decryption:
    /// PBKDF2-HMAC-SHA512(passphrase, "TREZORHD"); AES key then IV
    fn passphrase_key(
        &self,
        passphrase: &str,
        progress: Progress<'_>,
    ) -> Result<Zeroizing<[u8; 64]>, CryptoError>;

    fn aes256_cbc_decrypt(&self, key: &[u8; 32], iv: &[u8; 16], data: &mut [u8]) -> Result<(), CryptoError>;

    fn hmac_sha256(&self, key: &[u8], data: &[u8]) -> Result<[u8; 32], CryptoError>;

    fn random_bytes(&self, out: &mut [u8]);
}

/// Host implementation of [`CryptoProvider`]
#[derive(Debug, Clone, Copy, Default)]
pub struct SoftwareCrypto;

impl CryptoProvider for SoftwareCrypto {
    fn mnemonic_check(&self, phrase: &str) -> bool {
        bip39::Mnemonic::validate(phrase, bip39::Language::English).is_ok()
    }

    fn mnemonic_to_seed(
        &self,
        phrase: &str,
        passphrase: &str,
        progress: Progress<'_>,
    ) -> Result<Zeroizing<[u8; SEED_LEN]>, CryptoError> {
        let salt = Zeroizing::new(format!("mnemonic{}", passphrase));
        pbkdf2_sha512(phrase.as_bytes(), salt.as_bytes(), SEED_PROGRESS_STEPS, progress)
    }

    fn node_from_seed(&self, seed: &[u8], curve: Curve) -> Result<HdNode, CryptoError> {
        let mut i = hmac_sha512(curve.seed_key(), &[seed])?;
        loop {
            let (il, ir) = split(&i);
            if curve.is_valid_key(&il) {
                return Ok(HdNode {
                    depth: 0,
                    fingerprint: 0,
                    child_num: 0,
                    chain_code: ir,
                    private_key: Some(*il),
                });
            }
            i = hmac_sha512(curve.seed_key(), &[&i[..]])?;
        }
    }

    fn node_private_ckd(&self, node: &HdNode, index: u32, curve: Curve) -> Result<HdNode, CryptoError> {
        let key = node.private_key.as_ref().ok_or(CryptoError::MissingPrivateKey)?;
        let hardened = index & HARDENED != 0;
        if !hardened && curve == Curve::Ed25519 {
            return Err(CryptoError::HardenedOnly(curve.name()));
        }

        let mut data = Zeroizing::new(Vec::with_capacity(37));
        if hardened {
            data.push(0);
            data.extend_from_slice(key);
        } else {
            data.extend_from_slice(&curve.public_key(key)?);
        }
        data.extend_from_slice(&index.to_be_bytes());

        loop {
            let i = hmac_sha512(&node.chain_code, &[&data[..]])?;
            let (il, ir) = split(&i);
            if let Some(child) = curve.tweak_add(&il, key) {
                return Ok(HdNode {
                    depth: node.depth + 1,
                    fingerprint: 0,
                    child_num: index,
                    chain_code: ir,
                    private_key: Some(*child),
                });
            }
            data.clear();
            data.push(1);
            data.extend_from_slice(&ir);
            data.extend_from_slice(&index.to_be_bytes());
        }
    }

    fn node_from_xprv(&self, node: &HdNode, curve: Curve) -> Result<HdNode, CryptoError> {
        let key = node.private_key.as_ref().ok_or(CryptoError::MissingPrivateKey)?;
        if !curve.is_valid_key(key) {
            return Err(CryptoError::InvalidKey(curve.name()));
        }
        Ok(node.clone())
    }

    fn passphrase_key(
        &self,
        passphrase: &str,
        progress: Progress<'_>,
    ) -> Result<Zeroizing<[u8; 64]>, CryptoError> {
        pbkdf2_sha512(passphrase.as_bytes(), b"TREZORHD", NODE_KEY_PROGRESS_STEPS, progress)
    }

    fn aes256_cbc_decrypt(&self, key: &[u8; 32], iv: &[u8; 16], data: &mut [u8]) -> Result<(), CryptoError> {
        aes256_cbc_decrypt(key, iv, data)
    }

    fn hmac_sha256(&self, key: &[u8], data: &[u8]) -> Result<[u8; 32], CryptoError> {
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key)
            .map_err(|_| CryptoError::InvalidKey("hmac-sha256"))?;
        mac.update(data);
        let mut out = [0u8; 32];
        out.copy_from_slice(&mac.finalize().into_bytes());
        Ok(out)
    }

    fn random_bytes(&self, out: &mut [u8]) {
        OsRng.fill_bytes(out);
    }
}
