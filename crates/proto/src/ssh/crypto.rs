//! SSH symmetric cryptography.
//!
//! This module implements the packet ciphers and MAC algorithms the
//! transport negotiates:
//! - AES-128/192/256-CTR (stream mode, RFC 4344)
//! - AES-128/192/256-CBC (RFC 4253 Section 6.3)
//! - HMAC-SHA1, HMAC-SHA2-256, HMAC-SHA2-512 (RFC 4253 Section 6.4, RFC 6668)
//!
//! Ciphers run in continuous-buffer mode: the keystream (CTR) or chaining
//! block (CBC) carries over from one packet to the next for the lifetime of
//! a key set, and no cipher-level padding is ever applied.
//!
//! Each algorithm family is a typed table (`CipherAlgorithm`,
//! `MacAlgorithm`) with a name lookup and per-algorithm sizes. A negotiated
//! name is turned into a working instance through [`CipherAlgorithm::build`].
//!
//! # Example
//!
//! ```rust
//! use tern_proto::ssh::crypto::{CipherAlgorithm, Direction};
//!
//! let alg = CipherAlgorithm::from_name("aes128-ctr").unwrap();
//! let mut enc = alg.build(Direction::Encrypt, &[7u8; 16], &[1u8; 16]).unwrap();
//! let mut dec = alg.build(Direction::Decrypt, &[7u8; 16], &[1u8; 16]).unwrap();
//!
//! let mut block = *b"sixteen byte msg";
//! enc.apply(&mut block).unwrap();
//! dec.apply(&mut block).unwrap();
//! assert_eq!(&block, b"sixteen byte msg");
//! ```

use aes::{Aes128, Aes192, Aes256};
use cipher::consts::U16;
use cipher::generic_array::GenericArray;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use subtle::ConstantTimeEq;
use tern_platform::{TernError, TernResult};
use zeroize::Zeroizing;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes192Ctr = ctr::Ctr128BE<Aes192>;
type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Which way a cipher instance transforms data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Plaintext to ciphertext
    Encrypt,
    /// Ciphertext to plaintext
    Decrypt,
}

/// A packet cipher bound to one key, IV and direction.
pub trait PacketCipher: Send {
    /// Cipher block size in bytes (8 for the null cipher).
    fn block_size(&self) -> usize;

    /// Encrypts or decrypts `data` in place.
    ///
    /// `data.len()` must be a multiple of [`block_size`](Self::block_size).
    fn apply(&mut self, data: &mut [u8]) -> TernResult<()>;
}

/// Cipher algorithm for SSH encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherAlgorithm {
    /// aes128-ctr
    Aes128Ctr,
    /// aes192-ctr
    Aes192Ctr,
    /// aes256-ctr
    Aes256Ctr,
    /// aes128-cbc
    Aes128Cbc,
    /// aes192-cbc
    Aes192Cbc,
    /// aes256-cbc
    Aes256Cbc,
}

impl CipherAlgorithm {
    /// Every supported cipher, in default preference order.
    pub const ALL: &'static [CipherAlgorithm] = &[
        CipherAlgorithm::Aes128Ctr,
        CipherAlgorithm::Aes192Ctr,
        CipherAlgorithm::Aes256Ctr,
        CipherAlgorithm::Aes128Cbc,
        CipherAlgorithm::Aes192Cbc,
        CipherAlgorithm::Aes256Cbc,
    ];

    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            CipherAlgorithm::Aes128Ctr => "aes128-ctr",
            CipherAlgorithm::Aes192Ctr => "aes192-ctr",
            CipherAlgorithm::Aes256Ctr => "aes256-ctr",
            CipherAlgorithm::Aes128Cbc => "aes128-cbc",
            CipherAlgorithm::Aes192Cbc => "aes192-cbc",
            CipherAlgorithm::Aes256Cbc => "aes256-cbc",
        }
    }

    /// Returns the key size in bytes.
    pub fn key_size(&self) -> usize {
        match self {
            CipherAlgorithm::Aes128Ctr | CipherAlgorithm::Aes128Cbc => 16,
            CipherAlgorithm::Aes192Ctr | CipherAlgorithm::Aes192Cbc => 24,
            CipherAlgorithm::Aes256Ctr | CipherAlgorithm::Aes256Cbc => 32,
        }
    }

    /// Returns the IV size in bytes.
    pub fn iv_size(&self) -> usize {
        16
    }

    /// Returns the block size in bytes.
    pub fn block_size(&self) -> usize {
        16
    }

    /// Parses a cipher algorithm from its name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|alg| alg.name() == name)
    }

    /// Instantiates the cipher for one direction.
    ///
    /// Key and IV material longer than needed is truncated, as produced by
    /// the key derivation.
    pub fn build(
        &self,
        direction: Direction,
        key: &[u8],
        iv: &[u8],
    ) -> TernResult<Box<dyn PacketCipher>> {
        if key.len() < self.key_size() || iv.len() < self.iv_size() {
            return Err(TernError::Security(format!(
                "Insufficient key material for {}: key {} of {}, iv {} of {}",
                self.name(),
                key.len(),
                self.key_size(),
                iv.len(),
                self.iv_size()
            )));
        }
        let key = &key[..self.key_size()];
        let iv = &iv[..self.iv_size()];

        let cipher: Box<dyn PacketCipher> = match (self, direction) {
            (CipherAlgorithm::Aes128Ctr, _) => {
                Box::new(CtrCipher::Aes128(Aes128Ctr::new_from_slices(key, iv).map_err(bad_len)?))
            }
            (CipherAlgorithm::Aes192Ctr, _) => {
                Box::new(CtrCipher::Aes192(Aes192Ctr::new_from_slices(key, iv).map_err(bad_len)?))
            }
            (CipherAlgorithm::Aes256Ctr, _) => {
                Box::new(CtrCipher::Aes256(Aes256Ctr::new_from_slices(key, iv).map_err(bad_len)?))
            }
            (CipherAlgorithm::Aes128Cbc, Direction::Encrypt) => Box::new(CbcEncryptor::Aes128(
                cbc::Encryptor::new_from_slices(key, iv).map_err(bad_len)?,
            )),
            (CipherAlgorithm::Aes192Cbc, Direction::Encrypt) => Box::new(CbcEncryptor::Aes192(
                cbc::Encryptor::new_from_slices(key, iv).map_err(bad_len)?,
            )),
            (CipherAlgorithm::Aes256Cbc, Direction::Encrypt) => Box::new(CbcEncryptor::Aes256(
                cbc::Encryptor::new_from_slices(key, iv).map_err(bad_len)?,
            )),
            (CipherAlgorithm::Aes128Cbc, Direction::Decrypt) => Box::new(CbcDecryptor::Aes128(
                cbc::Decryptor::new_from_slices(key, iv).map_err(bad_len)?,
            )),
            (CipherAlgorithm::Aes192Cbc, Direction::Decrypt) => Box::new(CbcDecryptor::Aes192(
                cbc::Decryptor::new_from_slices(key, iv).map_err(bad_len)?,
            )),
            (CipherAlgorithm::Aes256Cbc, Direction::Decrypt) => Box::new(CbcDecryptor::Aes256(
                cbc::Decryptor::new_from_slices(key, iv).map_err(bad_len)?,
            )),
        };
        Ok(cipher)
    }
}

impl std::fmt::Display for CipherAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

fn bad_len(e: cipher::InvalidLength) -> TernError {
    TernError::Security(format!("Invalid cipher key or IV length: {}", e))
}

fn check_aligned(data: &[u8], block_size: usize) -> TernResult<()> {
    if data.len() % block_size != 0 {
        return Err(TernError::Protocol(format!(
            "Cipher input of {} bytes is not a multiple of the {}-byte block size",
            data.len(),
            block_size
        )));
    }
    Ok(())
}

/// The cipher in effect before the first NEWKEYS.
#[derive(Debug, Default)]
pub struct NoneCipher;

impl PacketCipher for NoneCipher {
    fn block_size(&self) -> usize {
        8
    }

    fn apply(&mut self, _data: &mut [u8]) -> TernResult<()> {
        Ok(())
    }
}

enum CtrCipher {
    Aes128(Aes128Ctr),
    Aes192(Aes192Ctr),
    Aes256(Aes256Ctr),
}

impl PacketCipher for CtrCipher {
    fn block_size(&self) -> usize {
        16
    }

    fn apply(&mut self, data: &mut [u8]) -> TernResult<()> {
        check_aligned(data, 16)?;
        match self {
            CtrCipher::Aes128(c) => c.apply_keystream(data),
            CtrCipher::Aes192(c) => c.apply_keystream(data),
            CtrCipher::Aes256(c) => c.apply_keystream(data),
        }
        Ok(())
    }
}

enum CbcEncryptor {
    Aes128(cbc::Encryptor<Aes128>),
    Aes192(cbc::Encryptor<Aes192>),
    Aes256(cbc::Encryptor<Aes256>),
}

fn encrypt_blocks<E: BlockEncryptMut<BlockSize = U16>>(enc: &mut E, data: &mut [u8]) {
    for chunk in data.chunks_exact_mut(16) {
        enc.encrypt_block_mut(GenericArray::from_mut_slice(chunk));
    }
}

fn decrypt_blocks<D: BlockDecryptMut<BlockSize = U16>>(dec: &mut D, data: &mut [u8]) {
    for chunk in data.chunks_exact_mut(16) {
        dec.decrypt_block_mut(GenericArray::from_mut_slice(chunk));
    }
}

impl PacketCipher for CbcEncryptor {
    fn block_size(&self) -> usize {
        16
    }

    fn apply(&mut self, data: &mut [u8]) -> TernResult<()> {
        check_aligned(data, 16)?;
        match self {
            CbcEncryptor::Aes128(c) => encrypt_blocks(c, data),
            CbcEncryptor::Aes192(c) => encrypt_blocks(c, data),
            CbcEncryptor::Aes256(c) => encrypt_blocks(c, data),
        }
        Ok(())
    }
}

enum CbcDecryptor {
    Aes128(cbc::Decryptor<Aes128>),
    Aes192(cbc::Decryptor<Aes192>),
    Aes256(cbc::Decryptor<Aes256>),
}

impl PacketCipher for CbcDecryptor {
    fn block_size(&self) -> usize {
        16
    }

    fn apply(&mut self, data: &mut [u8]) -> TernResult<()> {
        check_aligned(data, 16)?;
        match self {
            CbcDecryptor::Aes128(c) => decrypt_blocks(c, data),
            CbcDecryptor::Aes192(c) => decrypt_blocks(c, data),
            CbcDecryptor::Aes256(c) => decrypt_blocks(c, data),
        }
        Ok(())
    }
}

/// MAC algorithm for SSH.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MacAlgorithm {
    /// HMAC-SHA2-256
    HmacSha256,
    /// HMAC-SHA2-512
    HmacSha512,
    /// HMAC-SHA1
    HmacSha1,
}

impl MacAlgorithm {
    /// Every supported MAC, in default preference order.
    pub const ALL: &'static [MacAlgorithm] = &[
        MacAlgorithm::HmacSha256,
        MacAlgorithm::HmacSha512,
        MacAlgorithm::HmacSha1,
    ];

    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            MacAlgorithm::HmacSha256 => "hmac-sha2-256",
            MacAlgorithm::HmacSha512 => "hmac-sha2-512",
            MacAlgorithm::HmacSha1 => "hmac-sha1",
        }
    }

    /// Returns the key size in bytes.
    pub fn key_size(&self) -> usize {
        match self {
            MacAlgorithm::HmacSha256 => 32,
            MacAlgorithm::HmacSha512 => 64,
            MacAlgorithm::HmacSha1 => 20,
        }
    }

    /// Returns the MAC output size in bytes.
    pub fn mac_size(&self) -> usize {
        self.key_size()
    }

    /// Parses MAC algorithm from name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|alg| alg.name() == name)
    }
}

impl std::fmt::Display for MacAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// MAC key for computing message authentication codes.
///
/// The MAC input is `uint32 sequence_number || unencrypted_packet`.
pub struct MacKey {
    algorithm: MacAlgorithm,
    key: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for MacKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacKey")
            .field("algorithm", &self.algorithm)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl MacKey {
    /// Creates a new MAC key.
    pub fn new(algorithm: MacAlgorithm, key_material: &[u8]) -> TernResult<Self> {
        if key_material.len() < algorithm.key_size() {
            return Err(TernError::Security(format!(
                "Insufficient key material for MAC: expected {}, got {}",
                algorithm.key_size(),
                key_material.len()
            )));
        }

        Ok(Self {
            algorithm,
            key: Zeroizing::new(key_material[..algorithm.key_size()].to_vec()),
        })
    }

    /// Computes the MAC of one packet.
    pub fn compute(&self, sequence: u32, packet: &[u8]) -> TernResult<Vec<u8>> {
        let seq = sequence.to_be_bytes();
        let mac = match self.algorithm {
            MacAlgorithm::HmacSha256 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(&self.key).map_err(mac_key_err)?;
                mac.update(&seq);
                mac.update(packet);
                mac.finalize().into_bytes().to_vec()
            }
            MacAlgorithm::HmacSha512 => {
                let mut mac = Hmac::<Sha512>::new_from_slice(&self.key).map_err(mac_key_err)?;
                mac.update(&seq);
                mac.update(packet);
                mac.finalize().into_bytes().to_vec()
            }
            MacAlgorithm::HmacSha1 => {
                let mut mac = Hmac::<Sha1>::new_from_slice(&self.key).map_err(mac_key_err)?;
                mac.update(&seq);
                mac.update(packet);
                mac.finalize().into_bytes().to_vec()
            }
        };
        Ok(mac)
    }

    /// Verifies the MAC of one packet in constant time.
    pub fn verify(&self, sequence: u32, packet: &[u8], received_mac: &[u8]) -> TernResult<()> {
        let computed = self.compute(sequence, packet)?;

        if computed.len() != received_mac.len() {
            return Err(TernError::Security("MAC length mismatch".to_string()));
        }

        if computed.ct_eq(received_mac).into() {
            Ok(())
        } else {
            Err(TernError::Security(format!(
                "MAC verification failed for packet {}",
                sequence
            )))
        }
    }

    /// Returns the algorithm.
    pub fn algorithm(&self) -> MacAlgorithm {
        self.algorithm
    }
}

fn mac_key_err(e: hmac::digest::InvalidLength) -> TernError {
    TernError::Security(format!("Invalid MAC key: {}", e))
}
