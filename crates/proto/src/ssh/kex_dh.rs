//! Key exchange math: Diffie-Hellman, Curve25519, exchange hash, key derivation.
//!
//! This module implements:
//! - fixed-group DH over Oakley group 2 and RFC 3526 group 14
//! - DH over a server-chosen group (RFC 4419 group exchange)
//! - curve25519-sha256 (RFC 8731)
//! - the exchange hash H for each method (RFC 4253 Section 8, RFC 4419
//!   Section 3, RFC 5656 Section 4)
//! - session key derivation (RFC 4253 Section 7.2)
//!
//! # Security
//!
//! - DH peer values are range checked (1 < f < p-1)
//! - Private exponents and derived keys are zeroized on drop
//!
//! # Example
//!
//! ```rust
//! use tern_proto::ssh::kex::FixedGroup;
//! use tern_proto::ssh::kex_dh::{DhExchange, DhGroup, KexHash};
//!
//! let client = DhExchange::new(DhGroup::fixed(FixedGroup::Group14), KexHash::Sha256);
//! let server = DhExchange::new(DhGroup::fixed(FixedGroup::Group14), KexHash::Sha256);
//!
//! let k1 = client.compute_shared_secret(server.public_value()).unwrap();
//! let k2 = server.compute_shared_secret(client.public_value()).unwrap();
//! assert_eq!(k1, k2);
//! ```

use crate::ssh::kex::{FixedGroup, Negotiated};
use crate::ssh::wire::encode_mpint;
use num_bigint::{BigUint, RandBigInt};
use once_cell::sync::Lazy;
use ring::agreement::{agree_ephemeral, EphemeralPrivateKey, UnparsedPublicKey, X25519};
use ring::rand::SystemRandom;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use tern_platform::{TernError, TernResult};
use zeroize::{Zeroize, ZeroizeOnDrop};

fn parse_prime(hex_digits: &str) -> BigUint {
    let cleaned: String = hex_digits.chars().filter(|c| c.is_ascii_hexdigit()).collect();
    BigUint::parse_bytes(cleaned.as_bytes(), 16).unwrap_or_default()
}

/// Oakley group 2 prime (RFC 2409 Section 6.2), 1024 bits.
static GROUP1_P: Lazy<BigUint> = Lazy::new(|| {
    parse_prime(
        "FFFFFFFF FFFFFFFF C90FDAA2 2168C234 C4C6628B 80DC1CD1
         29024E08 8A67CC74 020BBEA6 3B139B22 514A0879 8E3404DD
         EF9519B3 CD3A431B 302B0A6D F25F1437 4FE1356D 6D51C245
         E485B576 625E7EC6 F44C42E9 A637ED6B 0BFF5CB6 F406B7ED
         EE386BFB 5A899FA5 AE9F2411 7C4B1FE6 49286651 ECE65381
         FFFFFFFF FFFFFFFF",
    )
});

/// RFC 3526 group 14 prime, 2048 bits.
static GROUP14_P: Lazy<BigUint> = Lazy::new(|| {
    parse_prime(
        "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1
         29024E088A67CC74020BBEA63B139B22514A08798E3404DD
         EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245
         E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED
         EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D
         C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F
         83655D23DCA3AD961C62F356208552BB9ED529077096966D
         670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B
         E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9
         DE2BCBF6955817183995497CEA956AE515D2261898FA0510
         15728E5A8AACAA68FFFFFFFFFFFFFFFF",
    )
});

/// Hash function designated by a kex algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KexHash {
    /// SHA-1
    Sha1,
    /// SHA-256
    Sha256,
    /// SHA-512
    Sha512,
}

impl KexHash {
    /// Digest length in bytes.
    pub fn output_size(&self) -> usize {
        match self {
            KexHash::Sha1 => 20,
            KexHash::Sha256 => 32,
            KexHash::Sha512 => 64,
        }
    }

    /// One-shot digest of the concatenation of `parts`.
    pub fn digest(&self, parts: &[&[u8]]) -> Vec<u8> {
        let mut hasher = self.hasher();
        for part in parts {
            hasher.update(part);
        }
        hasher.finish()
    }

    /// Starts an incremental hash.
    pub fn hasher(&self) -> ExchangeHasher {
        match self {
            KexHash::Sha1 => ExchangeHasher::Sha1(Sha1::new()),
            KexHash::Sha256 => ExchangeHasher::Sha256(Sha256::new()),
            KexHash::Sha512 => ExchangeHasher::Sha512(Sha512::new()),
        }
    }
}

/// Incremental hash that understands SSH wire encodings.
pub enum ExchangeHasher {
    /// SHA-1 state
    Sha1(Sha1),
    /// SHA-256 state
    Sha256(Sha256),
    /// SHA-512 state
    Sha512(Sha512),
}

impl ExchangeHasher {
    /// Feeds raw bytes.
    pub fn update(&mut self, data: &[u8]) {
        match self {
            ExchangeHasher::Sha1(h) => h.update(data),
            ExchangeHasher::Sha256(h) => h.update(data),
            ExchangeHasher::Sha512(h) => h.update(data),
        }
    }

    /// Feeds a uint32.
    pub fn update_u32(&mut self, value: u32) {
        self.update(&value.to_be_bytes());
    }

    /// Feeds a length-prefixed string.
    pub fn update_string(&mut self, data: &[u8]) {
        self.update_u32(data.len() as u32);
        self.update(data);
    }

    /// Feeds an mpint given its unsigned magnitude.
    pub fn update_mpint(&mut self, magnitude: &[u8]) {
        self.update(&encode_mpint(magnitude));
    }

    /// Finishes the hash.
    pub fn finish(self) -> Vec<u8> {
        match self {
            ExchangeHasher::Sha1(h) => h.finalize().to_vec(),
            ExchangeHasher::Sha256(h) => h.finalize().to_vec(),
            ExchangeHasher::Sha512(h) => h.finalize().to_vec(),
        }
    }
}

/// A prime-field DH group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhGroup {
    p: BigUint,
    g: BigUint,
}

impl DhGroup {
    /// One of the well-known groups.
    pub fn fixed(group: FixedGroup) -> Self {
        let p = match group {
            FixedGroup::Group1 => GROUP1_P.clone(),
            FixedGroup::Group14 => GROUP14_P.clone(),
        };
        Self {
            p,
            g: BigUint::from(2u32),
        }
    }

    /// A server-supplied group (SSH_MSG_KEX_DH_GEX_GROUP).
    pub fn new(p: BigUint, g: BigUint) -> TernResult<Self> {
        let one = BigUint::from(1u32);
        if p.bits() < 512 || !p.bit(0) {
            return Err(TernError::Protocol(format!(
                "Unacceptable DH prime of {} bits",
                p.bits()
            )));
        }
        if g <= one || g >= &p - &one {
            return Err(TernError::Protocol("Invalid DH generator".to_string()));
        }
        Ok(Self { p, g })
    }

    /// The prime modulus.
    pub fn p(&self) -> &BigUint {
        &self.p
    }

    /// The generator.
    pub fn g(&self) -> &BigUint {
        &self.g
    }

    /// Size of the prime in bits.
    pub fn bits(&self) -> u64 {
        self.p.bits()
    }
}

/// Ephemeral prime-field DH key pair.
pub struct DhExchange {
    group: DhGroup,
    private_key: Vec<u8>,
    public_value: BigUint,
}

impl DhExchange {
    /// Generates an ephemeral exponent x and computes e = g^x mod p.
    ///
    /// The exponent is twice as long as the kex hash (RFC 4419 Section 6.2),
    /// capped below the size of the prime.
    pub fn new(group: DhGroup, hash: KexHash) -> Self {
        let mut rng = rand::thread_rng();
        let wanted = (hash.output_size() * 16) as u64;
        let bits = wanted.min(group.bits().saturating_sub(1)).max(2);

        let two = BigUint::from(2u32);
        let mut x = rng.gen_biguint(bits);
        while x < two {
            x = rng.gen_biguint(bits);
        }
        let public_value = group.g.modpow(&x, &group.p);

        Self {
            group,
            private_key: x.to_bytes_be(),
            public_value,
        }
    }

    /// Our public value e.
    pub fn public_value(&self) -> &BigUint {
        &self.public_value
    }

    /// The group in use.
    pub fn group(&self) -> &DhGroup {
        &self.group
    }

    /// Computes K = f^x mod p and returns its big-endian magnitude.
    pub fn compute_shared_secret(&self, peer: &BigUint) -> TernResult<Vec<u8>> {
        let one = BigUint::from(1u32);
        if *peer <= one || *peer >= &self.group.p - &one {
            return Err(TernError::Protocol(
                "Invalid peer DH public value: out of range".to_string(),
            ));
        }
        let x = BigUint::from_bytes_be(&self.private_key);
        Ok(peer.modpow(&x, &self.group.p).to_bytes_be())
    }
}

impl Drop for DhExchange {
    fn drop(&mut self) {
        self.private_key.zeroize();
    }
}

/// Curve25519 key exchange (curve25519-sha256, RFC 8731).
pub struct Curve25519Exchange {
    private_key: EphemeralPrivateKey,
    public_key: [u8; 32],
}

impl Curve25519Exchange {
    /// Generates an ephemeral 32-byte scalar and its public point.
    pub fn new() -> TernResult<Self> {
        let rng = SystemRandom::new();
        let private_key = EphemeralPrivateKey::generate(&X25519, &rng)
            .map_err(|_| TernError::Security("Failed to generate Curve25519 key".to_string()))?;

        let public_key = private_key.compute_public_key().map_err(|_| {
            TernError::Security("Failed to compute Curve25519 public key".to_string())
        })?;

        let mut public_key_bytes = [0u8; 32];
        public_key_bytes.copy_from_slice(public_key.as_ref());

        Ok(Self {
            private_key,
            public_key: public_key_bytes,
        })
    }

    /// Our public point Q.
    pub fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }

    /// Scalar multiplication with the peer point; returns the shared secret.
    pub fn compute_shared_secret(self, peer_public: &[u8]) -> TernResult<Vec<u8>> {
        if peer_public.len() != 32 {
            return Err(TernError::Protocol(format!(
                "Invalid Curve25519 public key length: {}",
                peer_public.len()
            )));
        }
        let peer = UnparsedPublicKey::new(&X25519, peer_public);
        agree_ephemeral(self.private_key, &peer, |key_material| key_material.to_vec())
            .map_err(|_| TernError::Security("Curve25519 key agreement failed".to_string()))
    }
}

/// Transcript fields common to every exchange hash.
#[derive(Debug, Clone, Copy)]
pub struct HashTranscript<'a> {
    /// V_C, the client identification string without CR LF
    pub client_id: &'a str,
    /// V_S, the server identification string without CR LF
    pub server_id: &'a str,
    /// I_C, the client KEXINIT payload
    pub client_kexinit: &'a [u8],
    /// I_S, the server KEXINIT payload
    pub server_kexinit: &'a [u8],
    /// K_S, the server host key blob
    pub host_key: &'a [u8],
}

/// Method-specific public values hashed into H.
#[derive(Debug, Clone, Copy)]
pub enum ExchangeValues<'a> {
    /// ECDH: Q_C and Q_S as strings
    Ecdh {
        /// Client point
        client: &'a [u8],
        /// Server point
        server: &'a [u8],
    },
    /// Fixed-group DH: e and f as mpints
    Dh {
        /// Client public value
        e: &'a BigUint,
        /// Server public value
        f: &'a BigUint,
    },
    /// Group exchange: request window, group, then e and f
    GroupExchange {
        /// Minimum acceptable bits
        min: u32,
        /// Preferred bits
        preferred: u32,
        /// Maximum acceptable bits
        max: u32,
        /// Group selected by the server
        group: &'a DhGroup,
        /// Client public value
        e: &'a BigUint,
        /// Server public value
        f: &'a BigUint,
    },
}

/// Computes the exchange hash H.
pub fn exchange_hash(
    hash: KexHash,
    transcript: &HashTranscript<'_>,
    values: &ExchangeValues<'_>,
    shared_secret: &[u8],
) -> Vec<u8> {
    let mut h = hash.hasher();
    h.update_string(transcript.client_id.as_bytes());
    h.update_string(transcript.server_id.as_bytes());
    h.update_string(transcript.client_kexinit);
    h.update_string(transcript.server_kexinit);
    h.update_string(transcript.host_key);

    match values {
        ExchangeValues::Ecdh { client, server } => {
            h.update_string(client);
            h.update_string(server);
        }
        ExchangeValues::Dh { e, f } => {
            h.update_mpint(&e.to_bytes_be());
            h.update_mpint(&f.to_bytes_be());
        }
        ExchangeValues::GroupExchange {
            min,
            preferred,
            max,
            group,
            e,
            f,
        } => {
            h.update_u32(*min);
            h.update_u32(*preferred);
            h.update_u32(*max);
            h.update_mpint(&group.p.to_bytes_be());
            h.update_mpint(&group.g.to_bytes_be());
            h.update_mpint(&e.to_bytes_be());
            h.update_mpint(&f.to_bytes_be());
        }
    }

    h.update_mpint(shared_secret);
    h.finish()
}

/// Derives one session key (RFC 4253 Section 7.2).
///
/// ```text
/// K1 = HASH(K || H || tag || session_id)
/// K2 = HASH(K || H || K1)
/// Kn = HASH(K || H || K1 || ... || Kn-1)
/// key = (K1 || K2 || ...)[..length]
/// ```
///
/// `shared_secret` is the magnitude of K; it is hashed in mpint encoding.
pub fn derive_key(
    hash: KexHash,
    shared_secret: &[u8],
    exchange_hash: &[u8],
    tag: u8,
    session_id: &[u8],
    length: usize,
) -> Vec<u8> {
    let k = encode_mpint(shared_secret);
    let mut key = hash.digest(&[&k, exchange_hash, &[tag], session_id]);
    while key.len() < length {
        let next = hash.digest(&[&k, exchange_hash, &key]);
        key.extend_from_slice(&next);
    }
    key.truncate(length);
    key
}

/// The six keys produced by a key exchange.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    /// Initial IV client to server ('A')
    pub iv_client_to_server: Vec<u8>,
    /// Initial IV server to client ('B')
    pub iv_server_to_client: Vec<u8>,
    /// Encryption key client to server ('C')
    pub enc_client_to_server: Vec<u8>,
    /// Encryption key server to client ('D')
    pub enc_server_to_client: Vec<u8>,
    /// Integrity key client to server ('E')
    pub mac_client_to_server: Vec<u8>,
    /// Integrity key server to client ('F')
    pub mac_server_to_client: Vec<u8>,
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys").finish_non_exhaustive()
    }
}

impl SessionKeys {
    /// Derives all six keys sized for the negotiated algorithms.
    pub fn derive(
        hash: KexHash,
        shared_secret: &[u8],
        exchange_hash: &[u8],
        session_id: &[u8],
        negotiated: &Negotiated,
    ) -> Self {
        let d = |tag: u8, len: usize| {
            derive_key(hash, shared_secret, exchange_hash, tag, session_id, len)
        };
        Self {
            iv_client_to_server: d(b'A', negotiated.cipher_client_to_server.iv_size()),
            iv_server_to_client: d(b'B', negotiated.cipher_server_to_client.iv_size()),
            enc_client_to_server: d(b'C', negotiated.cipher_client_to_server.key_size()),
            enc_server_to_client: d(b'D', negotiated.cipher_server_to_client.key_size()),
            mac_client_to_server: d(b'E', negotiated.mac_client_to_server.key_size()),
            mac_server_to_client: d(b'F', negotiated.mac_server_to_client.key_size()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::crypto::{CipherAlgorithm, MacAlgorithm};
    use crate::ssh::hostkey::HostKeyAlgorithm;
    use crate::ssh::kex::{CompressionAlgorithm, KexAlgorithm};

    fn negotiated() -> Negotiated {
        Negotiated {
            kex: KexAlgorithm::Curve25519Sha256,
            host_key: HostKeyAlgorithm::SshEd25519,
            cipher_client_to_server: CipherAlgorithm::Aes256Ctr,
            cipher_server_to_client: CipherAlgorithm::Aes128Cbc,
            mac_client_to_server: MacAlgorithm::HmacSha512,
            mac_server_to_client: MacAlgorithm::HmacSha1,
            compression_client_to_server: CompressionAlgorithm::None,
            compression_server_to_client: CompressionAlgorithm::None,
        }
    }

    #[test]
    fn test_group_sizes() {
        assert_eq!(DhGroup::fixed(FixedGroup::Group1).bits(), 1024);
        assert_eq!(DhGroup::fixed(FixedGroup::Group14).bits(), 2048);
    }

    #[test]
    fn test_dh_agreement_group1() {
        let group = DhGroup::fixed(FixedGroup::Group1);
        let a = DhExchange::new(group.clone(), KexHash::Sha1);
        let b = DhExchange::new(group, KexHash::Sha1);
        assert_eq!(
            a.compute_shared_secret(b.public_value()).unwrap(),
            b.compute_shared_secret(a.public_value()).unwrap()
        );
    }

    #[test]
    fn test_dh_rejects_out_of_range_peer() {
        let ex = DhExchange::new(DhGroup::fixed(FixedGroup::Group14), KexHash::Sha256);
        assert!(ex.compute_shared_secret(&BigUint::from(1u32)).is_err());
        let p_minus_one = ex.group().p() - BigUint::from(1u32);
        assert!(ex.compute_shared_secret(&p_minus_one).is_err());
    }

    #[test]
    fn test_server_group_validation() {
        let p = DhGroup::fixed(FixedGroup::Group14).p().clone();
        assert!(DhGroup::new(p.clone(), BigUint::from(2u32)).is_ok());
        assert!(DhGroup::new(p, BigUint::from(1u32)).is_err());
        assert!(DhGroup::new(BigUint::from(23u32), BigUint::from(5u32)).is_err());
    }

    #[test]
    fn test_curve25519_agreement() {
        let a = Curve25519Exchange::new().unwrap();
        let b = Curve25519Exchange::new().unwrap();
        let a_pub = *a.public_key();
        let b_pub = *b.public_key();
        let k1 = a.compute_shared_secret(&b_pub).unwrap();
        let k2 = b.compute_shared_secret(&a_pub).unwrap();
        assert_eq!(k1, k2);
        assert_eq!(k1.len(), 32);
    }

    #[test]
    fn test_curve25519_rejects_bad_length() {
        let a = Curve25519Exchange::new().unwrap();
        assert!(a.compute_shared_secret(&[1u8; 31]).is_err());
    }

    #[test]
    fn test_derive_key_is_deterministic() {
        let k = [0x8fu8; 32];
        let h = [0x11u8; 32];
        let sid = [0x22u8; 32];
        let a = SessionKeys::derive(KexHash::Sha256, &k, &h, &sid, &negotiated());
        let b = SessionKeys::derive(KexHash::Sha256, &k, &h, &sid, &negotiated());
        assert_eq!(a.enc_client_to_server, b.enc_client_to_server);
        assert_eq!(a.mac_client_to_server, b.mac_client_to_server);
        assert_eq!(a.iv_server_to_client, b.iv_server_to_client);

        assert_eq!(a.enc_client_to_server.len(), 32);
        assert_eq!(a.enc_server_to_client.len(), 16);
        assert_eq!(a.mac_client_to_server.len(), 64);
        assert_eq!(a.mac_server_to_client.len(), 20);
        assert_ne!(a.iv_client_to_server, a.iv_server_to_client);
    }

    #[test]
    fn test_derive_key_extension() {
        let k = [1u8; 16];
        let h = [2u8; 20];
        let long = derive_key(KexHash::Sha1, &k, &h, b'C', &h, 64);
        assert_eq!(long.len(), 64);

        let k1 = KexHash::Sha1.digest(&[&encode_mpint(&k), &h, b"C", &h]);
        assert_eq!(&long[..20], &k1[..]);
        let k2 = KexHash::Sha1.digest(&[&encode_mpint(&k), &h, &k1]);
        assert_eq!(&long[20..40], &k2[..]);

        let mut k1k2 = k1.clone();
        k1k2.extend_from_slice(&k2);
        let k3 = KexHash::Sha1.digest(&[&encode_mpint(&k), &h, &k1k2]);
        assert_eq!(&long[40..60], &k3[..]);
    }

    #[test]
    fn test_exchange_hash_binds_every_field() {
        let transcript = HashTranscript {
            client_id: "SSH-2.0-a",
            server_id: "SSH-2.0-b",
            client_kexinit: b"\x14c",
            server_kexinit: b"\x14s",
            host_key: b"key",
        };
        let values = ExchangeValues::Ecdh {
            client: &[1; 32],
            server: &[2; 32],
        };
        let h1 = exchange_hash(KexHash::Sha256, &transcript, &values, &[9; 32]);
        let h2 = exchange_hash(KexHash::Sha256, &transcript, &values, &[9; 32]);
        assert_eq!(h1, h2);

        let other = HashTranscript {
            server_id: "SSH-2.0-c",
            ..transcript
        };
        assert_ne!(h1, exchange_hash(KexHash::Sha256, &other, &values, &[9; 32]));
        assert_ne!(h1, exchange_hash(KexHash::Sha256, &transcript, &values, &[8; 32]));
    }
}
