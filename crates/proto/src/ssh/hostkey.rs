//! SSH Host Key Algorithms
//!
//! Server host keys authenticate the key exchange (RFC 4253 Section 8).
//! The client parses the server's public key blob, verifies the signature
//! over the exchange hash, and exposes a fingerprint for trust decisions.
//!
//! # Supported Algorithms
//!
//! - `ssh-ed25519` - EdDSA signature using Ed25519 (RFC 8709)
//! - `ecdsa-sha2-nistp256`, `ecdsa-sha2-nistp384` (RFC 5656)
//! - `rsa-sha2-512`, `rsa-sha2-256` (RFC 8332)
//! - `ssh-rsa` - RSA with SHA-1, for legacy servers only
//!
//! # Example
//!
//! ```rust
//! use tern_proto::ssh::hostkey::{fingerprint, Ed25519HostKey, HostKey, PublicHostKey};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let hostkey = Ed25519HostKey::generate()?;
//! let blob = hostkey.public_key_bytes();
//! let signature = hostkey.sign(b"exchange hash")?;
//!
//! let public = PublicHostKey::parse(&blob)?;
//! public.verify(hostkey.algorithm(), b"exchange hash", &signature)?;
//! assert!(fingerprint(&blob).starts_with("SHA256:"));
//! # Ok(())
//! # }
//! ```

use crate::ssh::wire::{write_mpint, write_str, write_string, Reader};
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use bytes::BytesMut;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey, SECRET_KEY_LENGTH};
use ring::signature::{
    RsaPublicKeyComponents, RSA_PKCS1_2048_8192_SHA1_FOR_LEGACY_USE_ONLY,
    RSA_PKCS1_2048_8192_SHA256, RSA_PKCS1_2048_8192_SHA512,
};
use sha2::{Digest, Sha256};
use tern_platform::{TernError, TernResult};
use zeroize::Zeroizing;

/// Host key algorithm identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostKeyAlgorithm {
    /// ssh-ed25519 - EdDSA signature using Ed25519
    SshEd25519,
    /// ecdsa-sha2-nistp256 - ECDSA signature using P-256 curve
    EcdsaSha2Nistp256,
    /// ecdsa-sha2-nistp384 - ECDSA signature using P-384 curve
    EcdsaSha2Nistp384,
    /// rsa-sha2-512 - RSA signature with SHA-512
    RsaSha2_512,
    /// rsa-sha2-256 - RSA signature with SHA-256
    RsaSha2_256,
    /// ssh-rsa - Legacy RSA with SHA-1
    SshRsa,
}

impl HostKeyAlgorithm {
    /// Every supported algorithm, in default preference order.
    pub const ALL: &'static [HostKeyAlgorithm] = &[
        HostKeyAlgorithm::SshEd25519,
        HostKeyAlgorithm::EcdsaSha2Nistp256,
        HostKeyAlgorithm::EcdsaSha2Nistp384,
        HostKeyAlgorithm::RsaSha2_512,
        HostKeyAlgorithm::RsaSha2_256,
        HostKeyAlgorithm::SshRsa,
    ];

    /// Get the algorithm name as sent on the wire
    pub fn name(&self) -> &'static str {
        match self {
            HostKeyAlgorithm::SshEd25519 => "ssh-ed25519",
            HostKeyAlgorithm::EcdsaSha2Nistp256 => "ecdsa-sha2-nistp256",
            HostKeyAlgorithm::EcdsaSha2Nistp384 => "ecdsa-sha2-nistp384",
            HostKeyAlgorithm::RsaSha2_512 => "rsa-sha2-512",
            HostKeyAlgorithm::RsaSha2_256 => "rsa-sha2-256",
            HostKeyAlgorithm::SshRsa => "ssh-rsa",
        }
    }

    /// Parse algorithm from name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|a| a.name() == name)
    }

    /// Key type carried in the public key blob for this algorithm.
    pub fn key_type(&self) -> &'static str {
        match self {
            HostKeyAlgorithm::RsaSha2_512 | HostKeyAlgorithm::RsaSha2_256 => "ssh-rsa",
            other => other.name(),
        }
    }
}

impl std::fmt::Display for HostKeyAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// SHA-256 fingerprint of a public key blob, OpenSSH style.
///
/// ```rust
/// use tern_proto::ssh::hostkey::fingerprint;
///
/// let fp = fingerprint(b"blob");
/// assert!(fp.starts_with("SHA256:"));
/// assert!(!fp.ends_with('='));
/// ```
pub fn fingerprint(blob: &[u8]) -> String {
    format!("SHA256:{}", STANDARD_NO_PAD.encode(Sha256::digest(blob)))
}

/// A server public key parsed from its wire blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicHostKey {
    /// 32-byte Ed25519 point
    Ed25519([u8; 32]),
    /// RSA modulus and exponent, big-endian without leading zeros
    Rsa {
        /// Public exponent
        e: Vec<u8>,
        /// Modulus
        n: Vec<u8>,
    },
    /// SEC1 encoded P-256 point
    EcdsaP256(Vec<u8>),
    /// SEC1 encoded P-384 point
    EcdsaP384(Vec<u8>),
}

impl PublicHostKey {
    /// Parses a public key blob (`string type, ...`).
    pub fn parse(blob: &[u8]) -> TernResult<Self> {
        let mut r = Reader::new(blob);
        let key_type = r.read_str()?;
        match key_type {
            "ssh-ed25519" => {
                let point = r.read_string()?;
                let point: [u8; 32] = point.try_into().map_err(|_| {
                    TernError::Security("Ed25519 public key must be 32 bytes".to_string())
                })?;
                Ok(PublicHostKey::Ed25519(point))
            }
            "ssh-rsa" => {
                let e = r.read_mpint()?.to_vec();
                let n = r.read_mpint()?.to_vec();
                Ok(PublicHostKey::Rsa { e, n })
            }
            "ecdsa-sha2-nistp256" | "ecdsa-sha2-nistp384" => {
                let curve = r.read_str()?;
                let point = r.read_string()?.to_vec();
                match (key_type, curve) {
                    ("ecdsa-sha2-nistp256", "nistp256") => Ok(PublicHostKey::EcdsaP256(point)),
                    ("ecdsa-sha2-nistp384", "nistp384") => Ok(PublicHostKey::EcdsaP384(point)),
                    _ => Err(TernError::Security(format!(
                        "ECDSA curve mismatch: {} with {}",
                        key_type, curve
                    ))),
                }
            }
            other => Err(TernError::Security(format!(
                "Unsupported host key type: {}",
                other
            ))),
        }
    }

    /// Key type name as found in the blob.
    pub fn key_type(&self) -> &'static str {
        match self {
            PublicHostKey::Ed25519(_) => "ssh-ed25519",
            PublicHostKey::Rsa { .. } => "ssh-rsa",
            PublicHostKey::EcdsaP256(_) => "ecdsa-sha2-nistp256",
            PublicHostKey::EcdsaP384(_) => "ecdsa-sha2-nistp384",
        }
    }

    /// Verifies an SSH signature blob (`string alg, string sig`) over `data`.
    ///
    /// The signature algorithm must be the negotiated one, and the key type
    /// must match it.
    pub fn verify(
        &self,
        algorithm: HostKeyAlgorithm,
        data: &[u8],
        signature_blob: &[u8],
    ) -> TernResult<()> {
        if algorithm.key_type() != self.key_type() {
            return Err(TernError::Security(format!(
                "Host key type {} does not match negotiated {}",
                self.key_type(),
                algorithm
            )));
        }

        let mut r = Reader::new(signature_blob);
        let sig_alg = r.read_str()?;
        let sig = r.read_string()?;
        if sig_alg != algorithm.name() {
            return Err(TernError::Security(format!(
                "Signature algorithm {} does not match negotiated {}",
                sig_alg, algorithm
            )));
        }

        let ok = match self {
            PublicHostKey::Ed25519(point) => {
                let key = VerifyingKey::from_bytes(point).map_err(|e| {
                    TernError::Security(format!("Invalid Ed25519 public key: {}", e))
                })?;
                let sig: [u8; 64] = sig.try_into().map_err(|_| {
                    TernError::Security("Ed25519 signature must be 64 bytes".to_string())
                })?;
                key.verify(data, &Signature::from_bytes(&sig)).is_ok()
            }
            PublicHostKey::Rsa { e, n } => {
                let params = match algorithm {
                    HostKeyAlgorithm::RsaSha2_512 => &RSA_PKCS1_2048_8192_SHA512,
                    HostKeyAlgorithm::RsaSha2_256 => &RSA_PKCS1_2048_8192_SHA256,
                    _ => &RSA_PKCS1_2048_8192_SHA1_FOR_LEGACY_USE_ONLY,
                };
                let components = RsaPublicKeyComponents { n, e };
                components.verify(params, data, sig).is_ok()
            }
            PublicHostKey::EcdsaP256(point) => {
                use signature::Verifier as _;
                let key = p256::ecdsa::VerifyingKey::from_sec1_bytes(point).map_err(|e| {
                    TernError::Security(format!("Invalid P-256 public key: {}", e))
                })?;
                let sig = p256::ecdsa::Signature::from_slice(&ecdsa_raw_signature(sig, 32)?)
                    .map_err(|e| TernError::Security(format!("Invalid P-256 signature: {}", e)))?;
                key.verify(data, &sig).is_ok()
            }
            PublicHostKey::EcdsaP384(point) => {
                use signature::Verifier as _;
                let key = p384::ecdsa::VerifyingKey::from_sec1_bytes(point).map_err(|e| {
                    TernError::Security(format!("Invalid P-384 public key: {}", e))
                })?;
                let sig = p384::ecdsa::Signature::from_slice(&ecdsa_raw_signature(sig, 48)?)
                    .map_err(|e| TernError::Security(format!("Invalid P-384 signature: {}", e)))?;
                key.verify(data, &sig).is_ok()
            }
        };

        if ok {
            Ok(())
        } else {
            Err(TernError::Security(
                "Host key signature verification failed".to_string(),
            ))
        }
    }
}

/// Converts `mpint r, mpint s` into fixed-width `r || s`.
fn ecdsa_raw_signature(sig: &[u8], width: usize) -> TernResult<Vec<u8>> {
    let mut r = Reader::new(sig);
    let rv = r.read_mpint()?;
    let sv = r.read_mpint()?;
    if rv.len() > width || sv.len() > width {
        return Err(TernError::Security(
            "ECDSA signature component too large".to_string(),
        ));
    }
    let mut out = vec![0u8; width * 2];
    out[width - rv.len()..width].copy_from_slice(rv);
    out[2 * width - sv.len()..].copy_from_slice(sv);
    Ok(out)
}

/// Signing side of a host key.
///
/// The client never signs with a host key; implementors exist so that
/// in-process test servers can authenticate a key exchange.
pub trait HostKey: Send + Sync {
    /// Get the algorithm identifier
    fn algorithm(&self) -> HostKeyAlgorithm;

    /// Get the public key in SSH wire format
    fn public_key_bytes(&self) -> Vec<u8>;

    /// Sign data and return an SSH signature blob
    fn sign(&self, data: &[u8]) -> TernResult<Vec<u8>>;
}

/// Ed25519 host key (ssh-ed25519)
#[derive(Clone)]
pub struct Ed25519HostKey {
    signing_key: SigningKey,
}

impl Ed25519HostKey {
    /// Generate a new Ed25519 key pair
    pub fn generate() -> TernResult<Self> {
        let mut csprng = rand::thread_rng();
        let secret_bytes: Zeroizing<[u8; SECRET_KEY_LENGTH]> =
            Zeroizing::new(rand::Rng::gen(&mut csprng));
        Ok(Self {
            signing_key: SigningKey::from_bytes(&secret_bytes),
        })
    }

    /// Create from raw key bytes (32-byte secret key)
    pub fn from_bytes(secret_bytes: &[u8]) -> TernResult<Self> {
        let key_bytes: [u8; SECRET_KEY_LENGTH] = secret_bytes.try_into().map_err(|_| {
            TernError::Security("Ed25519 secret key must be 32 bytes".to_string())
        })?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&key_bytes),
        })
    }
}

impl HostKey for Ed25519HostKey {
    fn algorithm(&self) -> HostKeyAlgorithm {
        HostKeyAlgorithm::SshEd25519
    }

    fn public_key_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        write_str(&mut buf, "ssh-ed25519");
        write_string(&mut buf, self.signing_key.verifying_key().as_bytes());
        buf.to_vec()
    }

    fn sign(&self, data: &[u8]) -> TernResult<Vec<u8>> {
        let signature = self.signing_key.sign(data);
        let mut buf = BytesMut::new();
        write_str(&mut buf, "ssh-ed25519");
        write_string(&mut buf, &signature.to_bytes());
        Ok(buf.to_vec())
    }
}

impl std::fmt::Debug for Ed25519HostKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519HostKey")
            .field("algorithm", &"ssh-ed25519")
            .field(
                "public_key",
                &hex::encode(self.signing_key.verifying_key().as_bytes()),
            )
            .finish_non_exhaustive()
    }
}

/// ECDSA host key with P-256 curve (ecdsa-sha2-nistp256)
pub struct EcdsaP256HostKey {
    signing_key: p256::ecdsa::SigningKey,
}

impl EcdsaP256HostKey {
    /// Generate a new ECDSA P-256 key pair
    pub fn generate() -> TernResult<Self> {
        Ok(Self {
            signing_key: p256::ecdsa::SigningKey::random(&mut rand::thread_rng()),
        })
    }
}

impl HostKey for EcdsaP256HostKey {
    fn algorithm(&self) -> HostKeyAlgorithm {
        HostKeyAlgorithm::EcdsaSha2Nistp256
    }

    fn public_key_bytes(&self) -> Vec<u8> {
        let point = self.signing_key.verifying_key().to_encoded_point(false);
        let mut buf = BytesMut::new();
        write_str(&mut buf, "ecdsa-sha2-nistp256");
        write_str(&mut buf, "nistp256");
        write_string(&mut buf, point.as_bytes());
        buf.to_vec()
    }

    fn sign(&self, data: &[u8]) -> TernResult<Vec<u8>> {
        use signature::Signer as _;
        let signature: p256::ecdsa::Signature = self.signing_key.sign(data);
        let (r, s) = signature.split_bytes();

        let mut inner = BytesMut::new();
        write_mpint(&mut inner, &r);
        write_mpint(&mut inner, &s);

        let mut buf = BytesMut::new();
        write_str(&mut buf, "ecdsa-sha2-nistp256");
        write_string(&mut buf, &inner);
        Ok(buf.to_vec())
    }
}

impl std::fmt::Debug for EcdsaP256HostKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EcdsaP256HostKey")
            .field("algorithm", &"ecdsa-sha2-nistp256")
            .finish_non_exhaustive()
    }
}
