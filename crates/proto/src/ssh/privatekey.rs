// Copyright (c) 2025 Tern Project
// SPDX-License-Identifier: MIT OR Apache-2.0

//! SSH private key loading and signing
//!
//! Supported encodings:
//!
//! - **PEM formats**:
//!   - PKCS#1 (BEGIN RSA PRIVATE KEY)
//!   - PKCS#8 (BEGIN PRIVATE KEY), RSA, Ed25519 and P-256
//!   - SEC1 (BEGIN EC PRIVATE KEY), P-256
//! - **OpenSSH format**: BEGIN OPENSSH PRIVATE KEY, unencrypted, Ed25519 and P-256
//!
//! Signatures are produced as SSH signature blobs (`string alg, string sig`)
//! ready to be placed into a `publickey` authentication request. RSA keys sign
//! with `rsa-sha2-256`.
//!
//! # Examples
//!
//! ```no_run
//! use tern_proto::ssh::privatekey::PrivateKey;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let key = PrivateKey::from_file("/home/user/.ssh/id_ed25519")?;
//! let blob = key.public_blob();
//! let signature = key.sign(b"data to sign")?;
//! # Ok(())
//! # }
//! ```

use crate::ssh::hostkey::fingerprint;
use crate::ssh::wire::{write_mpint, write_str, write_string, Reader};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::BytesMut;
use ed25519_dalek::Signer as _;
use std::path::Path;
use tern_platform::{TernError, TernResult};
use zeroize::Zeroizing;

const OPENSSH_MAGIC: &[u8] = b"openssh-key-v1\0";

/// A user private key.
#[derive(Clone)]
pub enum PrivateKey {
    /// Ed25519 key
    Ed25519(ed25519_dalek::SigningKey),
    /// RSA key
    Rsa(Box<rsa::RsaPrivateKey>),
    /// ECDSA key on NIST P-256
    EcdsaP256(p256::ecdsa::SigningKey),
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKey")
            .field("type", &self.key_type())
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

impl PrivateKey {
    /// Reads and parses a key file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> TernResult<Self> {
        let text = Zeroizing::new(std::fs::read_to_string(path.as_ref()).map_err(|e| {
            TernError::Config(format!(
                "Failed to read private key {}: {}",
                path.as_ref().display(),
                e
            ))
        })?);
        Self::parse(&text)
    }

    /// Parses any supported text encoding.
    pub fn parse(text: &str) -> TernResult<Self> {
        if text.contains("BEGIN OPENSSH PRIVATE KEY") {
            Self::from_openssh(text)
        } else {
            Self::from_pem(text)
        }
    }

    /// Parses a PKCS#1, PKCS#8 or SEC1 PEM document.
    pub fn from_pem(pem: &str) -> TernResult<Self> {
        if pem.contains("BEGIN RSA PRIVATE KEY") {
            use rsa::pkcs1::DecodeRsaPrivateKey;
            let key = rsa::RsaPrivateKey::from_pkcs1_pem(pem)
                .map_err(|e| TernError::Config(format!("Failed to parse PKCS#1: {}", e)))?;
            Ok(PrivateKey::Rsa(Box::new(key)))
        } else if pem.contains("BEGIN EC PRIVATE KEY") {
            let key = p256::SecretKey::from_sec1_pem(pem)
                .map_err(|e| TernError::Config(format!("Failed to parse SEC1: {}", e)))?;
            Ok(PrivateKey::EcdsaP256(key.into()))
        } else if pem.contains("BEGIN PRIVATE KEY") {
            Self::from_pkcs8(pem)
        } else if pem.contains("BEGIN ENCRYPTED PRIVATE KEY") {
            Err(TernError::Config(
                "Encrypted private keys are not supported".to_string(),
            ))
        } else {
            Err(TernError::Config("Unrecognized PEM format".to_string()))
        }
    }

    fn from_pkcs8(pem: &str) -> TernResult<Self> {
        {
            use rsa::pkcs8::DecodePrivateKey;
            if let Ok(key) = rsa::RsaPrivateKey::from_pkcs8_pem(pem) {
                return Ok(PrivateKey::Rsa(Box::new(key)));
            }
        }
        {
            use ed25519_dalek::pkcs8::DecodePrivateKey;
            if let Ok(key) = ed25519_dalek::SigningKey::from_pkcs8_pem(pem) {
                return Ok(PrivateKey::Ed25519(key));
            }
        }
        {
            use p256::pkcs8::DecodePrivateKey;
            if let Ok(key) = p256::SecretKey::from_pkcs8_pem(pem) {
                return Ok(PrivateKey::EcdsaP256(key.into()));
            }
        }
        Err(TernError::Config(
            "Failed to parse PKCS#8: unsupported key type".to_string(),
        ))
    }

    /// Parses an unencrypted `openssh-key-v1` document.
    pub fn from_openssh(text: &str) -> TernResult<Self> {
        let body: String = text
            .lines()
            .filter(|l| !l.starts_with("-----"))
            .map(str::trim)
            .collect();
        let der = Zeroizing::new(
            STANDARD
                .decode(body.as_bytes())
                .map_err(|e| TernError::Config(format!("Failed to decode base64: {}", e)))?,
        );

        let mut r = Reader::new(&der);
        if r.read_bytes(OPENSSH_MAGIC.len())? != OPENSSH_MAGIC {
            return Err(TernError::Config(
                "Not an openssh-key-v1 document".to_string(),
            ));
        }
        let cipher = r.read_str()?;
        let _kdf = r.read_str()?;
        let _kdf_options = r.read_string()?;
        if cipher != "none" {
            return Err(TernError::Config(format!(
                "Encrypted OpenSSH keys are not supported (cipher {})",
                cipher
            )));
        }
        let count = r.read_u32()?;
        if count != 1 {
            return Err(TernError::Config(format!(
                "Expected one key in OpenSSH document, found {}",
                count
            )));
        }
        let _public = r.read_string()?;
        let mut private = Reader::new(r.read_string()?);

        let check1 = private.read_u32()?;
        let check2 = private.read_u32()?;
        if check1 != check2 {
            return Err(TernError::Config(
                "OpenSSH key check bytes mismatch".to_string(),
            ));
        }

        match private.read_str()? {
            "ssh-ed25519" => {
                let _public = private.read_string()?;
                let secret = private.read_string()?;
                if secret.len() != 64 {
                    return Err(TernError::Config(
                        "Ed25519 private key must be 64 bytes".to_string(),
                    ));
                }
                let mut seed = Zeroizing::new([0u8; 32]);
                seed.copy_from_slice(&secret[..32]);
                Ok(PrivateKey::Ed25519(ed25519_dalek::SigningKey::from_bytes(
                    &seed,
                )))
            }
            "ecdsa-sha2-nistp256" => {
                let _curve = private.read_str()?;
                let _point = private.read_string()?;
                let scalar = private.read_mpint()?;
                let key = p256::ecdsa::SigningKey::from_slice(scalar)
                    .map_err(|e| TernError::Config(format!("Invalid P-256 scalar: {}", e)))?;
                Ok(PrivateKey::EcdsaP256(key))
            }
            other => Err(TernError::Config(format!(
                "Unsupported OpenSSH key type: {}",
                other
            ))),
        }
    }

    /// Key type as found in the public blob.
    pub fn key_type(&self) -> &'static str {
        match self {
            PrivateKey::Ed25519(_) => "ssh-ed25519",
            PrivateKey::Rsa(_) => "ssh-rsa",
            PrivateKey::EcdsaP256(_) => "ecdsa-sha2-nistp256",
        }
    }

    /// Signature algorithm named in authentication requests.
    pub fn algorithm(&self) -> &'static str {
        match self {
            PrivateKey::Rsa(_) => "rsa-sha2-256",
            other => other.key_type(),
        }
    }

    /// Public key in SSH wire format.
    pub fn public_blob(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        write_str(&mut buf, self.key_type());
        match self {
            PrivateKey::Ed25519(key) => {
                write_string(&mut buf, key.verifying_key().as_bytes());
            }
            PrivateKey::Rsa(key) => {
                use rsa::traits::PublicKeyParts;
                write_mpint(&mut buf, &key.e().to_bytes_be());
                write_mpint(&mut buf, &key.n().to_bytes_be());
            }
            PrivateKey::EcdsaP256(key) => {
                write_str(&mut buf, "nistp256");
                write_string(
                    &mut buf,
                    key.verifying_key().to_encoded_point(false).as_bytes(),
                );
            }
        }
        buf.to_vec()
    }

    /// SHA-256 fingerprint of the public key.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public_blob())
    }

    /// Signs `data` and returns an SSH signature blob.
    pub fn sign(&self, data: &[u8]) -> TernResult<Vec<u8>> {
        let raw = match self {
            PrivateKey::Ed25519(key) => key.sign(data).to_bytes().to_vec(),
            PrivateKey::Rsa(key) => {
                use rsa::signature::{SignatureEncoding, Signer};
                let signer = rsa::pkcs1v15::SigningKey::<sha2::Sha256>::new((**key).clone());
                signer
                    .try_sign(data)
                    .map_err(|e| TernError::Security(format!("RSA signing failed: {}", e)))?
                    .to_vec()
            }
            PrivateKey::EcdsaP256(key) => {
                use signature::Signer;
                let sig: p256::ecdsa::Signature = key
                    .try_sign(data)
                    .map_err(|e| TernError::Security(format!("ECDSA signing failed: {}", e)))?;
                let (r, s) = sig.split_bytes();
                let mut inner = BytesMut::new();
                write_mpint(&mut inner, &r);
                write_mpint(&mut inner, &s);
                inner.to_vec()
            }
        };

        let mut buf = BytesMut::new();
        write_str(&mut buf, self.algorithm());
        write_string(&mut buf, &raw);
        Ok(buf.to_vec())
    }
}
