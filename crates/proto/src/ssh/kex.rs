//! SSH algorithm negotiation (RFC 4253 Section 7.1).
//!
//! This module implements:
//! - SSH_MSG_KEXINIT and SSH_MSG_NEWKEYS
//! - the typed key exchange and compression algorithm tables
//! - the negotiation rule: per category, the first client-preferred
//!   algorithm that the server also offers
//!
//! # Key Exchange Flow
//!
//! 1. Both sides send SSH_MSG_KEXINIT
//! 2. Algorithm negotiation (first match wins)
//! 3. Key exchange (DH, DH group exchange or ECDH), see [`kex_dh`](super::kex_dh)
//! 4. Both sides send SSH_MSG_NEWKEYS
//! 5. Switch to the derived keys
//!
//! # Example
//!
//! ```rust
//! use tern_proto::ssh::kex::{negotiate, AlgorithmPreferences, KexInit};
//!
//! let prefs = AlgorithmPreferences::default();
//! let client = KexInit::from_preferences(&prefs);
//! let server = KexInit::from_preferences(&prefs);
//!
//! let negotiated = negotiate(&client, &server).unwrap();
//! assert_eq!(negotiated.kex.name(), "curve25519-sha256");
//! ```

use crate::ssh::crypto::{CipherAlgorithm, MacAlgorithm};
use crate::ssh::hostkey::HostKeyAlgorithm;
use crate::ssh::kex_dh::KexHash;
use crate::ssh::message::{DisconnectReason, MessageType};
use crate::ssh::wire::{write_bool, write_name_list, write_u32, write_u8, Reader};
use bytes::BytesMut;
use rand::RngCore;
use tern_platform::{TernError, TernResult};

/// Key exchange algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KexAlgorithm {
    /// curve25519-sha256 (RFC 8731)
    Curve25519Sha256,
    /// curve25519-sha256@libssh.org (pre-standard alias)
    Curve25519Sha256Libssh,
    /// diffie-hellman-group-exchange-sha256 (RFC 4419)
    DhGexSha256,
    /// diffie-hellman-group-exchange-sha1 (RFC 4419)
    DhGexSha1,
    /// diffie-hellman-group14-sha256 (RFC 8268)
    DhGroup14Sha256,
    /// diffie-hellman-group14-sha1 (RFC 4253)
    DhGroup14Sha1,
    /// diffie-hellman-group1-sha1 (RFC 4253)
    DhGroup1Sha1,
}

/// Shape of the exchange a kex algorithm performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KexMethod {
    /// X25519 scalar multiplication
    Curve25519,
    /// Prime-field DH over a fixed, well-known group
    FixedGroup(FixedGroup),
    /// Prime-field DH over a server-chosen group
    GroupExchange,
}

/// Well-known MODP groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixedGroup {
    /// Oakley group 2, 1024 bits
    Group1,
    /// RFC 3526 group 14, 2048 bits
    Group14,
}

impl KexAlgorithm {
    /// Every supported kex algorithm, in default preference order.
    pub const ALL: &'static [KexAlgorithm] = &[
        KexAlgorithm::Curve25519Sha256,
        KexAlgorithm::Curve25519Sha256Libssh,
        KexAlgorithm::DhGexSha256,
        KexAlgorithm::DhGroup14Sha256,
        KexAlgorithm::DhGroup14Sha1,
        KexAlgorithm::DhGexSha1,
        KexAlgorithm::DhGroup1Sha1,
    ];

    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            KexAlgorithm::Curve25519Sha256 => "curve25519-sha256",
            KexAlgorithm::Curve25519Sha256Libssh => "curve25519-sha256@libssh.org",
            KexAlgorithm::DhGexSha256 => "diffie-hellman-group-exchange-sha256",
            KexAlgorithm::DhGexSha1 => "diffie-hellman-group-exchange-sha1",
            KexAlgorithm::DhGroup14Sha256 => "diffie-hellman-group14-sha256",
            KexAlgorithm::DhGroup14Sha1 => "diffie-hellman-group14-sha1",
            KexAlgorithm::DhGroup1Sha1 => "diffie-hellman-group1-sha1",
        }
    }

    /// Parses a kex algorithm from its name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|alg| alg.name() == name)
    }

    /// Hash used for the exchange hash and key derivation.
    pub fn hash(&self) -> KexHash {
        match self {
            KexAlgorithm::Curve25519Sha256
            | KexAlgorithm::Curve25519Sha256Libssh
            | KexAlgorithm::DhGexSha256
            | KexAlgorithm::DhGroup14Sha256 => KexHash::Sha256,
            KexAlgorithm::DhGexSha1 | KexAlgorithm::DhGroup14Sha1 | KexAlgorithm::DhGroup1Sha1 => {
                KexHash::Sha1
            }
        }
    }

    /// Exchange method.
    pub fn method(&self) -> KexMethod {
        match self {
            KexAlgorithm::Curve25519Sha256 | KexAlgorithm::Curve25519Sha256Libssh => {
                KexMethod::Curve25519
            }
            KexAlgorithm::DhGexSha256 | KexAlgorithm::DhGexSha1 => KexMethod::GroupExchange,
            KexAlgorithm::DhGroup14Sha256 | KexAlgorithm::DhGroup14Sha1 => {
                KexMethod::FixedGroup(FixedGroup::Group14)
            }
            KexAlgorithm::DhGroup1Sha1 => KexMethod::FixedGroup(FixedGroup::Group1),
        }
    }
}

impl std::fmt::Display for KexAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Compression algorithm. Only `none` is offered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompressionAlgorithm {
    /// No compression
    None,
}

impl CompressionAlgorithm {
    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        "none"
    }

    /// Parses a compression algorithm from its name.
    pub fn from_name(name: &str) -> Option<Self> {
        (name == "none").then_some(CompressionAlgorithm::None)
    }
}

/// Ordered algorithm preferences for each negotiable category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlgorithmPreferences {
    /// Key exchange algorithms
    pub kex: Vec<KexAlgorithm>,
    /// Server host key algorithms
    pub host_key: Vec<HostKeyAlgorithm>,
    /// Ciphers, used for both directions
    pub cipher: Vec<CipherAlgorithm>,
    /// MACs, used for both directions
    pub mac: Vec<MacAlgorithm>,
}

impl Default for AlgorithmPreferences {
    fn default() -> Self {
        Self {
            kex: KexAlgorithm::ALL.to_vec(),
            host_key: HostKeyAlgorithm::ALL.to_vec(),
            cipher: CipherAlgorithm::ALL.to_vec(),
            mac: MacAlgorithm::ALL.to_vec(),
        }
    }
}

impl AlgorithmPreferences {
    /// Rejects empty categories.
    pub fn validate(&self) -> TernResult<()> {
        let empty = [
            ("kex", self.kex.is_empty()),
            ("host key", self.host_key.is_empty()),
            ("cipher", self.cipher.is_empty()),
            ("mac", self.mac.is_empty()),
        ];
        for (category, is_empty) in empty {
            if is_empty {
                return Err(TernError::Config(format!(
                    "Empty {} algorithm preference list",
                    category
                )));
            }
        }
        Ok(())
    }
}

/// SSH_MSG_KEXINIT message (RFC 4253 Section 7.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexInit {
    cookie: [u8; 16],
    kex_algorithms: Vec<String>,
    server_host_key_algorithms: Vec<String>,
    encryption_client_to_server: Vec<String>,
    encryption_server_to_client: Vec<String>,
    mac_client_to_server: Vec<String>,
    mac_server_to_client: Vec<String>,
    compression_client_to_server: Vec<String>,
    compression_server_to_client: Vec<String>,
    languages_client_to_server: Vec<String>,
    languages_server_to_client: Vec<String>,
    first_kex_packet_follows: bool,
}

fn names<T, F: Fn(&T) -> &'static str>(items: &[T], f: F) -> Vec<String> {
    items.iter().map(|i| f(i).to_string()).collect()
}

impl KexInit {
    /// Builds a KEXINIT with a fresh random cookie from typed preferences.
    pub fn from_preferences(prefs: &AlgorithmPreferences) -> Self {
        let mut cookie = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut cookie);

        let ciphers = names(&prefs.cipher, CipherAlgorithm::name);
        let macs = names(&prefs.mac, MacAlgorithm::name);
        let compression = vec![CompressionAlgorithm::None.name().to_string()];

        Self {
            cookie,
            kex_algorithms: names(&prefs.kex, KexAlgorithm::name),
            server_host_key_algorithms: names(&prefs.host_key, HostKeyAlgorithm::name),
            encryption_client_to_server: ciphers.clone(),
            encryption_server_to_client: ciphers,
            mac_client_to_server: macs.clone(),
            mac_server_to_client: macs,
            compression_client_to_server: compression.clone(),
            compression_server_to_client: compression,
            languages_client_to_server: Vec::new(),
            languages_server_to_client: Vec::new(),
            first_kex_packet_follows: false,
        }
    }

    /// Returns the cookie.
    pub fn cookie(&self) -> &[u8; 16] {
        &self.cookie
    }

    /// Returns the key exchange algorithms.
    pub fn kex_algorithms(&self) -> &[String] {
        &self.kex_algorithms
    }

    /// Returns the server host key algorithms.
    pub fn server_host_key_algorithms(&self) -> &[String] {
        &self.server_host_key_algorithms
    }

    /// Returns the first_kex_packet_follows flag.
    pub fn first_kex_packet_follows(&self) -> bool {
        self.first_kex_packet_follows
    }

    /// Serializes to an SSH_MSG_KEXINIT payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(512);
        write_u8(&mut buf, MessageType::KexInit as u8);
        buf.extend_from_slice(&self.cookie);
        for list in self.lists() {
            write_name_list(&mut buf, list);
        }
        write_bool(&mut buf, self.first_kex_packet_follows);
        write_u32(&mut buf, 0);
        buf.to_vec()
    }

    /// Parses an SSH_MSG_KEXINIT payload.
    pub fn from_bytes(data: &[u8]) -> TernResult<Self> {
        let mut r = Reader::new(data);
        let msg_type = r.read_u8()?;
        if msg_type != MessageType::KexInit as u8 {
            return Err(TernError::Protocol(format!(
                "Invalid message type: expected {} (SSH_MSG_KEXINIT), got {}",
                MessageType::KexInit as u8,
                msg_type
            )));
        }

        let mut cookie = [0u8; 16];
        cookie.copy_from_slice(r.read_bytes(16)?);

        let kex_init = Self {
            cookie,
            kex_algorithms: r.read_name_list()?,
            server_host_key_algorithms: r.read_name_list()?,
            encryption_client_to_server: r.read_name_list()?,
            encryption_server_to_client: r.read_name_list()?,
            mac_client_to_server: r.read_name_list()?,
            mac_server_to_client: r.read_name_list()?,
            compression_client_to_server: r.read_name_list()?,
            compression_server_to_client: r.read_name_list()?,
            languages_client_to_server: r.read_name_list()?,
            languages_server_to_client: r.read_name_list()?,
            first_kex_packet_follows: r.read_bool()?,
        };
        let _reserved = r.read_u32()?;
        Ok(kex_init)
    }

    fn lists(&self) -> [&Vec<String>; 10] {
        [
            &self.kex_algorithms,
            &self.server_host_key_algorithms,
            &self.encryption_client_to_server,
            &self.encryption_server_to_client,
            &self.mac_client_to_server,
            &self.mac_server_to_client,
            &self.compression_client_to_server,
            &self.compression_server_to_client,
            &self.languages_client_to_server,
            &self.languages_server_to_client,
        ]
    }
}

/// SSH_MSG_NEWKEYS message (RFC 4253 Section 7.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NewKeys;

impl NewKeys {
    /// Creates a new NEWKEYS message.
    pub const fn new() -> Self {
        Self
    }

    /// Serializes to a payload (a single byte).
    pub fn to_bytes(&self) -> Vec<u8> {
        vec![MessageType::NewKeys as u8]
    }

    /// Parses a NEWKEYS payload.
    pub fn from_bytes(data: &[u8]) -> TernResult<Self> {
        match data.first() {
            Some(&t) if t == MessageType::NewKeys as u8 => Ok(Self),
            Some(&t) => Err(TernError::Protocol(format!(
                "Invalid message type: expected {} (SSH_MSG_NEWKEYS), got {}",
                MessageType::NewKeys as u8,
                t
            ))),
            None => Err(TernError::Protocol("Empty NEWKEYS message".to_string())),
        }
    }
}

/// Outcome of algorithm negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    /// Key exchange algorithm
    pub kex: KexAlgorithm,
    /// Server host key algorithm
    pub host_key: HostKeyAlgorithm,
    /// Cipher client to server
    pub cipher_client_to_server: CipherAlgorithm,
    /// Cipher server to client
    pub cipher_server_to_client: CipherAlgorithm,
    /// MAC client to server
    pub mac_client_to_server: MacAlgorithm,
    /// MAC server to client
    pub mac_server_to_client: MacAlgorithm,
    /// Compression client to server
    pub compression_client_to_server: CompressionAlgorithm,
    /// Compression server to client
    pub compression_server_to_client: CompressionAlgorithm,
}

/// Picks the first client-preferred algorithm the server also offers.
pub fn negotiate_algorithm(
    category: &str,
    client_list: &[String],
    server_list: &[String],
) -> TernResult<String> {
    client_list
        .iter()
        .find(|alg| server_list.contains(alg))
        .cloned()
        .ok_or_else(|| TernError::Negotiation {
            category: category.to_string(),
            reason: DisconnectReason::KeyExchangeFailed.code(),
        })
}

fn pick<T>(
    category: &str,
    client: &[String],
    server: &[String],
    parse: fn(&str) -> Option<T>,
) -> TernResult<T> {
    let name = negotiate_algorithm(category, client, server)?;
    parse(&name).ok_or_else(|| TernError::Negotiation {
        category: category.to_string(),
        reason: DisconnectReason::KeyExchangeFailed.code(),
    })
}

/// Negotiates every category. The client's preference order decides.
pub fn negotiate(client: &KexInit, server: &KexInit) -> TernResult<Negotiated> {
    Ok(Negotiated {
        kex: pick(
            "kex",
            &client.kex_algorithms,
            &server.kex_algorithms,
            KexAlgorithm::from_name,
        )?,
        host_key: pick(
            "host key",
            &client.server_host_key_algorithms,
            &server.server_host_key_algorithms,
            HostKeyAlgorithm::from_name,
        )?,
        cipher_client_to_server: pick(
            "cipher client->server",
            &client.encryption_client_to_server,
            &server.encryption_client_to_server,
            CipherAlgorithm::from_name,
        )?,
        cipher_server_to_client: pick(
            "cipher server->client",
            &client.encryption_server_to_client,
            &server.encryption_server_to_client,
            CipherAlgorithm::from_name,
        )?,
        mac_client_to_server: pick(
            "mac client->server",
            &client.mac_client_to_server,
            &server.mac_client_to_server,
            MacAlgorithm::from_name,
        )?,
        mac_server_to_client: pick(
            "mac server->client",
            &client.mac_server_to_client,
            &server.mac_server_to_client,
            MacAlgorithm::from_name,
        )?,
        compression_client_to_server: pick(
            "compression client->server",
            &client.compression_client_to_server,
            &server.compression_client_to_server,
            CompressionAlgorithm::from_name,
        )?,
        compression_server_to_client: pick(
            "compression server->client",
            &client.compression_server_to_client,
            &server.compression_server_to_client,
            CompressionAlgorithm::from_name,
        )?,
    })
}

/// True when the peer sent a guessed kex packet that must be discarded.
///
/// The guess is right only if the peer's first kex and host key algorithms
/// are the negotiated ones (RFC 4253 Section 7.1).
pub fn guess_was_wrong(peer: &KexInit, negotiated: &Negotiated) -> bool {
    if !peer.first_kex_packet_follows {
        return false;
    }
    let kex_ok = peer.kex_algorithms.first().map(String::as_str) == Some(negotiated.kex.name());
    let host_ok = peer.server_host_key_algorithms.first().map(String::as_str)
        == Some(negotiated.host_key.name());
    !(kex_ok && host_ok)
}
