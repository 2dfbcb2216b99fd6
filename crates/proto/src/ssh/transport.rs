//! SSH transport layer session (RFC 4253).
//!
//! [`Transport`] owns the byte stream and everything the binary packet
//! protocol needs: sequence numbers, the active cipher and MAC in each
//! direction, the session identifier, and the negotiated algorithm set.
//!
//! # Lifecycle
//!
//! The session moves through a bitmask of stages, see [`Lifecycle`]:
//!
//! 1. **CONSTRUCTOR** - object exists
//! 2. **CONNECTED** - identification and first key exchange done
//! 3. **LOGIN_REQ** - `ssh-userauth` service accepted
//! 4. **LOGIN** - authenticated
//! 5. **SHELL** - an interactive shell is active
//!
//! Any fatal error ([`TernError::is_fatal`]) clears CONNECTED and discards
//! the keys. Every later operation fails with [`TernError::NotConnected`].
//!
//! # Filtering
//!
//! [`Transport::recv`] hides transport-level traffic from callers:
//! DISCONNECT fails the session, IGNORE and DEBUG are skipped, UNIMPLEMENTED
//! fails, and an unsolicited KEXINIT runs a full re-exchange before the next
//! real packet is returned.
//!
//! # Rekeying
//!
//! A new exchange starts automatically once either direction has carried
//! `rekey_bytes` since the last one, or on demand via [`Transport::rekey`].
//! Non-kex packets that arrive while an exchange is in flight are queued
//! and handed out afterwards in arrival order.

use crate::ssh::crypto::{Direction, MacKey};
use crate::ssh::hostkey::{fingerprint, HostKeyAlgorithm, PublicHostKey};
use crate::ssh::kex::{
    guess_was_wrong, negotiate, AlgorithmPreferences, KexInit, KexMethod, Negotiated, NewKeys,
};
use crate::ssh::kex_dh::{
    exchange_hash, Curve25519Exchange, DhExchange, DhGroup, ExchangeValues, HashTranscript,
    SessionKeys,
};
use crate::ssh::logging::{log_disconnect, log_kex_complete};
use crate::ssh::message::{describe, DisconnectReason, MessageType};
use crate::ssh::packet::{OpeningState, SealingState};
use crate::ssh::version::{self, Identification, Version};
use crate::ssh::wire::{write_biguint, write_str, write_string, write_u32, write_u8, Reader};
use bitflags::bitflags;
use bytes::BytesMut;
use std::collections::VecDeque;
use std::sync::Arc;
use tern_platform::{TernError, TernResult};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, info};

bitflags! {
    /// Session lifecycle bits. Stages accumulate; a fatal error clears them.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Lifecycle: u8 {
        /// Session object constructed
        const CONSTRUCTOR = 0x01;
        /// Transport established and keyed
        const CONNECTED = 0x02;
        /// User authentication service requested
        const LOGIN_REQ = 0x04;
        /// User authenticated
        const LOGIN = 0x08;
        /// Interactive shell active
        const SHELL = 0x10;
    }
}

/// Callback deciding whether to trust a server host key.
///
/// Arguments: the SHA-256 fingerprint and the raw public key blob.
pub type HostKeyCallback = Arc<dyn Fn(&str, &[u8]) -> bool + Send + Sync>;

/// Server host key trust policy.
#[derive(Clone, Default)]
pub enum HostKeyCheck {
    /// Accept any host key whose signature verifies
    #[default]
    AcceptAny,
    /// Accept only the key with this `SHA256:...` fingerprint
    Fingerprint(String),
    /// Ask a callback
    Custom(HostKeyCallback),
}

impl std::fmt::Debug for HostKeyCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostKeyCheck::AcceptAny => f.write_str("AcceptAny"),
            HostKeyCheck::Fingerprint(fp) => f.debug_tuple("Fingerprint").field(fp).finish(),
            HostKeyCheck::Custom(_) => f.write_str("Custom(<callback>)"),
        }
    }
}

impl HostKeyCheck {
    fn accepts(&self, blob: &[u8]) -> bool {
        let fp = fingerprint(blob);
        match self {
            HostKeyCheck::AcceptAny => true,
            HostKeyCheck::Fingerprint(expected) => *expected == fp,
            HostKeyCheck::Custom(callback) => callback(&fp, blob),
        }
    }
}

/// Bit-size window sent in SSH_MSG_KEX_DH_GEX_REQUEST (RFC 4419).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupExchangeBits {
    /// Minimal acceptable group size
    pub min: u32,
    /// Preferred group size
    pub preferred: u32,
    /// Maximal acceptable group size
    pub max: u32,
}

impl Default for GroupExchangeBits {
    fn default() -> Self {
        Self {
            min: 2048,
            preferred: 3072,
            max: 8192,
        }
    }
}

impl GroupExchangeBits {
    /// Rejects an inverted window.
    pub fn validate(&self) -> TernResult<()> {
        if self.min > self.preferred || self.preferred > self.max {
            return Err(TernError::Config(format!(
                "Invalid DH group exchange window: min {} preferred {} max {}",
                self.min, self.preferred, self.max
            )));
        }
        Ok(())
    }
}

/// Transport layer configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Our identification string
    pub version: Version,
    /// Algorithm preferences for KEXINIT
    pub preferences: AlgorithmPreferences,
    /// Group exchange window
    pub group_exchange: GroupExchangeBits,
    /// Bytes in either direction before an automatic rekey
    pub rekey_bytes: u64,
    /// Host key trust policy
    pub host_key_check: HostKeyCheck,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            version: Version::default_tern(),
            preferences: AlgorithmPreferences::default(),
            group_exchange: GroupExchangeBits::default(),
            rekey_bytes: 1 << 30,
            host_key_check: HostKeyCheck::AcceptAny,
        }
    }
}

/// An established SSH transport over stream `S`.
pub struct Transport<S> {
    stream: S,
    config: TransportConfig,
    ident: Identification,
    sealing: SealingState,
    opening: OpeningState,
    session_id: Option<Vec<u8>>,
    exchange_hash: Vec<u8>,
    negotiated: Option<Negotiated>,
    host_key: Vec<u8>,
    lifecycle: Lifecycle,
    deferred: VecDeque<Vec<u8>>,
    deadline: Option<Instant>,
    in_kex: bool,
}

impl<S> std::fmt::Debug for Transport<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("server", &self.ident.server)
            .field("lifecycle", &self.lifecycle)
            .field("negotiated", &self.negotiated)
            .finish_non_exhaustive()
    }
}

impl<S> Transport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Exchanges identification strings and runs the first key exchange.
    ///
    /// `deadline` bounds the whole handshake; expiry yields
    /// [`TernError::Timeout`].
    pub async fn handshake(
        mut stream: S,
        config: TransportConfig,
        deadline: Option<Instant>,
    ) -> TernResult<Self> {
        config.preferences.validate()?;
        config.group_exchange.validate()?;

        let ident = match deadline {
            Some(d) => tokio::time::timeout_at(d, version::exchange(&mut stream, &config.version))
                .await
                .map_err(|_| TernError::Timeout)??,
            None => version::exchange(&mut stream, &config.version).await?,
        };

        let mut transport = Self {
            stream,
            config,
            ident,
            sealing: SealingState::plaintext(),
            opening: OpeningState::plaintext(),
            session_id: None,
            exchange_hash: Vec::new(),
            negotiated: None,
            host_key: Vec::new(),
            lifecycle: Lifecycle::CONSTRUCTOR | Lifecycle::CONNECTED,
            deferred: VecDeque::new(),
            deadline,
            in_kex: false,
        };

        transport.key_exchange(None).await?;
        transport.deadline = None;
        Ok(transport)
    }

    /// Identification strings and pre-identification banner.
    pub fn identification(&self) -> &Identification {
        &self.ident
    }

    /// Session identifier (exchange hash of the first key exchange).
    pub fn session_id(&self) -> &[u8] {
        self.session_id.as_deref().unwrap_or(&[])
    }

    /// Exchange hash of the most recent key exchange.
    pub fn exchange_hash(&self) -> &[u8] {
        &self.exchange_hash
    }

    /// Algorithms in effect.
    pub fn negotiated(&self) -> Option<&Negotiated> {
        self.negotiated.as_ref()
    }

    /// Server host key blob.
    pub fn host_key(&self) -> &[u8] {
        &self.host_key
    }

    /// Current lifecycle bits.
    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// Sets lifecycle bits.
    pub fn mark(&mut self, bits: Lifecycle) {
        self.lifecycle.insert(bits);
    }

    /// Clears lifecycle bits.
    pub fn unmark(&mut self, bits: Lifecycle) {
        self.lifecycle.remove(bits);
    }

    /// Whether the session is still usable.
    pub fn is_connected(&self) -> bool {
        self.lifecycle.contains(Lifecycle::CONNECTED)
    }

    /// Sets the deadline for subsequent reads. `None` waits forever.
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    /// Packets sent and received so far, as sequence numbers.
    pub fn sequence_numbers(&self) -> (u32, u32) {
        (self.sealing.sequence(), self.opening.sequence())
    }

    /// Fails the session with an error detected above the transport, such
    /// as a channel window overrun. Fatal errors close the session.
    pub fn fail<T>(&mut self, err: TernError) -> TernResult<T> {
        self.check(Err(err))
    }

    fn ensure_connected(&self) -> TernResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(TernError::NotConnected)
        }
    }

    /// Marks the session dead on fatal errors and passes the result through.
    fn check<T>(&mut self, result: TernResult<T>) -> TernResult<T> {
        if let Err(e) = &result {
            if e.is_fatal() {
                debug!(error = %e, "Fatal transport error, session closed");
                self.kill();
            }
        }
        result
    }

    fn kill(&mut self) {
        self.lifecycle = Lifecycle::empty();
        self.sealing = SealingState::plaintext();
        self.opening = OpeningState::plaintext();
        self.deferred.clear();
    }

    fn needs_rekey(&self) -> bool {
        self.session_id.is_some()
            && !self.in_kex
            && (self.sealing.bytes_since_rekey() >= self.config.rekey_bytes
                || self.opening.bytes_since_rekey() >= self.config.rekey_bytes)
    }

    async fn write_raw(&mut self, payload: &[u8]) -> TernResult<()> {
        self.ensure_connected()?;
        let result = async {
            let packet = self.sealing.seal(payload)?;
            self.stream.write_all(&packet).await?;
            self.stream.flush().await?;
            Ok(())
        }
        .await;
        self.check(result)
    }

    async fn read_raw(&mut self) -> TernResult<Vec<u8>> {
        self.ensure_connected()?;
        let result = match self.deadline {
            Some(deadline) => {
                match tokio::time::timeout_at(deadline, self.opening.read_packet(&mut self.stream))
                    .await
                {
                    Ok(r) => r,
                    Err(_) => return Err(TernError::Timeout),
                }
            }
            None => self.opening.read_packet(&mut self.stream).await,
        };
        self.check(result)
    }

    /// Sends one payload, rekeying first if the byte threshold was crossed.
    pub async fn send(&mut self, payload: &[u8]) -> TernResult<()> {
        if self.needs_rekey() {
            self.key_exchange(None).await?;
        }
        self.write_raw(payload).await
    }

    /// Receives the next payload for the layers above the transport.
    pub async fn recv(&mut self) -> TernResult<Vec<u8>> {
        if let Some(payload) = self.deferred.pop_front() {
            return Ok(payload);
        }
        loop {
            if self.needs_rekey() {
                self.key_exchange(None).await?;
                if let Some(payload) = self.deferred.pop_front() {
                    return Ok(payload);
                }
            }
            let payload = self.read_raw().await?;
            if let Some(payload) = self.filter(payload)? {
                if payload[0] == MessageType::KexInit as u8 {
                    self.key_exchange(Some(payload)).await?;
                    if let Some(payload) = self.deferred.pop_front() {
                        return Ok(payload);
                    }
                    continue;
                }
                return Ok(payload);
            }
        }
    }

    /// Handles generic transport messages. Returns `None` when consumed.
    fn filter(&mut self, payload: Vec<u8>) -> TernResult<Option<Vec<u8>>> {
        let Some(&kind) = payload.first() else {
            let err = TernError::Protocol("Empty packet payload".to_string());
            return self.check(Err(err));
        };

        match MessageType::from_u8(kind) {
            Some(MessageType::Disconnect) => {
                let mut r = Reader::new(&payload[1..]);
                let reason = r.read_u32().unwrap_or(0);
                let description = r.read_lossy().unwrap_or_default();
                log_disconnect(reason, &description, true);
                let err = TernError::Disconnected {
                    reason,
                    description,
                };
                self.check(Err(err))
            }
            Some(MessageType::Ignore) => {
                debug!(len = payload.len(), "Ignoring SSH_MSG_IGNORE");
                Ok(None)
            }
            Some(MessageType::Debug) => {
                let mut r = Reader::new(&payload[1..]);
                let _always_display = r.read_bool().unwrap_or(false);
                let message = r.read_lossy().unwrap_or_default();
                debug!(message = %message, "Server debug message");
                Ok(None)
            }
            Some(MessageType::Unimplemented) => {
                let seq = Reader::new(&payload[1..]).read_u32().unwrap_or(0);
                let err = TernError::Protocol(format!(
                    "Server rejected our packet {} as unimplemented",
                    seq
                ));
                self.check(Err(err))
            }
            _ => Ok(Some(payload)),
        }
    }

    /// Starts a key exchange on demand.
    pub async fn rekey(&mut self) -> TernResult<()> {
        self.ensure_connected()?;
        self.key_exchange(None).await
    }

    /// Sends SSH_MSG_IGNORE with `data`.
    pub async fn send_ignore(&mut self, data: &[u8]) -> TernResult<()> {
        let mut buf = BytesMut::new();
        write_u8(&mut buf, MessageType::Ignore as u8);
        write_string(&mut buf, data);
        self.send(&buf).await
    }

    /// Sends SSH_MSG_DISCONNECT and tears the session down.
    ///
    /// Teardown is unconditional: state is discarded even if the write fails.
    pub async fn disconnect(&mut self, reason: DisconnectReason, description: &str) {
        self.disconnect_with(reason.code(), description).await;
    }

    async fn disconnect_with(&mut self, code: u32, description: &str) {
        if self.is_connected() {
            let mut buf = BytesMut::new();
            write_u8(&mut buf, MessageType::Disconnect as u8);
            write_u32(&mut buf, code);
            write_str(&mut buf, description);
            write_str(&mut buf, "");
            if let Ok(packet) = self.sealing.seal(&buf) {
                let _ = self.stream.write_all(&packet).await;
                let _ = self.stream.flush().await;
            }
            log_disconnect(code, description, false);
        }
        self.kill();
        let _ = self.stream.shutdown().await;
    }

    /// Reads the next key exchange message of the given type.
    ///
    /// Non-kex packets are queued for later delivery. A wrongly guessed kex
    /// packet from the server is skipped once.
    async fn read_kex_message(
        &mut self,
        expected: MessageType,
        discard_guess: &mut bool,
    ) -> TernResult<Vec<u8>> {
        loop {
            let payload = self.read_raw().await?;
            let Some(payload) = self.filter(payload)? else {
                continue;
            };
            let kind = payload[0];
            let in_kex_range = matches!(kind, 20..=49);
            if !in_kex_range {
                debug!(message = %describe(kind), "Deferring packet received during key exchange");
                self.deferred.push_back(payload);
                continue;
            }
            if *discard_guess && (30..=49).contains(&kind) {
                debug!("Discarding wrongly guessed key exchange packet");
                *discard_guess = false;
                continue;
            }
            if kind != expected as u8 {
                let err = TernError::Protocol(format!(
                    "Unexpected {} during key exchange, expected {}",
                    describe(kind),
                    expected
                ));
                return self.check(Err(err));
            }
            return Ok(payload);
        }
    }

    async fn key_exchange(&mut self, server_kexinit: Option<Vec<u8>>) -> TernResult<()> {
        self.in_kex = true;
        let result = self.run_key_exchange(server_kexinit).await;
        self.in_kex = false;
        if let Err(TernError::Negotiation { category, reason }) = &result {
            let description = format!("No matching {} algorithm", category);
            self.disconnect_with(*reason, &description).await;
        }
        let result = self.check(result);
        if result.is_err() && self.is_connected() {
            // A failed exchange cannot be resumed; the keys on each side differ.
            self.kill();
        }
        result
    }

    async fn run_key_exchange(&mut self, server_kexinit: Option<Vec<u8>>) -> TernResult<()> {
        let rekey = self.session_id.is_some();
        let client_init = KexInit::from_preferences(&self.config.preferences);
        let client_payload = client_init.to_bytes();
        self.write_raw(&client_payload).await?;

        let mut no_guess = false;
        let server_payload = match server_kexinit {
            Some(p) => p,
            None => self.read_kex_message(MessageType::KexInit, &mut no_guess).await?,
        };
        let server_init = KexInit::from_bytes(&server_payload)?;

        let negotiated = negotiate(&client_init, &server_init)?;
        let mut discard_guess = guess_was_wrong(&server_init, &negotiated);
        debug!(
            kex = negotiated.kex.name(),
            host_key = negotiated.host_key.name(),
            "Negotiated algorithms"
        );

        let hash = negotiated.kex.hash();
        let transcript_ids = (self.ident.client.clone(), self.ident.server.clone());

        let (host_key, shared_secret, h, signature) = match negotiated.kex.method() {
            KexMethod::Curve25519 => {
                let ours = Curve25519Exchange::new()?;
                let q_c = *ours.public_key();

                let mut buf = BytesMut::new();
                write_u8(&mut buf, MessageType::KexdhInit as u8);
                write_string(&mut buf, &q_c);
                self.write_raw(&buf).await?;

                let reply = self
                    .read_kex_message(MessageType::KexdhReply, &mut discard_guess)
                    .await?;
                let mut r = Reader::new(&reply[1..]);
                let host_key = r.read_string()?.to_vec();
                let q_s = r.read_string()?.to_vec();
                let signature = r.read_string()?.to_vec();

                let k = ours.compute_shared_secret(&q_s)?;
                let transcript = HashTranscript {
                    client_id: &transcript_ids.0,
                    server_id: &transcript_ids.1,
                    client_kexinit: &client_payload,
                    server_kexinit: &server_payload,
                    host_key: &host_key,
                };
                let values = ExchangeValues::Ecdh {
                    client: &q_c,
                    server: &q_s,
                };
                let h = exchange_hash(hash, &transcript, &values, &k);
                (host_key, k, h, signature)
            }
            KexMethod::FixedGroup(group) => {
                let ours = DhExchange::new(DhGroup::fixed(group), hash);

                let mut buf = BytesMut::new();
                write_u8(&mut buf, MessageType::KexdhInit as u8);
                write_biguint(&mut buf, ours.public_value());
                self.write_raw(&buf).await?;

                let reply = self
                    .read_kex_message(MessageType::KexdhReply, &mut discard_guess)
                    .await?;
                let mut r = Reader::new(&reply[1..]);
                let host_key = r.read_string()?.to_vec();
                let f = r.read_biguint()?;
                let signature = r.read_string()?.to_vec();

                let k = ours.compute_shared_secret(&f)?;
                let transcript = HashTranscript {
                    client_id: &transcript_ids.0,
                    server_id: &transcript_ids.1,
                    client_kexinit: &client_payload,
                    server_kexinit: &server_payload,
                    host_key: &host_key,
                };
                let values = ExchangeValues::Dh {
                    e: ours.public_value(),
                    f: &f,
                };
                let h = exchange_hash(hash, &transcript, &values, &k);
                (host_key, k, h, signature)
            }
            KexMethod::GroupExchange => {
                let bits = self.config.group_exchange;
                let mut buf = BytesMut::new();
                write_u8(&mut buf, MessageType::KexDhGexRequest as u8);
                write_u32(&mut buf, bits.min);
                write_u32(&mut buf, bits.preferred);
                write_u32(&mut buf, bits.max);
                self.write_raw(&buf).await?;

                // SSH_MSG_KEX_DH_GEX_GROUP shares number 31 with KEXDH_REPLY.
                let group_msg = self
                    .read_kex_message(MessageType::KexdhReply, &mut discard_guess)
                    .await?;
                let mut r = Reader::new(&group_msg[1..]);
                let p = r.read_biguint()?;
                let g = r.read_biguint()?;
                let group = DhGroup::new(p, g)?;
                let size = group.bits() as u32;
                if size < bits.min || size > bits.max {
                    return Err(TernError::Protocol(format!(
                        "Server DH group of {} bits outside [{}, {}]",
                        size, bits.min, bits.max
                    )));
                }

                let ours = DhExchange::new(group, hash);
                let mut buf = BytesMut::new();
                write_u8(&mut buf, MessageType::KexDhGexInit as u8);
                write_biguint(&mut buf, ours.public_value());
                self.write_raw(&buf).await?;

                let reply = self
                    .read_kex_message(MessageType::KexDhGexReply, &mut discard_guess)
                    .await?;
                let mut r = Reader::new(&reply[1..]);
                let host_key = r.read_string()?.to_vec();
                let f = r.read_biguint()?;
                let signature = r.read_string()?.to_vec();

                let k = ours.compute_shared_secret(&f)?;
                let transcript = HashTranscript {
                    client_id: &transcript_ids.0,
                    server_id: &transcript_ids.1,
                    client_kexinit: &client_payload,
                    server_kexinit: &server_payload,
                    host_key: &host_key,
                };
                let values = ExchangeValues::GroupExchange {
                    min: bits.min,
                    preferred: bits.preferred,
                    max: bits.max,
                    group: ours.group(),
                    e: ours.public_value(),
                    f: &f,
                };
                let h = exchange_hash(hash, &transcript, &values, &k);
                (host_key, k, h, signature)
            }
        };

        self.verify_host_key(negotiated.host_key, &host_key, &h, &signature)?;

        let session_id = self.session_id.get_or_insert_with(|| h.clone()).clone();
        let keys = SessionKeys::derive(hash, &shared_secret, &h, &session_id, &negotiated);

        self.write_raw(&NewKeys::new().to_bytes()).await?;
        self.sealing.set_keys(
            negotiated.cipher_client_to_server.build(
                Direction::Encrypt,
                &keys.enc_client_to_server,
                &keys.iv_client_to_server,
            )?,
            Some(MacKey::new(
                negotiated.mac_client_to_server,
                &keys.mac_client_to_server,
            )?),
        );

        let newkeys = self
            .read_kex_message(MessageType::NewKeys, &mut discard_guess)
            .await?;
        NewKeys::from_bytes(&newkeys)?;
        self.opening.set_keys(
            negotiated.cipher_server_to_client.build(
                Direction::Decrypt,
                &keys.enc_server_to_client,
                &keys.iv_server_to_client,
            )?,
            Some(MacKey::new(
                negotiated.mac_server_to_client,
                &keys.mac_server_to_client,
            )?),
        );

        log_kex_complete(&negotiated, &session_id, rekey);
        if !rekey {
            info!(
                server = %self.ident.server,
                fingerprint = %fingerprint(&host_key),
                "SSH transport established"
            );
        }

        self.exchange_hash = h;
        self.host_key = host_key;
        self.negotiated = Some(negotiated);
        Ok(())
    }

    fn verify_host_key(
        &self,
        algorithm: HostKeyAlgorithm,
        blob: &[u8],
        exchange_hash: &[u8],
        signature: &[u8],
    ) -> TernResult<()> {
        if !self.host_key.is_empty() && self.host_key != blob {
            return Err(TernError::Security(
                "Server host key changed during rekey".to_string(),
            ));
        }
        PublicHostKey::parse(blob)?.verify(algorithm, exchange_hash, signature)?;
        if !self.config.host_key_check.accepts(blob) {
            return Err(TernError::Security(format!(
                "Host key {} rejected by policy",
                fingerprint(blob)
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_bits() {
        let mut l = Lifecycle::CONSTRUCTOR | Lifecycle::CONNECTED;
        assert!(l.contains(Lifecycle::CONNECTED));
        l.insert(Lifecycle::LOGIN_REQ | Lifecycle::LOGIN);
        assert!(l.contains(Lifecycle::LOGIN));
        l.remove(Lifecycle::CONNECTED);
        assert!(!l.contains(Lifecycle::CONNECTED));
        assert_eq!(Lifecycle::SHELL.bits(), 16);
    }

    #[test]
    fn test_group_exchange_window() {
        assert!(GroupExchangeBits::default().validate().is_ok());
        let inverted = GroupExchangeBits {
            min: 4096,
            preferred: 2048,
            max: 8192,
        };
        assert!(matches!(inverted.validate(), Err(TernError::Config(_))));
    }

    #[test]
    fn test_host_key_check_policies() {
        let blob = b"some key blob";
        let fp = fingerprint(blob);
        assert!(HostKeyCheck::AcceptAny.accepts(blob));
        assert!(HostKeyCheck::Fingerprint(fp.clone()).accepts(blob));
        assert!(!HostKeyCheck::Fingerprint("SHA256:nope".into()).accepts(blob));

        let expected = fp.clone();
        let custom = HostKeyCheck::Custom(Arc::new(move |f, _| f == expected));
        assert!(custom.accepts(blob));
        assert_eq!(format!("{:?}", custom), "Custom(<callback>)");
    }

    #[tokio::test]
    async fn test_handshake_rejects_empty_preferences() {
        let (client, _server) = tokio::io::duplex(1024);
        let mut config = TransportConfig::default();
        config.preferences.cipher.clear();
        let err = Transport::handshake(client, config, None).await.unwrap_err();
        assert!(matches!(err, TernError::Config(_)));
    }

    #[tokio::test]
    async fn test_handshake_times_out() {
        let (client, _server) = tokio::io::duplex(1024);
        let deadline = Instant::now() + std::time::Duration::from_millis(50);
        let err = Transport::handshake(client, TransportConfig::default(), Some(deadline))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }
}
