//! SSH binary packet protocol (RFC 4253 Section 6).
//!
//! # Packet Format
//!
//! ```text
//! uint32    packet_length
//! byte      padding_length
//! byte[n1]  payload (n1 = packet_length - padding_length - 1)
//! byte[n2]  random padding (n2 = padding_length)
//! byte[m]   mac
//! ```
//!
//! # Constraints
//!
//! - `packet_length` does not include `mac` or the length field itself
//! - `padding_length` is at least 4
//! - `packet_length + 4` is a multiple of max(8, cipher block size)
//! - the MAC covers `uint32 sequence_number || packet` before encryption
//!
//! Sequence numbers start at zero, wrap at 2^32, and are never reset by a
//! rekey.
//!
//! # Example
//!
//! ```rust
//! use tern_proto::ssh::packet::{OpeningState, SealingState};
//!
//! let mut sealer = SealingState::plaintext();
//! let mut opener = OpeningState::plaintext();
//!
//! let wire = sealer.seal(b"\x05payload").unwrap();
//! opener.feed(&wire);
//! assert_eq!(opener.try_open().unwrap().unwrap(), b"\x05payload");
//! ```

use crate::ssh::crypto::{MacKey, NoneCipher, PacketCipher};
use crate::ssh::message::DisconnectReason;
use bytes::BytesMut;
use rand::RngCore;
use tern_platform::{TernError, TernResult};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Largest payload we are willing to send in a single packet.
pub const MAX_PAYLOAD_SIZE: usize = 256 * 1024;

/// Sanity ceiling for an incoming `packet_length`.
pub const MAX_PACKET_LENGTH: usize = 256 * 1024 + 1024;

/// Minimum padding length in bytes (RFC 4253 Section 6).
pub const MIN_PADDING_LEN: usize = 4;

/// Outgoing half of the packet layer.
pub struct SealingState {
    cipher: Box<dyn PacketCipher>,
    mac: Option<MacKey>,
    sequence: u32,
    bytes: u64,
}

impl std::fmt::Debug for SealingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealingState")
            .field("block_size", &self.cipher.block_size())
            .field("mac", &self.mac)
            .field("sequence", &self.sequence)
            .finish()
    }
}

impl SealingState {
    /// State before the first NEWKEYS: no encryption, no MAC.
    pub fn plaintext() -> Self {
        Self {
            cipher: Box::new(NoneCipher),
            mac: None,
            sequence: 0,
            bytes: 0,
        }
    }

    /// Installs a new cipher and MAC, keeping the sequence number.
    pub fn set_keys(&mut self, cipher: Box<dyn PacketCipher>, mac: Option<MacKey>) {
        self.cipher = cipher;
        self.mac = mac;
        self.bytes = 0;
    }

    /// Sequence number of the next packet.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Bytes sealed since the keys were last installed.
    pub fn bytes_since_rekey(&self) -> u64 {
        self.bytes
    }

    /// Frames, pads, MACs and encrypts one payload.
    pub fn seal(&mut self, payload: &[u8]) -> TernResult<Vec<u8>> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(TernError::Protocol(format!(
                "Payload too large: {} bytes (max {})",
                payload.len(),
                MAX_PAYLOAD_SIZE
            )));
        }

        let block_size = self.cipher.block_size().max(8);
        let unpadded = 5 + payload.len();
        let mut padding_len = block_size - (unpadded % block_size);
        if padding_len < MIN_PADDING_LEN {
            padding_len += block_size;
        }
        let packet_len = 1 + payload.len() + padding_len;

        let mut packet = Vec::with_capacity(4 + packet_len + 64);
        packet.extend_from_slice(&(packet_len as u32).to_be_bytes());
        packet.push(padding_len as u8);
        packet.extend_from_slice(payload);
        let mut padding = vec![0u8; padding_len];
        rand::thread_rng().fill_bytes(&mut padding);
        packet.extend_from_slice(&padding);

        let mac = match &self.mac {
            Some(key) => Some(key.compute(self.sequence, &packet)?),
            None => None,
        };

        self.cipher.apply(&mut packet)?;
        if let Some(mac) = mac {
            packet.extend_from_slice(&mac);
        }

        self.sequence = self.sequence.wrapping_add(1);
        self.bytes += packet.len() as u64;
        Ok(packet)
    }
}

struct PendingPacket {
    packet_len: usize,
    plain: Vec<u8>,
}

/// Incoming half of the packet layer.
///
/// Ciphertext is accumulated with [`feed`](Self::feed) (or read from a
/// stream by [`read_packet`](Self::read_packet)) and decoded only once a
/// whole packet is buffered, so abandoning a read never loses framing.
pub struct OpeningState {
    cipher: Box<dyn PacketCipher>,
    mac: Option<MacKey>,
    sequence: u32,
    bytes: u64,
    buffer: BytesMut,
    pending: Option<PendingPacket>,
}

impl std::fmt::Debug for OpeningState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpeningState")
            .field("block_size", &self.cipher.block_size())
            .field("mac", &self.mac)
            .field("sequence", &self.sequence)
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

impl OpeningState {
    /// State before the first NEWKEYS: no decryption, no MAC.
    pub fn plaintext() -> Self {
        Self {
            cipher: Box::new(NoneCipher),
            mac: None,
            sequence: 0,
            bytes: 0,
            buffer: BytesMut::with_capacity(64 * 1024),
            pending: None,
        }
    }

    /// Installs a new cipher and MAC, keeping the sequence number.
    ///
    /// Must be called between packets; bytes already buffered for later
    /// packets are decrypted with the new keys.
    pub fn set_keys(&mut self, cipher: Box<dyn PacketCipher>, mac: Option<MacKey>) {
        self.cipher = cipher;
        self.mac = mac;
        self.bytes = 0;
    }

    /// Sequence number of the next packet.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Bytes opened since the keys were last installed.
    pub fn bytes_since_rekey(&self) -> u64 {
        self.bytes
    }

    /// Appends raw bytes received from the peer.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Decodes the next packet if it is completely buffered.
    ///
    /// # Errors
    ///
    /// Length bounds violations, bad padding, and MAC mismatches are all
    /// fatal: the stream cannot be resynchronised afterwards.
    pub fn try_open(&mut self) -> TernResult<Option<Vec<u8>>> {
        let block_size = self.cipher.block_size().max(8);

        if self.pending.is_none() {
            if self.buffer.len() < block_size {
                return Ok(None);
            }
            let mut first = self.buffer.split_to(block_size).to_vec();
            self.cipher.apply(&mut first)?;

            let packet_len = u32::from_be_bytes([first[0], first[1], first[2], first[3]]) as usize;
            if packet_len + 4 < block_size {
                return Err(TernError::Protocol(format!(
                    "Packet length {} shorter than one cipher block",
                    packet_len
                )));
            }
            if packet_len > MAX_PACKET_LENGTH {
                return Err(TernError::Protocol(format!(
                    "Packet length {} exceeds maximum {}",
                    packet_len, MAX_PACKET_LENGTH
                )));
            }
            if (packet_len + 4) % block_size != 0 {
                return Err(TernError::Protocol(format!(
                    "Packet length {} not aligned to block size {}",
                    packet_len, block_size
                )));
            }
            self.pending = Some(PendingPacket {
                packet_len,
                plain: first,
            });
        }

        let (remaining, mac_len) = match &self.pending {
            Some(p) => (
                p.packet_len + 4 - p.plain.len(),
                self.mac.as_ref().map_or(0, |m| m.algorithm().mac_size()),
            ),
            None => return Ok(None),
        };
        if self.buffer.len() < remaining + mac_len {
            return Ok(None);
        }

        let mut pending = match self.pending.take() {
            Some(p) => p,
            None => return Ok(None),
        };
        let mut rest = self.buffer.split_to(remaining).to_vec();
        self.cipher.apply(&mut rest)?;
        pending.plain.extend_from_slice(&rest);

        if let Some(mac) = &self.mac {
            let received = self.buffer.split_to(mac_len);
            mac.verify(self.sequence, &pending.plain, &received)?;
        }

        let plain = pending.plain;
        let padding_len = plain[4] as usize;
        if padding_len < MIN_PADDING_LEN || padding_len + 1 > pending.packet_len {
            return Err(TernError::Protocol(format!(
                "Invalid padding length {} for packet length {}",
                padding_len, pending.packet_len
            )));
        }
        let payload_end = 4 + pending.packet_len - padding_len;
        let payload = plain[5..payload_end].to_vec();

        self.sequence = self.sequence.wrapping_add(1);
        self.bytes += (plain.len() + mac_len) as u64;
        Ok(Some(payload))
    }

    /// Reads from `reader` until one full packet is available.
    ///
    /// Cancel safe: bytes are only moved into the internal buffer, so a
    /// dropped future (for example on timeout) leaves the state intact.
    pub async fn read_packet<R>(&mut self, reader: &mut R) -> TernResult<Vec<u8>>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if let Some(payload) = self.try_open()? {
                return Ok(payload);
            }
            self.buffer.reserve(16 * 1024);
            let n = reader.read_buf(&mut self.buffer).await?;
            if n == 0 {
                return Err(TernError::Disconnected {
                    reason: DisconnectReason::ConnectionLost.code(),
                    description: "Connection closed by peer".to_string(),
                });
            }
        }
    }
}
