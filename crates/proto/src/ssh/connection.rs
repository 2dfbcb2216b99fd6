//! SSH connection protocol messages (RFC 4254).
//!
//! This module implements the wire format of the connection layer:
//! - Channel open, confirmation and failure
//! - Flow control (window adjust)
//! - Data and extended data (stderr)
//! - Channel requests: pty-req, env, exec, shell, subsystem, window-change,
//!   exit-status, exit-signal, auth-agent-req@openssh.com
//! - Global requests and their replies
//!
//! The multiplexer that drives these messages lives in
//! [`client`](crate::ssh::client).
//!
//! # Example
//!
//! ```rust
//! use tern_proto::ssh::connection::{ChannelOpen, ChannelType};
//!
//! // Open a session channel
//! let open = ChannelOpen::new(
//!     ChannelType::Session,
//!     0,           // sender channel
//!     2097152,     // initial window size (2MB)
//!     32768,       // maximum packet size (32KB)
//! );
//! assert_eq!(open.to_bytes()[0], 90);
//! ```

use crate::ssh::message::MessageType;
use crate::ssh::wire::{write_bool, write_str, write_string, write_u32, write_u8, Reader};
use bytes::BytesMut;
use tern_platform::{TernError, TernResult};

/// Default initial receive window (2 MB).
pub const DEFAULT_WINDOW_SIZE: u32 = 2 * 1024 * 1024;

/// Default maximum packet size we accept (32 KB).
pub const DEFAULT_MAX_PACKET_SIZE: u32 = 32 * 1024;

/// Largest maximum packet size honoured from a peer (256 KB).
pub const MAX_PACKET_SIZE: u32 = 256 * 1024;

/// Reads the message number and checks it.
fn expect_type(r: &mut Reader<'_>, expected: MessageType) -> TernResult<()> {
    let kind = r.read_u8()?;
    if kind != expected as u8 {
        return Err(TernError::Protocol(format!(
            "Invalid message type: expected {} ({}), got {}",
            expected as u8,
            expected.name(),
            kind
        )));
    }
    Ok(())
}

/// Channel type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelType {
    /// Session channel (exec, shell, subsystem).
    Session,
    /// Any other type. Only ever seen on server-initiated opens, which are
    /// refused.
    Other(String),
}

impl ChannelType {
    /// Returns the channel type name.
    pub fn name(&self) -> &str {
        match self {
            ChannelType::Session => "session",
            ChannelType::Other(name) => name,
        }
    }
}

/// SSH_MSG_CHANNEL_OPEN message (RFC 4254 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpen {
    channel_type: ChannelType,
    sender_channel: u32,
    initial_window_size: u32,
    maximum_packet_size: u32,
}

impl ChannelOpen {
    /// Creates a new channel open message.
    pub fn new(
        channel_type: ChannelType,
        sender_channel: u32,
        initial_window_size: u32,
        maximum_packet_size: u32,
    ) -> Self {
        Self {
            channel_type,
            sender_channel,
            initial_window_size,
            maximum_packet_size,
        }
    }

    /// Returns the channel type.
    pub fn channel_type(&self) -> &ChannelType {
        &self.channel_type
    }

    /// Returns the sender channel number.
    pub fn sender_channel(&self) -> u32 {
        self.sender_channel
    }

    /// Returns the initial window size.
    pub fn initial_window_size(&self) -> u32 {
        self.initial_window_size
    }

    /// Returns the maximum packet size.
    pub fn maximum_packet_size(&self) -> u32 {
        self.maximum_packet_size
    }

    /// Serializes to bytes.
    ///
    /// Format (RFC 4254 Section 5.1):
    /// ```text
    /// byte      SSH_MSG_CHANNEL_OPEN (90)
    /// string    channel type
    /// uint32    sender channel
    /// uint32    initial window size
    /// uint32    maximum packet size
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        write_u8(&mut buf, MessageType::ChannelOpen as u8);
        write_str(&mut buf, self.channel_type.name());
        write_u32(&mut buf, self.sender_channel);
        write_u32(&mut buf, self.initial_window_size);
        write_u32(&mut buf, self.maximum_packet_size);
        buf.to_vec()
    }

    /// Parses from bytes. Type specific trailing data is ignored.
    pub fn from_bytes(data: &[u8]) -> TernResult<Self> {
        let mut r = Reader::new(data);
        expect_type(&mut r, MessageType::ChannelOpen)?;
        let channel_type = match r.read_str()? {
            "session" => ChannelType::Session,
            other => ChannelType::Other(other.to_string()),
        };
        Ok(Self {
            channel_type,
            sender_channel: r.read_u32()?,
            initial_window_size: r.read_u32()?,
            maximum_packet_size: r.read_u32()?,
        })
    }
}

/// SSH_MSG_CHANNEL_OPEN_CONFIRMATION message (RFC 4254 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpenConfirmation {
    recipient_channel: u32,
    sender_channel: u32,
    initial_window_size: u32,
    maximum_packet_size: u32,
}

impl ChannelOpenConfirmation {
    /// Creates a new channel open confirmation message.
    pub fn new(
        recipient_channel: u32,
        sender_channel: u32,
        initial_window_size: u32,
        maximum_packet_size: u32,
    ) -> Self {
        Self {
            recipient_channel,
            sender_channel,
            initial_window_size,
            maximum_packet_size,
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the sender channel number.
    pub fn sender_channel(&self) -> u32 {
        self.sender_channel
    }

    /// Returns the initial window size.
    pub fn initial_window_size(&self) -> u32 {
        self.initial_window_size
    }

    /// Returns the maximum packet size.
    pub fn maximum_packet_size(&self) -> u32 {
        self.maximum_packet_size
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        write_u8(&mut buf, MessageType::ChannelOpenConfirmation as u8);
        write_u32(&mut buf, self.recipient_channel);
        write_u32(&mut buf, self.sender_channel);
        write_u32(&mut buf, self.initial_window_size);
        write_u32(&mut buf, self.maximum_packet_size);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TernResult<Self> {
        let mut r = Reader::new(data);
        expect_type(&mut r, MessageType::ChannelOpenConfirmation)?;
        Ok(Self {
            recipient_channel: r.read_u32()?,
            sender_channel: r.read_u32()?,
            initial_window_size: r.read_u32()?,
            maximum_packet_size: r.read_u32()?,
        })
    }
}

/// Channel open failure reason codes (RFC 4254 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ChannelOpenFailureReason {
    /// Administratively prohibited
    AdministrativelyProhibited = 1,
    /// Connect failed
    ConnectFailed = 2,
    /// Unknown channel type
    UnknownChannelType = 3,
    /// Resource shortage
    ResourceShortage = 4,
}

impl ChannelOpenFailureReason {
    /// Converts from u32.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::AdministrativelyProhibited),
            2 => Some(Self::ConnectFailed),
            3 => Some(Self::UnknownChannelType),
            4 => Some(Self::ResourceShortage),
            _ => None,
        }
    }

    /// Returns the reason as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AdministrativelyProhibited => "Administratively prohibited",
            Self::ConnectFailed => "Connect failed",
            Self::UnknownChannelType => "Unknown channel type",
            Self::ResourceShortage => "Resource shortage",
        }
    }
}

/// SSH_MSG_CHANNEL_OPEN_FAILURE message (RFC 4254 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpenFailure {
    recipient_channel: u32,
    reason_code: u32,
    description: String,
}

impl ChannelOpenFailure {
    /// Creates a failure with a description.
    pub fn new(
        recipient_channel: u32,
        reason: ChannelOpenFailureReason,
        description: impl Into<String>,
    ) -> Self {
        Self {
            recipient_channel,
            reason_code: reason as u32,
            description: description.into(),
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the raw reason code.
    pub fn reason_code(&self) -> u32 {
        self.reason_code
    }

    /// Returns the description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        write_u8(&mut buf, MessageType::ChannelOpenFailure as u8);
        write_u32(&mut buf, self.recipient_channel);
        write_u32(&mut buf, self.reason_code);
        write_str(&mut buf, &self.description);
        write_str(&mut buf, "");
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TernResult<Self> {
        let mut r = Reader::new(data);
        expect_type(&mut r, MessageType::ChannelOpenFailure)?;
        Ok(Self {
            recipient_channel: r.read_u32()?,
            reason_code: r.read_u32()?,
            description: r.read_lossy()?,
        })
    }
}

impl std::fmt::Display for ChannelOpenFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = ChannelOpenFailureReason::from_u32(self.reason_code)
            .map(|r| r.as_str())
            .unwrap_or("Unknown reason");
        if self.description.is_empty() {
            write!(f, "{} ({})", reason, self.reason_code)
        } else {
            write!(f, "{} ({}): {}", reason, self.reason_code, self.description)
        }
    }
}

/// SSH_MSG_CHANNEL_WINDOW_ADJUST message (RFC 4254 Section 5.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelWindowAdjust {
    recipient_channel: u32,
    bytes_to_add: u32,
}

impl ChannelWindowAdjust {
    /// Creates a new window adjust message.
    pub fn new(recipient_channel: u32, bytes_to_add: u32) -> Self {
        Self {
            recipient_channel,
            bytes_to_add,
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the bytes to add.
    pub fn bytes_to_add(&self) -> u32 {
        self.bytes_to_add
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        write_u8(&mut buf, MessageType::ChannelWindowAdjust as u8);
        write_u32(&mut buf, self.recipient_channel);
        write_u32(&mut buf, self.bytes_to_add);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TernResult<Self> {
        let mut r = Reader::new(data);
        expect_type(&mut r, MessageType::ChannelWindowAdjust)?;
        Ok(Self {
            recipient_channel: r.read_u32()?,
            bytes_to_add: r.read_u32()?,
        })
    }
}

/// SSH_MSG_CHANNEL_DATA message (RFC 4254 Section 5.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelData {
    recipient_channel: u32,
    data: Vec<u8>,
}

impl ChannelData {
    /// Creates a new data message.
    pub fn new(recipient_channel: u32, data: Vec<u8>) -> Self {
        Self {
            recipient_channel,
            data,
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the data.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the message and returns the data.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Encodes a data message without copying `data` into a struct first.
    pub fn encode(recipient_channel: u32, data: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(9 + data.len());
        write_u8(&mut buf, MessageType::ChannelData as u8);
        write_u32(&mut buf, recipient_channel);
        write_string(&mut buf, data);
        buf.to_vec()
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        Self::encode(self.recipient_channel, &self.data)
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TernResult<Self> {
        let mut r = Reader::new(data);
        expect_type(&mut r, MessageType::ChannelData)?;
        Ok(Self {
            recipient_channel: r.read_u32()?,
            data: r.read_string()?.to_vec(),
        })
    }
}

/// Extended data type code for stderr (RFC 4254 Section 5.2).
pub const SSH_EXTENDED_DATA_STDERR: u32 = 1;

/// SSH_MSG_CHANNEL_EXTENDED_DATA message (RFC 4254 Section 5.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelExtendedData {
    recipient_channel: u32,
    data_type_code: u32,
    data: Vec<u8>,
}

impl ChannelExtendedData {
    /// Creates a new extended data message.
    pub fn new(recipient_channel: u32, data_type_code: u32, data: Vec<u8>) -> Self {
        Self {
            recipient_channel,
            data_type_code,
            data,
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the data type code.
    pub fn data_type_code(&self) -> u32 {
        self.data_type_code
    }

    /// Consumes the message and returns the data.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        write_u8(&mut buf, MessageType::ChannelExtendedData as u8);
        write_u32(&mut buf, self.recipient_channel);
        write_u32(&mut buf, self.data_type_code);
        write_string(&mut buf, &self.data);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TernResult<Self> {
        let mut r = Reader::new(data);
        expect_type(&mut r, MessageType::ChannelExtendedData)?;
        Ok(Self {
            recipient_channel: r.read_u32()?,
            data_type_code: r.read_u32()?,
            data: r.read_string()?.to_vec(),
        })
    }
}

macro_rules! recipient_only_message {
    ($(#[$doc:meta])* $name:ident, $kind:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name {
            recipient_channel: u32,
        }

        impl $name {
            /// Creates the message.
            pub fn new(recipient_channel: u32) -> Self {
                Self { recipient_channel }
            }

            /// Returns the recipient channel number.
            pub fn recipient_channel(&self) -> u32 {
                self.recipient_channel
            }

            /// Serializes to bytes.
            pub fn to_bytes(&self) -> Vec<u8> {
                let mut buf = BytesMut::with_capacity(5);
                write_u8(&mut buf, $kind as u8);
                write_u32(&mut buf, self.recipient_channel);
                buf.to_vec()
            }

            /// Parses from bytes.
            pub fn from_bytes(data: &[u8]) -> TernResult<Self> {
                let mut r = Reader::new(data);
                expect_type(&mut r, $kind)?;
                Ok(Self {
                    recipient_channel: r.read_u32()?,
                })
            }
        }
    };
}

recipient_only_message!(
    /// SSH_MSG_CHANNEL_EOF message (RFC 4254 Section 5.3).
    ChannelEof,
    MessageType::ChannelEof
);
recipient_only_message!(
    /// SSH_MSG_CHANNEL_CLOSE message (RFC 4254 Section 5.3).
    ChannelClose,
    MessageType::ChannelClose
);
recipient_only_message!(
    /// SSH_MSG_CHANNEL_SUCCESS message (RFC 4254 Section 6.4).
    ChannelSuccess,
    MessageType::ChannelSuccess
);
recipient_only_message!(
    /// SSH_MSG_CHANNEL_FAILURE message (RFC 4254 Section 6.4).
    ChannelFailure,
    MessageType::ChannelFailure
);

/// Pseudo-terminal parameters for a `pty-req`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    /// Terminal type (e.g., "xterm")
    pub term: String,
    /// Terminal width in characters
    pub columns: u32,
    /// Terminal height in rows
    pub rows: u32,
    /// Terminal width in pixels
    pub width_pixels: u32,
    /// Terminal height in pixels
    pub height_pixels: u32,
    /// Encoded terminal modes (RFC 4254 Section 8)
    pub modes: Vec<u8>,
}

impl Default for PtyRequest {
    fn default() -> Self {
        Self {
            term: "vt100".to_string(),
            columns: 80,
            rows: 24,
            width_pixels: 0,
            height_pixels: 0,
            // TTY_OP_END
            modes: vec![0],
        }
    }
}

/// Channel request type (RFC 4254 Section 6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRequestType {
    /// PTY request (pseudoterminal allocation)
    PtyReq(PtyRequest),
    /// Environment variable
    Env {
        /// Variable name
        name: String,
        /// Variable value
        value: String,
    },
    /// Execute command
    Exec {
        /// Command to execute
        command: String,
    },
    /// Start interactive shell
    Shell,
    /// Start subsystem (e.g., "sftp")
    Subsystem {
        /// Subsystem name
        name: String,
    },
    /// Terminal size change
    WindowChange {
        /// Columns
        columns: u32,
        /// Rows
        rows: u32,
        /// Width in pixels
        width_pixels: u32,
        /// Height in pixels
        height_pixels: u32,
    },
    /// Exit status
    ExitStatus {
        /// Exit status code
        exit_status: u32,
    },
    /// Exit signal
    ExitSignal {
        /// Signal name without the "SIG" prefix
        signal_name: String,
        /// Core dumped flag
        core_dumped: bool,
        /// Error message
        error_message: String,
    },
    /// Agent forwarding (OpenSSH extension)
    AuthAgent,
    /// A request this client does not interpret
    Other(String),
}

impl ChannelRequestType {
    /// Returns the request type name.
    pub fn name(&self) -> &str {
        match self {
            ChannelRequestType::PtyReq(_) => "pty-req",
            ChannelRequestType::Env { .. } => "env",
            ChannelRequestType::Exec { .. } => "exec",
            ChannelRequestType::Shell => "shell",
            ChannelRequestType::Subsystem { .. } => "subsystem",
            ChannelRequestType::WindowChange { .. } => "window-change",
            ChannelRequestType::ExitStatus { .. } => "exit-status",
            ChannelRequestType::ExitSignal { .. } => "exit-signal",
            ChannelRequestType::AuthAgent => "auth-agent-req@openssh.com",
            ChannelRequestType::Other(name) => name,
        }
    }
}

/// SSH_MSG_CHANNEL_REQUEST message (RFC 4254 Section 6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    recipient_channel: u32,
    request_type: ChannelRequestType,
    want_reply: bool,
}

impl ChannelRequest {
    /// Creates a new channel request.
    pub fn new(recipient_channel: u32, request_type: ChannelRequestType, want_reply: bool) -> Self {
        Self {
            recipient_channel,
            request_type,
            want_reply,
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the request type.
    pub fn request_type(&self) -> &ChannelRequestType {
        &self.request_type
    }

    /// Returns whether a reply is wanted.
    pub fn want_reply(&self) -> bool {
        self.want_reply
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        write_u8(&mut buf, MessageType::ChannelRequest as u8);
        write_u32(&mut buf, self.recipient_channel);
        write_str(&mut buf, self.request_type.name());
        write_bool(&mut buf, self.want_reply);

        match &self.request_type {
            ChannelRequestType::PtyReq(pty) => {
                write_str(&mut buf, &pty.term);
                write_u32(&mut buf, pty.columns);
                write_u32(&mut buf, pty.rows);
                write_u32(&mut buf, pty.width_pixels);
                write_u32(&mut buf, pty.height_pixels);
                write_string(&mut buf, &pty.modes);
            }
            ChannelRequestType::Env { name, value } => {
                write_str(&mut buf, name);
                write_str(&mut buf, value);
            }
            ChannelRequestType::Exec { command } => write_str(&mut buf, command),
            ChannelRequestType::Subsystem { name } => write_str(&mut buf, name),
            ChannelRequestType::WindowChange {
                columns,
                rows,
                width_pixels,
                height_pixels,
            } => {
                write_u32(&mut buf, *columns);
                write_u32(&mut buf, *rows);
                write_u32(&mut buf, *width_pixels);
                write_u32(&mut buf, *height_pixels);
            }
            ChannelRequestType::ExitStatus { exit_status } => write_u32(&mut buf, *exit_status),
            ChannelRequestType::ExitSignal {
                signal_name,
                core_dumped,
                error_message,
            } => {
                write_str(&mut buf, signal_name);
                write_bool(&mut buf, *core_dumped);
                write_str(&mut buf, error_message);
                write_str(&mut buf, "");
            }
            ChannelRequestType::Shell
            | ChannelRequestType::AuthAgent
            | ChannelRequestType::Other(_) => {}
        }

        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TernResult<Self> {
        let mut r = Reader::new(data);
        expect_type(&mut r, MessageType::ChannelRequest)?;
        let recipient_channel = r.read_u32()?;
        let name = r.read_str()?;
        let want_reply = r.read_bool()?;

        let request_type = match name {
            "pty-req" => ChannelRequestType::PtyReq(PtyRequest {
                term: r.read_str()?.to_string(),
                columns: r.read_u32()?,
                rows: r.read_u32()?,
                width_pixels: r.read_u32()?,
                height_pixels: r.read_u32()?,
                modes: r.read_string()?.to_vec(),
            }),
            "env" => ChannelRequestType::Env {
                name: r.read_str()?.to_string(),
                value: r.read_lossy()?,
            },
            "exec" => ChannelRequestType::Exec {
                command: r.read_lossy()?,
            },
            "shell" => ChannelRequestType::Shell,
            "subsystem" => ChannelRequestType::Subsystem {
                name: r.read_str()?.to_string(),
            },
            "window-change" => ChannelRequestType::WindowChange {
                columns: r.read_u32()?,
                rows: r.read_u32()?,
                width_pixels: r.read_u32()?,
                height_pixels: r.read_u32()?,
            },
            "exit-status" => ChannelRequestType::ExitStatus {
                exit_status: r.read_u32()?,
            },
            "exit-signal" => ChannelRequestType::ExitSignal {
                signal_name: r.read_lossy()?,
                core_dumped: r.read_bool()?,
                error_message: r.read_lossy()?,
            },
            "auth-agent-req@openssh.com" => ChannelRequestType::AuthAgent,
            other => ChannelRequestType::Other(other.to_string()),
        };

        Ok(Self {
            recipient_channel,
            request_type,
            want_reply,
        })
    }
}

/// SSH_MSG_GLOBAL_REQUEST message (RFC 4254 Section 4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalRequest {
    name: String,
    want_reply: bool,
}

impl GlobalRequest {
    /// Creates a global request without type specific data.
    pub fn new(name: impl Into<String>, want_reply: bool) -> Self {
        Self {
            name: name.into(),
            want_reply,
        }
    }

    /// Returns the request name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns whether a reply is wanted.
    pub fn want_reply(&self) -> bool {
        self.want_reply
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        write_u8(&mut buf, MessageType::GlobalRequest as u8);
        write_str(&mut buf, &self.name);
        write_bool(&mut buf, self.want_reply);
        buf.to_vec()
    }

    /// Parses from bytes. Type specific trailing data is ignored.
    pub fn from_bytes(data: &[u8]) -> TernResult<Self> {
        let mut r = Reader::new(data);
        expect_type(&mut r, MessageType::GlobalRequest)?;
        Ok(Self {
            name: r.read_lossy()?,
            want_reply: r.read_bool()?,
        })
    }
}

/// Peeks the recipient channel of a channel-bound message (numbers 91-100).
pub fn recipient_channel(payload: &[u8]) -> TernResult<u32> {
    let mut r = Reader::new(payload);
    r.read_u8()?;
    r.read_u32()
}
