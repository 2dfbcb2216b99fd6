//! SSH message numbers (RFC 4250 Section 4.1).
//!
//! Only the numbers this client sends or handles are listed. Anything else
//! decodes to `None`; [`describe`] still names it for logs and errors.
//!
//! The method-specific ranges reuse numbers: 30/31 serve plain DH and ECDH
//! alike, 31 is also the group-exchange GROUP message, and 60 means PK_OK,
//! PASSWD_CHANGEREQ or INFO_REQUEST depending on the method in flight.
//!
//! ```rust
//! use tern_proto::ssh::message::MessageType;
//!
//! assert_eq!(MessageType::KexInit as u8, 20);
//! assert_eq!(MessageType::from_u8(94), Some(MessageType::ChannelData));
//! ```

macro_rules! message_types {
    ($($(#[$doc:meta])* $variant:ident = $num:literal => $name:literal,)*) => {
        /// SSH message numbers.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum MessageType {
            $($(#[$doc])* $variant = $num,)*
        }

        impl MessageType {
            /// Message type for a wire byte, if the client knows it.
            ///
            /// ```rust
            /// use tern_proto::ssh::message::MessageType;
            ///
            /// assert_eq!(MessageType::from_u8(20), Some(MessageType::KexInit));
            /// assert_eq!(MessageType::from_u8(255), None);
            /// ```
            pub fn from_u8(byte: u8) -> Option<Self> {
                match byte {
                    $($num => Some(MessageType::$variant),)*
                    _ => None,
                }
            }

            /// Name as written in the RFCs, e.g. `SSH_MSG_KEXINIT`.
            pub fn name(&self) -> &'static str {
                match self {
                    $(MessageType::$variant => $name,)*
                }
            }
        }
    };
}

message_types! {
    /// Ends the connection.
    Disconnect = 1 => "SSH_MSG_DISCONNECT",
    /// Discarded on receipt. See [`SshClient::send_ignore`](crate::ssh::client::SshClient::send_ignore).
    Ignore = 2 => "SSH_MSG_IGNORE",
    /// Answer to a message number the peer does not know.
    Unimplemented = 3 => "SSH_MSG_UNIMPLEMENTED",
    /// Diagnostic text, logged and dropped.
    Debug = 4 => "SSH_MSG_DEBUG",
    /// Asks for `ssh-userauth`.
    ServiceRequest = 5 => "SSH_MSG_SERVICE_REQUEST",
    /// Grants the requested service.
    ServiceAccept = 6 => "SSH_MSG_SERVICE_ACCEPT",

    /// Algorithm lists that open every key exchange.
    KexInit = 20 => "SSH_MSG_KEXINIT",
    /// Switches a direction to the new keys.
    NewKeys = 21 => "SSH_MSG_NEWKEYS",
    /// Client public value for DH and ECDH.
    KexdhInit = 30 => "SSH_MSG_KEXDH_INIT",
    /// Server reply for DH and ECDH, or the group-exchange GROUP.
    KexdhReply = 31 => "SSH_MSG_KEXDH_REPLY",
    /// Client public value for group exchange.
    KexDhGexInit = 32 => "SSH_MSG_KEX_DH_GEX_INIT",
    /// Server reply for group exchange.
    KexDhGexReply = 33 => "SSH_MSG_KEX_DH_GEX_REPLY",
    /// Group size bounds (min, preferred, max).
    KexDhGexRequest = 34 => "SSH_MSG_KEX_DH_GEX_REQUEST",

    /// One authentication attempt.
    UserauthRequest = 50 => "SSH_MSG_USERAUTH_REQUEST",
    /// Attempt refused, with the methods that may continue.
    UserauthFailure = 51 => "SSH_MSG_USERAUTH_FAILURE",
    /// Logged in.
    UserauthSuccess = 52 => "SSH_MSG_USERAUTH_SUCCESS",
    /// Text to show before login.
    UserauthBanner = 53 => "SSH_MSG_USERAUTH_BANNER",
    /// PK_OK, PASSWD_CHANGEREQ or INFO_REQUEST.
    UserauthPkOk = 60 => "SSH_MSG_USERAUTH_PK_OK",
    /// Answers to keyboard-interactive prompts.
    UserauthInfoResponse = 61 => "SSH_MSG_USERAUTH_INFO_RESPONSE",

    /// Connection-wide request such as `keepalive@openssh.com`.
    GlobalRequest = 80 => "SSH_MSG_GLOBAL_REQUEST",
    /// Positive answer to a global request.
    RequestSuccess = 81 => "SSH_MSG_REQUEST_SUCCESS",
    /// Negative answer to a global request.
    RequestFailure = 82 => "SSH_MSG_REQUEST_FAILURE",
    /// Opens a session channel.
    ChannelOpen = 90 => "SSH_MSG_CHANNEL_OPEN",
    /// Channel opened, with the server's id and window.
    ChannelOpenConfirmation = 91 => "SSH_MSG_CHANNEL_OPEN_CONFIRMATION",
    /// Channel refused.
    ChannelOpenFailure = 92 => "SSH_MSG_CHANNEL_OPEN_FAILURE",
    /// Grants more send window.
    ChannelWindowAdjust = 93 => "SSH_MSG_CHANNEL_WINDOW_ADJUST",
    /// Stdin or stdout bytes.
    ChannelData = 94 => "SSH_MSG_CHANNEL_DATA",
    /// Stderr bytes.
    ChannelExtendedData = 95 => "SSH_MSG_CHANNEL_EXTENDED_DATA",
    /// No more data in this direction.
    ChannelEof = 96 => "SSH_MSG_CHANNEL_EOF",
    /// Channel gone once both sides sent it.
    ChannelClose = 97 => "SSH_MSG_CHANNEL_CLOSE",
    /// exec, shell, subsystem, pty-req and the exit reports.
    ChannelRequest = 98 => "SSH_MSG_CHANNEL_REQUEST",
    /// Channel request accepted.
    ChannelSuccess = 99 => "SSH_MSG_CHANNEL_SUCCESS",
    /// Channel request refused.
    ChannelFailure = 100 => "SSH_MSG_CHANNEL_FAILURE",
}

impl MessageType {
    /// Key exchange traffic (20..50), which may interleave with anything.
    pub fn is_kex(&self) -> bool {
        (20..50).contains(&(*self as u8))
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), *self as u8)
    }
}

/// Describes a message number for logs, including unknown ones.
pub fn describe(byte: u8) -> String {
    match MessageType::from_u8(byte) {
        Some(t) => t.to_string(),
        None => format!("UNKNOWN({})", byte),
    }
}

/// Disconnect reasons the client reports (RFC 4250 Section 4.2.2).
///
/// Reasons received from the server stay plain numbers in
/// [`TernError::Disconnected`](tern_platform::TernError::Disconnected).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DisconnectReason {
    /// No algorithm in common for some category.
    KeyExchangeFailed = 3,
    /// The stream ended without a DISCONNECT.
    ConnectionLost = 10,
    /// The application hung up.
    ByApplication = 11,
}

impl DisconnectReason {
    /// Numeric reason code.
    pub fn code(self) -> u32 {
        self as u32
    }
}
