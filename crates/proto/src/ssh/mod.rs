//! SSH-2 client implementation.
//!
//! # Architecture
//!
//! The client is layered:
//!
//! 1. **Wire and packet layer** ([`wire`], [`packet`], [`crypto`]) - Binary
//!    packet protocol, ciphers and MACs (RFC 4253 Section 6)
//! 2. **Transport** ([`transport`], [`kex`], [`kex_dh`], [`hostkey`]) -
//!    Version exchange, key exchange, host key verification, rekeying
//! 3. **Authentication** ([`auth`], [`privatekey`]) - none, password,
//!    keyboard-interactive, public key and agent (RFC 4252, RFC 4256)
//! 4. **Connection** ([`connection`], [`channel`]) - Channel multiplexing
//!    with flow control (RFC 4254)
//! 5. **Façade** ([`client`], [`shell`], [`sftp`], [`scp`]) - exec,
//!    interactive shells, file transfer
//!
//! Everything runs on one task. A logical operation awaits its reply and
//! buffers traffic for other channels while it waits, so channels never
//! starve one another.
//!
//! # Example
//!
//! ```rust,no_run
//! use tern_proto::ssh::{SshClient, SshClientConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut client = SshClient::connect("server:22", SshClientConfig::default()).await?;
//! println!("host key {}", client.server_host_key());
//! client.login_password("user", "password").await?;
//!
//! let output = client.exec("echo hi").await?;
//! assert_eq!(output.stdout, b"hi\n");
//! assert_eq!(output.exit_status(), Some(0));
//! client.disconnect().await;
//! # Ok(())
//! # }
//! ```
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol
//! - [draft-ietf-secsh-filexfer-02](https://datatracker.ietf.org/doc/html/draft-ietf-secsh-filexfer-02) - SFTP version 3

pub mod auth;
pub mod channel;
pub mod client;
pub mod connection;
pub mod crypto;
pub mod hostkey;
pub mod kex;
pub mod kex_dh;
pub mod logging;
pub mod message;
pub mod packet;
pub mod privatekey;
pub mod scp;
pub mod sftp;
pub mod shell;
pub mod transport;
pub mod version;
pub mod wire;

// Re-export main types
pub use auth::{Agent, AgentIdentity, AuthMethod, AuthState, Authenticator, Credential};
pub use channel::{ChannelId, ChannelStatus, ExitStatus};
pub use client::{ExecOptions, ExecOutput, SshClient, SshClientConfig};
pub use connection::{ChannelRequestType, PtyRequest};
pub use crypto::{CipherAlgorithm, MacAlgorithm};
pub use hostkey::{fingerprint, HostKeyAlgorithm};
pub use kex::{AlgorithmPreferences, KexAlgorithm, Negotiated};
pub use message::{DisconnectReason, MessageType};
pub use packet::{OpeningState, SealingState};
pub use privatekey::PrivateKey;
pub use scp::ScpFile;
pub use sftp::{PutMode, Sftp, SftpConfig};
pub use shell::{Pattern, Shell};
pub use transport::{GroupExchangeBits, HostKeyCheck, Lifecycle, Transport, TransportConfig};
pub use version::{Identification, Version};
