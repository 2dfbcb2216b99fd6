//! SFTP (SSH File Transfer Protocol) client.
//!
//! Versions 2 and 3 of the protocol are spoken. SFTP runs as the `sftp`
//! subsystem on one session channel:
//!
//! ```text
//! Client                          Server
//!   |                               |
//!   |-- SSH_MSG_CHANNEL_OPEN ------>|
//!   |<- SSH_MSG_CHANNEL_OPEN_CONF --|
//!   |-- SSH_MSG_CHANNEL_REQUEST --->|  (subsystem "sftp")
//!   |<- SSH_MSG_CHANNEL_SUCCESS ----|
//!   |                               |
//!   |-- SSH_FXP_INIT -------------->|
//!   |<- SSH_FXP_VERSION ------------|
//!   |-- SSH_FXP_OPEN -------------->|
//!   |<- SSH_FXP_HANDLE -------------|
//!   |-- SSH_FXP_READ x N ---------->|  (pipelined)
//!   |<- SSH_FXP_DATA x N -----------|
//!   |-- SSH_FXP_CLOSE ------------->|
//!   |<- SSH_FXP_STATUS -------------|
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use tern_proto::ssh::client::{SshClient, SshClientConfig};
//! use tern_proto::ssh::sftp::PutMode;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut client = SshClient::connect("server:22", SshClientConfig::default()).await?;
//! client.login_password("user", "password").await?;
//!
//! let mut sftp = client.sftp().await?;
//! sftp.put("upload.txt", b"hello", PutMode::Overwrite).await?;
//! let data = sftp.get("upload.txt").await?;
//! assert_eq!(data, b"hello");
//! for name in sftp.nlist(".", false).await? {
//!     println!("{}", name);
//! }
//! sftp.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod client;
pub mod message;
pub mod types;

pub use cache::{StatCache, StatKind};
pub use client::Sftp;
pub use message::{SftpMessageType, SFTP_VERSION};
pub use types::{
    DirEntry, FileAttributes, FileType, ListOrder, OpenFlags, PutMode, SftpConfig, StatusCode,
};
