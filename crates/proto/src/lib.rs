//! Client-side SSH-2 protocol stack for tern.
//!
//! This crate connects to SSH servers over any async byte stream and
//! provides:
//!
//! - **Transport** - version exchange, key exchange, AES-CTR/CBC with HMAC,
//!   host key verification and rekeying
//! - **Authentication** - password, keyboard-interactive, public key and
//!   agent-backed keys
//! - **Channels** - exec, interactive shells and subsystems multiplexed over
//!   one connection
//! - **File transfer** - SFTP (versions 2 and 3) with a stat cache, and SCP
//!
//! # Features
//!
//! - `ssh` (default) - the SSH client
//!
//! # Example
//!
//! ```rust
//! use bytes::BytesMut;
//! use tern_proto::ssh::wire::{write_str, Reader};
//!
//! // SSH strings are length-prefixed
//! let mut buf = BytesMut::new();
//! write_str(&mut buf, "ssh-userauth");
//! let mut r = Reader::new(&buf);
//! assert_eq!(r.read_str().unwrap(), "ssh-userauth");
//! ```
//!
//! # Security
//!
//! - All cryptographic operations use vetted libraries (`ring`, `dalek`, RustCrypto)
//! - MAC checks are constant-time
//! - Secrets are zeroized on drop with `zeroize`
//! - A MAC failure kills the session; no further reads or writes are attempted

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(feature = "ssh")]
pub mod ssh;
