//! SSH protocol version exchange (RFC 4253 Section 4.2).
//!
//! Both sides send an identification string:
//!
//! ```text
//! SSH-protoversion-softwareversion SP comments CR LF
//! ```
//!
//! A server may send other lines before its identification string. They
//! are collected and exposed to the caller as the pre-identification banner.
//!
//! # Example
//!
//! ```rust
//! use tern_proto::ssh::version::Version;
//!
//! let version = Version::new("tern_0.1.0", None);
//! assert_eq!(version.to_string(), "SSH-2.0-tern_0.1.0");
//!
//! let parsed = Version::parse("SSH-2.0-OpenSSH_8.9").unwrap();
//! assert_eq!(parsed.software(), "OpenSSH_8.9");
//! ```

use crate::ssh::message::DisconnectReason;
use tern_platform::{TernError, TernResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Maximum length of SSH version string (RFC 4253 Section 4.2).
pub const MAX_VERSION_LENGTH: usize = 255;

/// Maximum number of banner lines accepted before the identification string.
const MAX_BANNER_LINES: usize = 1024;

/// SSH protocol identification string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    proto_version: String,
    software_version: String,
    comments: Option<String>,
}

impl Version {
    /// Creates a protocol 2.0 identification string.
    pub fn new(software: &str, comments: Option<&str>) -> Self {
        Self {
            proto_version: "2.0".to_string(),
            software_version: software.to_string(),
            comments: comments.map(String::from),
        }
    }

    /// Returns the default tern identification string.
    pub fn default_tern() -> Self {
        Self::new(&format!("tern_{}", env!("CARGO_PKG_VERSION")), None)
    }

    /// Parses an identification string.
    ///
    /// # Errors
    ///
    /// Returns [`TernError::Protocol`] if the line is too long, contains a
    /// null byte, does not start with "SSH-", or names a protocol version
    /// other than 2.0 or 1.99.
    pub fn parse(line: &str) -> TernResult<Self> {
        let line = line.trim_end_matches("\r\n").trim_end_matches('\n');

        if line.len() > MAX_VERSION_LENGTH {
            return Err(TernError::Protocol(format!(
                "Version string too long: {} bytes (max {})",
                line.len(),
                MAX_VERSION_LENGTH
            )));
        }

        if line.contains('\0') {
            return Err(TernError::Protocol(
                "Version string contains null byte".to_string(),
            ));
        }

        if !line.starts_with("SSH-") {
            return Err(TernError::Protocol(format!(
                "Invalid version string: must start with 'SSH-', got '{}'",
                line
            )));
        }

        let parts: Vec<&str> = line.splitn(3, '-').collect();
        if parts.len() < 3 || parts[2].is_empty() {
            return Err(TernError::Protocol(format!(
                "Invalid version string: missing software version in '{}'",
                line
            )));
        }

        let proto_version = parts[1];
        if proto_version != "2.0" && proto_version != "1.99" {
            return Err(TernError::Protocol(format!(
                "Unsupported protocol version: {}",
                proto_version
            )));
        }

        let (software, comments) = match parts[2].split_once(' ') {
            Some((s, c)) => (s, Some(c.to_string())),
            None => (parts[2], None),
        };

        Ok(Self {
            proto_version: proto_version.to_string(),
            software_version: software.to_string(),
            comments,
        })
    }

    /// Protocol version (e.g., "2.0").
    pub fn proto_version(&self) -> &str {
        &self.proto_version
    }

    /// Software version (e.g., "OpenSSH_8.9").
    pub fn software(&self) -> &str {
        &self.software_version
    }

    /// Optional comments.
    pub fn comments(&self) -> Option<&str> {
        self.comments.as_deref()
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SSH-{}-{}", self.proto_version, self.software_version)?;
        if let Some(comments) = &self.comments {
            write!(f, " {}", comments)?;
        }
        Ok(())
    }
}

/// Result of the identification exchange.
#[derive(Debug, Clone)]
pub struct Identification {
    /// Our identification string, without CR LF (hashed during kex)
    pub client: String,
    /// The server identification string, without CR LF (hashed during kex)
    pub server: String,
    /// Lines the server sent before its identification string
    pub banner: Vec<String>,
}

/// Sends our identification string and reads the server's.
///
/// Reads byte by byte so that nothing past the server's CR LF is consumed.
pub async fn exchange<S>(stream: &mut S, ours: &Version) -> TernResult<Identification>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let client = ours.to_string();
    stream.write_all(format!("{}\r\n", client).as_bytes()).await?;
    stream.flush().await?;

    let mut banner = Vec::new();
    loop {
        let line = read_line(stream).await?;
        if line.starts_with("SSH-") {
            let parsed = Version::parse(&line)?;
            debug!(
                server = %line,
                software = parsed.software(),
                "Received server identification"
            );
            return Ok(Identification {
                client,
                server: line,
                banner,
            });
        }
        if banner.len() >= MAX_BANNER_LINES {
            return Err(TernError::Protocol(
                "Too many lines before server identification".to_string(),
            ));
        }
        banner.push(line);
    }
}

async fn read_line<S>(stream: &mut S) -> TernResult<String>
where
    S: AsyncRead + Unpin,
{
    let mut line = Vec::with_capacity(64);
    loop {
        let byte = match stream.read_u8().await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(TernError::Disconnected {
                    reason: DisconnectReason::ConnectionLost.code(),
                    description: "Connection closed during version exchange".to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        if byte == b'\n' {
            break;
        }
        line.push(byte);
        if line.len() > MAX_VERSION_LENGTH + 1 {
            return Err(TernError::Protocol(format!(
                "Identification line exceeds {} bytes",
                MAX_VERSION_LENGTH
            )));
        }
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}
