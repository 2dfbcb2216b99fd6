//! Interactive shell sessions.
//!
//! A [`Shell`] wraps a session channel that has a pty and a running shell.
//! Output is accumulated in an internal buffer so that
//! [`Shell::read_until`] can hand back exactly the bytes up to a match and
//! keep the rest for the next call.
//!
//! # Example
//!
//! ```rust,no_run
//! use tern_proto::ssh::client::{SshClient, SshClientConfig};
//! use tern_proto::ssh::connection::PtyRequest;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut client = SshClient::connect("server:22", SshClientConfig::default()).await?;
//! client.login_password("user", "password").await?;
//!
//! let mut shell = client.shell(&PtyRequest::default()).await?;
//! shell.read_until("$ ").await?;
//! shell.write(b"uname\n").await?;
//! let out = shell.read_until("$ ").await?;
//! println!("{}", String::from_utf8_lossy(&out));
//! shell.close().await?;
//! # Ok(())
//! # }
//! ```

use crate::ssh::channel::{ChannelId, ExitStatus};
use crate::ssh::client::SshClient;
use crate::ssh::connection::PtyRequest;
use regex::bytes::Regex;
use tern_platform::{TernError, TernResult};
use tokio::io::{AsyncRead, AsyncWrite};

/// What [`Shell::read_until`] waits for.
#[derive(Debug, Clone, Copy)]
pub enum Pattern<'p> {
    /// Exact byte sequence
    Literal(&'p [u8]),
    /// Regular expression over raw bytes
    Regex(&'p Regex),
}

impl Pattern<'_> {
    /// End offset of the first match in `haystack`.
    fn find_end(&self, haystack: &[u8]) -> Option<usize> {
        match self {
            Pattern::Literal(needle) if needle.is_empty() => Some(0),
            Pattern::Literal(needle) => haystack
                .windows(needle.len())
                .position(|w| w == *needle)
                .map(|start| start + needle.len()),
            Pattern::Regex(re) => re.find(haystack).map(|m| m.end()),
        }
    }
}

impl<'p> From<&'p str> for Pattern<'p> {
    fn from(s: &'p str) -> Self {
        Pattern::Literal(s.as_bytes())
    }
}

impl<'p> From<&'p [u8]> for Pattern<'p> {
    fn from(b: &'p [u8]) -> Self {
        Pattern::Literal(b)
    }
}

impl<'p> From<&'p Regex> for Pattern<'p> {
    fn from(re: &'p Regex) -> Self {
        Pattern::Regex(re)
    }
}

/// An interactive shell on one channel.
#[derive(Debug)]
pub struct Shell<'a, S> {
    client: &'a mut SshClient<S>,
    channel: ChannelId,
    buffer: Vec<u8>,
}

impl<S> SshClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Opens a pty shell and returns a handle borrowing this client.
    pub async fn shell(&mut self, pty: &PtyRequest) -> TernResult<Shell<'_, S>> {
        let channel = self.open_shell(pty).await?;
        Ok(Shell {
            client: self,
            channel,
            buffer: Vec::new(),
        })
    }
}

impl<'a, S> Shell<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wraps a channel already running a shell.
    pub fn from_channel(client: &'a mut SshClient<S>, channel: ChannelId) -> Self {
        Self {
            client,
            channel,
            buffer: Vec::new(),
        }
    }

    /// Channel carrying the shell.
    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    /// Sends keystrokes.
    pub async fn write(&mut self, data: &[u8]) -> TernResult<()> {
        self.client.write(self.channel, data).await
    }

    /// Reads until `pattern` matches and returns everything up to and
    /// including the match. Bytes after the match stay buffered.
    ///
    /// On the soft timeout the partial output is kept for the next call and
    /// [`TernError::Timeout`] is returned.
    pub async fn read_until<'p>(&mut self, pattern: impl Into<Pattern<'p>>) -> TernResult<Vec<u8>> {
        let pattern = pattern.into();
        self.client.arm();
        let result = self.fill_until(pattern).await;
        self.client.settle(result)
    }

    async fn fill_until(&mut self, pattern: Pattern<'_>) -> TernResult<Vec<u8>> {
        loop {
            if let Some(end) = pattern.find_end(&self.buffer) {
                let rest = self.buffer.split_off(end);
                return Ok(std::mem::replace(&mut self.buffer, rest));
            }
            match self.client.read_inner(self.channel).await? {
                Some(chunk) => self.buffer.extend_from_slice(&chunk),
                None => {
                    return Err(TernError::Channel(format!(
                        "Shell on channel {} ended before the pattern matched",
                        self.channel
                    )))
                }
            }
        }
    }

    /// Returns whatever output is buffered, without waiting.
    pub async fn read_available(&mut self) -> TernResult<Vec<u8>> {
        let more = self.client.read_buffered(self.channel).await?;
        let mut out = std::mem::take(&mut self.buffer);
        out.extend_from_slice(&more);
        Ok(out)
    }

    /// Tells the server the terminal size changed.
    pub async fn resize(&mut self, columns: u32, rows: u32) -> TernResult<()> {
        self.client.window_change(self.channel, columns, rows).await
    }

    /// Closes the shell channel.
    pub async fn close(self) -> TernResult<Option<ExitStatus>> {
        self.client.close_channel(self.channel).await
    }
}
