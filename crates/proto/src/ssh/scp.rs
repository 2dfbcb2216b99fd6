//! Single-file SCP transfers.
//!
//! SCP runs the remote `scp` binary in sink (`-t`) or source (`-f`) mode
//! over an exec channel. Every step is acknowledged with one status byte:
//! zero for success, one or two followed by a text line for a warning or
//! an error.

use crate::ssh::channel::ChannelId;
use crate::ssh::client::{ExecOptions, SshClient};
use tern_platform::{TernError, TernResult};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// Permission bits used by [`SshClient::scp_put`].
pub const DEFAULT_SCP_MODE: u32 = 0o644;

/// A file received with [`SshClient::scp_get`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScpFile {
    /// Permission bits from the control line
    pub mode: u32,
    /// File name from the control line
    pub name: String,
    /// Contents
    pub data: Vec<u8>,
}

/// Quotes `arg` for a POSIX shell.
pub fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Parses a `C<mode> <size> <name>` control line (without the newline).
pub fn parse_control_line(line: &str) -> TernResult<(u32, u64, String)> {
    let malformed = || TernError::Scp(format!("Malformed control line: {:?}", line));
    let rest = line.strip_prefix('C').ok_or_else(malformed)?;
    let mut parts = rest.splitn(3, ' ');
    let mode = parts
        .next()
        .and_then(|m| u32::from_str_radix(m, 8).ok())
        .ok_or_else(malformed)?;
    let size = parts
        .next()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(malformed)?;
    let name = parts.next().filter(|n| !n.is_empty()).ok_or_else(malformed)?;
    Ok((mode, size, name.to_string()))
}

/// Buffered reader over the exec channel.
struct ScpChannel {
    id: ChannelId,
    pending: Vec<u8>,
}

impl ScpChannel {
    fn new(id: ChannelId) -> Self {
        Self {
            id,
            pending: Vec::new(),
        }
    }

    async fn fill<S>(&mut self, ssh: &mut SshClient<S>) -> TernResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        match ssh.read_inner(self.id).await? {
            Some(data) => {
                self.pending.extend_from_slice(&data);
                Ok(())
            }
            None => {
                let stderr = String::from_utf8_lossy(&ssh.take_stderr(self.id)).into_owned();
                Err(TernError::Scp(if stderr.is_empty() {
                    "Remote scp ended the transfer early".to_string()
                } else {
                    stderr.trim_end().to_string()
                }))
            }
        }
    }

    async fn line<S>(&mut self, ssh: &mut SshClient<S>) -> TernResult<String>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        loop {
            if let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.pending.drain(..=pos).collect();
                return Ok(String::from_utf8_lossy(&line[..pos]).into_owned());
            }
            self.fill(ssh).await?;
        }
    }

    async fn byte<S>(&mut self, ssh: &mut SshClient<S>) -> TernResult<u8>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        while self.pending.is_empty() {
            self.fill(ssh).await?;
        }
        Ok(self.pending.remove(0))
    }

    /// Waits for one acknowledgement.
    async fn ack<S>(&mut self, ssh: &mut SshClient<S>) -> TernResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        match self.byte(ssh).await? {
            0 => Ok(()),
            1 | 2 => Err(TernError::Scp(self.line(ssh).await?)),
            other => Err(TernError::Scp(format!(
                "Unexpected acknowledgement byte {:#04x}",
                other
            ))),
        }
    }

    async fn exact<S>(&mut self, ssh: &mut SshClient<S>, len: usize) -> TernResult<Vec<u8>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        while self.pending.len() < len {
            self.fill(ssh).await?;
        }
        let rest = self.pending.split_off(len);
        Ok(std::mem::replace(&mut self.pending, rest))
    }
}

impl<S> SshClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Uploads `data` to `remote` with mode 0644.
    pub async fn scp_put(&mut self, remote: &str, data: &[u8]) -> TernResult<()> {
        self.scp_put_with_mode(remote, data, DEFAULT_SCP_MODE).await
    }

    /// Uploads `data` to `remote` with the given permission bits.
    pub async fn scp_put_with_mode(&mut self, remote: &str, data: &[u8], mode: u32) -> TernResult<()> {
        let name = remote.rsplit('/').next().unwrap_or(remote);
        if name.is_empty() || name.contains('\n') {
            return Err(TernError::Scp(format!("Invalid remote file name {:?}", remote)));
        }
        let name = name.to_string();

        self.arm();
        let result = async {
            self.ensure_login()?;
            let command = format!("scp -t {}", shell_quote(remote));
            let id = self.open_exec_inner(&command, &ExecOptions::default()).await?;
            let result = self.scp_send(id, &name, data, mode).await;
            self.scp_finish(id, result).await
        }
        .await;
        self.settle(result)
    }

    async fn scp_send(&mut self, id: ChannelId, name: &str, data: &[u8], mode: u32) -> TernResult<()> {
        let mut channel = ScpChannel::new(id);
        channel.ack(self).await?;

        let control = format!("C{:04o} {} {}\n", mode & 0o7777, data.len(), name);
        self.write_inner(id, control.as_bytes()).await?;
        channel.ack(self).await?;

        self.write_inner(id, data).await?;
        self.write_inner(id, &[0]).await?;
        channel.ack(self).await?;
        debug!(channel = id.0, bytes = data.len(), "SCP upload complete");
        Ok(())
    }

    /// Downloads `remote`.
    pub async fn scp_get(&mut self, remote: &str) -> TernResult<ScpFile> {
        self.arm();
        let result = async {
            self.ensure_login()?;
            let command = format!("scp -f {}", shell_quote(remote));
            let id = self.open_exec_inner(&command, &ExecOptions::default()).await?;
            let result = self.scp_receive(id).await;
            self.scp_finish(id, result).await
        }
        .await;
        self.settle(result)
    }

    async fn scp_receive(&mut self, id: ChannelId) -> TernResult<ScpFile> {
        let mut channel = ScpChannel::new(id);
        self.write_inner(id, &[0]).await?;

        let (mode, size, name) = loop {
            match channel.byte(self).await? {
                b'T' => {
                    // Timestamps are acknowledged and ignored.
                    channel.line(self).await?;
                    self.write_inner(id, &[0]).await?;
                }
                b'C' => {
                    let line = channel.line(self).await?;
                    break parse_control_line(&format!("C{}", line))?;
                }
                1 | 2 => return Err(TernError::Scp(channel.line(self).await?)),
                b'D' => {
                    return Err(TernError::Scp(
                        "Remote path is a directory; recursive copies are not supported"
                            .to_string(),
                    ))
                }
                other => {
                    return Err(TernError::Scp(format!(
                        "Unexpected control byte {:#04x}",
                        other
                    )))
                }
            }
        };
        let size = usize::try_from(size)
            .map_err(|_| TernError::Scp(format!("File too large: {} bytes", size)))?;
        self.write_inner(id, &[0]).await?;

        let data = channel.exact(self, size).await?;
        channel.ack(self).await?;
        self.write_inner(id, &[0]).await?;
        debug!(channel = id.0, bytes = size, name = %name, "SCP download complete");
        Ok(ScpFile { mode, name, data })
    }

    /// Closes the exec channel after a transfer, keeping the transfer's
    /// error when there is one.
    async fn scp_finish<T>(&mut self, id: ChannelId, result: TernResult<T>) -> TernResult<T> {
        match result {
            Ok(value) => {
                self.send_eof_inner(id).await?;
                self.close_inner(id).await?;
                Ok(value)
            }
            Err(e) => {
                if !e.is_fatal() && self.is_connected() {
                    let _ = self.close_inner(id).await;
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain.txt"), "'plain.txt'");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote("$(rm -rf /)"), "'$(rm -rf /)'");
    }

    #[test]
    fn test_parse_control_line() {
        assert_eq!(
            parse_control_line("C0644 5 hello.txt").unwrap(),
            (0o644, 5, "hello.txt".to_string())
        );
        assert_eq!(
            parse_control_line("C0755 0 name with spaces").unwrap(),
            (0o755, 0, "name with spaces".to_string())
        );
    }

    #[test]
    fn test_parse_control_line_rejects_garbage() {
        assert!(matches!(
            parse_control_line("D0755 0 dir"),
            Err(TernError::Scp(_))
        ));
        assert!(parse_control_line("C0644 five x").is_err());
        assert!(parse_control_line("C0644 5").is_err());
        assert!(parse_control_line("C9999 5 x").is_err());
    }
}
