//! SSH channel state.
//!
//! A [`Channel`] is the client-side bookkeeping for one multiplexed logical
//! stream: the local/remote number mapping, both flow-control windows, the
//! lifecycle status, and the inbound buffers holding data that arrived while
//! another channel was being awaited.
//!
//! Status transitions are pure functions on [`ChannelStatus`]; the
//! multiplexer in [`client`](crate::ssh::client) threads them through.

use std::collections::VecDeque;
use std::fmt;
use tern_platform::{TernError, TernResult};

/// Local channel number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u32);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Channel lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    /// CHANNEL_OPEN sent, no answer yet
    OpenPending,
    /// Confirmed by the server
    Open,
    /// A request awaiting its reply is outstanding
    RequestPending,
    /// Data is flowing
    Data,
    /// The server sent EOF
    Eof,
    /// CHANNEL_CLOSE observed
    Closed,
}

impl ChannelStatus {
    /// After OPEN_CONFIRMATION.
    pub fn on_open_confirmed(self) -> Self {
        match self {
            ChannelStatus::OpenPending => ChannelStatus::Open,
            other => other,
        }
    }

    /// After sending a request that wants a reply.
    pub fn on_request_sent(self) -> Self {
        match self {
            ChannelStatus::Open | ChannelStatus::Data => ChannelStatus::RequestPending,
            other => other,
        }
    }

    /// After CHANNEL_SUCCESS or CHANNEL_FAILURE.
    pub fn on_request_reply(self) -> Self {
        match self {
            ChannelStatus::RequestPending => ChannelStatus::Data,
            other => other,
        }
    }

    /// After data in either direction.
    pub fn on_data(self) -> Self {
        match self {
            ChannelStatus::Open => ChannelStatus::Data,
            other => other,
        }
    }

    /// After the server's EOF.
    pub fn on_eof(self) -> Self {
        match self {
            ChannelStatus::Closed => ChannelStatus::Closed,
            _ => ChannelStatus::Eof,
        }
    }

    /// After the server's CLOSE.
    pub fn on_close(self) -> Self {
        ChannelStatus::Closed
    }

    /// Whether data may still be sent.
    pub fn is_writable(self) -> bool {
        matches!(
            self,
            ChannelStatus::Open | ChannelStatus::RequestPending | ChannelStatus::Data | ChannelStatus::Eof
        )
    }
}

/// How a channel's remote process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitStatus {
    /// `exit-status` with a code
    Code(u32),
    /// `exit-signal` with the signal name and message
    Signal {
        /// Signal name, e.g. "TERM"
        name: String,
        /// Whether a core was dumped
        core_dumped: bool,
        /// Error text
        message: String,
    },
}

/// One multiplexed channel.
#[derive(Debug)]
pub struct Channel {
    id: ChannelId,
    remote_id: u32,
    status: ChannelStatus,

    local_window: u32,
    local_initial_window: u32,
    local_max_packet: u32,
    remote_window: u32,
    remote_max_packet: u32,

    inbound: VecDeque<Vec<u8>>,
    stderr: Vec<u8>,
    replies: VecDeque<bool>,
    eof_sent: bool,
    close_sent: bool,
    exit: Option<ExitStatus>,
}

impl Channel {
    /// A channel whose open request is in flight.
    pub fn new(id: ChannelId, window: u32, max_packet: u32) -> Self {
        Self {
            id,
            remote_id: 0,
            status: ChannelStatus::OpenPending,
            local_window: window,
            local_initial_window: window,
            local_max_packet: max_packet,
            remote_window: 0,
            remote_max_packet: 0,
            inbound: VecDeque::new(),
            stderr: Vec::new(),
            replies: VecDeque::new(),
            eof_sent: false,
            close_sent: false,
            exit: None,
        }
    }

    /// Local channel number.
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Server's channel number.
    pub fn remote_id(&self) -> u32 {
        self.remote_id
    }

    /// Current status.
    pub fn status(&self) -> ChannelStatus {
        self.status
    }

    /// Applies a status transition.
    pub fn transition(&mut self, f: fn(ChannelStatus) -> ChannelStatus) {
        self.status = f(self.status);
    }

    /// Records the server's half of the open handshake.
    pub fn confirm(&mut self, remote_id: u32, remote_window: u32, remote_max_packet: u32) {
        self.remote_id = remote_id;
        self.remote_window = remote_window;
        self.remote_max_packet = remote_max_packet;
        self.transition(ChannelStatus::on_open_confirmed);
    }

    /// Bytes we may still receive before the server must wait.
    pub fn local_window(&self) -> u32 {
        self.local_window
    }

    /// Bytes the server still lets us send.
    pub fn remote_window(&self) -> u32 {
        self.remote_window
    }

    /// Largest data payload the server accepts in one message.
    pub fn remote_max_packet(&self) -> u32 {
        self.remote_max_packet
    }

    /// Accounts for `len` received bytes.
    ///
    /// # Errors
    ///
    /// Returns [`TernError::Protocol`] if the server overran our window.
    pub fn consume_local(&mut self, len: usize) -> TernResult<()> {
        let len = u32::try_from(len).unwrap_or(u32::MAX);
        if len > self.local_window {
            return Err(TernError::Protocol(format!(
                "Channel {} received {} bytes with only {} left in the window",
                self.id, len, self.local_window
            )));
        }
        self.local_window -= len;
        Ok(())
    }

    /// Returns the bytes to grant in a WINDOW_ADJUST once the local window
    /// has fallen below one maximum packet, and restores it.
    pub fn take_refill(&mut self) -> Option<u32> {
        if self.local_window >= self.local_max_packet || self.status == ChannelStatus::Closed {
            return None;
        }
        let add = self.local_initial_window - self.local_window;
        self.local_window = self.local_initial_window;
        Some(add)
    }

    /// How many of `wanted` bytes may go out in the next data message.
    pub fn sendable(&self, wanted: usize) -> usize {
        wanted
            .min(self.remote_window as usize)
            .min(self.remote_max_packet as usize)
    }

    /// Accounts for `len` sent bytes.
    pub fn consume_remote(&mut self, len: usize) {
        self.remote_window = self.remote_window.saturating_sub(len as u32);
    }

    /// Applies a WINDOW_ADJUST from the server.
    pub fn adjust_remote(&mut self, add: u32) {
        self.remote_window = self.remote_window.saturating_add(add);
    }

    /// Buffers stdout data.
    pub fn push_data(&mut self, data: Vec<u8>) {
        if !data.is_empty() {
            self.inbound.push_back(data);
        }
        self.transition(ChannelStatus::on_data);
    }

    /// Buffers stderr data.
    pub fn push_stderr(&mut self, data: &[u8]) {
        self.stderr.extend_from_slice(data);
    }

    /// Oldest buffered stdout chunk.
    pub fn take_data(&mut self) -> Option<Vec<u8>> {
        self.inbound.pop_front()
    }

    /// Whether stdout data is buffered.
    pub fn has_data(&self) -> bool {
        !self.inbound.is_empty()
    }

    /// Drains buffered stderr.
    pub fn take_stderr(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.stderr)
    }

    /// Queues a request reply.
    pub fn push_reply(&mut self, success: bool) {
        self.replies.push_back(success);
        self.transition(ChannelStatus::on_request_reply);
    }

    /// Oldest unread request reply.
    pub fn take_reply(&mut self) -> Option<bool> {
        self.replies.pop_front()
    }

    /// Records how the remote process ended.
    pub fn set_exit(&mut self, exit: ExitStatus) {
        self.exit = Some(exit);
    }

    /// How the remote process ended, if known.
    pub fn exit(&self) -> Option<&ExitStatus> {
        self.exit.as_ref()
    }

    /// Exit code, if an `exit-status` arrived.
    pub fn exit_code(&self) -> Option<u32> {
        match self.exit {
            Some(ExitStatus::Code(code)) => Some(code),
            _ => None,
        }
    }

    /// Whether the server sent EOF or CLOSE.
    pub fn remote_eof(&self) -> bool {
        matches!(self.status, ChannelStatus::Eof | ChannelStatus::Closed)
    }

    /// Whether the server sent CLOSE.
    pub fn remote_closed(&self) -> bool {
        self.status == ChannelStatus::Closed
    }

    /// Marks our EOF as sent. Returns false if it already was.
    pub fn mark_eof_sent(&mut self) -> bool {
        !std::mem::replace(&mut self.eof_sent, true)
    }

    /// Marks our CLOSE as sent. Returns false if it already was.
    pub fn mark_close_sent(&mut self) -> bool {
        !std::mem::replace(&mut self.close_sent, true)
    }

    /// Whether our CLOSE went out.
    pub fn close_sent(&self) -> bool {
        self.close_sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_channel() -> Channel {
        let mut channel = Channel::new(ChannelId(0), 1000, 100);
        channel.confirm(100, 500, 64);
        channel
    }

    #[test]
    fn test_channel_creation() {
        let channel = Channel::new(ChannelId(3), 1000, 100);
        assert_eq!(channel.id(), ChannelId(3));
        assert_eq!(channel.status(), ChannelStatus::OpenPending);
        assert_eq!(channel.local_window(), 1000);

        let channel = open_channel();
        assert_eq!(channel.remote_id(), 100);
        assert_eq!(channel.status(), ChannelStatus::Open);
    }

    #[test]
    fn test_status_transitions() {
        let s = ChannelStatus::OpenPending.on_open_confirmed();
        assert_eq!(s, ChannelStatus::Open);
        let s = s.on_request_sent();
        assert_eq!(s, ChannelStatus::RequestPending);
        let s = s.on_request_reply();
        assert_eq!(s, ChannelStatus::Data);
        let s = s.on_eof();
        assert_eq!(s, ChannelStatus::Eof);
        assert!(s.is_writable());
        let s = s.on_close();
        assert_eq!(s, ChannelStatus::Closed);
        assert_eq!(s.on_eof(), ChannelStatus::Closed);
        assert!(!s.is_writable());
        assert!(!ChannelStatus::OpenPending.is_writable());
    }

    #[test]
    fn test_local_window_and_refill() {
        let mut channel = open_channel();
        channel.consume_local(850).unwrap();
        assert_eq!(channel.take_refill(), None);
        channel.consume_local(60).unwrap();
        assert_eq!(channel.local_window(), 90);
        assert_eq!(channel.take_refill(), Some(910));
        assert_eq!(channel.local_window(), 1000);
        assert!(channel.consume_local(1001).is_err());
    }

    #[test]
    fn test_remote_window_limits_sends() {
        let mut channel = open_channel();
        assert_eq!(channel.sendable(1000), 64);
        channel.consume_remote(480);
        assert_eq!(channel.sendable(1000), 20);
        channel.consume_remote(20);
        assert_eq!(channel.sendable(1000), 0);
        channel.adjust_remote(u32::MAX);
        assert_eq!(channel.remote_window(), u32::MAX);
    }

    #[test]
    fn test_inbound_buffers() {
        let mut channel = open_channel();
        channel.push_data(b"one".to_vec());
        channel.push_data(Vec::new());
        channel.push_data(b"two".to_vec());
        channel.push_stderr(b"err");
        assert_eq!(channel.status(), ChannelStatus::Data);
        assert_eq!(channel.take_data().unwrap(), b"one");
        assert_eq!(channel.take_data().unwrap(), b"two");
        assert!(channel.take_data().is_none());
        assert_eq!(channel.take_stderr(), b"err");
        assert!(channel.take_stderr().is_empty());
    }

    #[test]
    fn test_exit_and_markers() {
        let mut channel = open_channel();
        channel.set_exit(ExitStatus::Code(3));
        assert_eq!(channel.exit_code(), Some(3));
        assert!(channel.mark_eof_sent());
        assert!(!channel.mark_eof_sent());
        assert!(channel.mark_close_sent());
        assert!(channel.close_sent());
    }
}
