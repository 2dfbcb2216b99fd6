//! SSH client: connection, login, channel multiplexing and command execution.
//!
//! [`SshClient`] owns one [`Transport`] and every channel on it. All work is
//! sequential: while one channel is awaited, packets for other channels are
//! buffered on their own [`Channel`], never dropped, so no channel starves
//! another.
//!
//! # Example
//!
//! ```rust,no_run
//! use tern_proto::ssh::client::{SshClient, SshClientConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Connect to SSH server
//! let mut client = SshClient::connect("127.0.0.1:22", SshClientConfig::default()).await?;
//!
//! // Authenticate
//! client.login_password("user", "password").await?;
//!
//! // Execute command
//! let output = client.exec("ls -la").await?;
//! println!("{}", String::from_utf8_lossy(&output.stdout));
//! # Ok(())
//! # }
//! ```

use crate::ssh::auth::{Authenticator, Credential};
use crate::ssh::channel::{Channel, ChannelId, ChannelStatus, ExitStatus};
use crate::ssh::connection::{
    ChannelClose, ChannelData, ChannelEof, ChannelExtendedData, ChannelFailure, ChannelOpen,
    ChannelOpenConfirmation, ChannelOpenFailure, ChannelOpenFailureReason, ChannelRequest,
    ChannelRequestType, ChannelSuccess, ChannelType, ChannelWindowAdjust, GlobalRequest,
    PtyRequest, DEFAULT_MAX_PACKET_SIZE, DEFAULT_WINDOW_SIZE, MAX_PACKET_SIZE,
    SSH_EXTENDED_DATA_STDERR,
};
use crate::ssh::hostkey::fingerprint;
use crate::ssh::kex::AlgorithmPreferences;
use crate::ssh::logging::log_channel_event;
use crate::ssh::message::{describe, DisconnectReason, MessageType};
use crate::ssh::privatekey::PrivateKey;
use crate::ssh::transport::{
    GroupExchangeBits, HostKeyCheck, Lifecycle, Transport, TransportConfig,
};
use crate::ssh::version::{Identification, Version};
use crate::ssh::wire::{write_u32, write_u8};
use bytes::BytesMut;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tern_platform::{TernError, TernResult};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// SSH client configuration.
#[derive(Clone)]
pub struct SshClientConfig {
    /// Identification string sent to the server.
    pub client_version: Version,
    /// Soft timeout for one logical wait. `None` waits forever.
    pub timeout: Option<Duration>,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Algorithm preference lists, most preferred first.
    pub preferences: AlgorithmPreferences,
    /// Bit-size window for Diffie-Hellman group exchange.
    pub dh_group_exchange: GroupExchangeBits,
    /// Initial receive window per channel.
    pub window_size: u32,
    /// Largest data message accepted per channel.
    pub max_packet_size: u32,
    /// Bytes in either direction before an automatic rekey.
    pub rekey_bytes: u64,
    /// Host key trust policy.
    pub host_key_check: HostKeyCheck,
}

// Manual Debug implementation because HostKeyCheck may hold a callback
impl std::fmt::Debug for SshClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshClientConfig")
            .field("client_version", &self.client_version.to_string())
            .field("timeout", &self.timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("preferences", &self.preferences)
            .field("dh_group_exchange", &self.dh_group_exchange)
            .field("window_size", &self.window_size)
            .field("max_packet_size", &self.max_packet_size)
            .field("rekey_bytes", &self.rekey_bytes)
            .field("host_key_check", &self.host_key_check)
            .finish()
    }
}

impl Default for SshClientConfig {
    fn default() -> Self {
        Self {
            client_version: Version::default_tern(),
            timeout: None,
            connect_timeout: Duration::from_secs(30),
            preferences: AlgorithmPreferences::default(),
            dh_group_exchange: GroupExchangeBits::default(),
            window_size: DEFAULT_WINDOW_SIZE,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            rekey_bytes: 1 << 30,
            host_key_check: HostKeyCheck::AcceptAny,
        }
    }
}

impl SshClientConfig {
    /// Rejects settings the protocol cannot work with.
    pub fn validate(&self) -> TernResult<()> {
        self.preferences.validate()?;
        self.dh_group_exchange.validate()?;
        if self.max_packet_size == 0 || self.max_packet_size > MAX_PACKET_SIZE {
            return Err(TernError::Config(format!(
                "max_packet_size must be in 1..={}, got {}",
                MAX_PACKET_SIZE, self.max_packet_size
            )));
        }
        if self.window_size < self.max_packet_size {
            return Err(TernError::Config(format!(
                "window_size {} is smaller than max_packet_size {}",
                self.window_size, self.max_packet_size
            )));
        }
        if self.rekey_bytes == 0 {
            return Err(TernError::Config("rekey_bytes must be non-zero".to_string()));
        }
        Ok(())
    }

    fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            version: self.client_version.clone(),
            preferences: self.preferences.clone(),
            group_exchange: self.dh_group_exchange,
            rekey_bytes: self.rekey_bytes,
            host_key_check: self.host_key_check.clone(),
        }
    }
}

/// Options for [`SshClient::exec_with`].
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Request a pseudo-terminal first
    pub pty: Option<PtyRequest>,
    /// Environment variables, sent without waiting for replies
    pub env: Vec<(String, String)>,
}

/// Result of a one-shot command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Standard output (empty when streamed to a callback)
    pub stdout: Vec<u8>,
    /// Standard error
    pub stderr: Vec<u8>,
    /// How the command ended, if the server said
    pub exit: Option<ExitStatus>,
}

impl ExecOutput {
    /// Exit code, if the server sent `exit-status`.
    pub fn exit_status(&self) -> Option<u32> {
        match self.exit {
            Some(ExitStatus::Code(code)) => Some(code),
            _ => None,
        }
    }
}

/// SSH client.
pub struct SshClient<S> {
    transport: Transport<S>,
    config: SshClientConfig,
    auth: Authenticator,
    channels: HashMap<u32, Channel>,
    open_failures: HashMap<u32, String>,
    next_channel: u32,
    global_replies: VecDeque<bool>,
    timed_out: bool,
    user: Option<String>,
}

impl<S> std::fmt::Debug for SshClient<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshClient")
            .field("transport", &self.transport)
            .field("user", &self.user)
            .field("channels", &self.channels.len())
            .finish_non_exhaustive()
    }
}

impl SshClient<TcpStream> {
    /// Connects over TCP and performs the handshake.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use tern_proto::ssh::client::{SshClient, SshClientConfig};
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let client = SshClient::connect("server:22", SshClientConfig::default()).await?;
    /// println!("{}", client.server_host_key());
    /// # Ok(())
    /// # }
    /// ```
    pub async fn connect(addr: &str, config: SshClientConfig) -> TernResult<Self> {
        config.validate()?;
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TernError::Timeout)??;
        stream.set_nodelay(true)?;
        info!(addr = addr, "TCP connection established");
        Self::handshake(stream, config).await
    }
}

impl<S> SshClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Runs identification exchange and the first key exchange over an
    /// already connected stream.
    pub async fn handshake(stream: S, config: SshClientConfig) -> TernResult<Self> {
        config.validate()?;
        let deadline = config.timeout.map(|t| Instant::now() + t);
        let transport = Transport::handshake(stream, config.transport_config(), deadline).await?;
        Ok(Self {
            transport,
            config,
            auth: Authenticator::new(),
            channels: HashMap::new(),
            open_failures: HashMap::new(),
            next_channel: 0,
            global_replies: VecDeque::new(),
            timed_out: false,
            user: None,
        })
    }

    // ---- timeouts ----

    pub(crate) fn arm(&mut self) {
        self.timed_out = false;
        let deadline = self.config.timeout.map(|t| Instant::now() + t);
        self.transport.set_deadline(deadline);
    }

    /// Ends an operation started with [`arm`](Self::arm). A fatal error
    /// raised above the transport, such as malformed SFTP framing, ends the
    /// session just like one raised inside it.
    pub(crate) fn settle<T>(&mut self, result: TernResult<T>) -> TernResult<T> {
        self.transport.set_deadline(None);
        match result {
            Err(e) => {
                self.timed_out = e.is_timeout();
                if e.is_fatal() {
                    self.transport.fail(e)
                } else {
                    Err(e)
                }
            }
            ok => ok,
        }
    }

    /// Whether the last operation ended on the soft timeout rather than a
    /// failure.
    pub fn is_timeout(&self) -> bool {
        self.timed_out
    }

    /// Changes the soft timeout for later operations.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.config.timeout = timeout;
    }

    // ---- session information ----

    /// Server host key fingerprint, `SHA256:<base64>`.
    pub fn server_host_key(&self) -> String {
        fingerprint(self.transport.host_key())
    }

    /// Server host key blob.
    pub fn server_host_key_blob(&self) -> &[u8] {
        self.transport.host_key()
    }

    /// Identification strings and the server's pre-identification banner.
    pub fn identification(&self) -> &Identification {
        self.transport.identification()
    }

    /// Lifecycle bits of the underlying transport.
    pub fn lifecycle(&self) -> Lifecycle {
        self.transport.lifecycle()
    }

    /// Whether the transport is still usable.
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Whether login succeeded.
    pub fn is_authenticated(&self) -> bool {
        self.transport.lifecycle().contains(Lifecycle::LOGIN)
    }

    /// Authenticated user name.
    pub fn username(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// Authentication banner text received so far.
    pub fn banner(&self) -> String {
        self.auth.banner().concat()
    }

    // ---- authentication ----

    /// Tries `credentials` in order until one is accepted.
    ///
    /// # Errors
    ///
    /// [`TernError::Auth`] when every credential is refused; the session
    /// stays usable for another attempt.
    pub async fn login(&mut self, user: &str, credentials: &mut [Credential<'_>]) -> TernResult<()> {
        self.arm();
        let result = self.auth.login(&mut self.transport, user, credentials).await;
        if result.is_ok() {
            self.user = Some(user.to_string());
        }
        self.settle(result)
    }

    /// Password login, falling back to keyboard-interactive.
    pub async fn login_password(&mut self, user: &str, password: &str) -> TernResult<()> {
        self.login(user, &mut [Credential::Password(password)]).await
    }

    /// Public key login with a local key.
    pub async fn login_key(&mut self, user: &str, key: &PrivateKey) -> TernResult<()> {
        self.login(user, &mut [Credential::PublicKey(key)]).await
    }

    /// Methods the server accepts for `user`, discovered with a "none"
    /// request. Empty if "none" itself succeeded.
    pub async fn auth_methods(&mut self, user: &str) -> TernResult<Vec<String>> {
        self.arm();
        let result = self.auth.query_methods(&mut self.transport, user).await;
        if matches!(&result, Ok(methods) if methods.is_empty()) {
            self.user = Some(user.to_string());
        }
        self.settle(result)
    }

    // ---- transport services ----

    /// Sends SSH_MSG_IGNORE.
    pub async fn send_ignore(&mut self, data: &[u8]) -> TernResult<()> {
        self.arm();
        let result = self.transport.send_ignore(data).await;
        self.settle(result)
    }

    /// Sends a `keepalive@openssh.com` global request and waits for any
    /// reply.
    pub async fn ping(&mut self) -> TernResult<()> {
        self.arm();
        let result = self.ping_inner().await;
        self.settle(result)
    }

    async fn ping_inner(&mut self) -> TernResult<()> {
        let request = GlobalRequest::new("keepalive@openssh.com", true);
        self.transport.send(&request.to_bytes()).await?;
        loop {
            if self.global_replies.pop_front().is_some() {
                return Ok(());
            }
            self.pump().await?;
        }
    }

    /// Runs a key exchange now.
    pub async fn rekey(&mut self) -> TernResult<()> {
        self.arm();
        let result = self.transport.rekey().await;
        self.settle(result)
    }

    /// Sends DISCONNECT and tears the session down. All channels are
    /// abandoned.
    pub async fn disconnect(&mut self) {
        self.channels.clear();
        self.transport
            .disconnect(DisconnectReason::ByApplication, "Client disconnecting")
            .await;
    }

    // ---- channel multiplexer ----

    pub(crate) fn ensure_login(&self) -> TernResult<()> {
        if !self.transport.is_connected() {
            return Err(TernError::NotConnected);
        }
        if !self.is_authenticated() {
            return Err(TernError::Auth("Not authenticated".to_string()));
        }
        Ok(())
    }

    pub(crate) fn channel_mut(&mut self, id: ChannelId) -> TernResult<&mut Channel> {
        self.channels
            .get_mut(&id.0)
            .ok_or_else(|| TernError::Channel(format!("Unknown channel {}", id)))
    }

    fn parse<T>(&mut self, parsed: TernResult<T>) -> TernResult<T> {
        match parsed {
            Ok(value) => Ok(value),
            Err(e) => self.transport.fail(e),
        }
    }

    /// Reads one packet and routes it.
    pub(crate) async fn pump(&mut self) -> TernResult<()> {
        let payload = self.transport.recv().await?;
        match MessageType::from_u8(payload[0]) {
            Some(MessageType::ChannelOpenConfirmation) => {
                let msg = self.parse(ChannelOpenConfirmation::from_bytes(&payload))?;
                let local = msg.recipient_channel();
                match self.channels.get_mut(&local) {
                    Some(ch) if ch.status() == ChannelStatus::OpenPending => {
                        ch.confirm(
                            msg.sender_channel(),
                            msg.initial_window_size(),
                            msg.maximum_packet_size().min(MAX_PACKET_SIZE),
                        );
                        log_channel_event(local, msg.sender_channel(), "open");
                    }
                    _ => {
                        return self.transport.fail(TernError::Protocol(format!(
                            "OPEN_CONFIRMATION for channel {} that is not opening",
                            local
                        )))
                    }
                }
            }
            Some(MessageType::ChannelOpenFailure) => {
                let msg = self.parse(ChannelOpenFailure::from_bytes(&payload))?;
                log_channel_event(msg.recipient_channel(), 0, "open-failure");
                self.open_failures
                    .insert(msg.recipient_channel(), msg.to_string());
            }
            Some(MessageType::ChannelWindowAdjust) => {
                let msg = self.parse(ChannelWindowAdjust::from_bytes(&payload))?;
                if let Some(ch) = self.channels.get_mut(&msg.recipient_channel()) {
                    ch.adjust_remote(msg.bytes_to_add());
                }
            }
            Some(MessageType::ChannelData) => {
                let msg = self.parse(ChannelData::from_bytes(&payload))?;
                let local = msg.recipient_channel();
                let Some(ch) = self.channels.get_mut(&local) else {
                    debug!(channel = local, "Data for unknown channel dropped");
                    return Ok(());
                };
                if let Err(e) = ch.consume_local(msg.data().len()) {
                    return self.transport.fail(e);
                }
                ch.push_data(msg.into_data());
            }
            Some(MessageType::ChannelExtendedData) => {
                let msg = self.parse(ChannelExtendedData::from_bytes(&payload))?;
                let local = msg.recipient_channel();
                let code = msg.data_type_code();
                let data = msg.into_data();
                let Some(ch) = self.channels.get_mut(&local) else {
                    return Ok(());
                };
                if let Err(e) = ch.consume_local(data.len()) {
                    return self.transport.fail(e);
                }
                if code == SSH_EXTENDED_DATA_STDERR {
                    ch.push_stderr(&data);
                }
                // Extended data shares the window; give it back once read.
                if let Some(add) = ch.take_refill() {
                    let remote = ch.remote_id();
                    self.transport
                        .send(&ChannelWindowAdjust::new(remote, add).to_bytes())
                        .await?;
                }
            }
            Some(MessageType::ChannelEof) => {
                let msg = self.parse(ChannelEof::from_bytes(&payload))?;
                if let Some(ch) = self.channels.get_mut(&msg.recipient_channel()) {
                    ch.transition(ChannelStatus::on_eof);
                    log_channel_event(msg.recipient_channel(), ch.remote_id(), "eof");
                }
            }
            Some(MessageType::ChannelClose) => {
                let msg = self.parse(ChannelClose::from_bytes(&payload))?;
                if let Some(ch) = self.channels.get_mut(&msg.recipient_channel()) {
                    ch.transition(ChannelStatus::on_close);
                    let remote = ch.remote_id();
                    log_channel_event(msg.recipient_channel(), remote, "close");
                    if ch.mark_close_sent() {
                        self.transport
                            .send(&ChannelClose::new(remote).to_bytes())
                            .await?;
                    }
                }
            }
            Some(MessageType::ChannelRequest) => {
                let req = self.parse(ChannelRequest::from_bytes(&payload))?;
                let Some(ch) = self.channels.get_mut(&req.recipient_channel()) else {
                    return Ok(());
                };
                match req.request_type() {
                    ChannelRequestType::ExitStatus { exit_status } => {
                        ch.set_exit(ExitStatus::Code(*exit_status));
                    }
                    ChannelRequestType::ExitSignal {
                        signal_name,
                        core_dumped,
                        error_message,
                    } => ch.set_exit(ExitStatus::Signal {
                        name: signal_name.clone(),
                        core_dumped: *core_dumped,
                        message: error_message.clone(),
                    }),
                    other => debug!(request = other.name(), "Ignoring channel request"),
                }
                if req.want_reply() {
                    let remote = ch.remote_id();
                    self.transport
                        .send(&ChannelFailure::new(remote).to_bytes())
                        .await?;
                }
            }
            Some(MessageType::ChannelSuccess) => {
                let msg = self.parse(ChannelSuccess::from_bytes(&payload))?;
                if let Some(ch) = self.channels.get_mut(&msg.recipient_channel()) {
                    ch.push_reply(true);
                }
            }
            Some(MessageType::ChannelFailure) => {
                let msg = self.parse(ChannelFailure::from_bytes(&payload))?;
                if let Some(ch) = self.channels.get_mut(&msg.recipient_channel()) {
                    ch.push_reply(false);
                }
            }
            Some(MessageType::GlobalRequest) => {
                let req = self.parse(GlobalRequest::from_bytes(&payload))?;
                debug!(request = req.name(), "Refusing server global request");
                if req.want_reply() {
                    self.transport
                        .send(&[MessageType::RequestFailure as u8])
                        .await?;
                }
            }
            Some(MessageType::RequestSuccess) => self.global_replies.push_back(true),
            Some(MessageType::RequestFailure) => self.global_replies.push_back(false),
            Some(MessageType::ChannelOpen) => {
                let open = self.parse(ChannelOpen::from_bytes(&payload))?;
                warn!(
                    channel_type = open.channel_type().name(),
                    "Refusing server initiated channel"
                );
                let refusal = ChannelOpenFailure::new(
                    open.sender_channel(),
                    ChannelOpenFailureReason::AdministrativelyProhibited,
                    "Client does not accept channels",
                );
                self.transport.send(&refusal.to_bytes()).await?;
            }
            _ => {
                warn!(message = %describe(payload[0]), "Unexpected message, replying UNIMPLEMENTED");
                let seq = self.transport.sequence_numbers().1.wrapping_sub(1);
                let mut buf = BytesMut::with_capacity(5);
                write_u8(&mut buf, MessageType::Unimplemented as u8);
                write_u32(&mut buf, seq);
                self.transport.send(&buf).await?;
            }
        }
        Ok(())
    }

    pub(crate) async fn open_session(&mut self) -> TernResult<ChannelId> {
        self.ensure_login()?;
        let id = self.next_channel;
        self.next_channel = self.next_channel.wrapping_add(1);
        let window = self.config.window_size;
        let max_packet = self.config.max_packet_size;
        self.channels
            .insert(id, Channel::new(ChannelId(id), window, max_packet));

        let open = ChannelOpen::new(ChannelType::Session, id, window, max_packet);
        self.transport.send(&open.to_bytes()).await?;

        loop {
            if let Some(reason) = self.open_failures.remove(&id) {
                self.channels.remove(&id);
                return Err(TernError::Channel(format!(
                    "Channel open refused: {}",
                    reason
                )));
            }
            let opened = self
                .channels
                .get(&id)
                .map_or(false, |c| c.status() != ChannelStatus::OpenPending);
            if opened {
                return Ok(ChannelId(id));
            }
            self.pump().await?;
        }
    }

    pub(crate) async fn request(
        &mut self,
        id: ChannelId,
        request_type: ChannelRequestType,
        want_reply: bool,
    ) -> TernResult<()> {
        let remote = self.channel_mut(id)?.remote_id();
        let name = request_type.name().to_string();
        let request = ChannelRequest::new(remote, request_type, want_reply);
        self.transport.send(&request.to_bytes()).await?;
        if !want_reply {
            return Ok(());
        }
        self.channel_mut(id)?
            .transition(ChannelStatus::on_request_sent);

        loop {
            let ch = self.channel_mut(id)?;
            if let Some(ok) = ch.take_reply() {
                return if ok {
                    Ok(())
                } else {
                    Err(TernError::Channel(format!(
                        "Request '{}' refused on channel {}",
                        name, id
                    )))
                };
            }
            if ch.remote_closed() {
                return Err(TernError::Channel(format!(
                    "Channel {} closed before answering '{}'",
                    id, name
                )));
            }
            self.pump().await?;
        }
    }

    /// Sends a request and closes the channel if it is refused.
    pub(crate) async fn request_or_close(
        &mut self,
        id: ChannelId,
        request_type: ChannelRequestType,
    ) -> TernResult<()> {
        match self.request(id, request_type, true).await {
            Err(e @ TernError::Channel(_)) => {
                self.close_inner(id).await?;
                Err(e)
            }
            other => other,
        }
    }

    pub(crate) async fn write_inner(&mut self, id: ChannelId, data: &[u8]) -> TernResult<()> {
        let mut offset = 0;
        while offset < data.len() {
            let ch = self.channel_mut(id)?;
            if ch.remote_closed() || !ch.status().is_writable() {
                return Err(TernError::Channel(format!("Channel {} is closed", id)));
            }
            let n = ch.sendable(data.len() - offset);
            if n == 0 {
                // Window exhausted: drain other traffic until it is replenished.
                self.pump().await?;
                continue;
            }
            let remote = ch.remote_id();
            ch.consume_remote(n);
            ch.transition(ChannelStatus::on_data);
            self.transport
                .send(&ChannelData::encode(remote, &data[offset..offset + n]))
                .await?;
            offset += n;
        }
        Ok(())
    }

    pub(crate) async fn read_inner(&mut self, id: ChannelId) -> TernResult<Option<Vec<u8>>> {
        loop {
            let ch = self.channel_mut(id)?;
            if let Some(data) = ch.take_data() {
                if let Some(add) = ch.take_refill() {
                    let remote = ch.remote_id();
                    self.transport
                        .send(&ChannelWindowAdjust::new(remote, add).to_bytes())
                        .await?;
                }
                return Ok(Some(data));
            }
            if ch.remote_eof() {
                return Ok(None);
            }
            self.pump().await?;
        }
    }

    pub(crate) async fn read_buffered(&mut self, id: ChannelId) -> TernResult<Vec<u8>> {
        let mut out = Vec::new();
        let ch = self.channel_mut(id)?;
        while let Some(data) = ch.take_data() {
            out.extend_from_slice(&data);
        }
        if let Some(add) = ch.take_refill() {
            let remote = ch.remote_id();
            self.transport
                .send(&ChannelWindowAdjust::new(remote, add).to_bytes())
                .await?;
        }
        Ok(out)
    }

    pub(crate) async fn send_eof_inner(&mut self, id: ChannelId) -> TernResult<()> {
        let ch = self.channel_mut(id)?;
        if ch.remote_closed() || !ch.mark_eof_sent() {
            return Ok(());
        }
        let remote = ch.remote_id();
        self.transport.send(&ChannelEof::new(remote).to_bytes()).await
    }

    pub(crate) async fn close_inner(&mut self, id: ChannelId) -> TernResult<Option<Channel>> {
        let Some(ch) = self.channels.get_mut(&id.0) else {
            return Ok(None);
        };
        let remote = ch.remote_id();
        let send_eof = !ch.remote_closed() && ch.mark_eof_sent();
        let send_close = ch.mark_close_sent();
        if send_eof {
            self.transport.send(&ChannelEof::new(remote).to_bytes()).await?;
        }
        if send_close {
            self.transport
                .send(&ChannelClose::new(remote).to_bytes())
                .await?;
        }
        // Drain replies so sequence numbers stay consistent.
        while !self.channels.get(&id.0).map_or(true, Channel::remote_closed) {
            self.pump().await?;
        }
        log_channel_event(id.0, remote, "closed");
        Ok(self.channels.remove(&id.0))
    }

    // ---- generic channel access ----

    /// Opens a session channel and runs `command` on it.
    pub async fn open_exec(&mut self, command: &str, options: &ExecOptions) -> TernResult<ChannelId> {
        self.arm();
        let result = self.open_exec_inner(command, options).await;
        self.settle(result)
    }

    pub(crate) async fn open_exec_inner(&mut self, command: &str, options: &ExecOptions) -> TernResult<ChannelId> {
        let id = self.open_session().await?;
        if let Some(pty) = &options.pty {
            self.request_or_close(id, ChannelRequestType::PtyReq(pty.clone()))
                .await?;
        }
        for (name, value) in &options.env {
            let env = ChannelRequestType::Env {
                name: name.clone(),
                value: value.clone(),
            };
            self.request(id, env, false).await?;
        }
        let exec = ChannelRequestType::Exec {
            command: command.to_string(),
        };
        self.request_or_close(id, exec).await?;
        debug!(channel = id.0, command = command, "Command started");
        Ok(id)
    }

    /// Opens a session channel running the named subsystem.
    pub async fn start_subsystem(&mut self, name: &str) -> TernResult<ChannelId> {
        self.arm();
        let result = async {
            let id = self.open_session().await?;
            let subsystem = ChannelRequestType::Subsystem {
                name: name.to_string(),
            };
            self.request_or_close(id, subsystem).await?;
            Ok(id)
        }
        .await;
        self.settle(result)
    }

    /// Opens a session channel with a pty and an interactive shell.
    pub async fn open_shell(&mut self, pty: &PtyRequest) -> TernResult<ChannelId> {
        self.arm();
        let result = async {
            let id = self.open_session().await?;
            self.request_or_close(id, ChannelRequestType::PtyReq(pty.clone()))
                .await?;
            self.request_or_close(id, ChannelRequestType::Shell).await?;
            self.transport.mark(Lifecycle::SHELL);
            Ok(id)
        }
        .await;
        self.settle(result)
    }

    /// Asks the server to forward agent connections on `id`.
    pub async fn request_agent_forwarding(&mut self, id: ChannelId) -> TernResult<()> {
        self.arm();
        let result = self.request(id, ChannelRequestType::AuthAgent, true).await;
        self.settle(result)
    }

    /// Sends a `window-change` request.
    pub async fn window_change(&mut self, id: ChannelId, columns: u32, rows: u32) -> TernResult<()> {
        self.arm();
        let change = ChannelRequestType::WindowChange {
            columns,
            rows,
            width_pixels: 0,
            height_pixels: 0,
        };
        let result = self.request(id, change, false).await;
        self.settle(result)
    }

    /// Next chunk of stdout from `id`. `None` after EOF.
    pub async fn read(&mut self, id: ChannelId) -> TernResult<Option<Vec<u8>>> {
        self.arm();
        let result = self.read_inner(id).await;
        self.settle(result)
    }

    /// Writes all of `data`, waiting for window space as needed.
    pub async fn write(&mut self, id: ChannelId, data: &[u8]) -> TernResult<()> {
        self.arm();
        let result = self.write_inner(id, data).await;
        self.settle(result)
    }

    /// Sends EOF on `id`.
    pub async fn send_eof(&mut self, id: ChannelId) -> TernResult<()> {
        self.arm();
        let result = self.send_eof_inner(id).await;
        self.settle(result)
    }

    /// Closes `id` and waits for the server's close. Returns how the remote
    /// process ended, if known.
    pub async fn close_channel(&mut self, id: ChannelId) -> TernResult<Option<ExitStatus>> {
        self.arm();
        let result = self.close_inner(id).await;
        if result.is_ok() && self.channels.is_empty() {
            self.transport.unmark(Lifecycle::SHELL);
        }
        let result = result.map(|ch| ch.and_then(|c| c.exit().cloned()));
        self.settle(result)
    }

    /// Drains stderr buffered on `id`.
    pub fn take_stderr(&mut self, id: ChannelId) -> Vec<u8> {
        self.channels
            .get_mut(&id.0)
            .map(Channel::take_stderr)
            .unwrap_or_default()
    }

    /// How the process on `id` ended, if known.
    pub fn exit_status(&self, id: ChannelId) -> Option<&ExitStatus> {
        self.channels.get(&id.0).and_then(Channel::exit)
    }

    /// Whether the server sent EOF or CLOSE on `id`.
    pub fn is_eof(&self, id: ChannelId) -> bool {
        self.channels.get(&id.0).map_or(true, Channel::remote_eof)
    }

    /// Whether stdout data for `id` is already buffered.
    pub fn has_buffered(&self, id: ChannelId) -> bool {
        self.channels.get(&id.0).map_or(false, Channel::has_data)
    }

    // ---- one-shot exec ----

    /// Runs `command` and collects its output.
    pub async fn exec(&mut self, command: &str) -> TernResult<ExecOutput> {
        self.exec_with(command, &ExecOptions::default()).await
    }

    /// Runs `command` with options and collects its output.
    pub async fn exec_with(&mut self, command: &str, options: &ExecOptions) -> TernResult<ExecOutput> {
        let mut stdout = Vec::new();
        let mut output = self
            .exec_streaming(command, options, |chunk| {
                stdout.extend_from_slice(chunk);
                true
            })
            .await?;
        output.stdout = stdout;
        Ok(output)
    }

    /// Runs `command`, handing each stdout chunk to `on_data`. Returning
    /// `false` from the callback stops reading and closes the channel.
    pub async fn exec_streaming<F>(
        &mut self,
        command: &str,
        options: &ExecOptions,
        mut on_data: F,
    ) -> TernResult<ExecOutput>
    where
        F: FnMut(&[u8]) -> bool + Send,
    {
        self.arm();
        let result = async {
            let id = self.open_exec_inner(command, options).await?;
            while let Some(chunk) = self.read_inner(id).await? {
                if !on_data(&chunk) {
                    debug!(channel = id.0, "Exec output stopped by caller");
                    break;
                }
            }
            let mut output = ExecOutput::default();
            if let Some(mut ch) = self.close_inner(id).await? {
                output.stderr = ch.take_stderr();
                output.exit = ch.exit().cloned();
            }
            Ok(output)
        }
        .await;
        self.settle(result)
    }
}
