//! SSH authentication protocol (RFC 4252, RFC 4256).
//!
//! This module implements client-side user authentication:
//! - "none" - discovers the methods the server allows
//! - "password" - with fallback to keyboard-interactive
//! - "publickey" - query then sign, with a local [`PrivateKey`]
//! - "keyboard-interactive" - prompt/response rounds (RFC 4256)
//! - agent-relayed publickey via the [`Agent`] collaborator
//!
//! Exhausting every supplied credential is a recoverable
//! [`TernError::Auth`]; the session stays usable for another attempt.
//!
//! # Example
//!
//! ```rust
//! use tern_proto::ssh::auth::{AuthMethod, AuthRequest};
//!
//! let auth = AuthRequest::new(
//!     "user",
//!     "ssh-connection",
//!     AuthMethod::Password("secret".to_string()),
//! );
//! assert_eq!(auth.method().name(), "password");
//! ```

use crate::ssh::logging::log_auth_attempt;
use crate::ssh::message::MessageType;
use crate::ssh::privatekey::PrivateKey;
use crate::ssh::transport::{Lifecycle, Transport};
use crate::ssh::wire::{write_bool, write_str, write_string, write_u32, write_u8, Reader};
use async_trait::async_trait;
use bytes::BytesMut;
use tern_platform::{TernError, TernResult};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;
use zeroize::Zeroize;

/// Service requested before authentication.
pub const SERVICE_USERAUTH: &str = "ssh-userauth";

/// Service started after authentication.
pub const SERVICE_CONNECTION: &str = "ssh-connection";

/// Agent sign flag requesting an `rsa-sha2-256` signature.
pub const SSH_AGENT_RSA_SHA2_256: u32 = 2;

/// Keyboard-interactive rounds accepted before giving up.
const MAX_INFO_ROUNDS: usize = 32;

/// SSH authentication method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// No authentication, used to list allowed methods.
    None,
    /// Password authentication.
    Password(String),
    /// Public key authentication.
    PublicKey {
        /// Algorithm name (e.g., "ssh-ed25519", "rsa-sha2-256")
        algorithm: String,
        /// Public key blob
        public_key: Vec<u8>,
        /// Signature (if present)
        signature: Option<Vec<u8>>,
    },
    /// Keyboard-interactive authentication.
    KeyboardInteractive {
        /// Submethod hints, usually empty
        submethods: String,
    },
}

impl AuthMethod {
    /// Returns the method name.
    pub fn name(&self) -> &str {
        match self {
            AuthMethod::None => "none",
            AuthMethod::Password(_) => "password",
            AuthMethod::PublicKey { .. } => "publickey",
            AuthMethod::KeyboardInteractive { .. } => "keyboard-interactive",
        }
    }
}

impl Drop for AuthMethod {
    fn drop(&mut self) {
        if let AuthMethod::Password(ref mut password) = self {
            password.zeroize();
        }
    }
}

/// SSH_MSG_USERAUTH_REQUEST message (RFC 4252 Section 5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    user_name: String,
    service_name: String,
    method: AuthMethod,
}

impl AuthRequest {
    /// Creates a new authentication request.
    pub fn new(user_name: &str, service_name: &str, method: AuthMethod) -> Self {
        Self {
            user_name: user_name.to_string(),
            service_name: service_name.to_string(),
            method,
        }
    }

    /// Returns the user name.
    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    /// Returns the service name.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Returns the authentication method.
    pub fn method(&self) -> &AuthMethod {
        &self.method
    }

    /// Serializes the authentication request to bytes.
    ///
    /// Format (RFC 4252 Section 5):
    /// ```text
    /// byte      SSH_MSG_USERAUTH_REQUEST (50)
    /// string    user name
    /// string    service name
    /// string    method name
    /// ....      method specific fields
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        write_u8(&mut buf, MessageType::UserauthRequest as u8);
        write_str(&mut buf, &self.user_name);
        write_str(&mut buf, &self.service_name);
        write_str(&mut buf, self.method.name());

        match &self.method {
            AuthMethod::None => {}
            AuthMethod::Password(password) => {
                write_bool(&mut buf, false);
                write_str(&mut buf, password);
            }
            AuthMethod::PublicKey {
                algorithm,
                public_key,
                signature,
            } => {
                write_bool(&mut buf, signature.is_some());
                write_str(&mut buf, algorithm);
                write_string(&mut buf, public_key);
                if let Some(sig) = signature {
                    write_string(&mut buf, sig);
                }
            }
            AuthMethod::KeyboardInteractive { submethods } => {
                // language tag, deprecated
                write_str(&mut buf, "");
                write_str(&mut buf, submethods);
            }
        }

        buf.to_vec()
    }

    /// Parses an authentication request from bytes.
    ///
    /// # Errors
    ///
    /// Returns [`TernError::Protocol`] if the data is invalid.
    pub fn from_bytes(data: &[u8]) -> TernResult<Self> {
        let mut r = Reader::new(data);
        let kind = r.read_u8()?;
        if kind != MessageType::UserauthRequest as u8 {
            return Err(TernError::Protocol(format!(
                "Invalid message type: expected 50 (SSH_MSG_USERAUTH_REQUEST), got {}",
                kind
            )));
        }

        let user_name = r.read_str()?.to_string();
        let service_name = r.read_str()?.to_string();
        let method_name = r.read_str()?;

        let method = match method_name {
            "none" => AuthMethod::None,
            "password" => {
                let _changing = r.read_bool()?;
                AuthMethod::Password(r.read_str()?.to_string())
            }
            "publickey" => {
                let has_signature = r.read_bool()?;
                let algorithm = r.read_str()?.to_string();
                let public_key = r.read_string()?.to_vec();
                let signature = if has_signature {
                    Some(r.read_string()?.to_vec())
                } else {
                    None
                };
                AuthMethod::PublicKey {
                    algorithm,
                    public_key,
                    signature,
                }
            }
            "keyboard-interactive" => {
                let _language = r.read_str()?;
                AuthMethod::KeyboardInteractive {
                    submethods: r.read_str()?.to_string(),
                }
            }
            other => {
                return Err(TernError::Protocol(format!(
                    "Unsupported authentication method: '{}'",
                    other
                )))
            }
        };

        Ok(Self {
            user_name,
            service_name,
            method,
        })
    }
}

/// SSH_MSG_USERAUTH_FAILURE message (RFC 4252 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthFailure {
    methods_can_continue: Vec<String>,
    partial_success: bool,
}

impl AuthFailure {
    /// Creates a new authentication failure message.
    pub fn new(methods: Vec<String>, partial_success: bool) -> Self {
        Self {
            methods_can_continue: methods,
            partial_success,
        }
    }

    /// Returns the methods that can continue.
    pub fn methods_can_continue(&self) -> &[String] {
        &self.methods_can_continue
    }

    /// Returns whether partial success was achieved.
    pub fn partial_success(&self) -> bool {
        self.partial_success
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        write_u8(&mut buf, MessageType::UserauthFailure as u8);
        write_str(&mut buf, &self.methods_can_continue.join(","));
        write_bool(&mut buf, self.partial_success);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TernResult<Self> {
        let mut r = Reader::new(data);
        let kind = r.read_u8()?;
        if kind != MessageType::UserauthFailure as u8 {
            return Err(TernError::Protocol(format!(
                "Invalid message type: expected 51 (SSH_MSG_USERAUTH_FAILURE), got {}",
                kind
            )));
        }
        let methods_can_continue = r.read_name_list()?;
        let partial_success = r.read_bool()?;
        Ok(Self {
            methods_can_continue,
            partial_success,
        })
    }
}

/// SSH_MSG_USERAUTH_BANNER message (RFC 4252 Section 5.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthBanner {
    message: String,
}

impl AuthBanner {
    /// Creates a new banner message.
    pub fn new(message: String) -> Self {
        Self { message }
    }

    /// Returns the banner message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        write_u8(&mut buf, MessageType::UserauthBanner as u8);
        write_str(&mut buf, &self.message);
        write_str(&mut buf, "");
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TernResult<Self> {
        let mut r = Reader::new(data);
        let kind = r.read_u8()?;
        if kind != MessageType::UserauthBanner as u8 {
            return Err(TernError::Protocol(format!(
                "Invalid message type: expected 53 (SSH_MSG_USERAUTH_BANNER), got {}",
                kind
            )));
        }
        Ok(Self {
            message: r.read_lossy()?,
        })
    }
}

/// SSH_MSG_USERAUTH_PK_OK message (RFC 4252 Section 7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPkOk {
    algorithm: String,
    public_key: Vec<u8>,
}

impl AuthPkOk {
    /// Creates a new SSH_MSG_USERAUTH_PK_OK message.
    pub fn new(algorithm: impl Into<String>, public_key: Vec<u8>) -> Self {
        Self {
            algorithm: algorithm.into(),
            public_key,
        }
    }

    /// Returns the algorithm name.
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// Returns the public key blob.
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        write_u8(&mut buf, MessageType::UserauthPkOk as u8);
        write_str(&mut buf, &self.algorithm);
        write_string(&mut buf, &self.public_key);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TernResult<Self> {
        let mut r = Reader::new(data);
        let kind = r.read_u8()?;
        if kind != MessageType::UserauthPkOk as u8 {
            return Err(TernError::Protocol(format!(
                "Invalid message type: expected 60 (SSH_MSG_USERAUTH_PK_OK), got {}",
                kind
            )));
        }
        Ok(Self {
            algorithm: r.read_str()?.to_string(),
            public_key: r.read_string()?.to_vec(),
        })
    }
}

/// SSH_MSG_USERAUTH_INFO_REQUEST message (RFC 4256 Section 3.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoRequest {
    /// Name of the prompt set
    pub name: String,
    /// Instruction text
    pub instruction: String,
    /// Prompts with their echo flags
    pub prompts: Vec<(String, bool)>,
}

impl InfoRequest {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        write_u8(&mut buf, MessageType::UserauthPkOk as u8);
        write_str(&mut buf, &self.name);
        write_str(&mut buf, &self.instruction);
        write_str(&mut buf, "");
        write_u32(&mut buf, self.prompts.len() as u32);
        for (prompt, echo) in &self.prompts {
            write_str(&mut buf, prompt);
            write_bool(&mut buf, *echo);
        }
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TernResult<Self> {
        let mut r = Reader::new(data);
        let kind = r.read_u8()?;
        if kind != MessageType::UserauthPkOk as u8 {
            return Err(TernError::Protocol(format!(
                "Invalid message type: expected 60 (SSH_MSG_USERAUTH_INFO_REQUEST), got {}",
                kind
            )));
        }
        let name = r.read_lossy()?;
        let instruction = r.read_lossy()?;
        let _language = r.read_string()?;
        let count = r.read_u32()? as usize;
        // Each prompt needs at least five bytes on the wire.
        if count > r.remaining() / 5 {
            return Err(TernError::Protocol(format!(
                "INFO_REQUEST claims {} prompts in {} bytes",
                count,
                r.remaining()
            )));
        }
        let mut prompts = Vec::with_capacity(count);
        for _ in 0..count {
            let prompt = r.read_lossy()?;
            let echo = r.read_bool()?;
            prompts.push((prompt, echo));
        }
        Ok(Self {
            name,
            instruction,
            prompts,
        })
    }
}

/// SSH_MSG_USERAUTH_INFO_RESPONSE message (RFC 4256 Section 3.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoResponse {
    /// One answer per prompt, in order
    pub responses: Vec<String>,
}

impl InfoResponse {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        write_u8(&mut buf, MessageType::UserauthInfoResponse as u8);
        write_u32(&mut buf, self.responses.len() as u32);
        for response in &self.responses {
            write_str(&mut buf, response);
        }
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TernResult<Self> {
        let mut r = Reader::new(data);
        let kind = r.read_u8()?;
        if kind != MessageType::UserauthInfoResponse as u8 {
            return Err(TernError::Protocol(format!(
                "Invalid message type: expected 61 (SSH_MSG_USERAUTH_INFO_RESPONSE), got {}",
                kind
            )));
        }
        let count = r.read_u32()? as usize;
        if count > r.remaining() / 4 {
            return Err(TernError::Protocol(format!(
                "INFO_RESPONSE claims {} answers in {} bytes",
                count,
                r.remaining()
            )));
        }
        let mut responses = Vec::with_capacity(count);
        for _ in 0..count {
            responses.push(r.read_lossy()?);
        }
        Ok(Self { responses })
    }
}

impl Drop for InfoResponse {
    fn drop(&mut self) {
        self.responses.iter_mut().for_each(Zeroize::zeroize);
    }
}

/// Constructs the data to be signed for public key authentication (RFC 4252 Section 7).
///
/// # Format
///
/// ```text
/// string    session identifier
/// byte      SSH_MSG_USERAUTH_REQUEST (50)
/// string    user name
/// string    service name
/// string    "publickey"
/// boolean   TRUE (has signature)
/// string    public key algorithm name
/// string    public key blob
/// ```
pub fn construct_signature_data(
    session_id: &[u8],
    user_name: &str,
    service_name: &str,
    algorithm: &str,
    public_key_blob: &[u8],
) -> Vec<u8> {
    let mut buf = BytesMut::new();
    write_string(&mut buf, session_id);
    write_u8(&mut buf, MessageType::UserauthRequest as u8);
    write_str(&mut buf, user_name);
    write_str(&mut buf, service_name);
    write_str(&mut buf, "publickey");
    write_bool(&mut buf, true);
    write_str(&mut buf, algorithm);
    write_string(&mut buf, public_key_blob);
    buf.to_vec()
}

/// One key held by an agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    /// Public key blob
    pub key_blob: Vec<u8>,
    /// Agent-side comment
    pub comment: String,
}

impl AgentIdentity {
    /// Key type named inside the blob.
    pub fn key_type(&self) -> String {
        Reader::new(&self.key_blob)
            .read_lossy()
            .unwrap_or_default()
    }
}

/// External key agent, for example a connection to `ssh-agent`.
#[async_trait]
pub trait Agent: Send {
    /// Lists the keys the agent holds.
    async fn identities(&mut self) -> TernResult<Vec<AgentIdentity>>;

    /// Signs `data` with the key matching `key_blob` and returns an SSH
    /// signature blob. `flags` carries [`SSH_AGENT_RSA_SHA2_256`] for RSA.
    async fn sign(&mut self, key_blob: &[u8], data: &[u8], flags: u32) -> TernResult<Vec<u8>>;
}

/// A credential to try during [`Authenticator::login`].
pub enum Credential<'a> {
    /// Password, falling back to keyboard-interactive
    Password(&'a str),
    /// Local private key
    PublicKey(&'a PrivateKey),
    /// Scripted keyboard-interactive: `(prompt prefix, answer)` pairs
    KeyboardInteractive(&'a [(String, String)]),
    /// Every identity an agent offers
    Agent(&'a mut dyn Agent),
}

impl Credential<'_> {
    /// Method name as sent on the wire.
    pub fn method(&self) -> &'static str {
        match self {
            Credential::Password(_) => "password",
            Credential::PublicKey(_) | Credential::Agent(_) => "publickey",
            Credential::KeyboardInteractive(_) => "keyboard-interactive",
        }
    }
}

impl std::fmt::Debug for Credential<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::Password(_) => f.write_str("Password(<redacted>)"),
            Credential::PublicKey(key) => f.debug_tuple("PublicKey").field(key).finish(),
            Credential::KeyboardInteractive(pairs) => {
                write!(f, "KeyboardInteractive({} answers)", pairs.len())
            }
            Credential::Agent(_) => f.write_str("Agent"),
        }
    }
}

/// Authentication progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// Nothing sent yet
    Unauthenticated,
    /// `ssh-userauth` accepted
    ServiceRequested,
    /// A method is in flight or was refused
    MethodAttempted,
    /// Server sent USERAUTH_SUCCESS
    Authenticated,
    /// Every supplied credential was refused
    Failed,
}

impl AuthState {
    /// State after the service request was accepted.
    pub fn on_service_accept(self) -> Self {
        match self {
            AuthState::Unauthenticated => AuthState::ServiceRequested,
            other => other,
        }
    }

    /// State after an attempt with the given result.
    pub fn on_attempt(self, success: bool) -> Self {
        match (self, success) {
            (AuthState::Authenticated, _) => AuthState::Authenticated,
            (_, true) => AuthState::Authenticated,
            (_, false) => AuthState::MethodAttempted,
        }
    }

    /// State after the credential list ran out.
    pub fn on_exhausted(self) -> Self {
        match self {
            AuthState::Authenticated => AuthState::Authenticated,
            _ => AuthState::Failed,
        }
    }
}

enum Reply {
    Success,
    Failure(AuthFailure),
    /// Message 60 (PK_OK, PASSWD_CHANGEREQ or INFO_REQUEST by context)
    Continue(Vec<u8>),
}

/// Drives user authentication over a [`Transport`].
#[derive(Debug)]
pub struct Authenticator {
    state: AuthState,
    banner: Vec<String>,
    allowed: Option<Vec<String>>,
}

impl Default for Authenticator {
    fn default() -> Self {
        Self::new()
    }
}

impl Authenticator {
    /// Fresh, unauthenticated state.
    pub fn new() -> Self {
        Self {
            state: AuthState::Unauthenticated,
            banner: Vec::new(),
            allowed: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> AuthState {
        self.state
    }

    /// Banner messages received so far.
    pub fn banner(&self) -> &[String] {
        &self.banner
    }

    /// Methods the server last said can continue, if known.
    pub fn allowed_methods(&self) -> Option<&[String]> {
        self.allowed.as_deref()
    }

    fn allows(&self, method: &str) -> bool {
        self.allowed
            .as_ref()
            .map_or(true, |m| m.iter().any(|a| a == method))
    }

    async fn request_service<S>(&mut self, transport: &mut Transport<S>) -> TernResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        if transport.lifecycle().contains(Lifecycle::LOGIN_REQ) {
            return Ok(());
        }
        let mut buf = BytesMut::new();
        write_u8(&mut buf, MessageType::ServiceRequest as u8);
        write_str(&mut buf, SERVICE_USERAUTH);
        transport.send(&buf).await?;

        loop {
            let reply = transport.recv().await?;
            match MessageType::from_u8(reply[0]) {
                Some(MessageType::ServiceAccept) => break,
                Some(MessageType::UserauthBanner) => self.record_banner(&reply)?,
                _ => {
                    return Err(TernError::Protocol(format!(
                        "Expected SERVICE_ACCEPT, got {}",
                        crate::ssh::message::describe(reply[0])
                    )))
                }
            }
        }
        transport.mark(Lifecycle::LOGIN_REQ);
        self.state = self.state.on_service_accept();
        Ok(())
    }

    fn record_banner(&mut self, payload: &[u8]) -> TernResult<()> {
        let banner = AuthBanner::from_bytes(payload)?;
        debug!(len = banner.message().len(), "Received authentication banner");
        self.banner.push(banner.message().to_string());
        Ok(())
    }

    async fn reply<S>(&mut self, transport: &mut Transport<S>) -> TernResult<Reply>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        loop {
            let payload = transport.recv().await?;
            match MessageType::from_u8(payload[0]) {
                Some(MessageType::UserauthBanner) => self.record_banner(&payload)?,
                Some(MessageType::UserauthSuccess) => return Ok(Reply::Success),
                Some(MessageType::UserauthFailure) => {
                    let failure = AuthFailure::from_bytes(&payload)?;
                    self.allowed = Some(failure.methods_can_continue().to_vec());
                    return Ok(Reply::Failure(failure));
                }
                Some(MessageType::UserauthPkOk) => return Ok(Reply::Continue(payload)),
                _ => {
                    return Err(TernError::Protocol(format!(
                        "Unexpected {} during authentication",
                        crate::ssh::message::describe(payload[0])
                    )))
                }
            }
        }
    }

    fn finish(&mut self, user: &str, method: &str, reply: &Reply) -> bool {
        let success = matches!(reply, Reply::Success);
        let outcome = match reply {
            Reply::Success => "success",
            Reply::Failure(f) if f.partial_success() => "partial",
            Reply::Failure(_) => "failure",
            Reply::Continue(_) => "continue",
        };
        log_auth_attempt(user, method, outcome);
        self.state = self.state.on_attempt(success);
        success
    }

    /// Sends a "none" request. Returns the allowed methods, or an empty
    /// list if the server let us in without credentials.
    pub async fn query_methods<S>(
        &mut self,
        transport: &mut Transport<S>,
        user: &str,
    ) -> TernResult<Vec<String>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        self.request_service(transport).await?;
        let request = AuthRequest::new(user, SERVICE_CONNECTION, AuthMethod::None);
        transport.send(&request.to_bytes()).await?;
        let reply = self.reply(transport).await?;
        if self.finish(user, "none", &reply) {
            transport.mark(Lifecycle::LOGIN);
            return Ok(Vec::new());
        }
        match reply {
            Reply::Failure(f) => Ok(f.methods_can_continue().to_vec()),
            _ => Err(TernError::Protocol(
                "Unexpected reply to \"none\" authentication".to_string(),
            )),
        }
    }

    /// Password authentication, falling back to keyboard-interactive.
    pub async fn password<S>(
        &mut self,
        transport: &mut Transport<S>,
        user: &str,
        password: &str,
    ) -> TernResult<bool>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        if self.allows("password") {
            let request = AuthRequest::new(
                user,
                SERVICE_CONNECTION,
                AuthMethod::Password(password.to_string()),
            );
            transport.send(&request.to_bytes()).await?;
            let reply = self.reply(transport).await?;
            if let Reply::Continue(_) = reply {
                debug!("Server requires a password change, treating as failure");
            }
            if self.finish(user, "password", &reply) {
                return Ok(true);
            }
        }

        if self.allows("keyboard-interactive") && self.allowed.is_some() {
            debug!("Falling back to keyboard-interactive with the password");
            return self
                .keyboard_interactive(transport, user, &|_: &str| password.to_string())
                .await;
        }
        Ok(false)
    }

    /// Keyboard-interactive authentication. `answer` maps each prompt to a
    /// response.
    pub async fn keyboard_interactive<S>(
        &mut self,
        transport: &mut Transport<S>,
        user: &str,
        answer: &(dyn Fn(&str) -> String + Send + Sync),
    ) -> TernResult<bool>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let request = AuthRequest::new(
            user,
            SERVICE_CONNECTION,
            AuthMethod::KeyboardInteractive {
                submethods: String::new(),
            },
        );
        transport.send(&request.to_bytes()).await?;

        for _ in 0..MAX_INFO_ROUNDS {
            let reply = self.reply(transport).await?;
            let payload = match reply {
                Reply::Continue(payload) => payload,
                other => return Ok(self.finish(user, "keyboard-interactive", &other)),
            };
            let info = InfoRequest::from_bytes(&payload)?;
            debug!(
                name = %info.name,
                prompts = info.prompts.len(),
                "Keyboard-interactive prompts"
            );
            let response = InfoResponse {
                responses: info.prompts.iter().map(|(p, _)| answer(p)).collect(),
            };
            transport.send(&response.to_bytes()).await?;
        }
        Err(TernError::Protocol(
            "Too many keyboard-interactive rounds".to_string(),
        ))
    }

    /// Public key authentication with a local key.
    pub async fn public_key<S>(
        &mut self,
        transport: &mut Transport<S>,
        user: &str,
        key: &PrivateKey,
    ) -> TernResult<bool>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let algorithm = key.algorithm();
        let blob = key.public_blob();
        if !self.offer_key(transport, user, algorithm, &blob).await? {
            return Ok(false);
        }
        let data = construct_signature_data(
            transport.session_id(),
            user,
            SERVICE_CONNECTION,
            algorithm,
            &blob,
        );
        let signature = key.sign(&data)?;
        self.signed_request(transport, user, algorithm, blob, signature)
            .await
    }

    /// Tries each identity an agent holds.
    pub async fn agent<S>(
        &mut self,
        transport: &mut Transport<S>,
        user: &str,
        agent: &mut dyn Agent,
    ) -> TernResult<bool>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        for identity in agent.identities().await? {
            let key_type = identity.key_type();
            let (algorithm, flags) = if key_type == "ssh-rsa" {
                ("rsa-sha2-256".to_string(), SSH_AGENT_RSA_SHA2_256)
            } else {
                (key_type, 0)
            };
            debug!(
                algorithm = %algorithm,
                comment = %identity.comment,
                "Trying agent identity"
            );
            if !self
                .offer_key(transport, user, &algorithm, &identity.key_blob)
                .await?
            {
                continue;
            }
            let data = construct_signature_data(
                transport.session_id(),
                user,
                SERVICE_CONNECTION,
                &algorithm,
                &identity.key_blob,
            );
            let signature = agent.sign(&identity.key_blob, &data, flags).await?;
            if self
                .signed_request(transport, user, &algorithm, identity.key_blob, signature)
                .await?
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn offer_key<S>(
        &mut self,
        transport: &mut Transport<S>,
        user: &str,
        algorithm: &str,
        blob: &[u8],
    ) -> TernResult<bool>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let query = AuthRequest::new(
            user,
            SERVICE_CONNECTION,
            AuthMethod::PublicKey {
                algorithm: algorithm.to_string(),
                public_key: blob.to_vec(),
                signature: None,
            },
        );
        transport.send(&query.to_bytes()).await?;
        match self.reply(transport).await? {
            Reply::Continue(payload) => {
                let ok = AuthPkOk::from_bytes(&payload)?;
                log_auth_attempt(user, "publickey", "pk-ok");
                Ok(ok.public_key() == blob)
            }
            other => Ok(self.finish(user, "publickey", &other)),
        }
    }

    async fn signed_request<S>(
        &mut self,
        transport: &mut Transport<S>,
        user: &str,
        algorithm: &str,
        blob: Vec<u8>,
        signature: Vec<u8>,
    ) -> TernResult<bool>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let request = AuthRequest::new(
            user,
            SERVICE_CONNECTION,
            AuthMethod::PublicKey {
                algorithm: algorithm.to_string(),
                public_key: blob,
                signature: Some(signature),
            },
        );
        transport.send(&request.to_bytes()).await?;
        let reply = self.reply(transport).await?;
        Ok(self.finish(user, "publickey", &reply))
    }

    /// Tries every credential in order until one succeeds.
    ///
    /// # Errors
    ///
    /// [`TernError::Auth`] when all credentials are refused. The session
    /// remains usable.
    pub async fn login<S>(
        &mut self,
        transport: &mut Transport<S>,
        user: &str,
        credentials: &mut [Credential<'_>],
    ) -> TernResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        if transport.lifecycle().contains(Lifecycle::LOGIN) {
            return Ok(());
        }
        self.request_service(transport).await?;

        for credential in credentials.iter_mut() {
            let method = credential.method();
            let fallback_ok = method == "password" && self.allows("keyboard-interactive");
            if !self.allows(method) && !fallback_ok {
                debug!(method = method, "Skipping method the server does not allow");
                continue;
            }
            let success = match credential {
                Credential::Password(password) => self.password(transport, user, password).await?,
                Credential::PublicKey(key) => self.public_key(transport, user, key).await?,
                Credential::KeyboardInteractive(pairs) => {
                    let pairs: &[(String, String)] = pairs;
                    let answer = |prompt: &str| {
                        pairs
                            .iter()
                            .find(|(prefix, _)| prompt.trim_start().starts_with(prefix.as_str()))
                            .map(|(_, a)| a.clone())
                            .unwrap_or_default()
                    };
                    self.keyboard_interactive(transport, user, &answer).await?
                }
                Credential::Agent(agent) => self.agent(transport, user, &mut **agent).await?,
            };
            if success {
                transport.mark(Lifecycle::LOGIN);
                return Ok(());
            }
        }

        self.state = self.state.on_exhausted();
        Err(TernError::Auth(format!(
            "All authentication methods failed for user '{}' (server allows: {})",
            user,
            self.allowed
                .as_ref()
                .map(|m| m.join(","))
                .unwrap_or_else(|| "unknown".to_string())
        )))
    }
}
