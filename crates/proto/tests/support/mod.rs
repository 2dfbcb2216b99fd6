//! Scripted in-process SSH server for the integration tests.
//!
//! The server speaks the real wire protocol over a `tokio::io::duplex`
//! pipe and is assembled from the crate's own codec pieces. It knows a
//! handful of exec commands, a line-echo shell, an `echo` subsystem, SCP
//! in both directions and an SFTP v3 server backed by [`MemFs`].
//!
//! [`ServerOptions`] can make the server misbehave in a few specific ways,
//! and [`ServerLog`] records what the client did.

#![allow(dead_code)]

use bytes::BytesMut;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tern_platform::{TernError, TernResult};
use tern_proto::ssh::auth::{
    construct_signature_data, AuthBanner, AuthFailure, AuthMethod, AuthPkOk, AuthRequest,
    InfoRequest, InfoResponse,
};
use tern_proto::ssh::client::{SshClient, SshClientConfig};
use tern_proto::ssh::connection::{
    ChannelClose, ChannelData, ChannelEof, ChannelExtendedData, ChannelFailure, ChannelOpen,
    ChannelOpenConfirmation, ChannelOpenFailure, ChannelOpenFailureReason, ChannelRequest,
    ChannelRequestType, ChannelSuccess, ChannelType, ChannelWindowAdjust, GlobalRequest,
};
use tern_proto::ssh::crypto::{CipherAlgorithm, Direction, MacKey};
use tern_proto::ssh::hostkey::{Ed25519HostKey, HostKey, HostKeyAlgorithm, PublicHostKey};
use tern_proto::ssh::kex::{negotiate, AlgorithmPreferences, KexAlgorithm, KexInit, KexMethod, NewKeys};
use tern_proto::ssh::kex_dh::{exchange_hash, Curve25519Exchange, ExchangeValues, HashTranscript, SessionKeys};
use tern_proto::ssh::message::MessageType;
use tern_proto::ssh::packet::{OpeningState, SealingState};
use tern_proto::ssh::scp::parse_control_line;
use tern_proto::ssh::sftp::message::{frame_request, PacketBuffer, SftpMessageType};
use tern_proto::ssh::sftp::types::{FileAttributes, OpenFlags, StatusCode};
use tern_proto::ssh::wire::{write_str, write_string, write_u32, write_u8, Reader};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tracing::debug;

/// Identification line of the scripted server.
pub const SERVER_ID: &str = "SSH-2.0-TernTest_1.0";

/// Account every test logs in as.
pub const USER: &str = "user";

/// Password the server accepts.
pub const PASSWORD: &str = "secret";

/// Home directory of [`USER`].
pub const HOME: &str = "/home/user";

/// Stat on this path gets a reply with broken SFTP framing.
pub const GARBLED_PATH: &str = "/garbled";

const WINDOW: u32 = 2 * 1024 * 1024;
const MAX_PACKET: u32 = 32 * 1024;
const READDIR_PAGE: usize = 50;
const FIXED_TIME: u32 = 1_700_000_000;

/// Installs a test-friendly tracing subscriber once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Host key of the scripted server.
pub fn host_key() -> Ed25519HostKey {
    Ed25519HostKey::from_bytes(&[42u8; 32]).expect("fixed seed is a valid key")
}

/// Knobs for one server instance.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Password accepted for [`USER`]
    pub password: String,
    /// Public key blob accepted for [`USER`]
    pub authorized_key: Option<Vec<u8>>,
    /// Offer keyboard-interactive
    pub keyboard_interactive: bool,
    /// Lines written before the identification string
    pub pre_banner: Vec<String>,
    /// USERAUTH_BANNER text sent after the service is accepted
    pub banner: Option<String>,
    /// Highest SFTP version the server speaks
    pub sftp_version: u32,
    /// Cap on bytes returned per SSH_FXP_READ
    pub max_read: Option<u32>,
    /// Send a `T` line before each file in scp source mode
    pub scp_times: bool,
    /// Answer USERAUTH_REQUEST with a message that has no place there
    pub garbled_auth: bool,
    /// Ciphers offered in KEXINIT instead of the defaults
    pub ciphers: Option<Vec<CipherAlgorithm>>,
    /// Receive window granted on each channel. Refilled only once it is
    /// used up, so a client writing more than this must wait.
    pub window: u32,
    /// Hold back replies to the first SSH_FXP_READ at this offset
    pub stall_read_at: Option<u64>,
    /// How long a held READ reply waits
    pub stall: Duration,
    /// What the server saw, readable from the test
    pub log: Arc<Mutex<ServerLog>>,
}

/// Client behaviour recorded by the server.
#[derive(Debug, Clone, Default)]
pub struct ServerLog {
    /// DISCONNECT messages received, as (reason, description)
    pub disconnects: Vec<(u32, String)>,
    /// Channel data packets larger than the remaining window
    pub window_violations: u32,
    /// Times a channel window was used up before being refilled
    pub window_stalls: u32,
}

impl ServerOptions {
    /// Snapshot of the server's log.
    pub fn seen(&self) -> ServerLog {
        self.log.lock().expect("log lock").clone()
    }

    fn record(&self, f: impl FnOnce(&mut ServerLog)) {
        f(&mut self.log.lock().expect("log lock"));
    }
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            password: PASSWORD.to_string(),
            authorized_key: None,
            keyboard_interactive: true,
            pre_banner: Vec::new(),
            banner: None,
            sftp_version: 3,
            max_read: None,
            scp_times: false,
            garbled_auth: false,
            ciphers: None,
            window: WINDOW,
            stall_read_at: None,
            stall: Duration::ZERO,
            log: Arc::new(Mutex::new(ServerLog::default())),
        }
    }
}

/// Shared view of the server's file system.
pub type SharedFs = Arc<Mutex<MemFs>>;

/// Starts a server and returns the client end, not yet authenticated.
pub async fn connect_with(
    options: ServerOptions,
    config: SshClientConfig,
) -> TernResult<(SshClient<DuplexStream>, SharedFs)> {
    init_tracing();
    let (client_end, server_end) = tokio::io::duplex(1 << 20);
    let fs: SharedFs = Arc::new(Mutex::new(MemFs::new()));
    let server = ServerConn::new(server_end, options, fs.clone());
    tokio::spawn(async move {
        if let Err(e) = server.run().await {
            debug!(error = %e, "test server stopped");
        }
    });
    let client = SshClient::handshake(client_end, config).await?;
    Ok((client, fs))
}

/// Starts a default server and logs in with the password.
pub async fn connect() -> (SshClient<DuplexStream>, SharedFs) {
    let (mut client, fs) = connect_with(ServerOptions::default(), SshClientConfig::default())
        .await
        .expect("handshake with the test server");
    client
        .login_password(USER, PASSWORD)
        .await
        .expect("password login");
    (client, fs)
}

// ---------------------------------------------------------------------------
// In-memory file system
// ---------------------------------------------------------------------------

/// Kind of a file system node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    /// Regular file with its contents
    File(Vec<u8>),
    /// Directory
    Dir,
    /// Symbolic link with its target
    Symlink(String),
}

/// One node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// What the node is
    pub kind: NodeKind,
    /// Permission bits
    pub mode: u32,
    /// Owner
    pub uid: u32,
    /// Group
    pub gid: u32,
    /// Access time
    pub atime: u32,
    /// Modification time
    pub mtime: u32,
}

impl Node {
    fn new(kind: NodeKind, mode: u32) -> Self {
        Self {
            kind,
            mode,
            uid: 1000,
            gid: 1000,
            atime: FIXED_TIME,
            mtime: FIXED_TIME,
        }
    }

    fn size(&self) -> u64 {
        match &self.kind {
            NodeKind::File(data) => data.len() as u64,
            NodeKind::Dir => 4096,
            NodeKind::Symlink(target) => target.len() as u64,
        }
    }

    fn type_bits(&self) -> u32 {
        match self.kind {
            NodeKind::File(_) => 0o100000,
            NodeKind::Dir => 0o040000,
            NodeKind::Symlink(_) => 0o120000,
        }
    }

    fn attrs(&self) -> FileAttributes {
        FileAttributes {
            size: Some(self.size()),
            uid: Some(self.uid),
            gid: Some(self.gid),
            permissions: Some(self.type_bits() | self.mode),
            atime: Some(self.atime),
            mtime: Some(self.mtime),
            ..Default::default()
        }
    }

    fn longname(&self, name: &str) -> String {
        let kind = match self.kind {
            NodeKind::File(_) => '-',
            NodeKind::Dir => 'd',
            NodeKind::Symlink(_) => 'l',
        };
        let mut rwx = String::with_capacity(9);
        for shift in [6u32, 3, 0] {
            let bits = (self.mode >> shift) & 7;
            rwx.push(if bits & 4 != 0 { 'r' } else { '-' });
            rwx.push(if bits & 2 != 0 { 'w' } else { '-' });
            rwx.push(if bits & 1 != 0 { 'x' } else { '-' });
        }
        format!(
            "{}{}    1 user     user     {:>8} Nov 14 22:13 {}",
            kind,
            rwx,
            self.size(),
            name
        )
    }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(pos) => &path[..pos],
    }
}

fn join(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Flat map of absolute paths to nodes.
#[derive(Debug, Clone)]
pub struct MemFs {
    nodes: BTreeMap<String, Node>,
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

impl MemFs {
    /// A tree holding `/`, `/home` and the user's home directory.
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        for dir in ["/", "/home", HOME, "/tmp"] {
            nodes.insert(dir.to_string(), Node::new(NodeKind::Dir, 0o755));
        }
        Self { nodes }
    }

    /// Resolves `.`, `..` and symlinks. The last component is followed
    /// only when `follow_last` is set.
    pub fn canonical(&self, path: &str, follow_last: bool) -> String {
        let absolute = if path.starts_with('/') {
            path.to_string()
        } else {
            join(HOME, path)
        };
        let mut queue: VecDeque<String> = absolute
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        let mut current: Vec<String> = Vec::new();
        let mut hops = 0;
        while let Some(segment) = queue.pop_front() {
            match segment.as_str() {
                "." => continue,
                ".." => {
                    current.pop();
                    continue;
                }
                _ => current.push(segment),
            }
            let here = format!("/{}", current.join("/"));
            if let Some(Node {
                kind: NodeKind::Symlink(target),
                ..
            }) = self.nodes.get(&here)
            {
                if queue.is_empty() && !follow_last {
                    break;
                }
                hops += 1;
                if hops > 16 {
                    break;
                }
                current.pop();
                if target.starts_with('/') {
                    current.clear();
                }
                let mut expanded: VecDeque<String> = target
                    .split('/')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
                expanded.extend(queue.drain(..));
                queue = expanded;
            }
        }
        format!("/{}", current.join("/"))
    }

    /// Node at an exact canonical path.
    pub fn node(&self, path: &str) -> Option<&Node> {
        self.nodes.get(path)
    }

    /// Node at `path`, following symlinks when asked.
    pub fn lookup(&self, path: &str, follow: bool) -> Option<(String, &Node)> {
        let canonical = self.canonical(path, follow);
        self.nodes.get(&canonical).map(|node| (canonical, node))
    }

    /// Contents of the file at `path`.
    pub fn read(&self, path: &str) -> Option<Vec<u8>> {
        match self.lookup(path, true) {
            Some((_, Node { kind: NodeKind::File(data), .. })) => Some(data.clone()),
            _ => None,
        }
    }

    /// Whether anything (including a dangling link) exists at `path`.
    pub fn exists(&self, path: &str) -> bool {
        self.lookup(path, false).is_some()
    }

    fn parent_is_dir(&self, canonical: &str) -> bool {
        matches!(
            self.nodes.get(parent_of(canonical)),
            Some(Node { kind: NodeKind::Dir, .. })
        )
    }

    /// Writes a whole file, creating it with `mode` when absent.
    pub fn write(&mut self, path: &str, data: &[u8], mode: u32) -> bool {
        let canonical = self.canonical(path, true);
        if !self.parent_is_dir(&canonical) {
            return false;
        }
        match self.nodes.get_mut(&canonical) {
            Some(Node { kind: NodeKind::Dir, .. }) => false,
            Some(node) => {
                node.kind = NodeKind::File(data.to_vec());
                true
            }
            None => {
                self.nodes
                    .insert(canonical, Node::new(NodeKind::File(data.to_vec()), mode));
                true
            }
        }
    }

    /// Creates a directory.
    pub fn mkdir(&mut self, path: &str) -> bool {
        let canonical = self.canonical(path, false);
        if self.nodes.contains_key(&canonical) || !self.parent_is_dir(&canonical) {
            return false;
        }
        self.nodes.insert(canonical, Node::new(NodeKind::Dir, 0o755));
        true
    }

    /// Creates a symbolic link at `link` pointing at `target`.
    pub fn symlink(&mut self, target: &str, link: &str) -> bool {
        let canonical = self.canonical(link, false);
        if self.nodes.contains_key(&canonical) || !self.parent_is_dir(&canonical) {
            return false;
        }
        self.nodes.insert(
            canonical,
            Node::new(NodeKind::Symlink(target.to_string()), 0o777),
        );
        true
    }

    fn node_mut(&mut self, canonical: &str) -> Option<&mut Node> {
        self.nodes.get_mut(canonical)
    }

    /// Direct children of a canonical directory path, sorted by name.
    pub fn children(&self, dir: &str) -> Vec<(String, Node)> {
        let prefix = if dir == "/" {
            "/".to_string()
        } else {
            format!("{}/", dir)
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter(|(key, _)| key.len() > prefix.len() && !key[prefix.len()..].contains('/'))
            .map(|(key, node)| (key[prefix.len()..].to_string(), node.clone()))
            .collect()
    }

    fn remove(&mut self, canonical: &str) -> Option<Node> {
        self.nodes.remove(canonical)
    }

    fn rename(&mut self, from: &str, to: &str) {
        let nested = format!("{}/", from);
        let moved: Vec<String> = self
            .nodes
            .keys()
            .filter(|key| key.as_str() == from || key.starts_with(&nested))
            .cloned()
            .collect();
        for key in moved {
            if let Some(node) = self.nodes.remove(&key) {
                let renamed = format!("{}{}", to, &key[from.len()..]);
                self.nodes.insert(renamed, node);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// SFTP
// ---------------------------------------------------------------------------

enum Handle {
    File { path: String, append: bool },
    Dir { entries: Vec<(String, Node)>, pos: usize },
}

struct SftpServer {
    inbound: PacketBuffer,
    handles: HashMap<Vec<u8>, Handle>,
    next_handle: u32,
    stalled: bool,
    stall_pending: bool,
}

fn status(id: u32, code: StatusCode) -> Vec<u8> {
    frame_request(SftpMessageType::Status, id, |b| {
        write_u32(b, code as u32);
        write_str(b, code.message());
        write_str(b, "en");
    })
}

fn name_reply(id: u32, entries: &[(String, String, FileAttributes)]) -> Vec<u8> {
    frame_request(SftpMessageType::Name, id, |b| {
        write_u32(b, entries.len() as u32);
        for (filename, longname, attrs) in entries {
            write_str(b, filename);
            write_str(b, longname);
            attrs.encode(b);
        }
    })
}

impl SftpServer {
    fn new() -> Self {
        Self {
            inbound: PacketBuffer::new(),
            handles: HashMap::new(),
            next_handle: 0,
            stalled: false,
            stall_pending: false,
        }
    }

    fn on_data(&mut self, data: &[u8], fs: &mut MemFs, options: &ServerOptions) -> TernResult<Vec<u8>> {
        self.inbound.push(data);
        let mut out = Vec::new();
        while let Some(body) = self.inbound.next_packet()? {
            out.extend_from_slice(&self.handle(&body, fs, options)?);
        }
        Ok(out)
    }

    fn add_handle(&mut self, handle: Handle) -> Vec<u8> {
        self.next_handle += 1;
        let key = format!("handle-{}", self.next_handle).into_bytes();
        self.handles.insert(key.clone(), handle);
        key
    }

    fn handle(&mut self, body: &[u8], fs: &mut MemFs, options: &ServerOptions) -> TernResult<Vec<u8>> {
        let mut r = Reader::new(body);
        let kind = r.read_u8()?;
        if kind == SftpMessageType::Init as u8 {
            let version = r.read_u32()?.min(options.sftp_version);
            let mut buf = BytesMut::new();
            write_u32(&mut buf, 0);
            write_u8(&mut buf, SftpMessageType::Version as u8);
            write_u32(&mut buf, version);
            write_str(&mut buf, "posix-rename@openssh.com");
            write_str(&mut buf, "1");
            let len = (buf.len() - 4) as u32;
            buf[..4].copy_from_slice(&len.to_be_bytes());
            return Ok(buf.to_vec());
        }

        let id = r.read_u32()?;
        let Some(kind) = SftpMessageType::from_u8(kind) else {
            return Ok(status(id, StatusCode::OpUnsupported));
        };
        let reply = match kind {
            SftpMessageType::Open => {
                let path = r.read_lossy()?;
                let flags = OpenFlags::from_bits_truncate(r.read_u32()?);
                let attrs = FileAttributes::decode(&mut r)?;
                let canonical = fs.canonical(&path, true);
                let parent_ok = fs.parent_is_dir(&canonical);
                match fs.node_mut(&canonical) {
                    Some(Node { kind: NodeKind::Dir, .. }) => status(id, StatusCode::Failure),
                    Some(_) if flags.contains(OpenFlags::CREAT | OpenFlags::EXCL) => {
                        status(id, StatusCode::Failure)
                    }
                    Some(node) => {
                        if flags.contains(OpenFlags::TRUNC) {
                            node.kind = NodeKind::File(Vec::new());
                        }
                        let handle = self.add_handle(Handle::File {
                            path: canonical,
                            append: flags.contains(OpenFlags::APPEND),
                        });
                        frame_request(SftpMessageType::Handle, id, |b| write_string(b, &handle))
                    }
                    None if !flags.contains(OpenFlags::CREAT) => status(id, StatusCode::NoSuchFile),
                    None if !parent_ok => status(id, StatusCode::NoSuchFile),
                    None => {
                        let mut node = Node::new(
                            NodeKind::File(Vec::new()),
                            attrs.permissions.map(|p| p & 0o7777).unwrap_or(0o644),
                        );
                        if let (Some(atime), Some(mtime)) = (attrs.atime, attrs.mtime) {
                            node.atime = atime;
                            node.mtime = mtime;
                        }
                        fs.nodes.insert(canonical.clone(), node);
                        let handle = self.add_handle(Handle::File {
                            path: canonical,
                            append: flags.contains(OpenFlags::APPEND),
                        });
                        frame_request(SftpMessageType::Handle, id, |b| write_string(b, &handle))
                    }
                }
            }
            SftpMessageType::Close => {
                let handle = r.read_string()?;
                match self.handles.remove(handle) {
                    Some(_) => status(id, StatusCode::Ok),
                    None => status(id, StatusCode::Failure),
                }
            }
            SftpMessageType::Read => {
                let handle = r.read_string()?;
                let offset = r.read_u64()?;
                let mut len = r.read_u32()? as u64;
                if options.stall_read_at == Some(offset) && !self.stalled {
                    self.stalled = true;
                    self.stall_pending = true;
                }
                if let Some(cap) = options.max_read {
                    len = len.min(cap as u64);
                }
                match self.handles.get(handle) {
                    Some(Handle::File { path, .. }) => match fs.node(path) {
                        Some(Node { kind: NodeKind::File(data), .. }) => {
                            let size = data.len() as u64;
                            if offset >= size {
                                status(id, StatusCode::Eof)
                            } else {
                                let end = (offset + len).min(size);
                                let chunk = &data[offset as usize..end as usize];
                                frame_request(SftpMessageType::Data, id, |b| write_string(b, chunk))
                            }
                        }
                        _ => status(id, StatusCode::NoSuchFile),
                    },
                    _ => status(id, StatusCode::Failure),
                }
            }
            SftpMessageType::Write => {
                let handle = r.read_string()?;
                let offset = r.read_u64()? as usize;
                let data = r.read_string()?;
                match self.handles.get(handle) {
                    Some(Handle::File { path, append }) => match fs.node_mut(path) {
                        Some(Node {
                            kind: NodeKind::File(contents),
                            ..
                        }) => {
                            if *append {
                                contents.extend_from_slice(data);
                            } else {
                                let end = offset + data.len();
                                if contents.len() < end {
                                    contents.resize(end, 0);
                                }
                                contents[offset..end].copy_from_slice(data);
                            }
                            status(id, StatusCode::Ok)
                        }
                        _ => status(id, StatusCode::NoSuchFile),
                    },
                    _ => status(id, StatusCode::Failure),
                }
            }
            SftpMessageType::LStat | SftpMessageType::Stat => {
                let path = r.read_lossy()?;
                if path == GARBLED_PATH {
                    // Zero-length frame
                    return Ok(vec![0; 4]);
                }
                let follow = kind == SftpMessageType::Stat;
                match fs.lookup(&path, follow) {
                    Some((_, node)) => {
                        let attrs = node.attrs();
                        frame_request(SftpMessageType::Attrs, id, |b| attrs.encode(b))
                    }
                    None => status(id, StatusCode::NoSuchFile),
                }
            }
            SftpMessageType::SetStat => {
                let path = r.read_lossy()?;
                let attrs = FileAttributes::decode(&mut r)?;
                let canonical = fs.canonical(&path, true);
                match fs.node_mut(&canonical) {
                    Some(node) => {
                        if let Some(size) = attrs.size {
                            match &mut node.kind {
                                NodeKind::File(data) => data.resize(size as usize, 0),
                                _ => return Ok(status(id, StatusCode::Failure)),
                            }
                        }
                        if let Some(permissions) = attrs.permissions {
                            node.mode = permissions & 0o7777;
                        }
                        if let Some(uid) = attrs.uid {
                            node.uid = uid;
                        }
                        if let Some(gid) = attrs.gid {
                            node.gid = gid;
                        }
                        if let (Some(atime), Some(mtime)) = (attrs.atime, attrs.mtime) {
                            node.atime = atime;
                            node.mtime = mtime;
                        }
                        status(id, StatusCode::Ok)
                    }
                    None => status(id, StatusCode::NoSuchFile),
                }
            }
            SftpMessageType::OpenDir => {
                let path = r.read_lossy()?;
                match fs.lookup(&path, true) {
                    Some((canonical, Node { kind: NodeKind::Dir, .. })) => {
                        let mut entries = vec![
                            (".".to_string(), Node::new(NodeKind::Dir, 0o755)),
                            ("..".to_string(), Node::new(NodeKind::Dir, 0o755)),
                        ];
                        entries.extend(fs.children(&canonical));
                        let handle = self.add_handle(Handle::Dir { entries, pos: 0 });
                        frame_request(SftpMessageType::Handle, id, |b| write_string(b, &handle))
                    }
                    Some(_) => status(id, StatusCode::Failure),
                    None => status(id, StatusCode::NoSuchFile),
                }
            }
            SftpMessageType::ReadDir => {
                let handle = r.read_string()?;
                match self.handles.get_mut(handle) {
                    Some(Handle::Dir { entries, pos }) => {
                        if *pos >= entries.len() {
                            status(id, StatusCode::Eof)
                        } else {
                            let end = (*pos + READDIR_PAGE).min(entries.len());
                            let page: Vec<(String, String, FileAttributes)> = entries[*pos..end]
                                .iter()
                                .map(|(name, node)| (name.clone(), node.longname(name), node.attrs()))
                                .collect();
                            *pos = end;
                            name_reply(id, &page)
                        }
                    }
                    _ => status(id, StatusCode::Failure),
                }
            }
            SftpMessageType::Remove => {
                let path = r.read_lossy()?;
                let canonical = fs.canonical(&path, false);
                match fs.node(&canonical) {
                    Some(Node { kind: NodeKind::Dir, .. }) => status(id, StatusCode::Failure),
                    Some(_) => {
                        fs.remove(&canonical);
                        status(id, StatusCode::Ok)
                    }
                    None => status(id, StatusCode::NoSuchFile),
                }
            }
            SftpMessageType::MkDir => {
                let path = r.read_lossy()?;
                let attrs = FileAttributes::decode(&mut r)?;
                let canonical = fs.canonical(&path, false);
                if fs.node(&canonical).is_some() {
                    status(id, StatusCode::Failure)
                } else if !fs.parent_is_dir(&canonical) {
                    status(id, StatusCode::NoSuchFile)
                } else {
                    let mode = attrs.permissions.map(|p| p & 0o7777).unwrap_or(0o755);
                    fs.nodes.insert(canonical, Node::new(NodeKind::Dir, mode));
                    status(id, StatusCode::Ok)
                }
            }
            SftpMessageType::RmDir => {
                let path = r.read_lossy()?;
                let canonical = fs.canonical(&path, false);
                match fs.node(&canonical) {
                    Some(Node { kind: NodeKind::Dir, .. }) if fs.children(&canonical).is_empty() => {
                        fs.remove(&canonical);
                        status(id, StatusCode::Ok)
                    }
                    Some(_) => status(id, StatusCode::Failure),
                    None => status(id, StatusCode::NoSuchFile),
                }
            }
            SftpMessageType::RealPath => {
                let path = r.read_lossy()?;
                let canonical = fs.canonical(&path, true);
                let attrs = FileAttributes::new();
                name_reply(id, &[(canonical.clone(), canonical, attrs)])
            }
            SftpMessageType::Rename => {
                let from = fs.canonical(&r.read_lossy()?, false);
                let to = fs.canonical(&r.read_lossy()?, false);
                if fs.node(&from).is_none() {
                    status(id, StatusCode::NoSuchFile)
                } else if fs.node(&to).is_some() || !fs.parent_is_dir(&to) {
                    status(id, StatusCode::Failure)
                } else {
                    fs.rename(&from, &to);
                    status(id, StatusCode::Ok)
                }
            }
            SftpMessageType::ReadLink if options.sftp_version >= 3 => {
                let path = r.read_lossy()?;
                match fs.lookup(&path, false) {
                    Some((_, Node { kind: NodeKind::Symlink(target), .. })) => {
                        let target = target.clone();
                        name_reply(id, &[(target.clone(), target, FileAttributes::new())])
                    }
                    Some(_) => status(id, StatusCode::Failure),
                    None => status(id, StatusCode::NoSuchFile),
                }
            }
            SftpMessageType::Symlink if options.sftp_version >= 3 => {
                // OpenSSH order: target first, then the link path
                let target = r.read_lossy()?;
                let link = r.read_lossy()?;
                if fs.symlink(&target, &link) {
                    status(id, StatusCode::Ok)
                } else {
                    status(id, StatusCode::Failure)
                }
            }
            _ => status(id, StatusCode::OpUnsupported),
        };
        Ok(reply)
    }
}

// ---------------------------------------------------------------------------
// Channel programs
// ---------------------------------------------------------------------------

/// Side effects a program asks the connection to perform, in order.
enum Out {
    Data(Vec<u8>),
    Stderr(Vec<u8>),
    Exit(u32),
    Signal(String),
    Eof,
    Close,
    CorruptData(Vec<u8>),
}

fn finish(code: u32) -> Vec<Out> {
    vec![Out::Exit(code), Out::Eof, Out::Close]
}

enum SourceStage {
    Start,
    TimesSent,
    ControlSent,
    DataSent,
    Done,
}

enum Program {
    Idle,
    Silent,
    Cat,
    Shell { line: Vec<u8> },
    Echo,
    Sftp(Box<SftpServer>),
    ScpSink {
        target: String,
        buf: Vec<u8>,
        pending: Option<(u32, usize, String)>,
    },
    ScpSource { path: String, stage: SourceStage },
}

/// Undoes the single-quote escaping produced by `shell_quote`.
fn unquote(arg: &str) -> String {
    let mut out = String::new();
    let mut quoted = false;
    let mut chars = arg.chars();
    while let Some(c) = chars.next() {
        match c {
            '\'' => quoted = !quoted,
            '\\' if !quoted => {
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            }
            _ => out.push(c),
        }
    }
    out
}

fn start_exec(command: &str) -> (Program, Vec<Out>) {
    if let Some(rest) = command.strip_prefix("echo ") {
        let mut outs = vec![Out::Data(format!("{}\n", rest).into_bytes())];
        outs.extend(finish(0));
        return (Program::Idle, outs);
    }
    if let Some(count) = command.strip_prefix("bytes ") {
        let count: usize = count.trim().parse().unwrap_or(0);
        let mut outs = vec![Out::Data(vec![b'x'; count])];
        outs.extend(finish(0));
        return (Program::Idle, outs);
    }
    if let Some(target) = command.strip_prefix("scp -t ") {
        return (
            Program::ScpSink {
                target: unquote(target),
                buf: Vec::new(),
                pending: None,
            },
            vec![Out::Data(vec![0])],
        );
    }
    if let Some(path) = command.strip_prefix("scp -f ") {
        return (
            Program::ScpSource {
                path: unquote(path),
                stage: SourceStage::Start,
            },
            Vec::new(),
        );
    }
    match command {
        "cat" => (Program::Cat, Vec::new()),
        "sleep" => (Program::Silent, Vec::new()),
        "stderr" => {
            let mut outs = vec![
                Out::Data(b"out\n".to_vec()),
                Out::Stderr(b"err\n".to_vec()),
            ];
            outs.extend(finish(3));
            (Program::Idle, outs)
        }
        "kill" => (
            Program::Idle,
            vec![Out::Signal("KILL".to_string()), Out::Eof, Out::Close],
        ),
        "corrupt" => (Program::Silent, vec![Out::CorruptData(b"garbled".to_vec())]),
        _ => {
            let mut outs = vec![Out::Stderr(
                format!("sh: {}: command not found\n", command).into_bytes(),
            )];
            outs.extend(finish(127));
            (Program::Idle, outs)
        }
    }
}

impl Program {
    fn take_stall(&mut self) -> bool {
        match self {
            Program::Sftp(server) => std::mem::take(&mut server.stall_pending),
            _ => false,
        }
    }

    fn on_data(&mut self, data: &[u8], fs: &mut MemFs, options: &ServerOptions) -> Vec<Out> {
        match self {
            Program::Idle | Program::Silent => Vec::new(),
            Program::Cat | Program::Echo => vec![Out::Data(data.to_vec())],
            Program::Shell { line } => {
                let mut outs = Vec::new();
                for byte in data {
                    if *byte != b'\n' {
                        line.push(*byte);
                        continue;
                    }
                    let text = String::from_utf8_lossy(line).trim_end_matches('\r').to_string();
                    line.clear();
                    if text == "exit" {
                        outs.push(Out::Data(b"logout\r\n".to_vec()));
                        outs.extend(finish(0));
                        break;
                    }
                    outs.push(Out::Data(format!("{}\r\n$ ", text).into_bytes()));
                }
                outs
            }
            Program::Sftp(server) => match server.on_data(data, fs, options) {
                Ok(reply) if reply.is_empty() => Vec::new(),
                Ok(reply) => vec![Out::Data(reply)],
                Err(_) => vec![Out::Eof, Out::Close],
            },
            Program::ScpSink {
                target,
                buf,
                pending,
            } => {
                buf.extend_from_slice(data);
                let mut outs = Vec::new();
                loop {
                    match pending.take() {
                        None => {
                            let Some(pos) = buf.iter().position(|b| *b == b'\n') else {
                                break;
                            };
                            let line: Vec<u8> = buf.drain(..=pos).collect();
                            let line = String::from_utf8_lossy(&line[..pos]).into_owned();
                            if line.starts_with('T') {
                                outs.push(Out::Data(vec![0]));
                                continue;
                            }
                            match parse_control_line(&line) {
                                Ok((mode, size, name)) => {
                                    *pending = Some((mode, size as usize, name));
                                    outs.push(Out::Data(vec![0]));
                                }
                                Err(_) => {
                                    outs.push(Out::Data(b"\x02scp: protocol error\n".to_vec()));
                                    outs.extend(finish(1));
                                    break;
                                }
                            }
                        }
                        Some((mode, size, name)) => {
                            if buf.len() < size + 1 {
                                *pending = Some((mode, size, name));
                                break;
                            }
                            let contents: Vec<u8> = buf.drain(..size).collect();
                            buf.remove(0);
                            let is_dir = matches!(
                                fs.lookup(target, true),
                                Some((_, Node { kind: NodeKind::Dir, .. }))
                            );
                            let path = if is_dir {
                                join(&fs.canonical(target, true), &name)
                            } else {
                                target.clone()
                            };
                            if fs.write(&path, &contents, mode) {
                                outs.push(Out::Data(vec![0]));
                            } else {
                                outs.push(Out::Data(
                                    format!("\x01scp: {}: No such file or directory\n", path)
                                        .into_bytes(),
                                ));
                            }
                        }
                    }
                }
                outs
            }
            Program::ScpSource { path, stage } => {
                let mut outs = Vec::new();
                for byte in data {
                    if *byte != 0 {
                        outs.extend(finish(1));
                        *stage = SourceStage::Done;
                        break;
                    }
                    let node = fs.lookup(path, true).map(|(_, node)| node.clone());
                    let name = path.rsplit('/').next().unwrap_or(path.as_str()).to_string();
                    let current = std::mem::replace(stage, SourceStage::Done);
                    *stage = match (current, node) {
                        (SourceStage::Start, Some(node)) if options.scp_times => {
                            outs.push(Out::Data(
                                format!("T{} 0 {} 0\n", node.mtime, node.atime).into_bytes(),
                            ));
                            SourceStage::TimesSent
                        }
                        (SourceStage::Start | SourceStage::TimesSent, Some(node)) => match node.kind {
                            NodeKind::File(data) => {
                                outs.push(Out::Data(
                                    format!("C{:04o} {} {}\n", node.mode, data.len(), name)
                                        .into_bytes(),
                                ));
                                SourceStage::ControlSent
                            }
                            _ => {
                                outs.push(Out::Data(
                                    format!("\x01scp: {}: not a regular file\n", path).into_bytes(),
                                ));
                                outs.extend(finish(1));
                                SourceStage::Done
                            }
                        },
                        (SourceStage::Start, None) => {
                            outs.push(Out::Data(
                                format!("\x01scp: {}: No such file or directory\n", path)
                                    .into_bytes(),
                            ));
                            outs.extend(finish(1));
                            SourceStage::Done
                        }
                        (
                            SourceStage::ControlSent,
                            Some(Node {
                                kind: NodeKind::File(mut data),
                                ..
                            }),
                        ) => {
                            data.push(0);
                            outs.push(Out::Data(data));
                            SourceStage::DataSent
                        }
                        (SourceStage::DataSent, _) => {
                            outs.extend(finish(0));
                            SourceStage::Done
                        }
                        _ => SourceStage::Done,
                    };
                }
                outs
            }
        }
    }

    fn on_eof(&mut self) -> Vec<Out> {
        match self {
            Program::Cat | Program::ScpSink { .. } => finish(0),
            Program::Echo | Program::Sftp(_) => vec![Out::Eof, Out::Close],
            _ => Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

struct ServerChannel {
    remote: u32,
    window: u32,
    /// What is left of the window granted to the client
    granted: u32,
    max_packet: u32,
    program: Program,
    close_sent: bool,
}

struct ServerConn {
    stream: DuplexStream,
    options: ServerOptions,
    fs: SharedFs,
    host_key: Ed25519HostKey,
    sealing: SealingState,
    opening: OpeningState,
    client_id: String,
    session_id: Option<Vec<u8>>,
    deferred: VecDeque<Vec<u8>>,
    channels: HashMap<u32, ServerChannel>,
    next_channel: u32,
    pending_kbd: bool,
}

impl ServerConn {
    fn new(stream: DuplexStream, options: ServerOptions, fs: SharedFs) -> Self {
        Self {
            stream,
            options,
            fs,
            host_key: host_key(),
            sealing: SealingState::plaintext(),
            opening: OpeningState::plaintext(),
            client_id: String::new(),
            session_id: None,
            deferred: VecDeque::new(),
            channels: HashMap::new(),
            next_channel: 100,
            pending_kbd: false,
        }
    }

    async fn run(mut self) -> TernResult<()> {
        self.version_exchange().await?;
        self.key_exchange(None).await?;
        loop {
            let payload = self.next_packet().await?;
            if !self.dispatch(payload).await? {
                return Ok(());
            }
        }
    }

    async fn version_exchange(&mut self) -> TernResult<()> {
        let mut hello = String::new();
        for line in &self.options.pre_banner {
            hello.push_str(line);
            hello.push_str("\r\n");
        }
        hello.push_str(SERVER_ID);
        hello.push_str("\r\n");
        self.stream.write_all(hello.as_bytes()).await?;

        let mut line = Vec::new();
        loop {
            let byte = self.stream.read_u8().await?;
            if byte == b'\n' {
                break;
            }
            line.push(byte);
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        self.client_id = String::from_utf8_lossy(&line).into_owned();
        Ok(())
    }

    async fn send(&mut self, payload: &[u8]) -> TernResult<()> {
        let packet = self.sealing.seal(payload)?;
        self.stream.write_all(&packet).await?;
        Ok(())
    }

    async fn read_packet(&mut self) -> TernResult<Vec<u8>> {
        self.opening.read_packet(&mut self.stream).await
    }

    async fn next_packet(&mut self) -> TernResult<Vec<u8>> {
        match self.deferred.pop_front() {
            Some(payload) => Ok(payload),
            None => self.read_packet().await,
        }
    }

    async fn read_expect(&mut self, kind: MessageType) -> TernResult<Vec<u8>> {
        loop {
            let payload = self.read_packet().await?;
            match payload.first() {
                Some(b) if *b == kind as u8 => return Ok(payload),
                Some(b) if *b == MessageType::Ignore as u8 || *b == MessageType::Debug as u8 => {}
                other => {
                    return Err(TernError::Protocol(format!(
                        "test server expected {:?}, got {:?}",
                        kind, other
                    )))
                }
            }
        }
    }

    async fn key_exchange(&mut self, client_payload: Option<Vec<u8>>) -> TernResult<()> {
        let mut prefs = AlgorithmPreferences {
            kex: vec![KexAlgorithm::Curve25519Sha256, KexAlgorithm::Curve25519Sha256Libssh],
            host_key: vec![HostKeyAlgorithm::SshEd25519],
            ..AlgorithmPreferences::default()
        };
        if let Some(ciphers) = &self.options.ciphers {
            prefs.cipher = ciphers.clone();
        }
        let server_init = KexInit::from_preferences(&prefs);
        let server_payload = server_init.to_bytes();
        self.send(&server_payload).await?;

        let client_payload = match client_payload {
            Some(payload) => payload,
            None => self.read_expect(MessageType::KexInit).await?,
        };
        let client_init = KexInit::from_bytes(&client_payload)?;
        let negotiated = match negotiate(&client_init, &server_init) {
            Ok(negotiated) => negotiated,
            Err(e) => {
                // The client should say goodbye before dropping the stream
                if let Ok(payload) = self.read_packet().await {
                    self.note_disconnect(&payload);
                }
                return Err(e);
            }
        };
        if negotiated.kex.method() != KexMethod::Curve25519 {
            return Err(TernError::Protocol("test server only speaks curve25519".to_string()));
        }

        let init = self.read_expect(MessageType::KexdhInit).await?;
        let mut r = Reader::new(&init[1..]);
        let q_c = r.read_string()?.to_vec();
        let ours = Curve25519Exchange::new()?;
        let q_s = *ours.public_key();
        let k = ours.compute_shared_secret(&q_c)?;

        let host_key = self.host_key.public_key_bytes();
        let transcript = HashTranscript {
            client_id: &self.client_id,
            server_id: SERVER_ID,
            client_kexinit: &client_payload,
            server_kexinit: &server_payload,
            host_key: &host_key,
        };
        let values = ExchangeValues::Ecdh {
            client: &q_c,
            server: &q_s,
        };
        let hash = negotiated.kex.hash();
        let h = exchange_hash(hash, &transcript, &values, &k);
        let signature = self.host_key.sign(&h)?;

        let mut reply = BytesMut::new();
        write_u8(&mut reply, MessageType::KexdhReply as u8);
        write_string(&mut reply, &host_key);
        write_string(&mut reply, &q_s);
        write_string(&mut reply, &signature);
        self.send(&reply).await?;
        self.send(&NewKeys::new().to_bytes()).await?;

        let session_id = self.session_id.get_or_insert_with(|| h.clone()).clone();
        let keys = SessionKeys::derive(hash, &k, &h, &session_id, &negotiated);
        self.sealing.set_keys(
            negotiated.cipher_server_to_client.build(
                Direction::Encrypt,
                &keys.enc_server_to_client,
                &keys.iv_server_to_client,
            )?,
            Some(MacKey::new(negotiated.mac_server_to_client, &keys.mac_server_to_client)?),
        );

        self.read_expect(MessageType::NewKeys).await?;
        self.opening.set_keys(
            negotiated.cipher_client_to_server.build(
                Direction::Decrypt,
                &keys.enc_client_to_server,
                &keys.iv_client_to_server,
            )?,
            Some(MacKey::new(negotiated.mac_client_to_server, &keys.mac_client_to_server)?),
        );
        debug!(kex = negotiated.kex.name(), "test server keyed");
        Ok(())
    }

    fn note_disconnect(&self, payload: &[u8]) {
        if payload.first() != Some(&(MessageType::Disconnect as u8)) {
            return;
        }
        let mut r = Reader::new(&payload[1..]);
        if let (Ok(reason), Ok(description)) = (r.read_u32(), r.read_lossy()) {
            self.options.record(|log| log.disconnects.push((reason, description)));
        }
    }

    fn methods(&self) -> Vec<String> {
        let mut methods = vec!["password".to_string(), "publickey".to_string()];
        if self.options.keyboard_interactive {
            methods.push("keyboard-interactive".to_string());
        }
        methods
    }

    async fn auth_failure(&mut self) -> TernResult<()> {
        let failure = AuthFailure::new(self.methods(), false);
        self.send(&failure.to_bytes()).await
    }

    async fn handle_auth(&mut self, payload: &[u8]) -> TernResult<()> {
        if self.options.garbled_auth {
            return self.send(&ChannelSuccess::new(0).to_bytes()).await;
        }
        let request = AuthRequest::from_bytes(payload)?;
        if request.user_name() != USER {
            return self.auth_failure().await;
        }
        match request.method() {
            AuthMethod::None => self.auth_failure().await,
            AuthMethod::Password(password) => {
                if *password == self.options.password {
                    self.send(&[MessageType::UserauthSuccess as u8]).await
                } else {
                    self.auth_failure().await
                }
            }
            AuthMethod::KeyboardInteractive { .. } if self.options.keyboard_interactive => {
                self.pending_kbd = true;
                let prompt = InfoRequest {
                    name: String::new(),
                    instruction: String::new(),
                    prompts: vec![("Password: ".to_string(), false)],
                };
                self.send(&prompt.to_bytes()).await
            }
            AuthMethod::KeyboardInteractive { .. } => self.auth_failure().await,
            AuthMethod::PublicKey {
                algorithm,
                public_key,
                signature,
            } => {
                if self.options.authorized_key.as_deref() != Some(public_key.as_slice()) {
                    return self.auth_failure().await;
                }
                let Some(signature) = signature else {
                    let ok = AuthPkOk::new(algorithm.clone(), public_key.clone());
                    return self.send(&ok.to_bytes()).await;
                };
                let session_id = self.session_id.clone().unwrap_or_default();
                let data = construct_signature_data(
                    &session_id,
                    request.user_name(),
                    request.service_name(),
                    algorithm,
                    public_key,
                );
                let verified = match HostKeyAlgorithm::from_name(algorithm) {
                    Some(alg) => PublicHostKey::parse(public_key)
                        .and_then(|key| key.verify(alg, &data, signature))
                        .is_ok(),
                    None => false,
                };
                if verified {
                    self.send(&[MessageType::UserauthSuccess as u8]).await
                } else {
                    self.auth_failure().await
                }
            }
        }
    }

    /// Returns false once the client disconnects.
    async fn dispatch(&mut self, payload: Vec<u8>) -> TernResult<bool> {
        let Some(&kind) = payload.first() else {
            return Ok(true);
        };
        match MessageType::from_u8(kind) {
            Some(MessageType::Disconnect) => {
                self.note_disconnect(&payload);
                return Ok(false);
            }
            Some(MessageType::KexInit) => self.key_exchange(Some(payload)).await?,
            Some(MessageType::ServiceRequest) => {
                let mut r = Reader::new(&payload[1..]);
                let service = r.read_lossy()?;
                let mut accept = BytesMut::new();
                write_u8(&mut accept, MessageType::ServiceAccept as u8);
                write_str(&mut accept, &service);
                self.send(&accept).await?;
                if let Some(text) = self.options.banner.clone() {
                    self.send(&AuthBanner::new(text).to_bytes()).await?;
                }
            }
            Some(MessageType::UserauthRequest) => self.handle_auth(&payload).await?,
            Some(MessageType::UserauthInfoResponse) if self.pending_kbd => {
                self.pending_kbd = false;
                let response = InfoResponse::from_bytes(&payload)?;
                if response.responses.first().map(String::as_str) == Some(self.options.password.as_str()) {
                    self.send(&[MessageType::UserauthSuccess as u8]).await?;
                } else {
                    self.auth_failure().await?;
                }
            }
            Some(MessageType::GlobalRequest) => {
                if GlobalRequest::from_bytes(&payload)?.want_reply() {
                    self.send(&[MessageType::RequestFailure as u8]).await?;
                }
            }
            Some(MessageType::ChannelOpen) => self.open_channel(&payload).await?,
            Some(MessageType::ChannelRequest) => self.channel_request(&payload).await?,
            Some(MessageType::ChannelData) => {
                let message = ChannelData::from_bytes(&payload)?;
                self.channel_input(message.recipient_channel(), message.data()).await?;
            }
            Some(MessageType::ChannelWindowAdjust) => {
                let adjust = ChannelWindowAdjust::from_bytes(&payload)?;
                if let Some(channel) = self.channels.get_mut(&adjust.recipient_channel()) {
                    channel.window = channel.window.saturating_add(adjust.bytes_to_add());
                }
            }
            Some(MessageType::ChannelEof) => {
                let local = ChannelEof::from_bytes(&payload)?.recipient_channel();
                let outs = match self.channels.get_mut(&local) {
                    Some(channel) => channel.program.on_eof(),
                    None => Vec::new(),
                };
                self.perform(local, outs).await?;
            }
            Some(MessageType::ChannelClose) => {
                let local = ChannelClose::from_bytes(&payload)?.recipient_channel();
                if let Some(channel) = self.channels.remove(&local) {
                    if !channel.close_sent {
                        self.send(&ChannelClose::new(channel.remote).to_bytes()).await?;
                    }
                }
            }
            _ => {}
        }
        Ok(true)
    }

    async fn open_channel(&mut self, payload: &[u8]) -> TernResult<()> {
        let open = ChannelOpen::from_bytes(payload)?;
        if *open.channel_type() != ChannelType::Session {
            let failure = ChannelOpenFailure::new(
                open.sender_channel(),
                ChannelOpenFailureReason::UnknownChannelType,
                "only sessions",
            );
            return self.send(&failure.to_bytes()).await;
        }
        let local = self.next_channel;
        self.next_channel += 1;
        self.channels.insert(
            local,
            ServerChannel {
                remote: open.sender_channel(),
                window: open.initial_window_size(),
                granted: self.options.window,
                max_packet: open.maximum_packet_size(),
                program: Program::Idle,
                close_sent: false,
            },
        );
        let confirm = ChannelOpenConfirmation::new(
            open.sender_channel(),
            local,
            self.options.window,
            MAX_PACKET.min(self.options.window),
        );
        self.send(&confirm.to_bytes()).await
    }

    async fn channel_request(&mut self, payload: &[u8]) -> TernResult<()> {
        let request = ChannelRequest::from_bytes(payload)?;
        let local = request.recipient_channel();
        let Some(remote) = self.channels.get(&local).map(|c| c.remote) else {
            return Ok(());
        };
        let started = match request.request_type() {
            ChannelRequestType::Exec { command } => Some(start_exec(command)),
            ChannelRequestType::Shell => Some((
                Program::Shell { line: Vec::new() },
                vec![Out::Data(b"$ ".to_vec())],
            )),
            ChannelRequestType::Subsystem { name } if name == "sftp" => {
                Some((Program::Sftp(Box::new(SftpServer::new())), Vec::new()))
            }
            ChannelRequestType::Subsystem { name } if name == "echo" => {
                Some((Program::Echo, Vec::new()))
            }
            ChannelRequestType::PtyReq(_)
            | ChannelRequestType::Env { .. }
            | ChannelRequestType::WindowChange { .. } => {
                if request.want_reply() {
                    self.send(&ChannelSuccess::new(remote).to_bytes()).await?;
                }
                return Ok(());
            }
            _ => None,
        };
        match started {
            Some((program, outs)) => {
                if let Some(channel) = self.channels.get_mut(&local) {
                    channel.program = program;
                }
                if request.want_reply() {
                    self.send(&ChannelSuccess::new(remote).to_bytes()).await?;
                }
                self.perform(local, outs).await
            }
            None => {
                if request.want_reply() {
                    self.send(&ChannelFailure::new(remote).to_bytes()).await?;
                }
                Ok(())
            }
        }
    }

    async fn channel_input(&mut self, local: u32, data: &[u8]) -> TernResult<()> {
        let (remote, refill, stall, outs) = {
            let Some(channel) = self.channels.get_mut(&local) else {
                return Ok(());
            };
            if data.len() > channel.granted as usize {
                self.options.record(|log| log.window_violations += 1);
                return Err(TernError::Protocol(format!(
                    "test server got {} bytes with {} left in the window",
                    data.len(),
                    channel.granted
                )));
            }
            channel.granted -= data.len() as u32;
            let refill = channel.granted == 0;
            if refill {
                channel.granted = self.options.window;
            }
            let mut fs = self.fs.lock().expect("fs lock");
            let outs = channel.program.on_data(data, &mut fs, &self.options);
            (channel.remote, refill, channel.program.take_stall(), outs)
        };
        if refill {
            self.options.record(|log| log.window_stalls += 1);
            self.send(&ChannelWindowAdjust::new(remote, self.options.window).to_bytes())
                .await?;
        }
        if stall {
            tokio::time::sleep(self.options.stall).await;
        }
        self.perform(local, outs).await
    }

    async fn perform(&mut self, local: u32, outs: Vec<Out>) -> TernResult<()> {
        for out in outs {
            let Some(remote) = self.channels.get(&local).map(|c| c.remote) else {
                return Ok(());
            };
            match out {
                Out::Data(data) => self.send_data(local, &data, false).await?,
                Out::Stderr(data) => self.send_data(local, &data, true).await?,
                Out::Exit(code) => {
                    let request = ChannelRequest::new(
                        remote,
                        ChannelRequestType::ExitStatus { exit_status: code },
                        false,
                    );
                    self.send(&request.to_bytes()).await?;
                }
                Out::Signal(name) => {
                    let request = ChannelRequest::new(
                        remote,
                        ChannelRequestType::ExitSignal {
                            signal_name: name,
                            core_dumped: false,
                            error_message: "killed".to_string(),
                        },
                        false,
                    );
                    self.send(&request.to_bytes()).await?;
                }
                Out::Eof => self.send(&ChannelEof::new(remote).to_bytes()).await?,
                Out::Close => {
                    let first = self
                        .channels
                        .get_mut(&local)
                        .map(|c| !std::mem::replace(&mut c.close_sent, true))
                        .unwrap_or(false);
                    if first {
                        self.send(&ChannelClose::new(remote).to_bytes()).await?;
                    }
                }
                Out::CorruptData(data) => {
                    let mut packet = self.sealing.seal(&ChannelData::new(remote, data).to_bytes())?;
                    if let Some(last) = packet.last_mut() {
                        *last ^= 0xff;
                    }
                    self.stream.write_all(&packet).await?;
                }
            }
        }
        Ok(())
    }

    /// Sends channel data within the client's window, waiting for
    /// WINDOW_ADJUST when it runs dry.
    async fn send_data(&mut self, local: u32, data: &[u8], stderr: bool) -> TernResult<()> {
        let mut offset = 0;
        while offset < data.len() {
            let Some((remote, window, max_packet)) = self
                .channels
                .get(&local)
                .map(|c| (c.remote, c.window, c.max_packet))
            else {
                return Ok(());
            };
            if window == 0 {
                let payload = self.read_packet().await?;
                match payload.first().copied().and_then(MessageType::from_u8) {
                    Some(MessageType::ChannelWindowAdjust) => {
                        let adjust = ChannelWindowAdjust::from_bytes(&payload)?;
                        if let Some(channel) = self.channels.get_mut(&adjust.recipient_channel()) {
                            channel.window = channel.window.saturating_add(adjust.bytes_to_add());
                        }
                    }
                    // The client may rekey before it adjusts the window
                    Some(MessageType::KexInit) => self.key_exchange(Some(payload)).await?,
                    _ => self.deferred.push_back(payload),
                }
                continue;
            }
            let n = (data.len() - offset)
                .min(window as usize)
                .min(max_packet as usize);
            let chunk = data[offset..offset + n].to_vec();
            let message = if stderr {
                ChannelExtendedData::new(remote, 1, chunk).to_bytes()
            } else {
                ChannelData::new(remote, chunk).to_bytes()
            };
            self.send(&message).await?;
            if let Some(channel) = self.channels.get_mut(&local) {
                channel.window -= n as u32;
            }
            offset += n;
        }
        Ok(())
    }
}
