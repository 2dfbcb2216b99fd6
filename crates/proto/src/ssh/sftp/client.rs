//! SFTP session over one subsystem channel.
//!
//! An [`Sftp`] borrows the [`SshClient`] mutably for its lifetime, so all
//! traffic it generates is serialized with the rest of the connection.
//! Replies arrive in request order; pipelined operations rely on that and
//! check each reply id against the request that is expected next.

use super::cache::{StatCache, StatKind};
use super::message::{
    frame_init, frame_request, PacketBuffer, Response, SftpMessageType, SFTP_MIN_VERSION,
    SFTP_VERSION,
};
use super::types::{
    is_status, status_result, DirEntry, FileAttributes, FileType, OpenFlags, PutMode, SftpConfig,
    StatusCode,
};
use crate::ssh::channel::ChannelId;
use crate::ssh::client::SshClient;
use crate::ssh::logging::log_sftp_request;
use crate::ssh::wire::{write_str, write_string, write_u32, write_u64};
use bytes::BytesMut;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tern_platform::{TernError, TernResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// Runs one public operation under the client's soft timeout.
macro_rules! guarded {
    ($self:ident, $op:expr) => {{
        $self.ssh.arm();
        let result = $op.await;
        $self.ssh.settle(result)
    }};
}

/// An open SFTP session.
#[derive(Debug)]
pub struct Sftp<'a, S> {
    ssh: &'a mut SshClient<S>,
    channel: ChannelId,
    config: SftpConfig,
    version: u32,
    extensions: HashMap<String, String>,
    next_id: u32,
    pwd: String,
    cache: StatCache,
    cache_enabled: bool,
    inbound: PacketBuffer,
}

impl<S> SshClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Starts the `sftp` subsystem with default settings.
    pub async fn sftp(&mut self) -> TernResult<Sftp<'_, S>> {
        self.sftp_with(SftpConfig::default()).await
    }

    /// Starts the `sftp` subsystem.
    pub async fn sftp_with(&mut self, config: SftpConfig) -> TernResult<Sftp<'_, S>> {
        config.validate()?;
        let channel = self.start_subsystem("sftp").await?;
        let cache_enabled = config.stat_cache;
        let mut sftp = Sftp {
            ssh: self,
            channel,
            config,
            version: 0,
            extensions: HashMap::new(),
            next_id: 0,
            pwd: String::new(),
            cache: StatCache::new(),
            cache_enabled,
            inbound: PacketBuffer::new(),
        };

        match guarded!(sftp, sftp.init()) {
            Ok(()) => Ok(sftp),
            Err(e) => {
                if sftp.ssh.is_connected() {
                    let _ = sftp.ssh.close_inner(channel).await;
                }
                Err(e)
            }
        }
    }
}

/// Collapses `.` and `..` segments of an absolute path.
pub fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

fn join(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Whether request id `a` was issued before `b`. Ids wrap around.
fn is_older(a: u32, b: u32) -> bool {
    (b.wrapping_sub(a) as i32) > 0
}

fn is_dot(name: &str) -> bool {
    name == "." || name == ".."
}

fn kind_name(response: &Response) -> &'static str {
    match response {
        Response::Version { .. } => "SSH_FXP_VERSION",
        Response::Status { .. } => "SSH_FXP_STATUS",
        Response::Handle { .. } => "SSH_FXP_HANDLE",
        Response::Data { .. } => "SSH_FXP_DATA",
        Response::Name { .. } => "SSH_FXP_NAME",
        Response::Attrs { .. } => "SSH_FXP_ATTRS",
        Response::ExtendedReply { .. } => "SSH_FXP_EXTENDED_REPLY",
    }
}

fn unexpected(response: &Response, wanted: &str) -> TernError {
    TernError::Protocol(format!(
        "Unexpected SFTP response: expected {}, got {}",
        wanted,
        kind_name(response)
    ))
}

fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

async fn fill<R: AsyncRead + Unpin>(source: &mut R, buf: &mut [u8]) -> TernResult<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = source
            .read(&mut buf[filled..])
            .await
            .map_err(TernError::LocalIo)?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

impl<'a, S> Sftp<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    // ---- session ----

    async fn init(&mut self) -> TernResult<()> {
        self.ssh
            .write_inner(self.channel, &frame_init(SFTP_VERSION))
            .await?;
        match self.recv().await? {
            Response::Version {
                version,
                extensions,
            } => {
                if version < SFTP_MIN_VERSION {
                    return Err(TernError::NotImplemented(format!(
                        "SFTP version {} (need {} or later)",
                        version, SFTP_MIN_VERSION
                    )));
                }
                self.version = version.min(SFTP_VERSION);
                self.extensions = extensions.into_iter().collect();
            }
            other => return Err(unexpected(&other, "SSH_FXP_VERSION")),
        }
        debug!(
            channel = self.channel.0,
            version = self.version,
            extensions = self.extensions.len(),
            "SFTP session started"
        );
        self.pwd = self.realpath_raw(".").await?;
        Ok(())
    }

    /// Negotiated protocol version (2 or 3).
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Extensions announced by the server.
    pub fn extensions(&self) -> &HashMap<String, String> {
        &self.extensions
    }

    /// Channel carrying the session.
    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    /// Stops the subsystem and closes its channel.
    pub async fn close(mut self) -> TernResult<()> {
        self.ssh.arm();
        let result = self.ssh.close_inner(self.channel).await.map(|_| ());
        self.ssh.settle(result)
    }

    // ---- packet I/O ----

    fn next_request_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        id
    }

    async fn send<F>(&mut self, kind: SftpMessageType, path: &str, body: F) -> TernResult<u32>
    where
        F: FnOnce(&mut BytesMut),
    {
        let id = self.next_request_id();
        log_sftp_request(kind.name(), id, path);
        let packet = frame_request(kind, id, body);
        self.ssh.write_inner(self.channel, &packet).await?;
        Ok(id)
    }

    async fn recv(&mut self) -> TernResult<Response> {
        loop {
            if let Some(body) = self.inbound.next_packet()? {
                return Response::parse(&body);
            }
            match self.ssh.read_inner(self.channel).await? {
                Some(chunk) => self.inbound.push(&chunk),
                None => {
                    return Err(TernError::Channel(format!(
                        "SFTP channel {} closed by the server",
                        self.channel
                    )))
                }
            }
        }
    }

    /// Next reply, which must answer request `id`. Replies to older
    /// requests, abandoned when an earlier operation timed out, are skipped.
    async fn reply(&mut self, id: u32) -> TernResult<Response> {
        loop {
            let response = self.recv().await?;
            match response.id() {
                Some(got) if got == id => return Ok(response),
                Some(got) if is_older(got, id) => {
                    trace!(expected = id, got, "Discarding stale SFTP reply");
                }
                got => {
                    return Err(TernError::Protocol(format!(
                        "SFTP reply out of order: expected id {}, got {:?}",
                        id, got
                    )))
                }
            }
        }
    }

    async fn expect_status(&mut self, id: u32) -> TernResult<()> {
        match self.reply(id).await? {
            Response::Status { code, message, .. } => status_result(code, &message),
            other => Err(unexpected(&other, "SSH_FXP_STATUS")),
        }
    }

    async fn expect_handle(&mut self, id: u32) -> TernResult<Vec<u8>> {
        match self.reply(id).await? {
            Response::Handle { handle, .. } => Ok(handle),
            Response::Status { code, message, .. } => {
                status_result(code, &message)?;
                Err(TernError::Protocol(
                    "SFTP server answered OK where a handle was expected".to_string(),
                ))
            }
            other => Err(unexpected(&other, "SSH_FXP_HANDLE")),
        }
    }

    async fn expect_attrs(&mut self, id: u32) -> TernResult<FileAttributes> {
        match self.reply(id).await? {
            Response::Attrs { attrs, .. } => Ok(attrs),
            Response::Status { code, message, .. } => {
                status_result(code, &message)?;
                Err(TernError::Protocol(
                    "SFTP server answered OK where attributes were expected".to_string(),
                ))
            }
            other => Err(unexpected(&other, "SSH_FXP_ATTRS")),
        }
    }

    async fn expect_name(&mut self, id: u32) -> TernResult<DirEntry> {
        match self.reply(id).await? {
            Response::Name { mut entries, .. } if !entries.is_empty() => Ok(entries.remove(0)),
            Response::Status { code, message, .. } => {
                status_result(code, &message)?;
                Err(TernError::Protocol(
                    "SFTP server answered OK where a name was expected".to_string(),
                ))
            }
            other => Err(unexpected(&other, "SSH_FXP_NAME")),
        }
    }

    /// Collects the STATUS replies of pipelined requests and returns the
    /// first failure. Non-SFTP errors stop the drain.
    async fn drain_statuses(&mut self, ids: impl IntoIterator<Item = u32>) -> TernResult<()> {
        let mut first = None;
        for id in ids {
            match self.expect_status(id).await {
                Ok(()) => {}
                Err(e @ TernError::Sftp { .. }) => {
                    first.get_or_insert(e);
                }
                Err(e) => return Err(e),
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Sends one request per path in batches of `queue_depth`, then
    /// drains each batch.
    async fn pipeline<F>(&mut self, kind: SftpMessageType, paths: &[String], body: F) -> TernResult<()>
    where
        F: Fn(&mut BytesMut, &str),
    {
        let mut first = None;
        for batch in paths.chunks(self.config.queue_depth) {
            let mut ids = Vec::with_capacity(batch.len());
            for path in batch {
                ids.push(self.send(kind, path, |b| body(b, path.as_str())).await?);
            }
            match self.drain_statuses(ids).await {
                Ok(()) => {}
                Err(e @ TernError::Sftp { .. }) => {
                    first.get_or_insert(e);
                }
                Err(e) => return Err(e),
            }
        }
        first.map_or(Ok(()), Err)
    }

    // ---- paths ----

    fn resolve(&self, path: &str) -> String {
        if path.starts_with('/') {
            normalize(path)
        } else {
            normalize(&join(&self.pwd, path))
        }
    }

    async fn realpath_raw(&mut self, path: &str) -> TernResult<String> {
        let id = self
            .send(SftpMessageType::RealPath, path, |b| write_str(b, path))
            .await?;
        Ok(self.expect_name(id).await?.filename)
    }

    /// Current working directory.
    pub fn pwd(&self) -> &str {
        &self.pwd
    }

    /// Canonical form of `path` as the server sees it.
    pub async fn realpath(&mut self, path: &str) -> TernResult<String> {
        let path = self.resolve(path);
        guarded!(self, self.realpath_raw(&path))
    }

    /// Changes the working directory.
    pub async fn chdir(&mut self, dir: &str) -> TernResult<()> {
        let dir = self.resolve(dir);
        guarded!(self, self.chdir_inner(dir))
    }

    async fn chdir_inner(&mut self, dir: String) -> TernResult<()> {
        let real = self.realpath_raw(&dir).await?;
        let attrs = self.stat_kind(&real, StatKind::Stat).await?;
        if !attrs.is_dir() {
            return Err(TernError::Sftp {
                code: StatusCode::Failure as u32,
                message: format!("{} is not a directory", real),
            });
        }
        self.pwd = real;
        Ok(())
    }

    // ---- stat cache ----

    /// Turns the stat cache on.
    pub fn enable_stat_cache(&mut self) {
        self.cache_enabled = true;
    }

    /// Turns the stat cache off and drops its contents.
    pub fn disable_stat_cache(&mut self) {
        self.cache_enabled = false;
        self.cache.clear();
    }

    /// Drops all cached attributes.
    pub fn clear_stat_cache(&mut self) {
        self.cache.clear();
    }

    /// Whether the stat cache is on.
    pub fn stat_cache_enabled(&self) -> bool {
        self.cache_enabled
    }

    fn remember(&mut self, path: &str, kind: StatKind, attrs: &FileAttributes) {
        if !self.cache_enabled {
            return;
        }
        self.cache.put(path, kind, attrs.clone());
        // A non-link answers both lookups.
        if kind == StatKind::Lstat && attrs.file_type != FileType::Symlink {
            self.cache.put(path, StatKind::Stat, attrs.clone());
        }
    }

    // ---- queries ----

    async fn stat_kind(&mut self, path: &str, kind: StatKind) -> TernResult<FileAttributes> {
        if self.cache_enabled {
            if let Some(attrs) = self.cache.get(path, kind) {
                return Ok(attrs.clone());
            }
        }
        let msg = match kind {
            StatKind::Stat => SftpMessageType::Stat,
            StatKind::Lstat => SftpMessageType::LStat,
        };
        let id = self.send(msg, path, |b| write_str(b, path)).await?;
        let attrs = self.expect_attrs(id).await?;
        self.remember(path, kind, &attrs);
        Ok(attrs)
    }

    /// Like `stat_kind`, but a missing file yields `None`.
    async fn stat_if_exists(&mut self, path: &str, kind: StatKind) -> TernResult<Option<FileAttributes>> {
        match self.stat_kind(path, kind).await {
            Ok(attrs) => Ok(Some(attrs)),
            Err(e) if is_status(&e, StatusCode::NoSuchFile) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Attributes of `path`, following symlinks.
    pub async fn stat(&mut self, path: &str) -> TernResult<FileAttributes> {
        let path = self.resolve(path);
        guarded!(self, self.stat_kind(&path, StatKind::Stat))
    }

    /// Attributes of `path` itself.
    pub async fn lstat(&mut self, path: &str) -> TernResult<FileAttributes> {
        let path = self.resolve(path);
        guarded!(self, self.stat_kind(&path, StatKind::Lstat))
    }

    /// Whether `path` exists. Dangling symlinks do not count.
    pub async fn file_exists(&mut self, path: &str) -> TernResult<bool> {
        let path = self.resolve(path);
        let found = guarded!(self, self.stat_if_exists(&path, StatKind::Stat))?;
        Ok(found.is_some())
    }

    /// Whether `path` is a directory, following symlinks.
    pub async fn is_dir(&mut self, path: &str) -> TernResult<bool> {
        Ok(self.filetype_of(path, StatKind::Stat).await? == Some(FileType::Directory))
    }

    /// Whether `path` is a regular file, following symlinks.
    pub async fn is_file(&mut self, path: &str) -> TernResult<bool> {
        Ok(self.filetype_of(path, StatKind::Stat).await? == Some(FileType::Regular))
    }

    /// Whether `path` is a symlink.
    pub async fn is_link(&mut self, path: &str) -> TernResult<bool> {
        Ok(self.filetype_of(path, StatKind::Lstat).await? == Some(FileType::Symlink))
    }

    /// Size of `path` in bytes.
    pub async fn filesize(&mut self, path: &str) -> TernResult<u64> {
        Ok(self.stat(path).await?.size.unwrap_or(0))
    }

    /// Type of `path` itself, without following symlinks.
    pub async fn filetype(&mut self, path: &str) -> TernResult<FileType> {
        Ok(self.lstat(path).await?.file_type)
    }

    async fn filetype_of(&mut self, path: &str, kind: StatKind) -> TernResult<Option<FileType>> {
        let path = self.resolve(path);
        let found = guarded!(self, self.stat_if_exists(&path, kind))?;
        Ok(found.map(|a| a.file_type))
    }

    // ---- listings ----

    async fn read_dir(&mut self, dir: &str) -> TernResult<Vec<DirEntry>> {
        let id = self
            .send(SftpMessageType::OpenDir, dir, |b| write_str(b, dir))
            .await?;
        let handle = self.expect_handle(id).await?;
        let result = self.read_dir_pages(dir, &handle).await;
        let closed = self.close_handle(&handle).await;
        let entries = result?;
        closed?;
        Ok(entries)
    }

    async fn read_dir_pages(&mut self, dir: &str, handle: &[u8]) -> TernResult<Vec<DirEntry>> {
        let mut entries = Vec::new();
        loop {
            let id = self
                .send(SftpMessageType::ReadDir, dir, |b| write_string(b, handle))
                .await?;
            match self.reply(id).await? {
                Response::Name { entries: page, .. } => {
                    for mut entry in page {
                        if is_dot(&entry.filename) {
                            entry.attrs.file_type = FileType::Directory;
                        } else {
                            let path = join(dir, &entry.filename);
                            self.remember(&path, StatKind::Lstat, &entry.attrs);
                        }
                        entries.push(entry);
                    }
                }
                Response::Status { code, .. } if code == StatusCode::Eof as u32 => break,
                Response::Status { code, message, .. } => {
                    status_result(code, &message)?;
                    return Err(TernError::Protocol(
                        "SFTP server answered OK to READDIR".to_string(),
                    ));
                }
                other => return Err(unexpected(&other, "SSH_FXP_NAME")),
            }
        }
        self.config.list_order.sort(&mut entries);
        Ok(entries)
    }

    /// Whether a listed entry should be descended into. With the cache on
    /// symlinks are followed through `stat`; otherwise the listing's own
    /// attributes decide.
    async fn descends_into(&mut self, path: &str, entry: &DirEntry) -> TernResult<bool> {
        if !self.cache_enabled {
            return Ok(entry.attrs.file_type == FileType::Directory);
        }
        Ok(self
            .stat_if_exists(path, StatKind::Stat)
            .await?
            .map_or(false, |a| a.is_dir()))
    }

    /// Dot entries are kept for the top level only.
    async fn list(&mut self, dir: String, recursive: bool) -> TernResult<Vec<DirEntry>> {
        let mut out = Vec::new();
        let mut visited = HashSet::new();
        visited.insert(dir.clone());
        let mut pending = vec![(dir, String::new())];

        while let Some((abs, prefix)) = pending.pop() {
            for mut entry in self.read_dir(&abs).await? {
                let dot = is_dot(&entry.filename);
                if dot && !prefix.is_empty() {
                    continue;
                }
                if recursive && !dot {
                    let child = join(&abs, &entry.filename);
                    if self.descends_into(&child, &entry).await? {
                        let real = if entry.attrs.file_type == FileType::Symlink {
                            self.realpath_raw(&child).await?
                        } else {
                            child.clone()
                        };
                        if visited.insert(real) {
                            pending.push((child, format!("{}{}/", prefix, entry.filename)));
                        }
                    }
                }
                entry.filename = format!("{}{}", prefix, entry.filename);
                out.push(entry);
            }
        }
        Ok(out)
    }

    /// Names in `dir`. Recursive listings name nested entries relative to
    /// `dir`, e.g. `sub/file`.
    ///
    /// `.` and `..` appear only for `dir` itself, as the server returns
    /// them. Nested directories contribute neither.
    pub async fn nlist(&mut self, dir: &str, recursive: bool) -> TernResult<Vec<String>> {
        let entries = self.rawlist(dir, recursive).await?;
        Ok(entries.into_iter().map(|e| e.filename).collect())
    }

    /// Entries in `dir` with their attributes. Names and the handling of
    /// `.` and `..` follow [`nlist`](Self::nlist).
    pub async fn rawlist(&mut self, dir: &str, recursive: bool) -> TernResult<Vec<DirEntry>> {
        let dir = self.resolve(dir);
        guarded!(self, self.list(dir, recursive))
    }

    /// Splits the tree under `root` into files and directories without
    /// following symlinks. Directories come parents first.
    async fn collect_tree(&mut self, root: &str) -> TernResult<(Vec<String>, Vec<String>)> {
        let mut dirs = vec![root.to_string()];
        let mut files = Vec::new();
        let mut next = 0;
        while next < dirs.len() {
            let dir = dirs[next].clone();
            next += 1;
            for entry in self.read_dir(&dir).await? {
                if is_dot(&entry.filename) {
                    continue;
                }
                let path = join(&dir, &entry.filename);
                if entry.attrs.file_type == FileType::Directory {
                    dirs.push(path);
                } else {
                    files.push(path);
                }
            }
        }
        Ok((files, dirs))
    }

    // ---- handles ----

    async fn open(&mut self, path: &str, flags: OpenFlags, attrs: &FileAttributes) -> TernResult<Vec<u8>> {
        let id = self
            .send(SftpMessageType::Open, path, |b| {
                write_str(b, path);
                write_u32(b, flags.bits());
                attrs.encode(b);
            })
            .await?;
        self.expect_handle(id).await
    }

    async fn close_handle(&mut self, handle: &[u8]) -> TernResult<()> {
        let id = self
            .send(SftpMessageType::Close, "", |b| write_string(b, handle))
            .await?;
        self.expect_status(id).await
    }

    // ---- downloads ----

    async fn download<W>(&mut self, path: &str, offset: u64, length: Option<u64>, sink: &mut W) -> TernResult<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let handle = self
            .open(path, OpenFlags::READ, &FileAttributes::new())
            .await?;
        let result = self.read_into(path, &handle, offset, length, sink).await;
        let closed = self.close_handle(&handle).await;
        let n = result?;
        closed?;
        Ok(n)
    }

    /// Pipelined reads. A short read restarts the window at the first
    /// missing byte; replies to requests beyond it are discarded.
    async fn read_into<W>(
        &mut self,
        path: &str,
        handle: &[u8],
        start: u64,
        length: Option<u64>,
        sink: &mut W,
    ) -> TernResult<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let chunk = u64::from(self.config.chunk_size);
        let end = length.map(|l| start.saturating_add(l));
        let mut next = start;
        let mut position = start;
        let mut eof = false;
        let mut in_flight: VecDeque<(u32, u64, u64)> = VecDeque::new();

        loop {
            while !eof
                && in_flight.len() < self.config.queue_depth
                && end.map_or(true, |e| next < e)
            {
                let len = end.map_or(chunk, |e| (e - next).min(chunk));
                let offset = next;
                let id = self
                    .send(SftpMessageType::Read, path, |b| {
                        write_string(b, handle);
                        write_u64(b, offset);
                        write_u32(b, len as u32);
                    })
                    .await?;
                in_flight.push_back((id, offset, len));
                next += len;
            }

            let Some((id, offset, len)) = in_flight.pop_front() else {
                break;
            };
            match self.reply(id).await {
                Ok(Response::Data { mut data, .. }) => {
                    if offset != position || eof {
                        continue;
                    }
                    if data.is_empty() {
                        eof = true;
                        continue;
                    }
                    data.truncate(len as usize);
                    sink.write_all(&data).await.map_err(TernError::LocalIo)?;
                    position += data.len() as u64;
                    if (data.len() as u64) < len {
                        next = position;
                    }
                }
                Ok(Response::Status { code, message, .. }) => {
                    if code == StatusCode::Eof as u32 {
                        if offset == position {
                            eof = true;
                        }
                        continue;
                    }
                    self.discard(in_flight).await?;
                    status_result(code, &message)?;
                    return Err(TernError::Protocol(
                        "SFTP server answered OK to READ".to_string(),
                    ));
                }
                Ok(other) => return Err(unexpected(&other, "SSH_FXP_DATA")),
                Err(e) => return Err(e),
            }
        }
        sink.flush().await.map_err(TernError::LocalIo)?;
        Ok(position - start)
    }

    async fn discard(&mut self, in_flight: VecDeque<(u32, u64, u64)>) -> TernResult<()> {
        for (id, _, _) in in_flight {
            self.reply(id).await?;
        }
        Ok(())
    }

    /// Downloads a whole file into memory.
    pub async fn get(&mut self, path: &str) -> TernResult<Vec<u8>> {
        self.get_range(path, 0, None).await
    }

    /// Downloads `length` bytes (or up to EOF) starting at `offset`.
    pub async fn get_range(&mut self, path: &str, offset: u64, length: Option<u64>) -> TernResult<Vec<u8>> {
        let path = self.resolve(path);
        let mut data = Vec::new();
        guarded!(self, self.download(&path, offset, length, &mut data))?;
        Ok(data)
    }

    /// Downloads a file to the local filesystem and returns the byte count.
    pub async fn get_to_file(&mut self, path: &str, local: impl AsRef<Path>) -> TernResult<u64> {
        let path = self.resolve(path);
        let mut file = tokio::fs::File::create(local.as_ref())
            .await
            .map_err(TernError::LocalIo)?;
        guarded!(self, self.download(&path, 0, None, &mut file))
    }

    // ---- uploads ----

    async fn upload<R>(&mut self, path: &str, source: &mut R, mode: PutMode) -> TernResult<u64>
    where
        R: AsyncRead + Unpin,
    {
        let (flags, offset) = match mode {
            PutMode::Overwrite => (
                OpenFlags::WRITE | OpenFlags::CREAT | OpenFlags::TRUNC,
                0,
            ),
            PutMode::Append => (
                OpenFlags::WRITE | OpenFlags::CREAT | OpenFlags::APPEND,
                self.remote_size(path).await?,
            ),
            PutMode::Resume => {
                let size = self.remote_size(path).await?;
                let skipped = tokio::io::copy(&mut (&mut *source).take(size), &mut tokio::io::sink())
                    .await
                    .map_err(TernError::LocalIo)?;
                if skipped < size {
                    return Err(TernError::Sftp {
                        code: StatusCode::Failure as u32,
                        message: format!(
                            "Cannot resume: remote file has {} bytes, source only {}",
                            size, skipped
                        ),
                    });
                }
                (OpenFlags::WRITE | OpenFlags::CREAT, size)
            }
        };

        let handle = self.open(path, flags, &FileAttributes::new()).await?;
        let result = self.write_from(path, &handle, offset, source).await;
        let closed = self.close_handle(&handle).await;
        self.cache.invalidate(path);
        let n = result?;
        closed?;
        Ok(n)
    }

    async fn remote_size(&mut self, path: &str) -> TernResult<u64> {
        // Always ask the server: the size decides where bytes land.
        self.cache.invalidate(path);
        Ok(self
            .stat_if_exists(path, StatKind::Stat)
            .await?
            .and_then(|a| a.size)
            .unwrap_or(0))
    }

    async fn write_from<R>(&mut self, path: &str, handle: &[u8], mut offset: u64, source: &mut R) -> TernResult<u64>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; self.config.chunk_size as usize];
        let mut in_flight = VecDeque::new();
        let mut total = 0u64;

        loop {
            let n = fill(source, &mut buf).await?;
            if n == 0 {
                break;
            }
            let at = offset;
            let id = self
                .send(SftpMessageType::Write, path, |b| {
                    write_string(b, handle);
                    write_u64(b, at);
                    write_string(b, &buf[..n]);
                })
                .await?;
            in_flight.push_back(id);
            offset += n as u64;
            total += n as u64;

            if in_flight.len() >= self.config.queue_depth {
                if let Some(id) = in_flight.pop_front() {
                    if let Err(e) = self.expect_status(id).await {
                        if matches!(e, TernError::Sftp { .. }) {
                            self.drain_statuses(in_flight).await.ok();
                        }
                        return Err(e);
                    }
                }
            }
            if n < buf.len() {
                break;
            }
        }
        self.drain_statuses(in_flight).await?;
        Ok(total)
    }

    /// Uploads `data`. Returns the number of bytes written.
    pub async fn put(&mut self, path: &str, data: &[u8], mode: PutMode) -> TernResult<u64> {
        let path = self.resolve(path);
        let mut source = data;
        guarded!(self, self.upload(&path, &mut source, mode))
    }

    /// Uploads a local file. Returns the number of bytes written.
    pub async fn put_file(&mut self, path: &str, local: impl AsRef<Path>, mode: PutMode) -> TernResult<u64> {
        let path = self.resolve(path);
        let mut file = tokio::fs::File::open(local.as_ref())
            .await
            .map_err(TernError::LocalIo)?;
        guarded!(self, self.upload(&path, &mut file, mode))
    }

    // ---- mutations ----

    async fn simple(&mut self, kind: SftpMessageType, path: &str) -> TernResult<()> {
        let id = self.send(kind, path, |b| write_str(b, path)).await?;
        let result = self.expect_status(id).await;
        self.cache.invalidate(path);
        result
    }

    async fn setstat(&mut self, path: &str, attrs: &FileAttributes) -> TernResult<()> {
        let id = self
            .send(SftpMessageType::SetStat, path, |b| {
                write_str(b, path);
                attrs.encode(b);
            })
            .await?;
        let result = self.expect_status(id).await;
        self.cache.invalidate(path);
        result
    }

    async fn mkdir_one(&mut self, path: &str, mode: Option<u32>) -> TernResult<()> {
        let attrs = FileAttributes {
            permissions: mode,
            ..Default::default()
        };
        let id = self
            .send(SftpMessageType::MkDir, path, |b| {
                write_str(b, path);
                attrs.encode(b);
            })
            .await?;
        let result = self.expect_status(id).await;
        self.cache.invalidate(path);
        result
    }

    async fn mkdir_all(&mut self, dir: &str, mode: Option<u32>) -> TernResult<()> {
        let mut current = String::new();
        for seg in dir.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(seg);
            match self.stat_if_exists(&current, StatKind::Stat).await? {
                Some(attrs) if attrs.is_dir() => continue,
                _ => self.mkdir_one(&current, mode).await?,
            }
        }
        Ok(())
    }

    /// Creates a directory. `recursive` also creates missing parents and
    /// accepts an existing directory.
    pub async fn mkdir(&mut self, dir: &str, mode: Option<u32>, recursive: bool) -> TernResult<()> {
        let dir = self.resolve(dir);
        if recursive {
            guarded!(self, self.mkdir_all(&dir, mode))
        } else {
            guarded!(self, self.mkdir_one(&dir, mode))
        }
    }

    /// Removes an empty directory.
    pub async fn rmdir(&mut self, dir: &str) -> TernResult<()> {
        let dir = self.resolve(dir);
        guarded!(self, self.simple(SftpMessageType::RmDir, &dir))
    }

    async fn delete_inner(&mut self, path: &str, recursive: bool) -> TernResult<()> {
        if !recursive {
            return self.simple(SftpMessageType::Remove, path).await;
        }
        let attrs = self.stat_kind(path, StatKind::Lstat).await?;
        if !attrs.is_dir() {
            return self.simple(SftpMessageType::Remove, path).await;
        }

        let (files, mut dirs) = self.collect_tree(path).await?;
        dirs.reverse();
        let removed = self
            .pipeline(SftpMessageType::Remove, &files, |b, p| write_str(b, p))
            .await;
        let result = match removed {
            Ok(()) => {
                self.pipeline(SftpMessageType::RmDir, &dirs, |b, p| write_str(b, p))
                    .await
            }
            Err(e) => Err(e),
        };
        self.cache.invalidate(path);
        result
    }

    /// Removes a file. With `recursive`, a directory and everything under
    /// it is removed; symlinks are removed, not followed.
    pub async fn delete(&mut self, path: &str, recursive: bool) -> TernResult<()> {
        let path = self.resolve(path);
        guarded!(self, self.delete_inner(&path, recursive))
    }

    async fn rename_inner(&mut self, from: &str, to: &str) -> TernResult<()> {
        let id = self
            .send(SftpMessageType::Rename, from, |b| {
                write_str(b, from);
                write_str(b, to);
            })
            .await?;
        let result = self.expect_status(id).await;
        self.cache.invalidate(from);
        self.cache.invalidate(to);
        result
    }

    /// Renames `from` to `to`.
    pub async fn rename(&mut self, from: &str, to: &str) -> TernResult<()> {
        let from = self.resolve(from);
        let to = self.resolve(to);
        guarded!(self, self.rename_inner(&from, &to))
    }

    async fn chmod_inner(&mut self, mode: u32, path: &str, recursive: bool) -> TernResult<()> {
        let attrs = FileAttributes {
            permissions: Some(mode & 0o7777),
            ..Default::default()
        };
        if recursive && self.stat_kind(path, StatKind::Lstat).await?.is_dir() {
            let (files, dirs) = self.collect_tree(path).await?;
            let mut all = dirs;
            all.extend(files);
            let result = self
                .pipeline(SftpMessageType::SetStat, &all, |b, p| {
                    write_str(b, p);
                    attrs.encode(b);
                })
                .await;
            self.cache.invalidate(path);
            return result;
        }
        self.setstat(path, &attrs).await
    }

    /// Changes permission bits.
    pub async fn chmod(&mut self, mode: u32, path: &str, recursive: bool) -> TernResult<()> {
        let path = self.resolve(path);
        guarded!(self, self.chmod_inner(mode, &path, recursive))
    }

    async fn chown_inner(&mut self, path: &str, uid: Option<u32>, gid: Option<u32>) -> TernResult<()> {
        // UID and GID travel as a pair, so the unchanged half is looked up.
        let current = self.stat_kind(path, StatKind::Stat).await?;
        let attrs = FileAttributes {
            uid: uid.or(current.uid),
            gid: gid.or(current.gid),
            ..Default::default()
        };
        if attrs.uid.is_none() || attrs.gid.is_none() {
            return Err(TernError::Sftp {
                code: StatusCode::OpUnsupported as u32,
                message: format!("Server did not report the owner of {}", path),
            });
        }
        self.setstat(path, &attrs).await
    }

    /// Changes the owning user.
    pub async fn chown(&mut self, path: &str, uid: u32) -> TernResult<()> {
        let path = self.resolve(path);
        guarded!(self, self.chown_inner(&path, Some(uid), None))
    }

    /// Changes the owning group.
    pub async fn chgrp(&mut self, path: &str, gid: u32) -> TernResult<()> {
        let path = self.resolve(path);
        guarded!(self, self.chown_inner(&path, None, Some(gid)))
    }

    fn require_v3(&self, what: &str) -> TernResult<()> {
        if self.version < 3 {
            return Err(TernError::NotImplemented(format!(
                "{} needs SFTP version 3, session has {}",
                what, self.version
            )));
        }
        Ok(())
    }

    async fn symlink_inner(&mut self, target: &str, link: &str) -> TernResult<()> {
        // OpenSSH expects the target first.
        let id = self
            .send(SftpMessageType::Symlink, link, |b| {
                write_str(b, target);
                write_str(b, link);
            })
            .await?;
        let result = self.expect_status(id).await;
        self.cache.invalidate(link);
        result
    }

    /// Creates `link` pointing at `target`. The target is sent as given.
    pub async fn symlink(&mut self, target: &str, link: &str) -> TernResult<()> {
        self.require_v3("symlink")?;
        let link = self.resolve(link);
        guarded!(self, self.symlink_inner(target, &link))
    }

    async fn readlink_inner(&mut self, link: &str) -> TernResult<String> {
        let id = self
            .send(SftpMessageType::ReadLink, link, |b| write_str(b, link))
            .await?;
        Ok(self.expect_name(id).await?.filename)
    }

    /// Target of a symlink.
    pub async fn readlink(&mut self, link: &str) -> TernResult<String> {
        self.require_v3("readlink")?;
        let link = self.resolve(link);
        guarded!(self, self.readlink_inner(&link))
    }

    async fn touch_inner(&mut self, path: &str, mtime: u32, atime: u32) -> TernResult<()> {
        let attrs = FileAttributes {
            atime: Some(atime),
            mtime: Some(mtime),
            ..Default::default()
        };
        if self.stat_if_exists(path, StatKind::Stat).await?.is_some() {
            return self.setstat(path, &attrs).await;
        }
        let flags = OpenFlags::WRITE | OpenFlags::CREAT | OpenFlags::EXCL;
        let handle = self.open(path, flags, &attrs).await?;
        let result = self.close_handle(&handle).await;
        self.cache.invalidate(path);
        result
    }

    /// Sets access and modification times, creating an empty file when
    /// `path` does not exist. Both times default to now.
    pub async fn touch(&mut self, path: &str, mtime: Option<u32>, atime: Option<u32>) -> TernResult<()> {
        let path = self.resolve(path);
        let mtime = mtime.unwrap_or_else(unix_now);
        let atime = atime.unwrap_or(mtime);
        guarded!(self, self.touch_inner(&path, mtime, atime))
    }

    /// Sets the size of a file.
    pub async fn truncate(&mut self, path: &str, size: u64) -> TernResult<()> {
        let path = self.resolve(path);
        let attrs = FileAttributes {
            size: Some(size),
            ..Default::default()
        };
        guarded!(self, self.setstat(&path, &attrs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("/a/./b/../c"), "/a/c");
        assert_eq!(normalize("/../.."), "/");
        assert_eq!(normalize("//a//b/"), "/a/b");
        assert_eq!(normalize("/"), "/");
    }

    #[test]
    fn test_join() {
        assert_eq!(join("/", "a"), "/a");
        assert_eq!(join("/a", "b"), "/a/b");
    }

    #[test]
    fn test_unexpected_names_the_response() {
        let err = unexpected(
            &Response::Data {
                id: 1,
                data: vec![0; 4],
            },
            "SSH_FXP_ATTRS",
        );
        assert!(err.to_string().contains("SSH_FXP_DATA"));
        assert!(err.to_string().contains("SSH_FXP_ATTRS"));
    }

    #[test]
    fn test_is_older_handles_wraparound() {
        assert!(is_older(3, 7));
        assert!(!is_older(7, 3));
        assert!(!is_older(5, 5));
        assert!(is_older(u32::MAX, 1));
        assert!(!is_older(1, u32::MAX));
    }

    #[tokio::test]
    async fn test_fill_reads_until_full_or_eof() {
        let mut source: &[u8] = b"abcdef";
        let mut buf = [0u8; 4];
        assert_eq!(fill(&mut source, &mut buf).await.unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(fill(&mut source, &mut buf).await.unwrap(), 2);
        assert_eq!(fill(&mut source, &mut buf).await.unwrap(), 0);
    }
}
