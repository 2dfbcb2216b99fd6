//! SFTP data types and structures.

use crate::ssh::wire::{write_str, write_u32, write_u64, Reader};
use bitflags::bitflags;
use bytes::BytesMut;
use tern_platform::{TernError, TernResult};

/// SFTP status codes (SSH_FX_*).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum StatusCode {
    /// SSH_FX_OK - Success
    Ok = 0,
    /// SSH_FX_EOF - End of file
    Eof = 1,
    /// SSH_FX_NO_SUCH_FILE - No such file
    NoSuchFile = 2,
    /// SSH_FX_PERMISSION_DENIED - Permission denied
    PermissionDenied = 3,
    /// SSH_FX_FAILURE - General failure
    Failure = 4,
    /// SSH_FX_BAD_MESSAGE - Bad message
    BadMessage = 5,
    /// SSH_FX_NO_CONNECTION - No connection
    NoConnection = 6,
    /// SSH_FX_CONNECTION_LOST - Connection lost
    ConnectionLost = 7,
    /// SSH_FX_OP_UNSUPPORTED - Operation not supported
    OpUnsupported = 8,
}

impl StatusCode {
    /// Convert from u32.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Ok),
            1 => Some(Self::Eof),
            2 => Some(Self::NoSuchFile),
            3 => Some(Self::PermissionDenied),
            4 => Some(Self::Failure),
            5 => Some(Self::BadMessage),
            6 => Some(Self::NoConnection),
            7 => Some(Self::ConnectionLost),
            8 => Some(Self::OpUnsupported),
            _ => None,
        }
    }

    /// Returns the default message for the code.
    pub fn message(&self) -> &'static str {
        match self {
            Self::Ok => "Success",
            Self::Eof => "End of file",
            Self::NoSuchFile => "No such file or directory",
            Self::PermissionDenied => "Permission denied",
            Self::Failure => "Failure",
            Self::BadMessage => "Bad message",
            Self::NoConnection => "No connection",
            Self::ConnectionLost => "Connection lost",
            Self::OpUnsupported => "Operation not supported",
        }
    }
}

/// Turns a STATUS reply into a result. The server text is kept, or the
/// code's default message when the server sent none.
pub fn status_result(code: u32, message: &str) -> TernResult<()> {
    if code == StatusCode::Ok as u32 {
        return Ok(());
    }
    let message = if message.is_empty() {
        StatusCode::from_u32(code)
            .map(|c| c.message())
            .unwrap_or("Unknown status")
            .to_string()
    } else {
        message.to_string()
    };
    Err(TernError::Sftp { code, message })
}

/// Whether `err` is an SFTP status with this code.
pub fn is_status(err: &TernError, code: StatusCode) -> bool {
    matches!(err, TernError::Sftp { code: c, .. } if *c == code as u32)
}

/// File type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileType {
    /// Regular file
    Regular,
    /// Directory
    Directory,
    /// Symbolic link
    Symlink,
    /// Special file (device, fifo, socket)
    Special,
    /// Unknown type
    #[default]
    Unknown,
}

/// Mask of the file type bits in a mode.
pub const S_IFMT: u32 = 0o170000;
/// Directory type bits.
pub const S_IFDIR: u32 = 0o040000;
/// Regular file type bits.
pub const S_IFREG: u32 = 0o100000;
/// Symlink type bits.
pub const S_IFLNK: u32 = 0o120000;

impl FileType {
    /// Type from the `S_IFMT` bits of a mode.
    pub fn from_mode(mode: u32) -> Self {
        match mode & S_IFMT {
            S_IFDIR => FileType::Directory,
            S_IFREG => FileType::Regular,
            S_IFLNK => FileType::Symlink,
            0 => FileType::Unknown,
            _ => FileType::Special,
        }
    }

    /// Type from the first character of an `ls -l` style long name.
    pub fn from_longname(longname: &str) -> Self {
        match longname.chars().next() {
            Some('-') => FileType::Regular,
            Some('d') => FileType::Directory,
            Some('l') => FileType::Symlink,
            Some('b' | 'c' | 'p' | 's') => FileType::Special,
            _ => FileType::Unknown,
        }
    }
}

bitflags! {
    /// Open flags (SSH_FXF_*).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Open for reading
        const READ = 0x0000_0001;
        /// Open for writing
        const WRITE = 0x0000_0002;
        /// Force writes to append
        const APPEND = 0x0000_0004;
        /// Create if missing
        const CREAT = 0x0000_0008;
        /// Truncate to zero length
        const TRUNC = 0x0000_0010;
        /// Fail if the file exists
        const EXCL = 0x0000_0020;
    }
}

/// Attribute flag bits (SSH_FILEXFER_ATTR_*).
pub struct AttrFlags;

impl AttrFlags {
    /// Size present
    pub const SIZE: u32 = 0x0000_0001;
    /// UID and GID present
    pub const UIDGID: u32 = 0x0000_0002;
    /// Permissions present
    pub const PERMISSIONS: u32 = 0x0000_0004;
    /// Access and modification time present
    pub const ACMODTIME: u32 = 0x0000_0008;
    /// Extended pairs present
    pub const EXTENDED: u32 = 0x8000_0000;
}

/// File attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileAttributes {
    /// File size in bytes
    pub size: Option<u64>,
    /// User ID
    pub uid: Option<u32>,
    /// Group ID
    pub gid: Option<u32>,
    /// Mode bits including the type
    pub permissions: Option<u32>,
    /// Access time (Unix timestamp)
    pub atime: Option<u32>,
    /// Modification time (Unix timestamp)
    pub mtime: Option<u32>,
    /// Extended name/value pairs
    pub extended: Vec<(String, String)>,
    /// Inferred file type
    pub file_type: FileType,
}

impl FileAttributes {
    /// Creates empty attributes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Permission bits without the type.
    pub fn mode(&self) -> Option<u32> {
        self.permissions.map(|p| p & 0o7777)
    }

    /// Whether the type is a directory.
    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory
    }

    /// Encodes the attribute record.
    ///
    /// UID and GID, like atime and mtime, are only sent as pairs.
    pub fn encode(&self, buf: &mut BytesMut) {
        let mut flags = 0u32;
        if self.size.is_some() {
            flags |= AttrFlags::SIZE;
        }
        if self.uid.is_some() && self.gid.is_some() {
            flags |= AttrFlags::UIDGID;
        }
        if self.permissions.is_some() {
            flags |= AttrFlags::PERMISSIONS;
        }
        if self.atime.is_some() && self.mtime.is_some() {
            flags |= AttrFlags::ACMODTIME;
        }
        if !self.extended.is_empty() {
            flags |= AttrFlags::EXTENDED;
        }

        write_u32(buf, flags);
        if let Some(size) = self.size {
            write_u64(buf, size);
        }
        if let (Some(uid), Some(gid)) = (self.uid, self.gid) {
            write_u32(buf, uid);
            write_u32(buf, gid);
        }
        if let Some(permissions) = self.permissions {
            write_u32(buf, permissions);
        }
        if let (Some(atime), Some(mtime)) = (self.atime, self.mtime) {
            write_u32(buf, atime);
            write_u32(buf, mtime);
        }
        if !self.extended.is_empty() {
            write_u32(buf, self.extended.len() as u32);
            for (name, value) in &self.extended {
                write_str(buf, name);
                write_str(buf, value);
            }
        }
    }

    /// Decodes an attribute record. The type comes from the permission
    /// bits when present.
    pub fn decode(r: &mut Reader<'_>) -> TernResult<Self> {
        let flags = r.read_u32()?;
        let mut attrs = Self::new();

        if flags & AttrFlags::SIZE != 0 {
            attrs.size = Some(r.read_u64()?);
        }
        if flags & AttrFlags::UIDGID != 0 {
            attrs.uid = Some(r.read_u32()?);
            attrs.gid = Some(r.read_u32()?);
        }
        if flags & AttrFlags::PERMISSIONS != 0 {
            let permissions = r.read_u32()?;
            attrs.permissions = Some(permissions);
            attrs.file_type = FileType::from_mode(permissions);
        }
        if flags & AttrFlags::ACMODTIME != 0 {
            attrs.atime = Some(r.read_u32()?);
            attrs.mtime = Some(r.read_u32()?);
        }
        if flags & AttrFlags::EXTENDED != 0 {
            let count = r.read_u32()? as usize;
            if count > r.remaining() / 8 {
                return Err(TernError::Protocol(format!(
                    "Attribute record claims {} extended pairs in {} bytes",
                    count,
                    r.remaining()
                )));
            }
            for _ in 0..count {
                let name = r.read_lossy()?;
                let value = r.read_lossy()?;
                attrs.extended.push((name, value));
            }
        }
        Ok(attrs)
    }
}

/// One directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Name, relative to the listed directory
    pub filename: String,
    /// `ls -l` style line (empty on some servers)
    pub longname: String,
    /// Attributes as sent in the listing
    pub attrs: FileAttributes,
}

/// Where [`put`](crate::ssh::sftp::Sftp::put) starts writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PutMode {
    /// Truncate and write from offset zero
    #[default]
    Overwrite,
    /// Write all data after the current end of the remote file
    Append,
    /// Skip as many leading bytes as the remote file already has
    Resume,
}

/// Listing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListOrder {
    /// As the server returned it
    Unsorted,
    /// By name, ascending
    #[default]
    Name,
    /// By name, descending
    NameDescending,
    /// By size, ascending
    Size,
    /// By modification time, ascending
    Modified,
}

impl ListOrder {
    /// Sorts entries in place.
    pub fn sort(self, entries: &mut [DirEntry]) {
        match self {
            ListOrder::Unsorted => {}
            ListOrder::Name => entries.sort_by(|a, b| a.filename.cmp(&b.filename)),
            ListOrder::NameDescending => entries.sort_by(|a, b| b.filename.cmp(&a.filename)),
            ListOrder::Size => entries.sort_by_key(|e| (e.attrs.size, e.filename.clone())),
            ListOrder::Modified => entries.sort_by_key(|e| (e.attrs.mtime, e.filename.clone())),
        }
    }
}

/// SFTP session configuration.
#[derive(Debug, Clone)]
pub struct SftpConfig {
    /// Bytes per READ or WRITE request
    pub chunk_size: u32,
    /// Requests kept in flight during pipelined transfers
    pub queue_depth: usize,
    /// Whether the stat cache starts enabled
    pub stat_cache: bool,
    /// Order of listings
    pub list_order: ListOrder,
}

impl Default for SftpConfig {
    fn default() -> Self {
        Self {
            chunk_size: 32 * 1024,
            queue_depth: 32,
            stat_cache: true,
            list_order: ListOrder::Name,
        }
    }
}

impl SftpConfig {
    /// Largest chunk that still fits one SFTP packet.
    pub const MAX_CHUNK_SIZE: u32 = 255 * 1024;

    /// Rejects unusable settings.
    pub fn validate(&self) -> TernResult<()> {
        if self.chunk_size == 0 || self.chunk_size > Self::MAX_CHUNK_SIZE {
            return Err(TernError::Config(format!(
                "SFTP chunk_size must be in 1..={}, got {}",
                Self::MAX_CHUNK_SIZE,
                self.chunk_size
            )));
        }
        if self.queue_depth == 0 {
            return Err(TernError::Config(
                "SFTP queue_depth must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
