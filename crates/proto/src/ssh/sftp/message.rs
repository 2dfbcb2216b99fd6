//! SFTP packet framing.
//!
//! Every SFTP packet travels inside channel data as
//! `uint32 length || byte type || payload`. Requests other than INIT carry a
//! request id right after the type.

use super::types::{DirEntry, FileAttributes, FileType};
use crate::ssh::wire::{write_u32, write_u8, Reader};
use bytes::{Buf, BytesMut};
use tern_platform::{TernError, TernResult};

/// Highest SFTP protocol version spoken.
pub const SFTP_VERSION: u32 = 3;

/// Lowest SFTP protocol version accepted.
pub const SFTP_MIN_VERSION: u32 = 2;

/// Sanity ceiling for one incoming SFTP packet.
pub const MAX_SFTP_PACKET: usize = 1024 * 1024;

/// SFTP message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SftpMessageType {
    /// SSH_FXP_INIT - Initialize SFTP session
    Init = 1,
    /// SSH_FXP_VERSION - Version response
    Version = 2,
    /// SSH_FXP_OPEN - Open file
    Open = 3,
    /// SSH_FXP_CLOSE - Close file/directory
    Close = 4,
    /// SSH_FXP_READ - Read from file
    Read = 5,
    /// SSH_FXP_WRITE - Write to file
    Write = 6,
    /// SSH_FXP_LSTAT - Get file attributes (no follow symlinks)
    LStat = 7,
    /// SSH_FXP_FSTAT - Get file attributes by handle
    FStat = 8,
    /// SSH_FXP_SETSTAT - Set file attributes
    SetStat = 9,
    /// SSH_FXP_FSETSTAT - Set file attributes by handle
    FSetStat = 10,
    /// SSH_FXP_OPENDIR - Open directory
    OpenDir = 11,
    /// SSH_FXP_READDIR - Read directory
    ReadDir = 12,
    /// SSH_FXP_REMOVE - Remove file
    Remove = 13,
    /// SSH_FXP_MKDIR - Create directory
    MkDir = 14,
    /// SSH_FXP_RMDIR - Remove directory
    RmDir = 15,
    /// SSH_FXP_REALPATH - Canonicalize path
    RealPath = 16,
    /// SSH_FXP_STAT - Get file attributes
    Stat = 17,
    /// SSH_FXP_RENAME - Rename file/directory
    Rename = 18,
    /// SSH_FXP_READLINK - Read symbolic link (v3)
    ReadLink = 19,
    /// SSH_FXP_SYMLINK - Create symbolic link (v3)
    Symlink = 20,
    /// SSH_FXP_STATUS - Status response
    Status = 101,
    /// SSH_FXP_HANDLE - File handle response
    Handle = 102,
    /// SSH_FXP_DATA - Data response
    Data = 103,
    /// SSH_FXP_NAME - Name response
    Name = 104,
    /// SSH_FXP_ATTRS - Attributes response
    Attrs = 105,
    /// SSH_FXP_EXTENDED - Extended request
    Extended = 200,
    /// SSH_FXP_EXTENDED_REPLY - Extended response
    ExtendedReply = 201,
}

impl SftpMessageType {
    /// Convert from u8.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Init),
            2 => Some(Self::Version),
            3 => Some(Self::Open),
            4 => Some(Self::Close),
            5 => Some(Self::Read),
            6 => Some(Self::Write),
            7 => Some(Self::LStat),
            8 => Some(Self::FStat),
            9 => Some(Self::SetStat),
            10 => Some(Self::FSetStat),
            11 => Some(Self::OpenDir),
            12 => Some(Self::ReadDir),
            13 => Some(Self::Remove),
            14 => Some(Self::MkDir),
            15 => Some(Self::RmDir),
            16 => Some(Self::RealPath),
            17 => Some(Self::Stat),
            18 => Some(Self::Rename),
            19 => Some(Self::ReadLink),
            20 => Some(Self::Symlink),
            101 => Some(Self::Status),
            102 => Some(Self::Handle),
            103 => Some(Self::Data),
            104 => Some(Self::Name),
            105 => Some(Self::Attrs),
            200 => Some(Self::Extended),
            201 => Some(Self::ExtendedReply),
            _ => None,
        }
    }

    /// Lower-case name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Version => "version",
            Self::Open => "open",
            Self::Close => "close",
            Self::Read => "read",
            Self::Write => "write",
            Self::LStat => "lstat",
            Self::FStat => "fstat",
            Self::SetStat => "setstat",
            Self::FSetStat => "fsetstat",
            Self::OpenDir => "opendir",
            Self::ReadDir => "readdir",
            Self::Remove => "remove",
            Self::MkDir => "mkdir",
            Self::RmDir => "rmdir",
            Self::RealPath => "realpath",
            Self::Stat => "stat",
            Self::Rename => "rename",
            Self::ReadLink => "readlink",
            Self::Symlink => "symlink",
            Self::Status => "status",
            Self::Handle => "handle",
            Self::Data => "data",
            Self::Name => "name",
            Self::Attrs => "attrs",
            Self::Extended => "extended",
            Self::ExtendedReply => "extended-reply",
        }
    }
}

/// Frames a request: length, type, request id, then whatever `body` writes.
pub fn frame_request<F>(kind: SftpMessageType, request_id: u32, body: F) -> Vec<u8>
where
    F: FnOnce(&mut BytesMut),
{
    let mut buf = BytesMut::with_capacity(64);
    write_u32(&mut buf, 0);
    write_u8(&mut buf, kind as u8);
    write_u32(&mut buf, request_id);
    body(&mut buf);
    finish_frame(buf)
}

/// Frames SSH_FXP_INIT.
pub fn frame_init(version: u32) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(9);
    write_u32(&mut buf, 0);
    write_u8(&mut buf, SftpMessageType::Init as u8);
    write_u32(&mut buf, version);
    finish_frame(buf)
}

fn finish_frame(mut buf: BytesMut) -> Vec<u8> {
    let len = (buf.len() - 4) as u32;
    buf[..4].copy_from_slice(&len.to_be_bytes());
    buf.to_vec()
}

/// A decoded server packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// SSH_FXP_VERSION
    Version {
        /// Server protocol version
        version: u32,
        /// Extension name/data pairs
        extensions: Vec<(String, String)>,
    },
    /// SSH_FXP_STATUS
    Status {
        /// Request id
        id: u32,
        /// SSH_FX_* code
        code: u32,
        /// Server text
        message: String,
    },
    /// SSH_FXP_HANDLE
    Handle {
        /// Request id
        id: u32,
        /// Opaque handle
        handle: Vec<u8>,
    },
    /// SSH_FXP_DATA
    Data {
        /// Request id
        id: u32,
        /// File bytes
        data: Vec<u8>,
    },
    /// SSH_FXP_NAME
    Name {
        /// Request id
        id: u32,
        /// Entries
        entries: Vec<DirEntry>,
    },
    /// SSH_FXP_ATTRS
    Attrs {
        /// Request id
        id: u32,
        /// Attributes
        attrs: FileAttributes,
    },
    /// SSH_FXP_EXTENDED_REPLY
    ExtendedReply {
        /// Request id
        id: u32,
        /// Raw reply data
        data: Vec<u8>,
    },
}

impl Response {
    /// Decodes one packet body (type byte first, length already stripped).
    pub fn parse(body: &[u8]) -> TernResult<Self> {
        let mut r = Reader::new(body);
        let kind = r.read_u8()?;
        let kind = SftpMessageType::from_u8(kind)
            .ok_or_else(|| TernError::Protocol(format!("Unknown SFTP message type: {}", kind)))?;

        let response = match kind {
            SftpMessageType::Version => {
                let version = r.read_u32()?;
                let mut extensions = Vec::new();
                while !r.is_empty() {
                    let name = r.read_lossy()?;
                    let data = r.read_lossy()?;
                    extensions.push((name, data));
                }
                Response::Version {
                    version,
                    extensions,
                }
            }
            SftpMessageType::Status => {
                let id = r.read_u32()?;
                let code = r.read_u32()?;
                // Version 2 servers may omit the message and language tag.
                let message = if r.is_empty() {
                    String::new()
                } else {
                    r.read_lossy()?
                };
                Response::Status { id, code, message }
            }
            SftpMessageType::Handle => Response::Handle {
                id: r.read_u32()?,
                handle: r.read_string()?.to_vec(),
            },
            SftpMessageType::Data => Response::Data {
                id: r.read_u32()?,
                data: r.read_string()?.to_vec(),
            },
            SftpMessageType::Name => {
                let id = r.read_u32()?;
                let count = r.read_u32()? as usize;
                if count > r.remaining() / 12 {
                    return Err(TernError::Protocol(format!(
                        "SSH_FXP_NAME claims {} entries in {} bytes",
                        count,
                        r.remaining()
                    )));
                }
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let filename = r.read_lossy()?;
                    let longname = r.read_lossy()?;
                    let mut attrs = FileAttributes::decode(&mut r)?;
                    if attrs.permissions.is_none() {
                        attrs.file_type = FileType::from_longname(&longname);
                    }
                    entries.push(DirEntry {
                        filename,
                        longname,
                        attrs,
                    });
                }
                Response::Name { id, entries }
            }
            SftpMessageType::Attrs => Response::Attrs {
                id: r.read_u32()?,
                attrs: FileAttributes::decode(&mut r)?,
            },
            SftpMessageType::ExtendedReply => Response::ExtendedReply {
                id: r.read_u32()?,
                data: r.read_rest().to_vec(),
            },
            other => {
                return Err(TernError::Protocol(format!(
                    "Unexpected SFTP request type from server: {}",
                    other.name()
                )))
            }
        };
        Ok(response)
    }

    /// Request id the response answers (`None` for VERSION).
    pub fn id(&self) -> Option<u32> {
        match self {
            Response::Version { .. } => None,
            Response::Status { id, .. }
            | Response::Handle { id, .. }
            | Response::Data { id, .. }
            | Response::Name { id, .. }
            | Response::Attrs { id, .. }
            | Response::ExtendedReply { id, .. } => Some(*id),
        }
    }
}

/// Reassembles SFTP packets from channel data chunks.
#[derive(Debug, Default)]
pub struct PacketBuffer {
    buf: BytesMut,
}

impl PacketBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends channel data.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Takes the next complete packet body, if one is buffered.
    pub fn next_packet(&mut self) -> TernResult<Option<Vec<u8>>> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len == 0 || len > MAX_SFTP_PACKET {
            return Err(TernError::Protocol(format!(
                "Invalid SFTP packet length {}",
                len
            )));
        }
        if self.buf.len() < 4 + len {
            return Ok(None);
        }
        self.buf.advance(4);
        Ok(Some(self.buf.split_to(len).to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::wire::{write_str, write_string};

    #[test]
    fn test_message_type_conversion() {
        assert_eq!(SftpMessageType::from_u8(1), Some(SftpMessageType::Init));
        assert_eq!(SftpMessageType::from_u8(101), Some(SftpMessageType::Status));
        assert_eq!(SftpMessageType::from_u8(255), None);
    }

    #[test]
    fn test_request_framing() {
        let bytes = frame_request(SftpMessageType::Stat, 7, |b| write_str(b, "/tmp"));
        // length (4) + type (1) + id (4) + string (4 + 4)
        assert_eq!(bytes.len(), 17);
        assert_eq!(&bytes[..4], &13u32.to_be_bytes());
        assert_eq!(bytes[4], 17);
        assert_eq!(&bytes[5..9], &7u32.to_be_bytes());

        let init = frame_init(3);
        assert_eq!(init, vec![0, 0, 0, 5, 1, 0, 0, 0, 3]);
    }

    #[test]
    fn test_parse_version_with_extensions() {
        let mut buf = BytesMut::new();
        write_u8(&mut buf, 2);
        write_u32(&mut buf, 3);
        write_str(&mut buf, "posix-rename@openssh.com");
        write_str(&mut buf, "1");
        match Response::parse(&buf).unwrap() {
            Response::Version {
                version,
                extensions,
            } => {
                assert_eq!(version, 3);
                assert_eq!(extensions[0].0, "posix-rename@openssh.com");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_short_status() {
        let buf = [101, 0, 0, 0, 9, 0, 0, 0, 1];
        assert_eq!(
            Response::parse(&buf).unwrap(),
            Response::Status {
                id: 9,
                code: 1,
                message: String::new()
            }
        );
    }

    #[test]
    fn test_parse_name_uses_longname_without_permissions() {
        let mut buf = BytesMut::new();
        write_u8(&mut buf, 104);
        write_u32(&mut buf, 1);
        write_u32(&mut buf, 1);
        write_str(&mut buf, "docs");
        write_str(&mut buf, "drwxr-xr-x 2 u g 4096 Jan 1 00:00 docs");
        write_u32(&mut buf, 0);
        match Response::parse(&buf).unwrap() {
            Response::Name { id, entries } => {
                assert_eq!(id, 1);
                assert_eq!(entries[0].attrs.file_type, FileType::Directory);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_packet_buffer_reassembly() {
        let mut body = BytesMut::new();
        write_u8(&mut body, 103);
        write_u32(&mut body, 4);
        write_string(&mut body, b"hello");
        let mut framed = (body.len() as u32).to_be_bytes().to_vec();
        framed.extend_from_slice(&body);

        let mut pb = PacketBuffer::new();
        pb.push(&framed[..6]);
        assert!(pb.next_packet().unwrap().is_none());
        pb.push(&framed[6..]);
        pb.push(&framed);
        assert_eq!(pb.next_packet().unwrap().unwrap(), body.to_vec());
        assert_eq!(pb.next_packet().unwrap().unwrap(), body.to_vec());
        assert!(pb.next_packet().unwrap().is_none());
    }

    #[test]
    fn test_packet_buffer_rejects_huge_length() {
        let mut pb = PacketBuffer::new();
        pb.push(&[0xff, 0xff, 0xff, 0xff, 1]);
        assert!(pb.next_packet().is_err());
    }
}
