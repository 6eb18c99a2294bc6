//! SFTP data types (draft-ietf-secsh-filexfer-02 Section 5).

use crate::ssh::wire::{Reader, Writer};
use skiff_platform::{SkiffError, SkiffResult};

/// SFTP status codes (SSH_FX_*).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SftpErrorCode {
    /// SSH_FX_OK
    Ok = 0,
    /// SSH_FX_EOF
    Eof = 1,
    /// SSH_FX_NO_SUCH_FILE
    NoSuchFile = 2,
    /// SSH_FX_PERMISSION_DENIED
    PermissionDenied = 3,
    /// SSH_FX_FAILURE
    Failure = 4,
    /// SSH_FX_BAD_MESSAGE
    BadMessage = 5,
    /// SSH_FX_NO_CONNECTION
    NoConnection = 6,
    /// SSH_FX_CONNECTION_LOST
    ConnectionLost = 7,
    /// SSH_FX_OP_UNSUPPORTED
    OpUnsupported = 8,
}

impl SftpErrorCode {
    /// Converts a wire code.
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0 => Self::Ok,
            1 => Self::Eof,
            2 => Self::NoSuchFile,
            3 => Self::PermissionDenied,
            4 => Self::Failure,
            5 => Self::BadMessage,
            6 => Self::NoConnection,
            7 => Self::ConnectionLost,
            8 => Self::OpUnsupported,
            _ => return None,
        })
    }
}

/// File attribute presence flags (SSH_FILEXFER_ATTR_*).
#[derive(Debug, Clone, Copy)]
pub struct AttrFlags;

impl AttrFlags {
    /// Size field present.
    pub const SIZE: u32 = 0x0000_0001;
    /// uid/gid fields present.
    pub const UIDGID: u32 = 0x0000_0002;
    /// Permissions field present.
    pub const PERMISSIONS: u32 = 0x0000_0004;
    /// atime/mtime fields present.
    pub const ACMODTIME: u32 = 0x0000_0008;
    /// Extended attribute pairs present.
    pub const EXTENDED: u32 = 0x8000_0000;
}

/// File open flags (SSH_FXF_*).
#[derive(Debug, Clone, Copy)]
pub struct FileOpenFlags;

impl FileOpenFlags {
    /// Open for reading.
    pub const READ: u32 = 0x0000_0001;
    /// Open for writing.
    pub const WRITE: u32 = 0x0000_0002;
    /// Writes append.
    pub const APPEND: u32 = 0x0000_0004;
    /// Create if missing.
    pub const CREAT: u32 = 0x0000_0008;
    /// Truncate to zero length.
    pub const TRUNC: u32 = 0x0000_0010;
    /// Fail if the file exists.
    pub const EXCL: u32 = 0x0000_0020;
}

/// POSIX mode bits used for type checks on `permissions`.
pub const S_IFMT: u32 = 0o170000;
/// Regular file.
pub const S_IFREG: u32 = 0o100000;
/// Directory.
pub const S_IFDIR: u32 = 0o040000;

/// File attributes; only flagged fields travel on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileAttributes {
    /// File size in bytes.
    pub size: Option<u64>,
    /// Owner uid.
    pub uid: Option<u32>,
    /// Owner gid.
    pub gid: Option<u32>,
    /// POSIX permissions (with file type bits).
    pub permissions: Option<u32>,
    /// Access time, seconds since the epoch.
    pub atime: Option<u32>,
    /// Modification time, seconds since the epoch.
    pub mtime: Option<u32>,
}

impl FileAttributes {
    /// Empty attributes (no fields flagged).
    pub fn new() -> Self {
        Self::default()
    }

    /// Serializes to the wire layout.
    pub fn to_bytes(&self) -> Vec<u8> {
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

        let mut w = Writer::new();
        w.u32(flags);
        if let Some(size) = self.size {
            w.u64(size);
        }
        if let (Some(uid), Some(gid)) = (self.uid, self.gid) {
            w.u32(uid);
            w.u32(gid);
        }
        if let Some(permissions) = self.permissions {
            w.u32(permissions);
        }
        if let (Some(atime), Some(mtime)) = (self.atime, self.mtime) {
            w.u32(atime);
            w.u32(mtime);
        }
        w.finish()
    }

    /// Parses attributes from a reader positioned at the flags field.
    pub fn read_from(r: &mut Reader<'_>) -> SkiffResult<Self> {
        let flags = r.u32()?;
        let mut attrs = Self::new();

        if flags & AttrFlags::SIZE != 0 {
            attrs.size = Some(r.u64()?);
        }
        if flags & AttrFlags::UIDGID != 0 {
            attrs.uid = Some(r.u32()?);
            attrs.gid = Some(r.u32()?);
        }
        if flags & AttrFlags::PERMISSIONS != 0 {
            attrs.permissions = Some(r.u32()?);
        }
        if flags & AttrFlags::ACMODTIME != 0 {
            attrs.atime = Some(r.u32()?);
            attrs.mtime = Some(r.u32()?);
        }
        if flags & AttrFlags::EXTENDED != 0 {
            let count = r.u32()?;
            for _ in 0..count {
                let _type = r.string()?;
                let _data = r.string()?;
            }
        }

        Ok(attrs)
    }

    /// Parses attributes from a byte slice.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut r = Reader::new(data);
        Self::read_from(&mut r)
    }

    /// Whether the permissions mark a regular file.
    pub fn is_file(&self) -> bool {
        self.permissions
            .map(|p| p & S_IFMT == S_IFREG)
            .unwrap_or(false)
    }

    /// Whether the permissions mark a directory.
    pub fn is_dir(&self) -> bool {
        self.permissions
            .map(|p| p & S_IFMT == S_IFDIR)
            .unwrap_or(false)
    }
}

/// Maps a non-OK status code to the library error.
pub fn status_error(code: u32, message: String) -> SkiffError {
    SkiffError::SftpStatus { code, message }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(SftpErrorCode::from_u32(0), Some(SftpErrorCode::Ok));
        assert_eq!(SftpErrorCode::from_u32(1), Some(SftpErrorCode::Eof));
        assert_eq!(SftpErrorCode::from_u32(8), Some(SftpErrorCode::OpUnsupported));
        assert_eq!(SftpErrorCode::from_u32(99), None);
    }

    #[test]
    fn test_attrs_round_trip_all_fields() {
        let attrs = FileAttributes {
            size: Some(30001),
            uid: Some(1000),
            gid: Some(1000),
            permissions: Some(0o100644),
            atime: Some(1_700_000_000),
            mtime: Some(1_700_000_001),
        };
        let parsed = FileAttributes::from_bytes(&attrs.to_bytes()).unwrap();
        assert_eq!(parsed, attrs);
    }

    #[test]
    fn test_attrs_only_flagged_fields_travel() {
        let attrs = FileAttributes {
            permissions: Some(0o644),
            ..Default::default()
        };
        let bytes = attrs.to_bytes();
        // flags + permissions, nothing else
        assert_eq!(bytes.len(), 8);
        assert_eq!(&bytes[..4], &AttrFlags::PERMISSIONS.to_be_bytes());
    }

    #[test]
    fn test_attrs_empty() {
        let bytes = FileAttributes::new().to_bytes();
        assert_eq!(bytes, vec![0, 0, 0, 0]);
        assert_eq!(
            FileAttributes::from_bytes(&bytes).unwrap(),
            FileAttributes::new()
        );
    }

    #[test]
    fn test_file_type_checks() {
        let file = FileAttributes {
            permissions: Some(S_IFREG | 0o644),
            ..Default::default()
        };
        assert!(file.is_file());
        assert!(!file.is_dir());

        let dir = FileAttributes {
            permissions: Some(S_IFDIR | 0o755),
            ..Default::default()
        };
        assert!(dir.is_dir());
        assert!(!dir.is_file());

        assert!(!FileAttributes::new().is_file());
    }

    #[test]
    fn test_status_error() {
        let err = status_error(3, "Permission denied".to_string());
        assert!(matches!(err, SkiffError::SftpStatus { code: 3, .. }));
    }
}
