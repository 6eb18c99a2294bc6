//! Error types for Skiff.

use std::fmt;
use std::sync::Mutex;

/// Unified error type for all Skiff operations.
///
/// Every failure the library can report maps to exactly one of these kinds;
/// the transport marks the session closed on any transport-level variant,
/// channel-level variants close only the affected channel, and
/// [`SkiffError::SftpStatus`] leaves the channel open.
#[derive(Debug)]
pub enum SkiffError {
    /// Socket connect/read/write failure.
    Network(std::io::Error),

    /// The peer's identification line is not a usable SSH-2.0 ident.
    BadIdent(String),

    /// A packet or wire-format field could not be decoded.
    MalformedPacket(String),

    /// MAC verification failed on a received packet.
    BadMac,

    /// Algorithm negotiation found no name present on both sides.
    NoCommonAlgorithm(String),

    /// The server's host key or its signature over the exchange hash is bad.
    BadHostKey(String),

    /// The server rejected authentication.
    AuthFailed {
        /// Authentication methods the server says may continue.
        methods: String,
        /// Whether the attempt was a partial success.
        partial: bool,
    },

    /// The server refused to open a channel.
    ChannelOpenRejected(String),

    /// Operation on an unknown or already-closed channel.
    ChannelClosed,

    /// A blocking operation ran past its deadline.
    Timeout,

    /// The SFTP server advertised an unusable protocol version.
    SftpVersion(u32),

    /// An SFTP request came back with a non-OK, non-EOF status.
    SftpStatus {
        /// SSH_FX_* status code.
        code: u32,
        /// Server-supplied message.
        message: String,
    },

    /// Key generation was asked for an unsupported key size.
    InvalidKeySize(String),

    /// A key file is not one of the known PEM formats.
    UnknownKeyFormat,

    /// A key file decoded but its contents are unusable.
    MalformedKey(String),

    /// A private key file is readable or writable by group/others.
    InsecureKeyFile(String),

    /// A DSS signature was not the required 40 bytes.
    SignatureLength(usize),

    /// Local file I/O failure (key files, SFTP get/put targets).
    IoFile(std::io::Error),
}

impl fmt::Display for SkiffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkiffError::Network(e) => write!(f, "network error: {}", e),
            SkiffError::BadIdent(msg) => write!(f, "bad identification string: {}", msg),
            SkiffError::MalformedPacket(msg) => write!(f, "malformed packet: {}", msg),
            SkiffError::BadMac => write!(f, "packet MAC verification failed"),
            SkiffError::NoCommonAlgorithm(slot) => {
                write!(f, "no common algorithm for {}", slot)
            }
            SkiffError::BadHostKey(msg) => write!(f, "host key verification failed: {}", msg),
            SkiffError::AuthFailed { methods, partial } => write!(
                f,
                "authentication failed (partial success: {}), methods that can continue: {}",
                partial, methods
            ),
            SkiffError::ChannelOpenRejected(msg) => write!(f, "channel open rejected: {}", msg),
            SkiffError::ChannelClosed => write!(f, "channel is closed"),
            SkiffError::Timeout => write!(f, "operation timed out"),
            SkiffError::SftpVersion(v) => {
                write!(f, "SFTP server offered unsupported version {}", v)
            }
            SkiffError::SftpStatus { code, message } => {
                write!(f, "SFTP status {}: {}", code, message)
            }
            SkiffError::InvalidKeySize(msg) => write!(f, "invalid key size: {}", msg),
            SkiffError::UnknownKeyFormat => write!(f, "unknown private key file format"),
            SkiffError::MalformedKey(msg) => write!(f, "malformed key: {}", msg),
            SkiffError::InsecureKeyFile(path) => write!(
                f,
                "private key file permissions are read/write by others: {}",
                path
            ),
            SkiffError::SignatureLength(len) => write!(
                f,
                "DSS signature block is {} bytes, expected 40; use 1024-bit keys",
                len
            ),
            SkiffError::IoFile(e) => write!(f, "file I/O error: {}", e),
        }
    }
}

impl std::error::Error for SkiffError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SkiffError::Network(e) | SkiffError::IoFile(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for SkiffError {
    fn from(err: std::io::Error) -> Self {
        SkiffError::Network(err)
    }
}

/// Result type for Skiff operations.
pub type SkiffResult<T> = Result<T, SkiffError>;

/// One entry in the diagnostic sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRecord {
    /// Channel the failure belongs to, or -1 for session/global scope.
    pub channel: i32,
    /// Human-readable description.
    pub message: String,
}

/// Append-only diagnostic sink.
///
/// The session worker pushes a record for every error it reports; callers
/// drain the records whenever an API returns "failed, consult the sink".
#[derive(Debug, Default)]
pub struct ErrorLog {
    records: Mutex<Vec<ErrorRecord>>,
}

impl ErrorLog {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a record.
    pub fn push(&self, channel: i32, message: impl Into<String>) {
        self.records.lock().unwrap().push(ErrorRecord {
            channel,
            message: message.into(),
        });
    }

    /// Returns the most recent record without removing it.
    pub fn last(&self) -> Option<ErrorRecord> {
        self.records.lock().unwrap().last().cloned()
    }

    /// Removes and returns all records accumulated so far.
    pub fn drain(&self) -> Vec<ErrorRecord> {
        std::mem::take(&mut *self.records.lock().unwrap())
    }

    /// Number of records currently held.
    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    /// Whether the sink is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SkiffError::SignatureLength(39);
        assert!(err.to_string().contains("39"));

        let err = SkiffError::SftpStatus {
            code: 3,
            message: "Permission denied".to_string(),
        };
        assert_eq!(err.to_string(), "SFTP status 3: Permission denied");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err: SkiffError = io_err.into();
        assert!(matches!(err, SkiffError::Network(_)));
    }

    #[test]
    fn test_error_log_push_drain() {
        let log = ErrorLog::new();
        assert!(log.is_empty());

        log.push(-1, "session failure");
        log.push(0, "channel failure");
        assert_eq!(log.len(), 2);
        assert_eq!(log.last().unwrap().channel, 0);

        let records = log.drain();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].message, "session failure");
        assert!(log.is_empty());
    }
}
