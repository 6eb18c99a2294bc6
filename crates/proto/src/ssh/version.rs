//! SSH identification string exchange (RFC 4253 Section 4.2).
//!
//! Each side opens the connection with a single line:
//!
//! ```text
//! SSH-protoversion-softwareversion SP comments CR LF
//! ```
//!
//! The server may precede its identification with arbitrary banner lines,
//! which a client must read and discard. The line itself (without CR LF) is
//! kept verbatim because it feeds the key-exchange hash.
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::version::Version;
//!
//! let version = Version::new("Skiff_0.1.0", None);
//! assert_eq!(version.to_string(), "SSH-2.0-Skiff_0.1.0");
//!
//! let parsed = Version::parse("SSH-2.0-OpenSSH_8.9\r\n").unwrap();
//! assert_eq!(parsed.software(), "OpenSSH_8.9");
//! ```

use skiff_platform::{SkiffError, SkiffResult};

/// Maximum length of the identification line, CR LF excluded (RFC 4253).
pub const MAX_IDENT_LENGTH: usize = 255;

/// An SSH identification string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    proto_version: String,
    software_version: String,
    comments: Option<String>,
}

impl Version {
    /// Creates an identification string with protocol version 2.0.
    pub fn new(software: &str, comments: Option<&str>) -> Self {
        Self {
            proto_version: "2.0".to_string(),
            software_version: software.to_string(),
            comments: comments.map(String::from),
        }
    }

    /// The identification string this library sends.
    pub fn default_skiff() -> Self {
        Self::new(&format!("Skiff_{}", env!("CARGO_PKG_VERSION")), None)
    }

    /// Parses a peer identification line.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::BadIdent`] if the line exceeds 255 bytes, does
    /// not start with `SSH-`, advertises a protocol version other than 2.0
    /// or 1.99, or contains a NUL byte.
    pub fn parse(line: &str) -> SkiffResult<Self> {
        let line = line.trim_end_matches('\n').trim_end_matches('\r');

        if line.len() > MAX_IDENT_LENGTH {
            return Err(SkiffError::BadIdent(format!(
                "identification line is {} bytes (maximum {})",
                line.len(),
                MAX_IDENT_LENGTH
            )));
        }

        if line.contains('\0') {
            return Err(SkiffError::BadIdent(
                "identification line contains NUL".to_string(),
            ));
        }

        if !line.starts_with("SSH-") {
            return Err(SkiffError::BadIdent(format!(
                "expected line starting with 'SSH-', got '{}'",
                line
            )));
        }

        let parts: Vec<&str> = line.splitn(3, '-').collect();
        if parts.len() < 3 {
            return Err(SkiffError::BadIdent(format!(
                "unparseable identification line '{}'",
                line
            )));
        }

        let proto_version = parts[1];
        if proto_version != "2.0" && proto_version != "1.99" {
            return Err(SkiffError::BadIdent(format!(
                "unsupported protocol version '{}'",
                proto_version
            )));
        }

        let rest = parts[2];
        let (software_version, comments) = match rest.find(' ') {
            Some(pos) => (rest[..pos].to_string(), Some(rest[pos + 1..].to_string())),
            None => (rest.to_string(), None),
        };

        Ok(Self {
            proto_version: proto_version.to_string(),
            software_version,
            comments,
        })
    }

    /// Whether a received line is a pre-identification banner line.
    ///
    /// Servers may send any number of such lines before the real
    /// identification; they are read and discarded.
    pub fn is_banner_line(line: &str) -> bool {
        !line.starts_with("SSH-")
    }

    /// The protocol version, `"2.0"` or `"1.99"`.
    pub fn proto_version(&self) -> &str {
        &self.proto_version
    }

    /// The software version field.
    pub fn software(&self) -> &str {
        &self.software_version
    }

    /// The optional comments field.
    pub fn comments(&self) -> Option<&str> {
        self.comments.as_deref()
    }

    /// The line as sent on the wire, CR LF included.
    pub fn to_wire_format(&self) -> Vec<u8> {
        format!("{}\r\n", self).into_bytes()
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SSH-{}-{}", self.proto_version, self.software_version)?;
        if let Some(comments) = &self.comments {
            write!(f, " {}", comments)?;
        }
        Ok(())
    }
}
