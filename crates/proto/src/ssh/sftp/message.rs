//! SFTP message framing.
//!
//! Every SFTP message is `uint32 length || byte type || body` where the
//! length counts the type byte and body. Messages ride inside
//! SSH_MSG_CHANNEL_DATA and may be split or coalesced arbitrarily by the
//! channel layer, so received bytes go through a reassembly buffer.

use crate::ssh::wire::Writer;
use skiff_platform::{SkiffError, SkiffResult};

/// The SFTP protocol version this client speaks.
pub const SFTP_VERSION: u32 = 3;

/// SFTP message types (SSH_FXP_*).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SftpMessageType {
    /// Client hello.
    Init = 1,
    /// Server hello.
    Version = 2,
    /// Open a file.
    Open = 3,
    /// Release a handle.
    Close = 4,
    /// Read from a file handle.
    Read = 5,
    /// Write to a file handle.
    Write = 6,
    /// Stat without following symlinks.
    Lstat = 7,
    /// Stat by handle.
    Fstat = 8,
    /// Set attributes by path.
    Setstat = 9,
    /// Set attributes by handle.
    Fsetstat = 10,
    /// Open a directory.
    Opendir = 11,
    /// Read directory entries.
    Readdir = 12,
    /// Delete a file.
    Remove = 13,
    /// Create a directory.
    Mkdir = 14,
    /// Delete a directory.
    Rmdir = 15,
    /// Canonicalise a path.
    Realpath = 16,
    /// Stat following symlinks.
    Stat = 17,
    /// Rename a file or directory.
    Rename = 18,
    /// Status response.
    Status = 101,
    /// Handle response.
    Handle = 102,
    /// Data response.
    Data = 103,
    /// Name-list response.
    Name = 104,
    /// Attributes response.
    Attrs = 105,
}

impl SftpMessageType {
    /// Converts a wire byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        use SftpMessageType::*;
        Some(match value {
            1 => Init,
            2 => Version,
            3 => Open,
            4 => Close,
            5 => Read,
            6 => Write,
            7 => Lstat,
            8 => Fstat,
            9 => Setstat,
            10 => Fsetstat,
            11 => Opendir,
            12 => Readdir,
            13 => Remove,
            14 => Mkdir,
            15 => Rmdir,
            16 => Realpath,
            17 => Stat,
            18 => Rename,
            101 => Status,
            102 => Handle,
            103 => Data,
            104 => Name,
            105 => Attrs,
            _ => return None,
        })
    }
}

/// One framed SFTP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SftpMessage {
    /// The message type.
    pub msg_type: SftpMessageType,
    /// Everything after the type byte (request id first, except for
    /// INIT/VERSION).
    pub payload: Vec<u8>,
}

impl SftpMessage {
    /// Creates a message.
    pub fn new(msg_type: SftpMessageType, payload: Vec<u8>) -> Self {
        Self { msg_type, payload }
    }

    /// Serializes with the length prefix.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.u32(1 + self.payload.len() as u32);
        w.u8(self.msg_type as u8);
        w.raw(&self.payload);
        w.finish()
    }
}

/// Reassembles SFTP messages from channel data chunks.
#[derive(Debug, Default)]
pub struct SftpInbox {
    buffer: Vec<u8>,
}

impl SftpInbox {
    /// Creates an empty inbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends received channel bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Pops the next complete message, if one is buffered.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::MalformedPacket`] for a zero length field or
    /// an unknown message type.
    pub fn next_message(&mut self) -> SkiffResult<Option<SftpMessage>> {
        if self.buffer.len() < 4 {
            return Ok(None);
        }
        let length = u32::from_be_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]) as usize;
        if length == 0 {
            return Err(SkiffError::MalformedPacket(
                "zero-length SFTP message".to_string(),
            ));
        }
        if self.buffer.len() < 4 + length {
            return Ok(None);
        }

        let type_byte = self.buffer[4];
        let msg_type = SftpMessageType::from_u8(type_byte).ok_or_else(|| {
            SkiffError::MalformedPacket(format!("unknown SFTP message type {}", type_byte))
        })?;
        let payload = self.buffer[5..4 + length].to_vec();
        self.buffer.drain(..4 + length);

        Ok(Some(SftpMessage { msg_type, payload }))
    }
}
