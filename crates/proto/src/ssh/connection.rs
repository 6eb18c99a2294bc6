//! SSH connection protocol messages (RFC 4254).
//!
//! Wire-level structs for channel management: open/confirmation/failure,
//! data and extended data, window adjustment, EOF/close, and the channel
//! requests a session channel issues (pty-req, shell, exec, subsystem).

use crate::ssh::message::MessageType;
use crate::ssh::wire::{Reader, Writer};
use skiff_platform::{SkiffError, SkiffResult};

/// Initial receive window advertised when opening a channel.
pub const INITIAL_WINDOW_SIZE: u32 = 0x7FFF_FFFF;

/// Maximum packet size advertised when opening a channel.
pub const MAX_PACKET_SIZE: u32 = 0x4000;

/// Extended data type code for stderr.
pub const EXTENDED_DATA_STDERR: u32 = 1;

fn expect_type(r: &mut Reader<'_>, expected: MessageType) -> SkiffResult<()> {
    let kind = r.u8()?;
    if kind != expected as u8 {
        return Err(SkiffError::MalformedPacket(format!(
            "expected message {:?} ({}), got {}",
            expected, expected as u8, kind
        )));
    }
    Ok(())
}

/// SSH_MSG_CHANNEL_OPEN for a session channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpen {
    /// Our channel number.
    pub sender_channel: u32,
    /// Bytes the peer may send us before an adjust.
    pub initial_window_size: u32,
    /// Largest packet we accept.
    pub maximum_packet_size: u32,
}

impl ChannelOpen {
    /// Creates a session-channel open with the default window and packet size.
    pub fn session(sender_channel: u32) -> Self {
        Self {
            sender_channel,
            initial_window_size: INITIAL_WINDOW_SIZE,
            maximum_packet_size: MAX_PACKET_SIZE,
        }
    }

    /// Serializes the payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.u8(MessageType::ChannelOpen as u8);
        w.string(b"session");
        w.u32(self.sender_channel);
        w.u32(self.initial_window_size);
        w.u32(self.maximum_packet_size);
        w.finish()
    }
}

/// SSH_MSG_CHANNEL_OPEN_CONFIRMATION.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpenConfirmation {
    /// Our channel number, echoed back.
    pub recipient_channel: u32,
    /// The peer's channel number.
    pub sender_channel: u32,
    /// Bytes we may send before an adjust.
    pub initial_window_size: u32,
    /// Largest packet the peer accepts.
    pub maximum_packet_size: u32,
}

impl ChannelOpenConfirmation {
    /// Parses the payload.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut r = Reader::new(data);
        expect_type(&mut r, MessageType::ChannelOpenConfirmation)?;
        Ok(Self {
            recipient_channel: r.u32()?,
            sender_channel: r.u32()?,
            initial_window_size: r.u32()?,
            maximum_packet_size: r.u32()?,
        })
    }
}

/// SSH_MSG_CHANNEL_OPEN_FAILURE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpenFailure {
    /// Our channel number, echoed back.
    pub recipient_channel: u32,
    /// SSH_OPEN_* reason code.
    pub reason_code: u32,
    /// Human-readable description.
    pub description: String,
}

impl ChannelOpenFailure {
    /// Parses the payload.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut r = Reader::new(data);
        expect_type(&mut r, MessageType::ChannelOpenFailure)?;
        let recipient_channel = r.u32()?;
        let reason_code = r.u32()?;
        let description = String::from_utf8_lossy(r.string()?).into_owned();
        let _language_tag = r.string()?;
        Ok(Self {
            recipient_channel,
            reason_code,
            description,
        })
    }
}

/// SSH_MSG_CHANNEL_WINDOW_ADJUST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelWindowAdjust {
    /// The peer's channel number (on send) or ours (on receive).
    pub recipient_channel: u32,
    /// Window increment in bytes.
    pub bytes_to_add: u32,
}

impl ChannelWindowAdjust {
    /// Serializes the payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.u8(MessageType::ChannelWindowAdjust as u8);
        w.u32(self.recipient_channel);
        w.u32(self.bytes_to_add);
        w.finish()
    }

    /// Parses the payload.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut r = Reader::new(data);
        expect_type(&mut r, MessageType::ChannelWindowAdjust)?;
        Ok(Self {
            recipient_channel: r.u32()?,
            bytes_to_add: r.u32()?,
        })
    }
}

/// SSH_MSG_CHANNEL_DATA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelData {
    /// The destination channel number.
    pub recipient_channel: u32,
    /// Payload bytes.
    pub data: Vec<u8>,
}

impl ChannelData {
    /// Serializes the payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.u8(MessageType::ChannelData as u8);
        w.u32(self.recipient_channel);
        w.string(&self.data);
        w.finish()
    }

    /// Parses the payload.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut r = Reader::new(data);
        expect_type(&mut r, MessageType::ChannelData)?;
        Ok(Self {
            recipient_channel: r.u32()?,
            data: r.string()?.to_vec(),
        })
    }
}

/// SSH_MSG_CHANNEL_EXTENDED_DATA (type 1 is stderr).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelExtendedData {
    /// The destination channel number.
    pub recipient_channel: u32,
    /// Data type code; 1 for stderr.
    pub data_type_code: u32,
    /// Payload bytes.
    pub data: Vec<u8>,
}

impl ChannelExtendedData {
    /// Parses the payload.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut r = Reader::new(data);
        expect_type(&mut r, MessageType::ChannelExtendedData)?;
        Ok(Self {
            recipient_channel: r.u32()?,
            data_type_code: r.u32()?,
            data: r.string()?.to_vec(),
        })
    }
}

/// SSH_MSG_CHANNEL_EOF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelEof {
    /// The destination channel number.
    pub recipient_channel: u32,
}

impl ChannelEof {
    /// Serializes the payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.u8(MessageType::ChannelEof as u8);
        w.u32(self.recipient_channel);
        w.finish()
    }

    /// Parses the payload.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut r = Reader::new(data);
        expect_type(&mut r, MessageType::ChannelEof)?;
        Ok(Self {
            recipient_channel: r.u32()?,
        })
    }
}

/// SSH_MSG_CHANNEL_CLOSE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelClose {
    /// The destination channel number.
    pub recipient_channel: u32,
}

impl ChannelClose {
    /// Serializes the payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.u8(MessageType::ChannelClose as u8);
        w.u32(self.recipient_channel);
        w.finish()
    }

    /// Parses the payload.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut r = Reader::new(data);
        expect_type(&mut r, MessageType::ChannelClose)?;
        Ok(Self {
            recipient_channel: r.u32()?,
        })
    }
}

/// Session-channel requests this client issues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRequestType {
    /// Allocate a pseudo-terminal.
    PtyReq {
        /// TERM environment value, e.g. `vt100`.
        term: String,
        /// Terminal width in characters.
        width_chars: u32,
        /// Terminal height in rows.
        height_rows: u32,
        /// Terminal width in pixels.
        width_px: u32,
        /// Terminal height in pixels.
        height_px: u32,
    },
    /// Start the user's shell.
    Shell,
    /// Execute a single command.
    Exec {
        /// The command line.
        command: Vec<u8>,
    },
    /// Start a subsystem such as `sftp`.
    Subsystem {
        /// Subsystem name.
        name: String,
    },
}

impl ChannelRequestType {
    /// The request type name on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            ChannelRequestType::PtyReq { .. } => "pty-req",
            ChannelRequestType::Shell => "shell",
            ChannelRequestType::Exec { .. } => "exec",
            ChannelRequestType::Subsystem { .. } => "subsystem",
        }
    }
}

/// SSH_MSG_CHANNEL_REQUEST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    /// The destination channel number.
    pub recipient_channel: u32,
    /// The request.
    pub request: ChannelRequestType,
    /// Whether the peer must answer with SUCCESS/FAILURE.
    pub want_reply: bool,
}

impl ChannelRequest {
    /// Serializes the payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.u8(MessageType::ChannelRequest as u8);
        w.u32(self.recipient_channel);
        w.string(self.request.name().as_bytes());
        w.bool(self.want_reply);

        match &self.request {
            ChannelRequestType::PtyReq {
                term,
                width_chars,
                height_rows,
                width_px,
                height_px,
            } => {
                w.string(term.as_bytes());
                w.u32(*width_chars);
                w.u32(*height_rows);
                w.u32(*width_px);
                w.u32(*height_px);
                w.string(b""); // encoded terminal modes: none
            }
            ChannelRequestType::Shell => {}
            ChannelRequestType::Exec { command } => {
                w.string(command);
            }
            ChannelRequestType::Subsystem { name } => {
                w.string(name.as_bytes());
            }
        }

        w.finish()
    }
}
