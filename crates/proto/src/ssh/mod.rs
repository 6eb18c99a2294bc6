//! Client-side SSH-2 protocol implementation.
//!
//! The stack is layered the way the RFCs slice it:
//!
//! 1. **Wire codec** ([`wire`]) - strings, mpints, name-lists, PEM bridge
//! 2. **Packet layer** ([`packet`]) - binary packet framing (RFC 4253 §6)
//! 3. **Transport** ([`transport`], [`kex`], [`kex_dh`], [`crypto`],
//!    [`hostkey`], [`version`]) - identification, key exchange, classic
//!    CBC + HMAC encryption, rekeying
//! 4. **Authentication** ([`auth`]) - password and publickey (RFC 4252)
//! 5. **Connection** ([`connection`], [`channel`]) - multiplexed channels
//!    with window flow control (RFC 4254)
//! 6. **Session API** ([`client`]) - one object driving one connection
//! 7. **SFTP** ([`sftp`]) - SFTP v3 subsystem client
//!
//! The key store ([`privatekey`]) reads and writes PEM DSA/RSA keys and
//! signs user-authentication challenges.
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - Authentication
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - Transport
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - Connection
//! - [draft-ietf-secsh-filexfer-02](https://datatracker.ietf.org/doc/html/draft-ietf-secsh-filexfer-02) - SFTP v3

pub mod auth;
pub mod channel;
pub mod client;
pub mod connection;
pub mod crypto;
pub mod hostkey;
pub mod kex;
pub mod kex_dh;
pub mod message;
pub mod packet;
pub mod privatekey;
pub mod sftp;
pub mod transport;
pub mod version;
pub mod wire;

pub use auth::{AuthBanner, AuthFailure, AuthMethod, AuthPkOk, AuthRequest};
pub use channel::{ChannelState, SshChannel};
pub use client::{SshClient, SshClientConfig};
pub use connection::{
    ChannelClose, ChannelData, ChannelEof, ChannelExtendedData, ChannelOpen,
    ChannelOpenConfirmation, ChannelOpenFailure, ChannelRequest, ChannelRequestType,
    ChannelWindowAdjust, INITIAL_WINDOW_SIZE, MAX_PACKET_SIZE as CHANNEL_MAX_PACKET_SIZE,
};
pub use crypto::{CipherAlgorithm, DecryptionKey, EncryptionKey, MacAlgorithm, MacKey};
pub use hostkey::HostKey;
pub use kex::{negotiate_algorithm, KexInit, NewKeys};
pub use kex_dh::{derive_key, exchange_hash, DhExchange, DhGroup, KexdhInit, KexdhReply};
pub use message::MessageType;
pub use packet::Packet;
pub use privatekey::KeyPair;
pub use sftp::{FileAttributes, FileOpenMode, SftpSession};
pub use transport::{State, TransportConfig, TransportState};
pub use version::Version;
