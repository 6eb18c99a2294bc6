//! SSH algorithm negotiation (RFC 4253 Section 7).
//!
//! Both sides open with SSH_MSG_KEXINIT carrying their algorithm preference
//! lists; for every slot the negotiated algorithm is the first client name
//! that also appears in the server list. The raw KEXINIT payloads of both
//! sides are retained by the caller because they feed the exchange hash.
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::kex::{KexInit, NewKeys};
//!
//! let kexinit = KexInit::new_default();
//! assert!(kexinit
//!     .kex_algorithms()
//!     .contains(&"diffie-hellman-group14-sha1".to_string()));
//!
//! let newkeys = NewKeys::new();
//! assert_eq!(newkeys.to_bytes(), vec![21]);
//! ```

use crate::ssh::crypto::{CIPHER_PREFERENCE, MAC_PREFERENCE};
use crate::ssh::message::MessageType;
use crate::ssh::wire::{Reader, Writer};
use rand::RngCore;
use skiff_platform::{SkiffError, SkiffResult};

/// SSH_MSG_KEXINIT (RFC 4253 Section 7.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexInit {
    cookie: [u8; 16],
    kex_algorithms: Vec<String>,
    server_host_key_algorithms: Vec<String>,
    encryption_algorithms_client_to_server: Vec<String>,
    encryption_algorithms_server_to_client: Vec<String>,
    mac_algorithms_client_to_server: Vec<String>,
    mac_algorithms_server_to_client: Vec<String>,
    compression_algorithms_client_to_server: Vec<String>,
    compression_algorithms_server_to_client: Vec<String>,
    languages_client_to_server: Vec<String>,
    languages_server_to_client: Vec<String>,
    first_kex_packet_follows: bool,
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl KexInit {
    /// Creates a KEXINIT with this library's default algorithm lists.
    ///
    /// - KEX: diffie-hellman-group1-sha1, diffie-hellman-group14-sha1
    /// - Host key: ssh-dss, ssh-rsa
    /// - Encryption: the CBC family, AES-256 first
    /// - MAC: hmac-md5, hmac-sha1, none
    /// - Compression: none
    pub fn new_default() -> Self {
        let mut cookie = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut cookie);

        Self {
            cookie,
            kex_algorithms: names(&[
                "diffie-hellman-group1-sha1",
                "diffie-hellman-group14-sha1",
            ]),
            server_host_key_algorithms: names(&["ssh-dss", "ssh-rsa"]),
            encryption_algorithms_client_to_server: names(CIPHER_PREFERENCE),
            encryption_algorithms_server_to_client: names(CIPHER_PREFERENCE),
            mac_algorithms_client_to_server: names(MAC_PREFERENCE),
            mac_algorithms_server_to_client: names(MAC_PREFERENCE),
            compression_algorithms_client_to_server: names(&["none"]),
            compression_algorithms_server_to_client: names(&["none"]),
            languages_client_to_server: Vec::new(),
            languages_server_to_client: Vec::new(),
            first_kex_packet_follows: false,
        }
    }

    /// The 16-byte random cookie.
    pub fn cookie(&self) -> &[u8; 16] {
        &self.cookie
    }

    /// Key exchange algorithm list.
    pub fn kex_algorithms(&self) -> &[String] {
        &self.kex_algorithms
    }

    /// Server host key algorithm list.
    pub fn server_host_key_algorithms(&self) -> &[String] {
        &self.server_host_key_algorithms
    }

    /// Encryption algorithms, client to server.
    pub fn encryption_algorithms_client_to_server(&self) -> &[String] {
        &self.encryption_algorithms_client_to_server
    }

    /// Encryption algorithms, server to client.
    pub fn encryption_algorithms_server_to_client(&self) -> &[String] {
        &self.encryption_algorithms_server_to_client
    }

    /// MAC algorithms, client to server.
    pub fn mac_algorithms_client_to_server(&self) -> &[String] {
        &self.mac_algorithms_client_to_server
    }

    /// MAC algorithms, server to client.
    pub fn mac_algorithms_server_to_client(&self) -> &[String] {
        &self.mac_algorithms_server_to_client
    }

    /// Compression algorithms, client to server.
    pub fn compression_algorithms_client_to_server(&self) -> &[String] {
        &self.compression_algorithms_client_to_server
    }

    /// Compression algorithms, server to client.
    pub fn compression_algorithms_server_to_client(&self) -> &[String] {
        &self.compression_algorithms_server_to_client
    }

    /// Whether a guessed kex packet follows (always false from this client).
    pub fn first_kex_packet_follows(&self) -> bool {
        self.first_kex_packet_follows
    }

    /// Moves `cipher` to the front of both encryption lists.
    ///
    /// Used by `set_options`; an unknown name leaves the lists untouched.
    pub fn pin_cipher(&mut self, cipher: &str) {
        pin_front(&mut self.encryption_algorithms_client_to_server, cipher);
        pin_front(&mut self.encryption_algorithms_server_to_client, cipher);
    }

    /// Moves `mac` to the front of both MAC lists.
    pub fn pin_mac(&mut self, mac: &str) {
        pin_front(&mut self.mac_algorithms_client_to_server, mac);
        pin_front(&mut self.mac_algorithms_server_to_client, mac);
    }

    /// Serializes the KEXINIT payload (no packet framing).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.u8(MessageType::KexInit as u8);
        w.raw(&self.cookie);
        w.name_list(&self.kex_algorithms);
        w.name_list(&self.server_host_key_algorithms);
        w.name_list(&self.encryption_algorithms_client_to_server);
        w.name_list(&self.encryption_algorithms_server_to_client);
        w.name_list(&self.mac_algorithms_client_to_server);
        w.name_list(&self.mac_algorithms_server_to_client);
        w.name_list(&self.compression_algorithms_client_to_server);
        w.name_list(&self.compression_algorithms_server_to_client);
        w.name_list(&self.languages_client_to_server);
        w.name_list(&self.languages_server_to_client);
        w.bool(self.first_kex_packet_follows);
        w.u32(0); // reserved
        w.finish()
    }

    /// Parses a KEXINIT payload.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut r = Reader::new(data);
        let kind = r.u8()?;
        if kind != MessageType::KexInit as u8 {
            return Err(SkiffError::MalformedPacket(format!(
                "expected SSH_MSG_KEXINIT (20), got {}",
                kind
            )));
        }

        let cookie = r.array::<16>()?;
        let kex_algorithms = r.name_list()?;
        let server_host_key_algorithms = r.name_list()?;
        let encryption_algorithms_client_to_server = r.name_list()?;
        let encryption_algorithms_server_to_client = r.name_list()?;
        let mac_algorithms_client_to_server = r.name_list()?;
        let mac_algorithms_server_to_client = r.name_list()?;
        let compression_algorithms_client_to_server = r.name_list()?;
        let compression_algorithms_server_to_client = r.name_list()?;
        let languages_client_to_server = r.name_list()?;
        let languages_server_to_client = r.name_list()?;
        let first_kex_packet_follows = r.bool()?;
        let _reserved = r.u32()?;

        Ok(Self {
            cookie,
            kex_algorithms,
            server_host_key_algorithms,
            encryption_algorithms_client_to_server,
            encryption_algorithms_server_to_client,
            mac_algorithms_client_to_server,
            mac_algorithms_server_to_client,
            compression_algorithms_client_to_server,
            compression_algorithms_server_to_client,
            languages_client_to_server,
            languages_server_to_client,
            first_kex_packet_follows,
        })
    }
}

fn pin_front(list: &mut Vec<String>, name: &str) {
    if let Some(pos) = list.iter().position(|n| n == name) {
        let entry = list.remove(pos);
        list.insert(0, entry);
    }
}

/// Picks the first client algorithm also offered by the server.
///
/// # Errors
///
/// Returns [`SkiffError::NoCommonAlgorithm`] naming `slot` when the
/// intersection is empty.
pub fn negotiate_algorithm(
    client: &[String],
    server: &[String],
    slot: &str,
) -> SkiffResult<String> {
    client
        .iter()
        .find(|name| server.contains(name))
        .cloned()
        .ok_or_else(|| SkiffError::NoCommonAlgorithm(slot.to_string()))
}

/// SSH_MSG_NEWKEYS: a bare message byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NewKeys;

impl NewKeys {
    /// Creates the message.
    pub fn new() -> Self {
        Self
    }

    /// Serializes the payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        vec![MessageType::NewKeys as u8]
    }

    /// Parses the payload.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        if data != [MessageType::NewKeys as u8] {
            return Err(SkiffError::MalformedPacket(
                "expected bare SSH_MSG_NEWKEYS".to_string(),
            ));
        }
        Ok(Self)
    }
}
