//! SSH transport layer state machine (RFC 4253).
//!
//! # Session states
//!
//! ```text
//! Init -> IdentSent -> KexRunning -> Authenticating -> Open
//!                                        Open <-> Rekeying
//!                                        Open -> Closing -> Closed
//! ```
//!
//! Any error is terminal: the session jumps to `Closed` from whatever state
//! it was in. A rekey returns through `Rekeying` back to `Open` with fresh
//! keys but the original session identifier.
//!
//! Before the first SSH_MSG_NEWKEYS in a direction that direction runs the
//! "none" cipher and "none" MAC with an 8-byte block size; afterwards the
//! negotiated CBC cipher and HMAC take over. The transmit and receive
//! sequence numbers count every packet from the very first KEXINIT and are
//! never reset, not even by a rekey.

use crate::ssh::crypto::{CipherAlgorithm, DecryptionKey, EncryptionKey, MacAlgorithm, MacKey};
use crate::ssh::version::Version;
use skiff_platform::{SkiffError, SkiffResult};

/// Rekey after this many transported bytes (either direction).
pub const REKEY_BYTES_LIMIT: u64 = 0x4000_0000;

/// SSH session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Nothing sent yet.
    Init,
    /// Our identification line is out, waiting for the peer's.
    IdentSent,
    /// KEXINIT/KEXDH/NEWKEYS in flight for the initial exchange.
    KexRunning,
    /// Transport is encrypted, ssh-userauth running.
    Authenticating,
    /// Authenticated; channels may be open.
    Open,
    /// A rekey is in flight over the open session.
    Rekeying,
    /// Disconnect requested, waiting to finish.
    Closing,
    /// Session is over; terminal.
    Closed,
}

/// Transport configuration.
///
/// The KEXINIT itself is rebuilt for every exchange (each one needs a
/// fresh cookie), so only the identity and rekey policy live here.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Our identification string.
    pub version: Version,
    /// Bytes before an automatic rekey.
    pub rekey_bytes_limit: u64,
}

impl TransportConfig {
    /// Creates the default client configuration.
    pub fn new() -> Self {
        Self {
            version: Version::default_skiff(),
            rekey_bytes_limit: REKEY_BYTES_LIMIT,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Negotiated per-direction keys, installed after NEWKEYS.
#[derive(Debug)]
pub struct EncryptionParams {
    /// Cipher for outgoing packets (client to server).
    pub cipher_out: CipherAlgorithm,
    /// Cipher for incoming packets (server to client).
    pub cipher_in: CipherAlgorithm,
    /// MAC for outgoing packets.
    pub mac_out_algorithm: MacAlgorithm,
    /// MAC for incoming packets.
    pub mac_in_algorithm: MacAlgorithm,
    /// Encryptor, present once our NEWKEYS is sent.
    pub encryption_key: Option<EncryptionKey>,
    /// Decryptor, present once the peer's NEWKEYS is received.
    pub decryption_key: Option<DecryptionKey>,
    /// Outgoing MAC key.
    pub mac_out: Option<MacKey>,
    /// Incoming MAC key.
    pub mac_in: Option<MacKey>,
}

impl EncryptionParams {
    /// Creates a parameter block with no keys installed yet.
    pub fn new(
        cipher_out: CipherAlgorithm,
        cipher_in: CipherAlgorithm,
        mac_out_algorithm: MacAlgorithm,
        mac_in_algorithm: MacAlgorithm,
    ) -> Self {
        Self {
            cipher_out,
            cipher_in,
            mac_out_algorithm,
            mac_in_algorithm,
            encryption_key: None,
            decryption_key: None,
            mac_out: None,
            mac_in: None,
        }
    }

    /// Installs the transmit-side keys (after sending NEWKEYS).
    pub fn install_tx(&mut self, encryption_key: EncryptionKey, mac_out: MacKey) {
        self.encryption_key = Some(encryption_key);
        self.mac_out = Some(mac_out);
    }

    /// Installs the receive-side keys (after receiving NEWKEYS).
    pub fn install_rx(&mut self, decryption_key: DecryptionKey, mac_in: MacKey) {
        self.decryption_key = Some(decryption_key);
        self.mac_in = Some(mac_in);
    }
}

/// The transport state machine.
#[derive(Debug)]
pub struct TransportState {
    state: State,
    config: TransportConfig,
    peer_version: Option<Version>,

    /// Keys for the current epoch; `None` until the first NEWKEYS.
    params: Option<EncryptionParams>,

    tx_seq: u32,
    rx_seq: u32,

    bytes_since_kex: u64,
}

impl TransportState {
    /// Creates a transport in the `Init` state.
    pub fn new(config: TransportConfig) -> Self {
        Self {
            state: State::Init,
            config,
            peer_version: None,
            params: None,
            tx_seq: 0,
            rx_seq: 0,
            bytes_since_kex: 0,
        }
    }

    /// Current state.
    pub fn current(&self) -> State {
        self.state
    }

    /// The configuration.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Mutable configuration access (used by `set_options`).
    pub fn config_mut(&mut self) -> &mut TransportConfig {
        &mut self.config
    }

    /// The peer's identification, once received.
    pub fn peer_version(&self) -> Option<&Version> {
        self.peer_version.as_ref()
    }

    /// Records the peer's identification.
    pub fn set_peer_version(&mut self, version: Version) {
        self.peer_version = Some(version);
    }

    /// Validated state transition.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::MalformedPacket`] on an illegal transition;
    /// callers treat that as a protocol violation and close the session.
    pub fn transition(&mut self, next: State) -> SkiffResult<()> {
        use State::*;
        let valid = matches!(
            (self.state, next),
            (Init, IdentSent)
                | (IdentSent, KexRunning)
                | (KexRunning, Authenticating)
                | (Authenticating, Open)
                | (Open, Rekeying)
                | (Rekeying, Open)
                | (Open, Closing)
                | (Closing, Closed)
                | (_, Closed)
        ) || self.state == next;

        if !valid {
            return Err(SkiffError::MalformedPacket(format!(
                "invalid session state transition {:?} -> {:?}",
                self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    /// Forces the terminal state; used on any fatal error.
    pub fn mark_closed(&mut self) {
        self.state = State::Closed;
    }

    /// Whether the session is over.
    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    /// Whether packets are currently encrypted.
    pub fn is_encrypted(&self) -> bool {
        self.params
            .as_ref()
            .is_some_and(|p| p.encryption_key.is_some() || p.decryption_key.is_some())
    }

    /// The key block for the current epoch.
    pub fn params(&self) -> Option<&EncryptionParams> {
        self.params.as_ref()
    }

    /// Mutable key block access.
    pub fn params_mut(&mut self) -> Option<&mut EncryptionParams> {
        self.params.as_mut()
    }

    /// Replaces the key block at the start of a (re)key epoch.
    pub fn set_params(&mut self, params: EncryptionParams) {
        self.params = Some(params);
    }

    /// Transmit block size for padding: 8 before NEWKEYS, else the cipher's.
    ///
    /// Derived from the installed key, not the negotiated label: during a
    /// rekey the receive side still runs the previous epoch's cipher.
    pub fn tx_block_size(&self) -> usize {
        self.params
            .as_ref()
            .and_then(|p| p.encryption_key.as_ref())
            .map(|k| k.algorithm().block_size().max(8))
            .unwrap_or(8)
    }

    /// Receive block size: 8 before NEWKEYS, else the cipher's.
    pub fn rx_block_size(&self) -> usize {
        self.params
            .as_ref()
            .and_then(|p| p.decryption_key.as_ref())
            .map(|k| k.algorithm().block_size().max(8))
            .unwrap_or(8)
    }

    /// Incoming MAC trailer length for the current epoch.
    pub fn rx_mac_size(&self) -> usize {
        self.params
            .as_ref()
            .and_then(|p| p.mac_in.as_ref())
            .map(|m| m.algorithm().mac_size())
            .unwrap_or(0)
    }

    /// Current transmit sequence number.
    pub fn tx_seq(&self) -> u32 {
        self.tx_seq
    }

    /// Current receive sequence number.
    pub fn rx_seq(&self) -> u32 {
        self.rx_seq
    }

    /// Consumes one transmit sequence number.
    pub fn bump_tx_seq(&mut self) -> u32 {
        let seq = self.tx_seq;
        self.tx_seq = self.tx_seq.wrapping_add(1);
        seq
    }

    /// Consumes one receive sequence number.
    pub fn bump_rx_seq(&mut self) -> u32 {
        let seq = self.rx_seq;
        self.rx_seq = self.rx_seq.wrapping_add(1);
        seq
    }

    /// Records transported bytes for rekey tracking.
    pub fn add_bytes(&mut self, bytes: u64) {
        self.bytes_since_kex = self.bytes_since_kex.saturating_add(bytes);
    }

    /// Whether the byte threshold asks for a rekey.
    pub fn needs_rekey(&self) -> bool {
        self.state == State::Open && self.bytes_since_kex >= self.config.rekey_bytes_limit
    }

    /// Resets the rekey byte counter after a completed exchange.
    pub fn reset_rekey_tracking(&mut self) {
        self.bytes_since_kex = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_transport() -> TransportState {
        let mut t = TransportState::new(TransportConfig::default());
        t.transition(State::IdentSent).unwrap();
        t.transition(State::KexRunning).unwrap();
        t.transition(State::Authenticating).unwrap();
        t.transition(State::Open).unwrap();
        t
    }

    #[test]
    fn test_normal_progression() {
        let t = open_transport();
        assert_eq!(t.current(), State::Open);
    }

    #[test]
    fn test_rekey_cycle() {
        let mut t = open_transport();
        t.transition(State::Rekeying).unwrap();
        t.transition(State::Open).unwrap();
        assert_eq!(t.current(), State::Open);
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let mut t = TransportState::new(TransportConfig::default());
        assert!(t.transition(State::Open).is_err());
        assert!(t.transition(State::Rekeying).is_err());
    }

    #[test]
    fn test_any_state_may_close() {
        let mut t = TransportState::new(TransportConfig::default());
        t.transition(State::IdentSent).unwrap();
        t.transition(State::Closed).unwrap();
        assert!(t.is_closed());
    }

    #[test]
    fn test_sequence_numbers_increment_and_wrap() {
        let mut t = TransportState::new(TransportConfig::default());
        assert_eq!(t.bump_tx_seq(), 0);
        assert_eq!(t.bump_tx_seq(), 1);
        assert_eq!(t.tx_seq(), 2);

        t.tx_seq = u32::MAX;
        assert_eq!(t.bump_tx_seq(), u32::MAX);
        assert_eq!(t.tx_seq(), 0);

        assert_eq!(t.bump_rx_seq(), 0);
        assert_eq!(t.rx_seq(), 1);
    }

    #[test]
    fn test_block_sizes_before_newkeys() {
        let t = TransportState::new(TransportConfig::default());
        assert_eq!(t.tx_block_size(), 8);
        assert_eq!(t.rx_block_size(), 8);
        assert_eq!(t.rx_mac_size(), 0);
        assert!(!t.is_encrypted());
    }

    #[test]
    fn test_needs_rekey_threshold() {
        let mut t = open_transport();
        assert!(!t.needs_rekey());

        t.add_bytes(REKEY_BYTES_LIMIT);
        assert!(t.needs_rekey());

        t.reset_rekey_tracking();
        assert!(!t.needs_rekey());
    }

    #[test]
    fn test_needs_rekey_only_when_open() {
        let mut t = TransportState::new(TransportConfig::default());
        t.add_bytes(REKEY_BYTES_LIMIT * 2);
        assert!(!t.needs_rekey());
    }
}
