//! SSH client session.
//!
//! One [`SshClient`] owns one TCP connection and drives the whole protocol
//! stack over it: identification exchange, key exchange (initial and rekey),
//! user authentication, and the channel multiplexer. All blocking calls are
//! async and bounded by timeouts; a timeout mid-receive leaves the partial
//! packet buffered so the stream never desynchronises.
//!
//! # Example
//!
//! ```rust,no_run
//! use skiff_proto::ssh::client::SshClient;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let (mut client, channel) =
//!     SshClient::connect_with_password("127.0.0.1", 22, "user", "password", true, 30).await?;
//!
//! client.send(channel, b"uptime\n").await?;
//! if client.wait_for(channel, b"$", std::time::Duration::from_secs(5)).await? {
//!     let output = client.read(channel).await?;
//!     println!("{}", String::from_utf8_lossy(&output));
//! }
//! client.close(channel).await?;
//! # Ok(())
//! # }
//! ```

use crate::ssh::auth::{self, AuthBanner, AuthFailure, AuthMethod, AuthPkOk, AuthRequest};
use crate::ssh::channel::{ChannelState, SshChannel};
use crate::ssh::connection::{
    ChannelClose, ChannelData, ChannelEof, ChannelExtendedData, ChannelOpen,
    ChannelOpenConfirmation, ChannelOpenFailure, ChannelRequest, ChannelRequestType,
    ChannelWindowAdjust, INITIAL_WINDOW_SIZE,
};
use crate::ssh::crypto::{
    CipherAlgorithm, DecryptionKey, EncryptionKey, MacAlgorithm, MacKey,
};
use crate::ssh::hostkey::HostKey;
use crate::ssh::kex::{negotiate_algorithm, KexInit, NewKeys};
use crate::ssh::kex_dh::{derive_key, exchange_hash, DhExchange, DhGroup, KexdhInit, KexdhReply};
use crate::ssh::message::MessageType;
use crate::ssh::packet::{Packet, MAX_PACKET_SIZE};
use crate::ssh::privatekey::KeyPair;
use crate::ssh::transport::{EncryptionParams, State, TransportConfig, TransportState};
use crate::ssh::version::Version;
use crate::ssh::wire::{Reader, Writer};
use skiff_platform::{ErrorLog, SkiffError, SkiffResult};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, trace};

/// SSH client configuration.
#[derive(Debug, Clone)]
pub struct SshClientConfig {
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Timeout for each blocking protocol read.
    pub read_timeout: Duration,
    /// Cipher pinned to the front of both KEXINIT encryption lists.
    pub preferred_cipher: Option<String>,
    /// MAC pinned to the front of both KEXINIT MAC lists.
    pub preferred_mac: Option<String>,
}

impl SshClientConfig {
    /// Pins a preferred cipher and MAC, the `set_options` contract.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::NoCommonAlgorithm`] when either name is not
    /// one this library implements.
    pub fn with_preferences(mut self, cipher: &str, mac: &str) -> SkiffResult<Self> {
        if CipherAlgorithm::from_name(cipher).is_none() {
            return Err(SkiffError::NoCommonAlgorithm(format!(
                "unknown preferred cipher '{}'",
                cipher
            )));
        }
        if MacAlgorithm::from_name(mac).is_none() {
            return Err(SkiffError::NoCommonAlgorithm(format!(
                "unknown preferred MAC '{}'",
                mac
            )));
        }
        self.preferred_cipher = Some(cipher.to_string());
        self.preferred_mac = Some(mac.to_string());
        Ok(self)
    }
}

impl Default for SshClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
            preferred_cipher: None,
            preferred_mac: None,
        }
    }
}

/// What one pumped packet amounted to.
#[derive(Debug)]
enum PumpEvent {
    /// Transport-level traffic, nothing for the caller.
    Transport,
    /// Something happened on a channel (data, adjust, EOF, close).
    ChannelUpdate(u32),
    /// The peer confirmed a channel open.
    OpenConfirmed(u32),
    /// The peer refused a channel open.
    OpenFailed { channel: u32, description: String },
    /// Outcome of a want-reply channel request.
    RequestOutcome { channel: u32, success: bool },
}

/// An SSH client session.
pub struct SshClient {
    stream: TcpStream,
    transport: TransportState,
    config: SshClientConfig,
    error_log: Arc<ErrorLog>,

    server_addr: String,
    username: Option<String>,

    channels: HashMap<u32, SshChannel>,
    next_channel_id: u32,

    /// Identification lines, CR LF stripped, for the exchange hash.
    client_version: String,
    server_version: String,

    /// Exchange hash of the first kex; constant across rekeys.
    session_id: Option<Vec<u8>>,

    /// Bytes read off the socket but not yet consumed as a packet.
    read_buf: Vec<u8>,
    /// Length field of the packet currently being assembled, once known.
    /// When a cipher is active the first block of `read_buf` is already
    /// plaintext by the time this is `Some`.
    pending_len: Option<usize>,

    /// Between our KEXINIT and NEWKEYS only transport messages may go
    /// out; channel replies triggered by in-flight peer traffic are
    /// queued here and flushed once the exchange completes.
    in_kex: bool,
    deferred_window_adjusts: Vec<ChannelWindowAdjust>,
    deferred_closes: Vec<ChannelClose>,
}

impl SshClient {
    // ----- connection setup ------------------------------------------------

    /// Connects and completes identification + key exchange.
    pub async fn connect(addr: &str) -> SkiffResult<Self> {
        Self::connect_with_config(addr, SshClientConfig::default(), Arc::new(ErrorLog::new()))
            .await
    }

    /// Connects with explicit configuration and diagnostic sink.
    pub async fn connect_with_config(
        addr: &str,
        config: SshClientConfig,
        error_log: Arc<ErrorLog>,
    ) -> SkiffResult<Self> {
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| SkiffError::Timeout)?
            .map_err(SkiffError::Network)?;

        let mut client = Self {
            stream,
            transport: TransportState::new(TransportConfig::new()),
            config,
            error_log,
            server_addr: addr.to_string(),
            username: None,
            channels: HashMap::new(),
            next_channel_id: 0,
            client_version: String::new(),
            server_version: String::new(),
            session_id: None,
            read_buf: Vec::new(),
            pending_len: None,
            in_kex: false,
            deferred_window_adjusts: Vec::new(),
            deferred_closes: Vec::new(),
        };

        if let Err(err) = client.handshake().await {
            client.error_log.push(-1, err.to_string());
            client.transport.mark_closed();
            return Err(err);
        }
        Ok(client)
    }

    async fn handshake(&mut self) -> SkiffResult<()> {
        self.version_exchange().await?;
        self.transport.transition(State::KexRunning)?;
        self.run_key_exchange(None).await?;
        self.transport.transition(State::Authenticating)?;
        info!(server = %self.server_addr, "transport established");
        Ok(())
    }

    /// Connects, authenticates with a password and opens a session channel.
    ///
    /// Returns the session and the channel id. A `timeout_secs` of 0 means
    /// no overall deadline.
    pub async fn connect_with_password(
        host: &str,
        port: u16,
        user: &str,
        password: &str,
        want_shell: bool,
        timeout_secs: u64,
    ) -> SkiffResult<(Self, u32)> {
        let addr = format!("{}:{}", host, port);
        let procedure = async {
            let mut client = Self::connect(&addr).await?;
            client.authenticate_password(user, password).await?;
            let channel = client.open_session(want_shell).await?;
            Ok((client, channel))
        };
        bounded(procedure, timeout_secs).await
    }

    /// Connects, authenticates with a private key file and opens a session
    /// channel.
    pub async fn connect_with_key(
        host: &str,
        port: u16,
        user: &str,
        priv_key_path: &str,
        want_shell: bool,
        timeout_secs: u64,
    ) -> SkiffResult<(Self, u32)> {
        let key = KeyPair::from_file(priv_key_path)?;
        let addr = format!("{}:{}", host, port);
        let procedure = async {
            let mut client = Self::connect(&addr).await?;
            client.authenticate_public_key(user, &key).await?;
            let channel = client.open_session(want_shell).await?;
            Ok((client, channel))
        };
        bounded(procedure, timeout_secs).await
    }

    async fn version_exchange(&mut self) -> SkiffResult<()> {
        let our_version = self.transport.config().version.clone();
        self.client_version = our_version.to_string();
        self.stream
            .write_all(&our_version.to_wire_format())
            .await
            .map_err(SkiffError::Network)?;
        self.transport.transition(State::IdentSent)?;

        // Servers may precede their identification with banner lines.
        const MAX_BANNER_LINES: usize = 64;
        for _ in 0..MAX_BANNER_LINES {
            let line = self.read_ident_line().await?;
            if Version::is_banner_line(&line) {
                debug!(banner = %line.trim_end(), "discarding pre-ident line");
                continue;
            }
            let server_version = Version::parse(&line)?;
            self.server_version = server_version.to_string();
            debug!(ident = %self.server_version, "peer identification");
            self.transport.set_peer_version(server_version);
            return Ok(());
        }
        Err(SkiffError::BadIdent(
            "no identification line within the first 64 lines".to_string(),
        ))
    }

    async fn read_ident_line(&mut self) -> SkiffResult<String> {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            self.stream
                .read_exact(&mut byte)
                .await
                .map_err(SkiffError::Network)?;
            if byte[0] == b'\n' {
                return Ok(String::from_utf8_lossy(&line).into_owned());
            }
            line.push(byte[0]);
            if line.len() > 255 {
                return Err(SkiffError::BadIdent(
                    "identification line exceeds 255 bytes".to_string(),
                ));
            }
        }
    }

    // ----- framed packet I/O -----------------------------------------------

    /// Sends one packet: pad, MAC over the plaintext, encrypt, emit.
    async fn send_packet(&mut self, payload: &[u8]) -> SkiffResult<()> {
        let kind = MessageType::from_u8(payload.first().copied().unwrap_or(0));
        trace!(?kind, len = payload.len(), seq = self.transport.tx_seq(), "sending packet");

        let block = self.transport.tx_block_size();
        let packet = Packet::new(payload.to_vec(), block);
        let mut bytes = packet.to_bytes();

        let seq = self.transport.bump_tx_seq();
        let mac = match self.transport.params().and_then(|p| p.mac_out.as_ref()) {
            Some(mac_key) => mac_key.compute(seq, &bytes),
            None => Vec::new(),
        };

        if let Some(enc) = self
            .transport
            .params_mut()
            .and_then(|p| p.encryption_key.as_mut())
        {
            enc.encrypt(&mut bytes)?;
        }

        self.stream
            .write_all(&bytes)
            .await
            .map_err(SkiffError::Network)?;
        if !mac.is_empty() {
            self.stream
                .write_all(&mac)
                .await
                .map_err(SkiffError::Network)?;
        }

        self.transport.add_bytes((bytes.len() + mac.len()) as u64);
        Ok(())
    }

    /// Appends socket bytes to the read buffer until it holds `target`.
    ///
    /// Cancel-safe: cancelling between reads leaves the collected bytes in
    /// `self.read_buf` for the next call.
    async fn fill_read_buf(&mut self, target: usize) -> SkiffResult<()> {
        while self.read_buf.len() < target {
            let n = self
                .stream
                .read_buf(&mut self.read_buf)
                .await
                .map_err(SkiffError::Network)?;
            if n == 0 {
                return Err(SkiffError::Network(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed by peer",
                )));
            }
        }
        Ok(())
    }

    /// Receives one packet: decrypt, verify MAC, unframe.
    async fn receive_packet(&mut self) -> SkiffResult<Packet> {
        let encrypted = self
            .transport
            .params()
            .is_some_and(|p| p.decryption_key.is_some());
        let block = self.transport.rx_block_size();
        let mac_len = self.transport.rx_mac_size();

        // Phase 1: learn the packet length. With a cipher active that
        // means decrypting the first block exactly once.
        let packet_length = match self.pending_len {
            Some(len) => len,
            None => {
                if encrypted {
                    self.fill_read_buf(block).await?;
                    let dec = self
                        .transport
                        .params_mut()
                        .and_then(|p| p.decryption_key.as_mut())
                        .expect("checked above");
                    dec.decrypt(&mut self.read_buf[..block])?;
                } else {
                    self.fill_read_buf(4).await?;
                }
                let len = u32::from_be_bytes([
                    self.read_buf[0],
                    self.read_buf[1],
                    self.read_buf[2],
                    self.read_buf[3],
                ]) as usize;

                if len > MAX_PACKET_SIZE {
                    return Err(SkiffError::MalformedPacket(format!(
                        "packet length {} exceeds maximum {}",
                        len, MAX_PACKET_SIZE
                    )));
                }
                if encrypted && (len + 4) % block != 0 {
                    return Err(SkiffError::MalformedPacket(format!(
                        "packet length {} not aligned to cipher block {}",
                        len, block
                    )));
                }
                self.pending_len = Some(len);
                len
            }
        };

        // Phase 2: the rest of the packet plus the MAC trailer.
        let total = 4 + packet_length + mac_len;
        self.fill_read_buf(total).await?;

        if encrypted && 4 + packet_length > block {
            let dec = self
                .transport
                .params_mut()
                .and_then(|p| p.decryption_key.as_mut())
                .expect("checked above");
            dec.decrypt(&mut self.read_buf[block..4 + packet_length])?;
        }

        let seq = self.transport.rx_seq();
        if mac_len > 0 {
            let (plain, trailer) = self.read_buf.split_at(4 + packet_length);
            let mac_in = self
                .transport
                .params()
                .and_then(|p| p.mac_in.as_ref())
                .expect("mac_len > 0 implies a MAC key");
            mac_in.verify(seq, plain, &trailer[..mac_len])?;
        }
        self.transport.bump_rx_seq();

        let packet = Packet::from_bytes(&self.read_buf[..4 + packet_length])?;
        self.read_buf.drain(..total);
        self.pending_len = None;
        self.transport.add_bytes(total as u64);

        let kind = MessageType::from_u8(packet.message_byte());
        trace!(?kind, len = packet.payload().len(), seq, "received packet");
        Ok(packet)
    }

    /// `receive_packet` bounded by `timeout`; partial reads stay buffered.
    async fn receive_packet_timeout(&mut self, timeout: Duration) -> SkiffResult<Packet> {
        match tokio::time::timeout(timeout, self.receive_packet()).await {
            Ok(result) => result,
            Err(_) => Err(SkiffError::Timeout),
        }
    }

    /// Receives the next packet that is not IGNORE/DEBUG, surfacing
    /// DISCONNECT as an error.
    async fn receive_protocol_packet(&mut self, timeout: Duration) -> SkiffResult<Packet> {
        loop {
            let packet = self.receive_packet_timeout(timeout).await?;
            match MessageType::from_u8(packet.message_byte()) {
                Some(MessageType::Ignore) | Some(MessageType::Debug) => continue,
                Some(MessageType::Disconnect) => return Err(self.on_disconnect(&packet)),
                _ => return Ok(packet),
            }
        }
    }

    fn on_disconnect(&mut self, packet: &Packet) -> SkiffError {
        let mut r = Reader::new(packet.payload());
        let _ = r.u8();
        let reason = r.u32().unwrap_or(0);
        let description = r
            .string()
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .unwrap_or_default();
        info!(reason, %description, "server sent SSH_MSG_DISCONNECT");
        self.error_log
            .push(-1, format!("server disconnected ({}): {}", reason, description));
        self.transport.mark_closed();
        SkiffError::Network(std::io::Error::new(
            std::io::ErrorKind::ConnectionAborted,
            format!("server disconnected: {}", description),
        ))
    }

    // ----- key exchange ----------------------------------------------------

    /// Runs one key exchange: the initial one or a rekey.
    ///
    /// `server_kexinit` carries the peer's KEXINIT payload when the peer
    /// initiated the exchange. The session identifier is set by the first
    /// exchange and reused for key derivation ever after.
    async fn run_key_exchange(&mut self, server_kexinit: Option<Vec<u8>>) -> SkiffResult<()> {
        self.in_kex = true;
        let mut kexinit = KexInit::new_default();
        if let Some(cipher) = &self.config.preferred_cipher {
            kexinit.pin_cipher(cipher);
        }
        if let Some(mac) = &self.config.preferred_mac {
            kexinit.pin_mac(mac);
        }

        let client_payload = kexinit.to_bytes();
        self.send_packet(&client_payload).await?;

        // Until the peer's KEXINIT arrives it may still send connection
        // traffic queued before it saw ours; afterwards only transport
        // messages are legal.
        let server_payload = match server_kexinit {
            Some(payload) => payload,
            None => loop {
                let packet = self.receive_protocol_packet(self.config.read_timeout).await?;
                match MessageType::from_u8(packet.message_byte()) {
                    Some(MessageType::KexInit) => break packet.payload().to_vec(),
                    Some(MessageType::GlobalRequest)
                    | Some(MessageType::RequestSuccess)
                    | Some(MessageType::RequestFailure) => {
                        trace!("dropping global-request traffic during key exchange");
                    }
                    Some(kind) if !kind.is_transport() => {
                        self.dispatch_channel_message(&packet, kind).await?;
                    }
                    other => {
                        return Err(SkiffError::MalformedPacket(format!(
                            "unexpected message {:?} while waiting for KEXINIT",
                            other
                        )))
                    }
                }
            },
        };

        let server_kexinit = KexInit::from_bytes(&server_payload)?;

        let kex_name = negotiate_algorithm(
            kexinit.kex_algorithms(),
            server_kexinit.kex_algorithms(),
            "kex",
        )?;
        let group = DhGroup::from_name(&kex_name)
            .ok_or_else(|| SkiffError::NoCommonAlgorithm("kex".to_string()))?;

        let hostkey_name = negotiate_algorithm(
            kexinit.server_host_key_algorithms(),
            server_kexinit.server_host_key_algorithms(),
            "server host key",
        )?;

        let cipher_out = negotiate_algorithm(
            kexinit.encryption_algorithms_client_to_server(),
            server_kexinit.encryption_algorithms_client_to_server(),
            "cipher client to server",
        )
        .and_then(|name| {
            CipherAlgorithm::from_name(&name)
                .ok_or_else(|| SkiffError::NoCommonAlgorithm("cipher client to server".into()))
        })?;
        let cipher_in = negotiate_algorithm(
            kexinit.encryption_algorithms_server_to_client(),
            server_kexinit.encryption_algorithms_server_to_client(),
            "cipher server to client",
        )
        .and_then(|name| {
            CipherAlgorithm::from_name(&name)
                .ok_or_else(|| SkiffError::NoCommonAlgorithm("cipher server to client".into()))
        })?;
        let mac_out = negotiate_algorithm(
            kexinit.mac_algorithms_client_to_server(),
            server_kexinit.mac_algorithms_client_to_server(),
            "MAC client to server",
        )
        .and_then(|name| {
            MacAlgorithm::from_name(&name)
                .ok_or_else(|| SkiffError::NoCommonAlgorithm("MAC client to server".into()))
        })?;
        let mac_in = negotiate_algorithm(
            kexinit.mac_algorithms_server_to_client(),
            server_kexinit.mac_algorithms_server_to_client(),
            "MAC server to client",
        )
        .and_then(|name| {
            MacAlgorithm::from_name(&name)
                .ok_or_else(|| SkiffError::NoCommonAlgorithm("MAC server to client".into()))
        })?;
        negotiate_algorithm(
            kexinit.compression_algorithms_client_to_server(),
            server_kexinit.compression_algorithms_client_to_server(),
            "compression",
        )?;

        debug!(
            kex = %group.name(),
            hostkey = %hostkey_name,
            cipher_out = %cipher_out.name(),
            cipher_in = %cipher_in.name(),
            mac_out = %mac_out.name(),
            mac_in = %mac_in.name(),
            "negotiated algorithms"
        );

        // DH exchange.
        let dh = DhExchange::new(group);
        let e = dh.public_value();
        self.send_packet(&KexdhInit { e: e.clone() }.to_bytes()).await?;

        let reply = loop {
            let packet = self.receive_protocol_packet(self.config.read_timeout).await?;
            match MessageType::from_u8(packet.message_byte()) {
                Some(MessageType::KexdhReply) => break KexdhReply::from_bytes(packet.payload())?,
                other => {
                    return Err(SkiffError::MalformedPacket(format!(
                        "unexpected message {:?} while waiting for KEXDH_REPLY",
                        other
                    )))
                }
            }
        };

        let host_key = HostKey::from_blob(&reply.host_key)?;
        if host_key.algorithm_name() != hostkey_name {
            return Err(SkiffError::BadHostKey(format!(
                "server offered '{}' but negotiation picked '{}'",
                host_key.algorithm_name(),
                hostkey_name
            )));
        }

        let k = dh.compute_shared_secret(&reply.f)?;
        let h = exchange_hash(
            self.client_version.as_bytes(),
            self.server_version.as_bytes(),
            &client_payload,
            &server_payload,
            &reply.host_key,
            &e,
            &reply.f,
            &k,
        );

        host_key.verify(&h, &reply.signature)?;

        let session_id = self.session_id.get_or_insert_with(|| h.clone()).clone();

        // Our NEWKEYS still travels under the old keys.
        self.send_packet(&NewKeys::new().to_bytes()).await?;

        let iv_out = derive_key(&k, &h, &session_id, b'A', cipher_out.iv_size());
        let iv_in = derive_key(&k, &h, &session_id, b'B', cipher_in.iv_size());
        let key_out = derive_key(&k, &h, &session_id, b'C', cipher_out.key_size());
        let key_in = derive_key(&k, &h, &session_id, b'D', cipher_in.key_size());
        let mac_key_out = derive_key(&k, &h, &session_id, b'E', mac_out.key_size());
        let mac_key_in = derive_key(&k, &h, &session_id, b'F', mac_in.key_size());

        // Switch the transmit direction now; receiving stays on the old
        // epoch until the peer's NEWKEYS arrives.
        let (old_dec, old_mac_in) = match self.transport.params_mut() {
            Some(p) => (p.decryption_key.take(), p.mac_in.take()),
            None => (None, None),
        };
        let mut params = EncryptionParams::new(cipher_out, cipher_in, mac_out, mac_in);
        params.install_tx(
            EncryptionKey::new(cipher_out, &key_out, &iv_out)?,
            MacKey::new(mac_out, &mac_key_out)?,
        );
        params.decryption_key = old_dec;
        params.mac_in = old_mac_in;
        self.transport.set_params(params);

        loop {
            let packet = self.receive_protocol_packet(self.config.read_timeout).await?;
            match MessageType::from_u8(packet.message_byte()) {
                Some(MessageType::NewKeys) => break,
                other => {
                    return Err(SkiffError::MalformedPacket(format!(
                        "unexpected message {:?} while waiting for NEWKEYS",
                        other
                    )))
                }
            }
        }

        let params = self.transport.params_mut().expect("params just installed");
        params.install_rx(
            DecryptionKey::new(cipher_in, &key_in, &iv_in)?,
            MacKey::new(mac_in, &mac_key_in)?,
        );
        self.transport.reset_rekey_tracking();
        self.in_kex = false;

        // Channel replies held back during the exchange go out now.
        for adjust in std::mem::take(&mut self.deferred_window_adjusts) {
            self.send_packet(&adjust.to_bytes()).await?;
        }
        for close in std::mem::take(&mut self.deferred_closes) {
            self.send_packet(&close.to_bytes()).await?;
        }

        debug!("key exchange complete");
        Ok(())
    }

    /// Initiates a rekey over the open session.
    pub async fn rekey(&mut self) -> SkiffResult<()> {
        self.transport.transition(State::Rekeying)?;
        let result = self.run_key_exchange(None).await;
        match result {
            Ok(()) => self.transport.transition(State::Open),
            Err(err) => {
                self.error_log.push(-1, err.to_string());
                self.transport.mark_closed();
                Err(err)
            }
        }
    }

    // ----- authentication --------------------------------------------------

    async fn request_userauth_service(&mut self) -> SkiffResult<()> {
        self.send_packet(&auth::service_request("ssh-userauth")).await?;
        let packet = self.receive_protocol_packet(self.config.read_timeout).await?;
        let service = auth::parse_service_accept(packet.payload())?;
        if service != "ssh-userauth" {
            return Err(SkiffError::MalformedPacket(format!(
                "server accepted the wrong service '{}'",
                service
            )));
        }
        Ok(())
    }

    /// Authenticates with a password.
    pub async fn authenticate_password(&mut self, user: &str, password: &str) -> SkiffResult<()> {
        let result = self.password_auth_flow(user, password).await;
        self.finish_auth(user, result)
    }

    async fn password_auth_flow(&mut self, user: &str, password: &str) -> SkiffResult<()> {
        self.request_userauth_service().await?;

        let request = AuthRequest::new(
            user,
            "ssh-connection",
            AuthMethod::Password(password.to_string()),
        );
        self.send_packet(&request.to_bytes()).await?;
        self.await_auth_outcome().await
    }

    /// Authenticates with a private key (publickey method).
    ///
    /// Sends a signatureless probe first; once the server answers PK_OK
    /// the request is repeated with a signature over the session id and
    /// the request body.
    pub async fn authenticate_public_key(&mut self, user: &str, key: &KeyPair) -> SkiffResult<()> {
        let result = self.public_key_auth_flow(user, key).await;
        self.finish_auth(user, result)
    }

    async fn public_key_auth_flow(&mut self, user: &str, key: &KeyPair) -> SkiffResult<()> {
        self.request_userauth_service().await?;

        let probe = AuthRequest::new(
            user,
            "ssh-connection",
            AuthMethod::PublicKey {
                algorithm: key.algorithm_name().to_string(),
                public_key: key.public_key_blob().to_vec(),
                signature: None,
            },
        );
        self.send_packet(&probe.to_bytes()).await?;

        loop {
            let packet = self.receive_protocol_packet(self.config.read_timeout).await?;
            match MessageType::from_u8(packet.message_byte()) {
                Some(MessageType::UserauthBanner) => self.record_banner(packet.payload()),
                Some(MessageType::UserauthPkOk) => {
                    let pk_ok = AuthPkOk::from_bytes(packet.payload())?;
                    debug!(algorithm = %pk_ok.algorithm(), "server accepts the offered key");

                    let session_id = self
                        .session_id
                        .clone()
                        .expect("key exchange sets the session id");
                    let to_sign = auth::signature_data(
                        user,
                        "ssh-connection",
                        key.algorithm_name(),
                        key.public_key_blob(),
                    );
                    let signature = key.sign(&session_id, &to_sign)?;

                    let request = AuthRequest::new(
                        user,
                        "ssh-connection",
                        AuthMethod::PublicKey {
                            algorithm: key.algorithm_name().to_string(),
                            public_key: key.public_key_blob().to_vec(),
                            signature: Some(signature),
                        },
                    );
                    self.send_packet(&request.to_bytes()).await?;
                    return self.await_auth_outcome().await;
                }
                Some(MessageType::UserauthFailure) => {
                    return Err(AuthFailure::from_bytes(packet.payload())?.to_error())
                }
                Some(MessageType::UserauthSuccess) => return Ok(()),
                other => {
                    return Err(SkiffError::MalformedPacket(format!(
                        "unexpected message {:?} during public key authentication",
                        other
                    )))
                }
            }
        }
    }

    async fn await_auth_outcome(&mut self) -> SkiffResult<()> {
        loop {
            let packet = self.receive_protocol_packet(self.config.read_timeout).await?;
            match MessageType::from_u8(packet.message_byte()) {
                Some(MessageType::UserauthBanner) => self.record_banner(packet.payload()),
                Some(MessageType::UserauthSuccess) => return Ok(()),
                Some(MessageType::UserauthFailure) => {
                    return Err(AuthFailure::from_bytes(packet.payload())?.to_error())
                }
                other => {
                    return Err(SkiffError::MalformedPacket(format!(
                        "unexpected message {:?} during authentication",
                        other
                    )))
                }
            }
        }
    }

    fn record_banner(&mut self, payload: &[u8]) {
        if let Ok(banner) = AuthBanner::from_bytes(payload) {
            info!(banner = %banner.message().trim_end(), "authentication banner");
            self.error_log
                .push(-1, format!("banner: {}", banner.message()));
        }
    }

    fn finish_auth(&mut self, user: &str, result: SkiffResult<()>) -> SkiffResult<()> {
        match result {
            Ok(()) => {
                self.username = Some(user.to_string());
                self.transport.transition(State::Open)?;
                info!(%user, "authenticated");
                Ok(())
            }
            Err(err) => {
                self.error_log.push(-1, err.to_string());
                if !matches!(err, SkiffError::AuthFailed { .. }) {
                    self.transport.mark_closed();
                }
                Err(err)
            }
        }
    }

    // ----- packet pump and channel dispatch --------------------------------

    /// Receives and dispatches one packet.
    ///
    /// Also the point where the byte-threshold rekey fires: both directions
    /// count towards it, and a rekey must complete before any further
    /// application traffic.
    async fn pump_packet(&mut self, timeout: Duration) -> SkiffResult<PumpEvent> {
        if self.transport.needs_rekey() {
            debug!("transferred byte threshold reached, rekeying");
            self.rekey().await?;
        }
        let packet = self.receive_protocol_packet(timeout).await?;
        self.dispatch_packet(packet).await
    }

    async fn dispatch_packet(&mut self, packet: Packet) -> SkiffResult<PumpEvent> {
        let Some(kind) = MessageType::from_u8(packet.message_byte()) else {
            trace!(byte = packet.message_byte(), "dropping unknown message");
            return Ok(PumpEvent::Transport);
        };

        match kind {
            MessageType::KexInit => {
                // Server-initiated rekey.
                debug!("server requested a rekey");
                self.transport.transition(State::Rekeying)?;
                if let Err(err) = self.run_key_exchange(Some(packet.payload().to_vec())).await {
                    self.error_log.push(-1, err.to_string());
                    self.transport.mark_closed();
                    return Err(err);
                }
                self.transport.transition(State::Open)?;
                Ok(PumpEvent::Transport)
            }
            MessageType::GlobalRequest => {
                let mut r = Reader::new(&packet.payload()[1..]);
                let name = r.utf8_string().unwrap_or("").to_string();
                let want_reply = r.bool().unwrap_or(false);
                debug!(%name, want_reply, "refusing global request");
                if want_reply {
                    self.send_packet(&[MessageType::RequestFailure as u8]).await?;
                }
                Ok(PumpEvent::Transport)
            }
            MessageType::RequestSuccess | MessageType::RequestFailure => Ok(PumpEvent::Transport),
            MessageType::Unimplemented => Ok(PumpEvent::Transport),
            kind if !kind.is_transport() => self.dispatch_channel_message(&packet, kind).await,
            other => Err(SkiffError::MalformedPacket(format!(
                "unexpected transport message {:?}",
                other
            ))),
        }
    }

    /// Handles one connection-protocol message.
    ///
    /// Messages for unknown local channel ids are silently dropped.
    async fn dispatch_channel_message(
        &mut self,
        packet: &Packet,
        kind: MessageType,
    ) -> SkiffResult<PumpEvent> {
        match kind {
            MessageType::ChannelOpenConfirmation => {
                let conf = ChannelOpenConfirmation::from_bytes(packet.payload())?;
                let Some(channel) = self.channels.get_mut(&conf.recipient_channel) else {
                    trace!(id = conf.recipient_channel, "confirmation for unknown channel");
                    return Ok(PumpEvent::Transport);
                };
                channel.confirm(
                    conf.sender_channel,
                    conf.initial_window_size,
                    conf.maximum_packet_size,
                );
                debug!(
                    local = conf.recipient_channel,
                    remote = conf.sender_channel,
                    window = conf.initial_window_size,
                    "channel open"
                );
                Ok(PumpEvent::OpenConfirmed(conf.recipient_channel))
            }
            MessageType::ChannelOpenFailure => {
                let failure = ChannelOpenFailure::from_bytes(packet.payload())?;
                self.channels.remove(&failure.recipient_channel);
                Ok(PumpEvent::OpenFailed {
                    channel: failure.recipient_channel,
                    description: failure.description,
                })
            }
            MessageType::ChannelWindowAdjust => {
                let adjust = ChannelWindowAdjust::from_bytes(packet.payload())?;
                if let Some(channel) = self.channels.get_mut(&adjust.recipient_channel) {
                    channel.adjust_peer_window(adjust.bytes_to_add);
                    return Ok(PumpEvent::ChannelUpdate(adjust.recipient_channel));
                }
                Ok(PumpEvent::Transport)
            }
            MessageType::ChannelData => {
                let data = ChannelData::from_bytes(packet.payload())?;
                self.deliver_channel_data(data.recipient_channel, &data.data).await
            }
            MessageType::ChannelExtendedData => {
                // Stderr is merged into the main receive buffer.
                let ext = ChannelExtendedData::from_bytes(packet.payload())?;
                self.deliver_channel_data(ext.recipient_channel, &ext.data).await
            }
            MessageType::ChannelEof => {
                let eof = ChannelEof::from_bytes(packet.payload())?;
                if let Some(channel) = self.channels.get_mut(&eof.recipient_channel) {
                    channel.set_peer_eof();
                    return Ok(PumpEvent::ChannelUpdate(eof.recipient_channel));
                }
                Ok(PumpEvent::Transport)
            }
            MessageType::ChannelClose => {
                let close = ChannelClose::from_bytes(packet.payload())?;
                let Some(channel) = self.channels.get_mut(&close.recipient_channel) else {
                    return Ok(PumpEvent::Transport);
                };
                let remote_id = channel.remote_id();
                let already_closing = matches!(
                    channel.state(),
                    ChannelState::CloseSent | ChannelState::Closed
                );
                channel.set_state(ChannelState::Closed);
                if !already_closing {
                    // Unsolicited CLOSE: answer with ours.
                    let reply = ChannelClose {
                        recipient_channel: remote_id,
                    };
                    if self.in_kex {
                        self.deferred_closes.push(reply);
                    } else {
                        self.send_packet(&reply.to_bytes()).await?;
                    }
                }
                debug!(id = close.recipient_channel, "channel closed by peer");
                Ok(PumpEvent::ChannelUpdate(close.recipient_channel))
            }
            MessageType::ChannelSuccess | MessageType::ChannelFailure => {
                let mut r = Reader::new(&packet.payload()[1..]);
                let id = r.u32()?;
                if let Some(channel) = self.channels.get_mut(&id) {
                    if channel.state() == ChannelState::RequestPending {
                        channel.set_state(ChannelState::Open);
                    }
                }
                Ok(PumpEvent::RequestOutcome {
                    channel: id,
                    success: kind == MessageType::ChannelSuccess,
                })
            }
            MessageType::ChannelRequest => {
                // Servers rarely send channel requests to clients; drop.
                trace!("ignoring channel request from server");
                Ok(PumpEvent::Transport)
            }
            MessageType::ChannelOpen => {
                // Forwarded channels (x11, agent) are not supported: refuse.
                let mut r = Reader::new(&packet.payload()[1..]);
                let _channel_type = r.utf8_string().unwrap_or("");
                let sender = r.u32().unwrap_or(0);
                let mut w = Writer::new();
                w.u8(MessageType::ChannelOpenFailure as u8);
                w.u32(sender);
                w.u32(1); // SSH_OPEN_ADMINISTRATIVELY_PROHIBITED
                w.string(b"channel type not supported");
                w.string(b"");
                self.send_packet(&w.finish()).await?;
                Ok(PumpEvent::Transport)
            }
            other => Err(SkiffError::MalformedPacket(format!(
                "unexpected connection message {:?}",
                other
            ))),
        }
    }

    async fn deliver_channel_data(&mut self, id: u32, data: &[u8]) -> SkiffResult<PumpEvent> {
        let Some(channel) = self.channels.get_mut(&id) else {
            trace!(id, "data for unknown channel dropped");
            return Ok(PumpEvent::Transport);
        };
        let remote_id = channel.remote_id();
        if let Some(increment) = channel.push_data(data) {
            let adjust = ChannelWindowAdjust {
                recipient_channel: remote_id,
                bytes_to_add: increment,
            };
            if self.in_kex {
                self.deferred_window_adjusts.push(adjust);
            } else {
                self.send_packet(&adjust.to_bytes()).await?;
            }
        }
        Ok(PumpEvent::ChannelUpdate(id))
    }

    // ----- channels --------------------------------------------------------

    /// Opens a session channel; with `want_shell` a pty and shell are
    /// requested on it.
    pub async fn open_session(&mut self, want_shell: bool) -> SkiffResult<u32> {
        let id = self.next_channel_id;
        self.next_channel_id += 1;
        self.channels
            .insert(id, SshChannel::new(id, INITIAL_WINDOW_SIZE));

        self.send_packet(&ChannelOpen::session(id).to_bytes()).await?;

        loop {
            match self.pump_packet(self.config.read_timeout).await? {
                PumpEvent::OpenConfirmed(cid) if cid == id => break,
                PumpEvent::OpenFailed { channel, description } if channel == id => {
                    let err = SkiffError::ChannelOpenRejected(description);
                    self.error_log.push(id as i32, err.to_string());
                    return Err(err);
                }
                _ => continue,
            }
        }

        if want_shell {
            let remote_id = self.remote_id(id)?;
            let pty = ChannelRequest {
                recipient_channel: remote_id,
                request: ChannelRequestType::PtyReq {
                    term: "vt100".to_string(),
                    width_chars: 80,
                    height_rows: 24,
                    width_px: 0,
                    height_px: 0,
                },
                want_reply: false,
            };
            self.send_packet(&pty.to_bytes()).await?;

            let shell = ChannelRequest {
                recipient_channel: remote_id,
                request: ChannelRequestType::Shell,
                want_reply: false,
            };
            self.send_packet(&shell.to_bytes()).await?;
        }

        Ok(id)
    }

    fn remote_id(&self, id: u32) -> SkiffResult<u32> {
        self.channels
            .get(&id)
            .filter(|c| !c.is_closed())
            .map(|c| c.remote_id())
            .ok_or(SkiffError::ChannelClosed)
    }

    /// Issues a want-reply channel request and awaits the verdict.
    async fn channel_request(&mut self, id: u32, request: ChannelRequestType) -> SkiffResult<()> {
        let remote_id = self.remote_id(id)?;
        let name = request.name();
        if let Some(channel) = self.channels.get_mut(&id) {
            channel.set_state(ChannelState::RequestPending);
        }

        let msg = ChannelRequest {
            recipient_channel: remote_id,
            request,
            want_reply: true,
        };
        self.send_packet(&msg.to_bytes()).await?;

        loop {
            match self.pump_packet(self.config.read_timeout).await? {
                PumpEvent::RequestOutcome { channel, success } if channel == id => {
                    if success {
                        return Ok(());
                    }
                    let err =
                        SkiffError::ChannelOpenRejected(format!("'{}' request refused", name));
                    self.error_log.push(id as i32, err.to_string());
                    return Err(err);
                }
                _ => continue,
            }
        }
    }

    /// Executes a command on the channel (`exec` request).
    pub async fn request_exec(&mut self, id: u32, command: &[u8]) -> SkiffResult<()> {
        self.channel_request(
            id,
            ChannelRequestType::Exec {
                command: command.to_vec(),
            },
        )
        .await
    }

    /// Starts a subsystem such as `sftp` on the channel.
    pub async fn request_subsystem(&mut self, id: u32, name: &str) -> SkiffResult<()> {
        self.channel_request(
            id,
            ChannelRequestType::Subsystem {
                name: name.to_string(),
            },
        )
        .await
    }

    /// Sends data on a channel, splitting it to honour the peer's window
    /// and maximum packet size.
    pub async fn send(&mut self, id: u32, data: &[u8]) -> SkiffResult<()> {
        let mut offset = 0;
        while offset < data.len() {
            if self.transport.needs_rekey() {
                debug!("transferred byte threshold reached, rekeying");
                self.rekey().await?;
            }
            let (remote_id, chunk_len) = {
                let channel = self
                    .channels
                    .get(&id)
                    .filter(|c| c.is_writable())
                    .ok_or(SkiffError::ChannelClosed)?;
                (channel.remote_id(), channel.max_chunk().min(data.len() - offset))
            };

            if chunk_len == 0 {
                // Window exhausted: wait for a WINDOW_ADJUST.
                self.pump_packet(self.config.read_timeout).await?;
                continue;
            }

            let msg = ChannelData {
                recipient_channel: remote_id,
                data: data[offset..offset + chunk_len].to_vec(),
            };
            self.send_packet(&msg.to_bytes()).await?;
            self.channels
                .get_mut(&id)
                .ok_or(SkiffError::ChannelClosed)?
                .consume_peer_window(chunk_len as u32)?;
            offset += chunk_len;
        }
        Ok(())
    }

    /// Drains whatever has been received on the channel.
    ///
    /// Pending socket data is pulled in without blocking first; the result
    /// is an owned snapshot of the receive buffer.
    pub async fn read(&mut self, id: u32) -> SkiffResult<Vec<u8>> {
        self.pump_available().await?;
        let channel = self
            .channels
            .get_mut(&id)
            .ok_or(SkiffError::ChannelClosed)?;
        Ok(channel.take_buffer())
    }

    /// Bytes currently buffered on the channel.
    pub fn received_size(&self, id: u32) -> usize {
        self.channels.get(&id).map(|c| c.buffered_len()).unwrap_or(0)
    }

    /// Receives and dispatches one packet, for layers stacked on a channel.
    pub(crate) async fn pump_once(&mut self, timeout: Duration) -> SkiffResult<()> {
        self.pump_packet(timeout).await.map(|_| ())
    }

    /// Pumps packets that are already available without waiting.
    async fn pump_available(&mut self) -> SkiffResult<()> {
        loop {
            match self.pump_packet(Duration::ZERO).await {
                Ok(_) => continue,
                Err(SkiffError::Timeout) => return Ok(()),
                Err(err) => return Err(err),
            }
        }
    }

    /// Waits until `needle` shows up in the channel's receive buffer.
    ///
    /// Returns `false` on timeout. A zero timeout polls once: buffered
    /// socket data is considered, but nothing is waited for.
    pub async fn wait_for(
        &mut self,
        id: u32,
        needle: &[u8],
        timeout: Duration,
    ) -> SkiffResult<bool> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            self.pump_available().await?;
            let channel = self.channels.get(&id).ok_or(SkiffError::ChannelClosed)?;
            if contains(channel.buffer(), needle) {
                return Ok(true);
            }
            if channel.is_closed() || channel.peer_eof() {
                return Ok(false);
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(false);
            }

            match self.pump_packet(deadline - now).await {
                Ok(_) => continue,
                Err(SkiffError::Timeout) => return Ok(false),
                Err(err) => return Err(err),
            }
        }
    }

    /// Closes a channel: EOF, CLOSE, then wait for the peer's CLOSE.
    pub async fn close(&mut self, id: u32) -> SkiffResult<()> {
        let (remote_id, already_closed) = {
            let Some(channel) = self.channels.get(&id) else {
                return Err(SkiffError::ChannelClosed);
            };
            (channel.remote_id(), channel.is_closed())
        };

        if !already_closed {
            if let Some(channel) = self.channels.get_mut(&id) {
                channel.set_state(ChannelState::EofSent);
            }
            self.send_packet(&ChannelEof { recipient_channel: remote_id }.to_bytes())
                .await?;

            if let Some(channel) = self.channels.get_mut(&id) {
                channel.set_state(ChannelState::CloseSent);
            }
            self.send_packet(&ChannelClose { recipient_channel: remote_id }.to_bytes())
                .await?;

            // The channel is done only once the peer's CLOSE arrives.
            while !self.channels.get(&id).map(|c| c.is_closed()).unwrap_or(true) {
                match self.pump_packet(self.config.read_timeout).await {
                    Ok(_) => continue,
                    Err(SkiffError::Timeout) => break,
                    Err(err) => return Err(err),
                }
            }
        }

        self.channels.remove(&id);
        debug!(id, "channel closed");
        Ok(())
    }

    /// Runs one command on a fresh channel and returns its output.
    pub async fn send_cmd(&mut self, command: &[u8], timeout: Duration) -> SkiffResult<Vec<u8>> {
        let id = self.open_session(false).await?;
        self.request_exec(id, command).await?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let channel = self.channels.get(&id).ok_or(SkiffError::ChannelClosed)?;
            if channel.is_closed() || channel.peer_eof() {
                break;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                break;
            }
            match self.pump_packet(deadline - now).await {
                Ok(_) => continue,
                Err(SkiffError::Timeout) => break,
                Err(err) => return Err(err),
            }
        }

        let output = self
            .channels
            .get_mut(&id)
            .map(|c| c.take_buffer())
            .unwrap_or_default();
        self.close(id).await?;
        Ok(output)
    }

    /// Opens a session channel running the `sftp` subsystem.
    pub async fn open_sftp_channel(&mut self) -> SkiffResult<u32> {
        let id = self.open_session(false).await?;
        self.request_subsystem(id, "sftp").await?;
        Ok(id)
    }

    /// Sends SSH_MSG_DISCONNECT and tears the session down.
    pub async fn disconnect(&mut self) -> SkiffResult<()> {
        let mut w = Writer::new();
        w.u8(MessageType::Disconnect as u8);
        w.u32(11); // SSH_DISCONNECT_BY_APPLICATION
        w.string(b"closing session");
        w.string(b"");
        let _ = self.send_packet(&w.finish()).await;

        let _ = self.transport.transition(State::Closing);
        self.transport.mark_closed();
        let _ = self.stream.shutdown().await;
        Ok(())
    }

    // ----- accessors -------------------------------------------------------

    /// The diagnostic sink.
    pub fn errors(&self) -> Arc<ErrorLog> {
        Arc::clone(&self.error_log)
    }

    /// The authenticated user, once authentication succeeded.
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Whether authentication has completed.
    pub fn is_authenticated(&self) -> bool {
        self.username.is_some()
    }

    /// The session identifier (exchange hash of the first kex).
    pub fn session_id(&self) -> Option<&[u8]> {
        self.session_id.as_deref()
    }

    /// The server address this session is connected to.
    pub fn server_address(&self) -> &str {
        &self.server_addr
    }

    /// The current session state.
    pub fn state(&self) -> State {
        self.transport.current()
    }

    /// The per-read timeout used by blocking operations.
    pub fn read_timeout(&self) -> Duration {
        self.config.read_timeout
    }
}

async fn bounded<T>(
    procedure: impl std::future::Future<Output = SkiffResult<T>>,
    timeout_secs: u64,
) -> SkiffResult<T> {
    if timeout_secs == 0 {
        procedure.await
    } else {
        match tokio::time::timeout(Duration::from_secs(timeout_secs), procedure).await {
            Ok(result) => result,
            Err(_) => Err(SkiffError::Timeout),
        }
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}
