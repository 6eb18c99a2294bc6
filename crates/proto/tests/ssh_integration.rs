//! Integration tests against a scripted mock server.
//!
//! The mock server is built from this crate's own wire and crypto
//! primitives and drives the exact byte sequences of the protocol flows:
//! identification + KEXINIT observation, a full DH handshake with password
//! authentication, channel window accounting, a mid-stream rekey, and an
//! SFTP download.

use num_bigint::BigUint;
use skiff_platform::SkiffError;
use skiff_proto::ssh::client::{SshClient, SshClientConfig};
use skiff_proto::ssh::connection::{
    ChannelData, ChannelOpenConfirmation, ChannelWindowAdjust,
};
use skiff_proto::ssh::crypto::{
    CipherAlgorithm, DecryptionKey, EncryptionKey, MacAlgorithm, MacKey,
};
use skiff_proto::ssh::kex::{KexInit, NewKeys};
use skiff_proto::ssh::kex_dh::{derive_key, exchange_hash, DhExchange, DhGroup, KexdhReply};
use skiff_proto::ssh::message::MessageType;
use skiff_proto::ssh::packet::Packet;
use skiff_proto::ssh::privatekey::KeyPair;
use skiff_proto::ssh::sftp::{SftpMessage, SftpMessageType, SftpSession};
use skiff_proto::ssh::wire::{Reader, Writer};
use skiff_proto::ErrorLog;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

// ----- mock server plumbing -------------------------------------------------

/// Framed packet I/O for the server side of the mock conversation.
struct ServerTransport {
    stream: TcpStream,
    enc: Option<EncryptionKey>,
    dec: Option<DecryptionKey>,
    mac_out: Option<MacKey>,
    mac_in: Option<MacKey>,
    tx_seq: u32,
    rx_seq: u32,
}

impl ServerTransport {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            enc: None,
            dec: None,
            mac_out: None,
            mac_in: None,
            tx_seq: 0,
            rx_seq: 0,
        }
    }

    async fn exchange_idents(&mut self, banner_lines: &[&str]) -> (String, String) {
        for line in banner_lines {
            self.stream
                .write_all(format!("{}\r\n", line).as_bytes())
                .await
                .unwrap();
        }
        let server_ident = "SSH-2.0-testsrv";
        self.stream
            .write_all(b"SSH-2.0-testsrv\r\n")
            .await
            .unwrap();

        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            self.stream.read_exact(&mut byte).await.unwrap();
            if byte[0] == b'\n' {
                break;
            }
            line.push(byte[0]);
        }
        while line.last() == Some(&b'\r') {
            line.pop();
        }
        let client_ident = String::from_utf8(line).unwrap();
        assert!(client_ident.starts_with("SSH-2.0-"));
        (client_ident, server_ident.to_string())
    }

    fn block_size(&self) -> usize {
        self.enc
            .as_ref()
            .map(|e| e.algorithm().block_size().max(8))
            .unwrap_or(8)
    }

    async fn send(&mut self, payload: &[u8]) {
        let packet = Packet::new(payload.to_vec(), self.block_size());
        let mut bytes = packet.to_bytes();
        let mac = match &self.mac_out {
            Some(mac) => mac.compute(self.tx_seq, &bytes),
            None => Vec::new(),
        };
        if let Some(enc) = &mut self.enc {
            enc.encrypt(&mut bytes).unwrap();
        }
        self.tx_seq = self.tx_seq.wrapping_add(1);
        self.stream.write_all(&bytes).await.unwrap();
        if !mac.is_empty() {
            self.stream.write_all(&mac).await.unwrap();
        }
    }

    async fn recv(&mut self) -> Vec<u8> {
        let plaintext = if let Some(dec) = &mut self.dec {
            let block = dec.algorithm().block_size().max(8);
            let mut first = vec![0u8; block];
            self.stream.read_exact(&mut first).await.unwrap();
            dec.decrypt(&mut first).unwrap();

            let len =
                u32::from_be_bytes([first[0], first[1], first[2], first[3]]) as usize;
            let mut rest = vec![0u8; 4 + len - block];
            self.stream.read_exact(&mut rest).await.unwrap();
            dec.decrypt(&mut rest).unwrap();

            let mut plaintext = first;
            plaintext.extend_from_slice(&rest);

            let mac_in = self.mac_in.as_ref().expect("MAC installed with cipher");
            let mut trailer = vec![0u8; mac_in.algorithm().mac_size()];
            self.stream.read_exact(&mut trailer).await.unwrap();
            mac_in.verify(self.rx_seq, &plaintext, &trailer).unwrap();
            plaintext
        } else {
            let mut len_bytes = [0u8; 4];
            self.stream.read_exact(&mut len_bytes).await.unwrap();
            let len = u32::from_be_bytes(len_bytes) as usize;
            let mut rest = vec![0u8; len];
            self.stream.read_exact(&mut rest).await.unwrap();
            let mut plaintext = len_bytes.to_vec();
            plaintext.extend_from_slice(&rest);
            plaintext
        };

        self.rx_seq = self.rx_seq.wrapping_add(1);
        Packet::from_bytes(&plaintext).unwrap().payload().to_vec()
    }

    /// Runs the server side of one DH group1 exchange and installs keys.
    ///
    /// `session_id` is `None` for the first exchange and the original
    /// identifier on a rekey. `pre_exchanged` carries the
    /// (server, client) KEXINIT payloads when the caller has already
    /// traded them, as a rekey initiator does.
    async fn run_kex(
        &mut self,
        client_ident: &str,
        server_ident: &str,
        host_key: &KeyPair,
        session_id: Option<Vec<u8>>,
        pre_exchanged: Option<(Vec<u8>, Vec<u8>)>,
    ) -> Vec<u8> {
        let (server_kexinit, client_kexinit) = match pre_exchanged {
            Some(payloads) => payloads,
            None => {
                let server_kexinit = KexInit::new_default().to_bytes();
                self.send(&server_kexinit).await;
                let client_kexinit = self.recv().await;
                assert_eq!(client_kexinit[0], MessageType::KexInit as u8);
                (server_kexinit, client_kexinit)
            }
        };

        // Group1 leads both preference lists.
        let dh_init = self.recv().await;
        assert_eq!(dh_init[0], MessageType::KexdhInit as u8);
        let mut r = Reader::new(&dh_init[1..]);
        let e = r.mpint().unwrap();
        let p = DhGroup::Group1.prime();
        assert!(e > BigUint::from(1u32));
        assert!(&e < &(p - 1u32));

        let dh = DhExchange::new(DhGroup::Group1);
        let f = dh.public_value();
        let k = dh.compute_shared_secret(&e).unwrap();

        let host_key_blob = host_key.public_key_blob().to_vec();
        let h = exchange_hash(
            client_ident.as_bytes(),
            server_ident.as_bytes(),
            &client_kexinit,
            &server_kexinit,
            &host_key_blob,
            &e,
            &f,
            &k,
        );
        let signature = host_key.sign_raw(&h).unwrap();

        let reply = KexdhReply {
            host_key: host_key_blob,
            f,
            signature,
        };
        self.send(&reply.to_bytes()).await;
        self.send(&NewKeys::new().to_bytes()).await;

        let newkeys = self.recv().await;
        assert_eq!(newkeys, vec![MessageType::NewKeys as u8]);

        // Both default lists lead with aes256-cbc and hmac-md5.
        let sid = session_id.unwrap_or_else(|| h.clone());
        let cipher = CipherAlgorithm::Aes256Cbc;
        let mac = MacAlgorithm::HmacMd5;

        let iv_c2s = derive_key(&k, &h, &sid, b'A', cipher.iv_size());
        let iv_s2c = derive_key(&k, &h, &sid, b'B', cipher.iv_size());
        let key_c2s = derive_key(&k, &h, &sid, b'C', cipher.key_size());
        let key_s2c = derive_key(&k, &h, &sid, b'D', cipher.key_size());
        let mac_c2s = derive_key(&k, &h, &sid, b'E', mac.key_size());
        let mac_s2c = derive_key(&k, &h, &sid, b'F', mac.key_size());

        self.enc = Some(EncryptionKey::new(cipher, &key_s2c, &iv_s2c).unwrap());
        self.dec = Some(DecryptionKey::new(cipher, &key_c2s, &iv_c2s).unwrap());
        self.mac_out = Some(MacKey::new(mac, &mac_s2c).unwrap());
        self.mac_in = Some(MacKey::new(mac, &mac_c2s).unwrap());

        sid
    }

    /// Accepts `ssh-userauth`, then a password request for `pw`.
    async fn run_password_auth(&mut self) {
        let service_request = self.recv().await;
        assert_eq!(service_request[0], MessageType::ServiceRequest as u8);
        let mut r = Reader::new(&service_request[1..]);
        assert_eq!(r.utf8_string().unwrap(), "ssh-userauth");

        let mut accept = Writer::new();
        accept.u8(MessageType::ServiceAccept as u8);
        accept.string(b"ssh-userauth");
        self.send(&accept.finish()).await;

        let auth_request = self.recv().await;
        assert_eq!(auth_request[0], MessageType::UserauthRequest as u8);
        let mut r = Reader::new(&auth_request[1..]);
        assert_eq!(r.utf8_string().unwrap(), "testuser");
        assert_eq!(r.utf8_string().unwrap(), "ssh-connection");
        assert_eq!(r.utf8_string().unwrap(), "password");
        assert!(!r.bool().unwrap());
        assert_eq!(r.string().unwrap(), b"pw");

        self.send(&[MessageType::UserauthSuccess as u8]).await;
    }

    /// Confirms a session channel open with the given window and packet cap.
    async fn accept_channel(&mut self, window: u32, max_packet: u32) -> (u32, u32) {
        let open = self.recv().await;
        assert_eq!(open[0], MessageType::ChannelOpen as u8);
        let mut r = Reader::new(&open[1..]);
        assert_eq!(r.utf8_string().unwrap(), "session");
        let client_channel = r.u32().unwrap();
        let client_window = r.u32().unwrap();
        assert_eq!(client_window, 0x7FFF_FFFF);
        let _client_max_packet = r.u32().unwrap();

        let server_channel = 7u32;
        let mut confirm = Writer::new();
        confirm.u8(MessageType::ChannelOpenConfirmation as u8);
        confirm.u32(client_channel);
        confirm.u32(server_channel);
        confirm.u32(window);
        confirm.u32(max_packet);
        self.send(&confirm.finish()).await;

        (client_channel, server_channel)
    }
}

fn test_config() -> SshClientConfig {
    SshClientConfig {
        read_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

async fn connect_client(port: u16) -> SshClient {
    SshClient::connect_with_config(
        &format!("127.0.0.1:{}", port),
        test_config(),
        Arc::new(ErrorLog::new()),
    )
    .await
    .unwrap()
}

fn host_key() -> KeyPair {
    KeyPair::generate_dsa(1024).unwrap()
}

// ----- tests ----------------------------------------------------------------

/// The client opens with a well-formed identification line, a parseable
/// KEXINIT carrying the classic suites, and a group1 KEXDH_INIT whose
/// public value is in range. Packet framing invariants hold for both.
#[tokio::test]
async fn test_identification_and_kexinit() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut transport = ServerTransport::new(stream);
        let (client_ident, _) = transport
            .exchange_idents(&["Welcome to the test server", "Second banner line"])
            .await;
        assert!(client_ident.starts_with("SSH-2.0-Skiff_"));

        // First framed packet must be KEXINIT with the expected suites.
        let kexinit_payload = transport.recv().await;
        assert_eq!(kexinit_payload[0], MessageType::KexInit as u8);
        let kexinit = KexInit::from_bytes(&kexinit_payload).unwrap();
        assert_eq!(
            kexinit.kex_algorithms()[0],
            "diffie-hellman-group1-sha1"
        );
        assert!(kexinit
            .encryption_algorithms_client_to_server()
            .contains(&"3des-cbc".to_string()));
        assert!(kexinit
            .mac_algorithms_client_to_server()
            .contains(&"hmac-sha1".to_string()));
        assert!(!kexinit.first_kex_packet_follows());

        // Answer with our KEXINIT so the client proceeds to KEXDH_INIT.
        transport.send(&KexInit::new_default().to_bytes()).await;

        let dh_init = transport.recv().await;
        assert_eq!(dh_init[0], MessageType::KexdhInit as u8);
        let mut r = Reader::new(&dh_init[1..]);
        let e = r.mpint().unwrap();
        let p = DhGroup::Group1.prime();
        assert!(e > BigUint::from(1u32));
        assert!(&e < &(p - 1u32));

        // Sequence numbers: KEXINIT was packet 0, KEXDH_INIT packet 1.
        assert_eq!(transport.rx_seq, 2);
    });

    // The mock stops mid-kex, so the client errors out; only the
    // server-side observations matter here.
    let result = SshClient::connect_with_config(
        &format!("127.0.0.1:{}", port),
        test_config(),
        Arc::new(ErrorLog::new()),
    )
    .await;
    assert!(result.is_err());

    server.await.unwrap();
}

/// Full handshake, password authentication, channel open, and window
/// accounting: a 0x2500-byte write against a 0x1000-byte window with
/// 0x200-byte packets splits into 19 DATA messages and stalls at the
/// window boundary until a WINDOW_ADJUST arrives.
#[tokio::test]
async fn test_password_auth_and_window_accounting() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let key = host_key();

    const DATA_LEN: usize = 0x2500;
    const WINDOW: u32 = 0x1000;
    const MAX_PACKET: u32 = 0x200;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut transport = ServerTransport::new(stream);
        let (client_ident, server_ident) = transport.exchange_idents(&[]).await;
        transport
            .run_kex(&client_ident, &server_ident, &key, None, None)
            .await;
        transport.run_password_auth().await;

        let (_client_channel, server_channel) =
            transport.accept_channel(WINDOW, MAX_PACKET).await;

        // Collect DATA until the advertised window is exhausted.
        let mut messages = 0usize;
        let mut received = Vec::new();
        while received.len() < WINDOW as usize {
            let payload = transport.recv().await;
            assert_eq!(payload[0], MessageType::ChannelData as u8);
            let data = ChannelData::from_bytes(&payload).unwrap();
            assert_eq!(data.recipient_channel, server_channel);
            assert!(data.data.len() <= MAX_PACKET as usize);
            received.extend_from_slice(&data.data);
            messages += 1;
        }
        assert_eq!(received.len(), WINDOW as usize);

        // The client must now be stalled on the closed window.
        let mut probe = [0u8; 1];
        let stalled = tokio::time::timeout(
            Duration::from_millis(300),
            transport.stream.read_exact(&mut probe),
        )
        .await;
        assert!(stalled.is_err(), "client wrote past the window");

        // Replenish and collect the rest.
        let adjust = ChannelWindowAdjust {
            recipient_channel: 0,
            bytes_to_add: 0x2000,
        };
        transport.send(&adjust.to_bytes()).await;

        while received.len() < DATA_LEN {
            let payload = transport.recv().await;
            assert_eq!(payload[0], MessageType::ChannelData as u8);
            let data = ChannelData::from_bytes(&payload).unwrap();
            assert!(data.data.len() <= MAX_PACKET as usize);
            received.extend_from_slice(&data.data);
            messages += 1;
        }

        assert_eq!(messages, DATA_LEN.div_ceil(MAX_PACKET as usize));
        assert_eq!(received, vec![0xA5u8; DATA_LEN]);

        // Channel teardown: EOF, CLOSE, reply CLOSE.
        let eof = transport.recv().await;
        assert_eq!(eof[0], MessageType::ChannelEof as u8);
        let close = transport.recv().await;
        assert_eq!(close[0], MessageType::ChannelClose as u8);

        let mut reply = Writer::new();
        reply.u8(MessageType::ChannelClose as u8);
        reply.u32(0);
        transport.send(&reply.finish()).await;
    });

    let mut client = connect_client(port).await;
    client.authenticate_password("testuser", "pw").await.unwrap();
    assert!(client.is_authenticated());
    assert_eq!(client.session_id().map(|s| s.len()), Some(20));

    let channel = client.open_session(false).await.unwrap();
    assert_eq!(channel, 0);

    client.send(channel, &vec![0xA5u8; DATA_LEN]).await.unwrap();
    client.close(channel).await.unwrap();

    server.await.unwrap();
}

/// Authentication failure surfaces the allowed-methods list.
#[tokio::test]
async fn test_password_auth_failure() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let key = host_key();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut transport = ServerTransport::new(stream);
        let (client_ident, server_ident) = transport.exchange_idents(&[]).await;
        transport
            .run_kex(&client_ident, &server_ident, &key, None, None)
            .await;

        let _service_request = transport.recv().await;
        let mut accept = Writer::new();
        accept.u8(MessageType::ServiceAccept as u8);
        accept.string(b"ssh-userauth");
        transport.send(&accept.finish()).await;

        let _auth_request = transport.recv().await;
        let mut failure = Writer::new();
        failure.u8(MessageType::UserauthFailure as u8);
        failure.string(b"publickey,password");
        failure.bool(false);
        transport.send(&failure.finish()).await;
    });

    let mut client = connect_client(port).await;
    let err = client
        .authenticate_password("testuser", "wrong")
        .await
        .unwrap_err();
    match err {
        SkiffError::AuthFailed { methods, partial } => {
            assert_eq!(methods, "publickey,password");
            assert!(!partial);
        }
        other => panic!("expected AuthFailed, got {:?}", other),
    }
    assert!(!client.errors().is_empty());

    server.await.unwrap();
}

/// Public key authentication with a 1024-bit DSA key: the probe comes
/// without a signature, the signed request carries an `ssh-dss` blob whose
/// inner signature is exactly 40 bytes, and the signature verifies over
/// `string(session_id) || request body`.
#[tokio::test]
async fn test_publickey_auth_dsa() {
    use skiff_proto::ssh::auth::signature_data;
    use skiff_proto::ssh::hostkey::HostKey;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let host = host_key();

    // The user key travels through its PEM form, like a key file would.
    let user_key = KeyPair::generate_dsa(1024).unwrap();
    let user_key_pem = user_key.to_pem();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut transport = ServerTransport::new(stream);
        let (client_ident, server_ident) = transport.exchange_idents(&[]).await;
        let session_id = transport
            .run_kex(&client_ident, &server_ident, &host, None, None)
            .await;

        let _service_request = transport.recv().await;
        let mut accept = Writer::new();
        accept.u8(MessageType::ServiceAccept as u8);
        accept.string(b"ssh-userauth");
        transport.send(&accept.finish()).await;

        // Probe: no signature yet.
        let probe = transport.recv().await;
        let mut r = Reader::new(&probe[1..]);
        assert_eq!(r.utf8_string().unwrap(), "testuser");
        assert_eq!(r.utf8_string().unwrap(), "ssh-connection");
        assert_eq!(r.utf8_string().unwrap(), "publickey");
        assert!(!r.bool().unwrap());
        assert_eq!(r.utf8_string().unwrap(), "ssh-dss");
        let offered_blob = r.string().unwrap().to_vec();

        let mut pk_ok = Writer::new();
        pk_ok.u8(MessageType::UserauthPkOk as u8);
        pk_ok.string(b"ssh-dss");
        pk_ok.string(&offered_blob);
        transport.send(&pk_ok.finish()).await;

        // Signed request.
        let signed = transport.recv().await;
        let mut r = Reader::new(&signed[1..]);
        let user = r.utf8_string().unwrap().to_string();
        let _service = r.utf8_string().unwrap();
        assert_eq!(r.utf8_string().unwrap(), "publickey");
        assert!(r.bool().unwrap());
        let algorithm = r.utf8_string().unwrap().to_string();
        let blob = r.string().unwrap().to_vec();
        let signature_blob = r.string().unwrap().to_vec();

        assert_eq!(algorithm, "ssh-dss");
        assert_eq!(blob, offered_blob);

        // The signature blob itself: string "ssh-dss" || string(40 bytes).
        let mut sig_reader = Reader::new(&signature_blob);
        assert_eq!(sig_reader.string().unwrap(), b"ssh-dss");
        assert_eq!(sig_reader.string().unwrap().len(), 40);

        // Verify over string(session_id) || request body.
        let body = signature_data(&user, "ssh-connection", &algorithm, &blob);
        let mut signed_over = Writer::new();
        signed_over.string(&session_id);
        signed_over.raw(&body);
        let public_key = HostKey::from_blob(&blob).unwrap();
        public_key.verify(&signed_over.finish(), &signature_blob).unwrap();

        transport.send(&[MessageType::UserauthSuccess as u8]).await;
    });

    let mut client = connect_client(port).await;
    let key = KeyPair::from_pem(&user_key_pem).unwrap();
    client
        .authenticate_public_key("testuser", &key)
        .await
        .unwrap();
    assert!(client.is_authenticated());

    server.await.unwrap();
}

/// A server-initiated rekey mid-stream: the first DATA packet after
/// NEWKEYS decrypts under the new keys and the sequence numbers run on
/// without a reset.
#[tokio::test]
async fn test_rekey_mid_stream() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let key = host_key();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut transport = ServerTransport::new(stream);
        let (client_ident, server_ident) = transport.exchange_idents(&[]).await;
        let session_id = transport
            .run_kex(&client_ident, &server_ident, &key, None, None)
            .await;
        transport.run_password_auth().await;
        let (client_channel, server_channel) =
            transport.accept_channel(0x10000, 0x4000).await;

        // Pre-rekey traffic.
        let data = ChannelData {
            recipient_channel: client_channel,
            data: b"before-rekey ".to_vec(),
        };
        transport.send(&data.to_bytes()).await;

        let seq_before = transport.tx_seq;

        // Initiate the rekey; the client answers with its own KEXINIT.
        let server_kexinit = KexInit::new_default().to_bytes();
        transport.send(&server_kexinit).await;
        let client_kexinit = transport.recv().await;
        assert_eq!(client_kexinit[0], MessageType::KexInit as u8);

        let _ = transport
            .run_kex(
                &client_ident,
                &server_ident,
                &key,
                Some(session_id),
                Some((server_kexinit, client_kexinit)),
            )
            .await;

        // Sequence numbers continue across the rekey.
        assert!(transport.tx_seq > seq_before);

        let data = ChannelData {
            recipient_channel: client_channel,
            data: b"after-rekey".to_vec(),
        };
        transport.send(&data.to_bytes()).await;

        // Drain the teardown.
        let eof = transport.recv().await;
        assert_eq!(eof[0], MessageType::ChannelEof as u8);
        let close = transport.recv().await;
        assert_eq!(close[0], MessageType::ChannelClose as u8);
        let mut reply = Writer::new();
        reply.u8(MessageType::ChannelClose as u8);
        reply.u32(client_channel);
        transport.send(&reply.finish()).await;
        let _ = server_channel;
    });

    let mut client = connect_client(port).await;
    client.authenticate_password("testuser", "pw").await.unwrap();
    let channel = client.open_session(false).await.unwrap();

    // The rekey happens while the client is waiting for data; both the
    // pre- and post-rekey payloads must land in the buffer.
    let found = client
        .wait_for(channel, b"after-rekey", Duration::from_secs(10))
        .await
        .unwrap();
    assert!(found);

    let buffered = client.read(channel).await.unwrap();
    assert_eq!(buffered, b"before-rekey after-rekey");

    client.close(channel).await.unwrap();
    server.await.unwrap();
}

/// SFTP download of a 30001-byte file: exactly two READ requests (30000 +
/// 1 bytes) before the EOF status, and the local copy matches the remote
/// bytes.
#[tokio::test]
async fn test_sftp_get_chunking() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let key = host_key();

    let remote_content: Vec<u8> = (0..30001u32).map(|i| (i % 251) as u8).collect();
    let remote_for_server = remote_content.clone();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut transport = ServerTransport::new(stream);
        let (client_ident, server_ident) = transport.exchange_idents(&[]).await;
        transport
            .run_kex(&client_ident, &server_ident, &key, None, None)
            .await;
        transport.run_password_auth().await;
        let (client_channel, server_channel) =
            transport.accept_channel(0x100000, 0x8000).await;

        // subsystem "sftp" with want-reply.
        let request = transport.recv().await;
        assert_eq!(request[0], MessageType::ChannelRequest as u8);
        let mut r = Reader::new(&request[1..]);
        assert_eq!(r.u32().unwrap(), server_channel);
        assert_eq!(r.utf8_string().unwrap(), "subsystem");
        assert!(r.bool().unwrap());
        assert_eq!(r.utf8_string().unwrap(), "sftp");

        let mut success = Writer::new();
        success.u8(MessageType::ChannelSuccess as u8);
        success.u32(client_channel);
        transport.send(&success.finish()).await;

        let mut sftp = SftpChannel {
            transport,
            client_channel,
            inbox: skiff_proto::ssh::sftp::message::SftpInbox::new(),
        };

        // INIT -> VERSION 3.
        let init = sftp.recv().await;
        assert_eq!(init.msg_type, SftpMessageType::Init);
        let mut version = Writer::new();
        version.u32(3);
        sftp.send(SftpMessage::new(SftpMessageType::Version, version.finish()))
            .await;

        // OPEN -> HANDLE.
        let open = sftp.recv().await;
        assert_eq!(open.msg_type, SftpMessageType::Open);
        let mut r = Reader::new(&open.payload);
        let open_id = r.u32().unwrap();
        assert_eq!(r.utf8_string().unwrap(), "/srv/blob.bin");
        let mut handle = Writer::new();
        handle.u32(open_id);
        handle.string(b"H1");
        sftp.send(SftpMessage::new(SftpMessageType::Handle, handle.finish()))
            .await;

        // Two READs then EOF.
        let mut reads = 0usize;
        loop {
            eprintln!("SERVER waiting for next sftp message");
            let msg = sftp.recv().await;
            eprintln!("SERVER got msg_type={:?}", msg.msg_type);
            match msg.msg_type {
                SftpMessageType::Read => {
                    let mut r = Reader::new(&msg.payload);
                    let id = r.u32().unwrap();
                    assert_eq!(r.string().unwrap(), b"H1");
                    let offset = r.u64().unwrap() as usize;
                    let len = r.u32().unwrap() as usize;
                    eprintln!("SERVER READ offset={} len={}", offset, len);
                    assert_eq!(len, 30000);

                    if offset >= remote_for_server.len() {
                        let mut status = Writer::new();
                        status.u32(id);
                        status.u32(1); // SSH_FX_EOF
                        status.string(b"end of file");
                        status.string(b"");
                        sftp.send(SftpMessage::new(
                            SftpMessageType::Status,
                            status.finish(),
                        ))
                        .await;
                        continue;
                    }

                    reads += 1;
                    let end = (offset + len).min(remote_for_server.len());
                    let mut data = Writer::new();
                    data.u32(id);
                    data.string(&remote_for_server[offset..end]);
                    sftp.send(SftpMessage::new(SftpMessageType::Data, data.finish()))
                        .await;
                }
                SftpMessageType::Close => {
                    eprintln!("SERVER handling close");
                    let mut r = Reader::new(&msg.payload);
                    let id = r.u32().unwrap();
                    let mut status = Writer::new();
                    status.u32(id);
                    status.u32(0); // SSH_FX_OK
                    status.string(b"ok");
                    status.string(b"");
                    eprintln!("SERVER sending close status");
                    sftp.send(SftpMessage::new(SftpMessageType::Status, status.finish()))
                        .await;
                    eprintln!("SERVER sent close status, breaking");
                    break;
                }
                other => panic!("unexpected SFTP request {:?}", other),
            }
        }
        assert_eq!(reads, 2, "expected exactly two READ round trips");
    });

    let mut client = connect_client(port).await;
    client.authenticate_password("testuser", "pw").await.unwrap();

    let channel = client.open_sftp_channel().await.unwrap();
    let mut sftp = SftpSession::init(&mut client, channel).await.unwrap();

    let local_path = std::env::temp_dir().join(format!(
        "skiff-sftp-test-{}.bin",
        std::process::id()
    ));
    sftp.get("/srv/blob.bin", local_path.to_str().unwrap())
        .await
        .unwrap();

    let downloaded = std::fs::read(&local_path).unwrap();
    assert_eq!(downloaded, remote_content);
    let _ = std::fs::remove_file(&local_path);

    server.await.unwrap();
}

/// Server-side SFTP message plumbing over the channel.
struct SftpChannel {
    transport: ServerTransport,
    client_channel: u32,
    inbox: skiff_proto::ssh::sftp::message::SftpInbox,
}

impl SftpChannel {
    async fn send(&mut self, msg: SftpMessage) {
        let data = ChannelData {
            recipient_channel: self.client_channel,
            data: msg.to_bytes(),
        };
        self.transport.send(&data.to_bytes()).await;
    }

    async fn recv(&mut self) -> SftpMessage {
        loop {
            if let Some(msg) = self.inbox.next_message().unwrap() {
                return msg;
            }
            let payload = self.transport.recv().await;
            assert_eq!(payload[0], MessageType::ChannelData as u8);
            let data = ChannelData::from_bytes(&payload).unwrap();
            self.inbox.extend(&data.data);
        }
    }
}

/// Confirms the ChannelOpenConfirmation wire type is exercised by the
/// mock plumbing (parse what `accept_channel` emits).
#[test]
fn test_mock_confirmation_shape() {
    let mut confirm = Writer::new();
    confirm.u8(MessageType::ChannelOpenConfirmation as u8);
    confirm.u32(0);
    confirm.u32(7);
    confirm.u32(0x1000);
    confirm.u32(0x200);
    let parsed = ChannelOpenConfirmation::from_bytes(&confirm.finish()).unwrap();
    assert_eq!(parsed.sender_channel, 7);
    assert_eq!(parsed.initial_window_size, 0x1000);
}
