//! Diffie-Hellman key exchange (RFC 4253 Section 8).
//!
//! This module implements:
//! - diffie-hellman-group1-sha1 (Oakley group 2, 1024-bit MODP)
//! - diffie-hellman-group14-sha1 (group 14, 2048-bit MODP)
//!
//! plus the SHA-1 exchange hash and the RFC 4253 Section 7.2 key derivation
//! both of them share. The ephemeral exponent is zeroized on drop.
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::kex_dh::{DhExchange, DhGroup};
//!
//! let client = DhExchange::new(DhGroup::Group14);
//! let server = DhExchange::new(DhGroup::Group14);
//!
//! let k1 = client.compute_shared_secret(&server.public_value()).unwrap();
//! let k2 = server.compute_shared_secret(&client.public_value()).unwrap();
//! assert_eq!(k1, k2);
//! ```

use crate::ssh::message::MessageType;
use crate::ssh::wire::{self, Reader, Writer};
use num_bigint::{BigUint, RandBigInt};
use once_cell::sync::Lazy;
use sha1::{Digest, Sha1};
use skiff_platform::{SkiffError, SkiffResult};
use zeroize::Zeroize;

/// Oakley group 2 prime, 1024 bits (RFC 2409 Section 6.2).
static GROUP1_P: Lazy<BigUint> = Lazy::new(|| {
    BigUint::from_bytes_be(
        &hex::decode(
            "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
             29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
             EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
             E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
             EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE65381\
             FFFFFFFFFFFFFFFF",
        )
        .expect("valid hex"),
    )
});

/// Group 14 prime, 2048 bits (RFC 3526 Section 3).
static GROUP14_P: Lazy<BigUint> = Lazy::new(|| {
    BigUint::from_bytes_be(
        &hex::decode(
            "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
             29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
             EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
             E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
             EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D\
             C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F\
             83655D23DCA3AD961C62F356208552BB9ED529077096966D\
             670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
             E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9\
             DE2BCBF6955817183995497CEA956AE515D2261898FA0510\
             15728E5A8AACAA68FFFFFFFFFFFFFFFF",
        )
        .expect("valid hex"),
    )
});

/// MODP groups this library negotiates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhGroup {
    /// diffie-hellman-group1-sha1 (1024-bit).
    Group1,
    /// diffie-hellman-group14-sha1 (2048-bit).
    Group14,
}

impl DhGroup {
    /// The SSH algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            DhGroup::Group1 => "diffie-hellman-group1-sha1",
            DhGroup::Group14 => "diffie-hellman-group14-sha1",
        }
    }

    /// The group prime p.
    pub fn prime(&self) -> &'static BigUint {
        match self {
            DhGroup::Group1 => &GROUP1_P,
            DhGroup::Group14 => &GROUP14_P,
        }
    }

    /// The generator g (2 for both groups).
    pub fn generator(&self) -> BigUint {
        BigUint::from(2u32)
    }

    /// Parses a group from its SSH name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "diffie-hellman-group1-sha1" => Some(DhGroup::Group1),
            "diffie-hellman-group14-sha1" => Some(DhGroup::Group14),
            _ => None,
        }
    }
}

/// One side of a Diffie-Hellman exchange.
pub struct DhExchange {
    group: DhGroup,
    /// Private exponent x, big-endian.
    private_key: Vec<u8>,
    /// Public value g^x mod p, big-endian.
    public_key: Vec<u8>,
}

impl DhExchange {
    /// Generates an ephemeral key pair for `group`.
    ///
    /// The exponent is drawn from [1, q-1] where q = (p-1)/2.
    pub fn new(group: DhGroup) -> Self {
        let mut rng = rand::thread_rng();

        let q = (group.prime() - 1u32) >> 1;
        let x = rng.gen_biguint_range(&BigUint::from(1u32), &q);
        let e = group.generator().modpow(&x, group.prime());

        Self {
            group,
            private_key: x.to_bytes_be(),
            public_key: e.to_bytes_be(),
        }
    }

    /// The group this exchange runs in.
    pub fn group(&self) -> DhGroup {
        self.group
    }

    /// The public value e (or f, on the server side).
    pub fn public_value(&self) -> BigUint {
        BigUint::from_bytes_be(&self.public_key)
    }

    /// Computes the shared secret K from the peer's public value.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::BadHostKey`] when the peer value is outside
    /// (1, p-1); such values make the exchange degenerate.
    pub fn compute_shared_secret(&self, peer_public: &BigUint) -> SkiffResult<BigUint> {
        let p = self.group.prime();
        if peer_public <= &BigUint::from(1u32) || peer_public >= &(p - 1u32) {
            return Err(SkiffError::BadHostKey(
                "peer DH public value out of range".to_string(),
            ));
        }

        let x = BigUint::from_bytes_be(&self.private_key);
        Ok(peer_public.modpow(&x, p))
    }
}

impl Drop for DhExchange {
    fn drop(&mut self) {
        self.private_key.zeroize();
    }
}

/// SSH_MSG_KEXDH_INIT: the client's public value e.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexdhInit {
    /// e = g^x mod p.
    pub e: BigUint,
}

impl KexdhInit {
    /// Serializes the payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.u8(MessageType::KexdhInit as u8);
        w.mpint(&self.e);
        w.finish()
    }

    /// Parses the payload.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut r = Reader::new(data);
        let kind = r.u8()?;
        if kind != MessageType::KexdhInit as u8 {
            return Err(SkiffError::MalformedPacket(format!(
                "expected SSH_MSG_KEXDH_INIT (30), got {}",
                kind
            )));
        }
        Ok(Self { e: r.mpint()? })
    }
}

/// SSH_MSG_KEXDH_REPLY: host key blob, f, signature over H.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexdhReply {
    /// Server host key blob K_S.
    pub host_key: Vec<u8>,
    /// f = g^y mod p.
    pub f: BigUint,
    /// Signature blob over the exchange hash.
    pub signature: Vec<u8>,
}

impl KexdhReply {
    /// Serializes the payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.u8(MessageType::KexdhReply as u8);
        w.string(&self.host_key);
        w.mpint(&self.f);
        w.string(&self.signature);
        w.finish()
    }

    /// Parses the payload.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut r = Reader::new(data);
        let kind = r.u8()?;
        if kind != MessageType::KexdhReply as u8 {
            return Err(SkiffError::MalformedPacket(format!(
                "expected SSH_MSG_KEXDH_REPLY (31), got {}",
                kind
            )));
        }
        let host_key = r.string()?.to_vec();
        let f = r.mpint()?;
        let signature = r.string()?.to_vec();
        Ok(Self {
            host_key,
            f,
            signature,
        })
    }
}

/// Computes the exchange hash H (RFC 4253 Section 8).
///
/// ```text
/// H = SHA1( string(V_C) || string(V_S) || string(I_C) || string(I_S) ||
///           string(K_S) || mpint(e)   || mpint(f)   || mpint(K) )
/// ```
///
/// The identification strings are passed without their CR LF terminators.
/// The first H of a session becomes the session identifier and never
/// changes across rekeys.
#[allow(clippy::too_many_arguments)]
pub fn exchange_hash(
    client_ident: &[u8],
    server_ident: &[u8],
    client_kexinit: &[u8],
    server_kexinit: &[u8],
    host_key_blob: &[u8],
    e: &BigUint,
    f: &BigUint,
    k: &BigUint,
) -> Vec<u8> {
    let mut hasher = Sha1::new();

    let hash_string = |h: &mut Sha1, bytes: &[u8]| {
        h.update((bytes.len() as u32).to_be_bytes());
        h.update(bytes);
    };
    let hash_mpint = |h: &mut Sha1, n: &BigUint| {
        h.update(wire::encode_mpint(&n.to_bytes_be()));
    };

    hash_string(&mut hasher, client_ident); // V_C
    hash_string(&mut hasher, server_ident); // V_S
    hash_string(&mut hasher, client_kexinit); // I_C
    hash_string(&mut hasher, server_kexinit); // I_S
    hash_string(&mut hasher, host_key_blob); // K_S
    hash_mpint(&mut hasher, e); // e
    hash_mpint(&mut hasher, f); // f
    hash_mpint(&mut hasher, k); // K

    hasher.finalize().to_vec()
}

/// Derives one session key (RFC 4253 Section 7.2).
///
/// ```text
/// K1 = SHA1(K || H || letter || session_id)
/// Kn+1 = SHA1(K || H || K1 || K2 || ... || Kn)
/// ```
///
/// where K is in mpint form; the concatenation is truncated to
/// `key_length`. The letters are 'A'..'F' for IV c2s, IV s2c, enc c2s,
/// enc s2c, MAC c2s, MAC s2c.
pub fn derive_key(
    k: &BigUint,
    exchange_hash: &[u8],
    session_id: &[u8],
    letter: u8,
    key_length: usize,
) -> Vec<u8> {
    let k_mpint = wire::encode_mpint(&k.to_bytes_be());

    let mut output = Vec::with_capacity(key_length + 20);
    let mut hasher = Sha1::new();
    hasher.update(&k_mpint);
    hasher.update(exchange_hash);
    hasher.update([letter]);
    hasher.update(session_id);
    output.extend_from_slice(&hasher.finalize_reset());

    while output.len() < key_length {
        hasher.update(&k_mpint);
        hasher.update(exchange_hash);
        hasher.update(&output);
        let block = hasher.finalize_reset();
        output.extend_from_slice(&block);
    }

    output.truncate(key_length);
    output
}
