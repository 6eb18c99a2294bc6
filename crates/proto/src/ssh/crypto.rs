//! SSH cryptographic operations.
//!
//! This module implements the classic SSH2 cipher and MAC suites:
//! - CBC block ciphers: AES-128/256, 3DES, Blowfish, CAST-128, Twofish
//! - MACs: HMAC-SHA1 (20 bytes), HMAC-MD5 (16 bytes), none
//!
//! These suites use the original "MAC over plaintext, then encrypt" scheme:
//! the MAC is computed over `sequence_number || unencrypted packet`, the
//! whole packet (length field included) is encrypted, and the MAC trails the
//! ciphertext in the clear. The CBC state chains across packets, so one
//! [`EncryptionKey`]/[`DecryptionKey`] pair lives for the whole key epoch.

use cipher::generic_array::GenericArray;
use cipher::{BlockDecryptMut, BlockEncryptMut, InnerIvInit, KeyInit};
use hmac::{Hmac, Mac};
use md5::Md5;
use sha1::Sha1;
use skiff_platform::{SkiffError, SkiffResult};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

/// Cipher suites this library negotiates, in default preference order.
pub const CIPHER_PREFERENCE: &[&str] = &[
    "aes256-cbc",
    "twofish-cbc",
    "twofish256-cbc",
    "blowfish-cbc",
    "3des-cbc",
    "aes128-cbc",
    "cast128-cbc",
];

/// MAC suites this library negotiates, in default preference order.
pub const MAC_PREFERENCE: &[&str] = &["hmac-md5", "hmac-sha1", "none"];

/// Cipher algorithm for SSH packet encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlgorithm {
    /// aes128-cbc
    Aes128Cbc,
    /// aes256-cbc
    Aes256Cbc,
    /// 3des-cbc (EDE3)
    TripleDesCbc,
    /// blowfish-cbc (128-bit key)
    BlowfishCbc,
    /// cast128-cbc
    Cast128Cbc,
    /// twofish-cbc (256-bit key)
    TwofishCbc,
    /// twofish256-cbc
    Twofish256Cbc,
}

impl CipherAlgorithm {
    /// The SSH algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            CipherAlgorithm::Aes128Cbc => "aes128-cbc",
            CipherAlgorithm::Aes256Cbc => "aes256-cbc",
            CipherAlgorithm::TripleDesCbc => "3des-cbc",
            CipherAlgorithm::BlowfishCbc => "blowfish-cbc",
            CipherAlgorithm::Cast128Cbc => "cast128-cbc",
            CipherAlgorithm::TwofishCbc => "twofish-cbc",
            CipherAlgorithm::Twofish256Cbc => "twofish256-cbc",
        }
    }

    /// Key size in bytes.
    pub fn key_size(&self) -> usize {
        match self {
            CipherAlgorithm::Aes128Cbc => 16,
            CipherAlgorithm::Aes256Cbc => 32,
            CipherAlgorithm::TripleDesCbc => 24,
            CipherAlgorithm::BlowfishCbc => 16,
            CipherAlgorithm::Cast128Cbc => 16,
            CipherAlgorithm::TwofishCbc => 32,
            CipherAlgorithm::Twofish256Cbc => 32,
        }
    }

    /// Block size in bytes; also the IV size for CBC.
    pub fn block_size(&self) -> usize {
        match self {
            CipherAlgorithm::Aes128Cbc
            | CipherAlgorithm::Aes256Cbc
            | CipherAlgorithm::TwofishCbc
            | CipherAlgorithm::Twofish256Cbc => 16,
            CipherAlgorithm::TripleDesCbc
            | CipherAlgorithm::BlowfishCbc
            | CipherAlgorithm::Cast128Cbc => 8,
        }
    }

    /// IV size in bytes.
    pub fn iv_size(&self) -> usize {
        self.block_size()
    }

    /// Parses a cipher algorithm from its SSH name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "aes128-cbc" => Some(CipherAlgorithm::Aes128Cbc),
            "aes256-cbc" => Some(CipherAlgorithm::Aes256Cbc),
            "3des-cbc" => Some(CipherAlgorithm::TripleDesCbc),
            "blowfish-cbc" => Some(CipherAlgorithm::BlowfishCbc),
            "cast128-cbc" => Some(CipherAlgorithm::Cast128Cbc),
            "twofish-cbc" => Some(CipherAlgorithm::TwofishCbc),
            "twofish256-cbc" => Some(CipherAlgorithm::Twofish256Cbc),
            _ => None,
        }
    }
}

enum CbcEncryptor {
    Aes128(cbc::Encryptor<aes::Aes128>),
    Aes256(cbc::Encryptor<aes::Aes256>),
    TripleDes(cbc::Encryptor<des::TdesEde3>),
    Blowfish(cbc::Encryptor<blowfish::Blowfish>),
    Cast128(cbc::Encryptor<cast5::Cast5>),
    Twofish(cbc::Encryptor<twofish::Twofish>),
}

enum CbcDecryptor {
    Aes128(cbc::Decryptor<aes::Aes128>),
    Aes256(cbc::Decryptor<aes::Aes256>),
    TripleDes(cbc::Decryptor<des::TdesEde3>),
    Blowfish(cbc::Decryptor<blowfish::Blowfish>),
    Cast128(cbc::Decryptor<cast5::Cast5>),
    Twofish(cbc::Decryptor<twofish::Twofish>),
}

fn check_material(algorithm: CipherAlgorithm, key: &[u8], iv: &[u8]) -> SkiffResult<()> {
    if key.len() < algorithm.key_size() || iv.len() < algorithm.iv_size() {
        return Err(SkiffError::MalformedPacket(format!(
            "insufficient key material for {}: {} key / {} iv bytes",
            algorithm.name(),
            key.len(),
            iv.len()
        )));
    }
    Ok(())
}

macro_rules! init_cbc {
    ($variant:ident, $cipher:ty, $mode:ident, $key:expr, $iv:expr) => {{
        let inner = <$cipher>::new_from_slice($key)
            .map_err(|_| SkiffError::MalformedPacket("bad cipher key length".to_string()))?;
        $mode::$variant(
            InnerIvInit::inner_iv_slice_init(inner, $iv)
                .map_err(|_| SkiffError::MalformedPacket("bad cipher IV length".to_string()))?,
        )
    }};
}

/// Stateful CBC encryptor for one direction of the transport.
pub struct EncryptionKey {
    algorithm: CipherAlgorithm,
    state: CbcEncryptor,
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("algorithm", &self.algorithm)
            .field("state", &"<redacted>")
            .finish()
    }
}

impl EncryptionKey {
    /// Creates an encryptor from derived key material.
    ///
    /// `key` and `iv` may be longer than needed; the leading bytes are used,
    /// matching the RFC 4253 Section 7.2 truncation rule.
    pub fn new(algorithm: CipherAlgorithm, key: &[u8], iv: &[u8]) -> SkiffResult<Self> {
        check_material(algorithm, key, iv)?;
        let key = &key[..algorithm.key_size()];
        let iv = &iv[..algorithm.iv_size()];

        let state = match algorithm {
            CipherAlgorithm::Aes128Cbc => init_cbc!(Aes128, aes::Aes128, CbcEncryptor, key, iv),
            CipherAlgorithm::Aes256Cbc => init_cbc!(Aes256, aes::Aes256, CbcEncryptor, key, iv),
            CipherAlgorithm::TripleDesCbc => {
                init_cbc!(TripleDes, des::TdesEde3, CbcEncryptor, key, iv)
            }
            CipherAlgorithm::BlowfishCbc => {
                init_cbc!(Blowfish, blowfish::Blowfish, CbcEncryptor, key, iv)
            }
            CipherAlgorithm::Cast128Cbc => init_cbc!(Cast128, cast5::Cast5, CbcEncryptor, key, iv),
            CipherAlgorithm::TwofishCbc | CipherAlgorithm::Twofish256Cbc => {
                init_cbc!(Twofish, twofish::Twofish, CbcEncryptor, key, iv)
            }
        };

        Ok(Self { algorithm, state })
    }

    /// Encrypts `data` in place. The length must be a block multiple.
    pub fn encrypt(&mut self, data: &mut [u8]) -> SkiffResult<()> {
        let block = self.algorithm.block_size();
        if data.len() % block != 0 {
            return Err(SkiffError::MalformedPacket(format!(
                "encrypt length {} not a multiple of block size {}",
                data.len(),
                block
            )));
        }
        match &mut self.state {
            CbcEncryptor::Aes128(c) => encrypt_blocks(c, data, block),
            CbcEncryptor::Aes256(c) => encrypt_blocks(c, data, block),
            CbcEncryptor::TripleDes(c) => encrypt_blocks(c, data, block),
            CbcEncryptor::Blowfish(c) => encrypt_blocks(c, data, block),
            CbcEncryptor::Cast128(c) => encrypt_blocks(c, data, block),
            CbcEncryptor::Twofish(c) => encrypt_blocks(c, data, block),
        }
        Ok(())
    }

    /// The algorithm this key drives.
    pub fn algorithm(&self) -> CipherAlgorithm {
        self.algorithm
    }
}

/// Stateful CBC decryptor for one direction of the transport.
pub struct DecryptionKey {
    algorithm: CipherAlgorithm,
    state: CbcDecryptor,
}

impl std::fmt::Debug for DecryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecryptionKey")
            .field("algorithm", &self.algorithm)
            .field("state", &"<redacted>")
            .finish()
    }
}

impl DecryptionKey {
    /// Creates a decryptor from derived key material.
    pub fn new(algorithm: CipherAlgorithm, key: &[u8], iv: &[u8]) -> SkiffResult<Self> {
        check_material(algorithm, key, iv)?;
        let key = &key[..algorithm.key_size()];
        let iv = &iv[..algorithm.iv_size()];

        let state = match algorithm {
            CipherAlgorithm::Aes128Cbc => init_cbc!(Aes128, aes::Aes128, CbcDecryptor, key, iv),
            CipherAlgorithm::Aes256Cbc => init_cbc!(Aes256, aes::Aes256, CbcDecryptor, key, iv),
            CipherAlgorithm::TripleDesCbc => {
                init_cbc!(TripleDes, des::TdesEde3, CbcDecryptor, key, iv)
            }
            CipherAlgorithm::BlowfishCbc => {
                init_cbc!(Blowfish, blowfish::Blowfish, CbcDecryptor, key, iv)
            }
            CipherAlgorithm::Cast128Cbc => init_cbc!(Cast128, cast5::Cast5, CbcDecryptor, key, iv),
            CipherAlgorithm::TwofishCbc | CipherAlgorithm::Twofish256Cbc => {
                init_cbc!(Twofish, twofish::Twofish, CbcDecryptor, key, iv)
            }
        };

        Ok(Self { algorithm, state })
    }

    /// Decrypts `data` in place. The length must be a block multiple.
    pub fn decrypt(&mut self, data: &mut [u8]) -> SkiffResult<()> {
        let block = self.algorithm.block_size();
        if data.len() % block != 0 {
            return Err(SkiffError::MalformedPacket(format!(
                "decrypt length {} not a multiple of block size {}",
                data.len(),
                block
            )));
        }
        match &mut self.state {
            CbcDecryptor::Aes128(c) => decrypt_blocks(c, data, block),
            CbcDecryptor::Aes256(c) => decrypt_blocks(c, data, block),
            CbcDecryptor::TripleDes(c) => decrypt_blocks(c, data, block),
            CbcDecryptor::Blowfish(c) => decrypt_blocks(c, data, block),
            CbcDecryptor::Cast128(c) => decrypt_blocks(c, data, block),
            CbcDecryptor::Twofish(c) => decrypt_blocks(c, data, block),
        }
        Ok(())
    }

    /// The algorithm this key drives.
    pub fn algorithm(&self) -> CipherAlgorithm {
        self.algorithm
    }
}

fn encrypt_blocks<C: BlockEncryptMut>(cipher: &mut C, data: &mut [u8], block: usize) {
    for chunk in data.chunks_exact_mut(block) {
        cipher.encrypt_block_mut(GenericArray::from_mut_slice(chunk));
    }
}

fn decrypt_blocks<C: BlockDecryptMut>(cipher: &mut C, data: &mut [u8], block: usize) {
    for chunk in data.chunks_exact_mut(block) {
        cipher.decrypt_block_mut(GenericArray::from_mut_slice(chunk));
    }
}

/// MAC algorithm for SSH packet integrity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacAlgorithm {
    /// hmac-sha1, 20-byte tag
    HmacSha1,
    /// hmac-md5, 16-byte tag
    HmacMd5,
    /// none
    None,
}

impl MacAlgorithm {
    /// The SSH algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            MacAlgorithm::HmacSha1 => "hmac-sha1",
            MacAlgorithm::HmacMd5 => "hmac-md5",
            MacAlgorithm::None => "none",
        }
    }

    /// Key size in bytes.
    pub fn key_size(&self) -> usize {
        match self {
            MacAlgorithm::HmacSha1 => 20,
            MacAlgorithm::HmacMd5 => 16,
            MacAlgorithm::None => 0,
        }
    }

    /// Tag size in bytes.
    pub fn mac_size(&self) -> usize {
        self.key_size()
    }

    /// Parses a MAC algorithm from its SSH name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "hmac-sha1" => Some(MacAlgorithm::HmacSha1),
            "hmac-md5" => Some(MacAlgorithm::HmacMd5),
            "none" => Some(MacAlgorithm::None),
            _ => None,
        }
    }
}

/// Keyed MAC state for one direction of the transport.
///
/// The sequence number is supplied by the transport on every call so that
/// it stays continuous across rekeys.
pub struct MacKey {
    algorithm: MacAlgorithm,
    key: Vec<u8>,
}

impl std::fmt::Debug for MacKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacKey")
            .field("algorithm", &self.algorithm)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl MacKey {
    /// Creates a MAC key from derived key material (leading bytes used).
    pub fn new(algorithm: MacAlgorithm, key_material: &[u8]) -> SkiffResult<Self> {
        if key_material.len() < algorithm.key_size() {
            return Err(SkiffError::MalformedPacket(format!(
                "insufficient MAC key material: expected {}, got {}",
                algorithm.key_size(),
                key_material.len()
            )));
        }
        Ok(Self {
            algorithm,
            key: key_material[..algorithm.key_size()].to_vec(),
        })
    }

    /// Computes `MAC(key, sequence_number || packet_data)`.
    pub fn compute(&self, sequence_number: u32, packet_data: &[u8]) -> Vec<u8> {
        match self.algorithm {
            MacAlgorithm::HmacSha1 => {
                let mut mac = <Hmac<Sha1> as Mac>::new_from_slice(&self.key)
                    .expect("HMAC accepts any key size");
                mac.update(&sequence_number.to_be_bytes());
                mac.update(packet_data);
                mac.finalize().into_bytes().to_vec()
            }
            MacAlgorithm::HmacMd5 => {
                let mut mac = <Hmac<Md5> as Mac>::new_from_slice(&self.key)
                    .expect("HMAC accepts any key size");
                mac.update(&sequence_number.to_be_bytes());
                mac.update(packet_data);
                mac.finalize().into_bytes().to_vec()
            }
            MacAlgorithm::None => Vec::new(),
        }
    }

    /// Verifies a received tag in constant time.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::BadMac`] on any mismatch.
    pub fn verify(
        &self,
        sequence_number: u32,
        packet_data: &[u8],
        received: &[u8],
    ) -> SkiffResult<()> {
        let computed = self.compute(sequence_number, packet_data);
        if computed.len() != received.len() {
            return Err(SkiffError::BadMac);
        }
        if bool::from(computed.ct_eq(received)) {
            Ok(())
        } else {
            Err(SkiffError::BadMac)
        }
    }

    /// The algorithm this key drives.
    pub fn algorithm(&self) -> MacAlgorithm {
        self.algorithm
    }
}

impl Drop for MacKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cipher_properties() {
        assert_eq!(CipherAlgorithm::Aes256Cbc.name(), "aes256-cbc");
        assert_eq!(CipherAlgorithm::Aes256Cbc.key_size(), 32);
        assert_eq!(CipherAlgorithm::Aes256Cbc.block_size(), 16);

        assert_eq!(CipherAlgorithm::TripleDesCbc.key_size(), 24);
        assert_eq!(CipherAlgorithm::TripleDesCbc.block_size(), 8);

        assert_eq!(CipherAlgorithm::BlowfishCbc.key_size(), 16);
        assert_eq!(CipherAlgorithm::Cast128Cbc.block_size(), 8);
        assert_eq!(CipherAlgorithm::Twofish256Cbc.key_size(), 32);
    }

    #[test]
    fn test_cipher_from_name() {
        for name in CIPHER_PREFERENCE {
            let alg = CipherAlgorithm::from_name(name).unwrap();
            assert_eq!(alg.name(), *name);
        }
        assert!(CipherAlgorithm::from_name("aes128-ctr").is_none());
    }

    #[test]
    fn test_mac_properties() {
        assert_eq!(MacAlgorithm::HmacSha1.mac_size(), 20);
        assert_eq!(MacAlgorithm::HmacMd5.mac_size(), 16);
        assert_eq!(MacAlgorithm::None.mac_size(), 0);
        assert!(MacAlgorithm::from_name("hmac-sha2-256").is_none());
    }

    #[test]
    fn test_cbc_round_trip_all_ciphers() {
        let algorithms = [
            CipherAlgorithm::Aes128Cbc,
            CipherAlgorithm::Aes256Cbc,
            CipherAlgorithm::TripleDesCbc,
            CipherAlgorithm::BlowfishCbc,
            CipherAlgorithm::Cast128Cbc,
            CipherAlgorithm::TwofishCbc,
            CipherAlgorithm::Twofish256Cbc,
        ];
        let key = [0x42u8; 32];
        let iv = [0x17u8; 16];

        for alg in algorithms {
            let mut enc = EncryptionKey::new(alg, &key, &iv).unwrap();
            let mut dec = DecryptionKey::new(alg, &key, &iv).unwrap();

            let mut data = vec![0u8; alg.block_size() * 4];
            for (i, b) in data.iter_mut().enumerate() {
                *b = i as u8;
            }
            let original = data.clone();

            enc.encrypt(&mut data).unwrap();
            assert_ne!(data, original, "{} did not change the data", alg.name());
            dec.decrypt(&mut data).unwrap();
            assert_eq!(data, original, "{} round trip failed", alg.name());
        }
    }

    #[test]
    fn test_cbc_state_chains_across_calls() {
        let key = [7u8; 16];
        let iv = [9u8; 16];
        let mut enc = EncryptionKey::new(CipherAlgorithm::Aes128Cbc, &key, &iv).unwrap();
        let mut dec = DecryptionKey::new(CipherAlgorithm::Aes128Cbc, &key, &iv).unwrap();

        // Two packets encrypted back to back must decrypt back to back.
        let mut p1 = vec![1u8; 32];
        let mut p2 = vec![2u8; 32];
        enc.encrypt(&mut p1).unwrap();
        enc.encrypt(&mut p2).unwrap();
        dec.decrypt(&mut p1).unwrap();
        dec.decrypt(&mut p2).unwrap();
        assert_eq!(p1, vec![1u8; 32]);
        assert_eq!(p2, vec![2u8; 32]);
    }

    #[test]
    fn test_encrypt_rejects_partial_block() {
        let key = [0u8; 32];
        let iv = [0u8; 16];
        let mut enc = EncryptionKey::new(CipherAlgorithm::Aes256Cbc, &key, &iv).unwrap();
        let mut data = vec![0u8; 17];
        assert!(enc.encrypt(&mut data).is_err());
    }

    #[test]
    fn test_key_creation_rejects_short_material() {
        let result = EncryptionKey::new(CipherAlgorithm::Aes256Cbc, &[0u8; 16], &[0u8; 16]);
        assert!(result.is_err());
    }

    #[test]
    fn test_mac_compute_and_verify() {
        let key = [3u8; 20];
        let mac = MacKey::new(MacAlgorithm::HmacSha1, &key).unwrap();

        let tag = mac.compute(5, b"packet bytes");
        assert_eq!(tag.len(), 20);
        assert!(mac.verify(5, b"packet bytes", &tag).is_ok());

        // Wrong sequence number fails.
        assert!(matches!(
            mac.verify(6, b"packet bytes", &tag),
            Err(SkiffError::BadMac)
        ));

        // Tampered data fails.
        assert!(mac.verify(5, b"packet byteZ", &tag).is_err());
    }

    #[test]
    fn test_mac_md5_size() {
        let mac = MacKey::new(MacAlgorithm::HmacMd5, &[1u8; 16]).unwrap();
        assert_eq!(mac.compute(0, b"x").len(), 16);
    }

    #[test]
    fn test_mac_none_is_empty() {
        let mac = MacKey::new(MacAlgorithm::None, &[]).unwrap();
        assert!(mac.compute(0, b"anything").is_empty());
        assert!(mac.verify(0, b"anything", &[]).is_ok());
    }

    #[test]
    fn test_mac_sequence_is_bound() {
        let mac = MacKey::new(MacAlgorithm::HmacSha1, &[8u8; 20]).unwrap();
        assert_ne!(mac.compute(0, b"data"), mac.compute(1, b"data"));
    }
}
