//! Server host key parsing and signature verification (RFC 4253 Section 8).
//!
//! The KEXDH reply carries the host key blob `K_S` and a signature over the
//! exchange hash H. This module parses the two supported blob formats and
//! checks the signature:
//!
//! - `ssh-dss`: `string "ssh-dss" || mpint p || mpint q || mpint g || mpint y`,
//!   signature is the raw 40-byte `r || s` pair (EMSA1 with SHA-1)
//! - `ssh-rsa`: `string "ssh-rsa" || mpint e || mpint n`,
//!   signature is a modulus-sized PKCS#1 v1.5 block over SHA-1 (EMSA3)
//!
//! Host-key trust is the caller's decision: any well-formed key whose
//! signature over H checks out is accepted here.

use crate::ssh::wire::Reader;
use num_bigint::BigUint;
use rsa::BigUint as RsaUint;
use sha1::{Digest, Sha1};
use signature::DigestVerifier;
use skiff_platform::{SkiffError, SkiffResult};

/// Length of a raw DSS signature: two 160-bit values.
pub const DSS_SIGNATURE_LEN: usize = 40;

/// A parsed server host key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKey {
    /// ssh-dss public parameters.
    Dss {
        /// Prime modulus.
        p: BigUint,
        /// 160-bit subgroup order.
        q: BigUint,
        /// Generator.
        g: BigUint,
        /// Public value g^x mod p.
        y: BigUint,
    },
    /// ssh-rsa public parameters.
    Rsa {
        /// Public exponent.
        e: BigUint,
        /// Modulus.
        n: BigUint,
    },
}

fn dig(n: &BigUint) -> RsaUint {
    RsaUint::from_bytes_be(&n.to_bytes_be())
}

impl HostKey {
    /// Parses a host key blob `K_S`.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::BadHostKey`] for unknown algorithms or
    /// truncated blobs.
    pub fn from_blob(blob: &[u8]) -> SkiffResult<Self> {
        let mut r = Reader::new(blob);
        let algo = r
            .utf8_string()
            .map_err(|_| SkiffError::BadHostKey("unreadable host key blob".to_string()))?;

        let parse = |r: &mut Reader<'_>| -> SkiffResult<BigUint> {
            r.mpint()
                .map_err(|_| SkiffError::BadHostKey("truncated host key blob".to_string()))
        };

        match algo {
            "ssh-dss" => {
                let p = parse(&mut r)?;
                let q = parse(&mut r)?;
                let g = parse(&mut r)?;
                let y = parse(&mut r)?;
                Ok(HostKey::Dss { p, q, g, y })
            }
            "ssh-rsa" => {
                let e = parse(&mut r)?;
                let n = parse(&mut r)?;
                Ok(HostKey::Rsa { e, n })
            }
            other => Err(SkiffError::BadHostKey(format!(
                "unsupported host key algorithm '{}'",
                other
            ))),
        }
    }

    /// The SSH algorithm name.
    pub fn algorithm_name(&self) -> &'static str {
        match self {
            HostKey::Dss { .. } => "ssh-dss",
            HostKey::Rsa { .. } => "ssh-rsa",
        }
    }

    /// Verifies a signature blob over `message` (the exchange hash).
    ///
    /// The blob layout is `string algorithm-name || string signature`; the
    /// algorithm must match this key.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::BadHostKey`] on any structural or
    /// cryptographic mismatch.
    pub fn verify(&self, message: &[u8], signature_blob: &[u8]) -> SkiffResult<()> {
        let mut r = Reader::new(signature_blob);
        let algo = r
            .utf8_string()
            .map_err(|_| SkiffError::BadHostKey("unreadable signature blob".to_string()))?;
        if algo != self.algorithm_name() {
            return Err(SkiffError::BadHostKey(format!(
                "signature algorithm '{}' does not match host key '{}'",
                algo,
                self.algorithm_name()
            )));
        }
        let sig = r
            .string()
            .map_err(|_| SkiffError::BadHostKey("truncated signature blob".to_string()))?;

        match self {
            HostKey::Dss { p, q, g, y } => verify_dss(p, q, g, y, message, sig),
            HostKey::Rsa { e, n } => verify_rsa(e, n, message, sig),
        }
    }
}

fn verify_dss(
    p: &BigUint,
    q: &BigUint,
    g: &BigUint,
    y: &BigUint,
    message: &[u8],
    sig: &[u8],
) -> SkiffResult<()> {
    if sig.len() != DSS_SIGNATURE_LEN {
        return Err(SkiffError::BadHostKey(format!(
            "DSS signature is {} bytes, expected {}",
            sig.len(),
            DSS_SIGNATURE_LEN
        )));
    }
    let (r_bytes, s_bytes) = sig.split_at(DSS_SIGNATURE_LEN / 2);

    let components = dsa::Components::from_components(dig(p), dig(q), dig(g))
        .map_err(|_| SkiffError::BadHostKey("invalid DSS domain parameters".to_string()))?;
    let key = dsa::VerifyingKey::from_components(components, dig(y))
        .map_err(|_| SkiffError::BadHostKey("invalid DSS public key".to_string()))?;
    let signature = dsa::Signature::from_components(
        RsaUint::from_bytes_be(r_bytes),
        RsaUint::from_bytes_be(s_bytes),
    )
    .map_err(|_| SkiffError::BadHostKey("degenerate DSS signature".to_string()))?;

    key.verify_digest(Sha1::new_with_prefix(message), &signature)
        .map_err(|_| SkiffError::BadHostKey("DSS signature mismatch".to_string()))
}

fn verify_rsa(e: &BigUint, n: &BigUint, message: &[u8], sig: &[u8]) -> SkiffResult<()> {
    let key = rsa::RsaPublicKey::new(dig(n), dig(e))
        .map_err(|_| SkiffError::BadHostKey("invalid RSA public key".to_string()))?;

    let hashed = Sha1::digest(message);
    key.verify(rsa::Pkcs1v15Sign::new::<Sha1>(), &hashed, sig)
        .map_err(|_| SkiffError::BadHostKey("RSA signature mismatch".to_string()))
}
