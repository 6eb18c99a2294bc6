//! SSH user authentication protocol (RFC 4252).
//!
//! The client requests the `ssh-userauth` service, then attempts one of:
//! - `password`: the plaintext password inside the encrypted transport
//! - `publickey`: a probe without signature first; once the server answers
//!   SSH_MSG_USERAUTH_PK_OK the request is repeated with a signature over
//!   the session identifier and the request body
//!
//! Banner messages may arrive at any time before the outcome and are
//! surfaced to the caller for the diagnostic sink.

use crate::ssh::message::MessageType;
use crate::ssh::wire::{Reader, Writer};
use skiff_platform::{SkiffError, SkiffResult};
use zeroize::Zeroize;

/// An authentication method attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// No authentication; probes which methods the server accepts.
    None,
    /// Password authentication.
    Password(String),
    /// Public key authentication.
    PublicKey {
        /// Algorithm name, `ssh-dss` or `ssh-rsa`.
        algorithm: String,
        /// Public key blob.
        public_key: Vec<u8>,
        /// Signature blob; absent for the acceptance probe.
        signature: Option<Vec<u8>>,
    },
}

impl AuthMethod {
    /// The RFC 4252 method name.
    pub fn name(&self) -> &'static str {
        match self {
            AuthMethod::None => "none",
            AuthMethod::Password(_) => "password",
            AuthMethod::PublicKey { .. } => "publickey",
        }
    }
}

impl Drop for AuthMethod {
    fn drop(&mut self) {
        if let AuthMethod::Password(password) = self {
            password.zeroize();
        }
    }
}

/// SSH_MSG_USERAUTH_REQUEST (RFC 4252 Section 5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    user_name: String,
    service_name: String,
    method: AuthMethod,
}

impl AuthRequest {
    /// Creates a request for `user_name` to start `service_name`.
    pub fn new(user_name: &str, service_name: &str, method: AuthMethod) -> Self {
        Self {
            user_name: user_name.to_string(),
            service_name: service_name.to_string(),
            method,
        }
    }

    /// The user name.
    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    /// The requested service.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// The method attempted.
    pub fn method(&self) -> &AuthMethod {
        &self.method
    }

    /// Serializes the request payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.u8(MessageType::UserauthRequest as u8);
        w.string(self.user_name.as_bytes());
        w.string(self.service_name.as_bytes());
        w.string(self.method.name().as_bytes());

        match &self.method {
            AuthMethod::None => {}
            AuthMethod::Password(password) => {
                w.bool(false); // not a password change
                w.string(password.as_bytes());
            }
            AuthMethod::PublicKey {
                algorithm,
                public_key,
                signature,
            } => {
                w.bool(signature.is_some());
                w.string(algorithm.as_bytes());
                w.string(public_key);
                if let Some(sig) = signature {
                    w.string(sig);
                }
            }
        }

        w.finish()
    }
}

/// SSH_MSG_USERAUTH_FAILURE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthFailure {
    methods: Vec<String>,
    partial_success: bool,
}

impl AuthFailure {
    /// Authentication methods that can continue.
    pub fn methods_can_continue(&self) -> &[String] {
        &self.methods
    }

    /// The comma-joined method list for error reporting.
    pub fn methods_string(&self) -> String {
        self.methods.join(",")
    }

    /// Whether the attempt was a partial success.
    pub fn partial_success(&self) -> bool {
        self.partial_success
    }

    /// Parses the payload.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut r = Reader::new(data);
        let kind = r.u8()?;
        if kind != MessageType::UserauthFailure as u8 {
            return Err(SkiffError::MalformedPacket(format!(
                "expected SSH_MSG_USERAUTH_FAILURE (51), got {}",
                kind
            )));
        }
        let methods = r.name_list()?;
        let partial_success = r.bool()?;
        Ok(Self {
            methods,
            partial_success,
        })
    }

    /// The matching [`SkiffError::AuthFailed`] value.
    pub fn to_error(&self) -> SkiffError {
        SkiffError::AuthFailed {
            methods: self.methods_string(),
            partial: self.partial_success,
        }
    }
}

/// SSH_MSG_USERAUTH_BANNER.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthBanner {
    message: String,
}

impl AuthBanner {
    /// The banner text.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Parses the payload.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut r = Reader::new(data);
        let kind = r.u8()?;
        if kind != MessageType::UserauthBanner as u8 {
            return Err(SkiffError::MalformedPacket(format!(
                "expected SSH_MSG_USERAUTH_BANNER (53), got {}",
                kind
            )));
        }
        let message = String::from_utf8_lossy(r.string()?).into_owned();
        let _language_tag = r.string()?;
        Ok(Self { message })
    }
}

/// SSH_MSG_USERAUTH_PK_OK: the server accepts the offered key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPkOk {
    algorithm: String,
    public_key: Vec<u8>,
}

impl AuthPkOk {
    /// The echoed algorithm name.
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// The echoed public key blob.
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Parses the payload.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut r = Reader::new(data);
        let kind = r.u8()?;
        if kind != MessageType::UserauthPkOk as u8 {
            return Err(SkiffError::MalformedPacket(format!(
                "expected SSH_MSG_USERAUTH_PK_OK (60), got {}",
                kind
            )));
        }
        let algorithm = r.utf8_string()?.to_string();
        let public_key = r.string()?.to_vec();
        Ok(Self {
            algorithm,
            public_key,
        })
    }
}

/// Builds an SSH_MSG_SERVICE_REQUEST payload.
pub fn service_request(service: &str) -> Vec<u8> {
    let mut w = Writer::new();
    w.u8(MessageType::ServiceRequest as u8);
    w.string(service.as_bytes());
    w.finish()
}

/// Parses an SSH_MSG_SERVICE_ACCEPT payload, returning the service name.
pub fn parse_service_accept(data: &[u8]) -> SkiffResult<String> {
    let mut r = Reader::new(data);
    let kind = r.u8()?;
    if kind != MessageType::ServiceAccept as u8 {
        return Err(SkiffError::MalformedPacket(format!(
            "expected SSH_MSG_SERVICE_ACCEPT (6), got {}",
            kind
        )));
    }
    Ok(r.utf8_string()?.to_string())
}

/// The byte string a publickey authentication signature covers.
///
/// ```text
/// string    session identifier
/// byte      SSH_MSG_USERAUTH_REQUEST
/// string    user name
/// string    "ssh-connection"
/// string    "publickey"
/// boolean   TRUE
/// string    public key algorithm name
/// string    public key blob
/// ```
///
/// The session-identifier string is prepended by the signer itself; this
/// returns only the request body starting at the message byte.
pub fn signature_data(
    user_name: &str,
    service_name: &str,
    algorithm: &str,
    public_key_blob: &[u8],
) -> Vec<u8> {
    let mut w = Writer::new();
    w.u8(MessageType::UserauthRequest as u8);
    w.string(user_name.as_bytes());
    w.string(service_name.as_bytes());
    w.string(b"publickey");
    w.bool(true);
    w.string(algorithm.as_bytes());
    w.string(public_key_blob);
    w.finish()
}
