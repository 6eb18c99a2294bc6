//! SSH protocol message numbers (RFC 4250 Section 4.1).

/// SSH message types spoken by this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Terminates the connection.
    Disconnect = 1,
    /// May be sent at any time and must be ignored.
    Ignore = 2,
    /// Response to an unrecognised message.
    Unimplemented = 3,
    /// Debugging information.
    Debug = 4,
    /// Requests a service such as `ssh-userauth`.
    ServiceRequest = 5,
    /// Grants a service request.
    ServiceAccept = 6,

    /// Algorithm negotiation.
    KexInit = 20,
    /// Activates the keys derived by the current exchange.
    NewKeys = 21,

    /// Diffie-Hellman `e` from the client.
    KexdhInit = 30,
    /// Diffie-Hellman reply: host key, `f`, signature over H.
    KexdhReply = 31,

    /// User authentication request.
    UserauthRequest = 50,
    /// Authentication rejected; lists methods that can continue.
    UserauthFailure = 51,
    /// Authentication granted.
    UserauthSuccess = 52,
    /// Pre-authentication banner text.
    UserauthBanner = 53,
    /// The offered public key is acceptable for authentication.
    UserauthPkOk = 60,

    /// Global request.
    GlobalRequest = 80,
    /// Global request granted.
    RequestSuccess = 81,
    /// Global request denied.
    RequestFailure = 82,
    /// Opens a channel.
    ChannelOpen = 90,
    /// Channel open granted.
    ChannelOpenConfirmation = 91,
    /// Channel open denied.
    ChannelOpenFailure = 92,
    /// Replenishes the peer's transmit window.
    ChannelWindowAdjust = 93,
    /// Channel payload data.
    ChannelData = 94,
    /// Typed channel data (type 1 is stderr).
    ChannelExtendedData = 95,
    /// No more data will be sent on the channel.
    ChannelEof = 96,
    /// Channel teardown.
    ChannelClose = 97,
    /// Channel-scoped request (pty-req, shell, exec, subsystem, ...).
    ChannelRequest = 98,
    /// Channel request granted.
    ChannelSuccess = 99,
    /// Channel request denied.
    ChannelFailure = 100,
}

impl MessageType {
    /// Converts a wire byte to a message type.
    pub fn from_u8(byte: u8) -> Option<Self> {
        use MessageType::*;
        Some(match byte {
            1 => Disconnect,
            2 => Ignore,
            3 => Unimplemented,
            4 => Debug,
            5 => ServiceRequest,
            6 => ServiceAccept,
            20 => KexInit,
            21 => NewKeys,
            30 => KexdhInit,
            31 => KexdhReply,
            50 => UserauthRequest,
            51 => UserauthFailure,
            52 => UserauthSuccess,
            53 => UserauthBanner,
            60 => UserauthPkOk,
            80 => GlobalRequest,
            81 => RequestSuccess,
            82 => RequestFailure,
            90 => ChannelOpen,
            91 => ChannelOpenConfirmation,
            92 => ChannelOpenFailure,
            93 => ChannelWindowAdjust,
            94 => ChannelData,
            95 => ChannelExtendedData,
            96 => ChannelEof,
            97 => ChannelClose,
            98 => ChannelRequest,
            99 => ChannelSuccess,
            100 => ChannelFailure,
            _ => return None,
        })
    }

    /// Whether this message is transport-level.
    ///
    /// While a rekey is in flight only transport-level messages may be
    /// exchanged (RFC 4253 Section 7.1).
    pub fn is_transport(&self) -> bool {
        (*self as u8) <= 49
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_numbers() {
        assert_eq!(MessageType::KexInit as u8, 20);
        assert_eq!(MessageType::NewKeys as u8, 21);
        assert_eq!(MessageType::KexdhInit as u8, 30);
        assert_eq!(MessageType::ChannelData as u8, 94);
    }

    #[test]
    fn test_from_u8_round_trip() {
        for byte in 0u8..=255 {
            if let Some(t) = MessageType::from_u8(byte) {
                assert_eq!(t as u8, byte);
            }
        }
        assert_eq!(MessageType::from_u8(20), Some(MessageType::KexInit));
        assert_eq!(MessageType::from_u8(255), None);
    }

    #[test]
    fn test_transport_classification() {
        assert!(MessageType::KexInit.is_transport());
        assert!(MessageType::NewKeys.is_transport());
        assert!(MessageType::Debug.is_transport());
        assert!(!MessageType::ChannelData.is_transport());
        assert!(!MessageType::UserauthRequest.is_transport());
    }
}
