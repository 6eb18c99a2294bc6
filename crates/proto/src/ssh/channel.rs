//! Per-channel state: flow-control windows and the receive buffer.
//!
//! A channel is identified by the pair (local id, remote id). The local
//! receive window counts bytes the peer may still send us; when it drops
//! below half its initial size the owner emits a WINDOW_ADJUST restoring
//! it. The peer window counts bytes we may still send and never goes
//! negative: the transmitter splits data so no chunk exceeds either the
//! window or the peer's maximum packet size.
//!
//! # Channel states
//!
//! ```text
//! idle -> open_sent -> (open <-> request_pending) -> eof_sent
//!      -> close_sent -> closed
//! ```
//!
//! An unsolicited CLOSE from the peer jumps straight to `close_sent`.

use skiff_platform::{SkiffError, SkiffResult};

/// Channel lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// CHANNEL_OPEN sent, waiting for the peer's verdict.
    OpenSent,
    /// Open for data.
    Open,
    /// A channel request with want-reply is outstanding.
    RequestPending,
    /// We sent EOF; data may still arrive.
    EofSent,
    /// We sent CLOSE, waiting for the peer's CLOSE.
    CloseSent,
    /// Both sides closed; terminal.
    Closed,
}

/// One multiplexed channel.
#[derive(Debug)]
pub struct SshChannel {
    local_id: u32,
    remote_id: u32,
    state: ChannelState,

    /// Bytes the peer may still send us.
    local_window: u32,
    /// What the local window is replenished back to.
    local_window_initial: u32,

    /// Bytes we may still send the peer.
    peer_window: u32,
    /// Largest data chunk the peer accepts.
    peer_max_packet: u32,

    /// Received data, stderr merged in.
    buffer: Vec<u8>,

    /// Peer sent EOF.
    peer_eof: bool,
}

impl SshChannel {
    /// Creates a channel in `OpenSent`, before the peer's confirmation.
    pub fn new(local_id: u32, initial_window: u32) -> Self {
        Self {
            local_id,
            remote_id: 0,
            state: ChannelState::OpenSent,
            local_window: initial_window,
            local_window_initial: initial_window,
            peer_window: 0,
            peer_max_packet: 0,
            buffer: Vec::new(),
            peer_eof: false,
        }
    }

    /// Records the peer's CHANNEL_OPEN_CONFIRMATION.
    pub fn confirm(&mut self, remote_id: u32, peer_window: u32, peer_max_packet: u32) {
        self.remote_id = remote_id;
        self.peer_window = peer_window;
        self.peer_max_packet = peer_max_packet;
        self.state = ChannelState::Open;
    }

    /// Our channel number.
    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    /// The peer's channel number.
    pub fn remote_id(&self) -> u32 {
        self.remote_id
    }

    /// Current state.
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Updates the state.
    pub fn set_state(&mut self, state: ChannelState) {
        self.state = state;
    }

    /// Whether data may still be sent.
    pub fn is_writable(&self) -> bool {
        matches!(
            self.state,
            ChannelState::Open | ChannelState::RequestPending
        )
    }

    /// Whether the channel is finished.
    pub fn is_closed(&self) -> bool {
        self.state == ChannelState::Closed
    }

    /// Bytes we may still send.
    pub fn peer_window(&self) -> u32 {
        self.peer_window
    }

    /// The peer's maximum packet size.
    pub fn peer_max_packet(&self) -> u32 {
        self.peer_max_packet
    }

    /// Largest chunk currently sendable: min(peer window, peer max packet).
    pub fn max_chunk(&self) -> usize {
        self.peer_window.min(self.peer_max_packet) as usize
    }

    /// Debits the peer window for an outgoing chunk.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::ChannelClosed`] if the chunk exceeds the
    /// window; the transmitter must never let this happen.
    pub fn consume_peer_window(&mut self, bytes: u32) -> SkiffResult<()> {
        if bytes > self.peer_window {
            return Err(SkiffError::ChannelClosed);
        }
        self.peer_window -= bytes;
        Ok(())
    }

    /// Credits the peer window from a WINDOW_ADJUST.
    pub fn adjust_peer_window(&mut self, bytes: u32) {
        self.peer_window = self.peer_window.saturating_add(bytes);
    }

    /// Appends received data, debiting the local window.
    ///
    /// Returns `Some(increment)` when the local window fell below half its
    /// initial size; the caller emits a WINDOW_ADJUST for that amount and
    /// the window is credited here.
    pub fn push_data(&mut self, data: &[u8]) -> Option<u32> {
        self.buffer.extend_from_slice(data);
        self.local_window = self.local_window.saturating_sub(data.len() as u32);

        if self.local_window < self.local_window_initial / 2 {
            let increment = self.local_window_initial - self.local_window;
            self.local_window = self.local_window_initial;
            Some(increment)
        } else {
            None
        }
    }

    /// Bytes the peer may still send us.
    pub fn local_window(&self) -> u32 {
        self.local_window
    }

    /// The receive buffer contents.
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Bytes currently buffered.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Drains the receive buffer into an owned snapshot.
    pub fn take_buffer(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    /// Records the peer's EOF.
    pub fn set_peer_eof(&mut self) {
        self.peer_eof = true;
    }

    /// Whether the peer announced EOF.
    pub fn peer_eof(&self) -> bool {
        self.peer_eof
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_channel(window: u32, max_packet: u32) -> SshChannel {
        let mut ch = SshChannel::new(0, 0x7FFF_FFFF);
        ch.confirm(100, window, max_packet);
        ch
    }

    #[test]
    fn test_lifecycle() {
        let mut ch = SshChannel::new(5, 1024);
        assert_eq!(ch.state(), ChannelState::OpenSent);
        assert_eq!(ch.local_id(), 5);

        ch.confirm(42, 0x1000, 0x200);
        assert_eq!(ch.state(), ChannelState::Open);
        assert_eq!(ch.remote_id(), 42);
        assert!(ch.is_writable());

        ch.set_state(ChannelState::EofSent);
        assert!(!ch.is_writable());
        ch.set_state(ChannelState::CloseSent);
        ch.set_state(ChannelState::Closed);
        assert!(ch.is_closed());
    }

    #[test]
    fn test_peer_window_accounting() {
        let mut ch = open_channel(0x1000, 0x200);
        assert_eq!(ch.max_chunk(), 0x200);

        ch.consume_peer_window(0x200).unwrap();
        assert_eq!(ch.peer_window(), 0xE00);

        // Exhaust the window entirely.
        ch.consume_peer_window(0xE00).unwrap();
        assert_eq!(ch.peer_window(), 0);
        assert_eq!(ch.max_chunk(), 0);

        // Over-consumption is refused, window stays non-negative.
        assert!(ch.consume_peer_window(1).is_err());
        assert_eq!(ch.peer_window(), 0);

        ch.adjust_peer_window(0x1000);
        assert_eq!(ch.peer_window(), 0x1000);
    }

    #[test]
    fn test_max_chunk_bounded_by_window() {
        let mut ch = open_channel(0x100, 0x4000);
        assert_eq!(ch.max_chunk(), 0x100);
        ch.consume_peer_window(0x40).unwrap();
        assert_eq!(ch.max_chunk(), 0xC0);
    }

    #[test]
    fn test_receive_buffer_and_replenishment() {
        let mut ch = SshChannel::new(0, 1000);
        ch.confirm(1, 0x1000, 0x200);

        // Below half: no adjust yet.
        assert_eq!(ch.push_data(&[0u8; 400]), None);
        assert_eq!(ch.local_window(), 600);

        // Crossing half triggers a top-up back to the initial size.
        let increment = ch.push_data(&[0u8; 200]);
        assert_eq!(increment, Some(600));
        assert_eq!(ch.local_window(), 1000);
        assert_eq!(ch.buffered_len(), 600);
    }

    #[test]
    fn test_take_buffer_drains() {
        let mut ch = open_channel(0x1000, 0x200);
        ch.push_data(b"hello ");
        ch.push_data(b"world");
        assert_eq!(ch.take_buffer(), b"hello world");
        assert_eq!(ch.buffered_len(), 0);
    }

    #[test]
    fn test_peer_eof_flag() {
        let mut ch = open_channel(16, 16);
        assert!(!ch.peer_eof());
        ch.set_peer_eof();
        assert!(ch.peer_eof());
    }
}
