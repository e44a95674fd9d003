mod connection;
mod message;
mod protocol;
mod session;

pub use connection::PeerConnection;
pub use message::PeerMessage;
pub use protocol::{Handshake, HANDSHAKE_LEN};
pub use session::{
    shutdown_requested, ExpectedPeer, NeighborSession, SessionContext, SessionEvent,
};

use crate::piece::Bitfield;
use tokio::sync::{mpsc, Mutex};
use tracing::trace;

pub type PeerId = u32;

/// Lifecycle of a connection to one neighbor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Connecting,
    Handshaking,
    AwaitingBitfield,
    Steady,
    Closed,
}

/// Per-neighbor protocol state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborState {
    /// Whether we are choking the neighbor
    pub choked_by_me: bool,
    /// Whether the neighbor is choking us
    pub choking_me: bool,
    /// Whether we want pieces the neighbor holds
    pub am_interested: bool,
    /// Whether the neighbor wants pieces we hold
    pub is_interested: bool,
    /// Piece we asked for and have not received yet
    pub outstanding_request: Option<u32>,
    /// Piece bytes received from the neighbor since the last unchoke tick
    pub bytes_received: u64,
    /// Our view of the pieces the neighbor holds
    pub remote: Bitfield,
}

impl NeighborState {
    pub fn new(remote: Bitfield) -> Self {
        Self {
            choked_by_me: true,
            choking_me: true,
            am_interested: false,
            is_interested: false,
            outstanding_request: None,
            bytes_received: 0,
            remote,
        }
    }
}

/// Shared handle to a connected neighbor.
///
/// The session's receive loop, the choking scheduler and other sessions'
/// HAVE fan-out all reach the neighbor through this handle. Sending only
/// enqueues the frame for the session's writer task, so it never blocks.
#[derive(Debug)]
pub struct Neighbor {
    id: PeerId,
    pub state: Mutex<NeighborState>,
    outbound: mpsc::UnboundedSender<PeerMessage>,
}

impl Neighbor {
    pub fn new(
        id: PeerId,
        remote: Bitfield,
        outbound: mpsc::UnboundedSender<PeerMessage>,
    ) -> Self {
        Self {
            id,
            state: Mutex::new(NeighborState::new(remote)),
            outbound,
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Queue a message for this neighbor. Returns false once the session's
    /// writer has gone away.
    pub fn send(&self, message: PeerMessage) -> bool {
        trace!("Queueing {} for peer {}", message, self.id);
        self.outbound.send(message).is_ok()
    }

    /// Let the neighbor download from us. Sends UNCHOKE only if it was
    /// choked; returns whether anything changed.
    pub async fn unchoke(&self) -> bool {
        self.set_choked(false).await
    }

    /// Stop serving the neighbor. Sends CHOKE only if it was unchoked;
    /// returns whether anything changed.
    pub async fn choke(&self) -> bool {
        self.set_choked(true).await
    }

    async fn set_choked(&self, choked: bool) -> bool {
        let changed = {
            let mut state = self.state.lock().await;
            let changed = state.choked_by_me != choked;
            state.choked_by_me = choked;
            changed
        };

        if changed {
            let message = if choked {
                PeerMessage::Choke
            } else {
                PeerMessage::Unchoke
            };
            self.send(message);
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_state_chokes_both_ways() {
        let state = NeighborState::new(Bitfield::new(3));
        assert!(state.choked_by_me);
        assert!(state.choking_me);
        assert!(!state.am_interested);
        assert!(!state.is_interested);
        assert_eq!(state.outstanding_request, None);
        assert_eq!(state.bytes_received, 0);
    }

    #[test]
    fn test_send_after_writer_dropped() {
        let (tx, rx) = mpsc::unbounded_channel();
        let neighbor = Neighbor::new(1, Bitfield::new(1), tx);
        assert!(neighbor.send(PeerMessage::Choke));
        drop(rx);
        assert!(!neighbor.send(PeerMessage::Choke));
    }

    #[tokio::test]
    async fn test_choke_transitions_send_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let neighbor = Neighbor::new(1, Bitfield::new(1), tx);

        assert!(!neighbor.choke().await);
        assert!(neighbor.unchoke().await);
        assert!(!neighbor.unchoke().await);
        assert!(!neighbor.state.lock().await.choked_by_me);
        assert!(neighbor.choke().await);

        assert_eq!(rx.recv().await, Some(PeerMessage::Unchoke));
        assert_eq!(rx.recv().await, Some(PeerMessage::Choke));
        assert!(rx.try_recv().is_err());
    }
}
