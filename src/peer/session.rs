use super::connection::{write_handshake, write_message, FrameReader, PeerConnection};
use super::{Neighbor, PeerId, PeerMessage, SessionPhase};
use crate::config::Roster;
use crate::error::{PeerError, Result};
use crate::eventlog::EventLog;
use crate::piece::{pick_piece, Bitfield, PieceLayout};
use crate::storage::PieceStore;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long a closing session waits for queued frames to reach the socket
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub type NeighborMap = HashMap<PeerId, Arc<Neighbor>>;

/// State shared by every session of one peer process
#[derive(Clone)]
pub struct SessionContext {
    pub local_id: PeerId,
    pub layout: PieceLayout,
    pub roster: Arc<Roster>,
    pub store: Arc<Mutex<PieceStore>>,
    pub neighbors: Arc<Mutex<NeighborMap>>,
    pub log: Arc<EventLog>,
    pub events: mpsc::UnboundedSender<SessionEvent>,
    pub shutdown: watch::Receiver<bool>,
}

/// Notifications from sessions to the coordinator
#[derive(Debug)]
pub enum SessionEvent {
    /// The local store just became complete
    LocalComplete,
    /// A neighbor's bitfield, as we observe it, became complete
    NeighborComplete(PeerId),
    /// A session ended. `peer_id` is unknown when the handshake never
    /// completed.
    Closed {
        peer_id: Option<PeerId>,
        addr: SocketAddr,
        result: Result<()>,
    },
}

/// Which peer is allowed on the other end of a socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedPeer {
    /// We dialed this predecessor
    Exactly(PeerId),
    /// Accepted socket: any successor not connected yet
    Successor,
}

/// One connection to a neighbor, from handshake to close
pub struct NeighborSession {
    ctx: SessionContext,
    neighbor: Arc<Neighbor>,
    phase: SessionPhase,
}

impl NeighborSession {
    /// Drive a connection until it closes, then report to the coordinator
    pub async fn run(conn: PeerConnection, expected: ExpectedPeer, ctx: SessionContext) {
        let addr = conn.addr();
        let events = ctx.events.clone();
        let mut peer_id = None;

        let result = Self::establish_and_serve(conn, expected, ctx, &mut peer_id).await;
        match &result {
            Ok(()) => debug!("Session with {} closed", addr),
            Err(PeerError::ConnectionClosed) => info!("Peer at {} closed the connection", addr),
            Err(e) => warn!("Session with {} failed: {}", addr, e),
        }

        let _ = events.send(SessionEvent::Closed {
            peer_id,
            addr,
            result,
        });
    }

    async fn establish_and_serve(
        conn: PeerConnection,
        expected: ExpectedPeer,
        ctx: SessionContext,
        peer_id: &mut Option<PeerId>,
    ) -> Result<()> {
        let addr = conn.addr();
        let (mut reader, mut writer) = conn.into_split(ctx.layout);
        debug!("Session with {} is {:?}", addr, SessionPhase::Handshaking);

        write_handshake(&mut writer, ctx.local_id).await?;
        ctx.log
            .write(format!(
                "Peer {} sent the handshake to {}.",
                ctx.local_id, addr
            ))
            .await;

        let mut shutdown = ctx.shutdown.clone();
        let handshake = tokio::select! {
            handshake = reader.read_handshake() => handshake?,
            _ = shutdown_requested(&mut shutdown) => return Ok(()),
        };
        let remote_id = handshake.peer_id;
        ctx.log
            .write(format!(
                "Peer {} received the handshake from Peer {}.",
                ctx.local_id, remote_id
            ))
            .await;

        Self::check_identity(&ctx, expected, remote_id).await?;
        *peer_id = Some(remote_id);

        if expected == ExpectedPeer::Successor {
            ctx.log
                .write(format!(
                    "Peer {} is connected from Peer {}.",
                    ctx.local_id, remote_id
                ))
                .await;
        }

        let (mut session, writer_task) = Self::register(ctx, remote_id, writer).await?;
        let result = session.serve(reader, shutdown).await;
        session.close(writer_task).await;
        result
    }

    /// Fails with `HandshakeIdentityMismatch` unless `remote_id` is the
    /// peer this socket was opened for
    async fn check_identity(
        ctx: &SessionContext,
        expected: ExpectedPeer,
        remote_id: PeerId,
    ) -> Result<()> {
        let allowed = match expected {
            ExpectedPeer::Exactly(id) => id == remote_id,
            ExpectedPeer::Successor => {
                ctx.roster
                    .successors(ctx.local_id)
                    .iter()
                    .any(|p| p.peer_id == remote_id)
                    && !ctx.neighbors.lock().await.contains_key(&remote_id)
            }
        };

        if allowed {
            Ok(())
        } else {
            let expected = match expected {
                ExpectedPeer::Exactly(id) => id.to_string(),
                ExpectedPeer::Successor => "an unconnected successor".to_string(),
            };
            Err(PeerError::HandshakeIdentityMismatch {
                expected,
                received: remote_id,
            })
        }
    }

    /// Announce our pieces and make the neighbor reachable for HAVE fan-out
    /// and the choking scheduler.
    ///
    /// The store lock is held while registering so that every piece is either
    /// in the BITFIELD we queue here or announced by a later HAVE.
    async fn register(
        ctx: SessionContext,
        remote_id: PeerId,
        writer: OwnedWriteHalf,
    ) -> Result<(Self, JoinHandle<()>)> {
        let piece_count = ctx.layout.piece_count();
        let remote = match ctx.roster.get(remote_id) {
            Some(info) if info.has_file => Bitfield::full(piece_count),
            _ => Bitfield::new(piece_count),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let neighbor = Arc::new(Neighbor::new(remote_id, remote, tx));

        {
            let store = ctx.store.lock().await;
            if !store.is_empty() {
                neighbor.send(PeerMessage::Bitfield {
                    bitfield: store.bitfield().clone(),
                });
            }

            let mut neighbors = ctx.neighbors.lock().await;
            if neighbors.contains_key(&remote_id) {
                return Err(PeerError::HandshakeIdentityMismatch {
                    expected: "an unconnected peer".to_string(),
                    received: remote_id,
                });
            }
            neighbors.insert(remote_id, neighbor.clone());
        }

        let writer_task = tokio::spawn(write_loop(writer, rx, remote_id));

        Ok((
            Self {
                ctx,
                neighbor,
                phase: SessionPhase::AwaitingBitfield,
            },
            writer_task,
        ))
    }

    /// Receive loop
    async fn serve(
        &mut self,
        mut reader: FrameReader<OwnedReadHalf>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            let message = tokio::select! {
                message = reader.read_message() => message?,
                _ = shutdown_requested(&mut shutdown) => return Ok(()),
            };

            debug!("Received {} from peer {}", message, self.neighbor.id());
            self.handle_message(message).await?;
        }
    }

    async fn close(self, writer_task: JoinHandle<()>) {
        let id = self.neighbor.id();
        {
            let mut neighbors = self.ctx.neighbors.lock().await;
            if neighbors
                .get(&id)
                .is_some_and(|n| Arc::ptr_eq(n, &self.neighbor))
            {
                neighbors.remove(&id);
            }
        }
        debug!("Session with peer {} is {:?}", id, SessionPhase::Closed);

        // The writer exits once every handle to the neighbor is gone and
        // the queue is drained
        drop(self);
        if !finish_writer(writer_task, WRITER_DRAIN_TIMEOUT).await {
            warn!("Gave up flushing queued messages to peer {}", id);
        }
    }

    async fn handle_message(&mut self, message: PeerMessage) -> Result<()> {
        if self.phase == SessionPhase::AwaitingBitfield {
            self.phase = SessionPhase::Steady;
            debug!(
                "Session with peer {} is {:?}",
                self.neighbor.id(),
                self.phase
            );

            if let PeerMessage::Bitfield { bitfield } = message {
                self.neighbor.state.lock().await.remote = bitfield;
                self.announce_interest().await;
                return Ok(());
            }

            // The neighbor holds nothing and skipped its BITFIELD
            self.announce_interest().await;
        }

        match message {
            PeerMessage::Choke => self.on_choke().await,
            PeerMessage::Unchoke => self.on_unchoke().await,
            PeerMessage::Interested => self.on_interest(true).await,
            PeerMessage::NotInterested => self.on_interest(false).await,
            PeerMessage::Have { piece_index } => self.on_have(piece_index).await,
            PeerMessage::Bitfield { .. } => Err(PeerError::UnexpectedMessage(
                "bitfield after the first message".to_string(),
            )),
            PeerMessage::Request { piece_index } => self.on_request(piece_index).await,
            PeerMessage::Piece { piece_index, data } => self.on_piece(piece_index, &data).await,
        }
    }

    /// Initial INTERESTED / NOT_INTERESTED once the remote view is known
    async fn announce_interest(&self) {
        let (interested, remote_complete) = {
            // Store guard held so a piece landing meanwhile cannot be missed
            let store = self.ctx.store.lock().await;
            let mut state = self.neighbor.state.lock().await;
            state.am_interested = state.remote.is_interesting_to(store.bitfield());
            (state.am_interested, state.remote.is_complete())
        };

        if remote_complete {
            self.notify(SessionEvent::NeighborComplete(self.neighbor.id()));
        }
        self.send_interest(interested).await;
    }

    async fn send_interest(&self, interested: bool) {
        let (message, text) = if interested {
            (PeerMessage::Interested, "interested")
        } else {
            (PeerMessage::NotInterested, "not interested")
        };
        self.neighbor.send(message);
        self.ctx
            .log
            .write(format!(
                "Peer {} sent the '{}' message to {}.",
                self.ctx.local_id,
                text,
                self.neighbor.id()
            ))
            .await;
    }

    async fn on_choke(&self) -> Result<()> {
        {
            let mut state = self.neighbor.state.lock().await;
            state.choking_me = true;
            state.outstanding_request = None;
        }
        self.ctx
            .log
            .write(format!(
                "Peer {} is choked by {}.",
                self.ctx.local_id,
                self.neighbor.id()
            ))
            .await;
        Ok(())
    }

    async fn on_unchoke(&self) -> Result<()> {
        self.neighbor.state.lock().await.choking_me = false;
        self.ctx
            .log
            .write(format!(
                "Peer {} is unchoked by {}.",
                self.ctx.local_id,
                self.neighbor.id()
            ))
            .await;
        self.request_next().await;
        Ok(())
    }

    async fn on_interest(&self, interested: bool) -> Result<()> {
        self.neighbor.state.lock().await.is_interested = interested;
        let text = if interested {
            "interested"
        } else {
            "not interested"
        };
        self.ctx
            .log
            .write(format!(
                "Peer {} received the '{}' message from {}.",
                self.ctx.local_id,
                text,
                self.neighbor.id()
            ))
            .await;
        Ok(())
    }

    async fn on_have(&self, piece_index: u32) -> Result<()> {
        let (became_interested, remote_complete) = {
            let store = self.ctx.store.lock().await;
            let mut state = self.neighbor.state.lock().await;
            let was_complete = state.remote.is_complete();
            state.remote.set(piece_index);

            let became_interested = !state.am_interested && !store.has(piece_index);
            if became_interested {
                state.am_interested = true;
            }
            (
                became_interested,
                !was_complete && state.remote.is_complete(),
            )
        };

        self.ctx
            .log
            .write(format!(
                "Peer {} received the 'have' message from {} for the piece {}.",
                self.ctx.local_id,
                self.neighbor.id(),
                piece_index
            ))
            .await;

        if remote_complete {
            self.notify(SessionEvent::NeighborComplete(self.neighbor.id()));
        }
        if became_interested {
            self.send_interest(true).await;
            self.request_next().await;
        }
        Ok(())
    }

    async fn on_request(&self, piece_index: u32) -> Result<()> {
        if self.neighbor.state.lock().await.choked_by_me {
            // Request raced with a choke; not an error
            debug!(
                "Ignoring request for piece {} from choked peer {}",
                piece_index,
                self.neighbor.id()
            );
            return Ok(());
        }

        let data = {
            let mut store = self.ctx.store.lock().await;
            if !store.has(piece_index) {
                return Err(PeerError::PieceNotHeld(piece_index));
            }
            store.read(piece_index).await.map_err(PeerError::store)?
        };

        self.neighbor.send(PeerMessage::Piece {
            piece_index,
            data: data.into(),
        });
        Ok(())
    }

    async fn on_piece(&self, piece_index: u32, data: &[u8]) -> Result<()> {
        {
            let mut state = self.neighbor.state.lock().await;
            if state.outstanding_request != Some(piece_index) {
                return Err(PeerError::UnexpectedPiece {
                    received: piece_index,
                    outstanding: state.outstanding_request,
                });
            }
            state.outstanding_request = None;
            state.bytes_received += data.len() as u64;
        }

        let (newly_acquired, local, complete) = {
            let mut store = self.ctx.store.lock().await;
            let newly_acquired = store
                .write(piece_index, data)
                .await
                .map_err(PeerError::store)?;
            (newly_acquired, store.bitfield().clone(), store.is_complete())
        };

        if newly_acquired {
            self.ctx
                .log
                .write(format!(
                    "Peer {} has downloaded the piece {} from {}. Now the number of pieces it has is {} ({} remaining).",
                    self.ctx.local_id,
                    piece_index,
                    self.neighbor.id(),
                    local.count(),
                    local.len() - local.count()
                ))
                .await;

            broadcast_have(&self.ctx, piece_index, &local).await;

            if complete {
                self.ctx
                    .log
                    .write(format!(
                        "Peer {} has downloaded the complete file.",
                        self.ctx.local_id
                    ))
                    .await;
                self.notify(SessionEvent::LocalComplete);
            }
        }

        self.request_next().await;
        Ok(())
    }

    /// Send a REQUEST if the neighbor lets us and has something we want
    async fn request_next(&self) {
        let local = self.ctx.store.lock().await.bitfield().clone();
        let piece_index = {
            let mut state = self.neighbor.state.lock().await;
            if state.choking_me || !state.am_interested || state.outstanding_request.is_some() {
                return;
            }

            let picked = pick_piece(
                &state.remote,
                &local,
                state.outstanding_request,
                &mut rand::thread_rng(),
            );
            state.outstanding_request = picked;
            picked
        };

        if let Some(piece_index) = piece_index {
            debug!(
                "Requesting piece {} from peer {}",
                piece_index,
                self.neighbor.id()
            );
            self.neighbor.send(PeerMessage::Request { piece_index });
        }
    }

    fn notify(&self, event: SessionEvent) {
        let _ = self.ctx.events.send(event);
    }
}

/// Tell every neighbor we now hold `piece_index`, and drop interest in the
/// neighbors that no longer have anything we lack.
///
/// Runs after the store lock is released; sends only enqueue.
async fn broadcast_have(ctx: &SessionContext, piece_index: u32, local: &Bitfield) {
    let neighbors: Vec<Arc<Neighbor>> = ctx.neighbors.lock().await.values().cloned().collect();

    for neighbor in neighbors {
        neighbor.send(PeerMessage::Have { piece_index });

        let lost_interest = {
            let mut state = neighbor.state.lock().await;
            let lost = state.am_interested && !state.remote.is_interesting_to(local);
            if lost {
                state.am_interested = false;
            }
            lost
        };

        if lost_interest {
            neighbor.send(PeerMessage::NotInterested);
            ctx.log
                .write(format!(
                    "Peer {} sent the 'not interested' message to {}.",
                    ctx.local_id,
                    neighbor.id()
                ))
                .await;
        }
    }
}

/// Resolves once the coordinator asks everything to stop, or has gone away
pub async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|&stop| stop).await;
}

/// Wait up to `limit` for a writer to drain, aborting it past that so the
/// socket is released. Returns whether it finished in time.
async fn finish_writer(mut writer_task: JoinHandle<()>, limit: Duration) -> bool {
    if tokio::time::timeout(limit, &mut writer_task).await.is_ok() {
        return true;
    }
    writer_task.abort();
    false
}

/// Drain the outbound queue onto the socket
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<PeerMessage>,
    peer_id: PeerId,
) {
    while let Some(message) = rx.recv().await {
        if let Err(e) = write_message(&mut writer, &message).await {
            debug!("Write to peer {} failed: {}", peer_id, e);
            return;
        }
    }
    let _ = writer.shutdown().await;
}
