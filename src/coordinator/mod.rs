use crate::choke::ChokingScheduler;
use crate::config::{CommonConfig, Config, PeerInfo, Roster};
use crate::error::{PeerError, Result};
use crate::eventlog::EventLog;
use crate::peer::{
    shutdown_requested, ExpectedPeer, NeighborSession, PeerConnection, PeerId, SessionContext,
    SessionEvent, SessionPhase,
};
use crate::storage::PieceStore;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Outbound connection attempts per predecessor
const CONNECT_ATTEMPTS: u32 = 10;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);
/// Pause after a failed accept so a persistent error cannot spin the loop
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Which roster peers are known to hold the whole file.
///
/// Entries only ever go from incomplete to complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionView {
    complete: BTreeMap<PeerId, bool>,
}

impl CompletionView {
    /// Seed from the roster's has-file flags
    pub fn new(roster: &Roster) -> Self {
        Self {
            complete: roster.iter().map(|p| (p.peer_id, p.has_file)).collect(),
        }
    }

    /// Mark a peer complete. Returns whether this changed the view; peers
    /// outside the roster are ignored.
    pub fn mark(&mut self, peer_id: PeerId) -> bool {
        match self.complete.get_mut(&peer_id) {
            Some(done) if !*done => {
                *done = true;
                true
            }
            _ => false,
        }
    }

    pub fn is_complete(&self, peer_id: PeerId) -> bool {
        self.complete.get(&peer_id).copied().unwrap_or(false)
    }

    pub fn all_complete(&self) -> bool {
        self.complete.values().all(|&done| done)
    }

    pub fn remaining(&self) -> Vec<PeerId> {
        self.complete
            .iter()
            .filter(|(_, &done)| !done)
            .map(|(&id, _)| id)
            .collect()
    }
}

/// Owns the listener and every neighbor session of the local peer, and
/// decides when the process is done
pub struct Coordinator {
    local_id: PeerId,
    common: CommonConfig,
    roster: Arc<Roster>,
    workdir: PathBuf,
}

impl Coordinator {
    pub fn new<P: AsRef<Path>>(config: Config, local_id: PeerId, workdir: P) -> Result<Self> {
        if config.roster.get(local_id).is_none() {
            return Err(PeerError::Config(format!(
                "peer {} is not in the roster",
                local_id
            )));
        }

        Ok(Self {
            local_id,
            common: config.common,
            roster: Arc::new(config.roster),
            workdir: workdir.as_ref().to_path_buf(),
        })
    }

    fn me(&self) -> Result<&PeerInfo> {
        self.roster
            .get(self.local_id)
            .ok_or_else(|| PeerError::Config(format!("peer {} is not in the roster", self.local_id)))
    }

    /// Where the local copy of the file lives
    pub fn file_path(&self) -> PathBuf {
        self.workdir
            .join(format!("peer_{}", self.local_id))
            .join(&self.common.file_name)
    }

    /// Bind the configured port on every interface
    pub async fn bind(&self) -> Result<TcpListener> {
        let port = self.me()?.port;
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        info!("Listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Bind, then serve until every peer holds the file
    pub async fn run(self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until every roster peer, this one
    /// included, is known to hold the complete file
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let me = self.me()?.clone();
        let layout = self.common.layout();

        let log = Arc::new(EventLog::open(&self.workdir, self.local_id).await?);
        log.write(format!("Peer {} started.", self.local_id)).await;

        let store = PieceStore::open(self.file_path(), layout, me.has_file).await?;
        let mut view = CompletionView::new(&self.roster);
        if store.is_complete() {
            view.mark(self.local_id);
        }

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ctx = SessionContext {
            local_id: self.local_id,
            layout,
            roster: self.roster.clone(),
            store: Arc::new(Mutex::new(store)),
            neighbors: Arc::new(Mutex::new(HashMap::new())),
            log: log.clone(),
            events: events_tx,
            shutdown: shutdown_rx,
        };

        let scheduler = tokio::spawn(
            ChokingScheduler::new(
                ctx.clone(),
                self.common.num_pref_neighbors,
                self.common.unchoke_interval,
                self.common.optimistic_interval,
            )
            .run(),
        );

        let mut sessions = JoinSet::new();
        for peer in self.roster.predecessors(self.local_id) {
            sessions.spawn(dial(peer.clone(), ctx.clone()));
        }

        let mut outcome = Ok(());
        while !view.all_complete() {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!("Session with {} is {:?}", addr, SessionPhase::Connecting);
                        match PeerConnection::accepted(stream, addr) {
                            Ok(conn) => {
                                sessions.spawn(NeighborSession::run(
                                    conn,
                                    ExpectedPeer::Successor,
                                    ctx.clone(),
                                ));
                            }
                            Err(e) => warn!("Dropping connection from {}: {}", addr, e),
                        }
                    }
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(event) = events_rx.recv() => {
                    if let Err(e) = self.handle_event(event, &mut view, &log).await {
                        error!("Aborting: {}", e);
                        outcome = Err(e);
                        break;
                    }
                }
            }
        }

        if outcome.is_ok() {
            log.write(format!(
                "Peer {} knows every peer has the complete file. Shutting down.",
                self.local_id
            ))
            .await;
        }

        // Stop everything exactly once
        let _ = shutdown_tx.send(true);
        drop(listener);
        while sessions.join_next().await.is_some() {}
        let _ = scheduler.await;
        info!("Peer {} stopped", self.local_id);

        outcome
    }

    async fn handle_event(
        &self,
        event: SessionEvent,
        view: &mut CompletionView,
        log: &EventLog,
    ) -> Result<()> {
        match event {
            SessionEvent::LocalComplete => {
                view.mark(self.local_id);
            }
            SessionEvent::NeighborComplete(peer_id) => {
                if view.mark(peer_id) {
                    log.write(format!(
                        "Peer {} observed that Peer {} has the complete file.",
                        self.local_id, peer_id
                    ))
                    .await;
                }
            }
            SessionEvent::Closed {
                peer_id,
                addr,
                result,
            } => {
                let who = peer_id.map_or_else(|| addr.to_string(), |id| format!("Peer {}", id));
                match result {
                    Ok(()) => debug!("Session with {} ended", who),
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        log.write(format!(
                            "Peer {} closed the connection with {}: {}.",
                            self.local_id, who, e
                        ))
                        .await;
                    }
                }
            }
        }

        debug!("Still waiting on peers {:?}", view.remaining());
        Ok(())
    }
}

/// Open the connection to a predecessor and run its session
async fn dial(peer: PeerInfo, ctx: SessionContext) {
    let mut shutdown = ctx.shutdown.clone();
    let conn = tokio::select! {
        conn = connect_with_retry(&peer, CONNECT_ATTEMPTS, CONNECT_RETRY_DELAY) => conn,
        _ = shutdown_requested(&mut shutdown) => return,
    };

    match conn {
        Ok(conn) => {
            ctx.log
                .write(format!(
                    "Peer {} makes a connection to Peer {}.",
                    ctx.local_id, peer.peer_id
                ))
                .await;
            NeighborSession::run(conn, ExpectedPeer::Exactly(peer.peer_id), ctx).await;
        }
        Err(e) => {
            warn!("Giving up on peer {}: {}", peer.peer_id, e);
            ctx.log
                .write(format!(
                    "Peer {} could not connect to Peer {}: {}.",
                    ctx.local_id, peer.peer_id, e
                ))
                .await;
        }
    }
}

/// Predecessors may still be starting up, so refused connections are retried
async fn connect_with_retry(
    peer: &PeerInfo,
    attempts: u32,
    delay: Duration,
) -> Result<PeerConnection> {
    let mut attempt = 1;
    loop {
        debug!("Peer {} is {:?}", peer.peer_id, SessionPhase::Connecting);
        let result = match peer.socket_addr().await {
            Ok(addr) => PeerConnection::connect(addr).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(conn) => return Ok(conn),
            Err(e) if attempt < attempts => {
                debug!(
                    "Connecting to peer {} failed (attempt {}): {}",
                    peer.peer_id, attempt, e
                );
                attempt += 1;
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn roster(flags: &[(PeerId, bool)]) -> Roster {
        Roster::new(
            flags
                .iter()
                .map(|&(peer_id, has_file)| PeerInfo {
                    peer_id,
                    host: "127.0.0.1".to_string(),
                    port: 0,
                    has_file,
                })
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_completion_view_is_monotonic() {
        let mut view = CompletionView::new(&roster(&[(1, true), (2, false), (3, false)]));
        assert!(view.is_complete(1));
        assert!(!view.all_complete());
        assert_eq!(view.remaining(), vec![2, 3]);

        assert!(view.mark(2));
        assert!(!view.mark(2));
        assert!(!view.mark(1));
        assert!(!view.mark(99));
        assert!(view.is_complete(2));

        assert!(view.mark(3));
        assert!(view.all_complete());
        assert!(view.remaining().is_empty());
    }

    fn common(file_size: u64, piece_size: u64, k: usize) -> CommonConfig {
        CommonConfig {
            num_pref_neighbors: k,
            unchoke_interval: Duration::from_millis(200),
            optimistic_interval: Duration::from_millis(500),
            file_name: "shared.dat".to_string(),
            file_size,
            piece_size,
        }
    }

    /// Bind one loopback listener per peer, then build a roster naming
    /// their real ports
    async fn swarm(flags: &[(PeerId, bool)]) -> (Roster, Vec<TcpListener>) {
        let mut listeners = Vec::new();
        let mut peers = Vec::new();
        for &(peer_id, has_file) in flags {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            peers.push(PeerInfo {
                peer_id,
                host: "127.0.0.1".to_string(),
                port: listener.local_addr().unwrap().port(),
                has_file,
            });
            listeners.push(listener);
        }
        (Roster::new(peers).unwrap(), listeners)
    }

    /// A loopback port with nothing listening on it
    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    fn loopback(port: u16) -> PeerInfo {
        PeerInfo {
            peer_id: 1,
            host: "127.0.0.1".to_string(),
            port,
            has_file: true,
        }
    }

    #[tokio::test]
    async fn test_connect_retries_until_predecessor_listens() {
        let port = free_port().await;
        let late = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
            listener.accept().await.unwrap();
        });

        let conn = connect_with_retry(&loopback(port), 50, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(conn.addr().port(), port);
        tokio::time::timeout(Duration::from_secs(5), late)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_connect_gives_up_after_last_attempt() {
        let port = free_port().await;
        let started = tokio::time::Instant::now();

        let result = connect_with_retry(&loopback(port), 3, Duration::from_millis(100)).await;
        assert!(matches!(result, Err(PeerError::IoError(_))));
        // Two pauses between three attempts
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_rejects_unknown_local_id() {
        let config = Config {
            common: common(10, 4, 1),
            roster: roster(&[(1, true)]),
        };
        assert!(matches!(
            Coordinator::new(config, 2, "."),
            Err(PeerError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_everyone_seeding_exits_at_once() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            common: common(10, 4, 1),
            roster: roster(&[(1, true)]),
        };
        let coordinator = Coordinator::new(config, 1, dir.path()).unwrap();
        std::fs::create_dir_all(dir.path().join("peer_1")).unwrap();
        std::fs::write(coordinator.file_path(), b"0123456789").unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), coordinator.serve(listener))
            .await
            .unwrap()
            .unwrap();

        let log = std::fs::read_to_string(dir.path().join("log_peer_1.log")).unwrap();
        assert!(log.contains("Shutting down."));
    }

    #[tokio::test]
    async fn test_three_peers_share_a_file() {
        let contents = b"abcdefghij";
        let dir = TempDir::new().unwrap();
        let flags = [(1001, true), (1002, false), (1003, false)];
        let (roster, listeners) = swarm(&flags).await;

        let seed_dir = dir.path().join("peer_1001");
        std::fs::create_dir_all(&seed_dir).unwrap();
        std::fs::write(seed_dir.join("shared.dat"), contents).unwrap();

        let mut peers = JoinSet::new();
        for ((peer_id, _), listener) in flags.iter().zip(listeners) {
            let config = Config {
                common: common(10, 4, 1),
                roster: roster.clone(),
            };
            let coordinator = Coordinator::new(config, *peer_id, dir.path()).unwrap();
            peers.spawn(coordinator.serve(listener));
        }

        tokio::time::timeout(Duration::from_secs(60), async {
            while let Some(joined) = peers.join_next().await {
                joined.unwrap().unwrap();
            }
        })
        .await
        .expect("swarm did not finish");

        for peer_id in [1002, 1003] {
            let path = dir
                .path()
                .join(format!("peer_{}", peer_id))
                .join("shared.dat");
            assert_eq!(std::fs::read(path).unwrap(), contents);

            let log = std::fs::read_to_string(
                dir.path().join(format!("log_peer_{}.log", peer_id)),
            )
            .unwrap();
            assert!(log.contains("has downloaded the complete file."));
            assert!(log.contains("sent the 'interested' message to 1001."));
        }

        let seed_log = std::fs::read_to_string(dir.path().join("log_peer_1001.log")).unwrap();
        assert!(!seed_log.contains("sent the 'interested' message"));
        assert!(seed_log.contains("received the 'interested' message from"));
        for line in seed_log.lines().filter(|l| l.contains("preferred neighbors [")) {
            // One preferred slot
            assert!(!line.contains(','), "{}", line);
        }

        // Each leecher learns the other finished, piece by piece
        for (downloader, observer) in [(1002, 1003), (1003, 1002)] {
            let observer_log = std::fs::read_to_string(
                dir.path().join(format!("log_peer_{}.log", observer)),
            )
            .unwrap();

            let have = format!("received the 'have' message from {} for the piece", downloader);
            assert!(observer_log.contains(&have), "{}", have);
            let done = format!("observed that Peer {} has the complete file.", downloader);
            assert!(observer_log.contains(&done), "{}", done);
        }
    }
}
