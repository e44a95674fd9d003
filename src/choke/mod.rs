//! Periodic choking and optimistic unchoking.

use crate::eventlog::id_list;
use crate::peer::{shutdown_requested, Neighbor, PeerId, SessionContext};
use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

/// An interested neighbor competing for a preferred slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub id: PeerId,
    pub bytes_received: u64,
}

/// Choose up to `k` preferred neighbors.
///
/// While downloading, candidates are ranked by bytes received in the last
/// interval, ties broken uniformly at random. Once the local file is complete
/// the rate says nothing and the choice is uniformly random.
pub fn select_preferred<R: Rng + ?Sized>(
    candidates: &[Candidate],
    k: usize,
    complete: bool,
    rng: &mut R,
) -> Vec<PeerId> {
    let mut ranked = candidates.to_vec();
    ranked.shuffle(rng);
    if !complete {
        // Stable, so equal rates keep their shuffled order
        ranked.sort_by(|a, b| b.bytes_received.cmp(&a.bytes_received));
    }
    ranked.truncate(k);
    ranked.into_iter().map(|c| c.id).collect()
}

/// Pick the optimistic unchoke among choked, interested neighbors
pub fn select_optimistic<R: Rng + ?Sized>(candidates: &[PeerId], rng: &mut R) -> Option<PeerId> {
    candidates.choose(rng).copied()
}

/// Runs the unchoke and optimistic-unchoke timers for one peer
pub struct ChokingScheduler {
    ctx: SessionContext,
    num_pref_neighbors: usize,
    unchoke_interval: Duration,
    optimistic_interval: Duration,
    /// Sorted, for change detection
    preferred: Vec<PeerId>,
    optimistic: Option<PeerId>,
}

impl ChokingScheduler {
    pub fn new(
        ctx: SessionContext,
        num_pref_neighbors: usize,
        unchoke_interval: Duration,
        optimistic_interval: Duration,
    ) -> Self {
        Self {
            ctx,
            num_pref_neighbors,
            unchoke_interval,
            optimistic_interval,
            preferred: Vec::new(),
            optimistic: None,
        }
    }

    pub fn preferred(&self) -> &[PeerId] {
        &self.preferred
    }

    pub fn optimistic(&self) -> Option<PeerId> {
        self.optimistic
    }

    /// Tick both timers until shutdown. Each first fires one full interval
    /// after start.
    pub async fn run(mut self) {
        let start = Instant::now();
        let mut unchoke = interval_at(start + self.unchoke_interval, self.unchoke_interval);
        let mut optimistic =
            interval_at(start + self.optimistic_interval, self.optimistic_interval);
        unchoke.set_missed_tick_behavior(MissedTickBehavior::Delay);
        optimistic.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut shutdown = self.ctx.shutdown.clone();
        loop {
            tokio::select! {
                _ = unchoke.tick() => self.unchoke_tick().await,
                _ = optimistic.tick() => self.optimistic_tick().await,
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }
        debug!("Choking scheduler stopped");
    }

    /// Recompute the preferred neighbors
    pub async fn unchoke_tick(&mut self) {
        let complete = self.ctx.store.lock().await.is_complete();
        let neighbors = self.snapshot().await;

        let mut candidates = Vec::new();
        for neighbor in &neighbors {
            let mut state = neighbor.state.lock().await;
            if state.is_interested {
                candidates.push(Candidate {
                    id: neighbor.id(),
                    bytes_received: state.bytes_received,
                });
            }
            state.bytes_received = 0;
        }

        let mut preferred = select_preferred(
            &candidates,
            self.num_pref_neighbors,
            complete,
            &mut rand::thread_rng(),
        );
        preferred.sort_unstable();

        for neighbor in &neighbors {
            let id = neighbor.id();
            if preferred.contains(&id) {
                neighbor.unchoke().await;
            } else if self.optimistic != Some(id) {
                neighbor.choke().await;
            }
        }

        if preferred != self.preferred {
            self.ctx
                .log
                .write(format!(
                    "Peer {} has the preferred neighbors [{}].",
                    self.ctx.local_id,
                    id_list(&preferred)
                ))
                .await;
            self.preferred = preferred;
        }
    }

    /// Rotate the optimistic unchoke
    pub async fn optimistic_tick(&mut self) {
        let neighbors = self.snapshot().await;
        let previous = self.optimistic;
        self.forget_departed(&neighbors);

        let mut candidates = Vec::new();
        let mut interested = Vec::new();
        for neighbor in &neighbors {
            let state = neighbor.state.lock().await;
            if state.is_interested {
                interested.push(neighbor.id());
                if state.choked_by_me && !self.preferred.contains(&neighbor.id()) {
                    candidates.push(neighbor.id());
                }
            }
        }

        let next = select_optimistic(&candidates, &mut rand::thread_rng())
            .or_else(|| previous.filter(|id| interested.contains(id)));

        if next == previous {
            return;
        }

        if let Some(pick) = next.and_then(|id| find(&neighbors, id)) {
            pick.unchoke().await;
        }
        if let Some(prev) = previous {
            if !self.preferred.contains(&prev) {
                if let Some(prev) = find(&neighbors, prev) {
                    prev.choke().await;
                }
            }
        }
        self.optimistic = next;

        let text = match next {
            Some(id) => format!(
                "Peer {} has the optimistically unchoked neighbor {}.",
                self.ctx.local_id, id
            ),
            None => format!(
                "Peer {} has no optimistically unchoked neighbor.",
                self.ctx.local_id
            ),
        };
        self.ctx.log.write(text).await;
    }

    async fn snapshot(&self) -> Vec<Arc<Neighbor>> {
        let mut neighbors: Vec<_> = self.ctx.neighbors.lock().await.values().cloned().collect();
        neighbors.sort_by_key(|n| n.id());
        neighbors
    }

    /// Drop neighbors whose connection went away from the scheduler's view
    fn forget_departed(&mut self, neighbors: &[Arc<Neighbor>]) {
        let connected = |id: &PeerId| neighbors.iter().any(|n| n.id() == *id);
        self.preferred.retain(connected);
        if !self.optimistic.as_ref().is_some_and(connected) {
            self.optimistic = None;
        }
    }
}

fn find(neighbors: &[Arc<Neighbor>], id: PeerId) -> Option<&Arc<Neighbor>> {
    neighbors.iter().find(|n| n.id() == id)
}
