use super::Bitfield;
use rand::seq::IteratorRandom;
use rand::Rng;

/// Pick the next piece to request from a neighbor.
///
/// Candidates are the pieces the neighbor holds, we lack, and that are not
/// already outstanding to it. One is chosen uniformly at random so that
/// neighbors serving the same swarm do not converge on the same piece.
pub fn pick_piece<R: Rng + ?Sized>(
    remote: &Bitfield,
    local: &Bitfield,
    outstanding: Option<u32>,
    rng: &mut R,
) -> Option<u32> {
    remote
        .missing_from(local)
        .filter(|&index| Some(index) != outstanding)
        .choose(rng)
}
