//! Tit-for-tat choking with one rotating optimistic slot.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Instant;

use rand::Rng;
use rand::seq::IndexedRandom;

/// Inputs the choker needs about one connected peer.
#[derive(Debug, Clone, Copy)]
pub struct ChokeCandidate {
    pub endpoint: SocketAddr,
    pub interested: bool,
    /// Download rate from the peer while leeching, upload rate to it while seeding
    pub rate: u64,
    pub connected_at: Instant,
}

/// Picks the peers to unchoke this round.
///
/// Up to `slots - 1` interested peers win by rate (highest first, earlier
/// connection on ties). The remaining slot goes to `optimistic` when it is
/// still an interested loser, else to the next best peer.
pub fn select_unchoked(
    candidates: &[ChokeCandidate],
    slots: usize,
    optimistic: Option<SocketAddr>,
) -> HashSet<SocketAddr> {
    if slots == 0 {
        return HashSet::new();
    }

    let mut ranked: Vec<&ChokeCandidate> = candidates.iter().filter(|c| c.interested).collect();
    ranked.sort_by(|a, b| {
        b.rate
            .cmp(&a.rate)
            .then_with(|| a.connected_at.cmp(&b.connected_at))
    });

    let regular = if slots > 1 { slots - 1 } else { slots };
    let mut unchoked: HashSet<SocketAddr> =
        ranked.iter().take(regular).map(|c| c.endpoint).collect();

    if unchoked.len() < slots {
        let optimistic_pick = optimistic.filter(|endpoint| {
            !unchoked.contains(endpoint) && ranked.iter().any(|c| c.endpoint == *endpoint)
        });
        let extra = optimistic_pick.or_else(|| {
            ranked
                .iter()
                .map(|c| c.endpoint)
                .find(|endpoint| !unchoked.contains(endpoint))
        });
        if let Some(endpoint) = extra {
            unchoked.insert(endpoint);
        }
    }

    unchoked
}

/// Chooses a new optimistic peer among interested peers outside the regular set.
pub fn pick_optimistic<R: Rng + ?Sized>(
    candidates: &[ChokeCandidate],
    slots: usize,
    rng: &mut R,
) -> Option<SocketAddr> {
    let regular = select_unchoked(candidates, slots.saturating_sub(1), None);
    let pool: Vec<SocketAddr> = candidates
        .iter()
        .filter(|c| c.interested && !regular.contains(&c.endpoint))
        .map(|c| c.endpoint)
        .collect();
    pool.choose(rng).copied()
}
