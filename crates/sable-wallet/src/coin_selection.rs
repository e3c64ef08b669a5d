//! Coin selection: choosing which unspent outputs fund a payment.
//!
//! Deterministic tiers run first — a manually pinned set, a single exact
//! match, an exact sum of everything below the change threshold, a
//! smallest-sufficient single coin — and only then a randomized
//! approximate subset-sum search over the small coins. The random source is
//! caller-supplied so searches replay exactly under a seeded RNG.

use std::collections::BTreeSet;

use rand::Rng;
use tracing::debug;

use sable_core::constants::{DEFAULT_MAX_ANCESTORS, KNAPSACK_ITERATIONS, MIN_CHANGE};
use sable_core::types::{Destination, OutPoint};

use crate::error::WalletError;

/// An unspent owned output as produced by the ledger's candidate scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UtxoCandidate {
    /// The output's location.
    pub outpoint: OutPoint,
    /// Value in motes.
    pub value: u64,
    /// Destination the value is locked to.
    pub destination: Destination,
    /// Confirmation depth; zero for mempool transactions.
    pub depth: u64,
    /// In-pool ancestor count when unconfirmed, zero otherwise.
    pub ancestors: usize,
    /// Whether the creating transaction spends our own outputs.
    pub from_me: bool,
    /// Wallet holds the spending key.
    pub spendable: bool,
    /// Wallet can produce a witness for it.
    pub solvable: bool,
    /// Creating transaction passes the trust predicate.
    pub safe: bool,
}

/// A candidate reduced to what selection arithmetic needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputCoin {
    /// The output's location.
    pub outpoint: OutPoint,
    /// Value in motes — the ordering key.
    pub value: u64,
    /// Destination, carried through for signing.
    pub destination: Destination,
}

impl From<&UtxoCandidate> for InputCoin {
    fn from(c: &UtxoCandidate) -> Self {
        Self {
            outpoint: c.outpoint,
            value: c.value,
            destination: c.destination,
        }
    }
}

impl Ord for InputCoin {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.value
            .cmp(&other.value)
            .then_with(|| self.outpoint.cmp(&other.outpoint))
    }
}

impl PartialOrd for InputCoin {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// One eligibility tier plus manual overrides.
///
/// The builder tries tiers from strictest to most permissive and accepts
/// the first that selects.
#[derive(Debug, Clone)]
pub struct SelectionPolicy {
    /// Minimum depth for coins created by our own transactions.
    pub min_depth_mine: u64,
    /// Minimum depth for coins received from others.
    pub min_depth_foreign: u64,
    /// Maximum in-pool ancestors tolerated on unconfirmed coins.
    pub max_ancestors: usize,
    /// Outpoints the caller pinned into the selection.
    pub manual: BTreeSet<OutPoint>,
    /// Whether automatic selection may add to the pinned set.
    pub allow_other_inputs: bool,
}

impl SelectionPolicy {
    /// A tier with no manual overrides.
    pub fn tier(min_depth_mine: u64, min_depth_foreign: u64, max_ancestors: usize) -> Self {
        Self {
            min_depth_mine,
            min_depth_foreign,
            max_ancestors,
            manual: BTreeSet::new(),
            allow_other_inputs: true,
        }
    }

    /// The default strictest-first tier ladder.
    pub fn default_tiers() -> Vec<Self> {
        vec![
            Self::tier(1, 6, DEFAULT_MAX_ANCESTORS),
            Self::tier(1, 1, DEFAULT_MAX_ANCESTORS),
            Self::tier(0, 1, DEFAULT_MAX_ANCESTORS / 3),
            Self::tier(0, 1, DEFAULT_MAX_ANCESTORS),
        ]
    }

    fn admits(&self, c: &UtxoCandidate) -> bool {
        if !c.spendable || !c.solvable {
            return false;
        }
        let min_depth = if c.from_me {
            self.min_depth_mine
        } else {
            self.min_depth_foreign
        };
        if c.depth < min_depth {
            return false;
        }
        if c.depth == 0 && (!c.safe || c.ancestors > self.max_ancestors) {
            return false;
        }
        true
    }
}

/// Chosen inputs and their total value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    /// The coins to spend.
    pub coins: Vec<InputCoin>,
    /// Sum of their values; always ≥ the requested target.
    pub total: u64,
}

/// Choose coins from `candidates` summing to at least `target`.
pub fn select<R: Rng>(
    candidates: &[UtxoCandidate],
    target: u64,
    policy: &SelectionPolicy,
    rng: &mut R,
) -> Result<Selection, WalletError> {
    // Manually pinned coins come first, eligibility-exempt.
    let preset: Vec<InputCoin> = candidates
        .iter()
        .filter(|c| c.spendable && policy.manual.contains(&c.outpoint))
        .map(InputCoin::from)
        .collect();
    let preset_total: u64 = preset.iter().map(|c| c.value).sum();

    if !policy.manual.is_empty() && !policy.allow_other_inputs {
        if preset_total >= target {
            return Ok(Selection { coins: preset, total: preset_total });
        }
        return Err(WalletError::InsufficientFunds {
            have: preset_total,
            need: target,
        });
    }
    if preset_total >= target {
        return Ok(Selection { coins: preset, total: preset_total });
    }
    let remaining_target = target - preset_total;

    let eligible: Vec<InputCoin> = candidates
        .iter()
        .filter(|c| !policy.manual.contains(&c.outpoint) && policy.admits(c))
        .map(InputCoin::from)
        .collect();
    let eligible_total: u64 = eligible.iter().map(|c| c.value).sum();

    match knapsack(eligible, remaining_target, rng) {
        Some(mut auto) => {
            debug!(
                picked = auto.coins.len() + preset.len(),
                total = auto.total + preset_total,
                target,
                "selected coins"
            );
            auto.coins.extend(preset);
            auto.total += preset_total;
            Ok(auto)
        }
        None => Err(WalletError::InsufficientFunds {
            have: preset_total + eligible_total,
            need: target,
        }),
    }
}

/// Core selection over eligible coins: exact tiers, then randomized search.
/// Returns `None` only when the coins cannot reach `target` at all.
fn knapsack<R: Rng>(
    coins: Vec<InputCoin>,
    target: u64,
    rng: &mut R,
) -> Option<Selection> {
    let mut small: Vec<InputCoin> = Vec::new();
    let mut lowest_larger: Option<InputCoin> = None;

    for coin in coins {
        if coin.value == target {
            return Some(Selection { coins: vec![coin], total: coin.value });
        } else if coin.value < target + MIN_CHANGE {
            small.push(coin);
        } else if lowest_larger.is_none_or(|l| coin.value < l.value) {
            lowest_larger = Some(coin);
        }
    }

    let total_small: u64 = small.iter().map(|c| c.value).sum();
    if total_small == target {
        return Some(Selection { coins: small, total: total_small });
    }
    if total_small < target {
        return lowest_larger.map(|coin| Selection { coins: vec![coin], total: coin.value });
    }

    // More small value than needed: search for a low-excess subset.
    small.sort_by(|a, b| b.cmp(a));
    let (mut best_mask, mut best_total) =
        approximate_best_subset(&small, total_small, target, rng);
    if best_total != target && total_small >= target + MIN_CHANGE {
        (best_mask, best_total) =
            approximate_best_subset(&small, total_small, target + MIN_CHANGE, rng);
    }

    // A single larger coin wins when the subset would leave unusable
    // change, or when it carries no more excess than the subset (the
    // simpler transaction breaks the tie).
    if let Some(larger) = lowest_larger {
        let subset_leaves_dust = best_total != target && best_total < target + MIN_CHANGE;
        if subset_leaves_dust || larger.value <= best_total {
            return Some(Selection { coins: vec![larger], total: larger.value });
        }
    }

    let mut picked = Vec::new();
    let mut total = 0u64;
    for (coin, include) in small.into_iter().zip(best_mask) {
        if include {
            total += coin.value;
            picked.push(coin);
        }
    }
    debug_assert_eq!(total, best_total);
    Some(Selection { coins: picked, total })
}

/// Randomized two-pass subset search.
///
/// Each rep flips coins in with probability one half, then a second pass
/// fills from whatever was left out; every time the running total reaches
/// the target the subset is scored and the last coin backed out, so a rep
/// probes many subsets. Tracks the best (lowest) total ≥ target.
fn approximate_best_subset<R: Rng>(
    coins: &[InputCoin],
    total: u64,
    target: u64,
    rng: &mut R,
) -> (Vec<bool>, u64) {
    let mut best = vec![true; coins.len()];
    let mut best_total = total;
    let mut included = vec![false; coins.len()];

    for _ in 0..KNAPSACK_ITERATIONS {
        if best_total == target {
            break;
        }
        included.fill(false);
        let mut running = 0u64;
        let mut reached = false;
        for pass in 0..2 {
            if reached {
                break;
            }
            for i in 0..coins.len() {
                let flip = if pass == 0 { rng.r#gen::<bool>() } else { !included[i] };
                if flip {
                    running += coins[i].value;
                    included[i] = true;
                    if running >= target {
                        reached = true;
                        if running < best_total {
                            best_total = running;
                            best.copy_from_slice(&included);
                        }
                        running -= coins[i].value;
                        included[i] = false;
                    }
                }
            }
        }
    }
    (best, best_total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use sable_core::constants::COIN;
    use sable_core::types::Hash256;

    fn candidate(marker: u8, value: u64) -> UtxoCandidate {
        UtxoCandidate {
            outpoint: OutPoint { txid: Hash256([marker; 32]), index: 0 },
            value,
            destination: dest(1),
            depth: 10,
            ancestors: 0,
            from_me: false,
            spendable: true,
            solvable: true,
            safe: true,
        }
    }

    fn candidates(values: &[u64]) -> Vec<UtxoCandidate> {
        values
            .iter()
            .enumerate()
            .map(|(i, &v)| candidate(i as u8 + 1, v))
            .collect()
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(17)
    }

    fn tier() -> SelectionPolicy {
        SelectionPolicy::tier(1, 1, DEFAULT_MAX_ANCESTORS)
    }

    #[test]
    fn exact_single_match_wins() {
        let cands = candidates(&[50, 30, 10]);
        let sel = select(&cands, 50, &tier(), &mut rng()).unwrap();
        assert_eq!(sel.coins.len(), 1);
        assert_eq!(sel.total, 50);
        assert_eq!(sel.coins[0].value, 50);
    }

    #[test]
    fn exact_sum_of_small_coins_wins() {
        let cands = candidates(&[10, 20, 5]);
        let sel = select(&cands, 15, &tier(), &mut rng()).unwrap();
        assert_eq!(sel.total, 15);
        let mut values: Vec<u64> = sel.coins.iter().map(|c| c.value).collect();
        values.sort_unstable();
        assert_eq!(values, vec![5, 10]);
    }

    #[test]
    fn single_larger_coin_fallback() {
        let cands = candidates(&[100]);
        let sel = select(&cands, 10, &tier(), &mut rng()).unwrap();
        assert_eq!(sel.total, 100);
        assert_eq!(sel.coins.len(), 1);
    }

    #[test]
    fn infeasible_target_fails_with_context() {
        let cands = candidates(&[1, 2]);
        let err = select(&cands, 10, &tier(), &mut rng()).unwrap_err();
        assert_eq!(err, WalletError::InsufficientFunds { have: 3, need: 10 });
    }

    #[test]
    fn randomized_search_prefers_low_excess() {
        // No exact solution; subset {3 COIN, 2 COIN} overshoots by far less
        // than the 90 COIN coin.
        let cands = candidates(&[3 * COIN, 2 * COIN, 90 * COIN]);
        let sel = select(&cands, 4 * COIN, &tier(), &mut rng()).unwrap();
        assert_eq!(sel.total, 5 * COIN);
        assert_eq!(sel.coins.len(), 2);
    }

    #[test]
    fn tie_favors_single_larger_coin() {
        // Subset can reach exactly target + MIN_CHANGE; a single coin of
        // the same value produces the same excess and wins the tie.
        let subset_sum = 2 * COIN + MIN_CHANGE;
        let cands = candidates(&[COIN, COIN + MIN_CHANGE, subset_sum]);
        let sel = select(&cands, 2 * COIN, &tier(), &mut rng()).unwrap();
        assert_eq!(sel.coins.len(), 1);
        assert_eq!(sel.total, subset_sum);
    }

    #[test]
    fn deterministic_under_seed() {
        let cands = candidates(&[7, 13, 23, 41, 89, 151, 277]);
        let a = select(&cands, 100, &tier(), &mut StdRng::seed_from_u64(42)).unwrap();
        let b = select(&cands, 100, &tier(), &mut StdRng::seed_from_u64(42)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn manual_only_selection() {
        let cands = candidates(&[10, 20, 30]);
        let mut policy = tier();
        policy.manual.insert(cands[2].outpoint);
        policy.allow_other_inputs = false;

        let sel = select(&cands, 25, &policy, &mut rng()).unwrap();
        assert_eq!(sel.coins.len(), 1);
        assert_eq!(sel.total, 30);

        let err = select(&cands, 35, &policy, &mut rng()).unwrap_err();
        assert_eq!(err, WalletError::InsufficientFunds { have: 30, need: 35 });
    }

    #[test]
    fn manual_mixes_with_automatic() {
        let cands = candidates(&[10, 20, 30]);
        let mut policy = tier();
        policy.manual.insert(cands[0].outpoint);

        let sel = select(&cands, 40, &policy, &mut rng()).unwrap();
        assert!(sel.total >= 40);
        assert!(sel.coins.iter().any(|c| c.outpoint == cands[0].outpoint));
    }

    #[test]
    fn depth_policy_filters_candidates() {
        let mut cands = candidates(&[10 * COIN, 10 * COIN]);
        cands[0].depth = 2; // foreign, below the 6-conf tier
        cands[1].depth = 8;

        let strict = SelectionPolicy::tier(1, 6, DEFAULT_MAX_ANCESTORS);
        let sel = select(&cands, 9 * COIN, &strict, &mut rng()).unwrap();
        assert_eq!(sel.coins[0].outpoint, cands[1].outpoint);

        let err = select(&cands, 15 * COIN, &strict, &mut rng()).unwrap_err();
        assert!(matches!(err, WalletError::InsufficientFunds { have, .. } if have == 10 * COIN));

        let relaxed = SelectionPolicy::tier(1, 1, DEFAULT_MAX_ANCESTORS);
        assert!(select(&cands, 15 * COIN, &relaxed, &mut rng()).is_ok());
    }

    #[test]
    fn unsafe_unconfirmed_coins_excluded() {
        let mut cands = candidates(&[5 * COIN]);
        cands[0].depth = 0;
        cands[0].from_me = true;
        cands[0].safe = false;

        let permissive = SelectionPolicy::tier(0, 1, DEFAULT_MAX_ANCESTORS);
        let err = select(&cands, COIN, &permissive, &mut rng()).unwrap_err();
        assert!(matches!(err, WalletError::InsufficientFunds { have: 0, .. }));

        cands[0].safe = true;
        assert!(select(&cands, COIN, &permissive, &mut rng()).is_ok());
    }

    #[test]
    fn long_ancestor_chains_excluded() {
        let mut cands = candidates(&[5 * COIN]);
        cands[0].depth = 0;
        cands[0].from_me = true;
        cands[0].safe = true;
        cands[0].ancestors = DEFAULT_MAX_ANCESTORS + 1;

        let permissive = SelectionPolicy::tier(0, 1, DEFAULT_MAX_ANCESTORS);
        assert!(select(&cands, COIN, &permissive, &mut rng()).is_err());

        cands[0].ancestors = 2;
        assert!(select(&cands, COIN, &permissive, &mut rng()).is_ok());
    }

    #[test]
    fn non_spendable_candidates_never_selected() {
        let mut cands = candidates(&[5 * COIN]);
        cands[0].spendable = false;
        assert!(select(&cands, COIN, &tier(), &mut rng()).is_err());
    }

    #[test]
    fn conservation_of_selection_total() {
        let cands = candidates(&[7, 13, 23, 41, 89, 151, 277, 512, 1024]);
        for target in [20, 100, 500, 1000] {
            if let Ok(sel) = select(&cands, target, &tier(), &mut rng()) {
                let sum: u64 = sel.coins.iter().map(|c| c.value).sum();
                assert_eq!(sum, sel.total);
                assert!(sel.total >= target);
            }
        }
    }
}
