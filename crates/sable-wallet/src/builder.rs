//! Transaction assembly: fee/size fixed point over coin selection.
//!
//! Builds a payment in a loop: lay out recipient outputs (optionally
//! paying fee out of flagged recipients), select coins for the running fee
//! budget, place or fold change, measure the serialized size with
//! placeholder witnesses, and compare the fee actually paid against what
//! the rate demands for that size. The budget only ever grows, so the loop
//! converges; on the way out the excess is refunded into change or an
//! uneconomic change output is dropped. Nothing here mutates the ledger —
//! side effects wait for an explicit commit.

use std::collections::BTreeSet;
use std::sync::Arc;

use rand::Rng;
use tracing::debug;

use sable_core::constants::{
    MAX_MONEY, MAX_TX_SIZE, MIN_FINAL_CHANGE, PLACEHOLDER_WITNESS_LEN, SEQUENCE_NO_RBF,
    SEQUENCE_RBF,
};
use sable_core::fee::dust_threshold;
use sable_core::traits::{ChainOracle, FeeEstimator, KeyProvider, MempoolOracle, Signer};
use sable_core::types::{Destination, OutPoint, Transaction, TxInput, TxOutput};

use crate::coin_selection::{Selection, SelectionPolicy, UtxoCandidate, select};
use crate::error::WalletError;
use crate::ledger::LedgerIndex;

/// One payment the caller wants to make.
#[derive(Debug, Clone)]
pub struct Recipient {
    /// Where the payment goes.
    pub destination: Destination,
    /// Requested amount in motes.
    pub amount: u64,
    /// Pay this recipient's share of the fee out of its own amount.
    pub subtract_fee: bool,
}

/// Caller knobs for one build attempt.
#[derive(Clone)]
pub struct CoinControl {
    /// Outpoints that must be spent.
    pub selected: BTreeSet<OutPoint>,
    /// Whether automatic selection may add inputs beyond `selected`.
    pub allow_other_inputs: bool,
    /// Send change here instead of reserving a fresh key.
    pub change_destination: Option<Destination>,
    /// Fixed change insertion position; random when unset.
    pub change_position: Option<usize>,
    /// Confirmation target handed to the fee estimator.
    pub confirmation_target: u32,
    /// Signal opt-in replaceability on every input.
    pub signal_rbf: bool,
    /// Extra predicate narrowing the candidate scan.
    pub candidate_filter: Option<Arc<dyn Fn(&UtxoCandidate) -> bool + Send + Sync>>,
}

impl Default for CoinControl {
    fn default() -> Self {
        Self {
            selected: BTreeSet::new(),
            allow_other_inputs: true,
            change_destination: None,
            change_position: None,
            confirmation_target: 6,
            signal_rbf: false,
            candidate_filter: None,
        }
    }
}

impl std::fmt::Debug for CoinControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoinControl")
            .field("selected", &self.selected.len())
            .field("allow_other_inputs", &self.allow_other_inputs)
            .field("change_destination", &self.change_destination)
            .field("change_position", &self.change_position)
            .field("confirmation_target", &self.confirmation_target)
            .field("signal_rbf", &self.signal_rbf)
            .field("filtered", &self.candidate_filter.is_some())
            .finish()
    }
}

/// A finished, signed, fee-correct transaction.
#[derive(Debug, Clone)]
pub struct BuiltTransaction {
    /// The signed transaction.
    pub tx: Transaction,
    /// Fee paid: input value minus output value, exactly.
    pub fee: u64,
    /// Index of the change output, if one was created.
    pub change_position: Option<usize>,
    /// Key reservation backing the change output, kept on commit.
    pub reserved_key: Option<u64>,
}

/// Build a signed transaction paying `recipients`.
///
/// Reads the ledger but never writes it; the change key reservation is the
/// only external side effect, released again on failure.
#[allow(clippy::too_many_arguments)]
pub fn build<R: Rng>(
    ledger: &LedgerIndex,
    chain: &dyn ChainOracle,
    mempool: &dyn MempoolOracle,
    fees: &dyn FeeEstimator,
    signer: &dyn Signer,
    keys: &dyn KeyProvider,
    recipients: &[Recipient],
    control: &CoinControl,
    rng: &mut R,
    now: u64,
) -> Result<BuiltTransaction, WalletError> {
    if recipients.is_empty() {
        return Err(WalletError::InvalidState(
            "transaction requires at least one recipient".into(),
        ));
    }
    let mut total_requested = 0u64;
    for r in recipients {
        if r.amount == 0 || r.amount > MAX_MONEY {
            return Err(WalletError::InvalidAmount(format!(
                "recipient amount {} out of range",
                r.amount
            )));
        }
        total_requested = total_requested
            .checked_add(r.amount)
            .filter(|sum| *sum <= MAX_MONEY)
            .ok_or_else(|| WalletError::InvalidAmount("recipient total above money range".into()))?;
    }

    // The change key stays reserved for the whole attempt so concurrent
    // builds can never share a destination.
    let (reservation, change_dest) = match control.change_destination {
        Some(dest) => (None, dest),
        None => {
            let (id, dest) = keys.reserve_destination()?;
            (Some(id), dest)
        }
    };

    match build_inner(
        ledger, chain, mempool, fees, signer, recipients, control, change_dest, total_requested,
        rng, now,
    ) {
        Ok(mut built) => {
            built.reserved_key = reservation;
            Ok(built)
        }
        Err(e) => {
            if let Some(id) = reservation {
                keys.release(id);
            }
            Err(e)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn build_inner<R: Rng>(
    ledger: &LedgerIndex,
    chain: &dyn ChainOracle,
    mempool: &dyn MempoolOracle,
    fees: &dyn FeeEstimator,
    signer: &dyn Signer,
    recipients: &[Recipient],
    control: &CoinControl,
    change_dest: Destination,
    total_requested: u64,
    rng: &mut R,
    now: u64,
) -> Result<BuiltTransaction, WalletError> {
    if let Some(index) = control.change_position {
        if index > recipients.len() {
            return Err(WalletError::ChangeIndexOutOfRange {
                index,
                len: recipients.len(),
            });
        }
    }

    let filter = control
        .candidate_filter
        .as_deref()
        .map(|f| f as &dyn Fn(&UtxoCandidate) -> bool);
    let candidates = ledger.spendable_candidates(chain, mempool, now, filter);

    let rate = fees
        .estimate(control.confirmation_target)
        .max(fees.min_relay_rate());
    let min_relay = fees.min_relay_rate();
    let recipient_dust = dust_threshold(min_relay);
    let change_dust = dust_threshold(fees.discard_rate());

    let tip = chain.tip();
    let lock_time = anti_sniping_lock_time(tip.height, rng);
    let sequence = if control.signal_rbf { SEQUENCE_RBF } else { SEQUENCE_NO_RBF };

    let mut tiers = SelectionPolicy::default_tiers();
    for tier in &mut tiers {
        tier.manual = control.selected.clone();
        tier.allow_other_inputs = control.allow_other_inputs;
    }

    let subtract_count = recipients.iter().filter(|r| r.subtract_fee).count() as u64;
    let mut fee_budget = 0u64;

    let (mut tx, fee_paid, change_position, selection) = loop {
        // Recipient outputs, with the current fee budget carved out of
        // fee-subtracting recipients.
        let mut outputs = Vec::with_capacity(recipients.len() + 1);
        let mut first_subtracted = false;
        for r in recipients {
            let mut value = r.amount;
            if r.subtract_fee {
                let mut share = fee_budget / subtract_count;
                if !first_subtracted {
                    share += fee_budget % subtract_count;
                    first_subtracted = true;
                }
                value = value.checked_sub(share).ok_or_else(|| {
                    WalletError::InvalidAmount(format!(
                        "recipient amount {} too small to carry its fee share",
                        r.amount
                    ))
                })?;
            }
            if value < recipient_dust {
                return Err(WalletError::DustOutput { value, threshold: recipient_dust });
            }
            outputs.push(TxOutput { value, destination: r.destination });
        }

        let selection_target = if subtract_count > 0 {
            total_requested
        } else {
            total_requested
                .checked_add(fee_budget)
                .ok_or_else(|| WalletError::InvalidAmount("fee pushes value out of range".into()))?
        };

        let selection = select_across_tiers(&candidates, selection_target, &tiers, rng)?;

        // Surplus beyond the target becomes change, unless it is too small
        // to be worth creating, in which case it rides along as fee.
        let surplus = selection.total - selection_target;
        let mut change_position = None;
        if surplus >= change_dust && surplus > 0 {
            let index = control
                .change_position
                .unwrap_or_else(|| rng.gen_range(0..=outputs.len()));
            outputs.insert(index, TxOutput { value: surplus, destination: change_dest });
            change_position = Some(index);
        }
        let output_total: u64 = outputs.iter().map(|o| o.value).sum();
        let fee_paid = selection.total - output_total;

        let tx = Transaction {
            version: 1,
            inputs: selection
                .coins
                .iter()
                .map(|coin| TxInput {
                    previous_output: coin.outpoint,
                    witness: vec![0u8; PLACEHOLDER_WITNESS_LEN],
                    sequence,
                })
                .collect(),
            outputs,
            lock_time,
        };
        let size = tx.serialized_size()?;
        if size > MAX_TX_SIZE {
            return Err(WalletError::TransactionTooLarge { size, max: MAX_TX_SIZE });
        }
        let required = rate.fee_for(size).max(min_relay.fee_for(size));

        if fee_paid >= required {
            let excess = fee_paid - required;
            if excess > 0 && subtract_count == 0 {
                if let Some(index) = change_position {
                    // Refund the excess into change and pay exactly the
                    // requirement, unless the fatter encoding of the change
                    // value would itself raise the requirement past the fee.
                    let mut tx = tx;
                    tx.outputs[index].value += excess;
                    let grown_size = tx.serialized_size()?;
                    let grown_required =
                        rate.fee_for(grown_size).max(min_relay.fee_for(grown_size));
                    if required >= grown_required {
                        break (tx, required, change_position, selection);
                    }
                    tx.outputs[index].value -= excess;
                    break (tx, fee_paid, change_position, selection);
                }
            }
            // No change output to refund into: the excess stays as fee.
            break (tx, fee_paid, change_position, selection);
        }

        let deficit = required - fee_paid;
        if subtract_count == 0 {
            if let Some(index) = change_position {
                let change_value = tx.outputs[index].value;
                if change_value >= MIN_FINAL_CHANGE + deficit {
                    // Cheaper to shrink the change we already have than to
                    // reselect inputs.
                    let mut tx = tx;
                    tx.outputs[index].value -= deficit;
                    break (tx, required, change_position, selection);
                }
                // Change cannot absorb the deficit. Dropping it shrinks the
                // transaction; if the freed value covers the smaller
                // requirement, finish without reselecting.
                let mut without = tx.clone();
                without.outputs.remove(index);
                let smaller_size = without.serialized_size()?;
                let smaller_required =
                    rate.fee_for(smaller_size).max(min_relay.fee_for(smaller_size));
                let fee_without = fee_paid + change_value;
                if fee_without >= smaller_required {
                    break (without, fee_without, None, selection);
                }
            }
        }

        fee_budget = required;
    };

    if !mempool.within_chain_limits(&tx) {
        return Err(WalletError::MempoolChainTooLong);
    }

    for (index, coin) in selection.coins.iter().enumerate() {
        let prev_out = TxOutput { value: coin.value, destination: coin.destination };
        let witness = signer.sign_input(&tx, index, &prev_out)?;
        tx.inputs[index].witness = witness;
    }
    let final_size = tx.serialized_size()?;
    if final_size > MAX_TX_SIZE {
        return Err(WalletError::TransactionTooLarge { size: final_size, max: MAX_TX_SIZE });
    }

    debug!(
        fee = fee_paid,
        size = final_size,
        inputs = tx.inputs.len(),
        outputs = tx.outputs.len(),
        change = change_position.is_some(),
        "assembled transaction"
    );
    Ok(BuiltTransaction { tx, fee: fee_paid, change_position, reserved_key: None })
}

/// Try each eligibility tier strictest-first; keep the most informative
/// shortfall if every tier fails.
fn select_across_tiers<R: Rng>(
    candidates: &[UtxoCandidate],
    target: u64,
    tiers: &[SelectionPolicy],
    rng: &mut R,
) -> Result<Selection, WalletError> {
    let mut shortfall = None;
    for tier in tiers {
        match select(candidates, target, tier, rng) {
            Ok(selection) => return Ok(selection),
            Err(e @ WalletError::InsufficientFunds { .. }) => shortfall = Some(e),
            Err(e) => return Err(e),
        }
    }
    Err(shortfall.unwrap_or(WalletError::InsufficientFunds { have: 0, need: target }))
}

/// Lock time discouraging fee sniping: the next block must be the earliest
/// inclusion, occasionally backdated so the pattern is not a fingerprint.
fn anti_sniping_lock_time<R: Rng>(tip_height: u64, rng: &mut R) -> u64 {
    let mut lock = tip_height;
    if rng.gen_range(0..10) == 0 {
        lock = lock.saturating_sub(rng.gen_range(0..100));
    }
    lock
}
