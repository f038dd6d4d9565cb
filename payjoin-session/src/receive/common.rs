//! Proposal construction shared by the receiver typestates.
//!
//! These types carry the PSBTs between the checks on the original and the finalized proposal.
//! The session layer in [`super::v2`] wraps each of them with its session context.

use std::cmp::{max, min};

use bitcoin::psbt::Psbt;
use bitcoin::secp256k1::rand::seq::SliceRandom;
use bitcoin::secp256k1::rand::{self, Rng};
use bitcoin::{Amount, FeeRate, Script, TxIn, TxOut, Weight};
use serde::{Deserialize, Serialize};

use super::error::{
    InputContributionError, InternalInputContributionError, InternalOutputSubstitutionError,
    InternalPayloadError, InternalSelectionError, OutputSubstitutionError, SelectionError,
};
use super::optional_parameters::Params;
use super::{OriginalPayload, PsbtContext};
use crate::output_substitution::OutputSubstitution;
use crate::psbt::{InputPair, PsbtExt};

/// The original PSBT with the receiver outputs identified.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WantsOutputs {
    pub(crate) original_psbt: Psbt,
    pub(crate) payjoin_psbt: Psbt,
    pub(crate) params: Params,
    pub(crate) change_vout: usize,
    pub(crate) owned_vouts: Vec<usize>,
}

impl WantsOutputs {
    /// The first of `owned_vouts` becomes the drain output.
    pub(crate) fn new(original: OriginalPayload, owned_vouts: Vec<usize>) -> Self {
        Self {
            original_psbt: original.psbt.clone(),
            payjoin_psbt: original.psbt,
            params: original.params,
            change_vout: owned_vouts.first().copied().unwrap_or_default(),
            owned_vouts,
        }
    }

    pub fn output_substitution(&self) -> OutputSubstitution { self.params.output_substitution }

    pub(crate) fn substitute_receiver_script(
        self,
        output_script: &Script,
    ) -> Result<Self, OutputSubstitutionError> {
        let output_value = self.original_psbt.unsigned_tx.output[self.change_vout].value;
        let outputs = [TxOut { value: output_value, script_pubkey: output_script.into() }];
        self.replace_receiver_outputs(outputs, output_script)
    }

    pub(crate) fn replace_receiver_outputs(
        self,
        replacement_outputs: impl IntoIterator<Item = TxOut>,
        drain_script: &Script,
    ) -> Result<Self, OutputSubstitutionError> {
        let mut payjoin_psbt = self.original_psbt.clone();
        let mut outputs = vec![];
        let mut replacement_outputs: Vec<TxOut> = replacement_outputs.into_iter().collect();
        let mut rng = rand::thread_rng();
        // Receiver outputs are substituted in place so sender outputs keep their positions
        for (i, original_output) in self.original_psbt.unsigned_tx.output.iter().enumerate() {
            if !self.owned_vouts.contains(&i) {
                outputs.push(original_output.clone());
                continue;
            }
            if replacement_outputs.is_empty() {
                return Err(InternalOutputSubstitutionError::NotEnoughOutputs.into());
            }
            match replacement_outputs
                .iter()
                .position(|txo| txo.script_pubkey == original_output.script_pubkey)
            {
                Some(pos) => {
                    let txo = replacement_outputs.swap_remove(pos);
                    if self.output_substitution() == OutputSubstitution::Disabled
                        && txo.value < original_output.value
                    {
                        return Err(
                            InternalOutputSubstitutionError::DecreasedValueWhenDisabled.into()
                        );
                    }
                    outputs.push(txo);
                }
                None => {
                    if self.output_substitution() == OutputSubstitution::Disabled {
                        return Err(
                            InternalOutputSubstitutionError::ScriptPubKeyChangedWhenDisabled.into()
                        );
                    }
                    let index = rng.gen_range(0..replacement_outputs.len());
                    outputs.push(replacement_outputs.swap_remove(index));
                }
            }
        }
        interleave_shuffle(&mut outputs, &mut replacement_outputs, &mut rng);
        let change_vout = outputs
            .iter()
            .position(|txo| txo.script_pubkey == *drain_script)
            .ok_or(InternalOutputSubstitutionError::InvalidDrainScript)?;
        payjoin_psbt.outputs = vec![Default::default(); outputs.len()];
        payjoin_psbt.unsigned_tx.output = outputs;
        tracing::debug!("receiver outputs replaced, drain output at index {change_vout}");
        Ok(Self {
            original_psbt: self.original_psbt,
            payjoin_psbt,
            params: self.params,
            change_vout,
            owned_vouts: self.owned_vouts,
        })
    }

    pub(crate) fn commit_outputs(self) -> WantsInputs {
        let committed_drain = self.payjoin_psbt.unsigned_tx.output[self.change_vout].value;
        let owed_by_receiver = added_output_value(&self.original_psbt, &self.payjoin_psbt);
        tracing::debug!("outputs committed, receiver inputs owe {owed_by_receiver}");
        WantsInputs {
            original_psbt: self.original_psbt,
            payjoin_psbt: self.payjoin_psbt,
            params: self.params,
            change_vout: self.change_vout,
            receiver_inputs: vec![],
            committed_drain,
            owed_by_receiver,
        }
    }
}

fn total_value(outputs: &[TxOut]) -> Option<Amount> {
    outputs.iter().try_fold(Amount::ZERO, |total, txo| total.checked_add(txo.value))
}

/// What the receiver's outputs in `payjoin` add on top of `original`.
///
/// Outputs worth more than the money supply can never be funded, so they owe all of it.
fn added_output_value(original: &Psbt, payjoin: &Psbt) -> Amount {
    match (total_value(&original.unsigned_tx.output), total_value(&payjoin.unsigned_tx.output)) {
        (Some(original), Some(payjoin)) if payjoin <= Amount::MAX_MONEY =>
            payjoin.checked_sub(original).unwrap_or(Amount::ZERO),
        _ => Amount::MAX_MONEY,
    }
}

/// Shuffles `new`, then merges it into `original` at random positions.
///
/// Elements of `original` keep their relative order.
fn interleave_shuffle<T: Clone, R: rand::Rng>(original: &mut Vec<T>, new: &mut [T], rng: &mut R) {
    new.shuffle(rng);
    let mut kept = std::mem::take(original).into_iter().peekable();
    let mut added = new.iter().cloned().peekable();
    loop {
        let from_kept = match (kept.peek(), added.peek()) {
            (None, None) => break,
            (Some(_), Some(_)) => rng.gen_bool(0.5),
            (left, _) => left.is_some(),
        };
        original.extend(if from_kept { kept.next() } else { added.next() });
    }
}

/// The proposal with its outputs committed, open to receiver inputs.
///
/// `committed_drain` and `owed_by_receiver` are fixed at commit time, so the drain output is
/// always recomputed from the committed outputs and every input contributed so far.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WantsInputs {
    pub(crate) original_psbt: Psbt,
    pub(crate) payjoin_psbt: Psbt,
    pub(crate) params: Params,
    pub(crate) change_vout: usize,
    pub(crate) receiver_inputs: Vec<InputPair>,
    /// Drain output value when the outputs were committed
    pub(crate) committed_drain: Amount,
    /// Value receiver inputs must cover before any of it reaches the drain output
    pub(crate) owed_by_receiver: Amount,
}

impl WantsInputs {
    pub(crate) fn try_preserving_privacy(
        &self,
        candidate_inputs: impl IntoIterator<Item = InputPair>,
    ) -> Result<InputPair, SelectionError> {
        let candidate_inputs: Vec<InputPair> = candidate_inputs.into_iter().collect();
        self.avoid_uih(candidate_inputs.iter().cloned())
            .or_else(|_| self.select_first_candidate(candidate_inputs))
    }

    /// The first candidate that keeps the smallest input above the smallest output once the
    /// drain output has grown by the candidate's value.
    ///
    /// Such a transaction no longer fits the "unnecessary input" heuristic UIH2 from
    /// [Ghesmati et al. (2022)](https://eprint.iacr.org/2022/589). Only 2-output transactions
    /// are supported.
    pub(crate) fn avoid_uih(
        &self,
        candidate_inputs: impl IntoIterator<Item = InputPair>,
    ) -> Result<InputPair, SelectionError> {
        let outputs = &self.payjoin_psbt.unsigned_tx.output;
        if outputs.len() != 2 {
            return Err(InternalSelectionError::UnsupportedOutputLength.into());
        }
        let smallest_output =
            outputs.iter().map(|txo| txo.value).min().unwrap_or(Amount::MAX_MONEY);
        let smallest_input = self
            .payjoin_psbt
            .input_pairs()
            .filter_map(|input| input.previous_txout().ok().map(|txo| txo.value))
            .min()
            .unwrap_or(Amount::MAX_MONEY);
        let drain = outputs[self.change_vout].value;

        candidate_inputs
            .into_iter()
            .find(|candidate| {
                let value = candidate.value();
                let grown_drain = drain.checked_add(value).unwrap_or(Amount::MAX);
                // the smallest output now looks like the sender's change
                min(smallest_input, value) > min(smallest_output, grown_drain)
            })
            .ok_or_else(|| InternalSelectionError::NotFound.into())
    }

    fn select_first_candidate(
        &self,
        candidate_inputs: impl IntoIterator<Item = InputPair>,
    ) -> Result<InputPair, SelectionError> {
        candidate_inputs.into_iter().next().ok_or_else(|| InternalSelectionError::Empty.into())
    }

    /// Add `inputs` at random positions, after any contributed earlier.
    ///
    /// The drain output becomes its committed value plus everything the receiver contributed,
    /// less what the receiver owes for outputs it added. The total so far must cover that debt.
    pub(crate) fn contribute_inputs(
        self,
        inputs: impl IntoIterator<Item = InputPair>,
    ) -> Result<WantsInputs, InputContributionError> {
        let inputs: Vec<InputPair> = inputs.into_iter().collect();
        let mut spent: Vec<bitcoin::OutPoint> =
            self.payjoin_psbt.unsigned_tx.input.iter().map(|txin| txin.previous_output).collect();
        for outpoint in inputs.iter().map(InputPair::outpoint) {
            if spent.contains(&outpoint) {
                return Err(InternalInputContributionError::DuplicateInput(outpoint).into());
            }
            spent.push(outpoint);
        }

        let mut receiver_inputs = self.receiver_inputs;
        receiver_inputs.extend(inputs.iter().cloned());
        let contributed = receiver_inputs
            .iter()
            .try_fold(Amount::ZERO, |total, input| total.checked_add(input.value()))
            .filter(|total| *total <= Amount::MAX_MONEY)
            .ok_or(InternalInputContributionError::ValueTooHigh)?;
        let to_drain = contributed
            .checked_sub(self.owed_by_receiver)
            .ok_or(InternalInputContributionError::ValueTooLow)?;
        let drain_value = self
            .committed_drain
            .checked_add(to_drain)
            .filter(|value| *value <= Amount::MAX_MONEY)
            .ok_or(InternalInputContributionError::ValueTooHigh)?;

        // A proposal must not mix sequence numbers
        let sequence = self
            .original_psbt
            .unsigned_tx
            .input
            .first()
            .map(|txin| txin.sequence)
            .unwrap_or_default();
        let mut payjoin_psbt = self.payjoin_psbt;
        let mut rng = rand::thread_rng();
        for input in inputs {
            let index = rng.gen_range(0..=payjoin_psbt.unsigned_tx.input.len());
            payjoin_psbt.unsigned_tx.input.insert(index, TxIn { sequence, ..input.txin });
            payjoin_psbt.inputs.insert(index, input.psbtin);
        }
        payjoin_psbt.unsigned_tx.output[self.change_vout].value = drain_value;
        tracing::debug!(
            "{} receiver inputs worth {contributed}, drain output now {drain_value}",
            receiver_inputs.len()
        );

        Ok(WantsInputs { payjoin_psbt, receiver_inputs, ..self })
    }

    pub(crate) fn commit_inputs(self) -> WantsFeeRange {
        WantsFeeRange {
            original_psbt: self.original_psbt,
            payjoin_psbt: self.payjoin_psbt,
            params: self.params,
            change_vout: self.change_vout,
            receiver_inputs: self.receiver_inputs,
        }
    }
}

/// The proposal with all contributions committed, waiting for fees to be charged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WantsFeeRange {
    pub(crate) original_psbt: Psbt,
    pub(crate) payjoin_psbt: Psbt,
    pub(crate) params: Params,
    pub(crate) change_vout: usize,
    pub(crate) receiver_inputs: Vec<InputPair>,
}

impl WantsFeeRange {
    /// Charge the weight the receiver added at the minimum fee rate.
    ///
    /// The sender's offered contribution pays for receiver input weight first. The drain output
    /// pays the remainder and all added output weight, and that share may not exceed the added
    /// weight priced at the maximum rate.
    pub(crate) fn apply_fee(
        &mut self,
        min_fee_rate: Option<FeeRate>,
        max_effective_fee_rate: Option<FeeRate>,
    ) -> Result<&Psbt, InternalPayloadError> {
        let floor = max(min_fee_rate.unwrap_or(FeeRate::BROADCAST_MIN), self.params.min_fee_rate);
        let ceiling = max_effective_fee_rate.unwrap_or(floor);
        tracing::debug!("fee range: {floor} ..= {ceiling}");

        let input_weight = self.additional_input_weight();
        let output_weight = self.additional_output_weight();
        let added_weight = input_weight + output_weight;
        let unpriceable = || InternalPayloadError::FeeOverflow(added_weight, floor);
        let input_fee = floor.checked_mul_by_weight(input_weight).ok_or_else(unpriceable)?;
        let output_fee = floor.checked_mul_by_weight(output_weight).ok_or_else(unpriceable)?;

        let sender_share = self.sender_fee_share(input_fee);
        let receiver_fee = (input_fee - sender_share.map_or(Amount::ZERO, |(_, share)| share))
            .checked_add(output_fee)
            .ok_or_else(unpriceable)?;
        tracing::trace!("fee for {added_weight}: sender {sender_share:?}, receiver {receiver_fee}");

        let budget = ceiling.checked_mul_by_weight(added_weight).unwrap_or(Amount::MAX);
        if receiver_fee > budget {
            let needed = crate::psbt::fee_rate(receiver_fee, added_weight).unwrap_or(FeeRate::MAX);
            return Err(InternalPayloadError::FeeTooHigh(needed, ceiling));
        }

        let outputs = &mut self.payjoin_psbt.unsigned_tx.output;
        if let Some((vout, share)) = sender_share {
            outputs[vout].value -= share;
        }
        let drain = &mut outputs[self.change_vout];
        drain.value = drain.value.checked_sub(receiver_fee).ok_or(
            InternalPayloadError::DrainOutputTooSmall { fee: receiver_fee, available: drain.value },
        )?;
        Ok(&self.payjoin_psbt)
    }

    /// The sender's output in the proposal and what it pays towards `input_fee`.
    fn sender_fee_share(&self, input_fee: Amount) -> Option<(usize, Amount)> {
        let (max_contribution, original_vout) = self.params.additional_fee_contribution?;
        let script = &self.original_psbt.unsigned_tx.output.get(original_vout)?.script_pubkey;
        // Substitution may have moved the sender's output
        let Some(vout) =
            self.payjoin_psbt.unsigned_tx.output.iter().position(|txo| txo.script_pubkey == *script)
        else {
            tracing::warn!("sender fee output is missing from the proposal");
            return None;
        };
        let available = self.payjoin_psbt.unsigned_tx.output[vout].value;
        Some((vout, input_fee.min(max_contribution).min(available)))
    }

    pub(crate) fn additional_input_weight(&self) -> Weight {
        self.receiver_inputs.iter().map(InputPair::expected_weight).sum()
    }

    fn additional_output_weight(&self) -> Weight {
        let weight_of =
            |psbt: &Psbt| -> Weight { psbt.unsigned_tx.output.iter().map(TxOut::weight).sum() };
        let added = weight_of(&self.payjoin_psbt).checked_sub(weight_of(&self.original_psbt));
        added.unwrap_or(Weight::ZERO)
    }

    pub(crate) fn apply_fee_range(
        mut self,
        min_fee_rate: Option<FeeRate>,
        max_effective_fee_rate: Option<FeeRate>,
    ) -> Result<PsbtContext, InternalPayloadError> {
        let psbt = self.apply_fee(min_fee_rate, max_effective_fee_rate)?.clone();
        Ok(PsbtContext { original_psbt: self.original_psbt, payjoin_psbt: psbt })
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use bitcoin::key::rand::rngs::StdRng;
    use bitcoin::key::rand::SeedableRng;
    use payjoin_test_utils::RECEIVER_INPUT_CONTRIBUTION;

    use super::*;
    use crate::receive::tests::original_from_test_vector;
    use crate::receive::{PayloadError, RejectionKind};

    fn receiver_input() -> InputPair {
        let proposal_psbt = Psbt::from_str(RECEIVER_INPUT_CONTRIBUTION).unwrap();
        InputPair::new(
            proposal_psbt.unsigned_tx.input[1].clone(),
            proposal_psbt.inputs[1].clone(),
            None,
        )
        .unwrap()
    }

    /// The same contribution, spending another outpoint.
    fn receiver_input_spending(vout: u32) -> InputPair {
        let input = receiver_input();
        let txin = TxIn {
            previous_output: bitcoin::OutPoint { vout, ..input.outpoint() },
            ..input.txin.clone()
        };
        InputPair::new(txin, input.psbtin.clone(), None).expect("same input, other vout")
    }

    fn drain_value(wants_inputs: &WantsInputs) -> Amount {
        wants_inputs.payjoin_psbt.unsigned_tx.output[wants_inputs.change_vout].value
    }

    #[test]
    fn contributions_accumulate_across_calls() {
        let (a, b) = (receiver_input(), receiver_input_spending(7));
        let wants_inputs =
            || WantsOutputs::new(original_from_test_vector(), vec![1]).commit_outputs();
        let committed_drain = drain_value(&wants_inputs());

        let at_once =
            wants_inputs().contribute_inputs([a.clone(), b.clone()]).expect("inputs are new");
        let one_by_one = wants_inputs()
            .contribute_inputs([a.clone()])
            .and_then(|wants_inputs| wants_inputs.contribute_inputs([b.clone()]))
            .expect("inputs are new");

        assert_eq!(drain_value(&at_once), committed_drain + a.value() + b.value());
        assert_eq!(drain_value(&one_by_one), drain_value(&at_once));
        assert_eq!(one_by_one.receiver_inputs, vec![a, b]);
        assert_eq!(one_by_one.payjoin_psbt.unsigned_tx.input.len(), 3);
    }

    #[test]
    fn added_outputs_are_funded_once() {
        let (a, b) = (receiver_input(), receiver_input_spending(7));
        let wants_outputs = WantsOutputs::new(original_from_test_vector(), vec![1]);
        let receiver_output = wants_outputs.original_psbt.unsigned_tx.output[1].clone();
        let drain_script = receiver_output.script_pubkey.clone();
        let extra = TxOut {
            value: Amount::from_sat(1_000_000),
            script_pubkey: bitcoin::ScriptBuf::from_bytes(vec![0x51]),
        };
        let wants_inputs = wants_outputs
            .replace_receiver_outputs([receiver_output.clone(), extra.clone()], &drain_script)
            .expect("drain output is present")
            .commit_outputs();
        assert_eq!(wants_inputs.owed_by_receiver, extra.value);

        let wants_inputs = wants_inputs.contribute_inputs([a.clone()]).expect("a covers the debt");
        assert_eq!(drain_value(&wants_inputs), receiver_output.value + a.value() - extra.value);
        let wants_inputs = wants_inputs.contribute_inputs([b.clone()]).expect("b is new");
        assert_eq!(
            drain_value(&wants_inputs),
            receiver_output.value + a.value() + b.value() - extra.value
        );
    }

    #[test]
    fn contributions_must_cover_added_outputs() {
        let wants_outputs = WantsOutputs::new(original_from_test_vector(), vec![1]);
        let receiver_output = wants_outputs.original_psbt.unsigned_tx.output[1].clone();
        let drain_script = receiver_output.script_pubkey.clone();
        let extra = TxOut { value: Amount::ONE_BTC, script_pubkey: Script::new().into() };
        let wants_inputs = wants_outputs
            .replace_receiver_outputs([receiver_output, extra], &drain_script)
            .expect("drain output is present")
            .commit_outputs();

        assert_eq!(
            wants_inputs.contribute_inputs([receiver_input()]).unwrap_err(),
            InputContributionError::from(InternalInputContributionError::ValueTooLow)
        );
    }

    #[test]
    fn unpriceable_minimum_fee_rate_is_refused() {
        let mut original = original_from_test_vector();
        original.params.min_fee_rate = FeeRate::from_sat_per_kwu(u64::MAX);
        let mut wants_fee_range = WantsOutputs::new(original, vec![1])
            .commit_outputs()
            .contribute_inputs([receiver_input()])
            .expect("input is new")
            .commit_inputs();

        let result = wants_fee_range.apply_fee(None, Some(FeeRate::from_sat_per_vb_unchecked(10)));
        let error = result.expect_err("no fee can be computed");
        assert!(matches!(error, InternalPayloadError::FeeOverflow(..)));
        assert_eq!(PayloadError(error).kind(), RejectionKind::FeeRangeUnsatisfiable);
    }

    #[test]
    fn empty_candidates_inputs() {
        let original = original_from_test_vector();
        let wants_inputs = WantsOutputs::new(original, vec![0]).commit_outputs();
        let result = wants_inputs.try_preserving_privacy(vec![]);
        assert_eq!(result.unwrap_err(), SelectionError::from(InternalSelectionError::Empty));
    }

    #[test]
    fn disabled_output_substitution_only_allows_increases() {
        let mut original = original_from_test_vector();
        original.params.output_substitution = OutputSubstitution::Disabled;
        let wants_outputs = WantsOutputs::new(original, vec![0]);
        let original_output =
            wants_outputs.original_psbt.unsigned_tx.output[wants_outputs.change_vout].clone();
        let script_pubkey = original_output.script_pubkey.clone();
        let with_value = |value| vec![TxOut { value, script_pubkey: script_pubkey.clone() }];

        let unchanged = wants_outputs
            .clone()
            .replace_receiver_outputs(with_value(original_output.value), &script_pubkey);
        assert!(unchanged.is_ok(), "keeping the receiver output is always allowed");

        let increased = wants_outputs.clone().replace_receiver_outputs(
            with_value(original_output.value + Amount::ONE_SAT),
            &script_pubkey,
        );
        assert!(increased.is_ok(), "increasing the receiver output is always allowed");

        let decreased = wants_outputs.clone().replace_receiver_outputs(
            with_value(original_output.value - Amount::ONE_SAT),
            &script_pubkey,
        );
        assert_eq!(
            decreased.unwrap_err(),
            OutputSubstitutionError::from(
                InternalOutputSubstitutionError::DecreasedValueWhenDisabled
            )
        );

        let substituted = wants_outputs.substitute_receiver_script(Script::new());
        assert_eq!(
            substituted.unwrap_err(),
            OutputSubstitutionError::from(
                InternalOutputSubstitutionError::ScriptPubKeyChangedWhenDisabled
            )
        );
    }

    #[test]
    fn drain_script_must_be_a_replacement_output() {
        let wants_outputs = WantsOutputs::new(original_from_test_vector(), vec![0]);
        let outputs = vec![TxOut { value: Amount::ONE_BTC, script_pubkey: Script::new().into() }];
        let unknown_drain = bitcoin::ScriptBuf::from_bytes(vec![0x6a, 0x01, 0x01]);
        assert_eq!(
            wants_outputs.replace_receiver_outputs(outputs, &unknown_drain).unwrap_err(),
            OutputSubstitutionError::from(InternalOutputSubstitutionError::InvalidDrainScript)
        );
    }

    #[test]
    fn avoid_uih_needs_two_outputs() {
        let original = original_from_test_vector();
        let input = receiver_input();
        let mut payjoin = WantsOutputs::new(original, vec![0])
            .commit_outputs()
            .contribute_inputs([input.clone()])
            .expect("input is new");

        payjoin.payjoin_psbt.unsigned_tx.output.pop();
        payjoin.payjoin_psbt.outputs.pop();
        assert_eq!(
            payjoin.avoid_uih([input]).unwrap_err(),
            SelectionError::from(InternalSelectionError::UnsupportedOutputLength)
        );
    }

    #[test]
    fn contributed_inputs_take_original_sequence() {
        let original = original_from_test_vector();
        let sequence = original.psbt.unsigned_tx.input[0].sequence;
        let input = receiver_input();
        let outpoint = input.outpoint();
        let wants_inputs = WantsOutputs::new(original, vec![0])
            .commit_outputs()
            .contribute_inputs([input.clone()])
            .expect("input is new");

        let txin = wants_inputs
            .payjoin_psbt
            .unsigned_tx
            .input
            .iter()
            .find(|txin| txin.previous_output == outpoint)
            .expect("contributed input is present");
        assert_eq!(txin.sequence, sequence);
        assert_eq!(
            wants_inputs.payjoin_psbt.unsigned_tx.output[0].value,
            wants_inputs.original_psbt.unsigned_tx.output[0].value + input.value()
        );

        assert_eq!(
            wants_inputs.contribute_inputs([input]).unwrap_err(),
            InputContributionError::from(InternalInputContributionError::DuplicateInput(outpoint))
        );
    }

    #[test]
    fn sender_original_inputs_cannot_be_contributed() {
        let original = original_from_test_vector();
        let sender_input = InputPair::new(
            original.psbt.unsigned_tx.input[0].clone(),
            original.psbt.inputs[0].clone(),
            None,
        )
        .expect("original input is valid");
        let outpoint = sender_input.outpoint();
        let result =
            WantsOutputs::new(original, vec![0]).commit_outputs().contribute_inputs([sender_input]);
        assert_eq!(
            result.unwrap_err(),
            InputContributionError::from(InternalInputContributionError::DuplicateInput(outpoint))
        );
    }

    #[test]
    fn fee_is_charged_to_sender_then_receiver() {
        let original = original_from_test_vector();
        let mut wants_fee_range = WantsOutputs::new(original, vec![1])
            .commit_outputs()
            .contribute_inputs([receiver_input()])
            .expect("input is new")
            .commit_inputs();
        let before = wants_fee_range.payjoin_psbt.unsigned_tx.output.clone();
        let input_weight = wants_fee_range.additional_input_weight();

        let fee_rate = FeeRate::from_sat_per_vb_unchecked(2);
        let psbt = wants_fee_range.apply_fee(Some(fee_rate), Some(fee_rate)).unwrap().clone();

        let additional_fee = input_weight * fee_rate;
        let sender_share = min(Amount::from_sat(182), additional_fee);
        assert_eq!(psbt.unsigned_tx.output[0].value, before[0].value - sender_share);
        assert_eq!(
            psbt.unsigned_tx.output[1].value,
            before[1].value - (additional_fee - sender_share)
        );
    }

    #[test]
    fn fee_above_maximum_is_refused() {
        let mut original = original_from_test_vector();
        original.params.additional_fee_contribution = None;
        let mut wants_fee_range = WantsOutputs::new(original, vec![1])
            .commit_outputs()
            .contribute_inputs([receiver_input()])
            .expect("input is new")
            .commit_inputs();

        let result = wants_fee_range
            .apply_fee(Some(FeeRate::from_sat_per_vb_unchecked(10)), Some(FeeRate::ZERO));
        assert!(matches!(
            result,
            Err(InternalPayloadError::FeeTooHigh(_, max)) if max == FeeRate::ZERO
        ));
    }

    #[test]
    fn drain_output_cannot_go_negative() {
        let mut original = original_from_test_vector();
        original.params.additional_fee_contribution = None;
        let mut wants_fee_range = WantsOutputs::new(original, vec![1])
            .commit_outputs()
            .contribute_inputs([receiver_input()])
            .expect("input is new")
            .commit_inputs();
        wants_fee_range.payjoin_psbt.unsigned_tx.output[1].value = Amount::ONE_SAT;

        let fee_rate = FeeRate::from_sat_per_vb_unchecked(1);
        let result = wants_fee_range.apply_fee(Some(fee_rate), Some(fee_rate));
        assert!(matches!(result, Err(InternalPayloadError::DrainOutputTooSmall { .. })));
    }

    #[test]
    fn no_contribution_costs_nothing() {
        let original = original_from_test_vector();
        let mut wants_fee_range =
            WantsOutputs::new(original, vec![1]).commit_outputs().commit_inputs();
        let original_psbt = wants_fee_range.original_psbt.clone();
        let psbt = wants_fee_range.apply_fee(None, None).expect("nothing to pay for");
        assert_eq!(psbt.unsigned_tx, original_psbt.unsigned_tx);
    }

    #[test]
    fn interleaving_keeps_existing_order() {
        let mut layouts = std::collections::BTreeSet::new();
        for seed in 0..16 {
            let mut rng = StdRng::seed_from_u64(seed);
            let (mut kept, mut added) = (vec![1, 2, 3], vec![4, 5, 6]);
            interleave_shuffle(&mut kept, &mut added, &mut rng);
            let existing: Vec<_> = kept.iter().copied().filter(|n| *n <= 3).collect();
            assert_eq!(existing, vec![1, 2, 3]);
            let mut sorted = kept.clone();
            sorted.sort_unstable();
            assert_eq!(sorted, vec![1, 2, 3, 4, 5, 6]);
            layouts.insert(kept);
        }
        assert!(layouts.len() > 1, "positions are random");
    }
}
