//! Send Payjoin
//!
//! The sender side of BIP 77. A [`v2::SenderBuilder`] turns a funded, signed original PSBT and a
//! payjoin URI into a persisted session. The original is posted to the receiver's mailbox, and
//! the receiver's proposal is polled from the sender's own mailbox and checked against the
//! original before it is handed back for signing.
//!
//! OHTTP Privacy Warning
//! Encapsulated requests whether GET or POST **must not be retried or reused**.
//! Retransmitting the same ciphertext breaks the unlinkability OHTTP provides, since the relay
//! could correlate requests by comparing them.

use bitcoin::psbt::Psbt;
use bitcoin::{AddressType, Amount, FeeRate, Script, ScriptBuf, TxOut, Weight};
pub use error::{BuildSenderError, ResponseError, ValidationError, WellKnownError};
pub(crate) use error::{InternalBuildSenderError, InternalProposalError, InternalValidationError};
use serde::{Deserialize, Serialize};

use crate::output_substitution::OutputSubstitution;
use crate::psbt::{PsbtExt, NON_WITNESS_INPUT_WEIGHT};
use crate::Version;

mod error;
pub mod v2;

type InternalResult<T> = Result<T, InternalProposalError>;

/// Collects the sender's fee parameters before the original PSBT is checked.
#[derive(Debug, Clone)]
pub(crate) struct PsbtContextBuilder {
    psbt: Psbt,
    payee: ScriptBuf,
    amount: Option<Amount>,
    fee_contribution: Option<(Amount, Option<usize>)>,
    /// Lower the fee contribution to the change value instead of failing.
    clamp_fee_contribution: bool,
    min_fee_rate: FeeRate,
}

impl PsbtContextBuilder {
    pub(crate) fn new(psbt: Psbt, payee: ScriptBuf, amount: Option<Amount>) -> Self {
        Self {
            psbt,
            payee,
            amount,
            fee_contribution: None,
            clamp_fee_contribution: false,
            min_fee_rate: FeeRate::ZERO,
        }
    }

    /// Offer the weight of one more input at `min_fee_rate` out of the change output.
    ///
    /// A sweep, or a transaction without change, offers no contribution.
    pub(crate) fn build_recommended(
        self,
        min_fee_rate: FeeRate,
        output_substitution: OutputSubstitution,
    ) -> Result<PsbtContext, BuildSenderError> {
        let change = self
            .psbt
            .unsigned_tx
            .output
            .iter()
            .enumerate()
            .find(|(_, txo)| txo.script_pubkey != self.payee)
            .map(|(vout, txo)| (vout, txo.value));
        let Some((change_index, change_value)) = change else {
            tracing::debug!("no change output, not offering a fee contribution");
            return self.build_non_incentivizing(min_fee_rate, output_substitution);
        };

        let input_weight = self.recommended_input_weight()?;
        let recommended_fee =
            min_fee_rate.checked_mul_by_weight(input_weight).unwrap_or(Amount::MAX_MONEY);
        let clamp = change_value < recommended_fee;
        if clamp {
            tracing::warn!("change of {change_value} cannot pay the recommended {recommended_fee}");
        }
        self.build_with_additional_fee(
            recommended_fee.min(change_value),
            Some(change_index),
            min_fee_rate,
            clamp,
            output_substitution,
        )
    }

    /// The weight of an input like the sender's, or of the lightest input if they are mixed.
    fn recommended_input_weight(&self) -> Result<Weight, BuildSenderError> {
        let mut input_pairs = self.psbt.input_pairs();
        let first = input_pairs.next().ok_or(InternalBuildSenderError::NoInputs)?;
        let first_type = first.address_type()?;
        for input_pair in input_pairs {
            if input_pair.address_type()? != first_type {
                let lightest =
                    bitcoin::transaction::InputWeightPrediction::P2TR_KEY_DEFAULT_SIGHASH;
                return Ok(lightest.weight() + NON_WITNESS_INPUT_WEIGHT);
            }
        }
        Ok(first.expected_input_weight().map_err(InternalBuildSenderError::InputWeight)?)
    }

    pub(crate) fn build_with_additional_fee(
        mut self,
        max_fee_contribution: Amount,
        change_index: Option<usize>,
        min_fee_rate: FeeRate,
        clamp_fee_contribution: bool,
        output_substitution: OutputSubstitution,
    ) -> Result<PsbtContext, BuildSenderError> {
        self.fee_contribution = Some((max_fee_contribution, change_index));
        self.clamp_fee_contribution = clamp_fee_contribution;
        self.min_fee_rate = min_fee_rate;
        self.build(output_substitution)
    }

    pub(crate) fn build_non_incentivizing(
        mut self,
        min_fee_rate: FeeRate,
        output_substitution: OutputSubstitution,
    ) -> Result<PsbtContext, BuildSenderError> {
        self.fee_contribution = None;
        self.clamp_fee_contribution = false;
        self.min_fee_rate = min_fee_rate;
        self.build(output_substitution)
    }

    fn build(
        self,
        output_substitution: OutputSubstitution,
    ) -> Result<PsbtContext, BuildSenderError> {
        let psbt =
            self.psbt.validate().map_err(InternalBuildSenderError::InconsistentOriginalPsbt)?;
        psbt.validate_input_utxos().map_err(InternalBuildSenderError::InvalidOriginalInput)?;

        check_single_payee(&psbt, &self.payee, self.amount)?;
        let fee_contribution = match self.fee_contribution {
            Some((fee, change_index)) => determine_fee_contribution(
                &psbt,
                &self.payee,
                fee,
                change_index,
                self.clamp_fee_contribution,
            )?,
            None => None,
        };
        tracing::debug!("offering fee contribution {fee_contribution:?}");

        Ok(PsbtContext {
            original_psbt: psbt,
            output_substitution,
            fee_contribution,
            min_fee_rate: self.min_fee_rate,
            payee: self.payee,
        })
    }
}

/// How much of which output the receiver may spend on fees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct AdditionalFeeContribution {
    max_amount: Amount,
    vout: usize,
}

/// The original PSBT and the terms the proposal is checked against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PsbtContext {
    original_psbt: Psbt,
    output_substitution: OutputSubstitution,
    fee_contribution: Option<AdditionalFeeContribution>,
    min_fee_rate: FeeRate,
    payee: ScriptBuf,
}

macro_rules! check_eq {
    ($proposed:expr, $original:expr, $error:ident) => {
        match ($proposed, $original) {
            (proposed, original) if proposed != original =>
                return Err(InternalProposalError::$error { proposed, original }),
            _ => (),
        }
    };
}

fn ensure<T>(condition: bool, error: T) -> Result<(), T> {
    if !condition {
        return Err(error);
    }
    Ok(())
}

impl PsbtContext {
    /// Check the receiver's proposal and restore what the receiver had to strip.
    fn process_proposal(self, mut proposal: Psbt) -> InternalResult<Psbt> {
        self.basic_checks(&proposal)?;
        self.check_inputs(&proposal)?;
        let contributed_fee = self.check_outputs(&proposal)?;
        self.restore_original_utxos(&mut proposal);
        self.restore_original_outputs(&mut proposal);
        self.check_fees(&proposal, contributed_fee)?;
        tracing::debug!("proposal accepted, receiver took {contributed_fee} from the sender");
        Ok(proposal)
    }

    fn basic_checks(&self, proposal: &Psbt) -> InternalResult<()> {
        let original = &self.original_psbt.unsigned_tx;
        check_eq!(proposal.unsigned_tx.version, original.version, VersionsDontMatch);
        check_eq!(proposal.unsigned_tx.lock_time, original.lock_time, LockTimesDontMatch);
        Ok(())
    }

    /// The address type shared by every sender input, if there is one.
    fn uniform_input_type(&self) -> InternalResult<Option<AddressType>> {
        let mut types = self.original_psbt.input_pairs().map(|input| input.address_type());
        let first = types.next().ok_or(InternalProposalError::NoInputs)??;
        for address_type in types {
            if address_type? != first {
                return Ok(None);
            }
        }
        Ok(Some(first))
    }

    fn check_inputs(&self, proposal: &Psbt) -> InternalResult<()> {
        let first_original =
            self.original_psbt.input_pairs().next().ok_or(InternalProposalError::NoInputs)?;
        let original_type = self.uniform_input_type()?;
        let mut original_inputs = self.original_psbt.input_pairs().peekable();

        for proposed in proposal.input_pairs() {
            ensure(
                proposed.psbtin.bip32_derivation.is_empty(),
                InternalProposalError::TxInContainsKeyPaths,
            )?;
            ensure(
                proposed.psbtin.partial_sigs.is_empty(),
                InternalProposalError::ContainsPartialSigs,
            )?;
            match original_inputs.peek() {
                Some(original)
                    if proposed.txin.previous_output == original.txin.previous_output =>
                {
                    check_eq!(
                        proposed.txin.sequence,
                        original.txin.sequence,
                        SenderTxinSequenceChanged
                    );
                    ensure(
                        proposed.psbtin.final_script_sig.is_none(),
                        InternalProposalError::SenderTxinContainsFinalScriptSig,
                    )?;
                    ensure(
                        proposed.psbtin.final_script_witness.is_none(),
                        InternalProposalError::SenderTxinContainsFinalScriptWitness,
                    )?;
                    original_inputs.next();
                }
                // Anything else was contributed by the receiver
                _ => {
                    ensure(
                        proposed.psbtin.final_script_sig.is_some()
                            || proposed.psbtin.final_script_witness.is_some(),
                        InternalProposalError::ReceiverTxinNotFinalized,
                    )?;
                    ensure(
                        proposed.psbtin.witness_utxo.is_some()
                            || proposed.psbtin.non_witness_utxo.is_some(),
                        InternalProposalError::ReceiverTxinMissingUtxoInfo,
                    )?;
                    ensure(
                        proposed.txin.sequence == first_original.txin.sequence,
                        InternalProposalError::MixedSequence,
                    )?;
                    if let Some(original) = original_type {
                        check_eq!(proposed.address_type()?, original, MixedInputTypes);
                    }
                }
            }
        }
        ensure(original_inputs.peek().is_none(), InternalProposalError::MissingOrShuffledInputs)
    }

    /// Returns how much the receiver took from the fee output.
    fn check_outputs(&self, proposal: &Psbt) -> InternalResult<Amount> {
        let mut original_outputs =
            self.original_psbt.unsigned_tx.output.iter().enumerate().peekable();
        let mut contributed_fee = Amount::ZERO;

        for (proposed_txout, proposed_psbtout) in
            proposal.unsigned_tx.output.iter().zip(&proposal.outputs)
        {
            ensure(
                proposed_psbtout.bip32_derivation.is_empty(),
                InternalProposalError::TxOutContainsKeyPaths,
            )?;
            let Some(&(original_index, original_output)) = original_outputs.peek() else {
                // Outputs added by the receiver
                continue;
            };
            let is_fee_output = self.fee_contribution.is_some_and(|fee| fee.vout == original_index);

            if is_fee_output && proposed_txout.script_pubkey == original_output.script_pubkey {
                if proposed_txout.value < original_output.value {
                    contributed_fee = original_output.value - proposed_txout.value;
                    let max_amount = self.fee_contribution.map(|fee| fee.max_amount);
                    ensure(
                        Some(contributed_fee) <= max_amount,
                        InternalProposalError::FeeContributionExceedsMaximum,
                    )?;
                }
                original_outputs.next();
            } else if original_output.script_pubkey == self.payee {
                ensure(
                    self.output_substitution == OutputSubstitution::Enabled
                        || (proposed_txout.script_pubkey == original_output.script_pubkey
                            && proposed_txout.value >= original_output.value),
                    InternalProposalError::DisallowedOutputSubstitution,
                )?;
                original_outputs.next();
            } else if proposed_txout.script_pubkey == original_output.script_pubkey {
                ensure(
                    proposed_txout.value >= original_output.value,
                    InternalProposalError::OutputValueDecreased,
                )?;
                original_outputs.next();
            }
        }

        ensure(original_outputs.peek().is_none(), InternalProposalError::MissingOrShuffledOutputs)?;
        Ok(contributed_fee)
    }

    fn check_fees(&self, proposal: &Psbt, contributed_fee: Amount) -> InternalResult<()> {
        let proposed_fee = proposal.fee().map_err(InternalProposalError::Psbt)?;
        ensure(proposed_fee <= Amount::MAX_MONEY, InternalProposalError::AbsurdFee)?;
        let original_fee = self.original_psbt.fee().map_err(InternalProposalError::Psbt)?;
        ensure(original_fee <= proposed_fee, InternalProposalError::AbsoluteFeeDecreased)?;
        ensure(
            contributed_fee <= proposed_fee - original_fee,
            InternalProposalError::PayeeTookContributedFee,
        )?;

        let original_weight = self.original_psbt.clone().extract_tx_unchecked_fee_rate().weight();
        let original_fee_rate = crate::psbt::fee_rate(original_fee, original_weight)
            .ok_or(InternalProposalError::AbsurdFee)?;
        let original_spks = self
            .original_psbt
            .input_pairs()
            .map(|input| {
                input
                    .previous_txout()
                    .map(|txout| txout.script_pubkey.clone())
                    .map_err(InternalProposalError::PrevTxOut)
            })
            .collect::<InternalResult<Vec<ScriptBuf>>>()?;
        let mut additional_input_weight = Weight::ZERO;
        for input in proposal.input_pairs() {
            let spk =
                &input.previous_txout().map_err(InternalProposalError::PrevTxOut)?.script_pubkey;
            if !original_spks.contains(spk) {
                additional_input_weight +=
                    input.expected_input_weight().map_err(InternalProposalError::InputWeight)?;
            }
        }
        tracing::trace!("receiver added {additional_input_weight} of inputs");
        let input_fee = original_fee_rate
            .checked_mul_by_weight(additional_input_weight)
            .ok_or(InternalProposalError::AbsurdFee)?;
        ensure(
            contributed_fee <= input_fee,
            InternalProposalError::FeeContributionPaysOutputSizeIncrease,
        )?;

        if self.min_fee_rate > FeeRate::ZERO {
            let proposed_weight = proposal.clone().extract_tx_unchecked_fee_rate().weight();
            let proposed_fee_rate = crate::psbt::fee_rate(proposed_fee, proposed_weight)
                .ok_or(InternalProposalError::AbsurdFee)?;
            ensure(
                proposed_fee_rate >= self.min_fee_rate,
                InternalProposalError::FeeRateBelowMinimum,
            )?;
        }
        Ok(())
    }

    /// Put back the sender input fields the receiver stripped, which the wallet needs to sign.
    fn restore_original_utxos(&self, proposal: &mut Psbt) {
        let mut original_inputs = self.original_psbt.input_pairs().peekable();
        for (proposed_txin, proposed_psbtin) in
            proposal.unsigned_tx.input.iter().zip(&mut proposal.inputs)
        {
            let Some(original) = original_inputs.peek() else { break };
            if proposed_txin.previous_output != original.txin.previous_output {
                continue;
            }
            proposed_psbtin.non_witness_utxo = original.psbtin.non_witness_utxo.clone();
            proposed_psbtin.witness_utxo = original.psbtin.witness_utxo.clone();
            proposed_psbtin.bip32_derivation = original.psbtin.bip32_derivation.clone();
            proposed_psbtin.tap_internal_key = original.psbtin.tap_internal_key;
            proposed_psbtin.tap_key_origins = original.psbtin.tap_key_origins.clone();
            proposed_psbtin.redeem_script = original.psbtin.redeem_script.clone();
            proposed_psbtin.witness_script = original.psbtin.witness_script.clone();
            original_inputs.next();
        }
    }

    /// Put back the fields of the sender's outputs, so the wallet can recognize its change.
    fn restore_original_outputs(&self, proposal: &mut Psbt) {
        let original_outputs =
            self.original_psbt.unsigned_tx.output.iter().zip(&self.original_psbt.outputs);
        let mut original_outputs = original_outputs.peekable();
        for (proposed_txout, proposed_psbtout) in
            proposal.unsigned_tx.output.iter().zip(proposal.outputs.iter_mut())
        {
            let Some((original_txout, original_psbtout)) = original_outputs.peek() else { break };
            if proposed_txout == *original_txout {
                *proposed_psbtout = (*original_psbtout).clone();
                original_outputs.next();
            }
        }
    }
}

/// The payee must be paid exactly once, and exactly the requested amount if there is one.
fn check_single_payee(
    psbt: &Psbt,
    payee: &Script,
    amount: Option<Amount>,
) -> Result<(), InternalBuildSenderError> {
    let mut payee_outputs = psbt.unsigned_tx.output.iter().filter(|o| o.script_pubkey == *payee);
    let output = payee_outputs.next().ok_or(InternalBuildSenderError::MissingPayeeOutput)?;
    if payee_outputs.next().is_some() {
        return Err(InternalBuildSenderError::MultiplePayeeOutputs);
    }
    if amount.is_some_and(|amount| output.value != amount) {
        return Err(InternalBuildSenderError::PayeeValueNotEqual);
    }
    Ok(())
}

/// Drop the fields a receiver has no business seeing.
fn clear_unneeded_fields(psbt: &mut Psbt) {
    psbt.xpub.clear();
    psbt.proprietary.clear();
    psbt.unknown.clear();
    for input in &mut psbt.inputs {
        input.bip32_derivation.clear();
        input.tap_internal_key = None;
        input.tap_key_origins.clear();
        input.tap_key_sig = None;
        input.tap_merkle_root = None;
        input.tap_script_sigs.clear();
        input.proprietary.clear();
        input.unknown.clear();
    }
    for output in &mut psbt.outputs {
        output.bip32_derivation.clear();
        output.tap_internal_key = None;
        output.tap_key_origins.clear();
        output.proprietary.clear();
        output.unknown.clear();
    }
}

fn check_fee_output_amount(
    output: &TxOut,
    fee: Amount,
    clamp_fee_contribution: bool,
) -> Result<Amount, InternalBuildSenderError> {
    match output.value < fee {
        false => Ok(fee),
        true if clamp_fee_contribution => Ok(output.value),
        true => Err(InternalBuildSenderError::FeeOutputValueLowerThanFeeContribution),
    }
}

/// Pick the output the receiver may take `fee` from.
///
/// Without an explicit `change_index`, the change is the one output that does not pay the payee,
/// which requires exactly two outputs.
fn determine_fee_contribution(
    psbt: &Psbt,
    payee: &Script,
    fee: Amount,
    change_index: Option<usize>,
    clamp_fee_contribution: bool,
) -> Result<Option<AdditionalFeeContribution>, InternalBuildSenderError> {
    let outputs = &psbt.unsigned_tx.output;
    let vout = match change_index {
        Some(index) => {
            let output =
                outputs.get(index).ok_or(InternalBuildSenderError::ChangeIndexOutOfBounds)?;
            if output.script_pubkey == *payee {
                return Err(InternalBuildSenderError::ChangeIndexPointsAtPayee);
            }
            index
        }
        None => match outputs.len() {
            0 => return Err(InternalBuildSenderError::NoOutputs),
            1 if outputs[0].script_pubkey != *payee =>
                return Err(InternalBuildSenderError::MissingPayeeOutput),
            // The payee is the only output, so there is no change to contribute from
            1 if clamp_fee_contribution => return Ok(None),
            1 => return Err(InternalBuildSenderError::FeeOutputValueLowerThanFeeContribution),
            2 => outputs
                .iter()
                .position(|output| output.script_pubkey != *payee)
                .ok_or(InternalBuildSenderError::MultiplePayeeOutputs)?,
            _ => return Err(InternalBuildSenderError::AmbiguousChangeOutput),
        },
    };
    let max_amount = check_fee_output_amount(&outputs[vout], fee, clamp_fee_contribution)?;
    Ok(Some(AdditionalFeeContribution { max_amount, vout }))
}

/// The optional parameters of the original, as the query the receiver parses.
fn serialize_params(
    output_substitution: OutputSubstitution,
    fee_contribution: Option<AdditionalFeeContribution>,
    min_fee_rate: FeeRate,
) -> String {
    let mut params = url::form_urlencoded::Serializer::new(String::new());
    params.append_pair("v", &Version::Two.to_string());
    if output_substitution == OutputSubstitution::Disabled {
        params.append_pair("disableoutputsubstitution", "true");
    }
    if let Some(AdditionalFeeContribution { max_amount, vout }) = fee_contribution {
        params
            .append_pair("additionalfeeoutputindex", &vout.to_string())
            .append_pair("maxadditionalfeecontribution", &max_amount.to_sat().to_string());
    }
    if min_fee_rate > FeeRate::ZERO {
        // sat/vB, which may be fractional
        let float_fee_rate = min_fee_rate.to_sat_per_kwu() as f32 / 250.0_f32;
        params.append_pair("minfeerate", &float_fee_rate.to_string());
    }
    params.finish()
}
