//! Receive Payjoin
//!
//! A receiver session publishes a payjoin URI, waits in its directory mailbox for the sender's
//! original PSBT, checks it, contributes to it and returns a signed proposal. The typestates and
//! their transitions live in [`v2`]. The checks and proposal construction they drive are here.
//!
//! Every check that needs the receiver's wallet asks through a trait from
//! [`crate::callbacks`], so the session can be driven from any wallet backend.

use std::collections::BTreeMap;
use std::str::FromStr;

use bitcoin::{FeeRate, Psbt, Transaction};
pub(crate) use error::InternalPayloadError;
pub use error::{
    Error, InputContributionError, JsonReply, OutputSubstitutionError, PayloadError, ProtocolError,
    RejectionKind, SelectionError,
};
use optional_parameters::Params;
use serde::{Deserialize, Serialize};

use crate::callbacks::{CanBroadcast, IsOutputKnown, IsScriptOwned, ProcessPsbt};
pub use crate::psbt::{InputPair, PsbtInputError};
use crate::psbt::PsbtExt;
use crate::{ImplementationError, Version};

pub(crate) mod common;
mod error;
pub(crate) mod optional_parameters;

pub mod v2;

/// Parse the base64 PSBT and the query string of an original payload.
pub(crate) fn parse_payload(
    base64: &str,
    query: &str,
    supported_versions: &'static [Version],
) -> Result<(Psbt, Params), PayloadError> {
    let unchecked_psbt = Psbt::from_str(base64).map_err(InternalPayloadError::ParsePsbt)?;

    let psbt = unchecked_psbt.validate().map_err(InternalPayloadError::InconsistentPsbt)?;
    tracing::debug!("received original psbt: {psbt:?}");

    let pairs = url::form_urlencoded::parse(query.as_bytes());
    let params = Params::from_query_pairs(pairs, supported_versions)
        .map_err(InternalPayloadError::SenderParams)?;

    Ok((psbt, params))
}

/// The original PSBT and the sender's parameters, as retrieved from the directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OriginalPayload {
    pub(crate) psbt: Psbt,
    pub(crate) params: Params,
}

impl OriginalPayload {
    fn psbt_fee_rate(&self) -> Result<FeeRate, InternalPayloadError> {
        let original_psbt_fee = self.psbt.fee().map_err(|e| {
            InternalPayloadError::ParsePsbt(bitcoin::psbt::PsbtParseError::PsbtEncoding(e))
        })?;
        let weight = self.psbt.clone().extract_tx_unchecked_fee_rate().weight();
        crate::psbt::fee_rate(original_psbt_fee, weight)
            .ok_or(InternalPayloadError::AbsurdFee(original_psbt_fee))
    }

    /// The sender's signed transaction, for a fallback broadcast.
    pub fn extract_tx_to_schedule_broadcast(&self) -> Transaction {
        self.psbt.clone().extract_tx_unchecked_fee_rate()
    }

    pub(crate) fn check_broadcast_suitability(
        &self,
        min_fee_rate: Option<FeeRate>,
        can_broadcast: impl CanBroadcast,
    ) -> Result<(), Error> {
        let original_psbt_fee_rate = self.psbt_fee_rate()?;
        if let Some(min_fee_rate) = min_fee_rate {
            if original_psbt_fee_rate < min_fee_rate {
                return Err(InternalPayloadError::PsbtBelowFeeRate(
                    original_psbt_fee_rate,
                    min_fee_rate,
                )
                .into());
            }
        }
        if can_broadcast
            .can_broadcast(&self.extract_tx_to_schedule_broadcast())
            .map_err(|e| Error::implementation(RejectionKind::OriginalPsbtRejected, e))?
        {
            Ok(())
        } else {
            Err(InternalPayloadError::OriginalPsbtNotBroadcastable.into())
        }
    }

    /// A sender could try to make the receiver sign for its own coins.
    pub(crate) fn check_inputs_not_owned(&self, is_owned: impl IsScriptOwned) -> Result<(), Error> {
        for input in self.psbt.input_pairs() {
            let txout = input.previous_txout().map_err(InternalPayloadError::PrevTxOut)?;
            if is_owned
                .is_script_owned(&txout.script_pubkey)
                .map_err(|e| Error::implementation(RejectionKind::InputOwned, e))?
            {
                return Err(InternalPayloadError::InputOwned(txout.script_pubkey.clone()).into());
            }
        }
        Ok(())
    }

    pub(crate) fn check_no_inputs_seen_before(
        &self,
        is_known: impl IsOutputKnown,
    ) -> Result<(), Error> {
        for input in self.psbt.input_pairs() {
            let outpoint = input.txin.previous_output;
            if is_known
                .is_output_known(&outpoint)
                .map_err(|e| Error::implementation(RejectionKind::InputSeenBefore, e))?
            {
                tracing::warn!("request contains an input seen before: {outpoint}");
                return Err(InternalPayloadError::InputSeen(outpoint).into());
            }
        }
        Ok(())
    }

    /// Find the outputs paying the receiver.
    ///
    /// A fee contribution aimed at one of them, or at no output at all, is dropped so the receiver
    /// never pays the sender's fee from its own outputs.
    pub(crate) fn identify_receiver_outputs(
        self,
        is_receiver_output: impl IsScriptOwned,
    ) -> Result<common::WantsOutputs, Error> {
        let owned_vouts: Vec<usize> = self
            .psbt
            .unsigned_tx
            .output
            .iter()
            .enumerate()
            .filter_map(|(vout, txo)| match is_receiver_output.is_script_owned(&txo.script_pubkey) {
                Ok(true) => Some(Ok(vout)),
                Ok(false) => None,
                Err(e) => Some(Err(e)),
            })
            .collect::<Result<Vec<_>, ImplementationError>>()
            .map_err(|e| Error::implementation(RejectionKind::NoReceiverOutput, e))?;

        if owned_vouts.is_empty() {
            return Err(InternalPayloadError::MissingPayment.into());
        }

        let mut params = self.params;
        if let Some((_, additional_fee_output_index)) = params.additional_fee_contribution {
            if owned_vouts.contains(&additional_fee_output_index)
                || additional_fee_output_index >= self.psbt.unsigned_tx.output.len()
            {
                tracing::warn!(
                    "ignoring fee contribution from output {additional_fee_output_index}"
                );
                params.additional_fee_contribution = None;
            }
        }

        Ok(common::WantsOutputs::new(OriginalPayload { psbt: self.psbt, params }, owned_vouts))
    }
}

/// The original PSBT and the proposal after fees were applied.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PsbtContext {
    pub(crate) original_psbt: Psbt,
    pub(crate) payjoin_psbt: Psbt,
}

impl PsbtContext {
    /// The proposal as it may be sent back.
    ///
    /// Only the transaction, UTXOs of receiver inputs, final scripts and signatures are kept.
    /// Sender inputs lose their UTXO data, which the sender restores from its original.
    fn prepare_psbt(&self, processed_psbt: Psbt) -> Psbt {
        tracing::trace!("PSBT from the wallet: {processed_psbt:#?}");
        let sender_input_indexes = self.sender_input_indexes();

        let mut filtered_psbt = Psbt {
            unsigned_tx: processed_psbt.unsigned_tx,
            version: processed_psbt.version,
            xpub: BTreeMap::new(),
            proprietary: BTreeMap::new(),
            unknown: BTreeMap::new(),
            inputs: vec![],
            outputs: vec![],
        };

        for (i, input) in processed_psbt.inputs.into_iter().enumerate() {
            let is_sender_input = sender_input_indexes.contains(&i);
            filtered_psbt.inputs.push(bitcoin::psbt::Input {
                witness_utxo: if is_sender_input { None } else { input.witness_utxo },
                non_witness_utxo: if is_sender_input { None } else { input.non_witness_utxo },
                sighash_type: input.sighash_type,
                final_script_sig: input.final_script_sig,
                final_script_witness: input.final_script_witness,
                tap_key_sig: input.tap_key_sig,
                tap_script_sigs: input.tap_script_sigs,
                tap_merkle_root: input.tap_merkle_root,
                ..Default::default()
            });
        }

        filtered_psbt.outputs = vec![Default::default(); processed_psbt.outputs.len()];
        filtered_psbt
    }

    fn sender_input_indexes(&self) -> Vec<usize> {
        let mut original_inputs = self.original_psbt.input_pairs().peekable();
        let mut sender_input_indexes = vec![];
        for (i, input) in self.payjoin_psbt.input_pairs().enumerate() {
            if let Some(original) = original_inputs.peek() {
                if input.txin.previous_output == original.txin.previous_output {
                    sender_input_indexes.push(i);
                    original_inputs.next();
                }
            }
        }
        sender_input_indexes
    }

    /// Strip the sender's now invalid signatures, have the wallet sign and check its work.
    pub(crate) fn finalize_proposal(self, wallet: impl ProcessPsbt) -> Result<Psbt, Error> {
        let mut psbt = self.payjoin_psbt.clone();
        let sender_input_indexes = self.sender_input_indexes();
        for &i in &sender_input_indexes {
            tracing::trace!("clearing sender input {i}");
            psbt.inputs[i].final_script_sig = None;
            psbt.inputs[i].final_script_witness = None;
            psbt.inputs[i].tap_key_sig = None;
        }
        let finalized_psbt =
            wallet.process_psbt(&psbt).map_err(InternalPayloadError::WalletFailed)?;

        let expected = self.payjoin_psbt.unsigned_tx.compute_ntxid();
        let actual = finalized_psbt.unsigned_tx.compute_ntxid();
        if expected != actual {
            return Err(InternalPayloadError::WalletAlteredProposal { expected, actual }.into());
        }
        if let Some(unsigned) = (0..finalized_psbt.inputs.len()).find(|i| {
            let input = &finalized_psbt.inputs[*i];
            !sender_input_indexes.contains(i)
                && input.final_script_sig.is_none()
                && input.final_script_witness.is_none()
        }) {
            return Err(InternalPayloadError::ReceiverInputNotFinalized(unsigned).into());
        }

        Ok(self.prepare_psbt(finalized_psbt))
    }
}
