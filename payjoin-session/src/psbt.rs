//! PSBT helpers and the input pairs a receiver contributes.

use std::fmt;
use std::str::FromStr;

use bitcoin::address::FromScriptError;
use bitcoin::psbt::Psbt;
use bitcoin::transaction::InputWeightPrediction;
use bitcoin::{
    psbt, Address, AddressType, Amount, FeeRate, Network, OutPoint, ScriptBuf, Sequence,
    Transaction, TxIn, TxOut, Txid, Weight, Witness,
};
use serde::{Deserialize, Serialize};

/// Weight of the txid (32), index (4) and sequence (4) of an input. `InputWeightPrediction`
/// already accounts for the script_sig length.
pub(crate) const NON_WITNESS_INPUT_WEIGHT: Weight = Weight::from_non_witness_data_size(32 + 4 + 4);

// script_sig 0x160014{20-byte-key-hash} = 23 bytes, witness <signature> <pubkey> = 72, 33 bytes
const NESTED_P2WPKH_MAX: InputWeightPrediction = InputWeightPrediction::from_slice(23, &[72, 33]);

/// `fee / weight`, rounded down.
///
/// `None` for a zero weight, or for a fee above the money supply, which no real transaction
/// pays.
pub(crate) fn fee_rate(fee: Amount, weight: Weight) -> Option<FeeRate> {
    if fee > Amount::MAX_MONEY {
        return None;
    }
    let sat_per_kwu = fee.to_sat().checked_mul(1000)?.checked_div(weight.to_wu())?;
    Some(FeeRate::from_sat_per_kwu(sat_per_kwu))
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum InconsistentPsbt {
    UnequalInputCounts { tx_ins: usize, psbt_ins: usize },
    UnequalOutputCounts { tx_outs: usize, psbt_outs: usize },
}

impl fmt::Display for InconsistentPsbt {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            InconsistentPsbt::UnequalInputCounts { tx_ins, psbt_ins } => write!(
                f,
                "the PSBT has {psbt_ins} inputs but its unsigned transaction has {tx_ins}"
            ),
            InconsistentPsbt::UnequalOutputCounts { tx_outs, psbt_outs } => write!(
                f,
                "the PSBT has {psbt_outs} outputs but its unsigned transaction has {tx_outs}"
            ),
        }
    }
}

impl std::error::Error for InconsistentPsbt {}

pub(crate) trait PsbtExt: Sized {
    fn input_pairs(&self) -> Box<dyn Iterator<Item = InternalInputPair<'_>> + '_>;
    /// Guarantees that the PSBT maps line up with the unsigned transaction.
    fn validate(self) -> Result<Self, InconsistentPsbt>;
    fn validate_input_utxos(&self) -> Result<(), PsbtInputsError>;
}

impl PsbtExt for Psbt {
    fn input_pairs(&self) -> Box<dyn Iterator<Item = InternalInputPair<'_>> + '_> {
        let pairs = self.unsigned_tx.input.iter().zip(self.inputs.iter());
        Box::new(pairs.map(|(txin, psbtin)| InternalInputPair { txin, psbtin }))
    }

    fn validate(self) -> Result<Self, InconsistentPsbt> {
        let tx = &self.unsigned_tx;
        if tx.input.len() != self.inputs.len() {
            let (tx_ins, psbt_ins) = (tx.input.len(), self.inputs.len());
            return Err(InconsistentPsbt::UnequalInputCounts { tx_ins, psbt_ins });
        }
        if tx.output.len() != self.outputs.len() {
            let (tx_outs, psbt_outs) = (tx.output.len(), self.outputs.len());
            return Err(InconsistentPsbt::UnequalOutputCounts { tx_outs, psbt_outs });
        }
        Ok(self)
    }

    fn validate_input_utxos(&self) -> Result<(), PsbtInputsError> {
        for (index, input) in self.input_pairs().enumerate() {
            input.validate_utxo().map_err(|error| PsbtInputsError { index, error })?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub(crate) struct InternalInputPair<'a> {
    pub txin: &'a TxIn,
    pub psbtin: &'a psbt::Input,
}

impl InternalInputPair<'_> {
    fn non_witness_txout<'t>(&self, tx: &'t Transaction) -> Result<&'t TxOut, PrevTxOutError> {
        let index = self.txin.previous_output.vout;
        let out_of_bounds =
            || PrevTxOutError::IndexOutOfBounds { output_count: tx.output.len(), index };
        let vout = usize::try_from(index).map_err(|_| out_of_bounds())?;
        tx.output.get(vout).ok_or_else(out_of_bounds)
    }

    /// The [`TxOut`] this input spends.
    pub fn previous_txout(&self) -> Result<&TxOut, PrevTxOutError> {
        if let Some(txout) = &self.psbtin.witness_utxo {
            return Ok(txout);
        }
        match &self.psbtin.non_witness_utxo {
            Some(tx) => self.non_witness_txout(tx),
            None => Err(PrevTxOutError::MissingUtxoInformation),
        }
    }

    /// Checks that the [`TxIn`] and the UTXO fields of the [`psbt::Input`] refer to the same
    /// output.
    pub fn validate_utxo(&self) -> Result<(), InternalPsbtInputError> {
        let outpoint = &self.txin.previous_output;
        match (&self.psbtin.non_witness_utxo, &self.psbtin.witness_utxo) {
            (None, None) =>
                Err(InternalPsbtInputError::PrevTxOut(PrevTxOutError::MissingUtxoInformation)),
            (None, Some(_)) => Ok(()),
            (Some(tx), _) if tx.compute_txid() != outpoint.txid =>
                Err(InternalPsbtInputError::UnequalTxid),
            (Some(tx), None) => self.non_witness_txout(tx).map(drop).map_err(Into::into),
            (Some(tx), Some(witness_txout)) => {
                if self.non_witness_txout(tx)? == witness_txout {
                    Ok(())
                } else {
                    Err(InternalPsbtInputError::SegWitTxOutMismatch)
                }
            }
        }
    }

    pub fn address_type(&self) -> Result<AddressType, AddressTypeError> {
        let txo = self.previous_txout()?;
        // The network is irrelevant to the address type
        Address::from_script(&txo.script_pubkey, Network::Bitcoin)?
            .address_type()
            .ok_or(AddressTypeError::UnknownAddressType)
    }

    /// Predicted weight of this input once signed, from the type of output it spends.
    pub fn expected_input_weight(&self) -> Result<Weight, InputWeightError> {
        use bitcoin::AddressType::*;

        let witness_prediction = |w: &Witness| {
            InputWeightPrediction::new(0, w.iter().map(|el| el.len()).collect::<Vec<_>>())
        };
        let known_witness = || {
            Some(&self.txin.witness)
                .filter(|w| !w.is_empty())
                .or(self.psbtin.final_script_witness.as_ref().filter(|w| !w.is_empty()))
        };

        let iwp = match self.address_type()? {
            P2pkh => InputWeightPrediction::P2PKH_COMPRESSED_MAX,
            P2sh => {
                // Signed inputs reveal the redeem script in their script_sig
                let redeem_script = match self.psbtin.final_script_sig {
                    Some(ref script_sig) => script_sig.redeem_script(),
                    None => self.psbtin.redeem_script.as_deref(),
                };
                match redeem_script {
                    Some(script) if script.is_p2wpkh() => NESTED_P2WPKH_MAX,
                    Some(_) => return Err(InputWeightError::NotSupported),
                    None => return Err(InputWeightError::NoRedeemScript),
                }
            }
            P2wpkh => InputWeightPrediction::P2WPKH_MAX,
            P2wsh => known_witness().map(witness_prediction).ok_or(InputWeightError::NotSupported)?,
            P2tr => known_witness()
                .map(witness_prediction)
                .unwrap_or(InputWeightPrediction::P2TR_KEY_DEFAULT_SIGHASH),
            _ => return Err(AddressTypeError::UnknownAddressType.into()),
        };
        Ok(iwp.weight() + NON_WITNESS_INPUT_WEIGHT)
    }
}

/// A receiver input: a [`TxIn`] with the [`psbt::Input`] describing the output it spends.
///
/// Construction checks that both halves refer to the same UTXO and that the weight of the signed
/// input is known.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct InputPair {
    pub(crate) txin: TxIn,
    pub(crate) psbtin: psbt::Input,
    pub(crate) previous_txout: TxOut,
    pub(crate) expected_weight: Weight,
}

impl InputPair {
    /// Validate a ([`TxIn`], [`psbt::Input`]) pair.
    ///
    /// `expected_weight` is only accepted, and then required, for inputs whose signed weight cannot
    /// be predicted from the script type.
    pub fn new(
        txin: TxIn,
        psbtin: psbt::Input,
        expected_weight: Option<Weight>,
    ) -> Result<Self, PsbtInputError> {
        let raw = InternalInputPair { txin: &txin, psbtin: &psbtin };
        raw.validate_utxo()?;
        let previous_txout = raw.previous_txout().map_err(InternalPsbtInputError::from)?.clone();

        let expected_weight = match (raw.expected_input_weight(), expected_weight) {
            (Ok(_), Some(_)) =>
                return Err(InternalPsbtInputError::ProvidedUnnecessaryWeight.into()),
            (Ok(weight), None) => weight,
            (Err(InputWeightError::NotSupported), Some(expected_weight)) => expected_weight,
            (Err(e), _) => return Err(InternalPsbtInputError::from(e).into()),
        };

        Ok(Self { txin, psbtin, previous_txout, expected_weight })
    }

    /// Build an input pair from plain data, as handed over by a host wallet.
    pub fn from_plain(
        txin: PlainTxIn,
        psbtin: PlainPsbtInput,
        expected_weight: Option<Weight>,
    ) -> Result<Self, InputPairError> {
        let txin = TxIn::try_from(txin)?;
        Self::new(txin, psbtin.into(), expected_weight).map_err(InputPairError::InvalidPsbtInput)
    }

    fn unsigned_txin(outpoint: OutPoint, sequence: Option<Sequence>) -> TxIn {
        TxIn {
            previous_output: outpoint,
            script_sig: ScriptBuf::default(),
            sequence: sequence.unwrap_or_default(),
            witness: Witness::default(),
        }
    }

    fn new_legacy(
        non_witness_utxo: Transaction,
        outpoint: OutPoint,
        sequence: Option<Sequence>,
        redeem_script: Option<ScriptBuf>,
        address_type: AddressType,
    ) -> Result<Self, PsbtInputError> {
        let txin = Self::unsigned_txin(outpoint, sequence);
        let spent = InternalInputPair { txin: &txin, psbtin: &psbt::Input::default() }
            .non_witness_txout(&non_witness_utxo)
            .map_err(InternalPsbtInputError::from)?;
        if !has_address_type(&spent.script_pubkey, address_type) {
            return Err(InternalPsbtInputError::InvalidScriptPubKey(address_type).into());
        }
        let psbtin = psbt::Input {
            non_witness_utxo: Some(non_witness_utxo),
            redeem_script,
            ..psbt::Input::default()
        };
        Self::new(txin, psbtin, None)
    }

    fn new_segwit(
        txout: TxOut,
        outpoint: OutPoint,
        sequence: Option<Sequence>,
        expected_weight: Option<Weight>,
        address_type: AddressType,
    ) -> Result<Self, PsbtInputError> {
        if !has_address_type(&txout.script_pubkey, address_type) {
            return Err(InternalPsbtInputError::InvalidScriptPubKey(address_type).into());
        }
        let psbtin = psbt::Input { witness_utxo: Some(txout), ..psbt::Input::default() };
        Self::new(Self::unsigned_txin(outpoint, sequence), psbtin, expected_weight)
    }

    /// Spend a legacy P2PKH output of `non_witness_utxo`.
    pub fn new_p2pkh(
        non_witness_utxo: Transaction,
        outpoint: OutPoint,
        sequence: Option<Sequence>,
    ) -> Result<Self, PsbtInputError> {
        Self::new_legacy(non_witness_utxo, outpoint, sequence, None, AddressType::P2pkh)
    }

    /// Spend a P2SH output of `non_witness_utxo`. Only nested P2WPKH redeem scripts have a
    /// predictable weight.
    pub fn new_p2sh(
        non_witness_utxo: Transaction,
        outpoint: OutPoint,
        redeem_script: ScriptBuf,
        sequence: Option<Sequence>,
    ) -> Result<Self, PsbtInputError> {
        let redeem_script = Some(redeem_script);
        Self::new_legacy(non_witness_utxo, outpoint, sequence, redeem_script, AddressType::P2sh)
    }

    pub fn new_p2wpkh(
        txout: TxOut,
        outpoint: OutPoint,
        sequence: Option<Sequence>,
    ) -> Result<Self, PsbtInputError> {
        Self::new_segwit(txout, outpoint, sequence, None, AddressType::P2wpkh)
    }

    /// Spend a P2WSH output. Its weight depends on the witness script, so the caller supplies it.
    pub fn new_p2wsh(
        txout: TxOut,
        outpoint: OutPoint,
        sequence: Option<Sequence>,
        expected_weight: Weight,
    ) -> Result<Self, PsbtInputError> {
        Self::new_segwit(txout, outpoint, sequence, Some(expected_weight), AddressType::P2wsh)
    }

    /// Spend a P2TR output by key path.
    pub fn new_p2tr(
        txout: TxOut,
        outpoint: OutPoint,
        sequence: Option<Sequence>,
    ) -> Result<Self, PsbtInputError> {
        Self::new_segwit(txout, outpoint, sequence, None, AddressType::P2tr)
    }

    pub fn txin(&self) -> &TxIn { &self.txin }

    pub fn psbtin(&self) -> &psbt::Input { &self.psbtin }

    pub fn outpoint(&self) -> OutPoint { self.txin.previous_output }

    pub fn value(&self) -> Amount { self.previous_txout.value }

    pub fn expected_weight(&self) -> Weight { self.expected_weight }

    pub(crate) fn previous_txout(&self) -> &TxOut { &self.previous_txout }

    pub(crate) fn address_type(&self) -> Result<AddressType, AddressTypeError> {
        InternalInputPair::from(self).address_type()
    }
}

impl<'a> From<&'a InputPair> for InternalInputPair<'a> {
    fn from(pair: &'a InputPair) -> Self { Self { psbtin: &pair.psbtin, txin: &pair.txin } }
}

fn has_address_type(script: &bitcoin::Script, address_type: AddressType) -> bool {
    match address_type {
        AddressType::P2pkh => script.is_p2pkh(),
        AddressType::P2sh => script.is_p2sh(),
        AddressType::P2wpkh => script.is_p2wpkh(),
        AddressType::P2wsh => script.is_p2wsh(),
        AddressType::P2tr => script.is_p2tr(),
        _ => false,
    }
}

/// An outpoint as plain data. `txid` is the usual big-endian hex.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlainOutPoint {
    pub txid: String,
    pub vout: u32,
}

impl From<OutPoint> for PlainOutPoint {
    fn from(value: OutPoint) -> Self {
        PlainOutPoint { txid: value.txid.to_string(), vout: value.vout }
    }
}

impl TryFrom<PlainOutPoint> for OutPoint {
    type Error = InputPairError;

    fn try_from(value: PlainOutPoint) -> Result<Self, Self::Error> {
        match Txid::from_str(&value.txid) {
            Ok(txid) => Ok(OutPoint { txid, vout: value.vout }),
            Err(_) => Err(InputPairError::InvalidOutPoint { txid: value.txid, vout: value.vout }),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlainTxIn {
    pub previous_output: PlainOutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
    pub witness: Vec<Vec<u8>>,
}

impl TryFrom<PlainTxIn> for TxIn {
    type Error = InputPairError;

    fn try_from(value: PlainTxIn) -> Result<Self, Self::Error> {
        Ok(TxIn {
            previous_output: value.previous_output.try_into()?,
            script_sig: ScriptBuf::from_bytes(value.script_sig),
            sequence: Sequence(value.sequence),
            witness: Witness::from_slice(&value.witness),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlainTxOut {
    pub value_sat: u64,
    pub script_pubkey: Vec<u8>,
}

impl From<PlainTxOut> for TxOut {
    fn from(value: PlainTxOut) -> Self {
        TxOut {
            value: Amount::from_sat(value.value_sat),
            script_pubkey: ScriptBuf::from_bytes(value.script_pubkey),
        }
    }
}

impl From<TxOut> for PlainTxOut {
    fn from(value: TxOut) -> Self {
        PlainTxOut {
            value_sat: value.value.to_sat(),
            script_pubkey: value.script_pubkey.into_bytes(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlainPsbtInput {
    pub witness_utxo: Option<PlainTxOut>,
    pub redeem_script: Option<Vec<u8>>,
    pub witness_script: Option<Vec<u8>>,
}

impl From<PlainPsbtInput> for psbt::Input {
    fn from(value: PlainPsbtInput) -> Self {
        psbt::Input {
            witness_utxo: value.witness_utxo.map(Into::into),
            redeem_script: value.redeem_script.map(ScriptBuf::from_bytes),
            witness_script: value.witness_script.map(ScriptBuf::from_bytes),
            ..Default::default()
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum PrevTxOutError {
    MissingUtxoInformation,
    IndexOutOfBounds { output_count: usize, index: u32 },
}

impl fmt::Display for PrevTxOutError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PrevTxOutError::MissingUtxoInformation => write!(f, "missing UTXO information"),
            PrevTxOutError::IndexOutOfBounds { output_count, index } =>
                write!(f, "index {index} out of bounds (number of outputs: {output_count})"),
        }
    }
}

impl std::error::Error for PrevTxOutError {}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum InternalPsbtInputError {
    PrevTxOut(PrevTxOutError),
    UnequalTxid,
    /// The witness UTXO disagrees with the output of the non-witness UTXO
    SegWitTxOutMismatch,
    AddressType(AddressTypeError),
    InvalidScriptPubKey(AddressType),
    WeightError(InputWeightError),
    /// Weight was provided but can be calculated from available information
    ProvidedUnnecessaryWeight,
}

impl fmt::Display for InternalPsbtInputError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::PrevTxOut(e) => write!(f, "invalid previous transaction output: {e}"),
            Self::UnequalTxid =>
                write!(f, "the non-witness UTXO is not the transaction the input spends from"),
            Self::SegWitTxOutMismatch =>
                write!(f, "the witness UTXO does not match the spent output of the non-witness UTXO"),
            Self::AddressType(_) => write!(f, "invalid address type"),
            Self::InvalidScriptPubKey(e) => write!(f, "provided script was not a valid type of {e}"),
            Self::WeightError(e) => write!(f, "{e}"),
            Self::ProvidedUnnecessaryWeight =>
                write!(f, "weight was provided but can be calculated from available information"),
        }
    }
}

impl std::error::Error for InternalPsbtInputError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::PrevTxOut(error) => Some(error),
            Self::AddressType(error) => Some(error),
            Self::WeightError(error) => Some(error),
            _ => None,
        }
    }
}

impl From<PrevTxOutError> for InternalPsbtInputError {
    fn from(value: PrevTxOutError) -> Self { InternalPsbtInputError::PrevTxOut(value) }
}

impl From<InputWeightError> for InternalPsbtInputError {
    fn from(value: InputWeightError) -> Self { Self::WeightError(value) }
}

/// An input handed to [`InputPair::new`] was refused.
#[derive(Debug, PartialEq, Eq)]
pub struct PsbtInputError(InternalPsbtInputError);

impl From<InternalPsbtInputError> for PsbtInputError {
    fn from(e: InternalPsbtInputError) -> Self { PsbtInputError(e) }
}

impl fmt::Display for PsbtInputError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result { write!(f, "{}", self.0) }
}

impl std::error::Error for PsbtInputError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> { Some(&self.0) }
}

/// Error building an [`InputPair`] from plain data.
#[derive(Debug, PartialEq, Eq)]
pub enum InputPairError {
    /// The outpoint's txid is not 32 bytes of hex.
    InvalidOutPoint { txid: String, vout: u32 },
    InvalidPsbtInput(PsbtInputError),
}

impl fmt::Display for InputPairError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            InputPairError::InvalidOutPoint { txid, vout } =>
                write!(f, "invalid outpoint (txid={txid}, vout={vout})"),
            InputPairError::InvalidPsbtInput(e) => write!(f, "invalid PSBT input: {e}"),
        }
    }
}

impl std::error::Error for InputPairError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            InputPairError::InvalidOutPoint { .. } => None,
            InputPairError::InvalidPsbtInput(e) => Some(e),
        }
    }
}

#[derive(Debug, PartialEq)]
pub struct PsbtInputsError {
    index: usize,
    error: InternalPsbtInputError,
}

impl PsbtInputsError {
    pub fn index(&self) -> usize { self.index }
}

impl fmt::Display for PsbtInputsError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "input {} of the PSBT is unusable", self.index)
    }
}

impl std::error::Error for PsbtInputsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> { Some(&self.error) }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum AddressTypeError {
    PrevTxOut(PrevTxOutError),
    InvalidScript(FromScriptError),
    UnknownAddressType,
}

impl fmt::Display for AddressTypeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::PrevTxOut(_) => write!(f, "the spent output is unknown"),
            Self::InvalidScript(_) => write!(f, "the spent script is not an address"),
            Self::UnknownAddressType => write!(f, "the spent script has no standard address type"),
        }
    }
}

impl std::error::Error for AddressTypeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::PrevTxOut(error) => Some(error),
            Self::InvalidScript(error) => Some(error),
            Self::UnknownAddressType => None,
        }
    }
}

impl From<PrevTxOutError> for AddressTypeError {
    fn from(value: PrevTxOutError) -> Self { Self::PrevTxOut(value) }
}

impl From<FromScriptError> for AddressTypeError {
    fn from(value: FromScriptError) -> Self { Self::InvalidScript(value) }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum InputWeightError {
    AddressType(AddressTypeError),
    NoRedeemScript,
    NotSupported,
}

impl fmt::Display for InputWeightError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::AddressType(_) => write!(f, "cannot tell the input's address type"),
            Self::NoRedeemScript => write!(f, "a p2sh input needs its redeem script"),
            Self::NotSupported => write!(f, "cannot predict the weight of this input type"),
        }
    }
}

impl std::error::Error for InputWeightError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::AddressType(error) => Some(error),
            _ => None,
        }
    }
}

impl From<AddressTypeError> for InputWeightError {
    fn from(value: AddressTypeError) -> Self { Self::AddressType(value) }
}

#[cfg(test)]
mod test {
    use bitcoin::absolute::LockTime;
    use bitcoin::hashes::Hash;
    use bitcoin::{PubkeyHash, ScriptHash, WPubkeyHash, WScriptHash};
    use payjoin_test_utils::{DUMMY20, DUMMY32, PARSED_ORIGINAL_PSBT};

    use super::*;

    const FUNDING_TX: &str = "010000000001015721029046ec1840d5bc8f4e59ae8ac4b576191d5e7994c8d1c44ddeaffc176c0300000000fdffffff018e8d00000000000017a9144a87748bc7bcfee8290e36700eeca3112f53ecbe870140239d1975e0fc9b8345bce9a170a0224cf8eb327bfcaccf0f8b9434d17345579e4dcbb68f7be39eac7987dfaa08293b11fdc76ac28e26bd85e99a46b69675418100000000";

    fn funding_tx() -> Transaction {
        bitcoin::consensus::encode::deserialize_hex(FUNDING_TX).expect("valid transaction")
    }

    #[test]
    fn fee_rate_refuses_impossible_fees() {
        let weight = Weight::from_wu(400);
        assert_eq!(fee_rate(Amount::from_sat(100), weight), Some(FeeRate::from_sat_per_kwu(250)));
        assert_eq!(
            fee_rate(Amount::MAX_MONEY, Weight::from_wu(1)),
            Some(FeeRate::from_sat_per_kwu(Amount::MAX_MONEY.to_sat() * 1000))
        );
        assert_eq!(fee_rate(Amount::MAX_MONEY + Amount::ONE_SAT, weight), None);
        assert_eq!(fee_rate(Amount::from_sat(1_000_000_000_000_000_000), weight), None);
        assert_eq!(fee_rate(Amount::ONE_SAT, Weight::ZERO), None);
    }

    fn legacy_utxo(outputs: Vec<TxOut>) -> Transaction {
        Transaction {
            version: bitcoin::transaction::Version::ONE,
            lock_time: LockTime::ZERO,
            input: vec![],
            output: outputs,
        }
    }

    #[test]
    fn original_psbt_inputs_are_consistent() {
        let psbt = PARSED_ORIGINAL_PSBT.clone();
        assert!(psbt.validate_input_utxos().is_ok());
        let pair = psbt.input_pairs().next().expect("one input");
        assert_eq!(pair.address_type(), Ok(AddressType::P2sh));
        assert_eq!(
            pair.expected_input_weight(),
            Ok(NESTED_P2WPKH_MAX.weight() + NON_WITNESS_INPUT_WEIGHT)
        );
    }

    #[test]
    fn utxo_fields_must_agree_with_the_outpoint() {
        let psbt = PARSED_ORIGINAL_PSBT.clone();
        let mut txin = psbt.unsigned_tx.input[0].clone();
        let mut psbtin = psbt.inputs[0].clone();

        psbtin.non_witness_utxo = Some(funding_tx());
        let pair = InternalInputPair { txin: &txin, psbtin: &psbtin };
        assert_eq!(pair.validate_utxo(), Err(InternalPsbtInputError::UnequalTxid));

        txin.previous_output.txid = funding_tx().compute_txid();
        let pair = InternalInputPair { txin: &txin, psbtin: &psbtin };
        assert_eq!(pair.validate_utxo(), Err(InternalPsbtInputError::SegWitTxOutMismatch));

        psbtin.witness_utxo = None;
        let pair = InternalInputPair { txin: &txin, psbtin: &psbtin };
        assert_eq!(pair.validate_utxo(), Ok(()));

        psbtin.non_witness_utxo = None;
        let pair = InternalInputPair { txin: &txin, psbtin: &psbtin };
        assert_eq!(
            pair.validate_utxo(),
            Err(InternalPsbtInputError::PrevTxOut(PrevTxOutError::MissingUtxoInformation))
        );
    }

    #[test]
    fn p2sh_weight_needs_a_known_redeem_script() {
        let psbt = PARSED_ORIGINAL_PSBT.clone();
        let txin = &psbt.unsigned_tx.input[0];
        let mut psbtin = psbt.inputs[0].clone();
        psbtin.final_script_sig = Some(
            ScriptBuf::from_hex(
                "22002065f91a53cb7120057db3d378bd0f7d944167d43a7dcbff15d6afc4823f1d3ed3",
            )
            .expect("valid hex"),
        );
        let pair = InternalInputPair { txin, psbtin: &psbtin };
        assert_eq!(pair.expected_input_weight(), Err(InputWeightError::NotSupported));

        psbtin.final_script_sig = None;
        let pair = InternalInputPair { txin, psbtin: &psbtin };
        assert_eq!(pair.expected_input_weight(), Err(InputWeightError::NoRedeemScript));
    }

    #[test]
    fn typed_constructors_check_the_script() {
        let outpoint = OutPoint { txid: Txid::from_byte_array(DUMMY32), vout: 1 };
        let sequence = Sequence::from_512_second_intervals(123);
        let p2wpkh = TxOut {
            value: Amount::from_sat(12345),
            script_pubkey: ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array(DUMMY20)),
        };
        let pair = InputPair::new_p2wpkh(p2wpkh.clone(), outpoint, Some(sequence)).expect("p2wpkh");
        assert_eq!(pair.outpoint(), outpoint);
        assert_eq!(pair.txin().sequence, sequence);
        assert_eq!(pair.value(), Amount::from_sat(12345));
        assert_eq!(
            pair.expected_weight(),
            InputWeightPrediction::P2WPKH_MAX.weight() + NON_WITNESS_INPUT_WEIGHT
        );
        assert_eq!(
            InputPair::new_p2tr(p2wpkh, outpoint, None),
            Err(InternalPsbtInputError::InvalidScriptPubKey(AddressType::P2tr).into())
        );

        let p2wsh = TxOut {
            value: Amount::from_sat(500),
            script_pubkey: ScriptBuf::new_p2wsh(&WScriptHash::from_byte_array(DUMMY32)),
        };
        let weight = Weight::from_wu(42);
        let pair = InputPair::new_p2wsh(p2wsh.clone(), outpoint, None, weight).expect("p2wsh");
        assert_eq!(pair.expected_weight(), weight);
        assert_eq!(
            InputPair::new(
                TxIn { previous_output: outpoint, ..Default::default() },
                psbt::Input { witness_utxo: Some(p2wsh), ..Default::default() },
                None,
            ),
            Err(InternalPsbtInputError::WeightError(InputWeightError::NotSupported).into())
        );
    }

    #[test]
    fn legacy_constructors_look_up_the_spent_output() {
        let p2sh = TxOut {
            value: Amount::from_sat(123),
            script_pubkey: ScriptBuf::new_p2sh(&ScriptHash::from_byte_array(DUMMY20)),
        };
        let p2pkh = TxOut {
            value: Amount::from_sat(456),
            script_pubkey: ScriptBuf::new_p2pkh(&PubkeyHash::from_byte_array(DUMMY20)),
        };
        let utxo = legacy_utxo(vec![p2sh, p2pkh]);
        let txid = utxo.compute_txid();

        let pair = InputPair::new_p2pkh(utxo.clone(), OutPoint { txid, vout: 1 }, None)
            .expect("vout 1 is p2pkh");
        assert_eq!(pair.value(), Amount::from_sat(456));
        assert_eq!(pair.psbtin().non_witness_utxo.as_ref(), Some(&utxo));

        assert_eq!(
            InputPair::new_p2pkh(utxo.clone(), OutPoint { txid, vout: 0 }, None),
            Err(InternalPsbtInputError::InvalidScriptPubKey(AddressType::P2pkh).into())
        );
        assert_eq!(
            InputPair::new_p2pkh(utxo, OutPoint { txid, vout: 2 }, None),
            Err(InternalPsbtInputError::PrevTxOut(PrevTxOutError::IndexOutOfBounds {
                output_count: 2,
                index: 2
            })
            .into())
        );
    }

    #[test]
    fn plain_input_pair_rejects_malformed_outpoint() {
        let txin = PlainTxIn {
            previous_output: PlainOutPoint { txid: "deadbeef".to_owned(), vout: 0 },
            script_sig: vec![],
            sequence: 0,
            witness: vec![],
        };
        assert_eq!(
            InputPair::from_plain(txin, PlainPsbtInput::default(), None),
            Err(InputPairError::InvalidOutPoint { txid: "deadbeef".to_owned(), vout: 0 })
        );
    }

    #[test]
    fn plain_input_pair_accepts_a_valid_outpoint() {
        let txid = Txid::from_byte_array(DUMMY32);
        let script_pubkey = ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array(DUMMY20));
        let txin = PlainTxIn {
            previous_output: OutPoint { txid, vout: 7 }.into(),
            script_sig: vec![],
            sequence: u32::MAX,
            witness: vec![],
        };
        let psbtin = PlainPsbtInput {
            witness_utxo: Some(PlainTxOut {
                value_sat: 1_000,
                script_pubkey: script_pubkey.to_bytes(),
            }),
            ..Default::default()
        };
        let pair = InputPair::from_plain(txin, psbtin, None).expect("valid plain input");
        assert_eq!(pair.outpoint(), OutPoint { txid, vout: 7 });
        assert_eq!(pair.previous_txout().script_pubkey, script_pubkey);

        // A well-formed outpoint still needs UTXO information
        let txin = PlainTxIn {
            previous_output: OutPoint { txid, vout: 7 }.into(),
            script_sig: vec![],
            sequence: 0,
            witness: vec![],
        };
        assert!(matches!(
            InputPair::from_plain(txin, PlainPsbtInput::default(), None),
            Err(InputPairError::InvalidPsbtInput(_))
        ));
    }
}
