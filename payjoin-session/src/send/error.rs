use std::fmt;
use std::str::FromStr;

use bitcoin::locktime::absolute::LockTime;
use bitcoin::transaction::Version;
use bitcoin::Sequence;

use crate::error_codes::ErrorCode;

/// Error building a sender session from a PSBT and a payjoin URI.
///
/// The original PSBT or the URI must change before trying again.
#[derive(Debug)]
pub struct BuildSenderError(InternalBuildSenderError);

#[derive(Debug)]
pub(crate) enum InternalBuildSenderError {
    MissingPayjoinEndpoint(crate::uri::v2::PjParamError),
    Expired(std::time::SystemTime),
    InvalidOriginalInput(crate::psbt::PsbtInputsError),
    InconsistentOriginalPsbt(crate::psbt::InconsistentPsbt),
    NoInputs,
    PayeeValueNotEqual,
    NoOutputs,
    MultiplePayeeOutputs,
    MissingPayeeOutput,
    FeeOutputValueLowerThanFeeContribution,
    AmbiguousChangeOutput,
    ChangeIndexOutOfBounds,
    ChangeIndexPointsAtPayee,
    InputWeight(crate::psbt::InputWeightError),
    AddressType(crate::psbt::AddressTypeError),
}

impl From<InternalBuildSenderError> for BuildSenderError {
    fn from(value: InternalBuildSenderError) -> Self { BuildSenderError(value) }
}

impl From<crate::psbt::AddressTypeError> for BuildSenderError {
    fn from(value: crate::psbt::AddressTypeError) -> Self {
        BuildSenderError(InternalBuildSenderError::AddressType(value))
    }
}

impl fmt::Display for BuildSenderError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use InternalBuildSenderError::*;

        match &self.0 {
            MissingPayjoinEndpoint(e) => write!(f, "the URI has no usable v2 payjoin endpoint: {e}"),
            Expired(expiry) => write!(f, "the payjoin endpoint expired at {expiry:?}"),
            InvalidOriginalInput(e) => write!(f, "an input of the original PSBT is invalid: {e}"),
            InconsistentOriginalPsbt(e) => write!(f, "the original PSBT is inconsistent: {e}"),
            NoInputs => write!(f, "the original PSBT has no inputs"),
            PayeeValueNotEqual => write!(f, "the payee output value differs from the amount in the payment link"),
            NoOutputs => write!(f, "the original PSBT has no outputs"),
            MultiplePayeeOutputs => write!(f, "the original PSBT pays the payee more than once"),
            MissingPayeeOutput => write!(f, "the original PSBT does not pay the payee"),
            FeeOutputValueLowerThanFeeContribution => write!(f, "the fee output is worth less than the maximum fee contribution"),
            AmbiguousChangeOutput => write!(f, "more than two outputs, the change output must be given explicitly"),
            ChangeIndexOutOfBounds => write!(f, "the fee output index is out of bounds"),
            ChangeIndexPointsAtPayee => write!(f, "the fee output index points at the payee output"),
            AddressType(e) => write!(f, "cannot determine input address type: {e}"),
            InputWeight(e) => write!(f, "cannot predict input weight: {e}"),
        }
    }
}

impl std::error::Error for BuildSenderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        use InternalBuildSenderError::*;

        match &self.0 {
            MissingPayjoinEndpoint(e) => Some(e),
            InvalidOriginalInput(e) => Some(e),
            InconsistentOriginalPsbt(e) => Some(e),
            AddressType(e) => Some(e),
            InputWeight(e) => Some(e),
            Expired(_)
            | NoInputs
            | PayeeValueNotEqual
            | NoOutputs
            | MultiplePayeeOutputs
            | MissingPayeeOutput
            | FeeOutputValueLowerThanFeeContribution
            | AmbiguousChangeOutput
            | ChangeIndexOutOfBounds
            | ChangeIndexPointsAtPayee => None,
        }
    }
}

/// The receiver's answer could not be accepted.
///
/// Opaque: display it, log it, and keep the fallback transaction ready.
#[derive(Debug)]
pub struct ValidationError(InternalValidationError);

#[derive(Debug)]
pub(crate) enum InternalValidationError {
    /// Neither a PSBT nor a JSON error
    Parse,
    Proposal(InternalProposalError),
    V2Encapsulation(crate::send::v2::EncapsulationError),
}

impl From<InternalValidationError> for ValidationError {
    fn from(value: InternalValidationError) -> Self { ValidationError(value) }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use InternalValidationError::*;

        match &self.0 {
            Parse => write!(f, "couldn't decode as PSBT or JSON"),
            Proposal(e) => write!(f, "proposal PSBT error: {e}"),
            V2Encapsulation(e) => write!(f, "v2 encapsulation error: {e}"),
        }
    }
}

impl std::error::Error for ValidationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        use InternalValidationError::*;

        match &self.0 {
            Parse => None,
            Proposal(e) => Some(e),
            V2Encapsulation(e) => Some(e),
        }
    }
}

/// Ways the proposal PSBT may break the sender's checklist.
#[derive(Debug)]
pub(crate) enum InternalProposalError {
    InvalidAddressType(crate::psbt::AddressTypeError),
    NoInputs,
    PrevTxOut(crate::psbt::PrevTxOutError),
    InputWeight(crate::psbt::InputWeightError),
    VersionsDontMatch { proposed: Version, original: Version },
    LockTimesDontMatch { proposed: LockTime, original: LockTime },
    SenderTxinSequenceChanged { proposed: Sequence, original: Sequence },
    SenderTxinContainsFinalScriptSig,
    SenderTxinContainsFinalScriptWitness,
    TxInContainsKeyPaths,
    ContainsPartialSigs,
    ReceiverTxinNotFinalized,
    ReceiverTxinMissingUtxoInfo,
    MixedSequence,
    MixedInputTypes { proposed: bitcoin::AddressType, original: bitcoin::AddressType },
    MissingOrShuffledInputs,
    TxOutContainsKeyPaths,
    FeeContributionExceedsMaximum,
    DisallowedOutputSubstitution,
    OutputValueDecreased,
    MissingOrShuffledOutputs,
    AbsoluteFeeDecreased,
    PayeeTookContributedFee,
    FeeContributionPaysOutputSizeIncrease,
    FeeRateBelowMinimum,
    AbsurdFee,
    Psbt(bitcoin::psbt::Error),
}

impl From<crate::psbt::AddressTypeError> for InternalProposalError {
    fn from(value: crate::psbt::AddressTypeError) -> Self {
        InternalProposalError::InvalidAddressType(value)
    }
}

impl fmt::Display for InternalProposalError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use InternalProposalError::*;

        match &self {
            InvalidAddressType(e) => write!(f, "invalid input address type: {e}"),
            NoInputs => write!(f, "PSBT doesn't have any inputs"),
            PrevTxOut(e) => write!(f, "missing previous txout information: {e}"),
            InputWeight(e) => write!(f, "can not determine expected input weight: {e}"),
            VersionsDontMatch { proposed, original } => write!(f, "proposed transaction version {proposed} doesn't match the original {original}"),
            LockTimesDontMatch { proposed, original } => write!(f, "proposed transaction lock time {proposed} doesn't match the original {original}"),
            SenderTxinSequenceChanged { proposed, original } => write!(f, "proposed sequence number {proposed} of a sender input doesn't match the original {original}"),
            SenderTxinContainsFinalScriptSig => write!(f, "a sender input of the proposal carries a final script sig"),
            SenderTxinContainsFinalScriptWitness => write!(f, "a sender input of the proposal carries a final script witness"),
            TxInContainsKeyPaths => write!(f, "proposed transaction inputs contain key paths"),
            ContainsPartialSigs => write!(f, "an input of the proposal carries partial signatures"),
            ReceiverTxinNotFinalized => write!(f, "a receiver input of the proposal is not finalized"),
            ReceiverTxinMissingUtxoInfo => write!(f, "a receiver input of the proposal is missing UTXO information"),
            MixedSequence => write!(f, "inputs of the proposal have mixed sequence numbers"),
            MixedInputTypes { proposed, original } => write!(f, "receiver input type {proposed} differs from the sender's {original}"),
            MissingOrShuffledInputs => write!(f, "the proposal is missing sender inputs or reordered them"),
            TxOutContainsKeyPaths => write!(f, "proposed transaction outputs contain key paths"),
            FeeContributionExceedsMaximum => write!(f, "fee contribution exceeds allowed maximum"),
            DisallowedOutputSubstitution => write!(f, "the receiver changed the payee output though substitution is disabled"),
            OutputValueDecreased => write!(f, "the amount of a sender output was decreased"),
            MissingOrShuffledOutputs => write!(f, "the proposal is missing sender outputs or reordered them"),
            AbsoluteFeeDecreased => write!(f, "absolute fee of the proposal is lower than the original"),
            PayeeTookContributedFee => write!(f, "payee tried to take the fee contribution for itself"),
            FeeContributionPaysOutputSizeIncrease => write!(f, "fee contribution pays for additional outputs"),
            FeeRateBelowMinimum => write!(f, "the fee rate of the proposal is below the minimum"),
            AbsurdFee => write!(f, "the proposal claims a fee beyond the money supply"),
            Psbt(e) => write!(f, "psbt error: {e}"),
        }
    }
}

impl std::error::Error for InternalProposalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        use InternalProposalError::*;

        match self {
            InvalidAddressType(e) => Some(e),
            PrevTxOut(e) => Some(e),
            InputWeight(e) => Some(e),
            Psbt(e) => Some(e),
            _ => None,
        }
    }
}

/// What went wrong with the receiver's answer to a poll.
pub enum ResponseError {
    /// The receiver replied with one of the [well-known error codes].
    ///
    /// Its display text is fixed by this crate and may be shown to users.
    ///
    /// [well-known error codes]: https://github.com/bitcoin/bips/blob/master/bip-0078.mediawiki#user-content-Receivers_well_known_errors
    WellKnown(WellKnownError),

    /// The answer was neither an acceptable proposal nor a JSON error.
    Validation(ValidationError),

    /// The receiver replied with an error code outside the well-known set.
    ///
    /// Both fields are receiver-controlled text. Keep them out of user interfaces and only log
    /// them.
    Unrecognized { error_code: String, message: String },
}

impl ResponseError {
    /// Interpret the receiver's JSON error reply.
    pub(crate) fn from_json(json: serde_json::Value) -> Self {
        let message = json
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let Some(error_code) = json.get("errorCode").and_then(|v| v.as_str()) else {
            return InternalValidationError::Parse.into();
        };

        match ErrorCode::from_str(error_code) {
            Ok(code) => {
                let supported_versions = match code {
                    ErrorCode::VersionUnsupported => json
                        .get("supported")
                        .and_then(|v| v.as_array())
                        .map(|versions| versions.iter().filter_map(|v| v.as_u64()).collect()),
                    _ => None,
                };
                ResponseError::WellKnown(WellKnownError { code, message, supported_versions })
            }
            Err(_) => ResponseError::Unrecognized { error_code: error_code.to_string(), message },
        }
    }

    /// Parse a response body that should hold a JSON error reply.
    pub(crate) fn parse(response: &str) -> Self {
        match serde_json::from_str(response) {
            Ok(json) => Self::from_json(json),
            Err(_) => InternalValidationError::Parse.into(),
        }
    }
}

impl std::error::Error for ResponseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        use ResponseError::*;

        match self {
            WellKnown(error) => Some(error),
            Validation(error) => Some(error),
            Unrecognized { .. } => None,
        }
    }
}

impl From<InternalValidationError> for ResponseError {
    fn from(value: InternalValidationError) -> Self { Self::Validation(ValidationError(value)) }
}

impl From<InternalProposalError> for ResponseError {
    fn from(value: InternalProposalError) -> Self {
        ResponseError::Validation(ValidationError(InternalValidationError::Proposal(value)))
    }
}

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::WellKnown(e) => e.fmt(f),
            Self::Validation(e) => write!(f, "The receiver sent an invalid response: {e}"),

            // Do NOT display unrecognized errors to end users, only debug logs
            Self::Unrecognized { .. } => write!(f, "The receiver sent an unrecognized error."),
        }
    }
}

impl fmt::Debug for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::WellKnown(e) => {
                let json = serde_json::json!({
                    "errorCode": e.code.to_string(),
                    "message": e.message
                });
                write!(f, "Well known error: {json}")
            }
            Self::Validation(e) => write!(f, "Validation({e:?})"),
            Self::Unrecognized { error_code, message } => {
                let json = serde_json::json!({
                    "errorCode": error_code,
                    "message": message
                });
                write!(f, "Unrecognized error: {json}")
            }
        }
    }
}

/// A well-known error that can be safely displayed to end users.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WellKnownError {
    pub(crate) code: ErrorCode,
    pub(crate) message: String,
    pub(crate) supported_versions: Option<Vec<u64>>,
}

impl WellKnownError {
    pub fn code(&self) -> ErrorCode { self.code }

    /// The receiver's own words. Only meant for debug logs.
    pub fn message(&self) -> &str { &self.message }
}

impl std::error::Error for WellKnownError {}

impl fmt::Display for WellKnownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            ErrorCode::Unavailable => write!(f, "The payjoin endpoint is not available for now."),
            ErrorCode::NotEnoughMoney => write!(f, "The receiver added some inputs but could not bump the fee of the payjoin proposal."),
            ErrorCode::VersionUnsupported => match &self.supported_versions {
                Some(supported) =>
                    write!(f, "This version of payjoin is not supported. Use version {supported:?}."),
                None => write!(f, "This version of payjoin is not supported."),
            },
            ErrorCode::OriginalPsbtRejected => write!(f, "The receiver rejected the original PSBT."),
        }
    }
}
