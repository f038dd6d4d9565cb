use std::{error, fmt};

use crate::error_codes::ErrorCode::{
    self, NotEnoughMoney, OriginalPsbtRejected, Unavailable, VersionUnsupported,
};

/// The top-level error type for the payjoin receiver
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// The sender's request or the proposal under construction breaks the protocol.
    ///
    /// Sessions rejected this way owe the sender a [`JsonReply`].
    Protocol(ProtocolError),
    /// A callback into the receiver's wallet failed, e.g. a node or database error.
    ///
    /// A callback that cannot answer is taken as a refusal: the session ends and the sender is
    /// told the receiver is unavailable. `step` names the check the callback was serving.
    Implementation { step: RejectionKind, source: crate::ImplementationError },
}

impl Error {
    pub(crate) fn implementation(step: RejectionKind, source: crate::ImplementationError) -> Self {
        Error::Implementation { step, source }
    }

    /// The check that rejected the session, whether by policy or because its callback failed.
    pub fn kind(&self) -> RejectionKind {
        match self {
            Error::Protocol(e) => e.kind(),
            Error::Implementation { step, .. } => *step,
        }
    }
}

impl From<&Error> for JsonReply {
    fn from(e: &Error) -> Self {
        match e {
            Error::Protocol(e) => e.into(),
            Error::Implementation { .. } => JsonReply::new(Unavailable, "Receiver error"),
        }
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self { Error::Protocol(e) }
}

impl From<InternalPayloadError> for Error {
    fn from(e: InternalPayloadError) -> Self {
        Error::Protocol(ProtocolError::OriginalPayload(e.into()))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Protocol(e) => write!(f, "Protocol error: {e}"),
            Error::Implementation { step, source } =>
                write!(f, "Implementation error during {step:?}: {source}"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Protocol(e) => Some(e),
            Error::Implementation { source, .. } => Some(source.as_ref()),
        }
    }
}

/// A protocol failure of the receiver session.
#[derive(Debug)]
pub enum ProtocolError {
    /// The original PSBT or the proposal built from it was rejected
    OriginalPayload(PayloadError),
    /// The session itself failed: it expired, or a message could not be opened
    V2(super::v2::SessionError),
}

impl ProtocolError {
    /// Which policy rejected the session.
    pub fn kind(&self) -> RejectionKind {
        match self {
            ProtocolError::OriginalPayload(e) => e.kind(),
            ProtocolError::V2(_) => RejectionKind::Session,
        }
    }
}

/// Why a receiver session was rejected, for hosts that branch on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum RejectionKind {
    /// The original PSBT or its parameters are malformed, or it cannot be broadcast
    OriginalPsbtRejected,
    /// The sender asked for a protocol version this receiver does not speak
    VersionUnsupported,
    /// The original PSBT pays less than the receiver's minimum fee rate
    FeeTooLow,
    /// The original PSBT spends an output of the receiver
    InputOwned,
    /// An input of the original PSBT was offered before
    InputSeenBefore,
    /// The original PSBT does not pay the receiver
    NoReceiverOutput,
    /// The receiver cannot pay its share of the fee within its fee range
    FeeRangeUnsatisfiable,
    /// The wallet did not finalize the receiver's inputs
    WalletSigningFailed,
    /// The session expired or its messages could not be processed
    Session,
}

/// The standard format for errors that can be replied as JSON.
///
/// ```json
/// {
///     "errorCode": "original-psbt-rejected",
///     "message": "Human readable error message"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct JsonReply {
    error_code: ErrorCode,
    /// Only meant for the sender's debug logs
    message: String,
    extra: serde_json::Map<String, serde_json::Value>,
}

impl JsonReply {
    pub(crate) fn new(error_code: ErrorCode, message: impl fmt::Display) -> Self {
        Self { error_code, message: message.to_string(), extra: serde_json::Map::new() }
    }

    /// Add an additional field to the JSON response
    pub fn with_extra(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }

    pub fn error_code(&self) -> ErrorCode { self.error_code }

    pub fn message(&self) -> &str { &self.message }

    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        map.insert("errorCode".to_string(), self.error_code.to_string().into());
        map.insert("message".to_string(), self.message.clone().into());
        map.extend(self.extra.clone());

        serde_json::Value::Object(map)
    }

    /// The HTTP status a BIP 78 endpoint would answer with
    pub fn status_code(&self) -> u16 {
        match self.error_code {
            ErrorCode::Unavailable => http::StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::NotEnoughMoney
            | ErrorCode::VersionUnsupported
            | ErrorCode::OriginalPsbtRejected => http::StatusCode::BAD_REQUEST,
        }
        .as_u16()
    }
}

impl From<&ProtocolError> for JsonReply {
    fn from(e: &ProtocolError) -> Self {
        match e {
            ProtocolError::OriginalPayload(e) => e.into(),
            ProtocolError::V2(_) => JsonReply::new(Unavailable, "Receiver error"),
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self {
            Self::OriginalPayload(e) => e.fmt(f),
            Self::V2(e) => e.fmt(f),
        }
    }
}

impl error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self {
            Self::OriginalPayload(e) => e.source(),
            Self::V2(e) => e.source(),
        }
    }
}

/// The original PSBT, or the proposal built from it, was rejected.
#[derive(Debug)]
pub struct PayloadError(pub(crate) InternalPayloadError);

impl From<InternalPayloadError> for PayloadError {
    fn from(value: InternalPayloadError) -> Self { PayloadError(value) }
}

impl PayloadError {
    pub fn kind(&self) -> RejectionKind {
        use InternalPayloadError::*;

        match &self.0 {
            SenderParams(super::optional_parameters::Error::UnknownVersion { .. }) =>
                RejectionKind::VersionUnsupported,
            Utf8(_)
            | ParsePsbt(_)
            | SenderParams(_)
            | InconsistentPsbt(_)
            | PrevTxOut(_)
            | AbsurdFee(_)
            | OriginalPsbtNotBroadcastable => RejectionKind::OriginalPsbtRejected,
            PsbtBelowFeeRate(_, _) => RejectionKind::FeeTooLow,
            InputOwned(_) => RejectionKind::InputOwned,
            InputSeen(_) => RejectionKind::InputSeenBefore,
            MissingPayment => RejectionKind::NoReceiverOutput,
            FeeTooHigh(_, _) | FeeOverflow(_, _) | DrainOutputTooSmall { .. } =>
                RejectionKind::FeeRangeUnsatisfiable,
            ReceiverInputNotFinalized(_) | WalletFailed(_) | WalletAlteredProposal { .. } =>
                RejectionKind::WalletSigningFailed,
        }
    }
}

#[derive(Debug)]
pub(crate) enum InternalPayloadError {
    Utf8(std::str::Utf8Error),
    ParsePsbt(bitcoin::psbt::PsbtParseError),
    SenderParams(super::optional_parameters::Error),
    /// Unsigned tx and PSBT maps disagree
    InconsistentPsbt(crate::psbt::InconsistentPsbt),
    /// An input has no spent output attached
    PrevTxOut(crate::psbt::PrevTxOutError),
    /// No output pays the receiver
    MissingPayment,
    /// Rejected by the broadcast callback
    OriginalPsbtNotBroadcastable,
    /// The spent outputs claim more than the money supply
    AbsurdFee(bitcoin::Amount),
    /// The sender spends a script owned by the receiver
    InputOwned(bitcoin::ScriptBuf),
    /// An outpoint offered in an earlier session; a sign of probing
    InputSeen(bitcoin::OutPoint),
    /// (original fee rate, receiver minimum)
    PsbtBelowFeeRate(bitcoin::FeeRate, bitcoin::FeeRate),
    /// (fee rate the receiver would pay, receiver maximum)
    FeeTooHigh(bitcoin::FeeRate, bitcoin::FeeRate),
    /// The added weight cannot be priced at the minimum rate without overflowing
    FeeOverflow(bitcoin::Weight, bitcoin::FeeRate),
    /// The receiver's drain output is worth less than the fee it has to pay
    DrainOutputTooSmall { fee: bitcoin::Amount, available: bitcoin::Amount },
    /// The wallet returned the proposal with this receiver input unsigned
    ReceiverInputNotFinalized(usize),
    /// The wallet failed to process the proposal
    WalletFailed(crate::ImplementationError),
    /// The wallet changed the transaction it was asked to sign
    WalletAlteredProposal {
        expected: bitcoin::hashes::sha256d::Hash,
        actual: bitcoin::hashes::sha256d::Hash,
    },
}

impl From<&PayloadError> for JsonReply {
    fn from(e: &PayloadError) -> Self {
        use InternalPayloadError::*;

        match &e.0 {
            Utf8(_)
            | ParsePsbt(_)
            | InconsistentPsbt(_)
            | PrevTxOut(_)
            | MissingPayment
            | OriginalPsbtNotBroadcastable
            | AbsurdFee(_)
            | InputOwned(_)
            | InputSeen(_)
            | PsbtBelowFeeRate(_, _) => JsonReply::new(OriginalPsbtRejected, e),

            FeeTooHigh(_, _) | FeeOverflow(_, _) | DrainOutputTooSmall { .. } =>
                JsonReply::new(NotEnoughMoney, e),

            ReceiverInputNotFinalized(_) | WalletFailed(_) | WalletAlteredProposal { .. } =>
                JsonReply::new(Unavailable, "Receiver error"),

            SenderParams(e) => match e {
                super::optional_parameters::Error::UnknownVersion { supported_versions } => {
                    let supported: Vec<u8> =
                        supported_versions.iter().map(|v| *v as u8).collect();
                    JsonReply::new(VersionUnsupported, "This version of payjoin is not supported.")
                        .with_extra("supported", supported)
                }
                super::optional_parameters::Error::FeeRate =>
                    JsonReply::new(OriginalPsbtRejected, e),
            },
        }
    }
}

impl fmt::Display for PayloadError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result { self.0.fmt(f) }
}

impl fmt::Display for InternalPayloadError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use InternalPayloadError::*;

        match &self {
            Utf8(e) => write!(f, "{e}"),
            ParsePsbt(e) => write!(f, "{e}"),
            SenderParams(e) => write!(f, "{e}"),
            InconsistentPsbt(e) => write!(f, "{e}"),
            PrevTxOut(e) => write!(f, "Bad spent output: {e}"),
            MissingPayment => write!(f, "The original PSBT does not pay the receiver."),
            OriginalPsbtNotBroadcastable =>
                write!(f, "The original PSBT would not be accepted for broadcast."),
            AbsurdFee(fee) => write!(f, "The original PSBT claims an impossible fee of {fee}."),
            // Owned and seen inputs share a message so a probing sender learns nothing.
            InputOwned(_) | InputSeen(_) => write!(f, "The receiver rejected the original PSBT."),
            PsbtBelowFeeRate(actual, min) =>
                write!(f, "Original PSBT pays {actual}, the receiver asks for at least {min}."),
            FeeTooHigh(needed, max) =>
                write!(f, "Receiver fee share needs {needed}, above the maximum of {max}"),
            FeeOverflow(weight, fee_rate) =>
                write!(f, "Cannot price {weight} of receiver contributions at {fee_rate}"),
            DrainOutputTooSmall { fee, available } => write!(
                f,
                "The receiver output cannot pay its fee share: {fee} > {available}"
            ),
            ReceiverInputNotFinalized(index) =>
                write!(f, "The receiver input at index {index} was not finalized by the wallet"),
            WalletFailed(e) => write!(f, "The wallet failed to sign the proposal: {e}"),
            WalletAlteredProposal { expected, actual } =>
                write!(f, "Ntxid mismatch: expected {expected}, got {actual}"),
        }
    }
}

impl std::error::Error for PayloadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        use InternalPayloadError::*;

        match &self.0 {
            Utf8(e) => Some(e),
            ParsePsbt(e) => Some(e),
            SenderParams(e) => Some(e),
            InconsistentPsbt(e) => Some(e),
            PrevTxOut(e) => Some(e),
            PsbtBelowFeeRate(_, _) => None,
            FeeTooHigh(_, _) => None,
            FeeOverflow(_, _) => None,
            DrainOutputTooSmall { .. } => None,
            MissingPayment => None,
            OriginalPsbtNotBroadcastable => None,
            AbsurdFee(_) => None,
            InputOwned(_) => None,
            InputSeen(_) => None,
            ReceiverInputNotFinalized(_) => None,
            WalletFailed(e) => Some(e.as_ref()),
            WalletAlteredProposal { .. } => None,
        }
    }
}

/// The replacement outputs passed to `replace_receiver_outputs` were refused.
#[derive(Debug, PartialEq)]
pub struct OutputSubstitutionError(InternalOutputSubstitutionError);

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum InternalOutputSubstitutionError {
    DecreasedValueWhenDisabled,
    ScriptPubKeyChangedWhenDisabled,
    /// Fewer replacement outputs than receiver outputs
    NotEnoughOutputs,
    /// The drain script is not among the replacements
    InvalidDrainScript,
}

impl fmt::Display for OutputSubstitutionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use InternalOutputSubstitutionError::*;

        match &self.0 {
            DecreasedValueWhenDisabled =>
                write!(f, "The sender disabled output substitution; the payment cannot shrink"),
            ScriptPubKeyChangedWhenDisabled =>
                write!(f, "The sender disabled output substitution; the payee script is fixed"),
            NotEnoughOutputs => write!(f, "Replacement outputs must cover every receiver output"),
            InvalidDrainScript => write!(f, "No replacement output pays to the drain script"),
        }
    }
}

impl From<InternalOutputSubstitutionError> for OutputSubstitutionError {
    fn from(value: InternalOutputSubstitutionError) -> Self { OutputSubstitutionError(value) }
}

impl std::error::Error for OutputSubstitutionError {}

/// No receiver input could be picked from the candidates.
#[derive(Debug, PartialEq, Eq)]
pub struct SelectionError(InternalSelectionError);

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum InternalSelectionError {
    Empty,
    /// Only two-output transactions are handled
    UnsupportedOutputLength,
    NotFound,
}

impl fmt::Display for SelectionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.0 {
            InternalSelectionError::Empty => write!(f, "No candidate inputs were given"),
            InternalSelectionError::UnsupportedOutputLength =>
                write!(f, "Input selection needs a transaction with exactly two outputs"),
            InternalSelectionError::NotFound =>
                write!(f, "None of the candidate inputs hides the payment amount"),
        }
    }
}

impl error::Error for SelectionError {}

impl From<InternalSelectionError> for SelectionError {
    fn from(value: InternalSelectionError) -> Self { SelectionError(value) }
}

/// Contributed inputs were refused.
#[derive(Debug, PartialEq, Eq)]
pub struct InputContributionError(InternalInputContributionError);

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum InternalInputContributionError {
    /// Inputs are worth less than the outputs they must fund
    ValueTooLow,
    /// Inputs, or the drain output they fund, exceed the money supply
    ValueTooHigh,
    DuplicateInput(bitcoin::OutPoint),
}

impl fmt::Display for InputContributionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.0 {
            InternalInputContributionError::ValueTooLow =>
                write!(f, "Contributed inputs do not cover the added output value"),
            InternalInputContributionError::ValueTooHigh =>
                write!(f, "Contributed inputs are worth more than the money supply"),
            InternalInputContributionError::DuplicateInput(outpoint) =>
                write!(f, "{outpoint} is already spent by the proposal"),
        }
    }
}

impl error::Error for InputContributionError {}

impl From<InternalInputContributionError> for InputContributionError {
    fn from(value: InternalInputContributionError) -> Self { InputContributionError(value) }
}
