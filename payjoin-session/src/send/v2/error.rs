use core::fmt;
use std::time::SystemTime;

use crate::hpke::HpkeError;
use crate::ohttp::{DirectoryResponseError, OhttpEncapsulationError};

/// Error returned when a request to the directory could not be created.
///
/// Apart from expiry this only happens when the session parameters are malformed, so retrying
/// the same session is pointless.
#[derive(Debug)]
pub struct CreateRequestError(InternalCreateRequestError);

#[derive(Debug)]
pub(crate) enum InternalCreateRequestError {
    Url(crate::into_url::Error),
    Hpke(HpkeError),
    OhttpEncapsulation(OhttpEncapsulationError),
    Expired(SystemTime),
}

impl CreateRequestError {
    /// The receiver's endpoint expired. The original PSBT should be broadcast instead.
    pub fn is_expired(&self) -> bool { matches!(self.0, InternalCreateRequestError::Expired(_)) }
}

impl fmt::Display for CreateRequestError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use InternalCreateRequestError::*;

        match &self.0 {
            Url(e) => write!(f, "cannot build the request URL: {e}"),
            Hpke(e) => write!(f, "cannot encrypt the original: {e}"),
            OhttpEncapsulation(e) => write!(f, "cannot encapsulate the request: {e}"),
            Expired(expiry) => write!(f, "session expired at {expiry:?}"),
        }
    }
}

impl std::error::Error for CreateRequestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        use InternalCreateRequestError::*;

        match &self.0 {
            Url(error) => Some(error),
            Hpke(error) => Some(error),
            OhttpEncapsulation(error) => Some(error),
            Expired(_) => None,
        }
    }
}

impl From<InternalCreateRequestError> for CreateRequestError {
    fn from(value: InternalCreateRequestError) -> Self { CreateRequestError(value) }
}

impl From<crate::into_url::Error> for CreateRequestError {
    fn from(value: crate::into_url::Error) -> Self {
        CreateRequestError(InternalCreateRequestError::Url(value))
    }
}

impl From<url::ParseError> for CreateRequestError {
    fn from(value: url::ParseError) -> Self { InternalCreateRequestError::Url(value.into()).into() }
}

/// Error opening what the directory or the receiver sent back.
#[derive(Debug)]
pub struct EncapsulationError(InternalEncapsulationError);

#[derive(Debug)]
pub(crate) enum InternalEncapsulationError {
    /// The receiver's reply did not decrypt with the reply key.
    Hpke(HpkeError),
    /// The directory returned a bad response
    DirectoryResponse(DirectoryResponseError),
}

impl EncapsulationError {
    /// Nothing was recorded. A fresh request may be made.
    pub fn is_transient(&self) -> bool {
        matches!(self.0, InternalEncapsulationError::DirectoryResponse(_))
    }
}

impl fmt::Display for EncapsulationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use InternalEncapsulationError::*;

        match &self.0 {
            Hpke(error) => write!(f, "HPKE error: {error}"),
            DirectoryResponse(e) => write!(f, "Directory response error: {e}"),
        }
    }
}

impl std::error::Error for EncapsulationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        use InternalEncapsulationError::*;

        match &self.0 {
            Hpke(error) => Some(error),
            DirectoryResponse(e) => Some(e),
        }
    }
}

impl From<InternalEncapsulationError> for EncapsulationError {
    fn from(value: InternalEncapsulationError) -> Self { EncapsulationError(value) }
}

impl From<InternalEncapsulationError> for crate::send::ResponseError {
    fn from(value: InternalEncapsulationError) -> Self {
        crate::send::InternalValidationError::V2Encapsulation(value.into()).into()
    }
}
