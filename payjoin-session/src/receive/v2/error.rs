use core::fmt;
use std::error;

use crate::hpke::HpkeError;
use crate::ohttp::{DirectoryResponseError, OhttpEncapsulationError};
use crate::receive::error::{Error, ProtocolError};

/// A receiver step failed for reasons of the session rather than the payment.
#[derive(Debug)]
pub struct SessionError(pub(crate) InternalSessionError);

impl From<InternalSessionError> for SessionError {
    fn from(value: InternalSessionError) -> Self { SessionError(value) }
}

impl From<InternalSessionError> for Error {
    fn from(e: InternalSessionError) -> Self { Error::Protocol(ProtocolError::V2(e.into())) }
}

impl SessionError {
    /// A directory or relay hiccup. Nothing was recorded, so the request may be made anew.
    pub fn is_transient(&self) -> bool {
        matches!(self.0, InternalSessionError::DirectoryResponse(_))
    }
}

#[derive(Debug)]
pub(crate) enum InternalSessionError {
    ParseUrl(crate::into_url::Error),
    Expired(std::time::SystemTime),
    OhttpEncapsulation(OhttpEncapsulationError),
    /// Message A or B could not be sealed or opened
    Hpke(HpkeError),
    /// Non-2xx status or undecryptable OHTTP response
    DirectoryResponse(DirectoryResponseError),
    /// The sender never gave a key to reply to
    MissingReplyKey,
}

impl From<OhttpEncapsulationError> for Error {
    fn from(e: OhttpEncapsulationError) -> Self {
        InternalSessionError::OhttpEncapsulation(e).into()
    }
}

impl From<HpkeError> for Error {
    fn from(e: HpkeError) -> Self { InternalSessionError::Hpke(e).into() }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use InternalSessionError::*;

        match &self.0 {
            ParseUrl(e) => write!(f, "Bad mailbox URL: {e}"),
            Expired(expiry) => write!(f, "Session expired at {expiry:?}"),
            OhttpEncapsulation(e) => write!(f, "OHTTP failure: {e}"),
            Hpke(e) => write!(f, "Could not seal or open the payjoin message: {e}"),
            DirectoryResponse(e) => write!(f, "Unexpected directory response: {e}"),
            MissingReplyKey => write!(f, "No reply key to encrypt the response to"),
        }
    }
}

impl error::Error for SessionError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        use InternalSessionError::*;

        match &self.0 {
            ParseUrl(e) => Some(e),
            Expired(_) => None,
            OhttpEncapsulation(e) => Some(e),
            Hpke(e) => Some(e),
            DirectoryResponse(e) => Some(e),
            MissingReplyKey => None,
        }
    }
}

/// Error building a receiver session.
#[derive(Debug)]
pub struct ReceiverBuilderError(InternalReceiverBuilderError);

#[derive(Debug)]
pub(crate) enum InternalReceiverBuilderError {
    /// The address does not parse or is for another network
    InvalidAddress(bitcoin::address::ParseError),
    /// The directory is not a usable URL
    IntoUrl(crate::into_url::Error),
}

impl From<InternalReceiverBuilderError> for ReceiverBuilderError {
    fn from(value: InternalReceiverBuilderError) -> Self { ReceiverBuilderError(value) }
}

impl fmt::Display for ReceiverBuilderError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.0 {
            InternalReceiverBuilderError::InvalidAddress(e) => write!(f, "Invalid address: {e}"),
            InternalReceiverBuilderError::IntoUrl(e) => write!(f, "Invalid directory URL: {e}"),
        }
    }
}

impl error::Error for ReceiverBuilderError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.0 {
            InternalReceiverBuilderError::InvalidAddress(e) => Some(e),
            InternalReceiverBuilderError::IntoUrl(e) => Some(e),
        }
    }
}
