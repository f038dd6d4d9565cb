use std::fmt;

/// The `pj` or `pjos` parameter of a payment URI is unusable.
#[derive(Debug)]
pub struct PjParseError(pub(crate) InternalPjParseError);

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum InternalPjParseError {
    BadPjOs,
    DuplicateParams(&'static str),
    MissingEndpoint,
    NotUtf8,
    IntoUrl(crate::into_url::Error),
    UnsecureEndpoint,
    LowercaseFragment,
}

impl From<InternalPjParseError> for PjParseError {
    fn from(value: InternalPjParseError) -> Self { PjParseError(value) }
}

impl fmt::Display for PjParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use InternalPjParseError::*;

        match &self.0 {
            BadPjOs => write!(f, "pjos must be 0 or 1"),
            DuplicateParams(param) => write!(f, "Parameter '{param}' given more than once"),
            MissingEndpoint => write!(f, "No pj parameter"),
            NotUtf8 => write!(f, "Endpoint is not valid UTF-8"),
            IntoUrl(e) => write!(f, "Endpoint is not a valid URL: {e}"),
            UnsecureEndpoint => write!(f, "Endpoint must use https or be an onion address"),
            LowercaseFragment => write!(f, "Endpoint fragment must be uppercase"),
        }
    }
}

impl std::error::Error for PjParseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.0 {
            InternalPjParseError::IntoUrl(e) => Some(e),
            _ => None,
        }
    }
}
