//! Error codes a receiver may reply with, shared by BIP 78 and BIP 77.

use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum ErrorCode {
    /// The receiver cannot process the request right now.
    Unavailable,
    /// The receiver cannot pay for the fee the proposal requires.
    NotEnoughMoney,
    /// The sender asked for a protocol version the receiver does not speak.
    VersionUnsupported,
    /// The receiver refused the original PSBT.
    OriginalPsbtRejected,
}

impl ErrorCode {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Unavailable => "unavailable",
            ErrorCode::NotEnoughMoney => "not-enough-money",
            ErrorCode::VersionUnsupported => "version-unsupported",
            ErrorCode::OriginalPsbtRejected => "original-psbt-rejected",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownErrorCode(pub String);

impl fmt::Display for UnknownErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown error code `{}`", self.0)
    }
}

impl std::error::Error for UnknownErrorCode {}

impl FromStr for ErrorCode {
    type Err = UnknownErrorCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            ErrorCode::Unavailable,
            ErrorCode::NotEnoughMoney,
            ErrorCode::VersionUnsupported,
            ErrorCode::OriginalPsbtRejected,
        ]
        .into_iter()
        .find(|code| code.as_str() == s)
        .ok_or_else(|| UnknownErrorCode(s.to_owned()))
    }
}

impl From<ErrorCode> for String {
    fn from(code: ErrorCode) -> Self { code.as_str().to_owned() }
}

impl TryFrom<String> for ErrorCode {
    type Error = UnknownErrorCode;

    fn try_from(s: String) -> Result<Self, Self::Error> { s.parse() }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn codes_parse_from_their_wire_form() {
        for code in [
            ErrorCode::Unavailable,
            ErrorCode::NotEnoughMoney,
            ErrorCode::VersionUnsupported,
            ErrorCode::OriginalPsbtRejected,
        ] {
            assert_eq!(code.to_string().parse::<ErrorCode>(), Ok(code));
        }
        assert!("teapot".parse::<ErrorCode>().is_err());
    }
}
