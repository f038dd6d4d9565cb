//! Uppercase, checksum-free bech32 used for the compact fields of v2 payjoin URIs.
//!
//! Uppercase keeps QR codes in alphanumeric mode.

use std::fmt;

use bitcoin::bech32::primitives::decode::{CheckedHrpstring, CheckedHrpstringError};
use bitcoin::bech32::{self, EncodeError, Hrp, NoChecksum};

pub(crate) fn decode(encoded: &str) -> Result<(Hrp, Vec<u8>), CheckedHrpstringError> {
    let parsed = CheckedHrpstring::new::<NoChecksum>(encoded)?;
    Ok((parsed.hrp(), parsed.byte_iter().collect()))
}

pub(crate) fn encode(hrp: Hrp, data: &[u8]) -> Result<String, EncodeError> {
    bech32::encode_upper::<NoChecksum>(hrp, data)
}

pub(crate) fn encode_to_fmt(
    f: &mut fmt::Formatter,
    hrp: Hrp,
    data: &[u8],
) -> Result<(), EncodeError> {
    bech32::encode_upper_to_fmt::<NoChecksum, fmt::Formatter>(f, hrp, data)
}
