//! The v2 parameters carried in the fragment of a `pj` endpoint.
//!
//! A v2 endpoint looks like `https://directory/ID#EX1…-OH1…-RK1…`: the mailbox id in the path
//! and, in the fragment, the expiry, the directory's OHTTP keys and the receiver's session key.
//! Each fragment parameter is uppercase bech32 without a checksum so the whole URI stays in QR
//! alphanumeric mode.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bitcoin::bech32::Hrp;
use url::Url;

use crate::directory::ShortId;
use crate::hpke::HpkePublicKey;
use crate::ohttp::OhttpKeys;

const RK_HRP: &str = "RK";
const EX_HRP: &str = "EX";

/// Read and write the fragment parameters of a v2 endpoint.
pub(crate) trait UrlExt {
    fn receiver_pubkey(&self) -> Result<HpkePublicKey, ParseReceiverPubkeyParamError>;
    fn set_receiver_pubkey(&mut self, pubkey: &HpkePublicKey);
    fn ohttp(&self) -> Result<OhttpKeys, ParseOhttpKeysParamError>;
    fn set_ohttp(&mut self, ohttp: &OhttpKeys);
    fn exp(&self) -> Result<SystemTime, ParseExpParamError>;
    fn set_exp(&mut self, exp: SystemTime);
}

impl UrlExt for Url {
    fn receiver_pubkey(&self) -> Result<HpkePublicKey, ParseReceiverPubkeyParamError> {
        let value = get_param(self, "RK1")
            .map_err(ParseReceiverPubkeyParamError::InvalidFragment)?
            .ok_or(ParseReceiverPubkeyParamError::MissingPubkey)?;
        let (hrp, bytes) = crate::bech32::decode(value)
            .map_err(|_| ParseReceiverPubkeyParamError::InvalidFormat)?;
        if hrp.as_str() != RK_HRP {
            return Err(ParseReceiverPubkeyParamError::InvalidFormat);
        }
        HpkePublicKey::from_compressed_bytes(&bytes)
            .map_err(ParseReceiverPubkeyParamError::InvalidPubkey)
    }

    fn set_receiver_pubkey(&mut self, pubkey: &HpkePublicKey) {
        if let Some(param) = encode_param(RK_HRP, &pubkey.to_compressed_bytes()) {
            set_param(self, &param)
        }
    }

    fn ohttp(&self) -> Result<OhttpKeys, ParseOhttpKeysParamError> {
        let value = get_param(self, "OH1")
            .map_err(ParseOhttpKeysParamError::InvalidFragment)?
            .ok_or(ParseOhttpKeysParamError::MissingOhttpKeys)?;
        OhttpKeys::from_str(value).map_err(ParseOhttpKeysParamError::InvalidOhttpKeys)
    }

    fn set_ohttp(&mut self, ohttp: &OhttpKeys) { set_param(self, &ohttp.to_string()) }

    fn exp(&self) -> Result<SystemTime, ParseExpParamError> {
        let value = get_param(self, "EX1")
            .map_err(ParseExpParamError::InvalidFragment)?
            .ok_or(ParseExpParamError::MissingExp)?;
        let (hrp, bytes) =
            crate::bech32::decode(value).map_err(|_| ParseExpParamError::InvalidFormat)?;
        if hrp.as_str() != EX_HRP {
            return Err(ParseExpParamError::InvalidFormat);
        }
        let timestamp: [u8; 4] =
            bytes.as_slice().try_into().map_err(|_| ParseExpParamError::InvalidExp(bytes.len()))?;
        Ok(UNIX_EPOCH + Duration::from_secs(u32::from_le_bytes(timestamp).into()))
    }

    fn set_exp(&mut self, exp: SystemTime) {
        // Clamp to what fits in the u32 consensus encoding
        let secs = exp.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
        let secs = u32::try_from(secs).unwrap_or(u32::MAX);
        if let Some(param) = encode_param(EX_HRP, &secs.to_le_bytes()) {
            set_param(self, &param)
        }
    }
}

fn encode_param(hrp: &str, data: &[u8]) -> Option<String> {
    let hrp = Hrp::parse(hrp).ok()?;
    crate::bech32::encode(hrp, data).ok()
}

/// The fragment delimiter. `+` is still accepted from older URIs but never mixed with `-`.
fn check_fragment_delimiter(fragment: &str) -> Result<char, ParseFragmentError> {
    // Stricter than bech32 since lowercase is not allowed
    if let Some(c) = fragment
        .chars()
        .find(|c| !(c.is_ascii_digit() || c.is_ascii_uppercase() || *c == '-' || *c == '+'))
    {
        return Err(ParseFragmentError::InvalidChar(c));
    }

    match (fragment.contains('-'), fragment.contains('+')) {
        (true, true) => Err(ParseFragmentError::AmbiguousDelimiter),
        (false, true) => Ok('+'),
        _ => Ok('-'),
    }
}

fn get_param<'a>(url: &'a Url, prefix: &str) -> Result<Option<&'a str>, ParseFragmentError> {
    let Some(fragment) = url.fragment() else { return Ok(None) };
    let delim = check_fragment_delimiter(fragment)?;
    // Parameters are written in lexicographic order, but any order is read
    Ok(fragment.split(delim).find(|param| param.starts_with(prefix)))
}

/// Insert or replace the parameter with the same HRP, writing the fragment back sorted and
/// `-` delimited.
fn set_param(url: &mut Url, new_param: &str) {
    let fragment = url.fragment().unwrap_or_default().to_owned();
    let mut params = fragment
        .split(['-', '+'])
        .filter(|param| !param.is_empty())
        .map(|param| (param.split('1').next().unwrap_or(param), param))
        .collect::<BTreeMap<&str, &str>>();
    params.insert(new_param.split('1').next().unwrap_or(new_param), new_param);

    let fragment = params.into_values().collect::<Vec<_>>().join("-");
    url.set_fragment(Some(&fragment));
}

/// The receiver parameters of a v2 endpoint, as needed by a sender.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PjParam {
    directory: Url,
    id: ShortId,
    expiration: SystemTime,
    ohttp_keys: OhttpKeys,
    receiver_pubkey: HpkePublicKey,
}

impl PjParam {
    pub(crate) fn new(
        directory: Url,
        id: ShortId,
        expiration: SystemTime,
        ohttp_keys: OhttpKeys,
        receiver_pubkey: HpkePublicKey,
    ) -> Self {
        Self { directory, id, expiration, ohttp_keys, receiver_pubkey }
    }

    /// Split a `pj` endpoint into directory, mailbox id and fragment parameters.
    pub fn parse(endpoint: &Url) -> Result<Self, PjParamError> {
        let path = endpoint.path().trim_end_matches('/');
        let (base, last) = path.rsplit_once('/').ok_or(PjParamError::NotV2)?;
        let id = ShortId::from_str(last).map_err(|_| PjParamError::NotV2)?;
        let mut directory = endpoint.clone();
        directory.set_fragment(None);
        directory.set_query(None);
        directory.set_path(&format!("{base}/"));

        let receiver_pubkey =
            endpoint.receiver_pubkey().map_err(PjParamError::InvalidReceiverPubkey)?;
        let ohttp_keys = endpoint.ohttp().map_err(PjParamError::InvalidOhttpKeys)?;
        let expiration = endpoint.exp().map_err(PjParamError::InvalidExp)?;
        Ok(Self::new(directory, id, expiration, ohttp_keys, receiver_pubkey))
    }

    /// The receiver's session key. Callers may check it was not seen in an earlier session.
    pub fn receiver_pubkey(&self) -> &HpkePublicKey { &self.receiver_pubkey }

    pub fn expiration(&self) -> SystemTime { self.expiration }

    pub fn directory(&self) -> &Url { &self.directory }

    pub(crate) fn ohttp_keys(&self) -> &OhttpKeys { &self.ohttp_keys }

    /// The receiver's mailbox, without fragment.
    pub(crate) fn mailbox(&self) -> Result<Url, url::ParseError> {
        self.directory.join(&self.id.to_string())
    }

    /// The full endpoint, with its fragment parameters.
    pub fn endpoint(&self) -> Result<Url, url::ParseError> {
        let mut endpoint = self.mailbox()?;
        endpoint.set_receiver_pubkey(&self.receiver_pubkey);
        endpoint.set_ohttp(&self.ohttp_keys);
        endpoint.set_exp(self.expiration);
        Ok(endpoint)
    }
}

#[derive(Debug)]
pub enum ParseFragmentError {
    InvalidChar(char),
    AmbiguousDelimiter,
}

impl fmt::Display for ParseFragmentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            Self::InvalidChar(c) => write!(f, "invalid character: {c} (must be uppercase)"),
            Self::AmbiguousDelimiter =>
                write!(f, "ambiguous fragment delimiter (both + and - found)"),
        }
    }
}

impl std::error::Error for ParseFragmentError {}

/// The endpoint is not a complete v2 endpoint.
#[derive(Debug)]
pub enum PjParamError {
    /// No mailbox id in the path.
    NotV2,
    InvalidReceiverPubkey(ParseReceiverPubkeyParamError),
    InvalidOhttpKeys(ParseOhttpKeysParamError),
    InvalidExp(ParseExpParamError),
}

impl fmt::Display for PjParamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            PjParamError::NotV2 => write!(f, "URL is not a valid v2 URL"),
            PjParamError::InvalidReceiverPubkey(e) => write!(f, "invalid receiver pubkey: {e}"),
            PjParamError::InvalidOhttpKeys(e) => write!(f, "invalid ohttp keys: {e}"),
            PjParamError::InvalidExp(e) => write!(f, "invalid exp: {e}"),
        }
    }
}

impl std::error::Error for PjParamError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self {
            PjParamError::NotV2 => None,
            PjParamError::InvalidReceiverPubkey(e) => Some(e),
            PjParamError::InvalidOhttpKeys(e) => Some(e),
            PjParamError::InvalidExp(e) => Some(e),
        }
    }
}

#[derive(Debug)]
pub enum ParseOhttpKeysParamError {
    MissingOhttpKeys,
    InvalidOhttpKeys(crate::ohttp::ParseOhttpKeysError),
    InvalidFragment(ParseFragmentError),
}

impl fmt::Display for ParseOhttpKeysParamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use ParseOhttpKeysParamError::*;

        match &self {
            MissingOhttpKeys => write!(f, "ohttp keys are missing"),
            InvalidOhttpKeys(o) => write!(f, "invalid ohttp keys: {o}"),
            InvalidFragment(e) => write!(f, "invalid URL fragment: {e}"),
        }
    }
}

impl std::error::Error for ParseOhttpKeysParamError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        use ParseOhttpKeysParamError::*;

        match &self {
            MissingOhttpKeys => None,
            InvalidOhttpKeys(e) => Some(e),
            InvalidFragment(e) => Some(e),
        }
    }
}

#[derive(Debug)]
pub enum ParseExpParamError {
    MissingExp,
    InvalidFormat,
    /// Not a 4 byte timestamp.
    InvalidExp(usize),
    InvalidFragment(ParseFragmentError),
}

impl fmt::Display for ParseExpParamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use ParseExpParamError::*;

        match &self {
            MissingExp => write!(f, "exp is missing"),
            InvalidFormat => write!(f, "invalid format"),
            InvalidExp(len) => write!(f, "exp param holds {len} bytes instead of a u32 timestamp"),
            InvalidFragment(e) => write!(f, "invalid URL fragment: {e}"),
        }
    }
}

impl std::error::Error for ParseExpParamError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self {
            ParseExpParamError::InvalidFragment(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum ParseReceiverPubkeyParamError {
    MissingPubkey,
    InvalidFormat,
    InvalidPubkey(crate::hpke::HpkeError),
    InvalidFragment(ParseFragmentError),
}

impl fmt::Display for ParseReceiverPubkeyParamError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use ParseReceiverPubkeyParamError::*;

        match &self {
            MissingPubkey => write!(f, "receiver public key is missing"),
            InvalidFormat => write!(f, "invalid format"),
            InvalidPubkey(e) =>
                write!(f, "receiver public key does not represent a valid pubkey: {e}"),
            InvalidFragment(e) => write!(f, "invalid URL fragment: {e}"),
        }
    }
}

impl std::error::Error for ParseReceiverPubkeyParamError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        use ParseReceiverPubkeyParamError::*;

        match &self {
            MissingPubkey | InvalidFormat => None,
            InvalidPubkey(error) => Some(error),
            InvalidFragment(error) => Some(error),
        }
    }
}
