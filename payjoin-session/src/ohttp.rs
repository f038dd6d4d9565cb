//! Oblivious HTTP wrapping of every request to the directory.
//!
//! The directory is only ever reached through a relay. Requests are BHTTP messages sealed to the
//! directory's OHTTP key, padded so that every message on the wire is exactly
//! [`ENCAPSULATED_MESSAGE_BYTES`] long. Responses are opened with the single-use
//! [`ohttp::ClientResponse`] produced alongside the request.

use std::fmt::{self, Write};
use std::ops::{Deref, DerefMut};
use std::str::FromStr;
use std::sync::Mutex;
use std::{error, io};

use bitcoin::bech32::Hrp;
use bitcoin::secp256k1;

use crate::directory::ENCAPSULATED_MESSAGE_BYTES;

const N_ENC: usize = 65;
const N_T: usize = 16;
const OHTTP_REQ_HEADER_BYTES: usize = 7;
/// Bytes left for the BHTTP request once the OHTTP header, encapsulated key and tag are counted.
pub const PADDED_BHTTP_REQ_BYTES: usize =
    ENCAPSULATED_MESSAGE_BYTES - (N_ENC + N_T + OHTTP_REQ_HEADER_BYTES);
/// Response nonce plus AEAD tag.
const OHTTP_RES_OVERHEAD: usize = 32 + N_T;
/// Bytes left for the BHTTP response inside a full size OHTTP response.
pub const PADDED_BHTTP_RES_BYTES: usize = ENCAPSULATED_MESSAGE_BYTES - OHTTP_RES_OVERHEAD;

/// Seal a BHTTP request for `target_resource` to the directory's OHTTP key.
pub(crate) fn ohttp_encapsulate(
    ohttp_keys: &mut ohttp::KeyConfig,
    method: &str,
    target_resource: &str,
    body: Option<&[u8]>,
) -> Result<([u8; ENCAPSULATED_MESSAGE_BYTES], ohttp::ClientResponse), OhttpEncapsulationError> {
    let ctx = ohttp::ClientRequest::from_config(ohttp_keys)?;
    let url = url::Url::parse(target_resource)?;
    let mut authority = String::new();
    if let Some(host) = url.host() {
        write!(authority, "{host}").map_err(|_| OhttpEncapsulationError::Format)?;
        if let Some(port) = url.port() {
            write!(authority, ":{port}").map_err(|_| OhttpEncapsulationError::Format)?;
        }
    }
    let mut bhttp_message = bhttp::Message::request(
        method.as_bytes().to_vec(),
        url.scheme().as_bytes().to_vec(),
        authority.into_bytes(),
        url.path().as_bytes().to_vec(),
    );
    // payjoin messages carry no headers
    if let Some(body) = body {
        bhttp_message.write_content(body);
    }

    let mut bhttp_req = [0u8; PADDED_BHTTP_REQ_BYTES];
    bhttp_message.write_bhttp(bhttp::Mode::KnownLength, &mut bhttp_req.as_mut_slice())?;
    let (encapsulated, ohttp_ctx) = ctx.encapsulate(&bhttp_req)?;
    let encapsulated: [u8; ENCAPSULATED_MESSAGE_BYTES] = encapsulated
        .try_into()
        .map_err(|v: Vec<u8>| OhttpEncapsulationError::UnexpectedLength(v.len()))?;
    Ok((encapsulated, ohttp_ctx))
}

/// Open an OHTTP response and parse the BHTTP response inside.
pub(crate) fn ohttp_decapsulate(
    res_ctx: ohttp::ClientResponse,
    ohttp_body: &[u8; ENCAPSULATED_MESSAGE_BYTES],
) -> Result<http::Response<Vec<u8>>, OhttpEncapsulationError> {
    let bhttp_body = res_ctx.decapsulate(ohttp_body)?;
    let mut r = io::Cursor::new(bhttp_body);
    let m: bhttp::Message = bhttp::Message::read_bhttp(&mut r)?;
    let mut builder = http::Response::builder();
    for field in m.header().iter() {
        builder = builder.header(field.name(), field.value());
    }
    builder
        .status(m.control().status().unwrap_or(http::StatusCode::INTERNAL_SERVER_ERROR.into()))
        .body(m.content().to_vec())
        .map_err(OhttpEncapsulationError::Http)
}

/// Interpret the directory's answer to a mailbox GET.
///
/// `Ok(None)` means the mailbox is still empty.
pub(crate) fn process_get_res(
    res: &[u8],
    ohttp_context: ohttp::ClientResponse,
) -> Result<Option<Vec<u8>>, DirectoryResponseError> {
    let response = process_ohttp_res(res, ohttp_context)?;
    match response.status() {
        http::StatusCode::OK if !response.body().is_empty() => Ok(Some(response.body().to_vec())),
        http::StatusCode::OK | http::StatusCode::ACCEPTED => Ok(None),
        status_code => Err(DirectoryResponseError::UnexpectedStatusCode(status_code)),
    }
}

/// Interpret the directory's answer to a mailbox POST.
pub(crate) fn process_post_res(
    res: &[u8],
    ohttp_context: ohttp::ClientResponse,
) -> Result<(), DirectoryResponseError> {
    let response = process_ohttp_res(res, ohttp_context)?;
    match response.status() {
        http::StatusCode::OK => Ok(()),
        status_code => Err(DirectoryResponseError::UnexpectedStatusCode(status_code)),
    }
}

fn process_ohttp_res(
    res: &[u8],
    ohttp_context: ohttp::ClientResponse,
) -> Result<http::Response<Vec<u8>>, DirectoryResponseError> {
    let response_array: &[u8; ENCAPSULATED_MESSAGE_BYTES] =
        res.try_into().map_err(|_| DirectoryResponseError::InvalidSize(res.len()))?;
    tracing::trace!("decapsulating directory response");
    ohttp_decapsulate(ohttp_context, response_array)
        .map_err(DirectoryResponseError::OhttpDecapsulation)
}

/// A response context that can be stored and handed back later, but opened only once.
///
/// The state machine APIs take [`ohttp::ClientResponse`] by value. Hosts that have to park the
/// context somewhere shared (a request map, a foreign language binding) can wrap it here instead.
pub struct ResponseContext(Mutex<Option<ohttp::ClientResponse>>);

impl fmt::Debug for ResponseContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseContext").field("consumed", &self.is_consumed()).finish()
    }
}

impl ResponseContext {
    /// Take the inner context out. Every call after the first fails.
    pub fn take(&self) -> Result<ohttp::ClientResponse, DirectoryResponseError> {
        let mut guard = self.0.lock().map_err(|_| DirectoryResponseError::ContextConsumed)?;
        guard.take().ok_or(DirectoryResponseError::ContextConsumed)
    }

    /// Open a raw directory response, consuming the context.
    pub fn decapsulate(
        &self,
        res: &[u8],
    ) -> Result<http::Response<Vec<u8>>, DirectoryResponseError> {
        process_ohttp_res(res, self.take()?)
    }

    pub fn is_consumed(&self) -> bool {
        self.0.lock().map(|guard| guard.is_none()).unwrap_or(true)
    }
}

impl From<ohttp::ClientResponse> for ResponseContext {
    fn from(ctx: ohttp::ClientResponse) -> Self { Self(Mutex::new(Some(ctx))) }
}

/// Error from de/encapsulating an Oblivious HTTP request or response.
#[derive(Debug)]
pub enum OhttpEncapsulationError {
    Http(http::Error),
    Ohttp(ohttp::Error),
    Bhttp(bhttp::Error),
    ParseUrl(url::ParseError),
    Format,
    UnexpectedLength(usize),
}

impl From<http::Error> for OhttpEncapsulationError {
    fn from(value: http::Error) -> Self { Self::Http(value) }
}

impl From<ohttp::Error> for OhttpEncapsulationError {
    fn from(value: ohttp::Error) -> Self { Self::Ohttp(value) }
}

impl From<bhttp::Error> for OhttpEncapsulationError {
    fn from(value: bhttp::Error) -> Self { Self::Bhttp(value) }
}

impl From<url::ParseError> for OhttpEncapsulationError {
    fn from(value: url::ParseError) -> Self { Self::ParseUrl(value) }
}

impl fmt::Display for OhttpEncapsulationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use OhttpEncapsulationError::*;

        match &self {
            Http(e) => e.fmt(f),
            Ohttp(e) => e.fmt(f),
            Bhttp(e) => e.fmt(f),
            ParseUrl(e) => e.fmt(f),
            Format => write!(f, "failed to format request authority"),
            UnexpectedLength(len) => write!(
                f,
                "encapsulated message is {len} bytes, expected {ENCAPSULATED_MESSAGE_BYTES}"
            ),
        }
    }
}

impl error::Error for OhttpEncapsulationError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        use OhttpEncapsulationError::*;

        match &self {
            Http(e) => Some(e),
            Ohttp(e) => Some(e),
            Bhttp(e) => Some(e),
            ParseUrl(e) => Some(e),
            Format | UnexpectedLength(_) => None,
        }
    }
}

/// The directory answered, but not with something this session can use.
///
/// None of these advance a session. The caller polls again with a fresh request.
#[derive(Debug)]
pub enum DirectoryResponseError {
    /// The response was not a full size OHTTP message.
    InvalidSize(usize),
    /// The response did not open with the context it was paired with.
    OhttpDecapsulation(OhttpEncapsulationError),
    UnexpectedStatusCode(http::StatusCode),
    /// The response context was already used to open another response.
    ContextConsumed,
}

impl fmt::Display for DirectoryResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use DirectoryResponseError::*;

        match self {
            InvalidSize(size) => write!(
                f,
                "Unexpected response size {size}, expected {ENCAPSULATED_MESSAGE_BYTES} bytes"
            ),
            OhttpDecapsulation(e) => write!(f, "OHTTP decapsulation error: {e}"),
            UnexpectedStatusCode(status) => write!(f, "Unexpected status code: {status}"),
            ContextConsumed => write!(f, "OHTTP response context was already consumed"),
        }
    }
}

impl error::Error for DirectoryResponseError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        use DirectoryResponseError::*;

        match self {
            OhttpDecapsulation(e) => Some(e),
            InvalidSize(_) | UnexpectedStatusCode(_) | ContextConsumed => None,
        }
    }
}

/// The directory's OHTTP key configuration.
#[derive(Debug, Clone)]
pub struct OhttpKeys(pub ohttp::KeyConfig);

impl OhttpKeys {
    /// Decode a standard OHTTP `KeyConfig`, as served by the directory's key endpoint.
    pub fn decode(bytes: &[u8]) -> Result<Self, ohttp::Error> {
        ohttp::KeyConfig::decode(bytes).map(Self)
    }

    /// `key_id ‖ compressed public key`, the form carried in payjoin URIs.
    fn to_compact_bytes(&self) -> Result<[u8; 34], ParseOhttpKeysError> {
        let bytes = self.encode().map_err(ParseOhttpKeysError::DecodeKeyConfig)?;
        let key_id = *bytes.first().ok_or(ParseOhttpKeysError::IncorrectLength(0))?;
        let uncompressed =
            bytes.get(3..68).ok_or(ParseOhttpKeysError::IncorrectLength(bytes.len()))?;
        let pubkey = secp256k1::PublicKey::from_slice(uncompressed)
            .map_err(|_| ParseOhttpKeysError::InvalidPublicKey)?;
        let mut compact = [0u8; 34];
        compact[0] = key_id;
        compact[1..].copy_from_slice(&pubkey.serialize());
        Ok(compact)
    }
}

const OH_HRP: &str = "OH";
const KEM_ID: &[u8] = b"\x00\x16"; // DHKEM(secp256k1, HKDF-SHA256)
const SYMMETRIC_LEN: &[u8] = b"\x00\x04";
const SYMMETRIC_KDF_AEAD: &[u8] = b"\x00\x01\x00\x03"; // HKDF-SHA256, ChaCha20Poly1305

impl TryFrom<&[u8]> for OhttpKeys {
    type Error = ParseOhttpKeysError;

    /// Expand the compact `key_id ‖ compressed public key` form.
    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        if bytes.len() != 34 {
            return Err(ParseOhttpKeysError::IncorrectLength(bytes.len()));
        }
        let key_id = bytes[0];
        let pubkey = secp256k1::PublicKey::from_slice(&bytes[1..])
            .map_err(|_| ParseOhttpKeysError::InvalidPublicKey)?;

        let mut buf = vec![key_id];
        buf.extend_from_slice(KEM_ID);
        buf.extend_from_slice(&pubkey.serialize_uncompressed());
        buf.extend_from_slice(SYMMETRIC_LEN);
        buf.extend_from_slice(SYMMETRIC_KDF_AEAD);

        ohttp::KeyConfig::decode(&buf).map(Self).map_err(ParseOhttpKeysError::DecodeKeyConfig)
    }
}

impl fmt::Display for OhttpKeys {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let compact = self.to_compact_bytes().map_err(|_| fmt::Error)?;
        let hrp = Hrp::parse(OH_HRP).map_err(|_| fmt::Error)?;
        crate::bech32::encode_to_fmt(f, hrp, &compact).map_err(|_| fmt::Error)
    }
}

impl FromStr for OhttpKeys {
    type Err = ParseOhttpKeysError;

    /// Parse the uppercase bech32 `OH1…` form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hrp, bytes) =
            crate::bech32::decode(s).map_err(|_| ParseOhttpKeysError::InvalidFormat)?;
        if hrp != Hrp::parse(OH_HRP).map_err(|_| ParseOhttpKeysError::InvalidFormat)? {
            return Err(ParseOhttpKeysError::InvalidFormat);
        }
        OhttpKeys::try_from(&bytes[..])
    }
}

impl PartialEq for OhttpKeys {
    fn eq(&self, other: &Self) -> bool {
        match (self.encode(), other.encode()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for OhttpKeys {}

impl Deref for OhttpKeys {
    type Target = ohttp::KeyConfig;

    fn deref(&self) -> &Self::Target { &self.0 }
}

impl DerefMut for OhttpKeys {
    fn deref_mut(&mut self) -> &mut Self::Target { &mut self.0 }
}

impl<'de> serde::Deserialize<'de> for OhttpKeys {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes = Vec::<u8>::deserialize(deserializer)?;
        OhttpKeys::decode(&bytes).map_err(serde::de::Error::custom)
    }
}

impl serde::Serialize for OhttpKeys {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let bytes = self.encode().map_err(serde::ser::Error::custom)?;
        bytes.serialize(serializer)
    }
}

#[derive(Debug)]
pub enum ParseOhttpKeysError {
    IncorrectLength(usize),
    InvalidFormat,
    InvalidPublicKey,
    DecodeKeyConfig(ohttp::Error),
}

impl fmt::Display for ParseOhttpKeysError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseOhttpKeysError::IncorrectLength(len) =>
                write!(f, "Invalid length {len}, expected 34 bytes"),
            ParseOhttpKeysError::InvalidFormat => write!(f, "Invalid format"),
            ParseOhttpKeysError::InvalidPublicKey => write!(f, "Invalid public key"),
            ParseOhttpKeysError::DecodeKeyConfig(e) => write!(f, "Failed to decode KeyConfig: {e}"),
        }
    }
}

impl error::Error for ParseOhttpKeysError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            ParseOhttpKeysError::DecodeKeyConfig(e) => Some(e),
            _ => None,
        }
    }
}
