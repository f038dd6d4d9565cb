use url::Url;

use crate::directory::ENCAPSULATED_MESSAGE_BYTES;

const V2_REQ_CONTENT_TYPE: &str = "message/ohttp-req";

/// An HTTP request the caller must deliver on behalf of the state machine.
///
/// The body is always a padded OHTTP message of [`ENCAPSULATED_MESSAGE_BYTES`].
/// Never retry or resend it: reusing the same ciphertext lets the relay link requests.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct Request {
    /// Where to POST the body.
    pub url: Url,
    /// Value of the `Content-Type` header.
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl Request {
    pub(crate) fn new_v2(url: &Url, body: &[u8; ENCAPSULATED_MESSAGE_BYTES]) -> Self {
        Self { url: url.clone(), content_type: V2_REQ_CONTENT_TYPE, body: body.to_vec() }
    }
}

/// Address a request for `directory` to the relay.
///
/// The relay only learns the directory's origin, appended as a path.
pub(crate) fn relay_url(ohttp_relay: &Url, directory: &Url) -> Result<Url, url::ParseError> {
    let directory_base = directory.join("/")?;
    ohttp_relay.join(&format!("/{directory_base}"))
}
