//! BIP 21 URIs carrying the `pj` and `pjos` parameters

use std::borrow::Cow;

use bitcoin::address::NetworkChecked;
pub use error::PjParseError;
use url::Url;

use crate::into_url::sealed::IntoUrlSealed;
use crate::output_substitution::OutputSubstitution;
use crate::uri::error::InternalPjParseError;

mod error;
pub mod v2;

#[derive(Debug, Clone)]
#[allow(clippy::large_enum_variant)]
pub enum MaybePayjoinExtras {
    Supported(PayjoinExtras),
    Unsupported,
}

impl MaybePayjoinExtras {
    pub fn pj_is_supported(&self) -> bool { matches!(self, MaybePayjoinExtras::Supported(_)) }
}

/// The `pj` endpoint and `pjos` flag of a payjoin URI
#[derive(Debug, Clone)]
pub struct PayjoinExtras {
    pub(crate) endpoint: Url,
    pub(crate) output_substitution: OutputSubstitution,
}

impl PayjoinExtras {
    pub fn endpoint(&self) -> &Url { &self.endpoint }

    pub fn output_substitution(&self) -> OutputSubstitution { self.output_substitution }

    /// The v2 receiver parameters, if the endpoint is a complete v2 endpoint.
    pub fn v2_param(&self) -> Result<v2::PjParam, v2::PjParamError> {
        v2::PjParam::parse(&self.endpoint)
    }
}

pub type Uri<'a, NetworkValidation> = bitcoin_uri::Uri<'a, NetworkValidation, MaybePayjoinExtras>;
pub type PjUri<'a> = bitcoin_uri::Uri<'a, NetworkChecked, PayjoinExtras>;

mod sealed {
    use bitcoin::address::NetworkChecked;

    pub trait UriExt: Sized {}

    impl UriExt for super::Uri<'_, NetworkChecked> {}
    impl UriExt for super::PjUri<'_> {}
}

pub trait UriExt<'a>: sealed::UriExt {
    /// Narrow to a payjoin URI, or hand back the plain BIP 21 URI for a regular payment.
    fn check_pj_supported(self) -> Result<PjUri<'a>, Box<bitcoin_uri::Uri<'a>>>;
}

impl<'a> UriExt<'a> for Uri<'a, NetworkChecked> {
    fn check_pj_supported(self) -> Result<PjUri<'a>, Box<bitcoin_uri::Uri<'a>>> {
        let bitcoin_uri::Uri { address, amount, label, message, extras, .. } = self;
        match extras {
            MaybePayjoinExtras::Supported(payjoin) => {
                let mut pj_uri = bitcoin_uri::Uri::with_extras(address, payjoin);
                (pj_uri.amount, pj_uri.label, pj_uri.message) = (amount, label, message);
                Ok(pj_uri)
            }
            MaybePayjoinExtras::Unsupported => {
                let mut plain = bitcoin_uri::Uri::new(address);
                (plain.amount, plain.label, plain.message) = (amount, label, message);
                Err(Box::new(plain))
            }
        }
    }
}

/// Accept `https` endpoints, or plain `http` to an onion service.
fn parse_endpoint(endpoint: &str) -> Result<Url, PjParseError> {
    let url = Url::parse(endpoint)
        .map_err(|e| InternalPjParseError::IntoUrl(crate::into_url::Error::Parse(e)))?;
    let onion = url.scheme() == "http" && url.domain().unwrap_or_default().ends_with(".onion");
    if url.scheme() != "https" && !onion {
        return Err(InternalPjParseError::UnsecureEndpoint.into());
    }
    let url = url.into_url().map_err(InternalPjParseError::IntoUrl)?;
    if url.fragment().is_some_and(|fragment| fragment.chars().any(|c| c.is_lowercase())) {
        return Err(InternalPjParseError::LowercaseFragment.into());
    }
    Ok(url)
}

impl bitcoin_uri::de::DeserializationError for MaybePayjoinExtras {
    type Error = PjParseError;
}

impl bitcoin_uri::de::DeserializeParams<'_> for MaybePayjoinExtras {
    type DeserializationState = DeserializationState;
}

#[derive(Default)]
pub struct DeserializationState {
    pj: Option<Url>,
    pjos: Option<OutputSubstitution>,
}

impl bitcoin_uri::SerializeParams for &MaybePayjoinExtras {
    type Key = &'static str;
    type Value = String;
    type Iterator = std::vec::IntoIter<(Self::Key, Self::Value)>;

    fn serialize_params(self) -> Self::Iterator {
        match self {
            MaybePayjoinExtras::Supported(extras) => extras.serialize_params(),
            MaybePayjoinExtras::Unsupported => Vec::new().into_iter(),
        }
    }
}

impl bitcoin_uri::SerializeParams for &PayjoinExtras {
    type Key = &'static str;
    type Value = String;
    type Iterator = std::vec::IntoIter<(Self::Key, Self::Value)>;

    fn serialize_params(self) -> Self::Iterator {
        let pjos = match self.output_substitution {
            OutputSubstitution::Disabled => Some(("pjos", "0".to_owned())),
            OutputSubstitution::Enabled => None,
        };
        let pj = ("pj", display_endpoint(&self.endpoint));
        pjos.into_iter().chain(Some(pj)).collect::<Vec<_>>().into_iter()
    }
}

/// Uppercase scheme and host, so the URI qualifies for QR alphanumeric mode. `Url` itself always
/// lowercases them.
fn display_endpoint(endpoint: &Url) -> String {
    let scheme = endpoint.scheme();
    let mut display = endpoint.as_str().replacen(scheme, &scheme.to_uppercase(), 1);
    if let Some(host) = endpoint.host_str() {
        display = display.replacen(host, &host.to_uppercase(), 1);
    }
    display
}

impl bitcoin_uri::de::DeserializationState<'_> for DeserializationState {
    type Value = MaybePayjoinExtras;

    fn is_param_known(&self, param: &str) -> bool { matches!(param, "pj" | "pjos") }

    fn deserialize_temp(
        &mut self,
        key: &str,
        value: bitcoin_uri::Param<'_>,
    ) -> Result<bitcoin_uri::de::ParamKind, <Self::Value as bitcoin_uri::DeserializationError>::Error>
    {
        match key {
            "pj" => {
                if self.pj.is_some() {
                    return Err(InternalPjParseError::DuplicateParams("pj").into());
                }
                let text = Cow::try_from(value).map_err(|_| InternalPjParseError::NotUtf8)?;
                self.pj = Some(parse_endpoint(&text)?);
            }
            "pjos" => {
                if self.pjos.is_some() {
                    return Err(InternalPjParseError::DuplicateParams("pjos").into());
                }
                let flag = Cow::try_from(value).map_err(|_| InternalPjParseError::BadPjOs)?;
                self.pjos = Some(match &*flag {
                    "0" => OutputSubstitution::Disabled,
                    "1" => OutputSubstitution::Enabled,
                    _ => return Err(InternalPjParseError::BadPjOs.into()),
                });
            }
            _ => return Ok(bitcoin_uri::de::ParamKind::Unknown),
        }
        Ok(bitcoin_uri::de::ParamKind::Known)
    }

    fn finalize(
        self,
    ) -> Result<Self::Value, <Self::Value as bitcoin_uri::DeserializationError>::Error> {
        let Some(endpoint) = self.pj else {
            return match self.pjos {
                Some(_) => Err(InternalPjParseError::MissingEndpoint.into()),
                None => Ok(MaybePayjoinExtras::Unsupported),
            };
        };
        let output_substitution = self.pjos.unwrap_or(OutputSubstitution::Enabled);
        Ok(MaybePayjoinExtras::Supported(PayjoinExtras { endpoint, output_substitution }))
    }
}
