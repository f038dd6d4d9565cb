use std::borrow::Borrow;
use std::fmt;

use bitcoin::{Amount, FeeRate, Weight};
use serde::{Deserialize, Serialize};

use crate::output_substitution::OutputSubstitution;
use crate::Version;

/// The sender's optional parameters, carried in the query after the original PSBT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Params {
    // v
    pub v: Version,
    // disableoutputsubstitution
    pub output_substitution: OutputSubstitution,
    // maxadditionalfeecontribution, additionalfeeoutputindex
    pub additional_fee_contribution: Option<(Amount, usize)>,
    // minfeerate
    pub min_fee_rate: FeeRate,
}

impl Default for Params {
    fn default() -> Self {
        Params {
            // Message A is only ever produced by v2 senders
            v: Version::Two,
            output_substitution: OutputSubstitution::Enabled,
            additional_fee_contribution: None,
            min_fee_rate: FeeRate::ZERO,
        }
    }
}

impl Params {
    pub fn from_query_pairs<K, V, I>(
        pairs: I,
        supported_versions: &'static [Version],
    ) -> Result<Self, Error>
    where
        I: Iterator<Item = (K, V)>,
        K: Borrow<str> + Into<String>,
        V: Borrow<str> + Into<String>,
    {
        let mut params = Params::default();

        let mut additional_fee_output_index = None;
        let mut max_additional_fee_contribution = None;

        for (key, v) in pairs {
            match (key.borrow(), v.borrow()) {
                ("v", version) =>
                    params.v = match version {
                        "1" => Version::One,
                        "2" => Version::Two,
                        _ => return Err(Error::UnknownVersion { supported_versions }),
                    },
                ("additionalfeeoutputindex", index) =>
                    additional_fee_output_index = match index.parse::<usize>() {
                        Ok(index) => Some(index),
                        Err(e) => {
                            tracing::warn!(
                                "bad `additionalfeeoutputindex` query value '{index}': {e}"
                            );
                            None
                        }
                    },
                ("maxadditionalfeecontribution", fee) =>
                    max_additional_fee_contribution =
                        match Amount::from_str_in(fee, bitcoin::Denomination::Satoshi) {
                            Ok(contribution) => Some(contribution),
                            Err(e) => {
                                tracing::warn!(
                                    "bad `maxadditionalfeecontribution` query value '{fee}': {e}"
                                );
                                None
                            }
                        },
                ("minfeerate", fee_rate) => params.min_fee_rate = parse_min_fee_rate(fee_rate)?,
                ("disableoutputsubstitution", v) =>
                    params.output_substitution = if v == "true" {
                        OutputSubstitution::Disabled
                    } else {
                        OutputSubstitution::Enabled
                    },
                _ => (),
            }
        }

        if !supported_versions.contains(&params.v) {
            return Err(Error::UnknownVersion { supported_versions });
        }

        match (max_additional_fee_contribution, additional_fee_output_index) {
            (Some(amount), Some(index)) =>
                params.additional_fee_contribution = Some((amount, index)),
            (Some(_), None) | (None, Some(_)) => {
                tracing::warn!("only one additional-fee parameter specified: {params:?}");
            }
            (None, None) => (),
        }

        tracing::debug!("parsed optional parameters: {params:?}");
        Ok(params)
    }
}

/// A `minfeerate` in sat/vB, rounded up to the next sat/kwu.
///
/// The rate must be able to price a full block without overflowing.
fn parse_min_fee_rate(sat_per_vb: &str) -> Result<FeeRate, Error> {
    let sat_per_vb = sat_per_vb.parse::<f32>().map_err(|_| Error::FeeRate)?;
    if !sat_per_vb.is_finite() || sat_per_vb.is_sign_negative() {
        return Err(Error::FeeRate);
    }
    let sat_per_kwu = (sat_per_vb * 250.0_f32).ceil();
    if sat_per_kwu >= u64::MAX as f32 {
        return Err(Error::FeeRate);
    }
    let fee_rate = FeeRate::from_sat_per_kwu(sat_per_kwu as u64);
    match fee_rate.checked_mul_by_weight(Weight::MAX_BLOCK) {
        Some(_) => Ok(fee_rate),
        None => Err(Error::FeeRate),
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Error {
    UnknownVersion { supported_versions: &'static [Version] },
    FeeRate,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::UnknownVersion { .. } => write!(f, "unknown version"),
            Error::FeeRate => write!(f, "could not parse feerate"),
        }
    }
}

impl std::error::Error for Error {}
