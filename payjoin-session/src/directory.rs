//! Mailbox addressing on the payjoin directory.

use std::fmt;
use std::str::FromStr;

use bitcoin::bech32::Hrp;
use bitcoin::hashes::{sha256, Hash};

use crate::hpke::HpkePublicKey;

/// Size of every OHTTP message exchanged with the directory, requests and responses alike.
pub const ENCAPSULATED_MESSAGE_BYTES: usize = 8192;

const ID_HRP: &str = "ID";
const ID_PREFIX: &str = "ID1";

/// A 64-bit mailbox identifier: the first eight bytes of the SHA256 of a compressed public key.
///
/// Only an identifier, not a commitment. A collision costs liveness of one session and
/// nothing else, since the payloads are end-to-end encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ShortId(pub [u8; 8]);

impl ShortId {
    pub fn as_bytes(&self) -> &[u8] { &self.0 }

    /// The mailbox owned by the holder of `pubkey`.
    pub fn from_pubkey(pubkey: &HpkePublicKey) -> Self {
        sha256::Hash::hash(&pubkey.to_compressed_bytes()).into()
    }
}

impl From<sha256::Hash> for ShortId {
    fn from(hash: sha256::Hash) -> Self {
        let mut id = [0u8; 8];
        id.copy_from_slice(&hash.as_byte_array()[..8]);
        ShortId(id)
    }
}

impl fmt::Display for ShortId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let hrp = Hrp::parse(ID_HRP).map_err(|_| fmt::Error)?;
        let encoded = crate::bech32::encode(hrp, &self.0).map_err(|_| fmt::Error)?;
        f.write_str(encoded.strip_prefix(ID_PREFIX).ok_or(fmt::Error)?)
    }
}

impl FromStr for ShortId {
    type Err = ShortIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (_, bytes) = crate::bech32::decode(&format!("{ID_PREFIX}{s}"))
            .map_err(ShortIdError::DecodeBech32)?;
        let id: [u8; 8] = bytes.as_slice().try_into().map_err(|_| ShortIdError::IncorrectLength)?;
        Ok(ShortId(id))
    }
}

#[derive(Debug)]
pub enum ShortIdError {
    DecodeBech32(bitcoin::bech32::primitives::decode::CheckedHrpstringError),
    IncorrectLength,
}

impl fmt::Display for ShortIdError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ShortIdError::DecodeBech32(e) => write!(f, "invalid mailbox id: {e}"),
            ShortIdError::IncorrectLength => write!(f, "mailbox id must be 8 bytes"),
        }
    }
}

impl std::error::Error for ShortIdError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ShortIdError::DecodeBech32(e) => Some(e),
            ShortIdError::IncorrectLength => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hpke::HpkeKeyPair;

    #[test]
    fn short_id_parses_its_display_form() {
        let id = ShortId::from_pubkey(HpkeKeyPair::gen_keypair().public_key());
        let encoded = id.to_string();
        assert_eq!(encoded.len(), 13);
        assert!(!encoded.starts_with(ID_PREFIX));
        assert_eq!(encoded.parse::<ShortId>().expect("valid id"), id);
    }

    #[test]
    fn short_id_rejects_wrong_length() {
        let hrp = Hrp::parse(ID_HRP).unwrap();
        let long = crate::bech32::encode(hrp, &[7u8; 9]).unwrap();
        let long = long.strip_prefix(ID_PREFIX).unwrap();
        assert!(matches!(long.parse::<ShortId>(), Err(ShortIdError::IncorrectLength)));
        assert!(matches!("not bech32!".parse::<ShortId>(), Err(ShortIdError::DecodeBech32(_))));
    }
}
