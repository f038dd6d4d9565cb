use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Payjoin protocol version, carried on the wire as a bare number (`v=2`).
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Version {
    /// BIP 78
    One = 1,
    /// BIP 77
    Two = 2,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", *self as u8) }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { fmt::Display::fmt(self, f) }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match u8::deserialize(deserializer)? {
            1 => Ok(Version::One),
            2 => Ok(Version::Two),
            other => Err(serde::de::Error::custom(format!("unknown payjoin version {other}"))),
        }
    }
}
