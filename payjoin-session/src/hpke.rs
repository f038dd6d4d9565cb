//! End-to-end encryption of the messages exchanged through the directory.
//!
//! Message A travels from sender to receiver and message B from receiver to sender. Both use
//! DHKEM(secp256k1, HKDF-SHA256) with ChaCha20Poly1305, and both are padded to
//! [`PADDED_MESSAGE_BYTES`] so the directory learns nothing from their length. The encapsulated
//! key is ElligatorSwift encoded to be indistinguishable from random bytes.

use std::{error, fmt};

use bitcoin::key::constants::{ELLSWIFT_ENCODING_SIZE, PUBLIC_KEY_SIZE};
use bitcoin::secp256k1;
use bitcoin::secp256k1::ellswift::ElligatorSwift;
use hpke::aead::ChaCha20Poly1305;
use hpke::kdf::HkdfSha256;
use hpke::kem::SecpK256HkdfSha256;
use hpke::rand_core::OsRng;
use hpke::{Deserializable, OpModeR, OpModeS, Serializable};
use serde::{Deserialize, Serialize};

pub const PADDED_MESSAGE_BYTES: usize = 7168;
const POLY1305_TAG_SIZE: usize = 16;
/// Message A also carries the sender's compressed reply key.
pub const PADDED_PLAINTEXT_A_LENGTH: usize =
    PADDED_MESSAGE_BYTES - (ELLSWIFT_ENCODING_SIZE + PUBLIC_KEY_SIZE + POLY1305_TAG_SIZE);
pub const PADDED_PLAINTEXT_B_LENGTH: usize =
    PADDED_MESSAGE_BYTES - (ELLSWIFT_ENCODING_SIZE + POLY1305_TAG_SIZE);
const INFO_A: &[u8] = b"PjV2MsgA";
const INFO_B: &[u8] = b"PjV2MsgB";

type Kem = SecpK256HkdfSha256;
type SecretKey = <Kem as hpke::Kem>::PrivateKey;
type PublicKey = <Kem as hpke::Kem>::PublicKey;
type EncappedKey = <Kem as hpke::Kem>::EncappedKey;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HpkeKeyPair(pub HpkeSecretKey, pub HpkePublicKey);

impl HpkeKeyPair {
    pub fn gen_keypair() -> Self {
        let (sk, pk) = <Kem as hpke::Kem>::gen_keypair(&mut OsRng);
        Self(HpkeSecretKey(sk), HpkePublicKey(pk))
    }

    pub fn from_secret_key(secret_key: &HpkeSecretKey) -> Self {
        let pk = <Kem as hpke::Kem>::sk_to_pk(&secret_key.0);
        Self(secret_key.clone(), HpkePublicKey(pk))
    }

    pub fn secret_key(&self) -> &HpkeSecretKey { &self.0 }

    pub fn public_key(&self) -> &HpkePublicKey { &self.1 }
}

#[derive(Clone, PartialEq, Eq)]
pub struct HpkeSecretKey(pub(crate) SecretKey);

impl fmt::Debug for HpkeSecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str("HpkeSecretKey(..)") }
}

impl Serialize for HpkeSecretKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0.to_bytes())
    }
}

impl<'de> Deserialize<'de> for HpkeSecretKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = Vec::<u8>::deserialize(deserializer)?;
        SecretKey::from_bytes(&bytes)
            .map(HpkeSecretKey)
            .map_err(|_| serde::de::Error::custom("invalid hpke secret key"))
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct HpkePublicKey(pub(crate) PublicKey);

impl HpkePublicKey {
    /// The 33 byte SEC1 form used in URIs and inside message A.
    pub fn to_compressed_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        // `PublicKey` always holds a valid uncompressed point, so the fallback is unreachable
        secp256k1::PublicKey::from_slice(&self.0.to_bytes())
            .map(|pk| pk.serialize())
            .unwrap_or([0u8; PUBLIC_KEY_SIZE])
    }

    pub fn from_compressed_bytes(bytes: &[u8]) -> Result<Self, HpkeError> {
        let pk = secp256k1::PublicKey::from_slice(bytes)?;
        Ok(HpkePublicKey(PublicKey::from_bytes(&pk.serialize_uncompressed())?))
    }
}

impl fmt::Debug for HpkePublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HpkePublicKey({})", bitcoin::hex::DisplayHex::as_hex(&self.to_compressed_bytes()[..]))
    }
}

impl Serialize for HpkePublicKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.to_compressed_bytes())
    }
}

impl<'de> Deserialize<'de> for HpkePublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = Vec::<u8>::deserialize(deserializer)?;
        HpkePublicKey::from_compressed_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

fn pad<const N: usize>(plaintext: &[u8]) -> Result<[u8; N], HpkeError> {
    if plaintext.len() > N {
        return Err(HpkeError::PayloadTooLarge { actual: plaintext.len(), max: N });
    }
    let mut padded = [0u8; N];
    padded[..plaintext.len()].copy_from_slice(plaintext);
    Ok(padded)
}

fn ellswift_from_encapped_key(
    enc: &EncappedKey,
) -> Result<[u8; ELLSWIFT_ENCODING_SIZE], HpkeError> {
    let pk = secp256k1::PublicKey::from_slice(&enc.to_bytes())?;
    Ok(ElligatorSwift::from_pubkey(pk).to_array())
}

fn encapped_key_from_ellswift(bytes: &[u8]) -> Result<EncappedKey, HpkeError> {
    let array: [u8; ELLSWIFT_ENCODING_SIZE] =
        bytes.try_into().map_err(|_| HpkeError::PayloadTooShort)?;
    let pk = secp256k1::PublicKey::from_ellswift(ElligatorSwift::from_array(array));
    Ok(EncappedKey::from_bytes(&pk.serialize_uncompressed())?)
}

/// Seal `body` to the receiver, announcing `reply_pk` as the key to answer to.
pub fn encrypt_message_a(
    body: &[u8],
    reply_pk: &HpkePublicKey,
    receiver_pk: &HpkePublicKey,
) -> Result<Vec<u8>, HpkeError> {
    let padded = pad::<PADDED_PLAINTEXT_A_LENGTH>(body)?;
    let (enc, mut ctx) = hpke::setup_sender::<ChaCha20Poly1305, HkdfSha256, Kem, _>(
        &OpModeS::Base,
        &receiver_pk.0,
        INFO_A,
        &mut OsRng,
    )?;
    let mut plaintext = Vec::with_capacity(PUBLIC_KEY_SIZE + padded.len());
    plaintext.extend_from_slice(&reply_pk.to_compressed_bytes());
    plaintext.extend_from_slice(&padded);
    let ciphertext = ctx.seal(&plaintext, &[])?;
    let mut message = ellswift_from_encapped_key(&enc)?.to_vec();
    message.extend(ciphertext);
    Ok(message)
}

/// Open message A, returning the padded body and the sender's reply key.
pub fn decrypt_message_a(
    message_a: &[u8],
    receiver_sk: &HpkeSecretKey,
) -> Result<(Vec<u8>, HpkePublicKey), HpkeError> {
    if message_a.len() < ELLSWIFT_ENCODING_SIZE {
        return Err(HpkeError::PayloadTooShort);
    }
    let (enc, ciphertext) = message_a.split_at(ELLSWIFT_ENCODING_SIZE);
    let enc = encapped_key_from_ellswift(enc)?;
    let mut ctx = hpke::setup_receiver::<ChaCha20Poly1305, HkdfSha256, Kem>(
        &OpModeR::Base,
        &receiver_sk.0,
        &enc,
        INFO_A,
    )?;
    let plaintext = ctx.open(ciphertext, &[])?;
    if plaintext.len() < PUBLIC_KEY_SIZE {
        return Err(HpkeError::PayloadTooShort);
    }
    let (reply_pk, body) = plaintext.split_at(PUBLIC_KEY_SIZE);
    Ok((body.to_vec(), HpkePublicKey::from_compressed_bytes(reply_pk)?))
}

/// Seal `body` to the sender's reply key, authenticated by the receiver's session key.
pub fn encrypt_message_b(
    body: &[u8],
    receiver_keypair: &HpkeKeyPair,
    reply_pk: &HpkePublicKey,
) -> Result<Vec<u8>, HpkeError> {
    let padded = pad::<PADDED_PLAINTEXT_B_LENGTH>(body)?;
    let auth = (receiver_keypair.secret_key().0.clone(), receiver_keypair.public_key().0.clone());
    let (enc, mut ctx) = hpke::setup_sender::<ChaCha20Poly1305, HkdfSha256, Kem, _>(
        &OpModeS::Auth(auth),
        &reply_pk.0,
        INFO_B,
        &mut OsRng,
    )?;
    let ciphertext = ctx.seal(&padded, &[])?;
    let mut message = ellswift_from_encapped_key(&enc)?.to_vec();
    message.extend(ciphertext);
    Ok(message)
}

/// Open message B, checking it was sealed by the holder of `receiver_pk`.
pub fn decrypt_message_b(
    message_b: &[u8],
    receiver_pk: &HpkePublicKey,
    reply_sk: &HpkeSecretKey,
) -> Result<Vec<u8>, HpkeError> {
    if message_b.len() < ELLSWIFT_ENCODING_SIZE {
        return Err(HpkeError::PayloadTooShort);
    }
    let (enc, ciphertext) = message_b.split_at(ELLSWIFT_ENCODING_SIZE);
    let enc = encapped_key_from_ellswift(enc)?;
    let mut ctx = hpke::setup_receiver::<ChaCha20Poly1305, HkdfSha256, Kem>(
        &OpModeR::Auth(receiver_pk.0.clone()),
        &reply_sk.0,
        &enc,
        INFO_B,
    )?;
    Ok(ctx.open(ciphertext, &[])?)
}

/// Error from sealing or opening a payjoin v2 message.
#[derive(Debug, PartialEq, Eq)]
pub enum HpkeError {
    InvalidPublicKey,
    Hpke(hpke::HpkeError),
    PayloadTooLarge { actual: usize, max: usize },
    PayloadTooShort,
}

impl From<hpke::HpkeError> for HpkeError {
    fn from(value: hpke::HpkeError) -> Self { Self::Hpke(value) }
}

impl From<secp256k1::Error> for HpkeError {
    fn from(_: secp256k1::Error) -> Self { Self::InvalidPublicKey }
}

impl fmt::Display for HpkeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HpkeError::InvalidPublicKey => write!(f, "invalid public key"),
            HpkeError::Hpke(e) => write!(f, "{e}"),
            HpkeError::PayloadTooLarge { actual, max } =>
                write!(f, "plaintext is {actual} bytes, at most {max} bytes fit in a message"),
            HpkeError::PayloadTooShort => write!(f, "message is too short"),
        }
    }
}

impl error::Error for HpkeError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            HpkeError::Hpke(e) => Some(e),
            _ => None,
        }
    }
}
