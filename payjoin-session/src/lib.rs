#![cfg_attr(docsrs, feature(doc_cfg))]

//! # Payjoin v2 sessions in Rust
//!
//! Sender and receiver state machines for [BIP 77 Payjoin V2](https://github.com/bitcoin/bips/blob/master/bip-0077.md),
//! with event-sourced persistence and the OHTTP encapsulation they ride on.
//!
//! The library does no IO. Every network step hands back a [`Request`] and a response context;
//! the caller performs the request through an OHTTP relay and passes the response bytes back.
//! Every step that makes progress records one event through a [`persist::SessionPersister`], and
//! a session is resumed by replaying its event log, see [`receive::v2::replay_event_log`] and
//! [`send::v2::replay_event_log`].
//!
//! Wallet policy enters only through the four traits in [`callbacks`].
//!
//! ## Disclaimer ⚠️ WIP
//!
//! **Use at your own risk. This crate has not yet been reviewed by independent Rust and Bitcoin security professionals.**

pub extern crate bitcoin;

pub mod callbacks;
pub mod persist;
pub mod receive;
pub mod send;

pub(crate) mod bech32;
pub mod directory;
mod error;
pub(crate) mod error_codes;
pub(crate) mod hpke;
pub(crate) mod into_url;
pub(crate) mod ohttp;
pub(crate) mod output_substitution;
pub(crate) mod psbt;
mod request;
mod uri;
pub(crate) mod version;

pub use directory::ENCAPSULATED_MESSAGE_BYTES;
pub use error::ImplementationError;
pub use error_codes::{ErrorCode, UnknownErrorCode};
pub use hpke::{HpkeKeyPair, HpkePublicKey, PADDED_MESSAGE_BYTES};
pub use into_url::{Error as IntoUrlError, IntoUrl};
pub use ohttp::{DirectoryResponseError, OhttpKeys, ParseOhttpKeysError, ResponseContext};
pub use output_substitution::OutputSubstitution;
pub use psbt::{
    InputPair, InputPairError, PlainOutPoint, PlainPsbtInput, PlainTxIn, PlainTxOut,
    PsbtInputError,
};
pub use request::Request;
pub use uri::v2::PjParam;
pub use uri::{PjParseError, PjUri, Uri, UriExt};
pub use url::{ParseError, Url};
pub(crate) use version::Version;

/// 4M block size limit with base64 encoding overhead => maximum reasonable size of content-length
/// 4_000_000 * 4 / 3 fits in u32
pub const MAX_CONTENT_LENGTH: usize = 4_000_000 * 4 / 3;
