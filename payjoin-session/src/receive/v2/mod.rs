//! Receive BIP 77 Payjoin v2
//!
//! This module contains the typestates and helper methods to perform a Payjoin v2 receive.
//!
//! A session starts with a [`ReceiverBuilder`]. Each typestate then offers the checks or
//! contributions that belong to its step and one transition to the next. Transitions hand back a
//! persistence object from [`crate::persist`]; saving it records the step's [`SessionEvent`] and
//! only then yields the next typestate, so an interrupted session can always be rebuilt with
//! [`replay_event_log`].
//!
//! Rejections the sender should learn about move the session to [`HasReplyableError`], from
//! which the error can be posted back. A callback that fails to answer is such a rejection too.
//! Only directory errors are transient: nothing is recorded and the request can be made again.
//!
//! For more information on Payjoin v2, see [BIP 77: Async Payjoin](https://github.com/bitcoin/bips/blob/master/bip-0077.md).
//!
//! ## OHTTP Privacy Warning
//! Encapsulated requests, whether GET or POST, **must not be retried or reused**.
//! Retransmitting the same ciphertext breaks the unlinkability OHTTP provides, since the relay
//! could correlate requests by comparing them.

use std::str::FromStr;
use std::time::{Duration, SystemTime};

use bitcoin::psbt::Psbt;
use bitcoin::{Address, Amount, FeeRate, Network, OutPoint, Script, TxOut};
pub use error::{ReceiverBuilderError, SessionError};
pub(crate) use error::{InternalReceiverBuilderError, InternalSessionError};
use serde::de::Deserializer;
use serde::{Deserialize, Serialize};
pub use session::{
    replay_event_log, ReceiverSessionOutcome, ReplayError, SessionEvent, SessionHistory,
    SessionStatus,
};
use url::Url;

use super::error::{Error, InputContributionError, InternalPayloadError};
use super::{
    common, parse_payload, InputPair, JsonReply, OriginalPayload, OutputSubstitutionError,
    PsbtContext, SelectionError,
};
use crate::callbacks::{CanBroadcast, IsOutputKnown, IsScriptOwned, ProcessPsbt};
use crate::directory::ShortId;
use crate::hpke::{decrypt_message_a, encrypt_message_b, HpkeKeyPair, HpkePublicKey};
use crate::ohttp::{ohttp_encapsulate, process_get_res, process_post_res, OhttpKeys};
use crate::output_substitution::OutputSubstitution;
use crate::persist::{
    MaybeFatalTransition, MaybeFatalTransitionWithNoResults, MaybeSuccessTransition,
    NextStateTransition,
};
use crate::request::relay_url;
use crate::uri::v2::UrlExt;
use crate::{IntoUrl, Request, Version};

mod error;
mod session;

const SUPPORTED_VERSIONS: &[Version] = &[Version::Two];

static TWENTY_FOUR_HOURS_DEFAULT_EXPIRATION: Duration = Duration::from_secs(60 * 60 * 24);

/// A transition whose protocol rejections leave a reply owed to the sender.
pub type ReceiverTransition<NextState> =
    MaybeFatalTransition<SessionEvent, Receiver<NextState>, Error, Receiver<HasReplyableError>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionContext {
    #[serde(deserialize_with = "deserialize_address_assume_checked")]
    address: Address,
    directory: Url,
    ohttp_keys: OhttpKeys,
    expiration: SystemTime,
    amount: Option<Amount>,
    max_fee_rate: Option<FeeRate>,
    s: HpkeKeyPair,
    reply_key: Option<HpkePublicKey>,
}

impl SessionContext {
    fn full_relay_url(&self, ohttp_relay: impl IntoUrl) -> Result<Url, InternalSessionError> {
        let relay_base = ohttp_relay.into_url().map_err(InternalSessionError::ParseUrl)?;
        relay_url(&relay_base, &self.directory)
            .map_err(|e| InternalSessionError::ParseUrl(e.into()))
    }

    /// The per-session identifier, naming the receiver's mailbox
    pub(crate) fn id(&self) -> ShortId { ShortId::from_pubkey(self.s.public_key()) }

    fn is_expired(&self) -> bool { SystemTime::now() > self.expiration }

    fn check_expiration(&self) -> Result<(), InternalSessionError> {
        if self.is_expired() {
            return Err(InternalSessionError::Expired(self.expiration));
        }
        Ok(())
    }

    /// OHTTP encapsulate a request for a mailbox and address it to the relay.
    fn mailbox_request(
        &self,
        method: &str,
        mailbox: &ShortId,
        body: Option<&[u8]>,
        ohttp_relay: impl IntoUrl,
    ) -> Result<(Request, ohttp::ClientResponse), InternalSessionError> {
        let target = mailbox_url(&self.directory, mailbox)?;
        tracing::debug!("{method} {target}");
        let (ohttp_body, ohttp_ctx) =
            ohttp_encapsulate(&mut self.ohttp_keys.clone(), method, target.as_str(), body)
                .map_err(InternalSessionError::OhttpEncapsulation)?;
        let req = Request::new_v2(&self.full_relay_url(ohttp_relay)?, &ohttp_body);
        Ok((req, ohttp_ctx))
    }

    /// Encrypt `body` to the sender's reply key and POST it to the sender's mailbox.
    fn post_to_sender(
        &self,
        body: &[u8],
        ohttp_relay: impl IntoUrl,
    ) -> Result<(Request, ohttp::ClientResponse), SessionError> {
        self.check_expiration()?;
        let reply_key = self.reply_key.as_ref().ok_or(InternalSessionError::MissingReplyKey)?;
        let message_b =
            encrypt_message_b(body, &self.s, reply_key).map_err(InternalSessionError::Hpke)?;
        let mailbox = ShortId::from_pubkey(reply_key);
        Ok(self.mailbox_request("POST", &mailbox, Some(&message_b), ohttp_relay)?)
    }

    /// Turn a failed step into the transition that records it.
    ///
    /// A rejection, including a callback that failed to answer, becomes a reply to the sender
    /// when there is a key to encrypt it to, and ends the session otherwise.
    fn reject<NextState>(&self, e: Error) -> ReceiverTransition<NextState> {
        if let Error::Implementation { step, source } = &e {
            tracing::warn!("receiver callback failed during {step:?}: {source}");
        }
        match &self.reply_key {
            Some(reply_key) => {
                tracing::debug!("rejecting original payload: {e}");
                let error_reply = JsonReply::from(&e);
                MaybeFatalTransition::replyable_error(
                    SessionEvent::GotReplyableError(error_reply.clone(), reply_key.clone()),
                    Receiver { state: HasReplyableError { error_reply, context: self.clone() } },
                    e,
                )
            }
            None => MaybeFatalTransition::fatal(SessionEvent::SessionInvalid(e.to_string()), e),
        }
    }
}

fn deserialize_address_assume_checked<'de, D>(deserializer: D) -> Result<Address, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    let address = Address::from_str(&s).map_err(serde::de::Error::custom)?;
    Ok(address.assume_checked())
}

/// The mailbox `id` on `directory`.
fn mailbox_url(directory: &Url, id: &ShortId) -> Result<Url, InternalSessionError> {
    let mut url = directory.clone();
    url.path_segments_mut()
        .map_err(|_| InternalSessionError::ParseUrl(crate::into_url::Error::MissingHost))?
        .pop_if_empty()
        .push(&id.to_string());
    Ok(url)
}

/// Gets the Payjoin URI from a session context
pub(crate) fn pj_uri<'a>(session_context: &SessionContext) -> crate::PjUri<'a> {
    use crate::uri::PayjoinExtras;

    let mut pj = session_context.directory.clone();
    if let Ok(mailbox) = mailbox_url(&session_context.directory, &session_context.id()) {
        pj = mailbox;
    }
    pj.set_receiver_pubkey(session_context.s.public_key());
    pj.set_ohttp(&session_context.ohttp_keys);
    pj.set_exp(session_context.expiration);
    let extras = PayjoinExtras { endpoint: pj, output_substitution: OutputSubstitution::Enabled };
    let mut uri = bitcoin_uri::Uri::with_extras(session_context.address.clone(), extras);
    uri.amount = session_context.amount;
    uri
}

/// Configures and starts a receiver session.
#[derive(Debug, Clone)]
pub struct ReceiverBuilder(SessionContext);

impl ReceiverBuilder {
    /// Start a session paying `address`, with a mailbox on `directory`.
    ///
    /// `ohttp_keys` are the directory's OHTTP keys, fetched through a relay beforehand.
    pub fn new(
        address: Address,
        directory: impl IntoUrl,
        ohttp_keys: OhttpKeys,
    ) -> Result<Self, ReceiverBuilderError> {
        let directory = directory.into_url().map_err(InternalReceiverBuilderError::IntoUrl)?;
        Ok(Self(SessionContext {
            address,
            directory,
            ohttp_keys,
            expiration: SystemTime::now() + TWENTY_FOUR_HOURS_DEFAULT_EXPIRATION,
            amount: None,
            max_fee_rate: None,
            s: HpkeKeyPair::gen_keypair(),
            reply_key: None,
        }))
    }

    /// Like [`ReceiverBuilder::new`], parsing the address and checking it is for `network`.
    pub fn from_address_str(
        address: &str,
        network: Network,
        directory: impl IntoUrl,
        ohttp_keys: OhttpKeys,
    ) -> Result<Self, ReceiverBuilderError> {
        let address = Address::from_str(address)
            .and_then(|address| address.require_network(network))
            .map_err(InternalReceiverBuilderError::InvalidAddress)?;
        Self::new(address, directory, ohttp_keys)
    }

    /// The session, its mailbox and its URI expire after `expiration`. Defaults to 24 hours.
    pub fn with_expiration(self, expiration: Duration) -> Self {
        Self(SessionContext { expiration: SystemTime::now() + expiration, ..self.0 })
    }

    /// Ask for `amount` in the payjoin URI.
    pub fn with_amount(self, amount: Amount) -> Self {
        Self(SessionContext { amount: Some(amount), ..self.0 })
    }

    /// The default maximum effective fee rate of [`Receiver<WantsFeeRange>::apply_fee_range`].
    pub fn with_max_fee_rate(self, max_fee_rate: FeeRate) -> Self {
        Self(SessionContext { max_fee_rate: Some(max_fee_rate), ..self.0 })
    }

    pub fn build(self) -> NextStateTransition<SessionEvent, Receiver<Initialized>> {
        tracing::debug!("created receiver session {}", self.0.id());
        NextStateTransition::success(
            SessionEvent::Created(self.0.clone()),
            Receiver { state: Initialized { context: self.0 } },
        )
    }
}

/// Every state a receiver session can be in, as rebuilt by [`replay_event_log`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveSession {
    Initialized(Receiver<Initialized>),
    UncheckedOriginalPayload(Receiver<UncheckedOriginalPayload>),
    MaybeInputsOwned(Receiver<MaybeInputsOwned>),
    MaybeInputsSeen(Receiver<MaybeInputsSeen>),
    OutputsUnknown(Receiver<OutputsUnknown>),
    WantsOutputs(Receiver<WantsOutputs>),
    WantsInputs(Receiver<WantsInputs>),
    WantsFeeRange(Receiver<WantsFeeRange>),
    ProvisionalProposal(Receiver<ProvisionalProposal>),
    PayjoinProposal(Receiver<PayjoinProposal>),
    HasReplyableError(Receiver<HasReplyableError>),
    Closed(ReceiverSessionOutcome),
}

impl ReceiveSession {
    fn new(context: SessionContext) -> Self {
        ReceiveSession::Initialized(Receiver { state: Initialized { context } })
    }

    fn process_event(self, event: SessionEvent) -> Result<ReceiveSession, ReplayError> {
        use ReceiveSession as S;
        use SessionEvent as E;

        match (self, event) {
            (S::Initialized(state), E::RetrievedOriginalPayload(original, reply_key)) =>
                Ok(state.apply_retrieved_original_payload(original, reply_key)),
            (S::UncheckedOriginalPayload(state), E::CheckedBroadcastSuitability()) =>
                Ok(state.apply_checked_broadcast_suitability()),
            (S::MaybeInputsOwned(state), E::CheckedInputsNotOwned()) =>
                Ok(state.apply_checked_inputs_not_owned()),
            (S::MaybeInputsSeen(state), E::CheckedNoInputsSeenBefore()) =>
                Ok(state.apply_checked_no_inputs_seen_before()),
            (S::OutputsUnknown(state), E::IdentifiedReceiverOutputs(inner)) =>
                Ok(state.apply_identified_receiver_outputs(inner)),
            (S::WantsOutputs(state), E::CommittedOutputs(inner)) =>
                Ok(state.apply_committed_outputs(inner)),
            (S::WantsInputs(state), E::CommittedInputs(inner)) =>
                Ok(state.apply_committed_inputs(inner)),
            (S::WantsFeeRange(state), E::AppliedFeeRange(psbt_context)) =>
                Ok(state.apply_applied_fee_range(psbt_context)),
            (S::ProvisionalProposal(state), E::FinalizedProposal(psbt)) =>
                Ok(state.apply_finalized_proposal(psbt)),
            (S::Closed(outcome), event) =>
                Err(session::InternalReplayError::InvalidStateAndEvent(
                    Box::new(event),
                    Some(Box::new(S::Closed(outcome))),
                )
                .into()),
            (state, E::GotReplyableError(error_reply, reply_key)) =>
                match state.session_context() {
                    Some(context) => Ok(S::HasReplyableError(Receiver {
                        state: HasReplyableError {
                            error_reply,
                            context: SessionContext { reply_key: Some(reply_key), ..context },
                        },
                    })),
                    None => Err(session::InternalReplayError::InvalidStateAndEvent(
                        Box::new(E::GotReplyableError(error_reply, reply_key)),
                        Some(Box::new(state)),
                    )
                    .into()),
                },
            (_, E::SessionInvalid(_)) => Ok(S::Closed(ReceiverSessionOutcome::Failure)),
            (_, E::Closed(outcome)) => Ok(S::Closed(outcome)),
            (state, event) =>
                Err(session::InternalReplayError::InvalidStateAndEvent(
                    Box::new(event),
                    Some(Box::new(state)),
                )
                .into()),
        }
    }

    fn session_context(&self) -> Option<SessionContext> {
        use ReceiveSession as S;

        let context = match self {
            S::Initialized(r) => &r.context,
            S::UncheckedOriginalPayload(r) => &r.context,
            S::MaybeInputsOwned(r) => &r.context,
            S::MaybeInputsSeen(r) => &r.context,
            S::OutputsUnknown(r) => &r.context,
            S::WantsOutputs(r) => &r.context,
            S::WantsInputs(r) => &r.context,
            S::WantsFeeRange(r) => &r.context,
            S::ProvisionalProposal(r) => &r.context,
            S::PayjoinProposal(r) => &r.context,
            S::HasReplyableError(r) => &r.context,
            S::Closed(_) => return None,
        };
        Some(context.clone())
    }
}

mod sealed {
    pub trait State {}

    impl State for super::Initialized {}
    impl State for super::UncheckedOriginalPayload {}
    impl State for super::MaybeInputsOwned {}
    impl State for super::MaybeInputsSeen {}
    impl State for super::OutputsUnknown {}
    impl State for super::WantsOutputs {}
    impl State for super::WantsInputs {}
    impl State for super::WantsFeeRange {}
    impl State for super::ProvisionalProposal {}
    impl State for super::PayjoinProposal {}
    impl State for super::HasReplyableError {}
}

/// Any typestate of the receiver protocol flow. Only implemented in this crate.
pub trait State: sealed::State {}

impl<T: sealed::State> State for T {}

/// A receiver session, parameterized by its current step.
///
/// Each typestate offers the operations of its step and consumes the receiver to move on, so the
/// compiler rejects a skipped or repeated check. See
/// [The Typestate Pattern in Rust](https://cliffle.com/blog/rust-typestate/).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receiver<State> {
    /// Data associated with the current state of the receiver.
    pub(crate) state: State,
}

impl<State> core::ops::Deref for Receiver<State> {
    type Target = State;

    fn deref(&self) -> &Self::Target { &self.state }
}

impl<State> core::ops::DerefMut for Receiver<State> {
    fn deref_mut(&mut self) -> &mut Self::Target { &mut self.state }
}

/// Waiting for the sender's original PSBT in the session mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Initialized {
    context: SessionContext,
}

impl Receiver<Initialized> {
    /// Extract an OHTTP Encapsulated HTTP GET request for the Original PSBT
    pub fn create_poll_request(
        &self,
        ohttp_relay: impl IntoUrl,
    ) -> Result<(Request, ohttp::ClientResponse), SessionError> {
        self.context.check_expiration()?;
        Ok(self.context.mailbox_request("GET", &self.context.id(), None, ohttp_relay)?)
    }

    /// Process the directory's answer to [`Receiver<Initialized>::create_poll_request`].
    ///
    /// An empty mailbox leaves the receiver as it was. A directory error is transient. A payload
    /// that cannot be decrypted ends the session, and one that decrypts but does not parse is
    /// answered with an error reply to the sender.
    #[allow(clippy::type_complexity)]
    pub fn process_response(
        self,
        body: &[u8],
        context: ohttp::ClientResponse,
    ) -> MaybeFatalTransitionWithNoResults<
        SessionEvent,
        Receiver<UncheckedOriginalPayload>,
        Receiver<Initialized>,
        Error,
        Receiver<HasReplyableError>,
    > {
        if self.context.is_expired() {
            let e: Error = InternalSessionError::Expired(self.context.expiration).into();
            return MaybeFatalTransitionWithNoResults::fatal(
                SessionEvent::SessionInvalid(e.to_string()),
                e,
            );
        }

        let body = match process_get_res(body, context) {
            Ok(Some(body)) => body,
            Ok(None) => {
                tracing::trace!("no original payload yet");
                return MaybeFatalTransitionWithNoResults::no_results(self);
            }
            Err(e) =>
                return MaybeFatalTransitionWithNoResults::transient(
                    InternalSessionError::DirectoryResponse(e).into(),
                ),
        };

        let (payload, reply_key) = match decrypt_message_a(&body, self.context.s.secret_key()) {
            Ok(decrypted) => decrypted,
            Err(e) => {
                let e: Error = InternalSessionError::Hpke(e).into();
                return MaybeFatalTransitionWithNoResults::fatal(
                    SessionEvent::SessionInvalid(e.to_string()),
                    e,
                );
            }
        };
        let context = SessionContext { reply_key: Some(reply_key.clone()), ..self.state.context };

        match original_from_payload(&payload) {
            Ok(original) => MaybeFatalTransitionWithNoResults::success(
                SessionEvent::RetrievedOriginalPayload(original.clone(), reply_key),
                Receiver { state: UncheckedOriginalPayload { original, context } },
            ),
            Err(e) => {
                let error_reply = JsonReply::from(&e);
                MaybeFatalTransitionWithNoResults::replyable_error(
                    SessionEvent::GotReplyableError(error_reply.clone(), reply_key),
                    Receiver { state: HasReplyableError { error_reply, context } },
                    e,
                )
            }
        }
    }

    /// Build a V2 Payjoin URI from the receiver's context
    pub fn pj_uri<'a>(&self) -> crate::PjUri<'a> { pj_uri(&self.context) }

    /// The directory mailbox of this session.
    pub fn id(&self) -> ShortId { self.context.id() }

    fn apply_retrieved_original_payload(
        self,
        original: OriginalPayload,
        reply_key: HpkePublicKey,
    ) -> ReceiveSession {
        let context = SessionContext { reply_key: Some(reply_key), ..self.state.context };
        ReceiveSession::UncheckedOriginalPayload(Receiver {
            state: UncheckedOriginalPayload { original, context },
        })
    }
}

/// Parse the decrypted body of message A: the base64 PSBT and the query, newline separated.
fn original_from_payload(payload: &[u8]) -> Result<OriginalPayload, Error> {
    let payload = std::str::from_utf8(payload).map_err(InternalPayloadError::Utf8)?;
    let (base64, padded_query) = payload.split_once('\n').unwrap_or((payload, ""));
    let base64 = base64.trim_matches('\0');
    let query = padded_query.trim_matches('\0');
    tracing::trace!("received query: {query}, base64: {base64}");
    let (psbt, params) = parse_payload(base64, query, SUPPORTED_VERSIONS)
        .map_err(|e| Error::Protocol(super::ProtocolError::OriginalPayload(e)))?;
    Ok(OriginalPayload { psbt, params })
}

/// The original PSBT and the optional parameters received from the sender.
///
/// A non-interactive receiver, such as a donation page handing out a fresh URI on each visit,
/// should call [`Receiver<UncheckedOriginalPayload>::check_broadcast_suitability`]. It protects
/// against probing, where a sender repeatedly submits originals to learn the receiver's UTXOs
/// from its contributions. Interactive receivers may skip it with
/// [`Receiver<UncheckedOriginalPayload>::assume_interactive_receiver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UncheckedOriginalPayload {
    original: OriginalPayload,
    context: SessionContext,
}

impl Receiver<UncheckedOriginalPayload> {
    /// Checks that the original PSBT in the proposal can be broadcasted.
    ///
    /// `can_broadcast` would typically wrap a `testmempoolaccept` call. The optional
    /// `min_fee_rate` is enforced on the original as well, which makes probing more expensive.
    pub fn check_broadcast_suitability(
        self,
        min_fee_rate: Option<FeeRate>,
        can_broadcast: impl CanBroadcast,
    ) -> ReceiverTransition<MaybeInputsOwned> {
        if let Err(e) = self.original.check_broadcast_suitability(min_fee_rate, can_broadcast) {
            return self.context.reject(e);
        }
        MaybeFatalTransition::success(
            SessionEvent::CheckedBroadcastSuitability(),
            Receiver {
                state: MaybeInputsOwned {
                    original: self.state.original,
                    context: self.state.context,
                },
            },
        )
    }

    /// Moves on to the next typestate without any of the current typestate's validations.
    ///
    /// Use this for interactive payment receivers, where there is no risk of a probing attack
    /// since the receiver needs to manually create payjoin URIs.
    pub fn assume_interactive_receiver(
        self,
    ) -> NextStateTransition<SessionEvent, Receiver<MaybeInputsOwned>> {
        NextStateTransition::success(
            SessionEvent::CheckedBroadcastSuitability(),
            Receiver {
                state: MaybeInputsOwned {
                    original: self.state.original,
                    context: self.state.context,
                },
            },
        )
    }

    /// The sender's transaction, for a fallback broadcast.
    pub fn extract_tx_to_schedule_broadcast(&self) -> bitcoin::Transaction {
        self.original.extract_tx_to_schedule_broadcast()
    }

    fn apply_checked_broadcast_suitability(self) -> ReceiveSession {
        ReceiveSession::MaybeInputsOwned(Receiver {
            state: MaybeInputsOwned { original: self.state.original, context: self.state.context },
        })
    }
}

/// Typestate to check that the original PSBT has no inputs owned by the receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaybeInputsOwned {
    original: OriginalPayload,
    context: SessionContext,
}

impl Receiver<MaybeInputsOwned> {
    /// Extracts the original transaction received from the sender.
    ///
    /// Use this for scheduling the broadcast of the original transaction as a fallback
    /// for the payjoin.
    pub fn extract_tx_to_schedule_broadcast(&self) -> bitcoin::Transaction {
        self.original.extract_tx_to_schedule_broadcast()
    }

    /// Check that the original PSBT has no receiver-owned inputs.
    pub fn check_inputs_not_owned(
        self,
        is_owned: impl IsScriptOwned,
    ) -> ReceiverTransition<MaybeInputsSeen> {
        if let Err(e) = self.original.check_inputs_not_owned(is_owned) {
            return self.context.reject(e);
        }
        MaybeFatalTransition::success(
            SessionEvent::CheckedInputsNotOwned(),
            Receiver {
                state: MaybeInputsSeen {
                    original: self.state.original,
                    context: self.state.context,
                },
            },
        )
    }

    fn apply_checked_inputs_not_owned(self) -> ReceiveSession {
        ReceiveSession::MaybeInputsSeen(Receiver {
            state: MaybeInputsSeen { original: self.state.original, context: self.state.context },
        })
    }
}

/// Typestate to check that the original PSBT has no inputs that the receiver has seen before.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaybeInputsSeen {
    original: OriginalPayload,
    context: SessionContext,
}

impl Receiver<MaybeInputsSeen> {
    /// Check that the receiver has never seen the inputs in the original proposal before.
    ///
    /// This stops a sender from probing with the same original over and over, and from reusing
    /// the payjoin of an earlier session as a new original.
    pub fn check_no_inputs_seen_before(
        self,
        is_known: impl IsOutputKnown,
    ) -> ReceiverTransition<OutputsUnknown> {
        if let Err(e) = self.original.check_no_inputs_seen_before(is_known) {
            return self.context.reject(e);
        }
        MaybeFatalTransition::success(
            SessionEvent::CheckedNoInputsSeenBefore(),
            Receiver {
                state: OutputsUnknown {
                    original: self.state.original,
                    context: self.state.context,
                },
            },
        )
    }

    fn apply_checked_no_inputs_seen_before(self) -> ReceiveSession {
        ReceiveSession::OutputsUnknown(Receiver {
            state: OutputsUnknown { original: self.state.original, context: self.state.context },
        })
    }
}

/// Typestate to check that the outputs of the original PSBT actually pay to the receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputsUnknown {
    original: OriginalPayload,
    context: SessionContext,
}

impl Receiver<OutputsUnknown> {
    /// Find the outputs paying the receiver, failing if there are none.
    ///
    /// When the sender asked for its fee contribution to come out of one of these outputs, the
    /// contribution is dropped so the receiver never pays the sender's fee.
    pub fn identify_receiver_outputs(
        self,
        is_receiver_output: impl IsScriptOwned,
    ) -> ReceiverTransition<WantsOutputs> {
        let inner = match self.original.clone().identify_receiver_outputs(is_receiver_output) {
            Ok(inner) => inner,
            Err(e) => return self.context.reject(e),
        };
        MaybeFatalTransition::success(
            SessionEvent::IdentifiedReceiverOutputs(inner.clone()),
            Receiver { state: WantsOutputs { inner, context: self.state.context } },
        )
    }

    fn apply_identified_receiver_outputs(self, inner: common::WantsOutputs) -> ReceiveSession {
        ReceiveSession::WantsOutputs(Receiver {
            state: WantsOutputs { inner, context: self.state.context },
        })
    }
}

/// Typestate which the receiver may substitute or add outputs to.
///
/// Payjoin lets the receiver replace its own outputs, e.g. to batch other payments, as long as
/// the sender did not disable output substitution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WantsOutputs {
    inner: common::WantsOutputs,
    context: SessionContext,
}

impl Receiver<WantsOutputs> {
    /// Whether the receiver is allowed to substitute original outputs or not.
    pub fn output_substitution(&self) -> OutputSubstitution { self.inner.output_substitution() }

    /// Substitute the receiver output script with the provided script.
    pub fn substitute_receiver_script(
        self,
        output_script: &Script,
    ) -> Result<Self, OutputSubstitutionError> {
        let inner = self.state.inner.substitute_receiver_script(output_script)?;
        Ok(Receiver { state: WantsOutputs { inner, context: self.state.context } })
    }

    /// Replaces **all** receiver outputs with `replacement_outputs`.
    ///
    /// `drain_script` names the replacement output that absorbs later value changes: it grows
    /// with contributed inputs and shrinks with the receiver's share of the fee. Sender outputs
    /// are untouched.
    pub fn replace_receiver_outputs(
        self,
        replacement_outputs: impl IntoIterator<Item = TxOut>,
        drain_script: &Script,
    ) -> Result<Self, OutputSubstitutionError> {
        let inner = self.state.inner.replace_receiver_outputs(replacement_outputs, drain_script)?;
        Ok(Receiver { state: WantsOutputs { inner, context: self.state.context } })
    }

    /// Commits the outputs as final, and moves on to the next typestate.
    pub fn commit_outputs(self) -> NextStateTransition<SessionEvent, Receiver<WantsInputs>> {
        let inner = self.state.inner.commit_outputs();
        NextStateTransition::success(
            SessionEvent::CommittedOutputs(inner.clone()),
            Receiver { state: WantsInputs { inner, context: self.state.context } },
        )
    }

    fn apply_committed_outputs(self, inner: common::WantsInputs) -> ReceiveSession {
        ReceiveSession::WantsInputs(Receiver {
            state: WantsInputs { inner, context: self.state.context },
        })
    }
}

/// Typestate for a checked proposal which the receiver may contribute inputs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WantsInputs {
    inner: common::WantsInputs,
    context: SessionContext,
}

impl Receiver<WantsInputs> {
    /// Pick a candidate that avoids the UIH2 heuristic of 2-output transactions, or else the
    /// first candidate.
    pub fn try_preserving_privacy(
        &self,
        candidate_inputs: impl IntoIterator<Item = InputPair>,
    ) -> Result<InputPair, SelectionError> {
        self.inner.try_preserving_privacy(candidate_inputs)
    }

    /// Contributes the provided inputs at random positions. Their value goes to the drain output.
    ///
    /// Calls accumulate: later inputs join the earlier ones, and all of them together must fund
    /// any outputs the receiver added.
    pub fn contribute_inputs(
        self,
        inputs: impl IntoIterator<Item = InputPair>,
    ) -> Result<Self, InputContributionError> {
        let inner = self.state.inner.contribute_inputs(inputs)?;
        Ok(Receiver { state: WantsInputs { inner, context: self.state.context } })
    }

    /// Commits the inputs as final, and moves on to the next typestate.
    pub fn commit_inputs(self) -> NextStateTransition<SessionEvent, Receiver<WantsFeeRange>> {
        let inner = self.state.inner.commit_inputs();
        NextStateTransition::success(
            SessionEvent::CommittedInputs(inner.clone()),
            Receiver { state: WantsFeeRange { inner, context: self.state.context } },
        )
    }

    fn apply_committed_inputs(self, inner: common::WantsFeeRange) -> ReceiveSession {
        ReceiveSession::WantsFeeRange(Receiver {
            state: WantsFeeRange { inner, context: self.state.context },
        })
    }
}

/// Typestate for a proposal whose inputs and outputs are final but whose fee is not settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WantsFeeRange {
    inner: common::WantsFeeRange,
    context: SessionContext,
}

impl Receiver<WantsFeeRange> {
    /// Pay for the weight the receiver added.
    ///
    /// The minimum rate is the larger of `min_fee_rate` (default: the broadcast minimum) and the
    /// sender's `minfeerate`. Input weight is charged to the sender's fee output up to its
    /// `maxadditionalfeecontribution`, then to the receiver's drain output. Output weight is
    /// always the receiver's. The receiver's share may not exceed what the added weight costs at
    /// `max_effective_fee_rate`, which defaults to the session's maximum and then to the minimum.
    pub fn apply_fee_range(
        self,
        min_fee_rate: Option<FeeRate>,
        max_effective_fee_rate: Option<FeeRate>,
    ) -> ReceiverTransition<ProvisionalProposal> {
        let max_effective_fee_rate = max_effective_fee_rate.or(self.context.max_fee_rate);
        let psbt_context =
            match self.inner.clone().apply_fee_range(min_fee_rate, max_effective_fee_rate) {
                Ok(psbt_context) => psbt_context,
                Err(e) => return self.context.reject(e.into()),
            };
        MaybeFatalTransition::success(
            SessionEvent::AppliedFeeRange(psbt_context.clone()),
            Receiver { state: ProvisionalProposal { psbt_context, context: self.state.context } },
        )
    }

    fn apply_applied_fee_range(self, psbt_context: PsbtContext) -> ReceiveSession {
        ReceiveSession::ProvisionalProposal(Receiver {
            state: ProvisionalProposal { psbt_context, context: self.state.context },
        })
    }
}

/// A proposal with its fee settled, waiting for the receiver's signatures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionalProposal {
    psbt_context: PsbtContext,
    context: SessionContext,
}

impl Receiver<ProvisionalProposal> {
    /// The proposal the wallet will be asked to sign.
    pub fn psbt_to_sign(&self) -> Psbt { self.psbt_context.payjoin_psbt.clone() }

    /// Have the wallet sign and finalize the receiver's inputs.
    ///
    /// The sender's signatures are removed first since the transaction changed. The wallet must
    /// return the same unsigned transaction with every receiver input finalized.
    pub fn finalize_proposal(
        self,
        wallet: impl ProcessPsbt,
    ) -> ReceiverTransition<PayjoinProposal> {
        let psbt = match self.psbt_context.clone().finalize_proposal(wallet) {
            Ok(psbt) => psbt,
            Err(e) => return self.context.reject(e),
        };
        MaybeFatalTransition::success(
            SessionEvent::FinalizedProposal(psbt.clone()),
            Receiver { state: PayjoinProposal { psbt, context: self.state.context } },
        )
    }

    fn apply_finalized_proposal(self, psbt: Psbt) -> ReceiveSession {
        ReceiveSession::PayjoinProposal(Receiver {
            state: PayjoinProposal { psbt, context: self.state.context },
        })
    }
}

/// A finalized Payjoin proposal, complete with fees and receiver signatures, that the sender
/// should find acceptable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayjoinProposal {
    psbt: Psbt,
    context: SessionContext,
}

impl Receiver<PayjoinProposal> {
    /// The UTXOs that would be spent by this Payjoin transaction.
    pub fn utxos_to_be_locked(&self) -> impl '_ + Iterator<Item = &OutPoint> {
        self.psbt.unsigned_tx.input.iter().map(|input| &input.previous_output)
    }

    /// The Payjoin Proposal PSBT.
    pub fn psbt(&self) -> &Psbt { &self.psbt }

    /// Encrypt the proposal to the sender and POST it to the sender's mailbox.
    pub fn create_post_request(
        &self,
        ohttp_relay: impl IntoUrl,
    ) -> Result<(Request, ohttp::ClientResponse), SessionError> {
        self.context.post_to_sender(&self.psbt.serialize(), ohttp_relay)
    }

    /// The proposal was delivered once the directory acknowledges it, which completes the
    /// session. A directory error is transient.
    pub fn process_response(
        self,
        res: &[u8],
        ohttp_context: ohttp::ClientResponse,
    ) -> MaybeSuccessTransition<SessionEvent, (), SessionError> {
        match process_post_res(res, ohttp_context) {
            Ok(()) => MaybeSuccessTransition::success(
                SessionEvent::Closed(ReceiverSessionOutcome::Success),
                (),
            ),
            Err(e) => MaybeSuccessTransition::transient(
                InternalSessionError::DirectoryResponse(e).into(),
            ),
        }
    }
}

/// The session was rejected and the sender is owed the reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HasReplyableError {
    error_reply: JsonReply,
    context: SessionContext,
}

impl Receiver<HasReplyableError> {
    pub fn error_reply(&self) -> &JsonReply { &self.error_reply }

    /// Encrypt the error reply to the sender and POST it to the sender's mailbox.
    pub fn create_error_request(
        &self,
        ohttp_relay: impl IntoUrl,
    ) -> Result<(Request, ohttp::ClientResponse), SessionError> {
        let body = self.error_reply.to_json().to_string();
        self.context.post_to_sender(body.as_bytes(), ohttp_relay)
    }

    /// Close the session as failed once the directory acknowledges the error reply.
    pub fn process_error_response(
        self,
        res: &[u8],
        ohttp_context: ohttp::ClientResponse,
    ) -> MaybeSuccessTransition<SessionEvent, (), SessionError> {
        match process_post_res(res, ohttp_context) {
            Ok(()) => MaybeSuccessTransition::success(
                SessionEvent::Closed(ReceiverSessionOutcome::Failure),
                (),
            ),
            Err(e) => MaybeSuccessTransition::transient(
                InternalSessionError::DirectoryResponse(e).into(),
            ),
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use once_cell::sync::Lazy;
    use payjoin_test_utils::{BoxError, EXAMPLE_URL, KEM, KEY_ID, RELAY_URL, SYMMETRIC};

    use super::*;
    use crate::directory::ENCAPSULATED_MESSAGE_BYTES;
    use crate::persist::test_utils::InMemoryTestPersister;
    use crate::persist::{NoopSessionPersister, OptionalTransitionOutcome};
    use crate::receive::tests::original_from_test_vector;
    use crate::receive::RejectionKind;
    use crate::ImplementationError;

    pub(crate) static SHARED_CONTEXT: Lazy<SessionContext> = Lazy::new(|| SessionContext {
        address: Address::from_str("tb1q6d3a2w975yny0asuvd9a67ner4nks58ff0q8g4")
            .expect("valid address")
            .assume_checked(),
        directory: EXAMPLE_URL.clone(),
        ohttp_keys: OhttpKeys(
            ohttp::KeyConfig::new(KEY_ID, KEM, Vec::from(SYMMETRIC)).expect("valid key config"),
        ),
        expiration: SystemTime::now() + Duration::from_secs(60),
        amount: None,
        max_fee_rate: None,
        s: HpkeKeyPair::gen_keypair(),
        reply_key: None,
    });

    pub(crate) fn unchecked_receiver_from_test_vector() -> Receiver<UncheckedOriginalPayload> {
        Receiver {
            state: UncheckedOriginalPayload {
                original: original_from_test_vector(),
                context: SessionContext {
                    reply_key: Some(HpkeKeyPair::gen_keypair().1),
                    ..SHARED_CONTEXT.clone()
                },
            },
        }
    }

    fn ohttp_context() -> ohttp::ClientResponse {
        let (_, ctx) = ohttp_encapsulate(
            &mut SHARED_CONTEXT.ohttp_keys.clone(),
            "GET",
            EXAMPLE_URL.as_str(),
            None,
        )
        .expect("encapsulation succeeds");
        ctx
    }

    #[test]
    fn default_expiration_is_a_day() {
        let now = SystemTime::now();
        let builder = ReceiverBuilder::new(
            SHARED_CONTEXT.address.clone(),
            EXAMPLE_URL.as_str(),
            SHARED_CONTEXT.ohttp_keys.clone(),
        )
        .expect("valid builder");
        let expected = now + TWENTY_FOUR_HOURS_DEFAULT_EXPIRATION;
        assert!(builder.0.expiration >= expected);
        assert!(builder.0.expiration < expected + Duration::from_secs(5));
    }

    #[test]
    fn builder_rejects_bad_inputs() {
        let keys = SHARED_CONTEXT.ohttp_keys.clone();
        assert!(ReceiverBuilder::from_address_str(
            "tb1q6d3a2w975yny0asuvd9a67ner4nks58ff0q8g4",
            Network::Bitcoin,
            EXAMPLE_URL.as_str(),
            keys.clone(),
        )
        .is_err());
        assert!(ReceiverBuilder::new(SHARED_CONTEXT.address.clone(), "ftp://example.com", keys)
            .is_err());
    }

    #[test]
    fn build_records_creation() -> Result<(), BoxError> {
        let persister = InMemoryTestPersister::<SessionEvent>::default();
        let receiver = ReceiverBuilder::new(
            SHARED_CONTEXT.address.clone(),
            EXAMPLE_URL.as_str(),
            SHARED_CONTEXT.ohttp_keys.clone(),
        )?
        .with_amount(Amount::from_sat(50_000))
        .build()
        .save(&persister)?;
        assert_eq!(persister.events(), vec![SessionEvent::Created(receiver.context.clone())]);
        Ok(())
    }

    #[test]
    fn pj_uri_carries_session_parameters() {
        let receiver = Receiver { state: Initialized { context: SHARED_CONTEXT.clone() } };
        let uri = receiver.pj_uri();
        let endpoint = uri.extras.endpoint().clone();
        let mailbox = format!("{}{}#", EXAMPLE_URL.as_str(), receiver.id());
        assert!(endpoint.as_str().starts_with(&mailbox));
        let param = uri.extras.v2_param().expect("complete v2 endpoint");
        assert_eq!(param.receiver_pubkey(), SHARED_CONTEXT.s.public_key());
        assert_eq!(param.directory(), &*EXAMPLE_URL);
        assert_eq!(uri.extras.output_substitution(), OutputSubstitution::Enabled);
    }

    #[test]
    fn relay_only_learns_the_directory_origin() -> Result<(), BoxError> {
        let context = SessionContext {
            directory: Url::parse("https://directory.example/some/path")?,
            ..SHARED_CONTEXT.clone()
        };
        let url = context.full_relay_url(RELAY_URL.as_str()).map_err(SessionError::from)?;
        assert_eq!(url.as_str(), "https://relay.example/https://directory.example/");
        Ok(())
    }

    #[test]
    fn expired_session_cannot_poll() {
        let context = SessionContext {
            expiration: SystemTime::now() - Duration::from_secs(1),
            ..SHARED_CONTEXT.clone()
        };
        let receiver = Receiver { state: Initialized { context } };
        assert!(receiver.create_poll_request(RELAY_URL.as_str()).is_err());

        let persister = InMemoryTestPersister::<SessionEvent>::default();
        let err = receiver
            .process_response(&[0u8; ENCAPSULATED_MESSAGE_BYTES], ohttp_context())
            .save(&persister)
            .expect_err("an expired session is closed");
        assert!(!err.is_transient());
        assert!(persister.is_closed());
        assert!(matches!(persister.events().as_slice(), [SessionEvent::SessionInvalid(_)]));
    }

    #[test]
    fn bad_directory_response_is_transient() {
        let receiver = Receiver { state: Initialized { context: SHARED_CONTEXT.clone() } };
        let persister = InMemoryTestPersister::<SessionEvent>::default();
        let err = receiver
            .process_response(b"too short", ohttp_context())
            .save(&persister)
            .expect_err("response is too short");
        assert!(err.is_transient());
        assert!(persister.events().is_empty());
        assert!(!persister.is_closed());
    }

    #[test]
    fn empty_mailbox_keeps_polling() -> Result<(), BoxError> {
        let directory = payjoin_test_utils::InMemoryDirectory::new();
        let context = SessionContext {
            directory: directory.url(),
            ohttp_keys: OhttpKeys::decode(&directory.ohttp_keys_encoded())?,
            ..SHARED_CONTEXT.clone()
        };
        let receiver = Receiver { state: Initialized { context } };
        let (req, ctx) = receiver.create_poll_request(RELAY_URL.as_str())?;
        let res = directory.handle(&req.body)?;

        let persister = InMemoryTestPersister::<SessionEvent>::default();
        let outcome = receiver.clone().process_response(&res, ctx).save(&persister)?;
        assert_eq!(outcome, OptionalTransitionOutcome::Stasis(receiver));
        assert!(persister.events().is_empty());
        Ok(())
    }

    #[test]
    fn callback_failure_ends_the_session() {
        let persister = InMemoryTestPersister::<SessionEvent>::default();
        let failing = |_: &bitcoin::Transaction| -> Result<bool, ImplementationError> {
            Err("mempool unavailable".into())
        };
        let err = unchecked_receiver_from_test_vector()
            .check_broadcast_suitability(None, failing)
            .save(&persister)
            .expect_err("a callback that cannot answer refuses");
        assert!(!err.is_transient());
        assert!(matches!(err.api_error_ref(), Some(Error::Implementation { .. })));
        assert_eq!(err.api_error_ref().map(Error::kind), Some(RejectionKind::OriginalPsbtRejected));
        let error_state = err.error_state().expect("the sender is owed a reply");
        assert_eq!(error_state.error_reply().to_json()["errorCode"], "unavailable");
    }

    #[test]
    fn protocol_rejection_owes_a_reply() {
        let persister = InMemoryTestPersister::<SessionEvent>::default();
        let not_broadcastable =
            |_: &bitcoin::Transaction| -> Result<bool, ImplementationError> { Ok(false) };
        let err = unchecked_receiver_from_test_vector()
            .check_broadcast_suitability(None, not_broadcastable)
            .save(&persister)
            .expect_err("original is rejected");
        assert!(!err.is_transient());
        match err.api_error_ref() {
            Some(Error::Protocol(e)) => assert_eq!(e.kind(), RejectionKind::OriginalPsbtRejected),
            other => panic!("unexpected error: {other:?}"),
        }
        let error_state = err.error_state().expect("rejection moves to an error state");
        assert_eq!(error_state.error_reply().to_json()["errorCode"], "original-psbt-rejected");
        assert!(matches!(persister.events().as_slice(), [SessionEvent::GotReplyableError(..)]));
        assert!(!persister.is_closed(), "the reply has yet to be sent");
    }

    #[test]
    fn rejection_without_reply_key_closes_the_session() {
        let receiver = Receiver {
            state: UncheckedOriginalPayload {
                original: original_from_test_vector(),
                context: SHARED_CONTEXT.clone(),
            },
        };
        let persister = InMemoryTestPersister::<SessionEvent>::default();
        let not_broadcastable =
            |_: &bitcoin::Transaction| -> Result<bool, ImplementationError> { Ok(false) };
        receiver
            .check_broadcast_suitability(None, not_broadcastable)
            .save(&persister)
            .expect_err("original is rejected");
        assert!(persister.is_closed());
    }

    #[test]
    fn fee_range_defaults_to_session_maximum() -> Result<(), BoxError> {
        let persister = NoopSessionPersister::<SessionEvent>::default();
        let mut receiver = unchecked_receiver_from_test_vector();
        receiver.state.context.max_fee_rate = Some(FeeRate::ZERO);
        let original = receiver.original.psbt.clone();
        let receiver_script = original.unsigned_tx.output[1].script_pubkey.clone();
        let is_receiver = move |script: &Script| -> Result<bool, ImplementationError> {
            Ok(script == receiver_script.as_script())
        };
        let wants_fee_range = receiver
            .assume_interactive_receiver()
            .save(&persister)?
            .check_inputs_not_owned(|_: &Script| -> Result<bool, ImplementationError> {
                Ok(false)
            })
            .save(&persister)?
            .check_no_inputs_seen_before(|_: &OutPoint| -> Result<bool, ImplementationError> {
                Ok(false)
            })
            .save(&persister)?
            .identify_receiver_outputs(is_receiver)
            .save(&persister)?
            .commit_outputs()
            .save(&persister)?
            .commit_inputs()
            .save(&persister)?;
        // Nothing was added, so nothing is owed even at a zero maximum
        assert!(wants_fee_range.apply_fee_range(None, None).save(&persister).is_ok());
        Ok(())
    }
}
