//! Send BIP 77 Payjoin v2
//!
//! This module contains the typestates and helper methods to perform a Payjoin v2 send.
//!
//! A [`SenderBuilder`] checks the original PSBT against the receiver's [`crate::PjUri`] and
//! starts a session with a fresh reply key. The sender then posts the encrypted original to the
//! receiver's mailbox and polls its own mailbox, named after the reply key, until the receiver's
//! proposal or error reply shows up. Every step hands back a persistence object from
//! [`crate::persist`], so the session can be rebuilt with [`replay_event_log`].
//!
//! The original PSBT is a valid transaction on its own. If the session fails or expires it should
//! be broadcast instead, see [`SessionHistory::fallback_tx`].
//!
//! For more information on Payjoin v2, see [BIP 77: Async Payjoin](https://github.com/bitcoin/bips/blob/master/bip-0077.md).
//!
//! ## OHTTP Privacy Warning
//! Encapsulated requests, whether GET or POST, **must not be retried or reused**.
//! Retransmitting the same ciphertext breaks the unlinkability OHTTP provides, since the relay
//! could correlate requests by comparing them.

use std::time::SystemTime;

use bitcoin::psbt::Psbt;
use bitcoin::{Amount, FeeRate};
pub use error::{CreateRequestError, EncapsulationError};
pub(crate) use error::{InternalCreateRequestError, InternalEncapsulationError};
use serde::{Deserialize, Serialize};
pub use session::{
    replay_event_log, ReplayError, SenderSessionOutcome, SessionEvent, SessionHistory,
    SessionStatus,
};
use url::Url;

use super::{
    clear_unneeded_fields, serialize_params, BuildSenderError, InternalBuildSenderError,
    InternalProposalError, PsbtContext, PsbtContextBuilder, ResponseError,
};
use crate::directory::ShortId;
use crate::hpke::{decrypt_message_b, encrypt_message_a, HpkeKeyPair, HpkeSecretKey};
use crate::ohttp::{ohttp_encapsulate, process_get_res, process_post_res};
use crate::output_substitution::OutputSubstitution;
use crate::persist::{
    MaybeFatalTransition, MaybeSuccessTransitionWithNoResults, NextStateTransition,
};
use crate::request::relay_url;
use crate::uri::v2::PjParam;
use crate::{IntoUrl, PjUri, Request};

mod error;
mod session;

/// The outcome of polling for the receiver's answer.
pub type ProposalTransition = MaybeSuccessTransitionWithNoResults<
    SessionEvent,
    Psbt,
    Sender<PollingForProposal>,
    ResponseError,
>;

/// Checks the original PSBT and the receiver's URI, then starts a sender session.
#[derive(Debug, Clone)]
pub struct SenderBuilder {
    pj_param: PjParam,
    output_substitution: OutputSubstitution,
    psbt_ctx_builder: PsbtContextBuilder,
}

impl SenderBuilder {
    /// Prepare to pay the receiver of `uri` with the signed, finalized `psbt`.
    ///
    /// `psbt` must pay the URI's address exactly once, and exactly its amount if it names one.
    /// The URI has to carry a complete v2 endpoint that has not expired.
    pub fn new(psbt: Psbt, uri: PjUri<'_>) -> Result<Self, BuildSenderError> {
        let pj_param =
            uri.extras.v2_param().map_err(InternalBuildSenderError::MissingPayjoinEndpoint)?;
        if SystemTime::now() > pj_param.expiration() {
            return Err(InternalBuildSenderError::Expired(pj_param.expiration()).into());
        }
        let payee = uri.address.script_pubkey();
        Ok(Self {
            pj_param,
            output_substitution: OutputSubstitution::Enabled,
            psbt_ctx_builder: PsbtContextBuilder::new(psbt, payee, uri.amount),
        })
    }

    /// Forbid the receiver from substituting the payee output.
    pub fn always_disable_output_substitution(self) -> Self {
        Self { output_substitution: OutputSubstitution::Disabled, ..self }
    }

    /// Offer to pay for one more input like the sender's at `min_fee_rate`, out of the change.
    ///
    /// Without a change output no contribution is offered. `min_fee_rate` is also the lowest fee
    /// rate the proposal may have.
    pub fn build_recommended(
        self,
        min_fee_rate: FeeRate,
    ) -> Result<NextStateTransition<SessionEvent, Sender<WithReplyKey>>, BuildSenderError> {
        let psbt_ctx =
            self.psbt_ctx_builder.build_recommended(min_fee_rate, self.output_substitution)?;
        Ok(start_session(self.pj_param, psbt_ctx))
    }

    /// Offer up to `max_fee_contribution` out of the output at `change_index`.
    ///
    /// Without a `change_index` the change is the only output not paying the payee. With
    /// `clamp_fee_contribution` an offer larger than the change is lowered to the change value
    /// instead of failing.
    pub fn build_with_additional_fee(
        self,
        max_fee_contribution: Amount,
        change_index: Option<usize>,
        min_fee_rate: FeeRate,
        clamp_fee_contribution: bool,
    ) -> Result<NextStateTransition<SessionEvent, Sender<WithReplyKey>>, BuildSenderError> {
        let psbt_ctx = self.psbt_ctx_builder.build_with_additional_fee(
            max_fee_contribution,
            change_index,
            min_fee_rate,
            clamp_fee_contribution,
            self.output_substitution,
        )?;
        Ok(start_session(self.pj_param, psbt_ctx))
    }

    /// Offer no fee contribution. The receiver pays for whatever it adds.
    pub fn build_non_incentivizing(
        self,
        min_fee_rate: FeeRate,
    ) -> Result<NextStateTransition<SessionEvent, Sender<WithReplyKey>>, BuildSenderError> {
        let psbt_ctx =
            self.psbt_ctx_builder.build_non_incentivizing(min_fee_rate, self.output_substitution)?;
        Ok(start_session(self.pj_param, psbt_ctx))
    }
}

fn start_session(
    pj_param: PjParam,
    psbt_ctx: PsbtContext,
) -> NextStateTransition<SessionEvent, Sender<WithReplyKey>> {
    let state = WithReplyKey { pj_param, psbt_ctx, reply_key: HpkeKeyPair::gen_keypair().0 };
    tracing::debug!("created sender session for {}", state.pj_param.directory());
    NextStateTransition::success(
        SessionEvent::Created(Box::new(state.clone())),
        Sender { state },
    )
}

fn check_expiration(pj_param: &PjParam) -> Result<(), CreateRequestError> {
    if SystemTime::now() > pj_param.expiration() {
        return Err(InternalCreateRequestError::Expired(pj_param.expiration()).into());
    }
    Ok(())
}

/// OHTTP encapsulate a request for `target` on the receiver's directory, addressed to the relay.
fn mailbox_request(
    pj_param: &PjParam,
    method: &str,
    target: &Url,
    body: Option<&[u8]>,
    ohttp_relay: impl IntoUrl,
) -> Result<(Request, ohttp::ClientResponse), CreateRequestError> {
    tracing::debug!("{method} {target}");
    let (ohttp_body, ohttp_ctx) =
        ohttp_encapsulate(&mut pj_param.ohttp_keys().clone(), method, target.as_str(), body)
            .map_err(InternalCreateRequestError::OhttpEncapsulation)?;
    let url = relay_url(&ohttp_relay.into_url()?, pj_param.directory())?;
    Ok((Request::new_v2(&url, &ohttp_body), ohttp_ctx))
}

/// Every state a sender session can be in, as rebuilt by [`replay_event_log`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendSession {
    WithReplyKey(Sender<WithReplyKey>),
    PollingForProposal(Sender<PollingForProposal>),
    Closed(SenderSessionOutcome),
}

impl SendSession {
    fn new(state: WithReplyKey) -> Self { SendSession::WithReplyKey(Sender { state }) }

    fn process_event(self, event: SessionEvent) -> Result<SendSession, ReplayError> {
        use SendSession as S;
        use SessionEvent as E;

        match (self, event) {
            (S::WithReplyKey(state), E::PostedOriginalPsbt()) =>
                Ok(state.apply_posted_original_psbt()),
            (S::PollingForProposal(_), E::Closed(outcome)) => Ok(S::Closed(outcome)),
            (S::Closed(outcome), event) =>
                Err(session::InternalReplayError::InvalidStateAndEvent(
                    Box::new(event),
                    Some(Box::new(S::Closed(outcome))),
                )
                .into()),
            (_, E::SessionInvalid(_)) | (_, E::Closed(SenderSessionOutcome::Failure)) =>
                Ok(S::Closed(SenderSessionOutcome::Failure)),
            (state, event) =>
                Err(session::InternalReplayError::InvalidStateAndEvent(
                    Box::new(event),
                    Some(Box::new(state)),
                )
                .into()),
        }
    }

    fn pj_param(&self) -> Option<&PjParam> {
        match self {
            SendSession::WithReplyKey(sender) => Some(&sender.pj_param),
            SendSession::PollingForProposal(sender) => Some(&sender.pj_param),
            SendSession::Closed(_) => None,
        }
    }
}

mod sealed {
    pub trait State {}

    impl State for super::WithReplyKey {}
    impl State for super::PollingForProposal {}
}

/// Any typestate of the sender protocol flow. Only implemented in this crate.
pub trait State: sealed::State {}

impl<T: sealed::State> State for T {}

/// A sender session, parameterized by its current step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender<State> {
    /// Data associated with the current state of the sender.
    pub(crate) state: State,
}

impl<State> core::ops::Deref for Sender<State> {
    type Target = State;

    fn deref(&self) -> &Self::Target { &self.state }
}

impl<State> core::ops::DerefMut for Sender<State> {
    fn deref_mut(&mut self) -> &mut Self::Target { &mut self.state }
}

/// A checked original PSBT and the key the receiver will reply to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithReplyKey {
    pj_param: PjParam,
    psbt_ctx: PsbtContext,
    reply_key: HpkeSecretKey,
}

impl Sender<WithReplyKey> {
    /// Encrypt the original PSBT and its parameters to the receiver and POST them to the
    /// receiver's mailbox.
    ///
    /// Fields the receiver does not need, such as key origins, are stripped first.
    pub fn create_v2_post_request(
        &self,
        ohttp_relay: impl IntoUrl,
    ) -> Result<(Request, V2PostContext), CreateRequestError> {
        check_expiration(&self.pj_param)?;
        let mut original = self.psbt_ctx.original_psbt.clone();
        clear_unneeded_fields(&mut original);
        let params = serialize_params(
            self.psbt_ctx.output_substitution,
            self.psbt_ctx.fee_contribution,
            self.psbt_ctx.min_fee_rate,
        );
        tracing::trace!("sending original with {params}");
        let body = format!("{original}\n{params}");
        let reply_keypair = HpkeKeyPair::from_secret_key(&self.reply_key);
        let message_a = encrypt_message_a(
            body.as_bytes(),
            reply_keypair.public_key(),
            self.pj_param.receiver_pubkey(),
        )
        .map_err(InternalCreateRequestError::Hpke)?;
        let mailbox = self.pj_param.mailbox()?;
        let (request, ohttp_ctx) =
            mailbox_request(&self.pj_param, "POST", &mailbox, Some(&message_a), ohttp_relay)?;
        Ok((request, V2PostContext { ohttp_ctx }))
    }

    /// The original is delivered once the directory acknowledges it. A directory error is
    /// transient and a fresh request may be made.
    pub fn process_response(
        self,
        response: &[u8],
        post_ctx: V2PostContext,
    ) -> MaybeFatalTransition<SessionEvent, Sender<PollingForProposal>, EncapsulationError> {
        if let Err(e) = process_post_res(response, post_ctx.ohttp_ctx) {
            return MaybeFatalTransition::transient(
                InternalEncapsulationError::DirectoryResponse(e).into(),
            );
        }
        MaybeFatalTransition::success(
            SessionEvent::PostedOriginalPsbt(),
            Sender { state: self.state.into_polling() },
        )
    }

    /// The endpoint in the Payjoin URI
    pub fn endpoint(&self) -> Result<Url, url::ParseError> { self.pj_param.endpoint() }

    fn apply_posted_original_psbt(self) -> SendSession {
        SendSession::PollingForProposal(Sender { state: self.state.into_polling() })
    }
}

impl WithReplyKey {
    fn into_polling(self) -> PollingForProposal {
        PollingForProposal {
            pj_param: self.pj_param,
            psbt_ctx: self.psbt_ctx,
            reply_key: self.reply_key,
        }
    }
}

/// The OHTTP context of the original's POST, needed to open the directory's answer.
pub struct V2PostContext {
    ohttp_ctx: ohttp::ClientResponse,
}

/// The original is in the receiver's mailbox. The sender polls its own mailbox for the answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollingForProposal {
    pj_param: PjParam,
    psbt_ctx: PsbtContext,
    reply_key: HpkeSecretKey,
}

impl Sender<PollingForProposal> {
    /// Extract an OHTTP Encapsulated HTTP GET request for the receiver's answer.
    pub fn create_poll_request(
        &self,
        ohttp_relay: impl IntoUrl,
    ) -> Result<(Request, ohttp::ClientResponse), CreateRequestError> {
        check_expiration(&self.pj_param)?;
        let reply_mailbox = self.pj_param.directory().join(&self.reply_mailbox().to_string())?;
        mailbox_request(&self.pj_param, "GET", &reply_mailbox, None, ohttp_relay)
    }

    /// Process the directory's answer to [`Sender<PollingForProposal>::create_poll_request`].
    ///
    /// An empty mailbox leaves the sender as it was and a directory error is transient. An
    /// acceptable proposal completes the session and is returned ready for the sender to sign.
    /// Anything else, including an error reply from the receiver, ends the session.
    pub fn process_response(
        &self,
        response: &[u8],
        ohttp_ctx: ohttp::ClientResponse,
    ) -> ProposalTransition {
        let body = match process_get_res(response, ohttp_ctx) {
            Ok(Some(body)) => body,
            Ok(None) => {
                tracing::trace!("no proposal yet");
                return MaybeSuccessTransitionWithNoResults::no_results(self.clone());
            }
            Err(e) =>
                return MaybeSuccessTransitionWithNoResults::transient(
                    InternalEncapsulationError::DirectoryResponse(e).into(),
                ),
        };

        let plaintext =
            match decrypt_message_b(&body, self.pj_param.receiver_pubkey(), &self.reply_key) {
                Ok(plaintext) => plaintext,
                Err(e) => return end_session(InternalEncapsulationError::Hpke(e).into()),
            };
        let proposal = match proposal_from_reply(&plaintext) {
            Ok(proposal) => proposal,
            Err(e) => return end_session(e),
        };
        match self.psbt_ctx.clone().process_proposal(proposal) {
            Ok(psbt) => MaybeSuccessTransitionWithNoResults::success(
                psbt.clone(),
                SessionEvent::Closed(SenderSessionOutcome::Success(psbt)),
            ),
            Err(e) => end_session(e.into()),
        }
    }

    /// The endpoint in the Payjoin URI
    pub fn endpoint(&self) -> Result<Url, url::ParseError> { self.pj_param.endpoint() }

    fn reply_mailbox(&self) -> ShortId {
        ShortId::from_pubkey(HpkeKeyPair::from_secret_key(&self.reply_key).public_key())
    }
}

fn end_session(error: ResponseError) -> ProposalTransition {
    tracing::debug!("sender session failed: {error}");
    let event = SessionEvent::SessionInvalid(error.to_string());
    MaybeSuccessTransitionWithNoResults::fatal(event, error)
}

/// The receiver answers with a binary PSBT or with a JSON error reply, both zero padded.
///
/// A PSBT's magic bytes are never valid UTF-8, which tells the two apart.
fn proposal_from_reply(plaintext: &[u8]) -> Result<Psbt, ResponseError> {
    if let Ok(reply) = std::str::from_utf8(plaintext) {
        return Err(ResponseError::parse(reply.trim_end_matches('\0')));
    }
    Psbt::deserialize(plaintext).map_err(|e| InternalProposalError::Psbt(e).into())
}

#[cfg(test)]
mod test {
    use std::str::FromStr;
    use std::time::Duration;

    use bitcoin::{Address, Network};
    use payjoin_test_utils::{
        BoxError, InMemoryDirectory, EXAMPLE_URL, KEM, KEY_ID, PARSED_ORIGINAL_PSBT, RELAY_URL,
        SYMMETRIC,
    };

    use super::*;
    use crate::directory::ENCAPSULATED_MESSAGE_BYTES;
    use crate::error_codes::ErrorCode;
    use crate::hpke::encrypt_message_b;
    use crate::ohttp::OhttpKeys;
    use crate::persist::test_utils::InMemoryTestPersister;
    use crate::persist::{NoopSessionPersister, OptionalTransitionOutcome};
    use crate::receive::v2::ReceiverBuilder;
    use crate::send::AdditionalFeeContribution;
    use crate::uri::PayjoinExtras;

    /// The payee of the original PSBT test vector.
    const PAYEE: &str = "2N47mmrWXsNBvQR6k78hWJoTji57zXwNcU7";

    fn payee_address() -> Result<Address, BoxError> {
        Ok(Address::from_str(PAYEE)?.require_network(Network::Testnet)?)
    }

    fn example_ohttp_keys() -> Result<OhttpKeys, BoxError> {
        Ok(OhttpKeys(ohttp::KeyConfig::new(KEY_ID, KEM, Vec::from(SYMMETRIC))?))
    }

    /// A URI for a receiver holding `receiver_keys`, with its mailbox on `directory`.
    fn pj_uri_for<'a>(
        directory: Url,
        ohttp_keys: OhttpKeys,
        receiver_keys: &HpkeKeyPair,
        expiration: SystemTime,
    ) -> Result<PjUri<'a>, BoxError> {
        let pj_param = PjParam::new(
            directory,
            ShortId::from_pubkey(receiver_keys.public_key()),
            expiration,
            ohttp_keys,
            receiver_keys.public_key().clone(),
        );
        let extras = PayjoinExtras {
            endpoint: pj_param.endpoint()?,
            output_substitution: OutputSubstitution::Enabled,
        };
        Ok(bitcoin_uri::Uri::with_extras(payee_address()?, extras))
    }

    fn sender_for(
        directory: &InMemoryDirectory,
        receiver_keys: &HpkeKeyPair,
    ) -> Result<Sender<WithReplyKey>, BoxError> {
        let ohttp_keys = OhttpKeys::decode(&directory.ohttp_keys_encoded())?;
        let expiration = SystemTime::now() + Duration::from_secs(60);
        let uri = pj_uri_for(directory.url(), ohttp_keys, receiver_keys, expiration)?;
        Ok(SenderBuilder::new(PARSED_ORIGINAL_PSBT.clone(), uri)?
            .build_recommended(FeeRate::BROADCAST_MIN)?
            .save(&NoopSessionPersister::<SessionEvent>::default())?)
    }

    /// Post the original and return the sender waiting for an answer.
    fn posted(
        directory: &InMemoryDirectory,
        sender: Sender<WithReplyKey>,
        persister: &InMemoryTestPersister<SessionEvent>,
    ) -> Result<Sender<PollingForProposal>, BoxError> {
        let (req, ctx) = sender.create_v2_post_request(RELAY_URL.as_str())?;
        let res = directory.handle(&req.body)?;
        Ok(sender.process_response(&res, ctx).save(persister)?)
    }

    /// Play the receiver: encrypt `body` to the sender's reply key and drop it in its mailbox.
    fn reply(
        directory: &InMemoryDirectory,
        sender: &Sender<PollingForProposal>,
        receiver_keys: &HpkeKeyPair,
        body: &[u8],
    ) -> Result<(), BoxError> {
        let reply_pk = HpkeKeyPair::from_secret_key(&sender.reply_key).1;
        let message_b = encrypt_message_b(body, receiver_keys, &reply_pk)?;
        let mailbox = directory.url().join(&ShortId::from_pubkey(&reply_pk).to_string())?;
        let mut ohttp_keys = OhttpKeys::decode(&directory.ohttp_keys_encoded())?;
        let (req, _) =
            ohttp_encapsulate(&mut ohttp_keys, "POST", mailbox.as_str(), Some(&message_b))?;
        directory.handle(&req)?;
        Ok(())
    }

    fn poll(
        directory: &InMemoryDirectory,
        sender: &Sender<PollingForProposal>,
    ) -> Result<ProposalTransition, BoxError> {
        let (req, ctx) = sender.create_poll_request(RELAY_URL.as_str())?;
        let res = directory.handle(&req.body)?;
        Ok(sender.process_response(&res, ctx))
    }

    #[test]
    fn builder_defaults_follow_the_receiver_uri() -> Result<(), BoxError> {
        let receiver =
            ReceiverBuilder::new(payee_address()?, EXAMPLE_URL.clone(), example_ohttp_keys()?)?
                .build()
                .save(&NoopSessionPersister::default())?;
        let uri = receiver.pj_uri();
        let payee = uri.address.script_pubkey();

        let sender = SenderBuilder::new(PARSED_ORIGINAL_PSBT.clone(), uri)?
            .build_recommended(FeeRate::BROADCAST_MIN)?
            .save(&NoopSessionPersister::<SessionEvent>::default())?;
        assert_eq!(sender.psbt_ctx.output_substitution, OutputSubstitution::Enabled);
        assert_eq!(sender.psbt_ctx.payee, payee);
        assert_eq!(
            sender.psbt_ctx.fee_contribution,
            Some(AdditionalFeeContribution { max_amount: Amount::from_sat(91), vout: 0 })
        );
        assert_eq!(sender.psbt_ctx.min_fee_rate, FeeRate::BROADCAST_MIN);
        let receiver_param = receiver.pj_uri().extras.v2_param()?;
        assert_eq!(sender.pj_param.receiver_pubkey(), receiver_param.receiver_pubkey());
        Ok(())
    }

    #[test]
    fn substitution_can_be_disabled() -> Result<(), BoxError> {
        let uri = pj_uri_for(
            EXAMPLE_URL.clone(),
            example_ohttp_keys()?,
            &HpkeKeyPair::gen_keypair(),
            SystemTime::now() + Duration::from_secs(60),
        )?;
        let sender = SenderBuilder::new(PARSED_ORIGINAL_PSBT.clone(), uri)?
            .always_disable_output_substitution()
            .build_non_incentivizing(FeeRate::ZERO)?
            .save(&NoopSessionPersister::<SessionEvent>::default())?;
        assert_eq!(sender.psbt_ctx.output_substitution, OutputSubstitution::Disabled);
        assert_eq!(sender.psbt_ctx.fee_contribution, None);
        Ok(())
    }

    #[test]
    fn uri_without_v2_endpoint_is_rejected() -> Result<(), BoxError> {
        let extras = PayjoinExtras {
            endpoint: EXAMPLE_URL.clone(),
            output_substitution: OutputSubstitution::Enabled,
        };
        let uri = bitcoin_uri::Uri::with_extras(payee_address()?, extras);
        assert!(SenderBuilder::new(PARSED_ORIGINAL_PSBT.clone(), uri).is_err());
        Ok(())
    }

    #[test]
    fn expired_uri_is_rejected() -> Result<(), BoxError> {
        let uri = pj_uri_for(
            EXAMPLE_URL.clone(),
            example_ohttp_keys()?,
            &HpkeKeyPair::gen_keypair(),
            SystemTime::now() - Duration::from_secs(1),
        )?;
        assert!(SenderBuilder::new(PARSED_ORIGINAL_PSBT.clone(), uri).is_err());
        Ok(())
    }

    #[test]
    fn build_records_creation() -> Result<(), BoxError> {
        let uri = pj_uri_for(
            EXAMPLE_URL.clone(),
            example_ohttp_keys()?,
            &HpkeKeyPair::gen_keypair(),
            SystemTime::now() + Duration::from_secs(60),
        )?;
        let persister = InMemoryTestPersister::<SessionEvent>::default();
        let sender = SenderBuilder::new(PARSED_ORIGINAL_PSBT.clone(), uri)?
            .build_recommended(FeeRate::BROADCAST_MIN)?
            .save(&persister)?;
        assert_eq!(persister.events(), vec![SessionEvent::Created(Box::new(sender.state))]);
        Ok(())
    }

    #[test]
    fn post_request_goes_through_the_relay() -> Result<(), BoxError> {
        let directory = InMemoryDirectory::new();
        let sender = sender_for(&directory, &HpkeKeyPair::gen_keypair())?;
        let (request, _) = sender.create_v2_post_request(RELAY_URL.as_str())?;
        assert_eq!(request.url.as_str(), "https://relay.example/https://directory.example/");
        assert_eq!(request.content_type, "message/ohttp-req");
        assert_eq!(request.body.len(), ENCAPSULATED_MESSAGE_BYTES);
        Ok(())
    }

    #[test]
    fn expired_session_cannot_post() -> Result<(), BoxError> {
        let directory = InMemoryDirectory::new();
        let sender = sender_for(&directory, &HpkeKeyPair::gen_keypair())?;
        let param = &sender.pj_param;
        let expired = PjParam::new(
            param.directory().clone(),
            ShortId::from_pubkey(param.receiver_pubkey()),
            SystemTime::now() - Duration::from_secs(1),
            param.ohttp_keys().clone(),
            param.receiver_pubkey().clone(),
        );
        let sender = Sender { state: WithReplyKey { pj_param: expired, ..sender.state } };
        let err = sender
            .create_v2_post_request(RELAY_URL.as_str())
            .err()
            .expect("the session expired");
        assert!(err.is_expired());
        Ok(())
    }

    #[test]
    fn bad_directory_response_is_transient() -> Result<(), BoxError> {
        let directory = InMemoryDirectory::new();
        let sender = sender_for(&directory, &HpkeKeyPair::gen_keypair())?;
        let (_, ctx) = sender.create_v2_post_request(RELAY_URL.as_str())?;
        let persister = InMemoryTestPersister::<SessionEvent>::default();
        let err = sender
            .process_response(b"too short", ctx)
            .save(&persister)
            .expect_err("response is too short");
        assert!(err.is_transient());
        assert!(persister.events().is_empty());
        assert!(!persister.is_closed());
        Ok(())
    }

    #[test]
    fn empty_reply_mailbox_keeps_polling() -> Result<(), BoxError> {
        let directory = InMemoryDirectory::new();
        let sender = sender_for(&directory, &HpkeKeyPair::gen_keypair())?;
        let persister = InMemoryTestPersister::<SessionEvent>::default();
        let polling = posted(&directory, sender, &persister)?;
        assert_eq!(directory.mailbox_count(), 1);
        assert_eq!(persister.events(), vec![SessionEvent::PostedOriginalPsbt()]);

        let outcome = poll(&directory, &polling)?.save(&persister)?;
        assert_eq!(outcome, OptionalTransitionOutcome::Stasis(polling));
        assert_eq!(persister.events().len(), 1);
        Ok(())
    }

    #[test]
    fn error_reply_ends_the_session() -> Result<(), BoxError> {
        let directory = InMemoryDirectory::new();
        let receiver_keys = HpkeKeyPair::gen_keypair();
        let sender = sender_for(&directory, &receiver_keys)?;
        let persister = InMemoryTestPersister::<SessionEvent>::default();
        let polling = posted(&directory, sender, &persister)?;

        let error_reply = r#"{"errorCode":"unavailable","message":"Receiver error"}"#;
        reply(&directory, &polling, &receiver_keys, error_reply.as_bytes())?;
        let err = poll(&directory, &polling)?.save(&persister).expect_err("receiver said no");
        assert!(!err.is_transient());
        match err.api_error_ref() {
            Some(ResponseError::WellKnown(e)) => assert_eq!(e.code(), ErrorCode::Unavailable),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(persister.is_closed());
        assert!(matches!(persister.events().last(), Some(SessionEvent::SessionInvalid(_))));
        Ok(())
    }

    #[test]
    fn reply_from_another_key_ends_the_session() -> Result<(), BoxError> {
        let directory = InMemoryDirectory::new();
        let sender = sender_for(&directory, &HpkeKeyPair::gen_keypair())?;
        let persister = InMemoryTestPersister::<SessionEvent>::default();
        let polling = posted(&directory, sender, &persister)?;

        let impostor = HpkeKeyPair::gen_keypair();
        reply(&directory, &polling, &impostor, &PARSED_ORIGINAL_PSBT.serialize())?;
        let err = poll(&directory, &polling)?.save(&persister).expect_err("reply is forged");
        assert!(!err.is_transient());
        assert!(persister.is_closed());
        Ok(())
    }

    #[test]
    fn unparseable_reply_is_a_validation_error() {
        assert!(matches!(
            proposal_from_reply(b"not json\0\0\0"),
            Err(ResponseError::Validation(_))
        ));
        assert!(matches!(
            proposal_from_reply(&[0xff, 0xfe, 0x00]),
            Err(ResponseError::Validation(_))
        ));
    }
}
