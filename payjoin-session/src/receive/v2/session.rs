use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use super::{ReceiveSession, SessionContext};
use crate::hpke::HpkePublicKey;
use crate::persist::SessionPersister;
use crate::receive::{common, JsonReply, OriginalPayload, PsbtContext};
use crate::{ImplementationError, PjUri};

/// Errors that can occur when replaying a receiver event log
#[derive(Debug)]
pub struct ReplayError(InternalReplayError);

impl std::fmt::Display for ReplayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use InternalReplayError::*;
        match &self.0 {
            EmptyEventLog => write!(f, "No events to replay"),
            Expired(expiration) => write!(f, "Session expired at {expiration:?}"),
            InvalidStateAndEvent(event, Some(state)) => write!(
                f,
                "Invalid combination of state ({state:?}) and event ({event:?}) during replay",
            ),
            InvalidStateAndEvent(event, None) =>
                write!(f, "Event log must start with session creation, found {event:?}"),
            PersistenceFailure(e) => write!(f, "Persistence failure: {e}"),
        }
    }
}

impl std::error::Error for ReplayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.0 {
            InternalReplayError::PersistenceFailure(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<InternalReplayError> for ReplayError {
    fn from(e: InternalReplayError) -> Self { ReplayError(e) }
}

#[derive(Debug)]
pub(crate) enum InternalReplayError {
    /// Nothing was ever saved
    EmptyEventLog,
    /// The session expired before it was closed
    Expired(SystemTime),
    /// An event that cannot follow the state it was applied to
    InvalidStateAndEvent(Box<SessionEvent>, Option<Box<ReceiveSession>>),
    /// Application storage error
    PersistenceFailure(ImplementationError),
}

/// Replay a receiver event log to get the receiver in its current state [ReceiveSession]
/// and a session history [SessionHistory]
///
/// A log that cannot be replayed, or whose session has expired, is closed.
pub fn replay_event_log<P>(persister: &P) -> Result<(ReceiveSession, SessionHistory), ReplayError>
where
    P: SessionPersister,
    P::SessionEvent: Into<SessionEvent> + Clone,
{
    let close_on_error = |e: ReplayError| -> ReplayError {
        if let Err(storage_err) = persister.close() {
            return InternalReplayError::PersistenceFailure(Box::new(storage_err)).into();
        }
        e
    };

    let mut logs = persister
        .load()
        .map_err(|e| InternalReplayError::PersistenceFailure(Box::new(e)))?
        .map(Into::into);
    let mut history = SessionHistory::default();

    let mut receiver = match logs.next() {
        Some(SessionEvent::Created(context)) => {
            history.events.push(SessionEvent::Created(context.clone()));
            ReceiveSession::new(context)
        }
        Some(event) =>
            return Err(close_on_error(
                InternalReplayError::InvalidStateAndEvent(Box::new(event), None).into(),
            )),
        None => return Err(InternalReplayError::EmptyEventLog.into()),
    };

    for event in logs {
        history.events.push(event.clone());
        receiver = receiver.process_event(event).map_err(close_on_error)?;
    }

    if let Some(context) = receiver.session_context() {
        if context.is_expired() {
            tracing::debug!("closing expired receiver session {}", context.id());
            return Err(close_on_error(InternalReplayError::Expired(context.expiration).into()));
        }
    }

    Ok((receiver, history))
}

/// Where a receiver session stands, as told by its event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
}

/// A collection of events that have occurred during a receiver's session.
/// It is obtained by calling [replay_event_log].
#[derive(Debug, Default, Clone)]
pub struct SessionHistory {
    events: Vec<SessionEvent>,
}

impl SessionHistory {
    /// Receiver session Payjoin URI
    pub fn pj_uri<'a>(&self) -> Option<PjUri<'a>> {
        self.session_context().map(super::pj_uri)
    }

    fn original_payload(&self) -> Option<&OriginalPayload> {
        self.events.iter().find_map(|event| match event {
            SessionEvent::RetrievedOriginalPayload(original, _) => Some(original),
            _ => None,
        })
    }

    /// Fallback transaction from the session if present
    pub fn fallback_tx(&self) -> Option<bitcoin::Transaction> {
        self.original_payload().map(OriginalPayload::extract_tx_to_schedule_broadcast)
    }

    /// Psbt with fee contributions applied
    pub fn psbt_ready_for_signing(&self) -> Option<bitcoin::Psbt> {
        self.events.iter().find_map(|event| match event {
            SessionEvent::AppliedFeeRange(psbt_context) => Some(psbt_context.payjoin_psbt.clone()),
            _ => None,
        })
    }

    /// Terminal error from the session if present, with the reply owed to the sender if any
    pub fn terminal_error(&self) -> Option<(String, Option<JsonReply>)> {
        self.events.iter().find_map(|event| match event {
            SessionEvent::SessionInvalid(err_str) => Some((err_str.clone(), None)),
            SessionEvent::GotReplyableError(reply, _) =>
                Some((reply.message().to_owned(), Some(reply.clone()))),
            _ => None,
        })
    }

    pub fn status(&self) -> SessionStatus {
        let closed = self.events.iter().rev().find_map(|event| match event {
            SessionEvent::Closed(outcome) => Some(*outcome),
            SessionEvent::SessionInvalid(_) => Some(ReceiverSessionOutcome::Failure),
            _ => None,
        });
        match closed {
            Some(ReceiverSessionOutcome::Success) => SessionStatus::Completed,
            Some(ReceiverSessionOutcome::Failure) => SessionStatus::Failed,
            None if self.session_context().is_some_and(SessionContext::is_expired) =>
                SessionStatus::Failed,
            None => SessionStatus::Active,
        }
    }

    fn session_context(&self) -> Option<&SessionContext> {
        self.events.iter().find_map(|event| match event {
            SessionEvent::Created(session_context) => Some(session_context),
            _ => None,
        })
    }
}

/// How a closed receiver session ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReceiverSessionOutcome {
    /// The proposal was delivered to the sender
    Success,
    /// The session was rejected or abandoned
    Failure,
}

/// Represents a piece of information that the receiver has obtained from the session
/// Each event can be used to transition the receiver state machine to a new state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionEvent {
    Created(SessionContext),
    RetrievedOriginalPayload(OriginalPayload, HpkePublicKey),
    CheckedBroadcastSuitability(),
    CheckedInputsNotOwned(),
    CheckedNoInputsSeenBefore(),
    IdentifiedReceiverOutputs(common::WantsOutputs),
    CommittedOutputs(common::WantsInputs),
    CommittedInputs(common::WantsFeeRange),
    AppliedFeeRange(PsbtContext),
    FinalizedProposal(bitcoin::Psbt),
    /// The sender is owed this error reply, encrypted to its reply key
    GotReplyableError(JsonReply, HpkePublicKey),
    /// Session is invalid. This is a irrecoverable error. Fallback tx should be broadcasted.
    ///
    /// Only the message is kept since nothing is replayed from it.
    SessionInvalid(String),
    Closed(ReceiverSessionOutcome),
}

#[cfg(test)]
mod tests {
    use bitcoin::{OutPoint, Psbt, Script, Transaction};
    use payjoin_test_utils::BoxError;

    use super::*;
    use crate::hpke::HpkeKeyPair;
    use crate::persist::test_utils::InMemoryTestPersister;
    use crate::persist::NoopSessionPersister;
    use crate::receive::tests::original_from_test_vector;
    use crate::receive::v2::test::{unchecked_receiver_from_test_vector, SHARED_CONTEXT};
    use crate::receive::v2::{Initialized, Receiver, UncheckedOriginalPayload};

    fn not_owned(_: &Script) -> Result<bool, ImplementationError> { Ok(false) }

    fn not_seen(_: &OutPoint) -> Result<bool, ImplementationError> { Ok(false) }

    fn sign(psbt: &Psbt) -> Result<Psbt, ImplementationError> { Ok(psbt.clone()) }

    fn pays_receiver(
        receiver: &Receiver<UncheckedOriginalPayload>,
    ) -> impl Fn(&Script) -> Result<bool, ImplementationError> {
        let receiver_script = receiver.original.psbt.unsigned_tx.output[1].script_pubkey.clone();
        move |script: &Script| Ok(script == receiver_script.as_script())
    }

    /// Save the creation and retrieval events, as a polling receiver would have.
    fn retrieved(persister: &InMemoryTestPersister<SessionEvent>) -> Result<(), BoxError> {
        let unchecked = unchecked_receiver_from_test_vector();
        persister.save_event(SessionEvent::Created(SHARED_CONTEXT.clone()))?;
        persister.save_event(SessionEvent::RetrievedOriginalPayload(
            unchecked.original.clone(),
            unchecked.context.reply_key.clone().expect("test vector has a reply key"),
        ))?;
        Ok(())
    }

    fn unchecked_from(
        persister: &InMemoryTestPersister<SessionEvent>,
    ) -> Result<Receiver<UncheckedOriginalPayload>, BoxError> {
        match replay_event_log(persister)?.0 {
            ReceiveSession::UncheckedOriginalPayload(receiver) => Ok(receiver),
            other => Err(format!("unexpected state {other:?}").into()),
        }
    }

    #[test]
    fn test_session_event_serialization_roundtrip() -> Result<(), BoxError> {
        let persister = NoopSessionPersister::<SessionEvent>::default();
        let unchecked = unchecked_receiver_from_test_vector();
        let is_receiver_output = pays_receiver(&unchecked);
        let wants_outputs = unchecked
            .clone()
            .assume_interactive_receiver()
            .save(&persister)?
            .check_inputs_not_owned(not_owned)
            .save(&persister)?
            .check_no_inputs_seen_before(not_seen)
            .save(&persister)?
            .identify_receiver_outputs(is_receiver_output)
            .save(&persister)?;
        let wants_inputs = wants_outputs.clone().commit_outputs().save(&persister)?;
        let wants_fee_range = wants_inputs.clone().commit_inputs().save(&persister)?;
        let provisional = wants_fee_range.clone().apply_fee_range(None, None).save(&persister)?;
        let payjoin_proposal = provisional.clone().finalize_proposal(sign).save(&persister)?;

        let test_cases = vec![
            SessionEvent::Created(SHARED_CONTEXT.clone()),
            SessionEvent::RetrievedOriginalPayload(
                original_from_test_vector(),
                HpkeKeyPair::gen_keypair().1,
            ),
            SessionEvent::CheckedBroadcastSuitability(),
            SessionEvent::CheckedInputsNotOwned(),
            SessionEvent::CheckedNoInputsSeenBefore(),
            SessionEvent::IdentifiedReceiverOutputs(wants_outputs.inner.clone()),
            SessionEvent::CommittedOutputs(wants_inputs.inner.clone()),
            SessionEvent::CommittedInputs(wants_fee_range.inner.clone()),
            SessionEvent::AppliedFeeRange(provisional.psbt_context.clone()),
            SessionEvent::FinalizedProposal(payjoin_proposal.psbt().clone()),
            SessionEvent::GotReplyableError(
                JsonReply::new(crate::error_codes::ErrorCode::Unavailable, "Receiver error"),
                HpkeKeyPair::gen_keypair().1,
            ),
            SessionEvent::SessionInvalid("gone".to_owned()),
            SessionEvent::Closed(ReceiverSessionOutcome::Success),
        ];

        for event in test_cases {
            let serialized = serde_json::to_string(&event)?;
            let deserialized: SessionEvent = serde_json::from_str(&serialized)?;
            assert_eq!(event, deserialized);
        }
        Ok(())
    }

    #[test]
    fn empty_log_cannot_be_replayed() {
        let persister = InMemoryTestPersister::<SessionEvent>::default();
        let err = replay_event_log(&persister).expect_err("nothing to replay");
        assert!(matches!(err.0, InternalReplayError::EmptyEventLog));
    }

    #[test]
    fn test_replaying_session_creation() -> Result<(), BoxError> {
        let persister = InMemoryTestPersister::<SessionEvent>::default();
        persister.save_event(SessionEvent::Created(SHARED_CONTEXT.clone()))?;

        let (receiver, history) = replay_event_log(&persister)?;
        assert_eq!(
            receiver,
            ReceiveSession::Initialized(Receiver {
                state: Initialized { context: SHARED_CONTEXT.clone() }
            })
        );
        assert_eq!(history.status(), SessionStatus::Active);
        assert!(history.pj_uri().is_some());
        assert_eq!(history.fallback_tx(), None);
        assert_eq!(history.terminal_error(), None);
        Ok(())
    }

    #[test]
    fn replay_follows_the_live_session() -> Result<(), BoxError> {
        let persister = InMemoryTestPersister::<SessionEvent>::default();
        retrieved(&persister)?;
        let unchecked = unchecked_from(&persister)?;
        let fallback: Transaction = unchecked.extract_tx_to_schedule_broadcast();
        let is_receiver_output = pays_receiver(&unchecked);

        let wants_outputs = unchecked
            .assume_interactive_receiver()
            .save(&persister)?
            .check_inputs_not_owned(not_owned)
            .save(&persister)?
            .check_no_inputs_seen_before(not_seen)
            .save(&persister)?
            .identify_receiver_outputs(is_receiver_output)
            .save(&persister)?;
        let (replayed, _) = replay_event_log(&persister)?;
        assert_eq!(replayed, ReceiveSession::WantsOutputs(wants_outputs.clone()));

        let provisional = wants_outputs
            .commit_outputs()
            .save(&persister)?
            .commit_inputs()
            .save(&persister)?
            .apply_fee_range(None, None)
            .save(&persister)?;
        let payjoin_proposal = provisional.clone().finalize_proposal(sign).save(&persister)?;

        let (replayed, history) = replay_event_log(&persister)?;
        assert_eq!(replayed, ReceiveSession::PayjoinProposal(payjoin_proposal));
        assert_eq!(history.fallback_tx(), Some(fallback));
        assert_eq!(history.psbt_ready_for_signing(), Some(provisional.psbt_to_sign()));
        assert_eq!(history.status(), SessionStatus::Active);

        // Replaying is a pure fold over the log
        let (again, _) = replay_event_log(&persister)?;
        assert_eq!(again, replayed);

        persister.save_event(SessionEvent::Closed(ReceiverSessionOutcome::Success))?;
        let (closed, history) = replay_event_log(&persister)?;
        assert_eq!(closed, ReceiveSession::Closed(ReceiverSessionOutcome::Success));
        assert_eq!(history.status(), SessionStatus::Completed);
        Ok(())
    }

    fn progress(session: &ReceiveSession) -> u8 {
        match session {
            ReceiveSession::Initialized(_) => 0,
            ReceiveSession::UncheckedOriginalPayload(_) => 1,
            ReceiveSession::MaybeInputsOwned(_) => 2,
            ReceiveSession::MaybeInputsSeen(_) => 3,
            ReceiveSession::OutputsUnknown(_) => 4,
            ReceiveSession::WantsOutputs(_) => 5,
            ReceiveSession::WantsInputs(_) => 6,
            ReceiveSession::WantsFeeRange(_) => 7,
            ReceiveSession::ProvisionalProposal(_) => 8,
            ReceiveSession::PayjoinProposal(_) => 9,
            ReceiveSession::HasReplyableError(_) => 10,
            ReceiveSession::Closed(_) => 11,
        }
    }

    #[test]
    fn every_prefix_of_a_session_log_replays_forward() -> Result<(), BoxError> {
        let persister = InMemoryTestPersister::<SessionEvent>::default();
        retrieved(&persister)?;
        let unchecked = unchecked_from(&persister)?;
        let is_receiver_output = pays_receiver(&unchecked);
        unchecked
            .assume_interactive_receiver()
            .save(&persister)?
            .check_inputs_not_owned(not_owned)
            .save(&persister)?
            .check_no_inputs_seen_before(not_seen)
            .save(&persister)?
            .identify_receiver_outputs(is_receiver_output)
            .save(&persister)?
            .commit_outputs()
            .save(&persister)?
            .commit_inputs()
            .save(&persister)?
            .apply_fee_range(None, None)
            .save(&persister)?
            .finalize_proposal(sign)
            .save(&persister)?;
        persister.save_event(SessionEvent::Closed(ReceiverSessionOutcome::Success))?;

        let log = persister.events();
        assert_eq!(log.len(), 11);
        let mut reached = Vec::with_capacity(log.len());
        for len in 1..=log.len() {
            let prefix = InMemoryTestPersister::<SessionEvent>::default();
            for event in &log[..len] {
                prefix.save_event(event.clone())?;
            }
            let (session, history) = replay_event_log(&prefix)?;
            assert!(!prefix.is_closed(), "prefix of {len} events should replay cleanly");
            assert_eq!(history.events.len(), len);
            reached.push(progress(&session));
        }
        assert!(reached.windows(2).all(|pair| pair[0] <= pair[1]), "went backwards: {reached:?}");
        assert_eq!(reached.first(), Some(&0));
        assert_eq!(reached.last(), Some(&11));
        Ok(())
    }

    #[test]
    fn replayable_error_is_restored() -> Result<(), BoxError> {
        let persister = InMemoryTestPersister::<SessionEvent>::default();
        retrieved(&persister)?;
        let unchecked = unchecked_from(&persister)?;
        let owned = |_: &Script| -> Result<bool, ImplementationError> { Ok(true) };
        let err = unchecked
            .assume_interactive_receiver()
            .save(&persister)?
            .check_inputs_not_owned(owned)
            .save(&persister)
            .expect_err("an owned input is rejected");
        let error_state = err.error_state().expect("the sender is owed a reply");

        let (replayed, history) = replay_event_log(&persister)?;
        assert_eq!(replayed, ReceiveSession::HasReplyableError(error_state));
        let (_, reply) = history.terminal_error().expect("rejection is recorded");
        assert_eq!(
            reply.map(|reply| reply.error_code()),
            Some(crate::error_codes::ErrorCode::OriginalPsbtRejected)
        );
        assert_eq!(history.status(), SessionStatus::Active);

        persister.save_event(SessionEvent::Closed(ReceiverSessionOutcome::Failure))?;
        let (_, history) = replay_event_log(&persister)?;
        assert_eq!(history.status(), SessionStatus::Failed);
        Ok(())
    }

    #[test]
    fn out_of_order_event_closes_the_log() -> Result<(), BoxError> {
        let persister = InMemoryTestPersister::<SessionEvent>::default();
        persister.save_event(SessionEvent::Created(SHARED_CONTEXT.clone()))?;
        persister.save_event(SessionEvent::CheckedInputsNotOwned())?;

        let err = replay_event_log(&persister).expect_err("inputs are checked after retrieval");
        assert!(matches!(err.0, InternalReplayError::InvalidStateAndEvent(_, Some(_))));
        assert!(persister.is_closed());

        let persister = InMemoryTestPersister::<SessionEvent>::default();
        persister.save_event(SessionEvent::CheckedInputsNotOwned())?;
        let err = replay_event_log(&persister).expect_err("a log starts with creation");
        assert!(matches!(err.0, InternalReplayError::InvalidStateAndEvent(_, None)));
        Ok(())
    }

    #[test]
    fn expired_session_is_closed_on_replay() -> Result<(), BoxError> {
        let expired = SessionContext {
            expiration: SystemTime::now() - std::time::Duration::from_secs(1),
            ..SHARED_CONTEXT.clone()
        };
        let persister = InMemoryTestPersister::<SessionEvent>::default();
        persister.save_event(SessionEvent::Created(expired))?;

        let err = replay_event_log(&persister).expect_err("session expired");
        assert!(matches!(err.0, InternalReplayError::Expired(_)));
        assert!(persister.is_closed());
        Ok(())
    }

    #[test]
    fn invalid_session_is_closed_as_failure() -> Result<(), BoxError> {
        let persister = InMemoryTestPersister::<SessionEvent>::default();
        persister.save_event(SessionEvent::Created(SHARED_CONTEXT.clone()))?;
        persister.save_event(SessionEvent::SessionInvalid("undecryptable".to_owned()))?;

        let (receiver, history) = replay_event_log(&persister)?;
        assert_eq!(receiver, ReceiveSession::Closed(ReceiverSessionOutcome::Failure));
        assert_eq!(history.status(), SessionStatus::Failed);
        assert_eq!(history.terminal_error(), Some(("undecryptable".to_owned(), None)));
        Ok(())
    }
}
