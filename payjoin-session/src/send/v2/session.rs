use std::time::SystemTime;

use bitcoin::psbt::Psbt;
use serde::{Deserialize, Serialize};
use url::Url;

use super::{SendSession, WithReplyKey};
use crate::persist::SessionPersister;
use crate::uri::v2::PjParam;
use crate::ImplementationError;

/// Errors that can occur when replaying a sender event log
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
    EmptyEventLog,
    Expired(SystemTime),
    InvalidStateAndEvent(Box<SessionEvent>, Option<Box<SendSession>>),
    PersistenceFailure(ImplementationError),
}

/// Replay a sender event log to get the sender in its current state [SendSession]
/// and a session history [SessionHistory]
///
/// A log that cannot be replayed, or whose receiver endpoint has expired, is closed. The
/// original PSBT of an expired session is still available from the history of a later replay.
pub fn replay_event_log<P>(persister: &P) -> Result<(SendSession, SessionHistory), ReplayError>
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

    let mut sender = match logs.next() {
        Some(SessionEvent::Created(with_reply_key)) => {
            history.events.push(SessionEvent::Created(with_reply_key.clone()));
            SendSession::new(*with_reply_key)
        }
        Some(event) =>
            return Err(close_on_error(
                InternalReplayError::InvalidStateAndEvent(Box::new(event), None).into(),
            )),
        None => return Err(InternalReplayError::EmptyEventLog.into()),
    };

    for event in logs {
        history.events.push(event.clone());
        sender = sender.process_event(event).map_err(close_on_error)?;
    }

    if let Some(expiration) = sender.pj_param().map(PjParam::expiration) {
        if SystemTime::now() > expiration {
            tracing::debug!("closing expired sender session");
            return Err(close_on_error(InternalReplayError::Expired(expiration).into()));
        }
    }

    Ok((sender, history))
}

/// Where a sender session stands, as told by its event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
}

/// A collection of events that have occurred during a sender's session.
/// It is obtained by calling [replay_event_log].
#[derive(Debug, Default, Clone)]
pub struct SessionHistory {
    events: Vec<SessionEvent>,
}

impl SessionHistory {
    fn with_reply_key(&self) -> Option<&WithReplyKey> {
        self.events.iter().find_map(|event| match event {
            SessionEvent::Created(with_reply_key) => Some(with_reply_key.as_ref()),
            _ => None,
        })
    }

    /// The original transaction, to broadcast if the payjoin does not happen.
    pub fn fallback_tx(&self) -> Option<bitcoin::Transaction> {
        self.with_reply_key()
            .map(|state| state.psbt_ctx.original_psbt.clone().extract_tx_unchecked_fee_rate())
    }

    /// The receiver's endpoint, as found in its Payjoin URI
    pub fn endpoint(&self) -> Option<Url> {
        self.with_reply_key().and_then(|state| state.pj_param.endpoint().ok())
    }

    /// The checked proposal, ready to be signed, once the session completed
    pub fn proposal(&self) -> Option<Psbt> {
        self.events.iter().find_map(|event| match event {
            SessionEvent::Closed(SenderSessionOutcome::Success(psbt)) => Some(psbt.clone()),
            _ => None,
        })
    }

    /// Terminal error from the session if present
    pub fn terminal_error(&self) -> Option<String> {
        self.events.iter().find_map(|event| match event {
            SessionEvent::SessionInvalid(err_str) => Some(err_str.clone()),
            _ => None,
        })
    }

    pub fn status(&self) -> SessionStatus {
        let closed = self.events.iter().rev().find_map(|event| match event {
            SessionEvent::Closed(SenderSessionOutcome::Success(_)) =>
                Some(SessionStatus::Completed),
            SessionEvent::Closed(SenderSessionOutcome::Failure)
            | SessionEvent::SessionInvalid(_) => Some(SessionStatus::Failed),
            _ => None,
        });
        match closed {
            Some(status) => status,
            None if self
                .with_reply_key()
                .is_some_and(|state| SystemTime::now() > state.pj_param.expiration()) =>
                SessionStatus::Failed,
            None => SessionStatus::Active,
        }
    }
}

/// How a closed sender session ended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SenderSessionOutcome {
    /// The receiver's proposal passed every check
    Success(Psbt),
    /// The session was rejected or abandoned
    Failure,
}

/// Represents a piece of information that the sender has obtained from the session
/// Each event can be used to transition the sender state machine to a new state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionEvent {
    Created(Box<WithReplyKey>),
    /// The directory accepted the original
    PostedOriginalPsbt(),
    /// Session is invalid. This is a irrecoverable error. Fallback tx should be broadcasted.
    SessionInvalid(String),
    Closed(SenderSessionOutcome),
}
