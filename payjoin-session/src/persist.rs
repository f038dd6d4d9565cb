//! Event-sourced session persistence.
//!
//! Every typestate transition returns a transition object rather than the next state. Calling
//! `save` (or `save_async`) on it appends the transition's event to a [`SessionPersister`] and only
//! then hands back the next state, so a session can never advance past what has been stored.

use std::fmt;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::ImplementationError;

/// What the persister has to do for a transition to take effect.
pub(crate) enum PersistActions<Event> {
    NoOp,
    Save(Event),
    SaveAndClose(Event),
}

impl<Event> PersistActions<Event> {
    fn execute<P>(self, persister: &P) -> Result<(), P::InternalStorageError>
    where
        P: SessionPersister<SessionEvent = Event>,
    {
        match self {
            Self::NoOp => {}
            Self::Save(event) => persister.save_event(event)?,
            Self::SaveAndClose(event) => {
                persister.save_event(event)?;
                persister.close()?;
            }
        }
        Ok(())
    }

    async fn execute_async<P>(self, persister: &P) -> Result<(), P::InternalStorageError>
    where
        P: AsyncSessionPersister<SessionEvent = Event>,
        Event: Send,
    {
        match self {
            Self::NoOp => {}
            Self::Save(event) => persister.save_event(event).await?,
            Self::SaveAndClose(event) => {
                persister.save_event(event).await?;
                persister.close().await?;
            }
        }
        Ok(())
    }
}

type Outcome<T, Err, ErrorState> = Result<T, ApiError<Err, ErrorState>>;

fn commit<P, T, Err, ErrorState>(
    actions: PersistActions<P::SessionEvent>,
    outcome: Outcome<T, Err, ErrorState>,
    persister: &P,
) -> Result<T, PersistedError<Err, P::InternalStorageError, ErrorState>>
where
    P: SessionPersister,
    Err: std::error::Error,
    ErrorState: fmt::Debug,
{
    actions.execute(persister).map_err(InternalPersistedError::Storage)?;
    Ok(outcome.map_err(InternalPersistedError::Api)?)
}

async fn commit_async<P, T, Err, ErrorState>(
    actions: PersistActions<P::SessionEvent>,
    outcome: Outcome<T, Err, ErrorState>,
    persister: &P,
) -> Result<T, PersistedError<Err, P::InternalStorageError, ErrorState>>
where
    P: AsyncSessionPersister,
    Err: std::error::Error,
    ErrorState: fmt::Debug,
{
    actions.execute_async(persister).await.map_err(InternalPersistedError::Storage)?;
    Ok(outcome.map_err(InternalPersistedError::Api)?)
}

/// Wrapper that marks the progression of a state machine
pub struct AcceptNextState<Event, NextState>(pub(crate) Event, pub(crate) NextState);

/// Either a successful transition or a signal that the caller should resume from the current state
pub enum AcceptOptionalTransition<Event, NextState, CurrentState> {
    Success(AcceptNextState<Event, NextState>),
    NoResults(CurrentState),
}

/// The ways a transition can be refused.
pub enum Rejection<Event, Err, ErrorState = ()> {
    Fatal(RejectFatal<Event, Err>),
    Transient(RejectTransient<Err>),
    ReplyableError(RejectReplyableError<Event, ErrorState, Err>),
}

impl<Event, Err, ErrorState> Rejection<Event, Err, ErrorState> {
    pub fn fatal(event: Event, error: Err) -> Self { Rejection::Fatal(RejectFatal(event, error)) }
    pub fn transient(error: Err) -> Self { Rejection::Transient(RejectTransient(error)) }
    pub fn replyable_error(event: Event, error_state: ErrorState, error: Err) -> Self {
        Rejection::ReplyableError(RejectReplyableError(event, error_state, error))
    }

    fn into_outcome<T>(self) -> (PersistActions<Event>, Outcome<T, Err, ErrorState>) {
        match self {
            Rejection::Fatal(RejectFatal(event, error)) =>
                (PersistActions::SaveAndClose(event), Err(ApiError::Fatal(error))),
            Rejection::Transient(RejectTransient(error)) =>
                (PersistActions::NoOp, Err(ApiError::Transient(error))),
            Rejection::ReplyableError(RejectReplyableError(event, error_state, error)) =>
                (PersistActions::Save(event), Err(ApiError::FatalWithState(error, error_state))),
        }
    }
}

/// The session must be closed and cannot be resumed.
pub struct RejectFatal<Event, Err>(pub(crate) Event, pub(crate) Err);
/// The session should resume from its current state.
pub struct RejectTransient<Err>(pub(crate) Err);
/// The session moves to `ErrorState`, which still owes the counterparty a reply.
pub struct RejectReplyableError<Event, ErrorState, Err>(
    pub(crate) Event,
    pub(crate) ErrorState,
    pub(crate) Err,
);

impl<Err: std::error::Error> fmt::Display for RejectTransient<Err> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

/// A transition that always results in a state transition.
pub struct NextStateTransition<Event, NextState>(AcceptNextState<Event, NextState>);

impl<Event, NextState> NextStateTransition<Event, NextState> {
    pub(crate) fn success(event: Event, next_state: NextState) -> Self {
        NextStateTransition(AcceptNextState(event, next_state))
    }

    pub fn save<P>(self, persister: &P) -> Result<NextState, P::InternalStorageError>
    where
        P: SessionPersister<SessionEvent = Event>,
    {
        let AcceptNextState(event, next_state) = self.0;
        PersistActions::Save(event).execute(persister)?;
        Ok(next_state)
    }

    pub async fn save_async<P>(self, persister: &P) -> Result<NextState, P::InternalStorageError>
    where
        P: AsyncSessionPersister<SessionEvent = Event>,
        NextState: Send,
        Event: Send,
    {
        let AcceptNextState(event, next_state) = self.0;
        PersistActions::Save(event).execute_async(persister).await?;
        Ok(next_state)
    }
}

/// A transition that can be fatal, transient, replyable or a state transition.
pub struct MaybeFatalTransition<Event, NextState, Err, ErrorState = ()>(
    pub(crate) Result<AcceptNextState<Event, NextState>, Rejection<Event, Err, ErrorState>>,
);

impl<Event, NextState, Err, ErrorState> MaybeFatalTransition<Event, NextState, Err, ErrorState>
where
    Err: std::error::Error,
    ErrorState: fmt::Debug,
{
    pub(crate) fn success(event: Event, next_state: NextState) -> Self {
        MaybeFatalTransition(Ok(AcceptNextState(event, next_state)))
    }

    pub(crate) fn fatal(event: Event, error: Err) -> Self {
        MaybeFatalTransition(Err(Rejection::fatal(event, error)))
    }

    pub(crate) fn transient(error: Err) -> Self {
        MaybeFatalTransition(Err(Rejection::transient(error)))
    }

    pub(crate) fn replyable_error(event: Event, error_state: ErrorState, error: Err) -> Self {
        MaybeFatalTransition(Err(Rejection::replyable_error(event, error_state, error)))
    }

    fn deconstruct(self) -> (PersistActions<Event>, Outcome<NextState, Err, ErrorState>) {
        match self.0 {
            Ok(AcceptNextState(event, next_state)) => (PersistActions::Save(event), Ok(next_state)),
            Err(rejection) => rejection.into_outcome(),
        }
    }

    pub fn save<P>(
        self,
        persister: &P,
    ) -> Result<NextState, PersistedError<Err, P::InternalStorageError, ErrorState>>
    where
        P: SessionPersister<SessionEvent = Event>,
    {
        let (actions, outcome) = self.deconstruct();
        commit(actions, outcome, persister)
    }

    pub async fn save_async<P>(
        self,
        persister: &P,
    ) -> Result<NextState, PersistedError<Err, P::InternalStorageError, ErrorState>>
    where
        P: AsyncSessionPersister<SessionEvent = Event>,
        Err: Send,
        ErrorState: Send,
        NextState: Send,
        Event: Send,
    {
        let (actions, outcome) = self.deconstruct();
        commit_async(actions, outcome, persister).await
    }
}

/// A transition that can progress, stay put without persisting anything, or fail.
pub struct MaybeFatalTransitionWithNoResults<
    Event,
    NextState,
    CurrentState,
    Err,
    ErrorState = (),
>(
    pub(crate)
        Result<
            AcceptOptionalTransition<Event, NextState, CurrentState>,
            Rejection<Event, Err, ErrorState>,
        >,
);

impl<Event, NextState, CurrentState, Err, ErrorState>
    MaybeFatalTransitionWithNoResults<Event, NextState, CurrentState, Err, ErrorState>
where
    Err: std::error::Error,
    ErrorState: fmt::Debug,
{
    pub(crate) fn success(event: Event, next_state: NextState) -> Self {
        MaybeFatalTransitionWithNoResults(Ok(AcceptOptionalTransition::Success(AcceptNextState(
            event, next_state,
        ))))
    }

    pub(crate) fn no_results(current_state: CurrentState) -> Self {
        MaybeFatalTransitionWithNoResults(Ok(AcceptOptionalTransition::NoResults(current_state)))
    }

    pub(crate) fn fatal(event: Event, error: Err) -> Self {
        MaybeFatalTransitionWithNoResults(Err(Rejection::fatal(event, error)))
    }

    pub(crate) fn transient(error: Err) -> Self {
        MaybeFatalTransitionWithNoResults(Err(Rejection::transient(error)))
    }

    pub(crate) fn replyable_error(event: Event, error_state: ErrorState, error: Err) -> Self {
        let rejection = Rejection::replyable_error(event, error_state, error);
        MaybeFatalTransitionWithNoResults(Err(rejection))
    }

    #[allow(clippy::type_complexity)]
    fn deconstruct(
        self,
    ) -> (
        PersistActions<Event>,
        Outcome<OptionalTransitionOutcome<NextState, CurrentState>, Err, ErrorState>,
    ) {
        match self.0 {
            Ok(AcceptOptionalTransition::Success(AcceptNextState(event, next_state))) =>
                (PersistActions::Save(event), Ok(OptionalTransitionOutcome::Progress(next_state))),
            Ok(AcceptOptionalTransition::NoResults(current_state)) =>
                (PersistActions::NoOp, Ok(OptionalTransitionOutcome::Stasis(current_state))),
            Err(rejection) => rejection.into_outcome(),
        }
    }

    #[allow(clippy::type_complexity)]
    pub fn save<P>(
        self,
        persister: &P,
    ) -> Result<
        OptionalTransitionOutcome<NextState, CurrentState>,
        PersistedError<Err, P::InternalStorageError, ErrorState>,
    >
    where
        P: SessionPersister<SessionEvent = Event>,
    {
        let (actions, outcome) = self.deconstruct();
        commit(actions, outcome, persister)
    }

    #[allow(clippy::type_complexity)]
    pub async fn save_async<P>(
        self,
        persister: &P,
    ) -> Result<
        OptionalTransitionOutcome<NextState, CurrentState>,
        PersistedError<Err, P::InternalStorageError, ErrorState>,
    >
    where
        P: AsyncSessionPersister<SessionEvent = Event>,
        Err: Send,
        ErrorState: Send,
        NextState: Send,
        CurrentState: Send,
        Event: Send,
    {
        let (actions, outcome) = self.deconstruct();
        commit_async(actions, outcome, persister).await
    }
}

/// A transition that completes the session. Success and fatal errors both close it.
pub struct MaybeSuccessTransition<Event, SuccessValue, Err>(
    pub(crate) Result<AcceptNextState<Event, SuccessValue>, Rejection<Event, Err>>,
);

impl<Event, SuccessValue, Err> MaybeSuccessTransition<Event, SuccessValue, Err>
where
    Err: std::error::Error,
{
    pub(crate) fn success(event: Event, success_value: SuccessValue) -> Self {
        MaybeSuccessTransition(Ok(AcceptNextState(event, success_value)))
    }

    pub(crate) fn fatal(event: Event, error: Err) -> Self {
        MaybeSuccessTransition(Err(Rejection::fatal(event, error)))
    }

    pub(crate) fn transient(error: Err) -> Self {
        MaybeSuccessTransition(Err(Rejection::transient(error)))
    }

    fn deconstruct(self) -> (PersistActions<Event>, Outcome<SuccessValue, Err, ()>) {
        match self.0 {
            Ok(AcceptNextState(event, success_value)) =>
                (PersistActions::SaveAndClose(event), Ok(success_value)),
            Err(rejection) => rejection.into_outcome(),
        }
    }

    pub fn save<P>(
        self,
        persister: &P,
    ) -> Result<SuccessValue, PersistedError<Err, P::InternalStorageError>>
    where
        P: SessionPersister<SessionEvent = Event>,
    {
        let (actions, outcome) = self.deconstruct();
        commit(actions, outcome, persister)
    }

    pub async fn save_async<P>(
        self,
        persister: &P,
    ) -> Result<SuccessValue, PersistedError<Err, P::InternalStorageError>>
    where
        P: AsyncSessionPersister<SessionEvent = Event>,
        Err: Send,
        SuccessValue: Send,
        Event: Send,
    {
        let (actions, outcome) = self.deconstruct();
        commit_async(actions, outcome, persister).await
    }
}

/// A transition that either completes the session with a value or finds nothing to act on yet.
pub struct MaybeSuccessTransitionWithNoResults<Event, SuccessValue, CurrentState, Err>(
    pub(crate)
        Result<
            AcceptOptionalTransition<Event, SuccessValue, CurrentState>,
            Rejection<Event, Err>,
        >,
);

impl<Event, SuccessValue, CurrentState, Err>
    MaybeSuccessTransitionWithNoResults<Event, SuccessValue, CurrentState, Err>
where
    Err: std::error::Error,
{
    pub(crate) fn success(success_value: SuccessValue, event: Event) -> Self {
        MaybeSuccessTransitionWithNoResults(Ok(AcceptOptionalTransition::Success(AcceptNextState(
            event,
            success_value,
        ))))
    }

    pub(crate) fn no_results(current_state: CurrentState) -> Self {
        MaybeSuccessTransitionWithNoResults(Ok(AcceptOptionalTransition::NoResults(current_state)))
    }

    pub(crate) fn fatal(event: Event, error: Err) -> Self {
        MaybeSuccessTransitionWithNoResults(Err(Rejection::fatal(event, error)))
    }

    pub(crate) fn transient(error: Err) -> Self {
        MaybeSuccessTransitionWithNoResults(Err(Rejection::transient(error)))
    }

    #[allow(clippy::type_complexity)]
    fn deconstruct(
        self,
    ) -> (
        PersistActions<Event>,
        Outcome<OptionalTransitionOutcome<SuccessValue, CurrentState>, Err, ()>,
    ) {
        match self.0 {
            Ok(AcceptOptionalTransition::Success(AcceptNextState(event, success_value))) => (
                PersistActions::SaveAndClose(event),
                Ok(OptionalTransitionOutcome::Progress(success_value)),
            ),
            Ok(AcceptOptionalTransition::NoResults(current_state)) =>
                (PersistActions::NoOp, Ok(OptionalTransitionOutcome::Stasis(current_state))),
            Err(rejection) => rejection.into_outcome(),
        }
    }

    pub fn save<P>(
        self,
        persister: &P,
    ) -> Result<
        OptionalTransitionOutcome<SuccessValue, CurrentState>,
        PersistedError<Err, P::InternalStorageError>,
    >
    where
        P: SessionPersister<SessionEvent = Event>,
    {
        let (actions, outcome) = self.deconstruct();
        commit(actions, outcome, persister)
    }

    pub async fn save_async<P>(
        self,
        persister: &P,
    ) -> Result<
        OptionalTransitionOutcome<SuccessValue, CurrentState>,
        PersistedError<Err, P::InternalStorageError>,
    >
    where
        P: AsyncSessionPersister<SessionEvent = Event>,
        Err: Send,
        SuccessValue: Send,
        CurrentState: Send,
        Event: Send,
    {
        let (actions, outcome) = self.deconstruct();
        commit_async(actions, outcome, persister).await
    }
}

/// Represents a state transition that either progresses to a new state or maintains the current
/// state
#[derive(Debug, PartialEq)]
pub enum OptionalTransitionOutcome<NextState, CurrentState> {
    /// A successful state transition that returned a next state
    Progress(NextState),
    /// Nothing to act on yet. Resume from the current state
    Stasis(CurrentState),
}

impl<NextState, CurrentState> OptionalTransitionOutcome<NextState, CurrentState> {
    pub fn is_stasis(&self) -> bool { matches!(self, OptionalTransitionOutcome::Stasis(_)) }
}

/// Error returned when saving a transition: either the transition itself was refused or the
/// persister failed to store it.
#[derive(Debug)]
pub struct PersistedError<
    ApiErr: std::error::Error,
    StorageErr: std::error::Error,
    ErrorState: fmt::Debug = (),
>(InternalPersistedError<ApiErr, StorageErr, ErrorState>);

impl<ApiErr, StorageErr, ErrorState> PersistedError<ApiErr, StorageErr, ErrorState>
where
    ApiErr: std::error::Error,
    StorageErr: std::error::Error,
    ErrorState: fmt::Debug,
{
    /// Whether the session may be resumed from the state the transition was called on.
    pub fn is_transient(&self) -> bool {
        matches!(self.0, InternalPersistedError::Api(ApiError::Transient(_)))
    }

    pub fn storage_error(self) -> Option<StorageErr> {
        match self.0 {
            InternalPersistedError::Storage(e) => Some(e),
            _ => None,
        }
    }

    pub fn storage_error_ref(&self) -> Option<&StorageErr> {
        match &self.0 {
            InternalPersistedError::Storage(e) => Some(e),
            _ => None,
        }
    }

    pub fn api_error(self) -> Option<ApiErr> {
        match self.0 {
            InternalPersistedError::Api(
                ApiError::Fatal(e) | ApiError::Transient(e) | ApiError::FatalWithState(e, _),
            ) => Some(e),
            _ => None,
        }
    }

    pub fn api_error_ref(&self) -> Option<&ApiErr> {
        match &self.0 {
            InternalPersistedError::Api(
                ApiError::Fatal(e) | ApiError::Transient(e) | ApiError::FatalWithState(e, _),
            ) => Some(e),
            _ => None,
        }
    }

    /// The state the session moved to, if the error still owes the counterparty a reply.
    pub fn error_state(self) -> Option<ErrorState> {
        match self.0 {
            InternalPersistedError::Api(ApiError::FatalWithState(_, state)) => Some(state),
            _ => None,
        }
    }
}

impl<ApiErr, StorageErr, ErrorState> From<InternalPersistedError<ApiErr, StorageErr, ErrorState>>
    for PersistedError<ApiErr, StorageErr, ErrorState>
where
    ApiErr: std::error::Error,
    StorageErr: std::error::Error,
    ErrorState: fmt::Debug,
{
    fn from(value: InternalPersistedError<ApiErr, StorageErr, ErrorState>) -> Self {
        PersistedError(value)
    }
}

impl<ApiErr, StorageErr, ErrorState> fmt::Display for PersistedError<ApiErr, StorageErr, ErrorState>
where
    ApiErr: std::error::Error,
    StorageErr: std::error::Error,
    ErrorState: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            InternalPersistedError::Api(ApiError::Transient(err)) =>
                write!(f, "Transient error: {err}"),
            InternalPersistedError::Api(
                ApiError::Fatal(err) | ApiError::FatalWithState(err, _),
            ) => write!(f, "Fatal error: {err}"),
            InternalPersistedError::Storage(err) => write!(f, "Storage error: {err}"),
        }
    }
}

impl<ApiErr, StorageErr, ErrorState> std::error::Error
    for PersistedError<ApiErr, StorageErr, ErrorState>
where
    ApiErr: std::error::Error + 'static,
    StorageErr: std::error::Error + 'static,
    ErrorState: fmt::Debug,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.0 {
            InternalPersistedError::Api(
                ApiError::Fatal(e) | ApiError::Transient(e) | ApiError::FatalWithState(e, _),
            ) => Some(e),
            InternalPersistedError::Storage(e) => Some(e),
        }
    }
}

#[derive(Debug)]
pub(crate) enum ApiError<Err, ErrorState = ()> {
    /// Retry from the same state
    Transient(Err),
    /// The session is closed
    Fatal(Err),
    /// The session moved to `ErrorState`
    FatalWithState(Err, ErrorState),
}

#[derive(Debug)]
pub(crate) enum InternalPersistedError<ApiErr, StorageErr, ErrorState = ()>
where
    ApiErr: std::error::Error,
    StorageErr: std::error::Error,
    ErrorState: fmt::Debug,
{
    Api(ApiError<ApiErr, ErrorState>),
    Storage(StorageErr),
}

/// An append-only log of session events.
///
/// Replaying the events in the order they were saved reconstructs the session.
pub trait SessionPersister {
    /// Errors that may arise from implementers storage layer
    type InternalStorageError: std::error::Error + Send + Sync + 'static;
    type SessionEvent;

    /// Appends an event to the log
    fn save_event(&self, event: Self::SessionEvent) -> Result<(), Self::InternalStorageError>;

    /// Loads all the events of the session in the order they were saved
    fn load(
        &self,
    ) -> Result<Box<dyn Iterator<Item = Self::SessionEvent>>, Self::InternalStorageError>;

    /// Marks the session as closed. No more events will be appended.
    fn close(&self) -> Result<(), Self::InternalStorageError>;
}

/// Async version of [`SessionPersister`].
//
// The methods return `impl Future + Send` because `async fn` in a trait does not promise a `Send`
// future to callers.
pub trait AsyncSessionPersister: Send + Sync {
    type InternalStorageError: std::error::Error + Send + Sync + 'static;
    type SessionEvent: Send;

    fn save_event(
        &self,
        event: Self::SessionEvent,
    ) -> impl std::future::Future<Output = Result<(), Self::InternalStorageError>> + Send;

    #[allow(clippy::type_complexity)]
    fn load(
        &self,
    ) -> impl std::future::Future<
        Output = Result<
            Box<dyn Iterator<Item = Self::SessionEvent> + Send>,
            Self::InternalStorageError,
        >,
    > + Send;

    fn close(
        &self,
    ) -> impl std::future::Future<Output = Result<(), Self::InternalStorageError>> + Send;
}

/// A persister that stores nothing. Sessions saved through it cannot be replayed.
#[derive(Debug, Clone)]
pub struct NoopSessionPersister<E>(PhantomData<E>);

impl<E> Default for NoopSessionPersister<E> {
    fn default() -> Self { Self(PhantomData) }
}

impl<E: 'static> SessionPersister for NoopSessionPersister<E> {
    type InternalStorageError = std::convert::Infallible;
    type SessionEvent = E;

    fn save_event(&self, _event: Self::SessionEvent) -> Result<(), Self::InternalStorageError> {
        Ok(())
    }

    fn load(
        &self,
    ) -> Result<Box<dyn Iterator<Item = Self::SessionEvent>>, Self::InternalStorageError> {
        Ok(Box::new(std::iter::empty()))
    }

    fn close(&self) -> Result<(), Self::InternalStorageError> { Ok(()) }
}

/// Durable storage of opaque string records, such as an append-only file or a table of rows.
pub trait StringEventStore {
    /// Appends one record.
    fn save(&self, record: String) -> Result<(), ImplementationError>;
    /// Every record, in the order it was saved.
    fn load(&self) -> Result<Vec<String>, ImplementationError>;
    /// Marks the log as closed.
    fn close(&self) -> Result<(), ImplementationError>;
}

/// Adapts a [`StringEventStore`] into a typed [`SessionPersister`] that stores one JSON document
/// per event.
pub struct JsonEventLog<S, E> {
    store: S,
    _event: PhantomData<fn() -> E>,
}

impl<S, E> JsonEventLog<S, E> {
    pub fn new(store: S) -> Self { Self { store, _event: PhantomData } }

    pub fn store(&self) -> &S { &self.store }

    pub fn into_store(self) -> S { self.store }
}

impl<S, E> SessionPersister for JsonEventLog<S, E>
where
    S: StringEventStore,
    E: Serialize + DeserializeOwned + 'static,
{
    type InternalStorageError = JsonEventLogError;
    type SessionEvent = E;

    fn save_event(&self, event: E) -> Result<(), JsonEventLogError> {
        let record = serde_json::to_string(&event).map_err(JsonEventLogError::Serde)?;
        self.store.save(record).map_err(JsonEventLogError::Store)
    }

    fn load(&self) -> Result<Box<dyn Iterator<Item = E>>, JsonEventLogError> {
        let events = self
            .store
            .load()
            .map_err(JsonEventLogError::Store)?
            .iter()
            .map(|record| serde_json::from_str(record))
            .collect::<Result<Vec<E>, _>>()
            .map_err(JsonEventLogError::Serde)?;
        tracing::trace!("loaded {} events", events.len());
        Ok(Box::new(events.into_iter()))
    }

    fn close(&self) -> Result<(), JsonEventLogError> {
        self.store.close().map_err(JsonEventLogError::Store)
    }
}

#[derive(Debug)]
pub enum JsonEventLogError {
    Store(ImplementationError),
    Serde(serde_json::Error),
}

impl fmt::Display for JsonEventLogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JsonEventLogError::Store(e) => write!(f, "event store failed: {e}"),
            JsonEventLogError::Serde(e) => write!(f, "malformed session event: {e}"),
        }
    }
}

impl std::error::Error for JsonEventLogError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            JsonEventLogError::Store(e) => Some(e.as_ref()),
            JsonEventLogError::Serde(e) => Some(e),
        }
    }
}

#[cfg(any(test, feature = "_test-utils"))]
pub mod test_utils {
    use std::sync::{Arc, RwLock};

    use crate::persist::SessionPersister;

    /// In-memory session persister for replay tests and event introspection
    #[derive(Clone)]
    pub struct InMemoryTestPersister<V> {
        pub(crate) inner: Arc<RwLock<InnerStorage<V>>>,
    }

    impl<V> Default for InMemoryTestPersister<V> {
        fn default() -> Self { Self { inner: Arc::new(RwLock::new(InnerStorage::default())) } }
    }

    impl<V: Clone> InMemoryTestPersister<V> {
        pub fn events(&self) -> Vec<V> {
            self.inner.read().expect("Lock should not be poisoned").events.clone()
        }

        pub fn is_closed(&self) -> bool {
            self.inner.read().expect("Lock should not be poisoned").is_closed
        }
    }

    #[derive(Clone)]
    pub(crate) struct InnerStorage<V> {
        pub(crate) events: Vec<V>,
        pub(crate) is_closed: bool,
    }

    impl<V> Default for InnerStorage<V> {
        fn default() -> Self { Self { events: vec![], is_closed: false } }
    }

    impl<V> SessionPersister for InMemoryTestPersister<V>
    where
        V: Clone + 'static,
    {
        type InternalStorageError = std::convert::Infallible;
        type SessionEvent = V;

        fn save_event(&self, event: Self::SessionEvent) -> Result<(), Self::InternalStorageError> {
            self.inner.write().expect("Lock should not be poisoned").events.push(event);
            Ok(())
        }

        fn load(
            &self,
        ) -> Result<Box<dyn Iterator<Item = Self::SessionEvent>>, Self::InternalStorageError>
        {
            Ok(Box::new(self.events().into_iter()))
        }

        fn close(&self) -> Result<(), Self::InternalStorageError> {
            self.inner.write().expect("Lock should not be poisoned").is_closed = true;
            Ok(())
        }
    }

    /// Async in-memory session persister
    #[cfg(test)]
    #[derive(Clone)]
    pub struct InMemoryAsyncTestPersister<V> {
        pub(crate) inner: Arc<tokio::sync::RwLock<InnerStorage<V>>>,
    }

    #[cfg(test)]
    impl<V> Default for InMemoryAsyncTestPersister<V> {
        fn default() -> Self {
            Self { inner: Arc::new(tokio::sync::RwLock::new(InnerStorage::default())) }
        }
    }

    #[cfg(test)]
    impl<V> crate::persist::AsyncSessionPersister for InMemoryAsyncTestPersister<V>
    where
        V: Clone + Send + Sync + 'static,
    {
        type InternalStorageError = std::convert::Infallible;
        type SessionEvent = V;

        async fn save_event(
            &self,
            event: Self::SessionEvent,
        ) -> Result<(), Self::InternalStorageError> {
            self.inner.write().await.events.push(event);
            Ok(())
        }

        async fn load(
            &self,
        ) -> Result<Box<dyn Iterator<Item = Self::SessionEvent> + Send>, Self::InternalStorageError>
        {
            let events = self.inner.read().await.events.clone();
            Ok(Box::new(events.into_iter()))
        }

        async fn close(&self) -> Result<(), Self::InternalStorageError> {
            self.inner.write().await.is_closed = true;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde::Deserialize;

    use super::test_utils::{InMemoryAsyncTestPersister, InMemoryTestPersister};
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TestEvent(String);

    #[derive(Debug, Clone, PartialEq)]
    struct TestError(&'static str);

    impl std::error::Error for TestError {}

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
    }

    fn event(s: &str) -> TestEvent { TestEvent(s.to_owned()) }

    struct TestCase<Transition, Success> {
        make_transition: Box<dyn Fn() -> Transition>,
        expected: Expected<Success>,
    }

    struct Expected<Success> {
        events: Vec<TestEvent>,
        is_closed: bool,
        /// `Display` of the expected error, if any
        error: Option<&'static str>,
        success: Option<Success>,
    }

    fn verify<Success, E>(
        events: Vec<TestEvent>,
        is_closed: bool,
        result: Result<Success, E>,
        expected: &Expected<Success>,
    ) where
        Success: fmt::Debug + PartialEq,
        E: std::error::Error,
    {
        assert_eq!(events, expected.events);
        assert_eq!(is_closed, expected.is_closed);
        match (result, expected.error) {
            (Ok(actual), None) => assert_eq!(Some(&actual), expected.success.as_ref()),
            (Err(actual), Some(expected)) => assert_eq!(actual.to_string(), expected),
            (Ok(actual), Some(_)) => panic!("expected an error, got {actual:?}"),
            (Err(actual), None) => panic!("unexpected error: {actual}"),
        }
    }

    macro_rules! run_test_cases {
        ($test_cases:expr) => {
            for test in &$test_cases {
                let persister = InMemoryTestPersister::default();
                let result = (test.make_transition)().save(&persister);
                verify(persister.events(), persister.is_closed(), result, &test.expected);

                let persister = InMemoryAsyncTestPersister::default();
                let result = (test.make_transition)().save_async(&persister).await;
                let inner = persister.inner.read().await.clone();
                verify(inner.events, inner.is_closed, result, &test.expected);
            }
        };
    }

    #[tokio::test]
    async fn next_state_transition_appends_one_event() {
        let test_cases: Vec<TestCase<NextStateTransition<TestEvent, String>, String>> =
            vec![TestCase {
                make_transition: Box::new(|| {
                    NextStateTransition::success(event("created"), "next".to_owned())
                }),
                expected: Expected {
                    events: vec![event("created")],
                    is_closed: false,
                    error: None,
                    success: Some("next".to_owned()),
                },
            }];
        run_test_cases!(test_cases);
    }

    #[tokio::test]
    async fn maybe_fatal_transition() {
        type Transition = MaybeFatalTransition<TestEvent, String, TestError, String>;
        let test_cases: Vec<TestCase<Transition, String>> = vec![
            TestCase {
                make_transition: Box::new(|| {
                    Transition::success(event("progress"), "next".to_owned())
                }),
                expected: Expected {
                    events: vec![event("progress")],
                    is_closed: false,
                    error: None,
                    success: Some("next".to_owned()),
                },
            },
            TestCase {
                make_transition: Box::new(|| Transition::transient(TestError("flaky"))),
                expected: Expected {
                    events: vec![],
                    is_closed: false,
                    error: Some("Transient error: flaky"),
                    success: None,
                },
            },
            TestCase {
                make_transition: Box::new(|| {
                    Transition::fatal(event("invalid"), TestError("broken"))
                }),
                expected: Expected {
                    events: vec![event("invalid")],
                    is_closed: true,
                    error: Some("Fatal error: broken"),
                    success: None,
                },
            },
            TestCase {
                make_transition: Box::new(|| {
                    Transition::replyable_error(
                        event("reply owed"),
                        "error state".to_owned(),
                        TestError("rejected"),
                    )
                }),
                expected: Expected {
                    events: vec![event("reply owed")],
                    is_closed: false,
                    error: Some("Fatal error: rejected"),
                    success: None,
                },
            },
        ];
        run_test_cases!(test_cases);
    }

    #[tokio::test]
    async fn maybe_fatal_transition_with_no_results() {
        type Transition = MaybeFatalTransitionWithNoResults<TestEvent, String, String, TestError>;
        type Outcome = OptionalTransitionOutcome<String, String>;
        let test_cases: Vec<TestCase<Transition, Outcome>> = vec![
            TestCase {
                make_transition: Box::new(|| {
                    Transition::success(event("progress"), "next".to_owned())
                }),
                expected: Expected {
                    events: vec![event("progress")],
                    is_closed: false,
                    error: None,
                    success: Some(Outcome::Progress("next".to_owned())),
                },
            },
            TestCase {
                make_transition: Box::new(|| Transition::no_results("current".to_owned())),
                expected: Expected {
                    events: vec![],
                    is_closed: false,
                    error: None,
                    success: Some(Outcome::Stasis("current".to_owned())),
                },
            },
            TestCase {
                make_transition: Box::new(|| Transition::transient(TestError("flaky"))),
                expected: Expected {
                    events: vec![],
                    is_closed: false,
                    error: Some("Transient error: flaky"),
                    success: None,
                },
            },
            TestCase {
                make_transition: Box::new(|| {
                    Transition::fatal(event("invalid"), TestError("broken"))
                }),
                expected: Expected {
                    events: vec![event("invalid")],
                    is_closed: true,
                    error: Some("Fatal error: broken"),
                    success: None,
                },
            },
        ];
        run_test_cases!(test_cases);
    }

    #[tokio::test]
    async fn maybe_success_transition() {
        type Transition = MaybeSuccessTransition<TestEvent, (), TestError>;
        let test_cases: Vec<TestCase<Transition, ()>> = vec![
            TestCase {
                make_transition: Box::new(|| Transition::success(event("done"), ())),
                expected: Expected {
                    events: vec![event("done")],
                    is_closed: true,
                    error: None,
                    success: Some(()),
                },
            },
            TestCase {
                make_transition: Box::new(|| Transition::transient(TestError("flaky"))),
                expected: Expected {
                    events: vec![],
                    is_closed: false,
                    error: Some("Transient error: flaky"),
                    success: None,
                },
            },
            TestCase {
                make_transition: Box::new(|| {
                    Transition::fatal(event("invalid"), TestError("broken"))
                }),
                expected: Expected {
                    events: vec![event("invalid")],
                    is_closed: true,
                    error: Some("Fatal error: broken"),
                    success: None,
                },
            },
        ];
        run_test_cases!(test_cases);
    }

    #[tokio::test]
    async fn maybe_success_transition_with_no_results() {
        type Transition =
            MaybeSuccessTransitionWithNoResults<TestEvent, String, String, TestError>;
        type Outcome = OptionalTransitionOutcome<String, String>;
        let test_cases: Vec<TestCase<Transition, Outcome>> = vec![
            TestCase {
                make_transition: Box::new(|| {
                    Transition::success("proposal".to_owned(), event("received"))
                }),
                expected: Expected {
                    events: vec![event("received")],
                    is_closed: true,
                    error: None,
                    success: Some(Outcome::Progress("proposal".to_owned())),
                },
            },
            TestCase {
                make_transition: Box::new(|| Transition::no_results("polling".to_owned())),
                expected: Expected {
                    events: vec![],
                    is_closed: false,
                    error: None,
                    success: Some(Outcome::Stasis("polling".to_owned())),
                },
            },
            TestCase {
                make_transition: Box::new(|| Transition::transient(TestError("flaky"))),
                expected: Expected {
                    events: vec![],
                    is_closed: false,
                    error: Some("Transient error: flaky"),
                    success: None,
                },
            },
            TestCase {
                make_transition: Box::new(|| {
                    Transition::fatal(event("invalid"), TestError("broken"))
                }),
                expected: Expected {
                    events: vec![event("invalid")],
                    is_closed: true,
                    error: Some("Fatal error: broken"),
                    success: None,
                },
            },
        ];
        run_test_cases!(test_cases);
    }

    #[test]
    fn persisted_error_exposes_error_state() {
        let persister = InMemoryTestPersister::<TestEvent>::default();
        let err = MaybeFatalTransition::<TestEvent, (), TestError, &str>::replyable_error(
            event("reply owed"),
            "error state",
            TestError("rejected"),
        )
        .save(&persister)
        .expect_err("replyable errors are errors");
        assert!(!err.is_transient());
        assert_eq!(err.api_error_ref(), Some(&TestError("rejected")));
        assert_eq!(err.error_state(), Some("error state"));
    }

    #[derive(Default)]
    struct VecStore {
        records: Mutex<Vec<String>>,
        closed: Mutex<bool>,
    }

    impl StringEventStore for VecStore {
        fn save(&self, record: String) -> Result<(), ImplementationError> {
            self.records.lock().map_err(|_| "poisoned")?.push(record);
            Ok(())
        }

        fn load(&self) -> Result<Vec<String>, ImplementationError> {
            Ok(self.records.lock().map_err(|_| "poisoned")?.clone())
        }

        fn close(&self) -> Result<(), ImplementationError> {
            *self.closed.lock().map_err(|_| "poisoned")? = true;
            Ok(())
        }
    }

    #[test]
    fn json_event_log_stores_one_document_per_event() {
        let log = JsonEventLog::<_, TestEvent>::new(VecStore::default());
        NextStateTransition::success(event("a"), ()).save(&log).expect("save");
        MaybeSuccessTransition::<_, (), TestError>::success(event("b"), ())
            .save(&log)
            .expect("save");

        assert_eq!(log.load().expect("load").collect::<Vec<_>>(), vec![event("a"), event("b")]);
        let store = log.into_store();
        assert_eq!(store.records.lock().unwrap().as_slice(), ["\"a\"", "\"b\""]);
        assert!(*store.closed.lock().unwrap());
    }

    #[test]
    fn json_event_log_rejects_malformed_records() {
        let store = VecStore::default();
        store.records.lock().unwrap().push("{not json".to_owned());
        let log = JsonEventLog::<_, TestEvent>::new(store);
        assert!(matches!(log.load().map(|_| ()), Err(JsonEventLogError::Serde(_))));
    }
}
