use std::error;

/// Error raised by host wallet code invoked through a callback.
///
/// The state machine never inspects it; it only decides whether the session may be retried.
pub type ImplementationError = Box<dyn error::Error + Send + Sync>;
