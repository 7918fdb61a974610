use std::io;

/// Errors returned by the listener's synchronous API.
///
/// Asynchronous failures (accept errors, queue saturation, deadline expiry)
/// are never surfaced here; they are routed to consumer callbacks.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Caller misuse: empty address list, double bind, family mismatch.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A syscall failed during bind, listen, or option setup.
    #[error("{context}: {source}")]
    System {
        context: String,
        #[source]
        source: io::Error,
    },

    /// `remove_accept_callback` did not find a matching registration.
    #[error("accept callback not found")]
    CallbackNotFound,

    /// An address was requested before any socket was bound.
    #[error("no sockets are bound")]
    NoBoundSockets,

    /// The operation requires a reactor but the listener is detached.
    #[error("listener is not attached to a reactor")]
    Detached,
}

impl Error {
    pub(crate) fn system(context: impl Into<String>, source: io::Error) -> Self {
        Error::System {
            context: context.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
