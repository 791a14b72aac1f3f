use pvdisplay_ivc::IvcError;
use pvdisplay_wire::WireError;

/// Errors surfaced by provider and consumer operations.
#[derive(Debug, thiserror::Error)]
pub enum DisplayError {
    /// A precondition on the arguments or object state failed.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A buffer could not be allocated.
    #[error("out of memory")]
    OutOfMemory,

    /// Transient send-side buffer pressure; retry after the remote
    /// drains the ring.
    #[error("no ring space ({needed} bytes needed, {available} free)")]
    NoSpace { needed: usize, available: usize },

    /// Transient receive-side condition; retry later.
    #[error("try again")]
    TryAgain,

    /// The channel is not open, or the remote has disconnected.
    #[error("channel closed")]
    Closed,

    /// No listening server exists for the requested port tuple.
    #[error("no listening server for the requested port")]
    NotFound,

    /// The peer violated the wire protocol.
    #[error("protocol violation: {0}")]
    Protocol(#[source] WireError),

    /// The transport refused an operation unexpectedly.
    #[error("transport error: {0}")]
    Transport(#[source] IvcError),
}

impl From<WireError> for DisplayError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::NoSpace { needed, available } => Self::NoSpace { needed, available },
            WireError::Closed => Self::Closed,
            WireError::OutOfMemory => Self::OutOfMemory,
            WireError::Transport(IvcError::Closed) => Self::Closed,
            WireError::Transport(err) => Self::Transport(err),
            err @ (WireError::InvalidMagic { .. }
            | WireError::PayloadTooLarge { .. }
            | WireError::CrcMismatch { .. }
            | WireError::Truncated { .. }) => Self::Protocol(err),
        }
    }
}

impl From<IvcError> for DisplayError {
    fn from(err: IvcError) -> Self {
        match err {
            IvcError::Closed => Self::Closed,
            IvcError::ConnectionRefused { .. } => Self::NotFound,
            err => Self::Transport(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, DisplayError>;
