use crate::traits::{DomainId, Port};

/// Errors that can occur in IVC transport operations.
#[derive(Debug, thiserror::Error)]
pub enum IvcError {
    /// No listening server exists on the requested remote/port tuple.
    #[error("connection refused by domain {domain} port {port}: no listening server")]
    ConnectionRefused { domain: DomainId, port: Port },

    /// A server is already listening on the requested port.
    #[error("port {0} already has a listening server")]
    PortInUse(Port),

    /// The channel does not hold enough buffered data for an exact read.
    ///
    /// Nothing is consumed; the caller may retry once more data arrives.
    #[error("short read ({available} of {requested} bytes buffered)")]
    ShortRead { requested: usize, available: usize },

    /// The remote ring does not have room for the full write.
    #[error("short write ({available} of {requested} bytes of ring space)")]
    ShortWrite { requested: usize, available: usize },

    /// The channel has been disconnected (locally or by the remote).
    #[error("channel closed")]
    Closed,

    /// An access fell outside the bounds of a shared buffer view.
    #[error("shared buffer access out of range (offset {offset}, len {len}, view {view_len})")]
    OutOfRange {
        offset: usize,
        len: usize,
        view_len: usize,
    },
}

pub type Result<T> = std::result::Result<T, IvcError>;
