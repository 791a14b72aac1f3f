//! Inter-VM communication (IVC) transport contract.
//!
//! The Display Handler helpers ride on a reliable byte-stream transport
//! between domains that also offers shared-memory buffers and
//! connect/disconnect callbacks. This crate pins that contract down as
//! traits and ships one in-process implementation, [`LoopbackIvc`], used
//! by the tests and the diagnostic CLI.
//!
//! This is the lowest layer of the workspace. Everything else builds on
//! the [`Ivc`] / [`IvcChannel`] traits defined here.

pub mod error;
pub mod loopback;
pub mod traits;

pub use error::{IvcError, Result};
pub use loopback::{EventQueue, LoopbackChannel, LoopbackIvc, LoopbackServer, METADATA_SIZE};
pub use traits::{
    AcceptCallback, ChannelEvents, ConnectionId, DataCallback, DisconnectCallback, DomainId, Ivc,
    IvcChannel, IvcServer, Port, SharedView, CONNECTION_ID_ANY, PAGE_SIZE,
};
