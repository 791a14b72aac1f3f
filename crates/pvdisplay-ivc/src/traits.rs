use std::sync::{Arc, Mutex, PoisonError};

use crate::error::Result;

/// Identifies a domain (virtual machine) on the IVC fabric.
pub type DomainId = u16;

/// An IVC port number.
///
/// The wire protocol carries ports as 32-bit values; the transport itself
/// only addresses the low 16 bits.
pub type Port = u16;

/// Opaque 64-bit connection identifier, used to disambiguate multiple
/// guests connecting to the same port.
pub type ConnectionId = u64;

/// Wildcard connection identifier: match any connection.
pub const CONNECTION_ID_ANY: ConnectionId = u64::MAX;

/// Granularity of ring and shared-buffer allocations.
pub const PAGE_SIZE: usize = 4096;

/// Callback invoked when a channel has readable data.
pub type DataCallback = Arc<dyn Fn() + Send + Sync>;

/// Callback invoked when a channel is disconnected by the remote.
pub type DisconnectCallback = Arc<dyn Fn() + Send + Sync>;

/// Callback invoked when a listening server accepts a connection.
pub type AcceptCallback = Arc<dyn Fn(Arc<dyn IvcChannel>) + Send + Sync>;

/// Event callbacks registered on a channel.
///
/// The transport invokes these from its own delivery context; they must be
/// treated as concurrent with every user-driven operation.
#[derive(Default)]
pub struct ChannelEvents {
    pub on_data: Option<DataCallback>,
    pub on_disconnect: Option<DisconnectCallback>,
}

impl ChannelEvents {
    pub fn new(
        on_data: Option<DataCallback>,
        on_disconnect: Option<DisconnectCallback>,
    ) -> Self {
        Self {
            on_data,
            on_disconnect,
        }
    }
}

/// A connected IVC channel.
///
/// Channels carry a byte ring in each direction plus one shared buffer,
/// allocated by the connecting side and visible to both ends.
pub trait IvcChannel: Send + Sync + std::fmt::Debug {
    /// Write `buf` to the remote ring in one piece.
    ///
    /// Fails with [`IvcError::ShortWrite`] (writing nothing) if the ring
    /// cannot hold the whole buffer, and [`IvcError::Closed`] if the
    /// channel is not open. Writes are atomic from the channel's
    /// perspective; no lock needs to be held around this call.
    ///
    /// [`IvcError::ShortWrite`]: crate::IvcError::ShortWrite
    /// [`IvcError::Closed`]: crate::IvcError::Closed
    fn send(&self, buf: &[u8]) -> Result<()>;

    /// Read exactly `buf.len()` bytes from the local ring.
    ///
    /// Fails with [`IvcError::ShortRead`] without consuming anything if
    /// fewer bytes are buffered.
    ///
    /// [`IvcError::ShortRead`]: crate::IvcError::ShortRead
    fn recv(&self, buf: &mut [u8]) -> Result<()>;

    /// Number of bytes currently buffered for reading.
    fn available_data(&self) -> Result<usize>;

    /// Number of bytes of free space in the remote-bound ring.
    fn available_space(&self) -> Result<usize>;

    /// Signal the remote endpoint that the ring state changed.
    fn notify_remote(&self);

    /// The channel's shared buffer view.
    ///
    /// The view begins after the transport's connection metadata and is
    /// therefore NOT page-aligned.
    fn local_buffer(&self) -> Result<SharedView>;

    /// Size of the shared buffer view in bytes.
    fn local_buffer_size(&self) -> Result<usize>;

    /// Install data/disconnect callbacks, replacing any previous set.
    fn register_events(&self, events: ChannelEvents);

    /// Allow data events to be delivered.
    fn enable_events(&self);

    /// Suppress data events until re-enabled.
    fn disable_events(&self);

    fn is_open(&self) -> bool;

    /// Close the channel. The remote observes a disconnect event.
    fn disconnect(&self);

    /// Re-establish the channel against a (possibly new) remote port.
    fn reconnect(&self, remote: DomainId, port: Port) -> Result<()>;
}

/// A listening IVC server.
pub trait IvcServer: Send + Sync {
    fn port(&self) -> Port;
    fn remote_domain(&self) -> DomainId;

    /// Stop listening. Already-accepted channels stay connected.
    fn shutdown(&self);
}

/// The IVC transport: connect, listen, and server discovery.
pub trait Ivc: Send + Sync {
    /// Open an outgoing channel to `remote:port` with a ring of
    /// `ring_pages` pages.
    fn connect(
        &self,
        remote: DomainId,
        port: Port,
        ring_pages: usize,
        conn_id: ConnectionId,
    ) -> Result<Arc<dyn IvcChannel>>;

    /// Listen for incoming connections from `remote` on `port`.
    fn listen(
        &self,
        port: Port,
        remote: DomainId,
        conn_id_mask: ConnectionId,
        on_accept: AcceptCallback,
    ) -> Result<Arc<dyn IvcServer>>;

    /// Find an existing listening server for the given tuple, if any.
    ///
    /// Lets several consumers of the same remote domain share one server
    /// per port instead of racing to bind duplicates.
    fn find_listening_server(&self, remote: DomainId, port: Port) -> Option<Arc<dyn IvcServer>>;
}

/// A clonable handle onto a channel's shared buffer.
///
/// Providers write pixel data through the view; consumers only read.
/// The handle is valid between connect/accept and disconnect; this
/// in-process representation stays safe to touch afterwards, it merely
/// stops being observed by anyone.
#[derive(Clone)]
pub struct SharedView {
    buf: Arc<Mutex<Vec<u8>>>,
    offset: usize,
    len: usize,
}

impl SharedView {
    pub(crate) fn new(buf: Arc<Mutex<Vec<u8>>>, offset: usize, len: usize) -> Self {
        Self { buf, offset, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy `data` into the view at `offset`.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check_range(offset, data.len())?;
        let mut buf = lock(&self.buf);
        buf[self.offset + offset..self.offset + offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Copy bytes out of the view at `offset` into `out`.
    pub fn read_at(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        self.check_range(offset, out.len())?;
        let buf = lock(&self.buf);
        out.copy_from_slice(&buf[self.offset + offset..self.offset + offset + out.len()]);
        Ok(())
    }

    /// Fill the whole view with `byte`.
    pub fn fill(&self, byte: u8) {
        let mut buf = lock(&self.buf);
        buf[self.offset..self.offset + self.len].fill(byte);
    }

    /// Run `f` over the view contents with exclusive access.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut buf = lock(&self.buf);
        f(&mut buf[self.offset..self.offset + self.len])
    }

    /// Snapshot the view contents.
    pub fn to_vec(&self) -> Vec<u8> {
        let buf = lock(&self.buf);
        buf[self.offset..self.offset + self.len].to_vec()
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        if offset.checked_add(len).map_or(true, |end| end > self.len) {
            return Err(crate::IvcError::OutOfRange {
                offset,
                len,
                view_len: self.len,
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for SharedView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedView")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
