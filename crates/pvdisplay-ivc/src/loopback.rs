//! In-process IVC transport.
//!
//! Connects both protocol endpoints inside one process, backing each
//! channel with a byte ring per direction and a single shared buffer.
//! Accept, data, and disconnect events are queued and drained by
//! [`LoopbackIvc::pump`] with no internal lock held, so a callback may
//! freely send (and thereby queue further events) while it runs; the
//! Display Handler handshake is reactionary and depends on exactly that.
//!
//! A real deployment replaces this with a binding to the platform's
//! inter-VM transport; the rest of the workspace only sees the traits.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::debug;

use crate::error::{IvcError, Result};
use crate::traits::{
    lock, AcceptCallback, ChannelEvents, ConnectionId, DomainId, Ivc, IvcChannel, IvcServer, Port,
    SharedView, PAGE_SIZE,
};

/// Bytes reserved at the start of a channel's buffer for connection
/// metadata. The shared view handed to users begins after this prefix,
/// which is what makes the view non-page-aligned.
pub const METADATA_SIZE: usize = 64;

type ServerMap = Mutex<HashMap<Port, Arc<LoopbackServer>>>;

enum QueuedEvent {
    Accept {
        server: Weak<LoopbackServer>,
        channel: Arc<LoopbackChannel>,
    },
    Data(Weak<LoopbackChannel>),
    Disconnect(Weak<LoopbackChannel>),
}

/// Shared event queue drained by [`LoopbackIvc::pump`].
#[derive(Clone, Default)]
pub struct EventQueue {
    inner: Arc<Mutex<VecDeque<QueuedEvent>>>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, event: QueuedEvent) {
        lock(&self.inner).push_back(event);
    }

    /// Deliver queued events until the queue is empty.
    ///
    /// Returns the number of events delivered. Each callback runs with no
    /// queue lock held; events it queues are delivered in the same drain.
    pub fn pump(&self) -> usize {
        let mut delivered = 0;
        loop {
            let Some(event) = lock(&self.inner).pop_front() else {
                return delivered;
            };
            delivered += 1;
            match event {
                QueuedEvent::Accept { server, channel } => {
                    let Some(server) = server.upgrade() else {
                        continue;
                    };
                    if !server.open.load(Ordering::SeqCst) {
                        continue;
                    }
                    let callback = lock(&server.on_accept).clone();
                    if let Some(callback) = callback {
                        callback(channel);
                    }
                }
                QueuedEvent::Data(channel) => {
                    let Some(channel) = channel.upgrade() else {
                        continue;
                    };
                    if !channel.events_enabled.load(Ordering::SeqCst) {
                        continue;
                    }
                    let callback = lock(&channel.events).on_data.clone();
                    if let Some(callback) = callback {
                        callback();
                    }
                }
                QueuedEvent::Disconnect(channel) => {
                    let Some(channel) = channel.upgrade() else {
                        continue;
                    };
                    let callback = lock(&channel.events).on_disconnect.clone();
                    if let Some(callback) = callback {
                        callback();
                    }
                }
            }
        }
    }
}

struct Ring {
    data: VecDeque<u8>,
    capacity: usize,
}

impl Ring {
    fn new(capacity: usize) -> Self {
        Self {
            data: VecDeque::new(),
            capacity,
        }
    }

    fn free(&self) -> usize {
        self.capacity - self.data.len()
    }
}

/// One endpoint of an in-process channel pair.
pub struct LoopbackChannel {
    queue: EventQueue,
    ring: Mutex<Ring>,
    shared: Arc<Mutex<Vec<u8>>>,
    view_len: usize,
    peer: Mutex<Weak<LoopbackChannel>>,
    open: AtomicBool,
    events: Mutex<ChannelEvents>,
    events_enabled: AtomicBool,
    /// Back-reference to the transport's server table, used by
    /// `reconnect`. Empty for raw test pairs.
    servers: Weak<ServerMap>,
    self_weak: Weak<LoopbackChannel>,
}

impl LoopbackChannel {
    fn endpoint(
        queue: EventQueue,
        ring_capacity: usize,
        shared: Arc<Mutex<Vec<u8>>>,
        view_len: usize,
        servers: Weak<ServerMap>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            queue,
            ring: Mutex::new(Ring::new(ring_capacity)),
            shared,
            view_len,
            peer: Mutex::new(Weak::new()),
            open: AtomicBool::new(true),
            events: Mutex::new(ChannelEvents::default()),
            events_enabled: AtomicBool::new(true),
            servers,
            self_weak: self_weak.clone(),
        })
    }

    /// Build a connected pair with `ring_capacity` bytes of ring in each
    /// direction, sharing one buffer of `ring_capacity + METADATA_SIZE`
    /// bytes. Intended for unit tests that need exact ring sizes.
    pub fn pair(queue: &EventQueue, ring_capacity: usize) -> (Arc<Self>, Arc<Self>) {
        let shared = Arc::new(Mutex::new(vec![0u8; ring_capacity + METADATA_SIZE]));
        let a = Self::endpoint(
            queue.clone(),
            ring_capacity,
            shared.clone(),
            ring_capacity,
            Weak::new(),
        );
        let b = Self::endpoint(queue.clone(), ring_capacity, shared, ring_capacity, Weak::new());
        link(&a, &b);
        (a, b)
    }

    fn peer(&self) -> Option<Arc<LoopbackChannel>> {
        lock(&self.peer).upgrade()
    }
}

fn link(a: &Arc<LoopbackChannel>, b: &Arc<LoopbackChannel>) {
    *lock(&a.peer) = Arc::downgrade(b);
    *lock(&b.peer) = Arc::downgrade(a);
}

impl std::fmt::Debug for LoopbackChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackChannel").finish_non_exhaustive()
    }
}

impl IvcChannel for LoopbackChannel {
    fn send(&self, buf: &[u8]) -> Result<()> {
        if !self.is_open() {
            return Err(IvcError::Closed);
        }
        let peer = self.peer().ok_or(IvcError::Closed)?;
        let mut ring = lock(&peer.ring);
        if ring.free() < buf.len() {
            return Err(IvcError::ShortWrite {
                requested: buf.len(),
                available: ring.free(),
            });
        }
        ring.data.extend(buf.iter().copied());
        Ok(())
    }

    fn recv(&self, buf: &mut [u8]) -> Result<()> {
        let mut ring = lock(&self.ring);
        if ring.data.len() < buf.len() {
            return Err(IvcError::ShortRead {
                requested: buf.len(),
                available: ring.data.len(),
            });
        }
        for slot in buf.iter_mut() {
            // Length was checked above; the ring cannot run dry mid-read.
            *slot = ring.data.pop_front().unwrap_or_default();
        }
        Ok(())
    }

    fn available_data(&self) -> Result<usize> {
        Ok(lock(&self.ring).data.len())
    }

    fn available_space(&self) -> Result<usize> {
        let peer = self.peer().ok_or(IvcError::Closed)?;
        let free = lock(&peer.ring).free();
        Ok(free)
    }

    fn notify_remote(&self) {
        if let Some(peer) = self.peer() {
            self.queue.push(QueuedEvent::Data(Arc::downgrade(&peer)));
        }
    }

    fn local_buffer(&self) -> Result<SharedView> {
        Ok(SharedView::new(
            self.shared.clone(),
            METADATA_SIZE,
            self.view_len,
        ))
    }

    fn local_buffer_size(&self) -> Result<usize> {
        Ok(self.view_len)
    }

    fn register_events(&self, events: ChannelEvents) {
        *lock(&self.events) = events;
    }

    fn enable_events(&self) {
        self.events_enabled.store(true, Ordering::SeqCst);
    }

    fn disable_events(&self) {
        self.events_enabled.store(false, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn disconnect(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(peer) = self.peer() {
            peer.open.store(false, Ordering::SeqCst);
            self.queue
                .push(QueuedEvent::Disconnect(Arc::downgrade(&peer)));
        }
    }

    fn reconnect(&self, remote: DomainId, port: Port) -> Result<()> {
        let servers = self.servers.upgrade().ok_or(IvcError::Closed)?;
        let server = lock(&servers)
            .get(&port)
            .filter(|s| s.open.load(Ordering::SeqCst))
            .cloned()
            .ok_or(IvcError::ConnectionRefused {
                domain: remote,
                port,
            })?;
        let this = self.self_weak.upgrade().ok_or(IvcError::Closed)?;

        // The reconnecting side keeps its shared buffer and ring size;
        // only the ring contents and the peer binding are replaced.
        let capacity = lock(&self.ring).capacity;
        let accepted = LoopbackChannel::endpoint(
            self.queue.clone(),
            capacity,
            self.shared.clone(),
            self.view_len,
            self.servers.clone(),
        );
        lock(&self.ring).data.clear();
        self.open.store(true, Ordering::SeqCst);
        link(&this, &accepted);

        debug!(port, "loopback channel reconnected");
        self.queue.push(QueuedEvent::Accept {
            server: Arc::downgrade(&server),
            channel: accepted,
        });
        Ok(())
    }
}

/// A loopback listening server.
pub struct LoopbackServer {
    port: Port,
    remote: DomainId,
    open: AtomicBool,
    on_accept: Mutex<Option<AcceptCallback>>,
    servers: Weak<ServerMap>,
}

impl IvcServer for LoopbackServer {
    fn port(&self) -> Port {
        self.port
    }

    fn remote_domain(&self) -> DomainId {
        self.remote
    }

    fn shutdown(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        *lock(&self.on_accept) = None;
        if let Some(servers) = self.servers.upgrade() {
            lock(&servers).remove(&self.port);
        }
        debug!(port = self.port, "loopback server shut down");
    }
}

/// The in-process transport.
pub struct LoopbackIvc {
    servers: Arc<ServerMap>,
    queue: EventQueue,
}

impl LoopbackIvc {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            servers: Arc::new(Mutex::new(HashMap::new())),
            queue: EventQueue::new(),
        })
    }

    /// The transport's event queue, for tests that build raw channel
    /// pairs with [`LoopbackChannel::pair`].
    pub fn queue(&self) -> &EventQueue {
        &self.queue
    }

    /// Drain all queued transport events. Returns the count delivered.
    pub fn pump(&self) -> usize {
        self.queue.pump()
    }
}

impl Ivc for LoopbackIvc {
    fn connect(
        &self,
        remote: DomainId,
        port: Port,
        ring_pages: usize,
        _conn_id: ConnectionId,
    ) -> Result<Arc<dyn IvcChannel>> {
        let server = lock(&self.servers).get(&port).cloned();
        let Some(server) = server.filter(|s| s.open.load(Ordering::SeqCst)) else {
            return Err(IvcError::ConnectionRefused {
                domain: remote,
                port,
            });
        };

        let total = ring_pages.max(1) * PAGE_SIZE;
        let ring_capacity = total - METADATA_SIZE;
        let shared = Arc::new(Mutex::new(vec![0u8; total]));
        let connector = LoopbackChannel::endpoint(
            self.queue.clone(),
            ring_capacity,
            shared.clone(),
            ring_capacity,
            Arc::downgrade(&self.servers),
        );
        let accepted = LoopbackChannel::endpoint(
            self.queue.clone(),
            ring_capacity,
            shared,
            ring_capacity,
            Arc::downgrade(&self.servers),
        );
        link(&connector, &accepted);

        debug!(port, ring_pages, "loopback channel connected");
        self.queue.push(QueuedEvent::Accept {
            server: Arc::downgrade(&server),
            channel: accepted,
        });
        Ok(connector)
    }

    fn listen(
        &self,
        port: Port,
        remote: DomainId,
        _conn_id_mask: ConnectionId,
        on_accept: AcceptCallback,
    ) -> Result<Arc<dyn IvcServer>> {
        let mut servers = lock(&self.servers);
        if servers.contains_key(&port) {
            return Err(IvcError::PortInUse(port));
        }
        let server = Arc::new(LoopbackServer {
            port,
            remote,
            open: AtomicBool::new(true),
            on_accept: Mutex::new(Some(on_accept)),
            servers: Arc::downgrade(&self.servers),
        });
        servers.insert(port, server.clone());
        debug!(port, remote, "loopback server listening");
        Ok(server)
    }

    fn find_listening_server(&self, remote: DomainId, port: Port) -> Option<Arc<dyn IvcServer>> {
        let servers = lock(&self.servers);
        servers
            .get(&port)
            .filter(|s| s.remote == remote && s.open.load(Ordering::SeqCst))
            .cloned()
            .map(|s| s as Arc<dyn IvcServer>)
    }
}
