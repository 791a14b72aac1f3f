//! Consumer-side per-display aggregate ("backend").
//!
//! The passive mirror of [`ProviderDisplay`]: instead of connecting out,
//! a backend listens on the four per-display ports and accepts whatever
//! the guest connects. Incoming connections surface through
//! new-connection handlers; the owner decides whether to adopt each one
//! by calling the matching `finish_*_connection` method, which installs
//! the channel's event callbacks and, for the memory-backed channels,
//! fetches the shared view.
//!
//! [`ProviderDisplay`]: crate::display::ProviderDisplay

use std::sync::{Arc, Mutex};

use pvdisplay_ivc::{
    ChannelEvents, DomainId, Ivc, IvcChannel, IvcServer, Port, SharedView, CONNECTION_ID_ANY,
};
use pvdisplay_wire::{Blanking, DirtyRect, Header, MoveCursor, PacketKind, SetDisplay, UpdateCursor};
use tracing::{debug, error, warn};

use crate::display::{DriverData, FatalHandler};
use crate::error::{DisplayError, Result};
use crate::lock;
use crate::receiver::{PacketReceiver, ReceiveFatal};

type ConnectionHandler = Arc<dyn Fn(Arc<dyn IvcChannel>) + Send + Sync>;
type SetDisplayHandler = Arc<dyn Fn(u32, u32, u32) + Send + Sync>;
type UpdateCursorHandler = Arc<dyn Fn(u32, u32, u32) + Send + Sync>;
type MoveCursorHandler = Arc<dyn Fn(u32, u32) + Send + Sync>;
type BlankDisplayHandler = Arc<dyn Fn(u32) + Send + Sync>;
type DirtyRectangleHandler = Arc<dyn Fn(u32, u32, u32, u32) + Send + Sync>;

#[derive(Default)]
struct BackendHandlers {
    new_event_connection: Option<ConnectionHandler>,
    new_framebuffer_connection: Option<ConnectionHandler>,
    new_dirty_rect_connection: Option<ConnectionHandler>,
    new_cursor_connection: Option<ConnectionHandler>,
    set_display: Option<SetDisplayHandler>,
    update_cursor: Option<UpdateCursorHandler>,
    move_cursor: Option<MoveCursorHandler>,
    blank_display: Option<BlankDisplayHandler>,
    dirty_rectangle: Option<DirtyRectangleHandler>,
}

#[derive(Default)]
struct BackendServers {
    event: Option<Arc<dyn IvcServer>>,
    framebuffer: Option<Arc<dyn IvcServer>>,
    dirty_rects: Option<Arc<dyn IvcServer>>,
    cursor: Option<Arc<dyn IvcServer>>,
    listening: bool,
}

struct BackendState {
    disconnected: bool,
    receiver: PacketReceiver,
    event_channel: Option<Arc<dyn IvcChannel>>,
    framebuffer_channel: Option<Arc<dyn IvcChannel>>,
    dirty_rect_channel: Option<Arc<dyn IvcChannel>>,
    cursor_channel: Option<Arc<dyn IvcChannel>>,
    framebuffer: Option<SharedView>,
    framebuffer_size: usize,
    cursor_image: Option<SharedView>,
    handlers: BackendHandlers,
    servers: BackendServers,
    driver_data: Option<DriverData>,
}

struct BackendInner {
    ivc: Arc<dyn Ivc>,
    domain: DomainId,
    event_port: u32,
    framebuffer_port: u32,
    dirty_rectangles_port: u32,
    cursor_bitmap_port: u32,
    state: Mutex<BackendState>,
    /// Guards only the fatal handler slot. Never acquired while `state`
    /// is held by the same path, so the handler can be cleared even
    /// while a receive is in flight.
    fatal: Mutex<Option<FatalHandler>>,
}

impl BackendInner {
    fn trigger_fatal(&self) {
        let handler = lock(&self.fatal).take();
        if let Some(handler) = handler {
            handler();
        }
    }
}

/// A host-side display backend: four listening servers, the accepted
/// channels, and the shared buffers the guest exports.
#[derive(Clone)]
pub struct DisplayBackend {
    inner: Arc<BackendInner>,
}

impl DisplayBackend {
    pub(crate) fn new(
        ivc: Arc<dyn Ivc>,
        domain: DomainId,
        event_port: u32,
        framebuffer_port: u32,
        dirty_rectangles_port: u32,
        cursor_bitmap_port: u32,
        driver_data: Option<DriverData>,
    ) -> Self {
        Self {
            inner: Arc::new(BackendInner {
                ivc,
                domain,
                event_port,
                framebuffer_port,
                dirty_rectangles_port,
                cursor_bitmap_port,
                state: Mutex::new(BackendState {
                    disconnected: false,
                    receiver: PacketReceiver::new(),
                    event_channel: None,
                    framebuffer_channel: None,
                    dirty_rect_channel: None,
                    cursor_channel: None,
                    framebuffer: None,
                    framebuffer_size: 0,
                    cursor_image: None,
                    handlers: BackendHandlers::default(),
                    servers: BackendServers::default(),
                    driver_data,
                }),
                fatal: Mutex::new(None),
            }),
        }
    }

    pub fn domain(&self) -> DomainId {
        self.inner.domain
    }

    pub fn event_port(&self) -> u32 {
        self.inner.event_port
    }

    pub fn framebuffer_port(&self) -> u32 {
        self.inner.framebuffer_port
    }

    pub fn dirty_rectangles_port(&self) -> u32 {
        self.inner.dirty_rectangles_port
    }

    pub fn cursor_bitmap_port(&self) -> u32 {
        self.inner.cursor_bitmap_port
    }

    /// The guest's framebuffer, readable once the framebuffer
    /// connection has been finished.
    pub fn framebuffer(&self) -> Option<SharedView> {
        lock(&self.inner.state).framebuffer.clone()
    }

    pub fn framebuffer_size(&self) -> usize {
        lock(&self.inner.state).framebuffer_size
    }

    /// The guest's cursor image, once the cursor connection is finished.
    pub fn cursor_image(&self) -> Option<SharedView> {
        lock(&self.inner.state).cursor_image.clone()
    }

    pub fn set_driver_data(&self, data: DriverData) {
        lock(&self.inner.state).driver_data = Some(data);
    }

    pub fn driver_data(&self) -> Option<DriverData> {
        lock(&self.inner.state).driver_data.clone()
    }

    /// Start (or join) the four listening servers.
    ///
    /// An existing server on the same `(domain, port)` tuple is reused
    /// rather than duplicated, which lets several backends serve
    /// displays advertised to the same peer. On any bind failure the
    /// servers already started are shut down again.
    pub fn start_servers(&self) -> Result<()> {
        let inner = &self.inner;
        let mut st = lock(&inner.state);

        let fail = |st: &mut BackendState, label: &str, port: u32, err: &DisplayError| {
            error!(domain = inner.domain, port, "failed to create {label} server: {err}");
            for server in [
                st.servers.framebuffer.take(),
                st.servers.event.take(),
                st.servers.dirty_rects.take(),
                st.servers.cursor.take(),
            ]
            .into_iter()
            .flatten()
            {
                server.shutdown();
            }
        };

        match self.find_or_listen(inner.framebuffer_port, "framebuffer", forward_framebuffer) {
            Ok(server) => st.servers.framebuffer = Some(server),
            Err(err) => {
                fail(&mut st, "framebuffer", inner.framebuffer_port, &err);
                return Err(err);
            }
        }
        match self.find_or_listen(inner.event_port, "event", forward_event) {
            Ok(server) => st.servers.event = Some(server),
            Err(err) => {
                fail(&mut st, "event", inner.event_port, &err);
                return Err(err);
            }
        }
        match self.find_or_listen(inner.dirty_rectangles_port, "dirty-rectangles", forward_dirty) {
            Ok(server) => st.servers.dirty_rects = Some(server),
            Err(err) => {
                fail(&mut st, "dirty-rectangles", inner.dirty_rectangles_port, &err);
                return Err(err);
            }
        }
        match self.find_or_listen(inner.cursor_bitmap_port, "cursor-image", forward_cursor) {
            Ok(server) => st.servers.cursor = Some(server),
            Err(err) => {
                fail(&mut st, "cursor-image", inner.cursor_bitmap_port, &err);
                return Err(err);
            }
        }

        st.servers.listening = true;
        debug!(domain = inner.domain, "display backend servers listening");
        Ok(())
    }

    fn find_or_listen(
        &self,
        port: u32,
        label: &'static str,
        forward: ConnectionForward,
    ) -> Result<Arc<dyn IvcServer>> {
        let inner = &self.inner;
        if let Some(server) = inner.ivc.find_listening_server(inner.domain, port as Port) {
            debug!(port, "reusing existing {label} server");
            return Ok(server);
        }
        let weak = Arc::downgrade(inner);
        let server = inner.ivc.listen(
            port as Port,
            inner.domain,
            CONNECTION_ID_ANY,
            Arc::new(move |channel| {
                if let Some(inner) = weak.upgrade() {
                    forward(&inner, channel);
                }
            }),
        )?;
        Ok(server)
    }

    /// Adopt an accepted event channel: install the packet receiver and
    /// enable events.
    pub fn finish_event_connection(&self, channel: Arc<dyn IvcChannel>) {
        lock(&self.inner.state).event_channel = Some(channel.clone());

        let data_weak = Arc::downgrade(&self.inner);
        let disc_weak = Arc::downgrade(&self.inner);
        channel.register_events(ChannelEvents::new(
            Some(Arc::new(move || {
                if let Some(inner) = data_weak.upgrade() {
                    handle_event_data(&inner);
                }
            })),
            Some(Arc::new(move || {
                if let Some(inner) = disc_weak.upgrade() {
                    error!("display event channel disconnected");
                    inner.trigger_fatal();
                }
            })),
        ));
        channel.enable_events();
    }

    /// Adopt an accepted framebuffer channel and fetch its shared view.
    ///
    /// Failing to obtain the view is fatal: a framebuffer connection
    /// without a framebuffer is useless.
    pub fn finish_framebuffer_connection(&self, channel: Arc<dyn IvcChannel>) {
        let disc_weak = Arc::downgrade(&self.inner);
        channel.register_events(ChannelEvents::new(
            None,
            Some(Arc::new(move || {
                if let Some(inner) = disc_weak.upgrade() {
                    error!("display framebuffer channel disconnected");
                    inner.trigger_fatal();
                }
            })),
        ));

        let view = channel.local_buffer();
        let size = channel.local_buffer_size();
        let mut st = lock(&self.inner.state);
        st.framebuffer_channel = Some(channel);
        match (view, size) {
            (Ok(view), Ok(size)) => {
                st.framebuffer = Some(view);
                st.framebuffer_size = size;
            }
            (view, size) => {
                error!(
                    "accepted a framebuffer connection without a usable shared buffer \
                     (view: {:?}, size: {:?})",
                    view.err(),
                    size.err()
                );
                drop(st);
                self.inner.trigger_fatal();
            }
        }
    }

    /// Adopt an accepted dirty-rectangle channel. Its data callback
    /// drains every complete 16-byte record per invocation.
    pub fn finish_dirty_rect_connection(&self, channel: Arc<dyn IvcChannel>) {
        lock(&self.inner.state).dirty_rect_channel = Some(channel.clone());

        let data_weak = Arc::downgrade(&self.inner);
        let disc_weak = Arc::downgrade(&self.inner);
        channel.register_events(ChannelEvents::new(
            Some(Arc::new(move || {
                if let Some(inner) = data_weak.upgrade() {
                    handle_dirty_rect_data(&inner);
                }
            })),
            Some(Arc::new(move || {
                if let Some(inner) = disc_weak.upgrade() {
                    error!("display dirty rectangle channel disconnected");
                    inner.trigger_fatal();
                }
            })),
        ));
        channel.enable_events();
    }

    /// Adopt an accepted cursor-image channel and fetch its shared view.
    pub fn finish_cursor_connection(&self, channel: Arc<dyn IvcChannel>) {
        let disc_weak = Arc::downgrade(&self.inner);
        channel.register_events(ChannelEvents::new(
            None,
            Some(Arc::new(move || {
                if let Some(inner) = disc_weak.upgrade() {
                    error!("display cursor image channel disconnected");
                    inner.trigger_fatal();
                }
            })),
        ));

        let view = channel.local_buffer();
        let mut st = lock(&self.inner.state);
        st.cursor_channel = Some(channel);
        match view {
            Ok(view) => st.cursor_image = Some(view),
            Err(err) => {
                error!("accepted a cursor connection without a usable shared buffer: {err}");
                drop(st);
                self.inner.trigger_fatal();
            }
        }
    }

    /// Register the handler invoked when the guest connects to the
    /// event port. The handler decides whether to adopt the connection
    /// via [`finish_event_connection`].
    ///
    /// [`finish_event_connection`]: DisplayBackend::finish_event_connection
    pub fn on_new_event_connection(
        &self,
        handler: impl Fn(Arc<dyn IvcChannel>) + Send + Sync + 'static,
    ) {
        lock(&self.inner.state).handlers.new_event_connection = Some(Arc::new(handler));
    }

    pub fn on_new_framebuffer_connection(
        &self,
        handler: impl Fn(Arc<dyn IvcChannel>) + Send + Sync + 'static,
    ) {
        lock(&self.inner.state).handlers.new_framebuffer_connection = Some(Arc::new(handler));
    }

    pub fn on_new_dirty_rect_connection(
        &self,
        handler: impl Fn(Arc<dyn IvcChannel>) + Send + Sync + 'static,
    ) {
        lock(&self.inner.state).handlers.new_dirty_rect_connection = Some(Arc::new(handler));
    }

    pub fn on_new_cursor_connection(
        &self,
        handler: impl Fn(Arc<dyn IvcChannel>) + Send + Sync + 'static,
    ) {
        lock(&self.inner.state).handlers.new_cursor_connection = Some(Arc::new(handler));
    }

    /// Register the handler for SET_DISPLAY events:
    /// `(width, height, stride)`.
    pub fn on_set_display(&self, handler: impl Fn(u32, u32, u32) + Send + Sync + 'static) {
        lock(&self.inner.state).handlers.set_display = Some(Arc::new(handler));
    }

    /// Register the handler for UPDATE_CURSOR events:
    /// `(xhot, yhot, show)`.
    pub fn on_update_cursor(&self, handler: impl Fn(u32, u32, u32) + Send + Sync + 'static) {
        lock(&self.inner.state).handlers.update_cursor = Some(Arc::new(handler));
    }

    /// Register the handler for MOVE_CURSOR events: `(x, y)`.
    pub fn on_move_cursor(&self, handler: impl Fn(u32, u32) + Send + Sync + 'static) {
        lock(&self.inner.state).handlers.move_cursor = Some(Arc::new(handler));
    }

    /// Register the handler for BLANK_DISPLAY events: `(reason)`.
    pub fn on_blank_display(&self, handler: impl Fn(u32) + Send + Sync + 'static) {
        lock(&self.inner.state).handlers.blank_display = Some(Arc::new(handler));
    }

    /// Register the handler for dirty rectangles:
    /// `(x, y, width, height)`.
    pub fn on_dirty_rectangle(&self, handler: impl Fn(u32, u32, u32, u32) + Send + Sync + 'static) {
        lock(&self.inner.state).handlers.dirty_rectangle = Some(Arc::new(handler));
    }

    /// Register the one-shot fatal error handler.
    pub fn on_fatal_error(&self, handler: impl FnOnce() + Send + 'static) {
        *lock(&self.inner.fatal) = Some(Box::new(handler));
    }

    /// Disconnect every accepted channel and stop processing events.
    ///
    /// Handler slots for the disconnected channels are cleared first so
    /// that late callbacks cannot observe half-torn-down state; any
    /// receive callback racing this sees the `disconnected` flag and
    /// returns immediately.
    pub fn disconnect_display(&self) {
        let mut st = lock(&self.inner.state);

        if let Some(event) = st.event_channel.take() {
            event.disable_events();
            st.handlers.set_display = None;
            st.handlers.blank_display = None;
            st.handlers.move_cursor = None;
            st.handlers.update_cursor = None;
            event.disconnect();
        }
        if let Some(framebuffer) = st.framebuffer_channel.take() {
            framebuffer.disconnect();
            st.framebuffer = None;
            st.framebuffer_size = 0;
        }
        if let Some(dirty) = st.dirty_rect_channel.take() {
            dirty.disable_events();
            dirty.disconnect();
            st.handlers.dirty_rectangle = None;
        }
        if let Some(cursor) = st.cursor_channel.take() {
            cursor.disable_events();
            cursor.disconnect();
            st.cursor_image = None;
        }
        st.disconnected = true;
    }

    /// Full teardown: disconnect, clear the fatal handler, and shut the
    /// listening servers down.
    pub fn destroy(&self) {
        self.disconnect_display();
        *lock(&self.inner.fatal) = None;

        let mut st = lock(&self.inner.state);
        st.servers.listening = false;
        for server in [
            st.servers.event.take(),
            st.servers.dirty_rects.take(),
            st.servers.cursor.take(),
            st.servers.framebuffer.take(),
        ]
        .into_iter()
        .flatten()
        {
            server.shutdown();
        }
        st.handlers = BackendHandlers::default();
    }
}

type ConnectionForward = fn(&Arc<BackendInner>, Arc<dyn IvcChannel>);

fn forward_event(inner: &Arc<BackendInner>, channel: Arc<dyn IvcChannel>) {
    let handler = lock(&inner.state).handlers.new_event_connection.clone();
    match handler {
        Some(handler) => handler(channel),
        None => warn!("event connection accepted but no connection handler is registered"),
    }
}

fn forward_framebuffer(inner: &Arc<BackendInner>, channel: Arc<dyn IvcChannel>) {
    let handler = lock(&inner.state).handlers.new_framebuffer_connection.clone();
    match handler {
        Some(handler) => handler(channel),
        None => warn!("framebuffer connection accepted but no connection handler is registered"),
    }
}

fn forward_dirty(inner: &Arc<BackendInner>, channel: Arc<dyn IvcChannel>) {
    let handler = lock(&inner.state).handlers.new_dirty_rect_connection.clone();
    match handler {
        Some(handler) => handler(channel),
        None => warn!("dirty rectangle connection accepted but no connection handler is registered"),
    }
}

fn forward_cursor(inner: &Arc<BackendInner>, channel: Arc<dyn IvcChannel>) {
    let handler = lock(&inner.state).handlers.new_cursor_connection.clone();
    match handler {
        Some(handler) => handler(channel),
        None => warn!("cursor connection accepted but no connection handler is registered"),
    }
}

/// Drain and dispatch buffered event-channel packets.
///
/// Dispatch happens under the backend's state lock, which serializes
/// the event stream; handlers must not call backend operations that
/// take the same lock.
fn handle_event_data(inner: &Arc<BackendInner>) {
    let result = {
        let mut guard = lock(&inner.state);
        let st = &mut *guard;
        if st.disconnected {
            debug!("event received on a disconnected display, ignoring");
            return;
        }
        let Some(channel) = st.event_channel.clone() else {
            return;
        };
        let handlers = &st.handlers;
        st.receiver.pump(channel.as_ref(), |header, payload| {
            dispatch_event(handlers, header, payload);
        })
    };

    if let Err(fatal) = result {
        match fatal {
            ReceiveFatal::CrcMismatch { found, computed } => error!(
                found, computed,
                "communications error: event packet crc mismatch, terminating connections"
            ),
            ReceiveFatal::BadMagic { magic1, magic2 } => error!(
                magic1, magic2,
                "communications error: event packet magic mismatch, terminating connections"
            ),
            ReceiveFatal::OversizeLength(length) => {
                error!(length, "communications error: event packet exceeds the maximum packet size")
            }
            ReceiveFatal::QueryFailed(err) => {
                error!("could not query the transport for available event data: {err}")
            }
        }
        inner.trigger_fatal();
    }
}

fn dispatch_event(handlers: &BackendHandlers, header: &Header, payload: &[u8]) {
    match header.kind() {
        PacketKind::SetDisplay => {
            let body = match SetDisplay::from_bytes(payload) {
                Ok(body) => body,
                Err(err) => {
                    error!("malformed set-display event: {err}");
                    return;
                }
            };
            let Some(handler) = &handlers.set_display else {
                debug!("set-display event received, but no one registered a listener");
                return;
            };
            handler(body.width, body.height, body.stride);
        }
        PacketKind::UpdateCursor => {
            let body = match UpdateCursor::from_bytes(payload) {
                Ok(body) => body,
                Err(err) => {
                    error!("malformed update-cursor event: {err}");
                    return;
                }
            };
            let Some(handler) = &handlers.update_cursor else {
                debug!("update-cursor event received, but no one registered a listener");
                return;
            };
            handler(body.xhot, body.yhot, body.show);
        }
        PacketKind::MoveCursor => {
            let body = match MoveCursor::from_bytes(payload) {
                Ok(body) => body,
                Err(err) => {
                    error!("malformed move-cursor event: {err}");
                    return;
                }
            };
            let Some(handler) = &handlers.move_cursor else {
                debug!("move-cursor event received, but no one registered a listener");
                return;
            };
            handler(body.x, body.y);
        }
        PacketKind::BlankDisplay => {
            let body = match Blanking::from_bytes(payload) {
                Ok(body) => body,
                Err(err) => {
                    error!("malformed blank-display event: {err}");
                    return;
                }
            };
            let Some(handler) = &handlers.blank_display else {
                debug!("blank-display event received, but no one registered a listener");
                return;
            };
            handler(body.reason);
        }
        kind => {
            error!(kind = kind.to_u32(), "received unknown or unexpected packet type, no action taken");
        }
    }
}

/// Drain every complete dirty-rectangle record currently buffered.
///
/// The guest may outpace us; each data event empties the ring so the
/// channel's generous sizing is the only backpressure.
fn handle_dirty_rect_data(inner: &Arc<BackendInner>) {
    let (channel, handler) = {
        let st = lock(&inner.state);
        if st.disconnected {
            return;
        }
        (st.dirty_rect_channel.clone(), st.handlers.dirty_rectangle.clone())
    };
    let Some(channel) = channel else {
        return;
    };

    let mut raw = [0u8; DirtyRect::SIZE];
    loop {
        let available = match channel.available_data() {
            Ok(n) => n,
            Err(_) => return,
        };
        if available < DirtyRect::SIZE || !channel.is_open() {
            return;
        }
        if channel.recv(&mut raw).is_err() {
            return;
        }
        let Ok(rect) = DirtyRect::from_bytes(&raw) else {
            return;
        };
        if let Some(handler) = &handler {
            handler(rect.x, rect.y, rect.width, rect.height);
        }
    }
}
