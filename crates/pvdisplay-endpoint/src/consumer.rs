//! Host-side endpoint: the display consumer.
//!
//! The consumer listens on the control port, owns the accepted control
//! connection, publishes the host display list and per-display
//! add/remove requests, and hands per-display traffic to
//! [`DisplayBackend`] aggregates created through its factory.
//!
//! Accepting a control connection is a two-step affair, mirroring the
//! backend channels: the transport surfaces it through the registered
//! new-connection handler, and the owner adopts it with
//! [`finish_control_connection`], which installs the receive callbacks
//! and immediately drains anything the guest already sent.
//!
//! [`finish_control_connection`]: DisplayConsumer::finish_control_connection

use std::sync::{Arc, Mutex, RwLock};

use pvdisplay_ivc::{
    ChannelEvents, ConnectionId, DomainId, Ivc, IvcChannel, IvcServer, Port, CONNECTION_ID_ANY,
};
use pvdisplay_wire::{
    send_packet, AddDisplayRequest, AdvertisedDisplayList, DisplayInfo, DisplayNoLongerAvailable,
    DriverCapabilities, Header, HostDisplayList, PacketKind, RemoveDisplay, TextMode,
    MAX_DISPLAYS_PER_LIST,
};
use tracing::{debug, error};

use crate::backend::DisplayBackend;
use crate::display::{DriverData, FatalHandler};
use crate::error::{DisplayError, Result};
use crate::receiver::{PacketReceiver, ReceiveFatal};
use crate::{lock, read_lock, write_lock};

type ControlConnectionHandler = Arc<dyn Fn(Arc<dyn IvcChannel>) + Send + Sync>;
type DriverCapabilitiesHandler = Arc<dyn Fn(&DriverCapabilities) + Send + Sync>;
type AdvertisedListHandler = Arc<dyn Fn(&[DisplayInfo]) + Send + Sync>;
type DisplayGoneHandler = Arc<dyn Fn(u32) + Send + Sync>;
type TextModeHandler = Arc<dyn Fn(bool) + Send + Sync>;

#[derive(Default)]
struct ConsumerHandlers {
    new_control_connection: Option<ControlConnectionHandler>,
    driver_capabilities: Option<DriverCapabilitiesHandler>,
    advertised_list: Option<AdvertisedListHandler>,
    display_no_longer_available: Option<DisplayGoneHandler>,
    text_mode: Option<TextModeHandler>,
}

struct ConsumerInner {
    ivc: Arc<dyn Ivc>,
    guest_domain: DomainId,
    control_port: Port,
    conn_id: ConnectionId,
    control: RwLock<Option<Arc<dyn IvcChannel>>>,
    server: Mutex<Option<Arc<dyn IvcServer>>>,
    receiver: Mutex<PacketReceiver>,
    handlers: Mutex<ConsumerHandlers>,
    fatal: Mutex<Option<FatalHandler>>,
    driver_data: Mutex<Option<DriverData>>,
}

impl ConsumerInner {
    fn control_channel(&self) -> Option<Arc<dyn IvcChannel>> {
        read_lock(&self.control).clone()
    }

    fn trigger_fatal(&self) {
        let handler = lock(&self.fatal).take();
        if let Some(handler) = handler {
            handler();
        }
    }
}

/// The host-side display consumer.
///
/// Construction is passive: [`start_server`] begins listening, and
/// everything after that reacts to the guest.
///
/// [`start_server`]: DisplayConsumer::start_server
#[derive(Clone)]
pub struct DisplayConsumer {
    inner: Arc<ConsumerInner>,
}

impl DisplayConsumer {
    /// Create a consumer for `guest_domain` on `control_port`.
    pub fn new(ivc: Arc<dyn Ivc>, guest_domain: DomainId, control_port: Port) -> Self {
        Self::with_connection_id(ivc, guest_domain, control_port, CONNECTION_ID_ANY)
    }

    /// Create a consumer matching only a specific connection id.
    pub fn with_connection_id(
        ivc: Arc<dyn Ivc>,
        guest_domain: DomainId,
        control_port: Port,
        conn_id: ConnectionId,
    ) -> Self {
        Self {
            inner: Arc::new(ConsumerInner {
                ivc,
                guest_domain,
                control_port,
                conn_id,
                control: RwLock::new(None),
                server: Mutex::new(None),
                receiver: Mutex::new(PacketReceiver::new()),
                handlers: Mutex::new(ConsumerHandlers::default()),
                fatal: Mutex::new(None),
                driver_data: Mutex::new(None),
            }),
        }
    }

    pub fn guest_domain(&self) -> DomainId {
        self.inner.guest_domain
    }

    pub fn control_port(&self) -> Port {
        self.inner.control_port
    }

    pub fn set_driver_data(&self, data: DriverData) {
        *lock(&self.inner.driver_data) = Some(data);
    }

    pub fn driver_data(&self) -> Option<DriverData> {
        lock(&self.inner.driver_data).clone()
    }

    /// Begin listening for control connections from the guest.
    pub fn start_server(&self) -> Result<()> {
        let inner = &self.inner;
        let weak = Arc::downgrade(inner);
        let server = inner.ivc.listen(
            inner.control_port,
            inner.guest_domain,
            inner.conn_id,
            Arc::new(move |channel| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let handler = lock(&inner.handlers).new_control_connection.clone();
                match handler {
                    Some(handler) => handler(channel),
                    None => {
                        debug!("control connection accepted but no connection handler is registered")
                    }
                }
            }),
        )?;
        *lock(&inner.server) = Some(server);
        debug!(
            domain = inner.guest_domain,
            port = inner.control_port,
            "display consumer listening"
        );
        Ok(())
    }

    /// Adopt an accepted control connection: install the receive
    /// callbacks and drain anything that is already buffered.
    pub fn finish_control_connection(&self, channel: Arc<dyn IvcChannel>) {
        *write_lock(&self.inner.control) = Some(channel.clone());

        let data_weak = Arc::downgrade(&self.inner);
        let disc_weak = Arc::downgrade(&self.inner);
        channel.register_events(ChannelEvents::new(
            Some(Arc::new(move || {
                if let Some(inner) = data_weak.upgrade() {
                    handle_control_data(&inner);
                }
            })),
            Some(Arc::new(move || {
                let Some(inner) = disc_weak.upgrade() else {
                    return;
                };
                error!(
                    domain = inner.guest_domain,
                    port = inner.control_port,
                    "guest control channel disconnected"
                );
                inner.trigger_fatal();
                if let Some(channel) = inner.control_channel() {
                    channel.disconnect();
                }
            })),
        ));

        // The guest may already have sent its capabilities before we
        // finished the connection.
        handle_control_data(&self.inner);
    }

    /// Register the handler for newly accepted control connections.
    pub fn on_new_control_connection(
        &self,
        handler: impl Fn(Arc<dyn IvcChannel>) + Send + Sync + 'static,
    ) {
        lock(&self.inner.handlers).new_control_connection = Some(Arc::new(handler));
    }

    /// Register the handler for DRIVER_CAPABILITIES packets.
    pub fn on_driver_capabilities(
        &self,
        handler: impl Fn(&DriverCapabilities) + Send + Sync + 'static,
    ) {
        lock(&self.inner.handlers).driver_capabilities = Some(Arc::new(handler));
    }

    /// Register the handler for the guest's advertised display list.
    pub fn on_advertised_display_list(
        &self,
        handler: impl Fn(&[DisplayInfo]) + Send + Sync + 'static,
    ) {
        lock(&self.inner.handlers).advertised_list = Some(Arc::new(handler));
    }

    /// Register the handler for display-no-longer-available packets,
    /// invoked with the display key.
    pub fn on_display_no_longer_available(&self, handler: impl Fn(u32) + Send + Sync + 'static) {
        lock(&self.inner.handlers).display_no_longer_available = Some(Arc::new(handler));
    }

    /// Register the handler for text-mode requests. `force` is true
    /// when the guest wants the emulator framebuffer shown.
    pub fn on_text_mode(&self, handler: impl Fn(bool) + Send + Sync + 'static) {
        lock(&self.inner.handlers).text_mode = Some(Arc::new(handler));
    }

    /// Register the one-shot fatal error handler.
    pub fn on_fatal_error(&self, handler: impl FnOnce() + Send + 'static) {
        *lock(&self.inner.fatal) = Some(Box::new(handler));
    }

    /// Publish the host's physical display list.
    pub fn send_display_list(&self, displays: &[DisplayInfo]) -> Result<()> {
        if displays.len() > MAX_DISPLAYS_PER_LIST {
            return Err(DisplayError::InvalidArgument(
                "host display list does not fit in one packet",
            ));
        }
        let body = HostDisplayList {
            displays: displays.to_vec(),
        };
        self.send_control(PacketKind::HostDisplayList, &body.to_bytes())
            .inspect_err(|err| error!("unable to send the host display list: {err}"))
    }

    /// Ask the guest to bring up a display, handing it the four
    /// per-display ports. Zero ports mark the optional channels as not
    /// offered.
    pub fn add_display(
        &self,
        key: u32,
        event_port: u32,
        framebuffer_port: u32,
        dirty_rectangles_port: u32,
        cursor_bitmap_port: u32,
    ) -> Result<()> {
        let body = AddDisplayRequest {
            key,
            event_port,
            framebuffer_port,
            dirty_rectangles_port,
            cursor_bitmap_port,
        };
        self.send_control(PacketKind::AddDisplay, &body.to_bytes())
            .inspect_err(|err| error!(key, "unable to send an add-display request: {err}"))
    }

    /// Tell the guest a host display went away.
    pub fn remove_display(&self, key: u32) -> Result<()> {
        let body = RemoveDisplay { key };
        self.send_control(PacketKind::RemoveDisplay, &body.to_bytes())
            .inspect_err(|err| error!(key, "unable to send a remove-display request: {err}"))
    }

    /// Create the per-display backend aggregate for the given ports.
    ///
    /// The backend starts listening only once its
    /// [`start_servers`](DisplayBackend::start_servers) is called.
    pub fn create_display_backend(
        &self,
        domain: DomainId,
        event_port: u32,
        framebuffer_port: u32,
        dirty_rectangles_port: u32,
        cursor_bitmap_port: u32,
        driver_data: Option<DriverData>,
    ) -> DisplayBackend {
        DisplayBackend::new(
            self.inner.ivc.clone(),
            domain,
            event_port,
            framebuffer_port,
            dirty_rectangles_port,
            cursor_bitmap_port,
            driver_data,
        )
    }

    /// Tear a backend down: disconnect its channels and shut its
    /// servers down.
    pub fn destroy_display(&self, backend: &DisplayBackend) {
        backend.destroy();
    }

    /// Stop listening and drop the control connection.
    pub fn destroy(&self) {
        if let Some(server) = lock(&self.inner.server).take() {
            server.shutdown();
        }
        if let Some(channel) = write_lock(&self.inner.control).take() {
            channel.disconnect();
        }
    }

    fn send_control(&self, kind: PacketKind, payload: &[u8]) -> Result<()> {
        let channel = self.inner.control_channel().ok_or(DisplayError::Closed)?;
        send_packet(channel.as_ref(), kind, payload)?;
        Ok(())
    }
}

/// Drain and dispatch buffered control packets from the guest.
fn handle_control_data(inner: &Arc<ConsumerInner>) {
    let Some(channel) = inner.control_channel() else {
        return;
    };

    let result = {
        let mut receiver = lock(&inner.receiver);
        receiver.pump(channel.as_ref(), |header, payload| {
            dispatch_control(inner, header, payload);
        })
    };

    if let Err(fatal) = result {
        match fatal {
            ReceiveFatal::CrcMismatch { found, computed } => error!(
                found, computed,
                "communications error: control packet crc mismatch, terminating connections"
            ),
            ReceiveFatal::BadMagic { magic1, magic2 } => error!(
                magic1, magic2,
                "communications error: control packet magic mismatch, terminating connections"
            ),
            ReceiveFatal::OversizeLength(length) => error!(
                length,
                "communications error: control packet exceeds the maximum packet size"
            ),
            ReceiveFatal::QueryFailed(err) => {
                error!("could not query the transport for available control data: {err}")
            }
        }
        inner.trigger_fatal();
    }
}

fn dispatch_control(inner: &Arc<ConsumerInner>, header: &Header, payload: &[u8]) {
    match header.kind() {
        PacketKind::DriverCapabilities => {
            let body = match DriverCapabilities::from_bytes(payload) {
                Ok(body) => body,
                Err(err) => {
                    error!("malformed driver capabilities packet: {err}");
                    return;
                }
            };
            let Some(handler) = lock(&inner.handlers).driver_capabilities.clone() else {
                error!("driver capabilities received, but no handler has been registered");
                return;
            };
            handler(&body);
        }
        PacketKind::AdvertisedDisplayList => {
            let body = match AdvertisedDisplayList::from_bytes(payload) {
                Ok(body) => body,
                Err(err) => {
                    error!("malformed advertised display list: {err}");
                    return;
                }
            };
            let Some(handler) = lock(&inner.handlers).advertised_list.clone() else {
                error!("advertised display list received, but no handler has been registered");
                return;
            };
            handler(&body.displays);
        }
        PacketKind::DisplayNoLongerAvailable => {
            let body = match DisplayNoLongerAvailable::from_bytes(payload) {
                Ok(body) => body,
                Err(err) => {
                    error!("malformed display-no-longer-available packet: {err}");
                    return;
                }
            };
            let Some(handler) = lock(&inner.handlers).display_no_longer_available.clone() else {
                error!(
                    "display-no-longer-available received, but no handler has been registered"
                );
                return;
            };
            handler(body.key);
        }
        PacketKind::TextMode => {
            let body = match TextMode::from_bytes(payload) {
                Ok(body) => body,
                Err(err) => {
                    error!("malformed text-mode packet: {err}");
                    return;
                }
            };
            let Some(handler) = lock(&inner.handlers).text_mode.clone() else {
                error!("text-mode request received, but no handler has been registered");
                return;
            };
            handler(body.mode != TextMode::DISABLED);
        }
        kind => {
            error!(kind = kind.to_u32(), "received unknown or unexpected packet type, no action taken");
        }
    }
}
