//! Guest-side endpoint: the display provider.
//!
//! The provider owns the outgoing control connection to the display
//! handler and creates per-display channel bundles on demand. The
//! handshake is reactionary: the host answers each step, so driver
//! handlers typically respond by calling straight back into provider
//! operations:
//!
//! ```text
//! provider                                 display handler
//!  connect to control port          ◁───── listening
//!  advertise_capabilities           ─────▷
//!                                   ◁───── HOST_DISPLAY_LIST
//!  advertise_displays               ─────▷
//!                                   ◁───── ADD_DISPLAY (per display)
//!  create_display (4 channels)      ─────▷
//!  change_resolution (SET_DISPLAY)  ─────▷
//! ```

use std::sync::{Arc, Mutex, RwLock};

use pvdisplay_ivc::{
    ChannelEvents, ConnectionId, DomainId, Ivc, IvcChannel, Port, CONNECTION_ID_ANY,
};
use pvdisplay_wire::{
    send_packet, AddDisplayRequest, AdvertisedDisplayList, DisplayInfo, DisplayNoLongerAvailable,
    DriverCapabilities, Header, HostDisplayList, PacketKind, RemoveDisplay, TextMode,
    CAP_HOTPLUG, CAP_RESIZE, MAX_DISPLAYS_PER_LIST, PROTOCOL_VERSION,
};
use tracing::{debug, error, warn};

use crate::display::{register_fatal_disconnect, FatalHandler, ProviderDisplay};
use crate::error::{DisplayError, Result};
use crate::receiver::{PacketReceiver, ReceiveFatal};
use crate::rings::{cursor_pages, framebuffer_pages, ChannelRings};
use crate::{lock, read_lock, write_lock};

type HostDisplayChangeHandler = Arc<dyn Fn(&[DisplayInfo]) + Send + Sync>;
type AddDisplayHandler = Arc<dyn Fn(&AddDisplayRequest) + Send + Sync>;
type RemoveDisplayHandler = Arc<dyn Fn(&RemoveDisplay) + Send + Sync>;

#[derive(Default)]
struct ProviderHandlers {
    host_display_change: Option<HostDisplayChangeHandler>,
    add_display: Option<AddDisplayHandler>,
    remove_display: Option<RemoveDisplayHandler>,
    /// Capability bits accumulated from handler registrations, reported
    /// in subsequent DRIVER_CAPABILITIES messages.
    capabilities: u32,
}

struct ProviderInner {
    ivc: Arc<dyn Ivc>,
    rx_domain: DomainId,
    control_port: Port,
    conn_id: ConnectionId,
    rings: ChannelRings,
    control: RwLock<Option<Arc<dyn IvcChannel>>>,
    receiver: Mutex<PacketReceiver>,
    handlers: Mutex<ProviderHandlers>,
    fatal: Mutex<Option<FatalHandler>>,
}

impl ProviderInner {
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

/// The guest-side display provider.
///
/// Cloning yields another handle onto the same provider. Control
/// packets are dispatched in arrival order; handlers run on the
/// transport's callback context and may call provider operations, but
/// should otherwise stay light.
#[derive(Clone)]
pub struct DisplayProvider {
    inner: Arc<ProviderInner>,
}

impl std::fmt::Debug for DisplayProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisplayProvider").finish_non_exhaustive()
    }
}

impl DisplayProvider {
    /// Connect to the display handler's control port.
    pub fn connect(ivc: Arc<dyn Ivc>, display_domain: DomainId, control_port: Port) -> Result<Self> {
        Self::connect_with_config(
            ivc,
            display_domain,
            control_port,
            CONNECTION_ID_ANY,
            ChannelRings::default(),
        )
    }

    /// Connect with an explicit connection identifier, for transports
    /// that multiplex several guests onto one port.
    pub fn connect_with_connection_id(
        ivc: Arc<dyn Ivc>,
        display_domain: DomainId,
        control_port: Port,
        conn_id: ConnectionId,
    ) -> Result<Self> {
        Self::connect_with_config(ivc, display_domain, control_port, conn_id, ChannelRings::default())
    }

    /// Connect with explicit ring sizing.
    pub fn connect_with_config(
        ivc: Arc<dyn Ivc>,
        display_domain: DomainId,
        control_port: Port,
        conn_id: ConnectionId,
        rings: ChannelRings,
    ) -> Result<Self> {
        let inner = Arc::new(ProviderInner {
            ivc,
            rx_domain: display_domain,
            control_port,
            conn_id,
            rings,
            control: RwLock::new(None),
            receiver: Mutex::new(PacketReceiver::new()),
            handlers: Mutex::new(ProviderHandlers::default()),
            fatal: Mutex::new(None),
        });

        let channel = inner
            .ivc
            .connect(display_domain, control_port, rings.control_pages, conn_id)?;

        let weak = Arc::downgrade(&inner);
        let data_weak = weak.clone();
        channel.register_events(ChannelEvents::new(
            Some(Arc::new(move || {
                if let Some(inner) = data_weak.upgrade() {
                    handle_control_data(&inner);
                }
            })),
            Some(Arc::new(move || {
                if let Some(inner) = weak.upgrade() {
                    error!("control channel to the display handler disconnected");
                    inner.trigger_fatal();
                }
            })),
        ));
        *write_lock(&inner.control) = Some(channel);

        debug!(display_domain, control_port, "display provider connected");
        Ok(Self { inner })
    }

    /// The domain the provider talks to.
    pub fn display_domain(&self) -> DomainId {
        self.inner.rx_domain
    }

    pub fn control_port(&self) -> Port {
        self.inner.control_port
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.inner.conn_id
    }

    /// Register the handler for host display list changes.
    ///
    /// Registering announces the RESIZE capability in subsequent
    /// capability advertisements.
    pub fn on_host_display_change(&self, handler: impl Fn(&[DisplayInfo]) + Send + Sync + 'static) {
        let mut handlers = lock(&self.inner.handlers);
        handlers.host_display_change = Some(Arc::new(handler));
        handlers.capabilities |= CAP_RESIZE;
    }

    /// Register the handler for add-display requests. Announces the
    /// HOTPLUG capability.
    pub fn on_add_display(&self, handler: impl Fn(&AddDisplayRequest) + Send + Sync + 'static) {
        let mut handlers = lock(&self.inner.handlers);
        handlers.add_display = Some(Arc::new(handler));
        handlers.capabilities |= CAP_HOTPLUG;
    }

    /// Register the handler for remove-display requests. Announces the
    /// HOTPLUG capability.
    pub fn on_remove_display(&self, handler: impl Fn(&RemoveDisplay) + Send + Sync + 'static) {
        let mut handlers = lock(&self.inner.handlers);
        handlers.remove_display = Some(Arc::new(handler));
        handlers.capabilities |= CAP_HOTPLUG;
    }

    /// Register the one-shot fatal error handler.
    pub fn on_fatal_error(&self, handler: impl FnOnce() + Send + 'static) {
        *lock(&self.inner.fatal) = Some(Box::new(handler));
    }

    /// Tell the display handler what this driver supports. This is the
    /// first packet of the handshake; the host answers with its display
    /// list.
    pub fn advertise_capabilities(&self, max_displays: u32) -> Result<()> {
        let flags = lock(&self.inner.handlers).capabilities;
        let body = DriverCapabilities {
            max_displays,
            version: PROTOCOL_VERSION,
            flags,
            reserved: 0,
        };
        self.send_control(PacketKind::DriverCapabilities, &body.to_bytes())
            .inspect_err(|err| error!("could not advertise driver capabilities: {err}"))
    }

    /// Advertise the displays this driver intends to drive. The host
    /// answers with one add-display request per accepted entry.
    pub fn advertise_displays(&self, displays: &[DisplayInfo]) -> Result<()> {
        if displays.len() > MAX_DISPLAYS_PER_LIST {
            return Err(DisplayError::InvalidArgument(
                "advertised display list does not fit in one packet",
            ));
        }
        let body = AdvertisedDisplayList {
            displays: displays.to_vec(),
        };
        self.send_control(PacketKind::AdvertisedDisplayList, &body.to_bytes())
            .inspect_err(|err| error!("unable to send the advertised display list: {err}"))
    }

    /// Force the host to render the emulator framebuffer ("text mode")
    /// instead of any paravirtualized display.
    pub fn force_text_mode(&self, force: bool) -> Result<()> {
        let body = TextMode {
            mode: if force {
                TextMode::ENABLED
            } else {
                TextMode::DISABLED
            },
        };
        self.send_control(PacketKind::TextMode, &body.to_bytes())
            .inspect_err(|err| error!("could not switch text mode: {err}"))
    }

    /// Create the per-display channel bundle for an add-display request.
    ///
    /// The framebuffer channel is opened first, then the event channel;
    /// both are required and either failure aborts the creation. The
    /// dirty-rectangle and cursor channels are attempted only when the
    /// request offers a port, and their failure merely degrades the
    /// display (full-screen refreshes, software cursor).
    ///
    /// `width`/`height` should be the largest mode this display will
    /// take; `stride` is in bytes. `initial_contents` pre-populates the
    /// framebuffer, which keeps reconnects from flashing stale data.
    pub fn create_display(
        &self,
        request: &AddDisplayRequest,
        width: u32,
        height: u32,
        stride: u32,
        initial_contents: Option<&[u8]>,
    ) -> Result<ProviderDisplay> {
        if request.framebuffer_port == 0 {
            error!("add-display request carries no framebuffer port, rejecting it");
            return Err(DisplayError::InvalidArgument(
                "add-display request has no framebuffer port",
            ));
        }
        if request.event_port == 0 {
            error!("add-display request carries no event port, rejecting it");
            return Err(DisplayError::InvalidArgument(
                "add-display request has no event port",
            ));
        }

        let inner = &self.inner;
        let framebuffer_size = stride as usize * height as usize;
        let display = ProviderDisplay::new(request.key, width, height, stride);

        // Framebuffer first: it is the largest allocation and the most
        // likely to fail.
        let framebuffer_channel = inner
            .ivc
            .connect(
                inner.rx_domain,
                request.framebuffer_port as Port,
                framebuffer_pages(framebuffer_size),
                inner.conn_id,
            )
            .inspect_err(|err| {
                error!(
                    key = request.key,
                    port = request.framebuffer_port,
                    "could not create a framebuffer connection: {err}"
                );
            })?;
        register_fatal_disconnect(&framebuffer_channel, display.inner(), "framebuffer");

        let framebuffer = match framebuffer_channel.local_buffer() {
            Ok(view) => view,
            Err(err) => {
                error!("transport reports an open connection but no local buffer: {err}");
                framebuffer_channel.disconnect();
                return Err(DisplayError::Transport(err));
            }
        };

        {
            let mut st = lock(&display.inner().state);
            st.framebuffer_channel = Some(framebuffer_channel);
            st.framebuffer = Some(framebuffer.clone());
            st.framebuffer_size = framebuffer_size;
        }

        // Event channel, the second required connection.
        match inner.ivc.connect(
            inner.rx_domain,
            request.event_port as Port,
            inner.rings.event_pages,
            inner.conn_id,
        ) {
            Ok(channel) => {
                register_fatal_disconnect(&channel, display.inner(), "event");
                lock(&display.inner().state).event_channel = Some(channel);
            }
            Err(err) => {
                error!(key = request.key, "could not create an event connection: {err}");
                display.destroy();
                return Err(err.into());
            }
        }

        if request.dirty_rectangles_port != 0 {
            match inner.ivc.connect(
                inner.rx_domain,
                request.dirty_rectangles_port as Port,
                inner.rings.dirty_rect_pages,
                inner.conn_id,
            ) {
                Ok(channel) => {
                    register_fatal_disconnect(&channel, display.inner(), "dirty-rectangles");
                    lock(&display.inner().state).dirty_rect_channel = Some(channel);
                }
                Err(err) => {
                    warn!(
                        key = request.key,
                        "could not create a dirty rectangle connection ({err}); performance will be reduced"
                    );
                }
            }
        }

        if request.cursor_bitmap_port != 0 {
            match self.open_cursor_channel(request, display.inner()) {
                Ok((channel, view)) => {
                    let mut st = lock(&display.inner().state);
                    st.cursor_channel = Some(channel);
                    st.cursor.image = Some(view);
                }
                Err(err) => {
                    warn!(
                        key = request.key,
                        "could not create a hardware cursor connection ({err}); falling back to a software cursor"
                    );
                }
            }
        }

        if let Some(contents) = initial_contents {
            let len = contents.len().min(framebuffer_size);
            framebuffer.write_at(0, &contents[..len])?;
        }

        debug!(key = request.key, width, height, stride, "display created");
        Ok(display)
    }

    fn open_cursor_channel(
        &self,
        request: &AddDisplayRequest,
        display: &Arc<crate::display::DisplayInner>,
    ) -> Result<(Arc<dyn IvcChannel>, pvdisplay_ivc::SharedView)> {
        let channel = self.inner.ivc.connect(
            self.inner.rx_domain,
            request.cursor_bitmap_port as Port,
            cursor_pages(),
            self.inner.conn_id,
        )?;
        register_fatal_disconnect(&channel, display, "cursor-image");
        match channel.local_buffer() {
            Ok(view) => Ok((channel, view)),
            Err(err) => {
                channel.disconnect();
                Err(DisplayError::Transport(err))
            }
        }
    }

    /// Destroy a display, notifying the host first.
    ///
    /// The notification is best-effort: the display handler survives
    /// missing teardown messages, so the local teardown proceeds either
    /// way.
    pub fn destroy_display(&self, display: &ProviderDisplay) -> Result<()> {
        let body = DisplayNoLongerAvailable {
            key: display.key(),
        };
        let result = self.send_control(PacketKind::DisplayNoLongerAvailable, &body.to_bytes());
        if let Err(err) = &result {
            error!("could not notify the display handler of display destruction: {err}");
        }
        display.destroy();
        result
    }

    /// Close the control channel. Subordinate displays must be
    /// destroyed first.
    pub fn destroy(&self) {
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

/// Drain and dispatch buffered control packets.
///
/// Runs under the receiver lock, which serializes the control stream
/// and keeps dispatch in arrival order.
fn handle_control_data(inner: &Arc<ProviderInner>) {
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

fn dispatch_control(inner: &Arc<ProviderInner>, header: &Header, payload: &[u8]) {
    match header.kind() {
        PacketKind::HostDisplayList => {
            let list = match HostDisplayList::from_bytes(payload) {
                Ok(list) => list,
                Err(err) => {
                    error!("malformed host display list: {err}");
                    return;
                }
            };
            let Some(handler) = lock(&inner.handlers).host_display_change.clone() else {
                debug!("host display list received, but no listener is registered");
                return;
            };
            handler(&list.displays);
        }
        PacketKind::AddDisplay => {
            let request = match AddDisplayRequest::from_bytes(payload) {
                Ok(request) => request,
                Err(err) => {
                    error!("malformed add-display request: {err}");
                    return;
                }
            };
            let Some(handler) = lock(&inner.handlers).add_display.clone() else {
                error!("add-display request received, but the driver has not set up a listener");
                return;
            };
            handler(&request);
        }
        PacketKind::RemoveDisplay => {
            let request = match RemoveDisplay::from_bytes(payload) {
                Ok(request) => request,
                Err(err) => {
                    error!("malformed remove-display request: {err}");
                    return;
                }
            };
            let Some(handler) = lock(&inner.handlers).remove_display.clone() else {
                error!("remove-display request received, but the driver has not set up a listener");
                return;
            };
            handler(&request);
        }
        kind => {
            // Unknown or unexpected types are ignored for forward
            // compatibility with newer display handlers.
            error!(kind = kind.to_u32(), "received unknown or unexpected packet type, no action taken");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use pvdisplay_ivc::{IvcServer, LoopbackIvc};
    use pvdisplay_wire::encode_packet;

    use super::*;

    struct ControlPeer {
        ivc: Arc<LoopbackIvc>,
        accepted: Arc<Mutex<Option<Arc<dyn IvcChannel>>>>,
        _server: Arc<dyn IvcServer>,
    }

    fn listen_control(port: Port) -> ControlPeer {
        let ivc = LoopbackIvc::new();
        let accepted: Arc<Mutex<Option<Arc<dyn IvcChannel>>>> = Arc::default();
        let slot = accepted.clone();
        let server = ivc
            .listen(
                port,
                1,
                CONNECTION_ID_ANY,
                Arc::new(move |channel| {
                    *lock(&slot) = Some(channel);
                }),
            )
            .unwrap();
        ControlPeer {
            ivc,
            accepted,
            _server: server,
        }
    }

    impl ControlPeer {
        fn channel(&self) -> Arc<dyn IvcChannel> {
            self.ivc.pump();
            lock(&self.accepted).clone().expect("control connection should be accepted")
        }
    }

    #[test]
    fn connect_requires_a_listening_display_handler() {
        let ivc = LoopbackIvc::new();
        let err = DisplayProvider::connect(ivc, 0, 1000).unwrap_err();
        assert!(matches!(err, DisplayError::NotFound));
    }

    #[test]
    fn capability_bits_follow_registrations() {
        let peer = listen_control(1000);
        let provider = DisplayProvider::connect(peer.ivc.clone(), 0, 1000).unwrap();
        let control = peer.channel();

        provider.advertise_capabilities(4).unwrap();
        provider.on_host_display_change(|_| {});
        provider.on_add_display(|_| {});
        provider.advertise_capabilities(4).unwrap();
        peer.ivc.pump();

        let mut receiver = PacketReceiver::new();
        let mut seen = Vec::new();
        receiver
            .pump(control.as_ref(), |header, payload| {
                assert_eq!(header.kind(), PacketKind::DriverCapabilities);
                seen.push(DriverCapabilities::from_bytes(payload).unwrap());
            })
            .unwrap();

        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].flags, 0);
        assert_eq!(seen[0].max_displays, 4);
        assert_eq!(seen[0].version, PROTOCOL_VERSION);
        assert_eq!(seen[1].flags, CAP_RESIZE | CAP_HOTPLUG);
    }

    #[test]
    fn host_display_list_reaches_handler() {
        let peer = listen_control(1000);
        let provider = DisplayProvider::connect(peer.ivc.clone(), 0, 1000).unwrap();
        let control = peer.channel();

        let seen: Arc<Mutex<Vec<DisplayInfo>>> = Arc::default();
        let slot = seen.clone();
        provider.on_host_display_change(move |displays| {
            lock(&slot).extend_from_slice(displays);
        });

        let list = HostDisplayList {
            displays: vec![DisplayInfo {
                key: 1,
                width: 1920,
                height: 1080,
                ..Default::default()
            }],
        };
        let packet = encode_packet(PacketKind::HostDisplayList, &list.to_bytes()).unwrap();
        control.send(&packet).unwrap();
        control.notify_remote();
        peer.ivc.pump();

        let seen = lock(&seen);
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].key, 1);
        assert_eq!(seen[0].width, 1920);
    }

    #[test]
    fn unknown_control_packet_is_ignored() {
        let peer = listen_control(1000);
        let provider = DisplayProvider::connect(peer.ivc.clone(), 0, 1000).unwrap();
        let control = peer.channel();

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        provider.on_fatal_error(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        let packet = encode_packet(PacketKind::Unknown(55), &[1, 2, 3]).unwrap();
        control.send(&packet).unwrap();
        control.notify_remote();
        peer.ivc.pump();

        // Not fatal, and the provider keeps working afterwards.
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        provider.advertise_capabilities(1).unwrap();
    }

    #[test]
    fn corrupt_control_packet_is_fatal_exactly_once() {
        let peer = listen_control(1000);
        let provider = DisplayProvider::connect(peer.ivc.clone(), 0, 1000).unwrap();
        let control = peer.channel();

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        provider.on_fatal_error(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        let handled = Arc::new(AtomicUsize::new(0));
        let handled_clone = handled.clone();
        provider.on_host_display_change(move |_| {
            handled_clone.fetch_add(1, Ordering::SeqCst);
        });

        let list = HostDisplayList { displays: vec![] };
        let mut packet = encode_packet(PacketKind::HostDisplayList, &list.to_bytes()).unwrap();
        let payload_at = Header::SIZE;
        packet[payload_at] ^= 0x01;
        control.send(&packet).unwrap();
        control.notify_remote();
        control.notify_remote();
        peer.ivc.pump();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(handled.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn control_disconnect_triggers_fatal() {
        let peer = listen_control(1000);
        let provider = DisplayProvider::connect(peer.ivc.clone(), 0, 1000).unwrap();
        let control = peer.channel();

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        provider.on_fatal_error(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        control.disconnect();
        peer.ivc.pump();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn create_display_validates_required_ports() {
        let peer = listen_control(1000);
        let provider = DisplayProvider::connect(peer.ivc.clone(), 0, 1000).unwrap();

        let no_framebuffer = AddDisplayRequest {
            key: 1,
            event_port: 1100,
            framebuffer_port: 0,
            dirty_rectangles_port: 0,
            cursor_bitmap_port: 0,
        };
        assert!(matches!(
            provider.create_display(&no_framebuffer, 640, 480, 2560, None),
            Err(DisplayError::InvalidArgument(_))
        ));

        let no_event = AddDisplayRequest {
            key: 1,
            event_port: 0,
            framebuffer_port: 1101,
            dirty_rectangles_port: 0,
            cursor_bitmap_port: 0,
        };
        assert!(matches!(
            provider.create_display(&no_event, 640, 480, 2560, None),
            Err(DisplayError::InvalidArgument(_))
        ));
    }

    #[test]
    fn oversized_advertised_list_rejected() {
        let peer = listen_control(1000);
        let provider = DisplayProvider::connect(peer.ivc.clone(), 0, 1000).unwrap();
        let displays = vec![DisplayInfo::default(); MAX_DISPLAYS_PER_LIST + 1];
        assert!(matches!(
            provider.advertise_displays(&displays),
            Err(DisplayError::InvalidArgument(_))
        ));
    }
}
