//! Provider-side per-display aggregate.
//!
//! A [`ProviderDisplay`] bundles the four IVC connections of one display
//! (event, framebuffer, dirty rectangles, cursor image) together with
//! the display geometry and cursor state. It is created by
//! [`DisplayProvider::create_display`] in response to an add-display
//! request and exclusively owns its channels until destroyed.
//!
//! [`DisplayProvider::create_display`]: crate::provider::DisplayProvider::create_display

use std::any::Any;
use std::sync::{Arc, Mutex, Weak};

use pvdisplay_ivc::{ChannelEvents, DomainId, IvcChannel, Port, SharedView};
use pvdisplay_wire::{
    send_packet, AddDisplayRequest, Blanking, BlankingReason, DirtyRect, MoveCursor, PacketKind,
    SetDisplay, UpdateCursor, CURSOR_HEIGHT, CURSOR_HIDE, CURSOR_SHOW, CURSOR_STRIDE, CURSOR_WIDTH,
};
use tracing::{error, warn};

use crate::error::{DisplayError, Result};
use crate::lock;

pub(crate) type FatalHandler = Box<dyn FnOnce() + Send>;

/// Opaque per-display driver state, attachable to any aggregate.
pub type DriverData = Arc<dyn Any + Send + Sync>;

#[derive(Default)]
pub(crate) struct CursorState {
    pub image: Option<SharedView>,
    pub hotspot_x: u32,
    pub hotspot_y: u32,
    pub visible: bool,
}

pub(crate) struct DisplayState {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub framebuffer: Option<SharedView>,
    pub framebuffer_size: usize,
    pub event_channel: Option<Arc<dyn IvcChannel>>,
    pub framebuffer_channel: Option<Arc<dyn IvcChannel>>,
    pub dirty_rect_channel: Option<Arc<dyn IvcChannel>>,
    pub cursor_channel: Option<Arc<dyn IvcChannel>>,
    pub cursor: CursorState,
    pub driver_data: Option<DriverData>,
}

pub(crate) struct DisplayInner {
    pub key: u32,
    pub state: Mutex<DisplayState>,
    pub fatal: Mutex<Option<FatalHandler>>,
}

impl DisplayInner {
    /// Fire the fatal handler, at most once.
    ///
    /// The slot is emptied under the fatal lock and the handler runs
    /// with no lock held, so a handler that tears the display down (or
    /// provokes further disconnects) cannot recurse into itself.
    pub(crate) fn trigger_fatal(&self) {
        let handler = lock(&self.fatal).take();
        if let Some(handler) = handler {
            handler();
        }
    }
}

/// Wire a channel's disconnect event into the display's fatal path.
pub(crate) fn register_fatal_disconnect(
    channel: &Arc<dyn IvcChannel>,
    display: &Arc<DisplayInner>,
    label: &'static str,
) {
    let weak: Weak<DisplayInner> = Arc::downgrade(display);
    channel.register_events(ChannelEvents::new(
        None,
        Some(Arc::new(move || {
            let Some(display) = weak.upgrade() else {
                return;
            };
            let display_key = display.key;
            error!(key = display_key, channel = label, "display channel disconnected");
            display.trigger_fatal();
        })),
    ));
}

/// A guest-side display: four channels, a shared framebuffer, and the
/// cursor state, behind one lock.
///
/// Lifecycle, as seen through the control channel: the provider
/// advertises the display, the host requests it with an add-display
/// packet, [`create_display`] connects the channels, and the display
/// stays usable until either side tears it down: a remove-display
/// request, a local [`destroy`], or the fatal path on a disconnect.
/// A reconnect against a fresh add-display request keeps the aggregate
/// alive across a display-handler restart.
///
/// All methods may be called from any thread. The fatal handler must
/// not be assumed to run on any particular thread either.
///
/// [`create_display`]: crate::provider::DisplayProvider::create_display
/// [`destroy`]: ProviderDisplay::destroy
#[derive(Clone)]
pub struct ProviderDisplay {
    inner: Arc<DisplayInner>,
}

impl ProviderDisplay {
    pub(crate) fn new(key: u32, width: u32, height: u32, stride: u32) -> Self {
        Self {
            inner: Arc::new(DisplayInner {
                key,
                state: Mutex::new(DisplayState {
                    width,
                    height,
                    stride,
                    framebuffer: None,
                    framebuffer_size: 0,
                    event_channel: None,
                    framebuffer_channel: None,
                    dirty_rect_channel: None,
                    cursor_channel: None,
                    cursor: CursorState::default(),
                    driver_data: None,
                }),
                fatal: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn inner(&self) -> &Arc<DisplayInner> {
        &self.inner
    }

    /// The display's protocol key.
    pub fn key(&self) -> u32 {
        self.inner.key
    }

    /// Current `(width, height, stride)` record.
    pub fn geometry(&self) -> (u32, u32, u32) {
        let st = lock(&self.inner.state);
        (st.width, st.height, st.stride)
    }

    /// The shared framebuffer, writable by this side only.
    pub fn framebuffer(&self) -> Option<SharedView> {
        lock(&self.inner.state).framebuffer.clone()
    }

    pub fn framebuffer_size(&self) -> usize {
        lock(&self.inner.state).framebuffer_size
    }

    /// Attach opaque driver state to the display.
    pub fn set_driver_data(&self, data: DriverData) {
        lock(&self.inner.state).driver_data = Some(data);
    }

    pub fn driver_data(&self) -> Option<DriverData> {
        lock(&self.inner.state).driver_data.clone()
    }

    /// Register the one-shot handler for unrecoverable errors.
    ///
    /// Any fatal error leaves the display unusable; the handler should
    /// destroy it and, if desired, run the reconnect sequence.
    pub fn on_fatal_error(&self, handler: impl FnOnce() + Send + 'static) {
        *lock(&self.inner.fatal) = Some(Box::new(handler));
    }

    /// Update the geometry record and publish it on the event channel.
    pub fn change_resolution(&self, width: u32, height: u32, stride: u32) -> Result<()> {
        let mut st = lock(&self.inner.state);
        st.width = width;
        st.height = height;
        st.stride = stride;

        let body = SetDisplay {
            width,
            height,
            stride,
        };
        send_event(&st, PacketKind::SetDisplay, &body.to_bytes())
    }

    /// Mark a framebuffer region as needing a host redraw.
    ///
    /// When the dirty ring has room for one record but not two, the
    /// record is replaced by a full-screen rectangle: the host drains
    /// the ring lazily, and the substitution guarantees the screen
    /// converges even when individual rectangles were dropped. With no
    /// room at all the update is skipped with [`DisplayError::TryAgain`]
    /// since the full-screen record already queued behind us covers it.
    pub fn invalidate_region(&self, x: u32, y: u32, width: u32, height: u32) -> Result<()> {
        let st = lock(&self.inner.state);
        let Some(channel) = st.dirty_rect_channel.clone() else {
            return Err(DisplayError::InvalidArgument(
                "display has no dirty rectangle channel",
            ));
        };

        let available = match channel.available_space() {
            Ok(n) => n,
            Err(err) => {
                error!("could not query dirty rectangle ring space: {err}");
                drop(st);
                self.inner.trigger_fatal();
                return Err(DisplayError::Transport(err));
            }
        };

        if available < DirtyRect::SIZE {
            return Err(DisplayError::TryAgain);
        }

        let rect = if available < DirtyRect::SIZE * 2 {
            DirtyRect {
                x: 0,
                y: 0,
                width: st.width,
                height: st.height,
            }
        } else {
            DirtyRect {
                x,
                y,
                width,
                height,
            }
        };

        channel.send(&rect.to_bytes())?;
        channel.notify_remote();
        Ok(())
    }

    /// True iff a hardware cursor image buffer exists.
    pub fn supports_cursor(&self) -> bool {
        lock(&self.inner.state).cursor.image.is_some()
    }

    /// Set the cursor hot spot and publish the cursor update.
    pub fn set_cursor_hotspot(&self, hotspot_x: u32, hotspot_y: u32) -> Result<()> {
        if hotspot_x > CURSOR_WIDTH || hotspot_y > CURSOR_HEIGHT {
            return Err(DisplayError::InvalidArgument(
                "cursor hot spot outside the 64x64 image",
            ));
        }
        let mut st = lock(&self.inner.state);
        require_cursor(&st)?;
        st.cursor.hotspot_x = hotspot_x;
        st.cursor.hotspot_y = hotspot_y;
        send_cursor_update(&st)
    }

    /// Show or hide the cursor.
    pub fn set_cursor_visibility(&self, visible: bool) -> Result<()> {
        let mut st = lock(&self.inner.state);
        require_cursor(&st)?;
        st.cursor.visible = visible;
        send_cursor_update(&st)
    }

    /// Publish a cursor movement on the event channel.
    pub fn move_cursor(&self, x: u32, y: u32) -> Result<()> {
        let st = lock(&self.inner.state);
        require_cursor(&st)?;
        let body = MoveCursor { x, y };
        send_event(&st, PacketKind::MoveCursor, &body.to_bytes())
    }

    /// Blit an ARGB image into the shared cursor buffer and publish the
    /// update.
    ///
    /// The destination is always 64 rows of 256 bytes; source rows are
    /// padded with transparent pixels and rows past `src_height` are
    /// cleared entirely.
    pub fn load_cursor_image(&self, image: &[u8], src_width: u32, src_height: u32) -> Result<()> {
        if src_width > CURSOR_WIDTH || src_height > CURSOR_HEIGHT {
            return Err(DisplayError::InvalidArgument(
                "cursor image larger than 64x64",
            ));
        }
        let src_stride = src_width as usize * 4;
        if image.len() < src_stride * src_height as usize {
            return Err(DisplayError::InvalidArgument(
                "cursor image buffer shorter than its dimensions",
            ));
        }

        let st = lock(&self.inner.state);
        let Some(view) = st.cursor.image.clone() else {
            return Err(DisplayError::InvalidArgument(
                "display has no cursor image buffer",
            ));
        };

        view.with_mut(|dst| {
            for row in 0..CURSOR_HEIGHT as usize {
                let dst_row = &mut dst[row * CURSOR_STRIDE..(row + 1) * CURSOR_STRIDE];
                if row < src_height as usize {
                    let src_row = &image[row * src_stride..row * src_stride + src_stride];
                    dst_row[..src_stride].copy_from_slice(src_row);
                    dst_row[src_stride..].fill(0);
                } else {
                    dst_row.fill(0);
                }
            }
        });

        send_cursor_update(&st)
    }

    /// Tell the host to blank or restore the display.
    ///
    /// `dpms` selects between a power-management sleep/wake pair and a
    /// modesetting fill/unfill pair; `blank` selects which half.
    pub fn blank_display(&self, dpms: bool, blank: bool) -> Result<()> {
        let reason = match (dpms, blank) {
            (true, true) => BlankingReason::DpmsSleep,
            (true, false) => BlankingReason::DpmsWake,
            (false, true) => BlankingReason::FillEnable,
            (false, false) => BlankingReason::FillDisable,
        };
        let body = Blanking::new(0, reason);

        let st = lock(&self.inner.state);
        send_event(&st, PacketKind::BlankDisplay, &body.to_bytes())
    }

    /// Re-establish the display's connections against a fresh
    /// add-display request, after a display-handler restart.
    ///
    /// The framebuffer and event channels are required; failing to
    /// reconnect the optional dirty-rectangle or cursor channels is
    /// only warned about.
    pub fn reconnect(&self, request: &AddDisplayRequest, rx_domain: DomainId) -> Result<()> {
        let st = lock(&self.inner.state);
        let (Some(framebuffer), Some(event)) =
            (st.framebuffer_channel.clone(), st.event_channel.clone())
        else {
            return Err(DisplayError::InvalidArgument(
                "display has no existing framebuffer and event connections",
            ));
        };
        if request.framebuffer_port == 0 || request.event_port == 0 {
            return Err(DisplayError::InvalidArgument(
                "add-display request is missing a required port",
            ));
        }

        framebuffer.reconnect(rx_domain, request.framebuffer_port as Port)?;
        event.reconnect(rx_domain, request.event_port as Port)?;

        if request.dirty_rectangles_port != 0 {
            if let Some(dirty) = st.dirty_rect_channel.clone() {
                if let Err(err) =
                    dirty.reconnect(rx_domain, request.dirty_rectangles_port as Port)
                {
                    warn!(key = self.inner.key, "could not reconnect dirty rectangle channel: {err}");
                }
            }
        }
        if request.cursor_bitmap_port != 0 {
            if let Some(cursor) = st.cursor_channel.clone() {
                if let Err(err) = cursor.reconnect(rx_domain, request.cursor_bitmap_port as Port) {
                    warn!(key = self.inner.key, "could not reconnect cursor image channel: {err}");
                }
            }
        }
        Ok(())
    }

    /// Disconnect every channel the display owns and drop its buffers.
    pub fn destroy(&self) {
        let mut st = lock(&self.inner.state);
        for channel in [
            st.event_channel.take(),
            st.framebuffer_channel.take(),
            st.dirty_rect_channel.take(),
            st.cursor_channel.take(),
        ]
        .into_iter()
        .flatten()
        {
            channel.disconnect();
        }
        st.framebuffer = None;
        st.framebuffer_size = 0;
        st.cursor.image = None;
    }
}

fn require_cursor(st: &DisplayState) -> Result<()> {
    if st.cursor.image.is_none() || st.cursor_channel.is_none() {
        return Err(DisplayError::InvalidArgument(
            "display has no hardware cursor connection",
        ));
    }
    Ok(())
}

fn send_event(st: &DisplayState, kind: PacketKind, payload: &[u8]) -> Result<()> {
    let Some(event) = st.event_channel.as_ref() else {
        return Err(DisplayError::InvalidArgument(
            "display has no event connection",
        ));
    };
    send_packet(event.as_ref(), kind, payload)?;
    Ok(())
}

fn send_cursor_update(st: &DisplayState) -> Result<()> {
    let body = UpdateCursor {
        xhot: st.cursor.hotspot_x,
        yhot: st.cursor.hotspot_y,
        show: if st.cursor.visible {
            CURSOR_SHOW
        } else {
            CURSOR_HIDE
        },
    };
    send_event(st, PacketKind::UpdateCursor, &body.to_bytes())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use pvdisplay_ivc::{EventQueue, LoopbackChannel, SharedView};
    use pvdisplay_wire::{decode_packet, Footer, Header};

    use super::*;

    fn test_view(len: usize) -> SharedView {
        // The view keeps the shared allocation alive on its own.
        let (channel, _peer) = LoopbackChannel::pair(&EventQueue::new(), len);
        channel.local_buffer().unwrap()
    }

    /// A display with event + dirty + cursor channels over loopback
    /// pairs, returning the consumer-side ends for inspection.
    fn display_with_channels(
        dirty_capacity: usize,
    ) -> (
        ProviderDisplay,
        Arc<LoopbackChannel>,
        Arc<LoopbackChannel>,
    ) {
        let queue = EventQueue::new();
        let (event_tx, event_rx) = LoopbackChannel::pair(&queue, 4 * 4096);
        let (dirty_tx, dirty_rx) = LoopbackChannel::pair(&queue, dirty_capacity);

        let display = ProviderDisplay::new(7, 1920, 1080, 7680);
        {
            let mut st = lock(&display.inner.state);
            st.event_channel = Some(event_tx);
            st.dirty_rect_channel = Some(dirty_tx);
            let (cursor_tx, _cursor_rx) = LoopbackChannel::pair(&queue, 4096);
            st.cursor_channel = Some(cursor_tx as Arc<dyn IvcChannel>);
            st.cursor.image = Some(test_view(pvdisplay_wire::CURSOR_IMAGE_SIZE + 1024));
        }
        (display, event_rx, dirty_rx)
    }

    fn recv_event_packet(rx: &LoopbackChannel) -> (Header, Vec<u8>) {
        let mut header_raw = [0u8; Header::SIZE];
        rx.recv(&mut header_raw).unwrap();
        let header = Header::from_bytes(&header_raw).unwrap();
        let mut rest = vec![0u8; header.length as usize + Footer::SIZE];
        rx.recv(&mut rest).unwrap();

        let mut packet = header_raw.to_vec();
        packet.extend_from_slice(&rest);
        let (header, payload) = decode_packet(&packet).unwrap();
        (header, payload.to_vec())
    }

    #[test]
    fn change_resolution_updates_state_and_publishes() {
        let (display, event_rx, _dirty) = display_with_channels(512);

        display.change_resolution(1280, 720, 5120).unwrap();
        assert_eq!(display.geometry(), (1280, 720, 5120));

        let (header, payload) = recv_event_packet(&event_rx);
        assert_eq!(header.kind(), PacketKind::SetDisplay);
        let body = SetDisplay::from_bytes(&payload).unwrap();
        assert_eq!((body.width, body.height, body.stride), (1280, 720, 5120));
    }

    #[test]
    fn repeated_change_resolution_is_idempotent_on_the_wire() {
        let (display, event_rx, _dirty) = display_with_channels(512);

        display.change_resolution(800, 600, 3200).unwrap();
        display.change_resolution(800, 600, 3200).unwrap();

        let first = recv_event_packet(&event_rx);
        let second = recv_event_packet(&event_rx);
        assert_eq!(first, second);
        assert_eq!(display.geometry(), (800, 600, 3200));
    }

    #[test]
    fn invalidate_region_passes_rectangles_through() {
        let (display, _event, dirty_rx) = display_with_channels(512);

        display.invalidate_region(10, 20, 100, 50).unwrap();

        let mut raw = [0u8; DirtyRect::SIZE];
        dirty_rx.recv(&mut raw).unwrap();
        let rect = DirtyRect::from_bytes(&raw).unwrap();
        assert_eq!(
            rect,
            DirtyRect {
                x: 10,
                y: 20,
                width: 100,
                height: 50
            }
        );
    }

    #[test]
    fn invalidate_region_overflow_becomes_full_screen() {
        // 512-byte ring: 31 pending records leave exactly one slot.
        let (display, _event, dirty_rx) = display_with_channels(512);
        for i in 0..31 {
            display.invalidate_region(i, i, 1, 1).unwrap();
        }

        display.invalidate_region(10, 10, 100, 100).unwrap();

        let mut raw = [0u8; DirtyRect::SIZE];
        for _ in 0..31 {
            dirty_rx.recv(&mut raw).unwrap();
        }
        dirty_rx.recv(&mut raw).unwrap();
        let last = DirtyRect::from_bytes(&raw).unwrap();
        assert_eq!(
            last,
            DirtyRect {
                x: 0,
                y: 0,
                width: 1920,
                height: 1080
            }
        );
    }

    #[test]
    fn invalidate_region_with_full_ring_is_try_again() {
        let (display, _event, _dirty_rx) = display_with_channels(512);
        for i in 0..32 {
            display.invalidate_region(i, i, 1, 1).unwrap();
        }

        let err = display.invalidate_region(0, 0, 1, 1).unwrap_err();
        assert!(matches!(err, DisplayError::TryAgain));
    }

    #[test]
    fn invalidate_region_without_channel_rejected() {
        let display = ProviderDisplay::new(1, 640, 480, 2560);
        let err = display.invalidate_region(0, 0, 1, 1).unwrap_err();
        assert!(matches!(err, DisplayError::InvalidArgument(_)));
    }

    #[test]
    fn cursor_blit_pads_rows_and_clears_tail() {
        let (display, event_rx, _dirty) = display_with_channels(512);

        let src_w = 32usize;
        let src_h = 16usize;
        let image = vec![0xAAu8; src_w * 4 * src_h];
        display.load_cursor_image(&image, src_w as u32, src_h as u32).unwrap();

        let view = lock(&display.inner.state).cursor.image.clone().unwrap();
        let contents = view.to_vec();
        for row in 0..CURSOR_HEIGHT as usize {
            let row_bytes = &contents[row * CURSOR_STRIDE..(row + 1) * CURSOR_STRIDE];
            if row < src_h {
                assert!(row_bytes[..src_w * 4].iter().all(|&b| b == 0xAA), "row {row}");
                assert!(row_bytes[src_w * 4..].iter().all(|&b| b == 0), "row {row} pad");
            } else {
                assert!(row_bytes.iter().all(|&b| b == 0), "row {row} tail");
            }
        }

        let (header, _) = recv_event_packet(&event_rx);
        assert_eq!(header.kind(), PacketKind::UpdateCursor);
    }

    #[test]
    fn oversized_cursor_image_rejected() {
        let (display, _event, _dirty) = display_with_channels(512);
        let image = vec![0u8; 65 * 65 * 4];
        let err = display.load_cursor_image(&image, 65, 64).unwrap_err();
        assert!(matches!(err, DisplayError::InvalidArgument(_)));
    }

    #[test]
    fn short_cursor_buffer_rejected() {
        let (display, _event, _dirty) = display_with_channels(512);
        let err = display.load_cursor_image(&[0u8; 16], 8, 8).unwrap_err();
        assert!(matches!(err, DisplayError::InvalidArgument(_)));
    }

    #[test]
    fn hotspot_bounds_enforced() {
        let (display, event_rx, _dirty) = display_with_channels(512);

        assert!(matches!(
            display.set_cursor_hotspot(65, 0).unwrap_err(),
            DisplayError::InvalidArgument(_)
        ));

        display.set_cursor_hotspot(64, 64).unwrap();
        let (header, payload) = recv_event_packet(&event_rx);
        assert_eq!(header.kind(), PacketKind::UpdateCursor);
        let body = UpdateCursor::from_bytes(&payload).unwrap();
        assert_eq!((body.xhot, body.yhot), (64, 64));
        assert_eq!(body.show, CURSOR_HIDE);
    }

    #[test]
    fn visibility_travels_in_cursor_updates() {
        let (display, event_rx, _dirty) = display_with_channels(512);

        display.set_cursor_visibility(true).unwrap();
        let (_, payload) = recv_event_packet(&event_rx);
        assert_eq!(UpdateCursor::from_bytes(&payload).unwrap().show, CURSOR_SHOW);

        display.set_cursor_visibility(false).unwrap();
        let (_, payload) = recv_event_packet(&event_rx);
        assert_eq!(UpdateCursor::from_bytes(&payload).unwrap().show, CURSOR_HIDE);
    }

    #[test]
    fn blanking_reason_table() {
        let (display, event_rx, _dirty) = display_with_channels(512);

        let cases = [
            (true, true, BlankingReason::DpmsSleep),
            (true, false, BlankingReason::DpmsWake),
            (false, true, BlankingReason::FillEnable),
            (false, false, BlankingReason::FillDisable),
        ];
        for (dpms, blank, expected) in cases {
            display.blank_display(dpms, blank).unwrap();
            let (header, payload) = recv_event_packet(&event_rx);
            assert_eq!(header.kind(), PacketKind::BlankDisplay);
            let body = Blanking::from_bytes(&payload).unwrap();
            assert_eq!(body.reason(), Some(expected), "dpms={dpms} blank={blank}");
            assert_eq!(body.color, 0);
        }
    }

    #[test]
    fn move_cursor_publishes_event() {
        let (display, event_rx, _dirty) = display_with_channels(512);

        display.move_cursor(321, 123).unwrap();
        let (header, payload) = recv_event_packet(&event_rx);
        assert_eq!(header.kind(), PacketKind::MoveCursor);
        let body = MoveCursor::from_bytes(&payload).unwrap();
        assert_eq!((body.x, body.y), (321, 123));
    }

    #[test]
    fn destroy_disconnects_all_channels() {
        let (display, event_rx, dirty_rx) = display_with_channels(512);

        display.destroy();
        assert!(!event_rx.is_open());
        assert!(!dirty_rx.is_open());
        assert!(display.framebuffer().is_none());
        assert!(!display.supports_cursor());
    }

    #[test]
    fn fatal_handler_fires_once_across_many_disconnects() {
        let queue = EventQueue::new();
        let (event_tx, event_rx) = LoopbackChannel::pair(&queue, 4096);
        let (fb_tx, fb_rx) = LoopbackChannel::pair(&queue, 4096);

        let display = ProviderDisplay::new(3, 640, 480, 2560);
        {
            let mut st = lock(&display.inner.state);
            st.event_channel = Some(event_tx.clone());
            st.framebuffer_channel = Some(fb_tx.clone());
        }
        register_fatal_disconnect(
            &(event_tx as Arc<dyn IvcChannel>),
            display.inner(),
            "event",
        );
        register_fatal_disconnect(
            &(fb_tx as Arc<dyn IvcChannel>),
            display.inner(),
            "framebuffer",
        );

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        display.on_fatal_error(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        event_rx.disconnect();
        fb_rx.disconnect();
        queue.pump();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn driver_data_roundtrip() {
        let display = ProviderDisplay::new(1, 1, 1, 4);
        assert!(display.driver_data().is_none());
        display.set_driver_data(Arc::new(42u32));
        let data = display.driver_data().unwrap();
        assert_eq!(data.downcast_ref::<u32>(), Some(&42));
    }
}
