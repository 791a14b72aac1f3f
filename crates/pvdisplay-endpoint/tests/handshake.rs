//! End-to-end protocol exercises over the loopback transport.
//!
//! Both endpoints run in-process; `ivc.pump()` plays the role of the
//! transport's delivery threads. Handlers respond by calling straight
//! back into endpoint operations, exactly as a real driver and display
//! handler do.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use pvdisplay_endpoint::{DisplayConsumer, DisplayProvider, ProviderDisplay};
use pvdisplay_ivc::{Ivc, IvcChannel, LoopbackIvc, CONNECTION_ID_ANY};
use pvdisplay_wire::{
    encode_packet, AddDisplayRequest, DisplayInfo, Header, PacketKind, SetDisplay,
    PROTOCOL_VERSION,
};

const GUEST_DOMAIN: u16 = 7;
const CONTROL_PORT: u16 = 1000;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Everything the host-side test harness records while reacting to the
/// guest.
#[derive(Default)]
struct HostLog {
    capabilities: Vec<(u32, u32)>,
    advertised: Vec<u32>,
    set_displays: Vec<(u32, u32, u32)>,
    dirty_rects: Vec<(u32, u32, u32, u32)>,
    cursor_updates: Vec<(u32, u32, u32)>,
    cursor_moves: Vec<(u32, u32)>,
    gone_keys: Vec<u32>,
    text_modes: Vec<bool>,
}

struct Host {
    consumer: DisplayConsumer,
    backend: pvdisplay_endpoint::DisplayBackend,
    log: Arc<Mutex<HostLog>>,
}

/// Stand up a consumer that mimics the display handler's reactionary
/// state machine: capabilities → display list, advertisement →
/// add-display, and a backend that adopts all four channel
/// connections.
fn start_host(ivc: &Arc<LoopbackIvc>) -> Host {
    let consumer = DisplayConsumer::new(ivc.clone(), GUEST_DOMAIN, CONTROL_PORT);
    let log: Arc<Mutex<HostLog>> = Arc::default();

    let adopt = consumer.clone();
    consumer.on_new_control_connection(move |channel| {
        adopt.finish_control_connection(channel);
    });

    let backend = consumer.create_display_backend(GUEST_DOMAIN, 1100, 1101, 1102, 1103, None);
    for_all_channels(&backend);
    wire_backend_log(&backend, &log);

    // Capabilities trigger the host display list.
    let respond = consumer.clone();
    let capture = log.clone();
    consumer.on_driver_capabilities(move |caps| {
        lock(&capture).capabilities.push((caps.max_displays, caps.version));
        respond
            .send_display_list(&[
                DisplayInfo {
                    key: 1,
                    width: 1920,
                    height: 1080,
                    ..Default::default()
                },
                DisplayInfo {
                    key: 2,
                    width: 1280,
                    height: 720,
                    ..Default::default()
                },
            ])
            .unwrap();
    });

    // The guest's advertisement triggers one add-display per entry the
    // host still cares about (just key 1 here).
    let respond = consumer.clone();
    let capture = log.clone();
    consumer.on_advertised_display_list(move |displays| {
        let mut log = lock(&capture);
        for display in displays {
            log.advertised.push(display.key);
        }
        drop(log);
        respond.add_display(1, 1100, 1101, 1102, 1103).unwrap();
    });

    let capture = log.clone();
    consumer.on_display_no_longer_available(move |key| {
        lock(&capture).gone_keys.push(key);
    });

    let capture = log.clone();
    consumer.on_text_mode(move |force| {
        lock(&capture).text_modes.push(force);
    });

    consumer.start_server().unwrap();
    Host {
        consumer,
        backend,
        log,
    }
}

fn for_all_channels(backend: &pvdisplay_endpoint::DisplayBackend) {
    let adopt = backend.clone();
    backend.on_new_event_connection(move |channel| adopt.finish_event_connection(channel));
    let adopt = backend.clone();
    backend
        .on_new_framebuffer_connection(move |channel| adopt.finish_framebuffer_connection(channel));
    let adopt = backend.clone();
    backend
        .on_new_dirty_rect_connection(move |channel| adopt.finish_dirty_rect_connection(channel));
    let adopt = backend.clone();
    backend.on_new_cursor_connection(move |channel| adopt.finish_cursor_connection(channel));
}

fn wire_backend_log(backend: &pvdisplay_endpoint::DisplayBackend, log: &Arc<Mutex<HostLog>>) {
    let capture = log.clone();
    backend.on_set_display(move |w, h, s| lock(&capture).set_displays.push((w, h, s)));
    let capture = log.clone();
    backend.on_dirty_rectangle(move |x, y, w, h| lock(&capture).dirty_rects.push((x, y, w, h)));
    let capture = log.clone();
    backend.on_update_cursor(move |xh, yh, show| lock(&capture).cursor_updates.push((xh, yh, show)));
    let capture = log.clone();
    backend.on_move_cursor(move |x, y| lock(&capture).cursor_moves.push((x, y)));
    backend.start_servers().unwrap();
}

struct Guest {
    provider: DisplayProvider,
    displays: Arc<Mutex<Vec<ProviderDisplay>>>,
    removed_keys: Arc<Mutex<Vec<u32>>>,
}

/// Stand up a provider that walks the initialization sequence: it
/// advertises every host display and answers each add-display request
/// by creating the display and publishing its mode.
fn start_guest(ivc: &Arc<LoopbackIvc>) -> Guest {
    let provider = DisplayProvider::connect(ivc.clone(), 0, CONTROL_PORT).unwrap();
    let displays: Arc<Mutex<Vec<ProviderDisplay>>> = Arc::default();

    let respond = provider.clone();
    provider.on_host_display_change(move |hosts| {
        respond.advertise_displays(hosts).unwrap();
    });

    let respond = provider.clone();
    let created = displays.clone();
    provider.on_add_display(move |request| {
        let display = respond
            .create_display(request, 1920, 1080, 1920 * 4, None)
            .unwrap();
        display.change_resolution(1920, 1080, 1920 * 4).unwrap();
        lock(&created).push(display);
    });

    let removed_keys: Arc<Mutex<Vec<u32>>> = Arc::default();
    let removed = removed_keys.clone();
    provider.on_remove_display(move |request| {
        lock(&removed).push(request.key);
    });

    Guest {
        provider,
        displays,
        removed_keys,
    }
}

#[test]
fn full_initialization_sequence() {
    let ivc = LoopbackIvc::new();
    let host = start_host(&ivc);
    let guest = start_guest(&ivc);
    ivc.pump();

    // Step one of the handshake; everything else cascades through the
    // registered handlers.
    guest.provider.advertise_capabilities(4).unwrap();
    ivc.pump();

    let log = lock(&host.log);
    assert_eq!(log.capabilities.as_slice(), &[(4, PROTOCOL_VERSION)]);
    assert_eq!(log.advertised.as_slice(), &[1, 2]);
    assert_eq!(log.set_displays.as_slice(), &[(1920, 1080, 1920 * 4)]);
    drop(log);

    let displays = lock(&guest.displays);
    assert_eq!(displays.len(), 1);
    let display = &displays[0];
    assert_eq!(display.key(), 1);
    assert!(display.framebuffer().is_some());
    assert!(display.supports_cursor());

    // Both ends now see the same framebuffer bytes.
    let provider_view = display.framebuffer().unwrap();
    provider_view.write_at(4096, &[0xAB, 0xCD]).unwrap();
    let host_view = host.backend.framebuffer().unwrap();
    let mut bytes = [0u8; 2];
    host_view.read_at(4096, &mut bytes).unwrap();
    assert_eq!(bytes, [0xAB, 0xCD]);
}

#[test]
fn dirty_rectangles_and_cursor_traffic_flow() {
    let ivc = LoopbackIvc::new();
    let host = start_host(&ivc);
    let guest = start_guest(&ivc);
    guest.provider.advertise_capabilities(4).unwrap();
    ivc.pump();

    let displays = lock(&guest.displays);
    let display = displays[0].clone();
    drop(displays);

    display.invalidate_region(10, 20, 300, 200).unwrap();
    display.load_cursor_image(&[0xFF; 64 * 4 * 64], 64, 64).unwrap();
    display.set_cursor_visibility(true).unwrap();
    display.move_cursor(640, 400).unwrap();
    ivc.pump();

    let log = lock(&host.log);
    assert_eq!(log.dirty_rects.as_slice(), &[(10, 20, 300, 200)]);
    assert_eq!(log.cursor_moves.as_slice(), &[(640, 400)]);
    // One update from the image load, one from the visibility change.
    assert_eq!(log.cursor_updates.len(), 2);
    assert_eq!(log.cursor_updates[1], (0, 0, 1));
    drop(log);

    // The blitted cursor image is visible through the host's view.
    let cursor = host.backend.cursor_image().unwrap();
    let mut pixel = [0u8; 4];
    cursor.read_at(0, &mut pixel).unwrap();
    assert_eq!(pixel, [0xFF; 4]);
}

#[test]
fn graceful_teardown_notifies_and_disconnects() {
    let ivc = LoopbackIvc::new();
    let host = start_host(&ivc);
    let guest = start_guest(&ivc);
    guest.provider.advertise_capabilities(4).unwrap();
    ivc.pump();

    let backend_fatal = Arc::new(AtomicUsize::new(0));
    let fired = backend_fatal.clone();
    host.backend.on_fatal_error(move || {
        fired.fetch_add(1, Ordering::SeqCst);
    });

    let display = lock(&guest.displays)[0].clone();
    guest.provider.destroy_display(&display).unwrap();
    ivc.pump();

    let log = lock(&host.log);
    assert_eq!(log.gone_keys.as_slice(), &[1]);
    drop(log);

    // The channel disconnects surface on the host as the aggregate's
    // single fatal notification.
    assert_eq!(backend_fatal.load(Ordering::SeqCst), 1);
    assert!(display.framebuffer().is_none());

    host.consumer.destroy_display(&host.backend);
    host.consumer.destroy();
    guest.provider.destroy();
}

#[test]
fn corrupt_event_packet_never_reaches_handlers() {
    let ivc = LoopbackIvc::new();
    let host = start_host(&ivc);
    let guest = start_guest(&ivc);
    guest.provider.advertise_capabilities(4).unwrap();
    ivc.pump();

    let fatal = Arc::new(AtomicUsize::new(0));
    let fired = fatal.clone();
    host.backend.on_fatal_error(move || {
        fired.fetch_add(1, Ordering::SeqCst);
    });

    // Reach under the provider display and send a corrupted
    // SET_DISPLAY straight down the event channel.
    let event_channel = event_channel_of(&ivc, &host);
    let body = SetDisplay {
        width: 1024,
        height: 768,
        stride: 4096,
    };
    let mut packet = encode_packet(PacketKind::SetDisplay, &body.to_bytes()).unwrap();
    packet[Header::SIZE + 1] ^= 0x08;
    event_channel.send(&packet).unwrap();
    event_channel.notify_remote();
    ivc.pump();

    let log = lock(&host.log);
    // Only the handshake's original SET_DISPLAY was delivered.
    assert_eq!(log.set_displays.len(), 1);
    drop(log);
    assert_eq!(fatal.load(Ordering::SeqCst), 1);
}

/// A fresh guest-side connection to the backend's event port, used to
/// inject raw bytes.
fn event_channel_of(ivc: &Arc<LoopbackIvc>, _host: &Host) -> Arc<dyn IvcChannel> {
    let channel = ivc.connect(0, 1100, 4, CONNECTION_ID_ANY).unwrap();
    ivc.pump();
    channel
}

#[test]
fn split_packet_delivery_dispatches_once() {
    let ivc = LoopbackIvc::new();
    let host = start_host(&ivc);
    let guest = start_guest(&ivc);
    guest.provider.advertise_capabilities(4).unwrap();
    ivc.pump();

    let channel = event_channel_of(&ivc, &host);
    let body = SetDisplay {
        width: 800,
        height: 600,
        stride: 3200,
    };
    let packet = encode_packet(PacketKind::SetDisplay, &body.to_bytes()).unwrap();

    // Drip the packet in three fragments with a notify after each.
    for chunk in [&packet[..7], &packet[7..20], &packet[20..]] {
        channel.send(chunk).unwrap();
        channel.notify_remote();
        ivc.pump();
    }

    let log = lock(&host.log);
    assert_eq!(log.set_displays.len(), 2);
    assert_eq!(log.set_displays[1], (800, 600, 3200));
}

#[test]
fn text_mode_and_remove_display_cross_the_control_channel() {
    let ivc = LoopbackIvc::new();
    let host = start_host(&ivc);
    let guest = start_guest(&ivc);
    guest.provider.advertise_capabilities(4).unwrap();
    ivc.pump();

    guest.provider.force_text_mode(true).unwrap();
    guest.provider.force_text_mode(false).unwrap();
    host.consumer.remove_display(1).unwrap();
    ivc.pump();

    assert_eq!(lock(&host.log).text_modes.as_slice(), &[true, false]);
    assert_eq!(lock(&guest.removed_keys).as_slice(), &[1]);
}

#[test]
fn reconnect_rebinds_required_channels() {
    let ivc = LoopbackIvc::new();
    let host = start_host(&ivc);
    let guest = start_guest(&ivc);
    guest.provider.advertise_capabilities(4).unwrap();
    ivc.pump();

    let display = lock(&guest.displays)[0].clone();
    let request = AddDisplayRequest {
        key: 1,
        event_port: 1100,
        framebuffer_port: 1101,
        dirty_rectangles_port: 1102,
        cursor_bitmap_port: 1103,
    };
    display.reconnect(&request, 0).unwrap();
    ivc.pump();

    // The reconnected event channel still carries packets end to end.
    display.change_resolution(1600, 900, 1600 * 4).unwrap();
    ivc.pump();
    let log = lock(&host.log);
    assert_eq!(log.set_displays.last(), Some(&(1600, 900, 1600 * 4)));
}

#[test]
fn reconnect_requires_existing_connections_and_ports() {
    let ivc = LoopbackIvc::new();
    let host = start_host(&ivc);
    let guest = start_guest(&ivc);
    guest.provider.advertise_capabilities(4).unwrap();
    ivc.pump();
    drop(host);

    let display = lock(&guest.displays)[0].clone();
    let request = AddDisplayRequest {
        key: 1,
        event_port: 0,
        framebuffer_port: 1101,
        dirty_rectangles_port: 0,
        cursor_bitmap_port: 0,
    };
    assert!(display.reconnect(&request, 0).is_err());
}

#[test]
fn add_display_request_round_trips_through_control() {
    let ivc = LoopbackIvc::new();
    let _host = start_host(&ivc);

    let provider = DisplayProvider::connect(ivc.clone(), 0, CONTROL_PORT).unwrap();
    let seen: Arc<Mutex<Vec<AddDisplayRequest>>> = Arc::default();
    let slot = seen.clone();
    provider.on_add_display(move |request| {
        lock(&slot).push(*request);
    });
    provider.on_host_display_change({
        let respond = provider.clone();
        move |hosts| respond.advertise_displays(hosts).unwrap()
    });

    provider.advertise_capabilities(2).unwrap();
    ivc.pump();

    let seen = lock(&seen);
    assert_eq!(seen.len(), 1);
    assert_eq!(
        seen[0],
        AddDisplayRequest {
            key: 1,
            event_port: 1100,
            framebuffer_port: 1101,
            dirty_rectangles_port: 1102,
            cursor_bitmap_port: 1103,
        }
    );
}
