//! Run both protocol endpoints in-process and print the handshake
//! transcript.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use clap::Args;
use pvdisplay_endpoint::{DisplayConsumer, DisplayProvider, ProviderDisplay};
use pvdisplay_ivc::LoopbackIvc;
use pvdisplay_wire::DisplayInfo;
use tracing::info;

use crate::exit::{display_error, CliResult};
use crate::output::{print_demo_events, DemoEvent, OutputFormat};

const GUEST_DOMAIN: u16 = 7;
const CONTROL_PORT: u16 = 1000;
const EVENT_PORT: u32 = 1100;
const FRAMEBUFFER_PORT: u32 = 1101;
const DIRTY_RECT_PORT: u32 = 1102;
const CURSOR_PORT: u32 = 1103;

#[derive(Args, Debug)]
pub struct DemoArgs {
    /// Host display width.
    #[arg(long, default_value_t = 1280)]
    pub width: u32,

    /// Host display height.
    #[arg(long, default_value_t = 720)]
    pub height: u32,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type Transcript = Arc<Mutex<Vec<DemoEvent>>>;

fn record(transcript: &Transcript, actor: &'static str, event: &'static str, detail: String) {
    lock(transcript).push(DemoEvent::new(actor, event, detail));
}

pub fn run(args: DemoArgs, format: OutputFormat) -> CliResult<i32> {
    let ivc = LoopbackIvc::new();
    let transcript: Transcript = Arc::default();
    let stride = args.width * 4;

    // Host side: a consumer that reacts the way the display handler
    // does, plus a backend that adopts all four per-display channels.
    let consumer = DisplayConsumer::new(ivc.clone(), GUEST_DOMAIN, CONTROL_PORT);
    let backend = consumer.create_display_backend(
        GUEST_DOMAIN,
        EVENT_PORT,
        FRAMEBUFFER_PORT,
        DIRTY_RECT_PORT,
        CURSOR_PORT,
        None,
    );

    let adopt = consumer.clone();
    consumer.on_new_control_connection(move |channel| adopt.finish_control_connection(channel));
    let adopt = backend.clone();
    backend.on_new_event_connection(move |channel| adopt.finish_event_connection(channel));
    let adopt = backend.clone();
    backend.on_new_framebuffer_connection(move |channel| {
        adopt.finish_framebuffer_connection(channel)
    });
    let adopt = backend.clone();
    backend.on_new_dirty_rect_connection(move |channel| {
        adopt.finish_dirty_rect_connection(channel)
    });
    let adopt = backend.clone();
    backend.on_new_cursor_connection(move |channel| adopt.finish_cursor_connection(channel));

    let log = transcript.clone();
    let respond = consumer.clone();
    let host_displays = [DisplayInfo {
        key: 1,
        width: args.width,
        height: args.height,
        ..Default::default()
    }];
    consumer.on_driver_capabilities(move |caps| {
        record(
            &log,
            "consumer",
            "DRIVER_CAPABILITIES",
            format!("max_displays={} version={:#x}", caps.max_displays, caps.version),
        );
        let _ = respond.send_display_list(&host_displays);
    });

    let log = transcript.clone();
    let respond = consumer.clone();
    consumer.on_advertised_display_list(move |displays| {
        let keys: Vec<u32> = displays.iter().map(|d| d.key).collect();
        record(&log, "consumer", "ADVERTISED_DISPLAY_LIST", format!("keys={keys:?}"));
        let _ = respond.add_display(1, EVENT_PORT, FRAMEBUFFER_PORT, DIRTY_RECT_PORT, CURSOR_PORT);
    });

    let log = transcript.clone();
    consumer.on_display_no_longer_available(move |key| {
        record(&log, "consumer", "DISPLAY_NO_LONGER_AVAILABLE", format!("key={key}"));
    });

    let log = transcript.clone();
    backend.on_set_display(move |w, h, s| {
        record(&log, "consumer", "SET_DISPLAY", format!("{w}x{h} stride={s}"));
    });
    let log = transcript.clone();
    backend.on_dirty_rectangle(move |x, y, w, h| {
        record(&log, "consumer", "DIRTY_RECT", format!("({x},{y}) {w}x{h}"));
    });
    let log = transcript.clone();
    backend.on_update_cursor(move |xhot, yhot, show| {
        record(&log, "consumer", "UPDATE_CURSOR", format!("hotspot=({xhot},{yhot}) show={show}"));
    });
    let log = transcript.clone();
    backend.on_move_cursor(move |x, y| {
        record(&log, "consumer", "MOVE_CURSOR", format!("({x},{y})"));
    });
    let log = transcript.clone();
    backend.on_blank_display(move |reason| {
        record(&log, "consumer", "BLANK_DISPLAY", format!("reason={reason}"));
    });

    backend
        .start_servers()
        .map_err(|err| display_error("starting display backend servers", err))?;
    consumer
        .start_server()
        .map_err(|err| display_error("starting consumer control server", err))?;

    // Guest side: a provider that walks the initialization sequence.
    let provider = DisplayProvider::connect(ivc.clone(), 0, CONTROL_PORT)
        .map_err(|err| display_error("connecting provider control channel", err))?;

    let log = transcript.clone();
    let respond = provider.clone();
    provider.on_host_display_change(move |displays| {
        record(&log, "provider", "HOST_DISPLAY_LIST", format!("{} display(s)", displays.len()));
        let _ = respond.advertise_displays(displays);
    });

    let displays: Arc<Mutex<Vec<ProviderDisplay>>> = Arc::default();
    let log = transcript.clone();
    let respond = provider.clone();
    let created = displays.clone();
    let (width, height) = (args.width, args.height);
    provider.on_add_display(move |request| {
        record(
            &log,
            "provider",
            "ADD_DISPLAY",
            format!(
                "key={} ports=[{}, {}, {}, {}]",
                request.key,
                request.event_port,
                request.framebuffer_port,
                request.dirty_rectangles_port,
                request.cursor_bitmap_port
            ),
        );
        if let Ok(display) = respond.create_display(request, width, height, width * 4, None) {
            let _ = display.change_resolution(width, height, width * 4);
            lock(&created).push(display);
        }
    });

    record(&transcript, "provider", "CONNECT", format!("control port {CONTROL_PORT}"));
    provider
        .advertise_capabilities(4)
        .map_err(|err| display_error("advertising capabilities", err))?;
    ivc.pump();

    // Drive some steady-state traffic through the established display.
    let display = lock(&displays).first().cloned();
    if let Some(display) = display {
        display
            .invalidate_region(0, 0, args.width, args.height)
            .map_err(|err| display_error("invalidating framebuffer region", err))?;
        let cursor = vec![0xFFu8; 64 * 64 * 4];
        display
            .load_cursor_image(&cursor, 64, 64)
            .map_err(|err| display_error("loading cursor image", err))?;
        display
            .move_cursor(args.width / 2, args.height / 2)
            .map_err(|err| display_error("moving cursor", err))?;
        display
            .blank_display(true, true)
            .map_err(|err| display_error("blanking display", err))?;
        ivc.pump();

        info!(stride, "tearing the demo display down");
        provider
            .destroy_display(&display)
            .map_err(|err| display_error("destroying display", err))?;
        ivc.pump();
    }

    consumer.destroy_display(&backend);
    consumer.destroy();
    provider.destroy();
    ivc.pump();

    print_demo_events(&lock(&transcript), format);
    Ok(crate::exit::SUCCESS)
}
