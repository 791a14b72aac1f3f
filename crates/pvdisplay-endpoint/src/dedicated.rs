//! Dedicated-display provider.
//!
//! A thin decorator over [`DisplayProvider`] for guests whose displays
//! are passed through wholesale: the host only needs to learn the size
//! and position of each dedicated display, so the surface shrinks to
//! advertising and error handling. The inner provider still runs the
//! full control channel underneath.

use std::sync::{Arc, Mutex};

use pvdisplay_ivc::{DomainId, Ivc, Port};
use pvdisplay_wire::DisplayInfo;

use crate::display::FatalHandler;
use crate::error::Result;
use crate::lock;
use crate::provider::DisplayProvider;

/// Provider decorator for dedicated (passed-through) displays.
#[derive(Clone)]
pub struct DedicatedProvider {
    core: DisplayProvider,
    fatal: Arc<Mutex<Option<FatalHandler>>>,
}

impl DedicatedProvider {
    /// Create the inner provider and chain its fatal path to ours.
    pub fn connect(ivc: Arc<dyn Ivc>, display_domain: DomainId, control_port: Port) -> Result<Self> {
        let core = DisplayProvider::connect(ivc, display_domain, control_port)?;
        let fatal: Arc<Mutex<Option<FatalHandler>>> = Arc::default();

        let slot = fatal.clone();
        core.on_fatal_error(move || {
            let handler = lock(&slot).take();
            if let Some(handler) = handler {
                handler();
            }
        });

        Ok(Self { core, fatal })
    }

    /// Advertise the dedicated displays' geometry to the host.
    pub fn advertise_displays(&self, displays: &[DisplayInfo]) -> Result<()> {
        self.core.advertise_displays(displays)
    }

    /// Register the one-shot fatal error handler.
    pub fn on_fatal_error(&self, handler: impl FnOnce() + Send + 'static) {
        *lock(&self.fatal) = Some(Box::new(handler));
    }

    /// Tear down the inner provider and its control connection.
    pub fn destroy(&self) {
        self.core.destroy();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use pvdisplay_ivc::{IvcChannel, LoopbackIvc, CONNECTION_ID_ANY};
    use pvdisplay_wire::{AdvertisedDisplayList, PacketKind};

    use crate::receiver::PacketReceiver;

    use super::*;

    #[test]
    fn advertises_through_the_core_provider() {
        let ivc = LoopbackIvc::new();
        let accepted: Arc<Mutex<Option<Arc<dyn IvcChannel>>>> = Arc::default();
        let slot = accepted.clone();
        ivc.listen(
            1000,
            1,
            CONNECTION_ID_ANY,
            Arc::new(move |channel| {
                *lock(&slot) = Some(channel);
            }),
        )
        .unwrap();

        let provider = DedicatedProvider::connect(ivc.clone(), 0, 1000).unwrap();
        ivc.pump();
        let host_side = lock(&accepted).clone().unwrap();

        provider
            .advertise_displays(&[DisplayInfo {
                key: 1,
                x: 0,
                y: 0,
                width: 2560,
                height: 1440,
                reserved: 0,
            }])
            .unwrap();

        let mut receiver = PacketReceiver::new();
        let mut seen = Vec::new();
        receiver
            .pump(host_side.as_ref(), |header, payload| {
                assert_eq!(header.kind(), PacketKind::AdvertisedDisplayList);
                seen.push(AdvertisedDisplayList::from_bytes(payload).unwrap());
            })
            .unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].displays[0].width, 2560);
    }

    #[test]
    fn fatal_errors_chain_to_the_outer_handler() {
        let ivc = LoopbackIvc::new();
        let accepted: Arc<Mutex<Option<Arc<dyn IvcChannel>>>> = Arc::default();
        let slot = accepted.clone();
        ivc.listen(
            1000,
            1,
            CONNECTION_ID_ANY,
            Arc::new(move |channel| {
                *lock(&slot) = Some(channel);
            }),
        )
        .unwrap();

        let provider = DedicatedProvider::connect(ivc.clone(), 0, 1000).unwrap();
        ivc.pump();

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        provider.on_fatal_error(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        lock(&accepted).clone().unwrap().disconnect();
        ivc.pump();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
