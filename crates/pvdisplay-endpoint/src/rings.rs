//! Ring sizing for the per-display channels.

use pvdisplay_ivc::PAGE_SIZE;
use pvdisplay_wire::CURSOR_IMAGE_SIZE;

/// Ring-page counts for the fixed-size channels.
///
/// The control ring only ever carries small packets; the event ring must
/// absorb bursts of cursor movement; the dirty-rectangle ring is sized
/// generously because the host may drain it lazily across world
/// switches. Framebuffer and cursor rings are computed from geometry
/// instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelRings {
    pub control_pages: usize,
    pub event_pages: usize,
    pub dirty_rect_pages: usize,
}

impl Default for ChannelRings {
    fn default() -> Self {
        Self {
            control_pages: 1,
            event_pages: 4,
            dirty_rect_pages: 32,
        }
    }
}

pub(crate) fn pages_for(bytes: usize) -> usize {
    bytes.div_ceil(PAGE_SIZE)
}

/// Pages for a framebuffer channel: the framebuffer itself plus one page
/// of transport connection metadata.
pub fn framebuffer_pages(framebuffer_size: usize) -> usize {
    pages_for(framebuffer_size) + 1
}

/// Pages for a cursor-image channel: the 64x64 ARGB image plus one page
/// of transport connection metadata.
pub fn cursor_pages() -> usize {
    pages_for(CURSOR_IMAGE_SIZE) + 1
}
