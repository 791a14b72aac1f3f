//! Typed protocol messages.
//!
//! Every message is a fixed-layout little-endian structure; the two list
//! messages carry a 32-bit entry count followed by packed
//! [`DisplayInfo`] records. `to_bytes` produces exactly the payload the
//! packet framing wraps, `from_bytes` validates the length before
//! decoding.

use bytes::{Buf, BufMut};

use crate::error::{Result, WireError};
use crate::packet::{Footer, Header, MAX_PAYLOAD_SIZE};
use crate::types::{BlankingReason, PacketKind};

fn check_len(buf: &[u8], needed: usize) -> Result<()> {
    if buf.len() < needed {
        return Err(WireError::Truncated {
            needed,
            len: buf.len(),
        });
    }
    Ok(())
}

/// Driver capability advertisement, the first packet on a fresh control
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverCapabilities {
    pub max_displays: u32,
    pub version: u32,
    pub flags: u32,
    pub reserved: u32,
}

impl DriverCapabilities {
    pub const SIZE: usize = 16;
    pub const KIND: PacketKind = PacketKind::DriverCapabilities;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.put_u32_le(self.max_displays);
        buf.put_u32_le(self.version);
        buf.put_u32_le(self.flags);
        buf.put_u32_le(self.reserved);
        buf
    }

    pub fn from_bytes(mut buf: &[u8]) -> Result<Self> {
        check_len(buf, Self::SIZE)?;
        Ok(Self {
            max_displays: buf.get_u32_le(),
            version: buf.get_u32_le(),
            flags: buf.get_u32_le(),
            reserved: buf.get_u32_le(),
        })
    }
}

/// One host physical display.
///
/// `key` uniquely identifies the display for the lifetime of the
/// connection; `x` and `y` are reserved by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DisplayInfo {
    pub key: u32,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub reserved: u32,
}

impl DisplayInfo {
    pub const SIZE: usize = 24;

    fn put(&self, buf: &mut Vec<u8>) {
        buf.put_u32_le(self.key);
        buf.put_u32_le(self.x);
        buf.put_u32_le(self.y);
        buf.put_u32_le(self.width);
        buf.put_u32_le(self.height);
        buf.put_u32_le(self.reserved);
    }

    fn get(buf: &mut &[u8]) -> Self {
        Self {
            key: buf.get_u32_le(),
            x: buf.get_u32_le(),
            y: buf.get_u32_le(),
            width: buf.get_u32_le(),
            height: buf.get_u32_le(),
            reserved: buf.get_u32_le(),
        }
    }
}

/// Largest display count that fits in one packet.
pub const MAX_DISPLAYS_PER_LIST: usize = (MAX_PAYLOAD_SIZE - 4) / DisplayInfo::SIZE;

fn encode_display_list(displays: &[DisplayInfo]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + displays.len() * DisplayInfo::SIZE);
    buf.put_u32_le(displays.len() as u32);
    for display in displays {
        display.put(&mut buf);
    }
    buf
}

fn decode_display_list(mut buf: &[u8]) -> Result<Vec<DisplayInfo>> {
    check_len(buf, 4)?;
    let count = buf.get_u32_le() as usize;
    check_len(buf, count.saturating_mul(DisplayInfo::SIZE))?;
    let mut displays = Vec::with_capacity(count);
    for _ in 0..count {
        displays.push(DisplayInfo::get(&mut buf));
    }
    Ok(displays)
}

/// The host's current physical display list (consumer → provider).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostDisplayList {
    pub displays: Vec<DisplayInfo>,
}

impl HostDisplayList {
    pub const KIND: PacketKind = PacketKind::HostDisplayList;

    pub fn to_bytes(&self) -> Vec<u8> {
        encode_display_list(&self.displays)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        Ok(Self {
            displays: decode_display_list(buf)?,
        })
    }
}

/// The displays the guest driver intends to drive (provider → consumer).
///
/// Only the `key` field of each entry is meaningful to the host; geometry
/// travels later via [`SetDisplay`] on each display's event channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisedDisplayList {
    pub displays: Vec<DisplayInfo>,
}

impl AdvertisedDisplayList {
    pub const KIND: PacketKind = PacketKind::AdvertisedDisplayList;

    pub fn to_bytes(&self) -> Vec<u8> {
        encode_display_list(&self.displays)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        Ok(Self {
            displays: decode_display_list(buf)?,
        })
    }
}

/// Host request to bring up a display, carrying the four channel ports
/// (consumer → provider). A zero port means the channel is not offered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddDisplayRequest {
    pub key: u32,
    pub event_port: u32,
    pub framebuffer_port: u32,
    pub dirty_rectangles_port: u32,
    pub cursor_bitmap_port: u32,
}

impl AddDisplayRequest {
    pub const SIZE: usize = 20;
    pub const KIND: PacketKind = PacketKind::AddDisplay;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.put_u32_le(self.key);
        buf.put_u32_le(self.event_port);
        buf.put_u32_le(self.framebuffer_port);
        buf.put_u32_le(self.dirty_rectangles_port);
        buf.put_u32_le(self.cursor_bitmap_port);
        buf
    }

    pub fn from_bytes(mut buf: &[u8]) -> Result<Self> {
        check_len(buf, Self::SIZE)?;
        Ok(Self {
            key: buf.get_u32_le(),
            event_port: buf.get_u32_le(),
            framebuffer_port: buf.get_u32_le(),
            dirty_rectangles_port: buf.get_u32_le(),
            cursor_bitmap_port: buf.get_u32_le(),
        })
    }
}

macro_rules! key_only_message {
    ($(#[$doc:meta])* $name:ident, $kind:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name {
            pub key: u32,
        }

        impl $name {
            pub const SIZE: usize = 4;
            pub const KIND: PacketKind = $kind;

            pub fn to_bytes(&self) -> Vec<u8> {
                self.key.to_le_bytes().to_vec()
            }

            pub fn from_bytes(mut buf: &[u8]) -> Result<Self> {
                check_len(buf, Self::SIZE)?;
                Ok(Self {
                    key: buf.get_u32_le(),
                })
            }
        }
    };
}

key_only_message!(
    /// Host notice that a physical display went away (consumer → provider).
    RemoveDisplay,
    PacketKind::RemoveDisplay
);
key_only_message!(
    /// Guest notice that it is tearing a display down (provider → consumer).
    DisplayNoLongerAvailable,
    PacketKind::DisplayNoLongerAvailable
);

/// Text-mode toggle (provider → consumer). A non-zero mode forces the
/// host to render the emulator's framebuffer instead of the guest's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextMode {
    pub mode: u32,
}

impl TextMode {
    pub const SIZE: usize = 4;
    pub const KIND: PacketKind = PacketKind::TextMode;
    pub const DISABLED: u32 = 0;
    pub const ENABLED: u32 = 1;

    pub fn to_bytes(&self) -> Vec<u8> {
        self.mode.to_le_bytes().to_vec()
    }

    pub fn from_bytes(mut buf: &[u8]) -> Result<Self> {
        check_len(buf, Self::SIZE)?;
        Ok(Self {
            mode: buf.get_u32_le(),
        })
    }
}

/// Display geometry announcement (provider → consumer, event channel).
///
/// Required before a display is usable; `stride >= 4 * width` must hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetDisplay {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
}

impl SetDisplay {
    pub const SIZE: usize = 12;
    pub const KIND: PacketKind = PacketKind::SetDisplay;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.put_u32_le(self.width);
        buf.put_u32_le(self.height);
        buf.put_u32_le(self.stride);
        buf
    }

    pub fn from_bytes(mut buf: &[u8]) -> Result<Self> {
        check_len(buf, Self::SIZE)?;
        Ok(Self {
            width: buf.get_u32_le(),
            height: buf.get_u32_le(),
            stride: buf.get_u32_le(),
        })
    }
}

/// Cursor image/hotspot/visibility update (provider → consumer, event
/// channel). `show` is [`CURSOR_SHOW`] or [`CURSOR_HIDE`].
///
/// [`CURSOR_SHOW`]: crate::types::CURSOR_SHOW
/// [`CURSOR_HIDE`]: crate::types::CURSOR_HIDE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateCursor {
    pub xhot: u32,
    pub yhot: u32,
    pub show: u32,
}

impl UpdateCursor {
    pub const SIZE: usize = 12;
    pub const KIND: PacketKind = PacketKind::UpdateCursor;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.put_u32_le(self.xhot);
        buf.put_u32_le(self.yhot);
        buf.put_u32_le(self.show);
        buf
    }

    pub fn from_bytes(mut buf: &[u8]) -> Result<Self> {
        check_len(buf, Self::SIZE)?;
        Ok(Self {
            xhot: buf.get_u32_le(),
            yhot: buf.get_u32_le(),
            show: buf.get_u32_le(),
        })
    }
}

/// Cursor movement (provider → consumer, event channel).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveCursor {
    pub x: u32,
    pub y: u32,
}

impl MoveCursor {
    pub const SIZE: usize = 8;
    pub const KIND: PacketKind = PacketKind::MoveCursor;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.put_u32_le(self.x);
        buf.put_u32_le(self.y);
        buf
    }

    pub fn from_bytes(mut buf: &[u8]) -> Result<Self> {
        check_len(buf, Self::SIZE)?;
        Ok(Self {
            x: buf.get_u32_le(),
            y: buf.get_u32_le(),
        })
    }
}

/// Display blanking (provider → consumer, event channel).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Blanking {
    pub color: u32,
    pub reason: u32,
}

impl Blanking {
    pub const SIZE: usize = 8;
    pub const KIND: PacketKind = PacketKind::BlankDisplay;

    pub fn new(color: u32, reason: BlankingReason) -> Self {
        Self {
            color,
            reason: reason.to_u32(),
        }
    }

    pub fn reason(&self) -> Option<BlankingReason> {
        BlankingReason::from_u32(self.reason)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.put_u32_le(self.color);
        buf.put_u32_le(self.reason);
        buf
    }

    pub fn from_bytes(mut buf: &[u8]) -> Result<Self> {
        check_len(buf, Self::SIZE)?;
        Ok(Self {
            color: buf.get_u32_le(),
            reason: buf.get_u32_le(),
        })
    }
}

/// A dirty-rectangle record.
///
/// Unlike every other message, dirty rectangles travel raw: the dirty
/// channel carries back-to-back 16-byte records with neither header nor
/// footer, and its receiver always reads exactly 16 bytes at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtyRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl DirtyRect {
    pub const SIZE: usize = 16;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.x.to_le_bytes());
        buf[4..8].copy_from_slice(&self.y.to_le_bytes());
        buf[8..12].copy_from_slice(&self.width.to_le_bytes());
        buf[12..16].copy_from_slice(&self.height.to_le_bytes());
        buf
    }

    pub fn from_bytes(mut buf: &[u8]) -> Result<Self> {
        check_len(buf, Self::SIZE)?;
        Ok(Self {
            x: buf.get_u32_le(),
            y: buf.get_u32_le(),
            width: buf.get_u32_le(),
            height: buf.get_u32_le(),
        })
    }
}

// Keep the framing constants honest: a maximum-size display list must
// still fit in one packet.
const _: () = assert!(4 + MAX_DISPLAYS_PER_LIST * DisplayInfo::SIZE <= MAX_PAYLOAD_SIZE);
const _: () = assert!(Header::SIZE == 16 && Footer::SIZE == 8);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_capabilities_roundtrip() {
        let msg = DriverCapabilities {
            max_displays: 4,
            version: crate::types::PROTOCOL_VERSION,
            flags: crate::types::CAP_RESIZE | crate::types::CAP_HOTPLUG,
            reserved: 0,
        };
        let bytes = msg.to_bytes();
        assert_eq!(bytes.len(), DriverCapabilities::SIZE);
        assert_eq!(DriverCapabilities::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn display_list_roundtrip() {
        let msg = HostDisplayList {
            displays: vec![
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
            ],
        };
        let bytes = msg.to_bytes();
        assert_eq!(bytes.len(), 4 + 2 * DisplayInfo::SIZE);
        assert_eq!(HostDisplayList::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn empty_display_list_roundtrip() {
        let msg = AdvertisedDisplayList { displays: vec![] };
        let decoded = AdvertisedDisplayList::from_bytes(&msg.to_bytes()).unwrap();
        assert!(decoded.displays.is_empty());
    }

    #[test]
    fn display_list_count_is_validated() {
        let mut bytes = vec![];
        bytes.extend_from_slice(&5u32.to_le_bytes());
        bytes.extend_from_slice(&[0u8; DisplayInfo::SIZE]); // one entry, five claimed
        let err = HostDisplayList::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, WireError::Truncated { .. }));
    }

    #[test]
    fn add_display_roundtrip() {
        let msg = AddDisplayRequest {
            key: 1,
            event_port: 1100,
            framebuffer_port: 1101,
            dirty_rectangles_port: 1102,
            cursor_bitmap_port: 1103,
        };
        assert_eq!(AddDisplayRequest::from_bytes(&msg.to_bytes()).unwrap(), msg);
    }

    #[test]
    fn event_messages_roundtrip() {
        let set = SetDisplay {
            width: 1920,
            height: 1080,
            stride: 7680,
        };
        assert_eq!(SetDisplay::from_bytes(&set.to_bytes()).unwrap(), set);

        let cursor = UpdateCursor {
            xhot: 3,
            yhot: 5,
            show: crate::types::CURSOR_SHOW,
        };
        assert_eq!(UpdateCursor::from_bytes(&cursor.to_bytes()).unwrap(), cursor);

        let mv = MoveCursor { x: 640, y: 480 };
        assert_eq!(MoveCursor::from_bytes(&mv.to_bytes()).unwrap(), mv);

        let blank = Blanking::new(0, BlankingReason::DpmsSleep);
        let decoded = Blanking::from_bytes(&blank.to_bytes()).unwrap();
        assert_eq!(decoded, blank);
        assert_eq!(decoded.reason(), Some(BlankingReason::DpmsSleep));
    }

    #[test]
    fn key_only_messages_roundtrip() {
        let gone = DisplayNoLongerAvailable { key: 42 };
        assert_eq!(
            DisplayNoLongerAvailable::from_bytes(&gone.to_bytes()).unwrap(),
            gone
        );

        let removed = RemoveDisplay { key: 9 };
        assert_eq!(RemoveDisplay::from_bytes(&removed.to_bytes()).unwrap(), removed);
    }

    #[test]
    fn dirty_rect_is_sixteen_raw_bytes() {
        let rect = DirtyRect {
            x: 10,
            y: 20,
            width: 100,
            height: 50,
        };
        let bytes = rect.to_bytes();
        assert_eq!(bytes.len(), DirtyRect::SIZE);
        assert_eq!(&bytes[0..4], &10u32.to_le_bytes());
        assert_eq!(DirtyRect::from_bytes(&bytes).unwrap(), rect);
    }

    #[test]
    fn truncated_messages_rejected() {
        assert!(matches!(
            SetDisplay::from_bytes(&[0u8; 8]).unwrap_err(),
            WireError::Truncated { needed: 12, len: 8 }
        ));
        assert!(matches!(
            DriverCapabilities::from_bytes(&[]).unwrap_err(),
            WireError::Truncated { .. }
        ));
    }
}
