//! Display Handler wire format.
//!
//! Control and event channels carry packets framed as header + payload +
//! footer, where the footer holds a CRC-16 over header and payload. The
//! dirty-rectangle channel is the one exception: raw 16-byte records
//! with no framing at all. This crate owns the framing, the checksum,
//! and the typed message structures; it knows nothing about displays.

pub mod crc;
pub mod error;
pub mod messages;
pub mod packet;
pub mod types;

pub use crc::{crc16, crc16_blob};
pub use error::{Result, WireError};
pub use messages::{
    AddDisplayRequest, AdvertisedDisplayList, Blanking, DirtyRect, DisplayInfo,
    DisplayNoLongerAvailable, DriverCapabilities, HostDisplayList, MoveCursor, RemoveDisplay,
    SetDisplay, TextMode, UpdateCursor, MAX_DISPLAYS_PER_LIST,
};
pub use packet::{
    decode_packet, encode_packet, packet_crc, send_packet, Footer, Header, MAGIC1, MAGIC2,
    MAX_PACKET_SIZE, MAX_PAYLOAD_SIZE,
};
pub use types::{
    BlankingReason, PacketKind, CAP_BLANKING, CAP_HOTPLUG, CAP_HW_CURSOR, CAP_LFB, CAP_RECONNECT,
    CAP_RESIZE, CURSOR_HEIGHT, CURSOR_HIDE, CURSOR_IMAGE_SIZE, CURSOR_SHOW, CURSOR_STRIDE,
    CURSOR_WIDTH, PROTOCOL_VERSION,
};
