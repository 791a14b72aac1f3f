//! Packet framing: header, footer, encode/decode, and the channel send
//! primitive.
//!
//! Wire format (little-endian, no padding):
//!
//! ```text
//! ┌─────────┬─────────┬──────────┬──────────┬──────────┐
//! │ 0xC0DE  │ 0x5AFE  │ type     │ length   │ reserved │  header, 16 B
//! │ (2B)    │ (2B)    │ (4B)     │ (4B)     │ (4B)     │
//! ├─────────┴─────────┴──────────┴──────────┴──────────┤
//! │ payload (length bytes)                             │
//! ├─────────┬──────────┬───────────────────────────────┤
//! │ crc (2B)│ rsvd (2B)│ rsvd (4B)                     │  footer, 8 B
//! └─────────┴──────────┴───────────────────────────────┘
//! ```
//!
//! The CRC covers the header concatenated with the payload. Total packet
//! size never exceeds [`MAX_PACKET_SIZE`].

use bytes::Buf;
use pvdisplay_ivc::IvcChannel;
use tracing::trace;

use crate::crc::crc16;
use crate::error::{Result, WireError};
use crate::types::PacketKind;

/// Header magic words.
pub const MAGIC1: u16 = 0xC0DE;
pub const MAGIC2: u16 = 0x5AFE;

/// Largest packet (header + payload + footer) the protocol allows.
pub const MAX_PACKET_SIZE: usize = 4096;

/// Largest payload a packet can carry.
pub const MAX_PAYLOAD_SIZE: usize = MAX_PACKET_SIZE - Header::SIZE - Footer::SIZE;

/// Packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub magic1: u16,
    pub magic2: u16,
    pub kind: u32,
    pub length: u32,
    pub reserved: u32,
}

impl Header {
    pub const SIZE: usize = 16;

    pub fn new(kind: PacketKind, length: u32) -> Self {
        Self {
            magic1: MAGIC1,
            magic2: MAGIC2,
            kind: kind.to_u32(),
            length,
            reserved: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..2].copy_from_slice(&self.magic1.to_le_bytes());
        buf[2..4].copy_from_slice(&self.magic2.to_le_bytes());
        buf[4..8].copy_from_slice(&self.kind.to_le_bytes());
        buf[8..12].copy_from_slice(&self.length.to_le_bytes());
        buf[12..16].copy_from_slice(&self.reserved.to_le_bytes());
        buf
    }

    /// Parse a header. Returns `None` if the buffer is too small.
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        let mut buf = buf;
        Some(Self {
            magic1: buf.get_u16_le(),
            magic2: buf.get_u16_le(),
            kind: buf.get_u32_le(),
            length: buf.get_u32_le(),
            reserved: buf.get_u32_le(),
        })
    }

    pub fn magics_valid(&self) -> bool {
        self.magic1 == MAGIC1 && self.magic2 == MAGIC2
    }

    pub fn kind(&self) -> PacketKind {
        PacketKind::from_u32(self.kind)
    }
}

/// Packet footer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    pub crc: u16,
    pub reserved_halfword: u16,
    pub reserved_word: u32,
}

impl Footer {
    pub const SIZE: usize = 8;

    pub fn new(crc: u16) -> Self {
        Self {
            crc,
            reserved_halfword: 0,
            reserved_word: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..2].copy_from_slice(&self.crc.to_le_bytes());
        buf[2..4].copy_from_slice(&self.reserved_halfword.to_le_bytes());
        buf[4..8].copy_from_slice(&self.reserved_word.to_le_bytes());
        buf
    }

    /// Parse a footer. Returns `None` if the buffer is too small.
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        let mut buf = buf;
        Some(Self {
            crc: buf.get_u16_le(),
            reserved_halfword: buf.get_u16_le(),
            reserved_word: buf.get_u32_le(),
        })
    }
}

/// Compute the CRC of a header/payload pair, exactly as the footer
/// carries it.
pub fn packet_crc(header: &Header, payload: &[u8]) -> u16 {
    crc16(&[&header.to_bytes(), payload])
}

/// Encode a complete packet: header, payload, CRC footer.
pub fn encode_packet(kind: PacketKind, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(WireError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD_SIZE,
        });
    }

    let total = Header::SIZE + payload.len() + Footer::SIZE;
    let mut buf = Vec::new();
    buf.try_reserve_exact(total)
        .map_err(|_| WireError::OutOfMemory)?;

    let header = Header::new(kind, payload.len() as u32);
    buf.extend_from_slice(&header.to_bytes());
    buf.extend_from_slice(payload);
    let crc = crc16(&[&buf]);
    buf.extend_from_slice(&Footer::new(crc).to_bytes());
    Ok(buf)
}

/// Decode a complete packet, validating magics, size, and CRC.
///
/// Returns the header and a slice of the payload.
pub fn decode_packet(packet: &[u8]) -> Result<(Header, &[u8])> {
    let header = Header::from_bytes(packet).ok_or(WireError::Truncated {
        needed: Header::SIZE,
        len: packet.len(),
    })?;
    if !header.magics_valid() {
        return Err(WireError::InvalidMagic {
            magic1: header.magic1,
            magic2: header.magic2,
        });
    }

    let length = header.length as usize;
    if length > MAX_PAYLOAD_SIZE {
        return Err(WireError::PayloadTooLarge {
            size: length,
            max: MAX_PAYLOAD_SIZE,
        });
    }

    let total = Header::SIZE + length + Footer::SIZE;
    if packet.len() < total {
        return Err(WireError::Truncated {
            needed: total,
            len: packet.len(),
        });
    }

    let payload = &packet[Header::SIZE..Header::SIZE + length];
    let footer = Footer::from_bytes(&packet[Header::SIZE + length..]).ok_or(
        WireError::Truncated {
            needed: total,
            len: packet.len(),
        },
    )?;

    let computed = packet_crc(&header, payload);
    if computed != footer.crc {
        return Err(WireError::CrcMismatch {
            found: footer.crc,
            computed,
        });
    }
    Ok((header, payload))
}

/// Encode and transmit one packet over an IVC channel.
///
/// The write is all-or-nothing: the channel's free space is checked
/// first, and [`WireError::NoSpace`] is returned when the ring cannot
/// hold the whole packet. After a successful write the remote is
/// notified **twice**: the transport coalesces interrupts, and the
/// second notify is required for bit-compatible behavior with existing
/// peers.
pub fn send_packet(channel: &dyn IvcChannel, kind: PacketKind, payload: &[u8]) -> Result<()> {
    if !channel.is_open() {
        return Err(WireError::Closed);
    }

    let packet = encode_packet(kind, payload)?;
    let available = channel.available_space()?;
    if available < packet.len() {
        return Err(WireError::NoSpace {
            needed: packet.len(),
            available,
        });
    }

    trace!(
        kind = kind.name(),
        len = payload.len(),
        "sending packet"
    );
    channel.send(&packet)?;
    channel.notify_remote();
    channel.notify_remote();
    Ok(())
}
