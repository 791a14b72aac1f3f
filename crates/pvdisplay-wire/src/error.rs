use pvdisplay_ivc::IvcError;

/// Errors that can occur while encoding, decoding, or sending packets.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The packet header does not carry the 0xC0DE/0x5AFE magics.
    #[error("invalid packet magic ({magic1:#06x}, {magic2:#06x})")]
    InvalidMagic { magic1: u16, magic2: u16 },

    /// The payload does not fit inside the maximum packet size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The footer CRC does not match the checksum of header and payload.
    #[error("crc mismatch (packet {found:#06x}, computed {computed:#06x})")]
    CrcMismatch { found: u16, computed: u16 },

    /// The buffer ended before a complete structure could be decoded.
    #[error("truncated message ({len} bytes, {needed} needed)")]
    Truncated { needed: usize, len: usize },

    /// Could not allocate a packet buffer.
    #[error("out of memory")]
    OutOfMemory,

    /// The send ring cannot hold the whole packet right now.
    #[error("no ring space for packet ({needed} bytes needed, {available} free)")]
    NoSpace { needed: usize, available: usize },

    /// The channel is not open.
    #[error("channel closed")]
    Closed,

    /// The transport refused an operation.
    #[error("transport error: {0}")]
    Transport(#[from] IvcError),
}

pub type Result<T> = std::result::Result<T, WireError>;
