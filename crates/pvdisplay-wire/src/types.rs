//! Packet type numbering and protocol constants.
//!
//! Packet types are partitioned into two disjoint numeric ranges: control
//! channel types live in 0..100, event channel types in 100..200.

/// Protocol interface version (0xMMNNPPPP, major.minor.patch).
pub const PROTOCOL_VERSION: u32 = 0x0000_0001;

/// Driver capability flag: linear framebuffer.
pub const CAP_LFB: u32 = 1 << 0;
/// Driver capability flag: hardware cursor.
pub const CAP_HW_CURSOR: u32 = 1 << 1;
/// Driver capability flag: online resolution resizing.
pub const CAP_RESIZE: u32 = 1 << 2;
/// Driver capability flag: survives display-handler disconnects.
pub const CAP_RECONNECT: u32 = 1 << 3;
/// Driver capability flag: display hot plugging.
pub const CAP_HOTPLUG: u32 = 1 << 4;
/// Driver capability flag: display blanking messages.
pub const CAP_BLANKING: u32 = 1 << 5;

/// Hardware cursor image width in pixels.
pub const CURSOR_WIDTH: u32 = 64;
/// Hardware cursor image height in pixels.
pub const CURSOR_HEIGHT: u32 = 64;
/// Hardware cursor image stride in bytes (64 ARGB pixels).
pub const CURSOR_STRIDE: usize = 64 * 4;
/// Total hardware cursor image size in bytes.
pub const CURSOR_IMAGE_SIZE: usize = CURSOR_STRIDE * CURSOR_HEIGHT as usize;

/// `UpdateCursor::show` value: hide the cursor.
pub const CURSOR_HIDE: u32 = 0;
/// `UpdateCursor::show` value: show the cursor.
pub const CURSOR_SHOW: u32 = 1;

/// A packet's type field, preserving unknown values for
/// forward-compatible logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    // Control channel (0..100).
    DriverCapabilities,
    HostDisplayList,
    AdvertisedDisplayList,
    AddDisplay,
    RemoveDisplay,
    DisplayNoLongerAvailable,
    TextMode,
    // Event channel (100..200).
    SetDisplay,
    UpdateCursor,
    MoveCursor,
    BlankDisplay,
    Unknown(u32),
}

impl PacketKind {
    pub fn from_u32(raw: u32) -> Self {
        match raw {
            1 => Self::DriverCapabilities,
            2 => Self::HostDisplayList,
            3 => Self::AdvertisedDisplayList,
            4 => Self::AddDisplay,
            5 => Self::RemoveDisplay,
            6 => Self::DisplayNoLongerAvailable,
            7 => Self::TextMode,
            101 => Self::SetDisplay,
            102 => Self::UpdateCursor,
            103 => Self::MoveCursor,
            104 => Self::BlankDisplay,
            other => Self::Unknown(other),
        }
    }

    pub fn to_u32(self) -> u32 {
        match self {
            Self::DriverCapabilities => 1,
            Self::HostDisplayList => 2,
            Self::AdvertisedDisplayList => 3,
            Self::AddDisplay => 4,
            Self::RemoveDisplay => 5,
            Self::DisplayNoLongerAvailable => 6,
            Self::TextMode => 7,
            Self::SetDisplay => 101,
            Self::UpdateCursor => 102,
            Self::MoveCursor => 103,
            Self::BlankDisplay => 104,
            Self::Unknown(raw) => raw,
        }
    }

    /// True iff the type belongs to the control channel range.
    pub fn is_control(self) -> bool {
        self.to_u32() < 100
    }

    /// True iff the type belongs to the event channel range.
    pub fn is_event(self) -> bool {
        (100..200).contains(&self.to_u32())
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::DriverCapabilities => "DRIVER_CAPABILITIES",
            Self::HostDisplayList => "HOST_DISPLAY_LIST",
            Self::AdvertisedDisplayList => "ADVERTISED_DISPLAY_LIST",
            Self::AddDisplay => "ADD_DISPLAY",
            Self::RemoveDisplay => "REMOVE_DISPLAY",
            Self::DisplayNoLongerAvailable => "DISPLAY_NO_LONGER_AVAILABLE",
            Self::TextMode => "TEXT_MODE",
            Self::SetDisplay => "SET_DISPLAY",
            Self::UpdateCursor => "UPDATE_CURSOR",
            Self::MoveCursor => "MOVE_CURSOR",
            Self::BlankDisplay => "BLANK_DISPLAY",
            Self::Unknown(_) => "UNKNOWN",
        }
    }
}

/// Why a display is being blanked or unblanked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlankingReason {
    DpmsSleep,
    DpmsWake,
    FillEnable,
    FillDisable,
}

impl BlankingReason {
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::DpmsSleep),
            1 => Some(Self::DpmsWake),
            2 => Some(Self::FillEnable),
            3 => Some(Self::FillDisable),
            _ => None,
        }
    }

    pub fn to_u32(self) -> u32 {
        match self {
            Self::DpmsSleep => 0,
            Self::DpmsWake => 1,
            Self::FillEnable => 2,
            Self::FillDisable => 3,
        }
    }
}
