//! Per-channel partial-read state machine.
//!
//! Control and event channels deliver "data available" callbacks that
//! may describe any fraction of a packet. The receiver keeps exactly one
//! piece of state, the header of the packet currently in flight, and
//! makes progress in two phases: adopt a header once sixteen bytes are
//! buffered, then wait until the full payload and footer are buffered
//! before reading, checksumming, and dispatching in one step.

use pvdisplay_ivc::{IvcChannel, IvcError};
use pvdisplay_wire::{packet_crc, Footer, Header, MAX_PAYLOAD_SIZE};
use tracing::{debug, warn};

/// Unrecoverable receive-path failures.
///
/// Each of these poisons the channel: the caller must trigger its
/// aggregate's fatal handler and stop using the connection.
#[derive(Debug)]
pub(crate) enum ReceiveFatal {
    /// The transport could not report its buffered byte count.
    QueryFailed(IvcError),
    /// The header magics are wrong; the stream cannot be re-synchronized.
    BadMagic { magic1: u16, magic2: u16 },
    /// The header claims a payload larger than a packet can carry.
    OversizeLength(u32),
    /// The footer checksum does not match the received bytes.
    CrcMismatch { found: u16, computed: u16 },
}

/// Receive state for one packet channel.
///
/// `header == None` means no packet receive is in progress; otherwise
/// the next bytes on the channel belong to that header's payload and
/// footer. Callers must hold their channel's receive lock across
/// [`pump`], which also serializes dispatch per channel.
///
/// [`pump`]: PacketReceiver::pump
#[derive(Default)]
pub(crate) struct PacketReceiver {
    header: Option<Header>,
}

impl PacketReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    /// True iff a header has been adopted but its payload is pending.
    #[cfg(test)]
    pub fn mid_packet(&self) -> bool {
        self.header.is_some()
    }

    /// Drain as many complete packets as the channel holds.
    ///
    /// Returns `Ok(())` when the channel simply ran out of buffered
    /// data (the next data callback resumes where this one stopped) and
    /// `Err` on protocol corruption. Transient allocation failure is
    /// swallowed: the header slot stays populated and the bytes stay
    /// buffered in the transport, so the next callback retries.
    pub fn pump(
        &mut self,
        channel: &dyn IvcChannel,
        mut dispatch: impl FnMut(&Header, &[u8]),
    ) -> Result<(), ReceiveFatal> {
        loop {
            if self.header.is_none() {
                let mut raw = [0u8; Header::SIZE];
                match channel.recv(&mut raw) {
                    Ok(()) => {}
                    // Not enough bytes for a header yet; nothing was
                    // consumed. Wait for the next callback.
                    Err(IvcError::ShortRead { .. }) => return Ok(()),
                    Err(_) => return Ok(()),
                }
                let Some(header) = Header::from_bytes(&raw) else {
                    return Ok(());
                };
                if !header.magics_valid() {
                    return Err(ReceiveFatal::BadMagic {
                        magic1: header.magic1,
                        magic2: header.magic2,
                    });
                }
                if header.length as usize > MAX_PAYLOAD_SIZE {
                    return Err(ReceiveFatal::OversizeLength(header.length));
                }
                self.header = Some(header);
            }

            let Some(header) = self.header else {
                return Ok(());
            };
            let payload_len = header.length as usize;
            let needed = payload_len + Footer::SIZE;

            let available = channel
                .available_data()
                .map_err(ReceiveFatal::QueryFailed)?;
            if available < needed {
                return Ok(());
            }

            let mut buf: Vec<u8> = Vec::new();
            if buf.try_reserve_exact(needed).is_err() {
                warn!(needed, "no memory for receive buffer, will retry on next event");
                return Ok(());
            }
            buf.resize(needed, 0);

            if channel.recv(&mut buf).is_err() {
                // The transport claimed the bytes were there; someone
                // else must have read them. Give up on this event.
                warn!("transport reported {needed} buffered bytes but the read came up short");
                return Ok(());
            }

            let payload = &buf[..payload_len];
            let Some(footer) = Footer::from_bytes(&buf[payload_len..]) else {
                return Ok(());
            };
            let computed = packet_crc(&header, payload);
            if computed != footer.crc {
                self.header = None;
                return Err(ReceiveFatal::CrcMismatch {
                    found: footer.crc,
                    computed,
                });
            }

            self.header = None;
            debug!(kind = header.kind().name(), len = payload_len, "packet received");
            dispatch(&header, payload);
        }
    }
}
